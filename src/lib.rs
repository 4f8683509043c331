//! FTRL-Proximal logistic regression.
//!
//! A per-coordinate online learner for high-dimensional sparse
//! click-prediction problems, trained either single-threaded or through a
//! group-locked parameter server with Hogwild!-style bounded-staleness
//! workers. Models serialize to a JSON artifact consumed by the serving
//! [`LrModel`], and scoring reports log-loss, precision/recall/accuracy
//! and tied-rank AUC.

mod dataset;
mod error;
mod metrics;
mod model;
mod param_server;
mod sample;
mod solver;
mod trainer;
mod util;

pub use dataset::{DatasetReader, subsample_file};
pub use error::{FtrlError, Result};
pub use metrics::{ScoreReport, auc, log_loss, score_file, score_stream, tied_rank};
pub use model::{FtrlModel, LrModel};
pub use param_server::{
    DEFAULT_FETCH_STEP, DEFAULT_PUSH_STEP, FtrlParamServer, FtrlWorker, PARAM_GROUP_SIZE,
};
pub use sample::{BIAS_INDEX, Feature, parse_sample, validate_file};
pub use solver::{
    DEFAULT_ALPHA, DEFAULT_BETA, DEFAULT_L1, DEFAULT_L2, FtrlSolver, HyperParams,
};
pub use trainer::{
    FastFtrlTrainer, FtrlTrainer, TrainOptions, evaluate_file, evaluate_stream,
    read_problem_info,
};
pub use util::{MAX_SIGMOID, MIN_SIGMOID, sigmoid};
