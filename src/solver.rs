//! Single-threaded FTRL-Proximal solver.
//!
//! The learner keeps two sufficient statistics per coordinate, `n` (sum of
//! squared gradients) and `z` (the FTRL dual state), and derives weights on
//! demand through the closed-form proximal projection of McMahan et al.

use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use crate::error::{InvalidParametersSnafu, IoSnafu, NotInitializedSnafu, Result, ZeroFeaturesSnafu};
use crate::model::FtrlModel;
use crate::sample::Feature;
use crate::util::{float_greater, float_less, sigmoid};

pub const DEFAULT_ALPHA: f64 = 0.15;
pub const DEFAULT_BETA: f64 = 1.0;
pub const DEFAULT_L1: f64 = 1.0;
pub const DEFAULT_L2: f64 = 1.0;
pub const DEFAULT_SEED: u64 = 42;

/// Hyperparameters of the proximal update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
    pub alpha: f64,
    pub beta: f64,
    pub l1: f64,
    pub l2: f64,
    pub dropout: f64,
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
            l1: DEFAULT_L1,
            l2: DEFAULT_L2,
            dropout: 0.0,
        }
    }
}

impl HyperParams {
    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(
            self.alpha > 0.0,
            InvalidParametersSnafu { reason: "alpha must be positive" }
        );
        ensure!(
            self.beta >= 0.0 && self.l1 >= 0.0 && self.l2 >= 0.0,
            InvalidParametersSnafu { reason: "beta, l1 and l2 must be non-negative" }
        );
        ensure!(
            (0.0..1.0).contains(&self.dropout),
            InvalidParametersSnafu { reason: "dropout must be in [0, 1)" }
        );
        Ok(())
    }
}

/// Closed-form proximal weight for one coordinate given its `(n, z)` state.
/// The L1 comparison is epsilon-tolerant.
pub(crate) fn project_weight(z_i: f64, n_i: f64, params: &HyperParams) -> f64 {
    let sign = if z_i < 0.0 { -1.0 } else { 1.0 };
    if float_less(sign * z_i, params.l1) {
        0.0
    } else {
        (sign * params.l1 - z_i) / ((params.beta + n_i.sqrt()) / params.alpha + params.l2)
    }
}

pub struct FtrlSolver {
    pub params: HyperParams,
    pub feat_num: usize,
    pub n: Vec<f64>,
    pub z: Vec<f64>,
    pub init: bool,
    rng: StdRng,
}

impl Default for FtrlSolver {
    fn default() -> Self {
        Self {
            params: HyperParams::default(),
            feat_num: 0,
            n: Vec::new(),
            z: Vec::new(),
            init: false,
            rng: StdRng::seed_from_u64(DEFAULT_SEED),
        }
    }
}

impl FtrlSolver {
    pub fn new(params: &HyperParams, feat_num: usize, seed: u64) -> Result<Self> {
        params.validate()?;
        ensure!(feat_num >= 1, ZeroFeaturesSnafu);
        Ok(Self {
            params: *params,
            feat_num,
            n: vec![0.0; feat_num],
            z: vec![0.0; feat_num],
            init: true,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Restore a solver from a serialized snapshot file.
    pub fn restore(path: &Path, seed: u64) -> Result<Self> {
        let text = fs::read_to_string(path).context(IoSnafu { path })?;
        Self::from_model(&FtrlModel::from_json(&text)?, seed)
    }

    /// Rebuild solver state from a model artifact. A thin serving artifact
    /// restores zeroed statistics of the recorded dimensionality.
    pub fn from_model(model: &FtrlModel, seed: u64) -> Result<Self> {
        ensure!(
            model.n.len() == model.z.len()
                && (model.n.is_empty() || model.n.len() == model.feat_num),
            InvalidParametersSnafu {
                reason: "model statistics do not match its dimensionality",
            }
        );
        let feat_num = model.feat_num;
        let n = if model.n.is_empty() { vec![0.0; feat_num] } else { model.n.clone() };
        let z = if model.z.is_empty() { vec![0.0; feat_num] } else { model.z.clone() };
        Ok(Self {
            params: model.params(),
            feat_num,
            n,
            z,
            init: model.init,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Current weight of one coordinate; out-of-range indices weigh zero.
    pub fn weight(&self, idx: usize) -> f64 {
        if idx >= self.z.len() {
            return 0.0;
        }
        project_weight(self.z[idx], self.n[idx], &self.params)
    }

    pub fn predict(&self, x: &[Feature]) -> f64 {
        if !self.init {
            return 0.0;
        }
        let wtx: f64 = x.iter().map(|f| self.weight(f.index) * f.value).sum();
        sigmoid(wtx)
    }

    /// One FTRL step over a sample; returns the pre-update prediction.
    /// Returns the 0.0 sentinel when the solver was never initialized.
    pub fn update(&mut self, x: &[Feature], y: f64) -> f64 {
        if !self.init {
            return 0.0;
        }

        let mut weights: Vec<(usize, f64)> = Vec::with_capacity(x.len());
        let mut gradients: Vec<f64> = Vec::with_capacity(x.len());
        let mut wtx = 0.0;

        for item in x {
            if float_greater(self.params.dropout, 0.0)
                && self.rng.r#gen::<f64>() < self.params.dropout
            {
                continue;
            }
            if item.index >= self.feat_num {
                continue;
            }
            let w_i = self.weight(item.index);
            weights.push((item.index, w_i));
            gradients.push(item.value);
            wtx += w_i * item.value;
        }

        let pred = sigmoid(wtx);
        let grad = pred - y;
        for g in &mut gradients {
            *g *= grad;
        }

        for (k, &(i, w_i)) in weights.iter().enumerate() {
            let g_i = gradients[k];
            let sigma = ((self.n[i] + g_i * g_i).sqrt() - self.n[i].sqrt()) / self.params.alpha;
            self.z[i] += g_i - sigma * w_i;
            self.n[i] += g_i * g_i;
        }

        pred
    }

    /// Full snapshot for restart (statistics included).
    pub fn snapshot(&self) -> Result<FtrlModel> {
        ensure!(self.init, NotInitializedSnafu);
        Ok(FtrlModel::full(
            &self.params,
            self.feat_num,
            &self.n,
            &self.z,
            self.init,
        ))
    }

    /// Thin serving model: hyperparameters plus the non-zero weights,
    /// rounded to five decimals.
    pub fn serving_model(&self) -> Result<FtrlModel> {
        ensure!(self.init, NotInitializedSnafu);
        let weights = (0..self.feat_num)
            .map(|i| (i, self.weight(i)))
            .filter(|&(_, w)| w != 0.0)
            .map(|(i, w)| Feature::new(i, crate::util::round_to(w, 5)))
            .collect();
        Ok(FtrlModel::serving(&self.params, self.feat_num, weights, self.init))
    }

    pub fn save_model(&self, path: &Path) -> Result<()> {
        self.serving_model()?.save(path)
    }

    pub fn save_encoded(&self) -> Result<String> {
        self.serving_model()?.to_json()
    }
}
