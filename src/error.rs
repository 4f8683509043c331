use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FtrlError {
    #[snafu(display("empty sample line"))]
    EmptySample,
    #[snafu(display("sample format error: {line}"))]
    SampleFormat { line: String },
    #[snafu(display("dataset check failed at {}:{line}: {reason}", path.display()))]
    DatasetFormat {
        path: PathBuf,
        line: u64,
        reason: String,
    },
    #[snafu(display("invalid parameters: {reason}"))]
    InvalidParameters { reason: String },
    #[snafu(display("the number of features is zero"))]
    ZeroFeatures,
    #[snafu(display("solver used before initialize or restore"))]
    NotInitialized,
    #[snafu(display("{}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("model decode error: {source}"))]
    ModelDecode { source: serde_json::Error },
    #[snafu(display("model encode error: {source}"))]
    ModelEncode { source: serde_json::Error },
}

pub type Result<T, E = FtrlError> = std::result::Result<T, E>;
