//! Parsing of libsvm-style sample lines.
//!
//! A sample line is `label idx1:val1 idx2:val2 ...`. Lines carrying the
//! `|f` provenance marker have three header tokens before the features.
//! Every parsed vector starts with the bias feature `(0, 1.0)`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, ensure};

use crate::error::{
    DatasetFormatSnafu, EmptySampleSnafu, IoSnafu, Result, SampleFormatSnafu,
};

/// One coordinate of a sparse feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Feature {
    pub index: usize,
    pub value: f64,
}

impl Feature {
    pub fn new(index: usize, value: f64) -> Self {
        Self { index, value }
    }
}

/// Index 0 is reserved for the bias feature, prepended to every sample.
pub const BIAS_INDEX: usize = 0;

fn feature_start(line: &str, token_count: usize) -> usize {
    if line.contains("|f") {
        // three provenance tokens before the features
        3.min(token_count)
    } else {
        1
    }
}

/// Parse one line into `(label, features)`.
///
/// Negative labels collapse to 0. A malformed feature token is warned and
/// skipped; a missing or malformed label fails the whole line.
pub fn parse_sample(line: &str) -> Result<(f64, Vec<Feature>)> {
    let line = line.trim();
    ensure!(!line.is_empty(), EmptySampleSnafu);

    let tokens: Vec<&str> = line.split_whitespace().collect();
    ensure!(tokens.len() >= 2, SampleFormatSnafu { line });

    let mut label: f64 = tokens[0].parse().ok().context(SampleFormatSnafu { line })?;
    if label < 0.0 {
        label = 0.0;
    }

    let start = feature_start(line, tokens.len());
    let mut x = Vec::with_capacity(tokens.len() - start + 1);
    x.push(Feature::new(BIAS_INDEX, 1.0));

    for token in &tokens[start..] {
        let Some((idx, val)) = token.split_once(':') else {
            warn!("sample token is not index:value, skipped: {token}");
            continue;
        };
        let (Ok(index), Ok(value)) = (idx.parse::<usize>(), val.parse::<f64>()) else {
            warn!("unparsable sample token, skipped: {token}");
            continue;
        };
        x.push(Feature::new(index, value));
    }

    Ok((label, x))
}

/// Check a dataset file before training: every non-empty line must split
/// into at least two space-separated tokens, carry a label in {-1, 0, 1}
/// and `key:value`-shaped feature tokens. Returns the non-empty line count.
pub fn validate_file(path: &Path) -> Result<u64> {
    let file = File::open(path).context(IoSnafu { path })?;
    let reader = BufReader::new(file);

    let mut count: u64 = 0;
    for line in reader.lines() {
        let line = line.context(IoSnafu { path })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        count += 1;

        let tokens: Vec<&str> = line.split_whitespace().collect();
        ensure!(
            tokens.len() >= 2,
            DatasetFormatSnafu {
                path,
                line: count,
                reason: "fewer than two tokens (spliter must be space)",
            }
        );

        let label: f64 = tokens[0].parse().ok().context(DatasetFormatSnafu {
            path,
            line: count,
            reason: "label must be a number",
        })?;
        ensure!(
            label == -1.0 || label == 0.0 || label == 1.0,
            DatasetFormatSnafu {
                path,
                line: count,
                reason: "label must be -1, 0 or 1",
            }
        );

        let start = feature_start(line, tokens.len());
        for token in &tokens[start..] {
            ensure!(
                token.split(':').count() == 2,
                DatasetFormatSnafu {
                    path,
                    line: count,
                    reason: "feature token must be key:value",
                }
            );
        }
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::error::FtrlError;

    #[test]
    fn parses_plain_line_with_bias() {
        let (y, x) = parse_sample("1 3:0.5 7:0.25").unwrap();
        assert_eq!(y, 1.0);
        assert_eq!(
            x,
            vec![
                Feature::new(0, 1.0),
                Feature::new(3, 0.5),
                Feature::new(7, 0.25)
            ]
        );
    }

    #[test]
    fn negative_label_collapses_to_zero() {
        let (y, _) = parse_sample("-1 2:1").unwrap();
        assert_eq!(y, 0.0);
    }

    #[test]
    fn header_marker_skips_three_tokens() {
        let (y, x) = parse_sample("1 qid |f 4:2.0").unwrap();
        assert_eq!(y, 1.0);
        assert_eq!(x, vec![Feature::new(0, 1.0), Feature::new(4, 2.0)]);
    }

    #[test]
    fn header_only_line_yields_bias_vector() {
        let (y, x) = parse_sample("0 qid |f").unwrap();
        assert_eq!(y, 0.0);
        assert_eq!(x, vec![Feature::new(0, 1.0)]);
    }

    #[test]
    fn malformed_token_is_skipped_not_fatal() {
        let (_, x) = parse_sample("1 3:0.5 garbage 7:0.25 8:abc").unwrap();
        assert_eq!(
            x,
            vec![
                Feature::new(0, 1.0),
                Feature::new(3, 0.5),
                Feature::new(7, 0.25)
            ]
        );
    }

    #[test]
    fn short_or_empty_lines_fail() {
        assert!(matches!(parse_sample("  "), Err(FtrlError::EmptySample)));
        assert!(matches!(
            parse_sample("1"),
            Err(FtrlError::SampleFormat { .. })
        ));
        assert!(matches!(
            parse_sample("abc 3:0.5"),
            Err(FtrlError::SampleFormat { .. })
        ));
    }

    #[test]
    fn validate_counts_and_rejects_bad_labels() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.dat");
        let mut f = File::create(&good).unwrap();
        writeln!(f, "1 1:0.5 2:1").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "-1 3:2").unwrap();
        drop(f);
        assert_eq!(validate_file(&good).unwrap(), 2);

        let bad = dir.path().join("bad.dat");
        let mut f = File::create(&bad).unwrap();
        writeln!(f, "2 1:0.5").unwrap();
        drop(f);
        assert!(matches!(
            validate_file(&bad),
            Err(FtrlError::DatasetFormat { line: 1, .. })
        ));
    }
}
