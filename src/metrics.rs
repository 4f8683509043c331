//! Loss and evaluation metrics, plus the offline scoring path.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use itertools::izip;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{IoSnafu, Result};
use crate::model::LrModel;
use crate::sample::parse_sample;
use crate::util::{MAX_SIGMOID, MIN_SIGMOID, float_equal};

/// Logarithmic loss of one prediction, with the prediction clipped away
/// from 0 and 1 so the logarithm stays in domain.
pub fn log_loss(y: f64, pred: f64) -> f64 {
    let pred = pred.clamp(MIN_SIGMOID, MAX_SIGMOID);
    if y > 0.0 { -pred.ln() } else { -(1.0 - pred).ln() }
}

/// Ranks of the values sorted ascending, with runs of equal values
/// assigned the average of the ranks they cover (1-based).
pub fn tied_rank(x: &[f64]) -> Vec<f64> {
    if x.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<(f64, usize)> = x.iter().copied().zip(0..).collect();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut ranks = vec![0.0; x.len()];
    let mut cur_val = sorted[0].0;
    let mut last_rank = 0;
    for i in 0..sorted.len() {
        if cur_val != sorted[i].0 {
            cur_val = sorted[i].0;
            for s in &sorted[last_rank..i] {
                ranks[s.1] = (last_rank + 1 + i) as f64 / 2.0;
            }
            last_rank = i;
        }
        if i == sorted.len() - 1 {
            for s in &sorted[last_rank..=i] {
                ranks[s.1] = (last_rank + i + 2) as f64 / 2.0;
            }
        }
    }

    ranks
}

/// Mann-Whitney AUC over tied ranks. Degenerate inputs (no positives or
/// no negatives) yield 0; reporting-level flooring is the caller's call.
pub fn auc(labels: &[f64], scores: &[f64]) -> f64 {
    let ranks = tied_rank(scores);
    let num_positive = labels.iter().filter(|&&y| y == 1.0).count() as f64;
    let num_negative = labels.len() as f64 - num_positive;
    let sum_positive: f64 = izip!(labels, &ranks)
        .filter(|&(&y, _)| y == 1.0)
        .map(|(_, &r)| r)
        .sum();

    if num_negative * num_positive < 1e-5 {
        info!(
            "degenerate auc input: positives={num_positive} negatives={num_negative}"
        );
        return 0.0;
    }

    (sum_positive - num_positive * (num_positive + 1.0) / 2.0) / (num_negative * num_positive)
}

/// Aggregate scoring metrics over a held-out file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreReport {
    pub count: usize,
    pub positive_count: usize,
    pub true_positive: usize,
    pub true_negative: usize,
    pub log_loss: f64,
    pub precision: f64,
    pub recall: f64,
    pub accuracy: f64,
    pub auc: f64,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

/// Score a test file against a stored model: write one clipped prediction
/// per line to `output_file`, tally the confusion counts at `threshold`,
/// and summarize to `<output_file>.assess`.
///
/// The published AUC is floored at 0.5; the raw value comes from [`auc`].
pub fn score_file(
    model_file: &Path,
    test_file: &Path,
    output_file: &Path,
    threshold: f64,
    job_name: &str,
) -> Result<ScoreReport> {
    let model = LrModel::load(model_file)?;

    let input = File::open(test_file).context(IoSnafu { path: test_file })?;
    let mut output = BufWriter::new(
        File::create(output_file).context(IoSnafu { path: output_file })?,
    );

    let mut count = 0usize;
    let mut positive_count = 0usize;
    let mut true_positive = 0usize;
    let mut true_negative = 0usize;
    let mut loss = 0.0;
    let mut labels = Vec::new();
    let mut scores = Vec::new();

    for line in BufReader::new(input).lines() {
        let line = line.context(IoSnafu { path: test_file })?;
        if line.trim().is_empty() {
            continue;
        }
        let (y, x) = match parse_sample(&line) {
            Ok(sample) => sample,
            Err(err) => {
                warn!("skipping unscorable line: {err}");
                continue;
            }
        };

        let pred = model.predict(&x).clamp(MIN_SIGMOID, MAX_SIGMOID);
        writeln!(output, "{pred:.6}").context(IoSnafu { path: output_file })?;

        labels.push(y);
        scores.push(pred);

        count += 1;
        if float_equal(y, 1.0) {
            positive_count += 1;
        }
        let pred_label = if pred > threshold { 1.0 } else { 0.0 };
        if float_equal(pred_label, y) {
            if float_equal(y, 1.0) {
                true_positive += 1;
            } else {
                true_negative += 1;
            }
        }
        loss += log_loss(y, pred);
    }
    output.flush().context(IoSnafu { path: output_file })?;

    let raw_auc = auc(&labels, &scores);
    let published_auc = raw_auc.max(0.5);

    // predicted positives = count - actual negatives correctly rejected
    //                      - actual positives missed
    let predicted_positive = count - positive_count - true_negative + true_positive;
    let report = ScoreReport {
        count,
        positive_count,
        true_positive,
        true_negative,
        log_loss: if count > 0 { loss / count as f64 } else { 0.0 },
        precision: ratio(true_positive, predicted_positive),
        recall: ratio(true_positive, positive_count),
        accuracy: ratio(true_positive + true_negative, count),
        auc: published_auc,
    };

    if count > 0 {
        info!("[{job_name}] Log-likelihood = {:.6}", report.log_loss);
        info!(
            "[{job_name}] Precision = {:.2}% ({true_positive}/{predicted_positive})",
            report.precision * 100.0
        );
        info!(
            "[{job_name}] Recall = {:.2}% ({true_positive}/{positive_count})",
            report.recall * 100.0
        );
        info!(
            "[{job_name}] Accuracy = {:.2}% ({}/{count})",
            report.accuracy * 100.0,
            true_positive + true_negative
        );
        info!("[{job_name}] AUC = {:.6}", report.auc);
    }

    let assess_path = output_file.with_extension("assess");
    let assess = format!(
        " Log-likelihood = {:.6}\n Precision = {:.6} ({}/{})\n Recall = {:.6} ({}/{})\n Accuracy = {:.6} ({}/{})\n AUC = {:.6}\n",
        report.log_loss,
        report.precision,
        true_positive,
        predicted_positive,
        report.recall,
        true_positive,
        positive_count,
        report.accuracy,
        true_positive + true_negative,
        count,
        report.auc,
    );
    std::fs::write(&assess_path, assess).context(IoSnafu { path: &assess_path })?;

    Ok(report)
}

/// Score ad-hoc sample lines against a stored model; returns one clipped
/// prediction per scorable line.
pub fn score_stream(model_file: &Path, lines: &[String]) -> Result<Vec<f64>> {
    let model = LrModel::load(model_file)?;
    let mut predictions = Vec::with_capacity(lines.len());
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match parse_sample(line) {
            Ok((_, x)) => {
                predictions.push(model.predict(&x).clamp(MIN_SIGMOID, MAX_SIGMOID));
            }
            Err(err) => warn!("skipping unscorable line: {err}"),
        }
    }
    Ok(predictions)
}
