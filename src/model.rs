//! Model artifacts.
//!
//! One JSON object serves two purposes: the full snapshot (hyperparameters
//! plus the `N`/`Z` statistics, for restarting training) and the thin
//! serving form (hyperparameters plus the derived sparse weights only).
//! Field names are fixed by the wire format consumed downstream.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{IoSnafu, ModelDecodeSnafu, ModelEncodeSnafu, Result};
use crate::sample::Feature;
use crate::solver::HyperParams;
use crate::util::sigmoid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtrlModel {
    #[serde(rename = "Alpha")]
    pub alpha: f64,
    #[serde(rename = "Beta")]
    pub beta: f64,
    #[serde(rename = "L1")]
    pub l1: f64,
    #[serde(rename = "L2")]
    pub l2: f64,
    #[serde(rename = "Featnum")]
    pub feat_num: usize,
    #[serde(rename = "Dropout")]
    pub dropout: f64,
    #[serde(rename = "N", default, skip_serializing_if = "Vec::is_empty")]
    pub n: Vec<f64>,
    #[serde(rename = "Z", default, skip_serializing_if = "Vec::is_empty")]
    pub z: Vec<f64>,
    #[serde(rename = "Weights", default)]
    pub weights: Vec<Feature>,
    #[serde(rename = "Init")]
    pub init: bool,
}

impl FtrlModel {
    pub(crate) fn full(
        params: &HyperParams,
        feat_num: usize,
        n: &[f64],
        z: &[f64],
        init: bool,
    ) -> Self {
        let mut model = Self::serving(params, feat_num, Vec::new(), init);
        model.n = n.to_vec();
        model.z = z.to_vec();
        model
    }

    pub(crate) fn serving(
        params: &HyperParams,
        feat_num: usize,
        weights: Vec<Feature>,
        init: bool,
    ) -> Self {
        Self {
            alpha: params.alpha,
            beta: params.beta,
            l1: params.l1,
            l2: params.l2,
            feat_num,
            dropout: params.dropout,
            n: Vec::new(),
            z: Vec::new(),
            weights,
            init,
        }
    }

    pub fn params(&self) -> HyperParams {
        HyperParams {
            alpha: self.alpha,
            beta: self.beta,
            l1: self.l1,
            l2: self.l2,
            dropout: self.dropout,
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context(ModelDecodeSnafu)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context(ModelEncodeSnafu)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).context(IoSnafu { path })?;
        Self::from_json(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?).context(IoSnafu { path })
    }
}

/// The serving-side logistic model: a sparse weight map derived from a
/// stored artifact. Missing coordinates weigh zero.
#[derive(Debug, Clone, Default)]
pub struct LrModel {
    weights: HashMap<usize, f64>,
    pub init: bool,
}

impl LrModel {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::from_model(&FtrlModel::load(path)?))
    }

    pub fn from_model(model: &FtrlModel) -> Self {
        let weights = model.weights.iter().map(|f| (f.index, f.value)).collect();
        Self { weights, init: true }
    }

    pub fn weight(&self, idx: usize) -> f64 {
        self.weights.get(&idx).copied().unwrap_or(0.0)
    }

    pub fn predict(&self, x: &[Feature]) -> f64 {
        if !self.init {
            return 0.0;
        }
        let wtx: f64 = x.iter().map(|f| self.weight(f.index) * f.value).sum();
        sigmoid(wtx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::FtrlSolver;

    #[test]
    fn wire_field_names_are_stable() {
        let params = HyperParams::default();
        let model = FtrlModel::full(&params, 2, &[0.0, 1.0], &[0.0, -2.0], true);
        let json = model.to_json().unwrap();
        for key in ["\"Alpha\"", "\"Beta\"", "\"L1\"", "\"L2\"", "\"Featnum\"",
            "\"Dropout\"", "\"N\"", "\"Z\"", "\"Weights\"", "\"Init\""]
        {
            assert!(json.contains(key), "missing {key} in {json}");
        }
    }

    #[test]
    fn thin_form_omits_statistics() {
        let params = HyperParams::default();
        let model = FtrlModel::serving(
            &params,
            3,
            vec![Feature::new(0, 0.5), Feature::new(2, -0.25)],
            true,
        );
        let json = model.to_json().unwrap();
        assert!(!json.contains("\"N\""));
        assert!(!json.contains("\"Z\""));

        let decoded = FtrlModel::from_json(&json).unwrap();
        assert!(decoded.n.is_empty());
        assert_eq!(decoded.weights.len(), 2);
    }

    #[test]
    fn serving_roundtrip_predicts_identically() {
        let params = HyperParams { l1: 0.01, ..HyperParams::default() };
        let mut solver = FtrlSolver::new(&params, 4, 42).unwrap();
        let pos = vec![Feature::new(0, 1.0), Feature::new(1, 1.0)];
        let neg = vec![Feature::new(0, 1.0), Feature::new(3, 1.0)];
        for _ in 0..100 {
            solver.update(&pos, 1.0);
            solver.update(&neg, 0.0);
        }

        let encoded = solver.save_encoded().unwrap();
        let lr = LrModel::from_model(&FtrlModel::from_json(&encoded).unwrap());
        for x in [&pos, &neg] {
            // weights are stored rounded to five decimals
            assert!((lr.predict(x) - solver.predict(x)).abs() < 1e-4);
        }
    }

    #[test]
    fn lr_model_ignores_unknown_indices() {
        let model = FtrlModel::serving(
            &HyperParams::default(),
            2,
            vec![Feature::new(0, 1.0)],
            true,
        );
        let lr = LrModel::from_model(&model);
        let bias_only = vec![Feature::new(0, 1.0)];
        let with_unknown = vec![Feature::new(0, 1.0), Feature::new(7, 3.0)];
        assert_eq!(lr.predict(&bias_only), lr.predict(&with_unknown));
    }

    #[test]
    fn uninitialized_lr_model_predicts_zero() {
        let lr = LrModel::default();
        assert_eq!(lr.predict(&[Feature::new(0, 1.0)]), 0.0);
    }
}
