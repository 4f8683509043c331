//! Group-locked parameter server and its worker-side counterpart.
//!
//! The server owns the authoritative `(n, z)` statistics, partitioned into
//! fixed-size coordinate groups with one mutex each. Workers train against
//! private copies and reconcile group-at-a-time: a periodic `fetch` pulls
//! the authoritative values, a periodic `push` folds accumulated deltas in
//! and zeroes them. Between syncs workers happily run on stale state
//! (Hogwild!-style bounded staleness); a lock is held only long enough to
//! copy one group.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use snafu::{ResultExt, ensure};

use crate::error::{IoSnafu, NotInitializedSnafu, Result, ZeroFeaturesSnafu};
use crate::model::FtrlModel;
use crate::sample::Feature;
use crate::solver::{HyperParams, project_weight};
use crate::util::{float_greater, sigmoid};

/// Coordinates per lock group. Small groups keep contention low while a
/// fetch or push still amortizes the lock over a memcpy.
pub const PARAM_GROUP_SIZE: usize = 10;
pub const DEFAULT_PUSH_STEP: usize = 3;
pub const DEFAULT_FETCH_STEP: usize = 3;

pub(crate) fn group_count(feat_num: usize) -> usize {
    (feat_num + PARAM_GROUP_SIZE - 1) / PARAM_GROUP_SIZE
}

fn group_range(group: usize, feat_num: usize) -> (usize, usize) {
    let start = group * PARAM_GROUP_SIZE;
    let end = ((group + 1) * PARAM_GROUP_SIZE).min(feat_num);
    (start, end)
}

/// One group's slice of the authoritative statistics.
struct ParamShard {
    n: Vec<f64>,
    z: Vec<f64>,
}

pub struct FtrlParamServer {
    pub params: HyperParams,
    pub feat_num: usize,
    shards: Vec<Mutex<ParamShard>>,
    init: bool,
    rng: StdRng,
}

impl FtrlParamServer {
    pub fn new(params: &HyperParams, feat_num: usize, seed: u64) -> Result<Self> {
        params.validate()?;
        ensure!(feat_num >= 1, ZeroFeaturesSnafu);
        let shards = (0..group_count(feat_num))
            .map(|g| {
                let (start, end) = group_range(g, feat_num);
                Mutex::new(ParamShard {
                    n: vec![0.0; end - start],
                    z: vec![0.0; end - start],
                })
            })
            .collect();
        Ok(Self {
            params: *params,
            feat_num,
            shards,
            init: true,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Restore the authoritative state from a snapshot file.
    pub fn restore(path: &Path, seed: u64) -> Result<Self> {
        let text = fs::read_to_string(path).context(IoSnafu { path })?;
        Self::from_model(&FtrlModel::from_json(&text)?, seed)
    }

    pub fn from_model(model: &FtrlModel, seed: u64) -> Result<Self> {
        ensure!(
            model.n.len() == model.z.len()
                && (model.n.is_empty() || model.n.len() == model.feat_num),
            crate::error::InvalidParametersSnafu {
                reason: "model statistics do not match its dimensionality",
            }
        );
        let mut server = Self::new(&model.params(), model.feat_num, seed)?;
        server.init = model.init;
        if !model.n.is_empty() {
            for g in 0..server.shards.len() {
                let (start, end) = group_range(g, server.feat_num);
                let shard = server.shards[g].get_mut().unwrap();
                shard.n.copy_from_slice(&model.n[start..end]);
                shard.z.copy_from_slice(&model.z[start..end]);
            }
        }
        Ok(server)
    }

    pub fn group_num(&self) -> usize {
        self.shards.len()
    }

    /// Copy group `group` of the authoritative state into the caller's
    /// full-length buffers under the group lock.
    pub fn fetch_group(&self, n: &mut [f64], z: &mut [f64], group: usize) -> Result<()> {
        ensure!(self.init, NotInitializedSnafu);
        let (start, end) = group_range(group, self.feat_num);
        let shard = self.shards[group].lock().unwrap();
        n[start..end].copy_from_slice(&shard.n);
        z[start..end].copy_from_slice(&shard.z);
        Ok(())
    }

    pub fn fetch_all(&self, n: &mut [f64], z: &mut [f64]) -> Result<()> {
        for group in 0..self.shards.len() {
            self.fetch_group(n, z, group)?;
        }
        Ok(())
    }

    /// Fold the caller's deltas of group `group` into the authoritative
    /// state and zero them, atomically under the group lock.
    pub fn push_group(&self, dn: &mut [f64], dz: &mut [f64], group: usize) -> Result<()> {
        ensure!(self.init, NotInitializedSnafu);
        let (start, end) = group_range(group, self.feat_num);
        let mut shard = self.shards[group].lock().unwrap();
        for (j, i) in (start..end).enumerate() {
            shard.n[j] += dn[i];
            shard.z[j] += dz[i];
            dn[i] = 0.0;
            dz[i] = 0.0;
        }
        Ok(())
    }

    fn coordinate(&self, idx: usize) -> (f64, f64) {
        let shard = self.shards[idx / PARAM_GROUP_SIZE].lock().unwrap();
        let j = idx % PARAM_GROUP_SIZE;
        (shard.n[j], shard.z[j])
    }

    /// Read-only prediction against the current authoritative state,
    /// locking one group per touched coordinate.
    pub fn predict(&self, x: &[Feature]) -> f64 {
        if !self.init {
            return 0.0;
        }
        let wtx: f64 = x
            .iter()
            .filter(|f| f.index < self.feat_num)
            .map(|f| {
                let (n_i, z_i) = self.coordinate(f.index);
                project_weight(z_i, n_i, &self.params) * f.value
            })
            .sum();
        sigmoid(wtx)
    }

    /// Direct FTRL step on the authoritative state. Only used while the
    /// trainer holds the server exclusively (burn-in); group mutexes are
    /// uncontended then and accessed without locking.
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
            let shard = self.shards[item.index / PARAM_GROUP_SIZE].get_mut().unwrap();
            let j = item.index % PARAM_GROUP_SIZE;
            let w_i = project_weight(shard.z[j], shard.n[j], &self.params);
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
            let shard = self.shards[i / PARAM_GROUP_SIZE].get_mut().unwrap();
            let j = i % PARAM_GROUP_SIZE;
            let sigma = ((shard.n[j] + g_i * g_i).sqrt() - shard.n[j].sqrt()) / self.params.alpha;
            shard.z[j] += g_i - sigma * w_i;
            shard.n[j] += g_i * g_i;
        }

        pred
    }

    /// Gather the sharded statistics into contiguous vectors.
    pub(crate) fn gather(&self) -> (Vec<f64>, Vec<f64>) {
        let mut n = vec![0.0; self.feat_num];
        let mut z = vec![0.0; self.feat_num];
        for g in 0..self.shards.len() {
            let (start, end) = group_range(g, self.feat_num);
            let shard = self.shards[g].lock().unwrap();
            n[start..end].copy_from_slice(&shard.n);
            z[start..end].copy_from_slice(&shard.z);
        }
        (n, z)
    }

    pub fn snapshot(&self) -> Result<FtrlModel> {
        ensure!(self.init, NotInitializedSnafu);
        let (n, z) = self.gather();
        Ok(FtrlModel::full(&self.params, self.feat_num, &n, &z, self.init))
    }

    fn serving_model(&self) -> Result<FtrlModel> {
        ensure!(self.init, NotInitializedSnafu);
        let (n, z) = self.gather();
        let weights = (0..self.feat_num)
            .map(|i| (i, project_weight(z[i], n[i], &self.params)))
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

/// A worker's private view of the model plus the deltas it owes the server.
pub struct FtrlWorker {
    params: HyperParams,
    feat_num: usize,
    n: Vec<f64>,
    z: Vec<f64>,
    n_update: Vec<f64>,
    z_update: Vec<f64>,
    group_steps: Vec<usize>,
    push_step: usize,
    fetch_step: usize,
    rng: StdRng,
}

impl FtrlWorker {
    /// Warm-start a worker from the server's current state.
    pub fn new(
        server: &FtrlParamServer,
        push_step: usize,
        fetch_step: usize,
        seed: u64,
    ) -> Result<Self> {
        let feat_num = server.feat_num;
        let mut n = vec![0.0; feat_num];
        let mut z = vec![0.0; feat_num];
        server.fetch_all(&mut n, &mut z)?;
        Ok(Self {
            params: server.params,
            feat_num,
            n,
            z,
            n_update: vec![0.0; feat_num],
            z_update: vec![0.0; feat_num],
            group_steps: vec![0; group_count(feat_num)],
            push_step: push_step.max(1),
            fetch_step: fetch_step.max(1),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    #[cfg(test)]
    pub(crate) fn local_state(&self) -> (&[f64], &[f64], &[f64], &[f64]) {
        (&self.n, &self.z, &self.n_update, &self.z_update)
    }

    /// One FTRL step against the private state, mirrored into the pending
    /// deltas, with the per-group staleness protocol: on the touched
    /// group, fetch every `fetch_step` events, push every `push_step`
    /// events, then advance the group's step counter.
    pub fn update(&mut self, x: &[Feature], y: f64, server: &FtrlParamServer) -> f64 {
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
            let w_i = project_weight(self.z[item.index], self.n[item.index], &self.params);
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
            let group = i / PARAM_GROUP_SIZE;

            // The server outlives its workers and is always initialized,
            // so fetch and push cannot fail here.
            if self.group_steps[group] % self.fetch_step == 0 {
                let _ = server.fetch_group(&mut self.n, &mut self.z, group);
            }

            let g_i = gradients[k];
            let sigma = ((self.n[i] + g_i * g_i).sqrt() - self.n[i].sqrt()) / self.params.alpha;
            let dz = g_i - sigma * w_i;
            self.z[i] += dz;
            self.z_update[i] += dz;
            self.n[i] += g_i * g_i;
            self.n_update[i] += g_i * g_i;

            if self.group_steps[group] % self.push_step == 0 {
                let _ = server.push_group(&mut self.n_update, &mut self.z_update, group);
            }

            self.group_steps[group] += 1;
        }

        pred
    }

    /// Re-pull the full authoritative state and restart the step counters.
    /// Pending deltas survive a reset; only a push zeroes them.
    pub fn reset(&mut self, server: &FtrlParamServer) -> Result<()> {
        server.fetch_all(&mut self.n, &mut self.z)?;
        for step in &mut self.group_steps {
            *step = 0;
        }
        Ok(())
    }

    /// Unconditional final flush so no accumulated delta is lost.
    pub fn push_all(&mut self, server: &FtrlParamServer) -> Result<()> {
        for group in 0..self.group_steps.len() {
            server.push_group(&mut self.n_update, &mut self.z_update, group)?;
        }
        Ok(())
    }
}
