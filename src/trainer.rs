//! Training drivers.
//!
//! `FtrlTrainer` runs the plain single-threaded epoch loop. The parallel
//! `FastFtrlTrainer` owns a parameter server and a pool of worker solvers,
//! feeds them sharded sample streams, and reconciles them through the
//! bounded-staleness push/fetch protocol. `train_online` refreshes a
//! deployed model against a small in-memory minibatch through the same
//! engine.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use log::{info, warn};
use rayon::iter::{IntoParallelRefIterator, ParallelBridge, ParallelIterator};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use crate::dataset::DatasetReader;
use crate::error::{InvalidParametersSnafu, IoSnafu, Result, ZeroFeaturesSnafu};
use crate::metrics::log_loss;
use crate::model::FtrlModel;
use crate::param_server::{DEFAULT_FETCH_STEP, DEFAULT_PUSH_STEP, FtrlParamServer, FtrlWorker};
use crate::sample::{Feature, parse_sample};
use crate::solver::{DEFAULT_SEED, FtrlSolver, HyperParams};
use crate::util::{float_equal, float_greater};

/// Progress is logged every this many samples on worker 0.
const PROGRESS_EVERY: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainOptions {
    pub epochs: usize,
    /// Worker threads; 0 means one per available core.
    pub threads: usize,
    /// Cache the problem-info scan in a `<train_file>.cache` sidecar.
    pub cache_feature_num: bool,
    /// Fraction of epoch 0 trained single-threaded through the server
    /// before the workers start.
    pub burn_in: f64,
    pub push_step: usize,
    pub fetch_step: usize,
    pub seed: u64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 1,
            threads: 0,
            cache_feature_num: false,
            burn_in: 0.0,
            push_step: DEFAULT_PUSH_STEP,
            fetch_step: DEFAULT_FETCH_STEP,
            seed: DEFAULT_SEED,
        }
    }
}

fn cache_path(train_file: &Path) -> PathBuf {
    let mut os = train_file.as_os_str().to_owned();
    os.push(".cache");
    PathBuf::from(os)
}

fn read_cached_info(path: &Path) -> Result<(usize, usize)> {
    let file = File::open(path).context(IoSnafu { path })?;
    let mut line = String::new();
    BufReader::new(file)
        .read_line(&mut line)
        .context(IoSnafu { path })?;
    let mut parts = line.split_whitespace();
    let parse = |token: Option<&str>| -> Result<usize> {
        token
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| {
                InvalidParametersSnafu {
                    reason: "problem-info cache format error",
                }
                .build()
            })
    };
    let feat_num = parse(parts.next())?;
    let line_cnt = parse(parts.next())?;
    Ok((feat_num, line_cnt))
}

/// Scan the training file for its dimensionality (max feature index + 1)
/// and non-empty line count. With `read_cache` the result is memoized in a
/// sidecar file so repeat runs skip the scan.
pub fn read_problem_info(train_file: &Path, read_cache: bool) -> Result<(usize, usize)> {
    let cache = cache_path(train_file);
    let cache_existed = cache.exists();
    if read_cache && cache_existed {
        match read_cached_info(&cache) {
            Ok((feat_num, line_cnt)) => {
                info!("[read_problem_info] instances=[{line_cnt}] features=[{feat_num}] (cached)");
                return Ok((feat_num, line_cnt));
            }
            Err(err) => warn!("problem-info cache unreadable, rescanning: {err}"),
        }
    }

    let file = File::open(train_file).context(IoSnafu { path: train_file })?;
    let (feat_num, line_cnt) = BufReader::new(file)
        .lines()
        .par_bridge()
        .map(|line| -> Result<(usize, usize)> {
            let line = line.context(IoSnafu { path: train_file })?;
            let line = line.trim();
            if line.is_empty() {
                return Ok((0, 0));
            }
            match parse_sample(line) {
                Ok((_, x)) => Ok((x.iter().map(|f| f.index + 1).max().unwrap_or(0), 1)),
                Err(_) => Ok((0, 1)),
            }
        })
        .try_reduce(|| (0, 0), |a, b| Ok((a.0.max(b.0), a.1 + b.1)))?;

    ensure!(feat_num > 0, ZeroFeaturesSnafu);
    info!("[read_problem_info] instances=[{line_cnt}] features=[{feat_num}]");

    if read_cache && !cache_existed {
        if let Err(err) = fs::write(&cache, format!("{feat_num} {line_cnt}\n")) {
            warn!("could not write problem-info cache {}: {err}", cache.display());
        }
    }

    Ok((feat_num, line_cnt))
}

/// Mean log-loss of a predictor over a test file (parallel, read-only).
pub fn evaluate_file<F>(path: &Path, predict: F) -> Result<f64>
where
    F: Fn(&[Feature]) -> f64 + Sync,
{
    let file = File::open(path).context(IoSnafu { path })?;
    let (loss, count) = BufReader::new(file)
        .lines()
        .par_bridge()
        .map(|line| -> Result<(f64, usize)> {
            let line = line.context(IoSnafu { path })?;
            let line = line.trim();
            if line.is_empty() {
                return Ok((0.0, 0));
            }
            match parse_sample(line) {
                Ok((y, x)) => Ok((log_loss(y, predict(&x)), 1)),
                Err(_) => Ok((0.0, 0)),
            }
        })
        .try_reduce(|| (0.0, 0), |a, b| Ok((a.0 + b.0, a.1 + b.1)))?;
    Ok(if count > 0 { loss / count as f64 } else { 0.0 })
}

/// Mean log-loss of a predictor over in-memory sample lines.
pub fn evaluate_stream<F>(lines: &[String], predict: F) -> Result<f64>
where
    F: Fn(&[Feature]) -> f64 + Sync,
{
    let (loss, count) = lines
        .par_iter()
        .map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return (0.0, 0);
            }
            match parse_sample(line) {
                Ok((y, x)) => (log_loss(y, predict(&x)), 1),
                Err(_) => (0.0, 0),
            }
        })
        .reduce(|| (0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1));
    Ok(if count > 0 { loss / count as f64 } else { 0.0 })
}

fn log_params(job_name: &str, params: &HyperParams, epochs: usize) {
    info!(
        "[{job_name}] params={{alpha:{:.2}, beta:{:.2}, l1:{:.2}, l2:{:.2}, dropout:{:.2}, epoch:{epochs}}}",
        params.alpha, params.beta, params.l1, params.l2, params.dropout
    );
}

/// Plain single-threaded trainer.
pub struct FtrlTrainer {
    pub options: TrainOptions,
    pub job_name: String,
}

impl FtrlTrainer {
    pub fn new(options: TrainOptions) -> Self {
        Self {
            options,
            job_name: "ftrljob".to_string(),
        }
    }

    pub fn with_job_name(mut self, name: &str) -> Self {
        if !name.is_empty() {
            self.job_name = name.to_string();
        }
        self
    }

    pub fn train(
        &self,
        params: &HyperParams,
        model_file: &Path,
        train_file: &Path,
        test_file: Option<&Path>,
    ) -> Result<()> {
        let (feat_num, line_cnt) = read_problem_info(train_file, self.options.cache_feature_num)?;
        let solver = FtrlSolver::new(params, feat_num, self.options.seed)?;
        self.train_impl(solver, model_file, train_file, line_cnt, test_file)
    }

    pub fn train_restore(
        &self,
        last_model: &Path,
        model_file: &Path,
        train_file: &Path,
        test_file: Option<&Path>,
    ) -> Result<()> {
        let (_, line_cnt) = read_problem_info(train_file, self.options.cache_feature_num)?;
        let solver = FtrlSolver::restore(last_model, self.options.seed)?;
        self.train_impl(solver, model_file, train_file, line_cnt, test_file)
    }

    fn train_impl(
        &self,
        mut solver: FtrlSolver,
        model_file: &Path,
        train_file: &Path,
        line_cnt: usize,
        test_file: Option<&Path>,
    ) -> Result<()> {
        log_params(&self.job_name, &solver.params, self.options.epochs);

        let timer = Instant::now();
        let mut last_time = 0.0;
        for epoch in 0..self.options.epochs {
            let reader = DatasetReader::shared_file(train_file)?;
            let mut cur_cnt = 0usize;
            let mut last_cnt = 0usize;
            let mut loss = 0.0;

            while let Some((y, x)) = reader.next(0)? {
                let pred = solver.update(&x, y);
                loss += log_loss(y, pred);
                cur_cnt += 1;

                if cur_cnt - last_cnt > 100_000 && timer.elapsed().as_secs_f64() - last_time > 0.5 {
                    info!(
                        "[{}] epoch={epoch} processed=[{:.2}%] time=[{:.2}] train-loss=[{:.6}]",
                        self.job_name,
                        cur_cnt as f64 * 100.0 / line_cnt as f64,
                        timer.elapsed().as_secs_f64(),
                        loss / cur_cnt as f64
                    );
                    last_cnt = cur_cnt;
                    last_time = timer.elapsed().as_secs_f64();
                }
            }
            info!(
                "[{}] epoch={epoch} processed=[{:.2}%] time=[{:.2}] train-loss=[{:.6}]",
                self.job_name,
                cur_cnt as f64 * 100.0 / line_cnt as f64,
                timer.elapsed().as_secs_f64(),
                if cur_cnt > 0 { loss / cur_cnt as f64 } else { 0.0 }
            );

            if let Some(test) = test_file {
                let eval_loss = evaluate_file(test, |x| solver.predict(x))?;
                info!("[{}] validation-loss=[{:.6}]", self.job_name, eval_loss);
            }
        }

        solver.save_model(model_file)
    }
}

/// What to evaluate against at each epoch boundary.
#[derive(Clone, Copy)]
enum EvalData<'a> {
    None,
    File(&'a Path),
    Stream(&'a [String]),
}

/// Parallel parameter-server trainer.
pub struct FastFtrlTrainer {
    pub options: TrainOptions,
    pub job_name: String,
}

impl FastFtrlTrainer {
    pub fn new(options: TrainOptions) -> Self {
        Self {
            options,
            job_name: "fastftrljob".to_string(),
        }
    }

    pub fn with_job_name(mut self, name: &str) -> Self {
        if !name.is_empty() {
            self.job_name = name.to_string();
        }
        self
    }

    fn thread_count(&self) -> usize {
        if self.options.threads == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.options.threads
        }
    }

    pub fn train(
        &self,
        params: &HyperParams,
        model_file: &Path,
        train_file: &Path,
        test_file: Option<&Path>,
    ) -> Result<()> {
        let (feat_num, line_cnt) = read_problem_info(train_file, self.options.cache_feature_num)?;
        let mut server = FtrlParamServer::new(params, feat_num, self.options.seed)?;
        self.run_epochs(
            &mut server,
            line_cnt,
            || DatasetReader::split_file(train_file, self.thread_count()),
            test_file.map_or(EvalData::None, EvalData::File),
        )?;
        server.save_model(model_file)
    }

    pub fn train_restore(
        &self,
        last_model: &Path,
        model_file: &Path,
        train_file: &Path,
        test_file: Option<&Path>,
    ) -> Result<()> {
        let (_, line_cnt) = read_problem_info(train_file, self.options.cache_feature_num)?;
        let mut server = FtrlParamServer::restore(last_model, self.options.seed)?;
        self.run_epochs(
            &mut server,
            line_cnt,
            || DatasetReader::split_file(train_file, self.thread_count()),
            test_file.map_or(EvalData::None, EvalData::File),
        )?;
        server.save_model(model_file)
    }

    /// Refresh a deployed model against a small in-memory minibatch and
    /// return the re-encoded serving model.
    pub fn train_online(&self, encoded_model: &str, instances: &[String]) -> Result<String> {
        ensure!(
            !instances.is_empty(),
            InvalidParametersSnafu {
                reason: "no instances to retrain on",
            }
        );
        let line_cnt = instances.iter().filter(|l| !l.trim().is_empty()).count();
        let mut server =
            FtrlParamServer::from_model(&FtrlModel::from_json(encoded_model)?, self.options.seed)?;
        self.run_epochs(
            &mut server,
            line_cnt,
            || Ok(DatasetReader::memory(instances.to_vec(), self.thread_count())),
            EvalData::Stream(instances),
        )?;
        server.save_encoded()
    }

    fn run_epochs<F>(
        &self,
        server: &mut FtrlParamServer,
        line_cnt: usize,
        open_reader: F,
        eval: EvalData<'_>,
    ) -> Result<()>
    where
        F: Fn() -> Result<DatasetReader>,
    {
        let opts = &self.options;
        log_params(&self.job_name, &server.params, opts.epochs);

        let threads = self.thread_count();
        let mut workers = (0..threads)
            .map(|i| {
                FtrlWorker::new(
                    server,
                    opts.push_step,
                    opts.fetch_step,
                    opts.seed + 1 + i as u64,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let timer = Instant::now();
        for epoch in 0..opts.epochs {
            let reader = open_reader()?;

            if epoch == 0 && float_greater(opts.burn_in, 0.0) {
                let burn_cnt = (opts.burn_in * line_cnt as f64) as usize;
                let mut burn_loss = 0.0;
                let mut processed = 0usize;
                for i in 0..burn_cnt {
                    let Some((y, x)) = reader.next(0)? else { break };
                    let pred = server.update(&x, y);
                    burn_loss += log_loss(y, pred);
                    processed = i + 1;
                    if i % PROGRESS_EVERY == 0 {
                        info!(
                            "[{}] burn-in processed=[{:.2}%] time=[{:.2}] train-loss=[{:.6}]",
                            self.job_name,
                            processed as f64 * 100.0 / line_cnt as f64,
                            timer.elapsed().as_secs_f64(),
                            burn_loss / processed as f64
                        );
                    }
                }
                if processed > 0 {
                    info!(
                        "[{}] burn-in processed=[{:.2}%] time=[{:.2}] train-loss=[{:.6}]",
                        self.job_name,
                        processed as f64 * 100.0 / line_cnt as f64,
                        timer.elapsed().as_secs_f64(),
                        burn_loss / processed as f64
                    );
                }
                // a burn-in ratio of 1 consumes the whole epoch
                if float_equal(opts.burn_in, 1.0) {
                    continue;
                }
            }

            for worker in workers.iter_mut() {
                worker.reset(server)?;
            }

            let total = Mutex::new((0usize, 0.0f64));
            let mut statuses: Vec<Result<()>> = Vec::with_capacity(threads);
            thread::scope(|scope| {
                let mut handles = Vec::with_capacity(threads);
                for (shard, worker) in workers.iter_mut().enumerate() {
                    let reader = &reader;
                    let server = &*server;
                    let total = &total;
                    let job_name = &self.job_name;
                    handles.push(scope.spawn(move || -> Result<()> {
                        let mut local_count = 0usize;
                        let mut local_loss = 0.0;
                        loop {
                            let Some((y, x)) = reader.next(shard)? else { break };
                            let pred = worker.update(&x, y, server);
                            local_loss += log_loss(y, pred);
                            local_count += 1;

                            if shard == 0 && local_count % PROGRESS_EVERY == 0 {
                                let seen = (local_count * threads).min(line_cnt);
                                info!(
                                    "[{job_name}] epoch={epoch} processed=[{:.2}%] time=[{:.2}] train-loss=[{:.6}]",
                                    seen as f64 * 100.0 / line_cnt as f64,
                                    timer.elapsed().as_secs_f64(),
                                    local_loss / local_count as f64
                                );
                            }
                        }
                        {
                            let mut total = total.lock().unwrap();
                            total.0 += local_count;
                            total.1 += local_loss;
                        }
                        worker.push_all(server)
                    }));
                }
                statuses = handles
                    .into_iter()
                    .map(|h| h.join().expect("worker thread panicked"))
                    .collect();
            });
            // surface the first non-recoverable worker error
            statuses.into_iter().collect::<Result<Vec<()>>>()?;

            let (count, loss) = total.into_inner().unwrap();
            info!(
                "[{}] epoch={epoch} processed=[{:.2}%] time=[{:.2}] train-loss=[{:.6}]",
                self.job_name,
                count as f64 * 100.0 / line_cnt as f64,
                timer.elapsed().as_secs_f64(),
                if count > 0 { loss / count as f64 } else { 0.0 }
            );

            match eval {
                EvalData::None => {}
                EvalData::File(path) => {
                    let eval_loss = evaluate_file(path, |x| server.predict(x))?;
                    info!("[{}] validation-loss=[{:.6}]", self.job_name, eval_loss);
                }
                EvalData::Stream(lines) => {
                    let eval_loss = evaluate_stream(lines, |x| server.predict(x))?;
                    info!("[{}] validation-loss=[{:.6}]", self.job_name, eval_loss);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Once;

    use super::*;
    use crate::error::FtrlError;
    use crate::metrics::score_file;
    use crate::model::LrModel;
    use crate::sample::validate_file;

    static LOGGER: Once = Once::new();

    fn init_logger() {
        LOGGER.call_once(|| {
            fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!("[{}] {}", record.level(), message))
                })
                .level(log::LevelFilter::Info)
                .chain(std::io::stdout())
                .apply()
                .expect("logger init");
        });
    }

    fn write_separable(dir: &tempfile::TempDir, name: &str, rows: usize) -> PathBuf {
        // feature 1 fires on positives, feature 2 on negatives
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        for i in 0..rows {
            if i % 2 == 0 {
                writeln!(f, "1 1:1").unwrap();
            } else {
                writeln!(f, "0 2:1").unwrap();
            }
        }
        path
    }

    fn options(epochs: usize, threads: usize) -> TrainOptions {
        TrainOptions {
            epochs,
            threads,
            ..TrainOptions::default()
        }
    }

    fn sparse_params() -> HyperParams {
        HyperParams {
            alpha: 0.1,
            beta: 1.0,
            l1: 0.01,
            l2: 0.1,
            dropout: 0.0,
        }
    }

    #[test]
    fn problem_info_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.dat");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "1 3:0.5").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "0 7:1").unwrap();
        drop(f);

        assert_eq!(read_problem_info(&path, false).unwrap(), (8, 2));
    }

    #[test]
    fn problem_info_cache_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.dat");
        fs::write(&path, "1 3:0.5\n").unwrap();

        assert_eq!(read_problem_info(&path, true).unwrap(), (4, 1));
        assert!(cache_path(&path).exists());

        // the cached result survives a change to the underlying file
        fs::write(&path, "1 9:0.5\n0 9:1\n").unwrap();
        assert_eq!(read_problem_info(&path, true).unwrap(), (4, 1));
        assert_eq!(read_problem_info(&path, false).unwrap(), (10, 2));
    }

    #[test]
    fn empty_dataset_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.dat");
        fs::write(&path, "").unwrap();
        assert!(matches!(
            read_problem_info(&path, false),
            Err(FtrlError::ZeroFeatures)
        ));
    }

    #[test]
    fn evaluate_stream_mean_loss() {
        let lines = vec!["1 1:1".to_string(), "0 1:1".to_string()];
        let loss = evaluate_stream(&lines, |_| 0.5).unwrap();
        assert!((loss - 2f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn serial_trainer_learns_a_separable_problem() {
        let dir = tempfile::tempdir().unwrap();
        let train = write_separable(&dir, "train.dat", 200);
        let model_path = dir.path().join("model.dat");

        let trainer = FtrlTrainer::new(options(3, 0)).with_job_name("serial");
        trainer
            .train(&sparse_params(), &model_path, &train, Some(&train))
            .unwrap();

        let model = LrModel::load(&model_path).unwrap();
        let pos = vec![Feature::new(0, 1.0), Feature::new(1, 1.0)];
        let neg = vec![Feature::new(0, 1.0), Feature::new(2, 1.0)];
        assert!(model.predict(&pos) > 0.6);
        assert!(model.predict(&neg) < 0.4);
    }

    #[test]
    fn parallel_trainer_learns_a_separable_problem() {
        let dir = tempfile::tempdir().unwrap();
        let train = write_separable(&dir, "train.dat", 400);
        let model_path = dir.path().join("model.dat");

        let trainer = FastFtrlTrainer::new(options(3, 2)).with_job_name("fast");
        trainer
            .train(&sparse_params(), &model_path, &train, None)
            .unwrap();

        let model = LrModel::load(&model_path).unwrap();
        let pos = vec![Feature::new(0, 1.0), Feature::new(1, 1.0)];
        let neg = vec![Feature::new(0, 1.0), Feature::new(2, 1.0)];
        assert!(model.predict(&pos) > 0.6);
        assert!(model.predict(&neg) < 0.4);
    }

    #[test]
    fn single_threaded_training_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let train = write_separable(&dir, "train.dat", 120);

        let encode = |model_path: &Path| {
            let trainer = FastFtrlTrainer::new(options(2, 1));
            trainer
                .train(&sparse_params(), model_path, &train, None)
                .unwrap();
            fs::read_to_string(model_path).unwrap()
        };

        let a = encode(&dir.path().join("a.dat"));
        let b = encode(&dir.path().join("b.dat"));
        assert_eq!(a, b);
    }

    #[test]
    fn burn_in_prefix_then_parallel() {
        let dir = tempfile::tempdir().unwrap();
        let train = write_separable(&dir, "train.dat", 200);
        let model_path = dir.path().join("model.dat");

        let mut opts = options(2, 2);
        opts.burn_in = 0.25;
        FastFtrlTrainer::new(opts)
            .train(&sparse_params(), &model_path, &train, None)
            .unwrap();
        assert!(model_path.exists());
    }

    #[test]
    fn full_burn_in_skips_the_parallel_phase() {
        let dir = tempfile::tempdir().unwrap();
        let train = write_separable(&dir, "train.dat", 100);
        let model_path = dir.path().join("model.dat");

        let mut opts = options(1, 2);
        opts.burn_in = 1.0;
        FastFtrlTrainer::new(opts)
            .train(&sparse_params(), &model_path, &train, None)
            .unwrap();
        assert!(model_path.exists());
    }

    #[test]
    fn restored_training_continues_from_the_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let train = write_separable(&dir, "train.dat", 100);
        let first = dir.path().join("first.dat");
        let second = dir.path().join("second.dat");

        let trainer = FastFtrlTrainer::new(options(1, 1));
        trainer.train(&sparse_params(), &first, &train, None).unwrap();

        // snapshot with statistics so training can actually resume
        let server = FtrlParamServer::restore(&first, 42).unwrap();
        server.snapshot().unwrap().save(&first).unwrap();

        trainer.train_restore(&first, &second, &train, None).unwrap();
        assert!(second.exists());
    }

    #[test]
    fn online_refresh_returns_a_decodable_model() {
        let dir = tempfile::tempdir().unwrap();
        let train = write_separable(&dir, "train.dat", 100);
        let model_path = dir.path().join("model.dat");

        let trainer = FastFtrlTrainer::new(options(1, 1));
        trainer
            .train(&sparse_params(), &model_path, &train, None)
            .unwrap();
        let encoded = fs::read_to_string(&model_path).unwrap();

        let instances: Vec<String> =
            (0..20).map(|i| format!("{} {}:1", i % 2, 1 + i % 2)).collect();
        let online = FastFtrlTrainer::new(options(2, 2)).with_job_name("online");
        let refreshed = online.train_online(&encoded, &instances).unwrap();

        let model = FtrlModel::from_json(&refreshed).unwrap();
        assert_eq!(model.feat_num, 3);
        assert!(model.init);
        assert!(model.n.is_empty());

        assert!(matches!(
            online.train_online(&encoded, &[]),
            Err(FtrlError::InvalidParameters { .. })
        ));
    }

    /// Two overlapping clusters: positives fire features 1-3, negatives
    /// 4-6, and feature 7 fires on everything.
    fn write_dataset(dir: &tempfile::TempDir, name: &str, rows: usize) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        for i in 0..rows {
            if i % 2 == 0 {
                writeln!(f, "1 {}:1 7:0.5", 1 + i % 3).unwrap();
            } else {
                writeln!(f, "-1 {}:1 7:0.5", 4 + i % 3).unwrap();
            }
        }
        path
    }

    #[test]
    fn train_score_and_refresh() {
        init_logger();

        let dir = tempfile::tempdir().unwrap();
        let train = write_dataset(&dir, "train.dat", 600);
        let test = write_dataset(&dir, "test.dat", 200);
        assert_eq!(validate_file(&train).unwrap(), 600);

        let params = HyperParams {
            alpha: 0.1,
            beta: 1.0,
            l1: 0.01,
            l2: 0.1,
            dropout: 0.0,
        };
        let opts = TrainOptions {
            epochs: 4,
            threads: 2,
            burn_in: 0.1,
            cache_feature_num: true,
            ..TrainOptions::default()
        };

        let model_path = dir.path().join("model.dat");
        FastFtrlTrainer::new(opts)
            .with_job_name("e2e")
            .train(&params, &model_path, &train, Some(&test))
            .unwrap();

        // the artifact is the thin serving form
        let model = FtrlModel::load(&model_path).unwrap();
        assert_eq!(model.feat_num, 8);
        assert!(model.init);
        assert!(model.n.is_empty());
        assert!(!model.weights.is_empty());

        let output = dir.path().join("pred.out");
        let report = score_file(&model_path, &test, &output, 0.5, "e2e").unwrap();
        assert_eq!(report.count, 200);
        assert_eq!(report.positive_count, 100);
        assert!(report.accuracy > 0.9, "accuracy = {}", report.accuracy);
        assert!(report.auc > 0.9, "auc = {}", report.auc);
        assert!(report.log_loss < 2f64.ln(), "log_loss = {}", report.log_loss);

        // online refresh over a small minibatch keeps the model decodable
        let encoded = fs::read_to_string(&model_path).unwrap();
        let minibatch: Vec<String> = (0..20)
            .map(|i| {
                if i % 2 == 0 {
                    format!("1 {}:1 7:0.5", 1 + i % 3)
                } else {
                    format!("0 {}:1 7:0.5", 4 + i % 3)
                }
            })
            .collect();
        let refreshed = FastFtrlTrainer::new(options(1, 2))
            .with_job_name("e2e-online")
            .train_online(&encoded, &minibatch)
            .unwrap();
        let refreshed = FtrlModel::from_json(&refreshed).unwrap();
        assert_eq!(refreshed.feat_num, 8);

        // scoring twice is deterministic
        let output2 = dir.path().join("pred2.out");
        let report2 = score_file(&model_path, &test, &output2, 0.5, "e2e").unwrap();
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            fs::read_to_string(&output2).unwrap()
        );
        assert_eq!(report.auc, report2.auc);
        assert_eq!(report.log_loss, report2.log_loss);
    }
}
