//! Background simulation thread.
//!
//! The worker owns the stepping loop; everything else talks to it through the
//! shared model (edits), the engine mutex (reset, inspection), the keep-running
//! flag (cancellation) and a bounded snapshot channel (plotting).

use crate::engine::{Engine, EngineConfig, EngineError};
use crate::log::LogSink;
use crate::model::SharedModel;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Snapshots buffered before the worker starts dropping them.
pub const SNAPSHOT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Batches per wall-clock second; zero or less disables the rate gate.
    pub steps_per_second: f64,
    pub iterations_per_batch: u32,
    pub idle_sleep_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            steps_per_second: 60.0,
            iterations_per_batch: 1,
            idle_sleep_ms: 2,
        }
    }
}

impl WorkerConfig {
    /// Minimum wall-clock time between two batches, `1000 / steps_per_second` ms.
    pub fn batch_interval(&self) -> Duration {
        if self.steps_per_second.is_finite() && self.steps_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / self.steps_per_second)
        } else {
            Duration::ZERO
        }
    }
}

/// Committed field values after a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub iteration: u64,
    pub names: Vec<String>,
    pub values: Vec<f64>,
}

pub struct SimulationWorker {
    engine: Arc<Mutex<Engine>>,
    keep_running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    snapshots: Receiver<Snapshot>,
}

impl SimulationWorker {
    pub fn spawn(
        model: SharedModel,
        engine_config: EngineConfig,
        config: WorkerConfig,
        log: LogSink,
    ) -> io::Result<Self> {
        let engine = Arc::new(Mutex::new(Engine::new(engine_config)));
        let keep_running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = sync_channel(SNAPSHOT_QUEUE_DEPTH);

        let handle = {
            let engine = Arc::clone(&engine);
            let keep_running = Arc::clone(&keep_running);
            thread::Builder::new()
                .name("odesim-worker".to_string())
                .spawn(move || run_loop(&engine, &model, &config, &keep_running, &tx, &log))?
        };

        Ok(Self {
            engine,
            keep_running,
            handle: Some(handle),
            snapshots: rx,
        })
    }

    /// The engine, for inspection or `reset` between batches.
    pub fn engine(&self) -> MutexGuard<'_, Engine> {
        lock(&self.engine)
    }

    pub fn snapshots(&self) -> &Receiver<Snapshot> {
        &self.snapshots
    }

    /// Drains the queue and returns the newest snapshot, if any.
    pub fn latest(&self) -> Option<Snapshot> {
        self.snapshots.try_iter().last()
    }

    pub fn is_running(&self) -> bool {
        self.keep_running.load(Ordering::Acquire)
            && self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Requests cancellation and waits for the current batch to finish.
    pub fn stop(&mut self) {
        self.keep_running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("simulation worker panicked");
            }
        }
    }
}

impl Drop for SimulationWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(engine: &Mutex<Engine>) -> MutexGuard<'_, Engine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_loop(
    engine: &Mutex<Engine>,
    model: &SharedModel,
    config: &WorkerConfig,
    keep_running: &AtomicBool,
    snapshots: &SyncSender<Snapshot>,
    log: &LogSink,
) {
    let interval = config.batch_interval();
    let idle = Duration::from_millis(config.idle_sleep_ms);
    let mut last_batch: Option<Instant> = None;
    info!(?interval, iterations_per_batch = config.iterations_per_batch, "simulation worker started");

    while keep_running.load(Ordering::Acquire) {
        if last_batch.is_some_and(|t| t.elapsed() < interval) {
            thread::sleep(idle);
            continue;
        }
        last_batch = Some(Instant::now());

        let result = run_batch(&mut lock(engine), model, config.iterations_per_batch.max(1));
        match result {
            Ok(snapshot) => match snapshots.try_send(snapshot) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => {
                    debug!("snapshot receiver dropped");
                    break;
                }
            },
            Err(err) => {
                log.error(format!("simulation stopped: {err}"));
                keep_running.store(false, Ordering::Release);
            }
        }
    }
    info!("simulation worker stopped");
}

fn run_batch(engine: &mut Engine, model: &SharedModel, iterations: u32) -> Result<Snapshot, EngineError> {
    if engine.sync(model)? {
        debug!(generation = model.generation(), "re-bound model");
    }
    for _ in 0..iterations {
        engine.step()?;
    }
    Ok(Snapshot {
        iteration: engine.iteration(),
        names: engine.field_names(),
        values: engine.values(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogLevel;
    use crate::model::ModelTables;

    fn fast() -> WorkerConfig {
        WorkerConfig {
            steps_per_second: 0.0,
            iterations_per_batch: 5,
            idle_sleep_ms: 1,
        }
    }

    fn step_one() -> EngineConfig {
        EngineConfig {
            model_step: 1.0,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn batch_interval_follows_rate() {
        let config = WorkerConfig {
            steps_per_second: 250.0,
            ..WorkerConfig::default()
        };
        assert_eq!(config.batch_interval(), Duration::from_millis(4));
        assert_eq!(fast().batch_interval(), Duration::ZERO);
    }

    #[test]
    fn worker_streams_snapshots_and_picks_up_edits() {
        let mut tables = ModelTables::new();
        tables.push_state("t", "1", "0").expect("t");
        let model = SharedModel::new(tables);
        let mut worker =
            SimulationWorker::spawn(model.clone(), step_one(), fast(), LogSink::new()).expect("spawn");

        let first = worker
            .snapshots()
            .recv_timeout(Duration::from_secs(5))
            .expect("snapshot");
        assert_eq!(first.names, vec!["t"]);
        assert_eq!(first.iteration % 5, 0);

        model.edit(|tables| tables.push_state("s", "0", "2")).expect("edit");
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_edit = false;
        while Instant::now() < deadline {
            if let Ok(snapshot) = worker.snapshots().recv_timeout(Duration::from_millis(100)) {
                if snapshot.names == vec!["t", "s"] {
                    assert_eq!(snapshot.values[1], 2.0);
                    saw_edit = true;
                    break;
                }
            }
        }
        assert!(saw_edit, "worker never re-bound the edited model");

        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn step_errors_stop_the_worker_and_are_logged() {
        let mut tables = ModelTables::new();
        tables.push_state("x", "x*x", "10").expect("x");
        let log = LogSink::new();
        let worker =
            SimulationWorker::spawn(SharedModel::new(tables), step_one(), fast(), log.clone()).expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.is_running());
        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Error);
        assert!(entries[0].message.contains("diverged"), "{}", entries[0].message);
    }
}
