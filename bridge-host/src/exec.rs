//! Execution bridge: hand work from connection threads to the model loop and
//! poll for the outcome.
//!
//! Connection handlers never touch the model directly. They submit a job and
//! poll a shared slot at a fixed interval up to a per-operation budget; on
//! timeout the slot is abandoned and a late completion writes into memory
//! nobody reads anymore.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::model::Model;

/// Interval between result-slot polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Poll budget for color creation (5 seconds).
pub const COLOR_POLL_LIMIT: u32 = 50;
/// Poll budget for image creation (10 seconds).
pub const IMAGE_POLL_LIMIT: u32 = 100;

type Job = Box<dyn FnOnce(&mut Model) -> Result<Value, String> + Send + 'static>;

/// Slot the model loop writes a job outcome into.
#[derive(Clone)]
pub struct ResultSlot(Arc<Mutex<Option<Result<Value, String>>>>);

impl ResultSlot {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    fn put(&self, outcome: Result<Value, String>) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(outcome);
        }
    }

    /// Take the outcome if the job has finished.
    pub fn take(&self) -> Option<Result<Value, String>> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Error waiting on scheduled work.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("timed out waiting for the model thread")]
    Timeout,
    #[error("{0}")]
    Failed(String),
}

/// Cloneable handle submitting jobs to the model loop.
#[derive(Clone)]
pub struct ExecutionBridge {
    tx: Sender<(Job, ResultSlot)>,
    poll_interval: Duration,
}

impl ExecutionBridge {
    /// Enqueue `job` for the model loop and return the slot it will fill.
    pub fn schedule(
        &self,
        job: impl FnOnce(&mut Model) -> Result<Value, String> + Send + 'static,
    ) -> Result<ResultSlot, ExecError> {
        let slot = ResultSlot::new();
        self.tx
            .send((Box::new(job), slot.clone()))
            .map_err(|_| ExecError::Failed("model loop stopped".to_string()))?;
        Ok(slot)
    }

    /// Schedule `job` and poll its slot up to `limit` times. Past the budget
    /// the job is abandoned: a late completion is discarded, never an error.
    pub fn run_to_completion(
        &self,
        job: impl FnOnce(&mut Model) -> Result<Value, String> + Send + 'static,
        limit: u32,
    ) -> Result<Value, ExecError> {
        let slot = self.schedule(job)?;
        for _ in 0..limit {
            thread::sleep(self.poll_interval);
            if let Some(outcome) = slot.take() {
                return outcome.map_err(ExecError::Failed);
            }
        }
        Err(ExecError::Timeout)
    }

    /// Shrink the poll interval. Test hook; production uses [`POLL_INTERVAL`].
    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// The single-threaded execution context. Exactly one loop owns the model;
/// nothing else may mutate it.
pub struct ModelLoop {
    rx: Receiver<(Job, ResultSlot)>,
    model: Model,
}

impl ModelLoop {
    pub fn new(model: Model) -> (Self, ExecutionBridge) {
        let (tx, rx) = channel();
        (
            Self { rx, model },
            ExecutionBridge {
                tx,
                poll_interval: POLL_INTERVAL,
            },
        )
    }

    /// Run until every bridge handle is dropped.
    pub fn run(mut self) {
        while let Ok((job, slot)) = self.rx.recv() {
            self.execute(job, slot);
        }
    }

    /// Drain currently queued jobs without blocking.
    pub fn run_pending(&mut self) {
        while let Ok((job, slot)) = self.rx.try_recv() {
            self.execute(job, slot);
        }
    }

    fn execute(&mut self, job: Job, slot: ResultSlot) {
        // A panicking job must not take the loop down with it.
        let outcome = catch_unwind(AssertUnwindSafe(|| job(&mut self.model)))
            .unwrap_or_else(|panic| Err(panic_message(&panic)));
        slot.put(outcome);
    }

    pub fn model(&self) -> &Model {
        &self.model
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("model work panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("model work panicked: {s}")
    } else {
        "model work panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    fn fast_loop() -> (ExecutionBridge, thread::JoinHandle<()>) {
        let (model_loop, bridge) = ModelLoop::new(Model::new(1.0));
        let handle = thread::spawn(move || model_loop.run());
        (bridge.with_poll_interval(Duration::from_millis(5)), handle)
    }

    #[test]
    fn job_runs_on_the_model() {
        let (bridge, handle) = fast_loop();
        let out = bridge
            .run_to_completion(
                |m| Ok(json!({ "name": m.create_color_material(1, 2, 3, None) })),
                50,
            )
            .unwrap();
        assert!(out["name"].as_str().unwrap().starts_with("Color_010203_"));
        drop(bridge);
        handle.join().unwrap();
    }

    #[test]
    fn job_error_surfaces_as_failure() {
        let (bridge, handle) = fast_loop();
        let err = bridge
            .run_to_completion(|_| Err("no can do".to_string()), 50)
            .unwrap_err();
        assert!(matches!(err, ExecError::Failed(msg) if msg == "no can do"));
        drop(bridge);
        handle.join().unwrap();
    }

    #[test]
    fn panic_is_captured_not_propagated() {
        let (bridge, handle) = fast_loop();
        let err = bridge
            .run_to_completion(|_| panic!("boom"), 50)
            .unwrap_err();
        assert!(matches!(err, ExecError::Failed(msg) if msg.contains("boom")));
        // The loop survives and keeps serving jobs.
        let out = bridge.run_to_completion(|_| Ok(json!(1)), 50).unwrap();
        assert_eq!(out, json!(1));
        drop(bridge);
        handle.join().unwrap();
    }

    #[test]
    fn timeout_after_poll_budget() {
        let (model_loop, bridge) = ModelLoop::new(Model::new(1.0));
        let bridge = bridge.with_poll_interval(Duration::from_millis(5));
        // Nothing runs the loop, so the slot never fills.
        let start = Instant::now();
        let err = bridge.run_to_completion(|_| Ok(json!(null)), 10).unwrap_err();
        assert!(matches!(err, ExecError::Timeout));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "returned too early: {elapsed:?}");
        drop(model_loop);
    }

    #[test]
    fn late_completion_is_discarded_quietly() {
        let (mut model_loop, bridge) = ModelLoop::new(Model::new(1.0));
        let bridge = bridge.with_poll_interval(Duration::from_millis(1));
        let err = bridge
            .run_to_completion(
                |m| Ok(json!({ "name": m.create_color_material(9, 9, 9, None) })),
                3,
            )
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout));
        // The job still runs afterwards; its effect on the model stands and
        // the result lands in the abandoned slot without any crash.
        model_loop.run_pending();
        assert_eq!(model_loop.model().materials().len(), 1);
    }
}
