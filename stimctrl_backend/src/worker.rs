//! Single background worker that owns the engine and runs stimuli one at a time.
//!
//! Callers (typically a UI thread) submit jobs and get a receiver for each result, so they never
//! block on the device. Jobs run strictly in submission order; the engine's last observed state is
//! published through a shared mutex.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use stimcompiler_backend::error::{Result, StimError};
use stimcompiler_backend::terminator::DEFAULT_THRESHOLD;
use stimcompiler_backend::waveform::WaveformSpec;

use crate::command::CameraTrigger;
use crate::engine::*;
use crate::session::DeviceSession;

/// One stimulus request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusJob {
    pub spec: WaveformSpec,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub camera: Option<CameraTrigger>,
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

impl StimulusJob {
    pub fn new(spec: WaveformSpec) -> Self {
        Self {
            spec,
            threshold: DEFAULT_THRESHOLD,
            camera: None,
        }
    }
}

enum WorkerCmd {
    Run(StimulusJob, Sender<Result<ExecutionOutcome>>),
    SetDac(u8, f64, Sender<Result<()>>),
    Close,
}

/// Count of submitted but unfinished commands, with a condvar to wait for zero.
struct Pending {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.condvar.notify_all();
        }
    }
}

pub struct StimulusWorker<S: DeviceSession + Send + 'static> {
    cmd_tx: Sender<WorkerCmd>,
    state: Arc<Mutex<EngineState>>,
    pending: Arc<Pending>,
    handle: Option<JoinHandle<StimulusEngine<S>>>,
}

impl<S: DeviceSession + Send + 'static> StimulusWorker<S> {
    pub fn spawn(engine: StimulusEngine<S>) -> Self {
        let state = Arc::new(Mutex::new(engine.state()));
        let mut engine = engine.with_state_sink(state.clone());
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            condvar: Condvar::new(),
        });
        let (cmd_tx, cmd_rx) = channel::unbounded::<WorkerCmd>();

        let worker_pending = pending.clone();
        let handle = std::thread::spawn(move || {
            for cmd in cmd_rx.iter() {
                match cmd {
                    WorkerCmd::Run(job, result_tx) => {
                        let result = engine.execute(&job.spec, job.threshold, job.camera.as_ref());
                        if let Err(err) = &result {
                            log::warn!("Stimulus {:?} failed: {}", job.spec.kind(), err);
                        }
                        // The caller may have dropped its receiver
                        let _ = result_tx.send(result);
                    }
                    WorkerCmd::SetDac(chan, voltage, result_tx) => {
                        let _ = result_tx.send(engine.set_dac(chan, voltage));
                    }
                    WorkerCmd::Close => break,
                }
                worker_pending.done();
            }
            log::debug!("Stimulus worker exiting");
            engine
        });

        Self {
            cmd_tx,
            state,
            pending,
            handle: Some(handle),
        }
    }

    fn post(&self, cmd: WorkerCmd) -> Result<()> {
        self.pending.add();
        self.cmd_tx.send(cmd).map_err(|_| {
            self.pending.done();
            StimError::Device {
                context: "stimulus worker".to_string(),
                code: -1,
                text: "Worker thread is not running".to_string(),
            }
        })
    }

    /// Queues `job`. The receiver yields the result once the job has run.
    pub fn submit(&self, job: StimulusJob) -> Result<Receiver<Result<ExecutionOutcome>>> {
        let (tx, rx) = channel::bounded(1);
        self.post(WorkerCmd::Run(job, tx))?;
        Ok(rx)
    }

    pub fn set_dac(&self, channel: u8, voltage: f64) -> Result<Receiver<Result<()>>> {
        let (tx, rx) = channel::bounded(1);
        self.post(WorkerCmd::SetDac(channel, voltage, tx))?;
        Ok(rx)
    }

    /// Engine state as last published by the worker.
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Blocks until every submitted command has finished.
    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.condvar.wait(&mut count);
        }
    }

    /// Stops the worker after the queued jobs and hands the engine back.
    pub fn close(mut self) -> Option<StimulusEngine<S>> {
        let _ = self.cmd_tx.send(WorkerCmd::Close);
        self.handle.take().and_then(|h| h.join().ok())
    }
}

impl<S: DeviceSession + Send + 'static> Drop for StimulusWorker<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.cmd_tx.send(WorkerCmd::Close);
            let _ = handle.join();
        }
    }
}
