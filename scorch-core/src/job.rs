//! The contract every pipeline stage implements.
//!
//! A job declares what track kinds it can consume and produce, runs either
//! synchronously or on a worker thread of its own, and reports progress
//! through a shared [`JobMonitor`] that the control thread (and the UI
//! behind it) polls. The lifecycle is strict: `Idle → Running → {Done |
//! Failed | Cancelling → Done}`, with exactly one terminal report: an
//! output track, an error, or cancellation with neither.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::BurnResult;
use crate::track::{Track, TrackKind};

/// How a job exchanges content with its neighbours: through a locator it
/// opens itself, or through an already-open stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IoMode {
    File,
    Pipe,
}

/// One (kind, I/O mode) capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cap {
    pub kind: TrackKind,
    pub mode: IoMode,
}

impl Cap {
    pub const fn new(kind: TrackKind, mode: IoMode) -> Self {
        Self { kind, mode }
    }
}

impl fmt::Display for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            IoMode::File => "file",
            IoMode::Pipe => "pipe",
        };
        write!(f, "{}/{}", self.kind, mode)
    }
}

/// The capability declaration of a job: accepted inputs, produced outputs,
/// and a priority used to break ties during chain composition.
#[derive(Clone, Debug)]
pub struct JobCaps {
    inputs: Vec<Cap>,
    outputs: Vec<Cap>,
    priority: u32,
    run_first: bool,
}

impl JobCaps {
    pub fn new(inputs: Vec<Cap>, outputs: Vec<Cap>, priority: u32) -> Self {
        Self {
            inputs,
            outputs,
            priority,
            run_first: false,
        }
    }

    /// Marks this job as one that must lead any chain whose input it
    /// accepts (normalization stages such as local staging).
    pub fn run_first(mut self) -> Self {
        self.run_first = true;
        self
    }

    pub fn accepts(&self, cap: Cap) -> bool {
        self.inputs.contains(&cap)
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn is_run_first(&self) -> bool {
        self.run_first
    }

    pub fn outputs(&self) -> &[Cap] {
        &self.outputs
    }

    /// The output closest to `terminal` together with its rank: 0 for an
    /// exact match, 1 for a kind-only match, 2 otherwise. The first output
    /// wins among equally ranked ones, keeping composition deterministic.
    pub fn best_output(&self, terminal: Cap) -> Option<(Cap, u8)> {
        let mut best: Option<(Cap, u8)> = None;
        for &out in &self.outputs {
            let rank = if out == terminal {
                0
            } else if out.kind == terminal.kind {
                1
            } else {
                2
            };
            if best.is_none_or(|(_, b)| rank < b) {
                best = Some((out, rank));
            }
        }
        best
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Cancelling,
    Done,
    Failed,
}

/// The operation currently performed, as shown to the user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BurnAction {
    #[default]
    None,
    FileCopy,
    StartRecording,
    Recording,
    Fixating,
    Blanking,
    DriveCopy,
    Checksumming,
    Finished,
}

impl fmt::Display for BurnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BurnAction::None => "",
            BurnAction::FileCopy => "Copying files",
            BurnAction::StartRecording => "Preparing to write",
            BurnAction::Recording => "Writing",
            BurnAction::Fixating => "Finalizing",
            BurnAction::Blanking => "Blanking",
            BurnAction::DriveCopy => "Copying disc",
            BurnAction::Checksumming => "Checking integrity",
            BurnAction::Finished => "Finished",
        };
        f.write_str(name)
    }
}

/// One observation of a running operation.
#[derive(Clone, Debug)]
pub struct ProgressReport {
    /// Completion in `[0.0, 1.0]`, or `-1.0` when indeterminate.
    pub fraction: f64,
    /// Bytes written to the session so far, when byte-accurate progress is
    /// available.
    pub written: u64,
    pub action: BurnAction,
    pub label: Option<String>,
    /// Set while interrupting would damage the medium. A hint for the UI to
    /// disable cancellation controls; `stop()` still succeeds regardless.
    pub dangerous: bool,
}

impl Default for ProgressReport {
    fn default() -> Self {
        Self {
            fraction: -1.0,
            written: 0,
            action: BurnAction::None,
            label: None,
            dangerous: false,
        }
    }
}

/// Shared progress side-channel between a job's worker and the control
/// thread. Workers write, the UI polls `snapshot()`.
#[derive(Debug, Default)]
pub struct JobMonitor {
    state: Mutex<ProgressReport>,
}

impl JobMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressReport> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_fraction(&self, fraction: f64) {
        self.lock().fraction = fraction.clamp(-1.0, 1.0);
    }

    pub fn set_written(&self, bytes: u64) {
        self.lock().written = bytes;
    }

    pub fn set_action(&self, action: BurnAction, label: Option<String>) {
        let mut state = self.lock();
        state.action = action;
        state.label = label;
    }

    pub fn set_dangerous(&self, dangerous: bool) {
        self.lock().dangerous = dangerous;
    }

    pub fn reset(&self) {
        *self.lock() = ProgressReport::default();
    }

    pub fn snapshot(&self) -> ProgressReport {
        self.lock().clone()
    }
}

/// Result of polling a running job.
#[derive(Debug)]
pub enum JobPoll {
    /// Still working; poll again after a short delay.
    Retry,
    /// Finished successfully with its output track.
    Finished(Track),
    /// Cancelled; no output was produced.
    Cancelled,
}

/// A capability-declaring, cancellable processing stage.
///
/// Ownership rules: a job is driven exclusively by the pipeline while
/// active. It owns any worker thread and cancellation flag it creates and
/// must release both before reporting a terminal state.
pub trait Job {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn caps(&self) -> &JobCaps;

    fn state(&self) -> JobState;

    fn monitor(&self) -> &Arc<JobMonitor>;

    /// Transitions Idle → Running and begins work on `input`. May complete
    /// synchronously (the first `poll()` then reports the result) or launch
    /// a worker thread and return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::BurnError::AlreadyRunning`], changing
    /// nothing, when the job is already running.
    fn start(&mut self, input: Track) -> BurnResult<()>;

    /// Non-blocking check for completion. This is where the worker-to-
    /// control handoff happens: the first poll that observes a recorded
    /// result publishes the output track and performs the state
    /// transition.
    fn poll(&mut self) -> BurnResult<JobPoll>;

    /// Requests cancellation and blocks until the worker has fully unwound.
    /// After this returns the job is in a terminal state, no output track
    /// was produced, and no worker thread remains.
    fn stop(&mut self);
}
