//! Supervises one write session over a native drive backend.
//!
//! The backend exposes synchronous, non-blocking commands: a status +
//! progress query, a diagnostic message drain, cancel/forget, and an
//! ordered release sequence. [`BurnContext`] owns exactly one backend for
//! the duration of one operation and turns its status reports into
//! progress and action events through a polling state machine. The caller
//! provides the retry cadence; `poll()` itself never blocks.

use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use log::{debug, warn};

use crate::error::{BurnError, BurnResult};
use crate::job::{BurnAction, JobMonitor};
use crate::SECTOR_SIZE;

/// Interval between re-checks while waiting for the drive to reach idle
/// during teardown. Each wait is bounded; the total is not, since the
/// drive is assumed to eventually settle after a cancel.
const IDLE_WAIT: Duration = Duration::from_millis(200);

/// Device states reported by the write backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveStatus {
    Idle,
    Spawning,
    Grabbing,
    Reading,
    Writing,
    /// DAO session start.
    WritingLeadIn,
    /// TAO track start.
    WritingPregap,
    /// DAO session end.
    WritingLeadOut,
    /// TAO track end.
    ClosingTrack,
    /// Multisession end.
    ClosingSession,
    Erasing,
    Formatting,
    /// A status code this engine does not know. Treated as transient.
    Unknown(u32),
}

/// Raw progress counters attached to a status report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Number of the track being written.
    pub track: u32,
    /// Sectors completed within the current track.
    pub sector: u64,
    /// Total sectors of the current track (or of the erase operation).
    pub sectors: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageSeverity {
    Debug,
    Warning,
    Fatal,
    Abort,
}

/// A diagnostic message drained from the backend.
#[derive(Clone, Debug)]
pub struct BackendMessage {
    pub severity: MessageSeverity,
    pub text: String,
}

/// Result of one supervision round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnginePoll {
    /// Steady state: poll again after a short delay.
    Retry,
    /// The drive reached idle after observed activity; the operation is
    /// complete.
    Complete,
}

/// The native write engine's command set, as consumed by the supervisor.
///
/// All calls are synchronous and non-blocking by contract. The release
/// methods must be invoked in the fixed order disc → drive → drive-info →
/// finish; [`BurnContext::release`] is the only caller.
pub trait DriveBackend {
    fn status(&mut self) -> (DriveStatus, ProgressSnapshot);

    /// Next pending diagnostic message, if any.
    fn pop_message(&mut self) -> Option<BackendMessage>;

    /// Asks the backend to abort the in-flight write or read.
    fn cancel(&mut self);

    /// Drops a grab still in progress.
    fn forget(&mut self);

    fn release_disc(&mut self);
    fn release_drive(&mut self);
    fn release_drive_info(&mut self);

    /// Global backend teardown, after every handle is gone.
    fn finish(&mut self);
}

/// Drives one burn/blank/copy operation over a grabbed drive.
pub struct BurnContext<B: DriveBackend> {
    backend: Option<B>,
    monitor: std::sync::Arc<JobMonitor>,
    status: DriveStatus,
    /// Sectors completed in prior tracks of this session.
    sectors: u64,
    track_sectors: u64,
    track_num: u32,
    has_leadin: bool,
}

impl<B: DriveBackend> BurnContext<B> {
    /// Takes exclusive ownership of `backend` for one operation.
    ///
    /// The operation is assumed to have been initiated already, so the
    /// prior status starts out as Spawning: a first report of Idle then
    /// means the operation finished between two polls and `poll()` returns
    /// Complete instead of hanging in Retry.
    pub fn new(backend: B, monitor: std::sync::Arc<JobMonitor>) -> Self {
        Self {
            backend: Some(backend),
            monitor,
            status: DriveStatus::Spawning,
            sectors: 0,
            track_sectors: 0,
            track_num: 0,
            has_leadin: false,
        }
    }

    /// One supervision round: drain messages, observe status, emit events.
    ///
    /// # Errors
    ///
    /// [`BurnError::Backend`] when the backend reported a FATAL or ABORT
    /// message, carrying that message's text.
    pub fn poll(&mut self) -> BurnResult<EnginePoll> {
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| BurnError::Internal(anyhow!("drive already released")))?;

        while let Some(message) = backend.pop_message() {
            match message.severity {
                MessageSeverity::Fatal | MessageSeverity::Abort => {
                    warn!("backend reported an error: {}", message.text);
                    return Err(BurnError::Backend(message.text));
                }
                _ => debug!("backend: {}", message.text),
            }
        }

        let (status, progress) = backend.status();

        if status != self.status {
            let running = self.status_changed(status, progress);
            if !running {
                return Ok(EnginePoll::Complete);
            }
        }

        if matches!(status, DriveStatus::Idle | DriveStatus::Spawning)
            || progress.sectors == 0
            || progress.sector == 0
        {
            self.sectors = 0;
            self.track_num = progress.track;
            self.track_sectors = progress.sectors;
            return Ok(EnginePoll::Retry);
        }

        if matches!(
            status,
            DriveStatus::ClosingSession | DriveStatus::WritingLeadOut
        ) {
            self.monitor.set_fraction(1.0);
        } else if !matches!(status, DriveStatus::Erasing | DriveStatus::Formatting) {
            if self.track_num != progress.track {
                self.sectors += self.track_sectors;
                self.track_sectors = progress.sectors;
                self.track_num = progress.track;
                self.monitor.set_action(
                    BurnAction::Recording,
                    Some(format!("Writing track {:02}", progress.track)),
                );
            }
            let current_sector = progress.sector + self.sectors;
            self.monitor.set_written(current_sector * SECTOR_SIZE);
        } else {
            // When erasing only a fraction is known.
            self.monitor
                .set_fraction(progress.sector as f64 / progress.sectors as f64);
        }

        Ok(EnginePoll::Retry)
    }

    /// Handles a status transition; returns false when activity ended.
    fn status_changed(&mut self, status: DriveStatus, progress: ProgressSnapshot) -> bool {
        let action = match status {
            DriveStatus::Writing => {
                // Ignore spurious Writing reports after finalization began.
                if matches!(
                    self.status,
                    DriveStatus::WritingLeadOut
                        | DriveStatus::ClosingTrack
                        | DriveStatus::ClosingSession
                ) {
                    return true;
                }

                // Entering the first track, either from the lead-in or
                // straight from idle/spawn on backends that never report
                // one. Both seed the counters from the snapshot.
                if matches!(
                    self.status,
                    DriveStatus::WritingLeadIn | DriveStatus::WritingPregap
                ) || (!self.has_leadin
                    && matches!(self.status, DriveStatus::Idle | DriveStatus::Spawning))
                {
                    self.sectors += self.track_sectors;
                    self.track_sectors = progress.sectors;
                    self.track_num = progress.track;
                }

                self.monitor.set_dangerous(true);
                BurnAction::Recording
            }

            DriveStatus::WritingLeadIn | DriveStatus::WritingPregap => {
                self.has_leadin = true;
                self.monitor.set_dangerous(false);
                BurnAction::StartRecording
            }

            DriveStatus::WritingLeadOut
            | DriveStatus::ClosingTrack
            | DriveStatus::ClosingSession => {
                self.sectors += self.track_sectors;
                self.track_sectors = progress.sectors;
                self.monitor.set_dangerous(false);
                BurnAction::Fixating
            }

            DriveStatus::Erasing | DriveStatus::Formatting => {
                self.monitor.set_dangerous(true);
                BurnAction::Blanking
            }

            // End of activity.
            DriveStatus::Idle => return false,

            DriveStatus::Spawning => {
                self.monitor.set_dangerous(false);
                if self.status == DriveStatus::Idle {
                    BurnAction::StartRecording
                } else {
                    // Re-spawn between tracks.
                    BurnAction::Fixating
                }
            }

            DriveStatus::Reading => {
                self.monitor.set_dangerous(false);
                BurnAction::DriveCopy
            }

            DriveStatus::Grabbing | DriveStatus::Unknown(_) => {
                warn!("unhandled drive state {status:?}");
                return true;
            }
        };

        self.status = status;
        self.monitor.set_action(action, None);
        true
    }

    /// Requests cancellation of the in-flight operation. The drive is not
    /// idle afterwards; follow up with `poll()` or `release()`.
    pub fn stop(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            backend.cancel();
        }
    }

    /// Tears the context down without assuming the drive is idle.
    ///
    /// De-escalates first (cancel while writing or reading, forget while
    /// grabbing), then waits on a fixed interval until the drive reports
    /// idle, and only then releases the handles in their required order.
    pub fn release(mut self) {
        let Some(mut backend) = self.backend.take() else {
            return;
        };

        loop {
            let (status, _) = backend.status();
            match status {
                DriveStatus::Writing | DriveStatus::Reading => {
                    debug!("cancelling operation");
                    backend.cancel();
                }
                DriveStatus::Grabbing => {
                    debug!("grabbing state, try to forget");
                    backend.forget();
                }
                DriveStatus::Idle => break,
                _ => {}
            }
            debug!("drive not idle yet");
            thread::sleep(IDLE_WAIT);
        }

        debug!("drive stopped");

        // The drive handle is referenced by the drive-info record, so the
        // order below is load-bearing.
        backend.release_disc();
        backend.release_drive();
        backend.release_drive_info();
        backend.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Backend fed from a script of status reports, recording every
    /// command it receives.
    struct ScriptedBackend {
        script: VecDeque<(DriveStatus, ProgressSnapshot)>,
        messages: VecDeque<BackendMessage>,
        calls: Arc<Mutex<Vec<String>>>,
        /// Status reported once the script runs dry.
        resting: DriveStatus,
    }

    impl ScriptedBackend {
        fn new(script: Vec<(DriveStatus, ProgressSnapshot)>) -> Self {
            Self {
                script: script.into(),
                messages: VecDeque::new(),
                calls: Arc::new(Mutex::new(Vec::new())),
                resting: DriveStatus::Idle,
            }
        }

        fn calls(&self) -> Arc<Mutex<Vec<String>>> {
            Arc::clone(&self.calls)
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    impl DriveBackend for ScriptedBackend {
        fn status(&mut self) -> (DriveStatus, ProgressSnapshot) {
            self.script
                .pop_front()
                .unwrap_or((self.resting, ProgressSnapshot::default()))
        }

        fn pop_message(&mut self) -> Option<BackendMessage> {
            self.messages.pop_front()
        }

        fn cancel(&mut self) {
            self.record("cancel");
        }

        fn forget(&mut self) {
            self.record("forget");
        }

        fn release_disc(&mut self) {
            self.record("release_disc");
        }

        fn release_drive(&mut self) {
            self.record("release_drive");
        }

        fn release_drive_info(&mut self) {
            self.record("release_drive_info");
        }

        fn finish(&mut self) {
            self.record("finish");
        }
    }

    fn snap(track: u32, sector: u64, sectors: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            track,
            sector,
            sectors,
        }
    }

    fn drain<B: DriveBackend>(
        ctx: &mut BurnContext<B>,
        rounds: usize,
    ) -> (Vec<(BurnAction, Option<String>)>, Option<EnginePoll>) {
        let mut actions = Vec::new();
        let mut last = None;
        for _ in 0..rounds {
            let poll = ctx.poll().expect("poll failed");
            let report = ctx.monitor.snapshot();
            if actions.last() != Some(&(report.action, report.label.clone())) {
                actions.push((report.action, report.label));
            }
            last = Some(poll);
            if poll == EnginePoll::Complete {
                break;
            }
        }
        (actions, last)
    }

    #[test]
    fn full_session_emits_expected_action_sequence() {
        let backend = ScriptedBackend::new(vec![
            (DriveStatus::WritingLeadIn, snap(1, 0, 0)),
            (DriveStatus::Writing, snap(1, 10, 1000)),
            (DriveStatus::Writing, snap(1, 500, 1000)),
            (DriveStatus::Writing, snap(2, 5, 800)),
            (DriveStatus::WritingLeadOut, snap(2, 800, 800)),
            (DriveStatus::Idle, snap(0, 0, 0)),
        ]);
        let monitor = JobMonitor::new();
        let mut ctx = BurnContext::new(backend, Arc::clone(&monitor));

        let (actions, last) = drain(&mut ctx, 10);
        assert_eq!(last, Some(EnginePoll::Complete));
        assert_eq!(
            actions,
            vec![
                (BurnAction::StartRecording, None),
                (BurnAction::Recording, None),
                (BurnAction::Recording, Some("Writing track 02".to_string())),
                (BurnAction::Fixating, None),
            ]
        );
        // Lead-out forces completion to 100%.
        assert_eq!(monitor.snapshot().fraction, 1.0);
    }

    #[test]
    fn session_byte_offset_accumulates_across_tracks() {
        let backend = ScriptedBackend::new(vec![
            (DriveStatus::WritingLeadIn, snap(1, 0, 0)),
            (DriveStatus::Writing, snap(1, 1000, 1000)),
            (DriveStatus::Writing, snap(2, 5, 800)),
        ]);
        let monitor = JobMonitor::new();
        let mut ctx = BurnContext::new(backend, Arc::clone(&monitor));

        for _ in 0..3 {
            ctx.poll().unwrap();
        }
        // 1000 sectors of track 1 plus 5 of track 2.
        assert_eq!(monitor.snapshot().written, 1005 * SECTOR_SIZE);
    }

    #[test]
    fn writing_after_finalization_is_ignored() {
        let backend = ScriptedBackend::new(vec![
            (DriveStatus::WritingLeadIn, snap(1, 0, 0)),
            (DriveStatus::Writing, snap(1, 10, 100)),
            (DriveStatus::ClosingSession, snap(1, 100, 100)),
            // Spurious post-finalization report.
            (DriveStatus::Writing, snap(1, 100, 100)),
            (DriveStatus::Idle, snap(0, 0, 0)),
        ]);
        let monitor = JobMonitor::new();
        let mut ctx = BurnContext::new(backend, Arc::clone(&monitor));

        for _ in 0..3 {
            ctx.poll().unwrap();
        }
        assert_eq!(monitor.snapshot().action, BurnAction::Fixating);

        // The spurious Writing neither re-emits Recording nor flips the
        // dangerous flag back on.
        assert_eq!(ctx.poll().unwrap(), EnginePoll::Retry);
        let report = monitor.snapshot();
        assert_eq!(report.action, BurnAction::Fixating);
        assert!(!report.dangerous);

        assert_eq!(ctx.poll().unwrap(), EnginePoll::Complete);
    }

    #[test]
    fn dangerous_flag_follows_the_transition_table() {
        let backend = ScriptedBackend::new(vec![
            (DriveStatus::WritingLeadIn, snap(1, 0, 0)),
            (DriveStatus::Writing, snap(1, 10, 100)),
            (DriveStatus::WritingLeadOut, snap(1, 100, 100)),
        ]);
        let monitor = JobMonitor::new();
        let mut ctx = BurnContext::new(backend, Arc::clone(&monitor));

        ctx.poll().unwrap();
        assert!(!monitor.snapshot().dangerous);
        ctx.poll().unwrap();
        assert!(monitor.snapshot().dangerous);
        ctx.poll().unwrap();
        assert!(!monitor.snapshot().dangerous);
    }

    #[test]
    fn writing_straight_from_spawning_starts_track_one() {
        // A backend that skips lead-in reporting entirely.
        let backend = ScriptedBackend::new(vec![
            (DriveStatus::Spawning, snap(0, 0, 0)),
            (DriveStatus::Writing, snap(1, 20, 500)),
            (DriveStatus::Idle, snap(0, 0, 0)),
        ]);
        let monitor = JobMonitor::new();
        let mut ctx = BurnContext::new(backend, Arc::clone(&monitor));

        ctx.poll().unwrap();
        ctx.poll().unwrap();
        let report = monitor.snapshot();
        assert_eq!(report.action, BurnAction::Recording);
        assert!(report.dangerous);
        assert_eq!(report.written, 20 * SECTOR_SIZE);

        assert_eq!(ctx.poll().unwrap(), EnginePoll::Complete);
    }

    #[test]
    fn respawn_between_tracks_reports_fixating() {
        let backend = ScriptedBackend::new(vec![
            (DriveStatus::Writing, snap(1, 10, 100)),
            (DriveStatus::Spawning, snap(0, 0, 0)),
        ]);
        let monitor = JobMonitor::new();
        let mut ctx = BurnContext::new(backend, Arc::clone(&monitor));

        ctx.poll().unwrap();
        assert_eq!(monitor.snapshot().action, BurnAction::Recording);
        ctx.poll().unwrap();
        let report = monitor.snapshot();
        assert_eq!(report.action, BurnAction::Fixating);
        assert!(!report.dangerous);
    }

    #[test]
    fn reading_reports_drive_copy() {
        let backend = ScriptedBackend::new(vec![(DriveStatus::Reading, snap(0, 10, 100))]);
        let monitor = JobMonitor::new();
        let mut ctx = BurnContext::new(backend, Arc::clone(&monitor));

        ctx.poll().unwrap();
        let report = monitor.snapshot();
        assert_eq!(report.action, BurnAction::DriveCopy);
        assert!(!report.dangerous);
    }

    #[test]
    fn erasing_reports_a_fraction() {
        let backend = ScriptedBackend::new(vec![
            (DriveStatus::Erasing, snap(0, 25, 100)),
            (DriveStatus::Erasing, snap(0, 50, 100)),
        ]);
        let monitor = JobMonitor::new();
        let mut ctx = BurnContext::new(backend, Arc::clone(&monitor));

        ctx.poll().unwrap();
        ctx.poll().unwrap();
        let report = monitor.snapshot();
        assert_eq!(report.action, BurnAction::Blanking);
        assert!(report.dangerous);
        assert_eq!(report.fraction, 0.5);
    }

    #[test]
    fn fatal_message_fails_the_poll() {
        let mut backend = ScriptedBackend::new(vec![(DriveStatus::Writing, snap(1, 10, 100))]);
        backend.messages.push_back(BackendMessage {
            severity: MessageSeverity::Debug,
            text: "laser warming up".into(),
        });
        backend.messages.push_back(BackendMessage {
            severity: MessageSeverity::Fatal,
            text: "SCSI error on write".into(),
        });

        let mut ctx = BurnContext::new(backend, JobMonitor::new());
        let err = ctx.poll().unwrap_err();
        assert!(matches!(err, BurnError::Backend(text) if text == "SCSI error on write"));
    }

    #[test]
    fn unknown_status_is_transient() {
        let backend = ScriptedBackend::new(vec![
            (DriveStatus::Writing, snap(1, 10, 100)),
            (DriveStatus::Unknown(99), snap(1, 11, 100)),
            (DriveStatus::Idle, snap(0, 0, 0)),
        ]);
        let monitor = JobMonitor::new();
        let mut ctx = BurnContext::new(backend, Arc::clone(&monitor));

        ctx.poll().unwrap();
        assert_eq!(ctx.poll().unwrap(), EnginePoll::Retry);
        assert_eq!(monitor.snapshot().action, BurnAction::Recording);
        assert_eq!(ctx.poll().unwrap(), EnginePoll::Complete);
    }

    #[test]
    fn release_descalates_then_frees_in_fixed_order() {
        let backend = ScriptedBackend::new(vec![
            (DriveStatus::Writing, snap(1, 10, 100)),
            (DriveStatus::Writing, snap(1, 11, 100)),
            (DriveStatus::Idle, snap(0, 0, 0)),
        ]);
        let calls = backend.calls();

        let ctx = BurnContext::new(backend, JobMonitor::new());
        ctx.release();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "cancel",
                "cancel",
                "release_disc",
                "release_drive",
                "release_drive_info",
                "finish",
            ]
        );
    }

    #[test]
    fn release_forgets_a_grabbing_drive() {
        let backend = ScriptedBackend::new(vec![
            (DriveStatus::Grabbing, snap(0, 0, 0)),
            (DriveStatus::Idle, snap(0, 0, 0)),
        ]);
        let calls = backend.calls();

        let ctx = BurnContext::new(backend, JobMonitor::new());
        ctx.release();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "forget",
                "release_disc",
                "release_drive",
                "release_drive_info",
                "finish",
            ]
        );
    }

    #[test]
    fn idle_drive_releases_immediately() {
        let backend = ScriptedBackend::new(vec![]);
        let calls = backend.calls();

        let ctx = BurnContext::new(backend, JobMonitor::new());
        ctx.release();

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["release_disc", "release_drive", "release_drive_info", "finish"]
        );
    }
}
