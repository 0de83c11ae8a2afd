//! Composes and drives chains of jobs.
//!
//! The scheduler part is pure: given a source capability and the terminal
//! capability the write backend requires, [`Pipeline::plan`] produces an
//! ordered list of registered jobs without starting anything. The driving
//! part, [`Pipeline::run`], executes a planned chain strictly in order on
//! the calling (control) thread using the engine-wide polling convention.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{BurnError, BurnResult};
use crate::job::{Cap, Job, JobPoll, JobState, ProgressReport};
use crate::track::Track;

/// Longest chain `plan()` will consider before declaring there is no route.
pub const MAX_CHAIN_LEN: usize = 8;

/// Cadence of the control loop. The control thread never blocks on a job;
/// it re-polls on this fixed interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Terminal result of a chain run.
#[derive(Debug)]
pub enum ChainOutcome {
    Completed(Track),
    Cancelled,
}

#[derive(Default)]
pub struct Pipeline {
    jobs: Vec<Box<dyn Job>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registration order is part of the contract: it is the final
    /// tie-breaker during composition.
    pub fn register(&mut self, job: Box<dyn Job>) {
        self.jobs.push(job);
    }

    pub fn jobs(&self) -> &[Box<dyn Job>] {
        &self.jobs
    }

    /// Composes a chain of job indices from `source` to `terminal`.
    ///
    /// Jobs flagged run-first lead the chain when they accept the source.
    /// After that, each step picks, among the jobs accepting the current
    /// capability, the one whose output is closest to `terminal`, breaking
    /// ties by priority and then registration order. Composition has no
    /// side effects and is deterministic for identical input.
    ///
    /// # Errors
    ///
    /// [`BurnError::NoRoute`] when no chain of at most [`MAX_CHAIN_LEN`]
    /// jobs connects `source` to `terminal`.
    pub fn plan(&self, source: Cap, terminal: Cap) -> BurnResult<Vec<usize>> {
        let no_route = || BurnError::NoRoute {
            from: source.to_string(),
            to: terminal.to_string(),
        };

        let mut chain = Vec::new();
        let mut used = vec![false; self.jobs.len()];
        let mut current = source;

        for (idx, job) in self.jobs.iter().enumerate() {
            if job.caps().is_run_first() && job.caps().accepts(current) {
                used[idx] = true;
                chain.push(idx);
            }
        }

        while current != terminal {
            if chain.len() >= MAX_CHAIN_LEN {
                return Err(no_route());
            }

            // idx, produced output, rank of that output, priority
            let mut best: Option<(usize, Cap, u8, u32)> = None;
            for (idx, job) in self.jobs.iter().enumerate() {
                if used[idx] || !job.caps().accepts(current) {
                    continue;
                }
                let Some((out, rank)) = job.caps().best_output(terminal) else {
                    continue;
                };
                let priority = job.caps().priority();
                let better = match best {
                    None => true,
                    Some((_, _, best_rank, best_priority)) => {
                        rank < best_rank || (rank == best_rank && priority > best_priority)
                    }
                };
                if better {
                    best = Some((idx, out, rank, priority));
                }
            }

            let Some((idx, out, _, _)) = best else {
                return Err(no_route());
            };
            used[idx] = true;
            chain.push(idx);
            current = out;
        }

        debug!(
            "planned chain {} -> {}: {:?}",
            source,
            terminal,
            chain
                .iter()
                .map(|&i| self.jobs[i].name())
                .collect::<Vec<_>>()
        );
        Ok(chain)
    }

    /// Runs `source` through a freshly planned chain to `terminal`.
    ///
    /// Jobs execute strictly in chain order; a successor never starts
    /// before its predecessor reported Done with an output track. `cancel`
    /// is checked every poll round and mapped onto the active job's
    /// `stop()`. `observe` receives the active job's index and latest
    /// progress once per round.
    pub fn run<F>(
        &mut self,
        source: Track,
        terminal: Cap,
        cancel: &AtomicBool,
        mut observe: F,
    ) -> BurnResult<ChainOutcome>
    where
        F: FnMut(usize, &ProgressReport),
    {
        let start = Cap::new(source.kind(), crate::job::IoMode::File);
        let chain = self.plan(start, terminal)?;

        let mut track = source;
        for &idx in &chain {
            if cancel.load(Ordering::SeqCst) {
                return Ok(ChainOutcome::Cancelled);
            }

            let job = &mut self.jobs[idx];
            debug!("starting job {}", job.name());
            job.start(track)?;

            track = loop {
                if cancel.load(Ordering::SeqCst) && job.state() == JobState::Running {
                    job.stop();
                }
                match job.poll()? {
                    JobPoll::Retry => {
                        observe(idx, &job.monitor().snapshot());
                        thread::sleep(POLL_INTERVAL);
                    }
                    JobPoll::Finished(output) => break output,
                    JobPoll::Cancelled => return Ok(ChainOutcome::Cancelled),
                }
            };
            observe(idx, &job.monitor().snapshot());
        }

        Ok(ChainOutcome::Completed(track))
    }
}
