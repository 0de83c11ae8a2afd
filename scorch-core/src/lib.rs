//! The core, UI-agnostic engine for the `scorch` optical media burner.
//!
//! `scorch-core` is designed to be used as a library by any front-end,
//! whether it's a command-line interface (like `scorch`) or a graphical
//! user interface. It turns heterogeneous content sources (audio streams,
//! filesystem trees, disc images, whole discs) into a chain of processing
//! stages ending in a supervised write to a physical or virtual drive.
//!
//! The library is structured into several key modules:
//! - [`track`]: Typed content descriptors (the data a session writes).
//! - [`job`]: The contract every pipeline stage implements, with its
//!   lifecycle and shared progress monitor.
//! - [`pipeline`]: Composes a chain of jobs from a source track to the
//!   format the backend requires, then drives it in order.
//! - [`staging`]: A concrete job that mirrors remote content into local
//!   storage before downstream stages run.
//! - [`engine`]: The drive supervision state machine over a
//!   [`engine::DriveBackend`].
//! - [`direct`]: A backend that burns straight to a block device file.
//! - [`verify`]: Checksum verification of written media.
//! - [`platform`]: Platform-specific optical drive discovery.
//!
//! Operations are asynchronous in nature and report progress through a
//! polled [`job::JobMonitor`], so the calling application can display it
//! any way it chooses.
//!
//! ## Example: Burning an Image with Supervision
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use std::time::Duration;
//!
//! use scorch_core::direct::DirectWriteBackend;
//! use scorch_core::engine::{BurnContext, EnginePoll};
//! use scorch_core::job::{Cap, IoMode, JobMonitor};
//! use scorch_core::pipeline::{ChainOutcome, Pipeline};
//! use scorch_core::staging::{LocalFetcher, LocalStagingJob};
//! use scorch_core::track::{Track, TrackContent, TrackKind};
//!
//! fn main() -> anyhow::Result<()> {
//!     // Stage the session content locally first.
//!     let staging_dir = tempfile::tempdir()?;
//!     let mut pipeline = Pipeline::new();
//!     pipeline.register(Box::new(LocalStagingJob::new(
//!         Arc::new(LocalFetcher),
//!         staging_dir.path(),
//!     )));
//!
//!     let cancel = AtomicBool::new(false);
//!     let track = Track::image("/path/to/image.iso", None);
//!     let terminal = Cap::new(TrackKind::Image, IoMode::File);
//!     let outcome = pipeline.run(track, terminal, &cancel, |_, report| {
//!         println!("{}: {:.0}%", report.action, report.fraction * 100.0);
//!     })?;
//!
//!     let ChainOutcome::Completed(track) = outcome else {
//!         return Ok(());
//!     };
//!     let TrackContent::Image { source, .. } = track.content() else {
//!         unreachable!();
//!     };
//!
//!     // Burn the staged image and supervise the drive to completion.
//!     let backend = DirectWriteBackend::burn(Path::new(source), Path::new("/dev/sr0"))?;
//!     let mut ctx = BurnContext::new(backend, JobMonitor::new());
//!     loop {
//!         match ctx.poll()? {
//!             EnginePoll::Retry => std::thread::sleep(Duration::from_millis(200)),
//!             EnginePoll::Complete => break,
//!         }
//!     }
//!     ctx.release();
//!
//!     println!("Burn complete!");
//!     Ok(())
//! }
//! ```

pub mod direct;
pub mod drive;
pub mod engine;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod platform;
pub mod staging;
pub mod track;
pub mod uri;
pub mod verify;

/// Fixed size of one addressable sector of optical media, in bytes.
pub const SECTOR_SIZE: u64 = 2048;
