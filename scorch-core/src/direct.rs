//! A write backend that burns straight to a block device file.
//!
//! This is the "virtual drive" of the engine: it implements the
//! [`DriveBackend`](crate::engine::DriveBackend) command set over plain
//! file I/O, so the same supervision loop that drives a native optical
//! library can burn an image to `/dev/srX`, a USB recorder or a regular
//! file. Writing happens on a worker thread with O_DIRECT sector-aligned
//! buffers; status and progress are published through shared atomics that
//! the `status()` query reads without blocking.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::anyhow;
use log::debug;

use crate::engine::{
    BackendMessage, DriveBackend, DriveStatus, MessageSeverity, ProgressSnapshot,
};
use crate::error::{BurnError, BurnResult};
use crate::SECTOR_SIZE;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

// Use a 1 MiB buffer for I/O operations.
const BUFFER_SIZE: usize = 1024 * 1024;

/// Fast blank wipes the leading region of the medium, which holds the
/// filesystem descriptors and table of contents.
const BLANK_REGION: u64 = 4 * 1024 * 1024;

#[cfg(unix)]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

const ST_IDLE: u8 = 0;
const ST_SPAWNING: u8 = 1;
const ST_LEADIN: u8 = 2;
const ST_WRITING: u8 = 3;
const ST_CLOSING: u8 = 4;
const ST_ERASING: u8 = 5;

fn decode_status(value: u8) -> DriveStatus {
    match value {
        ST_SPAWNING => DriveStatus::Spawning,
        ST_LEADIN => DriveStatus::WritingLeadIn,
        ST_WRITING => DriveStatus::Writing,
        ST_CLOSING => DriveStatus::ClosingSession,
        ST_ERASING => DriveStatus::Erasing,
        _ => DriveStatus::Idle,
    }
}

/// State shared between the worker thread and the status query.
#[derive(Default)]
struct Shared {
    status: AtomicU8,
    track: AtomicU32,
    sector: AtomicU64,
    sectors: AtomicU64,
    cancel: AtomicBool,
    messages: Mutex<VecDeque<BackendMessage>>,
}

impl Shared {
    fn set_status(&self, status: u8) {
        self.status.store(status, Ordering::SeqCst);
    }

    fn push_fatal(&self, text: String) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(BackendMessage {
                severity: MessageSeverity::Fatal,
                text,
            });
    }
}

/// The opened write target.
struct Target {
    file: File,
    /// Medium capacity in bytes. Known for block devices; a regular file
    /// target grows on demand.
    capacity: Option<u64>,
}

fn open_target(path: &Path) -> BurnResult<Target> {
    let meta = fs::metadata(path)?;

    #[cfg(unix)]
    let is_block = {
        use std::os::unix::fs::FileTypeExt;
        meta.file_type().is_block_device()
    };
    #[cfg(not(unix))]
    let is_block = false;

    let mut opts = OpenOptions::new();
    opts.write(true);
    #[cfg(unix)]
    if is_block {
        // Unbuffered I/O straight to the medium.
        opts.custom_flags(libc::O_DIRECT);
    }
    let file = opts.open(path).map_err(|_| BurnError::DriveBusy)?;

    let capacity = if is_block { device_capacity(&file) } else { None };
    Ok(Target { file, capacity })
}

/// Size of a block device in bytes, via the `BLKGETSIZE64` ioctl.
#[cfg(unix)]
fn device_capacity(file: &File) -> Option<u64> {
    use std::os::unix::io::AsRawFd;

    let mut size_bytes: u64 = 0;
    let res = unsafe { blkgetsize64(file.as_raw_fd(), &mut size_bytes) };
    match res {
        Ok(_) if size_bytes > 0 => Some(size_bytes),
        _ => None,
    }
}

#[cfg(not(unix))]
fn device_capacity(_file: &File) -> Option<u64> {
    None
}

/// Burns an image to a target, or blanks a target, on a worker thread.
pub struct DirectWriteBackend {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DirectWriteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectWriteBackend").finish_non_exhaustive()
    }
}

impl DirectWriteBackend {
    /// Starts burning `image` to the device (or file) at `device_path`.
    ///
    /// Both ends are opened here so a missing image or an unopenable
    /// device fails fast; the transfer itself runs on the worker and is
    /// supervised through [`crate::engine::BurnContext`].
    ///
    /// # Errors
    ///
    /// [`BurnError::DriveBusy`] when the target cannot be opened for
    /// writing, I/O errors for an unreadable image.
    pub fn burn(image: &Path, device_path: &Path) -> BurnResult<Self> {
        let image_file = File::open(image)?;
        let image_len = image_file.metadata()?.len();
        let target = open_target(device_path)?;

        if let Some(capacity) = target.capacity {
            if image_len > capacity {
                return Err(BurnError::Internal(anyhow!(
                    "the image ({image_len} bytes) does not fit the medium ({capacity} bytes)"
                )));
            }
        }

        Self::spawn("scorch-burn", move |shared| {
            write_image(shared, image_file, image_len, target)
        })
    }

    /// Starts a fast blank of the device (or file) at `device_path`.
    pub fn blank(device_path: &Path) -> BurnResult<Self> {
        let len = fs::metadata(device_path)?.len();
        let target = open_target(device_path)?;
        Self::spawn("scorch-blank", move |shared| {
            blank_target(shared, target, len)
        })
    }

    fn spawn<F>(name: &str, body: F) -> BurnResult<Self>
    where
        F: FnOnce(&Shared) -> BurnResult<()> + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        shared.set_status(ST_SPAWNING);

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                match body(&worker_shared) {
                    Ok(()) | Err(BurnError::Cancelled) => {}
                    Err(err) => worker_shared.push_fatal(err.to_string()),
                }
                worker_shared.set_status(ST_IDLE);
            })
            .map_err(|e| BurnError::Internal(anyhow!("could not spawn write worker: {e}")))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }
}

impl DriveBackend for DirectWriteBackend {
    fn status(&mut self) -> (DriveStatus, ProgressSnapshot) {
        let status = decode_status(self.shared.status.load(Ordering::SeqCst));
        let snapshot = ProgressSnapshot {
            track: self.shared.track.load(Ordering::SeqCst),
            sector: self.shared.sector.load(Ordering::SeqCst),
            sectors: self.shared.sectors.load(Ordering::SeqCst),
        };
        (status, snapshot)
    }

    fn pop_message(&mut self) -> Option<BackendMessage> {
        self.shared
            .messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn cancel(&mut self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
    }

    fn forget(&mut self) {
        // Nothing is ever half-grabbed here; cancelling covers it.
        self.shared.cancel.store(true, Ordering::SeqCst);
    }

    fn release_disc(&mut self) {}

    fn release_drive(&mut self) {
        // The worker owns the device handle; joining it drops the handle.
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn release_drive_info(&mut self) {}

    fn finish(&mut self) {
        debug!("direct write backend finished");
    }
}

fn write_image(
    shared: &Shared,
    mut image_file: File,
    image_len: u64,
    mut target: Target,
) -> BurnResult<()> {
    shared.track.store(1, Ordering::SeqCst);
    shared
        .sectors
        .store(image_len.div_ceil(SECTOR_SIZE), Ordering::SeqCst);
    shared.set_status(ST_LEADIN);

    // O_DIRECT requires the buffer to be memory-aligned; aligning to the
    // sector size satisfies every block size below it.
    let block = SECTOR_SIZE as usize;
    let mut buf = vec![0u8; BUFFER_SIZE + block];
    let offset = buf.as_ptr().align_offset(block);
    let buffer = &mut buf[offset..offset + BUFFER_SIZE];

    shared.set_status(ST_WRITING);

    let mut written: u64 = 0;
    while written < image_len {
        if shared.cancel.load(Ordering::SeqCst) {
            return Err(BurnError::Cancelled);
        }

        let to_read = std::cmp::min(BUFFER_SIZE as u64, image_len - written) as usize;
        image_file.read_exact(&mut buffer[..to_read])?;

        // The tail of the image may not fill a whole sector; pad it with
        // zeros so the write stays sector-aligned.
        let padded = to_read.next_multiple_of(block);
        if padded > to_read {
            buffer[to_read..padded].fill(0);
        }

        target.file.write_all(&buffer[..padded])?;
        written += to_read as u64;
        shared.sector.store(written / SECTOR_SIZE, Ordering::SeqCst);
    }

    target.file.flush()?;
    shared.set_status(ST_CLOSING);
    target.file.sync_all()?;
    Ok(())
}

fn blank_target(shared: &Shared, mut target: Target, len: u64) -> BurnResult<()> {
    let region = target.capacity.unwrap_or(len).min(BLANK_REGION);
    let region = region - region % SECTOR_SIZE;
    let sectors = region / SECTOR_SIZE;
    if sectors == 0 {
        return Ok(());
    }

    shared.sectors.store(sectors, Ordering::SeqCst);
    shared.set_status(ST_ERASING);

    let block = SECTOR_SIZE as usize;
    let mut buf = vec![0u8; BUFFER_SIZE + block];
    let offset = buf.as_ptr().align_offset(block);
    let buffer = &mut buf[offset..offset + BUFFER_SIZE];
    buffer.fill(0);

    let mut zeroed: u64 = 0;
    while zeroed < region {
        if shared.cancel.load(Ordering::SeqCst) {
            return Err(BurnError::Cancelled);
        }
        let chunk = std::cmp::min(BUFFER_SIZE as u64, region - zeroed) as usize;
        target.file.write_all(&buffer[..chunk])?;
        zeroed += chunk as u64;
        shared.sector.store(zeroed / SECTOR_SIZE, Ordering::SeqCst);
    }

    target.file.flush()?;
    target.file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::engine::{BurnContext, EnginePoll};
    use crate::job::JobMonitor;

    fn supervise(backend: DirectWriteBackend) -> BurnContext<DirectWriteBackend> {
        BurnContext::new(backend, JobMonitor::new())
    }

    fn poll_to_complete(ctx: &mut BurnContext<DirectWriteBackend>) {
        for _ in 0..2000 {
            match ctx.poll().expect("burn failed") {
                EnginePoll::Retry => std::thread::sleep(Duration::from_millis(2)),
                EnginePoll::Complete => return,
            }
        }
        panic!("backend never reached idle");
    }

    #[test]
    fn burns_an_image_to_a_file_target() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("image.iso");
        let device = dir.path().join("virtual-disc");

        let content: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&image, &content).unwrap();
        fs::write(&device, b"").unwrap();

        let backend = DirectWriteBackend::burn(&image, &device).unwrap();
        let mut ctx = supervise(backend);
        poll_to_complete(&mut ctx);
        ctx.release();

        let burned = fs::read(&device).unwrap();
        // Content matches, with the tail padded to a whole sector.
        assert_eq!(&burned[..content.len()], &content[..]);
        assert_eq!(burned.len() as u64, 3000u64.div_ceil(SECTOR_SIZE) * SECTOR_SIZE);
        assert!(burned[content.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn missing_image_fails_fast() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("virtual-disc");
        fs::write(&device, b"").unwrap();

        let err = DirectWriteBackend::burn(&dir.path().join("absent.iso"), &device).unwrap_err();
        assert!(matches!(err, BurnError::Io(_)));
    }

    #[test]
    fn missing_target_fails_fast() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("image.iso");
        fs::write(&image, b"data").unwrap();

        let err = DirectWriteBackend::burn(&image, &dir.path().join("no-such-device")).unwrap_err();
        // The metadata probe fails before the open is even attempted.
        assert!(matches!(err, BurnError::Io(_)));
    }

    #[test]
    fn blank_zero_fills_the_leading_region() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("virtual-disc");
        fs::write(&device, vec![0xFFu8; 2 * SECTOR_SIZE as usize]).unwrap();

        let backend = DirectWriteBackend::blank(&device).unwrap();
        let mut ctx = supervise(backend);
        poll_to_complete(&mut ctx);
        ctx.release();

        let blanked = fs::read(&device).unwrap();
        assert_eq!(blanked.len(), 2 * SECTOR_SIZE as usize);
        assert!(blanked.iter().all(|&b| b == 0));
    }
}
