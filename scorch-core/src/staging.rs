//! Mirrors remote track content into local storage.
//!
//! Downstream stages require local-file access, so this job runs first in
//! any chain whose track references non-local locators. It discovers every
//! referenced locator, deduplicates against already-staged ancestors,
//! pre-computes the total transfer size, then copies sequentially on a
//! dedicated worker thread. The worker never touches shared track state:
//! it records a single result that the control thread publishes during
//! `poll()`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::anyhow;
use log::{debug, warn};

use crate::error::{BurnError, BurnResult};
use crate::job::{
    BurnAction, Cap, IoMode, Job, JobCaps, JobMonitor, JobPoll, JobState,
};
use crate::track::{Checksum, ChecksumKind, Track, TrackContent, TrackKind};
use crate::uri;

/// Scheme of virtualized locators that are already backed by a staged
/// local file. Resolved through [`Fetcher::backing_file`], never copied.
pub const PROXY_SCHEME: &str = "proxy";

/// Priority of the staging stage during chain composition.
const STAGING_PRIORITY: u32 = 10;

/// Permissions for directories created under the staging area.
#[cfg(unix)]
const STAGED_DIR_MODE: u32 = 0o700;

const COPY_CHUNK: usize = 64 * 1024;

/// What a locator points at, as reported by a [`Fetcher`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entry {
    File { size: u64 },
    Directory,
}

/// Content access used by the staging job and the checksum verifier.
///
/// Implementations cover one or more URI schemes; the crate ships
/// [`LocalFetcher`] for local paths and `file://`. Remote schemes plug in
/// through this trait.
pub trait Fetcher: Send + Sync {
    /// Classifies `uri`, reporting the size when it is a file.
    fn probe(&self, uri: &str) -> BurnResult<Entry>;

    /// Child names (not full locators) of the directory at `uri`.
    fn list(&self, uri: &str) -> BurnResult<Vec<String>>;

    /// Copies the file at `uri` to `dest`, reporting the bytes copied so
    /// far through `on_copied` and honoring `cancel` between chunks.
    fn copy_file(
        &self,
        uri: &str,
        dest: &Path,
        cancel: &AtomicBool,
        on_copied: &mut dyn FnMut(u64),
    ) -> BurnResult<()>;

    /// Resolves a `proxy://` locator to the local file backing it.
    fn backing_file(&self, uri: &str) -> BurnResult<PathBuf>;
}

/// [`Fetcher`] over the local filesystem.
pub struct LocalFetcher;

impl LocalFetcher {
    fn path_of(uri: &str) -> BurnResult<PathBuf> {
        uri::local_path(uri).ok_or_else(|| BurnError::NotLocal(uri.to_string()))
    }
}

impl Fetcher for LocalFetcher {
    fn probe(&self, uri: &str) -> BurnResult<Entry> {
        let meta = fs::metadata(Self::path_of(uri)?)?;
        if meta.is_dir() {
            Ok(Entry::Directory)
        } else {
            Ok(Entry::File { size: meta.len() })
        }
    }

    fn list(&self, uri: &str) -> BurnResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(Self::path_of(uri)?)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn copy_file(
        &self,
        uri: &str,
        dest: &Path,
        cancel: &AtomicBool,
        on_copied: &mut dyn FnMut(u64),
    ) -> BurnResult<()> {
        let mut src = fs::File::open(Self::path_of(uri)?)?;
        let mut out = fs::File::create(dest)?;
        let mut buffer = vec![0u8; COPY_CHUNK];
        let mut copied = 0u64;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(BurnError::Cancelled);
            }
            let n = src.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            std::io::Write::write_all(&mut out, &buffer[..n])?;
            copied += n as u64;
            on_copied(copied);
        }
        Ok(())
    }

    fn backing_file(&self, uri: &str) -> BurnResult<PathBuf> {
        Err(BurnError::NotLocal(uri.to_string()))
    }
}

/// What the worker hands back to the control thread.
struct StagedContent {
    /// Sidecar checksum, when one could be staged and read.
    checksum: Option<String>,
}

/// A concrete [`Job`] that downloads remote content to local storage
/// before downstream stages run.
pub struct LocalStagingJob {
    caps: JobCaps,
    state: JobState,
    monitor: Arc<JobMonitor>,
    fetcher: Arc<dyn Fetcher>,
    staging_dir: PathBuf,
    alloc_count: usize,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    rx: Option<Receiver<BurnResult<StagedContent>>>,
    input: Option<Track>,
    /// Locator → staged local path. Persists across runs so content already
    /// mirrored by an earlier run is not staged again.
    staged: BTreeMap<String, PathBuf>,
    cancelled: bool,
}

impl LocalStagingJob {
    /// `staging_dir` is where mirrored content lands. Its cleanup belongs
    /// to the owning session, not to this job.
    pub fn new(fetcher: Arc<dyn Fetcher>, staging_dir: impl Into<PathBuf>) -> Self {
        let all_kinds = [
            TrackKind::Audio,
            TrackKind::Data,
            TrackKind::Image,
            TrackKind::Disc,
        ];
        let caps: Vec<Cap> = all_kinds
            .iter()
            .map(|&kind| Cap::new(kind, IoMode::File))
            .collect();
        Self {
            caps: JobCaps::new(caps.clone(), caps, STAGING_PRIORITY).run_first(),
            state: JobState::Idle,
            monitor: JobMonitor::new(),
            fetcher,
            staging_dir: staging_dir.into(),
            alloc_count: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            worker: None,
            rx: None,
            input: None,
            staged: BTreeMap::new(),
            cancelled: false,
        }
    }

    /// Every locator the input track references, in a stable order.
    fn referenced_locators(track: &Track) -> Vec<String> {
        match track.content() {
            TrackContent::Audio { source } => vec![source.clone()],
            TrackContent::Data { grafts, excluded } => grafts
                .iter()
                .map(|g| g.uri.clone())
                .chain(excluded.iter().cloned())
                .collect(),
            TrackContent::Image { source, toc } => {
                let mut uris = vec![source.clone()];
                if let Some(toc) = toc {
                    uris.push(toc.clone());
                }
                uris
            }
            TrackContent::Disc { .. } => Vec::new(),
        }
    }

    fn allocate_dest(&mut self) -> PathBuf {
        self.alloc_count += 1;
        self.staging_dir.join(format!("staged-{:03}", self.alloc_count))
    }

    /// Registers `locator` for staging unless it is local, already staged,
    /// or virtual (`proxy://`, resolved through the backing-file query).
    fn add_if_non_local(&mut self, locator: &str) -> BurnResult<()> {
        if uri::is_local(locator) || self.staged.contains_key(locator) {
            return Ok(());
        }

        if uri::scheme(locator) == Some(PROXY_SCHEME) {
            let backing = self.fetcher.backing_file(locator)?;
            self.staged.insert(locator.to_string(), backing);
            return Ok(());
        }

        let dest = self.allocate_dest();
        self.staged.insert(locator.to_string(), dest);
        Ok(())
    }

    fn has_staged_ancestor(&self, locator: &str) -> bool {
        let mut parent = uri::parent(locator);
        while let Some(p) = parent {
            if self.staged.contains_key(&p) {
                return true;
            }
            parent = uri::parent(&p);
        }
        false
    }

    /// Rewrites one locator to its staged local equivalent. Local locators
    /// pass through; staged ones map directly; everything else resolves
    /// through the nearest staged ancestor by prefix substitution.
    fn translate(&self, locator: &str) -> BurnResult<String> {
        if uri::is_local(locator) {
            return Ok(locator.to_string());
        }
        if let Some(path) = self.staged.get(locator) {
            return Ok(path.to_string_lossy().into_owned());
        }
        let mut parent = uri::parent(locator);
        while let Some(p) = parent {
            if let Some(base) = self.staged.get(&p) {
                return Ok(format!("{}{}", base.display(), &locator[p.len()..]));
            }
            parent = uri::parent(&p);
        }
        Err(BurnError::NotLocal(locator.to_string()))
    }

    /// Publishes the output track: the handoff point where locators are
    /// rewritten and the lifecycle completes on the control thread.
    fn finish(&mut self, checksum: Option<String>) -> BurnResult<JobPoll> {
        match self.publish(checksum) {
            Ok(output) => {
                self.monitor.set_fraction(1.0);
                self.state = JobState::Done;
                Ok(JobPoll::Finished(output))
            }
            Err(err) => {
                self.state = JobState::Failed;
                Err(err)
            }
        }
    }

    fn publish(&mut self, checksum: Option<String>) -> BurnResult<Track> {
        let input = self
            .input
            .take()
            .ok_or_else(|| BurnError::Internal(anyhow!("staging input already consumed")))?;

        let content = match input.content() {
            TrackContent::Audio { source } => TrackContent::Audio {
                source: self.translate(source)?,
            },
            TrackContent::Data { grafts, excluded } => TrackContent::Data {
                grafts: grafts
                    .iter()
                    .map(|g| {
                        Ok(crate::track::GraftPoint {
                            path: g.path.clone(),
                            uri: self.translate(&g.uri)?,
                        })
                    })
                    .collect::<BurnResult<_>>()?,
                excluded: excluded
                    .iter()
                    .map(|uri| self.translate(uri))
                    .collect::<BurnResult<_>>()?,
            },
            TrackContent::Image { source, toc } => TrackContent::Image {
                source: self.translate(source)?,
                toc: toc.as_ref().map(|t| self.translate(t)).transpose()?,
            },
            TrackContent::Disc { device } => TrackContent::Disc {
                device: device.clone(),
            },
        };

        let mut output = input.retyped(content);
        if let Some(hex) = checksum {
            output.set_checksum(Checksum::Value {
                kind: ChecksumKind::Md5,
                hex,
            });
        }
        Ok(output)
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.rx = None;
    }
}

impl Job for LocalStagingJob {
    fn name(&self) -> &str {
        "local-staging"
    }

    fn caps(&self) -> &JobCaps {
        &self.caps
    }

    fn state(&self) -> JobState {
        self.state
    }

    fn monitor(&self) -> &Arc<JobMonitor> {
        &self.monitor
    }

    fn start(&mut self, input: Track) -> BurnResult<()> {
        if matches!(self.state, JobState::Running | JobState::Cancelling) {
            return Err(BurnError::AlreadyRunning);
        }

        self.monitor.reset();
        self.cancel = Arc::new(AtomicBool::new(false));
        self.cancelled = false;

        // Discovery runs on the control thread, before any worker exists.
        let already_staged: Vec<String> = self.staged.keys().cloned().collect();
        for locator in Self::referenced_locators(&input) {
            self.add_if_non_local(&locator)?;
        }

        // A locator whose ancestor is staged (or scheduled) is derived by
        // prefix substitution instead of being staged separately.
        let candidates: Vec<String> = self.staged.keys().cloned().collect();
        for locator in &candidates {
            if self.has_staged_ancestor(locator) {
                debug!("{locator} is covered by a staged ancestor");
                self.staged.remove(locator);
            }
        }

        let transfers: Vec<(String, PathBuf)> = self
            .staged
            .iter()
            .filter(|(locator, _)| {
                uri::scheme(locator) != Some(PROXY_SCHEME)
                    && !already_staged.contains(locator)
            })
            .map(|(locator, dest)| (locator.clone(), dest.clone()))
            .collect();

        // An image fetched from afar may have a checksum sidecar next to
        // it; staging it is attempted after the content, and failure to do
        // so is not fatal.
        let sidecar = match input.content() {
            TrackContent::Image { source, .. } if !uri::is_local(source) => {
                Some(format!("{source}.md5"))
            }
            _ => None,
        };

        self.input = Some(input);
        self.state = JobState::Running;

        if transfers.is_empty() {
            debug!("no foreign locators to stage");
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        let fetcher = Arc::clone(&self.fetcher);
        let cancel = Arc::clone(&self.cancel);
        let monitor = Arc::clone(&self.monitor);

        let handle = std::thread::Builder::new()
            .name("scorch-staging".into())
            .spawn(move || {
                let result = stage_worker(&*fetcher, &transfers, sidecar.as_deref(), &cancel, &monitor);
                match result {
                    // A cancelled worker reports nothing; stop() owns the
                    // lifecycle transition.
                    Err(BurnError::Cancelled) => {}
                    other => {
                        let _ = tx.send(other);
                    }
                }
            })
            .map_err(|e| BurnError::Internal(anyhow!("could not spawn staging worker: {e}")))?;

        self.worker = Some(handle);
        self.rx = Some(rx);
        Ok(())
    }

    fn poll(&mut self) -> BurnResult<JobPoll> {
        match self.state {
            JobState::Idle | JobState::Cancelling => Ok(JobPoll::Retry),
            JobState::Done => {
                if self.cancelled {
                    Ok(JobPoll::Cancelled)
                } else {
                    Ok(JobPoll::Retry)
                }
            }
            JobState::Failed => Err(BurnError::Internal(anyhow!("staging job already failed"))),
            JobState::Running => {
                let Some(rx) = &self.rx else {
                    // Synchronous completion: nothing needed staging.
                    return self.finish(None);
                };
                match rx.try_recv() {
                    Ok(Ok(content)) => {
                        self.join_worker();
                        self.finish(content.checksum)
                    }
                    Ok(Err(err)) => {
                        self.join_worker();
                        self.state = JobState::Failed;
                        Err(err)
                    }
                    Err(TryRecvError::Empty) => Ok(JobPoll::Retry),
                    Err(TryRecvError::Disconnected) => {
                        self.join_worker();
                        self.state = JobState::Failed;
                        Err(BurnError::Internal(anyhow!(
                            "staging worker exited without reporting a result"
                        )))
                    }
                }
            }
        }
    }

    fn stop(&mut self) {
        if self.state != JobState::Running {
            return;
        }
        self.state = JobState::Cancelling;
        self.cancel.store(true, Ordering::SeqCst);
        self.join_worker();
        self.input = None;
        self.cancelled = true;
        self.state = JobState::Done;
    }
}

/// Body of the staging worker thread: size pass, sequential transfer,
/// optional sidecar checksum.
fn stage_worker(
    fetcher: &dyn Fetcher,
    transfers: &[(String, PathBuf)],
    sidecar: Option<&str>,
    cancel: &AtomicBool,
    monitor: &JobMonitor,
) -> BurnResult<StagedContent> {
    monitor.set_action(BurnAction::FileCopy, Some("Copying files locally".into()));

    let mut total = 0u64;
    for (src, _) in transfers {
        total += tree_size(fetcher, src, cancel)?;
    }

    let mut copied = 0u64;
    for (src, dest) in transfers {
        if cancel.load(Ordering::SeqCst) {
            return Err(BurnError::Cancelled);
        }
        transfer(fetcher, src, dest, cancel, monitor, &mut copied, total)?;
    }

    let checksum = match sidecar {
        Some(sidecar_uri) => match stage_checksum(fetcher, sidecar_uri, cancel, monitor) {
            Ok(hex) => Some(hex),
            Err(BurnError::Cancelled) => return Err(BurnError::Cancelled),
            Err(err) => {
                warn!("could not stage checksum sidecar {sidecar_uri}: {err}");
                None
            }
        },
        None => None,
    };

    monitor.set_fraction(1.0);
    Ok(StagedContent { checksum })
}

/// Recursive size of the tree at `src`, computed before any transfer so
/// progress can be reported against a grand total.
fn tree_size(fetcher: &dyn Fetcher, src: &str, cancel: &AtomicBool) -> BurnResult<u64> {
    if cancel.load(Ordering::SeqCst) {
        return Err(BurnError::Cancelled);
    }
    match fetcher.probe(src)? {
        Entry::File { size } => Ok(size),
        Entry::Directory => {
            let mut total = 0u64;
            for name in fetcher.list(src)? {
                total += tree_size(fetcher, &format!("{src}/{name}"), cancel)?;
            }
            Ok(total)
        }
    }
}

fn transfer(
    fetcher: &dyn Fetcher,
    src: &str,
    dest: &Path,
    cancel: &AtomicBool,
    monitor: &JobMonitor,
    copied: &mut u64,
    total: u64,
) -> BurnResult<()> {
    match fetcher.probe(src)? {
        Entry::Directory => {
            make_staged_dir(dest)?;
            copy_tree(fetcher, src, dest, cancel, monitor, copied, total)
        }
        Entry::File { size } => copy_one(fetcher, src, dest, size, cancel, monitor, copied, total),
    }
}

fn copy_tree(
    fetcher: &dyn Fetcher,
    src: &str,
    dest: &Path,
    cancel: &AtomicBool,
    monitor: &JobMonitor,
    copied: &mut u64,
    total: u64,
) -> BurnResult<()> {
    for name in fetcher.list(src)? {
        if cancel.load(Ordering::SeqCst) {
            return Err(BurnError::Cancelled);
        }
        let child_src = format!("{src}/{name}");
        let child_dest = dest.join(&name);
        match fetcher.probe(&child_src)? {
            Entry::Directory => {
                make_staged_dir(&child_dest)?;
                copy_tree(fetcher, &child_src, &child_dest, cancel, monitor, copied, total)?;
            }
            Entry::File { size } => {
                copy_one(fetcher, &child_src, &child_dest, size, cancel, monitor, copied, total)?;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn copy_one(
    fetcher: &dyn Fetcher,
    src: &str,
    dest: &Path,
    size: u64,
    cancel: &AtomicBool,
    monitor: &JobMonitor,
    copied: &mut u64,
    total: u64,
) -> BurnResult<()> {
    monitor.set_action(
        BurnAction::FileCopy,
        Some(format!("Copying `{}` locally", uri::basename(src))),
    );
    let base = *copied;
    fetcher.copy_file(src, dest, cancel, &mut |current| {
        if total > 0 {
            monitor.set_fraction((base + current) as f64 / total as f64);
        }
    })?;
    *copied += size;
    Ok(())
}

fn make_staged_dir(path: &Path) -> BurnResult<()> {
    fs::create_dir_all(path).map_err(|source| BurnError::CreateDir {
        path: path.to_path_buf(),
        source,
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(STAGED_DIR_MODE)).map_err(
            |source| BurnError::CreateDir {
                path: path.to_path_buf(),
                source,
            },
        )?;
    }
    Ok(())
}

/// Stages the checksum sidecar to a temporary file, reads the fixed-width
/// hex value and removes the file again.
fn stage_checksum(
    fetcher: &dyn Fetcher,
    sidecar_uri: &str,
    cancel: &AtomicBool,
    monitor: &JobMonitor,
) -> BurnResult<String> {
    monitor.set_action(
        BurnAction::FileCopy,
        Some("Copying checksum file locally".into()),
    );

    let temp = tempfile::NamedTempFile::new()?;
    fetcher.copy_file(sidecar_uri, temp.path(), cancel, &mut |_| {})?;
    read_fixed_checksum(temp.path(), ChecksumKind::Md5)
    // `temp` drops here, removing the sidecar copy immediately.
}

/// Reads the leading fixed-width hex checksum from `path`.
pub(crate) fn read_fixed_checksum(path: &Path, kind: ChecksumKind) -> BurnResult<String> {
    let mut buffer = vec![0u8; kind.hex_len()];
    let mut file = fs::File::open(path)?;
    file.read_exact(&mut buffer)?;
    let text = std::str::from_utf8(&buffer)
        .map_err(|_| BurnError::Internal(anyhow!("checksum file is not text")))?;
    if !text.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BurnError::Internal(anyhow!(
            "checksum file does not hold a {}-character hex value",
            kind.hex_len()
        )));
    }
    Ok(text.to_ascii_lowercase())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// In-memory "remote" filesystem with copy counting.
    #[derive(Default)]
    pub(crate) struct FakeFetcher {
        pub files: BTreeMap<String, Vec<u8>>,
        pub dirs: Vec<String>,
        pub backing: BTreeMap<String, PathBuf>,
        pub copies: AtomicUsize,
        /// Artificial per-chunk delay, for cancellation tests.
        pub chunk_delay: Option<std::time::Duration>,
        /// Locators whose copy fails with an I/O error.
        pub fail_on: Vec<String>,
    }

    impl FakeFetcher {
        pub fn copies(&self) -> usize {
            self.copies.load(Ordering::SeqCst)
        }
    }

    impl Fetcher for FakeFetcher {
        fn probe(&self, uri: &str) -> BurnResult<Entry> {
            if self.dirs.iter().any(|d| d == uri) {
                return Ok(Entry::Directory);
            }
            match self.files.get(uri) {
                Some(data) => Ok(Entry::File {
                    size: data.len() as u64,
                }),
                None => Err(BurnError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{uri} does not exist"),
                ))),
            }
        }

        fn list(&self, uri: &str) -> BurnResult<Vec<String>> {
            let prefix = format!("{uri}/");
            let mut names: Vec<String> = self
                .files
                .keys()
                .chain(self.dirs.iter())
                .filter_map(|key| key.strip_prefix(&prefix))
                .filter(|rest| !rest.contains('/'))
                .map(str::to_string)
                .collect();
            names.sort();
            names.dedup();
            Ok(names)
        }

        fn copy_file(
            &self,
            uri: &str,
            dest: &Path,
            cancel: &AtomicBool,
            on_copied: &mut dyn FnMut(u64),
        ) -> BurnResult<()> {
            if self.fail_on.iter().any(|f| f == uri) {
                return Err(BurnError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!("{uri} is not readable"),
                )));
            }
            let data = self.files.get(uri).ok_or_else(|| {
                BurnError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{uri} does not exist"),
                ))
            })?;
            if let Some(delay) = self.chunk_delay {
                // Trickle in small chunks so tests can cancel mid-file.
                let mut written = 0usize;
                for chunk in data.chunks(1.max(data.len() / 8)) {
                    if cancel.load(Ordering::SeqCst) {
                        return Err(BurnError::Cancelled);
                    }
                    std::thread::sleep(delay);
                    written += chunk.len();
                    on_copied(written as u64);
                }
            }
            fs::write(dest, data)?;
            on_copied(data.len() as u64);
            self.copies.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn backing_file(&self, uri: &str) -> BurnResult<PathBuf> {
            self.backing
                .get(uri)
                .cloned()
                .ok_or_else(|| BurnError::NotLocal(uri.to_string()))
        }
    }
}
