//! Decides whether written content matches an expected checksum.
//!
//! Two modes exist: an external sidecar file supplies one checksum that is
//! compared against a digest of the whole medium, or the disc carries its
//! own manifest of per-file checksums and every entry is validated. A
//! mismatch is not an error: it is an enumerable result the user can act
//! on. Errors are reserved for checks that could not be performed at all.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use log::debug;
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::error::{BurnError, BurnResult};
use crate::job::{BurnAction, JobMonitor};
use crate::staging::{read_fixed_checksum, Fetcher};
use crate::track::{ChecksumKind, Track, TrackContent};
use crate::uri;
use crate::SECTOR_SIZE;

/// Name of the per-file checksum manifest a disc may carry in its root.
pub const CHECKSUM_MANIFEST: &str = "checksum.md5";

const BUFFER_SIZE: usize = 1024 * 1024;

/// Result of a performed check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// No mismatches.
    Success,
    /// The check ran, but these items did not match.
    BadChecksum(Vec<String>),
}

/// Orchestrates computing, reading and comparing checksums over a track.
pub struct ChecksumVerifier {
    fetcher: Arc<dyn Fetcher>,
    monitor: Arc<JobMonitor>,
    cancel: Arc<AtomicBool>,
}

impl ChecksumVerifier {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        monitor: Arc<JobMonitor>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            fetcher,
            monitor,
            cancel,
        }
    }

    /// Compares the digest of the track's whole content against the value
    /// held by the sidecar file at `sidecar_uri`. A remote sidecar is
    /// staged to a temporary file first and removed right after the read.
    pub fn check_against_sidecar(
        &self,
        track: &Track,
        sidecar_uri: &str,
    ) -> BurnResult<VerifyOutcome> {
        let expected = self.read_sidecar(sidecar_uri)?;
        let path = content_path(track)?;
        let limit = byte_len(track, &path)?;

        debug!("checking {} against {sidecar_uri}", path.display());
        let actual = self.digest_path(ChecksumKind::Md5, &path, Some(limit))?;

        if actual == expected {
            Ok(VerifyOutcome::Success)
        } else {
            Ok(VerifyOutcome::BadChecksum(vec![path.display().to_string()]))
        }
    }

    /// Validates every entry of the `checksum.md5` manifest under `root`
    /// (a mounted disc), collecting the files that fail. A manifest entry
    /// whose file is missing counts as a mismatch; anything that prevents
    /// reading an existing file aborts the check.
    pub fn check_manifest(&self, root: &Path) -> BurnResult<VerifyOutcome> {
        let text = fs::read_to_string(root.join(CHECKSUM_MANIFEST))?;
        let entries = parse_manifest(&text)?;

        let mut wrong = Vec::new();
        for (index, (expected, rel)) in entries.iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(BurnError::Cancelled);
            }
            self.monitor.set_fraction(index as f64 / entries.len() as f64);

            match self.digest_path(ChecksumKind::Md5, &root.join(rel), None) {
                Ok(actual) if actual == *expected => {}
                Ok(_) => wrong.push(rel.clone()),
                Err(BurnError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    wrong.push(rel.clone());
                }
                Err(err) => return Err(err),
            }
        }
        self.monitor.set_fraction(1.0);

        if wrong.is_empty() {
            Ok(VerifyOutcome::Success)
        } else {
            Ok(VerifyOutcome::BadChecksum(wrong))
        }
    }

    /// Post-burn verification: digests the source image and the written
    /// target in lockstep and compares the two.
    pub fn check_target_against_image(
        &self,
        image: &Path,
        target: &Path,
    ) -> BurnResult<VerifyOutcome> {
        let mut image_file = File::open(image)?;
        let mut target_file = File::open(target)?;
        let image_len = image_file.metadata()?.len();

        self.monitor.set_action(
            BurnAction::Checksumming,
            Some("Verifying written data".into()),
        );

        let mut image_hasher = Md5::new();
        let mut target_hasher = Md5::new();
        let mut image_buf = vec![0u8; BUFFER_SIZE];
        let mut target_buf = vec![0u8; BUFFER_SIZE];

        let mut remaining = image_len;
        while remaining > 0 {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(BurnError::Cancelled);
            }

            let chunk = std::cmp::min(BUFFER_SIZE as u64, remaining) as usize;
            image_file.read_exact(&mut image_buf[..chunk])?;
            target_file.read_exact(&mut target_buf[..chunk])?;

            image_hasher.update(&image_buf[..chunk]);
            target_hasher.update(&target_buf[..chunk]);

            remaining -= chunk as u64;
            let done = image_len - remaining;
            self.monitor.set_written(done);
            self.monitor.set_fraction(done as f64 / image_len as f64);
        }

        if image_hasher.finalize() == target_hasher.finalize() {
            Ok(VerifyOutcome::Success)
        } else {
            Ok(VerifyOutcome::BadChecksum(vec![target.display().to_string()]))
        }
    }

    fn read_sidecar(&self, sidecar_uri: &str) -> BurnResult<String> {
        if let Some(path) = uri::local_path(sidecar_uri) {
            return read_fixed_checksum(&path, ChecksumKind::Md5);
        }

        self.monitor.set_action(
            BurnAction::FileCopy,
            Some("Downloading checksum file".into()),
        );
        let temp = tempfile::NamedTempFile::new()?;
        self.fetcher
            .copy_file(sidecar_uri, temp.path(), &self.cancel, &mut |_| {})?;
        read_fixed_checksum(temp.path(), ChecksumKind::Md5)
        // `temp` drops here, removing the staged sidecar immediately.
    }

    /// Streaming digest of `path`, bounded to `limit` bytes when the
    /// track's bounds are known.
    fn digest_path(
        &self,
        kind: ChecksumKind,
        path: &Path,
        limit: Option<u64>,
    ) -> BurnResult<String> {
        self.monitor.set_action(
            BurnAction::Checksumming,
            Some(format!(
                "Checking `{}`",
                path.file_name().unwrap_or(path.as_os_str()).to_string_lossy()
            )),
        );
        let file = File::open(path)?;
        match kind {
            ChecksumKind::Md5 => self.digest_reader::<Md5>(file, limit),
            ChecksumKind::Sha256 => self.digest_reader::<Sha256>(file, limit),
        }
    }

    fn digest_reader<D: Digest>(&self, mut file: File, limit: Option<u64>) -> BurnResult<String> {
        let mut hasher = D::new();
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut remaining = limit;
        let mut total = 0u64;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(BurnError::Cancelled);
            }

            let want = match remaining {
                Some(0) => break,
                Some(left) => std::cmp::min(BUFFER_SIZE as u64, left) as usize,
                None => BUFFER_SIZE,
            };
            let n = file.read(&mut buffer[..want])?;
            if n == 0 {
                if let Some(left) = remaining {
                    return Err(BurnError::Internal(anyhow!(
                        "the medium ended {left} bytes before the expected length"
                    )));
                }
                break;
            }

            hasher.update(&buffer[..n]);
            total += n as u64;
            if let Some(left) = &mut remaining {
                *left -= n as u64;
            }
            self.monitor.set_written(total);
            if let Some(limit) = limit {
                if limit > 0 {
                    self.monitor.set_fraction(total as f64 / limit as f64);
                }
            }
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

/// The path holding the track's raw content.
fn content_path(track: &Track) -> BurnResult<PathBuf> {
    match track.content() {
        TrackContent::Disc { device } => Ok(device.clone()),
        TrackContent::Image { source, .. } | TrackContent::Audio { source } => {
            uri::local_path(source).ok_or_else(|| BurnError::NotLocal(source.clone()))
        }
        TrackContent::Data { .. } => Err(BurnError::Internal(anyhow!(
            "data tracks are checked through their on-disc manifest"
        ))),
    }
}

/// Content length in bytes: the track bounds when known, the file length
/// otherwise.
fn byte_len(track: &Track, path: &Path) -> BurnResult<u64> {
    if let Some(sectors) = track.bounds().len {
        return Ok(sectors * SECTOR_SIZE);
    }
    let len = fs::metadata(path)?.len();
    if len == 0 {
        return Err(BurnError::Internal(anyhow!(
            "cannot determine the medium length; set the track bounds"
        )));
    }
    Ok(len)
}

/// Parses md5sum-style manifest text into (hex, relative path) pairs.
fn parse_manifest(text: &str) -> BurnResult<Vec<(String, String)>> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((hex, rest)) = line.split_once(char::is_whitespace) else {
            return Err(BurnError::Internal(anyhow!(
                "malformed checksum manifest line: {line}"
            )));
        };
        if hex.len() != ChecksumKind::Md5.hex_len()
            || !hex.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(BurnError::Internal(anyhow!(
                "malformed checksum manifest line: {line}"
            )));
        }
        // A leading `*` marks binary mode in md5sum output.
        let rel = rest.trim_start().trim_start_matches('*');
        entries.push((hex.to_ascii_lowercase(), rel.to_string()));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::staging::testutil::FakeFetcher;
    use crate::staging::LocalFetcher;
    use crate::track::TrackBounds;

    fn md5_hex(data: &[u8]) -> String {
        hex::encode(Md5::digest(data))
    }

    fn verifier_with(fetcher: Arc<dyn Fetcher>) -> ChecksumVerifier {
        ChecksumVerifier::new(fetcher, JobMonitor::new(), Arc::new(AtomicBool::new(false)))
    }

    fn local_verifier() -> ChecksumVerifier {
        verifier_with(Arc::new(LocalFetcher))
    }

    #[test]
    fn manifest_reports_exactly_the_mismatched_file() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("one.txt"), b"first file").unwrap();
        fs::write(root.path().join("two.txt"), b"second file").unwrap();
        fs::write(root.path().join("three.txt"), b"third file").unwrap();

        let manifest = format!(
            "{}  one.txt\n{}  two.txt\n{}  three.txt\n",
            md5_hex(b"first file"),
            md5_hex(b"tampered content"),
            md5_hex(b"third file"),
        );
        fs::write(root.path().join(CHECKSUM_MANIFEST), manifest).unwrap();

        let outcome = local_verifier().check_manifest(root.path()).unwrap();
        assert_eq!(
            outcome,
            VerifyOutcome::BadChecksum(vec!["two.txt".to_string()])
        );
    }

    #[test]
    fn manifest_success_when_everything_matches() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("a.bin"), b"payload").unwrap();
        fs::write(
            root.path().join(CHECKSUM_MANIFEST),
            format!("{}  a.bin\n", md5_hex(b"payload")),
        )
        .unwrap();

        let outcome = local_verifier().check_manifest(root.path()).unwrap();
        assert_eq!(outcome, VerifyOutcome::Success);
    }

    #[test]
    fn manifest_entry_for_a_missing_file_is_a_mismatch() {
        let root = TempDir::new().unwrap();
        fs::write(
            root.path().join(CHECKSUM_MANIFEST),
            format!("{}  gone.bin\n", md5_hex(b"whatever")),
        )
        .unwrap();

        let outcome = local_verifier().check_manifest(root.path()).unwrap();
        assert_eq!(
            outcome,
            VerifyOutcome::BadChecksum(vec!["gone.bin".to_string()])
        );
    }

    #[test]
    fn missing_manifest_cannot_be_checked() {
        let root = TempDir::new().unwrap();
        let err = local_verifier().check_manifest(root.path()).unwrap_err();
        assert!(matches!(err, BurnError::Io(_)));
    }

    #[test]
    fn sidecar_check_honors_track_bounds() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("virtual-disc");
        let mut content = vec![0xA5u8; SECTOR_SIZE as usize];
        content.extend(vec![0u8; SECTOR_SIZE as usize]);
        fs::write(&device, &content).unwrap();

        // Only the first sector is session data.
        let sidecar = dir.path().join("disc.md5");
        fs::write(&sidecar, md5_hex(&content[..SECTOR_SIZE as usize])).unwrap();

        let mut track = Track::disc(&device);
        track.set_bounds(TrackBounds {
            start: 0,
            len: Some(1),
            pad: 0,
        });

        let outcome = local_verifier()
            .check_against_sidecar(&track, &sidecar.to_string_lossy())
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::Success);
    }

    #[test]
    fn sidecar_mismatch_is_an_outcome_not_an_error() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("image.iso");
        fs::write(&image, b"actual content").unwrap();

        let sidecar = dir.path().join("image.iso.md5");
        fs::write(&sidecar, md5_hex(b"expected content")).unwrap();

        let track = Track::image(image.to_string_lossy(), None);
        let outcome = local_verifier()
            .check_against_sidecar(&track, &sidecar.to_string_lossy())
            .unwrap();
        assert_eq!(
            outcome,
            VerifyOutcome::BadChecksum(vec![image.display().to_string()])
        );
    }

    #[test]
    fn remote_sidecar_is_staged_read_and_discarded() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("image.iso");
        fs::write(&image, b"abc").unwrap();

        let mut fetcher = FakeFetcher::default();
        fetcher.files.insert(
            "sftp://host/image.iso.md5".into(),
            md5_hex(b"abc").into_bytes(),
        );
        let fetcher = Arc::new(fetcher);

        let track = Track::image(image.to_string_lossy(), None);
        let verifier = verifier_with(Arc::clone(&fetcher) as Arc<dyn Fetcher>);
        let outcome = verifier
            .check_against_sidecar(&track, "sftp://host/image.iso.md5")
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::Success);
        assert_eq!(fetcher.copies(), 1);
    }

    #[test]
    fn target_matches_its_source_image() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("image.iso");
        let good = dir.path().join("good-disc");
        let bad = dir.path().join("bad-disc");

        fs::write(&image, b"session data").unwrap();
        // The written target carries sector padding beyond the image.
        fs::write(&good, b"session data\0\0\0\0").unwrap();
        fs::write(&bad, b"session d\xFFta\0\0\0\0").unwrap();

        let verifier = local_verifier();
        assert_eq!(
            verifier.check_target_against_image(&image, &good).unwrap(),
            VerifyOutcome::Success
        );
        assert_eq!(
            verifier.check_target_against_image(&image, &bad).unwrap(),
            VerifyOutcome::BadChecksum(vec![bad.display().to_string()])
        );
    }

    #[test]
    fn cancelled_check_unwinds_with_cancelled() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("a.bin"), b"payload").unwrap();
        fs::write(
            root.path().join(CHECKSUM_MANIFEST),
            format!("{}  a.bin\n", md5_hex(b"payload")),
        )
        .unwrap();

        let cancel = Arc::new(AtomicBool::new(true));
        let verifier =
            ChecksumVerifier::new(Arc::new(LocalFetcher), JobMonitor::new(), cancel);
        let err = verifier.check_manifest(root.path()).unwrap_err();
        assert!(err.is_cancelled());
    }
}
