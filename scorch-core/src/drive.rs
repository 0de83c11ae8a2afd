//! Cross-platform description of an optical drive.

use std::fmt;
use std::path::PathBuf;

/// An optical drive discovered on the system.
///
/// Populated by the platform-specific discovery functions in
/// [`crate::platform`]. The `path` is what gets handed to a write backend.
#[derive(Clone, Debug)]
pub struct Drive {
    /// The system path to the drive (e.g., `/dev/sr0`).
    pub path: PathBuf,
    /// The kernel-provided name of the drive (e.g., "sr0").
    pub name: String,
    /// Vendor and model strings, as reported by the drive.
    pub model: String,
    /// Mount point of the loaded medium, if one is mounted.
    pub mount_point: String,
}

impl fmt::Display for Drive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if self.mount_point.is_empty() {
            "[No mounted medium]".to_string()
        } else {
            format!("[Mounted at {}]", self.mount_point)
        };

        write!(f, "{:<12} {} {}", self.path.display(), self.model, mount_info)
    }
}
