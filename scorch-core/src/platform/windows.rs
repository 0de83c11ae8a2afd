use anyhow::Result;

use crate::drive::Drive;

/// Scans for optical drives on a Windows system.
///
/// # Returns
///
/// A `Result<Vec<Drive>>`.
///
/// # Panics
///
/// This function currently panics because Windows support is not yet
/// implemented.
pub fn get_optical_drives() -> Result<Vec<Drive>> {
    // TODO: Implement drive discovery for Windows through the IMAPI2
    // interfaces, which expose recorder enumeration and capabilities.
    unimplemented!("Windows support is not yet implemented.");
}
