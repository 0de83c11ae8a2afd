use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::Result;

use crate::drive::Drive;

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Scans for optical drives on a Linux system.
///
/// SCSI CD/DVD drives appear in `/sys/block` as `sr*` nodes, so discovery
/// is a walk over that directory. Vendor and model strings come from the
/// device's sysfs attributes; the mount point of a loaded medium is looked
/// up through `sysinfo`.
///
/// # Returns
///
/// A `Result<Vec<Drive>>` listing the discovered [`Drive`]s, or an error
/// when `/sys/block` cannot be read.
pub fn get_optical_drives() -> Result<Vec<Drive>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();

    let mut drives = Vec::new();
    let block_dir = fs::read_dir("/sys/block")?;

    for entry in block_dir.filter_map(Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        if !device_name.starts_with("sr") {
            continue;
        }

        let vendor = read_sys_file(&device_name, "device/vendor").unwrap_or_default();
        let model = read_sys_file(&device_name, "device/model").unwrap_or_default();
        let model = format!("{vendor} {model}").trim().to_string();

        let device_path = PathBuf::from("/dev/").join(&device_name);

        // A mounted medium shows up in the disk list under the device name.
        let mut mount_point = String::new();
        for disk in disks.iter() {
            if disk.name().to_string_lossy().starts_with(&device_name) {
                let mp = disk.mount_point().to_string_lossy().to_string();
                if !mp.is_empty() {
                    mount_point = mp;
                    break;
                }
            }
        }

        drives.push(Drive {
            path: device_path,
            name: device_name,
            model,
            mount_point,
        });
    }

    Ok(drives)
}
