//! Utility functions

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Relative path of one stored slice within a series directory
pub fn slice_path(image_number: u32) -> String {
    format!("slices/{:08}.raw", image_number)
}

/// Relative path of the metadata document within a series directory
pub const VOLUME_METADATA_FILE: &str = "volume.json";
