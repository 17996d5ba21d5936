//! Temperature telemetry from the host's thermal zones.
//!
//! The installation runs in a closed vitrine; after each print we note the
//! CPU and radio temperatures so overheating shows up in the logs before it
//! shows up as a dead reader.

use log::{debug, info};
use std::{fs, path::Path};

const ZONES: &[(&str, &str)] = &[
    ("/sys/class/thermal/thermal_zone0/temp", "CPU"),
    ("/sys/class/thermal/thermal_zone1/temp", "WiFi"),
];

/// Read one thermal zone in degrees Celsius. Raw values are usually
/// millidegrees; plain degrees are accepted too. Out-of-range readings are
/// treated as sensor noise.
pub fn read_zone(path: &Path) -> Option<f64> {
    let raw = fs::read_to_string(path).ok()?;
    let value: f64 = raw.trim().parse().ok()?;
    let celsius = if value > 200.0 { value / 1000.0 } else { value };
    if (-30.0..120.0).contains(&celsius) {
        Some(celsius)
    } else {
        debug!(
            "discarding out-of-range reading {} from {}",
            celsius,
            path.display()
        );
        None
    }
}

/// Log every known zone at info level; unreadable zones are skipped quietly.
pub fn log_temperatures() {
    for (path, name) in ZONES {
        match read_zone(Path::new(path)) {
            Some(celsius) => info!("{} temperature: {:.1}°C", name, celsius),
            None => debug!("{} temperature unavailable", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zone_with(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp");
        write!(std::fs::File::create(&path).unwrap(), "{}", contents).unwrap();
        (dir, path)
    }

    #[test]
    fn millidegrees_are_scaled_down() {
        let (_dir, path) = zone_with("45000\n");
        assert_eq!(read_zone(&path), Some(45.0));
    }

    #[test]
    fn plain_degrees_pass_through() {
        let (_dir, path) = zone_with("48.5");
        assert_eq!(read_zone(&path), Some(48.5));
    }

    #[test]
    fn out_of_range_readings_are_dropped() {
        let (_dir, path) = zone_with("999999000");
        assert_eq!(read_zone(&path), None);
    }

    #[test]
    fn garbage_is_not_a_temperature() {
        let (_dir, path) = zone_with("sensor offline");
        assert_eq!(read_zone(&path), None);
        assert_eq!(read_zone(Path::new("/nonexistent/zone")), None);
    }
}
