//! Runtime settings: compiled defaults, then environment variables, then
//! command-line overrides, in that order.

use crate::args::FigurataArgs;
use crate::rfid::Region;

use log::warn;
use std::{
    env,
    error::Error,
    fmt,
    path::PathBuf,
    time::Duration,
};

/// Highest legal transmit power in the EU band, dBm.
const EU_POWER_CAP_DBM: u16 = 26;

#[derive(Debug)]
pub enum ConfigError {
    BadRegion(String),
    BadNumber { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::BadRegion(r) => write!(f, "unusable region: {}", r),
            ConfigError::BadNumber { var, value } => {
                write!(f, "{} is not a number: {:?}", var, value)
            }
        }
    }
}

impl Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Settings {
    pub target_tags: usize,
    pub inventory_timeout: Duration,
    pub poll_interval: Duration,
    pub remove_timeout: Duration,
    /// How long the ERROR pattern stays up before returning to BORED.
    pub error_ack: Duration,
    /// Cooldown after a failed device detection or timed-out pass.
    pub retry_cooldown: Duration,
    pub print_enabled: bool,
    pub region: Region,
    /// Centi-dBm, as the reader wants it.
    pub tx_power: u16,
    pub rpm_limit: u32,
    pub daily_limit: u32,
    /// Longest we wait for a minute slot before falling back.
    pub rate_limit_max_wait: Duration,
    pub content_api_url: Option<String>,
    pub content_api_key: Option<String>,
    pub content_model: String,
    pub record_store_url: Option<String>,
    pub record_store_key: Option<String>,
    pub gallery_url: String,
    pub output_dir: PathBuf,
    pub rate_limit_file: PathBuf,
    pub catalog_path: PathBuf,
    pub fallback_path: PathBuf,
    pub printer_device: PathBuf,
    /// Layout height of the composed figurine, canvas units.
    pub figurine_height: f64,
    /// Pending uploads retried per cycle start.
    pub flush_per_cycle: usize,
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env_string(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::BadNumber {
                var: name,
                value: raw,
            }),
    }
}

impl Settings {
    pub fn load(args: &FigurataArgs) -> Result<Self, ConfigError> {
        let region: Region = args
            .region
            .parse()
            .map_err(ConfigError::BadRegion)?;

        let mut power_dbm = args.power;
        if region == Region::Eu && power_dbm > EU_POWER_CAP_DBM {
            warn!(
                "{} dBm exceeds the EU cap, clamping to {}",
                power_dbm, EU_POWER_CAP_DBM
            );
            power_dbm = EU_POWER_CAP_DBM;
        }

        let output_dir = args
            .out
            .clone()
            .or_else(|| env_string("OUTPUT_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("output"));

        Ok(Settings {
            target_tags: args.target_tags,
            inventory_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(30),
            remove_timeout: Duration::from_secs(20),
            error_ack: Duration::from_secs(5),
            retry_cooldown: Duration::from_secs(5),
            print_enabled: !args.no_print,
            region,
            tx_power: power_dbm * 100,
            rpm_limit: env_u32("CONTENT_RPM_LIMIT", 15)?,
            daily_limit: env_u32("CONTENT_DAILY_LIMIT", 1500)?,
            rate_limit_max_wait: Duration::from_secs(60),
            content_api_url: env_string("CONTENT_API_URL"),
            content_api_key: env_string("CONTENT_API_KEY"),
            content_model: env_string("CONTENT_MODEL")
                .unwrap_or_else(|| "text-standard".to_string()),
            record_store_url: env_string("RECORD_STORE_URL"),
            record_store_key: env_string("RECORD_STORE_KEY"),
            gallery_url: env_string("GALLERY_URL").unwrap_or_else(|| {
                "https://museum-of-lifelong-learning.github.io/unfinished/".to_string()
            }),
            output_dir,
            rate_limit_file: env_string("RATE_LIMIT_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp/figurata_rate_limit.json")),
            catalog_path: args
                .catalog
                .clone()
                .unwrap_or_else(|| PathBuf::from("assets/catalog.csv")),
            fallback_path: PathBuf::from("assets/fallback_content.csv"),
            printer_device: args.printer.clone(),
            figurine_height: 600.0,
            flush_per_cycle: 5,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> FigurataArgs {
        let mut argv = vec!["figurata"];
        argv.extend_from_slice(extra);
        FigurataArgs::parse_from(argv)
    }

    #[test]
    fn defaults_match_the_deployment() {
        let settings = Settings::load(&args(&[])).unwrap();
        assert_eq!(settings.target_tags, 6);
        assert_eq!(settings.region, Region::Eu);
        assert_eq!(settings.tx_power, 2600);
        assert_eq!(settings.poll_interval, Duration::from_millis(30));
        assert_eq!(settings.inventory_timeout, Duration::from_secs(120));
        assert_eq!(settings.remove_timeout, Duration::from_secs(20));
        assert!(settings.print_enabled);
    }

    #[test]
    fn eu_power_is_clamped_to_the_legal_cap() {
        let settings = Settings::load(&args(&["--power", "30"])).unwrap();
        assert_eq!(settings.tx_power, 2600);
    }

    #[test]
    fn non_eu_regions_accept_higher_power() {
        let settings = Settings::load(&args(&["--region", "US", "--power", "30"])).unwrap();
        assert_eq!(settings.tx_power, 3000);
    }

    #[test]
    fn bad_region_is_a_configuration_error() {
        assert!(matches!(
            Settings::load(&args(&["--region", "XX"])),
            Err(ConfigError::BadRegion(_))
        ));
    }

    #[test]
    fn no_print_disables_the_printer() {
        let settings = Settings::load(&args(&["--no-print"])).unwrap();
        assert!(!settings.print_enabled);
    }
}
