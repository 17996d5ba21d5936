// Commandline argument parser using clap for the installation service.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct FigurataArgs {
    /// Skip the thermal printer to save paper (development mode)
    #[arg(long = "no-print")]
    pub no_print: bool,

    /// RFID regulatory region: EU, US, CN, IN or JP
    #[arg(short = 'r', long = "region", default_value = "EU")]
    pub region: String,

    /// RFID transmit power in dBm
    #[arg(short = 'p', long = "power", default_value_t = 26)]
    pub power: u16,

    /// Number of distinct tags that starts a cycle
    #[arg(short = 't', long = "target-tags", default_value_t = 6)]
    pub target_tags: usize,

    /// Answer catalog CSV, overriding the shipped one
    #[arg(long = "catalog")]
    pub catalog: Option<PathBuf>,

    /// Directory for slip records and figurine bitmaps
    #[arg(short = 'o', long = "out")]
    pub out: Option<PathBuf>,

    /// Printer device node
    #[arg(long = "printer", default_value = "/dev/usb/lp0")]
    pub printer: PathBuf,
}
