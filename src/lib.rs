pub mod args;
pub mod catalog;
pub mod composer;
pub mod config;
pub mod content;
pub mod display;
pub mod frame;
pub mod mapper;
pub mod printer;
pub mod rate_limit;
pub mod rfid;
pub mod service;
pub mod shapes;
pub mod slip;
pub mod store;
pub mod thermal;

use std::fmt;

/// Received signal strength as reported by the reader, one value per tag
/// notice. Bigger is closer.
pub type Rssi = i16;

/// The identity burned into a UHF transponder. Stored normalized to uppercase
/// hex so that readings, catalog rows and log lines all compare byte-equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epc(String);

impl Epc {
    /// Normalize a textual EPC (catalog column, CLI argument).
    pub fn new(raw: &str) -> Self {
        Epc(raw.trim().to_ascii_uppercase())
    }

    /// Hex-encode the EPC bytes of a tag notice.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        use std::fmt::Write as _;
        let mut s = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            let _ = write!(s, "{:02X}", b);
        }
        Epc(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Epc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
