//! Buffered ESC/POS command stream for the thermal receipt printer.
//!
//! Commands accumulate in a page buffer and hit the device only on
//! [`Printer::cut`], so a half-composed receipt never reaches paper. The
//! printer itself renders QR codes natively, which keeps the host side down
//! to emitting the right escape sequences.

use crate::composer::Raster;

use log::debug;
use std::{
    error::Error,
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Horizontal dot count of the 80 mm paper at 180 dpi.
pub const PAGE_WIDTH_DOTS: u32 = 512;

/// Characters per line in the standard font.
pub const CHARS_PER_LINE: usize = 42;

const ESC: u8 = 0x1B;
const GS: u8 = 0x1D;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Style {
    pub bold: bool,
    pub center: bool,
    /// Double width and height.
    pub wide: bool,
}

impl Style {
    pub fn centered() -> Self {
        Style {
            center: true,
            ..Style::default()
        }
    }

    pub fn banner() -> Self {
        Style {
            bold: true,
            center: true,
            wide: true,
        }
    }

    pub fn label() -> Self {
        Style {
            bold: true,
            ..Style::default()
        }
    }
}

#[derive(Debug)]
pub enum PrinterError {
    /// Could not claim the device at all.
    Unavailable(io::Error),
    /// The device vanished mid-write.
    Io(io::Error),
}

impl fmt::Display for PrinterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrinterError::Unavailable(e) => write!(f, "printer unavailable: {}", e),
            PrinterError::Io(e) => write!(f, "printer io error: {}", e),
        }
    }
}

impl Error for PrinterError {}

impl From<io::Error> for PrinterError {
    fn from(value: io::Error) -> Self {
        PrinterError::Io(value)
    }
}

#[derive(Debug)]
enum Sink {
    /// The kernel's usblp character device; exclusive while open.
    Device { file: fs::File, path: PathBuf },
    /// In-memory sink for dry runs and tests.
    Capture(Vec<u8>),
}

#[derive(Debug)]
pub struct Printer {
    sink: Sink,
    page: Vec<u8>,
}

impl Printer {
    /// Claim the printer device node for writing.
    pub fn open(path: &Path) -> Result<Self, PrinterError> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(PrinterError::Unavailable)?;
        debug!("printer claimed at {}", path.display());
        let mut printer = Printer {
            sink: Sink::Device {
                file,
                path: path.to_path_buf(),
            },
            page: Vec::new(),
        };
        printer.initialize();
        Ok(printer)
    }

    /// A printer whose pages end up in memory instead of on paper.
    pub fn capture() -> Self {
        let mut printer = Printer {
            sink: Sink::Capture(Vec::new()),
            page: Vec::new(),
        };
        printer.initialize();
        printer
    }

    /// Everything flushed so far, for capture printers.
    pub fn captured(&self) -> &[u8] {
        match &self.sink {
            Sink::Capture(bytes) => bytes,
            Sink::Device { .. } => &[],
        }
    }

    pub fn is_capture(&self) -> bool {
        matches!(self.sink, Sink::Capture(_))
    }

    pub fn device_path(&self) -> Option<&Path> {
        match &self.sink {
            Sink::Device { path, .. } => Some(path),
            Sink::Capture(_) => None,
        }
    }

    fn initialize(&mut self) {
        // ESC @: reset formatting and clear the print buffer.
        self.page.extend_from_slice(&[ESC, b'@']);
    }

    fn apply(&mut self, style: Style) {
        self.page
            .extend_from_slice(&[ESC, b'a', if style.center { 1 } else { 0 }]);
        self.page
            .extend_from_slice(&[ESC, b'E', if style.bold { 1 } else { 0 }]);
        self.page
            .extend_from_slice(&[GS, b'!', if style.wide { 0x11 } else { 0x00 }]);
    }

    /// One line of text in the given style, newline included.
    pub fn text(&mut self, line: &str, style: Style) {
        self.apply(style);
        self.page.extend_from_slice(line.as_bytes());
        self.page.push(b'\n');
    }

    /// Feed `lines` blank lines.
    pub fn feed(&mut self, lines: u8) {
        self.page.extend_from_slice(&[ESC, b'd', lines]);
    }

    /// A packed 1-bit raster, printed at the left margin. The raster should
    /// already be [`PAGE_WIDTH_DOTS`] wide; narrower images print narrower.
    pub fn image(&mut self, raster: &Raster) {
        let stride = raster.stride();
        let height = raster.height();
        // GS v 0: raster bit image, normal scale.
        self.page.extend_from_slice(&[
            GS,
            b'v',
            b'0',
            0x00,
            (stride & 0xFF) as u8,
            (stride >> 8) as u8,
            (height & 0xFF) as u8,
            (height >> 8) as u8,
        ]);
        self.page.extend_from_slice(raster.data());
    }

    /// Have the printer render a QR code of the payload. `size` is the module
    /// edge in dots (1..=16).
    pub fn qrcode(&mut self, payload: &str, size: u8) {
        let data = payload.as_bytes();
        // Model 2.
        self.page
            .extend_from_slice(&[GS, b'(', b'k', 4, 0, 0x31, 0x41, 50, 0]);
        // Module size.
        self.page
            .extend_from_slice(&[GS, b'(', b'k', 3, 0, 0x31, 0x43, size.clamp(1, 16)]);
        // Error correction level L.
        self.page
            .extend_from_slice(&[GS, b'(', b'k', 3, 0, 0x31, 0x45, 48]);
        // Store the payload.
        let len = data.len() + 3;
        self.page.extend_from_slice(&[
            GS,
            b'(',
            b'k',
            (len & 0xFF) as u8,
            (len >> 8) as u8,
            0x31,
            0x50,
            0x30,
        ]);
        self.page.extend_from_slice(data);
        // Print it.
        self.page
            .extend_from_slice(&[GS, b'(', b'k', 3, 0, 0x31, 0x51, 0x30]);
    }

    /// Finish the page: feed clear of the blade, cut, and flush everything
    /// buffered to the device.
    pub fn cut(&mut self) -> Result<(), PrinterError> {
        self.feed(3);
        // GS V function B: partial cut.
        self.page.extend_from_slice(&[GS, b'V', 66, 0]);
        self.flush()
    }

    fn flush(&mut self) -> Result<(), PrinterError> {
        match &mut self.sink {
            Sink::Device { file, .. } => {
                file.write_all(&self.page)?;
                file.flush()?;
            }
            Sink::Capture(bytes) => bytes.extend_from_slice(&self.page),
        }
        debug!("printer page flushed ({} bytes)", self.page.len());
        self.page.clear();
        self.initialize();
        Ok(())
    }
}
