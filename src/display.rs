//! Client for the LED matrix over its line-oriented serial protocol.
//!
//! The matrix firmware speaks newline-terminated ASCII commands and answers
//! every one with `OK ...` or `ERR <reason>`. The display is advisory: a
//! broken display never stops a cycle, so every failure here is reported but
//! survivable.

use log::{debug, warn};
use nom::{
    branch::alt,
    bytes::complete::tag,
    combinator::{map, rest},
    sequence::preceded,
    Finish, IResult,
};
use std::{
    error::Error,
    fmt,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use serial2::SerialPort;

pub const BAUD_RATE: u32 = 115200;

/// Budget for one command round-trip before we give up on the link.
const ACK_TIMEOUT: Duration = Duration::from_millis(250);

/// How long the firmware takes to reboot after the port is opened.
const BOOT_SETTLE: Duration = Duration::from_millis(1500);

/// The animations the firmware knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Bored,
    Thinking,
    Finish,
    RemoveFigure,
    Error,
}

impl Pattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::Bored => "BORED",
            Pattern::Thinking => "THINKING",
            Pattern::Finish => "FINISH",
            Pattern::RemoveFigure => "REMOVE_FIGURE",
            Pattern::Error => "ERROR",
        }
    }
}

#[derive(Debug)]
pub enum DisplayError {
    Unavailable(io::Error),
    /// The firmware answered `ERR <reason>`.
    Nack(String),
    /// No parseable ACK within the round-trip budget, twice in a row.
    Timeout,
}

impl fmt::Display for DisplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayError::Unavailable(e) => write!(f, "display unavailable: {}", e),
            DisplayError::Nack(msg) => write!(f, "display rejected command: {}", msg),
            DisplayError::Timeout => write!(f, "display did not acknowledge in time"),
        }
    }
}

impl Error for DisplayError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Ack {
    Ok(String),
    Err(String),
}

fn parse_ack(line: &str) -> IResult<&str, Ack> {
    alt((
        map(preceded(tag("OK"), rest), |s: &str| {
            Ack::Ok(s.trim().to_string())
        }),
        map(preceded(tag("ERR"), rest), |s: &str| {
            Ack::Err(s.trim().to_string())
        }),
    ))(line)
}

fn decode_ack(line: &str) -> Option<Ack> {
    match parse_ack(line.trim()).finish() {
        Ok((_rest, ack)) => Some(ack),
        Err(_) => None,
    }
}

/// The probe handshake: `STATUS` must come back as `OK PATTERN=...`.
fn is_status_banner(line: &str) -> bool {
    matches!(decode_ack(line), Some(Ack::Ok(rest)) if rest.starts_with("PATTERN="))
}

pub struct Display {
    port: SerialPort,
    path: PathBuf,
}

impl Display {
    pub fn open(path: &Path) -> Result<Self, DisplayError> {
        let mut port =
            SerialPort::open(path, BAUD_RATE).map_err(DisplayError::Unavailable)?;
        port.set_read_timeout(Duration::from_millis(20))
            .map_err(DisplayError::Unavailable)?;
        Ok(Display {
            port,
            path: path.to_path_buf(),
        })
    }

    /// Probe every serial port not in `skip` until one identifies itself as
    /// the display.
    pub fn auto_detect(skip: &[&Path]) -> Option<Self> {
        let ports = SerialPort::available_ports().ok()?;
        for candidate in ports {
            if skip.iter().any(|s| *s == candidate.as_path()) {
                continue;
            }
            debug!("probing {} for the display", candidate.display());
            if let Ok(mut display) = Display::open(&candidate) {
                if display.probe() {
                    debug!("display found on {}", candidate.display());
                    return Some(display);
                }
            }
        }
        None
    }

    fn probe(&mut self) -> bool {
        // Opening the port toggles DTR and resets the firmware; let it boot
        // before asking anything.
        thread::sleep(BOOT_SETTLE);
        if self.send_line("STATUS").is_err() {
            return false;
        }
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            match self.read_line(deadline) {
                Some(line) if is_status_banner(&line) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
        false
    }

    fn send_line(&mut self, command: &str) -> io::Result<()> {
        self.port.write_all(command.as_bytes())?;
        self.port.write_all(b"\n")
    }

    /// Read one newline-terminated line, or `None` at the deadline.
    fn read_line(&mut self, deadline: Instant) -> Option<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while Instant::now() < deadline {
            match self.port.read(&mut byte) {
                Ok(0) => continue,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        return Some(String::from_utf8_lossy(&line).into_owned());
                    }
                    line.push(byte[0]);
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(_) => return None,
            }
        }
        None
    }

    fn reopen(&mut self) -> Result<(), DisplayError> {
        warn!("display link stalled, reopening {}", self.path.display());
        let mut port =
            SerialPort::open(&self.path, BAUD_RATE).map_err(DisplayError::Unavailable)?;
        port.set_read_timeout(Duration::from_millis(20))
            .map_err(DisplayError::Unavailable)?;
        self.port = port;
        Ok(())
    }

    fn try_command(&mut self, command: &str) -> Result<(), DisplayError> {
        self.send_line(command)
            .map_err(DisplayError::Unavailable)?;
        let deadline = Instant::now() + ACK_TIMEOUT;
        while let Some(line) = self.read_line(deadline) {
            match decode_ack(&line) {
                Some(Ack::Ok(_)) => return Ok(()),
                Some(Ack::Err(msg)) => return Err(DisplayError::Nack(msg)),
                // Boot chatter or a stale notification; keep reading.
                None => continue,
            }
        }
        Err(DisplayError::Timeout)
    }

    /// Send one command, allowing a single reopen-and-resend on timeout.
    fn command(&mut self, command: &str) -> Result<(), DisplayError> {
        match self.try_command(command) {
            Err(DisplayError::Timeout) | Err(DisplayError::Unavailable(_)) => {
                self.reopen()?;
                self.try_command(command)
            }
            other => other,
        }
    }

    /// Idempotent; the firmware treats a repeated pattern as a no-op.
    pub fn set_pattern(&mut self, pattern: Pattern) -> Result<(), DisplayError> {
        self.command(&format!("PATTERN {}", pattern.as_str()))
    }

    pub fn set_brightness(&mut self, level: u8) -> Result<(), DisplayError> {
        self.command(&format!("BRIGHT {}", level.min(15)))
    }

    pub fn set_speed(&mut self, level: u8) -> Result<(), DisplayError> {
        self.command(&format!("SPEED {}", level.min(10)))
    }

    pub fn clear(&mut self) -> Result<(), DisplayError> {
        self.command("CLEAR")
    }

    pub fn stop(&mut self) -> Result<(), DisplayError> {
        self.command("STOP")
    }

    /// The firmware's one-line status report, for diagnostics.
    pub fn status(&mut self) -> Result<String, DisplayError> {
        self.send_line("STATUS")
            .map_err(DisplayError::Unavailable)?;
        let deadline = Instant::now() + ACK_TIMEOUT;
        while let Some(line) = self.read_line(deadline) {
            match decode_ack(&line) {
                Some(Ack::Ok(detail)) => return Ok(detail),
                Some(Ack::Err(msg)) => return Err(DisplayError::Nack(msg)),
                None => continue,
            }
        }
        Err(DisplayError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_names_match_the_firmware_vocabulary() {
        assert_eq!(Pattern::Bored.as_str(), "BORED");
        assert_eq!(Pattern::RemoveFigure.as_str(), "REMOVE_FIGURE");
    }

    #[test]
    fn bare_ok_is_an_ack() {
        assert_eq!(decode_ack("OK"), Some(Ack::Ok(String::new())));
    }

    #[test]
    fn ok_with_detail_is_an_ack() {
        assert_eq!(
            decode_ack("OK PATTERN=BORED\r"),
            Some(Ack::Ok("PATTERN=BORED".to_string()))
        );
    }

    #[test]
    fn err_lines_carry_their_reason() {
        assert_eq!(
            decode_ack("ERR unknown pattern"),
            Some(Ack::Err("unknown pattern".to_string()))
        );
    }

    #[test]
    fn garbage_is_not_an_ack() {
        assert_eq!(decode_ack("booting v1.3"), None);
        assert_eq!(decode_ack(""), None);
    }

    #[test]
    fn status_banner_detection_requires_pattern_field() {
        assert!(is_status_banner("OK PATTERN=BORED BRIGHT=5"));
        assert!(!is_status_banner("OK"));
        assert!(!is_status_banner("ERR PATTERN=BORED"));
    }
}
