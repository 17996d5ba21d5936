//! The UHF reader: discovery, regulatory configuration, and the multi-polling
//! inventory loop.
//!
//! The reader owns its serial handle exclusively. During BORED and
//! REMOVE_WAIT the handle moves into an [`InventoryWorker`] thread and comes
//! back inside the worker's report, so there is never a moment where two
//! tasks could write to the same port.

use crate::frame::{
    encode, FrameSplitter, Response, CMD_HARDWARE_VERSION, CMD_MULTI_POLL, CMD_SET_REGION,
    CMD_SET_TX_POWER,
};
use crate::{Epc, Rssi};

use log::{debug, info, warn};
use serial2::SerialPort;
use spin_sleep::SpinSleeper;
use std::{
    collections::HashMap,
    error::Error,
    fmt,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

pub const BAUD_RATE: u32 = 115200;

/// How long a probed port gets to answer the hardware-version command.
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Attempts per configuration step before giving up on the device.
const CONFIG_RETRIES: usize = 3;

const ACK_TIMEOUT: Duration = Duration::from_millis(300);

/// Settle time after opening the serial port, before the first command.
const PORT_SETTLE: Duration = Duration::from_millis(250);

/// Maximum legal transmit power for the EU band, centi-dBm.
pub const DEFAULT_TX_POWER: u16 = 2600;

/// Regulatory frequency region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Eu,
    Us,
    Cn,
    In,
    Jp,
}

impl Region {
    pub fn code(&self) -> u8 {
        match self {
            Region::Us => 0x01,
            Region::Eu => 0x02,
            Region::In => 0x03,
            Region::Cn => 0x04,
            Region::Jp => 0x05,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Eu => "EU",
            Region::Us => "US",
            Region::Cn => "CN",
            Region::In => "IN",
            Region::Jp => "JP",
        }
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EU" => Ok(Region::Eu),
            "US" => Ok(Region::Us),
            "CN" => Ok(Region::Cn),
            "IN" => Ok(Region::In),
            "JP" => Ok(Region::Jp),
            other => Err(format!("unknown region {:?}", other)),
        }
    }
}

#[derive(Debug)]
pub enum RfidError {
    /// No reader answered the probe, or configuration never got an ACK.
    Unavailable(String),
    /// The reader stopped responding and one reopen did not bring it back.
    Lost(io::Error),
}

impl fmt::Display for RfidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RfidError::Unavailable(why) => write!(f, "rfid reader unavailable: {}", why),
            RfidError::Lost(e) => write!(f, "rfid reader lost: {}", e),
        }
    }
}

impl Error for RfidError {}

/// Everything seen in one inventory pass: each tag's best signal strength.
pub type Inventory = HashMap<Epc, Rssi>;

/// How an inventory pass ended. The map is whatever was collected up to that
/// point; ordering of its entries is meaningless.
#[derive(Debug)]
pub enum InventoryOutcome {
    /// Target count reached.
    Complete(Inventory),
    /// Deadline passed first.
    TimedOut(Inventory),
    /// Cancelled from outside; partial map included for callers that want it.
    Cancelled(Inventory),
}

/// How a wait-for-removal pass ended.
#[derive(Debug, PartialEq, Eq)]
pub enum ClearOutcome {
    /// Two consecutive polls saw no tags at all.
    Cleared,
    TimedOut,
    Cancelled,
}

/// Fold a tag notice into the running inventory, keeping the best RSSI seen
/// per EPC. Returns true when the EPC is new.
fn absorb(found: &mut Inventory, epc: Epc, rssi: Rssi) -> bool {
    match found.get_mut(&epc) {
        Some(best) => {
            if rssi > *best {
                *best = rssi;
            }
            false
        }
        None => {
            found.insert(epc, rssi);
            true
        }
    }
}

pub struct RfidReader {
    port: SerialPort,
    path: PathBuf,
    splitter: FrameSplitter,
    region: Region,
    tx_power: u16,
}

impl RfidReader {
    /// Open a specific port and bring the reader into a known configuration.
    pub fn open(path: &Path, region: Region, tx_power: u16) -> Result<Self, RfidError> {
        let port = open_port(path).map_err(|e| RfidError::Unavailable(e.to_string()))?;
        // The module needs a moment after the port toggles before it talks.
        thread::sleep(PORT_SETTLE);
        let mut reader = RfidReader {
            port,
            path: path.to_path_buf(),
            splitter: FrameSplitter::new(),
            region,
            tx_power,
        };
        if !reader.probe() {
            return Err(RfidError::Unavailable(format!(
                "no reader on {}",
                path.display()
            )));
        }
        reader.configure()?;
        Ok(reader)
    }

    /// Walk the available serial ports and claim the first one that answers
    /// the hardware-version probe.
    pub fn auto_detect(region: Region, tx_power: u16) -> Result<Self, RfidError> {
        let ports = SerialPort::available_ports()
            .map_err(|e| RfidError::Unavailable(e.to_string()))?;
        if ports.is_empty() {
            return Err(RfidError::Unavailable("no serial ports present".into()));
        }
        for candidate in ports {
            debug!("probing {} for the rfid reader", candidate.display());
            match RfidReader::open(&candidate, region, tx_power) {
                Ok(reader) => {
                    info!(
                        "rfid reader on {} (region {}, {} cdBm)",
                        candidate.display(),
                        region.as_str(),
                        tx_power
                    );
                    return Ok(reader);
                }
                Err(e) => debug!("{}: {}", candidate.display(), e),
            }
        }
        Err(RfidError::Unavailable(
            "no port answered the probe".into(),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn probe(&mut self) -> bool {
        if self.port.write_all(&encode(CMD_HARDWARE_VERSION, &[])).is_err() {
            return false;
        }
        let deadline = Instant::now() + PROBE_TIMEOUT;
        let mut answered = false;
        let _ = self.drain_until(deadline, |_| {
            answered = true;
            false
        });
        answered
    }

    /// Region first (it decides the frequency band), then transmit power.
    fn configure(&mut self) -> Result<(), RfidError> {
        let region = self.region;
        let power = self.tx_power;
        self.config_step("SET_REGION", CMD_SET_REGION, &[region.code()])?;
        self.config_step(
            "SET_TX_POWER",
            CMD_SET_TX_POWER,
            &[(power >> 8) as u8, power as u8],
        )
    }

    fn config_step(&mut self, what: &str, cmd: u8, payload: &[u8]) -> Result<(), RfidError> {
        for attempt in 1..=CONFIG_RETRIES {
            if self.port.write_all(&encode(cmd, payload)).is_err() {
                continue;
            }
            let deadline = Instant::now() + ACK_TIMEOUT;
            let mut acked = false;
            let _ = self.drain_until(deadline, |response| {
                if matches!(response, Response::ConfigAck { cmd: c } if c == cmd) {
                    acked = true;
                    return false;
                }
                true
            });
            if acked {
                debug!("{} acknowledged", what);
                return Ok(());
            }
            warn!("{} attempt {}/{} missed its ACK", what, attempt, CONFIG_RETRIES);
        }
        Err(RfidError::Unavailable(format!("{} never acknowledged", what)))
    }

    /// Read frames until `deadline`, feeding classified responses to `sink`.
    /// The sink returns false to stop draining early.
    fn drain_until(
        &mut self,
        deadline: Instant,
        mut sink: impl FnMut(Response) -> bool,
    ) -> io::Result<()> {
        let mut buffer = [0u8; 256];
        while Instant::now() < deadline {
            let read = match self.port.read(&mut buffer) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            };
            self.splitter.extend(&buffer[..read]);
            loop {
                match self.splitter.next_frame() {
                    Ok(Some(frame)) => {
                        if let Some(response) = frame.response() {
                            if !sink(response) {
                                return Ok(());
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("frame desync: {}", e);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// One multi-polling cycle: issue the command and collect tag notices for
    /// `window`. With `stop_at` set, absorption halts the moment the map
    /// holds that many distinct tags, so the result never overshoots the
    /// caller's target.
    fn poll_window(
        &mut self,
        window: Duration,
        found: &mut Inventory,
        stop_at: Option<usize>,
    ) -> io::Result<usize> {
        self.port.write_all(&encode(CMD_MULTI_POLL, &[]))?;
        let mut notices = 0;
        let deadline = Instant::now() + window;
        self.drain_until(deadline, |response| {
            if let Response::TagNotice { rssi, epc } = response {
                notices += 1;
                if absorb(found, epc.clone(), rssi) {
                    debug!("tag {} (rssi {})", epc, rssi);
                }
            }
            stop_at.map_or(true, |target| found.len() < target)
        })?;
        Ok(notices)
    }

    /// Reopen the serial handle after a transient fault, once per pass.
    fn recover(&mut self, reopened: &mut bool, err: io::Error) -> Result<(), RfidError> {
        if *reopened {
            return Err(RfidError::Lost(err));
        }
        warn!("rfid io fault ({}), reopening {}", err, self.path.display());
        *reopened = true;
        match open_port(&self.path) {
            Ok(port) => {
                self.port = port;
                self.splitter = FrameSplitter::new();
                // Region and power do not survive a power glitch; best effort.
                if let Err(e) = self.configure() {
                    warn!("reconfigure after reopen failed: {}", e);
                }
                Ok(())
            }
            Err(reopen_err) => {
                warn!("reopen failed: {}", reopen_err);
                Err(RfidError::Lost(err))
            }
        }
    }

    /// Run the inventory loop until `target` distinct tags are seen, the
    /// deadline passes, or `cancel` is raised. Cancellation is honored within
    /// one polling interval.
    pub fn read_tags(
        &mut self,
        target: usize,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &AtomicBool,
    ) -> Result<InventoryOutcome, RfidError> {
        let mut found = Inventory::new();
        let deadline = Instant::now() + timeout;
        let mut reopened = false;
        let sleeper = SpinSleeper::default();

        loop {
            if cancel.load(Ordering::Acquire) {
                return Ok(InventoryOutcome::Cancelled(found));
            }
            if Instant::now() >= deadline {
                return Ok(InventoryOutcome::TimedOut(found));
            }

            let cycle_start = Instant::now();
            match self.poll_window(poll_interval, &mut found, Some(target)) {
                Ok(_) => {}
                Err(e) => self.recover(&mut reopened, e)?,
            }
            if found.len() >= target {
                return Ok(InventoryOutcome::Complete(found));
            }
            let elapsed = cycle_start.elapsed();
            if elapsed < poll_interval {
                sleeper.sleep(poll_interval - elapsed);
            }
        }
    }

    /// Wait until the tray is empty: `debounce` consecutive polls with zero
    /// tag notices. A single silent poll can be a missed read and does not
    /// count on its own.
    pub fn wait_clear(
        &mut self,
        debounce: usize,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &AtomicBool,
    ) -> Result<ClearOutcome, RfidError> {
        let deadline = Instant::now() + timeout;
        let mut silent_polls = 0;
        let mut reopened = false;
        let sleeper = SpinSleeper::default();

        loop {
            if cancel.load(Ordering::Acquire) {
                return Ok(ClearOutcome::Cancelled);
            }
            if Instant::now() >= deadline {
                return Ok(ClearOutcome::TimedOut);
            }

            let cycle_start = Instant::now();
            let mut scratch = Inventory::new();
            match self.poll_window(poll_interval, &mut scratch, None) {
                Ok(notices) => {
                    if notices == 0 {
                        silent_polls += 1;
                        if silent_polls >= debounce {
                            return Ok(ClearOutcome::Cleared);
                        }
                    } else {
                        silent_polls = 0;
                    }
                }
                Err(e) => {
                    self.recover(&mut reopened, e)?;
                    silent_polls = 0;
                }
            }
            let elapsed = cycle_start.elapsed();
            if elapsed < poll_interval {
                sleeper.sleep(poll_interval - elapsed);
            }
        }
    }
}

fn open_port(path: &Path) -> io::Result<SerialPort> {
    let mut port = SerialPort::open(path, BAUD_RATE)?;
    port.set_read_timeout(Duration::from_millis(10))?;
    Ok(port)
}

/// What the worker was asked to watch for.
#[derive(Debug, Clone, Copy)]
pub enum WorkerGoal {
    /// Collect `target` distinct tags within `timeout`.
    Collect { target: usize, timeout: Duration },
    /// Wait for the tray to stay empty for two consecutive polls.
    AwaitClear { timeout: Duration },
}

#[derive(Debug)]
pub enum WorkerOutcome {
    Complete(Inventory),
    Cleared,
    TimedOut,
    Cancelled,
    Lost(RfidError),
}

/// The worker's final word, including the reader handle being handed back.
pub struct WorkerReport {
    pub reader: RfidReader,
    pub outcome: WorkerOutcome,
}

/// A background inventory pass. Owns the reader for its lifetime and delivers
/// exactly one report on a bounded channel.
pub struct InventoryWorker {
    cancel: Arc<AtomicBool>,
    rx: Receiver<WorkerReport>,
    handle: JoinHandle<()>,
}

impl InventoryWorker {
    pub fn spawn(mut reader: RfidReader, goal: WorkerGoal, poll_interval: Duration) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let (tx, rx): (SyncSender<WorkerReport>, Receiver<WorkerReport>) = sync_channel(1);

        let handle = thread::spawn(move || {
            let outcome = match goal {
                WorkerGoal::Collect { target, timeout } => {
                    match reader.read_tags(target, timeout, poll_interval, &flag) {
                        Ok(InventoryOutcome::Complete(found)) => WorkerOutcome::Complete(found),
                        Ok(InventoryOutcome::TimedOut(partial)) => {
                            debug!("inventory timed out with {} tags", partial.len());
                            WorkerOutcome::TimedOut
                        }
                        // A cancelled pass never leaks its partial map.
                        Ok(InventoryOutcome::Cancelled(_)) => WorkerOutcome::Cancelled,
                        Err(e) => WorkerOutcome::Lost(e),
                    }
                }
                WorkerGoal::AwaitClear { timeout } => {
                    match reader.wait_clear(2, timeout, poll_interval, &flag) {
                        Ok(ClearOutcome::Cleared) => WorkerOutcome::Cleared,
                        Ok(ClearOutcome::TimedOut) => WorkerOutcome::TimedOut,
                        Ok(ClearOutcome::Cancelled) => WorkerOutcome::Cancelled,
                        Err(e) => WorkerOutcome::Lost(e),
                    }
                }
            };
            let _ = tx.send(WorkerReport { reader, outcome });
        });

        InventoryWorker { cancel, rx, handle }
    }

    /// Ask the worker to stop. It notices within one polling interval.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Block until the worker reports and hand back the reader. `None` only
    /// if the worker thread panicked.
    pub fn join(self) -> Option<WorkerReport> {
        let report = self.rx.recv().ok();
        let _ = self.handle.join();
        report
    }

    /// Like [`InventoryWorker::join`], but cancels the worker as soon as the
    /// shutdown flag goes up so the service never sits out a full inventory
    /// deadline on its way down.
    pub fn wait(self, shutdown: &AtomicBool) -> Option<WorkerReport> {
        loop {
            if shutdown.load(Ordering::Acquire) {
                self.cancel();
                return self.join();
            }
            match self.rx.recv_timeout(Duration::from_millis(250)) {
                Ok(report) => {
                    let _ = self.handle.join();
                    return Some(report);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    let _ = self.handle.join();
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_codes_match_the_reader_firmware() {
        assert_eq!(Region::Us.code(), 0x01);
        assert_eq!(Region::Eu.code(), 0x02);
        assert_eq!(Region::In.code(), 0x03);
        assert_eq!(Region::Cn.code(), 0x04);
        assert_eq!(Region::Jp.code(), 0x05);
    }

    #[test]
    fn region_parses_case_insensitively() {
        assert_eq!("eu".parse::<Region>(), Ok(Region::Eu));
        assert_eq!(" JP ".parse::<Region>(), Ok(Region::Jp));
        assert!("MARS".parse::<Region>().is_err());
    }

    #[test]
    fn absorb_keeps_the_strongest_reading() {
        let mut found = Inventory::new();
        let epc = Epc::new("E2000001");

        assert!(absorb(&mut found, epc.clone(), -60));
        assert!(!absorb(&mut found, epc.clone(), -70));
        assert_eq!(found[&epc], -60);

        assert!(!absorb(&mut found, epc.clone(), -42));
        assert_eq!(found[&epc], -42);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn absorb_counts_distinct_tags() {
        let mut found = Inventory::new();
        for i in 0..6 {
            assert!(absorb(&mut found, Epc::new(&format!("E20000{:02}", i)), -50));
        }
        assert_eq!(found.len(), 6);
    }

    #[test]
    fn power_payload_is_big_endian_centi_dbm() {
        let power: u16 = 2600;
        assert_eq!([(power >> 8) as u8, power as u8], [0x0A, 0x28]);
    }
}
