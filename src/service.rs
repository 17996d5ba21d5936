//! The installation's top-level state machine.
//!
//! One control task owns all state and the slip being assembled. The RFID
//! reader moves into a background inventory worker during BORED and
//! REMOVE_WAIT and is handed back with the worker's report; the display and
//! printer are driven synchronously with bounded timeouts. Every failure
//! path ends back in BORED: the service's job is to stay up.

use crate::catalog::{Answer, Catalog, ResourceKind, QUESTION_COUNT};
use crate::composer::{compose, Raster};
use crate::config::Settings;
use crate::content::{ContentClient, Profile};
use crate::display::{Display, DisplayError, Pattern};
use crate::mapper;
use crate::printer::{Printer, PAGE_WIDTH_DOTS};
use crate::rfid::{Inventory, InventoryWorker, RfidReader, WorkerGoal, WorkerOutcome};
use crate::slip::{print_receipt, SlipRecord};
use crate::store::SlipStore;
use crate::thermal;
use crate::Epc;

use chrono::Utc;
use log::{error, info, warn};
use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use uuid::Uuid;

/// How long the ERROR pattern is shown after a failed print before the
/// receipt flow continues.
const PRINT_ERROR_BLINK: Duration = Duration::from_secs(2);

/// The machine's states. THINKING and PRINTING carry the cycle's data; no
/// other task ever touches a slip in flight.
enum State {
    Bored,
    Thinking(Inventory),
    Printing {
        record: SlipRecord,
        figurine: Raster,
    },
    RemoveWait,
    Error,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Bored => "BORED",
            State::Thinking(_) => "THINKING",
            State::Printing { .. } => "PRINTING",
            State::RemoveWait => "REMOVE_WAIT",
            State::Error => "ERROR",
        }
    }
}

/// Why a cycle was abandoned during THINKING.
#[derive(Debug)]
enum CycleFault {
    UnregisteredTag(Epc),
    QuestionNotCovered(String),
}

impl fmt::Display for CycleFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleFault::UnregisteredTag(epc) => {
                write!(f, "tag {} is not in the catalog", epc)
            }
            CycleFault::QuestionNotCovered(q) => {
                write!(f, "no tag answered question {}", q)
            }
        }
    }
}

impl Error for CycleFault {}

/// Map the collected EPCs to answers and titles, sorted F01..F06. Collection
/// order is meaningless, so this works from the unordered inventory
/// directly.
fn resolve_answers(
    catalog: &Catalog,
    inventory: &Inventory,
) -> Result<Vec<(Answer, String)>, CycleFault> {
    let mut covered = [false; QUESTION_COUNT];
    let mut resolved = Vec::with_capacity(inventory.len());

    for epc in inventory.keys() {
        let answer = catalog
            .answer_of(epc)
            .ok_or_else(|| CycleFault::UnregisteredTag(epc.clone()))?;
        if covered[answer.question as usize] {
            warn!(
                "tag {} repeats question {}, keeping the first reading",
                epc,
                answer.question_label()
            );
            continue;
        }
        covered[answer.question as usize] = true;
        resolved.push((answer, catalog.title(answer).to_string()));
    }

    for (q, seen) in covered.iter().enumerate() {
        if !seen {
            return Err(CycleFault::QuestionNotCovered(format!("F{:02}", q + 1)));
        }
    }

    resolved.sort_by_key(|(answer, _)| answer.question);
    Ok(resolved)
}

/// First non-empty resource of this kind along F01..F06.
fn pick_resource(catalog: &Catalog, answers: &[(Answer, String)], kind: ResourceKind) -> String {
    answers
        .iter()
        .map(|(answer, _)| catalog.resource(*answer, kind))
        .find(|text| !text.is_empty())
        .unwrap_or("")
        .to_string()
}

pub struct Service {
    settings: Settings,
    catalog: Catalog,
    display: Option<Display>,
    printer: Option<Printer>,
    content: ContentClient,
    store: SlipStore,
    reader: Option<RfidReader>,
    shutdown: Arc<AtomicBool>,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        catalog: Catalog,
        display: Option<Display>,
        printer: Option<Printer>,
        reader: Option<RfidReader>,
        content: ContentClient,
        store: SlipStore,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Service {
            settings,
            catalog,
            display,
            printer,
            content,
            store,
            reader,
            shutdown,
        }
    }

    /// Run cycles until the shutdown flag is raised.
    pub fn run(&mut self) {
        let mut state = State::Bored;
        while !self.shutdown.load(Ordering::Acquire) {
            info!("state: {}", state.name());
            state = match state {
                State::Bored => self.do_bored(),
                State::Thinking(inventory) => self.do_thinking(inventory),
                State::Printing { record, figurine } => self.do_printing(record, figurine),
                State::RemoveWait => self.do_remove_wait(),
                State::Error => self.do_error(),
            };
        }
        self.display_do("clear", |d| d.clear());
        info!("service stopped");
    }

    /// Run one display operation, tolerating a dead display. The display is
    /// advisory and never aborts a cycle.
    fn display_do(
        &mut self,
        what: &str,
        op: impl FnOnce(&mut Display) -> Result<(), DisplayError>,
    ) {
        if let Some(display) = self.display.as_mut() {
            if let Err(e) = op(display) {
                warn!("display {} failed: {}", what, e);
            }
        }
    }

    /// The reader, reattaching it if the last cycle lost it.
    fn take_reader(&mut self) -> Option<RfidReader> {
        if let Some(reader) = self.reader.take() {
            return Some(reader);
        }
        match RfidReader::auto_detect(self.settings.region, self.settings.tx_power) {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!("reader not reachable: {}", e);
                None
            }
        }
    }

    fn do_bored(&mut self) -> State {
        self.display_do("brightness", |d| d.set_brightness(3));
        self.display_do("pattern", |d| d.set_pattern(Pattern::Bored));

        // Settle yesterday's debts before taking new visitors.
        self.store.flush_pending(self.settings.flush_per_cycle);

        let reader = match self.take_reader() {
            Some(reader) => reader,
            None => {
                thread::sleep(self.settings.retry_cooldown);
                return State::Bored;
            }
        };

        let worker = InventoryWorker::spawn(
            reader,
            WorkerGoal::Collect {
                target: self.settings.target_tags,
                timeout: self.settings.inventory_timeout,
            },
            self.settings.poll_interval,
        );

        let report = match worker.wait(&self.shutdown) {
            Some(report) => report,
            None => {
                error!("inventory worker died; reprobing the reader next cycle");
                self.reader = None;
                return State::Error;
            }
        };
        self.reader = Some(report.reader);

        match report.outcome {
            WorkerOutcome::Complete(inventory) => {
                info!("{} tags detected", inventory.len());
                State::Thinking(inventory)
            }
            WorkerOutcome::TimedOut => {
                thread::sleep(self.settings.retry_cooldown);
                State::Bored
            }
            WorkerOutcome::Cancelled => State::Bored,
            WorkerOutcome::Cleared => State::Bored,
            WorkerOutcome::Lost(e) => {
                error!("reader lost during inventory: {}", e);
                self.reader = None;
                State::Error
            }
        }
    }

    fn do_thinking(&mut self, inventory: Inventory) -> State {
        self.display_do("brightness", |d| d.set_brightness(6));
        self.display_do("pattern", |d| d.set_pattern(Pattern::Thinking));

        let answers = match resolve_answers(&self.catalog, &inventory) {
            Ok(answers) => answers,
            Err(fault) => {
                warn!("cycle abandoned: {}", fault);
                return State::Error;
            }
        };
        for (answer, title) in &answers {
            info!("  {}: answer {} ({})", answer.question_label(), answer.index, title);
        }

        let profile = Profile::from_answers(&answers);
        let figurine_id = match mapper::encode(profile.answer_indices) {
            Some(id) => id,
            None => {
                error!("answer indices escaped their bounds: {:?}", profile.answer_indices);
                return State::Error;
            }
        };
        info!("figurine {} of {}", figurine_id, mapper::TOTAL_IDS);

        let shapes = match mapper::shapes_of(figurine_id) {
            Some(shapes) => shapes,
            None => {
                error!("no shapes for id {}", figurine_id);
                return State::Error;
            }
        };
        let figurine =
            compose(&shapes, self.settings.figurine_height).rasterize(PAGE_WIDTH_DOTS);

        // May block on the rate limiter's minute slot; the THINKING pattern
        // is already up.
        let content = self.content.generate(&profile);

        let record = SlipRecord {
            slip_uuid: Uuid::new_v4(),
            figurine_id,
            answer_indices: profile.answer_indices,
            title: answers[0].1.clone(),
            paragraph1: content.paragraphs.first,
            paragraph2: content.paragraphs.second,
            resources_tools: pick_resource(&self.catalog, &answers, ResourceKind::Tools),
            resources_places: pick_resource(&self.catalog, &answers, ResourceKind::Places),
            resources_programs: pick_resource(&self.catalog, &answers, ResourceKind::Programs),
            used_fallback: content.used_fallback,
            printed: false,
            generated_at: Utc::now(),
            uploaded: false,
        };
        debug_assert!(record.is_consistent());

        State::Printing { record, figurine }
    }

    fn do_printing(&mut self, mut record: SlipRecord, figurine: Raster) -> State {
        self.display_do("speed", |d| d.set_speed(8));
        self.display_do("pattern", |d| d.set_pattern(Pattern::Finish));

        if self.settings.print_enabled && self.printer.is_some() {
            record.printed = self.try_print(&record, &figurine);
            if record.printed {
                info!("slip {} printed", record.slip_uuid);
                thermal::log_temperatures();
            } else {
                self.display_do("pattern", |d| d.set_pattern(Pattern::Error));
                thread::sleep(PRINT_ERROR_BLINK);
                self.display_do("pattern", |d| d.set_pattern(Pattern::Finish));
            }
        } else {
            info!("printing disabled, slip {} stays unprinted", record.slip_uuid);
        }

        if let Err(e) = self.store.persist_and_upload(&mut record, Some(&figurine)) {
            error!("could not persist slip {}: {}", record.slip_uuid, e);
            return State::Error;
        }

        State::RemoveWait
    }

    /// One print attempt plus one retry after reopening the device.
    fn try_print(&mut self, record: &SlipRecord, figurine: &Raster) -> bool {
        let qr_url = record.gallery_url(&self.settings.gallery_url);

        for attempt in 1..=2 {
            let printer = match self.printer.as_mut() {
                Some(printer) => printer,
                None => return false,
            };
            match print_receipt(printer, record, figurine, &qr_url) {
                Ok(()) => return true,
                Err(e) => {
                    warn!("print attempt {}/2 failed: {}", attempt, e);
                    if attempt == 1 {
                        self.reopen_printer();
                    }
                }
            }
        }
        false
    }

    fn reopen_printer(&mut self) {
        let path = match self.printer.as_ref().and_then(|p| p.device_path()) {
            Some(path) => path.to_path_buf(),
            // Capture printers have nothing to reopen.
            None => return,
        };
        match Printer::open(&path) {
            Ok(printer) => self.printer = Some(printer),
            Err(e) => warn!("printer reopen failed: {}", e),
        }
    }

    fn do_remove_wait(&mut self) -> State {
        self.display_do("pattern", |d| d.set_pattern(Pattern::RemoveFigure));

        let next = match self.take_reader() {
            None => {
                // Nothing to poll with; give the visitor the usual window.
                thread::sleep(self.settings.remove_timeout);
                State::Bored
            }
            Some(reader) => {
                let worker = InventoryWorker::spawn(
                    reader,
                    WorkerGoal::AwaitClear {
                        timeout: self.settings.remove_timeout,
                    },
                    self.settings.poll_interval,
                );
                match worker.wait(&self.shutdown) {
                    None => {
                        error!("inventory worker died during remove-wait");
                        self.reader = None;
                        State::Error
                    }
                    Some(report) => {
                        self.reader = Some(report.reader);
                        match report.outcome {
                            WorkerOutcome::Cleared => {
                                info!("tray cleared");
                                State::Bored
                            }
                            WorkerOutcome::TimedOut => {
                                info!("remove-wait window elapsed with tags still present");
                                State::Bored
                            }
                            WorkerOutcome::Cancelled => State::Bored,
                            WorkerOutcome::Complete(_) => State::Bored,
                            WorkerOutcome::Lost(e) => {
                                error!("reader lost during remove-wait: {}", e);
                                self.reader = None;
                                State::Error
                            }
                        }
                    }
                }
            }
        };

        self.display_do("clear", |d| d.clear());
        self.display_do("brightness", |d| d.set_brightness(5));
        self.display_do("speed", |d| d.set_speed(5));
        next
    }

    fn do_error(&mut self) -> State {
        self.display_do("pattern", |d| d.set_pattern(Pattern::Error));
        thread::sleep(self.settings.error_ack);
        State::Bored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testutil::{epc_for, full_catalog};
    use crate::shapes::SHAPES;

    fn inventory_for(answers: [usize; 6]) -> Inventory {
        let mut inventory = Inventory::new();
        for (q, a) in answers.into_iter().enumerate() {
            inventory.insert(epc_for(q, a), -50);
        }
        inventory
    }

    #[test]
    fn resolve_orders_answers_by_question() {
        let (_dir, catalog) = full_catalog();
        let answers = resolve_answers(&catalog, &inventory_for([0, 1, 2, 3, 4, 0])).unwrap();
        assert_eq!(answers.len(), 6);
        for (q, (answer, title)) in answers.iter().enumerate() {
            assert_eq!(answer.question as usize, q);
            assert_eq!(title, &format!("Title Q{}A{}", q + 1, answer.index));
        }
    }

    #[test]
    fn unregistered_tag_aborts_resolution() {
        let (_dir, catalog) = full_catalog();
        let mut inventory = inventory_for([0, 0, 0, 0, 0, 0]);
        inventory.insert(Epc::new("FEEDFACE"), -40);
        assert!(matches!(
            resolve_answers(&catalog, &inventory),
            Err(CycleFault::UnregisteredTag(_))
        ));
    }

    #[test]
    fn missing_question_aborts_resolution() {
        let (_dir, catalog) = full_catalog();
        let mut inventory = Inventory::new();
        // Five questions covered, F06 missing, plus a duplicate on F01.
        for (q, a) in [(0usize, 0usize), (1, 1), (2, 1), (3, 0), (4, 2)] {
            inventory.insert(epc_for(q, a), -50);
        }
        inventory.insert(epc_for(0, 3), -45);
        let fault = resolve_answers(&catalog, &inventory).unwrap_err();
        assert!(matches!(fault, CycleFault::QuestionNotCovered(ref q) if q == "F06"));
    }

    #[test]
    fn golden_path_maps_all_first_answers_to_id_one() {
        let (_dir, catalog) = full_catalog();
        let answers = resolve_answers(&catalog, &inventory_for([0, 0, 0, 0, 0, 0])).unwrap();
        let profile = Profile::from_answers(&answers);
        assert_eq!(profile.answer_indices, [0, 0, 0, 0, 0, 0]);

        let id = mapper::encode(profile.answer_indices).unwrap();
        assert_eq!(id, 1);

        let shapes = mapper::shapes_of(id).unwrap();
        assert_eq!(
            shapes,
            [
                SHAPES[5][0],
                SHAPES[4][0],
                SHAPES[3][0],
                SHAPES[2][0],
                SHAPES[1][0],
                SHAPES[0][0],
            ]
        );
    }

    #[test]
    fn maximum_answers_map_to_the_last_id() {
        let (_dir, catalog) = full_catalog();
        let answers = resolve_answers(&catalog, &inventory_for([5, 4, 4, 5, 5, 4])).unwrap();
        let profile = Profile::from_answers(&answers);
        assert_eq!(mapper::encode(profile.answer_indices), Some(mapper::TOTAL_IDS));
    }

    #[test]
    fn resources_come_from_the_first_answer_that_has_them() {
        let (_dir, catalog) = full_catalog();
        let answers = resolve_answers(&catalog, &inventory_for([2, 1, 0, 0, 0, 0])).unwrap();
        assert_eq!(
            pick_resource(&catalog, &answers, ResourceKind::Tools),
            "tool 1-2"
        );
        assert_eq!(
            pick_resource(&catalog, &answers, ResourceKind::Places),
            "place 1-2"
        );
        // The fixture leaves every programs cell empty.
        assert_eq!(
            pick_resource(&catalog, &answers, ResourceKind::Programs),
            ""
        );
    }
}
