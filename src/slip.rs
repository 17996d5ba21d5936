//! The slip: the record we keep and the receipt the visitor keeps.

use crate::composer::Raster;
use crate::mapper;
use crate::printer::{Printer, PrinterError, Style, CHARS_PER_LINE};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One generated slip. Written to the log exactly once per cycle; the only
/// field that ever changes afterwards is `uploaded`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlipRecord {
    pub slip_uuid: Uuid,
    pub figurine_id: u32,
    pub answer_indices: [u8; 6],
    pub title: String,
    pub paragraph1: String,
    pub paragraph2: String,
    pub resources_tools: String,
    pub resources_places: String,
    pub resources_programs: String,
    pub used_fallback: bool,
    pub printed: bool,
    pub generated_at: DateTime<Utc>,
    pub uploaded: bool,
}

impl SlipRecord {
    /// The record's one internal invariant: the id and the indices agree.
    pub fn is_consistent(&self) -> bool {
        mapper::encode(self.answer_indices) == Some(self.figurine_id)
    }

    /// The gallery link the QR code carries.
    pub fn gallery_url(&self, base: &str) -> String {
        format!(
            "{}?data_id={}&figure_id={}",
            base, self.slip_uuid, self.figurine_id
        )
    }
}

/// Greedy word wrap at `width` columns. Words longer than a line are split
/// hard; the paper does not scroll sideways.
pub fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = String::new();
    for word in text.split_whitespace() {
        let mut word = word;
        while word.chars().count() > width {
            if !line.is_empty() {
                lines.push(std::mem::take(&mut line));
            }
            let split_at = word
                .char_indices()
                .nth(width)
                .map(|(i, _)| i)
                .unwrap_or(word.len());
            let (head, tail) = word.split_at(split_at);
            lines.push(head.to_string());
            word = tail;
        }
        let needed = word.chars().count() + if line.is_empty() { 0 } else { 1 };
        if line.chars().count() + needed > width && !line.is_empty() {
            lines.push(std::mem::take(&mut line));
        }
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(word);
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

fn paragraph(printer: &mut Printer, text: &str) {
    for line in wrap(text, CHARS_PER_LINE) {
        printer.text(&line, Style::default());
    }
    printer.feed(1);
}

fn labeled_section(printer: &mut Printer, label: &str, text: &str) {
    printer.text(label, Style::label());
    let body = if text.is_empty() { "-" } else { text };
    for line in wrap(body, CHARS_PER_LINE) {
        printer.text(&line, Style::default());
    }
    printer.feed(1);
}

/// Compose and print the whole receipt. Ends in exactly one cut, which is
/// also what flushes the page to the device.
pub fn print_receipt(
    printer: &mut Printer,
    record: &SlipRecord,
    figurine: &Raster,
    qr_url: &str,
) -> Result<(), PrinterError> {
    printer.text("UNFINISHED", Style::banner());
    printer.text("The Museum of Lifelong Learning", Style::centered());
    printer.feed(2);

    printer.image(figurine);
    printer.feed(1);

    printer.text(&record.title, Style { bold: true, center: true, wide: false });
    printer.text(
        &format!("{} of {}", record.figurine_id, mapper::TOTAL_IDS),
        Style::centered(),
    );
    printer.feed(1);

    paragraph(printer, &record.paragraph1);
    paragraph(printer, &record.paragraph2);

    labeled_section(printer, "Tools & Inspiration:", &record.resources_tools);
    labeled_section(printer, "Anlaufstellen & Angebote:", &record.resources_places);
    labeled_section(printer, "Programm-Empfehlung:", &record.resources_programs);

    printer.qrcode(qr_url, 6);
    printer.feed(1);

    printer.text("Bleib unfertig.", Style::centered());
    printer.text("Vielen Dank für deinen Besuch.", Style::centered());

    printer.cut()
}
