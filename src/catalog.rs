//! The read-only answer catalog.
//!
//! Loaded once at startup from a CSV export of the curators' spreadsheet.
//! Each row registers one transponder: which question it belongs to, which
//! answer it encodes, the two-word title printed on the slip, and up to three
//! resource recommendations. The catalog never changes while the service is
//! running.

use crate::Epc;

use log::warn;
use serde::Deserialize;
use std::{collections::HashMap, error::Error, fmt, path::Path};

/// Questions F01..F06.
pub const QUESTION_COUNT: usize = 6;

/// Number of possible answers per question.
pub const ANSWER_COUNTS: [usize; 6] = [6, 5, 5, 6, 6, 5];

/// One resolved answer: a question axis and the 0-based answer index on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Answer {
    pub question: u8,
    pub index: u8,
}

impl Answer {
    /// The spreadsheet's question label, `F01`..`F06`.
    pub fn question_label(&self) -> String {
        format!("F{:02}", self.question + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Tools,
    Places,
    Programs,
}

#[derive(Debug, Clone)]
struct AnswerMeta {
    title: String,
    tools: String,
    places: String,
    programs: String,
}

/// In-memory catalog: EPC lookup plus per-answer metadata.
#[derive(Debug)]
pub struct Catalog {
    by_epc: HashMap<Epc, Answer>,
    meta: Vec<Vec<AnswerMeta>>,
}

#[derive(Debug, Deserialize)]
struct Row {
    epc: String,
    question: String,
    answer: u8,
    title: String,
    #[serde(default)]
    tools: String,
    #[serde(default)]
    places: String,
    #[serde(default)]
    programs: String,
}

#[derive(Debug)]
pub enum CatalogError {
    Csv(csv::Error),
    UnknownQuestion(String),
    AnswerOutOfRange { question: String, index: u8 },
    DuplicateEpc(Epc),
    MissingAnswer { question: String, index: usize },
    EmptyTitle { question: String, index: usize },
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Csv(e) => write!(f, "catalog csv error: {}", e),
            CatalogError::UnknownQuestion(q) => write!(f, "unknown question id {:?}", q),
            CatalogError::AnswerOutOfRange { question, index } => {
                write!(f, "answer index {} out of range for {}", index, question)
            }
            CatalogError::DuplicateEpc(epc) => write!(f, "EPC {} registered twice", epc),
            CatalogError::MissingAnswer { question, index } => {
                write!(f, "no catalog row for {} answer {}", question, index)
            }
            CatalogError::EmptyTitle { question, index } => {
                write!(f, "empty title for {} answer {}", question, index)
            }
        }
    }
}

impl Error for CatalogError {}

impl From<csv::Error> for CatalogError {
    fn from(value: csv::Error) -> Self {
        CatalogError::Csv(value)
    }
}

fn parse_question(label: &str) -> Option<u8> {
    match label.trim() {
        "F01" => Some(0),
        "F02" => Some(1),
        "F03" => Some(2),
        "F04" => Some(3),
        "F05" => Some(4),
        "F06" => Some(5),
        _ => None,
    }
}

impl Catalog {
    /// Load and validate the catalog. Every `(question, answer)` pair must be
    /// covered by at least one row with a non-empty title; resource columns
    /// may be empty.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let mut reader = csv::Reader::from_path(path)?;

        let mut by_epc: HashMap<Epc, Answer> = HashMap::new();
        let mut meta: Vec<Vec<Option<AnswerMeta>>> = ANSWER_COUNTS
            .iter()
            .map(|count| vec![None; *count])
            .collect();

        for row in reader.deserialize::<Row>() {
            let row = row?;
            let question = parse_question(&row.question)
                .ok_or_else(|| CatalogError::UnknownQuestion(row.question.clone()))?;
            if row.answer as usize >= ANSWER_COUNTS[question as usize] {
                return Err(CatalogError::AnswerOutOfRange {
                    question: row.question,
                    index: row.answer,
                });
            }

            let epc = Epc::new(&row.epc);
            let answer = Answer {
                question,
                index: row.answer,
            };
            if by_epc.insert(epc.clone(), answer).is_some() {
                return Err(CatalogError::DuplicateEpc(epc));
            }

            let slot = &mut meta[question as usize][row.answer as usize];
            match slot {
                None => {
                    *slot = Some(AnswerMeta {
                        title: row.title.trim().to_string(),
                        tools: row.tools.trim().to_string(),
                        places: row.places.trim().to_string(),
                        programs: row.programs.trim().to_string(),
                    });
                }
                Some(existing) => {
                    // Additional tags for an already-described answer only
                    // add an EPC mapping; the first row's text wins.
                    if existing.title != row.title.trim() {
                        warn!(
                            "catalog: {} answer {} has conflicting titles, keeping {:?}",
                            answer.question_label(),
                            row.answer,
                            existing.title
                        );
                    }
                }
            }
        }

        let mut full = Vec::with_capacity(QUESTION_COUNT);
        for (q, slots) in meta.into_iter().enumerate() {
            let mut row = Vec::with_capacity(slots.len());
            for (a, slot) in slots.into_iter().enumerate() {
                let entry = slot.ok_or_else(|| CatalogError::MissingAnswer {
                    question: format!("F{:02}", q + 1),
                    index: a,
                })?;
                if entry.title.is_empty() {
                    return Err(CatalogError::EmptyTitle {
                        question: format!("F{:02}", q + 1),
                        index: a,
                    });
                }
                row.push(entry);
            }
            full.push(row);
        }

        Ok(Catalog {
            by_epc,
            meta: full,
        })
    }

    /// Resolve a transponder to its answer; `None` means an unregistered tag.
    pub fn answer_of(&self, epc: &Epc) -> Option<Answer> {
        self.by_epc.get(epc).copied()
    }

    pub fn title(&self, answer: Answer) -> &str {
        &self.meta[answer.question as usize][answer.index as usize].title
    }

    /// Resource text for an answer; the empty string when the spreadsheet
    /// left the cell blank.
    pub fn resource(&self, answer: Answer, kind: ResourceKind) -> &str {
        let entry = &self.meta[answer.question as usize][answer.index as usize];
        match kind {
            ResourceKind::Tools => &entry.tools,
            ResourceKind::Places => &entry.places,
            ResourceKind::Programs => &entry.programs,
        }
    }

    /// Number of registered transponders.
    pub fn registered_tags(&self) -> usize {
        self.by_epc.len()
    }
}

/// Test fixtures shared with the orchestrator's tests.
#[cfg(test)]
pub mod testutil {
    use super::*;
    use std::io::Write;

    /// EPC registered for `(question, answer)` in [`full_catalog_csv`].
    pub fn epc_for(question: usize, answer: usize) -> Epc {
        Epc::new(&format!("E200F{:02}A{:02}0000", question + 1, answer))
    }

    /// A complete catalog with one EPC per answer, deterministic test EPCs.
    pub fn full_catalog_csv() -> String {
        let mut out = String::from("epc,question,answer,title,tools,places,programs\n");
        for (q, count) in ANSWER_COUNTS.iter().enumerate() {
            for a in 0..*count {
                out.push_str(&format!(
                    "{},F{:02},{},Title Q{}A{},tool {}-{},place {}-{},\n",
                    epc_for(q, a),
                    q + 1,
                    a,
                    q + 1,
                    a,
                    q + 1,
                    a,
                    q + 1,
                    a
                ));
            }
        }
        out
    }

    /// A loaded full catalog, plus the tempdir keeping its file alive.
    pub fn full_catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(full_catalog_csv().as_bytes()).unwrap();
        let catalog = Catalog::load(&path).unwrap();
        (dir, catalog)
    }
}
