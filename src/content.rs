//! Text generation for the slip: a remote model when quota and network
//! allow, a shipped table of offline paragraphs when they do not.
//!
//! `generate` is total. Whatever goes wrong upstream, the visitor still gets
//! two paragraphs; the slip records which source produced them.

use crate::catalog::Answer;
use crate::rate_limit::{RateLimitError, RateLimiter};

use log::{info, warn};
use rand::Rng;
use serde::Deserialize;
use std::{collections::HashMap, error::Error, fmt, path::Path, thread, time::Duration};

/// Attempts against the remote service before falling back.
const MAX_ATTEMPTS: u32 = 3;

/// First backoff delay; doubles per attempt, with ±20 % jitter.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

const TEMPERATURE: f64 = 0.8;
const MAX_OUTPUT_TOKENS: u32 = 1024;

/// Shipped defaults, used when the fallback table has no row for a triple.
const DEFAULT_PARAGRAPH_1: &str =
    "Du bringst Bewegung in Räume, in denen andere noch zögern. \
     Dein neugieriger Blick macht Wandel möglich.";
const DEFAULT_PARAGRAPH_2: &str =
    "Der Wunsch nach Klarheit ist ein guter Anfang – er verbindet dich mit \
     vielen, die gerade Neues erfinden. Das hier ist für dich:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paragraphs {
    pub first: String,
    pub second: String,
}

/// The outcome of one generation request, remote or offline.
#[derive(Debug, Clone)]
pub struct GeneratedContent {
    pub paragraphs: Paragraphs,
    pub used_fallback: bool,
}

/// Everything the prompt needs to know about one visitor's answer set.
#[derive(Debug, Clone)]
pub struct Profile {
    /// `(question label, answer title)` in F01..F06 order.
    pub entries: Vec<(String, String)>,
    pub answer_indices: [u8; 6],
}

impl Profile {
    pub fn from_answers(answers: &[(Answer, String)]) -> Self {
        let mut ordered: Vec<&(Answer, String)> = answers.iter().collect();
        ordered.sort_by_key(|(a, _)| a.question);

        let mut indices = [0u8; 6];
        let mut entries = Vec::with_capacity(ordered.len());
        for (answer, title) in ordered {
            indices[answer.question as usize] = answer.index;
            entries.push((answer.question_label(), title.clone()));
        }
        Profile {
            entries,
            answer_indices: indices,
        }
    }

    /// The three personality axes the fallback table is keyed on.
    fn fallback_key(&self) -> (u8, u8, u8) {
        (
            self.answer_indices[0],
            self.answer_indices[4],
            self.answer_indices[5],
        )
    }
}

#[derive(Debug)]
pub enum FallbackError {
    Csv(csv::Error),
}

impl fmt::Display for FallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackError::Csv(e) => write!(f, "fallback table error: {}", e),
        }
    }
}

impl Error for FallbackError {}

impl From<csv::Error> for FallbackError {
    fn from(value: csv::Error) -> Self {
        FallbackError::Csv(value)
    }
}

#[derive(Debug, Deserialize)]
struct FallbackRow {
    f01: u8,
    f05: u8,
    f06: u8,
    paragraph1: String,
    paragraph2: String,
}

/// Offline paragraphs keyed by the (F01, F05, F06) answer triple.
#[derive(Debug, Default)]
pub struct FallbackTable {
    rows: HashMap<(u8, u8, u8), Paragraphs>,
}

impl FallbackTable {
    pub fn load(path: &Path) -> Result<Self, FallbackError> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut rows = HashMap::new();
        for row in reader.deserialize::<FallbackRow>() {
            let row = row?;
            rows.insert(
                (row.f01, row.f05, row.f06),
                Paragraphs {
                    first: row.paragraph1,
                    second: row.paragraph2,
                },
            );
        }
        Ok(FallbackTable { rows })
    }

    /// Total: a missing key yields the shipped default pair.
    pub fn lookup(&self, key: (u8, u8, u8)) -> Paragraphs {
        self.rows.get(&key).cloned().unwrap_or(Paragraphs {
            first: DEFAULT_PARAGRAPH_1.to_string(),
            second: DEFAULT_PARAGRAPH_2.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Why one remote attempt did not produce paragraphs.
#[derive(Debug)]
enum RequestFault {
    /// Network trouble, 429, 5xx, or an unusable body. Worth another try.
    Transient(String),
    /// 401/403: the key is wrong, retrying cannot help.
    Auth(String),
    /// Any other 4xx: we sent something the service rejects.
    Rejected(String),
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    output: String,
}

pub struct ContentClient {
    http: reqwest::blocking::Client,
    api_url: Option<String>,
    api_key: Option<String>,
    model: String,
    limiter: RateLimiter,
    fallback: FallbackTable,
}

impl ContentClient {
    pub fn new(
        api_url: Option<String>,
        api_key: Option<String>,
        model: String,
        limiter: RateLimiter,
        fallback: FallbackTable,
    ) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        ContentClient {
            http,
            api_url,
            api_key,
            model,
            limiter,
            fallback,
        }
    }

    /// Produce the two slip paragraphs. Never fails: exhausted quota, dead
    /// networks and broken responses all land in the offline table.
    pub fn generate(&self, profile: &Profile) -> GeneratedContent {
        let (url, key) = match (&self.api_url, &self.api_key) {
            (Some(url), Some(key)) => (url, key),
            _ => {
                info!("content service not configured, using offline paragraphs");
                return self.offline(profile);
            }
        };

        match self.limiter.check_and_reserve() {
            Ok(()) => {}
            Err(RateLimitError::QuotaExceeded) => {
                warn!("content quota exhausted, using offline paragraphs");
                return self.offline(profile);
            }
            Err(RateLimitError::Io(e)) => {
                warn!("rate limit state unavailable ({}), using offline paragraphs", e);
                return self.offline(profile);
            }
        }

        let prompt = build_prompt(profile);
        for attempt in 1..=MAX_ATTEMPTS {
            match self.request_once(url, key, &prompt) {
                Ok(paragraphs) => {
                    info!("content generated remotely on attempt {}", attempt);
                    return GeneratedContent {
                        paragraphs,
                        used_fallback: false,
                    };
                }
                Err(RequestFault::Transient(why)) => {
                    warn!("content attempt {}/{} failed: {}", attempt, MAX_ATTEMPTS, why);
                    if attempt < MAX_ATTEMPTS {
                        thread::sleep(backoff(attempt));
                    }
                }
                Err(RequestFault::Auth(why)) => {
                    warn!("content service refused our key: {}", why);
                    return self.offline(profile);
                }
                Err(RequestFault::Rejected(why)) => {
                    warn!("content request rejected: {}", why);
                    return self.offline(profile);
                }
            }
        }
        warn!("content service unreachable, using offline paragraphs");
        self.offline(profile)
    }

    fn offline(&self, profile: &Profile) -> GeneratedContent {
        GeneratedContent {
            paragraphs: self.fallback.lookup(profile.fallback_key()),
            used_fallback: true,
        }
    }

    fn request_once(&self, url: &str, key: &str, prompt: &str) -> Result<Paragraphs, RequestFault> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "temperature": TEMPERATURE,
            "max_output_tokens": MAX_OUTPUT_TOKENS,
        });

        let response = self
            .http
            .post(url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .map_err(|e| RequestFault::Transient(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(RequestFault::Transient(format!("http {}", status)));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(RequestFault::Auth(format!("http {}", status)));
        }
        if status.is_client_error() {
            return Err(RequestFault::Rejected(format!("http {}", status)));
        }

        let parsed: ContentResponse = response
            .json()
            .map_err(|e| RequestFault::Transient(format!("bad body: {}", e)))?;
        split_paragraphs(&parsed.output)
            .ok_or_else(|| RequestFault::Transient("response held fewer than two paragraphs".into()))
    }
}

/// The prompt contract: the model must answer with exactly two paragraphs
/// separated by a blank line.
fn build_prompt(profile: &Profile) -> String {
    let mut prompt = String::from(
        "You write the text for a museum visitor's printed keepsake. \
         Based on the visitor's answers below, write exactly two warm, \
         personal paragraphs of at most 400 characters each, separated by \
         one blank line. No headings, no lists.\n\nAnswers:\n",
    );
    for (question, title) in &profile.entries {
        prompt.push_str(&format!("{} -> {}\n", question, title));
    }
    prompt
}

/// Extract the two paragraphs. Splits on the first blank line, falling back
/// to a single newline; anything with fewer than two non-empty parts is
/// unusable.
fn split_paragraphs(text: &str) -> Option<Paragraphs> {
    let text = text.trim();
    let mut parts: Vec<&str> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() < 2 {
        parts = text
            .split('\n')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
    }
    if parts.len() < 2 {
        return None;
    }
    Some(Paragraphs {
        first: parts[0].to_string(),
        second: parts[1..].join(" "),
    })
}

fn backoff(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.as_millis() as u64 * 2u64.pow(attempt - 1);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((base as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Answer;
    use std::io::Write;

    fn profile() -> Profile {
        let answers: Vec<(Answer, String)> = (0..6)
            .map(|q| {
                (
                    Answer {
                        question: q,
                        index: q % 2,
                    },
                    format!("Title {}", q),
                )
            })
            .collect();
        Profile::from_answers(&answers)
    }

    fn limiter(dir: &tempfile::TempDir) -> RateLimiter {
        RateLimiter::new(
            &dir.path().join("window.json"),
            100,
            1000,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn profile_orders_entries_and_indices_by_question() {
        let answers = vec![
            (Answer { question: 5, index: 4 }, "Last".to_string()),
            (Answer { question: 0, index: 3 }, "First".to_string()),
            (Answer { question: 2, index: 1 }, "Mid".to_string()),
        ];
        let profile = Profile::from_answers(&answers);
        assert_eq!(profile.entries[0], ("F01".to_string(), "First".to_string()));
        assert_eq!(profile.entries[2], ("F06".to_string(), "Last".to_string()));
        assert_eq!(profile.answer_indices[0], 3);
        assert_eq!(profile.answer_indices[5], 4);
    }

    #[test]
    fn blank_line_separates_the_paragraphs() {
        let p = split_paragraphs("First bit.\n\nSecond bit.").unwrap();
        assert_eq!(p.first, "First bit.");
        assert_eq!(p.second, "Second bit.");
    }

    #[test]
    fn single_newlines_work_as_a_fallback_split() {
        let p = split_paragraphs("First bit.\nSecond bit.\nThird bit.").unwrap();
        assert_eq!(p.first, "First bit.");
        assert_eq!(p.second, "Second bit. Third bit.");
    }

    #[test]
    fn one_paragraph_is_not_enough() {
        assert_eq!(split_paragraphs("Only one thing to say."), None);
        assert_eq!(split_paragraphs("   \n\n  "), None);
    }

    #[test]
    fn prompt_lists_every_answer() {
        let prompt = build_prompt(&profile());
        for q in 1..=6 {
            assert!(prompt.contains(&format!("F{:02} ->", q)));
        }
    }

    #[test]
    fn fallback_table_prefers_matching_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "f01,f05,f06,paragraph1,paragraph2").unwrap();
        writeln!(file, "0,1,1,Custom one.,Custom two.").unwrap();
        let table = FallbackTable::load(&path).unwrap();

        let hit = table.lookup((0, 1, 1));
        assert_eq!(hit.first, "Custom one.");

        let miss = table.lookup((5, 4, 4));
        assert_eq!(miss.first, DEFAULT_PARAGRAPH_1);
        assert_eq!(miss.second, DEFAULT_PARAGRAPH_2);
    }

    #[test]
    fn unconfigured_client_always_answers_from_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let client = ContentClient::new(
            None,
            None,
            "test-model".into(),
            limiter(&dir),
            FallbackTable::default(),
        );
        let content = client.generate(&profile());
        assert!(content.used_fallback);
        assert!(!content.paragraphs.first.is_empty());
    }

    #[test]
    fn unreachable_service_falls_back_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens on the discard port; every attempt fails fast.
        let client = ContentClient::new(
            Some("http://127.0.0.1:9/generate".into()),
            Some("key".into()),
            "test-model".into(),
            limiter(&dir),
            FallbackTable::default(),
        );
        let content = client.generate(&profile());
        assert!(content.used_fallback);
        assert_eq!(content.paragraphs.second, DEFAULT_PARAGRAPH_2);
    }

    #[test]
    fn backoff_doubles_within_jitter_bounds() {
        for attempt in 1..=3 {
            let base = 1000u64 * 2u64.pow(attempt - 1);
            let d = backoff(attempt).as_millis() as u64;
            assert!(d >= base * 8 / 10, "attempt {}: {} too short", attempt, d);
            assert!(d <= base * 12 / 10 + 1, "attempt {}: {} too long", attempt, d);
        }
    }
}
