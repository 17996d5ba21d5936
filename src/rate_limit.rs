//! Persistent request budget for the content service.
//!
//! Two buckets: a sliding minute window and a daily counter, both stored in a
//! small JSON file. Every read-modify-write happens under an exclusive
//! `flock`, so several processes (the service, diagnostics scripts) can share
//! one quota without double-spending.

use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    error::Error,
    fmt,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, Write},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct MinuteBucket {
    /// Unix seconds when the current minute window opened.
    start: i64,
    count: u32,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct DayBucket {
    /// `YYYY-MM-DD`, UTC.
    date: String,
    count: u32,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct Window {
    minute: MinuteBucket,
    day: DayBucket,
}

#[derive(Debug)]
pub enum RateLimitError {
    /// The daily budget is gone, or the minute window would outlast the
    /// caller's patience.
    QuotaExceeded,
    Io(io::Error),
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::QuotaExceeded => write!(f, "request quota exceeded"),
            RateLimitError::Io(e) => write!(f, "rate limit state io error: {}", e),
        }
    }
}

impl Error for RateLimitError {}

impl From<io::Error> for RateLimitError {
    fn from(value: io::Error) -> Self {
        RateLimitError::Io(value)
    }
}

pub struct RateLimiter {
    path: PathBuf,
    rpm_limit: u32,
    daily_limit: u32,
    max_wait: Duration,
}

fn lock_exclusive(file: &File) -> io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl RateLimiter {
    pub fn new(path: &Path, rpm_limit: u32, daily_limit: u32, max_wait: Duration) -> Self {
        RateLimiter {
            path: path.to_path_buf(),
            rpm_limit,
            daily_limit,
            max_wait,
        }
    }

    /// Reserve one request slot, blocking up to `max_wait` for the minute
    /// window to roll over. On success both counters have already been spent
    /// and persisted.
    pub fn check_and_reserve(&self) -> Result<(), RateLimitError> {
        let began = Instant::now();
        loop {
            let wait = self.try_reserve()?;
            let wait = match wait {
                None => return Ok(()),
                Some(wait) => wait,
            };
            if began.elapsed() + wait > self.max_wait {
                return Err(RateLimitError::QuotaExceeded);
            }
            thread::sleep(wait);
        }
    }

    /// One locked read-modify-write pass. `Ok(None)` means the slot was
    /// reserved; `Ok(Some(wait))` means the minute bucket is full and the
    /// lock has been released for the duration.
    fn try_reserve(&self) -> Result<Option<Duration>, RateLimitError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        lock_exclusive(&file)?;

        let mut window = read_window(&mut file);
        let now = Utc::now();
        let now_secs = now.timestamp();
        let today = now.format("%Y-%m-%d").to_string();

        if window.day.date != today {
            window.day = DayBucket {
                date: today,
                count: 0,
            };
        }
        if now_secs - window.minute.start >= 60 {
            window.minute = MinuteBucket {
                start: now_secs,
                count: 0,
            };
        }

        if window.day.count >= self.daily_limit {
            // Dropping the handle closes the descriptor and releases the lock.
            return Err(RateLimitError::QuotaExceeded);
        }
        if window.minute.count >= self.rpm_limit {
            let remaining = 60 - (now_secs - window.minute.start);
            return Ok(Some(Duration::from_secs(remaining.max(1) as u64)));
        }

        window.minute.count += 1;
        window.day.count += 1;
        write_window(&mut file, &window)?;
        Ok(None)
    }
}

fn read_window(file: &mut File) -> Window {
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_err() || contents.trim().is_empty() {
        return Window::default();
    }
    match serde_json::from_str(&contents) {
        Ok(window) => window,
        Err(e) => {
            warn!("rate limit state unreadable ({}), starting fresh", e);
            Window::default()
        }
    }
}

fn write_window(file: &mut File, window: &Window) -> io::Result<()> {
    let json = serde_json::to_string(window).map_err(io::Error::other)?;
    file.rewind()?;
    file.set_len(0)?;
    file.write_all(json.as_bytes())?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_at(dir: &tempfile::TempDir, rpm: u32, daily: u32, wait: Duration) -> RateLimiter {
        RateLimiter::new(&dir.path().join("window.json"), rpm, daily, wait)
    }

    fn stored_window(dir: &tempfile::TempDir) -> Window {
        let raw = std::fs::read_to_string(dir.path().join("window.json")).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn reservations_accumulate_in_both_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = limiter_at(&dir, 100, 1000, Duration::ZERO);
        for _ in 0..7 {
            limiter.check_and_reserve().unwrap();
        }
        let window = stored_window(&dir);
        assert_eq!(window.minute.count, 7);
        assert_eq!(window.day.count, 7);
    }

    #[test]
    fn full_minute_bucket_fails_fast_when_waiting_is_pointless() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = limiter_at(&dir, 2, 1000, Duration::ZERO);
        limiter.check_and_reserve().unwrap();
        limiter.check_and_reserve().unwrap();
        assert!(matches!(
            limiter.check_and_reserve(),
            Err(RateLimitError::QuotaExceeded)
        ));
    }

    #[test]
    fn exhausted_daily_budget_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = limiter_at(&dir, 100, 1, Duration::from_secs(120));
        limiter.check_and_reserve().unwrap();
        assert!(matches!(
            limiter.check_and_reserve(),
            Err(RateLimitError::QuotaExceeded)
        ));
    }

    #[test]
    fn stale_day_bucket_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("window.json");
        std::fs::write(
            &path,
            r#"{"minute":{"start":0,"count":0},"day":{"date":"2001-01-01","count":999999}}"#,
        )
        .unwrap();
        let limiter = RateLimiter::new(&path, 10, 10, Duration::ZERO);
        limiter.check_and_reserve().unwrap();
        assert_eq!(stored_window(&dir).day.count, 1);
    }

    #[test]
    fn stale_minute_bucket_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("window.json");
        let old_start = Utc::now().timestamp() - 120;
        let today = Utc::now().format("%Y-%m-%d").to_string();
        std::fs::write(
            &path,
            format!(
                r#"{{"minute":{{"start":{},"count":10}},"day":{{"date":"{}","count":10}}}}"#,
                old_start, today
            ),
        )
        .unwrap();
        let limiter = RateLimiter::new(&path, 10, 100, Duration::ZERO);
        limiter.check_and_reserve().unwrap();
        let window = stored_window(&dir);
        assert_eq!(window.minute.count, 1);
        assert_eq!(window.day.count, 11);
    }

    #[test]
    fn corrupt_state_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("window.json");
        std::fs::write(&path, "not json at all").unwrap();
        let limiter = RateLimiter::new(&path, 10, 10, Duration::ZERO);
        limiter.check_and_reserve().unwrap();
        assert_eq!(stored_window(&dir).minute.count, 1);
    }

    #[test]
    fn racing_limiters_never_overspend_the_minute() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("window.json");
        let rpm = 5u32;

        // Each thread builds its own limiter over the same file, like
        // independent processes sharing one quota.
        let mut handles = Vec::new();
        for _ in 0..8 {
            let path = path.clone();
            handles.push(thread::spawn(move || {
                let limiter = RateLimiter::new(&path, rpm, 1000, Duration::ZERO);
                limiter.check_and_reserve().is_ok()
            }));
        }
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, rpm as usize);
        let window = stored_window(&dir);
        assert_eq!(window.minute.count, rpm);
        assert_eq!(window.day.count, rpm);
    }
}
