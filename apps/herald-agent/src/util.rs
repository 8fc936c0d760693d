use chrono::{DateTime, FixedOffset, Timelike, Utc};
use once_cell::sync::{Lazy, OnceCell};
use std::path::PathBuf;
use std::sync::Mutex;
#[cfg(test)]
use std::{path::Path, sync::MutexGuard};

static STATE_DIR: Lazy<Mutex<OnceCell<PathBuf>>> = Lazy::new(|| Mutex::new(OnceCell::new()));

pub fn state_dir() -> PathBuf {
    let cell = STATE_DIR.lock().expect("state dir cache lock");
    if let Some(existing) = cell.get() {
        return existing.clone();
    }

    let resolved = std::env::var("HERALD_STATE_DIR")
        .ok()
        .filter(|raw| !raw.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("state"));

    // Value cannot be set by another thread while we hold the lock, but ignore the
    // Result to avoid double-panicking should it ever happen.
    let _ = cell.set(resolved.clone());
    resolved
}

/// Parse a `+09:00` style offset. Invalid input falls back to UTC so a bad
/// env value never breaks date bucketing.
pub fn parse_offset(offset: &str) -> FixedOffset {
    offset
        .trim()
        .parse::<FixedOffset>()
        .unwrap_or_else(|_| FixedOffset::east_opt(0).expect("utc offset"))
}

/// Calendar date key (`YYYY-MM-DD`) for `now` in the given offset.
pub fn local_date_key(offset: &str, now: DateTime<Utc>) -> String {
    now.with_timezone(&parse_offset(offset))
        .format("%Y-%m-%d")
        .to_string()
}

/// Fraction of the local day elapsed at `now`, in `[0,1)`.
pub fn local_day_fraction(offset: &str, now: DateTime<Utc>) -> f64 {
    let local = now.with_timezone(&parse_offset(offset));
    (local.num_seconds_from_midnight() as f64 / 86_400.0).clamp(0.0, 1.0)
}

#[cfg(test)]
pub(crate) fn reset_state_dir_for_tests() {
    let mut cell = STATE_DIR.lock().expect("state dir cache lock");
    cell.take();
}

#[cfg(test)]
static STATE_DIR_TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[cfg(test)]
pub(crate) struct StateDirTestGuard {
    prev: Option<String>,
    _lock: MutexGuard<'static, ()>,
}

#[cfg(test)]
pub(crate) fn scoped_state_dir_for_tests(path: &Path) -> StateDirTestGuard {
    let lock = STATE_DIR_TEST_LOCK.lock().expect("state dir test lock");
    let prev = std::env::var("HERALD_STATE_DIR").ok();
    reset_state_dir_for_tests();
    std::env::set_var("HERALD_STATE_DIR", path.display().to_string());
    StateDirTestGuard { prev, _lock: lock }
}

#[cfg(test)]
impl Drop for StateDirTestGuard {
    fn drop(&mut self) {
        if let Some(prev) = &self.prev {
            std::env::set_var("HERALD_STATE_DIR", prev);
        } else {
            std::env::remove_var("HERALD_STATE_DIR");
        }
        reset_state_dir_for_tests();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn date_key_respects_offset() {
        let now = Utc.with_ymd_and_hms(2025, 11, 3, 16, 30, 0).single().expect("ts");
        assert_eq!(local_date_key("+09:00", now), "2025-11-04");
        assert_eq!(local_date_key("+00:00", now), "2025-11-03");
    }

    #[test]
    fn bad_offset_falls_back_to_utc() {
        let now = Utc.with_ymd_and_hms(2025, 11, 3, 16, 30, 0).single().expect("ts");
        assert_eq!(local_date_key("not-an-offset", now), "2025-11-03");
    }

    #[test]
    fn day_fraction_spans_unit_interval() {
        let morning = Utc.with_ymd_and_hms(2025, 11, 3, 0, 0, 0).single().expect("ts");
        let noon = Utc.with_ymd_and_hms(2025, 11, 3, 12, 0, 0).single().expect("ts");
        assert!(local_day_fraction("+00:00", morning) < 0.01);
        let mid = local_day_fraction("+00:00", noon);
        assert!((mid - 0.5).abs() < 0.01, "got {mid}");
    }
}
