use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

/// A stored value plus its optional absolute expiry deadline.
pub(crate) struct Entry {
    pub(crate) value: String,
    pub(crate) expires_at: Option<Instant>,
}

impl Entry {
    pub(crate) fn new(value: String) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    /// The single liveness predicate. Both the lazy read path and the
    /// background sweeper decide through this, so the two can never
    /// disagree about whether a key is alive.
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Remaining lifetime in whole seconds, rounded up. `-1` = no expiry.
    fn ttl_remaining(&self, now: Instant) -> i64 {
        match self.expires_at {
            None => -1,
            Some(at) => {
                let left = at.saturating_duration_since(now);
                let mut secs = left.as_secs() as i64;
                if left.subsec_nanos() > 0 {
                    secs += 1;
                }
                secs
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StoreError {
    NotAnInteger,
    Overflow,
    NoSuchKey,
    ExpiryOutOfRange,
}

/// Compute an absolute deadline `seconds` out from `now`. Fails instead of
/// panicking when the deadline is not representable as an `Instant`.
fn deadline(now: Instant, seconds: u64) -> Result<Instant, StoreError> {
    now.checked_add(Duration::from_secs(seconds))
        .ok_or(StoreError::ExpiryOutOfRange)
}

/// The keyspace: sole owner of the key→entry map. All methods take `&mut`
/// because even pure reads may remove an entry whose expiry has passed.
pub(crate) struct Db {
    pub(crate) entries: HashMap<String, Entry>,
}

/// Handle under which every connection (and the sweeper) reaches the
/// keyspace. One lock guards the whole map, so each command executes as a
/// single non-interleaved step.
pub(crate) type Store = Arc<RwLock<Db>>;

fn note_expired(count: u64) {
    metrics::counter!("kvlite_expired_keys_total").increment(count);
}

impl Db {
    pub(crate) fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    fn sync_keys_gauge(&self) {
        metrics::gauge!("kvlite_keys_total").set(self.entries.len() as f64);
    }

    /// Lazy expiration for a single key: physically remove it if its
    /// deadline has passed, so later lookups see a plain miss.
    fn remove_if_expired(&mut self, key: &str, now: Instant) {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
            note_expired(1);
            self.sync_keys_gauge();
        }
    }

    pub(crate) fn get(&mut self, key: &str, now: Instant) -> Option<&str> {
        self.remove_if_expired(key, now);
        self.entries.get(key).map(|e| e.value.as_str())
    }

    /// Insert or overwrite; any previous expiry is replaced by `ttl`. A
    /// `ttl` whose deadline cannot be represented is rejected before any
    /// mutation.
    pub(crate) fn set(
        &mut self,
        key: String,
        value: String,
        ttl: Option<Duration>,
        now: Instant,
    ) -> Result<(), StoreError> {
        let expires_at = match ttl {
            None => None,
            Some(d) => Some(deadline(now, d.as_secs())?),
        };
        self.entries.insert(key, Entry { value, expires_at });
        self.sync_keys_gauge();
        Ok(())
    }

    pub(crate) fn delete(&mut self, key: &str, now: Instant) -> bool {
        self.remove_if_expired(key, now);
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.sync_keys_gauge();
        }
        removed
    }

    pub(crate) fn exists(&mut self, key: &str, now: Instant) -> bool {
        self.remove_if_expired(key, now);
        self.entries.contains_key(key)
    }

    /// Append to the stored value, creating it from the empty string if
    /// absent. An existing entry keeps its expiry. Returns the new length.
    pub(crate) fn append(&mut self, key: &str, suffix: &str, now: Instant) -> usize {
        self.remove_if_expired(key, now);
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.value.push_str(suffix);
                entry.value.len()
            }
            None => {
                let len = suffix.len();
                self.entries
                    .insert(key.to_string(), Entry::new(suffix.to_string()));
                self.sync_keys_gauge();
                len
            }
        }
    }

    pub(crate) fn strlen(&mut self, key: &str, now: Instant) -> usize {
        self.remove_if_expired(key, now);
        self.entries.get(key).map(|e| e.value.len()).unwrap_or(0)
    }

    /// Parse-or-default(0), apply the signed delta, re-encode as decimal.
    /// Validation happens before any mutation, so a failure leaves the
    /// entry untouched. An existing entry keeps its expiry.
    pub(crate) fn incr_by(&mut self, key: &str, delta: i64, now: Instant) -> Result<i64, StoreError> {
        self.remove_if_expired(key, now);
        let current: i64 = match self.entries.get(key) {
            None => 0,
            Some(entry) => entry.value.parse().map_err(|_| StoreError::NotAnInteger)?,
        };
        let next = current.checked_add(delta).ok_or(StoreError::Overflow)?;
        match self.entries.get_mut(key) {
            Some(entry) => entry.value = next.to_string(),
            None => {
                self.entries
                    .insert(key.to_string(), Entry::new(next.to_string()));
                self.sync_keys_gauge();
            }
        }
        Ok(next)
    }

    /// Set a TTL on an existing key. A TTL ≤ 0 deletes the key outright
    /// rather than scheduling a deadline in the past; a TTL too large to
    /// represent as a deadline is rejected with no mutation. `Ok(bool)`
    /// reports whether the key existed.
    pub(crate) fn expire(
        &mut self,
        key: &str,
        seconds: i64,
        now: Instant,
    ) -> Result<bool, StoreError> {
        self.remove_if_expired(key, now);
        if !self.entries.contains_key(key) {
            return Ok(false);
        }
        if seconds <= 0 {
            self.entries.remove(key);
            self.sync_keys_gauge();
            debug!(key = %key, "EXPIRE with non-positive TTL, key deleted");
            return Ok(true);
        }
        let at = deadline(now, seconds as u64)?;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(at);
        }
        Ok(true)
    }

    /// `-2` = absent (or already expired), `-1` = no expiry, otherwise
    /// remaining seconds rounded up.
    pub(crate) fn ttl(&mut self, key: &str, now: Instant) -> i64 {
        self.remove_if_expired(key, now);
        self.entries.get(key).map(|e| e.ttl_remaining(now)).unwrap_or(-2)
    }

    /// Live keys matching a `*`/`?` glob, sorted for deterministic output.
    pub(crate) fn keys(&mut self, pattern: &str, now: Instant) -> Vec<String> {
        self.purge_expired(now);
        let mut matched: Vec<String> = self
            .entries
            .keys()
            .filter(|key| glob_match(pattern.as_bytes(), key.as_bytes()))
            .cloned()
            .collect();
        matched.sort();
        matched
    }

    /// Move value + expiry from `src` onto `dst`, overwriting `dst`.
    pub(crate) fn rename(&mut self, src: &str, dst: &str, now: Instant) -> Result<(), StoreError> {
        self.remove_if_expired(src, now);
        let entry = self.entries.remove(src).ok_or(StoreError::NoSuchKey)?;
        self.entries.insert(dst.to_string(), entry);
        self.sync_keys_gauge();
        Ok(())
    }

    pub(crate) fn type_of(&mut self, key: &str, now: Instant) -> &'static str {
        if self.exists(key, now) { "string" } else { "none" }
    }

    /// Count of live keys.
    pub(crate) fn size(&mut self, now: Instant) -> usize {
        self.purge_expired(now);
        self.entries.len()
    }

    pub(crate) fn flush(&mut self) {
        self.entries.clear();
        self.sync_keys_gauge();
    }

    /// Physically drop every expired entry. The sweeper's whole job; also
    /// used by full-scan reads (KEYS, DBSIZE). Returns how many were
    /// removed.
    pub(crate) fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            note_expired(removed as u64);
            self.sync_keys_gauge();
        }
        removed
    }
}

// ── Glob matching ─────────────────────────────────────────────────────────────

/// Glob match over bytes: `*` matches any run (including empty), `?` matches
/// exactly one byte, everything else is literal.
///
/// Iterative, with backtracking only to the most recent `*`: worst case
/// O(pattern × text) and constant stack, so a hostile pattern from KEYS
/// cannot wedge the store or overflow the worker stack.
pub(crate) fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let mut p = 0;
    let mut t = 0;
    let mut star: Option<usize> = None;
    let mut mark = 0;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            // Mismatch past a `*`: retry it against one more byte of text.
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    fn expired_entry(value: &str) -> Entry {
        Entry {
            value: value.to_string(),
            expires_at: Some(Instant::now() - Duration::from_secs(1)),
        }
    }

    fn put(db: &mut Db, key: &str, value: &str) {
        db.set(key.to_string(), value.to_string(), None, now()).unwrap();
    }

    fn put_ttl(db: &mut Db, key: &str, value: &str, ttl: Duration) {
        db.set(key.to_string(), value.to_string(), Some(ttl), now())
            .unwrap();
    }

    // ── Entry ─────────────────────────────────────────────────────────────────

    #[test]
    fn entry_without_ttl_never_expires() {
        let e = Entry::new("v".into());
        assert!(!e.is_expired(now()));
        assert_eq!(e.ttl_remaining(now()), -1);
    }

    #[test]
    fn entry_future_deadline_not_expired() {
        let e = Entry {
            value: "v".into(),
            expires_at: Some(now() + Duration::from_secs(3600)),
        };
        assert!(!e.is_expired(now()));
        let left = e.ttl_remaining(now());
        assert!(left > 3590 && left <= 3600, "unexpected TTL: {left}");
    }

    #[test]
    fn entry_elapsed_deadline_is_expired() {
        let e = expired_entry("v");
        assert!(e.is_expired(now()));
        assert_eq!(e.ttl_remaining(now()), 0);
    }

    #[test]
    fn ttl_remaining_rounds_up() {
        let e = Entry {
            value: "v".into(),
            expires_at: Some(now() + Duration::from_millis(4500)),
        };
        assert_eq!(e.ttl_remaining(Instant::now()), 5);
    }

    // ── Basic ops ─────────────────────────────────────────────────────────────

    #[test]
    fn set_then_get_roundtrip() {
        let mut db = Db::new();
        put(&mut db, "k", "hello");
        assert_eq!(db.get("k", now()), Some("hello"));
    }

    #[test]
    fn get_missing_key_is_none() {
        let mut db = Db::new();
        assert_eq!(db.get("nope", now()), None);
    }

    #[test]
    fn set_overwrites_value_and_clears_ttl() {
        let mut db = Db::new();
        put_ttl(&mut db, "k", "v1", Duration::from_secs(100));
        put(&mut db, "k", "v2");
        assert_eq!(db.get("k", now()), Some("v2"));
        assert_eq!(db.ttl("k", now()), -1);
    }

    #[test]
    fn set_with_unrepresentable_ttl_is_rejected() {
        let mut db = Db::new();
        let huge = Duration::from_secs(i64::MAX as u64);
        assert_eq!(
            db.set("k".into(), "v".into(), Some(huge), now()),
            Err(StoreError::ExpiryOutOfRange)
        );
        assert!(!db.exists("k", now()));
    }

    #[test]
    fn delete_reports_whether_key_existed() {
        let mut db = Db::new();
        put(&mut db, "k", "v");
        assert!(db.delete("k", now()));
        assert!(!db.delete("k", now()));
        assert!(!db.exists("k", now()));
    }

    // ── Lazy expiration ───────────────────────────────────────────────────────

    #[test]
    fn expired_key_reads_as_absent_and_is_removed() {
        let mut db = Db::new();
        db.entries.insert("k".into(), expired_entry("v"));
        assert_eq!(db.get("k", now()), None);
        assert!(!db.entries.contains_key("k"));
    }

    #[test]
    fn expired_key_is_absent_for_exists_delete_and_ttl() {
        let mut db = Db::new();
        db.entries.insert("k".into(), expired_entry("v"));
        assert!(!db.exists("k", now()));
        db.entries.insert("k".into(), expired_entry("v"));
        assert!(!db.delete("k", now()));
        db.entries.insert("k".into(), expired_entry("v"));
        assert_eq!(db.ttl("k", now()), -2);
    }

    #[test]
    fn liveness_is_a_pure_function_of_now() {
        let mut db = Db::new();
        put_ttl(&mut db, "k", "v", Duration::from_secs(10));
        let later = Instant::now() + Duration::from_secs(11);
        // Same entry, different clock: dead from the future's point of view.
        assert!(db.entries["k"].is_expired(later));
        assert_eq!(db.get("k", later), None);
    }

    // ── APPEND / STRLEN ───────────────────────────────────────────────────────

    #[test]
    fn append_missing_key_starts_from_empty() {
        let mut db = Db::new();
        assert_eq!(db.append("k", "foo", now()), 3);
        assert_eq!(db.append("k", "bar", now()), 6);
        assert_eq!(db.get("k", now()), Some("foobar"));
    }

    #[test]
    fn append_preserves_expiry() {
        let mut db = Db::new();
        put_ttl(&mut db, "k", "a", Duration::from_secs(100));
        db.append("k", "b", now());
        assert!(db.ttl("k", now()) > 0);
    }

    #[test]
    fn strlen_of_missing_key_is_zero() {
        let mut db = Db::new();
        assert_eq!(db.strlen("nope", now()), 0);
        put(&mut db, "k", "hello");
        assert_eq!(db.strlen("k", now()), 5);
    }

    // ── Numeric ops ───────────────────────────────────────────────────────────

    #[test]
    fn incr_by_missing_key_defaults_to_zero() {
        let mut db = Db::new();
        assert_eq!(db.incr_by("n", 1, now()), Ok(1));
        assert_eq!(db.incr_by("n", 1, now()), Ok(2));
        assert_eq!(db.get("n", now()), Some("2"));
    }

    #[test]
    fn incr_by_negative_delta_decrements() {
        let mut db = Db::new();
        put(&mut db, "n", "10");
        assert_eq!(db.incr_by("n", -3, now()), Ok(7));
    }

    #[test]
    fn incr_by_non_integer_value_fails_without_mutation() {
        let mut db = Db::new();
        put(&mut db, "k", "hello");
        assert_eq!(db.incr_by("k", 1, now()), Err(StoreError::NotAnInteger));
        assert_eq!(db.get("k", now()), Some("hello"));
    }

    #[test]
    fn incr_by_overflow_fails_without_mutation() {
        let mut db = Db::new();
        put(&mut db, "n", &i64::MAX.to_string());
        assert_eq!(db.incr_by("n", 1, now()), Err(StoreError::Overflow));
        assert_eq!(db.get("n", now()), Some(i64::MAX.to_string().as_str()));
    }

    #[test]
    fn incr_by_preserves_expiry() {
        let mut db = Db::new();
        put_ttl(&mut db, "n", "1", Duration::from_secs(100));
        assert_eq!(db.incr_by("n", 1, now()), Ok(2));
        assert!(db.ttl("n", now()) > 0);
    }

    #[test]
    fn incr_by_parses_negative_stored_values() {
        let mut db = Db::new();
        put(&mut db, "n", "-5");
        assert_eq!(db.incr_by("n", 1, now()), Ok(-4));
    }

    // ── EXPIRE / TTL ──────────────────────────────────────────────────────────

    #[test]
    fn expire_on_missing_key_returns_false() {
        let mut db = Db::new();
        assert_eq!(db.expire("nope", 10, now()), Ok(false));
    }

    #[test]
    fn expire_sets_a_deadline() {
        let mut db = Db::new();
        put(&mut db, "k", "v");
        assert_eq!(db.expire("k", 5, now()), Ok(true));
        let ttl = db.ttl("k", now());
        assert!((0..=5).contains(&ttl), "unexpected TTL: {ttl}");
    }

    #[test]
    fn expire_zero_deletes_immediately() {
        let mut db = Db::new();
        put(&mut db, "k", "v");
        assert_eq!(db.expire("k", 0, now()), Ok(true));
        assert!(!db.exists("k", now()));
        // Repeated calls keep reporting the key as gone.
        assert_eq!(db.expire("k", 0, now()), Ok(false));
    }

    #[test]
    fn expire_negative_deletes_immediately() {
        let mut db = Db::new();
        put(&mut db, "k", "v");
        assert_eq!(db.expire("k", -7, now()), Ok(true));
        assert!(!db.exists("k", now()));
    }

    #[test]
    fn expire_with_unrepresentable_ttl_fails_without_mutation() {
        let mut db = Db::new();
        put(&mut db, "k", "v");
        assert_eq!(
            db.expire("k", i64::MAX, now()),
            Err(StoreError::ExpiryOutOfRange)
        );
        // The key is untouched and still has no expiry.
        assert_eq!(db.ttl("k", now()), -1);
    }

    #[test]
    fn ttl_distinguishes_missing_from_persistent() {
        let mut db = Db::new();
        assert_eq!(db.ttl("nope", now()), -2);
        put(&mut db, "k", "v");
        assert_eq!(db.ttl("k", now()), -1);
    }

    // ── KEYS ──────────────────────────────────────────────────────────────────

    #[test]
    fn keys_star_returns_all_sorted() {
        let mut db = Db::new();
        put(&mut db, "b", "2");
        put(&mut db, "a", "1");
        assert_eq!(db.keys("*", now()), vec!["a", "b"]);
    }

    #[test]
    fn keys_skips_and_purges_expired() {
        let mut db = Db::new();
        put(&mut db, "live", "1");
        db.entries.insert("dead".into(), expired_entry("2"));
        assert_eq!(db.keys("*", now()), vec!["live"]);
        assert!(!db.entries.contains_key("dead"));
    }

    #[test]
    fn keys_prefix_pattern() {
        let mut db = Db::new();
        put(&mut db, "foo", "1");
        put(&mut db, "foobar", "2");
        put(&mut db, "baz", "3");
        assert_eq!(db.keys("foo*", now()), vec!["foo", "foobar"]);
    }

    #[test]
    fn keys_question_mark_pattern() {
        let mut db = Db::new();
        put(&mut db, "hello", "1");
        put(&mut db, "hallo", "2");
        put(&mut db, "world", "3");
        assert_eq!(db.keys("h?llo", now()), vec!["hallo", "hello"]);
    }

    // ── RENAME / TYPE / DBSIZE / FLUSHDB ──────────────────────────────────────

    #[test]
    fn rename_moves_value_and_expiry() {
        let mut db = Db::new();
        put_ttl(&mut db, "src", "v", Duration::from_secs(100));
        assert_eq!(db.rename("src", "dst", now()), Ok(()));
        assert!(!db.exists("src", now()));
        assert_eq!(db.get("dst", now()), Some("v"));
        assert!(db.ttl("dst", now()) > 0);
    }

    #[test]
    fn rename_overwrites_destination() {
        let mut db = Db::new();
        put(&mut db, "src", "new");
        put(&mut db, "dst", "old");
        assert_eq!(db.rename("src", "dst", now()), Ok(()));
        assert_eq!(db.get("dst", now()), Some("new"));
        assert_eq!(db.size(now()), 1);
    }

    #[test]
    fn rename_missing_source_fails() {
        let mut db = Db::new();
        assert_eq!(db.rename("nope", "dst", now()), Err(StoreError::NoSuchKey));
    }

    #[test]
    fn rename_expired_source_fails() {
        let mut db = Db::new();
        db.entries.insert("src".into(), expired_entry("v"));
        assert_eq!(db.rename("src", "dst", now()), Err(StoreError::NoSuchKey));
    }

    #[test]
    fn type_of_is_string_or_none() {
        let mut db = Db::new();
        put(&mut db, "k", "v");
        assert_eq!(db.type_of("k", now()), "string");
        assert_eq!(db.type_of("nope", now()), "none");
    }

    #[test]
    fn size_counts_only_live_keys() {
        let mut db = Db::new();
        put(&mut db, "a", "1");
        db.entries.insert("dead".into(), expired_entry("2"));
        assert_eq!(db.size(now()), 1);
    }

    #[test]
    fn flush_empties_the_keyspace() {
        let mut db = Db::new();
        put(&mut db, "a", "1");
        put(&mut db, "b", "2");
        db.flush();
        assert_eq!(db.size(now()), 0);
    }

    #[test]
    fn purge_expired_reports_removed_count() {
        let mut db = Db::new();
        put(&mut db, "live", "1");
        db.entries.insert("d1".into(), expired_entry("x"));
        db.entries.insert("d2".into(), expired_entry("y"));
        assert_eq!(db.purge_expired(now()), 2);
        assert_eq!(db.purge_expired(now()), 0);
    }

    // ── glob_match ────────────────────────────────────────────────────────────

    #[test]
    fn glob_star_matches_any_run() {
        assert!(glob_match(b"*", b"hello"));
        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"h*", b"hello"));
        assert!(glob_match(b"*o", b"hello"));
        assert!(glob_match(b"h*o", b"hello"));
        assert!(!glob_match(b"h*x", b"hello"));
    }

    #[test]
    fn glob_question_mark_matches_exactly_one() {
        assert!(glob_match(b"h?llo", b"hello"));
        assert!(glob_match(b"h?llo", b"hallo"));
        assert!(!glob_match(b"h?llo", b"hllo"));
        assert!(!glob_match(b"h?llo", b"heello"));
    }

    #[test]
    fn glob_literal_must_match_exactly() {
        assert!(glob_match(b"hello", b"hello"));
        assert!(!glob_match(b"hello", b"hellop"));
        assert!(!glob_match(b"hello", b"hell"));
    }

    #[test]
    fn glob_consecutive_stars_collapse() {
        assert!(glob_match(b"a**b", b"ab"));
        assert!(glob_match(b"a**b", b"axyzb"));
        assert!(glob_match(b"***", b"anything"));
    }

    #[test]
    fn glob_many_stars_completes_quickly() {
        // Star-heavy patterns must stay cheap: backtracking is bounded by
        // the last `*` only, never a combinatorial search.
        let pattern = "a*".repeat(20) + "b";
        let text = "a".repeat(45);
        assert!(!glob_match(pattern.as_bytes(), text.as_bytes()));

        let pattern = "a*".repeat(20);
        assert!(glob_match(pattern.as_bytes(), text.as_bytes()));
    }

    #[test]
    fn glob_handles_frame_sized_patterns_without_recursion() {
        // Patterns can be as long as an input line; matching must not
        // consume stack in proportion to their length.
        let pattern = "x".repeat(64 * 1024);
        assert!(glob_match(pattern.as_bytes(), pattern.as_bytes()));
        assert!(!glob_match(pattern.as_bytes(), "y".repeat(64 * 1024).as_bytes()));
    }
}
