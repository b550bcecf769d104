//! Bounded in-memory entry store
//!
//! The `RingBuffer` keeps the most recent entries up to a count and a byte
//! budget, evicting oldest-first. Every insert gets a strictly increasing
//! sequence number; history pages are cut by sequence, so a cursor stays
//! valid while older entries are evicted underneath it.

use crate::types::{EntryType, LogEntry, Severity, MAX_BATCH_SIZE};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

/// Default page size of a history query
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Filters and paging for a history query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryQuery {
    /// Only this session
    pub session_id: Option<String>,
    /// Only this severity
    pub severity: Option<Severity>,
    /// Entries at or after this time
    pub from: Option<DateTime<Utc>>,
    /// Entries at or before this time
    pub to: Option<DateTime<Utc>>,
    /// Page size, defaults to 100
    pub limit: Option<usize>,
    /// Sequence to resume from
    pub cursor: Option<u64>,
}

impl HistoryQuery {
    /// Effective page size
    pub fn page_size(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_BATCH_SIZE)
    }

    /// Whether an entry passes every filter
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if matches!(&self.session_id, Some(id) if *id != entry.session_id) {
            return false;
        }
        if matches!(self.severity, Some(severity) if severity != entry.severity) {
            return false;
        }
        if matches!(self.from, Some(from) if entry.timestamp < from) {
            return false;
        }
        if matches!(self.to, Some(to) if entry.timestamp > to) {
            return false;
        }
        true
    }
}

/// One page of history
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    /// Matching entries in insertion order
    pub entries: Vec<LogEntry>,
    /// Sequence just past the last returned entry
    pub next_cursor: Option<u64>,
    /// Whether more matching entries follow
    pub has_more: bool,
}

/// Estimated in-memory footprint of an entry
pub fn estimate_entry_size(entry: &LogEntry) -> usize {
    if entry.kind == EntryType::Text && entry.exception.is_none() && entry.tags.is_none() {
        return 200 + entry.text.as_ref().map_or(0, |t| t.len()) * 2;
    }
    serde_json::to_vec(entry).map_or(0, |bytes| bytes.len()) * 2 + 100
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    size: usize,
    entry: LogEntry,
}

#[derive(Debug, Default)]
struct RingBufferInner {
    /// Slots in insertion order; sequences are contiguous
    slots: VecDeque<Slot>,
    /// Sequence assigned to the next insert
    next_seq: u64,
    bytes: usize,
    /// Entry id to the sequence of its latest slot
    ids: HashMap<String, u64>,
}

impl RingBufferInner {
    fn index_of(&self, seq: u64) -> Option<usize> {
        let front = self.slots.front()?.seq;
        let index = seq.checked_sub(front)? as usize;
        (index < self.slots.len()).then_some(index)
    }

    fn evict_oldest(&mut self) {
        if let Some(slot) = self.slots.pop_front() {
            self.bytes -= slot.size;
            if self.ids.get(&slot.entry.id) == Some(&slot.seq) {
                self.ids.remove(&slot.entry.id);
            }
        }
    }
}

/// Fixed-capacity store of recent entries
#[derive(Debug)]
pub struct RingBuffer {
    max_entries: usize,
    max_bytes: usize,
    inner: RwLock<RingBufferInner>,
}

impl RingBuffer {
    /// Create a buffer bounded by entry count and estimated bytes
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            max_bytes,
            inner: RwLock::new(RingBufferInner::default()),
        }
    }

    /// Append an entry, evicting the oldest while either bound is exceeded.
    ///
    /// Returns the sequence assigned to the entry.
    pub fn push(&self, entry: LogEntry) -> u64 {
        let size = estimate_entry_size(&entry);
        let mut inner = self.inner.write();

        while !inner.slots.is_empty()
            && (inner.slots.len() >= self.max_entries || inner.bytes + size > self.max_bytes)
        {
            inner.evict_oldest();
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.bytes += size;
        inner.ids.insert(entry.id.clone(), seq);
        inner.slots.push_back(Slot { seq, size, entry });
        seq
    }

    /// Replace the stored entry with the same id when `entry.replace` is set,
    /// otherwise append.
    ///
    /// A replaced entry keeps its original position and sequence. If the
    /// replacement is larger, older entries are evicted until the byte bound
    /// holds again or the replaced entry is the oldest.
    pub fn upsert(&self, entry: LogEntry) -> u64 {
        if entry.replace {
            let mut inner = self.inner.write();
            let target = inner
                .ids
                .get(&entry.id)
                .copied()
                .and_then(|seq| inner.index_of(seq).map(|index| (seq, index)));

            if let Some((seq, index)) = target {
                let size = estimate_entry_size(&entry);
                let slot = &mut inner.slots[index];
                let old_size = std::mem::replace(&mut slot.size, size);
                slot.entry = entry;
                inner.bytes = inner.bytes - old_size + size;
                while inner.bytes > self.max_bytes
                    && inner.slots.front().is_some_and(|front| front.seq != seq)
                {
                    inner.evict_oldest();
                }
                return seq;
            }
        }
        self.push(entry)
    }

    /// Latest stored entry with this id
    pub fn get(&self, id: &str) -> Option<LogEntry> {
        let inner = self.inner.read();
        let seq = *inner.ids.get(id)?;
        let index = inner.index_of(seq)?;
        Some(inner.slots[index].entry.clone())
    }

    /// The `n` most recent entries, oldest first
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let inner = self.inner.read();
        let skip = inner.slots.len().saturating_sub(n);
        inner
            .slots
            .iter()
            .skip(skip)
            .map(|slot| slot.entry.clone())
            .collect()
    }

    /// Scan oldest to newest from `query.cursor`, returning one page
    pub fn query(&self, query: &HistoryQuery) -> HistoryPage {
        let limit = query.page_size();
        let inner = self.inner.read();

        let start = match (query.cursor, inner.slots.front()) {
            (Some(cursor), Some(front)) => cursor.saturating_sub(front.seq) as usize,
            _ => 0,
        };

        let mut entries = Vec::new();
        let mut last_seq = None;
        let mut has_more = false;

        for slot in inner.slots.iter().skip(start) {
            if !query.matches(&slot.entry) {
                continue;
            }
            if entries.len() == limit {
                has_more = true;
                break;
            }
            entries.push(slot.entry.clone());
            last_seq = Some(slot.seq);
        }

        HistoryPage {
            entries,
            next_cursor: last_seq.map(|seq| seq + 1),
            has_more,
        }
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.inner.read().slots.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().slots.is_empty()
    }

    /// Estimated bytes of stored entries
    pub fn byte_estimate(&self) -> usize {
        self.inner.read().bytes
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.max_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ApplicationInfo;

    fn entry(session: &str, text: &str) -> LogEntry {
        LogEntry::text(session, Severity::Info, ApplicationInfo::named("rb"), text)
    }

    fn texts(entries: &[LogEntry]) -> Vec<&str> {
        entries.iter().filter_map(|e| e.text.as_deref()).collect()
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let buffer = RingBuffer::new(3, usize::MAX);
        for i in 0..5 {
            buffer.push(entry("s", &format!("m{}", i)));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(texts(&buffer.recent(10)), vec!["m2", "m3", "m4"]);
        assert_eq!(texts(&buffer.recent(2)), vec!["m3", "m4"]);
    }

    #[test]
    fn test_byte_budget_evicts() {
        let one = estimate_entry_size(&entry("s", "0123456789"));
        let buffer = RingBuffer::new(100, one * 2);
        for _ in 0..5 {
            buffer.push(entry("s", "0123456789"));
        }

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.byte_estimate(), one * 2);
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let buffer = RingBuffer::new(10, usize::MAX);
        let original = entry("s", "progress 10%");
        let id = original.id.clone();
        buffer.push(original);
        buffer.push(entry("s", "other"));

        let mut update = entry("s", "progress 100%");
        update.id = id.clone();
        update.replace = true;
        buffer.upsert(update);

        assert_eq!(buffer.len(), 2);
        assert_eq!(texts(&buffer.recent(10)), vec!["progress 100%", "other"]);
        assert_eq!(buffer.get(&id).unwrap().text.as_deref(), Some("progress 100%"));
    }

    #[test]
    fn test_growing_replacement_respects_byte_budget() {
        let one = estimate_entry_size(&entry("s", "0123456789"));
        let buffer = RingBuffer::new(100, one * 3);
        buffer.push(entry("s", "0123456789"));
        buffer.push(entry("s", "abcdefghij"));
        let last = entry("s", "klmnopqrst");
        let id = last.id.clone();
        buffer.push(last);
        assert_eq!(buffer.byte_estimate(), one * 3);

        let mut bigger = entry("s", "klmnopqrst plus a longer tail");
        bigger.id = id.clone();
        bigger.replace = true;
        buffer.upsert(bigger);

        assert!(buffer.byte_estimate() <= one * 3);
        assert_eq!(
            texts(&buffer.recent(10)),
            vec!["abcdefghij", "klmnopqrst plus a longer tail"]
        );
        assert!(buffer.get(&id).is_some());

        // a replacement alone over budget evicts everything older but stays
        let mut huge = entry("s", &"x".repeat(one * 4));
        huge.id = id.clone();
        huge.replace = true;
        buffer.upsert(huge);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(&id).unwrap().id, id);
    }

    #[test]
    fn test_upsert_without_replace_appends() {
        let buffer = RingBuffer::new(10, usize::MAX);
        let first = entry("s", "a");
        let mut second = entry("s", "b");
        second.id = first.id.clone();
        buffer.push(first);
        buffer.upsert(second);

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.get(&buffer.recent(1)[0].id).unwrap().text.as_deref(), Some("b"));
    }

    #[test]
    fn test_get_after_eviction() {
        let buffer = RingBuffer::new(1, usize::MAX);
        let first = entry("s", "a");
        let id = first.id.clone();
        buffer.push(first);
        buffer.push(entry("s", "b"));

        assert!(buffer.get(&id).is_none());
    }

    #[test]
    fn test_query_filters_and_pages() {
        let buffer = RingBuffer::new(100, usize::MAX);
        for i in 0..10 {
            let session = if i % 2 == 0 { "even" } else { "odd" };
            buffer.push(entry(session, &format!("m{}", i)));
        }

        let query = HistoryQuery {
            session_id: Some("even".to_string()),
            limit: Some(2),
            ..Default::default()
        };
        let page = buffer.query(&query);
        assert_eq!(texts(&page.entries), vec!["m0", "m2"]);
        assert!(page.has_more);

        let page = buffer.query(&HistoryQuery {
            cursor: page.next_cursor,
            ..query.clone()
        });
        assert_eq!(texts(&page.entries), vec!["m4", "m6"]);

        let page = buffer.query(&HistoryQuery {
            cursor: page.next_cursor,
            ..query
        });
        assert_eq!(texts(&page.entries), vec!["m8"]);
        assert!(!page.has_more);
    }

    #[test]
    fn test_cursor_stable_across_eviction() {
        let buffer = RingBuffer::new(5, usize::MAX);
        for i in 0..5 {
            buffer.push(entry("s", &format!("m{}", i)));
        }
        let page = buffer.query(&HistoryQuery {
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(texts(&page.entries), vec!["m0", "m1"]);

        // evicts m0 and m1; the cursor still points at m2
        buffer.push(entry("s", "m5"));
        buffer.push(entry("s", "m6"));
        let page = buffer.query(&HistoryQuery {
            limit: Some(2),
            cursor: page.next_cursor,
            ..Default::default()
        });
        assert_eq!(texts(&page.entries), vec!["m2", "m3"]);

        // a cursor older than everything retained resumes at the oldest entry
        buffer.push(entry("s", "m7"));
        buffer.push(entry("s", "m8"));
        buffer.push(entry("s", "m9"));
        let page = buffer.query(&HistoryQuery {
            limit: Some(1),
            cursor: Some(1),
            ..Default::default()
        });
        assert_eq!(texts(&page.entries), vec!["m5"]);
    }

    #[test]
    fn test_query_time_and_severity_filters() {
        let buffer = RingBuffer::new(10, usize::MAX);
        let mut old = entry("s", "old");
        old.timestamp = Utc::now() - chrono::Duration::hours(1);
        let mut warn = entry("s", "warn");
        warn.severity = Severity::Warning;
        buffer.push(old);
        buffer.push(warn);
        buffer.push(entry("s", "info"));

        let recent = buffer.query(&HistoryQuery {
            from: Some(Utc::now() - chrono::Duration::minutes(5)),
            ..Default::default()
        });
        assert_eq!(texts(&recent.entries), vec!["warn", "info"]);

        let warnings = buffer.query(&HistoryQuery {
            severity: Some(Severity::Warning),
            ..Default::default()
        });
        assert_eq!(texts(&warnings.entries), vec!["warn"]);
    }

    #[test]
    fn test_empty_query() {
        let buffer = RingBuffer::new(10, usize::MAX);
        let page = buffer.query(&HistoryQuery::default());
        assert!(page.entries.is_empty());
        assert_eq!(page.next_cursor, None);
        assert!(!page.has_more);
    }
}
