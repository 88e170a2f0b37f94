//! Set of guids already delivered to the destination
//!
//! Every delivered document carries its source guid in a provenance
//! header. The index reads that header back, either for the whole mailbox
//! or only for documents dated inside the window being synced.
//!
//! Any destination error aborts the build. A partial index would turn
//! undelivered records into false skips.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::adapters::imap::{MailStore, SeqRange};
use crate::sync::document_builder::GUID_HEADER;
use crate::types::error::SyncError;

pub const DEFAULT_BATCH_SIZE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStrategy {
    /// Read the provenance header of every document in the mailbox
    Full,
    /// Only documents sent on/after `since` minus one day
    Windowed { since: DateTime<Utc> },
}

pub struct DestinationIndex {
    batch_size: u32,
}

impl Default for DestinationIndex {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl DestinationIndex {
    pub fn new(batch_size: u32) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Build the skip-set for the selected mailbox holding `count` documents
    pub async fn build<S: MailStore + ?Sized>(
        &self,
        store: &mut S,
        count: u32,
        strategy: IndexStrategy,
    ) -> Result<HashSet<String>, SyncError> {
        let guids = match strategy {
            IndexStrategy::Full => self.full_scan(store, count).await?,
            IndexStrategy::Windowed { since } => self.windowed_scan(store, since).await?,
        };
        info!(guids = guids.len(), strategy = ?strategy, "Destination index built");
        Ok(guids)
    }

    async fn full_scan<S: MailStore + ?Sized>(
        &self,
        store: &mut S,
        count: u32,
    ) -> Result<HashSet<String>, SyncError> {
        let mut guids = HashSet::new();
        let mut start: u32 = 1;

        while start <= count {
            let end = std::cmp::min(start.saturating_add(self.batch_size - 1), count);
            let range = SeqRange::new(start, end);

            match store.fetch_header_field(range, GUID_HEADER).await? {
                Some(values) => {
                    debug!(range = %range, found = values.len(), "Fetched provenance headers");
                    guids.extend(values);
                }
                None => {
                    debug!(range = %range, "No data for range, end of mailbox");
                    break;
                }
            }

            start = end + 1;
        }

        Ok(guids)
    }

    async fn windowed_scan<S: MailStore + ?Sized>(
        &self,
        store: &mut S,
        since: DateTime<Utc>,
    ) -> Result<HashSet<String>, SyncError> {
        // One day of slack for clock and timezone skew
        let window_start = (since - Duration::days(1)).date_naive();
        let seqs = store.search_sent_since(window_start).await?;
        let ranges = compact_ranges(&seqs, self.batch_size);
        debug!(
            since = %window_start,
            matches = seqs.len(),
            ranges = ranges.len(),
            "Windowed index search"
        );

        let mut guids = HashSet::new();
        for range in ranges {
            match store.fetch_header_field(range, GUID_HEADER).await? {
                Some(values) => guids.extend(values),
                None => warn!(
                    range = %range,
                    "Search reported documents that FETCH did not return"
                ),
            }
        }
        Ok(guids)
    }
}

/// Compact ordinals into runs of consecutive values, at most `cap` long.
///
/// A run closes on any gap and when it reaches the cap.
pub fn compact_ranges(ordinals: &[u32], cap: u32) -> Vec<SeqRange> {
    let cap = cap.max(1);
    let mut sorted = ordinals.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<SeqRange> = Vec::new();
    for seq in sorted {
        match ranges.last_mut() {
            Some(run) if seq == run.end + 1 && run.len() < cap => run.end = seq,
            _ => ranges.push(SeqRange::single(seq)),
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::MemoryMailStore;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_compact_ranges_gap_and_cap() {
        let ranges = compact_ranges(&[5, 6, 7, 10, 11, 15], 2);
        assert_eq!(
            ranges,
            vec![
                SeqRange::new(5, 6),
                SeqRange::new(7, 7),
                SeqRange::new(10, 11),
                SeqRange::new(15, 15),
            ]
        );
    }

    #[test]
    fn test_compact_ranges_unsorted_input() {
        let ranges = compact_ranges(&[3, 1, 2, 2], 1000);
        assert_eq!(ranges, vec![SeqRange::new(1, 3)]);
        assert!(compact_ranges(&[], 10).is_empty());
    }

    #[tokio::test]
    async fn test_full_scan_reads_every_batch() {
        let mut store = MemoryMailStore::new();
        for i in 0..7 {
            store.insert_guid(&format!("g{}", i), day(1));
        }
        let count = store.select_mailbox("iMessage").await.unwrap();

        let guids = DestinationIndex::new(3)
            .build(&mut store, count, IndexStrategy::Full)
            .await
            .unwrap();
        assert_eq!(guids.len(), 7);
        assert_eq!(store.fetched_ranges(), vec!["1:3", "4:6", "7"]);
    }

    #[tokio::test]
    async fn test_full_scan_empty_mailbox() {
        let mut store = MemoryMailStore::new();
        let guids = DestinationIndex::default()
            .build(&mut store, 0, IndexStrategy::Full)
            .await
            .unwrap();
        assert!(guids.is_empty());
        assert!(store.fetched_ranges().is_empty());
    }

    #[tokio::test]
    async fn test_full_scan_stops_on_no_data() {
        let mut store = MemoryMailStore::new();
        store.insert_guid("g0", day(1));
        // Server claims more messages than it returns
        let guids = DestinationIndex::new(1)
            .build(&mut store, 5, IndexStrategy::Full)
            .await
            .unwrap();
        assert_eq!(guids.len(), 1);
        assert_eq!(store.fetched_ranges(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_windowed_scan_only_fetches_window() {
        let mut store = MemoryMailStore::new();
        store.insert_guid("old", day(1));
        store.insert_guid("edge", day(9));
        store.insert_guid("new", day(10));
        store.insert_guid("newer", day(12));

        let count = store.select_mailbox("iMessage").await.unwrap();
        let guids = DestinationIndex::default()
            .build(&mut store, count, IndexStrategy::Windowed { since: day(10) })
            .await
            .unwrap();

        let expected: HashSet<String> =
            ["edge", "new", "newer"].iter().map(|s| s.to_string()).collect();
        assert_eq!(guids, expected);
        assert_eq!(store.fetched_ranges(), vec!["2:4"]);
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts_index() {
        let mut store = MemoryMailStore::new();
        for i in 0..4 {
            store.insert_guid(&format!("g{}", i), day(1));
        }
        store.fail_fetch_at(3);

        let result = DestinationIndex::new(2)
            .build(&mut store, 4, IndexStrategy::Full)
            .await;
        assert!(matches!(result, Err(SyncError::Destination(_))));
    }

    #[tokio::test]
    async fn test_windowed_scan_continues_past_empty_fetch() {
        let mut store = MemoryMailStore::new();
        store.insert_guid("a", day(10));
        store.insert_guid("b", day(11));
        store.empty_fetches();

        let count = store.select_mailbox("iMessage").await.unwrap();
        let guids = DestinationIndex::new(1)
            .build(&mut store, count, IndexStrategy::Windowed { since: day(10) })
            .await
            .unwrap();
        assert!(guids.is_empty());
        assert_eq!(store.fetched_ranges(), vec!["1", "2"]);
    }
}
