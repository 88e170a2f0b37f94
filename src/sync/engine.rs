//! Run orchestration: merge, index, deliver
//!
//! ```text
//! Idle -> Merged -> Indexed -> Delivering -> Done
//!                      \            \
//!                       Failed       Failed
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::adapters::contacts::ContactResolver;
use crate::adapters::imap::{AppendOutcome, MailStore};
use crate::config::{IndexMode, SyncSettings};
use crate::sync::document_builder::DocumentBuilder;
use crate::sync::index::{DestinationIndex, IndexStrategy, DEFAULT_BATCH_SIZE};
use crate::sync::merger::merge_records;
use crate::sync::thread_tracker::ThreadTracker;
use crate::types::error::SyncError;
use crate::types::LogicalRecord;

const SEEN_FLAG: &str = "\\Seen";

/// Engine state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    Merged,
    Indexed,
    Delivering,
    Done,
    Failed(String),
}

/// Per-run options
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Destination mailbox
    pub mailbox: String,
    /// Do everything except APPEND
    pub dry_run: bool,
    /// Inclusive lower date bound
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper date bound
    pub stop: Option<DateTime<Utc>>,
    /// Per-document size bound in bytes, 0 = unbounded
    pub max_document_size: usize,
    pub index_mode: IndexMode,
    pub batch_size: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mailbox: "iMessage".to_string(),
            dry_run: false,
            start: None,
            stop: None,
            max_document_size: 25_000_000,
            index_mode: IndexMode::Windowed,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl From<&SyncSettings> for SyncOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            mailbox: settings.mailbox.clone(),
            max_document_size: settings.max_document_size,
            index_mode: settings.index,
            batch_size: settings.fetch_batch_size,
            ..Self::default()
        }
    }
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Unique records after merging
    pub found: usize,
    /// Records outside the date range
    pub out_of_range: usize,
    /// Records that cannot become a document
    pub invalid: usize,
    /// Records already present at the destination
    pub skipped: usize,
    /// Records whose documents were all appended
    pub uploaded: usize,
    /// Documents built for delivery, fragments included
    pub documents: usize,
    /// Records rejected by the destination
    pub failed: usize,
    pub dry_run: bool,
}

/// The sync engine, one instance per run
pub struct SyncEngine<'a> {
    options: SyncOptions,
    contacts: &'a dyn ContactResolver,
    tracker: ThreadTracker,
    phase: SyncPhase,
}

impl<'a> SyncEngine<'a> {
    pub fn new(options: SyncOptions, contacts: &'a dyn ContactResolver) -> Self {
        Self {
            options,
            contacts,
            tracker: ThreadTracker::new(),
            phase: SyncPhase::Idle,
        }
    }

    pub fn phase(&self) -> &SyncPhase {
        &self.phase
    }

    /// Sync the given source sequences into `store`.
    ///
    /// Per-record rejections are counted in the summary. Any other
    /// destination error ends the run in `Failed` and is returned.
    pub async fn run<S: MailStore + ?Sized>(
        &mut self,
        sources: Vec<Vec<LogicalRecord>>,
        store: &mut S,
    ) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary {
            dry_run: self.options.dry_run,
            ..SyncSummary::default()
        };

        let records = self.merge(sources, &mut summary);
        if records.is_empty() {
            info!("Nothing to sync");
            self.phase = SyncPhase::Done;
            return Ok(summary);
        }

        let skip = match self.index(store, &records).await {
            Ok(skip) => skip,
            Err(e) => return Err(self.fail(e)),
        };

        if let Err(e) = self.deliver(store, &records, &skip, &mut summary).await {
            return Err(self.fail(e));
        }

        self.phase = SyncPhase::Done;
        info!(
            found = summary.found,
            uploaded = summary.uploaded,
            skipped = summary.skipped,
            failed = summary.failed,
            dry_run = summary.dry_run,
            "Sync complete"
        );
        Ok(summary)
    }

    /// Merge, filter and order the records to deliver
    fn merge(
        &mut self,
        sources: Vec<Vec<LogicalRecord>>,
        summary: &mut SyncSummary,
    ) -> Vec<LogicalRecord> {
        let merged = merge_records(sources);
        summary.found = merged.len();

        let mut records = Vec::with_capacity(merged.len());
        for record in merged.into_values() {
            if !self.in_range(&record) {
                summary.out_of_range += 1;
                continue;
            }
            if !record.is_valid() {
                debug!(guid = %record.guid, "Skipping invalid record");
                summary.invalid += 1;
                continue;
            }
            records.push(record);
        }

        // Chaining depends on chronological delivery
        records.sort_by(|a, b| a.date.cmp(&b.date).then(a.ordinal.cmp(&b.ordinal)));

        info!(
            found = summary.found,
            eligible = records.len(),
            invalid = summary.invalid,
            "Records merged"
        );
        self.phase = SyncPhase::Merged;
        records
    }

    fn in_range(&self, record: &LogicalRecord) -> bool {
        self.options.start.map_or(true, |start| record.date >= start)
            && self.options.stop.map_or(true, |stop| record.date <= stop)
    }

    async fn index<S: MailStore + ?Sized>(
        &mut self,
        store: &mut S,
        records: &[LogicalRecord],
    ) -> Result<HashSet<String>, SyncError> {
        let mailbox = &self.options.mailbox;
        store.create_mailbox_if_absent(mailbox).await?;
        let count = store.select_mailbox(mailbox).await?;
        info!(mailbox = %mailbox, count, "Selected destination mailbox");

        let strategy = match self.options.index_mode {
            IndexMode::Full => IndexStrategy::Full,
            IndexMode::Windowed => {
                let since = records
                    .iter()
                    .map(|r| r.date)
                    .min()
                    .unwrap_or_else(Utc::now);
                IndexStrategy::Windowed { since }
            }
        };

        let skip = DestinationIndex::new(self.options.batch_size)
            .build(store, count, strategy)
            .await?;
        self.phase = SyncPhase::Indexed;
        Ok(skip)
    }

    async fn deliver<S: MailStore + ?Sized>(
        &mut self,
        store: &mut S,
        records: &[LogicalRecord],
        skip: &HashSet<String>,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        self.phase = SyncPhase::Delivering;
        let builder = DocumentBuilder::new(self.contacts);

        for record in records {
            let documents =
                builder.build(record, &mut self.tracker, self.options.max_document_size);

            // A record counts as delivered only when every fragment is present
            let pending: Vec<_> = documents
                .iter()
                .filter(|d| !skip.contains(&d.guid))
                .collect();
            if pending.is_empty() {
                debug!(guid = %record.guid, "Already delivered, skipping");
                summary.skipped += 1;
                continue;
            }
            if pending.len() < documents.len() {
                info!(
                    guid = %record.guid,
                    missing = pending.len(),
                    fragments = documents.len(),
                    "Resuming partially delivered record"
                );
            }
            summary.documents += pending.len();

            if self.options.dry_run {
                info!(
                    guid = %record.guid,
                    documents = pending.len(),
                    "Dry run, not uploading {}",
                    record.describe()
                );
                continue;
            }

            let flags = (record.is_read || record.is_from_me).then_some(SEEN_FLAG);
            let mut rejected = None;
            for document in pending {
                let bytes = document.to_bytes();
                match store
                    .append_document(&self.options.mailbox, flags, record.date, &bytes)
                    .await?
                {
                    AppendOutcome::Appended => {
                        debug!(guid = %document.guid, bytes = bytes.len(), "Appended document");
                    }
                    AppendOutcome::Rejected(reason) => {
                        rejected = Some(reason);
                        break;
                    }
                }
            }

            match rejected {
                None => {
                    summary.uploaded += 1;
                    info!("Uploaded message {}", record.describe());
                }
                Some(reason) => {
                    summary.failed += 1;
                    warn!(
                        guid = %record.guid,
                        "Destination rejected {}: {}",
                        record.describe(),
                        reason
                    );
                }
            }
        }
        Ok(())
    }

    fn fail(&mut self, e: SyncError) -> SyncError {
        error!("Sync failed: {}", e);
        self.phase = SyncPhase::Failed(e.to_string());
        e
    }
}
