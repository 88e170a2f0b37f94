//! In-memory destination used by the sync tests

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::adapters::imap::store::parse_header_field;
use crate::adapters::imap::{AppendOutcome, MailStore, SeqRange};
use crate::sync::document_builder::GUID_HEADER;
use crate::types::error::SyncError;

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub mailbox: String,
    pub flags: Option<String>,
    pub internal_date: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

impl StoredDocument {
    pub fn header(&self, name: &str) -> Option<String> {
        parse_header_field(&self.bytes, name)
    }

    pub fn guid(&self) -> Option<String> {
        self.header(GUID_HEADER)
    }
}

/// A single-mailbox fake with failure injection
#[derive(Debug, Default)]
pub struct MemoryMailStore {
    pub documents: Vec<StoredDocument>,
    pub mailboxes: HashSet<String>,
    pub appends: usize,
    fetched: Vec<String>,
    fail_fetch_at: Option<u32>,
    fail_select: bool,
    empty_fetches: bool,
    reject_guids: HashSet<String>,
}

impl MemoryMailStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a minimal document carrying only the provenance header
    pub fn insert_guid(&mut self, guid: &str, date: DateTime<Utc>) {
        let bytes = format!(
            "{}: {}\r\nDate: {}\r\n\r\nseed\r\n",
            GUID_HEADER,
            guid,
            date.to_rfc2822()
        );
        self.documents.push(StoredDocument {
            mailbox: "iMessage".to_string(),
            flags: None,
            internal_date: date,
            bytes: bytes.into_bytes(),
        });
    }

    pub fn fetched_ranges(&self) -> Vec<String> {
        self.fetched.clone()
    }

    pub fn fail_fetch_at(&mut self, seq: u32) {
        self.fail_fetch_at = Some(seq);
    }

    /// Answer every FETCH with no data, as a server that lost messages would
    pub fn empty_fetches(&mut self) {
        self.empty_fetches = true;
    }

    pub fn fail_select(&mut self) {
        self.fail_select = true;
    }

    pub fn reject_guid(&mut self, guid: &str) {
        self.reject_guids.insert(guid.to_string());
    }

    pub fn clear_rejections(&mut self) {
        self.reject_guids.clear();
    }

    pub fn guids(&self) -> Vec<String> {
        self.documents.iter().filter_map(|d| d.guid()).collect()
    }

    pub fn find(&self, guid: &str) -> Option<&StoredDocument> {
        self.documents
            .iter()
            .find(|d| d.guid().as_deref() == Some(guid))
    }
}

#[async_trait]
impl MailStore for MemoryMailStore {
    async fn create_mailbox_if_absent(&mut self, name: &str) -> Result<(), SyncError> {
        self.mailboxes.insert(name.to_string());
        Ok(())
    }

    async fn select_mailbox(&mut self, name: &str) -> Result<u32, SyncError> {
        if self.fail_select {
            return Err(SyncError::Destination(format!(
                "SELECT {} failed: NO [NONEXISTENT] Unknown Mailbox",
                name
            )));
        }
        Ok(self.documents.len() as u32)
    }

    async fn fetch_header_field(
        &mut self,
        range: SeqRange,
        field: &str,
    ) -> Result<Option<Vec<String>>, SyncError> {
        self.fetched.push(range.to_string());
        if let Some(seq) = self.fail_fetch_at {
            if (range.start..=range.end).contains(&seq) {
                return Err(SyncError::Destination(format!(
                    "FETCH {} failed: BAD Invalid messageset",
                    range
                )));
            }
        }

        let values: Vec<String> = self
            .documents
            .iter()
            .enumerate()
            .filter(|(i, _)| (range.start..=range.end).contains(&(*i as u32 + 1)))
            .filter_map(|(_, d)| d.header(field))
            .collect();

        if self.empty_fetches || range.start as usize > self.documents.len() {
            return Ok(None);
        }
        Ok(Some(values))
    }

    async fn search_sent_since(&mut self, date: NaiveDate) -> Result<Vec<u32>, SyncError> {
        Ok(self
            .documents
            .iter()
            .enumerate()
            .filter(|(_, d)| d.internal_date.date_naive() >= date)
            .map(|(i, _)| i as u32 + 1)
            .collect())
    }

    async fn append_document(
        &mut self,
        mailbox: &str,
        flags: Option<&str>,
        internal_date: DateTime<Utc>,
        bytes: &[u8],
    ) -> Result<AppendOutcome, SyncError> {
        let document = StoredDocument {
            mailbox: mailbox.to_string(),
            flags: flags.map(str::to_string),
            internal_date,
            bytes: bytes.to_vec(),
        };
        if let Some(guid) = document.guid() {
            if self.reject_guids.contains(&guid) {
                return Ok(AppendOutcome::Rejected("[TOOBIG] Message too large".into()));
            }
        }
        self.appends += 1;
        self.documents.push(document);
        Ok(AppendOutcome::Appended)
    }
}
