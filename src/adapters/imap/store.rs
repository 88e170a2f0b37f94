//! Destination mail-store contract and its IMAP implementation

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::TryStreamExt;
use mailparse::MailHeaderMap;
use tracing::{debug, warn};

use super::connection::ImapConnection;
use crate::types::error::SyncError;

/// Inclusive range of 1-based message sequence numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    pub start: u32,
    pub end: u32,
}

impl SeqRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn single(seq: u32) -> Self {
        Self::new(seq, seq)
    }

    pub fn len(&self) -> u32 {
        self.end + 1 - self.start
    }
}

impl fmt::Display for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

/// Result of a single APPEND
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The server refused this document; carries its status text
    Rejected(String),
}

/// What the sync engine needs from the destination.
///
/// Any `Err` is fatal for the run. A refused APPEND is not an error but an
/// `AppendOutcome::Rejected`.
#[async_trait]
pub trait MailStore: Send {
    async fn create_mailbox_if_absent(&mut self, name: &str) -> Result<(), SyncError>;

    /// Select a mailbox and return its message count
    async fn select_mailbox(&mut self, name: &str) -> Result<u32, SyncError>;

    /// Values of one header field for the documents in `range`.
    /// `None` when the server returned no data for the range.
    async fn fetch_header_field(
        &mut self,
        range: SeqRange,
        field: &str,
    ) -> Result<Option<Vec<String>>, SyncError>;

    /// Sequence numbers of documents whose Date header is on/after `date`
    async fn search_sent_since(&mut self, date: NaiveDate) -> Result<Vec<u32>, SyncError>;

    async fn append_document(
        &mut self,
        mailbox: &str,
        flags: Option<&str>,
        internal_date: DateTime<Utc>,
        bytes: &[u8],
    ) -> Result<AppendOutcome, SyncError>;
}

/// `MailStore` over a live IMAP session
pub struct ImapMailStore {
    conn: ImapConnection,
}

impl ImapMailStore {
    pub fn new(conn: ImapConnection) -> Self {
        Self { conn }
    }

    pub async fn logout(self) -> Result<(), SyncError> {
        self.conn.logout().await
    }
}

/// IMAP date for SEARCH: `08-Feb-2025`
pub fn imap_search_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

/// IMAP date-time for APPEND: `08-Feb-2025 14:03:00 +0000`
pub fn imap_internal_date(date: &DateTime<Utc>) -> String {
    date.format("%d-%b-%Y %H:%M:%S %z").to_string()
}

/// Extract one field from a `BODY[HEADER.FIELDS (..)]` response
pub fn parse_header_field(header_bytes: &[u8], field: &str) -> Option<String> {
    let (headers, _) = mailparse::parse_headers(header_bytes).ok()?;
    headers
        .get_first_value(field)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl MailStore for ImapMailStore {
    async fn create_mailbox_if_absent(&mut self, name: &str) -> Result<(), SyncError> {
        match self.conn.session.create(name).await {
            Ok(()) => {
                debug!(mailbox = %name, "Created mailbox");
                Ok(())
            }
            // Servers answer NO when the mailbox already exists
            Err(async_imap::error::Error::No(msg)) => {
                debug!(mailbox = %name, response = %msg, "CREATE refused, assuming mailbox exists");
                Ok(())
            }
            Err(e) => Err(SyncError::Destination(format!("CREATE {} failed: {}", name, e))),
        }
    }

    async fn select_mailbox(&mut self, name: &str) -> Result<u32, SyncError> {
        let mailbox = self
            .conn
            .session
            .select(name)
            .await
            .map_err(|e| SyncError::Destination(format!("SELECT {} failed: {}", name, e)))?;
        Ok(mailbox.exists)
    }

    async fn fetch_header_field(
        &mut self,
        range: SeqRange,
        field: &str,
    ) -> Result<Option<Vec<String>>, SyncError> {
        let query = format!("BODY.PEEK[HEADER.FIELDS ({})]", field);
        let fetches: Vec<_> = self
            .conn
            .session
            .fetch(range.to_string(), &query)
            .await
            .map_err(|e| SyncError::Destination(format!("FETCH {} failed: {}", range, e)))?
            .try_collect()
            .await
            .map_err(|e| SyncError::Destination(format!("FETCH {} failed: {}", range, e)))?;

        if fetches.is_empty() {
            return Ok(None);
        }

        let mut values = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            match fetch.header() {
                Some(bytes) => {
                    if let Some(value) = parse_header_field(bytes, field) {
                        values.push(value);
                    }
                }
                None => warn!(seq = fetch.message, "FETCH response without header data"),
            }
        }
        Ok(Some(values))
    }

    async fn search_sent_since(&mut self, date: NaiveDate) -> Result<Vec<u32>, SyncError> {
        let query = format!("SENTSINCE {}", imap_search_date(date));
        let found = self
            .conn
            .session
            .search(&query)
            .await
            .map_err(|e| SyncError::Destination(format!("SEARCH {} failed: {}", query, e)))?;

        let mut seqs: Vec<u32> = found.into_iter().collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    async fn append_document(
        &mut self,
        mailbox: &str,
        flags: Option<&str>,
        internal_date: DateTime<Utc>,
        bytes: &[u8],
    ) -> Result<AppendOutcome, SyncError> {
        let date = imap_internal_date(&internal_date);
        match self
            .conn
            .session
            .append(mailbox, flags, Some(date.as_str()), bytes)
            .await
        {
            Ok(()) => Ok(AppendOutcome::Appended),
            Err(async_imap::error::Error::No(msg)) | Err(async_imap::error::Error::Bad(msg)) => {
                Ok(AppendOutcome::Rejected(msg))
            }
            Err(e) => Err(SyncError::Destination(format!("APPEND failed: {}", e))),
        }
    }
}
