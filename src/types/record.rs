//! Source-side data model: records, conversations, participants, attachments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// A participant identifier as stored by the source (phone number or email)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub contact: String,
    pub country: Option<String>,
    pub service: Option<String>,
}

impl Handle {
    pub fn new(contact: &str) -> Self {
        Self {
            contact: contact.to_string(),
            country: None,
            service: None,
        }
    }
}

/// A group of participants that messages belong to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Source chat guid, kept for provenance only
    pub guid: Option<String>,
    /// "iMessage", "SMS", ...
    pub service: String,
    /// Room / group display name, if the source has one
    pub display_name: Option<String>,
    pub participants: Vec<Handle>,
}

impl Conversation {
    /// Sorted, deduplicated participant contacts
    pub fn participant_key(&self) -> Vec<String> {
        let mut contacts: Vec<String> = self
            .participants
            .iter()
            .map(|h| h.contact.clone())
            .collect();
        contacts.sort();
        contacts.dedup();
        contacts
    }

    /// Stable thread identifier derived from the participant set.
    ///
    /// Independent extracts of the same conversation yield the same id,
    /// which source row ids do not guarantee.
    pub fn thread_id(&self) -> String {
        compute_thread_id(&self.participant_key().join("\n"))
    }
}

pub fn compute_thread_id(participant_key: &str) -> String {
    let hash = Sha256::digest(participant_key.as_bytes());
    format!("{:x}", hash)[..16].to_string()
}

/// A file attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Path as recorded by the source, e.g. `~/Library/Messages/Attachments/..`
    pub filename: String,
    pub mime_type: Option<String>,
    pub total_bytes: u64,
    pub transfer_name: Option<String>,
    pub created_date: Option<DateTime<Utc>>,
    /// Where the bytes live on this machine, if the locator found them
    pub resolved_path: Option<PathBuf>,
}

impl AttachmentRef {
    /// Resolved path that currently exists on disk
    pub fn is_resolved(&self) -> bool {
        self.resolved_path
            .as_ref()
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// Name to present to mail readers
    pub fn display_name(&self) -> String {
        if let Some(name) = self.transfer_name.as_ref().filter(|n| !n.is_empty()) {
            return name.clone();
        }
        self.filename
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.filename)
            .to_string()
    }
}

/// One conversation message as read from a source extract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalRecord {
    pub guid: String,
    /// Sequence-scoped ordinal, for display only
    pub ordinal: u64,
    pub date: DateTime<Utc>,
    pub text: Option<String>,
    pub subject: Option<String>,
    pub is_from_me: bool,
    pub is_read: bool,
    pub date_read: Option<DateTime<Utc>>,
    pub date_delivered: Option<DateTime<Utc>>,
    pub account: Option<String>,
    pub service: Option<String>,
    pub conversation: Option<Conversation>,
    /// Sender for incoming messages
    pub sender: Option<Handle>,
    pub attachments: Vec<AttachmentRef>,
}

impl LogicalRecord {
    pub fn has_body(&self) -> bool {
        self.text
            .as_ref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false)
    }

    /// Whether this record can be turned into a document.
    ///
    /// Needs content (body or attachment), a conversation with at least one
    /// participant, and either be outgoing or name its sender.
    pub fn is_valid(&self) -> bool {
        let has_content = self.has_body() || !self.attachments.is_empty();
        let has_participants = self
            .conversation
            .as_ref()
            .map(|c| !c.participants.is_empty())
            .unwrap_or(false);
        has_content && has_participants && (self.is_from_me || self.sender.is_some())
    }

    /// Number of attachments whose bytes are available locally
    pub fn resolved_attachment_count(&self) -> usize {
        self.attachments.iter().filter(|a| a.is_resolved()).count()
    }

    /// Short description used in log lines
    pub fn describe(&self) -> String {
        let peer = self
            .sender
            .as_ref()
            .map(|h| h.contact.as_str())
            .or_else(|| {
                self.conversation
                    .as_ref()
                    .and_then(|c| c.participants.first())
                    .map(|h| h.contact.as_str())
            })
            .unwrap_or("unknown");
        format!(
            "{} {}, index: {}",
            if self.is_from_me { "to" } else { "from" },
            peer,
            self.ordinal
        )
    }
}
