//! Turns one record into one or more mail documents
//!
//! Headers are computed once per record and copied into every fragment.
//! Attachments are packed greedily: a part goes into the open document if
//! the exact encoded size stays under the bound, otherwise a continuation
//! document is opened. The bound is checked against `Document::encoded_len`
//! so what is measured is exactly what gets appended.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::{debug, warn};

use crate::adapters::contacts::{fallback_email, ContactResolver, Mailbox};
use crate::sync::mime::{
    attachment_disposition, base64_len, binary_part, boundary_for, encode_header_text,
    fold_header, format_date, message_id, text_part, text_part_with_subtype, thread_root_id,
};
use crate::sync::thread_tracker::ThreadTracker;
use crate::types::record::compute_thread_id;
use crate::types::{AttachmentRef, Document, LogicalRecord, MimePart};

pub const XHEADER_PREFIX: &str = "X-imessagesync-";
pub const GUID_HEADER: &str = "X-imessagesync-guid";
pub const THREAD_HEADER: &str = "X-imessagesync-thread-id";
pub const FRAGMENT_HEADER: &str = "X-imessagesync-fragment";
pub const FRAGMENT_COUNT_HEADER: &str = "X-imessagesync-fragment-count";

/// Room kept free for the fragment headers added after packing
const FRAGMENT_RESERVE: usize = 96;

const DEFAULT_SERVICE: &str = "Messages";
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Headers shared by every fragment of a record
struct RecordHeaders {
    thread_id: String,
    subject: String,
    from: String,
    to: String,
    provenance: Vec<(String, String)>,
}

pub struct DocumentBuilder<'a> {
    contacts: &'a dyn ContactResolver,
}

impl<'a> DocumentBuilder<'a> {
    pub fn new(contacts: &'a dyn ContactResolver) -> Self {
        Self { contacts }
    }

    /// Build the documents for `record` and advance the tracker to the last one.
    ///
    /// `max_size` bounds the encoded size of each document; 0 means unbounded.
    pub fn build(
        &self,
        record: &LogicalRecord,
        tracker: &mut ThreadTracker,
        max_size: usize,
    ) -> Vec<Document> {
        let shared = self.record_headers(record);
        let previous = tracker
            .last_message_id_for(&shared.thread_id)
            .map(str::to_string);

        let mut documents: Vec<Document> = Vec::new();
        let mut current = self.open_document(record, &shared, 0, previous.as_deref());

        for attachment in &record.attachments {
            let mut part = self.attachment_part(attachment, max_size);

            if max_size > 0 {
                let next = self.open_document(
                    record,
                    &shared,
                    documents.len() + 1,
                    Some(current.message_id.as_str()),
                );

                if next.encoded_len_with(&part) + FRAGMENT_RESERVE > max_size {
                    debug!(
                        guid = %record.guid,
                        attachment = %attachment.display_name(),
                        "Attachment does not fit in a document on its own"
                    );
                    part = suppressed_part(attachment);
                }

                let overflows = current.encoded_len_with(&part) + FRAGMENT_RESERVE > max_size;
                let can_close = documents.is_empty() || !current.attachments.is_empty();
                if overflows && can_close {
                    documents.push(std::mem::replace(&mut current, next));
                }
            }

            current.attachments.push(part);
        }
        documents.push(current);

        let count = documents.len();
        if count > 1 {
            debug!(guid = %record.guid, fragments = count, "Record split into fragments");
            for (index, document) in documents.iter_mut().enumerate() {
                document.set_header(FRAGMENT_HEADER, index.to_string());
                document.set_header(FRAGMENT_COUNT_HEADER, count.to_string());
            }
        }

        if let Some(last) = documents.last() {
            tracker.advance(&shared.thread_id, &last.message_id);
        }
        documents
    }

    fn record_headers(&self, record: &LogicalRecord) -> RecordHeaders {
        let thread_id = record
            .conversation
            .as_ref()
            .map(|c| c.thread_id())
            .unwrap_or_else(|| compute_thread_id(""));

        let me = self.contacts.me();
        let participants: Vec<Mailbox> = record
            .conversation
            .iter()
            .flat_map(|c| c.participants.iter())
            .map(|h| self.contacts.mailbox(h))
            .collect();

        let (from, to) = if record.is_from_me {
            (me, participants)
        } else {
            let sender = match &record.sender {
                Some(handle) => self.contacts.mailbox(handle),
                None => Mailbox::new(None, &fallback_email("")),
            };
            let mut to = vec![me];
            to.extend(participants.into_iter().filter(|m| m.email != sender.email));
            (sender, to)
        };
        let to = to
            .iter()
            .map(Mailbox::to_header)
            .collect::<Vec<_>>()
            .join(", ");

        RecordHeaders {
            subject: self.subject(record),
            from: from.to_header(),
            to,
            provenance: provenance_headers(record, &thread_id),
            thread_id,
        }
    }

    fn subject(&self, record: &LogicalRecord) -> String {
        if let Some(subject) = record.subject.as_ref().filter(|s| !s.trim().is_empty()) {
            return subject.trim().to_string();
        }

        let Some(conversation) = &record.conversation else {
            return service_name(record, None).to_string();
        };
        if let Some(name) = conversation
            .display_name
            .as_ref()
            .filter(|n| !n.trim().is_empty())
        {
            return name.trim().to_string();
        }

        let names: Vec<String> = conversation
            .participants
            .iter()
            .map(|h| self.contacts.display_name(h))
            .collect();
        format!(
            "{} with {}",
            service_name(record, Some(conversation.service.as_str())),
            join_names(&names)
        )
    }

    fn open_document(
        &self,
        record: &LogicalRecord,
        shared: &RecordHeaders,
        index: usize,
        previous: Option<&str>,
    ) -> Document {
        let guid = if index == 0 {
            record.guid.clone()
        } else {
            format!("{}-FRAGMENT-{}", record.guid, index)
        };
        let id = message_id(&guid);
        let root = thread_root_id(&shared.thread_id);

        let in_reply_to = previous.unwrap_or(&root).to_string();
        let references = match previous {
            Some(prev) if prev != root => format!("{} {}", root, prev),
            _ => root.clone(),
        };

        let mut headers = vec![
            header("Subject", &encode_header_text(&shared.subject)),
            header("From", &shared.from),
            header("To", &shared.to),
            header("Date", &format_date(&record.date)),
            header("Message-ID", &id),
            header("In-Reply-To", &in_reply_to),
            header("References", &references),
            header(GUID_HEADER, &guid),
        ];
        headers.extend(shared.provenance.iter().cloned());

        let text = if index == 0 {
            text_part(record.text.as_deref().unwrap_or(""))
        } else {
            text_part(&format!(
                "Attachments continued from {}",
                message_id(&record.guid)
            ))
        };

        Document {
            boundary: boundary_for(&guid),
            guid,
            message_id: id,
            date: record.date,
            headers,
            text,
            attachments: Vec::new(),
        }
    }

    fn attachment_part(&self, attachment: &AttachmentRef, max_size: usize) -> MimePart {
        let Some(path) = attachment.resolved_path.as_deref() else {
            warn!(filename = %attachment.filename, "Attachment not found");
            return missing_part(attachment);
        };

        // Skip reading files that can never fit
        if max_size > 0 {
            if let Ok(meta) = std::fs::metadata(path) {
                if base64_len(meta.len()) > max_size as u64 {
                    debug!(path = ?path, bytes = meta.len(), "Attachment over size bound");
                    return suppressed_part(attachment);
                }
            }
        }

        match read_file(path) {
            Ok(bytes) => encode_attachment(attachment, &bytes),
            Err(e) => {
                warn!(path = ?path, "Failed to read attachment: {}", e);
                missing_part(attachment)
            }
        }
    }
}

fn header(name: &str, value: &str) -> (String, String) {
    (name.to_string(), fold_header(name, value))
}

fn provenance_headers(record: &LogicalRecord, thread_id: &str) -> Vec<(String, String)> {
    let mut headers = vec![header(THREAD_HEADER, thread_id)];
    let mut push = |name: &str, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            let name = format!("{}{}", XHEADER_PREFIX, name);
            let value = encode_header_text(&value);
            headers.push(header(&name, &value));
        }
    };

    if let Some(conversation) = &record.conversation {
        push("chat-guid", conversation.guid.clone());
        push("chat-contacts", Some(conversation.participant_key().join(" ")));
    }
    push("account", record.account.clone());
    push("service", record.service.clone());
    push("date-delivered", record.date_delivered.as_ref().map(format_date));
    push("date-read", record.date_read.as_ref().map(format_date));
    if let Some(sender) = &record.sender {
        push("handle-contact", Some(sender.contact.clone()));
        push("handle-country", sender.country.clone());
        push("handle-service", sender.service.clone());
    }
    headers
}

fn service_name<'r>(record: &'r LogicalRecord, chat_service: Option<&'r str>) -> &'r str {
    chat_service
        .filter(|s| !s.is_empty())
        .or(record.service.as_deref().filter(|s| !s.is_empty()))
        .unwrap_or(DEFAULT_SERVICE)
}

/// "A", "A and B", "A, B and C"
fn join_names(names: &[String]) -> String {
    match names {
        [] => String::new(),
        [only] => only.clone(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

fn read_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn encode_attachment(attachment: &AttachmentRef, bytes: &[u8]) -> MimePart {
    let mime_type = attachment
        .mime_type
        .as_deref()
        .filter(|m| m.contains('/'))
        .unwrap_or(DEFAULT_MIME_TYPE);
    let disposition = Some(attachment_disposition(
        Some(&attachment.display_name()),
        attachment.created_date.as_ref(),
    ));

    if let Some(subtype) = mime_type.strip_prefix("text/") {
        if let Ok(text) = std::str::from_utf8(bytes) {
            return text_part_with_subtype(text, subtype, disposition);
        }
    }
    binary_part(bytes, mime_type, disposition)
}

fn missing_part(attachment: &AttachmentRef) -> MimePart {
    text_part(&format!(
        "Attachment \"{}\" could not be found.",
        attachment.display_name()
    ))
}

fn suppressed_part(attachment: &AttachmentRef) -> MimePart {
    text_part(&format!(
        "Attachment \"{}\" ({} bytes) suppressed due to size.",
        attachment.display_name(),
        attachment.total_bytes
    ))
}
