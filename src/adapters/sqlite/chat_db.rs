//! Reader for the Messages database (`chat.db`, or `sms.db` in backups)
//!
//! Tables are read whole and joined in memory, which is fine for a
//! personal message history and keeps the SQL independent of schema
//! differences between OS releases.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags, Row};
use tracing::{debug, info, warn};

use crate::adapters::locator::AttachmentLocator;
use crate::types::error::SyncError;
use crate::types::{AttachmentRef, Conversation, Handle, LogicalRecord};

/// Seconds between the Unix epoch and 2001-01-01, the Apple epoch
pub const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

/// Raw dates at or above this are nanoseconds, below it seconds
const NANOSECOND_THRESHOLD: i64 = 10_000_000_000;

/// A source extract that yields records
pub trait RecordSource {
    fn list_records(&self) -> Result<Vec<LogicalRecord>, SyncError>;

    fn describe(&self) -> String;
}

pub struct ChatDbReader {
    conn: Connection,
    path: PathBuf,
    locator: AttachmentLocator,
}

/// Raw message row before joins
struct MessageRow {
    rowid: i64,
    guid: String,
    text: Option<String>,
    handle_id: i64,
    subject: Option<String>,
    service: Option<String>,
    account: Option<String>,
    date: i64,
    date_read: i64,
    date_delivered: i64,
    is_from_me: bool,
    is_read: bool,
    other_handle: i64,
}

impl ChatDbReader {
    /// Open the database of a located source
    pub fn open(locator: AttachmentLocator) -> Result<Self, SyncError> {
        let path = locator.chat_db()?;
        Self::open_at(&path, locator)
    }

    /// Open a database file read-only
    pub fn open_at(path: &Path, locator: AttachmentLocator) -> Result<Self, SyncError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| SyncError::Source(format!("Failed to open {:?}: {}", path, e)))?;
        info!(path = ?path, source = %locator.describe(), "Opened message database");

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            locator,
        })
    }

    fn handles(&self) -> Result<HashMap<i64, Handle>, SyncError> {
        let mut stmt = self
            .conn
            .prepare("SELECT ROWID, id, country, service FROM handle")?;
        let handles = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    Handle {
                        contact: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        country: row.get(2)?,
                        service: row.get(3)?,
                    },
                ))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(handles)
    }

    fn chats(&self, handles: &HashMap<i64, Handle>) -> Result<HashMap<i64, Conversation>, SyncError> {
        // display_name only exists in newer schemas
        let name_column = if self.has_column("chat", "display_name")? {
            "display_name"
        } else {
            "NULL"
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT ROWID, guid, service_name, {} FROM chat",
            name_column
        ))?;
        let mut chats = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    Conversation {
                        guid: row.get(1)?,
                        service: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        display_name: row.get(3)?,
                        participants: Vec::new(),
                    },
                ))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;

        for (chat_id, handle_id) in
            self.join_pairs("SELECT chat_id, handle_id FROM chat_handle_join")?
        {
            match (chats.get_mut(&chat_id), handles.get(&handle_id)) {
                (Some(chat), Some(handle)) => chat.participants.push(handle.clone()),
                _ => debug!(chat_id, handle_id, "Dangling chat_handle_join row"),
            }
        }
        Ok(chats)
    }

    fn attachments(&self) -> Result<HashMap<i64, AttachmentRef>, SyncError> {
        let mut stmt = self.conn.prepare(
            "SELECT ROWID, created_date, filename, mime_type, transfer_name, total_bytes
             FROM attachment",
        )?;
        let attachments = stmt
            .query_map([], |row| {
                let filename: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
                Ok((
                    row.get::<_, i64>(0)?,
                    AttachmentRef {
                        resolved_path: self.locator.resolve(&filename),
                        filename,
                        created_date: apple_date(row.get::<_, Option<i64>>(1)?.unwrap_or(0)),
                        mime_type: row.get(3)?,
                        transfer_name: row.get(4)?,
                        total_bytes: row.get::<_, Option<i64>>(5)?.unwrap_or(0).max(0) as u64,
                    },
                ))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(attachments)
    }

    fn message_rows(&self) -> Result<Vec<MessageRow>, SyncError> {
        let mut stmt = self.conn.prepare(
            "SELECT ROWID, guid, text, handle_id, subject, service, account,
                    date, date_read, date_delivered, is_from_me, is_read, other_handle
             FROM message",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_message(row: &Row) -> Result<MessageRow, rusqlite::Error> {
        Ok(MessageRow {
            rowid: row.get(0)?,
            guid: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            text: row.get(2)?,
            handle_id: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
            subject: row.get(4)?,
            service: row.get(5)?,
            account: row.get(6)?,
            date: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
            date_read: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
            date_delivered: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
            is_from_me: row.get::<_, Option<i64>>(10)?.unwrap_or(0) != 0,
            is_read: row.get::<_, Option<i64>>(11)?.unwrap_or(0) != 0,
            other_handle: row.get::<_, Option<i64>>(12)?.unwrap_or(0),
        })
    }

    fn join_pairs(&self, sql: &str) -> Result<Vec<(i64, i64)>, SyncError> {
        let mut stmt = self.conn.prepare(sql)?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    fn has_column(&self, table: &str, column: &str) -> Result<bool, SyncError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", table))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names.iter().any(|n| n == column))
    }
}

impl RecordSource for ChatDbReader {
    fn list_records(&self) -> Result<Vec<LogicalRecord>, SyncError> {
        let handles = self.handles()?;
        let chats = self.chats(&handles)?;
        let attachments = self.attachments()?;

        let mut chat_of: HashMap<i64, i64> = HashMap::new();
        for (chat_id, message_id) in
            self.join_pairs("SELECT chat_id, message_id FROM chat_message_join")?
        {
            chat_of.insert(message_id, chat_id);
        }

        let mut attachments_of: HashMap<i64, Vec<AttachmentRef>> = HashMap::new();
        for (message_id, attachment_id) in self.join_pairs(
            "SELECT message_id, attachment_id FROM message_attachment_join",
        )? {
            if let Some(attachment) = attachments.get(&attachment_id) {
                attachments_of
                    .entry(message_id)
                    .or_default()
                    .push(attachment.clone());
            }
        }

        let mut records = Vec::new();
        let mut undated = 0usize;
        for row in self.message_rows()? {
            if row.guid.is_empty() {
                continue;
            }
            let Some(date) = apple_date(row.date) else {
                undated += 1;
                continue;
            };

            let sender = handles
                .get(&row.handle_id)
                .or_else(|| handles.get(&row.other_handle))
                .cloned();

            records.push(LogicalRecord {
                guid: row.guid,
                ordinal: row.rowid.max(0) as u64,
                date,
                text: row.text,
                subject: row.subject,
                is_from_me: row.is_from_me,
                is_read: row.is_read,
                date_read: apple_date(row.date_read),
                date_delivered: apple_date(row.date_delivered),
                account: row.account,
                service: row.service,
                conversation: chat_of.get(&row.rowid).and_then(|id| chats.get(id)).cloned(),
                sender,
                attachments: attachments_of.remove(&row.rowid).unwrap_or_default(),
            });
        }

        if undated > 0 {
            warn!(count = undated, path = ?self.path, "Skipped messages without a date");
        }
        info!(count = records.len(), path = ?self.path, "Read records");
        Ok(records)
    }

    fn describe(&self) -> String {
        format!("{:?} ({})", self.path, self.locator.describe())
    }
}

/// Convert an Apple timestamp; 0 means no date
pub fn apple_date(raw: i64) -> Option<DateTime<Utc>> {
    if raw <= 0 {
        return None;
    }
    let (secs, nanos) = if raw >= NANOSECOND_THRESHOLD {
        (raw / 1_000_000_000, (raw % 1_000_000_000) as u32)
    } else {
        (raw, 0)
    };
    Utc.timestamp_opt(secs + APPLE_EPOCH_OFFSET, nanos).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SCHEMA: &str = "
        CREATE TABLE handle (ROWID INTEGER PRIMARY KEY, id TEXT, country TEXT, service TEXT);
        CREATE TABLE chat_handle_join (chat_id INTEGER, handle_id INTEGER);
        CREATE TABLE message (ROWID INTEGER PRIMARY KEY, guid TEXT, text TEXT,
                              handle_id INTEGER, subject TEXT, service TEXT, account TEXT,
                              date INTEGER, date_read INTEGER, date_delivered INTEGER,
                              is_from_me INTEGER, is_read INTEGER, other_handle INTEGER);
        CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER);
        CREATE TABLE attachment (ROWID INTEGER PRIMARY KEY, created_date INTEGER,
                                 filename TEXT, mime_type TEXT, transfer_name TEXT,
                                 total_bytes INTEGER);
        CREATE TABLE message_attachment_join (message_id INTEGER, attachment_id INTEGER);
    ";

    const CHAT_TABLE: &str =
        "CREATE TABLE chat (ROWID INTEGER PRIMARY KEY, guid TEXT, service_name TEXT, display_name TEXT);";

    /// 2024-03-01 12:00:00 UTC in Apple seconds
    const MARCH_1: i64 = 1_709_294_400 - APPLE_EPOCH_OFFSET;

    fn fixture(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("chat.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn.execute_batch(CHAT_TABLE).unwrap();
        conn.execute_batch(&format!(
            "
            INSERT INTO handle VALUES (1, '+15550001', 'us', 'iMessage');
            INSERT INTO handle VALUES (2, 'bob@example.com', 'us', 'iMessage');
            INSERT INTO chat VALUES (1, 'iMessage;+;chat1', 'iMessage', 'Friends');
            INSERT INTO chat_handle_join VALUES (1, 1);
            INSERT INTO chat_handle_join VALUES (1, 2);
            INSERT INTO message VALUES (10, 'guid-in', 'hello', 1, NULL, 'iMessage', 'e:me@example.com',
                                        {d}, {d} + 60, {d} + 5, 0, 1, 0);
            INSERT INTO message VALUES (11, 'guid-out', 'hi back', 0, NULL, 'iMessage', NULL,
                                        {n}, 0, 0, 1, 1, 2);
            INSERT INTO message VALUES (12, 'guid-undated', 'lost', 1, NULL, 'iMessage', NULL,
                                        0, 0, 0, 0, 0, 0);
            INSERT INTO chat_message_join VALUES (1, 10);
            INSERT INTO chat_message_join VALUES (1, 11);
            INSERT INTO attachment VALUES (1, {d}, '~/Library/Messages/Attachments/aa/photo.jpg',
                                           'image/jpeg', 'photo.jpg', 1234);
            INSERT INTO message_attachment_join VALUES (10, 1);
            ",
            d = MARCH_1,
            n = (MARCH_1 + 120) * 1_000_000_000,
        ))
        .unwrap();
        path
    }

    #[test]
    fn test_apple_date() {
        let seconds = apple_date(MARCH_1).unwrap();
        assert_eq!(seconds, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());

        let nanos = apple_date(MARCH_1 * 1_000_000_000 + 500_000_000).unwrap();
        assert_eq!(nanos.timestamp(), seconds.timestamp());
        assert_eq!(nanos.timestamp_subsec_millis(), 500);

        assert_eq!(apple_date(0), None);
    }

    #[test]
    fn test_list_records() {
        let dir = TempDir::new().unwrap();
        let db = fixture(&dir);
        let messages_dir = dir.path().join("Messages");
        fs::create_dir_all(messages_dir.join("Attachments/aa")).unwrap();
        fs::write(messages_dir.join("Attachments/aa/photo.jpg"), b"jpeg").unwrap();

        let locator = AttachmentLocator::Relocated { root: messages_dir.clone() };
        let reader = ChatDbReader::open_at(&db, locator).unwrap();
        let mut records = reader.list_records().unwrap();
        records.sort_by(|a, b| a.guid.cmp(&b.guid));
        assert_eq!(records.len(), 2);

        let incoming = &records[0];
        assert_eq!(incoming.guid, "guid-in");
        assert_eq!(incoming.ordinal, 10);
        assert!(!incoming.is_from_me);
        assert_eq!(incoming.sender.as_ref().unwrap().contact, "+15550001");
        assert_eq!(incoming.account.as_deref(), Some("e:me@example.com"));
        assert_eq!(
            incoming.date_read.unwrap() - incoming.date,
            chrono::Duration::seconds(60)
        );

        let conversation = incoming.conversation.as_ref().unwrap();
        assert_eq!(conversation.display_name.as_deref(), Some("Friends"));
        assert_eq!(conversation.participants.len(), 2);

        assert_eq!(incoming.attachments.len(), 1);
        let attachment = &incoming.attachments[0];
        assert_eq!(attachment.total_bytes, 1234);
        assert_eq!(
            attachment.resolved_path.as_deref(),
            Some(messages_dir.join("Attachments/aa/photo.jpg").as_path())
        );
        assert!(attachment.is_resolved());
        assert!(incoming.is_valid());

        let outgoing = &records[1];
        assert!(outgoing.is_from_me);
        assert_eq!(outgoing.sender.as_ref().unwrap().contact, "bob@example.com");
        assert_eq!(outgoing.date, Utc.with_ymd_and_hms(2024, 3, 1, 12, 2, 0).unwrap());
        assert_eq!(outgoing.date_read, None);
    }

    #[test]
    fn test_older_schema_without_display_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sms.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn.execute_batch(
            "CREATE TABLE chat (ROWID INTEGER PRIMARY KEY, guid TEXT, service_name TEXT);",
        )
        .unwrap();
        conn.execute_batch("INSERT INTO chat VALUES (1, 'SMS;-;+15550001', 'SMS');")
            .unwrap();
        drop(conn);

        let reader = ChatDbReader::open_at(&path, AttachmentLocator::native()).unwrap();
        assert!(reader.list_records().unwrap().is_empty());
        assert!(!reader.has_column("chat", "display_name").unwrap());
    }

    #[test]
    fn test_open_missing_database() {
        let dir = TempDir::new().unwrap();
        let result = ChatDbReader::open_at(&dir.path().join("absent.db"), AttachmentLocator::native());
        assert!(matches!(result, Err(SyncError::Source(_))));
    }
}
