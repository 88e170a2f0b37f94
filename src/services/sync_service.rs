//! Sync service
//!
//! Wires configuration, source extracts, the contact book and the IMAP
//! destination into one engine run.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tracing::{info, warn};

use crate::adapters::contacts::{fallback_email, AddressBook, Mailbox};
use crate::adapters::imap::{connect, ImapMailStore};
use crate::adapters::locator::AttachmentLocator;
use crate::adapters::sqlite::{ChatDbReader, RecordSource};
use crate::config::{AppConfig, IndexMode};
use crate::sync::{SyncEngine, SyncOptions, SyncSummary};
use crate::types::error::{Result, SyncError};
use crate::types::LogicalRecord;

/// Command-line overrides for one run
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    /// Source paths; empty means configured sources, then the native directory
    pub sources: Vec<String>,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub dry_run: bool,
    pub mailbox: Option<String>,
    pub full_scan: bool,
}

/// Engine options from the config file with request overrides applied
pub fn build_options(config: &AppConfig, request: &SyncRequest) -> SyncOptions {
    let mut options = SyncOptions::from(&config.sync);
    options.dry_run = request.dry_run;
    options.start = request.since.map(start_of_day);
    options.stop = request.until.map(end_of_day);
    if let Some(mailbox) = &request.mailbox {
        options.mailbox = mailbox.clone();
    }
    if request.full_scan {
        options.index_mode = IndexMode::Full;
    }
    options
}

pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Last instant of the day, for inclusive upper bounds
pub fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    start_of_day(date) + chrono::Duration::days(1) - chrono::Duration::nanoseconds(1)
}

/// Contact book with the account owner taken from the config
pub fn address_book(config: &AppConfig) -> AddressBook {
    let email = config
        .identity_email()
        .unwrap_or_else(|| fallback_email("me"));
    let me = Mailbox::new(config.identity_name.as_deref(), &email);
    AddressBook::new(me, &config.contacts)
}

/// Locators for every source to read
pub fn locate_sources(config: &AppConfig, request: &SyncRequest) -> Result<Vec<AttachmentLocator>> {
    let paths = if !request.sources.is_empty() {
        &request.sources
    } else {
        &config.sources
    };

    if paths.is_empty() {
        return Ok(vec![AttachmentLocator::native()]);
    }
    paths.iter().map(|p| AttachmentLocator::detect(p)).collect()
}

/// Read every source into its own record sequence
pub fn read_sources(locators: Vec<AttachmentLocator>) -> Result<Vec<Vec<LogicalRecord>>> {
    let mut sequences = Vec::with_capacity(locators.len());
    for locator in locators {
        let reader = ChatDbReader::open(locator)?;
        let records = reader.list_records()?;
        info!(source = %reader.describe(), records = records.len(), "Source read");
        sequences.push(records);
    }
    Ok(sequences)
}

/// Run one sync against the configured IMAP server
pub async fn run_sync(config: &AppConfig, request: &SyncRequest) -> Result<SyncSummary> {
    let options = build_options(config, request);
    let locators = locate_sources(config, request)?;
    let sources = tokio::task::spawn_blocking(move || read_sources(locators))
        .await
        .map_err(|e| SyncError::Other(format!("Source reader panicked: {}", e)))??;

    let book = address_book(config);
    let imap = config.imap()?;
    let password = imap.auth.password.resolve()?;
    let conn = connect(&imap.host, imap.port, &imap.auth.user, &password).await?;
    let mut store = ImapMailStore::new(conn);

    let mut engine = SyncEngine::new(options, &book);
    let result = engine.run(sources, &mut store).await;

    if let Err(e) = store.logout().await {
        warn!("Logout failed: {}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::contacts::ContactResolver;
    use crate::config::parse_config;
    use tempfile::TempDir;

    fn config() -> AppConfig {
        parse_config(
            r#"
            identity_name = "Me"

            [imap]
            host = "imap.example.com"
            auth = { user = "me@example.com", password = "secret" }

            [sync]
            mailbox = "Texts"
            max_document_size = 1000000
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_options_from_config_and_request() {
        let request = SyncRequest {
            since: NaiveDate::from_ymd_opt(2024, 3, 1),
            until: NaiveDate::from_ymd_opt(2024, 3, 31),
            dry_run: true,
            full_scan: true,
            ..SyncRequest::default()
        };
        let options = build_options(&config(), &request);

        assert_eq!(options.mailbox, "Texts");
        assert_eq!(options.max_document_size, 1_000_000);
        assert!(options.dry_run);
        assert_eq!(options.index_mode, IndexMode::Full);
        assert_eq!(options.start.unwrap().to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(
            options.stop.unwrap().date_naive(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap()
        );
        assert!(options.stop.unwrap() < start_of_day(NaiveDate::from_ymd_opt(2024, 4, 1).unwrap()));
    }

    #[test]
    fn test_mailbox_override() {
        let request = SyncRequest {
            mailbox: Some("Archive".to_string()),
            ..SyncRequest::default()
        };
        let options = build_options(&config(), &request);
        assert_eq!(options.mailbox, "Archive");
        assert_eq!(options.index_mode, IndexMode::Windowed);
        assert_eq!(options.start, None);
    }

    #[test]
    fn test_address_book_owner() {
        let book = address_book(&config());
        assert_eq!(book.me(), Mailbox::new(Some("Me"), "me@example.com"));

        let book = address_book(&AppConfig::default());
        assert_eq!(book.me().email, "me@unknown.email.local");
    }

    #[test]
    fn test_locate_sources() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("chat.db"), b"").unwrap();

        let request = SyncRequest {
            sources: vec![dir.path().to_string_lossy().into_owned()],
            ..SyncRequest::default()
        };
        let locators = locate_sources(&config(), &request).unwrap();
        assert_eq!(locators.len(), 1);
        assert!(matches!(locators[0], AttachmentLocator::Relocated { .. }));

        let defaults = locate_sources(&config(), &SyncRequest::default()).unwrap();
        assert!(matches!(defaults[0], AttachmentLocator::Native { .. }));

        let missing = SyncRequest {
            sources: vec![dir.path().join("nowhere").to_string_lossy().into_owned()],
            ..SyncRequest::default()
        };
        assert!(locate_sources(&config(), &missing).is_err());
    }
}
