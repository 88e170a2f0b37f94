//! Participant identifier -> display name / email address
//!
//! Missing contact metadata is normal, so lookups never fail: unknown
//! identifiers fall back to the raw identifier.

use std::collections::HashMap;

use crate::config::ContactEntry;
use crate::sync::mime::format_mailbox;
use crate::types::Handle;

pub const UNKNOWN_DOMAIN: &str = "unknown.email.local";

/// A name and address pair for From/To headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub name: Option<String>,
    pub email: String,
}

impl Mailbox {
    pub fn new(name: Option<&str>, email: &str) -> Self {
        Self {
            name: name.map(str::to_string),
            email: email.to_string(),
        }
    }

    pub fn to_header(&self) -> String {
        format_mailbox(self.name.as_deref(), &self.email)
    }
}

pub trait ContactResolver {
    fn display_name(&self, handle: &Handle) -> String;

    fn email_address(&self, handle: &Handle) -> String;

    /// The account owner
    fn me(&self) -> Mailbox;

    fn mailbox(&self, handle: &Handle) -> Mailbox {
        Mailbox {
            name: Some(self.display_name(handle)),
            email: self.email_address(handle),
        }
    }
}

/// Contacts from the config file, falling back to raw identifiers
#[derive(Debug, Clone)]
pub struct AddressBook {
    me: Mailbox,
    entries: HashMap<String, ContactEntry>,
}

impl AddressBook {
    pub fn new(me: Mailbox, entries: &HashMap<String, ContactEntry>) -> Self {
        let entries = entries
            .iter()
            .map(|(id, entry)| (normalize_contact(id), entry.clone()))
            .collect();
        Self { me, entries }
    }

    fn lookup(&self, handle: &Handle) -> Option<&ContactEntry> {
        self.entries.get(&normalize_contact(&handle.contact))
    }
}

impl ContactResolver for AddressBook {
    fn display_name(&self, handle: &Handle) -> String {
        self.lookup(handle)
            .and_then(|e| e.name.clone())
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| handle.contact.clone())
    }

    fn email_address(&self, handle: &Handle) -> String {
        self.lookup(handle)
            .and_then(|e| e.email.clone())
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| fallback_email(&handle.contact))
    }

    fn me(&self) -> Mailbox {
        self.me.clone()
    }
}

/// Lookup key for an identifier: lowercase, without phone punctuation
pub fn normalize_contact(contact: &str) -> String {
    let contact = contact.trim();
    if contact.contains('@') {
        return contact.to_lowercase();
    }
    contact
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect()
}

/// Synthetic address for identifiers that are not email addresses
pub fn fallback_email(contact: &str) -> String {
    let contact = contact.trim();
    if contact.contains('@') && !contact.contains(' ') {
        return contact.to_lowercase();
    }
    let local: String = normalize_contact(contact)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let local = if local.is_empty() { "unknown".to_string() } else { local };
    format!("{}@{}", local, UNKNOWN_DOMAIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> AddressBook {
        let mut entries = HashMap::new();
        entries.insert(
            "+1 (555) 000-1111".to_string(),
            ContactEntry {
                name: Some("Alice".to_string()),
                email: Some("alice@example.com".to_string()),
            },
        );
        entries.insert(
            "Bob@Example.com".to_string(),
            ContactEntry {
                name: Some("Bob".to_string()),
                email: None,
            },
        );
        AddressBook::new(Mailbox::new(Some("Me"), "me@example.com"), &entries)
    }

    #[test]
    fn test_configured_contact() {
        let book = book();
        let alice = Handle::new("+15550001111");
        assert_eq!(book.display_name(&alice), "Alice");
        assert_eq!(book.email_address(&alice), "alice@example.com");
        assert_eq!(book.mailbox(&alice).to_header(), "\"Alice\" <alice@example.com>");
    }

    #[test]
    fn test_partial_entry_falls_back_for_email() {
        let book = book();
        let bob = Handle::new("bob@example.com");
        assert_eq!(book.display_name(&bob), "Bob");
        assert_eq!(book.email_address(&bob), "bob@example.com");
    }

    #[test]
    fn test_unknown_contact_uses_raw_identifier() {
        let book = book();
        let stranger = Handle::new("+15559999999");
        assert_eq!(book.display_name(&stranger), "+15559999999");
        assert_eq!(
            book.email_address(&stranger),
            "+15559999999@unknown.email.local"
        );
    }

    #[test]
    fn test_fallback_email_sanitizes() {
        assert_eq!(fallback_email("Some Chat"), "SomeChat@unknown.email.local");
        assert_eq!(fallback_email("a/b"), "a_b@unknown.email.local");
        assert_eq!(fallback_email(""), "unknown@unknown.email.local");
    }
}
