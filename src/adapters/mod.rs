pub mod contacts;
pub mod imap;
pub mod locator;
pub mod sqlite;
