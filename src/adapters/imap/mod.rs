pub mod connection;
pub mod store;

pub use connection::{connect, ImapConnection};
pub use store::{AppendOutcome, ImapMailStore, MailStore, SeqRange};
