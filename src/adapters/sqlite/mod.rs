pub mod chat_db;

pub use chat_db::{apple_date, ChatDbReader, RecordSource};
