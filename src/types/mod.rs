pub mod document;
pub mod error;
pub mod record;

pub use document::{Document, MimePart};
pub use error::{Result, SyncError};
pub use record::{AttachmentRef, Conversation, Handle, LogicalRecord};
