//! Per-conversation pointer to the last document emitted in this run
//!
//! Lives for one run only. Continuity across runs comes from the
//! destination: every document references the conversation's thread root.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ThreadTracker {
    last: HashMap<String, String>,
}

impl ThreadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_message_id_for(&self, thread_id: &str) -> Option<&str> {
        self.last.get(thread_id).map(String::as_str)
    }

    pub fn advance(&mut self, thread_id: &str, message_id: &str) {
        self.last
            .insert(thread_id.to_string(), message_id.to_string());
    }
}
