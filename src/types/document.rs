//! Wire documents handed to the destination mail-store
//!
//! Parts hold their body already transfer-encoded, so the exact size of a
//! document can be computed without rendering it. `encoded_len` and
//! `to_bytes` share one rendering routine and always agree.

use chrono::{DateTime, Utc};

const CRLF: &[u8] = b"\r\n";
const PREAMBLE: &[u8] = b"This is a multi-part message in MIME format.\r\n";

/// Byte sink used by the renderer: either collects or only counts
trait Sink {
    fn put(&mut self, bytes: &[u8]);
}

impl Sink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

struct Counter(usize);

impl Sink for Counter {
    fn put(&mut self, bytes: &[u8]) {
        self.0 += bytes.len();
    }
}

fn put_header<S: Sink>(out: &mut S, name: &str, value: &str) {
    out.put(name.as_bytes());
    out.put(b": ");
    out.put(value.as_bytes());
    out.put(CRLF);
}

/// One MIME leaf part
#[derive(Debug, Clone, PartialEq)]
pub struct MimePart {
    /// Content headers, values already header-safe
    pub headers: Vec<(String, String)>,
    /// Transfer-encoded body with CRLF line endings
    pub body: Vec<u8>,
}

impl MimePart {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn encoded_len(&self) -> usize {
        let mut counter = Counter(0);
        self.render(&mut counter);
        counter.0
    }

    fn render_headers<S: Sink>(&self, out: &mut S) {
        for (name, value) in &self.headers {
            put_header(out, name, value);
        }
    }

    fn render<S: Sink>(&self, out: &mut S) {
        self.render_headers(out);
        out.put(CRLF);
        out.put(&self.body);
    }
}

/// A complete message ready for APPEND
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Provenance guid, suffixed for continuation fragments
    pub guid: String,
    pub message_id: String,
    pub date: DateTime<Utc>,
    /// Top-level headers in emission order, values already header-safe
    pub headers: Vec<(String, String)>,
    pub text: MimePart,
    pub attachments: Vec<MimePart>,
    pub boundary: String,
}

impl Document {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a header, replacing an existing value
    pub fn set_header(&mut self, name: &str, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn is_multipart(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Exact size of `to_bytes()`
    pub fn encoded_len(&self) -> usize {
        let mut counter = Counter(0);
        self.render(&mut counter, None);
        counter.0
    }

    /// Size the document would have with `part` appended as an attachment
    pub fn encoded_len_with(&self, part: &MimePart) -> usize {
        let mut counter = Counter(0);
        self.render(&mut counter, Some(part));
        counter.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.render(&mut out, None);
        out
    }

    fn render<S: Sink>(&self, out: &mut S, extra: Option<&MimePart>) {
        for (name, value) in &self.headers {
            put_header(out, name, value);
        }
        put_header(out, "MIME-Version", "1.0");

        if !self.is_multipart() && extra.is_none() {
            self.text.render(out);
            return;
        }

        put_header(
            out,
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{}\"", self.boundary),
        );
        out.put(CRLF);
        out.put(PREAMBLE);

        let parts = std::iter::once(&self.text)
            .chain(self.attachments.iter())
            .chain(extra);
        for part in parts {
            out.put(b"--");
            out.put(self.boundary.as_bytes());
            out.put(CRLF);
            part.render(out);
            out.put(CRLF);
        }

        out.put(b"--");
        out.put(self.boundary.as_bytes());
        out.put(b"--");
        out.put(CRLF);
    }
}
