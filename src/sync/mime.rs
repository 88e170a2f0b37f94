//! MIME encoding helpers: header words, addresses, text and binary parts

use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::types::MimePart;

const B64_LINE: usize = 76;
const WORD_CHUNK: usize = 45;
const FOLD_AT: usize = 76;

/// Normalize line endings to CRLF
pub fn to_crlf(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n").replace('\n', "\r\n")
}

/// Encode header text, using RFC 2047 encoded words when not plain ASCII
pub fn encode_header_text(text: &str) -> String {
    let text = text.replace(['\r', '\n'], " ");
    if text.is_ascii() {
        return text;
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in text.chars() {
        if chunk.len() + c.len_utf8() > WORD_CHUNK {
            words.push(encoded_word(&chunk));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(encoded_word(&chunk));
    }
    words.join(" ")
}

fn encoded_word(chunk: &str) -> String {
    format!(
        "=?utf-8?b?{}?=",
        base64::engine::general_purpose::STANDARD.encode(chunk.as_bytes())
    )
}

/// Format a mailbox as `"Name" <addr>` or bare `addr`
pub fn format_mailbox(name: Option<&str>, email: &str) -> String {
    match name.map(str::trim).filter(|n| !n.is_empty() && *n != email) {
        Some(name) if name.is_ascii() => {
            let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"{}\" <{}>", escaped, email)
        }
        Some(name) => format!("{} <{}>", encode_header_text(name), email),
        None => email.to_string(),
    }
}

/// Fold a long header value at whitespace so lines stay readable
pub fn fold_header(name: &str, value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    let mut line_len = name.len() + 2;
    for (i, word) in value.split(' ').enumerate() {
        if i > 0 {
            if line_len + 1 + word.len() > FOLD_AT {
                out.push_str("\r\n ");
                line_len = 1;
            } else {
                out.push(' ');
                line_len += 1;
            }
        }
        out.push_str(word);
        line_len += word.len();
    }
    out
}

pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc2822()
}

/// Message-ID for a guid
pub fn message_id(guid: &str) -> String {
    format!("<{}@imessage_sync.local>", guid)
}

/// Root id every document of a conversation references
pub fn thread_root_id(thread_id: &str) -> String {
    format!("<thread-{}@imessage_sync.local>", thread_id)
}

/// Boundary that cannot occur in base64 or quoted-printable output
pub fn boundary_for(guid: &str) -> String {
    let hash = Sha256::digest(guid.as_bytes());
    format!("=_imessagesync_{}", &format!("{:x}", hash)[..24])
}

/// Base64 with CRLF-terminated lines of 76 columns
pub fn base64_lines(bytes: &[u8]) -> Vec<u8> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / B64_LINE * 2 + 2);
    for line in encoded.as_bytes().chunks(B64_LINE) {
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Upper bound of the base64 body size for `len` input bytes
pub fn base64_len(len: u64) -> u64 {
    let encoded = len.div_ceil(3) * 4;
    encoded + encoded.div_ceil(B64_LINE as u64) * 2
}

/// A text/plain part; ASCII stays 7bit, anything else is quoted-printable UTF-8
pub fn text_part(text: &str) -> MimePart {
    text_part_with_subtype(text, "plain", None)
}

pub fn text_part_with_subtype(
    text: &str,
    subtype: &str,
    disposition: Option<String>,
) -> MimePart {
    let text = to_crlf(text);
    let mut headers = Vec::new();
    let body = if text.is_ascii() && text.split("\r\n").all(|l| l.len() <= 998) {
        headers.push((
            "Content-Type".to_string(),
            format!("text/{}; charset=\"us-ascii\"", subtype),
        ));
        headers.push(("Content-Transfer-Encoding".to_string(), "7bit".to_string()));
        text.into_bytes()
    } else {
        headers.push((
            "Content-Type".to_string(),
            format!("text/{}; charset=\"utf-8\"", subtype),
        ));
        headers.push((
            "Content-Transfer-Encoding".to_string(),
            "quoted-printable".to_string(),
        ));
        quoted_printable::encode(text.as_bytes())
    };
    if let Some(disposition) = disposition {
        headers.push(("Content-Disposition".to_string(), disposition));
    }
    MimePart { headers, body }
}

/// A base64 part of the given MIME type
pub fn binary_part(bytes: &[u8], mime_type: &str, disposition: Option<String>) -> MimePart {
    let mut headers = vec![
        ("Content-Type".to_string(), mime_type.to_string()),
        ("Content-Transfer-Encoding".to_string(), "base64".to_string()),
    ];
    if let Some(disposition) = disposition {
        headers.push(("Content-Disposition".to_string(), disposition));
    }
    MimePart {
        headers,
        body: base64_lines(bytes),
    }
}

/// `Content-Disposition: attachment` with optional filename and creation date
pub fn attachment_disposition(
    filename: Option<&str>,
    created: Option<&DateTime<Utc>>,
) -> String {
    let mut value = "attachment".to_string();
    if let Some(name) = filename.filter(|n| !n.is_empty()) {
        value.push_str("; ");
        value.push_str(&filename_param(name));
    }
    if let Some(created) = created {
        value.push_str(&format!("; creation-date=\"{}\"", format_date(created)));
    }
    value
}

/// `filename="..."`, or the RFC 2231 form for names that need escaping
fn filename_param(name: &str) -> String {
    let plain = name.is_ascii()
        && !name
            .chars()
            .any(|c| c == '"' || c == '\\' || c.is_ascii_control());
    if plain {
        return format!("filename=\"{}\"", name);
    }

    let mut encoded = String::new();
    for byte in name.as_bytes() {
        let c = *byte as char;
        if c.is_ascii_alphanumeric() || "!#$&+-.^_`|~".contains(c) {
            encoded.push(c);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    format!("filename*=utf-8''{}", encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn decode(value: &str) -> String {
        let header = format!("X: {}", value);
        let (parsed, _) = mailparse::parse_header(header.as_bytes()).unwrap();
        parsed.get_value()
    }

    #[test]
    fn test_ascii_header_untouched() {
        assert_eq!(encode_header_text("iMessage with Bob"), "iMessage with Bob");
    }

    #[test]
    fn test_non_ascii_header_round_trips() {
        let text = "Gespräch mit Jürgen";
        let encoded = encode_header_text(text);
        assert!(encoded.is_ascii());
        assert!(encoded.starts_with("=?utf-8?b?"));
        assert_eq!(decode(&encoded), text);
    }

    #[test]
    fn test_long_header_splits_into_words() {
        let text = "Gespräch mit Jürgen über die Straße und viel mehr Text dazu";
        let encoded = encode_header_text(text);
        assert_eq!(encoded.split(' ').count(), 2);
        assert!(encoded.split(' ').all(|w| w.starts_with("=?utf-8?b?")));
    }

    #[test]
    fn test_format_mailbox() {
        assert_eq!(format_mailbox(None, "a@b.c"), "a@b.c");
        assert_eq!(format_mailbox(Some("a@b.c"), "a@b.c"), "a@b.c");
        assert_eq!(format_mailbox(Some("Al \"B\""), "a@b.c"), "\"Al \\\"B\\\"\" <a@b.c>");
        assert!(format_mailbox(Some("Zoë"), "z@b.c").starts_with("=?utf-8?b?"));
    }

    #[test]
    fn test_fold_header_keeps_words() {
        let value = (0..30)
            .map(|i| format!("<id-{}@imessage_sync.local>", i))
            .collect::<Vec<_>>()
            .join(" ");
        let folded = fold_header("References", &value);
        assert!(folded.contains("\r\n "));
        assert_eq!(folded.replace("\r\n ", " "), value);
    }

    #[test]
    fn test_base64_lines_wrap() {
        let body = base64_lines(&[7u8; 200]);
        let text = String::from_utf8(body.clone()).unwrap();
        assert!(text.lines().all(|l| l.len() <= 76));
        assert_eq!(body.len() as u64, base64_len(200));
    }

    #[test]
    fn test_text_part_encoding() {
        let ascii = text_part("hello\nworld");
        assert_eq!(ascii.header("Content-Transfer-Encoding"), Some("7bit"));
        assert_eq!(ascii.body, b"hello\r\nworld");

        let utf8 = text_part("héllo");
        assert_eq!(
            utf8.header("Content-Transfer-Encoding"),
            Some("quoted-printable")
        );
        assert!(utf8.body.is_ascii());
    }

    #[test]
    fn test_disposition() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            attachment_disposition(Some("a.jpg"), Some(&created)),
            "attachment; filename=\"a.jpg\"; creation-date=\"Fri, 1 Mar 2024 12:00:00 +0000\""
        );
        assert_eq!(
            attachment_disposition(Some("ü.jpg"), None),
            "attachment; filename*=utf-8''%C3%BC.jpg"
        );
        assert_eq!(attachment_disposition(None, None), "attachment");
    }

    #[test]
    fn test_boundary_is_stable() {
        assert_eq!(boundary_for("abc"), boundary_for("abc"));
        assert_ne!(boundary_for("abc"), boundary_for("abd"));
    }
}
