//! iPhone backup manifest (`Manifest.mbdb`)
//!
//! Backups store every file under an opaque id, the SHA-1 of
//! `"{domain}-{relative path}"`. The manifest lists the relative paths, so
//! reading it gives the path -> id mapping needed to find the database and
//! attachments.
//!
//! Layout: `mbdb` magic, two version bytes, then records until EOF. Strings
//! are a big-endian u16 length followed by bytes, `0xFFFF` meaning empty.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use sha1::{Digest, Sha1};
use tracing::debug;

use crate::types::error::SyncError;

const MAGIC: &[u8] = b"mbdb";
const HEADER_LEN: usize = 6;
const EMPTY: u16 = 0xFFFF;

/// One manifest record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub domain: String,
    pub filename: String,
    pub mode: u16,
    pub size: u64,
    pub file_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// relative path -> file id
    files: HashMap<String, String>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let data = fs::read(path).map_err(|e| {
            SyncError::Source(format!("Failed to read manifest {:?}: {}", path, e))
        })?;
        let manifest = Self::parse(&data)?;
        debug!(path = ?path, files = manifest.len(), "Loaded backup manifest");
        Ok(manifest)
    }

    pub fn parse(data: &[u8]) -> Result<Self, SyncError> {
        Ok(Self::from_entries(parse_entries(data)?))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ManifestEntry>) -> Self {
        let files = entries
            .into_iter()
            .filter(|e| !e.filename.is_empty())
            .map(|e| (e.filename, e.file_id))
            .collect();
        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// File id for a path as recorded on the phone.
    ///
    /// The path is matched whole first, then with leading components
    /// stripped one at a time, so `~/Library/SMS/x` finds `Library/SMS/x`.
    pub fn file_id(&self, path: &str) -> Option<&str> {
        let mut rest = path.trim_start_matches('/');
        loop {
            if let Some(id) = self.files.get(rest) {
                return Some(id.as_str());
            }
            match rest.find('/') {
                Some(pos) => rest = &rest[pos + 1..],
                None => return None,
            }
        }
    }
}

pub fn file_id_for(domain: &str, filename: &str) -> String {
    let digest = Sha1::digest(format!("{}-{}", domain, filename).as_bytes());
    format!("{:x}", digest)
}

pub fn parse_entries(data: &[u8]) -> Result<Vec<ManifestEntry>, SyncError> {
    if data.len() < HEADER_LEN || &data[..MAGIC.len()] != MAGIC {
        return Err(SyncError::Parse(
            "This does not look like an MBDB file".to_string(),
        ));
    }

    let mut cursor = Cursor {
        data,
        offset: HEADER_LEN,
    };
    let mut entries = Vec::new();
    while !cursor.at_end() {
        entries.push(cursor.entry()?);
    }
    Ok(entries)
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn at_end(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SyncError> {
        let end = self.offset.checked_add(len).filter(|end| *end <= self.data.len());
        match end {
            Some(end) => {
                let bytes = &self.data[self.offset..end];
                self.offset = end;
                Ok(bytes)
            }
            None => Err(SyncError::Parse(format!(
                "Truncated manifest at offset {}",
                self.offset
            ))),
        }
    }

    fn uint(&mut self, size: usize) -> Result<u64, SyncError> {
        Ok(self
            .take(size)?
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    fn bytes(&mut self) -> Result<&'a [u8], SyncError> {
        let len = self.uint(2)? as u16;
        if len == EMPTY {
            return Ok(&[]);
        }
        self.take(len as usize)
    }

    fn string(&mut self) -> Result<String, SyncError> {
        Ok(String::from_utf8_lossy(self.bytes()?).into_owned())
    }

    fn entry(&mut self) -> Result<ManifestEntry, SyncError> {
        let domain = self.string()?;
        let filename = self.string()?;
        self.bytes()?; // link target
        self.bytes()?; // data hash
        self.bytes()?; // encryption key
        let mode = self.uint(2)? as u16;
        self.take(4 + 4)?; // inode
        self.take(4 + 4)?; // uid, gid
        self.take(4 * 3)?; // mtime, atime, ctime
        let size = self.uint(8)?;
        self.take(1)?; // protection class
        let properties = self.uint(1)?;
        for _ in 0..properties {
            self.bytes()?;
            self.bytes()?;
        }

        let file_id = file_id_for(&domain, &filename);
        Ok(ManifestEntry {
            domain,
            filename,
            mode,
            size,
            file_id,
        })
    }
}

/// Serialise entries back into manifest form, for building test backups
#[cfg(test)]
pub(crate) fn encode(entries: &[(&str, &str, u64)]) -> Vec<u8> {
    fn put_str(out: &mut Vec<u8>, s: &str) {
        if s.is_empty() {
            out.extend_from_slice(&EMPTY.to_be_bytes());
        } else {
            out.extend_from_slice(&(s.len() as u16).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
    }

    let mut out = b"mbdb\x05\x00".to_vec();
    for (domain, filename, size) in entries {
        put_str(&mut out, domain);
        put_str(&mut out, filename);
        put_str(&mut out, "");
        put_str(&mut out, "");
        put_str(&mut out, "");
        out.extend_from_slice(&0o100644u16.to_be_bytes());
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&501u32.to_be_bytes());
        out.extend_from_slice(&501u32.to_be_bytes());
        out.extend_from_slice(&[0u8; 12]);
        out.extend_from_slice(&size.to_be_bytes());
        out.push(4);
        out.push(1);
        put_str(&mut out, "com.apple.backup.prop");
        put_str(&mut out, "value");
    }
    out
}
