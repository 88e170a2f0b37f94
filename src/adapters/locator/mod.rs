//! Where a source extract keeps its database and attachment files
//!
//! The database records attachment paths as they were on the original
//! device (`~/Library/Messages/Attachments/..`). A locator maps such a
//! logical path to a file on this machine, for a live Messages directory,
//! a copied one, or an iPhone backup.

pub mod mbdb;

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::types::error::SyncError;

pub use mbdb::Manifest;

pub const NATIVE_MESSAGES_DIR: &str = "~/Library/Messages";
pub const NATIVE_CHAT_DB: &str = "chat.db";
pub const BACKUP_CHAT_DB: &str = "Library/SMS/sms.db";
pub const BACKUP_MANIFEST: &str = "Manifest.mbdb";

#[derive(Debug, Clone)]
pub enum AttachmentLocator {
    /// The live Messages directory of the current user
    Native { base: PathBuf },
    /// A copy of a Messages directory somewhere else
    Relocated { root: PathBuf },
    /// An unencrypted iPhone backup directory
    IphoneBackup { root: PathBuf, manifest: Manifest },
}

impl AttachmentLocator {
    pub fn native() -> Self {
        AttachmentLocator::Native {
            base: expand(NATIVE_MESSAGES_DIR),
        }
    }

    /// Pick the locator for a user-supplied source path.
    ///
    /// Accepts a database file, a Messages directory (with `chat.db`) or a
    /// backup directory (with `Manifest.mbdb`).
    pub fn detect(path: &str) -> Result<Self, SyncError> {
        let path = expand(path);

        if path.is_file() {
            let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
            return Ok(Self::for_messages_dir(root));
        }
        if path.join(BACKUP_MANIFEST).is_file() {
            let manifest = Manifest::load(&path.join(BACKUP_MANIFEST))?;
            info!(path = ?path, files = manifest.len(), "Using iPhone backup");
            return Ok(AttachmentLocator::IphoneBackup {
                root: path,
                manifest,
            });
        }
        if path.join(NATIVE_CHAT_DB).is_file() {
            return Ok(Self::for_messages_dir(path));
        }

        Err(SyncError::InvalidInput(format!(
            "No message database found at {:?}",
            path
        )))
    }

    fn for_messages_dir(root: PathBuf) -> Self {
        let native = expand(NATIVE_MESSAGES_DIR);
        if root == native {
            AttachmentLocator::Native { base: native }
        } else {
            AttachmentLocator::Relocated { root }
        }
    }

    /// Path of the message database for this source
    pub fn chat_db(&self) -> Result<PathBuf, SyncError> {
        match self {
            AttachmentLocator::Native { base } => Ok(base.join(NATIVE_CHAT_DB)),
            AttachmentLocator::Relocated { root } => Ok(root.join(NATIVE_CHAT_DB)),
            AttachmentLocator::IphoneBackup { .. } => self.resolve(BACKUP_CHAT_DB).ok_or_else(|| {
                SyncError::Source(format!("{} not listed in backup manifest", BACKUP_CHAT_DB))
            }),
        }
    }

    /// Map a path recorded by the source to a local path, if there is one
    pub fn resolve(&self, logical: &str) -> Option<PathBuf> {
        if logical.is_empty() {
            return None;
        }
        match self {
            AttachmentLocator::Native { .. } => Some(expand(logical)),
            AttachmentLocator::Relocated { root } => Some(relocate(root, logical)),
            AttachmentLocator::IphoneBackup { root, manifest } => {
                let Some(id) = manifest.file_id(logical) else {
                    debug!(path = logical, "Not in backup manifest");
                    return None;
                };
                Some(backup_file(root, id))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            AttachmentLocator::Native { base } => format!("native {:?}", base),
            AttachmentLocator::Relocated { root } => format!("relocated {:?}", root),
            AttachmentLocator::IphoneBackup { root, .. } => format!("backup {:?}", root),
        }
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

fn relocate(root: &Path, logical: &str) -> PathBuf {
    match logical.strip_prefix(NATIVE_MESSAGES_DIR) {
        Some(rest) if !rest.is_empty() => root.join(rest.trim_start_matches('/')),
        _ => expand(logical),
    }
}

/// Older backups keep files flat, newer ones under a two-character prefix
fn backup_file(root: &Path, id: &str) -> PathBuf {
    let flat = root.join(id);
    if flat.exists() || id.len() < 2 {
        return flat;
    }
    let nested = root.join(&id[..2]).join(id);
    if nested.exists() {
        nested
    } else {
        flat
    }
}
