//! Watched-directory scanning.
//!
//! # Design
//! - The scanner is a pure function of the directory and the previous
//!   [`ScanCache`]; the orchestrator only consumes the returned diff.
//! - Files are re-parsed only when their size or modification time changes.
//! - Unparseable files and second claimants of an already-claimed content id
//!   are blocked. A blocked file keeps the id it had before it broke, so it
//!   never shows up as added or removed until it reparses or disappears.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use driftwood_core::{ContentId, Descriptor};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Suffix of descriptor files picked up by [`JsonDescriptorParser`].
pub const DESCRIPTOR_SUFFIX: &str = ".dl.json";

/// Why a descriptor file was rejected.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The file could not be read.
    #[error("descriptor file unreadable")]
    Io {
        /// Source IO error.
        source: std::io::Error,
    },
    /// The document is not valid descriptor JSON.
    #[error("descriptor is not valid JSON")]
    Json {
        /// Source JSON error.
        source: serde_json::Error,
    },
    /// A field failed validation.
    #[error("descriptor field is invalid")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Machine-readable reason.
        reason: &'static str,
    },
}

/// Turns descriptor files into validated descriptors.
pub trait DescriptorParser: Send {
    /// Whether `path` looks like a descriptor file at all.
    fn accepts(&self, path: &Path) -> bool;

    /// Parse the contents of `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] when the contents are not a valid descriptor.
    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<Descriptor, ParseError>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptorFile {
    content_id: ContentId,
    name: String,
    length: u64,
    announce: String,
}

/// Reads `*.dl.json` descriptor documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDescriptorParser;

impl DescriptorParser for JsonDescriptorParser {
    fn accepts(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(DESCRIPTOR_SUFFIX))
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<Descriptor, ParseError> {
        let file: DescriptorFile =
            serde_json::from_slice(bytes).map_err(|source| ParseError::Json { source })?;
        if file.name.trim().is_empty() {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "empty",
            });
        }
        if file.length == 0 {
            return Err(ParseError::InvalidField {
                field: "length",
                reason: "zero",
            });
        }
        let announce = url::Url::parse(&file.announce).map_err(|_| ParseError::InvalidField {
            field: "announce",
            reason: "not_a_url",
        })?;
        if !matches!(announce.scheme(), "http" | "https") {
            return Err(ParseError::InvalidField {
                field: "announce",
                reason: "unsupported_scheme",
            });
        }
        Ok(Descriptor {
            id: file.content_id,
            name: file.name,
            length: file.length,
            announce: file.announce,
            source: Some(path.to_path_buf()),
        })
    }
}

/// What the scanner remembers about one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Size at the time of the last parse.
    pub size: u64,
    /// Modification time at the time of the last parse.
    pub modified: Option<SystemTime>,
    /// Last successfully parsed descriptor.
    pub descriptor: Option<Descriptor>,
    /// Whether the current contents parsed.
    pub parsed: bool,
}

/// Scanner state carried from one scan to the next.
#[derive(Debug, Default, Clone)]
pub struct ScanCache {
    /// Claimed descriptors by content id.
    pub descriptors: HashMap<ContentId, Descriptor>,
    /// Every descriptor file seen, by path.
    pub files: HashMap<PathBuf, FileEntry>,
    /// Files excluded from the diff.
    pub blocked: HashSet<PathBuf>,
}

/// Ids that appeared or vanished since the previous scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanDiff {
    /// Newly claimed descriptors, ordered by id.
    pub added: Vec<Descriptor>,
    /// Ids no file claims any more, ordered.
    pub removed: Vec<ContentId>,
}

impl ScanDiff {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Directory scan collaborator.
pub trait DirectoryScanner: Send {
    /// Scan `dir` against `previous` and return the new cache plus the diff.
    fn scan(&self, dir: &Path, previous: ScanCache) -> (ScanCache, ScanDiff);
}

/// Scans the top level of a directory with a [`DescriptorParser`].
pub struct WatchDirScanner {
    parser: Box<dyn DescriptorParser>,
}

impl WatchDirScanner {
    /// Scanner using `parser`.
    #[must_use]
    pub fn new(parser: Box<dyn DescriptorParser>) -> Self {
        Self { parser }
    }

    fn candidates(&self, dir: &Path) -> Vec<PathBuf> {
        WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    debug!(error = %err, "skipping unreadable directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && self.parser.accepts(entry.path()))
            .map(walkdir::DirEntry::into_path)
            .collect()
    }

    fn refresh(
        &self,
        path: &Path,
        size: u64,
        modified: Option<SystemTime>,
        previous: Option<&FileEntry>,
    ) -> FileEntry {
        if let Some(previous) = previous
            && previous.size == size
            && previous.modified == modified
        {
            return previous.clone();
        }
        let parsed = fs::read(path)
            .map_err(|source| ParseError::Io { source })
            .and_then(|bytes| self.parser.parse(path, &bytes));
        match parsed {
            Ok(descriptor) => FileEntry {
                size,
                modified,
                descriptor: Some(descriptor),
                parsed: true,
            },
            Err(err) => {
                debug!(path = %path.display(), error = %err, detail = ?err, "descriptor blocked");
                FileEntry {
                    size,
                    modified,
                    descriptor: previous.and_then(|entry| entry.descriptor.clone()),
                    parsed: false,
                }
            }
        }
    }
}

impl Default for WatchDirScanner {
    fn default() -> Self {
        Self::new(Box::new(JsonDescriptorParser))
    }
}

impl DirectoryScanner for WatchDirScanner {
    fn scan(&self, dir: &Path, previous: ScanCache) -> (ScanCache, ScanDiff) {
        if !dir.is_dir() {
            warn!(path = %dir.display(), "watch directory unavailable; keeping previous scan");
            return (previous, ScanDiff::default());
        }

        let mut candidates = self.candidates(dir);
        // Files that held a claim last time go first so they keep it.
        candidates.sort_by_key(|path| {
            let held_claim = previous.files.get(path).is_some_and(|entry| entry.parsed)
                && !previous.blocked.contains(path);
            (!held_claim, path.clone())
        });

        let mut next = ScanCache::default();
        for path in candidates {
            let Ok(metadata) = fs::metadata(&path) else {
                continue;
            };
            let entry = self.refresh(
                &path,
                metadata.len(),
                metadata.modified().ok(),
                previous.files.get(&path),
            );
            if !entry.parsed {
                next.blocked.insert(path.clone());
            }
            if let Some(descriptor) = &entry.descriptor {
                let carried = !entry.parsed;
                match next.descriptors.entry(descriptor.id) {
                    Entry::Vacant(slot) => {
                        if !carried || previous.descriptors.contains_key(&descriptor.id) {
                            slot.insert(descriptor.clone());
                        }
                    }
                    Entry::Occupied(_) => {
                        if !carried {
                            warn!(
                                path = %path.display(),
                                content_id = %descriptor.id.short(),
                                "descriptor duplicates an existing content id; blocked"
                            );
                        }
                        next.blocked.insert(path.clone());
                    }
                }
            }
            next.files.insert(path, entry);
        }

        let mut added: Vec<Descriptor> = next
            .descriptors
            .iter()
            .filter(|(id, _)| !previous.descriptors.contains_key(id))
            .map(|(_, descriptor)| descriptor.clone())
            .collect();
        added.sort_by_key(|descriptor| descriptor.id);
        let mut removed: Vec<ContentId> = previous
            .descriptors
            .keys()
            .filter(|id| !next.descriptors.contains_key(id))
            .copied()
            .collect();
        removed.sort();

        (next, ScanDiff { added, removed })
    }
}
