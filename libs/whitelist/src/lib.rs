//! Source-address whitelist shared by every onedoor backend.
//!
//! The whitelist is an ordered, duplicate-free set of trimmed address
//! strings with an optional backing file.
//!
//! ## Fail-open semantics
//!
//! An **empty** whitelist is *disabled*: [`Whitelist::enabled`] returns
//! `false` and every source address must be treated as allowed. Callers must
//! not reinterpret an empty list as "deny all". Operators who want to restrict
//! access have to add at least one address.
//!
//! ## Concurrency
//!
//! Readers load an immutable snapshot through [`ArcSwap`] and never block.
//! Mutations are serialized behind a mutex and publish a fresh snapshot in a
//! single pointer swap, so a reader sees either the old or the new list, never
//! a partial update.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::{debug, info};

/// Whitelist errors.
#[derive(Debug, Error)]
pub enum WhitelistError {
    /// The whitelist file exists but could not be read.
    #[error("failed to read whitelist file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The whitelist file could not be written.
    #[error("failed to write whitelist file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Ordered set of allowed source addresses.
#[derive(Debug)]
pub struct Whitelist {
    /// Current entries, in insertion order.
    entries: ArcSwap<Vec<String>>,
    /// Backing file; the mutex also serializes all writers.
    file: Mutex<Option<PathBuf>>,
}

impl Whitelist {
    /// Create an empty (disabled) whitelist with no backing file.
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            file: Mutex::new(None),
        }
    }

    /// Create a whitelist seeded with `addresses`.
    pub fn with_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let whitelist = Self::new();
        whitelist.add_all(addresses);
        whitelist
    }

    fn writer(&self) -> MutexGuard<'_, Option<PathBuf>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a single address. Returns `true` if the set changed.
    pub fn add(&self, address: &str) -> bool {
        self.add_all([address])
    }

    /// Add a sequence of addresses.
    ///
    /// Each address is trimmed; empty strings and addresses already present
    /// are skipped. Returns `true` if at least one address was added.
    pub fn add_all<I, S>(&self, addresses: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let _guard = self.writer();
        let current = self.entries.load();
        let mut next: Vec<String> = Vec::clone(&current);

        for address in addresses {
            let address = address.as_ref().trim();
            if address.is_empty() || next.iter().any(|e| e == address) {
                continue;
            }
            next.push(address.to_string());
        }

        if next.len() == current.len() {
            return false;
        }

        debug!(
            added = next.len() - current.len(),
            total = next.len(),
            "Whitelist updated"
        );
        self.entries.store(Arc::new(next));
        true
    }

    /// Remove an address by exact match. Returns `true` if it was present.
    pub fn remove(&self, address: &str) -> bool {
        let _guard = self.writer();
        let current = self.entries.load();

        let Some(idx) = current.iter().position(|e| e == address) else {
            return false;
        };

        let mut next: Vec<String> = Vec::clone(&current);
        next.remove(idx);
        debug!(total = next.len(), "Whitelist entry removed");
        self.entries.store(Arc::new(next));
        true
    }

    /// Check whether `address` (trimmed) is in the set.
    pub fn contains(&self, address: &str) -> bool {
        let address = address.trim();
        self.entries.load().iter().any(|e| e == address)
    }

    /// Current entries, in insertion order.
    pub fn all(&self) -> Vec<String> {
        Vec::clone(&self.entries.load())
    }

    /// Immutable snapshot of the current entries.
    pub fn snapshot(&self) -> Arc<Vec<String>> {
        self.entries.load_full()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    /// Check if the whitelist has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Whether the whitelist restricts access at all.
    ///
    /// `false` means *every* source is allowed (fail-open).
    pub fn enabled(&self) -> bool {
        !self.is_empty()
    }

    /// Bind a backing file used by [`Whitelist::sync`].
    pub fn set_file(&self, path: impl Into<PathBuf>) {
        *self.writer() = Some(path.into());
    }

    /// The bound backing file, if any.
    pub fn file(&self) -> Option<PathBuf> {
        self.writer().clone()
    }

    /// Overwrite the backing file with the current entries, one per line.
    ///
    /// Returns `Ok(false)` if no file is bound. On error the in-memory state
    /// is left untouched.
    pub fn sync(&self) -> Result<bool, WhitelistError> {
        let guard = self.writer();
        let Some(path) = guard.as_ref() else {
            return Ok(false);
        };

        let entries = self.entries.load();
        write_entries(path, &entries).map_err(|source| WhitelistError::Write {
            path: path.clone(),
            source,
        })?;

        debug!(
            path = %path.display(),
            count = entries.len(),
            "Whitelist synced to disk"
        );
        Ok(true)
    }

    /// Load addresses from `path`, bind it as the backing file, and add them.
    ///
    /// A missing file counts as empty and is created on the first sync.
    /// Returns the number of addresses that were added.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<usize, WhitelistError> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Whitelist file not found, starting empty");
                String::new()
            }
            Err(source) => {
                return Err(WhitelistError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        self.set_file(path);

        let before = self.len();
        self.add_all(parse_file(&content));
        let added = self.len() - before;

        info!(
            path = %path.display(),
            added = added,
            total = self.len(),
            "Loaded whitelist file"
        );
        Ok(added)
    }
}

impl Default for Whitelist {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a comma-separated address list (`"a, b,c"`).
pub fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split whitelist file contents into one address per line.
pub fn parse_file(content: &str) -> Vec<String> {
    content
        .trim()
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Overwrite the file in place, one address per line. Symlinks and
/// permissions of an existing file are kept.
fn write_entries(path: &Path, entries: &[String]) -> io::Result<()> {
    let mut content = entries.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    fs::write(path, content)
}
