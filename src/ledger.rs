use crate::config::LedgerConfig;
use crate::identifier::Identifier;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ledger entry is corrupt: {0}")]
    Corrupt(String),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Which instrument and mint series a spent entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpentScope {
    pub instrument_definition_id: Identifier,
    pub series: u32,
}

impl fmt::Display for SpentScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.instrument_definition_id, self.series)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub scope: SpentScope,
    pub digest: Identifier,
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.digest)
    }
}

/// One-way key for a cleartext coin.
pub fn digest_key(cleartext: &[u8], scope: SpentScope) -> LedgerKey {
    LedgerKey {
        scope,
        digest: Identifier::digest(cleartext),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Storage behind the spent ledger. Entries are write-once.
///
/// `conditional_insert` must be a single atomic check-and-set: two
/// concurrent inserts of the same key resolve to exactly one `Inserted`.
pub trait SpentLedger: Send + Sync {
    fn exists(&self, key: &LedgerKey) -> Result<bool, LedgerError>;

    fn conditional_insert(&self, key: &LedgerKey, blob: &[u8])
        -> Result<InsertOutcome, LedgerError>;
}

impl<L: SpentLedger + ?Sized> SpentLedger for std::sync::Arc<L> {
    fn exists(&self, key: &LedgerKey) -> Result<bool, LedgerError> {
        (**self).exists(key)
    }

    fn conditional_insert(
        &self,
        key: &LedgerKey,
        blob: &[u8],
    ) -> Result<InsertOutcome, LedgerError> {
        (**self).conditional_insert(key, blob)
    }
}

/// In-process ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<LedgerKey, Vec<u8>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &LedgerKey) -> Option<Vec<u8>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SpentLedger for MemoryLedger {
    fn exists(&self, key: &LedgerKey) -> Result<bool, LedgerError> {
        Ok(self.entries.lock().contains_key(key))
    }

    fn conditional_insert(
        &self,
        key: &LedgerKey,
        blob: &[u8],
    ) -> Result<InsertOutcome, LedgerError> {
        use std::collections::hash_map::Entry;

        match self.entries.lock().entry(*key) {
            Entry::Occupied(_) => Ok(InsertOutcome::AlreadyPresent),
            Entry::Vacant(slot) => {
                slot.insert(blob.to_vec());
                Ok(InsertOutcome::Inserted)
            }
        }
    }
}

/// Ledger kept on disk as `<root>/<instrument>.<series>/<digest>`.
///
/// Entries are written to a temporary file in the scope directory and then
/// linked into place without clobbering, so a reader never sees a partial
/// entry and an existing entry is never replaced.
#[derive(Debug, Clone)]
pub struct FileLedger {
    root: PathBuf,
}

impl FileLedger {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| LedgerError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    /// The ledger named by `config`, or `None` when no root is configured.
    pub fn from_config(config: &LedgerConfig) -> Result<Option<Self>, LedgerError> {
        config.root.as_ref().map(|root| Self::open(root.clone())).transpose()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_dir(&self, scope: &SpentScope) -> PathBuf {
        self.root.join(scope.to_string())
    }

    pub fn path_for(&self, key: &LedgerKey) -> PathBuf {
        self.scope_dir(&key.scope).join(key.digest.to_hex())
    }

    pub fn read(&self, key: &LedgerKey) -> Result<Vec<u8>, LedgerError> {
        let path = self.path_for(key);
        fs::read(&path).map_err(|source| LedgerError::Io { path, source })
    }
}

impl SpentLedger for FileLedger {
    fn exists(&self, key: &LedgerKey) -> Result<bool, LedgerError> {
        let path = self.path_for(key);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(true),
            Ok(_) => Err(LedgerError::Corrupt(format!(
                "{} is not a file",
                path.display()
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(LedgerError::Io { path, source }),
        }
    }

    fn conditional_insert(
        &self,
        key: &LedgerKey,
        blob: &[u8],
    ) -> Result<InsertOutcome, LedgerError> {
        let dir = self.scope_dir(&key.scope);
        fs::create_dir_all(&dir).map_err(|source| LedgerError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|source| LedgerError::Io {
            path: dir.clone(),
            source,
        })?;
        tmp.write_all(blob)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|source| LedgerError::Io {
                path: tmp.path().to_path_buf(),
                source,
            })?;

        let path = self.path_for(key);
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                Ok(InsertOutcome::AlreadyPresent)
            }
            Err(e) => Err(LedgerError::Io {
                path,
                source: e.error,
            }),
        }
    }
}
