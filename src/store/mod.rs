//! Write-once blob store for ciphertexts, policies and re-encrypted
//! ciphertexts.
//!
//! Blobs are addressed by `(request id, artifact kind)` and are never
//! overwritten: a second `put` under an existing key fails with
//! [`Error::StoreConflict`].

use std::{
    collections::HashMap,
    fmt::{self, Display},
    fs::{self, OpenOptions},
    io::{ErrorKind as IoErrorKind, Write},
    path::{Path, PathBuf},
    process,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
};

use tracing::{debug, warn};

use crate::{lifecycle::RequestId, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    Ciphertext,
    Policy,
    ReencryptedCiphertext,
}

impl ArtifactKind {
    #[must_use]
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::Ciphertext => "ct",
            Self::Policy => "policy",
            Self::ReencryptedCiphertext => "ctprime",
        }
    }
}

/// Key of a stored blob, displayed as `<kind>:<request id>`, e.g. `ct:42`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey {
    pub request: RequestId,
    pub kind: ArtifactKind,
}

impl StoreKey {
    #[must_use]
    pub const fn new(request: RequestId, kind: ArtifactKind) -> Self {
        Self { request, kind }
    }

    #[must_use]
    pub const fn ciphertext(request: RequestId) -> Self {
        Self::new(request, ArtifactKind::Ciphertext)
    }

    #[must_use]
    pub const fn policy(request: RequestId) -> Self {
        Self::new(request, ArtifactKind::Policy)
    }

    #[must_use]
    pub const fn reencrypted(request: RequestId) -> Self {
        Self::new(request, ArtifactKind::ReencryptedCiphertext)
    }
}

impl Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.request)
    }
}

impl FromStr for StoreKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = s
            .split_once(':')
            .ok_or_else(|| Error::ConversionFailed(format!("'{s}' is not a store key")))?;
        let kind = match prefix {
            "ct" => ArtifactKind::Ciphertext,
            "policy" => ArtifactKind::Policy,
            "ctprime" => ArtifactKind::ReencryptedCiphertext,
            _ => {
                return Err(Error::ConversionFailed(format!(
                    "unknown artifact kind '{prefix}'"
                )))
            }
        };
        Ok(Self::new(id.parse()?, kind))
    }
}

/// Durable write-once key/value store.
pub trait OpaqueStore: Send + Sync {
    /// Stores the blob, failing with [`Error::StoreConflict`] if the key is
    /// already taken.
    fn put(&self, key: StoreKey, blob: &[u8]) -> Result<(), Error>;

    /// Returns the blob stored under the key, or [`Error::NotFound`].
    fn get(&self, key: StoreKey) -> Result<Vec<u8>, Error>;
}

impl<T: OpaqueStore + ?Sized> OpaqueStore for std::sync::Arc<T> {
    fn put(&self, key: StoreKey, blob: &[u8]) -> Result<(), Error> {
        (**self).put(key, blob)
    }

    fn get(&self, key: StoreKey) -> Result<Vec<u8>, Error> {
        (**self).get(key)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<StoreKey, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> Result<usize, Error> {
        Ok(self
            .blobs
            .read()
            .map_err(|e| Error::Other(format!("poisoned store: {e}")))?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        self.len().map(|len| len == 0)
    }
}

impl OpaqueStore for MemoryStore {
    fn put(&self, key: StoreKey, blob: &[u8]) -> Result<(), Error> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|e| Error::Other(format!("poisoned store: {e}")))?;
        if blobs.contains_key(&key) {
            return Err(Error::StoreConflict(key.to_string()));
        }
        blobs.insert(key, blob.to_vec());
        debug!(key = %key, size = blob.len(), "stored blob");
        Ok(())
    }

    fn get(&self, key: StoreKey) -> Result<Vec<u8>, Error> {
        self.blobs
            .read()
            .map_err(|e| Error::Other(format!("poisoned store: {e}")))?
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }
}

/// Suffix of blobs being written.
const TMP_SUFFIX: &str = ".tmp";

/// Distinguishes the temporary files of the writers of this process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Store keeping one file per key in a directory.
///
/// A blob is fully written to a temporary file, then hard-linked under its
/// final name: the link fails if the name exists, so two writers racing on
/// the same key cannot both succeed, and a reader never sees a partial blob.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens the store, creating its directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, key: StoreKey) -> PathBuf {
        // ':' is not portable in file names
        self.root
            .join(format!("{}-{}", key.kind.prefix(), key.request))
    }

    fn tmp_path(&self, key: StoreKey) -> PathBuf {
        self.root.join(format!(
            "{}-{}.{}.{}{TMP_SUFFIX}",
            key.kind.prefix(),
            key.request,
            process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }
}

fn write_synced(path: &Path, blob: &[u8]) -> Result<(), Error> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(blob)?;
    file.sync_all()?;
    Ok(())
}

impl OpaqueStore for FileStore {
    fn put(&self, key: StoreKey, blob: &[u8]) -> Result<(), Error> {
        let tmp = self.tmp_path(key);
        let res = write_synced(&tmp, blob).and_then(|()| {
            fs::hard_link(&tmp, self.path(key)).map_err(|e| {
                if e.kind() == IoErrorKind::AlreadyExists {
                    Error::StoreConflict(key.to_string())
                } else {
                    e.into()
                }
            })
        });
        if let Err(e) = fs::remove_file(&tmp) {
            if e.kind() != IoErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %e, "cannot remove temporary blob");
            }
        }
        res?;
        debug!(key = %key, size = blob.len(), "stored blob");
        Ok(())
    }

    fn get(&self, key: StoreKey) -> Result<Vec<u8>, Error> {
        match fs::read(self.path(key)) {
            Ok(blob) => Ok(blob),
            Err(e) if e.kind() == IoErrorKind::NotFound => Err(Error::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
