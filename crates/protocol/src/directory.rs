//! UID directory: the mapping from numeric user ids to public keys.
//!
//! The server's directory hands out uids and answers lookups; a client keeps
//! its own directory as a local cache, with the server's key at
//! [`Uid::SERVER`].
//!
//! All state sits behind one mutex. Allocation, reservation and insertion
//! happen under a single acquisition, so two registrations can never be
//! handed the same uid. Persistence goes through the [`KeyStore`] trait.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::identity::PeerKey;

/// Default exclusive upper bound for allocated uids: at most 11 decimal digits.
pub const UID_LIMIT: u64 = 100_000_000_000;

/// Subdirectory of a data directory holding one PEM file per uid.
pub const UIDS_DIR: &str = "uids";

/// Longest decimal rendering of a `u64`.
const MAX_UID_DIGITS: usize = 20;

/// A numeric user id, rendered in decimal on the wire and on disk.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Uid(pub u64);

impl Uid {
    /// Slot of the server key in a client's directory. Also the uid of a
    /// client that has not registered yet. Never allocated.
    pub const SERVER: Uid = Uid(0);

    /// Whether this is the reserved zero uid.
    pub fn is_server(&self) -> bool {
        *self == Self::SERVER
    }

    /// Decimal ASCII bytes, as carried in a message field.
    pub fn to_field(&self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }

    /// Parses a message field holding a decimal uid.
    pub fn from_field(field: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(field)
            .map_err(|_| ProtocolError::Malformed("uid is not valid UTF-8".to_string()))?;
        text.parse()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Uid {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s.len() > MAX_UID_DIGITS || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::Malformed(format!(
                "uid must be a decimal number, got {:?}",
                s
            )));
        }
        s.parse::<u64>()
            .map(Uid)
            .map_err(|e| ProtocolError::Malformed(format!("uid {:?} out of range: {}", s, e)))
    }
}

/// Backing storage for directory entries.
pub trait KeyStore: Send + Sync {
    /// Returns every stored entry.
    fn load_all(&self) -> Result<Vec<(Uid, PeerKey)>>;

    /// Persists one entry.
    fn store(&self, uid: Uid, key: &PeerKey) -> Result<()>;
}

/// Stores each key as `<dir>/uids/<uid>` in PKCS#1 PEM.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    /// Uses the `uids` subdirectory of `data_dir`. Nothing is created until
    /// the first write.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            dir: data_dir.as_ref().join(UIDS_DIR),
        }
    }

    /// Directory holding the key files.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, uid: Uid) -> PathBuf {
        self.dir.join(uid.to_string())
    }
}

impl KeyStore for FileKeyStore {
    fn load_all(&self) -> Result<Vec<(Uid, PeerKey)>> {
        if !self.dir.exists() {
            tracing::debug!("Key directory {:?} not found, starting empty", self.dir);
            return Ok(Vec::new());
        }

        let read_dir = fs::read_dir(&self.dir).map_err(|e| {
            ProtocolError::Storage(format!("failed to list {}: {}", self.dir.display(), e))
        })?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| {
                ProtocolError::Storage(format!("failed to list {}: {}", self.dir.display(), e))
            })?;
            let path = entry.path();

            let Some(uid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<Uid>().ok())
            else {
                tracing::warn!("Ignoring unexpected file {:?} in key directory", path);
                continue;
            };

            let pem = fs::read_to_string(&path).map_err(|e| {
                ProtocolError::Storage(format!("failed to read {}: {}", path.display(), e))
            })?;
            let key = PeerKey::from_pem(&pem).map_err(|e| {
                ProtocolError::Storage(format!("invalid key file {}: {}", path.display(), e))
            })?;
            entries.push((uid, key));
        }

        Ok(entries)
    }

    fn store(&self, uid: Uid, key: &PeerKey) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            ProtocolError::Storage(format!("failed to create {}: {}", self.dir.display(), e))
        })?;

        let path = self.key_path(uid);
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, key.to_pem()?).map_err(|e| {
            ProtocolError::Storage(format!("failed to write {}: {}", temp_path.display(), e))
        })?;
        fs::rename(&temp_path, &path).map_err(|e| {
            ProtocolError::Storage(format!(
                "failed to rename {} to {}: {}",
                temp_path.display(),
                path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

/// Keeps entries in memory only.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: Mutex<BTreeMap<Uid, PeerKey>>,
}

impl MemoryKeyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_all(&self) -> Result<Vec<(Uid, PeerKey)>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| ProtocolError::Storage("memory key store lock poisoned".to_string()))?;
        Ok(entries.iter().map(|(uid, key)| (*uid, key.clone())).collect())
    }

    fn store(&self, uid: Uid, key: &PeerKey) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ProtocolError::Storage("memory key store lock poisoned".to_string()))?;
        entries.insert(uid, key.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Entry {
    /// Allocated but not yet bound to a key.
    Reserved,
    Key(PeerKey),
}

/// The uid → public key map shared by all connections.
pub struct UidDirectory {
    store: Box<dyn KeyStore>,
    limit: u64,
    entries: Mutex<HashMap<Uid, Entry>>,
}

impl UidDirectory {
    /// Loads every entry from `store`. Allocated uids fall in `[1, limit)`.
    pub fn open<K: KeyStore + 'static>(store: K, limit: u64) -> Result<Self> {
        let entries: HashMap<Uid, Entry> = store
            .load_all()?
            .into_iter()
            .map(|(uid, key)| (uid, Entry::Key(key)))
            .collect();

        tracing::info!("Loaded {} directory entries", entries.len());

        Ok(Self {
            store: Box::new(store),
            limit,
            entries: Mutex::new(entries),
        })
    }

    /// Exclusive upper bound for allocated uids.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uid, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| ProtocolError::Storage("directory lock poisoned".to_string()))
    }

    /// Picks an unused uid uniformly at random and reserves it.
    fn reserve(&self, entries: &mut HashMap<Uid, Entry>) -> Result<Uid> {
        let used = entries
            .keys()
            .filter(|uid| uid.0 >= 1 && uid.0 < self.limit)
            .count() as u64;
        if used >= self.limit.saturating_sub(1) {
            return Err(ProtocolError::DirectoryExhausted {
                limit: self.limit.saturating_sub(1),
            });
        }

        let uid = loop {
            let candidate = Uid(OsRng.gen_range(1..self.limit));
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(uid, Entry::Reserved);
        Ok(uid)
    }

    /// Reserves a fresh uid that [`UidDirectory::put`] can later fill.
    pub fn allocate(&self) -> Result<Uid> {
        let mut entries = self.lock()?;
        self.reserve(&mut entries)
    }

    /// Binds `uid` to `key` and persists it.
    ///
    /// A uid already bound to a different key is immutable
    /// ([`ProtocolError::UidTaken`]); binding the same key again is a no-op.
    pub fn put(&self, uid: Uid, key: PeerKey) -> Result<()> {
        let mut entries = self.lock()?;

        match entries.get(&uid) {
            Some(Entry::Key(existing)) if *existing == key => return Ok(()),
            Some(Entry::Key(_)) => {
                return Err(ProtocolError::UidTaken {
                    uid: uid.to_string(),
                })
            }
            Some(Entry::Reserved) | None => {}
        }

        self.store.store(uid, &key)?;
        entries.insert(uid, Entry::Key(key));
        tracing::debug!("Stored key for uid {}", uid);
        Ok(())
    }

    /// Binds [`Uid::SERVER`] to `key`, replacing any earlier server key.
    ///
    /// This is the one rebinding a directory allows. A client registering
    /// afresh adopts the key of the server that signed its registration, even
    /// if an older server key is cached. Every other uid stays immutable.
    pub fn replace_server_key(&self, key: PeerKey) -> Result<()> {
        let mut entries = self.lock()?;

        if let Some(Entry::Key(existing)) = entries.get(&Uid::SERVER) {
            if *existing == key {
                return Ok(());
            }
            tracing::warn!(
                "Replacing cached server key {} with {}",
                existing.fingerprint(),
                key.fingerprint()
            );
        }

        self.store.store(Uid::SERVER, &key)?;
        entries.insert(Uid::SERVER, Entry::Key(key));
        Ok(())
    }

    /// Allocates a uid for `key` and stores the pair in one critical section.
    pub fn register(&self, key: PeerKey) -> Result<Uid> {
        let mut entries = self.lock()?;
        let uid = self.reserve(&mut entries)?;

        if let Err(e) = self.store.store(uid, &key) {
            entries.remove(&uid);
            return Err(e);
        }

        tracing::info!("Registered uid {} for key {}", uid, key.fingerprint());
        entries.insert(uid, Entry::Key(key));
        Ok(uid)
    }

    /// Returns the key bound to `uid`.
    pub fn get(&self, uid: Uid) -> Result<PeerKey> {
        let entries = self.lock()?;
        match entries.get(&uid) {
            Some(Entry::Key(key)) => Ok(key.clone()),
            Some(Entry::Reserved) | None => Err(ProtocolError::UnknownUid {
                uid: uid.to_string(),
            }),
        }
    }

    /// Whether `uid` is bound to a key.
    pub fn contains(&self, uid: Uid) -> Result<bool> {
        let entries = self.lock()?;
        Ok(matches!(entries.get(&uid), Some(Entry::Key(_))))
    }

    /// Every uid bound to a key, in ascending order.
    pub fn list(&self) -> Result<BTreeSet<Uid>> {
        let entries = self.lock()?;
        Ok(entries
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Key(_)))
            .map(|(uid, _)| *uid)
            .collect())
    }
}

impl fmt::Debug for UidDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.entries.lock().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("UidDirectory")
            .field("limit", &self.limit)
            .field("entries", &len)
            .finish()
    }
}
