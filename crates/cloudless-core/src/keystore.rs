//! Per-room key persistence.
//!
//! A room membership owns one X25519 key pair. It is stored under the room id
//! so a restarted client can resume the room with the key the relay already
//! knows instead of re-registering a fresh one.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use cloudless_crypto::{KeyPair, PrivateKey, encoding};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Storage for room key pairs.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Key pair stored for `room_id`, if any.
    async fn load(&self, room_id: &str) -> Result<Option<KeyPair>>;

    /// Store `keypair` for `room_id`, replacing any previous one.
    async fn save(&self, room_id: &str, keypair: &KeyPair) -> Result<()>;

    /// Forget the key pair for `room_id`.
    async fn remove(&self, room_id: &str) -> Result<()>;
}

/// Volatile key store.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, PrivateKey>>,
}

impl MemoryKeyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rooms with a stored key.
    #[must_use]
    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = lock(&self.keys).keys().cloned().collect();
        rooms.sort();
        rooms
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load(&self, room_id: &str) -> Result<Option<KeyPair>> {
        Ok(lock(&self.keys)
            .get(room_id)
            .map(|secret| KeyPair::from_private(secret.clone())))
    }

    async fn save(&self, room_id: &str, keypair: &KeyPair) -> Result<()> {
        lock(&self.keys).insert(room_id.to_string(), keypair.secret_key().clone());
        Ok(())
    }

    async fn remove(&self, room_id: &str) -> Result<()> {
        lock(&self.keys).remove(room_id);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyStore")
            .field("rooms", &self.rooms())
            .finish()
    }
}

#[derive(Default, Serialize, Deserialize)]
struct KeyFile {
    #[serde(default)]
    rooms: BTreeMap<String, String>,
}

impl Drop for KeyFile {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        for value in self.rooms.values_mut() {
            value.zeroize();
        }
    }
}

/// JSON file of base64 private keys keyed by room id.
///
/// Writes go to a sibling temp file which is then renamed over the target.
/// On Unix the file is created with mode `0600`.
#[derive(Debug)]
pub struct FileKeyStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileKeyStore {
    /// Store backed by `path`. The file is created on first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<KeyFile> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(KeyFile::default()),
            Err(e) => return Err(io_error("read", &e)),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::KeyStore(format!("corrupt key file: {e}").into()))
    }

    async fn write(&self, file: &KeyFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error("create directory", &e))?;
            }
        }

        let json = Zeroizing::new(
            serde_json::to_vec_pretty(file)
                .map_err(|e| Error::KeyStore(format!("encode: {e}").into()))?,
        );
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json.as_slice())
            .await
            .map_err(|e| io_error("write", &e))?;
        restrict_permissions(&tmp).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error("rename", &e))
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn load(&self, room_id: &str) -> Result<Option<KeyPair>> {
        let file = self.read().await?;
        let Some(encoded) = file.rooms.get(room_id) else {
            return Ok(None);
        };
        let bytes = Zeroizing::new(encoding::decode(encoded)?);
        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::KeyStore(format!("stored key for {room_id} has wrong length").into()))?;
        Ok(Some(KeyPair::from_private(PrivateKey::from_bytes(raw))))
    }

    async fn save(&self, room_id: &str, keypair: &KeyPair) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read().await?;
        let raw = Zeroizing::new(keypair.secret_key().to_bytes());
        file.rooms
            .insert(room_id.to_string(), encoding::encode(raw.as_slice()));
        self.write(&file).await?;
        tracing::debug!(room_id, path = %self.path.display(), "saved room key");
        Ok(())
    }

    async fn remove(&self, room_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read().await?;
        if let Some(mut old) = file.rooms.remove(room_id) {
            zeroize::Zeroize::zeroize(&mut old);
            self.write(&file).await?;
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| io_error("set permissions", &e))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn io_error(op: &str, err: &std::io::Error) -> Error {
    Error::KeyStore(format!("{op} failed: {err}").into())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
