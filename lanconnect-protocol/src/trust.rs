//! Certificate Trust Store
//!
//! Binds device ids to the certificate pinned on first pairing. A record is
//! created when a pairing is approved, deleted on unpair and consulted on
//! every handshake. Comparison is always on the exact DER bytes, never on
//! subject or issuer names, so a fresh self-signed certificate claiming a
//! known device id is rejected.
//!
//! [`FileTrustStore`] keeps one PEM file per device (`<data_dir>/<id>.pem`,
//! mode 0600). [`MemoryTrustStore`] keeps records in memory only.

use crate::certificate::{der_to_pem, pem_to_der};
use crate::identity::validate_device_id;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// File extension of trust records
const RECORD_EXTENSION: &str = "pem";

/// Persistent device id → certificate bindings
///
/// Every operation is a single atomic local mutation. Absence of a record is
/// never an error.
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Pin `certificate` (DER) for `device_id`, replacing any previous one
    async fn add(&self, device_id: &str, certificate: &[u8]) -> Result<()>;

    /// Pinned certificate (DER) for `device_id`, if any
    async fn get(&self, device_id: &str) -> Result<Option<Vec<u8>>>;

    /// Forget `device_id`; returns whether a record existed
    async fn remove(&self, device_id: &str) -> Result<bool>;

    /// All trusted device ids
    async fn list(&self) -> Result<Vec<String>>;

    /// Whether `device_id` has a pinned certificate
    async fn contains(&self, device_id: &str) -> Result<bool> {
        Ok(self.get(device_id).await?.is_some())
    }
}

/// Trust store backed by one PEM file per device
pub struct FileTrustStore {
    dir: PathBuf,
    /// Serializes mutations across concurrent sessions
    write_lock: Mutex<()>,
}

impl FileTrustStore {
    /// Open (and create if needed) a trust store rooted at `dir`
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        debug!("Trust store at {:?}", dir);

        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the records
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, device_id: &str) -> Result<PathBuf> {
        validate_device_id(device_id)?;
        Ok(self.dir.join(format!("{}.{}", device_id, RECORD_EXTENSION)))
    }
}

#[async_trait]
impl TrustStore for FileTrustStore {
    async fn add(&self, device_id: &str, certificate: &[u8]) -> Result<()> {
        let path = self.record_path(device_id)?;
        let tmp_path = path.with_extension("pem.tmp");

        let _guard = self.write_lock.lock().await;

        // A leftover temp file would keep whatever mode it had
        let _ = fs::remove_file(&tmp_path).await;

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&tmp_path).await?;
        file.write_all(der_to_pem(certificate).as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &path).await?;

        info!("Trusted certificate stored for device {}", device_id);
        Ok(())
    }

    async fn get(&self, device_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(device_id)?;

        match fs::read(&path).await {
            Ok(data) => pem_to_der(&data).map(Some).map_err(|e| {
                ProtocolError::TrustStore(format!("Corrupt record for {}: {}", device_id, e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, device_id: &str) -> Result<bool> {
        let path = self.record_path(device_id)?;

        let _guard = self.write_lock.lock().await;

        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Removed trusted certificate for device {}", device_id);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_device_id(id).is_ok() {
                    ids.push(id.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

/// In-memory trust store
#[derive(Default)]
pub struct MemoryTrustStore {
    records: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn add(&self, device_id: &str, certificate: &[u8]) -> Result<()> {
        validate_device_id(device_id)?;
        self.records
            .write()
            .await
            .insert(device_id.to_string(), certificate.to_vec());
        Ok(())
    }

    async fn get(&self, device_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records.read().await.get(device_id).cloned())
    }

    async fn remove(&self, device_id: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(device_id).is_some())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CertificateInfo;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_add_get_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTrustStore::open(temp_dir.path()).await.unwrap();
        let cert = CertificateInfo::generate("alpha").unwrap();

        assert_eq!(store.get("alpha").await.unwrap(), None);

        store.add("alpha", &cert.certificate).await.unwrap();
        assert_eq!(store.get("alpha").await.unwrap(), Some(cert.certificate.clone()));
        assert!(store.contains("alpha").await.unwrap());

        assert!(store.remove("alpha").await.unwrap());
        assert_eq!(store.get("alpha").await.unwrap(), None);
        assert!(!store.remove("alpha").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTrustStore::open(temp_dir.path()).await.unwrap();

        store.add("alpha", b"first").await.unwrap();
        store.add("alpha", b"second").await.unwrap();

        assert_eq!(store.get("alpha").await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(store.list().await.unwrap(), vec!["alpha".to_string()]);
    }

    #[tokio::test]
    async fn test_records_persist_as_pem() {
        let temp_dir = TempDir::new().unwrap();
        let cert = CertificateInfo::generate("beta").unwrap();

        {
            let store = FileTrustStore::open(temp_dir.path()).await.unwrap();
            store.add("beta", &cert.certificate).await.unwrap();
        }

        let contents = std::fs::read_to_string(temp_dir.path().join("beta.pem")).unwrap();
        assert!(contents.starts_with("-----BEGIN CERTIFICATE-----"));

        let reopened = FileTrustStore::open(temp_dir.path()).await.unwrap();
        assert_eq!(reopened.get("beta").await.unwrap(), Some(cert.certificate));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(temp_dir.path().join("beta.pem"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_list_ignores_other_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTrustStore::open(temp_dir.path()).await.unwrap();
        std::fs::write(temp_dir.path().join("id"), "local-id").unwrap();

        store.add("b", b"1").await.unwrap();
        store.add("a", b"2").await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_rejects_unsafe_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTrustStore::open(temp_dir.path()).await.unwrap();

        assert!(matches!(
            store.add("../escape", b"x").await,
            Err(ProtocolError::InvalidDeviceId(_))
        ));
        assert!(store.get("").await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTrustStore::open(temp_dir.path()).await.unwrap();
        std::fs::write(temp_dir.path().join("gamma.pem"), "not a pem").unwrap();

        assert!(matches!(
            store.get("gamma").await,
            Err(ProtocolError::TrustStore(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_adds() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FileTrustStore::open(temp_dir.path()).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.add("shared", &[i; 8]).await.unwrap();
                store.add(&format!("device{}", i), &[i]).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = store.get("shared").await.unwrap().unwrap();
        assert_eq!(stored.len(), 8);
        assert!(stored.iter().all(|b| *b == stored[0]));
        assert_eq!(store.list().await.unwrap().len(), 17);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryTrustStore::new();

        store.add("alpha", b"cert").await.unwrap();
        assert_eq!(store.get("alpha").await.unwrap(), Some(b"cert".to_vec()));
        assert_eq!(store.list().await.unwrap(), vec!["alpha".to_string()]);
        assert!(store.remove("alpha").await.unwrap());
        assert!(!store.contains("alpha").await.unwrap());
    }
}
