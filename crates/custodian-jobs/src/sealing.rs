//! Reference encryption engine.
//!
//! Each job gets a fresh random 256-bit content key (CEK). The material is
//! sealed with ChaCha20-Poly1305 under the CEK, and the CEK is sealed under a
//! key-encryption key derived from the device's identity with BLAKE3. Both
//! sealed payloads are `nonce (12 bytes) || ciphertext`.
//!
//! A client holding the fingerprint recovers the CEK with [`unwrap_key`] and the
//! plaintext with [`open_artifact`].
//!
//! The KEK depends only on device identity, so rotating a stored key re-seals
//! the same CEK under a fresh nonce.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use custodian_access::{KeyRewrap, PortError};
use custodian_core::{ContentEncryptionKey, DeviceId, Fingerprint, MaterialId};
use custodian_store::DeviceRepository;

use crate::engine::{EncryptionEngine, EncryptionOutput, EncryptionRequest, EngineError};

const KEK_CONTEXT: &str = "custodian 2024-06-01 device key-encryption key";
const NONCE_LEN: usize = 12;

/// Where plaintext material comes from.
#[async_trait]
pub trait MaterialSource: Send + Sync {
    /// Fetch material bytes. `Ok(None)` if the material does not exist.
    async fn fetch(&self, material_id: &MaterialId) -> Result<Option<Bytes>, EngineError>;
}

/// Material held in memory.
#[derive(Default)]
pub struct InMemorySource {
    materials: RwLock<HashMap<MaterialId, Bytes>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, material_id: MaterialId, content: impl Into<Bytes>) {
        self.materials
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(material_id, content.into());
    }
}

#[async_trait]
impl MaterialSource for InMemorySource {
    async fn fetch(&self, material_id: &MaterialId) -> Result<Option<Bytes>, EngineError> {
        Ok(self
            .materials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(material_id)
            .cloned())
    }
}

/// Seals material per device and retains the artifacts in memory.
pub struct SealingEngine {
    source: Arc<dyn MaterialSource>,
    devices: Arc<dyn DeviceRepository>,
    artifacts: RwLock<HashMap<(MaterialId, DeviceId), Bytes>>,
}

impl SealingEngine {
    pub fn new(source: Arc<dyn MaterialSource>, devices: Arc<dyn DeviceRepository>) -> Self {
        Self {
            source,
            devices,
            artifacts: RwLock::new(HashMap::new()),
        }
    }

    /// Latest artifact produced for a material on a device.
    pub fn artifact(&self, material_id: &MaterialId, device_id: &DeviceId) -> Option<Bytes> {
        self.artifacts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(*material_id, *device_id))
            .cloned()
    }
}

#[async_trait]
impl EncryptionEngine for SealingEngine {
    async fn encrypt(&self, request: &EncryptionRequest) -> Result<EncryptionOutput, EngineError> {
        let device = self
            .devices
            .get_device(&request.device_id)
            .await
            .map_err(|e| EngineError::Source(format!("device lookup: {e}")))?
            .filter(|d| d.is_active())
            .ok_or(EngineError::DeviceNotFound(request.device_id))?;

        let content = self
            .source
            .fetch(&request.material_id)
            .await?
            .ok_or(EngineError::MaterialNotFound(request.material_id))?;

        let cek = generate_key();
        let artifact = Bytes::from(seal(&cek, &content)?);
        let kek = device_kek(&device.id, &device.fingerprint);
        let wrapped_key = seal(&kek, &cek)?;

        self.artifacts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((request.material_id, request.device_id), artifact.clone());

        tracing::debug!(
            job_id = %request.job_id,
            material_id = %request.material_id,
            device_id = %request.device_id,
            plaintext_len = content.len(),
            artifact_len = artifact.len(),
            "material sealed"
        );

        Ok(EncryptionOutput {
            wrapped_key,
            artifact,
        })
    }
}

#[async_trait]
impl KeyRewrap for SealingEngine {
    async fn rewrap(
        &self,
        cek: &ContentEncryptionKey,
        to_version: u32,
    ) -> Result<Vec<u8>, PortError> {
        let device = self
            .devices
            .get_device(&cek.device_id)
            .await
            .map_err(|e| PortError::new(format!("device lookup: {e}")))?
            .ok_or(EngineError::DeviceNotFound(cek.device_id))?;

        let key = unwrap_key(&device.id, &device.fingerprint, &cek.wrapped_key)?;
        let kek = device_kek(&device.id, &device.fingerprint);
        let wrapped = seal(&kek, &key)?;

        tracing::debug!(
            cek_id = %cek.id,
            from_version = cek.key_version,
            to_version,
            "content key resealed"
        );
        Ok(wrapped)
    }
}

/// Key-encryption key for a device.
pub fn device_kek(device_id: &DeviceId, fingerprint: &Fingerprint) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(KEK_CONTEXT);
    hasher.update(device_id.as_uuid().as_bytes());
    hasher.update(fingerprint.as_str().as_bytes());
    *hasher.finalize().as_bytes()
}

/// Recover a content key wrapped for a device.
pub fn unwrap_key(
    device_id: &DeviceId,
    fingerprint: &Fingerprint,
    wrapped: &[u8],
) -> Result<[u8; 32], EngineError> {
    let kek = device_kek(device_id, fingerprint);
    let key = open(&kek, wrapped)?;
    key.try_into()
        .map_err(|_| EngineError::Crypto("unwrapped key has wrong length".into()))
}

/// Decrypt an artifact with its content key.
pub fn open_artifact(cek: &[u8; 32], artifact: &[u8]) -> Result<Vec<u8>, EngineError> {
    open(cek, artifact)
}

fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, EngineError> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|e| EngineError::Crypto(e.to_string()))?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| EngineError::Crypto(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, EngineError> {
    if sealed.len() < NONCE_LEN {
        return Err(EngineError::Crypto("sealed payload too short".into()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|e| EngineError::Crypto(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| EngineError::Crypto(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use custodian_core::{Device, JobId, LicenseId, Platform, UserId};
    use custodian_store::{DeviceInsert, MemoryStore};

    fn fingerprint(seed: char) -> Fingerprint {
        Fingerprint::new(seed.to_string().repeat(64)).unwrap()
    }

    async fn setup() -> (SealingEngine, Arc<InMemorySource>, Device) {
        let store = Arc::new(MemoryStore::new());
        let device = Device::new(UserId::new(), fingerprint('a'), "Laptop", Platform::Desktop, 0)
            .unwrap();
        assert_eq!(
            store.register_device(&device, 5).await.unwrap(),
            DeviceInsert::Inserted
        );
        let source = Arc::new(InMemorySource::new());
        (SealingEngine::new(source.clone(), store), source, device)
    }

    fn request(material_id: MaterialId, device: &Device) -> EncryptionRequest {
        EncryptionRequest {
            job_id: JobId::new(),
            material_id,
            user_id: device.user_id,
            device_id: device.id,
            license_id: LicenseId::new(),
        }
    }

    #[tokio::test]
    async fn test_device_can_open_its_artifact() {
        let (engine, source, device) = setup().await;
        let material = MaterialId::new();
        source.insert(material, &b"chapter one"[..]);

        let out = engine.encrypt(&request(material, &device)).await.unwrap();
        assert_eq!(engine.artifact(&material, &device.id), Some(out.artifact.clone()));

        let cek = unwrap_key(&device.id, &device.fingerprint, &out.wrapped_key).unwrap();
        assert_eq!(open_artifact(&cek, &out.artifact).unwrap(), b"chapter one");
    }

    #[tokio::test]
    async fn test_other_fingerprint_cannot_unwrap() {
        let (engine, source, device) = setup().await;
        let material = MaterialId::new();
        source.insert(material, &b"chapter two"[..]);

        let out = engine.encrypt(&request(material, &device)).await.unwrap();
        assert!(matches!(
            unwrap_key(&device.id, &fingerprint('b'), &out.wrapped_key),
            Err(EngineError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_material_and_device() {
        let (engine, _source, device) = setup().await;
        let material = MaterialId::new();

        let err = engine.encrypt(&request(material, &device)).await.unwrap_err();
        assert_eq!(err, EngineError::MaterialNotFound(material));

        let mut stranger = request(material, &device);
        stranger.device_id = DeviceId::new();
        let err = engine.encrypt(&stranger).await.unwrap_err();
        assert_eq!(err, EngineError::DeviceNotFound(stranger.device_id));
    }

    #[tokio::test]
    async fn test_rewrap_reseals_same_key() {
        let (engine, source, device) = setup().await;
        let material = MaterialId::new();
        source.insert(material, &b"chapter three"[..]);
        let out = engine.encrypt(&request(material, &device)).await.unwrap();

        let cek = ContentEncryptionKey::new(device.user_id, material, device.id, out.wrapped_key, 1);
        let rewrapped = engine.rewrap(&cek, 2).await.unwrap();
        assert_ne!(rewrapped, cek.wrapped_key);

        let key = unwrap_key(&device.id, &device.fingerprint, &rewrapped).unwrap();
        assert_eq!(open_artifact(&key, &out.artifact).unwrap(), b"chapter three");

        let corrupt = ContentEncryptionKey::new(device.user_id, material, device.id, vec![1; 8], 1);
        assert!(engine.rewrap(&corrupt, 2).await.is_err());
    }

    #[test]
    fn test_open_rejects_truncated_payload() {
        assert!(open_artifact(&[0u8; 32], &[1, 2, 3]).is_err());
    }
}
