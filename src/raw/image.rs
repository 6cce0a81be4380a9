use crate::catalog::ContainerKey;
use crate::catalog::types::Row;
use crate::error::AccessError;
use crate::storage::encoded_key::EncodedKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

pub const IMAGE_FILE: &str = "store.img";
pub const BACKUP_MANIFEST_FILE: &str = "backup_manifest.json";
const IMAGE_MAGIC: &[u8; 8] = b"CONGIMG1";
const IMAGE_FORMAT_VERSION: u32 = 1;

/// Committed contents of a raw store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreImage {
    pub format_version: u32,
    pub max_container_id: i64,
    pub containers: Vec<ContainerImage>,
    pub service_properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerImage {
    pub key: ContainerKey,
    #[serde(with = "serde_bytes")]
    pub metadata: Vec<u8>,
    pub next_record_id: u64,
    pub rows: Vec<(EncodedKey, Row)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupManifest {
    pub version: u32,
    pub created_at_micros: u64,
    pub image_file: String,
    pub sha256_hex: String,
    pub size_bytes: u64,
    pub container_count: usize,
    pub max_container_id: i64,
}

/// Writes `image` atomically as `dir/store.img`. Layout: magic, zstd of the
/// msgpack body, then the SHA-256 of everything before it.
pub fn write_image(image: &StoreImage, dir: &Path) -> Result<u64, AccessError> {
    fs::create_dir_all(dir)?;
    let mut image = image.clone();
    image.format_version = IMAGE_FORMAT_VERSION;
    let encoded = rmp_serde::to_vec(&image).map_err(|e| AccessError::Encode(e.to_string()))?;
    let compressed = zstd::stream::encode_all(encoded.as_slice(), 3)
        .map_err(|e| AccessError::Io(std::io::Error::other(e.to_string())))?;

    let mut payload = Vec::with_capacity(IMAGE_MAGIC.len() + compressed.len() + 32);
    payload.extend_from_slice(IMAGE_MAGIC);
    payload.extend_from_slice(&compressed);
    let hash = Sha256::digest(&payload);
    payload.extend_from_slice(&hash);

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&payload)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(IMAGE_FILE))
        .map_err(|e| AccessError::Io(e.error))?;
    Ok(payload.len() as u64)
}

pub fn read_image(path: &Path) -> Result<StoreImage, AccessError> {
    let bytes = fs::read(path)?;
    if bytes.len() < IMAGE_MAGIC.len() + 32 {
        return Err(AccessError::Decode("store image too small".into()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 32);
    if Sha256::digest(body).as_slice() != trailer {
        return Err(AccessError::Corrupt(format!(
            "store image hash mismatch: {}",
            path.display()
        )));
    }
    let Some(compressed) = body.strip_prefix(IMAGE_MAGIC.as_slice()) else {
        return Err(AccessError::Corrupt("store image magic mismatch".into()));
    };
    let decompressed = zstd::stream::decode_all(compressed)
        .map_err(|e| AccessError::Io(std::io::Error::other(e.to_string())))?;
    let image: StoreImage =
        rmp_serde::from_slice(&decompressed).map_err(|e| AccessError::Decode(e.to_string()))?;
    if image.format_version != IMAGE_FORMAT_VERSION {
        return Err(AccessError::Decode(format!(
            "unsupported store image version {}",
            image.format_version
        )));
    }
    Ok(image)
}

pub fn load_image_if_present(dir: &Path) -> Result<Option<StoreImage>, AccessError> {
    let path = dir.join(IMAGE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    read_image(&path).map(Some)
}

pub fn write_backup(image: &StoreImage, dir: &Path) -> Result<BackupManifest, AccessError> {
    write_image(image, dir)?;
    let image_path = dir.join(IMAGE_FILE);
    let manifest = BackupManifest {
        version: IMAGE_FORMAT_VERSION,
        created_at_micros: now_micros(),
        image_file: IMAGE_FILE.to_string(),
        sha256_hex: sha256_file_hex(&image_path)?,
        size_bytes: fs::metadata(&image_path)?.len(),
        container_count: image.containers.len(),
        max_container_id: image.max_container_id,
    };
    write_backup_manifest(dir, &manifest)?;
    Ok(manifest)
}

pub fn write_backup_manifest(dir: &Path, manifest: &BackupManifest) -> Result<(), AccessError> {
    fs::create_dir_all(dir)?;
    let bytes =
        serde_json::to_vec_pretty(manifest).map_err(|e| AccessError::Encode(e.to_string()))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.flush()?;
    tmp.persist(dir.join(BACKUP_MANIFEST_FILE))
        .map_err(|e| AccessError::Io(e.error))?;
    Ok(())
}

pub fn load_backup_manifest(dir: &Path) -> Result<BackupManifest, AccessError> {
    let bytes = fs::read(dir.join(BACKUP_MANIFEST_FILE))?;
    let manifest: BackupManifest =
        serde_json::from_slice(&bytes).map_err(|e| AccessError::Decode(e.to_string()))?;
    if manifest.image_file.contains(['/', '\\']) || manifest.image_file.contains("..") {
        return Err(AccessError::Validation(format!(
            "backup image file must be a plain file name: {}",
            manifest.image_file
        )));
    }
    if manifest.sha256_hex.len() != 64 || hex::decode(&manifest.sha256_hex).is_err() {
        return Err(AccessError::Validation(
            "backup manifest checksum is not sha256 hex".into(),
        ));
    }
    Ok(manifest)
}

/// Checks the manifest against the image on disk and returns both.
pub fn verify_backup(dir: &Path) -> Result<(BackupManifest, StoreImage), AccessError> {
    let manifest = load_backup_manifest(dir)?;
    let image_path = dir.join(&manifest.image_file);
    let actual = sha256_file_hex(&image_path)?;
    if actual != manifest.sha256_hex {
        return Err(AccessError::Corrupt(format!(
            "backup image checksum mismatch: expected {}, found {actual}",
            manifest.sha256_hex
        )));
    }
    let image = read_image(&image_path)?;
    Ok((manifest, image))
}

pub fn sha256_file_hex(path: &Path) -> Result<String, AccessError> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
