use crate::error::AccessError;
use crate::raw::RawStore;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

pub const BOOT_PASSWORD: &str = "conglomdb.bootPassword";
pub const ENCRYPTED_BOOT_PASSWORD: &str = "conglomdb.encryptedBootPassword";

const VERIFIER_PLAINTEXT: &[u8] = b"conglomdb boot password verifier v1";
const NONCE_LEN: usize = 12;

fn derive_key(password: &str) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&Sha256::digest(password.as_bytes()));
    key
}

/// Hex of `nonce || AES-256-GCM(verifier)` under a key derived from
/// `password`.
pub fn protect(password: &str) -> Result<String, AccessError> {
    let key = derive_key(password);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|e| AccessError::Validation(format!("invalid boot key: {e}")))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&Uuid::new_v4().as_bytes()[..NONCE_LEN]);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), VERIFIER_PLAINTEXT)
        .map_err(|e| AccessError::Encode(format!("boot password protection failed: {e}")))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(hex::encode(out))
}

/// Whether `password` opens the stored verifier.
pub fn verify(password: &str, stored_hex: &str) -> Result<bool, AccessError> {
    let bytes = hex::decode(stored_hex)
        .map_err(|e| AccessError::Corrupt(format!("boot password verifier is not hex: {e}")))?;
    if bytes.len() <= NONCE_LEN {
        return Err(AccessError::Corrupt("boot password verifier too small".into()));
    }
    let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
    let key = derive_key(password);
    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|e| AccessError::Validation(format!("invalid boot key: {e}")))?;
    match cipher.decrypt(Nonce::from_slice(nonce), ciphertext) {
        Ok(plain) => Ok(plain == VERIFIER_PLAINTEXT),
        Err(_) => Ok(false),
    }
}

/// Checks the configured password at boot, installing a verifier on first
/// boot of a store that has none.
pub fn boot(raw: &dyn RawStore, password: Option<&str>) -> Result<(), AccessError> {
    let stored = raw.service_property(ENCRYPTED_BOOT_PASSWORD);
    match (password, stored) {
        (Some(password), Some(stored)) => {
            if !verify(password, &stored)? {
                return Err(AccessError::Validation("boot password does not match".into()));
            }
            Ok(())
        }
        (Some(password), None) => {
            if raw.is_read_only() {
                return Err(AccessError::ReadOnly);
            }
            raw.set_service_property(ENCRYPTED_BOOT_PASSWORD, Some(protect(password)?))?;
            info!("boot password verifier installed");
            Ok(())
        }
        (None, Some(_)) => Err(AccessError::Validation(
            "store is protected by a boot password".into(),
        )),
        (None, None) => Ok(()),
    }
}

/// Applies a change request of the form `"old,new"`.
pub fn change_boot_password(raw: &dyn RawStore, request: &str) -> Result<(), AccessError> {
    let Some(stored) = raw.service_property(ENCRYPTED_BOOT_PASSWORD) else {
        return Err(AccessError::Validation(
            "store was not created with a boot password".into(),
        ));
    };
    let request = Zeroizing::new(request.to_string());
    let Some((old, new)) = request.split_once(',') else {
        return Err(AccessError::Validation(
            "boot password change must be given as 'old,new'".into(),
        ));
    };
    let (old, new) = (old.trim(), new.trim());
    if new.is_empty() {
        return Err(AccessError::Validation("new boot password is empty".into()));
    }
    if !verify(old, &stored)? {
        return Err(AccessError::Validation("incorrect boot password".into()));
    }
    raw.set_service_property(ENCRYPTED_BOOT_PASSWORD, Some(protect(new)?))?;
    info!("boot password changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ENCRYPTED_BOOT_PASSWORD, boot, change_boot_password, protect, verify};
    use crate::error::AccessError;
    use crate::raw::RawStore;
    use crate::raw::memory::MemoryRawStore;
    use std::time::Duration;

    #[test]
    fn verifier_accepts_only_the_right_password() {
        let stored = protect("hunter2").expect("protect");
        assert!(verify("hunter2", &stored).expect("verify"));
        assert!(!verify("hunter3", &stored).expect("verify"));
        assert_ne!(stored, protect("hunter2").expect("fresh nonce"));
    }

    #[test]
    fn change_requires_the_old_password() {
        let store = MemoryRawStore::in_memory(Duration::from_millis(100));
        assert!(matches!(
            change_boot_password(&store, "a,b"),
            Err(AccessError::Validation(_))
        ));
        boot(&store, Some("first")).expect("install");
        assert!(matches!(
            change_boot_password(&store, "wrong,second"),
            Err(AccessError::Validation(_))
        ));
        assert!(matches!(
            change_boot_password(&store, "no separator"),
            Err(AccessError::Validation(_))
        ));
        change_boot_password(&store, "first,second").expect("change");
        let stored = store.service_property(ENCRYPTED_BOOT_PASSWORD).expect("stored");
        assert!(verify("second", &stored).expect("verify"));
        assert!(boot(&store, Some("first")).is_err());
        assert!(boot(&store, None).is_err());
    }
}
