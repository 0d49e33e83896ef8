//! Key derivation: Argon2id passphrase → lock key material

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::{KEYMAT_LEN, SALT_LEN};

/// 512 bits of passphrase-derived material.
///
/// Seeds the ARC4 stream that locates and keys the lock copies.
/// Zeroized on drop.
#[derive(Clone)]
pub struct KeyMaterial {
    bytes: [u8; KEYMAT_LEN],
}

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEYMAT_LEN]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEYMAT_LEN] {
        &self.bytes
    }

    /// Seed bytes for lock slot `index`: the material followed by the slot number.
    pub fn slot_seed(&self, index: usize) -> [u8; KEYMAT_LEN + 1] {
        let mut seed = [0u8; KEYMAT_LEN + 1];
        seed[..KEYMAT_LEN].copy_from_slice(&self.bytes);
        seed[KEYMAT_LEN] = index as u8;
        seed
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters for KDF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Derive key material from a passphrase and the key-location table salt.
///
/// The salt is stored in cleartext next to the obfuscated lock slots; it
/// does not need to be secret.
pub fn derive_keymat(
    passphrase: &SecretString,
    salt: &[u8; SALT_LEN],
    params: &KdfParams,
) -> anyhow::Result<KeyMaterial> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEYMAT_LEN),
    )
    .map_err(|e| anyhow::anyhow!("invalid Argon2id params: {e}"))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);
    tracing::debug!(
        mem_cost_kib = params.mem_cost_kib,
        time_cost = params.time_cost,
        "deriving lock key material"
    );

    let mut key = [0u8; KEYMAT_LEN];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| anyhow::anyhow!("Argon2id KDF failed: {e}"))?;

    let material = KeyMaterial::from_bytes(key);
    key.zeroize();
    Ok(material)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_kdf_deterministic() {
        let passphrase = SecretString::from("pw1");
        let salt = [1u8; SALT_LEN];

        let m1 = derive_keymat(&passphrase, &salt, &fast_params()).unwrap();
        let m2 = derive_keymat(&passphrase, &salt, &fast_params()).unwrap();

        assert_eq!(m1.as_bytes(), m2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_passphrases() {
        let salt = [1u8; SALT_LEN];
        let m1 = derive_keymat(&SecretString::from("pw1"), &salt, &fast_params()).unwrap();
        let m2 = derive_keymat(&SecretString::from("pw2"), &salt, &fast_params()).unwrap();

        assert_ne!(m1.as_bytes(), m2.as_bytes());
    }

    #[test]
    fn test_kdf_different_salts() {
        let passphrase = SecretString::from("same");
        let m1 = derive_keymat(&passphrase, &[1u8; SALT_LEN], &fast_params()).unwrap();
        let m2 = derive_keymat(&passphrase, &[2u8; SALT_LEN], &fast_params()).unwrap();

        assert_ne!(m1.as_bytes(), m2.as_bytes());
    }

    #[test]
    fn test_slot_seed_appends_index() {
        let m = KeyMaterial::from_bytes([7u8; KEYMAT_LEN]);
        let s0 = m.slot_seed(0);
        let s3 = m.slot_seed(3);
        assert_eq!(&s0[..KEYMAT_LEN], m.as_bytes());
        assert_eq!(s0[KEYMAT_LEN], 0);
        assert_eq!(s3[KEYMAT_LEN], 3);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = KdfParams {
            mem_cost_kib: 1,
            time_cost: 0,
            parallelism: 0,
        };
        let result = derive_keymat(&SecretString::from("x"), &[0u8; SALT_LEN], &params);
        assert!(result.is_err());
    }
}
