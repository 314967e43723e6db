//! Credential vault
//!
//! Account passwords are sealed with age passphrase encryption (scrypt key
//! derivation, ChaCha20-Poly1305). The scrypt salt and work factor live in
//! the age header, so a sealed blob is self-describing apart from the
//! algorithm tag stored next to it.
//!
//! The master key is supplied by the user for each process (environment or
//! prompt) and is never persisted.

use std::fmt;
use std::io::{Read, Write};

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use sqlx::Row;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::db::Database;
use crate::error::{DbError, Result, VaultError};

pub const ALGORITHM: &str = "age-scrypt";
pub const MASTER_KEY_ENV: &str = "CADENCE_MASTER_KEY";

const MIN_KEY_LEN: usize = 8;

/// User-supplied secret protecting stored credentials.
pub struct MasterKey(SecretString);

impl MasterKey {
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key: String = key.into();
        if key.chars().count() < MIN_KEY_LEN {
            return Err(VaultError::WeakKey.into());
        }
        Ok(Self(SecretString::from(key)))
    }

    /// Read the key from `CADENCE_MASTER_KEY`, if set.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(MASTER_KEY_ENV) {
            Ok(value) if !value.is_empty() => Self::new(value).map(Some),
            _ => Ok(None),
        }
    }

    fn passphrase(&self) -> age::secrecy::Secret<String> {
        age::secrecy::Secret::new(self.0.expose_secret().to_string())
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Encrypted credential plus the algorithm that sealed it.
#[derive(Clone)]
pub struct SealedCredential {
    pub algorithm: String,
    pub blob: Vec<u8>,
}

impl fmt::Debug for SealedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedCredential")
            .field("algorithm", &self.algorithm)
            .field("blob", &format_args!("<{} bytes>", self.blob.len()))
            .finish()
    }
}

pub fn encrypt(plaintext: &str, key: &MasterKey) -> Result<SealedCredential> {
    let encryptor = age::Encryptor::with_user_passphrase(key.passphrase());

    let mut encrypted = vec![];
    let mut writer = encryptor
        .wrap_output(&mut encrypted)
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

    writer
        .write_all(plaintext.as_bytes())
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

    writer
        .finish()
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

    Ok(SealedCredential {
        algorithm: ALGORITHM.to_string(),
        blob: encrypted,
    })
}

/// Decrypt a sealed credential. A wrong key is reported as
/// [`VaultError::DecryptionFailed`], never as garbage plaintext.
pub fn decrypt(sealed: &SealedCredential, key: &MasterKey) -> Result<Zeroizing<String>> {
    if sealed.algorithm != ALGORITHM {
        return Err(VaultError::UnsupportedAlgorithm(sealed.algorithm.clone()).into());
    }

    let decryptor = match age::Decryptor::new(&sealed.blob[..]) {
        Ok(age::Decryptor::Passphrase(d)) => d,
        Ok(_) => {
            return Err(VaultError::Encryption(
                "Invalid encryption format (expected passphrase)".to_string(),
            )
            .into())
        }
        Err(e) => return Err(VaultError::Encryption(e.to_string()).into()),
    };

    let mut reader = decryptor.decrypt(&key.passphrase(), None).map_err(|e| {
        if matches!(
            e,
            age::DecryptError::DecryptionFailed
                | age::DecryptError::KeyDecryptionFailed
                | age::DecryptError::InvalidMac
                | age::DecryptError::NoMatchingKeys
        ) {
            VaultError::DecryptionFailed
        } else {
            VaultError::Encryption(e.to_string())
        }
    })?;

    let mut decrypted = Zeroizing::new(Vec::new());
    reader
        .read_to_end(&mut decrypted)
        .map_err(|_| VaultError::DecryptionFailed)?;

    let plaintext = String::from_utf8(std::mem::take(&mut *decrypted))
        .map_err(|e| VaultError::Encryption(format!("Invalid UTF-8: {}", e)))?;
    Ok(Zeroizing::new(plaintext))
}

/// Persistence of sealed credentials in the `credentials` table.
#[derive(Clone)]
pub struct CredentialStore {
    db: Database,
}

impl CredentialStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a sealed credential under a fresh reference.
    pub async fn insert(&self, sealed: &SealedCredential) -> Result<String> {
        let credential_ref = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO credentials (ref, algorithm, blob, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&credential_ref)
        .bind(&sealed.algorithm)
        .bind(&sealed.blob)
        .bind(Utc::now().timestamp_millis())
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(credential_ref)
    }

    pub async fn load(&self, credential_ref: &str) -> Result<Option<SealedCredential>> {
        let row = sqlx::query("SELECT algorithm, blob FROM credentials WHERE ref = ?")
            .bind(credential_ref)
            .fetch_optional(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        row.map(|r| {
            Ok(SealedCredential {
                algorithm: r.try_get("algorithm").map_err(DbError::SqlxError)?,
                blob: r.try_get("blob").map_err(DbError::SqlxError)?,
            })
        })
        .transpose()
    }

    pub async fn delete(&self, credential_ref: &str) -> Result<()> {
        sqlx::query("DELETE FROM credentials WHERE ref = ?")
            .bind(credential_ref)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Seal `password` and attach it to the account, replacing (and deleting)
    /// any previous credential.
    pub async fn replace_for_account(
        &self,
        account_id: i64,
        password: &str,
        key: &MasterKey,
    ) -> Result<String> {
        let account = self
            .db
            .get_account(account_id)
            .await?
            .ok_or_else(|| crate::CadenceError::NotFound(format!("account {}", account_id)))?;

        let sealed = encrypt(password, key)?;
        let credential_ref = self.insert(&sealed).await?;
        self.db
            .set_credential_ref(account_id, Some(&credential_ref))
            .await?;

        if let Some(old) = account.credential_ref {
            self.delete(&old).await?;
        }

        tracing::info!(account_id, "credential replaced");
        Ok(credential_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewAccount, Platform};
    use crate::CadenceError;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip() {
        let key = MasterKey::new("correct horse battery").unwrap();
        let sealed = encrypt("hunter2-but-longer", &key).unwrap();

        assert_eq!(sealed.algorithm, ALGORITHM);
        assert!(!sealed.blob.is_empty());

        let plaintext = decrypt(&sealed, &key).unwrap();
        assert_eq!(plaintext.as_str(), "hunter2-but-longer");
    }

    #[test]
    fn test_wrong_key_is_classified() {
        let key = MasterKey::new("correct horse battery").unwrap();
        let wrong = MasterKey::new("incorrect horse battery").unwrap();
        let sealed = encrypt("secret", &key).unwrap();

        let result = decrypt(&sealed, &wrong);
        assert!(matches!(
            result,
            Err(CadenceError::Vault(VaultError::DecryptionFailed))
        ));
    }

    #[test]
    fn test_weak_key_rejected() {
        assert!(matches!(
            MasterKey::new("short"),
            Err(CadenceError::Vault(VaultError::WeakKey))
        ));
        assert!(MasterKey::new("eight ch").is_ok());
    }

    #[test]
    fn test_garbage_blob_rejected() {
        let key = MasterKey::new("correct horse battery").unwrap();
        let sealed = SealedCredential {
            algorithm: ALGORITHM.to_string(),
            blob: b"definitely not an age file".to_vec(),
        };
        assert!(decrypt(&sealed, &key).is_err());
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let key = MasterKey::new("correct horse battery").unwrap();
        let sealed = SealedCredential {
            algorithm: "rot13".to_string(),
            blob: vec![1, 2, 3],
        };
        assert!(matches!(
            decrypt(&sealed, &key),
            Err(CadenceError::Vault(VaultError::UnsupportedAlgorithm(_)))
        ));
    }

    #[test]
    fn test_debug_output_is_redacted() {
        let key = MasterKey::new("correct horse battery").unwrap();
        assert!(!format!("{:?}", key).contains("horse"));

        let sealed = SealedCredential {
            algorithm: ALGORITHM.to_string(),
            blob: vec![0xAB; 16],
        };
        let debug = format!("{:?}", sealed);
        assert!(debug.contains("<16 bytes>"));
        assert!(!debug.contains("171"));
    }

    #[tokio::test]
    async fn test_replace_for_account_deletes_previous() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(temp_dir.path().join("vault.db").to_str().unwrap())
            .await
            .unwrap();
        let account = db
            .create_account(&NewAccount {
                platform: Platform::LinkedIn,
                label: "work".to_string(),
                username: "me@example.com".to_string(),
            })
            .await
            .unwrap();

        let store = CredentialStore::new(db.clone());
        let key = MasterKey::new("correct horse battery").unwrap();

        let first = store
            .replace_for_account(account.id, "first-password", &key)
            .await
            .unwrap();
        let second = store
            .replace_for_account(account.id, "second-password", &key)
            .await
            .unwrap();

        assert!(store.load(&first).await.unwrap().is_none());
        let sealed = store.load(&second).await.unwrap().unwrap();
        assert_eq!(decrypt(&sealed, &key).unwrap().as_str(), "second-password");

        let account = db.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(account.credential_ref.as_deref(), Some(second.as_str()));
    }
}
