//! Credentials & encryption context (C2).
//!
//! Persists `{token, accountSecret}` (plus, for `dataKey` accounts, a
//! stable per-device `machineKey`) and resolves the `(key, variant,
//! wrappedDataKey?)` triple each session/machine registration needs.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use happy_crypto::keypair::ContentKeyPair;
use happy_crypto::{sealed_box, AeadVariant};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone)]
pub enum CredentialEncryption {
    Legacy,
    DataKey { machine_key: [u8; 32] },
}

/// In-memory credentials, shared read-only across every client built from them.
#[derive(Clone)]
pub struct Credentials {
    pub token: String,
    pub account_secret: [u8; 32],
    pub encryption: CredentialEncryption,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"[REDACTED]")
            .field("account_secret", &"[REDACTED]")
            .field("variant", &self.variant())
            .finish()
    }
}

impl Credentials {
    pub fn variant(&self) -> AeadVariant {
        match self.encryption {
            CredentialEncryption::Legacy => AeadVariant::Legacy,
            CredentialEncryption::DataKey { .. } => AeadVariant::DataKey,
        }
    }

    /// The deterministic content keypair derived from the account secret.
    /// Never persisted; recomputed whenever needed.
    pub fn content_keypair(&self) -> Result<ContentKeyPair> {
        Ok(ContentKeyPair::derive(&self.account_secret)?)
    }

    /// Unwrap a `dataEncryptionKey` echoed back by the server (base64,
    /// version-prefixed sealed box) to recover the real per-session or
    /// per-machine key. `resolve_session_encryption`/`resolve_machine_encryption`
    /// always mint a fresh key for a brand-new registration; this is the
    /// counterpart used on hydration, when a record for a session or machine
    /// this process didn't itself just create shows up (e.g. from a list
    /// endpoint), so its existing ciphertext can actually be opened.
    pub fn unwrap_data_key(&self, wrapped_b64: &str) -> Result<[u8; 32]> {
        let keypair = self.content_keypair()?;
        let bundle = happy_crypto::encoding::decode_standard(wrapped_b64)?;
        Ok(sealed_box::open_versioned(keypair.secret(), &bundle)?)
    }

    /// Load credentials from `path`, created by [`Self::save`]. Errors if
    /// the file is missing, malformed, or (on Unix) not mode 0600.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| ClientError::Core(happy_core::Error::Credentials(format!(
                "could not read {}: {e}",
                path.display()
            ))))?;

        #[cfg(unix)]
        {
            let mode = fs::metadata(path)
                .map_err(|e| ClientError::Core(happy_core::Error::Io(e)))?
                .permissions()
                .mode()
                & 0o777;
            if mode != 0o600 {
                return Err(ClientError::Core(happy_core::Error::Credentials(format!(
                    "credentials file {} must be mode 0600, found {:o}",
                    path.display(),
                    mode
                ))));
            }
        }

        let file: CredentialsFile = serde_json::from_slice(&bytes)?;
        file.try_into()
    }

    /// Persist credentials to `path` (mode 0600), creating the parent
    /// directory (mode 0700) if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ClientError::Core(happy_core::Error::Io(e)))?;
            #[cfg(unix)]
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| ClientError::Core(happy_core::Error::Io(e)))?;
        }

        let file: CredentialsFile = self.into();
        let bytes = serde_json::to_vec_pretty(&file)?;
        fs::write(path, &bytes).map_err(|e| ClientError::Core(happy_core::Error::Io(e)))?;

        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| ClientError::Core(happy_core::Error::Io(e)))?;

        Ok(())
    }
}

/// On-disk shape. §6 names `{token, secret}` for `legacy` accounts; a
/// `dataKey` account additionally stores the stable per-device machine key
/// (the public key is never stored since it's a deterministic derivation —
/// see `Credentials::content_keypair`).
#[derive(Debug, Serialize, Deserialize)]
struct CredentialsFile {
    token: String,
    secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "machineKey")]
    machine_key: Option<String>,
}

impl TryFrom<CredentialsFile> for Credentials {
    type Error = ClientError;

    fn try_from(file: CredentialsFile) -> Result<Self> {
        let secret_bytes = happy_crypto::encoding::decode_standard(&file.secret)?;
        let account_secret: [u8; 32] = secret_bytes.as_slice().try_into().map_err(|_| {
            ClientError::Core(happy_core::Error::Credentials(
                "accountSecret must decode to exactly 32 bytes".into(),
            ))
        })?;

        let encryption = match file.variant.as_deref() {
            None | Some("legacy") => CredentialEncryption::Legacy,
            Some("dataKey") => {
                let raw = file.machine_key.ok_or_else(|| {
                    ClientError::Core(happy_core::Error::Credentials(
                        "dataKey credentials require machineKey".into(),
                    ))
                })?;
                let bytes = happy_crypto::encoding::decode_standard(&raw)?;
                let machine_key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    ClientError::Core(happy_core::Error::Credentials(
                        "machineKey must decode to exactly 32 bytes".into(),
                    ))
                })?;
                CredentialEncryption::DataKey { machine_key }
            }
            Some(other) => {
                return Err(ClientError::Core(happy_core::Error::Credentials(format!(
                    "unknown encryption variant {other}"
                ))))
            }
        };

        Ok(Credentials {
            token: file.token,
            account_secret,
            encryption,
        })
    }
}

impl From<&Credentials> for CredentialsFile {
    fn from(creds: &Credentials) -> Self {
        let (variant, machine_key) = match &creds.encryption {
            CredentialEncryption::Legacy => (None, None),
            CredentialEncryption::DataKey { machine_key } => (
                Some("dataKey".to_string()),
                Some(happy_crypto::encoding::encode_standard(machine_key)),
            ),
        };
        CredentialsFile {
            token: creds.token.clone(),
            secret: happy_crypto::encoding::encode_standard(&creds.account_secret),
            variant,
            machine_key,
        }
    }
}

/// Per-scope, per-operation encryption context. Immutable once created.
#[derive(Clone)]
pub struct EncryptionContext {
    pub key: [u8; 32],
    pub variant: AeadVariant,
    pub wrapped_data_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("variant", &self.variant)
            .field("key", &"[REDACTED]")
            .field("wrapped_data_key_present", &self.wrapped_data_key.is_some())
            .finish()
    }
}

/// `resolveSessionEncryption` — §4.2.
pub fn resolve_session_encryption(credentials: &Credentials) -> Result<EncryptionContext> {
    match credentials.encryption {
        CredentialEncryption::Legacy => Ok(EncryptionContext {
            key: credentials.account_secret,
            variant: AeadVariant::Legacy,
            wrapped_data_key: None,
        }),
        CredentialEncryption::DataKey { .. } => {
            let mut session_key = [0u8; 32];
            OsRng.fill_bytes(&mut session_key);
            let keypair = credentials.content_keypair()?;
            let wrapped = sealed_box::seal_versioned(&session_key, keypair.public_key())?;
            Ok(EncryptionContext {
                key: session_key,
                variant: AeadVariant::DataKey,
                wrapped_data_key: Some(wrapped),
            })
        }
    }
}

/// `resolveMachineEncryption` — §4.2.
pub fn resolve_machine_encryption(credentials: &Credentials) -> Result<EncryptionContext> {
    match credentials.encryption {
        CredentialEncryption::Legacy => Ok(EncryptionContext {
            key: credentials.account_secret,
            variant: AeadVariant::Legacy,
            wrapped_data_key: None,
        }),
        CredentialEncryption::DataKey { machine_key } => {
            let keypair = credentials.content_keypair()?;
            let wrapped = sealed_box::seal_versioned(&machine_key, keypair.public_key())?;
            Ok(EncryptionContext {
                key: machine_key,
                variant: AeadVariant::DataKey,
                wrapped_data_key: Some(wrapped),
            })
        }
    }
}
