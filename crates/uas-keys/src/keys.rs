use anyhow::{Context, Result};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

use uas_proto::{SigningKey, PASSKEY_LEN};

/// Random bytes per generated passkey; hex doubles it to 24 ASCII chars,
/// which fits the 25-byte passkey field.
const GENERATED_BYTES: usize = 12;

#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    pub key_path: String,
}

/// Shared secret checked by the control handshake. Comparison goes through
/// blake3 digests so it runs in constant time.
#[derive(Clone)]
pub struct SharedKey {
    secret: Zeroizing<Vec<u8>>,
    digest: blake3::Hash,
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(<redacted>)")
    }
}

impl SharedKey {
    pub fn new(passkey: &str) -> Result<Self> {
        let bytes = passkey.as_bytes();
        anyhow::ensure!(!bytes.is_empty(), "passkey is empty");
        anyhow::ensure!(bytes.len() <= PASSKEY_LEN, "passkey longer than {} bytes", PASSKEY_LEN);
        anyhow::ensure!(
            bytes.iter().all(|b| b.is_ascii_graphic()),
            "passkey must be printable ASCII without spaces"
        );
        Ok(Self {
            secret: Zeroizing::new(bytes.to_vec()),
            digest: blake3::hash(bytes),
        })
    }

    /// NUL-padded wire form for CHANGE_OPERATOR_CONTROL.passkey.
    pub fn passkey(&self) -> [u8; PASSKEY_LEN] {
        let mut out = [0u8; PASSKEY_LEN];
        out[..self.secret.len()].copy_from_slice(&self.secret);
        out
    }

    /// Checks a received passkey field; trailing NUL padding is ignored.
    pub fn matches(&self, wire: &[u8]) -> bool {
        let end = wire.iter().rposition(|b| *b != 0).map(|i| i + 1).unwrap_or(0);
        blake3::hash(&wire[..end]) == self.digest
    }

    /// Link signing secret: SHA-256 of the passkey, the way MAVLink ground
    /// stations turn a passphrase into a signing key.
    pub fn signing_key(&self) -> SigningKey {
        let digest = Sha256::digest(&self.secret[..]);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        SigningKey::from_bytes(key)
    }

    pub fn init(cfg: &KeyConfig) -> Result<()> {
        let path = Path::new(&cfg.key_path);
        if let Some(p) = path.parent() {
            fs::create_dir_all(p)?;
        }
        anyhow::ensure!(!path.exists(), "key already exists");
        write_key_file(path, &generate())?;
        Ok(())
    }

    pub fn rotate(cfg: &KeyConfig) -> Result<()> {
        // write next to the old key, then replace atomically
        let path = Path::new(&cfg.key_path);
        anyhow::ensure!(path.exists(), "key does not exist");
        let tmp = path.with_extension("new");
        write_key_file(&tmp, &generate())?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    pub fn load(cfg: &KeyConfig) -> Result<SharedKey> {
        let raw = Zeroizing::new(fs::read_to_string(&cfg.key_path).context("read key file")?);
        let line = raw.lines().next().unwrap_or("").trim();
        SharedKey::new(line).with_context(|| format!("bad key file {}", cfg.key_path))
    }
}

fn generate() -> Zeroizing<String> {
    let mut bytes = Zeroizing::new([0u8; GENERATED_BYTES]);
    rand::thread_rng().fill_bytes(&mut bytes[..]);
    Zeroizing::new(hex::encode(&bytes[..]))
}

fn write_key_file(path: &Path, passkey: &str) -> Result<()> {
    fs::write(path, format!("{}\n", passkey)).with_context(|| format!("write key file {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
