//! Response signing
//!
//! Config responses are signed with Ed25519 in the signify format. Keys and
//! signatures carry the `Ed` algorithm tag and the 8-byte key number of the
//! signing key, so nodes that pin a signify public key verify replies as is.
//! Secret keys are read and written in signify's unencrypted layout
//! (`signify -G -n`).

use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer as DalekSigner, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use std::path::Path;
use tokio::fs;

const PKALG: &[u8; 2] = b"Ed";
const KDFALG: &[u8; 2] = b"BK";
const KEYNUM_LEN: usize = 8;
const SALT_LEN: usize = 16;
const CHECKSUM_LEN: usize = 8;

// pkalg | kdfalg | kdfrounds | salt | checksum | keynum | seckey
const SECRET_KEY_LEN: usize = 2 + 2 + 4 + SALT_LEN + CHECKSUM_LEN + KEYNUM_LEN + 64;
// pkalg | keynum | pubkey
const PUBLIC_KEY_LEN: usize = 2 + KEYNUM_LEN + 32;
// pkalg | keynum | sig
const SIGNATURE_LEN: usize = 2 + KEYNUM_LEN + Signature::BYTE_SIZE;

/// Produces the signature text appended to a config response
pub trait Signer: Send + Sync {
    fn sign(&self, data: &[u8]) -> Result<String>;
}

/// Ed25519 signing key with its signify key number
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    key_num: [u8; KEYNUM_LEN],
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut key_num = [0u8; KEYNUM_LEN];
        OsRng.fill_bytes(&mut key_num);
        Self {
            signing_key,
            key_num,
        }
    }

    pub fn from_seed(seed: &[u8; 32], key_num: [u8; KEYNUM_LEN]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
            key_num,
        }
    }

    /// Parse a signify secret key, either the whole key file or its base64 line
    pub fn from_signify(text: &str) -> Result<Self> {
        let raw = decode_signify(text, SECRET_KEY_LEN, "secret key")?;

        if raw[..2] != PKALG[..] || raw[2..4] != KDFALG[..] {
            return Err(Error::Crypto("Unsupported signify key algorithm".to_string()));
        }
        let rounds = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if rounds != 0 {
            return Err(Error::Crypto(
                "Passphrase protected signify keys are not supported, create the key with -n"
                    .to_string(),
            ));
        }

        let checksum_at = 8 + SALT_LEN;
        let key_num_at = checksum_at + CHECKSUM_LEN;
        let seckey_at = key_num_at + KEYNUM_LEN;

        let seckey = &raw[seckey_at..];
        if Sha512::digest(seckey)[..CHECKSUM_LEN] != raw[checksum_at..key_num_at] {
            return Err(Error::Crypto("Signify secret key checksum mismatch".to_string()));
        }

        let mut keypair_bytes = [0u8; 64];
        keypair_bytes.copy_from_slice(seckey);
        let mut key_num = [0u8; KEYNUM_LEN];
        key_num.copy_from_slice(&raw[key_num_at..seckey_at]);

        Ok(Self {
            signing_key: SigningKey::from_keypair_bytes(&keypair_bytes)?,
            key_num,
        })
    }

    /// Base64 line of the unencrypted signify secret key
    pub fn to_signify(&self) -> String {
        let seckey = self.signing_key.to_keypair_bytes();
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let mut raw = Vec::with_capacity(SECRET_KEY_LEN);
        raw.extend_from_slice(PKALG);
        raw.extend_from_slice(KDFALG);
        raw.extend_from_slice(&0u32.to_be_bytes());
        raw.extend_from_slice(&salt);
        raw.extend_from_slice(&Sha512::digest(seckey)[..CHECKSUM_LEN]);
        raw.extend_from_slice(&self.key_num);
        raw.extend_from_slice(&seckey);
        STANDARD.encode(raw)
    }

    /// Load a signify secret key file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref()).await?;
        Self::from_signify(&text)
            .map_err(|e| Error::Crypto(format!("{}: {}", path.as_ref().display(), e)))
    }

    /// Save as a signify secret key file
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = format!(
            "untrusted comment: meshconf secret key\n{}\n",
            self.to_signify()
        );
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn key_num(&self) -> [u8; KEYNUM_LEN] {
        self.key_num
    }

    pub fn public_key(&self) -> SignifyPublicKey {
        SignifyPublicKey {
            key: self.signing_key.verifying_key(),
            key_num: self.key_num,
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_num", &hex::encode(self.key_num))
            .field("public_key", &self.public_key().to_signify())
            .finish()
    }
}

impl Signer for KeyPair {
    fn sign(&self, data: &[u8]) -> Result<String> {
        let signature = self.signing_key.sign(data);

        let mut encoded = Vec::with_capacity(SIGNATURE_LEN);
        encoded.extend_from_slice(PKALG);
        encoded.extend_from_slice(&self.key_num);
        encoded.extend_from_slice(&signature.to_bytes());
        Ok(STANDARD.encode(encoded))
    }
}

/// Signify public key used to check signed replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignifyPublicKey {
    key: VerifyingKey,
    key_num: [u8; KEYNUM_LEN],
}

impl SignifyPublicKey {
    /// Parse a signify public key, either the whole `.pub` file or its base64 line
    pub fn from_signify(text: &str) -> Result<Self> {
        let raw = decode_signify(text, PUBLIC_KEY_LEN, "public key")?;
        if raw[..2] != PKALG[..] {
            return Err(Error::Crypto("Unsupported signify key algorithm".to_string()));
        }

        let mut key_num = [0u8; KEYNUM_LEN];
        key_num.copy_from_slice(&raw[2..2 + KEYNUM_LEN]);
        let mut key = [0u8; 32];
        key.copy_from_slice(&raw[2 + KEYNUM_LEN..]);

        Ok(Self {
            key: VerifyingKey::from_bytes(&key)?,
            key_num,
        })
    }

    pub fn to_signify(&self) -> String {
        let mut raw = Vec::with_capacity(PUBLIC_KEY_LEN);
        raw.extend_from_slice(PKALG);
        raw.extend_from_slice(&self.key_num);
        raw.extend_from_slice(self.key.as_bytes());
        STANDARD.encode(raw)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref()).await?;
        Self::from_signify(&text)
            .map_err(|e| Error::Crypto(format!("{}: {}", path.as_ref().display(), e)))
    }

    /// Save as a signify `.pub` file
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = format!(
            "untrusted comment: meshconf public key\n{}\n",
            self.to_signify()
        );
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn key_num(&self) -> [u8; KEYNUM_LEN] {
        self.key_num
    }

    /// Check signature text produced by [`KeyPair::sign`]
    pub fn verify(&self, data: &[u8], signature: &str) -> Result<()> {
        let raw = STANDARD.decode(signature.trim())?;
        if raw.len() != SIGNATURE_LEN || raw[..2] != PKALG[..] {
            return Err(Error::Crypto("Invalid signature encoding".to_string()));
        }
        if raw[2..2 + KEYNUM_LEN] != self.key_num {
            return Err(Error::Crypto(format!(
                "Signature made with key {}, expected {}",
                hex::encode(&raw[2..2 + KEYNUM_LEN]),
                hex::encode(self.key_num)
            )));
        }

        let sig = Signature::from_slice(&raw[2 + KEYNUM_LEN..])?;
        self.key.verify(data, &sig)?;
        Ok(())
    }

    /// Check a `<body>\n<signature>` reply, returning the signed body.
    ///
    /// The body keeps its trailing newline, which is part of the signed data.
    pub fn verify_reply<'a>(&self, reply: &'a str) -> Result<&'a str> {
        let reply = reply.trim_end();
        let sep = reply
            .rfind('\n')
            .ok_or_else(|| Error::Crypto("Reply has no signature line".to_string()))?;
        let (body, signature) = reply.split_at(sep + 1);
        self.verify(body.as_bytes(), signature)?;
        Ok(body)
    }
}

/// First line of a signify file that decodes to `len` bytes
fn decode_signify(text: &str, len: usize, what: &str) -> Result<Vec<u8>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("untrusted comment:"))
        .find_map(|line| STANDARD.decode(line).ok())
        .filter(|raw| raw.len() == len)
        .ok_or_else(|| Error::Crypto(format!("No signify {what} found")))
}
