//! Token owners.
//!
//! A spendable token's payload is sealed either to an identity (a [`Nym`]
//! holding an x25519 keypair) or to a passphrase-derived [`SymmetricKey`].
//! [`Owner`] puts both behind the same seal / open capability.
//!
//! Envelope formats:
//!
//! ```text
//! nym: [1][ephemeral public key 32][nonce 12][ciphertext + tag]
//! key: [2][nonce 12][ciphertext + tag]
//! ```

use crate::error::{CashError, Result};
use crate::identifier::Identifier;
use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::convert::TryInto;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

const NYM_ENVELOPE: u8 = 1;
const KEY_ENVELOPE: u8 = 2;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const SALT_SIZE: usize = 16;
const NYM_ENVELOPE_INFO: &[u8] = b"blindcash nym envelope";

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut b = [0u8; N];
    rand::thread_rng().fill_bytes(&mut b);
    b
}

fn aead_seal(key: &[u8; 32], plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>)> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CashError::CryptoFailure(e.to_string()))?;
    let nonce: [u8; NONCE_SIZE] = random_bytes();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CashError::CryptoFailure("seal failed".into()))?;
    Ok((nonce, ciphertext))
}

fn aead_open(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CashError::CryptoFailure(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CashError::CryptoFailure("envelope authentication failed".into()))
}

/// An identity that tokens can be sealed to.
///
/// A public-only nym can seal but not open.
#[derive(Clone)]
pub struct Nym {
    public: X25519Public,
    secret: Option<StaticSecret>,
    id: Identifier,
}

impl Nym {
    pub fn generate() -> Self {
        Self::from_secret_bytes(random_bytes())
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519Public::from(&secret);
        Self {
            public,
            secret: Some(secret),
            id: Identifier::digest(public.as_bytes()),
        }
    }

    pub fn from_public_bytes(bytes: [u8; 32]) -> Self {
        let public = X25519Public::from(bytes);
        Self {
            public,
            secret: None,
            id: Identifier::digest(public.as_bytes()),
        }
    }

    /// The same identity without its private half.
    pub fn public_only(&self) -> Self {
        Self::from_public_bytes(*self.public.as_bytes())
    }

    pub fn id(&self) -> Identifier {
        self.id
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub fn has_private(&self) -> bool {
        self.secret.is_some()
    }

    fn envelope_key(shared: &[u8; 32], ephemeral: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
        let hk = Hkdf::<Sha256>::new(Some(&ephemeral[..]), &shared[..]);
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(NYM_ENVELOPE_INFO, &mut key[..])
            .map_err(|e| CashError::CryptoFailure(e.to_string()))?;
        Ok(key)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ephemeral = StaticSecret::from(random_bytes::<32>());
        let ephemeral_public = X25519Public::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&self.public);
        let key = Self::envelope_key(shared.as_bytes(), ephemeral_public.as_bytes())?;

        let (nonce, ciphertext) = aead_seal(&key, plaintext)?;
        let mut out = Vec::with_capacity(1 + 32 + NONCE_SIZE + ciphertext.len());
        out.push(NYM_ENVELOPE);
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        let secret = self.secret.as_ref().ok_or_else(|| {
            CashError::CryptoFailure(format!("nym {} has no private key", self.id))
        })?;
        if envelope.len() < 1 + 32 + NONCE_SIZE + TAG_SIZE || envelope[0] != NYM_ENVELOPE {
            return Err(CashError::CryptoFailure("not a nym envelope".into()));
        }
        let ephemeral: [u8; 32] = envelope[1..33].try_into()?;
        let shared = secret.diffie_hellman(&X25519Public::from(ephemeral));
        let key = Self::envelope_key(shared.as_bytes(), &ephemeral)?;
        aead_open(&key, &envelope[33..33 + NONCE_SIZE], &envelope[33 + NONCE_SIZE..])
    }
}

impl fmt::Debug for Nym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nym")
            .field("id", &self.id)
            .field("private", &self.has_private())
            .finish()
    }
}

/// A key derived from a passphrase with Argon2id.
#[derive(Clone)]
pub struct SymmetricKey {
    salt: [u8; SALT_SIZE],
    key: Zeroizing<[u8; 32]>,
    id: Identifier,
}

impl SymmetricKey {
    /// Derive a fresh key under a random salt.
    pub fn generate(passphrase: &[u8]) -> Result<Self> {
        Self::derive(passphrase, random_bytes())
    }

    /// Re-derive a key from its passphrase and salt.
    pub fn derive(passphrase: &[u8], salt: [u8; SALT_SIZE]) -> Result<Self> {
        let mut key = Zeroizing::new([0u8; 32]);
        Argon2::default()
            .hash_password_into(passphrase, &salt, &mut key[..])
            .map_err(|e| CashError::CryptoFailure(format!("passphrase derivation: {}", e)))?;

        let mut check = Vec::with_capacity(SALT_SIZE + 32);
        check.extend_from_slice(&salt);
        check.extend_from_slice(Identifier::digest(&key[..]).as_bytes());

        Ok(Self {
            salt,
            key,
            id: Identifier::digest(&check),
        })
    }

    pub fn salt(&self) -> [u8; SALT_SIZE] {
        self.salt
    }

    pub fn id(&self) -> Identifier {
        self.id
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (nonce, ciphertext) = aead_seal(&self.key, plaintext)?;
        let mut out = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        out.push(KEY_ENVELOPE);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        if envelope.len() < 1 + NONCE_SIZE + TAG_SIZE || envelope[0] != KEY_ENVELOPE {
            return Err(CashError::CryptoFailure("not a symmetric envelope".into()));
        }
        aead_open(&self.key, &envelope[1..1 + NONCE_SIZE], &envelope[1 + NONCE_SIZE..])
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey").field("id", &self.id).finish()
    }
}

/// Either a person or a shared secret.
#[derive(Clone, Debug)]
pub enum Owner {
    Nym(Nym),
    Key(SymmetricKey),
}

impl Owner {
    pub fn id(&self) -> Identifier {
        match self {
            Self::Nym(nym) => nym.id(),
            Self::Key(key) => key.id(),
        }
    }

    pub fn is_password(&self) -> bool {
        matches!(self, Self::Key(_))
    }

    pub fn same_identity_as(&self, other: &Owner) -> bool {
        self.is_password() == other.is_password() && self.id() == other.id()
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Nym(nym) => nym.seal(plaintext),
            Self::Key(key) => key.seal(plaintext),
        }
    }

    pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Nym(nym) => nym.open(envelope),
            Self::Key(key) => key.open(envelope),
        }
    }
}

impl From<Nym> for Owner {
    fn from(nym: Nym) -> Self {
        Self::Nym(nym)
    }
}

impl From<SymmetricKey> for Owner {
    fn from(key: SymmetricKey) -> Self {
        Self::Key(key)
    }
}
