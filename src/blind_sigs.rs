//! BLS blind signatures on coin serials.
//!
//! The client writes a random serial on a [`Slip`], seals it into an
//! [`Envelope`] with a blinding factor, and the mint signs the envelope
//! without seeing the serial. Removing the blinding factor leaves a plain
//! BLS signature on the serial: the [`Coin`].

use crate::error::{CashError, Result};
use crate::scheme::{BlindingScheme, Candidate};
use crate::utils::*;
use blsttc::pairing::bls12_381::{Fr, G2};
use blsttc::{PublicKey, SecretKey, Signature};
use rand::RngCore;
use std::convert::TryFrom;
use std::convert::TryInto;
use std::fmt;
use tracing::debug;

pub const BLS_DISCRIMINANT: &str = "SIGNED BLS CASH TOKEN";
pub const GENERIC_DISCRIMINANT: &str = "SIGNED CASH TOKEN";

const SERIAL_SIZE: usize = 32;
const ENVELOPE_SIZE: usize = 96;
const SIG_SIZE: usize = 96;
const PK_SIZE: usize = 48;

/// The coin serial written on a paper Slip.
pub type Slip = [u8; SERIAL_SIZE];

/// Represents the client that creates the Slip and later
/// removes the blinding from the mint's signature.
///
/// Serialized as `serial || blinding factor`, which is the private
/// prototoken kept by the client.
#[derive(Clone)]
pub struct SlipPreparer {
    slip: Slip,
    blinding_bytes: [u8; 32],
    blinding_factor: Fr,
}

impl SlipPreparer {
    pub fn new() -> Result<Self> {
        let mut slip = [0u8; SERIAL_SIZE];
        rand::thread_rng().fill_bytes(&mut slip);
        Self::from_parts(slip, SecretKey::random().to_bytes())
    }

    fn from_parts(slip: Slip, blinding_bytes: [u8; 32]) -> Result<Self> {
        Ok(Self {
            slip,
            blinding_bytes,
            blinding_factor: fr_from_be_bytes(blinding_bytes)?,
        })
    }

    pub fn slip(&self) -> &Slip {
        &self.slip
    }

    pub fn blinding_factor(&self) -> Fr {
        self.blinding_factor
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SERIAL_SIZE + 32);
        out.extend_from_slice(&self.slip);
        out.extend_from_slice(&self.blinding_bytes);
        out
    }

    pub fn place_slip_in_envelope(&self) -> Result<Envelope> {
        let msg_g2 = hash_g2_with_dst(&self.slip)?;
        Ok(Envelope::from(blind(msg_g2, self.blinding_factor)))
    }
}

impl TryFrom<&[u8]> for SlipPreparer {
    type Error = CashError;

    fn try_from(b: &[u8]) -> Result<Self> {
        if b.len() != SERIAL_SIZE + 32 {
            return Err(CashError::MalformedInput(format!(
                "private prototoken is {} bytes, expected {}",
                b.len(),
                SERIAL_SIZE + 32
            )));
        }
        Self::from_parts(b[..SERIAL_SIZE].try_into()?, b[SERIAL_SIZE..].try_into()?)
    }
}

impl fmt::Debug for SlipPreparer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SlipPreparer(..)")
    }
}

/// An Envelope holds a Slip inside without
/// revealing the Slip's contents.
#[derive(Clone, Debug)]
pub struct Envelope {
    blinded_msg: G2,
}

impl Envelope {
    pub fn blinded_msg(&self) -> G2 {
        self.blinded_msg
    }

    pub fn to_bytes(&self) -> [u8; ENVELOPE_SIZE] {
        g2_to_be_bytes(self.blinded_msg)
    }
}

impl From<G2> for Envelope {
    fn from(blinded_msg: G2) -> Self {
        Self { blinded_msg }
    }
}

impl TryFrom<&[u8]> for Envelope {
    type Error = CashError;

    fn try_from(b: &[u8]) -> Result<Self> {
        let bytes: [u8; ENVELOPE_SIZE] = b.try_into()?;
        Ok(Self::from(be_bytes_to_g2(bytes)?))
    }
}

/// An Envelope which has a signature written
/// on it by the BlindSigner party.
///
/// The envelope is lined with carbon paper, such that a signature
/// on the envelope also signs the Slip inside, even though the
/// BlindSigner party has never seen the Slip.
pub struct SignedEnvelope {
    pub envelope: Envelope,
    signature: Signature,
}

impl SignedEnvelope {
    pub fn new(envelope: Envelope, signature: Signature) -> Self {
        Self {
            envelope,
            signature,
        }
    }

    pub fn signature_for_envelope(&self) -> &Signature {
        &self.signature
    }

    pub fn signature_for_slip(&self, blinding_factor: Fr) -> Result<Signature> {
        let blinded_sig_g2 = be_bytes_to_g2(self.signature.to_bytes())?;
        let unblinded_sig_g2 = unblind(blinded_sig_g2, blinding_factor)?;
        Ok(Signature::from_bytes(g2_to_be_bytes(unblinded_sig_g2))?)
    }

    /// True if the signature is over this envelope under `pk`.
    pub fn verify(&self, pk: &PublicKey) -> bool {
        pk.verify_g2(&self.signature, self.envelope.blinded_msg())
    }
}

/// Represents the mint key for one denomination, which signs the
/// Envelope without seeing the Slip inside.
pub struct BlindSigner {
    sk: SecretKey,
}

impl BlindSigner {
    pub fn new() -> Self {
        Self {
            sk: SecretKey::random(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.sk.public_key()
    }

    fn sk_bendian(&self) -> Result<Fr> {
        fr_from_be_bytes(self.sk.to_bytes())
    }

    pub fn sign_envelope(&self, e: Envelope) -> Result<SignedEnvelope> {
        // Note we are signing a G2, not message bytes, so we can't
        // use blsttc:SecretKey.sign(msg);
        let bs_sig_g2 = sign_g2(e.blinded_msg(), self.sk_bendian()?);
        let signature = Signature::from_bytes(g2_to_be_bytes(bs_sig_g2))?;
        debug!("signed blinded envelope");

        Ok(SignedEnvelope::new(e, signature))
    }
}

impl Default for BlindSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<[u8; 32]> for BlindSigner {
    type Error = CashError;

    fn try_from(b: [u8; 32]) -> Result<Self> {
        Ok(Self {
            sk: SecretKey::from_bytes(b)?,
        })
    }
}

impl From<SecretKey> for BlindSigner {
    fn from(sk: SecretKey) -> Self {
        Self { sk }
    }
}

/// An unblinded, spendable coin: the serial and the mint's
/// signature on it.
#[derive(Clone, Debug)]
pub struct Coin {
    pub serial: Slip,
    pub signature: Signature,
}

impl Coin {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SERIAL_SIZE + SIG_SIZE);
        out.extend_from_slice(&self.serial);
        out.extend_from_slice(&self.signature.to_bytes());
        out
    }

    pub fn verify(&self, pk: &PublicKey) -> bool {
        verify_signature_on_serial(&self.serial, &self.signature, pk)
    }
}

impl TryFrom<&[u8]> for Coin {
    type Error = CashError;

    fn try_from(b: &[u8]) -> Result<Self> {
        if b.len() != SERIAL_SIZE + SIG_SIZE {
            return Err(CashError::MalformedInput(format!(
                "coin is {} bytes, expected {}",
                b.len(),
                SERIAL_SIZE + SIG_SIZE
            )));
        }
        let sig_bytes: [u8; SIG_SIZE] = b[SERIAL_SIZE..].try_into()?;
        Ok(Self {
            serial: b[..SERIAL_SIZE].try_into()?,
            signature: Signature::from_bytes(sig_bytes)?,
        })
    }
}

pub(crate) fn public_key_from_bytes(b: &[u8]) -> Result<PublicKey> {
    let bytes: [u8; PK_SIZE] = b.try_into()?;
    Ok(PublicKey::from_bytes(bytes)?)
}

/// BLS12-381 blinding, one G2 point per candidate.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlsScheme;

impl BlindingScheme for BlsScheme {
    fn discriminant(&self) -> &'static str {
        BLS_DISCRIMINANT
    }

    fn aliases(&self) -> &'static [&'static str] {
        &[GENERIC_DISCRIMINANT]
    }

    fn generate_candidate(&self) -> Result<Candidate> {
        let preparer = SlipPreparer::new()?;
        let envelope = preparer.place_slip_in_envelope()?;
        Ok(Candidate {
            public: envelope.to_bytes().to_vec(),
            private: preparer.to_bytes(),
        })
    }

    fn unblind(&self, signature: &[u8], private_prototoken: &[u8]) -> Result<Vec<u8>> {
        let preparer = SlipPreparer::try_from(private_prototoken)?;
        let sig_bytes: [u8; SIG_SIZE] = signature.try_into()?;
        let signed = SignedEnvelope::new(
            preparer.place_slip_in_envelope()?,
            Signature::from_bytes(sig_bytes)?,
        );
        let coin = Coin {
            serial: *preparer.slip(),
            signature: signed.signature_for_slip(preparer.blinding_factor())?,
        };
        Ok(coin.to_bytes())
    }

    fn verify(&self, cleartext: &[u8], public_key: &[u8]) -> Result<bool> {
        let coin = Coin::try_from(cleartext)?;
        Ok(coin.verify(&public_key_from_bytes(public_key)?))
    }
}
