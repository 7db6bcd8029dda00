use crate::blind_sigs::{BlsScheme, Envelope};
use crate::config::IssuancePolicy;
use crate::error::{CashError, Result};
use crate::mint::{candidate_at, choose_index, Mint, MintParameters};
use crate::scheme::BlindingScheme;
use crate::utils::*;
use blsttc::pairing::bls12_381::Fr;
use blsttc::{PublicKeySet, SecretKeySet, SecretKeyShare, SignatureShare};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Represents a single signature on an Envelope
/// that requires muliple signatures by multiple
/// BlindSigner parties.
///
/// These signature shares must be combined together
/// to form a complete Signature on the Envelope
/// as well as on the Slip inside.
pub struct SignedEnvelopeShare {
    pub envelope: Envelope,
    index: usize,
    sig_share: SignatureShare,
}

impl SignedEnvelopeShare {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn signature_share_for_envelope(&self) -> &SignatureShare {
        &self.sig_share
    }
}

/// Represents a single party that signs the Envelope
/// without seeing the Slip inside.
///
/// A threshold mint needs more than `threshold` of these
/// to produce an authoritative signature.
pub struct BlindSignerShare {
    index: usize,
    sks: SecretKeyShare,
}

impl BlindSignerShare {
    pub fn new(index: usize, sks: SecretKeyShare) -> Self {
        Self { index, sks }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn sks_bendian(&self) -> Result<Fr> {
        fr_from_be_bytes(self.sks.to_bytes())
    }

    pub fn sign_envelope(&self, e: Envelope) -> Result<SignedEnvelopeShare> {
        // signing a G2, not message bytes
        let bs_sig_g2 = sign_g2(e.blinded_msg(), self.sks_bendian()?);

        Ok(SignedEnvelopeShare {
            envelope: e,
            index: self.index,
            sig_share: SignatureShare::from_bytes(g2_to_be_bytes(bs_sig_g2))?,
        })
    }
}

struct DenominationKeys {
    public_keys: PublicKeySet,
    signers: Vec<BlindSignerShare>,
}

/// A mint whose per-denomination key is split m-of-n across signer shares.
///
/// Coins it issues verify under the key set's master public key exactly like
/// coins from a single-key mint.
pub struct ThresholdMint {
    params: MintParameters,
    threshold: usize,
    keys: BTreeMap<i64, DenominationKeys>,
}

impl ThresholdMint {
    /// Deal fresh key sets: any `threshold + 1` of `signer_count` shares sign.
    pub fn new<R: rand::Rng>(
        params: MintParameters,
        threshold: usize,
        signer_count: usize,
        denominations: &[i64],
        rng: &mut R,
    ) -> Result<Self> {
        if signer_count <= threshold {
            return Err(CashError::PolicyViolation(format!(
                "{} signers cannot meet threshold {}",
                signer_count, threshold
            )));
        }
        let keys = denominations
            .iter()
            .map(|d| {
                let sks = SecretKeySet::random(threshold, rng);
                let signers = (0..signer_count)
                    .map(|i| BlindSignerShare::new(i, sks.secret_key_share(&i)))
                    .collect();
                let keys = DenominationKeys {
                    public_keys: sks.public_keys(),
                    signers,
                };
                (*d, keys)
            })
            .collect();
        Ok(Self {
            params,
            threshold,
            keys,
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    fn keys(&self, denomination: i64) -> Result<&DenominationKeys> {
        self.keys.get(&denomination).ok_or_else(|| {
            CashError::PolicyViolation(format!(
                "mint series {} has no key for denomination {}",
                self.params.series, denomination
            ))
        })
    }

    /// Sign the candidate at `index` using only the listed signer shares.
    pub fn sign_with_signers(
        &self,
        candidates: &[Vec<u8>],
        denomination: i64,
        index: usize,
        signers: &[usize],
    ) -> Result<Vec<u8>> {
        let keys = self.keys(denomination)?;
        let envelope = candidate_at(candidates, index)?;

        let mut shares: Vec<SignedEnvelopeShare> = Vec::with_capacity(signers.len());
        for i in signers {
            let signer = keys.signers.get(*i).ok_or_else(|| {
                CashError::PolicyViolation(format!("no signer share {}", i))
            })?;
            shares.push(signer.sign_envelope(envelope.clone())?);
        }

        let sig = keys
            .public_keys
            .combine_signatures(
                shares
                    .iter()
                    .map(|s| (s.index(), s.signature_share_for_envelope())),
            )
            .map_err(|e| {
                warn!(
                    denomination,
                    shares = shares.len(),
                    threshold = self.threshold,
                    "could not combine signature shares"
                );
                CashError::CryptoFailure(format!("combining signature shares: {}", e))
            })?;
        debug!(denomination, index, shares = shares.len(), "threshold mint signed prototoken");

        Ok(sig.to_bytes().to_vec())
    }
}

impl Mint for ThresholdMint {
    fn parameters(&self) -> &MintParameters {
        &self.params
    }

    fn public_key(&self, denomination: i64) -> Result<Vec<u8>> {
        Ok(self
            .keys(denomination)?
            .public_keys
            .public_key()
            .to_bytes()
            .to_vec())
    }

    fn verify_contents(&self, cleartext: &[u8], denomination: i64) -> Result<bool> {
        BlsScheme.verify(cleartext, &self.public_key(denomination)?)
    }

    fn sign_chosen(
        &self,
        candidates: &[Vec<u8>],
        denomination: i64,
        policy: &IssuancePolicy,
    ) -> Result<(usize, Vec<u8>)> {
        let keys = self.keys(denomination)?;
        let index = choose_index(candidates, policy)?;
        let everyone: Vec<usize> = keys.signers.iter().map(|s| s.index()).collect();
        let signature = self.sign_with_signers(candidates, denomination, index, &everyone)?;
        Ok((index, signature))
    }
}
