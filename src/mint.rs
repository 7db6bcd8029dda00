//! The issuing authority.
//!
//! A mint holds one signing key per denomination for a given series. It
//! signs exactly one of the blinded candidates a client submits and later
//! checks redeemed coins against the same keys.

use crate::blind_sigs::{BlindSigner, BlsScheme, Envelope};
use crate::config::IssuancePolicy;
use crate::error::{CashError, Result};
use crate::identifier::Identifier;
use crate::scheme::BlindingScheme;
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use std::collections::BTreeMap;
use std::convert::TryFrom;
use tracing::{debug, info};

pub type Timestamp = DateTime<Utc>;

/// Truncate to whole seconds, the precision tokens are serialized with.
pub fn whole_seconds(t: Timestamp) -> Timestamp {
    Utc.timestamp_opt(t.timestamp(), 0).single().unwrap_or(t)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MintParameters {
    pub instrument_definition_id: Identifier,
    pub series: u32,
    pub valid_from: Timestamp,
    pub valid_to: Timestamp,
}

impl MintParameters {
    pub fn new(
        instrument_definition_id: Identifier,
        series: u32,
        valid_from: Timestamp,
        valid_to: Timestamp,
    ) -> Result<Self> {
        let (valid_from, valid_to) = (whole_seconds(valid_from), whole_seconds(valid_to));
        if valid_to < valid_from {
            return Err(CashError::PolicyViolation(format!(
                "series {} expires before it starts",
                series
            )));
        }
        Ok(Self {
            instrument_definition_id,
            series,
            valid_from,
            valid_to,
        })
    }
}

/// What the token protocol needs from an issuing authority.
pub trait Mint: Send + Sync {
    fn parameters(&self) -> &MintParameters;

    fn instrument_definition_id(&self) -> Identifier {
        self.parameters().instrument_definition_id
    }

    fn current_series(&self) -> u32 {
        self.parameters().series
    }

    fn valid_from(&self) -> Timestamp {
        self.parameters().valid_from
    }

    fn valid_to(&self) -> Timestamp {
        self.parameters().valid_to
    }

    /// Serialized verification key for `denomination`.
    fn public_key(&self, denomination: i64) -> Result<Vec<u8>>;

    /// Algorithm-specific check of an unblinded coin.
    fn verify_contents(&self, cleartext: &[u8], denomination: i64) -> Result<bool>;

    /// Pick one of `candidates` and blind-sign it. Returns the chosen index
    /// and the signature.
    fn sign_chosen(
        &self,
        candidates: &[Vec<u8>],
        denomination: i64,
        policy: &IssuancePolicy,
    ) -> Result<(usize, Vec<u8>)>;
}

pub(crate) fn choose_index(candidates: &[Vec<u8>], policy: &IssuancePolicy) -> Result<usize> {
    policy.check_count(candidates.len())?;
    if candidates.is_empty() {
        return Err(CashError::PolicyViolation("no prototokens to sign".into()));
    }
    Ok(rand::thread_rng().gen_range(0, candidates.len()))
}

pub(crate) fn candidate_at(candidates: &[Vec<u8>], index: usize) -> Result<Envelope> {
    let candidate = candidates.get(index).ok_or_else(|| {
        CashError::PolicyViolation(format!(
            "chosen index {} out of range for {} prototokens",
            index,
            candidates.len()
        ))
    })?;
    Envelope::try_from(candidate.as_slice())
}

/// A mint signing with one BLS key per denomination.
pub struct BlsMint {
    params: MintParameters,
    signers: BTreeMap<i64, BlindSigner>,
}

impl BlsMint {
    /// Create a mint with a fresh key for each of `denominations`.
    pub fn new(params: MintParameters, denominations: &[i64]) -> Self {
        let signers = denominations
            .iter()
            .map(|d| (*d, BlindSigner::new()))
            .collect();
        info!(
            instrument = %params.instrument_definition_id,
            series = params.series,
            "created mint with {} denominations",
            denominations.len()
        );
        Self { params, signers }
    }

    pub fn add_denomination(&mut self, denomination: i64, signer: BlindSigner) {
        self.signers.insert(denomination, signer);
    }

    pub fn denominations(&self) -> impl Iterator<Item = i64> + '_ {
        self.signers.keys().copied()
    }

    fn signer(&self, denomination: i64) -> Result<&BlindSigner> {
        self.signers.get(&denomination).ok_or_else(|| {
            CashError::PolicyViolation(format!(
                "mint series {} has no key for denomination {}",
                self.params.series, denomination
            ))
        })
    }

    /// Sign the candidate at a known index.
    pub fn sign_candidate(
        &self,
        candidates: &[Vec<u8>],
        denomination: i64,
        index: usize,
    ) -> Result<Vec<u8>> {
        let signer = self.signer(denomination)?;
        let envelope = candidate_at(candidates, index)?;
        let signed = signer.sign_envelope(envelope)?;
        debug!(denomination, index, "mint signed prototoken");
        Ok(signed.signature_for_envelope().to_bytes().to_vec())
    }
}

impl Mint for BlsMint {
    fn parameters(&self) -> &MintParameters {
        &self.params
    }

    fn public_key(&self, denomination: i64) -> Result<Vec<u8>> {
        Ok(self.signer(denomination)?.public_key().to_bytes().to_vec())
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
        self.signer(denomination)?;
        let index = choose_index(candidates, policy)?;
        let signature = self.sign_candidate(candidates, denomination, index)?;
        Ok((index, signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn params() -> MintParameters {
        let now = Utc::now();
        MintParameters::new(
            Identifier::digest(b"usd"),
            7,
            now - Duration::days(1),
            now + Duration::days(30),
        )
        .unwrap()
    }

    #[test]
    fn parameters_are_whole_seconds() {
        let p = params();
        assert_eq!(p.valid_from.timestamp_subsec_nanos(), 0);
        assert_eq!(p.valid_to.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn backwards_window_is_rejected() {
        let now = Utc::now();
        let result = MintParameters::new(Identifier::default(), 1, now, now - Duration::days(1));
        assert!(matches!(result, Err(CashError::PolicyViolation(_))));
    }

    #[test]
    fn signs_one_candidate_that_unblinds() -> Result<()> {
        let mint = BlsMint::new(params(), &[5, 10]);
        let candidates = BlsScheme.generate_candidates(4)?;
        let public: Vec<Vec<u8>> = candidates.iter().map(|c| c.public.clone()).collect();

        let (index, sig) = mint.sign_chosen(&public, 10, &IssuancePolicy::default())?;
        assert!(index < 4);

        let coin = BlsScheme.unblind(&sig, &candidates[index].private)?;
        assert!(mint.verify_contents(&coin, 10)?);
        assert!(!mint.verify_contents(&coin, 5)?);
        Ok(())
    }

    #[test]
    fn denominations_can_be_added() -> Result<()> {
        let mut mint = BlsMint::new(params(), &[5]);
        let signer = BlindSigner::new();
        let public_key = signer.public_key().to_bytes().to_vec();
        mint.add_denomination(50, signer);

        assert_eq!(mint.denominations().collect::<Vec<_>>(), vec![5, 50]);
        assert_eq!(mint.public_key(50)?, public_key);

        let public: Vec<Vec<u8>> = BlsScheme
            .generate_candidates(1)?
            .into_iter()
            .map(|c| c.public)
            .collect();
        assert!(mint.sign_candidate(&public, 50, 0).is_ok());
        Ok(())
    }

    #[test]
    fn policy_and_denomination_are_enforced() -> Result<()> {
        let mint = BlsMint::new(params(), &[5]);
        let public: Vec<Vec<u8>> = BlsScheme
            .generate_candidates(2)?
            .into_iter()
            .map(|c| c.public)
            .collect();

        let strict = IssuancePolicy::with_minimum(3);
        assert!(matches!(
            mint.sign_chosen(&public, 5, &strict),
            Err(CashError::PolicyViolation(_))
        ));
        assert!(matches!(
            mint.sign_chosen(&public, 500, &IssuancePolicy::default()),
            Err(CashError::PolicyViolation(_))
        ));
        assert!(matches!(
            mint.sign_candidate(&public, 5, 2),
            Err(CashError::PolicyViolation(_))
        ));
        Ok(())
    }
}
