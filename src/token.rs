//! One unit of blind cash and its lifecycle.
//!
//! ```text
//! Blank -> Proto -> Signed -> Spendable -> Verified
//!                                 ^  |
//!                                 +--+ reassign
//! ```
//!
//! Any parse failure, and any crypto failure during a state change, moves
//! the token to `Error`, after which every operation refuses to run.
//!
//! The client keeps its own `Proto` copy (with the private prototokens) and
//! sends the mint a copy without them. The mint returns the token `Signed`;
//! the client unblinds it against its kept request with
//! [`Token::process_token`].

use crate::armor::Armored;
use crate::config::IssuancePolicy;
use crate::error::{CashError, Result};
use crate::identifier::Identifier;
use crate::ledger::{digest_key, InsertOutcome, SpentLedger, SpentScope};
use crate::mint::{Mint, Timestamp};
use crate::owner::Owner;
use crate::scheme::BlindingScheme;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

pub const TOKEN_VERSION: &str = "1.0";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TokenState {
    Blank,
    Proto,
    Signed,
    Spendable,
    Verified,
    Error,
}

impl TokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blank => "blankToken",
            Self::Proto => "protoToken",
            Self::Signed => "signedToken",
            Self::Spendable => "spendableToken",
            Self::Verified => "verifiedToken",
            Self::Error => "errorToken",
        }
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenState {
    type Err = CashError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blankToken" => Ok(Self::Blank),
            "protoToken" => Ok(Self::Proto),
            "signedToken" => Ok(Self::Signed),
            "spendableToken" => Ok(Self::Spendable),
            "verifiedToken" => Ok(Self::Verified),
            other => Err(CashError::MalformedInput(format!(
                "unknown token state {:?}",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ProtoPurse {
    count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chosen_index: Option<usize>,
    #[serde(default)]
    prototokens: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct PrivateProtoPurse {
    prototokens: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct TokenDocument {
    version: String,
    state: String,
    denomination: i64,
    instrument_definition_id: Identifier,
    notary_id: Identifier,
    series: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    valid_from: Timestamp,
    #[serde(with = "chrono::serde::ts_seconds")]
    valid_to: Timestamp,
    #[serde(default)]
    password_protected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    spendable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    protopurse: Option<ProtoPurse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_protopurse: Option<PrivateProtoPurse>,
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| CashError::MalformedInput(format!("{}: {}", name, e)))?;
    if bytes.is_empty() {
        return Err(CashError::MalformedInput(format!("{} without value", name)));
    }
    Ok(bytes)
}

fn decode_list(name: &str, values: &[String]) -> Result<BTreeMap<usize, Vec<u8>>> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| Ok((i, decode_field(name, v)?)))
        .collect()
}

fn encode_list(map: &BTreeMap<usize, Vec<u8>>) -> Vec<String> {
    map.values().map(|v| STANDARD.encode(v)).collect()
}

#[derive(Clone)]
pub struct Token {
    scheme: Arc<dyn BlindingScheme>,
    version: String,
    notary_id: Identifier,
    instrument_definition_id: Identifier,
    denomination: i64,
    series: u32,
    valid_from: Timestamp,
    valid_to: Timestamp,
    state: TokenState,
    token_count: usize,
    chosen_index: Option<usize>,
    public_prototokens: BTreeMap<usize, Vec<u8>>,
    private_prototokens: BTreeMap<usize, Vec<u8>>,
    signature: Option<Vec<u8>>,
    spendable: Option<Vec<u8>>,
    password_protected: bool,
}

impl Token {
    pub fn new(
        scheme: Arc<dyn BlindingScheme>,
        notary_id: Identifier,
        instrument_definition_id: Identifier,
    ) -> Self {
        let epoch = Timestamp::from(std::time::UNIX_EPOCH);
        Self {
            scheme,
            version: TOKEN_VERSION.to_string(),
            notary_id,
            instrument_definition_id,
            denomination: 0,
            series: 0,
            valid_from: epoch,
            valid_to: epoch,
            state: TokenState::Blank,
            token_count: 0,
            chosen_index: None,
            public_prototokens: BTreeMap::new(),
            private_prototokens: BTreeMap::new(),
            signature: None,
            spendable: None,
            password_protected: false,
        }
    }

    /// Create a token and immediately generate its withdrawal request.
    ///
    /// Without an explicit `token_count` the policy's default width is used.
    pub fn instantiate_and_generate_request(
        scheme: Arc<dyn BlindingScheme>,
        notary_id: Identifier,
        mint: &dyn Mint,
        denomination: i64,
        token_count: Option<usize>,
        policy: &IssuancePolicy,
    ) -> Result<Self> {
        let token_count = token_count.unwrap_or_else(|| policy.prototoken_count());
        let mut token = Self::new(scheme, notary_id, mint.instrument_definition_id());
        token
            .generate_request(mint, denomination, token_count, policy)
            .map_err(|e| {
                error!(error = %e, "failed trying to generate token request");
                e
            })?;
        Ok(token)
    }

    pub fn scheme(&self) -> &Arc<dyn BlindingScheme> {
        &self.scheme
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn notary_id(&self) -> Identifier {
        self.notary_id
    }

    pub fn instrument_definition_id(&self) -> Identifier {
        self.instrument_definition_id
    }

    pub fn denomination(&self) -> i64 {
        self.denomination
    }

    pub fn series(&self) -> u32 {
        self.series
    }

    pub fn valid_from(&self) -> Timestamp {
        self.valid_from
    }

    pub fn valid_to(&self) -> Timestamp {
        self.valid_to
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn chosen_index(&self) -> Option<usize> {
        self.chosen_index
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn spendable_payload(&self) -> Option<&[u8]> {
        self.spendable.as_deref()
    }

    pub fn is_password_protected(&self) -> bool {
        self.password_protected
    }

    pub fn spent_scope(&self) -> SpentScope {
        SpentScope {
            instrument_definition_id: self.instrument_definition_id,
            series: self.series,
        }
    }

    fn expect_state(&self, operation: &'static str, expected: TokenState) -> Result<()> {
        if self.state == expected {
            return Ok(());
        }
        Err(CashError::WrongState {
            operation,
            expected: expected.as_str(),
            actual: self.state.as_str(),
        })
    }

    /// Terminal errors poison the token.
    fn poison(&mut self, e: CashError) -> CashError {
        if e.is_terminal() && self.state != TokenState::Error {
            warn!(state = %self.state, error = %e, "token moved to error state");
            self.state = TokenState::Error;
        }
        e
    }

    fn release_prototokens(&mut self) {
        self.public_prototokens.clear();
        self.private_prototokens.clear();
    }

    /// Generate `token_count` blinded candidates for `denomination`.
    ///
    /// Series and validity window are copied from the mint.
    pub fn generate_request(
        &mut self,
        mint: &dyn Mint,
        denomination: i64,
        token_count: usize,
        policy: &IssuancePolicy,
    ) -> Result<()> {
        self.expect_state("generate a token request", TokenState::Blank)?;
        if denomination <= 0 {
            return Err(CashError::PolicyViolation(format!(
                "denomination must be positive, got {}",
                denomination
            )));
        }
        if token_count == 0 {
            return Err(CashError::PolicyViolation("token count must be at least 1".into()));
        }
        policy.check_count(token_count)?;
        if mint.instrument_definition_id() != self.instrument_definition_id {
            return Err(CashError::MintMismatch(format!(
                "mint issues {}, token is for {}",
                mint.instrument_definition_id(),
                self.instrument_definition_id
            )));
        }
        // the mint must actually have a key for this denomination
        mint.public_key(denomination)?;

        let candidates = match self.scheme.generate_candidates(token_count) {
            Ok(candidates) => candidates,
            Err(e) => return Err(self.poison(e)),
        };

        for (i, candidate) in candidates.into_iter().enumerate() {
            self.public_prototokens.insert(i, candidate.public);
            self.private_prototokens.insert(i, candidate.private);
        }
        self.denomination = denomination;
        self.token_count = token_count;
        self.chosen_index = None;
        self.series = mint.current_series();
        self.valid_from = mint.valid_from();
        self.valid_to = mint.valid_to();
        self.state = TokenState::Proto;

        debug!(
            denomination,
            token_count,
            series = self.series,
            "generated token request"
        );
        Ok(())
    }

    pub fn prototoken(&self, index: usize) -> Option<&[u8]> {
        if index >= self.token_count {
            return None;
        }
        self.public_prototokens.get(&index).map(Vec::as_slice)
    }

    pub fn private_prototoken(&self, index: usize) -> Option<&[u8]> {
        if index >= self.token_count {
            return None;
        }
        self.private_prototokens.get(&index).map(Vec::as_slice)
    }

    /// The blinded candidates in index order, as sent to the mint.
    pub fn public_prototokens(&self) -> Vec<Vec<u8>> {
        self.public_prototokens.values().cloned().collect()
    }

    /// Mint side: have `mint` pick and sign one candidate.
    pub fn sign_with(&mut self, mint: &dyn Mint, policy: &IssuancePolicy) -> Result<()> {
        self.expect_state("sign", TokenState::Proto)?;
        if self.public_prototokens.len() != self.token_count {
            return Err(CashError::PolicyViolation(format!(
                "token claims {} prototokens but carries {}",
                self.token_count,
                self.public_prototokens.len()
            )));
        }
        if mint.instrument_definition_id() != self.instrument_definition_id
            || mint.current_series() != self.series
        {
            return Err(CashError::MintMismatch(format!(
                "token is for {} series {}, mint is {} series {}",
                self.instrument_definition_id,
                self.series,
                mint.instrument_definition_id(),
                mint.current_series()
            )));
        }

        let candidates = self.public_prototokens();
        let (index, signature) = mint.sign_chosen(&candidates, self.denomination, policy)?;
        self.set_signature(signature, index)
    }

    /// Record the mint's signature on the candidate at `index`.
    ///
    /// All prototokens are released: the mint never had the private ones and
    /// the client keeps its own request copy.
    pub fn set_signature(&mut self, signature: Vec<u8>, index: usize) -> Result<()> {
        self.expect_state("set signature", TokenState::Proto)?;
        if index >= self.token_count {
            return Err(CashError::PolicyViolation(format!(
                "chosen index {} out of range for {} prototokens",
                index, self.token_count
            )));
        }
        if signature.is_empty() {
            return Err(CashError::PolicyViolation("empty mint signature".into()));
        }

        self.release_prototokens();
        self.signature = Some(signature);
        self.chosen_index = Some(index);
        self.state = TokenState::Signed;
        debug!(index, "token signed by mint");
        Ok(())
    }

    /// Client side: unblind the mint's signature using the private
    /// prototoken from `request`, and seal the resulting coin to `owner`.
    pub fn process_token(&mut self, request: &Token, owner: &Owner, mint: &dyn Mint) -> Result<()> {
        self.expect_state("process", TokenState::Signed)?;
        request.expect_state("unblind from request", TokenState::Proto)?;

        if request.notary_id != self.notary_id
            || request.instrument_definition_id != self.instrument_definition_id
            || request.denomination != self.denomination
            || request.series != self.series
            || request.token_count != self.token_count
        {
            return Err(CashError::PolicyViolation(
                "signed token does not belong to this request".into(),
            ));
        }
        let index = self
            .chosen_index
            .ok_or_else(|| CashError::PolicyViolation("signed token has no chosen index".into()))?;
        let private = request.private_prototoken(index).ok_or_else(|| {
            CashError::PolicyViolation(format!("request has no private prototoken {}", index))
        })?;
        let signature = match self.signature.as_deref() {
            Some(signature) => signature,
            None => return Err(self.poison(CashError::MalformedInput("signed token without signature".into()))),
        };

        let cleartext = match self.scheme.unblind(signature, private) {
            Ok(cleartext) => Zeroizing::new(cleartext),
            Err(e) => return Err(self.poison(e)),
        };
        match mint.verify_contents(&cleartext, self.denomination) {
            Ok(true) => {}
            Ok(false) => {
                return Err(self.poison(CashError::CryptoFailure(
                    "unblinded coin does not verify under the mint key".into(),
                )))
            }
            Err(e) => return Err(self.poison(e)),
        }
        let sealed = match owner.seal(&cleartext) {
            Ok(sealed) => sealed,
            Err(e) => return Err(self.poison(e)),
        };

        self.spendable = Some(sealed);
        self.password_protected = owner.is_password();
        self.signature = None;
        self.chosen_index = None;
        self.token_count = 0;
        self.release_prototokens();
        self.state = TokenState::Spendable;
        info!(owner = %owner.id(), denomination = self.denomination, "token is spendable");
        Ok(())
    }

    /// Open the sealed payload, yielding the cleartext coin.
    pub fn spendable_contents(&self, owner: &Owner) -> Result<Zeroizing<Vec<u8>>> {
        if self.state != TokenState::Spendable && self.state != TokenState::Verified {
            return Err(CashError::WrongState {
                operation: "open",
                expected: TokenState::Spendable.as_str(),
                actual: self.state.as_str(),
            });
        }
        let payload = self
            .spendable
            .as_deref()
            .ok_or_else(|| CashError::MalformedInput("spendable payload is empty".into()))?;
        Ok(Zeroizing::new(owner.open(payload)?))
    }

    /// Re-seal the payload from `old_owner` to `new_owner`.
    ///
    /// The stored payload is only replaced once the new seal succeeded.
    pub fn reassign(&mut self, old_owner: &Owner, new_owner: &Owner) -> Result<()> {
        self.expect_state("reassign", TokenState::Spendable)?;
        if old_owner.same_identity_as(new_owner) {
            return Ok(());
        }

        let resealed = match self
            .spendable_contents(old_owner)
            .and_then(|cleartext| new_owner.seal(&cleartext))
        {
            Ok(resealed) => resealed,
            Err(e) => return Err(self.poison(e)),
        };

        self.spendable = Some(resealed);
        self.password_protected = new_owner.is_password();
        debug!(from = %old_owner.id(), to = %new_owner.id(), "token reassigned");
        Ok(())
    }

    pub fn verify_current_date(&self) -> bool {
        let now = Utc::now();
        self.valid_from <= now && now <= self.valid_to
    }

    /// Redemption check. Has no side effects and may be repeated.
    ///
    /// Series is compared before the dates: altered dates with an intact
    /// series would still verify under the series key.
    pub fn verify(&self, capability: &Owner, mint: &dyn Mint) -> Result<bool> {
        self.expect_state("verify", TokenState::Spendable)?;

        let cleartext = self.spendable_contents(capability)?;

        if self.instrument_definition_id != mint.instrument_definition_id() {
            return Err(CashError::MintMismatch(format!(
                "token is for {}, mint issues {}",
                self.instrument_definition_id,
                mint.instrument_definition_id()
            )));
        }
        if self.series != mint.current_series() {
            return Err(CashError::MintMismatch(format!(
                "token series {} but mint series {}",
                self.series,
                mint.current_series()
            )));
        }
        if self.valid_from != mint.valid_from() || self.valid_to != mint.valid_to() {
            return Err(CashError::MintMismatch(
                "token validity window differs from mint series".into(),
            ));
        }
        if !self.verify_current_date() {
            return Err(CashError::PolicyViolation(format!(
                "token is only valid from {} to {}",
                self.valid_from, self.valid_to
            )));
        }

        let verified = mint.verify_contents(&cleartext, self.denomination)?;
        if verified {
            info!(denomination = self.denomination, series = self.series, "token verified");
        } else {
            warn!(denomination = self.denomination, series = self.series, "bad coin");
        }
        Ok(verified)
    }

    /// Spendable -> Verified, once [`verify`](Self::verify) returned true.
    pub fn mark_verified(&mut self) -> Result<()> {
        self.expect_state("mark verified", TokenState::Spendable)?;
        self.state = TokenState::Verified;
        Ok(())
    }

    /// Fail-closed spent check: anything short of a definite "not found"
    /// counts as spent.
    pub fn is_already_spent(&self, ledger: &dyn SpentLedger, cleartext: &[u8]) -> bool {
        let key = digest_key(cleartext, self.spent_scope());
        match ledger.exists(&key) {
            Ok(false) => false,
            Ok(true) => {
                info!(%key, "token was already spent");
                true
            }
            Err(e) => {
                error!(%key, error = %e, "spent ledger check failed, treating token as spent");
                true
            }
        }
    }

    /// Write this token into the ledger under its cleartext's key.
    ///
    /// An existing entry is an [`AlreadySpent`](CashError::AlreadySpent)
    /// error, never a silent success.
    pub fn record_as_spent(&self, ledger: &dyn SpentLedger, cleartext: &[u8]) -> Result<()> {
        let key = digest_key(cleartext, self.spent_scope());
        if ledger.exists(&key)? {
            error!(%key, "trying to record token as spent, but it was already recorded");
            return Err(CashError::AlreadySpent(key.to_string()));
        }

        let blob = self.to_armored()?;
        match ledger.conditional_insert(&key, blob.as_bytes())? {
            InsertOutcome::Inserted => {
                info!(%key, "recorded token as spent");
                Ok(())
            }
            InsertOutcome::AlreadyPresent => {
                error!(%key, "token was recorded concurrently");
                Err(CashError::AlreadySpent(key.to_string()))
            }
        }
    }

    fn to_document(&self, with_private: bool) -> Result<TokenDocument> {
        if self.state == TokenState::Error {
            return Err(CashError::WrongState {
                operation: "serialize",
                expected: "a valid state",
                actual: self.state.as_str(),
            });
        }

        let mut doc = TokenDocument {
            version: self.version.clone(),
            state: self.state.as_str().to_string(),
            denomination: self.denomination,
            instrument_definition_id: self.instrument_definition_id,
            notary_id: self.notary_id,
            series: self.series,
            valid_from: self.valid_from,
            valid_to: self.valid_to,
            password_protected: self.password_protected,
            spendable: None,
            signature: None,
            protopurse: None,
            private_protopurse: None,
        };

        match self.state {
            TokenState::Proto | TokenState::Signed => {
                doc.protopurse = Some(ProtoPurse {
                    count: self.token_count,
                    chosen_index: self.chosen_index,
                    prototokens: encode_list(&self.public_prototokens),
                });
                if self.state == TokenState::Signed {
                    doc.signature = self.signature.as_ref().map(|s| STANDARD.encode(s));
                }
                if with_private && !self.private_prototokens.is_empty() {
                    doc.private_protopurse = Some(PrivateProtoPurse {
                        prototokens: encode_list(&self.private_prototokens),
                    });
                }
            }
            TokenState::Spendable | TokenState::Verified => {
                doc.spendable = self.spendable.as_ref().map(|s| STANDARD.encode(s));
            }
            TokenState::Blank | TokenState::Error => {}
        }
        Ok(doc)
    }

    fn armor(&self, with_private: bool) -> Result<String> {
        let body = serde_json::to_vec(&self.to_document(with_private)?)?;
        Ok(Armored::new(self.scheme.discriminant(), body).encode())
    }

    /// Serialize without private prototokens. This is what leaves the client.
    pub fn to_armored(&self) -> Result<String> {
        self.armor(false)
    }

    /// Serialize including private prototokens, for the client's own copy of
    /// a withdrawal request.
    pub fn to_armored_with_private(&self) -> Result<String> {
        self.armor(true)
    }

    /// Populate this token from a dearmored body. On failure the token is
    /// left in `Error`, and an `Error` token never loads again.
    pub fn load(&mut self, body: &[u8]) -> Result<()> {
        if self.state == TokenState::Error {
            return Err(CashError::WrongState {
                operation: "load",
                expected: "a valid state",
                actual: self.state.as_str(),
            });
        }
        match Self::parse_into(self.scheme.clone(), body) {
            Ok(loaded) => {
                *self = loaded;
                debug!(
                    state = %self.state,
                    denomination = self.denomination,
                    instrument = %self.instrument_definition_id,
                    "loaded token"
                );
                Ok(())
            }
            Err(e) => {
                let e = match e {
                    e @ CashError::MalformedInput(_) => e,
                    other => CashError::MalformedInput(other.to_string()),
                };
                self.release_prototokens();
                self.signature = None;
                self.spendable = None;
                self.state = TokenState::Error;
                warn!(error = %e, "failed to load token");
                Err(e)
            }
        }
    }

    fn parse_into(scheme: Arc<dyn BlindingScheme>, body: &[u8]) -> Result<Self> {
        let doc: TokenDocument = serde_json::from_slice(body)?;
        let state: TokenState = doc.state.parse()?;

        let mut token = Self::new(scheme, doc.notary_id, doc.instrument_definition_id);
        token.version = doc.version;
        token.denomination = doc.denomination;
        token.series = doc.series;
        token.valid_from = doc.valid_from;
        token.valid_to = doc.valid_to;
        token.password_protected = doc.password_protected;
        token.state = state;

        let carries_protopurse = doc.protopurse.is_some() || doc.private_protopurse.is_some();
        match state {
            TokenState::Blank => {
                if carries_protopurse || doc.signature.is_some() || doc.spendable.is_some() {
                    return Err(CashError::MalformedInput("blank token with contents".into()));
                }
            }
            TokenState::Proto | TokenState::Signed => {
                if doc.spendable.is_some() {
                    return Err(CashError::MalformedInput(
                        "token carries both prototokens and a spendable payload".into(),
                    ));
                }
                let purse = doc
                    .protopurse
                    .ok_or_else(|| CashError::MalformedInput("missing protopurse".into()))?;
                if purse.count == 0 {
                    return Err(CashError::MalformedInput("protopurse count is zero".into()));
                }
                if let Some(index) = purse.chosen_index {
                    if index >= purse.count {
                        return Err(CashError::MalformedInput(format!(
                            "chosen index {} out of range for {} prototokens",
                            index, purse.count
                        )));
                    }
                }
                token.token_count = purse.count;
                token.public_prototokens = decode_list("prototoken", &purse.prototokens)?;

                if state == TokenState::Proto {
                    if token.public_prototokens.len() != purse.count {
                        return Err(CashError::MalformedInput(format!(
                            "protopurse count {} but {} prototokens",
                            purse.count,
                            token.public_prototokens.len()
                        )));
                    }
                    if doc.signature.is_some() {
                        return Err(CashError::MalformedInput("proto token with signature".into()));
                    }
                    if let Some(private) = doc.private_protopurse {
                        token.private_prototokens =
                            decode_list("private prototoken", &private.prototokens)?;
                        if token.private_prototokens.len() != purse.count {
                            return Err(CashError::MalformedInput(format!(
                                "protopurse count {} but {} private prototokens",
                                purse.count,
                                token.private_prototokens.len()
                            )));
                        }
                    }
                } else {
                    if !token.public_prototokens.is_empty() || doc.private_protopurse.is_some() {
                        return Err(CashError::MalformedInput(
                            "signed token still carries prototokens".into(),
                        ));
                    }
                    token.chosen_index = Some(purse.chosen_index.ok_or_else(|| {
                        CashError::MalformedInput("signed token without chosen index".into())
                    })?);
                    let signature = doc.signature.ok_or_else(|| {
                        CashError::MalformedInput("signed token without signature".into())
                    })?;
                    token.signature = Some(decode_field("token signature", &signature)?);
                }
            }
            TokenState::Spendable | TokenState::Verified => {
                if carries_protopurse || doc.signature.is_some() {
                    return Err(CashError::MalformedInput(
                        "spendable token carries prototokens or a signature".into(),
                    ));
                }
                let spendable = doc
                    .spendable
                    .ok_or_else(|| CashError::MalformedInput("token ID without value".into()))?;
                token.spendable = Some(decode_field("token ID", &spendable)?);
            }
            TokenState::Error => {
                return Err(CashError::MalformedInput("error tokens do not load".into()))
            }
        }
        Ok(token)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("scheme", &self.scheme.discriminant())
            .field("state", &self.state)
            .field("denomination", &self.denomination)
            .field("series", &self.series)
            .field("instrument_definition_id", &self.instrument_definition_id)
            .field("notary_id", &self.notary_id)
            .field("token_count", &self.token_count)
            .field("chosen_index", &self.chosen_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blind_sigs::BlsScheme;
    use crate::ledger::{LedgerError, LedgerKey, MemoryLedger};
    use crate::mint::{BlsMint, MintParameters};
    use crate::owner::{Nym, SymmetricKey};
    use chrono::Duration;

    fn mint() -> BlsMint {
        let now = Utc::now();
        let params = MintParameters::new(
            Identifier::digest(b"usd"),
            2,
            now - Duration::days(1),
            now + Duration::days(7),
        )
        .unwrap();
        BlsMint::new(params, &[1, 5, 500])
    }

    fn request(mint: &BlsMint, count: usize) -> Result<Token> {
        Token::instantiate_and_generate_request(
            Arc::new(BlsScheme),
            Identifier::digest(b"notary"),
            mint,
            500,
            Some(count),
            &IssuancePolicy::default(),
        )
    }

    fn spendable(mint: &BlsMint, owner: &Owner) -> Result<Token> {
        let request = request(mint, 3)?;
        let mut signed = request.clone();
        signed.sign_with(mint, &IssuancePolicy::default())?;
        signed.process_token(&request, owner, mint)?;
        Ok(signed)
    }

    #[test]
    fn request_populates_both_maps() -> Result<()> {
        let mint = mint();
        let token = request(&mint, 3)?;
        assert_eq!(token.state(), TokenState::Proto);
        assert_eq!(token.token_count(), 3);
        assert_eq!(token.series(), 2);
        assert_eq!(token.valid_from(), mint.valid_from());
        assert!(token.prototoken(2).is_some());
        assert!(token.private_prototoken(2).is_some());
        assert!(token.prototoken(3).is_none());
        assert!(token.private_prototoken(3).is_none());
        assert!(token.spendable_payload().is_none());
        Ok(())
    }

    #[test]
    fn request_width_defaults_to_policy() -> Result<()> {
        let mint = mint();
        let policy = IssuancePolicy {
            minimum_prototoken_count: 2,
            default_prototoken_count: Some(5),
        };
        let token = Token::instantiate_and_generate_request(
            Arc::new(BlsScheme),
            Identifier::digest(b"notary"),
            &mint,
            500,
            None,
            &policy,
        )?;
        assert_eq!(token.token_count(), 5);
        assert_eq!(token.public_prototokens().len(), 5);

        let token = Token::instantiate_and_generate_request(
            Arc::new(BlsScheme),
            Identifier::digest(b"notary"),
            &mint,
            500,
            None,
            &IssuancePolicy::with_minimum(3),
        )?;
        assert_eq!(token.token_count(), 3);
        Ok(())
    }

    #[test]
    fn request_rejections_leave_token_blank() -> Result<()> {
        let mint = mint();
        let mut token = Token::new(
            Arc::new(BlsScheme),
            Identifier::digest(b"notary"),
            mint.instrument_definition_id(),
        );

        let strict = IssuancePolicy::with_minimum(4);
        assert!(matches!(
            token.generate_request(&mint, 500, 3, &strict),
            Err(CashError::PolicyViolation(_))
        ));
        assert!(matches!(
            token.generate_request(&mint, 7, 3, &IssuancePolicy::default()),
            Err(CashError::PolicyViolation(_))
        ));
        assert!(matches!(
            token.generate_request(&mint, 500, 0, &IssuancePolicy::default()),
            Err(CashError::PolicyViolation(_))
        ));
        assert_eq!(token.state(), TokenState::Blank);

        token.generate_request(&mint, 500, 3, &IssuancePolicy::default())?;
        assert!(matches!(
            token.generate_request(&mint, 500, 3, &IssuancePolicy::default()),
            Err(CashError::WrongState { .. })
        ));
        Ok(())
    }

    #[test]
    fn out_of_range_index_leaves_state_unchanged() -> Result<()> {
        let mint = mint();
        let mut token = request(&mint, 3)?;
        let err = token.set_signature(vec![1; 96], 3).unwrap_err();
        assert!(matches!(err, CashError::PolicyViolation(_)));
        assert!(err.is_recoverable());
        assert_eq!(token.state(), TokenState::Proto);
        assert_eq!(token.public_prototokens().len(), 3);
        Ok(())
    }

    #[test]
    fn signing_twice_is_wrong_state() -> Result<()> {
        let mint = mint();
        let mut token = request(&mint, 2)?;
        token.sign_with(&mint, &IssuancePolicy::default())?;
        assert_eq!(token.state(), TokenState::Signed);
        assert!(token.chosen_index().unwrap() < token.token_count());
        assert!(token.prototoken(0).is_none());
        assert!(token.private_prototoken(0).is_none());

        assert!(matches!(
            token.sign_with(&mint, &IssuancePolicy::default()),
            Err(CashError::WrongState { .. })
        ));
        Ok(())
    }

    #[test]
    fn unblinded_token_is_sealed_and_signature_discarded() -> Result<()> {
        let mint = mint();
        let alice: Owner = Nym::generate().into();
        let token = spendable(&mint, &alice)?;

        assert_eq!(token.state(), TokenState::Spendable);
        assert!(token.signature().is_none());
        assert!(token.chosen_index().is_none());
        assert!(token.prototoken(0).is_none());
        assert!(token.spendable_payload().is_some());
        assert!(!token.is_password_protected());

        let coin = token.spendable_contents(&alice)?;
        assert!(mint.verify_contents(&coin, 500)?);
        Ok(())
    }

    #[test]
    fn process_token_needs_the_matching_request() -> Result<()> {
        let mint = mint();
        let alice: Owner = Nym::generate().into();
        let request_a = request(&mint, 2)?;
        let request_b = request(&mint, 2)?;

        let mut signed = request_a.clone();
        signed.sign_with(&mint, &IssuancePolicy::default())?;

        // a request whose candidates were never signed unblinds to garbage
        let err = signed.clone().process_token(&request_b, &alice, &mint).unwrap_err();
        assert!(err.is_terminal());

        // the copy that went to the mint has no private prototokens
        let mut sent = Token::new(Arc::new(BlsScheme), request_a.notary_id(), request_a.instrument_definition_id());
        sent.load(&Armored::decode(&request_a.to_armored()?)?.body)?;
        assert!(matches!(
            signed.clone().process_token(&sent, &alice, &mint),
            Err(CashError::PolicyViolation(_))
        ));

        signed.process_token(&request_a, &alice, &mint)?;
        Ok(())
    }

    #[test]
    fn failed_unblinding_poisons_the_token() -> Result<()> {
        let mint = mint();
        let alice: Owner = Nym::generate().into();
        let request = request(&mint, 1)?;
        let mut signed = request.clone();
        signed.set_signature(vec![0xff; 96], 0)?;

        assert!(signed.process_token(&request, &alice, &mint).is_err());
        assert_eq!(signed.state(), TokenState::Error);
        assert!(matches!(
            signed.process_token(&request, &alice, &mint),
            Err(CashError::WrongState { .. })
        ));
        assert!(signed.to_armored().is_err());
        Ok(())
    }

    #[test]
    fn reassign_to_same_owner_is_a_no_op() -> Result<()> {
        let mint = mint();
        let alice: Owner = Nym::generate().into();
        let mut token = spendable(&mint, &alice)?;
        let before = token.spendable_payload().map(<[u8]>::to_vec);

        token.reassign(&alice, &alice)?;
        assert_eq!(token.spendable_payload().map(<[u8]>::to_vec), before);
        Ok(())
    }

    #[test]
    fn reassign_between_nym_and_passphrase() -> Result<()> {
        let mint = mint();
        let alice: Owner = Nym::generate().into();
        let purse_key: Owner = SymmetricKey::generate(b"purse password")?.into();
        let mut token = spendable(&mint, &alice)?;
        let coin = token.spendable_contents(&alice)?;

        token.reassign(&alice, &purse_key)?;
        assert!(token.is_password_protected());
        assert_eq!(token.spendable_contents(&purse_key)?, coin);
        assert!(token.spendable_contents(&alice).is_err());

        let bob = Nym::generate();
        let bob_public: Owner = bob.public_only().into();
        token.reassign(&purse_key, &bob_public)?;
        assert!(!token.is_password_protected());
        assert_eq!(token.spendable_contents(&Owner::from(bob))?, coin);
        Ok(())
    }

    #[test]
    fn failed_reassign_keeps_the_payload() -> Result<()> {
        let mint = mint();
        let alice: Owner = Nym::generate().into();
        let mallory: Owner = Nym::generate().into();
        let bob: Owner = Nym::generate().into();
        let mut token = spendable(&mint, &alice)?;
        let before = token.spendable_payload().map(<[u8]>::to_vec);

        let err = token.reassign(&mallory, &bob).unwrap_err();
        assert!(matches!(err, CashError::CryptoFailure(_)));
        assert_eq!(token.spendable_payload().map(<[u8]>::to_vec), before);
        assert_eq!(token.state(), TokenState::Error);
        Ok(())
    }

    #[test]
    fn reassign_only_while_spendable() -> Result<()> {
        let mint = mint();
        let alice: Owner = Nym::generate().into();
        let bob: Owner = Nym::generate().into();
        let mut token = request(&mint, 1)?;
        assert!(matches!(
            token.reassign(&alice, &bob),
            Err(CashError::WrongState { .. })
        ));
        assert_eq!(token.state(), TokenState::Proto);
        Ok(())
    }

    #[test]
    fn verify_checks_series_and_dates_exactly() -> Result<()> {
        let issuing = mint();
        let alice: Owner = Nym::generate().into();
        let token = spendable(&issuing, &alice)?;
        assert!(token.verify(&alice, &issuing)?);

        // same series, shifted window
        let p = issuing.parameters().clone();
        let shifted = BlsMint::new(
            MintParameters::new(p.instrument_definition_id, p.series, p.valid_from - Duration::seconds(1), p.valid_to)?,
            &[500],
        );
        assert!(matches!(token.verify(&alice, &shifted), Err(CashError::MintMismatch(_))));

        // same window, different series
        let other_series = BlsMint::new(
            MintParameters::new(p.instrument_definition_id, p.series + 1, p.valid_from, p.valid_to)?,
            &[500],
        );
        assert!(matches!(token.verify(&alice, &other_series), Err(CashError::MintMismatch(_))));

        // matching parameters but different keys
        let impostor = BlsMint::new(p, &[500]);
        assert!(!token.verify(&alice, &impostor)?);

        assert_eq!(token.state(), TokenState::Spendable);
        Ok(())
    }

    #[test]
    fn verify_rejects_expired_tokens() -> Result<()> {
        let now = Utc::now();
        let expired = BlsMint::new(
            MintParameters::new(
                Identifier::digest(b"usd"),
                1,
                now - Duration::days(10),
                now - Duration::days(1),
            )?,
            &[500],
        );
        let alice: Owner = Nym::generate().into();
        let token = spendable(&expired, &alice)?;
        assert!(!token.verify_current_date());
        assert!(matches!(token.verify(&alice, &expired), Err(CashError::PolicyViolation(_))));
        Ok(())
    }

    #[test]
    fn verify_requires_spendable() -> Result<()> {
        let mint = mint();
        let alice: Owner = Nym::generate().into();
        let token = request(&mint, 1)?;
        assert!(matches!(token.verify(&alice, &mint), Err(CashError::WrongState { .. })));

        let mut token = spendable(&mint, &alice)?;
        token.mark_verified()?;
        assert!(matches!(token.verify(&alice, &mint), Err(CashError::WrongState { .. })));
        assert!(matches!(token.mark_verified(), Err(CashError::WrongState { .. })));
        Ok(())
    }

    struct BrokenLedger;

    impl SpentLedger for BrokenLedger {
        fn exists(&self, _: &LedgerKey) -> std::result::Result<bool, LedgerError> {
            Err(LedgerError::Unavailable("disk on fire".into()))
        }

        fn conditional_insert(
            &self,
            _: &LedgerKey,
            _: &[u8],
        ) -> std::result::Result<InsertOutcome, LedgerError> {
            Err(LedgerError::Unavailable("disk on fire".into()))
        }
    }

    #[test]
    fn storage_errors_count_as_spent() -> Result<()> {
        let mint = mint();
        let alice: Owner = Nym::generate().into();
        let token = spendable(&mint, &alice)?;

        let coin = token.spendable_contents(&alice)?;
        assert!(token.is_already_spent(&BrokenLedger, &coin));
        assert!(token.is_already_spent(&BrokenLedger, b"anything"));
        assert!(token.is_already_spent(&BrokenLedger, b""));
        assert!(matches!(
            token.record_as_spent(&BrokenLedger, b"anything"),
            Err(CashError::Ledger(_))
        ));
        Ok(())
    }

    #[test]
    fn record_is_write_once() -> Result<()> {
        let mint = mint();
        let alice: Owner = Nym::generate().into();
        let token = spendable(&mint, &alice)?;
        let coin = token.spendable_contents(&alice)?;
        let ledger = MemoryLedger::new();

        assert!(!token.is_already_spent(&ledger, &coin));
        token.record_as_spent(&ledger, &coin)?;
        assert!(token.is_already_spent(&ledger, &coin));
        assert!(matches!(
            token.record_as_spent(&ledger, &coin),
            Err(CashError::AlreadySpent(_))
        ));

        let blob = ledger.get(&digest_key(&coin, token.spent_scope())).unwrap();
        assert!(String::from_utf8(blob).unwrap().starts_with("-----BEGIN SIGNED BLS CASH TOKEN-----"));
        Ok(())
    }

    #[test]
    fn private_prototokens_only_when_asked() -> Result<()> {
        let mint = mint();
        let token = request(&mint, 2)?;

        let mut public_copy = Token::new(Arc::new(BlsScheme), Identifier::default(), Identifier::default());
        public_copy.load(&Armored::decode(&token.to_armored()?)?.body)?;
        assert_eq!(public_copy.state(), TokenState::Proto);
        assert_eq!(public_copy.public_prototokens(), token.public_prototokens());
        assert!(public_copy.private_prototoken(0).is_none());

        let mut own_copy = public_copy.clone();
        own_copy.load(&Armored::decode(&token.to_armored_with_private()?)?.body)?;
        assert_eq!(own_copy.private_prototoken(1), token.private_prototoken(1));
        Ok(())
    }

    fn load_json(json: &str) -> (Token, Result<()>) {
        let mut token = Token::new(Arc::new(BlsScheme), Identifier::default(), Identifier::default());
        let result = token.load(json.as_bytes());
        (token, result)
    }

    const HEADER: &str = r#""version":"1.0","denomination":5,"instrument_definition_id":"0000000000000000000000000000000000000000000000000000000000000000","notary_id":"0000000000000000000000000000000000000000000000000000000000000000","series":1,"valid_from":0,"valid_to":100"#;

    #[test]
    fn malformed_documents_land_in_error() {
        let cases = [
            "not json".to_string(),
            format!(r#"{{{},"state":"mysteryToken"}}"#, HEADER),
            format!(r#"{{{},"state":"errorToken"}}"#, HEADER),
            // count disagrees with the prototokens present
            format!(r#"{{{},"state":"protoToken","protopurse":{{"count":3,"prototokens":["AQ=="]}}}}"#, HEADER),
            // chosen index out of range
            format!(r#"{{{},"state":"signedToken","signature":"AQ==","protopurse":{{"count":1,"chosen_index":1}}}}"#, HEADER),
            // both representations at once
            format!(r#"{{{},"state":"protoToken","spendable":"AQ==","protopurse":{{"count":1,"prototokens":["AQ=="]}}}}"#, HEADER),
            // spendable without payload
            format!(r#"{{{},"state":"spendableToken"}}"#, HEADER),
            // empty field
            format!(r#"{{{},"state":"spendableToken","spendable":""}}"#, HEADER),
        ];
        for json in cases.iter() {
            let (token, result) = load_json(json);
            assert!(matches!(result, Err(CashError::MalformedInput(_))), "{}", json);
            assert_eq!(token.state(), TokenState::Error, "{}", json);
        }
    }

    #[test]
    fn error_token_does_not_load_again() {
        let (mut token, result) = load_json("not json");
        assert!(result.is_err());
        assert_eq!(token.state(), TokenState::Error);

        let blank = format!(r#"{{{},"state":"blankToken"}}"#, HEADER);
        assert!(matches!(
            token.load(blank.as_bytes()),
            Err(CashError::WrongState { .. })
        ));
        assert_eq!(token.state(), TokenState::Error);
    }

    #[test]
    fn bad_body_poisons_a_spendable_token() -> Result<()> {
        let mint = mint();
        let alice: Owner = Nym::generate().into();
        let mut token = spendable(&mint, &alice)?;
        assert!(token.spendable_payload().is_some());

        let bad = format!(r#"{{{},"state":"spendableToken"}}"#, HEADER);
        assert!(matches!(
            token.load(bad.as_bytes()),
            Err(CashError::MalformedInput(_))
        ));
        assert_eq!(token.state(), TokenState::Error);
        assert!(token.spendable_payload().is_none());
        assert!(token.spendable_contents(&alice).is_err());
        Ok(())
    }

    #[test]
    fn well_formed_signed_document_loads() {
        let json = format!(
            r#"{{{},"state":"signedToken","signature":"AQ==","protopurse":{{"count":2,"chosen_index":1}}}}"#,
            HEADER
        );
        let (token, result) = load_json(&json);
        assert!(result.is_ok());
        assert_eq!(token.state(), TokenState::Signed);
        assert_eq!(token.chosen_index(), Some(1));
        assert_eq!(token.token_count(), 2);
        assert_eq!(token.signature(), Some(&[1u8][..]));
    }
}
