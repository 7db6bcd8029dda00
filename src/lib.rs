//! Anonymous bearer cash built on BLS blind signatures.
//!
//! A client asks a [`Mint`] to sign one of several blinded candidates, then
//! unblinds the signature into a coin the mint has never seen. Coins are
//! sealed to an [`Owner`], passed around as armored [`Token`]s and checked
//! against a [`SpentLedger`] when redeemed.

mod armor;
mod blind_sigs;
mod config;
mod error;
mod factory;
mod identifier;
mod ledger;
mod mint;
mod owner;
mod scheme;
mod shares;
mod token;
mod utils;

pub use crate::armor::{first_line, label_of, Armored};
pub use crate::blind_sigs::{
    BlindSigner, BlsScheme, Coin, Envelope, SignedEnvelope, Slip, SlipPreparer, BLS_DISCRIMINANT,
    GENERIC_DISCRIMINANT,
};
pub use crate::config::{CashConfig, IssuancePolicy, LedgerConfig, DEFAULT_MINIMUM_PROTOTOKEN_COUNT};
pub use crate::error::{CashError, Error, Result};
pub use crate::factory::TokenFactory;
pub use crate::identifier::Identifier;
pub use crate::ledger::{
    digest_key, FileLedger, InsertOutcome, LedgerError, LedgerKey, MemoryLedger, SpentLedger,
    SpentScope,
};
pub use crate::mint::{whole_seconds, BlsMint, Mint, MintParameters, Timestamp};
pub use crate::owner::{Nym, Owner, SymmetricKey};
pub use crate::scheme::{BlindingScheme, Candidate};
pub use crate::shares::{BlindSignerShare, SignedEnvelopeShare, ThresholdMint};
pub use crate::token::{Token, TokenState, TOKEN_VERSION};
