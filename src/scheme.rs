use crate::error::Result;
use std::fmt;

/// One blinded candidate value together with the secret that unblinds it.
///
/// `public` goes to the mint. `private` never leaves the client.
#[derive(Clone)]
pub struct Candidate {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("public", &self.public.len())
            .finish()
    }
}

/// The capability set a blind-signature algorithm has to provide.
///
/// New algorithms are added by implementing this trait and registering the
/// implementation with a [`TokenFactory`](crate::TokenFactory). The token
/// state machine and the spent ledger never look inside the byte strings
/// passing through here.
pub trait BlindingScheme: Send + Sync + fmt::Debug {
    /// Armor label written on the first line of serialized tokens.
    fn discriminant(&self) -> &'static str;

    /// Older labels that still load with this scheme.
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    fn generate_candidate(&self) -> Result<Candidate>;

    fn generate_candidates(&self, count: usize) -> Result<Vec<Candidate>> {
        (0..count).map(|_| self.generate_candidate()).collect()
    }

    /// Turn the mint's signature on a blinded candidate into the cleartext
    /// coin, using that candidate's private half.
    fn unblind(&self, signature: &[u8], private_prototoken: &[u8]) -> Result<Vec<u8>>;

    /// Check a cleartext coin against the mint's public key for its
    /// denomination. `Ok(false)` means well formed but not signed by that key.
    fn verify(&self, cleartext: &[u8], public_key: &[u8]) -> Result<bool>;
}
