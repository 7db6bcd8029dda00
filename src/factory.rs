use crate::armor::{label_of, Armored};
use crate::blind_sigs::BlsScheme;
use crate::error::Result;
use crate::identifier::Identifier;
use crate::scheme::BlindingScheme;
use crate::token::Token;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Picks the blinding scheme for a serialized token from its armor label.
#[derive(Debug, Clone)]
pub struct TokenFactory {
    schemes: HashMap<String, Arc<dyn BlindingScheme>>,
}

impl Default for TokenFactory {
    /// A factory that knows the BLS scheme.
    fn default() -> Self {
        let mut factory = Self::empty();
        factory.register(Arc::new(BlsScheme));
        factory
    }
}

impl TokenFactory {
    pub fn empty() -> Self {
        Self {
            schemes: HashMap::new(),
        }
    }

    /// Register `scheme` under its discriminant and all its aliases.
    pub fn register(&mut self, scheme: Arc<dyn BlindingScheme>) {
        for label in std::iter::once(scheme.discriminant()).chain(scheme.aliases().iter().copied()) {
            if self.schemes.insert(label.to_string(), scheme.clone()).is_some() {
                warn!(label, "replaced registered blinding scheme");
            }
        }
    }

    pub fn scheme(&self, label: &str) -> Option<Arc<dyn BlindingScheme>> {
        self.schemes.get(label).cloned()
    }

    /// A blank token for the scheme named on `first_line`, or `None` when no
    /// registered scheme claims it.
    pub fn instantiate(
        &self,
        first_line: &str,
        notary_id: Identifier,
        instrument_definition_id: Identifier,
    ) -> Option<Token> {
        let label = label_of(first_line).ok()?;
        match self.scheme(label) {
            Some(scheme) => Some(Token::new(scheme, notary_id, instrument_definition_id)),
            None => {
                debug!(label, "no blinding scheme registered");
                None
            }
        }
    }

    /// Parse an armored token. `Ok(None)` means the format is not supported.
    pub fn token_factory(&self, armored: &str) -> Result<Option<Token>> {
        let armored = Armored::decode(armored)?;
        let mut token = match self.scheme(&armored.label) {
            Some(scheme) => Token::new(scheme, Identifier::default(), Identifier::default()),
            None => {
                warn!(label = %armored.label, "unsupported token format");
                return Ok(None);
            }
        };
        token.load(&armored.body)?;
        Ok(Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armor::first_line;
    use crate::blind_sigs::{BLS_DISCRIMINANT, GENERIC_DISCRIMINANT};
    use crate::error::CashError;
    use crate::token::TokenState;

    #[test]
    fn instantiate_by_label() {
        let factory = TokenFactory::default();
        let notary = Identifier::digest(b"notary");

        let token = factory
            .instantiate(&first_line(BLS_DISCRIMINANT), notary, Identifier::default())
            .unwrap();
        assert_eq!(token.state(), TokenState::Blank);
        assert_eq!(token.notary_id(), notary);
        assert_eq!(token.scheme().discriminant(), BLS_DISCRIMINANT);

        let token = factory.instantiate(&first_line(GENERIC_DISCRIMINANT), notary, notary);
        assert_eq!(token.unwrap().scheme().discriminant(), BLS_DISCRIMINANT);

        assert!(factory
            .instantiate(&first_line("SIGNED LUCRE CASH TOKEN"), notary, notary)
            .is_none());
        assert!(factory.instantiate("garbage", notary, notary).is_none());
        assert!(TokenFactory::empty()
            .instantiate(&first_line(BLS_DISCRIMINANT), notary, notary)
            .is_none());
    }

    #[test]
    fn unsupported_format_is_not_an_error() -> Result<()> {
        let armored = Armored::new("SIGNED LUCRE CASH TOKEN", b"{}".to_vec()).encode();
        assert!(TokenFactory::default().token_factory(&armored)?.is_none());
        Ok(())
    }

    #[test]
    fn bad_body_is_malformed() {
        let armored = Armored::new(BLS_DISCRIMINANT, b"{".to_vec()).encode();
        let result = TokenFactory::default().token_factory(&armored);
        assert!(matches!(result, Err(CashError::MalformedInput(_))));
    }
}
