//! DAPS token boundary.
//!
//! The Dynamic Attribute Provisioning Service issues and verifies the
//! signed identity tokens (DATs) both connectors exchange during the
//! handshake. Token format and trust model are entirely the service's
//! business; this engine only asks for a token and for a remaining-validity
//! judgment on the peer's.

use idscp_proto::RequirementFlags;

/// Errors from the token service boundary.
#[derive(Debug, thiserror::Error)]
pub enum DapsError {
    /// No token could be obtained for this connector.
    #[error("token acquisition failed: {0}")]
    Acquisition(String),

    /// The peer's token could not be evaluated.
    #[error("token verification failed: {0}")]
    Verification(String),
}

/// Named requirement attributes checked against the peer's token claims.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityRequirements {
    /// Attribute flags the peer's token must cover.
    pub required: RequirementFlags,
}

/// Consumed DAPS interface.
pub trait DapsDriver: Send + Sync {
    /// Obtain this connector's current DAT.
    fn get_token(&self) -> Result<Vec<u8>, DapsError>;

    /// Verify a peer's DAT against local requirements.
    ///
    /// Returns the token's remaining validity in seconds. A non-positive
    /// value means the token is not acceptable; callers route that into the
    /// handshake's error path.
    fn verify_token(
        &self,
        token: &[u8],
        requirements: &SecurityRequirements,
    ) -> Result<i64, DapsError>;
}

/// Fixed-token DAPS stand-in for tests and local development.
#[derive(Debug, Clone)]
pub struct StaticDaps {
    token: Vec<u8>,
    validity_secs: i64,
}

impl StaticDaps {
    /// A DAPS that hands out `token` and judges every peer token valid for
    /// `validity_secs` seconds.
    #[must_use]
    pub fn new(token: impl Into<Vec<u8>>, validity_secs: i64) -> Self {
        Self { token: token.into(), validity_secs }
    }

    /// A DAPS that accepts everything for an hour.
    #[must_use]
    pub fn accepting() -> Self {
        Self::new(b"static-dat".to_vec(), 3600)
    }

    /// A DAPS that rejects every peer token.
    #[must_use]
    pub fn rejecting() -> Self {
        Self::new(b"static-dat".to_vec(), 0)
    }
}

impl DapsDriver for StaticDaps {
    fn get_token(&self) -> Result<Vec<u8>, DapsError> {
        Ok(self.token.clone())
    }

    fn verify_token(
        &self,
        token: &[u8],
        _requirements: &SecurityRequirements,
    ) -> Result<i64, DapsError> {
        if token.is_empty() {
            return Err(DapsError::Verification("empty token".to_owned()));
        }
        Ok(self.validity_secs)
    }
}
