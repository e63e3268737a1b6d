//! Refresh credential sources

use async_trait::async_trait;

use crate::coordinator::RefreshError;
use crate::credentials::Credential;

#[cfg(feature = "oauth2")]
pub mod oauth2;

/// The operation that exchanges the current credential pair for a fresh one
///
/// Supplied by the application; the coordinator invokes it at most once per
/// refresh cycle and never concurrently with itself, so implementations need
/// not be reentrant-safe.
///
/// Implementations classify their own failures via [`RefreshError`]:
/// transient failures (the network hiccuped, the authority returned a server
/// error) leave the coordinator willing to try again on the next
/// authentication failure, while permanent ones (the refresh credential was
/// rejected or revoked) park it until reset. Any retry or backoff of the
/// refresh call itself belongs in the implementation or its transport, not
/// in the coordinator.
#[async_trait]
pub trait RefreshCredentialSource: Send + Sync {
    /// Exchanges `current` for a fresh credential pair
    ///
    /// `current` is whatever the credential store held when the refresh
    /// began, or `None` if no session was established.
    async fn refresh(&mut self, current: Option<Credential>) -> Result<Credential, RefreshError>;
}

/// A source that always hands back the same credential pair
///
/// Useful as a stand-in in tests and documentation.
#[derive(Clone, Debug)]
pub struct ConstCredentialSource {
    credential: Credential,
}

impl ConstCredentialSource {
    /// Constructs a source that always yields `credential`
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl RefreshCredentialSource for ConstCredentialSource {
    async fn refresh(&mut self, _: Option<Credential>) -> Result<Credential, RefreshError> {
        Ok(self.credential.clone())
    }
}
