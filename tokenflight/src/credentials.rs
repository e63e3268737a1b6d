//! Credential pairs and the storage boundary

use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use crate::{AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef};

/// An opaque access/refresh credential pair as issued by the authority
///
/// The pair is treated as a unit: a successful refresh replaces both halves
/// at once, and consumers never observe an access token from one generation
/// alongside a refresh token from another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    access_token: AccessToken,
    refresh_token: RefreshToken,
}

impl Credential {
    /// Constructs a credential pair
    pub fn new(access_token: AccessToken, refresh_token: RefreshToken) -> Self {
        Self {
            access_token,
            refresh_token,
        }
    }

    /// The access token presented on ordinary requests
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// The refresh token exchanged when the access token stops working
    #[inline]
    pub fn refresh_token(&self) -> &RefreshTokenRef {
        &self.refresh_token
    }

    /// Decomposes the pair
    pub fn into_parts(self) -> (AccessToken, RefreshToken) {
        (self.access_token, self.refresh_token)
    }
}

/// Where the application keeps the current credential pair
///
/// The coordinator reads the store when it starts a refresh and writes it
/// exactly once per successful refresh. Implementations are expected to be
/// cheap in-process cells; anything durable should sit behind one.
pub trait CredentialStore: Send + Sync {
    /// The current credential pair, if a session is established
    fn get(&self) -> Option<Credential>;

    /// Replaces the current credential pair
    fn set(&self, credential: Credential);

    /// Discards the current credential pair
    fn clear(&self);
}

/// A process-local credential store
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    slot: RwLock<Option<Credential>>,
}

impl InMemoryCredentialStore {
    /// Constructs an empty in-memory store
    pub const fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// Constructs a store already holding a credential pair
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            slot: RwLock::new(Some(credential)),
        }
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn get(&self) -> Option<Credential> {
        // Writers never panic while holding the lock, so a poisoned slot is
        // still coherent.
        self.slot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set(&self, credential: Credential) {
        *self
            .slot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(credential);
    }

    fn clear(&self) {
        *self
            .slot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}
