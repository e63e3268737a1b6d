//! DTOs for the token endpoint exchange

use serde::{Deserialize, Serialize};

use crate::{AccessToken, ClientIdRef, ClientSecretRef, RefreshToken, RefreshTokenRef};

#[derive(Debug, Serialize)]
pub(super) struct RefreshTokenRequest<'a> {
    pub grant_type: &'static str,
    pub client_id: &'a ClientIdRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<&'a ClientSecretRef>,
    pub refresh_token: &'a RefreshTokenRef,
}

/// The token endpoint's successful response body
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// The new access token
    pub access_token: AccessToken,

    /// The rotated refresh token, when the authority rotates them
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,

    /// Advisory lifetime of the access token, in seconds
    ///
    /// Carried for completeness of the wire shape; credential lifetimes are
    /// not interpreted here.
    #[serde(default)]
    pub expires_in: Option<u64>,
}
