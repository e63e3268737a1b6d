//! A refresh source backed by an OAuth2 token endpoint
//!
//! Performs the _refresh token_ flow: the current refresh token is posted to
//! the token endpoint and exchanged for a new access token, and — when the
//! authority rotates refresh tokens — a new refresh token as well. When no
//! rotated token comes back, the current one is carried forward.

use async_trait::async_trait;
use thiserror::Error;

use super::RefreshCredentialSource;
use crate::coordinator::RefreshError;
use crate::credentials::Credential;
use crate::{ClientId, ClientSecret};

pub mod dto;

/// A refresh credential source using the OAuth2 refresh token flow
#[derive(Debug)]
pub struct RefreshTokenSource {
    client: reqwest::Client,
    token_url: reqwest::Url,
    client_id: ClientId,
    client_secret: Option<ClientSecret>,
}

impl RefreshTokenSource {
    /// Constructs a new refresh token source for a public client
    pub fn new(client: reqwest::Client, token_url: reqwest::Url, client_id: ClientId) -> Self {
        Self {
            client,
            token_url,
            client_id,
            client_secret: None,
        }
    }

    /// Attaches a client secret, for confidential clients
    pub fn with_client_secret(mut self, client_secret: ClientSecret) -> Self {
        self.client_secret = Some(client_secret);
        self
    }

    #[tracing::instrument(
        err,
        skip(self, current),
        fields(
            token_url = %self.token_url,
            client_id = %self.client_id,
        ),
    )]
    async fn exchange(&self, current: Credential) -> Result<Credential, TokenEndpointError> {
        tracing::trace!("exchanging refresh token with authority");

        let payload = dto::RefreshTokenRequest {
            grant_type: "refresh_token",
            client_id: &self.client_id,
            client_secret: self.client_secret.as_deref(),
            refresh_token: current.refresh_token(),
        };

        let resp = self
            .client
            .post(self.token_url.clone())
            .form(&payload)
            .send()
            .await
            .map_err(TokenEndpointError::RequestSend)?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from authority"
        );

        if !status.is_success() {
            let body = resp.text().await.map_err(TokenEndpointError::BodyRead)?;
            return Err(if matches!(status.as_u16(), 400 | 401 | 403) {
                TokenEndpointError::Rejected {
                    status: status.as_u16(),
                    body,
                }
            } else {
                TokenEndpointError::AuthorityUnavailable {
                    status: status.as_u16(),
                    body,
                }
            });
        }

        let body = resp.bytes().await.map_err(TokenEndpointError::BodyRead)?;
        let resp: dto::TokenResponse = serde_json::from_slice(&body)?;

        let refresh_token = match resp.refresh_token {
            Some(rotated) => {
                tracing::info!("authority rotated the refresh token");
                rotated
            }
            None => current.into_parts().1,
        };

        Ok(Credential::new(resp.access_token, refresh_token))
    }
}

#[async_trait]
impl RefreshCredentialSource for RefreshTokenSource {
    async fn refresh(&mut self, current: Option<Credential>) -> Result<Credential, RefreshError> {
        let current = current.ok_or_else(|| {
            RefreshError::permanent(TokenEndpointError::MissingRefreshToken)
        })?;

        self.exchange(current)
            .await
            .map_err(TokenEndpointError::into_refresh_error)
    }
}

/// An error while exchanging a refresh token with the authority
#[derive(Debug, Error)]
pub enum TokenEndpointError {
    /// The authority rejected the refresh request outright
    #[error("authority rejected the refresh request ({status}): {body}")]
    Rejected {
        /// The HTTP status returned by the authority
        status: u16,
        /// The body of the error response
        body: String,
    },

    /// The authority answered, but with a non-client error
    #[error("authority returned an error ({status}): {body}")]
    AuthorityUnavailable {
        /// The HTTP status returned by the authority
        status: u16,
        /// The body of the error response
        body: String,
    },

    /// Unable to send the refresh request to the authority
    #[error("error sending refresh request to authority")]
    RequestSend(#[source] reqwest::Error),

    /// Unable to read the response body
    #[error("error reading response body from authority")]
    BodyRead(#[source] reqwest::Error),

    /// Unable to deserialize the token response
    #[error("error deserializing token response from authority")]
    TokenBody(#[from] serde_json::Error),

    /// There is no refresh token to exchange
    #[error("no refresh credential available to exchange")]
    MissingRefreshToken,
}

impl TokenEndpointError {
    /// Classifies this error for the coordinator's failure policy
    ///
    /// A rejection by the authority means the refresh token is invalid or
    /// revoked and re-trying it cannot help; everything else is worth a
    /// later attempt.
    pub fn into_refresh_error(self) -> RefreshError {
        let permanent = matches!(
            self,
            Self::Rejected { .. } | Self::MissingRefreshToken
        );
        if permanent {
            RefreshError::permanent(self)
        } else {
            RefreshError::transient(self)
        }
    }
}
