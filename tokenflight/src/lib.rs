//! Single-flight coordination of credential refreshes for HTTP clients
//!
//! When an access credential expires, every request that was in flight with it
//! tends to fail at once. The naive reaction is for each failed request to call
//! the refresh endpoint itself, which stampedes the authority and, when refresh
//! tokens rotate, loses the race: the second refresh call presents an
//! already-rotated token and is rejected outright.
//!
//! This library centralizes that reaction in a [`RefreshCoordinator`]. The
//! first request to report an authentication failure starts exactly one
//! refresh; every request that fails while that refresh is outstanding is
//! suspended in a FIFO queue instead of triggering another one. When the
//! refresh settles, every suspended request is resumed with the same outcome:
//! replayed with the one new credential on success, or failed with the one
//! refresh error. A refresh credential that the authority rejects outright
//! parks the coordinator so that subsequent failures fail fast instead of
//! hammering a revoked credential, until the owning application re-establishes
//! a session and calls [`RefreshCoordinator::reset`].
//!
//! # General Flow
//!
//! Construct a coordinator from a [`RefreshCredentialSource`][sources::RefreshCredentialSource]
//! (the operation that exchanges the current refresh credential for a new
//! pair) and a [`CredentialStore`] (wherever your application keeps the
//! current pair). When the HTTP pipeline observes an authentication failure,
//! it hands the coordinator a retry closure; the closure runs only if the
//! refresh succeeds, and receives the renewed credential.
//!
//! ```
//! use std::sync::Arc;
//! use tokenflight::{
//!     sources::ConstCredentialSource, AccessToken, Credential, InMemoryCredentialStore,
//!     RefreshCoordinator, RefreshToken,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(InMemoryCredentialStore::new());
//! let renewed = Credential::new(
//!     AccessToken::from_static("tok2"),
//!     RefreshToken::from_static("rt2"),
//! );
//! let coordinator = RefreshCoordinator::new(ConstCredentialSource::new(renewed), store);
//!
//! let replayed_with = coordinator
//!     .handle_auth_failure(|credential| async move {
//!         // re-issue the failed request using `credential` here
//!         credential.access_token().to_owned()
//!     })
//!     .await
//!     .unwrap();
//!
//! assert_eq!(replayed_with.as_str(), "tok2");
//! # }
//! ```
//!
//! # Features
//!
//! * `oauth2` (default): provides [`sources::oauth2::RefreshTokenSource`], a
//!   refresh source that performs the OAuth2 _refresh token_ flow against a
//!   token endpoint and follows refresh token rotation.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod coordinator;
mod credentials;
mod queue;
pub mod sources;

pub use braids::*;
pub use coordinator::{
    CoordinatorQuit, RefreshCoordinator, RefreshError, RefreshState, RenewalError, RenewalOutcome,
    RenewalTicket,
};
pub use credentials::{Credential, CredentialStore, InMemoryCredentialStore};
pub use queue::CancellationHandle;
