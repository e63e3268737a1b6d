//! Middleware that keeps outgoing requests authenticated, renewing the
//! credential at most once in flight
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include a [`CredentialRefreshMiddleware`] in the middleware stack. Each
//! outbound request gets the current access token from the coordinator's
//! [`CredentialStore`](tokenflight::CredentialStore). If the backend answers
//! `401 Unauthorized`, the middleware reports the failure to its
//! [`RefreshCoordinator`]: the first request to do so triggers the one
//! refresh, every other rejected request waits for that same refresh, and
//! each is replayed once with the renewed token. A request that is rejected
//! again after its replay is returned as-is rather than renewing a second
//! time.
//!
//! If a request already carries an `Authorization` header, the middleware
//! leaves it alone and does not attempt renewal for that request.
//!
//! ```
//! use std::sync::Arc;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use tokenflight::{
//!     sources::ConstCredentialSource, AccessToken, Credential, InMemoryCredentialStore,
//!     RefreshCoordinator, RefreshToken,
//! };
//! use tokenflight_reqwest::CredentialRefreshMiddleware;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let store = Arc::new(InMemoryCredentialStore::with_credential(Credential::new(
//!     AccessToken::from_static("tok1"),
//!     RefreshToken::from_static("rt1"),
//! )));
//! let renewed = Credential::new(
//!     AccessToken::from_static("tok2"),
//!     RefreshToken::from_static("rt2"),
//! );
//! let coordinator = RefreshCoordinator::new(ConstCredentialSource::new(renewed), store);
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(CredentialRefreshMiddleware::new(coordinator))
//!     .build();
//!
//! let req = client
//!     .get("https://example.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! The middleware can be configured to handle only some requests. By default
//! tokens are only sent over HTTPS; provide a custom predicate to loosen or
//! tighten that.
//!
//! ```no_run
//! use predicates::prelude::PredicateBooleanExt;
//! use tokenflight_reqwest::{CredentialRefreshMiddleware, ExactHostMatch, HttpsOnly};
//! # use std::sync::Arc;
//! # use tokenflight::{sources::ConstCredentialSource, AccessToken, Credential, InMemoryCredentialStore, RefreshCoordinator, RefreshToken};
//! # let coordinator = RefreshCoordinator::new(
//! #     ConstCredentialSource::new(Credential::new(AccessToken::from_static("t"), RefreshToken::from_static("r"))),
//! #     Arc::new(InMemoryCredentialStore::new()),
//! # );
//!
//! CredentialRefreshMiddleware::new(coordinator)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("api.example.com")));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Error, Middleware, Next, Result};
use tokenflight::sources::RefreshCredentialSource;
use tokenflight::{AccessTokenRef, RefreshCoordinator};

/// A middleware that authenticates outgoing requests and coordinates
/// credential renewal when they are rejected
pub struct CredentialRefreshMiddleware<S, P = HttpsOnly> {
    coordinator: RefreshCoordinator<S>,
    predicate: P,
}

impl<S> CredentialRefreshMiddleware<S, HttpsOnly> {
    /// Constructs a new middleware around a refresh coordinator
    ///
    /// By default, this middleware only touches requests being sent via
    /// HTTPS. To change this behavior, provide a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(coordinator: RefreshCoordinator<S>) -> Self {
        Self {
            coordinator,
            predicate: HttpsOnly,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> CredentialRefreshMiddleware<S, P> {
        CredentialRefreshMiddleware {
            coordinator: self.coordinator,
            predicate,
        }
    }
}

impl<S, P: Clone> Clone for CredentialRefreshMiddleware<S, P> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<S, P: fmt::Debug> fmt::Debug for CredentialRefreshMiddleware<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CredentialRefreshMiddleware")
            .field("coordinator", &self.coordinator)
            .field("predicate", &self.predicate)
            .finish()
    }
}

fn bearer_header(token: &AccessTokenRef) -> Option<header::HeaderValue> {
    let mut value = BytesMut::with_capacity(token.as_str().len() + 7);
    value.put_slice(b"Bearer ");
    value.put_slice(token.as_str().as_bytes());
    match header::HeaderValue::from_maybe_shared(value) {
        Ok(mut value) => {
            value.set_sensitive(true);
            Some(value)
        }
        Err(_) => {
            tracing::warn!("access token contains bytes not valid in a header; not attaching");
            None
        }
    }
}

#[async_trait::async_trait]
impl<S, P> Middleware for CredentialRefreshMiddleware<S, P>
where
    S: RefreshCredentialSource + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) {
            return next.run(req, extensions).await;
        }

        if req.headers().get(header::AUTHORIZATION).is_some() {
            // The caller supplied its own authorization; not ours to renew.
            return next.run(req, extensions).await;
        }

        let Some(credential) = self.coordinator.credential_store().get() else {
            return next.run(req, extensions).await;
        };

        if let Some(value) = bearer_header(credential.access_token()) {
            req.headers_mut().insert(header::AUTHORIZATION, value);
        }

        // Cloned before the send; a request with a streaming body cannot be
        // replayed.
        let replay = req.try_clone();
        let retry_next = next.clone();

        let response = next.run(req, extensions).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(mut replay) = replay else {
            tracing::debug!("rejected request has a non-replayable body; returning the 401");
            return Ok(response);
        };

        tracing::debug!(url = %replay.url(), "request rejected; coordinating credential renewal");

        let replayed = self
            .coordinator
            .handle_auth_failure(move |renewed| {
                if let Some(value) = bearer_header(renewed.access_token()) {
                    replay.headers_mut().insert(header::AUTHORIZATION, value);
                }
                // The replay runs only the remainder of the stack, so a
                // second rejection comes back as-is instead of renewing
                // again.
                retry_next.run(replay, extensions)
            })
            .await;

        match replayed {
            Ok(result) => result,
            Err(error) => Err(Error::Middleware(anyhow::Error::new(error))),
        }
    }
}

/// Only handle a request if it is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only handle a request if it is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;
    use tokenflight::sources::ConstCredentialSource;
    use tokenflight::{
        AccessToken, Credential, CredentialStore, InMemoryCredentialStore, RefreshCoordinator,
        RefreshError, RefreshToken,
    };

    use super::*;

    fn credential(access: &str, refresh: &str) -> Credential {
        Credential::new(
            AccessToken::new(access.to_owned()),
            RefreshToken::new(refresh.to_owned()),
        )
    }

    /// Stands in for the protected backend: accepts exactly one bearer
    /// token, rejects everything else with a 401, and never touches the
    /// network.
    struct FakeBackend {
        accepts: String,
        hits: AtomicUsize,
    }

    impl FakeBackend {
        fn new(token: &str) -> Arc<Self> {
            Arc::new(Self {
                accepts: format!("Bearer {token}"),
                hits: AtomicUsize::new(0),
            })
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::Acquire)
        }
    }

    #[async_trait::async_trait]
    impl Middleware for FakeBackend {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            self.hits.fetch_add(1, Ordering::AcqRel);

            let authorized = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(|value| value == self.accepts)
                .unwrap_or(false);

            if authorized {
                Ok(http::Response::<&[u8]>::default().into())
            } else {
                Ok(http::Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .body(&b""[..])
                    .unwrap()
                    .into())
            }
        }
    }

    /// A source whose invocations the test can count.
    struct CountingSource {
        inner: ConstCredentialSource,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl RefreshCredentialSource for CountingSource {
        async fn refresh(
            &mut self,
            current: Option<Credential>,
        ) -> std::result::Result<Credential, RefreshError> {
            self.calls.fetch_add(1, Ordering::AcqRel);
            self.inner.refresh(current).await
        }
    }

    struct Setup {
        store: Arc<InMemoryCredentialStore>,
        coordinator: RefreshCoordinator<CountingSource>,
        refresh_calls: Arc<AtomicUsize>,
    }

    fn setup(stored: &str, renewed: &str) -> Setup {
        let store = Arc::new(InMemoryCredentialStore::with_credential(credential(
            stored, "rt1",
        )));
        let refresh_calls = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            inner: ConstCredentialSource::new(credential(renewed, "rt2")),
            calls: Arc::clone(&refresh_calls),
        };
        let coordinator = RefreshCoordinator::new(source, store.clone());
        Setup {
            store,
            coordinator,
            refresh_calls,
        }
    }

    mod when_the_backend_accepts_the_current_token {
        use super::*;

        #[tokio::test]
        async fn the_request_is_sent_once_with_the_stored_token() {
            let s = setup("tok1", "tok2");
            let backend = FakeBackend::new("tok1");

            let client = ClientBuilder::new(Client::default())
                .with(CredentialRefreshMiddleware::new(s.coordinator.clone()))
                .with_arc(backend.clone())
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(backend.hits(), 1);
            assert_eq!(s.refresh_calls.load(Ordering::Acquire), 0);
        }
    }

    mod when_the_backend_rejects_the_current_token {
        use super::*;

        #[tokio::test]
        async fn the_request_is_replayed_once_with_the_renewed_token() {
            let s = setup("tok1", "tok2");
            let backend = FakeBackend::new("tok2");

            let client = ClientBuilder::new(Client::default())
                .with(CredentialRefreshMiddleware::new(s.coordinator.clone()))
                .with_arc(backend.clone())
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(backend.hits(), 2);
            assert_eq!(s.refresh_calls.load(Ordering::Acquire), 1);
            assert_eq!(s.store.get(), Some(credential("tok2", "rt2")));
        }

        #[tokio::test]
        async fn a_rejected_replay_is_returned_as_is() {
            let s = setup("tok1", "tok2");
            // The backend accepts neither the stored nor the renewed token.
            let backend = FakeBackend::new("something-else");

            let client = ClientBuilder::new(Client::default())
                .with(CredentialRefreshMiddleware::new(s.coordinator.clone()))
                .with_arc(backend.clone())
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(backend.hits(), 2);
            assert_eq!(s.refresh_calls.load(Ordering::Acquire), 1);
        }
    }

    mod when_the_renewal_itself_fails {
        use super::*;

        struct RevokedSource;

        #[async_trait::async_trait]
        impl RefreshCredentialSource for RevokedSource {
            async fn refresh(
                &mut self,
                _: Option<Credential>,
            ) -> std::result::Result<Credential, RefreshError> {
                Err(RefreshError::permanent("revoked"))
            }
        }

        #[tokio::test]
        async fn the_renewal_error_is_surfaced() {
            let store = Arc::new(InMemoryCredentialStore::with_credential(credential(
                "tok1", "rt1",
            )));
            let coordinator = RefreshCoordinator::new(RevokedSource, store);
            let backend = FakeBackend::new("tok2");

            let client = ClientBuilder::new(Client::default())
                .with(CredentialRefreshMiddleware::new(coordinator))
                .with_arc(backend.clone())
                .build();

            let error = client
                .get("https://example.com")
                .send()
                .await
                .expect_err("expected renewal failure to surface");

            assert!(matches!(error, Error::Middleware(_)));
            assert_eq!(backend.hits(), 1);
        }
    }

    mod when_the_request_already_carries_authorization {
        use super::*;

        #[tokio::test]
        async fn the_existing_header_is_left_alone_and_never_renewed() {
            let s = setup("tok1", "tok2");
            let backend = FakeBackend::new("caller-token");

            let client = ClientBuilder::new(Client::default())
                .with(CredentialRefreshMiddleware::new(s.coordinator.clone()))
                .with_arc(backend.clone())
                .build();

            let resp = client
                .get("https://example.com")
                .bearer_auth("caller-token")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(backend.hits(), 1);
            assert_eq!(s.refresh_calls.load(Ordering::Acquire), 0);
        }
    }

    mod when_the_predicate_does_not_match {
        use super::*;

        #[tokio::test]
        async fn no_token_is_attached_and_no_renewal_happens() {
            let s = setup("tok1", "tok2");
            // An unauthenticated request over plain HTTP gets a 401 back
            // untouched.
            let backend = FakeBackend::new("tok1");

            let client = ClientBuilder::new(Client::default())
                .with(CredentialRefreshMiddleware::new(s.coordinator.clone()))
                .with_arc(backend.clone())
                .build();

            let resp = client.get("http://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(backend.hits(), 1);
            assert_eq!(s.refresh_calls.load(Ordering::Acquire), 0);
        }
    }

    mod when_the_store_is_empty {
        use super::*;

        #[tokio::test]
        async fn the_request_passes_through_without_renewal() {
            let store = Arc::new(InMemoryCredentialStore::new());
            let coordinator = RefreshCoordinator::new(
                CountingSource {
                    inner: ConstCredentialSource::new(credential("tok2", "rt2")),
                    calls: Arc::new(AtomicUsize::new(0)),
                },
                store,
            );
            let backend = FakeBackend::new("tok1");

            let client = ClientBuilder::new(Client::default())
                .with(CredentialRefreshMiddleware::new(coordinator))
                .with_arc(backend.clone())
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(backend.hits(), 1);
        }
    }

    mod https_only_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_https_scheme() {
            let request =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            assert!(HttpsOnly.eval(&request));
        }

        #[test]
        fn does_not_match_when_request_has_http_scheme() {
            let request = Request::new(reqwest::Method::GET, "http://example.com".parse().unwrap());
            assert!(!HttpsOnly.eval(&request));
        }
    }

    mod exact_host_match_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_same_host() {
            let request =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            assert!(ExactHostMatch::new("example.com").eval(&request));
        }

        #[test]
        fn does_not_match_when_request_has_different_host() {
            let request = Request::new(
                reqwest::Method::GET,
                "https://does-not-match.com".parse().unwrap(),
            );
            assert!(!ExactHostMatch::new("example.com").eval(&request));
        }
    }
}
