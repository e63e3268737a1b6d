use aliri_braid::braid;
use std::fmt;

macro_rules! redacted {
    ($ty:ty: $hidden:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    reveal_prefix(&self.0, &mut *f)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    reveal_prefix(&self.0, &mut *f)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

/// Reveals at most the first few characters of a secret, eliding the rest.
fn reveal_prefix(unprotected: &str, f: &mut fmt::Formatter) -> fmt::Result {
    const KEEP: usize = 8;
    match unprotected.char_indices().nth(KEEP) {
        Some((idx, _)) if idx < unprotected.len() => {
            f.write_str(&unprotected[..idx])?;
            f.write_str("…")
        }
        _ => f.write_str(unprotected),
    }
}

/// A client ID
#[braid(serde)]
pub struct ClientId;

/// A client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

redacted!(ClientSecretRef: "CLIENT SECRET");

/// An access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef: "ACCESS TOKEN");

/// A refresh token
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

redacted!(RefreshTokenRef: "REFRESH TOKEN");
