//! Request parameters and the signed `client_secret`.
//!
//! ESIA does not accept a static client secret. Every authorization and token
//! request carries a detached signature over `scope + timestamp + client_id +
//! state`, base64url-encoded without padding.

use std::collections::BTreeMap;
use std::fmt::Display;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Local, TimeZone};
use miette::Diagnostic;
use thiserror::Error;

use crate::oauth::SecretAugmenter;
use crate::signer::{SignError, Signer};

/// Request parameters by name. Ordered so that encoded requests are deterministic.
pub type Parameters = BTreeMap<String, String>;

pub const SCOPE: &str = "scope";
pub const TIMESTAMP: &str = "timestamp";
pub const CLIENT_ID: &str = "client_id";
pub const STATE: &str = "state";
pub const CLIENT_SECRET: &str = "client_secret";

/// Fields of the signed message, in signing order.
pub const SIGNED_FIELDS: [&str; 4] = [SCOPE, TIMESTAMP, CLIENT_ID, STATE];

/// `YYYY.MM.DD HH:MM:SS ±HHMM`
pub const TIMESTAMP_FORMAT: &str = "%Y.%m.%d %H:%M:%S %z";

#[derive(Debug, Error, Diagnostic)]
pub enum ParameterError {
    #[error("`{0}` parameter is required for signing")]
    #[diagnostic(
        code(esia_oauth::params::missing),
        help("scope, timestamp, client_id and state must all be present and non-empty")
    )]
    Missing(&'static str),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Sign(#[from] SignError),
}

pub type Result<T> = core::result::Result<T, ParameterError>;

/// Render a timestamp the way the ESIA verifier expects it inside the signed message.
pub fn format_timestamp<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Current local time in [`TIMESTAMP_FORMAT`].
pub fn timestamp_now() -> String {
    format_timestamp(&Local::now())
}

/// The four fields that make up the signed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningRequest<'a> {
    pub scope: &'a str,
    pub timestamp: &'a str,
    pub client_id: &'a str,
    pub state: &'a str,
}

impl<'a> SigningRequest<'a> {
    pub fn from_parameters(params: &'a Parameters) -> Result<Self> {
        let field = |name: &'static str| {
            params
                .get(name)
                .map(String::as_str)
                .filter(|value| !value.is_empty())
                .ok_or(ParameterError::Missing(name))
        };
        Ok(Self {
            scope: field(SCOPE)?,
            timestamp: field(TIMESTAMP)?,
            client_id: field(CLIENT_ID)?,
            state: field(STATE)?,
        })
    }

    /// Concatenation without separators. The order is fixed by the remote verifier.
    pub fn message(&self) -> String {
        [self.scope, self.timestamp, self.client_id, self.state].concat()
    }
}

/// Computes `client_secret` for a parameter set.
#[derive(Debug, Clone)]
pub struct ParameterSigner<S> {
    signer: S,
}

impl<S: Signer> ParameterSigner<S> {
    pub fn new(signer: S) -> Self {
        Self { signer }
    }

    pub fn signer(&self) -> &S {
        &self.signer
    }

    /// Returns `params` with `client_secret` added or replaced. Nothing else changes.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub fn sign(&self, mut params: Parameters) -> Result<Parameters> {
        let message = SigningRequest::from_parameters(&params)?.message();
        let signature = self.signer.sign(message.as_bytes())?;
        params.insert(CLIENT_SECRET.to_owned(), URL_SAFE_NO_PAD.encode(signature));
        Ok(params)
    }
}

impl<S: Signer> SecretAugmenter for ParameterSigner<S> {
    fn augment(&self, params: Parameters) -> Result<Parameters> {
        self.sign(params)
    }
}
