//! ESIA access tokens: a JWT whose claims carry the person id and granted scopes.

use std::collections::BTreeSet;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::{SmolStr, ToSmolStr, format_smolstr};
use thiserror::Error;

use crate::oauth::{TokenFactory, TokenResponse};

/// Claim holding the ESIA person id (`oid`).
pub const SUBJECT_CLAIM: &str = "urn:esia:sbj_id";

/// Granted scope names, as extracted from the `scope` claim.
pub type ScopeSet = BTreeSet<SmolStr>;

/// Token rejected before any of its claims are trusted.
///
/// Every variant carries the raw token response for diagnostics.
#[derive(Debug, Error, Diagnostic)]
pub enum InvalidTokenError {
    #[error("access token is malformed: {reason}")]
    #[diagnostic(
        code(esia_oauth::token::malformed),
        help("expected a compact JWT: three base64url segments separated by dots")
    )]
    Malformed { reason: SmolStr, raw: String },
    #[error("access token has no `urn:esia:sbj_id` claim")]
    #[diagnostic(code(esia_oauth::token::subject))]
    MissingSubject { raw: String },
    #[error("access token expired at {expired_at}")]
    #[diagnostic(code(esia_oauth::token::expired))]
    Expired {
        expired_at: DateTime<Utc>,
        raw: String,
    },
    #[error("access token is not valid before {not_before}")]
    #[diagnostic(
        code(esia_oauth::token::not_before),
        help("check the local clock against the identity provider")
    )]
    NotYetValid {
        not_before: DateTime<Utc>,
        raw: String,
    },
    #[error("access token was issued in the future ({issued_at})")]
    #[diagnostic(
        code(esia_oauth::token::issued_at),
        help("check the local clock against the identity provider")
    )]
    IssuedInFuture {
        issued_at: DateTime<Utc>,
        raw: String,
    },
    #[error("unsupported access token signature algorithm `{alg}`")]
    #[diagnostic(code(esia_oauth::token::algorithm))]
    UnsupportedAlgorithm { alg: SmolStr, raw: String },
    #[error("access token can not be verified")]
    #[diagnostic(
        code(esia_oauth::token::signature),
        help("make sure the issuer certificate matches the ESIA environment")
    )]
    Signature { raw: String },
    #[error("issuer key could not be loaded: {0}")]
    #[diagnostic(code(esia_oauth::token::key))]
    Key(SmolStr),
}

impl InvalidTokenError {
    /// The raw token response that was rejected.
    pub fn raw(&self) -> Option<&str> {
        match self {
            Self::Malformed { raw, .. }
            | Self::MissingSubject { raw }
            | Self::Expired { raw, .. }
            | Self::NotYetValid { raw, .. }
            | Self::IssuedInFuture { raw, .. }
            | Self::UnsupportedAlgorithm { raw, .. }
            | Self::Signature { raw } => Some(raw),
            Self::Key(_) => None,
        }
    }
}

pub type Result<T> = core::result::Result<T, InvalidTokenError>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub alg: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sbt: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ver: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(SmolStr),
    Multiple(Vec<SmolStr>),
}

/// ESIA serializes the person id as a JSON number; accept strings too.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubjectId {
    Number(u64),
    Text(SmolStr),
}

impl SubjectId {
    pub fn to_smolstr(&self) -> SmolStr {
        match self {
            Self::Number(n) => n.to_smolstr(),
            Self::Text(s) => s.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<SmolStr>,
    #[serde(rename = "urn:esia:sbj_id", skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<SubjectId>,
    #[serde(rename = "urn:esia:sid", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SmolStr>,
    #[serde(rename = "urn:esia:client_id", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<SmolStr>,
    /// Space-delimited granted scopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Claims {
    /// Scope names from the `scope` claim, keeping only the path of each entry.
    pub fn scopes(&self) -> ScopeSet {
        self.scope
            .as_deref()
            .map(parse_scopes)
            .unwrap_or_default()
    }
}

/// Split a space-delimited scope claim and keep the path component of each entry.
///
/// `https://esia/scope/fullname` becomes `/scope/fullname`, a relative entry
/// such as `email?oid=1000012345` becomes `email`. Empty entries are dropped.
pub fn parse_scopes(claim: &str) -> ScopeSet {
    claim
        .split(' ')
        .filter(|entry| !entry.is_empty())
        .map(scope_path)
        .filter(|path| !path.is_empty())
        .collect()
}

fn scope_path(entry: &str) -> SmolStr {
    match url::Url::parse(entry) {
        Ok(url) if url.has_host() => SmolStr::new(url.path()),
        _ => {
            let end = entry.find(['?', '#']).unwrap_or(entry.len());
            SmolStr::new(&entry[..end])
        }
    }
}

/// Token exposing what a resource owner lookup needs.
pub trait ScopedToken {
    /// Granted scopes, or `None` if this kind of token does not carry them.
    fn scopes(&self) -> Option<ScopeSet>;

    fn resource_owner_id(&self) -> Option<&str>;
}

impl ScopedToken for TokenResponse {
    fn scopes(&self) -> Option<ScopeSet> {
        None
    }

    fn resource_owner_id(&self) -> Option<&str> {
        None
    }
}

/// A validated ESIA access token.
#[derive(Debug, Clone)]
pub struct EsiaAccessToken {
    response: TokenResponse,
    header: Header,
    claims: Claims,
    resource_owner_id: SmolStr,
    expires_at: Option<DateTime<Utc>>,
}

impl EsiaAccessToken {
    /// Parse and validate `response.access_token` against the current time.
    ///
    /// With `issuer_key` the token signature is checked as well.
    pub fn new(response: TokenResponse, issuer_key: Option<&Path>) -> Result<Self> {
        Self::new_at(response, issuer_key, Utc::now())
    }

    pub fn new_at(
        response: TokenResponse,
        issuer_key: Option<&Path>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let raw = dump(&response);
        let jwt = Jwt::parse(&response.access_token)
            .map_err(|reason| InvalidTokenError::Malformed {
                reason,
                raw: raw.clone(),
            })?;

        let resource_owner_id = jwt
            .claims
            .subject_id
            .as_ref()
            .map(SubjectId::to_smolstr)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| InvalidTokenError::MissingSubject { raw: raw.clone() })?;

        validate_times(&jwt.claims, now, &raw)?;

        if let Some(key) = issuer_key {
            verify::verify(&jwt, key, &raw)?;
        }

        let expires_at = response
            .expires_in
            .and_then(|secs| now.checked_add_signed(TimeDelta::seconds(secs)))
            .or_else(|| jwt.claims.exp.and_then(timestamp));

        #[cfg(feature = "tracing")]
        tracing::debug!(
            resource_owner_id = %resource_owner_id,
            alg = %jwt.header.alg,
            verified = issuer_key.is_some(),
            "esia access token accepted"
        );

        Ok(Self {
            response,
            header: jwt.header,
            claims: jwt.claims,
            resource_owner_id,
            expires_at,
        })
    }

    pub fn access_token(&self) -> &str {
        &self.response.access_token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.response.refresh_token.as_deref()
    }

    pub fn id_token(&self) -> Option<&str> {
        self.response.id_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn has_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn response(&self) -> &TokenResponse {
        &self.response
    }

    pub fn owner_id(&self) -> &str {
        &self.resource_owner_id
    }

    pub fn granted_scopes(&self) -> ScopeSet {
        self.claims.scopes()
    }
}

impl ScopedToken for EsiaAccessToken {
    fn scopes(&self) -> Option<ScopeSet> {
        Some(self.granted_scopes())
    }

    fn resource_owner_id(&self) -> Option<&str> {
        Some(&self.resource_owner_id)
    }
}

/// Builds [`EsiaAccessToken`]s for the flow driver.
#[derive(Debug, Clone, Default)]
pub struct EsiaTokenFactory {
    issuer_key: Option<std::path::PathBuf>,
}

impl EsiaTokenFactory {
    pub fn new(issuer_key: Option<std::path::PathBuf>) -> Self {
        Self { issuer_key }
    }

    pub fn issuer_key(&self) -> Option<&Path> {
        self.issuer_key.as_deref()
    }
}

impl TokenFactory for EsiaTokenFactory {
    type Token = EsiaAccessToken;

    fn create_token(&self, response: TokenResponse) -> Result<EsiaAccessToken> {
        EsiaAccessToken::new(response, self.issuer_key())
    }
}

/// Compact JWT split into its decoded parts.
#[derive(Debug, Clone)]
pub(crate) struct Jwt {
    pub header: Header,
    pub claims: Claims,
    pub signing_input: String,
    pub signature: String,
}

impl Jwt {
    pub(crate) fn parse(token: &str) -> core::result::Result<Self, SmolStr> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SmolStr::new_static("expected three dot-separated segments"));
        };
        let header: Header = decode_segment(header, "header")?;
        let claims: Claims = decode_segment(payload, "claims")?;
        let signing_input = token[..token.len() - signature.len() - 1].to_owned();
        Ok(Self {
            header,
            claims,
            signing_input,
            signature: signature.to_owned(),
        })
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(
    segment: &str,
    what: &str,
) -> core::result::Result<T, SmolStr> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| format_smolstr!("{what}: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| format_smolstr!("{what}: {e}"))
}

fn validate_times(claims: &Claims, now: DateTime<Utc>, raw: &str) -> Result<()> {
    if let Some(expired_at) = claims.exp.and_then(timestamp) {
        if now > expired_at {
            return Err(InvalidTokenError::Expired {
                expired_at,
                raw: raw.to_owned(),
            });
        }
    }
    if let Some(not_before) = claims.nbf.and_then(timestamp) {
        if now < not_before {
            return Err(InvalidTokenError::NotYetValid {
                not_before,
                raw: raw.to_owned(),
            });
        }
    }
    if let Some(issued_at) = claims.iat.and_then(timestamp) {
        if now < issued_at {
            return Err(InvalidTokenError::IssuedInFuture {
                issued_at,
                raw: raw.to_owned(),
            });
        }
    }
    Ok(())
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn dump(response: &TokenResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|_| format!("{response:?}"))
}

#[cfg(feature = "openssl")]
mod verify {
    use std::path::Path;

    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use openssl::hash::MessageDigest;
    use openssl::pkey::{PKey, Public};
    use openssl::sign::Verifier;
    use openssl::x509::X509;
    use smol_str::format_smolstr;

    use super::{InvalidTokenError, Jwt, Result};

    pub(super) fn verify(jwt: &Jwt, key_path: &Path, raw: &str) -> Result<()> {
        let digest = match jwt.header.alg.as_str() {
            "RS256" => MessageDigest::sha256(),
            "RS384" => MessageDigest::sha384(),
            "RS512" => MessageDigest::sha512(),
            other => {
                return Err(InvalidTokenError::UnsupportedAlgorithm {
                    alg: other.into(),
                    raw: raw.to_owned(),
                });
            }
        };
        let key = load_key(key_path)?;
        let signature = URL_SAFE_NO_PAD
            .decode(jwt.signature.trim_end_matches('='))
            .map_err(|_| InvalidTokenError::Signature { raw: raw.to_owned() })?;

        let verified = Verifier::new(digest, &key)
            .and_then(|mut verifier| {
                verifier.update(jwt.signing_input.as_bytes())?;
                verifier.verify(&signature)
            })
            .unwrap_or(false);
        if verified {
            Ok(())
        } else {
            Err(InvalidTokenError::Signature { raw: raw.to_owned() })
        }
    }

    /// Certificate (PEM or DER) or bare PEM public key.
    fn load_key(path: &Path) -> Result<PKey<Public>> {
        let bytes = std::fs::read(path)
            .map_err(|e| InvalidTokenError::Key(format_smolstr!("{}: {e}", path.display())))?;
        X509::from_pem(&bytes)
            .or_else(|_| X509::from_der(&bytes))
            .and_then(|cert| cert.public_key())
            .or_else(|_| PKey::public_key_from_pem(&bytes))
            .map_err(|e| InvalidTokenError::Key(format_smolstr!("{}: {e}", path.display())))
    }
}

#[cfg(not(feature = "openssl"))]
mod verify {
    use std::path::Path;

    use super::{InvalidTokenError, Jwt, Result};

    pub(super) fn verify(_jwt: &Jwt, _key_path: &Path, _raw: &str) -> Result<()> {
        Err(InvalidTokenError::Key(
            "token verification requires the `openssl` feature".into(),
        ))
    }
}
