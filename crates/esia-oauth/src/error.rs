use std::path::PathBuf;

use http::StatusCode;
use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

use crate::params::ParameterError;
use crate::signer::SignError;
use crate::token::InvalidTokenError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Provider configuration rejected at construction time, before any I/O.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("remote URL `{0}` is not a valid absolute http(s) URL")]
    #[diagnostic(
        code(esia_oauth::config::remote_url),
        help("use e.g. https://esia.gosuslugi.ru or https://esia-portal1.test.gosuslugi.ru")
    )]
    InvalidRemoteUrl(SmolStr),
    #[error("remote certificate not found at `{}`", .0.display())]
    #[diagnostic(
        code(esia_oauth::config::remote_certificate),
        help("download the ESIA certificate for the target environment and point `remote_certificate_path` at it")
    )]
    MissingCertificate(PathBuf),
    #[error("signer is not provided")]
    #[diagnostic(
        code(esia_oauth::config::signer),
        help("supply a `ProcessSigner` or `OpensslSigner`")
    )]
    MissingSigner,
    #[error("`{0}` must not be empty")]
    #[diagnostic(code(esia_oauth::config::empty))]
    Empty(&'static str),
}

/// The identity provider answered with an error status or an `error` field.
#[derive(Debug, Error, Diagnostic)]
#[error("identity provider error ({status}): {message}")]
#[diagnostic(
    code(esia_oauth::identity_provider),
    help("see the raw response body for `error_description`")
)]
pub struct IdentityProviderError {
    pub message: SmolStr,
    pub status: StatusCode,
    pub body: String,
}

/// A token without scopes or owner id was used where a scoped ESIA token is required.
#[derive(Debug, Error, Diagnostic)]
#[error("token does not expose {0}")]
#[diagnostic(
    code(esia_oauth::contract_violation),
    help("resource owner lookups need a token created by `EsiaProvider`")
)]
pub struct ContractViolation(pub &'static str);

/// Errors emitted by the ESIA client.
#[derive(Debug, Error, Diagnostic)]
pub enum EsiaError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parameters(#[from] ParameterError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    IdentityProvider(#[from] IdentityProviderError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidToken(#[from] InvalidTokenError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    ContractViolation(#[from] ContractViolation),
    /// Transport failure of the HTTP client
    #[error("http transport error")]
    #[diagnostic(code(esia_oauth::http))]
    Transport(#[source] BoxError),
    /// HTTP request could not be built
    #[error(transparent)]
    #[diagnostic(code(esia_oauth::http_build))]
    HttpBuild(#[from] http::Error),
    /// Serialization error
    #[error(transparent)]
    #[diagnostic(
        code(esia_oauth::serde),
        help("verify the response body is valid JSON")
    )]
    Serde(#[from] serde_json::Error),
    /// URL error
    #[error(transparent)]
    #[diagnostic(code(esia_oauth::url))]
    Url(#[from] url::ParseError),
    /// Form encoding error
    #[error(transparent)]
    #[diagnostic(code(esia_oauth::url))]
    UrlEncoding(#[from] serde_html_form::ser::Error),
}

impl EsiaError {
    pub fn transport(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Box::new(source))
    }
}

impl From<SignError> for EsiaError {
    fn from(e: SignError) -> Self {
        Self::Parameters(ParameterError::Sign(e))
    }
}

pub type Result<T> = core::result::Result<T, EsiaError>;
