//! OAuth2 authorization-code client for ESIA, the Russian federal identity provider.
//!
//! ESIA authenticates the client by a detached PKCS#7 signature over
//! `scope + timestamp + client_id + state`, sent base64url-encoded as
//! `client_secret`. Signing is pluggable through [`Signer`]: run an external
//! tool with [`ProcessSigner`] or sign in-process with `OpensslSigner`.
//!
//! ```no_run
//! use esia_oauth::{AuthorizationOptions, EsiaConfig, EsiaProvider, ProcessSigner};
//!
//! # async fn run() -> miette::Result<()> {
//! let config = EsiaConfig::builder()
//!     .client_id("MY_CLIENT")
//!     .redirect_uri("https://app.example/callback".parse().unwrap())
//!     .remote_certificate_path("/etc/esia/esia.cer")
//!     .build();
//! let signer = ProcessSigner::new("/etc/esia/client.crt", "/etc/esia/client.key", None);
//! let provider = EsiaProvider::new(config, signer, reqwest::Client::new())?;
//!
//! let request = provider.authorization_url(AuthorizationOptions::default())?;
//! // redirect to request.url, keep request.state, then on callback:
//! let token = provider.exchange_code("code-from-callback").await?;
//! let owner = provider.fetch_resource_owner(&token).await?;
//! println!("{}", owner.id());
//! # Ok(())
//! # }
//! ```

pub mod embed;
pub mod error;
pub mod http_client;
pub mod oauth;
pub mod params;
pub mod provider;
pub mod signer;
pub mod token;

pub use embed::EmbedSection;
pub use error::{ConfigError, ContractViolation, EsiaError, IdentityProviderError, Result};
pub use http_client::HttpClient;
pub use oauth::{AuthorizationOptions, AuthorizationRequest, Grant, ResourceOwner, TokenResponse};
pub use params::{ParameterError, ParameterSigner, Parameters};
pub use provider::{EsiaConfig, EsiaProvider};
pub use signer::{ProcessSigner, SignError, Signer};
pub use token::{EsiaAccessToken, InvalidTokenError, ScopedToken};

#[cfg(feature = "openssl")]
pub use signer::OpensslSigner;
