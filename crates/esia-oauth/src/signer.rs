//! Detached message signing used to produce the `client_secret` of every
//! authorization and token request.

pub mod process;

#[cfg(feature = "openssl")]
pub mod openssl;

use std::sync::Arc;

use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

pub use self::process::ProcessSigner;

#[cfg(feature = "openssl")]
pub use self::openssl::OpensslSigner;

/// Placeholder reported when a failed signing tool left no diagnostics.
pub const UNKNOWN_FAILURE: &str = "unknown";

/// Signing failures. None of these are retried by the client.
#[derive(Debug, Error, Diagnostic)]
pub enum SignError {
    /// The signing tool ran and exited unsuccessfully
    #[error("signing failed with code {code}: {message}")]
    #[diagnostic(
        code(esia_oauth::signer::failed),
        help("check the signer certificate, private key and passphrase")
    )]
    Failed { message: SmolStr, code: i32 },
    /// The signing tool could not be started
    #[error("failed to spawn signing tool `{program}`")]
    #[diagnostic(
        code(esia_oauth::signer::spawn),
        help("make sure the tool is installed and on PATH, or configure an absolute path")
    )]
    Spawn {
        program: SmolStr,
        #[source]
        source: std::io::Error,
    },
    /// Pipe or wait failure while talking to the signing tool
    #[error("i/o error while signing")]
    #[diagnostic(code(esia_oauth::signer::io))]
    Io(#[from] std::io::Error),
    /// The signing tool did not finish in time and was killed
    #[error("signing tool did not finish within {0:?}")]
    #[diagnostic(code(esia_oauth::signer::timeout))]
    TimedOut(std::time::Duration),
    /// Certificate or private key could not be loaded
    #[error("invalid key material: {0}")]
    #[diagnostic(
        code(esia_oauth::signer::key_material),
        help("certificate must be PEM or DER, private key must be PEM")
    )]
    KeyMaterial(SmolStr),
    /// In-process crypto backend error
    #[error("crypto backend error: {0}")]
    #[diagnostic(code(esia_oauth::signer::crypto))]
    Crypto(SmolStr),
}

impl SignError {
    /// Build a [`SignError::Failed`] from raw tool diagnostics.
    ///
    /// Diagnostics are trimmed; empty diagnostics become [`UNKNOWN_FAILURE`].
    pub fn failed(diagnostics: &str, code: i32) -> Self {
        let trimmed = diagnostics.trim();
        let message = if trimmed.is_empty() {
            SmolStr::new_static(UNKNOWN_FAILURE)
        } else {
            SmolStr::new(trimmed)
        };
        Self::Failed { message, code }
    }

    /// Exit code of the signing tool, if it ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = core::result::Result<T, SignError>;

/// Produces a detached signature over an exact byte message.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

impl<T: Signer + ?Sized> Signer for &T {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        (**self).sign(message)
    }
}

impl<T: Signer + ?Sized> Signer for Box<T> {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.as_ref().sign(message)
    }
}

impl<T: Signer + ?Sized> Signer for Arc<T> {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.as_ref().sign(message)
    }
}
