//! In-process PKCS#7 signing through the `openssl` crate.
//!
//! Produces the same detached, binary, attribute-less DER structure as the
//! default [`ProcessSigner`](super::ProcessSigner) invocation, without the
//! cost of spawning a process per request.

use std::fmt;
use std::path::Path;

use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::X509;
use smol_str::format_smolstr;

use super::{Result, SignError, Signer};

pub struct OpensslSigner {
    certificate: X509,
    private_key: PKey<Private>,
}

impl OpensslSigner {
    /// Load a signer certificate (PEM or DER) and a PEM private key,
    /// optionally protected by `passphrase`.
    pub fn from_files(
        certificate_path: impl AsRef<Path>,
        private_key_path: impl AsRef<Path>,
        passphrase: Option<&str>,
    ) -> Result<Self> {
        let certificate = read(certificate_path.as_ref())?;
        let private_key = read(private_key_path.as_ref())?;
        Self::from_pem(&certificate, &private_key, passphrase)
    }

    pub fn from_pem(certificate: &[u8], private_key: &[u8], passphrase: Option<&str>) -> Result<Self> {
        let certificate = X509::from_pem(certificate)
            .or_else(|_| X509::from_der(certificate))
            .map_err(|e| SignError::KeyMaterial(format_smolstr!("certificate: {e}")))?;
        let private_key = match passphrase {
            Some(passphrase) => {
                PKey::private_key_from_pem_passphrase(private_key, passphrase.as_bytes())
            }
            None => PKey::private_key_from_pem(private_key),
        }
        .map_err(|e| SignError::KeyMaterial(format_smolstr!("private key: {e}")))?;
        Ok(Self {
            certificate,
            private_key,
        })
    }

    pub fn from_parts(certificate: X509, private_key: PKey<Private>) -> Self {
        Self {
            certificate,
            private_key,
        }
    }
}

impl Signer for OpensslSigner {
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(len = message.len())))]
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let extra: Stack<X509> = Stack::new().map_err(crypto)?;
        let flags = Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY | Pkcs7Flags::NOATTR;
        Pkcs7::sign(&self.certificate, &self.private_key, &extra, message, flags)
            .and_then(|pkcs7| pkcs7.to_der())
            .map_err(crypto)
    }
}

impl fmt::Debug for OpensslSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpensslSigner").finish_non_exhaustive()
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| SignError::KeyMaterial(format_smolstr!("{}: {e}", path.display())))
}

fn crypto(e: openssl::error::ErrorStack) -> SignError {
    SignError::Crypto(format_smolstr!("{e}"))
}
