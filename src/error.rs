// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {cryptographic_message_syntax::CmsError, thiserror::Error, x509_certificate::X509CertificateError};

/// Unified error type for Authenticode signing operations.
///
/// Every variant here corresponds to one of the error kinds the core is
/// specified to raise. All of them are fatal: callers should remove any
/// partially-written output and exit nonzero on receipt of any of these.
#[derive(Debug, Error)]
pub enum AuthenticodeError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unrecognized file format (not a PE, CAB, or MSI container)")]
    UnrecognizedFormat,

    #[error("corrupt container: {0}")]
    CorruptContainer(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("failed to load signing credentials: {0}")]
    CredentialLoad(String),

    #[error("PKCS#12 decode error: {0}")]
    Pkcs12(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("timestamp request failed: {0}")]
    TimestampFailed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("ASN.1 decode error: {0}")]
    Asn1Decode(#[from] bcder::decode::Error),

    #[error("X.509 certificate error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("OLE compound document error: {0}")]
    Cfb(String),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("PEM decode error: {0}")]
    Pem(#[from] pem::PemError),
}

pub type Result<T> = std::result::Result<T, AuthenticodeError>;
