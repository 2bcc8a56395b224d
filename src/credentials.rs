// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loading a signing key and certificate chain from the file formats
//! Authenticode tooling is commonly handed: PKCS#12 bundles and separate
//! PEM/DER certificate and private-key files.

use x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, Sign};

use crate::error::{AuthenticodeError, Result};

/// A signing identity: a private key plus the certificate (and, typically,
/// any intermediate certificates) that chain up to it.
pub struct SigningIdentity {
    pub signing_key: InMemorySigningKeyPair,
    pub signing_certificate: CapturedX509Certificate,
    pub chain: Vec<CapturedX509Certificate>,
}

fn bmp_string(s: &str) -> Vec<u8> {
    let mut bytes: Vec<u8> = s.encode_utf16().flat_map(u16::to_be_bytes).collect();
    bytes.push(0x00);
    bytes.push(0x00);
    bytes
}

/// Loads a signing identity from PKCS#12 (`.p12`/`.pfx`) data, the format
/// most code-signing certificates are distributed in.
pub fn load_pkcs12(data: &[u8], password: &str) -> Result<SigningIdentity> {
    let pfx = p12::PFX::parse(data)
        .map_err(|e| AuthenticodeError::Pkcs12(format!("data does not appear to be PFX: {e:?}")))?;

    if !pfx.verify_mac(password) {
        return Err(AuthenticodeError::Pkcs12(
            "PFX MAC verification failed; likely an incorrect password".into(),
        ));
    }

    let outer_data = match pfx.auth_safe {
        p12::ContentInfo::Data(data) => data,
        _ => {
            return Err(AuthenticodeError::Pkcs12(
                "unexpected PFX AuthenticatedSafe content type".into(),
            ));
        }
    };

    let content_infos = yasna::parse_der(&outer_data, |reader| {
        reader.collect_sequence_of(p12::ContentInfo::parse)
    })
    .map_err(|e| AuthenticodeError::Pkcs12(format!("failed parsing inner ContentInfo: {e:?}")))?;

    let bmp_password = bmp_string(password);

    let mut certificates = Vec::new();
    let mut signing_key = None;

    for content in content_infos {
        let bags_data = match content {
            p12::ContentInfo::Data(inner) => inner,
            p12::ContentInfo::EncryptedData(encrypted) => {
                encrypted.data(&bmp_password).ok_or_else(|| {
                    AuthenticodeError::Pkcs12("failed decrypting inner EncryptedData".into())
                })?
            }
            p12::ContentInfo::OtherContext(_) => {
                return Err(AuthenticodeError::Pkcs12(
                    "unexpected OtherContext content in inner PFX data".into(),
                ));
            }
        };

        let bags = yasna::parse_ber(&bags_data, |reader| {
            reader.collect_sequence_of(p12::SafeBag::parse)
        })
        .map_err(|e| AuthenticodeError::Pkcs12(format!("failed parsing SafeBag: {e:?}")))?;

        for bag in bags {
            match bag.bag {
                p12::SafeBagKind::CertBag(p12::CertBag::X509(cert_data)) => {
                    certificates.push(CapturedX509Certificate::from_der(cert_data)?);
                }
                p12::SafeBagKind::CertBag(p12::CertBag::SDSI(_)) => {
                    return Err(AuthenticodeError::Pkcs12(
                        "unexpected SDSI certificate data".into(),
                    ));
                }
                p12::SafeBagKind::Pkcs8ShroudedKeyBag(key_bag) => {
                    let decrypted = key_bag.decrypt(&bmp_password).ok_or_else(|| {
                        AuthenticodeError::Pkcs12(
                            "error decrypting PKCS8 shrouded key bag; is the password correct?"
                                .into(),
                        )
                    })?;
                    signing_key = Some(InMemorySigningKeyPair::from_pkcs8_der(&decrypted)?);
                }
                p12::SafeBagKind::OtherBagKind(_) => {
                    return Err(AuthenticodeError::Pkcs12(
                        "unexpected bag type in PFX content".into(),
                    ));
                }
            }
        }
    }

    let signing_key = signing_key
        .ok_or_else(|| AuthenticodeError::CredentialLoad("no private key found in PFX data".into()))?;

    let signing_public_key = signing_key.public_key_data();
    let position = certificates
        .iter()
        .position(|cert| cert.public_key_data() == signing_public_key)
        .ok_or_else(|| {
            AuthenticodeError::CredentialLoad(
                "no certificate in PFX data matches the private key".into(),
            )
        })?;
    let signing_certificate = certificates.remove(position);

    Ok(SigningIdentity {
        signing_key,
        signing_certificate,
        chain: certificates,
    })
}

/// Loads a signing identity from a PEM-encoded certificate (optionally
/// followed by intermediate certificates) and a separate PEM/DER-encoded
/// PKCS#8 private key.
pub fn load_pem(cert_data: &[u8], key_data: &[u8]) -> Result<SigningIdentity> {
    let mut certificates = CapturedX509Certificate::from_pem_multiple(cert_data)?;
    if certificates.is_empty() {
        return Err(AuthenticodeError::CredentialLoad(
            "no certificates found in PEM input".into(),
        ));
    }
    let signing_certificate = certificates.remove(0);

    let signing_key = if let Ok(pem) = pem::parse(key_data) {
        InMemorySigningKeyPair::from_pkcs8_der(&pem.contents)?
    } else {
        InMemorySigningKeyPair::from_pkcs8_der(key_data)?
    };

    Ok(SigningIdentity {
        signing_key,
        signing_certificate,
        chain: certificates,
    })
}
