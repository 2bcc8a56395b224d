// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Verifying an existing Authenticode signature: recompute the container
//! digest, compare it against the one embedded in the signed content, check
//! the cryptographic signature, and report on the signer's certificate
//! chain. Matches any trust store against the chain is explicitly out of
//! scope -- only the math is checked.

use cryptographic_message_syntax::{asn1::rfc5652, Certificate, SignedData};
use x509_certificate::CapturedX509Certificate;

use crate::{
    authenticode::{self, OID_SPC_INDIRECT_DATA},
    byte_window::ByteWindow,
    container::{self, cab::CabHandler, msi::MsiHandler, pe::PeHandler, FileType},
    digest::DigestAlgorithm,
    error::{AuthenticodeError, Result},
};

/// One signer's worth of reported information.
pub struct SignerReport {
    pub digest_algorithm: DigestAlgorithm,
    pub subject: String,
    pub issuer: String,
    pub signature_valid: bool,
    pub time_stamped: bool,
}

/// The full result of verifying one container.
pub struct VerificationReport {
    pub file_type: FileType,
    pub checksum_valid: Option<bool>,
    pub digest_matches: bool,
    pub signers: Vec<SignerReport>,
    /// Algorithm name and first-32-bytes preview of an embedded page-hash
    /// extension, when the signer attached one. `None` for CAB/MSI, which
    /// have no `SpcPeImageData` to carry one.
    pub page_hash_preview: Option<(&'static str, Vec<u8>)>,
}

impl VerificationReport {
    /// Whether the file should be reported as successfully signed: the
    /// checksum (when applicable) is valid, the recomputed container digest
    /// matches the one embedded in the signature, and every signer's
    /// cryptographic signature checks out.
    pub fn success(&self) -> bool {
        self.checksum_valid.unwrap_or(true)
            && self.digest_matches
            && !self.signers.is_empty()
            && self.signers.iter().all(|s| s.signature_valid)
    }
}

/// Renders a certificate's subject and issuer distinguished names. The CMS
/// library's own `Certificate` type stores names as bare ASN.1 values with
/// no string rendering, so the certificate is re-parsed through
/// `x509_certificate`, whose `Name::user_friendly_str` knows how to turn a
/// handful of common attribute OIDs (CN, O, OU, ...) into a readable string.
fn certificate_report(cert: &Certificate) -> (String, String) {
    let captured = match cert.as_der().ok().and_then(|der| CapturedX509Certificate::from_der(der).ok()) {
        Some(captured) => captured,
        None => return ("<unknown>".to_string(), "<unknown>".to_string()),
    };
    let subject = captured
        .subject_name()
        .user_friendly_str()
        .unwrap_or_else(|_| "<unknown>".to_string());
    let issuer = captured
        .issuer_name()
        .user_friendly_str()
        .unwrap_or_else(|_| "<unknown>".to_string());
    (subject, issuer)
}

/// Verifies the signature embedded in `path`, whichever of the three
/// container families it turns out to be.
pub fn verify(path: &std::path::Path) -> Result<VerificationReport> {
    let window = ByteWindow::open(path)?;
    let file_type = container::detect_file_type(window.as_slice())?;

    let (signature_der, checksum_valid) = match file_type {
        FileType::Pe => {
            let handler = PeHandler::open(&window)?;
            let signature = handler.signature_bytes()?.ok_or_else(|| {
                AuthenticodeError::VerificationFailed("file carries no certificate table".into())
            })?;
            let stored_checksum = u32::from_le_bytes(
                window.slice(handler.layout.pe_header_offset + 88, handler.layout.pe_header_offset + 92)?
                    .try_into()
                    .unwrap(),
            );
            let recomputed_checksum = crate::container::pe::calc_checksum(window.as_slice(), handler.layout.pe_header_offset);
            (signature.to_vec(), Some(stored_checksum == recomputed_checksum))
        }
        FileType::Cab => {
            let handler = CabHandler::open(&window)?;
            let signature = handler.extract_signature()?.ok_or_else(|| {
                AuthenticodeError::VerificationFailed("file carries no reserved signature area".into())
            })?;
            (signature, None)
        }
        FileType::Msi => {
            let handler = MsiHandler::open(path)?;
            let signature = handler.extract_signature()?.ok_or_else(|| {
                AuthenticodeError::VerificationFailed("file carries no \\005DigitalSignature stream".into())
            })?;
            (signature, None)
        }
    };

    let signed_data = SignedData::parse_ber(&signature_der)?;
    let content = signed_data
        .signed_content()
        .ok_or_else(|| AuthenticodeError::VerificationFailed("PKCS#7 content is detached; expected embedded SpcIndirectDataContent".into()))?;

    let (digest_algorithm, embedded_digest) = authenticode::recover_digest(file_type, content)?;

    let recomputed = match file_type {
        FileType::Pe => PeHandler::open(&window)?.digest(digest_algorithm)?,
        FileType::Cab => CabHandler::open(&window)?.digest(digest_algorithm)?,
        FileType::Msi => MsiHandler::open(path)?.digest(digest_algorithm)?,
    };
    let digest_matches = recomputed == embedded_digest;

    let page_hash_preview = match file_type {
        FileType::Pe => authenticode::find_page_hash_preview(content),
        FileType::Cab | FileType::Msi => None,
    };

    // `SignedData` exposes only whether unsigned attributes were parsed into
    // its own recognized shape (a time-stamp token), not their presence in
    // general. Re-decoding at the raw ASN.1 layer lets us tell "timestamped"
    // apart from "carries some other unsigned attribute" without needing the
    // high-level type to understand the latter. Signer order is preserved
    // 1:1 between the two layers since the high-level signer list is built
    // by mapping straight over `signer_infos` with no filtering.
    let raw_signed_data = rfc5652::SignedData::decode_ber(&signature_der)?;

    let mut signers = Vec::new();
    for (index, signer) in signed_data.signers().enumerate() {
        let signature_valid = signer.verify_signature_with_signed_data(&signed_data).is_ok();
        let (subject, issuer) = signed_data
            .certificates()
            .find(|cert| {
                signer
                    .certificate_issuer_and_serial()
                    .map(|(issuer, serial)| cert.issuer() == issuer && cert.serial_number() == serial)
                    .unwrap_or(false)
            })
            .map(certificate_report)
            .unwrap_or_else(|| ("<unknown>".to_string(), "<unknown>".to_string()));
        let time_stamped = raw_signed_data
            .signer_infos
            .get(index)
            .map(|info| info.unsigned_attributes.is_some())
            .unwrap_or(false);

        signers.push(SignerReport {
            digest_algorithm,
            subject,
            issuer,
            signature_valid,
            time_stamped,
        });
    }

    Ok(VerificationReport {
        file_type,
        checksum_valid,
        digest_matches,
        signers,
        page_hash_preview,
    })
}

/// Identifies `SpcIndirectDataContent` by its content-type OID, as an
/// additional sanity check before treating the content bytes as one.
pub fn is_spc_indirect_data(content_type_oid: &[u8]) -> bool {
    content_type_oid == authenticode::der::oid_from_dotted(OID_SPC_INDIRECT_DATA)
}

#[cfg(test)]
mod test {
    use super::*;

    fn report(checksum_valid: Option<bool>, digest_matches: bool, signers: Vec<SignerReport>) -> VerificationReport {
        VerificationReport {
            file_type: FileType::Pe,
            checksum_valid,
            digest_matches,
            signers,
            page_hash_preview: None,
        }
    }

    fn signer(valid: bool) -> SignerReport {
        SignerReport {
            digest_algorithm: DigestAlgorithm::Sha256,
            subject: "CN=test".to_string(),
            issuer: "CN=test".to_string(),
            signature_valid: valid,
            time_stamped: false,
        }
    }

    #[test]
    fn success_requires_checksum_digest_and_all_signatures() {
        assert!(report(Some(true), true, vec![signer(true)]).success());
        assert!(!report(Some(false), true, vec![signer(true)]).success());
        assert!(!report(Some(true), false, vec![signer(true)]).success());
        assert!(!report(Some(true), true, vec![signer(true), signer(false)]).success());
        assert!(!report(Some(true), true, vec![]).success());
    }

    #[test]
    fn success_ignores_absent_checksum_for_non_pe_containers() {
        assert!(report(None, true, vec![signer(true)]).success());
    }
}
