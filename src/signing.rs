// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds the PKCS#7 `SignedData` message embedded in a signed container.
//!
//! Authenticode's defining trick is that the content actually hashed and
//! signed (the `SpcIndirectDataContent` encoding the file's digest) is also
//! the content embedded in the message -- there's no separate "detached"
//! payload. Everything here is a thin Authenticode-flavored layer over
//! [`cryptographic_message_syntax`]'s general-purpose CMS builder.

use bcder::{Captured, Mode};
use cryptographic_message_syntax::{asn1::rfc5652::AttributeValue, SignedDataBuilder, SignerBuilder};
use x509_certificate::{CapturedX509Certificate, Sign};

use crate::{
    authenticode::{self, OID_SPC_INDIRECT_DATA},
    container::FileType,
    credentials::SigningIdentity,
    digest::DigestAlgorithm,
    error::{AuthenticodeError, Result},
    timestamp::TimestampRequest,
};

/// `SPC_STATEMENT_TYPE_OBJID`
const OID_SPC_STATEMENT_TYPE: &str = "1.3.6.1.4.1.311.2.1.11";
/// `SPC_SP_OPUS_INFO_OBJID`
const OID_SPC_SP_OPUS_INFO: &str = "1.3.6.1.4.1.311.2.1.12";
/// `SPC_INDIVIDUAL_SP_KEY_PURPOSE_OBJID`
const OID_SPC_INDIVIDUAL_PURPOSE: &str = "1.3.6.1.4.1.311.2.1.21";
/// `SPC_COMMERCIAL_SP_KEY_PURPOSE_OBJID`
const OID_SPC_COMMERCIAL_PURPOSE: &str = "1.3.6.1.4.1.311.2.1.22";
/// Microsoft's "individual code signing" Java attribute, always the same
/// fixed DER value when present (`SEQUENCE { BOOLEAN false } SEQUENCE {}`,
/// Microsoft's compatibility stub for tools that check for Java signing).
const MS_JAVA_ATTRIBUTE: [u8; 8] = [0x30, 0x06, 0x03, 0x02, 0x00, 0x01, 0x30, 0x00];
const OID_MS_JAVA: &str = "1.3.6.1.4.1.311.15.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Individual,
    Commercial,
}

/// Builds an Authenticode PKCS#7 signature over a container's digest.
pub struct SignedMessageBuilder<'a> {
    identity: &'a SigningIdentity,
    digest_algorithm: DigestAlgorithm,
    file_type: FileType,
    statement_kind: Option<StatementKind>,
    include_ms_java: bool,
    timestamp: Option<TimestampRequest>,
    program_name: Option<String>,
    more_info_url: Option<String>,
}

impl<'a> SignedMessageBuilder<'a> {
    pub fn new(identity: &'a SigningIdentity, file_type: FileType, digest_algorithm: DigestAlgorithm) -> Self {
        Self {
            identity,
            digest_algorithm,
            file_type,
            statement_kind: None,
            include_ms_java: false,
            timestamp: None,
            program_name: None,
            more_info_url: None,
        }
    }

    pub fn statement_kind(mut self, kind: StatementKind) -> Self {
        self.statement_kind = Some(kind);
        self
    }

    pub fn include_ms_java(mut self, include: bool) -> Self {
        self.include_ms_java = include;
        self
    }

    pub fn timestamp(mut self, request: TimestampRequest) -> Self {
        self.timestamp = Some(request);
        self
    }

    /// Sets the program description (`-n`) shown by some verifiers.
    pub fn program_name(mut self, name: String) -> Self {
        self.program_name = Some(name);
        self
    }

    /// Sets the "more info" URL (`-i`) shown by some verifiers.
    pub fn more_info_url(mut self, url: String) -> Self {
        self.more_info_url = Some(url);
        self
    }

    /// Builds the final PKCS#7 `ContentInfo` DER given the container's
    /// Authenticode digest.
    pub fn build(&self, digest: &[u8]) -> Result<Vec<u8>> {
        let content = authenticode::encode_indirect_data_content(self.file_type, self.digest_algorithm, digest);
        let content_type = authenticode::der::oid_from_dotted(OID_SPC_INDIRECT_DATA);
        let content_type = bcder::Oid(bytes::Bytes::copy_from_slice(&der_oid_body(&content_type)));

        let signing_key: &dyn Sign = &self.identity.signing_key;

        let mut signer = SignerBuilder::new(signing_key, self.identity.signing_certificate.clone())
            .content_type(content_type.clone())
            .message_id_content(content.clone());

        if let Some(kind) = self.statement_kind {
            signer = signer.signed_attribute(
                oid(OID_SPC_STATEMENT_TYPE),
                vec![captured_der_value(&statement_type_value(kind))],
            );
        }

        if self.program_name.is_some() || self.more_info_url.is_some() {
            signer = signer.signed_attribute(
                oid(OID_SPC_SP_OPUS_INFO),
                vec![captured_der_value(&opus_info_value(
                    self.program_name.as_deref(),
                    self.more_info_url.as_deref(),
                ))],
            );
        }

        if self.include_ms_java {
            signer = signer.signed_attribute(oid(OID_MS_JAVA), vec![captured_der_value(&MS_JAVA_ATTRIBUTE)]);
        }

        // RFC 3161 timestamping happens inside the CMS library's own
        // signer, so it has to be requested before `build_der` runs; the
        // legacy protocol has no such hook and is applied as a later pass
        // over the finished DER.
        if let Some(TimestampRequest::Rfc3161 { url }) = &self.timestamp {
            signer = signer
                .time_stamp_url(url.clone())
                .map_err(|e| AuthenticodeError::TimestampFailed(e.to_string()))?;
        }

        let mut certificates = vec![self.identity.signing_certificate.clone()];
        certificates.extend(self.identity.chain.iter().cloned());

        let mut der = SignedDataBuilder::default()
            .content_type(content_type)
            .signed_content(content)
            .signer(signer)
            .certificates(certificates.into_iter())
            .build_der()
            .map_err(|e| AuthenticodeError::SigningFailed(e.to_string()))?;

        if let Some(TimestampRequest::Legacy { url, proxy }) = &self.timestamp {
            der = crate::timestamp::apply_legacy(&der, url, proxy.as_deref())?;
        }

        Ok(der)
    }
}

/// Wraps already-DER-encoded bytes as a signed attribute's `AttributeValue`
/// verbatim, with no further tagging. `SignerBuilder::signed_attribute_octet_string`
/// wraps its input in an OCTET STRING, which is wrong here: Authenticode's
/// `SpcStatementType`/`SpcSpOpusInfo`/MS-Java attributes carry a bare
/// `SEQUENCE` as their value, not an OCTET STRING containing one.
fn captured_der_value(der: &[u8]) -> AttributeValue {
    AttributeValue::new(Captured::new(bytes::Bytes::copy_from_slice(der), Mode::Der))
}

fn oid(dotted: &str) -> bcder::Oid {
    bcder::Oid(bytes::Bytes::copy_from_slice(&der_oid_body(&authenticode::der::oid_from_dotted(dotted))))
}

/// Strips the DER tag+length prefix from an encoded OBJECT IDENTIFIER,
/// leaving the raw arc-encoded body `bcder::Oid` wants.
fn der_oid_body(encoded: &[u8]) -> Vec<u8> {
    // A single content-length byte always suffices for the OIDs used here.
    encoded[2..].to_vec()
}

/// `SpcSpOpusInfo` isn't emitted by this crate (no UI program name/URL to
/// show), but `SpcStatementType` always is: a SEQUENCE containing exactly
/// one of the two key-purpose OIDs, marking the intended use of the
/// signature the way every Authenticode signer does.
fn statement_type_value(kind: StatementKind) -> Vec<u8> {
    use authenticode::der::{tlv, SEQUENCE};
    let purpose = match kind {
        StatementKind::Individual => OID_SPC_INDIVIDUAL_PURPOSE,
        StatementKind::Commercial => OID_SPC_COMMERCIAL_PURPOSE,
    };
    tlv(SEQUENCE, &authenticode::der::oid_from_dotted(purpose))
}

/// `SpcSpOpusInfo ::= SEQUENCE { programName [0] EXPLICIT SpcString OPTIONAL,
/// moreInfo [1] EXPLICIT SpcLink OPTIONAL }`, with `programName` always the
/// ASCII `SpcString` alternative and `moreInfo` always the URL `SpcLink`
/// alternative -- the only two shapes a caller-supplied description or URL
/// can take.
fn opus_info_value(program_name: Option<&str>, more_info_url: Option<&str>) -> Vec<u8> {
    use authenticode::der::{tlv, CTX_0_EXPLICIT, CTX_0_IMPLICIT, CTX_1_EXPLICIT, CTX_1_IMPLICIT, SEQUENCE};

    let mut body = Vec::new();
    if let Some(name) = program_name {
        let ascii_spc_string = tlv(CTX_1_IMPLICIT, name.as_bytes());
        body.extend(tlv(CTX_0_EXPLICIT, &ascii_spc_string));
    }
    if let Some(url) = more_info_url {
        let url_spc_link = tlv(CTX_0_IMPLICIT, url.as_bytes());
        body.extend(tlv(CTX_1_EXPLICIT, &url_spc_link));
    }
    tlv(SEQUENCE, &body)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn statement_type_is_a_sequence_of_one_oid() {
        let value = statement_type_value(StatementKind::Individual);
        assert_eq!(value[0], authenticode::der::SEQUENCE);
    }

    #[test]
    fn opus_info_omits_absent_fields() {
        assert_eq!(opus_info_value(None, None), vec![authenticode::der::SEQUENCE, 0]);
    }

    #[test]
    fn opus_info_encodes_program_name_and_url() {
        let value = opus_info_value(Some("My Program"), Some("https://example.com"));
        assert_eq!(value[0], authenticode::der::SEQUENCE);

        // [0] EXPLICIT { [1] IMPLICIT IA5String "My Program" }
        assert_eq!(value[2], authenticode::der::CTX_0_EXPLICIT);
        let name_len = value[3] as usize;
        let inner = &value[4..4 + name_len];
        assert_eq!(inner[0], authenticode::der::CTX_1_IMPLICIT);
        assert_eq!(&inner[2..], b"My Program");

        let after_name = 4 + name_len;
        // [1] EXPLICIT { [0] IMPLICIT IA5String url }
        assert_eq!(value[after_name], authenticode::der::CTX_1_EXPLICIT);
    }

    #[test]
    fn ms_java_attribute_matches_reference_bytes() {
        assert_eq!(MS_JAVA_ATTRIBUTE, [0x30, 0x06, 0x03, 0x02, 0x00, 0x01, 0x30, 0x00]);
    }

    #[test]
    fn captured_der_value_replays_bytes_verbatim() {
        use bcder::encode::Values;

        let der = statement_type_value(StatementKind::Commercial);
        let value = captured_der_value(&der);

        let mut out = Vec::new();
        value.write_encoded(Mode::Der, &mut out).unwrap();
        // No OCTET STRING wrapper: the replayed bytes are exactly the
        // SEQUENCE that went in, not `04 <len>` followed by it.
        assert_eq!(out, der);
        assert_eq!(out[0], authenticode::der::SEQUENCE);
    }
}
