// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Authenticode encoder: builds the DER `SpcIndirectDataContent` blob
//! that the signed-message builder signs over.
//!
//! The per-container inner `data` field (`SpcPeImageData`/`SpcLink`/
//! `SpcSipinfo`) is small, fixed-shape ASN.1 that doesn't benefit from a
//! generic template library, so it's assembled directly with DER TLV
//! primitives (see [`der`]) rather than routed through a schema type. The
//! outer `SpcIndirectDataContent`/`DigestInfo`/`AlgorithmIdentifier`
//! wrapping uses the same approach for uniformity.

use crate::{
    container::FileType,
    digest::DigestAlgorithm,
    error::{AuthenticodeError, Result},
};

/// Minimal DER TLV helpers. A systems-language implementation of
/// Authenticode doesn't need a full ASN.1 templating layer for these few
/// fixed structures -- it needs a length-returning encoder, which is all
/// these functions are.
pub mod der {
    /// SEQUENCE tag (universal, constructed, tag number 16).
    pub const SEQUENCE: u8 = 0x30;
    /// OCTET STRING tag (universal, primitive, tag number 4).
    pub const OCTET_STRING: u8 = 0x04;
    /// INTEGER tag (universal, primitive, tag number 2).
    pub const INTEGER: u8 = 0x02;
    /// BIT STRING tag (universal, primitive, tag number 3).
    pub const BIT_STRING: u8 = 0x03;
    /// OBJECT IDENTIFIER tag (universal, primitive, tag number 6).
    pub const OBJECT_IDENTIFIER: u8 = 0x06;
    /// NULL tag (universal, primitive, tag number 5).
    pub const NULL: u8 = 0x05;
    /// BMPString tag (universal, primitive, tag number 30).
    pub const BMP_STRING: u8 = 0x1e;
    /// Context-specific, primitive, tag number 0 -- `[0] IMPLICIT`.
    pub const CTX_0_IMPLICIT: u8 = 0x80;
    /// Context-specific, primitive, tag number 1 -- `[1] IMPLICIT`.
    pub const CTX_1_IMPLICIT: u8 = 0x81;
    /// Context-specific, constructed, tag number 0 -- `[0] EXPLICIT`.
    pub const CTX_0_EXPLICIT: u8 = 0xa0;
    /// Context-specific, constructed, tag number 1 -- `[1] EXPLICIT`.
    pub const CTX_1_EXPLICIT: u8 = 0xa1;
    /// Context-specific, constructed, tag number 2 -- `[2] EXPLICIT`.
    pub const CTX_2_EXPLICIT: u8 = 0xa2;

    /// Encode a DER length (definite form, short or long).
    pub fn length(len: usize) -> Vec<u8> {
        if len < 0x80 {
            vec![len as u8]
        } else {
            let bytes = len.to_be_bytes();
            let significant: Vec<u8> = bytes
                .iter()
                .copied()
                .skip_while(|&b| b == 0)
                .collect();
            let mut out = vec![0x80 | significant.len() as u8];
            out.extend(significant);
            out
        }
    }

    /// Wrap `content` in a tag+length+value triplet.
    pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend(length(content.len()));
        out.extend_from_slice(content);
        out
    }

    pub fn integer_u32(value: u32) -> Vec<u8> {
        // These are always small non-negative values in this crate's use
        // (0 or 1), so a single content byte always suffices.
        tlv(INTEGER, &[value as u8])
    }

    pub fn oid_from_dotted(dotted: &str) -> Vec<u8> {
        let parts: Vec<u64> = dotted
            .split('.')
            .map(|p| p.parse().expect("well-formed OID literal"))
            .collect();
        let mut body = vec![(parts[0] * 40 + parts[1]) as u8];
        for &arc in &parts[2..] {
            body.extend(base128(arc));
        }
        tlv(OBJECT_IDENTIFIER, &body)
    }

    fn base128(mut value: u64) -> Vec<u8> {
        let mut out = vec![(value & 0x7f) as u8];
        value >>= 7;
        while value > 0 {
            out.push((value & 0x7f) as u8 | 0x80);
            value >>= 7;
        }
        out.reverse();
        out
    }
}

/// `SPC_INDIRECT_DATA_OBJID`
pub const OID_SPC_INDIRECT_DATA: &str = "1.3.6.1.4.1.311.2.1.4";
/// `SPC_PE_IMAGE_DATA_OBJID`
const OID_SPC_PE_IMAGE_DATA: &str = "1.3.6.1.4.1.311.2.1.15";
/// `SPC_CAB_DATA_OBJID`
const OID_SPC_CAB_DATA: &str = "1.3.6.1.4.1.311.2.1.25";
/// `SPC_SIPINFO_OBJID`
const OID_SPC_SIPINFO: &str = "1.3.6.1.4.1.311.2.1.30";

/// UTF-16BE encoding of the literal string `<<<Obsolete>>>`, which every
/// Authenticode signer emits as the `SpcLink.file` moniker regardless of
/// container type -- a vestige of an early SpcLink scheme that was never
/// completed and is now just a fixed placeholder real-world verifiers
/// ignore.
fn obsolete_bmp_string() -> Vec<u8> {
    "<<<Obsolete>>>".encode_utf16().flat_map(u16::to_be_bytes).collect()
}

/// `SpcString ::= CHOICE { unicode [0] IMPLICIT BMPString, ascii [1] IMPLICIT IA5String }`
/// encoded with the `unicode` alternative.
fn spc_string_unicode_obsolete() -> Vec<u8> {
    der::tlv(der::CTX_0_IMPLICIT, &obsolete_bmp_string())
}

/// `SpcLink ::= CHOICE { url [0], moniker [1], file [2] EXPLICIT SpcString }`
/// encoded with the `file` alternative, always the obsolete placeholder.
fn spc_link_file_obsolete() -> Vec<u8> {
    der::tlv(der::CTX_2_EXPLICIT, &spc_string_unicode_obsolete())
}

/// MSI SIP provider class-id, `{000C10F1-0000-0000-C000-000000000046}`
/// stored as raw GUID bytes (field order as laid out in memory, not the
/// canonical string-form byte order).
const MSI_SIP_CLASS_ID: [u8; 16] = [
    0xf1, 0x10, 0x0c, 0x00, 0x00, 0x00, 0x00, 0x00, 0xc0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x46,
];

/// Builds the container-specific `data` field of `SpcIndirectDataContent`
/// (its object identifier and DER-encoded value) for `file_type`.
fn spc_data_field(file_type: FileType) -> (Vec<u8>, Vec<u8>) {
    match file_type {
        FileType::Cab => (der::oid_from_dotted(OID_SPC_CAB_DATA), spc_link_file_obsolete()),
        FileType::Pe => {
            let flags = der::tlv(der::BIT_STRING, &[0x00]);
            let file = der::tlv(der::CTX_0_EXPLICIT, &spc_link_file_obsolete());
            let mut body = flags;
            body.extend(file);
            (
                der::oid_from_dotted(OID_SPC_PE_IMAGE_DATA),
                der::tlv(der::SEQUENCE, &body),
            )
        }
        FileType::Msi => {
            let mut body = der::integer_u32(1);
            body.extend(der::tlv(der::OCTET_STRING, &MSI_SIP_CLASS_ID));
            for _ in 0..5 {
                body.extend(der::integer_u32(0));
            }
            (
                der::oid_from_dotted(OID_SPC_SIPINFO),
                der::tlv(der::SEQUENCE, &body),
            )
        }
    }
}

fn algorithm_identifier(algorithm: DigestAlgorithm) -> Vec<u8> {
    let mut oid = Vec::new();
    algorithm
        .oid()
        .encode_ref()
        .write_encoded(bcder::Mode::Der, &mut oid)
        .expect("writing to a Vec cannot fail");
    let mut body = oid;
    body.extend(der::tlv(der::NULL, &[]));
    der::tlv(der::SEQUENCE, &body)
}

/// Encodes `SpcIndirectDataContent { data, messageDigest }` with
/// `messageDigest.digest` set to `digest`, returning the full DER
/// (including the outer `SEQUENCE` tag/length).
///
/// Per the double-encoding technique this format requires: callers first
/// invoke this with a zero-filled `digest` of the correct length to learn
/// the encoded length of everything preceding the digest bytes, then
/// invoke it again with the real digest once hashing has completed. See
/// [`outer_header_len`] for computing the splice point analytically
/// instead, which avoids the second full encode.
pub fn encode_indirect_data_content(
    file_type: FileType,
    algorithm: DigestAlgorithm,
    digest: &[u8],
) -> Vec<u8> {
    let (type_oid, data_value) = spc_data_field(file_type);
    let mut data_field = type_oid;
    data_field.extend(data_value);
    let data_field = der::tlv(der::SEQUENCE, &data_field);

    let mut digest_info = algorithm_identifier(algorithm);
    digest_info.extend(der::tlv(der::OCTET_STRING, digest));
    let digest_info = der::tlv(der::SEQUENCE, &digest_info);

    let mut content = data_field;
    content.extend(digest_info);
    der::tlv(der::SEQUENCE, &content)
}

/// Encodes a zero-filled placeholder content and returns it alongside the
/// byte offset at which the real digest bytes begin -- the "splice point"
/// the signed-message builder needs when it patches the real digest in
/// after the blob has already been fed to the signer as authenticated
/// content. Equivalent to the double-encode technique but computed in one
/// pass.
pub fn encode_indirect_data_content_with_splice_point(
    file_type: FileType,
    algorithm: DigestAlgorithm,
) -> (Vec<u8>, usize) {
    let placeholder = vec![0u8; algorithm.hash_len()];
    let full = encode_indirect_data_content(file_type, algorithm, &placeholder);
    let splice_point = full.len() - placeholder.len();
    (full, splice_point)
}

/// Recovers the digest algorithm and the embedded `messageDigest.digest`
/// bytes from an already-decoded `SpcIndirectDataContent`, without a
/// general ASN.1 parser: since every field preceding the digest has a
/// length fixed by `file_type` and the chosen algorithm, the algorithm is
/// identified by which one reproduces `content`'s exact length when the
/// placeholder is encoded with that algorithm's hash width.
pub fn recover_digest(file_type: FileType, content: &[u8]) -> Result<(DigestAlgorithm, Vec<u8>)> {
    for algorithm in [DigestAlgorithm::Md5, DigestAlgorithm::Sha1, DigestAlgorithm::Sha256] {
        let (placeholder, splice_point) = encode_indirect_data_content_with_splice_point(file_type, algorithm);
        if placeholder.len() == content.len() {
            return Ok((algorithm, content[splice_point..].to_vec()));
        }
    }
    Err(AuthenticodeError::VerificationFailed(
        "signed content length does not match any supported digest algorithm".into(),
    ))
}

/// `SpcSerializedObject.classId` marking a nested page-hash attribute inside
/// a PE's `SpcPeImageData.file` moniker.
const PAGE_HASH_CLASS_ID: [u8; 16] = [
    0xa6, 0xb5, 0x86, 0xd5, 0xb4, 0xa1, 0x24, 0x66, 0xae, 0x05, 0xa2, 0x17, 0xda, 0x8e, 0x60, 0xd6,
];

/// SHA-1 page-hash variant OID, `1.3.6.1.4.1.311.2.3.1`.
const OID_PAGE_HASH_V1: &str = "1.3.6.1.4.1.311.2.3.1";
/// SHA-256 page-hash variant OID, `1.3.6.1.4.1.311.2.3.2`.
const OID_PAGE_HASH_V2: &str = "1.3.6.1.4.1.311.2.3.2";

/// Looks for a page-hash extension nested inside a PE signature's content
/// and, if present, returns the algorithm name and a short preview of the
/// per-page hash table. This is read-only: page hashes are never generated
/// by this crate, only displayed when a signer already attached one.
///
/// The search is a byte-level scan for the fixed `classId` marker followed
/// by one of the two known variant OIDs, rather than a full recursive
/// descent through `SpcSerializedObject`/`SpcAttributeTypeAndOptionalValue` --
/// adequate for display purposes, since the marker and OID together are
/// vanishingly unlikely to occur by coincidence in signed content.
pub fn find_page_hash_preview(content: &[u8]) -> Option<(&'static str, Vec<u8>)> {
    let marker_pos = content
        .windows(PAGE_HASH_CLASS_ID.len())
        .position(|w| w == PAGE_HASH_CLASS_ID)?;
    let after_marker = &content[marker_pos + PAGE_HASH_CLASS_ID.len()..];

    for (label, oid) in [("sha1", OID_PAGE_HASH_V1), ("sha256", OID_PAGE_HASH_V2)] {
        let oid_der = der::oid_from_dotted(oid);
        if let Some(oid_pos) = after_marker
            .windows(oid_der.len())
            .position(|w| w == oid_der.as_slice())
        {
            let preview_start = oid_pos + oid_der.len();
            let preview_end = (preview_start + 32).min(after_marker.len());
            return Some((label, after_marker[preview_start..preview_end].to_vec()));
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn obsolete_string_matches_reference_bytes() {
        // Verbatim UTF-16BE encoding of "<<<Obsolete>>>".
        let expected: [u8; 28] = [
            0x00, 0x3c, 0x00, 0x3c, 0x00, 0x3c, 0x00, 0x4f, 0x00, 0x62, 0x00, 0x73, 0x00, 0x6f,
            0x00, 0x6c, 0x00, 0x65, 0x00, 0x74, 0x00, 0x65, 0x00, 0x3e, 0x00, 0x3e, 0x00, 0x3e,
        ];
        assert_eq!(obsolete_bmp_string(), expected);
    }

    #[test]
    fn length_short_and_long_form() {
        assert_eq!(der::length(5), vec![5]);
        assert_eq!(der::length(127), vec![127]);
        assert_eq!(der::length(128), vec![0x81, 128]);
        assert_eq!(der::length(300), vec![0x82, 0x01, 0x2c]);
    }

    #[test]
    fn oid_encoding_matches_known_vector() {
        // 1.3.6.1.4.1.311.2.1.4 -> 2B 06 01 04 01 82 37 02 01 04
        let encoded = der::oid_from_dotted(OID_SPC_INDIRECT_DATA);
        assert_eq!(
            encoded,
            vec![0x06, 0x0a, 0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x02, 0x01, 0x04]
        );
    }

    #[test]
    fn splice_point_lands_on_digest_bytes() {
        let (full, splice) =
            encode_indirect_data_content_with_splice_point(FileType::Pe, DigestAlgorithm::Sha256);
        assert_eq!(&full[splice..], &[0u8; 32][..]);

        let real = encode_indirect_data_content(FileType::Pe, DigestAlgorithm::Sha256, &[7u8; 32]);
        assert_eq!(real.len(), full.len());
        assert_eq!(&real[splice..], &[7u8; 32][..]);
        assert_eq!(&real[..splice], &full[..splice]);
    }

    #[test]
    fn recover_digest_identifies_algorithm_by_length() {
        for (file_type, algorithm) in [
            (FileType::Pe, DigestAlgorithm::Md5),
            (FileType::Cab, DigestAlgorithm::Sha1),
            (FileType::Msi, DigestAlgorithm::Sha256),
        ] {
            let digest = vec![0x42u8; algorithm.hash_len()];
            let content = encode_indirect_data_content(file_type, algorithm, &digest);
            let (recovered_algorithm, recovered_digest) = recover_digest(file_type, &content).unwrap();
            assert_eq!(recovered_algorithm, algorithm);
            assert_eq!(recovered_digest, digest);
        }
    }

    #[test]
    fn page_hash_preview_finds_embedded_marker() {
        let mut content = vec![0xaa; 10];
        content.extend_from_slice(&PAGE_HASH_CLASS_ID);
        content.extend_from_slice(&der::oid_from_dotted(OID_PAGE_HASH_V2));
        content.extend_from_slice(&[0x11; 40]);

        let (label, preview) = find_page_hash_preview(&content).unwrap();
        assert_eq!(label, "sha256");
        assert_eq!(preview, vec![0x11; 32]);
    }

    #[test]
    fn page_hash_preview_absent_returns_none() {
        let content = vec![0u8; 64];
        assert!(find_page_hash_preview(&content).is_none());
    }

    #[test]
    fn msi_sip_class_id_matches_reference_bytes() {
        let expected: [u8; 16] = [
            0xf1, 0x10, 0x0c, 0x00, 0x00, 0x00, 0x00, 0x00, 0xc0, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x46,
        ];
        assert_eq!(MSI_SIP_CLASS_ID, expected);
    }
}
