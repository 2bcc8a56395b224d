// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counter-signing an Authenticode signature against a timestamp authority.
//!
//! Two incompatible protocols exist in the wild: the legacy Authenticode
//! protocol (a bare base64-encoded PKCS#7 signature value POSTed over
//! HTTP, countersigned with the `pkcs9-countersignature` attribute) and
//! RFC 3161's Time-Stamp Protocol (`-ts`, countersigned with
//! `id-smime-aa-timeStampToken`). [`cryptographic_message_syntax`] already
//! implements the RFC 3161 side through `SignerBuilder::time_stamp_url`;
//! this module adds the legacy side, which the CMS library has no concept
//! of.

use bcder::{encode::Values, Captured, Mode, Oid};
use bytes::Bytes;
use cryptographic_message_syntax::asn1::rfc5652::{
    Attribute, AttributeValue, SignedData, UnsignedAttributes,
};

use crate::{
    authenticode::der::{oid_from_dotted, tlv, CTX_0_EXPLICIT, OBJECT_IDENTIFIER, OCTET_STRING, SEQUENCE},
    error::{AuthenticodeError, Result},
};

/// `pkcs9-countersignature`, 1.2.840.113549.1.9.6.
const OID_COUNTERSIGNATURE: [u8; 9] = [0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x09, 0x06];

/// `SPC_TIME_STAMP_REQUEST_OBJID`, the legacy protocol's outer wrapper OID.
const OID_SPC_TIME_STAMP_REQUEST: &str = "1.3.6.1.4.1.311.3.2.1";
/// `pkcs7-data`, the blob type the legacy protocol always uses.
const OID_PKCS7_DATA: &str = "1.2.840.113549.1.7.1";

/// Builds the legacy protocol's request body:
/// `TimeStampRequest ::= SEQUENCE { type OBJECT IDENTIFIER, blob
/// TimeStampRequestBlob }`, `TimeStampRequestBlob ::= SEQUENCE { type
/// OBJECT IDENTIFIER, signature [0] EXPLICIT OCTET STRING }`, with `type`
/// always `SPC_TIME_STAMP_REQUEST_OBJID` and the blob's `type` always
/// `pkcs7-data`. A bare base64 of the signature value, with no wrapper at
/// all, is not a request a real legacy TSA accepts.
fn encode_legacy_request(signature: &[u8]) -> Vec<u8> {
    let signature_octet_string = tlv(OCTET_STRING, signature);
    let mut blob_body = tlv(OBJECT_IDENTIFIER, &oid_from_dotted(OID_PKCS7_DATA));
    blob_body.extend(tlv(CTX_0_EXPLICIT, &signature_octet_string));
    let blob = tlv(SEQUENCE, &blob_body);

    let mut request_body = tlv(OBJECT_IDENTIFIER, &oid_from_dotted(OID_SPC_TIME_STAMP_REQUEST));
    request_body.extend(blob);
    tlv(SEQUENCE, &request_body)
}

const LEGACY_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone)]
pub enum TimestampRequest {
    /// RFC 3161 Time-Stamp Protocol; handled entirely by
    /// `cryptographic_message_syntax`'s own signer, so this variant just
    /// carries the server URL through to it.
    Rfc3161 { url: String },
    /// Legacy Authenticode timestamp protocol.
    Legacy { url: String, proxy: Option<String> },
}

/// Builds a blocking HTTP client honoring an optional `http:`/`socks:`
/// proxy URL, the same prefix convention curl uses.
fn build_client(proxy: Option<&str>) -> Result<reqwest::blocking::Client> {
    let mut builder = reqwest::blocking::Client::builder();
    if let Some(proxy_url) = proxy {
        let proxy = if proxy_url.starts_with("socks:") {
            reqwest::Proxy::all(format!("socks5://{}", &proxy_url[6..]))
        } else if proxy_url.starts_with("http:") {
            reqwest::Proxy::all(proxy_url)
        } else {
            reqwest::Proxy::all(format!("http://{proxy_url}"))
        }
        .map_err(|e| AuthenticodeError::TimestampFailed(format!("invalid proxy URL: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| AuthenticodeError::TimestampFailed(format!("building HTTP client: {e}")))
}

/// Applies a legacy Authenticode countersignature to an already-built
/// PKCS#7 `ContentInfo` DER, returning the updated DER with the
/// countersignature embedded as an unsigned attribute on the sole signer.
pub fn apply_legacy(der: &[u8], url: &str, proxy: Option<&str>) -> Result<Vec<u8>> {
    let mut signed_data = SignedData::decode_ber(der)
        .map_err(|e| AuthenticodeError::TimestampFailed(format!("re-decoding our own signature: {e}")))?;

    let signer_info = signed_data
        .signer_infos
        .first_mut()
        .ok_or_else(|| AuthenticodeError::TimestampFailed("no signer present to countersign".into()))?;

    let signature_bytes = signer_info.signature.to_bytes().to_vec();

    let client = build_client(proxy)?;
    let body = base64::encode(encode_legacy_request(&signature_bytes));
    let response = client
        .post(url)
        .header("Content-Type", LEGACY_CONTENT_TYPE)
        .body(body)
        .send()
        .map_err(|e| AuthenticodeError::TimestampFailed(format!("contacting timestamp server: {e}")))?;

    if !response.status().is_success() {
        return Err(AuthenticodeError::TimestampFailed(format!(
            "timestamp server returned HTTP {}",
            response.status()
        )));
    }

    let body_text = response
        .text()
        .map_err(|e| AuthenticodeError::TimestampFailed(format!("reading timestamp response: {e}")))?;
    // Some TSAs wrap their base64 response across multiple lines; strip all
    // whitespace rather than just the ends, or embedded newlines make the
    // decode fail.
    let body_stripped: String = body_text.chars().filter(|c| !c.is_whitespace()).collect();
    let countersignature_der = base64::decode(&body_stripped)
        .map_err(|e| AuthenticodeError::TimestampFailed(format!("decoding base64 response: {e}")))?;

    // The server's response is itself a complete `ContentInfo`-wrapped
    // `SignedData`; re-parse it so we can re-emit it as a captured value
    // rather than guessing at a raw-bytes encoder.
    let countersignature = SignedData::decode_ber(&countersignature_der).map_err(|e| {
        AuthenticodeError::TimestampFailed(format!("decoding countersignature response: {e}"))
    })?;

    let mut unsigned_attributes = UnsignedAttributes::default();
    unsigned_attributes.push(Attribute {
        typ: Oid(Bytes::copy_from_slice(&OID_COUNTERSIGNATURE)),
        values: vec![AttributeValue::new(Captured::from_values(
            Mode::Der,
            countersignature.encode_ref(),
        ))],
    });
    signer_info.unsigned_attributes = Some(unsigned_attributes);

    let mut out = Vec::new();
    signed_data
        .encode_ref()
        .write_encoded(Mode::Der, &mut out)
        .map_err(|e| AuthenticodeError::TimestampFailed(format!("re-encoding signature: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn legacy_request_wraps_signature_per_reference_layout() {
        let signature = b"fake-signature-bytes";
        let request = encode_legacy_request(signature);

        assert_eq!(request[0], SEQUENCE);
        let outer_oid = tlv(OBJECT_IDENTIFIER, &oid_from_dotted(OID_SPC_TIME_STAMP_REQUEST));
        assert_eq!(&request[2..2 + outer_oid.len()], &outer_oid[..]);

        let blob_start = 2 + outer_oid.len();
        assert_eq!(request[blob_start], SEQUENCE);

        let inner_oid = tlv(OBJECT_IDENTIFIER, &oid_from_dotted(OID_PKCS7_DATA));
        let blob_body_start = blob_start + 2;
        assert_eq!(&request[blob_body_start..blob_body_start + inner_oid.len()], &inner_oid[..]);

        let signature_field_start = blob_body_start + inner_oid.len();
        assert_eq!(request[signature_field_start], CTX_0_EXPLICIT);
        let octet_string = tlv(OCTET_STRING, signature);
        assert_eq!(
            &request[signature_field_start + 2..signature_field_start + 2 + octet_string.len()],
            &octet_string[..]
        );
    }

    #[test]
    fn legacy_base64_decode_tolerates_embedded_newlines() {
        let request = encode_legacy_request(b"some signature");
        let encoded = base64::encode(&request);
        let mut wrapped = String::new();
        for chunk in encoded.as_bytes().chunks(16) {
            wrapped.push_str(std::str::from_utf8(chunk).unwrap());
            wrapped.push('\n');
        }
        let stripped: String = wrapped.chars().filter(|c| !c.is_whitespace()).collect();
        assert_eq!(base64::decode(&stripped).unwrap(), request);
    }
}
