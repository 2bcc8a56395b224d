// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MSI (OLE compound document) Authenticode handling.
//!
//! An MSI's digest covers every stream's raw bytes, visited in the
//! canonical name order the format mandates, followed by the root
//! storage's class id. Internal stream/storage names are obfuscated
//! through a fixed per-character substitution; decoding them is needed
//! only to compare names in the right order, since storage writers
//! otherwise copy the original encoded name bytes unchanged.

use std::cmp::Ordering;
use std::io::{Read, Write};
use std::path::Path;

use crate::{
    digest::DigestAlgorithm,
    error::{AuthenticodeError, Result},
};

/// Name of the stream that carries the Authenticode signature, stored
/// unobfuscated -- it begins with a control byte below the range the
/// encoding scheme ever touches, so it passes through [`decode_name`]
/// unchanged.
pub const SIGNATURE_STREAM_NAME: &str = "\u{5}DigitalSignature";

const MSI_NAME_MARKER: [u8; 3] = [0xe4, 0xa1, 0x80];

fn base64_alphabet_decode(x: u8) -> u8 {
    match x {
        0..=9 => b'0' + x,
        10..=35 => b'A' + (x - 10),
        36..=61 => b'a' + (x - 36),
        62 => b'.',
        _ => 1,
    }
}

/// Decodes an MSI internal stream/storage name into the UTF-8 text it
/// represents. Names that were never obfuscated (plain ASCII, including
/// the reserved `\5`-prefixed stream names) round-trip unchanged.
pub fn decode_name(name: &[u8]) -> Vec<u8> {
    let input = if name.starts_with(&MSI_NAME_MARKER) {
        &name[3..]
    } else {
        name
    };
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let ch = input[i];
        if (ch == 0xe3 && i + 2 < input.len() && input[i + 1] >= 0xa0)
            || (ch == 0xe4 && i + 2 < input.len() && input[i + 1] < 0xa0)
        {
            out.push(base64_alphabet_decode(input[i + 2] & 0x7f));
            out.push(base64_alphabet_decode(input[i + 1] ^ 0xa0));
            i += 3;
            continue;
        }
        if ch == 0xe4 && i + 2 < input.len() && input[i + 1] == 0xa0 {
            out.push(base64_alphabet_decode(input[i + 2] & 0x7f));
            i += 3;
            continue;
        }
        out.push(ch);
        i += 1;
        if ch >= 0xc1 && i < input.len() {
            out.push(input[i]);
            i += 1;
        }
        if ch >= 0xe0 && i < input.len() {
            out.push(input[i]);
            i += 1;
        }
        if ch >= 0xf0 && i < input.len() {
            out.push(input[i]);
            i += 1;
        }
    }
    out
}

/// UTF-16LE re-encoding of a decoded name, the form the canonical
/// comparator actually compares.
fn canonical_key(name: &[u8]) -> Vec<u8> {
    let decoded = decode_name(name);
    let text = String::from_utf8_lossy(&decoded);
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Orders two internal names the way MSI's stream enumeration does: a
/// byte-wise comparison of their canonical UTF-16 encodings, truncated to
/// the shorter of the two, with ties broken in favor of the longer name.
pub fn compare_names(a: &[u8], b: &[u8]) -> Ordering {
    let ka = canonical_key(a);
    let kb = canonical_key(b);
    let n = ka.len().min(kb.len());
    match ka[..n].cmp(&kb[..n]) {
        Ordering::Equal => ka.len().cmp(&kb.len()),
        other => other,
    }
}

pub struct MsiHandler {
    path: std::path::PathBuf,
}

impl MsiHandler {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn ordered_stream_names(comp: &cfb::CompoundFile<std::fs::File>) -> Vec<std::path::PathBuf> {
        let mut names: Vec<std::path::PathBuf> = comp
            .walk()
            .filter(|entry| entry.is_stream())
            .map(|entry| entry.path().to_path_buf())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n != SIGNATURE_STREAM_NAME)
                    .unwrap_or(true)
            })
            .collect();
        names.sort_by(|a, b| {
            let an = a.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let bn = b.file_name().and_then(|n| n.to_str()).unwrap_or("");
            compare_names(an.as_bytes(), bn.as_bytes())
        });
        names
    }

    /// Digests every stream's content in canonical order, then the root
    /// storage's class id.
    pub fn digest(&self, algorithm: DigestAlgorithm) -> Result<Vec<u8>> {
        let mut comp = cfb::open(&self.path)
            .map_err(|e| AuthenticodeError::Cfb(format!("opening MSI compound document: {e}")))?;
        let names = Self::ordered_stream_names(&comp);

        let mut hasher = algorithm.as_hasher();
        for name in &names {
            let mut stream = comp
                .open_stream(name)
                .map_err(|e| AuthenticodeError::Cfb(format!("opening stream {name:?}: {e}")))?;
            let mut buf = [0u8; 8192];
            loop {
                let n = stream
                    .read(&mut buf)
                    .map_err(|e| AuthenticodeError::Cfb(format!("reading stream {name:?}: {e}")))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        hasher.update(comp.root_entry().clsid().as_bytes());
        Ok(hasher.finish())
    }

    /// Writes a copy of the MSI with `signature_der` inserted (or replaced)
    /// as the `\5DigitalSignature` stream.
    pub fn sign(&self, output_path: &Path, signature_der: &[u8]) -> Result<()> {
        let mut src = cfb::open(&self.path)
            .map_err(|e| AuthenticodeError::Cfb(format!("opening MSI compound document: {e}")))?;
        let names = Self::ordered_stream_names(&src);
        let root_clsid = *src.root_entry().clsid();

        if output_path.exists() {
            std::fs::remove_file(output_path)?;
        }
        let mut dst = cfb::create(output_path)
            .map_err(|e| AuthenticodeError::Cfb(format!("creating output MSI: {e}")))?;
        dst.set_storage_clsid("/", root_clsid)
            .map_err(|e| AuthenticodeError::Cfb(format!("setting root class id: {e}")))?;

        for name in &names {
            if let Some(parent) = name.parent() {
                if parent != Path::new("/") && parent != Path::new("") {
                    let _ = dst.create_storage(parent);
                }
            }
            let mut reader = src
                .open_stream(name)
                .map_err(|e| AuthenticodeError::Cfb(format!("opening stream {name:?}: {e}")))?;
            let mut writer = dst
                .create_stream(name)
                .map_err(|e| AuthenticodeError::Cfb(format!("creating stream {name:?}: {e}")))?;
            std::io::copy(&mut reader, &mut writer)
                .map_err(|e| AuthenticodeError::Cfb(format!("copying stream {name:?}: {e}")))?;
        }

        let mut sig_stream = dst
            .create_stream(SIGNATURE_STREAM_NAME)
            .map_err(|e| AuthenticodeError::Cfb(format!("creating signature stream: {e}")))?;
        sig_stream.write_all(signature_der)?;
        Ok(())
    }

    /// Extracts the raw PKCS#7 DER from the signature stream, if present.
    pub fn extract_signature(&self) -> Result<Option<Vec<u8>>> {
        let mut comp = cfb::open(&self.path)
            .map_err(|e| AuthenticodeError::Cfb(format!("opening MSI compound document: {e}")))?;
        if !comp.exists(SIGNATURE_STREAM_NAME) {
            return Ok(None);
        }
        let mut stream = comp
            .open_stream(SIGNATURE_STREAM_NAME)
            .map_err(|e| AuthenticodeError::Cfb(format!("opening signature stream: {e}")))?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    /// Writes a copy of the MSI with the signature stream removed.
    pub fn remove_signature(&self, output_path: &Path) -> Result<()> {
        let mut src = cfb::open(&self.path)
            .map_err(|e| AuthenticodeError::Cfb(format!("opening MSI compound document: {e}")))?;
        let names = Self::ordered_stream_names(&src);
        let root_clsid = *src.root_entry().clsid();

        if output_path.exists() {
            std::fs::remove_file(output_path)?;
        }
        let mut dst = cfb::create(output_path)
            .map_err(|e| AuthenticodeError::Cfb(format!("creating output MSI: {e}")))?;
        dst.set_storage_clsid("/", root_clsid)
            .map_err(|e| AuthenticodeError::Cfb(format!("setting root class id: {e}")))?;

        for name in &names {
            let mut reader = src
                .open_stream(name)
                .map_err(|e| AuthenticodeError::Cfb(format!("opening stream {name:?}: {e}")))?;
            let mut writer = dst
                .create_stream(name)
                .map_err(|e| AuthenticodeError::Cfb(format!("creating stream {name:?}: {e}")))?;
            std::io::copy(&mut reader, &mut writer)
                .map_err(|e| AuthenticodeError::Cfb(format!("copying stream {name:?}: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_name_passes_through_ascii() {
        assert_eq!(decode_name(b"Property"), b"Property");
        assert_eq!(
            decode_name(SIGNATURE_STREAM_NAME.as_bytes()),
            SIGNATURE_STREAM_NAME.as_bytes()
        );
    }

    #[test]
    fn decode_name_strips_marker_prefix() {
        let mut name = MSI_NAME_MARKER.to_vec();
        name.extend_from_slice(b"Binary");
        assert_eq!(decode_name(&name), b"Binary");
    }

    #[test]
    fn compare_names_orders_by_utf16_then_length() {
        assert_eq!(compare_names(b"AAA", b"AAB"), Ordering::Less);
        assert_eq!(compare_names(b"AA", b"AAB"), Ordering::Less);
        assert_eq!(compare_names(b"AAB", b"AA"), Ordering::Greater);
        assert_eq!(compare_names(b"same", b"same"), Ordering::Equal);
    }
}
