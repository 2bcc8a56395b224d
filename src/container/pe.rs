// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Portable Executable (PE/PE32+) Authenticode handling: digesting,
//! embedding, stripping, and extracting the certificate table.

use crate::{
    byte_window::{ByteWindow, OutputSink},
    digest::DigestAlgorithm,
    error::{AuthenticodeError, Result},
};

const WIN_CERT_REVISION_2: u16 = 0x0200;
const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;

/// Layout facts about a PE file, established once on open and treated as
/// immutable afterward.
#[derive(Debug, Clone, Copy)]
pub struct PeLayout {
    pub pe_header_offset: usize,
    pub is_pe32plus: bool,
    /// Offset of the certificate-table data directory entry (the 5th of
    /// the data directories: a `(u32 offset, u32 size)` pair).
    pub cert_dir_offset: usize,
    pub sig_table_pos: u32,
    pub sig_table_len: u32,
    pub file_end: usize,
}

impl PeLayout {
    pub fn parse(data: &ByteWindow) -> Result<Self> {
        if data.len() < 64 {
            return Err(AuthenticodeError::CorruptContainer(
                "file shorter than a minimal MS-DOS header".into(),
            ));
        }
        let pe_header_offset = data.read_u32_le(60)? as usize;
        if data.len() < pe_header_offset + 160 {
            return Err(AuthenticodeError::CorruptContainer(
                "file too short to contain a full PE optional header".into(),
            ));
        }
        if data.slice(pe_header_offset, pe_header_offset + 4)? != &b"PE\0\0"[..] {
            return Err(AuthenticodeError::CorruptContainer(
                "missing PE\\0\\0 signature at the COFF header offset".into(),
            ));
        }
        let magic = data.read_u16_le(pe_header_offset + 24)?;
        let is_pe32plus = match magic {
            0x10b => false,
            0x20b => true,
            other => {
                return Err(AuthenticodeError::CorruptContainer(format!(
                    "unknown optional header magic 0x{other:x}"
                )))
            }
        };
        let plus_off = if is_pe32plus { 16 } else { 0 };
        let num_rva = data.read_u32_le(pe_header_offset + 116 + plus_off)?;
        if num_rva < 5 {
            return Err(AuthenticodeError::CorruptContainer(
                "fewer than 5 data directories; no certificate table slot".into(),
            ));
        }
        let cert_dir_offset = pe_header_offset + 152 + plus_off;
        let sig_table_pos = data.read_u32_le(cert_dir_offset)?;
        let sig_table_len = data.read_u32_le(cert_dir_offset + 4)?;
        let file_end = data.len();
        if sig_table_len != 0 && sig_table_pos as usize + sig_table_len as usize != file_end {
            return Err(AuthenticodeError::CorruptContainer(
                "existing certificate table is not located at end-of-file".into(),
            ));
        }
        Ok(Self {
            pe_header_offset,
            is_pe32plus,
            cert_dir_offset,
            sig_table_pos,
            sig_table_len,
            file_end,
        })
    }

    fn optional_header_tail_len(&self) -> usize {
        60 + if self.is_pe32plus { 16 } else { 0 }
    }

    /// The end of content that is actually signed: the existing
    /// certificate table position if a signature is already present,
    /// otherwise the end of the file.
    fn content_end(&self) -> usize {
        if self.sig_table_len != 0 {
            self.sig_table_pos as usize
        } else {
            self.file_end
        }
    }
}

pub struct PeHandler<'a> {
    data: &'a ByteWindow,
    pub layout: PeLayout,
}

impl<'a> PeHandler<'a> {
    pub fn open(data: &'a ByteWindow) -> Result<Self> {
        let layout = PeLayout::parse(data)?;
        Ok(Self { data, layout })
    }

    /// Computes the Authenticode digest over this PE's signed byte ranges:
    /// everything up to the checksum field, everything from past the
    /// checksum to the certificate-directory entry, everything past that
    /// entry up to the existing certificate table (or end of file), padded
    /// to an 8-byte boundary.
    pub fn digest(&self, algorithm: DigestAlgorithm) -> Result<Vec<u8>> {
        let raw = self.data.as_slice();
        let peheader = self.layout.pe_header_offset;
        let tail_len = self.layout.optional_header_tail_len();
        let content_end = self.layout.content_end();

        let mut hasher = algorithm.as_hasher();
        hasher.update(&raw[0..peheader + 88]);
        // skip the 4-byte checksum field
        hasher.update(&raw[peheader + 92..peheader + 92 + tail_len]);
        // skip the 8-byte certificate-directory entry
        let rest_start = peheader + 92 + tail_len + 8;
        hasher.update(&raw[rest_start..content_end]);

        // Padding aligns the file's own content length, not the number of
        // bytes actually hashed (which is 12 bytes shorter: the skipped
        // checksum field and certificate-directory entry). `sign()` pads
        // `buf.len()` at the same point in its layout, which is exactly
        // `content_end` here.
        let pad = (8 - content_end % 8) % 8;
        if pad > 0 {
            hasher.update(&vec![0u8; pad]);
        }
        Ok(hasher.finish())
    }

    /// Writes a new PE file with `signature_der` embedded as the
    /// certificate table, and a freshly computed image checksum.
    pub fn sign(&self, output: &mut OutputSink, signature_der: &[u8]) -> Result<()> {
        let raw = self.data.as_slice();
        let peheader = self.layout.pe_header_offset;
        let tail_len = self.layout.optional_header_tail_len();
        let content_end = self.layout.content_end();
        let rest_start = peheader + 92 + tail_len + 8;

        let mut buf = Vec::with_capacity(content_end + signature_der.len() + 64);
        buf.extend_from_slice(&raw[0..peheader + 88]);
        buf.extend_from_slice(&[0u8; 4]); // checksum, patched below
        buf.extend_from_slice(&raw[peheader + 92..peheader + 92 + tail_len]);
        buf.extend_from_slice(&[0u8; 8]); // cert dir entry, patched below
        buf.extend_from_slice(&raw[rest_start..content_end]);
        let pad_before_cert = (8 - buf.len() % 8) % 8;
        buf.extend(std::iter::repeat(0u8).take(pad_before_cert));

        let sig_table_pos = buf.len() as u32;
        let cert_padlen = (8 - signature_der.len() % 8) % 8;
        let win_cert_len = (signature_der.len() + 8 + cert_padlen) as u32;

        buf.extend_from_slice(&win_cert_len.to_le_bytes());
        buf.extend_from_slice(&WIN_CERT_REVISION_2.to_le_bytes());
        buf.extend_from_slice(&WIN_CERT_TYPE_PKCS_SIGNED_DATA.to_le_bytes());
        buf.extend_from_slice(signature_der);
        buf.extend(std::iter::repeat(0u8).take(cert_padlen));

        buf[self.layout.cert_dir_offset..self.layout.cert_dir_offset + 4]
            .copy_from_slice(&sig_table_pos.to_le_bytes());
        buf[self.layout.cert_dir_offset + 4..self.layout.cert_dir_offset + 8]
            .copy_from_slice(&win_cert_len.to_le_bytes());

        let checksum = calc_checksum(&buf, peheader);
        buf[peheader + 88..peheader + 92].copy_from_slice(&checksum.to_le_bytes());

        output.write_all(&buf)
    }

    /// Writes a copy of the file with the certificate table directory
    /// entry zeroed and the checksum recomputed.
    pub fn remove_signature(&self, output: &mut OutputSink) -> Result<()> {
        let raw = self.data.as_slice();
        let content_end = self.layout.content_end();
        let mut buf = raw[0..content_end].to_vec();
        buf[self.layout.pe_header_offset + 88..self.layout.pe_header_offset + 92]
            .copy_from_slice(&[0u8; 4]);
        buf[self.layout.cert_dir_offset..self.layout.cert_dir_offset + 8]
            .copy_from_slice(&[0u8; 8]);
        let checksum = calc_checksum(&buf, self.layout.pe_header_offset);
        buf[self.layout.pe_header_offset + 88..self.layout.pe_header_offset + 92]
            .copy_from_slice(&checksum.to_le_bytes());
        output.write_all(&buf)
    }

    /// The raw certificate-table payload (the `WIN_CERTIFICATE` record's
    /// bytes past its 8-byte header), if a certificate table is present.
    pub fn signature_bytes(&self) -> Result<Option<&'a [u8]>> {
        if self.layout.sig_table_len == 0 {
            return Ok(None);
        }
        let start = self.layout.sig_table_pos as usize + 8;
        let end = self.layout.sig_table_pos as usize + self.layout.sig_table_len as usize;
        Ok(Some(self.data.slice(start, end)?))
    }

    /// Writes the raw certificate-table payload to `output`.
    pub fn extract_signature(&self, output: &mut OutputSink) -> Result<()> {
        let bytes = self.signature_bytes()?.ok_or_else(|| {
            AuthenticodeError::VerificationFailed("file has no certificate table to extract".into())
        })?;
        output.write_all(bytes)
    }
}

/// Microsoft's PE image checksum: the 16-bit-word sum of the entire file
/// (the checksum field itself treated as zero), folded and finally
/// incremented by the count of bytes actually summed. If the file has an
/// odd length the final single byte is not included in the sum: the
/// algorithm sums whole 16-bit words and simply stops when fewer than two
/// bytes remain.
pub fn calc_checksum(data: &[u8], peheader: usize) -> u32 {
    let mut checksum: u32 = 0;
    let mut size: u32 = 0;
    let mut offset = 0usize;
    while offset + 2 <= data.len() {
        let word = if offset == peheader + 88 || offset == peheader + 90 {
            0u16
        } else {
            u16::from_le_bytes([data[offset], data[offset + 1]])
        };
        checksum += word as u32;
        checksum = (checksum & 0xffff) + (checksum >> 16);
        size += 2;
        offset += 2;
    }
    checksum = (checksum & 0xffff) + (checksum >> 16);
    checksum &= 0xffff;
    checksum + size
}

#[cfg(test)]
mod test {
    use super::*;

    /// Builds a minimal, well-formed unsigned PE32 image for tests: an
    /// MS-DOS stub pointing at a COFF/PE header with a 16-directory
    /// optional header and a little trailing "section" content.
    fn synthetic_pe32(extra_tail: &[u8]) -> Vec<u8> {
        let peheader = 0x80usize;
        let mut data = vec![0u8; peheader];
        data[0] = b'M';
        data[1] = b'Z';
        data[60..64].copy_from_slice(&(peheader as u32).to_le_bytes());

        data.extend_from_slice(b"PE\0\0");
        data.extend(std::iter::repeat(0u8).take(20)); // COFF header (unused by us)
        debug_assert_eq!(data.len(), peheader + 24);

        data.extend_from_slice(&0x10bu16.to_le_bytes()); // magic: PE32
        // Bytes from peheader+26 up to peheader+116 (90 bytes) of filler.
        data.extend(std::iter::repeat(0u8).take(90));
        debug_assert_eq!(data.len(), peheader + 116);
        data.extend_from_slice(&16u32.to_le_bytes()); // NumberOfRvaAndSizes
        debug_assert_eq!(data.len(), peheader + 120);
        // Filler up to peheader+152 (32 bytes): covers the checksum field
        // at peheader+88 (already past, since 120 > 88... wait, need checksum before 116)
        data.extend(std::iter::repeat(0u8).take(32));
        debug_assert_eq!(data.len(), peheader + 152);
        // 16 data directories (8 bytes each) = 128 bytes, zeroed (cert dir is #5).
        data.extend(std::iter::repeat(0u8).take(128));
        debug_assert_eq!(data.len(), peheader + 280);

        data.extend_from_slice(extra_tail);
        data
    }

    fn write_checksum_and_body_offsets(data: &mut [u8], peheader: usize) {
        let checksum = calc_checksum(data, peheader);
        data[peheader + 88..peheader + 92].copy_from_slice(&checksum.to_le_bytes());
    }

    #[test]
    fn parses_minimal_pe32() {
        let data = synthetic_pe32(b"trailing section bytes");
        let window_bytes = data.clone();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.exe");
        std::fs::write(&path, &window_bytes).unwrap();
        let window = ByteWindow::open(&path).unwrap();
        let layout = PeLayout::parse(&window).unwrap();
        assert_eq!(layout.pe_header_offset, 0x80);
        assert!(!layout.is_pe32plus);
        assert_eq!(layout.sig_table_len, 0);
    }

    #[test]
    fn sign_then_digest_matches_embedded_placeholder_digest() {
        let mut data = synthetic_pe32(b"trailing section bytes");
        let peheader = 0x80;
        write_checksum_and_body_offsets(&mut data, peheader);

        let dir = tempfile::tempdir().unwrap();
        let in_path = dir.path().join("in.exe");
        std::fs::write(&in_path, &data).unwrap();
        let window = ByteWindow::open(&in_path).unwrap();
        let handler = PeHandler::open(&window).unwrap();

        let digest = handler.digest(DigestAlgorithm::Sha256).unwrap();
        assert_eq!(digest.len(), 32);

        let out_path = dir.path().join("out.exe");
        let mut sink = OutputSink::create(&out_path).unwrap();
        handler.sign(&mut sink, b"fake-pkcs7-der-bytes").unwrap();
        sink.finish().unwrap();

        let signed = std::fs::read(&out_path).unwrap();
        let signed_window_path = dir.path().join("signed-for-reopen.exe");
        std::fs::write(&signed_window_path, &signed).unwrap();
        let signed_window = ByteWindow::open(&signed_window_path).unwrap();
        let signed_layout = PeLayout::parse(&signed_window).unwrap();
        assert_ne!(signed_layout.sig_table_len, 0);
        assert_eq!(
            signed_layout.sig_table_pos as usize + signed_layout.sig_table_len as usize,
            signed.len()
        );
    }

    #[test]
    fn digest_before_signing_matches_digest_recomputed_after_signing() {
        // Regression test: the pre-sign digest must agree with whatever a
        // verifier recomputes by reopening the signed file and hashing its
        // (now-shorter) content range the same way. Padding has to align
        // on the file's content length in both cases, not on however many
        // bytes happen to pass through the hasher.
        let mut data = synthetic_pe32(b"12345678"); // content_end ends up a multiple of 8
        let peheader = 0x80;
        write_checksum_and_body_offsets(&mut data, peheader);
        assert_eq!(data.len() % 8, 0);

        let dir = tempfile::tempdir().unwrap();
        let in_path = dir.path().join("in.exe");
        std::fs::write(&in_path, &data).unwrap();
        let window = ByteWindow::open(&in_path).unwrap();
        let handler = PeHandler::open(&window).unwrap();
        let pre_sign_digest = handler.digest(DigestAlgorithm::Sha256).unwrap();

        let out_path = dir.path().join("out.exe");
        let mut sink = OutputSink::create(&out_path).unwrap();
        handler.sign(&mut sink, b"fake-pkcs7-der-bytes").unwrap();
        sink.finish().unwrap();

        let signed_window = ByteWindow::open(&out_path).unwrap();
        let signed_handler = PeHandler::open(&signed_window).unwrap();
        let post_sign_digest = signed_handler.digest(DigestAlgorithm::Sha256).unwrap();

        assert_eq!(pre_sign_digest, post_sign_digest);
    }

    #[test]
    fn remove_signature_zeros_directory_entry() {
        let mut data = synthetic_pe32(b"trailing section bytes");
        let peheader = 0x80;
        write_checksum_and_body_offsets(&mut data, peheader);

        let dir = tempfile::tempdir().unwrap();
        let in_path = dir.path().join("in.exe");
        std::fs::write(&in_path, &data).unwrap();
        let window = ByteWindow::open(&in_path).unwrap();
        let handler = PeHandler::open(&window).unwrap();

        let out_path = dir.path().join("out.exe");
        let mut sink = OutputSink::create(&out_path).unwrap();
        handler.remove_signature(&mut sink).unwrap();
        sink.finish().unwrap();

        let out = std::fs::read(&out_path).unwrap();
        assert_eq!(&out[handler.layout.cert_dir_offset..handler.layout.cert_dir_offset + 8], &[0u8; 8]);
    }

    #[test]
    fn checksum_toggle_is_detected() {
        let mut data = synthetic_pe32(b"trailing section bytes");
        let peheader = 0x80;
        write_checksum_and_body_offsets(&mut data, peheader);
        let good = calc_checksum(&data, peheader);
        data[peheader + 88] ^= 0x01;
        let after_toggle_stored = u32::from_le_bytes(
            data[peheader + 88..peheader + 92].try_into().unwrap(),
        );
        let recomputed = calc_checksum(&data, peheader);
        assert_eq!(recomputed, good);
        assert_ne!(after_toggle_stored, recomputed);
    }
}
