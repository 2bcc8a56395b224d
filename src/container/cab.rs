// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Microsoft Cabinet (CAB) Authenticode handling.
//!
//! CAB signing works by growing the header's reserved-data area rather
//! than relocating anything: every offset that points past the header
//! (the total cabinet size and the first folder's data offset) is raised
//! by the fixed 24-byte width of that area, the `RESERVE_PRESENT` flag bit
//! is set, and the reserved area itself holds a small fixed template
//! followed by the signature length, patched in once the signature has
//! been produced.

use crate::{
    byte_window::{ByteWindow, OutputSink},
    digest::DigestAlgorithm,
    error::{AuthenticodeError, Result},
};

/// Width, in bytes, of the reserved area every signed CAB gains: a 20-byte
/// fixed template plus this module's own bookkeeping of the blob-length
/// placeholder that lives inside that template.
const RESERVED_AREA_WIDTH: u32 = 24;

const RESERVE_PRESENT: u8 = 0x04;

/// `cbReservedCFHeader=0x14, cbReservedCFFolder=0, cbReservedCFData=0x10`,
/// followed by two placeholder dwords (cab size, blob length) and 8 zero
/// bytes. The cab-size placeholder is patched immediately; the blob-length
/// placeholder is patched once the PKCS#7 signature exists.
const CABSIGNED_TEMPLATE: [u8; 20] = [
    0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0xde, 0xad, 0xbe, 0xef, 0xde, 0xad, 0xbe,
    0xef, 0x00, 0x00, 0x00, 0x00,
];

#[derive(Debug, Clone, Copy)]
pub struct CabLayout {
    pub total_size: u32,
    pub folder_offset: u32,
    pub num_folders: u16,
    pub flags: u16,
}

impl CabLayout {
    pub fn parse(data: &ByteWindow) -> Result<Self> {
        if data.len() < 44 {
            return Err(AuthenticodeError::CorruptContainer(
                "CAB file shorter than a minimal header".into(),
            ));
        }
        Ok(Self {
            total_size: data.read_u32_le(8)?,
            folder_offset: data.read_u32_le(16)?,
            num_folders: data.read_u16_le(26)?,
            flags: data.read_u16_le(30)?,
        })
    }
}

pub struct CabHandler<'a> {
    data: &'a ByteWindow,
    pub layout: CabLayout,
}

/// Result of assembling everything but the signature blob itself.
pub struct CabAssembly {
    pub digest: Vec<u8>,
    /// The output bytes up to (and including) the reserved-area template;
    /// the caller appends the signature DER (plus padding) after this.
    pub prefix: Vec<u8>,
    /// Offset within `prefix` of the blob-length placeholder dword.
    pub blob_length_offset: usize,
}

impl<'a> CabHandler<'a> {
    /// Opens a CAB for any operation. Whether the header's flag bits may
    /// already be set depends on what the caller does next: [`Self::assemble`]
    /// (and therefore [`Self::sign`]) refuses an already-flagged file, while
    /// [`Self::extract_signature`] and [`Self::remove_signature`] require one.
    pub fn open(data: &'a ByteWindow) -> Result<Self> {
        let layout = CabLayout::parse(data)?;
        Ok(Self { data, layout })
    }

    /// Assembles the unsigned-prefix bytes and simultaneously feeds the
    /// header fields into the digest, raising the size/offset fields that
    /// change once the reserved signature area is inserted, in the exact
    /// order they appear in the cabinet.
    pub fn assemble(&self, algorithm: DigestAlgorithm) -> Result<CabAssembly> {
        if self.layout.flags != 0 {
            return Err(AuthenticodeError::UnsupportedFeature(
                "cannot sign a CAB file that already has header flag bits set".into(),
            ));
        }
        let raw = self.data.as_slice();
        let mut hasher = algorithm.as_hasher();
        let mut out = Vec::with_capacity(raw.len() + 64);

        // [0,4): signature, digested and written.
        hasher.update(&raw[0..4]);
        out.extend_from_slice(&raw[0..4]);
        // [4,8): reserved1, written but not part of the digest.
        out.extend_from_slice(&raw[4..8]);

        // cbCabinet, raised by the reserved-area width.
        let new_total = self.layout.total_size.wrapping_add(RESERVED_AREA_WIDTH);
        let new_total_bytes = new_total.to_le_bytes();
        hasher.update(&new_total_bytes);
        out.extend_from_slice(&new_total_bytes);

        // [12,16): reserved2, unchanged.
        hasher.update(&raw[12..16]);
        out.extend_from_slice(&raw[12..16]);

        // coffFiles, raised by the reserved-area width.
        let new_folder_offset = self.layout.folder_offset.wrapping_add(RESERVED_AREA_WIDTH);
        let new_folder_offset_bytes = new_folder_offset.to_le_bytes();
        hasher.update(&new_folder_offset_bytes);
        out.extend_from_slice(&new_folder_offset_bytes);

        // [20,34): reserved3, versionMinor/Major, cFolders, cFiles, flags,
        // setID -- with the low flags byte OR'd with RESERVE_PRESENT.
        let mut block = raw[20..34].to_vec();
        block[10] |= RESERVE_PRESENT;
        hasher.update(&block);
        out.extend_from_slice(&block);

        // [34,36): iCabinet, written but not digested (same rationale as
        // reserved1 above).
        out.extend_from_slice(&raw[34..36]);

        // Reserved-area template, with the cab-size placeholder patched
        // in immediately.
        let mut cabsigned = CABSIGNED_TEMPLATE;
        cabsigned[8..12].copy_from_slice(&new_total_bytes);
        out.extend_from_slice(&cabsigned);
        let blob_length_offset = out.len() - 8;

        // Only 20 bytes of reserved-area template are ever written; digest
        // its last 4 (the zero tail), not 4 bytes past the end of it.
        hasher.update(&cabsigned[16..20]);

        // Folder entries: each entry's leading 4-byte field is raised by
        // the reserved-area width, its trailing 4 bytes pass through.
        let mut offset = 36usize;
        for _ in 0..self.layout.num_folders {
            let field = self.data.read_u32_le(offset)?.wrapping_add(RESERVED_AREA_WIDTH);
            let field_bytes = field.to_le_bytes();
            hasher.update(&field_bytes);
            out.extend_from_slice(&field_bytes);
            hasher.update(&raw[offset + 4..offset + 8]);
            out.extend_from_slice(&raw[offset + 4..offset + 8]);
            offset += 8;
        }

        // Remainder, verbatim.
        hasher.update(&raw[offset..]);
        out.extend_from_slice(&raw[offset..]);

        Ok(CabAssembly {
            digest: hasher.finish(),
            prefix: out,
            blob_length_offset,
        })
    }

    pub fn digest(&self, algorithm: DigestAlgorithm) -> Result<Vec<u8>> {
        Ok(self.assemble(algorithm)?.digest)
    }

    /// Writes the signed CAB: the assembled prefix, the signature DER
    /// padded to an 8-byte boundary, and the blob-length placeholder
    /// patched with the final length.
    pub fn sign(
        &self,
        output: &mut OutputSink,
        algorithm: DigestAlgorithm,
        signature_der: &[u8],
    ) -> Result<()> {
        let mut assembly = self.assemble(algorithm)?;
        let padlen = (8 - signature_der.len() % 8) % 8;
        let blob_len = (signature_der.len() + padlen) as u32;
        assembly.prefix[assembly.blob_length_offset..assembly.blob_length_offset + 4]
            .copy_from_slice(&blob_len.to_le_bytes());

        output.write_all(&assembly.prefix)?;
        output.write_all(signature_der)?;
        output.write_zeros(padlen)
    }

    /// Reads back the signature DER from an already-signed CAB's reserved
    /// area, if present. The reserved template sits right after the
    /// 36-byte header, ahead of the folder entries; the blob itself is
    /// appended past everything else, at the very end of the file, so its
    /// start is most reliably found by working backward from EOF using the
    /// length recorded in the reserved template's second placeholder dword.
    pub fn extract_signature(&self) -> Result<Option<Vec<u8>>> {
        if self.layout.flags & RESERVE_PRESENT as u16 == 0 {
            return Ok(None);
        }
        let raw = self.data.as_slice();
        let reserved_start = 36;
        let blob_len =
            u32::from_le_bytes(raw[reserved_start + 12..reserved_start + 16].try_into().unwrap())
                as usize;
        let blob_start = raw.len().checked_sub(blob_len).ok_or_else(|| {
            AuthenticodeError::CorruptContainer("reserved blob length exceeds file size".into())
        })?;
        Ok(Some(raw[blob_start..].to_vec()))
    }

    /// Writes a copy of the CAB with the reserved signature area stripped
    /// and the size/offset fields lowered back to their unsigned values.
    pub fn remove_signature(&self, output: &mut OutputSink) -> Result<()> {
        if self.layout.flags & RESERVE_PRESENT as u16 == 0 {
            return output.write_all(self.data.as_slice());
        }
        let raw = self.data.as_slice();
        let reserved_start = 36;
        let blob_len =
            u32::from_le_bytes(raw[reserved_start + 12..reserved_start + 16].try_into().unwrap())
                as usize;
        let blob_start = raw.len().checked_sub(blob_len).ok_or_else(|| {
            AuthenticodeError::CorruptContainer("reserved blob length exceeds file size".into())
        })?;
        let folder_entries_start = reserved_start + 20;

        let new_total = self.layout.total_size.wrapping_sub(RESERVED_AREA_WIDTH);
        let new_folder_offset = self.layout.folder_offset.wrapping_sub(RESERVED_AREA_WIDTH);

        output.write_all(&raw[0..8])?;
        output.write_all(&new_total.to_le_bytes())?;
        output.write_all(&raw[12..16])?;
        output.write_all(&new_folder_offset.to_le_bytes())?;
        let mut block = raw[20..34].to_vec();
        block[10] &= !RESERVE_PRESENT;
        output.write_all(&block)?;
        output.write_all(&raw[34..36])?;

        let mut offset = folder_entries_start;
        for _ in 0..self.layout.num_folders {
            let field = self.data.read_u32_le(offset)?.wrapping_sub(RESERVED_AREA_WIDTH);
            output.write_all(&field.to_le_bytes())?;
            output.write_all(&raw[offset + 4..offset + 8])?;
            offset += 8;
        }

        output.write_all(&raw[offset..blob_start])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn synthetic_cab(num_folders: u16, tail: &[u8]) -> Vec<u8> {
        let mut data = b"MSCF".to_vec(); // [0,4)
        data.extend_from_slice(&0u32.to_le_bytes()); // reserved1 [4,8)
        data.extend_from_slice(&1000u32.to_le_bytes()); // cbCabinet [8,12)
        data.extend_from_slice(&0u32.to_le_bytes()); // reserved2 [12,16)
        data.extend_from_slice(&200u32.to_le_bytes()); // coffFiles [16,20)
        data.extend_from_slice(&0u32.to_le_bytes()); // reserved3 [20,24)
        data.push(3); // versionMinor
        data.push(1); // versionMajor
        data.extend_from_slice(&num_folders.to_le_bytes()); // cFolders [26,28)
        data.extend_from_slice(&1u16.to_le_bytes()); // cFiles [28,30)
        data.extend_from_slice(&0u16.to_le_bytes()); // flags [30,32)
        data.extend_from_slice(&0u16.to_le_bytes()); // setID [32,34)
        data.extend_from_slice(&0u16.to_le_bytes()); // iCabinet [34,36)
        for i in 0..num_folders {
            data.extend_from_slice(&(500u32 + i as u32).to_le_bytes());
            data.extend_from_slice(&[0u8; 4]);
        }
        data.extend_from_slice(tail);
        data
    }

    #[test]
    fn refuses_to_sign_when_flags_already_set() {
        let mut data = synthetic_cab(1, b"tail bytes here");
        data[30] = 0x04;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cab");
        std::fs::write(&path, &data).unwrap();
        let window = ByteWindow::open(&path).unwrap();
        let handler = CabHandler::open(&window).unwrap();
        assert!(handler.assemble(DigestAlgorithm::Sha256).is_err());
    }

    #[test]
    fn raises_size_and_offset_fields() {
        let data = synthetic_cab(2, b"trailing cab data");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cab");
        std::fs::write(&path, &data).unwrap();
        let window = ByteWindow::open(&path).unwrap();
        let handler = CabHandler::open(&window).unwrap();
        let assembly = handler.assemble(DigestAlgorithm::Sha256).unwrap();

        let new_total = u32::from_le_bytes(assembly.prefix[8..12].try_into().unwrap());
        assert_eq!(new_total, 1000 + 24);
        let new_folder_offset = u32::from_le_bytes(assembly.prefix[16..20].try_into().unwrap());
        assert_eq!(new_folder_offset, 200 + 24);
        assert_eq!(assembly.prefix[30] & 0x04, 0x04);
    }

    #[test]
    fn sign_patches_blob_length() {
        let data = synthetic_cab(1, b"trailing cab data");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cab");
        std::fs::write(&path, &data).unwrap();
        let window = ByteWindow::open(&path).unwrap();
        let handler = CabHandler::open(&window).unwrap();

        let out_path = dir.path().join("out.cab");
        let mut sink = OutputSink::create(&out_path).unwrap();
        handler
            .sign(&mut sink, DigestAlgorithm::Sha256, b"0123456789")
            .unwrap();
        sink.finish().unwrap();

        let signed = std::fs::read(&out_path).unwrap();
        let blob_len = u32::from_le_bytes(signed[0x30..0x34].try_into().unwrap());
        assert_eq!(blob_len, 16); // 10 bytes padded to 16
    }

    #[test]
    fn extract_signature_round_trips() {
        let data = synthetic_cab(1, b"trailing cab data");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cab");
        std::fs::write(&path, &data).unwrap();
        let window = ByteWindow::open(&path).unwrap();
        let handler = CabHandler::open(&window).unwrap();

        let out_path = dir.path().join("out.cab");
        let mut sink = OutputSink::create(&out_path).unwrap();
        let signature = b"0123456789";
        handler.sign(&mut sink, DigestAlgorithm::Sha256, signature).unwrap();
        sink.finish().unwrap();

        let signed = std::fs::read(&out_path).unwrap();
        let signed_window_path = dir.path().join("signed-for-reopen.cab");
        std::fs::write(&signed_window_path, &signed).unwrap();
        let signed_window = ByteWindow::open(&signed_window_path).unwrap();
        let signed_layout = CabLayout::parse(&signed_window).unwrap();
        let signed_handler = CabHandler {
            data: &signed_window,
            layout: signed_layout,
        };
        let extracted = signed_handler.extract_signature().unwrap().unwrap();
        assert_eq!(&extracted[..signature.len()], &signature[..]);
    }

    #[test]
    fn remove_signature_restores_original_fields() {
        let data = synthetic_cab(1, b"trailing cab data");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cab");
        std::fs::write(&path, &data).unwrap();
        let window = ByteWindow::open(&path).unwrap();
        let handler = CabHandler::open(&window).unwrap();

        let signed_path = dir.path().join("signed.cab");
        let mut sink = OutputSink::create(&signed_path).unwrap();
        handler.sign(&mut sink, DigestAlgorithm::Sha256, b"0123456789").unwrap();
        sink.finish().unwrap();

        let signed_window = ByteWindow::open(&signed_path).unwrap();
        let signed_layout = CabLayout::parse(&signed_window).unwrap();
        let signed_handler = CabHandler {
            data: &signed_window,
            layout: signed_layout,
        };

        let removed_path = dir.path().join("removed.cab");
        let mut removed_sink = OutputSink::create(&removed_path).unwrap();
        signed_handler.remove_signature(&mut removed_sink).unwrap();
        removed_sink.finish().unwrap();

        let removed = std::fs::read(&removed_path).unwrap();
        assert_eq!(removed, data);
    }
}
