// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A random-access read view over the input file and a sequential-write
//! sink for the output file. Every container handler is built on top of
//! these two primitives.

use {
    crate::error::{AuthenticodeError, Result},
    memmap2::Mmap,
    std::{
        fs::File,
        io::{BufWriter, Write},
        path::{Path, PathBuf},
    },
};

/// A read-only, private memory mapping of an input file.
///
/// The mapping is held for the duration of the operation and is dropped
/// (unmapped) when the `ByteWindow` goes out of scope, on every exit path.
pub struct ByteWindow {
    _file: File,
    mmap: Mmap,
}

impl ByteWindow {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // Safety: the mapping is read-only and private; we do not rely on
        // the file remaining unmodified by other processes, only that the
        // kernel will not hand us uninitialized memory.
        let mmap = unsafe { Mmap::map(&file) }?;
        Ok(Self { _file: file, mmap })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn read_u16_le(&self, offset: usize) -> Result<u16> {
        self.require(offset, 2)?;
        Ok(u16::from_le_bytes(self.mmap[offset..offset + 2].try_into().unwrap()))
    }

    pub fn read_u32_le(&self, offset: usize) -> Result<u32> {
        self.require(offset, 4)?;
        Ok(u32::from_le_bytes(self.mmap[offset..offset + 4].try_into().unwrap()))
    }

    pub fn slice(&self, start: usize, end: usize) -> Result<&[u8]> {
        if start > end || end > self.mmap.len() {
            return Err(AuthenticodeError::CorruptContainer(format!(
                "byte range [{start}, {end}) out of bounds for {}-byte file",
                self.mmap.len()
            )));
        }
        Ok(&self.mmap[start..end])
    }

    fn require(&self, offset: usize, width: usize) -> Result<()> {
        if offset.checked_add(width).map_or(true, |end| end > self.mmap.len()) {
            return Err(AuthenticodeError::CorruptContainer(format!(
                "field at offset {offset} (width {width}) exceeds {}-byte file",
                self.mmap.len()
            )));
        }
        Ok(())
    }
}

/// A sequential-write sink for the output file.
///
/// On any error the caller is expected to call [`OutputSink::abort`] (or
/// simply drop it with `discard_on_drop` left `true`, the default) so the
/// partially-written output never lingers on disk, matching the core's "on
/// any failure the output file is removed" error contract.
pub struct OutputSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    discard_on_drop: bool,
}

impl OutputSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            discard_on_drop: true,
        })
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .as_mut()
            .expect("write after finish")
            .write_all(data)?;
        Ok(())
    }

    pub fn write_zeros(&mut self, count: usize) -> Result<()> {
        const ZEROS: [u8; 64] = [0u8; 64];
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(ZEROS.len());
            self.write_all(&ZEROS[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    /// Flush and close successfully; the output file is kept.
    pub fn finish(mut self) -> Result<()> {
        self.writer.take().expect("finish called twice").flush()?;
        self.discard_on_drop = false;
        Ok(())
    }

    /// Explicitly discard the output. Equivalent to just dropping `self`.
    pub fn abort(mut self) {
        self.writer.take();
        self.discard_on_drop = true;
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        if self.discard_on_drop {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
