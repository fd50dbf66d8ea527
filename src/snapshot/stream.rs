// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Big-endian primitives for the snapshot stream.

use std::io::Error as IoError;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;

use crate::error::GfxstreamError;
use crate::error::GfxstreamResult;

const MAX_BLOB_PREALLOC: usize = 1 << 20;

pub trait WriteBeExt: Write {
    fn put_u8(&mut self, v: u8) -> GfxstreamResult<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn put_be32(&mut self, v: u32) -> GfxstreamResult<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn put_be64(&mut self, v: u64) -> GfxstreamResult<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn put_bool(&mut self, v: bool) -> GfxstreamResult<()> {
        self.put_u8(v as u8)
    }

    /// Writes a collection length. Collections in the stream never exceed `u32::MAX` entries.
    fn put_count(&mut self, count: usize) -> GfxstreamResult<()> {
        self.put_be32(count.try_into()?)
    }

    fn put_blob(&mut self, bytes: &[u8]) -> GfxstreamResult<()> {
        let len: u32 = bytes
            .len()
            .try_into()
            .map_err(|_| GfxstreamError::Corrupt("blob does not fit in u32"))?;
        self.put_be32(len)?;
        self.write_all(bytes)?;
        Ok(())
    }
}

impl<T: Write + ?Sized> WriteBeExt for T {}

pub trait ReadBeExt: Read {
    fn get_u8(&mut self) -> GfxstreamResult<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn get_be32(&mut self) -> GfxstreamResult<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn get_be64(&mut self) -> GfxstreamResult<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn get_bool(&mut self) -> GfxstreamResult<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(GfxstreamError::Corrupt("boolean byte")),
        }
    }

    /// Reads a length-prefixed blob. The buffer grows with the bytes actually present, so a
    /// corrupt length cannot make us allocate more than the stream holds.
    fn get_blob(&mut self) -> GfxstreamResult<Vec<u8>> {
        let len = self.get_be32()? as usize;
        let mut buf = Vec::new();
        let reserve = len.min(MAX_BLOB_PREALLOC);
        buf.try_reserve_exact(reserve)
            .map_err(|_| GfxstreamError::OutOfMemory { len: reserve })?;
        Read::take(&mut *self, len as u64).read_to_end(&mut buf)?;
        if buf.len() != len {
            return Err(IoError::from(ErrorKind::UnexpectedEof).into());
        }
        Ok(buf)
    }
}

impl<T: Read + ?Sized> ReadBeExt for T {}
