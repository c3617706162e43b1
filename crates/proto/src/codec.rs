//! Machine-independent packing.
//!
//! Big-endian fixed-width integers, u32 length-prefixed strings and byte
//! blobs, arrays prefixed by a 16- or 32-bit count. Every message variant has
//! exactly one canonical byte form; unpacking never panics and never reads
//! past the declared lengths.

use thiserror::Error;

/// Sentinel for "no value" in optional u32 fields (e.g. unlimited time).
pub const NO_VAL: u32 = u32::MAX;

/// Upper bound on any single counted array, to keep a corrupt count from
/// ballooning allocation.
const MAX_COUNT: usize = 1 << 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnpackError {
    #[error("buffer truncated: wanted {wanted} more bytes, had {had}")]
    Truncated { wanted: usize, had: usize },
    #[error("string is not valid utf-8")]
    BadString,
    #[error("count {0} exceeds protocol limit")]
    CountTooLarge(u32),
    #[error("invalid value for {0}")]
    BadValue(&'static str),
}

#[derive(Debug, Default)]
pub struct PackBuf {
    data: Vec<u8>,
}

impl PackBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pack_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn pack_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn pack_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn pack_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn pack_bool(&mut self, v: bool) {
        self.pack_u8(v as u8);
    }

    /// Unix seconds.
    pub fn pack_time(&mut self, v: i64) {
        self.pack_u64(v as u64);
    }

    pub fn pack_mem(&mut self, v: &[u8]) {
        self.pack_u32(v.len() as u32);
        self.data.extend_from_slice(v);
    }

    pub fn pack_str(&mut self, v: &str) {
        self.pack_mem(v.as_bytes());
    }

    /// Absent strings pack as the `NO_VAL` length sentinel so that
    /// `Some("")` and `None` stay distinct on the wire.
    pub fn pack_opt_str(&mut self, v: Option<&str>) {
        match v {
            None => self.pack_u32(NO_VAL),
            Some(s) => self.pack_str(s),
        }
    }

    pub fn pack_str_array(&mut self, v: &[String]) {
        self.pack_u32(v.len() as u32);
        for s in v {
            self.pack_str(s);
        }
    }

    pub fn pack_u16_array(&mut self, v: &[u16]) {
        self.pack_u16(v.len() as u16);
        for x in v {
            self.pack_u16(*x);
        }
    }

    pub fn pack_u32_array(&mut self, v: &[u32]) {
        self.pack_u32(v.len() as u32);
        for x in v {
            self.pack_u32(*x);
        }
    }
}

#[derive(Debug)]
pub struct UnpackBuf<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> UnpackBuf<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], UnpackError> {
        if self.remaining() < n {
            return Err(UnpackError::Truncated {
                wanted: n,
                had: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn unpack_u8(&mut self) -> Result<u8, UnpackError> {
        Ok(self.take(1)?[0])
    }

    pub fn unpack_u16(&mut self) -> Result<u16, UnpackError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn unpack_u32(&mut self) -> Result<u32, UnpackError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn unpack_u64(&mut self) -> Result<u64, UnpackError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn unpack_bool(&mut self) -> Result<bool, UnpackError> {
        Ok(self.unpack_u8()? != 0)
    }

    pub fn unpack_time(&mut self) -> Result<i64, UnpackError> {
        Ok(self.unpack_u64()? as i64)
    }

    pub fn unpack_mem(&mut self) -> Result<Vec<u8>, UnpackError> {
        let len = self.unpack_u32()?;
        if len as usize > MAX_COUNT {
            return Err(UnpackError::CountTooLarge(len));
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    pub fn unpack_str(&mut self) -> Result<String, UnpackError> {
        let bytes = self.unpack_mem()?;
        String::from_utf8(bytes).map_err(|_| UnpackError::BadString)
    }

    pub fn unpack_opt_str(&mut self) -> Result<Option<String>, UnpackError> {
        let len = self.unpack_u32()?;
        if len == NO_VAL {
            return Ok(None);
        }
        if len as usize > MAX_COUNT {
            return Err(UnpackError::CountTooLarge(len));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| UnpackError::BadString)
    }

    pub fn unpack_str_array(&mut self) -> Result<Vec<String>, UnpackError> {
        let count = self.unpack_u32()?;
        if count as usize > MAX_COUNT {
            return Err(UnpackError::CountTooLarge(count));
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.unpack_str()?);
        }
        Ok(out)
    }

    pub fn unpack_u16_array(&mut self) -> Result<Vec<u16>, UnpackError> {
        let count = self.unpack_u16()?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.unpack_u16()?);
        }
        Ok(out)
    }

    pub fn unpack_u32_array(&mut self) -> Result<Vec<u32>, UnpackError> {
        let count = self.unpack_u32()?;
        if count as usize > MAX_COUNT {
            return Err(UnpackError::CountTooLarge(count));
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.unpack_u32()?);
        }
        Ok(out)
    }

    /// Everything already consumed must account for the whole buffer; a
    /// trailing remainder means the sender and receiver disagree about the
    /// message shape.
    pub fn expect_done(&self) -> Result<(), UnpackError> {
        if self.remaining() != 0 {
            return Err(UnpackError::BadValue("trailing bytes"));
        }
        Ok(())
    }
}
