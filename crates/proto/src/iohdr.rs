//! Stdio plane wire headers.
//!
//! Each stdio connection starts with one init message and then carries
//! header-framed byte messages labeled by task id. The init message
//! authenticates the peer: protocol version plus the credential signature
//! bytes, never the whole credential.

use crate::codec::{PackBuf, UnpackBuf, UnpackError};
use crate::cred::CRED_SIGLEN;

pub const IO_PROTOCOL_VERSION: u16 = 0xb001;

pub const IO_HDR_PACKED_SIZE: usize = 2 + 2 + 2 + 4;

/// Sentinel task id for frames that do not target one task (stdin broadcast,
/// EOF for all, connection test).
pub const IO_ALL_TASKS: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum IoMsgType {
    Stdout = 0,
    Stderr = 1,
    Stdin = 2,
    AllStdin = 3,
    StdinEof = 4,
    ConnTest = 5,
}

impl IoMsgType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(IoMsgType::Stdout),
            1 => Some(IoMsgType::Stderr),
            2 => Some(IoMsgType::Stdin),
            3 => Some(IoMsgType::AllStdin),
            4 => Some(IoMsgType::StdinEof),
            5 => Some(IoMsgType::ConnTest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoHdr {
    pub msg_type: IoMsgType,
    pub gtaskid: u16,
    pub ltaskid: u16,
    pub length: u32,
}

impl IoHdr {
    pub fn pack(&self, p: &mut PackBuf) {
        p.pack_u16(self.msg_type as u16);
        p.pack_u16(self.gtaskid);
        p.pack_u16(self.ltaskid);
        p.pack_u32(self.length);
    }

    pub fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, UnpackError> {
        let raw_type = u.unpack_u16()?;
        let msg_type =
            IoMsgType::from_u16(raw_type).ok_or(UnpackError::BadValue("io message type"))?;
        Ok(Self {
            msg_type,
            gtaskid: u.unpack_u16()?,
            ltaskid: u.unpack_u16()?,
            length: u.unpack_u32()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; IO_HDR_PACKED_SIZE] {
        let mut p = PackBuf::new();
        self.pack(&mut p);
        let v = p.into_inner();
        let mut out = [0u8; IO_HDR_PACKED_SIZE];
        out.copy_from_slice(&v);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoInitMsg {
    pub version: u16,
    pub nodeid: u32,
    pub signature: [u8; CRED_SIGLEN],
}

#[derive(Debug, PartialEq, Eq)]
pub enum IoInitError {
    BadVersion(u16),
    BadSignature,
    Malformed(UnpackError),
}

impl IoInitMsg {
    pub fn new(nodeid: u32, signature: [u8; CRED_SIGLEN]) -> Self {
        Self {
            version: IO_PROTOCOL_VERSION,
            nodeid,
            signature,
        }
    }

    pub fn packed_size() -> usize {
        2 + 4 + 4 + CRED_SIGLEN
    }

    pub fn pack(&self, p: &mut PackBuf) {
        p.pack_u16(self.version);
        p.pack_u32(self.nodeid);
        p.pack_mem(&self.signature);
    }

    pub fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, UnpackError> {
        let version = u.unpack_u16()?;
        let nodeid = u.unpack_u32()?;
        let sig_bytes = u.unpack_mem()?;
        if sig_bytes.len() != CRED_SIGLEN {
            return Err(UnpackError::BadValue("io init signature length"));
        }
        let mut signature = [0u8; CRED_SIGLEN];
        signature.copy_from_slice(&sig_bytes);
        Ok(Self {
            version,
            nodeid,
            signature,
        })
    }

    /// Admit the connection only on an exact version and signature match.
    pub fn validate(&self, expect_sig: &[u8; CRED_SIGLEN]) -> Result<(), IoInitError> {
        if self.version != IO_PROTOCOL_VERSION {
            return Err(IoInitError::BadVersion(self.version));
        }
        if !crate::cred::sig_eq(&self.signature, expect_sig) {
            return Err(IoInitError::BadSignature);
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut p = PackBuf::new();
        self.pack(&mut p);
        p.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hdr_round_trip() {
        let hdr = IoHdr {
            msg_type: IoMsgType::Stderr,
            gtaskid: 3,
            ltaskid: 1,
            length: 512,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(bytes.len(), IO_HDR_PACKED_SIZE);
        let mut u = UnpackBuf::new(&bytes);
        assert_eq!(IoHdr::unpack(&mut u).unwrap(), hdr);
    }

    #[test]
    fn unknown_io_type_rejected() {
        let mut p = PackBuf::new();
        p.pack_u16(99);
        p.pack_u16(0);
        p.pack_u16(0);
        p.pack_u32(0);
        let bytes = p.into_inner();
        let mut u = UnpackBuf::new(&bytes);
        assert!(IoHdr::unpack(&mut u).is_err());
    }

    #[test]
    fn init_validate() {
        let sig = [7u8; CRED_SIGLEN];
        let msg = IoInitMsg::new(2, sig);
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), IoInitMsg::packed_size());
        let mut u = UnpackBuf::new(&bytes);
        let back = IoInitMsg::unpack(&mut u).unwrap();
        back.validate(&sig).unwrap();

        let mut wrong = sig;
        wrong[0] ^= 1;
        assert_eq!(back.validate(&wrong), Err(IoInitError::BadSignature));

        let stale = IoInitMsg {
            version: 0xa000,
            ..back
        };
        assert_eq!(stale.validate(&sig), Err(IoInitError::BadVersion(0xa000)));
    }
}
