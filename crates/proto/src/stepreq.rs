//! Step manager request plane.
//!
//! A per-step Unix-domain socket speaks this typed request/response
//! protocol. Every request opens with the caller's authenticator; the
//! manager authorizes each operation individually against the step owner
//! and the operator identity.

use crate::codec::{PackBuf, UnpackBuf, UnpackError};
use crate::cred::AuthToken;
use crate::message::{AcctSnapshot, ProtoError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StepState {
    Starting = 0,
    Running = 1,
    Suspended = 2,
    Complete = 3,
}

impl StepState {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(StepState::Starting),
            1 => Some(StepState::Running),
            2 => Some(StepState::Suspended),
            3 => Some(StepState::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepdRequest {
    State,
    Info,
    SignalProcessGroup { signal: u16 },
    SignalTaskLocal { signal: u16, ltaskid: u32 },
    SignalContainer { signal: u16 },
    Attach {
        ioaddr: String,
        respaddr: String,
        signature: Vec<u8>,
    },
    PidInContainer { pid: u32 },
    DaemonPid,
    Suspend,
    Resume,
    Terminate,
    Completion {
        first: u32,
        last: u32,
        step_rc: u32,
        acct: AcctSnapshot,
    },
}

impl StepdRequest {
    fn op(&self) -> u16 {
        match self {
            StepdRequest::State => 0,
            StepdRequest::Info => 1,
            StepdRequest::SignalProcessGroup { .. } => 2,
            StepdRequest::SignalTaskLocal { .. } => 3,
            StepdRequest::SignalContainer { .. } => 4,
            StepdRequest::Attach { .. } => 5,
            StepdRequest::PidInContainer { .. } => 6,
            StepdRequest::DaemonPid => 7,
            StepdRequest::Suspend => 8,
            StepdRequest::Resume => 9,
            StepdRequest::Terminate => 10,
            StepdRequest::Completion { .. } => 11,
        }
    }

    pub fn encode(&self, auth: &AuthToken) -> Vec<u8> {
        let mut p = PackBuf::new();
        auth.pack(&mut p);
        p.pack_u16(self.op());
        match self {
            StepdRequest::State
            | StepdRequest::Info
            | StepdRequest::DaemonPid
            | StepdRequest::Suspend
            | StepdRequest::Resume
            | StepdRequest::Terminate => {}
            StepdRequest::SignalProcessGroup { signal }
            | StepdRequest::SignalContainer { signal } => p.pack_u16(*signal),
            StepdRequest::SignalTaskLocal { signal, ltaskid } => {
                p.pack_u16(*signal);
                p.pack_u32(*ltaskid);
            }
            StepdRequest::Attach {
                ioaddr,
                respaddr,
                signature,
            } => {
                p.pack_str(ioaddr);
                p.pack_str(respaddr);
                p.pack_mem(signature);
            }
            StepdRequest::PidInContainer { pid } => p.pack_u32(*pid),
            StepdRequest::Completion {
                first,
                last,
                step_rc,
                acct,
            } => {
                p.pack_u32(*first);
                p.pack_u32(*last);
                p.pack_u32(*step_rc);
                p.pack_u64(acct.user_sec);
                p.pack_u64(acct.sys_sec);
                p.pack_u64(acct.max_rss_kb);
            }
        }
        p.into_inner()
    }

    pub fn decode(data: &[u8]) -> Result<(AuthToken, Self), ProtoError> {
        let mut u = UnpackBuf::new(data);
        let auth = AuthToken::unpack(&mut u)?;
        let op = u.unpack_u16()?;
        let req = match op {
            0 => StepdRequest::State,
            1 => StepdRequest::Info,
            2 => StepdRequest::SignalProcessGroup {
                signal: u.unpack_u16()?,
            },
            3 => StepdRequest::SignalTaskLocal {
                signal: u.unpack_u16()?,
                ltaskid: u.unpack_u32()?,
            },
            4 => StepdRequest::SignalContainer {
                signal: u.unpack_u16()?,
            },
            5 => StepdRequest::Attach {
                ioaddr: u.unpack_str()?,
                respaddr: u.unpack_str()?,
                signature: u.unpack_mem()?,
            },
            6 => StepdRequest::PidInContainer {
                pid: u.unpack_u32()?,
            },
            7 => StepdRequest::DaemonPid,
            8 => StepdRequest::Suspend,
            9 => StepdRequest::Resume,
            10 => StepdRequest::Terminate,
            11 => StepdRequest::Completion {
                first: u.unpack_u32()?,
                last: u.unpack_u32()?,
                step_rc: u.unpack_u32()?,
                acct: AcctSnapshot {
                    user_sec: u.unpack_u64()?,
                    sys_sec: u.unpack_u64()?,
                    max_rss_kb: u.unpack_u64()?,
                },
            },
            other => return Err(ProtoError::UnknownType(other)),
        };
        u.expect_done().map_err(ProtoError::Unpack)?;
        Ok((auth, req))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepdReply {
    Rc { rc: u32 },
    RcErrno { rc: u32, errno: u32 },
    State { state: StepState },
    Info {
        uid: u32,
        job_id: u32,
        step_id: u32,
        nodeid: u32,
    },
    Pid { pid: u32 },
    Bool { value: bool },
    Attach {
        rc: u32,
        pids: Vec<u32>,
        gtids: Vec<u32>,
        executable: String,
    },
}

impl StepdReply {
    fn tag(&self) -> u16 {
        match self {
            StepdReply::Rc { .. } => 0,
            StepdReply::RcErrno { .. } => 1,
            StepdReply::State { .. } => 2,
            StepdReply::Info { .. } => 3,
            StepdReply::Pid { .. } => 4,
            StepdReply::Bool { .. } => 5,
            StepdReply::Attach { .. } => 6,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut p = PackBuf::new();
        p.pack_u16(self.tag());
        match self {
            StepdReply::Rc { rc } => p.pack_u32(*rc),
            StepdReply::RcErrno { rc, errno } => {
                p.pack_u32(*rc);
                p.pack_u32(*errno);
            }
            StepdReply::State { state } => p.pack_u16(*state as u16),
            StepdReply::Info {
                uid,
                job_id,
                step_id,
                nodeid,
            } => {
                p.pack_u32(*uid);
                p.pack_u32(*job_id);
                p.pack_u32(*step_id);
                p.pack_u32(*nodeid);
            }
            StepdReply::Pid { pid } => p.pack_u32(*pid),
            StepdReply::Bool { value } => p.pack_bool(*value),
            StepdReply::Attach {
                rc,
                pids,
                gtids,
                executable,
            } => {
                p.pack_u32(*rc);
                p.pack_u32_array(pids);
                p.pack_u32_array(gtids);
                p.pack_str(executable);
            }
        }
        p.into_inner()
    }

    pub fn decode(data: &[u8]) -> Result<Self, UnpackError> {
        let mut u = UnpackBuf::new(data);
        let reply = match u.unpack_u16()? {
            0 => StepdReply::Rc {
                rc: u.unpack_u32()?,
            },
            1 => StepdReply::RcErrno {
                rc: u.unpack_u32()?,
                errno: u.unpack_u32()?,
            },
            2 => StepdReply::State {
                state: StepState::from_u16(u.unpack_u16()?)
                    .ok_or(UnpackError::BadValue("step state"))?,
            },
            3 => StepdReply::Info {
                uid: u.unpack_u32()?,
                job_id: u.unpack_u32()?,
                step_id: u.unpack_u32()?,
                nodeid: u.unpack_u32()?,
            },
            4 => StepdReply::Pid {
                pid: u.unpack_u32()?,
            },
            5 => StepdReply::Bool {
                value: u.unpack_bool()?,
            },
            6 => StepdReply::Attach {
                rc: u.unpack_u32()?,
                pids: u.unpack_u32_array()?,
                gtids: u.unpack_u32_array()?,
                executable: u.unpack_str()?,
            },
            _ => return Err(UnpackError::BadValue("stepd reply tag")),
        };
        u.expect_done()?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cred::AuthKey;

    fn auth() -> AuthToken {
        AuthToken::issue(&AuthKey::from_bytes(b"k".to_vec()), 1000, 1000)
    }

    #[test]
    fn request_round_trip() {
        let reqs = vec![
            StepdRequest::State,
            StepdRequest::Info,
            StepdRequest::SignalProcessGroup { signal: 15 },
            StepdRequest::SignalTaskLocal {
                signal: 9,
                ltaskid: 2,
            },
            StepdRequest::SignalContainer { signal: 18 },
            StepdRequest::Attach {
                ioaddr: "10.0.0.1:4000".into(),
                respaddr: "10.0.0.1:4001".into(),
                signature: vec![1; 32],
            },
            StepdRequest::PidInContainer { pid: 1234 },
            StepdRequest::DaemonPid,
            StepdRequest::Suspend,
            StepdRequest::Resume,
            StepdRequest::Terminate,
            StepdRequest::Completion {
                first: 2,
                last: 5,
                step_rc: 1,
                acct: AcctSnapshot {
                    user_sec: 3,
                    sys_sec: 1,
                    max_rss_kb: 100,
                },
            },
        ];
        for req in reqs {
            let bytes = req.encode(&auth());
            let (token, back) = StepdRequest::decode(&bytes).unwrap();
            assert_eq!(back, req);
            assert_eq!(token.uid, 1000);
        }
    }

    #[test]
    fn reply_round_trip() {
        let replies = vec![
            StepdReply::Rc { rc: 0 },
            StepdReply::RcErrno { rc: 1, errno: 3 },
            StepdReply::State {
                state: StepState::Suspended,
            },
            StepdReply::Info {
                uid: 1000,
                job_id: 7,
                step_id: 0,
                nodeid: 3,
            },
            StepdReply::Pid { pid: 999 },
            StepdReply::Bool { value: true },
            StepdReply::Attach {
                rc: 0,
                pids: vec![10, 11],
                gtids: vec![0, 1],
                executable: "hostname".into(),
            },
        ];
        for reply in replies {
            assert_eq!(StepdReply::decode(&reply.encode()).unwrap(), reply);
        }
    }

    #[test]
    fn unknown_op_rejected() {
        let mut p = PackBuf::new();
        auth().pack(&mut p);
        p.pack_u16(99);
        assert!(StepdRequest::decode(&p.into_inner()).is_err());
    }
}
