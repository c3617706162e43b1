//! Wire protocol shared by every quarry role: the machine-independent codec,
//! the message catalogue and envelope, the error-code table, step
//! credentials, and the stdio plane headers.

pub mod codec;
pub mod cred;
pub mod error;
pub mod iohdr;
pub mod message;
pub mod stepreq;

pub use codec::{PackBuf, UnpackBuf, UnpackError};
pub use cred::{AuthKey, AuthToken, Credential, CRED_SIGLEN};
pub use error::ErrorCode;
pub use message::{
    Envelope, ForwardDirective, Header, MsgBody, MsgType, RetDataInfo, StdinMode, PROTO_VERSION,
};
