//! Integer-coded error catalogue.
//!
//! Every code crosses the wire in return-code fields and has a stable
//! human-readable message. The numeric values are part of the protocol and
//! never reused.

use thiserror::Error;

macro_rules! error_codes {
    ($( $(#[$meta:meta])* $name:ident = $code:expr, $msg:expr; )*) => {
        #[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
        pub enum ErrorCode {
            $( $(#[$meta])* #[error($msg)] $name, )*
        }

        impl ErrorCode {
            pub fn as_u32(self) -> u32 {
                match self {
                    $( ErrorCode::$name => $code, )*
                }
            }

            pub fn from_u32(code: u32) -> Option<Self> {
                match code {
                    $( $code => Some(ErrorCode::$name), )*
                    _ => None,
                }
            }

            /// Stable message for a raw wire code, including unknown ones.
            pub fn strerror(code: u32) -> &'static str {
                match Self::from_u32(code) {
                    $( Some(ErrorCode::$name) => $msg, )*
                    None => "unknown error",
                }
            }
        }
    };
}

error_codes! {
    Success = 0, "no error";

    // protocol
    VersionMismatch = 1001, "incompatible protocol version";
    UnexpectedMessage = 1002, "unexpected message type";
    MalformedFrame = 1003, "malformed message frame";

    // auth
    CredUnpack = 2001, "credential could not be unpacked";
    CredVerify = 2002, "credential signature verification failed";
    IdentityMismatch = 2003, "credential identity does not match request";
    Unauthorized = 2004, "operation not permitted for caller";
    CredExpired = 2005, "credential has expired";

    // state
    InvalidJobId = 3001, "invalid job id";
    JobNotRunning = 3002, "job is not running";
    StepSuspended = 3003, "job step is suspended";
    StepNotSuspended = 3004, "job step is not suspended";
    StepExists = 3005, "job step already exists";
    InvalidTransition = 3006, "invalid job state transition";
    StepNotFound = 3007, "invalid job step id";
    NoSuchProcess = 3008, "no such process";
    JobPending = 3009, "job has not yet been allocated";

    // resource
    InsufficientNodes = 4001, "requested node count unavailable";
    PlacementInfeasible = 4002, "requested node configuration is not available";
    PartitionDown = 4003, "partition is in down state";
    TimeLimitOverPartition = 4004, "time limit exceeds partition maximum";
    PartitionAccessDenied = 4005, "access to partition denied";
    InvalidPartition = 4006, "invalid partition name";
    InvalidNodeName = 4007, "invalid node name";

    // node
    NodeDown = 5001, "node is down";
    NodeNotResponding = 5002, "node is not responding";
    NodeDrained = 5003, "node is drained";

    // transient
    TryAgain = 6001, "resources temporarily unavailable, try again";
    NoChangeInData = 6002, "data has not changed since last query";

    // io
    ReadTooShort = 7001, "read returned fewer bytes than expected";
    WriteTooShort = 7002, "write accepted fewer bytes than expected";
    ConnectionAborted = 7003, "connection aborted";
    Timeout = 7004, "communication timed out";
    ForwardFailed = 7005, "message forwarding failed";
    WouldBlock = 7006, "no buffer available";

    Unsupported = 9001, "operation not supported";
}

impl ErrorCode {
    /// Codes a signal sender ignores: they race with normal task exit.
    pub fn ignorable_on_signal(self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidJobId | ErrorCode::JobNotRunning | ErrorCode::NoSuchProcess
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in [
            ErrorCode::Success,
            ErrorCode::VersionMismatch,
            ErrorCode::CredVerify,
            ErrorCode::StepNotSuspended,
            ErrorCode::PlacementInfeasible,
            ErrorCode::NodeDown,
            ErrorCode::TryAgain,
            ErrorCode::Timeout,
            ErrorCode::Unsupported,
        ] {
            assert_eq!(ErrorCode::from_u32(code.as_u32()), Some(code));
        }
    }

    #[test]
    fn strerror_is_stable() {
        assert_eq!(ErrorCode::strerror(3001), "invalid job id");
        assert_eq!(ErrorCode::strerror(0), "no error");
        assert_eq!(ErrorCode::strerror(424242), "unknown error");
    }

    #[test]
    fn signal_race_codes() {
        assert!(ErrorCode::InvalidJobId.ignorable_on_signal());
        assert!(ErrorCode::JobNotRunning.ignorable_on_signal());
        assert!(ErrorCode::NoSuchProcess.ignorable_on_signal());
        assert!(!ErrorCode::Unauthorized.ignorable_on_signal());
    }
}
