//! Shared networking runtime: the cooperative event reactor, framed envelope
//! I/O, the RPC forwarding tree, and the stdio buffer pools.

pub mod eio;
pub mod fanout;
pub mod iobuf;
pub mod msgio;

pub use eio::{EioHandle, EioObject, Reactor};
pub use fanout::{failed_records, send_recv_msgs, split_tree, tree_depth};
pub use iobuf::BufPool;
pub use msgio::{
    read_envelope, read_frame, send_one, send_recv_one, write_envelope, write_frame, MsgIoError,
};
