//! Controller: cluster configuration, the node/partition/job registries, the
//! scheduler, state persistence, accounting, and the RPC surface.

// Used by the quarryd binary target only; the unused-deps lint is per target.
use clap as _;
use tracing_subscriber as _;

pub mod acct;
pub mod config;
pub mod persist;
pub mod registry;
pub mod rpc;
pub mod sched;
pub mod select;
pub mod server;
