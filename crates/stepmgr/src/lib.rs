//! Per-node step manager: supervises one job step's tasks inside a process
//! container, multiplexes their stdio back to the launch client, serves the
//! per-step request socket, and aggregates completion up the step tree.

// Used by the quarry-stepmgr binary target only; the unused-deps lint is per
// target.
use anyhow as _;
use tracing_subscriber as _;

pub mod complete;
pub mod container;
pub mod fname;
pub mod handoff;
pub mod io;
pub mod mgr;
pub mod req;
