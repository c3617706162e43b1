//! Domain primitives shared by every quarry role: bit sets over the node and
//! task tables, compressed host lists, and step layouts with the task
//! distribution policies.

pub mod bitmap;
pub mod hostlist;
pub mod layout;

pub use bitmap::Bitmap;
pub use hostlist::{compress, expand, HostlistError};
pub use layout::{DistributionError, StepLayout, TaskDistribution};
