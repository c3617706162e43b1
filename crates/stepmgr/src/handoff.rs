//! Launch handoff from the node daemon.
//!
//! The node daemon spawns one step manager per step and writes a single
//! framed handoff message to the child's stdin: the local node's identity,
//! the spool directory, the cluster key, the controller address, and the
//! launch request itself.

use quarry_proto::codec::{PackBuf, UnpackBuf};
use quarry_proto::message::{LaunchTasksMsg, MsgBody, MsgType, ProtoError};

#[derive(Debug, Clone, PartialEq)]
pub struct Handoff {
    pub node_name: String,
    pub spool_dir: String,
    pub controller_addr: String,
    pub auth_key_hex: String,
    pub operator_uid: u32,
    /// Node daemon addresses, parallel to `launch.node_names`; completion
    /// records travel parent-ward through these.
    pub node_addrs: Vec<String>,
    pub launch: LaunchTasksMsg,
}

impl Handoff {
    pub fn encode(&self) -> Vec<u8> {
        let mut p = PackBuf::new();
        p.pack_str(&self.node_name);
        p.pack_str(&self.spool_dir);
        p.pack_str(&self.controller_addr);
        p.pack_str(&self.auth_key_hex);
        p.pack_u32(self.operator_uid);
        p.pack_str_array(&self.node_addrs);
        MsgBody::LaunchTasks(Box::new(self.launch.clone())).pack(&mut p);
        p.into_inner()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        let mut u = UnpackBuf::new(data);
        let node_name = u.unpack_str()?;
        let spool_dir = u.unpack_str()?;
        let controller_addr = u.unpack_str()?;
        let auth_key_hex = u.unpack_str()?;
        let operator_uid = u.unpack_u32()?;
        let node_addrs = u.unpack_str_array()?;
        let body = MsgBody::unpack(MsgType::LaunchTasks, &mut u)?;
        u.expect_done().map_err(ProtoError::Unpack)?;
        let MsgBody::LaunchTasks(launch) = body else {
            unreachable!("unpacked as launch-tasks");
        };
        Ok(Self {
            node_name,
            spool_dir,
            controller_addr,
            auth_key_hex,
            operator_uid,
            node_addrs,
            launch: *launch,
        })
    }

    /// Request-plane socket path for this step.
    pub fn socket_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(&self.spool_dir)
            .join("steps")
            .join(format!("{}.{}", self.launch.job_id, self.launch.step_id))
            .join("reqsock")
    }
}
