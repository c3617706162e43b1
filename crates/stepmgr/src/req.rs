//! Per-step request plane.
//!
//! A Unix-domain socket under the spool directory serves the typed
//! request/response protocol. Authorization is per operation: suspend,
//! resume, terminate, completion, state, and info are operator-only;
//! signals and attach are open to the step owner as well.

use std::path::Path;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use quarry_proto::stepreq::{StepdReply, StepdRequest};
use quarry_proto::ErrorCode;

use crate::mgr::StepManager;

pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path)
}

pub async fn serve(listener: UnixListener, mgr: Arc<StepManager>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "request socket accept failed");
                continue;
            }
        };
        let mgr = mgr.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(stream, mgr).await {
                debug!(%err, "request connection ended");
            }
        });
    }
}

async fn handle_conn(
    mut stream: UnixStream,
    mgr: Arc<StepManager>,
) -> Result<(), quarry_net::MsgIoError> {
    loop {
        let frame = match quarry_net::read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(quarry_net::MsgIoError::Io(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let reply = match StepdRequest::decode(&frame) {
            Ok((auth, req)) => {
                if auth.verify(&mgr.key).is_err() {
                    StepdReply::Rc {
                        rc: ErrorCode::CredVerify.as_u32(),
                    }
                } else {
                    dispatch(&mgr, auth.uid, req).await
                }
            }
            Err(err) => {
                debug!(%err, "malformed request");
                StepdReply::Rc {
                    rc: ErrorCode::MalformedFrame.as_u32(),
                }
            }
        };
        quarry_net::write_frame(&mut stream, &reply.encode()).await?;
    }
}

fn rc_of(result: Result<(), ErrorCode>) -> StepdReply {
    match result {
        Ok(()) => StepdReply::Rc { rc: 0 },
        Err(code) => StepdReply::Rc { rc: code.as_u32() },
    }
}

async fn dispatch(mgr: &Arc<StepManager>, uid: u32, req: StepdRequest) -> StepdReply {
    let operator = mgr.is_operator(uid);
    let owner = uid == mgr.owner_uid() || operator;

    match req {
        StepdRequest::State => {
            if !operator {
                return unauthorized();
            }
            StepdReply::State {
                state: mgr.op_state(),
            }
        }
        StepdRequest::Info => {
            if !operator {
                return unauthorized();
            }
            StepdReply::Info {
                uid: mgr.owner_uid(),
                job_id: mgr.handoff.launch.job_id,
                step_id: mgr.handoff.launch.step_id,
                nodeid: mgr.nodeid,
            }
        }
        StepdRequest::SignalProcessGroup { signal } => {
            if !owner {
                return unauthorized();
            }
            rc_of(mgr.op_signal_container(signal as i32))
        }
        StepdRequest::SignalTaskLocal { signal, ltaskid } => {
            if !owner {
                return unauthorized();
            }
            rc_of(mgr.op_signal_task(signal as i32, ltaskid))
        }
        StepdRequest::SignalContainer { signal } => {
            if !owner {
                return unauthorized();
            }
            match mgr.op_signal_container(signal as i32) {
                Ok(()) => StepdReply::RcErrno { rc: 0, errno: 0 },
                Err(code) => StepdReply::RcErrno {
                    rc: code.as_u32(),
                    errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32,
                },
            }
        }
        StepdRequest::Attach {
            ioaddr,
            respaddr,
            signature,
        } => {
            if !owner {
                return unauthorized();
            }
            match mgr.op_attach(&ioaddr, &respaddr, &signature).await {
                Ok((pids, gtids, executable)) => StepdReply::Attach {
                    rc: 0,
                    pids,
                    gtids,
                    executable,
                },
                Err(code) => StepdReply::Attach {
                    rc: code.as_u32(),
                    pids: Vec::new(),
                    gtids: Vec::new(),
                    executable: String::new(),
                },
            }
        }
        StepdRequest::PidInContainer { pid } => {
            if !owner {
                return unauthorized();
            }
            StepdReply::Bool {
                value: mgr.op_pid_in_container(pid),
            }
        }
        StepdRequest::DaemonPid => {
            if !owner {
                return unauthorized();
            }
            StepdReply::Pid {
                pid: std::process::id(),
            }
        }
        StepdRequest::Suspend => {
            if !operator {
                return unauthorized();
            }
            rc_of(mgr.op_suspend())
        }
        StepdRequest::Resume => {
            if !operator {
                return unauthorized();
            }
            rc_of(mgr.op_resume())
        }
        StepdRequest::Terminate => {
            if !operator {
                return unauthorized();
            }
            rc_of(mgr.op_terminate())
        }
        StepdRequest::Completion {
            first,
            last,
            step_rc,
            acct,
        } => {
            if !operator {
                return unauthorized();
            }
            mgr.child_completion(first, last, step_rc, &acct).await;
            StepdReply::Rc { rc: 0 }
        }
    }
}

fn unauthorized() -> StepdReply {
    StepdReply::Rc {
        rc: ErrorCode::Unauthorized.as_u32(),
    }
}

/// Client helper: one request/response round trip on the step socket.
pub async fn request(
    path: &Path,
    auth: &quarry_proto::AuthToken,
    req: &StepdRequest,
) -> Result<StepdReply, quarry_net::MsgIoError> {
    let mut stream = UnixStream::connect(path).await?;
    quarry_net::write_frame(&mut stream, &req.encode(auth)).await?;
    let frame = quarry_net::read_frame(&mut stream).await?;
    StepdReply::decode(&frame).map_err(|e| {
        quarry_net::MsgIoError::Proto(quarry_proto::message::ProtoError::Unpack(e))
    })
}
