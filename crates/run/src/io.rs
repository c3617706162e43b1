//! Client endpoint of the stdio plane and the response-message listeners.
//!
//! The client listens; every step manager connects in, authenticates with
//! the credential signature, and then streams framed task output while
//! accepting framed stdin. Output lines are optionally labeled with their
//! global task id. The same reactor also drives the response listeners that
//! feed the launch state machine.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use quarry_net::eio::{EioHandle, EioObject, HandleOutcome};
use quarry_net::MsgIoError;
use quarry_proto::codec::UnpackBuf;
use quarry_proto::cred::CRED_SIGLEN;
use quarry_proto::iohdr::{IoHdr, IoInitMsg, IoMsgType, IO_ALL_TASKS, IO_HDR_PACKED_SIZE};
use quarry_proto::message::MsgBody;
use quarry_proto::{Envelope, StdinMode};

use crate::launch::LaunchState;
use crate::pmi::KvsStore;

type OutQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

pub struct IoEndpoint {
    signature: [u8; CRED_SIGLEN],
    label: bool,
    /// Node rank → that connection's outbound frame queue.
    conns: Mutex<HashMap<u32, OutQueue>>,
    /// (gtid, is-stderr) → cursor is at a line start.
    line_state: Mutex<HashMap<(u16, bool), bool>>,
    handle: EioHandle,
}

impl IoEndpoint {
    pub fn new(signature: [u8; CRED_SIGLEN], label: bool, handle: EioHandle) -> Arc<Self> {
        Arc::new(Self {
            signature,
            label,
            conns: Mutex::new(HashMap::new()),
            line_state: Mutex::new(HashMap::new()),
            handle,
        })
    }

    pub fn connected_nodes(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    /// The named layout index will send nothing more (node failure).
    pub fn down_node(&self, nodeid: u32) {
        self.conns.lock().unwrap().remove(&nodeid);
    }

    /// Queue an encoded frame for one node's connection.
    fn enqueue(&self, nodeid: u32, frame: Vec<u8>) {
        let conns = self.conns.lock().unwrap();
        if let Some(queue) = conns.get(&nodeid) {
            queue.lock().unwrap().push_back(frame);
            self.handle.wake();
        } else {
            debug!(nodeid, "stdin for a node that is not connected; dropped");
        }
    }

    fn enqueue_all(&self, frame: &[u8]) {
        let conns = self.conns.lock().unwrap();
        for queue in conns.values() {
            queue.lock().unwrap().push_back(frame.to_vec());
        }
        if !conns.is_empty() {
            self.handle.wake();
        }
    }

    /// Print one output frame, labeling line starts when enabled. A
    /// zero-length frame is the task's end-of-stream marker.
    fn print_frame(&self, hdr: &IoHdr, body: &[u8]) {
        let is_err = hdr.msg_type == IoMsgType::Stderr;
        if body.is_empty() {
            self.line_state
                .lock()
                .unwrap()
                .insert((hdr.gtaskid, is_err), true);
            return;
        }

        let stdout = io::stdout();
        let stderr = io::stderr();
        let mut out: Box<dyn Write> = if is_err {
            Box::new(stderr.lock())
        } else {
            Box::new(stdout.lock())
        };

        if !self.label {
            let _ = out.write_all(body);
            let _ = out.flush();
            return;
        }

        let mut line_state = self.line_state.lock().unwrap();
        let at_start = line_state.entry((hdr.gtaskid, is_err)).or_insert(true);
        let mut rest = body;
        while !rest.is_empty() {
            if *at_start {
                let _ = write!(out, "{}: ", hdr.gtaskid);
                *at_start = false;
            }
            match rest.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    let _ = out.write_all(&rest[..=pos]);
                    *at_start = true;
                    rest = &rest[pos + 1..];
                }
                None => {
                    let _ = out.write_all(rest);
                    rest = &[];
                }
            }
        }
        let _ = out.flush();
    }
}

/// Route one chunk of the client's stdin into the plane.
pub fn route_stdin(
    endpoint: &Arc<IoEndpoint>,
    layout: &quarry_core::StepLayout,
    mode: StdinMode,
    data: &[u8],
) {
    match mode {
        StdinMode::NoTask => {}
        StdinMode::AllTasks => {
            let hdr = IoHdr {
                msg_type: IoMsgType::AllStdin,
                gtaskid: IO_ALL_TASKS,
                ltaskid: IO_ALL_TASKS,
                length: data.len() as u32,
            };
            let mut frame = hdr.to_bytes().to_vec();
            frame.extend_from_slice(data);
            endpoint.enqueue_all(&frame);
        }
        StdinMode::OneTask(gtid) => {
            let Some(node) = layout.host_of(gtid) else {
                warn!(gtid, "stdin target not in the step layout");
                return;
            };
            let hdr = IoHdr {
                msg_type: IoMsgType::Stdin,
                gtaskid: gtid as u16,
                ltaskid: 0,
                length: data.len() as u32,
            };
            let mut frame = hdr.to_bytes().to_vec();
            frame.extend_from_slice(data);
            endpoint.enqueue(node as u32, frame);
        }
    }
}

/// Signal end of the client's stdin to the interested tasks.
pub fn route_stdin_eof(endpoint: &Arc<IoEndpoint>, layout: &quarry_core::StepLayout, mode: StdinMode) {
    let hdr = |gtaskid: u16| IoHdr {
        msg_type: IoMsgType::StdinEof,
        gtaskid,
        ltaskid: 0,
        length: 0,
    };
    match mode {
        StdinMode::NoTask => {}
        StdinMode::AllTasks => {
            endpoint.enqueue_all(&hdr(IO_ALL_TASKS).to_bytes());
        }
        StdinMode::OneTask(gtid) => {
            if let Some(node) = layout.host_of(gtid) {
                endpoint.enqueue(node as u32, hdr(gtid as u16).to_bytes().to_vec());
            }
        }
    }
}

/// Read the client's stdin and feed the plane until EOF.
pub async fn pump_stdin(
    endpoint: Arc<IoEndpoint>,
    layout: quarry_core::StepLayout,
    mode: StdinMode,
) {
    use tokio::io::AsyncReadExt;
    if matches!(mode, StdinMode::NoTask) {
        return;
    }
    let mut stdin = tokio::io::stdin();
    let mut chunk = [0u8; 4096];
    loop {
        match stdin.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => route_stdin(&endpoint, &layout, mode, &chunk[..n]),
            Err(err) => {
                debug!(%err, "stdin read failed");
                break;
            }
        }
    }
    route_stdin_eof(&endpoint, &layout, mode);
}

/// A framed stdio connection from one step manager.
struct IoConn {
    stream: TcpStream,
    endpoint: Arc<IoEndpoint>,
    nodeid: u32,
    queue: OutQueue,
    inbuf: Vec<u8>,
    cur_out: Option<(Vec<u8>, usize)>,
}

impl EioObject for IoConn {
    fn name(&self) -> &'static str {
        "client-io"
    }

    fn readable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        self.cur_out.is_some() || !self.queue.lock().unwrap().is_empty()
    }

    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.poll_read_ready(cx)
    }

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.poll_write_ready(cx)
    }

    fn handle_read(&mut self) -> io::Result<HandleOutcome> {
        let mut chunk = [0u8; 4096];
        match self.stream.try_read(&mut chunk) {
            Ok(0) => Ok(HandleOutcome::Close),
            Ok(n) => {
                self.inbuf.extend_from_slice(&chunk[..n]);
                loop {
                    if self.inbuf.len() < IO_HDR_PACKED_SIZE {
                        break;
                    }
                    let hdr = {
                        let mut u = UnpackBuf::new(&self.inbuf[..IO_HDR_PACKED_SIZE]);
                        match IoHdr::unpack(&mut u) {
                            Ok(hdr) => hdr,
                            Err(err) => {
                                warn!(%err, "bad stdio frame; closing connection");
                                return Ok(HandleOutcome::Close);
                            }
                        }
                    };
                    let total = IO_HDR_PACKED_SIZE + hdr.length as usize;
                    if self.inbuf.len() < total {
                        break;
                    }
                    let body: Vec<u8> = self.inbuf[IO_HDR_PACKED_SIZE..total].to_vec();
                    self.inbuf.drain(..total);
                    match hdr.msg_type {
                        IoMsgType::Stdout | IoMsgType::Stderr => {
                            self.endpoint.print_frame(&hdr, &body);
                        }
                        IoMsgType::ConnTest => {}
                        other => debug!(?other, "unexpected frame from manager"),
                    }
                }
                Ok(HandleOutcome::Keep)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(HandleOutcome::Keep),
            Err(e) => Err(e),
        }
    }

    fn handle_write(&mut self) -> io::Result<HandleOutcome> {
        if self.cur_out.is_none() {
            self.cur_out = self.queue.lock().unwrap().pop_front().map(|f| (f, 0));
        }
        let Some((frame, offset)) = &mut self.cur_out else {
            return Ok(HandleOutcome::Keep);
        };
        match self.stream.try_write(&frame[*offset..]) {
            Ok(n) => {
                *offset += n;
                if *offset == frame.len() {
                    self.cur_out = None;
                }
                Ok(HandleOutcome::Keep)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(HandleOutcome::Keep),
            Err(e) => Err(e),
        }
    }

    fn handle_close(&mut self) {
        self.endpoint.down_node(self.nodeid);
    }
}

/// Listener feeding accepted connections to an async setup step.
pub struct Acceptor<F> {
    listener: TcpListener,
    pending: Option<TcpStream>,
    on_accept: F,
}

impl<F> Acceptor<F>
where
    F: Fn(TcpStream) + Send,
{
    pub fn new(listener: TcpListener, on_accept: F) -> Self {
        Self {
            listener,
            pending: None,
            on_accept,
        }
    }
}

impl<F> EioObject for Acceptor<F>
where
    F: Fn(TcpStream) + Send,
{
    fn name(&self) -> &'static str {
        "acceptor"
    }

    fn readable(&self) -> bool {
        true
    }

    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.pending.is_some() {
            return Poll::Ready(Ok(()));
        }
        match self.listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, _))) => {
                self.pending = Some(stream);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn handle_read(&mut self) -> io::Result<HandleOutcome> {
        if let Some(stream) = self.pending.take() {
            (self.on_accept)(stream);
        }
        Ok(HandleOutcome::Keep)
    }

    fn handle_error(&mut self, err: &io::Error) -> HandleOutcome {
        warn!(%err, "listener error");
        HandleOutcome::Keep
    }
}

/// Install the stdio listeners: each accepted connection must present a
/// valid init message before it joins the plane.
pub async fn bind_io_listeners(
    count: usize,
    endpoint: Arc<IoEndpoint>,
    handle: &EioHandle,
) -> io::Result<Vec<u16>> {
    let mut ports = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        ports.push(listener.local_addr()?.port());
        let endpoint = endpoint.clone();
        let handle_clone = handle.clone();
        handle.add_object(Box::new(Acceptor::new(listener, move |stream| {
            let endpoint = endpoint.clone();
            let handle = handle_clone.clone();
            tokio::spawn(async move {
                if let Err(err) = setup_io_conn(stream, endpoint, handle).await {
                    debug!(%err, "stdio connection rejected");
                }
            });
        })));
    }
    Ok(ports)
}

async fn setup_io_conn(
    mut stream: TcpStream,
    endpoint: Arc<IoEndpoint>,
    handle: EioHandle,
) -> io::Result<()> {
    use tokio::io::AsyncReadExt;
    let mut init = vec![0u8; IoInitMsg::packed_size()];
    stream.read_exact(&mut init).await?;
    let mut u = UnpackBuf::new(&init);
    let msg = IoInitMsg::unpack(&mut u)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad init message"))?;
    if msg.validate(&endpoint.signature).is_err() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "stdio init rejected",
        ));
    }

    let queue: OutQueue = Arc::new(Mutex::new(VecDeque::new()));
    endpoint
        .conns
        .lock()
        .unwrap()
        .insert(msg.nodeid, queue.clone());
    debug!(nodeid = msg.nodeid, "stdio connection authenticated");
    handle.add_object(Box::new(IoConn {
        stream,
        endpoint,
        nodeid: msg.nodeid,
        queue,
        inbuf: Vec::new(),
        cur_out: None,
    }));
    Ok(())
}

/// Install the response listeners: each accepted connection carries one
/// envelope, handled against the launch state, with a reply only for the
/// request/response types.
pub async fn bind_resp_ports(count: usize) -> io::Result<(Vec<TcpListener>, Vec<u16>)> {
    let mut listeners = Vec::with_capacity(count);
    let mut ports = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        ports.push(listener.local_addr()?.port());
        listeners.push(listener);
    }
    Ok((listeners, ports))
}

/// Attach pre-bound response listeners to the reactor. Binding happens
/// before step creation so the controller knows our endpoint from the
/// start; the handlers need the launch state, which exists only after.
pub fn install_resp_listeners(
    listeners: Vec<TcpListener>,
    state: Arc<LaunchState>,
    pmi: Arc<KvsStore>,
    endpoint: Option<Arc<IoEndpoint>>,
    handle: &EioHandle,
) {
    for listener in listeners {
        let state = state.clone();
        let pmi = pmi.clone();
        let endpoint = endpoint.clone();
        handle.add_object(Box::new(Acceptor::new(listener, move |stream| {
            let state = state.clone();
            let pmi = pmi.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_resp_conn(stream, state, pmi, endpoint).await {
                    debug!(%err, "response connection failed");
                }
            });
        })));
    }
}

async fn handle_resp_conn(
    mut stream: TcpStream,
    state: Arc<LaunchState>,
    pmi: Arc<KvsStore>,
    endpoint: Option<Arc<IoEndpoint>>,
) -> Result<(), MsgIoError> {
    let env = quarry_net::read_envelope(&mut stream).await?;
    // Only the operator (the managers), root, or ourselves may feed the
    // launch state.
    let own_uid = unsafe { libc::getuid() };
    if env.auth.uid != 0 && env.auth.uid != own_uid && env.auth.uid != state.auth.uid {
        warn!(uid = env.auth.uid, "message from unexpected uid ignored");
        return Ok(());
    }
    if let Some(reply) = state.handle_msg(&env.body, &pmi) {
        let reply_env = Envelope::new(state.auth.clone(), reply);
        quarry_net::write_envelope(&mut stream, &reply_env).await?;
    }
    // The stdio plane should expect nothing more from a failed node.
    if let (MsgBody::SrunNodeFail { .. }, Some(endpoint)) = (&env.body, endpoint) {
        let downed = state.with_inner(|inner| inner.downed_nodes.clone());
        for nodeid in downed {
            endpoint.down_node(nodeid as u32);
        }
    }
    Ok(())
}
