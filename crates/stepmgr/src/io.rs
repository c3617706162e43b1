//! Stdio plane, manager side.
//!
//! One TCP connection to the launch client carries header-framed messages in
//! both directions. Task output is pumped from the task pipes, optionally
//! line-buffered, framed, queued, and cached for replay; client input is
//! parsed off the connection and routed to task stdin writers. Memory is
//! bounded by the two buffer pools: an exhausted pool surfaces as
//! `PoolExhausted` and the affected direction pauses until a slot returns.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use quarry_net::eio::{EioHandle, EioObject, HandleOutcome};
use quarry_net::iobuf::{BufPool, DEFAULT_BUF_BYTES, DEFAULT_POOL_BUFFERS};
use quarry_proto::codec::UnpackBuf;
use quarry_proto::iohdr::{IoHdr, IoInitMsg, IoMsgType, IO_HDR_PACKED_SIZE};
use quarry_proto::cred::CRED_SIGLEN;

/// Replay cache depth for reattaching clients.
pub const CACHE_MSGS: usize = 128;

/// Longest line the output pump accumulates before forcing a frame.
const MAX_LINE: usize = DEFAULT_BUF_BYTES;

#[derive(Debug)]
pub enum StdinChunk {
    Data(Arc<Vec<u8>>),
    Eof,
}

struct IoInner {
    out_pool: BufPool,
    in_pool: BufPool,
    /// Encoded frames waiting for the socket.
    out_queue: VecDeque<Arc<Vec<u8>>>,
    /// Recent frames for reattach replay, oldest first.
    cache: VecDeque<Arc<Vec<u8>>>,
    /// Incoming frames that found a full task channel.
    parked: VecDeque<(Vec<u16>, Arc<Vec<u8>>, bool)>,
    /// Current connection generation; stale objects close themselves.
    epoch: u64,
}

pub struct StepIoShared {
    inner: Mutex<IoInner>,
    released: tokio::sync::Notify,
    stdin_routes: Mutex<HashMap<u16, mpsc::Sender<StdinChunk>>>,
    nodeid: u32,
    signature: [u8; CRED_SIGLEN],
}

impl StepIoShared {
    pub fn new(nodeid: u32, signature: [u8; CRED_SIGLEN]) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(IoInner {
                out_pool: BufPool::new(DEFAULT_POOL_BUFFERS, DEFAULT_BUF_BYTES),
                in_pool: BufPool::new(DEFAULT_POOL_BUFFERS, DEFAULT_BUF_BYTES),
                out_queue: VecDeque::new(),
                cache: VecDeque::new(),
                parked: VecDeque::new(),
                epoch: 0,
            }),
            released: tokio::sync::Notify::new(),
            stdin_routes: Mutex::new(HashMap::new()),
            nodeid,
            signature,
        })
    }

    pub fn register_stdin(&self, gtid: u16, tx: mpsc::Sender<StdinChunk>) {
        self.stdin_routes.lock().unwrap().insert(gtid, tx);
    }

    pub fn drop_stdin(&self, gtid: u16) {
        self.stdin_routes.lock().unwrap().remove(&gtid);
    }

    /// Frame one output message, queue it for the client, and remember it
    /// for replay. Blocks only on pool exhaustion.
    pub async fn push_output(
        &self,
        msg_type: IoMsgType,
        gtid: u16,
        ltid: u16,
        data: &[u8],
        handle: &EioHandle,
    ) {
        loop {
            let acquired = {
                let mut inner = self.inner.lock().unwrap();
                match inner.out_pool.try_acquire() {
                    Ok(buf) => Some(buf),
                    Err(_) => None,
                }
            };
            let Some(mut buf) = acquired else {
                trace!(gtid, "output pool exhausted; pump pausing");
                self.released.notified().await;
                continue;
            };

            let hdr = IoHdr {
                msg_type,
                gtaskid: gtid,
                ltaskid: ltid,
                length: data.len() as u32,
            };
            buf.extend_from_slice(&hdr.to_bytes());
            buf.extend_from_slice(data);
            let frame = Arc::new(buf);

            let mut inner = self.inner.lock().unwrap();
            inner.out_queue.push_back(frame.clone());
            inner.cache.push_back(frame);
            while inner.cache.len() > CACHE_MSGS {
                inner.cache.pop_front();
            }
            drop(inner);
            handle.wake();
            return;
        }
    }

    /// Snapshot of the replay cache, oldest first.
    pub fn cached_frames(&self) -> Vec<Arc<Vec<u8>>> {
        self.inner.lock().unwrap().cache.iter().cloned().collect()
    }

    /// Frames still queued for the client.
    pub fn pending_out(&self) -> usize {
        self.inner.lock().unwrap().out_queue.len()
    }

    /// Give the reactor a bounded chance to flush queued output before
    /// shutdown.
    pub async fn flush_out(&self, deadline: std::time::Duration) {
        let until = tokio::time::Instant::now() + deadline;
        while self.pending_out() > 0 {
            if tokio::time::Instant::now() >= until {
                warn!(pending = self.pending_out(), "stdio flush timed out");
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    /// Retire the current connection; the next accepted one owns the queue.
    pub fn bump_epoch(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.epoch += 1;
        inner.epoch
    }

    pub fn signature(&self) -> &[u8; CRED_SIGLEN] {
        &self.signature
    }

    pub fn init_msg(&self) -> IoInitMsg {
        IoInitMsg::new(self.nodeid, self.signature)
    }

    /// Hand a frame to its task writers, skipping unknown tasks. Returns
    /// the targets whose channels were full.
    fn try_route(&self, targets: &[u16], data: &Arc<Vec<u8>>, eof: bool) -> Vec<u16> {
        let routes = self.stdin_routes.lock().unwrap();
        let mut blocked: Vec<u16> = Vec::new();
        for gtid in targets {
            let Some(tx) = routes.get(gtid) else {
                debug!(gtid, "stdin for unknown task dropped");
                continue;
            };
            let chunk = if eof {
                StdinChunk::Eof
            } else {
                StdinChunk::Data(data.clone())
            };
            if tx.try_send(chunk).is_err() {
                blocked.push(*gtid);
            }
        }
        blocked
    }

    /// Route a fresh frame; on a full channel the frame is parked and one
    /// input pool slot is consumed until it drains.
    fn route(&self, targets: Vec<u16>, data: Arc<Vec<u8>>, eof: bool) {
        let blocked = self.try_route(&targets, &data, eof);
        if !blocked.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            if inner.in_pool.try_acquire().is_err() {
                trace!("input pool exhausted; reads pause until a slot frees");
            }
            inner.parked.push_back((blocked, data, eof));
        }
    }

    /// Retry parked frames in order; true when the backlog is empty. Driven
    /// from both the connection (on reads) and the stdin writers (as they
    /// free channel capacity).
    pub fn drain_parked(&self) -> bool {
        loop {
            let parked = {
                let mut inner = self.inner.lock().unwrap();
                inner.parked.pop_front()
            };
            let Some((targets, data, eof)) = parked else {
                return true;
            };
            let blocked = self.try_route(&targets, &data, eof);
            if !blocked.is_empty() {
                let mut inner = self.inner.lock().unwrap();
                inner.parked.push_front((blocked, data, eof));
                return false;
            }
            let mut inner = self.inner.lock().unwrap();
            if inner.in_pool.outstanding() > 0 {
                inner.in_pool.release_detached();
            }
            drop(inner);
            self.released.notify_waiters();
        }
    }
}

/// Reactor object driving the connection to the launch client.
pub struct ClientConn {
    stream: TcpStream,
    shared: Arc<StepIoShared>,
    epoch: u64,
    inbuf: Vec<u8>,
    cur_out: Option<(Arc<Vec<u8>>, usize)>,
}

impl ClientConn {
    pub fn new(stream: TcpStream, shared: Arc<StepIoShared>, epoch: u64) -> Self {
        Self {
            stream,
            shared,
            epoch,
            inbuf: Vec::new(),
            cur_out: None,
        }
    }

    fn stale(&self) -> bool {
        self.shared.inner.lock().unwrap().epoch != self.epoch
    }

    /// Pull complete frames out of the input buffer and route them.
    fn parse_frames(&mut self) {
        loop {
            if self.inbuf.len() < IO_HDR_PACKED_SIZE {
                return;
            }
            let hdr = {
                let mut u = UnpackBuf::new(&self.inbuf[..IO_HDR_PACKED_SIZE]);
                match IoHdr::unpack(&mut u) {
                    Ok(hdr) => hdr,
                    Err(err) => {
                        warn!(%err, "bad stdio frame header; dropping connection buffer");
                        self.inbuf.clear();
                        return;
                    }
                }
            };
            let total = IO_HDR_PACKED_SIZE + hdr.length as usize;
            if self.inbuf.len() < total {
                return;
            }
            let body = Arc::new(self.inbuf[IO_HDR_PACKED_SIZE..total].to_vec());
            self.inbuf.drain(..total);

            match hdr.msg_type {
                IoMsgType::Stdin => self.shared.route(vec![hdr.gtaskid], body, false),
                IoMsgType::AllStdin => {
                    let targets: Vec<u16> = self
                        .shared
                        .stdin_routes
                        .lock()
                        .unwrap()
                        .keys()
                        .copied()
                        .collect();
                    self.shared.route(targets, body, false);
                }
                IoMsgType::StdinEof => {
                    let targets: Vec<u16> = if hdr.gtaskid == quarry_proto::iohdr::IO_ALL_TASKS {
                        self.shared
                            .stdin_routes
                            .lock()
                            .unwrap()
                            .keys()
                            .copied()
                            .collect()
                    } else {
                        vec![hdr.gtaskid]
                    };
                    self.shared.route(targets, body, true);
                }
                IoMsgType::ConnTest => {}
                other => {
                    debug!(?other, "unexpected inbound stdio type");
                }
            }
        }
    }
}

impl EioObject for ClientConn {
    fn name(&self) -> &'static str {
        "stepmgr-client-io"
    }

    fn readable(&self) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        inner.parked.is_empty() && inner.in_pool.has_free()
    }

    fn writable(&self) -> bool {
        if self.cur_out.is_some() {
            return true;
        }
        !self.shared.inner.lock().unwrap().out_queue.is_empty()
    }

    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.poll_read_ready(cx)
    }

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.poll_write_ready(cx)
    }

    fn handle_read(&mut self) -> io::Result<HandleOutcome> {
        if self.stale() {
            return Ok(HandleOutcome::Close);
        }
        if !self.shared.drain_parked() {
            return Ok(HandleOutcome::Keep);
        }
        let mut chunk = [0u8; 4096];
        match self.stream.try_read(&mut chunk) {
            Ok(0) => {
                debug!("client closed the stdio connection");
                Ok(HandleOutcome::Close)
            }
            Ok(n) => {
                self.inbuf.extend_from_slice(&chunk[..n]);
                self.parse_frames();
                Ok(HandleOutcome::Keep)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(HandleOutcome::Keep),
            Err(e) => Err(e),
        }
    }

    fn handle_write(&mut self) -> io::Result<HandleOutcome> {
        if self.stale() {
            return Ok(HandleOutcome::Close);
        }
        if self.cur_out.is_none() {
            let mut inner = self.shared.inner.lock().unwrap();
            self.cur_out = inner.out_queue.pop_front().map(|f| (f, 0));
        }
        let Some((frame, offset)) = &mut self.cur_out else {
            return Ok(HandleOutcome::Keep);
        };
        match self.stream.try_write(&frame[*offset..]) {
            Ok(n) => {
                *offset += n;
                if *offset == frame.len() {
                    self.cur_out = None;
                    let mut inner = self.shared.inner.lock().unwrap();
                    // The cache may still hold the frame; the slot is free.
                    inner.out_pool.release_detached();
                    drop(inner);
                    self.shared.released.notify_waiters();
                }
                Ok(HandleOutcome::Keep)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(HandleOutcome::Keep),
            Err(e) => Err(e),
        }
    }

    fn handle_error(&mut self, err: &io::Error) -> HandleOutcome {
        warn!(%err, "stdio connection error");
        HandleOutcome::Close
    }

    fn handle_close(&mut self) {
        // Put an unfinished frame back so a reattach does not lose it.
        if let Some((frame, _)) = self.cur_out.take() {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.out_queue.push_front(frame);
        }
    }
}

/// Pump one task output pipe into the shared queue.
pub async fn pump_output<R>(
    mut reader: R,
    msg_type: IoMsgType,
    gtid: u16,
    ltid: u16,
    line_buffered: bool,
    shared: Arc<StepIoShared>,
    handle: EioHandle,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut acc: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if !line_buffered {
                    shared
                        .push_output(msg_type, gtid, ltid, &chunk[..n], &handle)
                        .await;
                    continue;
                }
                acc.extend_from_slice(&chunk[..n]);
                while let Some(pos) = acc.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = acc.drain(..=pos).collect();
                    shared.push_output(msg_type, gtid, ltid, &line, &handle).await;
                }
                if acc.len() >= MAX_LINE {
                    let full: Vec<u8> = std::mem::take(&mut acc);
                    shared.push_output(msg_type, gtid, ltid, &full, &handle).await;
                }
            }
            Err(err) => {
                debug!(gtid, %err, "task output pipe error");
                break;
            }
        }
    }
    if !acc.is_empty() {
        shared.push_output(msg_type, gtid, ltid, &acc, &handle).await;
    }
    // Zero-length frame marks end of stream for this task.
    shared.push_output(msg_type, gtid, ltid, &[], &handle).await;
}

/// Drain routed stdin chunks into one task's stdin pipe. Consuming a chunk
/// frees channel capacity, so retry any frames parked on a full channel.
pub async fn pump_stdin<W>(mut writer: W, mut rx: mpsc::Receiver<StdinChunk>, shared: Arc<StepIoShared>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;
    while let Some(chunk) = rx.recv().await {
        match chunk {
            StdinChunk::Data(data) => {
                let failed = writer.write_all(&data).await.is_err();
                let _ = writer.flush().await;
                shared.drain_parked();
                if failed {
                    break;
                }
            }
            StdinChunk::Eof => break,
        }
    }
    shared.drain_parked();
    // Dropping the writer closes the pipe: the task sees EOF.
}

/// Establish the outbound stdio connection: connect, introduce ourselves,
/// register the connection object.
pub async fn connect_client(
    addr: &str,
    shared: &Arc<StepIoShared>,
    handle: &EioHandle,
) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    let init = shared.init_msg().to_bytes();
    use tokio::io::AsyncWriteExt;
    stream.write_all(&init).await?;
    let epoch = shared.bump_epoch();
    handle.add_object(Box::new(ClientConn::new(stream, shared.clone(), epoch)));
    Ok(())
}

/// Reattach path: connect to the new client, replay the cache, then hand the
/// connection to the reactor for live forwarding.
pub async fn attach_client(
    addr: &str,
    shared: &Arc<StepIoShared>,
    handle: &EioHandle,
) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    use tokio::io::AsyncWriteExt;
    stream.write_all(&shared.init_msg().to_bytes()).await?;
    for frame in shared.cached_frames() {
        stream.write_all(&frame).await?;
    }
    let epoch = shared.bump_epoch();
    handle.add_object(Box::new(ClientConn::new(stream, shared.clone(), epoch)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_net::eio::Reactor;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn shared() -> Arc<StepIoShared> {
        StepIoShared::new(0, [7u8; CRED_SIGLEN])
    }

    #[tokio::test]
    async fn output_frames_reach_the_client_and_cache() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shared = shared();
        let (reactor, handle) = Reactor::new();
        let reactor_task = tokio::spawn(reactor.run());

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            stream
        });
        connect_client(&addr, &shared, &handle).await.unwrap();
        let mut client_side = accept.await.unwrap();

        // Init message first.
        let mut init = vec![0u8; IoInitMsg::packed_size()];
        client_side.read_exact(&mut init).await.unwrap();
        let mut u = UnpackBuf::new(&init);
        let msg = IoInitMsg::unpack(&mut u).unwrap();
        msg.validate(shared.signature()).unwrap();

        shared
            .push_output(IoMsgType::Stdout, 3, 1, b"hello\n", &handle)
            .await;

        let mut hdr_bytes = vec![0u8; IO_HDR_PACKED_SIZE];
        client_side.read_exact(&mut hdr_bytes).await.unwrap();
        let mut u = UnpackBuf::new(&hdr_bytes);
        let hdr = IoHdr::unpack(&mut u).unwrap();
        assert_eq!(hdr.msg_type, IoMsgType::Stdout);
        assert_eq!(hdr.gtaskid, 3);
        assert_eq!(hdr.length, 6);
        let mut body = vec![0u8; 6];
        client_side.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"hello\n");

        assert_eq!(shared.cached_frames().len(), 1);

        handle.shutdown();
        reactor_task.await.unwrap();
    }

    #[tokio::test]
    async fn stdin_frames_route_to_tasks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shared = shared();
        let (tx, mut rx) = mpsc::channel(8);
        shared.register_stdin(0, tx);

        let (reactor, handle) = Reactor::new();
        let reactor_task = tokio::spawn(reactor.run());

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            stream
        });
        connect_client(&addr, &shared, &handle).await.unwrap();
        let mut client_side = accept.await.unwrap();
        let mut init = vec![0u8; IoInitMsg::packed_size()];
        client_side.read_exact(&mut init).await.unwrap();

        let hdr = IoHdr {
            msg_type: IoMsgType::Stdin,
            gtaskid: 0,
            ltaskid: 0,
            length: 4,
        };
        client_side.write_all(&hdr.to_bytes()).await.unwrap();
        client_side.write_all(b"data").await.unwrap();

        let chunk = rx.recv().await.unwrap();
        match chunk {
            StdinChunk::Data(data) => assert_eq!(data.as_slice(), b"data"),
            StdinChunk::Eof => panic!("expected data"),
        }

        // EOF frame.
        let hdr = IoHdr {
            msg_type: IoMsgType::StdinEof,
            gtaskid: 0,
            ltaskid: 0,
            length: 0,
        };
        client_side.write_all(&hdr.to_bytes()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(StdinChunk::Eof)));

        handle.shutdown();
        reactor_task.await.unwrap();
    }

    #[tokio::test]
    async fn line_buffering_splits_on_newlines() {
        let shared = shared();
        let (reactor, handle) = Reactor::new();
        // Reactor unused for traffic; pump only touches the shared queue.
        let reactor_task = tokio::spawn(reactor.run());

        let (mut w, r) = tokio::io::duplex(256);
        let pump = tokio::spawn(pump_output(
            r,
            IoMsgType::Stdout,
            0,
            0,
            true,
            shared.clone(),
            handle.clone(),
        ));
        w.write_all(b"one\ntwo").await.unwrap();
        w.write_all(b" more\n").await.unwrap();
        drop(w);
        pump.await.unwrap();

        let frames = shared.cached_frames();
        // "one\n", "two more\n", end-of-stream marker.
        assert_eq!(frames.len(), 3);
        let body_of = |frame: &Arc<Vec<u8>>| frame[IO_HDR_PACKED_SIZE..].to_vec();
        assert_eq!(body_of(&frames[0]), b"one\n");
        assert_eq!(body_of(&frames[1]), b"two more\n");
        assert!(body_of(&frames[2]).is_empty());

        handle.shutdown();
        reactor_task.await.unwrap();
    }

    #[tokio::test]
    async fn unbuffered_forwards_immediately() {
        let shared = shared();
        let (reactor, handle) = Reactor::new();
        let reactor_task = tokio::spawn(reactor.run());

        let (mut w, r) = tokio::io::duplex(256);
        let pump = tokio::spawn(pump_output(
            r,
            IoMsgType::Stderr,
            1,
            0,
            false,
            shared.clone(),
            handle.clone(),
        ));
        w.write_all(b"no newline").await.unwrap();
        drop(w);
        pump.await.unwrap();

        let frames = shared.cached_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][IO_HDR_PACKED_SIZE..], b"no newline");

        handle.shutdown();
        reactor_task.await.unwrap();
    }
}
