//! Cooperative event reactor.
//!
//! One task owns a set of I/O objects and drives their callbacks. An object
//! advertises interest through `readable`/`writable`, exposes readiness by
//! delegating to its socket's `poll_read_ready`/`poll_write_ready`, and
//! performs at most one non-blocking operation per `handle_*` dispatch.
//! Handlers must not await; long waits belong outside the reactor.
//!
//! The launch client runs one reactor for all of a step's connections; the
//! step manager runs one for its request socket and one for the stdio plane.
//! A reactor is never shared across roles.

use std::io;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interest {
    Read,
    Write,
}

/// Outcome of a handler dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Keep the object registered.
    Keep,
    /// Unregister and drop the object after `handle_close`.
    Close,
}

pub trait EioObject: Send {
    fn name(&self) -> &'static str {
        "eio"
    }

    fn readable(&self) -> bool {
        false
    }

    fn writable(&self) -> bool {
        false
    }

    fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let _ = cx;
        Poll::Pending
    }

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let _ = cx;
        Poll::Pending
    }

    fn handle_read(&mut self) -> io::Result<HandleOutcome> {
        Ok(HandleOutcome::Keep)
    }

    fn handle_write(&mut self) -> io::Result<HandleOutcome> {
        Ok(HandleOutcome::Keep)
    }

    /// Called when readiness polling or a handler fails. Return `Keep` to
    /// stay registered (the error was absorbed), `Close` to unregister.
    fn handle_error(&mut self, err: &io::Error) -> HandleOutcome {
        let _ = err;
        HandleOutcome::Close
    }

    /// Last callback an object ever receives.
    fn handle_close(&mut self) {}
}

enum Control {
    Add(Box<dyn EioObject>),
    Wake,
    Shutdown,
}

/// Handle used to feed a running reactor. Objects added while the loop runs
/// become visible on the next iteration.
#[derive(Clone)]
pub struct EioHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl EioHandle {
    pub fn add_object(&self, obj: Box<dyn EioObject>) {
        let _ = self.tx.send(Control::Add(obj));
    }

    /// Nudge the loop so objects re-evaluate `readable`/`writable`; used
    /// when an external producer queued data for one of them.
    pub fn wake(&self) {
        let _ = self.tx.send(Control::Wake);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Control::Shutdown);
    }
}

pub struct Reactor {
    objs: Vec<Box<dyn EioObject>>,
    rx: mpsc::UnboundedReceiver<Control>,
}

impl Reactor {
    pub fn new() -> (Self, EioHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                objs: Vec::new(),
                rx,
            },
            EioHandle { tx },
        )
    }

    /// Register an object before the loop starts.
    pub fn add_initial(&mut self, obj: Box<dyn EioObject>) {
        self.objs.push(obj);
    }

    /// Drive callbacks until shutdown. Every remaining object receives
    /// `handle_close` on the way out.
    pub async fn run(mut self) {
        let mut shutdown = false;

        while !shutdown {
            let mut ready: Vec<(usize, Interest)> = Vec::new();
            let mut errored: Vec<(usize, io::Error)> = Vec::new();
            let mut added: Vec<Box<dyn EioObject>> = Vec::new();

            {
                let objs = &mut self.objs;
                let rx = &mut self.rx;
                std::future::poll_fn(|cx| {
                    let mut progress = false;

                    loop {
                        match rx.poll_recv(cx) {
                            Poll::Ready(Some(Control::Add(obj))) => {
                                added.push(obj);
                                progress = true;
                            }
                            Poll::Ready(Some(Control::Wake)) => {
                                progress = true;
                            }
                            Poll::Ready(Some(Control::Shutdown)) | Poll::Ready(None) => {
                                shutdown = true;
                                progress = true;
                                break;
                            }
                            Poll::Pending => break,
                        }
                    }

                    for (idx, obj) in objs.iter_mut().enumerate() {
                        if obj.readable() {
                            match obj.poll_read_ready(cx) {
                                Poll::Ready(Ok(())) => {
                                    ready.push((idx, Interest::Read));
                                    progress = true;
                                }
                                Poll::Ready(Err(err)) => {
                                    errored.push((idx, err));
                                    progress = true;
                                }
                                Poll::Pending => {}
                            }
                        }
                        if obj.writable() {
                            match obj.poll_write_ready(cx) {
                                Poll::Ready(Ok(())) => {
                                    ready.push((idx, Interest::Write));
                                    progress = true;
                                }
                                Poll::Ready(Err(err)) => {
                                    errored.push((idx, err));
                                    progress = true;
                                }
                                Poll::Pending => {}
                            }
                        }
                    }

                    if progress {
                        Poll::Ready(())
                    } else {
                        Poll::Pending
                    }
                })
                .await;
            }

            let mut closing: Vec<usize> = Vec::new();

            for (idx, err) in errored {
                trace!(obj = self.objs[idx].name(), %err, "eio readiness error");
                if self.objs[idx].handle_error(&err) == HandleOutcome::Close {
                    closing.push(idx);
                }
            }

            for (idx, interest) in ready {
                if closing.contains(&idx) {
                    continue;
                }
                let obj = &mut self.objs[idx];
                let result = match interest {
                    Interest::Read => obj.handle_read(),
                    Interest::Write => obj.handle_write(),
                };
                match result {
                    Ok(HandleOutcome::Keep) => {}
                    Ok(HandleOutcome::Close) => closing.push(idx),
                    Err(err) => {
                        trace!(obj = obj.name(), %err, "eio handler error");
                        if obj.handle_error(&err) == HandleOutcome::Close {
                            closing.push(idx);
                        }
                    }
                }
            }

            closing.sort_unstable();
            closing.dedup();
            for idx in closing.into_iter().rev() {
                let mut obj = self.objs.remove(idx);
                obj.handle_close();
            }

            self.objs.extend(added);
        }

        for obj in &mut self.objs {
            obj.handle_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Notify;

    struct Sink {
        stream: TcpStream,
        data: Arc<Mutex<Vec<u8>>>,
        done: Arc<Notify>,
    }

    impl EioObject for Sink {
        fn name(&self) -> &'static str {
            "test-sink"
        }

        fn readable(&self) -> bool {
            true
        }

        fn poll_read_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.stream.poll_read_ready(cx)
        }

        fn handle_read(&mut self) -> io::Result<HandleOutcome> {
            let mut buf = [0u8; 256];
            match self.stream.try_read(&mut buf) {
                Ok(0) => Ok(HandleOutcome::Close),
                Ok(n) => {
                    self.data.lock().unwrap().extend_from_slice(&buf[..n]);
                    Ok(HandleOutcome::Keep)
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(HandleOutcome::Keep),
                Err(e) => Err(e),
            }
        }

        fn handle_close(&mut self) {
            self.done.notify_one();
        }
    }

    #[tokio::test]
    async fn reads_until_eof_then_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (reactor, handle) = Reactor::new();
        let data = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Notify::new());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        handle.add_object(Box::new(Sink {
            stream: server_side,
            data: data.clone(),
            done: done.clone(),
        }));

        let reactor_task = tokio::spawn(reactor.run());

        client.write_all(b"hello reactor").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        done.notified().await;
        assert_eq!(data.lock().unwrap().as_slice(), b"hello reactor");

        handle.shutdown();
        reactor_task.await.unwrap();
    }
}
