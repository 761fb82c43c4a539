//! QMP client: newline-delimited JSON over the monitor's Unix socket.
//!
//! One task owns the read side and demultiplexes the stream: events are
//! fanned out on a broadcast channel, responses are matched positionally
//! to the oldest outstanding request (QMP is strictly FIFO per
//! connection). Writers are serialized, so request order on the wire
//! matches the pending queue.

mod message;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use message::{Greeting, QmpErrorBody, QmpEvent, QmpMessage, QmpResponse};

use capstan_core::{Error, Result};
use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::time::timeout;

type PendingQueue = Arc<StdMutex<VecDeque<oneshot::Sender<QmpResponse>>>>;

pub struct QmpClient {
    stream: Arc<UnixStream>,
    write_lock: Mutex<()>,
    pending: PendingQueue,
    events: broadcast::Sender<QmpEvent>,
    dead: Arc<AtomicBool>,
    qemu_version: Option<(u32, u32)>,
    reader: tokio::task::JoinHandle<()>,
}

impl QmpClient {
    /// Connect and negotiate: read the greeting, then send
    /// `qmp_capabilities` before anything else.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let mut carry = Vec::new();

        let line = read_line(&stream, &mut carry).await?;
        let greeting: Greeting = serde_json::from_str(&line)
            .map_err(|e| Error::Protocol(format!("bad greeting: {e}")))?;
        let qemu_version = greeting.qemu_version();
        tracing::debug!(?qemu_version, "qmp greeting received");

        write_all(&stream, b"{\"execute\":\"qmp_capabilities\"}\n").await?;
        let response = loop {
            let line = read_line(&stream, &mut carry).await?;
            match QmpMessage::parse(&line)? {
                QmpMessage::Event(event) => {
                    tracing::debug!(event = %event.event, "qmp event during handshake");
                }
                QmpMessage::Response(response) => break response,
            }
        };
        response.into_result()?;

        let stream = Arc::new(stream);
        let pending: PendingQueue = Arc::new(StdMutex::new(VecDeque::new()));
        let (events, _) = broadcast::channel(64);
        let dead = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(demux_loop(
            stream.clone(),
            carry,
            pending.clone(),
            events.clone(),
            dead.clone(),
        ));

        Ok(QmpClient {
            stream,
            write_lock: Mutex::new(()),
            pending,
            events,
            dead,
            qemu_version,
            reader,
        })
    }

    pub fn qemu_version(&self) -> Option<(u32, u32)> {
        self.qemu_version
    }

    pub fn is_connected(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<QmpEvent> {
        self.events.subscribe()
    }

    /// Issue a command and wait for its response. QMP errors are returned
    /// as a value so callers can retry with different arguments.
    pub async fn call(&self, cmd: &str, arguments: Option<Value>) -> Result<QmpResponse> {
        let rx = self.send_request(cmd, arguments, None).await?;
        rx.await.map_err(|_| Error::Disconnected)
    }

    /// Like [`call`](Self::call) but fatal: a QMP error becomes
    /// [`Error::Qmp`].
    pub async fn execute(&self, cmd: &str, arguments: Option<Value>) -> Result<Value> {
        self.call(cmd, arguments).await?.into_result()
    }

    /// [`call`](Self::call) with a wall-clock budget. A response arriving
    /// after the budget is discarded by the demux loop, never matched to
    /// a later request.
    pub async fn call_timeout(
        &self,
        cmd: &str,
        arguments: Option<Value>,
        budget: Duration,
    ) -> Result<QmpResponse> {
        match timeout(budget, self.call(cmd, arguments)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!("qmp {cmd}"))),
        }
    }

    /// Issue a command whose request line carries an open file descriptor
    /// as SCM_RIGHTS ancillary data. The local copy of the fd is closed
    /// exactly once, when `fd` drops at the end of this call.
    pub async fn call_with_fd(
        &self,
        cmd: &str,
        arguments: Option<Value>,
        fd: OwnedFd,
    ) -> Result<QmpResponse> {
        let rx = self.send_request(cmd, arguments, Some(&fd)).await?;
        drop(fd);
        rx.await.map_err(|_| Error::Disconnected)
    }

    /// QEMU's text monitor via `human-monitor-command`.
    pub async fn human_monitor(&self, command_line: &str) -> Result<Value> {
        self.execute(
            "human-monitor-command",
            Some(json!({ "command-line": command_line })),
        )
        .await
    }

    /// `query-status`, returning (status, running).
    pub async fn query_status(&self) -> Result<(String, bool)> {
        let ret = self.execute("query-status", None).await?;
        let status = ret
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("query-status without status".into()))?
            .to_string();
        let running = ret.get("running").and_then(Value::as_bool).unwrap_or(false);
        Ok((status, running))
    }

    /// Wait until an event with the given name arrives.
    pub async fn wait_for_event(&self, name: &str, budget: Duration) -> Result<QmpEvent> {
        let mut rx = self.events.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(event) if event.event == name => return Ok(event),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(Error::Disconnected),
                }
            }
        };
        match timeout(budget, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!("event {name}"))),
        }
    }

    /// Serialize the request, enqueue its response slot, and write the
    /// line. Queue insertion and the write happen under one lock so the
    /// pending order matches the wire order.
    async fn send_request(
        &self,
        cmd: &str,
        arguments: Option<Value>,
        fd: Option<&OwnedFd>,
    ) -> Result<oneshot::Receiver<QmpResponse>> {
        let mut request = json!({ "execute": cmd });
        if let Some(arguments) = arguments {
            request["arguments"] = arguments;
        }
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        let _guard = self.write_lock.lock().await;
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        self.pending.lock().unwrap().push_back(tx);

        match fd {
            None => write_all(&self.stream, line.as_bytes()).await?,
            Some(fd) => {
                let sent = self
                    .stream
                    .async_io(Interest::WRITABLE, || {
                        let iov = [IoSlice::new(line.as_bytes())];
                        let fds = [fd.as_raw_fd()];
                        let cmsg = [ControlMessage::ScmRights(&fds)];
                        sendmsg::<()>(
                            self.stream.as_raw_fd(),
                            &iov,
                            &cmsg,
                            MsgFlags::empty(),
                            None,
                        )
                        .map_err(std::io::Error::from)
                    })
                    .await?;
                if sent < line.len() {
                    write_all(&self.stream, &line.as_bytes()[sent..]).await?;
                }
            }
        }
        Ok(rx)
    }
}

impl Drop for QmpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn demux_loop(
    stream: Arc<UnixStream>,
    mut carry: Vec<u8>,
    pending: PendingQueue,
    events: broadcast::Sender<QmpEvent>,
    dead: Arc<AtomicBool>,
) {
    loop {
        let line = match read_line(&stream, &mut carry).await {
            Ok(line) => line,
            Err(e) => {
                if !matches!(e, Error::Disconnected) {
                    tracing::warn!(error = %e, "qmp read failed");
                }
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        match QmpMessage::parse(&line) {
            Ok(QmpMessage::Event(event)) => {
                tracing::debug!(event = %event.event, data = %event.data, "qmp event");
                let _ = events.send(event);
            }
            Ok(QmpMessage::Response(response)) => {
                let slot = pending.lock().unwrap().pop_front();
                match slot {
                    Some(tx) => {
                        if tx.send(response).is_err() {
                            tracing::debug!("discarding qmp response after caller timeout");
                        }
                    }
                    None => tracing::warn!("qmp response without outstanding request"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "skipping unparseable qmp line"),
        }
    }
    dead.store(true, Ordering::SeqCst);
    // Fail queued requests with Disconnected by dropping their senders.
    pending.lock().unwrap().clear();
}

async fn read_line(stream: &UnixStream, carry: &mut Vec<u8>) -> Result<String> {
    loop {
        if let Some(pos) = carry.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = carry.drain(..=pos).collect();
            let text = String::from_utf8(line)
                .map_err(|e| Error::Protocol(format!("non-utf8 qmp line: {e}")))?;
            return Ok(text.trim().to_string());
        }
        stream.readable().await?;
        let mut chunk = [0u8; 4096];
        match stream.try_read(&mut chunk) {
            Ok(0) => return Err(Error::Disconnected),
            Ok(n) => carry.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

async fn write_all(stream: &UnixStream, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        stream.writable().await?;
        match stream.try_write(buf) {
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
