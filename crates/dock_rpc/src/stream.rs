//! Stream endpoint: a named local full-duplex byte transport with newline
//! framing. `connect` dials the shared dock pipe (client role);
//! `accept_one`/[`AcceptLoop`] serve exactly one peer at a time (server role).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::DockRpcError;

/// Frames the writer will queue before [`DockRpcError::WriteBusy`] is raised
/// instead of growing without bound on a stuck peer.
pub const WRITE_QUEUE_CAPACITY: usize = 1024;

/// Minimum bounded wait before `connect` gives up with [`DockRpcError::Unreachable`].
pub const MIN_CONNECT_WAIT: Duration = Duration::from_secs(5);

type BoxedRead = Box<dyn tokio::io::AsyncRead + Unpin + Send>;
type BoxedWrite = Box<dyn tokio::io::AsyncWrite + Unpin + Send>;

#[cfg(unix)]
mod platform {
    use super::{BoxedRead, BoxedWrite};
    use std::path::PathBuf;
    use tokio::net::{UnixListener, UnixStream};

    /// Unix sockets live in a conventional local-pipe directory, with the
    /// name prefixed by the conventional local-pipe prefix.
    pub fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("dock_rpc.{name}.sock"))
    }

    pub struct Listener(UnixListener);

    pub fn bind(name: &str) -> std::io::Result<Listener> {
        let path = socket_path(name);
        let _ = std::fs::remove_file(&path);
        Ok(Listener(UnixListener::bind(path)?))
    }

    impl Listener {
        pub async fn accept(&self) -> std::io::Result<(BoxedRead, BoxedWrite)> {
            let (stream, _addr) = self.0.accept().await?;
            let (r, w) = tokio::io::split(stream);
            Ok((Box::new(r), Box::new(w)))
        }
    }

    pub async fn connect(name: &str) -> std::io::Result<(BoxedRead, BoxedWrite)> {
        let stream = UnixStream::connect(socket_path(name)).await?;
        let (r, w) = tokio::io::split(stream);
        Ok((Box::new(r), Box::new(w)))
    }

    pub fn is_busy(err: &std::io::Error) -> bool {
        // EAGAIN (11 on Linux, 35 on BSD/macOS): the listen backlog is full.
        matches!(err.raw_os_error(), Some(11) | Some(35))
    }
}

#[cfg(windows)]
mod platform {
    use super::{BoxedRead, BoxedWrite};
    use tokio::net::windows::named_pipe::{ClientOptions, ServerOptions};

    /// Windows named pipes live under the conventional `\\.\pipe\` prefix.
    pub fn pipe_path(name: &str) -> String {
        format!(r"\\.\pipe\{name}")
    }

    pub struct Listener {
        path: String,
    }

    pub fn bind(name: &str) -> std::io::Result<Listener> {
        Ok(Listener {
            path: pipe_path(name),
        })
    }

    impl Listener {
        pub async fn accept(&self) -> std::io::Result<(BoxedRead, BoxedWrite)> {
            // A fresh pipe instance per accept, so a disconnected client
            // doesn't leave the listener stuck.
            let server = ServerOptions::new().create(&self.path)?;
            server.connect().await?;
            let (r, w) = tokio::io::split(server);
            Ok((Box::new(r), Box::new(w)))
        }
    }

    pub async fn connect(name: &str) -> std::io::Result<(BoxedRead, BoxedWrite)> {
        let client = ClientOptions::new().open(pipe_path(name))?;
        let (r, w) = tokio::io::split(client);
        Ok((Box::new(r), Box::new(w)))
    }

    pub fn is_busy(err: &std::io::Error) -> bool {
        // ERROR_PIPE_BUSY
        err.raw_os_error() == Some(231)
    }
}

fn is_retryable(err: &std::io::Error) -> bool {
    platform::is_busy(err)
        || matches!(
            err.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
        )
}

/// A cheap, cloneable write-only handle onto an [`Endpoint`]'s serialized
/// writer, so workers can send responses without contending with the
/// session's read loop for ownership of the endpoint. Reader and writer run
/// concurrently.
#[derive(Clone)]
pub struct FrameWriter {
    write_tx: mpsc::Sender<String>,
}

impl FrameWriter {
    pub fn write_frame(&self, line: String) -> Result<(), DockRpcError> {
        debug_assert!(!line.contains('\n'), "frames must be newline-free");
        self.write_tx.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DockRpcError::WriteBusy {
                capacity: WRITE_QUEUE_CAPACITY,
            },
            mpsc::error::TrySendError::Closed(_) => DockRpcError::Disconnected,
        })
    }
}

/// One end of a connected duplex stream, framed on `\n`.
pub struct Endpoint {
    frame_rx: mpsc::Receiver<String>,
    write_tx: mpsc::Sender<String>,
    disconnected: Arc<AtomicBool>,
    disconnect_notify: Arc<Notify>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Endpoint {
    fn from_halves(mut read: BoxedRead, mut write: BoxedWrite) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel::<String>(256);
        let (write_tx, mut write_rx) = mpsc::channel::<String>(WRITE_QUEUE_CAPACITY);
        let disconnected = Arc::new(AtomicBool::new(false));
        let disconnect_notify = Arc::new(Notify::new());

        let reader_disconnected = disconnected.clone();
        let reader_notify = disconnect_notify.clone();
        let reader_task = tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match read.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = buf.drain(..=pos).collect();
                            let line = &line[..line.len() - 1];
                            match std::str::from_utf8(line) {
                                Ok(s) => {
                                    if frame_tx.send(s.to_string()).await.is_err() {
                                        return;
                                    }
                                }
                                Err(_) => {
                                    tracing::warn!("dropped non-UTF-8 frame");
                                }
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
            reader_disconnected.store(true, Ordering::SeqCst);
            reader_notify.notify_waiters();
        });

        let writer_task = tokio::spawn(async move {
            while let Some(line) = write_rx.recv().await {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                if write.write_all(&bytes).await.is_err() {
                    break;
                }
                let _ = write.flush().await;
            }
        });

        Endpoint {
            frame_rx,
            write_tx,
            disconnected,
            disconnect_notify,
            reader_task,
            writer_task,
        }
    }

    /// Connect as a client, retrying "busy"/"not yet listening" errors within
    /// a bounded wait of at least 5s.
    pub async fn connect(name: &str, wait: Duration) -> Result<Self, DockRpcError> {
        let wait = wait.max(MIN_CONNECT_WAIT);
        let deadline = tokio::time::Instant::now() + wait;
        let mut backoff = Duration::from_millis(20);
        loop {
            match platform::connect(name).await {
                Ok((r, w)) => return Ok(Self::from_halves(r, w)),
                Err(e) if is_retryable(&e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(DockRpcError::Unreachable { waited: wait });
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(500));
                }
                Err(e) => return Err(DockRpcError::Io(e)),
            }
        }
    }

    /// Accept exactly one peer as a server.
    pub async fn accept_one(name: &str) -> Result<Self, DockRpcError> {
        let listener = platform::bind(name)?;
        let (r, w) = listener.accept().await?;
        Ok(Self::from_halves(r, w))
    }

    pub async fn read_frame(&mut self) -> Result<String, DockRpcError> {
        self.frame_rx.recv().await.ok_or(DockRpcError::Disconnected)
    }

    /// Enqueue a line for the serialized writer. Non-blocking: a full queue
    /// (a stuck peer) surfaces as [`DockRpcError::WriteBusy`] rather than
    /// growing without bound.
    pub fn write_frame(&self, line: String) -> Result<(), DockRpcError> {
        self.writer().write_frame(line)
    }

    /// A cloneable handle onto this endpoint's writer half.
    pub fn writer(&self) -> FrameWriter {
        FrameWriter {
            write_tx: self.write_tx.clone(),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// A signal that resolves (possibly immediately) once the peer has
    /// disconnected, so the session can react without waiting on the next
    /// failed read.
    pub fn disconnect_signal(&self) -> Arc<Notify> {
        self.disconnect_notify.clone()
    }

    pub fn close(self) {
        self.reader_task.abort();
        drop(self.write_tx);
        self.writer_task.abort();
    }
}

/// Server-role helper implementing the "restart loop": after a peer
/// disconnects, the app stream server may re-create itself and accept again.
/// At most one peer is connected at a time.
pub struct AcceptLoop {
    listener: platform::Listener,
}

impl AcceptLoop {
    pub fn bind(name: &str) -> Result<Self, DockRpcError> {
        Ok(Self {
            listener: platform::bind(name)?,
        })
    }

    pub async fn accept_next(&self) -> Result<Endpoint, DockRpcError> {
        let (r, w) = self.listener.accept().await?;
        Ok(Endpoint::from_halves(r, w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_fails_unreachable_when_nobody_listens() {
        let name = format!("dock_rpc_test_unreachable_{}", uuid::Uuid::new_v4());
        let err = Endpoint::connect(&name, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, DockRpcError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn frames_round_trip_and_disconnect_is_observed() {
        let name = format!("dock_rpc_test_roundtrip_{}", uuid::Uuid::new_v4());
        let accept_loop = AcceptLoop::bind(&name).unwrap();
        let server_fut = tokio::spawn(async move { accept_loop.accept_next().await.unwrap() });
        // give the listener a moment to bind before the client dials.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut client = Endpoint::connect(&name, Duration::from_secs(5)).await.unwrap();
        let mut server = server_fut.await.unwrap();

        client.write_frame("hello".to_string()).unwrap();
        let got = server.read_frame().await.unwrap();
        assert_eq!(got, "hello");

        let signal = server.disconnect_signal();
        client.close();
        tokio::time::timeout(Duration::from_secs(5), signal.notified())
            .await
            .expect("disconnect must surface within 5s");
    }
}
