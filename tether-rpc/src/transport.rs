//! Duplex framed transports.
//!
//! A [`Transport`] carries whole [`RpcFrame`]s. Frames are written under
//! a writer mutex so concurrent callers never interleave bytes; a single
//! reader task (the dispatcher's) consumes `recv`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LinesCodec};

use tether_types::RpcError;

use crate::codec::{self, MAX_FRAME_BYTES, RpcFrame};

/// Environment variables a child inherits from the parent. Everything
/// else is stripped; per-server additions come from [`ChildSpec::env`].
const ENV_ALLOW_LIST: &[&str] =
    &["PATH", "HOME", "USER", "SHELL", "TERM", "LANG", "LC_ALL", "TMPDIR"];

/// How long [`ChildTransport::close`] waits for a clean exit before
/// killing the child.
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A duplex stream of JSON-RPC frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one frame. Serialized internally; safe to call concurrently.
    async fn send(&self, frame: &RpcFrame) -> Result<(), RpcError>;

    /// Read the next frame. `None` means the peer closed. A `Some(Err)`
    /// is a per-frame failure (bad JSON, oversized line); the stream
    /// remains readable afterwards.
    async fn recv(&self) -> Option<Result<RpcFrame, RpcError>>;

    /// Close the transport. Idempotent.
    async fn close(&self);
}

/// How to launch a tool-server child process.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Server name, used for log attribution.
    pub name: String,
    /// Executable. Run directly, never through a shell.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables layered over the allow-list.
    pub env: HashMap<String, String>,
    /// Working directory, if different from the parent's.
    pub cwd: Option<PathBuf>,
}

impl ChildSpec {
    /// A spec with just a command, for tests and simple servers.
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
        }
    }
}

/// Build the sanitized environment for a child: allow-listed parent
/// variables plus the spec's additions (which win on conflict).
#[must_use]
pub fn sanitized_env(extra: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for key in ENV_ALLOW_LIST {
        if let Ok(value) = std::env::var(key) {
            env.insert((*key).to_string(), value);
        }
    }
    for (key, value) in extra {
        env.insert(key.clone(), value.clone());
    }
    env
}

type FrameReader<R> = Mutex<FramedRead<R, LinesCodec>>;

/// Transport over a spawned child's stdin/stdout.
///
/// stderr is drained to `tracing` tagged with the server name. When the
/// child exits, `recv` observes EOF and returns `None`.
pub struct ChildTransport {
    name: String,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<ChildStdin>>,
    reader: FrameReader<ChildStdout>,
}

impl ChildTransport {
    /// Spawn the configured command with a sanitized environment and
    /// piped stdio.
    ///
    /// # Errors
    ///
    /// Returns the spawn failure (missing binary, permissions, etc.).
    pub fn spawn(spec: &ChildSpec) -> std::io::Result<Self> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .env_clear()
            .envs(sanitized_env(&spec.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("child stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not piped"))?;
        if let Some(stderr) = child.stderr.take() {
            let name = spec.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(server = %name, "stderr: {line}");
                }
            });
        }

        Ok(Self {
            name: spec.name.clone(),
            child: Mutex::new(Some(child)),
            writer: Mutex::new(Some(stdin)),
            reader: Mutex::new(FramedRead::new(
                stdout,
                LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
            )),
        })
    }
}

#[async_trait]
impl Transport for ChildTransport {
    async fn send(&self, frame: &RpcFrame) -> Result<(), RpcError> {
        let line = codec::encode_frame(frame);
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(RpcError::TransportClosed)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Option<Result<RpcFrame, RpcError>> {
        let mut reader = self.reader.lock().await;
        match reader.next().await? {
            Ok(line) => Some(codec::decode_line(&line)),
            Err(err) => Some(Err(RpcError::Parse(err.to_string()))),
        }
    }

    async fn close(&self) {
        // Dropping stdin signals EOF; a well-behaved server exits on it.
        self.writer.lock().await.take();
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(CHILD_EXIT_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.name, %status, "tool server exited");
                }
                Ok(Err(err)) => {
                    tracing::warn!(server = %self.name, error = %err, "wait failed");
                }
                Err(_) => {
                    tracing::warn!(server = %self.name, "tool server did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

/// Transport over this process's own stdin/stdout, for running as a
/// tool server under a parent orchestrator.
pub struct StdioTransport {
    writer: Mutex<tokio::io::Stdout>,
    reader: FrameReader<tokio::io::Stdin>,
}

impl StdioTransport {
    /// Wrap the process's stdio.
    #[must_use]
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(tokio::io::stdout()),
            reader: Mutex::new(FramedRead::new(
                tokio::io::stdin(),
                LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
            )),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, frame: &RpcFrame) -> Result<(), RpcError> {
        let line = codec::encode_frame(frame);
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Option<Result<RpcFrame, RpcError>> {
        let mut reader = self.reader.lock().await;
        match reader.next().await? {
            Ok(line) => Some(codec::decode_line(&line)),
            Err(err) => Some(Err(RpcError::Parse(err.to_string()))),
        }
    }

    async fn close(&self) {
        // stdin/stdout belong to the process; nothing to release.
    }
}

/// Transport over a connected unix stream socket.
pub struct UnixTransport {
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: FrameReader<OwnedReadHalf>,
}

impl UnixTransport {
    /// Connect to a listening socket.
    ///
    /// # Errors
    ///
    /// Returns the connection failure.
    pub async fn connect(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::from_stream(UnixStream::connect(path).await?))
    }

    /// Wrap an accepted stream.
    #[must_use]
    pub fn from_stream(stream: UnixStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            writer: Mutex::new(Some(write)),
            reader: Mutex::new(FramedRead::new(
                read,
                LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
            )),
        }
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn send(&self, frame: &RpcFrame) -> Result<(), RpcError> {
        let line = codec::encode_frame(frame);
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(RpcError::TransportClosed)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Option<Result<RpcFrame, RpcError>> {
        let mut reader = self.reader.lock().await;
        match reader.next().await? {
            Ok(line) => Some(codec::decode_line(&line)),
            Err(err) => Some(Err(RpcError::Parse(err.to_string()))),
        }
    }

    async fn close(&self) {
        self.writer.lock().await.take();
    }
}

/// Listener side of the unix-socket transport.
///
/// Binding removes any stale socket file first and restricts the new one
/// to owner-only permissions. Each accepted connection is an independent
/// [`UnixTransport`].
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Bind at `path`, replacing a stale socket file.
    ///
    /// # Errors
    ///
    /// Returns bind or permission failures.
    pub fn bind(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(Self { listener, path })
    }

    /// Accept the next connection.
    ///
    /// # Errors
    ///
    /// Returns the accept failure.
    pub async fn accept(&self) -> std::io::Result<UnixTransport> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(UnixTransport::from_stream(stream))
    }

    /// The socket file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// In-memory transport pair for tests.
#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use tokio::sync::mpsc;

    use super::*;

    /// One end of an in-memory transport pair.
    pub struct MockTransport {
        tx: Mutex<Option<mpsc::UnboundedSender<RpcFrame>>>,
        rx: Mutex<mpsc::UnboundedReceiver<RpcFrame>>,
    }

    /// Create a connected pair: frames sent on one end arrive at the other.
    #[must_use]
    pub fn pair() -> (MockTransport, MockTransport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MockTransport { tx: Mutex::new(Some(a_tx)), rx: Mutex::new(a_rx) },
            MockTransport { tx: Mutex::new(Some(b_tx)), rx: Mutex::new(b_rx) },
        )
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, frame: &RpcFrame) -> Result<(), RpcError> {
            let guard = self.tx.lock().await;
            let tx = guard.as_ref().ok_or(RpcError::TransportClosed)?;
            tx.send(frame.clone()).map_err(|_| RpcError::TransportClosed)
        }

        async fn recv(&self) -> Option<Result<RpcFrame, RpcError>> {
            self.rx.lock().await.recv().await.map(Ok)
        }

        async fn close(&self) {
            self.tx.lock().await.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitized_env_strips_unknown_variables() {
        // SAFETY: test-only manipulation of this process's environment.
        unsafe { std::env::set_var("TETHER_SECRET_LEAK_TEST", "oops") };
        let env = sanitized_env(&HashMap::new());
        assert!(!env.contains_key("TETHER_SECRET_LEAK_TEST"));
        unsafe { std::env::remove_var("TETHER_SECRET_LEAK_TEST") };
    }

    #[test]
    fn sanitized_env_layers_extras_over_allow_list() {
        let mut extra = HashMap::new();
        extra.insert("MY_SERVER_TOKEN".to_string(), "t".to_string());
        extra.insert("PATH".to_string(), "/custom".to_string());
        let env = sanitized_env(&extra);
        assert_eq!(env.get("MY_SERVER_TOKEN").map(String::as_str), Some("t"));
        assert_eq!(env.get("PATH").map(String::as_str), Some("/custom"));
    }

    #[tokio::test]
    async fn mock_pair_carries_frames_both_ways() {
        let (a, b) = mock::pair();
        let frame = RpcFrame::request(1u64, "ping", Some(json!({})));
        a.send(&frame).await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap(), frame);

        let reply = RpcFrame::response_ok(crate::codec::RpcId::Number(1), json!("pong"));
        b.send(&reply).await.unwrap();
        assert_eq!(a.recv().await.unwrap().unwrap(), reply);
    }

    #[tokio::test]
    async fn mock_close_ends_stream() {
        let (a, b) = mock::pair();
        a.close().await;
        assert!(b.recv().await.is_none());
        assert!(matches!(a.send(&RpcFrame::notification("x", None)).await, Err(RpcError::TransportClosed)));
    }

    #[tokio::test]
    async fn child_transport_round_trip_with_cat() {
        // `cat` echoes stdin to stdout, so every frame we send comes back.
        let spec = ChildSpec::new("echo", "cat");
        let transport = ChildTransport::spawn(&spec).unwrap();
        let frame = RpcFrame::request(42u64, "tools/list", None);
        transport.send(&frame).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), frame);
        transport.close().await;
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn child_exit_yields_eof() {
        let spec = ChildSpec::new("true", "true");
        let transport = ChildTransport::spawn(&spec).unwrap();
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn socket_listener_replaces_stale_file_and_restricts_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = SocketListener::bind(&path).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let client = tokio::spawn({
            let path = path.clone();
            async move { UnixTransport::connect(&path).await.unwrap() }
        });
        let server_side = listener.accept().await.unwrap();
        let client_side = client.await.unwrap();

        let frame = RpcFrame::notification("notifications/initialized", None);
        client_side.send(&frame).await.unwrap();
        assert_eq!(server_side.recv().await.unwrap().unwrap(), frame);

        drop(listener);
        assert!(!path.exists());
    }
}
