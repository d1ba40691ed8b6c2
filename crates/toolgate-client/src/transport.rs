//! Byte-level transports to a tool server.
//!
//! A transport is either a spawned child process (stdin/stdout/stderr pipes)
//! or a TCP socket. Both deliver inbound lines as [`TransportEvent`]s on a
//! channel. Outbound requests are queued to a writer task that owns the
//! framed writer, so a peer that stops reading never blocks the caller. The
//! transport never looks inside the lines it carries.

use crate::codec::JsonLineCodec;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::jsonrpc::JsonRpcRequest;
use futures_util::{SinkExt, StreamExt};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodecError, FramedRead, FramedWrite};

pub(crate) type EventSender = mpsc::Sender<TransportEvent>;

type LineWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonLineCodec>;

/// Something that happened on a transport, tagged with the generation of the
/// transport that produced it so stale events can be told apart.
#[derive(Debug)]
pub(crate) struct TransportEvent {
    pub generation: u64,
    pub kind: EventKind,
}

#[derive(Debug)]
pub(crate) enum EventKind {
    /// A line from the protocol stream (child stdout or the socket).
    Line(String),
    /// A line from the child's stderr.
    Diagnostic(String),
    /// Writing request `id` failed; the writer has stopped.
    WriteFailed { id: String, error: Arc<std::io::Error> },
    /// The transport is gone.
    Closed(CloseCause),
}

/// Why a transport stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The child process exited.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The socket reached end of stream.
    Eof,
    /// Reading the socket failed.
    ReadFailed(String),
    /// Writing a request failed.
    WriteFailed,
}

impl CloseCause {
    /// Whether the process reported a failure (non-zero code or killed by a signal).
    pub fn is_failure_exit(&self) -> bool {
        match self {
            CloseCause::Exited { code, signal } => signal.is_some() || code.is_some_and(|c| c != 0),
            _ => false,
        }
    }
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseCause::Exited {
                code: Some(code), ..
            } => write!(f, "exited with code {code}"),
            CloseCause::Exited {
                signal: Some(sig), ..
            } => write!(f, "killed by signal {sig}"),
            CloseCause::Exited { .. } => write!(f, "exited"),
            CloseCause::Eof => write!(f, "connection closed"),
            CloseCause::ReadFailed(e) => write!(f, "read failed: {e}"),
            CloseCause::WriteFailed => write!(f, "write failed"),
        }
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Protocol,
    Stderr,
}

enum Endpoint {
    Process(ProcessHandle),
    Socket,
}

struct ProcessHandle {
    /// Dropping or firing this asks the exit watcher to kill the child.
    kill_tx: Option<oneshot::Sender<()>>,
    /// Fires once the child has been reaped.
    exited_rx: oneshot::Receiver<()>,
}

/// A live connection to a tool server.
pub(crate) struct Transport {
    generation: u64,
    label: String,
    outbound: mpsc::UnboundedSender<JsonRpcRequest>,
    writer: JoinHandle<()>,
    readers: Vec<JoinHandle<()>>,
    endpoint: Endpoint,
}

impl Transport {
    /// Spawn the configured server with `port` in its environment.
    pub fn spawn_process(
        config: &GatewayConfig,
        port: u16,
        generation: u64,
        events: EventSender,
    ) -> Result<Self, GatewayError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .env(&config.port_env, port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| GatewayError::SpawnFailed {
            command: config.command.clone(),
            source: Arc::new(e),
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(GatewayError::Protocol(
                "child stdio was not captured".to_string(),
            ));
        };

        let label = match child.id() {
            Some(pid) => format!("{} (pid {pid}, port {port})", config.command),
            None => format!("{} (port {port})", config.command),
        };

        let readers = vec![
            tokio::spawn(pump_lines(
                stdout,
                generation,
                events.clone(),
                Stream::Protocol,
                false,
            )),
            tokio::spawn(pump_lines(
                stderr,
                generation,
                events.clone(),
                Stream::Stderr,
                false,
            )),
        ];

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        tokio::spawn(watch_exit(
            child,
            generation,
            events.clone(),
            kill_rx,
            exited_tx,
        ));

        let stdin: Box<dyn AsyncWrite + Send + Unpin> = Box::new(stdin);
        let (outbound, queued) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_requests(
            FramedWrite::new(stdin, JsonLineCodec::new()),
            queued,
            generation,
            events,
        ));

        Ok(Self {
            generation,
            label,
            outbound,
            writer,
            readers,
            endpoint: Endpoint::Process(ProcessHandle {
                kill_tx: Some(kill_tx),
                exited_rx,
            }),
        })
    }

    /// Connect to a running server. No retry: refusal is returned as-is.
    pub async fn connect_socket(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        generation: u64,
        events: EventSender,
    ) -> Result<Self, GatewayError> {
        let addr = format!("{host}:{port}");
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(GatewayError::ConnectFailed {
                    addr,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(GatewayError::ConnectFailed {
                    addr,
                    message: format!("timed out after {}ms", connect_timeout.as_millis()),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {addr}: {e}");
        }

        let (read_half, write_half) = stream.into_split();
        let reader = tokio::spawn(pump_lines(
            read_half,
            generation,
            events.clone(),
            Stream::Protocol,
            true,
        ));

        let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        let (outbound, queued) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_requests(
            FramedWrite::new(write_half, JsonLineCodec::new()),
            queued,
            generation,
            events,
        ));

        Ok(Self {
            generation,
            label: addr,
            outbound,
            writer,
            readers: vec![reader],
            endpoint: Endpoint::Socket,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the underlying process is still running. Sockets report alive
    /// until their close event has been processed.
    pub fn is_alive(&mut self) -> bool {
        match &mut self.endpoint {
            Endpoint::Process(handle) => matches!(
                handle.exited_rx.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            ),
            Endpoint::Socket => true,
        }
    }

    /// Queue one request for writing. Returns immediately; a failure of
    /// the write itself arrives later as [`EventKind::WriteFailed`].
    pub fn send(&self, request: JsonRpcRequest) -> Result<(), GatewayError> {
        self.outbound.send(request).map_err(|_| {
            GatewayError::BrokenPipe(Arc::new(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "writer has stopped",
            )))
        })
    }

    /// Tear the transport down: stop line delivery, close the writer, and for
    /// a process wait up to `grace` for it to exit before killing it.
    pub async fn shutdown(self, grace: Duration) {
        let Transport {
            label,
            outbound,
            mut writer,
            readers,
            endpoint,
            ..
        } = self;

        for reader in &readers {
            reader.abort();
        }

        // Closing the queue lets the writer finish and close its end. For a
        // process that is stdin EOF, the polite request to exit.
        drop(outbound);

        match endpoint {
            Endpoint::Socket => {
                if tokio::time::timeout(grace, &mut writer).await.is_err() {
                    writer.abort();
                }
            }
            Endpoint::Process(mut handle) => {
                if tokio::time::timeout(grace, &mut handle.exited_rx)
                    .await
                    .is_err()
                {
                    tracing::debug!("{label} did not exit within {grace:?}; killing");
                    if let Some(kill) = handle.kill_tx.take() {
                        let _ = kill.send(());
                    }
                    if tokio::time::timeout(grace, &mut handle.exited_rx)
                        .await
                        .is_err()
                    {
                        tracing::warn!("{label} still running after kill");
                    }
                }
                writer.abort();
            }
        }
    }
}

/// Read lines from `reader` and forward them as events until EOF.
async fn pump_lines<R>(
    reader: R,
    generation: u64,
    events: EventSender,
    stream: Stream,
    report_close: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, JsonLineCodec::new());
    let mut skip_end = false;

    let cause = loop {
        match lines.next().await {
            Some(Ok(line)) => {
                let kind = match stream {
                    Stream::Protocol => EventKind::Line(line),
                    Stream::Stderr => EventKind::Diagnostic(line),
                };
                if events.send(TransportEvent { generation, kind }).await.is_err() {
                    return;
                }
            }
            Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                tracing::warn!("Discarding oversized line from tool server");
                // FramedRead yields one `None` after a decoder error before it
                // resumes reading.
                skip_end = true;
            }
            Some(Err(AnyDelimiterCodecError::Io(e))) => break CloseCause::ReadFailed(e.to_string()),
            None if skip_end => skip_end = false,
            None => break CloseCause::Eof,
        }
    };

    if report_close {
        let _ = events
            .send(TransportEvent {
                generation,
                kind: EventKind::Closed(cause),
            })
            .await;
    }
}

/// Write queued requests in order until the queue closes or a write fails.
async fn write_requests(
    mut sink: LineWriter,
    mut queued: mpsc::UnboundedReceiver<JsonRpcRequest>,
    generation: u64,
    events: EventSender,
) {
    while let Some(request) = queued.recv().await {
        if let Err(e) = sink.send(&request).await {
            // Later sends must fail up front instead of queueing forever.
            drop(queued);
            let _ = events
                .send(TransportEvent {
                    generation,
                    kind: EventKind::WriteFailed {
                        id: request.id,
                        error: Arc::new(e),
                    },
                })
                .await;
            return;
        }
    }

    // Every send flushes, so the codec buffer is already empty.
    let mut io = sink.into_inner();
    let _ = io.shutdown().await;
}

/// Own the child until it exits, killing it on request.
async fn watch_exit(
    mut child: Child,
    generation: u64,
    events: EventSender,
    kill_rx: oneshot::Receiver<()>,
    exited_tx: oneshot::Sender<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!("Failed to kill tool server: {e}");
            }
            child.wait().await
        }
    };

    let cause = match status {
        Ok(status) => exit_cause(status),
        Err(e) => {
            tracing::warn!("Failed to wait on tool server: {e}");
            CloseCause::Exited {
                code: None,
                signal: None,
            }
        }
    };

    let _ = exited_tx.send(());
    let _ = events
        .send(TransportEvent {
            generation,
            kind: EventKind::Closed(cause),
        })
        .await;
}

fn exit_cause(status: ExitStatus) -> CloseCause {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    CloseCause::Exited {
        code: status.code(),
        signal,
    }
}
