//! Transport lifecycle supervisor.
//!
//! The supervisor runs as a single task that owns the transport, the
//! response router, and all lifecycle state. Callers reach it only through a
//! command channel; transports report back through an event channel. Every
//! state change happens inside [`Supervisor::run`]'s select loop, one event at
//! a time, so nothing here needs a lock.
//!
//! Phases:
//!
//! ```text
//! Idle -> Starting -> Ready -> Restarting -> Starting ...
//!            |  ^                  |
//!            v  |                  v
//!          Degraded             Stopped   (also reachable from any phase via stop())
//! ```
//!
//! Port conflicts (`Starting -> Degraded -> Starting`) and crash restarts
//! (`Ready -> Restarting -> Starting`) draw on separate budgets.

use crate::codec::{Inbound, classify_line};
use crate::config::{ConnectionMode, GatewayConfig};
use crate::error::GatewayError;
use crate::jsonrpc::JsonRpcRequest;
use crate::router::{Completion, ResponseRouter};
use crate::transport::{CloseCause, EventKind, EventSender, Transport, TransportEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Lifecycle phase of the supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Constructed, `start()` not called yet.
    Idle,
    /// Transport created, waiting for readiness.
    Starting,
    /// Requests are accepted.
    Ready,
    /// Startup failed on a busy port; moving to the next one.
    Degraded,
    /// Server exited after readiness; waiting out the restart backoff.
    Restarting,
    /// Terminal.
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Ready => "ready",
            Phase::Degraded => "degraded",
            Phase::Restarting => "restarting",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Snapshot of supervisor state, published on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub phase: Phase,
    /// Only ever increases.
    pub current_port: u16,
    /// Restarts spent on unexpected exits. Port retries do not count.
    pub restart_attempts: u32,
    pub is_ready: bool,
    /// Set the first time the server becomes ready. From then on the port is
    /// settled and every failure draws on the restart budget.
    pub has_been_ready: bool,
    /// Set once, when an explicit stop begins.
    pub is_exiting: bool,
}

impl SupervisorStatus {
    fn initial(port: u16) -> Self {
        Self {
            phase: Phase::Idle,
            current_port: port,
            restart_attempts: 0,
            is_ready: false,
            has_been_ready: false,
            is_exiting: false,
        }
    }
}

/// Requests from the client facade.
pub(crate) enum Command {
    Start {
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    Call {
        request: JsonRpcRequest,
        reply: Completion,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// What to do after a transport went away unexpectedly.
#[derive(Debug)]
pub enum Recovery {
    /// Start again on this (higher) port.
    NextPort(u16),
    /// Restart on the same port; `attempt` is the new restart count.
    Restart { attempt: u32 },
    /// Stop permanently with this error.
    GiveUp(GatewayError),
}

/// Decide how to recover from a transport closing.
///
/// Before the server has ever been ready, a failing exit (or an
/// address-in-use report) is a port conflict and moves to the next port until
/// `max_port_attempts` ports have been tried. Once it has been ready, any
/// exit, including one during a restart that never reached readiness, restarts
/// it on the same port until `max_restart_attempts` is spent. Socket
/// connections are not re-established.
pub fn plan_recovery(
    config: &GatewayConfig,
    status: &SupervisorStatus,
    initial_port: u16,
    cause: &CloseCause,
    saw_address_in_use: bool,
) -> Recovery {
    if config.mode == ConnectionMode::ExternalSocket {
        return Recovery::GiveUp(GatewayError::ConnectionClosed);
    }

    if !status.has_been_ready {
        if !(cause.is_failure_exit() || saw_address_in_use) {
            return Recovery::GiveUp(match cause {
                CloseCause::Exited { code, .. } => GatewayError::ExitedBeforeReady { code: *code },
                _ => GatewayError::ConnectionClosed,
            });
        }

        let increment = config.port_increment.max(1);
        let current = status.current_port;
        let tried = u32::from(current.saturating_sub(initial_port) / increment) + 1;
        let exhausted = GatewayError::PortsExhausted {
            attempts: tried,
            first_port: initial_port,
            last_port: current,
        };
        if tried >= config.max_port_attempts {
            return Recovery::GiveUp(exhausted);
        }
        return match current.checked_add(increment) {
            Some(next) => Recovery::NextPort(next),
            None => Recovery::GiveUp(exhausted),
        };
    }

    if status.restart_attempts < config.max_restart_attempts {
        Recovery::Restart {
            attempt: status.restart_attempts + 1,
        }
    } else {
        Recovery::GiveUp(GatewayError::RestartsExhausted {
            attempts: status.restart_attempts,
        })
    }
}

/// Whether a diagnostic line reports a port collision.
pub fn is_address_in_use(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("eaddrinuse") || lower.contains("address already in use")
}

/// Whether a diagnostic line signals the server finished starting: it
/// contains one of `markers`, or it is a timestamped log line.
pub fn is_readiness_line(line: &str, markers: &[String]) -> bool {
    let lower = line.to_ascii_lowercase();
    markers
        .iter()
        .any(|m| !m.is_empty() && lower.contains(&m.to_ascii_lowercase()))
        || looks_timestamped(line)
}

/// `YYYY-MM-DD...`, optionally wrapped in `[`.
fn looks_timestamped(line: &str) -> bool {
    let s = line.trim_start();
    let s = s.strip_prefix('[').unwrap_or(s);
    let b = s.as_bytes();
    b.len() >= 10
        && b[..4].iter().all(u8::is_ascii_digit)
        && b[4] == b'-'
        && b[5..7].iter().all(u8::is_ascii_digit)
        && b[7] == b'-'
        && b[8..10].iter().all(u8::is_ascii_digit)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The supervisor task. See the module docs.
pub(crate) struct Supervisor {
    config: Arc<GatewayConfig>,
    status: SupervisorStatus,
    status_tx: watch::Sender<SupervisorStatus>,
    initial_port: u16,
    transport: Option<Transport>,
    router: ResponseRouter,
    generation: u64,
    events_tx: EventSender,
    events_rx: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    start_waiters: Vec<oneshot::Sender<Result<(), GatewayError>>>,
    readiness_deadline: Option<Instant>,
    restart_at: Option<Instant>,
    saw_address_in_use: bool,
    failure: Option<GatewayError>,
}

impl Supervisor {
    pub fn new(
        config: Arc<GatewayConfig>,
        commands: mpsc::Receiver<Command>,
    ) -> (Self, watch::Receiver<SupervisorStatus>) {
        let status = SupervisorStatus::initial(config.port);
        let (status_tx, status_rx) = watch::channel(status.clone());
        let (events_tx, events_rx) = mpsc::channel(256);
        let supervisor = Self {
            initial_port: config.port,
            config,
            status,
            status_tx,
            transport: None,
            router: ResponseRouter::new(),
            generation: 0,
            events_tx,
            events_rx,
            commands,
            start_waiters: Vec::new(),
            readiness_deadline: None,
            restart_at: None,
            saw_address_in_use: false,
            failure: None,
        };
        (supervisor, status_rx)
    }

    /// Process commands, transport events, and timers until the client is
    /// dropped, then tear down.
    pub async fn run(mut self) {
        loop {
            let deadline = match (self.readiness_deadline, self.restart_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                () = sleep_until_opt(deadline) => self.handle_timer().await,
            }
        }

        self.stop().await;
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status.clone());
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.status.phase != phase {
            tracing::debug!("Supervisor {} -> {}", self.status.phase, phase);
        }
        self.status.phase = phase;
        self.publish();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { reply } => match self.status.phase {
                Phase::Idle => {
                    self.start_waiters.push(reply);
                    self.begin_starting().await;
                }
                Phase::Ready => {
                    let _ = reply.send(Ok(()));
                }
                Phase::Stopped => {
                    let err = self.failure.clone().unwrap_or(GatewayError::Stopped);
                    let _ = reply.send(Err(err));
                }
                Phase::Starting | Phase::Degraded | Phase::Restarting => {
                    self.start_waiters.push(reply);
                }
            },
            Command::Call { request, reply } => self.dispatch(request, reply).await,
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
        }
    }

    async fn dispatch(&mut self, request: JsonRpcRequest, reply: Completion) {
        match self.status.phase {
            Phase::Ready => {}
            Phase::Stopped => {
                let _ = reply.send(Err(GatewayError::Stopped));
                return;
            }
            phase => {
                if phase == Phase::Restarting
                    && self.config.mode == ConnectionMode::OwnedProcess
                    && self.restart_at.is_some()
                {
                    tracing::info!(
                        "Call '{}' arrived with no connection; restarting now",
                        request.method
                    );
                    self.restart_at = Some(Instant::now());
                }
                let _ = reply.send(Err(GatewayError::NoConnection));
                return;
            }
        }

        let id = request.id.clone();
        if !self.router.register(id.clone(), reply) {
            return;
        }

        let result = match self.transport.as_ref() {
            Some(transport) => transport.send(request),
            None => Err(GatewayError::NoConnection),
        };

        if let Err(e) = result {
            self.on_write_failed(&id, e).await;
        }
    }

    async fn on_write_failed(&mut self, id: &str, error: GatewayError) {
        tracing::warn!("Failed to send request {id}: {error}");
        self.router.fail(id, error);
        self.on_transport_closed(CloseCause::WriteFailed).await;
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        let current = self.transport.as_ref().map(Transport::generation);
        if current != Some(event.generation) {
            tracing::trace!("Ignoring event from retired transport {}", event.generation);
            return;
        }

        match event.kind {
            EventKind::Line(line) => match classify_line(&line) {
                Inbound::Response(response) => {
                    self.router.resolve(response);
                }
                Inbound::Message { method } => {
                    tracing::debug!("Ignoring '{method}' message from tool server");
                }
                Inbound::Diagnostic => self.inspect_diagnostic(&line),
            },
            EventKind::Diagnostic(line) => self.inspect_diagnostic(&line),
            EventKind::WriteFailed { id, error } => {
                self.on_write_failed(&id, GatewayError::BrokenPipe(error)).await;
            }
            EventKind::Closed(cause) => self.on_transport_closed(cause).await,
        }
    }

    fn inspect_diagnostic(&mut self, line: &str) {
        if self.config.debug {
            tracing::info!(target: "toolgate::server", "{line}");
        } else {
            tracing::debug!(target: "toolgate::server", "{line}");
        }

        if self.status.phase != Phase::Starting {
            return;
        }
        if is_address_in_use(line) {
            tracing::warn!(
                "Tool server reports port {} already in use",
                self.status.current_port
            );
            self.saw_address_in_use = true;
            return;
        }
        if !self.saw_address_in_use && is_readiness_line(line, &self.config.readiness_markers) {
            self.mark_ready();
        }
    }

    async fn handle_timer(&mut self) {
        let now = Instant::now();

        if self.readiness_deadline.is_some_and(|d| d <= now) {
            self.readiness_deadline = None;
            let alive = self.transport.as_mut().is_some_and(Transport::is_alive);
            if self.status.phase == Phase::Starting && alive && !self.saw_address_in_use {
                tracing::info!(
                    "No readiness signal within {}ms; assuming tool server is ready",
                    self.config.readiness_timeout_ms
                );
                self.mark_ready();
            }
        }

        if self.restart_at.is_some_and(|d| d <= now) {
            self.restart_at = None;
            if self.status.phase == Phase::Restarting {
                self.begin_starting().await;
            }
        }
    }

    async fn begin_starting(&mut self) {
        self.generation += 1;
        self.saw_address_in_use = false;
        self.status.is_ready = false;
        self.set_phase(Phase::Starting);

        let port = self.status.current_port;
        let created = match self.config.mode {
            ConnectionMode::OwnedProcess => Transport::spawn_process(
                &self.config,
                port,
                self.generation,
                self.events_tx.clone(),
            ),
            ConnectionMode::ExternalSocket => {
                Transport::connect_socket(
                    &self.config.host,
                    port,
                    self.config.readiness_timeout(),
                    self.generation,
                    self.events_tx.clone(),
                )
                .await
            }
        };

        match created {
            Ok(transport) => {
                tracing::info!("Started transport to {}", transport.label());
                self.transport = Some(transport);
                match self.config.mode {
                    ConnectionMode::OwnedProcess => {
                        self.readiness_deadline =
                            Some(Instant::now() + self.config.readiness_timeout());
                    }
                    ConnectionMode::ExternalSocket => self.mark_ready(),
                }
            }
            Err(e) => self.fail_permanently(e).await,
        }
    }

    fn mark_ready(&mut self) {
        self.readiness_deadline = None;
        self.status.is_ready = true;
        self.status.has_been_ready = true;
        self.set_phase(Phase::Ready);
        tracing::info!("Tool server ready on port {}", self.status.current_port);
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    async fn on_transport_closed(&mut self, cause: CloseCause) {
        if self.status.is_exiting {
            return;
        }

        let label = self
            .transport
            .as_ref()
            .map(|t| t.label().to_string())
            .unwrap_or_default();
        tracing::warn!("Tool server {label} {cause}");

        self.teardown(&GatewayError::Disconnected).await;

        let plan = plan_recovery(
            &self.config,
            &self.status,
            self.initial_port,
            &cause,
            self.saw_address_in_use,
        );

        match plan {
            Recovery::NextPort(port) => {
                tracing::warn!(
                    "Port {} unavailable; retrying on port {port}",
                    self.status.current_port
                );
                self.set_phase(Phase::Degraded);
                self.status.current_port = port;
                self.begin_starting().await;
            }
            Recovery::Restart { attempt } => {
                tracing::warn!(
                    "Restarting tool server in {}ms (attempt {attempt}/{})",
                    self.config.restart_backoff_ms,
                    self.config.max_restart_attempts
                );
                self.status.restart_attempts = attempt;
                self.status.is_ready = false;
                self.restart_at = Some(Instant::now() + self.config.restart_backoff());
                self.set_phase(Phase::Restarting);
            }
            Recovery::GiveUp(err) => self.fail_permanently(err).await,
        }
    }

    /// Retire the current transport and fail everything waiting on it.
    async fn teardown(&mut self, error: &GatewayError) {
        self.readiness_deadline = None;
        if let Some(transport) = self.transport.take() {
            transport.shutdown(self.config.shutdown_grace()).await;
        }
        self.router.drain_all(error);
    }

    async fn fail_permanently(&mut self, err: GatewayError) {
        tracing::error!("Giving up on tool server: {err}");
        self.restart_at = None;
        self.teardown(&err).await;
        self.status.is_ready = false;
        self.set_phase(Phase::Stopped);
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        self.failure = Some(err);
    }

    async fn stop(&mut self) {
        if self.status.phase == Phase::Stopped {
            return;
        }

        self.status.is_exiting = true;
        self.publish();
        self.restart_at = None;
        tracing::info!("Stopping tool server");

        self.teardown(&GatewayError::Stopped).await;
        self.status.is_ready = false;
        self.set_phase(Phase::Stopped);
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Err(GatewayError::Stopped));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_ports: u32, increment: u16, max_restarts: u32) -> GatewayConfig {
        GatewayConfig {
            port: 4000,
            max_port_attempts: max_ports,
            port_increment: increment,
            max_restart_attempts: max_restarts,
            ..GatewayConfig::process("server", vec![])
        }
    }

    fn status(port: u16, restarts: u32, ready: bool) -> SupervisorStatus {
        SupervisorStatus {
            phase: if ready { Phase::Ready } else { Phase::Starting },
            current_port: port,
            restart_attempts: restarts,
            is_ready: ready,
            has_been_ready: ready,
            is_exiting: false,
        }
    }

    fn exit(code: i32) -> CloseCause {
        CloseCause::Exited {
            code: Some(code),
            signal: None,
        }
    }

    #[test]
    fn startup_failure_moves_to_next_port() {
        let cfg = config(3, 2, 5);
        match plan_recovery(&cfg, &status(4000, 0, false), 4000, &exit(1), false) {
            Recovery::NextPort(p) => assert_eq!(p, 4002),
            other => panic!("Expected NextPort, got {other:?}"),
        }
    }

    #[test]
    fn port_budget_counts_ports_tried() {
        let cfg = config(3, 1, 5);
        // 4000 and 4001 tried; 4002 is the third and last.
        assert!(matches!(
            plan_recovery(&cfg, &status(4001, 0, false), 4000, &exit(1), false),
            Recovery::NextPort(4002)
        ));
        match plan_recovery(&cfg, &status(4002, 0, false), 4000, &exit(1), false) {
            Recovery::GiveUp(GatewayError::PortsExhausted {
                attempts,
                first_port,
                last_port,
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(first_port, 4000);
                assert_eq!(last_port, 4002);
            }
            other => panic!("Expected PortsExhausted, got {other:?}"),
        }
    }

    #[test]
    fn port_retry_does_not_touch_restart_budget() {
        // Restart budget already spent, port search still allowed.
        let cfg = config(5, 1, 0);
        assert!(matches!(
            plan_recovery(&cfg, &status(4000, 0, false), 4000, &exit(1), false),
            Recovery::NextPort(4001)
        ));
    }

    #[test]
    fn address_in_use_counts_as_conflict_even_on_clean_exit() {
        let cfg = config(3, 1, 3);
        assert!(matches!(
            plan_recovery(&cfg, &status(4000, 0, false), 4000, &exit(0), true),
            Recovery::NextPort(4001)
        ));
    }

    #[test]
    fn clean_exit_before_ready_is_fatal() {
        let cfg = config(3, 1, 3);
        assert!(matches!(
            plan_recovery(&cfg, &status(4000, 0, false), 4000, &exit(0), false),
            Recovery::GiveUp(GatewayError::ExitedBeforeReady { code: Some(0) })
        ));
    }

    #[test]
    fn port_overflow_gives_up() {
        let cfg = GatewayConfig {
            port: u16::MAX,
            ..config(10, 1, 3)
        };
        assert!(matches!(
            plan_recovery(&cfg, &status(u16::MAX, 0, false), u16::MAX, &exit(1), false),
            Recovery::GiveUp(GatewayError::PortsExhausted { .. })
        ));
    }

    #[test]
    fn exit_after_ready_restarts_until_budget_spent() {
        let cfg = config(3, 1, 2);
        assert!(matches!(
            plan_recovery(&cfg, &status(4000, 0, true), 4000, &exit(1), false),
            Recovery::Restart { attempt: 1 }
        ));
        assert!(matches!(
            plan_recovery(&cfg, &status(4000, 1, true), 4000, &exit(0), false),
            Recovery::Restart { attempt: 2 }
        ));
        assert!(matches!(
            plan_recovery(&cfg, &status(4000, 2, true), 4000, &exit(1), false),
            Recovery::GiveUp(GatewayError::RestartsExhausted { attempts: 2 })
        ));
    }

    #[test]
    fn exit_during_restart_stays_on_restart_budget() {
        let cfg = config(10, 1, 3);
        let restarting = SupervisorStatus {
            phase: Phase::Starting,
            is_ready: false,
            ..status(4000, 1, true)
        };
        assert!(matches!(
            plan_recovery(&cfg, &restarting, 4000, &exit(2), false),
            Recovery::Restart { attempt: 2 }
        ));

        let spent = SupervisorStatus {
            restart_attempts: 3,
            ..restarting
        };
        assert!(matches!(
            plan_recovery(&cfg, &spent, 4000, &exit(0), false),
            Recovery::GiveUp(GatewayError::RestartsExhausted { attempts: 3 })
        ));
    }

    #[test]
    fn write_failure_after_ready_restarts() {
        let cfg = config(3, 1, 1);
        assert!(matches!(
            plan_recovery(
                &cfg,
                &status(4000, 0, true),
                4000,
                &CloseCause::WriteFailed,
                false
            ),
            Recovery::Restart { attempt: 1 }
        ));
    }

    #[test]
    fn socket_close_is_not_recovered() {
        let cfg = GatewayConfig::socket("127.0.0.1", 4000);
        assert!(matches!(
            plan_recovery(&cfg, &status(4000, 0, true), 4000, &CloseCause::Eof, false),
            Recovery::GiveUp(GatewayError::ConnectionClosed)
        ));
    }

    #[test]
    fn readiness_markers_match_case_insensitively() {
        let markers = vec!["server running".to_string()];
        assert!(is_readiness_line("Twitter MCP Server running on stdio", &markers));
        assert!(!is_readiness_line("loading config", &markers));
        assert!(!is_readiness_line("anything", &[String::new()]));
    }

    #[test]
    fn timestamped_lines_count_as_readiness() {
        assert!(is_readiness_line("2024-05-01T10:00:00Z started", &[]));
        assert!(is_readiness_line("[2024-05-01 10:00:00] init done", &[]));
        assert!(!is_readiness_line("v2024-05-01", &[]));
        assert!(!is_readiness_line("2024-5-1", &[]));
    }

    #[test]
    fn address_in_use_detection() {
        assert!(is_address_in_use("Error: listen EADDRINUSE: :::3000"));
        assert!(is_address_in_use("bind: Address already in use"));
        assert!(!is_address_in_use("server running"));
    }
}
