use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use webterm_containers::{ContainerError, ContainerRecord, ContainerService};

use crate::config::BrokerConfig;
use crate::errors::BrokerError;
use crate::models::{Credentials, DisconnectReason, ServerEvent};
use crate::ssh::{self, ShellEvent, SshSettings, SshShell};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    CreatingContainer,
    Connecting,
    Connected,
    Ending,
}

/// Operations a channel (or the admin surface, or the supervisor) can ask
/// of a session. Processed strictly in order by the session's driver task.
#[derive(Debug)]
pub enum SessionCommand {
    Connect(Credentials),
    CreateContainer,
    Input(Vec<u8>),
    Resize {
        cols: u16,
        rows: u16,
        width: Option<u16>,
        height: Option<u16>,
    },
    /// User disconnect: SSH torn down, container kept for reconnect.
    Disconnect,
    /// Session destroyed and its container stopped.
    EndSession,
    /// Administrative teardown. `notice`, when set, is emitted as a
    /// `terminal:error` before the disconnect event.
    Teardown {
        reason: DisconnectReason,
        stop_container: bool,
        notice: Option<String>,
    },
}

/// Internal events: outcomes of spawned work and timer expiries. Each
/// carries the attempt counter it belongs to; the driver discards anything
/// stale, which is what keeps a late SSH-ready from ever surfacing after
/// its timer fired.
enum SessionEvent {
    ConnectOutcome {
        attempt: u64,
        result: Result<(SshShell, mpsc::UnboundedReceiver<ShellEvent>), BrokerError>,
    },
    ConnectTimeout {
        attempt: u64,
    },
    ContainerOutcome {
        attempt: u64,
        result: Result<ContainerRecord, BrokerError>,
    },
    ContainerReady {
        attempt: u64,
        record: ContainerRecord,
    },
}

#[derive(Clone, Debug)]
struct PeerInfo {
    host: String,
    port: u16,
    username: String,
}

struct SessionMeta {
    status: SessionStatus,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    last_activity: Instant,
    last_attempt: Option<Instant>,
    connecting_since: Option<Instant>,
    container_id: Option<String>,
    peer: Option<PeerInfo>,
}

/// Snapshot of a session the rest of the system may read without going
/// through the driver task. Critical sections are a few field reads.
pub struct SessionShared {
    meta: StdMutex<SessionMeta>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            meta: StdMutex::new(SessionMeta {
                status: SessionStatus::Idle,
                created_at: Utc::now(),
                connected_at: None,
                last_activity: Instant::now(),
                last_attempt: None,
                connecting_since: None,
                container_id: None,
                peer: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionMeta> {
        self.meta.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn container_id(&self) -> Option<String> {
        self.lock().container_id.clone()
    }

    pub fn idle(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    fn connecting_for(&self) -> Option<Duration> {
        let meta = self.lock();
        match meta.status {
            SessionStatus::Connecting => meta.connecting_since.map(|t| t.elapsed()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub socket_id: Uuid,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    pub idle_secs: u64,
}

/// Per-channel handle: the command mailbox plus the shared snapshot.
pub struct SessionHandle {
    pub socket_id: Uuid,
    commands: mpsc::UnboundedSender<SessionCommand>,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    pub shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn container_id(&self) -> Option<String> {
        self.shared.container_id()
    }

    /// The channel is live while its outbound drain task still exists.
    pub fn is_channel_live(&self) -> bool {
        !self.outbound.is_closed()
    }

    fn stats(&self) -> SessionStats {
        let meta = self.shared.lock();
        SessionStats {
            socket_id: self.socket_id,
            status: meta.status,
            host: meta.peer.as_ref().map(|p| p.host.clone()),
            port: meta.peer.as_ref().map(|p| p.port),
            username: meta.peer.as_ref().map(|p| p.username.clone()),
            container_id: meta.container_id.clone(),
            created_at: meta.created_at,
            connected_at: meta.connected_at,
            idle_secs: meta.last_activity.elapsed().as_secs(),
        }
    }
}

/// Results of one health sweep, for logging.
#[derive(Debug, Default)]
pub struct HealthSweep {
    pub dead_channels: usize,
    pub stuck_connecting: usize,
}

pub struct Broker {
    sessions: Arc<DashMap<Uuid, Arc<SessionHandle>>>,
    containers: Arc<dyn ContainerService>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(containers: Arc<dyn ContainerService>, config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: Arc::new(DashMap::new()),
            containers,
            config,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Create the session for a freshly upgraded channel and start its
    /// driver task. At most one session exists per socket id.
    pub fn register(
        &self,
        socket_id: Uuid,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> Arc<SessionHandle> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared::new());

        let handle = Arc::new(SessionHandle {
            socket_id,
            commands: command_tx,
            outbound: outbound.clone(),
            shared: shared.clone(),
        });

        if let Some(stale) = self.sessions.insert(socket_id, handle.clone()) {
            warn!(%socket_id, "replacing stale session for socket");
            stale.send(SessionCommand::Teardown {
                reason: DisconnectReason::ConnectionClosed,
                stop_container: false,
                notice: None,
            });
        }

        let driver = SessionDriver {
            socket_id,
            outbound,
            shared,
            containers: self.containers.clone(),
            config: self.config.clone(),
            sessions: self.sessions.clone(),
            events_tx: event_tx,
            attempt: 0,
            shell: None,
        };
        tokio::spawn(driver.run(command_rx, event_rx));

        info!(%socket_id, "session registered");
        handle
    }

    pub fn get(&self, socket_id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&socket_id).map(|entry| entry.value().clone())
    }

    pub fn command(&self, socket_id: Uuid, command: SessionCommand) -> bool {
        match self.get(socket_id) {
            Some(handle) => handle.send(command),
            None => false,
        }
    }

    /// Destroy a session because its channel went away. The container is
    /// preserved so the client can reconnect.
    pub fn destroy(&self, socket_id: Uuid, reason: DisconnectReason) -> bool {
        self.command(
            socket_id,
            SessionCommand::Teardown {
                reason,
                stop_container: false,
                notice: None,
            },
        )
    }

    /// Administrative end-session: destroys the session and its container.
    /// Returns whether a session existed and whether it had a container.
    pub fn end_session(&self, socket_id: Uuid) -> Option<bool> {
        let handle = self.get(socket_id)?;
        let had_container = handle.container_id().is_some();
        handle.send(SessionCommand::EndSession);
        Some(had_container)
    }

    /// Administrative force-disconnect; also stops the session's container.
    pub fn force_disconnect(&self, socket_id: Uuid) -> Option<bool> {
        let handle = self.get(socket_id)?;
        let had_container = handle.container_id().is_some();
        handle.send(SessionCommand::Teardown {
            reason: DisconnectReason::ForceDisconnect,
            stop_container: true,
            notice: None,
        });
        Some(had_container)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> Vec<SessionStats> {
        let mut stats: Vec<SessionStats> =
            self.sessions.iter().map(|entry| entry.value().stats()).collect();
        stats.sort_by_key(|s| s.created_at);
        stats
    }

    /// Container ids currently attached to live sessions.
    pub fn attached_container_ids(&self) -> HashSet<String> {
        self.sessions
            .iter()
            .filter_map(|entry| entry.value().container_id())
            .collect()
    }

    /// Idle-session sweep: sessions silent past `max_idle` are torn down
    /// with `idle_timeout`.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let mut reaped = 0;
        for entry in self.sessions.iter() {
            let handle = entry.value();
            if handle.shared.idle() > max_idle {
                handle.send(SessionCommand::Teardown {
                    reason: DisconnectReason::IdleTimeout,
                    stop_container: false,
                    notice: None,
                });
                reaped += 1;
            }
        }
        reaped
    }

    /// Health sweep: dead channels and sessions stuck in `Connecting`.
    /// Idle sessions are deliberately left alone here; the idle-session
    /// sweep owns that threshold, so an expired session always reports
    /// `idle_timeout` rather than whichever sweep's timer fired first.
    pub fn sweep_health(&self) -> HealthSweep {
        let mut sweep = HealthSweep::default();
        for entry in self.sessions.iter() {
            let handle = entry.value();

            if !handle.is_channel_live() {
                handle.send(SessionCommand::Teardown {
                    reason: DisconnectReason::ClientDisconnect,
                    stop_container: false,
                    notice: None,
                });
                sweep.dead_channels += 1;
                continue;
            }

            if let Some(connecting) = handle.shared.connecting_for() {
                if connecting > self.config.stuck_connecting_timeout {
                    handle.send(SessionCommand::Teardown {
                        reason: DisconnectReason::ConnectionEnded,
                        stop_container: false,
                        notice: Some("Connection timed out".to_string()),
                    });
                    sweep.stuck_connecting += 1;
                }
            }
        }
        sweep
    }

    /// Notify every channel and destroy every session.
    pub fn shutdown(&self) {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        for handle in handles {
            handle.send(SessionCommand::Teardown {
                reason: DisconnectReason::ServerShutdown,
                stop_container: false,
                notice: None,
            });
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

enum Wake {
    Cmd(Option<SessionCommand>),
    Ev(Option<SessionEvent>),
    Shell(Option<ShellEvent>),
}

/// One task per session owns the state machine; commands, spawned-work
/// outcomes, timers, and shell events all arrive through its mailboxes, so
/// state mutations are serialized without a lock being held anywhere slow.
struct SessionDriver {
    socket_id: Uuid,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    shared: Arc<SessionShared>,
    containers: Arc<dyn ContainerService>,
    config: BrokerConfig,
    sessions: Arc<DashMap<Uuid, Arc<SessionHandle>>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    attempt: u64,
    shell: Option<SshShell>,
}

async fn shell_recv(events: &mut Option<mpsc::UnboundedReceiver<ShellEvent>>) -> Option<ShellEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionDriver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let mut shell_events: Option<mpsc::UnboundedReceiver<ShellEvent>> = None;

        loop {
            let wake = tokio::select! {
                cmd = commands.recv() => Wake::Cmd(cmd),
                ev = events.recv() => Wake::Ev(ev),
                sev = shell_recv(&mut shell_events) => Wake::Shell(sev),
            };

            match wake {
                Wake::Cmd(None) => {
                    // Channel handle dropped without an explicit teardown.
                    self.teardown(DisconnectReason::ClientDisconnect, false, None, &mut shell_events)
                        .await;
                    break;
                }
                Wake::Cmd(Some(command)) => {
                    if let Flow::Stop = self.handle_command(command, &mut shell_events).await {
                        break;
                    }
                }
                Wake::Ev(None) => break,
                Wake::Ev(Some(event)) => self.handle_event(event, &mut shell_events).await,
                Wake::Shell(None) => {
                    shell_events = None;
                    self.on_shell_closed(&mut shell_events).await;
                }
                Wake::Shell(Some(event)) => self.handle_shell_event(event, &mut shell_events).await,
            }
        }

        self.sessions.remove(&self.socket_id);
        debug!(socket_id = %self.socket_id, "session driver finished");
    }

    fn emit(&self, event: ServerEvent) {
        // A dead channel drops events; it never takes the session down.
        let _ = self.outbound.send(event);
    }

    fn emit_error(&self, err: &BrokerError) {
        self.emit(ServerEvent::Error {
            message: err.to_string(),
        });
    }

    async fn handle_command(
        &mut self,
        command: SessionCommand,
        shell_events: &mut Option<mpsc::UnboundedReceiver<ShellEvent>>,
    ) -> Flow {
        match command {
            SessionCommand::Connect(credentials) => {
                self.on_connect(credentials);
                Flow::Continue
            }
            SessionCommand::CreateContainer => {
                self.on_create_container();
                Flow::Continue
            }
            SessionCommand::Input(data) => {
                self.on_input(data).await;
                Flow::Continue
            }
            SessionCommand::Resize {
                cols,
                rows,
                width,
                height,
            } => {
                if self.shared.status() == SessionStatus::Connected && cols > 0 && rows > 0 {
                    if let Some(shell) = &self.shell {
                        shell.resize(
                            u32::from(cols),
                            u32::from(rows),
                            u32::from(width.unwrap_or(0)),
                            u32::from(height.unwrap_or(0)),
                        );
                    }
                }
                Flow::Continue
            }
            SessionCommand::Disconnect => {
                self.on_user_disconnect(shell_events);
                Flow::Continue
            }
            SessionCommand::EndSession => {
                self.teardown(DisconnectReason::EndSession, true, None, shell_events)
                    .await;
                Flow::Stop
            }
            SessionCommand::Teardown {
                reason,
                stop_container,
                notice,
            } => {
                self.teardown(reason, stop_container, notice, shell_events).await;
                Flow::Stop
            }
        }
    }

    fn on_connect(&mut self, credentials: Credentials) {
        let now = Instant::now();
        {
            let meta = self.shared.lock();
            if let Some(last) = meta.last_attempt {
                if now.duration_since(last) < self.config.min_connect_interval {
                    drop(meta);
                    self.emit_error(&BrokerError::RateLimited);
                    return;
                }
            }
            if meta.status != SessionStatus::Idle {
                drop(meta);
                self.emit_error(&BrokerError::Busy);
                return;
            }
        }

        let auth = match credentials.validate() {
            Ok(auth) => auth,
            Err(reason) => {
                self.emit_error(&BrokerError::Validation(reason));
                return;
            }
        };

        self.start_connect(credentials, auth);
    }

    /// Kick off the SSH attempt and its wall-clock timer. Both report back
    /// through the event mailbox stamped with this attempt's id.
    fn start_connect(&mut self, credentials: Credentials, auth: crate::models::AuthMethod) {
        self.attempt += 1;
        let attempt = self.attempt;

        {
            let mut meta = self.shared.lock();
            meta.status = SessionStatus::Connecting;
            meta.connecting_since = Some(Instant::now());
            meta.last_attempt = Some(Instant::now());
            meta.peer = Some(PeerInfo {
                host: credentials.host.clone(),
                port: credentials.port,
                username: credentials.username.clone(),
            });
        }

        let settings = SshSettings {
            ready_timeout: self.config.connect_timeout,
            keepalive: self.config.ssh_keepalive,
            keepalive_max_miss: self.config.ssh_keepalive_max_miss,
            host_verification: self.config.host_verification,
        };

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = ssh::open_shell(&credentials, auth, &settings).await;
            let _ = events.send(SessionEvent::ConnectOutcome { attempt, result });
        });

        let events = self.events_tx.clone();
        let deadline = self.config.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = events.send(SessionEvent::ConnectTimeout { attempt });
        });
    }

    fn on_create_container(&mut self) {
        {
            let mut meta = self.shared.lock();
            if meta.status != SessionStatus::Idle {
                drop(meta);
                self.emit_error(&BrokerError::Busy);
                return;
            }
            meta.status = SessionStatus::CreatingContainer;
            meta.last_attempt = Some(Instant::now());
        }

        self.emit(ServerEvent::ContainerCreating {
            message: "Creating container...".to_string(),
        });

        self.attempt += 1;
        let attempt = self.attempt;
        let containers = self.containers.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = containers.create().await.map_err(|err| match err {
                ContainerError::Create(detail) => BrokerError::ContainerCreate(detail),
                other => BrokerError::ContainerCreate(other.to_string()),
            });
            let _ = events.send(SessionEvent::ContainerOutcome { attempt, result });
        });
    }

    async fn on_input(&mut self, data: Vec<u8>) {
        let container_id = {
            let mut meta = self.shared.lock();
            if meta.status != SessionStatus::Connected {
                return; // pre-ready and post-close input is dropped
            }
            meta.last_activity = Instant::now();
            meta.container_id.clone()
        };

        if let Some(shell) = &self.shell {
            shell.write(data);
        }
        if let Some(container_id) = container_id {
            self.containers.touch(&container_id).await;
        }
    }

    async fn handle_event(
        &mut self,
        event: SessionEvent,
        shell_events: &mut Option<mpsc::UnboundedReceiver<ShellEvent>>,
    ) {
        match event {
            SessionEvent::ConnectOutcome { attempt, result } => {
                let current = attempt == self.attempt
                    && self.shared.status() == SessionStatus::Connecting;
                if !current {
                    // Late arrival: the timer fired or the user moved on.
                    // The transport never surfaces; close it and move on.
                    if let Ok((shell, _events)) = result {
                        shell.close();
                    }
                    return;
                }

                match result {
                    Ok((shell, events)) => {
                        self.shell = Some(shell);
                        *shell_events = Some(events);
                        let (peer, container_id) = {
                            let mut meta = self.shared.lock();
                            meta.status = SessionStatus::Connected;
                            meta.connected_at = Some(Utc::now());
                            meta.connecting_since = None;
                            meta.last_activity = Instant::now();
                            (meta.peer.clone(), meta.container_id.clone())
                        };
                        let peer = peer.expect("peer recorded when connecting");
                        info!(socket_id = %self.socket_id, host = %peer.host, port = peer.port, "ssh session ready");
                        self.emit(ServerEvent::Connected {
                            host: peer.host,
                            port: peer.port,
                            username: peer.username,
                            container_id,
                        });
                    }
                    Err(err) => {
                        warn!(socket_id = %self.socket_id, %err, "ssh connect failed");
                        self.emit_error(&err);
                        let mut meta = self.shared.lock();
                        meta.status = SessionStatus::Idle;
                        meta.connecting_since = None;
                    }
                }
            }
            SessionEvent::ConnectTimeout { attempt } => {
                let expired = attempt == self.attempt
                    && self.shared.status() == SessionStatus::Connecting;
                if expired {
                    self.emit_error(&BrokerError::Timeout);
                    let mut meta = self.shared.lock();
                    meta.status = SessionStatus::Idle;
                    meta.connecting_since = None;
                }
            }
            SessionEvent::ContainerOutcome { attempt, result } => {
                let current = attempt == self.attempt
                    && self.shared.status() == SessionStatus::CreatingContainer;
                if !current {
                    if let Ok(record) = result {
                        // Session moved on while the container was starting;
                        // don't leak it.
                        let containers = self.containers.clone();
                        tokio::spawn(async move {
                            let _ = containers.stop(&record.container_id).await;
                        });
                    }
                    return;
                }

                match result {
                    Ok(record) => {
                        {
                            let mut meta = self.shared.lock();
                            meta.container_id = Some(record.container_id.clone());
                        }
                        self.emit(ServerEvent::ContainerCreated(record.clone()));

                        // Give sshd inside the fresh container a moment
                        // before dialing in.
                        let grace = self.config.container_ready_grace;
                        let events = self.events_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            let _ = events.send(SessionEvent::ContainerReady { attempt, record });
                        });
                    }
                    Err(err) => {
                        self.emit_error(&err);
                        let mut meta = self.shared.lock();
                        meta.status = SessionStatus::Idle;
                    }
                }
            }
            SessionEvent::ContainerReady { attempt, record } => {
                let current = attempt == self.attempt
                    && self.shared.status() == SessionStatus::CreatingContainer;
                if !current {
                    return;
                }
                let credentials = Credentials::for_container(&record);
                match credentials.validate() {
                    Ok(auth) => {
                        {
                            // CreatingContainer -> Connecting goes through
                            // Idle so start_connect sees a clean slate.
                            let mut meta = self.shared.lock();
                            meta.status = SessionStatus::Idle;
                        }
                        self.start_connect(credentials, auth);
                    }
                    Err(reason) => {
                        self.emit_error(&BrokerError::Validation(reason));
                        let mut meta = self.shared.lock();
                        meta.status = SessionStatus::Idle;
                    }
                }
            }
        }
    }

    async fn handle_shell_event(
        &mut self,
        event: ShellEvent,
        shell_events: &mut Option<mpsc::UnboundedReceiver<ShellEvent>>,
    ) {
        match event {
            ShellEvent::Output(data) => {
                let container_id = {
                    let mut meta = self.shared.lock();
                    if meta.status != SessionStatus::Connected {
                        return;
                    }
                    meta.last_activity = Instant::now();
                    meta.container_id.clone()
                };
                self.emit(ServerEvent::Output { data });
                if let Some(container_id) = container_id {
                    self.containers.touch(&container_id).await;
                }
            }
            ShellEvent::Closed { exit_code } => {
                debug!(socket_id = %self.socket_id, ?exit_code, "shell stream closed");
                self.on_shell_closed(shell_events).await;
            }
            ShellEvent::Error(detail) => {
                self.emit_error(&BrokerError::Stream(detail));
                self.close_shell(shell_events);
                let was_connected = {
                    let mut meta = self.shared.lock();
                    let was = meta.status == SessionStatus::Connected;
                    meta.status = SessionStatus::Idle;
                    meta.connected_at = None;
                    was
                };
                if was_connected {
                    self.emit(ServerEvent::Disconnected {
                        reason: DisconnectReason::StreamClosed,
                    });
                }
            }
        }
    }

    async fn on_shell_closed(
        &mut self,
        shell_events: &mut Option<mpsc::UnboundedReceiver<ShellEvent>>,
    ) {
        self.close_shell(shell_events);
        let was_connected = {
            let mut meta = self.shared.lock();
            let was = meta.status == SessionStatus::Connected;
            if was {
                meta.status = SessionStatus::Idle;
                meta.connected_at = None;
            }
            was
        };
        if was_connected {
            self.emit(ServerEvent::Disconnected {
                reason: DisconnectReason::ConnectionClosed,
            });
        }
    }

    /// User-initiated disconnect: the transport goes away, the container
    /// and its id stay so a later `connect` can reattach.
    fn on_user_disconnect(
        &mut self,
        shell_events: &mut Option<mpsc::UnboundedReceiver<ShellEvent>>,
    ) {
        {
            let mut meta = self.shared.lock();
            meta.status = SessionStatus::Ending;
        }
        self.close_shell(shell_events);
        {
            let mut meta = self.shared.lock();
            meta.status = SessionStatus::Idle;
            meta.connected_at = None;
            meta.connecting_since = None;
            meta.last_activity = Instant::now();
        }
        self.emit(ServerEvent::Disconnected {
            reason: DisconnectReason::UserDisconnect,
        });
    }

    async fn teardown(
        &mut self,
        reason: DisconnectReason,
        stop_container: bool,
        notice: Option<String>,
        shell_events: &mut Option<mpsc::UnboundedReceiver<ShellEvent>>,
    ) {
        if let Some(message) = notice {
            self.emit(ServerEvent::Error { message });
        }
        self.close_shell(shell_events);
        {
            let mut meta = self.shared.lock();
            meta.status = SessionStatus::Ending;
        }
        self.emit(ServerEvent::Disconnected { reason });

        if stop_container {
            if let Some(container_id) = self.shared.container_id() {
                if let Err(err) = self.containers.stop(&container_id).await {
                    warn!(%container_id, %err, "failed to stop container during teardown");
                }
            }
        }
        info!(socket_id = %self.socket_id, ?reason, "session torn down");
    }

    /// Exit-path hygiene: the transport is closed exactly once and its
    /// event stream detached, regardless of which path got here first.
    fn close_shell(&mut self, shell_events: &mut Option<mpsc::UnboundedReceiver<ShellEvent>>) {
        if let Some(shell) = self.shell.take() {
            shell.close();
        }
        *shell_events = None;
    }
}
