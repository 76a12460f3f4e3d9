use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::key;
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use russh_keys::decode_secret_key;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HostVerification;
use crate::errors::BrokerError;
use crate::models::{AuthMethod, Credentials};

pub const PTY_TERM: &str = "xterm-256color";
pub const PTY_COLS: u32 = 80;
pub const PTY_ROWS: u32 = 24;
pub const PTY_PIXEL_WIDTH: u32 = 640;
pub const PTY_PIXEL_HEIGHT: u32 = 480;

/// The fixed mode table sent with every PTY request.
pub fn pty_modes() -> Vec<(Pty, u32)> {
    vec![
        (Pty::VINTR, 0),
        (Pty::VQUIT, 0),
        (Pty::VERASE, 0),
        (Pty::VKILL, 0),
        (Pty::VEOF, 0),
        (Pty::VEOL, 0),
        (Pty::VEOL2, 0),
        (Pty::VSTART, 0),
        (Pty::VSTOP, 0),
        (Pty::VSUSP, 1),
        (Pty::VDSUSP, 0),
        (Pty::IGNPAR, 0),
        (Pty::PARMRK, 1),
        (Pty::INPCK, 0),
        (Pty::ISTRIP, 1),
        (Pty::INLCR, 1),
        (Pty::IGNCR, 0),
        (Pty::ICRNL, 1),
        (Pty::IUCLC, 0),
        (Pty::IXON, 1),
        (Pty::IXANY, 0),
        (Pty::IXOFF, 1),
        (Pty::IMAXBEL, 0),
        (Pty::ISIG, 1),
        (Pty::ICANON, 1),
        (Pty::XCASE, 0),
        (Pty::ECHO, 1),
        (Pty::ECHOE, 1),
        (Pty::ECHOK, 1),
        (Pty::ECHONL, 1),
        (Pty::NOFLSH, 0),
        (Pty::TOSTOP, 1),
        (Pty::IEXTEN, 1),
        (Pty::ECHOCTL, 1),
        (Pty::ECHOKE, 1),
        (Pty::PENDIN, 1),
        (Pty::OPOST, 1),
        (Pty::OLCUC, 0),
        (Pty::ONLCR, 1),
        (Pty::OCRNL, 0),
        (Pty::ONOCR, 0),
        (Pty::ONLRET, 0),
        (Pty::TTY_OP_ISPEED, 19200),
        (Pty::TTY_OP_OSPEED, 19200),
    ]
}

/// Transport timing knobs, lifted out of [`crate::config::BrokerConfig`].
#[derive(Clone, Debug)]
pub struct SshSettings {
    pub ready_timeout: Duration,
    pub keepalive: Duration,
    pub keepalive_max_miss: usize,
    pub host_verification: HostVerification,
}

struct ClientHandler {
    verification: HostVerification,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // AcceptAny is the (documented unsafe) default for local container
        // sessions; the host key changes on every container rebuild.
        Ok(matches!(self.verification, HostVerification::AcceptAny))
    }
}

/// Events flowing out of the shell's reader task.
#[derive(Debug)]
pub enum ShellEvent {
    Output(Vec<u8>),
    Closed { exit_code: Option<u32> },
    Error(String),
}

enum ShellCommand {
    Data(Vec<u8>),
    Resize {
        cols: u32,
        rows: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Close,
}

/// Handle to a live PTY shell. Cheap to clone the pieces it hands out;
/// writes after `close()` are dropped silently.
pub struct SshShell {
    commands: mpsc::UnboundedSender<ShellCommand>,
    closed: CancellationToken,
}

impl SshShell {
    pub fn write(&self, data: Vec<u8>) {
        if self.closed.is_cancelled() {
            return;
        }
        let _ = self.commands.send(ShellCommand::Data(data));
    }

    pub fn resize(&self, cols: u32, rows: u32, pix_width: u32, pix_height: u32) {
        if self.closed.is_cancelled() {
            return;
        }
        let _ = self.commands.send(ShellCommand::Resize {
            cols,
            rows,
            pix_width,
            pix_height,
        });
    }

    /// Idempotent: the first call tears the channel and transport down,
    /// later calls are no-ops.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let _ = self.commands.send(ShellCommand::Close);
    }
}

impl Drop for SshShell {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect, authenticate, and open an interactive PTY shell. Resolves with
/// the write handle plus the receiver the shell's output and close events
/// arrive on.
pub async fn open_shell(
    credentials: &Credentials,
    auth: AuthMethod,
    settings: &SshSettings,
) -> Result<(SshShell, mpsc::UnboundedReceiver<ShellEvent>), BrokerError> {
    let config = Arc::new(client::Config {
        keepalive_interval: Some(settings.keepalive),
        keepalive_max: settings.keepalive_max_miss,
        ..client::Config::default()
    });
    let handler = ClientHandler {
        verification: settings.host_verification,
    };

    let addr = (credentials.host.as_str(), credentials.port);
    let mut session = timeout(settings.ready_timeout, client::connect(config, addr, handler))
        .await
        .map_err(|_| BrokerError::Timeout)?
        .map_err(classify)?;

    let authenticated = match auth {
        AuthMethod::Password(password) => session
            .authenticate_password(&credentials.username, &password)
            .await
            .map_err(classify)?,
        AuthMethod::Key {
            private_key,
            passphrase,
        } => {
            let key = decode_secret_key(&private_key, passphrase.as_deref()).map_err(|_| {
                BrokerError::Validation("Invalid private key or passphrase".to_string())
            })?;
            session
                .authenticate_publickey(&credentials.username, Arc::new(key))
                .await
                .map_err(classify)?
        }
    };
    if !authenticated {
        let _ = session
            .disconnect(Disconnect::ByApplication, "authentication failed", "en")
            .await;
        return Err(BrokerError::Auth);
    }

    let mut channel = session.channel_open_session().await.map_err(classify)?;
    channel
        .request_pty(
            true,
            PTY_TERM,
            PTY_COLS,
            PTY_ROWS,
            PTY_PIXEL_WIDTH,
            PTY_PIXEL_HEIGHT,
            &pty_modes(),
        )
        .await
        .map_err(|err| BrokerError::Shell(err.to_string()))?;
    channel
        .request_shell(true)
        .await
        .map_err(|err| BrokerError::Shell(err.to_string()))?;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();

    tokio::spawn(shell_task(
        session,
        channel,
        command_rx,
        event_tx,
        closed.clone(),
    ));

    Ok((
        SshShell {
            commands: command_tx,
            closed,
        },
        event_rx,
    ))
}

enum Step {
    Msg(Option<ChannelMsg>),
    Cmd(Option<ShellCommand>),
    Stop,
}

/// Single owner of the channel and transport: remote messages and local
/// commands are interleaved here, and the transport is closed exactly once
/// on the way out.
async fn shell_task(
    session: Handle<ClientHandler>,
    mut channel: Channel<Msg>,
    mut commands: mpsc::UnboundedReceiver<ShellCommand>,
    events: mpsc::UnboundedSender<ShellEvent>,
    closed: CancellationToken,
) {
    let mut exit_code: Option<u32> = None;

    loop {
        let step = tokio::select! {
            _ = closed.cancelled() => Step::Stop,
            msg = channel.wait() => Step::Msg(msg),
            cmd = commands.recv() => Step::Cmd(cmd),
        };

        match step {
            Step::Stop | Step::Msg(None) | Step::Cmd(None) | Step::Cmd(Some(ShellCommand::Close)) => {
                break
            }
            Step::Msg(Some(ChannelMsg::Data { data })) => {
                let _ = events.send(ShellEvent::Output(data.to_vec()));
            }
            Step::Msg(Some(ChannelMsg::ExtendedData { data, .. })) => {
                let _ = events.send(ShellEvent::Output(data.to_vec()));
            }
            Step::Msg(Some(ChannelMsg::ExitStatus { exit_status })) => {
                exit_code = Some(exit_status);
            }
            Step::Msg(Some(ChannelMsg::Close)) => break,
            Step::Msg(Some(_)) => {}
            Step::Cmd(Some(ShellCommand::Data(bytes))) => {
                if let Err(err) = channel.data(&bytes[..]).await {
                    let _ = events.send(ShellEvent::Error(err.to_string()));
                    break;
                }
            }
            Step::Cmd(Some(ShellCommand::Resize {
                cols,
                rows,
                pix_width,
                pix_height,
            })) => {
                if let Err(err) = channel.window_change(cols, rows, pix_width, pix_height).await {
                    warn!(%err, "window change failed");
                }
            }
        }
    }

    let _ = channel.eof().await;
    let _ = session
        .disconnect(Disconnect::ByApplication, "session closed", "en")
        .await;
    debug!(?exit_code, "shell task finished");
    let _ = events.send(ShellEvent::Closed { exit_code });
}

/// Map transport failures onto the client-facing taxonomy.
pub fn classify(err: russh::Error) -> BrokerError {
    match err {
        russh::Error::IO(io) => classify_io(&io),
        other => {
            debug!(%other, "ssh protocol-level failure");
            BrokerError::Protocol
        }
    }
}

fn classify_io(err: &std::io::Error) -> BrokerError {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::ConnectionRefused => BrokerError::NetworkRefused,
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => BrokerError::HostUnreachable,
        ErrorKind::TimedOut => BrokerError::Timeout,
        _ => {
            let message = err.to_string();
            if message.contains("failed to lookup address")
                || message.contains("Name or service not known")
                || message.contains("nodename nor servname")
            {
                BrokerError::HostNotFound
            } else {
                BrokerError::HostUnreachable
            }
        }
    }
}
