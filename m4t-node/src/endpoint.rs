//! Two-party endpoint: startup handshake, keep-alive, receive loop, outbound text and the
//! local dot-commands.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use m4t_core::core::RENAME_COMMAND;
use m4t_core::wire::CodecError;
use m4t_core::{IdentityToken, Notification, OutboundAction, PeerCore};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatcher::{DatagramHandler, DispatchOptions, Dispatcher};
use crate::frontend::Frontend;
use crate::shutdown::Shutdown;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("no valid operating port provided")]
    NoLocalPort,
    #[error("no valid target address and port provided")]
    NoPeerTarget,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StartupError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::NoLocalPort => 1,
            StartupError::NoPeerTarget => 2,
            StartupError::Codec(_) | StartupError::Io(_) => 3,
        }
    }
}

/// What the input loop should do after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    Exit,
}

struct PeerHandler {
    core: Arc<PeerCore>,
    frontend: Arc<dyn Frontend>,
}

impl DatagramHandler for PeerHandler {
    fn on_datagram(&self, from: SocketAddr, bytes: &[u8]) -> Vec<OutboundAction> {
        self.core.on_datagram(from, bytes)
    }

    fn deliver(&self, action: OutboundAction) {
        match action {
            OutboundAction::Display {
                message_id, text, ..
            } => self.frontend.on_message(message_id, &text),
            OutboundAction::Notify(n) => self.frontend.on_notification(&n),
            OutboundAction::SendTo(..) => {}
        }
    }
}

pub struct PeerEndpoint {
    core: Arc<PeerCore>,
    socket: Arc<UdpSocket>,
    frontend: Arc<dyn Frontend>,
    shutdown: Shutdown,
    keep_alive: JoinHandle<()>,
    receive: JoinHandle<io::Result<()>>,
}

impl PeerEndpoint {
    /// Bind (re-asking the front-end after a bind failure), resolve the target, greet it and
    /// start the keep-alive and receive tasks.
    pub async fn start(
        config: &Config,
        frontend: Arc<dyn Frontend>,
        identity: IdentityToken,
        shutdown: Shutdown,
    ) -> Result<Self, StartupError> {
        let codec = config.codec()?;
        let socket = loop {
            let port = frontend.local_port().ok_or(StartupError::NoLocalPort)?;
            match UdpSocket::bind((config.bind_address, port)).await {
                Ok(socket) => {
                    if port == 0 {
                        frontend.on_notification(&Notification::AutomaticPortAssignment {
                            port: socket.local_addr()?.port(),
                        });
                    }
                    break Arc::new(socket);
                }
                Err(e) => {
                    warn!(port, error = %e, "bind failed");
                    frontend.on_notification(&Notification::BindFailed {
                        port,
                        reason: e.to_string(),
                    });
                }
            }
        };

        let peer = frontend.peer_target().ok_or(StartupError::NoPeerTarget)?;
        let core = Arc::new(PeerCore::new(peer, codec, identity));
        info!(local = %socket.local_addr()?, %peer, identity = %core.identity(), "endpoint started");
        frontend.on_notification(&Notification::StartupNotice { peer });
        frontend.on_start();

        let salve = core.salve();
        if let Err(e) = socket.send_to(&salve.bytes, peer).await {
            warn!(%peer, error = %e, "failed to send greeting");
        }

        let keep_alive = tokio::spawn(keep_alive_loop(
            core.clone(),
            socket.clone(),
            config.keep_alive(),
            shutdown.clone(),
        ));
        let dispatcher = Dispatcher::new(
            socket.clone(),
            Arc::new(PeerHandler {
                core: core.clone(),
                frontend: frontend.clone(),
            }),
            DispatchOptions {
                workers: 1,
                queue_depth: config.queue_depth,
                buffer_size: codec.buffer_size(),
            },
        );
        let receive = tokio::spawn(receive_loop(dispatcher, frontend.clone(), shutdown.clone()));

        Ok(Self {
            core,
            socket,
            frontend,
            shutdown,
            keep_alive,
            receive,
        })
    }

    pub fn core(&self) -> &Arc<PeerCore> {
        &self.core
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send chat text to the peer, continuing in follow-up frames when it does not fit.
    pub async fn send(&self, text: &str) -> io::Result<()> {
        let peer = self.core.peer();
        for frame in self.core.outgoing(text) {
            self.socket.send_to(&frame.bytes, peer).await?;
            debug!(message_id = frame.message_id, %peer, "sent");
        }
        Ok(())
    }

    /// Handle one line of user input: a dot-command or chat text. `.NAME` is a hub command and
    /// goes on the wire as typed.
    pub async fn handle_line(&self, line: &str) -> io::Result<LineOutcome> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(LineOutcome::Continue);
        }
        if !trimmed.starts_with('.') {
            self.send(line).await?;
            return Ok(LineOutcome::Continue);
        }

        let command = trimmed.split_whitespace().next().unwrap_or(trimmed);
        if command.eq_ignore_ascii_case(RENAME_COMMAND) {
            self.send(trimmed).await?;
            return Ok(LineOutcome::Continue);
        }
        match command.to_ascii_uppercase().as_str() {
            ".EXIT" => return Ok(LineOutcome::Exit),
            ".PROGRAMSTATE" => self.frontend.on_notification(&Notification::PushText {
                text: self.core.describe(),
            }),
            ".SALVE" | ".POKE" => {
                let salve = self.core.salve();
                self.socket.send_to(&salve.bytes, self.core.peer()).await?;
            }
            _ => self
                .frontend
                .on_notification(&Notification::UnknownLocalCommand {
                    command: command.to_string(),
                }),
        }
        Ok(LineOutcome::Continue)
    }

    /// Stop every task and release the socket. Returns the receive loop's failure, if any.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.shutdown.trigger();
        let _ = self.keep_alive.await;
        let received = self.receive.await;
        self.frontend.on_shutdown();
        drop(self.socket);
        match received {
            Ok(result) => Ok(result?),
            Err(join) => Err(join.into()),
        }
    }
}

async fn keep_alive_loop(
    core: Arc<PeerCore>,
    socket: Arc<UdpSocket>,
    period: Duration,
    shutdown: Shutdown,
) {
    let mut tick = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tick.tick() => {
                let frame = core.keep_alive();
                if let Err(e) = socket.send_to(&frame.bytes, core.peer()).await {
                    debug!(peer = %core.peer(), error = %e, "keep-alive send failed");
                }
            }
        }
    }
}

/// A receive error while running is reported and ends the endpoint; after shutdown it is
/// expected.
async fn receive_loop(
    dispatcher: Dispatcher<PeerHandler>,
    frontend: Arc<dyn Frontend>,
    shutdown: Shutdown,
) -> io::Result<()> {
    let result = dispatcher.run(shutdown.clone()).await;
    if let Err(e) = &result {
        if shutdown.is_running() {
            error!(error = %e, "receive loop failed");
            frontend.on_notification(&Notification::ReceiveFailed {
                reason: e.to_string(),
            });
            shutdown.trigger();
        } else {
            return Ok(());
        }
    }
    result
}
