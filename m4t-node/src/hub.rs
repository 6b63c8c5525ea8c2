//! Relay hub: binds one socket, dispatches datagrams to `HubCore`, reaps idle sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use m4t_core::{HubCore, IdentityToken, Notification, OutboundAction, SessionRegistry};
use tokio::net::UdpSocket;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatcher::{DatagramHandler, DispatchOptions, Dispatcher};
use crate::shutdown::Shutdown;

struct HubHandler {
    core: HubCore,
}

impl DatagramHandler for HubHandler {
    fn on_datagram(&self, from: SocketAddr, bytes: &[u8]) -> Vec<OutboundAction> {
        self.core.on_datagram(from, bytes)
    }

    fn deliver(&self, action: OutboundAction) {
        if let OutboundAction::Notify(n) = action {
            log_notification(&n);
        }
    }
}

fn log_notification(n: &Notification) {
    match n {
        Notification::MalformedHandshake { .. }
        | Notification::MalformedHandshakeSession { .. }
        | Notification::AckMissingSeparator
        | Notification::AckMissingSessionOrContent { .. }
        | Notification::AckInvalidIdOrSession { .. } => debug!(topic = n.topic(), "{n}"),
        Notification::ReceiveFailed { .. } | Notification::BindFailed { .. } => {
            warn!(topic = n.topic(), "{n}")
        }
        _ => info!(topic = n.topic(), "{n}"),
    }
}

pub struct Hub {
    socket: Arc<UdpSocket>,
    handler: Arc<HubHandler>,
    registry: Arc<SessionRegistry>,
    options: DispatchOptions,
}

impl Hub {
    pub async fn bind(config: &Config, identity: IdentityToken) -> anyhow::Result<Self> {
        let codec = config.codec().context("invalid buffer size")?;
        let socket = UdpSocket::bind((config.bind_address, config.hub_port))
            .await
            .with_context(|| format!("binding hub port {}", config.hub_port))?;
        let local = socket.local_addr()?;
        if config.hub_port == 0 {
            log_notification(&Notification::AutomaticPortAssignment { port: local.port() });
        }
        info!(%local, identity = %identity, layout = ?codec.layout(), "hub listening");

        let registry = Arc::new(SessionRegistry::new(config.session_timeout()));
        let handler = Arc::new(HubHandler {
            core: HubCore::new(codec, identity, registry.clone()),
        });
        Ok(Self {
            socket: Arc::new(socket),
            handler,
            registry,
            options: DispatchOptions {
                workers: config.worker_count(),
                queue_depth: config.queue_depth,
                buffer_size: codec.buffer_size(),
            },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Serve until `shutdown` fires. A socket error while running stops the hub.
    pub async fn run(self, shutdown: Shutdown) -> anyhow::Result<()> {
        let reaper = tokio::spawn(reap_loop(self.registry.clone(), shutdown.clone()));
        let result = Dispatcher::new(self.socket, self.handler, self.options)
            .run(shutdown.clone())
            .await;
        if let Err(e) = &result {
            log_notification(&Notification::ReceiveFailed {
                reason: e.to_string(),
            });
        }
        shutdown.trigger();
        let _ = reaper.await;
        info!("hub stopped");
        result.context("hub receive loop failed")
    }
}

async fn reap_loop(registry: Arc<SessionRegistry>, shutdown: Shutdown) {
    let period = registry.timeout().max(Duration::from_millis(10));
    let mut tick = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tick.tick() => {
                for s in registry.reap() {
                    log_notification(&Notification::SessionExpired { addr: s.addr, name: s.name });
                }
            }
        }
    }
}
