//! Datagram dispatch: one readiness loop drains the socket into a bounded queue; a fixed
//! pool of workers runs the handler and performs the sends it asks for.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use m4t_core::OutboundAction;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::shutdown::Shutdown;

/// Host-driven handler called by the workers.
pub trait DatagramHandler: Send + Sync + 'static {
    fn on_datagram(&self, from: SocketAddr, bytes: &[u8]) -> Vec<OutboundAction>;

    /// Every action except `SendTo`, which the worker performs itself.
    fn deliver(&self, action: OutboundAction);
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    pub workers: usize,
    pub queue_depth: usize,
    /// Receive buffer per datagram; longer datagrams are cut.
    pub buffer_size: usize,
}

struct Job {
    from: SocketAddr,
    bytes: Vec<u8>,
}

pub struct Dispatcher<H> {
    socket: Arc<UdpSocket>,
    handler: Arc<H>,
    options: DispatchOptions,
}

impl<H: DatagramHandler> Dispatcher<H> {
    pub fn new(socket: Arc<UdpSocket>, handler: Arc<H>, options: DispatchOptions) -> Self {
        Self {
            socket,
            handler,
            options,
        }
    }

    /// Run until `shutdown` fires or the socket fails while running. Workers drain the queue
    /// before this returns.
    pub async fn run(self, shutdown: Shutdown) -> io::Result<()> {
        let (tx, rx) = mpsc::channel(self.options.queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers: Vec<_> = (0..self.options.workers.max(1))
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    rx.clone(),
                    self.socket.clone(),
                    self.handler.clone(),
                ))
            })
            .collect();

        let result = self.read_loop(&tx, &shutdown).await;
        drop(tx);
        for w in workers {
            let _ = w.await;
        }
        result
    }

    async fn read_loop(&self, tx: &mpsc::Sender<Job>, shutdown: &Shutdown) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                ready = self.socket.readable() => ready?,
            }
            let mut buf = vec![0u8; self.options.buffer_size];
            match self.socket.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    buf.truncate(n);
                    match tx.try_send(Job { from, bytes: buf }) {
                        Ok(()) => {}
                        Err(TrySendError::Full(job)) => {
                            warn!(from = %job.from, "worker queue full, dropping datagram")
                        }
                        Err(TrySendError::Closed(_)) => return Ok(()),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if is_per_datagram(&e) => {
                    debug!(error = %e, "ignoring receive error from an unreachable peer");
                    continue;
                }
                Err(_) if !shutdown.is_running() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

/// ICMP unreachable from a departed peer; Windows reports it on the next receive.
fn is_per_datagram(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

async fn worker<H: DatagramHandler>(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    socket: Arc<UdpSocket>,
    handler: Arc<H>,
) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else { break };
        for action in handler.on_datagram(job.from, &job.bytes) {
            match action {
                OutboundAction::SendTo(to, bytes) => {
                    if let Err(e) = socket.send_to(&bytes, to).await {
                        warn!(%to, error = %e, "send failed");
                    }
                }
                other => handler.deliver(other),
            }
        }
    }
    debug!(worker = id, "worker exiting");
}
