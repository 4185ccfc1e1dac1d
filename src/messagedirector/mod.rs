//! Message director: the cluster's routing fabric.
//!
//! A TCP rendezvous that accepts any number of peers (client agent, state
//! server, database, AI processes). Peers bind channels with control
//! frames; every other frame names a destination channel and is forwarded
//! verbatim to whichever peer holds it. Forwarding is best-effort.

mod router;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use otp_proto::DatagramCodec;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

use crate::config::DirectorConfig;
use router::Router;

/// Outbound frames buffered per peer before the director starts dropping.
const PEER_OUTBOUND_CAPACITY: usize = 1024;

pub struct MessageDirector {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Arc<Mutex<Router>>,
    flush_period: Duration,
}

impl MessageDirector {
    /// Bind the rendezvous endpoint.
    pub async fn bind(config: &DirectorConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Message director listening");
        Ok(Self {
            listener,
            local_addr,
            router: Arc::new(Mutex::new(Router::new(config.queue_limit))),
            flush_period: config.flush_period(),
        })
    }

    /// The bound endpoint; useful when configured with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the accept loop and the flush task.
    pub fn start(self) {
        let router = Arc::clone(&self.router);
        let flush_period = self.flush_period;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                router.lock().flush();
            }
        });

        let router = self.router;
        let listener = self.listener;
        tokio::spawn(async move {
            let peer_ids = AtomicU64::new(1);
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "Failed to accept peer connection");
                        continue;
                    }
                };
                let peer = peer_ids.fetch_add(1, Ordering::Relaxed);
                debug!(peer, %addr, "Peer connected");

                let _ = stream.set_nodelay(true);
                let framed = Framed::new(stream, DatagramCodec::new());
                let (mut sink, mut source) = framed.split();

                let (tx, mut rx) = tokio::sync::mpsc::channel(PEER_OUTBOUND_CAPACITY);
                router.lock().add_peer(peer, tx);

                // Writer: drains the peer's outbound queue. A write error
                // ends the task; the reader (or flush) notices and cleans
                // up as if the peer had closed gracefully.
                tokio::spawn(async move {
                    while let Some(frame) = rx.recv().await {
                        if let Err(e) = sink.send(frame).await {
                            debug!(peer, error = %e, "Peer write failed");
                            break;
                        }
                    }
                });

                // Reader: every frame is handled to completion under the
                // router lock.
                let router = Arc::clone(&router);
                tokio::spawn(async move {
                    loop {
                        match source.next().await {
                            Some(Ok(frame)) => router.lock().handle_frame(peer, frame),
                            Some(Err(e)) => {
                                debug!(peer, error = %e, "Peer read failed");
                                break;
                            }
                            None => break,
                        }
                    }
                    debug!(peer, "Peer disconnected");
                    router.lock().disconnect(peer);
                });
            }
        });
    }
}
