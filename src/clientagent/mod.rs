//! Client agent: the public-facing gateway.
//!
//! Terminates untrusted client connections, enforces authentication, and
//! translates between the external client protocol and the internal bus.
//! Every session owns at least one channel from the agent's pool; the
//! agent routes internal datagrams to sessions by destination channel.

mod accounts;
mod interest;
mod names;
mod operations;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use otp_proto::{Channel, DatagramIter};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::allocator::IdAllocator;
use crate::config::AgentConfig;
use crate::dclass::Catalog;
use crate::network::MdLink;
use crate::zones::VisibilityProvider;

use accounts::TokenStore;
use names::NameDictionary;
use session::{Session, SessionEvent};

/// State shared by every session of one agent process.
pub struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) vis: Arc<dyn VisibilityProvider>,
    pub(crate) link: MdLink,
    /// channel → session inbox; doubles as the friend-online presence map.
    pub(crate) sessions: DashMap<Channel, mpsc::UnboundedSender<SessionEvent>>,
    pub(crate) channels: Mutex<IdAllocator>,
    pub(crate) tokens: Mutex<TokenStore>,
    pub(crate) names: NameDictionary,
    pub(crate) expected_hash: u32,
    pub(crate) started: Instant,
}

impl Agent {
    /// Whether a channel currently has a live session handler.
    pub(crate) fn is_online(&self, channel: Channel) -> bool {
        self.sessions.contains_key(&channel)
    }
}

/// Connect to the director, bind the external endpoint, and spawn the
/// accept and dispatch loops. Returns the bound external address.
pub async fn start(
    config: AgentConfig,
    catalog: Arc<Catalog>,
    vis: Arc<dyn VisibilityProvider>,
) -> anyhow::Result<SocketAddr> {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let link = MdLink::connect(config.connect_address, inbox_tx).await?;
    link.register_channel(config.channel);

    let tokens = TokenStore::open(&config.dbm_filename)?;
    let names = NameDictionary::load(config.name_parts_file.as_deref().map(std::path::Path::new));
    let expected_hash =
        if config.hash_val != 0 { config.hash_val } else { catalog.hash() };
    let channels = Mutex::new(IdAllocator::new(config.min_channels, config.max_channels));

    let listener = TcpListener::bind(config.address).await?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "Client agent listening");

    let agent = Arc::new(Agent {
        config,
        catalog,
        vis,
        link,
        sessions: DashMap::new(),
        channels,
        tokens: Mutex::new(tokens),
        names,
        expected_hash,
        started: Instant::now(),
    });

    spawn_dispatch(Arc::clone(&agent), inbox_rx);
    spawn_accept(agent, listener);
    Ok(local_addr)
}

/// Route internal datagrams to sessions by destination channel.
fn spawn_dispatch(agent: Arc<Agent>, mut inbox: mpsc::UnboundedReceiver<Bytes>) {
    tokio::spawn(async move {
        while let Some(frame) = inbox.recv().await {
            let mut it = DatagramIter::new(&frame);
            let dst = (|| -> otp_proto::Result<Channel> {
                let _ = it.read_u8()?;
                it.read_u64()
            })();
            let dst = match dst {
                Ok(dst) => dst,
                Err(e) => {
                    warn!(error = %e, "Dropping unparseable internal frame");
                    continue;
                }
            };

            match agent.sessions.get(&dst) {
                Some(tx) => {
                    let _ = tx.send(SessionEvent::Internal(frame));
                }
                None => debug!(dst, "Internal message for unknown channel"),
            }
        }
        info!("Client agent dispatch loop ended");
    });
}

fn spawn_accept(agent: Arc<Agent>, listener: TcpListener) {
    tokio::spawn(async move {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Failed to accept client connection");
                    continue;
                }
            };

            let Some(allocated) = agent.channels.lock().allocate() else {
                warn!(%addr, "Channel pool exhausted, refusing connection");
                continue;
            };
            debug!(%addr, channel = allocated, "Client connection accepted");

            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                let (session, events_rx) = Session::new(agent, allocated);
                session.run(stream, events_rx).await;
            });
        }
    });
}

#[cfg(test)]
mod tests;
