//! Uplink from a service to the message director.
//!
//! Each of the client agent, state server, and database server opens one
//! TCP connection to the director and speaks framed datagrams over it.
//! Reads are pushed into the service's inbox; writes drain from an
//! unbounded queue in a dedicated task, so services never block on the
//! socket inside message handling.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use otp_proto::{msgtypes, Channel, Datagram, DatagramCodec};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// How long to keep retrying the initial connect. The director is usually
/// started by the same process a moment earlier.
const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// A live link to the message director.
#[derive(Clone)]
pub struct MdLink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl MdLink {
    /// Connect to the director, retrying briefly, and spawn the read and
    /// write halves. Every received frame body lands in `inbox`.
    pub async fn connect(
        addr: SocketAddr,
        inbox: mpsc::UnboundedSender<Bytes>,
    ) -> anyhow::Result<Self> {
        let mut last_err = None;
        let mut stream = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
            }
        }
        let stream = match stream {
            Some(s) => s,
            None => {
                return Err(anyhow::anyhow!(
                    "failed to reach message director at {}: {:?}",
                    addr,
                    last_err
                ));
            }
        };
        stream.set_nodelay(true)?;
        info!(%addr, "Connected to message director");

        let framed = Framed::new(stream, DatagramCodec::new());
        let (mut sink, mut source) = framed.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        // Write half: drain the outbound queue into the socket.
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, "Director link write failed");
                    break;
                }
            }
        });

        // Read half: push frames into the service inbox. Dropping the inbox
        // sender ends the service loop, which is how link loss surfaces.
        tokio::spawn(async move {
            loop {
                match source.next().await {
                    Some(Ok(frame)) => {
                        if inbox.send(frame).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Director link read failed");
                        break;
                    }
                    None => {
                        debug!("Director link closed");
                        break;
                    }
                }
            }
        });

        Ok(Self { tx })
    }

    /// A detached link whose outbound frames land in the returned
    /// receiver; lets service cores run without a director.
    #[cfg(test)]
    pub(crate) fn test_pair() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a datagram for the director. Best-effort: a dead link drops.
    pub fn send(&self, dg: Datagram) {
        let _ = self.tx.send(dg.freeze());
    }

    /// Bind a channel to this link.
    pub fn register_channel(&self, channel: Channel) {
        self.send(Datagram::control_header(msgtypes::CONTROL_SET_CHANNEL, channel));
    }

    /// Unbind a channel, replaying its post-removes at the director.
    pub fn unregister_channel(&self, channel: Channel) {
        self.send(Datagram::control_header(msgtypes::CONTROL_REMOVE_CHANNEL, channel));
    }

    /// Attach a pre-serialized datagram to `channel`, replayed when the
    /// channel is removed from routing.
    pub fn add_post_remove(&self, channel: Channel, inner: &Datagram) {
        let mut dg = Datagram::control_header(msgtypes::CONTROL_ADD_POST_REMOVE, channel);
        dg.add_raw(inner.as_bytes());
        self.send(dg);
    }

    /// Discard the post-remove queue of `channel`.
    pub fn clear_post_remove(&self, channel: Channel) {
        self.send(Datagram::control_header(msgtypes::CONTROL_CLEAR_POST_REMOVE, channel));
    }
}
