//! Test actors: a game client speaking the external protocol and an AI
//! peer speaking the internal protocol straight to the director.

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use otp_proto::{msgtypes, Channel, Datagram, DatagramCodec, DatagramIter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::server::{TEST_HASH, TEST_VERSION};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A game client connected to the client agent.
pub struct TestClient {
    framed: Framed<TcpStream, DatagramCodec>,
}

impl TestClient {
    pub async fn connect(address: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Self { framed: Framed::new(stream, DatagramCodec::new()) })
    }

    pub async fn send(&mut self, dg: Datagram) -> anyhow::Result<()> {
        self.framed.send(dg.freeze()).await?;
        Ok(())
    }

    /// Next message, as (type, payload).
    pub async fn recv(&mut self) -> anyhow::Result<(u16, Vec<u8>)> {
        let frame = timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for a message"))?
            .ok_or_else(|| anyhow::anyhow!("connection closed"))?
            .map_err(anyhow::Error::from)?;
        split_client_frame(&frame)
    }

    /// Read until a message of `msg_type` arrives, skipping others.
    pub async fn expect(&mut self, msg_type: u16) -> anyhow::Result<Vec<u8>> {
        loop {
            let (got, payload) = self.recv().await?;
            if got == msg_type {
                return Ok(payload);
            }
        }
    }

    /// Assert the connection yields no message of `msg_type` within a
    /// short grace window.
    pub async fn expect_silence(&mut self, msg_type: u16, window: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match timeout(remaining, self.framed.next()).await {
                Err(_) => return Ok(()),
                Ok(None) => return Ok(()),
                Ok(Some(frame)) => {
                    let (got, _) = split_client_frame(&frame?)?;
                    if got == msg_type {
                        anyhow::bail!("unexpected message type {got}");
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Protocol helpers
    // -------------------------------------------------------------------

    /// Log in and wait for the "All Ok" response.
    pub async fn login(&mut self, token: &str) -> anyhow::Result<()> {
        let mut dg = Datagram::client_header(msgtypes::CLIENT_LOGIN_2);
        dg.add_string(token);
        dg.add_string(TEST_VERSION);
        dg.add_u32(TEST_HASH);
        dg.add_i32(msgtypes::CLIENT_LOGIN_2_BLUE);
        self.send(dg).await?;

        let payload = self.expect(msgtypes::CLIENT_LOGIN_2_RESP).await?;
        let mut it = DatagramIter::new(&payload);
        anyhow::ensure!(it.read_u8()? == 0, "login refused");
        anyhow::ensure!(it.read_string()? == "All Ok");
        anyhow::ensure!(it.read_string()? == token);
        Ok(())
    }

    /// Create an avatar in `slot`, returning its doId.
    pub async fn create_avatar(&mut self, dna: &str, slot: u8) -> anyhow::Result<u32> {
        let mut dg = Datagram::client_header(msgtypes::CLIENT_CREATE_AVATAR);
        dg.add_u16(77);
        dg.add_string(dna);
        dg.add_u8(slot);
        self.send(dg).await?;

        let payload = self.expect(msgtypes::CLIENT_CREATE_AVATAR_RESP).await?;
        let mut it = DatagramIter::new(&payload);
        anyhow::ensure!(it.read_u16()? == 77, "echo context mismatch");
        anyhow::ensure!(it.read_u8()? == 0, "avatar creation refused");
        Ok(it.read_u32()?)
    }

    /// Activate an avatar and wait for its owner generate.
    pub async fn set_avatar(&mut self, do_id: u32) -> anyhow::Result<()> {
        let mut dg = Datagram::client_header(msgtypes::CLIENT_SET_AVATAR);
        dg.add_u32(do_id);
        self.send(dg).await?;

        let created = self.expect_create_object(do_id).await?;
        anyhow::ensure!(created == do_id);
        Ok(())
    }

    /// Bind the avatar to a shard and wait for the state reply.
    pub async fn set_shard(&mut self, shard: u32) -> anyhow::Result<()> {
        let mut dg = Datagram::client_header(msgtypes::CLIENT_SET_SHARD);
        dg.add_u32(shard);
        self.send(dg).await?;
        self.expect(msgtypes::CLIENT_GET_STATE_RESP).await?;
        Ok(())
    }

    pub async fn send_set_zone(&mut self, zone: u16) -> anyhow::Result<()> {
        let mut dg = Datagram::client_header(msgtypes::CLIENT_SET_ZONE);
        dg.add_u16(zone);
        self.send(dg).await
    }

    /// Wait for a generate of `do_id` (required or required+other).
    pub async fn expect_create_object(&mut self, do_id: u32) -> anyhow::Result<u32> {
        loop {
            let (got, payload) = self.recv().await?;
            if got != msgtypes::CLIENT_CREATE_OBJECT_REQUIRED
                && got != msgtypes::CLIENT_CREATE_OBJECT_REQUIRED_OTHER
            {
                continue;
            }
            let mut it = DatagramIter::new(&payload);
            let _class = it.read_u16()?;
            let created = it.read_u32()?;
            if created == do_id {
                return Ok(created);
            }
        }
    }

    /// Send a raw field update on an object.
    pub async fn send_field_update(
        &mut self,
        do_id: u32,
        field_number: u16,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let mut dg = Datagram::client_header(msgtypes::CLIENT_OBJECT_UPDATE_FIELD);
        dg.add_u32(do_id);
        dg.add_u16(field_number);
        dg.add_raw(payload);
        self.send(dg).await
    }
}

fn split_client_frame(frame: &Bytes) -> anyhow::Result<(u16, Vec<u8>)> {
    let mut it = DatagramIter::new(frame);
    let msg_type = it.read_u16()?;
    Ok((msg_type, it.take_remaining()))
}

/// An AI process on the internal bus: connects to the director and binds
/// a shard channel.
pub struct TestPeer {
    framed: Framed<TcpStream, DatagramCodec>,
    channel: Channel,
}

impl TestPeer {
    pub async fn connect(address: &str, channel: Channel) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let mut peer = Self { framed: Framed::new(stream, DatagramCodec::new()), channel };
        peer.send(Datagram::control_header(msgtypes::CONTROL_SET_CHANNEL, channel)).await?;
        Ok(peer)
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub async fn send(&mut self, dg: Datagram) -> anyhow::Result<()> {
        self.framed.send(dg.freeze()).await?;
        Ok(())
    }

    /// Register this shard with the state server.
    pub async fn add_shard(&mut self, district_id: u32, name: &str) -> anyhow::Result<()> {
        let mut dg = Datagram::server_header(
            otp_proto::STATE_SERVER_CHANNEL,
            self.channel,
            msgtypes::STATESERVER_ADD_SHARD,
        );
        dg.add_u32(district_id);
        dg.add_string(name);
        dg.add_u32(0);
        self.send(dg).await
    }

    /// Arrange for the shard to be torn down when this peer vanishes.
    pub async fn add_remove_shard_post_remove(&mut self) -> anyhow::Result<()> {
        let inner = Datagram::server_header(
            otp_proto::STATE_SERVER_CHANNEL,
            self.channel,
            msgtypes::STATESERVER_REMOVE_SHARD,
        );
        let mut dg = Datagram::control_header(msgtypes::CONTROL_ADD_POST_REMOVE, self.channel);
        dg.add_raw(inner.as_bytes());
        self.send(dg).await
    }

    /// Drop the connection, triggering post-remove replay.
    pub fn disconnect(self) {
        drop(self);
    }
}
