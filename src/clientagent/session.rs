//! One client connection.
//!
//! A session runs in its own task, selecting over the client's framed
//! socket and an internal inbox fed by the agent's channel → session
//! routing table. All handling is synchronous; client-bound frames are
//! staged in an outbound queue the run loop drains after each event, and
//! internal frames go straight to the director link.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use otp_proto::{
    account_id_from_channel, avatar_id_from_channel, msgtypes, Channel, Datagram, DatagramCodec,
    DatagramIter,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use crate::error::{SessionError, SessionResult};
use crate::zones::{branch_zone, is_street, BranchVisibility, QUIET_ZONE};

use super::interest::InterestZones;
use super::operations::{DbRecord, OpEvent, OpOutcome, Operation};
use super::Agent;

/// Events delivered to a session besides its own socket.
pub enum SessionEvent {
    /// A routed internal datagram addressed to one of our channels.
    Internal(Bytes),
    /// The activation grace delay elapsed; grant ownership.
    ActivateOwner(u32),
    /// The interest handshake watchdog fired.
    InterestTimeout(u64),
}

/// What kind of location ack we are waiting on.
enum LocationAwait {
    Shard,
    Zone,
}

pub struct Session {
    pub(super) agent: Arc<Agent>,
    pub(super) allocated: Channel,
    /// Current sender identity; starts at the allocated channel, becomes
    /// the account channel after login and the avatar session channel
    /// after activation.
    pub(super) channel: Channel,
    registered: Vec<Channel>,
    pub(super) authenticated: bool,

    pub(super) interest: InterestZones,
    pub(super) seen: HashMap<u32, HashSet<u32>>,
    pub(super) owned: HashSet<u32>,
    pub(super) pending: HashSet<u32>,
    vis_cache: HashMap<u32, Option<BranchVisibility>>,

    pub(super) operation: Option<Operation>,
    next_ctx: u32,

    awaiting_location: Option<LocationAwait>,
    deferred_zone: Option<(u32, u32)>,
    timeout_gen: u64,

    events: mpsc::UnboundedSender<SessionEvent>,
    outbound: Vec<Bytes>,
    close_requested: bool,
}

impl Session {
    pub fn new(agent: Arc<Agent>, allocated: Channel) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            agent,
            allocated,
            channel: allocated,
            registered: Vec::new(),
            authenticated: false,
            interest: InterestZones::default(),
            seen: HashMap::new(),
            owned: HashSet::new(),
            pending: HashSet::new(),
            vis_cache: HashMap::new(),
            operation: None,
            next_ctx: 0,
            awaiting_location: None,
            deferred_zone: None,
            timeout_gen: 0,
            events,
            outbound: Vec::new(),
            close_requested: false,
        };
        (session, events_rx)
    }

    /// Run the session until the client goes away or is kicked.
    #[instrument(skip_all, fields(channel = self.allocated), name = "session")]
    pub async fn run(mut self, stream: TcpStream, mut events_rx: mpsc::UnboundedReceiver<SessionEvent>) {
        let _ = stream.set_nodelay(true);
        let framed = Framed::new(stream, DatagramCodec::new());
        let (mut sink, mut source) = framed.split();

        self.bind_channel(self.allocated);
        info!("Client connected");

        loop {
            tokio::select! {
                frame = source.next() => {
                    let close = match frame {
                        Some(Ok(frame)) => self.handle_client_frame(&frame),
                        Some(Err(e)) => {
                            warn!(error = %e, "Client read failed");
                            true
                        }
                        None => true,
                    };
                    if self.drain_outbound(&mut sink).await.is_err() || close {
                        break;
                    }
                }
                Some(event) = events_rx.recv() => {
                    let close = self.handle_event(event);
                    if self.drain_outbound(&mut sink).await.is_err() || close {
                        break;
                    }
                }
            }
        }

        self.teardown();
        info!("Client disconnected");
    }

    async fn drain_outbound(
        &mut self,
        sink: &mut (impl futures_util::Sink<Bytes, Error = otp_proto::ProtocolError> + Unpin),
    ) -> Result<(), ()> {
        for frame in self.outbound.drain(..) {
            if let Err(e) = sink.send(frame).await {
                warn!(error = %e, "Client write failed");
                return Err(());
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Plumbing shared with operations
    // -----------------------------------------------------------------------

    pub(super) fn send_client(&mut self, dg: Datagram) {
        self.outbound.push(dg.freeze());
    }

    pub(super) fn send_internal(&self, dg: Datagram) {
        self.agent.link.send(dg);
    }

    pub(super) fn take_outbound(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbound)
    }

    /// Subscribe an additional channel for this session.
    pub(super) fn bind_channel(&mut self, channel: Channel) {
        if self.registered.contains(&channel) {
            return;
        }
        self.agent.sessions.insert(channel, self.events.clone());
        self.agent.link.register_channel(channel);
        self.registered.push(channel);
    }

    fn unbind_channel(&mut self, channel: Channel) {
        self.agent.sessions.remove(&channel);
        self.agent.link.unregister_channel(channel);
        self.registered.retain(|c| *c != channel);
    }

    /// Move the session's sender identity, keeping the allocated channel
    /// subscribed for post-remove replay.
    pub(super) fn set_channel(&mut self, channel: Channel) {
        if channel == self.channel {
            return;
        }
        let old = self.channel;
        self.bind_channel(channel);
        if old != self.allocated {
            self.unbind_channel(old);
        }
        self.channel = channel;
    }

    pub(super) fn account_id(&self) -> u32 {
        account_id_from_channel(self.channel)
    }

    pub(super) fn avatar_id(&self) -> u32 {
        avatar_id_from_channel(self.channel)
    }

    pub(super) fn next_context(&mut self) -> u32 {
        self.next_ctx = self.next_ctx.wrapping_add(1);
        self.next_ctx
    }

    /// Query every field of a stored object; returns the context.
    pub(super) fn db_query(&mut self, do_id: u32) -> u32 {
        let ctx = self.next_context();
        let mut dg = Datagram::server_header(
            otp_proto::DATABASE_CHANNEL,
            self.channel,
            msgtypes::DBSERVER_OBJECT_GET_ALL,
        );
        dg.add_u32(ctx);
        dg.add_u32(do_id);
        self.send_internal(dg);
        ctx
    }

    /// Create an object with the given named fields; returns the context.
    pub(super) fn db_create(
        &mut self,
        class_name: &str,
        fields: &[(&str, crate::dclass::FieldValue)],
    ) -> Option<u32> {
        let catalog = self.agent.catalog.clone();
        let Some(class) = catalog.class_by_name(class_name) else {
            warn!(class_name, "Create against unknown class");
            return None;
        };

        let ctx = self.next_context();
        let mut dg = Datagram::server_header(
            otp_proto::DATABASE_CHANNEL,
            self.channel,
            msgtypes::DBSERVER_CREATE_OBJECT,
        );
        dg.add_u32(ctx);
        dg.add_u16(class.number);
        dg.add_u16(fields.len() as u16);
        for (name, value) in fields {
            let Some(field) = class.field_by_name(name) else {
                warn!(class_name, name, "Create names unknown field");
                return None;
            };
            dg.add_u16(field.number);
            match field.pack(std::slice::from_ref(value)) {
                Ok(packed) => dg.add_raw(&packed),
                Err(e) => {
                    warn!(name, error = %e, "Create field failed to pack");
                    return None;
                }
            }
        }
        self.send_internal(dg);
        Some(ctx)
    }

    /// Fire-and-forget single field write.
    pub(super) fn db_set_field(
        &mut self,
        do_id: u32,
        class_name: &str,
        field_name: &str,
        value: crate::dclass::FieldValue,
    ) {
        let catalog = self.agent.catalog.clone();
        let Some(field) =
            catalog.class_by_name(class_name).and_then(|c| c.field_by_name(field_name))
        else {
            warn!(class_name, field_name, "Set against unknown field");
            return;
        };
        let packed = match field.pack(std::slice::from_ref(&value)) {
            Ok(p) => p,
            Err(e) => {
                warn!(field_name, error = %e, "Set field failed to pack");
                return;
            }
        };

        let mut dg = Datagram::server_header(
            otp_proto::DATABASE_CHANNEL,
            self.channel,
            msgtypes::DBSERVER_OBJECT_SET_FIELD,
        );
        dg.add_u32(do_id);
        dg.add_u16(field.number);
        dg.add_raw(&packed);
        self.send_internal(dg);
    }

    pub(super) fn start_operation(&mut self, operation: Option<Operation>) {
        let Some(operation) = operation else {
            return;
        };
        if let Some(running) = &self.operation {
            warn!(
                running = running.name(),
                requested = operation.name(),
                "Operation already running, dropping request"
            );
            return;
        }
        self.operation = Some(operation);
    }

    fn advance_operation(&mut self, event: OpEvent) {
        let Some(mut operation) = self.operation.take() else {
            debug!("Database response without a running operation");
            return;
        };
        match operation.advance(self, event) {
            OpOutcome::Continue => self.operation = Some(operation),
            OpOutcome::Done => {}
        }
    }

    /// Schedule the post-generate ownership grant.
    pub(super) fn schedule_owner_grant(&self, avatar_id: u32, delay: std::time::Duration) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::ActivateOwner(avatar_id));
        });
    }

    fn arm_interest_timeout(&mut self) {
        self.timeout_gen += 1;
        let generation = self.timeout_gen;
        let events = self.events.clone();
        let period = self.agent.config.interest_timeout_period();
        tokio::spawn(async move {
            tokio::time::sleep(period).await;
            let _ = events.send(SessionEvent::InterestTimeout(generation));
        });
    }

    // -----------------------------------------------------------------------
    // Client-side dispatch
    // -----------------------------------------------------------------------

    /// Handle one frame from the client. Returns true when the session
    /// should close.
    pub(super) fn handle_client_frame(&mut self, frame: &[u8]) -> bool {
        if let Err(e) = self.dispatch_client(frame) {
            warn!(code = e.disconnect_code(), error = %e, kind = e.error_code(), "Kicking client");
            self.send_go_get_lost(e.disconnect_code(), &e.to_string());
            return true;
        }
        self.close_requested
    }

    fn dispatch_client(&mut self, frame: &[u8]) -> SessionResult {
        let mut it = DatagramIter::new(frame);
        let msg_type = it.read_u16()?;

        match msg_type {
            msgtypes::CLIENT_HEARTBEAT => Ok(()),
            msgtypes::CLIENT_LOGIN_2 => self.handle_login(&mut it),
            msgtypes::CLIENT_DISCONNECT => {
                self.close_requested = true;
                Ok(())
            }
            _ if !self.authenticated => Err(SessionError::AnonymousViolation(msg_type)),
            msgtypes::CLIENT_GET_SHARD_LIST => {
                let dg = Datagram::server_header(
                    otp_proto::STATE_SERVER_CHANNEL,
                    self.channel,
                    msgtypes::STATESERVER_GET_SHARD_ALL,
                );
                self.send_internal(dg);
                Ok(())
            }
            msgtypes::CLIENT_GET_AVATARS => {
                let account_id = self.account_id();
                let op = Operation::retrieve_avatars(self, account_id);
                self.start_operation(op);
                Ok(())
            }
            msgtypes::CLIENT_GET_AVATAR_DETAILS => {
                let avatar_id = it.read_u32()?;
                let op = Operation::get_avatar_details(self, avatar_id);
                self.start_operation(op);
                Ok(())
            }
            msgtypes::CLIENT_CREATE_AVATAR => {
                let echo = it.read_u16()?;
                let dna = it.read_string()?;
                let index = it.read_u8()?;
                let account_id = self.account_id();
                let op = Operation::create_avatar(self, echo, account_id, dna, index);
                self.start_operation(op);
                Ok(())
            }
            msgtypes::CLIENT_SET_AVATAR => {
                let avatar_id = it.read_u32()?;
                let account_id = self.account_id();
                let op = Operation::load_avatar(self, account_id, avatar_id);
                self.start_operation(op);
                Ok(())
            }
            msgtypes::CLIENT_DELETE_AVATAR => {
                let avatar_id = it.read_u32()?;
                let account_id = self.account_id();
                let op = Operation::delete_avatar(self, account_id, avatar_id);
                self.start_operation(op);
                Ok(())
            }
            msgtypes::CLIENT_SET_WISHNAME => {
                let avatar_id = it.read_u32()?;
                let wish_name = it.read_string()?;
                let op = Operation::set_name(self, avatar_id, wish_name);
                self.start_operation(op);
                Ok(())
            }
            msgtypes::CLIENT_SET_NAME_PATTERN => {
                let avatar_id = it.read_u32()?;
                let mut pattern = [(0u16, 0u16); 4];
                for slot in &mut pattern {
                    *slot = (it.read_u16()?, it.read_u16()?);
                }
                let op = Operation::set_name_pattern(self, avatar_id, pattern);
                self.start_operation(op);
                Ok(())
            }
            msgtypes::CLIENT_GET_FRIEND_LIST => {
                let avatar_id = self.avatar_id();
                let op = Operation::load_friends_list(self, avatar_id);
                self.start_operation(op);
                Ok(())
            }
            msgtypes::CLIENT_REMOVE_FRIEND => {
                let _friend_id = it.read_u32()?;
                Ok(())
            }
            msgtypes::CLIENT_SET_SHARD => self.handle_set_shard(&mut it),
            msgtypes::CLIENT_SET_ZONE => self.handle_set_zone(&mut it),
            msgtypes::CLIENT_OBJECT_UPDATE_FIELD => self.handle_client_update_field(&mut it),
            other => Err(SessionError::UnknownMessage(other)),
        }
    }

    fn handle_login(&mut self, it: &mut DatagramIter<'_>) -> SessionResult {
        let token = it.read_string()?;
        let version = it.read_string()?;
        let hash = it.read_u32()?;
        let token_type = it.read_i32()?;

        if version != self.agent.config.version {
            return Err(SessionError::BadVersion {
                got: version,
                expected: self.agent.config.version.clone(),
            });
        }
        if hash != self.agent.expected_hash {
            return Err(SessionError::BadHash { got: hash, expected: self.agent.expected_hash });
        }
        if token_type != msgtypes::CLIENT_LOGIN_2_BLUE
            && token_type != msgtypes::CLIENT_LOGIN_2_PLAY_TOKEN
        {
            return Err(SessionError::BadTokenType(token_type));
        }

        let op = Operation::load_account(self, token);
        self.start_operation(op);
        Ok(())
    }

    pub(super) fn send_login_response(&mut self, token: &str) {
        let mut dg = Datagram::client_header(msgtypes::CLIENT_LOGIN_2_RESP);
        dg.add_u8(0);
        dg.add_string("All Ok");
        dg.add_string(token);
        dg.add_u8(1);
        dg.add_u32(chrono::Utc::now().timestamp() as u32);
        dg.add_u32(self.agent.started.elapsed().as_secs() as u32);
        dg.add_u8(1);
        dg.add_i32(1000 * 60 * 60);
        self.send_client(dg);
    }

    fn send_go_get_lost(&mut self, code: u16, reason: &str) {
        let mut dg = Datagram::client_header(msgtypes::CLIENT_GO_GET_LOST);
        dg.add_u16(code);
        dg.add_string(reason);
        self.send_client(dg);
    }

    fn handle_set_shard(&mut self, it: &mut DatagramIter<'_>) -> SessionResult {
        let shard_id = it.read_u32()?;
        let avatar_id = self.avatar_id();
        if avatar_id == 0 {
            warn!("SET_SHARD before avatar activation");
            return Ok(());
        }

        self.awaiting_location = Some(LocationAwait::Shard);
        let mut dg = Datagram::server_header(
            avatar_id as Channel,
            self.channel,
            msgtypes::STATESERVER_OBJECT_SET_AI,
        );
        dg.add_u64(shard_id as u64);
        self.send_internal(dg);
        Ok(())
    }

    fn handle_set_zone(&mut self, it: &mut DatagramIter<'_>) -> SessionResult {
        let zone = it.read_u16()? as u32;
        let avatar_id = self.avatar_id();
        if avatar_id == 0 {
            warn!("SET_ZONE before avatar activation");
            return Ok(());
        }

        self.awaiting_location = Some(LocationAwait::Zone);
        let mut dg = Datagram::server_header(
            avatar_id as Channel,
            self.channel,
            msgtypes::STATESERVER_OBJECT_SET_ZONE,
        );
        dg.add_u32(zone);
        self.send_internal(dg);
        Ok(())
    }

    /// Relay a client field update verbatim; field policy is enforced by
    /// the state server.
    fn handle_client_update_field(&mut self, it: &mut DatagramIter<'_>) -> SessionResult {
        let do_id = it.read_u32()?;
        let field_number = it.read_u16()?;

        let mut dg = Datagram::server_header(
            do_id as Channel,
            self.channel,
            msgtypes::STATESERVER_OBJECT_UPDATE_FIELD,
        );
        dg.add_u32(do_id);
        dg.add_u16(field_number);
        dg.add_raw(it.peek_remaining());
        self.send_internal(dg);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal-side dispatch
    // -----------------------------------------------------------------------

    /// Handle one session event. Returns true when the session should
    /// close.
    pub(super) fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Internal(frame) => self.handle_internal_frame(&frame),
            SessionEvent::ActivateOwner(avatar_id) => {
                self.grant_ownership(avatar_id);
                false
            }
            SessionEvent::InterestTimeout(generation) => {
                if generation == self.timeout_gen {
                    if !self.pending.is_empty() {
                        warn!(
                            pending = self.pending.len(),
                            "Interest handshake timed out, forcing completion"
                        );
                    }
                    self.interest_done();
                }
                false
            }
        }
    }

    pub(super) fn handle_internal_frame(&mut self, frame: &[u8]) -> bool {
        let mut it = DatagramIter::new(frame);
        let parsed = (|| -> otp_proto::Result<(u8, Channel, Channel, u16)> {
            Ok((it.read_u8()?, it.read_u64()?, it.read_u64()?, it.read_u16()?))
        })();
        let (_, _dst, sender, msg_type) = match parsed {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable internal frame");
                return false;
            }
        };

        match self.dispatch_internal(sender, msg_type, &mut it) {
            Ok(close) => close || self.close_requested,
            Err(e) => {
                warn!(msg_type, error = %e, "Dropping internal message");
                false
            }
        }
    }

    fn dispatch_internal(
        &mut self,
        _sender: Channel,
        msg_type: u16,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<bool> {
        match msg_type {
            msgtypes::CLIENTAGENT_DISCONNECT => {
                let code = it.read_u16()?;
                let reason = it.read_string()?;
                warn!(code, reason = %reason, "Disconnect requested from inside the cluster");
                self.send_go_get_lost(code, &reason);
                return Ok(true);
            }
            msgtypes::CLIENTAGENT_FRIEND_ONLINE => {
                let friend_id = it.read_u32()?;
                let mut dg = Datagram::client_header(msgtypes::CLIENT_FRIEND_ONLINE);
                dg.add_u32(friend_id);
                self.send_client(dg);
            }
            msgtypes::CLIENTAGENT_FRIEND_OFFLINE => {
                let friend_id = it.read_u32()?;
                let mut dg = Datagram::client_header(msgtypes::CLIENT_FRIEND_OFFLINE);
                dg.add_u32(friend_id);
                self.send_client(dg);
            }
            msgtypes::STATESERVER_GET_SHARD_ALL_RESP => {
                let mut dg = Datagram::client_header(msgtypes::CLIENT_GET_SHARD_LIST_RESP);
                dg.add_raw(it.peek_remaining());
                self.send_client(dg);
            }
            msgtypes::STATESERVER_OBJECT_LOCATION_ACK => self.handle_location_ack(it)?,
            msgtypes::STATESERVER_OBJECT_GET_ZONES_OBJECTS_RESP => {
                self.handle_zones_objects_resp(it)?
            }
            msgtypes::STATESERVER_OBJECT_ENTER_OWNER_WITH_REQUIRED => {
                self.handle_enter_owner(false, it)?
            }
            msgtypes::STATESERVER_OBJECT_ENTER_OWNER_WITH_REQUIRED_OTHER => {
                self.handle_enter_owner(true, it)?
            }
            msgtypes::STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED => {
                self.handle_enter_location(false, it)?
            }
            msgtypes::STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED_OTHER => {
                self.handle_enter_location(true, it)?
            }
            msgtypes::STATESERVER_OBJECT_CHANGING_LOCATION => {
                let do_id = it.read_u32()?;
                let _new_parent = it.read_u32()?;
                let new_zone = it.read_u32()?;
                if self.is_seen(do_id)
                    && !self.owned.contains(&do_id)
                    && !self.interest.has(new_zone)
                {
                    self.send_object_delete(do_id);
                }
            }
            msgtypes::STATESERVER_OBJECT_UPDATE_FIELD => {
                let do_id = it.read_u32()?;
                let field_number = it.read_u16()?;
                let visible = self.is_seen(do_id)
                    || self.pending.contains(&do_id)
                    || self.owned.contains(&do_id);
                if visible {
                    let mut dg =
                        Datagram::client_header(msgtypes::CLIENT_OBJECT_UPDATE_FIELD_RESP);
                    dg.add_u32(do_id);
                    dg.add_u16(field_number);
                    dg.add_raw(it.peek_remaining());
                    self.send_client(dg);
                }
            }
            msgtypes::STATESERVER_OBJECT_DELETE_RAM => {
                let do_id = it.read_u32()?;
                if self.is_seen(do_id) && !self.owned.contains(&do_id) {
                    // Quiet-zone objects vanish silently.
                    if self.seen_zone(do_id) != Some(QUIET_ZONE) {
                        self.send_object_delete(do_id);
                    } else {
                        self.forget_seen(do_id);
                    }
                }
            }
            msgtypes::DBSERVER_CREATE_OBJECT_RESP => {
                let ctx = it.read_u32()?;
                let do_id = it.read_u32()?;
                self.advance_operation(OpEvent::Created { ctx, do_id });
            }
            msgtypes::DBSERVER_OBJECT_GET_ALL_RESP => {
                let event = self.parse_db_record(it)?;
                self.advance_operation(event);
            }
            other => {
                debug!(msg_type = other, "Unhandled internal message");
            }
        }
        Ok(false)
    }

    fn parse_db_record(&mut self, it: &mut DatagramIter<'_>) -> otp_proto::Result<OpEvent> {
        let ctx = it.read_u32()?;
        let success = it.read_u8()?;
        if success == 0 {
            return Ok(OpEvent::Record { ctx, record: None });
        }

        let class_number = it.read_u16()?;
        let count = it.read_u16()?;
        let Some(class) = self.agent.catalog.class(class_number).cloned() else {
            warn!(class_number, "Database record with unknown class");
            return Ok(OpEvent::Record { ctx, record: None });
        };

        let mut fields = HashMap::new();
        for _ in 0..count {
            let number = it.read_u16()?;
            let Some(field) = class.field(number) else {
                warn!(class = %class.name, number, "Database record with unknown field");
                return Ok(OpEvent::Record { ctx, record: None });
            };
            match field.unpack(it) {
                Ok(values) => {
                    fields.insert(field.name.clone(), values);
                }
                Err(e) => {
                    warn!(field = %field.name, error = %e, "Database record failed to unpack");
                    return Ok(OpEvent::Record { ctx, record: None });
                }
            }
        }

        Ok(OpEvent::Record { ctx, record: Some(DbRecord { class_number, fields }) })
    }

    // -----------------------------------------------------------------------
    // Interest management
    // -----------------------------------------------------------------------

    fn handle_location_ack(&mut self, it: &mut DatagramIter<'_>) -> otp_proto::Result<()> {
        let _do_id = it.read_u32()?;
        let _old_parent = it.read_u32()?;
        let old_zone = it.read_u32()?;
        let _new_parent = it.read_u32()?;
        let new_zone = it.read_u32()?;

        match self.awaiting_location.take() {
            Some(LocationAwait::Shard) => {
                let dg = Datagram::client_header(msgtypes::CLIENT_GET_STATE_RESP);
                self.send_client(dg);
            }
            Some(LocationAwait::Zone) => self.zone_changed(old_zone, new_zone),
            None => debug!("Location ack without a pending change"),
        }
        Ok(())
    }

    /// The effective interest set of a zone: playgrounds stand alone with
    /// the quiet zone, streets union their visibility group, branch zone,
    /// and the quiet zone.
    pub(super) fn effective_interest(&mut self, zone: u32) -> HashSet<u32> {
        let mut set = HashSet::new();
        if zone == 0 {
            return set;
        }
        set.insert(QUIET_ZONE);
        if zone == QUIET_ZONE {
            return set;
        }
        set.insert(zone);

        if is_street(zone) {
            let branch = branch_zone(zone);
            set.insert(branch);

            if !self.vis_cache.contains_key(&branch) {
                let loaded = self.agent.vis.branch(branch);
                self.vis_cache.insert(branch, loaded);
            }
            if let Some(Some(branch_vis)) = self.vis_cache.get(&branch) {
                if let Some(visible) = branch_vis.visible_from(zone) {
                    set.extend(visible.iter().copied());
                }
            }
        }
        set
    }

    /// The vis-group zone-change bookkeeping, run off the location ack.
    fn zone_changed(&mut self, old_zone: u32, new_zone: u32) {
        let old_street = is_street(old_zone);
        let new_street = is_street(new_zone);

        let old_set = self.effective_interest(old_zone);
        let new_set = self.effective_interest(new_zone);

        for zone in old_set.difference(&new_set) {
            self.interest.remove(*zone);
        }
        for zone in new_set.difference(&old_set) {
            self.interest.add(*zone);
        }

        // Objects seen in zones we no longer care about go away, owned
        // objects excepted.
        let stale: Vec<u32> =
            self.seen.keys().copied().filter(|z| !self.interest.has(*z)).collect();
        for zone in stale {
            if let Some(ids) = self.seen.remove(&zone) {
                for do_id in ids {
                    if !self.owned.contains(&do_id) {
                        let mut dg = Datagram::client_header(msgtypes::CLIENT_OBJECT_DELETE_RESP);
                        dg.add_u32(do_id);
                        self.send_client(dg);
                    }
                }
            }
        }

        // Leaving a street branch (or hopping branches) evicts its cache.
        if old_street && (!new_street || branch_zone(old_zone) != branch_zone(new_zone)) {
            self.vis_cache.remove(&branch_zone(old_zone));
        }

        // Only transitions touching a non-street zone get the deferred
        // handshake reply; sibling street hops complete silently.
        if !old_street || !new_street {
            self.deferred_zone = Some((old_zone, new_zone));
        }

        let avatar_id = self.avatar_id();
        let zones: Vec<u32> = self.interest.iter().collect();
        let mut dg = Datagram::server_header(
            avatar_id as Channel,
            self.channel,
            msgtypes::STATESERVER_OBJECT_GET_ZONES_OBJECTS,
        );
        dg.add_u16(zones.len() as u16);
        for zone in zones {
            dg.add_u32(zone);
        }
        self.send_internal(dg);
    }

    fn handle_zones_objects_resp(&mut self, it: &mut DatagramIter<'_>) -> otp_proto::Result<()> {
        let _requester = it.read_u64()?;
        let count = it.read_u16()?;
        for _ in 0..count {
            let do_id = it.read_u64()? as u32;
            if self.is_seen(do_id) || self.owned.contains(&do_id) {
                continue;
            }
            self.pending.insert(do_id);
        }

        self.send_zone_reply(false);

        if self.pending.is_empty() {
            self.interest_done();
        } else {
            self.arm_interest_timeout();
        }
        Ok(())
    }

    /// Interest-complete reply table: where the handshake replies land
    /// depends on whether the old zone was unset, and whether the new zone
    /// is the quiet zone.
    fn send_zone_reply(&mut self, complete: bool) {
        let Some((old_zone, new_zone)) = self.deferred_zone else {
            return;
        };

        if new_zone == QUIET_ZONE {
            if complete {
                if old_zone == 0 {
                    self.send_done_set_zone(new_zone);
                } else {
                    self.send_get_state(new_zone);
                }
            }
        } else if !complete {
            if old_zone == 0 {
                self.send_done_set_zone(new_zone);
            } else {
                self.send_get_state(new_zone);
            }
        } else {
            self.send_done_set_zone(new_zone);
        }

        if complete {
            self.deferred_zone = None;
        }
    }

    fn send_done_set_zone(&mut self, zone: u32) {
        let mut dg = Datagram::client_header(msgtypes::CLIENT_DONE_SET_ZONE_RESP);
        dg.add_u16(zone as u16);
        self.send_client(dg);
    }

    fn send_get_state(&mut self, zone: u32) {
        let mut dg = Datagram::client_header(msgtypes::CLIENT_GET_STATE_RESP);
        dg.pad_bytes(12);
        dg.add_u16(zone as u16);
        self.send_client(dg);
    }

    fn interest_done(&mut self) {
        self.timeout_gen += 1;
        self.send_zone_reply(true);
        self.pending.clear();
    }

    fn handle_enter_owner(
        &mut self,
        has_other: bool,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<()> {
        let do_id = it.read_u64()? as u32;
        let _parent = it.read_u64()?;
        let _zone = it.read_u32()?;
        let class_number = it.read_u16()?;

        let msg_type = if has_other {
            msgtypes::CLIENT_CREATE_OBJECT_REQUIRED_OTHER
        } else {
            msgtypes::CLIENT_CREATE_OBJECT_REQUIRED
        };
        let mut dg = Datagram::client_header(msg_type);
        dg.add_u16(class_number);
        dg.add_u32(do_id);
        dg.add_raw(it.peek_remaining());
        self.send_client(dg);

        self.owned.insert(do_id);
        Ok(())
    }

    fn handle_enter_location(
        &mut self,
        has_other: bool,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<()> {
        let do_id = it.read_u64()? as u32;
        let _parent = it.read_u64()?;
        let zone = it.read_u32()?;
        let class_number = it.read_u16()?;

        if self.is_seen(do_id) || self.owned.contains(&do_id) {
            return Ok(());
        }
        if !self.interest.has(zone) {
            return Ok(());
        }
        // The quiet zone never carries player avatars to clients.
        if zone == QUIET_ZONE {
            if let Some(class) = self.agent.catalog.class(class_number) {
                if class.player_avatar {
                    return Ok(());
                }
            }
        }

        let msg_type = if has_other {
            msgtypes::CLIENT_CREATE_OBJECT_REQUIRED_OTHER
        } else {
            msgtypes::CLIENT_CREATE_OBJECT_REQUIRED
        };
        let mut dg = Datagram::client_header(msg_type);
        dg.add_u16(class_number);
        dg.add_u32(do_id);
        dg.add_raw(it.peek_remaining());
        self.send_client(dg);

        self.seen.entry(zone).or_default().insert(do_id);

        if self.pending.remove(&do_id) && self.pending.is_empty() {
            self.interest_done();
        }
        Ok(())
    }

    fn grant_ownership(&mut self, avatar_id: u32) {
        // The avatar must not outlive the connection: a pre-serialized
        // delete rides the allocated channel's post-remove queue.
        let mut inner = Datagram::server_header(
            avatar_id as Channel,
            self.channel,
            msgtypes::STATESERVER_OBJECT_DELETE_RAM,
        );
        inner.add_u32(avatar_id);
        self.agent.link.add_post_remove(self.allocated, &inner);

        let mut dg = Datagram::server_header(
            avatar_id as Channel,
            self.channel,
            msgtypes::STATESERVER_OBJECT_SET_OWNER,
        );
        dg.add_u64(self.channel);
        self.send_internal(dg);
    }

    // -----------------------------------------------------------------------
    // Seen-set helpers
    // -----------------------------------------------------------------------

    pub(super) fn is_seen(&self, do_id: u32) -> bool {
        self.seen.values().any(|ids| ids.contains(&do_id))
    }

    fn seen_zone(&self, do_id: u32) -> Option<u32> {
        self.seen
            .iter()
            .find_map(|(zone, ids)| ids.contains(&do_id).then_some(*zone))
    }

    fn forget_seen(&mut self, do_id: u32) {
        self.seen.retain(|_, ids| {
            ids.remove(&do_id);
            !ids.is_empty()
        });
    }

    fn send_object_delete(&mut self, do_id: u32) {
        let mut dg = Datagram::client_header(msgtypes::CLIENT_OBJECT_DELETE_RESP);
        dg.add_u32(do_id);
        self.send_client(dg);
        self.forget_seen(do_id);
    }

    fn teardown(&mut self) {
        self.timeout_gen += 1;
        // The allocated channel was registered first; removing it last
        // lets its post-removes (avatar delete, friend-offline) replay
        // after the identity channels are gone.
        for channel in self.registered.clone().into_iter().rev() {
            self.agent.sessions.remove(&channel);
            self.agent.link.unregister_channel(channel);
        }
        self.registered.clear();
        self.agent.channels.lock().free(self.allocated);
    }
}
