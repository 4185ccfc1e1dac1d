//! State server: the authoritative registry of live distributed objects.
//!
//! One task owns the whole registry; every message runs to completion
//! before the next is read, so transitions never interleave. Each object
//! subscribes its own doId as a channel, making the director the
//! dispatcher for per-object traffic.

mod object;

pub use object::{InterestSet, StateObject};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use otp_proto::{msgtypes, Channel, Datagram, DatagramIter, DATABASE_CHANNEL};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StateConfig;
use crate::dclass::Catalog;
use crate::network::MdLink;

/// An AI process simulating a slice of the world, keyed by its channel.
#[derive(Debug, Clone)]
pub struct Shard {
    pub channel: Channel,
    pub district_id: u32,
    pub name: String,
    pub population: u32,
}

pub struct StateServer {
    channel: Channel,
    link: MdLink,
    catalog: Arc<Catalog>,
    shards: BTreeMap<Channel, Shard>,
    objects: HashMap<u32, StateObject>,
}

/// Connect to the director and spawn the service loop.
pub async fn start(config: &StateConfig, catalog: Arc<Catalog>) -> anyhow::Result<()> {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let link = MdLink::connect(config.connect_address, inbox_tx).await?;
    link.register_channel(config.channel);

    let server = StateServer::new(config.channel, link, catalog);
    tokio::spawn(server.run(inbox_rx));
    info!(channel = config.channel, "State server started");
    Ok(())
}

impl StateServer {
    pub fn new(channel: Channel, link: MdLink, catalog: Arc<Catalog>) -> Self {
        Self { channel, link, catalog, shards: BTreeMap::new(), objects: HashMap::new() }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Bytes>) {
        while let Some(frame) = inbox.recv().await {
            self.handle_frame(&frame);
        }
        info!("State server loop ended");
    }

    /// Parse and dispatch one internal frame.
    pub fn handle_frame(&mut self, frame: &[u8]) {
        let mut it = DatagramIter::new(frame);
        let header = (|| -> otp_proto::Result<(u8, Channel, Channel, u16)> {
            Ok((it.read_u8()?, it.read_u64()?, it.read_u64()?, it.read_u16()?))
        })();
        let (_, dst, sender, msg_type) = match header {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable frame");
                return;
            }
        };

        if let Err(e) = self.dispatch(dst, sender, msg_type, &mut it) {
            warn!(msg_type, sender, error = %e, "Dropping message");
        }
    }

    fn dispatch(
        &mut self,
        dst: Channel,
        sender: Channel,
        msg_type: u16,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<()> {
        match msg_type {
            msgtypes::STATESERVER_ADD_SHARD => self.handle_add_shard(sender, it)?,
            msgtypes::STATESERVER_UPDATE_SHARD => self.handle_update_shard(sender, it)?,
            msgtypes::STATESERVER_REMOVE_SHARD => self.handle_remove_shard(sender),
            msgtypes::STATESERVER_GET_SHARD_ALL => self.send_shard_list(sender),
            msgtypes::STATESERVER_OBJECT_GENERATE_WITH_REQUIRED => {
                self.handle_generate(false, it)?
            }
            msgtypes::STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER => {
                self.handle_generate(true, it)?
            }
            msgtypes::STATESERVER_OBJECT_UPDATE_FIELD => self.handle_update_field(sender, it)?,
            msgtypes::STATESERVER_OBJECT_DELETE_RAM => {
                let do_id = it.read_u32()?;
                self.delete_object(do_id);
            }
            _ => self.dispatch_object(dst, sender, msg_type, it)?,
        }
        Ok(())
    }

    /// Messages addressed to an object's own channel.
    fn dispatch_object(
        &mut self,
        dst: Channel,
        sender: Channel,
        msg_type: u16,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<()> {
        let do_id = dst as u32;
        if !self.objects.contains_key(&do_id) {
            debug!(msg_type, sender, dst, "Message for unknown object");
            return Ok(());
        }

        match msg_type {
            msgtypes::STATESERVER_OBJECT_SET_OWNER => {
                let new_owner = it.read_u64()?;
                self.set_owner(do_id, new_owner);
            }
            msgtypes::STATESERVER_OBJECT_SET_AI => {
                let new_ai = it.read_u64()?;
                self.set_ai(do_id, new_ai);
            }
            msgtypes::STATESERVER_OBJECT_SET_ZONE => {
                let new_zone = it.read_u32()?;
                let parent = self.objects[&do_id].parent_id;
                self.move_object(do_id, parent, new_zone, true);
            }
            msgtypes::STATESERVER_OBJECT_SET_LOCATION => {
                let new_parent = it.read_u32()? as Channel;
                let new_zone = it.read_u32()?;
                self.move_object(do_id, new_parent, new_zone, true);
            }
            msgtypes::STATESERVER_OBJECT_CHANGING_LOCATION => {
                let moved = it.read_u32()?;
                let new_parent = it.read_u32()? as Channel;
                let new_zone = it.read_u32()?;
                debug_assert_eq!(moved, do_id);
                let obj = &self.objects[&do_id];
                if obj.parent_id == new_parent && obj.zone_id == new_zone {
                    debug!(do_id, "Location relay without a move");
                } else {
                    self.move_object(do_id, new_parent, new_zone, false);
                }
            }
            msgtypes::STATESERVER_OBJECT_GET_ZONES_OBJECTS => {
                self.handle_get_zones_objects(do_id, sender, it)?;
            }
            other => {
                warn!(msg_type = other, do_id, "Unknown message type for object");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shards
    // -----------------------------------------------------------------------

    fn handle_add_shard(
        &mut self,
        sender: Channel,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<()> {
        let district_id = it.read_u32()?;
        let name = it.read_string()?;
        let population = it.read_u32()?;

        if self.shards.contains_key(&sender) {
            debug!(channel = sender, "Shard already registered");
            return Ok(());
        }
        info!(channel = sender, district_id, name = %name, "Shard registered");
        self.shards.insert(sender, Shard { channel: sender, district_id, name, population });
        self.broadcast_shard_list(None);
        Ok(())
    }

    fn handle_update_shard(
        &mut self,
        sender: Channel,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<()> {
        let name = it.read_string()?;
        let population = it.read_u32()?;

        let Some(shard) = self.shards.get_mut(&sender) else {
            warn!(channel = sender, "Cannot update unknown shard");
            return Ok(());
        };
        shard.name = name;
        shard.population = population;
        self.broadcast_shard_list(Some(sender));
        Ok(())
    }

    /// Shard teardown: disconnect every orphaned owner, drop the shard's
    /// objects, and re-announce the shard list to the survivors.
    fn handle_remove_shard(&mut self, sender: Channel) {
        if self.shards.remove(&sender).is_none() {
            warn!(channel = sender, "Cannot remove unknown shard");
            return;
        }
        info!(channel = sender, "Shard removed, tearing down its objects");

        let orphaned: Vec<u32> = self
            .objects
            .values()
            .filter(|o| o.ai_channel == sender)
            .map(|o| o.do_id)
            .collect();

        for do_id in orphaned {
            let owner = self.objects[&do_id].owner_id;
            if owner != 0 {
                let mut dg = Datagram::server_header(
                    owner,
                    self.channel,
                    msgtypes::CLIENTAGENT_DISCONNECT,
                );
                dg.add_u16(msgtypes::CLIENT_DISCONNECT_SHARD_CLOSED);
                dg.add_string(&format!("Shard with channel {sender} has been terminated"));
                self.link.send(dg);
            }
            self.delete_object(do_id);
        }

        self.broadcast_shard_list(None);
    }

    fn shard_list_datagram(&self, to: Channel) -> Datagram {
        let mut dg =
            Datagram::server_header(to, self.channel, msgtypes::STATESERVER_GET_SHARD_ALL_RESP);
        dg.add_u16(self.shards.len() as u16);
        for shard in self.shards.values() {
            dg.add_u32(shard.channel as u32);
            dg.add_string(&shard.name);
            dg.add_u32(shard.population);
        }
        dg
    }

    fn send_shard_list(&self, to: Channel) {
        self.link.send(self.shard_list_datagram(to));
    }

    /// Push the shard list to every owned object's owner; `parent` filters
    /// to objects under that shard.
    fn broadcast_shard_list(&self, parent: Option<Channel>) {
        for obj in self.objects.values() {
            if obj.owner_id == 0 {
                continue;
            }
            if let Some(parent) = parent {
                if obj.parent_id != parent {
                    continue;
                }
            }
            self.send_shard_list(obj.owner_id);
        }
    }

    // -----------------------------------------------------------------------
    // Object lifecycle
    // -----------------------------------------------------------------------

    fn handle_generate(
        &mut self,
        has_other: bool,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<()> {
        let do_id = it.read_u32()?;
        let parent_id = it.read_u32()?;
        let zone_id = it.read_u32()?;
        let class_number = it.read_u16()?;

        if self.objects.contains_key(&do_id) {
            info!(do_id, "Ignoring generate for existing object");
            return Ok(());
        }
        let Some(class) = self.catalog.class(class_number) else {
            warn!(do_id, class_number, "Generate with unknown class");
            return Ok(());
        };

        let mut obj =
            match StateObject::from_generate(class.clone(), do_id, parent_id, zone_id, has_other, it)
            {
                Ok(obj) => obj,
                Err(e) => {
                    warn!(do_id, class_number, error = %e, "Malformed generate payload");
                    return Ok(());
                }
            };

        // Seed the interest mirror as a fresh arrival at its location.
        obj.begin_location_change(parent_id as Channel, zone_id);
        self.objects.insert(do_id, obj);
        self.link.register_channel(do_id as Channel);
        self.fanout_location(do_id);
        Ok(())
    }

    fn delete_object(&mut self, do_id: u32) {
        let Some(obj) = self.objects.remove(&do_id) else {
            debug!(do_id, "Delete for unknown object");
            return;
        };

        if obj.ai_channel != 0 {
            self.link.send(obj.departure_datagram(obj.ai_channel));
        }
        for other in self.objects.values() {
            if other.owner_id != 0 && other.interests.has(obj.parent_id, obj.zone_id) {
                self.link.send(obj.departure_datagram(other.owner_id));
            }
        }

        self.link.unregister_channel(do_id as Channel);
        debug!(do_id, "Object deleted");
    }

    fn set_owner(&mut self, do_id: u32, new_owner: Channel) {
        let Some(obj) = self.objects.get_mut(&do_id) else {
            return;
        };
        if new_owner == obj.owner_id {
            warn!(do_id, new_owner, "Object did not change owners");
            return;
        }
        obj.old_owner_id = obj.owner_id;
        obj.owner_id = new_owner;

        let obj = &self.objects[&do_id];
        if obj.old_owner_id != 0 {
            self.link.send(obj.changing_owner_datagram(obj.old_owner_id));
        }
        if obj.owner_id != 0 {
            self.link.send(obj.enter_owner_datagram(obj.owner_id));
        }
    }

    fn set_ai(&mut self, do_id: u32, new_ai: Channel) {
        let Some(obj) = self.objects.get_mut(&do_id) else {
            return;
        };
        if new_ai == obj.ai_channel {
            debug!(do_id, new_ai, "Object did not change AI");
            return;
        }
        obj.old_ai_channel = obj.ai_channel;
        obj.ai_channel = new_ai;
        // The shard channel is also the object's parent for visibility.
        let zone = obj.zone_id;
        obj.begin_location_change(new_ai, zone);

        let obj = &self.objects[&do_id];
        if obj.old_ai_channel != 0 {
            self.link.send(obj.changing_ai_datagram(obj.old_ai_channel));
        }
        if obj.ai_channel != 0 {
            self.link.send(obj.enter_ai_datagram(obj.ai_channel));
        }

        self.fanout_location(do_id);

        let obj = &self.objects[&do_id];
        if obj.owner_id != 0 {
            self.link.send(obj.location_ack_datagram(obj.owner_id));
        }
    }

    /// Shared location-transition path for SET_ZONE, SET_LOCATION, and the
    /// changing-location relay. Emits all entries and departures before
    /// the owner's location ack.
    fn move_object(&mut self, do_id: u32, new_parent: Channel, new_zone: u32, ack: bool) {
        let Some(obj) = self.objects.get_mut(&do_id) else {
            return;
        };
        obj.begin_location_change(new_parent, new_zone);

        let obj = &self.objects[&do_id];
        if obj.ai_channel != 0 {
            self.link.send(obj.changing_location_datagram(obj.ai_channel));
        }

        self.fanout_location(do_id);

        let obj = &self.objects[&do_id];
        if ack && obj.owner_id != 0 {
            self.link.send(obj.location_ack_datagram(obj.owner_id));
        }
    }

    /// The visibility fan-out for one object's location transition:
    /// every owned candidate whose interest covered the old location but
    /// not the new one sees a departure, and vice versa an entry.
    /// Candidates covering both see nothing. The moving object's own
    /// owner is told nothing here; its view is rebuilt by the agent off
    /// the location ack and the expected-id exchange.
    fn fanout_location(&self, moved_id: u32) {
        let Some(moved) = self.objects.get(&moved_id) else {
            return;
        };
        let old = (moved.old_parent_id, moved.old_zone_id);
        let new = (moved.parent_id, moved.zone_id);

        for (other_id, other) in &self.objects {
            if *other_id == moved_id || other.owner_id == 0 {
                continue;
            }
            let had = other.interests.has(old.0, old.1);
            let has = other.interests.has(new.0, new.1);
            if had && !has {
                self.link.send(moved.departure_datagram(other.owner_id));
            } else if !had && has {
                self.link.send(moved.enter_location_datagram(other.owner_id));
            }
        }
    }

    fn handle_get_zones_objects(
        &mut self,
        do_id: u32,
        sender: Channel,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<()> {
        let count = it.read_u16()?;
        let mut zones = Vec::with_capacity(count as usize);
        for _ in 0..count {
            zones.push(it.read_u32()?);
        }

        // The request carries the owner's full effective interest
        // (visibility groups included); sync the mirror to it so later
        // fan-outs cover every zone the client actually watches.
        if let Some(obj) = self.objects.get_mut(&do_id) {
            let parent = obj.parent_id;
            obj.interests.remove_parent(parent);
            for zone in &zones {
                obj.interests.add(parent, *zone);
            }
        }

        let requester = &self.objects[&do_id];
        let expected: Vec<u32> = self
            .objects
            .values()
            .filter(|o| {
                o.do_id != do_id && o.parent_id == requester.parent_id && zones.contains(&o.zone_id)
            })
            .map(|o| o.do_id)
            .collect();

        // The requester's owner gets each expected object's entry, then
        // the id list that lets it detect handshake completion.
        for id in &expected {
            self.link.send(self.objects[id].enter_location_datagram(sender));
        }

        let mut dg = Datagram::server_header(
            sender,
            do_id as Channel,
            msgtypes::STATESERVER_OBJECT_GET_ZONES_OBJECTS_RESP,
        );
        dg.add_u64(do_id as u64);
        dg.add_u16(expected.len() as u16);
        for id in expected {
            dg.add_u64(id as u64);
        }
        self.link.send(dg);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Field updates
    // -----------------------------------------------------------------------

    fn handle_update_field(
        &mut self,
        sender: Channel,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<()> {
        let do_id = it.read_u32()?;
        let field_number = it.read_u16()?;
        let payload = it.take_remaining();

        let Some(obj) = self.objects.get(&do_id) else {
            debug!(do_id, "Field update for unknown object");
            return Ok(());
        };
        let Some(field) = obj.class.field(field_number) else {
            warn!(do_id, field_number, class = %obj.class.name, "Update for unknown field");
            return Ok(());
        };

        // A zero-length payload is a signaling update; anything else must
        // unpack cleanly once before it is trusted.
        if !payload.is_empty() {
            let mut check = DatagramIter::new(&payload);
            if field.unpack(&mut check).is_err() || check.remaining() != 0 {
                warn!(do_id, field = %field.name, "Malformed field payload");
                return Ok(());
            }
        }

        let from_ai = self.shards.contains_key(&sender);
        if from_ai {
            self.apply_ai_update(do_id, field_number, sender, payload);
        } else {
            self.apply_client_update(do_id, field_number, sender, payload);
        }
        Ok(())
    }

    fn apply_ai_update(&mut self, do_id: u32, field_number: u16, sender: Channel, payload: Vec<u8>) {
        let obj = &self.objects[&do_id];
        let field = obj.class.field(field_number).cloned();
        let Some(field) = field else { return };

        if obj.owner_id != 0 {
            self.send_update(obj.owner_id, sender, do_id, field_number, &payload);
        }
        if field.broadcast {
            self.fanout_field(do_id, sender, field_number, &payload, &[do_id]);
        }
        if field.db && !payload.is_empty() {
            let mut dg = Datagram::server_header(
                DATABASE_CHANNEL,
                do_id as Channel,
                msgtypes::DBSERVER_OBJECT_SET_FIELD,
            );
            dg.add_u32(do_id);
            dg.add_u16(field_number);
            dg.add_raw(&payload);
            self.link.send(dg);
        }
        if field.ram && !payload.is_empty() {
            if let Some(obj) = self.objects.get_mut(&do_id) {
                obj.store_field(field_number, payload, field.required);
            }
        }
    }

    fn apply_client_update(
        &mut self,
        do_id: u32,
        field_number: u16,
        sender: Channel,
        payload: Vec<u8>,
    ) {
        let obj = &self.objects[&do_id];
        let field = obj.class.field(field_number).cloned();
        let Some(field) = field else { return };

        // Send-rights gate: ownsend fields only from the current owner,
        // otherwise the field must be clsend.
        let allowed =
            if field.ownsend { sender == obj.owner_id } else { field.clsend };
        if !allowed {
            warn!(
                do_id,
                field = %field.name,
                sender,
                "Client field update rejected by send policy"
            );
            return;
        }

        let sender_avatar = otp_proto::avatar_id_from_channel(sender);
        if obj.ai_channel != 0 {
            self.send_update(obj.ai_channel, sender, do_id, field_number, &payload);
        }
        if field.broadcast {
            self.fanout_field(do_id, sender, field_number, &payload, &[sender_avatar]);
        }
        if field.ram && !payload.is_empty() {
            if let Some(obj) = self.objects.get_mut(&do_id) {
                obj.store_field(field_number, payload, field.required);
            }
        }
    }

    fn send_update(&self, to: Channel, src: Channel, do_id: u32, field_number: u16, payload: &[u8]) {
        let mut dg = Datagram::server_header(to, src, msgtypes::STATESERVER_OBJECT_UPDATE_FIELD);
        dg.add_u32(do_id);
        dg.add_u16(field_number);
        dg.add_raw(payload);
        self.link.send(dg);
    }

    /// Broadcast a field update to every owner whose interest covers the
    /// object's location, minus the excluded doIds.
    fn fanout_field(
        &self,
        do_id: u32,
        src: Channel,
        field_number: u16,
        payload: &[u8],
        excludes: &[u32],
    ) {
        let obj = &self.objects[&do_id];
        for other in self.objects.values() {
            if excludes.contains(&other.do_id) || other.owner_id == 0 {
                continue;
            }
            if other.interests.has(obj.parent_id, obj.zone_id) {
                self.send_update(other.owner_id, src, do_id, field_number, payload);
            }
        }
    }
}

#[cfg(test)]
mod tests;
