//! The state object: one live distributed object and its transitions.
//!
//! A state object owns its packed field state and a mirror of the zone
//! interests its owner holds, keyed by parent channel. Location, owner,
//! and AI transitions snapshot the previous generation so the fan-out in
//! the parent module can diff old against new membership.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use otp_proto::{msgtypes, Channel, Datagram, DatagramIter};
use tracing::warn;

use crate::dclass::{ClassSpec, SchemaError};
use crate::zones::{branch_zone, is_street, QUIET_ZONE};

/// Zone interests per parent, the state-server-side mirror of a client's
/// interest set.
#[derive(Debug, Clone, Default)]
pub struct InterestSet {
    map: HashMap<Channel, HashSet<u32>>,
}

impl InterestSet {
    pub fn has(&self, parent: Channel, zone: u32) -> bool {
        self.map.get(&parent).is_some_and(|zones| zones.contains(&zone))
    }

    pub fn has_parent(&self, parent: Channel) -> bool {
        self.map.contains_key(&parent)
    }

    pub fn add(&mut self, parent: Channel, zone: u32) {
        self.map.entry(parent).or_default().insert(zone);
    }

    pub fn remove_zone(&mut self, parent: Channel, zone: u32) {
        if let Some(zones) = self.map.get_mut(&parent) {
            zones.remove(&zone);
            if zones.is_empty() {
                self.map.remove(&parent);
            }
        }
    }

    pub fn remove_parent(&mut self, parent: Channel) {
        self.map.remove(&parent);
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

pub struct StateObject {
    pub do_id: u32,
    pub class: Arc<ClassSpec>,

    pub owner_id: Channel,
    pub old_owner_id: Channel,

    pub ai_channel: Channel,
    pub old_ai_channel: Channel,

    /// Location. The parent doubles as the interest key; for shard-parented
    /// objects it carries the AI channel value.
    pub parent_id: Channel,
    pub zone_id: u32,
    pub old_parent_id: Channel,
    pub old_zone_id: u32,

    /// Packed argument tuples, one per declared required field.
    required: BTreeMap<u16, Vec<u8>>,
    /// Packed non-required ram fields.
    other: BTreeMap<u16, Vec<u8>>,
    pub has_other: bool,

    pub interests: InterestSet,
}

impl StateObject {
    /// Build from a generate payload: one tuple per required field in
    /// field-number order, then, when `has_other`, a counted block of
    /// `(fieldNumber, tuple)` pairs of which only `ram` fields are kept.
    pub fn from_generate(
        class: Arc<ClassSpec>,
        do_id: u32,
        parent_id: u32,
        zone_id: u32,
        has_other: bool,
        it: &mut DatagramIter<'_>,
    ) -> Result<Self, SchemaError> {
        let mut required = BTreeMap::new();
        for field in class.required_fields() {
            let values = field.unpack(it)?;
            required.insert(field.number, field.pack(&values)?);
        }

        let mut other = BTreeMap::new();
        if has_other {
            let count = it.read_u16()?;
            for _ in 0..count {
                let number = it.read_u16()?;
                let Some(field) = class.field(number) else {
                    return Err(SchemaError::UnknownField { class: class.name.clone(), number });
                };
                let values = field.unpack(it)?;
                if field.ram {
                    other.insert(number, field.pack(&values)?);
                }
            }
        }

        Ok(Self {
            do_id,
            class,
            owner_id: 0,
            old_owner_id: 0,
            ai_channel: 0,
            old_ai_channel: 0,
            parent_id: parent_id as Channel,
            zone_id,
            old_parent_id: 0,
            old_zone_id: 0,
            required,
            other,
            has_other,
            interests: InterestSet::default(),
        })
    }

    /// Begin a location transition: snapshot the old generation, move, and
    /// rebuild this object's own interest mirror around the new location.
    pub fn begin_location_change(&mut self, new_parent: Channel, new_zone: u32) {
        self.old_parent_id = self.parent_id;
        self.old_zone_id = self.zone_id;
        self.parent_id = new_parent;
        self.zone_id = new_zone;

        if self.old_zone_id != 0 {
            self.interests.remove_zone(self.old_parent_id, self.old_zone_id);
            if is_street(self.old_zone_id) {
                self.interests.remove_zone(self.old_parent_id, branch_zone(self.old_zone_id));
            }
        }

        if self.parent_id != self.old_parent_id {
            self.interests.remove_parent(self.old_parent_id);
            if self.parent_id != 0 {
                self.interests.add(self.parent_id, QUIET_ZONE);
            }
        }

        if self.zone_id != 0 && self.zone_id != QUIET_ZONE {
            self.interests.add(self.parent_id, self.zone_id);
            if is_street(self.zone_id) {
                self.interests.add(self.parent_id, branch_zone(self.zone_id));
            }
            self.interests.add(self.parent_id, QUIET_ZONE);
        }
    }

    /// Store a packed update for a ram field.
    pub fn store_field(&mut self, number: u16, packed: Vec<u8>, required_field: bool) {
        if required_field {
            self.required.insert(number, packed);
        } else {
            self.other.insert(number, packed);
            self.has_other = true;
        }
    }

    /// Append required tuples in field-number order; `broadcast_only`
    /// filters to fields flagged broadcast.
    pub fn append_required(&self, dg: &mut Datagram, broadcast_only: bool) {
        for (number, packed) in &self.required {
            let Some(field) = self.class.field(*number) else {
                warn!(do_id = self.do_id, number, "Stored field missing from class");
                continue;
            };
            if broadcast_only && !field.broadcast {
                continue;
            }
            dg.add_raw(packed);
        }
    }

    /// Append the counted `(fieldNumber, tuple)` other block.
    pub fn append_other(&self, dg: &mut Datagram) {
        dg.add_u16(self.other.len() as u16);
        for (number, packed) in &self.other {
            dg.add_u16(*number);
            dg.add_raw(packed);
        }
    }

    pub fn enter_location_datagram(&self, to: Channel) -> Datagram {
        let msg_type = if self.has_other {
            msgtypes::STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED_OTHER
        } else {
            msgtypes::STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED
        };
        let mut dg = self.entry_header(to, msg_type);
        self.append_required(&mut dg, true);
        if self.has_other {
            self.append_other(&mut dg);
        }
        dg
    }

    /// Owner entries carry every required field, broadcast or not.
    pub fn enter_owner_datagram(&self, to: Channel) -> Datagram {
        let msg_type = if self.has_other {
            msgtypes::STATESERVER_OBJECT_ENTER_OWNER_WITH_REQUIRED_OTHER
        } else {
            msgtypes::STATESERVER_OBJECT_ENTER_OWNER_WITH_REQUIRED
        };
        let mut dg = self.entry_header(to, msg_type);
        self.append_required(&mut dg, false);
        if self.has_other {
            self.append_other(&mut dg);
        }
        dg
    }

    /// AI entries carry all required fields only while the object is owned.
    pub fn enter_ai_datagram(&self, to: Channel) -> Datagram {
        let msg_type = if self.has_other {
            msgtypes::STATESERVER_OBJECT_ENTER_AI_WITH_REQUIRED_OTHER
        } else {
            msgtypes::STATESERVER_OBJECT_ENTER_AI_WITH_REQUIRED
        };
        let mut dg = self.entry_header(to, msg_type);
        self.append_required(&mut dg, self.owner_id == 0);
        if self.has_other {
            self.append_other(&mut dg);
        }
        dg
    }

    fn entry_header(&self, to: Channel, msg_type: u16) -> Datagram {
        let mut dg = Datagram::server_header(to, self.do_id as Channel, msg_type);
        dg.add_u64(self.do_id as u64);
        dg.add_u64(self.parent_id);
        dg.add_u32(self.zone_id);
        dg.add_u16(self.class.number);
        dg
    }

    pub fn departure_datagram(&self, to: Channel) -> Datagram {
        let mut dg = Datagram::server_header(
            to,
            self.do_id as Channel,
            msgtypes::STATESERVER_OBJECT_DELETE_RAM,
        );
        dg.add_u32(self.do_id);
        dg
    }

    pub fn changing_location_datagram(&self, to: Channel) -> Datagram {
        let mut dg = Datagram::server_header(
            to,
            self.do_id as Channel,
            msgtypes::STATESERVER_OBJECT_CHANGING_LOCATION,
        );
        dg.add_u32(self.do_id);
        dg.add_u32(self.parent_id as u32);
        dg.add_u32(self.zone_id);
        dg
    }

    pub fn location_ack_datagram(&self, to: Channel) -> Datagram {
        let mut dg = Datagram::server_header(
            to,
            self.do_id as Channel,
            msgtypes::STATESERVER_OBJECT_LOCATION_ACK,
        );
        dg.add_u32(self.do_id);
        dg.add_u32(self.old_parent_id as u32);
        dg.add_u32(self.old_zone_id);
        dg.add_u32(self.parent_id as u32);
        dg.add_u32(self.zone_id);
        dg
    }

    pub fn changing_owner_datagram(&self, to: Channel) -> Datagram {
        let mut dg = Datagram::server_header(
            to,
            self.do_id as Channel,
            msgtypes::STATESERVER_OBJECT_CHANGING_OWNER,
        );
        dg.add_u32(self.do_id);
        dg.add_u64(self.old_owner_id);
        dg.add_u64(self.owner_id);
        dg
    }

    pub fn changing_ai_datagram(&self, to: Channel) -> Datagram {
        let mut dg = Datagram::server_header(
            to,
            self.do_id as Channel,
            msgtypes::STATESERVER_OBJECT_CHANGING_AI,
        );
        dg.add_u32(self.do_id);
        dg.add_u64(self.old_ai_channel);
        dg.add_u64(self.ai_channel);
        dg
    }
}
