//! Database server: the persistent store of durable objects.
//!
//! One task drains the operation stream; each operation completes
//! synchronously and emits its response datagram, so writes never
//! interleave. Responses correlate by the caller-chosen context.

mod backend;

pub use backend::{DbObject, JsonBackend};

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use otp_proto::{msgtypes, Channel, Datagram, DatagramIter};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::allocator::IdAllocator;
use crate::config::DatabaseConfig;
use crate::dclass::{Catalog, ClassSpec};
use crate::network::MdLink;

pub struct DatabaseServer {
    channel: Channel,
    link: MdLink,
    catalog: Arc<Catalog>,
    backend: JsonBackend,
    allocator: IdAllocator,
}

/// Connect to the director and spawn the service loop.
pub async fn start(config: &DatabaseConfig, catalog: Arc<Catalog>) -> anyhow::Result<()> {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let link = MdLink::connect(config.connect_address, inbox_tx).await?;
    link.register_channel(config.channel);

    let backend = JsonBackend::open(&config.directory, &config.extension, &config.tracker)?;
    let server = DatabaseServer::new(config, catalog, link, backend);
    tokio::spawn(server.run(inbox_rx));
    info!(channel = config.channel, directory = %config.directory, "Database server started");
    Ok(())
}

impl DatabaseServer {
    pub fn new(
        config: &DatabaseConfig,
        catalog: Arc<Catalog>,
        link: MdLink,
        backend: JsonBackend,
    ) -> Self {
        let first_free = backend.next_id().unwrap_or(config.min_channels);
        backend.set_next_id(first_free);
        let allocator = IdAllocator::new(first_free as u64, config.max_channels as u64);
        Self { channel: config.channel, link, catalog, backend, allocator }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Bytes>) {
        while let Some(frame) = inbox.recv().await {
            self.handle_frame(&frame);
        }
        info!("Database server loop ended");
    }

    pub fn handle_frame(&mut self, frame: &[u8]) {
        let mut it = DatagramIter::new(frame);
        let header = (|| -> otp_proto::Result<(u8, Channel, Channel, u16)> {
            Ok((it.read_u8()?, it.read_u64()?, it.read_u64()?, it.read_u16()?))
        })();
        let (_, _dst, sender, msg_type) = match header {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable frame");
                return;
            }
        };

        if let Err(e) = self.dispatch(sender, msg_type, &mut it) {
            warn!(msg_type, sender, error = %e, "Dropping request");
        }
    }

    fn dispatch(
        &mut self,
        sender: Channel,
        msg_type: u16,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<()> {
        match msg_type {
            msgtypes::DBSERVER_CREATE_OBJECT => self.handle_create(sender, it)?,
            msgtypes::DBSERVER_OBJECT_GET_ALL => self.handle_get_all(sender, it)?,
            msgtypes::DBSERVER_OBJECT_GET_FIELD => self.handle_get_fields(sender, it, false)?,
            msgtypes::DBSERVER_OBJECT_GET_FIELDS => self.handle_get_fields(sender, it, true)?,
            msgtypes::DBSERVER_OBJECT_SET_FIELD => self.handle_set_fields(it, 1)?,
            msgtypes::DBSERVER_OBJECT_SET_FIELDS => {
                let do_id = it.read_u32()?;
                let count = it.read_u16()?;
                self.apply_set_fields(do_id, count, it)?;
            }
            msgtypes::DBSERVER_OBJECT_SET_FIELD_IF_EQUALS => {
                self.handle_set_if_equals(sender, it)?
            }
            msgtypes::DBSERVER_OBJECT_SET_FIELDS_IF_EQUALS => {
                self.handle_set_fields_if_equals(sender, it)?
            }
            other => {
                debug!(msg_type = other, "Unhandled database message");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    fn handle_create(&mut self, sender: Channel, it: &mut DatagramIter<'_>) -> otp_proto::Result<()> {
        let ctx = it.read_u32()?;
        let class_number = it.read_u16()?;
        let field_count = it.read_u16()?;

        let do_id = self.create_object(class_number, field_count, it).unwrap_or(0);

        let mut dg =
            Datagram::server_header(sender, self.channel, msgtypes::DBSERVER_CREATE_OBJECT_RESP);
        dg.add_u32(ctx);
        dg.add_u32(do_id);
        self.link.send(dg);
        Ok(())
    }

    /// Returns the new doId, or `None` on any failure (reported as 0).
    fn create_object(
        &mut self,
        class_number: u16,
        field_count: u16,
        it: &mut DatagramIter<'_>,
    ) -> Option<u32> {
        let class = match self.catalog.class(class_number) {
            Some(class) => class.clone(),
            None => {
                warn!(class_number, "Create with unknown class");
                return None;
            }
        };

        let mut fields = BTreeMap::new();
        for _ in 0..field_count {
            let number = it.read_u16().ok()?;
            let Some(field) = class.field(number) else {
                warn!(class = %class.name, number, "Create names unknown field");
                return None;
            };
            let values = match field.unpack(it) {
                Ok(values) => values,
                Err(e) => {
                    warn!(field = %field.name, error = %e, "Create field failed to unpack");
                    return None;
                }
            };
            fields.insert(field.name.clone(), values);
        }

        // Declared durable fields with defaults fill in the gaps.
        for field in &class.fields {
            if !field.db || fields.contains_key(&field.name) {
                continue;
            }
            if let Some(default) = &field.default {
                fields.insert(field.name.clone(), default.clone());
            }
        }

        let do_id = self.allocator.allocate()? as u32;
        let obj = DbObject { dclass: class.name.clone(), do_id, fields };
        if let Err(e) = self.backend.save(&obj) {
            warn!(do_id, error = %e, "Failed to persist new object");
            return None;
        }
        self.backend.set_next_id(do_id + 1);
        info!(do_id, class = %class.name, "Object created");
        Some(do_id)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    fn load_with_class(&self, do_id: u32) -> Option<(DbObject, Arc<ClassSpec>)> {
        let obj = self.backend.load(do_id)?;
        let Some(class) = self.catalog.class_by_name(&obj.dclass) else {
            warn!(do_id, dclass = %obj.dclass, "Stored object has unknown class");
            return None;
        };
        let class = class.clone();
        Some((obj, class))
    }

    fn handle_get_all(&mut self, sender: Channel, it: &mut DatagramIter<'_>) -> otp_proto::Result<()> {
        let ctx = it.read_u32()?;
        let do_id = it.read_u32()?;

        let mut dg =
            Datagram::server_header(sender, self.channel, msgtypes::DBSERVER_OBJECT_GET_ALL_RESP);
        dg.add_u32(ctx);

        let Some((obj, class)) = self.load_with_class(do_id) else {
            debug!(do_id, "Query for unknown object");
            dg.add_u8(0);
            self.link.send(dg);
            return Ok(());
        };

        dg.add_u8(1);
        dg.add_u16(class.number);

        let mut packed = Vec::new();
        for field in &class.fields {
            let Some(values) = obj.fields.get(&field.name) else { continue };
            match field.pack(values) {
                Ok(bytes) => packed.push((field.number, bytes)),
                Err(e) => warn!(do_id, field = %field.name, error = %e, "Stored field failed to pack"),
            }
        }
        dg.add_u16(packed.len() as u16);
        for (number, bytes) in packed {
            dg.add_u16(number);
            dg.add_raw(&bytes);
        }
        self.link.send(dg);
        Ok(())
    }

    fn handle_get_fields(
        &mut self,
        sender: Channel,
        it: &mut DatagramIter<'_>,
        multi: bool,
    ) -> otp_proto::Result<()> {
        let ctx = it.read_u32()?;
        let do_id = it.read_u32()?;
        let count = if multi { it.read_u16()? } else { 1 };
        let mut numbers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            numbers.push(it.read_u16()?);
        }

        let resp_type = if multi {
            msgtypes::DBSERVER_OBJECT_GET_FIELDS_RESP
        } else {
            msgtypes::DBSERVER_OBJECT_GET_FIELD_RESP
        };
        let mut dg = Datagram::server_header(sender, self.channel, resp_type);
        dg.add_u32(ctx);

        let Some((obj, class)) = self.load_with_class(do_id) else {
            dg.add_u8(0);
            self.link.send(dg);
            return Ok(());
        };

        let mut packed = Vec::new();
        for number in numbers {
            let Some(field) = class.field(number) else { continue };
            let Some(values) = obj.fields.get(&field.name) else { continue };
            if let Ok(bytes) = field.pack(values) {
                packed.push((number, bytes));
            }
        }

        dg.add_u8(1);
        if multi {
            dg.add_u16(packed.len() as u16);
        }
        for (number, bytes) in packed {
            dg.add_u16(number);
            dg.add_raw(&bytes);
        }
        self.link.send(dg);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    fn handle_set_fields(&mut self, it: &mut DatagramIter<'_>, count: u16) -> otp_proto::Result<()> {
        let do_id = it.read_u32()?;
        self.apply_set_fields(do_id, count, it)
    }

    fn apply_set_fields(
        &mut self,
        do_id: u32,
        count: u16,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<()> {
        let Some((mut obj, class)) = self.load_with_class(do_id) else {
            warn!(do_id, "Set for unknown object");
            return Ok(());
        };

        for _ in 0..count {
            let number = it.read_u16()?;
            let Some(field) = class.field(number) else {
                warn!(do_id, number, "Set names unknown field");
                return Ok(());
            };
            match field.unpack(it) {
                Ok(values) => {
                    obj.fields.insert(field.name.clone(), values);
                }
                Err(e) => {
                    warn!(do_id, field = %field.name, error = %e, "Set field failed to unpack");
                    return Ok(());
                }
            }
        }

        if let Err(e) = self.backend.save(&obj) {
            warn!(do_id, error = %e, "Failed to persist object");
        }
        Ok(())
    }

    /// Compare-and-set: the stored value must equal the expected old value
    /// or the update is refused and the current value returned.
    fn handle_set_if_equals(
        &mut self,
        sender: Channel,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<()> {
        let ctx = it.read_u32()?;
        let do_id = it.read_u32()?;
        let number = it.read_u16()?;

        let mut dg = Datagram::server_header(
            sender,
            self.channel,
            msgtypes::DBSERVER_OBJECT_SET_FIELD_IF_EQUALS_RESP,
        );
        dg.add_u32(ctx);

        let Some((mut obj, class)) = self.load_with_class(do_id) else {
            dg.add_u8(0);
            self.link.send(dg);
            return Ok(());
        };
        let Some(field) = class.field(number) else {
            dg.add_u8(0);
            self.link.send(dg);
            return Ok(());
        };

        let old = match field.unpack(it) {
            Ok(v) => v,
            Err(e) => {
                warn!(do_id, field = %field.name, error = %e, "Compare-and-set failed to unpack old value");
                dg.add_u8(0);
                self.link.send(dg);
                return Ok(());
            }
        };
        let new = match field.unpack(it) {
            Ok(v) => v,
            Err(e) => {
                warn!(do_id, field = %field.name, error = %e, "Compare-and-set failed to unpack new value");
                dg.add_u8(0);
                self.link.send(dg);
                return Ok(());
            }
        };

        let current = obj.fields.get(&field.name).cloned().unwrap_or_default();
        if current == old {
            obj.fields.insert(field.name.clone(), new);
            if let Err(e) = self.backend.save(&obj) {
                warn!(do_id, error = %e, "Failed to persist object");
                dg.add_u8(0);
                self.link.send(dg);
                return Ok(());
            }
            dg.add_u8(1);
            self.link.send(dg);
        } else {
            debug!(do_id, field = %field.name, "Compare-and-set mismatch");
            dg.add_u8(0);
            dg.add_u16(number);
            if let Ok(bytes) = field.pack(&current) {
                dg.add_raw(&bytes);
            }
            self.link.send(dg);
        }
        Ok(())
    }

    /// Multi-field compare-and-set, all-or-nothing: any mismatching field
    /// refuses the whole update and is returned with its current value.
    fn handle_set_fields_if_equals(
        &mut self,
        sender: Channel,
        it: &mut DatagramIter<'_>,
    ) -> otp_proto::Result<()> {
        let ctx = it.read_u32()?;
        let do_id = it.read_u32()?;
        let count = it.read_u16()?;

        let mut dg = Datagram::server_header(
            sender,
            self.channel,
            msgtypes::DBSERVER_OBJECT_SET_FIELDS_IF_EQUALS_RESP,
        );
        dg.add_u32(ctx);

        let Some((mut obj, class)) = self.load_with_class(do_id) else {
            dg.add_u8(0);
            self.link.send(dg);
            return Ok(());
        };

        let mut updates = Vec::with_capacity(count as usize);
        let mut failing = Vec::new();
        for _ in 0..count {
            let number = it.read_u16()?;
            let Some(field) = class.field(number) else {
                dg.add_u8(0);
                self.link.send(dg);
                return Ok(());
            };
            let old = match field.unpack(it) {
                Ok(v) => v,
                Err(e) => {
                    warn!(do_id, field = %field.name, error = %e, "Compare-and-set failed to unpack old value");
                    dg.add_u8(0);
                    self.link.send(dg);
                    return Ok(());
                }
            };
            let new = match field.unpack(it) {
                Ok(v) => v,
                Err(e) => {
                    warn!(do_id, field = %field.name, error = %e, "Compare-and-set failed to unpack new value");
                    dg.add_u8(0);
                    self.link.send(dg);
                    return Ok(());
                }
            };

            let current = obj.fields.get(&field.name).cloned().unwrap_or_default();
            if current == old {
                updates.push((field.name.clone(), new));
            } else if let Ok(bytes) = field.pack(&current) {
                failing.push((number, bytes));
            }
        }

        if failing.is_empty() {
            for (name, values) in updates {
                obj.fields.insert(name, values);
            }
            if let Err(e) = self.backend.save(&obj) {
                warn!(do_id, error = %e, "Failed to persist object");
                dg.add_u8(0);
                self.link.send(dg);
                return Ok(());
            }
            dg.add_u8(1);
        } else {
            debug!(do_id, failing = failing.len(), "Compare-and-set mismatch");
            dg.add_u8(0);
            dg.add_u16(failing.len() as u16);
            for (number, bytes) in failing {
                dg.add_u16(number);
                dg.add_raw(&bytes);
            }
        }
        self.link.send(dg);
        Ok(())
    }
}
