//! State-server behavior tests driven through the frame interface, with
//! the director link replaced by an inspectable queue.

use std::sync::Arc;

use bytes::Bytes;
use otp_proto::{msgtypes, session_channel, Channel, Datagram, DatagramIter};
use tokio::sync::mpsc;

use super::StateServer;
use crate::dclass::{game_schema, FieldValue};
use crate::network::MdLink;

const SS_CHANNEL: Channel = otp_proto::STATE_SERVER_CHANNEL;
const SHARD: Channel = 401_000_000;

/// A decoded outbound frame.
#[derive(Debug)]
struct Sent {
    dst: Channel,
    src: Channel,
    msg_type: u16,
    payload: Vec<u8>,
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Sent> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        let mut it = DatagramIter::new(&frame);
        let _ = it.read_u8().unwrap();
        let dst = it.read_u64().unwrap();
        // Control frames have no sender; only SET/REMOVE_CHANNEL appear here.
        if dst == otp_proto::CONTROL_MESSAGE {
            let ctl = it.read_u16().unwrap();
            let ch = it.read_u64().unwrap();
            out.push(Sent { dst, src: ch, msg_type: ctl, payload: Vec::new() });
            continue;
        }
        let src = it.read_u64().unwrap();
        let msg_type = it.read_u16().unwrap();
        out.push(Sent { dst, src, msg_type, payload: it.take_remaining() });
    }
    out
}

fn server() -> (StateServer, mpsc::UnboundedReceiver<Bytes>) {
    let (link, rx) = MdLink::test_pair();
    (StateServer::new(SS_CHANNEL, link, Arc::new(game_schema())), rx)
}

fn avatar_generate_frame(do_id: u32, sender: Channel) -> Bytes {
    let catalog = game_schema();
    let class = catalog.class_by_name("Avatar").unwrap();
    let mut dg = Datagram::server_header(
        SS_CHANNEL,
        sender,
        msgtypes::STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER,
    );
    dg.add_u32(do_id);
    dg.add_u32(0);
    dg.add_u32(0);
    dg.add_u16(class.number);
    for (name, value) in [
        ("setName", FieldValue::Str(format!("avatar-{do_id}"))),
        ("setDNAString", FieldValue::Str("dna".into())),
    ] {
        let field = class.field_by_name(name).unwrap();
        dg.add_raw(&field.pack(&[value]).unwrap());
    }
    let pos = class.field_by_name("setPosIndex").unwrap();
    dg.add_raw(&pos.pack(&[FieldValue::U8(0)]).unwrap());
    dg.add_u16(0); // empty other block
    dg.freeze()
}

fn object_frame(do_id: u32, sender: Channel, msg_type: u16, body: impl FnOnce(&mut Datagram)) -> Bytes {
    let mut dg = Datagram::server_header(do_id as Channel, sender, msg_type);
    body(&mut dg);
    dg.freeze()
}

fn add_shard_frame() -> Bytes {
    let mut dg = Datagram::server_header(SS_CHANNEL, SHARD, msgtypes::STATESERVER_ADD_SHARD);
    dg.add_u32(90);
    dg.add_string("District Alpha");
    dg.add_u32(0);
    dg.freeze()
}

/// Bring one owned avatar into (SHARD, zone).
fn activate_avatar(
    ss: &mut StateServer,
    do_id: u32,
    account: u32,
    zone: u32,
) -> Channel {
    let owner = session_channel(account, do_id);
    ss.handle_frame(&avatar_generate_frame(do_id, owner));
    ss.handle_frame(&object_frame(do_id, owner, msgtypes::STATESERVER_OBJECT_SET_OWNER, |dg| {
        dg.add_u64(owner);
    }));
    ss.handle_frame(&object_frame(do_id, owner, msgtypes::STATESERVER_OBJECT_SET_AI, |dg| {
        dg.add_u64(SHARD);
    }));
    ss.handle_frame(&object_frame(do_id, owner, msgtypes::STATESERVER_OBJECT_SET_ZONE, |dg| {
        dg.add_u32(zone);
    }));
    owner
}

#[test]
fn generate_registers_object_channel() {
    let (mut ss, mut rx) = server();
    ss.handle_frame(&avatar_generate_frame(500, session_channel(1, 500)));

    let sent = drain(&mut rx);
    assert!(sent
        .iter()
        .any(|s| s.msg_type == msgtypes::CONTROL_SET_CHANNEL && s.src == 500));
}

#[test]
fn duplicate_generate_is_ignored() {
    let (mut ss, mut rx) = server();
    ss.handle_frame(&avatar_generate_frame(500, session_channel(1, 500)));
    drain(&mut rx);
    ss.handle_frame(&avatar_generate_frame(500, session_channel(1, 500)));
    // No second channel registration, no fan-out.
    assert!(drain(&mut rx).is_empty());
}

#[test]
fn owner_entry_carries_all_required_fields() {
    let (mut ss, mut rx) = server();
    let owner = session_channel(1, 500);
    ss.handle_frame(&avatar_generate_frame(500, owner));
    drain(&mut rx);

    ss.handle_frame(&object_frame(500, owner, msgtypes::STATESERVER_OBJECT_SET_OWNER, |dg| {
        dg.add_u64(owner);
    }));

    let sent = drain(&mut rx);
    let entry = sent
        .iter()
        .find(|s| s.msg_type == msgtypes::STATESERVER_OBJECT_ENTER_OWNER_WITH_REQUIRED_OTHER)
        .expect("owner entry");
    assert_eq!(entry.dst, owner);

    let dg = Datagram::from(&entry.payload[..]);
    let mut it = dg.iter();
    assert_eq!(it.read_u64().unwrap(), 500);
    assert_eq!(it.read_u64().unwrap(), 0); // parent
    assert_eq!(it.read_u32().unwrap(), 0); // zone
    let class = it.read_u16().unwrap();
    assert_eq!(class, game_schema().class_by_name("Avatar").unwrap().number);
    // All three required fields follow, including the non-broadcast
    // setPosIndex.
    assert_eq!(it.read_string().unwrap(), "avatar-500");
    assert_eq!(it.read_string().unwrap(), "dna");
    assert_eq!(it.read_u8().unwrap(), 0);
}

#[test]
fn two_players_in_one_zone_see_each_other_once() {
    let (mut ss, mut rx) = server();
    ss.handle_frame(&add_shard_frame());

    let owner_a = activate_avatar(&mut ss, 500, 1, 2000);
    drain(&mut rx);
    let owner_b = activate_avatar(&mut ss, 501, 2, 2000);
    let sent = drain(&mut rx);

    // A, an established observer, hears about B's arrival exactly once.
    let enters_to_a: Vec<&Sent> = sent
        .iter()
        .filter(|s| {
            s.dst == owner_a
                && s.msg_type == msgtypes::STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED_OTHER
        })
        .collect();
    assert_eq!(enters_to_a.len(), 1, "A sees exactly B's arrival");
    let mut it = DatagramIter::new(&enters_to_a[0].payload);
    assert_eq!(it.read_u64().unwrap(), 501);

    // B's own view arrives through the expected-id exchange.
    let mut dg = Datagram::server_header(
        501,
        owner_b,
        msgtypes::STATESERVER_OBJECT_GET_ZONES_OBJECTS,
    );
    dg.add_u16(2);
    dg.add_u32(2000);
    dg.add_u32(1);
    ss.handle_frame(&dg.freeze());

    let sent = drain(&mut rx);
    let enters_to_b: Vec<&Sent> = sent
        .iter()
        .filter(|s| {
            s.dst == owner_b
                && s.msg_type == msgtypes::STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED_OTHER
        })
        .collect();
    assert_eq!(enters_to_b.len(), 1, "B sees exactly A");
    let mut it = DatagramIter::new(&enters_to_b[0].payload);
    assert_eq!(it.read_u64().unwrap(), 500);
}

#[test]
fn location_ack_is_emitted_after_all_fanout() {
    let (mut ss, mut rx) = server();
    ss.handle_frame(&add_shard_frame());
    let owner_a = activate_avatar(&mut ss, 500, 1, 2000);
    drain(&mut rx);

    let owner_b = activate_avatar(&mut ss, 501, 2, 2000);
    let sent = drain(&mut rx);

    // The final ack belongs to B's zone transition; SET_AI acks earlier.
    let ack_pos = sent
        .iter()
        .rposition(|s| {
            s.dst == owner_b && s.msg_type == msgtypes::STATESERVER_OBJECT_LOCATION_ACK
        })
        .expect("location ack");
    let enter_pos = sent
        .iter()
        .position(|s| {
            s.dst == owner_a
                && s.msg_type == msgtypes::STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED_OTHER
        })
        .expect("enter fan-out to the observer");
    assert!(enter_pos < ack_pos, "fan-out precedes the ack");
}

#[test]
fn zone_departure_sends_delete_to_old_observers() {
    let (mut ss, mut rx) = server();
    ss.handle_frame(&add_shard_frame());
    let owner_a = activate_avatar(&mut ss, 500, 1, 2000);
    let owner_b = activate_avatar(&mut ss, 501, 2, 2000);
    drain(&mut rx);

    // B moves to another playground; A, still watching zone 2000, must
    // see B leave. B's own cleanup is the agent's bookkeeping.
    ss.handle_frame(&object_frame(501, owner_b, msgtypes::STATESERVER_OBJECT_SET_ZONE, |dg| {
        dg.add_u32(3000);
    }));
    let sent = drain(&mut rx);

    let deletes_to_a = sent
        .iter()
        .filter(|s| {
            s.dst == owner_a
                && s.msg_type == msgtypes::STATESERVER_OBJECT_DELETE_RAM
                && DatagramIter::new(&s.payload).read_u32().unwrap() == 501
        })
        .count();
    assert_eq!(deletes_to_a, 1);
}

#[test]
fn delete_fans_out_departure_exactly_once() {
    let (mut ss, mut rx) = server();
    ss.handle_frame(&add_shard_frame());
    let owner_a = activate_avatar(&mut ss, 500, 1, 2000);
    let _owner_b = activate_avatar(&mut ss, 501, 2, 2000);
    drain(&mut rx);

    // DELETE_RAM is dispatched by payload doId on the well-known channel.
    let mut dg = Datagram::server_header(SS_CHANNEL, 0, msgtypes::STATESERVER_OBJECT_DELETE_RAM);
    dg.add_u32(501);
    ss.handle_frame(&dg.freeze());

    let sent = drain(&mut rx);
    let deletes_to_a = sent
        .iter()
        .filter(|s| {
            s.dst == owner_a
                && s.msg_type == msgtypes::STATESERVER_OBJECT_DELETE_RAM
                && DatagramIter::new(&s.payload).read_u32().unwrap() == 501
        })
        .count();
    assert_eq!(deletes_to_a, 1);
    assert!(sent
        .iter()
        .any(|s| s.msg_type == msgtypes::CONTROL_REMOVE_CHANNEL && s.src == 501));
}

#[test]
fn broadcast_update_reaches_observers_but_not_sender() {
    let (mut ss, mut rx) = server();
    ss.handle_frame(&add_shard_frame());
    let owner_a = activate_avatar(&mut ss, 500, 1, 2000);
    let owner_b = activate_avatar(&mut ss, 501, 2, 2000);
    drain(&mut rx);

    // A chats: clsend + broadcast on the avatar class.
    let catalog = game_schema();
    let avatar = catalog.class_by_name("Avatar").unwrap();
    let talk = avatar.field_by_name("setTalk").unwrap();
    let payload = talk.pack(&[FieldValue::Str("hello".into())]).unwrap();

    let mut dg =
        Datagram::server_header(500, owner_a, msgtypes::STATESERVER_OBJECT_UPDATE_FIELD);
    dg.add_u32(500);
    dg.add_u16(talk.number);
    dg.add_raw(&payload);
    ss.handle_frame(&dg.freeze());

    let sent = drain(&mut rx);
    let updates_to_b = sent
        .iter()
        .filter(|s| s.dst == owner_b && s.msg_type == msgtypes::STATESERVER_OBJECT_UPDATE_FIELD)
        .collect::<Vec<_>>();
    assert_eq!(updates_to_b.len(), 1);
    let mut it = DatagramIter::new(&updates_to_b[0].payload);
    assert_eq!(it.read_u32().unwrap(), 500);
    assert_eq!(it.read_u16().unwrap(), talk.number);

    assert!(
        !sent
            .iter()
            .any(|s| s.dst == owner_a && s.msg_type == msgtypes::STATESERVER_OBJECT_UPDATE_FIELD),
        "the sender hears nothing back"
    );
}

#[test]
fn non_sendable_field_is_dropped_at_the_gate() {
    let (mut ss, mut rx) = server();
    ss.handle_frame(&add_shard_frame());
    let owner_a = activate_avatar(&mut ss, 500, 1, 2000);
    let _owner_b = activate_avatar(&mut ss, 501, 2, 2000);
    drain(&mut rx);

    let catalog = game_schema();
    let avatar = catalog.class_by_name("Avatar").unwrap();
    let experience = avatar.field_by_name("setExperience").unwrap();
    let payload = experience.pack(&[FieldValue::U32(9999)]).unwrap();

    let mut dg =
        Datagram::server_header(500, owner_a, msgtypes::STATESERVER_OBJECT_UPDATE_FIELD);
    dg.add_u32(500);
    dg.add_u16(experience.number);
    dg.add_raw(&payload);
    ss.handle_frame(&dg.freeze());

    assert!(drain(&mut rx).is_empty(), "no echo, no fan-out, no db write");
}

#[test]
fn ownsend_rejected_from_non_owner() {
    let (mut ss, mut rx) = server();
    ss.handle_frame(&add_shard_frame());
    let _owner_a = activate_avatar(&mut ss, 500, 1, 2000);
    let owner_b = activate_avatar(&mut ss, 501, 2, 2000);
    drain(&mut rx);

    let catalog = game_schema();
    let avatar = catalog.class_by_name("Avatar").unwrap();
    let anim = avatar.field_by_name("setAnimState").unwrap();
    let payload = anim.pack(&[FieldValue::Str("run".into())]).unwrap();

    // B tries to animate A's avatar.
    let mut dg =
        Datagram::server_header(500, owner_b, msgtypes::STATESERVER_OBJECT_UPDATE_FIELD);
    dg.add_u32(500);
    dg.add_u16(anim.number);
    dg.add_raw(&payload);
    ss.handle_frame(&dg.freeze());

    assert!(drain(&mut rx).is_empty());
}

#[test]
fn ai_db_field_update_is_forwarded_to_database() {
    let (mut ss, mut rx) = server();
    ss.handle_frame(&add_shard_frame());
    let _owner = activate_avatar(&mut ss, 500, 1, 2000);
    drain(&mut rx);

    let catalog = game_schema();
    let avatar = catalog.class_by_name("Avatar").unwrap();
    let experience = avatar.field_by_name("setExperience").unwrap();
    let payload = experience.pack(&[FieldValue::U32(10)]).unwrap();

    let mut dg = Datagram::server_header(500, SHARD, msgtypes::STATESERVER_OBJECT_UPDATE_FIELD);
    dg.add_u32(500);
    dg.add_u16(experience.number);
    dg.add_raw(&payload);
    ss.handle_frame(&dg.freeze());

    let sent = drain(&mut rx);
    assert!(sent.iter().any(|s| {
        s.dst == otp_proto::DATABASE_CHANNEL
            && s.msg_type == msgtypes::DBSERVER_OBJECT_SET_FIELD
    }));
}

#[test]
fn shard_removal_disconnects_owners_and_drops_objects() {
    let (mut ss, mut rx) = server();
    ss.handle_frame(&add_shard_frame());
    let owner_a = activate_avatar(&mut ss, 500, 1, 2000);
    let owner_b = activate_avatar(&mut ss, 501, 2, 2000);
    drain(&mut rx);

    let dg = Datagram::server_header(SS_CHANNEL, SHARD, msgtypes::STATESERVER_REMOVE_SHARD);
    ss.handle_frame(&dg.freeze());

    let sent = drain(&mut rx);
    for owner in [owner_a, owner_b] {
        let disconnect = sent
            .iter()
            .find(|s| s.dst == owner && s.msg_type == msgtypes::CLIENTAGENT_DISCONNECT)
            .expect("owner disconnected");
        let mut it = DatagramIter::new(&disconnect.payload);
        assert_eq!(it.read_u16().unwrap(), msgtypes::CLIENT_DISCONNECT_SHARD_CLOSED);
    }

    // A follow-up shard query reports an empty cluster.
    let dg = Datagram::server_header(SS_CHANNEL, 777, msgtypes::STATESERVER_GET_SHARD_ALL);
    ss.handle_frame(&dg.freeze());
    let sent = drain(&mut rx);
    let resp = sent
        .iter()
        .find(|s| s.msg_type == msgtypes::STATESERVER_GET_SHARD_ALL_RESP)
        .unwrap();
    let mut it = DatagramIter::new(&resp.payload);
    assert_eq!(it.read_u16().unwrap(), 0);
}

#[test]
fn get_zones_objects_lists_coparented_objects() {
    let (mut ss, mut rx) = server();
    ss.handle_frame(&add_shard_frame());
    let owner_a = activate_avatar(&mut ss, 500, 1, 2000);
    let _owner_b = activate_avatar(&mut ss, 501, 2, 2000);
    let _owner_c = activate_avatar(&mut ss, 502, 3, 3000);
    drain(&mut rx);

    let mut dg = Datagram::server_header(
        500,
        owner_a,
        msgtypes::STATESERVER_OBJECT_GET_ZONES_OBJECTS,
    );
    dg.add_u16(2);
    dg.add_u32(2000);
    dg.add_u32(9999); // an empty zone
    ss.handle_frame(&dg.freeze());

    let sent = drain(&mut rx);
    let resp = sent
        .iter()
        .find(|s| s.msg_type == msgtypes::STATESERVER_OBJECT_GET_ZONES_OBJECTS_RESP)
        .expect("zones resp");
    assert_eq!(resp.dst, owner_a);
    let mut it = DatagramIter::new(&resp.payload);
    assert_eq!(it.read_u64().unwrap(), 500);
    assert_eq!(it.read_u16().unwrap(), 1);
    assert_eq!(it.read_u64().unwrap(), 501);
}
