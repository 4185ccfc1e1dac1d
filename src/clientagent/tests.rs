//! Session behavior tests: the director link is an inspectable queue and
//! client frames are fed straight into the dispatch path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use otp_proto::{msgtypes, session_channel, Channel, Datagram, DatagramIter};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::accounts::TokenStore;
use super::names::NameDictionary;
use super::session::Session;
use super::Agent;
use crate::allocator::IdAllocator;
use crate::config::AgentConfig;
use crate::dclass::game_schema;
use crate::network::MdLink;
use crate::zones::{StaticVisibilityProvider, VisibilityProvider, QUIET_ZONE};

struct Harness {
    agent: Arc<Agent>,
    internal_rx: mpsc::UnboundedReceiver<Bytes>,
    _dir: tempfile::TempDir,
}

fn harness(vis: Arc<dyn VisibilityProvider>) -> Harness {
    let (link, internal_rx) = MdLink::test_pair();
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(game_schema());
    let config = AgentConfig { version: "test-version".to_string(), ..AgentConfig::default() };
    let expected_hash = catalog.hash();

    let agent = Arc::new(Agent {
        config,
        catalog,
        vis,
        link,
        sessions: DashMap::new(),
        channels: Mutex::new(IdAllocator::new(1_000_000_000, 1_000_000_100)),
        tokens: Mutex::new(TokenStore::open(dir.path().join("accounts.json")).unwrap()),
        names: NameDictionary::builtin(),
        expected_hash,
        started: Instant::now(),
    });
    Harness { agent, internal_rx, _dir: dir }
}

#[derive(Debug)]
struct Sent {
    dst: Channel,
    msg_type: u16,
    payload: Vec<u8>,
}

fn drain_internal(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Sent> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        let mut it = DatagramIter::new(&frame);
        let _ = it.read_u8().unwrap();
        let dst = it.read_u64().unwrap();
        if dst == otp_proto::CONTROL_MESSAGE {
            let ctl = it.read_u16().unwrap();
            let ch = it.read_u64().unwrap();
            out.push(Sent { dst: ch, msg_type: ctl, payload: it.take_remaining() });
            continue;
        }
        let _src = it.read_u64().unwrap();
        let msg_type = it.read_u16().unwrap();
        out.push(Sent { dst, msg_type, payload: it.take_remaining() });
    }
    out
}

fn client_frames(session: &mut Session) -> Vec<(u16, Vec<u8>)> {
    session
        .take_outbound()
        .into_iter()
        .map(|frame| {
            let mut it = DatagramIter::new(&frame);
            let msg_type = it.read_u16().unwrap();
            (msg_type, it.take_remaining())
        })
        .collect()
}

fn login_frame(token: &str, version: &str, hash: u32, token_type: i32) -> Vec<u8> {
    let mut dg = Datagram::client_header(msgtypes::CLIENT_LOGIN_2);
    dg.add_string(token);
    dg.add_string(version);
    dg.add_u32(hash);
    dg.add_i32(token_type);
    dg.freeze().to_vec()
}

fn internal_frame(dst: Channel, src: Channel, msg_type: u16, body: impl FnOnce(&mut Datagram)) -> Vec<u8> {
    let mut dg = Datagram::server_header(dst, src, msg_type);
    body(&mut dg);
    dg.freeze().to_vec()
}

/// An authenticated session with an activated avatar, bypassing the DB.
fn activated_session(h: &Harness, account: u32, avatar: u32) -> Session {
    let (mut session, _rx) = Session::new(Arc::clone(&h.agent), 1_000_000_000);
    session.authenticated = true;
    session.channel = session_channel(account, avatar);
    session
}

#[test]
fn login_with_bad_version_is_kicked() {
    let h = harness(Arc::new(StaticVisibilityProvider::empty()));
    let (mut session, _rx) = Session::new(Arc::clone(&h.agent), 1_000_000_000);

    let frame = login_frame("alice", "wrong", h.agent.expected_hash, msgtypes::CLIENT_LOGIN_2_BLUE);
    assert!(session.handle_client_frame(&frame));

    let sent = client_frames(&mut session);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, msgtypes::CLIENT_GO_GET_LOST);
    let mut it = DatagramIter::new(&sent[0].1);
    assert_eq!(it.read_u16().unwrap(), msgtypes::CLIENT_DISCONNECT_BAD_VERSION);
}

#[test]
fn login_with_bad_hash_is_kicked() {
    let h = harness(Arc::new(StaticVisibilityProvider::empty()));
    let (mut session, _rx) = Session::new(Arc::clone(&h.agent), 1_000_000_000);

    let frame = login_frame("alice", "test-version", 1, msgtypes::CLIENT_LOGIN_2_BLUE);
    assert!(session.handle_client_frame(&frame));

    let sent = client_frames(&mut session);
    let mut it = DatagramIter::new(&sent[0].1);
    assert_eq!(it.read_u16().unwrap(), msgtypes::CLIENT_DISCONNECT_BAD_DCHASH);
}

#[test]
fn unauthenticated_messages_violate() {
    let h = harness(Arc::new(StaticVisibilityProvider::empty()));
    let (mut session, _rx) = Session::new(Arc::clone(&h.agent), 1_000_000_000);

    let mut dg = Datagram::client_header(msgtypes::CLIENT_SET_ZONE);
    dg.add_u16(2000);
    assert!(session.handle_client_frame(dg.as_bytes()));

    let sent = client_frames(&mut session);
    let mut it = DatagramIter::new(&sent[0].1);
    assert_eq!(it.read_u16().unwrap(), msgtypes::CLIENT_DISCONNECT_ANONYMOUS_VIOLATION);
}

#[test]
fn heartbeat_is_always_welcome() {
    let h = harness(Arc::new(StaticVisibilityProvider::empty()));
    let (mut session, _rx) = Session::new(Arc::clone(&h.agent), 1_000_000_000);

    let dg = Datagram::client_header(msgtypes::CLIENT_HEARTBEAT);
    assert!(!session.handle_client_frame(dg.as_bytes()));
    assert!(client_frames(&mut session).is_empty());
}

#[test]
fn fresh_login_creates_account_and_binds_token() {
    let mut h = harness(Arc::new(StaticVisibilityProvider::empty()));
    let (mut session, _rx) = Session::new(Arc::clone(&h.agent), 1_000_000_000);

    let frame =
        login_frame("alice", "test-version", h.agent.expected_hash, msgtypes::CLIENT_LOGIN_2_BLUE);
    assert!(!session.handle_client_frame(&frame));

    // A create went to the database for the Account class.
    let sent = drain_internal(&mut h.internal_rx);
    let create = sent
        .iter()
        .find(|s| s.msg_type == msgtypes::DBSERVER_CREATE_OBJECT)
        .expect("account creation");
    assert_eq!(create.dst, otp_proto::DATABASE_CHANNEL);
    let mut it = DatagramIter::new(&create.payload);
    let ctx = it.read_u32().unwrap();
    let class = it.read_u16().unwrap();
    assert_eq!(class, h.agent.catalog.class_by_name("Account").unwrap().number);

    // Answer it: account id 100000000.
    let resp = internal_frame(1_000_000_000, otp_proto::DATABASE_CHANNEL,
        msgtypes::DBSERVER_CREATE_OBJECT_RESP, |dg| {
            dg.add_u32(ctx);
            dg.add_u32(100_000_000);
        });
    session.handle_internal_frame(&resp);

    assert!(session.authenticated);
    assert_eq!(session.channel, session_channel(100_000_000, 0));
    assert_eq!(h.agent.tokens.lock().get("alice"), Some(100_000_000));

    let replies = client_frames(&mut session);
    let login = replies
        .iter()
        .find(|(t, _)| *t == msgtypes::CLIENT_LOGIN_2_RESP)
        .expect("login response");
    let mut it = DatagramIter::new(&login.1);
    assert_eq!(it.read_u8().unwrap(), 0);
    assert_eq!(it.read_string().unwrap(), "All Ok");
    assert_eq!(it.read_string().unwrap(), "alice");
}

#[test]
fn returning_login_queries_instead_of_creating() {
    let mut h = harness(Arc::new(StaticVisibilityProvider::empty()));
    h.agent.tokens.lock().set("bob", 42);
    let (mut session, _rx) = Session::new(Arc::clone(&h.agent), 1_000_000_000);

    let frame =
        login_frame("bob", "test-version", h.agent.expected_hash, msgtypes::CLIENT_LOGIN_2_BLUE);
    session.handle_client_frame(&frame);

    let sent = drain_internal(&mut h.internal_rx);
    assert!(sent.iter().any(|s| s.msg_type == msgtypes::DBSERVER_OBJECT_GET_ALL));
    assert!(!sent.iter().any(|s| s.msg_type == msgtypes::DBSERVER_CREATE_OBJECT));
}

#[tokio::test]
async fn playground_zone_change_builds_interest_and_replies() {
    let mut h = harness(Arc::new(StaticVisibilityProvider::empty()));
    let mut session = activated_session(&h, 1, 500);

    // Client asks for zone 2000; the agent forwards a SET_ZONE.
    let mut dg = Datagram::client_header(msgtypes::CLIENT_SET_ZONE);
    dg.add_u16(2000);
    session.handle_client_frame(dg.as_bytes());
    let sent = drain_internal(&mut h.internal_rx);
    assert!(sent
        .iter()
        .any(|s| s.dst == 500 && s.msg_type == msgtypes::STATESERVER_OBJECT_SET_ZONE));

    // The state server acks the move (0,0) -> (shard, 2000).
    let ack = internal_frame(session.channel, 500, msgtypes::STATESERVER_OBJECT_LOCATION_ACK, |dg| {
        dg.add_u32(500);
        dg.add_u32(0);
        dg.add_u32(0);
        dg.add_u32(7000);
        dg.add_u32(2000);
    });
    session.handle_internal_frame(&ack);

    // Interest is the playground plus the quiet zone, and the expected-id
    // request names exactly those zones.
    assert!(session.interest.has(2000));
    assert!(session.interest.has(QUIET_ZONE));
    assert_eq!(session.interest.len(), 2);

    let sent = drain_internal(&mut h.internal_rx);
    let request = sent
        .iter()
        .find(|s| s.msg_type == msgtypes::STATESERVER_OBJECT_GET_ZONES_OBJECTS)
        .expect("zones request");
    let mut it = DatagramIter::new(&request.payload);
    let count = it.read_u16().unwrap();
    let mut zones = Vec::new();
    for _ in 0..count {
        zones.push(it.read_u32().unwrap());
    }
    zones.sort_unstable();
    assert_eq!(zones, vec![QUIET_ZONE, 2000]);

    // Two residents are expected; the first-entry reply goes out now.
    let resp = internal_frame(session.channel, 500,
        msgtypes::STATESERVER_OBJECT_GET_ZONES_OBJECTS_RESP, |dg| {
            dg.add_u64(500);
            dg.add_u16(2);
            dg.add_u64(600);
            dg.add_u64(601);
        });
    session.handle_internal_frame(&resp);
    assert!(session.pending.contains(&600) && session.pending.contains(&601));

    let replies = client_frames(&mut session);
    assert!(replies.iter().any(|(t, _)| *t == msgtypes::CLIENT_DONE_SET_ZONE_RESP));

    // Both generates arrive; the handshake completes with a second reply.
    for (do_id, tail) in [(600u32, "one"), (601, "two")] {
        let enter = internal_frame(session.channel, do_id as Channel,
            msgtypes::STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED, |dg| {
                dg.add_u64(do_id as u64);
                dg.add_u64(7000);
                dg.add_u32(2000);
                dg.add_u16(3); // District
                dg.add_string(tail);
            });
        session.handle_internal_frame(&enter);
    }

    assert!(session.pending.is_empty());
    let replies = client_frames(&mut session);
    let creates = replies
        .iter()
        .filter(|(t, _)| *t == msgtypes::CLIENT_CREATE_OBJECT_REQUIRED)
        .count();
    assert_eq!(creates, 2);
    assert!(replies.iter().any(|(t, _)| *t == msgtypes::CLIENT_DONE_SET_ZONE_RESP));
    assert!(session.is_seen(600) && session.is_seen(601));
}

#[tokio::test]
async fn street_visibility_delta_drops_stale_zones() {
    let vis = StaticVisibilityProvider::empty().with_branch(
        1100,
        HashMap::from([
            (1100u32, vec![1100, 1101, 1102]),
            (1101, vec![1101, 1100]),
        ]),
    );
    let mut h = harness(Arc::new(vis));
    let mut session = activated_session(&h, 1, 500);

    // Enter street zone 1100.
    let ack = internal_frame(session.channel, 500, msgtypes::STATESERVER_OBJECT_LOCATION_ACK, |dg| {
        dg.add_u32(500);
        dg.add_u32(0);
        dg.add_u32(0);
        dg.add_u32(7000);
        dg.add_u32(1100);
    });
    let mut dg = Datagram::client_header(msgtypes::CLIENT_SET_ZONE);
    dg.add_u16(1100);
    session.handle_client_frame(dg.as_bytes());
    session.handle_internal_frame(&ack);

    let mut expected: Vec<u32> = vec![QUIET_ZONE, 1100, 1101, 1102];
    let mut have: Vec<u32> = session.interest.iter().collect();
    have.sort_unstable();
    expected.sort_unstable();
    assert_eq!(have, expected);

    // An object shows up in 1102.
    let enter = internal_frame(session.channel, 700,
        msgtypes::STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED, |dg| {
            dg.add_u64(700);
            dg.add_u64(7000);
            dg.add_u32(1102);
            dg.add_u16(3);
            dg.add_string("prop");
        });
    session.handle_internal_frame(&enter);
    assert!(session.is_seen(700));
    drain_internal(&mut h.internal_rx);
    client_frames(&mut session);

    // Sidestep to 1101: 1102 leaves the interest set and its object dies.
    let mut dg = Datagram::client_header(msgtypes::CLIENT_SET_ZONE);
    dg.add_u16(1101);
    session.handle_client_frame(dg.as_bytes());
    let ack = internal_frame(session.channel, 500, msgtypes::STATESERVER_OBJECT_LOCATION_ACK, |dg| {
        dg.add_u32(500);
        dg.add_u32(7000);
        dg.add_u32(1100);
        dg.add_u32(7000);
        dg.add_u32(1101);
    });
    session.handle_internal_frame(&ack);

    assert!(!session.interest.has(1102));
    assert!(session.interest.has(1100));
    assert!(session.interest.has(1101));

    let replies = client_frames(&mut session);
    let deletes: Vec<&(u16, Vec<u8>)> = replies
        .iter()
        .filter(|(t, _)| *t == msgtypes::CLIENT_OBJECT_DELETE_RESP)
        .collect();
    assert_eq!(deletes.len(), 1);
    let mut it = DatagramIter::new(&deletes[0].1);
    assert_eq!(it.read_u32().unwrap(), 700);
    assert!(!session.is_seen(700));
}

#[test]
fn avatar_generates_never_surface_in_the_quiet_zone() {
    let h = harness(Arc::new(StaticVisibilityProvider::empty()));
    let mut session = activated_session(&h, 1, 500);
    session.interest.add(QUIET_ZONE);

    let avatar_class = h.agent.catalog.class_by_name("Avatar").unwrap().number;
    let enter = internal_frame(session.channel, 600,
        msgtypes::STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED, |dg| {
            dg.add_u64(600);
            dg.add_u64(7000);
            dg.add_u32(QUIET_ZONE);
            dg.add_u16(avatar_class);
            dg.add_string("ghost");
        });
    session.handle_internal_frame(&enter);

    assert!(client_frames(&mut session).is_empty());
    assert!(!session.is_seen(600));
}

#[test]
fn owner_entry_becomes_client_create_and_owned() {
    let h = harness(Arc::new(StaticVisibilityProvider::empty()));
    let mut session = activated_session(&h, 1, 500);

    let avatar_class = h.agent.catalog.class_by_name("Avatar").unwrap().number;
    let enter = internal_frame(session.channel, 500,
        msgtypes::STATESERVER_OBJECT_ENTER_OWNER_WITH_REQUIRED_OTHER, |dg| {
            dg.add_u64(500);
            dg.add_u64(0);
            dg.add_u32(0);
            dg.add_u16(avatar_class);
            dg.add_string("self");
        });
    session.handle_internal_frame(&enter);

    assert!(session.owned.contains(&500));
    let replies = client_frames(&mut session);
    assert_eq!(replies[0].0, msgtypes::CLIENT_CREATE_OBJECT_REQUIRED_OTHER);
    let mut it = DatagramIter::new(&replies[0].1);
    assert_eq!(it.read_u16().unwrap(), avatar_class);
    assert_eq!(it.read_u32().unwrap(), 500);
}

#[test]
fn updates_forward_only_for_known_objects() {
    let h = harness(Arc::new(StaticVisibilityProvider::empty()));
    let mut session = activated_session(&h, 1, 500);

    let update = internal_frame(session.channel, 600,
        msgtypes::STATESERVER_OBJECT_UPDATE_FIELD, |dg| {
            dg.add_u32(600);
            dg.add_u16(120);
            dg.add_string("hello");
        });
    session.handle_internal_frame(&update);
    assert!(client_frames(&mut session).is_empty(), "unknown object is muted");

    session.pending.insert(600);
    session.handle_internal_frame(&update);
    let replies = client_frames(&mut session);
    assert_eq!(replies[0].0, msgtypes::CLIENT_OBJECT_UPDATE_FIELD_RESP);
}

#[test]
fn cluster_disconnect_is_relayed_with_its_code() {
    let h = harness(Arc::new(StaticVisibilityProvider::empty()));
    let mut session = activated_session(&h, 1, 500);

    let kick = internal_frame(session.channel, otp_proto::STATE_SERVER_CHANNEL,
        msgtypes::CLIENTAGENT_DISCONNECT, |dg| {
            dg.add_u16(msgtypes::CLIENT_DISCONNECT_SHARD_CLOSED);
            dg.add_string("shard gone");
        });
    assert!(session.handle_internal_frame(&kick));

    let replies = client_frames(&mut session);
    assert_eq!(replies[0].0, msgtypes::CLIENT_GO_GET_LOST);
    let mut it = DatagramIter::new(&replies[0].1);
    assert_eq!(it.read_u16().unwrap(), msgtypes::CLIENT_DISCONNECT_SHARD_CLOSED);
}
