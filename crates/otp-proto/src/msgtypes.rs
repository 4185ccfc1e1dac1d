//! Message-type catalog.
//!
//! One numeric namespace per direction: `CONTROL_*` frames are addressed to
//! the director itself, `STATESERVER_*`/`DBSERVER_*`/`CLIENTAGENT_*` ride
//! the internal bus, and `CLIENT_*` is the external client surface.

// ---------------------------------------------------------------------------
// Director control plane
// ---------------------------------------------------------------------------

pub const CONTROL_SET_CHANNEL: u16 = 9001;
pub const CONTROL_REMOVE_CHANNEL: u16 = 9002;
pub const CONTROL_SET_CON_NAME: u16 = 9004;
pub const CONTROL_SET_CON_URL: u16 = 9005;
pub const CONTROL_ADD_RANGE: u16 = 9008;
pub const CONTROL_REMOVE_RANGE: u16 = 9009;
pub const CONTROL_ADD_POST_REMOVE: u16 = 9010;
pub const CONTROL_CLEAR_POST_REMOVE: u16 = 9011;

// ---------------------------------------------------------------------------
// State server
// ---------------------------------------------------------------------------

pub const STATESERVER_ADD_SHARD: u16 = 2001;
pub const STATESERVER_UPDATE_SHARD: u16 = 2002;
pub const STATESERVER_REMOVE_SHARD: u16 = 2003;
pub const STATESERVER_GET_SHARD_ALL: u16 = 2004;
pub const STATESERVER_GET_SHARD_ALL_RESP: u16 = 2005;

pub const STATESERVER_OBJECT_GENERATE_WITH_REQUIRED: u16 = 2010;
pub const STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER: u16 = 2011;
pub const STATESERVER_OBJECT_UPDATE_FIELD: u16 = 2012;
pub const STATESERVER_OBJECT_DELETE_RAM: u16 = 2013;

pub const STATESERVER_OBJECT_SET_OWNER: u16 = 2020;
pub const STATESERVER_OBJECT_CHANGING_OWNER: u16 = 2021;
pub const STATESERVER_OBJECT_ENTER_OWNER_WITH_REQUIRED: u16 = 2022;
pub const STATESERVER_OBJECT_ENTER_OWNER_WITH_REQUIRED_OTHER: u16 = 2023;

pub const STATESERVER_OBJECT_SET_AI: u16 = 2030;
pub const STATESERVER_OBJECT_CHANGING_AI: u16 = 2031;
pub const STATESERVER_OBJECT_ENTER_AI_WITH_REQUIRED: u16 = 2032;
pub const STATESERVER_OBJECT_ENTER_AI_WITH_REQUIRED_OTHER: u16 = 2033;

pub const STATESERVER_OBJECT_SET_ZONE: u16 = 2040;
pub const STATESERVER_OBJECT_SET_LOCATION: u16 = 2041;
pub const STATESERVER_OBJECT_CHANGING_LOCATION: u16 = 2042;
pub const STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED: u16 = 2043;
pub const STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED_OTHER: u16 = 2044;
pub const STATESERVER_OBJECT_LOCATION_ACK: u16 = 2045;
pub const STATESERVER_OBJECT_GET_ZONES_OBJECTS: u16 = 2046;
pub const STATESERVER_OBJECT_GET_ZONES_OBJECTS_RESP: u16 = 2047;

// ---------------------------------------------------------------------------
// Database server
// ---------------------------------------------------------------------------

pub const DBSERVER_CREATE_OBJECT: u16 = 3001;
pub const DBSERVER_CREATE_OBJECT_RESP: u16 = 3002;
pub const DBSERVER_OBJECT_GET_ALL: u16 = 3003;
pub const DBSERVER_OBJECT_GET_ALL_RESP: u16 = 3004;
pub const DBSERVER_OBJECT_GET_FIELD: u16 = 3005;
pub const DBSERVER_OBJECT_GET_FIELD_RESP: u16 = 3006;
pub const DBSERVER_OBJECT_GET_FIELDS: u16 = 3007;
pub const DBSERVER_OBJECT_GET_FIELDS_RESP: u16 = 3008;
pub const DBSERVER_OBJECT_SET_FIELD: u16 = 3010;
pub const DBSERVER_OBJECT_SET_FIELDS: u16 = 3011;
pub const DBSERVER_OBJECT_SET_FIELD_IF_EQUALS: u16 = 3012;
pub const DBSERVER_OBJECT_SET_FIELD_IF_EQUALS_RESP: u16 = 3013;
pub const DBSERVER_OBJECT_SET_FIELDS_IF_EQUALS: u16 = 3014;
pub const DBSERVER_OBJECT_SET_FIELDS_IF_EQUALS_RESP: u16 = 3015;

// ---------------------------------------------------------------------------
// Client agent (internal side)
// ---------------------------------------------------------------------------

pub const CLIENTAGENT_DISCONNECT: u16 = 3101;
pub const CLIENTAGENT_FRIEND_ONLINE: u16 = 3102;
pub const CLIENTAGENT_FRIEND_OFFLINE: u16 = 3103;

// ---------------------------------------------------------------------------
// External client surface
// ---------------------------------------------------------------------------

pub const CLIENT_LOGIN_2: u16 = 3;
pub const CLIENT_LOGIN_2_RESP: u16 = 126;
pub const CLIENT_GET_AVATARS: u16 = 6;
pub const CLIENT_GET_AVATARS_RESP: u16 = 5;
pub const CLIENT_CREATE_AVATAR: u16 = 8;
pub const CLIENT_CREATE_AVATAR_RESP: u16 = 9;
pub const CLIENT_GET_SHARD_LIST: u16 = 10;
pub const CLIENT_GET_SHARD_LIST_RESP: u16 = 11;
pub const CLIENT_GET_FRIEND_LIST: u16 = 12;
pub const CLIENT_GET_FRIEND_LIST_RESP: u16 = 13;
pub const CLIENT_GET_AVATAR_DETAILS: u16 = 14;
pub const CLIENT_GET_AVATAR_DETAILS_RESP: u16 = 15;
pub const CLIENT_FRIEND_ONLINE: u16 = 16;
pub const CLIENT_FRIEND_OFFLINE: u16 = 17;
pub const CLIENT_REMOVE_FRIEND: u16 = 18;

pub const CLIENT_CREATE_OBJECT_REQUIRED: u16 = 34;
pub const CLIENT_CREATE_OBJECT_REQUIRED_OTHER: u16 = 35;
/// Same number both directions, as the original wire protocol has it.
pub const CLIENT_OBJECT_UPDATE_FIELD: u16 = 24;
pub const CLIENT_OBJECT_UPDATE_FIELD_RESP: u16 = 24;
pub const CLIENT_OBJECT_DELETE_RESP: u16 = 25;

pub const CLIENT_SET_ZONE: u16 = 29;
pub const CLIENT_DONE_SET_ZONE_RESP: u16 = 48;
pub const CLIENT_SET_SHARD: u16 = 49;
pub const CLIENT_GET_STATE_RESP: u16 = 47;
pub const CLIENT_SET_AVATAR: u16 = 32;
pub const CLIENT_DELETE_AVATAR: u16 = 56;
pub const CLIENT_DELETE_AVATAR_RESP: u16 = 57;
pub const CLIENT_SET_WISHNAME: u16 = 66;
pub const CLIENT_SET_WISHNAME_RESP: u16 = 67;
pub const CLIENT_SET_NAME_PATTERN: u16 = 68;
pub const CLIENT_SET_NAME_PATTERN_ANSWER: u16 = 69;

pub const CLIENT_DISCONNECT: u16 = 37;
pub const CLIENT_HEARTBEAT: u16 = 52;
pub const CLIENT_GO_GET_LOST: u16 = 4;

// ---------------------------------------------------------------------------
// Disconnect codes (CLIENT_GO_GET_LOST / CLIENTAGENT_DISCONNECT)
// ---------------------------------------------------------------------------

pub const CLIENT_DISCONNECT_INVALID_MSGTYPE: u16 = 106;
pub const CLIENT_DISCONNECT_TRUNCATED_DATAGRAM: u16 = 108;
pub const CLIENT_DISCONNECT_ANONYMOUS_VIOLATION: u16 = 113;
pub const CLIENT_DISCONNECT_INVALID_PLAY_TOKEN_TYPE: u16 = 122;
pub const CLIENT_DISCONNECT_BAD_VERSION: u16 = 124;
pub const CLIENT_DISCONNECT_BAD_DCHASH: u16 = 125;
pub const CLIENT_DISCONNECT_SHARD_CLOSED: u16 = 153;

// ---------------------------------------------------------------------------
// Login token types
// ---------------------------------------------------------------------------

pub const CLIENT_LOGIN_2_GREEN: i32 = 1;
pub const CLIENT_LOGIN_2_PLAY_TOKEN: i32 = 2;
pub const CLIENT_LOGIN_2_BLUE: i32 = 3;
