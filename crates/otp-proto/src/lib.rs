//! Wire protocol for the otpd cluster.
//!
//! Every internal link (peer ↔ message director) and every external link
//! (game client ↔ client agent) carries length-prefixed datagrams. This
//! crate owns the datagram buffer/cursor types, the tokio codec for the
//! length prefix, the 64-bit channel space with its derived addresses, and
//! the message-type catalog shared by all four services.

mod channels;
mod codec;
mod datagram;
mod error;
pub mod msgtypes;

pub use channels::{
    account_connection_channel, account_id_from_channel, avatar_id_from_channel,
    puppet_connection_channel, session_channel, Channel, CLIENT_AGENT_CHANNEL, CONTROL_MESSAGE,
    DATABASE_CHANNEL, STATE_SERVER_CHANNEL,
};
pub use codec::DatagramCodec;
pub use datagram::{Datagram, DatagramIter};
pub use error::{ProtocolError, Result};
