//! Default values for configuration options.

use std::net::{Ipv4Addr, SocketAddr};

pub(super) fn default_md_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 7100))
}

pub(super) fn default_ca_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 6667))
}

pub(super) fn default_connect_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 7100))
}

pub(super) fn default_flush_timeout() -> f64 {
    0.001
}

pub(super) fn default_queue_limit() -> usize {
    16384
}

pub(super) fn default_version() -> String {
    "no-version".to_string()
}

pub(super) fn default_min_channels() -> u64 {
    1_000_000_000
}

pub(super) fn default_max_channels() -> u64 {
    1_009_999_999
}

pub(super) fn default_interest_timeout() -> f64 {
    2.5
}

pub(super) fn default_dbm_filename() -> String {
    "databases/accounts.json".to_string()
}

pub(super) fn default_database_directory() -> String {
    "databases/json".to_string()
}

pub(super) fn default_database_extension() -> String {
    ".json".to_string()
}

pub(super) fn default_database_tracker() -> String {
    "next".to_string()
}

pub(super) fn default_min_ids() -> u32 {
    100_000_000
}

pub(super) fn default_max_ids() -> u32 {
    399_999_999
}
