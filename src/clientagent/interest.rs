//! The client-side interest set.
//!
//! A session's interest is the set of zones whose object events the agent
//! forwards. The quiet zone rides along as a sentinel whenever any real
//! zone is subscribed.

use std::collections::HashSet;

use crate::zones::QUIET_ZONE;

#[derive(Debug, Default)]
pub struct InterestZones {
    zones: HashSet<u32>,
}

impl InterestZones {
    pub fn has(&self, zone: u32) -> bool {
        self.zones.contains(&zone)
    }

    pub fn add(&mut self, zone: u32) {
        if zone != QUIET_ZONE {
            self.zones.insert(QUIET_ZONE);
        }
        self.zones.insert(zone);
    }

    pub fn remove(&mut self, zone: u32) {
        self.zones.remove(&zone);
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.zones.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn clear(&mut self) {
        self.zones.clear();
    }
}
