//! The Link-State Database: one entry per (type, link-state-id,
//! advertising-router) triple, aged at 1 Hz. Entries reaching MaxAge are
//! handed back for one final flood and then removed.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::Ipv4Addr;

use log::trace;

use super::lsa::{Lsa, LsaHeader, LsaKey};
use super::{INITIAL_SEQUENCE, LS_REFRESH_TIME, MAX_AGE, MAX_SEQUENCE};

#[derive(Debug, Default)]
pub struct Lsdb {
    entries: HashMap<LsaKey, Lsa>,
}

impl Lsdb {
    pub fn get(&self, key: &LsaKey) -> Option<&Lsa> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &LsaKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lsas(&self) -> impl Iterator<Item = &Lsa> {
        self.entries.values()
    }

    pub fn headers(&self) -> Vec<LsaHeader> {
        self.entries.values().map(|lsa| lsa.header).collect()
    }

    /// Install an LSA, replacing any older instance. Returns false when
    /// the database copy was already as recent.
    pub fn install(&mut self, lsa: Lsa) -> bool {
        let key = lsa.key();
        match self.entries.get(&key) {
            Some(existing)
                if existing.header.compare_newness(&lsa.header) != Ordering::Less =>
            {
                false
            }
            _ => {
                trace!("LSDB install {}", key);
                self.entries.insert(key, lsa);
                true
            }
        }
    }

    pub fn remove(&mut self, key: &LsaKey) -> Option<Lsa> {
        self.entries.remove(key)
    }

    /// Is the received instance newer than our copy (or unknown)?
    pub fn is_newer(&self, header: &LsaHeader) -> bool {
        match self.entries.get(&header.key()) {
            Some(existing) => header.compare_newness(&existing.header) == Ordering::Greater,
            None => true,
        }
    }

    /// One tick of the 1 Hz aging task. Entries that hit MaxAge are
    /// removed and returned so the caller floods them once at MaxAge.
    pub fn age_tick(&mut self) -> Vec<Lsa> {
        let mut max_aged = Vec::new();
        for lsa in self.entries.values_mut() {
            if lsa.header.ls_age < MAX_AGE {
                lsa.header.ls_age += 1;
            }
        }
        let expired: Vec<LsaKey> = self
            .entries
            .iter()
            .filter(|(_, lsa)| lsa.header.ls_age >= MAX_AGE)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            if let Some(mut lsa) = self.entries.remove(&key) {
                trace!("LSDB expire {}", key);
                lsa.header.ls_age = MAX_AGE;
                max_aged.push(lsa);
            }
        }
        max_aged
    }

    /// Self-originated LSAs due for refresh (age past LSRefreshTime):
    /// returned re-built with a bumped sequence number and age zero.
    pub fn refresh_own(&mut self, router_id: Ipv4Addr) -> Vec<Lsa> {
        let due: Vec<LsaKey> = self
            .entries
            .iter()
            .filter(|(_, lsa)| {
                lsa.header.advertising_router == router_id
                    && lsa.header.ls_age >= LS_REFRESH_TIME
            })
            .map(|(key, _)| *key)
            .collect();
        let mut refreshed = Vec::with_capacity(due.len());
        for key in due {
            if let Some(lsa) = self.entries.get_mut(&key) {
                lsa.header.ls_age = 0;
                lsa.header.ls_sequence = next_sequence(lsa.header.ls_sequence);
                lsa.finalize();
                refreshed.push(lsa.clone());
            }
        }
        refreshed
    }
}

/// The next LS sequence number; wraps back to the initial value at the
/// end of the space
pub fn next_sequence(current: i32) -> i32 {
    if current >= MAX_SEQUENCE {
        INITIAL_SEQUENCE
    } else {
        current + 1
    }
}
