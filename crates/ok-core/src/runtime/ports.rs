//! Host-port window for plugin sidecars.
//!
//! Each plugin holds at most one port in `[38100, 38199]`, and no port is
//! held by two plugins.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

pub const PORT_RANGE_START: u16 = 38100;
pub const PORT_RANGE_END: u16 = 38199;

/// The reserved loopback window.
pub const PORT_RANGE: RangeInclusive<u16> = PORT_RANGE_START..=PORT_RANGE_END;

/// Port → plugin name, plus the reverse index.
#[derive(Debug, Default, Clone)]
pub struct PortTable {
    by_port: BTreeMap<u16, String>,
    by_name: BTreeMap<String, u16>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a port for `name`.
    ///
    /// An existing allocation is returned unchanged. Otherwise `preferred` is
    /// used when it lies in the window and is free, else the lowest free port.
    /// Returns `None` when the window is exhausted.
    pub fn allocate(&mut self, name: &str, preferred: Option<u16>) -> Option<u16> {
        if let Some(port) = self.by_name.get(name) {
            return Some(*port);
        }
        let port = preferred
            .filter(|p| PORT_RANGE.contains(p) && !self.by_port.contains_key(p))
            .or_else(|| PORT_RANGE.clone().find(|p| !self.by_port.contains_key(p)))?;
        self.bind(name, port);
        Some(port)
    }

    /// Record a port observed on an existing container.
    ///
    /// Ports outside the window are ignored. A port claimed by another plugin
    /// is left alone and `false` is returned.
    pub fn reclaim(&mut self, name: &str, port: u16) -> bool {
        if !PORT_RANGE.contains(&port) {
            return false;
        }
        match self.by_port.get(&port) {
            Some(owner) if owner == name => true,
            Some(_) => false,
            None => {
                if let Some(old) = self.by_name.remove(name) {
                    self.by_port.remove(&old);
                }
                self.bind(name, port);
                true
            }
        }
    }

    fn bind(&mut self, name: &str, port: u16) {
        self.by_port.insert(port, name.to_string());
        self.by_name.insert(name.to_string(), port);
    }

    /// Release the port held by `name`, returning it.
    pub fn release(&mut self, name: &str) -> Option<u16> {
        let port = self.by_name.remove(name)?;
        self.by_port.remove(&port);
        Some(port)
    }

    pub fn port_of(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn owner_of(&self, port: u16) -> Option<&str> {
        self.by_port.get(&port).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_port.is_empty()
    }

    /// Snapshot of all allocations, ordered by port.
    pub fn allocations(&self) -> Vec<(u16, String)> {
        self.by_port
            .iter()
            .map(|(p, n)| (*p, n.clone()))
            .collect()
    }
}
