//! Device registry: discovered and bonded peripherals by address

use std::fmt;

/// Address plus optional human-readable name, fixed once discovered
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    address: String,
    name: Option<String>,
}

impl DeviceIdentity {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name for display, "Unknown" when the device never reported one
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }

    /// Case-insensitive substring match on the device name
    pub fn name_matches(&self, pattern: &str) -> bool {
        match &self.name {
            Some(name) => name.to_lowercase().contains(&pattern.to_lowercase()),
            None => false,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.display_name(), self.address)
    }
}

/// Where a registry entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSource {
    Bonded,
    Scanned,
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    identity: DeviceIdentity,
    source: DeviceSource,
}

/// Insertion-ordered set of known devices, keyed by address
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: Vec<RegistryEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device. Returns false if the address is already known;
    /// the first identity seen for an address is kept.
    pub fn insert(&mut self, identity: DeviceIdentity, source: DeviceSource) -> bool {
        if self.get(identity.address()).is_some() {
            return false;
        }
        self.entries.push(RegistryEntry { identity, source });
        true
    }

    pub fn get(&self, address: &str) -> Option<&DeviceIdentity> {
        self.entries
            .iter()
            .find(|e| e.identity.address().eq_ignore_ascii_case(address))
            .map(|e| &e.identity)
    }

    pub fn source(&self, address: &str) -> Option<DeviceSource> {
        self.entries
            .iter()
            .find(|e| e.identity.address().eq_ignore_ascii_case(address))
            .map(|e| e.source)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceIdentity> {
        self.entries.iter().map(|e| &e.identity)
    }

    /// "<name> - <address>" lines in insertion order
    pub fn labels(&self) -> Vec<String> {
        self.iter().map(|id| id.to_string()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
