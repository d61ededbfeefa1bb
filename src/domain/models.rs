use crate::domain::command::Command;
use crate::infrastructure::bluetooth::channel::StreamChannel;
use std::fmt;

/// A remote device seen during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub address: String,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Addresses compare case-insensitively (`aa:bb` == `AA:BB`)
    pub fn has_address(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "\"{}\" ({})", self.name, self.address)
        }
    }
}

/// Which device the link should connect to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTarget {
    pub address: Option<String>,
    pub name: Option<String>,
}

impl DeviceTarget {
    /// Address wins when configured; the name is only consulted without one.
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        match (&self.address, &self.name) {
            (Some(address), _) => device.has_address(address),
            (None, Some(name)) => device.name == *name,
            (None, None) => false,
        }
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.address, &self.name) {
            (Some(address), _) => write!(f, "{}", address),
            (None, Some(name)) => write!(f, "\"{}\"", name),
            (None, None) => write!(f, "<unset>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Discovering,
    Connecting,
    Connected,
    Failed,
}

/// Events emitted by a discovery source, in platform order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    DeviceFound(DeviceDescriptor),
    ServiceIdsResolved { address: String, ids: Vec<String> },
    DiscoveryFinished,
}

/// Notifications delivered to the caller
#[derive(Debug)]
pub enum AppEvent {
    ConnectionEstablished(StreamChannel),
    ConnectionFailed(String),
    CommandParsed(Command),
    DeviceNotFound,
}
