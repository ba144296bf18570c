use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

pub mod connection;
pub mod frame;
pub mod listener;
pub mod sockets;

/// Switch for (simulated) availability of the IP network. While it is off, the node behaves as
///  if there were no network: no broadcasts, no new connections, inbound connections refused.
#[derive(Debug)]
pub struct NetworkState {
    ip_enabled: AtomicBool,
}

impl NetworkState {
    pub fn new() -> NetworkState {
        NetworkState {
            ip_enabled: AtomicBool::new(true),
        }
    }

    pub fn is_ip_enabled(&self) -> bool {
        self.ip_enabled.load(Ordering::Acquire)
    }

    /// returns `true` if this changed the state
    pub fn set_ip_enabled(&self, enabled: bool) -> bool {
        let changed = self.ip_enabled.swap(enabled, Ordering::AcqRel) != enabled;
        if changed {
            info!("IP networking {}", if enabled { "enabled" } else { "disabled" });
        }
        changed
    }
}

impl Default for NetworkState {
    fn default() -> Self {
        NetworkState::new()
    }
}
