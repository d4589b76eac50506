//! Address allocation
//!
//! Ascending scan over the subnet host range: the lowest address not held by
//! an active peer wins. Deterministic and O(subnet size), which is fine for
//! pools sized in the low hundreds; freed addresses are reclaimed as soon as
//! the scan reaches them.

use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Allocates peer addresses from a fixed subnet
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    subnet: Ipv4Network,
    /// The relay's own address, never handed to a peer
    relay_address: Ipv4Addr,
}

impl AddressAllocator {
    pub fn new(subnet: Ipv4Network, relay_address: Ipv4Addr) -> Self {
        Self {
            subnet,
            relay_address,
        }
    }

    /// First address in ascending order not present in `in_use`, or `None`
    /// when the pool is exhausted.
    pub fn next_available(&self, in_use: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        let network = self.subnet.network();
        let broadcast = self.subnet.broadcast();

        self.subnet.iter().find(|addr| {
            *addr != network
                && *addr != broadcast
                && *addr != self.relay_address
                && !in_use.contains(addr)
        })
    }

    /// Number of peer slots in the pool
    pub fn capacity(&self) -> u32 {
        // Hosts minus network, broadcast, and the relay itself
        self.subnet.size().saturating_sub(3)
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }
}
