//! Address allocation
//!
//! Lowest-available-first over the host addresses of the gateway subnet. The
//! allocator holds no state: availability is recomputed from the allocated set
//! the caller reads out of the store, so deleting a device frees its address
//! without further bookkeeping.

use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Return the lowest host address of `subnet` that is neither the network,
/// broadcast nor `reserved` address and is not in `allocated`.
pub fn next_address(
    subnet: Ipv4Network,
    reserved: Ipv4Addr,
    allocated: &HashSet<Ipv4Addr>,
) -> Result<Ipv4Addr> {
    let candidate = host_range(subnet)
        .map(Ipv4Addr::from)
        .find(|addr| *addr != reserved && !allocated.contains(addr));

    candidate.ok_or(Error::PoolExhausted { subnet })
}

/// Number of addresses available to devices in an empty pool
pub fn usable_hosts(subnet: Ipv4Network, reserved: Ipv4Addr) -> u32 {
    let hosts = host_range(subnet);
    let count = hosts.end().saturating_add(1).saturating_sub(*hosts.start());
    if hosts.contains(&u32::from(reserved)) {
        count - 1
    } else {
        count
    }
}

/// Whether `addr` is a host address of `subnet`
pub fn is_host_address(subnet: Ipv4Network, addr: Ipv4Addr) -> bool {
    host_range(subnet).contains(&u32::from(addr))
}

// Host addresses as integers; empty for /31 and /32 where network and
// broadcast leave nothing to hand out.
#[allow(clippy::reversed_empty_ranges)]
fn host_range(subnet: Ipv4Network) -> std::ops::RangeInclusive<u32> {
    if subnet.prefix() >= 31 {
        return 1..=0;
    }
    let network = u32::from(subnet.network());
    let broadcast = u32::from(subnet.broadcast());
    (network + 1)..=(broadcast - 1)
}
