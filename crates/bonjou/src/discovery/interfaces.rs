//! Local IPv4 networks: directed broadcast targets and the same-subnet
//! check applied to incoming beacons.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

/// An interface address with its netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Net {
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self { addr, netmask }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(self.addr) & mask == u32::from(ip) & mask
    }

    /// Directed broadcast address. `None` for host routes and unset addresses.
    pub fn broadcast(&self) -> Option<Ipv4Addr> {
        if self.addr.is_unspecified() || self.netmask == Ipv4Addr::BROADCAST {
            return None;
        }
        let bcast = Ipv4Addr::from(u32::from(self.addr) | !u32::from(self.netmask));
        (!bcast.is_unspecified()).then_some(bcast)
    }
}

/// Up, broadcast-capable, non-loopback IPv4 interfaces.
#[cfg(unix)]
pub fn broadcast_networks() -> Vec<Ipv4Net> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list interfaces");
            return Vec::new();
        }
    };
    addrs
        .filter(|ifa| {
            ifa.flags.contains(InterfaceFlags::IFF_UP)
                && ifa.flags.contains(InterfaceFlags::IFF_BROADCAST)
                && !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        })
        .filter_map(|ifa| {
            let addr = ifa.address.as_ref()?.as_sockaddr_in()?.ip();
            let netmask = ifa.netmask.as_ref()?.as_sockaddr_in()?.ip();
            Some(Ipv4Net::new(addr, netmask))
        })
        .collect()
}

#[cfg(not(unix))]
pub fn broadcast_networks() -> Vec<Ipv4Net> {
    Vec::new()
}

/// Directed broadcast address of each network, on `port`, without repeats.
pub fn directed_broadcasts(nets: &[Ipv4Net], port: u16) -> Vec<SocketAddr> {
    nets.iter()
        .filter_map(Ipv4Net::broadcast)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|ip| SocketAddr::new(IpAddr::V4(ip), port))
        .collect()
}

/// Is `sender` on the same IPv4 subnet as this node?
///
/// The subnet is the interface network holding `local`. Without one, any
/// local network holding `sender` counts; with no interface information at
/// all, the first three octets of `local` decide.
pub fn same_subnet(nets: &[Ipv4Net], local: Option<Ipv4Addr>, sender: Ipv4Addr) -> bool {
    if let Some(net) = local.and_then(|l| nets.iter().find(|n| n.contains(l))) {
        return net.contains(sender);
    }
    if nets.iter().any(|n| n.contains(sender)) {
        return true;
    }
    match local {
        Some(local) => local.octets()[..3] == sender.octets()[..3],
        None => nets.is_empty(),
    }
}

/// Interface networks, re-read at most once per `max_age`.
pub struct LocalNetworks {
    nets: Vec<Ipv4Net>,
    read_at: Option<Instant>,
    max_age: Duration,
}

impl LocalNetworks {
    pub fn new(max_age: Duration) -> Self {
        Self {
            nets: Vec::new(),
            read_at: None,
            max_age,
        }
    }

    pub fn current(&mut self) -> &[Ipv4Net] {
        let stale = self.read_at.map_or(true, |at| at.elapsed() >= self.max_age);
        if stale {
            self.nets = broadcast_networks();
            self.read_at = Some(Instant::now());
            tracing::trace!(networks = self.nets.len(), "interface networks refreshed");
        }
        &self.nets
    }
}
