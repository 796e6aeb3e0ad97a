//! Local IPv4 discovery and ranking for LAN coordinator probing.

use std::net::{Ipv4Addr, ToSocketAddrs, UdpSocket};

/// Rank for ordering candidate addresses: home-LAN ranges first so virtual
/// adapter ranges do not win.
pub fn rank_ipv4(addr: Ipv4Addr) -> u8 {
    if addr.is_loopback() {
        return 5;
    }
    if addr.is_link_local() {
        return 4;
    }
    let octets = addr.octets();
    if octets[0] == 192 && octets[1] == 168 {
        return 0;
    }
    if octets[0] == 10 {
        return 1;
    }
    if octets[0] == 172 && (16..=31).contains(&octets[1]) {
        return 2;
    }
    3
}

pub fn is_private(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 10
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
}

fn candidate_ipv4() -> Vec<Ipv4Addr> {
    let mut candidates = Vec::new();

    // The outbound-route trick: no packet is sent, the kernel just picks a
    // source address for each target.
    for target in ["8.8.8.8:80", "1.1.1.1:80", "192.168.0.1:80", "10.0.0.1:80"] {
        if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
            if socket.connect(target).is_ok() {
                if let Ok(local) = socket.local_addr() {
                    if let std::net::IpAddr::V4(addr) = local.ip() {
                        candidates.push(addr);
                    }
                }
            }
        }
    }

    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if let Ok(resolved) = (hostname.as_str(), 0u16).to_socket_addrs() {
            for addr in resolved {
                if let std::net::IpAddr::V4(v4) = addr.ip() {
                    candidates.push(v4);
                }
            }
        }
    }

    candidates
}

fn usable(addr: Ipv4Addr) -> bool {
    !addr.is_unspecified() && !addr.is_multicast() && !addr.is_broadcast()
}

/// Deduplicated local IPv4 addresses in rank order.
pub fn local_ipv4_addresses(include_loopback: bool) -> Vec<Ipv4Addr> {
    let mut seen = Vec::new();
    for candidate in candidate_ipv4() {
        if !usable(candidate) || seen.contains(&candidate) {
            continue;
        }
        seen.push(candidate);
    }
    seen.sort_by_key(|addr| (rank_ipv4(*addr), addr.octets()));

    if include_loopback {
        return seen;
    }
    let filtered: Vec<Ipv4Addr> = seen.into_iter().filter(|addr| !addr.is_loopback()).collect();
    if filtered.is_empty() {
        vec![Ipv4Addr::LOCALHOST]
    } else {
        filtered
    }
}

/// Best guess at the address peers should use to reach this machine.
pub fn preferred_lan_ipv4() -> Ipv4Addr {
    for candidate in local_ipv4_addresses(false) {
        if is_private(candidate) && !candidate.is_loopback() {
            return candidate;
        }
    }
    local_ipv4_addresses(true)
        .into_iter()
        .next()
        .unwrap_or(Ipv4Addr::LOCALHOST)
}

/// `a.b.c.d/len` CIDR for discovery include/exclude filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: u32,
    prefix: u8,
}

impl Cidr {
    pub fn parse(raw: &str) -> Option<Self> {
        let (addr_raw, prefix_raw) = raw.trim().split_once('/')?;
        let addr: Ipv4Addr = addr_raw.trim().parse().ok()?;
        let prefix: u8 = prefix_raw.trim().parse().ok()?;
        if prefix > 32 {
            return None;
        }
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        Some(Self {
            network: u32::from(addr) & mask,
            prefix,
        })
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        };
        (u32::from(addr) & mask) == self.network
    }
}

pub fn parse_cidr_list(raw: &str) -> Vec<Cidr> {
    raw.split(',').filter_map(Cidr::parse).collect()
}

/// Hosts to sweep: every address of the /24 around each private local
/// address, honoring include/exclude CIDR filters from the environment.
pub fn discovery_hosts(limit_per_subnet: usize) -> Vec<Ipv4Addr> {
    let include = parse_cidr_list(&std::env::var("BEACON_DISCOVERY_INCLUDE_CIDRS").unwrap_or_default());
    let exclude = parse_cidr_list(&std::env::var("BEACON_DISCOVERY_EXCLUDE_CIDRS").unwrap_or_default());

    let mut hosts = Vec::new();
    let mut seen_subnets = Vec::new();
    for addr in local_ipv4_addresses(false) {
        if !is_private(addr) {
            continue;
        }
        if !include.is_empty() && !include.iter().any(|cidr| cidr.contains(addr)) {
            continue;
        }
        if exclude.iter().any(|cidr| cidr.contains(addr)) {
            continue;
        }
        let octets = addr.octets();
        let subnet = (octets[0], octets[1], octets[2]);
        if seen_subnets.contains(&subnet) {
            continue;
        }
        seen_subnets.push(subnet);

        let mut count = 0usize;
        for host in 1..=254u8 {
            if count >= limit_per_subnet.max(1) {
                break;
            }
            let candidate = Ipv4Addr::new(subnet.0, subnet.1, subnet.2, host);
            if !hosts.contains(&candidate) {
                hosts.push(candidate);
                count += 1;
            }
        }
    }
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranking_prefers_home_lan_ranges() {
        assert_eq!(rank_ipv4("192.168.1.20".parse().unwrap()), 0);
        assert_eq!(rank_ipv4("10.1.2.3".parse().unwrap()), 1);
        assert_eq!(rank_ipv4("172.20.0.5".parse().unwrap()), 2);
        assert_eq!(rank_ipv4("172.15.0.5".parse().unwrap()), 3);
        assert_eq!(rank_ipv4("169.254.3.3".parse().unwrap()), 4);
        assert_eq!(rank_ipv4("127.0.0.1".parse().unwrap()), 5);
    }

    #[test]
    fn cidr_parsing_and_membership() {
        let cidr = Cidr::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains("192.168.1.77".parse().unwrap()));
        assert!(!cidr.contains("192.168.2.77".parse().unwrap()));

        assert!(Cidr::parse("nonsense").is_none());
        assert!(Cidr::parse("10.0.0.0/33").is_none());

        let list = parse_cidr_list("10.0.0.0/8, invalid, 192.168.0.0/16");
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn preferred_address_is_never_unspecified() {
        let addr = preferred_lan_ipv4();
        assert!(!addr.is_unspecified());
    }
}
