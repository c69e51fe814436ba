//! Allocatable address ranges.
//!
//! An [`AddressPool`] describes one interface's range for one family and
//! proposes allocation candidates. It holds no lease state of its own: the
//! caller supplies the "is this address taken" view from the lease table.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::{V4Config, V6Config};
use crate::error::{Error, Result};
use crate::lease::Family;

/// Prefix length assumed for the v6 subnet around `range_start`.
const V6_PREFIX_LEN: u32 = 64;

/// Addresses are handled as integers so both families share one scan.
fn to_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

#[derive(Debug, Clone)]
pub struct AddressPool {
    family: Family,
    start: u128,
    end: u128,
    subnet_mask: u128,
    subnet_base: u128,
    /// Gateway, network and broadcast addresses; never handed out.
    reserved: Vec<IpAddr>,
    stateful: bool,
}

impl AddressPool {
    pub fn v4(config: &V4Config) -> Self {
        let mask = u128::from(u32::from(config.subnet_mask));
        Self {
            family: Family::V4,
            start: to_bits(IpAddr::V4(config.range_start)),
            end: to_bits(IpAddr::V4(config.range_end)),
            subnet_mask: mask,
            subnet_base: to_bits(IpAddr::V4(config.gateway_ip)) & mask,
            reserved: vec![
                IpAddr::V4(config.gateway_ip),
                IpAddr::V4(config.network()),
                IpAddr::V4(config.broadcast()),
            ],
            stateful: true,
        }
    }

    /// Builds a v6 pool. The dynamic window runs from `range_start` to the
    /// end of its last octet (at most 256 addresses).
    pub fn v6(config: &V6Config) -> Self {
        let start = u128::from(config.range_start);
        let mask = u128::MAX << (128 - V6_PREFIX_LEN);
        Self {
            family: Family::V6,
            start,
            end: start | 0xff,
            subnet_mask: mask,
            subnet_base: start & mask,
            reserved: Vec::new(),
            stateful: config.is_stateful(),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Whether the pool assigns addresses at all. False for v6 pools in
    /// SLAAC-only mode.
    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    pub fn range_start(&self) -> IpAddr {
        self.from_bits(self.start)
    }

    pub fn range_end(&self) -> IpAddr {
        self.from_bits(self.end)
    }

    /// Number of addresses in the dynamic window, reserved ones included.
    pub fn size(&self) -> u128 {
        self.end - self.start + 1
    }

    /// Returns true if `ip` is a valid dynamic address under the current
    /// configuration: inside the range for v4, inside the prefix for v6.
    /// Always false when stateful assignment is off.
    pub fn contains(&self, ip: IpAddr) -> bool {
        if !self.stateful || Family::of(ip) != self.family {
            return false;
        }
        match self.family {
            Family::V4 => self.in_dynamic_range(ip),
            Family::V6 => self.in_subnet(ip),
        }
    }

    /// Returns true if `ip` lies in the window scanned by [`next_candidate`].
    ///
    /// [`next_candidate`]: AddressPool::next_candidate
    pub fn in_dynamic_range(&self, ip: IpAddr) -> bool {
        if Family::of(ip) != self.family {
            return false;
        }
        let bits = to_bits(ip);
        bits >= self.start && bits <= self.end && !self.is_reserved(ip)
    }

    pub fn in_subnet(&self, ip: IpAddr) -> bool {
        Family::of(ip) == self.family && to_bits(ip) & self.subnet_mask == self.subnet_base
    }

    pub fn is_reserved(&self, ip: IpAddr) -> bool {
        self.reserved.contains(&ip)
    }

    /// Checks that `ip` may carry a static lease: inside the subnet and not
    /// the gateway, network or broadcast address.
    pub fn check_static(&self, ip: IpAddr) -> Result<()> {
        if Family::of(ip) != self.family {
            return Err(Error::InvalidRequest(format!(
                "address {ip} does not belong to {}",
                self.family
            )));
        }
        if !self.in_subnet(ip) {
            return Err(Error::InvalidRequest(format!(
                "address {ip} is outside the subnet"
            )));
        }
        if self.is_reserved(ip) {
            return Err(Error::InvalidRequest(format!(
                "address {ip} is the gateway, network or broadcast address"
            )));
        }
        Ok(())
    }

    /// Returns the lowest address of the range for which `is_taken` is
    /// false, or `None` when the range is exhausted or the pool is not
    /// stateful.
    pub fn next_candidate(&self, is_taken: impl Fn(IpAddr) -> bool) -> Option<IpAddr> {
        if !self.stateful {
            return None;
        }

        (self.start..=self.end)
            .map(|bits| self.from_bits(bits))
            .find(|&ip| !self.is_reserved(ip) && !is_taken(ip))
    }

    fn from_bits(&self, bits: u128) -> IpAddr {
        match self.family {
            Family::V4 => IpAddr::V4(Ipv4Addr::from(bits as u32)),
            Family::V6 => IpAddr::V6(Ipv6Addr::from(bits)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn v4_config() -> V4Config {
        V4Config {
            gateway_ip: Ipv4Addr::new(10, 0, 0, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            range_start: Ipv4Addr::new(10, 0, 0, 10),
            range_end: Ipv4Addr::new(10, 0, 0, 12),
            lease_duration_seconds: 3600,
            enabled: true,
        }
    }

    fn v4(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_v4_contains() {
        let pool = AddressPool::v4(&v4_config());
        assert!(pool.contains(v4(10)));
        assert!(pool.contains(v4(12)));
        assert!(!pool.contains(v4(13)));
        assert!(!pool.contains(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(pool.size(), 3);
    }

    #[test]
    fn test_next_candidate_lowest_free() {
        let pool = AddressPool::v4(&v4_config());
        assert_eq!(pool.next_candidate(|_| false), Some(v4(10)));

        let taken: HashSet<IpAddr> = [v4(10)].into_iter().collect();
        assert_eq!(pool.next_candidate(|ip| taken.contains(&ip)), Some(v4(11)));

        let taken: HashSet<IpAddr> = [v4(10), v4(11), v4(12)].into_iter().collect();
        assert_eq!(pool.next_candidate(|ip| taken.contains(&ip)), None);
    }

    #[test]
    fn test_gateway_network_broadcast_never_offered() {
        let config = V4Config {
            gateway_ip: Ipv4Addr::new(10, 0, 0, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 252),
            range_start: Ipv4Addr::new(10, 0, 0, 0),
            range_end: Ipv4Addr::new(10, 0, 0, 3),
            lease_duration_seconds: 60,
            enabled: true,
        };
        let pool = AddressPool::v4(&config);
        assert_eq!(pool.next_candidate(|_| false), Some(v4(2)));
        assert_eq!(pool.next_candidate(|ip| ip == v4(2)), None);
        assert!(!pool.in_dynamic_range(v4(3)));
    }

    #[test]
    fn test_check_static() {
        let pool = AddressPool::v4(&v4_config());
        assert!(pool.check_static(v4(50)).is_ok());
        assert!(pool.check_static(v4(11)).is_ok());
        assert!(matches!(pool.check_static(v4(1)), Err(Error::InvalidRequest(_))));
        assert!(matches!(pool.check_static(v4(255)), Err(Error::InvalidRequest(_))));
        assert!(
            pool.check_static(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 5)))
                .is_err()
        );
    }

    #[test]
    fn test_v6_window_and_prefix() {
        let config = V6Config {
            range_start: "fd00::10".parse().unwrap(),
            lease_duration_seconds: 3600,
            ra_slaac_only: false,
            ra_allow_slaac: true,
            enabled: true,
        };
        let pool = AddressPool::v6(&config);
        assert!(pool.is_stateful());
        assert_eq!(pool.range_end(), "fd00::ff".parse::<IpAddr>().unwrap());
        assert_eq!(
            pool.next_candidate(|_| false),
            Some("fd00::10".parse().unwrap())
        );
        assert!(pool.contains("fd00::1:2".parse().unwrap()));
        assert!(!pool.in_dynamic_range("fd00::1:2".parse().unwrap()));
        assert!(!pool.contains("fd01::10".parse().unwrap()));
    }

    #[test]
    fn test_v6_slaac_only_disables_pool() {
        let config = V6Config {
            range_start: "fd00::10".parse().unwrap(),
            lease_duration_seconds: 3600,
            ra_slaac_only: true,
            ra_allow_slaac: true,
            enabled: true,
        };
        let pool = AddressPool::v6(&config);
        assert!(!pool.is_stateful());
        assert_eq!(pool.next_candidate(|_| false), None);
        assert!(!pool.contains("fd00::10".parse().unwrap()));
        assert!(pool.check_static("fd00::20".parse().unwrap()).is_ok());
    }
}
