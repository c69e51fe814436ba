use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub enabled: bool,
    pub interfaces: BTreeMap<String, InterfaceConfig>,
    pub local_domain_name: String,
    /// Conflict probe timeout; zero disables probing.
    pub icmp_timeout_millis: u64,
    pub leases_file: String,
    /// Minimum gap between two lease file writes after changes.
    #[serde(default = "default_save_interval_millis")]
    pub save_interval_millis: u64,
}

fn default_save_interval_millis() -> u64 {
    5000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceConfig {
    #[serde(default)]
    pub dhcpv4: Option<V4Config>,
    #[serde(default)]
    pub dhcpv6: Option<V6Config>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V4Config {
    pub gateway_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub lease_duration_seconds: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V6Config {
    pub range_start: Ipv6Addr,
    pub lease_duration_seconds: u32,
    #[serde(default)]
    pub ra_slaac_only: bool,
    #[serde(default)]
    pub ra_allow_slaac: bool,
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        let mut interfaces = BTreeMap::new();
        interfaces.insert(
            "eth0".to_string(),
            InterfaceConfig {
                dhcpv4: Some(V4Config::default()),
                dhcpv6: Some(V6Config::default()),
            },
        );

        Self {
            enabled: true,
            interfaces,
            local_domain_name: "lan".to_string(),
            icmp_timeout_millis: 1000,
            leases_file: "leases.json".to_string(),
            save_interval_millis: default_save_interval_millis(),
        }
    }
}

impl Default for V4Config {
    fn default() -> Self {
        Self {
            gateway_ip: Ipv4Addr::new(192, 168, 1, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 200),
            lease_duration_seconds: 86400,
            enabled: true,
        }
    }
}

impl Default for V6Config {
    fn default() -> Self {
        Self {
            range_start: Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0x100),
            lease_duration_seconds: 86400,
            ra_slaac_only: false,
            ra_allow_slaac: false,
            enabled: false,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.local_domain_name.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "local_domain_name must not be empty".to_string(),
            ));
        }

        for (name, interface) in &self.interfaces {
            if name.trim().is_empty() {
                return Err(Error::InvalidConfig(
                    "interface name must not be empty".to_string(),
                ));
            }

            if let Some(v4) = &interface.dhcpv4
                && v4.enabled
            {
                v4.validate()
                    .map_err(|error| Error::InvalidConfig(format!("{name}: dhcpv4: {error}")))?;
            }

            if let Some(v6) = &interface.dhcpv6
                && v6.enabled
            {
                v6.validate()
                    .map_err(|error| Error::InvalidConfig(format!("{name}: dhcpv6: {error}")))?;
            }
        }

        Ok(())
    }

    pub fn icmp_timeout(&self) -> Duration {
        Duration::from_millis(self.icmp_timeout_millis)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_millis)
    }
}

impl InterfaceConfig {
    /// Returns the v4 configuration when it is present and enabled.
    pub fn enabled_v4(&self) -> Option<&V4Config> {
        self.dhcpv4.as_ref().filter(|v4| v4.enabled)
    }

    /// Returns the v6 configuration when it is present and enabled.
    pub fn enabled_v6(&self) -> Option<&V6Config> {
        self.dhcpv6.as_ref().filter(|v6| v6.enabled)
    }
}

impl V4Config {
    fn validate(&self) -> std::result::Result<(), String> {
        let mask = u32::from(self.subnet_mask);
        if mask == 0 || mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(format!("subnet mask {} is not contiguous", self.subnet_mask));
        }

        if self.gateway_ip.is_unspecified() {
            return Err("gateway_ip must be set".to_string());
        }

        let start = u32::from(self.range_start);
        let end = u32::from(self.range_end);
        if start > end {
            return Err("range_start must be less than or equal to range_end".to_string());
        }

        if !self.in_subnet(self.range_start) || !self.in_subnet(self.range_end) {
            return Err(format!(
                "range {}-{} is outside the gateway subnet",
                self.range_start, self.range_end
            ));
        }

        if self.ip_in_range(self.gateway_ip) {
            return Err("gateway_ip must not be within the range".to_string());
        }

        if self.lease_duration_seconds == 0 {
            return Err("lease_duration_seconds must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn ip_in_range(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.range_start) && addr <= u32::from(self.range_end)
    }

    pub fn in_subnet(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.subnet_mask);
        u32::from(ip) & mask == u32::from(self.gateway_ip) & mask
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.gateway_ip) & u32::from(self.subnet_mask))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.gateway_ip) | !u32::from(self.subnet_mask))
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_duration_seconds))
    }
}

impl V6Config {
    fn validate(&self) -> std::result::Result<(), String> {
        let start = self.range_start;
        if start.is_unspecified() || start.is_loopback() || start.is_multicast() {
            return Err(format!("range_start {start} is not a unicast address"));
        }

        if self.lease_duration_seconds == 0 {
            return Err("lease_duration_seconds must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Whether the server assigns addresses itself.
    ///
    /// `ra_slaac_only` wins over `ra_allow_slaac`; with neither flag set,
    /// stateful assignment is on.
    pub fn is_stateful(&self) -> bool {
        !self.ra_slaac_only
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_duration_seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(config: &mut Config) -> &mut V4Config {
        config
            .interfaces
            .get_mut("eth0")
            .and_then(|interface| interface.dhcpv4.as_mut())
            .unwrap()
    }

    #[test]
    fn test_save_interval_defaults_when_missing() {
        let mut value = serde_json::to_value(Config::default()).unwrap();
        value.as_object_mut().unwrap().remove("save_interval_millis");
        let config: Config = serde_json::from_value(value).unwrap();
        assert_eq!(config.save_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_range_start_greater_than_end() {
        let mut config = Config::default();
        v4(&mut config).range_start = Ipv4Addr::new(192, 168, 1, 200);
        v4(&mut config).range_end = Ipv4Addr::new(192, 168, 1, 100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gateway_in_range() {
        let mut config = Config::default();
        v4(&mut config).gateway_ip = Ipv4Addr::new(192, 168, 1, 150);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_range_outside_subnet() {
        let mut config = Config::default();
        v4(&mut config).range_end = Ipv4Addr::new(192, 168, 2, 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_contiguous_mask() {
        let mut config = Config::default();
        v4(&mut config).subnet_mask = Ipv4Addr::new(255, 0, 255, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_lease_duration() {
        let mut config = Config::default();
        v4(&mut config).lease_duration_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_family_is_not_validated() {
        let mut config = Config::default();
        v4(&mut config).lease_duration_seconds = 0;
        v4(&mut config).enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_v6_multicast_start_rejected() {
        let mut config = Config::default();
        let v6 = config
            .interfaces
            .get_mut("eth0")
            .and_then(|interface| interface.dhcpv6.as_mut())
            .unwrap();
        v6.enabled = true;
        v6.range_start = "ff02::1".parse().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ip_in_range() {
        let config = V4Config::default();
        assert!(config.ip_in_range(Ipv4Addr::new(192, 168, 1, 150)));
        assert!(!config.ip_in_range(Ipv4Addr::new(192, 168, 1, 50)));
        assert!(!config.ip_in_range(Ipv4Addr::new(192, 168, 1, 250)));
    }

    #[test]
    fn test_network_and_broadcast() {
        let config = V4Config::default();
        assert_eq!(config.network(), Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(config.broadcast(), Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn test_slaac_only_takes_precedence() {
        let v6 = V6Config {
            ra_slaac_only: true,
            ra_allow_slaac: true,
            ..V6Config::default()
        };
        assert!(!v6.is_stateful());

        let v6 = V6Config {
            ra_allow_slaac: true,
            ..V6Config::default()
        };
        assert!(v6.is_stateful());
        assert!(V6Config::default().is_stateful());
    }
}
