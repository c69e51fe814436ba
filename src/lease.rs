//! Lease records and client identities.
//!
//! A [`Lease`] binds one address to one hardware identity. Static leases are
//! operator-declared and never expire; dynamic leases carry an absolute
//! expiry computed from the interface's lease duration.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest DUID accepted as a v6 identity (2-byte type + 128 bytes).
const MAX_DUID_LEN: usize = 130;

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Address family of a lease or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "dhcpv4"),
            Family::V6 => write!(f, "dhcpv6"),
        }
    }
}

/// Client hardware identity: a MAC address for v4, a DUID for v6.
///
/// Displayed and serialized as colon-separated lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HwAddr(Vec<u8>);

impl HwAddr {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Checks that the identity has a plausible length for `family`.
    pub fn validate_for(&self, family: Family) -> Result<()> {
        let valid = match family {
            Family::V4 => matches!(self.0.len(), 6 | 8 | 20),
            Family::V6 => (1..=MAX_DUID_LEN).contains(&self.0.len()),
        };

        if valid {
            Ok(())
        } else if self.0.is_empty() {
            Err(Error::InvalidRequest("hardware address is empty".to_string()))
        } else {
            Err(Error::InvalidRequest(format!(
                "bad {} hardware address length {}",
                family,
                self.0.len()
            )))
        }
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HwAddr({self})")
    }
}

impl FromStr for HwAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', ":");
        if normalized.is_empty() {
            return Err(Error::InvalidRequest("hardware address is empty".to_string()));
        }

        normalized
            .split(':')
            .map(|part| {
                if part.len() != 2 {
                    return Err(Error::InvalidRequest(format!(
                        "bad hardware address {s:?}"
                    )));
                }
                u8::from_str_radix(part, 16)
                    .map_err(|_| Error::InvalidRequest(format!("bad hardware address {s:?}")))
            })
            .collect::<Result<Vec<u8>>>()
            .map(HwAddr)
    }
}

impl TryFrom<String> for HwAddr {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<HwAddr> for String {
    fn from(value: HwAddr) -> Self {
        value.to_string()
    }
}

impl From<[u8; 6]> for HwAddr {
    fn from(mac: [u8; 6]) -> Self {
        Self(mac.to_vec())
    }
}

/// A binding of one address to one client identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub ip: IpAddr,

    pub hw_addr: HwAddr,

    /// Lowercased hostname; empty when the client has none.
    #[serde(default)]
    pub hostname: String,

    /// Absolute expiry. `None` for static leases.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub is_static: bool,
}

impl Lease {
    pub fn new_static(ip: IpAddr, hw_addr: HwAddr, hostname: impl Into<String>) -> Self {
        Self {
            ip,
            hw_addr,
            hostname: hostname.into(),
            expires_at: None,
            is_static: true,
        }
    }

    /// Creates a dynamic lease expiring `duration` from now.
    pub fn new_dynamic(
        ip: IpAddr,
        hw_addr: HwAddr,
        hostname: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            ip,
            hw_addr,
            hostname: hostname.into(),
            expires_at: Some(expiry_after(Utc::now(), duration)),
            is_static: false,
        }
    }

    pub fn family(&self) -> Family {
        Family::of(self.ip)
    }

    /// Returns true if a dynamic lease's expiry is at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_static && self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Extends a dynamic lease to `duration` from now. Static leases are
    /// left untouched.
    pub fn renew(&mut self, duration: Duration) {
        if !self.is_static {
            self.expires_at = Some(expiry_after(Utc::now(), duration));
        }
    }

    /// Returns seconds remaining until expiration, or `None` for static leases.
    pub fn remaining_seconds(&self) -> Option<i64> {
        self.expires_at
            .map(|expires_at| (expires_at - Utc::now()).num_seconds().max(0))
    }
}

fn expiry_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Validates an operator-supplied hostname and returns it lowercased.
///
/// An empty hostname is allowed. Every dot-separated label must be 1 to 63
/// letters, digits or hyphens, and may not start or end with a hyphen.
pub fn validate_hostname(hostname: &str) -> Result<String> {
    let hostname = hostname.trim().to_lowercase();
    if hostname.is_empty() {
        return Ok(hostname);
    }

    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(Error::InvalidRequest(format!(
            "hostname {hostname:?} is too long"
        )));
    }

    for label in hostname.split('.') {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(Error::InvalidRequest(format!(
                "bad hostname {hostname:?}: invalid label {label:?}"
            )));
        }
    }

    Ok(hostname)
}

/// Turns a client-supplied hostname into a valid one, or `None` if nothing
/// usable is left.
pub fn sanitize_hostname(hostname: &str) -> Option<String> {
    let labels: Vec<String> = hostname
        .trim()
        .to_lowercase()
        .split('.')
        .map(|label| {
            let replaced: String = label
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                .take(MAX_LABEL_LEN)
                .collect();
            replaced.trim_matches('-').to_string()
        })
        .filter(|label| !label.is_empty())
        .collect();

    let sanitized = labels.join(".");
    if sanitized.is_empty() || sanitized.len() > MAX_HOSTNAME_LEN {
        None
    } else {
        Some(sanitized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_hw_addr_display_and_parse() {
        let mac = HwAddr::from([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!("AA-BB-CC-DD-EE-FF".parse::<HwAddr>().unwrap(), mac);
        assert!("aa:bb:zz".parse::<HwAddr>().is_err());
        assert!("".parse::<HwAddr>().is_err());
        assert!("aab:bc".parse::<HwAddr>().is_err());
    }

    #[test]
    fn test_hw_addr_serde_as_string() {
        let mac = HwAddr::from([0, 1, 2, 3, 4, 5]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"00:01:02:03:04:05\"");
        let back: HwAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }

    #[test]
    fn test_hw_addr_length_per_family() {
        let mac = HwAddr::from([0xaa; 6]);
        assert!(mac.validate_for(Family::V4).is_ok());
        assert!(mac.validate_for(Family::V6).is_ok());

        let short = HwAddr::new(vec![1, 2, 3]);
        assert!(matches!(
            short.validate_for(Family::V4),
            Err(Error::InvalidRequest(_))
        ));
        assert!(short.validate_for(Family::V6).is_ok());
        assert!(HwAddr::new(Vec::new()).validate_for(Family::V6).is_err());
    }

    #[test]
    fn test_lease_expiry() {
        let mac = HwAddr::from([0xaa; 6]);
        let lease = Lease::new_dynamic(ip(10), mac.clone(), "", Duration::from_secs(3600));
        assert!(!lease.is_expired());
        assert!(lease.remaining_seconds().unwrap() > 3500);
        assert!(lease.is_expired_at(Utc::now() + TimeDelta::hours(2)));

        let mut renewable = Lease::new_dynamic(ip(10), mac.clone(), "", Duration::from_secs(10));
        renewable.renew(Duration::from_secs(7200));
        assert!(renewable.remaining_seconds().unwrap() > 7100);

        let fixed = Lease::new_static(ip(11), mac, "printer");
        assert!(!fixed.is_expired_at(DateTime::<Utc>::MAX_UTC));
        assert_eq!(fixed.remaining_seconds(), None);
    }

    #[test]
    fn test_validate_hostname() {
        assert_eq!(validate_hostname("Printer-1").unwrap(), "printer-1");
        assert_eq!(validate_hostname("nas.home").unwrap(), "nas.home");
        assert_eq!(validate_hostname("").unwrap(), "");
        assert!(validate_hostname("-bad").is_err());
        assert!(validate_hostname("bad_name").is_err());
        assert!(validate_hostname("a..b").is_err());
        assert!(validate_hostname(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(sanitize_hostname("My Laptop"), Some("my-laptop".to_string()));
        assert_eq!(sanitize_hostname("_phone_"), Some("phone".to_string()));
        assert_eq!(sanitize_hostname("a..b"), Some("a.b".to_string()));
        assert_eq!(sanitize_hostname("___"), None);
        assert_eq!(sanitize_hostname(""), None);
    }
}
