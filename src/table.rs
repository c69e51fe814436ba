//! Authoritative lease store for one interface and family.
//!
//! The table keeps three indexes (address, hardware identity, hostname)
//! and refuses any mutation that would make two leases share a key.
//!
//! # Thread Safety
//!
//! All operations are thread-safe. The [`LeaseTable`] uses:
//! - [`RwLock`] for the lease indexes (reads run concurrently, mutations are
//!   exclusive)
//! - a short-lived [`Mutex`] for addresses reserved by in-flight allocations,
//!   so concurrent allocations never probe the same candidate

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::lease::{Family, HwAddr, Lease};
use crate::pool::AddressPool;

fn hostname_key(hostname: &str) -> String {
    hostname.to_lowercase()
}

#[derive(Debug, Default)]
struct TableState {
    /// Ordered by address so listings are stable.
    by_ip: BTreeMap<IpAddr, Lease>,
    by_hw: HashMap<HwAddr, IpAddr>,
    by_host: HashMap<String, IpAddr>,
}

impl TableState {
    fn insert(&mut self, lease: Lease) {
        self.by_hw.insert(lease.hw_addr.clone(), lease.ip);
        if !lease.hostname.is_empty() {
            self.by_host.insert(hostname_key(&lease.hostname), lease.ip);
        }
        self.by_ip.insert(lease.ip, lease);
    }

    fn remove_ip(&mut self, ip: IpAddr) -> Option<Lease> {
        let lease = self.by_ip.remove(&ip)?;
        self.by_hw.remove(&lease.hw_addr);
        if !lease.hostname.is_empty() {
            self.by_host.remove(&hostname_key(&lease.hostname));
        }
        Some(lease)
    }

    /// Inserts `lease`, or replaces the lease already binding the same
    /// identity to the same address.
    fn commit(&mut self, lease: Lease) -> Result<Lease> {
        let replacing = match self.by_ip.get(&lease.ip) {
            Some(existing) if existing.hw_addr == lease.hw_addr => {
                if existing.is_static && !lease.is_static {
                    return Err(Error::Conflict(format!(
                        "address {} is statically leased to {}",
                        lease.ip, existing.hw_addr
                    )));
                }
                Some(lease.ip)
            }
            Some(existing) => {
                return Err(Error::Conflict(format!(
                    "address {} is already leased to {}",
                    lease.ip, existing.hw_addr
                )));
            }
            None => None,
        };

        if let Some(&held) = self.by_hw.get(&lease.hw_addr)
            && Some(held) != replacing
        {
            return Err(Error::Conflict(format!(
                "hardware address {} already holds {}",
                lease.hw_addr, held
            )));
        }

        if !lease.hostname.is_empty()
            && let Some(&held) = self.by_host.get(&hostname_key(&lease.hostname))
            && Some(held) != replacing
        {
            return Err(Error::Conflict(format!(
                "hostname {:?} is already used by {}",
                lease.hostname, held
            )));
        }

        if let Some(ip) = replacing {
            self.remove_ip(ip);
        }
        self.insert(lease.clone());
        Ok(lease)
    }

    /// Inserts `lease` only if its address is unused.
    fn insert_new(&mut self, lease: Lease) -> Result<Lease> {
        if let Some(existing) = self.by_ip.get(&lease.ip) {
            return Err(Error::Conflict(format!(
                "address {} is already leased to {}",
                lease.ip, existing.hw_addr
            )));
        }
        self.commit(lease)
    }

    fn find(&self, ip: IpAddr, hw_addr: &HwAddr) -> Result<&Lease> {
        self.by_ip
            .get(&ip)
            .filter(|lease| lease.hw_addr == *hw_addr)
            .ok_or_else(|| Error::NotFound(format!("no lease for {} at {}", hw_addr, ip)))
    }
}

/// An address held back from other allocations while it is being probed.
///
/// The reservation is released when dropped, including when the
/// allocation future is cancelled.
#[derive(Debug)]
pub struct Reservation<'a> {
    table: &'a LeaseTable,
    ip: IpAddr,
}

impl Reservation<'_> {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.table.pending().remove(&self.ip);
    }
}

#[derive(Debug)]
pub struct LeaseTable {
    family: Family,
    state: RwLock<TableState>,
    pending: Mutex<HashSet<IpAddr>>,
}

impl LeaseTable {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            state: RwLock::new(TableState::default()),
            pending: Mutex::new(HashSet::new()),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashSet<IpAddr>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_family(&self, ip: IpAddr) -> Result<()> {
        if Family::of(ip) == self.family {
            Ok(())
        } else {
            Err(Error::InvalidRequest(format!(
                "address {} does not belong to {}",
                ip, self.family
            )))
        }
    }

    pub async fn lookup(&self, ip: IpAddr) -> Option<Lease> {
        let state = self.state.read().await;
        state.by_ip.get(&ip).cloned()
    }

    pub async fn lookup_by_hw(&self, hw_addr: &HwAddr) -> Option<Lease> {
        let state = self.state.read().await;
        state
            .by_hw
            .get(hw_addr)
            .and_then(|ip| state.by_ip.get(ip).cloned())
    }

    pub async fn lookup_by_hostname(&self, hostname: &str) -> Option<Lease> {
        if hostname.is_empty() {
            return None;
        }
        let state = self.state.read().await;
        state
            .by_host
            .get(&hostname_key(hostname))
            .and_then(|ip| state.by_ip.get(ip).cloned())
    }

    /// Returns all leases ordered by address.
    pub async fn list(&self) -> Vec<Lease> {
        let state = self.state.read().await;
        state.by_ip.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.by_ip.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Inserts a new lease or renews the same identity's lease at the same
    /// address in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if a different identity holds the address
    /// or hostname, or the identity already holds another address.
    pub async fn commit(&self, lease: Lease) -> Result<Lease> {
        self.check_family(lease.ip)?;
        let mut state = self.state.write().await;
        state.commit(lease)
    }

    /// Adds a lease none of whose keys is in use. Unlike [`commit`], an
    /// existing lease is never replaced.
    ///
    /// [`commit`]: LeaseTable::commit
    pub async fn insert(&self, lease: Lease) -> Result<Lease> {
        self.check_family(lease.ip)?;
        let mut state = self.state.write().await;
        state.insert_new(lease)
    }

    /// Extends `hw_addr`'s dynamic lease at `ip` to `duration` from now.
    pub async fn renew(&self, hw_addr: &HwAddr, ip: IpAddr, duration: Duration) -> Result<Lease> {
        let mut state = self.state.write().await;
        state.find(ip, hw_addr)?;

        let lease = state
            .by_ip
            .get_mut(&ip)
            .ok_or_else(|| Error::NotFound(format!("no lease at {}", ip)))?;
        if lease.is_static {
            return Err(Error::Conflict(format!("lease at {} is static", ip)));
        }
        lease.renew(duration);
        Ok(lease.clone())
    }

    /// Removes the lease binding `hw_addr` to `ip`.
    ///
    /// The lease is identified by these two keys alone; hostname, expiry
    /// and static flag of the stored lease are not compared.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no lease matches both keys.
    pub async fn remove(&self, ip: IpAddr, hw_addr: &HwAddr) -> Result<Lease> {
        let mut state = self.state.write().await;
        state.find(ip, hw_addr)?;
        state
            .remove_ip(ip)
            .ok_or_else(|| Error::NotFound(format!("no lease at {}", ip)))
    }

    /// Replaces `old` with `new` atomically. On any error the table is left
    /// exactly as it was.
    ///
    /// `old` is matched by address and hardware address only, so a copy
    /// taken before a renewal still identifies the lease.
    pub async fn edit(&self, old: &Lease, new: Lease) -> Result<Lease> {
        self.check_family(new.ip)?;
        let mut state = self.state.write().await;
        state.find(old.ip, &old.hw_addr)?;

        let Some(previous) = state.remove_ip(old.ip) else {
            return Err(Error::NotFound(format!("no lease at {}", old.ip)));
        };

        match state.commit(new) {
            Ok(lease) => Ok(lease),
            Err(error) => {
                state.insert(previous);
                Err(error)
            }
        }
    }

    /// Removes every lease and returns how many there were.
    pub async fn reset(&self) -> usize {
        let mut state = self.state.write().await;
        let count = state.by_ip.len();
        *state = TableState::default();
        count
    }

    /// Removes dynamic leases whose expiry is at or before `now`.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Vec<Lease> {
        let mut state = self.state.write().await;
        let expired: Vec<IpAddr> = state
            .by_ip
            .values()
            .filter(|lease| lease.is_expired_at(now))
            .map(|lease| lease.ip)
            .collect();

        expired
            .into_iter()
            .filter_map(|ip| state.remove_ip(ip))
            .collect()
    }

    /// Picks the lowest address of `pool` that is neither leased, reserved
    /// by another allocation, nor in `exclude`, and reserves it.
    pub async fn reserve_candidate(
        &self,
        pool: &AddressPool,
        exclude: &HashSet<IpAddr>,
    ) -> Option<Reservation<'_>> {
        let state = self.state.read().await;
        let mut pending = self.pending();

        let ip = pool.next_candidate(|ip| {
            state.by_ip.contains_key(&ip) || pending.contains(&ip) || exclude.contains(&ip)
        })?;
        pending.insert(ip);

        Some(Reservation { table: self, ip })
    }

    /// Reserves `ip` if it is free and not already reserved.
    pub async fn reserve(&self, ip: IpAddr) -> Option<Reservation<'_>> {
        let state = self.state.read().await;
        let mut pending = self.pending();

        if state.by_ip.contains_key(&ip) || !pending.insert(ip) {
            return None;
        }

        Some(Reservation { table: self, ip })
    }

    #[cfg(test)]
    pub(crate) async fn force_expiry(&self, ip: IpAddr, expires_at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        if let Some(lease) = state.by_ip.get_mut(&ip) {
            lease.expires_at = Some(expires_at);
        }
    }
}
