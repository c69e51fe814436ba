//! Per-interface lease management.
//!
//! A [`LeaseManager`] owns the pool and lease table of each enabled family
//! on one network interface. It offers two ways in:
//!
//! - [`LeaseManager::allocate`] for decoded client requests. New dynamic
//!   addresses are probed for conflicts before they are committed.
//! - The administrative calls ([`add_lease`], [`edit_lease`],
//!   [`remove_lease`], [`reset`]), which are trusted and never probe.
//!
//! [`add_lease`]: LeaseManager::add_lease
//! [`edit_lease`]: LeaseManager::edit_lease
//! [`remove_lease`]: LeaseManager::remove_lease
//! [`reset`]: LeaseManager::reset

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::InterfaceConfig;
use crate::error::{Error, Result};
use crate::lease::{Family, HwAddr, Lease, sanitize_hostname, validate_hostname};
use crate::pool::AddressPool;
use crate::probe::ConflictProber;
use crate::table::{LeaseTable, Reservation};

/// Candidates probed per allocation before giving up.
const MAX_PROBE_ATTEMPTS: usize = 8;

/// Extra allocation rounds after a commit lost a race.
const COMMIT_RETRIES: usize = 1;

/// Read-only lookups used by the DNS side to resolve clients.
#[async_trait]
pub trait LeaseLookup: Send + Sync {
    /// Returns the hostname of the client holding `ip`, if it has one.
    async fn host_by_ip(&self, ip: IpAddr) -> Option<String>;

    /// Returns the hardware address of the client holding `ip`.
    async fn mac_by_ip(&self, ip: IpAddr) -> Option<HwAddr>;

    /// Returns the address leased to the client named `host`.
    async fn ip_by_host(&self, host: &str) -> Option<IpAddr>;
}

/// A decoded client request, as handed over by the protocol front end.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub hw_addr: HwAddr,
    pub family: Family,
    /// Address the client asked for or held before.
    pub requested_ip: Option<IpAddr>,
    pub hostname: Option<String>,
    /// After this instant the allocation is abandoned with [`Error::Timeout`].
    pub deadline: Option<Instant>,
}

impl ClientRequest {
    pub fn new(hw_addr: HwAddr, family: Family) -> Self {
        Self {
            hw_addr,
            family,
            requested_ip: None,
            hostname: None,
            deadline: None,
        }
    }

    pub fn with_requested_ip(mut self, ip: IpAddr) -> Self {
        self.requested_ip = Some(ip);
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn check_deadline(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::Timeout),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
struct FamilyLeases {
    pool: AddressPool,
    table: LeaseTable,
    lease_duration: Duration,
}

impl FamilyLeases {
    fn new(pool: AddressPool, lease_duration: Duration) -> Self {
        Self {
            table: LeaseTable::new(pool.family()),
            pool,
            lease_duration,
        }
    }
}

pub struct LeaseManager {
    name: String,
    v4: Option<FamilyLeases>,
    v6: Option<FamilyLeases>,
    prober: Arc<dyn ConflictProber>,
    probe_timeout: Duration,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("name", &self.name)
            .field("v4", &self.v4)
            .field("v6", &self.v6)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl LeaseManager {
    /// Creates a manager for the interface `name`.
    ///
    /// A zero `probe_timeout` turns conflict probing off.
    pub fn new(
        name: impl Into<String>,
        config: &InterfaceConfig,
        probe_timeout: Duration,
        prober: Arc<dyn ConflictProber>,
    ) -> Self {
        let name = name.into();
        let v4 = config
            .enabled_v4()
            .map(|v4| FamilyLeases::new(AddressPool::v4(v4), v4.lease_duration()));
        let v6 = config
            .enabled_v6()
            .map(|v6| FamilyLeases::new(AddressPool::v6(v6), v6.lease_duration()));

        if let Some(v4) = &v4 {
            info!(
                "{}: dhcpv4 range {} - {} ({} addresses)",
                name,
                v4.pool.range_start(),
                v4.pool.range_end(),
                v4.pool.size()
            );
        }
        if let Some(v6) = &v6 {
            if v6.pool.is_stateful() {
                info!(
                    "{}: dhcpv6 range {} - {}",
                    name,
                    v6.pool.range_start(),
                    v6.pool.range_end()
                );
            } else {
                info!("{}: dhcpv6 in SLAAC-only mode, no stateful pool", name);
            }
        }

        Self {
            name,
            v4,
            v6,
            prober,
            probe_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn family(&self, family: Family) -> Option<&FamilyLeases> {
        match family {
            Family::V4 => self.v4.as_ref(),
            Family::V6 => self.v6.as_ref(),
        }
    }

    fn families(&self) -> impl Iterator<Item = &FamilyLeases> {
        self.v4.iter().chain(self.v6.iter())
    }

    fn family_for_admin(&self, ip: IpAddr) -> Result<&FamilyLeases> {
        let family = Family::of(ip);
        self.family(family).ok_or_else(|| {
            Error::InvalidRequest(format!("{} is not enabled on {}", family, self.name))
        })
    }

    pub fn lease_duration(&self, family: Family) -> Option<Duration> {
        self.family(family).map(|leases| leases.lease_duration)
    }

    /// Returns true if `ip` belongs to one of this interface's subnets.
    pub fn serves(&self, ip: IpAddr) -> bool {
        self.families().any(|leases| leases.pool.in_subnet(ip))
    }

    /// Handles a discover/request-equivalent event and returns the
    /// committed lease.
    ///
    /// # Errors
    ///
    /// - [`Error::Conflict`] if another client holds the requested hostname
    ///   or a concurrent change kept winning the commit
    /// - [`Error::PoolExhausted`] if no free address passes the probe
    /// - [`Error::PoolDisabled`] if the family is off or SLAAC-only
    /// - [`Error::Timeout`] if the request deadline passes during probing
    pub async fn allocate(&self, request: &ClientRequest) -> Result<Lease> {
        let leases = self.family(request.family).ok_or_else(|| {
            Error::PoolDisabled(format!("{} is not enabled on {}", request.family, self.name))
        })?;
        request.hw_addr.validate_for(request.family)?;

        let hostname = request
            .hostname
            .as_deref()
            .and_then(sanitize_hostname)
            .unwrap_or_default();

        let mut retries = COMMIT_RETRIES;
        loop {
            if let Some(lease) = self.renew_existing(leases, &request.hw_addr).await? {
                return Ok(lease);
            }

            if !leases.pool.is_stateful() {
                return Err(Error::PoolDisabled(format!(
                    "stateful {} assignment is off on {}; clients use SLAAC",
                    request.family, self.name
                )));
            }

            if !hostname.is_empty()
                && let Some(holder) = leases.table.lookup_by_hostname(&hostname).await
                && holder.hw_addr != request.hw_addr
            {
                return Err(Error::Conflict(format!(
                    "hostname {:?} is already leased to {}",
                    hostname, holder.hw_addr
                )));
            }

            let reservation = self.reserve_probed(leases, request).await?;
            request.check_deadline()?;

            let lease = Lease::new_dynamic(
                reservation.ip(),
                request.hw_addr.clone(),
                hostname.clone(),
                leases.lease_duration,
            );

            match leases.table.commit(lease).await {
                Ok(lease) => {
                    info!(
                        "{}: leased {} to {} until {}",
                        self.name,
                        lease.ip,
                        lease.hw_addr,
                        lease
                            .expires_at
                            .map(|expires_at| expires_at.to_rfc3339())
                            .unwrap_or_default()
                    );
                    return Ok(lease);
                }
                Err(Error::Conflict(reason)) if retries > 0 => {
                    warn!("{}: commit lost a race ({}), retrying", self.name, reason);
                    retries -= 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Returns the client's current lease if it can be kept: static leases
    /// as they are, dynamic ones renewed in place. A dynamic lease whose
    /// address no longer fits the pool is dropped.
    async fn renew_existing(&self, leases: &FamilyLeases, hw_addr: &HwAddr) -> Result<Option<Lease>> {
        let Some(existing) = leases.table.lookup_by_hw(hw_addr).await else {
            return Ok(None);
        };

        if existing.is_static {
            return Ok(Some(existing));
        }

        if leases.pool.contains(existing.ip) {
            return match leases.table.renew(hw_addr, existing.ip, leases.lease_duration).await {
                Ok(lease) => {
                    debug!("{}: renewed {} for {}", self.name, lease.ip, hw_addr);
                    Ok(Some(lease))
                }
                Err(Error::NotFound(_)) => Ok(None),
                Err(error) => Err(error),
            };
        }

        info!(
            "{}: dropping lease {} for {}, address is outside the current range",
            self.name, existing.ip, hw_addr
        );
        match leases.table.remove(existing.ip, hw_addr).await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Reserves the first candidate that nothing answers for, trying the
    /// client's requested address first.
    async fn reserve_probed<'a>(
        &self,
        leases: &'a FamilyLeases,
        request: &ClientRequest,
    ) -> Result<Reservation<'a>> {
        let mut excluded = HashSet::new();

        if let Some(requested) = request.requested_ip
            && leases.pool.in_dynamic_range(requested)
            && let Some(reservation) = leases.table.reserve(requested).await
        {
            if !self.is_in_use(requested, request).await? {
                return Ok(reservation);
            }
            excluded.insert(requested);
        }

        for _ in 0..MAX_PROBE_ATTEMPTS {
            let reservation = leases
                .table
                .reserve_candidate(&leases.pool, &excluded)
                .await
                .ok_or(Error::PoolExhausted)?;

            let ip = reservation.ip();
            if !self.is_in_use(ip, request).await? {
                return Ok(reservation);
            }

            warn!(
                "{}: {} answered the conflict probe, skipping it",
                self.name, ip
            );
            excluded.insert(ip);
        }

        warn!(
            "{}: {} candidates in a row are in use, giving up on {}",
            self.name, MAX_PROBE_ATTEMPTS, request.hw_addr
        );
        Err(Error::PoolExhausted)
    }

    async fn is_in_use(&self, ip: IpAddr, request: &ClientRequest) -> Result<bool> {
        if self.probe_timeout.is_zero() {
            return Ok(false);
        }

        let probe = self.prober.probe(ip, self.probe_timeout);
        match request.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, probe)
                .await
                .map_err(|_| Error::Timeout),
            None => Ok(probe.await),
        }
    }

    /// Releases a client's dynamic lease (RELEASE-equivalent).
    pub async fn release(&self, hw_addr: &HwAddr, ip: IpAddr) -> Result<Lease> {
        let leases = self.family_for_admin(ip)?;
        match leases.table.lookup(ip).await {
            Some(lease) if lease.hw_addr == *hw_addr && lease.is_static => Err(
                Error::InvalidRequest(format!("lease {} for {} is static", ip, hw_addr)),
            ),
            _ => {
                let lease = leases.table.remove(ip, hw_addr).await?;
                info!("{}: released {} from {}", self.name, ip, hw_addr);
                Ok(lease)
            }
        }
    }

    /// Normalizes an administrative lease and checks it against the
    /// interface configuration.
    fn validate_admin_lease(&self, mut lease: Lease) -> Result<(&FamilyLeases, Lease)> {
        let leases = self.family_for_admin(lease.ip)?;
        lease.hw_addr.validate_for(lease.family())?;
        lease.hostname = validate_hostname(&lease.hostname)?;

        if lease.is_static {
            leases.pool.check_static(lease.ip)?;
            lease.expires_at = None;
        } else {
            if !leases.pool.contains(lease.ip) {
                return Err(Error::InvalidRequest(format!(
                    "dynamic lease address {} is outside the range",
                    lease.ip
                )));
            }
            if lease.expires_at.is_none() {
                return Err(Error::InvalidRequest(format!(
                    "dynamic lease {} has no expiry",
                    lease.ip
                )));
            }
        }

        Ok((leases, lease))
    }

    /// Adds a fully specified lease, typically a static one. No probing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for leases that don't fit the
    /// interface and [`Error::Conflict`] if the address, hardware address
    /// or hostname is taken.
    pub async fn add_lease(&self, lease: Lease) -> Result<Lease> {
        let (leases, lease) = self.validate_admin_lease(lease)?;
        let lease = leases.table.insert(lease).await?;
        info!(
            "{}: added {} lease {} for {}",
            self.name,
            if lease.is_static { "static" } else { "dynamic" },
            lease.ip,
            lease.hw_addr
        );
        Ok(lease)
    }

    /// Replaces `old` with `new`. A failed edit leaves `old` in place.
    ///
    /// `old` is looked up by its address and hardware address; its other
    /// fields may be out of date.
    pub async fn edit_lease(&self, old: &Lease, new: Lease) -> Result<Lease> {
        if old.family() != new.family() {
            return Err(Error::InvalidRequest(format!(
                "cannot move lease {} to {}",
                old.ip, new.ip
            )));
        }
        let (leases, new) = self.validate_admin_lease(new)?;
        let lease = leases.table.edit(old, new).await?;
        info!(
            "{}: edited lease {} ({}) -> {} ({})",
            self.name, old.ip, old.hw_addr, lease.ip, lease.hw_addr
        );
        Ok(lease)
    }

    /// Removes the lease matching `lease`'s address and hardware address.
    /// The remaining fields of `lease` are ignored.
    pub async fn remove_lease(&self, lease: &Lease) -> Result<Lease> {
        let leases = self.family_for_admin(lease.ip)?;
        let removed = leases.table.remove(lease.ip, &lease.hw_addr).await?;
        info!("{}: removed lease {} for {}", self.name, removed.ip, removed.hw_addr);
        Ok(removed)
    }

    /// Removes every lease of the interface and returns how many there were.
    pub async fn reset(&self) -> usize {
        let mut count = 0;
        for leases in self.families() {
            count += leases.table.reset().await;
        }
        info!("{}: reset, {} lease(s) removed", self.name, count);
        count
    }

    /// Removes dynamic leases that expired at or before `now`.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Vec<Lease> {
        let mut reaped = Vec::new();
        for leases in self.families() {
            reaped.extend(leases.table.reap_expired(now).await);
        }
        for lease in &reaped {
            info!("{}: lease {} for {} expired", self.name, lease.ip, lease.hw_addr);
        }
        reaped
    }

    /// Returns all leases, v4 before v6, each ordered by address.
    pub async fn leases(&self) -> Vec<Lease> {
        let mut all = Vec::new();
        for leases in self.families() {
            all.extend(leases.table.list().await);
        }
        all
    }

    pub async fn lease_by_ip(&self, ip: IpAddr) -> Option<Lease> {
        self.family(Family::of(ip))?.table.lookup(ip).await
    }

    pub async fn lease_by_hw(&self, family: Family, hw_addr: &HwAddr) -> Option<Lease> {
        self.family(family)?.table.lookup_by_hw(hw_addr).await
    }

    /// Looks the hostname up in the v4 table, then the v6 one.
    pub async fn lease_by_hostname(&self, hostname: &str) -> Option<Lease> {
        for leases in self.families() {
            if let Some(lease) = leases.table.lookup_by_hostname(hostname).await {
                return Some(lease);
            }
        }
        None
    }
}

#[async_trait]
impl LeaseLookup for LeaseManager {
    async fn host_by_ip(&self, ip: IpAddr) -> Option<String> {
        self.lease_by_ip(ip)
            .await
            .map(|lease| lease.hostname)
            .filter(|hostname| !hostname.is_empty())
    }

    async fn mac_by_ip(&self, ip: IpAddr) -> Option<HwAddr> {
        self.lease_by_ip(ip).await.map(|lease| lease.hw_addr)
    }

    async fn ip_by_host(&self, host: &str) -> Option<IpAddr> {
        self.lease_by_hostname(host).await.map(|lease| lease.ip)
    }
}
