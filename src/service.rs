//! All interfaces of a DHCP deployment behind one handle.
//!
//! [`DhcpService`] builds a [`LeaseManager`] per configured interface,
//! routes administrative changes to the interface whose subnet holds the
//! address, persists leases to the JSON lease file and owns the reaper.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::{HwAddr, Lease};
use crate::manager::{ClientRequest, LeaseLookup, LeaseManager};
use crate::probe::ConflictProber;
use crate::reaper::{ExpiryReaper, ReapListener, ReaperHandle};

#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseFile {
    leases: Vec<StoredLease>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredLease {
    interface: String,
    #[serde(flatten)]
    lease: Lease,
}

#[derive(Debug)]
struct SaveState {
    dirty: bool,
    last_save: Option<Instant>,
}

/// Owns the lease file.
///
/// Changes mark the store dirty and are written at most once per
/// `save_interval`. A pending change is flushed by the next change, the
/// next reap pass or an explicit [`LeaseStore::save`].
#[derive(Debug)]
struct LeaseStore {
    path: String,
    save_interval: Duration,
    managers: BTreeMap<String, Arc<LeaseManager>>,
    /// Held across the write, so writes never interleave.
    state: Mutex<SaveState>,
}

impl LeaseStore {
    async fn save(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.write(&mut state).await
    }

    async fn maybe_save(&self, changed: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.dirty |= changed;

        let due = state
            .last_save
            .is_none_or(|last| last.elapsed() >= self.save_interval);
        if state.dirty && due {
            self.write(&mut state).await?;
        }
        Ok(())
    }

    async fn write(&self, state: &mut SaveState) -> Result<()> {
        if self.path.is_empty() {
            state.dirty = false;
            return Ok(());
        }

        let mut file = LeaseFile::default();
        for (name, manager) in &self.managers {
            file.leases
                .extend(manager.leases().await.into_iter().map(|lease| StoredLease {
                    interface: name.clone(),
                    lease,
                }));
        }

        let content = serde_json::to_string_pretty(&file)?;
        tokio::fs::write(&self.path, content).await?;
        state.dirty = false;
        state.last_save = Some(Instant::now());
        debug!("Saved {} lease(s) to {}", file.leases.len(), self.path);
        Ok(())
    }
}

#[async_trait]
impl ReapListener for LeaseStore {
    async fn reaped(&self, count: usize) {
        if let Err(error) = self.maybe_save(count > 0).await {
            warn!("Failed to save leases after reap pass: {}", error);
        }
    }
}

#[derive(Debug)]
pub struct DhcpService {
    config: Config,
    managers: BTreeMap<String, Arc<LeaseManager>>,
    reaper_handle: Mutex<Option<ReaperHandle>>,
    store: Arc<LeaseStore>,
}

impl DhcpService {
    /// Creates the service and restores leases from the configured lease
    /// file.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the lease file
    /// exists but cannot be read or parsed. Individual stored leases that
    /// no longer fit the configuration are skipped, not reported.
    pub async fn new(config: Config, prober: Arc<dyn ConflictProber>) -> Result<Self> {
        config.validate()?;

        let mut managers = BTreeMap::new();
        if config.enabled {
            for (name, interface) in &config.interfaces {
                if interface.enabled_v4().is_none() && interface.enabled_v6().is_none() {
                    debug!("{}: no family enabled, skipping", name);
                    continue;
                }
                let manager = LeaseManager::new(
                    name.clone(),
                    interface,
                    config.icmp_timeout(),
                    Arc::clone(&prober),
                );
                managers.insert(name.clone(), Arc::new(manager));
            }
        } else {
            info!("DHCP is disabled in the configuration");
        }

        let store = Arc::new(LeaseStore {
            path: config.leases_file.clone(),
            save_interval: config.save_interval(),
            managers: managers.clone(),
            state: Mutex::new(SaveState {
                dirty: false,
                last_save: None,
            }),
        });
        let service = Self {
            config,
            managers,
            reaper_handle: Mutex::new(None),
            store,
        };
        service.restore().await?;
        Ok(service)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self, interface: &str) -> Option<&Arc<LeaseManager>> {
        self.managers.get(interface)
    }

    pub fn managers(&self) -> impl Iterator<Item = &Arc<LeaseManager>> {
        self.managers.values()
    }

    fn manager_for(&self, ip: IpAddr) -> Result<&Arc<LeaseManager>> {
        self.managers
            .values()
            .find(|manager| manager.serves(ip))
            .ok_or_else(|| Error::InvalidRequest(format!("no interface serves {}", ip)))
    }

    /// Allocates for a client request received on `interface`.
    pub async fn allocate(&self, interface: &str, request: &ClientRequest) -> Result<Lease> {
        let manager = self
            .manager(interface)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown interface {:?}", interface)))?;
        let lease = manager.allocate(request).await?;
        self.persist().await;
        Ok(lease)
    }

    /// Returns the leases of all interfaces, ordered by interface name.
    pub async fn leases(&self) -> Vec<Lease> {
        let mut all = Vec::new();
        for manager in self.managers.values() {
            all.extend(manager.leases().await);
        }
        all
    }

    pub async fn lease_by_ip(&self, ip: IpAddr) -> Option<Lease> {
        self.manager_for(ip).ok()?.lease_by_ip(ip).await
    }

    /// Looks up `hostname` on every interface. A `.<local_domain_name>`
    /// suffix is accepted.
    pub async fn lease_by_hostname(&self, hostname: &str) -> Option<Lease> {
        let hostname = self.strip_local_domain(hostname);
        for manager in self.managers.values() {
            if let Some(lease) = manager.lease_by_hostname(hostname).await {
                return Some(lease);
            }
        }
        None
    }

    fn strip_local_domain<'a>(&self, hostname: &'a str) -> &'a str {
        let domain = self.config.local_domain_name.trim_matches('.');
        if domain.is_empty() || hostname.len() <= domain.len() + 1 {
            return hostname;
        }

        match hostname.rsplit_once('.') {
            Some((name, suffix)) if !name.is_empty() && suffix.eq_ignore_ascii_case(domain) => {
                name
            }
            _ => hostname,
        }
    }

    /// Marks the lease file dirty and writes it if the save interval has
    /// passed. A failed write is logged; the change itself stands.
    async fn persist(&self) {
        if let Err(error) = self.store.maybe_save(true).await {
            warn!(
                "Failed to save leases to {}: {}",
                self.config.leases_file, error
            );
        }
    }

    pub async fn add_lease(&self, lease: Lease) -> Result<Lease> {
        let lease = self.manager_for(lease.ip)?.add_lease(lease).await?;
        self.persist().await;
        Ok(lease)
    }

    /// Replaces `old` with `new`. Both must belong to the same interface.
    pub async fn edit_lease(&self, old: &Lease, new: Lease) -> Result<Lease> {
        let manager = self.manager_for(old.ip)?;
        if !manager.serves(new.ip) {
            return Err(Error::InvalidRequest(format!(
                "{} is not on interface {}",
                new.ip,
                manager.name()
            )));
        }
        let lease = manager.edit_lease(old, new).await?;
        self.persist().await;
        Ok(lease)
    }

    pub async fn remove_lease(&self, lease: &Lease) -> Result<Lease> {
        let removed = self.manager_for(lease.ip)?.remove_lease(lease).await?;
        self.persist().await;
        Ok(removed)
    }

    /// Releases a client's dynamic lease on whichever interface holds it.
    pub async fn release(&self, hw_addr: &HwAddr, ip: IpAddr) -> Result<Lease> {
        let released = self.manager_for(ip)?.release(hw_addr, ip).await?;
        self.persist().await;
        Ok(released)
    }

    /// Clears the leases of every interface.
    pub async fn reset(&self) -> usize {
        let mut count = 0;
        for manager in self.managers.values() {
            count += manager.reset().await;
        }
        if count > 0 {
            self.persist().await;
        }
        count
    }

    /// A reaper over every interface. Passes that remove leases update the
    /// lease file.
    pub fn reaper(&self) -> ExpiryReaper {
        let listener: Arc<dyn ReapListener> = self.store.clone();
        ExpiryReaper::new(self.managers.values().cloned().collect()).with_listener(listener)
    }

    /// Starts the background reaper. Calling it again is a no-op.
    pub async fn start(&self) {
        let mut handle = self.reaper_handle.lock().await;
        if handle.is_none() {
            *handle = Some(self.reaper().spawn());
        }
    }

    /// Stops the reaper and writes the lease file.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.reaper_handle.lock().await.take() {
            handle.shutdown().await;
        }
        self.save().await
    }

    /// Writes all leases to the lease file now, ignoring the save
    /// interval. Does nothing when no lease file is configured.
    pub async fn save(&self) -> Result<()> {
        self.store.save().await
    }

    async fn restore(&self) -> Result<usize> {
        let path = Path::new(&self.config.leases_file);
        if self.config.leases_file.is_empty() || !path.exists() {
            return Ok(0);
        }

        let content = tokio::fs::read_to_string(path).await?;
        let file: LeaseFile = serde_json::from_str(&content)?;

        let mut restored = 0;
        for StoredLease { interface, lease } in file.leases {
            let Some(manager) = self.managers.get(&interface) else {
                warn!(
                    "Skipping stored lease {}: interface {:?} is not configured",
                    lease.ip, interface
                );
                continue;
            };

            if lease.is_expired() {
                debug!("Skipping expired stored lease {} for {}", lease.ip, lease.hw_addr);
                continue;
            }

            let ip = lease.ip;
            match manager.add_lease(lease).await {
                Ok(_) => restored += 1,
                Err(error) => warn!("Skipping stored lease {}: {}", ip, error),
            }
        }

        info!("Restored {} lease(s) from {}", restored, self.config.leases_file);
        Ok(restored)
    }
}

#[async_trait]
impl LeaseLookup for DhcpService {
    async fn host_by_ip(&self, ip: IpAddr) -> Option<String> {
        self.manager_for(ip).ok()?.host_by_ip(ip).await
    }

    async fn mac_by_ip(&self, ip: IpAddr) -> Option<HwAddr> {
        self.manager_for(ip).ok()?.mac_by_ip(ip).await
    }

    async fn ip_by_host(&self, host: &str) -> Option<IpAddr> {
        self.lease_by_hostname(host).await.map(|lease| lease.ip)
    }
}
