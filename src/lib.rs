//! # gatelease
//!
//! The lease core of a dual-stack DHCP service: address pools, conflict
//! probing, an invariant-checked lease table and expiry reaping, one
//! [`LeaseManager`] per network interface.
//!
//! ## Features
//!
//! - DHCPv4 ranges and stateful DHCPv6 (or SLAAC-only) per interface
//! - ICMP echo conflict probing before new dynamic leases are committed
//! - Static leases declared by the operator, never reaped or probed
//! - Unique address, hardware address and hostname per interface and family
//! - Lease persistence across restarts
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gatelease::{ClientRequest, Config, DhcpService, Family, IcmpProber};
//!
//! #[tokio::main]
//! async fn main() -> gatelease::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let service = DhcpService::new(config, Arc::new(IcmpProber::new())).await?;
//!     service.start().await;
//!
//!     let request = ClientRequest::new("02:00:00:00:00:01".parse()?, Family::V4);
//!     let lease = service.allocate("eth0", &request).await?;
//!     println!("{} -> {}", lease.hw_addr, lease.ip);
//!
//!     service.shutdown().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Interfaces, ranges, lease durations, probe timeout
//! - [`AddressPool`] - Range membership and allocation candidates
//! - [`ConflictProber`] - Is an address already answering on the network?
//! - [`LeaseTable`] - Authoritative lease store with uniqueness checks
//! - [`LeaseManager`] - Allocation and administration for one interface
//! - [`ExpiryReaper`] - Periodic removal of expired dynamic leases
//! - [`DhcpService`] - All interfaces, persistence and [`LeaseLookup`]

pub mod config;
pub mod error;
pub mod lease;
pub mod manager;
pub mod pool;
pub mod probe;
pub mod reaper;
pub mod service;
pub mod table;

pub use config::{Config, InterfaceConfig, V4Config, V6Config};
pub use error::{Error, Result};
pub use lease::{Family, HwAddr, Lease};
pub use manager::{ClientRequest, LeaseLookup, LeaseManager};
pub use pool::AddressPool;
pub use probe::{ConflictProber, IcmpProber, NoopProber};
pub use reaper::{ExpiryReaper, ReapListener, ReaperHandle};
pub use service::DhcpService;
pub use table::LeaseTable;
