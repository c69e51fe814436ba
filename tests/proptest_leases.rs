use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use proptest::prelude::*;

use gatelease::{
    ClientRequest, Family, HwAddr, InterfaceConfig, Lease, LeaseManager, NoopProber, V4Config,
};

const RANGE_START: u8 = 10;
const RANGE_END: u8 = 17;
const HOSTNAMES: [&str; 4] = ["", "laptop", "nas", "printer"];

#[derive(Debug, Clone)]
enum Op {
    AddStatic { last: u8, client: u8, host: usize },
    Edit { pick: usize, last: u8, client: u8, host: usize },
    Remove { pick: usize },
    Allocate { client: u8, host: usize, requested: Option<u8> },
    Release { pick: usize },
    Reap { after_seconds: i64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (2u8..40, 0u8..12, 0..HOSTNAMES.len())
            .prop_map(|(last, client, host)| Op::AddStatic { last, client, host }),
        (any::<usize>(), 2u8..40, 0u8..12, 0..HOSTNAMES.len()).prop_map(
            |(pick, last, client, host)| Op::Edit {
                pick,
                last,
                client,
                host
            }
        ),
        any::<usize>().prop_map(|pick| Op::Remove { pick }),
        (0u8..12, 0..HOSTNAMES.len(), proptest::option::of(RANGE_START..=RANGE_END))
            .prop_map(|(client, host, requested)| Op::Allocate {
                client,
                host,
                requested
            }),
        any::<usize>().prop_map(|pick| Op::Release { pick }),
        (0i64..120).prop_map(|after_seconds| Op::Reap { after_seconds }),
    ]
}

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

fn mac(client: u8) -> HwAddr {
    HwAddr::from([0x02, 0, 0, 0, 0, client])
}

fn manager() -> LeaseManager {
    let config = InterfaceConfig {
        dhcpv4: Some(V4Config {
            gateway_ip: Ipv4Addr::new(10, 0, 0, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            range_start: Ipv4Addr::new(10, 0, 0, RANGE_START),
            range_end: Ipv4Addr::new(10, 0, 0, RANGE_END),
            lease_duration_seconds: 60,
            enabled: true,
        }),
        dhcpv6: None,
    };
    LeaseManager::new("eth0", &config, Duration::ZERO, Arc::new(NoopProber))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn check_invariants(leases: &[Lease]) -> Result<(), TestCaseError> {
    let mut ips = HashSet::new();
    let mut hw_addrs = HashSet::new();
    let mut hostnames = HashSet::new();

    for lease in leases {
        prop_assert!(ips.insert(lease.ip), "duplicate address {}", lease.ip);
        prop_assert!(
            hw_addrs.insert(lease.hw_addr.clone()),
            "duplicate hardware address {}",
            lease.hw_addr
        );
        if !lease.hostname.is_empty() {
            prop_assert!(
                hostnames.insert(lease.hostname.to_lowercase()),
                "duplicate hostname {}",
                lease.hostname
            );
        }

        prop_assert_ne!(lease.ip, ip(1));
        prop_assert_ne!(lease.ip, ip(0));
        prop_assert_ne!(lease.ip, ip(255));
        if lease.is_static {
            prop_assert!(lease.expires_at.is_none());
        } else {
            let IpAddr::V4(v4) = lease.ip else {
                return Err(TestCaseError::fail("v6 lease in a v4 table"));
            };
            let last = v4.octets()[3];
            prop_assert!((RANGE_START..=RANGE_END).contains(&last));
            prop_assert!(lease.expires_at.is_some());
        }
    }

    Ok(())
}

fn pick(leases: &[Lease], index: usize) -> Option<Lease> {
    if leases.is_empty() {
        None
    } else {
        Some(leases[index % leases.len()].clone())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn random_operations_keep_leases_unique(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let runtime = runtime();
        runtime.block_on(async {
            let manager = manager();

            for op in ops {
                let before = manager.leases().await;

                match op {
                    Op::AddStatic { last, client, host } => {
                        let lease = Lease::new_static(ip(last), mac(client), HOSTNAMES[host]);
                        let _ = manager.add_lease(lease).await;
                    }
                    Op::Edit { pick: index, last, client, host } => {
                        if let Some(old) = pick(&before, index) {
                            let new = Lease::new_static(ip(last), mac(client), HOSTNAMES[host]);
                            if manager.edit_lease(&old, new.clone()).await.is_err() {
                                prop_assert_eq!(manager.lease_by_ip(old.ip).await, Some(old));
                            } else {
                                prop_assert_eq!(manager.lease_by_ip(new.ip).await.map(|lease| lease.hw_addr), Some(new.hw_addr));
                            }
                        }
                    }
                    Op::Remove { pick: index } => {
                        if let Some(lease) = pick(&before, index) {
                            prop_assert!(manager.remove_lease(&lease).await.is_ok());
                            prop_assert_eq!(manager.lease_by_ip(lease.ip).await, None);
                        }
                    }
                    Op::Allocate { client, host, requested } => {
                        let mut request = ClientRequest::new(mac(client), Family::V4)
                            .with_hostname(HOSTNAMES[host]);
                        if let Some(last) = requested {
                            request = request.with_requested_ip(ip(last));
                        }

                        if let Ok(first) = manager.allocate(&request).await {
                            let again = manager.allocate(&request).await;
                            prop_assert_eq!(again.map(|lease| lease.ip).ok(), Some(first.ip));
                        }
                    }
                    Op::Release { pick: index } => {
                        if let Some(lease) = pick(&before, index) {
                            let released = manager.release(&lease.hw_addr, lease.ip).await;
                            prop_assert_eq!(released.is_ok(), !lease.is_static);
                        }
                    }
                    Op::Reap { after_seconds } => {
                        let now = Utc::now() + TimeDelta::seconds(after_seconds);
                        manager.reap_expired(now).await;
                        for lease in manager.leases().await {
                            prop_assert!(!lease.is_expired_at(now));
                        }
                    }
                }

                check_invariants(&manager.leases().await)?;
            }

            Ok(())
        })?;
    }

    #[test]
    fn full_range_is_exhausted_after_its_size(extra in 1u8..4) {
        let runtime = runtime();
        runtime.block_on(async {
            let manager = manager();
            let size = RANGE_END - RANGE_START + 1;

            for client in 0..size {
                let request = ClientRequest::new(mac(client), Family::V4);
                prop_assert!(manager.allocate(&request).await.is_ok());
            }
            for client in size..size + extra {
                let request = ClientRequest::new(mac(client), Family::V4);
                prop_assert!(matches!(
                    manager.allocate(&request).await,
                    Err(gatelease::Error::PoolExhausted)
                ));
            }

            check_invariants(&manager.leases().await)
        })?;
    }
}
