//! Conflict probing before a dynamic lease is committed.
//!
//! A probe sends one ICMP echo request to the candidate address and waits
//! for a reply until the timeout runs out. Probing fails open: send or
//! receive errors are logged and reported as "not in use", so a broken
//! network path never blocks address assignment.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const ICMP_HEADER_SIZE: usize = 8;
const ECHO_PAYLOAD: &[u8] = b"gatelease-probe";
const RECV_BUFFER_SIZE: usize = 1500;

/// Answers whether an address is already in use on the network.
#[async_trait]
pub trait ConflictProber: Send + Sync {
    /// Returns true if `ip` answered within `timeout`.
    ///
    /// Implementations must not fail: errors count as "not in use".
    async fn probe(&self, ip: IpAddr, timeout: Duration) -> bool;
}

/// Probes with ICMP echo requests.
///
/// Uses an unprivileged datagram ICMP socket where the OS allows it and
/// falls back to a raw socket otherwise.
#[derive(Debug)]
pub struct IcmpProber {
    identifier: u16,
    sequence: AtomicU16,
}

impl Default for IcmpProber {
    fn default() -> Self {
        Self::new()
    }
}

impl IcmpProber {
    pub fn new() -> Self {
        Self {
            identifier: std::process::id() as u16,
            sequence: AtomicU16::new(0),
        }
    }

    async fn try_probe(&self, ip: IpAddr, timeout: Duration) -> Result<bool> {
        let socket = create_socket(ip)?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let request = echo_request(ip, self.identifier, sequence);

        socket.send_to(&request, SocketAddr::new(ip, 0)).await?;

        let deadline = Instant::now() + timeout;
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        loop {
            match tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await {
                Err(_) => return Ok(false),
                Ok(Err(error)) => return Err(error.into()),
                Ok(Ok((size, source))) => {
                    if source.ip() == ip && is_echo_reply(ip, &buffer[..size]) {
                        return Ok(true);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ConflictProber for IcmpProber {
    async fn probe(&self, ip: IpAddr, timeout: Duration) -> bool {
        match self.try_probe(ip, timeout).await {
            Ok(in_use) => {
                debug!("Probe {}: {}", ip, if in_use { "in use" } else { "no reply" });
                in_use
            }
            Err(error) => {
                warn!("Probe of {} failed, treating address as free: {}", ip, error);
                false
            }
        }
    }
}

fn create_socket(ip: IpAddr) -> Result<UdpSocket> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::RAW, Some(protocol)))
        .map_err(|error| Error::Socket(format!("Failed to create ICMP socket: {}", error)))?;

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|error| Error::Socket(format!("Failed to convert to tokio socket: {}", error)))
}

fn echo_request(ip: IpAddr, identifier: u16, sequence: u16) -> Vec<u8> {
    let kind = match ip {
        IpAddr::V4(_) => ICMPV4_ECHO_REQUEST,
        IpAddr::V6(_) => ICMPV6_ECHO_REQUEST,
    };

    let mut packet = Vec::with_capacity(ICMP_HEADER_SIZE + ECHO_PAYLOAD.len());
    packet.extend_from_slice(&[kind, 0, 0, 0]);
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(ECHO_PAYLOAD);

    // The kernel fills in the ICMPv6 checksum since it covers the
    // pseudo-header.
    if ip.is_ipv4() {
        let checksum = internet_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Raw v4 sockets deliver the IP header in front of the ICMP message;
/// datagram sockets and v6 sockets do not.
fn is_echo_reply(ip: IpAddr, data: &[u8]) -> bool {
    match ip {
        IpAddr::V4(_) => {
            let offset = match data.first() {
                Some(first) if first >> 4 == 4 => usize::from(first & 0x0f) * 4,
                _ => 0,
            };
            data.get(offset) == Some(&ICMPV4_ECHO_REPLY)
        }
        IpAddr::V6(_) => data.first() == Some(&ICMPV6_ECHO_REPLY),
    }
}

fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|chunk| {
            let high = u32::from(chunk[0]) << 8;
            let low = chunk.get(1).copied().map(u32::from).unwrap_or(0);
            high | low
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

/// Prober for deployments with probing switched off; nothing is ever in use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProber;

#[async_trait]
impl ConflictProber for NoopProber {
    async fn probe(&self, _ip: IpAddr, _timeout: Duration) -> bool {
        false
    }
}
