//! Connection sampling: turns the loosely-typed tuples reported by the OS
//! into canonical, deduplicated [`ConnectionRecord`]s.
//!
//! The raw enumeration itself and pid-to-name mapping are external
//! collaborators behind the [`ConnectionSource`] and [`ProcessNameResolver`]
//! traits; this module owns normalization (protocol/state token mapping with
//! an explicit Unknown fallback), 4-tuple dedup within one sample, and the
//! local/remote classification used everywhere downstream.

use crate::errors::SampleError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a resolved (or failed) pid-to-name mapping stays cached before
/// the resolver is asked again.
const PROCESS_NAME_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Map an OS protocol token. Anything that is not a TCP/UDP socket
    /// (raw, unix, netlink) has no place in a connection sample.
    pub fn from_token(token: &str) -> Option<Protocol> {
        match token.to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Some(Protocol::Tcp),
            "udp" | "udp4" | "udp6" => Some(Protocol::Udp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Socket state as reported by the OS, normalized across the `ss`-style
/// abbreviations and the full netstat spellings. Unmapped tokens become
/// [`ConnState::Unknown`] rather than failing the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnState {
    Established,
    Listening,
    CloseWait,
    TimeWait,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    LastAck,
    Closing,
    Closed,
    Unknown,
}

impl ConnState {
    pub fn from_token(token: &str) -> ConnState {
        match token.to_ascii_uppercase().replace('-', "_").as_str() {
            "ESTABLISHED" | "ESTAB" => ConnState::Established,
            "LISTENING" | "LISTEN" => ConnState::Listening,
            "CLOSE_WAIT" => ConnState::CloseWait,
            "TIME_WAIT" => ConnState::TimeWait,
            "SYN_SENT" => ConnState::SynSent,
            "SYN_RECV" | "SYN_RCVD" => ConnState::SynRecv,
            "FIN_WAIT1" | "FIN_WAIT_1" => ConnState::FinWait1,
            "FIN_WAIT2" | "FIN_WAIT_2" => ConnState::FinWait2,
            "LAST_ACK" => ConnState::LastAck,
            "CLOSING" => ConnState::Closing,
            "CLOSED" | "CLOSE" => ConnState::Closed,
            _ => ConnState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Established => "ESTABLISHED",
            ConnState::Listening => "LISTENING",
            ConnState::CloseWait => "CLOSE_WAIT",
            ConnState::TimeWait => "TIME_WAIT",
            ConnState::SynSent => "SYN_SENT",
            ConnState::SynRecv => "SYN_RECV",
            ConnState::FinWait1 => "FIN_WAIT1",
            ConnState::FinWait2 => "FIN_WAIT2",
            ConnState::LastAck => "LAST_ACK",
            ConnState::Closing => "CLOSING",
            ConnState::Closed => "CLOSED",
            ConnState::Unknown => "UNKNOWN",
        }
    }
}

/// One connection tuple exactly as the OS collaborator reports it:
/// protocol/state still strings, process identity optional. Listening and
/// unconnected sockets carry no remote endpoint.
#[derive(Debug, Clone)]
pub struct RawConnection {
    pub protocol: String,
    pub state: String,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: Option<IpAddr>,
    pub remote_port: u16,
    pub pid: Option<u32>,
}

/// Canonical, immutable connection record. Identity within a sample is the
/// (local, local_port, remote, remote_port, protocol) tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub state: ConnState,
    pub pid: Option<u32>,
    /// `None` when the pid is missing or the resolver was denied; rendered
    /// as "unknown" at the presentation boundary.
    pub process_name: Option<String>,
    /// True when the remote endpoint is private/loopback/link-local (or
    /// unspecified, for listening sockets). Computed from the address
    /// alone, never from geolocation data.
    pub is_local: bool,
}

impl ConnectionRecord {
    pub fn key(&self) -> (IpAddr, u16, IpAddr, u16, Protocol) {
        (
            self.local_addr,
            self.local_port,
            self.remote_addr,
            self.remote_port,
            self.protocol,
        )
    }

    pub fn process_label(&self) -> &str {
        self.process_name.as_deref().unwrap_or("unknown")
    }
}

/// Membership test for the address ranges that count as "local": RFC1918 +
/// loopback + link-local for IPv4, loopback + link-local + unique-local for
/// IPv6, plus the unspecified address either way.
pub fn is_local_addr(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_unspecified() || v4.is_private() || v4.is_loopback() || v4.is_link_local()
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            v6.is_unspecified()
                || v6.is_loopback()
                // fe80::/10 link-local
                || (seg[0] & 0xffc0) == 0xfe80
                // fc00::/7 unique-local
                || (seg[0] & 0xfe00) == 0xfc00
        }
    }
}

/// OS-level connection enumeration, assumed provided by the host platform.
/// Implementations may silently omit entries the caller lacks permission to
/// see; they fail only when the enumeration itself is impossible.
pub trait ConnectionSource: Send + Sync {
    fn list_connections(&self) -> Result<Vec<RawConnection>, SampleError>;
}

/// Pid-to-name mapping, assumed provided by the host platform. `None` for
/// missing processes and permission failures alike.
pub trait ProcessNameResolver: Send + Sync {
    fn process_name(&self, pid: u32) -> Option<String>;
}

pub struct ConnectionSampler {
    source: Arc<dyn ConnectionSource>,
    resolver: Arc<dyn ProcessNameResolver>,
    // pid -> (name, resolved_at); failures are cached too, so a process we
    // cannot read is not re-queried on every tick.
    name_cache: Mutex<HashMap<u32, (Option<String>, Instant)>>,
}

impl ConnectionSampler {
    pub fn new(source: Arc<dyn ConnectionSource>, resolver: Arc<dyn ProcessNameResolver>) -> Self {
        ConnectionSampler {
            source,
            resolver,
            name_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Take one snapshot of the connection table. Fails only if the source
    /// collaborator fails; individual malformed or unresolvable entries are
    /// skipped or degraded, never fatal.
    pub fn sample(&self) -> Result<Vec<ConnectionRecord>, SampleError> {
        let raw = self.source.list_connections()?;

        let mut seen: HashSet<(IpAddr, u16, IpAddr, u16, Protocol)> = HashSet::new();
        let mut records = Vec::with_capacity(raw.len());

        for entry in raw {
            let protocol = match Protocol::from_token(&entry.protocol) {
                Some(p) => p,
                None => {
                    debug!("skipping non-inet socket (protocol '{}')", entry.protocol);
                    continue;
                }
            };
            let state = ConnState::from_token(&entry.state);

            // Listening/unconnected sockets have no peer; give them the
            // unspecified address of the matching family so the identity
            // key stays total.
            let remote_addr = entry.remote_addr.unwrap_or(match entry.local_addr {
                IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
            });

            let key = (
                entry.local_addr,
                entry.local_port,
                remote_addr,
                entry.remote_port,
                protocol,
            );
            // Exact repeats within one sample: keep the first occurrence.
            if !seen.insert(key) {
                continue;
            }

            let process_name = entry.pid.and_then(|pid| self.lookup_name(pid));

            records.push(ConnectionRecord {
                local_addr: entry.local_addr,
                local_port: entry.local_port,
                remote_addr,
                remote_port: entry.remote_port,
                protocol,
                state,
                pid: entry.pid,
                process_name,
                is_local: is_local_addr(&remote_addr),
            });
        }

        Ok(records)
    }

    fn lookup_name(&self, pid: u32) -> Option<String> {
        let mut cache = self.name_cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((name, resolved_at)) = cache.get(&pid) {
            if resolved_at.elapsed() < PROCESS_NAME_TTL {
                return name.clone();
            }
        }
        let name = self.resolver.process_name(pid);
        cache.insert(pid, (name.clone(), Instant::now()));
        name
    }
}
