//! Endpoint identity and address classification.
//!
//! An [`Endpoint`] (IP + port) is the unique key of the address database.
//! Classification decides two things: whether an address is worth crawling at
//! all ([`Endpoint::is_routable`]), and which transport it must be reached
//! through ([`NetworkClass`] selects between a direct connection and the
//! per-class SOCKS5 proxies).
//!
//! Tor hidden services are represented in the OnionCat range
//! (`fd87:d87e:eb43::/48`), so they ride through the same `Ipv6Addr` plumbing
//! as everything else and are routed to the onion proxy at connect time.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default peer port of the network; non-default ports never become good.
pub const DEFAULT_PORT: u16 = 8333;

/// Service bit advertised by full nodes able to serve the whole chain.
pub const NODE_NETWORK: u64 = 1 << 0;

/// OnionCat prefix used to embed .onion identities into IPv6.
const ONIONCAT_PREFIX: [u8; 6] = [0xfd, 0x87, 0xd8, 0x7e, 0xeb, 0x43];

/// Transport class of an endpoint, used to pick the outbound proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkClass {
    Ipv4,
    Ipv6,
    Onion,
}

/// A candidate peer address: IP plus TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    ip: IpAddr,
    port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn network_class(&self) -> NetworkClass {
        match self.ip {
            IpAddr::V4(_) => NetworkClass::Ipv4,
            IpAddr::V6(v6) if is_onioncat(&v6) => NetworkClass::Onion,
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => NetworkClass::Ipv4,
            IpAddr::V6(_) => NetworkClass::Ipv6,
        }
    }

    /// Whether this address may be handed out or crawled: publicly reachable,
    /// not in any private/reserved/local range. OnionCat addresses count as
    /// routable since they are reachable through the onion proxy.
    pub fn is_routable(&self) -> bool {
        is_routable_ip(normalize(self.ip))
    }

    /// Hidden-service hostname for OnionCat endpoints, e.g.
    /// `"abcdefghijklmnop.onion"`; `None` for everything else. The SOCKS5
    /// connector sends this as the target so the proxy resolves the service.
    pub fn onion_host(&self) -> Option<String> {
        match self.ip {
            IpAddr::V6(v6) if is_onioncat(&v6) => {
                let o = v6.octets();
                let mut payload = [0u8; 10];
                payload.copy_from_slice(&o[6..16]);
                Some(format!("{}.onion", base32_lower(&payload)))
            }
            _ => None,
        }
    }

    /// The 16-byte on-wire form (IPv4 as v4-mapped IPv6).
    pub fn wire_bytes(&self) -> [u8; 16] {
        match self.ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    /// Reconstruct from the 16-byte on-wire form, collapsing v4-mapped
    /// addresses back to `IpAddr::V4`.
    pub fn from_wire_bytes(bytes: [u8; 16], port: u16) -> Self {
        let v6 = Ipv6Addr::from(bytes);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
            IpAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sa: SocketAddr = s.parse()?;
        Ok(Self::new(sa.ip(), sa.port()))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(sa: SocketAddr) -> Self {
        Self::new(sa.ip(), sa.port())
    }
}

fn is_onioncat(v6: &Ipv6Addr) -> bool {
    v6.octets()[..6] == ONIONCAT_PREFIX
}

/// RFC4648 base32, lowercase, no padding. 10 bytes encode to exactly 16
/// characters, the onion v2 name length.
fn base32_lower(data: &[u8; 10]) -> String {
    const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = String::with_capacity(16);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &b in data {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[(acc >> bits) as usize & 31] as char);
        }
    }
    out
}

fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

fn is_routable_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_routable_v4(v4),
        IpAddr::V6(v6) => is_routable_v6(v6),
    }
}

fn is_routable_v4(v4: Ipv4Addr) -> bool {
    if v4.is_unspecified() || v4.is_loopback() || v4.is_broadcast() || v4.is_multicast() {
        return false;
    }
    // RFC1918, RFC3927 link-local, RFC6598 CGN, 0.0.0.0/8 and class E.
    let o = v4.octets();
    if v4.is_private() || v4.is_link_local() {
        return false;
    }
    if o[0] == 0 || o[0] >= 240 {
        return false;
    }
    if o[0] == 100 && (o[1] & 0xc0) == 64 {
        return false;
    }
    true
}

fn is_routable_v6(v6: Ipv6Addr) -> bool {
    if v6.is_unspecified() || v6.is_loopback() || v6.is_multicast() {
        return false;
    }
    let o = v6.octets();
    // Documentation prefix 2001:db8::/32 (RFC3849).
    if o[0] == 0x20 && o[1] == 0x01 && o[2] == 0x0d && o[3] == 0xb8 {
        return false;
    }
    // Link-local fe80::/10 (RFC4862).
    if o[0] == 0xfe && (o[1] & 0xc0) == 0x80 {
        return false;
    }
    // ORCHID 2001:10::/28 (RFC4843).
    if o[0] == 0x20 && o[1] == 0x01 && o[2] == 0x00 && (o[3] & 0xf0) == 0x10 {
        return false;
    }
    // Unique local fc00::/7 (RFC4193), except the OnionCat range which is
    // reachable through the onion proxy.
    if (o[0] & 0xfe) == 0xfc {
        return is_onioncat(&v6);
    }
    true
}
