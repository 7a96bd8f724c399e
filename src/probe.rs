//! Single-peer probe: connect, handshake, optionally harvest gossip.
//!
//! A probe runs the `version`/`verack` exchange against one endpoint and
//! reports a [`ProbeOutcome`] for the database. The probe never decides
//! policy itself; it only distinguishes three endings:
//!
//! - handshake completed (success, plus whatever addresses were gossiped),
//! - connection-level failure (refused, timeout, EOF): plain failure,
//! - protocol violation (bad magic, bad checksum, structurally invalid
//!   message): failure carrying an explicit ban request.
//!
//! Onion endpoints and optionally clearnet ones go through SOCKS5 proxies;
//! the OnionCat encoding is unpacked back into a `.onion` hostname for the
//! proxy to resolve.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use crate::db::unix_now;
use crate::netaddr::{Endpoint, NetworkClass, NODE_NETWORK};
use crate::wire::{
    build_message, build_version_payload, checksum, decode_addr, header_size, DecodeError,
    MessageHeader, Reader, SeenAddress, VersionMessage, CHECKSUM_VERSION, MAX_ADDR_PER_MESSAGE,
    PROTOCOL_VERSION,
};

/// TCP (or proxy) connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle read timeout and gossip collection window for direct connections.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Onion circuits are slow; give them a much longer window.
const ONION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to keep listening after the first `addr` reply arrived.
const ADDR_LINGER: Duration = Duration::from_secs(1);

/// Ban requested for peers caught violating the protocol.
const VIOLATION_BAN_SECS: u64 = 100_000;

/// Gossiped timestamps outside a sane range are rewritten to this far in the
/// past (still within the keep window, so the entry is not dropped outright).
const CLAMP_BACKDATE_SECS: u64 = 5 * 86400;

/// Gossiped addresses older than this are discarded entirely.
const KEEP_WINDOW_SECS: u64 = 7 * 86400;

/// Per-class SOCKS5 proxies. Clearnet classes connect directly when unset;
/// onion endpoints are unreachable without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyConfig {
    pub ipv4: Option<SocketAddr>,
    pub ipv6: Option<SocketAddr>,
    pub onion: Option<SocketAddr>,
}

/// What one probe attempt learned about an endpoint.
#[derive(Debug, Clone, Default)]
pub struct ProbeOutcome {
    pub success: bool,
    /// Nonzero when the peer committed a protocol violation.
    pub ban_secs: u64,
    pub client_version: i32,
    pub client_subversion: String,
    pub blocks: i32,
    /// Gossip harvested during the session, already timestamp-clamped.
    pub addrs: Vec<SeenAddress>,
}

/// Reusable prober; cheap to clone, one instance shared by all workers.
#[derive(Debug, Clone)]
pub struct ProbeClient {
    pub proxies: ProxyConfig,
    pub user_agent: String,
    pub best_height: i32,
}

enum ProbeError {
    /// Endpoint cannot be reached at all with the current configuration.
    Unreachable(&'static str),
    /// Connection-level failure; no ban.
    Io(std::io::Error),
    /// Protocol violation; request a ban.
    Violation(&'static str),
}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        ProbeError::Io(e)
    }
}

impl From<tokio::time::error::Elapsed> for ProbeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProbeError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut))
    }
}

enum Flow {
    Continue,
    Finish,
}

impl ProbeClient {
    /// Probe one endpoint. `want_gossip` controls whether `getaddr` is sent
    /// and the session kept open to collect `addr` replies.
    pub async fn probe(&self, ep: Endpoint, want_gossip: bool) -> ProbeOutcome {
        let mut out = ProbeOutcome::default();
        match self.run(ep, want_gossip, &mut out).await {
            Ok(()) => {}
            Err(ProbeError::Unreachable(why)) => {
                tracing::trace!(endpoint = %ep, why, "endpoint unreachable");
                out.success = false;
            }
            Err(ProbeError::Io(e)) => {
                tracing::trace!(endpoint = %ep, error = %e, "probe failed");
                out.success = false;
            }
            Err(ProbeError::Violation(why)) => {
                tracing::debug!(endpoint = %ep, why, "protocol violation");
                out.success = false;
                out.ban_secs = VIOLATION_BAN_SECS;
            }
        }
        out
    }

    async fn run(
        &self,
        ep: Endpoint,
        want_gossip: bool,
        out: &mut ProbeOutcome,
    ) -> Result<(), ProbeError> {
        let is_onion = ep.network_class() == NetworkClass::Onion;
        let idle = if is_onion { ONION_IDLE_TIMEOUT } else { IDLE_TIMEOUT };
        let mut stream = self.connect(&ep).await?;

        let nonce: u64 = rand::random();
        let version_payload = build_version_payload(
            &ep,
            NODE_NETWORK,
            nonce,
            &self.user_agent,
            self.best_height,
            unix_now() as i64,
        );
        stream
            .write_all(&build_message("version", &version_payload, PROTOCOL_VERSION))
            .await?;

        let mut buf: Vec<u8> = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        // Negotiated serialization version; ours until theirs is known.
        let mut serial_version = PROTOCOL_VERSION;
        let mut got_version = false;
        // Set once the handshake completes and we are only waiting on gossip.
        let mut done_after: Option<Instant> = None;

        loop {
            // Drain every complete message currently buffered. Legacy peers
            // frame with the short checksum-less header, so the size follows
            // the negotiated version.
            loop {
                let hlen = header_size(serial_version);
                let mut r = Reader::new(&buf);
                let hdr = match MessageHeader::decode(&mut r, serial_version) {
                    Ok(hdr) => hdr,
                    Err(DecodeError::Truncated) => break,
                    Err(DecodeError::Malformed(why)) => return Err(ProbeError::Violation(why)),
                };
                let total = hlen + hdr.payload_len as usize;
                if buf.len() < total {
                    break;
                }
                let payload: Vec<u8> = buf[hlen..total].to_vec();
                buf.drain(..total);
                if serial_version >= CHECKSUM_VERSION && checksum(&payload) != hdr.checksum {
                    return Err(ProbeError::Violation("bad checksum"));
                }
                let flow = self
                    .handle_message(
                        &hdr.command,
                        &payload,
                        &mut stream,
                        &mut serial_version,
                        &mut got_version,
                        &mut done_after,
                        want_gossip,
                        idle,
                        out,
                    )
                    .await?;
                if matches!(flow, Flow::Finish) {
                    out.success = true;
                    return Ok(());
                }
            }

            // Handshake complete and collection window expired: success.
            if let Some(deadline) = done_after {
                if Instant::now() >= deadline {
                    out.success = true;
                    return Ok(());
                }
            }

            let read_window = match done_after {
                Some(deadline) => idle.min(deadline.saturating_duration_since(Instant::now())),
                None => idle,
            };
            let n = match timeout(read_window, stream.read(&mut chunk)).await {
                Ok(res) => res?,
                Err(_) if done_after.is_some() => {
                    out.success = true;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                // EOF before the handshake finished is a plain failure.
                if done_after.is_some() {
                    out.success = true;
                    return Ok(());
                }
                return Err(ProbeError::Io(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_message(
        &self,
        command: &str,
        payload: &[u8],
        stream: &mut TcpStream,
        serial_version: &mut i32,
        got_version: &mut bool,
        done_after: &mut Option<Instant>,
        want_gossip: bool,
        idle: Duration,
        out: &mut ProbeOutcome,
    ) -> Result<Flow, ProbeError> {
        match command {
            "version" => {
                let mut r = Reader::new(payload);
                // The payload is complete here, so a truncated decode means
                // the message itself is short: a violation either way.
                let v = match VersionMessage::decode(&mut r) {
                    Ok(v) => v,
                    Err(DecodeError::Malformed(why)) => return Err(ProbeError::Violation(why)),
                    Err(DecodeError::Truncated) => {
                        return Err(ProbeError::Violation("short version payload"))
                    }
                };
                *got_version = true;
                *serial_version = v.version.min(PROTOCOL_VERSION);
                out.client_version = v.version;
                out.client_subversion = v.subversion;
                out.blocks = v.start_height;
                // Pre-209 peers neither send nor expect verack; their
                // version message is the whole handshake.
                if v.version < CHECKSUM_VERSION {
                    return self
                        .complete_handshake(stream, *serial_version, done_after, want_gossip, idle)
                        .await;
                }
                stream
                    .write_all(&build_message("verack", &[], *serial_version))
                    .await?;
                Ok(Flow::Continue)
            }
            "verack" => {
                if !*got_version {
                    return Err(ProbeError::Violation("verack before version"));
                }
                self.complete_handshake(stream, *serial_version, done_after, want_gossip, idle)
                    .await
            }
            "addr" => {
                let mut r = Reader::new(payload);
                let entries = match decode_addr(&mut r, *serial_version) {
                    Ok(entries) => entries,
                    Err(DecodeError::Malformed(why)) => return Err(ProbeError::Violation(why)),
                    Err(DecodeError::Truncated) => {
                        return Err(ProbeError::Violation("truncated addr payload"))
                    }
                };
                let now = unix_now();
                out.addrs
                    .extend(entries.into_iter().filter_map(|a| clamp_address(a, now)));
                if out.addrs.len() as u64 >= MAX_ADDR_PER_MESSAGE {
                    return Ok(Flow::Finish);
                }
                // First reply in hand: pull the deadline close so the session
                // ends as soon as the peer stops sending, not at the full
                // collection window.
                let soon = Instant::now() + ADDR_LINGER;
                if done_after.map_or(true, |d| d > soon) {
                    *done_after = Some(soon);
                }
                Ok(Flow::Continue)
            }
            // Anything else (ping, inv, alert, ...) is irrelevant here.
            _ => Ok(Flow::Continue),
        }
    }

    /// Common tail of the handshake: either request gossip and arm the
    /// collection deadline, or declare the probe finished.
    async fn complete_handshake(
        &self,
        stream: &mut TcpStream,
        serial_version: i32,
        done_after: &mut Option<Instant>,
        want_gossip: bool,
        idle: Duration,
    ) -> Result<Flow, ProbeError> {
        if want_gossip {
            stream
                .write_all(&build_message("getaddr", &[], serial_version))
                .await?;
            *done_after = Some(Instant::now() + idle);
            Ok(Flow::Continue)
        } else {
            Ok(Flow::Finish)
        }
    }

    async fn connect(&self, ep: &Endpoint) -> Result<TcpStream, ProbeError> {
        let proxy = match ep.network_class() {
            NetworkClass::Ipv4 => self.proxies.ipv4,
            NetworkClass::Ipv6 => self.proxies.ipv6,
            NetworkClass::Onion => match self.proxies.onion {
                Some(p) => Some(p),
                None => return Err(ProbeError::Unreachable("no onion proxy configured")),
            },
        };
        match proxy {
            Some(proxy) => {
                let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(proxy)).await??;
                timeout(CONNECT_TIMEOUT, socks5_connect(stream, ep))
                    .await?
                    .map_err(|e| {
                        ProbeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
                    })
            }
            None => Ok(timeout(CONNECT_TIMEOUT, TcpStream::connect(ep.socket_addr())).await??),
        }
    }
}

/// Sanitize one gossiped address. Nonsense timestamps (pre-2001 or in the
/// future) are backdated; anything older than the keep window is dropped.
fn clamp_address(mut addr: SeenAddress, now: u64) -> Option<SeenAddress> {
    let ts = u64::from(addr.timestamp);
    if ts <= 100_000_000 || ts > now + 600 {
        addr.timestamp = now.saturating_sub(CLAMP_BACKDATE_SECS) as u32;
    }
    if u64::from(addr.timestamp) > now.saturating_sub(KEEP_WINDOW_SECS) {
        Some(addr)
    } else {
        None
    }
}

/// Minimal SOCKS5 CONNECT (no authentication, RFC1928). Onion endpoints are
/// sent as a domain name so the proxy performs the resolution.
async fn socks5_connect(mut stream: TcpStream, ep: &Endpoint) -> Result<TcpStream> {
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut greet = [0u8; 2];
    stream.read_exact(&mut greet).await?;
    if greet != [0x05, 0x00] {
        bail!("proxy rejected authentication method");
    }

    let mut req = vec![0x05, 0x01, 0x00];
    match ep.onion_host() {
        Some(host) => {
            req.push(0x03);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
        }
        None => match ep.ip() {
            IpAddr::V4(v4) => {
                req.push(0x01);
                req.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                req.push(0x04);
                req.extend_from_slice(&v6.octets());
            }
        },
    }
    req.extend_from_slice(&ep.port().to_be_bytes());
    stream.write_all(&req).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 {
        bail!("bad proxy reply version");
    }
    if reply[1] != 0x00 {
        bail!("proxy connect failed with code {}", reply[1]);
    }
    // Skip the bound address the proxy reports.
    let skip = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => bail!("bad proxy address type {other}"),
    };
    let mut rest = vec![0u8; skip + 2];
    stream
        .read_exact(&mut rest)
        .await
        .context("reading proxy bound address")?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::build_addr_payload;
    use tokio::net::TcpListener;

    fn ep(s: &str) -> Endpoint {
        s.parse().expect("valid endpoint")
    }

    #[test]
    fn clamp_rewrites_nonsense_timestamps() {
        let now = unix_now();
        let addr = SeenAddress {
            timestamp: 5, // pre-2001
            services: NODE_NETWORK,
            endpoint: ep("1.2.3.4:8333"),
        };
        let clamped = clamp_address(addr, now).expect("kept after backdating");
        assert_eq!(u64::from(clamped.timestamp), now - CLAMP_BACKDATE_SECS);

        let future = SeenAddress {
            timestamp: (now + 3600) as u32,
            services: NODE_NETWORK,
            endpoint: ep("1.2.3.4:8333"),
        };
        let clamped = clamp_address(future, now).expect("kept");
        assert_eq!(u64::from(clamped.timestamp), now - CLAMP_BACKDATE_SECS);
    }

    #[test]
    fn clamp_drops_stale_addresses() {
        let now = unix_now();
        let stale = SeenAddress {
            timestamp: (now - KEEP_WINDOW_SECS - 1) as u32,
            services: NODE_NETWORK,
            endpoint: ep("1.2.3.4:8333"),
        };
        assert!(clamp_address(stale, now).is_none());

        let fresh = SeenAddress {
            timestamp: (now - 60) as u32,
            services: NODE_NETWORK,
            endpoint: ep("1.2.3.4:8333"),
        };
        assert_eq!(clamp_address(fresh, now), Some(fresh));
    }

    fn client() -> ProbeClient {
        ProbeClient {
            proxies: ProxyConfig::default(),
            user_agent: "/peerseed:0.1/".into(),
            best_height: 800_000,
        }
    }

    async fn fake_peer_accept(listener: TcpListener, gossip: Vec<SeenAddress>) {
        let (mut sock, _) = listener.accept().await.expect("accept");
        let mut buf = vec![0u8; 4096];
        let n = sock.read(&mut buf).await.expect("read version");
        assert!(n > 0);

        let them = ep("127.0.0.1:1");
        let version = build_version_payload(&them, 0, 7, "/fake:1.0/", 500_000, unix_now() as i64);
        sock.write_all(&build_message("version", &version, PROTOCOL_VERSION))
            .await
            .expect("send version");
        sock.write_all(&build_message("verack", &[], PROTOCOL_VERSION))
            .await
            .expect("send verack");
        if !gossip.is_empty() {
            let payload = build_addr_payload(&gossip, PROTOCOL_VERSION);
            sock.write_all(&build_message("addr", &payload, PROTOCOL_VERSION))
                .await
                .expect("send addr");
        }
        // Hold the socket open; the prober ends the session on its own.
        tokio::time::sleep(Duration::from_secs(30)).await;
    }

    #[tokio::test]
    async fn handshake_without_gossip_succeeds_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(fake_peer_accept(listener, vec![]));

        let out = client().probe(Endpoint::from(addr), false).await;
        assert!(out.success);
        assert_eq!(out.ban_secs, 0);
        assert_eq!(out.client_version, PROTOCOL_VERSION);
        assert_eq!(out.client_subversion, "/fake:1.0/");
        assert_eq!(out.blocks, 500_000);
        assert!(out.addrs.is_empty());
    }

    /// Version payload as an early-protocol peer would send it: nothing
    /// after the recipient address.
    fn old_version_payload(version: i32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&version.to_le_bytes());
        p.extend_from_slice(&NODE_NETWORK.to_le_bytes());
        p.extend_from_slice(&0i64.to_le_bytes());
        p.extend_from_slice(&0u64.to_le_bytes());
        p.extend_from_slice(&[0u8; 16]);
        p.extend_from_slice(&0u16.to_be_bytes());
        p
    }

    #[tokio::test]
    async fn pre_verack_peer_completes_on_version_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            // Announces 208 and never sends verack; peers that old do not
            // know the message.
            sock.write_all(&build_message(
                "version",
                &old_version_payload(208),
                PROTOCOL_VERSION,
            ))
            .await
            .expect("send version");
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let out = client().probe(Endpoint::from(addr), false).await;
        assert!(out.success, "a pre-verack version message is a full handshake");
        assert_eq!(out.client_version, 208);
        assert_eq!(out.ban_secs, 0);
    }

    #[tokio::test]
    async fn legacy_peer_gossip_over_short_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let gossiped: Endpoint = ep("8.8.8.8:8333");
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sock.write_all(&build_message(
                "version",
                &old_version_payload(208),
                PROTOCOL_VERSION,
            ))
            .await
            .expect("send version");
            // getaddr comes back in the 20-byte frame; answer in kind.
            let _ = sock.read(&mut buf).await;
            let entries = vec![SeenAddress {
                timestamp: 0,
                services: NODE_NETWORK,
                endpoint: gossiped,
            }];
            let payload = build_addr_payload(&entries, 208);
            sock.write_all(&build_message("addr", &payload, 208))
                .await
                .expect("send addr");
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let out = timeout(
            Duration::from_secs(5),
            client().probe(Endpoint::from(addr), true),
        )
        .await
        .expect("session ends shortly after the addr reply");
        assert!(out.success);
        assert_eq!(out.ban_secs, 0, "short headers must not look malformed");
        assert_eq!(out.addrs.len(), 1);
        assert_eq!(out.addrs[0].endpoint, gossiped);
    }

    #[tokio::test]
    async fn gossip_session_ends_soon_after_addr_reply() {
        let gossip = vec![
            SeenAddress {
                timestamp: unix_now() as u32,
                services: NODE_NETWORK,
                endpoint: ep("8.8.8.8:8333"),
            },
            SeenAddress {
                timestamp: unix_now() as u32,
                services: NODE_NETWORK,
                endpoint: ep("9.9.9.9:8333"),
            },
        ];
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(fake_peer_accept(listener, gossip));

        // Well under the 10 s collection window: one addr reply pulls the
        // deadline forward instead of waiting the window out.
        let out = timeout(
            Duration::from_secs(5),
            client().probe(Endpoint::from(addr), true),
        )
        .await
        .expect("session ends shortly after the addr reply");
        assert!(out.success);
        assert_eq!(out.addrs.len(), 2);
    }

    #[tokio::test]
    async fn bad_magic_is_a_violation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"this is not a bitcoin message at all....")
                .await
                .expect("send garbage");
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let out = client().probe(Endpoint::from(addr), false).await;
        assert!(!out.success);
        assert_eq!(out.ban_secs, VIOLATION_BAN_SECS);
    }

    #[tokio::test]
    async fn connection_refused_is_plain_failure() {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let out = client().probe(Endpoint::from(addr), false).await;
        assert!(!out.success);
        assert_eq!(out.ban_secs, 0, "unreachable must not request a ban");
    }

    #[tokio::test]
    async fn onion_without_proxy_is_unreachable_not_banned() {
        let out = client()
            .probe(ep("[fd87:d87e:eb43::1]:8333"), false)
            .await;
        assert!(!out.success);
        assert_eq!(out.ban_secs, 0);
    }
}
