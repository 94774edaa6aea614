use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use rand::Rng;
use tokio::{net::UdpSocket, time::timeout};
use tracing::{debug, trace, warn};

use crate::{
    Error, Result,
    constants::{DEFAULT_STUN_SERVERS, DEFAULT_STUN_TIMEOUT, STUN_HEADER_LEN, STUN_MAGIC_COOKIE},
    error::OptionContext,
    metrics::METRICS,
};

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;

pub type TransactionId = [u8; 12];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingRequest {
    pub transaction_id: TransactionId,
}

impl BindingRequest {
    pub fn new() -> Self {
        Self {
            transaction_id: rand::rng().random(),
        }
    }

    pub fn encode(&self) -> [u8; STUN_HEADER_LEN] {
        let mut buf = [0u8; STUN_HEADER_LEN];
        buf[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
        // Zero length body.
        buf[4..8].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        buf[8..20].copy_from_slice(&self.transaction_id);
        buf
    }
}

impl Default for BindingRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the mapped IPv4 endpoint from a Binding Response to `txid`.
///
/// XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS. A malformed header yields None; a truncated
/// attribute ends the walk.
pub fn parse_binding_response(buf: &[u8], txid: &TransactionId) -> Option<SocketAddr> {
    if buf.len() < STUN_HEADER_LEN {
        trace!(len = buf.len(), "stun response shorter than header");
        return None;
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let cookie = u32::from_be_bytes(buf[4..8].try_into().ok()?);
    if msg_type != BINDING_RESPONSE || cookie != STUN_MAGIC_COOKIE || &buf[8..20] != txid {
        trace!(msg_type, cookie, "not a response to our binding request");
        return None;
    }

    // A truncated tail still leaves whatever attributes came before it.
    let end = (STUN_HEADER_LEN + msg_len).min(buf.len());
    let mut attrs = &buf[STUN_HEADER_LEN..end];
    let mut mapped = None;
    while attrs.len() >= 4 {
        let attr_type = u16::from_be_bytes([attrs[0], attrs[1]]);
        let attr_len = u16::from_be_bytes([attrs[2], attrs[3]]) as usize;
        let Some(value) = attrs.get(4..4 + attr_len) else {
            trace!(attr_type, attr_len, "truncated stun attribute");
            break;
        };
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_xor_mapped_address(value) {
                    return Some(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => mapped = mapped.or_else(|| decode_mapped_address(value)),
            _ => trace!(attr_type, attr_len, "skipping stun attribute"),
        }
        let padded = (attr_len + 3) & !3;
        attrs = attrs.get(4 + padded..).unwrap_or_default();
    }
    mapped
}

fn decode_ipv4(value: &[u8]) -> Option<(u16, u32)> {
    if value.len() < 8 || value[1] != FAMILY_IPV4 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = u32::from_be_bytes(value[4..8].try_into().ok()?);
    Some((port, ip))
}

pub fn decode_mapped_address(value: &[u8]) -> Option<SocketAddr> {
    let (port, ip) = decode_ipv4(value)?;
    Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
}

pub fn decode_xor_mapped_address(value: &[u8]) -> Option<SocketAddr> {
    let (port, ip) = decode_ipv4(value)?;
    let port = port ^ (STUN_MAGIC_COOKIE >> 16) as u16;
    let ip = ip ^ STUN_MAGIC_COOKIE;
    Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
}

#[derive(Debug, Clone, Default)]
pub struct StunOpts {
    /// `host:port` of STUN servers, tried in order.
    pub servers: Option<Vec<String>>,

    /// How long to wait for each server.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct StunClient {
    servers: Vec<String>,
    timeout: Duration,
}

impl Default for StunClient {
    fn default() -> Self {
        Self {
            servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            timeout: DEFAULT_STUN_TIMEOUT,
        }
    }
}

impl StunClient {
    pub fn new(opts: StunOpts) -> Result<Self> {
        let timeout = opts.timeout.unwrap_or(DEFAULT_STUN_TIMEOUT);
        if timeout.is_zero() {
            return Err(Error::InvalidConfig("stun timeout = 0"));
        }
        let servers = opts
            .servers
            .unwrap_or_else(|| DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect());
        if servers.is_empty() {
            return Err(Error::InvalidConfig("no stun servers"));
        }
        Ok(Self { servers, timeout })
    }

    /// Asks each server in turn for the public endpoint of `socket`. The first answer wins.
    ///
    /// Uses the socket itself so that the NAT mapping is the one later punched through.
    #[tracing::instrument(skip_all, fields(local = ?socket.local_addr().ok()))]
    pub async fn discover(&self, socket: &UdpSocket) -> Option<SocketAddr> {
        for server in self.servers.iter() {
            match self.query(socket, server).await {
                Ok(addr) => {
                    debug!(server, public = ?addr, "discovered public endpoint");
                    return Some(addr);
                }
                Err(e) => {
                    METRICS.stun_failures.increment(1);
                    debug!(server, "stun query failed: {e:#}");
                }
            }
        }
        warn!("no stun server answered, falling back to the address seen by the matchmaker");
        None
    }

    async fn query(&self, socket: &UdpSocket, server: &str) -> Result<SocketAddr> {
        let server_addr = tokio::net::lookup_host(server)
            .await?
            .find(|a| a.is_ipv4())
            .context("stun server has no IPv4 address")?;

        let request = BindingRequest::new();
        socket.send_to(&request.encode(), server_addr).await?;

        let mut buf = [0u8; 512];
        let wait = async {
            loop {
                let (len, from) = socket.recv_from(&mut buf).await?;
                if from != server_addr {
                    trace!(?from, "ignoring datagram from someone else while waiting for stun");
                    continue;
                }
                if let Some(addr) = parse_binding_response(&buf[..len], &request.transaction_id) {
                    return Ok::<_, Error>(addr);
                }
            }
        };
        timeout(self.timeout, wait)
            .await
            .map_err(|_| Error::Timeout("stun response"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TXID: TransactionId = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    fn attr(attr_type: u16, value: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&attr_type.to_be_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    fn response(txid: &TransactionId, attrs: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = attrs.concat();
        let mut out = Vec::new();
        out.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(txid);
        out.extend_from_slice(&body);
        out
    }

    fn xor_value(ip: Ipv4Addr, port: u16) -> Vec<u8> {
        let mut v = vec![0, FAMILY_IPV4];
        v.extend_from_slice(&(port ^ 0x2112).to_be_bytes());
        v.extend_from_slice(&(u32::from(ip) ^ STUN_MAGIC_COOKIE).to_be_bytes());
        v
    }

    fn plain_value(ip: Ipv4Addr, port: u16) -> Vec<u8> {
        let mut v = vec![0, FAMILY_IPV4];
        v.extend_from_slice(&port.to_be_bytes());
        v.extend_from_slice(&ip.octets());
        v
    }

    #[test]
    fn test_request_encoding() {
        let r = BindingRequest {
            transaction_id: TXID,
        };
        let b = r.encode();
        assert_eq!(b.len(), 20);
        assert_eq!(&b[0..4], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(&b[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&b[8..], &TXID);
    }

    #[test]
    fn test_xor_mapped_address_decode() {
        // 203.0.113.7:54321 XORed by hand against the magic cookie.
        let value = [0x00, 0x01, 0xf5, 0x23, 0xea, 0x12, 0xd5, 0x45];
        assert_eq!(
            decode_xor_mapped_address(&value),
            Some("203.0.113.7:54321".parse().unwrap())
        );
    }

    #[test]
    fn test_xor_preferred_over_mapped() {
        let buf = response(
            &TXID,
            &[
                attr(ATTR_MAPPED_ADDRESS, &plain_value(Ipv4Addr::new(10, 0, 0, 1), 1000)),
                attr(0x8022, b"odd"),
                attr(
                    ATTR_XOR_MAPPED_ADDRESS,
                    &xor_value(Ipv4Addr::new(198, 51, 100, 2), 40000),
                ),
            ],
        );
        assert_eq!(
            parse_binding_response(&buf, &TXID),
            Some("198.51.100.2:40000".parse().unwrap())
        );
    }

    #[test]
    fn test_mapped_fallback_after_padded_attribute() {
        let buf = response(
            &TXID,
            &[
                attr(0x8022, b"software"),
                attr(0x8023, b"x"),
                attr(ATTR_MAPPED_ADDRESS, &plain_value(Ipv4Addr::new(192, 0, 2, 9), 3478)),
            ],
        );
        assert_eq!(
            parse_binding_response(&buf, &TXID),
            Some("192.0.2.9:3478".parse().unwrap())
        );
    }

    #[test]
    fn test_mapped_kept_when_tail_is_truncated() {
        let expected: SocketAddr = "192.0.2.9:3478".parse().unwrap();
        let mapped = attr(ATTR_MAPPED_ADDRESS, &plain_value(Ipv4Addr::new(192, 0, 2, 9), 3478));

        // Header length covers bytes that never arrived.
        let buf = response(&TXID, &[mapped.clone(), attr(0x8022, b"software")]);
        assert_eq!(
            parse_binding_response(&buf[..buf.len() - 4], &TXID),
            Some(expected)
        );

        // Trailing attribute claims more than the message holds.
        let mut lying = attr(0x8022, b"soft");
        lying[2..4].copy_from_slice(&100u16.to_be_bytes());
        let buf = response(&TXID, &[mapped, lying]);
        assert_eq!(parse_binding_response(&buf, &TXID), Some(expected));
    }

    #[test]
    fn test_rejects_malformed() {
        let good = response(
            &TXID,
            &[attr(
                ATTR_XOR_MAPPED_ADDRESS,
                &xor_value(Ipv4Addr::new(1, 2, 3, 4), 5),
            )],
        );
        assert!(parse_binding_response(&good, &TXID).is_some());

        let mut other_tx = TXID;
        other_tx[0] ^= 0xff;
        assert_eq!(parse_binding_response(&good, &other_tx), None);
        assert_eq!(parse_binding_response(&good[..19], &TXID), None);
        assert_eq!(parse_binding_response(&good[..good.len() - 2], &TXID), None);

        let mut request_type = good.clone();
        request_type[1] = 0x01;
        request_type[0] = 0x00;
        assert_eq!(parse_binding_response(&request_type, &TXID), None);

        // IPv6 family is not supported.
        let mut v6 = xor_value(Ipv4Addr::new(1, 2, 3, 4), 5);
        v6[1] = 0x02;
        let buf = response(&TXID, &[attr(ATTR_XOR_MAPPED_ADDRESS, &v6)]);
        assert_eq!(parse_binding_response(&buf, &TXID), None);
    }

    #[tokio::test]
    async fn test_discover_falls_through_to_next_server() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 20);
            let txid: TransactionId = buf[8..20].try_into().unwrap();
            let SocketAddr::V4(from_v4) = from else {
                panic!("expected v4")
            };
            let resp = response(
                &txid,
                &[attr(
                    ATTR_XOR_MAPPED_ADDRESS,
                    &xor_value(*from_v4.ip(), from_v4.port()),
                )],
            );
            server.send_to(&resp, from).await.unwrap();
        });

        let client = StunClient::new(StunOpts {
            servers: Some(vec![
                silent.local_addr().unwrap().to_string(),
                server_addr.to_string(),
            ]),
            timeout: Some(Duration::from_millis(200)),
        })
        .unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let public = client.discover(&socket).await;
        assert_eq!(public, Some(socket.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn test_discover_all_fail() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = StunClient::new(StunOpts {
            servers: Some(vec![silent.local_addr().unwrap().to_string()]),
            timeout: Some(Duration::from_millis(50)),
        })
        .unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(client.discover(&socket).await, None);
    }
}
