use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use network_types::ip::IpProto;
use serde::{Deserialize, Serialize};

pub mod ofp;

// This is a 5tuple struct for IPv4 which is used to identify a flow
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FiveTuple {
    pub source_addr: Ipv4Addr,
    pub source_port: u16,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
    pub proto: IpProto,
}

impl FiveTuple {
    pub const KEY_LEN: usize = 13;

    /// Fixed-layout key covering only the fields that stay constant for the
    /// life of a connection.
    pub fn key(&self) -> [u8; Self::KEY_LEN] {
        let mut key = [0u8; Self::KEY_LEN];
        key[0..4].copy_from_slice(&self.source_addr.octets());
        key[4..6].copy_from_slice(&self.source_port.to_be_bytes());
        key[6..10].copy_from_slice(&self.dst_addr.octets());
        key[10..12].copy_from_slice(&self.dst_port.to_be_bytes());
        key[12] = self.proto as u8;
        key
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto {}",
            self.source_addr, self.source_port, self.dst_addr, self.dst_port, self.proto as u8
        )
    }
}

/// Parses "tcp", "udp" or their protocol numbers.
pub fn parse_ip_proto(s: &str) -> Option<IpProto> {
    match s.to_ascii_lowercase().as_str() {
        "tcp" | "6" => Some(IpProto::Tcp),
        "udp" | "17" => Some(IpProto::Udp),
        _ => None,
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address {0:?}")]
pub struct MacParseError(String);

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| MacParseError(s.to_string()))?;
            if part.len() != 2 {
                return Err(MacParseError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(MacParseError(s.to_string()));
        }
        Ok(MacAddr(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = MacParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}
