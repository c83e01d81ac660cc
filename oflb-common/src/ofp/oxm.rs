//! OXM (OpenFlow Extensible Match) fields of the `OPENFLOW_BASIC` class.
//!
//! Only the fields the load balancer matches on or rewrites are modelled.
//! Masked fields are not used and are rejected on decode.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use serde::Serialize;

use super::wire::{pad_to_8, patch_len, Reader};
use super::CodecError;
use crate::MacAddr;

pub const OFPXMC_OPENFLOW_BASIC: u16 = 0x8000;
pub const OFPMT_OXM: u16 = 1;

/// Field identifiers, numbered as in `enum oxm_ofb_match_fields`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OxmKind {
    InPort,
    EthDst,
    EthSrc,
    EthType,
    IpProto,
    Ipv4Src,
    Ipv4Dst,
    TcpSrc,
    TcpDst,
    UdpSrc,
    UdpDst,
    ArpOp,
    ArpSpa,
    ArpTpa,
    ArpSha,
    ArpTha,
}

impl OxmKind {
    pub fn field(self) -> u8 {
        match self {
            OxmKind::InPort => 0,
            OxmKind::EthDst => 3,
            OxmKind::EthSrc => 4,
            OxmKind::EthType => 5,
            OxmKind::IpProto => 10,
            OxmKind::Ipv4Src => 11,
            OxmKind::Ipv4Dst => 12,
            OxmKind::TcpSrc => 13,
            OxmKind::TcpDst => 14,
            OxmKind::UdpSrc => 15,
            OxmKind::UdpDst => 16,
            OxmKind::ArpOp => 21,
            OxmKind::ArpSpa => 22,
            OxmKind::ArpTpa => 23,
            OxmKind::ArpSha => 24,
            OxmKind::ArpTha => 25,
        }
    }

    fn from_field(field: u8) -> Option<Self> {
        Some(match field {
            0 => OxmKind::InPort,
            3 => OxmKind::EthDst,
            4 => OxmKind::EthSrc,
            5 => OxmKind::EthType,
            10 => OxmKind::IpProto,
            11 => OxmKind::Ipv4Src,
            12 => OxmKind::Ipv4Dst,
            13 => OxmKind::TcpSrc,
            14 => OxmKind::TcpDst,
            15 => OxmKind::UdpSrc,
            16 => OxmKind::UdpDst,
            21 => OxmKind::ArpOp,
            22 => OxmKind::ArpSpa,
            23 => OxmKind::ArpTpa,
            24 => OxmKind::ArpSha,
            25 => OxmKind::ArpTha,
            _ => return None,
        })
    }

    /// Payload length in bytes.
    pub fn payload_len(self) -> u8 {
        match self {
            OxmKind::InPort
            | OxmKind::Ipv4Src
            | OxmKind::Ipv4Dst
            | OxmKind::ArpSpa
            | OxmKind::ArpTpa => 4,
            OxmKind::EthDst | OxmKind::EthSrc | OxmKind::ArpSha | OxmKind::ArpTha => 6,
            OxmKind::EthType
            | OxmKind::TcpSrc
            | OxmKind::TcpDst
            | OxmKind::UdpSrc
            | OxmKind::UdpDst
            | OxmKind::ArpOp => 2,
            OxmKind::IpProto => 1,
        }
    }

    pub fn bits(self) -> u16 {
        u16::from(self.payload_len()) * 8
    }

    /// 32-bit OXM header: class, field, hasmask=0, length.
    pub fn header(self) -> u32 {
        (u32::from(OFPXMC_OPENFLOW_BASIC) << 16)
            | (u32::from(self.field()) << 9)
            | u32::from(self.payload_len())
    }

    pub fn from_header(header: u32) -> Result<Self, CodecError> {
        let class = (header >> 16) as u16;
        let field = ((header >> 9) & 0x7f) as u8;
        let has_mask = (header >> 8) & 1 == 1;
        let len = (header & 0xff) as u8;
        if class != OFPXMC_OPENFLOW_BASIC || has_mask {
            return Err(CodecError::UnsupportedOxm(header));
        }
        let kind = OxmKind::from_field(field).ok_or(CodecError::UnsupportedOxm(header))?;
        if kind.payload_len() != len {
            return Err(CodecError::UnsupportedOxm(header));
        }
        Ok(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OxmField {
    InPort(u32),
    EthDst(MacAddr),
    EthSrc(MacAddr),
    EthType(u16),
    IpProto(u8),
    Ipv4Src(Ipv4Addr),
    Ipv4Dst(Ipv4Addr),
    TcpSrc(u16),
    TcpDst(u16),
    UdpSrc(u16),
    UdpDst(u16),
    ArpOp(u16),
    ArpSpa(Ipv4Addr),
    ArpTpa(Ipv4Addr),
    ArpSha(MacAddr),
    ArpTha(MacAddr),
}

impl OxmField {
    pub fn kind(&self) -> OxmKind {
        match self {
            OxmField::InPort(_) => OxmKind::InPort,
            OxmField::EthDst(_) => OxmKind::EthDst,
            OxmField::EthSrc(_) => OxmKind::EthSrc,
            OxmField::EthType(_) => OxmKind::EthType,
            OxmField::IpProto(_) => OxmKind::IpProto,
            OxmField::Ipv4Src(_) => OxmKind::Ipv4Src,
            OxmField::Ipv4Dst(_) => OxmKind::Ipv4Dst,
            OxmField::TcpSrc(_) => OxmKind::TcpSrc,
            OxmField::TcpDst(_) => OxmKind::TcpDst,
            OxmField::UdpSrc(_) => OxmKind::UdpSrc,
            OxmField::UdpDst(_) => OxmKind::UdpDst,
            OxmField::ArpOp(_) => OxmKind::ArpOp,
            OxmField::ArpSpa(_) => OxmKind::ArpSpa,
            OxmField::ArpTpa(_) => OxmKind::ArpTpa,
            OxmField::ArpSha(_) => OxmKind::ArpSha,
            OxmField::ArpTha(_) => OxmKind::ArpTha,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.kind().header());
        match *self {
            OxmField::InPort(v) => buf.put_u32(v),
            OxmField::EthDst(mac)
            | OxmField::EthSrc(mac)
            | OxmField::ArpSha(mac)
            | OxmField::ArpTha(mac) => buf.put_slice(&mac.octets()),
            OxmField::EthType(v)
            | OxmField::TcpSrc(v)
            | OxmField::TcpDst(v)
            | OxmField::UdpSrc(v)
            | OxmField::UdpDst(v)
            | OxmField::ArpOp(v) => buf.put_u16(v),
            OxmField::IpProto(v) => buf.put_u8(v),
            OxmField::Ipv4Src(ip)
            | OxmField::Ipv4Dst(ip)
            | OxmField::ArpSpa(ip)
            | OxmField::ArpTpa(ip) => buf.put_slice(&ip.octets()),
        }
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let kind = OxmKind::from_header(r.u32()?)?;
        Ok(match kind {
            OxmKind::InPort => OxmField::InPort(r.u32()?),
            OxmKind::EthDst => OxmField::EthDst(MacAddr(r.array()?)),
            OxmKind::EthSrc => OxmField::EthSrc(MacAddr(r.array()?)),
            OxmKind::EthType => OxmField::EthType(r.u16()?),
            OxmKind::IpProto => OxmField::IpProto(r.u8()?),
            OxmKind::Ipv4Src => OxmField::Ipv4Src(Ipv4Addr::from(r.array::<4>()?)),
            OxmKind::Ipv4Dst => OxmField::Ipv4Dst(Ipv4Addr::from(r.array::<4>()?)),
            OxmKind::TcpSrc => OxmField::TcpSrc(r.u16()?),
            OxmKind::TcpDst => OxmField::TcpDst(r.u16()?),
            OxmKind::UdpSrc => OxmField::UdpSrc(r.u16()?),
            OxmKind::UdpDst => OxmField::UdpDst(r.u16()?),
            OxmKind::ArpOp => OxmField::ArpOp(r.u16()?),
            OxmKind::ArpSpa => OxmField::ArpSpa(Ipv4Addr::from(r.array::<4>()?)),
            OxmKind::ArpTpa => OxmField::ArpTpa(Ipv4Addr::from(r.array::<4>()?)),
            OxmKind::ArpSha => OxmField::ArpSha(MacAddr(r.array()?)),
            OxmKind::ArpTha => OxmField::ArpTha(MacAddr(r.array()?)),
        })
    }
}

/// `ofp_match` of type OXM. Field order is preserved as given; OpenFlow
/// requires prerequisites (eth_type before ipv4/arp fields) to come first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Match {
    pub fields: Vec<OxmField>,
}

impl Match {
    pub fn new(fields: Vec<OxmField>) -> Self {
        Match { fields }
    }

    /// Matches every packet.
    pub fn any() -> Self {
        Match::default()
    }

    pub fn get(&self, kind: OxmKind) -> Option<&OxmField> {
        self.fields.iter().find(|f| f.kind() == kind)
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let start = buf.len();
        buf.put_u16(OFPMT_OXM);
        buf.put_u16(0);
        for field in &self.fields {
            field.encode(buf);
        }
        // The length excludes trailing padding.
        let len = buf.len() - start;
        patch_len(buf, start + 2, len)?;
        pad_to_8(buf, start);
        Ok(())
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let match_type = r.u16()?;
        if match_type != OFPMT_OXM {
            return Err(CodecError::UnsupportedMatch(match_type));
        }
        let len = usize::from(r.u16()?);
        if len < 4 {
            return Err(CodecError::BadLength { what: "match", len });
        }
        let mut fields_reader = r.sub(len - 4)?;
        let mut fields = Vec::new();
        while !fields_reader.is_empty() {
            fields.push(OxmField::decode(&mut fields_reader)?);
        }
        r.skip(super::wire::padding(len))?;
        Ok(Match { fields })
    }
}
