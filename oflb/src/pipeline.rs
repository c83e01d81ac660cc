//! Software model of table 0 as programmed by a [`DesiredState`].
//!
//! Used to check routing behaviour (rewrites, ARP answers, flood scope)
//! without a switch: feed a synthetic packet, get back what leaves which port.

use std::net::Ipv4Addr;

use network_types::ip::IpProto;
use oflb_common::ofp::{Action, OxmField, OxmKind, OFPP_ALL, OFPP_CONTROLLER, OFPP_FLOOD, OFPP_IN_PORT};
use oflb_common::{FiveTuple, MacAddr};

use crate::compiler::{DesiredState, FlowRule};
use crate::hash::FlowSelector;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: IpProto,
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpHeader {
    pub op: u16,
    pub sha: MacAddr,
    pub spa: Ipv4Addr,
    pub tha: MacAddr,
    pub tpa: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Ipv4(Ipv4Header),
    Arp(ArpHeader),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Packet {
    pub in_port: u32,
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub payload: Payload,
}

impl Packet {
    pub fn ipv4(
        in_port: u32,
        eth_src: MacAddr,
        eth_dst: MacAddr,
        proto: IpProto,
        src: (Ipv4Addr, u16),
        dst: (Ipv4Addr, u16),
    ) -> Self {
        Packet {
            in_port,
            eth_src,
            eth_dst,
            payload: Payload::Ipv4(Ipv4Header {
                src: src.0,
                dst: dst.0,
                proto,
                src_port: src.1,
                dst_port: dst.1,
            }),
        }
    }

    pub fn arp_request(in_port: u32, sha: MacAddr, spa: Ipv4Addr, tpa: Ipv4Addr) -> Self {
        Packet {
            in_port,
            eth_src: sha,
            eth_dst: MacAddr::BROADCAST,
            payload: Payload::Arp(ArpHeader {
                op: oflb_common::ofp::ARP_OP_REQUEST,
                sha,
                spa,
                tha: MacAddr([0; 6]),
                tpa,
            }),
        }
    }

    pub fn five_tuple(&self) -> Option<FiveTuple> {
        match self.payload {
            Payload::Ipv4(ip) => Some(FiveTuple {
                source_addr: ip.src,
                source_port: ip.src_port,
                dst_addr: ip.dst,
                dst_port: ip.dst_port,
                proto: ip.proto,
            }),
            Payload::Arp(_) => None,
        }
    }

    pub fn ipv4_header(&self) -> Option<&Ipv4Header> {
        match &self.payload {
            Payload::Ipv4(ip) => Some(ip),
            Payload::Arp(_) => None,
        }
    }

    pub fn arp_header(&self) -> Option<&ArpHeader> {
        match &self.payload {
            Payload::Arp(arp) => Some(arp),
            Payload::Ipv4(_) => None,
        }
    }

    /// Current value of a match field, `None` when its prerequisites fail.
    pub fn field(&self, kind: OxmKind) -> Option<OxmField> {
        let ip = self.ipv4_header();
        let arp = self.arp_header();
        let is = |p: IpProto| ip.filter(|h| h.proto as u8 == p as u8);
        Some(match kind {
            OxmKind::InPort => OxmField::InPort(self.in_port),
            OxmKind::EthDst => OxmField::EthDst(self.eth_dst),
            OxmKind::EthSrc => OxmField::EthSrc(self.eth_src),
            OxmKind::EthType => OxmField::EthType(match self.payload {
                Payload::Ipv4(_) => oflb_common::ofp::ETH_TYPE_IPV4,
                Payload::Arp(_) => oflb_common::ofp::ETH_TYPE_ARP,
            }),
            OxmKind::IpProto => OxmField::IpProto(ip?.proto as u8),
            OxmKind::Ipv4Src => OxmField::Ipv4Src(ip?.src),
            OxmKind::Ipv4Dst => OxmField::Ipv4Dst(ip?.dst),
            OxmKind::TcpSrc => OxmField::TcpSrc(is(IpProto::Tcp)?.src_port),
            OxmKind::TcpDst => OxmField::TcpDst(is(IpProto::Tcp)?.dst_port),
            OxmKind::UdpSrc => OxmField::UdpSrc(is(IpProto::Udp)?.src_port),
            OxmKind::UdpDst => OxmField::UdpDst(is(IpProto::Udp)?.dst_port),
            OxmKind::ArpOp => OxmField::ArpOp(arp?.op),
            OxmKind::ArpSpa => OxmField::ArpSpa(arp?.spa),
            OxmKind::ArpTpa => OxmField::ArpTpa(arp?.tpa),
            OxmKind::ArpSha => OxmField::ArpSha(arp?.sha),
            OxmKind::ArpTha => OxmField::ArpTha(arp?.tha),
        })
    }

    /// Applies a set-field. Returns false when the packet lacks the header.
    pub fn set_field(&mut self, field: OxmField) -> bool {
        match (field, &mut self.payload) {
            (OxmField::InPort(_), _) | (OxmField::EthType(_), _) | (OxmField::IpProto(_), _) => {
                return false
            }
            (OxmField::EthDst(mac), _) => self.eth_dst = mac,
            (OxmField::EthSrc(mac), _) => self.eth_src = mac,
            (OxmField::Ipv4Src(a), Payload::Ipv4(ip)) => ip.src = a,
            (OxmField::Ipv4Dst(a), Payload::Ipv4(ip)) => ip.dst = a,
            (OxmField::TcpSrc(p), Payload::Ipv4(ip)) | (OxmField::UdpSrc(p), Payload::Ipv4(ip)) => {
                ip.src_port = p
            }
            (OxmField::TcpDst(p), Payload::Ipv4(ip)) | (OxmField::UdpDst(p), Payload::Ipv4(ip)) => {
                ip.dst_port = p
            }
            (OxmField::ArpOp(op), Payload::Arp(arp)) => arp.op = op,
            (OxmField::ArpSpa(a), Payload::Arp(arp)) => arp.spa = a,
            (OxmField::ArpTpa(a), Payload::Arp(arp)) => arp.tpa = a,
            (OxmField::ArpSha(m), Payload::Arp(arp)) => arp.sha = m,
            (OxmField::ArpTha(m), Payload::Arp(arp)) => arp.tha = m,
            _ => return false,
        }
        true
    }

    fn matches(&self, rule: &FlowRule) -> bool {
        rule.r#match
            .fields
            .iter()
            .all(|want| self.field(want.kind()).as_ref() == Some(want))
    }
}

/// Re-labels a field value under another kind of the same width.
fn retag(value: OxmField, kind: OxmKind) -> Option<OxmField> {
    use OxmField as F;
    use OxmKind as K;
    let mac = match value {
        F::EthDst(m) | F::EthSrc(m) | F::ArpSha(m) | F::ArpTha(m) => Some(m),
        _ => None,
    };
    let ip = match value {
        F::Ipv4Src(a) | F::Ipv4Dst(a) | F::ArpSpa(a) | F::ArpTpa(a) => Some(a),
        _ => None,
    };
    let port = match value {
        F::TcpSrc(p) | F::TcpDst(p) | F::UdpSrc(p) | F::UdpDst(p) => Some(p),
        _ => None,
    };
    Some(match kind {
        K::EthDst => F::EthDst(mac?),
        K::EthSrc => F::EthSrc(mac?),
        K::ArpSha => F::ArpSha(mac?),
        K::ArpTha => F::ArpTha(mac?),
        K::Ipv4Src => F::Ipv4Src(ip?),
        K::Ipv4Dst => F::Ipv4Dst(ip?),
        K::ArpSpa => F::ArpSpa(ip?),
        K::ArpTpa => F::ArpTpa(ip?),
        K::TcpSrc => F::TcpSrc(port?),
        K::TcpDst => F::TcpDst(port?),
        K::UdpSrc => F::UdpSrc(port?),
        K::UdpDst => F::UdpDst(port?),
        K::InPort | K::EthType | K::IpProto | K::ArpOp => return None,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub port: u32,
    pub packet: Packet,
}

pub struct Pipeline<'a> {
    state: &'a DesiredState,
    ports: Vec<u32>,
    selector: FlowSelector,
}

impl<'a> Pipeline<'a> {
    /// `ports` lists every port on the switch, used to expand floods.
    pub fn new(state: &'a DesiredState, ports: Vec<u32>, selector: FlowSelector) -> Self {
        Pipeline {
            state,
            ports,
            selector,
        }
    }

    /// Highest-priority rule matching the packet; earlier rules win ties.
    pub fn lookup(&self, packet: &Packet) -> Option<&'a FlowRule> {
        let mut best: Option<&FlowRule> = None;
        for rule in &self.state.flows {
            if packet.matches(rule) && best.map_or(true, |b| rule.priority > b.priority) {
                best = Some(rule);
            }
        }
        best
    }

    pub fn process(&self, packet: &Packet) -> Vec<Emitted> {
        let mut out = Vec::new();
        if let Some(rule) = self.lookup(packet) {
            let mut working = *packet;
            self.apply(&mut working, &rule.actions, &mut out);
        }
        out
    }

    fn apply(&self, packet: &mut Packet, actions: &[Action], out: &mut Vec<Emitted>) {
        for action in actions {
            match *action {
                Action::SetField(field) => {
                    packet.set_field(field);
                }
                Action::RegMove { src, dst } => {
                    if let Some(value) = packet.field(src).and_then(|v| retag(v, dst)) {
                        packet.set_field(value);
                    }
                }
                Action::Output { port } => self.output(packet, port, out),
                Action::Group { group_id } => {
                    if group_id != self.state.group.id {
                        continue;
                    }
                    let Some(bucket) = packet
                        .five_tuple()
                        .and_then(|t| self.selector.select(&t))
                        .and_then(|i| self.state.group.buckets.get(i))
                    else {
                        continue;
                    };
                    let mut copy = *packet;
                    self.apply(&mut copy, &bucket.actions(), out);
                }
            }
        }
    }

    fn output(&self, packet: &Packet, port: u32, out: &mut Vec<Emitted>) {
        let mut emit = |port: u32| {
            out.push(Emitted {
                port,
                packet: *packet,
            })
        };
        match port {
            OFPP_IN_PORT => emit(packet.in_port),
            OFPP_FLOOD | OFPP_ALL => {
                for p in self.ports.iter().filter(|p| **p != packet.in_port) {
                    emit(*p);
                }
            }
            OFPP_CONTROLLER => {}
            // A plain output never hairpins back out the ingress port.
            p if p == packet.in_port => {}
            p => emit(p),
        }
    }
}
