//! Derives the complete switch state for a topology.
//!
//! The output is a pure function of the topology: there is no hidden state
//! and no delta against what the switch currently holds. Flow rules, highest
//! priority first:
//!
//! 1. one ARP responder per client port, answering who-has VIP with the LB MAC
//!    from inside the switch;
//! 2. one forward rule per client port, sending IPv4 to the VIP into the
//!    SELECT group, whose buckets rewrite eth_dst/ipv4_dst and output to one
//!    backend;
//! 3. one reverse rule per backend, rewriting the source back to LB MAC/VIP
//!    and copying the packet to every client port;
//! 4. a default flood for everything else.

use std::net::Ipv4Addr;

use oflb_common::ofp::{
    Action, FlowMod, GroupBucket, GroupMod, Match, OxmField, OxmKind, ARP_OP_REPLY,
    ARP_OP_REQUEST, ETH_TYPE_ARP, ETH_TYPE_IPV4, OFPP_FLOOD, OFPP_IN_PORT,
};
use oflb_common::{FiveTuple, MacAddr};
use serde::Serialize;

use crate::config::{Backend, Topology};
use crate::error::ConfigError;
use crate::hash::{FlowSelector, SimpleConsistentHasher};

pub const GROUP_ID: u32 = 1;
pub const TABLE_ID: u8 = 0;
/// Tags every flow this controller installs.
pub const COOKIE: u64 = 0x0f1b_0000_0000_0001;

pub const ARP_PRIORITY: u16 = 400;
pub const FORWARD_PRIORITY: u16 = 300;
pub const REVERSE_PRIORITY: u16 = 200;
pub const DEFAULT_PRIORITY: u16 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RuleKind {
    ArpResponder { port: u32 },
    Forward { port: u32 },
    Reverse { backend: String },
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowRule {
    pub table_id: u8,
    pub priority: u16,
    pub kind: RuleKind,
    pub r#match: Match,
    pub actions: Vec<Action>,
}

impl FlowRule {
    /// Short name used when logging a rule the switch rejected.
    pub fn label(&self) -> String {
        match &self.kind {
            RuleKind::ArpResponder { port } => format!("arp[port {port}]"),
            RuleKind::Forward { port } => format!("forward[port {port}]"),
            RuleKind::Reverse { backend } => format!("reverse[{backend}]"),
            RuleKind::Default => "default".to_string(),
        }
    }

    pub fn to_flow_mod(&self) -> FlowMod {
        FlowMod::add(
            COOKIE,
            self.table_id,
            self.priority,
            self.r#match.clone(),
            self.actions.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub backend: Backend,
    pub weight: u16,
}

impl Bucket {
    /// Destination rewrite toward the backend, then out its port.
    pub fn actions(&self) -> Vec<Action> {
        vec![
            Action::SetField(OxmField::EthDst(self.backend.mac)),
            Action::SetField(OxmField::Ipv4Dst(self.backend.ip)),
            Action::output(self.backend.port),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupTable {
    pub id: u32,
    /// Same order as the topology's backend list.
    pub buckets: Vec<Bucket>,
}

impl GroupTable {
    pub fn weights(&self) -> Vec<u16> {
        self.buckets.iter().map(|b| b.weight).collect()
    }

    pub fn to_group_mod(&self) -> GroupMod {
        GroupMod::add_select(
            self.id,
            self.buckets
                .iter()
                .map(|b| GroupBucket::weighted(b.weight, b.actions()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesiredState {
    pub vip: Ipv4Addr,
    pub lb_mac: MacAddr,
    pub group: GroupTable,
    /// Highest priority first.
    pub flows: Vec<FlowRule>,
}

impl DesiredState {
    pub fn flow_mods(&self) -> Vec<FlowMod> {
        self.flows.iter().map(FlowRule::to_flow_mod).collect()
    }

    pub fn selector(&self, ring_size: u32, seed: u32) -> FlowSelector {
        FlowSelector::new(
            &SimpleConsistentHasher::new(ring_size),
            &self.group.weights(),
            seed,
        )
    }

    /// The bucket a forward-direction flow lands in, if it targets the VIP.
    pub fn bucket_for(&self, tuple: &FiveTuple, selector: &FlowSelector) -> Option<&Bucket> {
        if tuple.dst_addr != self.vip {
            return None;
        }
        selector
            .select(tuple)
            .and_then(|index| self.group.buckets.get(index))
    }
}

pub fn compile(topology: &Topology, ring_size: u32) -> Result<DesiredState, ConfigError> {
    topology.validate(ring_size)?;

    let group = GroupTable {
        id: GROUP_ID,
        buckets: topology
            .backends
            .iter()
            .map(|backend| Bucket {
                backend: backend.clone(),
                weight: backend.weight,
            })
            .collect(),
    };

    let mut flows = Vec::new();
    for port in &topology.client_ports {
        flows.push(arp_responder(topology, *port));
    }
    for port in &topology.client_ports {
        flows.push(FlowRule {
            table_id: TABLE_ID,
            priority: FORWARD_PRIORITY,
            kind: RuleKind::Forward { port: *port },
            r#match: Match::new(vec![
                OxmField::InPort(*port),
                OxmField::EthType(ETH_TYPE_IPV4),
                OxmField::Ipv4Dst(topology.vip),
            ]),
            actions: vec![Action::Group { group_id: GROUP_ID }],
        });
    }
    for backend in &topology.backends {
        flows.push(reverse_rule(topology, backend));
    }
    flows.push(FlowRule {
        table_id: TABLE_ID,
        priority: DEFAULT_PRIORITY,
        kind: RuleKind::Default,
        r#match: Match::any(),
        actions: vec![Action::output(OFPP_FLOOD)],
    });

    Ok(DesiredState {
        vip: topology.vip,
        lb_mac: topology.lb_mac,
        group,
        flows,
    })
}

/// Turns a who-has VIP request into the matching reply and sends it back out
/// the ingress port.
fn arp_responder(topology: &Topology, port: u32) -> FlowRule {
    FlowRule {
        table_id: TABLE_ID,
        priority: ARP_PRIORITY,
        kind: RuleKind::ArpResponder { port },
        r#match: Match::new(vec![
            OxmField::InPort(port),
            OxmField::EthType(ETH_TYPE_ARP),
            OxmField::ArpOp(ARP_OP_REQUEST),
            OxmField::ArpTpa(topology.vip),
        ]),
        actions: vec![
            Action::RegMove {
                src: OxmKind::EthSrc,
                dst: OxmKind::EthDst,
            },
            Action::SetField(OxmField::EthSrc(topology.lb_mac)),
            Action::SetField(OxmField::ArpOp(ARP_OP_REPLY)),
            Action::RegMove {
                src: OxmKind::ArpSha,
                dst: OxmKind::ArpTha,
            },
            Action::RegMove {
                src: OxmKind::ArpSpa,
                dst: OxmKind::ArpTpa,
            },
            Action::SetField(OxmField::ArpSha(topology.lb_mac)),
            Action::SetField(OxmField::ArpSpa(topology.vip)),
            Action::output(OFPP_IN_PORT),
        ],
    }
}

fn reverse_rule(topology: &Topology, backend: &Backend) -> FlowRule {
    let mut actions = vec![
        Action::SetField(OxmField::EthSrc(topology.lb_mac)),
        Action::SetField(OxmField::Ipv4Src(topology.vip)),
    ];
    // Backend ports are never in this set, so replies cannot leak to other backends.
    actions.extend(topology.client_ports.iter().map(|p| Action::output(*p)));

    FlowRule {
        table_id: TABLE_ID,
        priority: REVERSE_PRIORITY,
        kind: RuleKind::Reverse {
            backend: backend.id.clone(),
        },
        r#match: Match::new(vec![
            OxmField::InPort(backend.port),
            OxmField::EthType(ETH_TYPE_IPV4),
            OxmField::Ipv4Src(backend.ip),
        ]),
        actions,
    }
}
