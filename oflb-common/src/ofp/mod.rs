//! OpenFlow 1.3 wire format.
//!
//! Covers the messages a load-balancing controller exchanges with a switch:
//! the handshake (HELLO, FEATURES, group-features and desc multiparts),
//! keepalives (ECHO), state programming (FLOW_MOD, GROUP_MOD, BARRIER) and
//! ERROR. Anything else is surfaced as [`Message::Other`] with its raw body.

mod action;
mod oxm;
mod wire;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

pub use action::{Action, GroupBucket, Instruction, NXAST_REG_MOVE, NX_VENDOR_ID};
pub use oxm::{Match, OxmField, OxmKind};

use wire::{patch_len, Reader};

pub const OFP_VERSION: u8 = 0x04;
pub const OFP_HEADER_LEN: usize = 8;

pub const OFPT_HELLO: u8 = 0;
pub const OFPT_ERROR: u8 = 1;
pub const OFPT_ECHO_REQUEST: u8 = 2;
pub const OFPT_ECHO_REPLY: u8 = 3;
pub const OFPT_FEATURES_REQUEST: u8 = 5;
pub const OFPT_FEATURES_REPLY: u8 = 6;
pub const OFPT_PACKET_IN: u8 = 10;
pub const OFPT_FLOW_REMOVED: u8 = 11;
pub const OFPT_PORT_STATUS: u8 = 12;
pub const OFPT_FLOW_MOD: u8 = 14;
pub const OFPT_GROUP_MOD: u8 = 15;
pub const OFPT_MULTIPART_REQUEST: u8 = 18;
pub const OFPT_MULTIPART_REPLY: u8 = 19;
pub const OFPT_BARRIER_REQUEST: u8 = 20;
pub const OFPT_BARRIER_REPLY: u8 = 21;

pub const OFPHET_VERSIONBITMAP: u16 = 1;

// Reserved ports.
pub const OFPP_MAX: u32 = 0xffff_ff00;
pub const OFPP_IN_PORT: u32 = 0xffff_fff8;
pub const OFPP_FLOOD: u32 = 0xffff_fffb;
pub const OFPP_ALL: u32 = 0xffff_fffc;
pub const OFPP_CONTROLLER: u32 = 0xffff_fffd;
pub const OFPP_ANY: u32 = 0xffff_ffff;

pub const OFPG_ALL: u32 = 0xffff_fffc;
pub const OFPG_ANY: u32 = 0xffff_ffff;
pub const OFPTT_ALL: u8 = 0xff;
pub const OFP_NO_BUFFER: u32 = 0xffff_ffff;
pub const OFPCML_NO_BUFFER: u16 = 0xffff;

pub const OFPFC_ADD: u8 = 0;
pub const OFPFC_DELETE: u8 = 3;
pub const OFPGC_ADD: u16 = 0;
pub const OFPGC_DELETE: u16 = 2;
pub const OFPGT_SELECT: u8 = 1;

pub const OFPMP_DESC: u16 = 0;
pub const OFPMP_GROUP_FEATURES: u16 = 8;

pub const OFPET_HELLO_FAILED: u16 = 0;
pub const OFPHFC_INCOMPATIBLE: u16 = 0;

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

/// Largest frame the 16-bit length field can describe.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated message: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("bad {what} length {len}")]
    BadLength { what: &'static str, len: usize },
    #[error("message of {0} bytes exceeds the 16-bit length field")]
    TooLong(usize),
    #[error("unsupported OXM header {0:#010x}")]
    UnsupportedOxm(u32),
    #[error("unsupported match type {0}")]
    UnsupportedMatch(u16),
    #[error("unsupported action type {0:#06x}")]
    UnsupportedAction(u16),
    #[error("unsupported instruction type {0}")]
    UnsupportedInstruction(u16),
    #[error("reg_move between {src:?} and {dst:?} must copy whole fields of equal width")]
    RegMoveWidth { src: OxmKind, dst: OxmKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: u8,
    pub length: u16,
    pub xid: u32,
}

impl Header {
    pub fn parse(buf: &[u8; OFP_HEADER_LEN]) -> Self {
        Header {
            version: buf[0],
            msg_type: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Length of the body following the fixed header.
    pub fn body_len(&self) -> Result<usize, CodecError> {
        usize::from(self.length)
            .checked_sub(OFP_HEADER_LEN)
            .ok_or(CodecError::BadLength {
                what: "header",
                len: usize::from(self.length),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMsg {
    pub err_type: u16,
    pub code: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchFeatures {
    pub datapath_id: u64,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub auxiliary_id: u8,
    pub capabilities: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowMod {
    pub cookie: u64,
    pub cookie_mask: u64,
    pub table_id: u8,
    pub command: u8,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub priority: u16,
    pub buffer_id: u32,
    pub out_port: u32,
    pub out_group: u32,
    pub flags: u16,
    pub r#match: Match,
    pub instructions: Vec<Instruction>,
}

impl FlowMod {
    /// A permanent ADD carrying a single APPLY_ACTIONS instruction.
    pub fn add(cookie: u64, table_id: u8, priority: u16, r#match: Match, actions: Vec<Action>) -> Self {
        FlowMod {
            cookie,
            cookie_mask: 0,
            table_id,
            command: OFPFC_ADD,
            idle_timeout: 0,
            hard_timeout: 0,
            priority,
            buffer_id: OFP_NO_BUFFER,
            out_port: OFPP_ANY,
            out_group: OFPG_ANY,
            flags: 0,
            r#match,
            instructions: vec![Instruction::ApplyActions(actions)],
        }
    }

    /// Removes every flow in every table.
    pub fn delete_all() -> Self {
        FlowMod {
            cookie: 0,
            cookie_mask: 0,
            table_id: OFPTT_ALL,
            command: OFPFC_DELETE,
            idle_timeout: 0,
            hard_timeout: 0,
            priority: 0,
            buffer_id: OFP_NO_BUFFER,
            out_port: OFPP_ANY,
            out_group: OFPG_ANY,
            flags: 0,
            r#match: Match::any(),
            instructions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMod {
    pub command: u16,
    pub group_type: u8,
    pub group_id: u32,
    pub buckets: Vec<GroupBucket>,
}

impl GroupMod {
    pub fn add_select(group_id: u32, buckets: Vec<GroupBucket>) -> Self {
        GroupMod {
            command: OFPGC_ADD,
            group_type: OFPGT_SELECT,
            group_id,
            buckets,
        }
    }

    pub fn delete_all() -> Self {
        GroupMod {
            command: OFPGC_DELETE,
            group_type: 0,
            group_id: OFPG_ALL,
            buckets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupFeatures {
    /// Bitmap of supported group types, bit `n` for type `n`.
    pub types: u32,
    pub capabilities: u32,
    pub max_groups: [u32; 4],
    pub actions: [u32; 4],
}

impl GroupFeatures {
    pub fn supports_select(&self) -> bool {
        self.types & (1 << OFPGT_SELECT) != 0
    }

    pub fn max_select_groups(&self) -> u32 {
        self.max_groups[usize::from(OFPGT_SELECT)]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SwitchDesc {
    pub mfr_desc: String,
    pub hw_desc: String,
    pub sw_desc: String,
    pub serial_num: String,
    pub dp_desc: String,
}

const DESC_STR_LEN: usize = 256;
const SERIAL_NUM_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartBody {
    GroupFeatures(GroupFeatures),
    Desc(SwitchDesc),
    Other { kind: u16, body: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `versions` is the peer's version bitmap, when it sent one.
    Hello { versions: Option<u32> },
    Error(ErrorMsg),
    EchoRequest(Vec<u8>),
    EchoReply(Vec<u8>),
    FeaturesRequest,
    FeaturesReply(SwitchFeatures),
    FlowMod(FlowMod),
    GroupMod(GroupMod),
    /// Requests carry an empty body for the kinds used here.
    MultipartRequest { kind: u16 },
    MultipartReply { flags: u16, body: MultipartBody },
    BarrierRequest,
    BarrierReply,
    Other { msg_type: u8, body: Vec<u8> },
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Hello { .. } => OFPT_HELLO,
            Message::Error(_) => OFPT_ERROR,
            Message::EchoRequest(_) => OFPT_ECHO_REQUEST,
            Message::EchoReply(_) => OFPT_ECHO_REPLY,
            Message::FeaturesRequest => OFPT_FEATURES_REQUEST,
            Message::FeaturesReply(_) => OFPT_FEATURES_REPLY,
            Message::FlowMod(_) => OFPT_FLOW_MOD,
            Message::GroupMod(_) => OFPT_GROUP_MOD,
            Message::MultipartRequest { .. } => OFPT_MULTIPART_REQUEST,
            Message::MultipartReply { .. } => OFPT_MULTIPART_REPLY,
            Message::BarrierRequest => OFPT_BARRIER_REQUEST,
            Message::BarrierReply => OFPT_BARRIER_REPLY,
            Message::Other { msg_type, .. } => *msg_type,
        }
    }

    /// Encodes a complete frame, header included, at version 1.3.
    pub fn encode(&self, xid: u32) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(OFP_VERSION);
        buf.put_u8(self.msg_type());
        buf.put_u16(0);
        buf.put_u32(xid);

        match self {
            Message::Hello { versions } => {
                if let Some(bitmap) = versions {
                    buf.put_u16(OFPHET_VERSIONBITMAP);
                    buf.put_u16(8);
                    buf.put_u32(*bitmap);
                }
            }
            Message::Error(err) => {
                buf.put_u16(err.err_type);
                buf.put_u16(err.code);
                buf.put_slice(&err.data);
            }
            Message::EchoRequest(data) | Message::EchoReply(data) => buf.put_slice(data),
            Message::FeaturesRequest | Message::BarrierRequest | Message::BarrierReply => {}
            Message::FeaturesReply(f) => {
                buf.put_u64(f.datapath_id);
                buf.put_u32(f.n_buffers);
                buf.put_u8(f.n_tables);
                buf.put_u8(f.auxiliary_id);
                buf.put_bytes(0, 2);
                buf.put_u32(f.capabilities);
                buf.put_u32(0);
            }
            Message::FlowMod(fm) => encode_flow_mod(fm, &mut buf)?,
            Message::GroupMod(gm) => {
                buf.put_u16(gm.command);
                buf.put_u8(gm.group_type);
                buf.put_u8(0);
                buf.put_u32(gm.group_id);
                for bucket in &gm.buckets {
                    bucket.encode(&mut buf)?;
                }
            }
            Message::MultipartRequest { kind } => {
                buf.put_u16(*kind);
                buf.put_u16(0);
                buf.put_bytes(0, 4);
            }
            Message::MultipartReply { flags, body } => encode_multipart_reply(*flags, body, &mut buf),
            Message::Other { body, .. } => buf.put_slice(body),
        }

        let len = buf.len();
        patch_len(&mut buf, 2, len)?;
        Ok(buf.freeze())
    }

    /// Decodes the body of a frame whose header has already been read.
    pub fn decode(header: &Header, body: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(body);
        let msg = match header.msg_type {
            OFPT_HELLO => Message::Hello {
                versions: decode_hello_bitmap(&mut r)?,
            },
            OFPT_ERROR => {
                let err_type = r.u16()?;
                let code = r.u16()?;
                Message::Error(ErrorMsg {
                    err_type,
                    code,
                    data: r.bytes(r.remaining())?.to_vec(),
                })
            }
            OFPT_ECHO_REQUEST => Message::EchoRequest(body.to_vec()),
            OFPT_ECHO_REPLY => Message::EchoReply(body.to_vec()),
            OFPT_FEATURES_REQUEST => Message::FeaturesRequest,
            OFPT_FEATURES_REPLY => {
                let datapath_id = r.u64()?;
                let n_buffers = r.u32()?;
                let n_tables = r.u8()?;
                let auxiliary_id = r.u8()?;
                r.skip(2)?;
                let capabilities = r.u32()?;
                Message::FeaturesReply(SwitchFeatures {
                    datapath_id,
                    n_buffers,
                    n_tables,
                    auxiliary_id,
                    capabilities,
                })
            }
            OFPT_FLOW_MOD => Message::FlowMod(decode_flow_mod(&mut r)?),
            OFPT_GROUP_MOD => {
                let command = r.u16()?;
                let group_type = r.u8()?;
                r.skip(1)?;
                let group_id = r.u32()?;
                let mut buckets = Vec::new();
                while !r.is_empty() {
                    buckets.push(GroupBucket::decode(&mut r)?);
                }
                Message::GroupMod(GroupMod {
                    command,
                    group_type,
                    group_id,
                    buckets,
                })
            }
            OFPT_MULTIPART_REQUEST => {
                let kind = r.u16()?;
                Message::MultipartRequest { kind }
            }
            OFPT_MULTIPART_REPLY => {
                let kind = r.u16()?;
                let flags = r.u16()?;
                r.skip(4)?;
                Message::MultipartReply {
                    flags,
                    body: decode_multipart_reply(kind, &mut r)?,
                }
            }
            OFPT_BARRIER_REQUEST => Message::BarrierRequest,
            OFPT_BARRIER_REPLY => Message::BarrierReply,
            other => Message::Other {
                msg_type: other,
                body: body.to_vec(),
            },
        };
        Ok(msg)
    }
}

/// Bitmap with bit `v` set for each supported wire version `v`.
pub fn version_bitmap(versions: &[u8]) -> u32 {
    versions.iter().fold(0, |acc, v| acc | (1u32 << v))
}

fn decode_hello_bitmap(r: &mut Reader<'_>) -> Result<Option<u32>, CodecError> {
    let mut bitmap = None;
    while r.remaining() >= 4 {
        let element_type = r.u16()?;
        let len = usize::from(r.u16()?);
        if len < 4 {
            return Err(CodecError::BadLength {
                what: "hello element",
                len,
            });
        }
        let mut element = r.sub(len - 4)?;
        if element_type == OFPHET_VERSIONBITMAP && element.remaining() >= 4 {
            // Only the first 32 versions matter for a 1.3 speaker.
            bitmap = Some(element.u32()?);
        }
        r.skip(wire::padding(len).min(r.remaining()))?;
    }
    Ok(bitmap)
}

fn encode_flow_mod(fm: &FlowMod, buf: &mut BytesMut) -> Result<(), CodecError> {
    buf.put_u64(fm.cookie);
    buf.put_u64(fm.cookie_mask);
    buf.put_u8(fm.table_id);
    buf.put_u8(fm.command);
    buf.put_u16(fm.idle_timeout);
    buf.put_u16(fm.hard_timeout);
    buf.put_u16(fm.priority);
    buf.put_u32(fm.buffer_id);
    buf.put_u32(fm.out_port);
    buf.put_u32(fm.out_group);
    buf.put_u16(fm.flags);
    buf.put_bytes(0, 2);
    fm.r#match.encode(buf)?;
    for instruction in &fm.instructions {
        instruction.encode(buf)?;
    }
    Ok(())
}

fn decode_flow_mod(r: &mut Reader<'_>) -> Result<FlowMod, CodecError> {
    let cookie = r.u64()?;
    let cookie_mask = r.u64()?;
    let table_id = r.u8()?;
    let command = r.u8()?;
    let idle_timeout = r.u16()?;
    let hard_timeout = r.u16()?;
    let priority = r.u16()?;
    let buffer_id = r.u32()?;
    let out_port = r.u32()?;
    let out_group = r.u32()?;
    let flags = r.u16()?;
    r.skip(2)?;
    let r#match = Match::decode(r)?;
    let mut instructions = Vec::new();
    while !r.is_empty() {
        instructions.push(Instruction::decode(r)?);
    }
    Ok(FlowMod {
        cookie,
        cookie_mask,
        table_id,
        command,
        idle_timeout,
        hard_timeout,
        priority,
        buffer_id,
        out_port,
        out_group,
        flags,
        r#match,
        instructions,
    })
}

fn encode_multipart_reply(flags: u16, body: &MultipartBody, buf: &mut BytesMut) {
    let kind = match body {
        MultipartBody::GroupFeatures(_) => OFPMP_GROUP_FEATURES,
        MultipartBody::Desc(_) => OFPMP_DESC,
        MultipartBody::Other { kind, .. } => *kind,
    };
    buf.put_u16(kind);
    buf.put_u16(flags);
    buf.put_bytes(0, 4);
    match body {
        MultipartBody::GroupFeatures(gf) => {
            buf.put_u32(gf.types);
            buf.put_u32(gf.capabilities);
            for v in gf.max_groups.iter().chain(gf.actions.iter()) {
                buf.put_u32(*v);
            }
        }
        MultipartBody::Desc(desc) => {
            put_fixed_str(buf, &desc.mfr_desc, DESC_STR_LEN);
            put_fixed_str(buf, &desc.hw_desc, DESC_STR_LEN);
            put_fixed_str(buf, &desc.sw_desc, DESC_STR_LEN);
            put_fixed_str(buf, &desc.serial_num, SERIAL_NUM_LEN);
            put_fixed_str(buf, &desc.dp_desc, DESC_STR_LEN);
        }
        MultipartBody::Other { body, .. } => buf.put_slice(body),
    }
}

fn decode_multipart_reply(kind: u16, r: &mut Reader<'_>) -> Result<MultipartBody, CodecError> {
    Ok(match kind {
        OFPMP_GROUP_FEATURES => {
            let types = r.u32()?;
            let capabilities = r.u32()?;
            let mut max_groups = [0u32; 4];
            for v in max_groups.iter_mut() {
                *v = r.u32()?;
            }
            let mut actions = [0u32; 4];
            for v in actions.iter_mut() {
                *v = r.u32()?;
            }
            MultipartBody::GroupFeatures(GroupFeatures {
                types,
                capabilities,
                max_groups,
                actions,
            })
        }
        OFPMP_DESC => MultipartBody::Desc(SwitchDesc {
            mfr_desc: fixed_str(r.bytes(DESC_STR_LEN)?),
            hw_desc: fixed_str(r.bytes(DESC_STR_LEN)?),
            sw_desc: fixed_str(r.bytes(DESC_STR_LEN)?),
            serial_num: fixed_str(r.bytes(SERIAL_NUM_LEN)?),
            dp_desc: fixed_str(r.bytes(DESC_STR_LEN)?),
        }),
        other => MultipartBody::Other {
            kind: other,
            body: r.bytes(r.remaining())?.to_vec(),
        },
    })
}

fn put_fixed_str(buf: &mut BytesMut, s: &str, len: usize) {
    let bytes = s.as_bytes();
    // Keep room for the terminating NUL.
    let n = bytes.len().min(len - 1);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, len - n);
}

fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
