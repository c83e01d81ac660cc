use bytes::{BufMut, BytesMut};
use serde::Serialize;

use super::oxm::{OxmField, OxmKind};
use super::wire::{pad_to_8, patch_len, Reader};
use super::{CodecError, OFPCML_NO_BUFFER, OFPG_ANY, OFPP_ANY, OFPP_CONTROLLER};

pub const OFPAT_OUTPUT: u16 = 0;
pub const OFPAT_GROUP: u16 = 22;
pub const OFPAT_SET_FIELD: u16 = 25;
pub const OFPAT_EXPERIMENTER: u16 = 0xffff;

pub const OFPIT_APPLY_ACTIONS: u16 = 4;

pub const NX_VENDOR_ID: u32 = 0x0000_2320;
pub const NXAST_REG_MOVE: u16 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Output { port: u32 },
    Group { group_id: u32 },
    SetField(OxmField),
    /// Nicira `NXAST_REG_MOVE` copying the full width of `src` into `dst`.
    RegMove { src: OxmKind, dst: OxmKind },
}

impl Action {
    pub fn output(port: u32) -> Self {
        Action::Output { port }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let start = buf.len();
        match *self {
            Action::Output { port } => {
                buf.put_u16(OFPAT_OUTPUT);
                buf.put_u16(16);
                buf.put_u32(port);
                let max_len = if port == OFPP_CONTROLLER {
                    OFPCML_NO_BUFFER
                } else {
                    0
                };
                buf.put_u16(max_len);
                buf.put_bytes(0, 6);
            }
            Action::Group { group_id } => {
                buf.put_u16(OFPAT_GROUP);
                buf.put_u16(8);
                buf.put_u32(group_id);
            }
            Action::SetField(field) => {
                buf.put_u16(OFPAT_SET_FIELD);
                buf.put_u16(0);
                field.encode(buf);
                pad_to_8(buf, start);
                let len = buf.len() - start;
                patch_len(buf, start + 2, len)?;
            }
            Action::RegMove { src, dst } => {
                if src.bits() != dst.bits() {
                    return Err(CodecError::RegMoveWidth { src, dst });
                }
                buf.put_u16(OFPAT_EXPERIMENTER);
                buf.put_u16(24);
                buf.put_u32(NX_VENDOR_ID);
                buf.put_u16(NXAST_REG_MOVE);
                buf.put_u16(src.bits());
                buf.put_u16(0);
                buf.put_u16(0);
                buf.put_u32(src.header());
                buf.put_u32(dst.header());
            }
        }
        Ok(())
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let action_type = r.u16()?;
        let len = usize::from(r.u16()?);
        if len < 8 || len % 8 != 0 {
            return Err(CodecError::BadLength { what: "action", len });
        }
        let mut body = r.sub(len - 4)?;
        let action = match action_type {
            OFPAT_OUTPUT => {
                let port = body.u32()?;
                Action::Output { port }
            }
            OFPAT_GROUP => Action::Group {
                group_id: body.u32()?,
            },
            OFPAT_SET_FIELD => Action::SetField(OxmField::decode(&mut body)?),
            OFPAT_EXPERIMENTER => {
                let experimenter = body.u32()?;
                let subtype = body.u16()?;
                if experimenter != NX_VENDOR_ID || subtype != NXAST_REG_MOVE {
                    return Err(CodecError::UnsupportedAction(action_type));
                }
                let n_bits = body.u16()?;
                let src_ofs = body.u16()?;
                let dst_ofs = body.u16()?;
                let src = OxmKind::from_header(body.u32()?)?;
                let dst = OxmKind::from_header(body.u32()?)?;
                if src_ofs != 0 || dst_ofs != 0 || n_bits != src.bits() || n_bits != dst.bits() {
                    return Err(CodecError::RegMoveWidth { src, dst });
                }
                Action::RegMove { src, dst }
            }
            other => return Err(CodecError::UnsupportedAction(other)),
        };
        Ok(action)
    }
}

pub(crate) fn encode_actions(actions: &[Action], buf: &mut BytesMut) -> Result<(), CodecError> {
    for action in actions {
        action.encode(buf)?;
    }
    Ok(())
}

pub(crate) fn decode_actions(r: &mut Reader<'_>) -> Result<Vec<Action>, CodecError> {
    let mut actions = Vec::new();
    while !r.is_empty() {
        actions.push(Action::decode(r)?);
    }
    Ok(actions)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    ApplyActions(Vec<Action>),
}

impl Instruction {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let start = buf.len();
        match self {
            Instruction::ApplyActions(actions) => {
                buf.put_u16(OFPIT_APPLY_ACTIONS);
                buf.put_u16(0);
                buf.put_bytes(0, 4);
                encode_actions(actions, buf)?;
            }
        }
        let len = buf.len() - start;
        patch_len(buf, start + 2, len)
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let instruction_type = r.u16()?;
        let len = usize::from(r.u16()?);
        if len < 8 {
            return Err(CodecError::BadLength {
                what: "instruction",
                len,
            });
        }
        let mut body = r.sub(len - 4)?;
        match instruction_type {
            OFPIT_APPLY_ACTIONS => {
                body.skip(4)?;
                Ok(Instruction::ApplyActions(decode_actions(&mut body)?))
            }
            other => Err(CodecError::UnsupportedInstruction(other)),
        }
    }
}

/// `ofp_bucket` inside a group mod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupBucket {
    pub weight: u16,
    pub watch_port: u32,
    pub watch_group: u32,
    pub actions: Vec<Action>,
}

impl GroupBucket {
    pub fn weighted(weight: u16, actions: Vec<Action>) -> Self {
        GroupBucket {
            weight,
            watch_port: OFPP_ANY,
            watch_group: OFPG_ANY,
            actions,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let start = buf.len();
        buf.put_u16(0);
        buf.put_u16(self.weight);
        buf.put_u32(self.watch_port);
        buf.put_u32(self.watch_group);
        buf.put_bytes(0, 4);
        encode_actions(&self.actions, buf)?;
        let len = buf.len() - start;
        patch_len(buf, start, len)
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let len = usize::from(r.u16()?);
        if len < 16 {
            return Err(CodecError::BadLength { what: "bucket", len });
        }
        let mut body = r.sub(len - 2)?;
        let weight = body.u16()?;
        let watch_port = body.u32()?;
        let watch_group = body.u32()?;
        body.skip(4)?;
        Ok(GroupBucket {
            weight,
            watch_port,
            watch_group,
            actions: decode_actions(&mut body)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::MacAddr;

    fn encoded(action: Action) -> BytesMut {
        let mut buf = BytesMut::new();
        action.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn output_to_controller_requests_full_packet() {
        let buf = encoded(Action::output(OFPP_CONTROLLER));
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[8..10], &[0xff, 0xff]);
        assert_eq!(&encoded(Action::output(3))[8..10], &[0, 0]);
    }

    #[test]
    fn set_field_is_padded() {
        let mac = MacAddr([0, 0, 0, 0, 0, 3]);
        let buf = encoded(Action::SetField(OxmField::EthDst(mac)));
        // 4 action header + 4 oxm header + 6 payload = 14, padded to 16
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[2..4], &[0, 16]);

        let buf = encoded(Action::SetField(OxmField::Ipv4Dst(Ipv4Addr::new(10, 0, 0, 3))));
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn reg_move_uses_nicira_layout() {
        let buf = encoded(Action::RegMove {
            src: OxmKind::EthSrc,
            dst: OxmKind::EthDst,
        });
        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[0..2], &[0xff, 0xff]);
        assert_eq!(&buf[4..8], &NX_VENDOR_ID.to_be_bytes());
        assert_eq!(&buf[8..10], &NXAST_REG_MOVE.to_be_bytes());
        assert_eq!(&buf[10..12], &48u16.to_be_bytes());
        assert_eq!(&buf[16..20], &OxmKind::EthSrc.header().to_be_bytes());
        assert_eq!(&buf[20..24], &OxmKind::EthDst.header().to_be_bytes());
    }

    #[test]
    fn reg_move_rejects_width_mismatch() {
        let mut buf = BytesMut::new();
        let err = Action::RegMove {
            src: OxmKind::ArpSpa,
            dst: OxmKind::ArpSha,
        }
        .encode(&mut buf)
        .unwrap_err();
        assert!(matches!(err, CodecError::RegMoveWidth { .. }));
    }

    #[test]
    fn bucket_decodes_what_it_encodes() {
        let bucket = GroupBucket::weighted(
            2,
            vec![
                Action::SetField(OxmField::Ipv4Dst(Ipv4Addr::new(10, 0, 0, 4))),
                Action::output(4),
            ],
        );
        let mut buf = BytesMut::new();
        bucket.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 16 + 16 + 16);
        let mut r = Reader::new(&buf);
        assert_eq!(GroupBucket::decode(&mut r).unwrap(), bucket);
    }
}
