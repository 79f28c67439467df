//! OAD over-the-air message codec
//!
//! These messages travel inside MAC data frames, after the application
//! command byte that routes them to the transfer engine. Layout is a
//! packet-id byte followed by fixed little-endian fields.

use crate::error::{Error, Result};

const PKT_FW_VERSION_REQ: u8 = 0;
const PKT_FW_VERSION_RSP: u8 = 1;
const PKT_IMG_IDENTIFY_REQ: u8 = 2;
const PKT_IMG_IDENTIFY_RSP: u8 = 3;
const PKT_BLOCK_REQ: u8 = 4;
const PKT_BLOCK_RSP: u8 = 5;
const PKT_RESET_REQ: u8 = 6;
const PKT_RESET_RSP: u8 = 7;

/// One OAD protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OadMsg {
    FwVersionReq,
    FwVersionRsp {
        version: String,
    },
    ImgIdentifyReq {
        img_id: u8,
        payload: Vec<u8>,
    },
    ImgIdentifyRsp {
        status: u8,
    },
    BlockReq {
        img_id: u8,
        block_num: u16,
        multi_block_size: u16,
    },
    BlockRsp {
        img_id: u8,
        block_num: u16,
        data: Vec<u8>,
    },
    ResetReq,
    ResetRsp,
}

impl OadMsg {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            OadMsg::FwVersionReq => vec![PKT_FW_VERSION_REQ],
            OadMsg::FwVersionRsp { version } => {
                let mut out = vec![PKT_FW_VERSION_RSP];
                out.extend_from_slice(version.as_bytes());
                out
            }
            OadMsg::ImgIdentifyReq { img_id, payload } => {
                let mut out = vec![PKT_IMG_IDENTIFY_REQ, *img_id];
                out.extend_from_slice(payload);
                out
            }
            OadMsg::ImgIdentifyRsp { status } => vec![PKT_IMG_IDENTIFY_RSP, *status],
            OadMsg::BlockReq {
                img_id,
                block_num,
                multi_block_size,
            } => {
                let mut out = vec![PKT_BLOCK_REQ, *img_id];
                out.extend_from_slice(&block_num.to_le_bytes());
                out.extend_from_slice(&multi_block_size.to_le_bytes());
                out
            }
            OadMsg::BlockRsp {
                img_id,
                block_num,
                data,
            } => {
                let mut out = vec![PKT_BLOCK_RSP, *img_id];
                out.extend_from_slice(&block_num.to_le_bytes());
                out.extend_from_slice(data);
                out
            }
            OadMsg::ResetReq => vec![PKT_RESET_REQ],
            OadMsg::ResetRsp => vec![PKT_RESET_RSP],
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&pkt_id, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::Frame("empty OAD message".into()))?;

        let msg = match pkt_id {
            PKT_FW_VERSION_REQ => OadMsg::FwVersionReq,
            PKT_FW_VERSION_RSP => OadMsg::FwVersionRsp {
                version: String::from_utf8_lossy(rest)
                    .trim_end_matches('\0')
                    .to_string(),
            },
            PKT_IMG_IDENTIFY_REQ => {
                let (&img_id, payload) = rest
                    .split_first()
                    .ok_or_else(|| Error::Frame("short identify request".into()))?;
                OadMsg::ImgIdentifyReq {
                    img_id,
                    payload: payload.to_vec(),
                }
            }
            PKT_IMG_IDENTIFY_RSP => OadMsg::ImgIdentifyRsp {
                status: *rest
                    .first()
                    .ok_or_else(|| Error::Frame("short identify response".into()))?,
            },
            PKT_BLOCK_REQ => {
                if rest.len() < 5 {
                    return Err(Error::Frame("short block request".into()));
                }
                OadMsg::BlockReq {
                    img_id: rest[0],
                    block_num: u16::from_le_bytes([rest[1], rest[2]]),
                    multi_block_size: u16::from_le_bytes([rest[3], rest[4]]),
                }
            }
            PKT_BLOCK_RSP => {
                if rest.len() < 3 {
                    return Err(Error::Frame("short block response".into()));
                }
                OadMsg::BlockRsp {
                    img_id: rest[0],
                    block_num: u16::from_le_bytes([rest[1], rest[2]]),
                    data: rest[3..].to_vec(),
                }
            }
            PKT_RESET_REQ => OadMsg::ResetReq,
            PKT_RESET_RSP => OadMsg::ResetRsp,
            other => return Err(Error::Frame(format!("unknown OAD packet id {other}"))),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_req_roundtrip() {
        let msg = OadMsg::BlockReq {
            img_id: 3,
            block_num: 0x0102,
            multi_block_size: 1,
        };
        let bytes = msg.encode();
        assert_eq!(bytes, vec![PKT_BLOCK_REQ, 3, 0x02, 0x01, 1, 0]);
        assert_eq!(OadMsg::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn block_rsp_carries_partial_data() {
        let msg = OadMsg::BlockRsp {
            img_id: 1,
            block_num: 9,
            data: vec![0xAB; 100],
        };
        let decoded = OadMsg::decode(&msg.encode()).unwrap();
        match decoded {
            OadMsg::BlockRsp { data, .. } => assert_eq!(data.len(), 100),
            other => panic!("wrong decode: {:?}", other),
        }
    }

    #[test]
    fn fw_version_string() {
        let bytes = [&[PKT_FW_VERSION_RSP][..], b"sensor-2.04\0\0"].concat();
        match OadMsg::decode(&bytes).unwrap() {
            OadMsg::FwVersionRsp { version } => assert_eq!(version, "sensor-2.04"),
            other => panic!("wrong decode: {:?}", other),
        }
    }

    #[test]
    fn malformed_messages_rejected() {
        assert!(OadMsg::decode(&[]).is_err());
        assert!(OadMsg::decode(&[PKT_BLOCK_REQ, 1, 2]).is_err());
        assert!(OadMsg::decode(&[0xEE]).is_err());
    }
}
