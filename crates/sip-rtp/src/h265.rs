//! H.265/HEVC depacketiser (RFC 7798), spec §4.9.

use crate::nal::annex_b;
use crate::seq::FrameAccumulator;
use crate::Depacketizer;

const NAL_TYPE_VPS: u8 = 32;
const NAL_TYPE_SPS: u8 = 33;
const NAL_TYPE_PPS: u8 = 34;
const PACKET_TYPE_AP: u8 = 48;
const PACKET_TYPE_FU: u8 = 49;

/// Reassembles Annex-B access units out of single-NAL, Aggregation Packet,
/// and Fragmentation Unit RTP payloads.
#[derive(Default)]
pub struct H265Depacketizer {
    group: FrameAccumulator,
}

impl H265Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Depacketizer for H265Depacketizer {
    fn process_packet(
        &mut self,
        rtp_payload: &[u8],
        seq_num: u16,
        timestamp: u32,
        marker_bit: bool,
    ) -> Option<(Vec<u8>, bool)> {
        let group = self
            .group
            .accept(seq_num, timestamp, rtp_payload.to_vec(), marker_bit)?;
        let nals = extract_nals(&group);
        if nals.is_empty() {
            return None;
        }
        let is_key_frame = nals
            .iter()
            .any(|n| matches!(nal_type(n), NAL_TYPE_VPS | NAL_TYPE_SPS | NAL_TYPE_PPS));
        Some((annex_b(&nals), is_key_frame))
    }
}

fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| (b >> 1) & 0x3F).unwrap_or(0)
}

fn extract_nals(group: &[(u16, Vec<u8>)]) -> Vec<Vec<u8>> {
    let mut nals = Vec::new();
    let mut fu_scratch: Option<Vec<u8>> = None;
    for (_, payload) in group {
        if payload.len() < 2 {
            continue;
        }
        let packet_type = (payload[0] >> 1) & 0x3F;
        match packet_type {
            PACKET_TYPE_AP => {
                let mut offset = 2;
                while offset + 2 <= payload.len() {
                    let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                    offset += 2;
                    if offset + size > payload.len() {
                        tracing::debug!("truncated aggregation packet, dropping remainder");
                        break;
                    }
                    nals.push(payload[offset..offset + size].to_vec());
                    offset += size;
                }
            }
            PACKET_TYPE_FU => {
                if payload.len() < 3 {
                    continue;
                }
                let fu_header = payload[2];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let fu_type = fu_header & 0x3F;
                if start {
                    let f = payload[0] & 0x80;
                    let layer_id = ((payload[0] & 0x01) << 5) | (payload[1] >> 3);
                    let tid_plus1 = payload[1] & 0x07;
                    let byte0 = f | (fu_type << 1) | (layer_id >> 5);
                    let byte1 = ((layer_id & 0x1F) << 3) | tid_plus1;
                    let mut buf = vec![byte0, byte1];
                    buf.extend_from_slice(&payload[3..]);
                    fu_scratch = Some(buf);
                } else if let Some(buf) = fu_scratch.as_mut() {
                    buf.extend_from_slice(&payload[3..]);
                } else {
                    tracing::debug!("FU continuation with no start fragment buffered, dropping");
                }
                if end {
                    if let Some(buf) = fu_scratch.take() {
                        nals.push(buf);
                    }
                }
            }
            _ => nals.push(payload.clone()),
        }
    }
    nals
}
