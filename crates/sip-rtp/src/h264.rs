//! H.264 depacketiser (RFC 6184), spec §4.9.

use crate::nal::annex_b;
use crate::seq::FrameAccumulator;
use crate::Depacketizer;

const NAL_TYPE_NON_IDR_SLICE: u8 = 5;
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;
const NAL_TYPE_FU_B: u8 = 29;

/// Reassembles Annex-B access units out of single-NAL, STAP-A, and FU-A
/// RTP payloads. One instance per RTP session (per SSRC).
#[derive(Default)]
pub struct H264Depacketizer {
    group: FrameAccumulator,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Depacketizer for H264Depacketizer {
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
        let is_key_frame = nals.iter().any(|n| matches!(nal_type(n), NAL_TYPE_SPS | NAL_TYPE_PPS))
            && !nals.iter().any(|n| nal_type(n) == NAL_TYPE_NON_IDR_SLICE);
        Some((annex_b(&nals), is_key_frame))
    }
}

fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1F).unwrap_or(0)
}

fn extract_nals(group: &[(u16, Vec<u8>)]) -> Vec<Vec<u8>> {
    let mut nals = Vec::new();
    let mut fu_scratch: Option<Vec<u8>> = None;
    for (_, payload) in group {
        if payload.is_empty() {
            continue;
        }
        let header = payload[0];
        match header & 0x1F {
            NAL_TYPE_STAP_A => {
                let mut offset = 1;
                while offset + 2 <= payload.len() {
                    let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                    offset += 2;
                    if offset + size > payload.len() {
                        tracing::debug!("truncated STAP-A aggregation unit, dropping remainder");
                        break;
                    }
                    nals.push(payload[offset..offset + size].to_vec());
                    offset += size;
                }
            }
            NAL_TYPE_FU_A => {
                if payload.len() < 2 {
                    continue;
                }
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let fu_type = fu_header & 0x1F;
                if start {
                    let f = header & 0x80;
                    let nri = header & 0x60;
                    let mut buf = vec![f | nri | fu_type];
                    buf.extend_from_slice(&payload[2..]);
                    fu_scratch = Some(buf);
                } else if let Some(buf) = fu_scratch.as_mut() {
                    buf.extend_from_slice(&payload[2..]);
                } else {
                    tracing::debug!("FU-A continuation with no start fragment buffered, dropping");
                }
                if end {
                    if let Some(buf) = fu_scratch.take() {
                        nals.push(buf);
                    }
                }
            }
            NAL_TYPE_FU_B => {
                // Two-byte decoding-order-number variant of FU-A; counted
                // but not reconstructed.
            }
            25..=27 => {
                // Reserved NAL unit types; counted but otherwise ignored.
            }
            _ => nals.push(payload.clone()),
        }
    }
    nals
}
