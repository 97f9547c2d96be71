//! VP8 depacketiser (RFC 7741), spec §4.9.

use crate::seq::FrameAccumulator;
use crate::Depacketizer;

/// Reassembles a VP8 frame from its RTP payload-descriptor-stripped
/// fragments. Key-frame detection inspects the first byte of the
/// partition-0 start packet, which this depacketiser assumes sorts first
/// once packets are ordered by sequence number.
#[derive(Default)]
pub struct Vp8Depacketizer {
    group: FrameAccumulator,
}

impl Vp8Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Depacketizer for Vp8Depacketizer {
    fn process_packet(
        &mut self,
        rtp_payload: &[u8],
        seq_num: u16,
        timestamp: u32,
        marker_bit: bool,
    ) -> Option<(Vec<u8>, bool)> {
        let stripped = match strip_descriptor(rtp_payload) {
            Some(data) => data.to_vec(),
            None => {
                tracing::debug!("malformed VP8 payload descriptor, dropping packet");
                return None;
            }
        };
        let group = self.group.accept(seq_num, timestamp, stripped, marker_bit)?;

        let mut frame = Vec::new();
        let mut is_key_frame = false;
        for (index, (_, payload)) in group.iter().enumerate() {
            if index == 0 {
                is_key_frame = payload.first().map(|b| b & 0x01 == 0).unwrap_or(false);
            }
            frame.extend_from_slice(payload);
        }
        Some((frame, is_key_frame))
    }
}

/// Strips the 1-6 byte VP8 payload descriptor (RFC 7741 §4.2), returning
/// the remaining VP8 payload data.
fn strip_descriptor(payload: &[u8]) -> Option<&[u8]> {
    let byte0 = *payload.first()?;
    let extended = byte0 & 0x80 != 0;
    let mut offset = 1;

    if extended {
        let ext = *payload.get(offset)?;
        offset += 1;
        let has_picture_id = ext & 0x80 != 0;
        let has_tl0picidx = ext & 0x40 != 0;
        let has_tid_or_keyidx = (ext & 0x20 != 0) || (ext & 0x10 != 0);

        if has_picture_id {
            let pid_byte = *payload.get(offset)?;
            offset += if pid_byte & 0x80 != 0 { 2 } else { 1 };
        }
        if has_tl0picidx {
            offset += 1;
        }
        if has_tid_or_keyidx {
            offset += 1;
        }
    }

    payload.get(offset..)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_descriptor_single_packet_key_frame() {
        let mut dep = Vp8Depacketizer::new();
        // byte0: X=0 N=0 S=1 PID=0; frame-tag byte0 bit0=0 -> key frame.
        let payload = [0x10, 0b0000_0000, 0xAB, 0xCD];
        let (frame, is_key) = dep.process_packet(&payload, 1, 1000, true).unwrap();
        assert_eq!(frame, vec![0b0000_0000, 0xAB, 0xCD]);
        assert!(is_key);
    }

    #[test]
    fn interframe_bit_set_is_not_a_key_frame() {
        let mut dep = Vp8Depacketizer::new();
        let payload = [0x10, 0b0000_0001, 0xAB];
        let (_, is_key) = dep.process_packet(&payload, 1, 1000, true).unwrap();
        assert!(!is_key);
    }

    #[test]
    fn extended_descriptor_with_short_picture_id_is_stripped() {
        let mut dep = Vp8Depacketizer::new();
        // X=1 S=1, ext byte I=1, picture id short form (top bit clear).
        let payload = [0x90, 0x80, 0x05, 0xAA, 0xBB];
        let (frame, _) = dep.process_packet(&payload, 1, 1000, true).unwrap();
        assert_eq!(frame, vec![0xAA, 0xBB]);
    }

    #[test]
    fn extended_descriptor_with_long_picture_id_is_stripped() {
        let mut dep = Vp8Depacketizer::new();
        // picture id top bit set -> 2-byte picture id.
        let payload = [0x90, 0x80, 0x85, 0x01, 0xAA, 0xBB];
        let (frame, _) = dep.process_packet(&payload, 1, 1000, true).unwrap();
        assert_eq!(frame, vec![0xAA, 0xBB]);
    }

    #[test]
    fn fragments_across_multiple_packets_concatenate_in_order() {
        let mut dep = Vp8Depacketizer::new();
        let first = [0x10, 0x00, 0x01, 0x02];
        let second = [0x00, 0x03, 0x04];
        assert!(dep.process_packet(&first, 1, 1000, false).is_none());
        let (frame, _) = dep.process_packet(&second, 2, 1000, true).unwrap();
        assert_eq!(frame, vec![0x00, 0x01, 0x02, 0x03, 0x04]);
    }
}
