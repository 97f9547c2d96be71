//! MJPEG depacketiser (RFC 2435), spec §4.9.
//!
//! Unlike the NAL-based codecs, an MJPEG RTP payload carries no elementary
//! stream of its own — each packet's JPEG main header names the
//! quantization and frame parameters needed to rebuild a standalone,
//! JFIF-compliant JPEG image around the compressed scan data. This module
//! reassembles that image; it does not touch the scan data itself.

mod tables;

use crate::Depacketizer;
use tables::{default_dht, CHROMA_QUANTIZER, LUMA_QUANTIZER};

/// Reassembles one JPEG image per RTP frame. MJPEG is intra-only, so
/// every frame this emits is independently decodable — `is_key_frame` is
/// always `true`.
#[derive(Default)]
pub struct MjpegDepacketizer {
    frame: Vec<u8>,
}

impl MjpegDepacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_eoi(&mut self) {
        if !self.frame.ends_with(&[0xFF, 0xD9]) {
            self.frame.extend_from_slice(&[0xFF, 0xD9]);
        }
    }
}

impl Depacketizer for MjpegDepacketizer {
    fn process_packet(
        &mut self,
        rtp_payload: &[u8],
        _seq_num: u16,
        _timestamp: u32,
        marker_bit: bool,
    ) -> Option<(Vec<u8>, bool)> {
        if rtp_payload.len() < 8 {
            tracing::debug!("MJPEG packet shorter than the fixed main header, dropping");
            return None;
        }
        let fragment_offset = u32::from_be_bytes([0, rtp_payload[1], rtp_payload[2], rtp_payload[3]]);
        let jpeg_type = rtp_payload[4];
        let q = rtp_payload[5];
        let width = rtp_payload[6] as u16 * 8;
        let height = rtp_payload[7] as u16 * 8;
        let mut offset = 8;

        let mut restart_interval = None;
        if jpeg_type > 63 {
            if rtp_payload.len() < offset + 4 {
                return None;
            }
            restart_interval = Some(u16::from_be_bytes([rtp_payload[offset], rtp_payload[offset + 1]]));
            offset += 4;
        }

        let mut flushed = None;

        if fragment_offset == 0 {
            if !self.frame.is_empty() {
                // The previous frame never saw its terminating fragment
                // (a lost packet); flush what was buffered rather than
                // silently merging it with the frame that's starting now.
                self.ensure_eoi();
                flushed = Some((std::mem::take(&mut self.frame), true));
            }

            let (lum_q, chr_q) = if q > 127 {
                if rtp_payload.len() < offset + 4 {
                    return flushed;
                }
                let length = u16::from_be_bytes([rtp_payload[offset + 2], rtp_payload[offset + 3]]) as usize;
                offset += 4;
                if rtp_payload.len() < offset + length {
                    return flushed;
                }
                let tables = &rtp_payload[offset..offset + length];
                offset += length;
                split_quant_tables(tables)
            } else {
                (scale_table(&LUMA_QUANTIZER, q), scale_table(&CHROMA_QUANTIZER, q))
            };

            self.frame
                .extend_from_slice(&build_jpeg_header(jpeg_type, width, height, restart_interval, &lum_q, &chr_q));
        }

        if offset <= rtp_payload.len() {
            self.frame.extend_from_slice(&rtp_payload[offset..]);
        }

        if marker_bit {
            self.ensure_eoi();
            return Some((std::mem::take(&mut self.frame), true));
        }

        flushed
    }
}

/// RFC 2435 §3.8: clamp `Q` to `[1, 99]`, derive a scale factor, and scale
/// each entry of the default table by it.
fn scale_table(default_table: &[u8; 64], q: u8) -> Vec<u8> {
    let q = q.clamp(1, 99) as u32;
    let scale = if q < 50 { 5000 / q } else { 200 - 2 * q };
    default_table
        .iter()
        .map(|&entry| (((entry as u32) * scale + 50) / 100).clamp(1, 255) as u8)
        .collect()
}

/// Splits an explicit quantization-table block (present when `Q > 127`)
/// into luma/chroma tables. Falls back to the default tables if the block
/// is shorter than expected rather than panicking on malformed input.
fn split_quant_tables(bytes: &[u8]) -> (Vec<u8>, Vec<u8>) {
    if bytes.len() >= 128 {
        (bytes[..64].to_vec(), bytes[64..128].to_vec())
    } else if bytes.len() >= 64 {
        (bytes[..64].to_vec(), bytes[..64].to_vec())
    } else {
        (LUMA_QUANTIZER.to_vec(), CHROMA_QUANTIZER.to_vec())
    }
}

fn make_jfif_app0() -> [u8; 18] {
    [
        0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00,
    ]
}

fn make_dri_header(interval: u16) -> [u8; 6] {
    let i = interval.to_be_bytes();
    [0xFF, 0xDD, 0x00, 0x04, i[0], i[1]]
}

fn make_quant_header(table: &[u8], table_id: u8) -> Vec<u8> {
    let mut v = vec![0xFF, 0xDB, 0x00, 0x43, table_id];
    v.extend_from_slice(table);
    v
}

/// RFC 2435 §3.1.3: the low bit of `Type` selects 4:2:2 vs 4:2:0 chroma
/// subsampling; the sampling factors below follow the widely-deployed
/// MJPEG-over-RTP depacketisers built against this same RFC.
fn sof0_components(jpeg_type: u8) -> [(u8, u8, u8); 3] {
    if jpeg_type & 0x01 == 1 {
        [(1, 0x21, 0), (2, 0x11, 1), (3, 0x11, 1)]
    } else {
        [(1, 0x22, 0), (2, 0x11, 1), (3, 0x11, 1)]
    }
}

fn make_sof0_header(jpeg_type: u8, width: u16, height: u16) -> Vec<u8> {
    let mut v = vec![0xFF, 0xC0, 0x00, 0x11, 0x08];
    v.extend_from_slice(&height.to_be_bytes());
    v.extend_from_slice(&width.to_be_bytes());
    v.push(0x03);
    for (id, sampling, qt) in sof0_components(jpeg_type) {
        v.push(id);
        v.push(sampling);
        v.push(qt);
    }
    v
}

fn make_sos_header() -> [u8; 14] {
    [
        0xFF, 0xDA, 0x00, 0x0C, 0x03, 0x01, 0x00, 0x02, 0x11, 0x03, 0x11, 0x00, 0x3F, 0x00,
    ]
}

fn build_jpeg_header(
    jpeg_type: u8,
    width: u16,
    height: u16,
    restart_interval: Option<u16>,
    lum_q: &[u8],
    chr_q: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0xFF, 0xD8]); // SOI
    out.extend_from_slice(&make_jfif_app0());
    if let Some(interval) = restart_interval {
        out.extend_from_slice(&make_dri_header(interval));
    }
    out.extend_from_slice(&make_quant_header(lum_q, 0));
    out.extend_from_slice(&make_quant_header(chr_q, 1));
    out.extend_from_slice(&make_sof0_header(jpeg_type, width, height));
    out.extend_from_slice(default_dht());
    out.extend_from_slice(&make_sos_header());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn main_header(fragment_offset: u32, jpeg_type: u8, q: u8, width_units: u8, height_units: u8) -> Vec<u8> {
        let off = fragment_offset.to_be_bytes();
        vec![0, off[1], off[2], off[3], jpeg_type, q, width_units, height_units]
    }

    #[test]
    fn single_fragment_frame_is_returned_on_marker_bit() {
        let mut dep = MjpegDepacketizer::new();
        let mut payload = main_header(0, 1, 50, 80, 60);
        payload.extend_from_slice(b"scan-data");
        let (frame, is_key) = dep.process_packet(&payload, 1, 1000, true).unwrap();
        assert!(is_key);
        assert!(frame.starts_with(&[0xFF, 0xD8]));
        assert!(frame.ends_with(&[0xFF, 0xD9]));
        assert!(frame.windows(b"scan-data".len()).any(|w| w == b"scan-data"));
    }

    #[test]
    fn multi_fragment_frame_only_completes_on_marker() {
        let mut dep = MjpegDepacketizer::new();
        let mut first = main_header(0, 1, 50, 80, 60);
        first.extend_from_slice(b"part1");
        assert!(dep.process_packet(&first, 1, 1000, false).is_none());

        let mut second = main_header(5, 1, 50, 80, 60);
        second.extend_from_slice(b"part2");
        let (frame, _) = dep.process_packet(&second, 2, 1000, true).unwrap();
        assert!(frame.windows(5).any(|w| w == b"part1"));
        assert!(frame.windows(5).any(|w| w == b"part2"));
    }

    #[test]
    fn a_new_fragment_zero_flushes_a_stalled_previous_frame() {
        let mut dep = MjpegDepacketizer::new();
        let mut first = main_header(0, 1, 50, 80, 60);
        first.extend_from_slice(b"stale-frame");
        assert!(dep.process_packet(&first, 1, 1000, false).is_none());

        let mut next = main_header(0, 1, 50, 80, 60);
        next.extend_from_slice(b"new-frame");
        let (flushed, _) = dep.process_packet(&next, 2, 2000, false).unwrap();
        assert!(flushed.ends_with(&[0xFF, 0xD9]));
        assert!(flushed.windows(b"stale-frame".len()).any(|w| w == b"stale-frame"));
    }

    #[test]
    fn explicit_quant_tables_are_split_into_luma_and_chroma() {
        let tables: Vec<u8> = (0..128u16).map(|i| i as u8).collect();
        let (lum, chr) = split_quant_tables(&tables);
        assert_eq!(lum, tables[..64]);
        assert_eq!(chr, tables[64..128]);
    }

    #[test]
    fn quality_scaling_clamps_into_valid_range() {
        let table = scale_table(&LUMA_QUANTIZER, 90);
        assert!(table.iter().all(|&v| (1..=255).contains(&v)));
        let table = scale_table(&LUMA_QUANTIZER, 10);
        assert!(table.iter().all(|&v| (1..=255).contains(&v)));
    }

    proptest::proptest! {
        /// Every `Q` value, including out-of-range ones a malformed stream
        /// might send, must scale to a table of entries within `[1, 255]`.
        #[test]
        fn scale_table_entries_are_always_in_range(q: u8) {
            let luma = scale_table(&LUMA_QUANTIZER, q);
            let chroma = scale_table(&CHROMA_QUANTIZER, q);
            proptest::prop_assert!(luma.iter().all(|&v| (1..=255).contains(&v)));
            proptest::prop_assert!(chroma.iter().all(|&v| (1..=255).contains(&v)));
            proptest::prop_assert_eq!(luma.len(), 64);
            proptest::prop_assert_eq!(chroma.len(), 64);
        }
    }
}
