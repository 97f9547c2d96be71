//! Annex-B bitstream emission shared by the H.264 and H.265 extractors
//! (spec §4.9): each reassembled NAL unit is prefixed with a 4-byte start
//! code so the output is a standard elementary stream rather than the
//! length-prefixed form RTP payloads use internally.

pub(crate) fn annex_b(nals: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nals.iter().map(|n| n.len() + 4).sum());
    for nal in nals {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nal);
    }
    out
}
