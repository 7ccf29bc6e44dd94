//! Counters-service RMPP fragment correction
//!
//! The kernel RMPP layer reassembles vendor-class MADs assuming a 40-byte class
//! header (MAD + RMPP + OUI). Counters-service MADs actually carry a 56-byte
//! header, so every segment after the first arrives with a redundant 16-byte
//! sub-header in front of its data. This correction applies to the counters
//! management class only; other vendor classes are passed through untouched.

use crate::mad::{
    MAD_HEADER_SIZE, MCLASS_VFI_PM, RMPP_HEADER_SIZE, SA_DATA_OFFSET, STL_SA_DATA_SIZE,
};
use crate::{MadError, MadResult};
use tracing::debug;

/// Class header length the kernel assumes for vendor RMPP classes
pub const RMPP_VENDOR_HDR_LEN: usize = MAD_HEADER_SIZE + RMPP_HEADER_SIZE + 4;
/// Redundant bytes in front of each segment after the first
pub const RMPP_PA_SUBHEADER_LEN: usize = SA_DATA_OFFSET - RMPP_VENDOR_HDR_LEN;

const SEGMENT_WIRE_LEN: usize = STL_SA_DATA_SIZE + RMPP_PA_SUBHEADER_LEN;

/// Segment layout of a reassembled counters-service response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub full_segments: usize,
    pub last_segment: usize,
}

impl SegmentLayout {
    pub fn for_length(len: usize) -> Self {
        let body = len.saturating_sub(RMPP_VENDOR_HDR_LEN);
        let rem = body % SEGMENT_WIRE_LEN;
        Self {
            full_segments: body / SEGMENT_WIRE_LEN,
            last_segment: if rem <= RMPP_PA_SUBHEADER_LEN { 0 } else { rem - RMPP_PA_SUBHEADER_LEN },
        }
    }

    /// Size of the response once the redundant sub-headers are removed
    pub fn corrected_length(&self) -> usize {
        SA_DATA_OFFSET + self.full_segments * STL_SA_DATA_SIZE + self.last_segment
    }
}

/// Whether a reassembled response needs the sub-header correction
pub fn needs_correction(mad: &[u8]) -> bool {
    mad.get(1).copied() == Some(MCLASS_VFI_PM)
}

/// Strip the per-segment sub-headers from a kernel-reassembled counters response
pub fn strip_segment_subheaders(raw: &[u8]) -> MadResult<Vec<u8>> {
    if raw.len() < SA_DATA_OFFSET {
        return Err(MadError::error(format!(
            "RMPP response of {} bytes is shorter than its class header",
            raw.len()
        )));
    }

    let layout = SegmentLayout::for_length(raw.len());
    let final_len = layout.corrected_length();
    debug!(
        "PA RMPP adjustment: length {} -> {}, segments {}{}",
        raw.len(),
        final_len,
        layout.full_segments,
        if layout.last_segment > 0 { " + 1" } else { "" }
    );

    let mut out = Vec::with_capacity(final_len);
    out.extend_from_slice(&raw[..SA_DATA_OFFSET]);

    let mut src = SA_DATA_OFFSET;
    for _ in 0..layout.full_segments {
        out.extend_from_slice(segment(raw, src, STL_SA_DATA_SIZE)?);
        src += SEGMENT_WIRE_LEN;
    }
    if layout.last_segment > 0 {
        out.extend_from_slice(segment(raw, src, layout.last_segment)?);
    }
    Ok(out)
}

fn segment(raw: &[u8], start: usize, len: usize) -> MadResult<&[u8]> {
    raw.get(start..start + len).ok_or_else(|| {
        MadError::error(format!(
            "RMPP segment at {}+{} exceeds response of {} bytes",
            start,
            len,
            raw.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Lay out a logical payload the way the kernel hands it back
    fn kernel_reassembled(payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![0u8; SA_DATA_OFFSET];
        raw[1] = MCLASS_VFI_PM;
        for (i, chunk) in payload.chunks(STL_SA_DATA_SIZE).enumerate() {
            if i > 0 {
                raw.extend_from_slice(&[0xee; RMPP_PA_SUBHEADER_LEN]);
            }
            raw.extend_from_slice(chunk);
        }
        raw
    }

    #[test]
    fn test_constants() {
        assert_eq!(RMPP_VENDOR_HDR_LEN, 40);
        assert_eq!(RMPP_PA_SUBHEADER_LEN, 16);
        assert_eq!(STL_SA_DATA_SIZE, 1992);
    }

    #[test]
    fn test_exact_segment_boundary() {
        let payload: Vec<u8> = (0..STL_SA_DATA_SIZE * 2).map(|i| i as u8).collect();
        let raw = kernel_reassembled(&payload);
        let layout = SegmentLayout::for_length(raw.len());
        assert_eq!(layout, SegmentLayout { full_segments: 2, last_segment: 0 });

        let fixed = strip_segment_subheaders(&raw).unwrap();
        assert_eq!(&fixed[SA_DATA_OFFSET..], &payload[..]);
    }

    #[test]
    fn test_partial_last_segment() {
        let payload: Vec<u8> = (0..STL_SA_DATA_SIZE * 2 + 100).map(|i| (i % 251) as u8).collect();
        let raw = kernel_reassembled(&payload);
        assert_eq!(raw.len(), SA_DATA_OFFSET + payload.len() + 32);

        let fixed = strip_segment_subheaders(&raw).unwrap();
        assert_eq!(fixed.len(), SA_DATA_OFFSET + payload.len());
        assert_eq!(&fixed[SA_DATA_OFFSET..], &payload[..]);
    }

    #[test]
    fn test_header_only_and_short_input() {
        let raw = kernel_reassembled(&[]);
        assert_eq!(strip_segment_subheaders(&raw).unwrap().len(), SA_DATA_OFFSET);
        assert!(strip_segment_subheaders(&[0u8; 20]).is_err());
    }

    #[test]
    fn test_only_counters_class_is_corrected() {
        let mut raw = kernel_reassembled(&[1, 2, 3]);
        assert!(needs_correction(&raw));
        raw[1] = 0x03;
        assert!(!needs_correction(&raw));
    }

    proptest! {
        #[test]
        fn prop_reassembly_restores_advertised_length(len in 0usize..(STL_SA_DATA_SIZE * 6)) {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let raw = kernel_reassembled(&payload);

            let fixed = strip_segment_subheaders(&raw).unwrap();
            prop_assert_eq!(fixed.len(), SA_DATA_OFFSET + len);
            prop_assert_eq!(&fixed[SA_DATA_OFFSET..], &payload[..]);
        }
    }
}
