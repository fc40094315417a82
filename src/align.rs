//! Opt-in half-frame alignment transform.
//!
//! Some gateware revisions deliver the two halves of each frame with a
//! fixed skew: the first four channels of frame `i` belong with the
//! last four channels of frame `i + SHIFT_FRAMES`. This post-process
//! re-pairs them, dropping the unpaired tail. Whether it is needed
//! depends on the FPGA bitstream revision, so it is applied only when
//! explicitly requested and is not part of the capture path proper.

use crate::frame::FRAME_SIZE;

/// Skew between the two frame halves, in frames.
pub const SHIFT_FRAMES: usize = 97_992;

const HALF_FRAME: usize = FRAME_SIZE / 2;

/// Re-pairs frame halves skewed by [`SHIFT_FRAMES`].
///
/// For each output frame `i`, the first half comes from input frame
/// `i + SHIFT_FRAMES` and the second half from input frame `i`.
/// Returns `(data, applied)`; inputs shorter than the shift are
/// returned unchanged with `applied == false`.
pub fn shift_alignment(data: &[u8]) -> (Vec<u8>, bool) {
    let total_frames = data.len() / FRAME_SIZE;
    if total_frames <= SHIFT_FRAMES {
        return (data.to_vec(), false);
    }
    let out_frames = total_frames - SHIFT_FRAMES;
    let mut out = vec![0u8; out_frames * FRAME_SIZE];
    for i in 0..out_frames {
        let dst = i * FRAME_SIZE;
        let src_early = (i + SHIFT_FRAMES) * FRAME_SIZE;
        let src_late = i * FRAME_SIZE;
        out[dst..dst + HALF_FRAME].copy_from_slice(&data[src_early..src_early + HALF_FRAME]);
        out[dst + HALF_FRAME..dst + FRAME_SIZE]
            .copy_from_slice(&data[src_late + HALF_FRAME..src_late + FRAME_SIZE]);
    }
    (out, true)
}
