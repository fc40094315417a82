//! Sample-frame model for the 8-channel digitiser stream.
//!
//! The C2H stream is a sequence of 32-byte frames. Each frame carries
//! one complex sample per channel: 8 channels × (I, Q), where each
//! component is a signed 16-bit little-endian integer, in the fixed
//! order `(I1, Q1, I2, Q2, …, I8, Q8)`. Every pointer advance over the
//! stream must be a multiple of the frame size.

use crate::error::{Error, Result};

/// Number of channels in the digitiser.
pub const NUM_CHANNELS: usize = 8;

/// Bytes per channel per frame (16-bit I + 16-bit Q).
pub const BYTES_PER_CHANNEL: usize = 4;

/// Size in bytes of one sample frame.
pub const FRAME_SIZE: usize = NUM_CHANNELS * BYTES_PER_CHANNEL;

/// Rounds a byte count down to a whole number of frames.
pub fn align_down(bytes: usize) -> usize {
    bytes / FRAME_SIZE * FRAME_SIZE
}

/// A subset of the digitiser's channels.
///
/// Channels are 1-indexed in all user-facing interfaces and stored as
/// a fixed-size mask internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSet {
    mask: [bool; NUM_CHANNELS],
}

impl Default for ChannelSet {
    /// The default set contains all eight channels.
    fn default() -> ChannelSet {
        ChannelSet {
            mask: [true; NUM_CHANNELS],
        }
    }
}

impl ChannelSet {
    /// Builds a channel set from 1-indexed channel numbers.
    ///
    /// An empty list selects all channels. Duplicates are tolerated.
    /// Returns [`Error::InvalidArgument`] if a channel is outside
    /// `1..=8`.
    pub fn from_list(channels: &[u8]) -> Result<ChannelSet> {
        if channels.is_empty() {
            return Ok(ChannelSet::default());
        }
        let mut mask = [false; NUM_CHANNELS];
        for &ch in channels {
            if !(1..=NUM_CHANNELS as u8).contains(&ch) {
                return Err(Error::invalid_argument(format!(
                    "channel {ch} outside 1..={NUM_CHANNELS}"
                )));
            }
            mask[usize::from(ch) - 1] = true;
        }
        Ok(ChannelSet { mask })
    }

    /// Parses a comma-separated list of 1-indexed channels, e.g. `1,3,5`.
    pub fn parse(s: &str) -> Result<ChannelSet> {
        let mut channels = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let ch = part
                .parse::<u8>()
                .map_err(|_| Error::invalid_argument(format!("bad channel {part:?}")))?;
            channels.push(ch);
        }
        ChannelSet::from_list(&channels)
    }

    /// Number of selected channels.
    pub fn count(&self) -> usize {
        self.mask.iter().filter(|&&a| a).count()
    }

    /// Whether all eight channels are selected.
    pub fn is_full(&self) -> bool {
        self.mask.iter().all(|&a| a)
    }

    /// Selected channels as ascending 0-based indices.
    pub fn indices(&self) -> Vec<usize> {
        (0..NUM_CHANNELS).filter(|&i| self.mask[i]).collect()
    }

    /// Selected channels as ascending 1-indexed numbers, for metadata.
    pub fn to_list(&self) -> Vec<u8> {
        self.indices().iter().map(|&i| i as u8 + 1).collect()
    }

    /// Size in bytes of one output frame for this channel subset.
    pub fn output_frame_size(&self) -> usize {
        self.count() * BYTES_PER_CHANNEL
    }
}

/// Demultiplexes the selected channels out of a full 8-channel stream.
///
/// `input` must be a whole number of frames; any trailing partial
/// frame is ignored. The output contains, for each input frame, the
/// four bytes of each selected channel in ascending channel order.
/// When all channels are selected the input is returned verbatim.
pub fn demux(input: &[u8], channels: &ChannelSet) -> Vec<u8> {
    let frames = input.len() / FRAME_SIZE;
    if channels.is_full() {
        return input[..frames * FRAME_SIZE].to_vec();
    }
    let src_offsets: Vec<usize> = channels
        .indices()
        .iter()
        .map(|&i| i * BYTES_PER_CHANNEL)
        .collect();
    let out_frame = channels.output_frame_size();
    let mut output = vec![0u8; frames * out_frame];
    let mut w = 0;
    for f in 0..frames {
        let base = f * FRAME_SIZE;
        for &off in &src_offsets {
            let src = base + off;
            output[w..w + BYTES_PER_CHANNEL]
                .copy_from_slice(&input[src..src + BYTES_PER_CHANNEL]);
            w += BYTES_PER_CHANNEL;
        }
    }
    output
}
