//! Transcoding negotiation - decides the format and bitrate to serve
//!
//! Transcoding is an optimisation, never a requirement: every path that cannot
//! be resolved to a transcoding rule falls back to the original bytes.

use crate::repository::TranscodingRepository;
use crate::types::{MediaFile, StreamRequest, RAW_FORMAT};

/// Negotiated output of a stream request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Target format, or `raw` for the original file
    pub format: String,
    /// Bitrate in kbps
    pub bit_rate: u32,
}

impl Selection {
    pub fn raw(bit_rate: u32) -> Self {
        Self {
            format: RAW_FORMAT.to_string(),
            bit_rate,
        }
    }

    /// Whether the original bytes are served unmodified
    pub fn is_raw(&self) -> bool {
        self.format == RAW_FORMAT
    }
}

/// Resolve the format and bitrate to serve for `mf`.
pub fn select_transcoding_options(
    transcodings: &dyn TranscodingRepository,
    mf: &MediaFile,
    request: &StreamRequest,
    default_downsampling_format: Option<&str>,
) -> Selection {
    let req_format = request.format.as_str();
    let req_bit_rate = request.bit_rate;

    if req_format == RAW_FORMAT {
        return Selection::raw(0);
    }

    if req_format == mf.suffix && req_bit_rate == 0 {
        return Selection::raw(mf.bit_rate);
    }

    let mut candidate_format = String::new();
    let mut candidate_bit_rate = 0;

    if !req_format.is_empty() {
        candidate_format = req_format.to_string();
    } else if let Some(profile) = &request.profile {
        candidate_format = profile.target_format.clone();
        candidate_bit_rate = profile.default_bit_rate;
        if let Some(player) = &request.player {
            candidate_bit_rate = player.max_bit_rate;
        }
    } else if req_bit_rate > 0 && req_bit_rate < mf.bit_rate {
        // Only a bitrate was asked for, and it is lower than the original:
        // downsample with the server default, if there is one.
        if let Some(default_format) = default_downsampling_format.filter(|f| !f.is_empty()) {
            tracing::debug!(
                format = default_format,
                bit_rate = req_bit_rate,
                "Using default downsampling format"
            );
            candidate_format = default_format.to_string();
        }
    }

    if req_bit_rate > 0 {
        candidate_bit_rate = req_bit_rate;
    }

    if candidate_bit_rate == 0 && candidate_format.is_empty() {
        return Selection::raw(0);
    }

    let selection = match transcodings.find_by_format(&candidate_format) {
        Ok(rule) => Selection {
            format: rule.target_format,
            bit_rate: if candidate_bit_rate != 0 {
                candidate_bit_rate
            } else {
                rule.default_bit_rate
            },
        },
        Err(e) => {
            tracing::debug!(
                format = %candidate_format,
                error = %e,
                "No transcoding rule, serving original"
            );
            return Selection::raw(0);
        }
    };

    // Same container at an equal or higher bitrate would not save anything
    if selection.format == mf.suffix && selection.bit_rate >= mf.bit_rate {
        return Selection::raw(0);
    }

    selection
}
