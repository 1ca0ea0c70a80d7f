//! `<!--esi … -->` comment stripping.
//!
//! The filter runs on the streamer state ahead of the recognizer and
//! removes the comment markers in place, leaving the enclosed content in
//! the buffer for normal processing. The in-comment flag survives chunk
//! boundaries, and a buffer ending with a proper prefix of either marker
//! is postponed until the next chunk can settle it.

use crate::parse::Streamer;

const OPENER: &str = "<!--esi";
const CLOSER: &str = "-->";

#[derive(Debug, Default)]
pub struct EsiCommentFilter {
    in_comment: bool,
}

impl EsiCommentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip alternating `<!--esi` and `-->` markers out of the buffered
    /// text, and postpone a trailing marker prefix.
    pub fn pre_process(&mut self, streamer: &mut Streamer) {
        let buffer = std::mem::take(&mut streamer.buffered_text);
        let mut out = String::with_capacity(buffer.len());
        let mut rest = buffer.as_str();

        loop {
            let marker = if self.in_comment { CLOSER } else { OPENER };
            match rest.find(marker) {
                Some(i) => {
                    out.push_str(&rest[..i]);
                    rest = &rest[i + marker.len()..];
                    self.in_comment = !self.in_comment;
                }
                None => {
                    let keep = trailing_prefix_len(rest, marker);
                    out.push_str(&rest[..rest.len() - keep]);
                    if keep > 0 {
                        // Earlier postponed text is even further down the
                        // stream; the new tail goes in front of it.
                        streamer
                            .postponed_text
                            .insert_str(0, &rest[rest.len() - keep..]);
                    }
                    break;
                }
            }
        }

        streamer.buffered_text = out;
    }
}

// Longest proper prefix of `marker` that the buffer ends with.
fn trailing_prefix_len(s: &str, marker: &str) -> usize {
    for len in (1..marker.len()).rev() {
        if s.ends_with(&marker[..len]) {
            return len;
        }
    }
    0
}
