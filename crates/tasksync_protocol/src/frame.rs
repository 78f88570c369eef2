//! Coalescing of several envelopes into one physical text frame.

use crate::envelope::Envelope;
use crate::error::{ProtocolError, ProtocolResult};

/// Separator between envelopes inside one frame.
pub const FRAME_SEPARATOR: char = '\n';

/// Joins already-serialized envelopes into a single frame.
pub fn join_frame<I, S>(messages: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut frame = String::new();
    for (i, message) in messages.into_iter().enumerate() {
        if i > 0 {
            frame.push(FRAME_SEPARATOR);
        }
        frame.push_str(message.as_ref());
    }
    frame
}

/// Splits a frame into its envelopes, in order.
///
/// Each line is decoded independently so one malformed envelope does not
/// poison the rest of the frame. Blank lines are skipped.
pub fn split_frame(frame: &str) -> impl Iterator<Item = ProtocolResult<Envelope>> + '_ {
    frame
        .split(FRAME_SEPARATOR)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(position, line)| {
            serde_json::from_str(line).map_err(|source| ProtocolError::Malformed { position, source })
        })
}
