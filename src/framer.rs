//! Byte-to-text framing for the input side of a stream.
//!
//! Multi-byte UTF-8 sequences can straddle chunk boundaries, so the framer
//! holds back an incomplete trailing sequence (at most three bytes) until
//! the next chunk completes it.

use crate::error::{ExecutionError, Result};

/// Decodes incoming byte chunks into text, carrying a split UTF-8 tail
/// across chunk boundaries.
#[derive(Debug, Default)]
pub struct Utf8Framer {
    leftover: [u8; 4],
    leftover_len: usize,
}

impl Utf8Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one chunk, prepending any held-back bytes from the previous
    /// chunk. A trailing incomplete sequence is buffered for the next call;
    /// anything else that fails to decode is an error.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<String> {
        if self.leftover_len == 0 {
            return match std::str::from_utf8(chunk) {
                Ok(s) => Ok(s.to_owned()),
                Err(e) => self.decode_tail(chunk, e),
            };
        }

        let mut buf = Vec::with_capacity(self.leftover_len + chunk.len());
        buf.extend_from_slice(&self.leftover[..self.leftover_len]);
        buf.extend_from_slice(chunk);
        self.leftover_len = 0;

        match std::str::from_utf8(&buf) {
            Ok(s) => Ok(s.to_owned()),
            Err(e) => {
                let valid = e.valid_up_to();
                if e.error_len().is_none() && buf.len() - valid <= 3 {
                    let tail = buf.len() - valid;
                    self.leftover[..tail].copy_from_slice(&buf[valid..]);
                    self.leftover_len = tail;
                    // Valid prefix was already checked by from_utf8.
                    Ok(String::from_utf8(buf[..valid].to_vec())?)
                } else {
                    Err(ExecutionError::InvalidUtf8)
                }
            }
        }
    }

    fn decode_tail(&mut self, chunk: &[u8], e: std::str::Utf8Error) -> Result<String> {
        let valid = e.valid_up_to();
        if e.error_len().is_none() && chunk.len() - valid <= 3 {
            let tail = chunk.len() - valid;
            self.leftover[..tail].copy_from_slice(&chunk[valid..]);
            self.leftover_len = tail;
            Ok(std::str::from_utf8(&chunk[..valid])?.to_owned())
        } else {
            Err(ExecutionError::InvalidUtf8)
        }
    }

    /// Fails if the stream ended in the middle of a multi-byte sequence.
    pub fn finish(&mut self) -> Result<()> {
        if self.leftover_len > 0 {
            self.leftover_len = 0;
            return Err(ExecutionError::InvalidUtf8);
        }
        Ok(())
    }
}
