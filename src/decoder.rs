//! Frame decoding for scanner byte streams.
//!
//! The scanner terminates each scan with a carriage return. Bytes may arrive
//! in arbitrary chunks, down to one at a time, so the decoder keeps whatever
//! has not been terminated yet and carries it into the next call.

use tracing::warn;

use crate::models::ScanToken;

/// Frame terminator emitted by the scanner.
pub const TERMINATOR: u8 = b'\r';

/// Longest frame accepted. Anything longer is a device that never sends
/// [`TERMINATOR`] (a tty left in cooked mode turns it into `\n`), and is
/// discarded up to the next terminator.
pub const MAX_FRAME_LEN: usize = 1024;

#[derive(Debug, Default)]
pub struct ScanDecoder {
    buf: Vec<u8>,
    overflowed: bool,
}

impl ScanDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes and returns every token completed by them, in order.
    ///
    /// Terminators with nothing (or only whitespace and quotes) before them
    /// are dropped.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ScanToken> {
        let mut tokens = Vec::new();
        for &b in bytes {
            if b == TERMINATOR {
                if !std::mem::take(&mut self.overflowed) {
                    let raw = String::from_utf8_lossy(&self.buf);
                    if let Some(token) = ScanToken::normalize(&raw) {
                        tokens.push(token);
                    }
                }
                self.buf.clear();
            } else if self.overflowed {
                continue;
            } else if self.buf.len() >= MAX_FRAME_LEN {
                warn!(
                    max = MAX_FRAME_LEN,
                    "scan frame exceeds maximum length without a carriage return; \
                     discarding until the next one (is the device in raw mode?)"
                );
                self.buf.clear();
                self.overflowed = true;
            } else {
                self.buf.push(b);
            }
        }
        tokens
    }

    /// Bytes received since the last terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
