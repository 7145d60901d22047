//! Incremental frame decoder.
//!
//! Turns an arbitrarily chunked byte stream into complete `(tag, payload)`
//! frames. Bytes of an incomplete frame are kept until the next `feed`.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{PgError, PgResult};

/// Tag byte plus Int32 length.
const HEADER_LEN: usize = 5;

/// Default upper bound on a single frame (1 GiB, the server's own limit for
/// a field value).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 30;

/// One complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

/// Stateful decoder for backend frames.
///
/// Once a malformed length has been seen the decoder is poisoned: every
/// later call reports the same protocol error and nothing more is emitted.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
    failed: Option<PgError>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(32 * 1024),
            max_frame_len,
            failed: None,
        }
    }

    /// Append `chunk` and iterate the frames it completes.
    ///
    /// The iterator is lazy: frames are split off the buffer only as they
    /// are pulled. Frames not pulled stay buffered for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buf.extend_from_slice(chunk);
        Frames { decoder: self }
    }

    /// Pop the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> PgResult<Option<Frame>> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len < 4 || len as usize > self.max_frame_len {
            let err = PgError::Protocol(format!(
                "Invalid frame length {} for message type {:?}",
                len, self.buf[0] as char
            ));
            self.failed = Some(err.clone());
            return Err(err);
        }

        // Length covers itself but not the tag
        let total = 1 + len as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        let mut frame = self.buf.split_to(total);
        let tag = frame[0];
        frame.advance(HEADER_LEN);
        Ok(Some(Frame {
            tag,
            payload: frame.freeze(),
        }))
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }
}

/// Iterator over the frames completed by one [`FrameDecoder::feed`] call.
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = PgResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        // An error is yielded once per call; the iterator then ends
        if self.decoder.is_failed() && self.decoder.buf.is_empty() {
            return None;
        }
        match self.decoder.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                self.decoder.buf.clear();
                Some(Err(e))
            }
        }
    }
}
