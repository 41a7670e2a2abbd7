//! Half-duplex line driver: owns the hardware (or mock) resource and drives
//! [`codec`] encode/decode around the blocking transmit/receive primitives
//! a real transceiver exposes.

use crate::codec::{self, CodecError, Frame, FrameTag, LineTiming};
use std::collections::VecDeque;

/// Depth of the frame queue a driver buffers between `recv_frame` calls.
pub const RX_QUEUE_CAPACITY: usize = 4;

/// Hardware primitives a concrete transceiver must provide. Modeled as
/// blocking calls: a real embedded driver would instead arm the peripheral
/// and complete from an interrupt, but collapsing that onto one synchronous
/// call per direction is the natural shape for a host-side program that owns
/// the whole call stack.
pub trait PlatformLine {
    /// Configures the derived Rx/Tx timing window for `bitrate_bps`.
    fn configure(&mut self, timing: LineTiming) -> Result<(), LineError>;
    /// Drives `symbols` (quarter-us total-times) onto the wire, one pulse per
    /// entry, and blocks until the last one has been transmitted.
    fn transmit_blocking(&mut self, symbols: &[u32]) -> Result<(), LineError>;
    /// Blocks until a full frame (leading pulse through trailing low) has
    /// been captured, or `timeout_us` elapses with nothing captured.
    fn receive_blocking(&mut self, timeout_us: u32) -> Result<Option<Vec<u32>>, LineError>;
}

/// Hardware-level line fault, distinct from a decode failure (a decode
/// failure is a valid-looking capture with bad content; a `LineError` is the
/// transceiver itself failing to run the primitive).
#[derive(Debug, Clone, thiserror::Error)]
pub enum LineError {
    #[error("line configuration rejected: {0}")]
    Configure(String),
    #[error("transmit failed: {0}")]
    Transmit(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// Drives a [`PlatformLine`], decoding captures into [`Frame`]s and
/// maintaining a small bounded receive queue (oldest-first, drop-newest on
/// overflow) the way the session engine expects frames to arrive.
pub struct LineDriver<P: PlatformLine> {
    platform: P,
    queue: VecDeque<Frame>,
    dropped_frames: u64,
}

impl<P: PlatformLine> LineDriver<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            queue: VecDeque::with_capacity(RX_QUEUE_CAPACITY),
            dropped_frames: 0,
        }
    }

    pub fn configure(&mut self, bitrate_bps: u32) -> Result<(), LineError> {
        let timing = codec::bitrate_timing(bitrate_bps)
            .map_err(|e| LineError::Configure(e.to_string()))?;
        self.platform.configure(timing)
    }

    /// Number of captured frames dropped because the receive queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Direct access to the underlying platform, for tests that need to
    /// script captures or inspect transmitted symbols.
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Drops `frame` (the newest arrival) if the queue is already at
    /// capacity, rather than evicting an older one: frames must be consumed
    /// in arrival order, so an overflow can only discard the incoming frame.
    fn enqueue(&mut self, frame: Frame) {
        if self.queue.len() >= RX_QUEUE_CAPACITY {
            self.dropped_frames += 1;
            return;
        }
        self.queue.push_back(frame);
    }

    /// Transmits `frame` on the wire.
    pub fn send_frame(&mut self, frame: &Frame) -> Result<(), LineError> {
        let symbols = codec::encode(frame);
        self.platform.transmit_blocking(&symbols)
    }

    /// Emits a bare calibration pulse.
    pub fn emit_calibration(&mut self) -> Result<(), LineError> {
        self.send_frame(&Frame::Calibration)
    }

    /// Emits the enter-PPM pattern for at least `total_us`.
    pub fn emit_enter_pattern(&mut self, total_us: u32) -> Result<(), LineError> {
        self.send_frame(&Frame::EnterPattern {
            widths_us: codec::ENTER_PATTERN_WIDTHS_US,
            total_us,
        })
    }

    /// Waits up to `timeout_us` for the next frame, draining any capture
    /// already queued first. Decode failures are swallowed (per the wire
    /// contract, a malformed capture is simply not a frame) and retried
    /// against the remaining timeout budget.
    pub fn recv_frame(&mut self, timeout_us: u32) -> Result<Option<Frame>, LineError> {
        if let Some(frame) = self.queue.pop_front() {
            return Ok(Some(frame));
        }
        match self.platform.receive_blocking(timeout_us)? {
            None => Ok(None),
            Some(symbols) => match codec::decode(&symbols) {
                Ok(decoded) => {
                    if let Some(frame) = decoded.into_frame() {
                        self.enqueue(frame);
                        Ok(self.queue.pop_front())
                    } else {
                        Ok(None)
                    }
                }
                Err(CodecError::DecodeFraming) | Err(CodecError::DecodeTiming) => Ok(None),
            },
        }
    }

    /// Waits for a frame carrying one of `tags`, discarding anything else
    /// (a stray Calibration, say) until the timeout elapses.
    pub fn recv_frame_tagged(
        &mut self,
        timeout_us: u32,
        tags: &[FrameTag],
    ) -> Result<Option<Frame>, LineError> {
        match self.recv_frame(timeout_us)? {
            Some(frame) if tags.contains(&frame.tag()) => Ok(Some(frame)),
            _ => Ok(None),
        }
    }
}
