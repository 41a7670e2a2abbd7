//! Wire codec: encodes logical frames into pulse-position-modulated symbol
//! sequences and decodes captured symbol sequences back into frames.
//!
//! All timing is carried in quarter-microsecond units (0.25 us ticks) to
//! match the hardware capture/generate peripheral's native resolution.

use crate::error::Error;

/// Distance in quarter-us between adjacent symbol total-times (1.5 us).
pub const BIT_DISTANCE_Q: u32 = 6;
/// Acceptance/classification tolerance, half the bit distance (0.75 us).
pub const EPSILON_Q: u32 = BIT_DISTANCE_Q / 2;
/// Trailing low time terminating every frame (1.5 us).
pub const PULSE_LOW_Q: u32 = 6;
/// Leading pulse total-time for a Session frame (12 us).
pub const SESSION_PULSE_Q: u32 = 48;
/// Leading pulse total-time for a Page frame (13.5 us).
pub const PAGE_PULSE_Q: u32 = 54;
/// Leading pulse total-time for a Calibration frame (18.75 us).
pub const CALIBRATION_PULSE_Q: u32 = 75;
/// Base (value-0) symbol total-time (4.5 us).
pub const SYMBOL_BASE_Q: u32 = 18;
/// Lower bound of the acceptance window for a data symbol (4.5 us - epsilon).
pub const SYMBOL_MIN_Q: u32 = SYMBOL_BASE_Q - EPSILON_Q;
/// Upper bound of the acceptance window for a data symbol (22.5 us + epsilon).
pub const SYMBOL_MAX_Q: u32 = 90 + EPSILON_Q;

/// Enter-PPM pulse widths, in microseconds, transmitted as one repeating unit.
pub const ENTER_PATTERN_WIDTHS_US: [u32; 4] = [30, 90, 45, 45];
/// Duration of one enter-pattern repetition, in microseconds.
pub const ENTER_PATTERN_PERIOD_US: u32 = 210;

/// Classification tag of a decoded or to-be-encoded frame. `Unknown` is never
/// produced by [`decode`] (an unrecognized leading pulse is a hard error
/// instead); it exists so callers can label a frame whose tag they merely
/// observed rather than decoded (e.g. for logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Session,
    Page,
    Calibration,
    EnterPattern,
    Unknown,
}

/// A single PPM frame, in its fully-parsed logical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Exactly 4 words: see `session::handle_session` for field meaning.
    Session { words: [u16; 4] },
    /// `data` carries the page's payload words (length == page_size); `seq`
    /// and `checksum` are carried in the wire header word, not in `data`.
    Page { seq: u8, checksum: u8, data: Vec<u16> },
    /// No payload.
    Calibration,
    /// Four pulse widths repeated until `total_us` has elapsed.
    EnterPattern { widths_us: [u32; 4], total_us: u32 },
}

impl Frame {
    pub fn tag(&self) -> FrameTag {
        match self {
            Frame::Session { .. } => FrameTag::Session,
            Frame::Page { .. } => FrameTag::Page,
            Frame::Calibration => FrameTag::Calibration,
            Frame::EnterPattern { .. } => FrameTag::EnterPattern,
        }
    }
}

/// Wire-level decode failure. Never surfaced past `line`: the offending frame
/// is dropped and the peer's retry (driven by the session engine's timeouts)
/// is relied on instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("leading pulse did not match Session or Page")]
    DecodeFraming,
    #[error("symbol total-time out of the acceptance window")]
    DecodeTiming,
}

/// A frame as decoded off the wire, before reinterpretation as `Frame`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub tag: FrameTag,
    pub words: Vec<u16>,
}

impl DecodedFrame {
    /// Reinterprets the decoded words as a `Frame`, or `None` if the word
    /// count doesn't match what that tag requires (a malformed capture).
    pub fn into_frame(self) -> Option<Frame> {
        match self.tag {
            FrameTag::Session => {
                if self.words.len() != 4 {
                    return None;
                }
                Some(Frame::Session {
                    words: [self.words[0], self.words[1], self.words[2], self.words[3]],
                })
            }
            FrameTag::Page => {
                let header = *self.words.first()?;
                Some(Frame::Page {
                    seq: (header >> 8) as u8,
                    checksum: (header & 0xFF) as u8,
                    data: self.words[1..].to_vec(),
                })
            }
            FrameTag::Calibration | FrameTag::EnterPattern | FrameTag::Unknown => None,
        }
    }
}

fn classify_leading(total_q: u32) -> Result<FrameTag, CodecError> {
    if total_q.abs_diff(SESSION_PULSE_Q) <= EPSILON_Q {
        Ok(FrameTag::Session)
    } else if total_q.abs_diff(PAGE_PULSE_Q) <= EPSILON_Q {
        Ok(FrameTag::Page)
    } else {
        Err(CodecError::DecodeFraming)
    }
}

/// Symbol value (0..=3) carried by a total-time, folding the acceptance
/// window's extra cycles down with `mod 4` as specified.
fn symbol_value(total_q: u32) -> u8 {
    let diff = total_q as i64 - SYMBOL_BASE_Q as i64;
    diff.div_euclid(BIT_DISTANCE_Q as i64).rem_euclid(4) as u8
}

fn symbol_total_q(value: u8) -> u32 {
    SYMBOL_BASE_Q + (value as u32) * BIT_DISTANCE_Q
}

/// Decodes a captured symbol sequence (leading pulse, data symbols, trailing
/// low) into a tagged frame of words.
pub fn decode(symbols: &[u32]) -> Result<DecodedFrame, CodecError> {
    if symbols.len() < 2 {
        return Err(CodecError::DecodeFraming);
    }
    let tag = classify_leading(symbols[0])?;
    let data_symbols = &symbols[1..symbols.len() - 1];

    let mut acc: u8 = 0;
    let mut acc_bits: u8 = 0;
    let mut bytes = Vec::with_capacity(data_symbols.len() / 4 + 1);
    for &sym in data_symbols {
        if sym < SYMBOL_MIN_Q || sym > SYMBOL_MAX_Q {
            return Err(CodecError::DecodeTiming);
        }
        let value = symbol_value(sym);
        acc = (acc << 2) | value;
        acc_bits += 2;
        if acc_bits == 8 {
            bytes.push(acc);
            acc = 0;
            acc_bits = 0;
        }
    }
    if acc_bits > 0 {
        acc <<= 8 - acc_bits;
        bytes.push(acc);
    }

    let words = bytes
        .chunks(2)
        .map(|chunk| {
            if chunk.len() == 2 {
                u16::from_be_bytes([chunk[0], chunk[1]])
            } else {
                (chunk[0] as u16) << 8
            }
        })
        .collect();

    Ok(DecodedFrame { tag, words })
}

fn encode_words(leading_q: u32, words: &[u16]) -> Vec<u32> {
    let mut symbols = Vec::with_capacity(1 + words.len() * 4 + 1);
    symbols.push(leading_q);
    for word in words {
        for byte in word.to_be_bytes() {
            for shift in [6, 4, 2, 0] {
                let value = (byte >> shift) & 0b11;
                symbols.push(symbol_total_q(value));
            }
        }
    }
    symbols.push(PULSE_LOW_Q);
    symbols
}

/// Emits the repeated four-width enter-PPM pattern for at least `total_us`.
pub fn enter_pattern_symbols(widths_us: [u32; 4], total_us: u32) -> Vec<u32> {
    let period: u32 = widths_us.iter().sum();
    let repeats = total_us.div_ceil(period.max(1)).max(1);
    let mut out = Vec::with_capacity(4 * repeats as usize);
    for _ in 0..repeats {
        out.extend_from_slice(&widths_us);
    }
    out
}

/// Inverse of [`decode`] for `Session`/`Page`/`Calibration` frames, and the
/// enter-pattern generator for `EnterPattern`.
pub fn encode(frame: &Frame) -> Vec<u32> {
    match frame {
        Frame::Session { words } => encode_words(SESSION_PULSE_Q, words),
        Frame::Page { seq, checksum, data } => {
            let header = ((*seq as u16) << 8) | (*checksum as u16);
            let mut words = Vec::with_capacity(1 + data.len());
            words.push(header);
            words.extend_from_slice(data);
            encode_words(PAGE_PULSE_Q, &words)
        }
        Frame::Calibration => vec![CALIBRATION_PULSE_Q, PULSE_LOW_Q],
        Frame::EnterPattern { widths_us, total_us } => {
            enter_pattern_symbols(*widths_us, *total_us)
        }
    }
}

/// Derived receive/generate timing for a requested average bitrate, per the
/// symbol mean (6.75 us) and the 1-22.5 us acceptance window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTiming {
    pub resolution_hz: u32,
    pub rx_min_ns: u32,
    pub rx_max_ns: u32,
}

pub fn bitrate_timing(bitrate_bps: u32) -> Result<LineTiming, Error> {
    if bitrate_bps == 0 {
        return Err(Error::InvalidArg("bitrate must be nonzero".into()));
    }
    let b = bitrate_bps as f64;
    let resolution_hz = (b * 27.0 / 2.0).round() as u32;
    let rx_min_ns = (8.0e9 / (27.0 * b)).round() as u32;
    let rx_max_ns = (20.0e9 / (3.0 * b)).round() as u32;
    Ok(LineTiming {
        resolution_hz,
        rx_min_ns,
        rx_max_ns,
    })
}
