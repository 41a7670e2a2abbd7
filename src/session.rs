//! Session engine: the session-frame + N·page-frame + acks protocol, with
//! per-page retries and per-session timeouts.

use crate::crc::{self, CrcVariant};
use crate::codec::{Frame, FrameTag};
use crate::error::{Error, ErrorCode};
use crate::line::{LineDriver, PlatformLine};
use std::thread;
use std::time::Duration;

/// The fixed 7-bit session ids used by the entry points below.
pub mod session_id {
    pub const UNLOCK: u8 = 0x44;
    pub const PROG_KEYS: u8 = 0x03;
    pub const FLASH_PROG: u8 = 0x04;
    pub const EEPROM_PROG: u8 = 0x06;
    pub const FLASH_CS_PROG: u8 = 0x07;
    pub const FLASH_CRC: u8 = 0x43;
    pub const EEPROM_CRC: u8 = 0x47;
    pub const FLASH_CS_CRC: u8 = 0x48;
    pub const CHIP_RESET: u8 = 0x45;
}

/// Fixed seed the target expects for the generic 16-bit checksum used by
/// several session payloads.
pub const CRC16_SEED: u16 = 0x1D0F;

/// Immutable per-invocation parameterization of one session.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub session_id: u8,
    pub page_size_words: u8,
    pub page0_ack_timeout_ms: u32,
    pub page_x_ack_timeout_ms: u32,
    pub session_ack_timeout_ms: u32,
    pub page_retry: u32,
    pub request_ack: bool,
    pub crc_variant: Option<CrcVariant>,
}

/// Result of running one session to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Transmit failure, page-retry exhaustion, or session-ack mismatch/timeout.
    Failed,
    /// `request_ack` was false: the fixed delay elapsed and success is assumed.
    BroadcastOk,
    /// The slave's session-ack frame, fully validated against session id,
    /// page size and page count.
    Acked([u16; 4]),
}

fn wait_ms(ms: u32) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Slices the `seq`-th page of exactly `page_size` words out of `payload`,
/// zero-padding the tail if the payload runs short.
fn page_slice(payload: &[u16], seq: usize, page_size: usize) -> Vec<u16> {
    let start = seq * page_size;
    let mut page = vec![0u16; page_size];
    for (i, slot) in page.iter_mut().enumerate() {
        if let Some(&word) = payload.get(start + i) {
            *slot = word;
        }
    }
    page
}

/// Runs one full session: session frame, per-page transmit/ack/retry, and
/// the session ack.
pub fn handle_session<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    desc: &SessionDescriptor,
    offset: u16,
    checksum: u16,
    payload: &[u16],
) -> SessionOutcome {
    let page_size = desc.page_size_words as usize;
    let page_count = if page_size == 0 {
        0
    } else {
        payload.len().div_ceil(page_size)
    };

    let ack_bit: u16 = if desc.request_ack { 0x80 } else { 0 };
    let word0 = ((desc.session_id as u16 | ack_bit) << 8) | desc.page_size_words as u16;
    let session_frame = Frame::Session {
        words: [word0, page_count as u16, offset, checksum],
    };
    if driver.send_frame(&session_frame).is_err() {
        return SessionOutcome::Failed;
    }

    for seq in 0..page_count {
        let page_words = page_slice(payload, seq, page_size);
        let page_csum = crc::page_checksum(&page_words);
        let timeout_ms = if seq == 0 {
            desc.page0_ack_timeout_ms
        } else {
            desc.page_x_ack_timeout_ms
        };
        let mut acked = false;
        for _attempt in 0..desc.page_retry.max(1) {
            let frame = Frame::Page {
                seq: (seq & 0xFF) as u8,
                checksum: page_csum,
                data: page_words.clone(),
            };
            if driver.send_frame(&frame).is_err() {
                return SessionOutcome::Failed;
            }
            if !desc.request_ack {
                wait_ms(timeout_ms);
                acked = true;
                break;
            }
            let expected = ((seq as u16 & 0xFF) << 8) | page_csum as u16;
            match driver.recv_frame_tagged(timeout_ms.saturating_mul(1000), &[FrameTag::Page]) {
                Ok(Some(Frame::Page {
                    seq: rseq,
                    checksum: rcsum,
                    ..
                })) => {
                    let got = ((rseq as u16) << 8) | rcsum as u16;
                    if got == expected {
                        acked = true;
                        break;
                    }
                }
                _ => {}
            }
        }
        if !acked {
            return SessionOutcome::Failed;
        }
    }

    if !desc.request_ack {
        wait_ms(desc.session_ack_timeout_ms);
        return SessionOutcome::BroadcastOk;
    }

    match driver.recv_frame_tagged(
        desc.session_ack_timeout_ms.saturating_mul(1000),
        &[FrameTag::Session],
    ) {
        Ok(Some(Frame::Session { mut words })) => {
            if desc.session_id == session_id::UNLOCK {
                words[0] = words[0].wrapping_sub(1);
            }
            let expected0 = ((desc.session_id as u16) << 8) | desc.page_size_words as u16;
            if words[0] == expected0 && words[1] == page_count as u16 {
                SessionOutcome::Acked(words)
            } else {
                SessionOutcome::Failed
            }
        }
        _ => SessionOutcome::Failed,
    }
}

fn bytes_to_be_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|chunk| {
            if chunk.len() == 2 {
                u16::from_be_bytes([chunk[0], chunk[1]])
            } else {
                (chunk[0] as u16) << 8
            }
        })
        .collect()
}

/// Reinterprets `bytes` as LSB-first words, the byte order the EEPROM
/// payload is specified in (distinct from the big-endian words everywhere
/// else on the wire).
fn bytes_to_le_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|chunk| {
            if chunk.len() == 2 {
                u16::from_le_bytes([chunk[0], chunk[1]])
            } else {
                chunk[0] as u16
            }
        })
        .collect()
}

/// `unlock(desc) -> project_id`: offset/checksum are the fixed handshake
/// constants; project id comes back in the ack's word 3.
pub fn unlock<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    request_ack: bool,
    session_ack_timeout_ms: u32,
    page_retry: u32,
) -> Result<u16, Error> {
    let desc = SessionDescriptor {
        session_id: session_id::UNLOCK,
        page_size_words: 0,
        page0_ack_timeout_ms: 0,
        page_x_ack_timeout_ms: 0,
        session_ack_timeout_ms,
        page_retry,
        request_ack,
        crc_variant: None,
    };
    match handle_session(driver, &desc, 0x8374, 0xBF12, &[]) {
        SessionOutcome::Acked(words) => Ok(words[3]),
        _ => Err(Error::Code(ErrorCode::Unlock)),
    }
}

/// `prog_keys(desc, keys)`: validates the ack echoes the handshake constant
/// in both words 2 and 3.
pub fn prog_keys<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    request_ack: bool,
    timeouts: SessionTimeouts,
    keys: &[u8],
) -> Result<(), Error> {
    let desc = SessionDescriptor {
        session_id: session_id::PROG_KEYS,
        page_size_words: 8,
        page0_ack_timeout_ms: timeouts.page0,
        page_x_ack_timeout_ms: timeouts.page_x,
        session_ack_timeout_ms: timeouts.session,
        page_retry: 1,
        request_ack,
        crc_variant: None,
    };
    let words = bytes_to_be_words(keys);
    match handle_session(driver, &desc, 0xBEBE, 0xBEBE, &words) {
        SessionOutcome::BroadcastOk => Ok(()),
        SessionOutcome::Acked(words) if words[2] == 0xBEBE && words[3] == 0xBEBE => Ok(()),
        _ => Err(Error::Code(ErrorCode::Unlock)),
    }
}

/// Per-session timeout triple, shaped by the orchestrator from per-memory
/// erase/write timings (see `orchestrator::flash_timeouts` and friends) for
/// programming sessions, or left at the table defaults otherwise.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub page0: u32,
    pub page_x: u32,
    pub session: u32,
}

impl SessionTimeouts {
    pub const fn fixed(page0: u32, page_x: u32, session: u32) -> Self {
        Self {
            page0,
            page_x,
            session,
        }
    }
}

/// `flash_program(desc, words)`: builds the page payload and validates the
/// ack echoes the caller's offset/checksum in words 2 and 3.
#[allow(clippy::too_many_arguments)]
pub fn flash_program<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    request_ack: bool,
    timeouts: SessionTimeouts,
    retry: u32,
    crc_variant: CrcVariant,
    offset: u16,
    checksum: u16,
    words: &[u16],
) -> Result<(), Error> {
    let desc = SessionDescriptor {
        session_id: session_id::FLASH_PROG,
        page_size_words: 64,
        page0_ack_timeout_ms: timeouts.page0,
        page_x_ack_timeout_ms: timeouts.page_x,
        session_ack_timeout_ms: timeouts.session,
        page_retry: retry,
        request_ack,
        crc_variant: Some(crc_variant),
    };
    match handle_session(driver, &desc, offset, checksum, words) {
        SessionOutcome::BroadcastOk => Ok(()),
        SessionOutcome::Acked(reply) if reply[2] == offset && reply[3] == checksum => Ok(()),
        _ => Err(Error::Code(ErrorCode::ProgrammingFailed)),
    }
}

/// `eeprom_program(desc, page_offset, bytes)`: payload words are
/// reinterpreted from `bytes` LSB-first.
pub fn eeprom_program<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    request_ack: bool,
    timeouts: SessionTimeouts,
    retry: u32,
    page_offset: u16,
    bytes: &[u8],
) -> Result<(), Error> {
    let desc = SessionDescriptor {
        session_id: session_id::EEPROM_PROG,
        page_size_words: 4,
        page0_ack_timeout_ms: timeouts.page0,
        page_x_ack_timeout_ms: timeouts.page_x,
        session_ack_timeout_ms: timeouts.session,
        page_retry: retry,
        request_ack,
        crc_variant: None,
    };
    let words = bytes_to_le_words(bytes);
    let checksum = crc::crc16(bytes, CRC16_SEED);
    match handle_session(driver, &desc, page_offset, checksum, &words) {
        SessionOutcome::BroadcastOk | SessionOutcome::Acked(_) => Ok(()),
        SessionOutcome::Failed => Err(Error::Code(ErrorCode::ProgrammingFailed)),
    }
}

/// `flash_cs_program(desc, bytes)`: offset is always 0; the ack must echo
/// word 2 == 0 and word 3 == the 16-bit checksum.
pub fn flash_cs_program<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    request_ack: bool,
    timeouts: SessionTimeouts,
    retry: u32,
    bytes: &[u8],
) -> Result<(), Error> {
    let desc = SessionDescriptor {
        session_id: session_id::FLASH_CS_PROG,
        page_size_words: 64,
        page0_ack_timeout_ms: timeouts.page0,
        page_x_ack_timeout_ms: timeouts.page_x,
        session_ack_timeout_ms: timeouts.session,
        page_retry: retry,
        request_ack,
        crc_variant: None,
    };
    let words = bytes_to_be_words(bytes);
    let checksum = crc::crc16(bytes, CRC16_SEED);
    match handle_session(driver, &desc, 0, checksum, &words) {
        SessionOutcome::BroadcastOk => Ok(()),
        SessionOutcome::Acked(reply) if reply[2] == 0 && reply[3] == checksum => Ok(()),
        _ => Err(Error::Code(ErrorCode::ProgrammingFailed)),
    }
}

/// `flash_crc(desc, byte_len) -> 24-bit crc`: no page payload is sent; the
/// session frame's offset and checksum fields are both 0 (the chip CRCs its
/// own known flash length, not a length we hand it). `byte_len` is kept in
/// the signature for symmetry with `eeprom_crc`/`flash_cs_crc`; it plays no
/// role in this session's wire fields.
pub fn flash_crc<P: PlatformLine>(driver: &mut LineDriver<P>, _byte_len: u32) -> Result<u32, Error> {
    let desc = SessionDescriptor {
        session_id: session_id::FLASH_CRC,
        page_size_words: 0,
        page0_ack_timeout_ms: 0,
        page_x_ack_timeout_ms: 0,
        session_ack_timeout_ms: 5,
        page_retry: 5,
        request_ack: true,
        crc_variant: None,
    };
    match handle_session(driver, &desc, 0, 0, &[]) {
        SessionOutcome::Acked(reply) => {
            Ok((((reply[2] & 0xFF) as u32) << 16) | reply[3] as u32)
        }
        _ => Err(Error::Code(ErrorCode::VerifyFailed)),
    }
}

/// `eeprom_crc(desc, page_offset, byte_len) -> 16-bit crc`.
pub fn eeprom_crc<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    page_offset: u16,
    byte_len: u32,
) -> Result<u16, Error> {
    let desc = SessionDescriptor {
        session_id: session_id::EEPROM_CRC,
        page_size_words: 0,
        page0_ack_timeout_ms: 0,
        page_x_ack_timeout_ms: 0,
        session_ack_timeout_ms: 5,
        page_retry: 5,
        request_ack: true,
        crc_variant: None,
    };
    let word_len = byte_len.div_ceil(2) as u16;
    match handle_session(driver, &desc, page_offset, word_len, &[]) {
        SessionOutcome::Acked(reply) => Ok(reply[3]),
        _ => Err(Error::Code(ErrorCode::VerifyFailed)),
    }
}

/// `flash_cs_crc(desc, byte_len) -> 16-bit crc`: same shape as `eeprom_crc`
/// with a fixed offset of 0.
pub fn flash_cs_crc<P: PlatformLine>(driver: &mut LineDriver<P>, byte_len: u32) -> Result<u16, Error> {
    let desc = SessionDescriptor {
        session_id: session_id::FLASH_CS_CRC,
        page_size_words: 0,
        page0_ack_timeout_ms: 0,
        page_x_ack_timeout_ms: 0,
        session_ack_timeout_ms: 5,
        page_retry: 5,
        request_ack: true,
        crc_variant: None,
    };
    let word_len = byte_len.div_ceil(2) as u16;
    match handle_session(driver, &desc, 0, word_len, &[]) {
        SessionOutcome::Acked(reply) => Ok(reply[3]),
        _ => Err(Error::Code(ErrorCode::VerifyFailed)),
    }
}

/// `chip_reset(desc) -> project_id`: zero payload, always ack-requested (the
/// orchestrator needs the identification even when the rest of the run was
/// broadcast).
pub fn chip_reset<P: PlatformLine>(driver: &mut LineDriver<P>) -> Result<u16, Error> {
    let desc = SessionDescriptor {
        session_id: session_id::CHIP_RESET,
        page_size_words: 0,
        page0_ack_timeout_ms: 0,
        page_x_ack_timeout_ms: 0,
        session_ack_timeout_ms: 10,
        page_retry: 5,
        request_ack: true,
        crc_variant: None,
    };
    match handle_session(driver, &desc, 0, 0, &[]) {
        SessionOutcome::Acked(words) => Ok(words[3]),
        _ => Err(Error::Code(ErrorCode::Internal)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::line::LineError;
    use std::collections::VecDeque;

    struct ScriptedLine {
        inbox: VecDeque<Vec<u32>>,
        sent_pages: Vec<(u8, u8)>,
    }

    impl ScriptedLine {
        fn new() -> Self {
            Self {
                inbox: VecDeque::new(),
                sent_pages: Vec::new(),
            }
        }
    }

    impl PlatformLine for ScriptedLine {
        fn configure(&mut self, _timing: crate::codec::LineTiming) -> Result<(), LineError> {
            Ok(())
        }

        fn transmit_blocking(&mut self, symbols: &[u32]) -> Result<(), LineError> {
            if let Ok(decoded) = codec::decode(symbols) {
                if let Some(Frame::Page { seq, checksum, .. }) = decoded.into_frame() {
                    self.sent_pages.push((seq, checksum));
                }
            }
            Ok(())
        }

        fn receive_blocking(&mut self, _timeout_us: u32) -> Result<Option<Vec<u32>>, LineError> {
            Ok(self.inbox.pop_front())
        }
    }

    #[test]
    fn unlock_round_trip_returns_project_id() {
        let mut driver = LineDriver::new(ScriptedLine::new());
        let reply = Frame::Session {
            words: [((session_id::UNLOCK as u16) << 8) + 1, 0, 0, 0x4D32],
        };
        driver.platform_mut().inbox.push_back(codec::encode(&reply));
        let project_id = unlock(&mut driver, true, 10, 5).unwrap();
        assert_eq!(project_id, 0x4D32);
    }

    #[test]
    fn page_retry_succeeds_on_second_attempt() {
        let mut driver = LineDriver::new(ScriptedLine::new());
        let data: Vec<u16> = (0..64).collect();
        let good_csum = crc::page_checksum(&data);

        let wrong_ack = Frame::Page {
            seq: 0,
            checksum: good_csum.wrapping_add(1),
            data: vec![],
        };
        let good_ack = Frame::Page {
            seq: 0,
            checksum: good_csum,
            data: vec![],
        };
        driver.platform_mut().inbox.push_back(codec::encode(&wrong_ack));
        driver.platform_mut().inbox.push_back(codec::encode(&good_ack));
        let session_ack = Frame::Session {
            words: [((session_id::FLASH_PROG as u16) << 8) | 64, 1, 0, 0],
        };
        driver.platform_mut().inbox.push_back(codec::encode(&session_ack));

        let timeouts = SessionTimeouts::fixed(100, 10, 10);
        let result = flash_program(
            &mut driver,
            true,
            timeouts,
            5,
            CrcVariant::VariantA,
            0,
            0,
            &data,
        );
        assert!(result.is_ok());
        assert_eq!(driver.platform_mut().sent_pages.len(), 2);
    }

    #[test]
    fn page_retry_exhaustion_fails_after_all_attempts() {
        let mut driver = LineDriver::new(ScriptedLine::new());
        let data: Vec<u16> = (0..64).collect();
        let good_csum = crc::page_checksum(&data);
        for _ in 0..5 {
            let wrong_ack = Frame::Page {
                seq: 0,
                checksum: good_csum.wrapping_add(1),
                data: vec![],
            };
            driver.platform_mut().inbox.push_back(codec::encode(&wrong_ack));
        }

        let timeouts = SessionTimeouts::fixed(1, 1, 1);
        let result = flash_program(
            &mut driver,
            true,
            timeouts,
            5,
            CrcVariant::VariantA,
            0,
            0,
            &data,
        );
        assert!(result.is_err());
        assert_eq!(driver.platform_mut().sent_pages.len(), 5);
    }

    #[test]
    fn broadcast_session_never_fails_on_silence() {
        let mut driver = LineDriver::new(ScriptedLine::new());
        let result = prog_keys(&mut driver, false, SessionTimeouts::fixed(1, 1, 1), &[0u8; 16]);
        assert!(result.is_ok());
    }
}
