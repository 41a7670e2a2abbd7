//! Bootloader orchestrator: enters programming mode, identifies the chip,
//! and drives the per-memory programming and verification sequences,
//! assembling data from the HEX container and comparing CRCs.

use crate::chip::{self, ChipDescriptor, MemoryDescriptor};
use crate::crc;
use crate::error::{Error, ErrorCode};
use crate::hex::HexImage;
use crate::line::{LineDriver, PlatformLine};
use crate::session::{self, SessionTimeouts};
use std::thread;
use std::time::Duration;

/// The three memory regions `do_action` can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memory {
    Flash,
    FlashCs,
    Nvram,
}

/// The two actions `do_action` can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Program,
    Verify,
}

/// Host-side power control for the target, invoked around the enter-PPM
/// sequence when the host (rather than the user) cycles power.
pub trait PowerControl {
    fn is_powered(&self) -> bool;
    fn power_down_for(&mut self, ms: u32) -> Result<(), Error>;
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

/// Entry point: enters PPM mode, identifies the chip, runs the requested
/// program/verify action, always attempts a chip reset once a session
/// channel is established, and always powers down at the end when power is
/// host-controlled. Returns the stable numeric result code.
#[allow(clippy::too_many_arguments)]
pub fn do_action<P: PlatformLine, C: PowerControl>(
    driver: &mut LineDriver<P>,
    power: &mut C,
    manual_power: bool,
    broadcast: bool,
    bitrate_bps: u32,
    memory: Memory,
    action: Action,
    hex: &HexImage,
) -> ErrorCode {
    match do_action_inner(driver, power, manual_power, broadcast, bitrate_bps, memory, action, hex) {
        Ok(()) => ErrorCode::Ok,
        Err(e) => e.code(),
    }
}

#[allow(clippy::too_many_arguments)]
fn do_action_inner<P: PlatformLine, C: PowerControl>(
    driver: &mut LineDriver<P>,
    power: &mut C,
    manual_power: bool,
    broadcast: bool,
    bitrate_bps: u32,
    memory: Memory,
    action: Action,
    hex: &HexImage,
) -> Result<(), Error> {
    let mut session_established = false;

    let outcome = (|| -> Result<(), Error> {
        let project_id = enter_ppm_mode(driver, power, manual_power, bitrate_bps)?;
        session_established = true;
        let chip = chip::lookup(project_id).ok_or(Error::Code(ErrorCode::ChipNotSupported))?;
        program_or_verify(driver, &chip, memory, action, !broadcast, hex)
    })();

    if session_established {
        let _ = session::chip_reset(driver);
    }
    if !manual_power {
        let _ = power.power_down_for(100);
    }

    outcome
}

fn enter_ppm_mode<P: PlatformLine, C: PowerControl>(
    driver: &mut LineDriver<P>,
    power: &mut C,
    manual_power: bool,
    bitrate_bps: u32,
) -> Result<u16, Error> {
    let pattern_us = if manual_power { 100_000 } else { 50_000 };
    if !manual_power && power.is_powered() {
        power
            .power_down_for(100)
            .map_err(|_| Error::Code(ErrorCode::EnterPpm))?;
    }
    driver
        .emit_enter_pattern(pattern_us)
        .map_err(|_| Error::Code(ErrorCode::EnterPpm))?;
    thread::sleep(Duration::from_millis(5));
    driver
        .configure(bitrate_bps)
        .map_err(|_| Error::Code(ErrorCode::SetBaud))?;
    driver
        .emit_calibration()
        .map_err(|_| Error::Code(ErrorCode::Calibration))?;
    // Unlock always identifies the chip, even in a broadcast-programming run.
    session::unlock(driver, true, 10, 5)
}

fn program_or_verify<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    chip: &ChipDescriptor,
    memory: Memory,
    action: Action,
    request_ack: bool,
    hex: &HexImage,
) -> Result<(), Error> {
    match (memory, action) {
        (Memory::Flash, Action::Program) => program_flash(driver, chip, request_ack, hex),
        (Memory::Flash, Action::Verify) => verify_flash(driver, chip, hex),
        (Memory::FlashCs, Action::Program) => program_flash_cs(driver, chip, request_ack, hex),
        (Memory::FlashCs, Action::Verify) => verify_flash_cs(driver, chip, hex),
        (Memory::Nvram, Action::Program) => program_eeprom(driver, chip, request_ack, hex),
        (Memory::Nvram, Action::Verify) => verify_eeprom(driver, chip, hex),
    }
}

fn coverage_or_missing(hex: &HexImage, region_start: u32, region_end: u32) -> Result<(), Error> {
    match (hex.min_address(), hex.max_address()) {
        (Some(min), Some(max)) if max >= region_start && min <= region_end => Ok(()),
        _ => Err(Error::Code(ErrorCode::MissingData)),
    }
}

fn maybe_prog_keys<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    chip: &ChipDescriptor,
    request_ack: bool,
) -> Result<(), Error> {
    if let Some(keys) = &chip.programming_keys {
        session::prog_keys(driver, request_ack, SessionTimeouts::fixed(25, 10, 10), keys)?;
    }
    Ok(())
}

/// Reorders `words` so the first `page_size_words` words move to the tail:
/// the session engine's ordinary sequential paging then transmits the
/// original page 1..N first and page 0 last.
fn reorder_wrap_first_page_last(words: &[u16], page_size_words: usize) -> Vec<u16> {
    if page_size_words == 0 || words.len() <= page_size_words {
        return words.to_vec();
    }
    let mut out = Vec::with_capacity(words.len());
    out.extend_from_slice(&words[page_size_words..]);
    out.extend_from_slice(&words[..page_size_words]);
    out
}

fn flash_timeouts(mem: &MemoryDescriptor, mem_len: u32) -> SessionTimeouts {
    let page0 = ((mem_len as f64 / mem.erase_unit_bytes as f64) * mem.erase_time_ms as f64 * 1.25).ceil() as u32;
    let page_x = (mem.write_time_ms as f64 * 1.25).ceil() as u32;
    let session = page_x + (mem_len as f64 * 6.25e-5).ceil() as u32;
    SessionTimeouts::fixed(page0, page_x, session)
}

fn flash_cs_timeouts(mem: &MemoryDescriptor, mem_len: u32) -> SessionTimeouts {
    let page0 = ((mem_len as f64 / mem.page_size_bytes as f64) * mem.erase_time_ms as f64 * 1.25).ceil() as u32;
    let page_x = (mem.write_time_ms as f64 * 1.25).ceil() as u32;
    let session = page_x + (mem_len as f64 * 6.25e-5).ceil() as u32;
    SessionTimeouts::fixed(page0, page_x, session)
}

fn eeprom_timeouts(mem: &MemoryDescriptor) -> SessionTimeouts {
    let t = (mem.write_time_ms as f64 * 1.25).ceil() as u32;
    SessionTimeouts::fixed(t, t, t)
}

fn program_flash<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    chip: &ChipDescriptor,
    request_ack: bool,
    hex: &HexImage,
) -> Result<(), Error> {
    let mem = chip.flash.ok_or(Error::Code(ErrorCode::ActionNotSupported))?;
    maybe_prog_keys(driver, chip, request_ack)?;
    let region_end = mem.start_address + mem.length - 1;
    coverage_or_missing(hex, mem.start_address, region_end)?;

    let mut buffer = vec![0u8; mem.length as usize];
    hex.fill(mem.start_address, &mut buffer);
    let words = bytes_to_be_words(&buffer);

    let crc_value = crc::flash_crc(chip.flash_crc_variant, &words, chip.flash_crc_init);
    let offset = ((crc_value >> 16) & 0xFF) as u16;
    let checksum = (crc_value & 0xFFFF) as u16;

    let page_size_words = (mem.page_size_bytes / 2) as usize;
    let reordered = reorder_wrap_first_page_last(&words, page_size_words);
    let timeouts = flash_timeouts(&mem, mem.length);

    session::flash_program(
        driver,
        request_ack,
        timeouts,
        5,
        chip.flash_crc_variant,
        offset,
        checksum,
        &reordered,
    )
}

fn verify_flash<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    chip: &ChipDescriptor,
    hex: &HexImage,
) -> Result<(), Error> {
    let mem = chip.flash.ok_or(Error::Code(ErrorCode::ActionNotSupported))?;
    let region_end = mem.start_address + mem.length - 1;
    coverage_or_missing(hex, mem.start_address, region_end)?;

    let mut buffer = vec![0u8; mem.length as usize];
    hex.fill(mem.start_address, &mut buffer);
    let words = bytes_to_be_words(&buffer);
    let expected = crc::flash_crc(chip.flash_crc_variant, &words, chip.flash_crc_init);

    let actual = session::flash_crc(driver, buffer.len() as u32)?;
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Code(ErrorCode::VerifyFailed))
    }
}

fn flash_cs_program_range(chip: &ChipDescriptor, hex: &HexImage) -> Result<(MemoryDescriptor, Vec<u8>), Error> {
    if !chip.supports_flash_cs {
        return Err(Error::Code(ErrorCode::ActionNotSupported));
    }
    let mem = chip.flash_cs.ok_or(Error::Code(ErrorCode::ActionNotSupported))?;
    let region_end = mem.start_address + mem.writeable_length - 1;
    coverage_or_missing(hex, mem.start_address, region_end)?;

    let max = hex.max_address().expect("checked by coverage_or_missing");
    let raw_len = max.saturating_sub(mem.start_address) + 1;
    let rounded = raw_len.div_ceil(mem.page_size_bytes) * mem.page_size_bytes;
    let length = rounded.min(mem.writeable_length);

    let mut buffer = vec![0u8; length as usize];
    hex.fill(mem.start_address, &mut buffer);
    Ok((mem, buffer))
}

fn program_flash_cs<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    chip: &ChipDescriptor,
    request_ack: bool,
    hex: &HexImage,
) -> Result<(), Error> {
    maybe_prog_keys(driver, chip, request_ack)?;
    let (mem, buffer) = flash_cs_program_range(chip, hex)?;
    let timeouts = flash_cs_timeouts(&mem, buffer.len() as u32);
    session::flash_cs_program(driver, request_ack, timeouts, 5, &buffer)
}

fn verify_flash_cs<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    chip: &ChipDescriptor,
    hex: &HexImage,
) -> Result<(), Error> {
    let (_mem, buffer) = flash_cs_program_range(chip, hex)?;
    let expected = crc::crc16(&buffer, session::CRC16_SEED);
    let actual = session::flash_cs_crc(driver, buffer.len() as u32)?;
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Code(ErrorCode::VerifyFailed))
    }
}

/// Scans `mem` in page-sized strides, returning each contiguous run of
/// HEX-covered pages as `(byte_offset_from_mem_start, run_length_bytes)`.
fn scan_eeprom_runs(hex: &HexImage, mem: &MemoryDescriptor) -> Vec<(u32, u32)> {
    let page = mem.page_size_bytes.max(1);
    let page_count = mem.writeable_length.div_ceil(page);
    let mut runs = Vec::new();
    let mut run_start: Option<u32> = None;

    for p in 0..page_count {
        let page_addr = mem.start_address + p * page;
        let has_data = hex.count_bytes_in_range(page_addr, page) > 0;
        if has_data {
            run_start.get_or_insert(p * page);
        } else if let Some(start) = run_start.take() {
            runs.push((start, p * page - start));
        }
    }
    if let Some(start) = run_start {
        runs.push((start, page_count * page - start));
    }
    runs
}

fn eeprom_page_offset(run_start_bytes: u32) -> u16 {
    (run_start_bytes / (chip::EEPROM_PAGE_WORDS * 2)) as u16
}

fn program_eeprom<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    chip: &ChipDescriptor,
    request_ack: bool,
    hex: &HexImage,
) -> Result<(), Error> {
    let mem = chip.nvram.ok_or(Error::Code(ErrorCode::ActionNotSupported))?;
    let region_end = mem.start_address + mem.writeable_length - 1;
    coverage_or_missing(hex, mem.start_address, region_end)?;

    maybe_prog_keys(driver, chip, request_ack)?;

    let runs = scan_eeprom_runs(hex, &mem);
    if runs.is_empty() {
        return Err(Error::Code(ErrorCode::MissingData));
    }
    let timeouts = eeprom_timeouts(&mem);
    for (start, len) in runs {
        let mut buffer = vec![0u8; len as usize];
        hex.fill(mem.start_address + start, &mut buffer);
        let page_offset = eeprom_page_offset(start);
        session::eeprom_program(driver, request_ack, timeouts, 5, page_offset, &buffer)?;
    }
    Ok(())
}

fn verify_eeprom<P: PlatformLine>(
    driver: &mut LineDriver<P>,
    chip: &ChipDescriptor,
    hex: &HexImage,
) -> Result<(), Error> {
    if !chip.supports_eeprom_verify {
        return Err(Error::Code(ErrorCode::ActionNotSupported));
    }
    let mem = chip.nvram.ok_or(Error::Code(ErrorCode::ActionNotSupported))?;
    let region_end = mem.start_address + mem.writeable_length - 1;
    coverage_or_missing(hex, mem.start_address, region_end)?;

    let runs = scan_eeprom_runs(hex, &mem);
    if runs.is_empty() {
        return Err(Error::Code(ErrorCode::MissingData));
    }
    for (start, len) in runs {
        let mut buffer = vec![0u8; len as usize];
        hex.fill(mem.start_address + start, &mut buffer);
        let expected = crc::crc16(&buffer, session::CRC16_SEED);
        let page_offset = eeprom_page_offset(start);
        let actual = session::eeprom_crc(driver, page_offset, buffer.len() as u32)?;
        if actual != expected {
            return Err(Error::Code(ErrorCode::VerifyFailed));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, Frame, LineTiming};
    use crate::line::LineError;
    use std::collections::VecDeque;

    struct AlwaysPowered;
    impl PowerControl for AlwaysPowered {
        fn is_powered(&self) -> bool {
            true
        }
        fn power_down_for(&mut self, _ms: u32) -> Result<(), Error> {
            Ok(())
        }
    }

    struct ScriptedLine {
        inbox: VecDeque<Vec<u32>>,
    }

    impl ScriptedLine {
        fn new() -> Self {
            Self {
                inbox: VecDeque::new(),
            }
        }
    }

    impl PlatformLine for ScriptedLine {
        fn configure(&mut self, _timing: LineTiming) -> Result<(), LineError> {
            Ok(())
        }
        fn transmit_blocking(&mut self, _symbols: &[u32]) -> Result<(), LineError> {
            Ok(())
        }
        fn receive_blocking(&mut self, _timeout_us: u32) -> Result<Option<Vec<u32>>, LineError> {
            Ok(self.inbox.pop_front())
        }
    }

    fn push_session_ack(driver: &mut LineDriver<ScriptedLine>, id: u8, page_size: u16, page_count: u16, w2: u16, w3: u16) {
        let frame = Frame::Session {
            words: [((id as u16) << 8) | page_size, page_count, w2, w3],
        };
        driver.platform_mut().inbox.push_back(codec::encode(&frame));
    }

    #[test]
    fn unknown_project_id_yields_chip_not_supported_and_still_resets() {
        let mut driver = LineDriver::new(ScriptedLine::new());
        // Unlock ack: word0 is decremented by 1 per erratum before
        // validation, so the wire value must carry the expected value plus 1.
        let mut unlock_words = [(session::session_id::UNLOCK as u16) << 8, 0, 0, 0xFFFF];
        unlock_words[0] = unlock_words[0].wrapping_add(1);
        driver
            .platform_mut()
            .inbox
            .push_back(codec::encode(&Frame::Session { words: unlock_words }));
        // chip reset ack, issued even though chip lookup fails
        push_session_ack(&mut driver, session::session_id::CHIP_RESET, 0, 0, 0, 0xFFFF);

        let mut power = AlwaysPowered;
        let hex = HexImage::parse(":00000001FF\n").unwrap();
        let code = do_action(
            &mut driver,
            &mut power,
            false,
            false,
            115_200,
            Memory::Flash,
            Action::Program,
            &hex,
        );
        assert_eq!(code, ErrorCode::ChipNotSupported);
    }

    #[test]
    fn reorder_wraps_first_page_to_tail() {
        let words: Vec<u16> = (0..10).collect();
        let reordered = reorder_wrap_first_page_last(&words, 4);
        assert_eq!(reordered, vec![4, 5, 6, 7, 8, 9, 0, 1, 2, 3]);
    }

    #[test]
    fn scan_eeprom_runs_finds_two_sparse_pages() {
        // page size 8 bytes; data at [0..8) and [24..32)
        let mem = MemoryDescriptor {
            start_address: 0,
            length: 64,
            writeable_length: 64,
            page_size_bytes: 8,
            erase_unit_bytes: 8,
            erase_time_ms: 5,
            write_time_ms: 5,
        };
        let source = ":08000000000000000000000000E3\n:0800180000000000000000000013\n:00000001FF\n";
        let hex = HexImage::parse(source).unwrap();
        let runs = scan_eeprom_runs(&hex, &mem);
        assert_eq!(runs, vec![(0, 8), (24, 8)]);
        assert_eq!(eeprom_page_offset(0), 0);
        assert_eq!(eeprom_page_offset(24), 3);
    }
}
