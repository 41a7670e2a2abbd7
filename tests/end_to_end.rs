//! End-to-end protocol scenarios driving `orchestrator::do_action` against a
//! simulated chip that speaks the PPM wire protocol back, the way
//! `test_elf2bin.rs`/`test_image_fuse.rs` drive this family's conversion
//! entry points against fixture data.

use ppm_boot::chip;
use ppm_boot::codec::{self, Frame, LineTiming};
use ppm_boot::crc;
use ppm_boot::error::ErrorCode;
use ppm_boot::hex::HexImage;
use ppm_boot::line::{LineDriver, LineError, PlatformLine};
use ppm_boot::orchestrator::{self, Action, Memory, PowerControl};
use ppm_boot::session::session_id;
use std::collections::VecDeque;
use std::io::Write;
use tempfile::NamedTempFile;

/// Project id of the `generic-a` catalog entry: 256 KiB flash, 64-word
/// flash pages, CRC variant A with init 1.
const PROJECT_ID: u16 = 0x4D32;

fn hex_checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

fn hex_data_record(addr: u16, data: &[u8]) -> String {
    let mut bytes = Vec::with_capacity(4 + data.len());
    bytes.push(data.len() as u8);
    bytes.push((addr >> 8) as u8);
    bytes.push((addr & 0xFF) as u8);
    bytes.push(0x00);
    bytes.extend_from_slice(data);
    let checksum = hex_checksum(&bytes);
    let body: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
    format!(":{body}{checksum:02X}")
}

/// Extended Linear Address record: sets the upper 16 bits of the base
/// address subsequent data records are offset from.
fn hex_extended_linear_address_record(upper: u16) -> String {
    let bytes = [0x02, 0x00, 0x00, 0x04, (upper >> 8) as u8, (upper & 0xFF) as u8];
    let checksum = hex_checksum(&bytes);
    let body: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
    format!(":{body}{checksum:02X}")
}

fn write_hex_fixture(records: &[String]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp HEX file");
    for record in records {
        writeln!(file, "{record}").expect("write HEX record");
    }
    writeln!(file, ":00000001FF").expect("write EOF record");
    file.flush().expect("flush temp HEX file");
    file
}

fn load_hex(file: &NamedTempFile) -> HexImage {
    let source = std::fs::read_to_string(file.path()).expect("read HEX fixture");
    HexImage::parse(&source).expect("parse HEX fixture")
}

struct AlwaysPowered;
impl PowerControl for AlwaysPowered {
    fn is_powered(&self) -> bool {
        true
    }
    fn power_down_for(&mut self, _ms: u32) -> Result<(), ppm_boot::Error> {
        Ok(())
    }
}

/// One in-flight session's accumulated page data, as the chip sees it.
///
/// Pages accumulate in arrival order (the chip counts them, the way a real
/// target does, rather than indexing by the wire `seq` byte, which is only
/// 8 bits wide and wraps well before a multi-thousand-page flash image ends).
struct SessionState {
    id: u8,
    page_size: u8,
    page_count: u16,
    offset: u16,
    checksum: u16,
    pages: Vec<Vec<u16>>,
}

/// A fake target that answers the PPM protocol the way a real chip would:
/// auto-acknowledges every page and echoes session content back, so the
/// orchestrator's program/verify round trip can be exercised without real
/// hardware.
struct SimulatedChip {
    pending: VecDeque<Vec<u32>>,
    current: Option<SessionState>,
    programmed_flash: Vec<u16>,
}

impl SimulatedChip {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            programmed_flash: Vec::new(),
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Calibration | Frame::EnterPattern { .. } => {}
            Frame::Session { words } => self.on_session(words),
            Frame::Page { seq, checksum, data } => self.on_page(seq, checksum, data),
        }
    }

    fn on_session(&mut self, words: [u16; 4]) {
        let id = ((words[0] >> 8) & 0x7F) as u8;
        let page_size = (words[0] & 0xFF) as u8;
        let page_count = words[1];
        let offset = words[2];
        let checksum = words[3];

        if page_count == 0 {
            let reply = self.zero_page_reply(id, page_size, offset);
            self.pending.push_back(codec::encode(&Frame::Session { words: reply }));
            return;
        }
        self.current = Some(SessionState {
            id,
            page_size,
            page_count,
            offset,
            checksum,
            pages: Vec::with_capacity(page_count as usize),
        });
    }

    fn zero_page_reply(&self, id: u8, page_size: u8, offset: u16) -> [u16; 4] {
        let header = ((id as u16) << 8) | page_size as u16;
        if id == session_id::UNLOCK {
            // The unlock reply is decremented by 1 before validation per the
            // documented erratum, so the wire value must be one higher.
            [header.wrapping_add(1), 0, 0, PROJECT_ID]
        } else if id == session_id::CHIP_RESET {
            [header, 0, 0, PROJECT_ID]
        } else if id == session_id::FLASH_CRC {
            // The chip CRCs its own (already-programmed) flash length; it
            // never takes a length from the session frame.
            let descriptor = chip::lookup(PROJECT_ID).expect("catalog has generic-a");
            let value = crc::flash_crc(
                descriptor.flash_crc_variant,
                &self.programmed_flash,
                descriptor.flash_crc_init,
            );
            [header, 0, ((value >> 16) & 0xFF) as u16, (value & 0xFFFF) as u16]
        } else {
            [header, 0, offset, 0]
        }
    }

    fn on_page(&mut self, seq: u8, checksum: u8, data: Vec<u16>) {
        self.pending
            .push_back(codec::encode(&Frame::Page { seq, checksum, data: vec![] }));

        let Some(session) = &mut self.current else {
            return;
        };
        session.pages.push(data);

        if session.pages.len() as u16 != session.page_count {
            return;
        }

        if session.id == session_id::FLASH_PROG {
            // Undo the orchestrator's page-0-last wrap: the wire's last page
            // is the original page 0, and the rest arrived in original order.
            let mut pages = std::mem::take(&mut session.pages);
            let first_page = pages.pop().expect("at least one page");
            let mut words = first_page;
            for page in pages {
                words.extend_from_slice(&page);
            }
            self.programmed_flash = words;
        }

        let reply = [
            ((session.id as u16) << 8) | session.page_size as u16,
            session.page_count,
            session.offset,
            session.checksum,
        ];
        self.pending.push_back(codec::encode(&Frame::Session { words: reply }));
        self.current = None;
    }
}

impl PlatformLine for SimulatedChip {
    fn configure(&mut self, _timing: LineTiming) -> Result<(), LineError> {
        Ok(())
    }

    fn transmit_blocking(&mut self, symbols: &[u32]) -> Result<(), LineError> {
        if let Ok(decoded) = codec::decode(symbols) {
            if let Some(frame) = decoded.into_frame() {
                self.on_frame(frame);
            }
        }
        Ok(())
    }

    fn receive_blocking(&mut self, _timeout_us: u32) -> Result<Option<Vec<u32>>, LineError> {
        Ok(self.pending.pop_front())
    }
}

#[test]
fn program_then_verify_flash_round_trip() {
    let data: Vec<u8> = (0u8..=255).collect();
    let fixture = write_hex_fixture(&[hex_data_record(0, &data)]);
    let hex = load_hex(&fixture);

    let mut driver = LineDriver::new(SimulatedChip::new());
    let mut power = AlwaysPowered;

    let program_result = orchestrator::do_action(
        &mut driver,
        &mut power,
        true,
        false,
        9600,
        Memory::Flash,
        Action::Program,
        &hex,
    );
    assert_eq!(program_result, ErrorCode::Ok);

    let verify_result = orchestrator::do_action(
        &mut driver,
        &mut power,
        true,
        false,
        9600,
        Memory::Flash,
        Action::Verify,
        &hex,
    );
    assert_eq!(verify_result, ErrorCode::Ok);
}

#[test]
fn hex_outside_memory_range_yields_missing_data() {
    // generic-a's flash is 256 KiB starting at 0 (ends at 0x3FFFF); place
    // the image entirely above that via an Extended Linear Address record.
    let fixture = write_hex_fixture(&[
        hex_extended_linear_address_record(0x0005),
        hex_data_record(0, &[0xAA; 4]),
    ]);
    let hex = load_hex(&fixture);
    assert_eq!(hex.min_address(), Some(0x0005_0000));

    let mut driver = LineDriver::new(SimulatedChip::new());
    let mut power = AlwaysPowered;

    let result = orchestrator::do_action(
        &mut driver,
        &mut power,
        true,
        false,
        9600,
        Memory::Flash,
        Action::Program,
        &hex,
    );
    assert_eq!(result, ErrorCode::MissingData);
}
