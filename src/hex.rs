//! Intel-HEX container: provides address range and gap-filled byte reads.
//! Built on the `ihex` crate's record parser.

use crate::error::Error;
use ihex::Record;
use std::collections::BTreeMap;

/// A parsed HEX image as a sparse byte map. Absent addresses read back as
/// the erased-flash state (0xFF).
pub struct HexImage {
    bytes: BTreeMap<u32, u8>,
}

impl HexImage {
    pub fn parse(source: &str) -> Result<Self, Error> {
        let mut bytes = BTreeMap::new();
        let mut base: u32 = 0;
        for record in ihex::Reader::new(source) {
            let record = record.map_err(|e| Error::InvalidArg(format!("bad HEX record: {e}")))?;
            match record {
                Record::Data { offset, value } => {
                    let start = base.wrapping_add(offset as u32);
                    for (i, byte) in value.into_iter().enumerate() {
                        bytes.insert(start.wrapping_add(i as u32), byte);
                    }
                }
                Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
                Record::ExtendedSegmentAddress(segment) => base = (segment as u32) << 4,
                Record::StartLinearAddress(_) | Record::StartSegmentAddress { .. } => {}
                Record::EndOfFile => break,
            }
        }
        Ok(Self { bytes })
    }

    pub fn min_address(&self) -> Option<u32> {
        self.bytes.keys().next().copied()
    }

    pub fn max_address(&self) -> Option<u32> {
        self.bytes.keys().next_back().copied()
    }

    /// Number of HEX-supplied bytes that fall in `[addr, addr+len)`.
    pub fn count_bytes_in_range(&self, addr: u32, len: u32) -> u32 {
        if len == 0 {
            return 0;
        }
        let end = addr.saturating_add(len);
        self.bytes.range(addr..end).count() as u32
    }

    /// Fills `out` from `addr`, using 0xFF (erased state) where the HEX image
    /// has no byte.
    pub fn fill(&self, addr: u32, out: &mut [u8]) {
        for (i, slot) in out.iter_mut().enumerate() {
            let a = addr.wrapping_add(i as u32);
            *slot = self.bytes.get(&a).copied().unwrap_or(0xFF);
        }
    }
}
