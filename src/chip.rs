//! Chip-descriptor catalog: per-chip memory maps, timings, key material, and
//! CRC algorithm selection. The real catalog is an external database keyed
//! by project id; this crate ships a small static catalog so the
//! orchestrator and CLI are runnable end to end without one.

use crate::crc::CrcVariant;

/// A programmable memory region: flash, flash-CS, or non-volatile (EEPROM).
#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
    pub start_address: u32,
    pub length: u32,
    pub writeable_length: u32,
    pub page_size_bytes: u32,
    pub erase_unit_bytes: u32,
    pub erase_time_ms: u32,
    pub write_time_ms: u32,
}

/// Per-chip programming profile.
#[derive(Debug, Clone)]
pub struct ChipDescriptor {
    pub project_id: u16,
    pub name: &'static str,
    pub flash: Option<MemoryDescriptor>,
    pub flash_cs: Option<MemoryDescriptor>,
    pub nvram: Option<MemoryDescriptor>,
    pub programming_keys: Option<Vec<u8>>,
    pub supports_flash_cs: bool,
    pub supports_eeprom_verify: bool,
    pub flash_crc_variant: CrcVariant,
    /// Seed value the target's flash-CRC algorithm is initialized with; fixed
    /// per chip family, not per invocation.
    pub flash_crc_init: u32,
}

/// The catalog's fixed in-protocol page size for EEPROM addressing, shared
/// by the EEPROM-program and EEPROM-CRC sessions regardless of which one is
/// in flight (see `session::eeprom_page_offset`).
pub const EEPROM_PAGE_WORDS: u32 = 4;

/// Returns the built-in chip catalog.
pub fn catalog() -> Vec<ChipDescriptor> {
    vec![
        ChipDescriptor {
            project_id: 0x4D32,
            name: "generic-a",
            flash: Some(MemoryDescriptor {
                start_address: 0,
                length: 256 * 1024,
                writeable_length: 256 * 1024,
                page_size_bytes: 128,
                erase_unit_bytes: 4096,
                erase_time_ms: 40,
                write_time_ms: 4,
            }),
            flash_cs: Some(MemoryDescriptor {
                start_address: 0x0001_0000,
                length: 16 * 1024,
                writeable_length: 16 * 1024,
                page_size_bytes: 128,
                erase_unit_bytes: 128,
                erase_time_ms: 10,
                write_time_ms: 4,
            }),
            nvram: Some(MemoryDescriptor {
                start_address: 0x0002_0000,
                length: 8 * 1024,
                writeable_length: 8 * 1024,
                page_size_bytes: 8,
                erase_unit_bytes: 8,
                erase_time_ms: 5,
                write_time_ms: 5,
            }),
            programming_keys: None,
            supports_flash_cs: true,
            supports_eeprom_verify: true,
            flash_crc_variant: CrcVariant::VariantA,
            flash_crc_init: 1,
        },
        ChipDescriptor {
            project_id: 0x4D47,
            name: "generic-gxfe",
            flash: Some(MemoryDescriptor {
                start_address: 0,
                length: 512 * 1024,
                writeable_length: 512 * 1024,
                page_size_bytes: 128,
                erase_unit_bytes: 8192,
                erase_time_ms: 60,
                write_time_ms: 4,
            }),
            flash_cs: None,
            nvram: Some(MemoryDescriptor {
                start_address: 0x0008_0000,
                length: 16 * 1024,
                writeable_length: 16 * 1024,
                page_size_bytes: 8,
                erase_unit_bytes: 8,
                erase_time_ms: 5,
                write_time_ms: 5,
            }),
            programming_keys: Some(vec![0u8; 16]),
            supports_flash_cs: false,
            supports_eeprom_verify: true,
            flash_crc_variant: CrcVariant::Xfe,
            flash_crc_init: 0xFFFF,
        },
    ]
}

/// Looks up a chip descriptor by the project id returned from Unlock/
/// Chip-reset.
pub fn lookup(project_id: u16) -> Option<ChipDescriptor> {
    catalog().into_iter().find(|chip| chip.project_id == project_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup_finds_known_chip() {
        assert!(lookup(0x4D32).is_some());
    }

    #[test]
    fn catalog_lookup_rejects_unknown_chip() {
        assert!(lookup(0xFFFF).is_none());
    }
}
