//! CRC primitives consumed by the session engine and orchestrator. The real
//! chip catalog supplies these (per chip, per memory); this crate provides a
//! self-contained implementation built on the `crc` crate's runtime-seedable
//! digests, in the spirit of the CRC-32 header check the teacher tool runs
//! over a ROM image.

use crc::{Algorithm, Crc};

/// Flash CRC algorithm selector, carried by the chip descriptor and echoed
/// into the flash-programming session descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcVariant {
    /// 24-bit CRC used by the baseline flash programming session.
    VariantA,
    /// 24-bit CRC used by GXFE-family parts.
    Xfe,
    /// 24-bit CRC used by GKF-family parts.
    Kf,
}

const CRC16_BASE: Algorithm<u16> = crc::CRC_16_XMODEM;

const CRC24_VARIANT_A: Algorithm<u32> = Algorithm {
    width: 24,
    poly: 0x86_4C_FB,
    init: 0,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0,
    residue: 0,
};

const CRC24_XFE: Algorithm<u32> = Algorithm {
    width: 24,
    poly: 0x5D_6D_CB,
    init: 0,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0,
    residue: 0,
};

const CRC24_KF: Algorithm<u32> = Algorithm {
    width: 24,
    poly: 0x32_8B_63,
    init: 0,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0,
    residue: 0,
};

/// 16-bit CRC over `bytes`, seeded with the caller-supplied `init`.
pub fn crc16(bytes: &[u8], init: u16) -> u16 {
    let crc = Crc::<u16>::new(&CRC16_BASE);
    let mut digest = crc.digest_with_initial(init);
    digest.update(bytes);
    digest.finalize()
}

fn crc24_with(algorithm: &'static Algorithm<u32>, words: &[u16], init: u32) -> u32 {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    let crc = Crc::<u32>::new(algorithm);
    let mut digest = crc.digest_with_initial(init);
    digest.update(&bytes);
    digest.finalize() & 0x00FF_FFFF
}

/// 24-bit CRC over `words` (big-endian byte order), variant A.
pub fn crc24_variant_a(words: &[u16], init: u32) -> u32 {
    crc24_with(&CRC24_VARIANT_A, words, init)
}

/// 24-bit CRC over `words`, GXFE-family variant.
pub fn crc24_variant_xfe(words: &[u16], init: u32) -> u32 {
    crc24_with(&CRC24_XFE, words, init)
}

/// 24-bit CRC over `words`, GKF-family variant.
pub fn crc24_variant_kf(words: &[u16], init: u32) -> u32 {
    crc24_with(&CRC24_KF, words, init)
}

/// Dispatches to the chip-selected flash CRC variant.
pub fn flash_crc(variant: CrcVariant, words: &[u16], init: u32) -> u32 {
    match variant {
        CrcVariant::VariantA => crc24_variant_a(words, init),
        CrcVariant::Xfe => crc24_variant_xfe(words, init),
        CrcVariant::Kf => crc24_variant_kf(words, init),
    }
}

/// Per-page checksum carried in a page frame's header word: an 8-bit
/// wraparound sum over the page's data bytes, the same shape as the
/// length+payload checksum used by this family's serial ISP commands.
pub fn page_checksum(words: &[u16]) -> u8 {
    let mut sum: u8 = 0;
    for word in words {
        let [hi, lo] = word.to_be_bytes();
        sum = sum.wrapping_add(hi).wrapping_add(lo);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_is_deterministic_and_init_sensitive() {
        let bytes = [1u8, 2, 3, 4, 5];
        let a = crc16(&bytes, 0x1D0F);
        let b = crc16(&bytes, 0x1D0F);
        let c = crc16(&bytes, 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn crc24_stays_within_24_bits() {
        let words = [0x1234u16, 0x5678, 0xffff];
        assert!(crc24_variant_a(&words, 1) <= 0x00FF_FFFF);
        assert!(crc24_variant_xfe(&words, 1) <= 0x00FF_FFFF);
        assert!(crc24_variant_kf(&words, 1) <= 0x00FF_FFFF);
    }

    #[test]
    fn page_checksum_matches_manual_sum() {
        let words = [0x0102u16, 0x0304];
        assert_eq!(page_checksum(&words), 1u8.wrapping_add(2).wrapping_add(3).wrapping_add(4));
    }
}
