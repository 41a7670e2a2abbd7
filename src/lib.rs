//! PPM bootloader protocol engine: wire codec, line driver, session engine,
//! and bootloader orchestrator for a family of automotive mixed-signal
//! microcontrollers programmed over a single-wire pulse-position-modulated
//! link.
//!
//! The binary (`src/main.rs`) is a thin CLI that wires this engine to a
//! serial-attached PPM adapter, a chip catalog, and an Intel-HEX image.

pub mod chip;
pub mod codec;
pub mod crc;
pub mod error;
pub mod hex;
pub mod line;
pub mod orchestrator;
pub mod session;
pub mod settings;

pub use error::{Error, ErrorCode};
