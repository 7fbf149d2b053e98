/*!
# Shared Types and Utilities

This crate contains common types and utilities shared between the Rust
components of the DPU control system.

## Core Types

- [`RegisterMap`] - Local mirror of the front-end register space
- [`FeeMode`] - Front-end electronics operating modes
- [`LinkPacket`] - Classified SpaceWire link packets
- [`DataPacketHeader`] - Header of data-class packets (data, overscan, housekeeping)

## Modules

- [`register`] - Register map mirror and named field access
- [`mode`] - Front-end mode and sensor selection constants
- [`packet`] - Link packet classification and decoding
- [`error`] - Common error types
*/

pub mod error;
pub mod mode;
pub mod packet;
pub mod register;

// Re-export commonly used types
pub use error::{Result, SharedError};
pub use mode::{CcdSide, FeeMode};
pub use packet::{DataPacket, DataPacketHeader, LinkPacket, PacketType, TimecodePacket};
pub use register::{RegisterField, RegisterMap};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Size of the mirrored register space in bytes (critical, general and
    /// housekeeping areas; the windowing area is not mirrored)
    pub const REGISTER_SPACE_SIZE: usize = 0x800;

    /// Start address of the housekeeping area in the front-end memory map
    pub const HK_MEMORY_ADDRESS: u32 = 0x0000_0700;

    /// Size of the housekeeping area in bytes
    pub const HK_MEMORY_SIZE: usize = 0x90;

    /// First byte of a timecode packet
    pub const TIMECODE_LEADER: u8 = 0x91;

    /// Protocol identifier carried by data-class packets
    pub const DATA_PROTOCOL_ID: u8 = 0xF0;

    /// Protocol identifier carried by RMAP packets
    pub const RMAP_PROTOCOL_ID: u8 = 0x01;

    /// Size of a data-class packet header in bytes
    pub const DATA_HEADER_SIZE: usize = 10;

    /// Number of rows on a CCD, including the charge injection region
    pub const CCD_ROWS: u16 = 4510;

    /// Sensor selection mask for the E side
    pub const SENSOR_SEL_E_SIDE: u8 = 0b10;

    /// Sensor selection mask for the F side
    pub const SENSOR_SEL_F_SIDE: u8 = 0b01;

    /// Sensor selection mask for both sides
    pub const SENSOR_SEL_BOTH_SIDES: u8 = 0b11;

    /// Default CCD readout order as stored in the register map
    pub const DEFAULT_CCD_READOUT_ORDER: u8 = 0b1110_0100;
}
