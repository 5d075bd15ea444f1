//! Protocol module - Defines the wire protocol spoken between device and PC
//!
//! Every unit on the wire is a frame:
//! - 1 byte total length (including the length byte itself, max 255)
//! - 1 byte type discriminator
//! - Variable length, type-specific payload
//!
//! Control commands flow from the PC (server) to the device (client), data
//! messages flow the other way.

mod codec;
mod command;
mod message;
mod types;

pub use codec::*;
pub use command::*;
pub use message::*;
pub use types::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u16 = 2;

/// Default TCP port of the control channel
pub const DEFAULT_CONTROL_PORT: u16 = 24810;

/// Default TCP/UDP port of the data channel
pub const DEFAULT_DATA_PORT: u16 = 24811;

/// Default UDP port discovery probes are sent to
pub const DEFAULT_DISCOVERY_PORT: u16 = 24812;

/// Magic bytes identifying discovery datagrams
pub const MAGIC_BYTES: [u8; 4] = [0x53, 0x4C, 0x4E, 0x4B]; // "SLNK"
