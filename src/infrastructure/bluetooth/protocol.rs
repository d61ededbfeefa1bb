//! Turret Wire Protocol
//!
//! Every command travels as a 2-byte frame:
//!
//! ```text
//! [0] : Opcode id
//!       0 = Fire, 1 = Prime, 2 = Tilt up, 3 = Tilt down,
//!       4 = Rotate left, 5 = Rotate right, 6 = Invalid
//! [1] : Tick count (1-10) for movement opcodes, 0 otherwise
//! ```
//!
//! The link is transmit-only; nothing is decoded on this side.

use crate::domain::command::Command;

/// RFCOMM service record UUID advertised by the turret
pub const SERVICE_UUID: &str = "97d3edd0-5d56-11e9-b475-0800200c9a66";

/// Service name the turret registers with SDP
pub const SERVICE_NAME: &str = "DMG Turret Control";

/// RFCOMM channel used when the service record cannot be resolved
pub const FALLBACK_CHANNEL: u8 = 1;

/// Size of one command frame
pub const FRAME_LEN: usize = 2;

/// Encode a command into its wire frame.
///
/// Callers must only encode valid commands.
pub fn encode(command: &Command) -> [u8; FRAME_LEN] {
    debug_assert!(command.is_valid(), "encoding an invalid command");
    let opcode = command.opcode();
    let argument = if opcode.requires_argument() {
        command.argument()
    } else {
        0
    };
    [opcode.id(), argument]
}
