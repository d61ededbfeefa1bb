//! Turret command model
//!
//! A [`Command`] is the validated result of parsing one utterance. It is an
//! immutable value: created once per parse, then either encoded or dropped.

use std::fmt;

/// Largest tick count a movement command may carry.
pub const MAX_TICK: u8 = 10;

/// Action identifiers understood by the turret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Fire,
    Prime,
    TiltUp,
    TiltDown,
    RotateLeft,
    RotateRight,
    Invalid,
}

impl Opcode {
    /// Fixed wire id of this opcode
    pub const fn id(self) -> u8 {
        match self {
            Self::Fire => 0,
            Self::Prime => 1,
            Self::TiltUp => 2,
            Self::TiltDown => 3,
            Self::RotateLeft => 4,
            Self::RotateRight => 5,
            Self::Invalid => 6,
        }
    }

    /// Movement opcodes carry a tick count, fire and prime do not.
    pub const fn requires_argument(self) -> bool {
        !matches!(self, Self::Fire | Self::Prime | Self::Invalid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    opcode: Opcode,
    argument: u8,
    is_valid: bool,
}

impl Command {
    /// Build a command, returning `None` when the pair violates the
    /// opcode/argument rules.
    ///
    /// Fire and prime ignore `argument` and always carry 0.
    pub fn new(opcode: Opcode, argument: u8) -> Option<Self> {
        match opcode {
            Opcode::Invalid => None,
            Opcode::Fire | Opcode::Prime => Some(Self {
                opcode,
                argument: 0,
                is_valid: true,
            }),
            _ if (1..=MAX_TICK).contains(&argument) => Some(Self {
                opcode,
                argument,
                is_valid: true,
            }),
            _ => None,
        }
    }

    /// The canonical invalid command
    pub const fn invalid() -> Self {
        Self {
            opcode: Opcode::Invalid,
            argument: 0,
            is_valid: false,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn argument(&self) -> u8 {
        self.argument
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    /// Operator feedback text for this command
    pub fn describe(&self) -> String {
        let n = self.argument;
        match self.opcode {
            Opcode::Fire => "Fire payload".to_string(),
            Opcode::Prime => "Prime payload".to_string(),
            Opcode::TiltUp => format!("Tilt turret up by {} degree(s)", n),
            Opcode::TiltDown => format!("Tilt turret down by {} degree(s)", n),
            Opcode::RotateLeft => format!("Rotate turret left by {} degree(s)", n),
            Opcode::RotateRight => format!("Rotate turret right by {} degree(s)", n),
            Opcode::Invalid => "Invalid command".to_string(),
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_ids() {
        let ids: Vec<u8> = [
            Opcode::Fire,
            Opcode::Prime,
            Opcode::TiltUp,
            Opcode::TiltDown,
            Opcode::RotateLeft,
            Opcode::RotateRight,
            Opcode::Invalid,
        ]
        .iter()
        .map(|op| op.id())
        .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_new_enforces_tick_range() {
        assert!(Command::new(Opcode::TiltUp, 0).is_none());
        assert!(Command::new(Opcode::TiltUp, MAX_TICK + 1).is_none());
        assert!(Command::new(Opcode::Invalid, 3).is_none());

        let cmd = Command::new(Opcode::RotateLeft, MAX_TICK).unwrap();
        assert!(cmd.is_valid());
        assert_eq!(cmd.argument(), MAX_TICK);
    }

    #[test]
    fn test_fire_drops_argument() {
        let cmd = Command::new(Opcode::Fire, 7).unwrap();
        assert_eq!(cmd.argument(), 0);
        assert!(cmd.is_valid());
    }

    #[test]
    fn test_describe() {
        assert_eq!(Command::invalid().describe(), "Invalid command");
        assert_eq!(
            Command::new(Opcode::TiltDown, 4).unwrap().describe(),
            "Tilt turret down by 4 degree(s)"
        );
    }
}
