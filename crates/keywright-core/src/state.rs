use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Absent,
    Generating,
    Created,
    Registered,
    Unregistered,
    Rotating,
    Rotated,
    RotationFailed,
    Deleted,
}

impl KeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Absent => "absent",
            KeyState::Generating => "generating",
            KeyState::Created => "created",
            KeyState::Registered => "registered",
            KeyState::Unregistered => "unregistered",
            KeyState::Rotating => "rotating",
            KeyState::Rotated => "rotated",
            KeyState::RotationFailed => "rotation_failed",
            KeyState::Deleted => "deleted",
        }
    }

    pub fn can_transition(self, to: KeyState) -> bool {
        use KeyState::*;
        match (self, to) {
            (Absent | Deleted, Generating) => true,
            (Generating, Created | Absent) => true,
            (Created | Unregistered | Rotated | RotationFailed, Registered) => true,
            (Created | Registered | Rotated | RotationFailed, Unregistered) => true,
            (Created | Registered | Unregistered | Rotated | RotationFailed, Rotating) => true,
            (Rotating, Rotated | RotationFailed) => true,
            (Created | Registered | Unregistered | Rotated | RotationFailed, Deleted) => true,
            _ => false,
        }
    }

    /// Like [`KeyState::can_transition`], but a repeated agent add or remove
    /// is not an error.
    pub fn accepts(self, to: KeyState) -> bool {
        (self == to && matches!(to, KeyState::Registered | KeyState::Unregistered))
            || self.can_transition(to)
    }

    pub fn is_present(&self) -> bool {
        !matches!(
            self,
            KeyState::Absent | KeyState::Generating | KeyState::Deleted
        )
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
