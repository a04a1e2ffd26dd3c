//! Value locations.
//!
//! The register and stack allocators assign every runtime value to either a
//! physical register or a frame-pointer-relative stack slot. This assignment
//! is represented by a `ValueLoc`.

use core::fmt;

/// Value location.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ValueLoc {
    /// This value has not been assigned to a location yet.
    #[default]
    Unassigned,
    /// Value lives in register `xN`.
    Reg(u8),
    /// Value lives on the stack at this byte offset from the frame pointer.
    /// Locals and spill slots have negative offsets; incoming stack
    /// arguments have offsets of at least +16.
    Stack(i32),
}

impl ValueLoc {
    /// Is this an assigned location?
    pub fn is_assigned(self) -> bool {
        !matches!(self, Self::Unassigned)
    }

    /// Get the register of this location, or panic.
    pub fn unwrap_reg(self) -> u8 {
        match self {
            Self::Reg(reg) => reg,
            _ => panic!("unwrap_reg expected register, found {self:?}"),
        }
    }

    /// Get the stack offset of this location, or panic.
    pub fn unwrap_stack(self) -> i32 {
        match self {
            Self::Stack(off) => off,
            _ => panic!("unwrap_stack expected stack slot, found {self:?}"),
        }
    }
}

impl fmt::Display for ValueLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Unassigned => write!(f, "-"),
            Self::Reg(reg) => write!(f, "x{reg}"),
            Self::Stack(off) => write!(f, "[fp{off:+}]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ValueLoc;

    #[test]
    fn display() {
        assert_eq!(ValueLoc::Unassigned.to_string(), "-");
        assert_eq!(ValueLoc::Reg(7).to_string(), "x7");
        assert_eq!(ValueLoc::Stack(-24).to_string(), "[fp-24]");
        assert_eq!(ValueLoc::Stack(16).to_string(), "[fp+16]");
    }
}
