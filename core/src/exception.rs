use std::fmt;

/// A guest-visible processor exception.
///
/// These are architectural events delivered to the guest through
/// its interrupt table, never host errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    DivideError,
    Debug,
    Breakpoint,
    Overflow,
    BoundRange,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    InvalidTss(u16),
    SegmentNotPresent(u16),
    StackFault(u16),
    GeneralProtection(u16),
}

impl Exception {
    /// Interrupt vector number.
    pub const fn vector(self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::BoundRange => 5,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::DoubleFault => 8,
            Exception::InvalidTss(_) => 10,
            Exception::SegmentNotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
        }
    }

    /// Error code pushed in protected mode, if the vector has one.
    pub const fn error_code(self) -> Option<u16> {
        match self {
            Exception::DoubleFault => Some(0),
            Exception::InvalidTss(c)
            | Exception::SegmentNotPresent(c)
            | Exception::StackFault(c)
            | Exception::GeneralProtection(c) => Some(c),
            _ => None,
        }
    }

    /// Whether the saved EIP points past the instruction (traps)
    /// rather than at it (faults).
    pub const fn is_trap(self) -> bool {
        matches!(
            self,
            Exception::Debug | Exception::Breakpoint | Exception::Overflow
        )
    }

    /// Whether a second fault while delivering this one escalates
    /// to a double fault.
    pub const fn is_contributory(self) -> bool {
        matches!(
            self,
            Exception::DivideError
                | Exception::InvalidTss(_)
                | Exception::SegmentNotPresent(_)
                | Exception::StackFault(_)
                | Exception::GeneralProtection(_)
        )
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_code() {
            Some(code) => write!(f, "#{}({code:#x})", mnemonic(self.vector())),
            None => write!(f, "#{}", mnemonic(self.vector())),
        }
    }
}

fn mnemonic(vector: u8) -> &'static str {
    match vector {
        0 => "DE",
        1 => "DB",
        3 => "BP",
        4 => "OF",
        5 => "BR",
        6 => "UD",
        7 => "NM",
        8 => "DF",
        10 => "TS",
        11 => "NP",
        12 => "SS",
        _ => "GP",
    }
}
