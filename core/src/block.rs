//! Translated-block identity and the exit protocol between
//! generated code and the dispatcher.

/// Identifier of a translated block within the code cache.
///
/// Ids are handed out sequentially and are never reused until
/// the cache is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Maximum number of patchable direct exits per block.
pub const MAX_LINKS: usize = 2;

/// Number of low bits of an exit value holding the `ExitKind`.
pub const EXIT_KIND_BITS: u32 = 3;
const EXIT_KIND_MASK: u32 = (1 << EXIT_KIND_BITS) - 1;

/// Why a block returned to the dispatcher.
///
/// Every exit leaves EIP pointing at the next guest instruction
/// to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitKind {
    /// Indirect control transfer or block end that must not be chained.
    Normal = 0,
    /// Direct branch through patchable exit 0.
    Link0 = 1,
    /// Direct branch through patchable exit 1.
    Link1 = 2,
    /// Cycle budget exhausted on block entry.
    Cycles = 3,
    /// An interpreter call-out redirected control or changed the mode.
    Callout = 4,
    /// A guest write hit translated code while the block ran.
    Smc = 5,
}

impl ExitKind {
    pub const fn link(slot: usize) -> Self {
        if slot == 0 {
            ExitKind::Link0
        } else {
            ExitKind::Link1
        }
    }

    /// Link slot for chainable exits.
    pub const fn link_slot(self) -> Option<usize> {
        match self {
            ExitKind::Link0 => Some(0),
            ExitKind::Link1 => Some(1),
            _ => None,
        }
    }

    const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(ExitKind::Normal),
            1 => Some(ExitKind::Link0),
            2 => Some(ExitKind::Link1),
            3 => Some(ExitKind::Cycles),
            4 => Some(ExitKind::Callout),
            5 => Some(ExitKind::Smc),
            _ => None,
        }
    }
}

/// Pack the exiting block and exit kind into the value returned
/// in the host return register.
#[inline]
pub const fn encode_exit(block: BlockId, kind: ExitKind) -> u32 {
    (block.0 << EXIT_KIND_BITS) | kind as u32
}

/// Inverse of `encode_exit`. Unknown kinds decode as `Normal`.
#[inline]
pub fn decode_exit(raw: u32) -> (BlockId, ExitKind) {
    let kind = ExitKind::from_bits(raw & EXIT_KIND_MASK).unwrap_or(ExitKind::Normal);
    (BlockId(raw >> EXIT_KIND_BITS), kind)
}

/// Largest block id representable in an exit value.
pub const MAX_BLOCK_ID: u32 = u32::MAX >> EXIT_KIND_BITS;
