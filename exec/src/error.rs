use dynx86_backend::ArenaError;
use dynx86_frontend::TranslateError;
use thiserror::Error;

use crate::config::ConfigError;

/// Failures of the dynamic core. None of them is visible to the
/// guest: the dispatcher answers each one by interpreting.
#[derive(Debug, Error)]
pub enum DynrecError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("executable arena: {0}")]
    Arena(#[from] ArenaError),
    #[error("translation failed: {0}")]
    Translate(#[from] TranslateError),
    #[error("block of {len} bytes does not fit the {capacity}-byte code cache")]
    BlockTooLarge { len: usize, capacity: usize },
}
