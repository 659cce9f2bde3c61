use thiserror::Error;

/// Configuration and lifecycle errors.
///
/// The allocation hot path never produces these: allocation failure of the
/// backing heap aborts, and caller-contract violations are `unsafe`
/// preconditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("unsupported alignment {alignment}: must be a power of two within the page alignment")]
    InvalidAlignment { alignment: usize },

    #[error("page size {page_size} cannot hold a single {block_size}-byte block after the page header")]
    PageTooSmall { page_size: usize, block_size: usize },

    #[error("invalid size class configuration: {0}")]
    InvalidSizeClasses(String),

    #[error("memory manager not initialized")]
    NotInitialized,
}
