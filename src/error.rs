//! Typed error surface raised by the memory core to the evaluator (§7 of the design doc).

use thiserror::Error;

/// Errors the memory core can raise. Every fallible public entry point on
/// [`crate::runtime::Runtime`] returns `Result<T, MemError>`; the crate never
/// unwinds out of an allocation path in release builds.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// `alloc` failed, or the configured `usage_limit` quota would be exceeded.
    #[error("out of memory (requested {requested} bytes, limit {limit:?})")]
    OutOfMemory { requested: usize, limit: Option<usize> },

    /// Attempted mutation of a frozen or protected object or slot.
    #[error("value is locked (protected or frozen)")]
    Locked,

    /// Attempted assignment to a protected variable slot.
    #[error("variable slot is protected")]
    ProtectedKey,

    /// Expansion delta exceeds the 2 GiB limit, or would underflow a buffer.
    #[error("index or delta out of range")]
    IndexOutOfRange,

    /// Data-stack expansion would exceed the compile-time cap.
    #[error("data stack overflow")]
    StackOverflow,
}

/// Delta magnitudes larger than this are rejected with [`MemError::IndexOutOfRange`]
/// before any allocation is attempted (§4.4, §7).
pub const MAX_EXPAND_DELTA: usize = 2 * 1024 * 1024 * 1024;
