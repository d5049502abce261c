//! Error taxonomy for the hash core.
//!
//! A `thiserror` enum with one variant per failure class, wrapped in a small context-stack type
//! so every `?` propagation can push a frame describing where the error passed through, without
//! needing a macro system.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCode {
    /// A NUMA page pool had no free pages to hand out.
    #[error("out of free pages")]
    OutOfFreePages,
    /// `register_storage` was called with an id already present in the registry.
    #[error("duplicate storage id")]
    StorageDuplicateId,
    /// A collaborator module this operation depends on hasn't been initialized yet.
    #[error("dependent module unavailable")]
    DependentModuleUnavailable,
    /// Heap allocation failed (NUMA arena allocation, registry array growth, etc).
    #[error("out of memory")]
    OutOfMemory,
    /// Logical lookup found no record for the key. Not a defect; callers interpret this.
    #[error("not found")]
    NotFound,
    /// A CAS loss, observed-moved, or observed-locked race that the caller should retry.
    #[error("race, retry")]
    RaceRetry,
    /// A page or slot failed an internal consistency check.
    #[error("data corruption")]
    DataCorruption,
}

/// An [`ErrorCode`] with an accumulated stack of context frames.
///
/// Frames are pushed as the error propagates up through `?`, standing in for a macro-based
/// file/line trace: frames here are short human-readable strings rather than file/line, since
/// call sites attach their own meaning.
#[derive(Debug, Clone)]
pub struct CoreError {
    pub code: ErrorCode,
    frames: Vec<&'static str>,
}

impl CoreError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            frames: Vec::new(),
        }
    }

    /// Push a context frame, returning self for chaining at `?` sites.
    pub fn context(mut self, frame: &'static str) -> Self {
        self.frames.push(frame);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        for frame in self.frames.iter().rev() {
            write!(f, "\n  while {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.code)
    }
}

impl From<ErrorCode> for CoreError {
    fn from(code: ErrorCode) -> Self {
        CoreError::new(code)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Extension trait to attach a context frame to any `Result<T, CoreError>` at a `?` site.
pub trait ResultExt<T> {
    fn context(self, frame: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, frame: &'static str) -> Result<T> {
        self.map_err(|e| e.context(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_stacks_in_push_order_display_reversed() {
        let err = CoreError::from(ErrorCode::OutOfFreePages)
            .context("allocating data page")
            .context("locate_record_reserve_physical");
        let rendered = err.to_string();
        assert!(rendered.contains("out of free pages"));
        assert!(rendered.contains("locate_record_reserve_physical"));
        assert!(
            rendered.find("locate_record_reserve_physical") < rendered.find("allocating data page")
        );
    }
}
