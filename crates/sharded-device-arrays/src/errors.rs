use std::backtrace::Backtrace;

use thiserror::Error;

use crate::types::ElementType;

/// Represents errors that can occur when constructing, querying, or deleting sharded device arrays.
///
/// Each variant includes a `backtrace` field that captures the call stack at the point where the error was created,
/// which is useful for debugging. Note that it is represented as a [`String`] and not as a [`Backtrace`] so that
/// [`Error`] can remain [`Clone`] and comparable.
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// Error returned when device storage is accessed after [`ShardedDeviceArray::delete`] was called.
    ///
    /// [`ShardedDeviceArray::delete`]: crate::ShardedDeviceArray::delete
    #[error("sharded device array has been deleted")]
    AlreadyDeleted { backtrace: String },

    /// Error returned when a composite array cannot be viewed as a list of per-shard buffers.
    #[error("{operation} is implemented for buffer-backed backends only")]
    BackendIncompatible { operation: String, backtrace: String },

    /// Error returned when a checked cast at the host boundary fails.
    #[error("expected a {expected} but got a {actual}")]
    WrongType { expected: String, actual: String, backtrace: String },

    /// Error returned when host memory for a new object could not be reserved.
    #[error("failed to allocate host memory for {context}")]
    AllocationFailure { context: String, backtrace: String },

    /// Error returned when a composite array is requested for an array that has no device buffers.
    #[error("cannot assemble a sharded device array that has no device buffers")]
    EmptyDeviceBuffers { backtrace: String },

    /// Error returned when the number of shards does not match the number of devices of a sharding.
    #[error("expected {expected} shard(s) but got {actual}")]
    ShardCountMismatch { expected: usize, actual: usize, backtrace: String },

    /// Error returned when host data is read or written with an element type that does not match its own.
    #[error("expected element type {expected} but got {actual}")]
    ElementTypeMismatch { expected: ElementType, actual: ElementType, backtrace: String },

    /// Error returned when a byte buffer does not have the length implied by its shape and element type.
    #[error("expected {expected} byte(s) but got {actual}")]
    ByteLengthMismatch { expected: usize, actual: usize, backtrace: String },

    /// Error returned when the number of elements or bytes of an array does not fit in a [`usize`].
    #[error("the size of {aval} does not fit in a usize")]
    SizeOverflow { aval: String, backtrace: String },

    /// Error reported by a backend (i.e., a buffer, array, or client implementation).
    #[error("{message}")]
    Backend { message: String, backtrace: String },
}

impl Error {
    /// Creates a new [`Error::AlreadyDeleted`].
    pub fn already_deleted() -> Self {
        Self::AlreadyDeleted { backtrace: Backtrace::capture().to_string() }
    }

    /// Creates a new [`Error::BackendIncompatible`].
    pub fn backend_incompatible<O: Into<String>>(operation: O) -> Self {
        Self::BackendIncompatible { operation: operation.into(), backtrace: Backtrace::capture().to_string() }
    }

    /// Creates a new [`Error::WrongType`].
    pub fn wrong_type<E: Into<String>, A: Into<String>>(expected: E, actual: A) -> Self {
        Self::WrongType {
            expected: expected.into(),
            actual: actual.into(),
            backtrace: Backtrace::capture().to_string(),
        }
    }

    /// Creates a new [`Error::AllocationFailure`].
    pub fn allocation_failure<C: Into<String>>(context: C) -> Self {
        Self::AllocationFailure { context: context.into(), backtrace: Backtrace::capture().to_string() }
    }

    /// Creates a new [`Error::EmptyDeviceBuffers`].
    pub fn empty_device_buffers() -> Self {
        Self::EmptyDeviceBuffers { backtrace: Backtrace::capture().to_string() }
    }

    /// Creates a new [`Error::ShardCountMismatch`].
    pub fn shard_count_mismatch(expected: usize, actual: usize) -> Self {
        Self::ShardCountMismatch { expected, actual, backtrace: Backtrace::capture().to_string() }
    }

    /// Creates a new [`Error::ElementTypeMismatch`].
    pub fn element_type_mismatch(expected: ElementType, actual: ElementType) -> Self {
        Self::ElementTypeMismatch { expected, actual, backtrace: Backtrace::capture().to_string() }
    }

    /// Creates a new [`Error::ByteLengthMismatch`].
    pub fn byte_length_mismatch(expected: usize, actual: usize) -> Self {
        Self::ByteLengthMismatch { expected, actual, backtrace: Backtrace::capture().to_string() }
    }

    /// Creates a new [`Error::SizeOverflow`].
    pub fn size_overflow<A: std::fmt::Display>(aval: A) -> Self {
        Self::SizeOverflow { aval: aval.to_string(), backtrace: Backtrace::capture().to_string() }
    }

    /// Creates a new [`Error::Backend`].
    pub fn backend<M: Into<String>>(message: M) -> Self {
        Self::Backend { message: message.into(), backtrace: Backtrace::capture().to_string() }
    }

    /// Returns the backtrace that was captured when this [`Error`] was created. Note that it will not contain an
    /// actual stack trace unless backtrace capturing is enabled (e.g., through the `RUST_BACKTRACE` variable).
    pub fn backtrace(&self) -> &str {
        match self {
            Self::AlreadyDeleted { backtrace }
            | Self::BackendIncompatible { backtrace, .. }
            | Self::WrongType { backtrace, .. }
            | Self::AllocationFailure { backtrace, .. }
            | Self::EmptyDeviceBuffers { backtrace }
            | Self::ShardCountMismatch { backtrace, .. }
            | Self::ElementTypeMismatch { backtrace, .. }
            | Self::ByteLengthMismatch { backtrace, .. }
            | Self::SizeOverflow { backtrace, .. }
            | Self::Backend { backtrace, .. } => backtrace.as_str(),
        }
    }
}
