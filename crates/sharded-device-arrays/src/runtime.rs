//! Runtime arrays and the clients that assemble them.
//!
//! A [`RuntimeArray`] is a device runtime object that represents an array that may span multiple devices. Sharded
//! device arrays use a [`RuntimeClient`] to assemble the single-device arrays of their shards into one composite
//! [`RuntimeArray`] whenever an operation needs to treat all shards as a single array.

use std::fmt::Debug;
use std::sync::Arc;

use crate::buffers::{Buffer, DeviceId};
use crate::errors::Error;
use crate::sharding::OpaqueSharding;
use crate::types::ElementType;

/// Ownership semantics for the inputs of operations that create new [`RuntimeArray`]s from existing ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArrayCopySemantics {
    /// The new array always owns a copy of the input storage.
    AlwaysCopy,

    /// The new array aliases the input storage, which remains usable through the inputs.
    ReuseInput,
}

/// Device runtime array.
pub trait RuntimeArray: Debug + Send + Sync {
    /// Client that owns this array.
    fn client(&self) -> Arc<dyn RuntimeClient>;

    /// Element type of this array.
    fn element_type(&self) -> ElementType;

    /// Shape of this array.
    fn shape(&self) -> &[usize];

    /// Devices that this array spans, in shard order. For a single-device array, the first (and only) device is
    /// the device that holds its storage.
    fn devices(&self) -> &[DeviceId];

    /// Returns `true` if and only if the storage of this array has been deleted.
    fn is_deleted(&self) -> bool;

    /// Releases the device storage of this array.
    fn delete(&self) -> Result<(), Error>;

    /// Returns a view of this array as a list of per-shard [`Buffer`]s, if the backend that produced it supports
    /// one. Backends that do not store arrays as one buffer per shard return [`None`].
    fn as_buffer_backed(&self) -> Option<&dyn BufferBackedArray> {
        None
    }
}

/// [`RuntimeArray`] capability for arrays that are backed by one [`Buffer`] per shard.
pub trait BufferBackedArray {
    /// Per-shard buffers of this array, in shard order.
    fn buffers(&self) -> Vec<Arc<dyn Buffer>>;
}

/// Device runtime client.
pub trait RuntimeClient: Debug + Send + Sync {
    /// Assembles a composite array with the provided `shape` and `sharding` out of single-device `arrays`, one per
    /// device of `sharding`, in the same order.
    fn assemble_array_from_single_device_arrays(
        &self,
        shape: Vec<usize>,
        sharding: OpaqueSharding,
        arrays: &[Arc<dyn RuntimeArray>],
        semantics: ArrayCopySemantics,
    ) -> Result<Arc<dyn RuntimeArray>, Error>;
}
