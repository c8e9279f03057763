//! Sharded device arrays.
//!
//! A [`ShardedDeviceArray`] is a single logical array whose storage is partitioned across multiple devices. It
//! holds one [`DeviceBuffer`] per shard together with the [`ShardingSpec`] that maps the logical index space of the
//! array to those shards, and it derives the views that device runtimes need lazily:
//!
//!   - [`ShardedDeviceArray::buffers`] returns the flat, ordered list of raw per-shard [`Buffer`]s, for per-shard
//!     operations, and
//!   - [`ShardedDeviceArray::assembled_array`] returns one composite [`RuntimeArray`] that represents all shards,
//!     for whole-array operations.
//!
//! Device memory is released explicitly using [`ShardedDeviceArray::delete`], after which only metadata (e.g., the
//! [`Aval`], the indices, and the sharding specification) remains accessible. Dropping an array without deleting
//! it only releases its references to the per-device handles.

use std::collections::TryReserveError;
use std::marker::PhantomData;
use std::sync::Arc;

use log::{debug, warn};

use crate::buffers::{Buffer, DeviceBuffer, ShardedBuffer};
use crate::errors::Error;
use crate::representations::{DefaultRepresentation, Representation, ShardStorage};
use crate::runtime::RuntimeArray;
use crate::sharding::{ShardIndex, ShardingSpec};
use crate::types::{Aval, ElementType, HostSnapshot};

/// Logical array whose storage is sharded across devices.
///
/// The type parameter selects how per-shard buffers are derived and how shards are released (see
/// [`Representation`]). Most code should rely on the default, which is chosen once for the whole build.
///
/// Methods that derive cached views or release device memory take `&mut self`, so that each array has a single
/// writer. Wrap arrays in your own synchronization primitives if they need to be shared across threads.
pub struct ShardedDeviceArray<R: Representation = DefaultRepresentation> {
    aval: Aval,
    sharding_spec: ShardingSpec,
    indices: Vec<ShardIndex>,
    weak_type: bool,
    storage: ShardStorage,
    host_snapshot: Option<HostSnapshot>,
    replica_index_hint: Option<Vec<usize>>,
    representation: PhantomData<fn() -> R>,
}

impl<R: Representation> ShardedDeviceArray<R> {
    /// Creates a new [`ShardedDeviceArray`] from one [`DeviceBuffer`] per shard.
    ///
    /// The device buffers must be valid (i.e., not deleted) and ordered consistently with `sharding_spec` and with
    /// `indices`. Neither of these is verified. No composite array is assembled and no handle is resolved until one
    /// of the storage accessors is first called.
    ///
    /// # Parameters
    ///
    ///   - `aval`: Logical shape and element type of the array.
    ///   - `sharding_spec`: Sharding of the array, which must imply as many devices as there are `device_buffers`.
    ///   - `device_buffers`: Per-device handles, one per shard, of which the array takes shared ownership.
    ///   - `indices`: Per-shard indices into the logical array, in the same order as `device_buffers`.
    ///   - `weak_type`: Whether the element type of the array is weakly typed (i.e., it was inferred from a host
    ///     scalar and can be implicitly promoted).
    pub fn new<I: IntoIterator<Item = Arc<dyn DeviceBuffer>>>(
        aval: Aval,
        sharding_spec: ShardingSpec,
        device_buffers: I,
        indices: Vec<ShardIndex>,
        weak_type: bool,
    ) -> Result<Self, Error> {
        let allocation_failure =
            |_: TryReserveError| Error::allocation_failure("the device buffers of a sharded device array");
        let device_buffers = device_buffers.into_iter();
        let mut buffers = Vec::new();
        buffers.try_reserve_exact(device_buffers.size_hint().0).map_err(allocation_failure)?;
        for device_buffer in device_buffers {
            // Iterators may under-report their length, in which case the initial reservation is not enough.
            buffers.try_reserve(1).map_err(allocation_failure)?;
            buffers.push(device_buffer);
        }

        if sharding_spec.device_count() != Some(buffers.len()) {
            debug!(
                "creating a sharded device array with {} device buffer(s) for a sharding that implies {:?} device(s)",
                buffers.len(),
                sharding_spec.device_count(),
            );
        }
        debug!("created sharded device array {aval} with {} shard(s) ({})", buffers.len(), R::NAME);

        Ok(Self {
            aval,
            sharding_spec,
            indices,
            weak_type,
            storage: ShardStorage::new(buffers),
            host_snapshot: None,
            replica_index_hint: None,
            representation: PhantomData,
        })
    }

    /// Creates a new [`ShardedDeviceArray`] from a [`ShardedBuffer`], using its per-device buffers (in its device
    /// order) as the shards of the new array. Refer to [`ShardedDeviceArray::new`] for the other parameters.
    pub fn from_sharded_buffer(
        aval: Aval,
        sharding_spec: ShardingSpec,
        sharded_buffer: &dyn ShardedBuffer,
        indices: Vec<ShardIndex>,
        weak_type: bool,
    ) -> Result<Self, Error> {
        let device_count = sharded_buffer.device_count();
        let mut device_buffers = Vec::new();
        device_buffers
            .try_reserve_exact(device_count)
            .map_err(|_| Error::allocation_failure("the device buffers of a sharded buffer"))?;
        for index in 0..device_count {
            device_buffers.push(sharded_buffer.device_buffer(index)?);
        }
        Self::new(aval, sharding_spec, device_buffers, indices, weak_type)
    }

    /// Abstract value (i.e., logical shape and element type) of this array.
    pub fn aval(&self) -> &Aval {
        &self.aval
    }

    /// Sharding specification of this array.
    pub fn sharding_spec(&self) -> &ShardingSpec {
        &self.sharding_spec
    }

    /// Per-shard indices into the logical array, in shard order.
    pub fn indices(&self) -> &[ShardIndex] {
        self.indices.as_slice()
    }

    /// Returns `true` if the element type of this array is weakly typed.
    pub fn weak_type(&self) -> bool {
        self.weak_type
    }

    /// Logical shape of this array.
    pub fn shape(&self) -> &[usize] {
        self.aval.shape()
    }

    /// Element type of this array.
    pub fn element_type(&self) -> ElementType {
        self.aval.element_type()
    }

    /// Number of elements in this array, or [`None`] if it does not fit in a [`usize`].
    pub fn size(&self) -> Option<usize> {
        self.aval.size()
    }

    /// Number of dimensions of this array.
    pub fn ndim(&self) -> usize {
        self.aval.ndim()
    }

    /// Returns `true` if [`ShardedDeviceArray::delete`] has been called on this array.
    pub fn is_deleted(&self) -> bool {
        self.storage.is_released()
    }

    /// Per-device handles of this array, in shard order. Fails with [`Error::AlreadyDeleted`] after deletion.
    pub fn device_buffers(&self) -> Result<&[Arc<dyn DeviceBuffer>], Error> {
        self.storage.device_buffers()
    }

    /// Raw per-shard buffers of this array, in shard order.
    ///
    /// These are derived once and cached. Fails with [`Error::AlreadyDeleted`] after deletion, and with
    /// [`Error::BackendIncompatible`] if the composite array of a runtime whose primary representation is
    /// composite arrays is not backed by one buffer per shard.
    pub fn buffers(&mut self) -> Result<&[Arc<dyn Buffer>], Error> {
        R::buffers(&mut self.storage, self.aval.shape())
    }

    /// Composite array that represents all shards of this array as a single array with the shape of this array.
    ///
    /// It is assembled once, on first use, using the client of the first shard, and it aliases the storage of the
    /// shards instead of copying it. Fails with [`Error::AlreadyDeleted`] after deletion and with
    /// [`Error::EmptyDeviceBuffers`] if this array has no shards.
    pub fn assembled_array(&mut self) -> Result<Arc<dyn RuntimeArray>, Error> {
        self.storage.assembled_array(self.aval.shape())
    }

    /// Releases the device memory of this array. This function never fails and calling it more than once has no
    /// additional effect.
    ///
    /// One deletion request is issued for each shard, using whichever view of the shards is cached or can be
    /// derived. If no such view can be derived, the array is still marked as deleted but its shards are not
    /// released explicitly. Their memory is then only reclaimed once every other reference to them is dropped.
    /// In either case, the per-device handles, all cached views, and the host snapshot are dropped.
    pub fn delete(&mut self) {
        if self.is_deleted() {
            return;
        }
        match R::delete_shards(&mut self.storage, self.aval.shape()) {
            Ok(count) => debug!("deleted sharded device array {} ({count} deletion request(s))", self.aval),
            Err(error) => warn!("marking sharded device array {} as deleted without releasing it: {error}", self.aval),
        }
        self.storage.release();
        self.host_snapshot = None;
    }

    /// Cached host copy of this array, if one has been set.
    pub fn host_snapshot(&self) -> Option<&HostSnapshot> {
        self.host_snapshot.as_ref()
    }

    /// Sets (or clears) the cached host copy of this array. It is cleared when the array is deleted.
    pub fn set_host_snapshot(&mut self, host_snapshot: Option<HostSnapshot>) {
        self.host_snapshot = host_snapshot;
    }

    /// Indices of a set of shards that together hold one full replica of this array, if they have been set.
    pub fn replica_index_hint(&self) -> Option<&[usize]> {
        self.replica_index_hint.as_deref()
    }

    /// Sets (or clears) the indices of a set of shards that together hold one full replica of this array.
    pub fn set_replica_index_hint(&mut self, replica_index_hint: Option<Vec<usize>>) {
        self.replica_index_hint = replica_index_hint;
    }
}

impl<R: Representation> std::fmt::Debug for ShardedDeviceArray<R> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ShardedDeviceArray")
            .field("aval", &self.aval)
            .field("sharding_spec", &self.sharding_spec)
            .field("shard_count", &self.storage.device_buffers().map(<[_]>::len).ok())
            .field("weak_type", &self.weak_type)
            .field("representation", &R::NAME)
            .field("is_deleted", &self.is_deleted())
            .finish()
    }
}
