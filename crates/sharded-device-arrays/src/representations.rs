//! Backend representations of sharded storage.
//!
//! The shards of a [`ShardedDeviceArray`](crate::ShardedDeviceArray) can be reached in two ways:
//!
//!   - as a flat, ordered list of raw per-shard [`Buffer`]s, which is what per-shard operations consume, and
//!   - as a single composite [`RuntimeArray`] that is assembled from the per-device handles, which is what
//!     whole-array operations consume.
//!
//! Device runtimes use one of these as their primary representation and derive the other from it. A
//! [`Representation`] captures that choice. It is selected once for the whole build through the
//! `assembled-arrays` Cargo feature (see [`DefaultRepresentation`]) and never per array.

use std::fmt::Debug;
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::buffers::{Buffer, DeviceBuffer};
use crate::errors::Error;
use crate::runtime::{ArrayCopySemantics, RuntimeArray};
use crate::sharding::{DisassemblyFunction, OpaqueSharding};

/// Per-device handles of a sharded device array together with the lazily derived views of them.
///
/// Both caches are populated at most once and are only ever valid while the device handles are present. Releasing
/// the storage clears the handles and both caches at once.
#[derive(Debug)]
pub struct ShardStorage {
    device_buffers: Option<Vec<Arc<dyn DeviceBuffer>>>,
    assembled_array: Option<Arc<dyn RuntimeArray>>,
    buffers: Option<Vec<Arc<dyn Buffer>>>,
}

impl ShardStorage {
    pub(crate) fn new(device_buffers: Vec<Arc<dyn DeviceBuffer>>) -> Self {
        Self { device_buffers: Some(device_buffers), assembled_array: None, buffers: None }
    }

    pub(crate) fn is_released(&self) -> bool {
        self.device_buffers.is_none()
    }

    pub(crate) fn device_buffers(&self) -> Result<&[Arc<dyn DeviceBuffer>], Error> {
        self.device_buffers.as_deref().ok_or_else(Error::already_deleted)
    }

    /// Drops the per-device handles and both caches.
    pub(crate) fn release(&mut self) {
        self.buffers = None;
        self.assembled_array = None;
        self.device_buffers = None;
    }

    /// Returns the composite array that represents all shards, assembling it on first use.
    ///
    /// The composite array aliases the storage of the shards (i.e., it is assembled with
    /// [`ArrayCopySemantics::ReuseInput`]) and has the provided `shape`, which is the logical shape of the array.
    pub(crate) fn assembled_array(&mut self, shape: &[usize]) -> Result<Arc<dyn RuntimeArray>, Error> {
        if let Some(array) = &self.assembled_array {
            return Ok(array.clone());
        }

        let device_buffers = self.device_buffers.as_deref().ok_or_else(Error::already_deleted)?;
        if device_buffers.is_empty() {
            return Err(Error::empty_device_buffers());
        }

        let mut arrays = Vec::with_capacity(device_buffers.len());
        let mut shapes = Vec::with_capacity(device_buffers.len());
        let mut devices = Vec::with_capacity(device_buffers.len());
        for (shard_index, device_buffer) in device_buffers.iter().enumerate() {
            let array = device_buffer.array()?;
            // By convention, the first device of a single-device array is the one that holds its storage.
            let device = array.devices().first().copied().ok_or_else(|| {
                Error::backend(format!("the array of shard #{shard_index} is not placed on any device"))
            })?;
            trace!("resolved shard #{shard_index} to an array with shape {:?} on device {device}", array.shape());
            shapes.push(array.shape().to_vec());
            devices.push(device);
            arrays.push(array);
        }

        let client = arrays[0].client();
        let sharding = OpaqueSharding::new(devices, DisassemblyFunction::from_shapes(shapes));
        let array = client.assemble_array_from_single_device_arrays(
            shape.to_vec(),
            sharding,
            arrays.as_slice(),
            ArrayCopySemantics::ReuseInput,
        )?;
        debug!("assembled a composite array with shape {shape:?} from {} shard(s)", arrays.len());
        self.assembled_array = Some(array.clone());
        Ok(array)
    }

    /// Returns the raw per-shard buffers by resolving each per-device handle, on first use.
    fn buffers_from_device_buffers(&mut self) -> Result<&[Arc<dyn Buffer>], Error> {
        let buffers = match self.buffers.take() {
            Some(buffers) => buffers,
            None => {
                let device_buffers = self.device_buffers.as_deref().ok_or_else(Error::already_deleted)?;
                let buffers = device_buffers
                    .iter()
                    .map(|device_buffer| device_buffer.buffer())
                    .collect::<Result<Vec<_>, _>>()?;
                debug!("resolved {} per-shard buffer(s) from device buffers", buffers.len());
                buffers
            }
        };
        Ok(self.buffers.insert(buffers).as_slice())
    }

    /// Returns the raw per-shard buffers by viewing the composite array as a list of buffers, on first use.
    fn buffers_from_assembled_array(&mut self, shape: &[usize]) -> Result<&[Arc<dyn Buffer>], Error> {
        let buffers = match self.buffers.take() {
            Some(buffers) => buffers,
            None => {
                let array = self.assembled_array(shape)?;
                let array = array
                    .as_buffer_backed()
                    .ok_or_else(|| Error::backend_incompatible("per-shard buffer access"))?;
                let buffers = array.buffers();
                debug!("extracted {} per-shard buffer(s) from the composite array", buffers.len());
                buffers
            }
        };
        Ok(self.buffers.insert(buffers).as_slice())
    }
}

/// Issues one deletion request per buffer. Failures are logged and do not stop the remaining deletions.
fn delete_buffers(buffers: &[Arc<dyn Buffer>]) -> usize {
    for buffer in buffers {
        if let Err(error) = buffer.delete() {
            warn!("failed to delete buffer {} on device {}: {error}", buffer.id(), buffer.device());
        }
    }
    buffers.len()
}

/// Strategy for deriving the per-shard buffer list of a sharded device array and for releasing its shards.
pub trait Representation: Debug + 'static {
    /// Name of this representation, used in log messages.
    const NAME: &'static str;

    /// Returns the raw per-shard buffers of `storage`, in shard order, deriving and caching them on first use.
    /// `shape` is the logical shape of the array.
    fn buffers<'s>(storage: &'s mut ShardStorage, shape: &[usize]) -> Result<&'s [Arc<dyn Buffer>], Error>;

    /// Issues deletion requests for the shards of `storage` and returns the number of requests that were issued.
    /// Fails, without issuing any requests, if the shards cannot currently be derived.
    fn delete_shards(storage: &mut ShardStorage, shape: &[usize]) -> Result<usize, Error>;
}

/// [`Representation`] for runtimes whose primary representation is the list of per-shard buffers. Per-shard
/// buffers are resolved directly from the per-device handles and composite arrays are only assembled on demand.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferRepresentation;

impl Representation for BufferRepresentation {
    const NAME: &'static str = "buffers";

    fn buffers<'s>(storage: &'s mut ShardStorage, _shape: &[usize]) -> Result<&'s [Arc<dyn Buffer>], Error> {
        storage.buffers_from_device_buffers()
    }

    fn delete_shards(storage: &mut ShardStorage, shape: &[usize]) -> Result<usize, Error> {
        Ok(delete_buffers(Self::buffers(storage, shape)?))
    }
}

/// [`Representation`] for runtimes whose primary representation is the composite array. Per-shard buffers are
/// extracted from the composite array, which only works for composite arrays that are backed by one buffer per
/// shard; for any other composite array, per-shard buffer access fails with [`Error::BackendIncompatible`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ArrayRepresentation;

impl Representation for ArrayRepresentation {
    const NAME: &'static str = "assembled arrays";

    fn buffers<'s>(storage: &'s mut ShardStorage, shape: &[usize]) -> Result<&'s [Arc<dyn Buffer>], Error> {
        storage.buffers_from_assembled_array(shape)
    }

    fn delete_shards(storage: &mut ShardStorage, shape: &[usize]) -> Result<usize, Error> {
        match Self::buffers(storage, shape).map(delete_buffers) {
            Ok(count) => Ok(count),
            Err(Error::BackendIncompatible { .. }) => {
                let array = storage.assembled_array(shape)?;
                array.delete()?;
                Ok(array.devices().len())
            }
            Err(error) => Err(error),
        }
    }
}

/// [`Representation`] used by [`ShardedDeviceArray`](crate::ShardedDeviceArray) unless another one is named
/// explicitly. This is [`ArrayRepresentation`] when the `assembled-arrays` feature is enabled and
/// [`BufferRepresentation`] otherwise.
#[cfg(feature = "assembled-arrays")]
pub type DefaultRepresentation = ArrayRepresentation;

/// [`Representation`] used by [`ShardedDeviceArray`](crate::ShardedDeviceArray) unless another one is named
/// explicitly. This is [`ArrayRepresentation`] when the `assembled-arrays` feature is enabled and
/// [`BufferRepresentation`] otherwise.
#[cfg(not(feature = "assembled-arrays"))]
pub type DefaultRepresentation = BufferRepresentation;
