//! Device storage handles.
//!
//! Device memory is reached through three layers of handles, all of which are opaque to this crate:
//!
//!   - [`Buffer`]: raw device storage for one shard, owned by the device runtime.
//!   - [`DeviceBuffer`]: host-visible handle to one device-resident shard, which can be resolved either to its raw
//!     [`Buffer`] or to a single-device [`RuntimeArray`].
//!   - [`ShardedBuffer`]: host-visible composite object that holds one [`DeviceBuffer`] per device.
//!
//! All handles are shared through [`Arc`]s and are expected to be reference-counted by their owners.

use std::fmt::Debug;
use std::sync::Arc;

use crate::errors::Error;
use crate::runtime::RuntimeArray;
use crate::types::ElementType;

/// Global identifier of a device.
pub type DeviceId = usize;

/// Identity of a [`Buffer`]. Two buffer handles with the same [`BufferId`] refer to the same device storage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    /// Creates a new [`BufferId`].
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value of this [`BufferId`].
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Raw device storage for a single shard.
pub trait Buffer: Debug + Send + Sync {
    /// Identity of this [`Buffer`].
    fn id(&self) -> BufferId;

    /// Device on which this [`Buffer`] is placed.
    fn device(&self) -> DeviceId;

    /// Element type of the values stored in this [`Buffer`].
    fn element_type(&self) -> ElementType;

    /// Shape of the shard stored in this [`Buffer`].
    fn shape(&self) -> &[usize];

    /// Returns `true` if and only if this [`Buffer`] has been deleted using [`Buffer::delete`].
    fn is_deleted(&self) -> bool;

    /// Copies the contents of this [`Buffer`] to host memory, as a dense native-endian row-major byte buffer.
    fn copy_to_host(&self) -> Result<Vec<u8>, Error>;

    /// Releases the device memory of this [`Buffer`] without dropping the handle itself. After this function is
    /// called, only [`Buffer::is_deleted`] and the metadata accessors are meaningful on this [`Buffer`].
    fn delete(&self) -> Result<(), Error>;
}

/// Host-visible handle to one device-resident shard.
pub trait DeviceBuffer: Debug + Send + Sync {
    /// Device on which the shard is placed.
    fn device(&self) -> DeviceId;

    /// Resolves this handle to its raw [`Buffer`].
    fn buffer(&self) -> Result<Arc<dyn Buffer>, Error>;

    /// Resolves this handle to a single-device [`RuntimeArray`] that wraps the same device storage.
    fn array(&self) -> Result<Arc<dyn RuntimeArray>, Error>;
}

/// Host-visible composite object that holds one [`DeviceBuffer`] per device (e.g., the outputs of a computation
/// that was executed on multiple devices).
pub trait ShardedBuffer: Debug + Send + Sync {
    /// Number of devices that this [`ShardedBuffer`] spans.
    fn device_count(&self) -> usize;

    /// Returns the [`DeviceBuffer`] for the device at `index`, in the device order of this [`ShardedBuffer`].
    fn device_buffer(&self, index: usize) -> Result<Arc<dyn DeviceBuffer>, Error>;
}
