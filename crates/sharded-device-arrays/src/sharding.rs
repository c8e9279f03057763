//! Sharding metadata for sharded device arrays.
//!
//! [`ShardingSpec`] describes how the logical index space of an array is split across devices: each array dimension
//! is either unsharded, chunked, or unstacked, and the resulting sharded axes (together with any replication) are
//! laid out over a logical device mesh. This crate consumes sharding specifications but does not compute them.
//!
//! [`OpaqueSharding`] is the sharding that is built when the shards of an array are assembled into a single
//! composite runtime array: an ordered device list paired with a [`DisassemblyFunction`] that describes how to split
//! the composite array back into its shards.

use std::sync::Arc;

use crate::buffers::DeviceId;
use crate::errors::Error;

/// Sharding of one logical array dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShardingDimension {
    /// Dimension is not sharded.
    NoSharding,

    /// Dimension is split into equally sized chunks. Multiple entries represent nested chunking from major to minor,
    /// each of which corresponds to its own sharded mesh axis.
    Chunked(Vec<usize>),

    /// Dimension of the provided size is removed and each of its entries is placed on a different shard.
    Unstacked(usize),
}

/// Assignment of one logical device mesh dimension.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MeshDimensionAssignment {
    /// Mesh dimension iterates over the sharded axis with the provided index. Sharded axes are numbered in the order
    /// in which they appear in [`ShardingSpec::sharding`] (flattening nested [`ShardingDimension::Chunked`] entries).
    ShardedAxis(usize),

    /// Mesh dimension holds the provided number of replicas of every shard.
    Replicated(usize),
}

/// Mapping from the logical index space of an array to per-device shards.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShardingSpec {
    sharding: Vec<ShardingDimension>,
    mesh_mapping: Vec<MeshDimensionAssignment>,
}

impl ShardingSpec {
    /// Creates a new [`ShardingSpec`]. No validation is performed since sharding specifications are produced by
    /// the (external) sharding assignment logic.
    pub fn new(sharding: Vec<ShardingDimension>, mesh_mapping: Vec<MeshDimensionAssignment>) -> Self {
        Self { sharding, mesh_mapping }
    }

    /// Creates a [`ShardingSpec`] for an array of rank `rank` that is replicated on `replicas` devices.
    pub fn replicated(rank: usize, replicas: usize) -> Self {
        Self {
            sharding: vec![ShardingDimension::NoSharding; rank],
            mesh_mapping: vec![MeshDimensionAssignment::Replicated(replicas)],
        }
    }

    /// Creates a [`ShardingSpec`] for an array of rank `rank` whose first dimension is split into `chunks` chunks
    /// that are each placed on a different device.
    pub fn chunked(rank: usize, chunks: usize) -> Self {
        let mut sharding = vec![ShardingDimension::NoSharding; rank];
        if let Some(dimension) = sharding.first_mut() {
            *dimension = ShardingDimension::Chunked(vec![chunks]);
        }
        Self { sharding, mesh_mapping: vec![MeshDimensionAssignment::ShardedAxis(0)] }
    }

    /// Per-dimension shardings.
    pub fn sharding(&self) -> &[ShardingDimension] {
        self.sharding.as_slice()
    }

    /// Logical device mesh dimension assignments.
    pub fn mesh_mapping(&self) -> &[MeshDimensionAssignment] {
        self.mesh_mapping.as_slice()
    }

    /// Sizes of all sharded axes, in the order in which [`MeshDimensionAssignment::ShardedAxis`] refers to them.
    pub fn sharded_axis_sizes(&self) -> Vec<usize> {
        self.sharding
            .iter()
            .flat_map(|dimension| match dimension {
                ShardingDimension::NoSharding => Vec::new(),
                ShardingDimension::Chunked(chunks) => chunks.clone(),
                ShardingDimension::Unstacked(size) => vec![*size],
            })
            .collect()
    }

    /// Returns the number of devices that this [`ShardingSpec`] places shards on (i.e., the product of the sizes of
    /// all mesh dimensions), or [`None`] if the mesh mapping refers to a sharded axis that does not exist or if
    /// the device count does not fit in a [`usize`].
    pub fn device_count(&self) -> Option<usize> {
        let sharded_axis_sizes = self.sharded_axis_sizes();
        self.mesh_mapping.iter().try_fold(1usize, |count, assignment| {
            let size = match assignment {
                MeshDimensionAssignment::ShardedAxis(axis) => *sharded_axis_sizes.get(*axis)?,
                MeshDimensionAssignment::Replicated(replicas) => *replicas,
            };
            count.checked_mul(size)
        })
    }
}

/// Half-open slice `[start, end)` for one logical array dimension in a shard.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShardSlice {
    start: usize,
    end: usize,
}

impl ShardSlice {
    /// Creates a new shard slice. Returns [`None`] if `start > end`.
    pub fn new(start: usize, end: usize) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Creates a slice that covers a whole dimension of size `size`.
    pub fn full(size: usize) -> Self {
        Self { start: 0, end: size }
    }

    /// Inclusive start index.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Exclusive end index.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Length of this slice.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` iff this slice is empty.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Per-dimension index of one shard in the logical array. A sharded device array stores one [`ShardIndex`] per
/// device buffer, as provided by its creator.
pub type ShardIndex = Vec<ShardSlice>;

type DisassembleFn = dyn Fn(&[usize], usize) -> Result<Vec<Vec<usize>>, Error> + Send + Sync;

/// Function that splits the shape of a composite array into the shapes of its shards.
///
/// It receives the shape of the composite array and the number of devices of the sharding that it belongs to, and
/// returns one shard shape per device.
#[derive(Clone)]
pub struct DisassemblyFunction {
    function: Arc<DisassembleFn>,
}

impl DisassemblyFunction {
    /// Creates a new [`DisassemblyFunction`] from an arbitrary function.
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(&[usize], usize) -> Result<Vec<Vec<usize>>, Error> + Send + Sync + 'static,
    {
        Self { function: Arc::new(function) }
    }

    /// Creates a [`DisassemblyFunction`] that always produces `shapes`, regardless of the composite shape. Applying
    /// it to a sharding with a device count other than `shapes.len()` fails with [`Error::ShardCountMismatch`].
    pub fn from_shapes(shapes: Vec<Vec<usize>>) -> Self {
        Self::new(move |_, device_count| {
            if device_count != shapes.len() {
                return Err(Error::shard_count_mismatch(device_count, shapes.len()));
            }
            Ok(shapes.clone())
        })
    }

    /// Applies this function to a composite array `shape` that is sharded over `device_count` devices.
    pub fn apply(&self, shape: &[usize], device_count: usize) -> Result<Vec<Vec<usize>>, Error> {
        (self.function)(shape, device_count)
    }
}

impl std::fmt::Debug for DisassemblyFunction {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("DisassemblyFunction")
    }
}

/// Sharding of a composite array that is only known through its device list and its [`DisassemblyFunction`].
#[derive(Clone, Debug)]
pub struct OpaqueSharding {
    devices: Vec<DeviceId>,
    disassembly_function: DisassemblyFunction,
}

impl OpaqueSharding {
    /// Creates a new [`OpaqueSharding`].
    pub fn new(devices: Vec<DeviceId>, disassembly_function: DisassemblyFunction) -> Self {
        Self { devices, disassembly_function }
    }

    /// Devices of this sharding, in shard order.
    pub fn devices(&self) -> &[DeviceId] {
        self.devices.as_slice()
    }

    /// Number of devices of this sharding.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Splits a composite array `shape` into one `(shard shape, device)` pair per device of this sharding.
    pub fn disassemble(&self, shape: &[usize]) -> Result<Vec<(Vec<usize>, DeviceId)>, Error> {
        let shapes = self.disassembly_function.apply(shape, self.devices.len())?;
        if shapes.len() != self.devices.len() {
            return Err(Error::shard_count_mismatch(self.devices.len(), shapes.len()));
        }
        Ok(shapes.into_iter().zip(self.devices.iter().copied()).collect())
    }
}
