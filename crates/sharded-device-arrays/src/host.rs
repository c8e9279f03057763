//! Host-memory backend.
//!
//! This backend implements the [`Buffer`], [`DeviceBuffer`], [`ShardedBuffer`], [`RuntimeArray`], and
//! [`RuntimeClient`] traits using plain host memory, with "devices" being nothing more than the [`DeviceId`]s that
//! buffers are tagged with. It is useful for running sharded-array logic without accelerators and it records how
//! often handles are resolved and buffers are deleted, which makes the lazy derivation and deletion protocols of
//! [`ShardedDeviceArray`](crate::ShardedDeviceArray) observable.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::trace;

use crate::buffers::{Buffer, BufferId, DeviceBuffer, DeviceId, ShardedBuffer};
use crate::errors::Error;
use crate::runtime::{ArrayCopySemantics, BufferBackedArray, RuntimeArray, RuntimeClient};
use crate::sharding::OpaqueSharding;
use crate::types::{Aval, Element, ElementType, values_from_bytes, values_to_bytes};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

/// [`Buffer`] stored in host memory.
#[derive(Debug)]
pub struct HostBuffer {
    id: BufferId,
    device: DeviceId,
    aval: Aval,
    data: Mutex<Option<Vec<u8>>>,
    deletion_requests: AtomicUsize,
}

impl HostBuffer {
    /// Creates a new [`HostBuffer`] on `device` from native-endian `bytes`, checking that their length matches the
    /// provided element type and shape. Fails with [`Error::SizeOverflow`] if the implied length does not fit in a
    /// [`usize`].
    pub fn new(
        device: DeviceId,
        element_type: ElementType,
        shape: Vec<usize>,
        bytes: Vec<u8>,
    ) -> Result<Arc<Self>, Error> {
        let aval = Aval::new(shape, element_type);
        let expected = aval.size_in_bytes().ok_or_else(|| Error::size_overflow(&aval))?;
        if bytes.len() != expected {
            return Err(Error::byte_length_mismatch(expected, bytes.len()));
        }
        let id = BufferId::new(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed));
        Ok(Arc::new(Self {
            id,
            device,
            aval,
            data: Mutex::new(Some(bytes)),
            deletion_requests: AtomicUsize::new(0),
        }))
    }

    /// Creates a new [`HostBuffer`] on `device` with the provided `shape` that holds `values`.
    pub fn from_values<T: Element>(device: DeviceId, shape: Vec<usize>, values: &[T]) -> Result<Arc<Self>, Error> {
        Self::new(device, T::ELEMENT_TYPE, shape, values_to_bytes(values))
    }

    /// Returns the contents of this buffer as values of type `T`, in row-major order.
    pub fn to_values<T: Element>(&self) -> Result<Vec<T>, Error> {
        if T::ELEMENT_TYPE != self.aval.element_type() {
            return Err(Error::element_type_mismatch(self.aval.element_type(), T::ELEMENT_TYPE));
        }
        Ok(values_from_bytes(self.copy_to_host()?.as_slice()))
    }

    /// Number of times [`Buffer::delete`] has been called on this buffer.
    pub fn deletion_request_count(&self) -> usize {
        self.deletion_requests.load(Ordering::SeqCst)
    }

    fn data(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Buffer for HostBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn device(&self) -> DeviceId {
        self.device
    }

    fn element_type(&self) -> ElementType {
        self.aval.element_type()
    }

    fn shape(&self) -> &[usize] {
        self.aval.shape()
    }

    fn is_deleted(&self) -> bool {
        self.data().is_none()
    }

    fn copy_to_host(&self) -> Result<Vec<u8>, Error> {
        self.data().clone().ok_or_else(|| {
            Error::backend(format!("host buffer {} on device {} has been deleted", self.id, self.device))
        })
    }

    fn delete(&self) -> Result<(), Error> {
        self.deletion_requests.fetch_add(1, Ordering::SeqCst);
        self.data().take();
        Ok(())
    }
}

/// [`RuntimeClient`] for [`HostArray`]s.
#[derive(Debug)]
pub struct HostClient {
    this: Weak<HostClient>,
    buffer_access: bool,
    assemblies: AtomicUsize,
}

impl HostClient {
    /// Creates a new [`HostClient`] whose composite arrays expose their per-shard buffers.
    pub fn new() -> Arc<Self> {
        Self::with_buffer_access(true)
    }

    /// Creates a new [`HostClient`] whose composite arrays do not expose their per-shard buffers (i.e., for which
    /// [`RuntimeArray::as_buffer_backed`] returns [`None`]). This models backends that do not store arrays as one
    /// buffer per shard. Single-device arrays created by this client still expose their buffers.
    pub fn without_buffer_access() -> Arc<Self> {
        Self::with_buffer_access(false)
    }

    fn with_buffer_access(buffer_access: bool) -> Arc<Self> {
        Arc::new_cyclic(|this| Self { this: this.clone(), buffer_access, assemblies: AtomicUsize::new(0) })
    }

    /// Number of composite arrays that this client has assembled.
    pub fn assembly_count(&self) -> usize {
        self.assemblies.load(Ordering::SeqCst)
    }

    /// Creates a [`HostDeviceBuffer`] for `buffer` that is owned by this client.
    pub fn device_buffer(self: &Arc<Self>, buffer: Arc<HostBuffer>) -> Arc<HostDeviceBuffer> {
        Arc::new(HostDeviceBuffer { client: self.clone(), buffer, resolutions: AtomicUsize::new(0) })
    }

    /// Creates a [`HostDeviceBuffer`] on `device` with the provided `shape` that holds `values`.
    pub fn device_buffer_from_values<T: Element>(
        self: &Arc<Self>,
        device: DeviceId,
        shape: Vec<usize>,
        values: &[T],
    ) -> Result<Arc<HostDeviceBuffer>, Error> {
        Ok(self.device_buffer(HostBuffer::from_values(device, shape, values)?))
    }

    fn this(&self) -> Result<Arc<Self>, Error> {
        self.this.upgrade().ok_or_else(|| Error::backend("host client has been dropped"))
    }
}

impl RuntimeClient for HostClient {
    fn assemble_array_from_single_device_arrays(
        &self,
        shape: Vec<usize>,
        sharding: OpaqueSharding,
        arrays: &[Arc<dyn RuntimeArray>],
        semantics: ArrayCopySemantics,
    ) -> Result<Arc<dyn RuntimeArray>, Error> {
        if arrays.len() != sharding.device_count() {
            return Err(Error::shard_count_mismatch(sharding.device_count(), arrays.len()));
        }
        let shards = sharding.disassemble(shape.as_slice())?;
        let element_type = arrays
            .first()
            .map(|array| array.element_type())
            .ok_or_else(|| Error::backend("cannot assemble an array from zero single-device arrays"))?;

        let mut buffers = Vec::with_capacity(arrays.len());
        for (array, (shard_shape, device)) in arrays.iter().zip(shards) {
            if array.element_type() != element_type {
                return Err(Error::element_type_mismatch(element_type, array.element_type()));
            }
            if array.devices() != [device] {
                return Err(Error::backend(format!(
                    "expected a single-device array on device {device} but got one on devices {:?}",
                    array.devices(),
                )));
            }
            if array.shape() != shard_shape.as_slice() {
                return Err(Error::backend(format!(
                    "expected a shard with shape {shard_shape:?} on device {device} but got one with shape {:?}",
                    array.shape(),
                )));
            }
            let buffer = match array.as_buffer_backed().map(|array| array.buffers()).as_deref() {
                Some([buffer]) => buffer.clone(),
                _ => return Err(Error::backend("host clients can only assemble single-buffer arrays")),
            };
            let buffer: Arc<dyn Buffer> = match semantics {
                ArrayCopySemantics::ReuseInput => buffer,
                ArrayCopySemantics::AlwaysCopy => HostBuffer::new(
                    buffer.device(),
                    buffer.element_type(),
                    buffer.shape().to_vec(),
                    buffer.copy_to_host()?,
                )?,
            };
            buffers.push(buffer);
        }

        self.assemblies.fetch_add(1, Ordering::SeqCst);
        trace!("assembled a host array with shape {shape:?} from {} shard(s) ({semantics:?})", buffers.len());
        Ok(Arc::new(HostArray {
            client: self.this()?,
            element_type,
            shape,
            devices: sharding.devices().to_vec(),
            buffers,
            buffer_access: self.buffer_access,
        }))
    }
}

/// [`RuntimeArray`] stored in host memory, either on a single device or assembled from multiple shards.
#[derive(Debug)]
pub struct HostArray {
    client: Arc<HostClient>,
    element_type: ElementType,
    shape: Vec<usize>,
    devices: Vec<DeviceId>,
    buffers: Vec<Arc<dyn Buffer>>,
    buffer_access: bool,
}

impl HostArray {
    /// Creates a single-device [`HostArray`] that wraps `buffer`.
    pub fn single_device(client: Arc<HostClient>, buffer: Arc<HostBuffer>) -> Arc<Self> {
        Arc::new(Self {
            client,
            element_type: buffer.element_type(),
            shape: buffer.shape().to_vec(),
            devices: vec![buffer.device()],
            buffers: vec![buffer as Arc<dyn Buffer>],
            buffer_access: true,
        })
    }
}

impl RuntimeArray for HostArray {
    fn client(&self) -> Arc<dyn RuntimeClient> {
        self.client.clone()
    }

    fn element_type(&self) -> ElementType {
        self.element_type
    }

    fn shape(&self) -> &[usize] {
        self.shape.as_slice()
    }

    fn devices(&self) -> &[DeviceId] {
        self.devices.as_slice()
    }

    fn is_deleted(&self) -> bool {
        self.buffers.iter().any(|buffer| buffer.is_deleted())
    }

    fn delete(&self) -> Result<(), Error> {
        self.buffers.iter().try_for_each(|buffer| buffer.delete())
    }

    fn as_buffer_backed(&self) -> Option<&dyn BufferBackedArray> {
        self.buffer_access.then_some(self as &dyn BufferBackedArray)
    }
}

impl BufferBackedArray for HostArray {
    fn buffers(&self) -> Vec<Arc<dyn Buffer>> {
        self.buffers.clone()
    }
}

/// [`DeviceBuffer`] that wraps a [`HostBuffer`].
#[derive(Debug)]
pub struct HostDeviceBuffer {
    client: Arc<HostClient>,
    buffer: Arc<HostBuffer>,
    resolutions: AtomicUsize,
}

impl HostDeviceBuffer {
    /// Underlying [`HostBuffer`].
    pub fn host_buffer(&self) -> &Arc<HostBuffer> {
        &self.buffer
    }

    /// Number of times this handle has been resolved through [`DeviceBuffer::buffer`] or [`DeviceBuffer::array`].
    pub fn resolution_count(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }
}

impl DeviceBuffer for HostDeviceBuffer {
    fn device(&self) -> DeviceId {
        self.buffer.device()
    }

    fn buffer(&self) -> Result<Arc<dyn Buffer>, Error> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        Ok(self.buffer.clone())
    }

    fn array(&self) -> Result<Arc<dyn RuntimeArray>, Error> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        Ok(HostArray::single_device(self.client.clone(), self.buffer.clone()))
    }
}

/// [`ShardedBuffer`] made out of [`HostDeviceBuffer`]s.
#[derive(Debug)]
pub struct HostShardedBuffer {
    device_buffers: Vec<Arc<HostDeviceBuffer>>,
}

impl HostShardedBuffer {
    /// Creates a new [`HostShardedBuffer`] with the provided per-device buffers, in device order.
    pub fn new(device_buffers: Vec<Arc<HostDeviceBuffer>>) -> Arc<Self> {
        Arc::new(Self { device_buffers })
    }

    /// Per-device buffers of this sharded buffer, in device order.
    pub fn device_buffers(&self) -> &[Arc<HostDeviceBuffer>] {
        self.device_buffers.as_slice()
    }
}

impl ShardedBuffer for HostShardedBuffer {
    fn device_count(&self) -> usize {
        self.device_buffers.len()
    }

    fn device_buffer(&self, index: usize) -> Result<Arc<dyn DeviceBuffer>, Error> {
        self.device_buffers
            .get(index)
            .map(|device_buffer| device_buffer.clone() as Arc<dyn DeviceBuffer>)
            .ok_or_else(|| {
                Error::backend(format!(
                    "device index {index} is out of range for a sharded buffer with {} device(s)",
                    self.device_buffers.len(),
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::sharding::DisassemblyFunction;

    use super::*;

    fn shard_arrays(client: &Arc<HostClient>, devices: &[DeviceId]) -> Vec<Arc<dyn RuntimeArray>> {
        devices
            .iter()
            .map(|&device| {
                let values = [device as f32; 4];
                client.device_buffer_from_values(device, vec![2, 2], &values).unwrap().array().unwrap()
            })
            .collect()
    }

    fn sharding(devices: &[DeviceId], shard_shape: &[usize]) -> OpaqueSharding {
        let shapes = vec![shard_shape.to_vec(); devices.len()];
        OpaqueSharding::new(devices.to_vec(), DisassemblyFunction::from_shapes(shapes))
    }

    fn buffer_ids(array: &dyn RuntimeArray) -> Vec<BufferId> {
        array.as_buffer_backed().unwrap().buffers().iter().map(|buffer| buffer.id()).collect()
    }

    #[test]
    fn test_host_buffer() {
        let buffer = HostBuffer::from_values(3, vec![2], &[1i32, 2]).unwrap();
        assert_eq!(buffer.device(), 3);
        assert_eq!(buffer.element_type(), ElementType::I32);
        assert_eq!(buffer.shape(), &[2]);
        assert_eq!(buffer.to_values::<i32>().unwrap(), vec![1, 2]);
        assert!(matches!(buffer.to_values::<u32>(), Err(Error::ElementTypeMismatch { .. })));
        assert!(!buffer.is_deleted());

        buffer.delete().unwrap();
        assert!(buffer.is_deleted());
        assert_eq!(buffer.deletion_request_count(), 1);
        assert!(matches!(buffer.copy_to_host(), Err(Error::Backend { .. })));

        assert!(matches!(
            HostBuffer::new(0, ElementType::F64, vec![3], vec![0u8; 16]),
            Err(Error::ByteLengthMismatch { expected: 24, actual: 16, .. }),
        ));
        assert!(matches!(
            HostBuffer::new(0, ElementType::U8, vec![usize::MAX, 2], Vec::new()),
            Err(Error::SizeOverflow { .. }),
        ));
        let other = HostBuffer::from_values(3, vec![2], &[1i32, 2]).unwrap();
        assert_ne!(buffer.id(), other.id());
    }

    #[test]
    fn test_host_client_assembly_reuses_input_buffers() {
        let client = HostClient::new();
        let arrays = shard_arrays(&client, &[0, 1]);
        let assembled = client
            .assemble_array_from_single_device_arrays(
                vec![4, 2],
                sharding(&[0, 1], &[2, 2]),
                arrays.as_slice(),
                ArrayCopySemantics::ReuseInput,
            )
            .unwrap();
        assert_eq!(client.assembly_count(), 1);
        assert_eq!(assembled.shape(), &[4, 2]);
        assert_eq!(assembled.devices(), &[0, 1]);
        assert_eq!(assembled.element_type(), ElementType::F32);
        let shard_ids = arrays.iter().flat_map(|array| buffer_ids(array.as_ref())).collect::<Vec<_>>();
        assert_eq!(buffer_ids(assembled.as_ref()), shard_ids);

        assembled.delete().unwrap();
        assert!(assembled.is_deleted());
        assert!(arrays.iter().all(|array| array.is_deleted()));
    }

    #[test]
    fn test_host_client_assembly_copies_input_buffers() {
        let client = HostClient::new();
        let arrays = shard_arrays(&client, &[2, 5]);
        let assembled = client
            .assemble_array_from_single_device_arrays(
                vec![4, 2],
                sharding(&[2, 5], &[2, 2]),
                arrays.as_slice(),
                ArrayCopySemantics::AlwaysCopy,
            )
            .unwrap();
        let shard_ids = arrays.iter().flat_map(|array| buffer_ids(array.as_ref())).collect::<Vec<_>>();
        let assembled_ids = buffer_ids(assembled.as_ref());
        assert!(assembled_ids.iter().all(|id| !shard_ids.contains(id)));
        let buffers = assembled.as_buffer_backed().unwrap().buffers();
        assert_eq!(buffers[1].device(), 5);
        assert_eq!(buffers[1].copy_to_host().unwrap(), values_to_bytes(&[5.0f32; 4]));

        assembled.delete().unwrap();
        assert!(arrays.iter().all(|array| !array.is_deleted()));
    }

    #[test]
    fn test_host_client_assembly_validation() {
        let client = HostClient::new();
        let arrays = shard_arrays(&client, &[0, 1]);
        assert!(matches!(
            client.assemble_array_from_single_device_arrays(
                vec![4, 2],
                sharding(&[0, 1, 2], &[2, 2]),
                arrays.as_slice(),
                ArrayCopySemantics::ReuseInput,
            ),
            Err(Error::ShardCountMismatch { expected: 3, actual: 2, .. }),
        ));
        assert!(matches!(
            client.assemble_array_from_single_device_arrays(
                vec![4, 2],
                sharding(&[1, 0], &[2, 2]),
                arrays.as_slice(),
                ArrayCopySemantics::ReuseInput,
            ),
            Err(Error::Backend { .. }),
        ));
        assert!(matches!(
            client.assemble_array_from_single_device_arrays(
                vec![2, 4],
                sharding(&[0, 1], &[1, 4]),
                arrays.as_slice(),
                ArrayCopySemantics::ReuseInput,
            ),
            Err(Error::Backend { .. }),
        ));
        assert_eq!(client.assembly_count(), 0);
    }

    #[test]
    fn test_host_client_without_buffer_access() {
        let client = HostClient::without_buffer_access();
        let arrays = shard_arrays(&client, &[0, 1]);
        assert!(arrays.iter().all(|array| array.as_buffer_backed().is_some()));
        let assembled = client
            .assemble_array_from_single_device_arrays(
                vec![4, 2],
                sharding(&[0, 1], &[2, 2]),
                arrays.as_slice(),
                ArrayCopySemantics::ReuseInput,
            )
            .unwrap();
        assert!(assembled.as_buffer_backed().is_none());
    }

    #[test]
    fn test_host_device_buffer_resolution() {
        let client = HostClient::new();
        let device_buffer = client.device_buffer_from_values(7, vec![3], &[1u8, 2, 3]).unwrap();
        assert_eq!(device_buffer.device(), 7);
        assert_eq!(device_buffer.resolution_count(), 0);
        assert_eq!(device_buffer.buffer().unwrap().id(), device_buffer.host_buffer().id());
        let array = device_buffer.array().unwrap();
        assert_eq!(array.devices(), &[7]);
        assert_eq!(array.shape(), &[3]);
        assert_eq!(device_buffer.resolution_count(), 2);
    }

    #[test]
    fn test_host_sharded_buffer() {
        let client = HostClient::new();
        let device_buffers = (0..3)
            .map(|device| client.device_buffer_from_values(device, vec![1], &[device as u32]).unwrap())
            .collect::<Vec<_>>();
        let sharded_buffer = HostShardedBuffer::new(device_buffers);
        assert_eq!(sharded_buffer.device_count(), 3);
        assert_eq!(sharded_buffer.device_buffers().len(), 3);
        assert_eq!(sharded_buffer.device_buffer(2).unwrap().device(), 2);
        assert!(matches!(sharded_buffer.device_buffer(3), Err(Error::Backend { .. })));
    }
}
