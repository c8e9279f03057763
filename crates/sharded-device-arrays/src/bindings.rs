//! Binding layer for dynamically typed hosts.
//!
//! Hosts that embed this crate (e.g., interpreters) pass values around without static types. [`HostObject`] is the
//! tagged union that such hosts exchange with this crate and [`ShardedDeviceArrayRef`] is the shared, reference-counted
//! handle through which they hold on to sharded device arrays. Host handles are single-threaded and are built on
//! [`Rc`] and [`RefCell`].

use std::cell::{Ref, RefCell, RefMut};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::arrays::ShardedDeviceArray;
use crate::buffers::{DeviceBuffer, ShardedBuffer};
use crate::errors::Error;
use crate::representations::{DefaultRepresentation, Representation};
use crate::sharding::{ShardIndex, ShardingSpec};
use crate::types::Aval;

/// Shared host handle to a [`ShardedDeviceArray`].
#[derive(Debug)]
pub struct ShardedDeviceArrayRef<R: Representation = DefaultRepresentation> {
    array: Rc<RefCell<ShardedDeviceArray<R>>>,
}

impl<R: Representation> ShardedDeviceArrayRef<R> {
    /// Wraps `array` in a new [`ShardedDeviceArrayRef`].
    pub fn new(array: ShardedDeviceArray<R>) -> Self {
        Self { array: Rc::new(RefCell::new(array)) }
    }

    /// Immutably borrows the underlying array. Panics if it is currently mutably borrowed.
    pub fn borrow(&self) -> Ref<'_, ShardedDeviceArray<R>> {
        self.array.borrow()
    }

    /// Mutably borrows the underlying array. Panics if it is currently borrowed.
    pub fn borrow_mut(&self) -> RefMut<'_, ShardedDeviceArray<R>> {
        self.array.borrow_mut()
    }

    /// Deletes the underlying array. Refer to [`ShardedDeviceArray::delete`] for details.
    pub fn delete(&self) {
        self.borrow_mut().delete()
    }

    /// Returns `true` if the underlying array has been deleted.
    pub fn is_deleted(&self) -> bool {
        self.borrow().is_deleted()
    }

    /// Creates a new [`WeakShardedDeviceArrayRef`] to the underlying array.
    pub fn downgrade(&self) -> WeakShardedDeviceArrayRef<R> {
        WeakShardedDeviceArrayRef { array: Rc::downgrade(&self.array) }
    }

    /// Returns `true` if both handles refer to the same array.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.array, &other.array)
    }
}

impl<R: Representation> Clone for ShardedDeviceArrayRef<R> {
    fn clone(&self) -> Self {
        Self { array: self.array.clone() }
    }
}

/// Weak host handle to a [`ShardedDeviceArray`] that does not keep it alive.
#[derive(Debug)]
pub struct WeakShardedDeviceArrayRef<R: Representation = DefaultRepresentation> {
    array: Weak<RefCell<ShardedDeviceArray<R>>>,
}

impl<R: Representation> WeakShardedDeviceArrayRef<R> {
    /// Returns a strong handle to the array, or [`None`] if every strong handle to it has been dropped.
    pub fn upgrade(&self) -> Option<ShardedDeviceArrayRef<R>> {
        self.array.upgrade().map(|array| ShardedDeviceArrayRef { array })
    }
}

impl<R: Representation> Clone for WeakShardedDeviceArrayRef<R> {
    fn clone(&self) -> Self {
        Self { array: self.array.clone() }
    }
}

/// Value exchanged with a dynamically typed host.
#[derive(Debug)]
pub enum HostObject<R: Representation = DefaultRepresentation> {
    None,
    DeviceBuffer(Arc<dyn DeviceBuffer>),
    DeviceBufferList(Vec<Arc<dyn DeviceBuffer>>),
    ShardedBuffer(Arc<dyn ShardedBuffer>),
    ShardedDeviceArray(ShardedDeviceArrayRef<R>),
}

impl<R: Representation> HostObject<R> {
    /// Name of the variant of this [`HostObject`], as reported in [`Error::WrongType`] errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::DeviceBuffer(_) => "DeviceBuffer",
            Self::DeviceBufferList(_) => "DeviceBufferList",
            Self::ShardedBuffer(_) => "ShardedBuffer",
            Self::ShardedDeviceArray(_) => "ShardedDeviceArray",
        }
    }
}

impl<R: Representation> Clone for HostObject<R> {
    fn clone(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::DeviceBuffer(buffer) => Self::DeviceBuffer(buffer.clone()),
            Self::DeviceBufferList(buffers) => Self::DeviceBufferList(buffers.clone()),
            Self::ShardedBuffer(buffer) => Self::ShardedBuffer(buffer.clone()),
            Self::ShardedDeviceArray(array) => Self::ShardedDeviceArray(array.clone()),
        }
    }
}

/// Creates a [`ShardedDeviceArray`] from a host object, which must be either a [`HostObject::DeviceBufferList`]
/// (see [`ShardedDeviceArray::new`]) or a [`HostObject::ShardedBuffer`] (see
/// [`ShardedDeviceArray::from_sharded_buffer`]). Any other host object results in an [`Error::WrongType`].
pub fn make<R: Representation>(
    aval: Aval,
    sharding_spec: ShardingSpec,
    buffers: HostObject<R>,
    indices: Vec<ShardIndex>,
    weak_type: bool,
) -> Result<HostObject<R>, Error> {
    let array = match buffers {
        HostObject::DeviceBufferList(device_buffers) => {
            ShardedDeviceArray::new(aval, sharding_spec, device_buffers, indices, weak_type)?
        }
        HostObject::ShardedBuffer(sharded_buffer) => {
            ShardedDeviceArray::from_sharded_buffer(aval, sharding_spec, sharded_buffer.as_ref(), indices, weak_type)?
        }
        other => return Err(Error::wrong_type("DeviceBufferList or ShardedBuffer", other.type_name())),
    };
    Ok(HostObject::ShardedDeviceArray(ShardedDeviceArrayRef::new(array)))
}

/// Returns `true` if `object` is a [`HostObject::ShardedDeviceArray`].
pub fn is_sharded_device_array<R: Representation>(object: &HostObject<R>) -> bool {
    matches!(object, HostObject::ShardedDeviceArray(_))
}

/// Returns the array held by `object`, which the caller guarantees to be a [`HostObject::ShardedDeviceArray`]
/// (e.g., using [`is_sharded_device_array`]).
///
/// # Panics
///
/// Panics if `object` holds any other variant.
pub fn as_sharded_device_array_unchecked<R: Representation>(object: &HostObject<R>) -> &ShardedDeviceArrayRef<R> {
    match object {
        HostObject::ShardedDeviceArray(array) => array,
        other => panic!("expected a ShardedDeviceArray host object but got {}", other.type_name()),
    }
}

/// Returns the array held by `object`, or an [`Error::WrongType`] if `object` is not a
/// [`HostObject::ShardedDeviceArray`].
pub fn as_sharded_device_array<R: Representation>(object: &HostObject<R>) -> Result<&ShardedDeviceArrayRef<R>, Error> {
    match object {
        HostObject::ShardedDeviceArray(array) => Ok(array),
        other => Err(Error::wrong_type("ShardedDeviceArray", other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::host::{HostClient, HostShardedBuffer};
    use crate::representations::BufferRepresentation;
    use crate::sharding::ShardSlice;
    use crate::types::ElementType;

    use super::*;

    fn device_buffers(client: &Arc<HostClient>, count: usize) -> Vec<Arc<dyn DeviceBuffer>> {
        (0..count)
            .map(|device| {
                let device_buffer = client.device_buffer_from_values(device, vec![1, 4], &[device as i32; 4]).unwrap();
                device_buffer as Arc<dyn DeviceBuffer>
            })
            .collect()
    }

    fn make_array(
        buffers: HostObject<BufferRepresentation>,
        count: usize,
    ) -> Result<HostObject<BufferRepresentation>, Error> {
        let indices = (0..count)
            .map(|shard| vec![ShardSlice::new(shard, shard + 1).unwrap(), ShardSlice::full(4)])
            .collect();
        make(Aval::new(vec![count, 4], ElementType::I32), ShardingSpec::chunked(2, count), buffers, indices, false)
    }

    #[test]
    fn test_make_from_device_buffer_list() {
        let _ = env_logger::builder().is_test(true).try_init();
        let client = HostClient::new();
        let object = make_array(HostObject::DeviceBufferList(device_buffers(&client, 3)), 3).unwrap();
        assert!(is_sharded_device_array(&object));
        assert_eq!(object.type_name(), "ShardedDeviceArray");

        let array = as_sharded_device_array(&object).unwrap();
        assert_eq!(array.borrow().shape(), &[3, 4]);
        assert_eq!(array.borrow().device_buffers().unwrap().len(), 3);
        assert_eq!(array.borrow_mut().buffers().unwrap().len(), 3);
    }

    #[test]
    fn test_make_from_sharded_buffer() {
        let client = HostClient::new();
        let device_buffers = (0..2)
            .map(|device| client.device_buffer_from_values(device, vec![1, 4], &[0i32; 4]).unwrap())
            .collect();
        let sharded_buffer = HostShardedBuffer::new(device_buffers);
        let object = make_array(HostObject::ShardedBuffer(sharded_buffer), 2).unwrap();
        let array = as_sharded_device_array_unchecked(&object);
        let devices = array.borrow().device_buffers().unwrap().iter().map(|buffer| buffer.device()).collect::<Vec<_>>();
        assert_eq!(devices, vec![0, 1]);
    }

    #[test]
    fn test_make_with_wrong_type() {
        let client = HostClient::new();
        let device_buffer = device_buffers(&client, 1).remove(0);
        assert!(matches!(
            make_array(HostObject::DeviceBuffer(device_buffer), 1),
            Err(Error::WrongType { actual, .. }) if actual == "DeviceBuffer",
        ));
        assert!(matches!(make_array(HostObject::None, 1), Err(Error::WrongType { .. })));

        let object = make_array(HostObject::DeviceBufferList(device_buffers(&client, 1)), 1).unwrap();
        assert!(matches!(
            make_array(object, 1),
            Err(Error::WrongType { actual, .. }) if actual == "ShardedDeviceArray",
        ));
    }

    #[test]
    fn test_sharded_device_array_casts() {
        let object = HostObject::<BufferRepresentation>::None;
        assert!(!is_sharded_device_array(&object));
        assert!(matches!(
            as_sharded_device_array(&object),
            Err(Error::WrongType { expected, actual, .. }) if expected == "ShardedDeviceArray" && actual == "None",
        ));
    }

    #[test]
    #[should_panic(expected = "expected a ShardedDeviceArray host object but got DeviceBufferList")]
    fn test_sharded_device_array_unchecked_cast_of_other_object() {
        let object = HostObject::<BufferRepresentation>::DeviceBufferList(Vec::new());
        as_sharded_device_array_unchecked(&object);
    }

    #[test]
    fn test_sharded_device_array_ref() {
        let client = HostClient::new();
        let object = make_array(HostObject::DeviceBufferList(device_buffers(&client, 2)), 2).unwrap();
        let array = as_sharded_device_array(&object).unwrap().clone();
        let cloned = object.clone();
        assert!(array.ptr_eq(as_sharded_device_array(&cloned).unwrap()));

        let weak = array.downgrade();
        assert!(weak.upgrade().unwrap().ptr_eq(&array));

        array.delete();
        assert!(array.is_deleted());
        assert!(as_sharded_device_array(&object).unwrap().is_deleted());
        assert!(matches!(array.borrow_mut().buffers(), Err(Error::AlreadyDeleted { .. })));

        drop(array);
        drop(cloned);
        assert!(weak.upgrade().is_some());
        drop(object);
        assert!(weak.upgrade().is_none());
    }
}
