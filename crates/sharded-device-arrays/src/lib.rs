//! Logical arrays whose storage is sharded across multiple devices.
//!
//! The central type is [`ShardedDeviceArray`], which holds one per-device handle per shard together with the
//! sharding metadata of the array, lazily derives the per-shard buffer list and the assembled composite array that
//! device runtimes consume, and releases device memory through an explicit, idempotent deletion protocol.
//!
//! Device runtimes plug in through the traits in [`buffers`] and [`runtime`]. The [`host`] module provides an
//! implementation of those traits that is backed by host memory.

pub mod arrays;
pub mod bindings;
pub mod buffers;
pub mod errors;
pub mod host;
pub mod representations;
pub mod runtime;
pub mod sharding;
pub mod types;

pub use arrays::*;
pub use bindings::*;
pub use buffers::*;
pub use errors::*;
pub use representations::*;
pub use runtime::*;
pub use sharding::*;
pub use types::*;
