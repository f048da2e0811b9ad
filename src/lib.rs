#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

use cfg_if::cfg_if;

mod config;
mod deferred;
mod error;
mod free_list;
mod interval;
mod mutex;
mod pool;
mod primary;
pub mod size_class;

pub use config::{Config, ConfigBuilder};
pub use deferred::DeferredQueueGuard;
pub use error::{Error, Result};
pub use interval::Interval;
pub use mutex::{LockingMechanism, ParkingLock, SpinLock};
pub use pool::{PoolAllocator, PoolStats};
pub use primary::{FailureHandler, PrimaryAllocator};

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use std::alloc::{AllocError, Allocator, Global};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator, Global};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
