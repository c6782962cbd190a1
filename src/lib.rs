//! Compressed RAM-backed block device.
//!
//! Fixed-size blocks are compressed on write and stored in an arena over
//! pre-reserved memory regions; reads decompress them again, and blocks that
//! were never written read as zeros.

pub mod arena;
pub mod blockmap;
pub mod codec;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;

pub use config::ZdConfig;
pub use device::{Buf, DevT, DeviceRegistry, Ioctl, IoctlReply, ZDisk};
pub use engine::{BlockEngine, BlockStore, EngineStats};
pub use error::{Error, Result};
