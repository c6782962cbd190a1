use super::geometry::{DiskLabel, Geometry};

/// Disk control requests understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctl {
    /// Query write cache state
    GetCache,
    /// Flush the write cache
    CacheSync,
    GetGeometry,
    /// Capacity in bytes
    GetMediaSize,
    GetSectorSize,
    GetLabel,
    /// Anything else, by raw request code
    Other(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlReply {
    /// Request accepted, nothing to report
    Done,
    Geometry(Geometry),
    MediaSize(u64),
    SectorSize(u32),
    Label(DiskLabel),
}
