use crate::config::ZdConfig;

/// Synthetic disk geometry reported to the storage stack. Only
/// `secperunit` and `secsize` mean anything for a RAM disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Total number of sectors
    pub secperunit: u64,
    /// Bytes per sector
    pub secsize: u32,
    pub ntracks: u32,
    /// Sectors per track, one megabyte's worth
    pub nsectors: u32,
    pub ncylinders: u64,
}

impl Geometry {
    pub fn from_config(config: &ZdConfig) -> Self {
        let secsize = config.block_size as u32;
        let secperunit = config.block_count();
        let nsectors = (1024 * 1024 / config.block_size) as u32;
        Self {
            secperunit,
            secsize,
            ntracks: 1,
            nsectors,
            ncylinders: secperunit / nsectors as u64,
        }
    }

    /// Capacity in bytes.
    pub fn media_size(&self) -> u64 {
        self.secperunit * self.secsize as u64
    }
}

/// Partition type recorded in the label. The raw partition is always swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Swap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub offset: u64,
    pub size: u64,
    pub fstype: FsType,
}

/// Default label: one raw partition covering the whole disk, typed as swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLabel {
    pub typename: String,
    pub geometry: Geometry,
    pub raw: Partition,
}

impl DiskLabel {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            typename: "zd".to_string(),
            geometry,
            raw: Partition {
                offset: 0,
                size: geometry.secperunit,
                fstype: FsType::Swap,
            },
        }
    }
}
