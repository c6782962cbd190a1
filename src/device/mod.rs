//! Disk surface over the block engine.
//!
//! `ZDisk` is what a host storage stack talks to: it reference-counts opens,
//! validates and splits transfers into whole blocks, answers disk control
//! requests and reports a fixed synthetic geometry. It owns no compression
//! state itself.

pub mod buf;
pub mod geometry;
pub mod ioctl;
pub mod registry;

pub use buf::{Buf, BufData};
pub use geometry::{DiskLabel, FsType, Geometry, Partition};
pub use ioctl::{Ioctl, IoctlReply};
pub use registry::{DevT, DeviceRegistry};

use std::sync::{Mutex, RwLock};

use crate::{
    arena::{HeapSource, RegionSource},
    config::ZdConfig,
    engine::{BlockEngine, BlockStore, EngineStats},
    error::{Error, Result},
};

pub struct ZDisk {
    config: ZdConfig,
    xname: String,
    geometry: Geometry,
    label: DiskLabel,
    /// `None` once detached; dropping the engine releases the backing memory.
    engine: RwLock<Option<BlockEngine>>,
    /// Held across the attached check in `open` and `detach`.
    open_count: Mutex<usize>,
}

impl ZDisk {
    /// Attach with backing memory from the heap
    pub fn attach(config: ZdConfig) -> Result<Self> {
        let mut source = match config.memory_limit {
            Some(limit) => HeapSource::with_limit(limit),
            None => HeapSource::new(),
        };
        Self::attach_with_source(config, &mut source)
    }

    /// Attach with backing memory from a custom source
    pub fn attach_with_source(config: ZdConfig, source: &mut dyn RegionSource) -> Result<Self> {
        let xname = config.xname();
        let engine = match BlockEngine::new(&config, source) {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!(device = %xname, error = %e, "Attach failed");
                return Err(e);
            }
        };

        let geometry = Geometry::from_config(&config);
        let label = DiskLabel::new(geometry);

        tracing::info!(
            device = %xname,
            bytes = geometry.media_size(),
            regions = engine.region_count()?,
            workers = engine.codec_workers(),
            "{}: {} bytes",
            xname,
            geometry.media_size()
        );

        Ok(Self {
            config,
            xname,
            geometry,
            label,
            engine: RwLock::new(Some(engine)),
            open_count: Mutex::new(0),
        })
    }

    /// Stop accepting requests and release the arena, its regions and the
    /// block map. Refused while open unless `force` is set; waits for
    /// requests already in flight.
    pub fn detach(&self, force: bool) -> Result<()> {
        let opens = self.open_count.lock()?;
        self.check_attached()?;
        if *opens > 0 && !force {
            return Err(Error::Busy(format!("{} is open", self.xname)));
        }

        let engine = self
            .engine
            .write()?
            .take()
            .ok_or(Error::NoDevice(self.config.unit))?;
        let stats = engine.stats();
        let regions = engine.region_count()?;
        drop(engine);

        tracing::info!(
            device = %self.xname,
            opens = *opens,
            live_blocks = stats.live_blocks(),
            zused = stats.zused,
            regions,
            "detached"
        );
        Ok(())
    }

    pub fn open(&self) -> Result<()> {
        let mut opens = self.open_count.lock()?;
        self.check_attached()?;
        *opens += 1;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut opens = self.open_count.lock()?;
        *opens = opens
            .checked_sub(1)
            .ok_or_else(|| Error::InvalidOperation(format!("{} is not open", self.xname)))?;
        Ok(())
    }

    pub fn open_count(&self) -> Result<usize> {
        Ok(*self.open_count.lock()?)
    }

    /// Runs a block request to completion on the calling thread.
    ///
    /// The offset and byte count must both be multiples of the block size.
    /// Blocks are transferred in order; the first failing block ends the
    /// request with `bp.resid` covering it and everything after.
    pub fn strategy(&self, bp: &mut Buf<'_>) -> Result<()> {
        self.with_engine(|engine| self.run_request(engine, bp))
    }

    fn run_request(&self, engine: &BlockEngine, bp: &mut Buf<'_>) -> Result<()> {
        let bs = engine.block_size();
        let bcount = bp.bcount();
        bp.resid = bcount;

        if bp.offset % bs as u64 != 0 || bcount % bs != 0 {
            return Err(Error::Alignment {
                offset: bp.offset,
                count: bcount,
                block_size: bs,
            });
        }

        let blkno = bp.offset / bs as u64;
        let nblks = (bcount / bs) as u64;
        let capacity = self.geometry.secperunit;
        if blkno.checked_add(nblks).map_or(true, |end| end > capacity) {
            return Err(Error::OutOfRange {
                blkno,
                count: nblks,
                capacity,
            });
        }

        match &mut bp.data {
            BufData::Read(buf) => {
                for (i, block) in buf.chunks_exact_mut(bs).enumerate() {
                    engine.read_block(blkno + i as u64, block)?;
                    bp.resid -= bs;
                }
            }
            BufData::Write(data) => {
                for (i, block) in data.chunks_exact(bs).enumerate() {
                    engine.write_block(blkno + i as u64, block)?;
                    bp.resid -= bs;
                }
            }
        }

        Ok(())
    }

    /// Character-device read: splits into transfers of at most
    /// `max_transfer` bytes.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let max = self.config.max_transfer;
        let len = buf.len();
        for (i, chunk) in buf.chunks_mut(max).enumerate() {
            let mut bp = Buf::read(offset + (i * max) as u64, chunk);
            self.strategy(&mut bp)?;
        }
        Ok(len)
    }

    /// Character-device write, chunked like [`ZDisk::read`].
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let max = self.config.max_transfer;
        for (i, chunk) in data.chunks(max).enumerate() {
            let mut bp = Buf::write(offset + (i * max) as u64, chunk);
            self.strategy(&mut bp)?;
        }
        Ok(data.len())
    }

    pub fn ioctl(&self, cmd: Ioctl) -> Result<IoctlReply> {
        self.check_attached()?;
        match cmd {
            // No volatile write cache
            Ioctl::GetCache | Ioctl::CacheSync => Ok(IoctlReply::Done),
            Ioctl::GetGeometry => Ok(IoctlReply::Geometry(self.geometry)),
            Ioctl::GetMediaSize => Ok(IoctlReply::MediaSize(self.geometry.media_size())),
            Ioctl::GetSectorSize => Ok(IoctlReply::SectorSize(self.geometry.secsize)),
            Ioctl::GetLabel => Ok(IoctlReply::Label(self.label.clone())),
            Ioctl::Other(code) => Err(Error::NotSupported(code)),
        }
    }

    /// Size in blocks of the raw (swap) partition.
    pub fn size(&self) -> Result<u64> {
        self.check_attached()?;
        Ok(self.label.raw.size)
    }

    pub fn unit(&self) -> u32 {
        self.config.unit
    }

    pub fn xname(&self) -> &str {
        &self.xname
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn label(&self) -> &DiskLabel {
        &self.label
    }

    pub fn stats(&self) -> Result<EngineStats> {
        self.with_engine(|engine| Ok(engine.stats()))
    }

    /// Arena capacity and bytes in use.
    pub fn arena_usage(&self) -> Result<(u64, u64)> {
        self.with_engine(BlockEngine::arena_usage)
    }

    pub fn region_count(&self) -> Result<usize> {
        self.with_engine(BlockEngine::region_count)
    }

    pub fn collect_metrics(&self) -> Result<()> {
        self.with_engine(BlockEngine::collect_metrics)
    }

    pub fn is_detached(&self) -> bool {
        self.engine
            .read()
            .map_or(true, |engine| engine.is_none())
    }

    fn check_attached(&self) -> Result<()> {
        self.with_engine(|_| Ok(()))
    }

    /// Runs `f` against the engine, holding off detach until it returns.
    fn with_engine<T>(&self, f: impl FnOnce(&BlockEngine) -> Result<T>) -> Result<T> {
        let engine = self.engine.read()?;
        match engine.as_ref() {
            Some(engine) => f(engine),
            None => Err(Error::NoDevice(self.config.unit)),
        }
    }
}

impl std::fmt::Debug for ZDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZDisk")
            .field("xname", &self.xname())
            .field("geometry", &self.geometry)
            .field("open_count", &self.open_count().ok())
            .field("detached", &self.is_detached())
            .finish()
    }
}
