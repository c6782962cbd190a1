use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use super::{Buf, Ioctl, IoctlReply, ZDisk};
use crate::{
    arena::RegionSource,
    config::ZdConfig,
    error::{Error, Result},
};

/// Device number: disk unit plus partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevT {
    pub unit: u32,
    pub partition: u32,
}

impl DevT {
    pub fn new(unit: u32, partition: u32) -> Self {
        Self { unit, partition }
    }

    pub fn disk_unit(&self) -> u32 {
        self.unit
    }
}

/// Attached disks by unit number.
///
/// Owned by whoever wires the system together and passed to the entry
/// points below; there is no process-wide instance.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<u32, Arc<ZDisk>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a disk for `config.unit`
    pub fn attach(&self, config: ZdConfig) -> Result<Arc<ZDisk>> {
        let mut devices = self.devices.write()?;
        if devices.contains_key(&config.unit) {
            return Err(Error::Busy(format!("{} already attached", config.xname())));
        }
        let unit = config.unit;
        let disk = Arc::new(ZDisk::attach(config)?);
        devices.insert(unit, Arc::clone(&disk));
        Ok(disk)
    }

    /// Attach a disk whose backing memory comes from `source`
    pub fn attach_with_source(
        &self,
        config: ZdConfig,
        source: &mut dyn RegionSource,
    ) -> Result<Arc<ZDisk>> {
        let mut devices = self.devices.write()?;
        if devices.contains_key(&config.unit) {
            return Err(Error::Busy(format!("{} already attached", config.xname())));
        }
        let unit = config.unit;
        let disk = Arc::new(ZDisk::attach_with_source(config, source)?);
        devices.insert(unit, Arc::clone(&disk));
        Ok(disk)
    }

    pub fn lookup(&self, unit: u32) -> Result<Arc<ZDisk>> {
        self.devices
            .read()?
            .get(&unit)
            .cloned()
            .ok_or(Error::NoDevice(unit))
    }

    /// Detach and forget a disk. Its backing memory is released right away;
    /// handles still held elsewhere see `NoDevice`.
    pub fn detach(&self, unit: u32, force: bool) -> Result<()> {
        let mut devices = self.devices.write()?;
        let disk = devices.get(&unit).ok_or(Error::NoDevice(unit))?;
        disk.detach(force)?;
        devices.remove(&unit);
        Ok(())
    }

    pub fn units(&self) -> Result<Vec<u32>> {
        let mut units: Vec<_> = self.devices.read()?.keys().copied().collect();
        units.sort_unstable();
        Ok(units)
    }

    pub fn open(&self, dev: DevT) -> Result<()> {
        let disk = self.lookup(dev.disk_unit())?;
        disk.open()?;
        tracing::debug!(device = %disk.xname(), partition = dev.partition, "open");
        Ok(())
    }

    pub fn close(&self, dev: DevT) -> Result<()> {
        let disk = self.lookup(dev.disk_unit())?;
        disk.close()?;
        tracing::debug!(device = %disk.xname(), partition = dev.partition, "close");
        Ok(())
    }

    pub fn read(&self, dev: DevT, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.lookup(dev.disk_unit())?.read(offset, buf)
    }

    pub fn write(&self, dev: DevT, offset: u64, data: &[u8]) -> Result<usize> {
        self.lookup(dev.disk_unit())?.write(offset, data)
    }

    pub fn strategy(&self, dev: DevT, bp: &mut Buf<'_>) -> Result<()> {
        self.lookup(dev.disk_unit())?.strategy(bp)
    }

    pub fn ioctl(&self, dev: DevT, cmd: Ioctl) -> Result<IoctlReply> {
        self.lookup(dev.disk_unit())?.ioctl(cmd)
    }

    pub fn size(&self, dev: DevT) -> Result<u64> {
        self.lookup(dev.disk_unit())?.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::HeapSource;

    const BS: usize = 512;

    fn small_config(unit: u32) -> ZdConfig {
        ZdConfig::new(unit).disk_size(16 * BS).workers(2)
    }

    #[test]
    fn test_attach_and_lookup() {
        let registry = DeviceRegistry::new();
        let disk = registry.attach(small_config(0)).unwrap();
        registry.attach(small_config(3)).unwrap();

        assert_eq!(disk.xname(), "zd0");
        assert_eq!(registry.units().unwrap(), vec![0, 3]);
        assert_eq!(registry.lookup(3).unwrap().xname(), "zd3");
        assert!(matches!(registry.lookup(1), Err(Error::NoDevice(1))));
    }

    #[test]
    fn test_duplicate_unit_rejected() {
        let registry = DeviceRegistry::new();
        registry.attach(small_config(0)).unwrap();
        assert!(matches!(
            registry.attach(small_config(0)),
            Err(Error::Busy(_))
        ));
        assert_eq!(registry.units().unwrap(), vec![0]);
    }

    #[test]
    fn test_failed_attach_is_not_registered() {
        let registry = DeviceRegistry::new();
        let result = registry.attach_with_source(small_config(0), &mut HeapSource::with_limit(BS));
        assert!(matches!(result, Err(Error::Resource { .. })));
        assert!(registry.units().unwrap().is_empty());
    }

    #[test]
    fn test_entry_points() {
        let registry = DeviceRegistry::new();
        registry.attach(small_config(1)).unwrap();
        let dev = DevT::new(1, 3);

        registry.open(dev).unwrap();
        let data = vec![0x42u8; 2 * BS];
        assert_eq!(registry.write(dev, BS as u64, &data).unwrap(), 2 * BS);

        let mut out = vec![0u8; 2 * BS];
        let mut bp = Buf::read(BS as u64, &mut out);
        registry.strategy(dev, &mut bp).unwrap();
        assert_eq!(out, data);

        let mut out = vec![0xFFu8; BS];
        registry.read(dev, 0, &mut out).unwrap();
        assert_eq!(out, vec![0u8; BS]);

        assert_eq!(registry.size(dev).unwrap(), 16);
        assert_eq!(
            registry.ioctl(dev, Ioctl::CacheSync).unwrap(),
            IoctlReply::Done
        );
        registry.close(dev).unwrap();

        let missing = DevT::new(9, 0);
        assert!(matches!(registry.open(missing), Err(Error::NoDevice(9))));
        assert!(matches!(registry.size(missing), Err(Error::NoDevice(9))));
    }

    #[test]
    fn test_detach_frees_backing_behind_held_handle() {
        let registry = DeviceRegistry::new();
        let disk = registry.attach(small_config(0)).unwrap();
        registry.write(DevT::new(0, 0), 0, &[0x11u8; BS]).unwrap();
        assert_eq!(disk.stats().unwrap().live_blocks(), 1);
        assert_eq!(disk.region_count().unwrap(), 1);

        registry.detach(0, false).unwrap();

        assert!(matches!(disk.arena_usage(), Err(Error::NoDevice(0))));
        assert!(matches!(disk.region_count(), Err(Error::NoDevice(0))));
        assert!(matches!(disk.stats(), Err(Error::NoDevice(0))));
        assert!(matches!(disk.size(), Err(Error::NoDevice(0))));
    }

    #[test]
    fn test_detach() {
        let registry = DeviceRegistry::new();
        let disk = registry.attach(small_config(0)).unwrap();
        let dev = DevT::new(0, 0);

        registry.open(dev).unwrap();
        assert!(matches!(registry.detach(0, false), Err(Error::Busy(_))));
        assert_eq!(registry.units().unwrap(), vec![0]);

        registry.close(dev).unwrap();
        registry.detach(0, false).unwrap();
        assert!(registry.units().unwrap().is_empty());
        assert!(matches!(registry.open(dev), Err(Error::NoDevice(0))));

        // Stale handles see the device as gone
        assert!(disk.is_detached());
        assert!(matches!(disk.open(), Err(Error::NoDevice(0))));

        // The unit can be attached again, starting empty
        let fresh = registry.attach(small_config(0)).unwrap();
        let mut out = vec![0xFFu8; BS];
        fresh.read(0, &mut out).unwrap();
        assert_eq!(out, vec![0u8; BS]);
        assert_eq!(fresh.stats().unwrap().blkzero, 1);
    }
}
