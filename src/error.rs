use std::{io, sync::PoisonError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Not enough backing memory could be reserved at attach.
    #[error("Insufficient memory: requested {requested} bytes, acquired {acquired} bytes")]
    Resource { requested: u64, acquired: u64 },

    /// The arena had no free segment large enough for a compressed block.
    #[error("No space for block {blkno}: {size} compressed bytes")]
    OutOfSpace { blkno: u64, size: usize },

    #[error("Transfer of {count} bytes at offset {offset} is not aligned to {block_size} bytes")]
    Alignment {
        offset: u64,
        count: usize,
        block_size: usize,
    },

    #[error("Blocks {blkno}..+{count} exceed device capacity of {capacity} blocks")]
    OutOfRange { blkno: u64, count: u64, capacity: u64 },

    #[error("Corrupted payload for block {blkno}: {reason}")]
    Corrupted { blkno: u64, reason: String },

    #[error("Codec failure: {0}")]
    Codec(io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid span at {base:#x} of {len} bytes")]
    InvalidSpan { base: u64, len: u64 },

    #[error("Mutex was poisoned")]
    MutexPoisoned,

    #[error("No such device: zd{0}")]
    NoDevice(u32),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Unsupported ioctl {0:#x}")]
    NotSupported(u64),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl Error {
    /// The errno a host I/O completion would carry for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::IoError(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Error::Resource { .. } => libc::ENOMEM,
            Error::OutOfSpace { .. } => libc::EIO,
            Error::Alignment { .. } => libc::EIO,
            Error::OutOfRange { .. } => libc::EINVAL,
            Error::Corrupted { .. } => libc::EIO,
            Error::Codec(_) => libc::ENXIO,
            Error::InvalidConfig(_) => libc::EINVAL,
            Error::InvalidSpan { .. } => libc::EINVAL,
            Error::MutexPoisoned => libc::EIO,
            Error::NoDevice(_) => libc::ENXIO,
            Error::Busy(_) => libc::EBUSY,
            Error::NotSupported(_) => libc::ENOTTY,
            Error::InvalidOperation(_) => libc::EINVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_errno_mapping() {
        let err = Error::OutOfSpace { blkno: 3, size: 521 };
        assert_eq!(err.errno(), libc::EIO);

        let err = Error::Resource {
            requested: 1024,
            acquired: 512,
        };
        assert_eq!(err.errno(), libc::ENOMEM);
        assert_eq!(Error::NoDevice(1).errno(), libc::ENXIO);
        assert_eq!(Error::NotSupported(0x42).errno(), libc::ENOTTY);
    }

    #[test]
    fn test_poison_conversion() {
        let lock = std::sync::Arc::new(Mutex::new(0u32));
        let poisoner = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        let err: Error = lock.lock().unwrap_err().into();
        assert!(matches!(err, Error::MutexPoisoned));
    }

    #[test]
    fn test_display() {
        let err = Error::Alignment {
            offset: 100,
            count: 512,
            block_size: 512,
        };
        assert_eq!(
            err.to_string(),
            "Transfer of 512 bytes at offset 100 is not aligned to 512 bytes"
        );
    }
}
