/// Transfer direction and the caller's buffer.
#[derive(Debug)]
pub enum BufData<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// A block I/O request handed to strategy.
///
/// `resid` counts the bytes not yet transferred; after a failed request it
/// tells the caller how far the transfer got.
#[derive(Debug)]
pub struct Buf<'a> {
    pub offset: u64,
    pub data: BufData<'a>,
    pub resid: usize,
}

impl<'a> Buf<'a> {
    pub fn read(offset: u64, buf: &'a mut [u8]) -> Self {
        let resid = buf.len();
        Self {
            offset,
            data: BufData::Read(buf),
            resid,
        }
    }

    pub fn write(offset: u64, data: &'a [u8]) -> Self {
        let resid = data.len();
        Self {
            offset,
            data: BufData::Write(data),
            resid,
        }
    }

    /// Requested byte count.
    pub fn bcount(&self) -> usize {
        match &self.data {
            BufData::Read(buf) => buf.len(),
            BufData::Write(data) => data.len(),
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self.data, BufData::Read(_))
    }

    /// Bytes transferred so far.
    pub fn done(&self) -> usize {
        self.bcount() - self.resid
    }
}
