use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    ops::Range,
    path::Path,
    sync::Mutex,
};

use anyhow::{bail, Context, Result};

pub mod sector_constants {
    // The atomic transfer size for device I/O. Every read and write moves
    // exactly one sector.
    pub const SECTOR_SIZE: usize = 512;
}

use sector_constants::SECTOR_SIZE;

pub type SectorId = u32;

// A fixed-size-sector block device. Implementations are shared across the
// scheduler worker and any number of caller threads.
pub trait BlockDevice: Send + Sync {
    fn read_sector(&self, sector: SectorId, buf: &mut [u8]) -> Result<()>;
    fn write_sector(&self, sector: SectorId, buf: &[u8]) -> Result<()>;
    fn num_sectors(&self) -> u32;
}

// In-memory disk, used by tests and simulations.
pub struct MemDisk {
    sectors: Mutex<Vec<u8>>,
    num_sectors: u32,
}

impl MemDisk {
    pub fn new(num_sectors: u32) -> Self {
        MemDisk {
            sectors: Mutex::new(vec![0; num_sectors as usize * SECTOR_SIZE]),
            num_sectors,
        }
    }

    fn sector_range(&self, sector: SectorId, len: usize) -> Result<Range<usize>> {
        if sector >= self.num_sectors {
            bail!("sector {} out of range ({} sectors)", sector, self.num_sectors);
        }
        if len != SECTOR_SIZE {
            bail!("transfer of {} bytes, sectors are {} bytes", len, SECTOR_SIZE);
        }
        let start = sector as usize * SECTOR_SIZE;
        Ok(start..start + SECTOR_SIZE)
    }
}

impl BlockDevice for MemDisk {
    fn read_sector(&self, sector: SectorId, buf: &mut [u8]) -> Result<()> {
        let range = self.sector_range(sector, buf.len())?;
        let sectors = self.sectors.lock().unwrap();
        buf.copy_from_slice(&sectors[range]);
        Ok(())
    }

    fn write_sector(&self, sector: SectorId, buf: &[u8]) -> Result<()> {
        let range = self.sector_range(sector, buf.len())?;
        let mut sectors = self.sectors.lock().unwrap();
        sectors[range].copy_from_slice(buf);
        Ok(())
    }

    fn num_sectors(&self) -> u32 {
        self.num_sectors
    }
}

// Disk backed by an ordinary host file, one seek + transfer per sector.
pub struct FileDisk {
    file: Mutex<File>,
    num_sectors: u32,
}

impl FileDisk {
    pub fn create(path: impl AsRef<Path>, num_sectors: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .context("failed to create disk file")?;
        file.set_len(num_sectors as u64 * SECTOR_SIZE as u64)?;

        Ok(FileDisk {
            file: Mutex::new(file),
            num_sectors,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .context("failed to open disk file")?;

        let len = file.metadata()?.len();
        if len % SECTOR_SIZE as u64 != 0 {
            bail!("disk file length {} is not sector aligned", len);
        }

        Ok(FileDisk {
            file: Mutex::new(file),
            num_sectors: (len / SECTOR_SIZE as u64) as u32,
        })
    }

    fn check_transfer(&self, sector: SectorId, len: usize) -> Result<u64> {
        if sector >= self.num_sectors {
            bail!("sector {} out of range ({} sectors)", sector, self.num_sectors);
        }
        if len != SECTOR_SIZE {
            bail!("transfer of {} bytes, sectors are {} bytes", len, SECTOR_SIZE);
        }
        Ok(sector as u64 * SECTOR_SIZE as u64)
    }
}

impl BlockDevice for FileDisk {
    fn read_sector(&self, sector: SectorId, buf: &mut [u8]) -> Result<()> {
        let offset = self.check_transfer(sector, buf.len())?;
        let mut file = self.file.lock().unwrap();

        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("I/O error while seeking sector {}", sector))?;
        file.read_exact(buf)
            .with_context(|| format!("I/O error while reading sector {}", sector))?;

        Ok(())
    }

    fn write_sector(&self, sector: SectorId, buf: &[u8]) -> Result<()> {
        let offset = self.check_transfer(sector, buf.len())?;
        let mut file = self.file.lock().unwrap();

        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("I/O error while seeking sector {}", sector))?;
        file.write_all(buf)
            .with_context(|| format!("I/O error while writing sector {}", sector))?;
        file.flush()
            .with_context(|| format!("error flushing sector {}", sector))?;

        Ok(())
    }

    fn num_sectors(&self) -> u32 {
        self.num_sectors
    }
}
