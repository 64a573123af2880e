use std::sync::Arc;

use log::warn;

use crate::fs::inode::Inode;
use crate::storage::device::sector_constants::SECTOR_SIZE;

// An open file: one inode reference plus this handle's own cursor and
// write-deny state. Dropping the handle releases both.
pub struct File {
    inode: Arc<Inode>,
    pos: u64,
    deny_write: bool,
}

impl File {
    // Opens a handle on INODE with the cursor at byte 0.
    pub fn open(inode: Arc<Inode>) -> Self {
        File {
            inode,
            pos: 0,
            deny_write: false,
        }
    }

    // A second handle on the same inode, with its own cursor and deny state.
    pub fn reopen(&self) -> Self {
        File::open(Arc::clone(&self.inode))
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    // Reads into BUF at the cursor, advancing it by the bytes actually read.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let bytes_read = self.read_at(buf, self.pos);
        self.pos += bytes_read as u64;
        bytes_read
    }

    // Reads into BUF at byte offset OFS without touching the cursor. Returns
    // the bytes actually read, short at end of file. Each sector goes
    // through the cache, and a read-ahead hint for the following sector is
    // issued on the way to exploit sequential access.
    pub fn read_at(&self, buf: &mut [u8], mut ofs: u64) -> usize {
        let cache = self.inode.cache();
        let mut sector_buf = [0u8; SECTOR_SIZE];
        let mut bytes_read = 0;

        while bytes_read < buf.len() {
            // Sector to read, starting byte offset within that sector.
            let Some(sector) = self.inode.byte_to_sector(ofs) else {
                break;
            };
            let sector_ofs = (ofs % SECTOR_SIZE as u64) as usize;

            // Bytes left in the file vs bytes left in the sector.
            let inode_left = (self.inode.length() - ofs) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let min_left = inode_left.min(sector_left);

            let chunk = (buf.len() - bytes_read).min(min_left);
            if chunk == 0 {
                break;
            }

            if let Err(err) = cache.read_sector(sector, &mut sector_buf) {
                warn!("read at sector {sector} failed, stopping short: {err:#}");
                break;
            }
            buf[bytes_read..bytes_read + chunk]
                .copy_from_slice(&sector_buf[sector_ofs..sector_ofs + chunk]);

            ofs += chunk as u64;
            bytes_read += chunk;

            // The next sector is the likely follow-up.
            cache.hint_prefetch(sector + 1);
        }
        bytes_read
    }

    // Writes BUF at the cursor, advancing it by the bytes actually written.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let bytes_written = self.write_at(buf, self.pos);
        self.pos += bytes_written as u64;
        bytes_written
    }

    // Writes BUF at byte offset OFS without touching the cursor. Short when
    // the extent ends before the requested range; the file never grows.
    pub fn write_at(&self, buf: &[u8], ofs: u64) -> usize {
        self.inode.write_at(buf, ofs)
    }

    // Denies writes to the underlying inode until allow_write or close.
    // Redundant calls on the same handle raise the inode hold only once.
    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.deny_write = true;
            self.inode.deny_write();
        }
    }

    // Releases this handle's hold. Other handles on the same inode may still
    // be denying writes.
    pub fn allow_write(&mut self) {
        if self.deny_write {
            self.deny_write = false;
            self.inode.allow_write();
        }
    }

    pub fn length(&self) -> u64 {
        self.inode.length()
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}
