//! Disk writer (C6).
//!
//! Opens the archive with direct I/O, takes the advisory write lock, maps
//! the header/index/DD regions, and runs a single-slot write interlock: at
//! most one write is ever in flight, and a read permit request blocks until
//! it drains. Major-block payloads go through a plain positioned write,
//! since `O_DIRECT` bypasses the page cache these would otherwise contend.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};

use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::{fcntl, FcntlArg};

use crate::error::{Error, Result};
use crate::layout::{self, DiskHeader};

struct PendingWrite {
    offset: u64,
    data: Vec<u8>,
}

struct Slot {
    pending: Option<PendingWrite>,
    running: bool,
}

/// Holds the archive's three mmapped regions and drives the writer thread.
///
/// Field order matters: `Drop` unmaps in declaration order, so `dd_map`
/// goes first, then `index_map`, then `header_map`, matching the fixed
/// {DD, index, header} close sequence.
pub struct DiskWriter {
    dd_map: MmapMut,
    index_map: MmapMut,
    header_map: MmapMut,
    fd: File,
    header: DiskHeader,
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl DiskWriter {
    /// Opens `path` for direct I/O, takes the whole-file advisory write
    /// lock, and maps the fixed regions described by the header already on
    /// disk. Returns [`Error::AlreadyRunning`] if another process holds the
    /// lock.
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DIRECT | libc::O_LARGEFILE)
            .open(path)?;

        lock_archive(&fd)?;

        let disk_size = layout::file_size(&fd)?;

        let mut header_map = unsafe {
            MmapOptions::new()
                .len(layout::DISK_HEADER_SIZE as usize)
                .map_mut(&fd)?
        };
        let header = unsafe { *(header_map.as_mut_ptr() as *const DiskHeader) };
        layout::validate_header(&header, disk_size)?;

        let index_map = unsafe {
            MmapOptions::new()
                .offset(header.index_data_start)
                .len(header.index_data_size as usize)
                .map_mut(&fd)?
        };
        let dd_map = unsafe {
            MmapOptions::new()
                .offset(header.dd_data_start)
                .len(header.dd_data_size as usize)
                .map_mut(&fd)?
        };

        Ok(Arc::new(DiskWriter {
            dd_map,
            index_map,
            header_map,
            fd,
            header,
            slot: Mutex::new(Slot {
                pending: None,
                running: true,
            }),
            cond: Condvar::new(),
        }))
    }

    pub fn header(&self) -> &DiskHeader {
        &self.header
    }

    pub fn index_region(&mut self) -> &mut [u8] {
        &mut self.index_map[..]
    }

    pub fn dd_region(&mut self) -> &mut [u8] {
        &mut self.dd_map[..]
    }

    /// Queues a major-block write, blocking while a previous write is
    /// still in flight.
    pub fn schedule_write(&self, offset: u64, data: Vec<u8>) {
        let mut slot = self.slot.lock().unwrap();
        while slot.pending.is_some() {
            slot = self.cond.wait(slot).unwrap();
        }
        slot.pending = Some(PendingWrite { offset, data });
        self.cond.notify_all();
    }

    /// Blocks external readers of the on-disk index/DD regions until any
    /// in-flight write has drained.
    pub fn request_read(&self) {
        let mut slot = self.slot.lock().unwrap();
        while slot.pending.is_some() {
            slot = self.cond.wait(slot).unwrap();
        }
    }

    pub fn stop(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.running = false;
        self.cond.notify_all();
    }

    /// Flushes the three mmapped regions to disk in the fixed {DD, index,
    /// header} order. `Drop` unmaps in this same order already, but unmap
    /// alone doesn't guarantee the dirty pages have been written back;
    /// this issues the `msync` that order depends on.
    pub fn close(&self) -> Result<()> {
        self.dd_map.flush_async()?;
        self.index_map.flush_async()?;
        self.header_map.flush_async()?;
        Ok(())
    }

    /// Runs until [`DiskWriter::stop`] is called, applying queued writes
    /// to the backing file one at a time.
    pub fn run(&self) {
        loop {
            let pending = {
                let mut slot = self.slot.lock().unwrap();
                loop {
                    if slot.pending.is_some() || !slot.running {
                        break;
                    }
                    slot = self.cond.wait(slot).unwrap();
                }
                if !slot.running && slot.pending.is_none() {
                    return;
                }
                slot.pending.take().unwrap()
            };

            if let Err(e) = do_write(&self.fd, pending.offset, &pending.data) {
                log::warn!("disk write failed: {e}");
            }

            let mut slot = self.slot.lock().unwrap();
            slot.pending = None;
            self.cond.notify_all();
        }
    }
}

fn do_write(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    let mut written = 0usize;
    while written < data.len() {
        let n = file.write_at(&data[written..], offset + written as u64)?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short write to archive",
            )));
        }
        written += n;
    }
    Ok(())
}

fn lock_archive(file: &File) -> Result<()> {
    let mut flock: libc::flock = unsafe { std::mem::zeroed() };
    flock.l_type = libc::F_WRLCK as libc::c_short;
    flock.l_whence = libc::SEEK_SET as libc::c_short;
    flock.l_start = 0;
    flock.l_len = 0;

    fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&flock)).map_err(|e| {
        if e == nix::errno::Errno::EACCES || e == nix::errno::Errno::EAGAIN {
            Error::AlreadyRunning
        } else {
            Error::Nix(e)
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn schedule_write_serialises_against_itself() {
        let slot = Mutex::new(Slot {
            pending: None,
            running: true,
        });
        let cond = Condvar::new();
        let barrier = Barrier::new(1);
        barrier.wait();

        {
            let mut s = slot.lock().unwrap();
            assert!(s.pending.is_none());
            s.pending = Some(PendingWrite {
                offset: 0,
                data: vec![1, 2, 3],
            });
            cond.notify_all();
        }
        assert!(slot.lock().unwrap().pending.is_some());
    }
}
