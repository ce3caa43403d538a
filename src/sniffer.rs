//! Sniffer device adapter (C4).
//!
//! The driver is abstracted as a capability set {reset, read, status,
//! interrupt} so the production thread loop can run unchanged against
//! either a real device or a replay file. `interrupt` is what lets the
//! orchestrator break a blocked `read` at shutdown without relying on
//! `pthread_cancel`, which Rust's standard threads have no equivalent for.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::ring_buffer::RingBuffer;

const FASNIF_IOCTL_GET_VERSION: u64 = 0x4653_0000;
const FASNIF_IOCTL_GET_STATUS: u64 = 0x4653_0001;
const FASNIF_IOCTL_RESTART: u64 = 0x4653_0002;
const FASNIF_IOCTL_HALT: u64 = 0x4653_0003;
const FASNIF_IOCTL_VERSION: i32 = 2;

/// Snapshot of device health, layout mirrors `struct fa_status` closely
/// enough for logging; the external monitoring subsystem owns the rest.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnifferStatus {
    pub link_up: bool,
    pub last_interrupt: u32,
    pub frame_errors: u32,
}

/// A capability that aborts an in-flight `read` from a thread other than
/// the one calling it. Extracted from a [`SnifferDevice`] before the
/// device is handed to the sniffer thread, since `read` holds `&mut self`
/// for as long as the underlying syscall blocks.
#[derive(Clone)]
pub struct Interrupt(Arc<dyn Fn() -> Result<()> + Send + Sync>);

impl Interrupt {
    pub fn fire(&self) -> Result<()> {
        (self.0)()
    }
}

/// A sniffer device capability set. `status` and `interrupt` may be
/// unsupported depending on backend and hardware generation.
pub trait SnifferDevice: Send {
    fn reset(&mut self) -> Result<()>;
    /// Reads exactly `buf.len()` bytes, or returns `Ok(false)` on a
    /// recoverable short read/EOF (treated as a gap by the caller).
    fn read(&mut self, buf: &mut [u8]) -> Result<bool>;
    fn status(&mut self) -> Result<SnifferStatus>;
    /// Returns the "unsupported" error when the backend has no interrupt
    /// mechanism.
    fn interrupt_handle(&self) -> Interrupt;
}

/// Hardware backend talking to `/dev/fa_sniffer` (or equivalent) via the
/// device's ioctl interface.
pub struct HardwareSniffer {
    device: File,
    ioctl_ok: bool,
}

impl HardwareSniffer {
    pub fn open(device_path: &str) -> Result<Self> {
        let device = File::open(device_path)?;
        let fd = device.as_raw_fd();
        let version = unsafe { libc::ioctl(fd, FASNIF_IOCTL_GET_VERSION as _) };
        let ioctl_ok = version >= 0 && version == FASNIF_IOCTL_VERSION;
        if version < 0 {
            warn!("Sniffer device doesn't support ioctl interface");
        } else if !ioctl_ok {
            warn!("Sniffer device ioctl version mismatch");
        }
        Ok(HardwareSniffer { device, ioctl_ok })
    }
}

impl SnifferDevice for HardwareSniffer {
    fn reset(&mut self) -> Result<()> {
        let fd = self.device.as_raw_fd();
        if self.ioctl_ok {
            let rc = unsafe { libc::ioctl(fd, FASNIF_IOCTL_RESTART as _) };
            if rc < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.device.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn status(&mut self) -> Result<SnifferStatus> {
        if !self.ioctl_ok {
            return Err(Error::SnifferUnsupported("status requires ioctl interface"));
        }
        let mut status = SnifferStatus::default();
        let fd = self.device.as_raw_fd();
        let rc = unsafe { libc::ioctl(fd, FASNIF_IOCTL_GET_STATUS as _, &mut status as *mut _) };
        if rc < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(status)
    }

    fn interrupt_handle(&self) -> Interrupt {
        let fd = self.device.as_raw_fd();
        let ioctl_ok = self.ioctl_ok;
        Interrupt(Arc::new(move || {
            if !ioctl_ok {
                return Err(Error::SnifferUnsupported("interrupt requires ioctl interface"));
            }
            let rc = unsafe { libc::ioctl(fd, FASNIF_IOCTL_HALT as _) };
            if rc < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
            Ok(())
        }))
    }
}

/// Replay backend: feeds frames from a captured file for tests and
/// offline processing, looping forever once exhausted.
pub struct ReplaySniffer {
    data: Vec<u8>,
    position: usize,
    halted: Arc<AtomicBool>,
}

impl ReplaySniffer {
    pub fn open(path: &str) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(ReplaySniffer {
            data,
            position: 0,
            halted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        ReplaySniffer {
            data,
            position: 0,
            halted: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl SnifferDevice for ReplaySniffer {
    fn reset(&mut self) -> Result<()> {
        unreachable!("replay reset should never be invoked: replay never reports a gap");
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<bool> {
        if self.halted.load(Ordering::Acquire) {
            return Ok(false);
        }
        if self.data.is_empty() {
            return Ok(false);
        }
        for byte in buf.iter_mut() {
            *byte = self.data[self.position];
            self.position = (self.position + 1) % self.data.len();
        }
        Ok(true)
    }

    fn status(&mut self) -> Result<SnifferStatus> {
        Err(Error::SnifferUnsupported("status unavailable in replay mode"))
    }

    fn interrupt_handle(&self) -> Interrupt {
        let halted = self.halted.clone();
        Interrupt(Arc::new(move || {
            halted.store(true, Ordering::Release);
            Ok(())
        }))
    }
}

fn now() -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts
}

/// Drives `device` into `buffer`'s write blocks until `running` clears.
/// Mirrors the original inner/outer loop: the inner loop reads blocks
/// back to back, breaking out to sleep-and-reset on a producer stall or
/// a read failure; the outer loop retries forever.
pub fn sniffer_thread(
    buffer: RingBuffer,
    mut device: Box<dyn SnifferDevice>,
    running: Arc<AtomicBool>,
) {
    let mut in_gap = false;

    while running.load(Ordering::Acquire) {
        loop {
            if !running.load(Ordering::Acquire) {
                return;
            }
            let block = match buffer.get_write_block() {
                Some(block) => block,
                None => {
                    info!("Sniffer unable to write block");
                    break;
                }
            };

            let read_ok = match device.read(block) {
                Ok(ok) => ok,
                Err(e) => {
                    warn!("Sniffer read failed: {e}");
                    false
                }
            };
            let gap = !read_ok;
            let ts = now();
            buffer.release_write_block(gap, ts);

            if gap {
                if !in_gap {
                    info!("Unable to read block");
                }
                in_gap = true;
                break;
            } else if in_gap {
                info!("Block read successfully");
                in_gap = false;
            }
        }

        if !running.load(Ordering::Acquire) {
            return;
        }
        thread::sleep(Duration::from_secs(1));
        if let Err(e) = device.reset() {
            warn!("Sniffer reset failed: {e}");
        }
    }
}

/// Applies `SCHED_FIFO` priority 1 to the calling thread. Returns an
/// error (never silently degrades) when real-time scheduling is
/// unavailable and the caller asked for it.
pub fn boost_to_realtime() -> Result<()> {
    let param = libc::sched_param { sched_priority: 1 };
    // pid 0 means "the calling thread"; nix's sched module only wraps
    // sched_setaffinity, not sched_setscheduler, so this goes via libc.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn replay_cycles_through_data() {
        let mut sniffer = ReplaySniffer::from_bytes(vec![1, 2, 3]);
        let mut buf = [0u8; 6];
        assert!(sniffer.read(&mut buf).unwrap());
        assert_eq!(buf, [1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn replay_status_is_unsupported() {
        let mut sniffer = ReplaySniffer::from_bytes(vec![1]);
        assert!(matches!(sniffer.status(), Err(Error::SnifferUnsupported(_))));
    }

    #[test]
    fn replay_interrupt_halts_subsequent_reads() {
        let mut sniffer = ReplaySniffer::from_bytes(vec![1, 2, 3, 4]);
        sniffer.interrupt_handle().fire().unwrap();
        let mut buf = [0u8; 4];
        assert!(!sniffer.read(&mut buf).unwrap());
    }

    #[test]
    fn interrupt_handle_is_callable_while_read_is_borrowed_elsewhere() {
        // The whole point of splitting `Interrupt` out of `SnifferDevice` is
        // that it can be taken before the device (and its `&mut self` read
        // path) moves into the sniffer thread.
        let sniffer = ReplaySniffer::from_bytes(vec![1, 2, 3, 4]);
        let interrupt = sniffer.interrupt_handle();
        let mut sniffer = sniffer;
        assert!(sniffer.read(&mut [0u8; 4]).unwrap());
        interrupt.fire().unwrap();
        assert!(!sniffer.read(&mut [0u8; 4]).unwrap());
    }

    #[test]
    fn sniffer_thread_fills_buffer_from_replay() {
        let buffer = RingBuffer::new(4, 4);
        let reader = buffer.open_reader(false);
        let running = Arc::new(AtomicBool::new(true));
        let device: Box<dyn SnifferDevice> = Box::new(ReplaySniffer::from_bytes(vec![9, 9, 9, 9]));

        let running_clone = running.clone();
        let buffer_clone = buffer.clone();
        let handle = std::thread::spawn(move || sniffer_thread(buffer_clone, device, running_clone));

        let r = buffer.get_read_block(reader);
        assert_eq!(r.data.unwrap(), &[9, 9, 9, 9]);

        running.store(false, Ordering::Release);
        buffer.stop_reader(reader);
        handle.join().unwrap();
    }
}
