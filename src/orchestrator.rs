//! Orchestration (C7).
//!
//! Bundles the ring buffer, disk writer, and sniffer device into a single
//! lifecycle with a fixed bring-up and tear-down order.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use log::info;

use crate::error::{Error, Result};
use crate::ring_buffer::{ReaderId, RingBuffer};
use crate::sniffer::{Interrupt, SnifferDevice};
use crate::transform::{transform_thread, BlockProcessor};
use crate::writer::DiskWriter;

pub struct ArchiverConfig {
    pub archive_path: PathBuf,
    pub block_count: usize,
    pub block_size: usize,
    pub boost_priority: bool,
}

/// Owns the three long-lived worker threads and the shared ring buffer,
/// and drives their startup/shutdown in the order the design fixes.
pub struct Archiver {
    buffer: RingBuffer,
    writer: Arc<DiskWriter>,
    transform_reader: ReaderId,
    transform_running: Arc<AtomicBool>,
    sniffer_running: Arc<AtomicBool>,
    sniffer_interrupt: Interrupt,

    writer_handle: Option<JoinHandle<()>>,
    transform_handle: Option<JoinHandle<()>>,
    sniffer_handle: Option<JoinHandle<()>>,
}

impl Archiver {
    /// Maps the archive file, opens a reserved reader, and starts all
    /// three worker threads.
    pub fn start(
        config: &ArchiverConfig,
        processor: Box<dyn BlockProcessor>,
        device: Box<dyn SnifferDevice>,
    ) -> Result<Self> {
        let buffer = RingBuffer::new(config.block_size, config.block_count);
        let writer = DiskWriter::open(&config.archive_path)?;

        let transform_reader = buffer.open_reader(true);
        let transform_running = Arc::new(AtomicBool::new(true));
        let sniffer_running = Arc::new(AtomicBool::new(true));
        let sniffer_interrupt = device.interrupt_handle();

        let writer_handle = {
            let writer = writer.clone();
            std::thread::spawn(move || writer.run())
        };

        let transform_handle = {
            let buffer = buffer.clone();
            let running = transform_running.clone();
            std::thread::spawn(move || transform_thread(buffer, transform_reader, processor, running))
        };

        let boost_priority = config.boost_priority;
        let (boost_tx, boost_rx) = mpsc::channel();
        let sniffer_handle = {
            let buffer = buffer.clone();
            let running = sniffer_running.clone();
            std::thread::spawn(move || {
                if boost_priority {
                    if let Err(e) = crate::sniffer::boost_to_realtime() {
                        let _ = boost_tx.send(Err(e));
                        return;
                    }
                }
                let _ = boost_tx.send(Ok(()));
                crate::sniffer::sniffer_thread(buffer, device, running);
            })
        };

        // Priority boosting requires real time thread support: the original
        // archiver treats a failure to acquire SCHED_FIFO as fatal to
        // startup, not a thread failure discovered later. `pthread_create`
        // can bind a scheduling policy before the thread body runs; a `std`
        // thread cannot, so the boosted thread reports back over this
        // channel before doing anything else, and `start` blocks on it.
        if boost_priority {
            match boost_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    transform_running.store(false, Ordering::Release);
                    buffer.stop_reader(transform_reader);
                    let _ = transform_handle.join();
                    writer.stop();
                    let _ = writer_handle.join();
                    let _ = sniffer_handle.join();
                    buffer.close_reader(transform_reader);
                    return Err(e);
                }
                Err(_) => {
                    return Err(Error::SnifferUnsupported(
                        "sniffer thread exited before reporting real-time priority status",
                    ));
                }
            }
        }

        Ok(Archiver {
            buffer,
            writer,
            transform_reader,
            transform_running,
            sniffer_running,
            sniffer_interrupt,
            writer_handle: Some(writer_handle),
            transform_handle: Some(transform_handle),
            sniffer_handle: Some(sniffer_handle),
        })
    }

    /// Stops and joins all three workers in the fixed order, then closes
    /// the reader and the disk mappings.
    pub fn stop(mut self) {
        info!("Waiting for writer");
        self.writer.stop();

        self.buffer.stop_reader(self.transform_reader);
        self.transform_running.store(false, Ordering::Release);

        info!("Waiting for sniffer...");
        self.sniffer_running.store(false, Ordering::Release);
        if let Err(e) = self.sniffer_interrupt.fire() {
            log::warn!("sniffer interrupt failed: {e}");
        }

        if let Some(h) = self.transform_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.writer_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.sniffer_handle.take() {
            let _ = h.join();
        }
        info!("done");

        self.buffer.close_reader(self.transform_reader);
        if let Err(e) = self.writer.close() {
            log::warn!("failed to flush archive mappings: {e}");
        }
        // `writer` (an `Arc<DiskWriter>`) drops its mmaps in declaration
        // order (DD, index, header) once the last handle goes out of scope,
        // after the msync above has already pushed them to disk.

        info!("Disk writer done");
    }
}
