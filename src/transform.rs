//! Transform worker (C5).
//!
//! A reserved reader of the ring buffer that hands each block to an
//! externally supplied processor. The processor's internals (decimation,
//! index population) are out of scope here; this module only fixes the
//! calling convention and the reserved-reader lifecycle around it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::ring_buffer::{ReaderId, RingBuffer};

/// Receives each archived block in order, or `None` on a gap/resync.
/// Implementations own whatever state they need (index cursor, DD
/// accumulator) and must not block significantly, since the reserved
/// reader slot back-pressures the producer while a block is held.
pub trait BlockProcessor: Send {
    fn process_block(&mut self, block: Option<&[u8]>, timestamp: Option<libc::timespec>);
}

/// Runs `processor` over `buffer` through `reader` until `running` clears.
pub fn transform_thread(
    buffer: RingBuffer,
    reader: ReaderId,
    mut processor: Box<dyn BlockProcessor>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        let block = buffer.get_read_block(reader);
        processor.process_block(block.data, block.timestamp);
        if block.data.is_some() {
            buffer.release_read_block(reader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;

    struct RecordingProcessor {
        seen: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
    }

    impl BlockProcessor for RecordingProcessor {
        fn process_block(&mut self, block: Option<&[u8]>, _timestamp: Option<libc::timespec>) {
            self.seen.lock().unwrap().push(block.map(|b| b.to_vec()));
        }
    }

    #[test]
    fn processes_blocks_in_order_and_stops_cleanly() {
        let buffer = RingBuffer::new(4, 4);
        let reader = buffer.open_reader(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let processor = Box::new(RecordingProcessor { seen: seen.clone() });
        let buffer_clone = buffer.clone();
        let running_clone = running.clone();
        let handle = thread::spawn(move || transform_thread(buffer_clone, reader, processor, running_clone));

        for i in 0..3u8 {
            let block = buffer.get_write_block().unwrap();
            block[0] = i;
            buffer.release_write_block(
                false,
                libc::timespec {
                    tv_sec: i as i64,
                    tv_nsec: 0,
                },
            );
        }

        while seen.lock().unwrap().len() < 3 {
            thread::yield_now();
        }

        running.store(false, Ordering::Release);
        buffer.stop_reader(reader);
        handle.join().unwrap();

        let seen = seen.lock().unwrap();
        for (i, block) in seen.iter().take(3).enumerate() {
            assert_eq!(block.as_ref().unwrap()[0], i as u8);
        }
    }
}
