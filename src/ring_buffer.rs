//! RAM ring buffer connecting the sniffer producer to one or more readers
//! (C3).
//!
//! A single process-wide mutex guards the write index, every reader's
//! state, and the gap-coalescing flag; a single condition variable signals
//! readers on commit or stop. The block payload itself is the one thing
//! touched outside the mutex: once an index is handed out the caller reads
//! or writes its bytes directly, exactly as the original buffer hands out
//! raw pointers into its `valloc`'d frame buffer.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::{Condvar, Mutex};

const NOMINAL_FRAME_RATE: f64 = 10_072.0;
const FRAME_RATE_IIR: f64 = 1e-3;

/// Per-block metadata stamped by the producer.
#[derive(Clone, Copy, Debug)]
struct FrameInfo {
    gap: bool,
    ts: libc::timespec,
}

impl Default for FrameInfo {
    fn default() -> Self {
        FrameInfo {
            gap: true,
            ts: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        }
    }
}

struct ReaderState {
    out: usize,
    running: bool,
    underflowed: bool,
    backlog: usize,
    reserved: bool,
}

struct ReaderSlot {
    generation: u64,
    state: Option<ReaderState>,
}

/// A generation-tagged handle into the buffer's reader arena. The buffer
/// owns reader storage directly (an arena indexed by handle) rather than an
/// intrusive linked list, since Rust has no analogue for the original's
/// cyclic `list_head` membership links.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReaderId {
    index: usize,
    generation: u64,
}

struct State {
    in_index: usize,
    in_gap: bool,
    frame_info: Vec<FrameInfo>,
    readers: Vec<ReaderSlot>,
    free_list: Vec<usize>,
    next_generation: u64,
    mean_frame_rate: f64,
    last_ts: Option<libc::timespec>,
}

impl State {
    fn advance(index: usize, block_count: usize) -> usize {
        let next = index + 1;
        if next >= block_count {
            next - block_count
        } else {
            next
        }
    }

    fn alloc_reader(&mut self, reserved: bool) -> ReaderId {
        self.next_generation += 1;
        let generation = self.next_generation;
        let reader = ReaderState {
            out: self.in_index,
            running: true,
            underflowed: false,
            backlog: 0,
            reserved,
        };
        let index = if let Some(i) = self.free_list.pop() {
            self.readers[i] = ReaderSlot {
                generation,
                state: Some(reader),
            };
            i
        } else {
            self.readers.push(ReaderSlot {
                generation,
                state: Some(reader),
            });
            self.readers.len() - 1
        };
        ReaderId { index, generation }
    }

    fn free_reader(&mut self, id: ReaderId) {
        let slot = &mut self.readers[id.index];
        if slot.generation == id.generation {
            slot.state = None;
            self.free_list.push(id.index);
        }
    }

    fn reader(&self, id: ReaderId) -> &ReaderState {
        let slot = &self.readers[id.index];
        assert_eq!(slot.generation, id.generation, "stale reader handle");
        slot.state.as_ref().expect("reader handle points at a closed reader")
    }

    fn reader_mut(&mut self, id: ReaderId) -> &mut ReaderState {
        let slot = &mut self.readers[id.index];
        assert_eq!(slot.generation, id.generation, "stale reader handle");
        slot.state.as_mut().expect("reader handle points at a closed reader")
    }

    fn blocking_readers(&self) -> bool {
        self.readers.iter().any(|slot| match &slot.state {
            Some(r) => r.reserved && r.underflowed && r.out == self.in_index,
            None => false,
        })
    }

    fn update_frame_rate(&mut self, valid: bool, ts: libc::timespec, frames_per_block: f64) {
        if valid {
            if let Some(last) = self.last_ts {
                let sec = (ts.tv_sec - last.tv_sec) as f64;
                let nsec = (ts.tv_nsec - last.tv_nsec) as f64;
                let elapsed = sec * 1e9 + nsec;
                if elapsed > 0.0 {
                    let frame_rate = 1e9 * frames_per_block / elapsed;
                    self.mean_frame_rate =
                        (1.0 - FRAME_RATE_IIR) * self.mean_frame_rate + FRAME_RATE_IIR * frame_rate;
                }
            }
            self.last_ts = Some(ts);
        } else {
            // A gap block still anchors a timestamp but marks it unusable:
            // the rate estimate is frozen across the gap and resumes once
            // two consecutive valid timestamps are seen again.
            self.last_ts = None;
        }
    }
}

struct PageAlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl PageAlignedBuffer {
    fn new(len: usize) -> Self {
        let page_size = page_size::get();
        let layout = Layout::from_size_align(len.max(1), page_size).expect("invalid buffer layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("allocation failure for ring buffer payload");
        PageAlignedBuffer { ptr, layout }
    }

    /// # Safety
    /// Caller must ensure no other live reference aliases this block.
    unsafe fn block_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len)
    }

    /// # Safety
    /// Caller must ensure no `&mut` reference aliases this block.
    unsafe fn block(&self, offset: usize, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len)
    }
}

impl Drop for PageAlignedBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

unsafe impl Send for PageAlignedBuffer {}
unsafe impl Sync for PageAlignedBuffer {}

struct Shared {
    block_size: usize,
    block_count: usize,
    payload: PageAlignedBuffer,
    state: Mutex<State>,
    cond: Condvar,
}

/// The RAM ring buffer: a page-aligned array of `block_count` contiguous
/// blocks, a parallel `FrameInfo` array, and the reader arena.
#[derive(Clone)]
pub struct RingBuffer {
    shared: std::sync::Arc<Shared>,
}

/// Outcome of [`RingBuffer::get_read_block`].
pub struct ReadBlock<'a> {
    pub data: Option<&'a [u8]>,
    pub timestamp: Option<libc::timespec>,
    pub backlog_bytes: usize,
}

impl RingBuffer {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        let payload = PageAlignedBuffer::new(block_size * block_count);
        let state = State {
            in_index: 0,
            in_gap: true,
            frame_info: vec![FrameInfo::default(); block_count],
            readers: Vec::new(),
            free_list: Vec::new(),
            next_generation: 0,
            mean_frame_rate: NOMINAL_FRAME_RATE,
            last_ts: None,
        };
        RingBuffer {
            shared: std::sync::Arc::new(Shared {
                block_size,
                block_count,
                payload,
                state: Mutex::new(state),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn buffer_block_size(&self) -> usize {
        self.shared.block_size
    }

    pub fn get_mean_frame_rate(&self) -> f64 {
        self.shared.state.lock().unwrap().mean_frame_rate
    }

    pub fn open_reader(&self, reserved: bool) -> ReaderId {
        let mut state = self.shared.state.lock().unwrap();
        state.alloc_reader(reserved)
    }

    pub fn close_reader(&self, id: ReaderId) {
        let mut state = self.shared.state.lock().unwrap();
        state.free_reader(id);
    }

    pub fn stop_reader(&self, id: ReaderId) {
        let mut state = self.shared.state.lock().unwrap();
        state.reader_mut(id).running = false;
        self.shared.cond.notify_all();
    }

    /// Returns `None` iff a reserved reader is both underflowed and pinned
    /// at the current write slot (back-pressure); otherwise the producer's
    /// next block to fill.
    pub fn get_write_block(&self) -> Option<&mut [u8]> {
        let state = self.shared.state.lock().unwrap();
        if state.blocking_readers() {
            None
        } else {
            let idx = state.in_index;
            drop(state);
            Some(unsafe { self.shared.payload.block_mut(idx * self.shared.block_size, self.shared.block_size) })
        }
    }

    pub fn release_write_block(&self, gap: bool, ts: libc::timespec) {
        let mut state = self.shared.state.lock().unwrap();
        if gap && state.in_gap {
            return;
        }
        state.in_gap = gap;

        let idx = state.in_index;
        state.frame_info[idx] = FrameInfo { gap, ts };
        state.in_index = State::advance(idx, self.shared.block_count);

        let frames_per_block = (self.shared.block_size / crate::mask::FA_FRAME_SIZE) as f64;
        state.update_frame_rate(!gap, ts, frames_per_block);

        let new_in = state.in_index;
        let block_count = self.shared.block_count;
        for slot in state.readers.iter_mut() {
            if let Some(r) = &mut slot.state {
                if new_in == r.out {
                    r.underflowed = true;
                } else {
                    let backlog = (new_in + block_count - r.out) % block_count;
                    if backlog > r.backlog {
                        r.backlog = backlog;
                    }
                }
            }
        }
        self.shared.cond.notify_all();
    }

    /// Reads the next block for `id`, resynchronising on underflow and
    /// waiting for new data when caught up to the producer.
    pub fn get_read_block(&self, id: ReaderId) -> ReadBlock<'_> {
        let mut state = self.shared.state.lock().unwrap();

        let data_index;
        let mut data = None;
        let mut timestamp = None;

        if state.reader(id).underflowed {
            let in_index = state.in_index;
            let reader = state.reader_mut(id);
            reader.out = in_index;
            reader.underflowed = false;
            data_index = None;
        } else {
            loop {
                let running = state.reader(id).running;
                let caught_up = state.reader(id).out == state.in_index;
                if running && caught_up {
                    state = self.shared.cond.wait(state).unwrap();
                } else {
                    break;
                }
            }

            if !state.reader(id).running {
                data_index = None;
            } else {
                let out = state.reader(id).out;
                if state.frame_info[out].gap {
                    let next = State::advance(out, self.shared.block_count);
                    state.reader_mut(id).out = next;
                    data_index = None;
                } else {
                    timestamp = Some(state.frame_info[out].ts);
                    data_index = Some(out);
                }
            }
        }

        let backlog_bytes = {
            let reader = state.reader_mut(id);
            let backlog = reader.backlog;
            reader.backlog = 0;
            backlog * self.shared.block_size
        };

        if let Some(idx) = data_index {
            drop(state);
            data = Some(unsafe {
                self.shared
                    .payload
                    .block(idx * self.shared.block_size, self.shared.block_size)
            });
        }

        ReadBlock {
            data,
            timestamp,
            backlog_bytes,
        }
    }

    /// Advances the reader's position. Returns `false` iff the producer
    /// lapped this reader during its read/release window.
    pub fn release_read_block(&self, id: ReaderId) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let reader = state.reader_mut(id);
        reader.out = State::advance(reader.out, self.shared.block_count);
        let underflowed = reader.underflowed;
        !underflowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::Duration;

    fn ts(nsec: i64) -> libc::timespec {
        libc::timespec {
            tv_sec: 0,
            tv_nsec: nsec,
        }
    }

    #[test]
    fn steady_state_no_backlog() {
        let buf = RingBuffer::new(64, 4);
        let reader = buf.open_reader(false);

        for i in 0..10 {
            let block = buf.get_write_block().unwrap();
            block[0] = i as u8;
            buf.release_write_block(false, ts(i as i64 * 1_000_000));
        }

        for i in 0..10 {
            let r = buf.get_read_block(reader);
            assert_eq!(r.data.unwrap()[0], i as u8);
            assert!(buf.release_read_block(reader));
        }

        buf.close_reader(reader);
    }

    #[test]
    fn gap_coalesces_into_single_marker() {
        let buf = RingBuffer::new(64, 8);
        let reader = buf.open_reader(false);

        buf.get_write_block().unwrap();
        buf.release_write_block(true, ts(0));
        buf.get_write_block().unwrap();
        buf.release_write_block(true, ts(1));
        buf.get_write_block().unwrap();
        buf.release_write_block(false, ts(2));

        let r = buf.get_read_block(reader);
        assert!(r.data.is_none(), "first block after a gap run must read as a gap");
        assert!(buf.release_read_block(reader));

        let r = buf.get_read_block(reader);
        assert!(r.data.is_some(), "the valid block after the coalesced gap must be visible");
    }

    #[test]
    fn reserved_reader_blocks_producer_on_underflow() {
        let buf = RingBuffer::new(64, 2);
        let reader = buf.open_reader(true);

        buf.get_write_block().unwrap();
        buf.release_write_block(false, ts(0));

        let r = buf.get_read_block(reader);
        assert!(r.data.is_some());
        assert!(buf.release_read_block(reader));

        buf.get_write_block().unwrap();
        buf.release_write_block(false, ts(1));

        {
            let mut state = buf.shared.state.lock().unwrap();
            state.reader_mut(reader).underflowed = true;
            state.reader_mut(reader).out = state.in_index;
        }

        assert!(
            buf.get_write_block().is_none(),
            "a reserved, underflowed reader pinned at the write slot must back-pressure the producer"
        );
    }

    #[test]
    fn unreserved_reader_never_blocks_producer() {
        let buf = RingBuffer::new(64, 2);
        let _reader = buf.open_reader(false);

        for i in 0..20 {
            let block = buf.get_write_block().expect("unreserved readers never block the producer");
            block[0] = i as u8;
            buf.release_write_block(false, ts(i as i64));
        }
    }

    #[test]
    fn backlog_tracks_high_water_mark_since_last_query() {
        let buf = RingBuffer::new(64, 16);
        let reader = buf.open_reader(false);

        for i in 0..5 {
            buf.get_write_block().unwrap();
            buf.release_write_block(false, ts(i));
        }

        let r = buf.get_read_block(reader);
        assert_eq!(r.backlog_bytes, 4 * 64);
        assert!(buf.release_read_block(reader));

        let r = buf.get_read_block(reader);
        assert_eq!(r.backlog_bytes, 0, "backlog resets once observed");
    }

    #[test]
    fn reader_blocked_on_empty_buffer_wakes_on_write() {
        let buf = RingBuffer::new(64, 4);
        let reader = buf.open_reader(false);

        let handle = {
            let buf = buf.clone();
            thread::spawn(move || buf.get_read_block(reader).data.is_some())
        };

        thread::sleep(Duration::from_millis(50));
        buf.get_write_block().unwrap();
        buf.release_write_block(false, ts(0));

        assert!(handle.join().unwrap());
    }

    #[test]
    fn stop_reader_wakes_blocked_read_with_no_data() {
        let buf = RingBuffer::new(64, 4);
        let reader = buf.open_reader(false);

        let handle = {
            let buf = buf.clone();
            thread::spawn(move || buf.get_read_block(reader).data.is_none())
        };

        thread::sleep(Duration::from_millis(50));
        buf.stop_reader(reader);

        assert!(handle.join().unwrap());
    }
}
