//! On-disk archive layout planner and header (C1).
//!
//! Owns the binary format of the archive file: a fixed header, an index
//! table, a double-decimated (DD) region, and a major-block data area, each
//! page-aligned. `initialise_header` computes a layout satisfying every
//! invariant below and maximising the number of major blocks that fit in
//! the file; `validate_header` re-checks an existing header against those
//! same invariants, one message per violated clause.

use std::fs::File;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};
use crate::mask::{FilterMask, FA_ENTRY_SIZE, FA_FRAME_SIZE};

pub const DISK_SIGNATURE: [u8; 7] = *b"FA_ARCH";
pub const DISK_VERSION: u32 = 1;

/// The header occupies one page so it can be mmapped on its own.
pub const DISK_HEADER_SIZE: u64 = 4096;

/// One entry per major block, populated by the external transform layer.
/// The archiver's core only needs its size to plan the layout; the fields
/// below are the transform's record format, fixed here because the layout
/// math needs a concrete size to validate against.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DataIndexEntry {
    /// Completion timestamp of the block's last frame, ns since the epoch.
    pub timestamp_ns: u64,
    /// Duration spanned by the block, in ns.
    pub duration_ns: u32,
    /// First sample id recorded by this block, in the transform's numbering.
    pub id_zero: u32,
}

/// A double/first-decimated sample record, populated by the external
/// transform layer. See [`DataIndexEntry`] for why a concrete size is
/// fixed here.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DecimatedData {
    pub min_x: i32,
    pub max_x: i32,
    pub min_y: i32,
    pub max_y: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct DiskHeader {
    pub signature: [u8; 7],
    pub version: u32,

    pub archive_mask: FilterMask,
    pub archive_mask_count: u32,
    pub first_decimation: u32,
    pub second_decimation: u32,
    pub input_block_size: u32,

    pub major_sample_count: u32,
    pub d_sample_count: u32,
    pub dd_sample_count: u32,
    pub major_block_size: u32,

    pub index_data_start: u64,
    pub index_data_size: u32,
    pub dd_data_start: u64,
    pub dd_data_size: u32,
    pub dd_total_count: u32,
    pub major_data_start: u64,
    pub major_block_count: u32,
    pub total_data_size: u64,
    pub current_major_block: u32,
}

impl Default for DiskHeader {
    fn default() -> Self {
        // zero-initialised, matching `memset(header, 0, sizeof(*header))`
        unsafe { std::mem::zeroed() }
    }
}

fn round_to_page(size: u32, page_size: u32) -> u32 {
    page_size * size.div_ceil(page_size)
}

fn page_aligned(offset: u64, description: &str, page_size: u64) -> Result<()> {
    if offset % page_size == 0 {
        Ok(())
    } else {
        Err(Error::Layout(format!("bad page alignment for {description}")))
    }
}

/// Computes a layout satisfying every header invariant and maximising the
/// number of major blocks that fit in `file_size - DISK_HEADER_SIZE`.
pub fn initialise_header(
    archive_mask: FilterMask,
    file_size: u64,
    input_block_size: u32,
    output_block_size: u32,
    first_decimation: u32,
    second_decimation: u32,
) -> Result<DiskHeader> {
    let page_size = page_size::get() as u32;

    if output_block_size % page_size != 0 {
        return Err(Error::Layout(
            "output block size must be a multiple of page size".to_string(),
        ));
    }
    if output_block_size % FA_ENTRY_SIZE as u32 != 0 {
        return Err(Error::Layout(
            "output block size must be a multiple of FA entry size".to_string(),
        ));
    }

    let mut header = DiskHeader::default();
    header.signature = DISK_SIGNATURE;
    header.version = DISK_VERSION;

    header.archive_mask = archive_mask;
    header.archive_mask_count = archive_mask.count();
    header.first_decimation = first_decimation;
    header.second_decimation = second_decimation;
    header.input_block_size = input_block_size;

    header.major_sample_count = output_block_size / FA_ENTRY_SIZE as u32;
    header.d_sample_count = header.major_sample_count / first_decimation;
    header.dd_sample_count = header.d_sample_count / second_decimation;
    header.major_block_size = header.archive_mask_count
        * (header.major_sample_count * FA_ENTRY_SIZE as u32
            + header.d_sample_count * size_of::<DecimatedData>() as u32);

    let data_size = file_size - DISK_HEADER_SIZE;
    let index_block_size = size_of::<DataIndexEntry>() as u64;
    let dd_block_size =
        header.dd_sample_count as u64 * header.archive_mask_count as u64 * size_of::<DecimatedData>() as u64;

    let mut major_block_count =
        (data_size / (index_block_size + dd_block_size + header.major_block_size as u64)) as u32;
    let mut index_data_size = round_to_page(major_block_count * index_block_size as u32, page_size);
    let mut dd_data_size = round_to_page((major_block_count as u64 * dd_block_size) as u32, page_size);

    while index_data_size as u64 + dd_data_size as u64
        + major_block_count as u64 * header.major_block_size as u64
        > data_size
    {
        if major_block_count == 0 {
            return Err(Error::Layout("data file too small".to_string()));
        }
        major_block_count -= 1;
        index_data_size = round_to_page(major_block_count * index_block_size as u32, page_size);
        dd_data_size = round_to_page((major_block_count as u64 * dd_block_size) as u32, page_size);
    }

    header.index_data_start = DISK_HEADER_SIZE;
    header.index_data_size = index_data_size;
    header.dd_data_start = header.index_data_start + index_data_size as u64;
    header.dd_data_size = dd_data_size;
    header.dd_total_count = header.dd_sample_count * major_block_count;
    header.major_data_start = header.dd_data_start + dd_data_size as u64;
    header.major_block_count = major_block_count;
    header.total_data_size =
        header.major_data_start + major_block_count as u64 * header.major_block_size as u64;

    header.current_major_block = 0;

    validate_header(&header, file_size)?;
    Ok(header)
}

/// Re-validates every invariant relating header fields to each other and to
/// `file_size`, returning a distinct message per violated clause.
pub fn validate_header(header: &DiskHeader, file_size: u64) -> Result<()> {
    let page_size = page_size::get() as u64;
    let input_sample_count = header.input_block_size / FA_FRAME_SIZE as u32;

    macro_rules! check {
        ($cond:expr, $msg:expr) => {
            if !($cond) {
                return Err(Error::Layout($msg.to_string()));
            }
        };
    }

    check!(header.signature == DISK_SIGNATURE, "invalid header signature");
    check!(
        header.version == DISK_VERSION,
        format!("invalid header version {}", header.version)
    );

    check!(
        header.archive_mask.count() == header.archive_mask_count,
        "inconsistent archive mask"
    );
    check!(header.archive_mask_count > 0, "empty capture mask");
    check!(
        header.total_data_size <= file_size,
        "data size in header larger than file size"
    );

    check!(
        header.d_sample_count * header.first_decimation == header.major_sample_count,
        "invalid first decimation"
    );
    check!(
        header.dd_sample_count * header.second_decimation == header.d_sample_count,
        "invalid second decimation"
    );
    check!(
        header.archive_mask_count as u64
            * (header.major_sample_count as u64 * FA_ENTRY_SIZE as u64
                + header.d_sample_count as u64 * size_of::<DecimatedData>() as u64)
            == header.major_block_size as u64,
        "invalid major block size"
    );
    check!(
        header.major_block_count as u64 * size_of::<DataIndexEntry>() as u64
            <= header.index_data_size as u64,
        "invalid index block size"
    );
    check!(
        header.dd_sample_count * header.major_block_count == header.dd_total_count,
        "invalid total DD count"
    );
    check!(
        header.dd_total_count as u64
            * header.archive_mask_count as u64
            * size_of::<DecimatedData>() as u64
            <= header.dd_data_size as u64,
        "DD area too small"
    );

    page_aligned(header.index_data_size as u64, "index size", page_size)?;
    page_aligned(header.dd_data_size as u64, "DD size", page_size)?;
    page_aligned(header.major_block_size as u64, "major block", page_size)?;
    page_aligned(header.index_data_start, "index area", page_size)?;
    page_aligned(header.dd_data_start, "DD data area", page_size)?;
    page_aligned(header.major_data_start, "major data area", page_size)?;

    check!(
        header.index_data_start >= DISK_HEADER_SIZE,
        "unexpected index data start"
    );
    check!(
        header.dd_data_start >= header.index_data_start + header.index_data_size as u64,
        "unexpected DD data start"
    );
    check!(
        header.major_data_start >= header.dd_data_start + header.dd_data_size as u64,
        "unexpected major data start"
    );
    check!(
        header.total_data_size
            >= header.major_data_start
                + header.major_block_count as u64 * header.major_block_size as u64,
        "data area too small for data"
    );
    check!(
        header.index_data_size as u64
            >= header.major_block_count as u64 * size_of::<DataIndexEntry>() as u64,
        "index area too small"
    );

    check!(
        header.first_decimation > 1 && header.second_decimation > 1,
        "decimation too small"
    );
    check!(header.major_sample_count > 1, "output block size too small");
    check!(header.major_block_count > 1, "data file too small");
    check!(
        header.input_block_size % FA_FRAME_SIZE as u32 == 0,
        "input block size must be a multiple of FA frame size"
    );
    check!(
        header.major_sample_count % input_sample_count == 0,
        "input and output block sizes don't match properly"
    );
    check!(
        header.major_sample_count % header.first_decimation == 0,
        "invalid first decimation"
    );
    check!(
        header.major_sample_count % (header.first_decimation * header.second_decimation) == 0,
        "decimation must fit into a complete major block"
    );

    check!(
        header.current_major_block < header.major_block_count,
        "invalid current index"
    );

    Ok(())
}

impl DiskHeader {
    /// A human-readable summary, mirroring the original archiver's
    /// `print_header` diagnostic dump.
    pub fn describe(&self) -> String {
        format!(
            "FA sniffer archive: {}, v{}.\n\
             Archiving: {}\n\
             Decimation {}, {} => {}, recording {} BPMs\n\
             Input block size = {} bytes, {} frames\n\
             Output block size = {} bytes, {} samples\n\
             Total size = {} major blocks = {} samples = {} bytes\n\
             Index data from {} for {} bytes\n\
             DD data starts {} for {} bytes, {} samples\n\
             FA+D data from {}, {} decimated samples per block\n\
             Current index: {}\n",
            String::from_utf8_lossy(&self.signature),
            self.version,
            self.archive_mask.format_raw(),
            self.first_decimation,
            self.second_decimation,
            self.first_decimation * self.second_decimation,
            self.archive_mask_count,
            self.input_block_size,
            self.input_block_size / FA_FRAME_SIZE as u32,
            self.major_block_size,
            self.major_sample_count,
            self.major_block_count,
            self.major_block_count * self.major_sample_count,
            self.total_data_size,
            self.index_data_start,
            self.index_data_size,
            self.dd_data_start,
            self.dd_data_size,
            self.dd_total_count,
            self.major_data_start,
            self.d_sample_count,
            self.current_major_block,
        )
    }
}

/// Obtains the archive's size: `BLKGETSIZE64` on a block device, falling
/// back to `fstat` for a regular file.
pub fn file_size(file: &File) -> Result<u64> {
    let fd = file.as_raw_fd();

    #[allow(clippy::unnecessary_cast)]
    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    let ret = unsafe { libc::ioctl(fd, BLKGETSIZE64 as _, &mut size as *mut u64) };
    if ret == 0 {
        return Ok(size);
    }

    let metadata = file.metadata()?;
    let len = metadata.len();
    if len == 0 {
        return Err(Error::Layout("zero file size. Maybe stat failed?".to_string()));
    }
    Ok(len)
}

/// Reads and validates just the header, for diagnostic tools that have no
/// need for the write lock or direct I/O `DiskWriter::open` requires.
pub fn read_header(path: &std::path::Path) -> Result<DiskHeader> {
    use std::os::unix::fs::FileExt;

    let file = File::open(path)?;
    let disk_size = file_size(&file)?;

    let mut bytes = vec![0u8; DISK_HEADER_SIZE as usize];
    file.read_exact_at(&mut bytes, 0)?;
    let header = unsafe { *(bytes.as_ptr() as *const DiskHeader) };
    validate_header(&header, disk_size)?;
    Ok(header)
}
