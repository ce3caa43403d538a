//! Capture daemon entry point: parses configuration, wires up the
//! sniffer device (hardware or replay), and runs the archiver until
//! interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use fa_archiver::config::{apply_overrides, init_logging, Cli, FileConfig};
use fa_archiver::error::Result;
use fa_archiver::layout;
use fa_archiver::orchestrator::{Archiver, ArchiverConfig};
use fa_archiver::sniffer::{HardwareSniffer, ReplaySniffer, SnifferDevice};
use fa_archiver::transform::BlockProcessor;

/// Placeholder transform: the external decimation/index layer this
/// archiver defers to is out of scope, so the daemon runs with a
/// no-op processor until one is wired in by the embedding application.
struct NullProcessor;

impl BlockProcessor for NullProcessor {
    fn process_block(&mut self, _block: Option<&[u8]>, _timestamp: Option<libc::timespec>) {}
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut file_config = FileConfig::load(&cli.config)?;
    apply_overrides(&mut file_config, &cli);

    if cli.describe {
        let header = layout::read_header(&file_config.archive_path)?;
        print!("{}", header.describe());
        return Ok(());
    }

    let device: Box<dyn SnifferDevice> = match &cli.replay {
        Some(path) => Box::new(ReplaySniffer::open(path.to_string_lossy().as_ref())?),
        None => Box::new(HardwareSniffer::open(&file_config.device_path)?),
    };

    let archiver_config = ArchiverConfig {
        archive_path: file_config.archive_path.clone(),
        block_count: file_config.block_count,
        block_size: file_config.input_block_size as usize,
        boost_priority: file_config.boost_priority,
    };

    let archiver = Archiver::start(&archiver_config, Box::new(NullProcessor), device)?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc_shutdown(move || handler_flag.store(false, Ordering::Release));

    while running.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    archiver.stop();
    Ok(())
}

/// Installs a `SIGINT`/`SIGTERM` handler without pulling in a dedicated
/// signal-handling crate: `sigaction` with `SA_RESTART` is sufficient for
/// a flag flip.
fn ctrlc_shutdown(on_signal: impl Fn() + Send + Sync + 'static) {
    use std::sync::OnceLock;

    static HANDLER: OnceLock<Box<dyn Fn() + Send + Sync>> = OnceLock::new();
    let _ = HANDLER.set(Box::new(on_signal));

    extern "C" fn trampoline(_: libc::c_int) {
        if let Some(handler) = HANDLER.get() {
            handler();
        }
    }

    unsafe {
        let _ = libc::signal(libc::SIGINT, trampoline as libc::sighandler_t);
        let _ = libc::signal(libc::SIGTERM, trampoline as libc::sighandler_t);
    }
}
