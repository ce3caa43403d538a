//! Converts filter masks between human (`id[-id](,id[-id])*`) and raw
//! (64 hex nibble) textual forms.

use std::process::ExitCode;

use clap::Parser;
use fa_archiver::mask::FilterMask;

#[derive(Parser)]
#[command(name = "fa-mask", about = "Convert between human and raw filter mask forms")]
struct Args {
    /// Mask in human form (`id[-id](,id[-id])*`); reads raw form instead
    /// when --raw is given.
    mask: String,

    /// Parse `mask` as 64 raw hex nibbles instead of human form.
    #[arg(long)]
    raw: bool,

    /// Print the raw hex form instead of the bit count and id list.
    #[arg(long)]
    to_raw: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let parsed = if args.raw {
        FilterMask::parse_raw(&args.mask)
    } else {
        FilterMask::parse(&args.mask)
    };

    let mask = match parsed {
        Ok(mask) => mask,
        Err(e) => {
            eprintln!("fa-mask: {e}");
            return ExitCode::FAILURE;
        }
    };

    if args.to_raw {
        println!("{}", mask.format_raw());
    } else {
        println!("{} ids set", mask.count());
    }
    ExitCode::SUCCESS
}
