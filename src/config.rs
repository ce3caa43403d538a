//! Configuration and command-line glue.
//!
//! Static, deployment-time settings (device paths, block sizing,
//! decimation factors) live in a TOML file parsed into [`FileConfig`].
//! Command-line flags in [`Cli`] override the subset that operators
//! commonly need to flip per invocation (replay mode, verbosity, the
//! config path itself).

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::Result;
use crate::mask::FilterMask;

#[derive(Debug, Deserialize)]
pub struct FileConfig {
    /// Path to the sniffer device, e.g. `/dev/fa_sniffer0`.
    pub device_path: String,
    /// Path to the archive file; must already exist and be pre-sized.
    pub archive_path: PathBuf,

    /// BPM ids to capture, in `parse`-able human form.
    pub archive_mask: String,

    pub input_block_size: u32,
    pub output_block_size: u32,
    pub first_decimation: u32,
    pub second_decimation: u32,

    #[serde(default)]
    pub boost_priority: bool,

    #[serde(default = "default_block_count")]
    pub block_count: usize,
}

fn default_block_count() -> usize {
    64
}

impl FileConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| crate::error::Error::Layout(format!("invalid configuration: {e}")))
    }

    pub fn parsed_mask(&self) -> Result<FilterMask> {
        FilterMask::parse(&self.archive_mask)
    }
}

/// Command-line entry point for `fa-archiverd`. Individual overrides take
/// precedence over the config file's matching field; `apply_overrides`
/// performs the merge.
#[derive(Debug, Parser)]
#[command(name = "fa-archiverd", about = "Fast-acquisition archive capture daemon")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/fa-archiver.toml")]
    pub config: PathBuf,

    /// Override the configured archive file path.
    #[arg(long)]
    pub archive: Option<PathBuf>,

    /// Override the configured capture mask (human `parse`-able form).
    #[arg(long)]
    pub mask: Option<String>,

    /// Override the configured sniffer device path.
    #[arg(long)]
    pub device: Option<String>,

    /// Replay frames from a file instead of opening the hardware sniffer.
    #[arg(long)]
    pub replay: Option<PathBuf>,

    /// Force real-time priority boosting on even if the config file
    /// disables it. Cannot be used to turn it off.
    #[arg(long)]
    pub boost_priority: bool,

    /// Print the archive's on-disk header and exit without starting the
    /// capture pipeline.
    #[arg(long)]
    pub describe: bool,

    /// Increase log verbosity; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Merges `cli`'s per-field overrides onto a loaded [`FileConfig`].
pub fn apply_overrides(config: &mut FileConfig, cli: &Cli) {
    if let Some(archive) = &cli.archive {
        config.archive_path = archive.clone();
    }
    if let Some(mask) = &cli.mask {
        config.archive_mask = mask.clone();
    }
    if let Some(device) = &cli.device {
        config.device_path = device.clone();
    }
    if cli.boost_priority {
        config.boost_priority = true;
    }
}

pub fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_minimal_config() {
        let text = r#"
            device_path = "/dev/fa_sniffer0"
            archive_path = "/mnt/archive/fa.dat"
            archive_mask = "0-3"
            input_block_size = 4096
            output_block_size = 4096
            first_decimation = 4
            second_decimation = 64
        "#;
        let config: FileConfig = toml::from_str(text).unwrap();
        assert_eq!(config.block_count, 64);
        assert!(!config.boost_priority);
        assert_eq!(config.parsed_mask().unwrap().count(), 4);
    }

    #[test]
    fn cli_overrides_take_precedence_over_file_config() {
        let mut config = FileConfig {
            device_path: "/dev/fa_sniffer0".to_string(),
            archive_path: PathBuf::from("/mnt/archive/fa.dat"),
            archive_mask: "0-3".to_string(),
            input_block_size: 4096,
            output_block_size: 4096,
            first_decimation: 4,
            second_decimation: 64,
            boost_priority: false,
            block_count: 64,
        };
        let cli = Cli {
            config: PathBuf::from("/etc/fa-archiver.toml"),
            archive: Some(PathBuf::from("/mnt/other/fa.dat")),
            mask: Some("0-1".to_string()),
            device: None,
            replay: None,
            boost_priority: true,
            describe: false,
            verbose: 0,
        };

        apply_overrides(&mut config, &cli);

        assert_eq!(config.archive_path, PathBuf::from("/mnt/other/fa.dat"));
        assert_eq!(config.archive_mask, "0-1");
        assert_eq!(config.device_path, "/dev/fa_sniffer0");
        assert!(config.boost_priority);
    }
}
