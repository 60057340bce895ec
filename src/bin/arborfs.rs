//! Binary entry point for the arborfs administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};

use arborfs::admin::{inspect, mkfs, verify, InspectReport, MkfsReport, VerifyLevel, VerifyReport};
use arborfs::fs::{ConfigFile, FormatOptions};
use arborfs::storage::Profile;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "arborfs",
    version,
    about = "Administrative CLI for arborfs images",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "ARBORFS_CONFIG",
        help = "TOML config file (defaults to the user config dir when present)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct MkfsCmd {
    #[arg(value_name = "IMAGE", required = true, help = "Image files, one per device")]
    images: Vec<PathBuf>,

    #[arg(
        long,
        value_name = "BYTES",
        value_parser = parse_size,
        default_value = "256M",
        help = "Size of every image (accepts K/M/G suffixes)"
    )]
    size: u64,

    #[arg(long, help = "Filesystem label")]
    label: Option<String>,

    #[arg(long, value_name = "BYTES", help = "Tree node size")]
    node_size: Option<u32>,

    #[arg(long, value_enum, help = "Profile of metadata chunks")]
    metadata_profile: Option<ProfileArg>,

    #[arg(long, value_enum, help = "Profile of data chunks")]
    data_profile: Option<ProfileArg>,

    #[arg(long, help = "Start from small-image defaults instead of the config file")]
    scratch: bool,

    #[arg(long, help = "Replace existing image files")]
    force: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create and format image files")]
    Mkfs(MkfsCmd),

    #[command(about = "Print the superblock, backup roots and chunk table")]
    Inspect {
        #[arg(value_name = "IMAGE", required = true)]
        images: Vec<PathBuf>,
    },

    #[command(about = "Verify on-disk structures")]
    Verify {
        #[arg(value_name = "IMAGE", required = true)]
        images: Vec<PathBuf>,

        #[arg(
            long,
            value_enum,
            default_value_t = VerifyLevelArg::Full,
            help = "Verification level"
        )]
        level: VerifyLevelArg,
    },

    #[command(about = "Print the effective configuration as TOML")]
    Config,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ProfileArg {
    Single,
    Dup,
    Raid0,
    Raid1,
    Raid10,
    Raid5,
    Raid6,
}

impl From<ProfileArg> for Profile {
    fn from(profile: ProfileArg) -> Self {
        match profile {
            ProfileArg::Single => Profile::Single,
            ProfileArg::Dup => Profile::Dup,
            ProfileArg::Raid0 => Profile::Raid0,
            ProfileArg::Raid1 => Profile::Raid1,
            ProfileArg::Raid10 => Profile::Raid10,
            ProfileArg::Raid5 => Profile::Raid5,
            ProfileArg::Raid6 => Profile::Raid6,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

fn main() {
    install_tracing_subscriber();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn install_tracing_subscriber() {
    let filter = EnvFilter::try_from_env("ARBORFS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Mkfs(cmd) => {
            let opts = build_format_options(&cmd, &config);
            let report = mkfs(&cmd.images, cmd.size, &opts, cmd.force)?;
            emit(cli.format, &report, || print_mkfs_text(&report))?;
        }
        Command::Inspect { images } => {
            let report = inspect(&images)?;
            emit(cli.format, &report, || print_inspect_text(&report))?;
        }
        Command::Verify { images, level } => {
            let report = verify(&images, level.into())?;
            emit(cli.format, &report, || print_verify_text(&report))?;
            if !report.success {
                std::process::exit(2);
            }
        }
        Command::Config => match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
            OutputFormat::Text => print!("{}", config.to_toml()?),
        },
    }
    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("arborfs").join("config.toml"))
}

fn load_config(explicit: Option<&Path>) -> Result<ConfigFile, Box<dyn Error>> {
    if let Some(path) = explicit {
        return Ok(ConfigFile::load(path)?);
    }
    match default_config_path() {
        Some(path) if path.exists() => Ok(ConfigFile::load(&path)?),
        _ => Ok(ConfigFile::default()),
    }
}

fn build_format_options(cmd: &MkfsCmd, config: &ConfigFile) -> FormatOptions {
    let mut opts = if cmd.scratch {
        FormatOptions::scratch()
    } else {
        config.format.clone()
    };
    if let Some(label) = &cmd.label {
        opts.label = label.clone();
    }
    if let Some(node_size) = cmd.node_size {
        opts.node_size = node_size;
    }
    if let Some(profile) = cmd.metadata_profile {
        opts.metadata_profile = profile.into();
    }
    if let Some(profile) = cmd.data_profile {
        opts.data_profile = profile.into();
    }
    opts
}

fn parse_size(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    let (digits, shift) = match trimmed.char_indices().last() {
        Some((at, 'k' | 'K')) => (&trimmed[..at], 10),
        Some((at, 'm' | 'M')) => (&trimmed[..at], 20),
        Some((at, 'g' | 'G')) => (&trimmed[..at], 30),
        Some((at, 't' | 'T')) => (&trimmed[..at], 40),
        _ => (trimmed, 0),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{raw}'"))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{raw}' overflows"))
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_mkfs_text(report: &MkfsReport) {
    println!(
        "Formatted {} device(s) of {} bytes: fsid={} label={:?} node_size={} generation={}",
        report.devices.len(),
        report.device_size,
        report.fsid,
        report.label,
        report.node_size,
        report.generation
    );
    for (idx, device) in report.devices.iter().enumerate() {
        println!("  devid {} {}", idx + 1, device);
    }
}

fn print_inspect_text(report: &InspectReport) {
    let sb = &report.superblock;
    println!("Superblock:");
    println!("  fsid={} label={:?}", sb.fsid, sb.label);
    println!(
        "  generation={} root={:#x} (level {}) chunk_root={:#x} (level {}, generation {})",
        sb.generation,
        sb.root,
        sb.root_level,
        sb.chunk_root,
        sb.chunk_root_level,
        sb.chunk_root_generation
    );
    println!(
        "  total_bytes={} bytes_used={} num_devices={} node_size={} sector_size={}",
        sb.total_bytes, sb.bytes_used, sb.num_devices, sb.node_size, sb.sector_size
    );
    println!(
        "  cache_generation={} bootstrap_chunks={}",
        sb.cache_generation, sb.bootstrap_chunks
    );
    println!();
    println!("Backup roots:");
    for backup in report.backups.iter().filter(|b| !b.is_empty()) {
        println!(
            "  [{}] gen={} root={:#x} chunk={:#x} extent={:#x} fs={:#x} dev={:#x} csum={:#x} used={}",
            backup.slot,
            backup.tree_root_gen,
            backup.tree_root,
            backup.chunk_root,
            backup.extent_root,
            backup.fs_root,
            backup.dev_root,
            backup.csum_root,
            backup.bytes_used
        );
    }
    println!();
    println!("Chunks:");
    for chunk in &report.chunks {
        let stripes: Vec<String> = chunk
            .stripes
            .iter()
            .map(|s| format!("{}@{:#x}", s.dev_id, s.offset))
            .collect();
        println!(
            "  {:#012x} len={} {} {} used={} free={}{} stripes=[{}]",
            chunk.offset,
            chunk.length,
            chunk.kind,
            chunk.profile,
            chunk.used,
            chunk.free,
            if chunk.has_cache { " cached" } else { "" },
            stripes.join(", ")
        );
    }
    println!();
    println!("Devices:");
    for device in &report.devices {
        println!(
            "  devid {} uuid={} total={} used={} unallocated={}",
            device.dev_id, device.uuid, device.total_bytes, device.bytes_used, device.unallocated
        );
    }
    println!();
    println!("Trees:");
    for tree in &report.trees {
        println!(
            "  {:<10} id={} root={:#x} level={} generation={} items={}",
            tree.name,
            tree.id,
            tree.address,
            tree.level,
            tree.generation,
            tree.items
        );
    }
}

fn print_verify_text(report: &VerifyReport) {
    println!(
        "Verify ({:?}) => success={} devices={} superblock_copies={} trees={} nodes={} items={} extents={} chunks={}",
        report.level,
        report.success,
        report.counts.devices,
        report.counts.superblock_copies,
        report.counts.trees,
        report.counts.nodes,
        report.counts.items,
        report.counts.extents,
        report.counts.chunks,
    );
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_accept_suffixes() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("64M"), Ok(64 << 20));
        assert_eq!(parse_size("2g"), Ok(2 << 30));
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
