use std::env::set_var;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{bail, Context, Result};
use clap::{arg, command, value_parser, ArgAction};
use log::{error, info};

use btrfs2ext4::{ConversionSummary, ConvertOptions};

fn init_logs() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();
}

fn main() {
    let matches = command!()
        .about("In-place Btrfs to Ext4 filesystem converter")
        .arg(arg!(<device> "Device or image file to convert"))
        .arg(
            arg!(-n --"dry-run" "Simulate the conversion (read-only, no writes)")
                .action(ArgAction::SetTrue),
        )
        .arg(arg!(-r --rollback "Roll back a previous conversion").action(ArgAction::SetTrue))
        .arg(
            arg!(-b --"block-size" <BYTES> "Ext4 block size")
                .value_parser(value_parser!(u32))
                .default_value("4096"),
        )
        .arg(
            arg!(-i --"inode-ratio" <BYTES> "Bytes of device per inode")
                .value_parser(value_parser!(u32))
                .default_value("16384"),
        )
        .arg(
            arg!(-w --workdir <PATH> "Working directory for temp spill files")
                .value_parser(value_parser!(PathBuf))
                .default_value("."),
        )
        .arg(
            arg!(-m --"memory-limit" <BYTES> "Max RAM for auxiliary structures (0 = auto, 60% of physical)")
                .value_parser(value_parser!(u64))
                .default_value("0"),
        )
        .arg(arg!(-v --verbose "Detailed output (same as RUST_LOG=debug)").action(ArgAction::SetTrue))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();

    match run(&matches) {
        Ok(()) => exit(0),
        Err(e) => {
            error!("{:#}", e);
            exit(1);
        }
    }
}

fn run(matches: &clap::ArgMatches) -> Result<()> {
    let device = PathBuf::from(matches.get_one::<String>("device").unwrap());
    check_device(&device)?;

    let block_size = *matches.get_one::<u32>("block-size").unwrap();
    if !matches!(block_size, 1024 | 2048 | 4096) {
        bail!(
            "invalid block size {} (must be 1024, 2048, or 4096)",
            block_size
        );
    }

    if matches.get_flag("rollback") {
        // The footer location depends on the block size the conversion
        // was run with.
        btrfs2ext4::rollback(&device, block_size).context("rollback failed")?;
        info!("rollback complete; run `btrfs check` to verify");
        return Ok(());
    }

    let opts = ConvertOptions {
        device_path: device.clone(),
        dry_run: matches.get_flag("dry-run"),
        block_size,
        inode_ratio: *matches.get_one::<u32>("inode-ratio").unwrap(),
        workdir: matches.get_one::<PathBuf>("workdir").unwrap().clone(),
        memory_limit: *matches.get_one::<u64>("memory-limit").unwrap(),
    };

    let summary = btrfs2ext4::convert(&opts).context("conversion failed")?;
    report(&summary, &device);
    Ok(())
}

/// A block device needs root; anything else odd gets a warning only.
fn check_device(path: &PathBuf) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let meta = std::fs::metadata(path)
        .with_context(|| format!("{}: cannot stat device", path.display()))?;
    let ftype = meta.file_type();

    if ftype.is_block_device() && !nix::unistd::geteuid().is_root() {
        bail!("must run as root to operate on a block device");
    }
    if !ftype.is_block_device() && !ftype.is_file() {
        log::warn!("{} is not a block device or image file", path.display());
    }
    Ok(())
}

fn report(summary: &ConversionSummary, device: &PathBuf) {
    if summary.dry_run {
        info!(
            "dry run finished: {} inodes would map into {} groups ({} relocations needed)",
            summary.inode_count, summary.num_groups, summary.relocation_entries
        );
        return;
    }
    info!(
        "converted {} inodes into {} groups ({} blocks); {} extents relocated ({} bytes)",
        summary.inode_count,
        summary.num_groups,
        summary.total_blocks,
        summary.relocation_entries,
        summary.relocated_bytes
    );
    info!("next steps: e2fsck -f {0} && mount {0} /mnt", device.display());
}
