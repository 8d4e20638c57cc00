use std::path::PathBuf;

use clap::{Parser, Subcommand};

use fatxfs::options::{Mode, Options, CODE_USAGE};
use fatxfs::run;

/// FATX filesystem toolkit. The operating mode comes from the binary
/// name (fusefatx, mkfs.fatx, fsck.fatx, unrm.fatx, label.fatx) or from
/// an explicit subcommand.
#[derive(Parser)]
#[command(name = "fatx", version, about)]
struct Cli {
    /// Verbose reporting.
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Device or image file to operate on.
    #[arg(short = 'i', long, global = true)]
    input: Option<PathBuf>,

    /// Forced partition byte offset.
    #[arg(long, global = true, value_parser = parse_num)]
    offset: Option<u64>,

    /// Forced partition byte size.
    #[arg(long, global = true, value_parser = parse_num)]
    size: Option<u64>,

    /// Partition slot: sc, gc, cp, x1, x2.
    #[arg(short = 'p', long, global = true)]
    partition: Option<String>,

    /// Mount point (mount mode).
    #[arg(short = 'm', long, global = true)]
    mount: Option<PathBuf>,

    /// Recovery view: keep deleted entries visible.
    #[arg(short = 'r', long, global = true)]
    recover: bool,

    /// Extra option passed to the host filesystem adapter.
    #[arg(short = 'o', long, global = true)]
    option: Option<String>,

    /// Host adapter debug output.
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    /// Keep the host adapter in the foreground.
    #[arg(short = 'f', long, global = true)]
    foregrd: bool,

    /// Single-threaded host adapter.
    #[arg(short = 's', long, global = true)]
    singlethr: bool,

    /// Owner uid reported through the mount contract.
    #[arg(long, global = true)]
    uid: Option<u32>,

    /// Owner gid reported through the mount contract.
    #[arg(long, global = true)]
    gid: Option<u32>,

    /// Permission mask applied to reported modes.
    #[arg(long, global = true, value_parser = parse_num32)]
    mask: Option<u32>,

    /// New volume label.
    #[arg(short = 'l', long, global = true)]
    label: Option<String>,

    /// Cluster size in 512-byte sectors.
    #[arg(short = 'c', long = "cls-size", global = true)]
    cls_size: Option<u32>,

    /// Forced container layout: mu, file, hd, usb, kit.
    #[arg(short = 'b', long = "table", global = true)]
    table: Option<String>,

    /// Answer yes to every question.
    #[arg(short = 'y', long = "all", global = true)]
    yes: bool,

    /// Answer no to every question.
    #[arg(short = 'n', long = "none", global = true)]
    no: bool,

    /// Answer every question with its default.
    #[arg(short = 'a', long = "auto", global = true)]
    auto: bool,

    /// Fake writes: report success, touch nothing.
    #[arg(short = 't', long, global = true)]
    test: bool,

    /// unrm: recover into the host filesystem instead of in place.
    #[arg(long, global = true)]
    local: bool,

    /// Skip the final FAT consistency pass.
    #[arg(long, global = true)]
    nofat: bool,

    /// unrm: never displace older deleted entries.
    #[arg(long, global = true)]
    nodate: bool,

    /// Hide lost chains from the recovery view.
    #[arg(long, global = true)]
    nolost: bool,

    #[command(subcommand)]
    mode: Option<ModeCmd>,
}

#[derive(Subcommand, Clone, Copy)]
enum ModeCmd {
    /// Userspace filesystem core (host adapter required).
    Mount,
    /// Create a fresh FATX filesystem.
    Mkfs,
    /// Check and repair.
    Fsck,
    /// Recover deleted files.
    Unrm,
    /// Display or change the volume label.
    Label,
}

fn parse_num(s: &str) -> Result<u64, String> {
    let r = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    r.map_err(|e| e.to_string())
}

fn parse_num32(s: &str) -> Result<u32, String> {
    let r = match s.strip_prefix("0o") {
        Some(oct) => u32::from_str_radix(oct, 8),
        None => u32::from_str_radix(s, 8).or_else(|_| s.parse()),
    };
    r.map_err(|e| e.to_string())
}

/// The historical binary names select the mode directly.
fn mode_from_progname() -> Option<Mode> {
    let prog = std::env::args().next()?;
    let base = std::path::Path::new(&prog).file_name()?.to_str()?.to_string();
    match base.as_str() {
        "fusefatx" => Some(Mode::Mount),
        "mkfs.fatx" => Some(Mode::Mkfs),
        "fsck.fatx" => Some(Mode::Fsck),
        "unrm.fatx" => Some(Mode::Unrm),
        "label.fatx" => Some(Mode::Label),
        _ => None,
    }
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if cli.debug {
            log::LevelFilter::Debug
        } else if cli.verbose {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Warn
        })
        .init();

    let mode = match mode_from_progname().or(cli.mode.map(|m| match m {
        ModeCmd::Mount => Mode::Mount,
        ModeCmd::Mkfs => Mode::Mkfs,
        ModeCmd::Fsck => Mode::Fsck,
        ModeCmd::Unrm => Mode::Unrm,
        ModeCmd::Label => Mode::Label,
    })) {
        Some(m) => m,
        None => {
            eprintln!("no operating mode: use a mode subcommand or a tool binary name");
            std::process::exit(CODE_USAGE);
        }
    };
    let Some(input) = cli.input else {
        eprintln!("no input device: use --input");
        std::process::exit(CODE_USAGE);
    };

    let mut opts = Options::new(mode, input);
    opts.verbose = cli.verbose;
    opts.recover = opts.recover || cli.recover;
    opts.local = cli.local;
    opts.deldate = !cli.nodate;
    opts.nofat = cli.nofat;
    opts.test = cli.test;
    if cli.nolost {
        opts.set_dellost(false);
    }
    if let Some(table) = cli.table {
        opts.table = table;
    }
    if let Some(p) = cli.partition {
        opts.set_partition(&p);
    }
    opts.offset = cli.offset.unwrap_or(0);
    opts.size = cli.size.unwrap_or(0);
    opts.clus_size = cli.cls_size.unwrap_or(0);
    opts.volname = cli.label;
    opts.mount = cli.mount;
    opts.uid = cli.uid.unwrap_or(0);
    opts.gid = cli.gid.unwrap_or(0);
    opts.mask = cli.mask.unwrap_or(0o755);
    opts.force_answers(cli.yes, cli.no, cli.auto);
    if mode == Mode::Mount {
        // Accepted for the host adapter's benefit; the adapter itself
        // lives outside this crate.
        log::debug!(
            "adapter flags: foreground={} singlethread={} option={:?}",
            cli.foregrd,
            cli.singlethr,
            cli.option
        );
    }
    opts.set_writable(match mode {
        Mode::Label => opts.volname.is_some(),
        Mode::Unrm => !cli.local,
        Mode::Mount | Mode::Mkfs | Mode::Fsck => true,
    });

    std::process::exit(run::run(opts));
}
