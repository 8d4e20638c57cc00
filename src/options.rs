use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Operating mode, normally selected by the binary name
/// (fusefatx, mkfs.fatx, fsck.fatx, unrm.fatx, label.fatx).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Mount,
    Mkfs,
    Fsck,
    Unrm,
    Label,
}

/// Exit codes shared by all modes.
pub const CODE_NOERR: i32 = 0;
pub const CODE_CORRD: i32 = 1 << 0;
pub const CODE_NCORR: i32 = 1 << 2;
pub const CODE_OPERR: i32 = 1 << 3;
pub const CODE_USAGE: i32 = 1 << 4;

/// Default directory for recovered lost chains.
pub const DEF_LOSTFOUND: &str = "lost+found";
/// File prefix for recovered lost chains.
pub const DEF_FILEPRE: &str = "FILE";

/// Runtime configuration carried inside the shared `Volume` context.
///
/// Plain data apart from the prompt bookkeeping, which uses atomics so
/// that repair passes can run against a shared `&Options`.
pub struct Options {
    pub mode: Mode,
    pub input: PathBuf,
    pub verbose: bool,
    /// Recovery view: deleted entries stay visible in the tree.
    pub recover: bool,
    /// unrm: dump recovered files to the host filesystem instead of
    /// restoring them in place.
    pub local: bool,
    /// unrm: allow displacing older deleted entries during `guess`.
    /// Cleared by --nodate.
    pub deldate: bool,
    /// Overlay reads fall back to the on-disk FAT. Cleared by --nolost,
    /// and forced on temporarily while marking chains.
    pub dellost: AtomicBool,
    /// Skip the final FAT consistency pass.
    pub nofat: bool,
    /// Fake writes: report success, touch nothing.
    pub test: bool,

    /// Forced container layout (mu, file, hd, usb, kit) or empty for
    /// auto-probing.
    pub table: String,
    /// Partition slot: sc, gc, cp, x1, x2.
    pub partition: std::sync::Mutex<String>,
    /// Forced partition byte offset.
    pub offset: u64,
    /// Forced partition byte size.
    pub size: u64,
    /// Forced cluster size in 512-byte sectors.
    pub clus_size: u32,

    /// New volume label (label and mkfs modes).
    pub volname: Option<String>,
    /// Mount point (mount mode).
    pub mount: Option<PathBuf>,
    pub uid: u32,
    pub gid: u32,
    pub mask: u32,

    pub lostfound: String,
    pub foundfile: String,
    pub filecount: AtomicU32,

    force_yes: bool,
    force_no: bool,
    force_auto: bool,
    /// Whether any repair prompt fired, and whether every one was
    /// answered yes; together they drive the corrected-vs-remaining
    /// exit code split.
    asked: AtomicBool,
    all_yes: AtomicBool,
    writable: bool,
}

impl Options {
    pub fn new(mode: Mode, input: PathBuf) -> Self {
        Options {
            mode,
            input,
            verbose: false,
            recover: mode == Mode::Unrm,
            local: false,
            deldate: true,
            dellost: AtomicBool::new(true),
            nofat: false,
            test: false,
            table: String::new(),
            partition: std::sync::Mutex::new("x2".to_string()),
            offset: 0,
            size: 0,
            clus_size: 0,
            volname: None,
            mount: None,
            uid: 0,
            gid: 0,
            mask: 0o755,
            lostfound: DEF_LOSTFOUND.to_string(),
            foundfile: DEF_FILEPRE.to_string(),
            filecount: AtomicU32::new(0),
            force_yes: false,
            force_no: false,
            force_auto: false,
            asked: AtomicBool::new(false),
            all_yes: AtomicBool::new(true),
            writable: mode != Mode::Label,
        }
    }

    pub fn force_answers(&mut self, yes: bool, no: bool, auto: bool) {
        self.force_yes = yes;
        self.force_no = no;
        self.force_auto = auto;
    }

    pub fn set_writable(&mut self, w: bool) {
        self.writable = w;
    }

    /// Whether the device may actually be modified. Test mode fakes
    /// success without touching storage.
    pub fn writeable(&self) -> bool {
        self.writable && !self.test
    }

    pub fn dellost(&self) -> bool {
        self.dellost.load(Ordering::Relaxed)
    }

    pub fn set_dellost(&self, v: bool) {
        self.dellost.store(v, Ordering::Relaxed);
    }

    pub fn partition(&self) -> String {
        self.partition.lock().unwrap().clone()
    }

    pub fn set_partition(&self, p: &str) {
        *self.partition.lock().unwrap() = p.to_string();
    }

    /// Ask a repair question. Honors -y/-n/-a before falling back to an
    /// interactive [Y/n] prompt; the running conjunction of answers feeds
    /// the exit code.
    pub fn ask(&self, question: &str, default: bool) -> bool {
        let res = if self.force_no {
            eprintln!("{question} [{}] :n", if default { "Y/n" } else { "y/N" });
            false
        } else if self.force_yes {
            eprintln!("{question} [{}] :y", if default { "Y/n" } else { "y/N" });
            true
        } else if self.force_auto {
            eprintln!(
                "{question} [{}] :{}",
                if default { "Y/n" } else { "y/N" },
                if default { "y" } else { "n" }
            );
            default
        } else {
            eprint!("{question} [{}] :", if default { "Y/n" } else { "y/N" });
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(_) => match line.trim().chars().next() {
                    Some('y') | Some('Y') => true,
                    Some('n') | Some('N') => false,
                    _ => default,
                },
                Err(_) => default,
            }
        };
        self.asked.store(true, Ordering::Relaxed);
        self.all_yes.fetch_and(res, Ordering::Relaxed);
        res
    }

    pub fn any_asked(&self) -> bool {
        self.asked.load(Ordering::Relaxed)
    }

    pub fn all_answers_yes(&self) -> bool {
        self.all_yes.load(Ordering::Relaxed)
    }

    pub fn next_found_index(&self) -> u32 {
        self.filecount.fetch_add(1, Ordering::Relaxed)
    }

    pub fn bump_found_index(&self, at_least: u32) {
        self.filecount.fetch_max(at_least, Ordering::Relaxed);
    }
}
