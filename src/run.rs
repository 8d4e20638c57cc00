use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{error, warn};

use crate::entry::{Entry, Pass, Status};
use crate::options::{
    Mode, Options, CODE_CORRD, CODE_NCORR, CODE_NOERR, CODE_OPERR, CODE_USAGE,
};
use crate::partition::encode_label;
use crate::volume::{Volume, LABEL_FILE};

/// Drive one full invocation: setup, the mode pipeline, exit code.
pub fn run(opts: Options) -> i32 {
    let mode = opts.mode;
    if mode != Mode::Label {
        eprintln!("Analysing filesystem, please wait.");
    }
    let vol = match Volume::setup(opts) {
        Ok(v) => v,
        Err(e) => {
            error!("{e}");
            return CODE_OPERR;
        }
    };
    let code = match pipeline(&vol) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            CODE_OPERR
        }
    };
    if vol.opts.verbose {
        if vol.dev.modified() {
            eprintln!("Changes have been made.");
        } else {
            eprintln!("No change has been made.");
        }
    }
    vol.teardown();
    code
}

/// The mode pipeline over an initialised volume. Returns the exit code.
pub fn pipeline(vol: &Arc<Volume>) -> Result<i32> {
    let opts = &vol.opts;
    match opts.mode {
        Mode::Fsck | Mode::Unrm => {
            eprintln!("Finding all files and directories.");
            vol.root().analyse(vol, Pass::FindFile, "");
            if opts.mode == Mode::Unrm {
                eprintln!("Finding all deleted files and directories.");
                vol.fat.write().unwrap().fatlost();
                vol.root().analyse(vol, Pass::FindDel, "");
                eprintln!("Trying to recover deleted files and directories.");
                if !opts.local {
                    vol.fat.write().unwrap().gapcheck();
                }
                vol.root().analyse(vol, Pass::TryRecov, "");
            }
            if !opts.nofat {
                eprintln!("Checking FAT consistency.");
                vol.fat.write().unwrap().fatlost();
                vol.fat.write().unwrap().fatcheck();
                if opts.mode == Mode::Unrm {
                    recover_lost(vol);
                }
            }
            if opts.mode == Mode::Fsck {
                if vol.label().is_empty() {
                    eprintln!("Warning: volume has no name.");
                }
                if opts.verbose {
                    let avail = vol.fat.write().unwrap().clsavail();
                    eprintln!(
                        "Volume name:\t{}\nClusters size:\t{}\nTotal clusters:\t{}\nClusters free:\t{}",
                        if vol.label().is_empty() {
                            "none".to_string()
                        } else {
                            vol.label()
                        },
                        vol.par.clus_size,
                        vol.par.clus_fat,
                        avail
                    );
                }
            }
            Ok(if !opts.any_asked() {
                CODE_NOERR
            } else if opts.all_answers_yes() {
                if vol.dev.modified() {
                    CODE_CORRD
                } else {
                    CODE_NOERR
                }
            } else {
                CODE_NCORR
            })
        }
        Mode::Mkfs => {
            if !opts.ask(
                &format!(
                    "Are you sure you want to erase all data in {} ?",
                    opts.input.display()
                ),
                false,
            ) {
                return Ok(CODE_NOERR);
            }
            mkfs(vol)?;
            if let Some(label) = opts.volname.clone() {
                write_label(vol, &label)?;
            }
            Ok(CODE_NOERR)
        }
        Mode::Label => {
            match &opts.volname {
                Some(name) => {
                    vol.fat.write().unwrap().gapcheck();
                    write_label(vol, name)?;
                }
                None => {
                    if vol.label().is_empty() {
                        println!("No volume name.");
                    } else {
                        println!("{}", vol.label());
                    }
                }
            }
            Ok(CODE_NOERR)
        }
        Mode::Mount => {
            if !opts.recover {
                vol.fat.write().unwrap().gapcheck();
            }
            // The core is ready; driving a real mount needs the host
            // filesystem adapter, which consumes MountDispatch from the
            // library side.
            error!(
                "mounting requires a host filesystem adapter; \
                 use the library MountDispatch interface"
            );
            Ok(CODE_USAGE)
        }
    }
}

/// Write the boot structures, clear the FAT and the root cluster, then
/// install a fresh root directory.
fn mkfs(vol: &Arc<Volume>) -> Result<()> {
    eprint!("Creating new FATX filesystem");
    vol.par.write(&vol.dev, &vol.opts)?;
    eprint!(".");
    vol.fat.write().unwrap().erase()?;
    eprint!(".");
    vol.dev
        .write(vol.par.root_start, &vec![0u8; vol.par.clus_size as usize])?;
    eprint!(".");
    let root = Entry::create(vol, "", 0, true);
    {
        let mut st = root.state_mut();
        st.status = Status::Valid;
        st.parent = Arc::downgrade(&root);
    }
    if root.state().cluster != vol.par.root_clus {
        return Err(anyhow!("root landed on an unexpected cluster"));
    }
    vol.set_root(root);
    eprintln!("done.");
    eprintln!(
        "FATX filesystem created with {} clusters.",
        vol.par.clus_fat
    );
    Ok(())
}

/// Find or create the hidden label file and store the new name in it.
fn write_label(vol: &Arc<Volume>, name: &str) -> Result<()> {
    vol.set_label(name);
    let lab = encode_label(name);
    let root = vol.root();
    let idx = match root.find(vol, LABEL_FILE) {
        Some(idx) => idx,
        None => {
            let f = Entry::create(vol, LABEL_FILE, 0, false);
            if !root.addtodir(vol, &f) {
                return Err(anyhow!("unable to create {LABEL_FILE}"));
            }
            f
        }
    };
    {
        let mut st = idx.state_mut();
        st.flags.lab = true;
        st.flags.hid = true;
    }
    idx.save(vol);
    if idx.resize(vol, lab.len() as u64) && idx.write_data(vol, 0, &lab) {
        eprintln!("Volume name has been changed to {name}");
        Ok(())
    } else {
        warn!("unable to change volume name");
        Err(anyhow!("unable to change volume name"))
    }
}

/// unrm: offer each lost chain a new home, either a numbered file under
/// `lost+found` on the volume or a dump to the host filesystem with
/// `--local`. Numbering continues past the highest existing index.
fn recover_lost(vol: &Arc<Volume>) {
    let opts = &vol.opts;
    let lost: Vec<(u32, u64)> = {
        let mut fat = vol.fat.write().unwrap();
        let par_cs = vol.par.clus_size;
        match fat.overlay() {
            None => return,
            Some(o) => o
                .lost
                .iter()
                .map(|va| (va.first_cluster(), va.nbcls() as u64 * par_cs))
                .collect(),
        }
    };
    for (first, bytes) in lost {
        let target = if opts.local {
            "the local directory".to_string()
        } else {
            opts.lostfound.clone()
        };
        if !opts.ask(
            &format!("Found unknown chain at 0x{first:08X} ({bytes}). Recover in {target} ?"),
            false,
        ) {
            continue;
        }
        if opts.local {
            let name = format!("{}{:03}", opts.foundfile, opts.next_found_index());
            let f = Entry::create(vol, &name, 0, false);
            {
                let mut st = f.state_mut();
                st.cluster = first;
                st.size = bytes;
            }
            f.recover(vol);
            continue;
        }
        let root = vol.root();
        let lf = match root.find(vol, &opts.lostfound) {
            Some(lf) => {
                // Continue numbering after the highest existing index.
                for e in lf.state().children.iter() {
                    let ename = e.state().name.clone();
                    if let Some(rest) = ename.strip_prefix(opts.foundfile.as_str()) {
                        if let Ok(n) = rest.parse::<u32>() {
                            opts.bump_found_index(n + 1);
                        }
                    }
                }
                lf
            }
            None => {
                let dir = Entry::create(vol, &opts.lostfound, 0, true);
                if !root.addtodir(vol, &dir) {
                    warn!("unable to create directory {}", opts.lostfound);
                    return;
                }
                dir
            }
        };
        let name = format!("{}{:03}", opts.foundfile, opts.next_found_index());
        let f = Entry::create(vol, &name, 0, false);
        {
            let mut st = f.state_mut();
            st.cluster = first;
            st.size = bytes;
        }
        if !lf.addtodir(vol, &f) {
            warn!("unable to create file {name}");
        }
    }
}
