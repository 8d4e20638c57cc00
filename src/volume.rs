use std::sync::{Arc, RwLock};

use crate::device::Device;
use crate::entry::Entry;
use crate::error::Result;
use crate::fat::{DiskFat, Fat};
use crate::options::{Mode, Options};
use crate::overlay::OverlayFat;
use crate::partition::FatxPar;

/// Hidden file carrying the volume label.
pub const LABEL_FILE: &str = "name.txt";

/// The shared context making the device, geometry, FAT and root entry
/// reachable from anywhere. Owned by the orchestrator with an explicit
/// setup/teardown lifecycle; there is no hidden global.
pub struct Volume {
    pub opts: Arc<Options>,
    pub dev: Arc<Device>,
    pub par: FatxPar,
    pub fat: RwLock<Fat>,
    label: RwLock<String>,
    root: RwLock<Option<Arc<Entry>>>,
}

impl Volume {
    /// Open the configured input and bring the volume up: device, then
    /// partition geometry, then the FAT variant for the mode, then the
    /// root tree (mkfs builds its root later).
    pub fn setup(opts: Options) -> Result<Arc<Volume>> {
        let dev = Device::open(&opts.input, opts.writeable())?;
        Volume::assemble(opts, dev)
    }

    /// Bring a volume up over an already-open device (in-memory images,
    /// tests).
    pub fn with_device(opts: Options, dev: Device) -> Result<Arc<Volume>> {
        Volume::assemble(opts, dev)
    }

    fn assemble(opts: Options, dev: Device) -> Result<Arc<Volume>> {
        let opts = Arc::new(opts);
        let dev = Arc::new(dev);
        let par = FatxPar::detect(&dev, &opts)?;
        let disk = DiskFat::new(dev.clone(), opts.clone(), par.clone());
        let overlayed = matches!(opts.mode, Mode::Fsck | Mode::Unrm)
            || (opts.mode == Mode::Mount && opts.recover);
        let fat = if overlayed {
            Fat::Overlay(OverlayFat::new(disk))
        } else {
            Fat::Disk(disk)
        };
        let vol = Arc::new(Volume {
            opts: opts.clone(),
            dev,
            par,
            fat: RwLock::new(fat),
            label: RwLock::new(String::new()),
            root: RwLock::new(None),
        });
        if opts.mode != Mode::Mkfs {
            let root = Entry::root(&vol);
            vol.set_root(root);
        }
        Ok(vol)
    }

    /// The root entry. Present in every mode once setup completed (mkfs
    /// installs it when the filesystem has been written).
    pub fn root(&self) -> Arc<Entry> {
        self.root
            .read()
            .unwrap()
            .clone()
            .expect("volume root not initialised")
    }

    pub fn set_root(&self, root: Arc<Entry>) {
        *self.root.write().unwrap() = Some(root);
    }

    pub fn label(&self) -> String {
        self.label.read().unwrap().clone()
    }

    pub fn set_label(&self, label: &str) {
        *self.label.write().unwrap() = label.to_string();
    }

    /// Release the tree. Parent links are weak, so dropping the root
    /// frees every node; open buffers were flushed by their close
    /// bracket.
    pub fn teardown(&self) {
        *self.root.write().unwrap() = None;
    }
}
