use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use log::debug;

use crate::areas::AreaList;
use crate::entry::Entry;
use crate::fat::{DiskFat, Fat, FLK};
use crate::options::Mode;
use crate::partition::clsprint;

/// Shadow status of a cluster in the in-memory FAT view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    /// No overlay knowledge, the on-disk value rules.
    Disk,
    /// Claimed by a deleted entry during `guess`.
    Deleted,
    /// Overlay diverged from disk; reconciled by fsck.
    Modified,
    /// Part of a reachable valid entry's chain.
    Marked,
}

/// One overlay cell: the successor link, the owning entry and the shadow
/// status.
pub struct Link {
    pub next: u32,
    pub ent: Weak<Entry>,
    pub status: CellStatus,
}

/// The in-memory FAT overlay used by fsck and undelete: a per-cluster
/// shadow over the on-disk map plus the set of lost chains.
pub struct OverlayFat {
    pub disk: DiskFat,
    pub memchain: BTreeMap<u32, Link>,
    /// Chains that are non-FREE on disk but owned by no reachable valid
    /// entry.
    pub lost: Vec<AreaList>,
}

impl OverlayFat {
    pub fn new(disk: DiskFat) -> OverlayFat {
        OverlayFat {
            disk,
            memchain: BTreeMap::new(),
            lost: Vec::new(),
        }
    }

    /// Chain cell in the recovery view: the overlay wins; unmapped cells
    /// fall back to disk only while `dellost` holds, erasing lost chains
    /// from sight otherwise.
    pub fn read(&mut self, p: u32) -> u32 {
        match self.memchain.get(&p) {
            Some(link) => link.next,
            None => {
                if self.disk.opts.dellost() {
                    self.disk.read(p)
                } else {
                    FLK
                }
            }
        }
    }

    /// Insert or update an overlay cell. Updates keep the existing
    /// successor when `next` is FREE so a relabel cannot truncate a
    /// chain.
    pub fn change(&mut self, p: u32, ent: Weak<Entry>, next: u32, status: CellStatus) {
        match self.memchain.get_mut(&p) {
            Some(link) => {
                if next != FLK {
                    link.next = next;
                }
                link.ent = ent;
                link.status = status;
            }
            None => {
                self.memchain.insert(p, Link { next, ent, status });
            }
        }
    }

    pub fn status(&self, p: u32) -> CellStatus {
        self.memchain.get(&p).map_or(CellStatus::Disk, |l| l.status)
    }

    pub fn getentry(&self, p: u32) -> Option<Arc<Entry>> {
        self.memchain.get(&p).and_then(|l| l.ent.upgrade())
    }

    pub fn set_status(&mut self, p: u32, status: CellStatus) {
        if let Some(link) = self.memchain.get_mut(&p) {
            link.status = status;
        }
    }
}

impl Fat {
    /// Label every link of the chain at `p` with (owner, marked),
    /// forcing the on-disk view for the traversal so lost-chain masking
    /// cannot hide the tail. Plain disk FATs just return the areas.
    pub fn markchain(&mut self, p: u32, ent: &Arc<Entry>) -> AreaList {
        let saved = match self {
            Fat::Disk(_) => return self.getareas(p),
            Fat::Overlay(o) => {
                let saved = o.disk.opts.dellost();
                o.disk.opts.set_dellost(true);
                saved
            }
        };
        let links = self.walk_chain(p);
        if let Fat::Overlay(o) = self {
            for &(c, next) in &links {
                o.change(c, Arc::downgrade(ent), next, CellStatus::Marked);
            }
            o.disk.opts.set_dellost(saved);
        }
        self.areas_from_walk(&links)
    }

    /// Rebuild the lost-chain set: every cluster that is non-FREE on disk
    /// with no overlay knowledge and not yet covered roots a lost chain;
    /// subsumed chains are dropped.
    pub fn fatlost(&mut self) {
        let o = match self {
            Fat::Disk(_) => return,
            Fat::Overlay(o) => o,
        };
        let mut candidates = Vec::new();
        o.disk.for_each_cell(|c, v| {
            if v != FLK {
                candidates.push(c);
            }
        });
        let mut lost: Vec<AreaList> = Vec::new();
        for c in candidates {
            if let Fat::Overlay(o) = &*self {
                if o.status(c) != CellStatus::Disk {
                    continue;
                }
            }
            if lost.iter().any(|va| va.isin(c)) {
                continue;
            }
            let va = self.getareas(c);
            if va.is_empty() {
                continue;
            }
            lost.retain(|i| !va.isin(i.first_cluster()));
            lost.push(va);
        }
        debug!("fatlost: {} lost chain(s)", lost.len());
        if let Fat::Overlay(o) = self {
            o.lost = lost;
        }
    }

    /// fsck reconciliation: offer to write every diverged overlay cell
    /// back to disk, then offer to free each lost chain. The unrm
    /// counterpart (recovery into lost+found) is driven by the
    /// orchestrator, which owns the entry tree.
    pub fn fatcheck(&mut self) {
        let opts = self.disk().opts.clone();
        if opts.mode != Mode::Fsck {
            return;
        }
        let modified: Vec<(u32, u32)> = match self {
            Fat::Disk(_) => return,
            Fat::Overlay(o) => o
                .memchain
                .iter()
                .filter(|(_, l)| l.status == CellStatus::Modified)
                .map(|(&p, l)| (p, l.next))
                .collect(),
        };
        for (p, next) in modified {
            let on_disk = self.disk_read(p);
            if opts.ask(
                &format!(
                    "Cluster number in FAT 0x{p:08X} shall be {} instead of {}. Correct it ?",
                    clsprint(next, p),
                    clsprint(on_disk, p)
                ),
                true,
            ) {
                let _ = self.write(p, next);
                if let Fat::Overlay(o) = self {
                    o.memchain.remove(&p);
                }
            }
        }
        let lost: Vec<(u32, u64)> = match self {
            Fat::Disk(_) => return,
            Fat::Overlay(o) => o
                .lost
                .iter()
                .map(|va| {
                    (
                        va.first_cluster(),
                        va.nbcls() as u64 * o.disk.par.clus_size,
                    )
                })
                .collect(),
        };
        for (first, bytes) in lost {
            if opts.ask(
                &format!("Found unknown chain at 0x{first:08X} ({bytes}). Free it ?"),
                true,
            ) {
                self.free(first);
            }
        }
    }
}
