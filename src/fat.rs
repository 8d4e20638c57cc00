use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::areas::{Area, AreaList};
use crate::cache::ReadCache;
use crate::device::Device;
use crate::error::Result;
use crate::options::{Mode, Options};
use crate::overlay::OverlayFat;
use crate::partition::FatxPar;

/// FAT cell value: free link.
pub const FLK: u32 = 0x0000_0000;
/// FAT cell value: end of chain. 16-bit FATs store 0xFFFF and are
/// sign-extended on read.
pub const EOC: u32 = 0xFFFF_FFFF;

/// FAT size divider for the cache capacity.
const MAX_CACHE_DIV: u64 = 1000;
/// Cache size divider for the read-ahead width.
const NB_CACHE_DIV: usize = 10;

/// Free-gap index: maximal runs of FREE clusters, keyed both by start
/// cluster (adjacency merges) and by size (best-fit lookups).
#[derive(Debug, Default)]
pub struct GapIndex {
    by_start: BTreeMap<u32, u32>,
    by_size: BTreeSet<(u32, u32)>,
}

impl GapIndex {
    pub fn clear(&mut self) {
        self.by_start.clear();
        self.by_size.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    pub fn insert(&mut self, start: u32, size: u32) {
        if size == 0 {
            return;
        }
        if let Some(old) = self.by_start.insert(start, size) {
            self.by_size.remove(&(old, start));
        }
        self.by_size.insert((size, start));
    }

    pub fn remove(&mut self, start: u32) -> Option<u32> {
        let size = self.by_start.remove(&start)?;
        self.by_size.remove(&(size, start));
        Some(size)
    }

    /// Gap containing the highest clusters.
    pub fn last(&self) -> Option<(u32, u32)> {
        self.by_start.iter().next_back().map(|(&s, &z)| (s, z))
    }

    /// Smallest gap of size at least `n`.
    pub fn best_fit(&self, n: u32) -> Option<(u32, u32)> {
        self.by_size
            .range((n, 0)..)
            .next()
            .map(|&(size, start)| (start, size))
    }

    /// Largest gap.
    pub fn largest(&self) -> Option<(u32, u32)> {
        self.by_size.iter().next_back().map(|&(size, start)| (start, size))
    }

    /// Gap starting exactly at `start`, if any.
    pub fn at(&self, start: u32) -> Option<u32> {
        self.by_start.get(&start).copied()
    }

    pub fn total(&self) -> u32 {
        self.by_start.values().sum()
    }

    /// Neighbouring gaps of a candidate run `[start, stop]`.
    fn neighbours(&self, start: u32, stop: u32) -> (Option<(u32, u32)>, Option<(u32, u32)>) {
        let prev = self
            .by_start
            .range(..start)
            .next_back()
            .filter(|(&s, &z)| s + z == start)
            .map(|(&s, &z)| (s, z));
        let next = self
            .by_start
            .get(&(stop + 1))
            .map(|&z| (stop + 1, z));
        (prev, next)
    }

    /// Fold a freed run into the index, merging adjacent gaps.
    pub fn fold(&mut self, start: u32, stop: u32) {
        let len = stop - start + 1;
        match self.neighbours(start, stop) {
            (Some((ps, pz)), Some((ns, nz))) => {
                self.remove(ps);
                self.remove(ns);
                self.insert(ps, pz + len + nz);
            }
            (Some((ps, pz)), None) => {
                self.remove(ps);
                self.insert(ps, pz + len);
            }
            (None, Some((ns, nz))) => {
                self.remove(ns);
                self.insert(start, len + nz);
            }
            (None, None) => self.insert(start, len),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.by_start.iter().map(|(&s, &z)| (s, z))
    }
}

/// The on-disk file allocation table: cached chain cells plus the
/// free-gap index.
pub struct DiskFat {
    pub dev: Arc<Device>,
    pub opts: Arc<Options>,
    pub par: FatxPar,
    cache: ReadCache<u32, u32>,
    pub gaps: GapIndex,
    /// Cells already reported as out of range, to suppress repeats.
    bad: HashSet<u32>,
}

fn decode_cell(par: &FatxPar, buf: &[u8]) -> u32 {
    if par.chain_size == 2 {
        let v = LittleEndian::read_u16(buf) as u32;
        if v == (EOC & 0xFFFF) {
            EOC
        } else {
            v
        }
    } else {
        LittleEndian::read_u32(buf)
    }
}

fn encode_cell(par: &FatxPar, v: u32) -> Vec<u8> {
    if par.chain_size == 2 {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, v as u16);
        buf.to_vec()
    } else {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, v);
        buf.to_vec()
    }
}

impl DiskFat {
    pub fn new(dev: Arc<Device>, opts: Arc<Options>, par: FatxPar) -> DiskFat {
        let capacity = (par.clus_num as u64 * par.chain_size as u64 / MAX_CACHE_DIV)
            .max(par.clus_size) as usize;
        let readahead = (capacity / NB_CACHE_DIV).max(par.clus_size as usize);
        DiskFat {
            dev,
            opts,
            par,
            cache: ReadCache::new(capacity, readahead),
            gaps: GapIndex::default(),
            bad: HashSet::new(),
        }
    }

    /// FAT[p]. Out-of-range pointers and special values report and return
    /// zero.
    pub fn read(&mut self, p: u32) -> u32 {
        if p == FLK || p == EOC {
            warn!("can't read FAT at special cluster value (0x{p:08X})");
            return 0;
        }
        if p < 1 || p > self.par.clus_fat {
            warn!("cluster pointer to FAT out of bounds (0x{p:08X})");
            return 0;
        }
        let Self {
            cache,
            dev,
            opts,
            par,
            bad,
            ..
        } = self;
        cache
            .get(p, |k, ahead| {
                fill_cells(dev.as_ref(), opts.as_ref(), par, bad, k, ahead)
            })
            .unwrap_or(FLK)
    }

    /// Write FAT[p] = v through the cache.
    pub fn write(&mut self, p: u32, v: u32) -> Result<()> {
        if p == FLK || p == EOC || p < 1 || p > self.par.clus_fat {
            warn!("cluster pointer to FAT out of bounds (0x{p:08X})");
            return Err(crate::error::FatxError::OutOfBounds {
                kind: "FAT pointer",
                value: p as u64,
            });
        }
        if v != FLK && v != EOC && (v < 1 || v > self.par.clus_fat) {
            warn!("cluster value to FAT out of bounds (0x{v:08X}) for cluster 0x{p:08X}");
            return Err(crate::error::FatxError::BadChainCell {
                cluster: p,
                value: v,
            });
        }
        let Self { cache, dev, par, .. } = self;
        cache.put(p, v, |k, v| {
            dev.write(par.cls2fat(k), &encode_cell(par, v))
        })
    }

    /// Run a callback over every FAT cell from `root_clus` to `clus_fat`,
    /// reading the FAT region in cluster-size strides.
    pub(crate) fn for_each_cell<F: FnMut(u32, u32)>(&self, mut f: F) {
        let par = &self.par;
        let mut c = par.root_clus;
        let mut p = par.fat_start;
        while p < par.fat_start + par.fat_size && c <= par.clus_fat {
            let buf = self.dev.read(p, par.clus_size as usize);
            if buf.is_empty() {
                return;
            }
            let cells = par.clus_size as usize / par.chain_size as usize;
            let first = if p == par.fat_start {
                par.root_clus as usize
            } else {
                0
            };
            for i in first..cells {
                if c > par.clus_fat {
                    break;
                }
                f(c, decode_cell(par, &buf[i * par.chain_size as usize..]));
                c += 1;
            }
            p += par.clus_size;
        }
    }

    /// Rebuild the free-gap index with one scan over the FAT.
    pub fn gapcheck(&mut self) {
        debug!(
            "calculating free gaps out of {} fat entries",
            self.par.clus_fat
        );
        let mut gaps = GapIndex::default();
        let mut open: Option<(u32, u32)> = None;
        self.for_each_cell(|c, v| {
            if v == FLK {
                open = match open.take() {
                    Some((b, s)) => Some((b, s + 1)),
                    None => Some((c, 1)),
                };
            } else if let Some((b, s)) = open.take() {
                gaps.insert(b, s);
            }
        });
        if let Some((b, s)) = open {
            gaps.insert(b, s);
        }
        self.gaps = gaps;
    }

    /// Sum of free-gap sizes, scanning lazily when the index is cold.
    pub fn clsavail(&mut self) -> u32 {
        if self.gaps.is_empty() {
            self.gapcheck();
        }
        self.gaps.total()
    }

    /// Zero the whole FAT region and rebuild the gap index (mkfs).
    pub fn erase(&mut self) -> Result<()> {
        self.gaps.clear();
        self.cache.clear();
        // One cluster-size stride at a time keeps the write path bounded.
        let mut p = self.par.fat_start;
        let zero = vec![0u8; self.par.clus_size as usize];
        while p < self.par.fat_start + self.par.fat_size {
            let n = (self.par.fat_start + self.par.fat_size - p).min(self.par.clus_size);
            self.dev.write(p, &zero[..n as usize])?;
            p += n;
        }
        self.gapcheck();
        Ok(())
    }

    /// Allocate `n` clusters. Policy: contiguous at `hint`, then the last
    /// gap, then best-fit, then fragmented largest-first; empty result and
    /// a report when the free space cannot cover the request.
    pub fn alloc(&mut self, n: u32, hint: u32) -> AreaList {
        if n == 0 {
            return AreaList::new();
        }
        if self.gaps.is_empty() {
            warn!("no space left on device, disk full");
            return AreaList::new();
        }
        let mut chosen: Option<(u32, u32)> = None;
        if hint != 0 {
            if let Some(size) = self.gaps.at(hint) {
                if size >= n {
                    chosen = Some((hint, size));
                }
            }
        }
        if chosen.is_none() {
            if let Some((start, size)) = self.gaps.last() {
                if size >= n {
                    chosen = Some((start, size));
                }
            }
        }
        if chosen.is_none() {
            chosen = self.gaps.best_fit(n);
        }
        let mut res = AreaList::new();
        if let Some((start, size)) = chosen {
            if self.link_run(start, n).is_err() {
                return AreaList::new();
            }
            self.gaps.remove(start);
            if size != n {
                self.gaps.insert(start + n, size - n);
            }
            res.push(Area {
                offset: 0,
                pointer: self.par.cls2ptr(start),
                size: n as u64 * self.par.clus_size,
                start,
                stop: start + n - 1,
            });
        } else {
            if self.gaps.total() < n {
                warn!("not enough disk space for {n} cluster allocation");
                return AreaList::new();
            }
            // Fragmented: largest gaps first, linking run to run.
            let mut left = n;
            let mut prev_last = FLK;
            while left > 0 {
                let (start, size) = match self.gaps.largest() {
                    Some(g) => g,
                    None => break,
                };
                let take = size.min(left);
                if prev_last != FLK && self.write(prev_last, start).is_err() {
                    return AreaList::new();
                }
                if self.link_run(start, take).is_err() {
                    return AreaList::new();
                }
                let offset = res
                    .last()
                    .map_or(0, |a: &Area| a.offset + a.size);
                res.push(Area {
                    offset,
                    pointer: self.par.cls2ptr(start),
                    size: take as u64 * self.par.clus_size,
                    start,
                    stop: start + take - 1,
                });
                self.gaps.remove(start);
                if size > take {
                    self.gaps.insert(start + take, size - take);
                }
                left -= take;
                prev_last = start + take - 1;
            }
        }
        debug!(
            "FAT alloc: {} cluster(s) starting at 0x{:08X}",
            n,
            res.first_cluster()
        );
        res
    }

    /// Link clusters `[start, start+n)` sequentially, EOC at the tail.
    fn link_run(&mut self, start: u32, n: u32) -> Result<()> {
        for i in start..start + n {
            self.write(i, if i == start + n - 1 { EOC } else { i + 1 })?;
        }
        Ok(())
    }

    /// Human-readable chain dump for scripting and debug.
    pub fn printchain(&mut self, mut orig: u32) -> String {
        let mut res = String::new();
        let mut seen = HashSet::new();
        while orig != FLK && orig != EOC && seen.insert(orig) {
            res += &format!("->0x{orig:08X}");
            orig = self.read(orig);
        }
        res
    }
}

/// Cache fill: decode up to `ahead` consecutive cells starting at `p`,
/// reporting (and optionally repairing) out-of-range values.
fn fill_cells(
    dev: &Device,
    opts: &Options,
    par: &FatxPar,
    bad: &mut HashSet<u32>,
    p: u32,
    ahead: usize,
) -> Vec<(u32, u32)> {
    let count = ahead.min((par.clus_fat - p + 1) as usize);
    let buf = dev.read(par.cls2fat(p), par.chain_size as usize * count);
    let mut res = Vec::with_capacity(count);
    let mut i = 0;
    while i + par.chain_size as usize <= buf.len() {
        let c = p + (i / par.chain_size as usize) as u32;
        let mut v = decode_cell(par, &buf[i..]);
        if v != FLK && v != EOC && (v < 1 || v > par.clus_fat) && bad.insert(c) {
            warn!("cluster value in FAT out of bounds (0x{v:08X}) for cluster 0x{c:08X}");
            if opts.mode == Mode::Fsck
                && opts.ask(
                    &format!("Cluster value in FAT out of bounds for cluster 0x{c:08X}. Free it ?"),
                    true,
                )
            {
                let _ = dev.write(par.cls2fat(c), &encode_cell(par, FLK));
                v = FLK;
            }
        }
        res.push((c, v));
        i += par.chain_size as usize;
    }
    res
}

/// The chain map used by the entry tree: either the plain on-disk FAT or
/// the overlay variant carrying the per-cluster shadow used by fsck and
/// undelete.
pub enum Fat {
    Disk(DiskFat),
    Overlay(OverlayFat),
}

impl Fat {
    pub fn disk(&mut self) -> &mut DiskFat {
        match self {
            Fat::Disk(d) => d,
            Fat::Overlay(o) => &mut o.disk,
        }
    }

    pub fn par(&self) -> &FatxPar {
        match self {
            Fat::Disk(d) => &d.par,
            Fat::Overlay(o) => &o.disk.par,
        }
    }

    pub fn overlay(&mut self) -> Option<&mut OverlayFat> {
        match self {
            Fat::Disk(_) => None,
            Fat::Overlay(o) => Some(o),
        }
    }

    /// Chain cell as seen by the current mode: overlay view when present,
    /// raw disk value otherwise.
    pub fn read(&mut self, p: u32) -> u32 {
        match self {
            Fat::Disk(d) => d.read(p),
            Fat::Overlay(o) => o.read(p),
        }
    }

    /// Raw on-disk cell, bypassing the overlay.
    pub fn disk_read(&mut self, p: u32) -> u32 {
        self.disk().read(p)
    }

    pub fn write(&mut self, p: u32, v: u32) -> Result<()> {
        self.disk().write(p, v)
    }

    pub fn alloc(&mut self, n: u32, hint: u32) -> AreaList {
        self.disk().alloc(n, hint)
    }

    pub fn gapcheck(&mut self) {
        self.disk().gapcheck()
    }

    pub fn clsavail(&mut self) -> u32 {
        self.disk().clsavail()
    }

    pub fn erase(&mut self) -> Result<()> {
        self.disk().erase()
    }

    pub fn printchain(&mut self, orig: u32) -> String {
        self.disk().printchain(orig)
    }

    /// Follow the chain from `orig`, returning each `(cluster, next)`
    /// link in order. Cycles are reported and, in fsck, may be cut by
    /// writing EOC at the previous cluster.
    pub fn walk_chain(&mut self, orig: u32) -> Vec<(u32, u32)> {
        let mut links = Vec::new();
        if orig == FLK || orig == EOC {
            return links;
        }
        let mut seen = HashSet::new();
        let mut cur = orig;
        let mut prev = FLK;
        while cur != FLK && cur != EOC {
            if !seen.insert(cur) {
                warn!("circular reference in FAT chain starting at 0x{orig:08X}");
                let (mode, cut) = {
                    let opts = &self.disk().opts;
                    (
                        opts.mode,
                        opts.mode == Mode::Fsck
                            && opts.ask(
                                &format!(
                                    "Circular reference in FAT chain starting at 0x{orig:08X}. Cut it ?"
                                ),
                                true,
                            ),
                    )
                };
                if cut {
                    let _ = self.write(prev, EOC);
                    if let Some(last) = links.last_mut() {
                        last.1 = EOC;
                    }
                } else if mode != Mode::Fsck {
                    warn!("ignoring circular reference");
                }
                break;
            }
            let next = self.read(cur);
            links.push((cur, next));
            prev = cur;
            cur = next;
        }
        links
    }

    /// Fold a walked chain into contiguous areas with ascending file
    /// offsets.
    pub fn areas_from_walk(&self, links: &[(u32, u32)]) -> AreaList {
        let par = self.par_ref();
        let mut res = AreaList::new();
        let mut offset = 0u64;
        let mut run: Option<(u32, u32)> = None;
        for &(c, _) in links {
            run = match run {
                Some((start, stop)) if c == stop + 1 => Some((start, c)),
                Some((start, stop)) => {
                    let size = (stop - start + 1) as u64 * par.clus_size;
                    res.push(Area {
                        offset,
                        pointer: par.cls2ptr(start),
                        size,
                        start,
                        stop,
                    });
                    offset += size;
                    Some((c, c))
                }
                None => Some((c, c)),
            };
        }
        if let Some((start, stop)) = run {
            let size = (stop - start + 1) as u64 * par.clus_size;
            res.push(Area {
                offset,
                pointer: par.cls2ptr(start),
                size,
                start,
                stop,
            });
        }
        res
    }

    fn par_ref(&self) -> &FatxPar {
        self.par()
    }

    /// The area vector of the chain rooted at `orig`.
    pub fn getareas(&mut self, orig: u32) -> AreaList {
        let links = self.walk_chain(orig);
        self.areas_from_walk(&links)
    }

    /// Free the chain rooted at `orig` and fold the freed runs back into
    /// the gap index (fsck leaves the index alone, it never built one).
    pub fn free(&mut self, orig: u32) {
        if orig == FLK || orig == EOC {
            return;
        }
        let links = self.walk_chain(orig);
        let areas = self.areas_from_walk(&links);
        for &(c, _) in &links {
            let _ = self.write(c, FLK);
        }
        if self.disk().opts.mode == Mode::Fsck {
            return;
        }
        for a in areas.iter() {
            debug!(
                "FAT free: {} cluster(s) starting at 0x{:08X}",
                a.stop - a.start + 1,
                a.start
            );
            self.disk().gaps.fold(a.start, a.stop);
        }
    }

    /// Grow or shrink a chain to `n` clusters, updating `areas` in place.
    /// Fails only when allocation fails.
    pub fn resize(&mut self, areas: &mut AreaList, n: u32) -> bool {
        if areas.is_empty() {
            return n == 0;
        }
        if n == 0 {
            self.free(areas.first_cluster());
            areas.0.clear();
            return true;
        }
        let cur = areas.nbcls();
        if cur < n {
            let last = areas.last_cluster();
            let extend = self.alloc(n - cur, last + 1);
            if extend.is_empty() {
                return false;
            }
            if self.write(last, extend.first_cluster()).is_err() {
                return false;
            }
            areas.add(extend);
        } else if cur > n {
            if self.write(areas.at(n), EOC).is_err() {
                return false;
            }
            self.free(areas.at(n + 1));
            let cs = self.par().clus_size;
            areas.truncate_clusters(n, cs);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Mode;
    use std::path::PathBuf;

    fn volume(mode: Mode) -> Fat {
        let mut opts = Options::new(mode, PathBuf::from("test.img"));
        opts.table = "file".into();
        opts.clus_size = 1;
        opts.force_answers(true, false, false);
        let opts = Arc::new(opts);
        let dev = Arc::new(Device::from_memory(vec![0u8; 4 * 1024 * 1024], true));
        let par = FatxPar::detect(&dev, &opts).unwrap();
        let mut fat = Fat::Disk(DiskFat::new(dev, opts, par));
        fat.gapcheck();
        fat
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut fat = volume(Mode::Mkfs);
        fat.write(5, 6).unwrap();
        fat.write(6, EOC).unwrap();
        assert_eq!(fat.read(5), 6);
        assert_eq!(fat.read(6), EOC);
        assert_eq!(fat.read(7), FLK);
    }

    #[test]
    fn test_sixteen_bit_eoc_sign_extends() {
        let mut fat = volume(Mode::Mkfs);
        assert_eq!(fat.par().chain_size, 2);
        fat.write(3, EOC).unwrap();
        // The raw cell holds 0xFFFF; the read view is the full sentinel.
        let cell = fat.par().cls2fat(3);
        let raw = fat.disk().dev.read(cell, 2);
        assert_eq!(raw, vec![0xFF, 0xFF]);
        assert_eq!(fat.read(3), EOC);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut fat = volume(Mode::Mkfs);
        let top = fat.par().clus_fat;
        assert!(fat.write(top + 1, EOC).is_err());
        assert!(fat.write(3, top + 1).is_err());
        assert_eq!(fat.read(top + 1), 0);
        // The last valid cell is addressable and stays inside the FAT
        // region.
        assert!(fat.par().cls2fat(top) + 2 <= fat.par().fat_start + fat.par().fat_size);
        fat.write(top, EOC).unwrap();
        assert_eq!(fat.read(top), EOC);
    }

    #[test]
    fn test_alloc_contiguous_and_chain() {
        let mut fat = volume(Mode::Mkfs);
        let va = fat.alloc(4, 0);
        assert_eq!(va.nbcls(), 4);
        assert_eq!(va.len(), 1);
        let start = va.first_cluster();
        assert_eq!(fat.read(start), start + 1);
        assert_eq!(fat.read(start + 3), EOC);
    }

    #[test]
    fn test_alloc_hint_extends_contiguously() {
        let mut fat = volume(Mode::Mkfs);
        let a = fat.alloc(3, 0);
        let next = a.last_cluster() + 1;
        let b = fat.alloc(2, next);
        assert_eq!(b.first_cluster(), next);
    }

    #[test]
    fn test_alloc_grow_at_end_then_best_fit() {
        let mut fat = volume(Mode::Mkfs);
        let top = fat.par().clus_fat;
        // Gaps: [1..10] (10), [13..15] (3), [18..top] used.
        for c in 11..=12 {
            fat.write(c, EOC).unwrap();
        }
        for c in 16..=17 {
            fat.write(c, EOC).unwrap();
        }
        for c in 18..=top {
            fat.write(c, EOC).unwrap();
        }
        fat.gapcheck();
        // Fits in the last gap: grow-at-end wins over the bigger gap.
        let va = fat.alloc(3, 0);
        assert_eq!(va.first_cluster(), 13);
        assert_eq!(va.nbcls(), 3);
        // Too big for the last gap now: best-fit picks the smallest
        // sufficient one.
        fat.free(13);
        let va = fat.alloc(4, 0);
        assert_eq!(va.first_cluster(), 1);
        assert_eq!(va.len(), 1);
    }

    #[test]
    fn test_alloc_fragmented_takes_largest_first() {
        let mut fat = volume(Mode::Mkfs);
        let top = fat.par().clus_fat;
        // Free gaps: [1..6] (6), [9..11] (3), [14..15] (2); everything
        // else used.
        for c in 7..=8 {
            fat.write(c, EOC).unwrap();
        }
        for c in 12..=13 {
            fat.write(c, EOC).unwrap();
        }
        for c in 16..=top {
            fat.write(c, EOC).unwrap();
        }
        fat.gapcheck();
        let va = fat.alloc(8, 0);
        assert_eq!(va.nbcls(), 8);
        assert!(va.len() >= 2);
        assert_eq!(va[0].start, 1);
        assert_eq!(va[0].stop, 6);
        assert_eq!(va[1].start, 9);
        // Runs are linked across the gap boundary.
        assert_eq!(fat.read(6), 9);
        assert_eq!(fat.read(10), EOC);
        // The second gap keeps its unused tail.
        assert_eq!(fat.read(11), FLK);
    }

    #[test]
    fn test_alloc_whole_disk_empties_gap_index() {
        let mut fat = volume(Mode::Mkfs);
        let all = fat.par().clus_fat - fat.par().root_clus + 1;
        let va = fat.alloc(all, 0);
        assert_eq!(va.nbcls(), all);
        assert!(fat.disk().gaps.is_empty());
        assert_eq!(fat.clsavail(), 0);
        // One more cluster is a clean failure.
        assert!(fat.alloc(1, 0).is_empty());
    }

    #[test]
    fn test_free_restores_gap_index() {
        let mut fat = volume(Mode::Mkfs);
        let before: Vec<(u32, u32)> = fat.disk().gaps.iter().collect();
        let va = fat.alloc(5, 0);
        fat.free(va.first_cluster());
        let after: Vec<(u32, u32)> = fat.disk().gaps.iter().collect();
        assert_eq!(before, after);
        assert_eq!(fat.read(va.first_cluster()), FLK);
    }

    #[test]
    fn test_free_merges_both_neighbours() {
        let mut fat = volume(Mode::Mkfs);
        let a = fat.alloc(2, 0);
        let b = fat.alloc(2, a.last_cluster() + 1);
        let c = fat.alloc(2, b.last_cluster() + 1);
        fat.free(a.first_cluster());
        fat.free(c.first_cluster());
        fat.free(b.first_cluster());
        // All three runs collapse back into one gap.
        let gaps: Vec<(u32, u32)> = fat.disk().gaps.iter().collect();
        assert_eq!(gaps.len(), 1);
    }

    #[test]
    fn test_resize_grow_and_shrink() {
        let mut fat = volume(Mode::Mkfs);
        let mut va = fat.alloc(2, 0);
        assert!(fat.resize(&mut va, 5));
        assert_eq!(va.nbcls(), 5);
        assert_eq!(fat.getareas(va.first_cluster()).nbcls(), 5);
        assert!(fat.resize(&mut va, 2));
        assert_eq!(va.nbcls(), 2);
        assert_eq!(fat.read(va.at(2)), EOC);
        assert_eq!(fat.getareas(va.first_cluster()).nbcls(), 2);
    }

    #[test]
    fn test_cycle_detection_cuts_in_fsck() {
        let mut fat = volume(Mode::Fsck);
        // Hand-craft c -> c+1 -> c.
        fat.write(20, 21).unwrap();
        fat.write(21, 20).unwrap();
        let links = fat.walk_chain(20);
        // The walk stops at the revisit and the cut lands at cluster 21.
        assert_eq!(links.len(), 2);
        assert_eq!(fat.read(21), EOC);
        assert_eq!(fat.read(20), 21);
    }

    #[test]
    fn test_getareas_folds_runs() {
        let mut fat = volume(Mode::Mkfs);
        fat.write(5, 6).unwrap();
        fat.write(6, 10).unwrap();
        fat.write(10, 11).unwrap();
        fat.write(11, EOC).unwrap();
        let va = fat.getareas(5);
        assert_eq!(va.len(), 2);
        assert_eq!((va[0].start, va[0].stop), (5, 6));
        assert_eq!((va[1].start, va[1].stop), (10, 11));
        assert_eq!(va[1].offset, 2 * fat.par().clus_size);
    }

    #[test]
    fn test_printchain() {
        let mut fat = volume(Mode::Mkfs);
        fat.write(3, 4).unwrap();
        fat.write(4, EOC).unwrap();
        assert_eq!(fat.printchain(3), "->0x00000003->0x00000004");
    }
}
