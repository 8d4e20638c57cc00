use std::sync::{Arc, Mutex, RwLock, Weak};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::areas::AreaList;
use crate::buffer::EntryBuffer;
use crate::date::FatxDate;
use crate::fat::{EOC, FLK};
use crate::options::Mode;
use crate::overlay::CellStatus;
use crate::partition::NAME_SIZE;
use crate::volume::Volume;

/// On-disk size of a directory record.
pub const ENT_SIZE: usize = 64;
/// First byte of a deleted record.
pub const DELETED_MARK: u8 = 0xE5;
/// End-of-directory filler byte.
pub const EOD: u8 = 0xFF;

/// Entry status, derived at directory parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Valid,
    /// Deleted, data still potentially recoverable.
    DelWData,
    /// Deleted, data gone or claimed by something newer.
    DelNoData,
    /// Belongs to a chain with no reachable owner.
    Lost,
    /// End-of-directory marker.
    End,
    Invalid,
}

/// Pass selector for the recursive `analyse` walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    FindFile,
    FindDel,
    TryRecov,
}

/// Record attribute bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attributes {
    pub ro: bool,
    pub hid: bool,
    pub sys: bool,
    pub lab: bool,
    pub dir: bool,
    pub arc: bool,
    pub dev: bool,
    pub na: bool,
}

impl Attributes {
    pub fn decode(c: u8) -> Attributes {
        Attributes {
            ro: c & (1 << 0) != 0,
            hid: c & (1 << 1) != 0,
            sys: c & (1 << 2) != 0,
            lab: c & (1 << 3) != 0,
            dir: c & (1 << 4) != 0,
            arc: c & (1 << 5) != 0,
            dev: c & (1 << 6) != 0,
            na: c & (1 << 7) != 0,
        }
    }

    pub fn encode(&self) -> u8 {
        (self.ro as u8)
            | (self.hid as u8) << 1
            | (self.sys as u8) << 2
            | (self.lab as u8) << 3
            | (self.dir as u8) << 4
            | (self.arc as u8) << 5
            | (self.dev as u8) << 6
            | (self.na as u8) << 7
    }

    /// Unix mode projection for the mount contract.
    pub fn mode(&self) -> u32 {
        let base = 0o555;
        let write = if self.ro { 0 } else { 0o222 };
        let kind = if self.dir { 0o040000 } else { 0o100000 };
        kind | base | write
    }

    /// Only the read-only bit survives a chmod; the format stores nothing
    /// else.
    pub fn set_mode(&mut self, mode: u32) {
        self.ro = mode & 0o222 == 0;
    }
}

/// The mutable record of an entry, guarded by the entry's state lock.
pub struct EntryState {
    pub status: Status,
    pub flags: Attributes,
    pub name: String,
    /// Raw first byte of the record as parsed (0xE5 for deleted slots).
    pub namesize: u8,
    pub cluster: u32,
    pub size: u64,
    pub creation: FatxDate,
    pub access: FatxDate,
    pub update: FatxDate,
    /// Byte location of the 64-byte record on disk; 0 for the root.
    pub loc: u64,
    pub parent: Weak<Entry>,
    pub children: Vec<Arc<Entry>>,
    pub areas: Option<AreaList>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOpened {
    None,
    Yes,
    No,
}

/// Buffer and open-bracket bookkeeping, guarded separately from the
/// record so flushes never contend with metadata readers.
struct BufState {
    buf: Option<EntryBuffer>,
    cptacc: u32,
    writeopened: WriteOpened,
}

/// A file or directory node. Parents own children; the back-reference is
/// weak. The root's parent is itself.
pub struct Entry {
    state: RwLock<EntryState>,
    bufstate: Mutex<BufState>,
}

fn sanitize_name(raw: &[u8]) -> String {
    let mut out = String::new();
    for &b in raw {
        if b == 0 || b == EOD {
            break;
        }
        out.push(if (0x20..=0x7E).contains(&b) {
            b as char
        } else {
            '~'
        });
    }
    out
}

fn printable(b: u8) -> bool {
    (0x20..=0x7E).contains(&b)
}

impl Entry {
    fn new(state: EntryState) -> Arc<Entry> {
        Arc::new(Entry {
            state: RwLock::new(state),
            bufstate: Mutex::new(BufState {
                buf: None,
                cptacc: 0,
                writeopened: WriteOpened::None,
            }),
        })
    }

    pub fn state(&self) -> std::sync::RwLockReadGuard<'_, EntryState> {
        self.state.read().unwrap()
    }

    pub fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, EntryState> {
        self.state.write().unwrap()
    }

    /// Fabricate the in-memory root directory at the root cluster and
    /// walk its contents. The volume label is read from the hidden
    /// `name.txt` child when present.
    pub fn root(fs: &Volume) -> Arc<Entry> {
        let root = Arc::new_cyclic(|weak: &Weak<Entry>| Entry {
            state: RwLock::new(EntryState {
                status: Status::Valid,
                flags: Attributes {
                    dir: true,
                    ..Attributes::default()
                },
                name: String::new(),
                namesize: 0,
                cluster: fs.par.root_clus,
                size: 0,
                creation: FatxDate::now(),
                access: FatxDate::now(),
                update: FatxDate::now(),
                loc: 0,
                parent: weak.clone(),
                children: Vec::new(),
                areas: None,
            }),
            bufstate: Mutex::new(BufState {
                buf: None,
                cptacc: 0,
                writeopened: WriteOpened::None,
            }),
        });
        root.opendir(fs);
        if let Some(idx) = root.find(fs, crate::volume::LABEL_FILE) {
            let (size, creation, access, update) = {
                let st = idx.state();
                (st.size, st.creation, st.access, st.update)
            };
            {
                let mut st = root.state_mut();
                st.creation = creation;
                st.access = access;
                st.update = update;
            }
            let mut lab = vec![0u8; size.min(crate::partition::SLAB as u64) as usize];
            if idx.read_data(fs, 0, &mut lab) {
                fs.set_label(&crate::partition::decode_label(&lab));
            }
        }
        root
    }

    /// Decode a 64-byte record into a node, classifying its status by
    /// the FAT view.
    pub fn from_record(fs: &Volume, loc: u64, buf: &[u8], parent: &Arc<Entry>) -> Arc<Entry> {
        let namesize = buf[0];
        let flags = Attributes::decode(buf[1]);
        let cluster = LittleEndian::read_u32(&buf[0x2C..0x30]);
        let size = LittleEndian::read_u32(&buf[0x30..0x34]) as u64;
        let creation = FatxDate::decode([buf[0x34], buf[0x35], buf[0x36], buf[0x37]]);
        let access = FatxDate::decode([buf[0x38], buf[0x39], buf[0x3A], buf[0x3B]]);
        let update = FatxDate::decode([buf[0x3C], buf[0x3D], buf[0x3E], buf[0x3F]]);

        let mut status = if (buf[0] == EOD && buf[1] == EOD) || (buf[0] == 0 && buf[1] == 0) {
            Status::End
        } else if cluster > fs.par.clus_fat
            || !printable(buf[2])
            || (buf[3] != 0 && (!printable(buf[3]) || (buf[4] != 0 && !printable(buf[4]))))
        {
            Status::Invalid
        } else {
            let disk_next = if cluster != 0 {
                fs.fat.write().unwrap().disk_read(cluster)
            } else {
                FLK
            };
            if namesize as usize <= NAME_SIZE
                && ((size == 0 && cluster == 0) || (cluster != 0 && disk_next != FLK))
            {
                Status::Valid
            } else if (cluster == 0 && !flags.dir)
                || (cluster != 0 && disk_next == FLK && {
                    // Recoverable unless a newer non-directory deleted
                    // entry already claims the first cluster.
                    let mut fat = fs.fat.write().unwrap();
                    match fat.overlay() {
                        None => true,
                        Some(o) => match o.status(cluster) {
                            CellStatus::Disk => true,
                            CellStatus::Deleted => o.getentry(cluster).is_some_and(|e| {
                                let st = e.state();
                                !st.flags.dir && st.update.seq() < update.seq()
                            }),
                            _ => false,
                        },
                    }
                })
            {
                Status::DelWData
            } else {
                Status::DelNoData
            }
        };

        let copy_len = (namesize as usize).min(NAME_SIZE);
        let copied = &buf[2..2 + copy_len];
        let eff = copied.iter().position(|&b| b == 0).unwrap_or(copy_len);
        if status != Status::End
            && ((namesize != DELETED_MARK && namesize as usize != eff)
                || eff == 0
                || copied.first() == Some(&b'/'))
        {
            status = Status::Invalid;
        }
        let name = if status == Status::End || status == Status::Invalid {
            String::new()
        } else {
            sanitize_name(&copied[..eff])
        };

        Entry::new(EntryState {
            status,
            flags,
            name,
            namesize,
            cluster,
            size,
            creation,
            access,
            update,
            loc,
            parent: Arc::downgrade(parent),
            children: Vec::new(),
            areas: None,
        })
    }

    /// Construct a fresh in-memory record for creation, allocating one
    /// cluster for a directory or enough clusters for `size` bytes. The
    /// cluster stays FREE when allocation fails.
    pub fn create(fs: &Volume, name: &str, size: u64, dir: bool) -> Arc<Entry> {
        let want = if dir { 1 } else { fs.par.siz2cls(size) };
        let areas = if want != 0 {
            fs.fat.write().unwrap().alloc(want, 0)
        } else {
            AreaList::new()
        };
        let cluster = areas.first_cluster();
        let size = if cluster == FLK && want != 0 { 0 } else if dir { 0 } else { size };
        let name: String = name.chars().take(NAME_SIZE).collect();
        let now = FatxDate::now();
        let ent = Entry::new(EntryState {
            status: Status::Invalid,
            flags: Attributes {
                dir,
                ..Attributes::default()
            },
            namesize: name.len() as u8,
            name,
            cluster,
            size,
            creation: now,
            access: now,
            update: now,
            loc: 0,
            parent: Weak::new(),
            children: Vec::new(),
            areas: if areas.is_empty() { None } else { Some(areas) },
        });
        if dir && cluster != FLK {
            // New directories start with an end marker in their first
            // slot.
            let _ = write_end_marker(fs, fs.par.cls2ptr(cluster));
        }
        ent
    }

    /// Absolute path of this entry; directories carry a trailing
    /// separator like the rest of the toolkit expects.
    pub fn path(&self, fs: &Volume) -> String {
        let (cluster, name, dir, parent) = {
            let st = self.state();
            (st.cluster, st.name.clone(), st.flags.dir, st.parent.clone())
        };
        if cluster == fs.par.root_clus {
            return "/".to_string();
        }
        let base = match parent.upgrade() {
            Some(p) => p.path(fs),
            None => "?/".to_string(),
        };
        format!("{base}{name}{}", if dir { "/" } else { "" })
    }

    /// Resolve a `/`-separated path against this node's children. In
    /// recovery mode non-valid children match on fallthrough.
    pub fn find(self: &Arc<Entry>, fs: &Volume, path: &str) -> Option<Arc<Entry>> {
        let mut cur = self.clone();
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            let comp: String = comp.chars().take(NAME_SIZE).collect();
            let children = cur.state().children.clone();
            let mut found = children.iter().find(|e| {
                let st = e.state();
                st.status == Status::Valid && st.name == comp
            });
            if found.is_none() && fs.opts.recover {
                found = children.iter().find(|e| e.state().name == comp);
            }
            cur = found?.clone();
        }
        Some(cur)
    }

    pub fn touch(&self, cre: bool, acc: bool, upd: bool) {
        let now = FatxDate::now();
        let mut st = self.state_mut();
        if cre {
            st.creation = now;
        }
        if acc {
            st.access = now;
        }
        if upd {
            st.update = now;
        }
    }

    /// Persist the 64-byte record at its on-disk slot.
    pub fn write(&self, fs: &Volume) -> bool {
        let mut st = self.state_mut();
        write_record(fs, &mut st)
    }

    /// Persist under the parent bracket; the root needs no record.
    pub fn save(&self, fs: &Volume) -> bool {
        if self.state().loc == 0 {
            return true;
        }
        self.write(fs)
    }

    /// Parse the directory's chain one cluster at a time, decoding each
    /// 64-byte record in order. The first end record terminates the
    /// directory; in recovery mode parsing continues and later valid
    /// records demote to recoverable.
    pub fn opendir(self: &Arc<Entry>, fs: &Volume) {
        let (status, dir, cluster) = {
            let st = self.state();
            (st.status, st.flags.dir, st.cluster)
        };
        if status == Status::End
            || status == Status::Invalid
            || !dir
            || cluster == FLK
            || cluster == EOC
        {
            return;
        }
        let mut children: Vec<Arc<Entry>> = Vec::new();
        let mut marked = false;
        let mut bad = false;
        let mut clus = cluster;
        'chain: while clus != EOC && clus != FLK && !(marked && !fs.opts.recover) {
            let base = fs.par.cls2ptr(clus);
            let buf = fs.dev.read(base, fs.par.clus_size as usize);
            if buf.is_empty() {
                break;
            }
            let mut off = 0usize;
            while off + ENT_SIZE <= buf.len() && !(marked && !fs.opts.recover) {
                let rec = &buf[off..off + ENT_SIZE];
                let ent = Entry::from_record(fs, base + off as u64, rec, self);
                off += ENT_SIZE;
                let est = {
                    let st = ent.state();
                    (st.status, st.flags.dir, st.cluster, st.name.clone())
                };
                let (mut est_status, est_dir, est_cluster, est_name) = est;
                if est_status == Status::End {
                    marked = true;
                    continue;
                }
                if est_status == Status::Invalid {
                    if !marked {
                        bad = true;
                    }
                    continue;
                }
                if marked && est_status == Status::Valid {
                    est_status = Status::DelWData;
                    ent.state_mut().status = Status::DelWData;
                }
                if !fs.opts.recover && est_status != Status::Valid {
                    continue;
                }
                if est_status == Status::Valid
                    && !self.resolve_duplicate(fs, &children, &ent, &est_name, est_cluster)
                {
                    continue;
                }
                if est_dir && !self.check_circular(fs, &ent, est_cluster, &mut bad) {
                    continue;
                }
                children.push(ent.clone());
                let recurse = {
                    let st = ent.state();
                    st.flags.dir && st.status != Status::DelNoData
                };
                if recurse {
                    ent.opendir(fs);
                }
                if marked && !fs.opts.recover {
                    break 'chain;
                }
            }
            let next = fs.fat.write().unwrap().read(clus);
            if !marked && next == EOC {
                marked = true;
            }
            clus = next;
        }
        {
            let mut st = self.state_mut();
            st.children = children;
            if st.children.is_empty() && bad && st.loc != 0 {
                st.status = Status::DelNoData;
            }
        }
        if status == Status::Valid && !marked {
            warn!("no end mark for directory \"{}\"", self.state().name);
            if fs.opts.mode == Mode::Fsck
                && fs
                    .opts
                    .ask(&format!("No end mark for directory \"{}\". Mark it ?", self.state().name), true)
            {
                self.closedir(fs);
            }
        }
    }

    /// Duplicate-name policy during parse. Returns false when the new
    /// entry must be dropped.
    fn resolve_duplicate(
        self: &Arc<Entry>,
        fs: &Volume,
        children: &[Arc<Entry>],
        ent: &Arc<Entry>,
        name: &str,
        cluster: u32,
    ) -> bool {
        let twin = children.iter().find(|e| {
            let st = e.state();
            st.status == Status::Valid && st.name == name
        });
        let Some(twin) = twin else { return true };
        let twin_cluster = twin.state().cluster;
        warn!(
            "duplicate reference in same directory {} for entry {name}",
            self.path(fs)
        );
        match fs.opts.mode {
            Mode::Fsck => {
                if cluster != twin_cluster {
                    let renamed = {
                        let mut st = ent.state_mut();
                        st.name.push('~');
                        st.name.clone()
                    };
                    if fs
                        .opts
                        .ask(&format!("Duplicate entry {name}. Create it (as {renamed}) ?"), true)
                    {
                        ent.write(fs);
                        return true;
                    }
                }
                if fs.opts.ask(&format!("Duplicate entry {name}. Remove it ?"), true) {
                    if cluster != twin_cluster {
                        self.remfrdir(fs, ent, false);
                    } else {
                        let mut st = ent.state_mut();
                        st.status = Status::DelNoData;
                        st.cluster = FLK;
                        write_record(fs, &mut st);
                    }
                }
                false
            }
            Mode::Unrm if cluster != twin_cluster => {
                // Keep it under a tweaked name if it points elsewhere.
                let mut st = ent.state_mut();
                st.name.push('~');
                debug!("duplicate entry read as {}", st.name);
                true
            }
            _ => {
                debug!("duplicate entry {name} skipped");
                false
            }
        }
    }

    /// Walk the parent chain looking for the same cluster again before
    /// recursing into a subdirectory. Returns false when the entry must
    /// be dropped.
    fn check_circular(
        self: &Arc<Entry>,
        fs: &Volume,
        ent: &Arc<Entry>,
        cluster: u32,
        bad: &mut bool,
    ) -> bool {
        let mut deleted = false;
        let mut node = self.clone();
        loop {
            let (loc, status, node_cluster, parent) = {
                let st = node.state();
                (st.loc, st.status, st.cluster, st.parent.clone())
            };
            if status != Status::Valid {
                deleted = true;
            }
            if cluster == node_cluster {
                if !deleted {
                    warn!(
                        "circular reference for entry {} found in {}",
                        ent.path(fs),
                        self.path(fs)
                    );
                    if fs.opts.mode == Mode::Fsck
                        && fs.opts.ask("Circular reference. Remove it ?", true)
                    {
                        self.remfrdir(fs, ent, false);
                    }
                }
                *bad = true;
                return false;
            }
            if loc == 0 {
                return true;
            }
            node = match parent.upgrade() {
                Some(p) => p,
                None => return true,
            };
        }
    }

    /// Append an end marker to a directory whose chain terminated with
    /// no end record: extend the chain by one cluster and mark its first
    /// slot.
    fn closedir(self: &Arc<Entry>, fs: &Volume) {
        let cluster = self.state().cluster;
        if cluster == FLK || cluster == EOC {
            return;
        }
        // A marker may already exist (repair re-entered).
        let mut clus = cluster;
        while clus != EOC && clus != FLK {
            let buf = fs.dev.read(fs.par.cls2ptr(clus), fs.par.clus_size as usize);
            for rec in buf.chunks_exact(ENT_SIZE) {
                if (rec[0] == EOD && rec[1] == EOD) || (rec[0] == 0 && rec[1] == 0) {
                    return;
                }
            }
            clus = fs.fat.write().unwrap().read(clus);
        }
        let mut fat = fs.fat.write().unwrap();
        let mut areas = fat.getareas(cluster);
        let want = areas.nbcls() + 1;
        if !fat.resize(&mut areas, want) {
            warn!("cannot extend directory to place an end mark");
            return;
        }
        let loc = fs.par.cls2ptr(areas.last_cluster());
        drop(fat);
        let _ = write_end_marker(fs, loc);
    }

    /// Place `e` into this directory: the first end slot, else the first
    /// deleted slot, else a freshly allocated cluster.
    pub fn addtodir(self: &Arc<Entry>, fs: &Volume, e: &Arc<Entry>) -> bool {
        let (dir, cluster) = {
            let st = self.state();
            (st.flags.dir, st.cluster)
        };
        {
            let est = e.state();
            if !dir || cluster == 0 || (est.flags.dir && est.cluster == 0) {
                return false;
            }
        }
        let e_name = e.state().name.clone();
        {
            let st = self.state();
            if st.children.iter().any(|i| {
                let ist = i.state();
                ist.status == Status::Valid && ist.name == e_name
            }) {
                return false;
            }
        }
        let mut end_slot = 0u64;
        let mut del_slot = 0u64;
        let mut clus = cluster;
        'scan: while clus != EOC && clus != FLK {
            let base = fs.par.cls2ptr(clus);
            let buf = fs.dev.read(base, fs.par.clus_size as usize);
            let mut off = 0u64;
            for rec in buf.chunks_exact(ENT_SIZE) {
                if (rec[0] == EOD && rec[1] == EOD) || (rec[0] == 0 && rec[1] == 0) {
                    end_slot = base + off;
                    break 'scan;
                }
                if rec[0] == DELETED_MARK {
                    del_slot = base + off;
                }
                off += ENT_SIZE as u64;
            }
            clus = fs.fat.write().unwrap().read(clus);
        }
        let loc = if end_slot != 0 {
            // The next slot gets a fresh end marker unless it sits
            // exactly on a cluster boundary.
            if (end_slot + ENT_SIZE as u64) % fs.par.clus_size != 0
                && write_end_marker(fs, end_slot + ENT_SIZE as u64).is_err()
            {
                return false;
            }
            end_slot
        } else if del_slot != 0 {
            del_slot
        } else {
            let mut st = self.state_mut();
            let mut fat = fs.fat.write().unwrap();
            let mut areas = match st.areas.take() {
                Some(a) if !a.is_empty() => a,
                _ => fat.getareas(cluster),
            };
            if areas.is_empty() {
                return false;
            }
            let want = areas.nbcls() + 1;
            if !fat.resize(&mut areas, want) {
                st.areas = Some(areas);
                return false;
            }
            let loc = fs.par.cls2ptr(areas.last_cluster());
            st.areas = Some(areas);
            drop(fat);
            if write_end_marker(fs, loc + ENT_SIZE as u64).is_err() {
                return false;
            }
            loc
        };
        {
            let mut est = e.state_mut();
            est.loc = loc;
            est.status = Status::Valid;
            est.parent = Arc::downgrade(self);
        }
        self.state_mut().children.push(e.clone());
        e.write(fs);
        self.touch(false, false, true);
        self.save(fs)
    }

    /// Remove `e` from this directory: free its chain, flip it to
    /// deleted and rewrite its slot. Cascade removes children first and
    /// releases the ownership slot.
    pub fn remfrdir(self: &Arc<Entry>, fs: &Volume, e: &Arc<Entry>, cascade: bool) {
        {
            let est = e.state();
            if est.status != Status::Valid || est.flags.lab {
                return;
            }
        }
        if cascade {
            let grandchildren = e.state().children.clone();
            for f in grandchildren {
                e.remfrdir(fs, &f, true);
            }
        }
        let cluster = e.state().cluster;
        if cluster != 0 {
            fs.fat.write().unwrap().free(cluster);
        }
        {
            let mut est = e.state_mut();
            est.status = Status::DelNoData;
            write_record(fs, &mut est);
        }
        if cascade {
            let mut st = self.state_mut();
            st.children.retain(|c| !Arc::ptr_eq(c, e));
        }
        self.touch(false, false, true);
        self.save(fs);
    }

    /// Rename, possibly across directories: detach from the old parent
    /// (rewriting its old slot as deleted), re-attach via `addtodir`,
    /// then update the name bytes.
    pub fn rename(self: &Arc<Entry>, fs: &Volume, newpath: &str) -> bool {
        if self.state().status != Status::Valid {
            return false;
        }
        if newpath.is_empty() || self.state().flags.lab {
            return true;
        }
        let mut name = newpath.to_string();
        if let Some(cut) = newpath.rfind('/') {
            let (dirpart, base) = newpath.split_at(cut);
            name = base[1..].to_string();
            let root = fs.root();
            let newpar = match root.find(fs, dirpart) {
                Some(p) => p,
                None => return false,
            };
            let oldpar = match self.state().parent.upgrade() {
                Some(p) => p,
                None => return false,
            };
            if !Arc::ptr_eq(&oldpar, &newpar) {
                {
                    let mut st = self.state_mut();
                    st.status = Status::DelWData;
                    write_record(fs, &mut st);
                    st.status = Status::Valid;
                }
                oldpar.state_mut().children.retain(|c| !Arc::ptr_eq(c, self));
                oldpar.touch(false, false, true);
                if !oldpar.save(fs) {
                    return false;
                }
                if !newpar.addtodir(fs, self) {
                    return false;
                }
            }
        }
        {
            let mut st = self.state_mut();
            let trimmed: String = name.chars().take(NAME_SIZE).collect();
            st.namesize = trimmed.len() as u8;
            st.name = trimmed;
        }
        self.save(fs)
    }

    /// Grow or shrink the file to `n` bytes. Directories refuse.
    pub fn resize(self: &Arc<Entry>, fs: &Volume, n: u64) -> bool {
        let (dir, size, cluster) = {
            let st = self.state();
            (st.flags.dir, st.size, st.cluster)
        };
        if dir {
            return false;
        }
        if !self.writeable() {
            debug!("resizing a file not opened for write");
            return false;
        }
        if n == size {
            return true;
        }
        if n == 0 {
            {
                let mut st = self.state_mut();
                st.areas = None;
            }
            fs.fat.write().unwrap().free(cluster);
            let mut st = self.state_mut();
            st.cluster = 0;
            st.size = 0;
            return write_record(fs, &mut st) || st.loc == 0;
        }
        if size == 0 {
            let want = fs.par.siz2cls(n);
            let va = fs.fat.write().unwrap().alloc(want, 0);
            if va.is_empty() {
                return false;
            }
            let mut st = self.state_mut();
            st.cluster = va.first_cluster();
            st.size = n;
            st.areas = Some(va.sub(n, 0, fs.par.clus_size));
            return write_record(fs, &mut st) || st.loc == 0;
        }
        // Delegate to the FAT at cluster granularity, then re-establish
        // the cached area vector subranged to the new byte length.
        let mut fat = fs.fat.write().unwrap();
        let mut areas = fat.getareas(cluster);
        if !fat.resize(&mut areas, fs.par.siz2cls(n)) {
            return false;
        }
        drop(fat);
        let mut st = self.state_mut();
        st.size = n;
        st.areas = Some(areas.sub(n, 0, fs.par.clus_size));
        write_record(fs, &mut st) || st.loc == 0
    }

    fn writeable(&self) -> bool {
        self.bufstate.lock().unwrap().writeopened != WriteOpened::No
    }

    /// Area list trimmed to the file size, building it from the FAT when
    /// not cached.
    fn areas_for_io(&self, fs: &Volume) -> Option<AreaList> {
        let (cluster, size) = {
            let st = self.state();
            if let Some(a) = &st.areas {
                if !a.is_empty() {
                    return Some(a.clone());
                }
            }
            (st.cluster, st.size)
        };
        let va = fs
            .fat
            .write()
            .unwrap()
            .getareas(cluster)
            .sub(size, 0, fs.par.clus_size);
        if va.is_empty() {
            return None;
        }
        self.state_mut().areas = Some(va.clone());
        Some(va)
    }

    /// Read file bytes at `offset`, one device read per sub-area.
    pub fn read_data(self: &Arc<Entry>, fs: &Volume, offset: u64, buf: &mut [u8]) -> bool {
        let (dir, size) = {
            let st = self.state();
            (st.flags.dir, st.size)
        };
        if dir || offset > size {
            return false;
        }
        let len = (buf.len() as u64).min(size - offset);
        if len == 0 {
            return true;
        }
        let Some(areas) = self.areas_for_io(fs) else {
            return false;
        };
        for a in areas.sub(len, offset, fs.par.clus_size).iter() {
            let data = fs.dev.read(a.pointer, a.size as usize);
            if data.len() != a.size as usize {
                return false;
            }
            let at = (a.offset - offset) as usize;
            buf[at..at + data.len()].copy_from_slice(&data);
        }
        true
    }

    /// Write file bytes at `offset`, growing the file as needed. Refreshes
    /// the update stamp and persists the record.
    pub fn write_data(self: &Arc<Entry>, fs: &Volume, offset: u64, buf: &[u8]) -> bool {
        if !self.writeable() {
            return false;
        }
        self.write_data_unchecked(fs, offset, buf)
    }

    /// Write path shared with the buffer flush, which already holds the
    /// buffer lock and has checked write intent itself.
    fn write_data_unchecked(self: &Arc<Entry>, fs: &Volume, offset: u64, buf: &[u8]) -> bool {
        let (dir, size) = {
            let st = self.state();
            (st.flags.dir, st.size)
        };
        if dir {
            return false;
        }
        let len = buf.len() as u64;
        if (size == 0 || offset + len > size) && !self.resize(fs, offset + len) {
            debug!("data write: resize failed");
            return false;
        }
        if self.state().size != 0 {
            let Some(areas) = self.areas_for_io(fs) else {
                return false;
            };
            for a in areas.sub(len, offset, fs.par.clus_size).iter() {
                let at = (a.offset - offset) as usize;
                if fs
                    .dev
                    .write(a.pointer, &buf[at..at + a.size as usize])
                    .is_err()
                {
                    return false;
                }
            }
        }
        self.touch(false, false, true);
        self.save(fs)
    }

    /// Buffered read: refill the scoped buffer when the requested range
    /// falls outside it, then copy out.
    pub fn bufread(self: &Arc<Entry>, fs: &Volume, offset: u64, out: &mut [u8]) -> usize {
        let size = self.state().size;
        if offset >= size {
            return 0;
        }
        let len = (out.len() as u64).min(size - offset);
        let mut bs = self.bufstate.lock().unwrap();
        if let Some(buf) = &bs.buf {
            if !buf.covers(offset, len) && !self.flush_locked(fs, &mut bs) {
                debug!("buffer flush failed before refill");
                return 0;
            }
            if bs.buf.as_ref().is_none_or(|b| !b.covers(offset, len)) {
                bs.buf = None;
            }
        }
        if bs.buf.is_none() {
            let Some(mut buf) = EntryBuffer::new(offset, size - offset) else {
                return 0;
            };
            if (buf.data.len() as u64) < len
                || !self.read_data(fs, buf.offset, &mut buf.data)
            {
                debug!("buffer alloc or read failed");
                return 0;
            }
            bs.buf = Some(buf);
        }
        let buf = bs.buf.as_ref().unwrap();
        let at = (offset - buf.offset) as usize;
        out[..len as usize].copy_from_slice(&buf.data[at..at + len as usize]);
        len as usize
    }

    /// Buffered write: absorb contiguous appends up to the buffer cap,
    /// flush and restart elsewhere otherwise.
    pub fn bufwrite(self: &Arc<Entry>, fs: &Volume, offset: u64, data: &[u8]) -> usize {
        if !self.writeable() {
            debug!("writing a file not opened for write");
            return 0;
        }
        let len = data.len() as u64;
        if self.state().size < offset + len && !self.resize(fs, offset + len) {
            debug!("file resize failed for buffered write");
            return 0;
        }
        let mut bs = self.bufstate.lock().unwrap();
        if let Some(buf) = &mut bs.buf {
            if buf.end() == offset {
                let want = (offset + len - buf.offset) as usize;
                if buf.enlarge(want) < want && !self.flush_locked(fs, &mut bs) {
                    return 0;
                }
            } else if !self.flush_locked(fs, &mut bs) {
                return 0;
            }
        }
        match &mut bs.buf {
            Some(buf) if buf.covers(offset, len) => {
                let at = (offset - buf.offset) as usize;
                buf.data[at..at + len as usize].copy_from_slice(data);
                buf.touched = true;
            }
            _ => {
                bs.buf = None;
                let Some(mut buf) = EntryBuffer::new(offset, len) else {
                    return 0;
                };
                if (buf.data.len() as u64) < len {
                    return 0;
                }
                buf.data.copy_from_slice(data);
                buf.touched = true;
                bs.buf = Some(buf);
            }
        }
        len as usize
    }

    /// Write the scoped buffer to disk when dirty and writable, then
    /// drop it.
    fn flush_locked(self: &Arc<Entry>, fs: &Volume, bs: &mut BufState) -> bool {
        let Some(buf) = &bs.buf else { return true };
        if !buf.touched {
            bs.buf = None;
            return true;
        }
        if bs.writeopened == WriteOpened::No {
            return false;
        }
        let (offset, data) = (buf.offset, buf.data.clone());
        if self.write_data_unchecked(fs, offset, &data) {
            bs.buf = None;
            true
        } else {
            false
        }
    }

    pub fn flush(self: &Arc<Entry>, fs: &Volume) -> bool {
        if self.state().flags.dir {
            return true;
        }
        let mut bs = self.bufstate.lock().unwrap();
        self.flush_locked(fs, &mut bs)
    }

    /// Open bracket: track write intent and populate the cached area
    /// vector on first access.
    pub fn open(self: &Arc<Entry>, fs: &Volume, write: bool) {
        if self.state().flags.dir {
            return;
        }
        let mut bs = self.bufstate.lock().unwrap();
        if bs.writeopened != WriteOpened::Yes {
            bs.writeopened = if write {
                WriteOpened::Yes
            } else {
                WriteOpened::No
            };
        }
        bs.cptacc += 1;
        if bs.cptacc == 1 {
            let (cluster, size) = {
                let st = self.state();
                (st.cluster, st.size)
            };
            if cluster != 0 && size != 0 {
                let va = fs
                    .fat
                    .write()
                    .unwrap()
                    .getareas(cluster)
                    .sub(size, 0, fs.par.clus_size);
                self.state_mut().areas = Some(va);
            }
        }
    }

    /// Close bracket: flush while still writable; the last close drops
    /// the cached areas and the buffer.
    pub fn close(self: &Arc<Entry>, fs: &Volume) {
        if self.state().flags.dir {
            return;
        }
        if self.writeable() {
            self.flush(fs);
        }
        let mut bs = self.bufstate.lock().unwrap();
        if bs.writeopened == WriteOpened::Yes {
            bs.writeopened = WriteOpened::No;
        }
        bs.cptacc = bs.cptacc.saturating_sub(1);
        if bs.cptacc == 0 {
            bs.buf = None;
            drop(bs);
            self.state_mut().areas = None;
        }
    }

    /// fsck findfile pass: label the chain in the overlay and compare
    /// the chain length against the declared size.
    pub fn mark(self: &Arc<Entry>, fs: &Volume) {
        let (cluster, dir, size) = {
            let st = self.state();
            (st.cluster, st.flags.dir, st.size)
        };
        let areas = fs.fat.write().unwrap().markchain(cluster, self);
        let cnt = areas.nbcls();
        self.state_mut().areas = Some(areas);
        if !dir && cnt != fs.par.siz2cls(size) {
            warn!(
                "entry {} has wrong size: declared {}, found {}",
                self.path(fs),
                size,
                cnt as u64 * fs.par.clus_size
            );
            if fs.opts.mode == Mode::Fsck {
                let what = if cnt > fs.par.siz2cls(size) {
                    "extra"
                } else {
                    "loss of"
                };
                if fs.opts.ask(
                    &format!(
                        "Entry {} has wrong size. Possible {what} data, correct it ?",
                        self.path(fs)
                    ),
                    true,
                ) {
                    let mut st = self.state_mut();
                    st.size = cnt as u64 * fs.par.clus_size;
                    write_record(fs, &mut st);
                }
            }
        }
    }

    /// unrm finddel pass: walk forward from the declared first cluster,
    /// skipping occupied clusters, until enough clusters are claimed in
    /// the overlay. Older deleted entries whose clusters we take are
    /// re-guessed afterwards.
    pub fn guess(self: &Arc<Entry>, fs: &Volume) {
        let (cluster, dir, size, update) = {
            let st = self.state();
            (st.cluster, st.flags.dir, st.size, st.update)
        };
        debug!(
            "guess: {} 0x{cluster:08X} ({})",
            self.path(fs),
            fs.par.siz2cls(size)
        );
        let mut displaced: Vec<Arc<Entry>> = Vec::new();
        let mut fat = fs.fat.write().unwrap();
        let mut nb = if dir { 1 } else { fs.par.siz2cls(size) };
        let mut p = cluster;
        let mut q = cluster;
        while nb > 0 {
            if q < 1 || q > fs.par.clus_fat {
                q = fs.par.inccls(q);
                continue;
            }
            let claimed = {
                let overlay = fat.overlay();
                match overlay {
                    None => None,
                    Some(o) => o
                        .memchain
                        .get(&q)
                        .map(|l| (l.status, l.ent.upgrade())),
                }
            };
            let on_disk = fat.disk_read(q);
            let free = claimed.is_none() && on_disk == FLK;
            if !free {
                if q == cluster {
                    // The declared first cluster is gone; unrecoverable.
                    self.state_mut().status = Status::DelNoData;
                    if fs.opts.verbose {
                        eprintln!("{} not recoverable", self.path(fs));
                    }
                    return;
                }
                let ours = claimed
                    .as_ref()
                    .and_then(|(_, e)| e.as_ref())
                    .is_some_and(|e| Arc::ptr_eq(e, self));
                if !ours {
                    let older = claimed.as_ref().is_some_and(|(status, ent)| {
                        *status == CellStatus::Deleted
                            && fs.opts.deldate
                            && ent.as_ref().is_some_and(|e| {
                                let est = e.state();
                                !est.flags.dir && est.update.seq() < update.seq()
                            })
                    });
                    if older {
                        // Remember the displaced owner and take the
                        // cluster.
                        if let Some((_, Some(e))) = claimed {
                            if !displaced.iter().any(|d| Arc::ptr_eq(d, &e)) {
                                displaced.push(e);
                            }
                        }
                    } else {
                        if claimed.is_none() {
                            // Head of a lost chain short enough to splice
                            // in whole?
                            let lost_idx = fat.overlay().and_then(|o| {
                                o.lost
                                    .iter()
                                    .position(|va| va.first_cluster() == q && va.nbcls() <= nb)
                            });
                            if let Some(i) = lost_idx {
                                if let Some(o) = fat.overlay() {
                                    o.lost.remove(i);
                                    o.change(
                                        p,
                                        Arc::downgrade(self),
                                        q,
                                        CellStatus::Deleted,
                                    );
                                }
                                let links = fat.walk_chain(q);
                                if let Some(o) = fat.overlay() {
                                    for &(c, next) in &links {
                                        o.change(
                                            c,
                                            Arc::downgrade(self),
                                            next,
                                            CellStatus::Deleted,
                                        );
                                    }
                                }
                                let va = fat.areas_from_walk(&links);
                                nb -= va.nbcls().min(nb);
                                q = va.last_cluster();
                                p = q;
                                q = fs.par.inccls(q);
                                continue;
                            }
                        }
                        // Occupied by someone else; keep scanning.
                        q = fs.par.inccls(q);
                        continue;
                    }
                }
            }
            // Claim q for this entry.
            if let Some(o) = fat.overlay() {
                o.change(p, Arc::downgrade(self), q, CellStatus::Deleted);
            }
            nb -= 1;
            p = q;
            q = fs.par.inccls(q);
        }
        if let Some(o) = fat.overlay() {
            o.change(p, Arc::downgrade(self), EOC, CellStatus::Deleted);
        }
        drop(fat);
        // Entries we displaced get another chance further along.
        for e in displaced {
            e.guess(fs);
        }
    }

    /// unrm tryrecov: commit the guessed chain. With `--local` the bytes
    /// go to the host filesystem; otherwise the entry flips back to
    /// valid, its slot is rewritten and the overlay chain is persisted.
    pub fn recover(self: &Arc<Entry>, fs: &Volume) {
        let (dir, name, size, cluster, loc) = {
            let st = self.state();
            (
                st.flags.dir,
                st.name.clone(),
                st.size,
                st.cluster,
                st.loc,
            )
        };
        if fs.opts.local {
            if dir {
                warn!("not rebuilding the directory tree locally");
                return;
            }
            if std::path::Path::new(&name).exists() {
                warn!("can't write {name}: file already exists locally");
                return;
            }
            let mut data = vec![0u8; size as usize];
            if self.read_data(fs, 0, &mut data) {
                if let Err(e) = std::fs::write(&name, &data) {
                    warn!("can't write {name}: {e}");
                }
            }
            return;
        }
        if let Some(parent) = self.state().parent.upgrade() {
            if let Some(twin) = parent.find(fs, &name) {
                if !Arc::ptr_eq(&twin, self) && twin.state().status == Status::Valid {
                    warn!(
                        "can't restore {name}: another valid file with the same name exists"
                    );
                    return;
                }
            }
        }
        // A preceding end marker in our cluster would hide the restored
        // record: demote it to a deleted slot, and everything after it
        // up to the cluster boundary too.
        let cluster_base = fs.par.cls2ptr(fs.par.ptr2cls(loc));
        let buf = fs.dev.read(cluster_base, fs.par.clus_size as usize);
        let mut mark = 0u64;
        let mut off = 0u64;
        for rec in buf.chunks_exact(ENT_SIZE) {
            if rec[0] == EOD || rec[0] == 0 {
                mark = cluster_base + off;
                break;
            }
            off += ENT_SIZE as u64;
        }
        if mark != 0 && loc > mark {
            let mut placeholder = [0u8; ENT_SIZE];
            placeholder[0] = DELETED_MARK;
            let _ = fs.dev.write(mark, &placeholder);
            let mut slot = mark + ENT_SIZE as u64;
            while slot < cluster_base + fs.par.clus_size {
                let _ = fs.dev.write(slot, &[DELETED_MARK]);
                slot += ENT_SIZE as u64;
            }
        }
        {
            let mut st = self.state_mut();
            st.status = Status::Valid;
            write_record(fs, &mut st);
        }
        let mut fat = fs.fat.write().unwrap();
        let links = fat.walk_chain(cluster);
        for &(c, next) in &links {
            let _ = fat.write(c, next);
            if let Some(o) = fat.overlay() {
                o.set_status(c, CellStatus::Modified);
            }
        }
    }

    /// Recursive pre-order pass driver. Returns whether anything below
    /// this node was recovered, letting deleted directories recover
    /// themselves opportunistically.
    pub fn analyse(self: &Arc<Entry>, fs: &Volume, pass: Pass, header: &str) -> bool {
        let (status, dir, cluster, name, size) = {
            let st = self.state();
            (
                st.status,
                st.flags.dir,
                st.cluster,
                st.name.clone(),
                st.size,
            )
        };
        let mut recovered = false;
        if pass != Pass::FindFile && dir && status == Status::DelNoData {
            warn!("entry {header}{name} points to invalid data, skipping");
            return false;
        }
        if pass == Pass::FindFile && status == Status::Valid {
            if dir && cluster == FLK {
                warn!("entry {header}{name} has invalid cluster pointer");
                if fs.opts.mode == Mode::Fsck
                    && fs.opts.ask(
                        &format!("Entry {header}{name} has invalid cluster pointer. Remove it ?"),
                        true,
                    )
                {
                    if let Some(parent) = self.state().parent.upgrade() {
                        parent.remfrdir(fs, self, false);
                    }
                }
                return false;
            }
            if fs.opts.verbose {
                if dir {
                    eprintln!("{header}{name}/");
                } else {
                    eprintln!("{header}{name} ({size})");
                }
            }
            self.mark(fs);
        }
        if pass == Pass::FindDel && (status == Status::DelWData || status == Status::DelNoData) {
            if fs.opts.verbose {
                let tag = if status == Status::DelWData {
                    "deleted"
                } else {
                    "not recoverable"
                };
                if dir {
                    eprintln!("{header}{name}/ {tag}");
                } else {
                    eprintln!("{header}{name} ({size}) {tag}");
                }
            }
            if status == Status::DelWData {
                self.guess(fs);
            }
        }
        if pass == Pass::TryRecov && status == Status::DelWData && !dir {
            if fs
                .opts
                .ask(&format!("{header}{name} ({size}) recover ?"), false)
            {
                recovered = true;
                self.recover(fs);
            }
        }
        if dir {
            let children = self.state().children.clone();
            let sub = format!("{header}{name}/");
            for child in children {
                recovered = child.analyse(fs, pass, &sub) || recovered;
            }
        }
        if recovered && dir && self.state().status != Status::Valid && !fs.opts.local {
            warn!("recovering parent directory {header}{name}");
            self.recover(fs);
        }
        recovered
    }
}

/// Encode the state into its 64-byte record.
pub fn encode_record(st: &EntryState) -> [u8; ENT_SIZE] {
    let mut buf = [0u8; ENT_SIZE];
    if st.status == Status::End {
        return [EOD; ENT_SIZE];
    }
    buf[0] = if st.status == Status::DelWData || st.status == Status::DelNoData {
        DELETED_MARK
    } else {
        st.name.len() as u8
    };
    buf[1] = st.flags.encode();
    let name = st.name.as_bytes();
    buf[2..2 + name.len().min(NAME_SIZE)].copy_from_slice(&name[..name.len().min(NAME_SIZE)]);
    LittleEndian::write_u32(&mut buf[0x2C..0x30], st.cluster);
    LittleEndian::write_u32(&mut buf[0x30..0x34], st.size as u32);
    buf[0x34..0x38].copy_from_slice(&st.creation.encode());
    buf[0x38..0x3C].copy_from_slice(&st.access.encode());
    buf[0x3C..0x40].copy_from_slice(&st.update.encode());
    buf
}

/// Persist a locked state to its slot, refreshing the access stamp.
fn write_record(fs: &Volume, st: &mut EntryState) -> bool {
    if st.status == Status::Invalid || (st.flags.dir && st.cluster == 0) {
        return false;
    }
    if st.loc == 0 {
        return true;
    }
    if st.status != Status::End {
        st.access = FatxDate::now();
    }
    fs.dev.write(st.loc, &encode_record(st)).is_ok()
}

/// Write an end-of-directory marker record at `loc`.
pub fn write_end_marker(fs: &Volume, loc: u64) -> crate::error::Result<()> {
    fs.dev.write(loc, &[EOD; ENT_SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::options::Options;
    use std::path::PathBuf;

    fn volume(mode: Mode) -> Arc<Volume> {
        let mut opts = Options::new(mode, PathBuf::from("test.img"));
        opts.table = "file".into();
        opts.clus_size = 1;
        opts.force_answers(true, false, false);
        let dev = Device::from_memory(vec![0u8; 2 * 1024 * 1024], true);
        let vol = Volume::with_device(opts, dev).unwrap();
        vol.fat.write().unwrap().gapcheck();
        vol
    }

    fn state_for(name: &str, cluster: u32, size: u64, flags: Attributes) -> EntryState {
        EntryState {
            status: Status::Valid,
            flags,
            name: name.to_string(),
            namesize: name.len() as u8,
            cluster,
            size,
            creation: FatxDate {
                year: 2004,
                month: 3,
                day: 17,
                hour: 9,
                min: 41,
                sec: 8,
            },
            access: FatxDate::default(),
            update: FatxDate {
                year: 2107,
                month: 12,
                day: 31,
                hour: 23,
                min: 59,
                sec: 58,
            },
            loc: 0,
            parent: Weak::new(),
            children: Vec::new(),
            areas: None,
        }
    }

    #[test]
    fn test_record_round_trip() {
        let vol = volume(Mode::Mount);
        let root = vol.root();
        let flags = Attributes {
            ro: true,
            arc: true,
            ..Attributes::default()
        };
        // A one-cluster chain so the decode classifies the entry valid.
        vol.fat.write().unwrap().write(5, EOC).unwrap();
        let st = state_for("SAVEGAME.DAT", 5, 777, flags);
        let buf = encode_record(&st);
        let back = Entry::from_record(&vol, 0x4000, &buf, &root);
        let bst = back.state();
        assert_eq!(bst.status, Status::Valid);
        assert_eq!(bst.name, "SAVEGAME.DAT");
        assert_eq!(bst.flags, flags);
        assert_eq!(bst.cluster, 5);
        assert_eq!(bst.size, 777);
        assert_eq!(bst.creation, st.creation);
        assert_eq!(bst.update, st.update);
        assert_eq!(bst.loc, 0x4000);
    }

    #[test]
    fn test_record_round_trip_deleted() {
        let vol = volume(Mode::Unrm);
        let root = vol.root();
        let mut st = state_for("GONE.BIN", 9, 4096, Attributes::default());
        st.status = Status::DelWData;
        let buf = encode_record(&st);
        assert_eq!(buf[0], DELETED_MARK);
        let back = Entry::from_record(&vol, 0x4000, &buf, &root);
        // Cluster 9 is FREE and unclaimed: recoverable.
        assert_eq!(back.state().status, Status::DelWData);
        assert_eq!(back.state().name, "GONE.BIN");
    }

    #[test]
    fn test_end_marker_decodes_as_end() {
        let vol = volume(Mode::Mount);
        let root = vol.root();
        for fill in [0x00u8, EOD] {
            let buf = [fill; ENT_SIZE];
            let back = Entry::from_record(&vol, 0, &buf, &root);
            assert_eq!(back.state().status, Status::End);
        }
    }

    #[test]
    fn test_bad_records_decode_invalid() {
        let vol = volume(Mode::Mount);
        let root = vol.root();
        // Name length that does not match the name bytes.
        let mut st = state_for("SHORT", 0, 0, Attributes::default());
        st.namesize = 30;
        let mut buf = encode_record(&st);
        buf[0] = 30;
        let back = Entry::from_record(&vol, 0, &buf, &root);
        assert_eq!(back.state().status, Status::Invalid);

        // Out-of-range first cluster.
        let st = state_for("FARAWAY", vol.par.clus_fat + 7, 1, Attributes::default());
        let back = Entry::from_record(&vol, 0, &encode_record(&st), &root);
        assert_eq!(back.state().status, Status::Invalid);

        // Non-printable name head.
        let st = state_for("OK", 0, 0, Attributes::default());
        let mut buf = encode_record(&st);
        buf[2] = 0x07;
        let back = Entry::from_record(&vol, 0, &buf, &root);
        assert_eq!(back.state().status, Status::Invalid);
    }

    #[test]
    fn test_attribute_bits_round_trip() {
        for bits in 0..=255u8 {
            assert_eq!(Attributes::decode(bits).encode(), bits);
        }
        let dir = Attributes {
            dir: true,
            ..Attributes::default()
        };
        assert_eq!(dir.mode() & 0o170000, 0o040000);
        let mut rw = Attributes::default();
        rw.set_mode(0o444);
        assert!(rw.ro);
        rw.set_mode(0o644);
        assert!(!rw.ro);
    }

    #[test]
    fn test_name_sanitisation() {
        assert_eq!(sanitize_name(b"HELLO"), "HELLO");
        assert_eq!(sanitize_name(&[b'A', 0x01, b'B']), "A~B");
        assert_eq!(sanitize_name(&[b'A', 0xFF, b'B']), "A");
        assert_eq!(sanitize_name(&[b'A', 0x00, b'B']), "A");
    }
}
