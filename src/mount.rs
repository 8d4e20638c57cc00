//! The mount-layer contract: every host filesystem callback the core
//! exposes, dispatched over path strings against the entry tree. The
//! host event loop itself (FUSE or otherwise) lives outside this crate;
//! an adapter forwards each callback here and returns `errno()` on
//! failure.

use std::sync::Arc;

use crate::date::FatxDate;
use crate::entry::{Entry, Status};
use crate::fat::FLK;
use crate::partition::NAME_SIZE;
use crate::volume::Volume;

/// POSIX-compatible error surface of the mount contract. `errno()`
/// yields the negative code an adapter hands back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NoEnt,
    Rofs,
    Access,
    NoSpc,
    Exist,
    NotEmpty,
    NameTooLong,
    Busy,
    BadF,
    Perm,
}

impl FsError {
    pub fn errno(&self) -> i32 {
        -match self {
            FsError::Perm => 1,
            FsError::NoEnt => 2,
            FsError::BadF => 9,
            FsError::Access => 13,
            FsError::Busy => 16,
            FsError::Exist => 17,
            FsError::NoSpc => 28,
            FsError::Rofs => 30,
            FsError::NameTooLong => 36,
            FsError::NotEmpty => 39,
        }
    }
}

/// Metadata projection of an entry.
#[derive(Debug, Clone)]
pub struct Attr {
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: FatxDate,
    pub mtime: FatxDate,
    pub ctime: FatxDate,
    pub uid: u32,
    pub gid: u32,
    pub dev_id: u32,
}

/// Filesystem-wide statistics for statfs.
#[derive(Debug, Clone)]
pub struct Statfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub bsize: u32,
    pub namemax: u32,
    pub fsid: u32,
}

/// Path-based dispatch of host callbacks onto the entry tree.
pub struct MountDispatch {
    vol: Arc<Volume>,
}

impl MountDispatch {
    pub fn new(vol: Arc<Volume>) -> MountDispatch {
        MountDispatch { vol }
    }

    fn lookup(&self, path: &str) -> Result<Arc<Entry>, FsError> {
        let root = self.vol.root();
        let e = root.find(&self.vol, path).ok_or(FsError::NoEnt)?;
        if e.state().status == Status::Invalid {
            return Err(FsError::NoEnt);
        }
        Ok(e)
    }

    fn writable(&self) -> Result<(), FsError> {
        if self.vol.opts.writeable() || self.vol.opts.test {
            Ok(())
        } else {
            Err(FsError::Rofs)
        }
    }

    pub fn getattr(&self, path: &str) -> Result<Attr, FsError> {
        let e = self.lookup(path)?;
        let st = e.state();
        if st.flags.dir && st.cluster == 0 {
            return Err(FsError::NoEnt);
        }
        let opts = &self.vol.opts;
        let par = &self.vol.par;
        Ok(Attr {
            mode: st.flags.mode() & (opts.mask | 0o170000),
            nlink: st.children.len() as u32 + 1,
            size: if st.flags.dir {
                st.children.len() as u64
            } else {
                st.size
            },
            blksize: par.clus_size as u32,
            blocks: par.siz2cls(st.size) as u64 * par.clus_size / crate::partition::BLKSIZE,
            atime: st.access,
            mtime: st.update,
            ctime: st.creation,
            uid: opts.uid,
            gid: opts.gid,
            dev_id: par.par_id,
        })
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<(), FsError> {
        let e = self.lookup(path)?;
        self.writable()?;
        if e.state().flags.ro {
            return Err(FsError::Access);
        }
        e.resize(&self.vol, size);
        Ok(())
    }

    /// chmod keeps only the read-only bit; everything else has no
    /// on-disk representation.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let e = self.lookup(path)?;
        self.writable()?;
        e.state_mut().flags.set_mode(mode);
        e.save(&self.vol);
        Ok(())
    }

    /// The format stores no ownership; chown succeeds without effect.
    pub fn chown(&self, path: &str, _uid: u32, _gid: u32) -> Result<(), FsError> {
        self.lookup(path)?;
        self.writable()?;
        Ok(())
    }

    pub fn utimens(&self, path: &str, atime: FatxDate, mtime: FatxDate) -> Result<(), FsError> {
        let e = self.lookup(path)?;
        self.writable()?;
        if e.state().flags.ro {
            return Err(FsError::Access);
        }
        {
            let mut st = e.state_mut();
            st.access = atime;
            st.update = mtime;
        }
        e.save(&self.vol);
        Ok(())
    }

    pub fn open(&self, path: &str, write: bool) -> Result<(), FsError> {
        let e = self.lookup(path)?;
        if write {
            self.writable()?;
            if e.state().flags.ro {
                return Err(FsError::Perm);
            }
        }
        e.open(&self.vol, write);
        Ok(())
    }

    pub fn read(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let e = self.lookup(path)?;
        Ok(e.bufread(&self.vol, offset, buf))
    }

    pub fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let e = self.lookup(path)?;
        self.writable()?;
        if e.state().flags.ro {
            return Err(FsError::Access);
        }
        let n = e.bufwrite(&self.vol, offset, data);
        if n == 0 && !data.is_empty() {
            return Err(FsError::NoSpc);
        }
        Ok(n)
    }

    pub fn flush(&self, path: &str) -> Result<(), FsError> {
        let e = self.lookup(path)?;
        if e.flush(&self.vol) {
            Ok(())
        } else {
            Err(FsError::NoSpc)
        }
    }

    pub fn release(&self, path: &str) -> Result<(), FsError> {
        let e = self.lookup(path)?;
        e.close(&self.vol);
        Ok(())
    }

    /// Directory listing: the valid children, plus recoverable ones in
    /// recovery mode.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let e = self.lookup(path)?;
        let st = e.state();
        Ok(st
            .children
            .iter()
            .filter(|c| {
                let cst = c.state();
                cst.status == Status::Valid
                    || (self.vol.opts.recover && cst.status == Status::DelWData)
            })
            .map(|c| c.state().name.clone())
            .collect())
    }

    fn create_node(&self, path: &str, dir: bool, mode: u32) -> Result<(), FsError> {
        self.writable()?;
        let (dirpart, base) = match path.rfind('/') {
            Some(cut) if cut < path.len() - 1 => path.split_at(cut),
            _ => return Err(FsError::NoEnt),
        };
        let base = &base[1..];
        if base.len() > NAME_SIZE {
            return Err(FsError::NameTooLong);
        }
        let root = self.vol.root();
        if root.find(&self.vol, path).is_some() {
            return Err(FsError::Exist);
        }
        let n = Entry::create(&self.vol, base, 0, dir);
        if dir && n.state().cluster == FLK {
            return Err(FsError::NoSpc);
        }
        let parent = root.find(&self.vol, dirpart).ok_or(FsError::NoEnt)?;
        if !parent.addtodir(&self.vol, &n) {
            return Err(FsError::BadF);
        }
        self.chmod(path, mode)
    }

    pub fn create(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.create_node(path, false, mode)
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.create_node(path, true, mode)
    }

    fn remove_node(&self, path: &str) -> Result<(), FsError> {
        let e = self.lookup(path)?;
        self.writable()?;
        let (ro, dir, nchild, parent) = {
            let st = e.state();
            (
                st.flags.ro,
                st.flags.dir,
                st.children.len(),
                st.parent.clone(),
            )
        };
        if ro {
            return Err(FsError::Access);
        }
        if Arc::ptr_eq(&e, &self.vol.root()) {
            return Err(FsError::Busy);
        }
        if dir && nchild != 0 {
            return Err(FsError::NotEmpty);
        }
        let parent = parent.upgrade().ok_or(FsError::NoEnt)?;
        parent.remfrdir(&self.vol, &e, true);
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.remove_node(path)
    }

    pub fn rmdir(&self, path: &str) -> Result<(), FsError> {
        self.remove_node(path)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let e = self.lookup(from)?;
        self.writable()?;
        if e.state().flags.ro {
            return Err(FsError::Access);
        }
        if e.rename(&self.vol, to) {
            Ok(())
        } else {
            Err(FsError::NoSpc)
        }
    }

    pub fn statfs(&self) -> Statfs {
        let par = &self.vol.par;
        let avail = self.vol.fat.write().unwrap().clsavail() as u64;
        Statfs {
            blocks: (par.clus_fat - par.root_clus) as u64 * par.clus_size,
            bfree: avail * par.clus_size,
            bavail: avail * par.clus_size,
            bsize: 1,
            namemax: NAME_SIZE as u32,
            fsid: par.par_id,
        }
    }
}
