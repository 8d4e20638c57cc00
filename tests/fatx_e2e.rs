//! End-to-end tests over in-memory FATX images.
//!
//! Each test builds a fresh image with the mkfs pipeline, drives it
//! through the mount dispatch or the repair pipelines, and inspects the
//! resulting bytes. No fixtures: everything is generated in memory.

use std::path::PathBuf;
use std::sync::Arc;

use fatxfs::device::Device;
use fatxfs::entry::Status;
use fatxfs::fat::{EOC, FLK};
use fatxfs::mount::{FsError, MountDispatch};
use fatxfs::options::{Mode, Options};
use fatxfs::partition::BLKSIZE;
use fatxfs::run::pipeline;
use fatxfs::volume::Volume;

fn options(mode: Mode) -> Options {
    let mut o = Options::new(mode, PathBuf::from("test.img"));
    o.force_answers(true, false, false);
    o
}

/// Run mkfs over a zeroed in-memory image and hand back the bytes.
fn mkfs_image(size: usize, cls_sectors: u32, label: Option<&str>) -> Vec<u8> {
    let mut o = options(Mode::Mkfs);
    o.clus_size = cls_sectors;
    o.volname = label.map(str::to_string);
    let dev = Device::from_memory(vec![0u8; size], true);
    let vol = Volume::with_device(o, dev).unwrap();
    assert_eq!(pipeline(&vol).unwrap(), 0);
    extract_image(vol)
}

fn open_vol(img: Vec<u8>, mode: Mode) -> Arc<Volume> {
    open_vol_with(img, mode, |_| {})
}

fn open_vol_with(img: Vec<u8>, mode: Mode, f: impl FnOnce(&mut Options)) -> Arc<Volume> {
    let mut o = options(mode);
    f(&mut o);
    let dev = Device::from_memory(img, true);
    let vol = Volume::with_device(o, dev).unwrap();
    if mode == Mode::Mount {
        vol.fat.write().unwrap().gapcheck();
    }
    vol
}

fn extract_image(vol: Arc<Volume>) -> Vec<u8> {
    let dev = vol.dev.clone();
    vol.teardown();
    drop(vol);
    Arc::try_unwrap(dev).ok().expect("device still shared").into_image()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Write a whole file through the mount dispatch, in host-sized chunks
/// like a kernel adapter would.
fn put_file(d: &MountDispatch, path: &str, data: &[u8]) {
    d.create(path, 0o644).unwrap();
    d.open(path, true).unwrap();
    for (i, chunk) in data.chunks(128 * 1024).enumerate() {
        let off = i as u64 * 128 * 1024;
        assert_eq!(d.write(path, off, chunk).unwrap(), chunk.len());
    }
    d.flush(path).unwrap();
    d.release(path).unwrap();
}

fn get_file(d: &MountDispatch, path: &str, len: usize) -> Vec<u8> {
    d.open(path, false).unwrap();
    let mut buf = vec![0u8; len];
    let n = d.read(path, 0, &mut buf).unwrap();
    d.release(path).unwrap();
    buf.truncate(n);
    buf
}

// ---------------------------------------------------------------------
// Scenario 1: mkfs then attribute check.
// ---------------------------------------------------------------------

#[test]
fn test_mkfs_attributes() {
    let img = mkfs_image(64 * 1024 * 1024, 16, None);
    assert_eq!(&img[0..4], b"XTAF");
    // Boot sector: id, sectors per cluster, root cluster.
    assert_eq!(u32::from_le_bytes(img[8..12].try_into().unwrap()), 16);
    assert_eq!(u32::from_le_bytes(img[12..16].try_into().unwrap()), 1);

    let vol = open_vol(img, Mode::Mount);
    let par = vol.par.clone();
    assert_eq!(par.clus_size, 16 * BLKSIZE);

    // FAT region: only the root cluster cell is non-zero (end of chain).
    let fat = vol.dev.read(par.fat_start, par.fat_size as usize);
    assert_eq!(&fat[2..4], &[0xFF, 0xFF]);
    assert!(fat[..2].iter().all(|&b| b == 0));
    assert!(fat[4..].iter().all(|&b| b == 0));

    // Root cluster holds the end-of-directory marker and nothing else.
    let root_data = vol.dev.read(par.root_start, par.clus_size as usize);
    assert!(root_data[..64].iter().all(|&b| b == 0xFF));
    assert!(root_data[64..].iter().all(|&b| b == 0));

    assert_eq!(vol.fat.write().unwrap().clsavail(), par.clus_fat - 1);
}

// ---------------------------------------------------------------------
// Scenario 2: create, write, read back.
// ---------------------------------------------------------------------

#[test]
fn test_create_write_readback() {
    let img = mkfs_image(64 * 1024 * 1024, 16, None);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());

    let data = pattern(65537);
    put_file(&d, "/A.BIN", &data);
    assert_eq!(get_file(&d, "/A.BIN", 65537), data);

    let cluster = vol.root().find(&vol, "A.BIN").unwrap().state().cluster;
    let chain = vol.fat.write().unwrap().getareas(cluster);
    assert_eq!(chain.nbcls() as u64, 65537u64.div_ceil(vol.par.clus_size));

    // Survives a reopen from the raw bytes.
    let img = extract_image(vol);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());
    assert_eq!(get_file(&d, "/A.BIN", 65537), data);
}

// ---------------------------------------------------------------------
// Scenario 3: delete and undelete.
// ---------------------------------------------------------------------

#[test]
fn test_delete_and_undelete() {
    let img = mkfs_image(8 * 1024 * 1024, 8, None);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());

    let a = pattern(4096);
    let b: Vec<u8> = (0..4096).map(|i| (i % 13) as u8).collect();
    put_file(&d, "/A.BIN", &a);
    put_file(&d, "/B.BIN", &b);
    d.unlink("/A.BIN").unwrap();
    assert_eq!(d.getattr("/A.BIN").unwrap_err(), FsError::NoEnt);
    let img = extract_image(vol);

    // unrm answers yes to every recovery offer.
    let vol = open_vol(img, Mode::Unrm);
    let code = pipeline(&vol).unwrap();
    assert_eq!(code & !1, 0, "unexpected error bits in exit code {code}");
    let img = extract_image(vol);

    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());
    assert_eq!(get_file(&d, "/A.BIN", 4096), a);
    assert_eq!(get_file(&d, "/B.BIN", 4096), b);
}

// ---------------------------------------------------------------------
// Scenario 4: fragmented allocation.
// ---------------------------------------------------------------------

#[test]
fn test_fragmented_allocation() {
    // Small image: root + ten 8 KiB files + a filler that pins the tail,
    // so freeing the odd files leaves exactly five one-cluster gaps.
    let img = mkfs_image(128 * 1024, 16, None);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());
    let cs = vol.par.clus_size as usize;
    assert_eq!(cs, 8192);

    for i in 0..10 {
        put_file(&d, &format!("/F{i}"), &pattern(cs));
    }
    let tail_free = vol.fat.write().unwrap().clsavail();
    put_file(&d, "/FILL", &pattern(tail_free as usize * cs));
    assert_eq!(vol.fat.write().unwrap().clsavail(), 0);

    for i in [1, 3, 5, 7, 9] {
        d.unlink(&format!("/F{i}")).unwrap();
    }
    assert_eq!(vol.fat.write().unwrap().clsavail(), 5);

    let big = pattern(40 * 1024);
    put_file(&d, "/BIG", &big);
    assert_eq!(get_file(&d, "/BIG", big.len()), big);

    let cluster = vol.root().find(&vol, "BIG").unwrap().state().cluster;
    let chain = vol.fat.write().unwrap().getareas(cluster);
    assert_eq!(chain.nbcls(), 5);
    assert!(chain.len() >= 5, "expected a fragmented chain");
    // Gaps are consumed in decreasing-size order; equal-size gaps come
    // highest-cluster first.
    let starts: Vec<u32> = chain.iter().map(|a| a.start).collect();
    let mut sorted = starts.clone();
    sorted.sort_unstable_by(|x, y| y.cmp(x));
    assert_eq!(starts, sorted);
}

// ---------------------------------------------------------------------
// Scenario 5: cycle repair.
// ---------------------------------------------------------------------

#[test]
fn test_cycle_repair() {
    let mut img = mkfs_image(8 * 1024 * 1024, 8, None);
    // Hand-craft a lost cycle 5 -> 6 -> 5 in the 16-bit FAT.
    let fat_start = 0x1000;
    img[fat_start + 2 * 5..fat_start + 2 * 5 + 2].copy_from_slice(&6u16.to_le_bytes());
    img[fat_start + 2 * 6..fat_start + 2 * 6 + 2].copy_from_slice(&5u16.to_le_bytes());

    let vol = open_vol(img, Mode::Fsck);
    let code = pipeline(&vol).unwrap();
    assert_eq!(code, 1, "corrected bit expected");
    let img = extract_image(vol);

    // The cycle was cut and the chain freed; a second pass is clean.
    assert_eq!(&img[fat_start + 10..fat_start + 14], &[0, 0, 0, 0]);
    let vol = open_vol_with(img, Mode::Fsck, |o| o.force_answers(false, true, false));
    assert_eq!(pipeline(&vol).unwrap(), 0);
    let mut fat = vol.fat.write().unwrap();
    fat.fatlost();
    assert!(fat.overlay().unwrap().lost.is_empty());
}

// ---------------------------------------------------------------------
// Scenario 6: label read and write.
// ---------------------------------------------------------------------

#[test]
fn test_label_roundtrip() {
    let img = mkfs_image(8 * 1024 * 1024, 8, None);

    let vol = open_vol_with(img, Mode::Label, |o| {
        o.volname = Some("HELLO".to_string());
        o.set_writable(true);
    });
    assert_eq!(pipeline(&vol).unwrap(), 0);
    let img = extract_image(vol);

    let vol = open_vol(img, Mode::Mount);
    assert_eq!(vol.label(), "HELLO");
    let idx = vol.root().find(&vol, "name.txt").unwrap();
    let (lab, size, cluster) = {
        let st = idx.state();
        (st.flags.lab, st.size, st.cluster)
    };
    assert!(lab);
    assert_eq!(size, 12);
    let bytes = vol.dev.read(vol.par.cls2ptr(cluster), 12);
    assert_eq!(
        bytes,
        vec![0xFE, 0xFF, b'H', 0, b'E', 0, b'L', 0, b'L', 0, b'O', 0]
    );
}

// ---------------------------------------------------------------------
// Mount contract behaviors beyond the literal scenarios.
// ---------------------------------------------------------------------

#[test]
fn test_mkdir_readdir_and_nested_files() {
    let img = mkfs_image(8 * 1024 * 1024, 8, None);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());

    d.mkdir("/SAVES", 0o755).unwrap();
    put_file(&d, "/SAVES/GAME.SAV", b"progress");
    let names = d.readdir("/").unwrap();
    assert!(names.contains(&"SAVES".to_string()));
    assert_eq!(d.readdir("/SAVES").unwrap(), vec!["GAME.SAV".to_string()]);

    let attr = d.getattr("/SAVES/GAME.SAV").unwrap();
    assert_eq!(attr.size, 8);
    assert_eq!(attr.blksize as u64, vol.par.clus_size);

    // The tree survives a reparse.
    let img = extract_image(vol);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());
    assert_eq!(get_file(&d, "/SAVES/GAME.SAV", 8), b"progress");
}

#[test]
fn test_rmdir_nonempty_refused() {
    let img = mkfs_image(8 * 1024 * 1024, 8, None);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());

    d.mkdir("/DIR", 0o755).unwrap();
    put_file(&d, "/DIR/F", b"x");
    assert_eq!(d.rmdir("/DIR").unwrap_err(), FsError::NotEmpty);
    d.unlink("/DIR/F").unwrap();
    d.rmdir("/DIR").unwrap();
    assert_eq!(d.getattr("/DIR").unwrap_err(), FsError::NoEnt);
}

#[test]
fn test_rename_across_directories() {
    let img = mkfs_image(8 * 1024 * 1024, 8, None);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());

    d.mkdir("/A", 0o755).unwrap();
    d.mkdir("/B", 0o755).unwrap();
    put_file(&d, "/A/F.TXT", b"moved bytes");
    d.rename("/A/F.TXT", "/B/G.TXT").unwrap();
    assert_eq!(d.getattr("/A/F.TXT").unwrap_err(), FsError::NoEnt);
    assert_eq!(get_file(&d, "/B/G.TXT", 11), b"moved bytes");

    let img = extract_image(vol);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());
    assert_eq!(get_file(&d, "/B/G.TXT", 11), b"moved bytes");
    assert!(d.readdir("/A").unwrap().is_empty());
}

#[test]
fn test_truncate_shrinks_and_frees() {
    let img = mkfs_image(8 * 1024 * 1024, 8, None);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());
    let cs = vol.par.clus_size;

    let data = pattern(3 * cs as usize);
    put_file(&d, "/T.BIN", &data);
    let free_before = vol.fat.write().unwrap().clsavail();

    d.open("/T.BIN", true).unwrap();
    d.truncate("/T.BIN", cs).unwrap();
    d.release("/T.BIN").unwrap();

    assert_eq!(d.getattr("/T.BIN").unwrap().size, cs);
    assert_eq!(vol.fat.write().unwrap().clsavail(), free_before + 2);
    assert_eq!(get_file(&d, "/T.BIN", cs as usize), data[..cs as usize]);
}

#[test]
fn test_statfs_tracks_allocation() {
    let img = mkfs_image(8 * 1024 * 1024, 8, None);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());

    let before = d.statfs();
    put_file(&d, "/S.BIN", &pattern(vol.par.clus_size as usize * 2));
    let after = d.statfs();
    assert_eq!(before.bfree - after.bfree, 2 * vol.par.clus_size);
    assert_eq!(after.namemax, 42);
}

#[test]
fn test_write_requires_open_for_write() {
    let img = mkfs_image(8 * 1024 * 1024, 8, None);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());

    put_file(&d, "/RO.BIN", b"data");
    d.open("/RO.BIN", false).unwrap();
    assert_eq!(d.write("/RO.BIN", 0, b"nope").unwrap_err(), FsError::NoSpc);
    d.release("/RO.BIN").unwrap();
}

#[test]
fn test_deep_path_lookup_and_name_too_long() {
    let img = mkfs_image(8 * 1024 * 1024, 8, None);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());

    let long = format!("/{}", "X".repeat(43));
    assert_eq!(d.create(&long, 0o644).unwrap_err(), FsError::NameTooLong);
    assert_eq!(d.getattr("/missing").unwrap_err(), FsError::NoEnt);
    assert_eq!(d.chown("/", 1000, 1000), Ok(()));
}

// ---------------------------------------------------------------------
// Undelete details: reuse makes data unrecoverable, fsck fixes sizes.
// ---------------------------------------------------------------------

#[test]
fn test_undelete_gives_up_on_reused_cluster() {
    let img = mkfs_image(8 * 1024 * 1024, 8, None);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());

    put_file(&d, "/OLD.BIN", &pattern(4096));
    d.unlink("/OLD.BIN").unwrap();
    // Reuse the freed cluster immediately: alloc prefers the hole left
    // behind only under a hint, so force reuse by filling everything.
    let free = vol.fat.write().unwrap().clsavail();
    put_file(&d, "/NEW.BIN", &pattern(free as usize * vol.par.clus_size as usize));
    let img = extract_image(vol);

    let vol = open_vol(img, Mode::Unrm);
    pipeline(&vol).unwrap();
    let root = vol.root();
    let old = root.find(&vol, "OLD.BIN").unwrap();
    assert_eq!(old.state().status, Status::DelNoData);
}

#[test]
fn test_fsck_corrects_declared_size() {
    let img = mkfs_image(8 * 1024 * 1024, 8, None);
    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());
    put_file(&d, "/SZ.BIN", &pattern(2 * vol.par.clus_size as usize));
    // Corrupt the declared size in the directory record.
    let loc = vol.root().find(&vol, "SZ.BIN").unwrap().state().loc;
    let mut img = extract_image(vol);
    img[loc as usize + 0x30..loc as usize + 0x34].copy_from_slice(&100u32.to_le_bytes());

    let vol = open_vol(img, Mode::Fsck);
    let code = pipeline(&vol).unwrap();
    assert_eq!(code, 1);
    let img = extract_image(vol);

    let vol = open_vol(img, Mode::Mount);
    let size = vol.root().find(&vol, "SZ.BIN").unwrap().state().size;
    assert_eq!(size, 2 * vol.par.clus_size);
}

#[test]
fn test_unrm_recovers_lost_chain_into_lostfound() {
    let mut img = mkfs_image(8 * 1024 * 1024, 8, None);
    // A chain nobody references: clusters 40..42.
    let fat_start = 0x1000;
    for (c, v) in [(40u16, 41u16), (41, 42), (42, 0xFFFF)] {
        let off = fat_start + 2 * c as usize;
        img[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    let vol = open_vol(img, Mode::Unrm);
    pipeline(&vol).unwrap();
    let img = extract_image(vol);

    let vol = open_vol(img, Mode::Mount);
    let d = MountDispatch::new(vol.clone());
    let names = d.readdir("/lost+found").unwrap();
    assert_eq!(names, vec!["FILE000".to_string()]);
    let attr = d.getattr("/lost+found/FILE000").unwrap();
    assert_eq!(attr.size, 3 * vol.par.clus_size);
}

#[test]
fn test_device_file_backend() {
    let path = std::env::temp_dir().join(format!(
        "fatxfs-e2e-{}-{:?}.img",
        std::process::id(),
        std::thread::current().id()
    ));
    std::fs::write(&path, vec![0u8; 1024 * 1024]).unwrap();
    {
        let dev = Device::open(&path, true).unwrap();
        dev.write(512, b"backend").unwrap();
        assert_eq!(dev.read(512, 7), b"backend");
        assert!(dev.modified());
    }
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[512..519], b"backend");
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_sentinel_constants() {
    assert_eq!(FLK, 0);
    assert_eq!(EOC, 0xFFFF_FFFF);
}
