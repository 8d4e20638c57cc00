use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::device::Device;
use crate::error::{FatxError, Result};
use crate::options::{Mode, Options};

/// Standard block size; cluster sizes are multiples of this.
pub const BLKSIZE: u64 = 512;
/// FATX signature at the start of every partition.
pub const FSID: &[u8; 4] = b"XTAF";
/// Maximum entry name length.
pub const NAME_SIZE: usize = 0x2A;
/// Maximum byte size of the label file (BOM + UTF-16 name).
pub const SLAB: usize = NAME_SIZE * 2 + 2;

/// 512-byte boot sector at the partition start.
#[derive(Debug, Clone, Copy)]
pub struct BootSect {
    pub id: u32,
    pub spc: u32,
    pub root: u32,
}

impl BootSect {
    pub fn decode(buf: &[u8]) -> BootSect {
        BootSect {
            id: LittleEndian::read_u32(&buf[4..8]),
            spc: LittleEndian::read_u32(&buf[8..12]),
            root: LittleEndian::read_u32(&buf[12..16]),
        }
    }

    pub fn encode(&self) -> [u8; BLKSIZE as usize] {
        let mut buf = [0u8; BLKSIZE as usize];
        buf[0..4].copy_from_slice(FSID);
        LittleEndian::write_u32(&mut buf[4..8], self.id);
        LittleEndian::write_u32(&mut buf[8..12], self.spc);
        LittleEndian::write_u32(&mut buf[12..16], self.root);
        buf
    }
}

/// DevKit HDD header at device offset 0; partition bounds in 512-byte
/// sectors.
#[derive(Debug, Clone, Copy)]
pub struct DevHeader {
    pub id: u32,
    pub p2_start: u32,
    pub p2_size: u32,
    pub p1_start: u32,
    pub p1_size: u32,
}

pub const DEVKIT_ID: u32 = 0x0002_0000;

impl DevHeader {
    pub fn decode(buf: &[u8]) -> DevHeader {
        DevHeader {
            id: LittleEndian::read_u32(&buf[0..4]),
            p2_start: LittleEndian::read_u32(&buf[8..12]),
            p2_size: LittleEndian::read_u32(&buf[12..16]),
            p1_start: LittleEndian::read_u32(&buf[16..20]),
            p1_size: LittleEndian::read_u32(&buf[20..24]),
        }
    }

    /// Header for a freshly formatted DevKit drive of the given size.
    pub fn for_size(dev_size: u64) -> DevHeader {
        DevHeader {
            id: DEVKIT_ID,
            p2_start: 0x0063_3000,
            p2_size: (dev_size.saturating_sub(0xC660_0000) >> 9) as u32,
            p1_start: 0x005B_3000,
            p1_size: 0x0008_0000,
        }
    }

    pub fn encode(&self) -> [u8; BLKSIZE as usize] {
        let mut buf = [0u8; BLKSIZE as usize];
        LittleEndian::write_u32(&mut buf[0..4], self.id);
        LittleEndian::write_u32(&mut buf[8..12], self.p2_start);
        LittleEndian::write_u32(&mut buf[12..16], self.p2_size);
        LittleEndian::write_u32(&mut buf[16..20], self.p1_start);
        LittleEndian::write_u32(&mut buf[20..24], self.p1_size);
        buf
    }
}

/// Partition geometry, immutable after detection.
#[derive(Debug, Clone, Default)]
pub struct FatxPar {
    pub par_id: u32,
    pub par_start: u64,
    pub par_size: u64,
    /// Cluster size in bytes, a power of two.
    pub clus_size: u64,
    pub clus_pow: u32,
    /// Number of FAT cells.
    pub clus_num: u32,
    /// Highest valid data cluster.
    pub clus_fat: u32,
    /// FAT cell width: 2 below 0xFFF0 clusters, else 4.
    pub chain_size: u32,
    pub fat_start: u64,
    pub fat_size: u64,
    pub root_start: u64,
    pub root_clus: u32,
}

fn has_fsid(dev: &Device, offset: u64) -> bool {
    dev.read(offset, BLKSIZE as usize).starts_with(FSID)
}

/// Fallback sectors-per-cluster table keyed on partition size, used when
/// the boot sector carries no usable value.
fn spc_for_size(par_size: u64) -> u32 {
    match par_size {
        s if s > 0x2_0000_0000 => 512,
        s if s > 0x1_0000_0000 => 256,
        s if s > 0x8000_0000 => 128,
        s if s > 0x4000_0000 => 64,
        s if s > 0x2000_0000 => 32,
        s if s > 0x1000_0000 => 16,
        s if s > 0x0800_0000 => 8,
        s if s > 0x0100_0000 => 4,
        s if s > 0x0080_0000 => 8,
        s if s > 0x0040_0000 => 4,
        s if s > 0x0020_0000 => 2,
        _ => 1,
    }
}

impl FatxPar {
    /// Probe the device for a FATX partition under the known container
    /// layouts and derive the geometry.
    pub fn detect(dev: &Device, opts: &Options) -> Result<FatxPar> {
        let ts = dev.size();
        if opts.verbose {
            eprintln!("Support size: {ts}.");
        }
        let mut par = FatxPar::default();
        let mut found = false;
        let table = opts.table.as_str();

        if table.is_empty() && opts.offset != 0 && has_fsid(dev, opts.offset) {
            par.par_start = opts.offset;
            par.par_size = ts - opts.offset;
            debug!("found FATX partition at 0x{:016X}", par.par_start);
            found = true;
        }
        if table == "mu"
            || table == "file"
            || (table.is_empty() && !found && has_fsid(dev, 0))
        {
            if ts > 0x7F_F000
                && (table == "mu" || (table.is_empty() && has_fsid(dev, 0x7F_F000)))
            {
                debug!("FATX partition in Memory Unit");
                if opts.partition() == "sc" {
                    par.par_start = 0;
                    par.par_size = 0x7F_F000;
                } else {
                    par.par_start = 0x7F_F000;
                    par.par_size = ts - par.par_start;
                    opts.set_partition("x2");
                }
            } else {
                debug!("FATX partition in partition file");
                par.par_start = 0;
                par.par_size = ts;
            }
            found = true;
        }
        if ts > 0x1_30EB_0000
            && (table == "hd" || (table.is_empty() && !found && has_fsid(dev, 0x1_30EB_0000)))
        {
            debug!("FATX partition in XBox360 HDD");
            if opts.partition() == "sc" && (!table.is_empty() || has_fsid(dev, 0x8_0000)) {
                par.par_start = 0x8_0000;
                par.par_size = 0x8000_0000;
            } else if opts.partition() == "gc"
                && (!table.is_empty() || has_fsid(dev, 0x8008_0000))
            {
                par.par_start = 0x8008_0000;
                par.par_size = 0xA0E3_0000;
            } else if opts.partition() == "x1"
                && (!table.is_empty() || has_fsid(dev, 0x1_20EB_0000))
            {
                par.par_start = 0x1_20EB_0000;
                par.par_size = 0x1000_0000;
            } else {
                par.par_start = 0x1_30EB_0000;
                par.par_size = ts - par.par_start;
                opts.set_partition("x2");
            }
            found = true;
        }
        if ts > 0x2000_0000
            && (table == "usb" || (table.is_empty() && !found && has_fsid(dev, 0x2000_0000)))
        {
            debug!("FATX partition in USB drive");
            if opts.partition() == "sc" && (!table.is_empty() || has_fsid(dev, 0x800_0400)) {
                par.par_start = 0x800_0400;
                par.par_size = 0x480_0000;
            } else {
                par.par_start = 0x2000_0000;
                par.par_size = ts - par.par_start;
                opts.set_partition("x2");
            }
            found = true;
        }
        if table == "kit" || (table.is_empty() && !found) {
            let dh = if table.is_empty() {
                let buf = dev.read(0, BLKSIZE as usize);
                if buf.len() >= 24 {
                    DevHeader::decode(&buf)
                } else {
                    DevHeader::for_size(ts)
                }
            } else {
                DevHeader::for_size(ts)
            };
            if !table.is_empty()
                || (dh.id == DEVKIT_ID && has_fsid(dev, dh.p2_start as u64 * BLKSIZE))
            {
                debug!("FATX partition in DevKit HDD");
                if opts.partition() == "cp"
                    && (!table.is_empty() || has_fsid(dev, dh.p1_start as u64 * BLKSIZE))
                {
                    par.par_start = dh.p1_start as u64 * BLKSIZE;
                    par.par_size = dh.p1_size as u64 * BLKSIZE;
                } else {
                    par.par_start = dh.p2_start as u64 * BLKSIZE;
                    par.par_size = dh.p2_size as u64 * BLKSIZE;
                    opts.set_partition("x2");
                }
                found = true;
            }
        }
        // A forced table skips the boot sector and formats from scratch.
        if !table.is_empty() {
            found = false;
        }
        if !found && opts.mode != Mode::Mkfs && par.par_start == 0 && par.par_size == 0 {
            warn!("no FATX partition found");
            return Err(FatxError::FormatUnrecognized);
        }

        if found {
            if opts.verbose {
                eprintln!("Using \"{}\" partition.", opts.partition());
            }
            let buf = dev.read(par.par_start, BLKSIZE as usize);
            if buf.len() < 16 {
                return Err(FatxError::FormatUnrecognized);
            }
            let bs = BootSect::decode(&buf);
            par.par_id = bs.id;
            par.root_clus = bs.root;
            par.clus_size = BLKSIZE
                * if opts.clus_size != 0 {
                    opts.clus_size as u64
                } else if bs.spc == 0 || bs.spc > 0xFFFF {
                    1
                } else {
                    bs.spc as u64
                };
        } else {
            if par.par_start == 0 {
                par.par_start = opts.offset;
            }
            if par.par_size == 0 {
                par.par_size = ts - par.par_start;
            }
            par.par_id = 0;
            par.root_clus = 1;
            par.clus_size = BLKSIZE
                * if opts.clus_size != 0 {
                    opts.clus_size as u64
                } else {
                    spc_for_size(par.par_size) as u64
                };
        }
        if opts.size != 0 {
            par.par_size = opts.size;
        }
        if !par.clus_size.is_power_of_two() {
            return Err(FatxError::Usage(format!(
                "size of clusters is not a power of 2 ({})",
                par.clus_size
            )));
        }
        par.clus_pow = par.clus_size.trailing_zeros();
        par.clus_num = (par.par_size >> par.clus_pow) as u32;
        par.chain_size = if par.clus_num < 0xFFF0 { 2 } else { 4 };
        par.fat_start = par.par_start + 0x1000;
        par.fat_size = (par.clus_num as u64 * par.chain_size as u64).div_ceil(0x1000) * 0x1000;
        par.root_start = par.fat_start + par.fat_size;
        par.clus_fat =
            (((par.par_size - (par.root_start - par.par_start)) >> par.clus_pow) - 1) as u32;

        if par.root_clus < 1 || par.root_clus > par.clus_fat {
            par.root_clus = 1;
            if opts.mode != Mode::Mkfs {
                warn!("bad root cluster number");
                if opts.mode == Mode::Fsck && opts.ask("Bad root cluster number. Correct it ?", true)
                {
                    par.write(dev, opts)?;
                }
            }
        }
        debug!(
            "PAR size {} CLS size {} ({}) CLS num {} FAT start 0x{:016X} FAT cls {} ROOT 0x{:016X} (0x{:08X})",
            par.par_size,
            par.clus_size,
            par.clus_pow,
            par.clus_num,
            par.fat_start,
            par.clus_fat,
            par.root_start,
            par.root_clus
        );
        Ok(par)
    }

    /// Persist the boot sector (and, for DevKit containers, the device
    /// header).
    pub fn write(&self, dev: &Device, opts: &Options) -> Result<()> {
        if opts.table == "kit" {
            dev.write(0, &DevHeader::for_size(dev.size()).encode())?;
        }
        let bs = BootSect {
            id: self.par_id,
            spc: (self.clus_size / BLKSIZE) as u32,
            root: self.root_clus,
        };
        dev.write(self.par_start, &bs.encode())
    }

    /// Number of clusters needed for `size` bytes.
    pub fn siz2cls(&self, size: u64) -> u32 {
        size.div_ceil(self.clus_size) as u32
    }

    /// Next candidate cluster in a forward scan, wrapping past the end.
    pub fn inccls(&self, p: u32) -> u32 {
        if p <= self.clus_fat {
            p + 1
        } else {
            2
        }
    }

    /// Device byte offset of a data cluster, or 0 with a report when out
    /// of range.
    pub fn cls2ptr(&self, p: u32) -> u64 {
        if p < self.root_clus || p > self.clus_fat {
            warn!("cluster pointer in data out of bounds (0x{p:08X})");
            return 0;
        }
        self.root_start + (p as u64 - 1) * self.clus_size
    }

    /// Data cluster containing a device byte offset.
    pub fn ptr2cls(&self, ptr: u64) -> u32 {
        (((ptr - self.root_start) >> self.clus_pow) + 1) as u32
    }

    /// Device byte offset of a cluster's FAT cell, or 0 with a report
    /// when out of range.
    pub fn cls2fat(&self, p: u32) -> u64 {
        if p < self.root_clus || p > self.clus_fat {
            warn!("cluster pointer in fat out of bounds (0x{p:08X})");
            return 0;
        }
        self.fat_start + p as u64 * self.chain_size as u64
    }
}

/// Render a chain cell value relative to its cluster for dialog text.
pub fn clsprint(v: u32, at: u32) -> String {
    use crate::fat::{EOC, FLK};
    if v == at + 1 {
        "next".into()
    } else if v == FLK {
        "free".into()
    } else if v == EOC {
        "end".into()
    } else {
        format!("0x{v:08X}")
    }
}

/// Encode a volume label as stored in the `name.txt` file: FE FF byte
/// order mark followed by the UTF-16LE code units, capped at the label
/// file size.
pub fn encode_label(label: &str) -> Vec<u8> {
    let mut buf = vec![0xFEu8, 0xFF];
    for u in label.encode_utf16() {
        if buf.len() + 2 > SLAB {
            break;
        }
        buf.extend_from_slice(&u.to_le_bytes());
    }
    buf
}

/// Decode a label file payload back into a string.
pub fn decode_label(buf: &[u8]) -> String {
    let mut out = String::new();
    let mut i = 2;
    while i + 1 < buf.len() && i + 1 < SLAB {
        let u = u16::from_le_bytes([buf[i], buf[i + 1]]);
        if u == 0 {
            break;
        }
        out.extend(char::from_u32(u as u32));
        i += 2;
    }
    out
}
