//! CPIO (newc) archive construction
//!
//! The boot loader hands the kernel a newc-format CPIO archive as its
//! initial root filesystem. `CpioWriter` emits the raw format;
//! `pack_tar` converts a tar stream produced by an image build into it,
//! preserving hard-link groups across two passes.

use crate::error::{KilnError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// newc header magic
pub const MAGIC_NEWC: &str = "070701";

/// Name of the terminating entry
pub const TRAILER: &str = "TRAILER!!!";

/// Directory file-type bits
pub const MODE_DIR: u32 = 0o040000;
/// Regular-file file-type bits
pub const MODE_REG: u32 = 0o100000;
/// Symlink file-type bits
pub const MODE_SYMLINK: u32 = 0o120000;

/// A single newc entry header
#[derive(Debug, Clone, Default)]
pub struct CpioHeader {
    /// Entry name, relative (`./usr/bin/app`)
    pub name: String,
    /// Inode number; shared across a hard-link group
    pub inode: u32,
    /// File type and permission bits
    pub mode: u32,
    /// Owner
    pub uid: u32,
    /// Group
    pub gid: u32,
    /// Link count; > 1 marks a hard-link group
    pub nlink: u32,
    /// Modification time in seconds since the epoch
    pub mtime: u64,
    /// Data size in bytes
    pub file_size: u32,
}

/// Writer for newc-format CPIO streams
pub struct CpioWriter<W: Write> {
    inner: W,
    finished: bool,
}

impl<W: Write> CpioWriter<W> {
    /// Create a writer over any byte sink
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            finished: false,
        }
    }

    /// Write one entry, header and data
    pub fn write_entry(&mut self, header: &CpioHeader, data: &[u8]) -> Result<()> {
        self.write_header(header)?;
        self.inner.write_all(data)?;
        self.pad(data.len())?;
        Ok(())
    }

    fn write_header(&mut self, header: &CpioHeader) -> Result<()> {
        let name_size = header.name.len() + 1;

        let mut buf = String::with_capacity(110 + name_size);
        buf.push_str(MAGIC_NEWC);
        for field in [
            header.inode,
            header.mode,
            header.uid,
            header.gid,
            header.nlink.max(1),
            header.mtime as u32,
            header.file_size,
            0, // devmajor
            0, // devminor
            0, // rdevmajor
            0, // rdevminor
            name_size as u32,
            0, // check, always zero for newc
        ] {
            buf.push_str(&format!("{:08x}", field));
        }

        self.inner.write_all(buf.as_bytes())?;
        self.inner.write_all(header.name.as_bytes())?;
        self.inner.write_all(&[0])?;

        // Header plus name is padded to a four-byte boundary.
        self.pad(110 + name_size)?;
        Ok(())
    }

    fn pad(&mut self, written: usize) -> Result<()> {
        let rem = written % 4;
        if rem != 0 {
            self.inner.write_all(&[0u8; 4][..4 - rem])?;
        }
        Ok(())
    }

    /// Write the trailer entry and flush
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }

        self.write_entry(
            &CpioHeader {
                name: TRAILER.to_string(),
                nlink: 1,
                ..Default::default()
            },
            &[],
        )?;
        self.inner.flush()?;
        self.finished = true;
        Ok(())
    }

    /// Consume the writer and return the underlying sink
    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[derive(Debug, Clone, Copy)]
struct InodeCount {
    count: u32,
    inode: u32,
}

/// Convert a tar stream into a newc CPIO stream.
///
/// Two passes over the tar: the first counts hard-link groups and gives
/// each a random 31-bit inode, the second rewinds and converts entries.
/// Block and character devices and FIFOs are dropped with a warning.
pub fn pack_tar<R, W>(mut tar: R, out: &mut CpioWriter<W>) -> Result<()>
where
    R: Read + Seek,
    W: Write,
{
    let mut rng = rand::thread_rng();
    let mut groups: HashMap<String, InodeCount> = HashMap::new();

    // Pass one: count hard-link groups.
    {
        let mut archive = tar::Archive::new(&mut tar);
        for entry in archive
            .entries()
            .map_err(|e| KilnError::MalformedTar(e.to_string()))?
        {
            let entry = entry.map_err(|e| KilnError::MalformedTar(e.to_string()))?;
            let header = entry.header();

            let target = match header.entry_type() {
                tar::EntryType::Link => header
                    .link_name()
                    .map_err(|e| KilnError::MalformedTar(e.to_string()))?
                    .map(|p| p.to_string_lossy().to_string()),
                tar::EntryType::Regular => entry
                    .path()
                    .ok()
                    .map(|p| p.to_string_lossy().to_string()),
                _ => None,
            };

            if let Some(target) = target {
                let inode = rng.gen_range(0..=i32::MAX as u32);
                groups
                    .entry(target)
                    .and_modify(|g| g.count += 1)
                    .or_insert(InodeCount { count: 1, inode });
            }
        }
    }

    tar.seek(SeekFrom::Start(0))?;

    // Pass two: convert entries.
    let mut rng = rand::thread_rng();
    let mut archive = tar::Archive::new(&mut tar);
    for entry in archive
        .entries()
        .map_err(|e| KilnError::MalformedTar(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| KilnError::MalformedTar(e.to_string()))?;

        let name = entry
            .path()
            .map_err(|e| KilnError::MalformedTar(e.to_string()))?
            .to_string_lossy()
            .to_string();
        let internal = format!("./{}", clean_path(&name));

        let perm = entry
            .header()
            .mode()
            .map_err(|e| KilnError::MalformedTar(e.to_string()))?
            & 0o7777;
        let mtime = entry.header().mtime().unwrap_or(0);

        let mut header = CpioHeader {
            name: internal.clone(),
            inode: rng.gen_range(0..=i32::MAX as u32),
            mode: perm,
            uid: 0,
            gid: 0,
            nlink: 1,
            mtime,
            file_size: 0,
        };

        match entry.header().entry_type() {
            tar::EntryType::Block => {
                tracing::warn!(file = %name, "ignoring block device");
                continue;
            }
            tar::EntryType::Char => {
                tracing::warn!(file = %name, "ignoring char device");
                continue;
            }
            tar::EntryType::Fifo => {
                tracing::warn!(file = %name, "ignoring fifo");
                continue;
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| KilnError::MalformedTar(e.to_string()))?
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();

                tracing::trace!(src = %name, link = %target, "symlinking");

                header.mode |= MODE_SYMLINK;
                header.file_size = target.len() as u32;
                out.write_entry(&header, target.as_bytes())?;
            }
            tar::EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(|e| KilnError::MalformedTar(e.to_string()))?
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();

                tracing::trace!(src = %name, link = %target, "hardlinking");

                header.mode |= MODE_REG;
                if let Some(group) = groups.get(&target) {
                    header.nlink = group.count;
                    header.inode = group.inode;
                }
                out.write_entry(&header, &[])?;
            }
            tar::EntryType::Regular => {
                tracing::trace!(src = %name, dst = %internal, "copying");

                header.mode |= MODE_REG;
                if let Some(group) = groups.get(&name) {
                    header.nlink = group.count;
                    header.inode = group.inode;
                }

                let mut data = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut data)
                    .map_err(|e| KilnError::MalformedTar(e.to_string()))?;
                header.file_size = data.len() as u32;

                out.write_entry(&header, &data)?;
            }
            tar::EntryType::Directory => {
                tracing::trace!(dst = %internal, "mkdir");

                header.mode |= MODE_DIR;
                out.write_entry(&header, &[])?;
            }
            other => {
                tracing::warn!(file = %name, kind = ?other, "unsupported file type");
            }
        }
    }

    out.finish()
}

/// Compress a finished archive in place with gzip
pub fn compress_in_place(path: &Path) -> Result<()> {
    let raw = std::fs::read(path)?;

    let file = std::fs::File::create(path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&raw)?;
    encoder.finish()?;

    Ok(())
}

/// Normalize a tar entry name: strip leading `./` and `/`, drop trailing
/// slashes, collapse `.` components.
fn clean_path(name: &str) -> String {
    let mut parts = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Minimal newc parser for assertions
    struct ParsedEntry {
        name: String,
        inode: u32,
        mode: u32,
        nlink: u32,
        data: Vec<u8>,
    }

    fn parse_cpio(bytes: &[u8]) -> Vec<ParsedEntry> {
        let mut entries = Vec::new();
        let mut off = 0;

        loop {
            let header = &bytes[off..off + 110];
            assert_eq!(&header[..6], MAGIC_NEWC.as_bytes());

            let field = |i: usize| -> u32 {
                let s = std::str::from_utf8(&header[6 + i * 8..6 + (i + 1) * 8]).unwrap();
                u32::from_str_radix(s, 16).unwrap()
            };

            let inode = field(0);
            let mode = field(1);
            let nlink = field(4);
            let file_size = field(6) as usize;
            let name_size = field(11) as usize;

            let name_start = off + 110;
            let name =
                String::from_utf8(bytes[name_start..name_start + name_size - 1].to_vec()).unwrap();

            let mut data_start = name_start + name_size;
            data_start += (4 - (110 + name_size) % 4) % 4;

            if name == TRAILER {
                break;
            }

            let data = bytes[data_start..data_start + file_size].to_vec();
            entries.push(ParsedEntry {
                name,
                inode,
                mode,
                nlink,
                data,
            });

            off = data_start + file_size;
            off += (4 - file_size % 4) % 4;
        }

        entries
    }

    fn build_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let mut dir = tar::Header::new_ustar();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_path("bin").unwrap();
        dir.set_mode(0o755);
        dir.set_size(0);
        dir.set_cksum();
        builder.append(&dir, std::io::empty()).unwrap();

        let payload = vec![0xabu8; 1024];
        let mut reg = tar::Header::new_ustar();
        reg.set_entry_type(tar::EntryType::Regular);
        reg.set_path("bin/a").unwrap();
        reg.set_mode(0o644);
        reg.set_size(payload.len() as u64);
        reg.set_cksum();
        builder.append(&reg, payload.as_slice()).unwrap();

        let mut link = tar::Header::new_ustar();
        link.set_entry_type(tar::EntryType::Link);
        link.set_path("bin/b").unwrap();
        link.set_link_name("bin/a").unwrap();
        link.set_mode(0o644);
        link.set_size(0);
        link.set_cksum();
        builder.append(&link, std::io::empty()).unwrap();

        let mut sym = tar::Header::new_ustar();
        sym.set_entry_type(tar::EntryType::Symlink);
        sym.set_path("bin/c").unwrap();
        sym.set_link_name("a").unwrap();
        sym.set_mode(0o777);
        sym.set_size(0);
        sym.set_cksum();
        builder.append(&sym, std::io::empty()).unwrap();

        builder.into_inner().unwrap()
    }

    #[test]
    fn test_pack_preserves_hard_links() {
        let tar_bytes = build_tar();
        let mut writer = CpioWriter::new(Vec::new());
        pack_tar(Cursor::new(tar_bytes), &mut writer).unwrap();

        let out = writer.into_inner();
        let entries = parse_cpio(&out);

        let a = entries.iter().find(|e| e.name == "./bin/a").unwrap();
        let b = entries.iter().find(|e| e.name == "./bin/b").unwrap();

        // The group shares one inode with a link count of two, and the
        // payload appears exactly once.
        assert_eq!(a.inode, b.inode);
        assert_eq!(a.nlink, 2);
        assert_eq!(b.nlink, 2);
        assert_eq!(a.data.len(), 1024);
        assert!(b.data.is_empty());
    }

    #[test]
    fn test_pack_types_and_modes() {
        let tar_bytes = build_tar();
        let mut writer = CpioWriter::new(Vec::new());
        pack_tar(Cursor::new(tar_bytes), &mut writer).unwrap();

        let entries = parse_cpio(&writer.into_inner());

        let dir = entries.iter().find(|e| e.name == "./bin").unwrap();
        assert_eq!(dir.mode & MODE_DIR, MODE_DIR);
        assert_eq!(dir.mode & 0o7777, 0o755);

        let sym = entries.iter().find(|e| e.name == "./bin/c").unwrap();
        assert_eq!(sym.mode & MODE_SYMLINK, MODE_SYMLINK);
        assert_eq!(sym.data, b"a");
    }

    #[test]
    fn test_pack_round_trips_file_bytes() {
        let payload = b"hello unikernel".to_vec();

        let mut builder = tar::Builder::new(Vec::new());
        let mut reg = tar::Header::new_ustar();
        reg.set_entry_type(tar::EntryType::Regular);
        reg.set_path("greeting").unwrap();
        reg.set_mode(0o600);
        reg.set_size(payload.len() as u64);
        reg.set_cksum();
        builder.append(&reg, payload.as_slice()).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let mut writer = CpioWriter::new(Vec::new());
        pack_tar(Cursor::new(tar_bytes), &mut writer).unwrap();

        let entries = parse_cpio(&writer.into_inner());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "./greeting");
        assert_eq!(entries[0].data, payload);
    }

    #[test]
    fn test_devices_are_dropped() {
        let mut builder = tar::Builder::new(Vec::new());

        let mut dev = tar::Header::new_ustar();
        dev.set_entry_type(tar::EntryType::Char);
        dev.set_path("dev/null").unwrap();
        dev.set_mode(0o666);
        dev.set_size(0);
        dev.set_device_major(1).unwrap();
        dev.set_device_minor(3).unwrap();
        dev.set_cksum();
        builder.append(&dev, std::io::empty()).unwrap();

        let tar_bytes = builder.into_inner().unwrap();
        let mut writer = CpioWriter::new(Vec::new());
        pack_tar(Cursor::new(tar_bytes), &mut writer).unwrap();

        let entries = parse_cpio(&writer.into_inner());
        assert!(entries.is_empty());
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("./usr/bin/"), "usr/bin");
        assert_eq!(clean_path("a/./b"), "a/b");
        assert_eq!(clean_path("/etc/passwd"), "etc/passwd");
    }

    #[test]
    fn test_trailer_terminates_archive() {
        let mut writer = CpioWriter::new(Vec::new());
        writer.finish().unwrap();
        let out = writer.into_inner();

        let name_start = 110;
        let name = &out[name_start..name_start + TRAILER.len()];
        assert_eq!(name, TRAILER.as_bytes());
    }

    #[test]
    fn test_compress_in_place() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("initrd");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        compress_in_place(&path).unwrap();

        let compressed = std::fs::read(&path).unwrap();
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        assert!(compressed.len() < 4096);
    }
}
