//! Path resolution.
//!
//! [`namei`] walks a slash-separated path one component at a time through
//! [`lookup`](crate::lookup), expanding symbolic links in place. Inodes are
//! fetched through [`InodeSource`] so a caller holding an inode cache can
//! serve them from memory.

use tracing::trace;
use ufs_block::BlockDevice;
use ufs_bmap::read_run;
use ufs_error::{Result, UfsError};
use ufs_inode::{inline_target, read_dinode};
use ufs_ondisk::{FsGeometry, Ufs2Dinode};
use ufs_types::{BlockNumber, InodeNumber, MAX_SYMLINK_HOPS, MAXNAMLEN};

use crate::lookup;

/// Where [`namei`] gets inodes from.
pub trait InodeSource {
    fn dinode(&mut self, ino: InodeNumber) -> Result<Ufs2Dinode>;
}

/// Reads every inode straight from the inode table.
pub struct DiskInodes<'a> {
    pub dev: &'a dyn BlockDevice,
    pub geo: &'a FsGeometry,
}

impl InodeSource for DiskInodes<'_> {
    fn dinode(&mut self, ino: InodeNumber) -> Result<Ufs2Dinode> {
        read_dinode(self.dev, self.geo, ino)
    }
}

/// Target of symlink `din`: inline in the pointer area when short, else
/// the leading `size` bytes of its first data block.
pub fn read_symlink(dev: &dyn BlockDevice, geo: &FsGeometry, din: &Ufs2Dinode) -> Result<Vec<u8>> {
    if !din.is_symlink() {
        return Err(UfsError::InvalidArgument("not a symbolic link".to_owned()));
    }
    if let Some(target) = inline_target(din) {
        return Ok(target);
    }
    let len = usize::try_from(din.size)
        .ok()
        .filter(|len| *len <= geo.bsize as usize)
        .ok_or_else(|| UfsError::corruption(din.db[0], format!("symlink size {} exceeds a block", din.size)))?;
    let bno = BlockNumber(din.db[0]);
    if bno.is_hole() {
        return Err(UfsError::corruption(0, "block-backed symlink has no data block"));
    }
    // len <= bsize
    #[expect(clippy::cast_possible_truncation)]
    let run = geo.fragroundup(len as u64) as usize;
    let mut data = read_run(dev, geo, bno, run)?;
    data.truncate(len);
    Ok(data)
}

fn skip_slashes(path: &[u8]) -> &[u8] {
    let start = path.iter().position(|b| *b != b'/').unwrap_or(path.len());
    &path[start..]
}

/// Resolve `path` to an inode number.
///
/// Relative paths start at `start`, absolute ones at the root. Symbolic
/// links met before the last component are always followed; the last one
/// only when `follow` is set. A relative link target is resolved against
/// the directory holding the link. More than `MAX_SYMLINK_HOPS` expansions
/// fail with `SymlinkLoop`.
pub fn namei(
    src: &mut dyn InodeSource,
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    start: InodeNumber,
    path: &[u8],
    follow: bool,
) -> Result<InodeNumber> {
    if path.is_empty() {
        return Err(UfsError::NotFound(String::new()));
    }
    let mut rest = path.to_vec();
    let mut dir = start;
    let mut hops = 0;

    loop {
        if rest.first() == Some(&b'/') {
            dir = InodeNumber::ROOT;
        }
        let trimmed = skip_slashes(&rest);
        if trimmed.is_empty() {
            return Ok(dir);
        }
        let end = trimmed.iter().position(|b| *b == b'/').unwrap_or(trimmed.len());
        let (comp, tail) = trimmed.split_at(end);
        let tail = skip_slashes(tail);
        if comp.len() > MAXNAMLEN {
            return Err(UfsError::NameTooLong);
        }

        let dir_din = src.dinode(dir)?;
        if !dir_din.is_dir() {
            return Err(UfsError::NotDirectory);
        }
        let (ino, _) = lookup(dev, geo, &dir_din, comp)?
            .ok_or_else(|| UfsError::NotFound(String::from_utf8_lossy(comp).into_owned()))?;

        let child = src.dinode(ino)?;
        if child.is_symlink() && (follow || !tail.is_empty()) {
            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Err(UfsError::SymlinkLoop);
            }
            let mut expanded = read_symlink(dev, geo, &child)?;
            trace!(ino = ino.0, hops, "namei_follow");
            if !tail.is_empty() {
                expanded.push(b'/');
                expanded.extend_from_slice(tail);
            }
            rest = expanded;
            continue;
        }

        dir = ino;
        rest = tail.to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{MemDev, make_dir, mem_dev, small_geo};
    use crate::{init_dir_block, link};
    use std::collections::HashMap;
    use ufs_bmap::write_run;
    use ufs_inode::{new_dinode, set_inline_target};
    use ufs_types::{FileType, S_IFLNK, S_IFREG};

    /// Inodes held in memory; directory contents still live on the device.
    struct MapInodes(HashMap<InodeNumber, Ufs2Dinode>);

    impl InodeSource for MapInodes {
        fn dinode(&mut self, ino: InodeNumber) -> Result<Ufs2Dinode> {
            self.0
                .get(&ino)
                .cloned()
                .ok_or_else(|| UfsError::NotFound(format!("inode {ino}")))
        }
    }

    fn symlink(target: &[u8]) -> Ufs2Dinode {
        let mut din = new_dinode(S_IFLNK | 0o777, 0, 0, 1);
        din.nlink = 1;
        set_inline_target(&mut din, target).unwrap();
        din
    }

    /// `/` (2) holds `etc` (3, a directory at fragment 1008), `file` (4)
    /// and whatever links the test adds. `/etc` holds `passwd` (6).
    fn tree(dev: &MemDev, geo: &FsGeometry) -> MapInodes {
        let root = make_dir(dev, geo, 1000, 1);
        let etc = make_dir(dev, geo, 1008, 1);
        write_run(dev, geo, BlockNumber(1008), &init_dir_block(InodeNumber(3), InodeNumber::ROOT).unwrap()).unwrap();
        write_run(dev, geo, BlockNumber(1000), &init_dir_block(InodeNumber::ROOT, InodeNumber::ROOT).unwrap())
            .unwrap();
        link(dev, geo, false, &root, b"etc", InodeNumber(3), FileType::Directory).unwrap();
        link(dev, geo, false, &root, b"file", InodeNumber(4), FileType::RegularFile).unwrap();
        link(dev, geo, false, &etc, b"passwd", InodeNumber(6), FileType::RegularFile).unwrap();

        let mut file = new_dinode(S_IFREG | 0o644, 0, 0, 1);
        file.nlink = 1;
        let mut map = HashMap::new();
        map.insert(InodeNumber::ROOT, root);
        map.insert(InodeNumber(3), etc);
        map.insert(InodeNumber(4), file.clone());
        map.insert(InodeNumber(6), file);
        MapInodes(map)
    }

    fn add_link(dev: &MemDev, geo: &FsGeometry, src: &mut MapInodes, dir: InodeNumber, name: &[u8], ino: u64, target: &[u8]) {
        let dir_din = src.0[&dir].clone();
        link(dev, geo, false, &dir_din, name, InodeNumber(ino), FileType::Symlink).unwrap();
        src.0.insert(InodeNumber(ino), symlink(target));
    }

    #[test]
    fn resolves_absolute_and_relative_paths() {
        let geo = small_geo();
        let dev = mem_dev(&geo);
        let mut src = tree(&dev, &geo);
        let root = InodeNumber::ROOT;
        assert_eq!(namei(&mut src, &dev, &geo, root, b"/etc/passwd", true).unwrap(), InodeNumber(6));
        assert_eq!(namei(&mut src, &dev, &geo, InodeNumber(3), b"passwd", true).unwrap(), InodeNumber(6));
        assert_eq!(namei(&mut src, &dev, &geo, InodeNumber(3), b"../file", true).unwrap(), InodeNumber(4));
        assert_eq!(namei(&mut src, &dev, &geo, InodeNumber(3), b"//", true).unwrap(), root);
        assert_eq!(namei(&mut src, &dev, &geo, root, b"etc//./passwd", true).unwrap(), InodeNumber(6));
    }

    #[test]
    fn missing_and_non_directory_components() {
        let geo = small_geo();
        let dev = mem_dev(&geo);
        let mut src = tree(&dev, &geo);
        let root = InodeNumber::ROOT;
        assert!(matches!(
            namei(&mut src, &dev, &geo, root, b"/etc/shadow", true),
            Err(UfsError::NotFound(name)) if name == "shadow"
        ));
        assert!(matches!(
            namei(&mut src, &dev, &geo, root, b"/file/x", true),
            Err(UfsError::NotDirectory)
        ));
        assert!(matches!(namei(&mut src, &dev, &geo, root, b"", true), Err(UfsError::NotFound(_))));
        let long = vec![b'x'; 256];
        assert!(matches!(
            namei(&mut src, &dev, &geo, root, &long, true),
            Err(UfsError::NameTooLong)
        ));
    }

    #[test]
    fn follows_intermediate_links_and_final_only_on_request() {
        let geo = small_geo();
        let dev = mem_dev(&geo);
        let mut src = tree(&dev, &geo);
        let root = InodeNumber::ROOT;
        add_link(&dev, &geo, &mut src, root, b"conf", 10, b"etc");
        add_link(&dev, &geo, &mut src, InodeNumber(3), b"pw", 11, b"../etc/passwd");

        assert_eq!(namei(&mut src, &dev, &geo, root, b"conf/passwd", false).unwrap(), InodeNumber(6));
        assert_eq!(namei(&mut src, &dev, &geo, root, b"conf/pw", true).unwrap(), InodeNumber(6));
        assert_eq!(namei(&mut src, &dev, &geo, root, b"conf/pw", false).unwrap(), InodeNumber(11));
        assert_eq!(namei(&mut src, &dev, &geo, root, b"conf", false).unwrap(), InodeNumber(10));
        assert_eq!(namei(&mut src, &dev, &geo, root, b"conf", true).unwrap(), InodeNumber(3));
    }

    #[test]
    fn five_hops_resolve_and_six_loop() {
        let geo = small_geo();
        let dev = mem_dev(&geo);
        let mut src = tree(&dev, &geo);
        let root = InodeNumber::ROOT;
        // l1 -> l2 -> ... -> l5 -> file
        for i in 1..=5_u64 {
            let target = if i == 5 { b"file".to_vec() } else { format!("l{}", i + 1).into_bytes() };
            add_link(&dev, &geo, &mut src, root, format!("l{i}").as_bytes(), 20 + i, &target);
        }
        assert_eq!(namei(&mut src, &dev, &geo, root, b"l1", true).unwrap(), InodeNumber(4));
        add_link(&dev, &geo, &mut src, root, b"l0", 20, b"l1");
        assert!(matches!(
            namei(&mut src, &dev, &geo, root, b"l0", true),
            Err(UfsError::SymlinkLoop)
        ));

        add_link(&dev, &geo, &mut src, root, b"self", 30, b"/self");
        assert!(matches!(
            namei(&mut src, &dev, &geo, root, b"self/x", false),
            Err(UfsError::SymlinkLoop)
        ));
    }

    #[test]
    fn block_backed_symlink_target() {
        let geo = small_geo();
        let dev = mem_dev(&geo);
        let target = vec![b't'; 300];
        let mut din = new_dinode(S_IFLNK | 0o777, 0, 0, 1);
        din.size = target.len() as u64;
        din.db[0] = 1016;
        din.blocks = 1;
        let mut block = target.clone();
        block.resize(512, 0);
        write_run(&dev, &geo, BlockNumber(1016), &block).unwrap();
        assert_eq!(read_symlink(&dev, &geo, &din).unwrap(), target);

        let inline = symlink(b"short");
        assert_eq!(read_symlink(&dev, &geo, &inline).unwrap(), b"short");
    }
}
