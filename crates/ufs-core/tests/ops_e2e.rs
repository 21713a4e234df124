#![forbid(unsafe_code)]
//! End-to-end file operations on a freshly formatted in-memory image.
//!
//! Every test checks the same bookkeeping after it mutates: no inode
//! reference is left in the cache and the per-group counters still add
//! up to the totals.

use proptest::prelude::*;
use std::time::{Duration, UNIX_EPOCH};
use ufs_block::{ByteBlockDevice, MemByteDevice};
use ufs_core::{InodeAttr, MountOptions, SharedUfs, StatFs, Ufs, format};
use ufs_error::UfsError;
use ufs_ondisk::GeometryConfig;
use ufs_types::{FileType, InodeNumber, S_IFCHR, S_IFDIR, S_IFIFO};

const IMAGE_BYTES: usize = 4 * 2048 * 512;

fn config() -> GeometryConfig {
    GeometryConfig {
        bsize: 4096,
        fsize: 512,
        fpg: 2048,
        ipg: 256,
        ..GeometryConfig::default()
    }
}

fn fresh_with(mem: &MemByteDevice) -> Ufs {
    let dev = ByteBlockDevice::new(mem.clone()).unwrap();
    format(Box::new(dev), &config(), MountOptions::default()).unwrap()
}

fn fresh() -> Ufs {
    fresh_with(&MemByteDevice::new(IMAGE_BYTES))
}

fn settled(ufs: &Ufs) {
    assert!(ufs.vnodes().is_empty(), "leaked references: {}", ufs.vnodes().len());
    assert_eq!(ufs.params().summed(), ufs.params().cstotal);
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ── Regular files ───────────────────────────────────────────────────────────

#[test]
fn write_grow_shrink_and_delete_restore_free_space() {
    let mut ufs = fresh();
    let before: StatFs = ufs.statfs();

    let attr = ufs.create("/data", 0o644, 0).unwrap();
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.nlink, 1);
    let ino = attr.ino;

    let data = pattern(10_000);
    assert_eq!(ufs.write(ino, 0, &data[..1000]).unwrap(), 1000);
    assert_eq!(ufs.getattr(ino).unwrap().blocks, 2);
    // the two-fragment tail becomes a full block as the file grows
    assert_eq!(ufs.write(ino, 1000, &data[1000..]).unwrap(), 9000);
    let attr = ufs.getattr(ino).unwrap();
    assert_eq!(attr.size, 10_000);
    assert_eq!(attr.blocks, 20);
    assert_eq!(ufs.read(ino, 0, 20_000).unwrap(), data);
    assert_eq!(ufs.read(ino, 4000, 200).unwrap(), &data[4000..4200]);
    assert!(ufs.read(ino, 10_000, 10).unwrap().is_empty());
    assert_eq!(ufs.statfs().bfree, before.bfree - 20);
    settled(&ufs);

    ufs.truncate("/data", 100).unwrap();
    assert_eq!(ufs.getattr(ino).unwrap().blocks, 1);
    assert_eq!(ufs.read(ino, 0, 4096).unwrap(), &data[..100]);
    assert_eq!(ufs.statfs().bfree, before.bfree - 1);

    ufs.set_size(ino, 5000).unwrap();
    let grown = ufs.read(ino, 0, 5000).unwrap();
    assert_eq!(&grown[..100], &data[..100]);
    assert!(grown[100..].iter().all(|b| *b == 0));

    ufs.unlink("/data").unwrap();
    assert!(matches!(ufs.getattr(ino), Err(UfsError::NotFound(_))));
    let after = ufs.statfs();
    assert_eq!(after.bfree, before.bfree);
    assert_eq!(after.ffree, before.ffree);
    settled(&ufs);
}

#[test]
fn sparse_write_into_the_indirect_range() {
    let mut ufs = fresh();
    let before = ufs.statfs();
    let ino = ufs.create("sparse", 0o600, 0).unwrap().ino;
    let offset = 20 * 4096;
    ufs.write(ino, offset, b"end").unwrap();
    assert_eq!(ufs.getattr(ino).unwrap().size, offset + 3);
    assert!(ufs.read(ino, 0, 4096).unwrap().iter().all(|b| *b == 0));
    assert_eq!(ufs.read(ino, offset, 16).unwrap(), b"end");
    // one data block plus the single-indirect pointer block
    assert_eq!(ufs.statfs().bfree, before.bfree - 16);

    ufs.unlink("sparse").unwrap();
    assert_eq!(ufs.statfs().bfree, before.bfree);
    settled(&ufs);
}

#[test]
fn regrowing_after_an_indirect_shrink_reads_zeros() {
    let mut ufs = fresh();
    let ino = ufs.create("/big", 0o644, 0).unwrap().ino;
    ufs.write(ino, 0, &vec![0xaa; 20 * 4096]).unwrap();

    let cut = 12 * 4096 + 100;
    ufs.set_size(ino, cut).unwrap();
    ufs.set_size(ino, 13 * 4096).unwrap();
    let tail = ufs.read(ino, cut, 4096).unwrap();
    assert_eq!(tail.len(), 3996);
    assert!(tail.iter().all(|b| *b == 0));
    assert!(ufs.read(ino, 12 * 4096, 100).unwrap().iter().all(|b| *b == 0xaa));

    // a write past the end leaves the same gap zeroed
    ufs.write(ino, 12 * 4096, &[0xbb; 4096]).unwrap();
    ufs.set_size(ino, cut).unwrap();
    ufs.write(ino, 12 * 4096 + 4000, b"z").unwrap();
    let gap = ufs.read(ino, cut, 3900).unwrap();
    assert!(gap.iter().all(|b| *b == 0));
    settled(&ufs);
}

#[test]
fn special_nodes_keep_their_device_number() {
    let mut ufs = fresh();
    let dev = ufs.create("/tty", S_IFCHR | 0o620, 0x0405).unwrap();
    assert_eq!(dev.kind, FileType::CharDevice);
    assert_eq!(dev.rdev, 0x0405);
    assert_eq!(dev.blocks, 0);
    let fifo = ufs.create("/pipe", S_IFIFO | 0o600, 7).unwrap();
    assert_eq!(fifo.kind, FileType::Fifo);
    assert_eq!(fifo.rdev, 0);
    assert!(matches!(ufs.read(dev.ino, 0, 1), Err(UfsError::InvalidArgument(_))));
    assert!(matches!(
        ufs.create("/dir", S_IFDIR | 0o755, 0),
        Err(UfsError::InvalidArgument(_))
    ));

    let before = ufs.statfs();
    ufs.unlink("/tty").unwrap();
    assert_eq!(ufs.statfs().ffree, before.ffree + 1);
    assert_eq!(ufs.statfs().bfree, before.bfree);
    settled(&ufs);
}

// ── Attributes ──────────────────────────────────────────────────────────────

#[test]
fn chmod_replaces_permission_bits_only() {
    let mut ufs = fresh();
    let attr = ufs.create("/f", 0o644, 0).unwrap();
    let changed = ufs.chmod("/f", S_IFDIR | 0o4750).unwrap();
    assert_eq!(changed.kind, FileType::RegularFile);
    assert_eq!(changed.perm, 0o4750);
    assert!(changed.ctime >= attr.ctime);
    assert_eq!(changed.mtime, attr.mtime);

    let stored = ufs.getattr(attr.ino).unwrap();
    assert_eq!(stored.perm, 0o4750);
    assert!(matches!(ufs.chmod("/missing", 0o600), Err(UfsError::NotFound(_))));

    ufs.mkdir("/d", 0o755).unwrap();
    assert_eq!(ufs.chmod("/d", 0o1777).unwrap().kind, FileType::Directory);
    assert_eq!(ufs.getattr(ufs.resolve("/d", true).unwrap()).unwrap().perm, 0o1777);
    settled(&ufs);
}

#[test]
fn utimens_sets_requested_times_and_survives_remount() {
    let mem = MemByteDevice::new(IMAGE_BYTES);
    let mut ufs = fresh_with(&mem);
    let attr = ufs.create("/t", 0o644, 0).unwrap();
    let atime = UNIX_EPOCH + Duration::new(1_000_000, 250);
    let set = ufs.utimens("/t", Some(atime), None).unwrap();
    assert_eq!(set.atime, atime);
    assert_eq!(set.mtime, attr.mtime);

    let mtime = UNIX_EPOCH - Duration::from_secs(86_400);
    let set = ufs.utimens("/t", None, Some(mtime)).unwrap();
    assert_eq!((set.atime, set.mtime), (atime, mtime));
    settled(&ufs);
    ufs.sync().unwrap();
    let geo = ufs.geometry().clone();
    drop(ufs);

    let dev = ByteBlockDevice::new(mem.clone()).unwrap();
    let mut again = Ufs::mount(Box::new(dev), geo, MountOptions::default()).unwrap();
    let stored = again.getattr(attr.ino).unwrap();
    assert_eq!((stored.atime, stored.mtime), (atime, mtime));
    assert_eq!(stored.kind, FileType::RegularFile);
}

// ── Directories ─────────────────────────────────────────────────────────────

#[test]
fn mkdir_and_rmdir_keep_link_counts() {
    let mut ufs = fresh();
    let ndir = ufs.params().cstotal.ndir;
    let d = ufs.mkdir("/d", 0o755).unwrap();
    assert_eq!(d.kind, FileType::Directory);
    assert_eq!(d.nlink, 2);
    assert_eq!(d.size, 512);
    assert_eq!(ufs.getattr(InodeNumber::ROOT).unwrap().nlink, 3);
    let e = ufs.mkdir("/d/e", 0o700).unwrap();
    assert_eq!(ufs.getattr(d.ino).unwrap().nlink, 3);
    assert_eq!(ufs.resolve("/d/e/..", true).unwrap(), d.ino);
    assert_eq!(ufs.lookup(d.ino, "e").unwrap().ino, e.ino);
    assert_eq!(ufs.params().cstotal.ndir, ndir + 2);

    let names: Vec<String> = ufs.read_dir(d.ino, 0).unwrap().iter().map(|x| x.name_str()).collect();
    assert_eq!(names, vec![".", "..", "e"]);

    assert!(matches!(ufs.rmdir("/d"), Err(UfsError::NotEmpty)));
    assert!(matches!(ufs.unlink("/d/e"), Err(UfsError::IsDirectory)));
    ufs.rmdir("/d/e").unwrap();
    assert_eq!(ufs.getattr(d.ino).unwrap().nlink, 2);
    ufs.rmdir("/d").unwrap();
    assert_eq!(ufs.getattr(InodeNumber::ROOT).unwrap().nlink, 2);
    assert_eq!(ufs.params().cstotal.ndir, ndir);
    assert!(matches!(ufs.getattr(d.ino), Err(UfsError::NotFound(_))));
    settled(&ufs);
}

#[test]
fn read_dir_resumes_from_an_entry_offset() {
    let mut ufs = fresh();
    for name in ["a", "b", "c"] {
        ufs.create(name, 0o644, 0).unwrap();
    }
    let all = ufs.read_dir(InodeNumber::ROOT, 0).unwrap();
    assert_eq!(all.len(), 5);
    let rest = ufs.read_dir(InodeNumber::ROOT, all[2].offset).unwrap();
    let names: Vec<String> = rest.iter().map(|x| x.name_str()).collect();
    assert_eq!(names, vec!["b", "c"]);
}

#[test]
fn full_directory_reports_no_space_and_frees_the_new_inode() {
    let mut ufs = fresh();
    let mut created = 0;
    let err = loop {
        match ufs.create(&format!("f{created:03}"), 0o644, 0) {
            Ok(_) => created += 1,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, UfsError::NoSpace));
    // 488 bytes after "." and ".." hold 30 records of 16 bytes
    assert_eq!(created, 30);
    assert_eq!(ufs.statfs().ffree, 4 * 256 - 3 - 30);
    settled(&ufs);
}

// ── Links ───────────────────────────────────────────────────────────────────

#[test]
fn hard_links_share_an_inode_until_the_last_name_goes() {
    let mut ufs = fresh();
    let ino = ufs.create("/one", 0o644, 0).unwrap().ino;
    ufs.write(ino, 0, b"shared").unwrap();
    let attr = ufs.link("/one", "/two").unwrap();
    assert_eq!(attr.ino, ino);
    assert_eq!(attr.nlink, 2);
    assert!(matches!(ufs.link("/one", "/two"), Err(UfsError::Exists)));
    ufs.mkdir("/dir", 0o755).unwrap();
    assert!(matches!(ufs.link("/dir", "/dir2"), Err(UfsError::PermissionDenied)));

    ufs.unlink("/one").unwrap();
    assert_eq!(ufs.getattr(ino).unwrap().nlink, 1);
    let two = ufs.resolve("/two", true).unwrap();
    assert_eq!(ufs.read(two, 0, 64).unwrap(), b"shared");
    ufs.unlink("/two").unwrap();
    assert!(matches!(ufs.getattr(ino), Err(UfsError::NotFound(_))));
    settled(&ufs);
}

#[test]
fn symlinks_inline_and_block_backed() {
    let mut ufs = fresh();
    ufs.mkdir("/etc", 0o755).unwrap();
    let target = ufs.create("/etc/conf", 0o644, 0).unwrap().ino;

    let short = ufs.symlink(b"/etc/conf", "/short").unwrap();
    assert_eq!(short.kind, FileType::Symlink);
    assert_eq!(short.blocks, 0);
    assert_eq!(ufs.readlink("/short").unwrap(), b"/etc/conf");
    assert_eq!(ufs.resolve("/short", true).unwrap(), target);
    assert_eq!(ufs.resolve("/short", false).unwrap(), short.ino);

    // "/etc/./././.../conf", long enough to need a data block
    let long = format!("/etc{}/conf", "/.".repeat(150)).into_bytes();
    let block = ufs.symlink(&long, "/long").unwrap();
    assert_eq!(block.size, long.len() as u64);
    assert_eq!(block.blocks, 1);
    assert_eq!(ufs.readlink("/long").unwrap(), long);
    assert_eq!(ufs.resolve("/long", true).unwrap(), target);

    assert!(matches!(ufs.symlink(&[b'x'; 4097], "/huge"), Err(UfsError::NameTooLong)));
    assert!(matches!(ufs.symlink(b"", "/empty"), Err(UfsError::InvalidArgument(_))));
    assert!(matches!(ufs.readlink("/etc/conf"), Err(UfsError::InvalidArgument(_))));

    let before = ufs.statfs();
    ufs.unlink("/long").unwrap();
    assert_eq!(ufs.statfs().bfree, before.bfree + 1);
    settled(&ufs);
}

#[test]
fn symlink_cycles_are_cut_off() {
    let mut ufs = fresh();
    ufs.symlink(b"b", "/a").unwrap();
    ufs.symlink(b"a", "/b").unwrap();
    assert!(matches!(ufs.resolve("/a", true), Err(UfsError::SymlinkLoop)));
    assert_eq!(UfsError::SymlinkLoop.to_errno(), libc::ELOOP);
}

// ── Rename ──────────────────────────────────────────────────────────────────

#[test]
fn rename_within_a_directory_and_over_a_file() {
    let mut ufs = fresh();
    let a = ufs.create("/a", 0o644, 0).unwrap().ino;
    ufs.rename("/a", "/b").unwrap();
    assert!(matches!(ufs.resolve("/a", true), Err(UfsError::NotFound(_))));
    assert_eq!(ufs.resolve("/b", true).unwrap(), a);

    let c = ufs.create("/c", 0o644, 0).unwrap().ino;
    ufs.write(c, 0, b"old").unwrap();
    let before = ufs.statfs();
    ufs.rename("/b", "/c").unwrap();
    assert_eq!(ufs.resolve("/c", true).unwrap(), a);
    assert!(matches!(ufs.getattr(c), Err(UfsError::NotFound(_))));
    assert_eq!(ufs.statfs().ffree, before.ffree + 1);
    assert_eq!(ufs.statfs().bfree, before.bfree + 1);

    // same inode on both sides is a no-op
    ufs.link("/c", "/d").unwrap();
    ufs.rename("/c", "/d").unwrap();
    assert_eq!(ufs.getattr(a).unwrap().nlink, 2);
    settled(&ufs);
}

#[test]
fn rename_directory_across_parents_repoints_dotdot() {
    let mut ufs = fresh();
    let p = ufs.mkdir("/p", 0o755).unwrap().ino;
    let q = ufs.mkdir("/q", 0o755).unwrap().ino;
    let sub = ufs.mkdir("/p/sub", 0o755).unwrap().ino;
    ufs.rename("/p/sub", "/q/sub").unwrap();
    assert_eq!(ufs.resolve("/q/sub", true).unwrap(), sub);
    assert_eq!(ufs.resolve("/q/sub/..", true).unwrap(), q);
    assert_eq!(ufs.getattr(p).unwrap().nlink, 2);
    assert_eq!(ufs.getattr(q).unwrap().nlink, 3);

    assert!(matches!(ufs.rename("/q", "/q/sub/inner"), Err(UfsError::InvalidArgument(_))));

    // replacing an empty directory leaves the parent count unchanged
    ufs.mkdir("/m", 0o755).unwrap();
    ufs.rename("/m", "/q/sub").unwrap();
    assert!(matches!(ufs.getattr(sub), Err(UfsError::NotFound(_))));
    assert_eq!(ufs.getattr(q).unwrap().nlink, 3);
    assert_eq!(ufs.getattr(InodeNumber::ROOT).unwrap().nlink, 4);
    settled(&ufs);
}

#[test]
fn rename_type_mismatches_and_busy_targets() {
    let mut ufs = fresh();
    ufs.create("/f", 0o644, 0).unwrap();
    ufs.mkdir("/e", 0o755).unwrap();
    ufs.mkdir("/n", 0o755).unwrap();
    ufs.create("/n/inner", 0o644, 0).unwrap();
    assert!(matches!(ufs.rename("/f", "/e"), Err(UfsError::IsDirectory)));
    assert!(matches!(ufs.rename("/e", "/f"), Err(UfsError::NotDirectory)));
    assert!(matches!(ufs.rename("/e", "/n"), Err(UfsError::NotEmpty)));
    assert!(matches!(ufs.rename("/missing", "/x"), Err(UfsError::NotFound(_))));
    assert!(matches!(ufs.rename("/f", "/.."), Err(UfsError::InvalidArgument(_))));
    settled(&ufs);
}

// ── Errors and mount state ──────────────────────────────────────────────────

#[test]
fn namespace_errors_map_to_errno() {
    let mut ufs = fresh();
    ufs.create("/x", 0o644, 0).unwrap();
    let exists = ufs.create("/x", 0o644, 0).unwrap_err();
    assert_eq!(exists.to_errno(), libc::EEXIST);
    let missing = ufs.lookup(InodeNumber::ROOT, "nope").unwrap_err();
    assert_eq!(missing.to_errno(), libc::ENOENT);
    let long = ufs.mkdir(&"n".repeat(256), 0o755).unwrap_err();
    assert_eq!(long.to_errno(), libc::ENAMETOOLONG);
    let not_dir = ufs.create("/x/y", 0o644, 0).unwrap_err();
    assert_eq!(not_dir.to_errno(), libc::ENOTDIR);
    let is_dir = ufs.read(InodeNumber::ROOT, 0, 1).unwrap_err();
    assert_eq!(is_dir.to_errno(), libc::EISDIR);
    assert!(matches!(ufs.rmdir("/x"), Err(UfsError::NotDirectory)));
    assert!(matches!(ufs.rmdir("/"), Err(UfsError::InvalidArgument(_))));
    settled(&ufs);
}

#[test]
fn contents_survive_a_remount() {
    let mem = MemByteDevice::new(IMAGE_BYTES);
    let mut ufs = fresh_with(&mem);
    ufs.mkdir("/keep", 0o755).unwrap();
    let ino = ufs.create("/keep/file", 0o644, 0).unwrap().ino;
    let data = pattern(6000);
    ufs.write(ino, 0, &data).unwrap();
    ufs.sync().unwrap();
    let geo = ufs.geometry().clone();
    let totals = ufs.params().cstotal;
    drop(ufs);

    let dev = ByteBlockDevice::new(mem.clone()).unwrap();
    let mut again = Ufs::mount(Box::new(dev), geo, MountOptions::default()).unwrap();
    assert_eq!(again.params().cstotal, totals);
    let found = again.resolve("/keep/file", true).unwrap();
    assert_eq!(found, ino);
    assert_eq!(again.read(found, 0, 8192).unwrap(), data);
}

#[test]
fn read_only_mount_rejects_mutation() {
    let mem = MemByteDevice::new(IMAGE_BYTES);
    let mut ufs = fresh_with(&mem);
    let ino = ufs.create("/r", 0o644, 0).unwrap().ino;
    ufs.write(ino, 0, b"ro").unwrap();
    let geo = ufs.geometry().clone();
    drop(ufs);

    let dev = ByteBlockDevice::new(mem.clone()).unwrap();
    let opts = MountOptions {
        read_only: true,
        ..MountOptions::default()
    };
    let mut ro = Ufs::mount(Box::new(dev), geo, opts).unwrap();
    assert!(ro.is_read_only());
    assert_eq!(ro.read(ino, 0, 2).unwrap(), b"ro");
    assert!(matches!(ro.create("/w", 0o644, 0), Err(UfsError::ReadOnly)));
    assert!(matches!(ro.write(ino, 0, b"x"), Err(UfsError::ReadOnly)));
    assert!(matches!(ro.rename("/r", "/s"), Err(UfsError::ReadOnly)));
    assert!(matches!(ro.chmod("/r", 0o600), Err(UfsError::ReadOnly)));
    assert!(matches!(ro.utimens("/r", Some(UNIX_EPOCH), None), Err(UfsError::ReadOnly)));
    assert_eq!(UfsError::ReadOnly.to_errno(), libc::EROFS);
    ro.sync().unwrap();
    settled(&ro);
}

#[test]
fn mount_options_default_to_a_writable_root_mount() {
    let opts: MountOptions = serde_json::from_str("{}").unwrap();
    assert_eq!(opts, MountOptions::default());
    assert!(!opts.read_only);
    assert_eq!((opts.uid, opts.gid, opts.fsid), (0, 0, 0));
}

#[test]
fn attributes_serialize_as_json() {
    let mut ufs = fresh();
    let attr = ufs.create("/j", 0o640, 0).unwrap();
    let json = serde_json::to_string(&attr).unwrap();
    let back: InodeAttr = serde_json::from_str(&json).unwrap();
    assert_eq!(back, attr);
    assert_eq!(back.perm, 0o640);

    let stat = ufs.statfs();
    let value = serde_json::to_value(stat).unwrap();
    assert_eq!(value["namemax"], 255);
    assert_eq!(value["files"], 4 * 256 - 2);
}

// ── Shared access ───────────────────────────────────────────────────────────

#[test]
fn threads_share_one_filesystem() {
    let shared = SharedUfs::new(fresh());
    for t in 0..4 {
        shared.with(|ufs| ufs.mkdir(&format!("/t{t}"), 0o755)).unwrap();
    }
    std::thread::scope(|scope| {
        for t in 0..4_u8 {
            let shared = shared.clone();
            scope.spawn(move || {
                for f in 0..5_u8 {
                    let path = format!("/t{t}/f{f}");
                    shared
                        .with(|ufs| {
                            let ino = ufs.create(&path, 0o644, 0)?.ino;
                            ufs.write(ino, 0, &[t, f])
                        })
                        .unwrap();
                }
            });
        }
    });

    let mut ufs = shared.lock();
    for t in 0..4_u8 {
        for f in 0..5_u8 {
            let ino = ufs.resolve(&format!("/t{t}/f{f}"), true).unwrap();
            assert_eq!(ufs.read(ino, 0, 8).unwrap(), [t, f]);
        }
    }
    assert_eq!(ufs.statfs().ffree, 4 * 256 - 3 - 4 - 20);
    settled(&ufs);
}

// ── Contents model ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum FileOp {
    Write { offset: u64, len: usize, byte: u8 },
    Resize(u64),
}

/// Offsets reach past the direct blocks into the single-indirect range.
fn file_op() -> impl Strategy<Value = FileOp> {
    let span = 20 * 4096_u64;
    prop_oneof![
        (0..span, 1_usize..6000, any::<u8>()).prop_map(|(offset, len, byte)| FileOp::Write { offset, len, byte }),
        (0..span).prop_map(FileOp::Resize),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn file_contents_follow_a_byte_model(ops in proptest::collection::vec(file_op(), 1..12)) {
        let mut ufs = fresh();
        let before = ufs.statfs();
        let ino = ufs.create("/model", 0o644, 0).unwrap().ino;
        let mut model: Vec<u8> = Vec::new();
        for op in &ops {
            match *op {
                FileOp::Write { offset, len, byte } => {
                    prop_assert_eq!(ufs.write(ino, offset, &vec![byte; len]).unwrap(), len);
                    let start = offset as usize;
                    if model.len() < start + len {
                        model.resize(start + len, 0);
                    }
                    model[start..start + len].fill(byte);
                }
                FileOp::Resize(size) => {
                    ufs.set_size(ino, size).unwrap();
                    model.resize(size as usize, 0);
                }
            }
            prop_assert_eq!(ufs.getattr(ino).unwrap().size, model.len() as u64);
        }
        let data = ufs.read(ino, 0, model.len() as u32 + 1).unwrap();
        prop_assert!(data == model, "contents diverge from the model after {:?}", ops);

        ufs.unlink("/model").unwrap();
        let after = ufs.statfs();
        prop_assert_eq!(after.bfree, before.bfree);
        prop_assert_eq!(after.ffree, before.ffree);
        settled(&ufs);
    }
}
