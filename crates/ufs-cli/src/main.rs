#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;
use ufs::{
    ByteBlockDevice, FileByteDevice, FileType, FsGeometry, GeometryConfig, InodeNumber, MountOptions, StatFs,
    Ufs, UfsError,
};

// ── Image plumbing ──────────────────────────────────────────────────────────

/// The geometry of `image` lives next to it as JSON.
fn sidecar(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".geometry.json");
    PathBuf::from(name)
}

fn open_image(image: &Path, read_only: bool) -> Result<Ufs> {
    let geo_path = sidecar(image);
    let text = std::fs::read_to_string(&geo_path)
        .with_context(|| format!("failed to read geometry {}", geo_path.display()))?;
    let geo: FsGeometry = serde_json::from_str(&text).context("parse geometry")?;
    let file = FileByteDevice::open(image).with_context(|| format!("failed to open {}", image.display()))?;
    let read_only = read_only || !file.is_writable();
    let dev = ByteBlockDevice::new(file).context("wrap image as block device")?;
    let opts = MountOptions {
        read_only,
        ..MountOptions::default()
    };
    Ufs::mount(Box::new(dev), geo, opts).with_context(|| format!("failed to mount {}", image.display()))
}

fn close_image(mut ufs: Ufs) -> Result<()> {
    ufs.sync().context("sync image")
}

#[derive(Debug, Serialize)]
struct ListEntry {
    name: String,
    ino: InodeNumber,
    kind: FileType,
    size: u64,
    nlink: u32,
}

// ── Commands ────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

/// Positional arguments of one command, flags removed.
struct Args {
    command: String,
    positional: Vec<String>,
}

impl Args {
    fn get(&self, i: usize, what: &str) -> Result<&str> {
        match self.positional.get(i) {
            Some(value) => Ok(value.as_str()),
            None => bail!("{} requires {what}", self.command),
        }
    }

    fn image(&self) -> Result<&Path> {
        self.get(0, "<image-path>").map(Path::new)
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();
    let json = rest.iter().any(|a| a == "--json");
    let a = Args {
        command: command.clone(),
        positional: rest.iter().filter(|a| !a.starts_with("--")).cloned().collect(),
    };

    match command.as_str() {
        "format" => format_cmd(a.image()?, a.get(1, "<size-bytes>")?, &rest),
        "statfs" => statfs_cmd(a.image()?, json),
        "ls" => ls_cmd(a.image()?, a.positional.get(1).map_or("/", String::as_str), json),
        "cat" => cat_cmd(a.image()?, a.get(1, "<path>")?),
        "put" => put_cmd(a.image()?, Path::new(a.get(1, "<host-file>")?), a.get(2, "<path>")?),
        "mkdir" => {
            let path = a.get(1, "<path>")?;
            edit(a.image()?, |ufs| {
                ufs.mkdir(path, 0o755)?;
                Ok(())
            })
        }
        "rm" => {
            let path = a.get(1, "<path>")?;
            edit(a.image()?, |ufs| {
                let ino = ufs.resolve(path, false)?;
                if ufs.getattr(ino)?.kind == FileType::Directory {
                    ufs.rmdir(path)?;
                } else {
                    ufs.unlink(path)?;
                }
                Ok(())
            })
        }
        "mv" => {
            let (from, to) = (a.get(1, "<from>")?, a.get(2, "<to>")?);
            edit(a.image()?, |ufs| {
                ufs.rename(from, to)?;
                Ok(())
            })
        }
        "symlink" => {
            let (target, path) = (a.get(1, "<target>")?, a.get(2, "<path>")?);
            edit(a.image()?, |ufs| {
                ufs.symlink(target.as_bytes(), path)?;
                Ok(())
            })
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("ufs-cli\n");
    println!("USAGE:");
    println!("  ufs-cli format <image-path> <size-bytes> [--bsize=N] [--fsize=N] [--fpg=N] [--ipg=N]");
    println!("  ufs-cli statfs <image-path> [--json]");
    println!("  ufs-cli ls <image-path> [path] [--json]");
    println!("  ufs-cli cat <image-path> <path>");
    println!("  ufs-cli put <image-path> <host-file> <path>");
    println!("  ufs-cli mkdir <image-path> <path>");
    println!("  ufs-cli rm <image-path> <path>");
    println!("  ufs-cli mv <image-path> <from> <to>");
    println!("  ufs-cli symlink <image-path> <target> <path>");
    println!("\nSet RUST_LOG (e.g. RUST_LOG=ufs_alloc=trace) for engine events.");
}

/// Value of a `--name=N` flag, if present.
fn flag(rest: &[String], name: &str) -> Result<Option<u32>> {
    let prefix = format!("--{name}=");
    rest.iter()
        .find_map(|a| a.strip_prefix(&prefix))
        .map(|v| v.parse().with_context(|| format!("--{name} expects a number, got {v:?}")))
        .transpose()
}

fn format_cmd(image: &Path, size: &str, rest: &[String]) -> Result<()> {
    let bytes: u64 = size.parse().with_context(|| format!("invalid size {size:?}"))?;
    let mut cfg = GeometryConfig::default();
    if let Some(v) = flag(rest, "bsize")? {
        cfg.bsize = v;
    }
    if let Some(v) = flag(rest, "fsize")? {
        cfg.fsize = v;
    }
    if let Some(v) = flag(rest, "fpg")? {
        cfg.fpg = v;
    }
    if let Some(v) = flag(rest, "ipg")? {
        cfg.ipg = v;
    }
    let file = FileByteDevice::create(image, bytes).with_context(|| format!("failed to create {}", image.display()))?;
    let dev = ByteBlockDevice::new(file).context("wrap image as block device")?;
    let ufs = ufs::format(Box::new(dev), &cfg, MountOptions::default()).context("format image")?;
    let geo = ufs.geometry().clone();
    close_image(ufs)?;

    let geo_path = sidecar(image);
    let text = serde_json::to_string_pretty(&geo).context("serialize geometry")?;
    std::fs::write(&geo_path, text).with_context(|| format!("failed to write {}", geo_path.display()))?;
    info!(image = %image.display(), ncg = geo.ncg, "image_formatted");
    println!(
        "formatted {}: {} groups, bsize={} fsize={}, geometry in {}",
        image.display(),
        geo.ncg,
        geo.bsize,
        geo.fsize,
        geo_path.display()
    );
    Ok(())
}

fn statfs_cmd(image: &Path, json: bool) -> Result<()> {
    let ufs = open_image(image, true)?;
    let st: StatFs = ufs.statfs();
    if json {
        println!("{}", serde_json::to_string_pretty(&st).context("serialize output")?);
    } else {
        println!("bsize: {}", st.bsize);
        println!("frsize: {}", st.frsize);
        println!("blocks: {}", st.blocks);
        println!("bfree: {}", st.bfree);
        println!("bavail: {}", st.bavail);
        println!("files: {}", st.files);
        println!("ffree: {}", st.ffree);
    }
    Ok(())
}

fn ls_cmd(image: &Path, path: &str, json: bool) -> Result<()> {
    let mut ufs = open_image(image, true)?;
    let dir = ufs.resolve(path, true).with_context(|| format!("resolve {path}"))?;
    let mut listing = Vec::new();
    for entry in ufs.read_dir(dir, 0)? {
        let attr = ufs.getattr(entry.ino)?;
        listing.push(ListEntry {
            name: entry.name_str(),
            ino: entry.ino,
            kind: entry.kind,
            size: attr.size,
            nlink: attr.nlink,
        });
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&listing).context("serialize output")?);
    } else {
        for e in &listing {
            println!("{:>8} {:<12} {:>3} {:>10} {}", e.ino.0, format!("{:?}", e.kind), e.nlink, e.size, e.name);
        }
    }
    Ok(())
}

fn cat_cmd(image: &Path, path: &str) -> Result<()> {
    let mut ufs = open_image(image, true)?;
    let ino = ufs.resolve(path, true).with_context(|| format!("resolve {path}"))?;
    let size = ufs.getattr(ino)?.size;
    let mut out = std::io::stdout().lock();
    let mut offset = 0;
    while offset < size {
        let chunk = ufs.read(ino, offset, 1 << 20)?;
        if chunk.is_empty() {
            break;
        }
        out.write_all(&chunk).context("write stdout")?;
        offset += chunk.len() as u64;
    }
    Ok(())
}

fn put_cmd(image: &Path, host: &Path, path: &str) -> Result<()> {
    let data = std::fs::read(host).with_context(|| format!("failed to read {}", host.display()))?;
    edit(image, |ufs| {
        let ino = match ufs.resolve(path, true) {
            Ok(ino) => {
                ufs.set_size(ino, 0)?;
                ino
            }
            Err(UfsError::NotFound(_)) => ufs.create(path, 0o644, 0)?.ino,
            Err(e) => return Err(e.into()),
        };
        ufs.write(ino, 0, &data)?;
        Ok(())
    })
}

/// Mount `image` writable, apply `op`, and flush.
fn edit(image: &Path, op: impl FnOnce(&mut Ufs) -> Result<()>) -> Result<()> {
    let mut ufs = open_image(image, false)?;
    op(&mut ufs)?;
    close_image(ufs)
}
