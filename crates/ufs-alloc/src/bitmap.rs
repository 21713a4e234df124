//! Free-map primitives.
//!
//! The free map has one bit per fragment, set when the fragment is free.
//! A block is `frag` consecutive bits starting at a multiple of `frag`, so
//! for `frag < 8` several blocks share one byte. The pattern tables below
//! classify a byte by the lengths of the free runs it contains.

use ufs_types::MAXFRAG;

// ── Pattern tables ──────────────────────────────────────────────────────────

/// Build a fragment table: for each byte value, bit `len - 1 + (frag % 8)`
/// is set when some `frag`-bit field of the byte contains a maximal free
/// run of exactly `len` fragments.
const fn build_fragtbl(frags: &[u32]) -> [u8; 256] {
    let mut table = [0_u8; 256];
    let mut map = 0;
    while map < 256 {
        let mut entry = 0_u8;
        let mut fi = 0;
        while fi < frags.len() {
            let frag = frags[fi];
            let shift = frag % 8;
            let mut base = 0;
            while base < 8 {
                let mut run = 0;
                let mut bit = base;
                while bit < base + frag {
                    if map & (1 << bit) != 0 {
                        run += 1;
                    } else {
                        if run > 0 {
                            entry |= 1 << (run - 1 + shift);
                        }
                        run = 0;
                    }
                    bit += 1;
                }
                if run > 0 {
                    entry |= 1 << (run - 1 + shift);
                }
                base += frag;
            }
            fi += 1;
        }
        table[map] = entry;
        map += 1;
    }
    table
}

/// Run table for 8 fragments per block.
pub const FRAGTBL8: [u8; 256] = build_fragtbl(&[8]);

/// Combined run table for 1, 2 and 4 fragments per block; the three
/// block sizes use disjoint bit ranges of each entry.
pub const FRAGTBL124: [u8; 256] = build_fragtbl(&[1, 2, 4]);

/// `around[n]`: a window of `n + 2` bits, a run of `n` plus one bit on
/// either side.
pub const AROUND: [u32; 9] = [0x3, 0x7, 0xf, 0x1f, 0x3f, 0x7f, 0xff, 0x1ff, 0x3ff];

/// `inside[n]`: the `n` free bits inside an `around[n]` window.
pub const INSIDE: [u32; 9] = [0x0, 0x2, 0x6, 0xe, 0x1e, 0x3e, 0x7e, 0xfe, 0x1fe];

#[must_use]
pub fn fragtbl(frag: u32) -> &'static [u8; 256] {
    if frag == 8 { &FRAGTBL8 } else { &FRAGTBL124 }
}

// ── Single bits ─────────────────────────────────────────────────────────────

#[must_use]
pub fn isset(map: &[u8], i: u32) -> bool {
    map.get((i / 8) as usize)
        .is_some_and(|byte| byte & (1 << (i % 8)) != 0)
}

pub fn setbit(map: &mut [u8], i: u32) {
    if let Some(byte) = map.get_mut((i / 8) as usize) {
        *byte |= 1 << (i % 8);
    }
}

pub fn clrbit(map: &mut [u8], i: u32) {
    if let Some(byte) = map.get_mut((i / 8) as usize) {
        *byte &= !(1 << (i % 8));
    }
}

// ── Whole blocks ────────────────────────────────────────────────────────────

/// Mask and byte index for block `h` at `frag` fragments per block.
fn block_mask(frag: u32, h: u32) -> (usize, u8) {
    match frag {
        8 => (h as usize, 0xff),
        4 => ((h >> 1) as usize, 0x0f << ((h & 0x1) << 2)),
        2 => ((h >> 2) as usize, 0x03 << ((h & 0x3) << 1)),
        _ => ((h >> 3) as usize, 0x01 << (h & 0x7)),
    }
}

/// Every fragment of block `h` is free.
#[must_use]
pub fn isblock(frag: u32, map: &[u8], h: u32) -> bool {
    let (idx, mask) = block_mask(frag, h);
    map.get(idx).is_some_and(|byte| byte & mask == mask)
}

/// Every fragment of block `h` is in use.
#[must_use]
pub fn isfreeblock(frag: u32, map: &[u8], h: u32) -> bool {
    let (idx, mask) = block_mask(frag, h);
    map.get(idx).is_some_and(|byte| byte & mask == 0)
}

/// Mark every fragment of block `h` in use.
pub fn clrblock(frag: u32, map: &mut [u8], h: u32) {
    let (idx, mask) = block_mask(frag, h);
    if let Some(byte) = map.get_mut(idx) {
        *byte &= !mask;
    }
}

/// Mark every fragment of block `h` free.
pub fn setblock(frag: u32, map: &mut [u8], h: u32) {
    let (idx, mask) = block_mask(frag, h);
    if let Some(byte) = map.get_mut(idx) {
        *byte |= mask;
    }
}

/// The `frag` free bits of the block starting at fragment `loc`.
#[must_use]
pub fn blkmap(frag: u32, map: &[u8], loc: u32) -> u32 {
    let byte = map.get((loc / 8) as usize).copied().unwrap_or(0);
    (u32::from(byte) >> (loc % 8)) & (0xff >> (8 - frag))
}

// ── Scans and histograms ────────────────────────────────────────────────────

/// Index from the end of the first byte whose table entry intersects
/// `mask`: the returned value is `bytes.len() - position`, 0 when none.
#[must_use]
pub fn scanc(bytes: &[u8], table: &[u8; 256], mask: u8) -> usize {
    bytes
        .iter()
        .position(|b| table[usize::from(*b)] & mask != 0)
        .map_or(0, |pos| bytes.len() - pos)
}

/// Add `cnt` to `fraglist[n]` for every maximal free run of `n`
/// fragments in the block map `fragmap`.
pub fn fragacct(frag: u32, fragmap: u32, fraglist: &mut [i32; MAXFRAG], cnt: i32) {
    let inblk = u32::from(fragtbl(frag)[(fragmap & 0xff) as usize]) << 1;
    let fragmap = fragmap << 1;
    for siz in 1..frag {
        if inblk & (1 << (siz + frag % 8)) == 0 {
            continue;
        }
        let mut field = AROUND[siz as usize];
        let mut subfield = INSIDE[siz as usize];
        let mut pos = siz;
        while pos <= frag {
            if fragmap & field == subfield {
                fraglist[siz as usize] += cnt;
                pos += siz;
                field <<= siz;
                subfield <<= siz;
            }
            field <<= 1;
            subfield <<= 1;
            pos += 1;
        }
    }
}
