//! Virtual memory hole finding
//!
//! Segments must map at the same address in every process, so the owner
//! picks an address inside a gap of its own address space that other
//! processes of the job are likely to have free as well. The gaps come
//! from `/proc/self/maps`.

use gds_common::{Error, Result, VmHoleKind};
use std::path::Path;
use tracing::debug;

const MAPS_PATH: &str = "/proc/self/maps";
const ALIGN_64MB: usize = 64 * 1024 * 1024;
const ALIGN_2MB: usize = 2 * 1024 * 1024;

/// What occupies a mapped range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapKind {
    Anonymous,
    File,
    Heap,
    Stack,
    Other,
}

/// One line of the maps file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub start: usize,
    pub end: usize,
    pub kind: MapKind,
}

/// Check whether this platform exposes the mapping table
#[must_use]
pub fn available() -> bool {
    Path::new(MAPS_PATH).exists()
}

/// Parse the text of a maps file; unparsable lines are skipped
#[must_use]
pub fn parse_maps(text: &str) -> Vec<MapEntry> {
    text.lines()
        .filter_map(|line| {
            let range = line.split_whitespace().next()?;
            let (start, end) = range.split_once('-')?;
            let start = usize::from_str_radix(start, 16).ok()?;
            let end = usize::from_str_radix(end, 16).ok()?;
            let kind = if line.contains('/') {
                MapKind::File
            } else if line.contains("[heap]") {
                MapKind::Heap
            } else if line.contains("[stack]") {
                MapKind::Stack
            } else if line.contains('[') {
                MapKind::Other
            } else {
                MapKind::Anonymous
            };
            Some(MapEntry { start, end, kind })
        })
        .collect()
}

/// Read the mapping table of this process
pub fn read_maps() -> Result<Vec<MapEntry>> {
    let text = std::fs::read_to_string(MAPS_PATH)?;
    Ok(parse_maps(&text))
}

/// Pick an address for `size` bytes inside the hole `[begin, begin + len)`
///
/// The middle of the hole is preferred, aligned to 64 MiB and then 2 MiB;
/// otherwise the end of the hole is used.
pub fn use_hole(begin: usize, len: usize, size: usize) -> Result<usize> {
    if len < size {
        return Err(Error::segment(format!(
            "hole of {len} bytes cannot hold {size} bytes"
        )));
    }
    let end = begin + len;
    let middle = begin + len / 2;
    for align in [ALIGN_64MB, ALIGN_2MB] {
        let aligned = (middle + align) & !(align - 1);
        if aligned.checked_add(size).is_some_and(|e| e <= end) {
            return Ok(aligned);
        }
    }
    Ok(end - size)
}

/// Locate a free address range of at least `size` bytes
///
/// Returns `Ok(None)` for [`VmHoleKind::None`], leaving placement to the
/// kernel.
pub fn find_hole(kind: VmHoleKind, maps: &[MapEntry], size: usize) -> Result<Option<usize>> {
    if kind == VmHoleKind::None {
        return Ok(None);
    }
    let mut prev_end = 0usize;
    let mut prev_kind = MapKind::File;
    let mut in_libs = false;
    let mut biggest: Option<(usize, usize)> = None;

    for entry in maps {
        let gap = entry.start.saturating_sub(prev_end);
        match kind {
            VmHoleKind::Begin => return use_hole(0, entry.start, size).map(Some),
            VmHoleKind::Heap => {
                if prev_kind == MapKind::Heap && entry.kind != MapKind::Heap {
                    return use_hole(prev_end, gap, size).map(Some);
                }
            }
            VmHoleKind::Stack => {
                if entry.kind == MapKind::Stack {
                    return use_hole(prev_end, gap, size).map(Some);
                }
            }
            VmHoleKind::Libs | VmHoleKind::Biggest => {
                if prev_kind == MapKind::Heap {
                    in_libs = true;
                }
                if entry.kind == MapKind::Stack {
                    in_libs = false;
                }
                let counts = kind == VmHoleKind::Biggest || in_libs;
                if counts && biggest.is_none_or(|(_, len)| gap > len) {
                    biggest = Some((prev_end, gap));
                }
            }
            VmHoleKind::None => {}
        }
        // nothing above the stack is usable
        if entry.kind == MapKind::Stack {
            break;
        }
        prev_end = entry.end;
        prev_kind = entry.kind;
    }

    match biggest {
        Some((begin, len)) if len > 0 => {
            debug!("using hole at {:#x} of {} bytes for {} bytes", begin, len, size);
            use_hole(begin, len, size).map(Some)
        }
        _ => Err(Error::segment(format!("no {kind:?} hole for {size} bytes"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
555555554000-555555556000 r--p 00000000 08:01 1 /usr/bin/app
555555559000-55555557a000 rw-p 00000000 00:00 0 [heap]
7ffff7d00000-7ffff7f00000 r-xp 00000000 08:01 2 /usr/lib/libc.so.6
7ffff7f80000-7ffff7fa0000 rw-p 00000000 00:00 0
7ffffffde000-7ffffffff000 rw-p 00000000 00:00 0 [stack]
ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0 [vsyscall]
";

    #[test]
    fn test_parse_maps() {
        let maps = parse_maps(MAPS);
        assert_eq!(maps.len(), 6);
        assert_eq!(maps[0].kind, MapKind::File);
        assert_eq!(maps[1].kind, MapKind::Heap);
        assert_eq!(maps[3].kind, MapKind::Anonymous);
        assert_eq!(maps[4].kind, MapKind::Stack);
        assert_eq!(maps[5].kind, MapKind::Other);
        assert_eq!(maps[0].start, 0x5555_5555_4000);
    }

    #[test]
    fn test_use_hole_alignment() {
        let begin = 0x1000_0000;
        let len = 0x4000_0000;
        let addr = use_hole(begin, len, 0x10_0000).unwrap();
        assert_eq!(addr % ALIGN_64MB, 0);
        assert!(addr >= begin && addr + 0x10_0000 <= begin + len);

        // too small for 64MB or 2MB alignment in the middle: use the end
        let addr = use_hole(0x1000, 0x3000, 0x2000).unwrap();
        assert_eq!(addr, 0x2000);
        assert!(use_hole(0x1000, 0x1000, 0x2000).is_err());
    }

    #[test]
    fn test_find_hole_kinds() {
        let maps = parse_maps(MAPS);
        let size = 0x10_0000;
        assert_eq!(find_hole(VmHoleKind::None, &maps, size).unwrap(), None);

        let heap = find_hole(VmHoleKind::Heap, &maps, size).unwrap().unwrap();
        assert!(heap >= 0x5555_5557_a000 && heap + size <= 0x7fff_f7d0_0000);

        let stack = find_hole(VmHoleKind::Stack, &maps, size).unwrap().unwrap();
        assert!(stack >= 0x7fff_f7fa_0000 && stack + size <= 0x7fff_fffd_e000);

        let begin = find_hole(VmHoleKind::Begin, &maps, size).unwrap().unwrap();
        assert!(begin + size <= 0x5555_5555_4000);

        // between heap and libc is the largest gap between heap and stack
        let libs = find_hole(VmHoleKind::Libs, &maps, size).unwrap().unwrap();
        assert!(libs >= 0x5555_5557_a000 && libs + size <= 0x7fff_f7d0_0000);

        let biggest = find_hole(VmHoleKind::Biggest, &maps, size).unwrap().unwrap();
        assert!(biggest + size <= 0x7fff_fffd_e000);
    }

    #[test]
    fn test_live_maps() {
        if !available() {
            return;
        }
        let maps = read_maps().unwrap();
        assert!(!maps.is_empty());
        assert!(find_hole(VmHoleKind::Biggest, &maps, 1 << 20).unwrap().is_some());
    }
}
