//! Synthetic Mach-O images for tests.
//!
//! Only depends on std so integration tests can include it by path.

#![allow(dead_code)]

const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_RPATH: u32 = 0x8000_001c;
const LC_BUILD_VERSION: u32 = 0x32;

pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;
pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_OBJECT: u32 = 0x1;

/// Builder for a minimal 64-bit little-endian Mach-O.
///
/// Layout: header and load commands, `__text` content at
/// [`ThinImage::TEXT_SECTION_OFFSET`], `__LINKEDIT` at 0x4000.
pub struct ThinImage {
    cputype: u32,
    filetype: u32,
    dylibs: Vec<String>,
    tight: bool,
    fill: u8,
}

impl Default for ThinImage {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinImage {
    pub const TEXT_SECTION_OFFSET: usize = 0x1000;
    pub const LINKEDIT_OFFSET: usize = 0x4000;
    pub const LINKEDIT_SIZE: usize = 0x200;

    pub fn new() -> Self {
        Self {
            cputype: CPU_TYPE_ARM64,
            filetype: MH_EXECUTE,
            dylibs: vec!["/usr/lib/libSystem.B.dylib".to_string()],
            tight: false,
            fill: 0x5a,
        }
    }

    pub fn x86_64(mut self) -> Self {
        self.cputype = CPU_TYPE_X86_64;
        self.fill = 0xc3;
        self
    }

    pub fn dylib(mut self) -> Self {
        self.filetype = MH_DYLIB;
        self
    }

    /// Relocatable object file, as left behind by a build.
    pub fn object(mut self) -> Self {
        self.filetype = MH_OBJECT;
        self
    }

    pub fn with_dylib(mut self, path: &str) -> Self {
        self.dylibs.push(path.to_string());
        self
    }

    /// Places `__text` directly after the load commands, leaving no room to grow.
    pub fn tight(mut self) -> Self {
        self.tight = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut cmds: Vec<Vec<u8>> = Vec::new();
        cmds.push(segment("__PAGEZERO", 0, 0x1_0000_0000, 0, 0, None));
        // __TEXT placeholder, patched once the command area size is known
        cmds.push(segment("__TEXT", 0x1_0000_0000, 0x4000, 0, 0x4000, Some(0)));
        cmds.push(segment(
            "__LINKEDIT",
            0x1_0000_4000,
            0x4000,
            Self::LINKEDIT_OFFSET as u64,
            Self::LINKEDIT_SIZE as u64,
            None,
        ));
        cmds.push(symtab(Self::LINKEDIT_OFFSET as u32, Self::LINKEDIT_SIZE as u32));
        for path in &self.dylibs {
            cmds.push(dylib(path));
        }
        cmds.push(rpath("@executable_path/Frameworks"));
        cmds.push(build_version());

        let sizeofcmds: usize = cmds.iter().map(Vec::len).sum();
        let text_offset = if self.tight {
            32 + sizeofcmds
        } else {
            Self::TEXT_SECTION_OFFSET
        };
        cmds[1] = segment(
            "__TEXT",
            0x1_0000_0000,
            0x4000,
            0,
            0x4000,
            Some(text_offset as u32),
        );

        let mut out = Vec::new();
        out.extend(0xfeed_facfu32.to_le_bytes());
        out.extend(self.cputype.to_le_bytes());
        out.extend(0u32.to_le_bytes());
        out.extend(self.filetype.to_le_bytes());
        out.extend((cmds.len() as u32).to_le_bytes());
        out.extend((sizeofcmds as u32).to_le_bytes());
        out.extend(0x0020_0085u32.to_le_bytes());
        out.extend(0u32.to_le_bytes());
        for cmd in &cmds {
            out.extend(cmd);
        }

        out.resize(Self::LINKEDIT_OFFSET + Self::LINKEDIT_SIZE, 0);
        for (i, b) in out[text_offset..text_offset + 0x100].iter_mut().enumerate() {
            *b = self.fill.wrapping_add(i as u8);
        }
        for (i, b) in out[Self::LINKEDIT_OFFSET..].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        out
    }
}

/// Default arm64 executable.
pub fn thin_arm64() -> Vec<u8> {
    ThinImage::new().build()
}

/// Wraps slices into a universal binary with 2^14 alignment.
pub fn fat(slices: &[Vec<u8>]) -> Vec<u8> {
    let align = 14u32;
    let mut offsets = Vec::new();
    let mut cursor = 8 + slices.len() * 20;
    for slice in slices {
        cursor = (cursor + (1 << align) - 1) & !((1 << align) - 1);
        offsets.push(cursor);
        cursor += slice.len();
    }

    let mut out = vec![0u8; cursor];
    out[0..4].copy_from_slice(&0xcafe_babeu32.to_be_bytes());
    out[4..8].copy_from_slice(&(slices.len() as u32).to_be_bytes());
    for (i, slice) in slices.iter().enumerate() {
        let base = 8 + i * 20;
        let cputype = u32::from_le_bytes([slice[4], slice[5], slice[6], slice[7]]);
        out[base..base + 4].copy_from_slice(&cputype.to_be_bytes());
        out[base + 4..base + 8].copy_from_slice(&0u32.to_be_bytes());
        out[base + 8..base + 12].copy_from_slice(&(offsets[i] as u32).to_be_bytes());
        out[base + 12..base + 16].copy_from_slice(&(slice.len() as u32).to_be_bytes());
        out[base + 16..base + 20].copy_from_slice(&align.to_be_bytes());
        out[offsets[i]..offsets[i] + slice.len()].copy_from_slice(slice);
    }
    out
}

fn segment(
    name: &str,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    text_section: Option<u32>,
) -> Vec<u8> {
    let nsects = u32::from(text_section.is_some());
    let cmdsize = 72 + 80 * nsects;
    let mut out = Vec::new();
    out.extend(LC_SEGMENT_64.to_le_bytes());
    out.extend(cmdsize.to_le_bytes());
    out.extend(fixed16(name));
    out.extend(vmaddr.to_le_bytes());
    out.extend(vmsize.to_le_bytes());
    out.extend(fileoff.to_le_bytes());
    out.extend(filesize.to_le_bytes());
    out.extend(5u32.to_le_bytes());
    out.extend(5u32.to_le_bytes());
    out.extend(nsects.to_le_bytes());
    out.extend(0u32.to_le_bytes());
    if let Some(offset) = text_section {
        out.extend(fixed16("__text"));
        out.extend(fixed16("__TEXT"));
        out.extend((vmaddr + offset as u64).to_le_bytes());
        out.extend(0x100u64.to_le_bytes());
        out.extend(offset.to_le_bytes());
        out.extend(2u32.to_le_bytes());
        out.extend([0u8; 24]);
    }
    out
}

fn symtab(offset: u32, size: u32) -> Vec<u8> {
    let mut out = Vec::new();
    for v in [LC_SYMTAB, 24, offset, 0, offset, size] {
        out.extend(v.to_le_bytes());
    }
    out
}

fn dylib(path: &str) -> Vec<u8> {
    let cmdsize = (24 + path.len() + 1 + 7) & !7;
    let mut out = Vec::new();
    for v in [LC_LOAD_DYLIB, cmdsize as u32, 24, 2, 0x0505_0000, 0x10000] {
        out.extend(v.to_le_bytes());
    }
    out.extend(path.as_bytes());
    out.resize(cmdsize, 0);
    out
}

fn rpath(path: &str) -> Vec<u8> {
    let cmdsize = (12 + path.len() + 1 + 7) & !7;
    let mut out = Vec::new();
    for v in [LC_RPATH, cmdsize as u32, 12] {
        out.extend(v.to_le_bytes());
    }
    out.extend(path.as_bytes());
    out.resize(cmdsize, 0);
    out
}

fn build_version() -> Vec<u8> {
    let mut out = Vec::new();
    for v in [LC_BUILD_VERSION, 24, 2, 0x000e_0000, 0x0011_0000, 0] {
        out.extend(v.to_le_bytes());
    }
    out
}

fn fixed16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}
