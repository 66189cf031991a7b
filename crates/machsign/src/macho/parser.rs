//! Mach-O and universal binary parsing.

use super::load_command::{LinkeditData, LoadCommand, SegmentCommand};
use crate::{Error, Result};
use goblin::mach::fat::FAT_MAGIC;
use goblin::mach::header::MH_EXECUTE;
use goblin::mach::parse_magic_and_ctx;
use scroll::{Endian, Pread, BE};
use std::path::Path;

const HEADER_SIZE_32: usize = 28;
const HEADER_SIZE_64: usize = 32;
const FAT_HEADER_SIZE: usize = 8;
const FAT_ARCH_SIZE: usize = 20;

/// Upper bound on architectures in a fat header. Real binaries carry a handful.
const MAX_FAT_ARCHES: u32 = 64;

/// One architecture slice of a binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachOImage {
    pub(crate) data: Vec<u8>,
    pub(crate) endian: Endian,
    pub(crate) is_64: bool,
    pub(crate) commands: Vec<LoadCommand>,
}

impl MachOImage {
    /// Parses a thin Mach-O image.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let (_, ctx) = parse_magic_and_ctx(&data, 0)
            .map_err(|e| Error::Format(format!("bad Mach-O header: {e}")))?;
        let ctx = ctx.ok_or_else(|| Error::Format("not a Mach-O image".into()))?;
        let endian = ctx.le;
        let is_64 = ctx.container.is_big();
        let header_size = if is_64 { HEADER_SIZE_64 } else { HEADER_SIZE_32 };
        if data.len() < header_size {
            return Err(Error::Format("truncated Mach-O header".into()));
        }

        let ncmds: u32 = data.pread_with(16, endian)?;
        let sizeofcmds: u32 = data.pread_with(20, endian)?;
        let cmds_end = header_size + sizeofcmds as usize;
        if cmds_end > data.len() {
            return Err(Error::Format(format!(
                "sizeofcmds {sizeofcmds} exceeds image size {}",
                data.len()
            )));
        }

        let mut commands = Vec::with_capacity(ncmds as usize);
        let mut offset = header_size;
        for index in 0..ncmds {
            if offset + 8 > cmds_end {
                return Err(Error::Format(format!("load command {index} overruns command area")));
            }
            let cmdsize: u32 = data.pread_with(offset + 4, endian)?;
            let cmdsize = cmdsize as usize;
            if cmdsize < 8 || cmdsize % 4 != 0 || offset + cmdsize > cmds_end {
                return Err(Error::Format(format!(
                    "load command {index} has invalid size {cmdsize}"
                )));
            }
            let raw = data[offset..offset + cmdsize].to_vec();
            commands.push(LoadCommand::decode(raw, endian, is_64)?);
            offset += cmdsize;
        }

        Ok(Self { data, endian, is_64, commands })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_64(&self) -> bool {
        self.is_64
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn header_size(&self) -> usize {
        if self.is_64 {
            HEADER_SIZE_64
        } else {
            HEADER_SIZE_32
        }
    }

    pub fn cputype(&self) -> u32 {
        self.data.pread_with(4, self.endian).unwrap_or_default()
    }

    pub fn filetype(&self) -> u32 {
        self.data.pread_with(12, self.endian).unwrap_or_default()
    }

    pub fn is_executable(&self) -> bool {
        self.filetype() == MH_EXECUTE
    }

    pub fn commands(&self) -> &[LoadCommand] {
        &self.commands
    }

    /// Total size of the load commands.
    pub fn sizeofcmds(&self) -> usize {
        self.commands.iter().map(LoadCommand::cmdsize).sum()
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentCommand> {
        self.commands.iter().filter_map(LoadCommand::as_segment)
    }

    pub fn segment(&self, name: &str) -> Option<&SegmentCommand> {
        self.segments().find(|s| s.name == name)
    }

    pub fn code_signature(&self) -> Option<LinkeditData> {
        self.commands.iter().find_map(LoadCommand::as_code_signature)
    }

    /// Raw signature blob referenced by `LC_CODE_SIGNATURE`, if it lies inside the image.
    pub fn signature_data(&self) -> Option<&[u8]> {
        let cs = self.code_signature()?;
        let start = cs.dataoff as usize;
        let end = start.checked_add(cs.datasize as usize)?;
        self.data.get(start..end)
    }

    /// End of the region that may hold load commands.
    ///
    /// This is the lowest file offset of any section content, falling back to
    /// the lowest non-zero segment offset and finally to the image size.
    pub fn command_space_limit(&self) -> usize {
        let section_start = self
            .segments()
            .flat_map(|s| s.sections.iter())
            .filter(|s| s.offset != 0 && s.size != 0)
            .map(|s| s.offset as usize)
            .min();
        let segment_start = self
            .segments()
            .filter(|s| s.fileoff != 0 && s.filesize != 0)
            .map(|s| s.fileoff as usize)
            .min();
        section_start
            .or(segment_start)
            .unwrap_or(self.data.len())
            .min(self.data.len())
    }

    /// End of the content the signature must cover when none is present yet.
    pub fn content_end(&self) -> usize {
        if let Some(cs) = self.code_signature() {
            return (cs.dataoff as usize).min(self.data.len());
        }
        let end = self
            .segments()
            .map(|s| s.file_end() as usize)
            .max()
            .unwrap_or(self.data.len());
        if end == 0 {
            self.data.len()
        } else {
            end.min(self.data.len())
        }
    }
}

/// A fat_arch entry of a universal binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatArchEntry {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub offset: u32,
    pub size: u32,
    pub align: u32,
}

/// A thin or universal binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatBinary {
    pub(crate) original: Vec<u8>,
    pub(crate) arches: Option<Vec<FatArchEntry>>,
    pub(crate) slices: Vec<MachOImage>,
}

impl FatBinary {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Self::parse(data)
    }

    /// Parses a thin Mach-O or a universal binary.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Format("file too small for a Mach-O header".into()));
        }
        let magic: u32 = data.pread_with(0, BE)?;
        if magic != FAT_MAGIC {
            let slice = MachOImage::parse(data.clone())?;
            return Ok(Self { original: data, arches: None, slices: vec![slice] });
        }

        let nfat: u32 = data.pread_with(4, BE)?;
        if nfat == 0 || nfat > MAX_FAT_ARCHES {
            return Err(Error::Format(format!("implausible architecture count {nfat}")));
        }
        if FAT_HEADER_SIZE + nfat as usize * FAT_ARCH_SIZE > data.len() {
            return Err(Error::Format("fat header overruns file".into()));
        }

        let mut arches = Vec::with_capacity(nfat as usize);
        let mut slices = Vec::with_capacity(nfat as usize);
        for i in 0..nfat as usize {
            let base = FAT_HEADER_SIZE + i * FAT_ARCH_SIZE;
            let arch = FatArchEntry {
                cputype: data.pread_with(base, BE)?,
                cpusubtype: data.pread_with(base + 4, BE)?,
                offset: data.pread_with(base + 8, BE)?,
                size: data.pread_with(base + 12, BE)?,
                align: data.pread_with(base + 16, BE)?,
            };
            let start = arch.offset as usize;
            let end = start + arch.size as usize;
            if arch.size == 0 || end > data.len() || start < FAT_HEADER_SIZE {
                return Err(Error::Format(format!(
                    "slice {i} range {start:#x}..{end:#x} outside file of {:#x} bytes",
                    data.len()
                )));
            }
            if arch.align > 15 {
                return Err(Error::Format(format!("slice {i} alignment 2^{} too large", arch.align)));
            }
            let slice = MachOImage::parse(data[start..end].to_vec())
                .map_err(|e| Error::Format(format!("slice {i}: {e}")))?;
            arches.push(arch);
            slices.push(slice);
        }

        Ok(Self { original: data, arches: Some(arches), slices })
    }

    pub fn is_fat(&self) -> bool {
        self.arches.is_some()
    }

    pub fn slices(&self) -> &[MachOImage] {
        &self.slices
    }

    pub fn slices_mut(&mut self) -> &mut [MachOImage] {
        &mut self.slices
    }

    pub fn arches(&self) -> Option<&[FatArchEntry]> {
        self.arches.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::testutil::{fat, thin_arm64, ThinImage};

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(FatBinary::parse(vec![0; 100]), Err(Error::Format(_))));
        assert!(matches!(FatBinary::parse(vec![0xfe]), Err(Error::Format(_))));
    }

    #[test]
    fn test_parse_thin() {
        let bin = FatBinary::parse(thin_arm64()).unwrap();
        assert!(!bin.is_fat());
        let image = &bin.slices()[0];
        assert!(image.is_64());
        assert!(image.is_executable());
        assert_eq!(image.segment("__TEXT").unwrap().sections.len(), 1);
        assert!(image.segment("__LINKEDIT").is_some());
        assert!(image.code_signature().is_none());
        assert_eq!(image.command_space_limit(), ThinImage::TEXT_SECTION_OFFSET);
    }

    #[test]
    fn test_parse_fat() {
        let bin = FatBinary::parse(fat(&[thin_arm64(), ThinImage::new().x86_64().build()])).unwrap();
        assert!(bin.is_fat());
        assert_eq!(bin.slices().len(), 2);
        assert_eq!(bin.arches().unwrap()[0].align, 14);
    }

    #[test]
    fn test_sizeofcmds_overrun() {
        let mut data = thin_arm64();
        data[20..24].copy_from_slice(&0x00ff_ffffu32.to_le_bytes());
        assert!(matches!(FatBinary::parse(data), Err(Error::Format(_))));
    }

    #[test]
    fn test_slice_outside_file() {
        let mut data = fat(&[thin_arm64()]);
        // size field of the first fat_arch
        data[20..24].copy_from_slice(&0x7fff_ffffu32.to_be_bytes());
        assert!(matches!(FatBinary::parse(data), Err(Error::Format(_))));
    }

    #[test]
    fn test_bad_cmdsize() {
        let mut data = thin_arm64();
        // first command's cmdsize
        data[36..40].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(FatBinary::parse(data), Err(Error::Format(_))));
    }
}
