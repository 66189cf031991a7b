//! Load command decoding and encoding.
//!
//! Every [`LoadCommand`] keeps the exact bytes it was read from. Commands are
//! only re-encoded when they are edited, so unknown or vendor specific
//! commands pass through untouched.

use crate::{Error, Result};
use goblin::mach::load_command::{
    LC_CODE_SIGNATURE, LC_LAZY_LOAD_DYLIB, LC_LOAD_DYLIB, LC_LOAD_UPWARD_DYLIB,
    LC_LOAD_WEAK_DYLIB, LC_REEXPORT_DYLIB, LC_RPATH, LC_SEGMENT, LC_SEGMENT_64, LC_SYMTAB,
};
use scroll::{Endian, Pread, Pwrite};

/// Size of `dylib_command` without its trailing path.
pub const DYLIB_COMMAND_SIZE: usize = 24;

/// Size of `linkedit_data_command`.
pub const LINKEDIT_DATA_COMMAND_SIZE: usize = 16;

const SEGMENT_COMMAND_64_SIZE: usize = 72;
const SEGMENT_COMMAND_32_SIZE: usize = 56;
const SECTION_64_SIZE: usize = 80;
const SECTION_32_SIZE: usize = 68;

/// Timestamp written into newly created dylib commands.
pub const DEFAULT_DYLIB_TIMESTAMP: u32 = 2;

/// Version written into newly created dylib commands (1.0.0).
pub const DEFAULT_DYLIB_VERSION: u32 = 0x10000;

/// Flavour of a dylib load command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DylibKind {
    /// `LC_LOAD_DYLIB`, required at launch.
    Load,
    /// `LC_LOAD_WEAK_DYLIB`, missing library is tolerated.
    Weak,
    /// `LC_REEXPORT_DYLIB`
    Reexport,
    /// `LC_LAZY_LOAD_DYLIB`
    Lazy,
    /// `LC_LOAD_UPWARD_DYLIB`
    Upward,
}

impl DylibKind {
    pub fn from_cmd(cmd: u32) -> Option<Self> {
        match cmd {
            LC_LOAD_DYLIB => Some(Self::Load),
            LC_LOAD_WEAK_DYLIB => Some(Self::Weak),
            LC_REEXPORT_DYLIB => Some(Self::Reexport),
            LC_LAZY_LOAD_DYLIB => Some(Self::Lazy),
            LC_LOAD_UPWARD_DYLIB => Some(Self::Upward),
            _ => None,
        }
    }

    pub fn cmd(self) -> u32 {
        match self {
            Self::Load => LC_LOAD_DYLIB,
            Self::Weak => LC_LOAD_WEAK_DYLIB,
            Self::Reexport => LC_REEXPORT_DYLIB,
            Self::Lazy => LC_LAZY_LOAD_DYLIB,
            Self::Upward => LC_LOAD_UPWARD_DYLIB,
        }
    }
}

/// A decoded dylib load command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DylibCommand {
    pub kind: DylibKind,
    pub path: String,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

/// A section header inside a segment command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub sectname: String,
    pub segname: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
}

/// A decoded `LC_SEGMENT` / `LC_SEGMENT_64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentCommand {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub sections: Vec<Section>,
}

impl SegmentCommand {
    pub fn file_end(&self) -> u64 {
        self.fileoff.saturating_add(self.filesize)
    }
}

/// A decoded `LC_SYMTAB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymtabCommand {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

/// A decoded `linkedit_data_command` (used for `LC_CODE_SIGNATURE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkeditData {
    pub dataoff: u32,
    pub datasize: u32,
}

/// The decoded meaning of a load command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Dylib(DylibCommand),
    Rpath(String),
    Segment(SegmentCommand),
    Symtab(SymtabCommand),
    CodeSignature(LinkeditData),
    /// Anything else, kept only as raw bytes.
    Other,
}

/// One load command of a Mach-O image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadCommand {
    cmd: u32,
    raw: Vec<u8>,
    kind: CommandKind,
}

impl LoadCommand {
    /// Decodes a command from its exact bytes.
    pub fn decode(raw: Vec<u8>, endian: Endian, is_64: bool) -> Result<Self> {
        let cmd: u32 = raw.pread_with(0, endian)?;
        let kind = decode_kind(cmd, &raw, endian, is_64)?;
        Ok(Self { cmd, raw, kind })
    }

    /// Creates a dylib command, padded to the pointer alignment of the image.
    pub fn new_dylib(kind: DylibKind, path: &str, endian: Endian, is_64: bool) -> Result<Self> {
        let align = if is_64 { 8 } else { 4 };
        let cmdsize = align_up(DYLIB_COMMAND_SIZE + path.len() + 1, align);
        let mut raw = vec![0u8; cmdsize];
        let offset = &mut 0;
        raw.gwrite_with(kind.cmd(), offset, endian)?;
        raw.gwrite_with(cmdsize as u32, offset, endian)?;
        raw.gwrite_with(DYLIB_COMMAND_SIZE as u32, offset, endian)?;
        raw.gwrite_with(DEFAULT_DYLIB_TIMESTAMP, offset, endian)?;
        raw.gwrite_with(DEFAULT_DYLIB_VERSION, offset, endian)?;
        raw.gwrite_with(DEFAULT_DYLIB_VERSION, offset, endian)?;
        raw[DYLIB_COMMAND_SIZE..DYLIB_COMMAND_SIZE + path.len()].copy_from_slice(path.as_bytes());
        Self::decode(raw, endian, is_64)
    }

    /// Creates an `LC_CODE_SIGNATURE` command.
    pub fn new_code_signature(dataoff: u32, datasize: u32, endian: Endian) -> Result<Self> {
        let mut raw = vec![0u8; LINKEDIT_DATA_COMMAND_SIZE];
        let offset = &mut 0;
        raw.gwrite_with(LC_CODE_SIGNATURE, offset, endian)?;
        raw.gwrite_with(LINKEDIT_DATA_COMMAND_SIZE as u32, offset, endian)?;
        raw.gwrite_with(dataoff, offset, endian)?;
        raw.gwrite_with(datasize, offset, endian)?;
        Self::decode(raw, endian, false)
    }

    pub fn cmd(&self) -> u32 {
        self.cmd
    }

    pub fn cmdsize(&self) -> usize {
        self.raw.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn as_dylib(&self) -> Option<&DylibCommand> {
        match &self.kind {
            CommandKind::Dylib(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<&SegmentCommand> {
        match &self.kind {
            CommandKind::Segment(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_code_signature(&self) -> Option<LinkeditData> {
        match self.kind {
            CommandKind::CodeSignature(cs) => Some(cs),
            _ => None,
        }
    }

    /// Re-encodes a dylib command with a new path, keeping its versions.
    pub fn with_dylib_path(&self, path: &str, endian: Endian, is_64: bool) -> Result<Self> {
        let dylib = self
            .as_dylib()
            .ok_or_else(|| Error::Format("not a dylib command".into()))?;
        let mut cmd = Self::new_dylib(dylib.kind, path, endian, is_64)?;
        let offset = &mut 12;
        cmd.raw.gwrite_with(dylib.timestamp, offset, endian)?;
        cmd.raw.gwrite_with(dylib.current_version, offset, endian)?;
        cmd.raw.gwrite_with(dylib.compatibility_version, offset, endian)?;
        Self::decode(cmd.raw, endian, is_64)
    }

    /// Rewrites `dataoff`/`datasize` of an `LC_CODE_SIGNATURE`.
    pub fn set_linkedit_data(&mut self, dataoff: u32, datasize: u32, endian: Endian) -> Result<()> {
        if self.as_code_signature().is_none() {
            return Err(Error::Format("not a code signature command".into()));
        }
        self.raw.pwrite_with(dataoff, 8, endian)?;
        self.raw.pwrite_with(datasize, 12, endian)?;
        self.kind = CommandKind::CodeSignature(LinkeditData { dataoff, datasize });
        Ok(())
    }

    /// Rewrites the file and VM size of a segment command.
    pub fn set_segment_sizes(
        &mut self,
        filesize: u64,
        vmsize: u64,
        endian: Endian,
        is_64: bool,
    ) -> Result<()> {
        if self.as_segment().is_none() {
            return Err(Error::Format("not a segment command".into()));
        }
        if is_64 {
            self.raw.pwrite_with(vmsize, 32, endian)?;
            self.raw.pwrite_with(filesize, 48, endian)?;
        } else {
            let vmsize = u32::try_from(vmsize)
                .map_err(|_| Error::Format("segment vmsize exceeds 32 bits".into()))?;
            let filesize = u32::try_from(filesize)
                .map_err(|_| Error::Format("segment filesize exceeds 32 bits".into()))?;
            self.raw.pwrite_with(vmsize, 28, endian)?;
            self.raw.pwrite_with(filesize, 36, endian)?;
        }
        self.kind = decode_kind(self.cmd, &self.raw, endian, is_64)?;
        Ok(())
    }
}

fn decode_kind(cmd: u32, raw: &[u8], endian: Endian, is_64: bool) -> Result<CommandKind> {
    if let Some(kind) = DylibKind::from_cmd(cmd) {
        let name_offset: u32 = raw.pread_with(8, endian)?;
        return Ok(CommandKind::Dylib(DylibCommand {
            kind,
            path: read_lc_str(raw, name_offset as usize)?,
            timestamp: raw.pread_with(12, endian)?,
            current_version: raw.pread_with(16, endian)?,
            compatibility_version: raw.pread_with(20, endian)?,
        }));
    }

    let kind = match cmd {
        LC_RPATH => {
            let path_offset: u32 = raw.pread_with(8, endian)?;
            CommandKind::Rpath(read_lc_str(raw, path_offset as usize)?)
        }
        LC_SEGMENT_64 if is_64 => CommandKind::Segment(decode_segment_64(raw, endian)?),
        LC_SEGMENT => CommandKind::Segment(decode_segment_32(raw, endian)?),
        LC_SYMTAB => CommandKind::Symtab(SymtabCommand {
            symoff: raw.pread_with(8, endian)?,
            nsyms: raw.pread_with(12, endian)?,
            stroff: raw.pread_with(16, endian)?,
            strsize: raw.pread_with(20, endian)?,
        }),
        LC_CODE_SIGNATURE => CommandKind::CodeSignature(LinkeditData {
            dataoff: raw.pread_with(8, endian)?,
            datasize: raw.pread_with(12, endian)?,
        }),
        _ => CommandKind::Other,
    };
    Ok(kind)
}

fn decode_segment_64(raw: &[u8], endian: Endian) -> Result<SegmentCommand> {
    let nsects: u32 = raw.pread_with(64, endian)?;
    let mut sections = Vec::with_capacity(nsects as usize);
    for i in 0..nsects as usize {
        let base = SEGMENT_COMMAND_64_SIZE + i * SECTION_64_SIZE;
        if base + SECTION_64_SIZE > raw.len() {
            return Err(Error::Format("section table overruns segment command".into()));
        }
        sections.push(Section {
            sectname: fixed_name(&raw[base..base + 16]),
            segname: fixed_name(&raw[base + 16..base + 32]),
            addr: raw.pread_with(base + 32, endian)?,
            size: raw.pread_with(base + 40, endian)?,
            offset: raw.pread_with(base + 48, endian)?,
        });
    }
    let segment = SegmentCommand {
        name: fixed_name(raw.get(8..24).unwrap_or_default()),
        vmaddr: raw.pread_with(24, endian)?,
        vmsize: raw.pread_with(32, endian)?,
        fileoff: raw.pread_with(40, endian)?,
        filesize: raw.pread_with(48, endian)?,
        sections,
    };
    if segment.fileoff.checked_add(segment.filesize).is_none() {
        return Err(Error::Format(format!(
            "segment {} file range overflows",
            segment.name
        )));
    }
    Ok(segment)
}

fn decode_segment_32(raw: &[u8], endian: Endian) -> Result<SegmentCommand> {
    let nsects: u32 = raw.pread_with(48, endian)?;
    let mut sections = Vec::with_capacity(nsects as usize);
    for i in 0..nsects as usize {
        let base = SEGMENT_COMMAND_32_SIZE + i * SECTION_32_SIZE;
        if base + SECTION_32_SIZE > raw.len() {
            return Err(Error::Format("section table overruns segment command".into()));
        }
        sections.push(Section {
            sectname: fixed_name(&raw[base..base + 16]),
            segname: fixed_name(&raw[base + 16..base + 32]),
            addr: raw.pread_with::<u32>(base + 32, endian)? as u64,
            size: raw.pread_with::<u32>(base + 36, endian)? as u64,
            offset: raw.pread_with(base + 40, endian)?,
        });
    }
    Ok(SegmentCommand {
        name: fixed_name(raw.get(8..24).unwrap_or_default()),
        vmaddr: raw.pread_with::<u32>(24, endian)? as u64,
        vmsize: raw.pread_with::<u32>(28, endian)? as u64,
        fileoff: raw.pread_with::<u32>(32, endian)? as u64,
        filesize: raw.pread_with::<u32>(36, endian)? as u64,
        sections,
    })
}

/// Reads a NUL terminated `lc_str` that must lie inside the command.
///
/// Bytes that are not UTF-8 are replaced with U+FFFD. The command's raw
/// bytes are untouched, so such a path survives unless the command itself
/// is rewritten.
fn read_lc_str(raw: &[u8], offset: usize) -> Result<String> {
    let bytes = raw
        .get(offset..)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| Error::Format(format!("lc_str offset {offset} outside command")))?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

fn fixed_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Rounds `value` up to a power-of-two `alignment`.
pub fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
