//! Mach-O serialization and signature space management.
//!
//! Edits to load commands are committed back into the image bytes with
//! [`MachOImage::commit_commands`]. Signing reserves space for the signature
//! first ([`MachOImage::reserve_signature`]) so that the header changes are
//! covered by the page hashes, then fills it in ([`MachOImage::embed_signature`]).

use super::load_command::{align_up, CommandKind, LoadCommand};
use super::parser::{FatArchEntry, FatBinary, MachOImage};
use crate::{Error, Result};
use scroll::Pwrite;
use std::path::Path;

/// Alignment of the signature blob inside `__LINKEDIT`.
const SIGNATURE_ALIGNMENT: usize = 16;

/// VM page granularity used when growing `__LINKEDIT`.
const LINKEDIT_VM_ALIGNMENT: u64 = 0x4000;

impl MachOImage {
    /// Replaces the load commands and writes them into the header area.
    ///
    /// Fails with [`Error::NoSpace`] if the commands would overlap the first
    /// section or segment content. Any bytes freed at the end of the command
    /// area are zeroed.
    pub fn commit_commands(&mut self, commands: Vec<LoadCommand>) -> Result<()> {
        let header_size = self.header_size();
        let old_end = header_size + self.sizeofcmds();
        let new_size: usize = commands.iter().map(LoadCommand::cmdsize).sum();
        let new_end = header_size + new_size;
        let limit = self.command_space_limit();
        if new_end > limit {
            return Err(Error::NoSpace {
                needed: new_size,
                available: limit.saturating_sub(header_size),
            });
        }

        self.data.pwrite_with(commands.len() as u32, 16, self.endian)?;
        self.data.pwrite_with(new_size as u32, 20, self.endian)?;
        let mut offset = header_size;
        for cmd in &commands {
            self.data[offset..offset + cmd.cmdsize()].copy_from_slice(cmd.as_bytes());
            offset += cmd.cmdsize();
        }
        if old_end > new_end {
            self.data[new_end..old_end].fill(0);
        }
        self.commands = commands;
        Ok(())
    }

    /// Offset at which a new signature would be placed.
    pub fn signature_offset(&self) -> usize {
        align_up(self.content_end(), SIGNATURE_ALIGNMENT)
    }

    /// Removes `LC_CODE_SIGNATURE` and the blob it references.
    ///
    /// Returns `false` if the image was not signed.
    pub fn strip_signature(&mut self) -> Result<bool> {
        let Some(cs) = self.code_signature() else {
            return Ok(false);
        };
        let dataoff = cs.dataoff as usize;

        let mut commands = self.commands.clone();
        commands.retain(|c| c.as_code_signature().is_none());
        self.shrink_linkedit(&mut commands, dataoff as u64)?;
        self.commit_commands(commands)?;
        if dataoff <= self.data.len() {
            self.data.truncate(dataoff);
        }
        Ok(true)
    }

    fn shrink_linkedit(&self, commands: &mut [LoadCommand], end: u64) -> Result<()> {
        for cmd in commands.iter_mut() {
            let Some(seg) = cmd.as_segment() else { continue };
            if seg.name == "__LINKEDIT" && seg.file_end() > end && seg.fileoff <= end {
                let filesize = end - seg.fileoff;
                let vmsize = seg.vmsize;
                cmd.set_segment_sizes(filesize, vmsize, self.endian, self.is_64)?;
            }
        }
        Ok(())
    }

    /// Prepares the image to carry a signature of `size` bytes.
    ///
    /// Adds or updates `LC_CODE_SIGNATURE`, extends `__LINKEDIT` over the
    /// signature, and resizes the image to end exactly after the reserved
    /// region (zero filled). Returns the signature offset, which is also the
    /// code limit for hashing.
    pub fn reserve_signature(&mut self, size: usize) -> Result<usize> {
        let dataoff = self.signature_offset();
        let datasize = u32::try_from(size)
            .map_err(|_| Error::Signing("signature too large".into()))?;
        let dataoff32 = u32::try_from(dataoff)
            .map_err(|_| Error::Format("image too large to sign".into()))?;

        let mut commands = self.commands.clone();
        match commands.iter().position(|c| c.as_code_signature().is_some()) {
            Some(index) => commands[index].set_linkedit_data(dataoff32, datasize, self.endian)?,
            None => commands.push(LoadCommand::new_code_signature(
                dataoff32,
                datasize,
                self.endian,
            )?),
        }

        let sig_end = (dataoff + size) as u64;
        let mut has_linkedit = false;
        for cmd in commands.iter_mut() {
            let Some(seg) = cmd.as_segment() else { continue };
            if seg.name != "__LINKEDIT" {
                continue;
            }
            has_linkedit = true;
            if seg.fileoff > dataoff as u64 {
                return Err(Error::Format("__LINKEDIT starts after signature offset".into()));
            }
            let filesize = sig_end - seg.fileoff;
            let vmsize = seg
                .vmsize
                .max((filesize + LINKEDIT_VM_ALIGNMENT - 1) & !(LINKEDIT_VM_ALIGNMENT - 1));
            cmd.set_segment_sizes(filesize, vmsize, self.endian, self.is_64)?;
        }
        if !has_linkedit {
            return Err(Error::Format("image has no __LINKEDIT segment".into()));
        }

        self.commit_commands(commands)?;
        self.data.truncate(dataoff);
        self.data.resize(dataoff + size, 0);
        Ok(dataoff)
    }

    /// Copies a signature into the space made by [`MachOImage::reserve_signature`].
    pub fn embed_signature(&mut self, blob: &[u8]) -> Result<()> {
        let cs = self
            .code_signature()
            .ok_or_else(|| Error::Signing("no signature space reserved".into()))?;
        if blob.len() > cs.datasize as usize {
            return Err(Error::Signing(format!(
                "signature of {} bytes exceeds reserved {} bytes",
                blob.len(),
                cs.datasize
            )));
        }
        let start = cs.dataoff as usize;
        let end = start + cs.datasize as usize;
        if end > self.data.len() {
            return Err(Error::Format("signature region outside image".into()));
        }
        self.data[start..start + blob.len()].copy_from_slice(blob);
        self.data[start + blob.len()..end].fill(0);
        Ok(())
    }

    /// `__TEXT` segment as `(fileoff, filesize)`, used for the exec segment fields.
    pub fn text_segment_range(&self) -> (u64, u64) {
        self.commands
            .iter()
            .find_map(|c| match c.kind() {
                CommandKind::Segment(s) if s.name == "__TEXT" => Some((s.fileoff, s.filesize)),
                _ => None,
            })
            .unwrap_or((0, 0))
    }
}

impl FatBinary {
    /// Serializes the binary.
    ///
    /// Unchanged slices keep their original offsets; if any slice changed
    /// size the slices are laid out again at their declared alignment.
    pub fn serialize(&self) -> Vec<u8> {
        let Some(arches) = &self.arches else {
            return self.slices[0].data.clone();
        };

        let unchanged_layout = arches
            .iter()
            .zip(&self.slices)
            .all(|(arch, slice)| arch.size as usize == slice.data.len());
        if unchanged_layout {
            let mut out = self.original.clone();
            for (arch, slice) in arches.iter().zip(&self.slices) {
                let start = arch.offset as usize;
                out[start..start + slice.data.len()].copy_from_slice(&slice.data);
            }
            return out;
        }

        let mut layout: Vec<FatArchEntry> = Vec::with_capacity(arches.len());
        let mut cursor = arches.first().map(|a| a.offset as usize).unwrap_or_default();
        for (arch, slice) in arches.iter().zip(&self.slices) {
            cursor = align_up(cursor, 1usize << arch.align);
            layout.push(FatArchEntry {
                offset: cursor as u32,
                size: slice.data.len() as u32,
                ..*arch
            });
            cursor += slice.data.len();
        }

        let mut out = vec![0u8; cursor];
        let header_len = 8 + 20 * layout.len();
        out[..header_len].copy_from_slice(&self.original[..header_len]);
        for (i, arch) in layout.iter().enumerate() {
            let base = 8 + i * 20;
            out[base + 8..base + 12].copy_from_slice(&arch.offset.to_be_bytes());
            out[base + 12..base + 16].copy_from_slice(&arch.size.to_be_bytes());
        }
        for (arch, slice) in layout.iter().zip(&self.slices) {
            let start = arch.offset as usize;
            out[start..start + slice.data.len()].copy_from_slice(&slice.data);
        }
        out
    }

    /// Applies `edit` to every slice, keeping the result only if all succeed.
    ///
    /// Returns whether any slice reported a change.
    pub fn edit_slices<F>(&mut self, mut edit: F) -> Result<bool>
    where
        F: FnMut(&mut MachOImage) -> Result<bool>,
    {
        let mut staged = self.slices.clone();
        let mut changed = false;
        for slice in staged.iter_mut() {
            changed |= edit(slice)?;
        }
        if changed {
            self.slices = staged;
        }
        Ok(changed)
    }

    /// Writes the binary to `path` through a temporary file in the same
    /// directory, preserving the destination's permissions.
    pub fn write_atomic(&self, path: impl AsRef<Path>) -> Result<()> {
        write_file_atomic(path.as_ref(), &self.serialize())
    }
}

/// Replaces `path` with `contents` via temp file and rename.
pub(crate) fn write_file_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let permissions = std::fs::metadata(path).ok().map(|m| m.permissions());

    let mut tmp = tempfile::Builder::new()
        .prefix(".machsign-")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    if let Some(permissions) = permissions {
        std::fs::set_permissions(tmp.path(), permissions)?;
    }
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
