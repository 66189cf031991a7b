//! CodeDirectory construction and parsing.
//!
//! The CodeDirectory is the hash manifest at the heart of a code signature.
//! It lists one digest per code page followed by the special slots that bind
//! the Info.plist, requirements, CodeResources and entitlements to the binary.
//! A signature usually carries two of them, a SHA-1 one for older systems and
//! a SHA-256 one.

use super::constants::*;
use crate::{Error, Result};
use rayon::prelude::*;
use scroll::{Pread, BE};
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha384};
use std::fmt;
use std::str::FromStr;

/// CodeDirectory header size for version 0x20400 (with exec segment fields)
pub(crate) const CODEDIRECTORY_HEADER_SIZE: usize = 88;

/// Digest algorithm of a CodeDirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestType {
    Sha1,
    Sha256,
    Sha384,
}

impl DigestType {
    pub fn hash_type(self) -> u8 {
        match self {
            Self::Sha1 => CS_HASHTYPE_SHA1,
            Self::Sha256 => CS_HASHTYPE_SHA256,
            Self::Sha384 => CS_HASHTYPE_SHA384,
        }
    }

    pub fn from_hash_type(value: u8) -> Option<Self> {
        match value {
            CS_HASHTYPE_SHA1 => Some(Self::Sha1),
            CS_HASHTYPE_SHA256 => Some(Self::Sha256),
            CS_HASHTYPE_SHA384 => Some(Self::Sha384),
            _ => None,
        }
    }

    /// Digest length in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Sha1 => CS_SHA1_LEN,
            Self::Sha256 => CS_SHA256_LEN,
            Self::Sha384 => CS_SHA384_LEN,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
        }
    }
}

impl fmt::Display for DigestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
        })
    }
}

impl FromStr for DigestType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            other => Err(Error::Config(format!("unknown digest '{other}'"))),
        }
    }
}

/// A CodeDirectory, either built for signing or parsed from a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeDirectory {
    pub version: u32,
    pub flags: u32,
    pub digest: DigestType,
    /// Page size in bytes; 0 means a single page covers the whole code.
    pub page_size: usize,
    pub code_limit: u64,
    pub identifier: String,
    pub team_id: Option<String>,
    /// Special slot hashes, `special_slots[0]` is slot -1.
    pub special_slots: Vec<Vec<u8>>,
    pub code_hashes: Vec<Vec<u8>>,
    pub exec_seg_base: u64,
    pub exec_seg_limit: u64,
    pub exec_seg_flags: u64,
}

impl CodeDirectory {
    /// Hash stored for special slot `-slot`, if the directory has that slot.
    pub fn special_slot(&self, slot: usize) -> Option<&[u8]> {
        slot.checked_sub(1)
            .and_then(|i| self.special_slots.get(i))
            .map(Vec::as_slice)
    }

    /// Serializes the directory as a version 0x20400 blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        let hash_size = self.digest.size();
        let n_special = self.special_slots.len();
        let n_code = self.code_hashes.len();

        let ident_offset = CODEDIRECTORY_HEADER_SIZE;
        let ident_len = self.identifier.len() + 1;
        let team_len = self.team_id.as_ref().map(|t| t.len() + 1).unwrap_or(0);
        let team_offset = if self.team_id.is_some() {
            ident_offset + ident_len
        } else {
            0
        };
        let hash_offset = ident_offset + ident_len + team_len + n_special * hash_size;
        let total_len = hash_offset + n_code * hash_size;

        let (code_limit32, code_limit64) = match u32::try_from(self.code_limit) {
            Ok(limit) => (limit, 0u64),
            Err(_) => (u32::MAX, self.code_limit),
        };
        let page_log2 = if self.page_size == 0 {
            0
        } else {
            self.page_size.trailing_zeros() as u8
        };

        let mut buf = Vec::with_capacity(total_len);
        buf.extend(CSMAGIC_CODEDIRECTORY.to_be_bytes());
        buf.extend((total_len as u32).to_be_bytes());
        buf.extend(self.version.to_be_bytes());
        buf.extend(self.flags.to_be_bytes());
        buf.extend((hash_offset as u32).to_be_bytes());
        buf.extend((ident_offset as u32).to_be_bytes());
        buf.extend((n_special as u32).to_be_bytes());
        buf.extend((n_code as u32).to_be_bytes());
        buf.extend(code_limit32.to_be_bytes());
        buf.push(hash_size as u8);
        buf.push(self.digest.hash_type());
        buf.push(0); // platform
        buf.push(page_log2);
        buf.extend(0u32.to_be_bytes()); // spare2
        buf.extend(0u32.to_be_bytes()); // scatterOffset
        buf.extend((team_offset as u32).to_be_bytes());
        buf.extend(0u32.to_be_bytes()); // spare3
        buf.extend(code_limit64.to_be_bytes());
        buf.extend(self.exec_seg_base.to_be_bytes());
        buf.extend(self.exec_seg_limit.to_be_bytes());
        buf.extend(self.exec_seg_flags.to_be_bytes());

        buf.extend(self.identifier.as_bytes());
        buf.push(0);
        if let Some(team) = &self.team_id {
            buf.extend(team.as_bytes());
            buf.push(0);
        }
        // special slots are stored from -n up to -1
        for hash in self.special_slots.iter().rev() {
            buf.extend(hash);
        }
        for hash in &self.code_hashes {
            buf.extend(hash);
        }
        buf
    }

    /// Parses a CodeDirectory blob.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let magic: u32 = data.pread_with(0, BE)?;
        if magic != CSMAGIC_CODEDIRECTORY {
            return Err(Error::Format(format!("bad CodeDirectory magic {magic:#x}")));
        }
        let length: u32 = data.pread_with(4, BE)?;
        let data = data
            .get(..length as usize)
            .ok_or_else(|| Error::Format("CodeDirectory length exceeds blob".into()))?;

        let version: u32 = data.pread_with(8, BE)?;
        let flags: u32 = data.pread_with(12, BE)?;
        let hash_offset: u32 = data.pread_with(16, BE)?;
        let ident_offset: u32 = data.pread_with(20, BE)?;
        let n_special: u32 = data.pread_with(24, BE)?;
        let n_code: u32 = data.pread_with(28, BE)?;
        let code_limit32: u32 = data.pread_with(32, BE)?;
        let hash_size: u8 = data.pread_with(36, BE)?;
        let hash_type: u8 = data.pread_with(37, BE)?;
        let page_log2: u8 = data.pread_with(39, BE)?;

        let digest = DigestType::from_hash_type(hash_type)
            .ok_or_else(|| Error::Format(format!("unsupported hash type {hash_type}")))?;
        if hash_size as usize != digest.size() {
            return Err(Error::Format(format!(
                "hash size {hash_size} does not match {digest}"
            )));
        }
        if page_log2 >= 32 {
            return Err(Error::Format(format!("page size 2^{page_log2} too large")));
        }

        let team_id = if version >= CODEDIRECTORY_VERSION_TEAMID {
            let team_offset: u32 = data.pread_with(48, BE)?;
            if team_offset != 0 {
                Some(read_cstr(data, team_offset as usize)?)
            } else {
                None
            }
        } else {
            None
        };
        let mut code_limit = code_limit32 as u64;
        if version >= CODEDIRECTORY_VERSION_CODELIMIT64 {
            let code_limit64: u64 = data.pread_with(56, BE)?;
            if code_limit64 != 0 {
                code_limit = code_limit64;
            }
        }
        let (exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if version >= CODEDIRECTORY_VERSION_EXECSEG {
                (
                    data.pread_with(64, BE)?,
                    data.pread_with(72, BE)?,
                    data.pread_with(80, BE)?,
                )
            } else {
                (0, 0, 0)
            };

        let size = digest.size();
        let hash_offset = hash_offset as usize;
        let special_start = hash_offset
            .checked_sub(n_special as usize * size)
            .ok_or_else(|| Error::Format("special slots precede blob start".into()))?;
        let code_end = hash_offset + n_code as usize * size;
        if code_end > data.len() {
            return Err(Error::Format("code slots overrun CodeDirectory".into()));
        }
        let mut special_slots: Vec<Vec<u8>> = data[special_start..hash_offset]
            .chunks(size)
            .map(<[u8]>::to_vec)
            .collect();
        special_slots.reverse();
        let code_hashes = data[hash_offset..code_end]
            .chunks(size)
            .map(<[u8]>::to_vec)
            .collect();

        Ok(Self {
            version,
            flags,
            digest,
            page_size: if page_log2 == 0 { 0 } else { 1usize << page_log2 },
            code_limit,
            identifier: read_cstr(data, ident_offset as usize)?,
            team_id,
            special_slots,
            code_hashes,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
        })
    }

    /// Hash of the serialized directory with its own digest.
    pub fn cdhash(&self) -> Vec<u8> {
        self.digest.digest(&self.to_bytes())
    }
}

fn read_cstr(data: &[u8], offset: usize) -> Result<String> {
    let bytes = data
        .get(offset..)
        .ok_or_else(|| Error::Format(format!("string offset {offset} outside CodeDirectory")))?;
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Format("unterminated string in CodeDirectory".into()))?;
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|_| Error::Format("CodeDirectory string is not UTF-8".into()))
}

/// Builder for [`CodeDirectory`].
///
/// Special slot setters take the content to bind (Info.plist bytes, the
/// requirements blob, ...); the builder hashes it with the selected digest.
///
/// # Example
///
/// ```
/// use machsign::codesign::{CodeDirectoryBuilder, DigestType};
/// use machsign::codesign::constants::CS_EXECSEG_MAIN_BINARY;
///
/// let code = vec![0u8; 8192];
/// let cd = CodeDirectoryBuilder::new("com.example.app", &code)
///     .team_id("TEAMID1234")
///     .digest(DigestType::Sha256)
///     .exec_seg_limit(65536)
///     .exec_seg_flags(CS_EXECSEG_MAIN_BINARY)
///     .build();
/// assert_eq!(cd.code_hashes.len(), 2);
/// ```
pub struct CodeDirectoryBuilder<'a> {
    identifier: String,
    team_id: Option<String>,
    code: &'a [u8],
    digest: DigestType,
    page_size: usize,
    special: [Option<&'a [u8]>; CSSLOT_SPECIAL_MAX + 1],
    exec_seg_base: u64,
    exec_seg_limit: u64,
    exec_seg_flags: u64,
    flags: u32,
}

impl<'a> CodeDirectoryBuilder<'a> {
    /// Creates a builder hashing `code`, the slice bytes up to the signature.
    pub fn new(identifier: impl Into<String>, code: &'a [u8]) -> Self {
        Self {
            identifier: identifier.into(),
            team_id: None,
            code,
            digest: DigestType::Sha256,
            page_size: PAGE_SIZE,
            special: [None; CSSLOT_SPECIAL_MAX + 1],
            exec_seg_base: 0,
            exec_seg_limit: 0,
            exec_seg_flags: 0,
            flags: 0,
        }
    }

    /// Team identifier, omitted for adhoc signatures.
    pub fn team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    pub fn digest(mut self, digest: DigestType) -> Self {
        self.digest = digest;
        self
    }

    /// Page size in bytes, a power of two.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Binds arbitrary content to special slot `-slot`.
    pub fn special_slot(mut self, slot: usize, content: &'a [u8]) -> Self {
        if let Some(entry) = self.special.get_mut(slot) {
            *entry = Some(content);
        }
        self
    }

    /// Info.plist (slot -1)
    pub fn info_plist(self, content: &'a [u8]) -> Self {
        self.special_slot(CSSLOT_SPECIAL_INFOSLOT, content)
    }

    /// Requirements blob (slot -2)
    pub fn requirements(self, blob: &'a [u8]) -> Self {
        self.special_slot(CSSLOT_SPECIAL_REQUIREMENTS, blob)
    }

    /// `_CodeSignature/CodeResources` (slot -3)
    pub fn resources(self, content: &'a [u8]) -> Self {
        self.special_slot(CSSLOT_SPECIAL_RESOURCEDIR, content)
    }

    /// XML entitlements blob (slot -5)
    pub fn entitlements(self, blob: &'a [u8]) -> Self {
        self.special_slot(CSSLOT_SPECIAL_ENTITLEMENTS, blob)
    }

    /// DER entitlements blob (slot -7), only kept for main executables.
    pub fn der_entitlements(self, blob: &'a [u8]) -> Self {
        self.special_slot(CSSLOT_SPECIAL_DER_ENTITLEMENTS, blob)
    }

    pub fn exec_seg_base(mut self, base: u64) -> Self {
        self.exec_seg_base = base;
        self
    }

    /// Usually the `__TEXT` file size.
    pub fn exec_seg_limit(mut self, limit: u64) -> Self {
        self.exec_seg_limit = limit;
        self
    }

    pub fn exec_seg_flags(mut self, flags: u64) -> Self {
        self.exec_seg_flags = flags;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    fn is_main_executable(&self) -> bool {
        self.exec_seg_flags & CS_EXECSEG_MAIN_BINARY != 0
    }

    /// Number of special slots, trimmed to the highest populated one.
    ///
    /// Slots -6 and -7 only exist for main executables and at least slots -1
    /// to -3 are always present.
    fn count_special_slots(&self) -> usize {
        let max = if self.is_main_executable() {
            CSSLOT_SPECIAL_MAX
        } else {
            CSSLOT_SPECIAL_ENTITLEMENTS
        };
        (1..=max)
            .rev()
            .find(|&slot| self.special[slot].is_some())
            .unwrap_or(0)
            .max(3)
    }

    pub fn build(&self) -> CodeDirectory {
        let empty = vec![0u8; self.digest.size()];
        let special_slots = (1..=self.count_special_slots())
            .map(|slot| match self.special[slot] {
                Some(content) => self.digest.digest(content),
                None => empty.clone(),
            })
            .collect();

        let digest = self.digest;
        let code_hashes = if self.page_size == 0 {
            if self.code.is_empty() {
                Vec::new()
            } else {
                vec![digest.digest(self.code)]
            }
        } else {
            self.code
                .par_chunks(self.page_size)
                .map(|page| digest.digest(page))
                .collect()
        };

        CodeDirectory {
            version: CODEDIRECTORY_VERSION,
            flags: self.flags,
            digest,
            page_size: self.page_size,
            code_limit: self.code.len() as u64,
            identifier: self.identifier.clone(),
            team_id: self.team_id.clone(),
            special_slots,
            code_hashes,
            exec_seg_base: self.exec_seg_base,
            exec_seg_limit: self.exec_seg_limit,
            exec_seg_flags: self.exec_seg_flags,
        }
    }
}
