//! Embedded signature SuperBlob assembly and parsing.
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ magic 0xfade0cc0 | length | count  │
//! ├────────────────────────────────────┤
//! │ index: (slot, offset) * count      │
//! ├────────────────────────────────────┤
//! │ blob 0 | blob 1 | ...              │
//! └────────────────────────────────────┘
//! ```
//!
//! Every blob starts with its own big-endian magic and length.

use super::code_directory::CodeDirectory;
use super::constants::*;
use crate::{Error, Result};
use scroll::{Pread, BE};

pub(crate) const SUPERBLOB_HEADER_SIZE: usize = 12;
pub(crate) const INDEX_ENTRY_SIZE: usize = 8;
pub(crate) const BLOB_HEADER_SIZE: usize = 8;

/// A blob placed at a slot of the SuperBlob index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub slot_type: u32,
    /// Complete blob including its magic and length.
    pub data: Vec<u8>,
}

impl BlobEntry {
    pub fn new(slot_type: u32, data: Vec<u8>) -> Self {
        Self { slot_type, data }
    }

    pub fn magic(&self) -> u32 {
        self.data.pread_with(0, BE).unwrap_or_default()
    }

    /// Blob contents after the 8 byte header.
    pub fn payload(&self) -> &[u8] {
        self.data.get(BLOB_HEADER_SIZE..).unwrap_or_default()
    }
}

/// Serializes `entries` in the given order.
pub fn build_superblob(entries: &[BlobEntry]) -> Vec<u8> {
    let count = entries.len();
    let header_size = SUPERBLOB_HEADER_SIZE + count * INDEX_ENTRY_SIZE;
    let total_length = header_size + entries.iter().map(|e| e.data.len()).sum::<usize>();

    let mut buf = Vec::with_capacity(total_length);
    buf.extend(CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
    buf.extend((total_length as u32).to_be_bytes());
    buf.extend((count as u32).to_be_bytes());

    let mut offset = header_size;
    for entry in entries {
        buf.extend(entry.slot_type.to_be_bytes());
        buf.extend((offset as u32).to_be_bytes());
        offset += entry.data.len();
    }
    for entry in entries {
        buf.extend(&entry.data);
    }
    buf
}

/// Prefixes `payload` with a blob header.
pub fn wrap_blob(magic: u32, payload: &[u8]) -> Vec<u8> {
    let total_len = BLOB_HEADER_SIZE + payload.len();
    let mut buf = Vec::with_capacity(total_len);
    buf.extend(magic.to_be_bytes());
    buf.extend((total_len as u32).to_be_bytes());
    buf.extend(payload);
    buf
}

/// XML entitlements blob.
pub fn build_entitlements_blob(plist_xml: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, plist_xml)
}

/// DER entitlements blob.
pub fn build_der_entitlements_blob(der: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_EMBEDDED_DER_ENTITLEMENTS, der)
}

/// CMS signature wrapper; an empty payload marks an adhoc signature.
pub fn build_signature_blob(cms: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_BLOBWRAPPER, cms)
}

/// Assembles the standard components of an embedded signature.
///
/// Components are ordered by slot: primary code directory (0x0000),
/// requirements (0x0002), entitlements (0x0005), DER entitlements (0x0007),
/// alternate code directories (0x1000 onwards), CMS signature (0x10000).
#[derive(Debug, Default)]
pub struct SuperBlobBuilder {
    code_directories: Vec<Vec<u8>>,
    requirements: Option<Vec<u8>>,
    entitlements: Option<Vec<u8>>,
    der_entitlements: Option<Vec<u8>>,
    cms_signature: Option<Vec<u8>>,
}

impl SuperBlobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a serialized code directory. The first one is the primary.
    pub fn code_directory(mut self, cd: Vec<u8>) -> Self {
        self.code_directories.push(cd);
        self
    }

    /// Requirements blob; defaults to an empty requirement set.
    pub fn requirements(mut self, req: Vec<u8>) -> Self {
        self.requirements = Some(req);
        self
    }

    pub fn entitlements(mut self, ent: Vec<u8>) -> Self {
        self.entitlements = Some(ent);
        self
    }

    pub fn der_entitlements(mut self, der_ent: Vec<u8>) -> Self {
        self.der_entitlements = Some(der_ent);
        self
    }

    /// Complete CMS wrapper blob (see [`build_signature_blob`]).
    pub fn cms_signature(mut self, sig: Vec<u8>) -> Self {
        self.cms_signature = Some(sig);
        self
    }

    pub fn entries(self) -> Result<Vec<BlobEntry>> {
        let mut cds = self.code_directories.into_iter();
        let primary = cds
            .next()
            .ok_or_else(|| Error::Signing("signature needs a code directory".into()))?;
        let alternates: Vec<Vec<u8>> = cds.collect();
        if alternates.len() > CSSLOT_ALTERNATE_CODEDIRECTORY_MAX as usize {
            return Err(Error::Signing("too many alternate code directories".into()));
        }

        let mut entries = vec![BlobEntry::new(CSSLOT_CODEDIRECTORY, primary)];
        let requirements = self
            .requirements
            .unwrap_or_else(super::requirements::empty_requirements);
        entries.push(BlobEntry::new(CSSLOT_REQUIREMENTS, requirements));
        if let Some(ent) = self.entitlements {
            entries.push(BlobEntry::new(CSSLOT_ENTITLEMENTS, ent));
        }
        if let Some(der_ent) = self.der_entitlements {
            entries.push(BlobEntry::new(CSSLOT_DER_ENTITLEMENTS, der_ent));
        }
        for (i, cd) in alternates.into_iter().enumerate() {
            entries.push(BlobEntry::new(CSSLOT_ALTERNATE_CODEDIRECTORIES + i as u32, cd));
        }
        if let Some(sig) = self.cms_signature {
            entries.push(BlobEntry::new(CSSLOT_SIGNATURESLOT, sig));
        }
        Ok(entries)
    }

    pub fn build(self) -> Result<Vec<u8>> {
        Ok(build_superblob(&self.entries()?))
    }
}

/// A parsed embedded signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedSignature {
    entries: Vec<BlobEntry>,
}

impl EmbeddedSignature {
    /// Parses and structurally validates a SuperBlob.
    ///
    /// Trailing bytes after the declared length (padding up to the
    /// `LC_CODE_SIGNATURE` size) are ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let magic: u32 = data.pread_with(0, BE)?;
        if magic != CSMAGIC_EMBEDDED_SIGNATURE {
            return Err(Error::Format(format!("bad signature magic {magic:#x}")));
        }
        let length: u32 = data.pread_with(4, BE)?;
        let count: u32 = data.pread_with(8, BE)?;
        let length = length as usize;
        if length > data.len() || length < SUPERBLOB_HEADER_SIZE {
            return Err(Error::Format(format!(
                "signature length {length} inconsistent with {} available bytes",
                data.len()
            )));
        }
        let index_end = (count as usize)
            .checked_mul(INDEX_ENTRY_SIZE)
            .and_then(|n| n.checked_add(SUPERBLOB_HEADER_SIZE))
            .filter(|&end| end <= length)
            .ok_or_else(|| Error::Format(format!("signature index of {count} entries overruns blob")))?;

        let data = &data[..length];
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let base = SUPERBLOB_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            let slot_type: u32 = data.pread_with(base, BE)?;
            let offset: u32 = data.pread_with(base + 4, BE)?;
            let offset = offset as usize;
            if offset < index_end || offset + BLOB_HEADER_SIZE > length {
                return Err(Error::Format(format!("blob {i} offset {offset} outside signature")));
            }
            let blob_magic: u32 = data.pread_with(offset, BE)?;
            let blob_len: u32 = data.pread_with(offset + 4, BE)?;
            let blob_len = blob_len as usize;
            if !KNOWN_BLOB_MAGICS.contains(&blob_magic) {
                return Err(Error::Format(format!("unknown blob magic {blob_magic:#x} at slot {slot_type:#x}")));
            }
            if blob_len < BLOB_HEADER_SIZE || offset + blob_len > length {
                return Err(Error::Format(format!("blob {i} length {blob_len} overruns signature")));
            }
            entries.push(BlobEntry::new(slot_type, data[offset..offset + blob_len].to_vec()));
        }

        let signature = Self { entries };
        match signature.blob(CSSLOT_CODEDIRECTORY) {
            Some(cd) if cd.magic() == CSMAGIC_CODEDIRECTORY => Ok(signature),
            _ => Err(Error::Format("signature has no code directory".into())),
        }
    }

    pub fn entries(&self) -> &[BlobEntry] {
        &self.entries
    }

    pub fn blob(&self, slot: u32) -> Option<&BlobEntry> {
        self.entries.iter().find(|e| e.slot_type == slot)
    }

    /// Code directories, primary first.
    pub fn code_directories(&self) -> Result<Vec<CodeDirectory>> {
        self.entries
            .iter()
            .filter(|e| is_code_directory_slot(e.slot_type))
            .map(|e| CodeDirectory::parse(&e.data))
            .collect()
    }

    /// Raw blob of the code directory using `digest`, if present.
    pub fn code_directory_blob(&self, digest: super::DigestType) -> Option<&[u8]> {
        self.entries
            .iter()
            .filter(|e| is_code_directory_slot(e.slot_type))
            .find(|e| e.data.get(37) == Some(&digest.hash_type()))
            .map(|e| e.data.as_slice())
    }

    /// Entitlements plist (XML) embedded in the signature.
    pub fn entitlements(&self) -> Option<&[u8]> {
        self.blob(CSSLOT_ENTITLEMENTS).map(BlobEntry::payload)
    }

    pub fn der_entitlements(&self) -> Option<&[u8]> {
        self.blob(CSSLOT_DER_ENTITLEMENTS).map(BlobEntry::payload)
    }

    /// Complete requirements blob.
    pub fn requirements(&self) -> Option<&[u8]> {
        self.blob(CSSLOT_REQUIREMENTS).map(|e| e.data.as_slice())
    }

    /// CMS signature bytes; `None` for adhoc signatures.
    pub fn cms(&self) -> Option<&[u8]> {
        self.blob(CSSLOT_SIGNATURESLOT)
            .map(BlobEntry::payload)
            .filter(|p| !p.is_empty())
    }
}

fn is_code_directory_slot(slot: u32) -> bool {
    slot == CSSLOT_CODEDIRECTORY
        || (CSSLOT_ALTERNATE_CODEDIRECTORIES
            ..CSSLOT_ALTERNATE_CODEDIRECTORIES + CSSLOT_ALTERNATE_CODEDIRECTORY_MAX)
            .contains(&slot)
}
