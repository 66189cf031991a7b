//! Read-only inspection of embedded signatures.
//!
//! Checks here are structural: the SuperBlob parses, its blobs carry known
//! magics and a code directory is present. Page hashes can be recomputed with
//! [`verify_page_hashes`]; the CMS signature is not validated.

use super::code_directory::CodeDirectory;
use super::superblob::EmbeddedSignature;
use crate::macho::{FatBinary, MachOImage};
use crate::Result;
use std::path::Path;

/// Signature state of one architecture slice.
#[derive(Debug)]
pub struct SliceSignature {
    pub cputype: u32,
    /// `None` when the slice has no `LC_CODE_SIGNATURE`.
    pub signature: Option<Result<EmbeddedSignature>>,
}

impl SliceSignature {
    pub fn is_valid(&self) -> bool {
        matches!(self.signature, Some(Ok(_)))
    }
}

/// Parses the embedded signature of a slice, if it has one.
pub fn slice_signature(image: &MachOImage) -> Option<Result<EmbeddedSignature>> {
    let cs = image.code_signature()?;
    Some(match image.signature_data() {
        Some(blob) => EmbeddedSignature::parse(blob),
        None => Err(crate::Error::Format(format!(
            "signature at {:#x}+{:#x} lies outside the slice",
            cs.dataoff, cs.datasize
        ))),
    })
}

/// Inspects every slice of a binary.
pub fn inspect(bytes: &[u8]) -> Result<Vec<SliceSignature>> {
    let binary = FatBinary::parse(bytes.to_vec())?;
    Ok(binary
        .slices()
        .iter()
        .map(|image| SliceSignature {
            cputype: image.cputype(),
            signature: slice_signature(image),
        })
        .collect())
}

/// True if every slice of the file at `path` carries a well formed signature.
///
/// Fails only if the file cannot be read or is not a Mach-O binary.
pub fn check_signed(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;
    let slices = inspect(&data)?;
    let signed = slices.iter().all(SliceSignature::is_valid);
    log::debug!("{}: signed = {signed}", path.display());
    Ok(signed)
}

/// Recomputes the page hashes of every code directory in the slice and
/// compares them with the stored ones.
pub fn verify_page_hashes(image: &MachOImage) -> Result<bool> {
    let Some(signature) = slice_signature(image) else {
        return Ok(false);
    };
    let signature = signature?;
    let cds: Vec<CodeDirectory> = signature.code_directories()?;
    for cd in &cds {
        let limit = usize::try_from(cd.code_limit)
            .map_err(|_| crate::Error::Format("code limit exceeds address space".into()))?;
        let Some(code) = image.data().get(..limit) else {
            return Ok(false);
        };
        let pages: Vec<&[u8]> = if cd.page_size == 0 {
            vec![code]
        } else {
            code.chunks(cd.page_size).collect()
        };
        if pages.len() != cd.code_hashes.len() {
            return Ok(false);
        }
        if pages
            .iter()
            .zip(&cd.code_hashes)
            .any(|(page, hash)| &cd.digest.digest(page) != hash)
        {
            return Ok(false);
        }
    }
    Ok(!cds.is_empty())
}
