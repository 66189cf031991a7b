//! Tunables shared by every signing operation.

use crate::codesign::constants::PAGE_SIZE;
use crate::codesign::DigestType;
use crate::{Error, Result};

const MIN_PAGE_SIZE: usize = 512;
const MAX_PAGE_SIZE: usize = 65536;
const DEFAULT_MAX_DEPTH: usize = 16;

/// Signing configuration.
///
/// ```
/// use machsign::{codesign::DigestType, SigningSettings};
///
/// let settings = SigningSettings::default()
///     .digests(vec![DigestType::Sha256])
///     .workers(2);
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningSettings {
    digests: Vec<DigestType>,
    page_size: usize,
    max_depth: usize,
    workers: Option<usize>,
    der_entitlements: bool,
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            digests: vec![DigestType::Sha1, DigestType::Sha256],
            page_size: PAGE_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
            workers: None,
            der_entitlements: true,
        }
    }
}

impl SigningSettings {
    /// Code directory digests. The first is the primary code directory,
    /// the rest become alternates.
    pub fn digests(mut self, digests: Vec<DigestType>) -> Self {
        self.digests = digests;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Deepest bundle nesting that will be walked.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Threads used to sign binaries of one nesting level.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn der_entitlements(mut self, enabled: bool) -> Self {
        self.der_entitlements = enabled;
        self
    }

    pub fn digest_types(&self) -> &[DigestType] {
        &self.digests
    }

    pub fn page_size_bytes(&self) -> usize {
        self.page_size
    }

    pub fn max_nesting_depth(&self) -> usize {
        self.max_depth
    }

    pub fn worker_count(&self) -> Option<usize> {
        self.workers
    }

    pub fn emit_der_entitlements(&self) -> bool {
        self.der_entitlements
    }

    pub fn validate(&self) -> Result<()> {
        if self.digests.is_empty() {
            return Err(Error::Config("at least one digest is required".into()));
        }
        let alternates = self.digests.len() - 1;
        if alternates > crate::codesign::constants::CSSLOT_ALTERNATE_CODEDIRECTORY_MAX as usize {
            return Err(Error::Config(format!(
                "{} digests given, at most {} alternates are supported",
                self.digests.len(),
                crate::codesign::constants::CSSLOT_ALTERNATE_CODEDIRECTORY_MAX
            )));
        }
        for (i, d) in self.digests.iter().enumerate() {
            if self.digests[..i].contains(d) {
                return Err(Error::Config(format!("digest {d} listed twice")));
            }
        }
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(Error::Config(format!(
                "page size {} must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.max_depth == 0 {
            return Err(Error::Config("nesting depth must be at least 1".into()));
        }
        if self.workers == Some(0) {
            return Err(Error::Config("worker count must be at least 1".into()));
        }
        Ok(())
    }
}
