//! Discovery of nested bundles and loose Mach-O files.
//!
//! Bundles are found with an explicit worklist rather than recursion, so
//! the nesting depth limit is a plain counter. The result is grouped by
//! depth, deepest level first, which is the order they have to be signed in.

use super::info_plist::InfoPlist;
use crate::{Error, Result};
use goblin::mach::header::{MH_BUNDLE, MH_DYLIB, MH_EXECUTE};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM: u32 = 0xcefa_edfe;
const MH_CIGAM_64: u32 = 0xcffa_edfe;
const FAT_MAGIC: u32 = 0xcafe_babe;

/// Java class files share the fat magic; real universal binaries never
/// have this many architectures.
const MAX_FAT_ARCHES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleKind {
    App,
    AppExtension,
    Framework,
    Xpc,
}

impl BundleKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "app" => Some(BundleKind::App),
            "appex" => Some(BundleKind::AppExtension),
            "framework" => Some(BundleKind::Framework),
            "xpc" => Some(BundleKind::Xpc),
            _ => None,
        }
    }

    /// Bundles whose main executable carries entitlements.
    pub fn has_entitlements(self) -> bool {
        matches!(self, BundleKind::App | BundleKind::AppExtension)
    }
}

/// A bundle and the code that belongs directly to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleNode {
    pub path: PathBuf,
    pub kind: BundleKind,
    /// Nesting depth; the root bundle is 0.
    pub depth: usize,
    pub identifier: Option<String>,
    /// `CFBundleExecutable`, relative to the bundle.
    pub executable: Option<String>,
    /// Mach-O files of this bundle outside nested bundles, excluding the
    /// main executable.
    pub binaries: Vec<PathBuf>,
}

impl BundleNode {
    pub fn executable_path(&self) -> Option<PathBuf> {
        self.executable.as_ref().map(|e| self.path.join(e))
    }
}

/// True if the file starts with a Mach-O or universal binary magic.
pub fn is_macho(path: &Path) -> bool {
    macho_filetype(path).is_some()
}

/// True for Mach-O files that carry a signature of their own: executables,
/// dylibs and loadable bundles. Object files and dSYM companions have no
/// `__LINKEDIT` to sign.
pub fn is_signable(path: &Path) -> bool {
    matches!(macho_filetype(path), Some(MH_EXECUTE | MH_DYLIB | MH_BUNDLE))
}

/// `filetype` of a thin file, or of the first slice of a universal one.
fn macho_filetype(path: &Path) -> Option<u32> {
    let mut file = fs::File::open(path).ok()?;
    let mut header = [0u8; 16];
    file.read_exact(&mut header[..8]).ok()?;

    if be_word(&header, 0) == FAT_MAGIC {
        let count = be_word(&header, 4);
        if count == 0 || count >= MAX_FAT_ARCHES {
            return None;
        }
        // first fat_arch: cputype, cpusubtype, offset
        let mut arch = [0u8; 12];
        file.read_exact(&mut arch).ok()?;
        file.seek(SeekFrom::Start(u64::from(be_word(&arch, 8)))).ok()?;
        file.read_exact(&mut header[..8]).ok()?;
    }

    let swap = match be_word(&header, 0) {
        MH_MAGIC | MH_MAGIC_64 => false,
        MH_CIGAM | MH_CIGAM_64 => true,
        _ => return None,
    };
    file.read_exact(&mut header[8..]).ok()?;
    let filetype = be_word(&header, 12);
    Some(if swap { filetype.swap_bytes() } else { filetype })
}

fn be_word(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Finds all bundles under `root` (itself a bundle) and groups them by
/// depth, deepest first.
pub fn discover(root: &Path, max_depth: usize) -> Result<Vec<Vec<BundleNode>>> {
    let mut levels: BTreeMap<usize, Vec<BundleNode>> = BTreeMap::new();
    let mut worklist = vec![(root.to_path_buf(), 0usize)];

    while let Some((path, depth)) = worklist.pop() {
        if depth > max_depth {
            return Err(Error::Format(format!(
                "{} is nested deeper than {max_depth} bundles",
                path.display()
            )));
        }
        let kind = BundleKind::from_path(&path).unwrap_or(BundleKind::App);
        let info = InfoPlist::read_from_bundle(&path)?;
        let executable = info.as_ref().and_then(|i| i.executable()).map(str::to_string);
        let identifier = info
            .as_ref()
            .and_then(|i| i.bundle_identifier())
            .map(str::to_string);

        let mut binaries = Vec::new();
        let mut walk = WalkDir::new(&path).follow_links(false).min_depth(1).into_iter();
        while let Some(entry) = walk.next() {
            let entry = entry.map_err(std::io::Error::from)?;
            let file_type = entry.file_type();
            if file_type.is_dir() {
                if entry.path().extension().is_some_and(|e| e == "dSYM") {
                    walk.skip_current_dir();
                } else if BundleKind::from_path(entry.path()).is_some() {
                    worklist.push((entry.path().to_path_buf(), depth + 1));
                    walk.skip_current_dir();
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&path).ok();
            if relative.and_then(Path::to_str) == executable.as_deref() {
                continue;
            }
            if is_signable(entry.path()) {
                binaries.push(entry.path().to_path_buf());
            }
        }
        binaries.sort();

        log::debug!(
            "found {:?} bundle {} at depth {depth} ({} loose binaries)",
            kind,
            path.display(),
            binaries.len()
        );
        levels.entry(depth).or_default().push(BundleNode {
            path,
            kind,
            depth,
            identifier,
            executable,
            binaries,
        });
    }

    Ok(levels
        .into_values()
        .rev()
        .map(|mut level| {
            level.sort_by(|a, b| a.path.cmp(&b.path));
            level
        })
        .collect())
}
