//! `_CodeSignature/CodeResources` generation.
//!
//! CodeResources seals every file of a bundle except the main executable
//! (which carries its own signature) and the `_CodeSignature` directory.
//! Files inside nested bundles are sealed too, so nested code must be signed
//! before its parent's CodeResources is built.

use crate::Result;
use plist::{Dictionary, Value};
use rayon::prelude::*;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Relative location of the CodeResources file inside a bundle.
pub const CODE_RESOURCES_PATH: &str = "_CodeSignature/CodeResources";

const CODE_SIGNATURE_DIR: &str = "_CodeSignature";

/// Builder for a bundle's CodeResources plist.
pub struct CodeResourcesBuilder {
    bundle_path: PathBuf,
    files: BTreeMap<String, FileEntry>,
    main_executable: Option<String>,
}

struct FileEntry {
    sha1: [u8; 20],
    sha256: [u8; 32],
    /// Set for symlinks; the hashes then cover the target path.
    symlink_target: Option<String>,
}

impl FileEntry {
    fn for_content(data: &[u8]) -> Self {
        let (sha1, sha256) = hash_data(data);
        Self {
            sha1,
            sha256,
            symlink_target: None,
        }
    }
}

fn rule(weight: f64, optional: bool, omit: bool) -> Value {
    let mut dict = Dictionary::new();
    if omit {
        dict.insert("omit".to_string(), Value::Boolean(true));
    }
    if optional {
        dict.insert("optional".to_string(), Value::Boolean(true));
    }
    dict.insert("weight".to_string(), Value::Real(weight));
    Value::Dictionary(dict)
}

/// Legacy `rules`.
fn standard_rules() -> Dictionary {
    let mut rules = Dictionary::new();
    rules.insert("^.*".to_string(), Value::Boolean(true));
    rules.insert("^.*\\.lproj/".to_string(), rule(1000.0, true, false));
    rules.insert(
        "^.*\\.lproj/locversion.plist$".to_string(),
        rule(1100.0, false, true),
    );
    rules.insert("^Base\\.lproj/".to_string(), rule(1010.0, false, false));
    rules.insert("^version.plist$".to_string(), Value::Boolean(true));
    rules
}

/// `rules2`, which also governs `files2`.
fn standard_rules2() -> Dictionary {
    let mut rules2 = Dictionary::new();
    rules2.insert("^.*".to_string(), Value::Boolean(true));
    rules2.insert(".*\\.dSYM($|/)".to_string(), rule(11.0, false, false));
    rules2.insert("^(.*/)?\\.DS_Store$".to_string(), rule(2000.0, false, true));
    rules2.insert("^.*\\.lproj/".to_string(), rule(1000.0, true, false));
    rules2.insert(
        "^.*\\.lproj/locversion.plist$".to_string(),
        rule(1100.0, false, true),
    );
    rules2.insert("^Base\\.lproj/".to_string(), rule(1010.0, false, false));
    rules2.insert("^Info\\.plist$".to_string(), rule(20.0, false, true));
    rules2.insert("^PkgInfo$".to_string(), rule(20.0, false, true));
    rules2.insert(
        "^embedded\\.provisionprofile$".to_string(),
        rule(20.0, false, false),
    );
    rules2.insert("^version\\.plist$".to_string(), rule(20.0, false, false));
    rules2
}

/// SHA-1 and SHA-256 of `data`.
pub fn hash_data(data: &[u8]) -> ([u8; 20], [u8; 32]) {
    (Sha1::digest(data).into(), Sha256::digest(data).into())
}

impl CodeResourcesBuilder {
    /// `main_executable` is the bundle's `CFBundleExecutable`, relative to
    /// the bundle root.
    pub fn new(bundle_path: impl AsRef<Path>, main_executable: Option<&str>) -> Self {
        Self {
            bundle_path: bundle_path.as_ref().to_path_buf(),
            files: BTreeMap::new(),
            main_executable: main_executable.map(str::to_string),
        }
    }

    fn should_exclude(&self, relative_path: &str) -> bool {
        if relative_path == CODE_SIGNATURE_DIR
            || relative_path.starts_with(&format!("{CODE_SIGNATURE_DIR}/"))
        {
            return true;
        }
        self.main_executable.as_deref() == Some(relative_path)
    }

    /// Walks the bundle and hashes every file and symlink.
    pub fn scan(&mut self) -> Result<&mut Self> {
        let bundle_path = self.bundle_path.clone();

        let entries = WalkDir::new(&bundle_path)
            .follow_links(false)
            .into_iter()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(std::io::Error::from)?;

        let results = entries
            .par_iter()
            .filter(|entry| !entry.file_type().is_dir())
            .filter_map(|entry| {
                let relative = entry
                    .path()
                    .strip_prefix(&bundle_path)
                    .ok()?
                    .to_string_lossy()
                    .replace('\\', "/");
                if self.should_exclude(&relative) {
                    return None;
                }
                let hashed = if entry.path_is_symlink() {
                    hash_symlink(entry.path())
                } else {
                    fs::read(entry.path())
                        .map(|data| FileEntry::for_content(&data))
                        .map_err(Into::into)
                };
                Some(hashed.map(|file| (relative, file)))
            })
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "sealed {} files in {}",
            results.len(),
            bundle_path.display()
        );
        self.files.extend(results);
        Ok(self)
    }

    /// Adds a file by content, replacing a scanned entry with the same path.
    pub fn add_file(&mut self, relative_path: impl Into<String>, data: &[u8]) {
        self.files
            .insert(relative_path.into(), FileEntry::for_content(data));
    }

    /// Serializes the plist (XML).
    pub fn build(&self) -> Result<Vec<u8>> {
        // legacy dictionary: SHA-1 only, no symlinks
        let mut files = Dictionary::new();
        for (path, entry) in &self.files {
            if entry.symlink_target.is_some() {
                continue;
            }
            let hash = Value::Data(entry.sha1.to_vec());
            if path.contains(".lproj/") {
                let mut dict = Dictionary::new();
                dict.insert("hash".to_string(), hash);
                dict.insert("optional".to_string(), Value::Boolean(true));
                files.insert(path.clone(), Value::Dictionary(dict));
            } else {
                files.insert(path.clone(), hash);
            }
        }

        let mut files2 = Dictionary::new();
        for (path, entry) in &self.files {
            if path == "Info.plist" || path == "PkgInfo" || path.ends_with(".DS_Store") {
                continue;
            }
            let mut dict = Dictionary::new();
            match &entry.symlink_target {
                Some(target) => {
                    dict.insert("symlink".to_string(), Value::String(target.clone()));
                }
                None => {
                    dict.insert("hash".to_string(), Value::Data(entry.sha1.to_vec()));
                    dict.insert("hash2".to_string(), Value::Data(entry.sha256.to_vec()));
                }
            }
            if path.contains(".lproj/") {
                dict.insert("optional".to_string(), Value::Boolean(true));
            }
            files2.insert(path.clone(), Value::Dictionary(dict));
        }

        let mut root = Dictionary::new();
        root.insert("files".to_string(), Value::Dictionary(files));
        root.insert("files2".to_string(), Value::Dictionary(files2));
        root.insert("rules".to_string(), Value::Dictionary(standard_rules()));
        root.insert("rules2".to_string(), Value::Dictionary(standard_rules2()));

        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &Value::Dictionary(root))?;
        Ok(buf)
    }

    /// Sealed paths with their SHA-1 and SHA-256 hashes.
    pub fn files(&self) -> impl Iterator<Item = (&String, &[u8; 20], &[u8; 32])> {
        self.files
            .iter()
            .map(|(path, entry)| (path, &entry.sha1, &entry.sha256))
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

#[cfg(unix)]
fn hash_symlink(path: &Path) -> Result<FileEntry> {
    use std::os::unix::ffi::OsStrExt;

    let target = fs::read_link(path)?;
    let (sha1, sha256) = hash_data(target.as_os_str().as_bytes());
    Ok(FileEntry {
        sha1,
        sha256,
        symlink_target: Some(target.to_string_lossy().into_owned()),
    })
}

#[cfg(not(unix))]
fn hash_symlink(path: &Path) -> Result<FileEntry> {
    let target = fs::read_link(path)?;
    let target = target.to_string_lossy().replace('\\', "/");
    let (sha1, sha256) = hash_data(target.as_bytes());
    Ok(FileEntry {
        sha1,
        sha256,
        symlink_target: Some(target),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(data: &[u8]) -> Dictionary {
        Value::from_reader(std::io::Cursor::new(data))
            .unwrap()
            .into_dictionary()
            .unwrap()
    }

    #[test]
    fn test_hash_data() {
        let (sha1, sha256) = hash_data(b"abc");
        assert_eq!(sha1[..4], [0xa9, 0x99, 0x3e, 0x36]);
        assert_eq!(sha256[..4], [0xba, 0x78, 0x16, 0xbf]);
    }

    #[test]
    fn test_build_plist_structure() {
        let builder = CodeResourcesBuilder::new("/fake/path", None);
        let root = parse(&builder.build().unwrap());
        for key in ["files", "files2", "rules", "rules2"] {
            assert!(root.contains_key(key), "{key}");
        }
    }

    #[test]
    fn test_scan_bundle_directory() {
        let temp_dir = tempdir().unwrap();
        let bundle = temp_dir.path().join("Test.app");
        fs::create_dir_all(bundle.join("Resources")).unwrap();
        fs::create_dir_all(bundle.join("_CodeSignature")).unwrap();
        fs::write(bundle.join("Info.plist"), b"<plist></plist>").unwrap();
        fs::write(bundle.join("PkgInfo"), b"APPL????").unwrap();
        fs::write(bundle.join("Test"), b"main binary").unwrap();
        fs::write(bundle.join("Resources/icon.png"), b"png").unwrap();
        fs::write(bundle.join("_CodeSignature/CodeResources"), b"old").unwrap();

        let mut builder = CodeResourcesBuilder::new(&bundle, Some("Test"));
        builder.scan().unwrap();

        let paths: Vec<&String> = builder.files().map(|(p, _, _)| p).collect();
        assert_eq!(paths, ["Info.plist", "PkgInfo", "Resources/icon.png"]);

        let root = parse(&builder.build().unwrap());
        let files2 = root.get("files2").and_then(Value::as_dictionary).unwrap();
        assert!(!files2.contains_key("Info.plist"));
        assert!(!files2.contains_key("PkgInfo"));
        let icon = files2
            .get("Resources/icon.png")
            .and_then(Value::as_dictionary)
            .unwrap();
        assert_eq!(
            icon.get("hash2").and_then(Value::as_data).unwrap(),
            hash_data(b"png").1
        );
        let files = root.get("files").and_then(Value::as_dictionary).unwrap();
        assert!(files.contains_key("Info.plist"));
    }

    #[test]
    fn test_nested_bundle_files_are_sealed() {
        let temp_dir = tempdir().unwrap();
        let bundle = temp_dir.path().join("Test.app");
        let framework = bundle.join("Frameworks/Kit.framework");
        fs::create_dir_all(framework.join("_CodeSignature")).unwrap();
        fs::write(framework.join("Kit"), b"framework binary").unwrap();
        fs::write(framework.join("_CodeSignature/CodeResources"), b"inner").unwrap();

        let mut builder = CodeResourcesBuilder::new(&bundle, None);
        builder.scan().unwrap();

        let paths: Vec<&String> = builder.files().map(|(p, _, _)| p).collect();
        assert!(paths.contains(&&"Frameworks/Kit.framework/Kit".to_string()));
        assert!(paths.contains(&&"Frameworks/Kit.framework/_CodeSignature/CodeResources".to_string()));
    }

    #[test]
    fn test_lproj_optional() {
        let mut builder = CodeResourcesBuilder::new("/fake", None);
        builder.add_file("en.lproj/Main.strings", b"x");
        let root = parse(&builder.build().unwrap());
        let entry = root
            .get("files2")
            .and_then(Value::as_dictionary)
            .and_then(|d| d.get("en.lproj/Main.strings"))
            .and_then(Value::as_dictionary)
            .unwrap();
        assert_eq!(entry.get("optional").and_then(Value::as_boolean), Some(true));
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks() {
        use std::os::unix::fs::symlink;

        let temp_dir = tempdir().unwrap();
        let bundle = temp_dir.path().join("Test.app");
        fs::create_dir_all(&bundle).unwrap();
        fs::write(bundle.join("Real.txt"), b"content").unwrap();
        symlink("Real.txt", bundle.join("Link.txt")).unwrap();

        let mut builder = CodeResourcesBuilder::new(&bundle, None);
        builder.scan().unwrap();
        let root = parse(&builder.build().unwrap());

        let files = root.get("files").and_then(Value::as_dictionary).unwrap();
        assert!(!files.contains_key("Link.txt"));
        let link = root
            .get("files2")
            .and_then(Value::as_dictionary)
            .and_then(|d| d.get("Link.txt"))
            .and_then(Value::as_dictionary)
            .unwrap();
        assert_eq!(link.get("symlink").and_then(Value::as_string), Some("Real.txt"));
    }
}
