//! Dylib load command editing.
//!
//! All edits go through [`FatBinary::edit_slices`], so a universal binary is
//! either changed in every slice or not at all. Any edit that changes the
//! command list strips the existing signature, since the page hashes would no
//! longer match.

use super::load_command::{DylibKind, LoadCommand};
use super::parser::{FatBinary, MachOImage};
use crate::codesign::superblob::EmbeddedSignature;
use crate::{Error, Result};
use std::collections::HashSet;

/// Edits the dylib load commands of a binary.
pub struct LoadCommandEditor<'a> {
    binary: &'a mut FatBinary,
}

impl<'a> LoadCommandEditor<'a> {
    pub fn new(binary: &'a mut FatBinary) -> Self {
        Self { binary }
    }

    /// True if every slice carries a code signature whose blob parses.
    pub fn is_signed(&self) -> bool {
        self.binary.slices().iter().all(slice_is_signed)
    }

    /// Appends a dylib load command to every slice.
    ///
    /// A path that is already loaded is left alone. Returns whether the
    /// binary changed.
    pub fn inject(&mut self, path: &str, weak: bool) -> Result<bool> {
        if path.is_empty() {
            return Err(Error::Config("dylib path must not be empty".into()));
        }
        let kind = if weak { DylibKind::Weak } else { DylibKind::Load };
        let changed = self.binary.edit_slices(|image| {
            let (endian, is_64) = (image.endian(), image.is_64());
            apply(image, |commands| {
                if commands.iter().any(|c| c.as_dylib().is_some_and(|d| d.path == path)) {
                    return Ok(None);
                }
                let mut commands = commands.to_vec();
                commands.push(LoadCommand::new_dylib(kind, path, endian, is_64)?);
                Ok(Some(commands))
            })
        })?;
        if changed {
            log::debug!("injected {path} (weak: {weak})");
        }
        Ok(changed)
    }

    /// Removes every dylib load command whose path is in `paths`.
    ///
    /// Paths that are not loaded are ignored.
    pub fn remove<S: AsRef<str>>(&mut self, paths: &[S]) -> Result<bool> {
        let targets: HashSet<&str> = paths.iter().map(AsRef::as_ref).collect();
        if targets.is_empty() {
            return Ok(false);
        }
        let changed = self.binary.edit_slices(|image| {
            apply(image, |commands| {
                let kept: Vec<LoadCommand> = commands
                    .iter()
                    .filter(|c| !c.as_dylib().is_some_and(|d| targets.contains(d.path.as_str())))
                    .cloned()
                    .collect();
                Ok((kept.len() != commands.len()).then_some(kept))
            })
        })?;
        if changed {
            log::debug!("removed dylibs {:?}", targets);
        }
        Ok(changed)
    }

    /// Dylib paths of the first slice in load order.
    pub fn list(&self) -> Vec<String> {
        self.binary
            .slices()
            .first()
            .map(|image| dylib_paths(image).map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// Replaces `old` with `new` in every matching dylib load command.
    ///
    /// Fails with [`Error::NotFound`] if no slice loads `old`.
    pub fn rewrite(&mut self, old: &str, new: &str) -> Result<bool> {
        if new.is_empty() {
            return Err(Error::Config("dylib path must not be empty".into()));
        }
        let found = self
            .binary
            .slices()
            .iter()
            .any(|image| dylib_paths(image).any(|p| p == old));
        if !found {
            return Err(Error::NotFound(old.to_string()));
        }
        if old == new {
            return Ok(false);
        }

        let changed = self.binary.edit_slices(|image| {
            let (endian, is_64) = (image.endian(), image.is_64());
            apply(image, |commands| {
                let mut matched = false;
                let mut out = Vec::with_capacity(commands.len());
                for cmd in commands {
                    match cmd.as_dylib() {
                        Some(d) if d.path == old => {
                            matched = true;
                            out.push(cmd.with_dylib_path(new, endian, is_64)?);
                        }
                        _ => out.push(cmd.clone()),
                    }
                }
                Ok(matched.then_some(out))
            })
        })?;
        if changed {
            log::debug!("rewrote {old} -> {new}");
        }
        Ok(changed)
    }
}

fn dylib_paths(image: &MachOImage) -> impl Iterator<Item = &str> {
    image
        .commands()
        .iter()
        .filter_map(|c| c.as_dylib().map(|d| d.path.as_str()))
}

fn slice_is_signed(image: &MachOImage) -> bool {
    image
        .signature_data()
        .is_some_and(|blob| EmbeddedSignature::parse(blob).is_ok())
}

/// Runs `edit` over the command list and commits its result.
///
/// `edit` returns `None` when there is nothing to change. Otherwise the
/// signature is stripped first and `edit` is applied again to the stripped
/// command list, so `__LINKEDIT` reflects the removal.
fn apply<F>(image: &mut MachOImage, edit: F) -> Result<bool>
where
    F: Fn(&[LoadCommand]) -> Result<Option<Vec<LoadCommand>>>,
{
    if edit(image.commands())?.is_none() {
        return Ok(false);
    }
    image.strip_signature()?;
    match edit(image.commands())? {
        Some(commands) => image.commit_commands(commands)?,
        None => return Ok(true),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::testutil::{fat, thin_arm64, ThinImage};

    fn universal() -> FatBinary {
        FatBinary::parse(fat(&[thin_arm64(), ThinImage::new().x86_64().build()])).unwrap()
    }

    #[test]
    fn test_list_order() {
        let mut bin =
            FatBinary::parse(ThinImage::new().with_dylib("@rpath/Foo.framework/Foo").build())
                .unwrap();
        let editor = LoadCommandEditor::new(&mut bin);
        assert_eq!(
            editor.list(),
            vec!["/usr/lib/libSystem.B.dylib", "@rpath/Foo.framework/Foo"]
        );
    }

    #[test]
    fn test_inject_no_duplicates() {
        let mut bin = universal();
        let mut editor = LoadCommandEditor::new(&mut bin);
        assert!(editor.inject("@rpath/Tweak.dylib", true).unwrap());
        assert!(!editor.inject("@rpath/Tweak.dylib", true).unwrap());
        let paths = editor.list();
        assert_eq!(paths.iter().filter(|p| *p == "@rpath/Tweak.dylib").count(), 1);

        for slice in bin.slices() {
            let last = slice.commands().last().unwrap().as_dylib().unwrap();
            assert_eq!(last.kind, DylibKind::Weak);
        }
        // still parses after serialization
        let reparsed = FatBinary::parse(bin.serialize()).unwrap();
        assert_eq!(reparsed.slices(), bin.slices());
    }

    #[test]
    fn test_non_utf8_dylib_passes_through() {
        let mut data = ThinImage::new().with_dylib("/usr/lib/libX.dylib").build();
        let at = data
            .windows(13)
            .position(|w| w == b"/usr/lib/libX")
            .unwrap()
            + 12;
        data[at] = 0xff;

        let mut bin = FatBinary::parse(data).unwrap();
        let mut editor = LoadCommandEditor::new(&mut bin);
        assert!(editor.list().contains(&"/usr/lib/lib\u{fffd}.dylib".to_string()));
        assert!(editor.inject("@rpath/Tweak.dylib", false).unwrap());

        let out = bin.serialize();
        assert_eq!(out[at], 0xff);
        assert_eq!(&out[at - 12..at], b"/usr/lib/lib");
    }

    #[test]
    fn test_inject_no_space_is_transactional() {
        let data = fat(&[thin_arm64(), ThinImage::new().x86_64().tight().build()]);
        let mut bin = FatBinary::parse(data.clone()).unwrap();
        let err = LoadCommandEditor::new(&mut bin)
            .inject("@rpath/Tweak.dylib", false)
            .unwrap_err();
        assert!(matches!(err, Error::NoSpace { .. }));
        assert_eq!(bin.serialize(), data);
    }

    #[test]
    fn test_remove_idempotent() {
        let mut bin =
            FatBinary::parse(ThinImage::new().with_dylib("@rpath/A.dylib").build()).unwrap();
        let mut editor = LoadCommandEditor::new(&mut bin);
        assert!(editor.remove(&["@rpath/A.dylib", "@rpath/Missing.dylib"]).unwrap());
        let once = bin.serialize();

        let mut editor = LoadCommandEditor::new(&mut bin);
        assert!(!editor.remove(&["@rpath/A.dylib"]).unwrap());
        assert!(!editor.remove::<&str>(&[]).unwrap());
        assert_eq!(bin.serialize(), once);
        assert_eq!(LoadCommandEditor::new(&mut bin).list(), vec!["/usr/lib/libSystem.B.dylib"]);
    }

    #[test]
    fn test_rewrite() {
        let mut bin = universal();
        let mut editor = LoadCommandEditor::new(&mut bin);
        editor
            .rewrite("/usr/lib/libSystem.B.dylib", "@rpath/libSystem.dylib")
            .unwrap();
        assert_eq!(editor.list(), vec!["@rpath/libSystem.dylib"]);
        let dylib = bin.slices()[1].commands()
            .iter()
            .find_map(LoadCommand::as_dylib)
            .unwrap();
        assert_eq!(dylib.current_version, 0x0505_0000);
    }

    #[test]
    fn test_rewrite_not_found_leaves_binary() {
        let data = thin_arm64();
        let mut bin = FatBinary::parse(data.clone()).unwrap();
        let err = LoadCommandEditor::new(&mut bin)
            .rewrite("@rpath/Nope.dylib", "@rpath/Other.dylib")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(p) if p == "@rpath/Nope.dylib"));
        assert_eq!(bin.serialize(), data);
    }

    #[test]
    fn test_edit_strips_signature() {
        let mut bin = FatBinary::parse(thin_arm64()).unwrap();
        bin.slices_mut()[0].reserve_signature(0x40).unwrap();
        assert!(bin.slices()[0].code_signature().is_some());

        LoadCommandEditor::new(&mut bin).inject("@rpath/B.dylib", false).unwrap();
        let image = &bin.slices()[0];
        assert!(image.code_signature().is_none());
        assert_eq!(image.data().len(), ThinImage::LINKEDIT_OFFSET + ThinImage::LINKEDIT_SIZE);
        assert!(!LoadCommandEditor::new(&mut bin).is_signed());
    }
}
