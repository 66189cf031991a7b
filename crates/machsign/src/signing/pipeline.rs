//! Bundle signing state machine.
//!
//! A run moves through [`Stage`]s in order. All work happens on a staged
//! copy next to the input; the input itself is only touched by the final
//! swap, so a failed or cancelled run leaves it as it was.
//!
//! Nested code is signed innermost first. For every nesting level the
//! hashing, signing and embedding stages run across the level's bundles on
//! a rayon pool, and the level is fully written before the next outer level
//! is hashed. That way each bundle's `CodeResources` seals the final bytes of
//! everything nested inside it.

use super::request::SigningRequest;
use crate::bundle::code_resources::CODE_RESOURCES_PATH;
use crate::bundle::info_plist::{InfoPlist, INFO_PLIST};
use crate::bundle::walker::{self, BundleNode};
use crate::bundle::CodeResourcesBuilder;
use crate::codesign::inspector::slice_signature;
use crate::crypto::{Identity, ProvisioningProfile};
use crate::error::ErrorKind;
use crate::macho::writer::write_file_atomic;
use crate::macho::{sign_binary, FatBinary, SigningMaterial};
use crate::settings::SigningSettings;
use crate::task::CancellationToken;
use crate::{Error, Result};
use plist::{Dictionary, Value};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

const EMBEDDED_PROFILE: &str = "embedded.mobileprovision";
const CODE_SIGNATURE_DIR: &str = "_CodeSignature";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Staging,
    Preparing,
    Rewriting,
    Hashing,
    Signing,
    Embedding,
    Done,
    Failed(ErrorKind),
}

/// One signing run. Owns its request, so the identity is released when the
/// pipeline is dropped.
#[derive(Debug)]
pub struct Pipeline {
    request: SigningRequest,
    token: CancellationToken,
    stage: Stage,
}

/// Code staged for signing.
struct Staged {
    dir: TempDir,
    root: PathBuf,
    layout: Layout,
}

enum Layout {
    /// Bundles grouped by nesting level, innermost first.
    Bundle(Vec<Vec<Unit>>),
    Single(SingleFile),
}

struct Unit {
    node: BundleNode,
    entitlements: Option<Dictionary>,
}

#[derive(Default)]
struct SingleFile {
    identifier: String,
    entitlements: Option<Dictionary>,
    main_executable: bool,
}

/// A bundle whose nested code is signed and whose resources are sealed.
struct Sealed<'u> {
    unit: &'u Unit,
    code_resources: Vec<u8>,
}

/// A sealed bundle with its main executable signed in memory.
struct Signed<'u> {
    unit: &'u Unit,
    code_resources: Vec<u8>,
    executable: Option<(PathBuf, FatBinary)>,
}

/// Per-run signing parameters shared by every binary.
struct Signer<'a> {
    identity: Option<&'a Identity>,
    team_id: Option<String>,
    settings: &'a SigningSettings,
    token: &'a CancellationToken,
}

impl Pipeline {
    pub fn new(request: SigningRequest, token: CancellationToken) -> Self {
        Self {
            request,
            token,
            stage: Stage::Staging,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Runs every stage. On error the pipeline ends in `Failed` and the
    /// staged copy is discarded.
    pub fn run(&mut self) -> Result<()> {
        let result = execute(&self.request, &self.token, &mut self.stage);
        match &result {
            Ok(()) => {
                log::info!(
                    "signed {} ({})",
                    self.request.path().display(),
                    if self.request.is_adhoc() { "adhoc" } else { "certificate" }
                );
            }
            Err(e) => {
                log::debug!("{:?} -> Failed({:?}): {e}", self.stage, e.kind());
                self.stage = Stage::Failed(e.kind());
            }
        }
        result
    }
}

fn enter(stage: &mut Stage, next: Stage, token: &CancellationToken) -> Result<()> {
    token.check()?;
    log::debug!("{stage:?} -> {next:?}");
    *stage = next;
    Ok(())
}

fn execute(request: &SigningRequest, token: &CancellationToken, stage: &mut Stage) -> Result<()> {
    *stage = Stage::Staging;
    token.check()?;
    request.validate()?;
    let mut staged = stage_input(request)?;

    enter(stage, Stage::Preparing, token)?;
    let identity = request.signing_identity()?;
    if let (Some(identity), Some(profile)) = (identity, &request.profile) {
        check_profile(identity, profile)?;
    }
    let team_id = identity
        .and_then(Identity::team_id)
        .or_else(|| request.profile.as_ref().and_then(ProvisioningProfile::team_identifier))
        .map(str::to_string);
    prepare(request, &mut staged)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(request.settings.worker_count().unwrap_or(0))
        .thread_name(|i| format!("machsign-{i}"))
        .build()
        .map_err(|e| Error::Signing(format!("cannot start worker pool: {e}")))?;

    enter(stage, Stage::Rewriting, token)?;
    rewrite(request, &staged, &pool)?;

    let signer = Signer {
        identity,
        team_id,
        settings: &request.settings,
        token,
    };
    match &staged.layout {
        Layout::Bundle(levels) => {
            for level in levels {
                enter(stage, Stage::Hashing, token)?;
                let sealed = pool.install(|| {
                    level
                        .par_iter()
                        .map(|unit| signer.seal(unit))
                        .collect::<Result<Vec<_>>>()
                })?;

                enter(stage, Stage::Signing, token)?;
                let signed = pool.install(|| {
                    sealed
                        .into_par_iter()
                        .map(|sealed| signer.sign_main(sealed))
                        .collect::<Result<Vec<_>>>()
                })?;

                enter(stage, Stage::Embedding, token)?;
                pool.install(|| signed.par_iter().try_for_each(|s| signer.embed(s)))?;
            }
        }
        Layout::Single(single) => {
            enter(stage, Stage::Hashing, token)?;
            let mut binary = FatBinary::open(&staged.root)?;

            enter(stage, Stage::Signing, token)?;
            let material = SigningMaterial {
                entitlements: single.entitlements.as_ref(),
                main_executable: single.main_executable,
                ..signer.material(&single.identifier)
            };
            sign_binary(&mut binary, &material)?;

            enter(stage, Stage::Embedding, token)?;
            binary.write_atomic(&staged.root)?;
        }
    }

    token.check()?;
    commit(staged, request.path())?;
    log::debug!("{stage:?} -> {:?}", Stage::Done);
    *stage = Stage::Done;
    Ok(())
}

/// Copies the input next to itself and discovers the code to sign.
fn stage_input(request: &SigningRequest) -> Result<Staged> {
    let source = request.path();
    let name = source
        .file_name()
        .ok_or_else(|| Error::Config(format!("{} has no file name", source.display())))?;
    let parent = source
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let dir = tempfile::Builder::new()
        .prefix(".machsign-stage-")
        .tempdir_in(parent)?;
    let root = dir.path().join(name);

    let layout = if fs::symlink_metadata(source)?.is_dir() {
        copy_tree(source, &root)?;
        let levels = walker::discover(&root, request.settings.max_nesting_depth())?;
        Layout::Bundle(
            levels
                .into_iter()
                .map(|level| {
                    level
                        .into_iter()
                        .map(|node| Unit {
                            node,
                            entitlements: None,
                        })
                        .collect()
                })
                .collect(),
        )
    } else {
        fs::copy(source, &root)?;
        Layout::Single(SingleFile::default())
    };
    log::debug!("staged {} at {}", source.display(), root.display());
    Ok(Staged { dir, root, layout })
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| Error::Format(e.to_string()))?;
        let target = to.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    std::os::unix::fs::symlink(fs::read_link(from)?, to)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to)?;
    Ok(())
}

/// The identity must be one of the profile's developer certificates and
/// belong to the profile's team.
fn check_profile(identity: &Identity, profile: &ProvisioningProfile) -> Result<()> {
    let profile_name = profile.name.as_deref().unwrap_or("provisioning profile");
    if !profile.contains_certificate(identity.certificate_der()) {
        return Err(Error::ProfileMismatch(format!(
            "certificate {} is not listed in {profile_name}",
            identity.common_name().unwrap_or_default()
        )));
    }
    if let (Some(cert_team), Some(profile_team)) = (identity.team_id(), profile.team_identifier())
    {
        if cert_team != profile_team {
            return Err(Error::ProfileMismatch(format!(
                "certificate team {cert_team} differs from {profile_name} team {profile_team}"
            )));
        }
    }
    Ok(())
}

/// Resolves entitlements and applies Info.plist overrides on the staged copy.
fn prepare(request: &SigningRequest, staged: &mut Staged) -> Result<()> {
    let preferred = request
        .entitlements
        .clone()
        .or_else(|| request.profile.as_ref().map(|p| p.entitlements.clone()));

    match &mut staged.layout {
        Layout::Bundle(levels) => {
            for unit in levels.iter_mut().flatten() {
                let Some(executable) = unit.node.executable_path() else {
                    continue;
                };
                if !executable.is_file() {
                    return Err(Error::Format(format!(
                        "main executable {} is missing",
                        executable.display()
                    )));
                }
                if unit.node.kind.has_entitlements() {
                    unit.entitlements = match &preferred {
                        Some(dict) => Some(dict.clone()),
                        None => embedded_entitlements(&executable)?,
                    };
                }
            }
            apply_overrides(request, levels)
        }
        Layout::Single(single) => {
            let binary = FatBinary::open(&staged.root)?;
            single.main_executable = binary.slices().iter().any(|s| s.is_executable());
            single.identifier = match &request.identifier {
                Some(id) => id.clone(),
                None => file_identifier(&staged.root),
            };
            if single.main_executable {
                single.entitlements = match preferred {
                    Some(dict) => Some(dict),
                    None => embedded_entitlements(&staged.root)?,
                };
            }
            Ok(())
        }
    }
}

fn apply_overrides(request: &SigningRequest, levels: &mut [Vec<Unit>]) -> Result<()> {
    let old_identifier = levels
        .last()
        .and_then(|root| root.first())
        .and_then(|unit| unit.node.identifier.clone());

    for unit in levels.iter_mut().flatten() {
        let node = &mut unit.node;
        let Some(mut info) = InfoPlist::read_from_bundle(&node.path)? else {
            continue;
        };
        let mut changed = false;
        if node.depth == 0 {
            if let Some(id) = &request.identifier {
                info.set_bundle_identifier(id);
                changed = true;
            }
            if let Some(name) = &request.display_name {
                info.set_display_name(name);
                changed = true;
            }
            if let Some(version) = &request.version {
                info.set_version(version);
                changed = true;
            }
        } else if let (Some(old), Some(new)) = (&old_identifier, &request.identifier) {
            changed = info.replace_identifier_prefix(old, new);
        }
        if changed {
            info.write_to_bundle(&node.path)?;
            node.identifier = info.bundle_identifier().map(str::to_string);
            log::debug!(
                "updated {} of {}",
                INFO_PLIST,
                node.path.display()
            );
        }
    }
    Ok(())
}

/// Entitlements embedded in the first slice's signature, if any.
fn embedded_entitlements(path: &Path) -> Result<Option<Dictionary>> {
    let binary = FatBinary::open(path)?;
    let Some(Ok(signature)) = binary.slices().first().and_then(slice_signature) else {
        return Ok(None);
    };
    let Some(xml) = signature.entitlements() else {
        return Ok(None);
    };
    match Value::from_reader(Cursor::new(xml)) {
        Ok(Value::Dictionary(dict)) => Ok(Some(dict)),
        _ => {
            log::warn!("ignoring unreadable entitlements in {}", path.display());
            Ok(None)
        }
    }
}

fn file_identifier(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Removes old signatures and signature directories, then installs or
/// removes the embedded profile.
fn rewrite(request: &SigningRequest, staged: &Staged, pool: &ThreadPool) -> Result<()> {
    let Layout::Bundle(levels) = &staged.layout else {
        return strip_file(&staged.root);
    };

    let binaries: Vec<PathBuf> = levels
        .iter()
        .flatten()
        .flat_map(|unit| {
            unit.node
                .binaries
                .iter()
                .cloned()
                .chain(unit.node.executable_path())
        })
        .collect();
    pool.install(|| binaries.par_iter().try_for_each(|path| strip_file(path)))?;

    for unit in levels.iter().flatten() {
        let signature_dir = unit.node.path.join(CODE_SIGNATURE_DIR);
        if signature_dir.is_dir() {
            fs::remove_dir_all(&signature_dir)?;
        }
    }

    let embedded = staged.root.join(EMBEDDED_PROFILE);
    if request.remove_provision {
        if embedded.exists() {
            fs::remove_file(&embedded)?;
            log::debug!("removed {EMBEDDED_PROFILE}");
        }
    } else if let Some(profile) = &request.profile {
        fs::write(&embedded, profile.raw())?;
        log::debug!("installed {EMBEDDED_PROFILE}");
    }
    Ok(())
}

fn strip_file(path: &Path) -> Result<()> {
    let mut binary = FatBinary::open(path)?;
    if binary.edit_slices(|image| image.strip_signature())? {
        binary.write_atomic(path)?;
        log::debug!("stripped signature from {}", path.display());
    }
    Ok(())
}

impl<'a> Signer<'a> {
    fn material<'m>(&'m self, identifier: &'m str) -> SigningMaterial<'m> {
        SigningMaterial {
            team_id: self.team_id.as_deref(),
            identity: self.identity,
            ..SigningMaterial::new(identifier, self.settings)
        }
    }

    /// Signs and writes the bundle's loose binaries, then seals its resources.
    fn seal<'u>(&self, unit: &'u Unit) -> Result<Sealed<'u>> {
        unit.node.binaries.par_iter().try_for_each(|path| {
            let mut binary = FatBinary::open(path)?;
            let identifier = file_identifier(path);
            sign_binary(&mut binary, &self.material(&identifier))?;
            self.token.check()?;
            binary.write_atomic(path)
        })?;

        let mut builder = CodeResourcesBuilder::new(&unit.node.path, unit.node.executable.as_deref());
        builder.scan()?;
        Ok(Sealed {
            unit,
            code_resources: builder.build()?,
        })
    }

    /// Signs the main executable in memory with the sealed resources.
    fn sign_main<'u>(&self, sealed: Sealed<'u>) -> Result<Signed<'u>> {
        let node = &sealed.unit.node;
        let Some(path) = node.executable_path() else {
            return Ok(Signed {
                unit: sealed.unit,
                code_resources: sealed.code_resources,
                executable: None,
            });
        };

        let info_plist = match fs::read(node.path.join(INFO_PLIST)) {
            Ok(data) => Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let identifier = node
            .identifier
            .clone()
            .unwrap_or_else(|| file_identifier(&path));

        let mut binary = FatBinary::open(&path)?;
        let material = SigningMaterial {
            entitlements: sealed.unit.entitlements.as_ref(),
            info_plist: info_plist.as_deref(),
            code_resources: Some(&sealed.code_resources),
            main_executable: true,
            ..self.material(&identifier)
        };
        sign_binary(&mut binary, &material)?;
        Ok(Signed {
            unit: sealed.unit,
            code_resources: sealed.code_resources,
            executable: Some((path, binary)),
        })
    }

    fn embed(&self, signed: &Signed<'_>) -> Result<()> {
        self.token.check()?;
        let resources = signed.unit.node.path.join(CODE_RESOURCES_PATH);
        if let Some(dir) = resources.parent() {
            fs::create_dir_all(dir)?;
        }
        write_file_atomic(&resources, &signed.code_resources)?;
        if let Some((path, binary)) = &signed.executable {
            binary.write_atomic(path)?;
        }
        Ok(())
    }
}

/// Swaps the staged copy into place.
fn commit(staged: Staged, target: &Path) -> Result<()> {
    if matches!(staged.layout, Layout::Single(_)) {
        fs::rename(&staged.root, target)?;
        return Ok(());
    }

    let backup = staged.dir.path().join(".machsign-backup");
    fs::rename(target, &backup)?;
    if let Err(e) = fs::rename(&staged.root, target) {
        if let Err(restore) = fs::rename(&backup, target) {
            log::warn!(
                "could not restore {} from {}: {restore}",
                target.display(),
                backup.display()
            );
            // keep the backup on disk
            let _ = staged.dir.into_path();
        }
        return Err(e.into());
    }
    Ok(())
}
