//! Public entry points.
//!
//! Load command operations run synchronously on the caller's thread and
//! replace the file through a temp file and rename. Signing and revocation
//! checks run on the tokio blocking pool and deliver their result through a
//! [`TaskHandle`].

use crate::codesign;
use crate::crypto::revocation::{self, NoResponder, RevocationReport, RevocationResponder};
use crate::crypto::{Identity, ProvisioningProfile};
use crate::macho::{FatBinary, LoadCommandEditor};
use crate::signing::{Pipeline, SigningRequest};
use crate::task::{CancellationToken, TaskHandle};
use crate::Result;
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use x509_certificate::CapturedX509Certificate;

/// Operations offered to callers.
pub trait CodeSigningEngine {
    /// True if every slice of the binary carries a well formed signature.
    fn check_signed(&self, path: impl AsRef<Path>) -> Result<bool>;

    /// Adds a (weak) dylib load command. Already loaded paths are left alone.
    fn inject_dylib(&self, path: impl AsRef<Path>, load_path: &str, weak: bool) -> Result<()>;

    /// Removes the dylib load commands with the given paths.
    fn remove_dylibs(&self, path: impl AsRef<Path>, load_paths: &[String]) -> Result<()>;

    /// Dylib load paths in load order.
    fn list_dylibs(&self, path: impl AsRef<Path>) -> Result<Vec<String>>;

    /// Rewrites the path of the dylib load commands matching `old`.
    fn change_dylib_path(&self, path: impl AsRef<Path>, old: &str, new: &str) -> Result<()>;

    /// Signs a bundle or a single binary in the background.
    fn sign(&self, request: SigningRequest) -> TaskHandle<()>;

    /// Validates a PKCS#12 identity against a provisioning profile in the
    /// background.
    fn check_revocation(
        &self,
        profile_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        password: SecretString,
    ) -> TaskHandle<RevocationReport>;
}

/// Default [`CodeSigningEngine`].
///
/// Calls share no mutable state; one engine may serve any number of
/// concurrent operations.
#[derive(Clone)]
pub struct Engine {
    anchors: Vec<CapturedX509Certificate>,
    responder: Arc<dyn RevocationResponder>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("anchors", &self.anchors.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// An engine with no trust anchors and no responder. Without anchors a
    /// chain is only checked for internal consistency, so a self-signed
    /// certificate passes.
    pub fn new() -> Self {
        Self {
            anchors: Vec::new(),
            responder: Arc::new(NoResponder),
        }
    }

    /// Trust anchors for certificate chain checks.
    pub fn with_anchors(mut self, anchors: Vec<CapturedX509Certificate>) -> Self {
        self.anchors = anchors;
        self
    }

    /// Source of revocation status. Without one every valid chain reports
    /// `Unknown`.
    pub fn with_responder(mut self, responder: Arc<dyn RevocationResponder>) -> Self {
        self.responder = responder;
        self
    }

    /// Like [`CodeSigningEngine::sign`], observing an existing token.
    pub fn sign_with_token(&self, request: SigningRequest, token: CancellationToken) -> TaskHandle<()> {
        TaskHandle::spawn("machsign-sign", token, move |token| {
            Pipeline::new(request, token).run()
        })
    }

    fn edit<F>(&self, path: &Path, edit: F) -> Result<()>
    where
        F: FnOnce(&mut LoadCommandEditor<'_>) -> Result<bool>,
    {
        let mut binary = FatBinary::open(path)?;
        let changed = edit(&mut LoadCommandEditor::new(&mut binary))?;
        if changed {
            binary.write_atomic(path)?;
            log::info!("updated load commands of {}", path.display());
        }
        Ok(())
    }
}

impl CodeSigningEngine for Engine {
    fn check_signed(&self, path: impl AsRef<Path>) -> Result<bool> {
        codesign::check_signed(path)
    }

    fn inject_dylib(&self, path: impl AsRef<Path>, load_path: &str, weak: bool) -> Result<()> {
        self.edit(path.as_ref(), |editor| editor.inject(load_path, weak))
    }

    fn remove_dylibs(&self, path: impl AsRef<Path>, load_paths: &[String]) -> Result<()> {
        self.edit(path.as_ref(), |editor| editor.remove(load_paths))
    }

    fn list_dylibs(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        let mut binary = FatBinary::open(path)?;
        Ok(LoadCommandEditor::new(&mut binary).list())
    }

    fn change_dylib_path(&self, path: impl AsRef<Path>, old: &str, new: &str) -> Result<()> {
        self.edit(path.as_ref(), |editor| editor.rewrite(old, new))
    }

    fn sign(&self, request: SigningRequest) -> TaskHandle<()> {
        self.sign_with_token(request, CancellationToken::new())
    }

    fn check_revocation(
        &self,
        profile_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        password: SecretString,
    ) -> TaskHandle<RevocationReport> {
        let profile_path: PathBuf = profile_path.as_ref().to_path_buf();
        let key_path: PathBuf = key_path.as_ref().to_path_buf();
        let anchors = self.anchors.clone();
        let responder = Arc::clone(&self.responder);

        TaskHandle::spawn("machsign-revocation", CancellationToken::new(), move |token| {
            let profile = ProvisioningProfile::from_file(&profile_path)?;
            token.check()?;
            let identity = Identity::from_pkcs12_file(&key_path, &password)?;
            token.check()?;
            let report = revocation::check_revocation(&profile, &identity, &anchors, responder.as_ref());
            log::info!(
                "{}: {}",
                identity.common_name().unwrap_or_default(),
                report.status
            );
            Ok(report)
        })
    }
}
