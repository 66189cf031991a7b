//! Input to a bundle signing run.

use crate::crypto::{Identity, ProvisioningProfile};
use crate::settings::SigningSettings;
use crate::{Error, Result};
use plist::{Dictionary, Value};
use std::path::{Path, PathBuf};

/// Everything one signing run needs.
///
/// Built with consuming setters and consumed by the pipeline; the identity's
/// key material is dropped when the run ends.
///
/// ```no_run
/// use machsign::{Engine, CodeSigningEngine, SigningRequest};
///
/// let request = SigningRequest::new("Payload/Demo.app")
///     .identifier("com.example.demo")
///     .version("2.1")
///     .adhoc(true);
/// Engine::new().sign(request).wait()?;
/// # Ok::<(), machsign::Error>(())
/// ```
#[derive(Debug)]
pub struct SigningRequest {
    pub(crate) path: PathBuf,
    pub(crate) profile: Option<ProvisioningProfile>,
    pub(crate) identity: Option<Identity>,
    pub(crate) entitlements: Option<Dictionary>,
    pub(crate) identifier: Option<String>,
    pub(crate) display_name: Option<String>,
    pub(crate) version: Option<String>,
    pub(crate) adhoc: bool,
    pub(crate) remove_provision: bool,
    pub(crate) settings: SigningSettings,
}

impl SigningRequest {
    /// A request for the bundle or Mach-O file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            profile: None,
            identity: None,
            entitlements: None,
            identifier: None,
            display_name: None,
            version: None,
            adhoc: false,
            remove_provision: false,
            settings: SigningSettings::default(),
        }
    }

    pub fn profile(mut self, profile: ProvisioningProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Entitlements that replace both the profile's and the embedded ones.
    pub fn entitlements(mut self, entitlements: Dictionary) -> Self {
        self.entitlements = Some(entitlements);
        self
    }

    /// Reads the entitlements override from a plist file.
    pub fn entitlements_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let dict = Value::from_file(path)?.into_dictionary().ok_or_else(|| {
            Error::Format(format!("{} is not a plist dictionary", path.display()))
        })?;
        Ok(self.entitlements(dict))
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Signs without a certificate even if an identity is set.
    pub fn adhoc(mut self, adhoc: bool) -> Self {
        self.adhoc = adhoc;
        self
    }

    /// Deletes `embedded.mobileprovision` instead of replacing it.
    pub fn remove_provision(mut self, remove: bool) -> Self {
        self.remove_provision = remove;
        self
    }

    pub fn settings(mut self, settings: SigningSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_adhoc(&self) -> bool {
        self.adhoc
    }

    /// The identity used for signing, or `None` when signing adhoc.
    ///
    /// Fails with [`Error::MissingIdentity`] when certificate signing is
    /// requested without an identity.
    pub fn signing_identity(&self) -> Result<Option<&Identity>> {
        if self.adhoc {
            return Ok(None);
        }
        self.identity.as_ref().map(Some).ok_or(Error::MissingIdentity)
    }

    /// Checks the request before any file is touched.
    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;
        if !self.path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", self.path.display()),
            )));
        }
        for (field, value) in [
            ("identifier", &self.identifier),
            ("display name", &self.display_name),
            ("version", &self.version),
        ] {
            if value.as_deref().is_some_and(str::is_empty) {
                return Err(Error::Config(format!("{field} override is empty")));
            }
        }
        self.signing_identity()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate() {
        let dir = tempdir().unwrap();
        let missing = SigningRequest::new(dir.path().join("nope.app")).adhoc(true);
        assert!(matches!(missing.validate(), Err(Error::Io(_))));

        let no_identity = SigningRequest::new(dir.path());
        assert!(matches!(no_identity.validate(), Err(Error::MissingIdentity)));

        let empty = SigningRequest::new(dir.path()).adhoc(true).version("");
        assert!(matches!(empty.validate(), Err(Error::Config(_))));

        let bad_settings = SigningRequest::new(dir.path())
            .adhoc(true)
            .settings(SigningSettings::default().page_size(1000));
        assert!(matches!(bad_settings.validate(), Err(Error::Config(_))));

        assert!(SigningRequest::new(dir.path()).adhoc(true).validate().is_ok());
    }

    #[test]
    fn test_entitlements_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ents.plist");
        let mut dict = Dictionary::new();
        dict.insert("get-task-allow".into(), Value::Boolean(true));
        plist::to_file_xml(&path, &Value::Dictionary(dict.clone())).unwrap();

        let request = SigningRequest::new(dir.path()).entitlements_file(&path).unwrap();
        assert_eq!(request.entitlements, Some(dict));

        std::fs::write(&path, b"<plist><array/></plist>").unwrap();
        let err = SigningRequest::new(dir.path()).entitlements_file(&path).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }
}
