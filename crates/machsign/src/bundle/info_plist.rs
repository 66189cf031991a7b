//! Reading and rewriting bundle `Info.plist` files.
//!
//! The file's encoding (binary or XML) is kept when it is written back.

use crate::{Error, Result};
use plist::{Dictionary, Value};
use std::io::Cursor;
use std::path::Path;

pub const INFO_PLIST: &str = "Info.plist";

const KEY_IDENTIFIER: &str = "CFBundleIdentifier";
const KEY_EXECUTABLE: &str = "CFBundleExecutable";
const KEY_DISPLAY_NAME: &str = "CFBundleDisplayName";
const KEY_NAME: &str = "CFBundleName";
const KEY_SHORT_VERSION: &str = "CFBundleShortVersionString";
const KEY_VERSION: &str = "CFBundleVersion";

#[derive(Debug, Clone, PartialEq)]
pub struct InfoPlist {
    dict: Dictionary,
    binary: bool,
}

impl InfoPlist {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let value = Value::from_reader(Cursor::new(data))?;
        let dict = value
            .into_dictionary()
            .ok_or_else(|| Error::Format("Info.plist is not a dictionary".into()))?;
        Ok(Self {
            dict,
            binary: data.starts_with(b"bplist"),
        })
    }

    /// Reads `<bundle>/Info.plist`. Returns `None` if the file is absent.
    pub fn read_from_bundle(bundle: &Path) -> Result<Option<Self>> {
        let path = bundle.join(INFO_PLIST);
        match std::fs::read(&path) {
            Ok(data) => Self::parse(&data).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let value = Value::Dictionary(self.dict.clone());
        let mut out = Vec::new();
        if self.binary {
            plist::to_writer_binary(&mut out, &value)?;
        } else {
            plist::to_writer_xml(&mut out, &value)?;
        }
        Ok(out)
    }

    pub fn write_to_bundle(&self, bundle: &Path) -> Result<()> {
        std::fs::write(bundle.join(INFO_PLIST), self.to_bytes()?)?;
        Ok(())
    }

    fn string(&self, key: &str) -> Option<&str> {
        self.dict.get(key).and_then(Value::as_string)
    }

    fn set(&mut self, key: &str, value: &str) {
        self.dict.insert(key.to_string(), Value::String(value.to_string()));
    }

    pub fn bundle_identifier(&self) -> Option<&str> {
        self.string(KEY_IDENTIFIER)
    }

    pub fn executable(&self) -> Option<&str> {
        self.string(KEY_EXECUTABLE)
    }

    pub fn set_bundle_identifier(&mut self, identifier: &str) {
        self.set(KEY_IDENTIFIER, identifier);
    }

    /// Sets both the display name and the bundle name.
    pub fn set_display_name(&mut self, name: &str) {
        self.set(KEY_DISPLAY_NAME, name);
        self.set(KEY_NAME, name);
    }

    /// Sets both the marketing and the build version.
    pub fn set_version(&mut self, version: &str) {
        self.set(KEY_SHORT_VERSION, version);
        self.set(KEY_VERSION, version);
    }

    /// Replaces an identifier prefix: `old.ext` becomes `new.ext` when the
    /// main identifier changes from `old` to `new`. Returns whether the
    /// identifier changed.
    pub fn replace_identifier_prefix(&mut self, old: &str, new: &str) -> bool {
        let Some(current) = self.bundle_identifier() else {
            return false;
        };
        let Some(rest) = current.strip_prefix(old) else {
            return false;
        };
        if !(rest.is_empty() || rest.starts_with('.')) {
            return false;
        }
        let replaced = format!("{new}{rest}");
        self.set_bundle_identifier(&replaced);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert(KEY_IDENTIFIER.into(), Value::String("com.old.app".into()));
        dict.insert(KEY_EXECUTABLE.into(), Value::String("App".into()));
        dict
    }

    #[test]
    fn test_keeps_binary_encoding() {
        let mut data = Vec::new();
        plist::to_writer_binary(&mut data, &Value::Dictionary(sample())).unwrap();
        let mut info = InfoPlist::parse(&data).unwrap();
        info.set_version("2.0");
        let out = info.to_bytes().unwrap();
        assert!(out.starts_with(b"bplist"));
        let back = InfoPlist::parse(&out).unwrap();
        assert_eq!(back.string(KEY_VERSION), Some("2.0"));
        assert_eq!(back.string(KEY_SHORT_VERSION), Some("2.0"));
    }

    #[test]
    fn test_keeps_xml_encoding() {
        let mut data = Vec::new();
        plist::to_writer_xml(&mut data, &Value::Dictionary(sample())).unwrap();
        let mut info = InfoPlist::parse(&data).unwrap();
        info.set_display_name("Renamed");
        let out = info.to_bytes().unwrap();
        assert!(out.starts_with(b"<?xml"));
        let back = InfoPlist::parse(&out).unwrap();
        assert_eq!(back.string(KEY_DISPLAY_NAME), Some("Renamed"));
        assert_eq!(back.string(KEY_NAME), Some("Renamed"));
        assert_eq!(back.executable(), Some("App"));
    }

    #[test]
    fn test_replace_identifier_prefix() {
        let mut info = InfoPlist::parse(b"<plist><dict><key>CFBundleIdentifier</key><string>com.old.app.widget</string></dict></plist>").unwrap();
        assert!(info.replace_identifier_prefix("com.old.app", "com.new.app"));
        assert_eq!(info.bundle_identifier(), Some("com.new.app.widget"));

        let mut other = InfoPlist::parse(b"<plist><dict><key>CFBundleIdentifier</key><string>com.old.application</string></dict></plist>").unwrap();
        assert!(!other.replace_identifier_prefix("com.old.app", "com.new.app"));
        assert_eq!(other.bundle_identifier(), Some("com.old.application"));
    }

    #[test]
    fn test_not_a_dictionary() {
        let err = InfoPlist::parse(b"<plist><string>x</string></plist>").unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }
}
