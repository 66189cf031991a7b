//! Provisioning profiles (`.mobileprovision`).
//!
//! A profile is a CMS `SignedData` whose content is an XML plist. The CMS
//! signature is not verified; only the embedded plist is read.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use cryptographic_message_syntax::SignedData;
use plist::{Dictionary, Value};
use std::path::Path;

/// Parsed provisioning profile. Read-only after parsing.
#[derive(Debug, Clone)]
pub struct ProvisioningProfile {
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub app_id_name: Option<String>,
    pub team_identifiers: Vec<String>,
    pub team_name: Option<String>,
    pub creation_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub entitlements: Dictionary,
    /// DER encoded certificates allowed to sign with this profile.
    pub developer_certificates: Vec<Vec<u8>>,
    pub provisioned_devices: Vec<String>,
    pub provisions_all_devices: bool,
    raw: Vec<u8>,
}

impl ProvisioningProfile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let profile = Self::parse(data)?;
        log::debug!(
            "parsed profile {} ({:?}, team {:?})",
            path.display(),
            profile.name,
            profile.team_identifier()
        );
        Ok(profile)
    }

    /// Parses profile bytes: CMS signed data, a bare plist, or anything
    /// holding an XML plist between other bytes.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let content = extract_plist(&data)?;
        let value = Value::from_reader(std::io::Cursor::new(content))
            .map_err(|e| Error::Format(format!("invalid profile plist: {e}")))?;
        let dict = value
            .into_dictionary()
            .ok_or_else(|| Error::Format("profile plist is not a dictionary".into()))?;

        Ok(Self {
            name: string(&dict, "Name"),
            uuid: string(&dict, "UUID"),
            app_id_name: string(&dict, "AppIDName"),
            team_identifiers: strings(&dict, "TeamIdentifier"),
            team_name: string(&dict, "TeamName"),
            creation_date: date(&dict, "CreationDate"),
            expiration_date: date(&dict, "ExpirationDate"),
            entitlements: dict
                .get("Entitlements")
                .and_then(Value::as_dictionary)
                .cloned()
                .unwrap_or_default(),
            developer_certificates: dict
                .get("DeveloperCertificates")
                .and_then(Value::as_array)
                .map(|certs| {
                    certs
                        .iter()
                        .filter_map(Value::as_data)
                        .map(<[u8]>::to_vec)
                        .collect()
                })
                .unwrap_or_default(),
            provisioned_devices: strings(&dict, "ProvisionedDevices"),
            provisions_all_devices: dict
                .get("ProvisionsAllDevices")
                .and_then(Value::as_boolean)
                .unwrap_or(false),
            raw: data,
        })
    }

    /// First team identifier, falling back to the
    /// `com.apple.developer.team-identifier` entitlement.
    pub fn team_identifier(&self) -> Option<&str> {
        self.team_identifiers.first().map(String::as_str).or_else(|| {
            self.entitlements
                .get("com.apple.developer.team-identifier")
                .and_then(Value::as_string)
        })
    }

    /// `application-identifier` entitlement, e.g. `TEAMID.com.example.app`.
    pub fn application_identifier(&self) -> Option<&str> {
        self.entitlements
            .get("application-identifier")
            .and_then(Value::as_string)
    }

    /// True if `cert_der` is one of the profile's developer certificates.
    pub fn contains_certificate(&self, cert_der: &[u8]) -> bool {
        self.developer_certificates.iter().any(|c| c == cert_der)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.is_some_and(|d| d <= now)
    }

    /// Original file bytes, as written to `embedded.mobileprovision`.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Entitlements serialized as an XML plist.
    pub fn entitlements_xml(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        plist::to_writer_xml(&mut out, &Value::Dictionary(self.entitlements.clone()))?;
        Ok(out)
    }
}

fn extract_plist(data: &[u8]) -> Result<Vec<u8>> {
    if let Ok(signed) = SignedData::parse_ber(data) {
        if let Some(content) = signed.signed_content() {
            return Ok(content.to_vec());
        }
    }
    if data.starts_with(b"bplist") {
        return Ok(data.to_vec());
    }

    const XML_START: &[u8] = b"<?xml";
    const XML_END: &[u8] = b"</plist>";
    let start = find(data, XML_START)
        .ok_or_else(|| Error::Format("no plist found in provisioning profile".into()))?;
    let end = find(&data[start..], XML_END)
        .map(|i| start + i + XML_END.len())
        .ok_or_else(|| Error::Format("unterminated plist in provisioning profile".into()))?;
    Ok(data[start..end].to_vec())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn string(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key).and_then(Value::as_string).map(str::to_string)
}

fn strings(dict: &Dictionary, key: &str) -> Vec<String> {
    dict.get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_string).map(str::to_string).collect())
        .unwrap_or_default()
}

fn date(dict: &Dictionary, key: &str) -> Option<DateTime<Utc>> {
    dict.get(key)
        .and_then(Value::as_date)
        .map(|d| DateTime::<Utc>::from(std::time::SystemTime::from(d)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testutil::{entitlements, profile_xml, wrap_profile};
    use chrono::Duration;

    fn sample() -> Vec<u8> {
        let ents = entitlements(&[
            (
                "application-identifier",
                Value::String("TEAM123456.com.example.app".into()),
            ),
            ("get-task-allow", Value::Boolean(true)),
        ]);
        profile_xml(
            "TEAM123456",
            &[b"cert-one".as_slice()],
            Utc::now() + Duration::days(30),
            ents,
        )
    }

    #[test]
    fn test_parse_plain_xml() {
        let profile = ProvisioningProfile::parse(sample()).unwrap();
        assert_eq!(profile.name.as_deref(), Some("Test Profile"));
        assert_eq!(profile.team_identifier(), Some("TEAM123456"));
        assert_eq!(
            profile.application_identifier(),
            Some("TEAM123456.com.example.app")
        );
        assert!(profile.contains_certificate(b"cert-one"));
        assert!(!profile.contains_certificate(b"cert-two"));
        assert_eq!(profile.provisioned_devices.len(), 1);
        assert!(!profile.provisions_all_devices);
        assert!(!profile.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_parse_embedded_xml() {
        let wrapped = wrap_profile(&sample());
        let profile = ProvisioningProfile::parse(wrapped.clone()).unwrap();
        assert_eq!(profile.team_identifier(), Some("TEAM123456"));
        assert_eq!(profile.raw(), wrapped.as_slice());
    }

    #[test]
    fn test_expiration() {
        let xml = profile_xml(
            "T",
            &[],
            Utc::now() - Duration::days(2),
            Dictionary::new(),
        );
        let profile = ProvisioningProfile::parse(xml).unwrap();
        assert!(profile.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_garbage() {
        let err = ProvisioningProfile::parse(b"\x00\x01garbage".to_vec()).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_entitlements_xml_round_trip() {
        let profile = ProvisioningProfile::parse(sample()).unwrap();
        let xml = profile.entitlements_xml().unwrap();
        let value = Value::from_reader(std::io::Cursor::new(xml)).unwrap();
        assert_eq!(
            value
                .as_dictionary()
                .and_then(|d| d.get("get-task-allow"))
                .and_then(Value::as_boolean),
            Some(true)
        );
    }
}
