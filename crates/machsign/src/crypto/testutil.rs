//! Throwaway identities and provisioning profiles for tests.
//!
//! Integration tests include this file by path, so it only uses external
//! crates.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use x509_certificate::{InMemorySigningKeyPair, X509CertificateBuilder};

pub struct TestIdentity {
    pub cert_der: Vec<u8>,
    pub key_pkcs8: Vec<u8>,
    pub p12: Vec<u8>,
}

/// Self-signed ECDSA P-256 identity valid for one day.
pub fn make_identity(common_name: &str, team_id: &str, password: &str) -> TestIdentity {
    make_identity_valid_for(common_name, team_id, password, Duration::days(1))
}

pub fn make_identity_valid_for(
    common_name: &str,
    team_id: &str,
    password: &str,
    validity: Duration,
) -> TestIdentity {
    let rng = SystemRandom::new();
    let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng).unwrap();
    let key_pkcs8 = document.as_ref().to_vec();
    let key = InMemorySigningKeyPair::from_pkcs8_der(&key_pkcs8).unwrap();

    let mut builder = X509CertificateBuilder::default();
    builder
        .subject()
        .append_common_name_utf8_string(common_name)
        .unwrap();
    builder
        .subject()
        .append_organizational_unit_utf8_string(team_id)
        .unwrap();
    builder.validity_duration(validity);
    let cert = builder.create_with_key_pair(&key).unwrap();
    let cert_der = cert.constructed_data().to_vec();

    let p12 = p12::PFX::new(&cert_der, &key_pkcs8, None, password, common_name)
        .unwrap()
        .to_der();

    TestIdentity {
        cert_der,
        key_pkcs8,
        p12,
    }
}

/// XML provisioning profile content (unsigned).
pub fn profile_xml(
    team_id: &str,
    certificates: &[&[u8]],
    expiration: DateTime<Utc>,
    entitlements: plist::Dictionary,
) -> Vec<u8> {
    use plist::{Date, Dictionary, Value};

    let mut dict = Dictionary::new();
    dict.insert("Name".into(), Value::String("Test Profile".into()));
    dict.insert(
        "UUID".into(),
        Value::String("6F1B2C3D-0000-4000-8000-000000000001".into()),
    );
    dict.insert("AppIDName".into(), Value::String("Test App".into()));
    dict.insert(
        "TeamIdentifier".into(),
        Value::Array(vec![Value::String(team_id.into())]),
    );
    dict.insert("TeamName".into(), Value::String("Test Team".into()));
    dict.insert(
        "CreationDate".into(),
        Value::Date(Date::from(std::time::SystemTime::from(
            Utc::now() - Duration::days(1),
        ))),
    );
    dict.insert(
        "ExpirationDate".into(),
        Value::Date(Date::from(std::time::SystemTime::from(expiration))),
    );
    dict.insert(
        "DeveloperCertificates".into(),
        Value::Array(certificates.iter().map(|c| Value::Data(c.to_vec())).collect()),
    );
    dict.insert(
        "ProvisionedDevices".into(),
        Value::Array(vec![Value::String("00008030-001A".into())]),
    );
    dict.insert("Entitlements".into(), Value::Dictionary(entitlements));

    let mut out = Vec::new();
    plist::to_writer_xml(&mut out, &Value::Dictionary(dict)).unwrap();
    out
}

/// Profile content wrapped the way provisioning profiles ship: XML between
/// opaque binary bytes.
pub fn wrap_profile(xml: &[u8]) -> Vec<u8> {
    let mut out = vec![0x30, 0x80, 0x06, 0x09, 0x2a, 0x86, 0x48];
    out.extend_from_slice(xml);
    out.extend_from_slice(&[0xa0, 0x82, 0x00, 0x00]);
    out
}

pub fn entitlements(pairs: &[(&str, plist::Value)]) -> plist::Dictionary {
    let mut dict = plist::Dictionary::new();
    for (k, v) in pairs {
        dict.insert((*k).to_string(), v.clone());
    }
    dict
}
