//! Signing identities: a private key plus its certificate chain.
//!
//! Identities are loaded from PKCS#12 containers (the format Keychain Access
//! exports) or from PEM files. RSA and ECDSA P-256 keys are supported.
//!
//! ```no_run
//! use machsign::crypto::Identity;
//! use secrecy::SecretString;
//!
//! let p12 = std::fs::read("developer.p12")?;
//! let identity = Identity::from_pkcs12(&p12, &SecretString::new("secret".into()))?;
//! println!("team: {:?}", identity.team_id());
//! # Ok::<(), machsign::Error>(())
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use p256::ecdsa::SigningKey as EcdsaSigningKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::RsaPrivateKey;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::path::Path;
use x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, X509Certificate};
use zeroize::Zeroizing;

/// Algorithm of the identity's private key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    EcdsaP256,
}

/// A decoded private key, used to match the key against certificates.
#[allow(clippy::large_enum_variant)]
enum PrivateKey {
    Rsa(RsaPrivateKey),
    Ecdsa(EcdsaSigningKey),
}

impl PrivateKey {
    fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        use pkcs8::DecodePrivateKey;

        if let Ok(key) = RsaPrivateKey::from_pkcs8_der(der) {
            return Ok(PrivateKey::Rsa(key));
        }
        if let Ok(key) = EcdsaSigningKey::from_pkcs8_der(der) {
            return Ok(PrivateKey::Ecdsa(key));
        }
        Err(Error::Format(
            "private key is neither RSA nor ECDSA P-256".into(),
        ))
    }

    fn key_type(&self) -> KeyType {
        match self {
            PrivateKey::Rsa(_) => KeyType::Rsa,
            PrivateKey::Ecdsa(_) => KeyType::EcdsaP256,
        }
    }

    /// Public key bytes in the form stored in a certificate's
    /// `subjectPublicKey` bit string.
    fn public_key_data(&self) -> Result<Vec<u8>> {
        match self {
            PrivateKey::Rsa(key) => key
                .to_public_key()
                .to_pkcs1_der()
                .map(|doc| doc.as_bytes().to_vec())
                .map_err(|e| Error::Certificate(format!("failed to encode RSA public key: {e}"))),
            PrivateKey::Ecdsa(key) => Ok(key
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec()),
        }
    }
}

/// A certificate, its private key and intermediate certificates.
///
/// Key material lives only as long as the identity. The raw PKCS#8 bytes
/// are wiped once the signing key has been constructed.
pub struct Identity {
    certificate: CapturedX509Certificate,
    chain: Vec<CapturedX509Certificate>,
    signing_key: InMemorySigningKeyPair,
    key_type: KeyType,
    team_id: Option<String>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("common_name", &self.common_name())
            .field("team_id", &self.team_id)
            .field("key_type", &self.key_type)
            .field("chain", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Loads an identity from PKCS#12 data.
    ///
    /// The container's MAC is checked first; a mismatch is reported as
    /// [`Error::BadPassword`]. The leaf certificate is the one whose public
    /// key belongs to the private key, every other certificate becomes part
    /// of the chain.
    pub fn from_pkcs12(data: &[u8], password: &SecretString) -> Result<Self> {
        let password = password.expose_secret();
        let pfx = p12::PFX::parse(data)
            .map_err(|e| Error::Format(format!("not a PKCS#12 container: {e:?}")))?;

        if !pfx.verify_mac(password) {
            return Err(Error::BadPassword);
        }

        let keys: Vec<Zeroizing<Vec<u8>>> = pfx
            .key_bags(password)
            .map_err(|e| Error::Format(format!("failed to decrypt PKCS#12 keys: {e:?}")))?
            .into_iter()
            .map(Zeroizing::new)
            .collect();
        let certs = pfx
            .cert_x509_bags(password)
            .map_err(|e| Error::Format(format!("failed to decrypt PKCS#12 certificates: {e:?}")))?;

        let key_der = keys
            .first()
            .ok_or_else(|| Error::Format("no private key in PKCS#12".into()))?;
        if certs.is_empty() {
            return Err(Error::Format("no certificate in PKCS#12".into()));
        }

        let certs = certs
            .into_iter()
            .map(|der| {
                CapturedX509Certificate::from_der(der)
                    .map_err(|e| Error::Format(format!("invalid certificate in PKCS#12: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::assemble(key_der, certs)
    }

    /// Reads a PKCS#12 file and loads it with [`Self::from_pkcs12`].
    pub fn from_pkcs12_file(path: impl AsRef<Path>, password: &SecretString) -> Result<Self> {
        let data = Zeroizing::new(std::fs::read(path)?);
        Self::from_pkcs12(&data, password)
    }

    /// Loads an identity from a PEM certificate (optionally followed by its
    /// chain) and an unencrypted PEM PKCS#8 key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = CapturedX509Certificate::from_pem_multiple(cert_pem)
            .map_err(|e| Error::Format(format!("failed to parse certificate PEM: {e}")))?;
        if certs.is_empty() {
            return Err(Error::Format("no certificate in PEM data".into()));
        }

        let key_str = std::str::from_utf8(key_pem)
            .map_err(|e| Error::Format(format!("invalid UTF-8 in key PEM: {e}")))?;
        let (_, document) = pkcs8::SecretDocument::from_pem(key_str)
            .map_err(|e| Error::Format(format!("failed to parse key PEM: {e}")))?;
        let key_der = Zeroizing::new(document.as_bytes().to_vec());

        Self::assemble(&key_der, certs)
    }

    fn assemble(key_der: &[u8], mut certs: Vec<CapturedX509Certificate>) -> Result<Self> {
        let private_key = PrivateKey::from_pkcs8_der(key_der)?;
        let public_key = private_key.public_key_data()?;

        let leaf_index = certs
            .iter()
            .position(|c| c.public_key_data().as_ref() == public_key.as_slice())
            .ok_or_else(|| {
                Error::Certificate("no certificate matches the private key".into())
            })?;
        let certificate = certs.remove(leaf_index);
        let certs = issuer_order(
            (certificate.subject_name(), certificate.issuer_name()),
            certs,
            |c| (c.subject_name(), c.issuer_name()),
        );

        let signing_key = InMemorySigningKeyPair::from_pkcs8_der(key_der)
            .map_err(|e| Error::Certificate(format!("unusable private key: {e}")))?;
        let team_id = extract_team_id(&certificate);

        log::debug!(
            "loaded identity {:?} (team {:?}, {} chain certificates)",
            common_name(&certificate),
            team_id,
            certs.len()
        );

        Ok(Self {
            certificate,
            chain: certs,
            signing_key,
            key_type: private_key.key_type(),
            team_id,
        })
    }

    pub fn certificate(&self) -> &CapturedX509Certificate {
        &self.certificate
    }

    /// DER encoding of the leaf certificate.
    pub fn certificate_der(&self) -> &[u8] {
        self.certificate.constructed_data()
    }

    /// Intermediate certificates, nearest issuer first. Certificates that do
    /// not link into the leaf's issuer chain follow in container order.
    pub fn chain(&self) -> &[CapturedX509Certificate] {
        &self.chain
    }

    pub fn signing_key(&self) -> &InMemorySigningKeyPair {
        &self.signing_key
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Team identifier from the leaf's organizational unit.
    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    /// Subject common name of the leaf certificate.
    pub fn common_name(&self) -> Option<String> {
        common_name(&self.certificate)
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.certificate.validity_not_after()
    }
}

fn common_name(cert: &X509Certificate) -> Option<String> {
    cert.subject_name()
        .iter_common_name()
        .find_map(|atav| atav.to_string().ok())
}

fn extract_team_id(cert: &X509Certificate) -> Option<String> {
    cert.subject_name()
        .iter_organizational_unit()
        .find_map(|atav| atav.to_string().ok())
}

/// Sorts `certs` so that each one issued the one before it, starting from
/// the leaf's issuer. `names` yields `(subject, issuer)`.
fn issuer_order<T, K: PartialEq + ?Sized>(
    leaf: (&K, &K),
    mut certs: Vec<T>,
    names: impl Fn(&T) -> (&K, &K),
) -> Vec<T> {
    let mut ordered = Vec::with_capacity(certs.len());
    loop {
        let (subject, wanted) = match ordered.last() {
            Some(prev) => names(prev),
            None => leaf,
        };
        // self-signed
        if subject == wanted {
            break;
        }
        let Some(pos) = certs.iter().position(|c| names(c).0 == wanted) else {
            break;
        };
        ordered.push(certs.remove(pos));
    }
    ordered.extend(certs);
    ordered
}
