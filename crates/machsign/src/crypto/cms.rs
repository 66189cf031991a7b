//! CMS signatures carrying Apple code directory hash attributes.
//!
//! The signed content is the primary code directory (detached). Two signed
//! attributes let the kernel match alternate code directories:
//!
//! - `1.2.840.113635.100.9.1`: XML plist `{cdhashes: [<data>...]}` with every
//!   code directory hash truncated to 20 bytes
//! - `1.2.840.113635.100.9.2`: `SEQUENCE { digestAlgorithm OID, OCTET STRING }`
//!   per code directory, full length

use crate::codesign::DigestType;
use crate::{Error, Result};
use bcder::{encode::Values, Captured, Mode, OctetString, Oid};
use cryptographic_message_syntax::{SignedDataBuilder, SignerBuilder};
use x509_certificate::{rfc5652::AttributeValue, CapturedX509Certificate, KeyInfoSigner};

/// 1.2.840.113635.100.9.1
pub const APPLE_CDHASH_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x01];

/// 1.2.840.113635.100.9.2
pub const APPLE_CDHASH_V2_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x02];

const SHA1_OID: &[u8] = &[0x2b, 0x0e, 0x03, 0x02, 0x1a];
const SHA256_OID: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
const SHA384_OID: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02];

/// Length of the truncated hashes in the v1 plist.
const CDHASH_TRUNCATED_LEN: usize = 20;

/// Hash of one code directory, as stored in the signed attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdHash {
    pub digest: DigestType,
    pub hash: Vec<u8>,
}

impl CdHash {
    pub fn new(digest: DigestType, hash: Vec<u8>) -> Self {
        Self { digest, hash }
    }
}

/// Signs `code_directory` (detached) and returns the DER `ContentInfo`.
///
/// `cdhashes` lists every code directory of the signature, primary first.
/// The signing certificate is always embedded; `chain` adds intermediates.
pub fn sign_code_directory<K: KeyInfoSigner>(
    code_directory: &[u8],
    signing_key: &K,
    signing_cert: &CapturedX509Certificate,
    chain: &[CapturedX509Certificate],
    cdhashes: &[CdHash],
) -> Result<Vec<u8>> {
    let plist = build_cdhash_plist(cdhashes)?;
    let v1_value = AttributeValue::new(Captured::from_values(
        Mode::Der,
        OctetString::encode_slice(&plist),
    ));

    let mut v2_values = Vec::with_capacity(cdhashes.len());
    for cdhash in cdhashes {
        let encoded = build_cdhash_v2_value(cdhash)?;
        v2_values.push(AttributeValue::new(Captured::from_values(
            Mode::Der,
            RawDer(&encoded),
        )));
    }

    let signer = SignerBuilder::new(signing_key, signing_cert.clone())
        .signed_attribute(oid(APPLE_CDHASH_OID), vec![v1_value])
        .signed_attribute(oid(APPLE_CDHASH_V2_OID), v2_values);

    let mut builder = SignedDataBuilder::default()
        .content_external(code_directory.to_vec())
        .signer(signer)
        .certificate(signing_cert.clone());
    for cert in chain {
        builder = builder.certificate(cert.clone());
    }

    builder
        .build_der()
        .map_err(|e| Error::Signing(format!("failed to build CMS signature: {e}")))
}

fn oid(raw: &'static [u8]) -> Oid {
    Oid(bytes::Bytes::from_static(raw))
}

/// XML plist for the v1 attribute. Hashes are truncated to 20 bytes.
pub fn build_cdhash_plist(cdhashes: &[CdHash]) -> Result<Vec<u8>> {
    use plist::{Dictionary, Value};

    let hashes = cdhashes
        .iter()
        .map(|c| Value::Data(c.hash[..c.hash.len().min(CDHASH_TRUNCATED_LEN)].to_vec()))
        .collect();
    let mut dict = Dictionary::new();
    dict.insert("cdhashes".to_string(), Value::Array(hashes));

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &Value::Dictionary(dict))?;
    buf.push(b'\n');
    Ok(buf)
}

/// `SEQUENCE { OID, OCTET STRING }` for the v2 attribute.
fn build_cdhash_v2_value(cdhash: &CdHash) -> Result<Vec<u8>> {
    let algorithm = match cdhash.digest {
        DigestType::Sha1 => SHA1_OID,
        DigestType::Sha256 => SHA256_OID,
        DigestType::Sha384 => SHA384_OID,
    };
    if cdhash.hash.len() > 127 {
        return Err(Error::Signing("code directory hash too long".into()));
    }

    let mut inner = Vec::with_capacity(4 + algorithm.len() + cdhash.hash.len());
    inner.push(0x06);
    inner.push(algorithm.len() as u8);
    inner.extend_from_slice(algorithm);
    inner.push(0x04);
    inner.push(cdhash.hash.len() as u8);
    inner.extend_from_slice(&cdhash.hash);

    let mut out = Vec::with_capacity(inner.len() + 2);
    out.push(0x30);
    out.push(inner.len() as u8);
    out.extend(inner);
    Ok(out)
}

/// Pre-encoded DER passed through bcder unchanged.
struct RawDer<'a>(&'a [u8]);

impl Values for RawDer<'_> {
    fn encoded_len(&self, _mode: Mode) -> usize {
        self.0.len()
    }

    fn write_encoded<W: std::io::Write>(&self, _mode: Mode, target: &mut W) -> std::io::Result<()> {
        target.write_all(self.0)
    }
}
