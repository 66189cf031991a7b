//! Signing of individual Mach-O binaries.
//!
//! Every architecture slice gets its own signature. For each slice the
//! signature space is reserved first, so the updated load commands are
//! covered by the page hashes, then code directories are built over the
//! slice up to the signature offset, signed and embedded.

use super::parser::{FatBinary, MachOImage};
use crate::codesign::constants::*;
use crate::codesign::der::der_encode_entitlements;
use crate::codesign::code_directory::CODEDIRECTORY_HEADER_SIZE;
use crate::codesign::requirements::{designated_requirements_blob, empty_requirements};
use crate::codesign::superblob::{
    build_der_entitlements_blob, build_entitlements_blob, build_signature_blob,
    BLOB_HEADER_SIZE, INDEX_ENTRY_SIZE, SUPERBLOB_HEADER_SIZE,
};
use crate::codesign::{CodeDirectory, CodeDirectoryBuilder, SuperBlobBuilder};
use crate::crypto::cms::{self, CdHash};
use crate::crypto::Identity;
use crate::settings::SigningSettings;
use crate::{Error, Result};
use plist::{Dictionary, Value};

/// Room left for the CMS structure beyond the certificates it embeds.
const CMS_OVERHEAD: usize = 4096;

/// Everything needed to sign one binary.
#[derive(Debug, Clone, Copy)]
pub struct SigningMaterial<'a> {
    pub identifier: &'a str,
    /// Team identifier; ignored when signing adhoc.
    pub team_id: Option<&'a str>,
    /// `None` signs adhoc.
    pub identity: Option<&'a Identity>,
    pub entitlements: Option<&'a Dictionary>,
    pub info_plist: Option<&'a [u8]>,
    pub code_resources: Option<&'a [u8]>,
    /// Main executable of a bundle, or a standalone executable.
    pub main_executable: bool,
    pub settings: &'a SigningSettings,
}

impl<'a> SigningMaterial<'a> {
    pub fn new(identifier: &'a str, settings: &'a SigningSettings) -> Self {
        Self {
            identifier,
            team_id: None,
            identity: None,
            entitlements: None,
            info_plist: None,
            code_resources: None,
            main_executable: false,
            settings,
        }
    }

    pub fn is_adhoc(&self) -> bool {
        self.identity.is_none()
    }
}

/// Blobs shared by every slice of a binary.
struct SignatureParts {
    requirements: Vec<u8>,
    entitlements: Option<Vec<u8>>,
    der_entitlements: Option<Vec<u8>>,
    exec_seg_flags: u64,
    flags: u32,
}

impl SignatureParts {
    fn new(material: &SigningMaterial<'_>) -> Result<Self> {
        let requirements = match material.identity {
            Some(identity) => {
                let cn = identity.common_name().ok_or_else(|| {
                    Error::Certificate("signing certificate has no common name".into())
                })?;
                designated_requirements_blob(material.identifier, &cn)
            }
            None => empty_requirements(),
        };

        let (entitlements, der_entitlements) = match material.entitlements {
            Some(dict) => {
                let value = Value::Dictionary(dict.clone());
                let mut xml = Vec::new();
                plist::to_writer_xml(&mut xml, &value)?;
                let der = if material.main_executable && material.settings.emit_der_entitlements()
                {
                    Some(build_der_entitlements_blob(&der_encode_entitlements(&value)?))
                } else {
                    None
                };
                (Some(build_entitlements_blob(&xml)), der)
            }
            None => (None, None),
        };

        let mut exec_seg_flags = material
            .entitlements
            .map(executable_segment_flags)
            .unwrap_or(0);
        if material.main_executable {
            exec_seg_flags |= CS_EXECSEG_MAIN_BINARY;
        }

        Ok(Self {
            requirements,
            entitlements,
            der_entitlements,
            exec_seg_flags,
            flags: if material.is_adhoc() { CS_ADHOC } else { 0 },
        })
    }
}

/// Execution segment flags implied by entitlements.
pub fn executable_segment_flags(entitlements: &Dictionary) -> u64 {
    const FLAGS: &[(&str, u64)] = &[
        ("get-task-allow", CS_EXECSEG_ALLOW_UNSIGNED),
        ("run-unsigned-code", CS_EXECSEG_ALLOW_UNSIGNED),
        ("com.apple.private.cs.debugger", CS_EXECSEG_DEBUGGER),
        ("dynamic-codesigning", CS_EXECSEG_JIT),
        ("com.apple.private.skip-library-validation", CS_EXECSEG_SKIP_LV),
        ("com.apple.private.amfi.can-load-cdhash", CS_EXECSEG_CAN_LOAD_CDHASH),
        ("com.apple.private.amfi.can-execute-cdhash", CS_EXECSEG_CAN_EXEC_CDHASH),
    ];

    FLAGS
        .iter()
        .filter(|(key, _)| {
            entitlements
                .get(*key)
                .and_then(Value::as_boolean)
                .unwrap_or(false)
        })
        .fold(0, |acc, (_, flag)| acc | flag)
}

/// Signs every slice of `binary` in memory.
///
/// Existing signatures are replaced. Slices are committed only if all of
/// them sign successfully.
pub fn sign_binary(binary: &mut FatBinary, material: &SigningMaterial<'_>) -> Result<()> {
    let parts = SignatureParts::new(material)?;
    binary.edit_slices(|image| {
        sign_image(image, material, &parts)?;
        Ok(true)
    })?;
    log::debug!(
        "signed {} ({} slice(s), {})",
        material.identifier,
        binary.slices().len(),
        if material.is_adhoc() { "adhoc" } else { "certificate" }
    );
    Ok(())
}

fn sign_image(
    image: &mut MachOImage,
    material: &SigningMaterial<'_>,
    parts: &SignatureParts,
) -> Result<()> {
    let mut reserved = estimate_size(image.signature_offset(), material, parts);
    loop {
        let code_limit = image.reserve_signature(reserved)?;
        let blob = assemble(image, code_limit, material, parts)?;
        if blob.len() <= reserved {
            return image.embed_signature(&blob);
        }
        log::debug!(
            "signature needs {} bytes, {reserved} reserved; retrying",
            blob.len()
        );
        reserved = align_up(blob.len() + 1024, 16);
    }
}

/// Builds the code directories and the complete SuperBlob for an image whose
/// signature space is already reserved at `code_limit`.
fn assemble(
    image: &MachOImage,
    code_limit: usize,
    material: &SigningMaterial<'_>,
    parts: &SignatureParts,
) -> Result<Vec<u8>> {
    let code = image
        .data()
        .get(..code_limit)
        .ok_or_else(|| Error::Format("code limit beyond image".into()))?;
    let (text_offset, text_size) = image.text_segment_range();
    let settings = material.settings;

    let code_directories: Vec<CodeDirectory> = settings
        .digest_types()
        .iter()
        .map(|&digest| {
            let mut builder = CodeDirectoryBuilder::new(material.identifier, code)
                .digest(digest)
                .page_size(settings.page_size_bytes())
                .requirements(&parts.requirements)
                .exec_seg_base(text_offset)
                .exec_seg_limit(text_size)
                .exec_seg_flags(parts.exec_seg_flags)
                .flags(parts.flags);
            if let (Some(team), false) = (material.team_id, material.is_adhoc()) {
                builder = builder.team_id(team);
            }
            if let Some(info) = material.info_plist {
                builder = builder.info_plist(info);
            }
            if let Some(resources) = material.code_resources {
                builder = builder.resources(resources);
            }
            if let Some(ent) = &parts.entitlements {
                builder = builder.entitlements(ent);
            }
            if let Some(der) = &parts.der_entitlements {
                builder = builder.der_entitlements(der);
            }
            builder.build()
        })
        .collect();

    let serialized: Vec<Vec<u8>> = code_directories.iter().map(CodeDirectory::to_bytes).collect();
    let primary = serialized
        .first()
        .ok_or_else(|| Error::Config("no code directory digest configured".into()))?;

    let cms = match material.identity {
        Some(identity) => {
            let cdhashes: Vec<CdHash> = code_directories
                .iter()
                .map(|cd| CdHash::new(cd.digest, cd.cdhash()))
                .collect();
            cms::sign_code_directory(
                primary,
                identity.signing_key(),
                identity.certificate(),
                identity.chain(),
                &cdhashes,
            )?
        }
        None => Vec::new(),
    };

    let mut builder = SuperBlobBuilder::new();
    for cd in serialized {
        builder = builder.code_directory(cd);
    }
    builder = builder.requirements(parts.requirements.clone());
    if let Some(ent) = &parts.entitlements {
        builder = builder.entitlements(ent.clone());
    }
    if let Some(der) = &parts.der_entitlements {
        builder = builder.der_entitlements(der.clone());
    }
    builder.cms_signature(build_signature_blob(&cms)).build()
}

/// Upper bound of the signature size for an image signed at `code_limit`.
fn estimate_size(code_limit: usize, material: &SigningMaterial<'_>, parts: &SignatureParts) -> usize {
    let settings = material.settings;
    let pages = code_limit.div_ceil(settings.page_size_bytes());
    let strings = material.identifier.len() + 1 + material.team_id.map_or(0, |t| t.len() + 1);

    let code_directories: usize = settings
        .digest_types()
        .iter()
        .map(|d| CODEDIRECTORY_HEADER_SIZE + strings + (CSSLOT_SPECIAL_MAX + pages) * d.size())
        .sum();
    let blobs = parts.requirements.len()
        + parts.entitlements.as_ref().map_or(0, Vec::len)
        + parts.der_entitlements.as_ref().map_or(0, Vec::len);
    let index = SUPERBLOB_HEADER_SIZE + INDEX_ENTRY_SIZE * (settings.digest_types().len() + 4);
    let cms = match material.identity {
        Some(identity) => {
            identity.certificate_der().len()
                + identity
                    .chain()
                    .iter()
                    .map(|c| c.constructed_data().len())
                    .sum::<usize>()
                + CMS_OVERHEAD
        }
        None => 0,
    } + BLOB_HEADER_SIZE;

    align_up(code_directories + blobs + index + cms, 16)
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codesign::inspector::verify_page_hashes;
    use crate::codesign::{DigestType, EmbeddedSignature};
    use crate::macho::testutil::{fat, thin_arm64, ThinImage};

    fn parse(image: &MachOImage) -> EmbeddedSignature {
        EmbeddedSignature::parse(image.signature_data().unwrap()).unwrap()
    }

    #[test]
    fn test_adhoc_thin() {
        let settings = SigningSettings::default();
        let mut bin = FatBinary::parse(ThinImage::new().x86_64().build()).unwrap();
        let material = SigningMaterial {
            main_executable: true,
            ..SigningMaterial::new("com.example.tool", &settings)
        };
        sign_binary(&mut bin, &material).unwrap();

        let image = &bin.slices()[0];
        assert!(verify_page_hashes(image).unwrap());
        let sig = parse(image);
        let cds = sig.code_directories().unwrap();
        assert_eq!(cds.len(), 2);
        assert_eq!(cds[0].digest, DigestType::Sha1);
        assert_eq!(cds[1].digest, DigestType::Sha256);
        assert_eq!(cds[0].identifier, "com.example.tool");
        assert_eq!(cds[0].flags & CS_ADHOC, CS_ADHOC);
        assert_eq!(cds[0].exec_seg_flags & CS_EXECSEG_MAIN_BINARY, CS_EXECSEG_MAIN_BINARY);
        assert!(cds[0].team_id.is_none());
        assert!(sig.cms().is_none());
        assert_eq!(sig.requirements().unwrap(), empty_requirements().as_slice());
    }

    #[test]
    fn test_fat_every_slice() {
        let settings = SigningSettings::default().digests(vec![DigestType::Sha256]);
        let mut bin = FatBinary::parse(fat(&[ThinImage::new().x86_64().build(), thin_arm64()])).unwrap();
        sign_binary(&mut bin, &SigningMaterial::new("lib", &settings)).unwrap();

        for image in bin.slices() {
            assert!(verify_page_hashes(image).unwrap());
            let cds = parse(image).code_directories().unwrap();
            assert_eq!(cds.len(), 1);
            assert_eq!(cds[0].exec_seg_flags, 0);
        }
        let reparsed = FatBinary::parse(bin.serialize()).unwrap();
        assert_eq!(reparsed.slices(), bin.slices());
    }

    #[test]
    fn test_deterministic_and_resign() {
        let settings = SigningSettings::default();
        let material = SigningMaterial::new("com.example.tool", &settings);
        let mut a = FatBinary::parse(ThinImage::new().x86_64().build()).unwrap();
        let mut b = a.clone();
        sign_binary(&mut a, &material).unwrap();
        sign_binary(&mut b, &material).unwrap();
        assert_eq!(a.serialize(), b.serialize());

        // signing again replaces the signature in place
        sign_binary(&mut b, &material).unwrap();
        assert_eq!(a.serialize(), b.serialize());
    }

    #[test]
    fn test_entitlements_and_special_slots() {
        let settings = SigningSettings::default().digests(vec![DigestType::Sha256]);
        let mut ents = Dictionary::new();
        ents.insert("get-task-allow".into(), Value::Boolean(true));
        ents.insert("dynamic-codesigning".into(), Value::Boolean(true));
        let info = b"<plist/>".to_vec();
        let resources = b"resources".to_vec();

        let mut bin = FatBinary::parse(ThinImage::new().x86_64().build()).unwrap();
        let material = SigningMaterial {
            entitlements: Some(&ents),
            info_plist: Some(&info),
            code_resources: Some(&resources),
            main_executable: true,
            ..SigningMaterial::new("app", &settings)
        };
        sign_binary(&mut bin, &material).unwrap();

        let sig = parse(&bin.slices()[0]);
        let cd = &sig.code_directories().unwrap()[0];
        assert_eq!(
            cd.exec_seg_flags,
            CS_EXECSEG_MAIN_BINARY | CS_EXECSEG_ALLOW_UNSIGNED | CS_EXECSEG_JIT
        );
        assert_eq!(cd.special_slots.len(), CSSLOT_SPECIAL_MAX);
        assert_eq!(
            cd.special_slot(CSSLOT_SPECIAL_INFOSLOT).unwrap(),
            DigestType::Sha256.digest(&info).as_slice()
        );
        assert_eq!(
            cd.special_slot(CSSLOT_SPECIAL_RESOURCEDIR).unwrap(),
            DigestType::Sha256.digest(&resources).as_slice()
        );
        let der = sig.der_entitlements().unwrap();
        assert_eq!(der[0], 0x70);
        assert!(sig.entitlements().is_some());
    }

    #[test]
    fn test_non_main_skips_der() {
        let settings = SigningSettings::default();
        let mut ents = Dictionary::new();
        ents.insert("get-task-allow".into(), Value::Boolean(true));
        let mut bin = FatBinary::parse(ThinImage::new().dylib().build()).unwrap();
        let material = SigningMaterial {
            entitlements: Some(&ents),
            ..SigningMaterial::new("lib", &settings)
        };
        sign_binary(&mut bin, &material).unwrap();
        let sig = parse(&bin.slices()[0]);
        assert!(sig.der_entitlements().is_none());
        let cd = &sig.code_directories().unwrap()[0];
        assert_eq!(cd.special_slots.len(), CSSLOT_SPECIAL_ENTITLEMENTS);
    }

    #[test]
    fn test_certificate_signature() {
        use crate::crypto::testutil::make_identity;
        use secrecy::SecretString;

        let test = make_identity("Apple Development: Jane (X1)", "TEAM123456", "pw");
        let identity = Identity::from_pkcs12(&test.p12, &SecretString::new("pw".into())).unwrap();
        let settings = SigningSettings::default();
        let mut bin = FatBinary::parse(ThinImage::new().x86_64().build()).unwrap();
        let material = SigningMaterial {
            identity: Some(&identity),
            team_id: identity.team_id(),
            main_executable: true,
            ..SigningMaterial::new("com.example.app", &settings)
        };
        sign_binary(&mut bin, &material).unwrap();

        let image = &bin.slices()[0];
        assert!(verify_page_hashes(image).unwrap());
        let sig = parse(image);
        let cds = sig.code_directories().unwrap();
        assert_eq!(cds[0].flags & CS_ADHOC, 0);
        assert_eq!(cds[0].team_id.as_deref(), Some("TEAM123456"));
        assert_eq!(
            sig.requirements().unwrap(),
            designated_requirements_blob("com.example.app", "Apple Development: Jane (X1)")
                .as_slice()
        );

        let cms = sig.cms().unwrap();
        let signed = cryptographic_message_syntax::SignedData::parse_ber(cms).unwrap();
        assert!(signed.signed_content().is_none());
        let signer = signed.signers().next().unwrap();
        signer
            .verify_signature_with_signed_data_and_content(
                &signed,
                sig.blob(CSSLOT_CODEDIRECTORY).unwrap().data.as_slice(),
            )
            .unwrap();
    }

    #[test]
    fn test_executable_segment_flags() {
        let mut ents = Dictionary::new();
        assert_eq!(executable_segment_flags(&ents), 0);
        ents.insert("get-task-allow".into(), Value::Boolean(false));
        assert_eq!(executable_segment_flags(&ents), 0);
        ents.insert("run-unsigned-code".into(), Value::Boolean(true));
        ents.insert(
            "com.apple.private.skip-library-validation".into(),
            Value::Boolean(true),
        );
        assert_eq!(
            executable_segment_flags(&ents),
            CS_EXECSEG_ALLOW_UNSIGNED | CS_EXECSEG_SKIP_LV
        );
    }
}
