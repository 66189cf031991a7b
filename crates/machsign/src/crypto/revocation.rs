//! Local certificate validation and revocation status.
//!
//! Expiration and chain checks run locally. Whether a certificate has been
//! revoked is asked of a [`RevocationResponder`] supplied by the caller; the
//! core never touches the network.

use super::identity::Identity;
use super::profile::ProvisioningProfile;
use chrono::{DateTime, Utc};
use x509_certificate::CapturedX509Certificate;

/// Outcome of a revocation check. The numeric codes are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevocationStatus {
    Valid,
    Revoked,
    Expired,
    Unknown,
}

impl RevocationStatus {
    pub fn code(self) -> i32 {
        match self {
            RevocationStatus::Valid => 0,
            RevocationStatus::Revoked => 1,
            RevocationStatus::Expired => 2,
            RevocationStatus::Unknown => -1,
        }
    }
}

impl std::fmt::Display for RevocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RevocationStatus::Valid => "valid",
            RevocationStatus::Revoked => "revoked",
            RevocationStatus::Expired => "expired",
            RevocationStatus::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationReport {
    pub status: RevocationStatus,
    /// The earlier of the certificate's and the profile's expiration.
    pub expiration_date: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RevocationReport {
    fn new(status: RevocationStatus, expiration_date: Option<DateTime<Utc>>) -> Self {
        Self {
            status,
            expiration_date,
            error: None,
        }
    }

    fn unknown(expiration_date: Option<DateTime<Utc>>, error: impl Into<String>) -> Self {
        Self {
            status: RevocationStatus::Unknown,
            expiration_date,
            error: Some(error.into()),
        }
    }
}

/// Answer from a [`RevocationResponder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderStatus {
    Good,
    Revoked,
    Unknown(String),
}

/// Source of revocation information, typically an OCSP client owned by the
/// caller.
pub trait RevocationResponder: Send + Sync {
    fn status(
        &self,
        certificate: &CapturedX509Certificate,
        issuer: Option<&CapturedX509Certificate>,
    ) -> ResponderStatus {
        let _ = (certificate, issuer);
        ResponderStatus::Unknown("no revocation responder configured".into())
    }
}

/// Responder that never knows.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResponder;

impl RevocationResponder for NoResponder {}

/// Checks the identity against the profile, the trust anchors and the
/// responder.
///
/// Indeterminate states are reported as [`RevocationStatus::Unknown`] with
/// an error message; this function itself cannot fail.
pub fn check_revocation(
    profile: &ProvisioningProfile,
    identity: &Identity,
    anchors: &[CapturedX509Certificate],
    responder: &dyn RevocationResponder,
) -> RevocationReport {
    check_revocation_at(profile, identity, anchors, responder, Utc::now())
}

pub fn check_revocation_at(
    profile: &ProvisioningProfile,
    identity: &Identity,
    anchors: &[CapturedX509Certificate],
    responder: &dyn RevocationResponder,
    now: DateTime<Utc>,
) -> RevocationReport {
    let cert_expiry = identity.not_after();
    let expiration = Some(match profile.expiration_date {
        Some(profile_expiry) => cert_expiry.min(profile_expiry),
        None => cert_expiry,
    });

    if expiration.is_some_and(|e| e <= now) {
        log::debug!("identity or profile expired at {expiration:?}");
        return RevocationReport::new(RevocationStatus::Expired, expiration);
    }

    if !profile.contains_certificate(identity.certificate_der()) {
        return RevocationReport::unknown(
            expiration,
            "signing certificate is not listed in the provisioning profile",
        );
    }

    if let Err(message) = verify_chain(identity, anchors) {
        return RevocationReport::unknown(expiration, message);
    }

    let issuer = identity.chain().first();
    match responder.status(identity.certificate(), issuer) {
        ResponderStatus::Good => RevocationReport::new(RevocationStatus::Valid, expiration),
        ResponderStatus::Revoked => RevocationReport::new(RevocationStatus::Revoked, expiration),
        ResponderStatus::Unknown(message) => RevocationReport::unknown(expiration, message),
    }
}

/// Each certificate must be signed by the next one, in the issuer order the
/// identity was assembled in. With anchors, the last
/// certificate must be an anchor or be signed by one.
fn verify_chain(
    identity: &Identity,
    anchors: &[CapturedX509Certificate],
) -> std::result::Result<(), String> {
    let path: Vec<&CapturedX509Certificate> = std::iter::once(identity.certificate())
        .chain(identity.chain())
        .collect();

    for pair in path.windows(2) {
        pair[0]
            .verify_signed_by_certificate(pair[1])
            .map_err(|e| format!("certificate chain is broken: {e}"))?;
    }

    if anchors.is_empty() {
        return Ok(());
    }
    let Some(last) = path.last() else {
        return Ok(());
    };
    let anchored = anchors.iter().any(|anchor| {
        anchor.constructed_data() == last.constructed_data()
            || last.verify_signed_by_certificate(anchor).is_ok()
    });
    if anchored {
        Ok(())
    } else {
        Err("certificate chain does not lead to a trusted anchor".into())
    }
}
