//! Identities, provisioning profiles, CMS signatures and certificate checks.

pub mod cms;
pub mod identity;
pub mod profile;
pub mod revocation;

#[cfg(test)]
pub(crate) mod testutil;

pub use identity::{Identity, KeyType};
pub use profile::ProvisioningProfile;
pub use revocation::{
    check_revocation, NoResponder, ResponderStatus, RevocationReport, RevocationResponder,
    RevocationStatus,
};
