//! Embedded code signature structures: code directories, requirements,
//! entitlements and the SuperBlob that holds them.

pub mod code_directory;
pub mod constants;
pub mod der;
pub mod inspector;
pub mod requirements;
pub mod superblob;

pub use code_directory::{CodeDirectory, CodeDirectoryBuilder, DigestType};
pub use inspector::{check_signed, inspect, SliceSignature};
pub use superblob::{EmbeddedSignature, SuperBlobBuilder};
