pub mod editor;
pub mod load_command;
pub mod parser;
pub mod signer;
pub mod writer;

#[cfg(test)]
pub(crate) mod testutil;

pub use editor::LoadCommandEditor;
pub use load_command::{DylibCommand, DylibKind, LoadCommand};
pub use parser::{FatBinary, MachOImage};
pub use signer::{sign_binary, SigningMaterial};
