//! App bundle handling: discovery of nested code, Info.plist metadata and
//! the `_CodeSignature/CodeResources` seal.
//!
//! ```no_run
//! use machsign::bundle::{walker, CodeResourcesBuilder};
//!
//! let levels = walker::discover("Payload/Demo.app".as_ref(), 16)?;
//! for node in levels.iter().flatten() {
//!     let mut seal = CodeResourcesBuilder::new(&node.path, node.executable.as_deref());
//!     seal.scan()?;
//!     println!("{}: {} files", node.path.display(), seal.file_count());
//! }
//! # Ok::<(), machsign::Error>(())
//! ```

pub mod code_resources;
pub mod info_plist;
pub mod walker;

pub use code_resources::{CodeResourcesBuilder, CODE_RESOURCES_PATH};
pub use info_plist::InfoPlist;
pub use walker::{BundleKind, BundleNode};
