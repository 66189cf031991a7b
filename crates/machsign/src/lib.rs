//! Mach-O load command editing and Apple code signing.
//!
//! [`Engine`] is the entry point; the modules below it can also be used on
//! their own to parse binaries, build signatures or inspect bundles.

pub mod bundle;
pub mod codesign;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod macho;
pub mod settings;
pub mod signing;
pub mod task;

pub use engine::{CodeSigningEngine, Engine};
pub use error::{Error, ErrorKind};
pub use settings::SigningSettings;
pub use signing::SigningRequest;
pub use task::{CancellationToken, TaskHandle};

pub type Result<T> = std::result::Result<T, Error>;
