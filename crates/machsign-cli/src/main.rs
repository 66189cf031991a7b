//! Command-line interface for machsign.
//!
//! Every subcommand maps onto one engine operation.

use clap::{Args, Parser, Subcommand};
use machsign::codesign::DigestType;
use machsign::crypto::{Identity, ProvisioningProfile};
use machsign::{CodeSigningEngine, Engine, SigningRequest, SigningSettings};
use secrecy::SecretString;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "machsign")]
#[command(about = "Mach-O load command editing and code signing")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report whether a binary carries a code signature
    Check { binary: PathBuf },

    /// Add a dylib load command
    Inject {
        binary: PathBuf,
        /// Load path, e.g. @rpath/Tweak.dylib
        dylib: String,
        /// Emit LC_LOAD_WEAK_DYLIB
        #[arg(long)]
        weak: bool,
    },

    /// Remove dylib load commands
    Remove {
        binary: PathBuf,
        #[arg(required = true)]
        dylibs: Vec<String>,
    },

    /// List dylib load commands
    List { binary: PathBuf },

    /// Replace the path of a dylib load command
    Change {
        binary: PathBuf,
        old: String,
        new: String,
    },

    /// Sign an app bundle or a single binary in place
    Sign(SignArgs),

    /// Check a PKCS#12 identity against a provisioning profile
    Revocation {
        /// Provisioning profile
        #[arg(short = 'm', long)]
        profile: PathBuf,
        /// PKCS#12 file (.p12)
        #[arg(short = 'p', long)]
        pkcs12: PathBuf,
        /// Password for the PKCS#12 file
        #[arg(long, default_value = "")]
        password: String,
    },
}

#[derive(Args)]
struct SignArgs {
    /// App bundle or Mach-O binary
    input: PathBuf,

    /// Certificate file (PEM format)
    #[arg(short = 'c', long, requires = "private_key")]
    certificate: Option<PathBuf>,

    /// Private key file (PEM format, unencrypted PKCS#8)
    #[arg(short = 'k', long, requires = "certificate")]
    private_key: Option<PathBuf>,

    /// PKCS#12 file (.p12)
    #[arg(short = 'p', long, conflicts_with = "certificate")]
    pkcs12: Option<PathBuf>,

    /// Password for the PKCS#12 file
    #[arg(long, default_value = "")]
    password: String,

    /// Provisioning profile
    #[arg(short = 'm', long)]
    profile: Option<PathBuf>,

    /// Entitlements plist overriding the profile's
    #[arg(short = 'e', long)]
    entitlements: Option<PathBuf>,

    /// New bundle identifier
    #[arg(short = 'b', long)]
    bundle_id: Option<String>,

    /// New display name
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// New version
    #[arg(short = 'r', long)]
    version: Option<String>,

    /// Sign without a certificate
    #[arg(short = 'a', long)]
    adhoc: bool,

    /// Delete embedded.mobileprovision
    #[arg(long)]
    remove_provision: bool,

    /// Only emit the SHA-256 code directory
    #[arg(long)]
    sha256_only: bool,

    /// Worker threads (default: one per core)
    #[arg(short = 'j', long)]
    jobs: Option<usize>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> machsign::Result<()> {
    let engine = Engine::new();
    match command {
        Command::Check { binary } => {
            let signed = engine.check_signed(&binary)?;
            println!("{}: {}", binary.display(), if signed { "signed" } else { "not signed" });
        }
        Command::Inject { binary, dylib, weak } => engine.inject_dylib(&binary, &dylib, weak)?,
        Command::Remove { binary, dylibs } => engine.remove_dylibs(&binary, &dylibs)?,
        Command::List { binary } => {
            for dylib in engine.list_dylibs(&binary)? {
                println!("{dylib}");
            }
        }
        Command::Change { binary, old, new } => engine.change_dylib_path(&binary, &old, &new)?,
        Command::Sign(args) => {
            let input = args.input.clone();
            engine.sign(sign_request(args)?).wait()?;
            println!("Signed: {}", input.display());
        }
        Command::Revocation {
            profile,
            pkcs12,
            password,
        } => {
            let report = engine
                .check_revocation(&profile, &pkcs12, SecretString::new(password))
                .wait()?;
            println!("status: {} ({})", report.status, report.status.code());
            if let Some(date) = report.expiration_date {
                println!("expires: {}", date.to_rfc3339());
            }
            if let Some(error) = report.error {
                println!("detail: {error}");
            }
        }
    }
    Ok(())
}

fn sign_request(args: SignArgs) -> machsign::Result<SigningRequest> {
    let mut settings = SigningSettings::default();
    if args.sha256_only {
        settings = settings.digests(vec![DigestType::Sha256]);
    }
    if let Some(jobs) = args.jobs {
        settings = settings.workers(jobs);
    }

    let mut request = SigningRequest::new(args.input)
        .adhoc(args.adhoc)
        .remove_provision(args.remove_provision)
        .settings(settings);

    if let Some(path) = args.pkcs12 {
        let password = SecretString::new(args.password);
        request = request.identity(Identity::from_pkcs12_file(&path, &password)?);
    } else if let (Some(cert), Some(key)) = (args.certificate, args.private_key) {
        request = request.identity(Identity::from_pem(&std::fs::read(cert)?, &std::fs::read(key)?)?);
    }
    if let Some(path) = args.profile {
        request = request.profile(ProvisioningProfile::from_file(&path)?);
    }
    if let Some(path) = args.entitlements {
        request = request.entitlements_file(&path)?;
    }
    if let Some(id) = args.bundle_id {
        request = request.identifier(id);
    }
    if let Some(name) = args.name {
        request = request.display_name(name);
    }
    if let Some(version) = args.version {
        request = request.version(version);
    }
    Ok(request)
}
