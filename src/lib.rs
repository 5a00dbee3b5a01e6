//! Rebuilds Mach-O binaries from the bitcode bundles they embed.
//!
//! A binary submitted with embedded bitcode carries, per architecture, an
//! archive of its translation units together with the compiler and linker
//! argument vectors that produced it. This crate disassembles such a binary,
//! recompiles every translation unit with the current toolchain (optionally
//! retargeting armv7k watch applications to arm64_32), relinks each slice,
//! and stitches the slices back into a fat output.
//!
//! The high-level entry point is [`rebuild`]; the pieces compose for
//! consumers that need finer control:
//!
//! ```no_run
//! use bitcode_rebuild::{rebuild, BuildConfig};
//!
//! let config = BuildConfig {
//!     input: "App".into(),
//!     output: "App.rebuilt".into(),
//!     jobs: 4,
//!     ..Default::default()
//! };
//! rebuild(config)?;
//! # Ok::<(), bitcode_rebuild::RebuildError>(())
//! ```
//!
//! External tools (the C and Swift frontends, the linker, the fat-binary
//! and archive utilities) are opaque subprocesses; setting the `TESTING`
//! environment variable replaces their execution with synthetic successes.

#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{RebuildError, Result};

mod config;
pub use config::BuildConfig;

pub mod env;
pub use env::ToolEnv;

pub mod cmd;
pub use cmd::{Cmd, CmdKind};

pub mod verify;
pub mod translate;

pub mod deobfuscate;
pub use deobfuscate::Deobfuscator;

pub mod xar;
pub use xar::{Archive, BundleMetadata, Dylib, FileEntry, Frontend};

pub mod macho;
pub use macho::{Macho, MachoType};

pub mod bundle;
pub use bundle::BundleOutput;

pub mod utils;

/// Rebuilds the configured Mach-O from its embedded bitcode: every
/// architecture is recompiled and relinked, and the slices are installed at
/// the configured output (skipped in verify mode). Scratch directories are
/// removed on the way out, success or failure, unless save-temps is set.
pub fn rebuild(config: BuildConfig) -> Result<()> {
    let env = ToolEnv::new(config)?;
    let result = rebuild_with_env(&env);
    env.cleanup_temp_directories();
    result
}

fn rebuild_with_env(env: &ToolEnv) -> Result<()> {
    let input = env.config().input.clone();
    if !input.is_file() {
        let err = RebuildError::ConfigInvalid(format!(
            "Input macho file doesn't exist: {}",
            input.display()
        ));
        error!("{err}");
        return Err(err);
    }

    let mut macho = Macho::new(&input, env)?;
    for arch in macho.archs().to_vec() {
        macho.build_bitcode(&arch, env)?;
    }

    if !env.verify_mode() {
        let output = env.config().output.clone();
        macho.install_output(&output, env)?;
    }
    Ok(())
}
