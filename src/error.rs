use std::{io, path::PathBuf};

pub type Result<T> = std::result::Result<T, RebuildError>;

/// Various errors raised while rebuilding a Mach-O from its bitcode bundles.
///
/// Everything here is fatal to the enclosing bundle. The only recoveries are
/// the single Swift link retry in [`crate::bundle::BitcodeBundle`] and the
/// weak-dylib-missing case, which is downgraded to a warning.
#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("{0}")]
    ConfigInvalid(String),
    #[error("platform unset")]
    PlatformUnset,
    #[error("platform unknown, abort")]
    PlatformUnknown,
    #[error("platform {0} is not supported")]
    PlatformUnsupported(String),
    #[error("bitcode bundle version not supported: {0}")]
    BundleVersionUnsupported(String),
    #[error("{0}")]
    ArchiveBroken(String),
    #[error("{tool} option verification failed for {subject} ({msg})")]
    OptionRejected { tool: &'static str, subject: String, msg: String },
    #[error("cannot find {0} in PATH")]
    ToolNotFound(String),
    #[error("{0} not found in dylib search path")]
    LibraryNotFound(String),
    #[error("{name} exited with {code}\n{transcript}")]
    ToolRunFailed { name: &'static str, code: i32, transcript: String },
    #[error("bundle only contains bitcode-marker {path} ({arch})")]
    BundleOnlyContainsMarker { path: PathBuf, arch: String },
    #[error("rebuild with optimization also failed: {0}")]
    RetryExhausted(#[source] Box<RebuildError>),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RebuildError {
    pub(crate) fn msg(msg: impl std::fmt::Display) -> Self {
        RebuildError::Message(msg.to_string())
    }
}
