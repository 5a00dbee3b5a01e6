use std::path::PathBuf;

/// Immutable per-run settings for a rebuild.
///
/// A consumer binary fills this from its command line; the library only
/// validates the pieces it consumes (see [`crate::ToolEnv::new`]).
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// The Mach-O carrying the embedded bitcode bundles.
    pub input: PathBuf,
    /// Where the rebuilt Mach-O is installed.
    pub output: PathBuf,
    /// Additional tool search paths, probed before the SDK locator.
    pub tool_paths: Vec<PathBuf>,
    /// Additional dylib search paths (`-L` on the original tool).
    pub library_paths: Vec<PathBuf>,
    /// SDK root override; inferred from the platform when unset.
    pub sdk_path: Option<PathBuf>,
    /// File listing dylibs to link against, one absolute path per line.
    pub library_list: Option<PathBuf>,
    /// bcsymbolmap file or directory for deobfuscating link diagnostics.
    pub symbol_map: Option<PathBuf>,
    /// Verify the bundle without compiling.
    pub verify_only: bool,
    /// Leave all the scratch directories behind.
    pub save_temps: bool,
    /// Translate armv7k watch bundles to arm64_32.
    pub translate_watchos: bool,
    /// Compile Swift bitcode through the C frontend.
    pub compile_swift_as_c: bool,
    /// Start every Swift compile at an enabled optimization level.
    pub force_optimize_swift: bool,
    /// Worker-pool width for compile jobs; 0 means one per CPU.
    pub jobs: usize,
    /// libLTO path overriding the linker's default.
    pub liblto: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            input: PathBuf::new(),
            output: "a.out".into(),
            tool_paths: Vec::new(),
            library_paths: Vec::new(),
            sdk_path: None,
            library_list: None,
            symbol_map: None,
            verify_only: false,
            save_temps: false,
            translate_watchos: false,
            compile_swift_as_c: false,
            force_optimize_swift: false,
            jobs: 1,
            liblto: None,
        }
    }
}

impl BuildConfig {
    /// Effective worker count: `jobs`, or one per CPU when zero.
    pub fn effective_jobs(&self) -> usize {
        if self.jobs == 0 {
            num_cpus::get()
        } else {
            self.jobs
        }
    }
}
