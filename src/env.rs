//! The build environment: tool resolution, platform/SDK state, library
//! resolution, scratch directories and the worker pool.
//!
//! A single [`ToolEnv`] lives for the whole rebuild and is threaded by
//! reference through every component. Platform transitions (and the tool
//! cache flush they imply) are the only mutation after construction, and
//! they only happen between bundles, before any worker is launched.

use crate::{
    cmd::{Cmd, CmdKind},
    config::BuildConfig,
    deobfuscate::Deobfuscator,
    error::{RebuildError, Result},
    translate::FrameworkUpgrader,
    utils::{self, DottedVersion},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::{Mutex, RwLock},
};

/// Bundle platform names and the SDK names they select.
static PLATFORM: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("iPhoneOS", "iphoneos"),
        ("iOS", "iphoneos"),
        ("MacOSX", "macosx"),
        ("macOS", "macosx"),
        ("AppleTVOS", "appletvos"),
        ("tvOS", "appletvos"),
        ("watchOS", "watchos"),
    ])
});

static SUPPORTED_VERSIONS: &[&str] = &["1.0"];

static SDK_VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)*)").unwrap());

const XCRUN: &str = "/usr/bin/xcrun";

/// Process-wide environment for one rebuild run.
pub struct ToolEnv {
    config: BuildConfig,
    tool_paths: Vec<PathBuf>,
    alias_map: HashMap<String, PathBuf>,
    platform: RwLock<Option<&'static str>>,
    sdk: RwLock<Option<PathBuf>>,
    bundle_version: RwLock<String>,
    tool_cache: RwLock<HashMap<String, PathBuf>>,
    ld_version: Mutex<Option<Option<DottedVersion>>>,
    libclang_rt: Mutex<Option<PathBuf>>,
    temp_dirs: Mutex<Vec<tempfile::TempDir>>,
    pool: rayon::ThreadPool,
    deobfuscator: Mutex<Option<Deobfuscator>>,
}

impl std::fmt::Debug for ToolEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolEnv")
            .field("config", &self.config)
            .field("platform", &self.platform)
            .field("sdk", &self.sdk)
            .finish_non_exhaustive()
    }
}

impl ToolEnv {
    pub fn new(config: BuildConfig) -> Result<Self> {
        if let Some(liblto) = &config.liblto {
            if !liblto.exists() {
                return Err(RebuildError::ConfigInvalid(format!(
                    "libLTO path does not exist: {}",
                    liblto.display()
                )));
            }
        }
        let alias_map = match &config.library_list {
            Some(path) => load_library_list(path)?,
            None => HashMap::new(),
        };

        let mut tool_paths = config.tool_paths.clone();
        if let Some(dir) = default_tool_dir() {
            tool_paths.push(dir);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.effective_jobs())
            .build()
            .map_err(|e| RebuildError::ConfigInvalid(format!("worker pool: {e}")))?;

        let deobfuscator = config.symbol_map.as_ref().map(Deobfuscator::new);
        let sdk = config.sdk_path.clone();

        debug!("SDK path: {:?}", sdk);
        debug!("PATH: {:?}", tool_paths);

        Ok(ToolEnv {
            config,
            tool_paths,
            alias_map,
            platform: RwLock::new(None),
            sdk: RwLock::new(sdk),
            bundle_version: RwLock::new("1.0".to_string()),
            tool_cache: RwLock::new(HashMap::new()),
            ld_version: Mutex::new(None),
            libclang_rt: Mutex::new(None),
            temp_dirs: Mutex::new(Vec::new()),
            pool,
            deobfuscator: Mutex::new(deobfuscator),
        })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn verify_mode(&self) -> bool {
        self.config.verify_only
    }

    pub fn translate_watchos(&self) -> bool {
        self.config.translate_watchos
    }

    pub fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    /// The SDK root in effect, set explicitly or inferred from the platform.
    pub fn sdk(&self) -> Result<PathBuf> {
        self.sdk
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| RebuildError::ConfigInvalid("SDK path unknown".to_string()))
    }

    /// The current SDK's version, read off the SDK directory name
    /// (`WatchOS6.2.sdk` -> `6.2`). `None` when no SDK is set or the name
    /// carries no version.
    pub fn sdk_version(&self) -> Option<DottedVersion> {
        let sdk = self.sdk.read().unwrap();
        let name = sdk.as_ref()?.file_name()?.to_string_lossy().into_owned();
        SDK_VERSION_RE.captures(&name)?.get(1)?.as_str().parse().ok()
    }

    /// Platform state machine: first assignment wins, re-assignment of the
    /// same value is a no-op, a different value flushes the tool cache so
    /// SDK-relative lookups re-resolve.
    pub fn set_platform(&self, platform: Option<&str>) -> Result<()> {
        debug!("Setting platform to: {:?}", platform);
        let platform = match platform {
            None | Some("Unknown") => {
                if self.platform.read().unwrap().is_some() {
                    return Ok(());
                }
                error!("Platform unknown, abort");
                return Err(RebuildError::PlatformUnknown);
            }
            Some(p) => p,
        };
        let Some((&key, _)) = PLATFORM.get_key_value(platform) else {
            error!("Platform {platform} is not supported");
            return Err(RebuildError::PlatformUnsupported(platform.to_string()));
        };
        {
            let mut current = self.platform.write().unwrap();
            if let Some(previous) = *current {
                if previous != key {
                    warn!("Change platform from {previous} to {key}");
                    self.flush_tool_caches();
                } else {
                    return Ok(());
                }
            }
            *current = Some(key);
        }
        if self.sdk.read().unwrap().is_none() {
            let sdk = self.infer_sdk_path()?;
            debug!("SDK PATH: {}", sdk.display());
            *self.sdk.write().unwrap() = Some(sdk);
        }
        Ok(())
    }

    fn flush_tool_caches(&self) {
        self.tool_cache.write().unwrap().clear();
        *self.ld_version.lock().unwrap() = None;
        *self.libclang_rt.lock().unwrap() = None;
    }

    /// The lowercase SDK name for the current platform.
    pub fn platform_name(&self) -> Result<&'static str> {
        match *self.platform.read().unwrap() {
            Some(p) => Ok(PLATFORM[p]),
            None => {
                error!("Platform unset");
                Err(RebuildError::PlatformUnset)
            }
        }
    }

    pub fn platform_is(&self, name: &str) -> bool {
        self.platform_name().map(|p| p == name).unwrap_or(false)
    }

    /// Records the bundle schema version; only `1.0` is understood.
    pub fn set_version(&self, vers: &str) -> Result<()> {
        if SUPPORTED_VERSIONS.contains(&vers) {
            *self.bundle_version.write().unwrap() = vers.to_string();
            debug!("Bitcode bundle version: {vers}");
            Ok(())
        } else {
            error!("Bitcode bundle version not supported: {vers}");
            Err(RebuildError::BundleVersionUnsupported(vers.to_string()))
        }
    }

    /// Resolves a tool name to an absolute path: the ordered search paths
    /// first, then the SDK locator, caching whichever answered.
    pub fn get_tool(&self, name: &str) -> Result<PathBuf> {
        if let Some(tool) = self.tool_cache.read().unwrap().get(name) {
            return Ok(tool.clone());
        }
        for path in &self.tool_paths {
            let tool = path.join(name);
            if utils::is_tool_file(&tool) {
                debug!("Using: {}", tool.display());
                self.tool_cache.write().unwrap().insert(name.to_string(), tool.clone());
                return Ok(tool);
            }
        }
        // fall back plan, always uses the default toolchain
        debug!("Inferring {name} from xcrun");
        if let Some(out) = self.xcrun(&["-f", name]) {
            if let Some(tool) = out.split_whitespace().next() {
                let tool = PathBuf::from(tool);
                debug!("Using: {}", tool.display());
                self.tool_cache.write().unwrap().insert(name.to_string(), tool.clone());
                return Ok(tool);
            }
        }
        error!("Cannot find {name} in PATH");
        Err(RebuildError::ToolNotFound(name.to_string()))
    }

    fn xcrun_argv(&self) -> Vec<String> {
        let mut argv = vec![XCRUN.to_string()];
        if let Ok(platform) = self.platform_name() {
            argv.extend(["--sdk".to_string(), platform.to_string()]);
        }
        argv
    }

    fn xcrun(&self, args: &[&str]) -> Option<String> {
        let mut argv = self.xcrun_argv();
        argv.extend(args.iter().map(|s| s.to_string()));
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).env("TOOLCHAINS", "default");
        if let Some(dir) = developer_dir() {
            command.env("DEVELOPER_DIR", dir);
        }
        let output = command.output().ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            None
        }
    }

    fn infer_sdk_path(&self) -> Result<PathBuf> {
        let out = self.xcrun(&["--show-sdk-path"]).ok_or_else(|| {
            error!("Could not infer SDK path");
            RebuildError::ConfigInvalid("could not infer SDK path".to_string())
        })?;
        let sdk = out
            .split_whitespace()
            .next()
            .ok_or_else(|| RebuildError::ConfigInvalid("could not infer SDK path".to_string()))?;
        Ok(PathBuf::from(sdk))
    }

    /// The toolchain root, derived from the C frontend's location
    /// (`<toolchain>/usr/bin/clang`).
    pub fn toolchain_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = self.tool_cache.read().unwrap().get("toolchain_dir") {
            return Ok(dir.clone());
        }
        let clang = self.get_tool("clang")?;
        let toolchain = clang
            .parent()
            .and_then(Path::parent)
            .and_then(Path::parent)
            .ok_or_else(|| RebuildError::msg("cannot derive toolchain directory"))?
            .to_path_buf();
        self.tool_cache.write().unwrap().insert("toolchain_dir".to_string(), toolchain.clone());
        Ok(toolchain)
    }

    /// The compiler runtime library for `arch`, probed by asking the C
    /// frontend for its full job line and taking the last quoted token.
    pub fn libclang_rt(&self, arch: &str) -> Result<PathBuf> {
        if let Some(path) = self.libclang_rt.lock().unwrap().clone() {
            return Ok(path);
        }
        let mut probe = Cmd::new(
            "Clang",
            vec![
                self.get_tool("clang")?.to_string_lossy().into_owned(),
                "-arch".to_string(),
                arch.to_string(),
                "/dev/null".to_string(),
                "-isysroot".to_string(),
                self.sdk()?.to_string_lossy().into_owned(),
                "-###".to_string(),
            ],
            std::env::temp_dir(),
            CmdKind::Info,
        );
        probe.run(self)?;
        let path = if probe.skipped_for_testing() {
            // synthetic runs still need a deterministic runtime location
            self.toolchain_dir()?
                .join("usr/lib/clang/lib/darwin")
                .join(format!("libclang_rt.{}.a", self.platform_name().unwrap_or("osx")))
        } else {
            let out = probe.output().to_string();
            let mut quoted = out.split('"').rev();
            quoted
                .nth(1)
                .map(PathBuf::from)
                .ok_or_else(|| RebuildError::msg("could not infer compiler runtime library"))?
        };
        *self.libclang_rt.lock().unwrap() = Some(path.clone());
        Ok(path)
    }

    /// Directory holding the Swift runtime dylibs, `None` when the runtime
    /// cannot be resolved.
    pub fn swift_lib_path(&self, arch: &str) -> Option<PathBuf> {
        let core = self.resolve_dylibs(arch, "libswiftCore.dylib", false).ok()??;
        let path = core.parent()?.to_path_buf();
        debug!("Found swift dylib path: {}", path.display());
        Some(path)
    }

    /// Resolves a logical library name to an on-disk path.
    ///
    /// `{SDKPATH}`-prefixed names go through the framework-upgrade table and
    /// resolve against the SDK root; everything else searches the alias map,
    /// the configured search paths, the toolchain runtime directories and
    /// the SDK. `Ok(None)` is only returned under `allow_missing`, after a
    /// warning. Verify mode returns the input unchanged.
    pub fn resolve_dylibs(
        &self,
        arch: &str,
        lib: &str,
        allow_missing: bool,
    ) -> Result<Option<PathBuf>> {
        if self.verify_mode() {
            return Ok(Some(PathBuf::from(lib)));
        }
        let lib = match lib.strip_prefix("{SDKPATH}") {
            Some(sdk_relative) => {
                let upgraded = FrameworkUpgrader::translate(sdk_relative);
                let lib_path = join_sdk(&self.sdk()?, &upgraded);
                let dir = lib_path.parent().unwrap_or(Path::new("/"));
                let name = lib_path.file_name().map(|n| n.to_string_lossy().into_owned());
                if let Some(name) = name {
                    if let Some(found) = find_library_in_dir(dir, &name, false) {
                        debug!("Found framework/dylib: {}", found.display());
                        return Ok(Some(found));
                    }
                }
                // the fallback below searches the upgraded name
                upgraded
            }
            None => lib.to_string(),
        };
        // assume this comes from the app payload; strip any path left over
        // from an unresolved SDK reference
        let libname = Path::new(&lib)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| lib.clone());
        if let Some(path) = self.alias_map.get(&libname) {
            return Ok(Some(path.clone()));
        }
        let mut search_paths: Vec<PathBuf> = self.config.library_paths.clone();
        if let Some(dir) = self.libclang_rt(arch)?.parent() {
            search_paths.push(dir.to_path_buf());
        }
        search_paths
            .push(self.toolchain_dir()?.join("usr/lib/swift").join(self.platform_name()?));
        let sdk = self.sdk()?;
        search_paths.push(sdk.join("usr/lib"));
        search_paths.push(sdk.join("System/Library/Frameworks"));
        for search_path in &search_paths {
            if let Some(found) = find_library_in_dir(search_path, &libname, true) {
                debug!("Found framework/dylib: {}", found.display());
                return Ok(Some(found));
            }
        }
        if allow_missing {
            warn!("{libname} not found in dylib search path");
            Ok(None)
        } else {
            debug!("Search Path: {:?}", search_paths);
            error!("{libname} not found in dylib search path");
            Err(RebuildError::LibraryNotFound(libname))
        }
    }

    /// Whether the linker is at least `version` (dotted-integer compare).
    /// The parsed version of `ld -v` is cached; an unparseable line answers
    /// `false` for every gate.
    pub fn satisfies_linker_version(&self, version: &str) -> Result<bool> {
        let mut cache = self.ld_version.lock().unwrap();
        let parsed = match cache.clone() {
            Some(parsed) => parsed,
            None => {
                let mut probe = Cmd::new(
                    "Ld",
                    vec![self.get_tool("ld")?.to_string_lossy().into_owned(), "-v".to_string()],
                    std::env::temp_dir(),
                    CmdKind::Info,
                );
                probe.run(self)?;
                let parsed =
                    probe.output().lines().next().and_then(utils::version_from_line);
                *cache = Some(parsed.clone());
                parsed
            }
        };
        let Some(have) = parsed else { return Ok(false) };
        let want: DottedVersion =
            version.parse().map_err(|_| RebuildError::msg("bad linker version gate"))?;
        Ok(have >= want)
    }

    /// Creates a scratch directory tracked for end-of-run cleanup. Under
    /// save-temps the directory is left behind.
    pub fn create_temp_directory(&self, prefix: &str) -> Result<PathBuf> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        if self.config.save_temps {
            return Ok(dir.into_path());
        }
        let path = dir.path().to_path_buf();
        self.temp_dirs.lock().unwrap().push(dir);
        Ok(path)
    }

    /// Removes every tracked scratch directory. Invoked unconditionally by
    /// the outer control path; a no-op under save-temps.
    pub fn cleanup_temp_directories(&self) {
        self.temp_dirs.lock().unwrap().clear();
    }

    /// Selects the symbol map for a slice UUID.
    pub fn set_uuid(&self, uuid: &str) {
        if let Some(deob) = self.deobfuscator.lock().unwrap().as_mut() {
            deob.select_uuid(uuid);
        }
    }

    /// Deobfuscates a diagnostic through the active symbol map, if any.
    pub fn try_deobfuscate(&self, msg: &str) -> Option<String> {
        self.deobfuscator.lock().unwrap().as_ref()?.try_deobfuscate(msg)
    }
}

/// `{SDKPATH}` references are absolute inside the SDK; `Path::join` would
/// otherwise replace the root.
fn join_sdk(sdk: &Path, lib: &str) -> PathBuf {
    sdk.join(lib.trim_start_matches('/'))
}

/// Probes a directory for a library: the exact name first, then the
/// stub/loaded extension swap, then a sibling framework bundle.
fn find_library_in_dir(directory: &Path, lib: &str, framework_dir: bool) -> Option<PathBuf> {
    let lib_path = directory.join(lib);
    if lib_path.is_file() {
        return Some(lib_path);
    }
    // Remap the file type (stubs <-> tbd file)
    let name = lib_path.to_string_lossy().into_owned();
    let remapped = if let Some(stem) = name.strip_suffix(".dylib") {
        format!("{stem}.tbd")
    } else if let Some(stem) = name.strip_suffix(".tbd") {
        if lib.starts_with("lib") {
            format!("{stem}.dylib")
        } else {
            stem.to_string()
        }
    } else {
        format!("{name}.tbd")
    };
    let remapped = PathBuf::from(remapped);
    if remapped.is_file() {
        return Some(remapped);
    }
    // check the framework path if needed
    if framework_dir {
        let stem = Path::new(lib).file_stem().map(|s| s.to_string_lossy().into_owned())?;
        return find_library_in_dir(&directory.join(format!("{stem}.framework")), lib, false);
    }
    None
}

fn load_library_list(path: &Path) -> Result<HashMap<String, PathBuf>> {
    if !path.is_file() {
        error!("library list doesn't exist: {}", path.display());
        return Err(RebuildError::ConfigInvalid(format!(
            "library list doesn't exist: {}",
            path.display()
        )));
    }
    let mut map = HashMap::new();
    for line in fs::read_to_string(path)?.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let full = fs::canonicalize(line).unwrap_or_else(|_| PathBuf::from(line));
        if let Some(base) = Path::new(line).file_name() {
            map.insert(base.to_string_lossy().into_owned(), full);
        }
    }
    debug!("Library Search List: {:?}", map);
    Ok(map)
}

/// The directory of the running binary, probed before the SDK locator the
/// way the original layout shipped its own `bin`.
fn default_tool_dir() -> Option<PathBuf> {
    std::env::current_exe().ok()?.parent().map(Path::to_path_buf)
}

/// `DEVELOPER_DIR` is only forced when the binary is installed under a
/// `Developer` tree.
fn developer_dir() -> Option<PathBuf> {
    let dir = std::env::current_exe().ok()?.parent()?.parent()?.to_path_buf();
    (dir.file_name()? == "Developer").then_some(dir)
}
