//! The recursive bundle rebuild engine.
//!
//! One [`BitcodeBundle`] rebuilds one architecture's bundle: it extracts the
//! archive, reconstructs the link options, compiles every bitcode entry
//! through the worker pool, rebuilds nested bundles strictly sequentially on
//! the enclosing thread (the pool is shared across the whole recursion, so
//! concurrent nesting would starve it), and finally drives the linker.
//! A failed link of a Swift-containing bundle is retried exactly once with
//! optimization enabled.

use crate::{
    cmd::{self, Cmd},
    env::ToolEnv,
    error::{RebuildError, Result},
    translate::{ClangCC1Translator, SwiftArgTranslator},
    utils::DottedVersion,
    verify::{CLANG_VERIFIER, LD_VERIFIER, SWIFT_VERIFIER},
    xar::{Archive, BundleMetadata, FileEntry, Frontend},
};
use rayon::prelude::*;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

/// The finished rebuild of one slice.
#[derive(Debug, Clone)]
pub struct BundleOutput {
    pub arch: String,
    pub output: PathBuf,
    pub is_executable: bool,
    /// Whether the bundle was built with hidden symbols.
    pub hide_symbols: bool,
    /// The linker argv the bundle was linked with, for auditing.
    pub link_argv: Vec<String>,
}

/// Distinguishes a failure of the final link (retryable for Swift bundles)
/// from everything before it.
enum RunFailure {
    Link(RebuildError),
    Other(RebuildError),
}

impl RunFailure {
    fn into_error(self) -> RebuildError {
        match self {
            RunFailure::Link(e) | RunFailure::Other(e) => e,
        }
    }
}

/// Rebuilds the bundle archive at `input` for `arch` into `output`.
///
/// At most two attempts are made: when the first link of a Swift-containing
/// bundle fails, a fresh bundle is built with `force_optimize_swift` (and,
/// under translate-watchos, `compile_swift_as_c`) before giving up.
pub fn build(arch: &str, input: &Path, output: &Path, env: &ToolEnv) -> Result<BundleOutput> {
    let mut force_optimize_swift = env.config().force_optimize_swift;
    let mut compile_swift_as_c = env.config().compile_swift_as_c;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut bundle = BitcodeBundle::new(arch, input, output, env)?;
        bundle.force_optimize_swift = force_optimize_swift;
        bundle.compile_swift_as_c = compile_swift_as_c;
        match bundle.run(env) {
            Ok(out) => return Ok(out),
            Err(failure) => {
                let link_failed = matches!(failure, RunFailure::Link(_));
                let err = failure.into_error();
                if attempt == 1
                    && link_failed
                    && bundle.contains_swift
                    && !force_optimize_swift
                {
                    warn!("Rebuild failing swift project with optimization");
                    force_optimize_swift = true;
                    if bundle.is_translate_watchos(env) {
                        compile_swift_as_c = true;
                    }
                    continue;
                }
                return Err(if attempt > 1 {
                    RebuildError::RetryExhausted(Box::new(err))
                } else {
                    err
                });
            }
        }
    }
}

struct CompileJob {
    cmd: Cmd,
    /// Output name relative to the scratch directory.
    output: String,
}

/// One in-flight bundle rebuild.
pub struct BitcodeBundle {
    arch: String,
    input: PathBuf,
    output: PathBuf,
    archive: Archive,
    meta: BundleMetadata,
    is_executable: bool,
    contains_swift: bool,
    deployment_target: Option<String>,
    force_optimize_swift: bool,
    compile_swift_as_c: bool,
}

impl BitcodeBundle {
    /// Extracts the archive and takes the global platform and bundle-version
    /// state from its metadata. Under translate-watchos an armv7k watch
    /// bundle is retargeted to arm64_32 for every subsequent step.
    pub fn new(arch: &str, input: &Path, output: &Path, env: &ToolEnv) -> Result<Self> {
        let archive = Archive::open(input, env)?;
        let meta = archive.metadata()?;
        env.set_version(&meta.version)?;
        env.set_platform(Some(&meta.platform))?;

        let mut arch = arch.to_string();
        if env.translate_watchos() && env.platform_is("watchos") && arch == "armv7k" {
            arch = "arm64_32".to_string();
        }

        Ok(BitcodeBundle {
            arch,
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            archive,
            meta,
            is_executable: false,
            contains_swift: false,
            deployment_target: None,
            force_optimize_swift: env.config().force_optimize_swift,
            compile_swift_as_c: env.config().compile_swift_as_c,
        })
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    fn is_translate_watchos(&self, env: &ToolEnv) -> bool {
        env.translate_watchos() && env.platform_is("watchos")
    }

    /// Whether this bundle needs the Swift Concurrency back-deployment
    /// patches: an SDK predating the async runtime plus a reference to
    /// `libswift_Concurrency`.
    fn needs_swift_async_patch(&self, env: &ToolEnv) -> bool {
        let threshold: DottedVersion = match env.platform_name() {
            Ok("iphoneos") | Ok("appletvos") => "15.2".parse().unwrap(),
            Ok("watchos") => "8.3".parse().unwrap(),
            _ => return false,
        };
        let Ok(sdk) = self.meta.sdk_version.parse::<DottedVersion>() else { return false };
        sdk < threshold
            && self.meta.dylibs.iter().any(|d| d.name.contains("libswift_Concurrency"))
    }

    /// Reconstructs the linker options from the bundle metadata: repairs a
    /// truncated `-sectalign`, verifies against the whitelist, pins the
    /// watch deployment target, appends the SDK arguments, and applies the
    /// legacy-entry and Swift-async patches.
    fn link_options(&mut self, env: &ToolEnv) -> Result<Vec<String>> {
        let mut opts = self.meta.link_options.clone();

        fix_sectalign(&mut opts);

        if let Err(msg) = LD_VERIFIER.verify(&opts) {
            let err = RebuildError::OptionRejected {
                tool: "ld",
                subject: format!("bundle {}", self.input.display()),
                msg,
            };
            error!("{err}");
            return Err(err);
        }
        if opts.iter().any(|o| o == "-execute") {
            self.is_executable = true;
        }

        // make sure the linker has a non-zero version min for watchos
        let translate = self.is_translate_watchos(env);
        match opts.iter().position(|o| o == "-watchos_version_min") {
            Some(i) if i + 1 < opts.len() => {
                if opts[i + 1] == "0.0.0" {
                    opts[i + 1] = if translate { "5.0.0" } else { "2.0.0" }.to_string();
                }
                self.deployment_target = Some(opts[i + 1].clone());
            }
            Some(_) => {}
            None if translate => {
                opts.extend(["-watchos_version_min".to_string(), "5.0.0".to_string()]);
            }
            None => {}
        }

        if self.meta.platform != "Unknown" {
            opts.extend(["-syslibroot".to_string(), env.sdk()?.display().to_string()]);
        }
        if self.meta.sdk_version != "NA" {
            opts.extend(["-sdk_version".to_string(), self.meta.sdk_version.clone()]);
        }

        self.apply_legacy_watch_entry(&mut opts, env)?;

        if self.needs_swift_async_patch(env) {
            opts.extend(["-rpath".to_string(), "/usr/lib/swift".to_string()]);
        }
        Ok(opts)
    }

    /// Watch extensions built against a pre-6.0 SDK enter through `_main`;
    /// linking them against a 6.0+ SDK needs the `_WKExtensionMain` shim
    /// from the legacy static library.
    fn apply_legacy_watch_entry(&self, opts: &mut Vec<String>, env: &ToolEnv) -> Result<()> {
        if !env.platform_is("watchos") {
            return Ok(());
        }
        let six: DottedVersion = "6.0".parse().unwrap();
        let current_newer = env.sdk_version().map(|v| v > six).unwrap_or(false);
        let bundle_older = self
            .meta
            .sdk_version
            .parse::<DottedVersion>()
            .map(|v| v < six)
            .unwrap_or(false);
        if !current_newer || !bundle_older {
            return Ok(());
        }
        let Some(entry) = opts.iter().position(|o| o == "-e") else { return Ok(()) };
        if entry + 1 >= opts.len() {
            return Ok(());
        }
        if opts[entry + 1] == "_main" {
            opts[entry + 1] = "_WKExtensionMain".to_string();
        } else {
            let existing = opts[entry + 1].clone();
            opts.extend(["-alias".to_string(), existing, "_WKExtensionMain".to_string()]);
        }
        opts.push(env.sdk()?.join("usr/lib/libWKExtensionMainLegacy.a").display().to_string());
        Ok(())
    }

    /// Builds the compile job for one bitcode entry.
    fn construct_bitcode_job(
        &mut self,
        name: &str,
        frontend: Frontend,
        argv: &[String],
        env: &ToolEnv,
    ) -> Result<CompileJob> {
        let output_name = format!("{name}.o");
        let dir = self.archive.dir.clone();
        let translate = self.is_translate_watchos(env);
        match frontend {
            Frontend::Clang => {
                if let Err(msg) = CLANG_VERIFIER.verify(argv) {
                    let err = RebuildError::OptionRejected {
                        tool: "clang",
                        subject: format!("bitcode {name}"),
                        msg,
                    };
                    error!("{err}");
                    return Err(err);
                }
                let mut options = ClangCC1Translator::upgrade(argv, &self.arch);
                if translate {
                    options = ClangCC1Translator::translate_triple(&options);
                }
                if env.platform_is("watchos") {
                    options.push("-fno-gnu-inline-asm".to_string());
                }
                let cmd = cmd::clang_cc1(env, &options, name, &output_name, &dir)?;
                Ok(CompileJob { cmd, output: output_name })
            }
            Frontend::Swift => {
                self.contains_swift = true;
                if let Err(msg) = SWIFT_VERIFIER.verify(argv) {
                    let err = RebuildError::OptionRejected {
                        tool: "swift",
                        subject: format!("bitcode {name}"),
                        msg,
                    };
                    error!("{err}");
                    return Err(err);
                }
                if self.compile_swift_as_c {
                    let mut options = SwiftArgTranslator::upgrade(argv, &self.arch);
                    options = SwiftArgTranslator::translate_to_clang(&options);
                    if self.force_optimize_swift {
                        options = ClangCC1Translator::add_optimization(&options);
                    }
                    if translate {
                        options = ClangCC1Translator::translate_triple(&options);
                    }
                    let cmd = cmd::clang_cc1(env, &options, name, &output_name, &dir)?;
                    Ok(CompileJob { cmd, output: output_name })
                } else {
                    // swift dispatches on the input extension
                    let bcname = format!("{name}.bc");
                    fs::rename(dir.join(name), dir.join(&bcname))?;
                    let mut options = argv.to_vec();
                    if self.force_optimize_swift {
                        options = SwiftArgTranslator::add_optimization(&options);
                    }
                    if translate {
                        options = SwiftArgTranslator::translate_triple(&options);
                    }
                    if self.needs_swift_async_patch(env) {
                        options.push("-swift-async-frame-pointer=never".to_string());
                    }
                    let cmd = cmd::swift_frontend(env, &options, &bcname, &output_name, &dir)?;
                    Ok(CompileJob { cmd, output: output_name })
                }
            }
        }
    }

    /// Retargets LTO inputs to the arm64_32 triple, returning the rewritten
    /// file names.
    fn rewrite_lto_inputs(&self, inputs: &[String], env: &ToolEnv) -> Result<Vec<String>> {
        let mut rewritten = Vec::with_capacity(inputs.len());
        for input in inputs {
            let out_name = format!("{input}.rewrite.o");
            let mut job = cmd::rewrite_arch(
                env,
                input,
                &self.archive.dir.join(&out_name),
                self.deployment_target.as_deref(),
                &self.archive.dir,
            )?;
            job.run(env)?;
            rewritten.push(out_name);
        }
        Ok(rewritten)
    }

    fn run(&mut self, env: &ToolEnv) -> std::result::Result<BundleOutput, RunFailure> {
        let linker_options = self.link_options(env).map_err(RunFailure::Other)?;
        let entries = self.archive.entries().map_err(RunFailure::Other)?;

        let mut compile_jobs: Vec<CompileJob> = Vec::new();
        let mut nested: Vec<String> = Vec::new();
        let mut lto_inputs: Vec<String> = Vec::new();
        for entry in &entries {
            match entry {
                FileEntry::Bitcode { name, frontend, argv } => {
                    let job = self
                        .construct_bitcode_job(name, *frontend, argv, env)
                        .map_err(RunFailure::Other)?;
                    compile_jobs.push(job);
                }
                FileEntry::Object { name } => {
                    if env.platform_is("watchos") {
                        let err =
                            RebuildError::msg("Watch platform doesn't support object inputs");
                        error!("{err}");
                        return Err(RunFailure::Other(err));
                    }
                    let output_name = format!("{name}.o");
                    let cmd = cmd::copy_file(env, name, &output_name, &self.archive.dir)
                        .map_err(RunFailure::Other)?;
                    compile_jobs.push(CompileJob { cmd, output: output_name });
                }
                FileEntry::Bundle { name } => nested.push(name.clone()),
                FileEntry::Lto { name } => lto_inputs.push(name.clone()),
            }
        }

        // compile bitcode and object inputs on the worker pool
        let input_path = self.input.clone();
        let results: Vec<Result<()>> = env.pool().install(|| {
            compile_jobs
                .par_iter_mut()
                .map(|job| {
                    job.cmd.run(env).map_err(|e| {
                        error!("Failed to compile bundle: {}", input_path.display());
                        e
                    })
                })
                .collect()
        });
        for result in results {
            result.map_err(RunFailure::Other)?;
        }

        // nested bundles reuse the pool, so they run sequentially here
        let mut nested_outputs: Vec<String> = Vec::new();
        for name in &nested {
            let child_input = self.archive.dir.join(name);
            let child_output = self.archive.dir.join(format!("{name}.o"));
            build(&self.arch, &child_input, &child_output, env).map_err(RunFailure::Other)?;
            nested_outputs.push(format!("{name}.o"));
        }

        self.link(linker_options, &compile_jobs, lto_inputs, nested_outputs, env)
    }

    /// Assembles the final link command and runs the linker.
    fn link(
        &mut self,
        linker_options: Vec<String>,
        compile_jobs: &[CompileJob],
        lto_inputs: Vec<String>,
        nested_outputs: Vec<String>,
        env: &ToolEnv,
    ) -> std::result::Result<BundleOutput, RunFailure> {
        let gate = |version: &str| -> std::result::Result<bool, RunFailure> {
            env.satisfies_linker_version(version).map_err(RunFailure::Other)
        };
        let dir = self.archive.dir.clone();

        let mut args: Vec<String> = vec!["-arch".to_string(), self.arch.clone()];
        args.extend(linker_options);

        // deterministic link order within the compiled inputs
        let mut inputs: Vec<String> = compile_jobs
            .iter()
            .map(|j| {
                Path::new(&j.output)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| j.output.clone())
            })
            .collect();
        inputs.sort();

        let mut lto_inputs = lto_inputs;
        if !lto_inputs.is_empty() {
            args.push("-flto-codegen-only".to_string());
            args.extend([
                "-object_path_lto".to_string(),
                format!("{}.lto.o", self.output.display()),
            ]);
            for pair in ClangCC1Translator::compatibility_flags(&self.arch) {
                args.extend(pair);
            }
            // watchOS doesn't support inline asm
            if env.platform_is("watchos") {
                args.extend(["-mllvm".to_string(), "-lto-module-no-asm".to_string()]);
            }
            if self.is_translate_watchos(env) {
                lto_inputs = self.rewrite_lto_inputs(&lto_inputs, env).map_err(RunFailure::Other)?;
                args.extend([
                    "-mllvm".to_string(),
                    "-aarch64-watch-bitcode-compatibility".to_string(),
                ]);
            }
            inputs.extend(lto_inputs);
        }

        // nested-bundle outputs arrive after the LTO inputs
        inputs.extend(nested_outputs);

        let output_name = self
            .output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "a.out".to_string());
        let file_list = dir.join(format!("{output_name}.LinkFileList"));
        let write_list = || -> std::io::Result<()> {
            let mut f = fs::File::create(&file_list)?;
            for input in &inputs {
                writeln!(f, "{}", dir.join(input).display())?;
            }
            Ok(())
        };
        write_list().map_err(|e| RunFailure::Other(e.into()))?;
        args.extend(["-filelist".to_string(), file_list.display().to_string()]);

        // version specific arguments
        if gate("253.2")? {
            args.push("-ignore_auto_link".to_string());
        }
        if gate("253.3.1")? {
            args.push("-allow_dead_duplicates".to_string());
        }
        if let Some(liblto) = &env.config().liblto {
            args.extend(["-lto_library".to_string(), liblto.display().to_string()]);
        }

        for dylib in &self.meta.dylibs {
            if dylib.weak {
                // missing weak libraries provide no symbols; the link still works
                if let Some(path) = env
                    .resolve_dylibs(&self.arch, &dylib.name, true)
                    .map_err(RunFailure::Other)?
                {
                    args.extend(["-weak_library".to_string(), path.display().to_string()]);
                }
            } else if let Some(path) = env
                .resolve_dylibs(&self.arch, &dylib.name, false)
                .map_err(RunFailure::Other)?
            {
                args.push(path.display().to_string());
            }
        }

        // swift autolinking needs the runtime search path on older linkers
        if self.contains_swift && !gate("253.2")? {
            if let Some(path) = env.swift_lib_path(&self.arch) {
                args.extend(["-L".to_string(), path.display().to_string()]);
            }
        }

        if self.meta.rt_forceload {
            args.push("-force_load".to_string());
        }
        args.push(
            env.libclang_rt(&self.arch)
                .map_err(RunFailure::Other)?
                .display()
                .to_string(),
        );

        let mut linker = cmd::ld(env, &args, &self.output, &dir).map_err(RunFailure::Other)?;
        if let Err(err) = linker.run(env) {
            if let Some(translated) = env.try_deobfuscate(linker.output()) {
                info!(
                    "Translation of the obfuscated symbols using the bitcode symbol map:\n\n{translated}"
                );
            }
            error!("Failed to compile bundle: {}", self.input.display());
            return Err(RunFailure::Link(err));
        }

        Ok(BundleOutput {
            arch: self.arch.clone(),
            output: self.output.clone(),
            is_executable: self.is_executable,
            hide_symbols: self.meta.hide_symbols,
            link_argv: linker.argv.clone(),
        })
    }
}

/// `-sectalign` takes segment, section and a hex alignment; bundles recorded
/// with a missing third argument get the page default inserted so the
/// whitelist and the linker both see a complete triple.
fn fix_sectalign(opts: &mut Vec<String>) {
    let mut i = 0;
    while i < opts.len() {
        if opts[i] == "-sectalign" {
            let third = i + 3;
            if third >= opts.len() || opts[third].starts_with('-') {
                opts.insert(third.min(opts.len()), "0x4000".to_string());
            }
            i += 4;
        } else {
            i += 1;
        }
    }
}
