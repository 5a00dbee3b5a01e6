//! Translates reconstructed argument vectors between toolchain generations,
//! between the Swift and C frontends, and between architecture triples.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Argument rewrites for the C frontend (`-cc1`).
pub struct ClangCC1Translator;

/// Retired argument spellings and their current equivalents.
static CLANG_ARG_MAP: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| HashMap::from([("apcs-vfp", "aapcs16")]));

static CLANG_TO_OPTIMIZED: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("-disable-llvm-optzns", "-O1"),
        ("-disable-llvm-passes", "-O1"),
        ("-O0", "-O1"),
    ])
});

impl ClangCC1Translator {
    /// Substitutes retired spellings and appends the architecture
    /// compatibility flags. Idempotent: the substitution map is stable and
    /// [`compatibility_flags`](Self::compatibility_flags) is only appended
    /// when its pair is not already present.
    pub fn upgrade(opts: &[String], arch: &str) -> Vec<String> {
        let mut new_opts: Vec<String> = opts
            .iter()
            .map(|x| CLANG_ARG_MAP.get(x.as_str()).map(|s| s.to_string()).unwrap_or_else(|| x.clone()))
            .collect();
        for flag in Self::compatibility_flags(arch) {
            if !new_opts.iter().any(|o| o == &flag[1]) {
                new_opts.extend(flag);
            }
        }
        new_opts
    }

    /// armv7-family targets need bitcode-compatibility codegen.
    pub fn compatibility_flags(arch: &str) -> Vec<[String; 2]> {
        if arch.starts_with("armv7") {
            vec![
                ["-mllvm".into(), "-arm-bitcode-compatibility".into()],
                ["-mllvm".into(), "-fast-isel=0".into()],
            ]
        } else {
            vec![]
        }
    }

    /// Rewrites disabled-optimization flags to an enabled level for the
    /// Swift-failure retry path.
    pub fn add_optimization(opts: &[String]) -> Vec<String> {
        opts.iter()
            .map(|x| {
                CLANG_TO_OPTIMIZED.get(x.as_str()).map(|s| s.to_string()).unwrap_or_else(|| x.clone())
            })
            .collect()
    }

    /// Retargets an armv7k watch argv to arm64_32: the ABI tag and every
    /// triple-bearing argument are rewritten, and the aarch64 watch
    /// compatibility pair is appended. Arguments matching none of the
    /// patterns pass through untouched.
    pub fn translate_triple(opts: &[String]) -> Vec<String> {
        let mut new_opts = retarget_triples(opts);
        new_opts.extend(["-mllvm".to_string(), "-aarch64-watch-bitcode-compatibility".to_string()]);
        new_opts
    }
}

/// Argument rewrites for the Swift frontend.
pub struct SwiftArgTranslator;

static SWIFT_TO_CLANG: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("-frontend", "-cc1"),
        ("-emit-object", "-emit-obj"),
        ("-target", "-triple"),
        ("-Xllvm", "-mllvm"),
        ("-Onone", "-O0"),
        ("-Oplayground", "-O1"),
        ("-Osize", "-Oz"),
        ("-Ounchecked", "-Os"),
        ("-O", "-Os"),
        // meaningless on the C side but must map to some accepted option
        ("-module-name", "-main-file-name"),
        ("-parse-stdlib", "-stdlib=libc++"),
    ])
});

static SWIFT_TO_OPTIMIZED: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("-disable-llvm-optzns", "-O"),
        ("-disable-llvm-passes", "-O"),
        ("-Onone", "-O"),
    ])
});

impl SwiftArgTranslator {
    /// Appends the architecture compatibility flags, skipping pairs already
    /// present so a second upgrade is a no-op.
    pub fn upgrade(opts: &[String], arch: &str) -> Vec<String> {
        let mut new_opts = opts.to_vec();
        for flag in Self::compatibility_flags(arch) {
            if !new_opts.iter().any(|o| o == &flag[1]) {
                new_opts.extend(flag);
            }
        }
        new_opts
    }

    pub fn compatibility_flags(arch: &str) -> Vec<[String; 2]> {
        if arch.starts_with("armv7") {
            vec![
                ["-Xllvm".into(), "-arm-bitcode-compatibility".into()],
                ["-Xllvm".into(), "-fast-isel=0".into()],
            ]
        } else {
            vec![]
        }
    }

    /// Renames Swift frontend options to their C frontend equivalents.
    /// Unknown arguments pass through, so any argv passing Swift
    /// verification translates to one the C verifier accepts.
    pub fn translate_to_clang(opts: &[String]) -> Vec<String> {
        opts.iter()
            .map(|x| {
                SWIFT_TO_CLANG.get(x.as_str()).map(|s| s.to_string()).unwrap_or_else(|| x.clone())
            })
            .collect()
    }

    pub fn add_optimization(opts: &[String]) -> Vec<String> {
        opts.iter()
            .map(|x| {
                SWIFT_TO_OPTIMIZED.get(x.as_str()).map(|s| s.to_string()).unwrap_or_else(|| x.clone())
            })
            .collect()
    }

    pub fn translate_triple(opts: &[String]) -> Vec<String> {
        let mut new_opts = retarget_triples(opts);
        new_opts.extend(["-Xllvm".to_string(), "-aarch64-watch-bitcode-compatibility".to_string()]);
        new_opts
    }
}

fn retarget_triples(opts: &[String]) -> Vec<String> {
    opts.iter()
        .map(|opt| {
            if opt == "aapcs16" {
                "darwinpcs".to_string()
            } else if opt.starts_with("thumbv7k") {
                opt.replacen("thumbv7k", "arm64_32", 1)
            } else if opt.starts_with("armv7k") {
                opt.replacen("armv7k", "arm64_32", 1)
            } else {
                opt.clone()
            }
        })
        .collect()
}

/// Handles system framework/dylib upgrades for `{SDKPATH}` references.
pub struct FrameworkUpgrader;

static LIBRARY_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([(
        "/usr/lib/libextension",
        "/System/Library/Frameworks/Foundation.framework/Foundation",
    )])
});

impl FrameworkUpgrader {
    /// Reroutes a deprecated SDK-relative library to its current umbrella
    /// framework. The extension is ignored for the lookup.
    pub fn translate(lib: &str) -> String {
        let stem = match lib.rfind('.') {
            Some(dot) if !lib[dot..].contains('/') => &lib[..dot],
            _ => lib,
        };
        LIBRARY_MAP.get(stem).map(|s| s.to_string()).unwrap_or_else(|| lib.to_string())
    }
}
