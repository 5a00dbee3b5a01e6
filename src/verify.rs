//! Whitelist verification of the reconstructed argument vectors.
//!
//! Every argv recovered from a bundle is checked against a fixed per-tool
//! whitelist before anything is executed. The checker deliberately has no
//! "looks like a flag" heuristic: an option whose arity declares arguments
//! consumes the following tokens verbatim, so pass-throughs like
//! `-mllvm -fast-isel=0` survive.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// How many tokens an option consumes after its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Bare flag.
    Flag,
    /// One argument.
    One,
    /// Three arguments.
    Three,
    /// One argument, may repeat.
    Append,
}

impl Arity {
    fn count(self) -> usize {
        match self {
            Arity::Flag => 0,
            Arity::One | Arity::Append => 1,
            Arity::Three => 3,
        }
    }
}

/// A whitelist-based argv checker for one external tool.
pub struct OptionVerifier {
    tool: &'static str,
    options: HashMap<&'static str, Arity>,
    /// Options that must appear for the argv to be acceptable.
    required: &'static [&'static str],
    /// Options whose argument is restricted to a closed set of values.
    choices: HashMap<&'static str, &'static [&'static str]>,
    /// Options that may carry their value attached (`-O2`, `-Os`).
    joined: &'static [&'static str],
    /// The linker's `-e <name>` pair is stripped before checking; entry
    /// symbols are arbitrary and would otherwise swallow the whitelist.
    strip_entry: bool,
}

impl OptionVerifier {
    /// Checks a full argument vector. `Ok` means every token is a
    /// whitelisted option with its declared arguments; `Err` carries the
    /// message naming the offending argument. Nothing is mutated.
    pub fn verify(&self, options: &[String]) -> Result<(), String> {
        let mut options: Vec<&String> = options.iter().collect();
        if self.strip_entry {
            if let Some(entry) = options.iter().position(|o| *o == "-e") {
                let end = (entry + 2).min(options.len());
                options.drain(entry..end);
            }
        }

        let mut seen: Vec<&str> = Vec::new();
        let mut iter = options.into_iter();
        while let Some(opt) = iter.next() {
            let Some(arity) = self.options.get(opt.as_str()) else {
                if let Some(stem) = self
                    .joined
                    .iter()
                    .copied()
                    .find(|j| opt.starts_with(j) && opt.len() > j.len())
                {
                    seen.push(stem);
                    continue;
                }
                return Err(format!("unrecognized argument: {opt}"));
            };
            seen.push(opt.as_str());
            for _ in 0..arity.count() {
                let Some(value) = iter.next() else {
                    return Err(format!("argument {opt}: expected {} value(s)", arity.count()));
                };
                if let Some(allowed) = self.choices.get(opt.as_str()) {
                    if !allowed.contains(&value.as_str()) {
                        return Err(format!("argument {opt}: invalid choice: '{value}'"));
                    }
                }
            }
        }

        for req in self.required {
            if !seen.iter().any(|s| s == req) {
                return Err(format!("the following argument is required: {req}"));
            }
        }
        Ok(())
    }

    pub fn tool(&self) -> &'static str {
        self.tool
    }
}

/// C frontend (`-cc1`) whitelist.
pub static CLANG_VERIFIER: Lazy<OptionVerifier> = Lazy::new(|| OptionVerifier {
    tool: "clang",
    options: HashMap::from([
        // Output options
        ("-emit-obj", Arity::Flag),
        ("-triple", Arity::One),
        // Optimizations
        ("-O", Arity::One),
        ("-disable-llvm-optzns", Arity::Flag),
        ("-disable-llvm-passes", Arity::Flag),
        // Codegen/Asm options
        ("-mdisable-tail-calls", Arity::Flag),
        // FP options
        ("-mlimit-float-precision", Arity::Flag),
        ("-menable-no-infs", Arity::Flag),
        ("-menable-no-nans", Arity::Flag),
        ("-fmath-errno", Arity::Flag),
        ("-menable-unsafe-fp-math", Arity::Flag),
        ("-fno-signed-zeros", Arity::Flag),
        ("-freciprocal-math", Arity::Flag),
        ("-ffp-contract", Arity::One),
        ("-target-abi", Arity::One),
        ("-mfloat-abi", Arity::One),
        ("-mllvm", Arity::Append),
    ]),
    required: &["-emit-obj"],
    choices: HashMap::new(),
    joined: &["-O"],
    strip_entry: false,
});

/// Swift frontend whitelist.
pub static SWIFT_VERIFIER: Lazy<OptionVerifier> = Lazy::new(|| OptionVerifier {
    tool: "swift",
    options: HashMap::from([
        ("-emit-object", Arity::Flag),
        ("-target", Arity::One),
        ("-target-cpu", Arity::One),
        ("-Ounchecked", Arity::Flag),
        ("-Onone", Arity::Flag),
        ("-Osize", Arity::Flag),
        ("-Oplayground", Arity::Flag),
        ("-O", Arity::Flag),
        ("-c", Arity::Flag),
        ("-parse-stdlib", Arity::Flag),
        ("-module-name", Arity::One),
        ("-disable-llvm-optzns", Arity::Flag),
        ("-Xllvm", Arity::Append),
    ]),
    required: &[],
    // only the pass-through added by the swift driver is acceptable
    choices: HashMap::from([("-Xllvm", &["-aarch64-use-tbi"] as &[&str])]),
    joined: &[],
    strip_entry: false,
});

/// Linker whitelist.
pub static LD_VERIFIER: Lazy<OptionVerifier> = Lazy::new(|| OptionVerifier {
    tool: "ld",
    options: HashMap::from([
        // Output kind
        ("-execute", Arity::Flag),
        ("-dylib", Arity::Flag),
        ("-r", Arity::Flag),
        // Dylib options
        ("-compatibility_version", Arity::One),
        ("-current_version", Arity::One),
        ("-install_name", Arity::One),
        // Platform versions
        ("-ios_version_min", Arity::One),
        ("-ios_simulator_version_min", Arity::One),
        ("-watchos_version_min", Arity::One),
        ("-watchos_simulator_version_min", Arity::One),
        ("-macosx_version_min", Arity::One),
        ("-tvos_version_min", Arity::One),
        ("-tvos_simulator_version_min", Arity::One),
        // Other settings
        ("-rpath", Arity::Append),
        ("-objc_abi_version", Arity::One),
        ("-executable_path", Arity::One),
        ("-exported_symbols_list", Arity::One),
        ("-unexported_symbols_list", Arity::One),
        ("-order_file", Arity::One),
        ("-source_version", Arity::One),
        ("-no_implicit_dylibs", Arity::Flag),
        ("-dead_strip", Arity::Flag),
        ("-export_dynamic", Arity::Flag),
        ("-application_extension", Arity::Flag),
        ("-add_source_version", Arity::Flag),
        ("-no_objc_category_merging", Arity::Flag),
        ("-sectcreate", Arity::Three),
        ("-sectalign", Arity::Three),
    ]),
    required: &[],
    choices: HashMap::new(),
    joined: &[],
    strip_entry: true,
});
