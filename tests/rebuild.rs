//! End-to-end rebuild scenarios driven through stub toolchain binaries.
//!
//! Each fixture provides a tool directory of small shell scripts standing in
//! for the external toolchain (the archive tool reads `<archive>.toc` and
//! `<archive>.contents/` sidecars) plus an SDK directory, so the engine runs
//! its real control flow while every subprocess is observable.

use bitcode_rebuild::{bundle, rebuild, BuildConfig, RebuildError, ToolEnv};
use pretty_assertions::assert_eq;
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

struct Fixture {
    _root: tempfile::TempDir,
    tools: PathBuf,
    sdk: PathBuf,
    log: PathBuf,
    work: PathBuf,
}

impl Fixture {
    fn new(sdk_name: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let tools = root.path().join("tools");
        let sdk = root.path().join(sdk_name);
        let log = root.path().join("log");
        let work = root.path().join("work");
        for dir in [&tools, &sdk, &log, &work] {
            fs::create_dir_all(dir).unwrap();
        }

        let fixture = Fixture { _root: root, tools, sdk, log, work };
        fixture.write_tool(
            "xar",
            r#"if [ "$1" = "-d" ]; then
  cat "$4.toc"
else
  cp -R "$5.contents/." "$3/"
fi
"#,
        );
        fixture.write_tool(
            "clang",
            &format!(
                r#"echo "$@" >> {log}/clang.calls
echo '"/fake/lib/clang/libclang_rt.a"'
exit 0
"#,
                log = fixture.log.display()
            ),
        );
        fixture.write_tool(
            "swiftc",
            &format!(
                r#"echo "$@" >> {log}/swiftc.calls
exit 0
"#,
                log = fixture.log.display()
            ),
        );
        fixture.write_tool(
            "ld",
            &format!(
                r#"if [ "$1" = "-v" ]; then
  echo "@(#)PROGRAM:ld  PROJECT:ld64-253.3.1"
  exit 0
fi
echo "$@" >> {log}/ld.calls
out=""
prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
[ -n "$out" ] && : > "$out"
if [ -f {log}/ld.fail ]; then
  cat {log}/ld.output 2>/dev/null
  exit 1
fi
exit 0
"#,
                log = fixture.log.display()
            ),
        );
        fixture.write_tool(
            "lipo",
            r#"if [ "$1" = "-info" ]; then
  echo "Non-fat file: $2 is architecture: armv7k"
  exit 0
fi
exit 0
"#,
        );
        fixture.write_tool(
            "dwarfdump",
            r#"echo "UUID: 195B1DDC-6A08-3C1B-91B4-3A1A0DEF3CDE (armv7k) $2"
exit 0
"#,
        );
        fixture.write_tool(
            "segedit",
            r#"cp "$1.bundle" "$5"
cp "$1.bundle.toc" "$5.toc"
cp -R "$1.bundle.contents" "$5.contents"
exit 0
"#,
        );
        fixture
    }

    fn write_tool(&self, name: &str, body: &str) {
        let path = self.tools.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn config(&self) -> BuildConfig {
        BuildConfig {
            tool_paths: vec![self.tools.clone()],
            sdk_path: Some(self.sdk.clone()),
            jobs: 2,
            ..Default::default()
        }
    }

    fn env(&self, config: BuildConfig) -> ToolEnv {
        ToolEnv::new(config).unwrap()
    }

    /// Writes a stub archive: the archive file itself plus the `.toc` and
    /// `.contents/` sidecars the stub `xar` serves.
    fn make_archive(&self, path: &Path, toc: &str, files: &[(&str, &str)]) {
        fs::write(path, "xar!").unwrap();
        fs::write(format!("{}.toc", path.display()), toc).unwrap();
        let contents = PathBuf::from(format!("{}.contents", path.display()));
        fs::create_dir_all(&contents).unwrap();
        for (name, data) in files {
            fs::write(contents.join(name), data).unwrap();
        }
    }

    fn calls(&self, tool: &str) -> Vec<String> {
        fs::read_to_string(self.log.join(format!("{tool}.calls")))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

fn toc(subdoc: &str, files: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<xar><subdoc>{subdoc}</subdoc><toc>{files}</toc></xar>"
    )
}

fn contains_pair(argv: &[String], a: &str, b: &str) -> bool {
    argv.windows(2).any(|w| w[0] == a && w[1] == b)
}

#[test]
fn translated_watch_bundle_retargets_arch_and_deployment() {
    let fixture = Fixture::new("WatchOS5.3.sdk");
    let env = fixture.env(BuildConfig { translate_watchos: true, ..fixture.config() });

    let toc = toc(
        "<version>1.0</version><platform>watchOS</platform><sdkversion>5.3</sdkversion>\
         <link-options>\
          <option>-watchos_version_min</option><option>0.0.0</option>\
          <option>-e</option><option>_main</option>\
          <option>-execute</option>\
         </link-options>",
        "<file><name>a</name><file-type>Bitcode</file-type>\
          <clang><cmd>-emit-obj</cmd><cmd>-triple</cmd><cmd>thumbv7k-apple-watchos2.0.0</cmd>\
           <cmd>-O</cmd><cmd>0</cmd></clang></file>",
    );
    let archive = fixture.work.join("app.xar");
    fixture.make_archive(&archive, &toc, &[("a", "bitcode")]);

    let output = fixture.work.join("app.out");
    let built = bundle::build("armv7k", &archive, &output, &env).unwrap();

    assert_eq!(built.arch, "arm64_32");
    assert!(built.is_executable);
    let arch_pairs: Vec<_> = built
        .link_argv
        .windows(2)
        .filter(|w| w[0] == "-arch")
        .map(|w| w[1].clone())
        .collect();
    assert_eq!(arch_pairs, vec!["arm64_32"]);
    assert!(contains_pair(&built.link_argv, "-watchos_version_min", "5.0.0"));
    assert!(built.link_argv.iter().any(|a| a == "-execute"));
    assert!(contains_pair(&built.link_argv, "-syslibroot", &fixture.sdk.display().to_string()));
    assert!(contains_pair(&built.link_argv, "-sdk_version", "5.3"));
    assert!(built.link_argv.iter().any(|a| a == "-ignore_auto_link"));
    assert!(built.link_argv.iter().any(|a| a == "-allow_dead_duplicates"));

    let clang_calls = fixture.calls("clang");
    let compile = clang_calls.iter().find(|c| c.contains("-cc1")).unwrap();
    assert!(compile.contains("-triple arm64_32-apple-watchos2.0.0"));
    assert!(compile.contains("-mllvm -aarch64-watch-bitcode-compatibility"));
    assert!(!compile.contains("-arm-bitcode-compatibility"));
    assert!(compile.contains("-fno-gnu-inline-asm"));
    assert!(compile.contains("-x ir a -o a.o"));
}

#[test]
fn zero_deployment_target_defaults_without_translation() {
    let fixture = Fixture::new("WatchOS5.3.sdk");
    let env = fixture.env(fixture.config());

    let toc = toc(
        "<version>1.0</version><platform>watchOS</platform><sdkversion>5.3</sdkversion>\
         <link-options><option>-execute</option>\
          <option>-watchos_version_min</option><option>0.0.0</option></link-options>",
        "<file><name>a</name><file-type>Bitcode</file-type>\
          <clang><cmd>-emit-obj</cmd></clang></file>",
    );
    let archive = fixture.work.join("zero.xar");
    fixture.make_archive(&archive, &toc, &[("a", "bitcode")]);

    let built = bundle::build("armv7k", &archive, &fixture.work.join("zero.out"), &env).unwrap();
    assert_eq!(built.arch, "armv7k");
    assert!(contains_pair(&built.link_argv, "-watchos_version_min", "2.0.0"));
}

#[test]
fn missing_deployment_target_is_inserted_under_translation() {
    let fixture = Fixture::new("WatchOS5.3.sdk");
    let env = fixture.env(BuildConfig { translate_watchos: true, ..fixture.config() });

    let toc = toc(
        "<version>1.0</version><platform>watchOS</platform><sdkversion>5.3</sdkversion>\
         <link-options><option>-execute</option></link-options>",
        "<file><name>a</name><file-type>Bitcode</file-type>\
          <clang><cmd>-emit-obj</cmd></clang></file>",
    );
    let archive = fixture.work.join("nomin.xar");
    fixture.make_archive(&archive, &toc, &[("a", "bitcode")]);

    let built = bundle::build("armv7k", &archive, &fixture.work.join("nomin.out"), &env).unwrap();
    assert!(contains_pair(&built.link_argv, "-watchos_version_min", "5.0.0"));
}

#[test]
fn lto_inputs_are_rewritten_and_appended_after_compiles() {
    let fixture = Fixture::new("WatchOS5.3.sdk");
    let env = fixture.env(BuildConfig { translate_watchos: true, ..fixture.config() });

    let toc = toc(
        "<version>1.0</version><platform>watchOS</platform><sdkversion>5.3</sdkversion>\
         <link-options><option>-execute</option>\
          <option>-watchos_version_min</option><option>0.0.0</option></link-options>",
        "<file><name>b</name><file-type>Bitcode</file-type>\
          <clang><cmd>-emit-obj</cmd></clang></file>\
         <file><name>lto1</name><file-type>LTO</file-type></file>",
    );
    let archive = fixture.work.join("lto.xar");
    fixture.make_archive(&archive, &toc, &[("b", "bitcode"), ("lto1", "bitcode")]);

    let output = fixture.work.join("lto.out");
    let built = bundle::build("armv7k", &archive, &output, &env).unwrap();

    assert!(built.link_argv.iter().any(|a| a == "-flto-codegen-only"));
    assert!(contains_pair(
        &built.link_argv,
        "-object_path_lto",
        &format!("{}.lto.o", output.display())
    ));
    assert!(contains_pair(&built.link_argv, "-mllvm", "-lto-module-no-asm"));
    assert!(contains_pair(&built.link_argv, "-mllvm", "-aarch64-watch-bitcode-compatibility"));

    // the rewritten LTO object follows the sorted compile outputs
    let filelist_pos = built.link_argv.iter().position(|a| a == "-filelist").unwrap();
    let filelist = fs::read_to_string(&built.link_argv[filelist_pos + 1]).unwrap();
    let names: Vec<&str> = filelist
        .lines()
        .map(|l| Path::new(l).file_name().unwrap().to_str().unwrap())
        .collect();
    assert_eq!(names, vec!["b.o", "lto1.rewrite.o"]);

    // the rewrite job targeted the pinned deployment version
    let clang_calls = fixture.calls("clang");
    let rewrite = clang_calls.iter().find(|c| c.contains("-emit-llvm")).unwrap();
    assert!(rewrite.contains("-target arm64_32-apple-watchos5.0.0"));
}

#[test]
fn nested_bundles_link_after_sorted_compile_outputs() {
    let fixture = Fixture::new("iPhoneOS15.0.sdk");
    let env = fixture.env(fixture.config());

    let inner_toc = toc(
        "<version>1.0</version><platform>iOS</platform><sdkversion>15.0</sdkversion>\
         <link-options><option>-dylib</option></link-options>",
        "<file><name>x</name><file-type>Bitcode</file-type>\
          <clang><cmd>-emit-obj</cmd></clang></file>",
    );
    let outer_toc = toc(
        "<version>1.0</version><platform>iOS</platform><sdkversion>15.0</sdkversion>\
         <link-options><option>-execute</option></link-options>",
        "<file><name>2</name><file-type>Bitcode</file-type>\
          <clang><cmd>-emit-obj</cmd></clang></file>\
         <file><name>inner.xar</name><file-type>Bundle</file-type></file>\
         <file><name>1</name><file-type>Bitcode</file-type>\
          <clang><cmd>-emit-obj</cmd></clang></file>",
    );

    let outer = fixture.work.join("outer.xar");
    fixture.make_archive(&outer, &outer_toc, &[("1", "bitcode"), ("2", "bitcode")]);
    let outer_contents = PathBuf::from(format!("{}.contents", outer.display()));
    fs::write(outer_contents.join("inner.xar"), "xar!").unwrap();
    fs::write(outer_contents.join("inner.xar.toc"), &inner_toc).unwrap();
    let nested_contents = outer_contents.join("inner.xar.contents");
    fs::create_dir_all(&nested_contents).unwrap();
    fs::write(nested_contents.join("x"), "bitcode").unwrap();

    let output = fixture.work.join("outer.out");
    let built = bundle::build("arm64", &outer, &output, &env).unwrap();

    // the inner bundle linked before the outer one
    let ld_calls = fixture.calls("ld");
    assert_eq!(ld_calls.len(), 2);
    assert!(ld_calls[0].contains("inner.xar.o"));

    // sorted compile outputs first, the nested bundle's object last
    let filelist_pos = built.link_argv.iter().position(|a| a == "-filelist").unwrap();
    let filelist = fs::read_to_string(&built.link_argv[filelist_pos + 1]).unwrap();
    let names: Vec<&str> = filelist
        .lines()
        .map(|l| Path::new(l).file_name().unwrap().to_str().unwrap())
        .collect();
    assert_eq!(names, vec!["1.o", "2.o", "inner.xar.o"]);
}

#[test]
fn failed_swift_link_retries_once_with_optimization() {
    let fixture = Fixture::new("iPhoneOS15.0.sdk");
    let env = fixture.env(fixture.config());
    fs::write(fixture.log.join("ld.fail"), "").unwrap();

    let toc = toc(
        "<version>1.0</version><platform>iOS</platform><sdkversion>15.0</sdkversion>\
         <link-options><option>-execute</option></link-options>",
        "<file><name>s1</name><file-type>Bitcode</file-type>\
          <swift><cmd>-emit-object</cmd><cmd>-target</cmd><cmd>arm64-apple-ios12.0</cmd>\
           <cmd>-Onone</cmd></swift></file>",
    );
    let archive = fixture.work.join("swifty.xar");
    fixture.make_archive(&archive, &toc, &[("s1", "bitcode")]);

    let output = fixture.work.join("swifty.out");
    let err = bundle::build("arm64", &archive, &output, &env).unwrap_err();
    assert!(matches!(err, RebuildError::RetryExhausted(_)));

    // exactly two link attempts, no third
    assert_eq!(fixture.calls("ld").len(), 2);

    // the retry rewrote the disabled optimization level
    let swift_calls = fixture.calls("swiftc");
    assert_eq!(swift_calls.len(), 2);
    assert!(swift_calls[0].contains("-Onone"));
    assert!(!swift_calls[1].contains("-Onone"));
    assert!(swift_calls[1].split_whitespace().any(|a| a == "-O"));
    // swift inputs are renamed to carry the bitcode extension
    assert!(swift_calls[1].contains("s1.bc"));
}

#[test]
fn sdkpath_dylib_upgrades_to_umbrella_framework() {
    let fixture = Fixture::new("iPhoneOS15.0.sdk");
    let framework = fixture.sdk.join("System/Library/Frameworks/Foundation.framework");
    fs::create_dir_all(&framework).unwrap();
    fs::write(framework.join("Foundation"), "").unwrap();
    let env = fixture.env(fixture.config());
    env.set_platform(Some("iOS")).unwrap();

    let resolved = env
        .resolve_dylibs("arm64", "{SDKPATH}/usr/lib/libextension.dylib", false)
        .unwrap()
        .unwrap();
    assert!(resolved.ends_with("System/Library/Frameworks/Foundation.framework/Foundation"));
}

#[test]
fn sdkpath_dylib_upgrade_falls_back_to_search_paths() {
    let fixture = Fixture::new("iPhoneOS15.0.sdk");
    // the umbrella framework is missing from the SDK itself and only
    // resolvable through an extra search path, under its upgraded name
    let extra = fixture.work.join("libs");
    let framework = extra.join("Foundation.framework");
    fs::create_dir_all(&framework).unwrap();
    fs::write(framework.join("Foundation"), "").unwrap();
    let env = fixture.env(BuildConfig {
        library_paths: vec![extra.clone()],
        ..fixture.config()
    });
    env.set_platform(Some("iOS")).unwrap();

    let resolved = env
        .resolve_dylibs("arm64", "{SDKPATH}/usr/lib/libextension.dylib", false)
        .unwrap()
        .unwrap();
    assert_eq!(resolved, framework.join("Foundation"));
}

#[test]
fn missing_weak_framework_is_dropped_from_the_link() {
    let fixture = Fixture::new("iPhoneOS15.0.sdk");
    let env = fixture.env(fixture.config());

    let toc = toc(
        "<version>1.0</version><platform>iOS</platform><sdkversion>15.0</sdkversion>\
         <link-options><option>-execute</option></link-options>\
         <dylibs><weak>/System/Library/Frameworks/Missing.framework/Missing</weak></dylibs>",
        "<file><name>a</name><file-type>Bitcode</file-type>\
          <clang><cmd>-emit-obj</cmd></clang></file>",
    );
    let archive = fixture.work.join("weak.xar");
    fixture.make_archive(&archive, &toc, &[("a", "bitcode")]);

    let output = fixture.work.join("weak.out");
    let built = bundle::build("arm64", &archive, &output, &env).unwrap();

    assert!(!built.link_argv.iter().any(|a| a.contains("Missing")));
    assert!(!built.link_argv.iter().any(|a| a == "-weak_library"));
}

#[test]
fn link_failure_is_deobfuscated_through_the_symbol_map() {
    let fixture = Fixture::new("iPhoneOS15.0.sdk");
    let map = fixture.work.join("app.bcsymbolmap");
    let mut lines = vec!["BCSymbolMap Version: 2.0".to_string()];
    lines.extend((1..13).map(|i| format!("_sym{i}")));
    lines.push("_MyFunc".to_string());
    fs::write(&map, lines.join("\n")).unwrap();

    fs::write(fixture.log.join("ld.fail"), "").unwrap();
    fs::write(fixture.log.join("ld.output"), "undefined symbol: __hidden#12_\n").unwrap();

    let env = fixture.env(BuildConfig { symbol_map: Some(map), ..fixture.config() });

    let toc = toc(
        "<version>1.0</version><platform>iOS</platform><sdkversion>15.0</sdkversion>\
         <link-options><option>-execute</option></link-options>",
        "<file><name>a</name><file-type>Bitcode</file-type>\
          <clang><cmd>-emit-obj</cmd></clang></file>",
    );
    let archive = fixture.work.join("hidden.xar");
    fixture.make_archive(&archive, &toc, &[("a", "bitcode")]);

    let output = fixture.work.join("hidden.out");
    let err = bundle::build("arm64", &archive, &output, &env).unwrap_err();

    // no swift involved, so the failure surfaces directly
    let RebuildError::ToolRunFailed { transcript, .. } = &err else {
        panic!("expected a link failure, got {err}");
    };
    assert!(transcript.contains("__hidden#12_"));
    // the engine translated the message through the symbol map
    assert_eq!(
        env.try_deobfuscate("undefined symbol: __hidden#12_").unwrap(),
        "undefined symbol: _MyFunc"
    );
}

#[test]
fn rebuild_drives_a_thin_macho_end_to_end() {
    let fixture = Fixture::new("WatchOS5.3.sdk");

    // a thin watch Mach-O whose embedded bundle the stub segedit serves
    let input = fixture.work.join("App");
    let mut macho = vec![0xfe, 0xed, 0xfa, 0xce];
    macho.extend_from_slice(&[0u8; 28]);
    fs::write(&input, &macho).unwrap();

    let toc = toc(
        "<version>1.0</version><platform>watchOS</platform><sdkversion>5.3</sdkversion>\
         <link-options><option>-execute</option>\
          <option>-watchos_version_min</option><option>2.0.0</option></link-options>",
        "<file><name>a</name><file-type>Bitcode</file-type>\
          <clang><cmd>-emit-obj</cmd><cmd>-triple</cmd><cmd>thumbv7k-apple-watchos2.0.0</cmd>\
          </clang></file>",
    );
    let bundle_stub = PathBuf::from(format!("{}.bundle", input.display()));
    fixture.make_archive(&bundle_stub, &toc, &[("a", "bitcode")]);

    let output = fixture.work.join("App.rebuilt");
    rebuild(BuildConfig {
        input: input.clone(),
        output: output.clone(),
        ..fixture.config()
    })
    .unwrap();

    assert!(output.is_file());
    // the un-translated watch build keeps armv7k
    let ld_call = fixture.calls("ld").pop().unwrap();
    assert!(ld_call.contains("-arch armv7k"));
    assert!(ld_call.contains("-watchos_version_min 2.0.0"));
}

#[test]
fn empty_bundle_section_is_a_bare_marker() {
    let fixture = Fixture::new("WatchOS5.3.sdk");
    // segedit stub that produces a one-byte section
    fixture.write_tool("segedit", "printf x > \"$5\"\nexit 0\n");

    let input = fixture.work.join("Marker");
    let mut macho = vec![0xfe, 0xed, 0xfa, 0xce];
    macho.extend_from_slice(&[0u8; 28]);
    fs::write(&input, &macho).unwrap();

    let err = rebuild(BuildConfig {
        input: input.clone(),
        output: fixture.work.join("Marker.rebuilt"),
        ..fixture.config()
    })
    .unwrap_err();
    assert!(matches!(err, RebuildError::BundleOnlyContainsMarker { .. }));
}

#[test]
fn verify_mode_runs_probes_but_never_compiles_or_links() {
    let fixture = Fixture::new("iPhoneOS15.0.sdk");
    let env = fixture.env(BuildConfig { verify_only: true, ..fixture.config() });

    let toc = toc(
        "<version>1.0</version><platform>iOS</platform><sdkversion>15.0</sdkversion>\
         <link-options><option>-execute</option></link-options>\
         <dylibs><lib>{SDKPATH}/usr/lib/libSystem.B.dylib</lib></dylibs>",
        "<file><name>a</name><file-type>Bitcode</file-type>\
          <clang><cmd>-emit-obj</cmd></clang></file>",
    );
    let archive = fixture.work.join("verify.xar");
    fixture.make_archive(&archive, &toc, &[("a", "bitcode")]);

    let built = bundle::build("arm64", &archive, &fixture.work.join("verify.out"), &env).unwrap();

    // the dylib reference passes through unresolved in verify mode
    assert!(built.link_argv.iter().any(|a| a.contains("libSystem.B.dylib")));
    // nothing was linked and nothing was compiled; only the runtime probe ran
    assert!(fixture.calls("ld").is_empty());
    let clang_calls = fixture.calls("clang");
    assert!(clang_calls.iter().all(|c| c.contains("-###")));
}

#[test]
fn rejected_linker_option_aborts_the_bundle() {
    let fixture = Fixture::new("iPhoneOS15.0.sdk");
    let env = fixture.env(fixture.config());

    let toc = toc(
        "<version>1.0</version><platform>iOS</platform><sdkversion>15.0</sdkversion>\
         <link-options><option>-execute</option><option>-bitcode_verify</option></link-options>",
        "<file><name>a</name><file-type>Bitcode</file-type>\
          <clang><cmd>-emit-obj</cmd></clang></file>",
    );
    let archive = fixture.work.join("bad.xar");
    fixture.make_archive(&archive, &toc, &[("a", "bitcode")]);

    let err = bundle::build("arm64", &archive, &fixture.work.join("bad.out"), &env).unwrap_err();
    let RebuildError::OptionRejected { tool, msg, .. } = &err else {
        panic!("expected an option rejection, got {err}");
    };
    assert_eq!(*tool, "ld");
    assert!(msg.contains("-bitcode_verify"));
    // nothing was linked
    assert!(fixture.calls("ld").is_empty());
}
