//! Uniform subprocess execution for the external toolchain.
//!
//! Every external tool is driven through [`Cmd`]: argv, working directory,
//! merged stdout+stderr, exit code and wall time. The `TESTING` environment
//! flag short-circuits execution with a synthetic success, and verify mode
//! turns compile/link invocations into no-ops while information-only
//! commands still run.

use crate::{
    env::ToolEnv,
    error::{RebuildError, Result},
    utils,
};
use std::{
    io::IsTerminal,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Instant,
};
use yansi::Paint;

/// Whether an invocation may be skipped in verify mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    /// Architecture probes, version probes, extraction; always runs.
    Info,
    /// Compile and link invocations; skipped in verify mode.
    Compile,
}

/// One pending or finished subprocess invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    /// Display name used in transcripts and failure reports.
    pub name: &'static str,
    pub argv: Vec<String>,
    pub working_dir: PathBuf,
    pub kind: CmdKind,
    /// Merged stdout+stderr; set once the command ran.
    pub stdout: Option<String>,
    pub returncode: i32,
}

impl Cmd {
    pub fn new(
        name: &'static str,
        argv: Vec<String>,
        working_dir: impl Into<PathBuf>,
        kind: CmdKind,
    ) -> Self {
        Cmd { name, argv, working_dir: working_dir.into(), kind, stdout: None, returncode: 0 }
    }

    /// Runs the command; a non-zero exit is an error.
    pub fn run(&mut self, env: &ToolEnv) -> Result<()> {
        self.run_cmd(env, false)
    }

    /// Runs the command, tolerating a non-zero exit; the caller inspects
    /// [`Cmd::returncode`].
    pub fn run_xfail(&mut self, env: &ToolEnv) -> Result<()> {
        self.run_cmd(env, true)
    }

    fn run_cmd(&mut self, env: &ToolEnv, xfail: bool) -> Result<()> {
        if self.kind == CmdKind::Compile && env.verify_mode() {
            return Ok(());
        }
        if testing_mode() {
            self.stdout = Some("Skipped for testing mode.".to_string());
            self.returncode = 0;
            debug!("{}", self.transcript());
            return Ok(());
        }

        let start = Instant::now();
        let output = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
        merged.push_str(&String::from_utf8_lossy(&output.stderr));
        self.stdout = Some(merged);
        self.returncode = output.status.code().unwrap_or(-1);

        if self.returncode != 0 && !xfail {
            error!("{}", self.transcript());
            return Err(self.failure());
        }
        debug!("{}", self.transcript());
        debug!("Command took {} seconds", start.elapsed().as_secs());
        Ok(())
    }

    /// The error a finished command failed with.
    pub fn failure(&self) -> RebuildError {
        RebuildError::ToolRunFailed {
            name: self.name,
            code: self.returncode,
            transcript: self.transcript(),
        }
    }

    /// Whether the `TESTING` seam replaced this run with a synthetic success.
    pub fn skipped_for_testing(&self) -> bool {
        self.stdout.as_deref() == Some("Skipped for testing mode.")
    }

    /// Merged output of a finished command, empty if it never ran.
    pub fn output(&self) -> &str {
        self.stdout.as_deref().unwrap_or("")
    }

    /// Renders the invocation like a shell session: tool name, working
    /// directory, quoted argv, and the captured output once present.
    pub fn transcript(&self) -> String {
        let name = if std::io::stdout().is_terminal() {
            Paint::new(self.name).bold().to_string()
        } else {
            self.name.to_string()
        };
        let info = format!("{name}: cd {}\n", self.working_dir.display());
        let cmd_string = utils::quoted_argv(&self.argv);
        match &self.stdout {
            None => format!("{info}{cmd_string}\n"),
            Some(out) => {
                format!("{info}{cmd_string}\n-= Output =-\n{out}Exited with {}\n", self.returncode)
            }
        }
    }
}

/// Any non-empty `TESTING` value skips subprocess execution.
pub(crate) fn testing_mode() -> bool {
    std::env::var_os("TESTING").map(|v| !v.is_empty()).unwrap_or(false)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `clang -cc1 <args> -x ir <input> -o <output>`
pub fn clang_cc1(
    env: &ToolEnv,
    args: &[String],
    input: &str,
    output: &str,
    working_dir: &Path,
) -> Result<Cmd> {
    let mut argv = vec![path_arg(&env.get_tool("clang")?), "-cc1".to_string()];
    argv.extend(args.iter().cloned());
    argv.extend(["-x".to_string(), "ir".to_string(), input.to_string()]);
    argv.extend(["-o".to_string(), output.to_string()]);
    Ok(Cmd::new("Clang", argv, working_dir, CmdKind::Compile))
}

/// `swiftc -frontend <args> <input> -o <output>`
pub fn swift_frontend(
    env: &ToolEnv,
    args: &[String],
    input: &str,
    output: &str,
    working_dir: &Path,
) -> Result<Cmd> {
    let mut argv = vec![path_arg(&env.get_tool("swiftc")?), "-frontend".to_string()];
    argv.extend(args.iter().cloned());
    argv.push(input.to_string());
    argv.extend(["-o".to_string(), output.to_string()]);
    Ok(Cmd::new("Swift", argv, working_dir, CmdKind::Compile))
}

/// `ld <args> -o <output>`
pub fn ld(env: &ToolEnv, args: &[String], output: &Path, working_dir: &Path) -> Result<Cmd> {
    let mut argv = vec![path_arg(&env.get_tool("ld")?)];
    argv.extend(args.iter().cloned());
    argv.extend(["-o".to_string(), path_arg(output)]);
    Ok(Cmd::new("Ld", argv, working_dir, CmdKind::Compile))
}

/// `lipo -info <input>`; callers check the exit code themselves.
pub fn lipo_info(env: &ToolEnv, input: &Path, working_dir: &Path) -> Result<Cmd> {
    let argv = vec![path_arg(&env.get_tool("lipo")?), "-info".to_string(), path_arg(input)];
    Ok(Cmd::new("Lipo", argv, working_dir, CmdKind::Info))
}

/// `lipo <input> -thin <arch> -output <output>`
pub fn lipo_extract(
    env: &ToolEnv,
    input: &Path,
    arch: &str,
    output: &Path,
    working_dir: &Path,
) -> Result<Cmd> {
    let argv = vec![
        path_arg(&env.get_tool("lipo")?),
        path_arg(input),
        "-thin".to_string(),
        arch.to_string(),
        "-output".to_string(),
        path_arg(output),
    ];
    Ok(Cmd::new("Lipo", argv, working_dir, CmdKind::Info))
}

/// `lipo -create <inputs> -output <output>`
pub fn lipo_create(
    env: &ToolEnv,
    inputs: &[PathBuf],
    output: &Path,
    working_dir: &Path,
) -> Result<Cmd> {
    let mut argv = vec![path_arg(&env.get_tool("lipo")?), "-create".to_string()];
    argv.extend(inputs.iter().map(|p| path_arg(p)));
    argv.extend(["-output".to_string(), path_arg(output)]);
    Ok(Cmd::new("Lipo", argv, working_dir, CmdKind::Info))
}

/// `segedit <input> -extract __LLVM __bundle <output>`
pub fn extract_xar(env: &ToolEnv, input: &Path, output: &Path, working_dir: &Path) -> Result<Cmd> {
    let argv = vec![
        path_arg(&env.get_tool("segedit")?),
        path_arg(input),
        "-extract".to_string(),
        "__LLVM".to_string(),
        "__bundle".to_string(),
        path_arg(output),
    ];
    Ok(Cmd::new("ExtractXAR", argv, working_dir, CmdKind::Info))
}

/// `dwarfdump -u <input>`
pub fn dwarfdump_uuid(env: &ToolEnv, input: &Path, working_dir: &Path) -> Result<Cmd> {
    let argv = vec![path_arg(&env.get_tool("dwarfdump")?), "-u".to_string(), path_arg(input)];
    Ok(Cmd::new("GetUUID", argv, working_dir, CmdKind::Info))
}

/// File copy through `ditto`; object inputs are installed by copy, so this
/// runs even in verify mode.
pub fn copy_file(env: &ToolEnv, src: &str, dst: &str, working_dir: &Path) -> Result<Cmd> {
    let argv = vec![path_arg(&env.get_tool("ditto")?), src.to_string(), dst.to_string()];
    Ok(Cmd::new("CopyFile", argv, working_dir, CmdKind::Info))
}

/// Rewrites an LTO input to the arm64_32 watch triple without running the
/// optimization pipeline.
pub fn rewrite_arch(
    env: &ToolEnv,
    input: &str,
    output: &Path,
    deployment_target: Option<&str>,
    working_dir: &Path,
) -> Result<Cmd> {
    let mut triple = "arm64_32-apple-watchos".to_string();
    if let Some(dt) = deployment_target {
        triple.push_str(dt);
    }
    let argv = vec![
        path_arg(&env.get_tool("clang")?),
        "-target".to_string(),
        triple,
        "-c".to_string(),
        "-Xclang".to_string(),
        "-disable-llvm-passes".to_string(),
        "-emit-llvm".to_string(),
        "-x".to_string(),
        "ir".to_string(),
        input.to_string(),
        "-o".to_string(),
        path_arg(output),
    ];
    Ok(Cmd::new("RewriteArch", argv, working_dir, CmdKind::Info))
}
