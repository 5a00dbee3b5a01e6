//! Mach-O container handling: classification, slice extraction, embedded
//! bundle extraction, and fat re-assembly.

use crate::{
    bundle::{self, BundleOutput},
    cmd,
    env::ToolEnv,
    error::{RebuildError, Result},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::HashMap,
    fs,
    io::Read,
    path::{Path, PathBuf},
};

/// Container kind, sniffed from the magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachoType {
    /// Not a Mach-O file.
    Error,
    /// Single-architecture image.
    Thin,
    /// Multi-architecture container.
    Fat,
}

const FAT_MAGICS: [[u8; 4]; 2] = [[0xca, 0xfe, 0xba, 0xbe], [0xbe, 0xba, 0xfe, 0xca]];
const THIN_MAGICS: [[u8; 4]; 4] = [
    [0xfe, 0xed, 0xfa, 0xce],
    [0xfe, 0xed, 0xfa, 0xcf],
    [0xce, 0xfa, 0xed, 0xfe],
    [0xcf, 0xfa, 0xed, 0xfe],
];

impl MachoType {
    /// Classifies a file by its first four bytes, both endiannesses.
    pub fn get_type(path: &Path) -> Result<MachoType> {
        let mut magic = [0u8; 4];
        let mut file = fs::File::open(path)?;
        if file.read(&mut magic)? < 4 {
            return Ok(MachoType::Error);
        }
        if FAT_MAGICS.contains(&magic) {
            Ok(MachoType::Fat)
        } else if THIN_MAGICS.contains(&magic) {
            Ok(MachoType::Thin)
        } else {
            Ok(MachoType::Error)
        }
    }
}

/// `lipo -info` reports either `Non-fat file: <path> is architecture: <arch>`
/// or `... are: <arch> <arch> ...`.
pub(crate) fn parse_archs(info: &str) -> Result<Vec<String>> {
    if info.starts_with("Non-fat") {
        let arch = info
            .split_whitespace()
            .last()
            .ok_or_else(|| RebuildError::msg("Could not detect architecture of the MachO file"))?;
        return Ok(vec![arch.to_string()]);
    }
    let words: Vec<&str> = info.split_whitespace().collect();
    let begin = words
        .iter()
        .position(|w| *w == "are:")
        .ok_or_else(|| RebuildError::msg("Could not detect architecture of the MachO file"))?;
    Ok(words[begin + 1..].iter().map(|w| w.to_string()).collect())
}

static UUID_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"UUID:\s+(\S+)\s+\((\S+)\)").unwrap());

/// Parses `dwarfdump -u` output into an arch -> UUID map.
pub(crate) fn parse_uuids(out: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in out.lines() {
        if let Some(caps) = UUID_LINE_RE.captures(line) {
            map.insert(caps[2].to_string(), caps[1].to_string());
        }
    }
    map
}

/// One Mach-O input and its per-architecture rebuild state.
pub struct Macho {
    pub path: PathBuf,
    name: String,
    pub macho_type: MachoType,
    archs: Vec<String>,
    uuids: HashMap<String, String>,
    temp_dir: PathBuf,
    slice_cache: HashMap<String, PathBuf>,
    bitcode_cache: HashMap<String, PathBuf>,
    output_slices: Vec<BundleOutput>,
}

impl Macho {
    /// Probes the container: magic classification, architecture list and
    /// slice UUIDs.
    pub fn new(path: &Path, env: &ToolEnv) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "macho".to_string());
        let macho_type = MachoType::get_type(path)?;
        if macho_type == MachoType::Error {
            let err = RebuildError::msg(format!("Input is not a macho file: {}", path.display()));
            error!("{err}");
            return Err(err);
        }
        let temp_dir = env.create_temp_directory(&name)?;

        let mut info = cmd::lipo_info(env, path, &temp_dir)?;
        info.run_xfail(env)?;
        if info.returncode != 0 {
            let err = RebuildError::msg(format!("{} is not valid macho file", path.display()));
            error!("{err}");
            return Err(err);
        }
        let archs = parse_archs(info.output())?;

        let mut uuid_info = cmd::dwarfdump_uuid(env, path, &temp_dir)?;
        uuid_info.run(env)?;
        let uuids = parse_uuids(uuid_info.output());

        Ok(Macho {
            path: path.to_path_buf(),
            name,
            macho_type,
            archs,
            uuids,
            temp_dir,
            slice_cache: HashMap::new(),
            bitcode_cache: HashMap::new(),
            output_slices: Vec::new(),
        })
    }

    pub fn archs(&self) -> &[String] {
        &self.archs
    }

    pub fn uuid(&self, arch: &str) -> Option<&str> {
        self.uuids.get(arch).map(String::as_str)
    }

    pub fn output_slices(&self) -> &[BundleOutput] {
        &self.output_slices
    }

    /// The path of the thin image for `arch`: the input itself for a thin
    /// container, an extracted (and cached) slice for a fat one.
    pub fn get_slice(&mut self, arch: &str, env: &ToolEnv) -> Result<PathBuf> {
        if !self.archs.iter().any(|a| a == arch) {
            let err = RebuildError::msg(format!(
                "Requested arch {arch} doesn't exist in {}",
                self.path.display()
            ));
            error!("{err}");
            return Err(err);
        }
        match self.macho_type {
            MachoType::Thin => Ok(self.path.clone()),
            MachoType::Fat => {
                if let Some(path) = self.slice_cache.get(arch) {
                    return Ok(path.clone());
                }
                let extract_path = self.temp_dir.join(format!("{}.{arch}", self.name));
                let mut job = cmd::lipo_extract(env, &self.path, arch, &extract_path, &self.temp_dir)?;
                job.run_xfail(env)?;
                if job.returncode != 0 {
                    let err = RebuildError::msg(format!(
                        "Cannot extract arch {arch} from {}",
                        self.path.display()
                    ));
                    error!("{err}");
                    return Err(err);
                }
                self.slice_cache.insert(arch.to_string(), extract_path.clone());
                Ok(extract_path)
            }
            MachoType::Error => Err(RebuildError::msg(format!(
                "Input is not a macho file: {}",
                self.path.display()
            ))),
        }
    }

    /// Extracts the embedded `__LLVM,__bundle` archive from the slice for
    /// `arch`, caching the result. A section of one byte or less is a bare
    /// bitcode marker and cannot be rebuilt.
    pub fn get_xar(&mut self, arch: &str, env: &ToolEnv) -> Result<PathBuf> {
        if let Some(path) = self.bitcode_cache.get(arch) {
            return Ok(path.clone());
        }
        let thin = self.get_slice(arch, env)?;
        let extract_path = self.temp_dir.join(format!("{}.{arch}.xar", self.name));
        let mut job = cmd::extract_xar(env, &thin, &extract_path, &self.temp_dir)?;
        job.run_xfail(env)?;
        if job.returncode != 0 {
            let err = RebuildError::ArchiveBroken(format!(
                "Cannot extract bundle from {} ({arch})",
                self.path.display()
            ));
            error!("{err}");
            return Err(err);
        }
        if fs::metadata(&extract_path)?.len() <= 1 {
            let err = RebuildError::BundleOnlyContainsMarker {
                path: self.path.clone(),
                arch: arch.to_string(),
            };
            error!("{err}");
            return Err(err);
        }
        self.bitcode_cache.insert(arch.to_string(), extract_path.clone());
        Ok(extract_path)
    }

    /// Rebuilds the bundle for one architecture and records its output.
    pub fn build_bitcode(&mut self, arch: &str, env: &ToolEnv) -> Result<&BundleOutput> {
        let output_path = self.temp_dir.join(format!("{}.{arch}.out", self.name));
        let bundle_path = self.get_xar(arch, env)?;
        if let Some(uuid) = self.uuids.get(arch) {
            env.set_uuid(uuid);
        }
        let output = bundle::build(arch, &bundle_path, &output_path, env)?;
        self.output_slices.push(output);
        Ok(self.output_slices.last().expect("just pushed"))
    }

    /// Installs the rebuilt image: a single slice is moved into place,
    /// multiple slices are re-created as a fat file.
    pub fn install_output(&mut self, path: &Path, env: &ToolEnv) -> Result<()> {
        match self.output_slices.len() {
            0 => {
                let err = RebuildError::msg("Install failed: no bitcode build yet");
                error!("{err}");
                Err(err)
            }
            1 => {
                let built = self.output_slices[0].output.clone();
                move_file(&built, path).map_err(|_| {
                    let err = RebuildError::msg(format!(
                        "Install failed: can't create {}",
                        path.display()
                    ));
                    error!("{err}");
                    err
                })
            }
            _ => {
                let slices: Vec<PathBuf> =
                    self.output_slices.iter().map(|s| s.output.clone()).collect();
                let mut job = cmd::lipo_create(env, &slices, path, &self.temp_dir)?;
                job.run(env)?;
                Ok(())
            }
        }
    }

    /// Whether every rebuilt slice links an executable.
    pub fn is_executable(&self) -> bool {
        !self.output_slices.is_empty() && self.output_slices.iter().all(|s| s.is_executable)
    }
}

/// Rename, falling back to copy for cross-device installs.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)?;
            Ok(())
        }
    }
}
