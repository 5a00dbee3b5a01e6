//! Bundle archive handling: table-of-contents parsing and extraction.
//!
//! The on-disk format is delegated to the archive tool; this module only
//! consumes the logical schema: a root holding `subdoc` (bundle metadata)
//! and `toc` (the ordered file entries).

use crate::{
    cmd::{Cmd, CmdKind},
    env::ToolEnv,
    error::{RebuildError, Result},
};
use quick_xml::{events::Event, Reader};
use std::path::{Path, PathBuf};

/// One parsed XML element: name, accumulated text, children in document
/// order. Just enough tree to read a table of contents.
#[derive(Debug, Clone, Default)]
pub(crate) struct Element {
    pub name: String,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub(crate) fn parse(xml: &str) -> Result<Element> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut stack: Vec<Element> = vec![Element::default()];
        loop {
            match reader
                .read_event()
                .map_err(|e| RebuildError::ArchiveBroken(format!("malformed toc: {e}")))?
            {
                Event::Start(start) => {
                    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    stack.push(Element { name, ..Default::default() });
                }
                Event::Empty(empty) => {
                    let name = String::from_utf8_lossy(empty.name().as_ref()).into_owned();
                    let element = Element { name, ..Default::default() };
                    stack.last_mut().expect("root never popped").children.push(element);
                }
                Event::End(_) => {
                    let done = stack.pop().expect("balanced by the reader");
                    stack.last_mut().expect("root never popped").children.push(done);
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| RebuildError::ArchiveBroken(format!("malformed toc: {e}")))?;
                    stack.last_mut().expect("root never popped").text.push_str(&text);
                }
                Event::Eof => break,
                _ => {}
            }
        }
        let mut root = stack.pop().filter(|_| stack.is_empty()).ok_or_else(|| {
            RebuildError::ArchiveBroken("malformed toc: unbalanced document".to_string())
        })?;
        if root.children.len() == 1 {
            Ok(root.children.remove(0))
        } else {
            Err(RebuildError::ArchiveBroken("malformed toc: no document element".to_string()))
        }
    }

    pub(crate) fn find(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub(crate) fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

/// Which frontend recompiles a bitcode entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frontend {
    Clang,
    Swift,
}

/// One table-of-contents entry.
#[derive(Debug, Clone)]
pub enum FileEntry {
    /// A bitcode translation unit and its reconstructed frontend argv.
    Bitcode { name: String, frontend: Frontend, argv: Vec<String> },
    /// A prebuilt object, installed by copy.
    Object { name: String },
    /// A nested bundle, rebuilt recursively.
    Bundle { name: String },
    /// A link-time-optimization input, handed to the linker as bitcode.
    Lto { name: String },
}

impl FileEntry {
    pub fn name(&self) -> &str {
        match self {
            FileEntry::Bitcode { name, .. }
            | FileEntry::Object { name }
            | FileEntry::Bundle { name }
            | FileEntry::Lto { name } => name,
        }
    }
}

/// A dylib reference from the bundle metadata.
#[derive(Debug, Clone)]
pub struct Dylib {
    /// Logical name, possibly `{SDKPATH}`-prefixed.
    pub name: String,
    /// Weak references may be missing at link time.
    pub weak: bool,
}

/// Bundle metadata recovered from the archive's `subdoc`.
#[derive(Debug, Clone)]
pub struct BundleMetadata {
    pub platform: String,
    pub sdk_version: String,
    pub version: String,
    pub link_options: Vec<String>,
    pub dylibs: Vec<Dylib>,
    pub hide_symbols: bool,
    pub rt_forceload: bool,
}

/// An extracted bundle archive: its table of contents plus the scratch
/// directory holding the extracted files.
#[derive(Debug)]
pub struct Archive {
    pub input: PathBuf,
    /// Scratch directory the archive contents were extracted into.
    pub dir: PathBuf,
    root: Element,
}

const CHMOD: &str = "/bin/chmod";

impl Archive {
    /// Dumps and parses the table of contents, extracts the archive into a
    /// fresh scratch directory, and fixes read permissions.
    pub fn open(path: &Path, env: &ToolEnv) -> Result<Archive> {
        if !path.is_file() {
            return Err(RebuildError::ArchiveBroken(format!(
                "Input XAR doesn't exist: {}",
                path.display()
            )));
        }
        let xar = env.get_tool("xar")?.to_string_lossy().into_owned();

        let mut dump = Cmd::new(
            "XarToc",
            vec![xar.clone(), "-d".into(), "-".into(), "-f".into(), path.display().to_string()],
            std::env::temp_dir(),
            CmdKind::Info,
        );
        dump.run(env).map_err(|_| {
            RebuildError::ArchiveBroken(format!("toc cannot be extracted: {}", path.display()))
        })?;
        let root = Element::parse(dump.output())?;

        let dir = env.create_temp_directory("temp")?;
        let mut extract = Cmd::new(
            "XarExtract",
            vec![
                xar,
                "-x".into(),
                "-C".into(),
                dir.display().to_string(),
                "-f".into(),
                path.display().to_string(),
            ],
            std::env::temp_dir(),
            CmdKind::Info,
        );
        extract.run(env).map_err(|_| {
            RebuildError::ArchiveBroken(format!("XAR cannot be extracted: {}", path.display()))
        })?;

        let mut chmod = Cmd::new(
            "Chmod",
            vec![CHMOD.into(), "-R".into(), "+r".into(), dir.display().to_string()],
            std::env::temp_dir(),
            CmdKind::Info,
        );
        chmod.run(env).map_err(|_| {
            RebuildError::ArchiveBroken(format!("Permission fixup failed: {}", path.display()))
        })?;

        Ok(Archive { input: path.to_path_buf(), dir, root })
    }

    /// The bundle metadata; the platform/sdkversion/version triple is
    /// mandatory.
    pub fn metadata(&self) -> Result<BundleMetadata> {
        let subdoc = self
            .root
            .find("subdoc")
            .ok_or_else(|| RebuildError::ArchiveBroken("Malformed Header for bundle".into()))?;
        let required = |name: &str| -> Result<String> {
            subdoc
                .find(name)
                .map(|e| e.text.clone())
                .ok_or_else(|| RebuildError::ArchiveBroken("Malformed Header for bundle".into()))
        };
        let link_options = subdoc
            .find("link-options")
            .map(|node| node.find_all("option").map(|o| o.text.clone()).collect())
            .unwrap_or_default();
        let dylibs = subdoc
            .find("dylibs")
            .map(|node| {
                node.children
                    .iter()
                    .filter(|c| c.name == "lib" || c.name == "weak")
                    .map(|c| Dylib { name: c.text.clone(), weak: c.name == "weak" })
                    .collect()
            })
            .unwrap_or_default();
        Ok(BundleMetadata {
            platform: required("platform")?,
            sdk_version: required("sdkversion")?,
            version: required("version")?,
            link_options,
            dylibs,
            hide_symbols: subdoc.find("hide-symbols").map(|e| e.text == "1").unwrap_or(false),
            rt_forceload: subdoc.find("rt-forceload").map(|e| e.text == "1").unwrap_or(false),
        })
    }

    /// The file entries in document order. Entries of unknown type are
    /// skipped; a bitcode entry without a frontend argv is an error.
    pub fn entries(&self) -> Result<Vec<FileEntry>> {
        let toc = self
            .root
            .find("toc")
            .ok_or_else(|| RebuildError::ArchiveBroken("Malformed Header for bundle".into()))?;
        let mut entries = Vec::new();
        for file in toc.find_all("file") {
            let name = file.find("name").map(|e| e.text.clone()).unwrap_or_default();
            let file_type = file.find("file-type").map(|e| e.text.as_str()).unwrap_or("");
            let entry = match file_type {
                "Bitcode" => {
                    let (frontend, node) = if let Some(node) = file.find("clang") {
                        (Frontend::Clang, node)
                    } else if let Some(node) = file.find("swift") {
                        (Frontend::Swift, node)
                    } else {
                        return Err(RebuildError::ArchiveBroken(format!(
                            "Cannot figure out bitcode kind: {name}"
                        )));
                    };
                    let argv = node.find_all("cmd").map(|c| c.text.clone()).collect();
                    FileEntry::Bitcode { name, frontend, argv }
                }
                "Object" => FileEntry::Object { name },
                "Bundle" => FileEntry::Bundle { name },
                "LTO" => FileEntry::Lto { name },
                other => {
                    debug!("Ignoring toc entry {name} of type {other:?}");
                    continue;
                }
            };
            entries.push(entry);
        }
        Ok(entries)
    }
}
