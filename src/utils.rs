//! Utility functions

use std::{path::Path, str::FromStr};

/// A free-length dotted-integer version, as reported by the Apple linker
/// (`253.3.1`) and recorded in bundle metadata (`6.0`, `8.3`).
///
/// These are not semver: any number of components is allowed and ordering is
/// lexicographic over the component tuple, so `253.3 < 253.3.1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DottedVersion(pub Vec<u64>);

impl FromStr for DottedVersion {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split('.').map(|c| c.parse::<u64>()).collect::<Result<Vec<_>, _>>().map(DottedVersion)
    }
}

impl std::fmt::Display for DottedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut components = self.0.iter();
        if let Some(first) = components.next() {
            write!(f, "{first}")?;
        }
        for c in components {
            write!(f, ".{c}")?;
        }
        Ok(())
    }
}

/// Parses the trailing dotted-integer run of a tool's version line, e.g.
/// `@(#)PROGRAM:ld  PROJECT:ld64-253.3.1` -> `253.3.1`.
pub fn version_from_line(line: &str) -> Option<DottedVersion> {
    line.rsplit('-').next().and_then(|v| v.trim().parse().ok())
}

/// Whether `path` points at a plain file. Tool lookup treats any file hit as
/// the tool; the execute bit is left to the kernel to complain about.
pub fn is_tool_file(path: &Path) -> bool {
    path.is_file()
}

/// Renders an argv the way a shell user would retype it, every token quoted.
pub fn quoted_argv(argv: &[String]) -> String {
    argv.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(" ")
}
