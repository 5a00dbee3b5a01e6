//! Symbol-map deobfuscation for link diagnostics.
//!
//! Hidden-symbol builds replace every symbol name with `__hidden#N_`; the
//! matching `.bcsymbolmap` file carries the original names, one per line.

use std::{
    fs,
    path::{Path, PathBuf},
};

/// Substitutes `__hidden#N_` sigils in tool output with the original names
/// from a bitcode symbol map.
#[derive(Debug, Clone)]
pub struct Deobfuscator {
    /// As configured: a single map file, or a directory of `<uuid>.bcsymbolmap`.
    input: PathBuf,
    /// The map file in effect for the current slice.
    symbol_map: PathBuf,
}

const SIGIL: &str = "__hidden#";

impl Deobfuscator {
    pub fn new(symbol_map: impl Into<PathBuf>) -> Self {
        let input = symbol_map.into();
        Deobfuscator { symbol_map: input.clone(), input }
    }

    /// Selects the map for a slice. A directory input maps each UUID to its
    /// own file; a file input serves every UUID.
    pub fn select_uuid(&mut self, uuid: &str) {
        if self.input.is_dir() {
            self.symbol_map = self.input.join(format!("{uuid}.bcsymbolmap"));
        } else {
            self.symbol_map = self.input.clone();
        }
    }

    pub fn symbol_map(&self) -> &Path {
        &self.symbol_map
    }

    /// Replaces every `__hidden#N_` occurrence with line `N + 1` of the
    /// active map, trimmed. Returns `None` when the message holds no sigil,
    /// the map is unreadable, an index is out of range, or a pass makes no
    /// progress (which would otherwise loop forever).
    pub fn try_deobfuscate(&self, msg: &str) -> Option<String> {
        if !msg.contains(SIGIL) {
            return None;
        }
        let map = fs::read_to_string(&self.symbol_map).ok()?;
        let symbols: Vec<&str> = map.lines().collect();
        let mut msg = msg.to_string();
        while let Some(index) = msg.find(SIGIL) {
            let start = index + SIGIL.len();
            let end = msg[start..].find('_').map(|i| start + i)?;
            let number: usize = msg[start..end].parse().ok()?;
            let symbol = symbols.get(number + 1)?.trim();
            let token = msg[index..=end].to_string();
            let new_msg = msg.replace(&token, symbol);
            // a map entry that itself holds a sigil would never converge
            if new_msg.matches(SIGIL).count() >= msg.matches(SIGIL).count() {
                return None;
            }
            msg = new_msg;
        }
        Some(msg)
    }
}
