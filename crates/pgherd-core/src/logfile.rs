// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Helpers for reading server log files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Last `lines` lines of `path`.
pub fn tail(path: &Path, lines: usize) -> io::Result<String> {
    let text = fs::read_to_string(path)?;
    Ok(tail_str(&text, lines))
}

fn tail_str(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Last lines of `path`, or an empty string when it cannot be read.
pub fn tail_or_empty(path: &Path, lines: usize) -> String {
    tail(path, lines).unwrap_or_default()
}

/// Most recently modified `*.log` file directly inside `dir`.
pub fn newest_log(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified()?;
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, p)| p))
}
