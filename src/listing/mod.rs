//! Structured directory listings from heterogeneous `ls`/`stat` output.
//!
//! Remote hosts speak different stat dialects: GNU coreutils
//! (`stat --printf`) and BSD (`stat -f`). Both are normalized into
//! [`FileEntry`] values; plain `ls -1AF` output is a last-resort fallback
//! with unknown metadata. Parsing never fails — unparsable lines are
//! skipped, not fatal.

pub mod tree;

use serde::{Deserialize, Serialize};

/// Which stat flavor produced a structured listing line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatDialect {
    Gnu,
    Bsd,
}

/// Coarse type classification for UI icons, derived from the extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Folder,
    File,
    Image,
    Video,
}

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "webp", "svg", "heic", "ico", "tiff",
];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm", "m4v", "flv", "wmv"];

/// One file or directory in a listing.
///
/// Value object rebuilt from fresh listings; identity, equality, and
/// hashing are by absolute path only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    /// Bytes; 0 when unknown.
    pub size: u64,
    /// Permission string as reported (octal for GNU, mode letters for BSD);
    /// empty when unknown.
    pub permissions: String,
    pub owner: String,
    /// Modification time, seconds since the epoch; `None` when unknown.
    pub modified: Option<u64>,
    pub kind: FileKind,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, base_path: &str, is_dir: bool) -> Self {
        let name = name.into();
        let path = join_path(base_path, &name);
        let kind = classify(&name, is_dir);
        Self {
            name,
            path,
            is_dir,
            size: 0,
            permissions: String::new(),
            owner: String::new(),
            modified: None,
            kind,
        }
    }
}

impl PartialEq for FileEntry {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for FileEntry {}

impl std::hash::Hash for FileEntry {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

/// Join a base path and a name without duplicating separators.
pub fn join_path(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Extension-derived classification.
pub fn classify(name: &str, is_dir: bool) -> FileKind {
    if is_dir {
        return FileKind::Folder;
    }
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some(e) if IMAGE_EXTENSIONS.contains(&e) => FileKind::Image,
        Some(e) if VIDEO_EXTENSIONS.contains(&e) => FileKind::Video,
        _ => FileKind::File,
    }
}

/// Listing command for the GNU stat dialect.
pub fn gnu_list_command(path: &str) -> String {
    let quoted = crate::fileops::shell_quote(path);
    format!(
        "cd {quoted} && ls -1A | while IFS= read -r f; do \
         stat --printf='%n|%F|%s|%a|%U|%Y\\n' -- \"$f\"; done"
    )
}

/// Listing command for the BSD stat dialect.
pub fn bsd_list_command(path: &str) -> String {
    let quoted = crate::fileops::shell_quote(path);
    format!(
        "cd {quoted} && ls -1A | while IFS= read -r f; do \
         stat -f '%N|%HT|%z|%Mp%Lp|%Su|%m' \"$f\"; done"
    )
}

/// Metadata-free fallback listing command.
pub fn plain_list_command(path: &str) -> String {
    format!("ls -1AF {}", crate::fileops::shell_quote(path))
}

/// Parse pipe-delimited `name|type|size|perms|owner|mtime` lines.
pub fn parse_listing(raw: &str, base_path: &str, dialect: StatDialect) -> Vec<FileEntry> {
    let mut entries = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let Some(entry) = parse_stat_line(line, base_path, dialect) else {
            continue;
        };
        entries.push(entry);
    }
    finalize(entries)
}

fn parse_stat_line(line: &str, base_path: &str, _dialect: StatDialect) -> Option<FileEntry> {
    // Both dialects emit six fields; names containing '|' would add more,
    // so split from the right to keep the name intact.
    let mut fields: Vec<&str> = Vec::with_capacity(6);
    let mut rest = line;
    for _ in 0..5 {
        let (head, tail) = rest.rsplit_once('|')?;
        fields.push(tail);
        rest = head;
    }
    fields.push(rest);
    fields.reverse();

    let name = fields[0];
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    let is_dir = fields[1].to_ascii_lowercase().contains("directory");
    let size = fields[2].parse::<u64>().unwrap_or(0);
    let permissions = fields[3].to_string();
    let owner = fields[4].to_string();
    let modified = fields[5].trim().parse::<u64>().ok();

    let mut entry = FileEntry::new(name, base_path, is_dir);
    entry.size = if is_dir { 0 } else { size };
    entry.permissions = permissions;
    entry.owner = owner;
    entry.modified = modified;
    Some(entry)
}

/// Parse plain `ls -1AF` output: trailing `/` marks a directory, trailing
/// `@`/`*` (symlink/executable) are stripped from the name. Sizes and
/// dates are unknown.
pub fn parse_plain(raw: &str, base_path: &str) -> Vec<FileEntry> {
    let mut entries = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, is_dir) = if let Some(stripped) = line.strip_suffix('/') {
            (stripped, true)
        } else if let Some(stripped) = line.strip_suffix(['@', '*']) {
            (stripped, false)
        } else {
            (line, false)
        };
        if name.is_empty() || name == "." || name == ".." {
            continue;
        }
        entries.push(FileEntry::new(name, base_path, is_dir));
    }
    finalize(entries)
}

/// Shared post-processing: drop `.`/`..`, dedup keeping first-seen order,
/// then sort directories before files, case-insensitive by name within
/// each group. The UI tree view depends on this ordering.
fn finalize(entries: Vec<FileEntry>) -> Vec<FileEntry> {
    let mut seen = std::collections::HashSet::new();
    let mut unique: Vec<FileEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        if seen.insert(entry.path.clone()) {
            unique.push(entry);
        }
    }
    unique.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then(a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    unique
}
