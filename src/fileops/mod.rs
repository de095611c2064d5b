//! File operations composed from framed shell commands.
//!
//! Every operation builds one shell command with quote-escaped paths, runs
//! it through an injected [`Session`], and classifies success by a sentinel
//! marker plus exit code zero — never by absence of error text, since many
//! tools print warnings on success. Content transfer goes through base64 so
//! bytes survive the text channel (and the sanitizer's noise rules) intact.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use uuid::Uuid;

use crate::error::OpError;
use crate::listing::{
    bsd_list_command, gnu_list_command, join_path, parse_listing, parse_plain, plain_list_command,
    FileEntry, StatDialect,
};
use crate::session::{CommandResult, Session};

const OP_TIMEOUT: Duration = Duration::from_secs(15);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Content at or below this size is written with one quoted `printf`.
const INLINE_WRITE_MAX: usize = 4096;
/// Raw bytes per base64 chunk command; the encoded form stays well under
/// shell argument-length limits.
const WRITE_CHUNK_RAW: usize = 24 * 1024;
/// Caps for whole-file transfer through the channel.
const MAX_WRITE_BYTES: usize = 4 * 1024 * 1024;
const MAX_READ_BYTES: u64 = 4 * 1024 * 1024;

const SEARCH_MAX_DEPTH: u32 = 8;

/// Escape a string for safe single-quoted interpolation: `'` → `'\''`.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Marker-based success check: exit zero alone is not enough (a wrong
/// command can exit zero), and clean output alone is not enough either.
fn succeeded(result: &CommandResult, marker: &str) -> bool {
    result.success() && result.output.lines().any(|line| line.trim() == marker)
}

/// Strip the sentinel marker line, leaving the operation's real output.
fn without_marker(output: &str, marker: &str) -> String {
    output
        .lines()
        .filter(|line| !line.contains(marker))
        .collect::<Vec<_>>()
        .join("\n")
}

/// File operations over one injected session.
pub struct FileOps {
    session: Arc<Session>,
}

impl FileOps {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Run `command && echo '<marker>'` and classify the outcome.
    async fn run_checked(
        &self,
        op: &'static str,
        path: &str,
        command: String,
        timeout: Duration,
    ) -> Result<String, OpError> {
        let marker = format!("OK-{}", Uuid::new_v4().simple());
        let wire = format!("{command} && echo '{marker}'");
        let result = self.session.execute(&wire, timeout).await?;
        let cleaned = without_marker(&result.output, &marker);
        if succeeded(&result, &marker) {
            Ok(cleaned)
        } else if result.timed_out {
            Err(OpError::failed(op, path, "operation timed out"))
        } else {
            Err(OpError::failed(op, path, cleaned))
        }
    }

    /// List a directory: GNU stat, then BSD stat, then plain `ls -1AF`.
    /// The first non-empty, exit-zero result wins; an empty directory
    /// yields an empty listing, not an error.
    pub async fn list_directory(&self, path: &str) -> Result<Vec<FileEntry>, OpError> {
        let gnu = self.session.execute(&gnu_list_command(path), OP_TIMEOUT).await?;
        if gnu.success() && !gnu.output.trim().is_empty() {
            return Ok(parse_listing(&gnu.output, path, StatDialect::Gnu));
        }

        log::debug!("GNU stat listing unavailable for {path}, trying BSD");
        let bsd = self.session.execute(&bsd_list_command(path), OP_TIMEOUT).await?;
        if bsd.success() && !bsd.output.trim().is_empty() {
            return Ok(parse_listing(&bsd.output, path, StatDialect::Bsd));
        }

        let plain = self.session.execute_quick(&plain_list_command(path)).await?;
        if plain.success() {
            Ok(parse_plain(&plain.output, path))
        } else {
            Err(OpError::failed("list", path, plain.output))
        }
    }

    /// Metadata-free listing on the quick path, for tree expansion.
    pub async fn list_directory_quick(&self, path: &str) -> Result<Vec<FileEntry>, OpError> {
        let result = self.session.execute_quick(&plain_list_command(path)).await?;
        if result.success() {
            Ok(parse_plain(&result.output, path))
        } else {
            Err(OpError::failed("list", path, result.output))
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool, OpError> {
        let result = self
            .session
            .execute_quick(&format!("test -e {}", shell_quote(path)))
            .await?;
        Ok(result.exit_code == Some(0))
    }

    pub async fn create_directory(&self, path: &str) -> Result<(), OpError> {
        self.run_checked(
            "createDirectory",
            path,
            format!("mkdir -p {}", shell_quote(path)),
            OP_TIMEOUT,
        )
        .await
        .map(drop)
    }

    pub async fn create_file(&self, path: &str) -> Result<(), OpError> {
        self.run_checked(
            "createFile",
            path,
            format!("touch {}", shell_quote(path)),
            OP_TIMEOUT,
        )
        .await
        .map(drop)
    }

    pub async fn delete(&self, path: &str) -> Result<(), OpError> {
        self.run_checked("delete", path, format!("rm -rf {}", shell_quote(path)), OP_TIMEOUT)
            .await
            .map(drop)
    }

    /// Rename within the entry's parent directory.
    pub async fn rename(&self, path: &str, new_name: &str) -> Result<String, OpError> {
        let parent = match path.rfind('/') {
            Some(0) => "/",
            Some(idx) => &path[..idx],
            None => ".",
        };
        let new_path = join_path(parent, new_name);
        self.run_checked(
            "rename",
            path,
            format!("mv {} {}", shell_quote(path), shell_quote(&new_path)),
            OP_TIMEOUT,
        )
        .await?;
        Ok(new_path)
    }

    pub async fn chmod(&self, path: &str, mode: &str) -> Result<(), OpError> {
        self.run_checked(
            "chmod",
            path,
            format!("chmod {} {}", shell_quote(mode), shell_quote(path)),
            OP_TIMEOUT,
        )
        .await
        .map(drop)
    }

    pub async fn chown(
        &self,
        path: &str,
        owner: &str,
        group: Option<&str>,
    ) -> Result<(), OpError> {
        let spec = match group {
            Some(group) => format!("{owner}:{group}"),
            None => owner.to_string(),
        };
        self.run_checked(
            "chown",
            path,
            format!("chown {} {}", shell_quote(&spec), shell_quote(path)),
            OP_TIMEOUT,
        )
        .await
        .map(drop)
    }

    pub async fn copy(&self, from: &str, to: &str) -> Result<(), OpError> {
        self.run_checked(
            "copy",
            from,
            format!("cp -a {} {}", shell_quote(from), shell_quote(to)),
            OP_TIMEOUT,
        )
        .await
        .map(drop)
    }

    pub async fn move_entry(&self, from: &str, to: &str) -> Result<(), OpError> {
        self.run_checked(
            "move",
            from,
            format!("mv {} {}", shell_quote(from), shell_quote(to)),
            OP_TIMEOUT,
        )
        .await
        .map(drop)
    }

    /// Read a file's content. Transferred as base64 so bytes — including
    /// trailing-newline state and lines resembling shell noise — survive
    /// unchanged.
    pub async fn read_file(&self, path: &str) -> Result<String, OpError> {
        let quoted = shell_quote(path);
        let size_out = self
            .run_checked("read", path, format!("wc -c < {quoted}"), OP_TIMEOUT)
            .await?;
        let size: u64 = size_out.trim().parse().unwrap_or(0);
        if size > MAX_READ_BYTES {
            return Err(OpError::failed(
                "read",
                path,
                format!("file is {size} bytes, over the {MAX_READ_BYTES} byte cap"),
            ));
        }

        let encoded = self
            .run_checked("read", path, format!("base64 < {quoted}"), TRANSFER_TIMEOUT)
            .await?;
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = BASE64
            .decode(compact.as_bytes())
            .map_err(|e| OpError::failed("read", path, format!("invalid base64 payload: {e}")))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write content to a file. Small NUL-free content goes inline through
    /// one quoted `printf`; anything else is streamed as base64 chunks, so
    /// quoting, argument-length limits, and binary-adjacent bytes are never
    /// an issue.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), OpError> {
        if content.len() > MAX_WRITE_BYTES {
            return Err(OpError::failed(
                "write",
                path,
                format!("content is {} bytes, over the {MAX_WRITE_BYTES} byte cap", content.len()),
            ));
        }
        for command in build_write_commands(path, content) {
            self.run_checked("write", path, command, TRANSFER_TIMEOUT)
                .await?;
        }
        Ok(())
    }

    /// Case-insensitive name search under a path. Directories are listed
    /// first and carry a trailing `/` on the wire, mirroring the fallback
    /// listing conventions.
    pub async fn search(
        &self,
        path: &str,
        pattern: &str,
        max_results: usize,
    ) -> Result<Vec<FileEntry>, OpError> {
        let quoted = shell_quote(path);
        let glob = shell_quote(&format!("*{pattern}*"));
        let command = format!(
            "{{ find {quoted} -maxdepth {SEARCH_MAX_DEPTH} -iname {glob} -type d | sed 's|$|/|'; \
             find {quoted} -maxdepth {SEARCH_MAX_DEPTH} -iname {glob} ! -type d; }} \
             2>/dev/null | head -n {max_results}"
        );
        let result = self.session.execute(&command, OP_TIMEOUT).await?;
        if result.timed_out {
            return Err(OpError::failed("search", path, "operation timed out"));
        }
        Ok(parse_search_output(&result.output, path))
    }
}

/// Commands that write `content` to `path`, in order.
fn build_write_commands(path: &str, content: &str) -> Vec<String> {
    let quoted = shell_quote(path);
    if content.len() <= INLINE_WRITE_MAX && !content.contains('\0') {
        return vec![format!("printf '%s' {} > {quoted}", shell_quote(content))];
    }
    let mut commands = Vec::new();
    for (index, chunk) in content.as_bytes().chunks(WRITE_CHUNK_RAW).enumerate() {
        let b64 = BASE64.encode(chunk);
        let redirect = if index == 0 { ">" } else { ">>" };
        commands.push(format!("printf '%s' '{b64}' | base64 -d {redirect} {quoted}"));
    }
    commands
}

/// Turn `find` output (absolute paths, directories suffixed with `/`) into
/// entries; the search root itself is dropped.
fn parse_search_output(raw: &str, root: &str) -> Vec<FileEntry> {
    let root = root.trim_end_matches('/');
    let mut entries = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (full, is_dir) = match line.strip_suffix('/') {
            Some(stripped) => (stripped, true),
            None => (line, false),
        };
        if full == root {
            continue;
        }
        let (parent, name) = match full.rfind('/') {
            Some(0) => ("/", &full[1..]),
            Some(idx) => (&full[..idx], &full[idx + 1..]),
            None => continue,
        };
        if name.is_empty() {
            continue;
        }
        entries.push(FileEntry::new(name, parent, is_dir));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHandle;
    use crate::session::auth::NoSecrets;
    use crate::session::ConnectionTarget;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_shell_quote_plain_and_quoted() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a$b`c"), "'a$b`c'");
    }

    #[test]
    fn test_inline_write_command_quotes_content() {
        let cmds = build_write_commands("/tmp/f", "say 'hi' $HOME `id`");
        assert_eq!(cmds.len(), 1);
        assert_eq!(
            cmds[0],
            "printf '%s' 'say '\\''hi'\\'' $HOME `id`' > '/tmp/f'"
        );
    }

    #[test]
    fn test_large_write_uses_base64_chunks() {
        let content = "x".repeat(WRITE_CHUNK_RAW + 10);
        let cmds = build_write_commands("/tmp/big", &content);
        assert_eq!(cmds.len(), 2);
        assert!(cmds[0].contains("| base64 -d > '/tmp/big'"));
        assert!(cmds[1].contains("| base64 -d >> '/tmp/big'"));

        // Codec round trip: decoding the chunks in order restores the bytes.
        let mut restored = Vec::new();
        for cmd in &cmds {
            let start = cmd.find("'%s' '").unwrap() + "'%s' '".len();
            let end = cmd[start..].find('\'').unwrap() + start;
            restored.extend(BASE64.decode(&cmd[start..end]).unwrap());
        }
        assert_eq!(restored, content.as_bytes());
    }

    #[test]
    fn test_nul_bytes_force_base64_path() {
        let cmds = build_write_commands("/tmp/f", "a\0b");
        assert!(cmds[0].contains("base64 -d"));
    }

    #[test]
    fn test_succeeded_requires_exact_marker_line() {
        let ok = CommandResult {
            output: "some warning\nOK-abc".into(),
            exit_code: Some(0),
            elapsed: Duration::from_millis(1),
            timed_out: false,
        };
        assert!(succeeded(&ok, "OK-abc"));

        // Marker embedded in other text (e.g. an echoed command) is not enough.
        let echoed = CommandResult {
            output: "mkdir -p '/x' && echo 'OK-abc'".into(),
            exit_code: Some(0),
            elapsed: Duration::from_millis(1),
            timed_out: false,
        };
        assert!(!succeeded(&echoed, "OK-abc"));

        let failed = CommandResult {
            output: "OK-abc".into(),
            exit_code: Some(1),
            elapsed: Duration::from_millis(1),
            timed_out: false,
        };
        assert!(!succeeded(&failed, "OK-abc"));
    }

    #[test]
    fn test_parse_search_output() {
        let raw = "/srv/app/logs/\n/srv/app/config.yml\n/srv/app/\n";
        let entries = parse_search_output(raw, "/srv/app");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "logs");
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].path, "/srv/app/logs");
        assert_eq!(entries[1].name, "config.yml");
        assert!(!entries[1].is_dir);
    }

    /// Fake shell understanding the framed-command wire format and the
    /// sentinel-marker convention used by `run_checked`.
    async fn fake_shell(server: tokio::io::DuplexStream) {
        let (mut reader, mut writer) = tokio::io::split(server);
        let mut pending = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match reader.read(&mut byte).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            if byte[0] != b'\n' {
                pending.push(byte[0]);
                continue;
            }
            let line = String::from_utf8_lossy(&pending).to_string();
            pending.clear();

            let Some(frame_at) = line.find("); echo '") else { continue };
            let delim_start = frame_at + "); echo '".len();
            let delim_end = line[delim_start..].find('\'').unwrap() + delim_start;
            let delim = line[delim_start..delim_end].to_string();
            let inner = &line[..frame_at];

            let marker = inner.find("echo 'OK-").map(|at| {
                let start = at + "echo '".len();
                let end = inner[start..].find('\'').unwrap() + start;
                inner[start..end].to_string()
            });

            let payload = if inner.contains("stat --printf") {
                // GNU coreutils missing on this host.
                format!("sh: stat: command not found\n{delim}127\n")
            } else if inner.contains("stat -f") {
                format!(
                    "www|Directory|512|0755|root|1700000000\n\
                     app.log|Regular File|42|0644|root|1700000001\n{delim}0\n"
                )
            } else if inner.contains("mkdir -p '/denied'") {
                format!("mkdir: cannot create directory '/denied': Permission denied\n{delim}1\n")
            } else if inner.contains("wc -c") {
                let marker = marker.as_deref().unwrap_or("");
                format!("5\n{marker}\n{delim}0\n")
            } else if inner.contains("base64 < ") {
                let marker = marker.as_deref().unwrap_or("");
                let b64 = BASE64.encode(b"hello");
                format!("{b64}\n{marker}\n{delim}0\n")
            } else if let Some(marker) = marker {
                format!("{marker}\n{delim}0\n")
            } else {
                format!("{delim}0\n")
            };
            if writer.write_all(payload.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    fn fake_ops() -> FileOps {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(fake_shell(server));
        let (reader, writer) = tokio::io::split(client);
        let session = Session::from_parts(
            ChannelHandle::spawn(reader, writer),
            ConnectionTarget::Local,
            Arc::new(NoSecrets),
            Duration::from_secs(5),
        );
        FileOps::new(Arc::new(session))
    }

    #[tokio::test]
    async fn test_create_directory_success() {
        let ops = fake_ops();
        ops.create_directory("/srv/new").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_directory_failure_is_typed() {
        let ops = fake_ops();
        let err = ops.create_directory("/denied").await.unwrap_err();
        match err {
            OpError::Failed { op, path, message } => {
                assert_eq!(op, "createDirectory");
                assert_eq!(path, "/denied");
                assert!(message.contains("Permission denied"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_directory_falls_back_to_bsd() {
        let ops = fake_ops();
        let entries = ops.list_directory("/var").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "www");
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].name, "app.log");
        assert_eq!(entries[1].size, 42);
    }

    #[tokio::test]
    async fn test_read_file_decodes_base64() {
        let ops = fake_ops();
        let content = ops.read_file("/etc/motd").await.unwrap();
        assert_eq!(content, "hello");
    }
}
