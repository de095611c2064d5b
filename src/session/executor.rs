//! Delimiter-framed execution of one logical command on a live channel.
//!
//! A shell is not a request/response protocol: output is unframed, echoed,
//! and asynchronous. The executor injects a random delimiter after each
//! command, `<cmd>; echo '<DELIM>'$?`, and scans the accumulated output for
//! the delimiter followed by a numeric exit code. An occurrence followed by
//! anything else is the command's own echo and is skipped.

use std::time::Instant;

use uuid::Uuid;

use crate::channel::ChannelHandle;
use crate::error::SessionError;
use crate::fileops::shell_quote;
use crate::output::OutputSanitizer;
use crate::session::auth::CredentialInjector;
use crate::session::{CommandResult, CommandSpec};

/// Wire form of one framed command.
pub(crate) fn build_wire(spec: &CommandSpec, delim: &str) -> String {
    let mut inner = String::new();
    if let Some(dir) = &spec.working_dir {
        inner.push_str("cd ");
        inner.push_str(&shell_quote(dir));
        inner.push_str(" && ");
    }
    for (key, value) in &spec.env {
        // Keys are caller-controlled identifiers; values are quoted.
        inner.push_str("export ");
        inner.push_str(key);
        inner.push('=');
        inner.push_str(&shell_quote(value));
        inner.push_str("; ");
    }
    inner.push_str(&spec.command);
    // Subshell so per-request cwd/env never leak into the session shell.
    format!("( {inner} ); echo '{delim}'$?\n")
}

pub(crate) fn new_delimiter() -> String {
    format!("QUAY-{}", Uuid::new_v4().simple())
}

/// Result of scanning the buffer for an authoritative frame boundary.
enum FrameScan {
    Incomplete,
    Complete { cut: usize, exit_code: i32 },
}

/// Find the delimiter followed by a complete numeric exit code.
///
/// Digits running to the end of the buffer are not yet authoritative (a
/// later chunk may carry more digits); a delimiter followed by a non-digit
/// is an echo of the command line itself.
fn scan_frame(buf: &[u8], delim: &[u8]) -> FrameScan {
    let mut from = 0;
    while let Some(rel) = find_sub(&buf[from..], delim) {
        let at = from + rel;
        let after = &buf[at + delim.len()..];
        let digits = after.iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            // Echoed command text (`'$?`) or an unrelated collision.
            from = at + delim.len();
            continue;
        }
        if digits == after.len() {
            return FrameScan::Incomplete;
        }
        let code: i32 = std::str::from_utf8(&after[..digits])
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(-1);
        return FrameScan::Complete { cut: at, exit_code: code };
    }
    FrameScan::Incomplete
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Run one framed command. Timeouts are values (`timed_out = true`), not
/// errors; channel death and authentication failures are errors.
pub(crate) async fn run(
    chan: &mut ChannelHandle,
    sanitizer: &OutputSanitizer,
    injector: &mut CredentialInjector,
    spec: &CommandSpec,
) -> Result<CommandResult, SessionError> {
    let delim = new_delimiter();
    let wire = build_wire(spec, &delim);
    let writer = chan.writer();

    injector.rearm();
    log::debug!("executing framed command ({} bytes)", wire.len());
    chan.write(wire.as_bytes()).await?;

    let started = Instant::now();
    let deadline = started + spec.timeout;
    let mut buffer: Vec<u8> = Vec::new();
    let mut exit_code: Option<i32> = None;
    let mut timed_out = false;

    loop {
        let now = Instant::now();
        if now >= deadline {
            timed_out = true;
            break;
        }
        match tokio::time::timeout(deadline - now, chan.next_chunk()).await {
            Err(_) => {
                timed_out = true;
                break;
            }
            Ok(None) => {
                return Err(SessionError::ConnectionLost(
                    "channel closed mid-command".into(),
                ));
            }
            Ok(Some(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                injector.observe(&text, &writer).await?;
                buffer.extend_from_slice(&bytes);
                if let FrameScan::Complete { cut, exit_code: code } = scan_frame(&buffer, delim.as_bytes()) {
                    buffer.truncate(cut);
                    exit_code = Some(code);
                    break;
                }
            }
        }
    }

    if injector.rejected() {
        return Err(SessionError::AuthenticationFailed {
            command: spec.command.clone(),
        });
    }
    if timed_out && injector.unanswered() {
        return Err(SessionError::AuthenticationFailed {
            command: spec.command.clone(),
        });
    }

    let raw = String::from_utf8_lossy(&buffer);
    let clean = sanitizer.sanitize(&raw);
    // Protocol lines (the echoed wire command, stray delimiter noise) must
    // never reach the caller.
    let output: String = clean
        .lines()
        .filter(|line| !line.contains(&delim))
        .collect::<Vec<_>>()
        .join("\n");
    let output = output.trim_end_matches(['\n', '\r']).to_string();

    if timed_out {
        log::debug!(
            "command timed out after {:?} with {} bytes of partial output",
            spec.timeout,
            output.len()
        );
    }

    Ok(CommandResult {
        output,
        exit_code,
        elapsed: started.elapsed(),
        timed_out,
    })
}
