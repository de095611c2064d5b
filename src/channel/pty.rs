//! Local shell transport: `/bin/bash` on a pseudo-terminal.
//!
//! The child sees a real controlling terminal (`isatty() = true`), so the
//! same framing protocol works for the local machine as for SSH targets.

use anyhow::Context;

use super::ChannelHandle;
use crate::error::ConnectError;

/// Wide terminal so long listing lines are never soft-wrapped by the PTY.
const PTY_ROWS: u16 = 48;
const PTY_COLS: u16 = 512;

/// One-time setup written into every fresh shell, local or remote: turn off
/// echo and prompts so the output stream carries only command output, and
/// neutralize pagers and locale-dependent formatting.
pub const SHELL_INIT: &str = "stty -echo 2>/dev/null; \
export PS1='' PS2='' PROMPT_COMMAND='' PAGER=cat GIT_PAGER=cat LANG=C LC_ALL=C; \
unset HISTFILE\n";

/// Spawn a local interactive shell on a PTY.
///
/// Returns the channel plus the child process; the caller owns the child's
/// lifecycle (graceful `exit`, then kill on close).
pub fn spawn_local_shell(
    shell: &str,
) -> Result<(ChannelHandle, tokio::process::Child), ConnectError> {
    let transport = || -> anyhow::Result<(ChannelHandle, tokio::process::Child)> {
        let (pty, pts) = pty_process::open().context("failed to open PTY")?;
        pty.resize(pty_process::Size::new(PTY_ROWS, PTY_COLS))
            .context("failed to resize PTY")?;

        let mut cmd = pty_process::Command::new(shell)
            .arg("--norc")
            .arg("--noprofile");

        let child = cmd.spawn(pts).context("failed to spawn shell on PTY")?;

        let (read_pty, write_pty) = pty.into_split();
        Ok((ChannelHandle::spawn(read_pty, write_pty), child))
    };

    transport().map_err(|source| ConnectError::Transport {
        target: "local".to_string(),
        source,
    })
}
