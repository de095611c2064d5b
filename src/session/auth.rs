//! Credential prompt detection and one-shot secret injection.
//!
//! The injector observes every output chunk of a watched command. On the
//! first prompt match it writes the secret plus newline into the channel
//! after a short settle delay and marks itself consumed; a second prompt in
//! the same execution means the remote rejected the secret. It is re-armed
//! per top-level command, never mid-execution.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::channel::ChannelWriter;
use crate::error::SessionError;
use crate::session::ConnectionTarget;

/// Delay between seeing a prompt and answering it, so the write never races
/// a remote prompt that is still flushing.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(150);

/// A secret string with a redacted `Debug`; the backing buffer is zeroed
/// when the value is dropped.
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Clone for Secret {
    fn clone(&self) -> Self {
        Secret(self.0.clone())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        // NUL is valid UTF-8, so overwriting in place keeps the String sound.
        unsafe {
            for b in self.0.as_mut_vec().iter_mut() {
                *b = 0;
            }
        }
    }
}

/// External secret lookup. The engine never reads persistent storage.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn secret_for(&self, target: &ConnectionTarget) -> Option<String>;
}

/// Provider with no secrets; prompt matches become no-ops.
pub struct NoSecrets;

#[async_trait]
impl SecretProvider for NoSecrets {
    async fn secret_for(&self, _target: &ConnectionTarget) -> Option<String> {
        None
    }
}

/// A named prompt pattern. Anchored to the end of the chunk so ordinary
/// output mentioning the word "password" does not trigger a write.
pub struct PromptRule {
    pub name: &'static str,
    re: Regex,
}

impl PromptRule {
    pub fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            re: Regex::new(pattern).expect("invalid prompt pattern"),
        }
    }

    fn matches(&self, chunk: &str) -> bool {
        self.re.is_match(chunk)
    }
}

fn default_rules() -> Vec<PromptRule> {
    vec![
        PromptRule::new("password", r"(?i)password[^:\n]*:\s*$"),
        PromptRule::new("passphrase", r"(?i)passphrase[^:\n]*:\s*$"),
    ]
}

/// Per-execution authentication state.
pub struct CredentialInjector {
    secret: Option<Secret>,
    rules: Vec<PromptRule>,
    settle: Duration,
    consumed: bool,
    prompt_seen: bool,
    second_prompt: bool,
}

impl CredentialInjector {
    pub fn new(secret: Option<Secret>) -> Self {
        Self::with_rules(secret, default_rules(), DEFAULT_SETTLE)
    }

    pub fn with_rules(secret: Option<Secret>, rules: Vec<PromptRule>, settle: Duration) -> Self {
        Self {
            secret,
            rules,
            settle,
            consumed: false,
            prompt_seen: false,
            second_prompt: false,
        }
    }

    /// Injector that never matches; used for the quick path.
    pub fn disarmed() -> Self {
        Self::with_rules(None, Vec::new(), DEFAULT_SETTLE)
    }

    /// Re-arm for a new top-level command.
    pub fn rearm(&mut self) {
        self.consumed = false;
        self.prompt_seen = false;
        self.second_prompt = false;
    }

    /// A prompt was matched but either no secret exists or the injected one
    /// was rejected (second prompt).
    pub fn auth_failed(&self) -> bool {
        self.rejected() || self.unanswered()
    }

    /// The remote prompted again after the secret was injected.
    pub fn rejected(&self) -> bool {
        self.second_prompt
    }

    /// A prompt was seen with no secret configured to answer it.
    pub fn unanswered(&self) -> bool {
        self.prompt_seen && self.secret.is_none()
    }

    pub fn prompt_seen(&self) -> bool {
        self.prompt_seen
    }

    /// Inspect one output chunk; answer the first prompt, record the rest.
    pub async fn observe(
        &mut self,
        chunk: &str,
        writer: &ChannelWriter,
    ) -> Result<(), SessionError> {
        let trimmed = chunk.trim_end_matches([' ', '\u{a0}']);
        let Some(rule) = self.rules.iter().find(|r| r.matches(trimmed)) else {
            return Ok(());
        };

        if self.consumed {
            log::debug!("second {} prompt after injection", rule.name);
            self.prompt_seen = true;
            self.second_prompt = true;
            return Ok(());
        }

        self.prompt_seen = true;
        let Some(secret) = &self.secret else {
            // Absence of a credential is not an error at this layer.
            return Ok(());
        };

        log::debug!("answering {} prompt", rule.name);
        tokio::time::sleep(self.settle).await;
        let mut line = secret.expose().as_bytes().to_vec();
        line.push(b'\n');
        writer.write(&line).await?;
        self.consumed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_writer() -> (ChannelWriter, mpsc::Receiver<Vec<u8>>) {
        crate::channel::ChannelWriter::for_tests()
    }

    fn fast(secret: Option<Secret>) -> CredentialInjector {
        CredentialInjector::with_rules(secret, super::default_rules(), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_injects_once_per_execution() {
        let (writer, mut rx) = test_writer();
        let mut inj = fast(Some(Secret::new("s3cret")));

        inj.observe("Password:", &writer).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"s3cret\n");

        inj.observe("Password:", &writer).await.unwrap();
        assert!(rx.try_recv().is_err(), "second prompt must not re-inject");
        assert!(inj.auth_failed());
    }

    #[tokio::test]
    async fn test_case_insensitive_and_passphrase() {
        let (writer, mut rx) = test_writer();
        let mut inj = fast(Some(Secret::new("k")));
        inj.observe("Enter PASSPHRASE for key: ", &writer).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"k\n");
    }

    #[tokio::test]
    async fn test_no_secret_is_noop_but_recorded() {
        let (writer, mut rx) = test_writer();
        let mut inj = fast(None);
        inj.observe("Password:", &writer).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(inj.prompt_seen());
        assert!(inj.auth_failed());
    }

    #[tokio::test]
    async fn test_mid_output_mention_does_not_match() {
        let (writer, mut rx) = test_writer();
        let mut inj = fast(Some(Secret::new("x")));
        inj.observe("password: rotation completed\n", &writer)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert!(!inj.prompt_seen());
    }

    #[tokio::test]
    async fn test_rearm_allows_new_injection() {
        let (writer, mut rx) = test_writer();
        let mut inj = fast(Some(Secret::new("pw")));
        inj.observe("Password:", &writer).await.unwrap();
        rx.try_recv().unwrap();

        inj.rearm();
        inj.observe("Password:", &writer).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"pw\n");
        assert!(!inj.auth_failed());
    }

    #[test]
    fn test_secret_debug_redacted() {
        let s = Secret::new("topsecret");
        assert_eq!(format!("{s:?}"), "Secret(***)");
    }
}
