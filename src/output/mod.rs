//! Terminal output scrubbing.
//!
//! Raw shell output arrives littered with escape sequences, banners, and
//! prompt echoes. [`OutputSanitizer`] removes them in two stages: control
//! sequences are dropped by running the text through the same `vte` grammar
//! a terminal emulator obeys (this is not an emulator — sequences are
//! parsed only to be discarded), and known noise lines are filtered by a
//! table of named, full-line-anchored regexes injected at construction.
//!
//! `sanitize` is pure and idempotent: `sanitize(sanitize(x)) == sanitize(x)`.

use regex::Regex;
use vte::{Params, Parser, Perform};

/// A named full-line noise pattern. Matching is anchored so legitimate
/// content that merely resembles a banner or prompt mid-line survives.
pub struct NoiseRule {
    pub name: &'static str,
    re: Regex,
}

impl NoiseRule {
    pub fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            // Patterns in the default table are static and known-good.
            re: Regex::new(pattern).expect("invalid noise pattern"),
        }
    }

    fn matches(&self, line: &str) -> bool {
        self.re.is_match(line)
    }
}

/// Two-stage scrubber: escape-grammar strip, then noise-line filter.
pub struct OutputSanitizer {
    rules: Vec<NoiseRule>,
}

impl OutputSanitizer {
    /// Sanitizer with the default noise table: login banners, `Last login`
    /// lines, echoed `ls` command lines, and `user@host …#`/`$` prompt
    /// lines.
    pub fn new() -> Self {
        Self::with_rules(vec![
            NoiseRule::new("welcome_banner", r"^Welcome to .*$"),
            NoiseRule::new("last_login", r"^Last login: .*$"),
            NoiseRule::new("echoed_ls", r"^ls(\s.*)?$"),
            NoiseRule::new("shell_prompt", r"^[A-Za-z0-9._-]+@[A-Za-z0-9._-]+[^\n]*[#$]\s*$"),
        ])
    }

    /// Sanitizer with a caller-supplied rule table.
    pub fn with_rules(rules: Vec<NoiseRule>) -> Self {
        Self { rules }
    }

    /// Strip control sequences and noise lines from one raw chunk.
    pub fn sanitize(&self, text: &str) -> String {
        let stripped = strip_controls(text);
        let mut kept: Vec<&str> = Vec::new();
        for line in stripped.lines() {
            if self.is_noise(line) {
                continue;
            }
            kept.push(line);
        }
        kept.join("\n")
    }

    fn is_noise(&self, line: &str) -> bool {
        self.rules.iter().any(|r| r.matches(line))
    }
}

impl Default for OutputSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove CSI/OSC/DCS escape sequences and bare ESC/BEL bytes, keeping
/// printed characters plus `\n`, `\t`, and `\r`.
pub fn strip_controls(text: &str) -> String {
    let mut parser = Parser::new();
    let mut performer = StripPerformer {
        out: String::with_capacity(text.len()),
    };
    parser.advance(&mut performer, text.as_bytes());
    performer.out
}

/// Performer that keeps printable content and drops every dispatch.
struct StripPerformer {
    out: String,
}

impl Perform for StripPerformer {
    fn print(&mut self, ch: char) {
        self.out.push(ch);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.out.push('\n'),
            b'\t' => self.out.push('\t'),
            b'\r' => self.out.push('\r'),
            // BEL, backspace, and the rest of C0 are dropped.
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}
    fn put(&mut self, _byte: u8) {}
    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}

    fn csi_dispatch(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_csi_color() {
        assert_eq!(strip_controls("\x1b[31mRed\x1b[0m Normal"), "Red Normal");
    }

    #[test]
    fn test_strip_csi_cursor_and_clear() {
        assert_eq!(strip_controls("Before\x1b[2JAfter"), "BeforeAfter");
        assert_eq!(strip_controls("Text\x1b[10;20HMoved"), "TextMoved");
    }

    #[test]
    fn test_strip_osc_bel_terminated() {
        assert_eq!(strip_controls("text\x1b]0;title\x07more"), "textmore");
    }

    #[test]
    fn test_strip_osc_st_terminated() {
        assert_eq!(strip_controls("text\x1b]8;;http://x\x1b\\more"), "textmore");
    }

    #[test]
    fn test_strip_bare_bel() {
        assert_eq!(strip_controls("ding\x07dong"), "dingdong");
    }

    #[test]
    fn test_keeps_newlines_and_tabs() {
        assert_eq!(strip_controls("a\n\tb\r\nc"), "a\n\tb\r\nc");
    }

    #[test]
    fn test_noise_banner_lines() {
        let s = OutputSanitizer::new();
        let raw = "Welcome to Ubuntu 22.04 LTS\nLast login: Mon Jan 1 00:00:00\nreal output\n";
        assert_eq!(s.sanitize(raw), "real output");
    }

    #[test]
    fn test_noise_prompt_line() {
        let s = OutputSanitizer::new();
        let raw = "alice@web01:~$ \ndata";
        assert_eq!(s.sanitize(raw), "data");
    }

    #[test]
    fn test_echoed_ls_line_dropped() {
        let s = OutputSanitizer::new();
        assert_eq!(s.sanitize("ls -1A /var\nfoo\nbar"), "foo\nbar");
    }

    #[test]
    fn test_literal_dollar_in_content_survives() {
        let s = OutputSanitizer::new();
        assert_eq!(s.sanitize("price is $5"), "price is $5");
        // 'ls' mid-line is not an echoed command line
        assert_eq!(s.sanitize("tools: ls, stat"), "tools: ls, stat");
    }

    #[test]
    fn test_idempotent() {
        let s = OutputSanitizer::new();
        let inputs = [
            "\x1b[31mRed\x1b[0m\nWelcome to nowhere\nalice@host # \nplain $text",
            "already clean\nlines only",
            "",
            "trailing\n",
        ];
        for raw in inputs {
            let once = s.sanitize(raw);
            assert_eq!(s.sanitize(&once), once, "not idempotent for {raw:?}");
        }
    }
}
