//! Prompt detection over a tool's terminal output.
//!
//! The wrapper feeds every PTY chunk through a [`ContentMatcher`]. Only the
//! last few non-empty lines are considered, after ANSI stripping. A prompt
//! match marks the worker as waiting; a later "resume" match (a line printed
//! after the prompt that shows the tool working again) clears it.

use std::time::{Duration, Instant};

use regex::Regex;

use crate::helpers::{floor_char_boundary, last_nonempty_lines, strip_ansi};

/// Number of trailing non-empty lines scanned.
pub const TAIL_LINES: usize = 10;
/// Minimum spacing between repeated prompt signals while already waiting.
pub const SIGNAL_COOLDOWN: Duration = Duration::from_secs(8);

const OUTPUT_BUFFER_MAX_BYTES: usize = 8_000;
const OUTPUT_BUFFER_KEEP_BYTES: usize = 4_000;

struct Pattern {
    label: &'static str,
    regex: Regex,
}

impl Pattern {
    fn new(label: &'static str, source: &str) -> Self {
        Self {
            label,
            regex: Regex::new(source).expect("hardcoded regex"),
        }
    }
}

/// (tool tag, label, regex). `None` applies to every tool.
const PROMPT_PATTERNS: &[(Option<&str>, &str, &str)] = &[
    (None, "yes_no_brackets", r"(?i)\[y/n\]"),
    (None, "yes_no_parens", r"(?i)\(y/n\)|\(yes/no\)"),
    (None, "press_enter", r"(?i)press enter to continue"),
    (None, "waiting_for_input", r"(?i)waiting for (?:your )?input"),
    (None, "proceed", r"(?i)do you want to proceed"),
    (None, "continue", r"(?i)\bcontinue\?\s*$"),
    (Some("claude"), "claude_allow", r"(?i)^\W*allow\b.*\?"),
    (
        Some("claude"),
        "claude_confirm",
        r"(?i)do you want to (?:make this edit|create|run|fetch|use)",
    ),
    (Some("codex"), "codex_allow_command", r"(?i)allow command\?"),
    (
        Some("codex"),
        "codex_approve",
        r"(?i)approve (?:this|the) (?:command|change|patch)",
    ),
    (Some("gemini"), "gemini_action_required", r"Action Required"),
    (Some("gemini"), "gemini_allow_once", r"(?i)allow once"),
    (Some("aider"), "aider_yes_no", r"(?i)\(Y\)es/\(N\)o"),
];

const RESUME_PATTERNS: &[(Option<&str>, &str, &str)] = &[
    (
        None,
        "activity_word",
        r"(?i)\b(?:running|applying|writing|thinking|working)\b",
    ),
    (
        Some("claude"),
        "claude_spinner",
        r"(?i)esc to interrupt|[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏✻✽✶✢]",
    ),
    (Some("codex"), "codex_interrupt", r"(?i)esc to interrupt"),
    (Some("gemini"), "gemini_generating", r"(?i)\bgenerating\b"),
];

fn compile(table: &[(Option<&str>, &'static str, &str)], tool: &str) -> Vec<Pattern> {
    table
        .iter()
        .filter(|(tag, _, _)| tag.map_or(true, |t| t == tool))
        .map(|(_, label, source)| Pattern::new(label, source))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSignal {
    NeedsInput { pattern: String, line: String },
    Resumed { pattern: String },
}

pub struct ContentMatcher {
    prompts: Vec<Pattern>,
    resumes: Vec<Pattern>,
    buffer: String,
    waiting: bool,
    last_signal_at: Option<Instant>,
    cooldown: Duration,
}

impl ContentMatcher {
    pub fn for_tool(tool: &str) -> Self {
        let tool = tool.trim().to_lowercase();
        Self {
            prompts: compile(PROMPT_PATTERNS, &tool),
            resumes: compile(RESUME_PATTERNS, &tool),
            buffer: String::new(),
            waiting: false,
            last_signal_at: None,
            cooldown: SIGNAL_COOLDOWN,
        }
    }

    #[cfg(test)]
    fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// Feed raw PTY output; returns the signal to report, if any.
    pub fn feed(&mut self, raw: &str, now: Instant) -> Option<ContentSignal> {
        self.buffer.push_str(&strip_ansi(raw));
        if self.buffer.len() > OUTPUT_BUFFER_MAX_BYTES {
            let start = floor_char_boundary(&self.buffer, self.buffer.len() - OUTPUT_BUFFER_KEEP_BYTES);
            self.buffer = self.buffer[start..].to_string();
        }
        let lines = last_nonempty_lines(&self.buffer, TAIL_LINES);
        self.evaluate(&lines, now)
    }

    /// Classify the given tail lines, oldest first.
    pub fn evaluate(&mut self, lines: &[String], now: Instant) -> Option<ContentSignal> {
        if let Some((label, index)) = self.find_prompt(lines) {
            let after = &lines[index + 1..];
            match self.find_resume(after) {
                Some(resume_label) if self.waiting => {
                    return Some(self.resume(resume_label, now));
                }
                Some(_) => return None,
                None => {}
            }

            let in_cooldown = self
                .last_signal_at
                .map(|t| now.saturating_duration_since(t) < self.cooldown)
                .unwrap_or(false);
            if self.waiting && in_cooldown {
                return None;
            }
            self.waiting = true;
            self.last_signal_at = Some(now);
            return Some(ContentSignal::NeedsInput {
                pattern: label.to_string(),
                line: lines[index].trim().to_string(),
            });
        }

        if self.waiting {
            if let Some(label) = self.find_resume(lines) {
                return Some(self.resume(label, now));
            }
        }
        None
    }

    fn resume(&mut self, label: &str, now: Instant) -> ContentSignal {
        self.waiting = false;
        self.last_signal_at = Some(now);
        ContentSignal::Resumed {
            pattern: label.to_string(),
        }
    }

    /// First pattern (in table order) that matches any line, with the newest
    /// matching line.
    fn find_prompt(&self, lines: &[String]) -> Option<(&'static str, usize)> {
        self.prompts.iter().find_map(|pattern| {
            lines
                .iter()
                .rposition(|line| pattern.regex.is_match(line))
                .map(|index| (pattern.label, index))
        })
    }

    fn find_resume(&self, lines: &[String]) -> Option<&'static str> {
        self.resumes
            .iter()
            .find(|pattern| lines.iter().any(|line| pattern.regex.is_match(line)))
            .map(|pattern| pattern.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_permission_prompt_matches() {
        let mut matcher = ContentMatcher::for_tool("claude");
        let signal = matcher.feed("Allow Bash(rm -rf)? (y/n)", Instant::now());
        assert!(matches!(signal, Some(ContentSignal::NeedsInput { .. })));
        assert!(matcher.is_waiting());
    }

    #[test]
    fn claude_allow_without_yes_no_uses_tool_pattern() {
        let mut matcher = ContentMatcher::for_tool("claude");
        match matcher.feed("│ Allow Write(src/main.rs)?\n", Instant::now()) {
            Some(ContentSignal::NeedsInput { pattern, .. }) => assert_eq!(pattern, "claude_allow"),
            other => panic!("expected prompt, got {other:?}"),
        }
        // The same text for another tool is not a prompt.
        let mut codex = ContentMatcher::for_tool("codex");
        assert_eq!(codex.feed("│ Allow Write(src/main.rs)?\n", Instant::now()), None);
    }

    #[test]
    fn plain_progress_does_not_match() {
        let mut matcher = ContentMatcher::for_tool("claude");
        assert_eq!(matcher.feed("Running tests...\n", Instant::now()), None);
        assert!(!matcher.is_waiting());
    }

    #[test]
    fn repeated_prompt_within_cooldown_is_suppressed() {
        let mut matcher = ContentMatcher::for_tool("claude");
        let start = Instant::now();
        assert!(matcher.feed("Allow Bash(rm -rf)? (y/n)\n", start).is_some());
        assert_eq!(
            matcher.feed("Allow Bash(rm -rf)? (y/n)\n", start + Duration::from_secs(2)),
            None
        );
    }

    #[test]
    fn prompt_refires_after_cooldown() {
        let mut matcher = ContentMatcher::for_tool("claude").with_cooldown(Duration::from_secs(1));
        let start = Instant::now();
        assert!(matcher.feed("Continue? [y/n]\n", start).is_some());
        assert!(matcher
            .feed("Continue? [y/n]\n", start + Duration::from_secs(2))
            .is_some());
    }

    #[test]
    fn resume_after_prompt_returns_to_running() {
        let mut matcher = ContentMatcher::for_tool("claude");
        let start = Instant::now();
        assert!(matcher.feed("Do you want to proceed? (y/n)\n", start).is_some());
        let signal = matcher.feed("y\nApplying patch to main.rs\n", start + Duration::from_secs(1));
        assert_eq!(
            signal,
            Some(ContentSignal::Resumed {
                pattern: "activity_word".into()
            })
        );
        assert!(!matcher.is_waiting());
        // Nothing new to report while the tool keeps working.
        assert_eq!(
            matcher.feed("Writing tests\n", start + Duration::from_secs(2)),
            None
        );
    }

    #[test]
    fn tool_specific_resume_pattern() {
        let mut matcher = ContentMatcher::for_tool("gemini");
        let start = Instant::now();
        assert!(matcher.feed("Action Required\n1. Allow once\n", start).is_some());
        assert!(matches!(
            matcher.feed("Generating response\n", start + Duration::from_secs(1)),
            Some(ContentSignal::Resumed { .. })
        ));
    }

    #[test]
    fn only_recent_lines_are_scanned() {
        let mut matcher = ContentMatcher::for_tool("codex");
        let mut text = String::from("Proceed? [y/n]\n");
        for i in 0..TAIL_LINES {
            text.push_str(&format!("output line {i}\n"));
        }
        assert_eq!(matcher.feed(&text, Instant::now()), None);
    }

    #[test]
    fn ansi_noise_is_ignored() {
        let mut matcher = ContentMatcher::for_tool("aider");
        let signal = matcher.feed("\x1b[1mApply edits? \x1b[33m(Y)es/(N)o\x1b[0m [Yes]: ", Instant::now());
        assert!(matches!(signal, Some(ContentSignal::NeedsInput { .. })));
    }
}
