//! Small helpers for building shell command lines that run inside the container.

use super::error::{Result, SandboxError};

/// Quote a string for POSIX `sh`. Plain words are left as they are.
pub fn shell_quote(s: &str) -> Result<String> {
    shlex::try_quote(s)
        .map(|quoted| quoted.into_owned())
        .map_err(|e| SandboxError::Configuration(format!("cannot quote {:?} for the shell: {}", s, e)))
}

/// Truncate `s` to at most `max_len` bytes on a char boundary, noting how much was cut.
pub fn truncate_output(s: &str, max_len: usize) -> String {
    truncate_output_after(s, max_len, 0)
}

/// Like [`truncate_output`], for output of which `dropped` bytes were already
/// discarded while it was captured.
pub fn truncate_output_after(s: &str, max_len: usize, dropped: usize) -> String {
    let mut end = s.len().min(max_len);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let cut = s.len() - end + dropped;
    if cut == 0 {
        return s.to_string();
    }
    format!("{}\n... [truncated {} bytes]", &s[..end], cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_leaves_plain_words() {
        assert_eq!(shell_quote("/workdir/project").unwrap(), "/workdir/project");
    }

    #[test]
    fn quoted_strings_split_back_to_themselves() {
        for s in ["a b", "it's", "$HOME `x`", "semi;colon && more"] {
            let quoted = shell_quote(s).unwrap();
            assert_eq!(shlex::split(&quoted).unwrap(), vec![s.to_string()]);
        }
        assert_eq!(shell_quote("").unwrap(), "''");
    }

    #[test]
    fn nul_cannot_be_quoted() {
        assert!(matches!(shell_quote("a\0b"), Err(SandboxError::Configuration(_))));
    }

    #[test]
    fn truncate_respects_char_boundary() {
        let s = "héllo";
        let t = truncate_output(s, 2);
        assert!(t.starts_with('h'));
        assert!(t.contains("truncated"));
        assert_eq!(truncate_output("short", 10), "short");
    }

    #[test]
    fn dropped_bytes_are_reported() {
        assert_eq!(truncate_output_after("abc", 3, 7), "abc\n... [truncated 7 bytes]");
        assert_eq!(truncate_output_after("abcdef", 3, 7), "abc\n... [truncated 10 bytes]");
    }
}
