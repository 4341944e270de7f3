/// Truncate `s` to at most `max_bytes`, never splitting a UTF-8 character.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// First chunk of an identifier, for use in directory and branch names.
pub fn short_id(id: &str) -> &str {
    id.split('-').next().unwrap_or(id)
}

/// Reduce free text to a git-branch-safe identifier: lowercase ASCII
/// alphanumerics with single dashes, at most 32 bytes.
pub fn sanitize_branch_id(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(32));
    let mut last_dash = true;
    for c in s.chars() {
        if out.len() >= 32 {
            break;
        }
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate_to_char_boundary(s, 2);
        assert_eq!(t, "h");
        assert!(truncate_to_char_boundary(s, 100).len() == s.len());
    }

    #[test]
    fn truncate_exact_fit_is_untouched() {
        assert_eq!(truncate_to_char_boundary("abc", 3), "abc");
    }

    #[test]
    fn short_id_takes_first_chunk() {
        assert_eq!(short_id("a1b2c3-d4e5"), "a1b2c3");
        assert_eq!(short_id("plain"), "plain");
    }

    #[test]
    fn sanitize_branch_id_collapses_runs() {
        assert_eq!(sanitize_branch_id("Fix: flaky  CI!!"), "fix-flaky-ci");
        assert_eq!(sanitize_branch_id("--weird--"), "weird");
    }

    #[test]
    fn sanitize_branch_id_caps_length() {
        let long = "x".repeat(100);
        assert!(sanitize_branch_id(&long).len() <= 32);
    }
}
