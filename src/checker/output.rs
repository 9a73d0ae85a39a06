//! Captured container output handling.

/// Decode bytes lossily and drop control characters, keeping tabs and newlines.
pub fn sanitize(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| !c.is_control() || *c == '\t' || *c == '\n')
        .collect()
}

/// Stdout followed by stderr, both sanitized.
pub fn combine(stdout: &[u8], stderr: &[u8]) -> String {
    let mut out = sanitize(stdout);
    out.push_str(&sanitize(stderr));
    out
}

/// Join a previous failure's output with the output that recovered from it.
pub fn join_recovery(failure: &str, success: &str) -> String {
    if failure.is_empty() {
        return success.to_string();
    }
    let mut joined = String::with_capacity(failure.len() + success.len() + 1);
    joined.push_str(failure);
    if !failure.ends_with('\n') {
        joined.push('\n');
    }
    joined.push_str(success);
    joined
}
