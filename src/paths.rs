//! Path pattern normalization and overlap detection for file reservations.
//!
//! Reservations store either literal paths or glob patterns. Two patterns
//! conflict when at least one concrete path is matched by both. The grammar
//! is deliberately small: `**` matches any number of path segments, a bare
//! `*` segment matches exactly one segment, and `*` inside a segment matches
//! any run of non-separator characters. Anything else is literal.

/// Normalize a path or pattern before storage and comparison: strip a
/// leading `./`, collapse repeated separators, and trim a trailing `/`.
pub fn normalize(path: &str) -> String {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);

    let mut out = String::with_capacity(trimmed.len());
    let mut last_was_sep = false;
    for ch in trimmed.chars() {
        if ch == '/' {
            if !last_was_sep {
                out.push('/');
            }
            last_was_sep = true;
        } else {
            out.push(ch);
            last_was_sep = false;
        }
    }

    while out.ends_with('/') && out.len() > 1 {
        out.pop();
    }
    out
}

/// True when some concrete path is matched by both patterns. Inputs are
/// expected to be normalized.
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let a_segments: Vec<&str> = a.split('/').filter(|s| !s.is_empty()).collect();
    let b_segments: Vec<&str> = b.split('/').filter(|s| !s.is_empty()).collect();
    segment_lists_overlap(&a_segments, &b_segments)
}

// Both matchers below fill an (|a|+1) x (|b|+1) reachability table instead
// of recursing: star-heavy patterns would otherwise backtrack exponentially,
// and these run while the reservation advisory lock is held.
fn segment_lists_overlap(a: &[&str], b: &[&str]) -> bool {
    let mut overlap = vec![vec![false; b.len() + 1]; a.len() + 1];
    overlap[a.len()][b.len()] = true;
    for i in (0..a.len()).rev() {
        overlap[i][b.len()] = a[i] == "**" && overlap[i + 1][b.len()];
    }
    for j in (0..b.len()).rev() {
        overlap[a.len()][j] = b[j] == "**" && overlap[a.len()][j + 1];
    }

    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            overlap[i][j] = if a[i] == "**" {
                // `**` covers zero segments, or swallows one of b's.
                overlap[i + 1][j] || overlap[i][j + 1]
            } else if b[j] == "**" {
                overlap[i][j + 1] || overlap[i + 1][j]
            } else {
                segments_intersect(a[i], b[j]) && overlap[i + 1][j + 1]
            };
        }
    }
    overlap[0][0]
}

/// Can two single-segment patterns (literals plus `*` wildcards) match the
/// same segment text?
fn segments_intersect(x: &str, y: &str) -> bool {
    let x_chars: Vec<char> = x.chars().collect();
    let y_chars: Vec<char> = y.chars().collect();
    chars_intersect(&x_chars, &y_chars)
}

fn chars_intersect(x: &[char], y: &[char]) -> bool {
    let mut overlap = vec![vec![false; y.len() + 1]; x.len() + 1];
    overlap[x.len()][y.len()] = true;
    for i in (0..x.len()).rev() {
        overlap[i][y.len()] = x[i] == '*' && overlap[i + 1][y.len()];
    }
    for j in (0..y.len()).rev() {
        overlap[x.len()][j] = y[j] == '*' && overlap[x.len()][j + 1];
    }

    for i in (0..x.len()).rev() {
        for j in (0..y.len()).rev() {
            overlap[i][j] = if x[i] == '*' {
                overlap[i + 1][j] || overlap[i][j + 1]
            } else if y[j] == '*' {
                overlap[i][j + 1] || overlap[i + 1][j]
            } else {
                x[i] == y[j] && overlap[i + 1][j + 1]
            };
        }
    }
    overlap[0][0]
}
