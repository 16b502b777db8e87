//! Shell-style matching of single file names.
//!
//! Supports `*` (any run of characters), `?` (exactly one character) and bracket sets
//! (`[abc]`, `[a-z]`, `[!abc]`). Path separators are not special: patterns are only ever
//! applied to a file name, never a full path.

/// Match `name` against `pattern`. The whole name must match.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = name.chars().collect();

    let mut p = 0;
    let mut t = 0;
    // Position of the last `*` seen and the text position it is currently absorbing up to
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pat.len() {
            match pat[p] {
                '*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, len)) = match_set(&pat[p..], text[t]) {
                        if matched {
                            p += len;
                            t += 1;
                            continue;
                        }
                    } else if text[t] == '[' {
                        // Unterminated set is a literal bracket
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => (),
            }
        }
        // Mismatch: let the last star absorb one more character, or fail
        match star {
            Some((star_p, star_t)) => {
                p = star_p + 1;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    pat[p..].iter().all(|c| *c == '*')
}

/// Evaluate a bracket set at the start of `pat` against `c`.
/// Returns `(matched, consumed)` or `None` when the set is never closed.
fn match_set(pat: &[char], c: char) -> Option<(bool, usize)> {
    let mut idx = 1;
    let negate = matches!(pat.get(idx), Some('!') | Some('^'));
    if negate {
        idx += 1;
    }
    let first = idx;
    let mut matched = false;
    loop {
        let current = *pat.get(idx)?;
        if current == ']' && idx > first {
            return Some((matched != negate, idx + 1));
        }
        if pat.get(idx + 1) == Some(&'-') && pat.get(idx + 2).is_some_and(|e| *e != ']') {
            let end = pat[idx + 2];
            if current <= c && c <= end {
                matched = true;
            }
            idx += 3;
        } else {
            if current == c {
                matched = true;
            }
            idx += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_and_suffix() {
        assert!(glob_match("*_gctf.log", "mic_001_gctf.log"));
        assert!(!glob_match("*_gctf.log", "mic_001_gctf.log.bak"));
        assert!(glob_match("**.mrc", "a.mrc"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn pattern_in_the_middle() {
        assert!(glob_match("*FoilHole*mrc", "grid1_FoilHole_22_aligned.mrc"));
        assert!(!glob_match("*FoilHole*mrc", "grid1_Atlas_22.mrc"));
        // The pattern token is an empty string when the user asked for everything
        assert!(glob_match("**mrc", "x.mrc"));
    }

    #[test]
    fn question_mark_and_sets() {
        assert!(glob_match("run1_it0??_model.star", "run1_it025_model.star"));
        assert!(!glob_match("run1_it0??_model.star", "run1_it25_model.star"));
        assert!(glob_match("gpu[0-3].log", "gpu2.log"));
        assert!(!glob_match("gpu[!0-3].log", "gpu2.log"));
        assert!(glob_match("a[bc]d", "acd"));
    }

    #[test]
    fn unterminated_set_is_literal() {
        assert!(glob_match("a[b", "a[b"));
        assert!(!glob_match("a[b", "ab"));
    }

    #[test]
    fn backtracking_star() {
        assert!(glob_match("*_DW.mrc", "x_DW_DW.mrc"));
        assert!(!glob_match("*_DW.mrc", "x_DW.mrcs"));
    }
}
