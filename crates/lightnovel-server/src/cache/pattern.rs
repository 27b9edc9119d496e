//! Redis-compatible glob matching.
//!
//! The local tier has to agree with `SCAN MATCH` about which keys a pattern
//! selects, so this follows Redis' `stringmatchlen` rules:
//!
//! | Token     | Matches                                   |
//! |-----------|-------------------------------------------|
//! | `*`       | any run of bytes, including none          |
//! | `?`       | exactly one byte                          |
//! | `[abc]`   | one byte from the set                     |
//! | `[^abc]`  | one byte not in the set                   |
//! | `[a-z]`   | one byte in the inclusive range           |
//! | `\x`      | the literal byte `x`                      |

/// Returns `true` when `text` matches the Redis glob `pattern`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    matches(pattern.as_bytes(), text.as_bytes())
}

/// Escape glob metacharacters so `raw` only matches itself.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn matches(mut pattern: &[u8], mut text: &[u8]) -> bool {
    // Resume point for the most recent `*`: the pattern after it and the
    // text it has not yet swallowed.
    let mut backtrack: Option<(&[u8], &[u8])> = None;

    loop {
        match pattern.first() {
            None if text.is_empty() => return true,
            Some(b'*') => {
                while pattern.first() == Some(&b'*') {
                    pattern = &pattern[1..];
                }
                if pattern.is_empty() {
                    return true;
                }
                backtrack = Some((pattern, text));
                continue;
            }
            Some(_) if !text.is_empty() => {
                if let Some(consumed) = match_token(pattern, text[0]) {
                    pattern = &pattern[consumed..];
                    text = &text[1..];
                    continue;
                }
            }
            _ => {}
        }

        match backtrack {
            Some((resume, swallowed)) if !swallowed.is_empty() => {
                let swallowed = &swallowed[1..];
                backtrack = Some((resume, swallowed));
                pattern = resume;
                text = swallowed;
            }
            _ => return false,
        }
    }
}

/// Match one pattern token against `byte`, returning how many pattern bytes
/// the token spans.
fn match_token(pattern: &[u8], byte: u8) -> Option<usize> {
    match pattern[0] {
        b'?' => Some(1),
        b'\\' if pattern.len() >= 2 => (pattern[1] == byte).then_some(2),
        b'[' => match_class(pattern, byte),
        literal => (literal == byte).then_some(1),
    }
}

fn match_class(pattern: &[u8], byte: u8) -> Option<usize> {
    let mut i = 1;
    let negate = pattern.get(1) == Some(&b'^');
    if negate {
        i += 1;
    }

    let mut hit = false;
    loop {
        match pattern.get(i) {
            // Unterminated class: Redis treats end of pattern as the close.
            None => break,
            Some(b']') => {
                i += 1;
                break;
            }
            Some(b'\\') if i + 1 < pattern.len() => {
                hit |= pattern[i + 1] == byte;
                i += 2;
            }
            Some(&lo) if pattern.get(i + 1) == Some(&b'-') && i + 2 < pattern.len() => {
                let hi = pattern[i + 2];
                let (lo, hi) = if lo > hi { (hi, lo) } else { (lo, hi) };
                hit |= (lo..=hi).contains(&byte);
                i += 3;
            }
            Some(&member) => {
                hit |= member == byte;
                i += 1;
            }
        }
    }

    (hit != negate).then_some(i)
}
