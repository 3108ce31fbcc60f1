//! String helpers shared by the read and write cursors.

/// Truncate at the first `\n`, `\r` or `\0` and turn tabs into spaces.
///
/// Client-supplied text is run through this before it reaches game code.
pub fn remove_illegal_chars(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' | '\r' | '\0' => break,
            '\t' => out.push(' '),
            _ => out.push(c),
        }
    }
    out
}

/// Cut a decoded string at its first NUL.
pub fn truncate_at_nul(s: &str) -> &str {
    match s.find('\0') {
        Some(idx) => &s[..idx],
        None => s,
    }
}

/// ASCII byte for `c`; anything outside 7-bit ASCII becomes `?`.
#[inline]
pub fn ascii_byte(c: char) -> u8 {
    if c.is_ascii() {
        c as u8
    } else {
        b'?'
    }
}
