//! Hex dump formatting for packet logs.

use std::fmt::Write;

const BYTES_PER_LINE: usize = 16;

/// Format `bytes` as offset / hex / printable-ASCII lines.
///
/// ```text
/// 0000  1a 00 05 41 42                                   ...AB
/// ```
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4 + 8);
    for (line, chunk) in bytes.chunks(BYTES_PER_LINE).enumerate() {
        if line > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:04x} ", line * BYTES_PER_LINE);
        for i in 0..BYTES_PER_LINE {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, " {b:02x}");
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  ");
        out.extend(chunk.iter().map(|&b| {
            if (32..=126).contains(&b) {
                b as char
            } else {
                '.'
            }
        }));
    }
    out
}
