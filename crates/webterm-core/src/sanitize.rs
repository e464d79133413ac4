//! Output sanitizer.
//!
//! Strips a fixed denylist of terminal mode switches that the browser client
//! cannot render. Matching is exact and literal: no ANSI parsing is done, and
//! a sequence split across two PTY reads passes through unchanged.

/// Sequences removed from PTY output.
pub const DENYLIST: &[&[u8]] = &[
    b"\x1b[?2004h", // bracketed paste on
    b"\x1b[?2004l", // bracketed paste off
    b"\x1b[?1049h", // alternate screen on
    b"\x1b[?1049l", // alternate screen off
    b"\x1b[?1h",    // application cursor keys
    b"\x1b=",       // application keypad
    b"\x1b[?12h",   // cursor blink on
    b"\x1b[?12l",   // cursor blink off
];

/// Remove every denylisted sequence from `data`.
///
/// Removal repeats until nothing matches, so splicing out one sequence can
/// never leave a new one behind and `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize(data: &[u8]) -> Vec<u8> {
    let mut current = strip_once(data);
    loop {
        let next = strip_once(&current);
        if next.len() == current.len() {
            return current;
        }
        current = next;
    }
}

fn strip_once(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    'scan: while i < data.len() {
        if data[i] == 0x1b {
            for pattern in DENYLIST {
                if data[i..].starts_with(pattern) {
                    i += pattern.len();
                    continue 'scan;
                }
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}
