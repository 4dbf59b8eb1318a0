//! Relative-path sanitizer for the recording browser.
//!
//! Client-supplied browse paths are relative to a receiver-configured root.
//! The sanitizer cleans them POSIX-style and blocks anything that could
//! escape the root or smuggle markup into a path.

/// Unicode format (Cf) characters that must never appear in a browse path:
/// zero-width and BIDI controls, soft hyphen, BOM.
const FORMAT_CHARS: &[char] = &[
    '\u{00AD}', '\u{061C}', '\u{180E}', '\u{200B}', '\u{200C}', '\u{200D}', '\u{200E}',
    '\u{200F}', '\u{202A}', '\u{202B}', '\u{202C}', '\u{202D}', '\u{202E}', '\u{2060}',
    '\u{2061}', '\u{2062}', '\u{2063}', '\u{2064}', '\u{206A}', '\u{206B}', '\u{206C}',
    '\u{206D}', '\u{206E}', '\u{206F}', '\u{FEFF}',
];

/// Sanitize a client-supplied relative path.
///
/// Returns `(cleaned, blocked)`. When `blocked` is true the cleaned path is
/// empty and the input must not touch the filesystem. Inputs are blocked when
/// they contain control characters, `\`, `?`, `#`, Unicode format characters,
/// or a `..` segment that survives cleaning.
#[must_use]
pub fn sanitize_rel_path(input: &str) -> (String, bool) {
    if input
        .chars()
        .any(|c| c.is_control() || matches!(c, '\\' | '?' | '#') || FORMAT_CHARS.contains(&c))
    {
        return (String::new(), true);
    }

    let mut segments: Vec<&str> = Vec::new();
    for seg in input.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                // Popping past the root would escape it.
                if segments.pop().is_none() {
                    return (String::new(), true);
                }
            }
            other => segments.push(other),
        }
    }

    (segments.join("/"), false)
}
