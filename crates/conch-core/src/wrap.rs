//! Width-aware wrapping of console lines.
//!
//! Splits a logical line into fragments that each fit the terminal width.
//! CSI sequences count as zero cells and are never split across fragments.
//! Breaks prefer a whitespace boundary near the right edge; the first
//! fragment protects a leading list marker ("• ", "- ", "* ", "N. ",
//! "N) ") so a bullet is never orphaned from its first words.

use crate::ansi::{self, Token};

/// Cells from the right edge within which a whitespace break is preferred.
const BOUNDARY_WINDOW: usize = 20;

/// Minimum content characters kept after a list marker before a break.
const MARKER_KEEP: usize = 3;

/// Wrap one logical line to `width` cells per fragment.
///
/// Continuation fragments have at most one leading space elided; apart
/// from that, concatenating the fragments restores the input.
pub fn wrap_line(line: &str, width: usize) -> Vec<String> {
    if width == 0 {
        return vec![line.to_string()];
    }
    if ansi::visual_width(line) <= width {
        return vec![line.to_string()];
    }

    let marker_guard = marker_guard_chars(line);
    let mut fragments = Vec::new();
    let mut rest = line;
    let mut first = true;

    while !rest.is_empty() {
        if !first {
            // Continuation fragments strip at most one leading space.
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
                if rest.is_empty() {
                    break;
                }
            }
        }

        if ansi::visual_width(rest) <= width {
            fragments.push(rest.to_string());
            break;
        }

        let guard = if first { marker_guard } else { 0 };
        let split = find_split(rest, width, guard);
        fragments.push(rest[..split].to_string());
        rest = &rest[split..];
        first = false;
    }

    if fragments.is_empty() {
        fragments.push(String::new());
    }
    fragments
}

/// Byte offset at which to split `rest` so the head fits in `width` cells.
///
/// Prefers the last whitespace boundary within [`BOUNDARY_WINDOW`] cells of
/// the edge, provided it lies past `guard` visible characters. Falls back
/// to the character boundary that still fits; if even the first token
/// overflows, advances one rune so progress is always made.
fn find_split(rest: &str, width: usize, guard: usize) -> usize {
    let mut cols = 0;
    let mut fit_end = 0;
    let mut last_space: Option<(usize, usize)> = None; // (byte idx, col of space)

    for (idx, token) in ansi::tokens(rest) {
        let w = token.width();
        let is_space = matches!(token, Token::Char(' '));
        if is_space && cols >= guard {
            // A space that itself overflows is still a boundary: the
            // fragment ends right before it.
            last_space = Some((idx, cols));
        }
        if cols + w > width {
            break;
        }
        cols += w;
        fit_end = idx + token.byte_len();
    }

    if let Some((space_idx, space_col)) = last_space {
        if space_idx > 0 && width.saturating_sub(space_col) <= BOUNDARY_WINDOW {
            return space_idx;
        }
    }

    if fit_end == 0 {
        // A single token wider than the line: advance one rune.
        return ansi::tokens(rest)
            .next()
            .map(|(_, t)| t.byte_len())
            .unwrap_or(rest.len());
    }
    fit_end
}

/// Characters that must stay together at the head of a list-marker line.
///
/// Returns 0 when the line carries no marker; otherwise the marker's
/// character count plus [`MARKER_KEEP`].
fn marker_guard_chars(line: &str) -> usize {
    let chars: Vec<char> = line.chars().take(12).collect();

    // "• ", "- ", "* "
    if chars.len() >= 2 && chars[1] == ' ' && matches!(chars[0], '•' | '-' | '*') {
        return 2 + MARKER_KEEP;
    }

    // "N. " / "N) " with one or more digits.
    let digits = chars.iter().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0
        && chars.len() > digits + 1
        && matches!(chars[digits], '.' | ')')
        && chars[digits + 1] == ' '
    {
        return digits + 2 + MARKER_KEEP;
    }

    0
}
