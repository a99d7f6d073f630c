//! Carving theorem text out of a source file by (line, column) position.
//!
//! Positions are 0-based; columns count characters, not bytes, and an end
//! position is exclusive in its column.

use std::path::Path;

use super::Position;
use crate::error::{CoqpoolError, Result};

const QED: &str = "Qed.";

/// Byte offset of `pos` in `text`.
///
/// A column equal to the line's length (the end of the line) is valid.
pub fn byte_offset(text: &str, pos: Position, path: &Path) -> Result<usize> {
    let out_of_bounds = || CoqpoolError::PositionOutOfBounds {
        path: path.to_path_buf(),
        line: pos.line,
        column: pos.column,
    };

    let mut line_start = 0;
    for (idx, line) in text.split('\n').enumerate() {
        if idx == pos.line {
            if pos.column == line.chars().count() {
                return Ok(line_start + line.len());
            }
            return line
                .char_indices()
                .nth(pos.column)
                .map(|(offset, _)| line_start + offset)
                .ok_or_else(out_of_bounds);
        }
        line_start += line.len() + 1;
    }
    Err(out_of_bounds())
}

/// Trim a proof attempt and drop one trailing `Qed.`. Whitespace before the
/// `Qed.` is kept.
pub fn strip_qed(proof: &str) -> &str {
    let trimmed = proof.trim();
    trimmed.strip_suffix(QED).unwrap_or(trimmed)
}

/// The file with the original proof replaced by `proof`, closed with `Qed.`.
pub fn splice_proof(text: &str, theorem_end: usize, proof_end: usize, proof: &str) -> String {
    let mut contents = String::with_capacity(text.len() + proof.len());
    contents.push_str(&text[..theorem_end]);
    contents.push('\n');
    contents.push_str(strip_qed(proof));
    contents.push('\n');
    contents.push_str(QED);
    contents.push('\n');
    contents.push_str(&text[proof_end..]);
    contents
}
