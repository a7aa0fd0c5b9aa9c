//! Textual file diffing.
//!
//! A pluggable primary differ runs first; any failure falls back to the
//! built-in Unicode-aware line differ. Edit ops count Unicode scalars so
//! downstream burndown accounting is encoding-independent.

use similar::{DiffOp, TextDiff};
use smallvec::SmallVec;

use crate::error::{EngineError, Result};
use crate::model::{EditOp, FileDiff};

/// Computes a [`FileDiff`] between two blob revisions.
pub trait Differ: Send + Sync {
    /// Diff `old` against `new`.
    fn diff(&self, old: &[u8], new: &[u8]) -> Result<FileDiff>;
}

/// Built-in line differ over Unicode scalar counts.
#[derive(Debug, Default)]
pub struct TextDiffer;

impl Differ for TextDiffer {
    fn diff(&self, old: &[u8], new: &[u8]) -> Result<FileDiff> {
        let old_text = std::str::from_utf8(old)
            .map_err(|e| EngineError::Other(format!("old blob is not valid UTF-8: {e}")))?;
        let new_text = std::str::from_utf8(new)
            .map_err(|e| EngineError::Other(format!("new blob is not valid UTF-8: {e}")))?;
        Ok(diff_text(old_text, new_text))
    }
}

/// Lossy fallback used when the primary differ rejects the input
/// (binary-looking content, invalid UTF-8).
#[derive(Debug, Default)]
pub struct LossyTextDiffer;

impl Differ for LossyTextDiffer {
    fn diff(&self, old: &[u8], new: &[u8]) -> Result<FileDiff> {
        let old_text = String::from_utf8_lossy(old);
        let new_text = String::from_utf8_lossy(new);
        Ok(diff_text(&old_text, &new_text))
    }
}

/// Primary-then-fallback composition.
pub struct DiffComputer {
    primary: Box<dyn Differ>,
    fallback: Box<dyn Differ>,
}

impl Default for DiffComputer {
    fn default() -> Self {
        Self {
            primary: Box::new(TextDiffer),
            fallback: Box::new(LossyTextDiffer),
        }
    }
}

impl DiffComputer {
    /// Install a custom primary differ (a native implementation, say),
    /// keeping the Unicode-aware fallback.
    pub fn with_primary(primary: Box<dyn Differ>) -> Self {
        Self {
            primary,
            fallback: Box::new(LossyTextDiffer),
        }
    }

    /// Diff with fallback-on-error semantics.
    pub fn compute(&self, old: &[u8], new: &[u8]) -> Result<FileDiff> {
        match self.primary.diff(old, new) {
            Ok(diff) => Ok(diff),
            Err(_) => self.fallback.diff(old, new),
        }
    }
}

fn diff_text(old: &str, new: &str) -> FileDiff {
    let diff = TextDiff::from_lines(old, new);
    let old_slices = diff.old_slices();
    let new_slices = diff.new_slices();

    let mut ops: SmallVec<[EditOp; 8]> = SmallVec::new();
    for op in diff.ops() {
        match op {
            DiffOp::Equal { old_index, len, .. } => {
                push_op(&mut ops, EditOp::Equal(scalar_count(old_slices, *old_index, *len)));
            }
            DiffOp::Delete {
                old_index, old_len, ..
            } => {
                push_op(
                    &mut ops,
                    EditOp::Delete(scalar_count(old_slices, *old_index, *old_len)),
                );
            }
            DiffOp::Insert {
                new_index, new_len, ..
            } => {
                push_op(
                    &mut ops,
                    EditOp::Insert(scalar_count(new_slices, *new_index, *new_len)),
                );
            }
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                push_op(
                    &mut ops,
                    EditOp::Delete(scalar_count(old_slices, *old_index, *old_len)),
                );
                push_op(
                    &mut ops,
                    EditOp::Insert(scalar_count(new_slices, *new_index, *new_len)),
                );
            }
        }
    }

    FileDiff {
        old_lines: old_slices.len(),
        new_lines: new_slices.len(),
        ops,
    }
}

fn scalar_count(slices: &[&str], index: usize, len: usize) -> usize {
    slices[index..index + len]
        .iter()
        .map(|line| line.chars().count())
        .sum()
}

fn push_op(ops: &mut SmallVec<[EditOp; 8]>, op: EditOp) {
    // Coalesce adjacent runs of the same tag.
    if let (Some(last), new_op) = (ops.last_mut(), op) {
        match (last, new_op) {
            (EditOp::Equal(n), EditOp::Equal(m)) => {
                *n += m;
                return;
            }
            (EditOp::Insert(n), EditOp::Insert(m)) => {
                *n += m;
                return;
            }
            (EditOp::Delete(n), EditOp::Delete(m)) => {
                *n += m;
                return;
            }
            _ => {}
        }
    }
    ops.push(op);
}
