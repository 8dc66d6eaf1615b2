//! Widget-facing text edits.
//!
//! All offsets are counted in chars. A [`TextEdit`] replaces
//! `deleted` chars starting at `offset` with `inserted`.

use serde::{Deserialize, Serialize};

/// A single replace span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    pub offset: usize,
    pub deleted: usize,
    pub inserted: String,
}

impl TextEdit {
    pub fn new(offset: usize, deleted: usize, inserted: impl Into<String>) -> Self {
        Self {
            offset,
            deleted,
            inserted: inserted.into(),
        }
    }

    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self::new(offset, 0, text)
    }

    pub fn delete(offset: usize, len: usize) -> Self {
        Self::new(offset, len, String::new())
    }

    /// Whether applying this edit leaves the text unchanged.
    pub fn is_noop(&self) -> bool {
        self.deleted == 0 && self.inserted.is_empty()
    }

    pub fn inserted_len(&self) -> usize {
        self.inserted.chars().count()
    }

    /// Apply to `text`. Offsets past the end are clamped.
    pub fn apply_to(&self, text: &str) -> String {
        let len = text.chars().count();
        let start = self.offset.min(len);
        let end = (self.offset + self.deleted).min(len);
        let mut out = String::with_capacity(text.len() + self.inserted.len());
        out.extend(text.chars().take(start));
        out.push_str(&self.inserted);
        out.extend(text.chars().skip(end));
        out
    }
}

/// The visible effect of a merge.
///
/// Edits are ascending and non-overlapping, expressed against the text as it
/// was before the merge. Replaying them last-to-first keeps earlier offsets
/// valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedDelta {
    pub edits: Vec<TextEdit>,
}

impl AppliedDelta {
    pub fn new(edits: Vec<TextEdit>) -> Self {
        Self { edits }
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Edits in the order a widget must apply them (descending offset).
    pub fn in_apply_order(&self) -> impl Iterator<Item = &TextEdit> {
        self.edits.iter().rev()
    }

    pub fn apply_to(&self, text: &str) -> String {
        self.in_apply_order()
            .fold(text.to_string(), |acc, edit| edit.apply_to(&acc))
    }

    /// Map a caret offset in the pre-merge text to the post-merge text.
    ///
    /// A caret sitting exactly at an edit offset stays before the inserted
    /// text. A caret inside a deleted range collapses to the edit offset.
    pub fn remap_offset(&self, offset: usize) -> usize {
        let mut shift: isize = 0;
        for edit in &self.edits {
            if offset <= edit.offset {
                break;
            }
            if offset < edit.offset + edit.deleted {
                return (edit.offset as isize + shift).max(0) as usize;
            }
            shift += edit.inserted_len() as isize - edit.deleted as isize;
        }
        (offset as isize + shift).max(0) as usize
    }
}

/// Reduce the replacement of `old` by `new` at `offset` to the smallest edit,
/// trimming the common prefix and suffix.
pub fn minimal_edit(offset: usize, old: &str, new: &str) -> TextEdit {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(new_chars.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
    let suffix = old_chars
        .iter()
        .rev()
        .zip(new_chars.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
    TextEdit {
        offset: offset + prefix,
        deleted: old_chars.len() - prefix - suffix,
        inserted,
    }
}

/// Minimal edit turning `old` into `new`.
pub fn diff_texts(old: &str, new: &str) -> TextEdit {
    minimal_edit(0, old, new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_edit_trims_prefix_and_suffix() {
        // Widget reports "hello world" -> "hello brave world" as a full replace.
        let edit = minimal_edit(0, "hello world", "hello brave world");
        assert_eq!(edit, TextEdit::insert(6, "brave "));
    }

    #[test]
    fn test_minimal_edit_replace_middle() {
        let edit = minimal_edit(10, "abcXYZdef", "abc123def");
        assert_eq!(edit, TextEdit::new(13, 3, "123"));
    }

    #[test]
    fn test_minimal_edit_identical_is_noop() {
        assert!(minimal_edit(4, "same", "same").is_noop());
    }

    #[test]
    fn test_minimal_edit_repeated_chars() {
        // "aaa" -> "aa": prefix eats two, suffix cannot overlap it.
        let edit = diff_texts("aaa", "aa");
        assert_eq!(edit, TextEdit::delete(2, 1));
        assert_eq!(edit.apply_to("aaa"), "aa");
    }

    #[test]
    fn test_minimal_edit_multibyte() {
        let edit = diff_texts("héllo", "hællo");
        assert_eq!(edit, TextEdit::new(1, 1, "æ"));
        assert_eq!(edit.apply_to("héllo"), "hællo");
    }

    #[test]
    fn test_applied_delta_descending_application() {
        let delta = AppliedDelta::new(vec![
            TextEdit::insert(1, "X"),
            TextEdit::delete(2, 1),
        ]);
        assert_eq!(delta.apply_to("abc"), "aXb");
    }

    #[test]
    fn test_remap_offset() {
        let delta = AppliedDelta::new(vec![
            TextEdit::insert(2, "XYZ"),
            TextEdit::delete(5, 2),
        ]);
        // Before any edit
        assert_eq!(delta.remap_offset(1), 1);
        // At an insertion point: stays put
        assert_eq!(delta.remap_offset(2), 2);
        // Between edits: shifted by the insert
        assert_eq!(delta.remap_offset(4), 7);
        // Inside the deleted range: collapses to its start
        assert_eq!(delta.remap_offset(6), 8);
        // After everything
        assert_eq!(delta.remap_offset(9), 10);
    }
}
