//! Two-way binding between a text widget and the replicated document.
//!
//! ```text
//! widget change event ──► on_local_change() ──► clamp ──► minimal edit
//!                                                          │
//!                                              Document::apply_local_edit
//!                                                          │
//!                                                       Update ──► transport
//!
//! transport ──► Document::merge_remote ──► AppliedDelta ──► apply_remote()
//!                                                          │
//!                                       EchoGuard held, edits replayed last-first
//!                                                          │
//!                                                caret/selection remapped
//! ```
//!
//! The widget adapter shares the [`EchoGuard`] and must drop change events
//! while it is set; the binding drops them too in case the adapter forwards
//! them anyway.

use log::{debug, trace};
use quill_core::{
    diff_texts, minimal_edit, position_at, AppliedDelta, CursorPosition, Document, TextEdit,
    Update,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::awareness::Selection;

/// Outbound half of the widget adapter.
pub trait EditorWidget {
    /// Replace `edit.deleted` chars at `edit.offset` with `edit.inserted`.
    fn apply_edit(&mut self, edit: &TextEdit);

    fn set_remote_cursor(&mut self, client_id: Uuid, position: CursorPosition, color: &str, label: &str);

    fn clear_remote_cursor(&mut self, client_id: Uuid);

    /// Move the local caret/selection, in char offsets.
    fn set_local_selection(&mut self, anchor: usize, head: usize);
}

/// Flag raised while remote edits are replayed into the widget.
#[derive(Debug, Clone, Default)]
pub struct EchoGuard(Arc<AtomicBool>);

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_applying_remote(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Raise the flag until the returned scope is dropped.
    pub fn enter(&self) -> EchoScope<'_> {
        self.0.store(true, Ordering::Release);
        EchoScope(self)
    }
}

pub struct EchoScope<'a>(&'a EchoGuard);

impl Drop for EchoScope<'_> {
    fn drop(&mut self) {
        self.0 .0.store(false, Ordering::Release);
    }
}

/// Keeps a widget's text equal to the document text.
pub struct EditorBinding<W: EditorWidget> {
    widget: W,
    guard: EchoGuard,
    anchor: usize,
    head: usize,
}

impl<W: EditorWidget> EditorBinding<W> {
    pub fn new(widget: W) -> Self {
        Self::with_guard(widget, EchoGuard::new())
    }

    /// Bind with a guard already shared with the widget adapter.
    pub fn with_guard(widget: W, guard: EchoGuard) -> Self {
        Self {
            widget,
            guard,
            anchor: 0,
            head: 0,
        }
    }

    pub fn echo_guard(&self) -> EchoGuard {
        self.guard.clone()
    }

    pub fn widget(&self) -> &W {
        &self.widget
    }

    pub fn widget_mut(&mut self) -> &mut W {
        &mut self.widget
    }

    /// Local selection as `(anchor, head)` char offsets.
    pub fn selection(&self) -> (usize, usize) {
        (self.anchor, self.head)
    }

    /// Load the full document text into an empty widget.
    pub fn load(&mut self, doc: &Document) {
        let text = doc.text();
        if text.is_empty() {
            return;
        }
        let _scope = self.guard.enter();
        self.widget.apply_edit(&TextEdit::insert(0, text));
    }

    /// Handle a widget change event.
    ///
    /// Returns the update to broadcast, or `None` for echoes of remote edits
    /// and edits that change nothing.
    pub fn on_local_change(
        &mut self,
        doc: &mut Document,
        offset: usize,
        deleted: usize,
        inserted: &str,
    ) -> Option<Update> {
        if self.guard.is_applying_remote() {
            trace!("Dropping widget echo at {}", offset);
            return None;
        }

        let len = doc.len();
        let clamped_offset = offset.min(len);
        let clamped_deleted = deleted.min(len - clamped_offset);
        if clamped_offset != offset || clamped_deleted != deleted {
            debug!(
                "Clamped out-of-range edit ({}, {}) to ({}, {}) for length {}",
                offset, deleted, clamped_offset, clamped_deleted, len
            );
        }

        let replaced: String = doc
            .text()
            .chars()
            .skip(clamped_offset)
            .take(clamped_deleted)
            .collect();
        let edit = minimal_edit(clamped_offset, &replaced, inserted);
        self.commit(doc, edit)
    }

    /// Handle a widget that only reports its full new text.
    pub fn on_text_replaced(&mut self, doc: &mut Document, new_text: &str) -> Option<Update> {
        if self.guard.is_applying_remote() {
            return None;
        }
        let edit = diff_texts(&doc.text(), new_text);
        self.commit(doc, edit)
    }

    fn commit(&mut self, doc: &mut Document, edit: TextEdit) -> Option<Update> {
        if edit.is_noop() {
            return None;
        }
        match doc.apply_local_edit(&edit) {
            Ok(update) => {
                trace!(
                    "Local edit at {}: -{} +{}",
                    edit.offset,
                    edit.deleted,
                    edit.inserted_len()
                );
                self.anchor = follow_local_edit(self.anchor, &edit);
                self.head = follow_local_edit(self.head, &edit);
                Some(update)
            }
            Err(e) => {
                debug!("Discarding local edit: {}", e);
                None
            }
        }
    }

    /// Replay a merge result into the widget and keep the caret in place.
    pub fn apply_remote(&mut self, delta: &AppliedDelta) {
        if delta.is_empty() {
            return;
        }
        {
            let _scope = self.guard.enter();
            for edit in delta.in_apply_order() {
                self.widget.apply_edit(edit);
            }
        }
        self.anchor = delta.remap_offset(self.anchor);
        self.head = delta.remap_offset(self.head);
        self.widget.set_local_selection(self.anchor, self.head);
    }

    /// Record a caret move. Returns its line/column for awareness.
    pub fn cursor_moved(&mut self, doc: &Document, offset: usize) -> CursorPosition {
        let offset = offset.min(doc.len());
        self.anchor = offset;
        self.head = offset;
        position_at(&doc.text(), offset)
    }

    /// Record a selection change. Returns it in line/column form.
    pub fn selection_changed(&mut self, doc: &Document, anchor: usize, head: usize) -> Selection {
        let len = doc.len();
        self.anchor = anchor.min(len);
        self.head = head.min(len);
        let text = doc.text();
        Selection::new(position_at(&text, self.anchor), position_at(&text, self.head))
    }
}

/// Where a caret ends up after the local user made `edit`. A caret at or
/// inside the edit lands after the inserted text.
fn follow_local_edit(offset: usize, edit: &TextEdit) -> usize {
    if offset < edit.offset {
        offset
    } else if offset < edit.offset + edit.deleted || offset == edit.offset {
        edit.offset + edit.inserted_len()
    } else {
        offset + edit.inserted_len() - edit.deleted
    }
}

// ───────────────────────────────────────────────────────────────────
// Headless widget
// ───────────────────────────────────────────────────────────────────

/// A remote cursor as drawn by [`HeadlessWidget`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCursor {
    pub position: CursorPosition,
    pub color: String,
    pub label: String,
}

#[derive(Debug, Default)]
struct HeadlessState {
    text: String,
    cursors: std::collections::HashMap<Uuid, RenderedCursor>,
    selection: (usize, usize),
    edits_applied: usize,
}

/// In-memory widget for hosts without a UI and for tests.
///
/// Clones share the same buffer, so a host can keep one clone for reading
/// while the session owns the other.
#[derive(Debug, Clone, Default)]
pub struct HeadlessWidget {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessWidget {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HeadlessState) -> R) -> R {
        // A poisoned lock still holds consistent text; keep serving it.
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn text(&self) -> String {
        self.with_state(|s| s.text.clone())
    }

    pub fn cursors(&self) -> std::collections::HashMap<Uuid, RenderedCursor> {
        self.with_state(|s| s.cursors.clone())
    }

    pub fn selection(&self) -> (usize, usize) {
        self.with_state(|s| s.selection)
    }

    /// Number of edits replayed into the buffer.
    pub fn edits_applied(&self) -> usize {
        self.with_state(|s| s.edits_applied)
    }

    /// Change the buffer the way a user keystroke would. The host still
    /// reports the change to the session.
    pub fn type_text(&self, offset: usize, deleted: usize, inserted: &str) {
        let edit = TextEdit::new(offset, deleted, inserted);
        self.with_state(|s| s.text = edit.apply_to(&s.text));
    }
}

impl EditorWidget for HeadlessWidget {
    fn apply_edit(&mut self, edit: &TextEdit) {
        self.with_state(|s| {
            s.text = edit.apply_to(&s.text);
            s.edits_applied += 1;
        });
    }

    fn set_remote_cursor(&mut self, client_id: Uuid, position: CursorPosition, color: &str, label: &str) {
        self.with_state(|s| {
            s.cursors.insert(
                client_id,
                RenderedCursor {
                    position,
                    color: color.to_string(),
                    label: label.to_string(),
                },
            );
        });
    }

    fn clear_remote_cursor(&mut self, client_id: Uuid) {
        self.with_state(|s| {
            s.cursors.remove(&client_id);
        });
    }

    fn set_local_selection(&mut self, anchor: usize, head: usize) {
        self.with_state(|s| s.selection = (anchor, head));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Widget that re-emits every applied edit as a change event, the way
    /// naive editor components do.
    struct EchoingWidget {
        inner: HeadlessWidget,
        emitted: Vec<TextEdit>,
    }

    impl EditorWidget for EchoingWidget {
        fn apply_edit(&mut self, edit: &TextEdit) {
            self.inner.apply_edit(edit);
            self.emitted.push(edit.clone());
        }
        fn set_remote_cursor(&mut self, id: Uuid, p: CursorPosition, c: &str, l: &str) {
            self.inner.set_remote_cursor(id, p, c, l);
        }
        fn clear_remote_cursor(&mut self, id: Uuid) {
            self.inner.clear_remote_cursor(id);
        }
        fn set_local_selection(&mut self, anchor: usize, head: usize) {
            self.inner.set_local_selection(anchor, head);
        }
    }

    fn pair(text: &str) -> (Document, Document) {
        (
            Document::seeded(Uuid::from_u128(1), text),
            Document::seeded(Uuid::from_u128(2), text),
        )
    }

    #[test]
    fn test_local_change_produces_update() {
        let (mut local, mut remote) = pair("hello world");
        let widget = HeadlessWidget::new();
        let mut binding = EditorBinding::new(widget.clone());
        binding.load(&local);
        assert_eq!(widget.text(), "hello world");

        // Widget reports replacing "world" with "there".
        let update = binding.on_local_change(&mut local, 6, 5, "there").unwrap();
        assert_eq!(local.text(), "hello there");

        remote.merge_remote(&update);
        assert_eq!(remote.text(), "hello there");
    }

    #[test]
    fn test_replace_with_same_text_is_noop() {
        let (mut local, _) = pair("abc");
        let mut binding = EditorBinding::new(HeadlessWidget::new());
        assert!(binding.on_local_change(&mut local, 0, 3, "abc").is_none());
        assert_eq!(local.state_vector().get(&local.replica_id()), 0);
    }

    #[test]
    fn test_out_of_range_change_is_clamped() {
        let (mut local, _) = pair("abc");
        let mut binding = EditorBinding::new(HeadlessWidget::new());

        let update = binding.on_local_change(&mut local, 10, 4, "!");
        assert!(update.is_some());
        assert_eq!(local.text(), "abc!");

        binding.on_local_change(&mut local, 2, 100, "");
        assert_eq!(local.text(), "ab");
    }

    #[test]
    fn test_remote_edits_do_not_echo() {
        let (mut local, mut remote) = pair("abc");
        let mut binding = EditorBinding::new(EchoingWidget {
            inner: HeadlessWidget::new(),
            emitted: Vec::new(),
        });
        binding.load(&local);

        let update = remote.apply_local_insert(1, "XY").unwrap();
        let delta = local.merge_remote(&update);

        let guard = binding.echo_guard();
        binding.apply_remote(&delta);
        assert!(!guard.is_applying_remote());

        // Feed the widget's emitted events back as if the adapter forwarded
        // them while the guard was held.
        let emitted = std::mem::take(&mut binding.widget_mut().emitted);
        let _scope = guard.enter();
        for edit in emitted {
            assert!(binding
                .on_local_change(&mut local, edit.offset, edit.deleted, &edit.inserted)
                .is_none());
        }
        assert_eq!(local.text(), "aXYbc");
        assert_eq!(binding.widget().inner.text(), "aXYbc");
    }

    #[test]
    fn test_remote_delta_applied_in_descending_order() {
        let (mut local, mut remote) = pair("abcdef");
        let widget = HeadlessWidget::new();
        let mut binding = EditorBinding::new(widget.clone());
        binding.load(&local);

        let mut update = remote.apply_local_insert(1, "X").unwrap();
        update.extend(remote.apply_local_delete(4, 2).unwrap());
        let delta = local.merge_remote(&update);
        assert_eq!(delta.edits.len(), 2);

        binding.apply_remote(&delta);
        assert_eq!(widget.text(), local.text());
        assert_eq!(widget.text(), "aXbcf");
    }

    #[test]
    fn test_caret_remapped_through_remote_insert() {
        let (mut local, mut remote) = pair("hello world");
        let widget = HeadlessWidget::new();
        let mut binding = EditorBinding::new(widget.clone());
        binding.load(&local);
        binding.cursor_moved(&local, 8);

        let update = remote.apply_local_insert(0, ">> ").unwrap();
        let delta = local.merge_remote(&update);
        binding.apply_remote(&delta);

        assert_eq!(binding.selection(), (11, 11));
        assert_eq!(widget.selection(), (11, 11));
    }

    #[test]
    fn test_caret_follows_typing_before_remote_insert() {
        let (mut local, mut remote) = pair("hello");
        let widget = HeadlessWidget::new();
        let mut binding = EditorBinding::new(widget.clone());
        binding.load(&local);
        binding.cursor_moved(&local, 5);

        widget.type_text(5, 0, " world");
        binding.on_local_change(&mut local, 5, 0, " world").unwrap();
        assert_eq!(binding.selection(), (11, 11));

        let update = remote.apply_local_insert(0, ">> ").unwrap();
        let delta = local.merge_remote(&update);
        binding.apply_remote(&delta);

        assert_eq!(widget.text(), ">> hello world");
        assert_eq!(widget.selection(), (14, 14));
    }

    #[test]
    fn test_selection_follows_local_delete() {
        let (mut local, _) = pair("abcdefgh");
        let mut binding = EditorBinding::new(HeadlessWidget::new());
        binding.selection_changed(&local, 1, 7);

        // Delete "cde": the anchor stays, the head shifts left.
        binding.on_local_change(&mut local, 2, 3, "").unwrap();
        assert_eq!(binding.selection(), (1, 4));
    }

    #[test]
    fn test_text_replaced_uses_minimal_diff() {
        let (mut local, mut remote) = pair("let x = 1;");
        let mut binding = EditorBinding::new(HeadlessWidget::new());

        let update = binding.on_text_replaced(&mut local, "let xy = 1;").unwrap();
        assert_eq!(update.ops.len(), 1);
        remote.merge_remote(&update);
        assert_eq!(remote.text(), "let xy = 1;");
    }

    #[test]
    fn test_cursor_and_selection_positions() {
        let (local, _) = pair("line one\nline two\n");
        let mut binding = EditorBinding::new(HeadlessWidget::new());

        assert_eq!(binding.cursor_moved(&local, 14), CursorPosition::new(1, 5));
        let selection = binding.selection_changed(&local, 0, 999);
        assert_eq!(selection.start, CursorPosition::new(0, 0));
        assert_eq!(selection.end, CursorPosition::new(2, 0));
    }
}
