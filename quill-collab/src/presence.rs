//! Presence rendering: remote cursors and the online-user list.
//!
//! [`PresenceSurface`] reads the [`AwarenessStore`] and pushes cursors to the
//! widget. It holds nothing but the ids it has drawn, so clearing cursors of
//! clients that left is a set difference.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::awareness::{AwarenessStore, Selection, UserInfo};
use crate::binding::EditorWidget;
use quill_core::CursorPosition;

/// Colours handed out to users that did not pick one.
pub const PALETTE: [&str; 8] = [
    "#e06c75", "#61afef", "#98c379", "#c678dd", "#e5c07b", "#56b6c2", "#d19a66", "#be5046",
];

/// RGB cursor colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl CursorColor {
    /// Stable palette colour for a user id.
    pub fn from_uuid(id: Uuid) -> Self {
        Self::parse_hex(palette_color(id)).unwrap_or_default()
    }

    /// Parse `#rrggbb`.
    pub fn parse_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#')?;
        if digits.len() != 6 {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(digits.get(i..i + 2)?, 16).ok();
        Some(Self {
            r: channel(0)?,
            g: channel(2)?,
            b: channel(4)?,
        })
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0x61, g: 0xaf, b: 0xef }
    }
}

/// Pick a palette entry for `user_id`. Same id, same colour.
pub fn palette_color(user_id: Uuid) -> &'static str {
    // FNV-1a over the id bytes spreads sequential ids across the palette.
    let hash = user_id
        .as_bytes()
        .iter()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
            (h ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
        });
    PALETTE[(hash % PALETTE.len() as u64) as usize]
}

/// Data needed to draw one remote cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorRenderData {
    pub client_id: Uuid,
    pub position: CursorPosition,
    pub color: String,
    pub label: String,
    pub selection: Option<Selection>,
}

/// Pure consumer of the awareness store.
#[derive(Debug, Default)]
pub struct PresenceSurface {
    rendered: HashSet<Uuid>,
}

impl PresenceSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote clients that currently publish a cursor.
    pub fn cursors(store: &AwarenessStore) -> Vec<CursorRenderData> {
        store
            .list()
            .into_iter()
            .filter_map(|entry| {
                let position = entry.fields.cursor?;
                Some(CursorRenderData {
                    client_id: entry.client_id,
                    position,
                    color: entry.fields.user.color,
                    label: entry.fields.user.display_name,
                    selection: entry.fields.selection,
                })
            })
            .collect()
    }

    /// Draw every remote cursor and clear those whose client went away.
    pub fn render<W: EditorWidget>(&mut self, store: &AwarenessStore, widget: &mut W) {
        let cursors = Self::cursors(store);
        let visible: HashSet<Uuid> = cursors.iter().map(|c| c.client_id).collect();

        for gone in self.rendered.difference(&visible) {
            widget.clear_remote_cursor(*gone);
        }
        for cursor in &cursors {
            widget.set_remote_cursor(cursor.client_id, cursor.position, &cursor.color, &cursor.label);
        }
        self.rendered = visible;
    }

    /// Remove every cursor this surface drew.
    pub fn clear<W: EditorWidget>(&mut self, widget: &mut W) {
        for id in self.rendered.drain() {
            widget.clear_remote_cursor(id);
        }
    }

    /// Online users for an avatar list: the local user first, then remote
    /// users by client id, one entry per user.
    pub fn online_users(store: &AwarenessStore) -> Vec<UserInfo> {
        let mut seen = HashSet::new();
        let local = store.local_fields().user.clone();
        seen.insert(local.id);

        let mut users = vec![local];
        for entry in store.list() {
            if seen.insert(entry.fields.user.id) {
                users.push(entry.fields.user);
            }
        }
        users
    }

    pub fn rendered_count(&self) -> usize {
        self.rendered.len()
    }
}
