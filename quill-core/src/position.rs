use serde::{Deserialize, Serialize};

/// Zero-based line and column, both counted in chars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Line/column of a char offset. Offsets past the end clamp to the end.
pub fn position_at(text: &str, offset: usize) -> CursorPosition {
    let mut line = 0u32;
    let mut column = 0u32;
    for ch in text.chars().take(offset) {
        if ch == '\n' {
            line += 1;
            column = 0;
        } else {
            column += 1;
        }
    }
    CursorPosition { line, column }
}

/// Char offset of a line/column. Columns past the end of a line clamp to the
/// line end; lines past the last line clamp to the end of the text.
pub fn offset_at(text: &str, position: CursorPosition) -> usize {
    let mut offset = 0usize;
    let mut line = 0u32;
    let mut column = 0u32;
    for ch in text.chars() {
        if line == position.line && (column == position.column || ch == '\n') {
            return offset;
        }
        if ch == '\n' {
            line += 1;
            column = 0;
        } else {
            column += 1;
        }
        offset += 1;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "fn main() {\n    let x = 1;\n}\n";

    #[test]
    fn test_position_at() {
        assert_eq!(position_at(TEXT, 0), CursorPosition::new(0, 0));
        assert_eq!(position_at(TEXT, 12), CursorPosition::new(1, 0));
        assert_eq!(position_at(TEXT, 16), CursorPosition::new(1, 4));
        assert_eq!(position_at(TEXT, 10_000), CursorPosition::new(3, 0));
    }

    #[test]
    fn test_offset_at_roundtrip() {
        for offset in 0..=TEXT.chars().count() {
            assert_eq!(offset_at(TEXT, position_at(TEXT, offset)), offset);
        }
    }

    #[test]
    fn test_offset_at_clamps() {
        // Column past the end of line 0 lands on its newline.
        assert_eq!(offset_at(TEXT, CursorPosition::new(0, 99)), 11);
        assert_eq!(offset_at(TEXT, CursorPosition::new(40, 0)), TEXT.chars().count());
    }

    #[test]
    fn test_position_counts_chars_not_bytes() {
        assert_eq!(position_at("ééé", 2), CursorPosition::new(0, 2));
    }
}
