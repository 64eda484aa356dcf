//! The producer position: the WAL append cursor.

use std::fmt;

/// A position in the rotating WAL: file index plus byte offset within that
/// file.
///
/// Positions compare lexicographically, so for any two positions produced by
/// successful appends on the same node, "later" means "greater".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    /// Index of the log file.
    pub file_index: u32,
    /// Byte offset within that file.
    pub offset: u64,
}

impl Position {
    /// The start of the first log file.
    pub const ZERO: Position = Position {
        file_index: 0,
        offset: 0,
    };

    /// Creates a position.
    #[must_use]
    pub fn new(file_index: u32, offset: u64) -> Self {
        Self { file_index, offset }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_index, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_lexicographic() {
        assert!(Position::new(0, 500) < Position::new(1, 0));
        assert!(Position::new(1, 0) < Position::new(1, 1));
        assert!(Position::new(2, 0) > Position::new(1, u64::MAX));
        assert_eq!(Position::ZERO, Position::new(0, 0));
    }

    #[test]
    fn test_display() {
        assert_eq!(Position::new(7, 1024).to_string(), "7:1024");
    }
}
