//! Board square validation for move submission.
//!
//! Squares are checked locally before any request reaches the authority. The
//! check is purely syntactic (`[a-h][1-8]`); move legality belongs to the
//! authority.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SquareRole, SyncError};

/// A syntactically valid board square, e.g. `e4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Square {
    file: u8,
    rank: u8,
}

impl Square {
    /// Parse `input` as the `role` half of a move. Surrounding whitespace and
    /// case are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidSquare`] carrying the untrimmed input.
    pub fn parse(input: &str, role: SquareRole) -> Result<Self> {
        let invalid = || SyncError::InvalidSquare {
            role,
            input: input.to_string(),
        };
        let normalized = input.trim().to_ascii_lowercase();
        let [file, rank] = normalized.as_bytes() else {
            return Err(invalid());
        };
        if !(b'a'..=b'h').contains(file) || !(b'1'..=b'8').contains(rank) {
            return Err(invalid());
        }
        Ok(Self {
            file: *file,
            rank: *rank,
        })
    }
}

impl FromStr for Square {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s, SquareRole::From)
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", char::from(self.file), char::from(self.rank))
    }
}

/// Validate both halves of a move.
///
/// # Errors
///
/// [`SyncError::MissingSquares`] if either input is blank, otherwise
/// [`SyncError::InvalidSquare`] for the first malformed square.
pub fn validate_move(from: &str, to: &str) -> Result<(Square, Square)> {
    if from.trim().is_empty() || to.trim().is_empty() {
        return Err(SyncError::MissingSquares);
    }
    let from = Square::parse(from, SquareRole::From)?;
    let to = Square::parse(to, SquareRole::To)?;
    Ok((from, to))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn accepts_e2_e4() {
        let (from, to) = validate_move("e2", "e4").unwrap();
        assert_eq!(from.to_string(), "e2");
        assert_eq!(to.to_string(), "e4");
    }

    #[test]
    fn normalizes_case_and_whitespace() {
        let (from, to) = validate_move(" E2 ", "H8").unwrap();
        assert_eq!(from.to_string(), "e2");
        assert_eq!(to.to_string(), "h8");
    }

    #[test]
    fn rejects_rank_out_of_range() {
        let err = validate_move("e9", "e4").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid from square: e9. Use format like \"e2\""
        );
    }

    #[test]
    fn rejects_file_out_of_range() {
        let err = validate_move("e2", "z2").unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidSquare {
                role: SquareRole::To,
                ref input,
            } if input == "z2"
        ));
        assert_eq!(err.to_string(), "Invalid to square: z2. Use format like \"e4\"");
    }

    #[test]
    fn rejects_single_character() {
        assert!(matches!(
            validate_move("a", "e4"),
            Err(SyncError::InvalidSquare {
                role: SquareRole::From,
                ..
            })
        ));
    }

    #[test]
    fn rejects_blank_input() {
        assert!(matches!(validate_move("", "e4"), Err(SyncError::MissingSquares)));
        assert!(matches!(validate_move("e2", "  "), Err(SyncError::MissingSquares)));
    }

    #[test]
    fn validation_errors_are_flagged() {
        assert!(validate_move("e0", "e4").unwrap_err().is_validation());
    }
}
