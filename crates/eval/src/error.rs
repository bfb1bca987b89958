//! Evaluation errors
//!
//! Errors raised while forcing a thunk. The force path restores the thunk
//! and propagates these; they are never absorbed into a hash or a cache
//! entry. Structural concerns during hashing (cycles, corrupt frames,
//! unfingerprinted paths) are not errors at all; they degrade the
//! portability tag instead.

use crate::pos::PosIdx;

/// An error raised during reduction.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    /// `throw` or `abort` was evaluated.
    Thrown { message: String, pos: PosIdx },
    /// An `assert` condition evaluated to false.
    AssertionFailed { pos: PosIdx },
    /// A value had the wrong type for the operation applied to it.
    TypeError { expected: &'static str, found: String, pos: PosIdx },
    /// A variable lookup found an unset environment slot.
    UndefinedVariable { name: String, pos: PosIdx },
    /// Attribute selection failed and no default was given.
    MissingAttribute { name: String, pos: PosIdx },
    /// A value depended on itself while being forced.
    InfiniteRecursion { pos: PosIdx },
    /// A function was applied to an argument set it cannot accept.
    BadApplication { message: String, pos: PosIdx },
    /// The global interrupt flag was set.
    Interrupted,
}

impl EvalError {
    pub fn pos(&self) -> PosIdx {
        match self {
            EvalError::Thrown { pos, .. }
            | EvalError::AssertionFailed { pos }
            | EvalError::TypeError { pos, .. }
            | EvalError::UndefinedVariable { pos, .. }
            | EvalError::MissingAttribute { pos, .. }
            | EvalError::InfiniteRecursion { pos }
            | EvalError::BadApplication { pos, .. } => *pos,
            EvalError::Interrupted => PosIdx::NONE,
        }
    }

    pub fn type_error(expected: &'static str, found: impl Into<String>, pos: PosIdx) -> Self {
        EvalError::TypeError {
            expected,
            found: found.into(),
            pos,
        }
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalError::Thrown { message, .. } => write!(f, "evaluation aborted: {}", message),
            EvalError::AssertionFailed { .. } => write!(f, "assertion failed"),
            EvalError::TypeError {
                expected, found, ..
            } => write!(f, "expected {} but found {}", expected, found),
            EvalError::UndefinedVariable { name, .. } => {
                write!(f, "undefined variable '{}'", name)
            }
            EvalError::MissingAttribute { name, .. } => {
                write!(f, "attribute '{}' missing", name)
            }
            EvalError::InfiniteRecursion { .. } => write!(f, "infinite recursion encountered"),
            EvalError::BadApplication { message, .. } => write!(f, "{}", message),
            EvalError::Interrupted => write!(f, "evaluation interrupted"),
        }
    }
}

impl std::error::Error for EvalError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mentions_variable_name() {
        let err = EvalError::UndefinedVariable {
            name: "foo".into(),
            pos: PosIdx::NONE,
        };
        assert!(err.to_string().contains("foo"));
    }
}
