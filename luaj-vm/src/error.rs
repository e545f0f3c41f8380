//! Error taxonomy and wire status codes.
//!
//! The C-style protected-call boundary becomes plain `Result` propagation:
//! every compilation and interpretation step returns `Result<_, Error>` and
//! [`crate::state::State::pcall`] is the catch site.

use std::io;

use thiserror::Error;

/// Status codes of the embedding API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Success.
    Ok = 0,
    /// Reserved for coroutines; never produced.
    Yield = 1,
    /// A runtime error escaped to the protected boundary.
    RunErr = 2,
    /// Compilation failed.
    SyntaxErr = 3,
    /// An allocation failed.
    MemErr = 4,
    /// The error handler itself failed.
    ErrErr = 5,
}

impl Status {
    /// Numeric status code, usable as a process exit code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Whether the status represents success.
    pub const fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// Compilation errors, raised with chunk name, line and column.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxError {
    /// A token that cannot start or continue the current construct.
    #[error("unexpected symbol near '{0}'")]
    UnexpectedSymbol(String),
    /// A specific token was required.
    #[error("expected {expected}, found {found}")]
    Expected {
        /// Description of the required token.
        expected: String,
        /// Description of the token found instead.
        found: String,
    },
    /// The 256th local variable of a function.
    #[error("too many local variables in function")]
    TooManyLocals,
    /// The 65,537th constant of a function.
    #[error("too many constants in function")]
    TooManyConstants,
    /// A jump offset that does not fit the biased 24-bit field.
    #[error("control structure too long")]
    ControlStructureTooLong,
    /// `break` outside any loop.
    #[error("no loop to break")]
    NoLoopToBreak,
    /// A number literal followed by a stray symbol, or malformed.
    #[error("invalid symbol in number")]
    InvalidNumber,
    /// An unknown escape sequence in a string literal.
    #[error("invalid escape sequence")]
    InvalidEscape,
    /// A string literal interrupted by a newline or end of file.
    #[error("unterminated string")]
    UnterminatedString,
    /// A `--[[` comment without its closing `]]`.
    #[error("unterminated block comment")]
    UnterminatedBlockComment,
    /// A name that is neither a local in scope nor a builtin.
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    /// Assignment to something that is not a variable.
    #[error("cannot assign to this expression")]
    CannotAssign,
    /// An expression that needs more than 255 live slots.
    #[error("function too complex")]
    TooComplex,
}

/// Runtime errors, raised with chunk name and line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// Type mismatch in a binary arithmetic operation.
    #[error("attempt to {op} a {lhs} and {rhs} value")]
    BinaryType {
        /// Verb describing the operation ("add", "subtract", …).
        op: &'static str,
        /// Type name of the left operand.
        lhs: &'static str,
        /// Type name of the right operand.
        rhs: &'static str,
    },
    /// Negation of a non-number.
    #[error("attempt to negate a {0} value")]
    Negate(&'static str),
    /// Concatenation over a non-string.
    #[error("attempt to concatenate a {0} value")]
    Concat(&'static str),
    /// Ordered comparison between incompatible values.
    #[error("attempt to compare {0} with {1}")]
    Compare(&'static str, &'static str),
    /// Call of a value that is not a function.
    #[error("attempt to call a {0} value")]
    NotCallable(&'static str),
    /// `assert` received a false value.
    #[error("assertion failed!")]
    AssertionFailed,
}

/// Any error crossing the protected-call boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// Compilation failure, located at chunk, line and column.
    #[error("{chunk}:{line}:{col}: {kind}")]
    Syntax {
        /// Chunk the error was raised in.
        chunk: String,
        /// Source line.
        line: u32,
        /// Source column.
        col: u32,
        /// What went wrong.
        kind: SyntaxError,
    },
    /// Execution failure, located at chunk and line (column unknown).
    #[error("{chunk}:{line}: {kind}")]
    Runtime {
        /// Chunk of the function whose instruction failed.
        chunk: String,
        /// Source line looked up from the instruction's line info.
        line: u32,
        /// What went wrong.
        kind: RuntimeError,
    },
    /// An allocation failed.
    #[error("not enough memory")]
    Mem,
    /// The error handler installed by a protected call failed.
    #[error("error in error handling")]
    ErrErr,
    /// The byte source failed while reading a chunk.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<&Error> for Status {
    fn from(e: &Error) -> Status {
        match e {
            Error::Syntax { .. } => Status::SyntaxErr,
            Error::Runtime { .. } => Status::RunErr,
            Error::Mem => Status::MemErr,
            Error::ErrErr => Status::ErrErr,
            Error::Io(_) => Status::RunErr,
        }
    }
}
