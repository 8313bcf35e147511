//! Errors raised while loading, parsing, and validating packages.

use std::fmt;

use memory::AllocationError;

/// Line/column position inside a text-format source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub filename: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.filename, self.line, self.column)
    }
}

/// A file could not be opened, read, mapped, or understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileError {
    pub path: String,
    pub message: String,
}

impl FileError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for FileError {}

/// The text-format lexer or parser rejected the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub position: Position,
    pub message: String,
}

impl ParseError {
    pub fn new(position: Position, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.position, self.message)
    }
}

impl std::error::Error for ParseError {}

/// The verifier rejected a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateError {
    pub filename: String,
    pub def_name: String,
    pub message: String,
}

impl ValidateError {
    pub fn new(def_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            filename: String::new(),
            def_name: def_name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.filename.is_empty() {
            write!(f, "{}: ", self.filename)?;
        }
        if !self.def_name.is_empty() {
            write!(f, "in {}: ", self.def_name)?;
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidateError {}

/// Any package-level failure.
#[derive(Debug)]
pub enum Error {
    File(FileError),
    Parse(ParseError),
    Validate(ValidateError),
    Alloc(AllocationError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::File(e) => e.fmt(f),
            Error::Parse(e) => e.fmt(f),
            Error::Validate(e) => e.fmt(f),
            Error::Alloc(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<FileError> for Error {
    fn from(e: FileError) -> Error {
        Error::File(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Error {
        Error::Parse(e)
    }
}

impl From<ValidateError> for Error {
    fn from(e: ValidateError) -> Error {
        Error::Validate(e)
    }
}

impl From<AllocationError> for Error {
    fn from(e: AllocationError) -> Error {
        Error::Alloc(e)
    }
}
