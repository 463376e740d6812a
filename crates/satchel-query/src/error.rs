use std::fmt;

/// Query parse errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Malformed operator structure (unknown operator, wrong operand
    /// shape, misplaced control key).
    InvalidControl(String),
    /// The named operator requires an array operand.
    OperandNotArray(String),
    /// More than one `$elemMatch` along one field path.
    ElemMatchDuplicate,
    /// `$fields` mixes include and exclude entries.
    FieldsIncludeExcludeMix,
    /// `$do` action is not `$join` or `$slice`, or its operand is bad.
    InvalidDoAction(String),
    InvalidRegex(String),
    InvalidPath(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidControl(msg) => write!(f, "invalid query control: {msg}"),
            ParseError::OperandNotArray(op) => write!(f, "{op} operand must be an array"),
            ParseError::ElemMatchDuplicate => {
                write!(f, "only one $elemMatch allowed along a field path")
            }
            ParseError::FieldsIncludeExcludeMix => {
                write!(f, "$fields cannot mix include and exclude entries")
            }
            ParseError::InvalidDoAction(msg) => write!(f, "invalid $do action: {msg}"),
            ParseError::InvalidRegex(msg) => write!(f, "invalid regex: {msg}"),
            ParseError::InvalidPath(p) => write!(f, "invalid field path: {p}"),
        }
    }
}

impl std::error::Error for ParseError {}
