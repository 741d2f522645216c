use serde::Serialize;

/// Shared error type used across all coxswain crates.
///
/// Every variant halts the turn it occurs in (fail-fast). The only
/// locally-recovered conditions — embedding service unavailability and
/// workflow no-match — never surface as an `Error` at all.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("parse: {0}")]
    Parse(String),

    #[error("llm: {0}")]
    Llm(String),

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("permission: {0}")]
    Permission(String),

    #[error("config: {0}")]
    Config(String),

    #[error("schema {schema}: {message}")]
    Schema { schema: String, message: String },

    #[error("loop limit exceeded: {0}")]
    LoopLimit(String),

    #[error("document: {0}")]
    Document(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level error classification attached to failed responses and to
/// intervention log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ParseError,
    LlmError,
    ToolError,
    PermissionError,
    ConfigError,
    SchemaFailure,
    LoopLimitExceeded,
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ParseError => "parse_error",
            ErrorKind::LlmError => "llm_error",
            ErrorKind::ToolError => "tool_error",
            ErrorKind::PermissionError => "permission_error",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::SchemaFailure => "schema_failure",
            ErrorKind::LoopLimitExceeded => "loop_limit_exceeded",
            ErrorKind::UnknownError => "unknown_error",
        }
    }
}

impl Error {
    /// Map this error onto the wire taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Parse(_) | Error::Json(_) => ErrorKind::ParseError,
            Error::Llm(_) => ErrorKind::LlmError,
            Error::Tool { .. } => ErrorKind::ToolError,
            Error::Permission(_) => ErrorKind::PermissionError,
            Error::Config(_) => ErrorKind::ConfigError,
            Error::Schema { .. } => ErrorKind::SchemaFailure,
            Error::LoopLimit(_) => ErrorKind::LoopLimitExceeded,
            Error::Io(_) | Error::Document(_) | Error::Other(_) => ErrorKind::UnknownError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_covers_taxonomy() {
        assert_eq!(Error::Parse("x".into()).kind(), ErrorKind::ParseError);
        assert_eq!(Error::Llm("timeout".into()).kind(), ErrorKind::LlmError);
        assert_eq!(
            Error::Tool {
                tool: "internet.research".into(),
                message: "503".into()
            }
            .kind(),
            ErrorKind::ToolError
        );
        assert_eq!(
            Error::Permission("mode gate".into()).kind(),
            ErrorKind::PermissionError
        );
        assert_eq!(Error::Config("missing recipe".into()).kind(), ErrorKind::ConfigError);
        assert_eq!(
            Error::Schema {
                schema: "strategic_plan".into(),
                message: "empty".into()
            }
            .kind(),
            ErrorKind::SchemaFailure
        );
        assert_eq!(
            Error::LoopLimit("executor".into()).kind(),
            ErrorKind::LoopLimitExceeded
        );
        assert_eq!(Error::Other("??".into()).kind(), ErrorKind::UnknownError);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let s = serde_json::to_string(&ErrorKind::SchemaFailure).unwrap();
        assert_eq!(s, "\"schema_failure\"");
        assert_eq!(ErrorKind::LoopLimitExceeded.as_str(), "loop_limit_exceeded");
    }

    #[test]
    fn tool_error_display() {
        let e = Error::Tool {
            tool: "file.edit".into(),
            message: "requires code mode".into(),
        };
        assert_eq!(e.to_string(), "tool file.edit: requires code mode");
    }
}
