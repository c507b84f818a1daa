use std::fmt;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

/// Structured error information extracted from a server reply document.
///
/// Legacy servers report failures in several shapes: `$err` on a failed
/// query, `errmsg` on a failed command and `err` on `getlasterror`. This
/// type folds them into one serialisable value for logging and the CLI.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerErrorInfo {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub(crate) error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) message: Option<String>,
}

impl ServerErrorInfo {
    /// Extract error info from a QueryFailure reply document (`$err`).
    pub fn from_query_failure(doc: &Document) -> Self {
        Self::extract(doc, "mongo.query_failure", &["$err", "errmsg"])
    }

    /// Extract error info from a command reply with `ok: 0`.
    pub fn from_command_reply(doc: &Document) -> Self {
        Self::extract(doc, "mongo.command_error", &["errmsg", "$err"])
    }

    /// Extract error info from a `getlasterror` reply whose `err` is set.
    pub fn from_last_error(doc: &Document) -> Self {
        Self::extract(doc, "mongo.write_error", &["err", "errmsg"])
    }

    /// Server error code, if the reply carried one.
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// Human-readable message, if the reply carried one.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Convert error info to compact JSON string (single line).
    pub fn to_json_compact(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn extract(doc: &Document, error_type: &str, message_keys: &[&str]) -> Self {
        let message = message_keys
            .iter()
            .find_map(|key| match doc.get(*key) {
                Some(Bson::String(msg)) => Some(msg.clone()),
                _ => None,
            });

        let code = match doc.get("code") {
            Some(Bson::Int32(c)) => Some(*c),
            Some(Bson::Int64(c)) => i32::try_from(*c).ok(),
            Some(Bson::Double(c)) => Some(*c as i32),
            _ => None,
        };

        Self {
            error_type: Some(error_type.to_string()),
            code,
            name: code.and_then(get_error_name),
            message,
        }
    }
}

impl fmt::Display for ServerErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message.as_deref().unwrap_or("unknown server error");
        match (self.code, &self.name) {
            (Some(code), Some(name)) => write!(f, "{message} ({name}, code {code})"),
            (Some(code), None) => write!(f, "{message} (code {code})"),
            _ => write!(f, "{message}"),
        }
    }
}

/// Get a human-readable error name from a MongoDB error code.
fn get_error_name(code: i32) -> Option<String> {
    let name = match code {
        11000 | 11001 => "DuplicateKey",
        13 => "Unauthorized",
        26 => "NamespaceNotFound",
        43 => "CursorNotFound",
        50 => "MaxTimeMSExpired",
        59 => "CommandNotFound",
        _ => return None,
    };

    Some(name.to_string())
}
