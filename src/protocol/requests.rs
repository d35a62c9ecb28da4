//! Request payloads and their responses
//!
//! Each payload names its endpoint through [`ServerRequest`] so callers
//! cannot pair a request with the wrong response type.

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};

pub const CODE_CHECK: &str = "/codecheck";
pub const FILE_OPEN: &str = "/open";
pub const FILE_CLOSE: &str = "/close";
pub const UPDATE_BUFFER: &str = "/updatebuffer";

/// A request payload bound to its endpoint and response body
pub trait ServerRequest: Serialize + Send + Sync {
    const COMMAND: &'static str;
    type Response: DeserializeOwned + Send;
}

/// Diagnostics for one file, or the whole workspace when `file_name` is `None`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CodeCheckRequest {
    pub file_name: Option<String>,
}

impl CodeCheckRequest {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            file_name: Some(path.into()),
        }
    }

    pub fn workspace() -> Self {
        Self { file_name: None }
    }
}

impl ServerRequest for CodeCheckRequest {
    const COMMAND: &'static str = CODE_CHECK;
    type Response = QuickFixResponse;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct QuickFixResponse {
    pub quick_fixes: Vec<QuickFix>,
}

/// One diagnostic as the server reports it
///
/// Coordinates are zero-based; the client is launched that way and passes
/// them through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct QuickFix {
    pub file_name: String,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
    pub text: String,
    pub log_level: Option<String>,
    pub id: Option<String>,
    pub tags: Vec<String>,
    pub projects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileOpenRequest {
    pub file_name: String,
}

impl ServerRequest for FileOpenRequest {
    const COMMAND: &'static str = FILE_OPEN;
    type Response = IgnoredAny;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileCloseRequest {
    pub file_name: String,
}

impl ServerRequest for FileCloseRequest {
    const COMMAND: &'static str = FILE_CLOSE;
    type Response = IgnoredAny;
}

/// Replace the server's copy of a buffer with the editor's full text
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateBufferRequest {
    pub file_name: String,
    pub buffer: String,
    pub from_disk: bool,
}

impl ServerRequest for UpdateBufferRequest {
    const COMMAND: &'static str = UPDATE_BUFFER;
    type Response = IgnoredAny;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workspace_code_check_sends_null_file_name() {
        let value = serde_json::to_value(CodeCheckRequest::workspace()).unwrap();
        assert_eq!(value, json!({"FileName": null}));

        let value = serde_json::to_value(CodeCheckRequest::file("/w/a.cs")).unwrap();
        assert_eq!(value, json!({"FileName": "/w/a.cs"}));
    }

    #[test]
    fn test_quick_fix_response_tolerates_missing_fields() {
        let response: QuickFixResponse = serde_json::from_value(json!({
            "QuickFixes": [{
                "FileName": "/w/a.cs",
                "Line": 3, "Column": 4, "EndLine": 3, "EndColumn": 9,
                "Text": "The name 'x' does not exist in the current context",
                "LogLevel": "Error",
                "Id": "CS0103",
                "Projects": ["App"]
            }]
        }))
        .unwrap();

        let fix = &response.quick_fixes[0];
        assert_eq!(fix.id.as_deref(), Some("CS0103"));
        assert!(fix.tags.is_empty());
        assert_eq!(fix.end_column, 9);

        let empty: QuickFixResponse = serde_json::from_value(json!({})).unwrap();
        assert!(empty.quick_fixes.is_empty());
    }

    #[test]
    fn test_update_buffer_shape() {
        let value = serde_json::to_value(UpdateBufferRequest {
            file_name: "/w/a.cs".into(),
            buffer: "class A {}".into(),
            from_disk: false,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"FileName": "/w/a.cs", "Buffer": "class A {}", "FromDisk": false})
        );
    }
}
