//! The request/response shapes crossing the VM boundary.
//!
//! The VM sees a plain JSON `request` object; the host sees a
//! [`ScriptRequest`] built here from the raw HTTP pieces. Bodies are parsed
//! from JSON (bounded depth) or multipart; anything else passes through as
//! a raw string. Responses come back through the `respond` syscall as a
//! status, a JSON body value, and optional headers.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RuntimeError;

/// Reject JSON nested deeper than this.
pub const MAX_JSON_DEPTH: usize = 64;

/// One uploaded file from a multipart body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptFile {
    pub name: String,
    #[serde(rename = "type")]
    pub mime: String,
    pub size: u64,
    /// UTF-8 content, or base64 when the bytes are not valid UTF-8.
    pub data: String,
    /// `utf8` or `base64`.
    pub encoding: String,
}

/// What the VM receives as `request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub files: Vec<ScriptFile>,
}

/// What the VM produced via `respond` (or an early abort).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptResponse {
    pub status: u16,
    pub body: Value,
    pub headers: Vec<(String, String)>,
}

impl ScriptResponse {
    /// The response for a script that finished without calling `respond`.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            status: 204,
            body: Value::Null,
            headers: Vec::new(),
        }
    }
}

/// Depth of a JSON value (scalars are 1).
#[must_use]
pub fn json_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        _ => 1,
    }
}

/// Build the script request from raw HTTP pieces.
///
/// # Errors
///
/// Returns [`RuntimeError::BadRequest`] for malformed JSON, JSON nested
/// past [`MAX_JSON_DEPTH`], or an undecodable multipart body.
pub async fn build_request(
    method: &str,
    path: &str,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    content_type: Option<&str>,
    body: Vec<u8>,
) -> Result<ScriptRequest, RuntimeError> {
    let mut files = Vec::new();
    let parsed_body = match content_type {
        Some(ct) if ct.starts_with("application/json") => {
            if body.is_empty() {
                Value::Null
            } else {
                let value: Value =
                    serde_json::from_slice(&body).map_err(|e| RuntimeError::BadRequest {
                        reason: format!("malformed JSON body: {e}"),
                    })?;
                if json_depth(&value) > MAX_JSON_DEPTH {
                    return Err(RuntimeError::BadRequest {
                        reason: format!("JSON nested deeper than {MAX_JSON_DEPTH}"),
                    });
                }
                value
            }
        }
        Some(ct) if ct.starts_with("multipart/form-data") => {
            parse_multipart(ct, body, &mut files).await?
        }
        _ => {
            if body.is_empty() {
                Value::Null
            } else {
                Value::String(String::from_utf8_lossy(&body).into_owned())
            }
        }
    };

    Ok(ScriptRequest {
        method: method.to_owned(),
        path: path.to_owned(),
        query,
        headers,
        body: parsed_body,
        files,
    })
}

/// Parse a multipart body: text fields become the body object, file fields
/// land in `files`.
async fn parse_multipart(
    content_type: &str,
    body: Vec<u8>,
    files: &mut Vec<ScriptFile>,
) -> Result<Value, RuntimeError> {
    let boundary = multer::parse_boundary(content_type).map_err(|e| RuntimeError::BadRequest {
        reason: format!("bad multipart boundary: {e}"),
    })?;
    let stream = futures_util::stream::once(async move {
        Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from(body))
    });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = serde_json::Map::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RuntimeError::BadRequest {
            reason: format!("bad multipart body: {e}"),
        })?
    {
        let name = field.name().map(ToOwned::to_owned).unwrap_or_default();
        let file_name = field.file_name().map(ToOwned::to_owned);
        let mime = field
            .content_type()
            .map_or_else(|| "application/octet-stream".to_owned(), ToString::to_string);
        let bytes = field.bytes().await.map_err(|e| RuntimeError::BadRequest {
            reason: format!("bad multipart field: {e}"),
        })?;

        if let Some(file_name) = file_name {
            let (data, encoding) = match std::str::from_utf8(&bytes) {
                Ok(text) => (text.to_owned(), "utf8"),
                Err(_) => (BASE64.encode(&bytes), "base64"),
            };
            files.push(ScriptFile {
                name: if name.is_empty() { file_name } else { name },
                mime,
                size: bytes.len() as u64,
                data,
                encoding: encoding.to_owned(),
            });
        } else {
            fields.insert(
                name,
                Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            );
        }
    }
    Ok(Value::Object(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn json_body_is_parsed() {
        let req = build_request(
            "POST",
            "/api/note",
            HashMap::new(),
            no_headers(),
            Some("application/json"),
            br#"{"s": "cedar-blue-river", "text": "hi"}"#.to_vec(),
        )
        .await
        .unwrap();
        assert_eq!(req.body["s"], "cedar-blue-river");
        assert_eq!(req.body["text"], "hi");
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let err = build_request(
            "POST",
            "/",
            HashMap::new(),
            no_headers(),
            Some("application/json"),
            b"{not json".to_vec(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RuntimeError::BadRequest { .. }));
    }

    fn nested_json(depth: usize) -> Vec<u8> {
        let mut s = String::new();
        for _ in 0..depth {
            s.push('[');
        }
        s.push('1');
        for _ in 0..depth {
            s.push(']');
        }
        s.into_bytes()
    }

    #[tokio::test]
    async fn depth_64_passes_65_fails() {
        // depth counts the scalar too: 63 array levels + scalar = 64.
        let ok = build_request(
            "POST",
            "/",
            HashMap::new(),
            no_headers(),
            Some("application/json"),
            nested_json(63),
        )
        .await;
        assert!(ok.is_ok());

        let err = build_request(
            "POST",
            "/",
            HashMap::new(),
            no_headers(),
            Some("application/json"),
            nested_json(64),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RuntimeError::BadRequest { .. }));
    }

    #[tokio::test]
    async fn multipart_splits_fields_and_files() {
        let boundary = "XBOUND";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"title\"\r\n\r\n\
             hello\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             file-content\r\n\
             --{boundary}--\r\n"
        );

        let req = build_request(
            "POST",
            "/upload",
            HashMap::new(),
            no_headers(),
            Some(&format!("multipart/form-data; boundary={boundary}")),
            body.into_bytes(),
        )
        .await
        .unwrap();

        assert_eq!(req.body["title"], "hello");
        assert_eq!(req.files.len(), 1);
        assert_eq!(req.files[0].mime, "text/plain");
        assert_eq!(req.files[0].data, "file-content");
        assert_eq!(req.files[0].encoding, "utf8");
        assert_eq!(req.files[0].size, 12);
    }

    #[tokio::test]
    async fn other_bodies_pass_through_as_strings() {
        let req = build_request(
            "POST",
            "/",
            HashMap::new(),
            no_headers(),
            Some("text/plain"),
            b"plain".to_vec(),
        )
        .await
        .unwrap();
        assert_eq!(req.body, json!("plain"));
    }

    #[test]
    fn depth_of_scalars_and_nests() {
        assert_eq!(json_depth(&json!(1)), 1);
        assert_eq!(json_depth(&json!({"a": 1})), 2);
        assert_eq!(json_depth(&json!({"a": {"b": [1]}})), 4);
    }
}
