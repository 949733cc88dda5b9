//! Binding to the external compositor that turns a render tree into pixels.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize, Serializer};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use htmlshot_core::{FontAsset, FontStyle, ImageFormat};

use crate::error::{CompositorError, FailureKind};
use crate::sanitize::RenderNode;

/// Everything the compositor needs for one attempt.
#[derive(Debug, Clone, Serialize)]
pub struct CompositeRequest {
    pub tree: RenderNode,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(serialize_with = "serialize_fonts")]
    pub fonts: Arc<Vec<FontAsset>>,
}

#[derive(Serialize)]
struct WireFont<'a> {
    name: &'a str,
    weight: u16,
    style: FontStyle,
    data: String,
}

fn serialize_fonts<S: Serializer>(fonts: &Arc<Vec<FontAsset>>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(fonts.iter().map(|font| WireFont {
        name: &font.family,
        weight: font.weight,
        style: font.style,
        data: STANDARD.encode(&font.data),
    }))
}

/// Renders a [`CompositeRequest`] to encoded image bytes.
#[async_trait]
pub trait Compositor: Send + Sync {
    async fn composite(&self, request: &CompositeRequest) -> Result<Vec<u8>, CompositorError>;
}

/// Typed failure a compositor may print to stderr.
#[derive(Debug, Deserialize)]
struct StderrFailure {
    #[serde(default)]
    kind: Option<FailureKind>,
    message: String,
}

/// Runs an external program per attempt: JSON request on stdin, image bytes
/// on stdout. Dropping the future kills the child.
#[derive(Debug, Clone)]
pub struct CommandCompositor {
    program: String,
    args: Vec<String>,
}

impl CommandCompositor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Compositor for CommandCompositor {
    async fn composite(&self, request: &CompositeRequest) -> Result<Vec<u8>, CompositorError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| CompositorError::new(FailureKind::Other, format!("encode request: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CompositorError::new(
                    FailureKind::Other,
                    format!("spawn {}: {}", self.program, e),
                )
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            CompositorError::new(FailureKind::Other, "compositor stdin unavailable")
        })?;
        let write = async move {
            let result = stdin.write_all(&payload).await;
            // Closing stdin signals end of request.
            drop(stdin);
            result
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output.map_err(|e| {
            CompositorError::new(FailureKind::Other, format!("wait for compositor: {}", e))
        })?;

        if !output.status.success() {
            return Err(parse_failure(&output.stderr, output.status.code()));
        }
        if let Err(e) = written {
            return Err(CompositorError::new(
                FailureKind::Other,
                format!("write request: {}", e),
            ));
        }
        if output.stdout.is_empty() {
            return Err(CompositorError::new(
                FailureKind::Other,
                "compositor produced no output",
            ));
        }
        Ok(output.stdout)
    }
}

/// Interpret compositor stderr. A JSON `{"kind", "message"}` object is
/// trusted as-is; anything else is classified by message.
pub fn parse_failure(stderr: &[u8], exit_code: Option<i32>) -> CompositorError {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();

    if let Ok(failure) = serde_json::from_str::<StderrFailure>(text) {
        return match failure.kind {
            Some(kind) => CompositorError::new(kind, failure.message),
            None => CompositorError::from_message(failure.message),
        };
    }

    if text.is_empty() {
        let message = match exit_code {
            Some(code) => format!("compositor exited with status {}", code),
            None => "compositor terminated by signal".to_string(),
        };
        return CompositorError::new(FailureKind::Other, message);
    }

    CompositorError::from_message(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::{sanitize, SanitizeMode};

    #[test]
    fn test_parse_failure_typed() {
        let err = parse_failure(br#"{"kind":"resource","message":"font 404"}"#, Some(1));
        assert_eq!(err.kind, FailureKind::Resource);
        assert_eq!(err.message, "font 404");
    }

    #[test]
    fn test_parse_failure_untyped_falls_back_to_heuristic() {
        let err = parse_failure(br#"{"message":"Unsupported style value"}"#, Some(1));
        assert_eq!(err.kind, FailureKind::Style);

        let err = parse_failure(b"invalid value for property display", Some(2));
        assert_eq!(err.kind, FailureKind::Style);

        let err = parse_failure(b"", Some(3));
        assert_eq!(err.kind, FailureKind::Other);
        assert!(err.message.contains('3'));
    }

    #[test]
    fn test_request_wire_format() -> Result<(), serde_json::Error> {
        let request = CompositeRequest {
            tree: sanitize("<div>x</div>", "", SanitizeMode::Standard).root,
            width: 100,
            height: 50,
            format: ImageFormat::Webp,
            quality: Some(80),
            fonts: Arc::new(vec![FontAsset {
                family: "Inter".to_string(),
                weight: 700,
                style: FontStyle::Normal,
                data: vec![1, 2, 3],
            }]),
        };
        let json = serde_json::to_value(&request)?;
        assert_eq!(json["format"], "webp");
        assert_eq!(json["tree"]["type"], "div");
        assert_eq!(json["fonts"][0]["name"], "Inter");
        assert_eq!(json["fonts"][0]["style"], "normal");
        assert_eq!(json["fonts"][0]["data"], "AQID");
        Ok(())
    }
}
