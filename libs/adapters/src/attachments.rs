//! Remote attachment retrieval with a scheme allow-list and bounded,
//! streaming buffering.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use courier_core::{Attachment, AttachmentSource, SendError};
use courier_translator::MimeAttachment;
use futures::StreamExt;
use tracing::debug;
use url::Url;

/// Hard cap on a single fetched attachment.
pub const MAX_REMOTE_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// An attachment with its content materialized as base64, ready for any
/// provider transport encoding.
#[derive(Debug, Clone)]
pub struct ResolvedAttachment {
    pub filename: String,
    pub content_type: String,
    pub content_b64: String,
    pub inline_cid: Option<String>,
}

impl From<ResolvedAttachment> for MimeAttachment {
    fn from(value: ResolvedAttachment) -> Self {
        MimeAttachment {
            filename: value.filename,
            content_type: value.content_type,
            content_b64: value.content_b64,
            inline_cid: value.inline_cid,
        }
    }
}

/// Validates a remote attachment reference before anything is dereferenced.
///
/// Anything that is not plain `http`/`https` (`file://`, bare local paths,
/// `ftp://`, `data:`) is a local, permanent failure: the check runs before
/// any connection is opened, so no network call is ever issued for a
/// disallowed source.
pub fn check_remote_source(raw: &str) -> Result<Url, SendError> {
    let url = Url::parse(raw)
        .map_err(|_| SendError::Security(format!("attachment source is not a URL: {raw}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(SendError::Security(format!(
            "attachment source scheme `{other}` is not allowed"
        ))),
    }
}

/// Resolves one attachment: inline content passes through, remote references
/// are checked, fetched and re-encoded.
pub async fn resolve_attachment(
    client: &reqwest::Client,
    attachment: &Attachment,
) -> Result<ResolvedAttachment, SendError> {
    let (content_b64, fetched_type) = match &attachment.source {
        AttachmentSource::Content(content) => (content.clone(), None),
        AttachmentSource::Url(raw) => {
            let url = check_remote_source(raw)?;
            let (bytes, content_type) = fetch_remote(client, url).await?;
            (B64.encode(bytes), content_type)
        }
    };
    Ok(ResolvedAttachment {
        filename: attachment.filename.clone(),
        content_type: attachment
            .content_type
            .clone()
            .or(fetched_type)
            .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string()),
        content_b64,
        inline_cid: attachment.inline_cid.clone(),
    })
}

async fn fetch_remote(
    client: &reqwest::Client,
    url: Url,
) -> Result<(Vec<u8>, Option<String>), SendError> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|err| SendError::Network(format!("fetch attachment {url}: {err}")))?;

    if !response.status().is_success() {
        return Err(SendError::Validation(format!(
            "attachment source {url} answered HTTP {}",
            response.status().as_u16()
        )));
    }
    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    // Stream with a hard cap instead of buffering whatever the remote sends.
    let mut buffer = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|err| SendError::Network(format!("read attachment {url}: {err}")))?;
        if buffer.len() + chunk.len() > MAX_REMOTE_ATTACHMENT_BYTES {
            return Err(SendError::Validation(format!(
                "attachment {url} exceeds {MAX_REMOTE_ATTACHMENT_BYTES} bytes"
            )));
        }
        buffer.extend_from_slice(&chunk);
    }
    debug!(url = %url, bytes = buffer.len(), "attachment fetched");
    Ok((buffer, content_type))
}
