//! Newline-delimited serve loop.
//!
//! Each incoming line is one complete JSON request; each is answered
//! with exactly one JSON response line. Malformed lines are rejected
//! before dispatch with `INVALID_PARAMETERS`, and no request-level
//! error ever terminates the loop -- only EOF or transport failure
//! does.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::protocol::{error_codes, ToolRequest, ToolResponse};
use crate::tools::ToolDispatcher;

/// Serve requests from `reader`, writing responses to `writer`, until
/// the input stream ends.
pub async fn serve<R, W>(
    dispatcher: Arc<ToolDispatcher>,
    reader: R,
    mut writer: W,
) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ToolRequest>(line) {
            Ok(request) => dispatcher.dispatch(request).await,
            Err(e) => {
                tracing::debug!(error = %e, "malformed request line");
                ToolResponse::failure(
                    error_codes::INVALID_PARAMETERS,
                    format!("malformed request: {e}"),
                )
            }
        };

        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}
