//! DAP wire framing
//!
//! Every message is an HTTP-style header block followed by a JSON body:
//! ```text
//! Content-Length: <byte-length>\r\n
//! \r\n
//! <JSON body>
//! ```

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{Error, Result};

use super::types::ProtocolMessage;

/// Largest body accepted from an adapter
const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

/// Longest header line accepted, including the line ending
const MAX_HEADER_LINE: u64 = 8 * 1024;

fn closed(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            Error::SessionTerminated("adapter closed the connection".to_string())
        }
        io::ErrorKind::InvalidData => Error::DapProtocol(format!("Invalid frame: {}", e)),
        _ => Error::Io(e),
    }
}

/// Read one header line, refusing lines that never end
async fn read_header_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut raw = Vec::new();
    let bytes_read = (&mut *reader)
        .take(MAX_HEADER_LINE)
        .read_until(b'\n', &mut raw)
        .await
        .map_err(closed)?;

    if bytes_read == 0 {
        return Ok(None);
    }
    if !raw.ends_with(b"\n") && bytes_read as u64 == MAX_HEADER_LINE {
        return Err(Error::DapProtocol(format!(
            "Header line longer than {} bytes",
            MAX_HEADER_LINE
        )));
    }

    String::from_utf8(raw)
        .map(Some)
        .map_err(|_| Error::DapProtocol("Header is not valid UTF-8".to_string()))
}

/// Read one framed body from the stream
///
/// Unknown headers (such as Content-Type) are ignored. End of stream is
/// reported as `SessionTerminated`; bad framing as `DapProtocol`.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let Some(line) = read_header_line(reader).await? else {
            return Err(Error::SessionTerminated(
                "adapter closed the connection".to_string(),
            ));
        };

        // Blank line ends the header block; stray blank lines between
        // frames are skipped
        if line == "\r\n" || line == "\n" {
            if saw_header {
                break;
            }
            continue;
        }

        saw_header = true;
        if let Some(value) = line.trim().strip_prefix("Content-Length:") {
            content_length = Some(value.trim().parse().map_err(|_| {
                Error::DapProtocol(format!("Invalid Content-Length: {}", value.trim()))
            })?);
        }
    }

    let len = content_length
        .ok_or_else(|| Error::DapProtocol("Missing Content-Length header".to_string()))?;
    if len > MAX_CONTENT_LENGTH {
        return Err(Error::DapProtocol(format!(
            "Content-Length too large: {} bytes",
            len
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(closed)?;
    Ok(body)
}

/// Read and decode one protocol message
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ProtocolMessage> {
    let body = read_frame(reader).await?;
    tracing::trace!(message = %String::from_utf8_lossy(&body), "DAP <<<");
    serde_json::from_slice(&body)
        .map_err(|e| Error::DapProtocol(format!("Malformed message: {}", e)))
}

/// Write a JSON body with its Content-Length header
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> Result<()> {
    let header = format!("Content-Length: {}\r\n\r\n", json.len());

    writer.write_all(header.as_bytes()).await?;
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;

    Ok(())
}

/// Encode and write one protocol message
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ProtocolMessage,
) -> Result<()> {
    let json = serde_json::to_string(message)?;
    tracing::trace!(message = %json, "DAP >>>");
    write_frame(writer, &json).await
}
