//! Wire — line framing shared by the service protocols.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ServiceError;

/// Read one `\n`-terminated line of at most `max` bytes, terminator
/// stripped. `None` on clean EOF.
pub async fn read_line<R>(reader: &mut R, max: usize) -> Result<Option<String>, ServiceError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader).take(max as u64 + 1).read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        if n > max {
            return Err(ServiceError::Protocol(format!("line exceeds {} bytes", max)));
        }
        return Err(ServiceError::Protocol("connection closed mid-line".to_string()));
    }
    Ok(Some(line.trim_end().to_string()))
}

/// Like [`read_line`], but fails with [`ServiceError::Timeout`] after `wait`.
pub async fn read_line_within<R>(reader: &mut R, max: usize, wait: Duration) -> Result<Option<String>, ServiceError>
where
    R: AsyncBufRead + Unpin,
{
    tokio::time::timeout(wait, read_line(reader, max))
        .await
        .map_err(|_| ServiceError::Timeout(wait))?
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), ServiceError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_reads_lines_until_eof() {
        let mut reader = BufReader::new(&b"PUT 3\r\nGET abc\n"[..]);
        assert_eq!(read_line(&mut reader, 64).await.unwrap().as_deref(), Some("PUT 3"));
        assert_eq!(read_line(&mut reader, 64).await.unwrap().as_deref(), Some("GET abc"));
        assert_eq!(read_line(&mut reader, 64).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_limit_enforced() {
        let mut reader = BufReader::new(&b"0123456789\n"[..]);
        assert!(matches!(read_line(&mut reader, 4).await, Err(ServiceError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_line_is_an_error() {
        let mut reader = BufReader::new(&b"STATE {"[..]);
        assert!(read_line(&mut reader, 64).await.is_err());
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let (client, _server) = tokio::io::duplex(16);
        let mut reader = BufReader::new(client);
        let err = read_line_within(&mut reader, 64, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_write_line_appends_newline() {
        let mut out = Vec::new();
        write_line(&mut out, "OK abc").await.unwrap();
        assert_eq!(out, b"OK abc\n");
    }
}
