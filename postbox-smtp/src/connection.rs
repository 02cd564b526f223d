use std::fmt::Write;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ConnectionError, ConnectionResult};

const BUFFER_SIZE: usize = 8192;

/// A plaintext client connection with a read buffer, so that commands can
/// be taken a line at a time without a syscall per byte.
pub struct Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    stream: Stream,
    read_buf: Vec<u8>,
    /// Current position in read buffer
    read_pos: usize,
    /// Amount of valid data in read buffer
    read_len: usize,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub(crate) const fn new(stream: Stream) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
        }
    }

    /// Write `response` followed by CRLF.
    pub(crate) async fn send<S: core::fmt::Display + Send + Sync>(
        &mut self,
        response: &S,
    ) -> ConnectionResult<usize> {
        // Nearly every reply fits on the stack; replies echoing client
        // input may not.
        let mut buffer = arrayvec::ArrayString::<512>::new();
        if write!(&mut buffer, "{response}\r\n").is_ok() {
            self.stream.write_all(buffer.as_bytes()).await?;
            return Ok(buffer.len());
        }

        let mut owned = String::new();
        write!(&mut owned, "{response}\r\n")?;
        self.stream.write_all(owned.as_bytes()).await?;
        Ok(owned.len())
    }

    async fn fill(&mut self) -> ConnectionResult<usize> {
        if self.read_buf.is_empty() {
            self.read_buf.resize(BUFFER_SIZE, 0);
        }

        let bytes_read = self.stream.read(&mut self.read_buf).await?;
        self.read_pos = 0;
        self.read_len = bytes_read;
        Ok(bytes_read)
    }

    /// Read one line, without its line ending.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection. A final
    /// unterminated line is still returned. A line longer than `max` bytes is
    /// consumed and discarded, and reported as [`ConnectionError::LineTooLong`].
    pub(crate) async fn read_line(&mut self, max: usize) -> ConnectionResult<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let mut overflow = false;

        loop {
            if self.read_pos >= self.read_len && self.fill().await? == 0 {
                return match (overflow, line.is_empty()) {
                    (true, _) => Err(ConnectionError::LineTooLong(max)),
                    (false, true) => Ok(None),
                    (false, false) => Ok(Some(line)),
                };
            }

            let available = &self.read_buf[self.read_pos..self.read_len];

            if let Some(idx) = available.iter().position(|&b| b == b'\n') {
                self.read_pos += idx + 1;

                if overflow {
                    return Err(ConnectionError::LineTooLong(max));
                }

                line.extend_from_slice(&available[..idx]);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                if line.len() > max {
                    return Err(ConnectionError::LineTooLong(max));
                }

                return Ok(Some(line));
            }

            if !overflow {
                line.extend_from_slice(available);
                if line.len() > max.saturating_add(1) {
                    overflow = true;
                    line = Vec::new();
                }
            }
            self.read_pos = self.read_len;
        }
    }

    #[cfg(test)]
    pub(crate) fn get_ref(&self) -> &Stream {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn connection(input: &[u8]) -> Connection<Cursor<Vec<u8>>> {
        Connection::new(Cursor::new(input.to_vec()))
    }

    #[tokio::test]
    async fn reads_lines_and_strips_endings() {
        let mut conn = connection(b"EHLO a\r\nNOOP\nQUIT");

        assert_eq!(conn.read_line(512).await.unwrap(), Some(b"EHLO a".to_vec()));
        assert_eq!(conn.read_line(512).await.unwrap(), Some(b"NOOP".to_vec()));
        assert_eq!(conn.read_line(512).await.unwrap(), Some(b"QUIT".to_vec()));
        assert_eq!(conn.read_line(512).await.unwrap(), None);
    }

    #[tokio::test]
    async fn long_line_is_skipped() {
        let mut input = vec![b'a'; BUFFER_SIZE * 2];
        input.extend_from_slice(b"\r\nNOOP\r\n");
        let mut conn = connection(&input);

        assert!(matches!(
            conn.read_line(512).await,
            Err(ConnectionError::LineTooLong(512))
        ));
        assert_eq!(conn.read_line(512).await.unwrap(), Some(b"NOOP".to_vec()));
    }

    #[tokio::test]
    async fn send_appends_crlf() {
        let mut conn = Connection::new(Cursor::new(Vec::new()));
        conn.send(&"250 Ok").await.unwrap();
        conn.send(&"x".repeat(600)).await.unwrap();

        let written = conn.get_ref().get_ref();
        assert!(written.starts_with(b"250 Ok\r\n"));
        assert!(written.ends_with(b"x\r\n"));
        assert_eq!(written.len(), 8 + 602);
    }
}
