//! SMTP reply parsing.

use super::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u16,
    /// `false` for a `NNN-` continuation line
    pub is_last: bool,
    pub message: String,
}

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// All lines joined by newlines
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// A 3xx reply, such as `334` or `354`
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_temporary_error() || self.is_permanent_error()
    }

    /// Turn a 4xx/5xx reply into [`ClientError::SmtpError`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_error() {
            Err(ClientError::SmtpError {
                code: self.code,
                message: self.message(),
            })
        } else {
            Ok(self)
        }
    }

    /// Parses a single reply line, without its line ending.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the line doesn't match SMTP format.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let code_str = line
            .get(..3)
            .ok_or_else(|| ClientError::ParseError(format!("Response line too short: '{line}'")))?;
        let code = code_str
            .parse::<u16>()
            .map_err(|_| ClientError::ParseError(format!("Invalid status code: '{code_str}'")))?;

        let is_last = match line.as_bytes().get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(&c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{}'",
                    char::from(c)
                )));
            }
        };

        Ok(ResponseLine {
            code,
            is_last,
            message: line.get(4..).unwrap_or_default().to_string(),
        })
    }

    /// Parses a complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes it occupied, or `None` if
    /// more data is needed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut lines = Vec::new();
        let mut code = None;
        let mut consumed = 0;

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let text = std::str::from_utf8(raw)?.trim_end_matches('\r');
            if text.is_empty() {
                continue;
            }

            let line = Self::parse_line(text)?;
            match code {
                Some(expected) if expected != line.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {expected}, got {}",
                        line.code
                    )));
                }
                _ => code = Some(line.code),
            }

            lines.push(line.message);

            if line.is_last {
                return Ok(code.map(|code| (Self::new(code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_line() {
        assert_eq!(
            Response::parse_line("220 mail.example.com ESMTP").unwrap(),
            ResponseLine {
                code: 220,
                is_last: true,
                message: "mail.example.com ESMTP".to_string(),
            }
        );
        assert_eq!(Response::parse_line("334 ").unwrap().message, "");
        assert!(Response::parse_line("25").is_err());
        assert!(Response::parse_line("250_x").is_err());
    }

    #[test]
    fn parse_multi_line_response() {
        let data = b"250-mail.example.com\r\n250-SIZE 10000000\r\n250 HELP\r\nleftover";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(
            response.lines,
            vec!["mail.example.com", "SIZE 10000000", "HELP"]
        );
        assert_eq!(consumed, 51);
    }

    #[test]
    fn incomplete_response_needs_more() {
        assert!(
            Response::parse_response(b"250-mail.example.com\r\n250-SIZE")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn mismatched_codes_are_rejected() {
        assert!(Response::parse_response(b"250-a\r\n550 b\r\n").is_err());
    }

    #[test]
    fn error_replies_become_errors() {
        let err = Response::new(535, vec!["5.7.8 bad".to_string()])
            .into_result()
            .unwrap_err();
        assert_eq!(err.code(), Some(535));
        assert!(Response::new(334, Vec::new()).into_result().is_ok());
    }
}
