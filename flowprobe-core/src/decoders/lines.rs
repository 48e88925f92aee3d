//! CRLF line grammars shared by SMTP and FTP.
//!
//! Both parsers are fed one byte at a time so that a caller can change mode
//! between lines (SMTP switches to message data after `DATA`).

use crate::error::ProtocolError;

/// Longest command or response line accepted.
pub const MAX_LINE: usize = 4096;

/// Client command lines: text terminated by CR LF.
#[derive(Debug)]
pub struct CommandParser {
    protocol: &'static str,
    line: Vec<u8>,
    expect_lf: bool,
}

impl CommandParser {
    pub fn new(protocol: &'static str) -> Self {
        Self {
            protocol,
            line: Vec::new(),
            expect_lf: false,
        }
    }

    /// Feed one byte, returning a complete line (without CR LF) when one
    /// ends.
    pub fn push(&mut self, byte: u8) -> Result<Option<String>, ProtocolError> {
        if self.expect_lf {
            if byte != b'\n' {
                return Err(ProtocolError::violation(self.protocol, "expecting LF"));
            }
            self.expect_lf = false;
            let line = String::from_utf8_lossy(&self.line).into_owned();
            self.line.clear();
            return Ok(Some(line));
        }

        if byte == b'\r' {
            self.expect_lf = true;
        } else {
            if self.line.len() >= MAX_LINE {
                return Err(ProtocolError::violation(self.protocol, "command line too long"));
            }
            self.line.push(byte);
        }
        Ok(None)
    }
}

/// A complete server reply: one status code and one text entry per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub text: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyState {
    Status,
    Text,
    ExpectLf,
}

/// Server reply lines: `NNN text` ends a reply, `NNN-text` continues it.
/// Every line of a multi-line reply must carry the same code.
#[derive(Debug)]
pub struct ResponseParser {
    protocol: &'static str,
    state: ReplyState,
    code: Vec<u8>,
    text: Vec<u8>,
    more: bool,
    status: Option<u16>,
    lines: Vec<String>,
}

impl ResponseParser {
    pub fn new(protocol: &'static str) -> Self {
        Self {
            protocol,
            state: ReplyState::Status,
            code: Vec::with_capacity(3),
            text: Vec::new(),
            more: false,
            status: None,
            lines: Vec::new(),
        }
    }

    /// Feed one byte, returning a reply once its last line ends.
    pub fn push(&mut self, byte: u8) -> Result<Option<Reply>, ProtocolError> {
        match self.state {
            ReplyState::Status => {
                if byte == b' ' || byte == b'-' {
                    if self.code.len() != 3 {
                        return Err(ProtocolError::violation(self.protocol, "expected 3-digit status"));
                    }
                    self.more = byte == b'-';
                    self.state = ReplyState::Text;
                } else if self.code.len() == 3 {
                    return Err(ProtocolError::violation(self.protocol, "status code too long"));
                } else if !byte.is_ascii_digit() {
                    return Err(ProtocolError::violation(self.protocol, "status code not numeric"));
                } else {
                    self.code.push(byte);
                }
                Ok(None)
            }
            ReplyState::Text => {
                if byte == b'\r' {
                    self.state = ReplyState::ExpectLf;
                } else {
                    if self.text.len() >= MAX_LINE {
                        return Err(ProtocolError::violation(self.protocol, "reply line too long"));
                    }
                    self.text.push(byte);
                }
                Ok(None)
            }
            ReplyState::ExpectLf => {
                if byte != b'\n' {
                    return Err(ProtocolError::violation(self.protocol, "expecting LF"));
                }
                self.end_line()
            }
        }
    }

    fn end_line(&mut self) -> Result<Option<Reply>, ProtocolError> {
        // Three ASCII digits, so this cannot overflow.
        let code = self
            .code
            .iter()
            .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'));
        match self.status {
            Some(status) if status != code => {
                return Err(ProtocolError::violation(
                    self.protocol,
                    format!("status changed from {status} to {code} within a reply"),
                ));
            }
            _ => self.status = Some(code),
        }

        self.lines.push(String::from_utf8_lossy(&self.text).into_owned());
        self.code.clear();
        self.text.clear();
        self.state = ReplyState::Status;

        if self.more {
            return Ok(None);
        }
        self.status = None;
        Ok(Some(Reply {
            status: code,
            text: std::mem::take(&mut self.lines),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands(data: &[u8]) -> Result<Vec<String>, ProtocolError> {
        let mut parser = CommandParser::new("TEST");
        let mut out = Vec::new();
        for &b in data {
            if let Some(line) = parser.push(b)? {
                out.push(line);
            }
        }
        Ok(out)
    }

    fn replies(data: &[u8]) -> Result<Vec<Reply>, ProtocolError> {
        let mut parser = ResponseParser::new("TEST");
        let mut out = Vec::new();
        for &b in data {
            if let Some(reply) = parser.push(b)? {
                out.push(reply);
            }
        }
        Ok(out)
    }

    #[test]
    fn test_command_lines() {
        assert_eq!(
            commands(b"USER bob\r\nPASS x\r\nQUI").unwrap(),
            vec!["USER bob", "PASS x"]
        );
    }

    #[test]
    fn test_command_bare_cr_is_violation() {
        assert!(commands(b"NOOP\rX").is_err());
    }

    #[test]
    fn test_command_line_limit() {
        let long = vec![b'a'; MAX_LINE + 1];
        assert!(commands(&long).is_err());
    }

    #[test]
    fn test_single_and_multi_line_replies() {
        let out = replies(b"220 ready\r\n250-mail.example\r\n250-SIZE 100\r\n250 HELP\r\n").unwrap();
        assert_eq!(
            out,
            vec![
                Reply { status: 220, text: vec!["ready".into()] },
                Reply {
                    status: 250,
                    text: vec!["mail.example".into(), "SIZE 100".into(), "HELP".into()]
                },
            ]
        );
    }

    #[test]
    fn test_reply_violations() {
        assert!(replies(b"25 short\r\n").is_err());
        assert!(replies(b"2500 long\r\n").is_err());
        assert!(replies(b"2x0 bad\r\n").is_err());
        assert!(replies(b"250-a\r\n251 b\r\n").is_err());
        assert!(replies(b"250 a\rb").is_err());
    }
}
