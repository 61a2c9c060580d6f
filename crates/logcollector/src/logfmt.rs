// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal logfmt decoder: `key=value key="quoted value" flag`.

use std::iter::Peekable;
use std::str::CharIndices;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogfmtError {
    UnexpectedChar { position: usize, found: char },
    UnterminatedQuote { position: usize },
}

/// Decodes `body` into key/value pairs in order of appearance.
///
/// Decoding stops at the first malformed pair; the pairs decoded up to that
/// point are returned together with the error. A key without `=` yields an
/// empty value.
pub fn decode(body: &str) -> (Vec<(String, String)>, Option<LogfmtError>) {
    let mut decoder = Decoder {
        body,
        chars: body.char_indices().peekable(),
    };
    let mut pairs = Vec::new();
    loop {
        match decoder.next_pair() {
            Ok(Some(pair)) => pairs.push(pair),
            Ok(None) => return (pairs, None),
            Err(e) => return (pairs, Some(e)),
        }
    }
}

struct Decoder<'a> {
    body: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl Decoder<'_> {
    fn skip_spaces(&mut self) {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    }

    fn next_pair(&mut self) -> Result<Option<(String, String)>, LogfmtError> {
        self.skip_spaces();
        let Some(&(start, first)) = self.chars.peek() else {
            return Ok(None);
        };
        if first == '=' || first == '"' {
            return Err(LogfmtError::UnexpectedChar {
                position: start,
                found: first,
            });
        }

        let mut end = start;
        while let Some((i, c)) = self.chars.next_if(|(_, c)| !c.is_whitespace() && *c != '=') {
            if c == '"' {
                return Err(LogfmtError::UnexpectedChar {
                    position: i,
                    found: c,
                });
            }
            end = i + c.len_utf8();
        }
        let key = self.body[start..end].to_string();

        if self.chars.next_if(|(_, c)| *c == '=').is_none() {
            return Ok(Some((key, String::new())));
        }

        let value = match self.chars.peek() {
            Some(&(position, '"')) => {
                self.chars.next();
                self.quoted(position)?
            }
            _ => self.bare()?,
        };
        Ok(Some((key, value)))
    }

    fn bare(&mut self) -> Result<String, LogfmtError> {
        let mut value = String::new();
        while let Some((i, c)) = self.chars.next_if(|(_, c)| !c.is_whitespace()) {
            if c == '=' || c == '"' {
                return Err(LogfmtError::UnexpectedChar {
                    position: i,
                    found: c,
                });
            }
            value.push(c);
        }
        Ok(value)
    }

    fn quoted(&mut self, open: usize) -> Result<String, LogfmtError> {
        let mut value = String::new();
        while let Some((_, c)) = self.chars.next() {
            match c {
                '"' => return Ok(value),
                '\\' => match self.chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, escaped)) => value.push(escaped),
                    None => break,
                },
                c => value.push(c),
            }
        }
        Err(LogfmtError::UnterminatedQuote { position: open })
    }
}
