//! Live token streaming.
//!
//! Generated text is pushed piece by piece into a [`TokenSink`] while the
//! decode loop runs, independently of the final returned reply.

use std::io::Write;

use thiserror::Error;
use tokenizers::Tokenizer;

#[derive(Debug, Error)]
#[error("detokenization failed: {0}")]
pub struct DetokenizeError(pub String);

/// Receives incremental generated text during a model run.
pub trait TokenSink {
    fn on_token(&mut self, piece: &str);
}

/// Writes each piece to stdout and flushes, so tokens appear as they are
/// sampled.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl TokenSink for StdoutSink {
    fn on_token(&mut self, piece: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(piece.as_bytes());
        let _ = stdout.flush();
    }
}

/// Discards every piece.
#[derive(Debug, Default)]
pub struct NullSink;

impl TokenSink for NullSink {
    fn on_token(&mut self, _piece: &str) {}
}

/// Incremental detokenizer.
///
/// Byte-pair vocabularies spread multi-byte characters over several tokens,
/// so decoding token-by-token can split UTF-8. A piece is only released once
/// the decoded text has grown past the previous emit point and ends on an
/// alphanumeric boundary; [`TokenOutputStream::decode_rest`] flushes whatever
/// remains.
pub struct TokenOutputStream {
    tokenizer: Tokenizer,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl TokenOutputStream {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, DetokenizeError> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| DetokenizeError(e.to_string()))
    }

    /// Feeds one sampled token; returns the next printable piece, if any.
    pub fn next_token(&mut self, token: u32) -> Result<Option<String>, DetokenizeError> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        self.tokens.push(token);
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() && text.chars().last().is_some_and(|c| c.is_alphanumeric()) {
            let piece = text[prev_text.len()..].to_string();
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(piece))
        } else {
            Ok(None)
        }
    }

    /// Decodes whatever trails the last emitted piece.
    pub fn decode_rest(&self) -> Result<Option<String>, DetokenizeError> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() {
            Ok(Some(text[prev_text.len()..].to_string()))
        } else {
            Ok(None)
        }
    }

    /// Decodes every token fed so far.
    pub fn decode_all(&self) -> Result<String, DetokenizeError> {
        self.decode(&self.tokens)
    }

    /// Resets stream state between runs; the tokenizer is kept.
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.prev_index = 0;
        self.current_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Vec<String>);

    impl TokenSink for Recorder {
        fn on_token(&mut self, piece: &str) {
            self.0.push(piece.to_string());
        }
    }

    #[test]
    fn sinks_receive_pieces_in_order() {
        let mut sink = Recorder(Vec::new());
        sink.on_token("Hel");
        sink.on_token("lo");
        assert_eq!(sink.0, vec!["Hel", "lo"]);

        // NullSink is callable and does nothing observable.
        NullSink.on_token("ignored");
    }
}
