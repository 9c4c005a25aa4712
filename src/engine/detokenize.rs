//! Streaming detokenization.
//!
//! A single token id does not always decode to a complete character: a
//! multi-byte UTF-8 sequence may be split across adjacent tokens, and
//! SentencePiece-style decoders render a token differently depending on what
//! precedes it. [`IncrementalDetokenizer`] keeps a small window of ids and
//! emits only the text that became final with the newest token.
//!
//! For each `feed`, it decodes the window once without and once with the
//! unread tokens. If the longer decode extends the shorter one and does not end
//! in U+FFFD (an incomplete byte sequence), the extension is emitted and the
//! window slides forward. Otherwise the ids stay buffered.

use tracing::trace;

use crate::backend::TokenDecoder;
use crate::error::InferenceError;

const REPLACEMENT_CHAR: char = '\u{FFFD}';

/// Turns a token stream into displayable text fragments.
#[derive(Debug, Default, Clone)]
pub struct IncrementalDetokenizer {
    /// Ids not yet fully rendered, plus one already-emitted id for context.
    ids: Vec<u32>,
    /// Start of the context window within `ids`.
    prefix_offset: usize,
    /// First id whose text has not been emitted.
    read_offset: usize,
}

impl IncrementalDetokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids currently held.
    pub fn buffered(&self) -> usize {
        self.ids.len()
    }

    /// Whether any ids await rendering.
    pub fn has_pending(&self) -> bool {
        self.read_offset < self.ids.len()
    }

    /// Drop all buffered state before a new turn.
    pub fn reset(&mut self) {
        self.ids.clear();
        self.prefix_offset = 0;
        self.read_offset = 0;
    }

    /// Push one token and return the text it completed (possibly empty).
    pub fn feed<D: TokenDecoder + ?Sized>(
        &mut self,
        decoder: &D,
        token_id: u32,
    ) -> Result<String, InferenceError> {
        self.ids.push(token_id);

        let prefix_text = decoder.decode(&self.ids[self.prefix_offset..self.read_offset])?;
        let full_text = decoder.decode(&self.ids[self.prefix_offset..])?;

        let fragment = match full_text.strip_prefix(prefix_text.as_str()) {
            Some(new_text) if !new_text.is_empty() && !new_text.ends_with(REPLACEMENT_CHAR) => {
                new_text.to_string()
            }
            _ => {
                trace!(token_id, buffered = self.ids.len(), "Holding incomplete token");
                return Ok(String::new());
            }
        };

        self.prefix_offset = self.read_offset;
        self.read_offset = self.ids.len();
        self.compact();
        Ok(fragment)
    }

    /// Flush whatever is still buffered at the end of a turn and reset.
    ///
    /// Trailing incomplete bytes come out as the decoder renders them (usually
    /// U+FFFD), so the concatenated fragments always equal the one-shot decode.
    pub fn finish<D: TokenDecoder + ?Sized>(&mut self, decoder: &D) -> Result<String, InferenceError> {
        if !self.has_pending() {
            self.reset();
            return Ok(String::new());
        }

        let prefix_text = decoder.decode(&self.ids[self.prefix_offset..self.read_offset])?;
        let full_text = decoder.decode(&self.ids[self.prefix_offset..])?;
        self.reset();

        Ok(match full_text.strip_prefix(prefix_text.as_str()) {
            Some(rest) => rest.to_string(),
            None => full_text,
        })
    }

    /// Discard ids that precede the context window.
    fn compact(&mut self) {
        if self.prefix_offset > 0 {
            self.ids.drain(..self.prefix_offset);
            self.read_offset -= self.prefix_offset;
            self.prefix_offset = 0;
        }
    }
}
