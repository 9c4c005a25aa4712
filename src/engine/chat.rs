//! Interactive streaming chat loop.
//!
//! [`ChatLoop`] is an explicit state machine:
//!
//! ```text
//! AwaitingInput -> Formatting -> Generating <-> StreamingOutput
//!       ^                            |               |
//!       +----------------------------+---------------+
//! AwaitingInput -> Terminated   (on "quit()" or end of input)
//! ```
//!
//! One call to [`ChatLoop::advance`] performs the work of the current state
//! and moves to the next. Generation yields one token per
//! `Generating -> StreamingOutput` round trip, and the cancellation token is
//! checked at every token boundary. An interrupt ends the turn with a visible
//! notice; text already printed stays on screen.

use std::io::{BufRead, Write};

use tracing::{debug, info, warn};

use crate::backend::{GenerationEngineClient, SearchOptions, Step};
use crate::error::InferenceError;

use super::cancel::CancellationToken;
use super::detokenize::IncrementalDetokenizer;

/// Typed by the user to end the session.
pub const QUIT_SENTINEL: &str = "quit()";

pub const INPUT_PROMPT: &str = "Prompt (Use quit() to exit): ";
pub const OUTPUT_PREFIX: &str = "\nOutput: ";
pub const ABORT_NOTICE: &str = "  --control+c pressed, aborting generation--";

/// Wrap user text in the chat template with user/assistant role markers.
pub fn format_prompt(user_text: &str) -> String {
    format!(
        "<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n",
        user_text
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    AwaitingInput,
    Formatting,
    Generating,
    StreamingOutput,
    Terminated,
}

/// How a generation turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The engine signalled completion.
    Completed { tokens: usize },
    /// The user interrupted generation.
    Aborted { tokens: usize },
    /// A collaborator error ended the turn.
    Failed { tokens: usize },
}

/// What one line of user input means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInput {
    Empty,
    Quit,
    Text(String),
}

impl UserInput {
    /// Classify a line with its trailing newline already removed.
    pub fn classify(line: &str) -> Self {
        if line.is_empty() {
            UserInput::Empty
        } else if line == QUIT_SENTINEL {
            UserInput::Quit
        } else {
            UserInput::Text(line.to_string())
        }
    }
}

/// Long-lived generation context: the engine handle plus the sampling
/// profile applied to every turn.
pub struct ChatContext<E: GenerationEngineClient> {
    pub engine: E,
    pub options: SearchOptions,
}

impl<E: GenerationEngineClient> ChatContext<E> {
    pub fn new(engine: E, options: SearchOptions) -> Self {
        Self { engine, options }
    }
}

/// The chat state machine over an engine, an input reader and an output writer.
pub struct ChatLoop<E: GenerationEngineClient, R: BufRead, W: Write> {
    context: ChatContext<E>,
    input: R,
    output: W,
    cancel: CancellationToken,
    detokenizer: IncrementalDetokenizer,
    state: ChatState,
    pending_text: Option<String>,
    session: Option<E::Session>,
    last_step: Option<Step>,
    turn_tokens: usize,
    last_outcome: Option<TurnOutcome>,
}

impl<E: GenerationEngineClient, R: BufRead, W: Write> ChatLoop<E, R, W> {
    pub fn new(context: ChatContext<E>, input: R, output: W, cancel: CancellationToken) -> Self {
        Self {
            context,
            input,
            output,
            cancel,
            detokenizer: IncrementalDetokenizer::new(),
            state: ChatState::AwaitingInput,
            pending_text: None,
            session: None,
            last_step: None,
            turn_tokens: 0,
            last_outcome: None,
        }
    }

    pub fn state(&self) -> ChatState {
        self.state
    }

    /// Outcome of the most recent generation turn.
    pub fn last_outcome(&self) -> Option<TurnOutcome> {
        self.last_outcome
    }

    pub fn context(&self) -> &ChatContext<E> {
        &self.context
    }

    pub fn output(&self) -> &W {
        &self.output
    }

    /// Drive the machine until it reaches `Terminated`.
    ///
    /// Only I/O failures on the console end the session early.
    pub fn run(&mut self) -> Result<(), InferenceError> {
        while self.advance()? != ChatState::Terminated {}
        info!("Chat session terminated");
        Ok(())
    }

    /// Execute the current state and transition.
    pub fn advance(&mut self) -> Result<ChatState, InferenceError> {
        let next = match self.state {
            ChatState::AwaitingInput => self.await_input()?,
            ChatState::Formatting => self.format_and_start()?,
            ChatState::Generating => self.generate_next()?,
            ChatState::StreamingOutput => self.stream_output()?,
            ChatState::Terminated => ChatState::Terminated,
        };
        debug!(from = ?self.state, to = ?next, "Chat state transition");
        self.state = next;
        Ok(next)
    }

    fn await_input(&mut self) -> Result<ChatState, InferenceError> {
        write!(self.output, "{}", INPUT_PROMPT)?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            // End of input: nothing more can ever be read.
            writeln!(self.output)?;
            return Ok(ChatState::Terminated);
        }
        let line = line.strip_suffix('\n').unwrap_or(&line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        match UserInput::classify(line) {
            UserInput::Empty => {
                writeln!(self.output, "{}", InferenceError::EmptyUserInput)?;
                Ok(ChatState::AwaitingInput)
            }
            UserInput::Quit => Ok(ChatState::Terminated),
            UserInput::Text(text) => {
                self.pending_text = Some(text);
                Ok(ChatState::Formatting)
            }
        }
    }

    /// Apply the template, encode it and open an engine session.
    fn format_and_start(&mut self) -> Result<ChatState, InferenceError> {
        let Some(text) = self.pending_text.take() else {
            return Ok(ChatState::AwaitingInput);
        };
        // Cleared before encode and prefill so a press during either still
        // aborts this turn at the first token boundary.
        self.cancel.reset();
        let prompt = format_prompt(&text);

        let started = self
            .context
            .engine
            .encode(&prompt)
            .and_then(|tokens| {
                debug!(prompt_tokens = tokens.len(), "Encoded prompt");
                self.context.engine.start(&tokens, &self.context.options)
            });

        match started {
            Ok(session) => {
                self.session = Some(session);
                self.detokenizer.reset();
                self.turn_tokens = 0;
                self.last_step = None;
                write!(self.output, "{}", OUTPUT_PREFIX)?;
                self.output.flush()?;
                Ok(ChatState::Generating)
            }
            Err(e) => {
                warn!(error = %e, "Failed to start generation");
                writeln!(self.output, "Error: {}", e)?;
                self.last_outcome = Some(TurnOutcome::Failed { tokens: 0 });
                Ok(ChatState::AwaitingInput)
            }
        }
    }

    /// Ask the engine for one more token, unless interrupted.
    fn generate_next(&mut self) -> Result<ChatState, InferenceError> {
        if self.cancel.is_cancelled() {
            return self.end_turn(Err(InferenceError::GenerationAborted));
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(ChatState::AwaitingInput);
        };

        match self.context.engine.step(session) {
            Ok(step) => {
                self.turn_tokens += 1;
                self.last_step = Some(step);
                Ok(ChatState::StreamingOutput)
            }
            Err(e) => self.end_turn(Err(e)),
        }
    }

    /// Decode the latest token and print whatever text it completed.
    fn stream_output(&mut self) -> Result<ChatState, InferenceError> {
        let Some(step) = self.last_step.take() else {
            return Ok(ChatState::Generating);
        };

        let fragment = match self.detokenizer.feed(&self.context.engine, step.token_id) {
            Ok(fragment) => fragment,
            Err(e) => return self.end_turn(Err(e)),
        };
        if !fragment.is_empty() {
            write!(self.output, "{}", fragment)?;
            self.output.flush()?;
        }

        if step.is_done {
            self.end_turn(Ok(()))
        } else if self.cancel.is_cancelled() {
            self.end_turn(Err(InferenceError::GenerationAborted))
        } else {
            Ok(ChatState::Generating)
        }
    }

    /// Close out a turn and go back to waiting for input.
    fn end_turn(&mut self, result: Result<(), InferenceError>) -> Result<ChatState, InferenceError> {
        self.session = None;
        self.last_step = None;
        let tokens = self.turn_tokens;

        let outcome = match result {
            Ok(()) => {
                let tail = self.detokenizer.finish(&self.context.engine)?;
                write!(self.output, "{}", tail)?;
                TurnOutcome::Completed { tokens }
            }
            Err(InferenceError::GenerationAborted) => {
                self.detokenizer.reset();
                writeln!(self.output, "{}", ABORT_NOTICE)?;
                TurnOutcome::Aborted { tokens }
            }
            Err(e) => {
                self.detokenizer.reset();
                warn!(error = %e, "Generation turn failed");
                writeln!(self.output)?;
                write!(self.output, "Error: {}", e)?;
                TurnOutcome::Failed { tokens }
            }
        };

        write!(self.output, "\n\n")?;
        self.output.flush()?;
        self.cancel.reset();
        debug!(?outcome, "Turn finished");
        self.last_outcome = Some(outcome);
        Ok(ChatState::AwaitingInput)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TokenDecoder;
    use std::cell::RefCell;
    use std::io::{self, Cursor};

    /// Byte-level fake engine: encodes text as its UTF-8 bytes and replays a
    /// scripted reply, one byte per step. Id 0 is the end-of-text marker and
    /// decodes to nothing.
    struct ScriptedEngine {
        reply: Vec<u32>,
        /// Texts passed to `encode`, in call order.
        encoded: RefCell<Vec<String>>,
        start_calls: usize,
        step_calls: usize,
        last_options: Option<SearchOptions>,
        /// Raise this token after the given number of steps.
        interrupt_after: Option<(usize, CancellationToken)>,
        /// Raise this token while the prompt is being prefilled.
        interrupt_in_start: Option<CancellationToken>,
        fail_step_at: Option<usize>,
        fail_encode: bool,
    }

    impl ScriptedEngine {
        fn replying(text: &str) -> Self {
            let mut reply: Vec<u32> = text.bytes().map(u32::from).collect();
            reply.push(0);
            Self {
                reply,
                encoded: RefCell::new(Vec::new()),
                start_calls: 0,
                step_calls: 0,
                last_options: None,
                interrupt_after: None,
                interrupt_in_start: None,
                fail_step_at: None,
                fail_encode: false,
            }
        }
    }

    struct ScriptedSession {
        position: usize,
    }

    impl TokenDecoder for ScriptedEngine {
        fn decode(&self, ids: &[u32]) -> Result<String, InferenceError> {
            let bytes: Vec<u8> = ids.iter().filter(|&&id| id != 0).map(|&id| id as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    impl GenerationEngineClient for ScriptedEngine {
        type Session = ScriptedSession;

        fn encode(&self, text: &str) -> Result<Vec<u32>, InferenceError> {
            self.encoded.borrow_mut().push(text.to_string());
            if self.fail_encode {
                return Err(InferenceError::Tokenizer("cannot encode".to_string()));
            }
            Ok(text.bytes().map(u32::from).collect())
        }

        fn start(
            &mut self,
            prompt_tokens: &[u32],
            options: &SearchOptions,
        ) -> Result<Self::Session, InferenceError> {
            assert!(!prompt_tokens.is_empty());
            self.start_calls += 1;
            self.last_options = Some(options.clone());
            if let Some(token) = &self.interrupt_in_start {
                token.cancel();
            }
            Ok(ScriptedSession { position: 0 })
        }

        fn step(&mut self, session: &mut Self::Session) -> Result<Step, InferenceError> {
            self.step_calls += 1;
            if self.fail_step_at == Some(session.position) {
                return Err(InferenceError::Generation("engine fault".to_string()));
            }
            let token_id = self.reply[session.position];
            session.position += 1;
            if let Some((after, token)) = &self.interrupt_after {
                if session.position == *after {
                    token.cancel();
                }
            }
            Ok(Step {
                token_id,
                is_done: session.position == self.reply.len(),
            })
        }
    }

    fn chat(
        engine: ScriptedEngine,
        input: &str,
        cancel: CancellationToken,
    ) -> ChatLoop<ScriptedEngine, Cursor<Vec<u8>>, Vec<u8>> {
        ChatLoop::new(
            ChatContext::new(engine, SearchOptions::default()),
            Cursor::new(input.as_bytes().to_vec()),
            Vec::new(),
            cancel,
        )
    }

    fn printed<E: GenerationEngineClient>(chat: &ChatLoop<E, Cursor<Vec<u8>>, Vec<u8>>) -> String {
        String::from_utf8(chat.output().clone()).unwrap()
    }

    #[test]
    fn test_format_prompt_template() {
        assert_eq!(
            format_prompt("Hi"),
            "<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_classify_input() {
        assert_eq!(UserInput::classify(""), UserInput::Empty);
        assert_eq!(UserInput::classify("quit()"), UserInput::Quit);
        assert_eq!(UserInput::classify(" quit()"), UserInput::Text(" quit()".into()));
        assert_eq!(UserInput::classify("QUIT()"), UserInput::Text("QUIT()".into()));
    }

    #[test]
    fn test_starts_awaiting_input() {
        let chat = chat(ScriptedEngine::replying("x"), "", CancellationToken::new());
        assert_eq!(chat.state(), ChatState::AwaitingInput);
    }

    #[test]
    fn test_empty_input_stays_awaiting_without_engine_call() {
        let mut chat = chat(ScriptedEngine::replying("x"), "\n", CancellationToken::new());
        assert_eq!(chat.advance().unwrap(), ChatState::AwaitingInput);
        assert!(printed(&chat).contains("Error, input cannot be empty"));
        assert!(chat.context().engine.encoded.borrow().is_empty());
        assert_eq!(chat.context().engine.start_calls, 0);
        assert_eq!(chat.context().engine.step_calls, 0);
    }

    #[test]
    fn test_quit_terminates_without_generation() {
        let mut chat = chat(ScriptedEngine::replying("x"), "quit()\n", CancellationToken::new());
        assert_eq!(chat.advance().unwrap(), ChatState::Terminated);
        assert!(chat.context().engine.encoded.borrow().is_empty());
        assert_eq!(chat.context().engine.start_calls, 0);
        assert_eq!(chat.context().engine.step_calls, 0);
        // Terminated is absorbing.
        assert_eq!(chat.advance().unwrap(), ChatState::Terminated);
    }

    #[test]
    fn test_end_of_input_terminates() {
        let mut chat = chat(ScriptedEngine::replying("x"), "", CancellationToken::new());
        chat.run().unwrap();
        assert_eq!(chat.state(), ChatState::Terminated);
    }

    #[test]
    fn test_full_turn_state_sequence() {
        let mut chat = chat(ScriptedEngine::replying("ok"), "hello\n", CancellationToken::new());
        let mut states = vec![chat.state()];
        while chat.state() != ChatState::Terminated {
            states.push(chat.advance().unwrap());
        }
        use ChatState::*;
        assert_eq!(
            states,
            vec![
                AwaitingInput,
                Formatting,
                Generating,
                StreamingOutput, // 'o'
                Generating,
                StreamingOutput, // 'k'
                Generating,
                StreamingOutput, // end marker, done
                AwaitingInput,
                Terminated,
            ]
        );
        assert_eq!(chat.last_outcome(), Some(TurnOutcome::Completed { tokens: 3 }));
    }

    #[test]
    fn test_turn_prints_stream_and_uses_template() {
        let mut chat = chat(
            ScriptedEngine::replying("Paris is 世界"),
            "What is the capital of France?\nquit()\n",
            CancellationToken::new(),
        );
        chat.run().unwrap();

        let out = printed(&chat);
        assert!(out.contains("\nOutput: Paris is 世界\n\n"), "out={:?}", out);
        assert_eq!(
            *chat.context().engine.encoded.borrow(),
            vec![format_prompt("What is the capital of France?")]
        );
        assert_eq!(
            chat.context().engine.last_options,
            Some(SearchOptions::default())
        );
    }

    #[test]
    fn test_interrupt_aborts_turn_and_keeps_partial_output() {
        let cancel = CancellationToken::new();
        let mut engine = ScriptedEngine::replying("abcdefgh");
        engine.interrupt_after = Some((3, cancel.clone()));
        let mut chat = chat(engine, "go\nquit()\n", cancel.clone());
        chat.run().unwrap();

        let out = printed(&chat);
        assert!(out.contains("Output: abc  --control+c pressed, aborting generation--\n"), "out={:?}", out);
        assert!(!out.contains("abcd"));
        assert_eq!(chat.last_outcome(), Some(TurnOutcome::Aborted { tokens: 3 }));
        assert_eq!(chat.context().engine.step_calls, 3);
        assert!(!cancel.is_cancelled(), "flag is cleared after the turn");
    }

    #[test]
    fn test_session_continues_after_interrupt() {
        let cancel = CancellationToken::new();
        let mut engine = ScriptedEngine::replying("xyz");
        engine.interrupt_after = Some((1, cancel.clone()));
        let mut chat = chat(engine, "one\ntwo\nquit()\n", cancel.clone());
        chat.run().unwrap();

        let out = printed(&chat);
        assert_eq!(out.matches(ABORT_NOTICE).count(), 2);
        assert_eq!(chat.context().engine.start_calls, 2);
    }

    #[test]
    fn test_stale_interrupt_does_not_abort_next_turn() {
        let cancel = CancellationToken::new();
        cancel.cancel(); // Ctrl+C pressed while at the prompt
        let mut chat = chat(ScriptedEngine::replying("fine"), "hi\nquit()\n", cancel);
        chat.run().unwrap();
        assert!(printed(&chat).contains("Output: fine\n\n"));
        assert_eq!(chat.last_outcome(), Some(TurnOutcome::Completed { tokens: 5 }));
    }

    #[test]
    fn test_engine_error_is_contained_to_turn() {
        let mut engine = ScriptedEngine::replying("hello");
        engine.fail_step_at = Some(2);
        let mut chat = chat(engine, "a\nquit()\n", CancellationToken::new());
        chat.run().unwrap();

        let out = printed(&chat);
        assert!(out.contains("Output: he\nError: Generation error: engine fault\n\n"), "out={:?}", out);
        assert_eq!(chat.state(), ChatState::Terminated);
        assert_eq!(chat.last_outcome(), Some(TurnOutcome::Failed { tokens: 2 }));
    }

    #[test]
    fn test_encode_error_reported_and_loop_continues() {
        let mut engine = ScriptedEngine::replying("x");
        engine.fail_encode = true;
        let mut chat = chat(engine, "a\n\nquit()\n", CancellationToken::new());
        chat.run().unwrap();

        let out = printed(&chat);
        assert!(out.contains("Error: Tokenizer error: cannot encode"));
        assert!(out.contains("Error, input cannot be empty"));
        assert_eq!(chat.context().engine.start_calls, 0);
    }

    #[test]
    fn test_multibyte_reply_split_across_steps() {
        let mut chat = chat(ScriptedEngine::replying("héllo 你好"), "x\n", CancellationToken::new());
        chat.run().unwrap();
        assert!(printed(&chat).contains("Output: héllo 你好\n\n"));
    }

    #[test]
    fn test_crlf_input_is_trimmed() {
        let mut chat = chat(ScriptedEngine::replying("x"), "quit()\r\n", CancellationToken::new());
        assert_eq!(chat.advance().unwrap(), ChatState::Terminated);
    }

    #[test]
    fn test_interrupt_during_prefill_aborts_turn() {
        let cancel = CancellationToken::new();
        let mut engine = ScriptedEngine::replying("abcdefgh");
        engine.interrupt_in_start = Some(cancel.clone());
        let mut chat = chat(engine, "go\nquit()\n", cancel.clone());
        chat.run().unwrap();

        let out = printed(&chat);
        assert!(out.contains("Output:   --control+c pressed, aborting generation--\n"), "out={:?}", out);
        assert!(!out.contains("abc"));
        assert_eq!(chat.last_outcome(), Some(TurnOutcome::Aborted { tokens: 0 }));
        assert_eq!(chat.context().engine.step_calls, 0);
        assert!(!cancel.is_cancelled());
    }

    /// Records what was written between consecutive flushes.
    #[derive(Default)]
    struct FlushLog {
        pending: Vec<u8>,
        flushed: Vec<Vec<u8>>,
    }

    impl Write for FlushLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.pending.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            if !self.pending.is_empty() {
                self.flushed.push(std::mem::take(&mut self.pending));
            }
            Ok(())
        }
    }

    #[test]
    fn test_each_fragment_is_flushed_on_its_own() {
        // "é" and "世" arrive as several byte tokens each.
        let mut chat = ChatLoop::new(
            ChatContext::new(ScriptedEngine::replying("hé 世!"), SearchOptions::default()),
            Cursor::new(b"x\n".to_vec()),
            FlushLog::default(),
            CancellationToken::new(),
        );
        chat.run().unwrap();

        // A flush inside a held partial character would fail UTF-8 decoding here.
        let chunks: Vec<String> = chat
            .output()
            .flushed
            .iter()
            .map(|chunk| String::from_utf8(chunk.clone()).unwrap())
            .collect();
        let start = chunks.iter().position(|c| c == OUTPUT_PREFIX).unwrap();
        assert_eq!(chunks[start + 1..start + 6], ["h", "é", " ", "世", "!"]);
        assert_eq!(chunks[start + 6], "\n\n");
        assert_eq!(chunks[start + 7], INPUT_PROMPT);
    }
}
