//! Sequence state for one generation run.
//!
//! Tracks the prompt and the generated tokens, when and why generation
//! stopped, and the pending root: a token already appended to the output
//! whose cache rows have not been written yet.

/// Reason for sequence completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// Maximum token limit reached.
    MaxTokens,
}

impl FinishReason {
    /// Get the reason name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndOfSequence => "eos",
            Self::MaxTokens => "max_tokens",
        }
    }
}

/// Prompt, output and stop state of a sequence.
///
/// # Example
///
/// ```
/// use nano_medusa::core::sequence::{FinishReason, SequenceState};
///
/// let mut seq = SequenceState::new(vec![1, 2, 3]);
/// seq.append_token(7);
/// seq.append_token(0);
/// seq.append_token(9);
///
/// // Everything after the first EOS is dropped.
/// assert_eq!(seq.check_stop(Some(0), 16), Some(FinishReason::EndOfSequence));
/// assert_eq!(seq.output_token_ids(), &[7, 0]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceState {
    prompt_token_ids: Vec<u32>,
    output_token_ids: Vec<u32>,
    /// Tokens appended since the run started, including any later truncated.
    new_tokens: usize,
    finish_reason: Option<FinishReason>,
    pending_root: Option<u32>,
}

impl SequenceState {
    /// Create a new sequence with the given prompt tokens.
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_token_ids,
            output_token_ids: Vec::new(),
            new_tokens: 0,
            finish_reason: None,
            pending_root: None,
        }
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    /// Get the output token IDs.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Get all token IDs (prompt + output).
    pub fn all_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    /// Tokens whose cache rows are committed: everything except the pending
    /// root.
    pub fn committed_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.all_token_ids();
        if self.pending_root.is_some() {
            tokens.pop();
        }
        tokens
    }

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Get the output length.
    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Get the total length (prompt + output).
    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Number of tokens appended so far.
    pub fn new_tokens(&self) -> usize {
        self.new_tokens
    }

    /// Get the last token ID.
    pub fn last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    /// Whether generation should continue.
    pub fn is_unfinished(&self) -> bool {
        self.finish_reason.is_none()
    }

    /// Check if the sequence is finished.
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Get the finish reason (if finished).
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Token appended to the output but not yet written to the cache.
    pub fn pending_root(&self) -> Option<u32> {
        self.pending_root
    }

    /// Record the pending root.
    pub fn set_pending_root(&mut self, token: u32) {
        self.pending_root = Some(token);
    }

    /// Clear and return the pending root.
    pub fn take_pending_root(&mut self) -> Option<u32> {
        self.pending_root.take()
    }

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
        self.new_tokens += 1;
    }

    /// Mark the sequence as finished.
    pub fn set_finished(&mut self, reason: FinishReason) {
        self.finish_reason = Some(reason);
    }

    /// Apply the stop conditions to the output so far.
    ///
    /// The output is cut right after the first `eos`, or to `max_new_tokens`
    /// tokens, whichever comes first. Returns the finish reason when the
    /// sequence is (now) finished.
    pub fn check_stop(&mut self, eos: Option<u32>, max_new_tokens: usize) -> Option<FinishReason> {
        if self.finish_reason.is_some() {
            return self.finish_reason;
        }

        let eos_at = eos.and_then(|eos| self.output_token_ids.iter().position(|&t| t == eos));
        match eos_at {
            Some(pos) if pos < max_new_tokens => {
                self.output_token_ids.truncate(pos + 1);
                self.finish_reason = Some(FinishReason::EndOfSequence);
            }
            _ if self.output_token_ids.len() >= max_new_tokens => {
                self.output_token_ids.truncate(max_new_tokens);
                self.finish_reason = Some(FinishReason::MaxTokens);
            }
            _ => {}
        }
        self.finish_reason
    }
}
