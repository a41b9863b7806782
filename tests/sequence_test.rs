//! Integration tests for SequenceState.

use nano_medusa::core::sequence::{FinishReason, SequenceState};

#[test]
fn test_sequence_creation() {
    let seq = SequenceState::new(vec![10, 20, 30, 40]);

    assert_eq!(seq.prompt_token_ids(), &[10, 20, 30, 40]);
    assert_eq!(seq.prompt_len(), 4);
    assert_eq!(seq.output_len(), 0);
    assert_eq!(seq.total_len(), 4);
    assert_eq!(seq.new_tokens(), 0);
    assert!(seq.is_unfinished());
    assert_eq!(seq.finish_reason(), None);
    assert_eq!(seq.pending_root(), None);
}

#[test]
fn test_append_tokens() {
    let mut seq = SequenceState::new(vec![1, 2, 3]);

    seq.append_token(100);
    seq.append_token(101);

    assert_eq!(seq.output_len(), 2);
    assert_eq!(seq.total_len(), 5);
    assert_eq!(seq.last_token_id(), Some(101));
    assert_eq!(seq.all_token_ids(), vec![1, 2, 3, 100, 101]);
}

#[test]
fn test_last_token_falls_back_to_prompt() {
    assert_eq!(SequenceState::new(vec![5, 6]).last_token_id(), Some(6));
    assert_eq!(SequenceState::new(vec![]).last_token_id(), None);
}

#[test]
fn test_first_eos_wins() {
    let mut seq = SequenceState::new(vec![1]);
    for t in [4, 2, 5, 2, 6] {
        seq.append_token(t);
    }

    assert_eq!(seq.check_stop(Some(2), 100), Some(FinishReason::EndOfSequence));
    assert_eq!(seq.output_token_ids(), &[4, 2]);
    // Truncated tokens still count as generated work.
    assert_eq!(seq.new_tokens(), 5);
}

#[test]
fn test_eos_exactly_at_limit() {
    let mut seq = SequenceState::new(vec![1]);
    for t in [4, 5, 2] {
        seq.append_token(t);
    }

    assert_eq!(seq.check_stop(Some(2), 3), Some(FinishReason::EndOfSequence));
    assert_eq!(seq.output_token_ids(), &[4, 5, 2]);
}

#[test]
fn test_zero_limit_finishes_immediately() {
    let mut seq = SequenceState::new(vec![1]);

    assert_eq!(seq.check_stop(Some(2), 0), Some(FinishReason::MaxTokens));
    assert!(seq.is_finished());
}

#[test]
fn test_finish_is_sticky() {
    let mut seq = SequenceState::new(vec![1]);
    seq.set_finished(FinishReason::EndOfSequence);
    seq.append_token(9);
    seq.append_token(9);

    assert_eq!(seq.check_stop(None, 1), Some(FinishReason::EndOfSequence));
    assert_eq!(seq.output_len(), 2);
}

#[test]
fn test_finish_reason_as_str() {
    assert_eq!(FinishReason::EndOfSequence.as_str(), "eos");
    assert_eq!(FinishReason::MaxTokens.as_str(), "max_tokens");
}

#[test]
fn test_pending_root_lifecycle() {
    let mut seq = SequenceState::new(vec![1, 2]);
    seq.append_token(3);
    seq.append_token(4);
    seq.set_pending_root(4);

    assert_eq!(seq.pending_root(), Some(4));
    assert_eq!(seq.all_token_ids(), vec![1, 2, 3, 4]);
    assert_eq!(seq.committed_token_ids(), vec![1, 2, 3]);

    assert_eq!(seq.take_pending_root(), Some(4));
    assert_eq!(seq.take_pending_root(), None);
    assert_eq!(seq.committed_token_ids(), vec![1, 2, 3, 4]);
}
