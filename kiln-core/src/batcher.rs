//! Batcher module - assembles the per-step input descriptor for decode calls

use crate::runtime::TokenId;

/// Sequence id used for the single sequence a session decodes.
pub const DEFAULT_SEQ_ID: i32 = 0;

/// One token submitted to the runtime in a decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub position: usize,
    pub seq_id: i32,
    /// Whether the runtime must keep output (logits) for this entry.
    pub logits: bool,
}

/// Tokens submitted to the runtime in one decode call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tokens(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.entries.iter().map(|e| e.token)
    }

    /// Position of the first entry, if any.
    pub fn first_position(&self) -> Option<usize> {
        self.entries.first().map(|e| e.position)
    }

    /// Index of the last entry that asked for logits.
    pub fn output_index(&self) -> Option<usize> {
        self.entries.iter().rposition(|e| e.logits)
    }

    pub fn last_index(&self) -> Option<usize> {
        self.entries.len().checked_sub(1)
    }
}

/// Hands out batches with strictly increasing positions for one sequence.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    seq_id: i32,
    next_position: usize,
    max_batch: usize,
}

impl BatchBuilder {
    /// Builder starting at position 0. `max_batch` caps tokens per batch.
    pub fn new(max_batch: usize) -> Self {
        Self {
            seq_id: DEFAULT_SEQ_ID,
            next_position: 0,
            max_batch: max_batch.max(1),
        }
    }

    pub fn with_seq_id(mut self, seq_id: i32) -> Self {
        self.seq_id = seq_id;
        self
    }

    /// Position the next submitted token will occupy.
    pub fn position(&self) -> usize {
        self.next_position
    }

    /// Skip positions filled by something other than tokens (an image).
    pub fn advance(&mut self, positions: usize) {
        self.next_position += positions;
    }

    /// Split a prompt into batches of at most `max_batch` tokens.
    ///
    /// Only the final token of the final batch carries the logits flag, and
    /// only when `want_logits` is set.
    pub fn prompt(&mut self, tokens: &[TokenId], want_logits: bool) -> Vec<Batch> {
        let total = tokens.len();
        let mut batches = Vec::with_capacity(total.div_ceil(self.max_batch));
        for (chunk_idx, chunk) in tokens.chunks(self.max_batch).enumerate() {
            let chunk_start = chunk_idx * self.max_batch;
            let entries = chunk
                .iter()
                .enumerate()
                .map(|(i, &token)| BatchEntry {
                    token,
                    position: self.next_position + i,
                    seq_id: self.seq_id,
                    logits: want_logits && chunk_start + i + 1 == total,
                })
                .collect();
            self.next_position += chunk.len();
            batches.push(Batch { entries });
        }
        batches
    }

    /// One freshly generated token at the next position, logits requested.
    pub fn single(&mut self, token: TokenId) -> Batch {
        let entry = BatchEntry {
            token,
            position: self.next_position,
            seq_id: self.seq_id,
            logits: true,
        };
        self.next_position += 1;
        Batch {
            entries: vec![entry],
        }
    }
}
