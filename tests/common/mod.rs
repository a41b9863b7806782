//! Shared test fixtures.
//!
//! `ChainModel` is an exact, integer-valued stand-in for a language model:
//! the next token is a hash of the whole visible context. It stores token ids
//! as keys and positions as values in the cache, so a forward pass can
//! reconstruct exactly what each query row sees and reject inconsistent
//! positions or cache contents.

#![allow(dead_code)]

use candle_core::{Device, Tensor};
use nano_medusa::core::kv_cache::{KvCache, KvCacheConfig};
use nano_medusa::model::{ForwardInput, ForwardOutput, MedusaModel};
use nano_medusa::speculative::{BranchSpec, CandidateGenerator, Candidates, TreeTopology};
use nano_medusa::{Error, Result};

pub fn test_device() -> Device {
    Device::Cpu
}

/// How a Medusa head ranks the true future token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadQuality {
    /// True token first, a wrong token second.
    Oracle,
    /// A wrong token first, the true token second.
    Noisy,
}

/// Deterministic next token of `context`.
pub fn next_token(context: &[u32], vocab_size: usize) -> u32 {
    let hash = context.iter().fold(0xcbf2_9ce4_8422_2325u64, |h, &t| {
        (h ^ (t as u64 + 1)).wrapping_mul(0x0100_0000_01b3)
    });
    ((hash >> 7) % vocab_size as u64) as u32
}

/// Plain greedy continuation of `prompt`, computed without any tensors.
pub fn reference_greedy(prompt: &[u32], max_new_tokens: usize, vocab_size: usize) -> Vec<u32> {
    let mut context = prompt.to_vec();
    let mut output = Vec::with_capacity(max_new_tokens);
    for _ in 0..max_new_tokens {
        let token = next_token(&context, vocab_size);
        context.push(token);
        output.push(token);
    }
    output
}

#[derive(Debug, Clone)]
pub struct ChainModel {
    vocab_size: usize,
    heads: Vec<HeadQuality>,
    capacity: usize,
    uses_cache: bool,
    device: Device,
}

impl ChainModel {
    pub fn new(vocab_size: usize, heads: Vec<HeadQuality>) -> Self {
        Self {
            vocab_size,
            heads,
            capacity: 4096,
            uses_cache: true,
            device: test_device(),
        }
    }

    pub fn oracle(vocab_size: usize, num_heads: usize) -> Self {
        Self::new(vocab_size, vec![HeadQuality::Oracle; num_heads])
    }

    pub fn noisy(vocab_size: usize, num_heads: usize) -> Self {
        Self::new(vocab_size, vec![HeadQuality::Noisy; num_heads])
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.uses_cache = false;
        self
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn scores(&self, best: u32, second: u32) -> Vec<f32> {
        let mut row = vec![0.0f32; self.vocab_size];
        row[second as usize] = 5.0;
        row[best as usize] = 10.0;
        row
    }

    fn wrong(&self, token: u32) -> u32 {
        (token + 1) % self.vocab_size as u32
    }
}

impl MedusaModel for ChainModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn num_medusa_heads(&self) -> usize {
        self.heads.len()
    }

    fn kv_cache_config(&self) -> KvCacheConfig {
        KvCacheConfig::new(1, 1, 1, self.capacity)
    }

    fn uses_kv_cache(&self) -> bool {
        self.uses_cache
    }

    fn forward(&self, input: &ForwardInput, cache: &mut KvCache) -> Result<ForwardOutput> {
        let tokens: Vec<u32> = input.tokens.to_vec1()?;
        let positions: Vec<u32> = input.position_ids.to_vec1()?;
        let n = tokens.len();

        let keys: Vec<f32> = tokens.iter().map(|&t| t as f32).collect();
        let values: Vec<f32> = positions.iter().map(|&p| p as f32).collect();
        let keys = Tensor::from_vec(keys, (n, 1, 1), &self.device)?;
        let values = Tensor::from_vec(values, (n, 1, 1), &self.device)?;

        let layer = cache
            .layer_mut(0)
            .ok_or_else(|| Error::Model("missing cache layer".into()))?;
        let (all_keys, all_values) = layer.stage(&keys, &values)?;
        let all_keys: Vec<f32> = all_keys.flatten_all()?.to_vec1()?;
        let all_values: Vec<f32> = all_values.flatten_all()?.to_vec1()?;
        let bias: Vec<Vec<f32>> = input.attention_bias.to_vec2()?;

        let mut logits = Vec::with_capacity(n * self.vocab_size);
        let mut head_rows = vec![Vec::with_capacity(n * self.vocab_size); self.heads.len()];
        for (row, query_bias) in bias.iter().enumerate() {
            let visible: Vec<usize> = (0..query_bias.len()).filter(|&j| query_bias[j] == 0.0).collect();
            let context: Vec<u32> = visible.iter().map(|&j| all_keys[j] as u32).collect();

            for (expected, &j) in visible.iter().enumerate() {
                if all_values[j] as usize != expected {
                    return Err(Error::Model(format!(
                        "row {row} sees position {} at context index {expected}",
                        all_values[j]
                    )));
                }
            }
            if positions[row] as usize + 1 != context.len() {
                return Err(Error::Model(format!(
                    "row {row} has position {} but sees {} tokens",
                    positions[row],
                    context.len()
                )));
            }

            let next = next_token(&context, self.vocab_size);
            logits.extend(self.scores(next, self.wrong(next)));

            let mut future = context.clone();
            future.push(next);
            for (head, quality) in self.heads.iter().enumerate() {
                let truth = next_token(&future, self.vocab_size);
                future.push(truth);
                let row_scores = match quality {
                    HeadQuality::Oracle => self.scores(truth, self.wrong(truth)),
                    HeadQuality::Noisy => self.scores(self.wrong(truth), truth),
                };
                head_rows[head].extend(row_scores);
            }
        }

        let logits = Tensor::from_vec(logits, (n, self.vocab_size), &self.device)?;
        let head_logits = Tensor::from_vec(
            head_rows.concat(),
            (self.heads.len(), n, self.vocab_size),
            &self.device,
        )?;
        Ok(ForwardOutput { logits, head_logits })
    }
}

/// One-hot logits row with `token` set to 1.
pub fn one_hot(token: u32, vocab_size: usize) -> Vec<f32> {
    let mut row = vec![0.0f32; vocab_size];
    row[token as usize] = 1.0;
    row
}

/// Single-path candidates `tokens` (root first) and their topology.
pub fn single_path(tokens: &[u32], vocab_size: usize) -> (Candidates, TreeTopology) {
    let depth = tokens.len();
    let top_k = vec![1; depth - 1];
    let topology = TreeTopology::new(&BranchSpec::from_top_k(&top_k).unwrap());

    let base = Tensor::from_vec(one_hot(tokens[0], vocab_size), (1, vocab_size), &test_device())
        .unwrap();
    let heads: Vec<f32> = tokens[1..]
        .iter()
        .flat_map(|&t| one_hot(t, vocab_size))
        .collect();
    let heads = Tensor::from_vec(heads, (depth - 1, 1, vocab_size), &test_device()).unwrap();

    let candidates = CandidateGenerator::new(top_k)
        .unwrap()
        .generate(&heads, &base, &topology)
        .unwrap();
    (candidates, topology)
}

/// Row-major `[rows, vocab]` values with `argmaxes[r]` scoring highest in row `r`.
pub fn argmax_rows(argmaxes: &[u32], vocab_size: usize) -> Vec<f32> {
    argmaxes.iter().flat_map(|&t| one_hot(t, vocab_size)).collect()
}
