//! Tree verification on the seeded tiny model.

mod common;

use candle_core::{DType, IndexOp, Tensor};
use common::test_device;
use nano_medusa::core::kv_cache::KvCache;
use nano_medusa::model::{causal_bias, position_range};
use nano_medusa::speculative::{
    BranchSpec, CandidateGenerator, Candidates, TreeBuffers, TreeTopology, TreeVerifier,
};
use nano_medusa::{MedusaModel, ModelConfig, TinyMedusaLm};

const PROMPT: [u32; 5] = [3, 14, 15, 9, 26];
const TOLERANCE: f32 = 1e-4;

fn model() -> TinyMedusaLm {
    TinyMedusaLm::new(ModelConfig::default().seed(7), DType::F32, &test_device()).unwrap()
}

/// Causal forward of `tokens` after the committed prefix; commits the rows.
fn forward_causal(model: &TinyMedusaLm, cache: &mut KvCache, tokens: &[u32]) -> (Tensor, Tensor) {
    let device = test_device();
    let positions = position_range(cache.committed_len(), tokens.len(), &device).unwrap();
    let bias = causal_bias(tokens.len(), DType::F32, &device).unwrap();
    let input = model.prepare_inputs(tokens, &positions, &bias, cache).unwrap();
    let output = model.forward(&input, cache).unwrap();
    cache.commit_staged().unwrap();
    (output.logits, output.head_logits)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

/// Prefilled cache plus `[2, 2]` candidates proposed from the prefill.
fn prefilled(model: &TinyMedusaLm) -> (KvCache, TreeTopology, Candidates) {
    let mut cache = KvCache::new(model.kv_cache_config(), &test_device()).unwrap();
    let (logits, head_logits) = forward_causal(model, &mut cache, &PROMPT);

    let last = PROMPT.len() - 1;
    let topology = TreeTopology::new(&BranchSpec::from_top_k(&[2, 2]).unwrap());
    let candidates = CandidateGenerator::new(vec![2, 2])
        .unwrap()
        .generate(
            &head_logits.narrow(1, last, 1).unwrap(),
            &logits.narrow(0, last, 1).unwrap(),
            &topology,
        )
        .unwrap();
    (cache, topology, candidates)
}

#[test]
fn test_tree_logits_match_sequential_paths() {
    let model = model();
    let (cache, topology, candidates) = prefilled(&model);
    let buffers = TreeBuffers::new(&topology, DType::F32, &test_device()).unwrap();

    let mut tree_cache = cache.clone();
    let verification = TreeVerifier::new()
        .verify(&model, &candidates, &buffers, &mut tree_cache)
        .unwrap();

    assert_eq!(verification.node_logits.dims(), &[7, 64]);
    assert_eq!(verification.node_head_logits.dims(), &[3, 7, 64]);
    assert_eq!(verification.path_logits.dims(), &[4, 3, 64]);
    assert_eq!(tree_cache.committed_len(), PROMPT.len());

    for p in 0..topology.num_paths() {
        let mut path_cache = cache.clone();
        let (sequential, _) = forward_causal(&model, &mut path_cache, candidates.path(p));
        let tree = verification.path_logits.i(p).unwrap();

        let diff = max_abs_diff(&tree, &sequential);
        assert!(diff < TOLERANCE, "path {p} differs by {diff}");
    }
}

#[test]
fn test_committed_path_matches_full_recompute() {
    let model = model();
    let (mut cache, topology, candidates) = prefilled(&model);
    let buffers = TreeBuffers::new(&topology, DType::F32, &test_device()).unwrap();

    TreeVerifier::new()
        .verify(&model, &candidates, &buffers, &mut cache)
        .unwrap();
    // Keep the full last path, whose nodes are not a staged prefix.
    let best = topology.num_paths() - 1;
    cache.commit(topology.path(best)).unwrap();
    assert_eq!(cache.committed_len(), PROMPT.len() + 3);

    let next = 42u32;
    let (incremental, _) = forward_causal(&model, &mut cache, &[next]);

    let mut context = PROMPT.to_vec();
    context.extend_from_slice(candidates.path(best));
    context.push(next);
    let mut fresh = KvCache::new(model.kv_cache_config(), &test_device()).unwrap();
    let (full, _) = forward_causal(&model, &mut fresh, &context);
    let full_last = full.narrow(0, context.len() - 1, 1).unwrap();

    let diff = max_abs_diff(&incremental, &full_last);
    assert!(diff < TOLERANCE, "incremental step differs by {diff}");
}

#[test]
fn test_same_seed_same_logits() {
    let a = model();
    let b = model();
    let mut cache_a = KvCache::new(a.kv_cache_config(), &test_device()).unwrap();
    let mut cache_b = KvCache::new(b.kv_cache_config(), &test_device()).unwrap();

    let (logits_a, _) = forward_causal(&a, &mut cache_a, &PROMPT);
    let (logits_b, _) = forward_causal(&b, &mut cache_b, &PROMPT);
    assert_eq!(max_abs_diff(&logits_a, &logits_b), 0.0);
}
