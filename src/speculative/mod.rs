//! Medusa tree speculative decoding.
//!
//! Medusa heads sit on top of the base model and each predict one token
//! further ahead. Their top-k guesses form a candidate tree that the base
//! model verifies in a single forward pass.
//!
//! ## One step
//!
//! ```text
//! seed logits ──► CandidateGenerator ──► Candidates
//!                                           │
//!                          TreeVerifier ◄───┘  (one forward pass, tree bias)
//!                                │
//!                         path logits ──► PosteriorEvaluator ──► best path, accept length
//!                                                                      │
//!                     InferenceStateUpdater ◄──────────────────────────┘
//!                        │  append accepted tokens, commit cache rows
//!                        └──► seed logits for the next step
//! ```
//!
//! ## Example
//!
//! ```text
//! top-k [2, 2]  ->  BranchSpec [1, 2, 2]  ->  7 nodes, 4 paths
//!
//! root "the" ── "cat" ── "sat"   accepted: "the cat sat"
//!           │        └── "is"
//!           └── "dog" ── ...
//! ```

pub mod candidates;
pub mod config;
pub mod posterior;
pub mod topology;
pub mod update;
pub mod verifier;

pub use candidates::{CandidateGenerator, Candidates};
pub use config::MedusaConfig;
pub use posterior::{AcceptanceResult, PosteriorEvaluator};
pub use topology::{BranchSpec, TreeBuffers, TreeTopology};
pub use update::{InferenceStateUpdater, StepSeed, StepUpdate};
pub use verifier::{TreeVerifier, Verification};
