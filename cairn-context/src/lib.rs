//! # cairn-context
//!
//! Text preparation shared by the indexing and retrieval paths: line-aligned chunking
//! with overlap ([`text`]) and approximate token counting for context budgets
//! ([`tokens`]).

pub mod text;
pub mod tokens;

pub use text::{TextChunk, TextChunker, chunk_text};
pub use tokens::{CharRatioEstimator, TokenEstimator, estimate_tokens};
