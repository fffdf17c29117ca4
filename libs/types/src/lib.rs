//! # Poolwise Unified Types Library
//!
//! Single type system shared by every Poolwise crate: market-data records,
//! behavioral profiles, memories, patterns, decisions, and agent state.
//!
//! ## Design Philosophy
//!
//! - **No Precision Loss**: every USD, APR, and gas value is a `rust_decimal::Decimal`;
//!   floating point appears only in derived statistics (volatility, correlation,
//!   confidence) where exactness is not load-bearing.
//! - **Structured Records**: metrics, memories, and decisions are concrete structs,
//!   not string-keyed maps. The only open-ended field is `MemoryMetadata::extra`,
//!   which carries declared size and serialization rules.
//! - **Closed Vocabularies**: memory categories, decision types, emotional states,
//!   and error kinds are enums; behavioral coupling flows through match arms and
//!   a single threshold-multiplier table, never through string comparison.
//! - **Explicit Errors**: every fallible operation returns [`AgentError`], whose
//!   variants map one-to-one onto the retry/surface policy of the runtime.

pub mod decision;
pub mod error;
pub mod market;
pub mod memory;
pub mod pattern;
pub mod position;
pub mod state;
pub mod storage;

pub use decision::{Decision, DecisionType, Outcome, OutcomeStatus};
pub use error::{AgentError, Result};
pub use market::{GasQuote, PoolId, PoolMetric, PoolRef, SwapQuote, TokenId, TokenPair};
pub use memory::{Memory, MemoryCategory, MemoryMetadata, MemoryType, MAX_METADATA_BYTES};
pub use pattern::Pattern;
pub use position::Position;
pub use state::{AgentMode, AgentState, CycleRecord, EmotionalState, ThresholdAdjustment};
