//! # Poolwise Agent - Memory-Driven LP Yield Engine
//!
//! ## Purpose
//!
//! Autonomous agent that continuously observes a DEX liquidity-pool market,
//! learns behavioral patterns from observation, and makes rebalance and
//! compound decisions on held positions to maximize risk-adjusted yield.
//! The core is a stateful, scheduled cognitive loop: scan the pool universe
//! through the market-data gateway, maintain per-pool behavioral profiles
//! and a semantic memory store, promote recurring observations into
//! patterns, and, once enough confident patterns exist, act on them.
//!
//! ## Integration Points
//!
//! - **Input Sources**: MarketProvider (pool search, metrics, gas quotes),
//!   Executor (position snapshots)
//! - **Output Destinations**: DecisionStream for observers, Executor for
//!   planned actions, DocStore for every persisted record
//! - **State Management**: PoolProfileStore and PatternEngine, in-process;
//!   MemoryStore over the VectorIndex/DocStore ports
//! - **Cost Control**: CostGovernor with a hard daily ceiling; emergency
//!   mode doubles the tick period and bypasses the language model
//! - **Control Plane**: one-shot commands (pause, resume, force_trade,
//!   force_observe, emergency_stop) applied at cycle boundaries
//!
//! ## Architecture Role
//!
//! ```text
//! Scheduler → [Cognitive Loop] → (Gateway → Price Cache)
//!                  ↓                       ↓
//!           Profile Store ← metrics ← Pool Universe
//!                  ↓
//!           Memory Store → Pattern Engine → Rebalancer → Decision
//!                  ↑                                        ↓
//!                  └────────── Outcome ←──── Executor ──────┘
//! ```
//!
//! The loop runs one cycle to completion before the next is considered;
//! all suspension points sit at collaborator calls.

pub mod circuit_breaker;
pub mod cognition;
pub mod control;
pub mod gateway;
pub mod governor;
pub mod memory_store;
pub mod patterns;
pub mod ports;
pub mod price_cache;
pub mod profile;
pub mod rebalancer;
pub mod scheduler;
pub mod service;
pub mod sim;
pub mod stream;

pub use cognition::CognitiveLoop;
pub use control::{AgentSnapshot, ControlCommand, ControlRequest};
pub use gateway::MarketDataGateway;
pub use governor::{CostCategory, CostGovernor, GovernorMode};
pub use memory_store::MemoryStore;
pub use patterns::PatternEngine;
pub use ports::{
    Clock, DocFilter, DocStore, Executor, LanguageModel, MarketProvider, RecallFilter,
    VectorHit, VectorIndex,
};
pub use price_cache::PriceCache;
pub use profile::{PoolProfile, PoolProfileStore};
pub use rebalancer::{DecisionContext, Rebalancer};
pub use scheduler::{Scheduler, TickOutcome};
pub use service::{AgentHandle, AgentService, Collaborators};
pub use stream::DecisionStream;

/// Re-export key types.
pub use types::{AgentError, Decision, DecisionType, Outcome, PoolMetric, Result};
