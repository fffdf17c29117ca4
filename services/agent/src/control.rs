//! Control input and state query
//!
//! One-shot commands arrive as JSON (`{"command": "pause", "reason": ...}`)
//! and are applied by the cognitive loop at the start of its next cycle.
//! The state query returns a consistent snapshot assembled at cycle
//! boundaries; readers never see a half-updated record.

use serde::{Deserialize, Serialize};

use types::{AgentState, CycleRecord, Decision, Pattern};

/// One-shot control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Pause,
    Resume,
    ForceTrade,
    ForceObserve,
    EmergencyStop,
}

/// Wire form of a control request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub command: ControlCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ControlRequest {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Consistent snapshot served to external observers.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub state: AgentState,
    pub last_cycle: Option<CycleRecord>,
    pub recent_decisions: Vec<Decision>,
    pub active_patterns: Vec<Pattern>,
    pub spent_today_usd: rust_decimal::Decimal,
}
