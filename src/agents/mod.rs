// =============================================================================
// Agents Module
// =============================================================================
//
// `role` holds the per-`AgentRole` system prompt and input-gathering logic
//. `independent_agent` is the fixed-interval worker loop that
// drives each role to a stored `AgentReport`.

pub mod independent_agent;
pub mod role;

pub use independent_agent::IndependentAgent;
