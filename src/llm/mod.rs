// =============================================================================
// Language-Model Client Module
// =============================================================================
//
// `client` is a thin reqwest-backed HTTP client that every `IndependentAgent`
// and the `LeadCoordinator` call to turn structured local data into a
// structured advisory or report. The hot path (`hot_loop`) never imports
// this module — the tick loop performs zero language-model calls.

pub mod client;

pub use client::{ChatMessage, LlmClient};
