// =============================================================================
// IndependentAgent — one role-specialized worker
// =============================================================================
//
// Fixed-interval, non-overlapping analysis cycles: first cycle fires
// immediately on `start()`; the interval is measured cycle-start to
// cycle-start, and because each cycle runs to completion inside the same
// task before the next is scheduled, overlapping cycles cannot occur. No
// error — transport, parse, or timeout — ever escapes `run_cycle`; every
// path that can fail degrades to `AgentReport::neutral_error`.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::agents::role::{gather_predigest, system_prompt};
use crate::exchange::client::ExchangeClient;
use crate::llm::client::{ChatMessage, LlmClient};
use crate::types::{AgentReport, AgentRole, Signal};

/// Timeout headroom subtracted from the agent interval for the
/// language-model call: timeout = agent-interval - 2s.
const TIMEOUT_HEADROOM: Duration = Duration::from_secs(2);

pub struct IndependentAgent {
    name: String,
    role: AgentRole,
    symbol: String,
    interval: Duration,
    exchange: Arc<ExchangeClient>,
    llm: LlmClient,
    latest: RwLock<Option<AgentReport>>,
    report_tx: broadcast::Sender<AgentReport>,
    stop_flag: Arc<AtomicBool>,
}

impl IndependentAgent {
    pub fn new(
        name: impl Into<String>,
        role: AgentRole,
        symbol: impl Into<String>,
        interval: Duration,
        exchange: Arc<ExchangeClient>,
        llm: LlmClient,
    ) -> Arc<Self> {
        let (report_tx, _rx) = broadcast::channel(16);
        Arc::new(Self {
            name: name.into(),
            role,
            symbol: symbol.into(),
            interval,
            exchange,
            llm,
            latest: RwLock::new(None),
            report_tx,
            stop_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    /// The most recently stored report, if any cycle has completed yet.
    pub fn latest_report(&self) -> Option<AgentReport> {
        self.latest.read().clone()
    }

    /// Subscribe to the `report` event stream. Cold-start subscribers see
    /// only reports emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentReport> {
        self.report_tx.subscribe()
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// Run the fixed-interval analysis loop until `stop()` is called.
    /// Intended to be spawned as its own task by the `LeadCoordinator`.
    pub async fn start(self: Arc<Self>) {
        info!(agent = %self.name, role = %self.role, symbol = %self.symbol, "agent started");

        // First cycle runs immediately.
        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                break;
            }

            let cycle_start = tokio::time::Instant::now();
            let report = self.run_cycle().await;

            {
                let mut latest = self.latest.write();
                *latest = Some(report.clone());
            }
            let _ = self.report_tx.send(report);

            let elapsed = cycle_start.elapsed();
            let remaining = self.interval.saturating_sub(elapsed);
            if remaining.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = wait_for_stop(&self.stop_flag) => break,
            }
        }

        info!(agent = %self.name, "agent stopped");
    }

    async fn run_cycle(&self) -> AgentReport {
        let timeout = self.interval.saturating_sub(TIMEOUT_HEADROOM).max(Duration::from_secs(1));

        let predigest = match gather_predigest(self.role, &self.symbol, &self.exchange).await {
            Ok(v) => v,
            Err(err) => {
                warn!(agent = %self.name, error = %err, "input gathering failed — neutral report");
                return AgentReport::neutral_error(&self.name, self.role);
            }
        };

        let messages = [
            ChatMessage::system(system_prompt(self.role)),
            ChatMessage::user(predigest.to_string()),
        ];

        let response = match self.llm.chat_json(&messages, timeout).await {
            Ok(v) => v,
            Err(err) => {
                warn!(agent = %self.name, error = %err, "language-model call failed — neutral report");
                return AgentReport::neutral_error(&self.name, self.role);
            }
        };

        match parse_report(&self.name, self.role, &response) {
            Some(report) => report,
            None => {
                warn!(agent = %self.name, response = %response, "malformed model response — neutral report");
                AgentReport::neutral_error(&self.name, self.role)
            }
        }
    }
}

async fn wait_for_stop(flag: &AtomicBool) {
    loop {
        if flag.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Parse a `{signal, confidence, reasoning, data}` structured response into
/// an `AgentReport`. Returns `None` on any missing/malformed field so the
/// caller can fall back to a neutral report.
fn parse_report(agent_name: &str, role: AgentRole, value: &serde_json::Value) -> Option<AgentReport> {
    let signal = match value.get("signal")?.as_str()? {
        "bullish" => Signal::Bullish,
        "bearish" => Signal::Bearish,
        "neutral" => Signal::Neutral,
        _ => return None,
    };
    let confidence = value.get("confidence")?.as_f64()?;
    if !(0.0..=1.0).contains(&confidence) {
        return None;
    }
    let reasoning = value.get("reasoning").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let payload = value.get("data").cloned().unwrap_or(serde_json::Value::Null);

    Some(AgentReport {
        agent_name: agent_name.to_string(),
        role,
        timestamp: Utc::now(),
        signal,
        confidence,
        reasoning,
        payload,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_well_formed_response() {
        let value = json!({"signal": "bullish", "confidence": 0.8, "reasoning": "strong momentum", "data": {"rsi": 65}});
        let report = parse_report("agent-1", AgentRole::Technical, &value).unwrap();
        assert_eq!(report.signal, Signal::Bullish);
        assert!((report.confidence - 0.8).abs() < 1e-9);
        assert_eq!(report.reasoning, "strong momentum");
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let value = json!({"signal": "bullish", "confidence": 1.5, "reasoning": "x"});
        assert!(parse_report("agent-1", AgentRole::Technical, &value).is_none());
    }

    #[test]
    fn rejects_unknown_signal() {
        let value = json!({"signal": "sideways", "confidence": 0.5, "reasoning": "x"});
        assert!(parse_report("agent-1", AgentRole::Technical, &value).is_none());
    }

    #[test]
    fn missing_fields_yield_none() {
        let value = json!({"confidence": 0.5});
        assert!(parse_report("agent-1", AgentRole::Technical, &value).is_none());
    }

    #[test]
    fn neutral_error_report_matches_spec_fallback() {
        let report = AgentReport::neutral_error("agent-1", AgentRole::Risk);
        assert_eq!(report.signal, Signal::Neutral);
        assert!((report.confidence - 0.5).abs() < 1e-9);
        assert_eq!(report.reasoning, "error");
    }
}
