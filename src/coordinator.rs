// =============================================================================
// LeadCoordinator — per-symbol advisory synthesis
// =============================================================================
//
// Owns an ordered set of `IndependentAgent`s for one symbol. `start()`
// launches every agent without waiting for their first report, then — after
// a mandatory warmup — runs a fixed-interval decision cycle: collect latest
// reports, skip the cycle outright if fewer than two exist (the warmup is a
// first-cycle report-count gate, not a bare timer), summarize them, call
// the language model, and publish the parsed `Advisory`. Fusion rules are
// enforced by post-processing so a malformed or uncooperative model
// response can never produce a confident directional call.
//
// The coordinator is the sole writer of `latest`; readers (the `HotLoop`)
// only ever see a complete `Advisory`, never a torn one.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::agents::IndependentAgent;
use crate::llm::client::{ChatMessage, LlmClient};
use crate::types::{Action, Advisory, AgentReport, AgentVote, Signal};

const COORDINATOR_SYSTEM_PROMPT: &str = "You are the lead trading coordinator synthesizing several \
analyst reports into one actionable call for a perpetual-futures position. Weigh agreement across \
analysts over any single opinion. Respond with strict JSON only: {\"action\":\"long\"|\"short\"| \
\"hold\"|\"close\",\"confidence\":0..1,\"positionSizeHint\":0.005..0.05,\"stopLossPct\":number, \
\"takeProfitPct\":number,\"reasoning\":string}. No prose outside the JSON.";

const MIN_REPORTS_FOR_CYCLE: usize = 2;
const MIN_CONFIDENCE_OVERRIDE: f64 = 0.7;
const POSITION_SIZE_MIN: f64 = 0.005;
const POSITION_SIZE_MAX: f64 = 0.05;

pub struct LeadCoordinator {
    symbol: String,
    agents: Vec<Arc<IndependentAgent>>,
    warmup: Duration,
    interval: Duration,
    llm: LlmClient,
    latest: RwLock<Option<Advisory>>,
    advisory_tx: broadcast::Sender<Advisory>,
    stop_flag: Arc<AtomicBool>,
}

impl LeadCoordinator {
    pub fn new(symbol: impl Into<String>, warmup: Duration, interval: Duration, llm: LlmClient) -> Arc<Self> {
        let (advisory_tx, _rx) = broadcast::channel(16);
        Arc::new(Self {
            symbol: symbol.into(),
            agents: Vec::new(),
            warmup,
            interval,
            llm,
            latest: RwLock::new(None),
            advisory_tx,
            stop_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Register an agent before `start()`. The coordinator never mutates
    /// this set once the decision-cycle task has been spawned.
    pub fn with_agents(mut self: Arc<Self>, agents: Vec<Arc<IndependentAgent>>) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("with_agents called before any clone of the Arc exists")
            .agents = agents;
        self
    }

    pub fn latest_advisory(&self) -> Option<Advisory> {
        self.latest.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Advisory> {
        self.advisory_tx.subscribe()
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        for agent in &self.agents {
            agent.stop();
        }
    }

    /// Launch every agent (non-blocking) then, after the warmup delay,
    /// begin the fixed-interval decision cycle. Runs until `stop()`.
    pub async fn start(self: Arc<Self>) {
        info!(symbol = %self.symbol, agents = self.agents.len(), "coordinator started");

        for agent in &self.agents {
            tokio::spawn(agent.clone().start());
        }

        tokio::select! {
            _ = tokio::time::sleep(self.warmup) => {}
            _ = wait_for_stop(&self.stop_flag) => return,
        }

        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                break;
            }

            let cycle_start = tokio::time::Instant::now();
            self.run_cycle().await;

            let elapsed = cycle_start.elapsed();
            let remaining = self.interval.saturating_sub(elapsed);
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = wait_for_stop(&self.stop_flag) => break,
            }
        }

        info!(symbol = %self.symbol, "coordinator stopped");
    }

    async fn run_cycle(&self) {
        let reports: Vec<AgentReport> = self.agents.iter().filter_map(|a| a.latest_report()).collect();

        if reports.len() < MIN_REPORTS_FOR_CYCLE {
            return;
        }

        let summary = reports
            .iter()
            .map(|r| format!("{}: {} ({:.0}%) — {}", r.agent_name, signal_str(r.signal), r.confidence * 100.0, r.reasoning))
            .collect::<Vec<_>>()
            .join("\n");

        let messages = [ChatMessage::system(COORDINATOR_SYSTEM_PROMPT), ChatMessage::user(summary)];

        let advisory = match self.llm.chat_json(&messages, self.interval.saturating_sub(Duration::from_secs(2))).await {
            Ok(value) => parse_advisory(&value, &reports).unwrap_or_else(Advisory::hold_error),
            Err(err) => {
                warn!(symbol = %self.symbol, error = %err, "coordinator language-model call failed");
                Advisory::hold_error()
            }
        };

        {
            let mut latest = self.latest.write();
            *latest = Some(advisory.clone());
        }
        let _ = self.advisory_tx.send(advisory);
    }
}

fn signal_str(signal: Signal) -> &'static str {
    match signal {
        Signal::Bullish => "bullish",
        Signal::Bearish => "bearish",
        Signal::Neutral => "neutral",
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

/// Parse the model's structured response into an `Advisory`, applying the
/// fusion rules as post-processing: the action is demoted to
/// `hold` unless at least two reports agree on direction or any one report
/// exceeds `MIN_CONFIDENCE_OVERRIDE`, and `positionSizeHint` is clamped.
fn parse_advisory(value: &serde_json::Value, reports: &[AgentReport]) -> Option<Advisory> {
    let action = match value.get("action")?.as_str()? {
        "long" => Action::Long,
        "short" => Action::Short,
        "hold" => Action::Hold,
        "close" => Action::Close,
        _ => return None,
    };
    let confidence = value.get("confidence")?.as_f64()?.clamp(0.0, 1.0);
    let position_size_hint = value
        .get("positionSizeHint")
        .and_then(|v| v.as_f64())
        .unwrap_or(POSITION_SIZE_MIN)
        .clamp(POSITION_SIZE_MIN, POSITION_SIZE_MAX);
    let stop_loss_pct = value.get("stopLossPct").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let take_profit_pct = value.get("takeProfitPct").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let reasoning = value.get("reasoning").and_then(|v| v.as_str()).unwrap_or("").to_string();

    let agent_votes: Vec<AgentVote> = reports
        .iter()
        .map(|r| AgentVote { agent_name: r.agent_name.clone(), signal: r.signal, confidence: r.confidence })
        .collect();

    let action = if fusion_permits(action, reports) { action } else { Action::Hold };

    Some(Advisory {
        action,
        confidence,
        position_size_hint,
        stop_loss_pct,
        take_profit_pct,
        reasoning,
        generated_at: Utc::now(),
        agent_votes,
    })
}

/// At least two reports must agree with `action`'s directional signal, or
/// any single report must exceed `MIN_CONFIDENCE_OVERRIDE` in that
/// direction. `hold`/`close` always pass through unfiltered.
fn fusion_permits(action: Action, reports: &[AgentReport]) -> bool {
    let target = match action {
        Action::Long => Signal::Bullish,
        Action::Short => Signal::Bearish,
        Action::Hold | Action::Close => return true,
    };

    let agreeing = reports.iter().filter(|r| r.signal == target).count();
    if agreeing >= 2 {
        return true;
    }
    reports.iter().any(|r| r.signal == target && r.confidence > MIN_CONFIDENCE_OVERRIDE)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentRole;
    use serde_json::json;

    fn report(name: &str, signal: Signal, confidence: f64) -> AgentReport {
        AgentReport {
            agent_name: name.to_string(),
            role: AgentRole::Technical,
            timestamp: Utc::now(),
            signal,
            confidence,
            reasoning: "x".to_string(),
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn two_agreeing_reports_permit_directional_action() {
        let reports = vec![report("a", Signal::Bullish, 0.6), report("b", Signal::Bullish, 0.55)];
        assert!(fusion_permits(Action::Long, &reports));
    }

    #[test]
    fn single_low_confidence_report_does_not_permit_directional_action() {
        let reports = vec![report("a", Signal::Bullish, 0.6), report("b", Signal::Neutral, 0.5)];
        assert!(!fusion_permits(Action::Long, &reports));
    }

    #[test]
    fn single_high_confidence_report_permits_directional_action() {
        let reports = vec![report("a", Signal::Bullish, 0.85), report("b", Signal::Neutral, 0.5)];
        assert!(fusion_permits(Action::Long, &reports));
    }

    #[test]
    fn malformed_action_becomes_none_and_caller_falls_back_to_hold() {
        let value = json!({"action": "sideways", "confidence": 0.5});
        let reports = vec![report("a", Signal::Bullish, 0.9)];
        assert!(parse_advisory(&value, &reports).is_none());
    }

    #[test]
    fn weak_consensus_is_demoted_to_hold() {
        let value = json!({"action": "long", "confidence": 0.6, "positionSizeHint": 0.03});
        let reports = vec![report("a", Signal::Bullish, 0.6), report("b", Signal::Neutral, 0.5)];
        let advisory = parse_advisory(&value, &reports).unwrap();
        assert_eq!(advisory.action, Action::Hold);
    }

    #[test]
    fn position_size_hint_is_clamped() {
        let value = json!({"action": "hold", "confidence": 0.5, "positionSizeHint": 10.0});
        let advisory = parse_advisory(&value, &[]).unwrap();
        assert!((advisory.position_size_hint - POSITION_SIZE_MAX).abs() < 1e-9);
    }

    /// Three agents in open disagreement (spec scenario 5): bullish/0.6,
    /// bearish/0.55, neutral/0.5 satisfies neither fusion condition (no pair
    /// agrees, nobody clears 0.7), so a model that still answers "long" gets
    /// demoted to hold regardless of its own stated confidence.
    #[test]
    fn scenario_two_agents_insufficient_agreement_demotes_to_hold() {
        let reports = vec![
            report("a", Signal::Bullish, 0.6),
            report("b", Signal::Bearish, 0.55),
            report("c", Signal::Neutral, 0.5),
        ];
        assert!(!fusion_permits(Action::Long, &reports));

        let value = json!({"action": "long", "confidence": 0.5, "positionSizeHint": 0.02});
        let advisory = parse_advisory(&value, &reports).unwrap();
        assert_eq!(advisory.action, Action::Hold);
        assert!(advisory.confidence <= 0.5);
    }
}
