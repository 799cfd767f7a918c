//! Human-in-the-loop gate for anti-automation challenges.
//!
//! When a worker detects a challenge on the page it is rendering, it parks
//! on the gate until an operator answers. The block is local to that one
//! worker: the gate holds no store lock, and other workers keep heartbeating
//! while the operator decides.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Page markers that indicate an anti-automation challenge is being shown.
pub const DEFAULT_INDICATORS: &[&str] = &[
    "captcha",
    "recaptcha",
    "hcaptcha",
    "are you a robot",
    "verify you are human",
    "unusual traffic",
];

/// The three answers an operator can give.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaDecision {
    /// Challenge solved by hand; the worker resumes where it stopped.
    Solved,
    /// Abandon the current item and move on.
    Skip,
    /// Abandon the whole run via the cooperative stop flag.
    Cancel,
}

/// A pending challenge handed to the operator channel. Answer it by sending
/// a decision through `responder`.
#[derive(Debug)]
pub struct Challenge {
    pub job_id: String,
    pub portal: String,
    pub detail: String,
    pub responder: oneshot::Sender<CaptchaDecision>,
}

/// Worker-side handle. Detection is substring matching against the rendered
/// page; the decision point is an async wait on the operator's answer.
#[derive(Clone)]
pub struct CaptchaGate {
    indicators: Vec<String>,
    operator: mpsc::UnboundedSender<Challenge>,
    stop_flag: Arc<AtomicBool>,
}

impl CaptchaGate {
    /// Build a gate bound to the given cooperative stop flag. Returns the
    /// gate and the channel the operator UI drains.
    pub fn new(stop_flag: Arc<AtomicBool>) -> (Self, mpsc::UnboundedReceiver<Challenge>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Self {
            indicators: DEFAULT_INDICATORS.iter().map(|s| s.to_string()).collect(),
            operator: tx,
            stop_flag,
        };
        (gate, rx)
    }

    pub fn with_indicators(mut self, indicators: Vec<String>) -> Self {
        self.indicators = indicators;
        self
    }

    /// True if any known challenge indicator appears in the page content.
    pub fn detect(&self, page_content: &str) -> bool {
        let haystack = page_content.to_lowercase();
        self.indicators.iter().any(|i| haystack.contains(i.as_str()))
    }

    /// Park the calling worker until the operator decides. `Cancel` also
    /// raises the shared stop flag. A closed operator channel (headless or
    /// shut-down coordinator) degrades to `Skip` so the run keeps moving.
    pub async fn request_decision(
        &self,
        job_id: &str,
        portal: &str,
        detail: &str,
    ) -> CaptchaDecision {
        let (tx, rx) = oneshot::channel();
        let challenge = Challenge {
            job_id: job_id.to_string(),
            portal: portal.to_string(),
            detail: detail.to_string(),
            responder: tx,
        };
        if self.operator.send(challenge).is_err() {
            warn!(job_id, portal, "No operator attached; skipping item after challenge");
            return CaptchaDecision::Skip;
        }
        info!(job_id, portal, "Challenge detected; waiting for operator");

        let decision = rx.await.unwrap_or(CaptchaDecision::Skip);
        if decision == CaptchaDecision::Cancel {
            self.stop_flag.store(true, Ordering::SeqCst);
        }
        decision
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }
}
