//! Per-run agent session bookkeeping.

use serde::Serialize;

/// Context meter and control flags for the agent conversation.
///
/// Owned by the engine. Control producers never touch it directly; their
/// signals are applied by the engine at suspension points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    context_tokens_used: u64,
    context_limit: u64,
    limit_warned: bool,
    pub paused: bool,
    pending_override: Option<String>,
    session_id: Option<String>,
}

impl SessionState {
    pub fn new(context_limit: u64) -> Self {
        Self {
            context_tokens_used: 0,
            context_limit,
            limit_warned: false,
            paused: false,
            pending_override: None,
            session_id: None,
        }
    }

    pub fn context_tokens_used(&self) -> u64 {
        self.context_tokens_used
    }

    pub fn context_limit(&self) -> u64 {
        self.context_limit
    }

    /// Record a usage report. The meter never decreases.
    ///
    /// Returns true the first time the meter reaches the context limit.
    pub fn record_usage(&mut self, context_tokens: u64) -> bool {
        self.context_tokens_used = self.context_tokens_used.max(context_tokens);
        if !self.limit_warned && self.context_tokens_used >= self.context_limit {
            self.limit_warned = true;
            return true;
        }
        false
    }

    /// Percentage of the context limit in use, capped at 100.
    pub fn context_percent(&self) -> u8 {
        if self.context_limit == 0 {
            return 100;
        }
        ((self.context_tokens_used.saturating_mul(100) / self.context_limit).min(100)) as u8
    }

    /// Forget the conversation: zero the meter and drop the session id.
    pub fn clear(&mut self) {
        self.context_tokens_used = 0;
        self.limit_warned = false;
        self.session_id = None;
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn set_session_id(&mut self, id: impl Into<String>) {
        self.session_id = Some(id.into());
    }

    /// Queue a prompt for the next agent step, replacing any earlier one.
    pub fn queue_override(&mut self, prompt: String) {
        self.pending_override = Some(prompt);
    }

    /// Consume the queued override.
    pub fn take_override(&mut self) -> Option<String> {
        self.pending_override.take()
    }
}
