//! Engine events and the non-blocking path to renderers.
//!
//! The engine emits [`EngineEvent`]s through an [`EventLog`]; a renderer
//! thread consumes them and fans each one out to every [`Renderer`]. The
//! engine is never blocked by presentation: when the bounded channel is full,
//! UI-only events are coalesced (text) or dropped (tool calls, context
//! updates), and every other event is parked in an overflow queue that is
//! flushed, in order, before anything newer is sent.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::plan::Progress;
use crate::core::types::{ChangeEntry, ExecutionResult};
use crate::core::workflow::StepKind;

/// Text kept per coalesced overflow delta; anything beyond is dropped.
const COALESCE_LIMIT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        plan: PathBuf,
        title: String,
        workflow: String,
        working_dir: PathBuf,
        progress: Progress,
    },
    PhaseStarted {
        iteration: usize,
        phase_number: u32,
        phase_title: String,
        progress: Progress,
    },
    StepStarted {
        iteration: usize,
        step: String,
        kind: StepKind,
        position: usize,
        total: usize,
    },
    TextDelta {
        step: String,
        text: String,
    },
    ToolCall {
        step: String,
        name: String,
        summary: Option<String>,
    },
    ContextUpdate {
        used: u64,
        limit: u64,
        percent: u8,
    },
    StepResult {
        iteration: usize,
        result: ExecutionResult,
    },
    PauseChanged {
        paused: bool,
    },
    OverrideQueued {
        prompt: String,
    },
    ChangedFiles {
        files: Vec<ChangeEntry>,
    },
    Committed {
        message: String,
        pushed: bool,
    },
    Warning {
        message: String,
    },
    PhaseFinished {
        iteration: usize,
        progress: Progress,
    },
    RunFinished {
        state: String,
        progress: Option<Progress>,
        detail: Option<String>,
    },
}

impl EngineEvent {
    /// Events that only feed live display and may be lost under pressure.
    fn is_droppable(&self) -> bool {
        matches!(self, Self::ToolCall { .. } | Self::ContextUpdate { .. })
    }
}

/// A consumer of engine events, run on the renderer thread.
pub trait Renderer: Send {
    fn render(&mut self, event: &EngineEvent) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Delivery counters reported when the log is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub sent: u64,
    pub coalesced: u64,
    pub dropped: u64,
}

/// Producer side of the engine → renderer channel.
pub struct EventLog {
    tx: Option<Sender<EngineEvent>>,
    overflow: VecDeque<EngineEvent>,
    stats: EventStats,
    worker: Option<JoinHandle<()>>,
}

impl EventLog {
    /// Spawn a renderer thread feeding every renderer in order.
    pub fn spawn(capacity: usize, mut renderers: Vec<Box<dyn Renderer>>) -> Self {
        let (tx, rx) = bounded::<EngineEvent>(capacity.max(1));
        let worker = thread::spawn(move || {
            let mut failed = vec![false; renderers.len()];
            for event in rx {
                for (idx, renderer) in renderers.iter_mut().enumerate() {
                    if failed[idx] {
                        continue;
                    }
                    if let Err(err) = renderer.render(&event) {
                        warn!(err = %err, "renderer failed, disabling it");
                        failed[idx] = true;
                    }
                }
            }
            for renderer in &mut renderers {
                if let Err(err) = renderer.finish() {
                    warn!(err = %err, "renderer finish failed");
                }
            }
        });
        Self {
            tx: Some(tx),
            overflow: VecDeque::new(),
            stats: EventStats::default(),
            worker: Some(worker),
        }
    }

    /// A log without a renderer thread; the caller reads the receiver.
    pub fn channel(capacity: usize) -> (Self, Receiver<EngineEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                overflow: VecDeque::new(),
                stats: EventStats::default(),
                worker: None,
            },
            rx,
        )
    }

    /// Hand an event to the renderers without blocking.
    pub fn emit(&mut self, event: EngineEvent) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        Self::flush_overflow(tx, &mut self.overflow, &mut self.stats);
        if !self.overflow.is_empty() {
            self.park(event);
            return;
        }
        match tx.try_send(event) {
            Ok(()) => self.stats.sent += 1,
            Err(TrySendError::Full(event)) => self.park(event),
            Err(TrySendError::Disconnected(_)) => {
                debug!("renderer gone, disabling event log");
                self.tx = None;
            }
        }
    }

    pub fn stats(&self) -> EventStats {
        self.stats
    }

    /// Deliver everything still parked, close the channel and wait for the
    /// renderer thread to finish.
    pub fn close(mut self) -> EventStats {
        if let Some(tx) = self.tx.take() {
            while let Some(event) = self.overflow.pop_front() {
                if tx.send(event).is_err() {
                    break;
                }
                self.stats.sent += 1;
            }
        }
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("renderer thread panicked");
        }
        if self.stats.dropped > 0 || self.stats.coalesced > 0 {
            debug!(
                dropped = self.stats.dropped,
                coalesced = self.stats.coalesced,
                "event log pressure"
            );
        }
        self.stats
    }

    fn park(&mut self, event: EngineEvent) {
        if event.is_droppable() {
            self.stats.dropped += 1;
            return;
        }
        if let EngineEvent::TextDelta { step, text } = event {
            if let Some(EngineEvent::TextDelta {
                step: last_step,
                text: last_text,
            }) = self.overflow.back_mut()
                && *last_step == step
            {
                if last_text.len() + text.len() <= COALESCE_LIMIT_BYTES {
                    last_text.push_str(&text);
                    self.stats.coalesced += 1;
                } else {
                    self.stats.dropped += 1;
                }
                return;
            }
            self.overflow.push_back(EngineEvent::TextDelta { step, text });
            return;
        }
        self.overflow.push_back(event);
    }

    fn flush_overflow(
        tx: &Sender<EngineEvent>,
        overflow: &mut VecDeque<EngineEvent>,
        stats: &mut EventStats,
    ) {
        while let Some(event) = overflow.pop_front() {
            match tx.try_send(event) {
                Ok(()) => stats.sent += 1,
                Err(TrySendError::Full(event)) => {
                    overflow.push_front(event);
                    return;
                }
                Err(TrySendError::Disconnected(_)) => {
                    overflow.clear();
                    return;
                }
            }
        }
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
