//! Control signals and the merged engine inbox.
//!
//! Two kinds of producers feed one bounded crossbeam channel: control
//! producers (keyboard listener, Ctrl-C handler) through a [`Controller`], and
//! the reader thread of the active agent process through an [`AgentSink`].
//! The engine owns the [`Mailbox`] and only looks at it at suspension points:
//!
//! - before each step ([`Mailbox::drain_controls`], [`Mailbox::wait_control`]);
//! - at each agent output read ([`Mailbox::next_agent`]), where only `Stop` is
//!   acted on and every other signal is deferred to the next step boundary.
//!
//! Order is preserved per producer. Interleaving across producers is whatever
//! the channel saw first and is not deterministic.

use std::collections::VecDeque;

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", content = "prompt", rename_all = "snake_case")]
pub enum ControlSignal {
    Pause,
    Resume,
    /// Replace the prompt of the next agent step.
    ManualOverride(String),
    Stop,
}

/// One item from an agent process's stdout reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentItem {
    Line(String),
    /// stdout closed (or failed to read).
    Eof,
}

#[derive(Debug)]
enum Inbound {
    Control(ControlSignal),
    Agent { invocation: u64, item: AgentItem },
}

/// Result of waiting for agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRead {
    Item(AgentItem),
    Stop,
}

/// Cloneable producer handle for control signals.
#[derive(Debug, Clone)]
pub struct Controller {
    tx: Sender<Inbound>,
}

impl Controller {
    /// Enqueue a signal. Returns false once the engine has gone away.
    pub fn send(&self, signal: ControlSignal) -> bool {
        self.tx.send(Inbound::Control(signal)).is_ok()
    }

    pub fn pause(&self) -> bool {
        self.send(ControlSignal::Pause)
    }

    pub fn resume(&self) -> bool {
        self.send(ControlSignal::Resume)
    }

    pub fn stop(&self) -> bool {
        self.send(ControlSignal::Stop)
    }

    pub fn manual_override(&self, prompt: impl Into<String>) -> bool {
        self.send(ControlSignal::ManualOverride(prompt.into()))
    }
}

/// Producer handle for one agent invocation's stdout reader.
#[derive(Debug, Clone)]
pub struct AgentSink {
    tx: Sender<Inbound>,
    invocation: u64,
}

impl AgentSink {
    pub fn invocation(&self) -> u64 {
        self.invocation
    }

    /// Blocks while the queue is full. Returns false once the engine has gone away.
    pub fn send(&self, item: AgentItem) -> bool {
        self.tx
            .send(Inbound::Agent {
                invocation: self.invocation,
                item,
            })
            .is_ok()
    }
}

/// Engine-side consumer of the merged queue.
pub struct Mailbox {
    rx: Receiver<Inbound>,
    tx: Sender<Inbound>,
    capacity: usize,
    controls: VecDeque<ControlSignal>,
    agent_backlog: VecDeque<AgentItem>,
    current_invocation: Option<u64>,
    next_invocation: u64,
    stop_pending: bool,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            rx,
            tx,
            capacity,
            controls: VecDeque::new(),
            agent_backlog: VecDeque::new(),
            current_invocation: None,
            next_invocation: 1,
            stop_pending: false,
        }
    }

    pub fn controller(&self) -> Controller {
        Controller {
            tx: self.tx.clone(),
        }
    }

    /// Start a new agent invocation. Output of earlier invocations is discarded
    /// from now on.
    pub fn begin_agent(&mut self) -> AgentSink {
        let invocation = self.next_invocation;
        self.next_invocation += 1;
        self.current_invocation = Some(invocation);
        self.agent_backlog.clear();
        AgentSink {
            tx: self.tx.clone(),
            invocation,
        }
    }

    /// Stop accepting output from the current invocation.
    pub fn end_agent(&mut self) {
        self.current_invocation = None;
        self.agent_backlog.clear();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_pending
    }

    /// Step-boundary check: every control signal received so far, without
    /// blocking. A pending `Stop` supersedes everything else.
    pub fn drain_controls(&mut self) -> Vec<ControlSignal> {
        self.drain_ready();
        if self.stop_pending {
            self.controls.clear();
            return vec![ControlSignal::Stop];
        }
        self.controls.drain(..).collect()
    }

    /// Block until the next control signal (used while paused).
    pub fn wait_control(&mut self) -> ControlSignal {
        loop {
            if self.stop_pending {
                self.controls.clear();
                return ControlSignal::Stop;
            }
            if let Some(signal) = self.controls.pop_front() {
                return signal;
            }
            self.receive_blocking();
        }
    }

    /// Agent-read suspension point: the next output item of the current
    /// invocation, or `Stop` if one is pending.
    pub fn next_agent(&mut self) -> AgentRead {
        loop {
            self.drain_ready();
            if self.stop_pending {
                return AgentRead::Stop;
            }
            if let Some(item) = self.agent_backlog.pop_front() {
                return AgentRead::Item(item);
            }
            if self.current_invocation.is_none() {
                return AgentRead::Item(AgentItem::Eof);
            }
            self.receive_blocking();
        }
    }

    fn drain_ready(&mut self) {
        while self.agent_backlog.len() < self.capacity {
            match self.rx.try_recv() {
                Ok(msg) => self.absorb(msg),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    fn receive_blocking(&mut self) {
        // The mailbox holds its own sender, so the channel never disconnects.
        if let Ok(msg) = self.rx.recv() {
            self.absorb(msg);
        }
    }

    fn absorb(&mut self, msg: Inbound) {
        match msg {
            Inbound::Control(ControlSignal::Stop) => {
                debug!("stop signal received");
                self.stop_pending = true;
            }
            Inbound::Control(signal) => self.controls.push_back(signal),
            Inbound::Agent { invocation, item } => {
                if Some(invocation) == self.current_invocation {
                    self.agent_backlog.push_back(item);
                }
            }
        }
    }
}
