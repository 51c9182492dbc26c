//! Control-input producers: the interactive keyboard listener and the
//! headless Ctrl-C handler.
//!
//! Both only enqueue [`ControlSignal`]s through a [`Controller`]; neither ever
//! touches engine state.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::{debug, warn};

use crate::control::{ControlSignal, Controller};
use crate::exit_codes;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a key press asks the listener to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    Signal(ControlSignal),
    /// Text to echo while a manual prompt is being typed.
    Echo(String),
}

/// Key handling without a terminal.
///
/// `p` pauses, `c` resumes, `q` or Ctrl-C stops. `m` pauses and starts a
/// manual prompt: Enter submits it (override, then resume), Esc abandons it
/// (resume only).
#[derive(Debug, Default)]
pub struct KeyInput {
    editing: Option<String>,
}

impl KeyInput {
    pub fn is_editing(&self) -> bool {
        self.editing.is_some()
    }

    pub fn on_key(&mut self, key: KeyEvent) -> Vec<KeyAction> {
        if key.kind == KeyEventKind::Release {
            return Vec::new();
        }
        let ctrl_c = key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c');
        if ctrl_c {
            self.editing = None;
            return vec![KeyAction::Signal(ControlSignal::Stop)];
        }

        let Some(buffer) = self.editing.as_mut() else {
            return match key.code {
                KeyCode::Char('p') => vec![KeyAction::Signal(ControlSignal::Pause)],
                KeyCode::Char('c') => vec![KeyAction::Signal(ControlSignal::Resume)],
                KeyCode::Char('q') => vec![KeyAction::Signal(ControlSignal::Stop)],
                KeyCode::Char('m') => {
                    self.editing = Some(String::new());
                    vec![
                        KeyAction::Signal(ControlSignal::Pause),
                        KeyAction::Echo("\r\nmanual prompt> ".to_string()),
                    ]
                }
                _ => Vec::new(),
            };
        };

        match key.code {
            KeyCode::Enter => {
                let prompt = buffer.trim().to_string();
                self.editing = None;
                let mut actions = vec![KeyAction::Echo("\r\n".to_string())];
                if !prompt.is_empty() {
                    actions.push(KeyAction::Signal(ControlSignal::ManualOverride(prompt)));
                }
                actions.push(KeyAction::Signal(ControlSignal::Resume));
                actions
            }
            KeyCode::Esc => {
                self.editing = None;
                vec![
                    KeyAction::Echo(" (cancelled)\r\n".to_string()),
                    KeyAction::Signal(ControlSignal::Resume),
                ]
            }
            KeyCode::Backspace => {
                if buffer.pop().is_some() {
                    vec![KeyAction::Echo("\u{8} \u{8}".to_string())]
                } else {
                    Vec::new()
                }
            }
            KeyCode::Char(ch) => {
                buffer.push(ch);
                vec![KeyAction::Echo(ch.to_string())]
            }
            _ => Vec::new(),
        }
    }
}

/// Background thread reading keys in raw terminal mode.
///
/// Raw mode is enabled on spawn and restored when the listener is shut down
/// or dropped.
pub struct KeyboardListener {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeyboardListener {
    pub fn spawn(controller: Controller) -> Result<Self> {
        enable_raw_mode().context("enable raw terminal mode")?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            if let Err(err) = listen(&controller, &flag) {
                warn!(err = %format!("{err:#}"), "keyboard listener stopped");
            }
        });
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("keyboard listener panicked");
        }
        if let Err(err) = disable_raw_mode() {
            warn!(err = %err, "failed to restore terminal mode");
        }
    }
}

impl Drop for KeyboardListener {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn listen(controller: &Controller, shutdown: &AtomicBool) -> Result<()> {
    let mut input = KeyInput::default();
    let mut stdout = std::io::stdout();
    while !shutdown.load(Ordering::SeqCst) {
        if !event::poll(POLL_INTERVAL).context("poll terminal events")? {
            continue;
        }
        let Event::Key(key) = event::read().context("read terminal event")? else {
            continue;
        };
        for action in input.on_key(key) {
            match action {
                KeyAction::Echo(text) => {
                    stdout.write_all(text.as_bytes()).context("echo key")?;
                    stdout.flush().context("flush echo")?;
                }
                KeyAction::Signal(signal) => {
                    debug!(?signal, "key signal");
                    if !controller.send(signal) {
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

/// Headless mode: the first Ctrl-C requests a graceful stop, a second one
/// exits immediately.
pub fn install_ctrlc(controller: Controller) -> Result<()> {
    let requested = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if requested.swap(true, Ordering::SeqCst) {
            eprintln!("\nforced exit");
            std::process::exit(exit_codes::STOPPED);
        }
        eprintln!("\nstopping after the current step is cancelled (Ctrl-C again to force)");
        controller.stop();
    })
    .context("install Ctrl-C handler")
}
