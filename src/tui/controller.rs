//! TUI controller for managing the display lifecycle.
//!
//! The TuiController owns the terminal, the state the renderer draws from
//! and the keyboard polling used to abort a run from inside the TUI.

use std::io::{self, Stdout};
use std::time::Duration;

use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{
        disable_raw_mode, enable_raw_mode, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};
use ratatui::{backend::CrosstermBackend, Terminal};

use super::display_mode::DisplayMode;
use super::renderer::render_frame;
use super::state::TuiState;
use crate::errors::{ErrorKind, SpeedTestError};
use crate::speedtest::progress::ProgressEvent;

/// What a key press asks the UI loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// `q`, `Esc` or `Ctrl-C`
    Abort,
    Other,
}

impl KeyAction {
    pub fn from_key(key: &KeyEvent) -> Self {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => KeyAction::Abort,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                KeyAction::Abort
            }
            _ => KeyAction::Other,
        }
    }
}

/// Controller for the TUI display.
///
/// Only [`DisplayMode::Tui`] touches the terminal; in the other modes every
/// method still updates state but never draws.
pub struct TuiController {
    mode: DisplayMode,
    state: TuiState,
    /// Terminal instance (only present in TUI mode)
    terminal: Option<Terminal<CrosstermBackend<Stdout>>>,
    initialized: bool,
}

impl TuiController {
    pub fn new(mode: DisplayMode) -> Self {
        Self { mode, state: TuiState::new(), terminal: None, initialized: false }
    }

    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    #[cfg(test)]
    pub fn state(&self) -> &TuiState {
        &self.state
    }

    /// Enter the alternate screen with raw mode and a hidden cursor.
    ///
    /// A no-op outside TUI mode.
    pub fn init(&mut self) -> Result<(), SpeedTestError> {
        if self.mode != DisplayMode::Tui || self.initialized {
            return Ok(());
        }

        enable_raw_mode().map_err(terminal_error)?;
        self.initialized = true;

        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, cursor::Hide)
            .map_err(terminal_error)?;

        let terminal =
            Terminal::new(CrosstermBackend::new(stdout)).map_err(terminal_error)?;
        self.terminal = Some(terminal);

        Ok(())
    }

    /// Restore the terminal to its original state.
    pub fn cleanup(&mut self) -> Result<(), SpeedTestError> {
        if !self.initialized {
            return Ok(());
        }

        if let Some(ref mut terminal) = self.terminal {
            execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)
                .map_err(terminal_error)?;
        }

        disable_raw_mode().map_err(terminal_error)?;

        self.initialized = false;
        self.terminal = None;

        Ok(())
    }

    pub fn set_server(&mut self, server: impl Into<String>) {
        self.state.set_server(server);
    }

    pub fn apply(&mut self, event: &ProgressEvent) {
        self.state.update_from_event(event);
    }

    /// Draw the current state. A no-op outside TUI mode.
    pub fn render(&mut self) -> Result<(), SpeedTestError> {
        let Some(ref mut terminal) = self.terminal else {
            return Ok(());
        };

        let state = &self.state;
        terminal
            .draw(|frame| render_frame(frame, state))
            .map_err(terminal_error)?;

        Ok(())
    }

    /// Drain pending key presses without blocking.
    ///
    /// Returns true if any of them asks for an abort. Always false outside
    /// TUI mode, where raw mode is off and Ctrl-C arrives as a signal.
    pub fn poll_abort_key(&self) -> Result<bool, SpeedTestError> {
        if self.terminal.is_none() {
            return Ok(false);
        }

        let mut abort = false;
        while event::poll(Duration::ZERO).map_err(terminal_error)? {
            if let Event::Key(key) = event::read().map_err(terminal_error)? {
                if key.kind == KeyEventKind::Press
                    && KeyAction::from_key(&key) == KeyAction::Abort
                {
                    abort = true;
                }
            }
        }

        Ok(abort)
    }

    /// Hold the final screen until a key is pressed or `timeout` passes.
    pub fn wait_for_key(&self, timeout: Duration) -> Result<(), SpeedTestError> {
        if self.terminal.is_none() {
            return Ok(());
        }

        if event::poll(timeout).map_err(terminal_error)? {
            event::read().map_err(terminal_error)?;
        }

        Ok(())
    }
}

impl Drop for TuiController {
    /// Restore the terminal even if cleanup() was not called.
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

fn terminal_error(e: io::Error) -> SpeedTestError {
    SpeedTestError::new(ErrorKind::Unknown, format!("terminal error: {}", e))
        .with_source(e)
}
