//! Display mode detection.
//!
//! Picks the live TUI, a plain summary, or JSON output from the CLI flags
//! and whether stdout is a terminal.

/// The display mode for the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// Live gauges in an alternate screen
    Tui,
    /// No live output; a colored summary once the run ends
    Plain,
    /// Structured output only
    Json,
}

impl DisplayMode {
    /// Determine display mode from CLI flags and environment.
    ///
    /// `--json` always wins. Otherwise the TUI is used only on a terminal
    /// and only when `--no-tui` was not given.
    pub fn detect(json_flag: bool, no_tui_flag: bool, is_tty: bool) -> Self {
        if json_flag {
            DisplayMode::Json
        } else if is_tty && !no_tui_flag {
            DisplayMode::Tui
        } else {
            DisplayMode::Plain
        }
    }
}
