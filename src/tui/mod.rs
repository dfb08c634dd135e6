//! Terminal display for ipsee-speed.
//!
//! Live gauges while a run is in flight, plus the display-mode detection
//! that decides whether the TUI is used at all.

pub mod controller;
pub mod display_mode;
pub mod renderer;
pub mod state;

pub use controller::TuiController;
pub use display_mode::DisplayMode;
