//! Terminal rendering for the `run` and `ci` commands.

pub mod ci_progress;
pub mod event_printer;
pub mod icons;

pub use ci_progress::CiProgress;
pub use event_printer::{EventPrinter, format_event};
