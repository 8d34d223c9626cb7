//! Emoji used in terminal output, with plain-text fallbacks.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("\u{2705} ", "[OK] ");
pub static CROSS: Emoji<'_, '_> = Emoji("\u{274C} ", "[ERR] ");
pub static SPARKLE: Emoji<'_, '_> = Emoji("\u{2728} ", "* ");
pub static HOURGLASS: Emoji<'_, '_> = Emoji("\u{23F3} ", "... ");

// Activity kinds
pub static PROGRESS: Emoji<'_, '_> = Emoji("\u{1F4CA} ", "[RES] ");
pub static GEAR: Emoji<'_, '_> = Emoji("\u{2699}\u{FE0F}  ", "[SYS] ");
pub static PUSH: Emoji<'_, '_> = Emoji("\u{1F680} ", "[PUSH] ");
pub static CI: Emoji<'_, '_> = Emoji("\u{1F6A6} ", "[CI] ");
