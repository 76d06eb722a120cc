//! Shared UI icons and emojis.
//!
//! Each icon falls back to plain text on terminals without emoji support.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Run indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static BARRIER: Emoji<'_, '_> = Emoji("🚧 ", "[|]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
