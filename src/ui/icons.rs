//! Shared narration icons.
//!
//! Each icon falls back to an ASCII tag on terminals without emoji support.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");

// Stage indicators
pub static ANALYZE: Emoji<'_, '_> = Emoji("🔍 ", "[A]");
pub static BATCH: Emoji<'_, '_> = Emoji("🌊 ", "[B]");
pub static WORKER: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static MERGE: Emoji<'_, '_> = Emoji("🔀 ", "[M]");
pub static SNAPSHOT: Emoji<'_, '_> = Emoji("📸 ", "[S]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
