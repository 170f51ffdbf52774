use crate::core::ops::chance::Chance;

/// How a conversation format runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormatConfig {
    pub name: &'static str,
    pub min_turns: u32,
    pub max_turns: u32,
    pub temperature: f32,
    /// Agent who opens the conversation when present.
    pub coordinator: Option<&'static str>,
}

const fn format(
    name: &'static str,
    min_turns: u32,
    max_turns: u32,
    temperature: f32,
    coordinator: Option<&'static str>,
) -> FormatConfig {
    FormatConfig {
        name,
        min_turns,
        max_turns,
        temperature,
        coordinator,
    }
}

pub const FORMATS: &[FormatConfig] = &[
    format("standup", 6, 12, 0.6, Some("primus")),
    format("debate", 6, 10, 0.8, Some("thaum")),
    format("watercooler", 2, 5, 0.9, None),
    format("checkin", 2, 4, 0.7, Some("primus")),
    format("triage", 4, 8, 0.5, Some("chora")),
    format("planning", 4, 8, 0.6, Some("praxis")),
    format("deep_dive", 6, 10, 0.7, Some("chora")),
    format("strategy", 6, 10, 0.7, Some("primus")),
    format("writing_room", 4, 8, 0.8, Some("chora")),
    format("brainstorm", 6, 10, 0.95, Some("thaum")),
    format("cross_exam", 6, 10, 0.7, Some("subrosa")),
    format("risk_review", 4, 8, 0.6, Some("subrosa")),
    format("content_review", 4, 8, 0.6, Some("subrosa")),
    format("reframe", 4, 8, 0.9, Some("thaum")),
    format("retro", 6, 10, 0.7, Some("primus")),
    format("shipping", 4, 8, 0.5, Some("praxis")),
];

/// Format used when a requested one is unknown.
pub const FALLBACK_FORMAT: &str = "standup";

/// Format a `convene_roundtable` step lands in when it names none or an unknown one.
pub const CONVENE_DEFAULT_FORMAT: &str = "deep_dive";

/// Formats whose conversations may produce action items.
pub const ACTION_ITEM_FORMATS: &[&str] = &["standup"];

pub fn is_known(name: &str) -> bool {
    FORMATS.iter().any(|f| f.name == name)
}

pub fn get(name: &str) -> &'static FormatConfig {
    FORMATS
        .iter()
        .find(|f| f.name == name)
        .or_else(|| FORMATS.iter().find(|f| f.name == FALLBACK_FORMAT))
        .unwrap_or(&FORMATS[0])
}

impl FormatConfig {
    /// Turn count for one session, drawn once.
    pub fn pick_turn_count(&self, chance: &Chance) -> u32 {
        chance.between(self.min_turns as i64, self.max_turns as i64) as u32
    }

    pub fn yields_action_items(&self) -> bool {
        ACTION_ITEM_FORMATS.contains(&self.name)
    }
}
