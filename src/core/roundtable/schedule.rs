//! The office's daily conversation calendar and the heartbeat check that
//! enqueues from it.

use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::core::agents;
use crate::core::ops::chance::Chance;
use crate::core::ops::policy::{PolicyStore, ROUNDTABLE_POLICY, RoundtablePolicy};
use crate::core::store::types::NewSession;
use crate::core::store::{OfficeStore, today_start, ts};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleSlot {
    pub hour_utc: u32,
    pub name: &'static str,
    pub format: &'static str,
    pub participants: Vec<String>,
    pub probability: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleReport {
    pub checked: bool,
    pub enqueued: Option<String>,
}

/// How the room for a slot is filled.
enum Seats {
    Everyone,
    Random(usize),
    Required(&'static [&'static str], usize, usize),
}

const CALENDAR: &[(u32, &str, &str, Seats, f64)] = &[
    (1, "Late Night Watercooler", "watercooler", Seats::Random(2), 0.25),
    (3, "Insomnia Check-in", "checkin", Seats::Random(2), 0.15),
    (6, "Morning Standup", "standup", Seats::Everyone, 1.0),
    (7, "Morning Triage", "triage", Seats::Required(&["chora", "subrosa", "mux"], 1, 4), 0.7),
    (8, "Daily Planning", "planning", Seats::Required(&["primus", "praxis", "mux"], 1, 5), 0.6),
    (9, "Deep Dive", "deep_dive", Seats::Required(&["chora"], 2, 4), 0.5),
    (10, "Strategy Session", "strategy", Seats::Required(&["primus", "chora", "praxis"], 1, 5), 0.45),
    (11, "Writing Room", "writing_room", Seats::Required(&["chora"], 1, 3), 0.4),
    (12, "Lunch Watercooler", "watercooler", Seats::Random(3), 0.7),
    (13, "Midday Check-in", "checkin", Seats::Required(&["primus"], 2, 4), 0.5),
    (14, "Afternoon Brainstorm", "brainstorm", Seats::Required(&["thaum"], 2, 4), 0.5),
    (15, "Debate Hour", "debate", Seats::Required(&["thaum"], 1, 3), 0.55),
    (16, "Cross-Examination", "cross_exam", Seats::Required(&["subrosa"], 1, 3), 0.35),
    (17, "Risk Review", "risk_review", Seats::Required(&["subrosa", "chora"], 1, 4), 0.4),
    (18, "Content Review", "content_review", Seats::Required(&["subrosa"], 1, 3), 0.45),
    (19, "Reframe Session", "reframe", Seats::Required(&["thaum"], 1, 3), 0.35),
    (20, "Evening Watercooler", "watercooler", Seats::Random(3), 0.6),
    (21, "Evening Retro", "retro", Seats::Required(&["primus", "chora"], 2, 5), 0.4),
    (22, "Manager's Briefing", "strategy", Seats::Required(&["primus", "chora", "praxis"], 1, 5), 0.5),
    (23, "Shipping Review", "shipping", Seats::Required(&["praxis", "subrosa"], 1, 4), 0.3),
];

const STANDUP_TOPICS: &[&str] = &[
    "What are our priorities today?",
    "Any blockers or risks we should address?",
    "What did we accomplish since last standup?",
    "Where should we focus our energy?",
    "System health and next steps",
];
const DEBATE_TOPICS: &[&str] = &[
    "Should we prioritize quality or speed?",
    "Is our current approach sustainable?",
    "What are we missing in our analysis?",
    "Should we change our content strategy?",
    "How can we improve our signal-to-noise ratio?",
];
const WATERCOOLER_TOPICS: &[&str] = &[
    "What interesting patterns have you noticed lately?",
    "Any wild ideas worth exploring?",
    "What surprised you recently?",
    "If we could do one thing differently, what would it be?",
    "Random thought of the day",
];

fn seat(seats: &Seats, chance: &Chance) -> Vec<String> {
    let mut pool = agents::all_ids();
    match seats {
        Seats::Everyone => pool,
        Seats::Random(count) => {
            chance.shuffle(&mut pool);
            pool.truncate(*count);
            pool
        }
        Seats::Required(required, fill, max) => {
            pool.retain(|id| !required.contains(&id.as_str()));
            chance.shuffle(&mut pool);
            let mut room: Vec<String> = required.iter().map(|id| id.to_string()).collect();
            room.extend(pool.into_iter().take(*fill));
            room.truncate(*max);
            room
        }
    }
}

/// The slot for a UTC hour, with a freshly drawn room. Most hours have none.
pub fn slot_for_hour(hour_utc: u32, chance: &Chance) -> Option<ScheduleSlot> {
    CALENDAR
        .iter()
        .find(|(hour, ..)| *hour == hour_utc)
        .map(|(hour, name, format, seats, probability)| ScheduleSlot {
            hour_utc: *hour,
            name,
            format,
            participants: seat(seats, chance),
            probability: *probability,
        })
}

pub fn daily_schedule(chance: &Chance) -> Vec<ScheduleSlot> {
    (0..24).filter_map(|hour| slot_for_hour(hour, chance)).collect()
}

pub fn topic_for(format: &str, chance: &Chance) -> String {
    let pool = match format {
        "debate" => DEBATE_TOPICS,
        "watercooler" => WATERCOOLER_TOPICS,
        _ => STANDUP_TOPICS,
    };
    chance.pick(pool).copied().unwrap_or(STANDUP_TOPICS[0]).to_string()
}

/// Heartbeat phase: maybe enqueue this hour's scheduled conversation.
pub async fn check_schedule(
    store: &OfficeStore,
    policies: &PolicyStore,
    chance: &Chance,
    now: DateTime<Utc>,
) -> Result<ScheduleReport> {
    let checked = ScheduleReport {
        checked: true,
        enqueued: None,
    };
    let policy: RoundtablePolicy = policies.get_as(ROUNDTABLE_POLICY).await?;
    if !policy.enabled {
        return Ok(checked);
    }
    if store.count_sessions_since(&today_start()).await? >= policy.max_daily_conversations {
        debug!("[Schedule] Daily conversation cap reached");
        return Ok(checked);
    }
    let Some(slot) = slot_for_hour(now.hour(), chance) else {
        return Ok(checked);
    };

    let hour_start = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    if store.count_slot_sessions_since(slot.name, &ts(hour_start)).await? > 0 {
        return Ok(checked);
    }
    if !chance.chance(slot.probability) {
        debug!("[Schedule] {} did not fire this hour", slot.name);
        return Ok(checked);
    }

    let topic = topic_for(slot.format, chance);
    let id = store
        .insert_session(&NewSession {
            format: slot.format.to_string(),
            topic: topic.clone(),
            participants: slot.participants.clone(),
            schedule_slot: Some(slot.name.to_string()),
            scheduled_for: None,
            metadata: json!({}),
        })
        .await?;
    info!("[Schedule] Enqueued {} ({}): {}", slot.name, slot.format, topic);
    Ok(ScheduleReport {
        checked: true,
        enqueued: Some(id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::roundtable::formats;
    use crate::core::store::test_store;
    use chrono::TimeZone;

    #[test]
    fn every_slot_uses_a_known_format_and_required_members() {
        let chance = Chance::seeded(4);
        let schedule = daily_schedule(&chance);
        assert_eq!(schedule.len(), CALENDAR.len());
        for slot in &schedule {
            assert!(formats::is_known(slot.format), "{}", slot.format);
            assert!(slot.participants.len() >= 2, "{}", slot.name);
            let mut unique = slot.participants.clone();
            unique.sort();
            unique.dedup();
            assert_eq!(unique.len(), slot.participants.len());
        }
        let triage = slot_for_hour(7, &chance).unwrap();
        assert_eq!(triage.participants.len(), 4);
        assert_eq!(&triage.participants[..3], &["chora", "subrosa", "mux"]);
        assert!(slot_for_hour(4, &chance).is_none());
    }

    async fn enabled(store: &OfficeStore, max: i64) -> PolicyStore {
        store
            .set_policy_value(
                ROUNDTABLE_POLICY,
                &json!({"enabled": true, "max_daily_conversations": max}),
            )
            .await
            .unwrap();
        PolicyStore::new(store.clone())
    }

    #[tokio::test]
    async fn standup_hour_enqueues_once() {
        let store = test_store().await;
        let policies = enabled(&store, 5).await;
        let chance = Chance::seeded(2);
        // an hour already in the past, so the session just created counts against it
        let yesterday = Utc::now().date_naive() - chrono::Duration::days(1);
        let six = yesterday.and_hms_opt(6, 15, 0).unwrap().and_utc();

        let first = check_schedule(&store, &policies, &chance, six).await.unwrap();
        let id = first.enqueued.expect("standup always fires");
        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.format, "standup");
        assert_eq!(session.schedule_slot.as_deref(), Some("Morning Standup"));
        assert_eq!(session.participants.len(), agents::ROSTER.len());
        assert!(STANDUP_TOPICS.contains(&session.topic.as_str()));

        let again = check_schedule(&store, &policies, &chance, six).await.unwrap();
        assert_eq!(again.enqueued, None);
    }

    #[tokio::test]
    async fn disabled_policy_and_daily_cap_block() {
        let store = test_store().await;
        let chance = Chance::seeded(2);
        let six = Utc.with_ymd_and_hms(2026, 1, 5, 6, 0, 0).unwrap();

        let policies = PolicyStore::new(store.clone());
        assert_eq!(
            check_schedule(&store, &policies, &chance, six).await.unwrap().enqueued,
            None
        );

        let policies = enabled(&store, 0).await;
        assert_eq!(
            check_schedule(&store, &policies, &chance, six).await.unwrap().enqueued,
            None
        );
    }
}
