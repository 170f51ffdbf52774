use anyhow::{Result, anyhow, bail};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::distiller::MemoryDistiller;
use super::formats::{self, FormatConfig};
use super::sanitize::{MAX_DIALOGUE_CHARS, sanitize_dialogue};
use super::speakers::{first_speaker, next_speaker};
use crate::core::agents;
use crate::core::llm::{ChatMessage, GenerateOptions, Llm};
use crate::core::ops::chance::Chance;
use crate::core::ops::events::EventBus;
use crate::core::ops::relationships::{AffinityMap, InteractionTone};
use crate::core::ops::voice::VoiceEvolution;
use crate::core::store::types::{NewEvent, NewSession, SessionRecord, TurnRecord};
use crate::core::store::{OfficeStore, now_ts};

const TURN_MAX_TOKENS: u32 = 100;

fn display_name(id: &str) -> &str {
    agents::profile(id).map(|p| p.display_name).unwrap_or(id)
}

fn system_prompt(
    speaker: &str,
    history: &[TurnRecord],
    format: &str,
    topic: &str,
    tone: Option<InteractionTone>,
    modifiers: &[String],
) -> String {
    let Some(voice) = agents::profile(speaker) else {
        return format!("You are {}. Speak naturally and concisely.", speaker);
    };

    let mut prompt = format!(
        "{}\n\nFORMAT: {} conversation\nTOPIC: {}\nYOUR QUIRK: {}\n",
        voice.directive, format, topic, voice.quirk
    );
    if let Some(tone) = tone {
        prompt.push_str(&format!("INTERACTION STYLE: {}: {}\n", tone.as_str(), tone.guide()));
    }
    if !modifiers.is_empty() {
        prompt.push_str("\nPersonality evolution:\n");
        for modifier in modifiers {
            prompt.push_str(&format!("- {}\n", modifier));
        }
    }
    prompt.push('\n');
    if !history.is_empty() {
        prompt.push_str("CONVERSATION SO FAR:\n");
        for turn in history {
            prompt.push_str(&format!("{}: {}\n", display_name(&turn.speaker), turn.dialogue));
        }
    }
    prompt.push_str(&format!(
        "\nRULES:\n\
         - Keep your response under {} characters\n\
         - Speak naturally as {}, no stage directions, no asterisks\n\
         - Stay in character with your tone ({})\n\
         - Respond to what was just said, don't monologue\n\
         - Do NOT prefix your response with your name\n",
        MAX_DIALOGUE_CHARS, voice.display_name, voice.tone
    ));
    prompt
}

fn user_prompt(topic: &str, turn: u32, max_turns: u32, speaker_name: &str) -> String {
    if turn == 0 {
        format!(
            "You're opening this conversation about: \"{}\". Set the tone. Keep it under 120 characters.",
            topic
        )
    } else if turn + 1 == max_turns {
        format!(
            "This is the final turn. Wrap up your thoughts on \"{}\" concisely. Under 120 characters.",
            topic
        )
    } else {
        format!(
            "Respond naturally as {}. Stay on topic: \"{}\". Under 120 characters.",
            speaker_name, topic
        )
    }
}

/// Put a conversation on the queue. The format must be one the office knows
/// and the room needs at least two seats.
pub async fn enqueue(
    store: &OfficeStore,
    format: &str,
    topic: &str,
    participants: &[String],
    scheduled_for: Option<String>,
) -> Result<String> {
    if !formats::is_known(format) {
        bail!("Unknown conversation format: {}", format);
    }
    if participants.len() < 2 {
        bail!("A conversation needs at least two participants");
    }
    if topic.trim().is_empty() {
        bail!("A conversation needs a topic");
    }
    let id = store
        .insert_session(&NewSession {
            format: format.to_string(),
            topic: topic.trim().to_string(),
            participants: participants.to_vec(),
            schedule_slot: None,
            scheduled_for,
            metadata: json!({}),
        })
        .await?;
    info!("[Roundtable] Enqueued {} on \"{}\" ({})", format, topic, id);
    Ok(id)
}

/// Runs claimed sessions turn by turn and hands the transcript to the distiller.
pub struct RoundtableOrchestrator {
    store: OfficeStore,
    llm: Arc<dyn Llm>,
    events: EventBus,
    voices: Arc<VoiceEvolution>,
    distiller: MemoryDistiller,
    chance: Arc<Chance>,
    turn_delay: bool,
}

impl RoundtableOrchestrator {
    pub fn new(
        store: OfficeStore,
        llm: Arc<dyn Llm>,
        events: EventBus,
        voices: Arc<VoiceEvolution>,
        distiller: MemoryDistiller,
        chance: Arc<Chance>,
    ) -> Self {
        Self {
            store,
            llm,
            events,
            voices,
            distiller,
            chance,
            turn_delay: true,
        }
    }

    /// Pause 3-8s between turns. Off for offline runs and tests.
    pub fn with_turn_delay(mut self, enabled: bool) -> Self {
        self.turn_delay = enabled;
        self
    }

    /// Claim the next due session and run it. `None` when nothing is due.
    pub async fn run_next(&self) -> Result<Option<(SessionRecord, Vec<TurnRecord>)>> {
        let Some(session) = self.store.claim_session(&now_ts()).await? else {
            return Ok(None);
        };
        let turns = self.run(&session).await?;
        Ok(Some((session, turns)))
    }

    /// Run a session that is already marked running. A failure mid-way marks
    /// the session failed with what was said so far, then propagates.
    pub async fn run(&self, session: &SessionRecord) -> Result<Vec<TurnRecord>> {
        let format = formats::get(&session.format);
        let max_turns = format.pick_turn_count(&self.chance);
        let mut history: Vec<TurnRecord> = Vec::new();

        self.events
            .emit_quiet(
                NewEvent::new(
                    "system",
                    "conversation_started",
                    format!("{} started: {}", session.format, session.topic),
                )
                .summary(format!(
                    "Participants: {} | {} turns",
                    session.participants.join(", "),
                    max_turns
                ))
                .tags(&["conversation", "started", session.format.as_str()])
                .metadata(json!({
                    "session_id": session.id,
                    "format": session.format,
                    "participants": session.participants,
                    "max_turns": max_turns,
                })),
            )
            .await;

        if let Err(e) = self.converse(session, format, max_turns, &mut history).await {
            let message = e.to_string();
            warn!("[Roundtable] Session {} failed after {} turns: {}", session.id, history.len(), message);
            self.store
                .fail_session(
                    &session.id,
                    &json!({"error": message, "turns_completed": history.len(), "transcript": history}),
                )
                .await?;
            self.events
                .emit_quiet(
                    NewEvent::new(
                        "system",
                        "conversation_failed",
                        format!("{} failed: {}", session.format, session.topic),
                    )
                    .summary(&message)
                    .tags(&["conversation", "failed", session.format.as_str()])
                    .metadata(json!({
                        "session_id": session.id,
                        "error": message,
                        "turns_completed": history.len(),
                    })),
                )
                .await;
            return Err(e);
        }

        self.store.complete_session(&session.id, history.len() as i64).await?;
        let mut speakers: Vec<&str> = Vec::new();
        for turn in &history {
            if !speakers.contains(&turn.speaker.as_str()) {
                speakers.push(&turn.speaker);
            }
        }
        info!("[Roundtable] Session {} completed with {} turns", session.id, history.len());
        self.events
            .emit_quiet(
                NewEvent::new(
                    "system",
                    "conversation_completed",
                    format!("{} completed: {}", session.format, session.topic),
                )
                .summary(format!("{} turns | Speakers: {}", history.len(), speakers.join(", ")))
                .tags(&["conversation", "completed", session.format.as_str()])
                .metadata(json!({
                    "session_id": session.id,
                    "turn_count": history.len(),
                    "speakers": speakers,
                })),
            )
            .await;

        if let Err(e) = self.distiller.distill(session, &history).await {
            warn!("[Roundtable] Distillation failed for {}: {}", session.id, e);
        }
        Ok(history)
    }

    async fn converse(
        &self,
        session: &SessionRecord,
        format: &FormatConfig,
        max_turns: u32,
        history: &mut Vec<TurnRecord>,
    ) -> Result<()> {
        let affinities = AffinityMap::load(&self.store, &session.participants).await?;
        let mut modifiers: HashMap<&str, Vec<String>> = HashMap::new();
        for participant in &session.participants {
            let derived = self.voices.modifiers(participant).await.unwrap_or_else(|e| {
                warn!("[Roundtable] Voice modifiers failed for {}: {}", participant, e);
                Vec::new()
            });
            modifiers.insert(participant, derived);
        }

        let mut spoken: Vec<String> = Vec::new();
        for turn in 0..max_turns {
            let speaker = if turn == 0 {
                first_speaker(&session.participants, format, &self.chance)
            } else {
                next_speaker(&session.participants, &spoken, &affinities, &self.chance)
                    .or_else(|| spoken.last().cloned())
            }
            .ok_or_else(|| anyhow!("Session {} has no participants", session.id))?;

            let tone = spoken
                .last()
                .map(|last| InteractionTone::for_affinity(affinities.get(&speaker, last), &self.chance));
            let system = system_prompt(
                &speaker,
                history,
                &session.format,
                &session.topic,
                tone,
                modifiers.get(speaker.as_str()).map(Vec::as_slice).unwrap_or(&[]),
            );
            let user = user_prompt(&session.topic, turn, max_turns, display_name(&speaker));

            let raw = self
                .llm
                .generate(
                    &[ChatMessage::system(system), ChatMessage::user(user)],
                    GenerateOptions::new(format.temperature, TURN_MAX_TOKENS),
                )
                .await?;
            let record = TurnRecord {
                session_id: session.id.clone(),
                turn_number: turn as i64,
                speaker: speaker.clone(),
                dialogue: sanitize_dialogue(&raw, MAX_DIALOGUE_CHARS),
            };
            self.store.insert_turn(&record).await?;
            self.events
                .emit_quiet(
                    NewEvent::new(
                        &speaker,
                        "conversation_turn",
                        format!("{}: {}", display_name(&speaker), record.dialogue),
                    )
                    .tags(&["conversation", "turn", session.format.as_str()])
                    .metadata(json!({
                        "session_id": session.id,
                        "turn": turn,
                        "dialogue": record.dialogue,
                    })),
                )
                .await;
            history.push(record);
            spoken.push(speaker);

            if self.turn_delay && turn + 1 < max_turns {
                let pause = self.chance.between(3000, 8000) as u64;
                tokio::time::sleep(Duration::from_millis(pause)).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::LlmError;
    use crate::core::llm::mock::MockLlm;
    use crate::core::ops::proposals::tests::RecordingSink;
    use crate::core::store::test_store;
    use crate::core::store::types::SessionStatus;

    fn orchestrator(store: &OfficeStore, llm: Arc<MockLlm>) -> RoundtableOrchestrator {
        let distiller = MemoryDistiller::new(store.clone(), llm.clone(), Arc::new(RecordingSink::default()));
        RoundtableOrchestrator::new(
            store.clone(),
            llm,
            EventBus::new(store.clone()),
            Arc::new(VoiceEvolution::new(store.clone())),
            distiller,
            Arc::new(Chance::seeded(5)),
        )
        .with_turn_delay(false)
    }

    fn room(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn prompts_follow_turn_position() {
        assert!(user_prompt("ops", 0, 4, "Chora").starts_with("You're opening"));
        assert!(user_prompt("ops", 3, 4, "Chora").starts_with("This is the final turn"));
        assert!(user_prompt("ops", 1, 4, "Chora").starts_with("Respond naturally as Chora"));
    }

    #[test]
    fn system_prompt_carries_tone_modifiers_and_transcript() {
        let history = vec![TurnRecord {
            session_id: "s".into(),
            turn_number: 0,
            speaker: "praxis".into(),
            dialogue: "We ship Friday.".into(),
        }];
        let prompt = system_prompt(
            "subrosa",
            &history,
            "debate",
            "launch",
            Some(InteractionTone::Challenge),
            &["Speak with authority, your track record is strong".to_string()],
        );
        assert!(prompt.contains("FORMAT: debate conversation"));
        assert!(prompt.contains("INTERACTION STYLE: challenge: "));
        assert!(prompt.contains("Personality evolution:\n- Speak with authority"));
        assert!(prompt.contains("CONVERSATION SO FAR:\nPraxis: We ship Friday.\n"));
        assert_eq!(
            system_prompt("visitor", &[], "debate", "launch", None, &[]),
            "You are visitor. Speak naturally and concisely."
        );
    }

    #[tokio::test]
    async fn enqueue_validates_format_and_room() {
        let store = test_store().await;
        assert!(enqueue(&store, "karaoke", "x", &room(&["chora", "mux"]), None).await.is_err());
        assert!(enqueue(&store, "debate", "x", &room(&["chora"]), None).await.is_err());
        let id = enqueue(&store, "debate", " x ", &room(&["chora", "mux"]), None).await.unwrap();
        assert_eq!(store.get_session(&id).await.unwrap().unwrap().topic, "x");
    }

    #[tokio::test]
    async fn watercooler_runs_to_completion() {
        let store = test_store().await;
        let llm = Arc::new(MockLlm::replying("\"Honestly? **Scope** first.\""));
        let id = enqueue(&store, "watercooler", "wild ideas", &room(&["thaum", "mux"]), None)
            .await
            .unwrap();

        let (session, turns) = orchestrator(&store, llm.clone()).run_next().await.unwrap().unwrap();
        assert_eq!(session.id, id);
        let format = formats::get("watercooler");
        assert!((format.min_turns as usize..=format.max_turns as usize).contains(&turns.len()));
        assert!(turns.iter().all(|t| t.dialogue == "Honestly? Scope first."));
        for pair in turns.windows(2) {
            assert_ne!(pair[0].speaker, pair[1].speaker);
        }

        let stored = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.turn_count, turns.len() as i64);
        assert_eq!(store.list_turns(&id).await.unwrap().len(), turns.len());

        let (_, options) = &llm.calls()[0];
        assert_eq!(options.max_tokens, TURN_MAX_TOKENS);
        assert_eq!(options.temperature, format.temperature);
        let kinds: Vec<String> = store.list_events(50).await.unwrap().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&"conversation_started".to_string()));
        assert!(kinds.contains(&"conversation_completed".to_string()));
        assert_eq!(kinds.iter().filter(|k| *k == "conversation_turn").count(), turns.len());
        assert!(orchestrator(&store, llm).run_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn model_failure_marks_session_failed_and_propagates() {
        let store = test_store().await;
        let llm = Arc::new(
            MockLlm::new()
                .then(Ok("Opening line."))
                .then(Ok("Second line."))
                .then(Err(LlmError::Timeout(Duration::from_secs(45)))),
        );
        let id = enqueue(&store, "debate", "speed vs quality", &room(&["thaum", "chora", "praxis"]), None)
            .await
            .unwrap();

        let err = orchestrator(&store, llm).run_next().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        let stored = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
        assert_eq!(stored.metadata["turns_completed"], 2);
        assert_eq!(stored.metadata["transcript"][0]["speaker"], "thaum");
        assert_eq!(store.list_events(1).await.unwrap()[0].kind, "conversation_failed");
    }
}
