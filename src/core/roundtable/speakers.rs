use super::formats::FormatConfig;
use crate::core::ops::chance::Chance;
use crate::core::ops::relationships::AffinityMap;

/// The coordinator opens when present, otherwise anyone may.
pub fn first_speaker(participants: &[String], format: &FormatConfig, chance: &Chance) -> Option<String> {
    if let Some(coordinator) = format.coordinator
        && participants.iter().any(|p| p == coordinator)
    {
        return Some(coordinator.to_string());
    }
    chance.pick(participants).cloned()
}

/// Relative weight of `candidate` speaking next. The last speaker never goes twice.
pub fn speaker_weight(
    candidate: &str,
    last_speaker: &str,
    history: &[String],
    affinities: &AffinityMap,
    jitter: f64,
) -> f64 {
    if candidate == last_speaker {
        return 0.0;
    }
    let spoken = history.iter().filter(|s| s.as_str() == candidate).count();
    let share = if history.is_empty() {
        0.0
    } else {
        spoken as f64 / history.len() as f64
    };
    (1.0 + 0.6 * affinities.get(candidate, last_speaker) - 0.4 * share + jitter).max(0.0)
}

/// Pick who speaks after `history`, weighted by rapport with the last speaker
/// and damped for those who have talked most.
pub fn next_speaker(
    participants: &[String],
    history: &[String],
    affinities: &AffinityMap,
    chance: &Chance,
) -> Option<String> {
    let last = history.last()?;
    let weights: Vec<f64> = participants
        .iter()
        .map(|p| speaker_weight(p, last, history, affinities, chance.between_f64(-0.2, 0.2)))
        .collect();
    if let Some(picked) = weighted_pick(participants, &weights, chance) {
        return Some(picked.clone());
    }
    let others: Vec<&String> = participants.iter().filter(|p| *p != last).collect();
    chance.pick(&others).map(|p| p.to_string())
}

fn weighted_pick<'a, T>(items: &'a [T], weights: &[f64], chance: &Chance) -> Option<&'a T> {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return None;
    }
    let mut remaining = chance.roll() * total;
    for (item, weight) in items.iter().zip(weights) {
        remaining -= weight;
        if remaining <= 0.0 && *weight > 0.0 {
            return Some(item);
        }
    }
    items
        .iter()
        .zip(weights)
        .rev()
        .find(|(_, w)| **w > 0.0)
        .map(|(item, _)| item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::roundtable::formats;

    fn room(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn coordinator_opens_when_in_the_room() {
        let chance = Chance::seeded(1);
        let standup = formats::get("standup");
        assert_eq!(
            first_speaker(&room(&["chora", "primus", "mux"]), standup, &chance).as_deref(),
            Some("primus")
        );
        let picked = first_speaker(&room(&["chora", "mux"]), standup, &chance).unwrap();
        assert!(picked == "chora" || picked == "mux");
        assert!(first_speaker(&[], standup, &chance).is_none());
    }

    #[test]
    fn nobody_speaks_twice_in_a_row() {
        let chance = Chance::seeded(8);
        let participants = room(&["chora", "thaum", "praxis"]);
        let affinities = AffinityMap::default();
        let mut history = room(&["chora"]);
        for _ in 0..200 {
            let next = next_speaker(&participants, &history, &affinities, &chance).unwrap();
            assert_ne!(&next, history.last().unwrap());
            history.push(next);
        }
        for p in &participants {
            assert!(history.iter().filter(|s| *s == p).count() > 30);
        }
    }

    #[test]
    fn rapport_and_airtime_shape_the_weight() {
        let mut affinities = AffinityMap::default();
        affinities.set("chora", "praxis", 0.9);
        affinities.set("chora", "thaum", 0.2);
        let history = room(&["thaum", "praxis", "chora"]);
        let praxis = speaker_weight("praxis", "chora", &history, &affinities, 0.0);
        let thaum = speaker_weight("thaum", "chora", &history, &affinities, 0.0);
        assert!((praxis - (1.0 + 0.54 - 0.4 / 3.0)).abs() < 1e-9);
        assert!(praxis > thaum);
        assert_eq!(speaker_weight("chora", "chora", &history, &affinities, 0.2), 0.0);
    }

    #[test]
    fn a_lone_participant_cannot_follow_themselves() {
        let chance = Chance::seeded(3);
        let only = room(&["mux"]);
        assert!(next_speaker(&only, &only, &AffinityMap::default(), &chance).is_none());
    }
}
