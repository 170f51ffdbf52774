mod daemon;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use console::style;
use serde::Serialize;
use serde_json::{Value, json};

use crate::core::agents;
use crate::core::config::{OfficeConfig, ProcessEnv};
use crate::core::office::Office;
use crate::core::ops::proposals::{ProposalInput, ProposalSink};
use crate::core::ops::steps::StepKind;
use crate::core::roundtable::{enqueue, formats};
use crate::core::store::types::{ProposalSource, ProposedStep, StepPayload};
use crate::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Setup")
        .command("init", "Create the data directory, relationships and default policies")
        .print();

    GuideSection::new("Workers")
        .command("daemon", "Run every worker and the heartbeat until Ctrl+C")
        .command("heartbeat", "Run one heartbeat tick and print its result")
        .command(
            "work <missions|roundtable|initiatives> [--once]",
            "Run a single worker loop",
        )
        .print();

    GuideSection::new("Manual input")
        .command(
            "submit --agent A --title T [--description D] --step kind[:payload]...",
            "Submit a proposal",
        )
        .command(
            "enqueue --format F --topic T --participants a,b,c",
            "Queue a conversation",
        )
        .command("policy get KEY", "Print a policy value")
        .command("policy set KEY JSON", "Replace a policy value")
        .print();

    GuideSection::new("Diagnostics")
        .command("status", "Counts of proposals, missions, steps, sessions and reactions")
        .command("help", "Show this guide")
        .blank()
        .text("A step payload is either a JSON object or plain text used as the topic.")
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("ops-office").green()
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Value following `flag`, if any. A flag given last with no value reads as absent.
fn flag_value(args: &[String], start: usize, flag: &str) -> Option<String> {
    let mut i = start;
    while i < args.len() {
        if args[i] == flag {
            return args.get(i + 1).cloned();
        }
        i += 1;
    }
    None
}

fn require_flag(args: &[String], start: usize, flag: &str) -> Result<String> {
    match flag_value(args, start, flag) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("{} is required", flag),
    }
}

/// Parse one `--step` argument: `kind` or `kind:payload`, where the payload is
/// a JSON object when it starts with `{` and a topic otherwise.
pub(crate) fn parse_step(arg: &str) -> Result<ProposedStep> {
    let (kind, rest) = match arg.split_once(':') {
        Some((kind, rest)) => (kind.trim(), rest.trim()),
        None => (arg.trim(), ""),
    };
    let Some(kind) = StepKind::from_status(kind) else {
        bail!("Unknown step kind: {}", kind);
    };
    let payload = if rest.is_empty() {
        StepPayload::default()
    } else if rest.starts_with('{') {
        serde_json::from_str(rest).with_context(|| format!("Invalid payload for {}", kind))?
    } else {
        StepPayload::topic(rest)
    };
    Ok(ProposedStep::new(kind, payload))
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SubmitArgs {
    pub agent: String,
    pub title: String,
    pub description: Option<String>,
    pub steps: Vec<ProposedStep>,
}

pub(crate) fn parse_submit_args(args: &[String], start: usize) -> Result<SubmitArgs> {
    let mut agent = None;
    let mut title = None;
    let mut description = None;
    let mut steps = Vec::new();
    let mut i = start;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--agent" | "-a", Some(v)) => agent = Some(v.clone()),
            ("--title" | "-t", Some(v)) => title = Some(v.clone()),
            ("--description" | "-d", Some(v)) => description = Some(v.clone()),
            ("--step" | "-s", Some(v)) => steps.push(parse_step(v)?),
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    let Some(agent) = agent else {
        bail!("--agent is required");
    };
    if !agents::is_known(&agent) {
        bail!("Unknown agent: {} (known: {})", agent, agents::all_ids().join(", "));
    }
    let Some(title) = title.filter(|t| !t.trim().is_empty()) else {
        bail!("--title is required");
    };
    if steps.is_empty() {
        bail!("At least one --step is required");
    }
    Ok(SubmitArgs {
        agent,
        title,
        description,
        steps,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EnqueueArgs {
    pub format: String,
    pub topic: String,
    pub participants: Vec<String>,
}

pub(crate) fn parse_enqueue_args(args: &[String], start: usize) -> Result<EnqueueArgs> {
    let format = require_flag(args, start, "--format")?;
    if !formats::is_known(&format) {
        bail!("Unknown conversation format: {}", format);
    }
    let topic = require_flag(args, start, "--topic")?;
    let participants: Vec<String> = require_flag(args, start, "--participants")?
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if let Some(unknown) = participants.iter().find(|p| !agents::is_known(p)) {
        bail!("Unknown agent: {}", unknown);
    }
    Ok(EnqueueArgs {
        format,
        topic,
        participants,
    })
}

pub(crate) fn parse_work_args(args: &[String], start: usize) -> Result<(daemon::WorkerKind, bool)> {
    let Some(name) = args.get(start) else {
        bail!("work needs one of: missions, roundtable, initiatives");
    };
    let kind = daemon::WorkerKind::parse(name)?;
    let once = args[start + 1..].iter().any(|a| a == "--once");
    Ok((kind, once))
}

async fn open_office() -> Result<Office> {
    let config = OfficeConfig::load(&ProcessEnv)?;
    Office::open(config).await
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("help");

    match cmd {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "init" => {
            crate::logging::init(None);
            let office = open_office().await?;
            let report = office.init().await?;
            print_json(&json!({
                "data_dir": office.config.data_dir,
                "relationships": report.relationships,
                "policies_seeded": report.policies_seeded,
                "triggers_seeded": report.triggers_seeded,
            }))
        }
        "daemon" => {
            let config = OfficeConfig::load(&ProcessEnv)?;
            crate::logging::init(Some(&config.log_dir()));
            let office = Office::open(config).await?;
            daemon::run_daemon(office).await
        }
        "heartbeat" => {
            crate::logging::init(None);
            let office = open_office().await?;
            let result = office.heartbeat().tick(Utc::now()).await?;
            print_json(&result)
        }
        "work" => {
            let (kind, once) = parse_work_args(&args, 2)?;
            crate::logging::init(None);
            let office = open_office().await?;
            let processed = daemon::run_worker(&office, kind, once).await?;
            print_json(&json!({"worker": kind.as_str(), "processed": processed}))
        }
        "submit" => {
            let parsed = parse_submit_args(&args, 2)?;
            crate::logging::init(None);
            let office = open_office().await?;
            let mut input = ProposalInput::new(
                parsed.agent,
                parsed.title,
                parsed.steps,
                ProposalSource::Manual,
            );
            if let Some(description) = parsed.description {
                input = input.description(description);
            }
            let outcome = office.proposals.submit(input).await?;
            print_json(&outcome)
        }
        "enqueue" => {
            let parsed = parse_enqueue_args(&args, 2)?;
            crate::logging::init(None);
            let office = open_office().await?;
            let id = enqueue(
                &office.store,
                &parsed.format,
                &parsed.topic,
                &parsed.participants,
                None,
            )
            .await?;
            print_json(&json!({"session_id": id, "format": parsed.format}))
        }
        "policy" => {
            let sub_cmd = args.get(2).map(String::as_str).unwrap_or("");
            let Some(key) = args.get(3) else {
                bail!("Usage: ops-office policy <get|set> KEY [JSON]");
            };
            crate::logging::init(None);
            match sub_cmd {
                "get" => {
                    let office = open_office().await?;
                    let value = office.policies.get(key).await?;
                    print_json(&json!({"key": key, "value": value}))
                }
                "set" => {
                    let Some(raw) = args.get(4) else {
                        bail!("Usage: ops-office policy set KEY JSON");
                    };
                    let value: Value = serde_json::from_str(raw)
                        .with_context(|| format!("Policy value for {} is not valid JSON", key))?;
                    let office = open_office().await?;
                    office.policies.set(key, &value).await?;
                    print_json(&json!({"key": key, "value": value}))
                }
                other => bail!("Unknown policy command: {}", other),
            }
        }
        "status" => {
            crate::logging::init(None);
            let office = open_office().await?;
            print_json(&office.status().await?)
        }
        other => {
            print_error(&format!("Unknown command: {}", other));
            print_help();
            std::process::exit(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        std::iter::once("ops-office")
            .chain(parts.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn step_payload_is_json_or_topic() {
        let plain = parse_step("research_topic:agent pricing").unwrap();
        assert_eq!(plain.kind, StepKind::ResearchTopic);
        assert_eq!(plain.payload.topic.as_deref(), Some("agent pricing"));

        let structured = parse_step(r#"log_event:{"event":"launch","significance":"high"}"#).unwrap();
        assert_eq!(structured.kind, StepKind::LogEvent);
        assert_eq!(structured.payload.extra["event"], "launch");

        let bare = parse_step("tag_memory").unwrap();
        assert_eq!(bare.payload, StepPayload::default());
    }

    #[test]
    fn unknown_step_kind_is_refused() {
        let err = parse_step("summon_demon:now").unwrap_err();
        assert_eq!(err.to_string(), "Unknown step kind: summon_demon");
    }

    #[test]
    fn submit_collects_repeated_steps() {
        let parsed = parse_submit_args(
            &args(&[
                "submit",
                "--agent",
                "chora",
                "--title",
                "Map the market",
                "--step",
                "scan_signals:ai agents",
                "--description",
                "weekly sweep",
                "--step",
                "distill_insight",
            ]),
            2,
        )
        .unwrap();
        assert_eq!(parsed.agent, "chora");
        assert_eq!(parsed.description.as_deref(), Some("weekly sweep"));
        assert_eq!(parsed.steps.len(), 2);
        assert_eq!(parsed.steps[1].kind, StepKind::DistillInsight);
    }

    #[test]
    fn submit_requires_agent_title_and_steps() {
        let no_steps = parse_submit_args(&args(&["submit", "--agent", "chora", "--title", "x"]), 2);
        assert!(no_steps.unwrap_err().to_string().contains("--step"));

        let stranger = parse_submit_args(
            &args(&["submit", "--agent", "nobody", "--title", "x", "--step", "analyze"]),
            2,
        );
        assert!(stranger.unwrap_err().to_string().starts_with("Unknown agent: nobody"));

        let untitled = parse_submit_args(&args(&["submit", "--agent", "chora", "--step", "analyze"]), 2);
        assert!(untitled.unwrap_err().to_string().contains("--title"));
    }

    #[test]
    fn enqueue_splits_participants() {
        let parsed = parse_enqueue_args(
            &args(&[
                "enqueue",
                "--format",
                "standup",
                "--topic",
                "priorities",
                "--participants",
                "chora, praxis,mux",
            ]),
            2,
        )
        .unwrap();
        assert_eq!(parsed.participants, vec!["chora", "praxis", "mux"]);

        let bad_format = parse_enqueue_args(
            &args(&["enqueue", "--format", "karaoke", "--topic", "t", "--participants", "chora,mux"]),
            2,
        );
        assert!(bad_format.unwrap_err().to_string().contains("karaoke"));
    }

    #[test]
    fn work_reads_kind_and_once() {
        let (kind, once) = parse_work_args(&args(&["work", "roundtable", "--once"]), 2).unwrap();
        assert_eq!(kind, daemon::WorkerKind::Roundtable);
        assert!(once);
        assert!(parse_work_args(&args(&["work", "payroll"]), 2).is_err());
        assert!(parse_work_args(&args(&["work"]), 2).is_err());
    }
}
