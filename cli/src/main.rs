//! Keel CLI - inspect session storage without a running host.
//!
//! ```text
//! keel classify <error> [--provider P --model M]
//! keel prune <session> [--root DIR]
//! keel scan <session> [--root DIR]
//! keel loop-status
//! ```
//!
//! Every command prints JSON to stdout. Logs go to `~/.keel/logs/keel.log`.

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use std::{
    env,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use keel_context::{
    ErrorClassifier, PruneReason, Pruner, PruningMode, TranscriptStore, detect_structural_error,
    find_orphaned_tool_uses,
};
use keel_engine::{KeelConfig, LoopStateFile, PruningService};
use keel_types::SessionId;

const USAGE: &str = "usage:
  keel classify <error> [--provider P --model M]
  keel prune <session> [--root DIR]
  keel scan <session> [--root DIR]
  keel loop-status";

/// Outputs this large are worth listing in a scan.
const SCAN_MIN_OUTPUT_CHARS: usize = 10_000;
const SCAN_MAX_OUTPUTS: usize = 10;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_keel_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries the command output, so fall back to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_keel_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in keel_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn keel_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: next to the config file, ~/.keel/logs/keel.log
    if let Some(config_path) = KeelConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("keel.log"));
    }

    candidates.push(PathBuf::from(".keel").join("logs").join("keel.log"));

    candidates
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Classify {
        error: String,
        provider: Option<String>,
        model: Option<String>,
    },
    Prune {
        session: SessionId,
        root: Option<PathBuf>,
    },
    Scan {
        session: SessionId,
        root: Option<PathBuf>,
    },
    LoopStatus,
    Help,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command> {
    let mut args = args.into_iter();
    let Some(name) = args.next() else {
        return Ok(Command::Help);
    };

    let mut positional = Vec::new();
    let mut provider = None;
    let mut model = None;
    let mut root = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--provider" => provider = Some(args.next().context("--provider needs a value")?),
            "--model" => model = Some(args.next().context("--model needs a value")?),
            "--root" => root = Some(PathBuf::from(args.next().context("--root needs a value")?)),
            flag if flag.starts_with("--") => bail!("unknown flag {flag}\n{USAGE}"),
            _ => positional.push(arg),
        }
    }

    let single = |what: &str, positional: Vec<String>| -> Result<String> {
        match <[String; 1]>::try_from(positional) {
            Ok([value]) => Ok(value),
            Err(_) => bail!("{name} takes exactly one {what}\n{USAGE}"),
        }
    };

    match name.as_str() {
        "classify" => Ok(Command::Classify {
            error: single("error", positional)?,
            provider,
            model,
        }),
        "prune" => Ok(Command::Prune {
            session: SessionId::new(single("session id", positional)?),
            root,
        }),
        "scan" => Ok(Command::Scan {
            session: SessionId::new(single("session id", positional)?),
            root,
        }),
        "loop-status" => Ok(Command::LoopStatus),
        "help" | "-h" | "--help" => Ok(Command::Help),
        other => bail!("unknown command {other}\n{USAGE}"),
    }
}

fn store_for(config: &KeelConfig, root: Option<PathBuf>) -> Result<TranscriptStore> {
    let root = root
        .or_else(|| config.storage_root())
        .context("no storage root: pass --root or set [storage] root")?;
    Ok(TranscriptStore::new(root))
}

/// Error text from the command line: JSON payloads are parsed, anything else
/// is treated as a bare message.
fn error_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn classify(config: &KeelConfig, error: &str, provider: Option<&str>, model: Option<&str>) -> Value {
    let payload = error_payload(error);
    let classifier = ErrorClassifier::new(config.model_registry());
    let parsed = classifier
        .classify(&payload, provider, model)
        .or_else(|| detect_structural_error(&payload));
    match parsed {
        Some(parsed) => json!({ "classified": true, "error": parsed }),
        None => json!({ "classified": false }),
    }
}

fn prune(config: &KeelConfig, store: TranscriptStore, session: &SessionId) -> Result<Value> {
    let messages = store.list_messages(session)?;
    let pruning_config = config.pruning().to_pruning_config();
    let analysis = Pruner::new(pruning_config.clone()).analyze(&messages);

    let service = PruningService::new(Arc::new(store), pruning_config);
    let count = service.execute_pruning(session, PruningMode::DryRun);

    let marked: Vec<Value> = analysis
        .calls()
        .iter()
        .filter(|call| analysis.is_marked(call.primary_part()))
        .map(|call| {
            json!({
                "message": call.message_id,
                "parts": call.part_ids,
                "tool": call.tool,
                "reason": analysis.reason(call.primary_part()).map(PruneReason::as_str),
            })
        })
        .collect();

    Ok(json!({
        "session": session,
        "tool_calls": analysis.calls().len(),
        "would_prune": count,
        "marked": marked,
    }))
}

fn scan(store: &TranscriptStore, session: &SessionId) -> Result<Value> {
    let messages = store.list_messages(session)?;
    let orphaned: serde_json::Map<String, Value> = messages
        .iter()
        .filter(|message| message.is_assistant())
        .filter_map(|message| {
            let ids = find_orphaned_tool_uses(message, &messages);
            (!ids.is_empty()).then(|| (message.info.id.to_string(), json!(ids)))
        })
        .collect();
    let largest: Vec<Value> = store
        .find_tool_outputs_by_size(session, SCAN_MIN_OUTPUT_CHARS)?
        .into_iter()
        .take(SCAN_MAX_OUTPUTS)
        .map(|output| {
            json!({
                "message": output.message_id,
                "part": output.part_id,
                "tool": output.tool,
                "chars": output.output_len,
            })
        })
        .collect();

    Ok(json!({
        "session": session,
        "messages": messages.len(),
        "errored_messages": messages
            .iter()
            .filter(|message| message.info.error.is_some())
            .map(|message| &message.info.id)
            .collect::<Vec<_>>(),
        "empty_messages": store.find_empty_messages(session)?,
        "thinking_only": store.find_messages_with_thinking_only(session)?,
        "misplaced_thinking": store.find_messages_with_orphan_thinking(session)?,
        "orphaned_tool_uses": orphaned,
        "largest_tool_outputs": largest,
        "summarized": messages.iter().any(|message| message.info.summary),
    }))
}

fn loop_status(config: &KeelConfig) -> Result<Value> {
    let path = config
        .loop_state_file()
        .context("no loop state file: set [storage] loop_state_file")?;
    let file = LoopStateFile::new(path);
    let state = file.load()?;
    Ok(json!({
        "path": file.path(),
        "state": state,
    }))
}

fn run(command: Command, config: &KeelConfig, out: &mut impl Write) -> Result<()> {
    let output = match command {
        Command::Classify {
            error,
            provider,
            model,
        } => classify(config, &error, provider.as_deref(), model.as_deref()),
        Command::Prune { session, root } => prune(config, store_for(config, root)?, &session)?,
        Command::Scan { session, root } => scan(&store_for(config, root)?, &session)?,
        Command::LoopStatus => loop_status(config)?,
        Command::Help => {
            writeln!(out, "{USAGE}")?;
            return Ok(());
        }
    };
    writeln!(out, "{}", serde_json::to_string_pretty(&output)?)?;
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();

    let command = parse_args(env::args().skip(1))?;
    let config = KeelConfig::load()?.unwrap_or_default();
    tracing::debug!(?command, "Running command");

    let mut stdout = io::stdout().lock();
    run(command, &config, &mut stdout)
}
