use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use uuid::Uuid;
use veracity_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use veracity_contracts::events::EventWriter;
use veracity_contracts::records::{HistoryEntry, ImageFile, ImageRecord, RecordStatus};
use veracity_engine::{default_service_registry, ServiceConfig, Workbench, WorkbenchSnapshot};

#[derive(Debug, Parser)]
#[command(name = "veracity", version, about = "Image authenticity workbench")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Analyze(AnalyzeArgs),
}

#[derive(Debug, Args)]
struct ServiceArgs {
    #[arg(long, default_value = "gemini")]
    service: String,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    analysis_model: Option<String>,
    #[arg(long)]
    highlight_model: Option<String>,
    #[arg(long)]
    chat_model: Option<String>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    service: ServiceArgs,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long = "image", required = true)]
    images: Vec<PathBuf>,
    #[arg(long)]
    ask: Option<String>,
    #[command(flatten)]
    service: ServiceArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("veracity error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Analyze(args) => run_analyze(args),
    }
}

fn open_workbench(args: &ServiceArgs) -> Result<Workbench> {
    let mut config = ServiceConfig::from_env();
    if args.analysis_model.is_some() {
        config.analysis_model = args.analysis_model.clone();
    }
    if args.highlight_model.is_some() {
        config.highlight_model = args.highlight_model.clone();
    }
    if args.chat_model.is_some() {
        config.chat_model = args.chat_model.clone();
    }

    let services = default_service_registry(&config)?;
    let Some(service) = services.get(&args.service) else {
        bail!(
            "unknown service '{}' (available: {})",
            args.service,
            services.names().join(", ")
        );
    };
    let models = config.resolve_models(&args.service)?;
    for note in &models.notes {
        eprintln!("note: {note}");
    }

    let session_id = Uuid::new_v4().to_string();
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| default_events_path(&session_id));
    Workbench::new(service, EventWriter::new(events_path, session_id))
}

fn default_events_path(session_id: &str) -> PathBuf {
    std::env::temp_dir()
        .join("veracity")
        .join(format!("events-{session_id}.jsonl"))
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let workbench = open_workbench(&args.service)?;
    let stdin = io::stdin();
    let mut line = String::new();

    println!(
        "Veracity chat started ({}). Type /help for commands.",
        workbench.service_name()
    );
    println!("Events: {}", workbench.events().path().display());

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => continue,
            "quit" => break,
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
                println!("Anything else is a question about the selected image.");
            }
            "add_images" => {
                let paths = value_as_string_list(intent.command_args.get("paths"));
                if paths.is_empty() {
                    println!("/add requires one or more image paths");
                    continue;
                }
                let mut files = Vec::with_capacity(paths.len());
                for path in paths {
                    match ImageFile::load(Path::new(&path)) {
                        Ok(file) => files.push(file),
                        Err(err) => println!("Skipped {path}: {err:#}"),
                    }
                }
                let ids = workbench.add_images(files);
                println!("Added {} image(s).", ids.len());
                print_records(&workbench.snapshot());
            }
            "analyze_batch" => {
                let pending = workbench.snapshot().pending_count;
                if pending == 0 {
                    println!("Nothing pending. Use /add first.");
                    continue;
                }
                println!("Analyzing {pending} image(s)...");
                let report = workbench.analyze_batch();
                println!(
                    "Done: {} succeeded, {} failed.",
                    report.succeeded, report.failed
                );
                print_records(&workbench.snapshot());
            }
            "select_image" => {
                let target = value_as_non_empty_string(intent.command_args.get("target"));
                let Some(target) = target else {
                    println!("/select requires an image id or number");
                    continue;
                };
                let snapshot = workbench.snapshot();
                let ids: Vec<&str> = snapshot.records.iter().map(|r| r.id.as_str()).collect();
                let Some(id) = resolve_target(&target, &ids) else {
                    println!("No image matches '{target}'.");
                    continue;
                };
                if workbench.select_image(&id) {
                    print_selected(&workbench.snapshot());
                } else {
                    println!("{id} is already selected.");
                }
            }
            "highlight" => {
                let requested = value_as_non_empty_string(intent.command_args.get("path"));
                run_highlight(&workbench, requested.map(PathBuf::from))?;
            }
            "show_history" => print_history(&workbench.snapshot().history),
            "select_history" => {
                let target = value_as_non_empty_string(intent.command_args.get("target"));
                let Some(target) = target else {
                    println!("/load requires a History id or number");
                    continue;
                };
                let snapshot = workbench.snapshot();
                let ids: Vec<&str> = snapshot.history.iter().map(|e| e.id.as_str()).collect();
                match resolve_target(&target, &ids) {
                    Some(id) if workbench.select_history(&id) => {
                        workbench.drain_released_previews();
                        print_selected(&workbench.snapshot());
                    }
                    _ => println!("No History entry matches '{target}'."),
                }
            }
            "clear_all" => {
                workbench.clear_all();
                let released = workbench.drain_released_previews();
                let kept = workbench.snapshot().history.len();
                println!(
                    "Cleared the batch ({} preview(s) released). History keeps {kept} entr{}.",
                    released.len(),
                    if kept == 1 { "y" } else { "ies" }
                );
            }
            "status" => print_records(&workbench.snapshot()),
            "ask" => {
                let Some(message) = intent.message.as_deref() else {
                    continue;
                };
                match workbench.send_message(message) {
                    Some(reply) => println!("{}", reply.content),
                    None => println!("Select an analyzed image before asking about it."),
                }
            }
            "unknown" => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_default();
                println!("Unknown command /{command}. Type /help for commands.");
            }
            _ => {}
        }
    }
    Ok(())
}

fn run_highlight(workbench: &Workbench, requested: Option<PathBuf>) -> Result<()> {
    if !workbench.highlight_selected() {
        println!("/highlight needs a successfully analyzed image selected.");
        return Ok(());
    }
    let snapshot = workbench.snapshot();
    let Some(record) = snapshot.selected.as_ref() else {
        return Ok(());
    };
    if record.status == RecordStatus::Error {
        println!("{}", record.error.as_deref().unwrap_or_default());
        return Ok(());
    }
    let Some(image) = record.highlight.as_ref() else {
        return Ok(());
    };
    let path = requested.unwrap_or_else(|| highlight_output_path(record, &image.mime_type));
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    fs::write(&path, image.bytes())
        .with_context(|| format!("failed writing {}", path.display()))?;
    println!("Highlight written to {}", path.display());
    Ok(())
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let workbench = open_workbench(&args.service)?;
    let files = args
        .images
        .iter()
        .map(|path| ImageFile::load(path))
        .collect::<Result<Vec<_>>>()?;
    workbench.add_images(files);
    let report = workbench.analyze_batch();

    let snapshot = workbench.snapshot();
    for record in &snapshot.records {
        println!("{}", serde_json::to_string(&record_json(record))?);
    }
    if let Some(question) = args.ask.as_deref() {
        if let Some(reply) = workbench.send_message(question) {
            println!(
                "{}",
                serde_json::to_string(&json!({
                    "record_id": snapshot.selected_id,
                    "question": question,
                    "reply": reply.content,
                }))?
            );
        }
    }
    Ok(if report.failed > 0 { 2 } else { 0 })
}

fn record_json(record: &ImageRecord) -> Value {
    json!({
        "id": record.id,
        "file": record.file.name,
        "status": record.status.as_str(),
        "classification": record.result.as_ref().map(|result| result.classification.as_str()),
        "reasoning": record.result.as_ref().map(|result| result.reasoning.clone()),
        "error": record.error,
    })
}

/// Accepts an exact id or a 1-based position.
fn resolve_target(target: &str, ids: &[&str]) -> Option<String> {
    if let Some(id) = ids.iter().find(|id| **id == target) {
        return Some(id.to_string());
    }
    let index = target.parse::<usize>().ok()?;
    ids.get(index.checked_sub(1)?).map(|id| id.to_string())
}

fn highlight_output_path(record: &ImageRecord, mime_type: &str) -> PathBuf {
    let stem: String = record
        .id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    PathBuf::from(format!("{stem}-highlight.{}", extension_for_mime(mime_type)))
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

fn print_records(snapshot: &WorkbenchSnapshot) {
    if snapshot.records.is_empty() {
        println!("No images loaded.");
        return;
    }
    for (index, record) in snapshot.records.iter().enumerate() {
        let marker = if snapshot.selected_id.as_deref() == Some(record.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{marker}{:>3}. {}", index + 1, record_line(record));
    }
    if snapshot.pending_count > 0 {
        println!("{} pending. Use /analyze.", snapshot.pending_count);
    }
}

fn record_line(record: &ImageRecord) -> String {
    match (record.status, record.result.as_ref(), record.error.as_deref()) {
        (RecordStatus::Error, _, Some(error)) => format!("{} [error] {error}", record.id),
        (status, Some(result), _) => format!(
            "{} [{status}] {}",
            record.id,
            result.classification.label()
        ),
        (status, _, _) => format!("{} [{status}]", record.id),
    }
}

fn print_selected(snapshot: &WorkbenchSnapshot) {
    let Some(record) = snapshot.selected.as_ref() else {
        println!("Nothing selected.");
        return;
    };
    println!("Selected {}", record_line(record));
    for message in &record.chat_messages {
        println!("[{}] {}", message.role.as_str(), message.content);
    }
}

fn print_history(history: &[HistoryEntry]) {
    if history.is_empty() {
        println!("History is empty.");
        return;
    }
    for (index, entry) in history.iter().enumerate() {
        println!(
            "{:>3}. {} {}",
            index + 1,
            entry.id,
            entry.result.classification.label()
        );
    }
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    let raw = value
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

fn value_as_string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| item.as_str().map(str::trim).map(str::to_string))
        .filter(|item| !item.is_empty())
        .collect()
}
