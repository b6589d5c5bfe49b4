use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::debug;
use vtask::bucket::Dashboard;
use vtask::config::EngineConfig;
use vtask::core::{Status, Task};
use vtask::engine::{Engine, TracingListener};
use vtask::matcher::RipgrepMatcher;
use vtask::mutate::{DateTarget, MutationOutcome};
use vtask::{LineTransform, parse_task};

#[derive(Debug, Parser)]
#[command(
    name = "vtask",
    about = "Find, rank and edit checkbox tasks in a vault of notes",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON engine settings; defaults apply to anything left out.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print every open and done task in ranked order.
    List(ListArgs),

    /// Print ranked tasks grouped by urgency.
    Dashboard(DashboardArgs),

    /// Parse raw task lines without touching the filesystem.
    Parse(ParseArgs),

    /// Change the checkbox status of one task line.
    Status(StatusArgs),

    /// Set or replace the due date of one task line.
    Due(DateArgs),

    /// Hide one task line until a later date.
    Snooze(DateArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Vault root directory.
    vault: PathBuf,
    /// Evaluate urgency at this instant (YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS).
    #[arg(long, value_parser = parse_now)]
    now: Option<NaiveDateTime>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct DashboardArgs {
    /// Vault root directory.
    vault: PathBuf,
    /// Evaluate urgency at this instant (YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS).
    #[arg(long, value_parser = parse_now)]
    now: Option<NaiveDateTime>,
    /// Maximum tasks per group; overrides the config file.
    #[arg(long)]
    cap: Option<usize>,
    /// Emit JSON instead of a human-readable dashboard.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Raw lines, e.g. "- [ ] Pay rent 📅 2024-03-01".
    #[arg(required = true)]
    lines: Vec<String>,
    /// Note the lines are attributed to.
    #[arg(long, default_value = "inline.md")]
    path: PathBuf,
    /// Evaluate urgency at this instant (YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS).
    #[arg(long, value_parser = parse_now)]
    now: Option<NaiveDateTime>,
}

#[derive(Debug, Args)]
struct StatusArgs {
    /// Task location as FILE:LINE (1-based).
    #[arg(value_parser = parse_location)]
    target: Location,
    #[arg(value_enum)]
    status: StatusArg,
    /// Date used for completion stamps. Defaults to today.
    #[arg(long)]
    today: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct DateArgs {
    /// Task location as FILE:LINE (1-based).
    #[arg(value_parser = parse_location)]
    target: Location,
    /// YYYY-MM-DD, +Nd, +Nw, today or tomorrow.
    when: DateTarget,
    /// Date offsets are counted from. Defaults to today.
    #[arg(long)]
    today: Option<NaiveDate>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StatusArg {
    Todo,
    InProgress,
    Cancelled,
    Done,
}

impl From<StatusArg> for Status {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Todo => Status::Todo,
            StatusArg::InProgress => Status::InProgress,
            StatusArg::Cancelled => Status::Cancelled,
            StatusArg::Done => Status::Done,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Location {
    path: PathBuf,
    line: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::List(args) => handle_list(args, config),
        Commands::Dashboard(args) => handle_dashboard(args, config),
        Commands::Parse(args) => handle_parse(args),
        Commands::Status(args) => {
            let transform = LineTransform::SetStatus(args.status.into());
            handle_mutation(args.target, transform, args.today, config)
        }
        Commands::Due(args) => {
            let transform = LineTransform::SetDue(args.when);
            handle_mutation(args.target, transform, args.today, config)
        }
        Commands::Snooze(args) => {
            let transform = LineTransform::SetSnooze(args.when);
            handle_mutation(args.target, transform, args.today, config)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "vtask=debug,info" } else { "vtask=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            EngineConfig::load(path).with_context(|| format!("loading config {:?}", path))
        }
        None => Ok(EngineConfig::default()),
    }
}

fn engine(config: EngineConfig) -> Engine<RipgrepMatcher> {
    let matcher = RipgrepMatcher::from_config(&config);
    Engine::new(config, matcher).with_listener(TracingListener)
}

fn vault_root(vault: &Path) -> Result<PathBuf> {
    let root = vault
        .canonicalize()
        .with_context(|| format!("resolving vault {:?}", vault))?;
    if !root.is_dir() {
        anyhow::bail!("vault {:?} is not a directory", vault);
    }
    Ok(root)
}

fn handle_list(args: ListArgs, config: EngineConfig) -> Result<()> {
    let ListArgs { vault, now, json } = args;
    let root = vault_root(&vault)?;
    let now = now.unwrap_or_else(|| Local::now().naive_local());
    let tasks = engine(config).scan(&root, now);
    debug!(count = tasks.len(), "scan finished");

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        eprintln!("No tasks found in {:?}.", root);
        return Ok(());
    }
    for task in &tasks {
        println!("{}", task_row(task));
    }
    Ok(())
}

fn handle_dashboard(args: DashboardArgs, mut config: EngineConfig) -> Result<()> {
    let DashboardArgs {
        vault,
        now,
        cap,
        json,
    } = args;
    if let Some(cap) = cap {
        config.group_cap = cap;
        config.validate()?;
    }
    let root = vault_root(&vault)?;
    let now = now.unwrap_or_else(|| Local::now().naive_local());
    let dashboard = engine(config).dashboard(&root, now);

    if json {
        println!("{}", serde_json::to_string_pretty(&dashboard)?);
    } else {
        print!("{}", render_dashboard(&dashboard));
    }
    Ok(())
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { lines, path, now } = args;
    let now = now.unwrap_or_else(|| Local::now().naive_local());
    let relative = path.to_string_lossy().into_owned();
    let tasks: Vec<Task> = lines
        .iter()
        .enumerate()
        .map(|(idx, raw)| parse_task(&path, &relative, idx + 1, raw, now, now))
        .collect();
    println!("{}", serde_json::to_string_pretty(&tasks)?);
    Ok(())
}

fn handle_mutation(
    target: Location,
    transform: LineTransform,
    today: Option<NaiveDate>,
    config: EngineConfig,
) -> Result<()> {
    let today = today.unwrap_or_else(|| Local::now().date_naive());
    let outcome = engine(config)
        .mutate(&target.path, target.line, &transform, today)
        .with_context(|| format!("updating {:?} line {}", target.path, target.line))?;
    match outcome {
        MutationOutcome::Applied => eprintln!("Updated {}:{}.", target.path.display(), target.line),
        MutationOutcome::Unchanged => {
            eprintln!("{}:{} already up to date.", target.path.display(), target.line)
        }
        MutationOutcome::TransformFailed(err) => {
            anyhow::bail!("{}:{} left unchanged: {err}", target.path.display(), target.line)
        }
    }
    Ok(())
}

fn task_row(task: &Task) -> String {
    let due = task
        .due
        .map(|due| due.date().to_string())
        .unwrap_or_else(|| "—".to_string());
    format!(
        "{:<9} P{} {:<10} {}:{}  {}",
        task.urgency.label(),
        task.priority.value(),
        due,
        task.relative_path,
        task.line,
        task.title()
    )
}

fn render_dashboard(dashboard: &Dashboard) -> String {
    let mut out = format!(
        "{} overdue, {} due today\n",
        dashboard.overdue, dashboard.due_today
    );
    for group in &dashboard.groups {
        out.push_str(&format!("\n{}\n", group.kind.label()));
        for task in &group.tasks {
            out.push_str(&format!("  {}\n", task_row(task)));
        }
        if group.overflow > 0 {
            out.push_str(&format!("  … {} more\n", group.overflow));
        }
    }
    out
}

fn parse_location(raw: &str) -> Result<Location, String> {
    let (path, line) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("expected FILE:LINE, got {raw:?}"))?;
    let line: usize = line
        .parse()
        .map_err(|_| format!("line number {line:?} is not a positive integer"))?;
    if path.is_empty() || line == 0 {
        return Err(format!("expected FILE:LINE with LINE >= 1, got {raw:?}"));
    }
    Ok(Location {
        path: PathBuf::from(path),
        line,
    })
}

/// Accepts a full timestamp or a bare date, which means the start of that day.
fn parse_now(raw: &str) -> Result<NaiveDateTime, String> {
    if let Ok(instant) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(instant);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|date| date.and_time(NaiveTime::MIN))
        .map_err(|_| format!("expected YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS, got {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use vtask::bucket::bucketize;
    use vtask::core::Urgency;

    #[test]
    fn location_splits_on_last_colon() {
        let loc = parse_location("C:/vault/inbox.md:12").expect("location");
        assert_eq!(loc.path, PathBuf::from("C:/vault/inbox.md"));
        assert_eq!(loc.line, 12);
        assert!(parse_location("inbox.md").is_err());
        assert!(parse_location("inbox.md:0").is_err());
        assert!(parse_location(":3").is_err());
    }

    #[test]
    fn now_accepts_dates_and_timestamps() {
        let midnight = parse_now("2024-03-15").expect("date");
        assert_eq!(midnight.to_string(), "2024-03-15 00:00:00");
        let exact = parse_now("2024-03-15T18:30:00").expect("timestamp");
        assert_eq!(exact.to_string(), "2024-03-15 18:30:00");
        assert!(parse_now("tomorrow").is_err());
    }

    #[test]
    fn cli_parses_mutation_commands() {
        let cli = Cli::try_parse_from([
            "vtask", "snooze", "notes/inbox.md:4", "+1w", "--today", "2024-03-09",
        ])
        .expect("parse cli");
        match cli.command {
            Commands::Snooze(args) => {
                assert_eq!(args.target.line, 4);
                assert_eq!(args.when, DateTarget::InDays(7));
                assert_eq!(args.today, NaiveDate::from_ymd_opt(2024, 3, 9));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let status = Cli::try_parse_from(["vtask", "status", "a.md:1", "in-progress"])
            .expect("parse status");
        assert!(matches!(
            status.command,
            Commands::Status(StatusArgs {
                status: StatusArg::InProgress,
                ..
            })
        ));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(load_config(Some(&tmp.path().join("absent.json"))).is_err());
        assert_eq!(load_config(None).expect("defaults"), EngineConfig::default());
    }

    #[test]
    fn status_command_rewrites_the_line() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let note = tmp.path().join("inbox.md");
        fs::write(&note, "# Inbox\n- [ ] Buy milk\n").expect("write note");

        handle_mutation(
            Location {
                path: note.clone(),
                line: 2,
            },
            LineTransform::SetStatus(Status::Done),
            NaiveDate::from_ymd_opt(2024, 3, 15),
            EngineConfig::default(),
        )
        .expect("mutation");

        assert_eq!(
            fs::read_to_string(&note).expect("read note"),
            "# Inbox\n- [x] Buy milk ✅ 2024-03-15\n"
        );
    }

    #[test]
    fn dashboard_text_lists_groups_and_overflow() {
        let now = parse_now("2024-03-15T09:00:00").expect("now");
        let tasks: Vec<Task> = (1..=3)
            .map(|line| {
                parse_task(
                    Path::new("/v/inbox.md"),
                    "inbox.md",
                    line,
                    "- [ ] Pay rent ⏫ 📅 2024-03-01",
                    now,
                    now,
                )
            })
            .collect();
        assert_eq!(tasks[0].urgency, Urgency::Overdue);

        let text = render_dashboard(&bucketize(&tasks, 2));
        assert!(text.starts_with("3 overdue, 0 due today\n"));
        assert!(text.contains("\nOverdue\n"));
        assert!(text.contains("overdue   P2 2024-03-01 inbox.md:1  Pay rent"));
        assert!(text.contains("… 1 more"));
    }
}
