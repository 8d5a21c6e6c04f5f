use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use orgtree::agenda::{self, AgendaWhenKind};
use orgtree::config::Config;
use orgtree::core::{Item, ItemId, Outline};
use orgtree::storage::{FsStore, OutlineStore};
use orgtree::timestamp::{format_duration, format_org_date};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "orgtree",
    about = "Outline task files: list, normalize, capture and plan",
    version
)]
struct Cli {
    /// Config file. Defaults to <config dir>/orgtree/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the outline as an indented list.
    Show(ShowArgs),

    /// Rewrite the file(s) in canonical form.
    Format(FormatArgs),

    /// Add a new item at the top of the outline and save.
    Capture(CaptureArgs),

    /// List items scheduled or due within the agenda window.
    Agenda(AgendaArgs),
}

#[derive(Debug, Args)]
struct Source {
    /// Outline file, or a directory of .org files with --multi.
    path: Option<PathBuf>,
    /// Load every .org file in the directory, one top-level item per file.
    #[arg(long)]
    multi: bool,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[command(flatten)]
    source: Source,
    /// Emit JSON instead of a list.
    #[arg(long)]
    json: bool,
    /// Include children of folded items.
    #[arg(long)]
    all: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    #[command(flatten)]
    source: Source,
    /// Only report files that would change; exit non-zero if any would.
    #[arg(long)]
    check: bool,
}

#[derive(Debug, Args)]
struct CaptureArgs {
    /// Title of the new item.
    title: String,
    #[command(flatten)]
    source: Source,
    /// With --multi, the file name to capture into (defaults to the first file).
    #[arg(long)]
    into: Option<String>,
}

#[derive(Debug, Args)]
struct AgendaArgs {
    #[command(flatten)]
    source: Source,
    /// Window length in days. Defaults to the configured value.
    #[arg(long)]
    days: Option<u64>,
    /// Emit JSON instead of a list.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Show(args) => handle_show(args, &config),
        Commands::Format(args) => handle_format(args, &config),
        Commands::Capture(args) => handle_capture(args, &config),
        Commands::Agenda(args) => handle_agenda(args, &config),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("config file {:?} does not exist", path);
            }
            path.to_path_buf()
        }
        None => match Config::default_path() {
            Some(path) => path,
            None => return Ok(Config::default()),
        },
    };
    Config::load(&path).with_context(|| format!("loading config {:?}", path))
}

impl Source {
    fn resolve(&self) -> PathBuf {
        match (&self.path, self.multi) {
            (Some(path), _) => path.clone(),
            (None, true) => PathBuf::from("."),
            (None, false) => PathBuf::from("todo.org"),
        }
    }

    fn load(&self, store: &FsStore) -> Result<Outline> {
        let path = self.resolve();
        if self.multi {
            store
                .load_dir(&path)
                .with_context(|| format!("loading directory {:?}", path))
        } else {
            store
                .load(&path)
                .with_context(|| format!("loading {:?}", path))
        }
    }
}

fn handle_show(args: ShowArgs, config: &Config) -> Result<()> {
    let store = FsStore::new(config.grammar());
    let outline = args.source.load(&store)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outline)?);
        return Ok(());
    }

    let now = Local::now().naive_local();
    let ids = if args.all {
        outline.preorder()
    } else {
        outline.visible()
    };
    for id in ids {
        if let Some(item) = outline.get(id) {
            println!("{}", describe(item, now));
        }
    }
    Ok(())
}

fn handle_format(args: FormatArgs, config: &Config) -> Result<()> {
    let store = FsStore::new(config.grammar());
    let outline = args.source.load(&store)?;
    if !args.check {
        return store.save(&outline).context("saving outline");
    }

    let changed = files_needing_format(&store, &outline)?;
    for path in &changed {
        eprintln!("would reformat {}", path.display());
    }
    if !changed.is_empty() {
        anyhow::bail!("{} file(s) would be reformatted", changed.len());
    }
    Ok(())
}

/// Files whose text on disk differs from the canonical rendering. A missing
/// file counts as empty.
fn files_needing_format(store: &FsStore, outline: &Outline) -> Result<Vec<PathBuf>> {
    let mut changed = Vec::new();
    for (path, text) in store.render(outline) {
        let current = match fs::read_to_string(&path) {
            Ok(current) => current,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err).with_context(|| format!("reading {:?}", path)),
        };
        if current != text {
            changed.push(path);
        }
    }
    Ok(changed)
}

fn handle_capture(args: CaptureArgs, config: &Config) -> Result<()> {
    let store = FsStore::new(config.grammar());
    let mut outline = args.source.load(&store)?;
    let selected = match &args.into {
        Some(name) => Some(wrapper_named(&outline, name)?),
        None => None,
    };
    let state = config.default_new_task_state();
    let (_, outcome) = outline.capture(&args.title, state.as_deref(), selected)?;
    store.save(&outline).context("saving outline")?;
    println!("{outcome}");
    Ok(())
}

fn handle_agenda(args: AgendaArgs, config: &Config) -> Result<()> {
    let store = FsStore::new(config.grammar());
    let outline = args.source.load(&store)?;
    let today = Local::now().date_naive();
    let rows = agenda::project(&outline, today, args.days.unwrap_or(config.agenda.days));
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for row in rows {
        let kind = match row.when_kind {
            AgendaWhenKind::Scheduled => "Scheduled",
            AgendaWhenKind::Deadline => "Deadline",
        };
        let state = row.state.map(|s| format!("{s} ")).unwrap_or_default();
        let overdue = if row.overdue { "  (overdue)" } else { "" };
        println!(
            "{:<20} {:<9}  {}{}{}",
            format_org_date(&row.when),
            kind,
            state,
            row.title,
            overdue
        );
    }
    Ok(())
}

fn wrapper_named(outline: &Outline, name: &str) -> Result<ItemId> {
    if !outline.is_multi_document() {
        anyhow::bail!("--into needs --multi");
    }
    outline
        .roots()
        .iter()
        .copied()
        .find(|id| outline.get(*id).is_some_and(|item| item.title == name))
        .with_context(|| format!("no file named {name:?} in the outline"))
}

/// One list row: indent, fold marker, state, priority, title, tags, clock sum.
fn describe(item: &Item, now: NaiveDateTime) -> String {
    let mut line = "  ".repeat(item.level.saturating_sub(1));
    line.push_str(if item.folded && !item.children().is_empty() {
        "+ "
    } else {
        "- "
    });
    if let Some(state) = &item.state {
        line.push_str(state);
        line.push(' ');
    }
    if let Some(priority) = item.priority {
        line.push_str(&format!("[#{priority}] "));
    }
    line.push_str(&item.title);
    if !item.tags.is_empty() {
        line.push_str(" :");
        for tag in &item.tags {
            line.push_str(&tag.0);
            line.push(':');
        }
    }
    if !item.clock.is_empty() {
        let running = if item.is_clocked_in() { " running" } else { "" };
        line.push_str(&format!(
            "  [{}{running}]",
            format_duration(item.total_clock_duration(now))
        ));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgtree::classify::Grammar;
    use orgtree::parser::parse_outline;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").expect("datetime")
    }

    #[test]
    fn describe_shows_state_tags_and_clock() {
        let text = "\
** TODO [#B] Review :work:
:LOGBOOK:
CLOCK: [2024-01-15 Mon 09:00]--[2024-01-15 Mon 09:30]
CLOCK: [2024-01-15 Mon 10:00]
:END:
";
        let outline = parse_outline("todo.org", text, &Grammar::default());
        let item = outline.get(outline.roots()[0]).expect("item");
        assert_eq!(
            describe(item, at("2024-01-15 10:15")),
            "  - TODO [#B] Review :work:  [0:45 running]"
        );
    }

    #[test]
    fn source_defaults() {
        let single = Source {
            path: None,
            multi: false,
        };
        assert_eq!(single.resolve(), PathBuf::from("todo.org"));
        let multi = Source {
            path: None,
            multi: true,
        };
        assert_eq!(multi.resolve(), PathBuf::from("."));
    }

    #[test]
    fn capture_into_named_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.org"), "* a1\n").expect("write a");
        fs::write(tmp.path().join("b.org"), "* b1\n").expect("write b");
        let args = CaptureArgs {
            title: "call back".into(),
            source: Source {
                path: Some(tmp.path().to_path_buf()),
                multi: true,
            },
            into: Some("b.org".into()),
        };
        handle_capture(args, &Config::default()).expect("capture");
        let b = fs::read_to_string(tmp.path().join("b.org")).expect("read b");
        assert_eq!(b, "* TODO call back\n* b1\n");
        let a = fs::read_to_string(tmp.path().join("a.org")).expect("read a");
        assert_eq!(a, "* a1\n");
    }

    #[test]
    fn format_check_reports_read_errors() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = FsStore::default();

        let missing = tmp.path().join("missing.org");
        let empty = store.load(&missing).expect("load missing");
        assert!(files_needing_format(&store, &empty).expect("check").is_empty());

        let messy = tmp.path().join("messy.org");
        fs::write(&messy, "*  TODO   spaced\n").expect("write");
        let outline = store.load(&messy).expect("load");
        assert_eq!(files_needing_format(&store, &outline).expect("check"), vec![messy]);

        // a directory where the file should be cannot be read
        let unreadable = Outline::new(tmp.path());
        let err = files_needing_format(&store, &unreadable).expect_err("directory is not a file");
        assert!(err.to_string().starts_with("reading"));
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["orgtree", "agenda", "notes", "--multi", "--days", "3", "--verbose"])
            .expect("parse");
        assert!(cli.verbose);
        match cli.command {
            Commands::Agenda(args) => {
                assert!(args.source.multi);
                assert_eq!(args.days, Some(3));
                assert_eq!(args.source.path, Some(PathBuf::from("notes")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
