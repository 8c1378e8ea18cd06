use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use noteping_core::auth::SessionAuth;
use noteping_core::config::EngineConfig;
use noteping_core::dispatch::{resolve_click, NotificationRender, PushPayload};
use noteping_core::poller::{CompletionPoller, PollOptions};
use noteping_core::summary::{NoteDisplay, SummaryUpdate, SummaryWatcher};
use noteping_core::test_harness::{run_simulator, SimulatorConfig};
use noteping_core::types::Credential;
use noteping_http::HttpBackend;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("noteping")
        .version(noteping_core::VERSION)
        .about("Notification subscription engine tooling")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Engine configuration file (TOML)"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run the reconciler simulator")
                .arg(
                    Arg::new("operations")
                        .long("operations")
                        .default_value("1000")
                        .value_parser(value_parser!(u64))
                        .help("Number of operations to simulate"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("concurrency")
                        .long("concurrency")
                        .default_value("4")
                        .value_parser(value_parser!(usize))
                        .help("Largest burst of concurrent activations"),
                )
                .arg(
                    Arg::new("keep-going")
                        .long("keep-going")
                        .action(ArgAction::SetTrue)
                        .help("Continue after the first violation"),
                ),
        )
        .subcommand(
            Command::new("watch")
                .about("Poll a note until its AI summary is ready")
                .arg(
                    Arg::new("note-id")
                        .long("note-id")
                        .required(true)
                        .value_parser(value_parser!(i64))
                        .help("Note to watch"),
                )
                .arg(
                    Arg::new("base-url")
                        .long("base-url")
                        .help("Backend base URL (overrides config)"),
                )
                .arg(
                    Arg::new("token")
                        .long("token")
                        .env("NOTEPING_TOKEN")
                        .help("Bearer token for the backend"),
                )
                .arg(
                    Arg::new("max-attempts")
                        .long("max-attempts")
                        .value_parser(value_parser!(u32))
                        .help("Fetches before giving up (overrides config)"),
                )
                .arg(
                    Arg::new("interval-ms")
                        .long("interval-ms")
                        .value_parser(value_parser!(u64))
                        .help("Delay between fetches (overrides config)"),
                ),
        )
        .subcommand(
            Command::new("payload")
                .about("Preview how a push payload renders and where a click leads")
                .arg(
                    Arg::new("payload")
                        .value_name("JSON")
                        .required(true)
                        .help("Payload JSON as sent by the backend"),
                ),
        )
        .subcommand(Command::new("config").about("Print the effective configuration"))
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<EngineConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("json"));

    let code = match run(&matches).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = ?e, "command failed");
            eprintln!("error: {e:#}");
            2
        }
    };
    std::process::exit(code);
}

async fn run(matches: &ArgMatches) -> anyhow::Result<i32> {
    let config = load_config(matches)?;

    match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await,
        Some(("watch", args)) => watch(args, config).await,
        Some(("payload", args)) => payload(args),
        Some(("config", _)) => {
            print!("{}", config.to_toml_string()?);
            Ok(0)
        }
        _ => {
            cli().print_help()?;
            Ok(0)
        }
    }
}

async fn simulate(args: &ArgMatches) -> anyhow::Result<i32> {
    let config = SimulatorConfig {
        seed: *args.get_one::<u64>("seed").context("missing --seed")?,
        total_operations: *args.get_one::<u64>("operations").context("missing --operations")?,
        stop_on_first_violation: !args.get_flag("keep-going"),
        max_concurrency: *args.get_one::<usize>("concurrency").context("missing --concurrency")?,
    };
    tracing::info!(
        seed = config.seed,
        operations = config.total_operations,
        "running reconciler simulator"
    );

    let report = run_simulator(config).await;
    println!("{}", report.generate_text());
    Ok(if report.passed() { 0 } else { 1 })
}

struct StdoutDisplay(mpsc::UnboundedSender<SummaryUpdate>);

impl NoteDisplay for StdoutDisplay {
    fn show(&self, update: SummaryUpdate) {
        let _ = self.0.send(update);
    }
}

async fn watch(args: &ArgMatches, mut config: EngineConfig) -> anyhow::Result<i32> {
    let note_id = *args.get_one::<i64>("note-id").context("missing --note-id")?;
    if let Some(base_url) = args.get_one::<String>("base-url") {
        config = config.with_base_url(base_url.clone());
    }
    if let Some(max_attempts) = args.get_one::<u32>("max-attempts") {
        config.poller.max_attempts = *max_attempts;
    }
    if let Some(interval_ms) = args.get_one::<u64>("interval-ms") {
        config.poller.interval_ms = *interval_ms;
    }
    config.validate()?;

    let auth = Arc::new(match args.get_one::<String>("token") {
        Some(token) => SessionAuth::signed_in(Credential::bearer(token.clone())),
        None => SessionAuth::new(),
    });
    let backend = HttpBackend::new(&config.backend, auth)?;
    tracing::info!(note_id, base_url = %backend.base_url(), "watching note");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = SummaryWatcher::new(
        CompletionPoller::new(&config.poller),
        Arc::new(backend),
        Arc::new(StdoutDisplay(tx)),
    )
    .with_options(PollOptions::new(
        config.poller.max_attempts,
        Duration::from_millis(config.poller.interval_ms),
    ));
    watcher.watch(note_id);

    match rx.recv().await {
        Some(SummaryUpdate::Ready(note)) => {
            println!("{}", note.ai_summary.unwrap_or_default());
            Ok(0)
        }
        Some(SummaryUpdate::StillPending { .. }) => {
            println!("Summary for note {note_id} is still being generated.");
            Ok(1)
        }
        None => anyhow::bail!("watcher stopped without a result"),
    }
}

fn payload(args: &ArgMatches) -> anyhow::Result<i32> {
    let raw = args.get_one::<String>("payload").context("missing payload")?;
    let render = match serde_json::from_str::<PushPayload>(raw) {
        Ok(payload) => NotificationRender::from_payload(payload),
        Err(e) => {
            tracing::warn!(error = %e, "payload does not decode, showing fallback");
            NotificationRender::fallback(raw.trim())
        }
    };
    let target = resolve_click(&render.data);
    let preview = serde_json::json!({
        "render": render,
        "click": target.path(),
    });
    println!("{}", serde_json::to_string_pretty(&preview)?);
    Ok(0)
}
