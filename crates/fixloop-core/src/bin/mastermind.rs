//! `mastermind`: run the coordinator over a line protocol on stdin/stdout

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use fixloop_core::{
    parse_line, Coordinator, Egress, HttpOracle, IngressMessage, JsonLinesEgress,
    MastermindConfig, Notification, NotificationKind, SessionServices,
};
use fixloop_kernel::{Issue, Oracle, Persona};
use fixloop_learning::LearningStore;
use fixloop_testers::{report_all, HttpProbe, IssueSink, SinkError, Tester};
use fixloop_workers::WorkerSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const INGRESS_BUFFER: usize = 64;

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .short('c')
        .value_parser(value_parser!(PathBuf))
        .help("TOML configuration file; defaults apply when omitted")
}

fn cli() -> Command {
    Command::new("mastermind")
        .version(fixloop_core::VERSION)
        .about("Autonomous fix-session coordinator")
        .subcommand_required(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("run")
                .about("Read issue reports and commands from stdin, write notifications to stdout")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("check-config")
                .about("Load, override from the environment, and validate a configuration")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("testers")
                .about("Run persona testers against an app and print issue reports")
                .arg(config_arg())
                .arg(
                    Arg::new("base-url")
                        .long("base-url")
                        .required(true)
                        .help("Base URL of the app under test"),
                )
                .arg(
                    Arg::new("persona")
                        .long("persona")
                        .action(ArgAction::Append)
                        .help("Persona to run (grandma, teen, curator, security); all when omitted"),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .default_value("30")
                        .value_parser(value_parser!(u64))
                        .help("Page load timeout in seconds"),
                ),
        )
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(args: &ArgMatches) -> Result<MastermindConfig> {
    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => MastermindConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MastermindConfig::new(),
    };
    let config = config.apply_env().context("applying environment overrides")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn oracle(config: &MastermindConfig) -> Result<Arc<dyn Oracle>> {
    let key_var = &config.oracle.api_key_env;
    let key = std::env::var(key_var).with_context(|| format!("{key_var} is not set"))?;
    Ok(Arc::new(HttpOracle::new(&config.oracle, key)?))
}

fn learning_store(config: &MastermindConfig) -> Result<LearningStore> {
    match &config.learning.store_path {
        Some(path) => LearningStore::open(path)
            .with_context(|| format!("opening lesson store {}", path.display())),
        None => {
            tracing::warn!("no learning.store_path configured, lessons will not persist");
            Ok(LearningStore::in_memory())
        }
    }
}

async fn run(config: MastermindConfig) -> Result<()> {
    let learning = Arc::new(learning_store(&config)?);
    tracing::info!(lessons = learning.len(), "lesson store ready");
    let stdout: Arc<dyn Egress> = Arc::new(JsonLinesEgress::new(tokio::io::stdout()));
    let services = SessionServices::from_config(
        &config,
        oracle(&config)?,
        WorkerSet::from_settings(&config.workers),
        learning,
        stdout,
    );
    let egress = Arc::clone(&services.egress);
    let coordinator = Coordinator::new(config, services);

    let (tx, rx) = mpsc::channel::<IngressMessage>(INGRESS_BUFFER);
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "stdin read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line) {
                Ok(message) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "malformed ingress line");
                    egress
                        .publish(Notification::operator(NotificationKind::Error, err.to_string()))
                        .await;
                }
            }
        }
        tracing::info!("ingress closed");
    });

    coordinator.run(rx).await;
    reader.await.context("ingress reader")?;
    Ok(())
}

/// Writes each issue as a `report_issue` line on stdout
struct StdoutSink {
    out: Mutex<tokio::io::Stdout>,
}

#[async_trait]
impl IssueSink for StdoutSink {
    async fn enqueue(&self, issue: Issue) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&IngressMessage::report(issue))
            .map_err(|e| SinkError::Write(e.to_string()))?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| SinkError::Write(e.to_string()))?;
        out.flush().await.map_err(|e| SinkError::Write(e.to_string()))
    }
}

fn parse_persona(name: &str) -> Result<Persona> {
    Persona::ALL
        .into_iter()
        .find(|p| p.reporter_name().eq_ignore_ascii_case(name))
        .with_context(|| format!("unknown persona `{name}`"))
}

async fn testers(config: MastermindConfig, args: &ArgMatches) -> Result<()> {
    let Some(base_url) = args.get_one::<String>("base-url") else {
        bail!("--base-url is required");
    };
    let timeout = Duration::from_secs(args.get_one::<u64>("timeout").copied().unwrap_or(30));
    let personas = match args.get_many::<String>("persona") {
        Some(names) => names.map(|n| parse_persona(n)).collect::<Result<Vec<_>>>()?,
        None => Persona::ALL.to_vec(),
    };
    let probe = Arc::new(HttpProbe::new(base_url.clone(), timeout)?);
    let oracle = oracle(&config)?;
    let sink = StdoutSink {
        out: Mutex::new(tokio::io::stdout()),
    };

    let runs = personas.into_iter().map(|persona| {
        let tester = Tester::new(persona, probe.clone(), Arc::clone(&oracle));
        async move { tester.run_all().await }
    });
    let mut total = 0;
    for issues in futures::future::join_all(runs).await {
        total += report_all(&sink, issues).await?;
    }
    tracing::info!(issues = total, "tester run finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("log-json"));

    match matches.subcommand() {
        Some(("run", args)) => run(load_config(args)?).await,
        Some(("check-config", args)) => {
            let config = load_config(args)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(("testers", args)) => testers(load_config(args)?, args).await,
        _ => bail!("no subcommand given"),
    }
}
