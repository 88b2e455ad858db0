use std::{
    env,
    fmt::{self, Display},
    num::NonZeroU32,
    path::Path,
    str::FromStr,
    sync::Arc,
};

use clap::{ArgGroup, Args, Parser, Subcommand};
use http::Uri;
use jemallocator::Jemalloc;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use rand::{SeedableRng, rngs::SmallRng, rngs::StdRng};
use regex::Regex;
use reviewload::{
    action::Executor,
    config::{self, Config, Telemetry},
    scheduler::{self, ActionTable, Scheduler, Tally},
    seed::{self, Seeder},
    transport::{self, HttpTransport},
};
use rustc_hash::FxHashMap;
use tokio::{
    runtime::Builder,
    signal,
    task::JoinSet,
    time::{self, Duration, sleep},
};
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Could not build transport: {0}")]
    Transport(#[from] transport::Error),
    #[error("Could not start session: {0}")]
    Scheduler(#[from] scheduler::Error),
    #[error(transparent)]
    Seed(#[from] seed::Error),
    #[error("Could not install prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

fn default_config_path() -> String {
    "/etc/reviewload/reviewload.yaml".to_string()
}

#[derive(Default, Clone)]
struct CliKeyValues {
    inner: FxHashMap<String, String>,
}

impl CliKeyValues {
    #[cfg(test)]
    fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }
}

impl Display for CliKeyValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        for (k, v) in &self.inner {
            write!(f, "{k}={v},")?;
        }
        Ok(())
    }
}

impl FromStr for CliKeyValues {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        // Keys match `[[:alpha:]_]+` and are always followed by '='. Values may
        // themselves contain ',', so a value runs until the next key.
        static RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"([[:alpha:]_]+)=").expect("Invalid regex pattern provided"));

        let mut labels = FxHashMap::default();
        for cap in RE.captures_iter(input) {
            let Some(whole) = cap.get(0) else {
                continue;
            };
            let start = whole.end();
            let end = RE.find_at(input, start).map_or(input.len(), |m| m.start());
            let value = input[start..end].trim_end_matches(',').to_string();
            labels.insert(cap[1].to_string(), value);
        }

        Ok(Self { inner: labels })
    }
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TargetArgs {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// base URI of the service under test, overrides the configuration
    #[clap(long)]
    target_uri: Option<Uri>,
}

#[derive(Args)]
#[clap(group(
     ArgGroup::new("experiment-duration")
           .required(false)
           .args(&["experiment_duration_seconds", "experiment_duration_infinite"]),
))]
struct RunCommand {
    #[command(flatten)]
    target: TargetArgs,
    /// number of concurrent sessions, overrides the configuration
    #[clap(long)]
    sessions: Option<NonZeroU32>,
    /// additional labels to apply to all metrics, format KEY=VAL,KEY2=VAL
    #[clap(long)]
    global_labels: Option<CliKeyValues>,
    /// provision the teams before starting any session
    #[clap(long)]
    seed_first: bool,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
    /// the time, in seconds, to run the sessions
    #[clap(long, default_value_t = 120)]
    experiment_duration_seconds: u32,
    /// flag to allow infinite experiment duration
    #[clap(long)]
    experiment_duration_infinite: bool,
}

#[derive(Args)]
struct SeedCommand {
    #[command(flatten)]
    target: TargetArgs,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the service with concurrent sessions
    Run(Box<RunCommand>),
    /// Provision the teams of the author pool and exit
    Seed(SeedCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

fn load_config(config_path: &str) -> Result<Config, Error> {
    let config = if let Ok(contents) = env::var("REVIEWLOAD_CONFIG") {
        debug!("Using config from env var 'REVIEWLOAD_CONFIG'");
        Config::parse(&contents)
    } else {
        debug!("Attempting to open configuration file at: {config_path}");
        Config::load(Path::new(config_path))
    };
    config.map_err(|err| {
        error!("Could not load configuration: {err}");
        Error::Config(err)
    })
}

fn validate_config(config_path: &str) -> Result<Config, Error> {
    let config = load_config(config_path)?;
    config.validate().map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })?;
    info!("Configuration file is valid");
    Ok(config)
}

/// Apply command line overrides on top of `config` and validate the result.
fn get_config(
    mut config: Config,
    target: &TargetArgs,
    sessions: Option<NonZeroU32>,
    global_labels: Option<CliKeyValues>,
) -> Result<Config, Error> {
    if let Some(uri) = &target.target_uri {
        config.target_uri = uri.clone();
    }
    if let Some(sessions) = sessions {
        config.sessions = sessions.get();
    }
    if let Some(labels) = global_labels {
        match config.telemetry.as_mut() {
            Some(telemetry) => telemetry.global_labels_mut().extend(labels.inner),
            None => warn!("--global-labels ignored, no telemetry is configured"),
        }
    }
    config.validate()?;
    Ok(config)
}

fn install_telemetry(telemetry: Telemetry) -> Result<(), Error> {
    let (builder, global_labels) = match telemetry {
        Telemetry::Prometheus {
            addr,
            global_labels,
        } => (PrometheusBuilder::new().with_http_listener(addr), global_labels),
        Telemetry::PrometheusSocket {
            path,
            global_labels,
        } => (
            PrometheusBuilder::new().with_http_uds_listener(path),
            global_labels,
        ),
    };
    let builder = global_labels
        .into_iter()
        .fold(builder, |builder, (k, v)| builder.add_global_label(k, v));
    builder.install()?;
    Ok(())
}

async fn seed_main(config: Config) -> Result<(), Error> {
    let transport = Arc::new(HttpTransport::new(
        &config.target_uri,
        config.request_timeout(),
    )?);
    Seeder::new(
        transport,
        config.teams.team_count,
        config.teams.members_per_team,
    )
    .run()
    .await?;
    Ok(())
}

async fn inner_main(
    experiment_duration: Duration,
    seed_first: bool,
    config: Config,
) -> Result<Tally, Error> {
    let (shutdown_watcher, shutdown_broadcast) = reviewload_signal::signal();

    if let Some(telemetry) = config.telemetry.clone() {
        install_telemetry(telemetry)?;
    }

    let transport = Arc::new(HttpTransport::new(
        &config.target_uri,
        config.request_timeout(),
    )?);

    if seed_first {
        Seeder::new(
            Arc::clone(&transport),
            config.teams.team_count,
            config.teams.members_per_team,
        )
        .run()
        .await?;
    }

    let mut rng = match config.seed {
        Some(seed) => StdRng::from_seed(seed),
        None => StdRng::from_os_rng(),
    };
    let authors = config.author_pool();
    let executor = Arc::new(Executor::new(transport));
    let actions = Arc::new(ActionTable::new(config.weights)?);

    info!(
        "Starting {} sessions against {}",
        config.sessions, config.target_uri
    );
    let mut sessions = JoinSet::new();
    for id in 0..config.sessions {
        let scheduler = Scheduler::new(
            &authors,
            Arc::clone(&executor),
            Arc::clone(&actions),
            config.think_time,
            SmallRng::from_rng(&mut rng),
        )?;
        let span = info_span!("session", id, author = scheduler.author_id());
        sessions.spawn(scheduler.spin(shutdown_watcher.register()).instrument(span));
    }

    let (timer_watcher, timer_broadcast) = reviewload_signal::signal();
    tokio::spawn(
        async move {
            sleep(experiment_duration).await;
            info!("experiment duration exceeded, signaling for shutdown");
            timer_broadcast.signal();
        }
        .instrument(info_span!("experiment_sequence")),
    );

    // Every watcher derived from `shutdown_watcher` must be held by a session,
    // otherwise `signal_and_wait` below never returns.
    drop(shutdown_watcher);
    let timer_watcher_wait = timer_watcher.recv();
    tokio::pin!(timer_watcher_wait);
    let mut interval = time::interval(Duration::from_millis(400));
    let mut tally = Tally::default();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                gauge!("reviewload.running").set(1.0);
            },
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break;
            },
            () = &mut timer_watcher_wait => {
                info!("shutdown signal received.");
                break;
            },
            res = sessions.join_next() => match res {
                Some(Ok(report)) => tally += report.tally,
                Some(Err(err)) => error!("Could not join the spawned session task: {err}"),
                None => {
                    warn!("every session ended before shutdown");
                    break;
                }
            },
        }
    }
    shutdown_broadcast.signal_and_wait().await;

    while let Some(res) = sessions.join_next().await {
        match res {
            Ok(report) => tally += report.tally,
            Err(err) => error!("Could not join the spawned session task: {err}"),
        }
    }
    info!(
        creates = tally.creates,
        reassigns = tally.reassigns,
        skipped = tally.skipped,
        "all sessions stopped"
    );
    Ok(tally)
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting reviewload {version}.");

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;

    match Cli::parse().command {
        Commands::ConfigCheck(cmd) => match validate_config(&cmd.config_path) {
            Ok(_) => std::process::exit(0),
            Err(_) => std::process::exit(1),
        },
        Commands::Seed(cmd) => {
            let config = get_config(load_config(&cmd.target.config_path)?, &cmd.target, None, None)?;
            let res = runtime.block_on(seed_main(config));
            if let Err(err) = &res {
                error!("{err}");
            }
            res
        }
        Commands::Run(cmd) => {
            let config = get_config(
                load_config(&cmd.target.config_path)?,
                &cmd.target,
                cmd.sessions,
                cmd.global_labels,
            )?;
            let experiment_duration = if cmd.experiment_duration_infinite {
                Duration::MAX
            } else {
                Duration::from_secs(cmd.experiment_duration_seconds.into())
            };
            let max_shutdown_delay = Duration::from_secs(cmd.max_shutdown_delay.into());

            let res = runtime.block_on(inner_main(experiment_duration, cmd.seed_first, config));
            info!(
                "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
                max_shutdown_delay.as_secs(),
            );
            runtime.shutdown_timeout(max_shutdown_delay);
            info!("Bye. :)");
            res.map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use warp::Filter;

    use super::*;

    fn target_args(target_uri: Option<&str>) -> TargetArgs {
        TargetArgs {
            config_path: default_config_path(),
            target_uri: target_uri.map(|uri| uri.parse().unwrap()),
        }
    }

    #[test]
    fn command_line_overrides_configuration() {
        let config = Config::parse("telemetry:\n  addr: \"127.0.0.1:9000\"\n").unwrap();
        let labels = CliKeyValues::from_str("run=nightly").unwrap();
        let config = get_config(
            config,
            &target_args(Some("http://svc:1234")),
            NonZeroU32::new(3),
            Some(labels),
        )
        .unwrap();

        assert_eq!(config.target_uri, "http://svc:1234".parse::<Uri>().unwrap());
        assert_eq!(config.sessions, 3);
        let mut telemetry = config.telemetry.unwrap();
        assert_eq!(
            telemetry.global_labels_mut().get("run").map(String::as_str),
            Some("nightly")
        );
    }

    #[test]
    fn overrides_are_validated() {
        let config = Config::parse("teams:\n  members_per_team: 0\n").unwrap();
        assert!(matches!(
            get_config(config, &target_args(None), None, None),
            Err(Error::Config(config::Error::EmptyAuthorPool { .. }))
        ));
    }

    #[test]
    fn cli_parses_run_command() {
        let cli = Cli::parse_from([
            "reviewload",
            "run",
            "--target-uri",
            "http://localhost:9999",
            "--sessions",
            "4",
            "--seed-first",
            "--experiment-duration-infinite",
        ]);
        let Commands::Run(cmd) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(cmd.sessions, NonZeroU32::new(4));
        assert!(cmd.seed_first);
        assert!(cmd.experiment_duration_infinite);
        assert_eq!(cmd.target.config_path, "/etc/reviewload/reviewload.yaml");
    }

    #[test]
    fn cli_rejects_zero_sessions() {
        assert!(Cli::try_parse_from(["reviewload", "run", "--sessions", "0"]).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inner_main_drives_service_until_timer() {
        let teams = Arc::new(AtomicUsize::new(0));
        let creates = Arc::new(AtomicUsize::new(0));

        let team_hits = Arc::clone(&teams);
        let add_team = warp::post()
            .and(warp::path!("team" / "add"))
            .and(warp::body::json())
            .map(move |_: serde_json::Value| {
                team_hits.fetch_add(1, Ordering::Relaxed);
                warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({})),
                    warp::http::StatusCode::CREATED,
                )
            });
        let create_hits = Arc::clone(&creates);
        let create = warp::post()
            .and(warp::path!("pullRequest" / "create"))
            .and(warp::body::json())
            .map(move |body: serde_json::Value| {
                create_hits.fetch_add(1, Ordering::Relaxed);
                let reply = serde_json::json!({
                    "pr": {
                        "pull_request_id": body["pull_request_id"],
                        "assigned_reviewers": ["user-loadtest-01-02"],
                    }
                });
                warp::reply::with_status(
                    warp::reply::json(&reply),
                    warp::http::StatusCode::CREATED,
                )
            });
        let reassign = warp::post()
            .and(warp::path!("pullRequest" / "reassign"))
            .and(warp::body::json())
            .map(|body: serde_json::Value| {
                let reply = serde_json::json!({
                    "pr": {
                        "pull_request_id": body["pull_request_id"],
                        "assigned_reviewers": ["user-loadtest-01-03"],
                    },
                    "replaced_by": "user-loadtest-01-03",
                });
                warp::reply::json(&reply)
            });
        let (addr, serve) = warp::serve(add_team.or(create).or(reassign))
            .bind_ephemeral(([127, 0, 0, 1], 0));
        let _server = tokio::spawn(serve);

        let contents = format!(
            r#"
target_uri: "http://{addr}"
seed: [7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7]
teams:
  team_count: 2
  members_per_team: 3
think_time:
  minimum_millis: 10
  maximum_millis: 50
sessions: 4
"#
        );
        let config = Config::parse(&contents).unwrap();
        let tally = inner_main(Duration::from_millis(1_500), true, config)
            .await
            .unwrap();

        assert_eq!(teams.load(Ordering::Relaxed), 2);
        assert_eq!(tally.creates as usize, creates.load(Ordering::Relaxed));
        assert!(tally.creates >= 4);
        assert!(tally.reassigns > 0);
        assert_eq!(tally.skipped, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inner_main_aborts_when_seeding_fails() {
        let creates = Arc::new(AtomicUsize::new(0));

        let add_team = warp::post()
            .and(warp::path!("team" / "add"))
            .and(warp::body::json())
            .map(|body: serde_json::Value| {
                let status = if body["team_name"] == "loadtest-team-02" {
                    warp::http::StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    warp::http::StatusCode::CREATED
                };
                warp::reply::with_status(warp::reply::json(&serde_json::json!({})), status)
            });
        let create_hits = Arc::clone(&creates);
        let create = warp::post()
            .and(warp::path!("pullRequest" / "create"))
            .map(move || {
                create_hits.fetch_add(1, Ordering::Relaxed);
                warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({})),
                    warp::http::StatusCode::CREATED,
                )
            });
        let (addr, serve) =
            warp::serve(add_team.or(create)).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server = tokio::spawn(serve);

        let contents = format!(
            r#"
target_uri: "http://{addr}"
teams:
  team_count: 3
  members_per_team: 2
think_time:
  minimum_millis: 10
  maximum_millis: 50
sessions: 2
"#
        );
        let config = Config::parse(&contents).unwrap();
        let res = inner_main(Duration::from_secs(60), true, config).await;

        match res {
            Err(Error::Seed(seed::Error::Partial { failed, total })) => {
                assert_eq!(failed, vec!["loadtest-team-02"]);
                assert_eq!(total, 3);
            }
            other => panic!("expected a partial seeding failure, got {other:?}"),
        }
        assert_eq!(creates.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn cli_key_values_empty_string_is_empty_set() {
        let deser = CliKeyValues::from_str("").unwrap();
        assert_eq!("", deser.to_string());
    }

    #[test]
    fn cli_key_values_trailing_comma() {
        let deser = CliKeyValues::from_str("team=review,").unwrap();
        assert_eq!(deser.get("team"), Some("review"));
    }

    #[test]
    fn cli_key_values_value_may_contain_comma() {
        let deser =
            CliKeyValues::from_str("run_id=42,target=svc,tags=env:ci,region:eu").unwrap();
        assert_eq!(deser.get("run_id"), Some("42"));
        assert_eq!(deser.get("target"), Some("svc"));
        assert_eq!(deser.get("tags"), Some("env:ci,region:eu"));
    }
}
