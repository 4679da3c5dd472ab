use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Args, Parser, Subcommand};
use tokio::runtime::Handle;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stampede::collector::Collector;
use stampede::config::ConfigManager;
use stampede::context::Capabilities;
use stampede::controller::Controller;
use stampede::messages::{NullSink, SharedSink, SinkSet};
use stampede::registry::{Registry, ScenarioDef};
use stampede::runner::{Runner, RunnerOptions};
use stampede::scenario::ScenarioManager;
use stampede::session::SessionPool;
use stampede::stats::{serve_metrics, StatsCollector};
use stampede::volume::ConstantVolume;
use stampede::wire::{
    ControllerServer, DirectRunnerTransport, TcpRunnerTransport, TelemetryReceiver,
    TelemetrySender,
};

type AnyError = Box<dyn std::error::Error + Send + Sync>;

/// How long a runner may go silent before the controller reaps it.
const RUNNER_TIMEOUT: Duration = Duration::from_secs(10);

/// Scheduling period: volume models are consulted once per period.
const SCHEDULING_PERIOD: f64 = 1.0;

/// Smallest expected gap between request_work polls, used for the spawn-rate
/// clamp before any hit-rate history exists.
const MIN_POLL_PERIOD: f64 = 0.01;

#[derive(Parser)]
#[command(name = "stampede", about = "Distributed HTTP load-generation framework")]
struct Cli {
    /// Log filter (e.g. info, debug, stampede=debug)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Operate on registered scenario sets
    Scenario {
        #[command(subcommand)]
        command: ScenarioCommand,
    },
    /// Operate on a single registered journey
    Journey {
        #[command(subcommand)]
        command: JourneyCommand,
    },
    /// Run the controller: bind the controller socket, schedule work
    Controller {
        /// Name of a registered scenario set
        scenario_spec: String,
        #[command(flatten)]
        sockets: SocketOpts,
        #[command(flatten)]
        scheduling: SchedulingOpts,
        #[command(flatten)]
        web: WebOpts,
        /// YAML file loaded into the controller's versioned config store
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a runner: connect to the controller, execute granted journeys
    Runner {
        #[command(flatten)]
        sockets: SocketOpts,
        #[command(flatten)]
        runner: RunnerLoopOpts,
    },
    /// Run the collector: bind the message socket, roll frames to disk
    Collector {
        #[command(flatten)]
        sockets: SocketOpts,
        #[command(flatten)]
        web: WebOpts,
        /// Directory receiving rolled frame files
        #[arg(long, default_value = "collector_data")]
        collector_dir: PathBuf,
        /// Messages per file before rolling
        #[arg(long, default_value_t = 10_000)]
        roll_after: usize,
    },
}

#[derive(Subcommand)]
enum ScenarioCommand {
    /// One-process test: in-process controller plus a single runner
    Test {
        /// Name of a registered scenario set
        scenario_spec: String,
        #[command(flatten)]
        scheduling: SchedulingOpts,
        #[command(flatten)]
        runner: RunnerLoopOpts,
        #[command(flatten)]
        web: WebOpts,
        /// YAML file loaded into the controller's versioned config store
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum JourneyCommand {
    /// One-process test of a single journey with an optional data pool
    Test {
        /// Name of a registered journey
        journey_spec: String,
        /// Name of a registered data pool
        datapool_spec: Option<String>,
        /// Constant required concurrent population
        #[arg(long, default_value_t = 1)]
        volume: u64,
        #[command(flatten)]
        scheduling: SchedulingOpts,
        #[command(flatten)]
        runner: RunnerLoopOpts,
        #[command(flatten)]
        web: WebOpts,
        /// YAML file loaded into the controller's versioned config store
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Clone)]
struct SocketOpts {
    /// Controller request/reply socket address
    #[arg(long, default_value = "127.0.0.1:14301")]
    controller_socket: String,

    /// Telemetry fan-in socket address
    #[arg(long, default_value = "127.0.0.1:14302")]
    message_socket: String,
}

#[derive(Args, Clone)]
struct WebOpts {
    /// Prometheus exposition address
    #[arg(long, default_value = "127.0.0.1:9301")]
    web_address: SocketAddr,

    /// Disable the metrics endpoint
    #[arg(long)]
    no_web: bool,
}

#[derive(Args, Clone)]
struct SchedulingOpts {
    /// System-wide ceiling on new journey starts per second
    #[arg(long)]
    spawn_rate: Option<f64>,

    /// Suppress scheduling for this many seconds after startup
    #[arg(long, default_value_t = 0.0)]
    delay_start_seconds: f64,
}

#[derive(Args, Clone)]
struct RunnerLoopOpts {
    /// Upper bound on the runner loop wait, seconds
    #[arg(long, default_value_t = 0.5)]
    max_loop_delay: f64,

    /// Lower bound on the runner loop wait, seconds
    #[arg(long, default_value_t = 0.01)]
    min_loop_delay: f64,

    /// Cap on concurrently in-flight journeys per runner
    #[arg(long)]
    runner_max_journeys: Option<u64>,
}

impl RunnerLoopOpts {
    fn to_options(&self) -> RunnerOptions {
        RunnerOptions {
            loop_wait_min: Duration::from_secs_f64(self.min_loop_delay),
            loop_wait_max: Duration::from_secs_f64(self.max_loop_delay),
            max_work: self.runner_max_journeys,
            debug: false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry = stampede::default_registry_builder().build();

    match cli.command {
        Command::Scenario {
            command:
                ScenarioCommand::Test {
                    scenario_spec,
                    scheduling,
                    runner,
                    web,
                    config,
                },
        } => {
            let defs = registry.scenario_set(&scenario_spec)?.to_vec();
            let controller = build_controller(&registry, &defs, &scheduling, config.as_deref())?;
            run_in_process(registry, controller, &runner, &web).await
        }

        Command::Journey {
            command:
                JourneyCommand::Test {
                    journey_spec,
                    datapool_spec,
                    volume,
                    scheduling,
                    runner,
                    web,
                    config,
                },
        } => {
            // An ad-hoc scenario set with one constant-volume scenario.
            registry.journey(&journey_spec)?;
            let mut manager = ScenarioManager::new(
                scheduling.delay_start_seconds,
                SCHEDULING_PERIOD,
                MIN_POLL_PERIOD,
                scheduling.spawn_rate,
            );
            let datapool = datapool_spec
                .as_deref()
                .map(|name| registry.datapool(name))
                .transpose()?;
            manager.add_scenario(
                journey_spec.clone(),
                datapool,
                Box::new(ConstantVolume::new(volume)),
            );
            let mut config_manager = ConfigManager::new();
            if let Some(path) = config.as_deref() {
                config_manager.load_yaml_file(path)?;
            }
            let controller =
                Controller::new(journey_spec, manager, config_manager, RUNNER_TIMEOUT);
            run_in_process(registry, controller, &runner, &web).await
        }

        Command::Controller {
            scenario_spec,
            sockets,
            scheduling,
            web,
            config,
        } => {
            let defs = registry.scenario_set(&scenario_spec)?.to_vec();
            let controller = build_controller(&registry, &defs, &scheduling, config.as_deref())?;
            run_controller(controller, &sockets, &web).await
        }

        Command::Runner { sockets, runner } => run_runner(registry, &sockets, &runner).await,

        Command::Collector {
            sockets,
            web,
            collector_dir,
            roll_after,
        } => run_collector(&sockets, &web, collector_dir, roll_after).await,
    }
}

/// Build a controller from a scenario set, validating every referenced name.
fn build_controller(
    registry: &Registry,
    defs: &[ScenarioDef],
    scheduling: &SchedulingOpts,
    config_path: Option<&std::path::Path>,
) -> Result<Controller, AnyError> {
    let mut manager = ScenarioManager::new(
        scheduling.delay_start_seconds,
        SCHEDULING_PERIOD,
        MIN_POLL_PERIOD,
        scheduling.spawn_rate,
    );
    for def in defs {
        registry.journey(&def.journey)?;
        let datapool = def
            .datapool
            .as_deref()
            .map(|name| registry.datapool(name))
            .transpose()?;
        let volume = registry.volume(&def.volume)?;
        manager.add_scenario(def.journey.clone(), datapool, volume);
    }

    let mut config_manager = ConfigManager::new();
    if let Some(path) = config_path {
        config_manager.load_yaml_file(path)?;
        info!(path = ?path, "loaded config file");
    }

    Ok(Controller::new(
        "stampede",
        manager,
        config_manager,
        RUNNER_TIMEOUT,
    ))
}

/// Single-process mode: controller and one runner in this process, stats fed
/// directly, no sockets.
async fn run_in_process(
    registry: Arc<Registry>,
    controller: Controller,
    runner_opts: &RunnerLoopOpts,
    web: &WebOpts,
) -> Result<(), AnyError> {
    let controller = Arc::new(Mutex::new(controller));
    let stats = StatsCollector::new();
    let sink: SharedSink = stats.clone();

    if !web.no_web {
        tokio::spawn(serve_metrics(web.web_address, stats.clone()));
    }

    let reporter = tokio::spawn(report_loop(controller.clone(), sink.clone()));

    let runner = Runner::new(
        Box::new(DirectRunnerTransport::new(controller.clone())),
        sink.clone(),
        registry,
        Capabilities {
            http: Some(SessionPool::default()),
        },
        Handle::current(),
        runner_opts.to_options(),
    );
    let result = runner.run().await;
    reporter.abort();
    controller.lock().unwrap().report(&*sink);
    result?;
    info!("test finished");
    Ok(())
}

/// Periodic controller_report emission; exits once the controller is done.
async fn report_loop(controller: Arc<Mutex<Controller>>, sink: SharedSink) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let mut ctl = controller.lock().unwrap();
        ctl.report(&*sink);
        if ctl.should_stop() {
            return;
        }
    }
}

async fn run_controller(
    controller: Controller,
    sockets: &SocketOpts,
    web: &WebOpts,
) -> Result<(), AnyError> {
    let controller = Arc::new(Mutex::new(controller));
    let server = ControllerServer::bind(&sockets.controller_socket, controller.clone()).await?;

    let stats = StatsCollector::new();
    let mut sinks: Vec<SharedSink> = vec![stats.clone()];
    match TelemetrySender::connect(&sockets.message_socket).await {
        Ok(sender) => sinks.push(sender),
        Err(e) => warn!(
            error = %e,
            "no collector on the message socket; reports stay local"
        ),
    }
    let sink: SharedSink = Arc::new(SinkSet::new(sinks));

    if !web.no_web {
        tokio::spawn(serve_metrics(web.web_address, stats.clone()));
    }

    let server_task = tokio::spawn(server.run());
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let mut ctl = controller.lock().unwrap();
        ctl.report(&*sink);
        if ctl.should_stop() {
            break;
        }
    }
    server_task.abort();
    info!("controller finished");
    Ok(())
}

async fn run_runner(
    registry: Arc<Registry>,
    sockets: &SocketOpts,
    runner_opts: &RunnerLoopOpts,
) -> Result<(), AnyError> {
    let transport = TcpRunnerTransport::connect(&sockets.controller_socket).await?;
    let sink: SharedSink = match TelemetrySender::connect(&sockets.message_socket).await {
        Ok(sender) => sender,
        Err(e) => {
            warn!(error = %e, "no collector on the message socket; telemetry disabled");
            Arc::new(NullSink)
        }
    };

    let runner = Runner::new(
        Box::new(transport),
        sink,
        registry,
        Capabilities {
            http: Some(SessionPool::default()),
        },
        Handle::current(),
        runner_opts.to_options(),
    );
    runner.run().await?;
    Ok(())
}

async fn run_collector(
    sockets: &SocketOpts,
    web: &WebOpts,
    collector_dir: PathBuf,
    roll_after: usize,
) -> Result<(), AnyError> {
    let mut receiver = TelemetryReceiver::bind(&sockets.message_socket).await?;
    let collector = Arc::new(Collector::new(collector_dir, roll_after)?);
    receiver.add_frame_listener(collector.clone());
    receiver.add_message_listener(collector);

    let stats = StatsCollector::new();
    receiver.add_message_listener(stats.clone());
    if !web.no_web {
        tokio::spawn(serve_metrics(web.web_address, stats));
    }

    tokio::select! {
        _ = receiver.run() => {}
        _ = tokio::signal::ctrl_c() => info!("collector interrupted, shutting down"),
    }
    Ok(())
}
