use std::{path::PathBuf, process, sync::Arc};

use structopt::StructOpt;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

use fedsync_server::{
    aggregator::{Aggregator, HttpAggregator, SimulatedAggregator},
    orchestrator::Orchestrator,
    rest,
    runtime::SimulatedRuntime,
    settings::{AggregatorSettings, Settings},
    storage::{FsAdapterStore, JsonHistoryStore},
};

#[derive(Debug, StructOpt)]
#[structopt(name = "fedsync")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

fn aggregator(settings: &AggregatorSettings) -> Arc<dyn Aggregator> {
    match &settings.url {
        Some(url) => match HttpAggregator::new(url, settings.timeout()) {
            Ok(aggregator) => {
                info!("using the aggregator at {}", aggregator.address());
                Arc::new(aggregator)
            }
            Err(err) => {
                error!("failed to initialize the aggregator client: {}", err);
                process::exit(1);
            }
        },
        None => {
            warn!("no aggregator url configured, using a simulated aggregator");
            Arc::new(SimulatedAggregator::new(
                settings.simulated_delay(),
                settings.simulated_jitter,
            ))
        }
    }
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        log: log_settings,
        storage: storage_settings,
        privacy: privacy_settings,
        aggregator: aggregator_settings,
        runtime: runtime_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let default_budget = privacy_settings.budget().unwrap_or_else(|err| {
        error!("invalid privacy settings: {}", err);
        process::exit(1);
    });

    let orchestrator = Orchestrator::new(
        Arc::new(FsAdapterStore::new(storage_settings.adapters_dir)),
        Arc::new(JsonHistoryStore::new(storage_settings.history_path)),
        Arc::new(SimulatedRuntime::new(
            storage_settings.models_dir,
            runtime_settings.epoch_delay(),
            runtime_settings.download_step_delay(),
        )),
        aggregator(&aggregator_settings),
        default_budget,
    );

    tokio::select! {
        result = rest::serve(api_settings, orchestrator) => {
            match result {
                Ok(()) => warn!("shutting down: REST server terminated"),
                Err(err) => error!("shutting down: {}", err),
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
