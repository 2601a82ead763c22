////////////////////////////////////////////////////////////////////////////////
//                                                                            //
//  Copyright (c) 2025 Leonardo Consoni                                       //
//                                                                            //
//  This file is part of Stimwalker.                                          //
//                                                                            //
//  Stimwalker is free software: you can redistribute it and/or modify        //
//  it under the terms of the GNU Lesser General Public License as published  //
//  by the Free Software Foundation, either version 3 of the License, or      //
//  (at your option) any later version.                                       //
//                                                                            //
//  Stimwalker is distributed in the hope that it will be useful,             //
//  but WITHOUT ANY WARRANTY; without even the implied warranty of            //
//  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the              //
//  GNU Lesser General Public License for more details.                       //
//                                                                            //
//  You should have received a copy of the GNU Lesser General Public License  //
//  along with Stimwalker. If not, see <http://www.gnu.org/licenses/>.        //
//                                                                            //
////////////////////////////////////////////////////////////////////////////////

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stimwalker::actuator::FakeStimulatorBackend;
use stimwalker::config::SystemConfig;
use stimwalker::console::run_console;
use stimwalker::rule::{load_descriptions, template_catalogue, RuleTemplate};
use stimwalker::sensor::SineWaveBackend;
use stimwalker::{IpcServer, Runner, RunnerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root directory containing the config folder
    #[arg(long, default_value = "./")]
    root: PathBuf,

    /// IP address for server sockets to bind to, overriding the configuration
    #[arg(long)]
    addr: Option<String>,

    /// Run the local text console instead of the TCP server
    #[arg(long)]
    console: bool,

    /// Log filter, replacing RUST_LOG when given
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Stimwalker");
    info!("Root directory: {:?}", args.root);

    let mut system_config = SystemConfig::load(&args.root).context("Failed to load system configuration")?;
    if let Some(addr) = args.addr {
        system_config.server.address = addr;
    }

    let templates = load_templates(&system_config)?;
    info!("{} stimulation rule templates available", templates.len());

    let acquisition = SineWaveBackend::new(&system_config.acquisition);
    let (stimulation, _) = FakeStimulatorBackend::new(system_config.stimulator.channels);
    warn!("Using simulated acquisition and stimulation devices");

    let runner_config = RunnerConfig {
        stimulator: system_config.stimulator.clone(),
        trials_dir: system_config.trials_dir.clone(),
    };
    let runner = Arc::new(
        Runner::new(Box::new(acquisition), Box::new(stimulation), templates, runner_config)
            .context("Failed to create runner")?,
    );

    if args.console {
        run_local_console(Arc::clone(&runner)).await?;
    } else {
        serve(Arc::clone(&runner), &system_config).await?;
    }

    info!("Shutting down...");
    let finished = tokio::task::spawn_blocking(move || runner.dispose()).await;
    if let Err(e) = finished {
        error!("Runner shutdown failed: {}", e);
    }

    info!("Stimwalker shutdown complete");
    Ok(())
}

fn load_templates(config: &SystemConfig) -> Result<Vec<RuleTemplate>> {
    let descriptions = match &config.rules_file {
        Some(path) => {
            info!("Loading rule descriptions from {:?}", path);
            load_descriptions(path).with_context(|| format!("Failed to load rule descriptions from {:?}", path))?
        }
        None => Vec::new(),
    };
    Ok(template_catalogue(config.stimulator.amplitude, descriptions))
}

async fn serve(runner: Arc<Runner>, config: &SystemConfig) -> Result<()> {
    let server = IpcServer::bind(runner, &config.server)
        .await
        .context("Failed to start IPC server")?;
    let shutdown = server.shutdown_handle();
    let mut server_task = tokio::spawn(server.run());

    info!("Stimwalker started successfully");

    // Wait for a shutdown request or signal
    tokio::select! {
        finished = &mut server_task => {
            return finished.context("IPC server task failed")?;
        }
        received = signal::ctrl_c() => match received {
            Ok(()) => info!("Received shutdown signal"),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
    }

    info!("Stopping IPC server...");
    shutdown.notify_one();
    server_task.await.context("IPC server task failed")?
}

async fn run_local_console(runner: Arc<Runner>) -> Result<()> {
    let console = tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        run_console(&runner, stdin.lock(), std::io::stdout())
    });

    tokio::select! {
        finished = console => finished.context("Console task failed")?,
        received = signal::ctrl_c() => {
            if let Err(err) = received {
                error!("Unable to listen for shutdown signal: {}", err);
            }
            info!("Received shutdown signal");
            Ok(())
        }
    }
}
