/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use skeleton_crew::{
    config::Config,
    daemon::{probe_jack, run_daemon},
    model::NodeRole,
    telemetry,
};
use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tracing::{error, info};

const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_FATAL_RUNTIME: u8 = 3;
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    if let Err(e) = telemetry::init(&config).await {
        eprintln!("Telemetry setup error: {e}");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    info!(
        "Starting {} instance '{}'",
        config.app.name, config.app.instance.name
    );

    // An audio hub without JACK has nothing to do.
    if config.node.roles.contains(&NodeRole::AudioHub)
        && let Err(e) = probe_jack(&config)
    {
        error!("JACK is unreachable and this node declares the audio_hub role: {e}");
        return ExitCode::from(EXIT_FATAL_RUNTIME);
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::Release);
            }
        });
    }

    let result = Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("skeleton-crew", move |s| {
            run_daemon(s, config)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(2))
    .await;

    match result {
        Ok(()) => {
            if interrupted.load(Ordering::Acquire) {
                ExitCode::from(EXIT_INTERRUPTED)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("Fatal runtime error: {e}");
            ExitCode::from(EXIT_FATAL_RUNTIME)
        }
    }
}
