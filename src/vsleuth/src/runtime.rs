/*
 * vSleuth mail log forensics
 * Copyright (C) 2022 viridIT SAS
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/
use crate::workspace::Workspace;
use anyhow::Context;
use vsleuth_api::{BearerTokenAuthenticator, DetectiveApiState};
use vsleuth_common::runner;
use vsleuth_config::Config;

/// Build the runtime and run the service until a shutdown signal.
///
/// # Errors
///
/// * the runtime cannot be built
/// * startup fails, or a component fails while running
pub fn start_runtime(config: Config, follow: bool) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("vsleuth-worker")
        .build()
        .context("cannot build the async runtime")?;

    runtime.block_on(run(config, follow))
}

async fn shutdown_signal() {
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing the SIGTERM handler");

        tokio::select! {
            _ = interrupt => tracing::warn!(signal = "SIGINT", "stopping vSleuth"),
            _ = terminate.recv() => tracing::warn!(signal = "SIGTERM", "stopping vSleuth"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
        tracing::warn!(signal = "interrupt", "stopping vSleuth");
    }
}

async fn run(config: Config, follow: bool) -> anyhow::Result<()> {
    let mut workspace = Workspace::new(&config, follow).await?;

    if !follow {
        // import-only mode: drain the backlog into the stores and leave
        tracing::info!("import-only mode, exiting once the backlog is drained");

        let import_result = workspace.join_importer().await;
        return import_result.and(workspace.shutdown().await);
    }

    let api_state = std::sync::Arc::new(DetectiveApiState {
        detective: workspace.detective.clone(),
        authenticator: std::sync::Arc::new(BearerTokenAuthenticator::new(
            config.http.api_token.clone(),
        )),
        settings: workspace.settings_reader.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.http.listen)
        .await
        .context(format!("cannot listen on {}", config.http.listen))?;

    tracing::info!(address = %config.http.listen, "vSleuth is serving its API");

    let http_runner = runner::spawn("http", move |cancellation| async move {
        axum::serve(listener, vsleuth_api::router(api_state))
            .with_graceful_shutdown(async move { cancellation.cancelled().await })
            .await
            .context("the HTTP server failed")
    });

    shutdown_signal().await;

    http_runner.cancel();
    let http_result = http_runner.join().await;

    let workspace_result = workspace.shutdown().await;

    http_result.and(workspace_result)
}
