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
use anyhow::Context;
use clap::Parser;
use vsleuth::{Args, Commands};
use vsleuth_config::Config;

fn main() {
    if let Err(err) = try_main() {
        let error = format!("vSleuth terminating error: '{err}'");

        eprintln!("{error}");
        tracing::error!(error);
        err.chain().skip(1).for_each(|cause| {
            let reason = format!("because: {cause}");

            eprintln!("{reason}");
            tracing::error!(reason);
        });
        std::process::exit(1);
    }
}

fn try_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = args.config.as_ref().map_or_else(
        || Ok(Config::default()),
        |config| {
            std::fs::read_to_string(config)
                .context(format!("cannot read file '{}'", config.display()))
                .and_then(|f| Config::from_toml(&f).context("file contains a format error"))
                .context("cannot parse the configuration")
        },
    )?;

    if let Some(command) = args.command {
        match command {
            Commands::ConfigShow => {
                let stringified = serde_json::to_string_pretty(&config)?;
                println!("loaded configuration: {stringified}");
                return Ok(());
            }
        }
    }

    vsleuth::tracing_subscriber::initialize(&config.logs.level)?;

    tracing::info!(
        workspace = %config.workspace.directory.display(),
        logs = %config.logs.directory.display(),
        "vSleuth starting"
    );

    let follow = config.logs.watch && !args.import_only;

    vsleuth::runtime::start_runtime(config, follow)
}
