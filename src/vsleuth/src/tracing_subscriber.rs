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

/// Install the global subscriber from the configured directive, e.g.
/// `info` or `vsleuth_ingest=debug,info`.
///
/// # Errors
///
/// * the directive does not parse
/// * a subscriber is already installed
pub fn initialize(directive: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(directive)
        .context(format!("invalid tracing directive '{directive}'"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("cannot install the tracing subscriber: {e}"))?;

    Ok(())
}
