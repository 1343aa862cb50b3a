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

/// vSleuth: reconstructs per-message delivery histories from Postfix
/// logs and answers forensic queries about them.
#[derive(Debug, clap::Parser)]
#[command(name = "vsleuth", version, about)]
pub struct Args {
    /// path of the TOML configuration file.
    #[arg(short, long)]
    pub config: Option<std::path::PathBuf>,

    /// replay the log directory and exit, without following the current
    /// files. Overrides the configuration.
    #[arg(long)]
    pub import_only: bool,

    /// maintenance subcommand to run instead of the normal daemon loop.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Maintenance subcommands.
#[derive(Debug, clap::Subcommand)]
pub enum Commands {
    /// print the loaded configuration and exit.
    ConfigShow,
}
