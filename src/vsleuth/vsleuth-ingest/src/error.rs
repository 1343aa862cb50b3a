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

/// Failure modes of ingest startup.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// the directory contains nothing any recogniser accepts. Fatal to
    /// ingest startup.
    #[error("could not find any matching log files")]
    LogFilesNotFound,

    /// no file had usable content when guessing the initial import time.
    #[error("no valid log files found")]
    EmptyFileList,
}
