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

/// This structure contains all the fields to configure the service at
/// startup.
///
/// It is loaded from the file given to the `-c, --config` argument. All
/// fields are optional and defaulted if missing; see [`Config::from_toml`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// see [`field::FieldWorkspace`]
    #[serde(default)]
    pub workspace: field::FieldWorkspace,
    /// see [`field::FieldLogs`]
    #[serde(default)]
    pub logs: field::FieldLogs,
    /// see [`field::FieldHttp`]
    #[serde(default)]
    pub http: field::FieldHttp,
}

/// The inner fields of the configuration.
#[allow(clippy::module_name_repetitions)]
pub mod field {
    /// Workspace: where the databases live, and for how long.
    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct FieldWorkspace {
        /// directory holding all the service databases.
        #[serde(default = "FieldWorkspace::default_directory")]
        pub directory: std::path::PathBuf,
        /// how many days of delivery history to retain.
        #[serde(default = "FieldWorkspace::default_retention_days")]
        pub retention_days: u64,
        /// size of each database's read-only connection pool.
        #[serde(default = "FieldWorkspace::default_pool_size")]
        pub pool_size: usize,
    }

    impl FieldWorkspace {
        pub(crate) fn default_directory() -> std::path::PathBuf {
            "/var/lib/vsleuth".into()
        }

        pub(crate) const fn default_retention_days() -> u64 {
            90
        }

        pub(crate) const fn default_pool_size() -> usize {
            10
        }
    }

    impl Default for FieldWorkspace {
        fn default() -> Self {
            Self {
                directory: Self::default_directory(),
                retention_days: Self::default_retention_days(),
                pool_size: Self::default_pool_size(),
            }
        }
    }

    /// Log ingestion: which directory to replay and follow.
    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct FieldLogs {
        /// directory containing the mail log files.
        #[serde(default = "FieldLogs::default_directory")]
        pub directory: std::path::PathBuf,
        /// base names of the log families to follow.
        #[serde(default = "FieldLogs::default_patterns")]
        pub patterns: Vec<String>,
        /// keep watching the current files after the initial import.
        #[serde(default = "FieldLogs::default_watch")]
        pub watch: bool,
        /// the directory is an rsync destination: files may be replaced
        /// under us rather than appended to.
        #[serde(default)]
        pub rsynced: bool,
        /// tracing directive, e.g. `info` or `vsleuth=debug`.
        #[serde(default = "FieldLogs::default_level")]
        pub level: String,
    }

    impl FieldLogs {
        pub(crate) fn default_directory() -> std::path::PathBuf {
            "/var/log".into()
        }

        pub(crate) fn default_patterns() -> Vec<String> {
            ["mail.log", "mail.err", "mail.warn", "zimbra.log", "maillog"]
                .into_iter()
                .map(str::to_string)
                .collect()
        }

        pub(crate) const fn default_watch() -> bool {
            true
        }

        pub(crate) fn default_level() -> String {
            "info".to_string()
        }
    }

    impl Default for FieldLogs {
        fn default() -> Self {
            Self {
                directory: Self::default_directory(),
                patterns: Self::default_patterns(),
                watch: Self::default_watch(),
                rsynced: false,
                level: Self::default_level(),
            }
        }
    }

    /// The HTTP interface serving the forensic API.
    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct FieldHttp {
        /// listening address.
        #[serde(default = "FieldHttp::default_listen")]
        pub listen: std::net::SocketAddr,
        /// bearer token granting operator access to the API. With none,
        /// only end-user searches are possible (when enabled).
        #[serde(default)]
        pub api_token: Option<String>,
    }

    impl FieldHttp {
        pub(crate) fn default_listen() -> std::net::SocketAddr {
            "127.0.0.1:8063".parse().expect("valid hardcoded address")
        }
    }

    impl Default for FieldHttp {
        fn default() -> Self {
            Self {
                listen: Self::default_listen(),
                api_token: None,
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: field::FieldWorkspace::default(),
            logs: field::FieldLogs::default(),
            http: field::FieldHttp::default(),
        }
    }
}

impl Config {
    /// Parse a TOML configuration.
    ///
    /// # Errors
    ///
    /// * syntax error, or an unknown field
    pub fn from_toml(input: &str) -> anyhow::Result<Self> {
        toml::from_str(input).context("cannot parse the configuration")
    }

    /// The retention window as a duration.
    #[must_use]
    pub const fn retention(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.workspace.retention_days * 24 * 60 * 60)
    }
}
