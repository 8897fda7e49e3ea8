//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Rowmap.
//
// Rowmap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Rowmap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Rowmap. If not, see <http://www.gnu.org/licenses/>.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Rowmap.
///
/// This is stored in a file named `rowmap.toml` under the Rowmap system root,
/// which is typically `/usr/local/etc/rowmap` or `/etc/rowmap`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SystemConfig {
    /// How to reach the database server.
    #[serde(default)]
    pub db: DbConfig,

    /// Options for the server's own identity and logging.
    #[serde(default)]
    pub server: ServerConfig,

    /// Options for the LMTP listener.
    #[serde(default)]
    pub lmtp: LmtpConfig,

    /// Options for TLS, which is terminated outside this process.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Options for the cluster coordination daemon.
    #[serde(default)]
    pub ocd: OcdConfig,

    /// Options for LDAP authentication relay.
    #[serde(default)]
    pub ldap: LdapConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DbConfig {
    /// Database server host, UNIX socket path, or the special value
    /// `scratch` for the in-process scratch database.
    #[serde(default = "defaults::db_address")]
    pub db_address: String,
    #[serde(default = "defaults::db_port")]
    pub db_port: u16,
    #[serde(default = "defaults::db_name")]
    pub db_name: String,
    #[serde(default = "defaults::db_user")]
    pub db_user: String,
    #[serde(default)]
    pub db_password: String,
    /// The database role owning the schema, used by the installer rather
    /// than the server itself.
    #[serde(default)]
    pub db_owner: String,
    #[serde(default)]
    pub db_owner_password: String,
    /// The maximum number of simultaneously open database handles.
    #[serde(default = "defaults::db_max_handles")]
    pub db_max_handles: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty DbConfig is valid")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// The host name to announce in greetings. Defaults to the value
    /// reported by the operating system.
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "defaults::logfile")]
    pub logfile: PathBuf,
    /// Octal mode for the log file, as a string to keep the octal notation.
    #[serde(default = "defaults::logfile_mode")]
    pub logfile_mode: String,
    /// One of debug, info, error, disaster.
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Whether `user+detail@host` addresses deliver to the mailbox named by
    /// `detail`.
    #[serde(default)]
    pub use_subaddressing: bool,
    /// Whether to retain plaintext copies of injected messages:
    /// errors, all, or none.
    #[serde(default = "defaults::message_copy")]
    pub message_copy: String,
    #[serde(default)]
    pub message_copy_directory: PathBuf,
    #[serde(default)]
    pub allow_plaintext_passwords: bool,
    #[serde(default)]
    pub allow_plaintext_access: bool,
    /// Whether the (separate) POP3 frontend should be started.
    #[serde(default)]
    pub use_pop: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty ServerConfig is valid")
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LmtpConfig {
    #[serde(default = "defaults::lmtp_address")]
    pub lmtp_address: String,
    #[serde(default = "defaults::lmtp_port")]
    pub lmtp_port: u16,
}

impl Default for LmtpConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty LmtpConfig is valid")
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TlsConfig {
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub tls_certificate: PathBuf,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OcdConfig {
    /// Host of the cluster coordination daemon. Empty means standalone.
    #[serde(default)]
    pub ocd_address: String,
    #[serde(default = "defaults::ocd_port")]
    pub ocd_port: u16,
}

impl Default for OcdConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty OcdConfig is valid")
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LdapConfig {
    #[serde(default)]
    pub ldap_server_address: String,
    #[serde(default)]
    pub ldap_server_port: u16,
}

mod defaults {
    use std::path::PathBuf;

    pub fn db_address() -> String {
        "/tmp/.s.PGSQL.5432".to_owned()
    }

    pub fn db_port() -> u16 {
        5432
    }

    pub fn db_name() -> String {
        "rowmap".to_owned()
    }

    pub fn db_user() -> String {
        "rowmap".to_owned()
    }

    pub fn db_max_handles() -> usize {
        4
    }

    pub fn logfile() -> PathBuf {
        PathBuf::from("/var/log/rowmap.log")
    }

    pub fn logfile_mode() -> String {
        "0600".to_owned()
    }

    pub fn log_level() -> String {
        "info".to_owned()
    }

    pub fn message_copy() -> String {
        "none".to_owned()
    }

    pub fn lmtp_address() -> String {
        "127.0.0.1".to_owned()
    }

    pub fn lmtp_port() -> u16 {
        2026
    }

    pub fn ocd_port() -> u16 {
        2050
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_parse() {
        let config: SystemConfig = toml::from_str("").unwrap();
        assert_eq!(5432, config.db.db_port);
        assert_eq!(4, config.db.db_max_handles);
        assert_eq!("info", config.server.log_level);
        assert_eq!(2050, config.ocd.ocd_port);
        assert!(!config.server.use_subaddressing);
    }

    #[test]
    fn kebab_case_options_recognised() {
        let config: SystemConfig = toml::from_str(
            r#"
            [db]
            db-address = "db.example.org"
            db-max-handles = 12

            [server]
            log-level = "debug"
            use-subaddressing = true
            message-copy = "errors"

            [ocd]
            ocd-address = "coordinator.example.org"
            "#,
        )
        .unwrap();

        assert_eq!("db.example.org", config.db.db_address);
        assert_eq!(12, config.db.db_max_handles);
        assert_eq!("debug", config.server.log_level);
        assert!(config.server.use_subaddressing);
        assert_eq!("errors", config.server.message_copy);
        assert_eq!("coordinator.example.org", config.ocd.ocd_address);
    }
}
