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

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use structopt::StructOpt;

use crate::support::logging::{self, Severity};
use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Serve a single protocol session over standard IO.
    ///
    /// This is intended to be used with inetd, xinetd, etc, behind
    /// whatever terminates TLS.
    Serve(ServeSubcommand),
    /// Commands used in the development or testing of Rowmap.
    Dev(DevSubcommand),
}

#[derive(StructOpt)]
enum ServeSubcommand {
    /// Serve one IMAP session on stdin/stdout.
    Imap(CommonOptions),
    /// Serve one LMTP session on stdin/stdout.
    Lmtp(CommonOptions),
}

#[derive(StructOpt)]
enum DevSubcommand {
    /// Run Rowmap in a scratch environment for testing.
    ///
    /// Listens for IMAP connections on 127.0.0.1:14143 without TLS,
    /// against an in-memory scratch database with a single INBOX. Any
    /// user whose password equals the user name can log in. There is no
    /// way to configure this.
    ImapTest,
}

#[derive(StructOpt, Default)]
struct CommonOptions {
    /// The directory containing `rowmap.toml`
    /// [default: /etc/rowmap or /usr/local/etc/rowmap]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

pub fn main() {
    let command = Command::from_args();

    match command {
        Command::Serve(subcommand) => {
            let options = match subcommand {
                ServeSubcommand::Imap(ref options)
                | ServeSubcommand::Lmtp(ref options) => options,
            };
            let config = load_config(options.root.as_deref());
            init_logging(&config);

            match subcommand {
                ServeSubcommand::Imap(_) => {
                    super::serve::imap(Arc::new(config))
                },
                ServeSubcommand::Lmtp(_) => {
                    super::serve::lmtp(Arc::new(config))
                },
            }
        },
        Command::Dev(DevSubcommand::ImapTest) => {
            let config = SystemConfig::default();
            init_logging(&config);
            super::serve::imap_test();
        },
    }
}

fn load_config(root: Option<&Path>) -> SystemConfig {
    let path = match root {
        Some(root) => root.join("rowmap.toml"),
        None => {
            let usr = Path::new("/usr/local/etc/rowmap/rowmap.toml");
            let etc = Path::new("/etc/rowmap/rowmap.toml");
            if usr.is_file() {
                usr.to_owned()
            } else {
                etc.to_owned()
            }
        },
    };

    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("rowmap: unable to read {}: {}", path.display(), e);
            EX_CONFIG.exit()
        },
    };

    match toml::from_str(&text) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rowmap: invalid {}: {}", path.display(), e);
            EX_CONFIG.exit()
        },
    }
}

fn init_logging(config: &SystemConfig) {
    let floor = config
        .server
        .log_level
        .parse::<Severity>()
        .unwrap_or_else(|_| {
            eprintln!(
                "rowmap: unknown log-level {:?}",
                config.server.log_level,
            );
            EX_CONFIG.exit()
        });

    // Installation fails if a logger already exists, which is fine.
    let _ = logging::init_stderr(floor);
}
