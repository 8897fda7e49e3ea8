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

//! The serve entry points.
//!
//! Everything runs on a current-thread tokio runtime: one cooperative
//! event loop per process, no shared mutable memory between OS threads.

use std::rc::Rc;
use std::sync::Arc;

use log::{error, info};

use crate::cluster::Cluster;
use crate::imap::session::Session;
use crate::lmtp::server::LmtpServer;
use crate::runtime::Runtime;
use crate::store::registry::Registry;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

macro_rules! fatal {
    ($ex:ident, $($stuff:tt)*) => {{
        error!($($stuff)*);
        $ex.exit()
    }}
}

/// Builds the process runtime for the configured database backend.
///
/// The only backend this build carries is the in-process scratch engine
/// (`db-address = "scratch"`); a production deployment links a real driver
/// behind `db::driver::Connection` and plugs it in here.
async fn build_runtime(
    config: Arc<SystemConfig>,
    shutdown: Rc<tokio::sync::Notify>,
) -> Result<Rc<Runtime>, Error> {
    if "scratch" != config.db.db_address {
        fatal!(
            EX_UNAVAILABLE,
            "no database driver for db-address {:?} in this build",
            config.db.db_address,
        );
    }

    let db = crate::db::scratch::ScratchDb::new();
    db.create_mailbox("INBOX", 1);

    let pool = crate::db::driver::Pool::new(
        config.db.db_max_handles,
        move || Box::new(db.connect()),
    );
    let registry = Rc::new(Registry::new());
    registry.load(&pool).await?;

    let cluster =
        connect_cluster(&config, Rc::clone(&registry), shutdown).await;

    Ok(Runtime::new(
        config,
        pool,
        registry,
        cluster,
        Box::new(crate::runtime::ScratchAuthenticator),
    ))
}

async fn connect_cluster(
    config: &SystemConfig,
    registry: Rc<Registry>,
    shutdown: Rc<tokio::sync::Notify>,
) -> Cluster {
    if config.ocd.ocd_address.is_empty() {
        return Cluster::standalone();
    }

    Cluster::connect(&config.ocd, registry, shutdown).await
}

#[tokio::main(flavor = "current_thread")]
pub async fn imap(config: Arc<SystemConfig>) {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let shutdown = Rc::new(tokio::sync::Notify::new());
            let runtime = match build_runtime(
                Arc::clone(&config),
                Rc::clone(&shutdown),
            )
            .await
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    fatal!(EX_UNAVAILABLE, "unable to start: {}", e)
                },
            };

            let log_prefix = LogPrefix::new("imap".to_owned());
            let session = Session::new(
                tokio::io::stdin(),
                tokio::io::stdout(),
                Rc::clone(&runtime),
                log_prefix.clone(),
                shutdown,
            );

            if let Err(e) = session.run().await {
                error!("{} session ended with error: {}", log_prefix, e);
            }
            // Drain: no new transactions once the session is gone.
            runtime.pool.close();
        })
        .await;
}

#[tokio::main(flavor = "current_thread")]
pub async fn lmtp(config: Arc<SystemConfig>) {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let shutdown = Rc::new(tokio::sync::Notify::new());
            let runtime =
                match build_runtime(Arc::clone(&config), shutdown).await {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        fatal!(EX_UNAVAILABLE, "unable to start: {}", e)
                    },
                };

            let hostname = if config.server.hostname.is_empty() {
                "localhost".to_owned()
            } else {
                config.server.hostname.clone()
            };

            let log_prefix = LogPrefix::new("lmtp".to_owned());
            let server = LmtpServer::new(
                tokio::io::stdin(),
                tokio::io::stdout(),
                runtime,
                log_prefix.clone(),
                hostname,
            );

            if let Err(e) = server.run().await {
                error!("{} session ended with error: {}", log_prefix, e);
            }
        })
        .await;
}

/// The scratch IMAP listener for compliance testers and local poking.
#[tokio::main(flavor = "current_thread")]
pub async fn imap_test() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let config = Arc::new(SystemConfig::default());
            let (runtime, _db) = match Runtime::scratch(config).await {
                Ok(pair) => pair,
                Err(e) => {
                    fatal!(EX_UNAVAILABLE, "unable to start: {}", e)
                },
            };
            if let Err(e) = runtime.create_mailbox("Archive", 2).await {
                fatal!(EX_UNAVAILABLE, "unable to seed mailboxes: {}", e);
            }

            let listener =
                match tokio::net::TcpListener::bind("127.0.0.1:14143").await
                {
                    Ok(listener) => listener,
                    Err(e) => {
                        fatal!(
                            EX_UNAVAILABLE,
                            "unable to listen on 127.0.0.1:14143: {}",
                            e,
                        )
                    },
                };

            println!("Listening on 127.0.0.1:14143 (plaintext IMAP)");
            println!("Log in with any user whose password == user name");

            let shutdown = Rc::new(tokio::sync::Notify::new());
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("accept failed: {}", e);
                        continue;
                    },
                };

                info!("accepted IMAP connection from {}", peer);
                let (read, write) = tokio::io::split(socket);
                let session = Session::new(
                    read,
                    write,
                    Rc::clone(&runtime),
                    LogPrefix::new(format!("imap[{}]", peer)),
                    Rc::clone(&shutdown),
                );
                tokio::task::spawn_local(async move {
                    let _ = session.run().await;
                });
            }
        })
        .await;
}
