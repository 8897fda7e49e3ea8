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

//! The cluster notifier.
//!
//! Each server process keeps a single connection to the cluster
//! coordination daemon (`ocd-address`/`ocd-port`) and exchanges
//! newline-delimited notifications over it:
//!
//! ```text
//! * mailbox "<utf7-name>" uidnext=<n> nextmodseq=<n>
//! * mailbox "<utf7-name>" deleted=(t|f)
//! * shutdown
//! ```
//!
//! Publishing is fire-and-forget. Failure to reach the coordinator at
//! startup is not fatal: the process degrades to standalone mode, which is
//! logged as a disaster because a cluster deployment silently running
//! split-brained is exactly the kind of thing operators get paged for.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, error, info};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::imap::utf7;
use crate::store::model::Modseq;
use crate::store::registry::Registry;
use crate::support::logging;
use crate::support::system_config::OcdConfig;

/// An outbound or inbound change notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Counters {
        mailbox: String,
        uidnext: u32,
        nextmodseq: u64,
    },
    Deleted {
        mailbox: String,
        deleted: bool,
    },
    Shutdown,
}

impl Notification {
    /// Formats the wire line, without the trailing newline.
    pub fn to_line(&self) -> String {
        match *self {
            Notification::Counters {
                ref mailbox,
                uidnext,
                nextmodseq,
            } => format!(
                "* mailbox \"{}\" uidnext={} nextmodseq={}",
                utf7::imap_encode(mailbox),
                uidnext,
                nextmodseq,
            ),
            Notification::Deleted {
                ref mailbox,
                deleted,
            } => format!(
                "* mailbox \"{}\" deleted={}",
                utf7::imap_encode(mailbox),
                if deleted { "t" } else { "f" },
            ),
            Notification::Shutdown => "* shutdown".to_owned(),
        }
    }

    /// Parses one line of coordinator input.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let rest = line.strip_prefix("* ")?;

        if "shutdown" == rest {
            return Some(Notification::Shutdown);
        }

        let rest = rest.strip_prefix("mailbox ")?;
        let rest = rest.strip_prefix('"')?;
        let quote = rest.find('"')?;
        let mailbox = utf7::imap_decode(&rest[..quote]);
        let args = rest[quote + 1..].trim_start();

        if let Some(deleted) = args.strip_prefix("deleted=") {
            return match deleted {
                "t" => Some(Notification::Deleted {
                    mailbox,
                    deleted: true,
                }),
                "f" => Some(Notification::Deleted {
                    mailbox,
                    deleted: false,
                }),
                _ => None,
            };
        }

        let mut uidnext = None;
        let mut nextmodseq = None;
        for word in args.split_ascii_whitespace() {
            if let Some(v) = word.strip_prefix("uidnext=") {
                uidnext = v.parse().ok();
            } else if let Some(v) = word.strip_prefix("nextmodseq=") {
                nextmodseq = v.parse().ok();
            }
        }

        Some(Notification::Counters {
            mailbox,
            uidnext: uidnext?,
            nextmodseq: nextmodseq.unwrap_or(1),
        })
    }
}

/// Handle used by the rest of the process to publish changes.
///
/// In standalone mode the handle swallows everything.
pub struct Cluster {
    sender: RefCell<Option<tokio::sync::mpsc::UnboundedSender<Notification>>>,
}

impl Cluster {
    pub fn standalone() -> Self {
        Cluster {
            sender: RefCell::new(None),
        }
    }

    /// Connects to the coordinator and spawns the reader and writer tasks
    /// onto the current thread's `LocalSet`. On connection failure,
    /// returns a standalone handle.
    ///
    /// A coordinator `shutdown` notification fires `shutdown`, which the
    /// sessions watch.
    pub async fn connect(
        config: &OcdConfig,
        registry: Rc<Registry>,
        shutdown: Rc<tokio::sync::Notify>,
    ) -> Self {
        let address = format!(
            "{}:{}",
            config.ocd_address, config.ocd_port,
        );
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(stream) => stream,
            Err(e) => {
                logging::disaster(&format!(
                    "cannot reach cluster coordinator {}: {}; \
                     continuing standalone",
                    address, e,
                ));
                return Cluster::standalone();
            },
        };

        info!("connected to cluster coordinator {}", address);
        let (read_half, mut write_half) = stream.into_split();
        let (sender, mut outgoing) =
            tokio::sync::mpsc::unbounded_channel::<Notification>();

        tokio::task::spawn_local(async move {
            while let Some(notification) = outgoing.recv().await {
                let mut line = notification.to_line();
                line.push('\n');
                if let Err(e) =
                    write_half.write_all(line.as_bytes()).await
                {
                    error!("lost cluster coordinator connection: {}", e);
                    return;
                }
            }
        });

        tokio::task::spawn_local(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if apply_notification(&registry, &line) {
                            shutdown.notify_waiters();
                        }
                    },
                    Ok(None) => {
                        error!("cluster coordinator closed the connection");
                        return;
                    },
                    Err(e) => {
                        error!("cluster coordinator read error: {}", e);
                        return;
                    },
                }
            }
        });

        Cluster {
            sender: RefCell::new(Some(sender)),
        }
    }

    pub fn publish(&self, notification: Notification) {
        let sender = self.sender.borrow();
        if let Some(ref sender) = *sender {
            // Fire and forget; a dead writer task just means we are
            // standalone now.
            let _ = sender.send(notification);
        }
    }

    pub fn publish_counters(
        &self,
        mailbox: &str,
        uidnext: u32,
        nextmodseq: Modseq,
    ) {
        self.publish(Notification::Counters {
            mailbox: mailbox.to_owned(),
            uidnext,
            nextmodseq: nextmodseq.0,
        });
    }
}

/// Applies one inbound coordinator line to the local registry. Returns
/// whether the line was a shutdown request.
pub fn apply_notification(registry: &Registry, line: &str) -> bool {
    let Some(notification) = Notification::parse(line) else {
        error!("unparsable cluster notification: {:?}", line);
        return false;
    };

    debug!("cluster notification: {:?}", notification);
    match notification {
        Notification::Counters {
            mailbox,
            uidnext,
            nextmodseq,
        } => {
            let Some(info) = registry.obtain(&mailbox, true) else {
                return false;
            };
            registry.set_uidnext_and_nextmodseq(
                info.id,
                uidnext,
                Modseq(nextmodseq),
            );
            false
        },
        Notification::Deleted { mailbox, deleted } => {
            if let Some(info) = registry.obtain(&mailbox, true) {
                registry.set_deleted(info.id, deleted);
            }
            false
        },
        Notification::Shutdown => {
            info!("cluster coordinator requested shutdown");
            true
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn notification_round_trip() {
        for notification in [
            Notification::Counters {
                mailbox: "INBOX".to_owned(),
                uidnext: 42,
                nextmodseq: 17,
            },
            Notification::Deleted {
                mailbox: "Lost & Found".to_owned(),
                deleted: true,
            },
            Notification::Shutdown,
        ] {
            let line = notification.to_line();
            assert_eq!(Some(notification), Notification::parse(&line));
        }
    }

    #[test]
    fn wire_shapes() {
        assert_eq!(
            "* mailbox \"INBOX\" uidnext=10 nextmodseq=3",
            Notification::Counters {
                mailbox: "INBOX".to_owned(),
                uidnext: 10,
                nextmodseq: 3,
            }
            .to_line(),
        );
        assert_eq!(
            "* mailbox \"Lost &- Found\" deleted=t",
            Notification::Deleted {
                mailbox: "Lost & Found".to_owned(),
                deleted: true,
            }
            .to_line(),
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(None, Notification::parse("mailbox \"x\" uidnext=1"));
        assert_eq!(None, Notification::parse("* mailbox INBOX uidnext=1"));
        assert_eq!(
            None,
            Notification::parse("* mailbox \"INBOX\" deleted=x"),
        );
        assert_eq!(None, Notification::parse("* mailbox \"INBOX\""));
    }

    #[test]
    fn inbound_updates_registry() {
        let registry = Registry::new();
        apply_notification(
            &registry,
            "* mailbox \"INBOX\" uidnext=40 nextmodseq=9",
        );

        let info = registry.find_by_name("INBOX").unwrap();
        assert_eq!(40, info.uidnext);
        assert_eq!(Modseq(9), info.nextmodseq);

        apply_notification(&registry, "* mailbox \"INBOX\" deleted=t");
        assert!(registry.find_by_name("INBOX").unwrap().deleted);

        assert!(apply_notification(&registry, "* shutdown"));

        // Stale counters are ignored.
        apply_notification(
            &registry,
            "* mailbox \"INBOX\" uidnext=5 nextmodseq=2",
        );
        let info = registry.find_by_name("INBOX").unwrap();
        assert_eq!(40, info.uidnext);
    }
}
