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

//! The LMTP delivery pathway (RFC 2033).
//!
//! LMTP differs from SMTP in exactly one interesting way: after the
//! message data, the server answers once per accepted recipient rather
//! than once per message, so a multi-recipient delivery can partially
//! succeed. Delivery itself is the injector's job; one injection carries
//! the message into every recipient's mailbox atomically, so in practice
//! the per-recipient answers here agree with each other.

use std::rc::Rc;

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::runtime::Runtime;
use crate::store::inject::{inject, Injection, MailboxTarget};
use crate::store::message::Message;
use crate::store::model::MailboxId;
use crate::support::buffer::FramingBuffer;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

const MAX_MESSAGE: usize = 64 * 1024 * 1024;

pub struct LmtpServer<R, W> {
    reader: R,
    writer: W,
    runtime: Rc<Runtime>,
    log_prefix: LogPrefix,
    local_host_name: String,

    framing: FramingBuffer,
    helo_host: Option<String>,
    return_path: Option<String>,
    recipients: Vec<Recipient>,
}

#[derive(Clone, Debug)]
struct Recipient {
    address: String,
    mailbox: MailboxId,
}

enum DataOutcome {
    Complete(Vec<u8>),
    TooLarge,
    Eof,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> LmtpServer<R, W> {
    pub fn new(
        reader: R,
        writer: W,
        runtime: Rc<Runtime>,
        log_prefix: LogPrefix,
        local_host_name: String,
    ) -> Self {
        LmtpServer {
            reader,
            writer,
            runtime,
            log_prefix,
            local_host_name,
            framing: FramingBuffer::new(),
            helo_host: None,
            return_path: None,
            recipients: Vec::new(),
        }
    }

    pub async fn run(mut self) -> Result<(), Error> {
        self.send(&format!(
            "220 {} LMTP ready",
            self.local_host_name.clone(),
        ))
        .await?;

        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(());
            };
            let line = String::from_utf8_lossy(&line).into_owned();
            let (verb, rest) = split_verb(&line);

            match verb.to_uppercase().as_str() {
                "LHLO" => {
                    self.helo_host = Some(rest.trim().to_owned());
                    let host = self.local_host_name.clone();
                    self.send(&format!("250-{}", host)).await?;
                    self.send("250-PIPELINING").await?;
                    self.send("250-ENHANCEDSTATUSCODES").await?;
                    self.send("250 8BITMIME").await?;
                },
                "HELO" | "EHLO" => {
                    self.send("500 5.5.1 This is LMTP, not SMTP").await?;
                },
                "MAIL" => {
                    if self.helo_host.is_none() {
                        self.send("503 5.5.1 LHLO first").await?;
                    } else if self.return_path.is_some() {
                        self.send("503 5.5.1 Nested MAIL").await?;
                    } else {
                        match parse_path(rest, "FROM") {
                            Some(path) => {
                                self.return_path = Some(path);
                                self.send("250 2.1.0 sender ok").await?;
                            },
                            None => {
                                self.send("501 5.5.4 Bad MAIL syntax")
                                    .await?;
                            },
                        }
                    }
                },
                "RCPT" => {
                    if self.return_path.is_none() {
                        self.send("503 5.5.1 MAIL first").await?;
                        continue;
                    }
                    match parse_path(rest, "TO") {
                        Some(address) => {
                            match self.resolve_mailbox(&address) {
                                Some(mailbox) => {
                                    self.recipients.push(Recipient {
                                        address,
                                        mailbox,
                                    });
                                    self.send("250 2.1.5 recipient ok")
                                        .await?;
                                },
                                None => {
                                    self.send(
                                        "550 5.1.1 No such mailbox here",
                                    )
                                    .await?;
                                },
                            }
                        },
                        None => {
                            self.send("501 5.5.4 Bad RCPT syntax").await?;
                        },
                    }
                },
                "DATA" => {
                    if self.recipients.is_empty() {
                        self.send("503 5.5.1 RCPT first").await?;
                        continue;
                    }
                    self.send("354 go ahead").await?;
                    match self.read_data().await? {
                        DataOutcome::Complete(data) => {
                            self.deliver(&data).await?;
                        },
                        // Already answered; the stream is back in sync.
                        DataOutcome::TooLarge => {},
                        DataOutcome::Eof => return Ok(()),
                    }
                    self.return_path = None;
                    self.recipients.clear();
                },
                "RSET" => {
                    self.return_path = None;
                    self.recipients.clear();
                    self.send("250 2.0.0 reset").await?;
                },
                "NOOP" => {
                    self.send("250 2.0.0 ok").await?;
                },
                "QUIT" => {
                    let host = self.local_host_name.clone();
                    self.send(&format!("221 2.0.0 {} closing", host))
                        .await?;
                    return Ok(());
                },
                _ => {
                    self.send("500 5.5.1 Unknown command").await?;
                },
            }
        }
    }

    /// Maps a recipient address to a mailbox.
    ///
    /// With subaddressing, `user+detail@host` delivers to the mailbox
    /// named by `detail` when it exists; everything else lands in the
    /// INBOX.
    fn resolve_mailbox(&self, address: &str) -> Option<MailboxId> {
        let localpart = address.split('@').next().unwrap_or(address);

        if self.runtime.config.server.use_subaddressing {
            if let Some((_, detail)) = localpart.split_once('+') {
                if let Some(info) =
                    self.runtime.registry.find_by_name(detail)
                {
                    if !info.deleted && info.id.0 > 0 {
                        return Some(info.id);
                    }
                }
            }
        }

        self.runtime
            .registry
            .find_by_name("INBOX")
            .filter(|info| !info.deleted && info.id.0 > 0)
            .map(|info| info.id)
    }

    async fn deliver(&mut self, data: &[u8]) -> Result<(), Error> {
        let recipients = std::mem::take(&mut self.recipients);

        let message = match Message::parse(data) {
            Ok(message) => message,
            Err(_) => {
                for _ in &recipients {
                    self.send("554 5.6.0 Unparsable message").await?;
                }
                return Ok(());
            },
        };

        // One injection, one copy per distinct mailbox.
        let mut targets: Vec<MailboxTarget> = Vec::new();
        for recipient in &recipients {
            if !targets.iter().any(|t| t.mailbox == recipient.mailbox) {
                targets.push(MailboxTarget {
                    mailbox: recipient.mailbox,
                    flags: Vec::new(),
                    annotations: Vec::new(),
                });
            }
        }

        let result = inject(
            &self.runtime,
            vec![Injection {
                message,
                internal_date: None,
                targets,
                delivery: None,
            }],
        )
        .await;

        // One reply per recipient, in RCPT order.
        match result {
            Ok(report) => {
                info!(
                    "{} delivered message {} (dated {}) from <{}> to {} \
                     recipient(s)",
                    self.log_prefix,
                    report.messages[0].message.0,
                    report.messages[0].internal_date,
                    self.return_path.as_deref().unwrap_or(""),
                    recipients.len(),
                );
                for recipient in &recipients {
                    self.send(&format!(
                        "250 2.0.0 <{}> delivered",
                        recipient.address,
                    ))
                    .await?;
                }
            },
            Err(e) => {
                debug!("{} delivery failed: {}", self.log_prefix, e);
                let reply = if e.is_transient() {
                    "451 4.3.0 Delivery failed, try later"
                } else {
                    "554 5.3.0 Delivery failed"
                };
                for _ in &recipients {
                    self.send(reply).await?;
                }
            },
        }

        Ok(())
    }

    /// Reads the message body up to the lone-dot terminator, reversing
    /// dot-stuffing.
    async fn read_data(&mut self) -> Result<DataOutcome, Error> {
        let mut data = Vec::new();
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(DataOutcome::Eof);
            };

            if b"." == line.as_slice() {
                return Ok(DataOutcome::Complete(data));
            }

            let line = if line.starts_with(b"..") {
                &line[1..]
            } else {
                &line[..]
            };
            data.extend_from_slice(line);
            data.extend_from_slice(b"\r\n");

            if data.len() > MAX_MESSAGE {
                self.send("552 5.3.4 Message too large").await?;
                // Swallow the rest of the message body.
                loop {
                    let Some(line) = self.next_line().await? else {
                        return Ok(DataOutcome::Eof);
                    };
                    if b"." == line.as_slice() {
                        return Ok(DataOutcome::TooLarge);
                    }
                }
            }
        }
    }

    async fn next_line(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(line) = self.framing.remove_line() {
                return Ok(Some(line));
            }
            if self.framing.eof() {
                return Ok(None);
            }

            let n = self.reader.read(&mut buf).await?;
            if 0 == n {
                self.framing.set_eof();
                continue;
            }
            self.framing.append(&buf[..n]);
        }
    }

    async fn send(&mut self, line: &str) -> Result<(), Error> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

fn split_verb(line: &str) -> (&str, &str) {
    match line.find(' ') {
        Some(ix) => (&line[..ix], &line[ix + 1..]),
        None => (line, ""),
    }
}

/// Extracts the path from `FROM:<...>` / `TO:<...>`, tolerating the usual
/// spacing sloppiness.
fn parse_path(rest: &str, keyword: &str) -> Option<String> {
    let rest = rest.trim();
    let after = rest
        .strip_prefix(keyword)
        .or_else(|| rest.strip_prefix(&keyword.to_lowercase()))?;
    let after = after.trim_start().strip_prefix(':')?.trim_start();

    let after = after.strip_prefix('<')?;
    let close = after.find('>')?;
    Some(after[..close].to_owned())
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::time::{timeout, Duration};

    use super::*;
    use crate::db::scratch::ScratchDb;
    use crate::store::message::testdata::SIMPLE;
    use crate::support::system_config::SystemConfig;

    struct Client {
        read: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        write: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, data: &str) {
            self.write.write_all(data.as_bytes()).await.unwrap();
            self.write.flush().await.unwrap();
        }

        async fn line(&mut self) -> String {
            let mut line = String::new();
            timeout(
                Duration::from_secs(5),
                self.read.read_line(&mut line),
            )
            .await
            .expect("timed out waiting for LMTP output")
            .unwrap();
            line.trim_end_matches(['\r', '\n']).to_owned()
        }

        async fn expect(&mut self, prefix: &str) {
            let line = self.line().await;
            assert!(
                line.starts_with(prefix),
                "expected {:?}, got {:?}",
                prefix,
                line,
            );
        }
    }

    async fn fixture(config: SystemConfig) -> (Client, Rc<Runtime>, ScratchDb)
    {
        crate::init_test_log();
        let (runtime, db) =
            Runtime::scratch(Arc::new(config)).await.unwrap();

        let (client_io, server_io) = tokio::io::duplex(1024 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let server = LmtpServer::new(
            server_read,
            server_write,
            Rc::clone(&runtime),
            LogPrefix::new("lmtp-test".to_owned()),
            "mail.example.org".to_owned(),
        );
        tokio::task::spawn_local(async move {
            let _ = server.run().await;
        });

        let (read, write) = tokio::io::split(client_io);
        let mut client = Client {
            read: BufReader::new(read),
            write,
        };
        client.expect("220 mail.example.org LMTP").await;

        (client, runtime, db)
    }

    fn message_text() -> String {
        String::from_utf8_lossy(SIMPLE).into_owned()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn delivers_to_inbox() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (mut client, _runtime, db) =
                    fixture(SystemConfig::default()).await;

                client.send("LHLO mx.example.org\r\n").await;
                client.expect("250-mail.example.org").await;
                client.expect("250-PIPELINING").await;
                client.expect("250-ENHANCEDSTATUSCODES").await;
                client.expect("250 8BITMIME").await;

                client.send("MAIL FROM:<kingkong@downtown.org>\r\n").await;
                client.expect("250 2.1.0").await;
                client.send("RCPT TO:<joe@sixpack.org>\r\n").await;
                client.expect("250 2.1.5").await;
                client.send("RCPT TO:<jane@sixpack.org>\r\n").await;
                client.expect("250 2.1.5").await;

                client.send("DATA\r\n").await;
                client.expect("354").await;
                client.send(&message_text()).await;
                client.send(".\r\n").await;

                // LMTP: one answer per recipient.
                client.expect("250 2.0.0 <joe@sixpack.org>").await;
                client.expect("250 2.0.0 <jane@sixpack.org>").await;

                client.send("QUIT\r\n").await;
                client.expect("221").await;

                // Both recipients share the INBOX here, so exactly one
                // copy was linked.
                db.with_tables(|t| {
                    assert_eq!(1, t.rows("messages").len());
                    assert_eq!(1, t.rows("mailbox_messages").len());
                });
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn subaddressing_targets_named_mailbox() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let mut config = SystemConfig::default();
                config.server.use_subaddressing = true;
                let (mut client, runtime, db) = fixture(config).await;

                db.create_mailbox("lists", 9);
                runtime.registry.load(&runtime.pool).await.unwrap();

                client.send("LHLO mx\r\n").await;
                for _ in 0..4 {
                    client.line().await;
                }

                client.send("MAIL FROM:<a@b.c>\r\n").await;
                client.expect("250").await;
                client.send("RCPT TO:<joe+lists@sixpack.org>\r\n").await;
                client.expect("250").await;
                client.send("DATA\r\n").await;
                client.expect("354").await;
                client.send(&message_text()).await;
                client.send(".\r\n").await;
                client.expect("250 2.0.0").await;

                let lists =
                    runtime.registry.find_by_name("lists").unwrap();
                db.with_tables(|t| {
                    use crate::db::driver::Value;
                    let rows = t.rows("mailbox_messages");
                    assert_eq!(1, rows.len());
                    assert_eq!(Value::Int(lists.id.0), rows[0][0]);
                });
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dot_stuffing_and_sequencing() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (mut client, _runtime, db) =
                    fixture(SystemConfig::default()).await;

                client.send("MAIL FROM:<a@b.c>\r\n").await;
                client.expect("503").await;

                client.send("LHLO mx\r\n").await;
                for _ in 0..4 {
                    client.line().await;
                }

                client.send("DATA\r\n").await;
                client.expect("503").await;

                client.send("MAIL FROM:<a@b.c>\r\n").await;
                client.expect("250").await;
                client.send("RCPT TO:<joe@sixpack.org>\r\n").await;
                client.expect("250").await;
                client.send("DATA\r\n").await;
                client.expect("354").await;
                client
                    .send("From: a@b.c\r\n\r\n..leading dot\r\n.\r\n")
                    .await;
                client.expect("250 2.0.0").await;

                db.with_tables(|t| {
                    use crate::db::driver::Value;
                    let parts = t.rows("bodyparts");
                    assert_eq!(1, parts.len());
                    assert_eq!(
                        Value::Text(".leading dot\r\n".to_owned()),
                        parts[0][4],
                    );
                });
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn smtp_helo_is_rejected() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (mut client, _runtime, _db) =
                    fixture(SystemConfig::default()).await;

                client.send("HELO mx\r\n").await;
                client.expect("500 5.5.1 This is LMTP").await;
            })
            .await;
    }
}
