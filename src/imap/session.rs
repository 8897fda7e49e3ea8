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

//! The per-connection IMAP state machine.
//!
//! A session owns a byte stream (TLS termination happens outside) and
//! drives everything between it and the command handlers: literal-aware
//! framing, command assembly, dispatch, the pipelining discipline, input
//! reservation for IDLE and AUTHENTICATE, idle-mode notification flushing,
//! and the autologout timer.
//!
//! Pipelining: each command belongs to a group. Group 0 commands run
//! alone; commands sharing a non-zero group may run concurrently. A
//! command that arrives while incompatible commands are executing waits in
//! the Blocked queue, and the head of that queue is promoted as soon as it
//! becomes legal. Whatever the completion order, a command's untagged
//! responses are always written immediately before its tagged response.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use base64::engine::{general_purpose::STANDARD as BASE64, Engine as _};
use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use lazy_static::lazy_static;
use log::{debug, info};
use regex::bytes::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::command::{self, Kind, ParsedCommand, ParseOutcome};
use super::commands::{self, CommandCtx, CommandResult, CAPABILITIES};
use super::response::{Code, Response, Tagged};
use crate::runtime::Runtime;
use crate::store::idset::IdSet;
use crate::store::model::{MailboxId, Modseq, Uid};
use crate::store::registry::Watcher;
use crate::support::buffer::FramingBuffer;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::logging::{RequestLog, Severity};

pub const IDLE_TIMEOUT_SECS: u64 = 1800;
const MAX_LINE: usize = 65536;
// If this is changed, any advertised APPENDLIMIT must change with it.
const LITERAL_SIZE_LIMIT: u32 = 64 * 1024 * 1024;

lazy_static! {
    static ref LITERAL_AT_EOL: Regex =
        Regex::new(r#"\{([0-9]+)(\+?)\}$"#).unwrap();
}

static TAGLINE: &str = concat!(
    "All your mail in a row (",
    env!("CARGO_PKG_NAME"),
    " ",
    env!("CARGO_PKG_VERSION"),
    " ready)"
);

/// RFC 3501 section 3 states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImapState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

pub struct SessionState {
    pub imap_state: ImapState,
    pub user: Option<String>,
    pub selected: Option<Selected>,
    pub condstore: bool,
    pub annotate: bool,
}

/// The session's view of its selected mailbox.
pub struct Selected {
    pub mailbox: MailboxId,
    pub name: String,
    pub read_only: bool,
    /// Point-in-time UID snapshot; sequence numbers are ranks in here.
    pub uids: IdSet<Uid>,
    /// In-memory cache of per-message state for announced messages.
    pub cache: BTreeMap<u32, CachedMessage>,
}

#[derive(Clone, Copy, Debug)]
pub struct CachedMessage {
    pub modseq: u64,
}

/// The session's ear on the registry: the injector pushes new-message
/// events here, and the session drains them when it is legal to tell the
/// client.
pub struct SessionNotify {
    watching: Cell<Option<MailboxId>>,
    arrived: RefCell<Vec<(Uid, Modseq)>>,
    pub wake: tokio::sync::Notify,
}

impl SessionNotify {
    pub fn new() -> Rc<Self> {
        Rc::new(SessionNotify {
            watching: Cell::new(None),
            arrived: RefCell::new(Vec::new()),
            wake: tokio::sync::Notify::new(),
        })
    }

    pub fn attach(this: &Rc<Self>, runtime: &Runtime, mailbox: MailboxId) {
        Self::detach(this, runtime);
        this.watching.set(Some(mailbox));
        let as_watcher: Rc<dyn Watcher> = Rc::clone(this) as Rc<dyn Watcher>;
        runtime.registry.watch(mailbox, &as_watcher);
    }

    pub fn detach(this: &Rc<Self>, runtime: &Runtime) {
        if let Some(old) = this.watching.take() {
            let as_watcher: Rc<dyn Watcher> =
                Rc::clone(this) as Rc<dyn Watcher>;
            runtime.registry.unwatch(old, &as_watcher);
        }
        this.arrived.borrow_mut().clear();
    }

    fn take_arrived(&self) -> Vec<(Uid, Modseq)> {
        std::mem::take(&mut self.arrived.borrow_mut())
    }
}

impl Watcher for SessionNotify {
    fn message_added(&self, mailbox: MailboxId, uid: Uid, modseq: Modseq) {
        if Some(mailbox) == self.watching.get() {
            self.arrived.borrow_mut().push((uid, modseq));
            self.wake.notify_one();
        }
    }

    fn counters_changed(&self, _: MailboxId, _: u32, _: Modseq) {
        // Counter movement alone produces no untagged response.
    }
}

enum Pump {
    NeedMore,
    Overflow,
    Reserve(ParsedCommand),
}

type Completion = (u64, CommandResult, Rc<RefCell<RequestLog>>);

enum Event {
    Read(usize),
    Completed(Completion),
    Wake,
    Shutdown,
    Timeout,
}

/// What the framing layer is currently consuming instead of commands.
enum Discard {
    Bytes(u64),
    Lines,
}

pub struct Session<R, W> {
    reader: R,
    writer: W,
    runtime: Rc<Runtime>,
    log_prefix: LogPrefix,
    shutdown: Rc<tokio::sync::Notify>,

    state: Rc<RefCell<SessionState>>,
    notify: Rc<SessionNotify>,

    framing: FramingBuffer,
    parts: Vec<Vec<u8>>,
    reading_literal: Option<usize>,
    discard: Option<Discard>,

    executing: FuturesUnordered<LocalBoxFuture<'static, Completion>>,
    executing_group: u8,
    blocked: VecDeque<ParsedCommand>,
    next_seq: u64,

    deadline: tokio::time::Instant,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Session<R, W> {
    pub fn new(
        reader: R,
        writer: W,
        runtime: Rc<Runtime>,
        log_prefix: LogPrefix,
        shutdown: Rc<tokio::sync::Notify>,
    ) -> Self {
        Session {
            reader,
            writer,
            runtime,
            log_prefix,
            shutdown,
            state: Rc::new(RefCell::new(SessionState {
                imap_state: ImapState::NotAuthenticated,
                user: None,
                selected: None,
                condstore: false,
                annotate: false,
            })),
            notify: SessionNotify::new(),
            framing: FramingBuffer::new(),
            parts: Vec::new(),
            reading_literal: None,
            discard: None,
            executing: FuturesUnordered::new(),
            executing_group: 0,
            blocked: VecDeque::new(),
            next_seq: 0,
            deadline: tokio::time::Instant::now()
                + std::time::Duration::from_secs(IDLE_TIMEOUT_SECS),
        }
    }

    fn ctx(&self, log: &Rc<RefCell<RequestLog>>) -> CommandCtx {
        CommandCtx {
            runtime: Rc::clone(&self.runtime),
            state: Rc::clone(&self.state),
            notify: Rc::clone(&self.notify),
            log: Rc::clone(log),
        }
    }

    pub async fn run(mut self) -> Result<(), Error> {
        let mut out = Vec::new();
        push_line(
            &mut out,
            &Response::Cond {
                cond: super::response::Cond::Ok,
                code: Some(Code::Capability(CAPABILITIES.to_vec())),
                text: TAGLINE.to_owned(),
            }
            .to_line(),
        );
        self.write_out(&mut out).await?;

        let mut buf = vec![0u8; 8192];
        loop {
            loop {
                match self.pump(&mut out) {
                    Pump::NeedMore => break,
                    Pump::Overflow => {
                        push_line(
                            &mut out,
                            &Response::bye("Command line too long")
                                .to_line(),
                        );
                        self.write_out(&mut out).await?;
                        return Ok(());
                    },
                    Pump::Reserve(parsed) => {
                        self.drain_reserved(parsed, &mut out).await?;
                    },
                }
            }
            self.write_out(&mut out).await?;

            if ImapState::Logout == self.state.borrow().imap_state {
                info!("{} logged out", self.log_prefix);
                return Ok(());
            }

            let event = {
                let reader = &mut self.reader;
                let executing = &mut self.executing;
                let wake = &self.notify.wake;
                let shutdown = &self.shutdown;
                tokio::select! {
                    r = reader.read(&mut buf) => Event::Read(r?),
                    Some(done) = executing.next() => Event::Completed(done),
                    _ = wake.notified() => Event::Wake,
                    _ = shutdown.notified() => Event::Shutdown,
                    _ = tokio::time::sleep_until(self.deadline) =>
                        Event::Timeout,
                }
            };

            match event {
                Event::Read(0) => {
                    // Closing the connection discards everything in
                    // flight; dropping the futures drops their
                    // transactions, which roll back in the driver.
                    self.framing.set_eof();
                    debug!("{} client disconnected", self.log_prefix);
                    return Ok(());
                },
                Event::Read(n) => {
                    self.framing.append(&buf[..n]);
                    self.input_ok()?;
                    self.touch();
                },
                Event::Completed(done) => {
                    let mut batch = vec![done];
                    // Gather everything else that has already finished,
                    // polling with the real task context so that pending
                    // commands still wake us later.
                    futures::future::poll_fn(|cx| {
                        while let std::task::Poll::Ready(Some(done)) =
                            self.executing.poll_next_unpin(cx)
                        {
                            batch.push(done);
                        }
                        std::task::Poll::Ready(())
                    })
                    .await;
                    // A command that finished earlier is reported
                    // earlier; beyond that, completion order stands.
                    batch.sort_by_key(|&(seq, _, _)| seq);
                    for (_, result, log) in batch {
                        self.emit(result, &log, &mut out);
                    }

                    if let Some(parsed) = self.promote() {
                        self.drain_reserved(parsed, &mut out).await?;
                    }
                    self.write_out(&mut out).await?;
                },
                Event::Wake => {
                    // Not idling: arrivals stay queued until the next
                    // command completion makes them legal to announce.
                },
                Event::Shutdown => {
                    push_line(
                        &mut out,
                        &Response::bye("server shutdown").to_line(),
                    );
                    self.write_out(&mut out).await?;
                    return Ok(());
                },
                Event::Timeout => {
                    push_line(
                        &mut out,
                        &Response::bye("autologout").to_line(),
                    );
                    self.write_out(&mut out).await?;
                    info!("{} autologout", self.log_prefix);
                    return Ok(());
                },
            }
        }
    }

    /// Consumes buffered input: discard state, literal bodies, and command
    /// lines. Assembled commands are dispatched as they complete.
    fn pump(&mut self, out: &mut Vec<u8>) -> Pump {
        loop {
            match self.discard.take() {
                Some(Discard::Bytes(n)) => {
                    let available = self.framing.len() as u64;
                    if available < n {
                        self.framing
                            .remove_exact(available as usize)
                            .expect("removing what is buffered");
                        self.discard = Some(Discard::Bytes(n - available));
                        return Pump::NeedMore;
                    }
                    self.framing
                        .remove_exact(n as usize)
                        .expect("removing what is buffered");
                    self.discard = Some(Discard::Lines);
                    continue;
                },
                Some(Discard::Lines) => {
                    let Some(line) = self.framing.remove_line() else {
                        self.discard = Some(Discard::Lines);
                        return Pump::NeedMore;
                    };
                    match literal_at_eol(&line) {
                        // A LITERAL+ literal follows unbidden; keep
                        // discarding.
                        Some((n, true)) => {
                            self.discard = Some(Discard::Bytes(n.into()));
                        },
                        // A plain literal stops for a continuation that
                        // will never come; the command is over.
                        Some((_, false)) | None => {},
                    }
                    continue;
                },
                None => {},
            }

            if let Some(n) = self.reading_literal {
                let Some(literal) = self.framing.remove_exact(n) else {
                    return Pump::NeedMore;
                };
                self.parts.push(literal);
                self.reading_literal = None;
                continue;
            }

            let Some(line) = self.framing.remove_line() else {
                if self.framing.len() > MAX_LINE {
                    return Pump::Overflow;
                }
                return Pump::NeedMore;
            };
            if line.len() > MAX_LINE {
                return Pump::Overflow;
            }

            if let Some((n, plus)) = literal_at_eol(&line) {
                if n > LITERAL_SIZE_LIMIT {
                    self.reject_oversized(&line, plus, n, out);
                    continue;
                }

                self.parts.push(line);
                self.reading_literal = Some(n as usize);
                if !plus {
                    out.extend_from_slice(b"+\r\n");
                }
                continue;
            }

            self.parts.push(line);
            let parts = std::mem::take(&mut self.parts);
            match command::parse(parts) {
                ParseOutcome::Incomprehensible => {
                    push_line(
                        &mut *out,
                        &Response::Cond {
                            cond: super::response::Cond::Bad,
                            code: Some(Code::Parse),
                            text: "Unable to parse command".to_owned(),
                        }
                        .to_line(),
                    );
                },
                ParseOutcome::Bad { tag, message } => {
                    push_line(out, &Tagged::bad(tag, message).to_line());
                },
                ParseOutcome::Command(parsed) => {
                    if let Some(reserve) = self.dispatch(parsed) {
                        return Pump::Reserve(reserve);
                    }
                },
            }
        }
    }

    /// Decides what to do with a freshly parsed command: start it, block
    /// it, or hand it back for input reservation.
    fn dispatch(&mut self, parsed: ParsedCommand) -> Option<ParsedCommand> {
        let busy = !self.executing.is_empty() || !self.blocked.is_empty();

        if parsed.kind.reserves_input() {
            if busy {
                self.blocked.push_back(parsed);
                return None;
            }
            return Some(parsed);
        }

        let group = parsed.kind.group();
        if !busy {
            self.start(parsed);
            return None;
        }

        if !self.blocked.is_empty()
            || 0 == group
            || group != self.executing_group
        {
            debug!(
                "{} blocking execution of {} ({})",
                self.log_prefix, parsed.tag, parsed.name,
            );
            self.blocked.push_back(parsed);
        } else {
            self.start(parsed);
        }

        None
    }

    fn start(&mut self, parsed: ParsedCommand) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.executing_group = parsed.kind.group();

        let log = Rc::new(RefCell::new(RequestLog::new()));
        log.borrow_mut().log(
            Severity::Debug,
            format!(
                "{} executing {} ({})",
                self.log_prefix, parsed.tag, parsed.name,
            ),
        );

        let ctx = self.ctx(&log);
        self.executing.push(
            async move {
                (seq, commands::execute(parsed, ctx).await, log)
            }
            .boxed_local(),
        );
    }

    /// Promotes blocked commands now that the executing set has drained
    /// (or thinned). Returns a command that needs the input stream, if one
    /// reaches the front.
    fn promote(&mut self) -> Option<ParsedCommand> {
        loop {
            let Some(head) = self.blocked.front() else {
                return None;
            };

            let group = head.kind.group();
            let legal = self.executing.is_empty()
                || (0 != group && group == self.executing_group);
            if !legal {
                return None;
            }

            let parsed = self.blocked.pop_front().expect("checked front");
            if parsed.kind.reserves_input() {
                // Reserving commands are group 0, so this only happens
                // with nothing executing.
                return Some(parsed);
            }
            self.start(parsed);
        }
    }

    /// Emits one completed command: queued notifications first, then its
    /// untagged responses, then the tagged line. The request's buffered
    /// log commits with it, keeping debug lines only when the command
    /// failed.
    fn emit(
        &mut self,
        result: CommandResult,
        log: &Rc<RefCell<RequestLog>>,
        out: &mut Vec<u8>,
    ) {
        self.flush_unannounced(out);
        for response in &result.responses {
            push_line(out, &response.to_line());
        }
        push_line(out, &result.tagged.to_line());

        let mut log = log.borrow_mut();
        if super::response::Cond::Ok != result.tagged.cond {
            log.set_failed();
        }
        log.commit();
    }

    /// Announces messages that arrived since the last flush: EXISTS with
    /// the new total, plus FETCH/MODSEQ lines once CONDSTORE is enabled.
    fn flush_unannounced(&mut self, out: &mut Vec<u8>) {
        let arrived = self.notify.take_arrived();
        if arrived.is_empty() {
            return;
        }

        let mut state = self.state.borrow_mut();
        let condstore = state.condstore;
        let Some(ref mut selected) = state.selected else {
            return;
        };

        let mut fresh = Vec::new();
        for (uid, modseq) in arrived {
            if selected.uids.contains(uid) {
                continue;
            }
            selected.uids.add(uid);
            selected
                .cache
                .insert(u32::from(uid), CachedMessage { modseq: modseq.0 });
            fresh.push((uid, modseq));
        }
        if fresh.is_empty() {
            return;
        }

        push_line(
            out,
            &Response::Exists(selected.uids.count() as u32).to_line(),
        );
        if condstore {
            for (uid, modseq) in fresh {
                let seqnum = selected.uids.index(uid) as u32;
                push_line(
                    out,
                    &Response::Fetch {
                        seqnum,
                        uid: u32::from(uid),
                        modseq: Some(modseq.0),
                    }
                    .to_line(),
                );
            }
        }
    }

    /// Rejects a command whose literal exceeds the size limit, arranging
    /// for the protocol stream to stay synchronised.
    fn reject_oversized(
        &mut self,
        line: &[u8],
        literal_plus: bool,
        size: u32,
        out: &mut Vec<u8>,
    ) {
        let line_for_tag: &[u8] =
            self.parts.first().map(Vec::as_slice).unwrap_or(line);
        let tag = line_for_tag
            .split(|&c| b' ' == c)
            .next()
            .filter(|t| !t.is_empty())
            .map(|t| String::from_utf8_lossy(t).into_owned());

        match tag {
            Some(tag) => push_line(
                out,
                &Tagged::no(tag, "Literal size limit exceeded").to_line(),
            ),
            None => push_line(
                out,
                &Response::Cond {
                    cond: super::response::Cond::Bad,
                    code: Some(Code::Parse),
                    text: "Literal size limit exceeded".to_owned(),
                }
                .to_line(),
            ),
        }

        self.parts.clear();
        // With LITERAL+ the client sends the bytes regardless; they (and
        // any continuation of the command) must be consumed and dropped.
        if literal_plus {
            self.discard = Some(Discard::Bytes(size.into()));
        }
    }

    /// Runs a reserving command, then keeps promoting whatever was queued
    /// behind it, possibly another reserving command.
    async fn drain_reserved(
        &mut self,
        first: ParsedCommand,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let mut next = Some(first);
        while let Some(parsed) = next {
            self.write_out(out).await?;
            self.run_reserved(parsed, out).await?;
            next = self.promote();
        }
        Ok(())
    }

    /// Runs a command that owns the input stream until it releases it.
    async fn run_reserved(
        &mut self,
        parsed: ParsedCommand,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        match parsed.kind {
            Kind::Idle => self.run_idle(&parsed.tag, out).await,
            Kind::Authenticate {
                ref mechanism,
                ref initial,
            } => {
                let mechanism = mechanism.clone();
                let initial = initial.clone();
                self.run_authenticate(&parsed.tag, &mechanism, initial, out)
                    .await
            },
            _ => unreachable!("non-reserving command reserved input"),
        }
    }

    /// RFC 2177 IDLE: spontaneous notification until the client says DONE.
    async fn run_idle(
        &mut self,
        tag: &str,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        if ImapState::NotAuthenticated == self.state.borrow().imap_state {
            push_line(out, &Tagged::no(tag, "not logged in").to_line());
            return Ok(());
        }

        out.extend_from_slice(b"+ idling\r\n");
        // Anything already pending can go out right away.
        self.flush_unannounced(out);
        self.write_out(out).await?;
        debug!("{} entered idle mode", self.log_prefix);

        let mut buf = vec![0u8; 8192];
        let outcome = loop {
            if let Some(line) = self.framing.remove_line() {
                if line.eq_ignore_ascii_case(b"DONE") {
                    break Some(Tagged::ok(tag, "done"));
                }
                break Some(Tagged::bad(tag, "expected DONE"));
            }

            let event = {
                let reader = &mut self.reader;
                let wake = &self.notify.wake;
                let shutdown = &self.shutdown;
                tokio::select! {
                    r = reader.read(&mut buf) => Event::Read(r?),
                    _ = wake.notified() => Event::Wake,
                    _ = shutdown.notified() => Event::Shutdown,
                    _ = tokio::time::sleep_until(self.deadline) =>
                        Event::Timeout,
                }
            };

            match event {
                Event::Read(0) => {
                    self.framing.set_eof();
                    break None;
                },
                Event::Read(n) => {
                    self.framing.append(&buf[..n]);
                    self.input_ok()?;
                    self.touch();
                },
                Event::Wake => {
                    self.flush_unannounced(out);
                    self.write_out(out).await?;
                },
                Event::Completed(_) => {
                    unreachable!("no commands execute during IDLE")
                },
                Event::Shutdown => {
                    push_line(
                        out,
                        &Response::bye("server shutdown").to_line(),
                    );
                    self.state.borrow_mut().imap_state = ImapState::Logout;
                    break None;
                },
                Event::Timeout => {
                    push_line(out, &Response::bye("autologout").to_line());
                    self.state.borrow_mut().imap_state = ImapState::Logout;
                    break None;
                },
            }
        };

        debug!("{} left idle mode", self.log_prefix);
        if let Some(tagged) = outcome {
            self.flush_unannounced(out);
            push_line(out, &tagged.to_line());
        }
        self.write_out(out).await
    }

    /// AUTHENTICATE with the PLAIN mechanism; the SASL internals beyond
    /// base64 framing are the authenticator's business.
    async fn run_authenticate(
        &mut self,
        tag: &str,
        mechanism: &str,
        initial: Option<String>,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        if ImapState::NotAuthenticated != self.state.borrow().imap_state {
            push_line(out, &Tagged::bad(tag, "already logged in").to_line());
            return Ok(());
        }
        if "PLAIN" != mechanism {
            push_line(
                out,
                &Tagged::no(tag, "Unsupported mechanism").to_line(),
            );
            return Ok(());
        }

        let response = match initial {
            Some(initial) => initial.into_bytes(),
            None => {
                out.extend_from_slice(b"+ \r\n");
                self.write_out(out).await?;
                match self.await_line(&mut vec![0u8; 8192]).await? {
                    Some(line) => line,
                    None => return Ok(()),
                }
            },
        };

        if b"*" == response.as_slice() {
            push_line(
                out,
                &Tagged::bad(tag, "authentication cancelled").to_line(),
            );
            return self.write_out(out).await;
        }

        let tagged = match BASE64.decode(&response) {
            Ok(decoded) => {
                let mut fields = decoded.split(|&c| 0 == c);
                let _authzid = fields.next();
                let authcid = fields.next().map(String::from_utf8_lossy);
                let password = fields.next().map(String::from_utf8_lossy);
                match (authcid, password) {
                    (Some(user), Some(password)) => {
                        match self
                            .runtime
                            .authenticator
                            .authenticate(&user, &password)
                        {
                            Ok(identity) => {
                                let mut state = self.state.borrow_mut();
                                state.user = Some(identity);
                                state.imap_state = ImapState::Authenticated;
                                Tagged::ok(tag, "logged in").with_code(
                                    Code::Capability(CAPABILITIES.to_vec()),
                                )
                            },
                            Err(_) => Tagged::no(tag, "Login failed"),
                        }
                    },
                    _ => Tagged::bad(tag, "malformed PLAIN response"),
                }
            },
            Err(_) => Tagged::bad(tag, "bad base64"),
        };

        push_line(out, &tagged.to_line());
        self.write_out(out).await
    }

    /// Reads one raw line, reserving the input stream. `None` on EOF.
    async fn await_line(
        &mut self,
        buf: &mut Vec<u8>,
    ) -> Result<Option<Vec<u8>>, Error> {
        loop {
            if let Some(line) = self.framing.remove_line() {
                return Ok(Some(line));
            }
            if self.framing.eof() {
                return Ok(None);
            }

            let n = self.reader.read(buf).await?;
            if 0 == n {
                self.framing.set_eof();
                continue;
            }
            self.framing.append(&buf[..n]);
            self.input_ok()?;
            self.touch();
        }
    }

    /// Surfaces a latched framing-filter failure as an IO error.
    fn input_ok(&self) -> Result<(), Error> {
        match self.framing.error() {
            Some(e) => Err(Error::Io(std::io::Error::new(
                e.kind(),
                e.to_string(),
            ))),
            None => Ok(()),
        }
    }

    async fn write_out(&mut self, out: &mut Vec<u8>) -> Result<(), Error> {
        if out.is_empty() {
            return Ok(());
        }

        self.writer.write_all(out).await?;
        self.writer.flush().await?;
        out.clear();
        self.touch();
        Ok(())
    }

    /// Any completed read or write extends the autologout deadline.
    fn touch(&mut self) {
        self.deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(IDLE_TIMEOUT_SECS);
    }
}

fn push_line(out: &mut Vec<u8>, line: &str) {
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Checks whether a command line ends with a literal marker, returning its
/// size and whether it is a LITERAL+ (`{n+}`) literal.
fn literal_at_eol(line: &[u8]) -> Option<(u32, bool)> {
    LITERAL_AT_EOL.captures(line).and_then(|captures| {
        let size = captures
            .get(1)
            .and_then(|m| std::str::from_utf8(m.as_bytes()).ok())
            .and_then(|s| s.parse::<u32>().ok())?;
        let plus = captures
            .get(2)
            .map_or(false, |m| !m.as_bytes().is_empty());
        Some((size, plus))
    })
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use base64::engine::Engine as _;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::time::{timeout, Duration};

    use super::*;
    use crate::db::scratch::ScratchDb;
    use crate::store::inject::{inject, Injection, MailboxTarget};
    use crate::store::message::testdata::SIMPLE;
    use crate::store::message::Message;
    use crate::store::model::Flag;
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
            .expect("timed out waiting for server output")
            .unwrap();
            line.trim_end_matches(['\r', '\n']).to_owned()
        }

        /// Reads lines until the tagged response for `tag`, returning
        /// everything seen.
        async fn until_tagged(&mut self, tag: &str) -> Vec<String> {
            let mut lines = Vec::new();
            loop {
                let line = self.line().await;
                let done = line.starts_with(&format!("{} ", tag));
                lines.push(line);
                if done {
                    return lines;
                }
            }
        }
    }

    async fn fixture() -> (Client, Rc<Runtime>, ScratchDb) {
        crate::init_test_log();
        let config = Arc::new(SystemConfig::default());
        let (runtime, db) = Runtime::scratch(config).await.unwrap();

        let (client_io, server_io) = tokio::io::duplex(1024 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let session = Session::new(
            server_read,
            server_write,
            Rc::clone(&runtime),
            LogPrefix::new("imap-test".to_owned()),
            Rc::new(tokio::sync::Notify::new()),
        );
        tokio::task::spawn_local(async move {
            let _ = session.run().await;
        });

        let (read, write) = tokio::io::split(client_io);
        let mut client = Client {
            read: BufReader::new(read),
            write,
        };

        let greeting = client.line().await;
        assert!(
            greeting.starts_with("* OK [CAPABILITY IMAP4rev1"),
            "unexpected greeting: {}",
            greeting,
        );

        (client, runtime, db)
    }

    async fn login(client: &mut Client) {
        client.send("L LOGIN test test\r\n").await;
        let lines = client.until_tagged("L").await;
        assert!(lines.last().unwrap().starts_with("L OK"), "{:?}", lines);
    }

    fn local_test(
        body: impl std::future::Future<Output = ()>,
    ) -> impl std::future::Future<Output = ()> {
        async move {
            tokio::task::LocalSet::new().run_until(body).await;
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn literal_login_with_continuation() {
        local_test(async {
            let (mut client, _runtime, _db) = fixture().await;

            client.send("A01 LOGIN {4}\r\n").await;
            assert_eq!("+", client.line().await);
            client.send("test {4}\r\n").await;
            assert_eq!("+", client.line().await);
            client.send("test\r\n").await;

            let lines = client.until_tagged("A01").await;
            assert!(lines.last().unwrap().starts_with("A01 OK"));
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn literal_plus_skips_continuation() {
        local_test(async {
            let (mut client, _runtime, _db) = fixture().await;

            // No continuation may be sent for {n+} literals; the very
            // next line the server sends is the tagged response.
            client
                .send("A02 LOGIN {4+}\r\ntest {4+}\r\ntest\r\n")
                .await;
            let line = client.line().await;
            assert!(line.starts_with("A02 OK"), "{}", line);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn pipelined_noops_answer_in_arrival_order() {
        local_test(async {
            let (mut client, _runtime, _db) = fixture().await;

            client.send("A01 NOOP\r\nA02 NOOP\r\n").await;
            let first = client.line().await;
            let second = client.line().await;
            assert!(first.starts_with("A01 OK"), "{}", first);
            assert!(second.starts_with("A02 OK"), "{}", second);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn enable_condstore_ignores_unknown() {
        local_test(async {
            let (mut client, _runtime, _db) = fixture().await;
            login(&mut client).await;

            client.send("A01 ENABLE CONDSTORE X-UNKNOWN\r\n").await;
            let lines = client.until_tagged("A01").await;
            assert_eq!("* ENABLED CONDSTORE", lines[0]);
            assert!(lines[1].starts_with("A01 OK"));
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn enable_rejects_unenableable_own_capability() {
        local_test(async {
            let (mut client, _runtime, _db) = fixture().await;
            login(&mut client).await;

            client.send("A01 ENABLE IDLE\r\n").await;
            let lines = client.until_tagged("A01").await;
            assert!(lines.last().unwrap().starts_with("A01 BAD"));
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_command_is_bad() {
        local_test(async {
            let (mut client, _runtime, _db) = fixture().await;

            client.send("A01 FROBNICATE\r\n").await;
            let line = client.line().await;
            assert!(line.starts_with("A01 BAD"), "{}", line);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn select_reports_mailbox_state() {
        local_test(async {
            let (mut client, runtime, _db) = fixture().await;
            login(&mut client).await;

            let inbox =
                runtime.registry.find_by_name("INBOX").unwrap().id;
            inject(
                &runtime,
                vec![Injection {
                    message: Message::parse(SIMPLE).unwrap(),
                    internal_date: None,
                    targets: vec![MailboxTarget {
                        mailbox: inbox,
                        flags: vec![Flag::Seen],
                        annotations: Vec::new(),
                    }],
                    delivery: None,
                }],
            )
            .await
            .unwrap();

            client.send("A01 SELECT INBOX\r\n").await;
            let lines = client.until_tagged("A01").await;

            assert!(lines.contains(&"* 1 EXISTS".to_owned()), "{:?}", lines);
            // Delivery into the unattached mailbox advanced first_recent
            // past the message.
            assert!(lines.contains(&"* 0 RECENT".to_owned()), "{:?}", lines);
            assert!(lines
                .iter()
                .any(|l| l.starts_with("* OK [UIDNEXT 2]")));
            assert!(lines
                .iter()
                .any(|l| l.starts_with("* OK [UIDVALIDITY 1]")));
            assert!(lines
                .iter()
                .any(|l| l.starts_with("* OK [HIGHESTMODSEQ 1]")));
            assert!(lines
                .last()
                .unwrap()
                .starts_with("A01 OK [READ-WRITE]"));
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn append_assigns_uids() {
        local_test(async {
            let (mut client, _runtime, db) = fixture().await;
            login(&mut client).await;

            let message = String::from_utf8_lossy(SIMPLE).into_owned();
            client
                .send(&format!(
                    "A01 APPEND INBOX (\\Seen) {{{}+}}\r\n{}\r\n",
                    message.len(),
                    message,
                ))
                .await;
            let lines = client.until_tagged("A01").await;
            assert!(
                lines
                    .last()
                    .unwrap()
                    .starts_with("A01 OK [APPENDUID 1 1]"),
                "{:?}",
                lines,
            );

            db.with_tables(|t| {
                assert_eq!(1, t.rows("mailbox_messages").len());
                assert_eq!(1, t.rows("flags").len());
            });
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn copy_assigns_contiguous_uids() {
        local_test(async {
            let (mut client, runtime, db) = fixture().await;
            login(&mut client).await;

            let inbox =
                runtime.registry.find_by_name("INBOX").unwrap().id;

            // Five messages; flag 1 and 4 \Deleted and expunge them so
            // the mailbox holds UIDs {2,3,5}.
            for ix in 0..5 {
                let flags = if 0 == ix || 3 == ix {
                    vec![Flag::Deleted]
                } else {
                    Vec::new()
                };
                inject(
                    &runtime,
                    vec![Injection {
                        message: Message::parse(SIMPLE).unwrap(),
                        internal_date: None,
                        targets: vec![MailboxTarget {
                            mailbox: inbox,
                            flags,
                            annotations: Vec::new(),
                        }],
                        delivery: None,
                    }],
                )
                .await
                .unwrap();
            }

            // A target mailbox with uidnext=10, nextmodseq=7.
            let target_id = db.create_mailbox("Target", 77);
            db.set_mailbox_counters(target_id, 10, 7);
            runtime.registry.load(&runtime.pool).await.unwrap();

            client.send("S SELECT INBOX\r\n").await;
            client.until_tagged("S").await;
            client.send("E EXPUNGE\r\n").await;
            let lines = client.until_tagged("E").await;
            assert!(lines.contains(&"* 4 EXPUNGE".to_owned()), "{:?}", lines);
            assert!(lines.contains(&"* 1 EXPUNGE".to_owned()), "{:?}", lines);

            client.send("C UID COPY 2:5 Target\r\n").await;
            let lines = client.until_tagged("C").await;
            let tagged = lines.last().unwrap();
            assert!(
                tagged.starts_with("C OK [COPYUID 77 2:3,5 10:12]"),
                "{}",
                tagged,
            );

            db.with_tables(|t| {
                let mailboxes = t.rows("mailboxes");
                let row = mailboxes
                    .iter()
                    .find(|r| {
                        crate::db::driver::Value::Int(target_id) == r[0]
                    })
                    .unwrap();
                assert_eq!(crate::db::driver::Value::Int(13), row[2]);
                assert_eq!(crate::db::driver::Value::Int(8), row[3]);

                // All three copies share modseq 7.
                let copied: Vec<i64> = t
                    .rows("mailbox_messages")
                    .iter()
                    .filter(|r| {
                        crate::db::driver::Value::Int(target_id) == r[0]
                    })
                    .map(|r| match r[4] {
                        crate::db::driver::Value::Int(m) => m,
                        _ => panic!("bad modseq column"),
                    })
                    .collect();
                assert_eq!(vec![7, 7, 7], copied);
            });
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn idle_announces_arrivals() {
        local_test(async {
            let (mut client, runtime, _db) = fixture().await;
            login(&mut client).await;

            client.send("S SELECT INBOX\r\n").await;
            client.until_tagged("S").await;
            client.send("E ENABLE CONDSTORE\r\n").await;
            client.until_tagged("E").await;

            client.send("I IDLE\r\n").await;
            assert_eq!("+ idling", client.line().await);

            let inbox =
                runtime.registry.find_by_name("INBOX").unwrap().id;
            inject(
                &runtime,
                vec![Injection {
                    message: Message::parse(SIMPLE).unwrap(),
                    internal_date: None,
                    targets: vec![MailboxTarget {
                        mailbox: inbox,
                        flags: Vec::new(),
                        annotations: Vec::new(),
                    }],
                    delivery: None,
                }],
            )
            .await
            .unwrap();

            assert_eq!("* 1 EXISTS", client.line().await);
            assert_eq!(
                "* 1 FETCH (UID 1 MODSEQ (1))",
                client.line().await,
            );

            client.send("DONE\r\n").await;
            let line = client.line().await;
            assert!(line.starts_with("I OK"), "{}", line);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn authenticate_plain() {
        local_test(async {
            let (mut client, _runtime, _db) = fixture().await;

            let response = BASE64.encode(b"\0test\0test");
            client.send("A AUTHENTICATE PLAIN\r\n").await;
            assert_eq!("+", client.line().await.trim_end());
            client.send(&format!("{}\r\n", response)).await;
            let line = client.line().await;
            assert!(line.starts_with("A OK"), "{}", line);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn logout_says_bye() {
        local_test(async {
            let (mut client, _runtime, _db) = fixture().await;

            client.send("A LOGOUT\r\n").await;
            let lines = client.until_tagged("A").await;
            assert!(lines.iter().any(|l| l.starts_with("* BYE")));
            assert!(lines.last().unwrap().starts_with("A OK"));
        })
        .await;
    }
}
