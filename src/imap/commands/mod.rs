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

//! The individual command handlers.
//!
//! Each handler receives the parsed request plus the shared session
//! context, does its work (usually through a `Transaction` and, for
//! APPEND, the injector), and returns its untagged responses together
//! with the tagged completion. Emission order (untagged strictly before
//! tagged) is the session's job, not the handlers'.

mod append;
mod copy;
mod enable;
mod expunge;
mod select;
mod simple;

use std::cell::RefCell;
use std::rc::Rc;

use super::command::{Kind, ParsedCommand};
use super::response::{Response, Tagged};
use super::session::{SessionNotify, SessionState};
use crate::runtime::Runtime;
use crate::store::registry::MailboxInfo;
use crate::support::error::Error;
use crate::support::logging::RequestLog;

/// Everything the server advertises.
pub static CAPABILITIES: &[&str] = &[
    "IMAP4rev1",
    "ANNOTATE",
    "CONDSTORE",
    "ENABLE",
    "IDLE",
    "LITERAL+",
    "UIDPLUS",
];

/// The subset of `CAPABILITIES` subject to ENABLE.
pub static ENABLEABLE: &[&str] = &["CONDSTORE", "ANNOTATE"];

#[derive(Clone)]
pub struct CommandCtx {
    pub runtime: Rc<Runtime>,
    pub state: Rc<RefCell<SessionState>>,
    pub notify: Rc<SessionNotify>,
    /// The request's buffered log, committed by the session when the
    /// tagged response goes out.
    pub log: Rc<RefCell<RequestLog>>,
}

pub struct CommandResult {
    pub responses: Vec<Response>,
    pub tagged: Tagged,
}

impl CommandResult {
    pub fn tagged(tagged: Tagged) -> Self {
        CommandResult {
            responses: Vec::new(),
            tagged,
        }
    }
}

/// Runs one dispatched command to completion.
///
/// Input-reserving commands (IDLE, AUTHENTICATE) never get here; the
/// session runs those itself because they own the input stream.
pub async fn execute(
    command: ParsedCommand,
    ctx: CommandCtx,
) -> CommandResult {
    let tag = command.tag.clone();
    match command.kind {
        Kind::Capability => simple::capability(&tag),
        Kind::Noop => simple::noop(&tag),
        Kind::Check => simple::check(&tag, &ctx),
        Kind::Logout => simple::logout(&tag, &ctx),
        Kind::Login {
            ref user,
            ref password,
        } => simple::login(&tag, user, password, &ctx),
        Kind::Enable { ref capabilities } => {
            enable::enable(&tag, capabilities, &ctx)
        },
        Kind::Select {
            ref mailbox,
            examine,
        } => select::select(&tag, mailbox, examine, &ctx).await,
        Kind::Unselect => select::unselect(&tag, &ctx),
        Kind::Expunge => expunge::expunge(&tag, &ctx).await,
        Kind::Copy {
            uid,
            ref sequence,
            ref mailbox,
        } => copy::copy(&tag, uid, sequence, mailbox, &ctx).await,
        Kind::Append {
            ref mailbox,
            ref items,
        } => append::append(&tag, mailbox, items, &ctx).await,
        Kind::Idle | Kind::Authenticate { .. } => {
            CommandResult::tagged(Tagged::bad(
                tag,
                "command requires the input stream",
            ))
        },
    }
}

/// Resolves a target mailbox for commands that write into it.
///
/// Provisional registry records (negative ids) are mailboxes a peer has
/// announced but this node has not loaded; they cannot be written to.
fn resolve_mailbox(
    ctx: &CommandCtx,
    name: &str,
) -> Result<MailboxInfo, Error> {
    let info = ctx
        .runtime
        .registry
        .find_by_name(name)
        .ok_or(Error::NxMailbox)?;
    if info.deleted {
        return Err(Error::MailboxDeleted);
    }
    if info.id.0 <= 0 {
        return Err(Error::NxMailbox);
    }
    Ok(info)
}

/// The catch-all translation of store errors into tagged responses.
pub fn error_result(tag: &str, e: Error) -> CommandResult {
    let tagged = match e {
        Error::NxMailbox | Error::MailboxDeleted => {
            Tagged::no(tag, "No such mailbox")
                .with_code(super::response::Code::TryCreate)
        },
        Error::OutOfUids => {
            Tagged::no(tag, "Mailbox is out of UIDs")
        },
        Error::BadMessage => Tagged::bad(tag, "Unparsable message"),
        Error::Db(ref db) => {
            Tagged::no(tag, format!("Database failure: {}", db))
        },
        ref other => Tagged::no(tag, format!("{}", other)),
    };

    CommandResult::tagged(tagged)
}
