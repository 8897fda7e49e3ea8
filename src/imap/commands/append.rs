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

//! APPEND (RFC 3501 §6.3.11, MULTIAPPEND per RFC 3502, APPENDUID per
//! RFC 4315).
//!
//! All items of a multi-append go through the injector as one atomic
//! operation: either every message lands in the mailbox or none does.

use chrono::prelude::*;

use super::{CommandCtx, CommandResult};
use crate::imap::command::AppendItem;
use crate::imap::response::{Code, Tagged};
use crate::imap::session::ImapState;
use crate::store::idset::IdSet;
use crate::store::inject::{inject, Injection, MailboxTarget};
use crate::store::message::Message;
use crate::store::model::Uid;
use crate::support::logging::Severity;

pub(super) async fn append(
    tag: &str,
    mailbox: &str,
    items: &[AppendItem],
    ctx: &CommandCtx,
) -> CommandResult {
    {
        let state = ctx.state.borrow();
        if ImapState::NotAuthenticated == state.imap_state {
            return CommandResult::tagged(Tagged::bad(
                tag,
                "not logged in",
            ));
        }
    }

    let target = match super::resolve_mailbox(ctx, mailbox) {
        Ok(target) => target,
        Err(e) => return super::error_result(tag, e),
    };

    let mut injections = Vec::with_capacity(items.len());
    for item in items {
        let message = match Message::parse(&item.message) {
            Ok(message) => message,
            Err(_) => {
                return CommandResult::tagged(Tagged::no(
                    tag,
                    "Message is not a valid RFC 5322 message",
                ));
            },
        };

        injections.push(Injection {
            message,
            internal_date: item
                .internal_date
                .map(|d| d.with_timezone(&Utc)),
            targets: vec![MailboxTarget {
                mailbox: target.id,
                flags: item.flags.clone(),
                annotations: Vec::new(),
            }],
            delivery: None,
        });
    }

    match inject(&ctx.runtime, injections).await {
        Ok(report) => {
            let mut uids = IdSet::<Uid>::new();
            let mut log = ctx.log.borrow_mut();
            for message in &report.messages {
                for placement in &message.placements {
                    log.log(
                        Severity::Debug,
                        format!(
                            "appended message {} to mailbox {} as uid {} \
                             (modseq {})",
                            message.message.0,
                            placement.mailbox.0,
                            u32::from(placement.uid),
                            placement.modseq.0,
                        ),
                    );
                    uids.add(placement.uid);
                }
            }

            CommandResult::tagged(
                Tagged::ok(tag, "done").with_code(Code::AppendUid {
                    uidvalidity: target.uidvalidity,
                    uids: uids.to_string(),
                }),
            )
        },
        Err(e) => super::error_result(tag, e),
    }
}
