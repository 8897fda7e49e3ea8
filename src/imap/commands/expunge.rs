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

//! Permanently removes \Deleted messages (RFC 3501, §6.4.3).
//!
//! The message links, flags, annotations, and modsequence rows go away;
//! the messages row itself stays, since it may be linked from other
//! mailboxes. Responses are emitted from the highest sequence number
//! down, so each reported number is valid against the client's view at
//! the moment it is reported.

use super::{CommandCtx, CommandResult};
use crate::db::driver::Statement;
use crate::db::sql;
use crate::db::transaction::Transaction;
use crate::imap::response::{Response, Tagged};
use crate::store::idset::IdSet;
use crate::store::model::Uid;
use crate::support::error::Error;
use crate::support::logging::Severity;

pub(super) async fn expunge(tag: &str, ctx: &CommandCtx) -> CommandResult {
    let mailbox = {
        let state = ctx.state.borrow();
        let Some(ref selected) = state.selected else {
            return CommandResult::tagged(Tagged::bad(
                tag,
                "no mailbox selected",
            ));
        };
        if selected.read_only {
            return CommandResult::tagged(Tagged::no(
                tag,
                "mailbox is read-only",
            ));
        }
        selected.mailbox
    };

    match run(ctx, mailbox.0).await {
        Ok(expunged) => {
            // Renumber against the snapshot, highest first, removing as
            // we go.
            let mut responses = Vec::new();
            {
                let mut state = ctx.state.borrow_mut();
                let selected = state
                    .selected
                    .as_mut()
                    .expect("selection vanished during EXPUNGE");

                let mut doomed = IdSet::<Uid>::new();
                for &uid in expunged.iter().rev() {
                    let seqnum = selected.uids.index(uid);
                    if 0 == seqnum {
                        continue;
                    }
                    // Emitted from the highest sequence number down, the
                    // numbers computed against the pre-expunge snapshot
                    // stay valid as the client applies them.
                    responses.push(Response::Expunge(seqnum as u32));
                    selected.cache.remove(&u32::from(uid));
                    doomed.add(uid);
                }
                selected.uids.remove_set(&doomed);

                ctx.log.borrow_mut().log(
                    Severity::Debug,
                    format!(
                        "expunged uids {} from \"{}\"",
                        doomed.csl(),
                        selected.name,
                    ),
                );
            }

            CommandResult {
                responses,
                tagged: Tagged::ok(tag, "done"),
            }
        },
        Err(e) => super::error_result(tag, e),
    }
}

async fn run(ctx: &CommandCtx, mailbox: i64) -> Result<Vec<Uid>, Error> {
    let mut txn = Transaction::begin(&ctx.runtime.pool).await?;

    // If \Deleted has never been interned, nothing can be flagged with it.
    let flag = txn
        .enqueue(Statement::new(sql::SELECT_FLAG_ID).bind("\\Deleted"));
    txn.execute().await?;
    let Some(flag) = txn.rows(flag).first().map(|r| r.int(0)).transpose()?
    else {
        txn.rollback().await?;
        return Ok(Vec::new());
    };

    let doomed = txn.enqueue(
        Statement::new(sql::SELECT_DELETED_UIDS)
            .bind(mailbox)
            .bind(flag),
    );
    txn.execute().await?;

    let uids: Vec<Uid> = txn
        .rows(doomed)
        .iter()
        .filter_map(|r| r.int(0).ok())
        .filter_map(|u| Uid::of(u as u32))
        .collect();

    for &uid in &uids {
        for stmt in [
            sql::DELETE_FLAGS,
            sql::DELETE_ANNOTATIONS,
            sql::DELETE_MODSEQUENCES,
            sql::DELETE_MAILBOX_MESSAGE,
        ] {
            txn.enqueue(
                Statement::new(stmt).bind(mailbox).bind(u32::from(uid)),
            );
        }
    }
    txn.execute().await?;
    txn.commit().await?;

    Ok(uids)
}
