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

//! SELECT, EXAMINE, and UNSELECT.
//!
//! Selecting takes a point-in-time snapshot of the mailbox's UIDs, which
//! is what sequence numbers are computed against until the session hears
//! otherwise, and attaches the session to the registry record so the
//! injector can reach it.

use std::collections::BTreeMap;
use std::str::FromStr;

use super::{CommandCtx, CommandResult};
use crate::db::driver::{Connection as _, Statement};
use crate::db::sql;
use crate::imap::response::{Code, Cond, Response, Tagged};
use crate::imap::session::{
    CachedMessage, ImapState, Selected, SessionNotify,
};
use crate::store::idset::IdSet;
use crate::store::model::{Flag, Uid};
use crate::support::error::Error;

pub(super) async fn select(
    tag: &str,
    mailbox: &str,
    examine: bool,
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

    let Some(info) = ctx.runtime.registry.find_by_name(mailbox) else {
        return CommandResult::tagged(Tagged::no(tag, "No such mailbox"));
    };
    if info.deleted || info.id.0 <= 0 {
        return CommandResult::tagged(Tagged::no(tag, "No such mailbox"));
    }

    match load_snapshot(ctx, info.id.0, info.first_recent).await {
        Ok((uids, cache, recent, flags)) => {
            // Failed SELECTs leave no mailbox selected, so tear down any
            // previous selection either way.
            SessionNotify::detach(&ctx.notify, &ctx.runtime);

            let exists = uids.count() as u32;
            let highest_modseq = cache
                .values()
                .map(|m| m.modseq)
                .max()
                .unwrap_or(1);

            {
                let mut state = ctx.state.borrow_mut();
                state.imap_state = ImapState::Selected;
                state.selected = Some(Selected {
                    mailbox: info.id,
                    name: info.name.clone(),
                    read_only: examine,
                    uids,
                    cache,
                });
            }
            SessionNotify::attach(&ctx.notify, &ctx.runtime, info.id);

            let responses = vec![
                Response::Flags(flags.clone()),
                Response::Exists(exists),
                Response::Recent(recent),
                Response::Cond {
                    cond: Cond::Ok,
                    code: Some(Code::UidNext(info.uidnext)),
                    text: "Predicted next UID".to_owned(),
                },
                Response::Cond {
                    cond: Cond::Ok,
                    code: Some(Code::UidValidity(info.uidvalidity)),
                    text: "UIDs are valid".to_owned(),
                },
                Response::Cond {
                    cond: Cond::Ok,
                    code: Some(Code::HighestModseq(highest_modseq)),
                    text: "Highest modification sequence".to_owned(),
                },
                Response::Cond {
                    cond: Cond::Ok,
                    code: Some(Code::PermanentFlags(flags)),
                    text: "Flags permitted".to_owned(),
                },
            ];

            CommandResult {
                responses,
                tagged: Tagged::ok(tag, "selected").with_code(if examine {
                    Code::ReadOnly
                } else {
                    Code::ReadWrite
                }),
            }
        },
        Err(e) => super::error_result(tag, e),
    }
}

async fn load_snapshot(
    ctx: &CommandCtx,
    mailbox: i64,
    first_recent: u32,
) -> Result<
    (IdSet<Uid>, BTreeMap<u32, CachedMessage>, u32, Vec<Flag>),
    Error,
> {
    let mut cxn = ctx.runtime.pool.acquire().await?;

    let mut uids = IdSet::new();
    let mut cache = BTreeMap::new();
    for row in cxn
        .exec(&Statement::new(sql::SELECT_UIDS).bind(mailbox))
        .await?
    {
        let uid = row.int(0)? as u32;
        let modseq = row.int(1)? as u64;
        if let Some(uid) = Uid::of(uid) {
            uids.add(uid);
            cache.insert(u32::from(uid), CachedMessage { modseq });
        }
    }

    let recent = cxn
        .exec(
            &Statement::new(sql::COUNT_RECENT)
                .bind(mailbox)
                .bind(first_recent),
        )
        .await?
        .first()
        .map(|r| r.int(0))
        .transpose()?
        .unwrap_or(0) as u32;

    // Every flag name the account has ever used, for the FLAGS response.
    let mut flags = Vec::new();
    for row in cxn
        .exec(&Statement::new(sql::SELECT_ALL_FLAG_NAMES))
        .await?
    {
        if let Ok(flag) = Flag::from_str(row.text(1)?) {
            flags.push(flag);
        }
    }
    for standard in
        [Flag::Answered, Flag::Deleted, Flag::Draft, Flag::Flagged,
         Flag::Seen]
    {
        if !flags.contains(&standard) {
            flags.push(standard);
        }
    }

    Ok((uids, cache, recent, flags))
}

pub(super) fn unselect(tag: &str, ctx: &CommandCtx) -> CommandResult {
    {
        let mut state = ctx.state.borrow_mut();
        if state.selected.is_none() {
            return CommandResult::tagged(Tagged::bad(
                tag,
                "no mailbox selected",
            ));
        }

        state.selected = None;
        state.imap_state = ImapState::Authenticated;
    }
    SessionNotify::detach(&ctx.notify, &ctx.runtime);

    CommandResult::tagged(Tagged::ok(tag, "done"))
}
