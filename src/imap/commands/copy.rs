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

//! The COPY and UID COPY commands (RFC 3501 §6.4.7, RFC 4315).
//!
//! A copy is one transaction. The target mailbox row is locked with
//! `FOR UPDATE` to allocate the new UID range and modseq, then each
//! contiguous run of up to 1024 source UIDs becomes a small batch of
//! `INSERT ... SELECT` statements with a computed UID delta. Copies of
//! more than 256 messages emit PROGRESS codes so the client knows the
//! server is still alive.
//!
//! Since message content is shared by id, copying touches only the link
//! tables: mailbox_messages, flags, annotations, and modsequences.

use super::{CommandCtx, CommandResult};
use crate::db::driver::Statement;
use crate::db::sql;
use crate::db::transaction::Transaction;
use crate::imap::response::{Code, Cond, Response, Tagged};
use crate::store::idset::IdSet;
use crate::store::model::{MailboxId, Modseq, Seqnum, Uid};
use crate::support::error::Error;
use crate::support::logging::Severity;

const MAX_RUN: u32 = 1024;
const PROGRESS_THRESHOLD: usize = 256;

pub(super) async fn copy(
    tag: &str,
    uid: bool,
    sequence: &str,
    mailbox: &str,
    ctx: &CommandCtx,
) -> CommandResult {
    // Resolve the source set against the session's snapshot.
    let source_uids = {
        let state = ctx.state.borrow();
        let Some(ref selected) = state.selected else {
            return CommandResult::tagged(Tagged::bad(
                tag,
                "no mailbox selected",
            ));
        };

        let max_uid = selected.uids.largest().unwrap_or(0);
        let mut resolved = IdSet::<Uid>::new();
        if uid {
            let Some(requested) = IdSet::<Uid>::parse(
                sequence,
                Uid::of(max_uid).unwrap_or(Uid::MAX),
            ) else {
                return CommandResult::tagged(Tagged::bad(
                    tag,
                    "unparsable sequence set",
                ));
            };
            if !selected.uids.contains_set(&requested) {
                // RFC 3501 §6.4.8: nonexistent UIDs are silently ignored.
                ctx.log.borrow_mut().log(
                    Severity::Debug,
                    format!(
                        "ignoring nonexistent uids in {}",
                        requested,
                    ),
                );
            }
            resolved = requested.intersection(&selected.uids);
        } else {
            let max_seqnum = selected.uids.count() as u32;
            let Some(requested) = IdSet::<Seqnum>::parse(
                sequence,
                Seqnum::of(max_seqnum).unwrap_or(Seqnum::MIN),
            ) else {
                return CommandResult::tagged(Tagged::bad(
                    tag,
                    "unparsable sequence set",
                ));
            };
            if requested.largest().unwrap_or(0) > max_seqnum {
                return CommandResult::tagged(Tagged::bad(
                    tag,
                    "message sequence number out of range",
                ));
            }
            for seqnum in requested.items() {
                let seqnum: Seqnum = seqnum;
                if let Some(uid) =
                    selected.uids.value(u32::from(seqnum) as usize)
                {
                    if let Some(uid) = Uid::of(uid) {
                        resolved.add(uid);
                    }
                }
            }
        }
        resolved
    };

    if source_uids.is_empty() {
        return CommandResult::tagged(Tagged::ok(tag, "nothing copied"));
    }

    let target = match super::resolve_mailbox(ctx, mailbox) {
        Ok(target) => target,
        Err(e) => return super::error_result(tag, e),
    };

    let source_mailbox = ctx
        .state
        .borrow()
        .selected
        .as_ref()
        .expect("selection checked above")
        .mailbox;

    ctx.log.borrow_mut().log(
        Severity::Debug,
        format!(
            "copying {} message(s) (uids {} through {}) to \"{}\"",
            source_uids.count(),
            source_uids.smallest().unwrap_or(0),
            source_uids.largest().unwrap_or(0),
            target.name,
        ),
    );

    match run(ctx, tag, source_mailbox, target.id, &source_uids).await {
        Ok(outcome) => {
            // Keep the registry and the rest of the cluster current if
            // the committed counters are ahead of what we knew.
            let registry = &ctx.runtime.registry;
            let known = registry.find(target.id);
            if known.map_or(true, |k| k.uidnext <= outcome.uidnext) {
                registry.set_uidnext_and_nextmodseq(
                    target.id,
                    outcome.uidnext,
                    outcome.nextmodseq,
                );
                ctx.runtime.cluster.publish_counters(
                    &target.name,
                    outcome.uidnext,
                    outcome.nextmodseq,
                );
            }

            let mut to = IdSet::<Uid>::new();
            to.add_range(
                Uid::of(outcome.first_uid).expect("first uid is nonzero"),
                Uid::of(outcome.uidnext - 1).expect("last uid is nonzero"),
            );

            CommandResult {
                responses: outcome.progress,
                tagged: Tagged::ok(tag, "done").with_code(Code::CopyUid {
                    uidvalidity: target.uidvalidity,
                    from: source_uids.to_string(),
                    to: to.to_string(),
                }),
            }
        },
        Err(e) => super::error_result(tag, e),
    }
}

struct CopyOutcome {
    first_uid: u32,
    uidnext: u32,
    nextmodseq: Modseq,
    progress: Vec<Response>,
}

async fn run(
    ctx: &CommandCtx,
    tag: &str,
    source: MailboxId,
    target: MailboxId,
    uids: &IdSet<Uid>,
) -> Result<CopyOutcome, Error> {
    let mut txn = Transaction::begin(&ctx.runtime.pool).await?;

    // The write lock on the target serialises UID allocation, exactly as
    // in the injector.
    let locked = txn
        .enqueue(Statement::new(sql::LOCK_COPY_TARGET).bind(target.0));
    txn.execute().await?;
    let row = txn
        .rows(locked)
        .first()
        .cloned()
        .ok_or(Error::NxMailbox)?;
    let first_uid = row.int(0)? as u32;
    let modseq = Modseq(row.int(1)? as u64);

    let count = uids.count() as u32;
    let runs = contiguous_runs(uids);
    let total_statements = runs.len() * 3 + 2;
    let mut statements_done = 0usize;
    let mut progress = Vec::new();

    let mut next_uid = first_uid;
    for (run_start, run_len) in runs {
        let (up, delta) = if next_uid >= run_start {
            (true, next_uid - run_start)
        } else {
            (false, run_start - next_uid)
        };

        let (mm, fl, an) = if up {
            (
                sql::COPY_MAILBOX_MESSAGES_UP,
                sql::COPY_FLAGS_UP,
                sql::COPY_ANNOTATIONS_UP,
            )
        } else {
            (
                sql::COPY_MAILBOX_MESSAGES_DOWN,
                sql::COPY_FLAGS_DOWN,
                sql::COPY_ANNOTATIONS_DOWN,
            )
        };

        txn.enqueue(
            Statement::new(mm)
                .bind(target.0)
                .bind(delta)
                .bind(modseq.0 as i64)
                .bind(source.0)
                .bind(run_start)
                .bind(run_start + run_len),
        );
        txn.enqueue(
            Statement::new(fl)
                .bind(target.0)
                .bind(delta)
                .bind(source.0)
                .bind(run_start)
                .bind(run_start + run_len),
        );
        txn.enqueue(
            Statement::new(an)
                .bind(target.0)
                .bind(delta)
                .bind(source.0)
                .bind(run_start)
                .bind(run_start + run_len),
        );
        txn.execute().await?;

        statements_done += 3;
        if count as usize > PROGRESS_THRESHOLD {
            progress.push(Response::Cond {
                cond: Cond::Ok,
                code: Some(Code::Progress {
                    tag: tag.to_owned(),
                    done: statements_done,
                    total: total_statements,
                }),
                text: "working".to_owned(),
            });
        }

        next_uid += run_len;
    }

    txn.enqueue(
        Statement::new(sql::COPY_MODSEQUENCES)
            .bind(target.0)
            .bind(modseq.0 as i64)
            .bind(first_uid)
            .bind(next_uid),
    );
    txn.enqueue(
        Statement::new(sql::SET_COPY_TARGET_COUNTERS)
            .bind(next_uid)
            .bind(modseq.next().0 as i64)
            .bind(target.0),
    );
    txn.execute().await?;
    txn.commit().await?;

    Ok(CopyOutcome {
        first_uid,
        uidnext: next_uid,
        nextmodseq: modseq.next(),
        progress,
    })
}

/// Breaks the source set into contiguous `(start, length)` runs of at most
/// `MAX_RUN`.
fn contiguous_runs(uids: &IdSet<Uid>) -> Vec<(u32, u32)> {
    let mut runs = Vec::new();
    for (start, end) in uids.ranges() {
        let mut start = start;
        while start <= end {
            let len = (end - start + 1).min(MAX_RUN);
            runs.push((start, len));
            start += len;
        }
    }
    runs
}

#[cfg(test)]
mod test {
    use super::*;

    fn uids(raw: &str) -> IdSet<Uid> {
        IdSet::parse(raw, Uid::MAX).unwrap()
    }

    #[test]
    fn run_splitting() {
        assert_eq!(vec![(2, 2), (5, 1)], contiguous_runs(&uids("2:3,5")));
        assert_eq!(
            vec![(1, 1024), (1025, 976)],
            contiguous_runs(&uids("1:2000")),
        );
        assert_eq!(vec![(7, 1)], contiguous_runs(&uids("7")));
    }
}
