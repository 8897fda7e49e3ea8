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

//! The process-wide mailbox registry.
//!
//! One record per known mailbox, keyed by canonical (Unicode) name, loaded
//! from the database at startup and kept current by the injector, the COPY
//! handler, and the cluster notifier. Sessions attach to a record as
//! watchers and are told about new messages and counter movements; they
//! hold `(registry, id)` pairs rather than references into the records, so
//! a record disappearing under them is always observable rather than
//! undefined.
//!
//! The registry is single-threaded state owned by the `Runtime`; no
//! locking, just `RefCell` discipline (never hold a borrow across an
//! await).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use log::debug;

use super::model::{MailboxId, Modseq, Uid};
use crate::db::driver::{Connection as _, Pool, Row, Statement};
use crate::db::sql;
use crate::support::error::Error;

/// The registry's view of one mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxInfo {
    pub id: MailboxId,
    pub name: String,
    pub uidnext: u32,
    pub nextmodseq: Modseq,
    pub first_recent: u32,
    pub deleted: bool,
    pub uidvalidity: u32,
}

impl MailboxInfo {
    fn from_row(row: &Row) -> Result<Self, Error> {
        Ok(MailboxInfo {
            id: MailboxId(row.int(0)?),
            name: row.text(1)?.to_owned(),
            uidnext: row.int(2)? as u32,
            nextmodseq: Modseq(row.int(3)? as u64),
            first_recent: row.int(4)? as u32,
            deleted: row.bool_(5)?,
            uidvalidity: row.int(6)? as u32,
        })
    }
}

/// Hook through which attached sessions hear about mailbox changes.
pub trait Watcher {
    /// A message was committed into the mailbox.
    fn message_added(&self, mailbox: MailboxId, uid: Uid, modseq: Modseq);
    /// The mailbox's counters moved (possibly observed via the cluster).
    fn counters_changed(
        &self,
        mailbox: MailboxId,
        uidnext: u32,
        nextmodseq: Modseq,
    );
}

struct Record {
    info: MailboxInfo,
    watchers: Vec<Weak<dyn Watcher>>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<i64, Record>,
    by_name: HashMap<String, i64>,
    /// Source of provisional (negative) ids for mailboxes known only by
    /// name, e.g. announced by a peer before this node reloads.
    next_provisional: i64,
}

#[derive(Default)]
pub struct Registry {
    inner: RefCell<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// (Re)loads all mailbox records from the database, preserving the
    /// watcher lists of records that survive.
    pub async fn load(&self, pool: &Pool) -> Result<(), Error> {
        let rows = {
            let mut cxn = pool.acquire().await?;
            cxn.exec(&Statement::new(sql::SELECT_ALL_MAILBOXES)).await?
        };

        let mut inner = self.inner.borrow_mut();
        let mut old = std::mem::take(&mut inner.by_id);
        inner.by_name.clear();

        for row in &rows {
            let info = MailboxInfo::from_row(row)?;
            let watchers = old
                .remove(&info.id.0)
                .map(|r| r.watchers)
                .unwrap_or_default();
            inner.by_name.insert(info.name.clone(), info.id.0);
            inner.by_id.insert(info.id.0, Record { info, watchers });
        }

        Ok(())
    }

    pub fn find(&self, id: MailboxId) -> Option<MailboxInfo> {
        self.inner.borrow().by_id.get(&id.0).map(|r| r.info.clone())
    }

    pub fn find_by_name(&self, name: &str) -> Option<MailboxInfo> {
        let inner = self.inner.borrow();
        inner
            .by_name
            .get(name)
            .and_then(|id| inner.by_id.get(id))
            .map(|r| r.info.clone())
    }

    /// Returns the record for `name`, creating a provisional one if asked.
    ///
    /// Creation is idempotent: concurrent `obtain`s of the same name all
    /// land on the same record.
    pub fn obtain(
        &self,
        name: &str,
        create_if_missing: bool,
    ) -> Option<MailboxInfo> {
        if let Some(info) = self.find_by_name(name) {
            return Some(info);
        }
        if !create_if_missing {
            return None;
        }

        let mut inner = self.inner.borrow_mut();
        // Re-check under the borrow; the fast path above released it.
        if let Some(&id) = inner.by_name.get(name) {
            return inner.by_id.get(&id).map(|r| r.info.clone());
        }

        inner.next_provisional -= 1;
        let id = inner.next_provisional;
        debug!(
            "registry: provisional record {} for mailbox \"{}\"",
            id, name,
        );
        let info = MailboxInfo {
            id: MailboxId(id),
            name: name.to_owned(),
            uidnext: 1,
            nextmodseq: Modseq::MIN,
            first_recent: 1,
            deleted: false,
            uidvalidity: 0,
        };
        inner.by_name.insert(name.to_owned(), id);
        inner.by_id.insert(
            id,
            Record {
                info: info.clone(),
                watchers: Vec::new(),
            },
        );
        Some(info)
    }

    /// Raises the mailbox's counters. Values never decrease; a stale
    /// update (from a lagging peer, say) is ignored.
    pub fn set_uidnext_and_nextmodseq(
        &self,
        id: MailboxId,
        uidnext: u32,
        nextmodseq: Modseq,
    ) {
        let watchers = {
            let mut inner = self.inner.borrow_mut();
            let Some(record) = inner.by_id.get_mut(&id.0) else {
                return;
            };

            let changed = uidnext > record.info.uidnext
                || nextmodseq > record.info.nextmodseq;
            record.info.uidnext = record.info.uidnext.max(uidnext);
            record.info.nextmodseq = record.info.nextmodseq.max(nextmodseq);

            if !changed {
                return;
            }
            record.live_watchers()
        };

        for watcher in watchers {
            watcher.counters_changed(id, uidnext, nextmodseq);
        }
    }

    pub fn set_deleted(&self, id: MailboxId, deleted: bool) {
        let mut inner = self.inner.borrow_mut();
        if let Some(record) = inner.by_id.get_mut(&id.0) {
            record.info.deleted = deleted;
        }
    }

    /// Advances the registry's first_recent for `id` (in-memory mirror of
    /// the injector's update).
    pub fn set_first_recent(&self, id: MailboxId, first_recent: u32) {
        let mut inner = self.inner.borrow_mut();
        if let Some(record) = inner.by_id.get_mut(&id.0) {
            record.info.first_recent =
                record.info.first_recent.max(first_recent);
        }
    }

    /// Attaches a session watcher to the mailbox.
    pub fn watch(&self, id: MailboxId, watcher: &Rc<dyn Watcher>) {
        let mut inner = self.inner.borrow_mut();
        if let Some(record) = inner.by_id.get_mut(&id.0) {
            record.watchers.push(Rc::downgrade(watcher));
        }
    }

    pub fn unwatch(&self, id: MailboxId, watcher: &Rc<dyn Watcher>) {
        let mut inner = self.inner.borrow_mut();
        if let Some(record) = inner.by_id.get_mut(&id.0) {
            record
                .watchers
                .retain(|w| match w.upgrade() {
                    Some(alive) => !Rc::ptr_eq(&alive, watcher),
                    None => false,
                });
        }
    }

    /// Whether any live session is attached to the mailbox. The injector
    /// uses this to decide whether its counter update also advances
    /// first_recent.
    pub fn has_watchers(&self, id: MailboxId) -> bool {
        let mut inner = self.inner.borrow_mut();
        inner.by_id.get_mut(&id.0).map_or(false, |record| {
            record.watchers.retain(|w| w.upgrade().is_some());
            !record.watchers.is_empty()
        })
    }

    /// Announces a committed message to the mailbox's watchers.
    pub fn notify_message_added(
        &self,
        id: MailboxId,
        uid: Uid,
        modseq: Modseq,
    ) {
        let watchers = {
            let inner = self.inner.borrow();
            match inner.by_id.get(&id.0) {
                Some(record) => record.live_watchers(),
                None => return,
            }
        };

        for watcher in watchers {
            watcher.message_added(id, uid, modseq);
        }
    }
}

impl Record {
    fn live_watchers(&self) -> Vec<Rc<dyn Watcher>> {
        self.watchers.iter().filter_map(Weak::upgrade).collect()
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use super::*;

    struct RecordingWatcher {
        added: RefCell<Vec<(MailboxId, u32, u64)>>,
        counters: RefCell<Vec<(MailboxId, u32, u64)>>,
    }

    impl RecordingWatcher {
        fn new() -> Rc<Self> {
            Rc::new(RecordingWatcher {
                added: RefCell::new(Vec::new()),
                counters: RefCell::new(Vec::new()),
            })
        }
    }

    impl Watcher for RecordingWatcher {
        fn message_added(
            &self,
            mailbox: MailboxId,
            uid: Uid,
            modseq: Modseq,
        ) {
            self.added.borrow_mut().push((
                mailbox,
                uid.0.get(),
                modseq.0,
            ));
        }

        fn counters_changed(
            &self,
            mailbox: MailboxId,
            uidnext: u32,
            nextmodseq: Modseq,
        ) {
            self.counters.borrow_mut().push((
                mailbox,
                uidnext,
                nextmodseq.0,
            ));
        }
    }

    fn registry_with(name: &str, id: i64) -> Registry {
        let registry = Registry::new();
        registry.inner.borrow_mut().by_name.insert(name.to_owned(), id);
        registry.inner.borrow_mut().by_id.insert(
            id,
            Record {
                info: MailboxInfo {
                    id: MailboxId(id),
                    name: name.to_owned(),
                    uidnext: 1,
                    nextmodseq: Modseq::MIN,
                    first_recent: 1,
                    deleted: false,
                    uidvalidity: 99,
                },
                watchers: Vec::new(),
            },
        );
        registry
    }

    #[test]
    fn obtain_is_idempotent() {
        let registry = Registry::new();
        let a = registry.obtain("INBOX", true).unwrap();
        let b = registry.obtain("INBOX", true).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(None, registry.obtain("Other", false));
        assert!(a.id.0 < 0, "provisional ids are negative");
    }

    #[test]
    fn counters_never_decrease() {
        let registry = registry_with("INBOX", 1);
        let id = MailboxId(1);

        registry.set_uidnext_and_nextmodseq(id, 10, Modseq(5));
        registry.set_uidnext_and_nextmodseq(id, 3, Modseq(2));

        let info = registry.find(id).unwrap();
        assert_eq!(10, info.uidnext);
        assert_eq!(Modseq(5), info.nextmodseq);
    }

    #[test]
    fn watchers_hear_changes_until_detached() {
        let registry = registry_with("INBOX", 1);
        let id = MailboxId(1);
        let watcher = RecordingWatcher::new();
        let as_dyn: Rc<dyn Watcher> = watcher.clone();

        assert!(!registry.has_watchers(id));
        registry.watch(id, &as_dyn);
        assert!(registry.has_watchers(id));

        registry.notify_message_added(id, Uid::u(4), Modseq(7));
        registry.set_uidnext_and_nextmodseq(id, 5, Modseq(8));
        assert_eq!(vec![(id, 4, 7)], *watcher.added.borrow());
        assert_eq!(vec![(id, 5, 8)], *watcher.counters.borrow());

        registry.unwatch(id, &as_dyn);
        assert!(!registry.has_watchers(id));
        registry.notify_message_added(id, Uid::u(5), Modseq(9));
        assert_eq!(1, watcher.added.borrow().len());
    }

    #[test]
    fn dead_watchers_are_pruned() {
        let registry = registry_with("INBOX", 1);
        let id = MailboxId(1);
        {
            let watcher = RecordingWatcher::new();
            let as_dyn: Rc<dyn Watcher> = watcher;
            registry.watch(id, &as_dyn);
        }
        assert!(!registry.has_watchers(id));
    }
}
