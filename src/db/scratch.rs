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

//! The scratch database: an in-process implementation of the driver seam.
//!
//! This backs the test suite and `rowmap dev imap-test`. It is not a SQL
//! engine; it recognises exactly the statements in `crate::db::sql` and
//! implements their semantics over plain vectors, but it is honest about
//! the parts the store's correctness leans on: `FOR UPDATE` row locks that
//! actually block, savepoints that roll back to a marker, unique
//! constraints that fail the way the real database would, and binary COPY
//! decoding. Transactions use an undo log rather than snapshots so that
//! concurrent transactions only interfere where they genuinely share rows.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;

use super::copy::{decode, ColumnType};
use super::driver::{Connection, CopyIn, DbError, Row, Statement, Value};
use super::sql;

type TableRow = (u64, Vec<Value>);

/// All table contents. Exposed (read-only) to tests through
/// `ScratchDb::with_tables`.
#[derive(Default)]
pub struct Tables {
    map: HashMap<&'static str, Vec<TableRow>>,
    sequences: HashMap<&'static str, i64>,
    next_rowid: u64,
}

const TABLES: &[&str] = &[
    "mailboxes",
    "messages",
    "bodyparts",
    "part_numbers",
    "mailbox_messages",
    "header_fields",
    "address_fields",
    "addresses",
    "field_names",
    "flag_names",
    "annotation_names",
    "flags",
    "annotations",
    "deliveries",
    "delivery_recipients",
    "modsequences",
];

impl Tables {
    fn new() -> Self {
        let mut this = Tables::default();
        for &table in TABLES {
            this.map.insert(table, Vec::new());
        }
        this
    }

    fn table(&self, name: &str) -> &Vec<TableRow> {
        self.map.get(name).expect("unknown table")
    }

    fn table_mut(&mut self, name: &str) -> &mut Vec<TableRow> {
        self.map.get_mut(name).expect("unknown table")
    }

    fn next_in_seq(&mut self, table: &'static str) -> i64 {
        let seq = self.sequences.entry(table).or_insert(0);
        *seq += 1;
        *seq
    }

    /// All rows of a table, without internal row ids. For tests.
    pub fn rows(&self, name: &str) -> Vec<Vec<Value>> {
        self.table(name).iter().map(|(_, v)| v.clone()).collect()
    }
}

fn copy_types(table: &str) -> Option<&'static [ColumnType]> {
    use ColumnType::*;
    Some(match table {
        "mailbox_messages" => &[Int, Int, Int, Timestamp, Int],
        "part_numbers" => &[Int, Text, Int, Int, Int],
        "header_fields" => &[Int, Text, Int, Int, Text],
        "address_fields" => &[Int, Text, Int, Int, Int, Int],
        "flags" => &[Int, Int, Int],
        "annotations" => &[Int, Int, Int, Text, Int],
        "modsequences" => &[Int, Int, Int],
        _ => return None,
    })
}

struct Engine {
    tables: RefCell<Tables>,
    locks: RefCell<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

/// Handle on a scratch database. Clones share the same data.
#[derive(Clone)]
pub struct ScratchDb {
    engine: Rc<Engine>,
}

impl ScratchDb {
    pub fn new() -> Self {
        ScratchDb {
            engine: Rc::new(Engine {
                tables: RefCell::new(Tables::new()),
                locks: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn connect(&self) -> ScratchConnection {
        ScratchConnection {
            engine: Rc::clone(&self.engine),
            in_txn: false,
            undo: Vec::new(),
            savepoints: Vec::new(),
            locks: Vec::new(),
            locked_ids: HashSet::new(),
        }
    }

    /// Creates a mailbox row directly, bypassing transactions. Setup only.
    pub fn create_mailbox(&self, name: &str, uidvalidity: u32) -> i64 {
        let mut tables = self.engine.tables.borrow_mut();
        let id = tables.next_in_seq("mailboxes");
        let rowid = tables.next_rowid;
        tables.next_rowid += 1;
        tables.table_mut("mailboxes").push((
            rowid,
            vec![
                Value::Int(id),
                Value::Text(name.to_owned()),
                Value::Int(1), // uidnext
                Value::Int(1), // nextmodseq
                Value::Int(1), // first_recent
                Value::Bool(false),
                Value::Int(uidvalidity.into()),
            ],
        ));
        id
    }

    /// Forces a mailbox's counters, bypassing transactions. Setup only.
    pub fn set_mailbox_counters(
        &self,
        id: i64,
        uidnext: u32,
        nextmodseq: u64,
    ) {
        let mut tables = self.engine.tables.borrow_mut();
        if let Some(row) = tables
            .table_mut("mailboxes")
            .iter_mut()
            .find(|(_, r)| v_int(&r[0]) == id)
        {
            row.1[2] = Value::Int(uidnext.into());
            row.1[3] = Value::Int(nextmodseq as i64);
        }
    }

    /// Runs `f` against the current table contents. For tests and the dev
    /// console.
    pub fn with_tables<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.engine.tables.borrow())
    }
}

impl Default for ScratchDb {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ScratchConnection {
    engine: Rc<Engine>,
    in_txn: bool,
    undo: Vec<Undo>,
    savepoints: Vec<(String, usize)>,
    locks: Vec<tokio::sync::OwnedMutexGuard<()>>,
    locked_ids: HashSet<i64>,
}

enum Undo {
    Insert { table: &'static str, rowid: u64 },
    Delete { table: &'static str, row: TableRow },
    Update { table: &'static str, rowid: u64, prev: Vec<Value> },
}

// ==================== parameter/value plumbing ====================

fn p(stmt: &Statement, ix: usize) -> Result<&Value, DbError> {
    stmt.params.get(ix).ok_or_else(|| {
        DbError::Syntax(format!("missing parameter ${}", ix + 1))
    })
}

fn p_int(stmt: &Statement, ix: usize) -> Result<i64, DbError> {
    match *p(stmt, ix)? {
        Value::Int(v) => Ok(v),
        ref other => Err(DbError::TypeMismatch(format!(
            "${}: expected integer, got {:?}",
            ix + 1,
            other,
        ))),
    }
}

fn p_text(stmt: &Statement, ix: usize) -> Result<String, DbError> {
    match *p(stmt, ix)? {
        Value::Text(ref v) => Ok(v.clone()),
        ref other => Err(DbError::TypeMismatch(format!(
            "${}: expected text, got {:?}",
            ix + 1,
            other,
        ))),
    }
}

fn p_bool(stmt: &Statement, ix: usize) -> Result<bool, DbError> {
    match *p(stmt, ix)? {
        Value::Bool(v) => Ok(v),
        ref other => Err(DbError::TypeMismatch(format!(
            "${}: expected boolean, got {:?}",
            ix + 1,
            other,
        ))),
    }
}

fn v_int(value: &Value) -> i64 {
    match *value {
        Value::Int(v) => v,
        _ => panic!("scratch table corrupted: expected integer"),
    }
}

fn v_text(value: &Value) -> &str {
    match *value {
        Value::Text(ref v) => v,
        _ => panic!("scratch table corrupted: expected text"),
    }
}

// ==================== the connection ====================

impl ScratchConnection {
    fn insert_row(&mut self, table: &'static str, row: Vec<Value>) -> u64 {
        let mut tables = self.engine.tables.borrow_mut();
        let rowid = tables.next_rowid;
        tables.next_rowid += 1;
        tables.table_mut(table).push((rowid, row));
        self.undo.push(Undo::Insert { table, rowid });
        rowid
    }

    // Sequences deliberately do not participate in the undo log: like the
    // real database's sequences, a consumed id stays consumed even if the
    // transaction rolls back, which keeps concurrent transactions from ever
    // being handed the same id.
    fn next_id(&mut self, table: &'static str) -> i64 {
        self.engine.tables.borrow_mut().next_in_seq(table)
    }

    fn delete_where(
        &mut self,
        table: &'static str,
        predicate: impl Fn(&[Value]) -> bool,
    ) -> usize {
        let removed: Vec<TableRow>;
        {
            let mut tables = self.engine.tables.borrow_mut();
            let rows = tables.table_mut(table);
            let mut kept = Vec::with_capacity(rows.len());
            let mut gone = Vec::new();
            for row in rows.drain(..) {
                if predicate(&row.1) {
                    gone.push(row);
                } else {
                    kept.push(row);
                }
            }
            *rows = kept;
            removed = gone;
        }

        let n = removed.len();
        for row in removed {
            self.undo.push(Undo::Delete { table, row });
        }
        n
    }

    fn update_mailbox(
        &mut self,
        id: i64,
        f: impl FnOnce(&mut Vec<Value>),
    ) -> Result<(), DbError> {
        // Writing a row another transaction holds locked, without taking
        // the lock first, is the write-write conflict the real database
        // reports as a serialisation failure.
        if !self.locked_ids.contains(&id) {
            let locks = self.engine.locks.borrow();
            if let Some(mutex) = locks.get(&id) {
                if mutex.try_lock().is_err() {
                    return Err(DbError::SerializationFailure(format!(
                        "concurrent update of mailbox {}",
                        id,
                    )));
                }
            }
        }

        let mut tables = self.engine.tables.borrow_mut();
        let row = tables
            .table_mut("mailboxes")
            .iter_mut()
            .find(|(_, r)| v_int(&r[0]) == id)
            .ok_or_else(|| {
                DbError::Syntax(format!("no mailbox with id {}", id))
            })?;

        let (rowid, values) = (row.0, &mut row.1);
        let prev = values.clone();
        f(values);
        self.undo.push(Undo::Update {
            table: "mailboxes",
            rowid,
            prev,
        });
        Ok(())
    }

    /// Acquires the FOR UPDATE lock on a mailbox row, blocking until the
    /// current holder commits or rolls back, up to the same 10 second
    /// ceiling the database would apply.
    async fn lock_mailbox_row(&mut self, id: i64) -> Result<(), DbError> {
        if self.locked_ids.contains(&id) {
            return Ok(());
        }

        let mutex = {
            let mut locks = self.engine.locks.borrow_mut();
            Arc::clone(
                locks
                    .entry(id)
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };

        let guard = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            mutex.lock_owned(),
        )
        .await
        .map_err(|_| {
            DbError::LockTimeout(format!("mailbox row {}", id))
        })?;
        self.locks.push(guard);
        self.locked_ids.insert(id);
        Ok(())
    }

    fn commit_inner(&mut self) {
        self.undo.clear();
        self.savepoints.clear();
        self.locks.clear();
        self.locked_ids.clear();
        self.in_txn = false;
    }

    fn rollback_inner(&mut self) {
        let mark = 0;
        self.apply_undo(mark);
        self.savepoints.clear();
        self.locks.clear();
        self.locked_ids.clear();
        self.in_txn = false;
    }

    fn apply_undo(&mut self, mark: usize) {
        let mut tables = self.engine.tables.borrow_mut();
        while self.undo.len() > mark {
            match self.undo.pop().unwrap() {
                Undo::Insert { table, rowid } => {
                    tables.table_mut(table).retain(|&(id, _)| id != rowid);
                },
                Undo::Delete { table, row } => {
                    tables.table_mut(table).push(row);
                },
                Undo::Update { table, rowid, prev } => {
                    if let Some(row) = tables
                        .table_mut(table)
                        .iter_mut()
                        .find(|&&mut (id, _)| id == rowid)
                    {
                        row.1 = prev;
                    }
                },
            }
        }
    }

    fn run(&mut self, stmt: &Statement) -> Result<Vec<Row>, DbError> {
        let text = stmt.sql.as_ref();

        match text {
            "begin" => {
                self.in_txn = true;
                Ok(Vec::new())
            },
            "commit" => {
                self.commit_inner();
                Ok(Vec::new())
            },
            "rollback" => {
                self.rollback_inner();
                Ok(Vec::new())
            },

            sql::SELECT_FIELD_ID => self.intern_select("field_names", stmt),
            sql::INSERT_FIELD_NAME => self.intern_insert("field_names", stmt),
            sql::SELECT_FLAG_ID => self.intern_select("flag_names", stmt),
            sql::INSERT_FLAG_NAME => self.intern_insert("flag_names", stmt),
            sql::SELECT_ANNOTATION_ID => {
                self.intern_select("annotation_names", stmt)
            },
            sql::INSERT_ANNOTATION_NAME => {
                self.intern_insert("annotation_names", stmt)
            },

            sql::SELECT_ADDRESS_ID => {
                let name = p_text(stmt, 0)?;
                let localpart = p_text(stmt, 1)?;
                let domain = p_text(stmt, 2)?.to_lowercase();
                let tables = self.engine.tables.borrow();
                Ok(tables
                    .table("addresses")
                    .iter()
                    .filter(|(_, r)| {
                        v_text(&r[1]) == name
                            && v_text(&r[2]) == localpart
                            && v_text(&r[3]).to_lowercase() == domain
                    })
                    .map(|(_, r)| Row(vec![r[0].clone()]))
                    .collect())
            },
            sql::INSERT_ADDRESS => {
                let name = p_text(stmt, 0)?;
                let localpart = p_text(stmt, 1)?;
                let domain = p_text(stmt, 2)?;
                let exists = {
                    let tables = self.engine.tables.borrow();
                    tables.table("addresses").iter().any(|(_, r)| {
                        v_text(&r[1]) == name
                            && v_text(&r[2]) == localpart
                            && v_text(&r[3]).to_lowercase()
                                == domain.to_lowercase()
                    })
                };
                if exists {
                    return Err(DbError::UniqueViolation(
                        "addresses_nld_key".to_owned(),
                    ));
                }

                let id = self.next_id("addresses");
                self.insert_row(
                    "addresses",
                    vec![
                        Value::Int(id),
                        Value::Text(name),
                        Value::Text(localpart),
                        Value::Text(domain),
                    ],
                );
                Ok(vec![Row(vec![Value::Int(id)])])
            },

            sql::SELECT_ALL_MAILBOXES => {
                let tables = self.engine.tables.borrow();
                let mut rows: Vec<&TableRow> =
                    tables.table("mailboxes").iter().collect();
                rows.sort_by_key(|(_, r)| v_int(&r[0]));
                Ok(rows.into_iter().map(|(_, r)| Row(r.clone())).collect())
            },
            sql::INSERT_MAILBOX => {
                let name = p_text(stmt, 0)?;
                let uidvalidity = p_int(stmt, 1)?;
                let exists = {
                    let tables = self.engine.tables.borrow();
                    tables
                        .table("mailboxes")
                        .iter()
                        .any(|(_, r)| v_text(&r[1]) == name)
                };
                if exists {
                    return Err(DbError::UniqueViolation(
                        "mailboxes_name_key".to_owned(),
                    ));
                }

                let id = self.next_id("mailboxes");
                self.insert_row(
                    "mailboxes",
                    vec![
                        Value::Int(id),
                        Value::Text(name),
                        Value::Int(1),
                        Value::Int(1),
                        Value::Int(1),
                        Value::Bool(false),
                        Value::Int(uidvalidity),
                    ],
                );
                Ok(vec![Row(vec![Value::Int(id)])])
            },
            sql::SET_MAILBOX_DELETED => {
                let deleted = p_bool(stmt, 0)?;
                let id = p_int(stmt, 1)?;
                self.update_mailbox(id, |r| r[5] = Value::Bool(deleted))?;
                Ok(Vec::new())
            },

            sql::BUMP_MAILBOX => {
                let n = p_int(stmt, 0)?;
                let id = p_int(stmt, 1)?;
                self.update_mailbox(id, |r| {
                    r[2] = Value::Int(v_int(&r[2]) + n);
                    r[3] = Value::Int(v_int(&r[3]) + 1);
                })?;
                Ok(Vec::new())
            },
            sql::BUMP_MAILBOX_RECENT => {
                let n = p_int(stmt, 0)?;
                let recent = p_int(stmt, 1)?;
                let id = p_int(stmt, 2)?;
                self.update_mailbox(id, |r| {
                    r[2] = Value::Int(v_int(&r[2]) + n);
                    r[3] = Value::Int(v_int(&r[3]) + 1);
                    r[4] = Value::Int(v_int(&r[4]) + recent);
                })?;
                Ok(Vec::new())
            },
            sql::SET_COPY_TARGET_COUNTERS => {
                let uidnext = p_int(stmt, 0)?;
                let nextmodseq = p_int(stmt, 1)?;
                let id = p_int(stmt, 2)?;
                self.update_mailbox(id, |r| {
                    r[2] = Value::Int(uidnext);
                    r[3] = Value::Int(nextmodseq);
                })?;
                Ok(Vec::new())
            },

            sql::INSERT_BODYPART => {
                let hash = p_text(stmt, 0)?;
                let exists = {
                    let tables = self.engine.tables.borrow();
                    tables
                        .table("bodyparts")
                        .iter()
                        .any(|(_, r)| v_text(&r[1]) == hash)
                };
                if exists {
                    return Err(DbError::UniqueViolation(
                        "bodyparts_hash_key".to_owned(),
                    ));
                }

                let id = self.next_id("bodyparts");
                self.insert_row(
                    "bodyparts",
                    vec![
                        Value::Int(id),
                        Value::Text(hash),
                        p(stmt, 1)?.clone(),
                        p(stmt, 2)?.clone(),
                        p(stmt, 3)?.clone(),
                        p(stmt, 4)?.clone(),
                    ],
                );
                Ok(vec![Row(vec![Value::Int(id)])])
            },
            sql::SELECT_BODYPART_BY_HASH => {
                let hash = p_text(stmt, 0)?;
                let tables = self.engine.tables.borrow();
                Ok(tables
                    .table("bodyparts")
                    .iter()
                    .filter(|(_, r)| v_text(&r[1]) == hash)
                    .map(|(_, r)| Row(vec![r[0].clone()]))
                    .collect())
            },

            sql::INSERT_MESSAGE => {
                let id = self.next_id("messages");
                self.insert_row(
                    "messages",
                    vec![Value::Int(id), p(stmt, 0)?.clone()],
                );
                Ok(vec![Row(vec![Value::Int(id)])])
            },

            sql::INSERT_DELIVERY => {
                let id = self.next_id("deliveries");
                self.insert_row(
                    "deliveries",
                    vec![
                        Value::Int(id),
                        p(stmt, 0)?.clone(),
                        p(stmt, 1)?.clone(),
                        p(stmt, 2)?.clone(),
                        p(stmt, 3)?.clone(),
                    ],
                );
                Ok(vec![Row(vec![Value::Int(id)])])
            },
            sql::INSERT_DELIVERY_RECIPIENT => {
                self.insert_row(
                    "delivery_recipients",
                    vec![p(stmt, 0)?.clone(), p(stmt, 1)?.clone()],
                );
                Ok(Vec::new())
            },

            sql::COUNT_RECENT => {
                let mailbox = p_int(stmt, 0)?;
                let uid = p_int(stmt, 1)?;
                let tables = self.engine.tables.borrow();
                let n = tables
                    .table("mailbox_messages")
                    .iter()
                    .filter(|(_, r)| {
                        v_int(&r[0]) == mailbox && v_int(&r[1]) >= uid
                    })
                    .count();
                Ok(vec![Row(vec![Value::Int(n as i64)])])
            },
            sql::SELECT_UIDS => {
                let mailbox = p_int(stmt, 0)?;
                let tables = self.engine.tables.borrow();
                let mut rows: Vec<(i64, i64)> = tables
                    .table("mailbox_messages")
                    .iter()
                    .filter(|(_, r)| v_int(&r[0]) == mailbox)
                    .map(|(_, r)| (v_int(&r[1]), v_int(&r[4])))
                    .collect();
                rows.sort_unstable();
                Ok(rows
                    .into_iter()
                    .map(|(uid, modseq)| {
                        Row(vec![Value::Int(uid), Value::Int(modseq)])
                    })
                    .collect())
            },
            sql::SELECT_ALL_FLAG_NAMES => {
                let tables = self.engine.tables.borrow();
                Ok(tables
                    .table("flag_names")
                    .iter()
                    .map(|(_, r)| Row(r.clone()))
                    .collect())
            },

            sql::COPY_MAILBOX_MESSAGES_UP => {
                self.copy_mailbox_messages(stmt, 1)
            },
            sql::COPY_MAILBOX_MESSAGES_DOWN => {
                self.copy_mailbox_messages(stmt, -1)
            },
            sql::COPY_FLAGS_UP => self.copy_uid_table(stmt, "flags", 1),
            sql::COPY_FLAGS_DOWN => self.copy_uid_table(stmt, "flags", -1),
            sql::COPY_ANNOTATIONS_UP => {
                self.copy_uid_table(stmt, "annotations", 1)
            },
            sql::COPY_ANNOTATIONS_DOWN => {
                self.copy_uid_table(stmt, "annotations", -1)
            },
            sql::COPY_MODSEQUENCES => {
                let mailbox = p_int(stmt, 0)?;
                let modseq = p_int(stmt, 1)?;
                let lo = p_int(stmt, 2)?;
                let hi = p_int(stmt, 3)?;
                let uids: Vec<i64> = {
                    let tables = self.engine.tables.borrow();
                    tables
                        .table("mailbox_messages")
                        .iter()
                        .filter(|(_, r)| {
                            v_int(&r[0]) == mailbox
                                && v_int(&r[1]) >= lo
                                && v_int(&r[1]) < hi
                        })
                        .map(|(_, r)| v_int(&r[1]))
                        .collect()
                };
                for uid in uids {
                    self.insert_row(
                        "modsequences",
                        vec![
                            Value::Int(mailbox),
                            Value::Int(uid),
                            Value::Int(modseq),
                        ],
                    );
                }
                Ok(Vec::new())
            },

            sql::SELECT_DELETED_UIDS => {
                let mailbox = p_int(stmt, 0)?;
                let flag = p_int(stmt, 1)?;
                let tables = self.engine.tables.borrow();
                let flagged: HashSet<i64> = tables
                    .table("flags")
                    .iter()
                    .filter(|(_, r)| {
                        v_int(&r[0]) == mailbox && v_int(&r[2]) == flag
                    })
                    .map(|(_, r)| v_int(&r[1]))
                    .collect();
                let mut uids: Vec<i64> = tables
                    .table("mailbox_messages")
                    .iter()
                    .filter(|(_, r)| {
                        v_int(&r[0]) == mailbox
                            && flagged.contains(&v_int(&r[1]))
                    })
                    .map(|(_, r)| v_int(&r[1]))
                    .collect();
                uids.sort_unstable();
                Ok(uids
                    .into_iter()
                    .map(|u| Row(vec![Value::Int(u)]))
                    .collect())
            },

            sql::DELETE_FLAGS
            | sql::DELETE_ANNOTATIONS
            | sql::DELETE_MODSEQUENCES
            | sql::DELETE_MAILBOX_MESSAGE => {
                let table = match text {
                    sql::DELETE_FLAGS => "flags",
                    sql::DELETE_ANNOTATIONS => "annotations",
                    sql::DELETE_MODSEQUENCES => "modsequences",
                    _ => "mailbox_messages",
                };
                let mailbox = p_int(stmt, 0)?;
                let uid = p_int(stmt, 1)?;
                self.delete_where(table, |r| {
                    v_int(&r[0]) == mailbox && v_int(&r[1]) == uid
                });
                Ok(Vec::new())
            },

            _ if text.starts_with("savepoint ") => {
                let name = text["savepoint ".len()..].to_owned();
                self.savepoints.push((name, self.undo.len()));
                Ok(Vec::new())
            },
            _ if text.starts_with("release savepoint ") => {
                let name = &text["release savepoint ".len()..];
                if let Some(ix) = self
                    .savepoints
                    .iter()
                    .rposition(|(n, _)| n == name)
                {
                    self.savepoints.truncate(ix);
                    Ok(Vec::new())
                } else {
                    Err(DbError::Syntax(format!("no savepoint {}", name)))
                }
            },
            _ if text.starts_with("rollback to savepoint ") => {
                let name = &text["rollback to savepoint ".len()..];
                if let Some(ix) = self
                    .savepoints
                    .iter()
                    .rposition(|(n, _)| n == name)
                {
                    let mark = self.savepoints[ix].1;
                    self.apply_undo(mark);
                    self.savepoints.truncate(ix + 1);
                    Ok(Vec::new())
                } else {
                    Err(DbError::Syntax(format!("no savepoint {}", name)))
                }
            },

            other => Err(DbError::Syntax(format!(
                "statement not recognised by scratch db: {}",
                other,
            ))),
        }
    }

    fn intern_select(
        &mut self,
        table: &'static str,
        stmt: &Statement,
    ) -> Result<Vec<Row>, DbError> {
        let name = p_text(stmt, 0)?;
        let tables = self.engine.tables.borrow();
        Ok(tables
            .table(table)
            .iter()
            .filter(|(_, r)| v_text(&r[1]) == name)
            .map(|(_, r)| Row(vec![r[0].clone()]))
            .collect())
    }

    fn intern_insert(
        &mut self,
        table: &'static str,
        stmt: &Statement,
    ) -> Result<Vec<Row>, DbError> {
        let name = p_text(stmt, 0)?;
        let exists = {
            let tables = self.engine.tables.borrow();
            tables.table(table).iter().any(|(_, r)| v_text(&r[1]) == name)
        };
        if exists {
            return Err(DbError::UniqueViolation(format!(
                "{}_name_key",
                table,
            )));
        }

        let id = self.next_id(table);
        self.insert_row(table, vec![Value::Int(id), Value::Text(name)]);
        Ok(vec![Row(vec![Value::Int(id)])])
    }

    fn mailbox_message_exists(&self, mailbox: i64, uid: i64) -> bool {
        let tables = self.engine.tables.borrow();
        tables
            .table("mailbox_messages")
            .iter()
            .any(|(_, r)| v_int(&r[0]) == mailbox && v_int(&r[1]) == uid)
    }

    fn copy_mailbox_messages(
        &mut self,
        stmt: &Statement,
        sign: i64,
    ) -> Result<Vec<Row>, DbError> {
        let target = p_int(stmt, 0)?;
        let delta = p_int(stmt, 1)?;
        let modseq = p(stmt, 2)?.clone();
        let source = p_int(stmt, 3)?;
        let lo = p_int(stmt, 4)?;
        let hi = p_int(stmt, 5)?;

        let selected: Vec<Vec<Value>> = {
            let tables = self.engine.tables.borrow();
            tables
                .table("mailbox_messages")
                .iter()
                .filter(|(_, r)| {
                    v_int(&r[0]) == source
                        && v_int(&r[1]) >= lo
                        && v_int(&r[1]) < hi
                })
                .map(|(_, r)| r.clone())
                .collect()
        };

        for row in selected {
            let uid = v_int(&row[1]) + sign * delta;
            if self.mailbox_message_exists(target, uid) {
                return Err(DbError::UniqueViolation(
                    "mailbox_messages_pkey".to_owned(),
                ));
            }
            self.insert_row(
                "mailbox_messages",
                vec![
                    Value::Int(target),
                    Value::Int(uid),
                    row[2].clone(),
                    row[3].clone(),
                    modseq.clone(),
                ],
            );
        }

        Ok(Vec::new())
    }

    /// Shared implementation of the flag/annotation copy statements, whose
    /// shapes only differ in trailing columns.
    fn copy_uid_table(
        &mut self,
        stmt: &Statement,
        table: &'static str,
        sign: i64,
    ) -> Result<Vec<Row>, DbError> {
        let target = p_int(stmt, 0)?;
        let delta = p_int(stmt, 1)?;
        let source = p_int(stmt, 2)?;
        let lo = p_int(stmt, 3)?;
        let hi = p_int(stmt, 4)?;

        let selected: Vec<Vec<Value>> = {
            let tables = self.engine.tables.borrow();
            tables
                .table(table)
                .iter()
                .filter(|(_, r)| {
                    v_int(&r[0]) == source
                        && v_int(&r[1]) >= lo
                        && v_int(&r[1]) < hi
                })
                .map(|(_, r)| r.clone())
                .collect()
        };

        for row in selected {
            let mut new_row = row.clone();
            new_row[0] = Value::Int(target);
            new_row[1] = Value::Int(v_int(&row[1]) + sign * delta);
            self.insert_row(table, new_row);
        }

        Ok(Vec::new())
    }
}

#[async_trait(?Send)]
impl Connection for ScratchConnection {
    async fn exec(&mut self, stmt: &Statement) -> Result<Vec<Row>, DbError> {
        // The row lock is the only operation that can suspend; everything
        // else completes synchronously between awaits.
        let result = match stmt.sql.as_ref() {
            sql::LOCK_MAILBOX => {
                let id = p_int(stmt, 0)?;
                self.lock_mailbox_row(id).await?;
                let tables = self.engine.tables.borrow();
                Ok(tables
                    .table("mailboxes")
                    .iter()
                    .filter(|(_, r)| v_int(&r[0]) == id)
                    .map(|(_, r)| {
                        Row(vec![r[2].clone(), r[3].clone(), r[4].clone()])
                    })
                    .collect())
            },
            sql::LOCK_COPY_TARGET => {
                let id = p_int(stmt, 0)?;
                self.lock_mailbox_row(id).await?;
                let tables = self.engine.tables.borrow();
                Ok(tables
                    .table("mailboxes")
                    .iter()
                    .filter(|(_, r)| v_int(&r[0]) == id)
                    .map(|(_, r)| Row(vec![r[2].clone(), r[3].clone()]))
                    .collect())
            },
            _ => self.run(stmt),
        };

        if !self.in_txn {
            match result {
                Ok(_) => self.commit_inner(),
                Err(_) => self.rollback_inner(),
            }
        }

        result
    }

    async fn copy_in(&mut self, copy: &CopyIn) -> Result<u64, DbError> {
        let types = copy_types(copy.table).ok_or_else(|| {
            DbError::Syntax(format!("COPY into unknown table {}", copy.table))
        })?;
        if copy.columns.len() != types.len() {
            return Err(DbError::Syntax(format!(
                "COPY into {} names {} columns",
                copy.table,
                copy.columns.len(),
            )));
        }

        let rows = decode(copy, types)?;
        if rows.len() as u64 != copy.rows {
            return Err(DbError::Syntax(format!(
                "COPY stream for {} declared {} rows but carried {}",
                copy.table,
                copy.rows,
                rows.len(),
            )));
        }

        let table: &'static str = TABLES
            .iter()
            .copied()
            .find(|&t| t == copy.table)
            .expect("copy_types accepted unknown table");

        let mut inserted = 0u64;
        for row in rows {
            if "mailbox_messages" == table || "modsequences" == table {
                let (mailbox, uid) = (v_int(&row[0]), v_int(&row[1]));
                let dup = if "mailbox_messages" == table {
                    self.mailbox_message_exists(mailbox, uid)
                } else {
                    let tables = self.engine.tables.borrow();
                    tables.table("modsequences").iter().any(|(_, r)| {
                        v_int(&r[0]) == mailbox && v_int(&r[1]) == uid
                    })
                };
                if dup {
                    if !self.in_txn {
                        self.rollback_inner();
                    }
                    return Err(DbError::UniqueViolation(format!(
                        "{}_pkey",
                        table,
                    )));
                }
            }

            self.insert_row(table, row);
            inserted += 1;
        }

        if !self.in_txn {
            self.commit_inner();
        }

        Ok(inserted)
    }
}

impl Drop for ScratchConnection {
    fn drop(&mut self) {
        if self.in_txn {
            self.rollback_inner();
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::driver::Pool;
    use super::*;

    fn exec_ok(
        cxn: &mut ScratchConnection,
        stmt: Statement,
    ) -> Vec<Row> {
        futures::executor::block_on(cxn.exec(&stmt)).unwrap()
    }

    #[test]
    fn interning_and_uniqueness() {
        let db = ScratchDb::new();
        let mut cxn = db.connect();

        let rows = exec_ok(
            &mut cxn,
            Statement::new(sql::INSERT_FIELD_NAME).bind("Subject"),
        );
        assert_eq!(1, rows[0].int(0).unwrap());

        let rows = exec_ok(
            &mut cxn,
            Statement::new(sql::INSERT_FIELD_NAME).bind("Received"),
        );
        assert_eq!(2, rows[0].int(0).unwrap());

        let err = futures::executor::block_on(cxn.exec(
            &Statement::new(sql::INSERT_FIELD_NAME).bind("Subject"),
        ));
        assert_matches!(Err(DbError::UniqueViolation(..)), err);

        let rows = exec_ok(
            &mut cxn,
            Statement::new(sql::SELECT_FIELD_ID).bind("Subject"),
        );
        assert_eq!(1, rows[0].int(0).unwrap());
    }

    #[test]
    fn savepoint_rollback_is_partial() {
        let db = ScratchDb::new();
        let mut cxn = db.connect();

        exec_ok(&mut cxn, Statement::new("begin"));
        exec_ok(
            &mut cxn,
            Statement::new(sql::INSERT_FLAG_NAME).bind("kept"),
        );
        exec_ok(&mut cxn, Statement::new("savepoint s"));
        exec_ok(
            &mut cxn,
            Statement::new(sql::INSERT_FLAG_NAME).bind("dropped"),
        );
        exec_ok(&mut cxn, Statement::new("rollback to savepoint s"));
        exec_ok(&mut cxn, Statement::new("commit"));

        db.with_tables(|t| {
            let names: Vec<String> = t
                .rows("flag_names")
                .iter()
                .map(|r| v_text(&r[1]).to_owned())
                .collect();
            assert_eq!(vec!["kept".to_owned()], names);
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn row_locks_serialise() {
        let db = ScratchDb::new();
        let mailbox = db.create_mailbox("INBOX", 1);

        let db2 = db.clone();
        let pool = Pool::new(4, move || Box::new(db2.connect()));

        let mut a = pool.acquire().await.unwrap();
        a.exec(&Statement::new("begin")).await.unwrap();
        a.exec(&Statement::new(sql::LOCK_MAILBOX).bind(mailbox))
            .await
            .unwrap();

        let mut b = pool.acquire().await.unwrap();
        b.exec(&Statement::new("begin")).await.unwrap();
        let rows = {
            let lock_stmt = Statement::new(sql::LOCK_MAILBOX).bind(mailbox);
            let contended = b.exec(&lock_stmt);
            tokio::pin!(contended);

            // B cannot make progress while A holds the lock.
            assert!(futures::poll!(contended.as_mut()).is_pending());

            a.exec(
                &Statement::new(sql::BUMP_MAILBOX).bind(3i64).bind(mailbox),
            )
            .await
            .unwrap();
            a.exec(&Statement::new("commit")).await.unwrap();

            // Now B acquires the lock and sees A's committed bump.
            contended.await.unwrap()
        };
        assert_eq!(4, rows[0].int(0).unwrap());
        assert_eq!(2, rows[0].int(1).unwrap());
        b.exec(&Statement::new("rollback")).await.unwrap();
    }

    #[test]
    fn rollback_undoes_only_own_rows() {
        let db = ScratchDb::new();
        let mut a = db.connect();
        let mut b = db.connect();

        exec_ok(&mut a, Statement::new("begin"));
        exec_ok(&mut a, Statement::new(sql::INSERT_FLAG_NAME).bind("a"));

        // B commits while A's transaction is still open.
        exec_ok(&mut b, Statement::new(sql::INSERT_FLAG_NAME).bind("b"));

        exec_ok(&mut a, Statement::new("rollback"));

        db.with_tables(|t| {
            let names: Vec<String> = t
                .rows("flag_names")
                .iter()
                .map(|r| v_text(&r[1]).to_owned())
                .collect();
            assert_eq!(vec!["b".to_owned()], names);
        });
    }

    #[test]
    fn sequences_survive_rollback() {
        let db = ScratchDb::new();
        let mut cxn = db.connect();

        exec_ok(&mut cxn, Statement::new("begin"));
        exec_ok(&mut cxn, Statement::new(sql::INSERT_MESSAGE).bind(100u32));
        exec_ok(&mut cxn, Statement::new("rollback"));

        // Ids are never reused, even after rollback.
        let rows =
            exec_ok(&mut cxn, Statement::new(sql::INSERT_MESSAGE).bind(7u32));
        assert_eq!(2, rows[0].int(0).unwrap());
    }
}
