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

//! The transaction coordinator.
//!
//! A `Transaction` wraps one pooled connection in BEGIN/COMMIT/ROLLBACK
//! scope. Statements are enqueued without blocking and flushed in FIFO
//! order by `execute()`. The first statement failure latches the
//! transaction as failed: the remaining queue is discarded, later enqueues
//! are dropped, and the retained error is available from `error()`.
//!
//! Savepoints travel through the same queue as ordinary statements. The
//! one wrinkle is `rollback_to_savepoint`, which must reach the database
//! even while the transaction is latched failed (that is the whole point
//! of a savepoint) and which clears a latched unique violation, matching
//! the database's own aborted-until-rolled-back behaviour. Failures other
//! than unique violations stay latched; a serialisation failure or lost
//! connection cannot be repaired by partial rollback.

use std::collections::VecDeque;

use super::driver::{
    Connection as _, CopyIn, DbError, Pool, PooledConnection, Row,
    Statement,
};
use crate::support::error::Error;

enum Op {
    Exec { handle: usize, stmt: Statement },
    Copy { handle: usize, copy: CopyIn },
}

/// Identifies an enqueued statement's result rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryHandle(usize);

pub struct Transaction {
    cxn: PooledConnection,
    queue: VecDeque<Op>,
    results: Vec<Vec<Row>>,
    next_handle: usize,
    failed: Option<DbError>,
}

impl Transaction {
    /// Acquires a connection from the pool and opens a transaction on it.
    pub async fn begin(pool: &Pool) -> Result<Self, Error> {
        let mut cxn = pool.acquire().await?;
        cxn.exec(&Statement::new("begin")).await?;

        Ok(Transaction {
            cxn,
            queue: VecDeque::new(),
            results: Vec::new(),
            next_handle: 0,
            failed: None,
        })
    }

    /// Queues a statement for execution within this transaction.
    ///
    /// Does not block. If the transaction has already failed, the statement
    /// is discarded and the returned handle will never have rows.
    pub fn enqueue(&mut self, stmt: Statement) -> QueryHandle {
        let handle = self.next_handle;
        self.next_handle += 1;

        if self.failed.is_none() {
            self.queue.push_back(Op::Exec { handle, stmt });
        }

        QueryHandle(handle)
    }

    /// Queues a COPY bulk load.
    pub fn enqueue_copy(&mut self, copy: CopyIn) -> QueryHandle {
        let handle = self.next_handle;
        self.next_handle += 1;

        if self.failed.is_none() {
            self.queue.push_back(Op::Copy { handle, copy });
        }

        QueryHandle(handle)
    }

    /// Flushes all queued statements to the driver, in order.
    ///
    /// On the first failure, the queue is discarded and the error is both
    /// latched and returned.
    pub async fn execute(&mut self) -> Result<(), Error> {
        while let Some(op) = self.queue.pop_front() {
            let (handle, result) = match op {
                Op::Exec { handle, ref stmt } => {
                    (handle, self.cxn.exec(stmt).await)
                },
                Op::Copy { handle, ref copy } => (
                    handle,
                    self.cxn.copy_in(copy).await.map(|_| Vec::new()),
                ),
            };

            match result {
                Ok(rows) => self.store_rows(handle, rows),
                Err(e) => {
                    self.queue.clear();
                    self.failed = Some(e.clone());
                    return Err(e.into());
                },
            }
        }

        Ok(())
    }

    fn store_rows(&mut self, handle: usize, rows: Vec<Row>) {
        if self.results.len() <= handle {
            self.results.resize(handle + 1, Vec::new());
        }
        self.results[handle] = rows;
    }

    /// Returns the rows produced by an executed statement. Empty for
    /// statements that are still queued, were discarded, or returned
    /// nothing.
    pub fn rows(&self, handle: QueryHandle) -> &[Row] {
        self.results
            .get(handle.0)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The retained first failure, if any.
    pub fn error(&self) -> Option<&DbError> {
        self.failed.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    /// Enqueues and flushes a `SAVEPOINT`.
    pub async fn savepoint(&mut self, name: &str) -> Result<(), Error> {
        self.enqueue(Statement::new(format!("savepoint {}", name)));
        self.execute().await
    }

    /// Enqueues and flushes a `RELEASE SAVEPOINT`.
    pub async fn release_savepoint(
        &mut self,
        name: &str,
    ) -> Result<(), Error> {
        self.enqueue(Statement::new(format!("release savepoint {}", name)));
        self.execute().await
    }

    /// Rolls back to a savepoint.
    ///
    /// This bypasses the failure latch: it always reaches the database, and
    /// if the latched failure was a unique violation, the latch is cleared
    /// so that the transaction can continue.
    pub async fn rollback_to_savepoint(
        &mut self,
        name: &str,
    ) -> Result<(), Error> {
        self.cxn
            .exec(&Statement::new(format!(
                "rollback to savepoint {}",
                name,
            )))
            .await?;

        if matches!(self.failed, Some(DbError::UniqueViolation(..))) {
            self.failed = None;
        }

        Ok(())
    }

    /// Flushes any remaining statements and commits.
    pub async fn commit(mut self) -> Result<(), Error> {
        self.execute().await?;
        if let Some(ref e) = self.failed {
            return Err(e.clone().into());
        }

        self.cxn.exec(&Statement::new("commit")).await?;
        Ok(())
    }

    /// Discards the queue and rolls the transaction back.
    pub async fn rollback(mut self) -> Result<(), Error> {
        self.queue.clear();
        self.cxn.exec(&Statement::new("rollback")).await?;
        Ok(())
    }
}

// No Drop glue: the driver contract requires connections to roll back any
// open transaction when dropped, which covers abandonment on disconnect.

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::super::{
        driver::{Pool, Value},
        scratch::ScratchDb,
        sql,
    };
    use super::*;

    fn pool() -> (ScratchDb, Rc<Pool>) {
        let db = ScratchDb::new();
        let db2 = db.clone();
        let pool = Pool::new(2, move || Box::new(db2.connect()));
        (db, pool)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fifo_execution_and_results() {
        let (_db, pool) = pool();
        let mut txn = Transaction::begin(&pool).await.unwrap();

        let h1 = txn.enqueue(
            Statement::new(sql::INSERT_FLAG_NAME).bind("\\Seen"),
        );
        let h2 = txn.enqueue(
            Statement::new(sql::INSERT_FLAG_NAME).bind("\\Deleted"),
        );
        txn.execute().await.unwrap();

        assert_eq!(1, txn.rows(h1)[0].int(0).unwrap());
        assert_eq!(2, txn.rows(h2)[0].int(0).unwrap());
        txn.commit().await.unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failure_latches_and_discards() {
        let (_db, pool) = pool();
        let mut txn = Transaction::begin(&pool).await.unwrap();

        txn.enqueue(Statement::new(sql::INSERT_FLAG_NAME).bind("x"));
        txn.execute().await.unwrap();

        txn.enqueue(Statement::new(sql::INSERT_FLAG_NAME).bind("x"));
        let discarded =
            txn.enqueue(Statement::new(sql::INSERT_FLAG_NAME).bind("y"));
        assert_matches!(
            Err(Error::Db(DbError::UniqueViolation(..))),
            txn.execute().await,
        );

        assert!(txn.is_failed());
        // The statement behind the failure was discarded, as is any
        // enqueued afterwards.
        let late =
            txn.enqueue(Statement::new(sql::INSERT_FLAG_NAME).bind("z"));
        txn.execute().await.unwrap_or(());
        assert!(txn.rows(discarded).is_empty());
        assert!(txn.rows(late).is_empty());

        assert_matches!(
            Some(&DbError::UniqueViolation(..)),
            txn.error(),
        );
        txn.rollback().await.unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn savepoint_retry_clears_unique_violation() {
        let (db, pool) = pool();
        let mut txn = Transaction::begin(&pool).await.unwrap();

        txn.enqueue(Statement::new(sql::INSERT_FLAG_NAME).bind("taken"));
        txn.execute().await.unwrap();

        txn.savepoint("sp").await.unwrap();
        txn.enqueue(Statement::new(sql::INSERT_FLAG_NAME).bind("taken"));
        assert!(txn.execute().await.is_err());
        assert!(txn.is_failed());

        txn.rollback_to_savepoint("sp").await.unwrap();
        assert!(!txn.is_failed());

        let reselect =
            txn.enqueue(Statement::new(sql::SELECT_FLAG_ID).bind("taken"));
        txn.execute().await.unwrap();
        assert_eq!(1, txn.rows(reselect)[0].int(0).unwrap());

        txn.commit().await.unwrap();
        db.with_tables(|t| {
            assert_eq!(
                1,
                t.rows("flag_names")
                    .iter()
                    .filter(|r| Value::Text("taken".to_owned()) == r[1])
                    .count(),
            );
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rollback_discards_all_changes() {
        let (db, pool) = pool();
        let mut txn = Transaction::begin(&pool).await.unwrap();
        txn.enqueue(Statement::new(sql::INSERT_FLAG_NAME).bind("gone"));
        txn.execute().await.unwrap();
        txn.rollback().await.unwrap();

        db.with_tables(|t| {
            assert!(t.rows("flag_names").is_empty());
        });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dropping_rolls_back() {
        let (db, pool) = pool();
        {
            let mut txn = Transaction::begin(&pool).await.unwrap();
            txn.enqueue(Statement::new(sql::INSERT_FLAG_NAME).bind("gone"));
            txn.execute().await.unwrap();
            // Dropped without commit.
        }

        db.with_tables(|t| {
            assert!(t.rows("flag_names").is_empty());
        });
    }
}
