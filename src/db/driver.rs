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

//! The seam between the store and the relational database driver.
//!
//! The driver proper (wire protocol, authentication, TLS) lives outside
//! this crate. What the store requires of it is small: prepared-statement
//! execution with positional parameters, `COPY ... FROM STDIN (BINARY)`
//! bulk loads, and transaction/savepoint control issued as ordinary
//! statements. `Connection` captures exactly that. The in-process
//! implementation used by tests and `rowmap dev imap-test` is
//! `crate::db::scratch`.

use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::prelude::*;
use thiserror::Error;

/// A database value, either bound into a statement or read from a row.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One result row.
#[derive(Clone, Debug, PartialEq)]
pub struct Row(pub Vec<Value>);

impl Row {
    pub fn int(&self, ix: usize) -> Result<i64, DbError> {
        match self.0.get(ix) {
            Some(&Value::Int(v)) => Ok(v),
            other => Err(DbError::TypeMismatch(format!(
                "column {}: expected integer, got {:?}",
                ix, other,
            ))),
        }
    }

    pub fn text(&self, ix: usize) -> Result<&str, DbError> {
        match self.0.get(ix) {
            Some(Value::Text(v)) => Ok(v),
            other => Err(DbError::TypeMismatch(format!(
                "column {}: expected text, got {:?}",
                ix, other,
            ))),
        }
    }

    pub fn bool_(&self, ix: usize) -> Result<bool, DbError> {
        match self.0.get(ix) {
            Some(&Value::Bool(v)) => Ok(v),
            other => Err(DbError::TypeMismatch(format!(
                "column {}: expected boolean, got {:?}",
                ix, other,
            ))),
        }
    }
}

/// A statement plus its positional bindings.
#[derive(Clone, Debug)]
pub struct Statement {
    pub sql: Cow<'static, str>,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<Cow<'static, str>>) -> Self {
        Statement {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Binds the next positional parameter. Parameters are bound in order;
    /// `$1` is the first `bind` call.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.sql)
    }
}

/// A `COPY table (columns...) FROM STDIN (BINARY)` payload.
#[derive(Clone, Debug)]
pub struct CopyIn {
    pub table: &'static str,
    pub columns: &'static [&'static str],
    /// The binary COPY stream, as produced by `crate::db::copy`.
    pub data: Vec<u8>,
    pub rows: u64,
}

/// Failure kinds reported by the driver.
#[derive(Error, Debug, Clone)]
pub enum DbError {
    /// An insert hit a unique constraint. Expected on the intern tables and
    /// bodyparts and handled by savepoint retry; anywhere else it is a bug.
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    /// The transaction lost a serialisation race and must be retried whole.
    #[error("serialization failure: {0}")]
    SerializationFailure(String),
    /// A row lock could not be acquired in time.
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    /// The connection to the database died mid-flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The driver did not understand the statement.
    #[error("bad statement: {0}")]
    Syntax(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

/// A single database connection.
///
/// Implementations must roll back any open transaction when dropped; the
/// store relies on this for cancellation, since a closed IMAP connection
/// simply drops its in-flight transactions.
#[async_trait(?Send)]
pub trait Connection {
    async fn exec(&mut self, stmt: &Statement) -> Result<Vec<Row>, DbError>;
    async fn copy_in(&mut self, copy: &CopyIn) -> Result<u64, DbError>;
}

/// Hands out connections, bounded by `db-max-handles`.
///
/// Each transaction holds one connection exclusively for its lifetime.
pub struct Pool {
    factory: Box<dyn Fn() -> Box<dyn Connection>>,
    handles: Arc<tokio::sync::Semaphore>,
}

impl Pool {
    pub fn new(
        max_handles: usize,
        factory: impl Fn() -> Box<dyn Connection> + 'static,
    ) -> Rc<Self> {
        Rc::new(Pool {
            factory: Box::new(factory),
            handles: Arc::new(tokio::sync::Semaphore::new(max_handles.max(1))),
        })
    }

    pub async fn acquire(&self) -> Result<PooledConnection, DbError> {
        let permit = Arc::clone(&self.handles)
            .acquire_owned()
            .await
            .map_err(|_| {
                DbError::ConnectionLost("pool is shut down".to_owned())
            })?;
        Ok(PooledConnection {
            cxn: (self.factory)(),
            _permit: permit,
        })
    }

    /// Refuses all further acquisitions; part of the drain on shutdown.
    pub fn close(&self) {
        self.handles.close();
    }
}

pub struct PooledConnection {
    cxn: Box<dyn Connection>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &*self.cxn
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.cxn
    }
}
