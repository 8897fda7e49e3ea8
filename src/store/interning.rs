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

//! The intern caches: header-field names, flag names, annotation names,
//! and addresses, each mapped to a stable id assigned once and never
//! changed.
//!
//! Resolution runs inside the caller's transaction. The insert race
//! between concurrent injectors is settled the database's way: SAVEPOINT,
//! INSERT, and on unique violation ROLLBACK TO SAVEPOINT followed by
//! re-SELECT, repeated until every key has an id.
//!
//! The shared caches live for the process lifetime, but an id must not
//! become visible in them until the transaction that inserted it has
//! committed; a rolled-back insert never existed. `InternScope` holds the
//! per-transaction assignments and `absorb()` publishes them on commit.

use std::cell::RefCell;
use std::collections::HashMap;

use super::message::Address;
use super::model::{AddressId, AnnotationNameId, FieldId, FlagId, Flag};
use crate::db::driver::Statement;
use crate::db::sql;
use crate::db::transaction::Transaction;
use crate::support::error::Error;

const MAX_RESOLVE_ATTEMPTS: u32 = 10;

/// The process-lifetime caches. Owned by the `Runtime`.
#[derive(Default)]
pub struct Interns {
    fields: RefCell<HashMap<String, u32>>,
    flags: RefCell<HashMap<String, u32>>,
    annotations: RefCell<HashMap<String, u32>>,
    addresses: RefCell<HashMap<String, i64>>,
}

impl Interns {
    pub fn new() -> Self {
        Interns::default()
    }
}

/// One transaction's view of the caches.
pub struct InternScope<'a> {
    shared: &'a Interns,
    fields: HashMap<String, u32>,
    flags: HashMap<String, u32>,
    annotations: HashMap<String, u32>,
    addresses: HashMap<String, i64>,
    savepoints: u32,
}

impl<'a> InternScope<'a> {
    pub fn new(shared: &'a Interns) -> Self {
        InternScope {
            shared,
            fields: HashMap::new(),
            flags: HashMap::new(),
            annotations: HashMap::new(),
            addresses: HashMap::new(),
            savepoints: 0,
        }
    }

    pub async fn field_id(
        &mut self,
        txn: &mut Transaction,
        name: &str,
    ) -> Result<FieldId, Error> {
        if let Some(&id) = self
            .shared
            .fields
            .borrow()
            .get(name)
            .or_else(|| self.fields.get(name))
        {
            return Ok(FieldId(id));
        }

        let savepoint = self.next_savepoint();
        let id = resolve(
            txn,
            &savepoint,
            || Statement::new(sql::SELECT_FIELD_ID).bind(name),
            || Statement::new(sql::INSERT_FIELD_NAME).bind(name),
        )
        .await? as u32;
        self.fields.insert(name.to_owned(), id);
        Ok(FieldId(id))
    }

    pub async fn flag_id(
        &mut self,
        txn: &mut Transaction,
        flag: &Flag,
    ) -> Result<FlagId, Error> {
        let name = flag.to_string();
        if let Some(&id) = self
            .shared
            .flags
            .borrow()
            .get(&name)
            .or_else(|| self.flags.get(&name))
        {
            return Ok(FlagId(id));
        }

        let savepoint = self.next_savepoint();
        let id = resolve(
            txn,
            &savepoint,
            || Statement::new(sql::SELECT_FLAG_ID).bind(name.as_str()),
            || Statement::new(sql::INSERT_FLAG_NAME).bind(name.as_str()),
        )
        .await? as u32;
        self.flags.insert(name, id);
        Ok(FlagId(id))
    }

    pub async fn annotation_id(
        &mut self,
        txn: &mut Transaction,
        name: &str,
    ) -> Result<AnnotationNameId, Error> {
        if let Some(&id) = self
            .shared
            .annotations
            .borrow()
            .get(name)
            .or_else(|| self.annotations.get(name))
        {
            return Ok(AnnotationNameId(id));
        }

        let savepoint = self.next_savepoint();
        let id = resolve(
            txn,
            &savepoint,
            || Statement::new(sql::SELECT_ANNOTATION_ID).bind(name),
            || Statement::new(sql::INSERT_ANNOTATION_NAME).bind(name),
        )
        .await? as u32;
        self.annotations.insert(name.to_owned(), id);
        Ok(AnnotationNameId(id))
    }

    pub async fn address_id(
        &mut self,
        txn: &mut Transaction,
        address: &Address,
    ) -> Result<AddressId, Error> {
        let key = address.cache_key();
        if let Some(&id) = self
            .shared
            .addresses
            .borrow()
            .get(&key)
            .or_else(|| self.addresses.get(&key))
        {
            return Ok(AddressId(id));
        }

        let name = address.name.clone().unwrap_or_default();
        let savepoint = self.next_savepoint();
        let id = resolve(
            txn,
            &savepoint,
            || {
                Statement::new(sql::SELECT_ADDRESS_ID)
                    .bind(name.as_str())
                    .bind(address.localpart.as_str())
                    .bind(address.domain.as_str())
            },
            || {
                Statement::new(sql::INSERT_ADDRESS)
                    .bind(name.as_str())
                    .bind(address.localpart.as_str())
                    .bind(address.domain.as_str())
            },
        )
        .await?;
        self.addresses.insert(key, id);
        Ok(AddressId(id))
    }

    /// Publishes this transaction's assignments into the shared caches.
    /// Call only after the transaction has committed.
    pub fn absorb(self) {
        self.shared.fields.borrow_mut().extend(self.fields);
        self.shared.flags.borrow_mut().extend(self.flags);
        self.shared
            .annotations
            .borrow_mut()
            .extend(self.annotations);
        self.shared.addresses.borrow_mut().extend(self.addresses);
    }

    fn next_savepoint(&mut self) -> String {
        self.savepoints += 1;
        format!("intern_{}", self.savepoints)
    }
}

/// The savepoint/insert/re-select loop shared by all four caches (and by
/// the injector's bodypart deduplication, which races the same way).
pub(crate) async fn resolve(
    txn: &mut Transaction,
    savepoint: &str,
    select: impl Fn() -> Statement,
    insert: impl Fn() -> Statement,
) -> Result<i64, Error> {
    // Someone else may have inserted the key long ago; cheapest to look
    // before trying to insert.
    let preexisting = txn.enqueue(select());
    txn.execute().await?;
    if let Some(row) = txn.rows(preexisting).first() {
        return Ok(row.int(0)?);
    }

    for _ in 0..MAX_RESOLVE_ATTEMPTS {
        txn.savepoint(savepoint).await?;
        let inserted = txn.enqueue(insert());
        match txn.execute().await {
            Ok(()) => {
                let id = txn
                    .rows(inserted)
                    .first()
                    .ok_or(Error::GaveUpInterning)?
                    .int(0)?;
                txn.release_savepoint(savepoint).await?;
                return Ok(id);
            },
            Err(ref e) if e.is_unique_violation() => {
                txn.rollback_to_savepoint(savepoint).await?;
                let reselect = txn.enqueue(select());
                txn.execute().await?;
                if let Some(row) = txn.rows(reselect).first() {
                    return Ok(row.int(0)?);
                }
                // The competing insert must have rolled back; try again.
            },
            Err(e) => return Err(e),
        }
    }

    Err(Error::GaveUpInterning)
}

impl Error {
    fn is_unique_violation(&self) -> bool {
        matches!(
            *self,
            Error::Db(crate::db::driver::DbError::UniqueViolation(..)),
        )
    }
}
