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

use std::io;

use thiserror::Error;

use crate::db::driver::DbError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsafe mailbox or flag name")]
    UnsafeName,
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("Mailbox is deleted")]
    MailboxDeleted,
    #[error("Message is not a valid RFC 5322 message")]
    BadMessage,
    #[error("Injection targets no mailboxes")]
    NoInjectionTargets,
    #[error("Mailbox is out of UIDs")]
    OutOfUids,
    #[error("Authentication failed")]
    AuthFailure,
    #[error("Gave up intern lookup after too many retries")]
    GaveUpInterning,
    #[error("Database failure: {0}")]
    Db(#[from] DbError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the operation that produced this error may be retried with a
    /// fresh transaction.
    ///
    /// Serialisation failures and lock timeouts are transient by nature; the
    /// lock ordering discipline guarantees that retrying cannot deadlock.
    pub fn is_transient(&self) -> bool {
        matches!(
            *self,
            Error::Db(DbError::SerializationFailure(..))
                | Error::Db(DbError::LockTimeout(..)),
        )
    }
}
