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

//! The process runtime: the long-lived state every session and injector
//! shares.
//!
//! Nothing in here is a global. Production builds one `Runtime` in main;
//! every test builds its own isolated one, which is the entire reason this
//! struct exists instead of a pile of process-wide singletons.

use std::rc::Rc;
use std::sync::Arc;

use crate::cluster::Cluster;
use crate::db::driver::{Connection, DbError, Pool, Statement};
use crate::db::scratch::ScratchDb;
use crate::db::sql;
use crate::store::interning::Interns;
use crate::store::registry::Registry;
use crate::support::error::Error;
use crate::support::system_config::SystemConfig;

/// The identity provider seam. SASL mechanism plumbing and LDAP relay live
/// outside this crate; what comes back is an authenticated identity.
pub trait Authenticator {
    fn authenticate(&self, user: &str, password: &str)
        -> Result<String, Error>;
}

/// The scratch authenticator: accepts any user whose password equals the
/// user name. Test and dev use only.
pub struct ScratchAuthenticator;

impl Authenticator for ScratchAuthenticator {
    fn authenticate(
        &self,
        user: &str,
        password: &str,
    ) -> Result<String, Error> {
        if !user.is_empty() && user == password {
            Ok(user.to_owned())
        } else {
            Err(Error::AuthFailure)
        }
    }
}

pub struct Runtime {
    pub config: Arc<SystemConfig>,
    pub pool: Rc<Pool>,
    pub registry: Rc<Registry>,
    pub interns: Interns,
    pub cluster: Cluster,
    pub authenticator: Box<dyn Authenticator>,
}

impl Runtime {
    pub fn new(
        config: Arc<SystemConfig>,
        pool: Rc<Pool>,
        registry: Rc<Registry>,
        cluster: Cluster,
        authenticator: Box<dyn Authenticator>,
    ) -> Rc<Self> {
        Rc::new(Runtime {
            config,
            pool,
            registry,
            interns: Interns::new(),
            cluster,
            authenticator,
        })
    }

    /// Builds a runtime over a fresh scratch database seeded with an INBOX,
    /// for tests and `rowmap dev imap-test`.
    pub async fn scratch(
        config: Arc<SystemConfig>,
    ) -> Result<(Rc<Self>, ScratchDb), Error> {
        let db = ScratchDb::new();
        db.create_mailbox("INBOX", 1);

        let db2 = db.clone();
        let pool = Pool::new(config.db.db_max_handles, move || {
            Box::new(db2.connect())
        });

        let registry = Rc::new(Registry::new());
        registry.load(&pool).await?;

        let runtime = Runtime::new(
            config,
            pool,
            registry,
            Cluster::standalone(),
            Box::new(ScratchAuthenticator),
        );
        Ok((runtime, db))
    }

    /// Creates a mailbox in the database and the registry.
    ///
    /// Mailbox creation is an administrative action; this is the hook the
    /// admin tooling and the dev console drive.
    pub async fn create_mailbox(
        &self,
        name: &str,
        uidvalidity: u32,
    ) -> Result<(), Error> {
        {
            let mut cxn = self.pool.acquire().await?;
            cxn.exec(
                &Statement::new(sql::INSERT_MAILBOX)
                    .bind(name)
                    .bind(uidvalidity),
            )
            .await
            .map_err(|e| match e {
                DbError::UniqueViolation(..) => Error::MailboxExists,
                other => other.into(),
            })?;
        }

        self.registry.load(&self.pool).await
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// A scratch runtime with extra mailboxes, shared by the store and
    /// protocol tests.
    pub async fn runtime_with_mailboxes(
        extra: &[&str],
    ) -> (Rc<Runtime>, ScratchDb) {
        let config = Arc::new(SystemConfig::default());
        let (runtime, db) = Runtime::scratch(config).await.unwrap();
        for (ix, name) in extra.iter().enumerate() {
            db.create_mailbox(name, 100 + ix as u32);
        }
        runtime.registry.load(&runtime.pool).await.unwrap();
        (runtime, db)
    }
}
