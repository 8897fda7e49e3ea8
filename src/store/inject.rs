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

//! The message injector.
//!
//! An injection delivers one or more parsed messages, each into a
//! non-empty set of mailboxes (plus, optionally, an outbound delivery
//! record), atomically: one transaction covers every row of every message
//! in every target mailbox, and either all of it commits or none of it.
//!
//! The work is an explicit state machine driven by `advance()`. The states
//! run in a fixed order; a failure in any of them routes to
//! `AwaitingCompletion` with the transaction rolled back:
//!
//! ```text
//! Inactive -> CreatingFlags -> CreatingAnnotationNames
//!          -> InsertingBodyparts -> SelectingUids -> CreatingFields
//!          -> InsertingAddresses -> InsertingMessages
//!          -> LinkingAnnotations -> AwaitingCompletion -> Done
//! ```
//!
//! The two load-bearing pieces:
//!
//! * Bodyparts are content-addressed by hex(md5(canonical bytes)). Each
//!   distinct hash is inserted under a savepoint; a unique violation means
//!   a concurrent injector (or history) got there first, and the id is
//!   re-selected instead.
//!
//! * UIDs and modseqs are allocated under `SELECT ... FOR UPDATE` on the
//!   mailbox rows, taken in ascending mailbox-id order. Every concurrent
//!   injector locks in that same order, so deadlock cannot occur. Messages
//!   injected together into one mailbox get consecutive UIDs and share one
//!   modseq.

use std::collections::BTreeMap;

use chrono::prelude::*;
use log::{debug, warn};

use super::interning::{resolve, InternScope};
use super::message::{Address, FlatMessage, Message};
use super::model::*;
use crate::db::copy::CopyEncoder;
use crate::db::driver::{Statement, Value};
use crate::db::sql;
use crate::db::transaction::Transaction;
use crate::runtime::Runtime;
use crate::support::error::Error;
use crate::support::logging;

/// How long a delivery record stays alive for the relay queue to pick up.
const DELIVERY_TTL_DAYS: i64 = 7;

/// One mailbox a message is delivered into, with per-link metadata.
#[derive(Clone, Debug, Default)]
pub struct MailboxTarget {
    pub mailbox: MailboxId,
    pub flags: Vec<Flag>,
    pub annotations: Vec<Annotation>,
}

#[derive(Clone, Debug)]
pub struct Annotation {
    pub name: String,
    pub value: String,
    /// Owning user id, or `None` for a shared annotation.
    pub owner: Option<i64>,
}

/// A request to also record the message for outbound relay.
#[derive(Clone, Debug)]
pub struct DeliverySpec {
    pub sender: Address,
    pub recipients: Vec<Address>,
}

/// One message to inject.
pub struct Injection {
    pub message: Message,
    /// Caller-supplied internal date; derived from the message (Received,
    /// then Date, then now) when absent.
    pub internal_date: Option<DateTime<Utc>>,
    pub targets: Vec<MailboxTarget>,
    pub delivery: Option<DeliverySpec>,
}

/// Where one message landed in one mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub mailbox: MailboxId,
    pub uid: Uid,
    pub modseq: Modseq,
}

#[derive(Clone, Debug)]
pub struct InjectedMessage {
    pub message: MessageId,
    pub internal_date: DateTime<Utc>,
    pub placements: Vec<Placement>,
    pub delivery: Option<DeliveryId>,
}

#[derive(Clone, Debug, Default)]
pub struct InjectReport {
    pub messages: Vec<InjectedMessage>,
}

/// Injects `injections` atomically, returning the assigned ids.
pub async fn inject(
    runtime: &Runtime,
    injections: Vec<Injection>,
) -> Result<InjectReport, Error> {
    Injector::start(runtime, injections)?.run().await
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Inactive,
    CreatingFlags,
    CreatingAnnotationNames,
    InsertingBodyparts,
    SelectingUids,
    CreatingFields,
    InsertingAddresses,
    InsertingMessages,
    LinkingAnnotations,
    AwaitingCompletion,
    Done,
}

/// Per-mailbox allocation state from `SelectingUids`.
#[derive(Clone, Debug)]
struct Allocation {
    next_uid: u32,
    modseq: Modseq,
    /// Whether a session is attached. When none is, the update also
    /// advances first_recent.
    watched: bool,
}

struct Injector<'r> {
    runtime: &'r Runtime,
    injections: Vec<Injection>,
    state: State,
    txn: Option<Transaction>,
    scope: Option<InternScope<'r>>,
    savepoints: u32,

    flats: Vec<FlatMessage>,
    idates: Vec<DateTime<Utc>>,
    /// flag ids per (injection, target), parallel to `targets[].flags`.
    flag_ids: Vec<Vec<Vec<FlagId>>>,
    /// annotation name ids per (injection, target).
    annotation_ids: Vec<Vec<Vec<AnnotationNameId>>>,
    /// bodypart ids per message, parallel to `flats[].bodyparts`.
    bodypart_ids: Vec<Vec<BodypartId>>,
    /// field ids per message, parallel to `flats[].fields`.
    field_ids: Vec<Vec<FieldId>>,
    /// field ids per message, parallel to `flats[].addresses`.
    address_field_ids: Vec<Vec<FieldId>>,
    /// address ids per message, parallel to `flats[].addresses`.
    address_ids: Vec<Vec<AddressId>>,
    /// delivery sender/recipient address ids per injection.
    delivery_address_ids: Vec<Option<(AddressId, Vec<AddressId>)>>,
    /// allocations keyed by mailbox id; BTreeMap so iteration follows the
    /// lock order.
    allocations: BTreeMap<i64, Allocation>,
    /// uids per (injection, target).
    uids: Vec<Vec<Uid>>,
    message_ids: Vec<MessageId>,
    delivery_ids: Vec<Option<DeliveryId>>,
}

impl<'r> Injector<'r> {
    fn start(
        runtime: &'r Runtime,
        injections: Vec<Injection>,
    ) -> Result<Self, Error> {
        if injections.is_empty()
            || injections.iter().any(|i| i.targets.is_empty())
        {
            return Err(Error::NoInjectionTargets);
        }

        Ok(Injector {
            runtime,
            injections,
            state: State::Inactive,
            txn: None,
            scope: None,
            savepoints: 0,
            flats: Vec::new(),
            idates: Vec::new(),
            flag_ids: Vec::new(),
            annotation_ids: Vec::new(),
            bodypart_ids: Vec::new(),
            field_ids: Vec::new(),
            address_field_ids: Vec::new(),
            address_ids: Vec::new(),
            delivery_address_ids: Vec::new(),
            allocations: BTreeMap::new(),
            uids: Vec::new(),
            message_ids: Vec::new(),
            delivery_ids: Vec::new(),
        })
    }

    async fn run(mut self) -> Result<InjectReport, Error> {
        let outcome = self.drive().await;

        match outcome {
            Ok(()) => {
                self.txn
                    .take()
                    .expect("transaction gone before completion")
                    .commit()
                    .await?;
                self.state = State::Done;
                self.scope.take().expect("intern scope gone").absorb();
                Ok(self.complete())
            },
            Err(e) => {
                self.state = State::AwaitingCompletion;
                if let Some(txn) = self.txn.take() {
                    // The error being reported is the interesting one; a
                    // rollback failure on top of it is just noise.
                    let _ = txn.rollback().await;
                }
                self.state = State::Done;
                Err(e)
            },
        }
    }

    async fn drive(&mut self) -> Result<(), Error> {
        while State::AwaitingCompletion != self.state {
            self.advance().await?;
        }
        Ok(())
    }

    async fn advance(&mut self) -> Result<(), Error> {
        self.state = match self.state {
            State::Inactive => {
                self.flats = self
                    .injections
                    .iter()
                    .map(|i| i.message.flatten())
                    .collect();
                self.idates = self
                    .injections
                    .iter()
                    .map(|i| {
                        i.internal_date.unwrap_or_else(|| {
                            super::message::derive_internal_date(
                                &i.message.top.header,
                            )
                            .map(|d| d.with_timezone(&Utc))
                            .unwrap_or_else(Utc::now)
                        })
                    })
                    .collect();

                self.txn =
                    Some(Transaction::begin(&self.runtime.pool).await?);
                self.scope =
                    Some(InternScope::new(&self.runtime.interns));
                State::CreatingFlags
            },

            State::CreatingFlags => {
                self.create_flags().await?;
                State::CreatingAnnotationNames
            },

            State::CreatingAnnotationNames => {
                self.create_annotation_names().await?;
                State::InsertingBodyparts
            },

            State::InsertingBodyparts => {
                self.insert_bodyparts().await?;
                State::SelectingUids
            },

            State::SelectingUids => {
                self.select_uids().await?;
                State::CreatingFields
            },

            State::CreatingFields => {
                self.create_fields().await?;
                State::InsertingAddresses
            },

            State::InsertingAddresses => {
                self.insert_addresses().await?;
                State::InsertingMessages
            },

            State::InsertingMessages => {
                self.insert_messages().await?;
                State::LinkingAnnotations
            },

            State::LinkingAnnotations => {
                self.link_annotations().await?;
                State::AwaitingCompletion
            },

            State::AwaitingCompletion | State::Done => {
                unreachable!("advance past completion")
            },
        };

        Ok(())
    }

    async fn create_flags(&mut self) -> Result<(), Error> {
        let txn = self.txn.as_mut().unwrap();
        let scope = self.scope.as_mut().unwrap();

        for injection in &self.injections {
            let mut per_target = Vec::with_capacity(injection.targets.len());
            for target in &injection.targets {
                let mut ids = Vec::with_capacity(target.flags.len());
                for flag in &target.flags {
                    ids.push(scope.flag_id(txn, flag).await?);
                }
                per_target.push(ids);
            }
            self.flag_ids.push(per_target);
        }

        Ok(())
    }

    async fn create_annotation_names(&mut self) -> Result<(), Error> {
        let txn = self.txn.as_mut().unwrap();
        let scope = self.scope.as_mut().unwrap();

        for injection in &self.injections {
            let mut per_target = Vec::with_capacity(injection.targets.len());
            for target in &injection.targets {
                let mut ids = Vec::with_capacity(target.annotations.len());
                for annotation in &target.annotations {
                    ids.push(
                        scope.annotation_id(txn, &annotation.name).await?,
                    );
                }
                per_target.push(ids);
            }
            self.annotation_ids.push(per_target);
        }

        Ok(())
    }

    async fn insert_bodyparts(&mut self) -> Result<(), Error> {
        let txn = self.txn.as_mut().unwrap();
        let mut by_hash = BTreeMap::<String, i64>::new();

        for flat in &self.flats {
            let mut ids = Vec::with_capacity(flat.bodyparts.len());
            for content in &flat.bodyparts {
                if let Some(&id) = by_hash.get(&content.hash) {
                    ids.push(BodypartId(id));
                    continue;
                }

                self.savepoints += 1;
                let savepoint = format!("bodypart_{}", self.savepoints);
                let id = resolve(
                    txn,
                    &savepoint,
                    || {
                        Statement::new(sql::SELECT_BODYPART_BY_HASH)
                            .bind(content.hash.as_str())
                    },
                    || {
                        Statement::new(sql::INSERT_BODYPART)
                            .bind(content.hash.as_str())
                            .bind(content.bytes)
                            .bind(content.lines)
                            .bind(content.text.clone())
                            .bind(content.data.clone())
                    },
                )
                .await?;

                by_hash.insert(content.hash.clone(), id);
                ids.push(BodypartId(id));
            }
            self.bodypart_ids.push(ids);
        }

        Ok(())
    }

    async fn select_uids(&mut self) -> Result<(), Error> {
        let txn = self.txn.as_mut().unwrap();

        // Count how many messages land in each mailbox. BTreeMap iteration
        // gives ascending id order, which is the global lock order.
        let mut counts = BTreeMap::<i64, u32>::new();
        for injection in &self.injections {
            for target in &injection.targets {
                *counts.entry(target.mailbox.0).or_insert(0) += 1;
            }
        }

        for (&mailbox, &n) in &counts {
            let locked = txn
                .enqueue(Statement::new(sql::LOCK_MAILBOX).bind(mailbox));
            txn.execute().await?;

            let row = txn
                .rows(locked)
                .first()
                .cloned()
                .ok_or(Error::NxMailbox)?;
            let uidnext = row.int(0)? as u32;
            let nextmodseq = Modseq(row.int(1)? as u64);

            let last = uidnext as u64 + n as u64 - 1;
            if last > Uid::REFUSE_ABOVE as u64 {
                logging::disaster(&format!(
                    "mailbox {} is out of UIDs (uidnext {}); \
                     injections refused until it is repaired",
                    mailbox, uidnext,
                ));
                return Err(Error::OutOfUids);
            }
            if last > Uid::WARN_ABOVE as u64 {
                warn!(
                    "mailbox {} is running out of UIDs (uidnext {})",
                    mailbox, uidnext,
                );
            }

            let watched = self
                .runtime
                .registry
                .has_watchers(MailboxId(mailbox));
            if watched {
                txn.enqueue(
                    Statement::new(sql::BUMP_MAILBOX)
                        .bind(n)
                        .bind(mailbox),
                );
            } else {
                // The first_recent variant applies when and only when no
                // session is attached to the mailbox.
                txn.enqueue(
                    Statement::new(sql::BUMP_MAILBOX_RECENT)
                        .bind(n)
                        .bind(n)
                        .bind(mailbox),
                );
            }
            txn.execute().await?;

            self.allocations.insert(
                mailbox,
                Allocation {
                    next_uid: uidnext,
                    modseq: nextmodseq,
                    watched,
                },
            );
        }

        // Hand out consecutive UIDs in injection order.
        for injection in &self.injections {
            let mut per_target = Vec::with_capacity(injection.targets.len());
            for target in &injection.targets {
                let allocation = self
                    .allocations
                    .get_mut(&target.mailbox.0)
                    .expect("allocation missing for counted mailbox");
                let uid = Uid::of(allocation.next_uid)
                    .expect("allocated uid 0");
                allocation.next_uid += 1;
                per_target.push(uid);
            }
            self.uids.push(per_target);
        }

        Ok(())
    }

    async fn create_fields(&mut self) -> Result<(), Error> {
        let txn = self.txn.as_mut().unwrap();
        let scope = self.scope.as_mut().unwrap();

        for flat in &self.flats {
            let mut field_ids = Vec::with_capacity(flat.fields.len());
            for row in &flat.fields {
                field_ids.push(scope.field_id(txn, &row.name).await?);
            }
            self.field_ids.push(field_ids);

            let mut address_field_ids =
                Vec::with_capacity(flat.addresses.len());
            for row in &flat.addresses {
                address_field_ids
                    .push(scope.field_id(txn, &row.name).await?);
            }
            self.address_field_ids.push(address_field_ids);
        }

        Ok(())
    }

    async fn insert_addresses(&mut self) -> Result<(), Error> {
        let txn = self.txn.as_mut().unwrap();
        let scope = self.scope.as_mut().unwrap();

        for flat in &self.flats {
            let mut ids = Vec::with_capacity(flat.addresses.len());
            for row in &flat.addresses {
                ids.push(scope.address_id(txn, &row.address).await?);
            }
            self.address_ids.push(ids);
        }

        for injection in &self.injections {
            let resolved = match injection.delivery {
                Some(ref delivery) => {
                    let sender =
                        scope.address_id(txn, &delivery.sender).await?;
                    let mut recipients =
                        Vec::with_capacity(delivery.recipients.len());
                    for recipient in &delivery.recipients {
                        recipients
                            .push(scope.address_id(txn, recipient).await?);
                    }
                    Some((sender, recipients))
                },
                None => None,
            };
            self.delivery_address_ids.push(resolved);
        }

        Ok(())
    }

    async fn insert_messages(&mut self) -> Result<(), Error> {
        let txn = self.txn.as_mut().unwrap();

        // One messages row per injected message.
        let mut handles = Vec::with_capacity(self.injections.len());
        for injection in &self.injections {
            handles.push(txn.enqueue(
                Statement::new(sql::INSERT_MESSAGE)
                    .bind(injection.message.rfc822_size),
            ));
        }
        txn.execute().await?;

        for handle in handles {
            let id = txn
                .rows(handle)
                .first()
                .ok_or_else(|| {
                    Error::Db(crate::db::driver::DbError::Syntax(
                        "message insert returned no id".to_owned(),
                    ))
                })?
                .int(0)?;
            self.message_ids.push(MessageId(id));
        }

        // Everything that links the messages into mailboxes is bulk work.
        let mut mailbox_messages = CopyEncoder::new(
            "mailbox_messages",
            &["mailbox", "uid", "message", "idate", "modseq"],
        );
        let mut part_numbers = CopyEncoder::new(
            "part_numbers",
            &["message", "part", "bodypart", "bytes", "lines"],
        );
        let mut header_fields = CopyEncoder::new(
            "header_fields",
            &["message", "part", "position", "field", "value"],
        );
        let mut address_fields = CopyEncoder::new(
            "address_fields",
            &["message", "part", "position", "field", "number", "address"],
        );
        let mut flags =
            CopyEncoder::new("flags", &["mailbox", "uid", "flag"]);
        let mut modsequences = CopyEncoder::new(
            "modsequences",
            &["mailbox", "uid", "modseq"],
        );

        for (ix, injection) in self.injections.iter().enumerate() {
            let message = self.message_ids[ix].0;
            let flat = &self.flats[ix];
            let idate = self.idates[ix];

            for row in &flat.parts {
                part_numbers.row(&[
                    Value::Int(message),
                    Value::Text(row.part.clone()),
                    row.bodypart
                        .map(|b| Value::Int(self.bodypart_ids[ix][b].0))
                        .unwrap_or(Value::Null),
                    Value::Int(row.bytes.into()),
                    Value::Int(row.lines.into()),
                ]);
            }

            for (fx, row) in flat.fields.iter().enumerate() {
                header_fields.row(&[
                    Value::Int(message),
                    Value::Text(row.part.clone()),
                    Value::Int(row.position.into()),
                    Value::Int(self.field_ids[ix][fx].0.into()),
                    Value::Text(row.value.clone()),
                ]);
            }

            for (ax, row) in flat.addresses.iter().enumerate() {
                address_fields.row(&[
                    Value::Int(message),
                    Value::Text(row.part.clone()),
                    Value::Int(row.position.into()),
                    Value::Int(self.address_field_ids[ix][ax].0.into()),
                    Value::Int(row.number.into()),
                    Value::Int(self.address_ids[ix][ax].0),
                ]);
            }

            for (tx, target) in injection.targets.iter().enumerate() {
                let uid = self.uids[ix][tx];
                let modseq = self.allocations[&target.mailbox.0].modseq;

                mailbox_messages.row(&[
                    Value::Int(target.mailbox.0),
                    Value::Int(u32::from(uid).into()),
                    Value::Int(message),
                    Value::Timestamp(idate),
                    Value::Int(modseq.0 as i64),
                ]);
                modsequences.row(&[
                    Value::Int(target.mailbox.0),
                    Value::Int(u32::from(uid).into()),
                    Value::Int(modseq.0 as i64),
                ]);

                for flag in &self.flag_ids[ix][tx] {
                    flags.row(&[
                        Value::Int(target.mailbox.0),
                        Value::Int(u32::from(uid).into()),
                        Value::Int(flag.0.into()),
                    ]);
                }
            }
        }

        txn.enqueue_copy(mailbox_messages.finish());
        txn.enqueue_copy(part_numbers.finish());
        if !header_fields.is_empty() {
            txn.enqueue_copy(header_fields.finish());
        }
        if !address_fields.is_empty() {
            txn.enqueue_copy(address_fields.finish());
        }
        if !flags.is_empty() {
            txn.enqueue_copy(flags.finish());
        }
        txn.enqueue_copy(modsequences.finish());
        txn.execute().await?;

        // Delivery records are per message, not bulk.
        let now = Utc::now();
        let expires = now
            + chrono::Duration::try_days(DELIVERY_TTL_DAYS)
                .expect("constant TTL in range");
        for ix in 0..self.injections.len() {
            let Some((sender, ref recipients)) =
                self.delivery_address_ids[ix]
            else {
                self.delivery_ids.push(None);
                continue;
            };

            let handle = txn.enqueue(
                Statement::new(sql::INSERT_DELIVERY)
                    .bind(sender.0)
                    .bind(self.message_ids[ix].0)
                    .bind(now)
                    .bind(expires),
            );
            txn.execute().await?;
            let delivery = txn
                .rows(handle)
                .first()
                .ok_or_else(|| {
                    Error::Db(crate::db::driver::DbError::Syntax(
                        "delivery insert returned no id".to_owned(),
                    ))
                })?
                .int(0)?;

            for recipient in recipients {
                txn.enqueue(
                    Statement::new(sql::INSERT_DELIVERY_RECIPIENT)
                        .bind(delivery)
                        .bind(recipient.0),
                );
            }
            txn.execute().await?;
            self.delivery_ids.push(Some(DeliveryId(delivery)));
        }

        Ok(())
    }

    async fn link_annotations(&mut self) -> Result<(), Error> {
        let txn = self.txn.as_mut().unwrap();

        let mut annotations = CopyEncoder::new(
            "annotations",
            &["mailbox", "uid", "name", "value", "owner"],
        );
        for (ix, injection) in self.injections.iter().enumerate() {
            for (tx, target) in injection.targets.iter().enumerate() {
                let uid = self.uids[ix][tx];
                for (ax, annotation) in
                    target.annotations.iter().enumerate()
                {
                    annotations.row(&[
                        Value::Int(target.mailbox.0),
                        Value::Int(u32::from(uid).into()),
                        Value::Int(self.annotation_ids[ix][tx][ax].0.into()),
                        Value::Text(annotation.value.clone()),
                        annotation
                            .owner
                            .map(Value::Int)
                            .unwrap_or(Value::Null),
                    ]);
                }
            }
        }

        if !annotations.is_empty() {
            txn.enqueue_copy(annotations.finish());
            txn.execute().await?;
        }

        Ok(())
    }

    /// Post-commit bookkeeping: registry counters, session notification,
    /// cluster publication.
    fn complete(&mut self) -> InjectReport {
        let registry = &self.runtime.registry;

        for (&mailbox, allocation) in &self.allocations {
            let id = MailboxId(mailbox);
            let uidnext = allocation.next_uid;
            let nextmodseq = allocation.modseq.next();

            registry.set_uidnext_and_nextmodseq(id, uidnext, nextmodseq);
            if !allocation.watched {
                registry.set_first_recent(id, uidnext);
            }

            if let Some(info) = registry.find(id) {
                self.runtime.cluster.publish_counters(
                    &info.name,
                    uidnext,
                    nextmodseq,
                );
            }
        }

        let mut report = InjectReport::default();
        for (ix, injection) in self.injections.iter().enumerate() {
            let mut placements =
                Vec::with_capacity(injection.targets.len());
            for (tx, target) in injection.targets.iter().enumerate() {
                let uid = self.uids[ix][tx];
                let modseq = self.allocations[&target.mailbox.0].modseq;
                registry.notify_message_added(target.mailbox, uid, modseq);
                placements.push(Placement {
                    mailbox: target.mailbox,
                    uid,
                    modseq,
                });
            }

            if let Some(delivery) = self.delivery_ids[ix] {
                debug!(
                    "message {} queued for relay as delivery {}",
                    self.message_ids[ix].0, delivery.0,
                );
            }

            report.messages.push(InjectedMessage {
                message: self.message_ids[ix],
                internal_date: self.idates[ix],
                placements,
                delivery: self.delivery_ids[ix],
            });
        }

        report
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::*;
    use crate::db::driver::Value;
    use crate::runtime::test_support::runtime_with_mailboxes;
    use crate::store::message::testdata::{MULTIPART, SIMPLE};
    use crate::store::registry::Watcher;

    fn target(mailbox: MailboxId) -> MailboxTarget {
        MailboxTarget {
            mailbox,
            flags: Vec::new(),
            annotations: Vec::new(),
        }
    }

    fn injection(raw: &[u8], targets: Vec<MailboxTarget>) -> Injection {
        Injection {
            message: Message::parse(raw).unwrap(),
            internal_date: None,
            targets,
            delivery: None,
        }
    }

    fn mailbox_id(
        runtime: &Runtime,
        name: &str,
    ) -> MailboxId {
        runtime.registry.find_by_name(name).unwrap().id
    }

    #[tokio::test(flavor = "current_thread")]
    async fn single_message_single_mailbox() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (runtime, db) =
                    runtime_with_mailboxes(&["Archive"]).await;
                let inbox = mailbox_id(&runtime, "INBOX");

                let report = inject(
                    &runtime,
                    vec![injection(SIMPLE, vec![target(inbox)])],
                )
                .await
                .unwrap();

                assert_eq!(1, report.messages.len());
                let placement = &report.messages[0].placements[0];
                assert_eq!(Uid::u(1), placement.uid);
                assert_eq!(Modseq(1), placement.modseq);

                // The internal date came from the Received line.
                assert_eq!(
                    Utc.with_ymd_and_hms(2024, 7, 8, 10, 0, 0).unwrap(),
                    report.messages[0].internal_date,
                );

                // Counters moved in the database and the registry.
                let info = runtime.registry.find(inbox).unwrap();
                assert_eq!(2, info.uidnext);
                assert_eq!(Modseq(2), info.nextmodseq);
                db.with_tables(|t| {
                    let mailboxes = t.rows("mailboxes");
                    let row = mailboxes
                        .iter()
                        .find(|r| Value::Int(inbox.0) == r[0])
                        .unwrap();
                    assert_eq!(Value::Int(2), row[2]);
                    assert_eq!(Value::Int(2), row[3]);
                    // No session attached, so first_recent advances with
                    // uidnext.
                    assert_eq!(Value::Int(2), row[4]);

                    assert_eq!(1, t.rows("messages").len());
                    assert_eq!(1, t.rows("mailbox_messages").len());
                    assert_eq!(1, t.rows("modsequences").len());
                    // "" anchor plus collapsed part 1.
                    assert_eq!(2, t.rows("part_numbers").len());
                    // Received, Date, Subject.
                    assert_eq!(3, t.rows("header_fields").len());
                    // From x1, To x2.
                    assert_eq!(3, t.rows("address_fields").len());
                });
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn bodyparts_deduplicate_across_injections() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (runtime, db) =
                    runtime_with_mailboxes(&["X", "Y"]).await;
                let x = mailbox_id(&runtime, "X");
                let y = mailbox_id(&runtime, "Y");

                inject(&runtime, vec![injection(SIMPLE, vec![target(x)])])
                    .await
                    .unwrap();
                inject(&runtime, vec![injection(SIMPLE, vec![target(y)])])
                    .await
                    .unwrap();

                db.with_tables(|t| {
                    // Two distinct messages rows, one shared bodypart.
                    assert_eq!(2, t.rows("messages").len());
                    assert_eq!(1, t.rows("bodyparts").len());

                    let linked: Vec<Value> = t
                        .rows("part_numbers")
                        .iter()
                        .filter(|r| Value::Null != r[2])
                        .map(|r| r[2].clone())
                        .collect();
                    assert_eq!(2, linked.len());
                    assert_eq!(linked[0], linked[1]);
                });
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn multi_mailbox_injection_is_atomic_and_ordered() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (runtime, db) =
                    runtime_with_mailboxes(&["Archive"]).await;
                let inbox = mailbox_id(&runtime, "INBOX");
                let archive = mailbox_id(&runtime, "Archive");

                let report = inject(
                    &runtime,
                    vec![injection(
                        MULTIPART,
                        vec![target(inbox), target(archive)],
                    )],
                )
                .await
                .unwrap();

                let placements = &report.messages[0].placements;
                assert_eq!(2, placements.len());
                assert_eq!(inbox, placements[0].mailbox);
                assert_eq!(archive, placements[1].mailbox);

                db.with_tables(|t| {
                    // One message linked twice.
                    assert_eq!(1, t.rows("messages").len());
                    assert_eq!(2, t.rows("mailbox_messages").len());
                });
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn header_order_is_preserved() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let raw = b"\
Received: one; Mon, 8 Jul 2024 10:00:00 +0000\r\n\
Received: two; Mon, 8 Jul 2024 09:00:00 +0000\r\n\
Subject: ordering\r\n\
Received: three; Mon, 8 Jul 2024 08:00:00 +0000\r\n\
\r\n\
body\r\n";
                let (runtime, db) = runtime_with_mailboxes(&[]).await;
                let inbox = mailbox_id(&runtime, "INBOX");

                inject(&runtime, vec![injection(raw, vec![target(inbox)])])
                    .await
                    .unwrap();

                db.with_tables(|t| {
                    let mut rows: Vec<(i64, String)> = t
                        .rows("header_fields")
                        .iter()
                        .map(|r| match (&r[2], &r[4]) {
                            (&Value::Int(pos), &Value::Text(ref v)) => {
                                (pos, v.clone())
                            },
                            _ => panic!("bad header_fields row"),
                        })
                        .collect();
                    rows.sort();
                    let values: Vec<&str> =
                        rows.iter().map(|(_, v)| v.as_str()).collect();
                    assert_eq!(
                        vec![
                            "one; Mon, 8 Jul 2024 10:00:00 +0000",
                            "two; Mon, 8 Jul 2024 09:00:00 +0000",
                            "ordering",
                            "three; Mon, 8 Jul 2024 08:00:00 +0000",
                        ],
                        values,
                    );
                });
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn concurrent_injectors_do_not_deadlock() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (runtime, db) =
                    runtime_with_mailboxes(&["P", "Q"]).await;
                let p = mailbox_id(&runtime, "P");
                let q = mailbox_id(&runtime, "Q");

                // Both injectors target both mailboxes; only the lock
                // ordering keeps this from deadlocking.
                let a = inject(
                    &runtime,
                    vec![injection(SIMPLE, vec![target(p), target(q)])],
                );
                let b = inject(
                    &runtime,
                    vec![injection(MULTIPART, vec![target(q), target(p)])],
                );

                let (ra, rb) = tokio::join!(a, b);
                let ra = ra.unwrap();
                let rb = rb.unwrap();

                // Disjoint (mailbox, uid) tuples, distinct modseqs.
                let mut seen = std::collections::HashSet::new();
                for placement in ra.messages[0]
                    .placements
                    .iter()
                    .chain(rb.messages[0].placements.iter())
                {
                    assert!(seen
                        .insert((placement.mailbox, placement.uid)));
                }

                let pa = ra.messages[0]
                    .placements
                    .iter()
                    .find(|pl| pl.mailbox == p)
                    .unwrap()
                    .modseq;
                let pb = rb.messages[0]
                    .placements
                    .iter()
                    .find(|pl| pl.mailbox == p)
                    .unwrap()
                    .modseq;
                assert_ne!(pa, pb);

                db.with_tables(|t| {
                    assert_eq!(4, t.rows("mailbox_messages").len());
                });
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_injection_leaves_no_rows(){
        tokio::task::LocalSet::new()
            .run_until(async {
                let (runtime, db) = runtime_with_mailboxes(&[]).await;
                let inbox = mailbox_id(&runtime, "INBOX");

                let result = inject(
                    &runtime,
                    vec![
                        injection(SIMPLE, vec![target(inbox)]),
                        injection(
                            MULTIPART,
                            vec![target(MailboxId(404))],
                        ),
                    ],
                )
                .await;
                assert_matches!(Err(Error::NxMailbox), result);

                db.with_tables(|t| {
                    assert!(t.rows("messages").is_empty());
                    assert!(t.rows("mailbox_messages").is_empty());
                    assert!(t.rows("bodyparts").is_empty());
                    assert!(t.rows("header_fields").is_empty());
                    assert!(t.rows("flags").is_empty());
                });

                // And the mailbox counters did not move.
                let info = runtime.registry.find(inbox).unwrap();
                assert_eq!(1, info.uidnext);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn flags_and_annotations_are_linked() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (runtime, db) = runtime_with_mailboxes(&[]).await;
                let inbox = mailbox_id(&runtime, "INBOX");

                let mut tgt = target(inbox);
                tgt.flags =
                    vec![Flag::Seen, Flag::Keyword("$Junk".to_owned())];
                tgt.annotations = vec![Annotation {
                    name: "/comment".to_owned(),
                    value: "via lmtp".to_owned(),
                    owner: None,
                }];

                inject(&runtime, vec![injection(SIMPLE, vec![tgt])])
                    .await
                    .unwrap();

                db.with_tables(|t| {
                    assert_eq!(2, t.rows("flags").len());
                    assert_eq!(2, t.rows("flag_names").len());
                    assert_eq!(1, t.rows("annotations").len());
                    assert_eq!(1, t.rows("annotation_names").len());
                });
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn delivery_records_are_written() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (runtime, db) = runtime_with_mailboxes(&[]).await;
                let inbox = mailbox_id(&runtime, "INBOX");

                let mut one = injection(SIMPLE, vec![target(inbox)]);
                one.delivery = Some(DeliverySpec {
                    sender: Address {
                        name: None,
                        localpart: "kingkong".to_owned(),
                        domain: "downtown.org".to_owned(),
                    },
                    recipients: vec![
                        Address {
                            name: None,
                            localpart: "joe".to_owned(),
                            domain: "sixpack.org".to_owned(),
                        },
                        Address {
                            name: None,
                            localpart: "jane".to_owned(),
                            domain: "sixpack.org".to_owned(),
                        },
                    ],
                });

                let report =
                    inject(&runtime, vec![one]).await.unwrap();
                assert!(report.messages[0].delivery.is_some());

                db.with_tables(|t| {
                    assert_eq!(1, t.rows("deliveries").len());
                    assert_eq!(2, t.rows("delivery_recipients").len());
                });
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn watched_mailboxes_keep_first_recent() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (runtime, db) = runtime_with_mailboxes(&[]).await;
                let inbox = mailbox_id(&runtime, "INBOX");

                struct NullWatcher;
                impl Watcher for NullWatcher {
                    fn message_added(
                        &self,
                        _: MailboxId,
                        _: Uid,
                        _: Modseq,
                    ) {
                    }
                    fn counters_changed(
                        &self,
                        _: MailboxId,
                        _: u32,
                        _: Modseq,
                    ) {
                    }
                }

                let watcher: Rc<dyn Watcher> = Rc::new(NullWatcher);
                runtime.registry.watch(inbox, &watcher);

                inject(
                    &runtime,
                    vec![injection(SIMPLE, vec![target(inbox)])],
                )
                .await
                .unwrap();

                db.with_tables(|t| {
                    let mailboxes = t.rows("mailboxes");
                    let row = mailboxes
                        .iter()
                        .find(|r| Value::Int(inbox.0) == r[0])
                        .unwrap();
                    // A session is attached, so uidnext moves but
                    // first_recent does not.
                    assert_eq!(Value::Int(2), row[2]);
                    assert_eq!(Value::Int(1), row[4]);
                });
            })
            .await;
    }
}
