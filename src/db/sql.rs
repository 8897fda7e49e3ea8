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

//! Every statement the store sends to the database, in one place.
//!
//! Keeping the text here means the scratch driver can recognise statements
//! by identity instead of growing a SQL parser, and a future native driver
//! can prepare them all at startup.

// ==================== intern tables ====================

pub const SELECT_FIELD_ID: &str = "select id from field_names where name=$1";
pub const INSERT_FIELD_NAME: &str =
    "insert into field_names (name) values ($1) returning id";

pub const SELECT_FLAG_ID: &str = "select id from flag_names where name=$1";
pub const INSERT_FLAG_NAME: &str =
    "insert into flag_names (name) values ($1) returning id";

pub const SELECT_ANNOTATION_ID: &str =
    "select id from annotation_names where name=$1";
pub const INSERT_ANNOTATION_NAME: &str =
    "insert into annotation_names (name) values ($1) returning id";

pub const SELECT_ADDRESS_ID: &str =
    "select id from addresses where name=$1 and localpart=$2 \
     and lower(domain)=lower($3)";
pub const INSERT_ADDRESS: &str =
    "insert into addresses (name, localpart, domain) values ($1, $2, $3) \
     returning id";

// ==================== mailboxes ====================

pub const SELECT_ALL_MAILBOXES: &str =
    "select id, name, uidnext, nextmodseq, first_recent, deleted, \
     uidvalidity from mailboxes order by id";
pub const INSERT_MAILBOX: &str =
    "insert into mailboxes (name, uidvalidity) values ($1, $2) returning id";
pub const SET_MAILBOX_DELETED: &str =
    "update mailboxes set deleted=$1 where id=$2";

/// The injector's allocation lock. Target mailboxes must be locked in
/// ascending id order.
pub const LOCK_MAILBOX: &str =
    "select uidnext, nextmodseq, first_recent from mailboxes \
     where id=$1 for update";
pub const BUMP_MAILBOX: &str =
    "update mailboxes set uidnext=uidnext+$1, nextmodseq=nextmodseq+1 \
     where id=$2";
pub const BUMP_MAILBOX_RECENT: &str =
    "update mailboxes set uidnext=uidnext+$1, nextmodseq=nextmodseq+1, \
     first_recent=first_recent+$2 where id=$3";

// ==================== injection ====================

pub const INSERT_BODYPART: &str =
    "insert into bodyparts (hash, bytes, lines, text, data) \
     values ($1, $2, $3, $4, $5) returning id";
pub const SELECT_BODYPART_BY_HASH: &str =
    "select id from bodyparts where hash=$1";

pub const INSERT_MESSAGE: &str =
    "insert into messages (rfc822size) values ($1) returning id";

pub const INSERT_DELIVERY: &str =
    "insert into deliveries (sender, message, injected_at, expires_at) \
     values ($1, $2, $3, $4) returning id";
pub const INSERT_DELIVERY_RECIPIENT: &str =
    "insert into delivery_recipients (delivery, recipient) values ($1, $2)";

// ==================== selected-mailbox queries ====================

pub const COUNT_RECENT: &str =
    "select count(*) from mailbox_messages where mailbox=$1 and uid>=$2";
pub const SELECT_UIDS: &str =
    "select uid, modseq from mailbox_messages where mailbox=$1 order by uid";
pub const SELECT_ALL_FLAG_NAMES: &str = "select id, name from flag_names";

// ==================== COPY (the IMAP command) ====================

pub const LOCK_COPY_TARGET: &str =
    "select uidnext, nextmodseq from mailboxes where id=$1 for update";

pub const COPY_MAILBOX_MESSAGES_UP: &str =
    "insert into mailbox_messages (mailbox, uid, message, idate, modseq) \
     select $1, m.uid+$2, m.message, m.idate, $3 from mailbox_messages m \
     where m.mailbox=$4 and m.uid>=$5 and m.uid<$6";
pub const COPY_MAILBOX_MESSAGES_DOWN: &str =
    "insert into mailbox_messages (mailbox, uid, message, idate, modseq) \
     select $1, m.uid-$2, m.message, m.idate, $3 from mailbox_messages m \
     where m.mailbox=$4 and m.uid>=$5 and m.uid<$6";

pub const COPY_FLAGS_UP: &str =
    "insert into flags (mailbox, uid, flag) \
     select $1, m.uid+$2, m.flag from flags m \
     where m.mailbox=$3 and m.uid>=$4 and m.uid<$5";
pub const COPY_FLAGS_DOWN: &str =
    "insert into flags (mailbox, uid, flag) \
     select $1, m.uid-$2, m.flag from flags m \
     where m.mailbox=$3 and m.uid>=$4 and m.uid<$5";

pub const COPY_ANNOTATIONS_UP: &str =
    "insert into annotations (mailbox, uid, name, value, owner) \
     select $1, m.uid+$2, m.name, m.value, m.owner from annotations m \
     where m.mailbox=$3 and m.uid>=$4 and m.uid<$5";
pub const COPY_ANNOTATIONS_DOWN: &str =
    "insert into annotations (mailbox, uid, name, value, owner) \
     select $1, m.uid-$2, m.name, m.value, m.owner from annotations m \
     where m.mailbox=$3 and m.uid>=$4 and m.uid<$5";

pub const COPY_MODSEQUENCES: &str =
    "insert into modsequences (mailbox, uid, modseq) \
     select $1, uid, $2 from mailbox_messages \
     where mailbox=$1 and uid>=$3 and uid<$4";

pub const SET_COPY_TARGET_COUNTERS: &str =
    "update mailboxes set uidnext=$1, nextmodseq=$2 where id=$3";

// ==================== EXPUNGE ====================

pub const SELECT_DELETED_UIDS: &str =
    "select mm.uid from mailbox_messages mm \
     join flags f on f.mailbox=mm.mailbox and f.uid=mm.uid \
     where mm.mailbox=$1 and f.flag=$2 order by mm.uid";
pub const DELETE_FLAGS: &str =
    "delete from flags where mailbox=$1 and uid=$2";
pub const DELETE_ANNOTATIONS: &str =
    "delete from annotations where mailbox=$1 and uid=$2";
pub const DELETE_MODSEQUENCES: &str =
    "delete from modsequences where mailbox=$1 and uid=$2";
pub const DELETE_MAILBOX_MESSAGE: &str =
    "delete from mailbox_messages where mailbox=$1 and uid=$2";
