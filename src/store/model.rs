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

use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as messages are added to the
/// mailbox. UIDs are never reused within a `uidvalidity` epoch. In this
/// implementation, UIDs are assigned strictly sequentially by the row lock
/// on the mailbox row.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

// This isn't a useful default implementation, but is here so that things
// containing IdSet<ID> can still derive Default.
impl Default for Uid {
    fn default() -> Self {
        Uid::MIN
    }
}

impl Uid {
    pub const MIN: Self = match NonZeroU32::new(1) {
        Some(n) => Uid(n),
        None => unreachable!(),
    };
    pub const MAX: Self = match NonZeroU32::new(u32::MAX) {
        Some(n) => Uid(n),
        None => unreachable!(),
    };

    /// Above this, every allocation logs a warning. The mailbox has burnt
    /// through nearly the entire 31-bit space the less capable clients can
    /// address and somebody should start planning a uidvalidity bump.
    pub const WARN_ABOVE: u32 = 0x7FF0_0000;
    /// Above this, allocation is a disaster and further injections are
    /// refused. There is no automatic mitigation.
    pub const REFUSE_ABOVE: u32 = 0x7FFF_FF00;

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl TryFrom<u32> for Uid {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Uid> for u32 {
    fn from(uid: Uid) -> u32 {
        uid.0.get()
    }
}

/// The sequence number of a message: one plus the number of messages with a
/// smaller UID in the session's current snapshot.
///
/// Sequence numbers shift as expungements are reported, so they are only
/// meaningful relative to one session's snapshot and never touch the
/// database.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Seqnum(pub NonZeroU32);

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seqnum({})", self.0.get())
    }
}

impl Default for Seqnum {
    fn default() -> Self {
        Seqnum::MIN
    }
}

impl Seqnum {
    pub const MIN: Self = match NonZeroU32::new(1) {
        Some(n) => Seqnum(n),
        None => unreachable!(),
    };

    pub fn of(seqnum: u32) -> Option<Self> {
        NonZeroU32::new(seqnum).map(Seqnum)
    }

    #[cfg(test)]
    pub fn u(seqnum: u32) -> Self {
        Seqnum::of(seqnum).unwrap()
    }
}

impl TryFrom<u32> for Seqnum {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Seqnum> for u32 {
    fn from(seqnum: Seqnum) -> u32 {
        seqnum.0.get()
    }
}

/// A CONDSTORE modification sequence number.
///
/// Strictly monotonic per mailbox, 64 bits, allocated from the mailbox row's
/// `nextmodseq` under the same row lock that allocates UIDs. All messages
/// injected by one transaction into one mailbox share a single modseq.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct Modseq(pub u64);

impl Modseq {
    /// The primordial modseq of a freshly created mailbox.
    pub const MIN: Self = Modseq(1);

    pub fn next(self) -> Self {
        Modseq(self.0 + 1)
    }
}

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident, $inner:ty) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);
    };
}

id_newtype! {
    /// Stable id of a mailbox row. Never reused.
    MailboxId, i64
}
id_newtype! {
    /// Stable cross-mailbox id of a message row.
    MessageId, i64
}
id_newtype! {
    /// Stable id of a content-addressed bodypart row.
    BodypartId, i64
}
id_newtype! {
    /// Interned header-field name.
    FieldId, u32
}
id_newtype! {
    /// Interned flag name.
    FlagId, u32
}
id_newtype! {
    /// Interned annotation entry name.
    AnnotationNameId, u32
}
id_newtype! {
    /// Deduplicated RFC 5322 address row.
    AddressId, i64
}
id_newtype! {
    /// A delivery (outbound relay) record.
    DeliveryId, i64
}

/// A message flag.
///
/// System flags are represented as top-level enum values. Keywords are in
/// the `Keyword` case.
///
/// The `Display` format of this type is the exact string value that would be
/// sent over the wire, and is also what the `flag_names` intern table
/// stores. `FromStr` does the reverse conversion, and also understands
/// non-standard casing of the system flags.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Keyword(String),
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if s.starts_with('\\') {
            Err(Error::UnsafeName)
        } else if !s.is_empty()
            && s.as_bytes().iter().copied().all(is_atom_char)
        {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

pub fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

impl PartialEq for Flag {
    fn eq(&self, other: &Flag) -> bool {
        match (self, other) {
            (&Flag::Answered, &Flag::Answered) => true,
            (&Flag::Deleted, &Flag::Deleted) => true,
            (&Flag::Draft, &Flag::Draft) => true,
            (&Flag::Flagged, &Flag::Flagged) => true,
            (&Flag::Seen, &Flag::Seen) => true,
            // Keywords are conventionally treated as case-insensitive even
            // though RFC 3501 does not require it. Only ASCII
            // case-insensitivity, since RFC 3501 flags cannot be Unicode
            // anyway.
            (&Flag::Keyword(ref a), &Flag::Keyword(ref b)) => {
                a.eq_ignore_ascii_case(b)
            },
            _ => false,
        }
    }
}

impl Eq for Flag {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uid_bounds() {
        assert_eq!(None, Uid::of(0));
        assert_eq!(Some(Uid::MIN), Uid::of(1));
        assert_eq!(Some(Uid::MAX), Uid::of(u32::MAX));
        assert!(Uid::WARN_ABOVE < Uid::REFUSE_ABOVE);
    }

    #[test]
    fn flag_round_trip() {
        for raw in ["\\Answered", "\\Deleted", "\\Seen", "$Forwarded"] {
            let flag: Flag = raw.parse().unwrap();
            assert_eq!(raw, flag.to_string());
        }

        assert_eq!(
            Flag::Keyword("FOO".to_owned()),
            Flag::Keyword("foo".to_owned()),
        );
        assert_eq!(Flag::Seen, "\\SEEN".parse::<Flag>().unwrap());
        assert_matches!(Err(Error::UnsafeName), "\\Recent".parse::<Flag>());
        assert_matches!(Err(Error::UnsafeName), "has space".parse::<Flag>());
        assert_matches!(Err(Error::UnsafeName), "".parse::<Flag>());
    }
}
