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

//! The server-to-client response model and its wire rendering.
//!
//! Only rendering lives here; IMAP's lexical rules are not separable from
//! its grammar on the read side, so parsing stays with the command layer.

use std::fmt;

use crate::store::model::Flag;

/// Condition of a status response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Ok,
    No,
    Bad,
    Bye,
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Cond::Ok => write!(f, "OK"),
            Cond::No => write!(f, "NO"),
            Cond::Bad => write!(f, "BAD"),
            Cond::Bye => write!(f, "BYE"),
        }
    }
}

/// Bracketed response codes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Code {
    Parse,
    ReadOnly,
    ReadWrite,
    TryCreate,
    UidNext(u32),
    UidValidity(u32),
    HighestModseq(u64),
    PermanentFlags(Vec<Flag>),
    CopyUid {
        uidvalidity: u32,
        from: String,
        to: String,
    },
    AppendUid {
        uidvalidity: u32,
        uids: String,
    },
    Progress {
        tag: String,
        done: usize,
        total: usize,
    },
    Capability(Vec<&'static str>),
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Code::Parse => write!(f, "PARSE"),
            Code::ReadOnly => write!(f, "READ-ONLY"),
            Code::ReadWrite => write!(f, "READ-WRITE"),
            Code::TryCreate => write!(f, "TRYCREATE"),
            Code::UidNext(n) => write!(f, "UIDNEXT {}", n),
            Code::UidValidity(n) => write!(f, "UIDVALIDITY {}", n),
            Code::HighestModseq(n) => write!(f, "HIGHESTMODSEQ {}", n),
            Code::PermanentFlags(ref flags) => {
                write!(f, "PERMANENTFLAGS (")?;
                for flag in flags {
                    write!(f, "{} ", flag)?;
                }
                write!(f, "\\*)")
            },
            Code::CopyUid {
                uidvalidity,
                ref from,
                ref to,
            } => write!(f, "COPYUID {} {} {}", uidvalidity, from, to),
            Code::AppendUid {
                uidvalidity,
                ref uids,
            } => write!(f, "APPENDUID {} {}", uidvalidity, uids),
            Code::Progress {
                ref tag,
                done,
                total,
            } => write!(f, "PROGRESS {} {} {}", tag, done, total),
            Code::Capability(ref caps) => {
                write!(f, "CAPABILITY")?;
                for cap in caps {
                    write!(f, " {}", cap)?;
                }
                Ok(())
            },
        }
    }
}

/// An untagged response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Cond {
        cond: Cond,
        code: Option<Code>,
        text: String,
    },
    Capability(Vec<&'static str>),
    Enabled(Vec<String>),
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    Flags(Vec<Flag>),
    /// Unsolicited FETCH, carrying what changed about a message. MODSEQ is
    /// present once the client has enabled CONDSTORE.
    Fetch {
        seqnum: u32,
        uid: u32,
        modseq: Option<u64>,
    },
}

impl Response {
    pub fn bye(text: impl Into<String>) -> Self {
        Response::Cond {
            cond: Cond::Bye,
            code: None,
            text: text.into(),
        }
    }

    /// Renders the full line, without the CRLF.
    pub fn to_line(&self) -> String {
        match *self {
            Response::Cond {
                cond,
                ref code,
                ref text,
            } => {
                let mut line = format!("* {}", cond);
                if let Some(ref code) = *code {
                    line.push_str(&format!(" [{}]", code));
                }
                if !text.is_empty() {
                    line.push(' ');
                    line.push_str(text);
                }
                line
            },
            Response::Capability(ref caps) => {
                let mut line = "* CAPABILITY".to_owned();
                for cap in caps {
                    line.push(' ');
                    line.push_str(cap);
                }
                line
            },
            Response::Enabled(ref caps) => {
                let mut line = "* ENABLED".to_owned();
                for cap in caps {
                    line.push(' ');
                    line.push_str(cap);
                }
                line
            },
            Response::Exists(n) => format!("* {} EXISTS", n),
            Response::Recent(n) => format!("* {} RECENT", n),
            Response::Expunge(n) => format!("* {} EXPUNGE", n),
            Response::Flags(ref flags) => {
                let mut line = "* FLAGS (".to_owned();
                for (ix, flag) in flags.iter().enumerate() {
                    if 0 != ix {
                        line.push(' ');
                    }
                    line.push_str(&flag.to_string());
                }
                line.push(')');
                line
            },
            Response::Fetch {
                seqnum,
                uid,
                modseq,
            } => {
                let mut line = format!("* {} FETCH (UID {}", seqnum, uid);
                if let Some(modseq) = modseq {
                    line.push_str(&format!(" MODSEQ ({})", modseq));
                }
                line.push(')');
                line
            },
        }
    }
}

/// The tagged completion of a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tagged {
    pub tag: String,
    pub cond: Cond,
    pub code: Option<Code>,
    pub text: String,
}

impl Tagged {
    pub fn ok(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Tagged {
            tag: tag.into(),
            cond: Cond::Ok,
            code: None,
            text: text.into(),
        }
    }

    pub fn no(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Tagged {
            tag: tag.into(),
            cond: Cond::No,
            code: None,
            text: text.into(),
        }
    }

    pub fn bad(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Tagged {
            tag: tag.into(),
            cond: Cond::Bad,
            code: None,
            text: text.into(),
        }
    }

    pub fn with_code(mut self, code: Code) -> Self {
        self.code = Some(code);
        self
    }

    pub fn to_line(&self) -> String {
        let mut line = format!("{} {}", self.tag, self.cond);
        if let Some(ref code) = self.code {
            line.push_str(&format!(" [{}]", code));
        }
        if !self.text.is_empty() {
            line.push(' ');
            line.push_str(&self.text);
        }
        line
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn untagged_rendering() {
        assert_eq!("* 3 EXISTS", Response::Exists(3).to_line());
        assert_eq!("* 2 EXPUNGE", Response::Expunge(2).to_line());
        assert_eq!(
            "* FLAGS (\\Answered \\Deleted)",
            Response::Flags(vec![Flag::Answered, Flag::Deleted]).to_line(),
        );
        assert_eq!(
            "* OK [UIDNEXT 13] Predicted next UID",
            Response::Cond {
                cond: Cond::Ok,
                code: Some(Code::UidNext(13)),
                text: "Predicted next UID".to_owned(),
            }
            .to_line(),
        );
        assert_eq!(
            "* 4 FETCH (UID 9 MODSEQ (12))",
            Response::Fetch {
                seqnum: 4,
                uid: 9,
                modseq: Some(12),
            }
            .to_line(),
        );
    }

    #[test]
    fn tagged_rendering() {
        assert_eq!("A01 OK done", Tagged::ok("A01", "done").to_line());
        assert_eq!(
            "A01 OK [COPYUID 99 2:3,5 10:12] done",
            Tagged::ok("A01", "done")
                .with_code(Code::CopyUid {
                    uidvalidity: 99,
                    from: "2:3,5".to_owned(),
                    to: "10:12".to_owned(),
                })
                .to_line(),
        );
        assert_eq!(
            "A02 BAD unknown command",
            Tagged::bad("A02", "unknown command").to_line(),
        );
    }
}
