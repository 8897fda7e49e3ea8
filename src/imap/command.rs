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

//! Client command parsing.
//!
//! A command arrives as a list of byte strings: line fragments alternating
//! with literals, exactly as the framing layer collected them. A line
//! fragment that was followed by a literal still ends with its `{n}`
//! marker; the parser consumes the marker and takes the following part as
//! the literal's value. `Arguments` is the cursor over that list, with the
//! usual space/atom/astring/number steps.
//!
//! The tag is a nonzero sequence of ASTRING-CHAR except `+`; the command
//! name is a single atom, looked up in the handler registry by name. An
//! unknown name is reported as `BAD unknown command`.

use chrono::prelude::*;

use super::utf7;
use crate::store::model::Flag;

pub type PResult<T> = Result<T, String>;

/// One fully-assembled command, parsed into its typed request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedCommand {
    pub tag: String,
    pub name: String,
    pub kind: Kind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Capability,
    Noop,
    Check,
    Logout,
    Login {
        user: String,
        password: String,
    },
    Authenticate {
        mechanism: String,
        initial: Option<String>,
    },
    Enable {
        capabilities: Vec<String>,
    },
    Select {
        mailbox: String,
        examine: bool,
    },
    Unselect,
    Idle,
    Expunge,
    Copy {
        uid: bool,
        sequence: String,
        mailbox: String,
    },
    Append {
        mailbox: String,
        items: Vec<AppendItem>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendItem {
    pub flags: Vec<Flag>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub message: Vec<u8>,
}

impl Kind {
    /// The pipelining group. Group 0 commands run alone; commands sharing
    /// a non-zero group may execute concurrently with each other.
    pub fn group(&self) -> u8 {
        match *self {
            Kind::Capability | Kind::Noop | Kind::Check => 2,
            _ => 0,
        }
    }

    /// Whether this command takes over the input stream after dispatch
    /// (RFC 2177 IDLE, AUTHENTICATE continuation).
    pub fn reserves_input(&self) -> bool {
        matches!(*self, Kind::Idle | Kind::Authenticate { .. })
    }
}

/// What became of one assembled command's worth of input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    Command(ParsedCommand),
    /// The line had a recognisable tag but the command was unusable.
    Bad { tag: String, message: String },
    /// Not even a tag could be extracted.
    Incomprehensible,
}

/// Parses one assembled command.
pub fn parse(parts: Vec<Vec<u8>>) -> ParseOutcome {
    let mut args = Arguments::new(parts);

    let Some(tag) = args.tag() else {
        return ParseOutcome::Incomprehensible;
    };
    if args.space().is_err() {
        return ParseOutcome::Incomprehensible;
    }

    let name = match args.atom() {
        Ok(name) => name.to_uppercase(),
        Err(_) => {
            return ParseOutcome::Bad {
                tag,
                message: "no command".to_owned(),
            }
        },
    };

    match create(&name, &mut args) {
        Ok(Some(kind)) => match args.end() {
            Ok(()) => ParseOutcome::Command(ParsedCommand {
                tag,
                name,
                kind,
            }),
            Err(message) => ParseOutcome::Bad { tag, message },
        },
        Ok(None) => ParseOutcome::Bad {
            tag,
            message: format!("unknown command: {}", name),
        },
        Err(message) => ParseOutcome::Bad { tag, message },
    }
}

/// The handler registry: command atom to request constructor.
fn create(name: &str, args: &mut Arguments) -> PResult<Option<Kind>> {
    Ok(Some(match name {
        "CAPABILITY" => Kind::Capability,
        "NOOP" => Kind::Noop,
        "CHECK" => Kind::Check,
        "LOGOUT" => Kind::Logout,

        "LOGIN" => {
            args.space()?;
            let user = args.astring_utf8()?;
            args.space()?;
            let password = args.astring_utf8()?;
            Kind::Login { user, password }
        },

        "AUTHENTICATE" => {
            args.space()?;
            let mechanism = args.atom()?.to_uppercase();
            let initial = if args.space().is_ok() {
                Some(args.atom()?)
            } else {
                None
            };
            Kind::Authenticate { mechanism, initial }
        },

        "ENABLE" => {
            let mut capabilities = Vec::new();
            while args.space().is_ok() {
                capabilities.push(args.atom()?.to_uppercase());
            }
            if capabilities.is_empty() {
                return Err("no capabilities enabled".to_owned());
            }
            Kind::Enable { capabilities }
        },

        "SELECT" | "EXAMINE" => {
            args.space()?;
            let mailbox = args.mailbox()?;
            Kind::Select {
                mailbox,
                examine: "EXAMINE" == name,
            }
        },

        "UNSELECT" => Kind::Unselect,
        "IDLE" => Kind::Idle,
        "EXPUNGE" => Kind::Expunge,

        "COPY" => {
            args.space()?;
            let sequence = args.sequence_set()?;
            args.space()?;
            let mailbox = args.mailbox()?;
            Kind::Copy {
                uid: false,
                sequence,
                mailbox,
            }
        },

        "UID" => {
            args.space()?;
            let sub = args.atom()?.to_uppercase();
            if "COPY" != sub {
                return Err(format!("UID {} not supported", sub));
            }
            args.space()?;
            let sequence = args.sequence_set()?;
            args.space()?;
            let mailbox = args.mailbox()?;
            Kind::Copy {
                uid: true,
                sequence,
                mailbox,
            }
        },

        "APPEND" => {
            args.space()?;
            let mailbox = args.mailbox()?;
            let mut items = Vec::new();
            while !args.at_end() {
                args.space()?;
                let flags = if Some(b'(') == args.peek() {
                    let flags = args.flag_list()?;
                    args.space()?;
                    flags
                } else {
                    Vec::new()
                };
                let internal_date = if Some(b'"') == args.peek() {
                    let date = args.datetime()?;
                    args.space()?;
                    Some(date)
                } else {
                    None
                };
                let message = args.literal()?;
                if message.is_empty() {
                    return Err("zero-length message".to_owned());
                }
                items.push(AppendItem {
                    flags,
                    internal_date,
                    message,
                });
            }
            if items.is_empty() {
                return Err("nothing to append".to_owned());
            }
            Kind::Append { mailbox, items }
        },

        _ => return Ok(None),
    }))
}

/// Cursor over the assembled parts of one command.
pub struct Arguments {
    parts: Vec<Vec<u8>>,
    part: usize,
    pos: usize,
}

impl Arguments {
    pub fn new(parts: Vec<Vec<u8>>) -> Self {
        Arguments {
            parts,
            part: 0,
            pos: 0,
        }
    }

    fn cur(&self) -> &[u8] {
        self.parts
            .get(self.part)
            .map(|p| &p[self.pos.min(p.len())..])
            .unwrap_or(b"")
    }

    pub fn peek(&self) -> Option<u8> {
        self.cur().first().copied()
    }

    /// True once the current line fragment is exhausted and no literal
    /// follows.
    pub fn at_end(&self) -> bool {
        self.cur().is_empty() && self.part + 1 >= self.parts.len()
    }

    pub fn end(&mut self) -> PResult<()> {
        if self.at_end() {
            Ok(())
        } else {
            Err("trailing garbage after command".to_owned())
        }
    }

    pub fn space(&mut self) -> PResult<()> {
        if Some(b' ') == self.peek() {
            self.pos += 1;
            Ok(())
        } else {
            Err("expected space".to_owned())
        }
    }

    /// The command tag: ASTRING-CHAR except '+'.
    fn tag(&mut self) -> Option<String> {
        let cur = self.cur();
        let len = cur
            .iter()
            .copied()
            .take_while(|&c| is_tag_char(c))
            .count();
        if 0 == len {
            return None;
        }

        let tag = String::from_utf8_lossy(&cur[..len]).into_owned();
        self.pos += len;
        Some(tag)
    }

    pub fn atom(&mut self) -> PResult<String> {
        let cur = self.cur();
        let len = cur
            .iter()
            .copied()
            .take_while(|&c| is_atom_char(c))
            .count();
        if 0 == len {
            return Err("expected atom".to_owned());
        }

        let atom = String::from_utf8_lossy(&cur[..len]).into_owned();
        self.pos += len;
        Ok(atom)
    }

    /// atom | quoted | literal.
    pub fn astring(&mut self) -> PResult<Vec<u8>> {
        match self.peek() {
            Some(b'"') => self.quoted(),
            Some(b'{') => self.literal(),
            _ => self.atom().map(String::into_bytes),
        }
    }

    pub fn astring_utf8(&mut self) -> PResult<String> {
        String::from_utf8(self.astring()?)
            .map_err(|_| "astring is not valid UTF-8".to_owned())
    }

    /// A mailbox name: astring on the wire, Unicode internally.
    pub fn mailbox(&mut self) -> PResult<String> {
        let raw = self.astring_utf8()?;
        if raw.eq_ignore_ascii_case("inbox") {
            Ok("INBOX".to_owned())
        } else {
            Ok(utf7::imap_decode(&raw))
        }
    }

    fn quoted(&mut self) -> PResult<Vec<u8>> {
        let cur = self.cur();
        debug_assert_eq!(Some(&b'"'), cur.first());

        let mut out = Vec::new();
        let mut ix = 1;
        while ix < cur.len() {
            match cur[ix] {
                b'"' => {
                    self.pos += ix + 1;
                    return Ok(out);
                },
                b'\\' if ix + 1 < cur.len() => {
                    out.push(cur[ix + 1]);
                    ix += 2;
                },
                c => {
                    out.push(c);
                    ix += 1;
                },
            }
        }

        Err("unterminated quoted string".to_owned())
    }

    /// Consumes a `{n}`/`{n+}` marker at the end of the current line
    /// fragment and returns the literal that followed it.
    pub fn literal(&mut self) -> PResult<Vec<u8>> {
        let cur = self.cur();
        if Some(&b'{') != cur.first() {
            return Err("expected literal".to_owned());
        }
        let Some(close) = cur.iter().position(|&c| b'}' == c) else {
            return Err("malformed literal".to_owned());
        };
        if close + 1 != cur.len() {
            return Err("literal marker not at end of line".to_owned());
        }

        let digits = std::str::from_utf8(&cur[1..close])
            .ok()
            .map(|d| d.trim_end_matches('+'))
            .and_then(|d| d.parse::<u32>().ok())
            .ok_or_else(|| "malformed literal length".to_owned())?;

        if self.part + 1 >= self.parts.len() {
            return Err("literal data missing".to_owned());
        }
        let literal = std::mem::take(&mut self.parts[self.part + 1]);
        if literal.len() != digits as usize {
            return Err("literal length mismatch".to_owned());
        }

        self.part += 2;
        self.pos = 0;
        Ok(literal)
    }

    /// An RFC 3501 sequence-set, returned as raw text for the handler to
    /// interpret against its snapshot.
    pub fn sequence_set(&mut self) -> PResult<String> {
        let cur = self.cur();
        let len = cur
            .iter()
            .copied()
            .take_while(|&c| {
                c.is_ascii_digit() || matches!(c, b':' | b',' | b'*')
            })
            .count();
        if 0 == len {
            return Err("expected sequence set".to_owned());
        }

        let set = String::from_utf8_lossy(&cur[..len]).into_owned();
        self.pos += len;
        Ok(set)
    }

    /// `(flag flag ...)`, possibly empty.
    pub fn flag_list(&mut self) -> PResult<Vec<Flag>> {
        if Some(b'(') != self.peek() {
            return Err("expected flag list".to_owned());
        }
        self.pos += 1;

        let mut flags = Vec::new();
        loop {
            match self.peek() {
                Some(b')') => {
                    self.pos += 1;
                    return Ok(flags);
                },
                Some(b' ') => self.pos += 1,
                Some(_) => {
                    let atom = self.flag_atom()?;
                    flags.push(
                        atom.parse().map_err(|_| {
                            format!("bad flag: {}", atom)
                        })?,
                    );
                },
                None => {
                    return Err("unterminated flag list".to_owned())
                },
            }
        }
    }

    fn flag_atom(&mut self) -> PResult<String> {
        let cur = self.cur();
        let mut len = 0;
        if Some(&b'\\') == cur.first() {
            len = 1;
        }
        len += cur[len..]
            .iter()
            .copied()
            .take_while(|&c| is_atom_char(c))
            .count();
        if 0 == len {
            return Err("expected flag".to_owned());
        }

        let atom = String::from_utf8_lossy(&cur[..len]).into_owned();
        self.pos += len;
        Ok(atom)
    }

    /// An RFC 3501 `date-time`: `"dd-MMM-yyyy HH:MM:SS +zzzz"`, where the
    /// day may be space-padded.
    pub fn datetime(&mut self) -> PResult<DateTime<FixedOffset>> {
        let raw = self.quoted()?;
        let text = std::str::from_utf8(&raw)
            .map_err(|_| "bad date-time".to_owned())?;
        DateTime::parse_from_str(text.trim_start(), "%d-%b-%Y %H:%M:%S %z")
            .map_err(|_| format!("bad date-time: {}", text))
    }
}

fn is_tag_char(c: u8) -> bool {
    c > b' '
        && c < 127
        && !matches!(c, b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\' | b'+')
}

fn is_atom_char(c: u8) -> bool {
    c > b' '
        && c < 127
        && !matches!(c, b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\' | b']')
}

#[cfg(test)]
mod test {
    use super::*;

    fn parts(line: &str) -> Vec<Vec<u8>> {
        vec![line.as_bytes().to_vec()]
    }

    fn parsed(parts: Vec<Vec<u8>>) -> ParsedCommand {
        match parse(parts) {
            ParseOutcome::Command(command) => command,
            other => panic!("expected a command, got {:?}", other),
        }
    }

    #[test]
    fn simple_commands() {
        let command = parsed(parts("A01 NOOP"));
        assert_eq!("A01", command.tag);
        assert_eq!(Kind::Noop, command.kind);

        let command = parsed(parts("x CAPABILITY"));
        assert_eq!(Kind::Capability, command.kind);

        let command = parsed(parts("1 login joe sixpack"));
        assert_eq!(
            Kind::Login {
                user: "joe".to_owned(),
                password: "sixpack".to_owned(),
            },
            command.kind,
        );
    }

    #[test]
    fn login_with_literals() {
        // A01 LOGIN {5}\r\nhello {5}\r\nworld
        let command = parsed(vec![
            b"A01 LOGIN {5}".to_vec(),
            b"hello".to_vec(),
            b" {5}".to_vec(),
            b"world".to_vec(),
            b"".to_vec(),
        ]);
        assert_eq!("A01", command.tag);
        assert_eq!("LOGIN", command.name);
        assert_eq!(
            Kind::Login {
                user: "hello".to_owned(),
                password: "world".to_owned(),
            },
            command.kind,
        );
    }

    #[test]
    fn quoted_strings() {
        let command = parsed(parts(r#"a LOGIN "joe six" "pa\"ss\\word""#));
        assert_eq!(
            Kind::Login {
                user: "joe six".to_owned(),
                password: "pa\"ss\\word".to_owned(),
            },
            command.kind,
        );
    }

    #[test]
    fn bad_and_incomprehensible() {
        assert_eq!(ParseOutcome::Incomprehensible, parse(parts("")));
        assert_eq!(
            ParseOutcome::Incomprehensible,
            parse(parts("+tag NOOP")),
        );
        assert_matches!(
            ParseOutcome::Bad { .. },
            parse(parts("A01 FROBNICATE")),
        );
        assert_eq!(ParseOutcome::Incomprehensible, parse(parts("A01")));
        // Trailing garbage after a complete command.
        assert_matches!(ParseOutcome::Bad { .. }, parse(parts("A01 NOOP x")));
    }

    #[test]
    fn enable_parses_capability_list() {
        let command = parsed(parts("A01 ENABLE condstore X-UNKNOWN"));
        assert_eq!(
            Kind::Enable {
                capabilities: vec![
                    "CONDSTORE".to_owned(),
                    "X-UNKNOWN".to_owned(),
                ],
            },
            command.kind,
        );
        assert_matches!(ParseOutcome::Bad { .. }, parse(parts("A01 ENABLE")));
    }

    #[test]
    fn select_decodes_utf7() {
        let command = parsed(parts("A01 SELECT \"Lost &- Found\""));
        assert_eq!(
            Kind::Select {
                mailbox: "Lost & Found".to_owned(),
                examine: false,
            },
            command.kind,
        );

        let command = parsed(parts("A01 EXAMINE iNbOx"));
        assert_eq!(
            Kind::Select {
                mailbox: "INBOX".to_owned(),
                examine: true,
            },
            command.kind,
        );
    }

    #[test]
    fn copy_and_uid_copy() {
        let command = parsed(parts("A01 COPY 2:5 Archive"));
        assert_eq!(
            Kind::Copy {
                uid: false,
                sequence: "2:5".to_owned(),
                mailbox: "Archive".to_owned(),
            },
            command.kind,
        );

        let command = parsed(parts("A01 UID COPY 2:5,9 Archive"));
        assert_eq!(
            Kind::Copy {
                uid: true,
                sequence: "2:5,9".to_owned(),
                mailbox: "Archive".to_owned(),
            },
            command.kind,
        );

        assert_matches!(
            ParseOutcome::Bad { .. },
            parse(parts("A01 UID FROB 1 x")),
        );
    }

    #[test]
    fn append_items() {
        let command = parsed(vec![
            b"A01 APPEND INBOX (\\Seen) \" 4-Jul-2020 16:31:00 +0100\" {3}"
                .to_vec(),
            b"abc".to_vec(),
            b" {2}".to_vec(),
            b"de".to_vec(),
            b"".to_vec(),
        ]);
        let Kind::Append { mailbox, items } = command.kind else {
            panic!("not an append");
        };
        assert_eq!("INBOX", mailbox);
        assert_eq!(2, items.len());
        assert_eq!(vec![Flag::Seen], items[0].flags);
        assert!(items[0].internal_date.is_some());
        assert_eq!(b"abc".to_vec(), items[0].message);
        assert!(items[1].flags.is_empty());
        assert_eq!(b"de".to_vec(), items[1].message);
    }

    #[test]
    fn append_rejects_empty_message() {
        assert_matches!(
            ParseOutcome::Bad { .. },
            parse(vec![
                b"A01 APPEND INBOX {0}".to_vec(),
                b"".to_vec(),
                b"".to_vec(),
            ]),
        );
    }

    #[test]
    fn idle_reserves_input() {
        let command = parsed(parts("A01 IDLE"));
        assert!(command.kind.reserves_input());
        assert_eq!(0, command.kind.group());
        assert_eq!(2, Kind::Noop.group());
    }
}
