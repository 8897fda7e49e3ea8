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

//! The parsed-message tree consumed by the injector, and its flattening
//! into the row sets the database wants.
//!
//! The full MIME/RFC 5322 parser lives outside this crate; what is here is
//! the owned tree it produces, a `parse()` that covers the structure the
//! store actually needs (header splitting, multipart and message/rfc822
//! recursion, address lists), and the flattening rules: part numbering with
//! the synthetic `""` header anchor, per-part storage classification,
//! content hashing, and header-field ordinals.

use std::fmt::Write as _;

use chrono::prelude::*;

use crate::support::error::Error;

/// An RFC 5322 address: display name, localpart, domain.
///
/// Equality for deduplication purposes is case-insensitive on the domain and
/// case-sensitive on the localpart; see `cache_key`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub name: Option<String>,
    pub localpart: String,
    pub domain: String,
}

impl Address {
    /// The key under which this address is deduplicated, both in the
    /// process-wide cache and by the database's unique constraint.
    pub fn cache_key(&self) -> String {
        format!(
            "{}\0{}\0{}",
            self.name.as_deref().unwrap_or(""),
            self.localpart,
            self.domain.to_lowercase(),
        )
    }
}

/// One header field, in its original position.
#[derive(Clone, Debug)]
pub struct HeaderField {
    pub name: String,
    /// The decoded field value, without the name or colon.
    pub value: String,
    /// For address fields, the parsed address list in order of appearance.
    pub addresses: Vec<Address>,
}

/// The fields whose values are stored as address links rather than text.
pub fn is_address_field(name: &str) -> bool {
    const ADDRESS_FIELDS: &[&str] = &[
        "Return-Path",
        "Sender",
        "Resent-Sender",
        "From",
        "To",
        "Cc",
        "Bcc",
        "Resent-From",
        "Resent-To",
        "Resent-Cc",
        "Resent-Bcc",
        "Reply-To",
    ];
    ADDRESS_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(name))
}

#[derive(Clone, Debug, Default)]
pub struct Header {
    pub fields: Vec<HeaderField>,
}

impl Header {
    pub fn get(&self, name: &str) -> Option<&HeaderField> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    fn content_type(&self) -> (String, String, Option<String>) {
        let Some(field) = self.get("Content-Type") else {
            return ("text".to_owned(), "plain".to_owned(), None);
        };

        let mut params = field.value.split(';');
        let fulltype = params.next().unwrap_or("").trim().to_lowercase();
        let (typ, subtype) = match fulltype.split_once('/') {
            Some((t, s)) => (t.to_owned(), s.to_owned()),
            None => ("text".to_owned(), "plain".to_owned()),
        };

        let mut boundary = None;
        for param in params {
            let Some((k, v)) = param.split_once('=') else {
                continue;
            };
            if k.trim().eq_ignore_ascii_case("boundary") {
                boundary =
                    Some(v.trim().trim_matches('"').to_owned());
            }
        }

        (typ, subtype, boundary)
    }
}

/// The body of one node of the MIME tree.
#[derive(Clone, Debug)]
pub enum Body {
    /// A leaf part: the canonical (transfer-decoded) bytes.
    Leaf { content: Vec<u8> },
    /// A multipart container. `raw` is the verbatim entity body, retained
    /// because multipart/signed is stored whole.
    Multipart { children: Vec<Part>, raw: Vec<u8> },
    /// An embedded message/rfc822.
    Rfc822 { envelope: Box<Part>, raw: Vec<u8> },
}

/// One node of the MIME tree: a header plus a body.
#[derive(Clone, Debug)]
pub struct Part {
    pub header: Header,
    pub body: Body,
}

impl Part {
    fn content_type(&self) -> (String, String) {
        let (t, s, _) = self.header.content_type();
        (t, s)
    }
}

/// A complete parsed message.
#[derive(Clone, Debug)]
pub struct Message {
    pub top: Part,
    pub rfc822_size: u32,
}

// ==================== Parsing ====================

impl Message {
    /// Parses `data` into a message tree.
    ///
    /// This implements the subset of RFC 5322/MIME structure the store
    /// needs; it is deliberately permissive, since rejecting mail at
    /// delivery time is worse than storing it with a shallow structure.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.is_empty() {
            return Err(Error::BadMessage);
        }

        let top = parse_part(data)?;
        Ok(Message {
            top,
            rfc822_size: data.len() as u32,
        })
    }
}

fn parse_part(data: &[u8]) -> Result<Part, Error> {
    let (header_bytes, body_bytes) = split_header(data);
    let header = parse_header(header_bytes)?;

    let (typ, subtype, boundary) = header.content_type();
    let body = if "multipart" == typ {
        let children = match boundary {
            Some(ref b) => split_multipart(body_bytes, b)?
                .into_iter()
                .map(|c| parse_part(c))
                .collect::<Result<Vec<_>, _>>()?,
            // A multipart with no boundary cannot be split; degrade to an
            // empty container so the raw entity is still stored/addressed.
            None => Vec::new(),
        };
        Body::Multipart {
            children,
            raw: body_bytes.to_owned(),
        }
    } else if "message" == typ && "rfc822" == subtype {
        Body::Rfc822 {
            envelope: Box::new(parse_part(body_bytes)?),
            raw: body_bytes.to_owned(),
        }
    } else {
        Body::Leaf {
            content: body_bytes.to_owned(),
        }
    };

    Ok(Part { header, body })
}

/// Splits raw message bytes at the blank line separating header from body.
fn split_header(data: &[u8]) -> (&[u8], &[u8]) {
    let mut ix = 0;
    while ix < data.len() {
        let line_end = memchr::memchr(b'\n', &data[ix..])
            .map(|p| ix + p + 1)
            .unwrap_or(data.len());
        let line = &data[ix..line_end];
        if line == b"\r\n" || line == b"\n" {
            return (&data[..ix], &data[line_end..]);
        }
        ix = line_end;
    }

    (data, b"")
}

fn parse_header(data: &[u8]) -> Result<Header, Error> {
    let text = String::from_utf8_lossy(data);
    let mut fields = Vec::<HeaderField>::new();

    for raw_line in text.split_inclusive('\n') {
        let line = raw_line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of the previous field.
            if let Some(last) = fields.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim_start());
            }
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            // Garbage in the header; RFC 5322 says this isn't a header
            // field, but rejecting the whole message over it helps nobody.
            continue;
        };

        fields.push(HeaderField {
            name: name.trim().to_owned(),
            value: value.trim_start().to_owned(),
            addresses: Vec::new(),
        });
    }

    if fields.is_empty() {
        return Err(Error::BadMessage);
    }

    for field in &mut fields {
        if is_address_field(&field.name) {
            field.addresses = parse_address_list(&field.value);
        }
    }

    Ok(Header { fields })
}

/// Parses a comma-separated address list.
///
/// Handles `Display Name <local@domain>`, `local@domain`, and quoted display
/// names. Anything unparsable is skipped rather than failing the message.
pub fn parse_address_list(value: &str) -> Vec<Address> {
    let mut out = Vec::new();
    for item in split_addresses(value) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        let (name, addrspec) = match (item.find('<'), item.rfind('>')) {
            (Some(lt), Some(gt)) if lt < gt => {
                let name = item[..lt].trim().trim_matches('"').trim();
                (
                    if name.is_empty() {
                        None
                    } else {
                        Some(name.to_owned())
                    },
                    &item[lt + 1..gt],
                )
            },
            _ => (None, item),
        };

        let Some((localpart, domain)) = addrspec.rsplit_once('@') else {
            continue;
        };
        if localpart.is_empty() || domain.is_empty() {
            continue;
        }

        out.push(Address {
            name,
            localpart: localpart.to_owned(),
            domain: domain.to_owned(),
        });
    }

    out
}

/// Splits an address list on commas, respecting quoted strings and angle
/// brackets.
fn split_addresses(value: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut angle = false;

    for (ix, ch) in value.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            '<' if !quoted => angle = true,
            '>' if !quoted => angle = false,
            ',' if !quoted && !angle => {
                out.push(&value[start..ix]);
                start = ix + 1;
            },
            _ => {},
        }
    }

    out.push(&value[start..]);
    out
}

fn split_multipart<'a>(
    body: &'a [u8],
    boundary: &str,
) -> Result<Vec<&'a [u8]>, Error> {
    let delim = format!("--{}", boundary);
    let mut parts = Vec::new();
    let mut current_start: Option<usize> = None;
    let mut ix = 0;

    while ix <= body.len() {
        let line_end = memchr::memchr(b'\n', &body[ix..])
            .map(|p| ix + p + 1)
            .unwrap_or(body.len());
        let line = &body[ix..line_end];
        let trimmed: &[u8] = {
            let mut t = line;
            while t.last().map_or(false, |&b| b == b'\n' || b == b'\r') {
                t = &t[..t.len() - 1];
            }
            t
        };

        let is_delim = trimmed == delim.as_bytes();
        let is_final = trimmed == format!("{}--", delim).as_bytes();

        if is_delim || is_final {
            if let Some(start) = current_start.take() {
                // The CRLF before the boundary belongs to the boundary.
                let mut end = ix;
                if end > start && body[end - 1] == b'\n' {
                    end -= 1;
                    if end > start && body[end - 1] == b'\r' {
                        end -= 1;
                    }
                }
                parts.push(&body[start..end]);
            }

            if is_final {
                break;
            }

            current_start = Some(line_end);
        }

        if line_end == body.len() {
            break;
        }
        ix = line_end;
    }

    Ok(parts)
}

// ==================== Flattening ====================

/// How a bodypart's content is stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BodypartContent {
    /// Hex-encoded MD5 of the canonical bytes; the content address.
    pub hash: String,
    pub bytes: u32,
    pub lines: u32,
    /// The text column: canonical text for text/*, derived plaintext for
    /// text/html.
    pub text: Option<String>,
    /// The data column: verbatim bytes for binary parts, text/html, and
    /// multipart/signed.
    pub data: Option<Vec<u8>>,
}

/// A `part_numbers` row: the link from a message's part number to its
/// stored content (if any).
#[derive(Clone, Debug)]
pub struct PartRow {
    pub part: String,
    /// Index into `FlatMessage::bodyparts`, or `None` for rows that carry
    /// structure only (the `""` anchor, multipart containers,
    /// `<n>.rfc822` anchors).
    pub bodypart: Option<usize>,
    pub bytes: u32,
    pub lines: u32,
}

/// A `header_fields` row before field-name interning.
#[derive(Clone, Debug)]
pub struct FieldRow {
    pub part: String,
    /// Ordinal of the field within its containing header, 1-based, counted
    /// across both plain and address fields so that the original order is
    /// reproducible.
    pub position: u32,
    pub name: String,
    pub value: String,
}

/// An `address_fields` row before address interning.
#[derive(Clone, Debug)]
pub struct AddressRow {
    pub part: String,
    pub position: u32,
    pub name: String,
    /// Ordinal within the address list of this single field, 1-based, so
    /// that `From: a, b, c` preserves order.
    pub number: u32,
    pub address: Address,
}

/// A message flattened into the row sets the injector bulk-loads.
#[derive(Clone, Debug, Default)]
pub struct FlatMessage {
    /// Distinct bodypart contents, deduplicated by hash within the message.
    pub bodyparts: Vec<BodypartContent>,
    pub parts: Vec<PartRow>,
    pub fields: Vec<FieldRow>,
    pub addresses: Vec<AddressRow>,
}

impl Message {
    pub fn flatten(&self) -> FlatMessage {
        let mut flat = FlatMessage::default();

        // The synthetic anchor for the top-level header.
        flat.parts.push(PartRow {
            part: String::new(),
            bodypart: None,
            bytes: self.rfc822_size,
            lines: 0,
        });
        add_header_rows(&mut flat, "", &self.top.header);

        match self.top.body {
            Body::Multipart { .. } => {
                flatten_children(&mut flat, "", &self.top);
            },
            // The parser collapsed the sole child into the top-level
            // header, so part 1 carries the content but must not repeat
            // the header links.
            Body::Leaf { .. } => {
                flatten_leaf_content(&mut flat, "1", &self.top, false);
            },
            Body::Rfc822 { .. } => {
                flatten_rfc822(&mut flat, "1", &self.top);
            },
        }

        flat
    }
}

fn child_part_number(prefix: &str, ix: usize) -> String {
    if prefix.is_empty() {
        format!("{}", ix + 1)
    } else {
        format!("{}.{}", prefix, ix + 1)
    }
}

fn flatten_children(flat: &mut FlatMessage, prefix: &str, part: &Part) {
    let Body::Multipart { ref children, .. } = part.body else {
        return;
    };

    for (ix, child) in children.iter().enumerate() {
        let partno = child_part_number(prefix, ix);
        flatten_node(flat, &partno, child);
    }
}

fn flatten_node(flat: &mut FlatMessage, partno: &str, part: &Part) {
    let (_, subtype) = part.content_type();

    match part.body {
        Body::Multipart { ref raw, .. } => {
            add_header_rows(flat, partno, &part.header);
            if "signed" == subtype {
                // multipart/signed is stored whole so the signed entity
                // can be reproduced byte for byte.
                let bp = intern_bodypart(
                    flat,
                    BodypartContent::binary(raw.clone()),
                );
                flat.parts.push(PartRow {
                    part: partno.to_owned(),
                    bodypart: Some(bp),
                    bytes: raw.len() as u32,
                    lines: count_lines(raw),
                });
            } else {
                flat.parts.push(PartRow {
                    part: partno.to_owned(),
                    bodypart: None,
                    bytes: raw.len() as u32,
                    lines: count_lines(raw),
                });
            }
            flatten_children(flat, partno, part);
        },

        Body::Rfc822 { .. } => {
            add_header_rows(flat, partno, &part.header);
            flatten_rfc822(flat, partno, part);
        },

        Body::Leaf { .. } => {
            add_header_rows(flat, partno, &part.header);
            flatten_leaf_content(flat, partno, part, true);
        },
    }
}

/// Emits the rows for an embedded message/rfc822: the outer part number,
/// the `<partno>.rfc822` anchor carrying the embedded message's header,
/// and the embedded body under `<partno>.1` etc. The caller is
/// responsible for the outer part's own header links (absent entirely for
/// a top-level message/rfc822, where the `""` anchor already has them).
fn flatten_rfc822(flat: &mut FlatMessage, partno: &str, part: &Part) {
    let Body::Rfc822 {
        ref envelope,
        ref raw,
    } = part.body
    else {
        return;
    };

    flat.parts.push(PartRow {
        part: partno.to_owned(),
        bodypart: None,
        bytes: raw.len() as u32,
        lines: count_lines(raw),
    });
    let anchor = format!("{}.rfc822", partno);
    flat.parts.push(PartRow {
        part: anchor.clone(),
        bodypart: None,
        bytes: raw.len() as u32,
        lines: 0,
    });
    add_header_rows(flat, &anchor, &envelope.header);

    let (envelope_type, _) = envelope.content_type();
    if "multipart" == envelope_type {
        flatten_children(flat, partno, envelope);
    } else {
        flatten_leaf_content(
            flat,
            &child_part_number(partno, 0),
            envelope,
            false,
        );
    }
}

/// Emits the part_numbers row (and bodypart content) for a leaf.
///
/// `headers_emitted` is false for the collapsed single-part case, where the
/// content row exists but the header already hangs off the parent anchor.
fn flatten_leaf_content(
    flat: &mut FlatMessage,
    partno: &str,
    part: &Part,
    _headers_emitted: bool,
) {
    let Body::Leaf { ref content } = part.body else {
        // A structured body reached through the collapsed-single-part
        // path; recurse normally instead.
        flatten_node(flat, partno, part);
        return;
    };

    let (typ, subtype) = part.content_type();
    let storage = if "text" == typ && "html" == subtype {
        Some(BodypartContent::html(content.clone()))
    } else if "text" == typ {
        Some(BodypartContent::text(content.clone()))
    } else {
        Some(BodypartContent::binary(content.clone()))
    };

    let bytes = content.len() as u32;
    let lines = count_lines(content);
    let bodypart = storage.map(|s| intern_bodypart(flat, s));
    flat.parts.push(PartRow {
        part: partno.to_owned(),
        bodypart,
        bytes,
        lines,
    });
}

fn add_header_rows(flat: &mut FlatMessage, partno: &str, header: &Header) {
    for (ix, field) in header.fields.iter().enumerate() {
        let position = ix as u32 + 1;
        if is_address_field(&field.name) {
            for (aix, address) in field.addresses.iter().enumerate() {
                flat.addresses.push(AddressRow {
                    part: partno.to_owned(),
                    position,
                    name: field.name.clone(),
                    number: aix as u32 + 1,
                    address: address.clone(),
                });
            }
        } else {
            flat.fields.push(FieldRow {
                part: partno.to_owned(),
                position,
                name: field.name.clone(),
                value: field.value.clone(),
            });
        }
    }
}

fn intern_bodypart(flat: &mut FlatMessage, content: BodypartContent) -> usize {
    if let Some(ix) =
        flat.bodyparts.iter().position(|b| b.hash == content.hash)
    {
        return ix;
    }

    flat.bodyparts.push(content);
    flat.bodyparts.len() - 1
}

impl BodypartContent {
    fn of(canonical: &[u8], text: Option<String>, data: Option<Vec<u8>>) -> Self {
        BodypartContent {
            hash: md5_hex(canonical),
            bytes: canonical.len() as u32,
            lines: count_lines(canonical),
            text,
            data,
        }
    }

    pub fn text(content: Vec<u8>) -> Self {
        let text = String::from_utf8_lossy(&content).into_owned();
        Self::of(&content, Some(text), None)
    }

    pub fn html(content: Vec<u8>) -> Self {
        let plain = derive_plaintext(&String::from_utf8_lossy(&content));
        Self::of(&content, Some(plain), Some(content.clone()))
    }

    pub fn binary(content: Vec<u8>) -> Self {
        Self::of(&content, None, Some(content.clone()))
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    let digest =
        openssl::hash::hash(openssl::hash::MessageDigest::md5(), data)
            .expect("MD5 unavailable in linked OpenSSL");
    let mut out = String::with_capacity(32);
    for byte in digest.iter() {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

fn count_lines(data: &[u8]) -> u32 {
    memchr::memchr_iter(b'\n', data).count() as u32
}

/// Derives a plaintext rendition of HTML for the text column.
///
/// Tags are dropped and the few entities that matter for search are
/// decoded. This is not a sanitiser; it only needs to produce searchable
/// text.
fn derive_plaintext(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {},
        }
    }

    out.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&nbsp;", " ")
}

// ==================== Internal date ====================

/// Derives the internal date for an injected message whose caller did not
/// supply one: the timestamp of the most recent `Received:` header (the
/// first one, since trace fields are prepended), else the `Date:` header,
/// else `None` (the caller substitutes the current time).
pub fn derive_internal_date(header: &Header) -> Option<DateTime<FixedOffset>> {
    for field in &header.fields {
        if field.name.eq_ignore_ascii_case("Received") {
            if let Some((_, date)) = field.value.rsplit_once(';') {
                if let Some(parsed) = parse_rfc2822_date(date) {
                    return Some(parsed);
                }
            }
        }
    }

    header
        .get("Date")
        .and_then(|f| parse_rfc2822_date(&f.value))
}

fn parse_rfc2822_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc2822(raw.trim()).ok()
}

/// Sample messages shared by the store and protocol tests.
#[cfg(test)]
pub(crate) mod testdata {
    pub(crate) const SIMPLE: &[u8] = b"\
Received: from mx.example.org by mail.example.org; \
Mon, 8 Jul 2024 10:00:00 +0000\r\n\
From: King Kong <kingkong@downtown.org>\r\n\
To: Joe Sixpack <joe@sixpack.org>, jane@sixpack.org\r\n\
Date: Sun, 7 Jul 2024 12:00:00 +0200\r\n\
Subject: Hello\r\n\
\r\n\
Hello, World!\r\n";

    pub(crate) const MULTIPART: &[u8] = b"\
From: sender@example.org\r\n\
To: recipient@example.org\r\n\
Subject: structured\r\n\
Content-Type: multipart/mixed; boundary=\"xyzzy\"\r\n\
\r\n\
--xyzzy\r\n\
Content-Type: text/plain\r\n\
\r\n\
part one\r\n\
--xyzzy\r\n\
Content-Type: application/octet-stream\r\n\
\r\n\
\x00\x01\x02\r\n\
--xyzzy--\r\n";
}

#[cfg(test)]
mod test {
    use super::testdata::{MULTIPART, SIMPLE};
    use super::*;

    #[test]
    fn parse_simple() {
        let message = Message::parse(SIMPLE).unwrap();
        assert_eq!(SIMPLE.len() as u32, message.rfc822_size);
        assert_eq!(5, message.top.header.fields.len());
        assert_eq!(
            "Hello",
            message.top.header.get("subject").unwrap().value,
        );

        let to = message.top.header.get("To").unwrap();
        assert_eq!(2, to.addresses.len());
        assert_eq!("joe", to.addresses[0].localpart);
        assert_eq!(Some("Joe Sixpack"), to.addresses[0].name.as_deref());
        assert_eq!("jane", to.addresses[1].localpart);
        assert_eq!(None, to.addresses[1].name);

        let Body::Leaf { ref content } = message.top.body else {
            panic!("not a leaf");
        };
        assert_eq!(b"Hello, World!\r\n".to_vec(), *content);
    }

    #[test]
    fn parse_multipart() {
        let message = Message::parse(MULTIPART).unwrap();
        let Body::Multipart { ref children, .. } = message.top.body else {
            panic!("not multipart");
        };
        assert_eq!(2, children.len());

        let Body::Leaf { ref content } = children[0].body else {
            panic!("child 0 not a leaf");
        };
        assert_eq!(b"part one".to_vec(), *content);
        assert_eq!(("application".to_owned(), "octet-stream".to_owned()),
                   children[1].content_type());
    }

    #[test]
    fn flatten_single_part() {
        let flat = Message::parse(SIMPLE).unwrap().flatten();

        // The anchor plus the collapsed part 1.
        assert_eq!(2, flat.parts.len());
        assert_eq!("", flat.parts[0].part);
        assert_eq!(None, flat.parts[0].bodypart);
        assert_eq!("1", flat.parts[1].part);
        assert_eq!(Some(0), flat.parts[1].bodypart);

        // No duplicated header links for the collapsed child.
        assert!(flat.fields.iter().all(|f| f.part.is_empty()));
        assert!(flat.addresses.iter().all(|a| a.part.is_empty()));

        // From (1 address) + To (2 addresses).
        assert_eq!(3, flat.addresses.len());
        let to_rows: Vec<_> = flat
            .addresses
            .iter()
            .filter(|a| "To" == a.name)
            .collect();
        assert_eq!(vec![1, 2], to_rows.iter().map(|a| a.number)
                   .collect::<Vec<_>>());
        // Both To rows share the field's position.
        assert_eq!(to_rows[0].position, to_rows[1].position);

        // Non-address fields keep their ordinals.
        let positions: Vec<(u32, &str)> = flat
            .fields
            .iter()
            .map(|f| (f.position, f.name.as_str()))
            .collect();
        assert_eq!(
            vec![(1, "Received"), (4, "Date"), (5, "Subject")],
            positions,
        );
    }

    #[test]
    fn flatten_multipart() {
        let flat = Message::parse(MULTIPART).unwrap().flatten();

        let partnos: Vec<&str> =
            flat.parts.iter().map(|p| p.part.as_str()).collect();
        assert_eq!(vec!["", "1", "2"], partnos);

        // text/plain stored as text, binary as data.
        let text_bp = &flat.bodyparts[flat.parts[1].bodypart.unwrap()];
        assert_eq!(Some("part one"), text_bp.text.as_deref());
        assert_eq!(None, text_bp.data);

        let bin_bp = &flat.bodyparts[flat.parts[2].bodypart.unwrap()];
        assert_eq!(None, bin_bp.text);
        assert_eq!(Some(b"\x00\x01\x02".to_vec()), bin_bp.data);
    }

    #[test]
    fn flatten_rfc822() {
        let mut outer = Vec::new();
        outer.extend_from_slice(
            b"From: outer@example.org\r\n\
              Subject: fwd\r\n\
              Content-Type: multipart/mixed; boundary=bb\r\n\
              \r\n\
              --bb\r\n\
              Content-Type: message/rfc822\r\n\
              \r\n",
        );
        outer.extend_from_slice(SIMPLE);
        outer.extend_from_slice(b"\r\n--bb--\r\n");

        let flat = Message::parse(&outer).unwrap().flatten();
        let partnos: Vec<&str> =
            flat.parts.iter().map(|p| p.part.as_str()).collect();
        assert_eq!(vec!["", "1", "1.rfc822", "1.1"], partnos);

        // The embedded message's header hangs off the .rfc822 anchor.
        assert!(flat
            .fields
            .iter()
            .any(|f| "1.rfc822" == f.part && "Subject" == f.name));
    }

    #[test]
    fn identical_parts_share_hash() {
        let raw = b"\
From: a@b.c\r\n\
Content-Type: multipart/mixed; boundary=q\r\n\
\r\n\
--q\r\n\
Content-Type: text/plain\r\n\
\r\n\
same content\r\n\
--q\r\n\
Content-Type: text/plain\r\n\
\r\n\
same content\r\n\
--q--\r\n";
        let flat = Message::parse(raw).unwrap().flatten();
        assert_eq!(1, flat.bodyparts.len());
        assert_eq!(flat.parts[1].bodypart, flat.parts[2].bodypart);
    }

    #[test]
    fn html_stores_both_forms() {
        let content = b"<p>Hello &amp; goodbye</p>".to_vec();
        let bp = BodypartContent::html(content.clone());
        assert_eq!(Some("Hello & goodbye"), bp.text.as_deref());
        assert_eq!(Some(content), bp.data);
    }

    #[test]
    fn md5_is_hex_of_content() {
        // Standard MD5 test vector.
        assert_eq!("900150983cd24fb0d6963f7d28e17f72", md5_hex(b"abc"));
    }

    #[test]
    fn internal_date_prefers_received() {
        let message = Message::parse(SIMPLE).unwrap();
        let date = derive_internal_date(&message.top.header).unwrap();
        assert_eq!(
            Utc.with_ymd_and_hms(2024, 7, 8, 10, 0, 0).unwrap(),
            date.with_timezone(&Utc),
        );
    }

    #[test]
    fn internal_date_falls_back_to_date() {
        let raw = b"\
From: a@b.c\r\n\
Date: Sun, 7 Jul 2024 12:00:00 +0200\r\n\
\r\n\
body\r\n";
        let message = Message::parse(raw).unwrap();
        let date = derive_internal_date(&message.top.header).unwrap();
        assert_eq!(
            Utc.with_ymd_and_hms(2024, 7, 7, 10, 0, 0).unwrap(),
            date.with_timezone(&Utc),
        );
    }

    #[test]
    fn internal_date_absent() {
        let raw = b"From: a@b.c\r\n\r\nbody\r\n";
        let message = Message::parse(raw).unwrap();
        assert_eq!(None, derive_internal_date(&message.top.header));
    }

    #[test]
    fn address_cache_key_cases() {
        let a = Address {
            name: Some("N".to_owned()),
            localpart: "Joe".to_owned(),
            domain: "Example.ORG".to_owned(),
        };
        let b = Address {
            name: Some("N".to_owned()),
            localpart: "Joe".to_owned(),
            domain: "example.org".to_owned(),
        };
        let c = Address {
            name: Some("N".to_owned()),
            localpart: "joe".to_owned(),
            domain: "example.org".to_owned(),
        };
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
    }
}
