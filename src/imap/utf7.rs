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

//! RFC 3501 "modified UTF-7" for mailbox names.
//!
//! Mailbox names are Unicode internally and modified UTF-7 on the wire
//! (and in cluster notifications). Decoding is deliberately permissive:
//! direct characters in encoded form, unnecessary shifts, and missing
//! terminators are all accepted, since everything is normalised to UTF-8
//! internally and re-encoded on the way out anyway. RFC 3501 frowns on
//! such names but does not forbid accepting them.

use base64::alphabet;
use base64::engine::general_purpose::GeneralPurposeConfig;
use base64::engine::{DecodePaddingMode, Engine as _, GeneralPurpose};

const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::IMAP_MUTF7,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encodes a Unicode mailbox name into modified UTF-7.
pub fn imap_encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending = Vec::<u16>::new();

    for ch in name.chars() {
        if ('\x20'..='\x7e').contains(&ch) {
            flush(&mut out, &mut pending);
            if '&' == ch {
                out.push_str("&-");
            } else {
                out.push(ch);
            }
        } else {
            let mut units = [0u16; 2];
            pending.extend_from_slice(ch.encode_utf16(&mut units));
        }
    }

    flush(&mut out, &mut pending);
    out
}

fn flush(out: &mut String, pending: &mut Vec<u16>) {
    if pending.is_empty() {
        return;
    }

    let mut bytes = Vec::with_capacity(pending.len() * 2);
    for unit in pending.drain(..) {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }

    out.push('&');
    out.push_str(&B64.encode(&bytes));
    out.push('-');
}

/// Decodes a modified UTF-7 mailbox name into Unicode.
pub fn imap_decode(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = String::with_capacity(name.len());
    let mut ix = 0;

    while ix < bytes.len() {
        let ch = bytes[ix];
        if b'&' != ch {
            // Direct character (or raw 8-bit noise, passed through).
            let rest = &name[ix..];
            let c = rest.chars().next().expect("mid-boundary index");
            out.push(c);
            ix += c.len_utf8();
            continue;
        }

        ix += 1;
        let start = ix;
        while ix < bytes.len() && is_b64_char(bytes[ix]) {
            ix += 1;
        }

        if start == ix {
            // "&-" is a literal ampersand; a bare "&" is tolerated too.
            out.push('&');
        } else if let Ok(decoded) = B64.decode(&bytes[start..ix]) {
            let units: Vec<u16> = decoded
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            out.push_str(&String::from_utf16_lossy(&units));
        } else {
            // Not actually base64; keep the raw text rather than eat it.
            out.push('&');
            out.push_str(&name[start..ix]);
        }

        // The closing '-' is consumed if present, not required.
        if ix < bytes.len() && b'-' == bytes[ix] {
            ix += 1;
        }
    }

    out
}

fn is_b64_char(ch: u8) -> bool {
    matches!(ch, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b',')
}
