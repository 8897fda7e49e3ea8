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

//! Encoding and decoding of the binary `COPY FROM STDIN` stream.
//!
//! Layout per the PostgreSQL COPY BINARY format: an 11-byte signature,
//! 32-bit flags, 32-bit extension length, then one tuple per row (16-bit
//! field count, then per field a 32-bit byte length, or -1 for NULL,
//! followed by the bytes), terminated by a field count of -1.
//!
//! Integers are int8, booleans one byte, text raw UTF-8, and timestamps
//! microseconds since 2000-01-01 00:00:00 UTC as int8.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use chrono::prelude::*;

use super::driver::{CopyIn, DbError, Value};

const SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

/// Microseconds between the UNIX and PostgreSQL epochs.
const PG_EPOCH_OFFSET_US: i64 = 946_684_800_000_000;

pub struct CopyEncoder {
    table: &'static str,
    columns: &'static [&'static str],
    data: Vec<u8>,
    rows: u64,
}

impl CopyEncoder {
    pub fn new(table: &'static str, columns: &'static [&'static str]) -> Self {
        let mut data = Vec::with_capacity(256);
        data.extend_from_slice(SIGNATURE);
        data.extend_from_slice(&0u32.to_be_bytes()); // flags
        data.extend_from_slice(&0u32.to_be_bytes()); // extension length

        CopyEncoder {
            table,
            columns,
            data,
            rows: 0,
        }
    }

    pub fn row(&mut self, values: &[Value]) {
        debug_assert_eq!(self.columns.len(), values.len());

        self.data
            .extend_from_slice(&(values.len() as i16).to_be_bytes());
        for value in values {
            match *value {
                Value::Null => {
                    self.data.extend_from_slice(&(-1i32).to_be_bytes());
                },
                Value::Bool(v) => {
                    self.data.extend_from_slice(&1i32.to_be_bytes());
                    self.data.push(v as u8);
                },
                Value::Int(v) => {
                    self.data.extend_from_slice(&8i32.to_be_bytes());
                    self.data.extend_from_slice(&v.to_be_bytes());
                },
                Value::Text(ref v) => {
                    self.data
                        .extend_from_slice(&(v.len() as i32).to_be_bytes());
                    self.data.extend_from_slice(v.as_bytes());
                },
                Value::Bytes(ref v) => {
                    self.data
                        .extend_from_slice(&(v.len() as i32).to_be_bytes());
                    self.data.extend_from_slice(v);
                },
                Value::Timestamp(ts) => {
                    let us = ts.timestamp_micros() - PG_EPOCH_OFFSET_US;
                    self.data.extend_from_slice(&8i32.to_be_bytes());
                    self.data.extend_from_slice(&us.to_be_bytes());
                },
            }
        }

        self.rows += 1;
    }

    pub fn is_empty(&self) -> bool {
        0 == self.rows
    }

    pub fn finish(mut self) -> CopyIn {
        self.data.extend_from_slice(&(-1i16).to_be_bytes());
        CopyIn {
            table: self.table,
            columns: self.columns,
            data: self.data,
            rows: self.rows,
        }
    }
}

/// The column types a decoder expects, parallel to `CopyIn::columns`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Text,
    Bytes,
    Bool,
    Timestamp,
}

/// Decodes a binary COPY stream into rows, given the expected column types.
pub fn decode(
    copy: &CopyIn,
    types: &[ColumnType],
) -> Result<Vec<Vec<Value>>, DbError> {
    let mut data = copy.data.as_slice();
    let bad = |what: &str| DbError::Syntax(format!("bad COPY stream: {}", what));

    if !data.starts_with(SIGNATURE) {
        return Err(bad("signature"));
    }
    data = &data[SIGNATURE.len()..];
    let _flags = data.read_u32::<BigEndian>().map_err(|_| bad("flags"))?;
    let ext = data.read_u32::<BigEndian>().map_err(|_| bad("extension"))?;
    if data.len() < ext as usize {
        return Err(bad("extension length"));
    }
    data = &data[ext as usize..];

    let mut rows = Vec::new();
    loop {
        let nfields =
            data.read_i16::<BigEndian>().map_err(|_| bad("field count"))?;
        if -1 == nfields {
            break;
        }
        if nfields as usize != types.len() {
            return Err(bad("field count mismatch"));
        }

        let mut row = Vec::with_capacity(types.len());
        for &typ in types {
            let len = data
                .read_i32::<BigEndian>()
                .map_err(|_| bad("field length"))?;
            if -1 == len {
                row.push(Value::Null);
                continue;
            }

            let len = len as usize;
            if data.len() < len {
                return Err(bad("field bytes"));
            }
            let (field, rest) = data.split_at(len);
            data = rest;

            row.push(match typ {
                ColumnType::Int => {
                    if 8 != len {
                        return Err(bad("int width"));
                    }
                    Value::Int(BigEndian::read_i64(field))
                },
                ColumnType::Bool => {
                    if 1 != len {
                        return Err(bad("bool width"));
                    }
                    Value::Bool(0 != field[0])
                },
                ColumnType::Text => Value::Text(
                    String::from_utf8(field.to_vec())
                        .map_err(|_| bad("text encoding"))?,
                ),
                ColumnType::Bytes => Value::Bytes(field.to_vec()),
                ColumnType::Timestamp => {
                    if 8 != len {
                        return Err(bad("timestamp width"));
                    }
                    let us =
                        BigEndian::read_i64(field) + PG_EPOCH_OFFSET_US;
                    Value::Timestamp(
                        DateTime::from_timestamp_micros(us)
                            .ok_or_else(|| bad("timestamp range"))?,
                    )
                },
            });
        }

        rows.push(row);
    }

    Ok(rows)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut encoder =
            CopyEncoder::new("things", &["a", "b", "c", "d", "e"]);
        let when = Utc.with_ymd_and_hms(2024, 7, 8, 9, 10, 11).unwrap();
        encoder.row(&[
            Value::Int(42),
            Value::Text("plugh".to_owned()),
            Value::Null,
            Value::Bool(true),
            Value::Timestamp(when),
        ]);
        encoder.row(&[
            Value::Int(-1),
            Value::Text(String::new()),
            Value::Bytes(vec![0, 255, 3]),
            Value::Bool(false),
            Value::Timestamp(when),
        ]);

        let copy = encoder.finish();
        assert_eq!(2, copy.rows);

        let rows = decode(
            &copy,
            &[
                ColumnType::Int,
                ColumnType::Text,
                ColumnType::Bytes,
                ColumnType::Bool,
                ColumnType::Timestamp,
            ],
        )
        .unwrap();

        assert_eq!(2, rows.len());
        assert_eq!(Value::Int(42), rows[0][0]);
        assert_eq!(Value::Text("plugh".to_owned()), rows[0][1]);
        assert_eq!(Value::Null, rows[0][2]);
        assert_eq!(Value::Bool(true), rows[0][3]);
        assert_eq!(Value::Timestamp(when), rows[0][4]);
        assert_eq!(Value::Bytes(vec![0, 255, 3]), rows[1][2]);
    }

    #[test]
    fn decode_rejects_garbage() {
        let copy = CopyIn {
            table: "things",
            columns: &["a"],
            data: b"not a copy stream".to_vec(),
            rows: 0,
        };
        assert_matches!(
            Err(DbError::Syntax(..)),
            decode(&copy, &[ColumnType::Int]),
        );
    }
}
