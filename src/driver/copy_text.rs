//! Row encoding for `COPY ... FROM STDIN` in PostgreSQL's text format.
//!
//! Columns are tab separated, rows end with a newline, NULL is `\N`, and
//! backslash, tab, newline and carriage return inside values are escaped.

use bytes::{BufMut, BytesMut};

use crate::types::Value;

/// Append one encoded row to `buf`
pub fn encode_row(row: &[Value], buf: &mut BytesMut) {
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b'\t');
        }
        encode_value(value, buf);
    }
    buf.put_u8(b'\n');
}

fn encode_value(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Null => buf.put_slice(b"\\N"),
        Value::Bool(true) => buf.put_u8(b't'),
        Value::Bool(false) => buf.put_u8(b'f'),
        Value::Int(i) => buf.put_slice(i.to_string().as_bytes()),
        Value::Float(f) => {
            if f.is_nan() {
                buf.put_slice(b"NaN");
            } else if f.is_infinite() {
                let text: &[u8] = if *f > 0.0 { b"Infinity" } else { b"-Infinity" };
                buf.put_slice(text);
            } else {
                buf.put_slice(f.to_string().as_bytes());
            }
        }
        Value::Text(s) => escape_into(s.as_bytes(), buf),
        // bytea hex format; the leading backslash itself needs escaping
        Value::Bytes(b) => {
            buf.put_slice(b"\\\\x");
            buf.put_slice(hex::encode(b).as_bytes());
        }
        Value::Timestamp(ts) => {
            buf.put_slice(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string().as_bytes());
        }
    }
}

fn escape_into(raw: &[u8], buf: &mut BytesMut) {
    buf.reserve(raw.len());
    for &byte in raw {
        match byte {
            b'\\' => buf.put_slice(b"\\\\"),
            b'\t' => buf.put_slice(b"\\t"),
            b'\n' => buf.put_slice(b"\\n"),
            b'\r' => buf.put_slice(b"\\r"),
            other => buf.put_u8(other),
        }
    }
}
