//! PostgreSQL `COPY ... FROM STDIN` text-format encoding.

use bytes::{BufMut, BytesMut};

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a destination table name. `schema.table` is split on the first dot
/// and each part quoted separately.
pub fn qualify_table(name: &str) -> String {
    match name.split_once('.') {
        Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
            format!("{}.{}", quote_ident(schema), quote_ident(table))
        }
        _ => quote_ident(name),
    }
}

/// Build the COPY statement for `table` and `columns`.
pub fn copy_statement(table: &str, columns: &[String]) -> String {
    let col_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
        qualify_table(table),
        col_list
    )
}

/// Append one row as a COPY text line: tab separated, `\N` for NULL,
/// terminated by a newline.
pub fn encode_row(buf: &mut BytesMut, row: &[Option<Vec<u8>>]) {
    for (i, cell) in row.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b'\t');
        }
        match cell {
            None => buf.put_slice(b"\\N"),
            Some(bytes) => escape_copy_bytes(buf, bytes),
        }
    }
    buf.put_u8(b'\n');
}

/// Escape backslash, tab, newline and carriage return. Works on raw bytes so
/// non-UTF-8 cells pass through untouched.
pub fn escape_copy_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.reserve(value.len());
    let mut start = 0;
    for (i, &b) in value.iter().enumerate() {
        let escaped: &[u8] = match b {
            b'\\' => b"\\\\",
            b'\t' => b"\\t",
            b'\n' => b"\\n",
            b'\r' => b"\\r",
            _ => continue,
        };
        buf.put_slice(&value[start..i]);
        buf.put_slice(escaped);
        start = i + 1;
    }
    buf.put_slice(&value[start..]);
}
