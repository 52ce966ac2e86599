//! "NetworkTables Storage 3.0" text format.
//!
//! ```text
//! [NetworkTables Storage 3.0]
//! boolean "foo"=true
//! double "bar"=130000000.0
//! array string "names"="a","b\x3Dc"
//! raw "blob"=AAEC
//! ```
//!
//! Blank lines and lines starting with `;` or `#` are ignored. Lines that
//! fail to parse are reported through the warning callback and skipped.

use std::fmt::Write as _;
use std::fs;
use std::fs::File;
use std::io::BufRead;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::debug;

use crate::constants::PERSISTENT_HEADER;
use crate::errors::StorageError;
use crate::proto::Value;
use crate::utils::file_io::create_parent_dir_if_not_exist;

pub(crate) type NamedValue = (String, Arc<Value>);

/// Write the header and one line per value. RPC definitions are skipped.
pub(crate) fn write_entries<W: Write>(
    out: &mut W,
    entries: &[NamedValue],
) -> std::io::Result<()> {
    writeln!(out, "{PERSISTENT_HEADER}")?;
    let mut line = String::new();
    for (name, value) in entries {
        line.clear();
        let type_tok = match value.as_ref() {
            Value::Boolean(_) => "boolean",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Raw(_) => "raw",
            Value::BooleanArray(_) => "array boolean",
            Value::DoubleArray(_) => "array double",
            Value::StringArray(_) => "array string",
            Value::Rpc(_) => continue,
        };
        line.push_str(type_tok);
        line.push(' ');
        escape_string(&mut line, name);
        line.push('=');
        match value.as_ref() {
            Value::Boolean(v) => line.push_str(bool_str(*v)),
            Value::Double(v) => line.push_str(&format_double(*v)),
            Value::String(v) => escape_string(&mut line, v),
            Value::Raw(v) => line.push_str(&BASE64.encode(v)),
            Value::BooleanArray(v) => {
                let elems: Vec<&str> = v.iter().map(|b| bool_str(*b)).collect();
                line.push_str(&elems.join(","));
            }
            Value::DoubleArray(v) => {
                let elems: Vec<String> = v.iter().map(|d| format_double(*d)).collect();
                line.push_str(&elems.join(","));
            }
            Value::StringArray(v) => {
                for (i, s) in v.iter().enumerate() {
                    if i > 0 {
                        line.push(',');
                    }
                    escape_string(&mut line, s);
                }
            }
            Value::Rpc(_) => {}
        }
        writeln!(out, "{line}")?;
    }
    Ok(())
}

/// Parse a whole file. `warn` receives (1-based line number, message) for
/// every skipped line. A missing or wrong header is an error.
pub(crate) fn read_entries<R: BufRead>(
    input: R,
    warn: &mut dyn FnMut(usize, &str),
) -> Result<Vec<NamedValue>, StorageError> {
    let mut lines = input.lines();
    let mut line_num = 0;

    let mut header_ok = false;
    for line in lines.by_ref() {
        let line = line?;
        line_num += 1;
        let line = line.trim();
        if is_skippable(line) {
            continue;
        }
        header_ok = line == PERSISTENT_HEADER;
        break;
    }
    if !header_ok {
        warn(line_num.max(1), "header line mismatch, ignoring rest of file");
        return Err(StorageError::HeaderMismatch);
    }

    let mut entries = Vec::new();
    for line in lines {
        let line = line?;
        line_num += 1;
        let line = line.trim();
        if is_skippable(line) {
            continue;
        }
        match parse_line(line) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(msg) => warn(line_num, msg),
        }
    }
    Ok(entries)
}

/// Write `entries` to `path` by way of `<path>.tmp`, keeping the previous
/// file as `<path>.bak`. On failure the previous file stays in place.
pub(crate) fn save_atomic(
    path: &Path,
    entries: &[NamedValue],
) -> Result<(), StorageError> {
    let tmp = with_suffix(path, ".tmp");
    let bak = with_suffix(path, ".bak");
    create_parent_dir_if_not_exist(path)?;

    debug!(?path, count = entries.len(), "saving persistent file");
    let file = File::create(&tmp).map_err(|source| StorageError::PathError {
        path: tmp.clone(),
        message: "could not open file",
        source,
    })?;
    let mut writer = BufWriter::new(file);
    let written = write_entries(&mut writer, entries)
        .and_then(|_| writer.flush())
        .and_then(|_| writer.get_ref().sync_all());
    drop(writer);
    if let Err(source) = written {
        let _ = fs::remove_file(&tmp);
        return Err(StorageError::PathError {
            path: tmp,
            message: "error saving file",
            source,
        });
    }

    // backup failures are not fatal
    let _ = fs::remove_file(&bak);
    let _ = fs::rename(path, &bak);
    if let Err(source) = fs::rename(&tmp, path) {
        let _ = fs::rename(&bak, path);
        return Err(StorageError::PathError {
            path: path.to_path_buf(),
            message: "could not rename temp file to real file",
            source,
        });
    }
    Ok(())
}

fn with_suffix(
    path: &Path,
    suffix: &str,
) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn is_skippable(line: &str) -> bool {
    line.is_empty() || line.starts_with(';') || line.starts_with('#')
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

/// Shortest representation that parses back to the same value.
fn format_double(v: f64) -> String {
    format!("{v:?}")
}

fn parse_bool(tok: &str) -> Result<bool, &'static str> {
    match tok {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err("unrecognized boolean value, not 'true' or 'false'"),
    }
}

fn parse_double(tok: &str) -> Result<f64, &'static str> {
    tok.parse::<f64>().map_err(|_| "invalid double value")
}

fn trim_ws(s: &str) -> &str {
    s.trim_matches([' ', '\t'])
}

fn trim_ws_start(s: &str) -> &str {
    s.trim_start_matches([' ', '\t'])
}

/// One `<type> "<name>"=<value>` line. `Ok(None)` for lines that parse but
/// carry nothing to load (empty name).
fn parse_line(line: &str) -> Result<Option<NamedValue>, &'static str> {
    let (type_tok, rest) = line.split_once(' ').unwrap_or((line, ""));
    let (kind, rest) = match type_tok {
        "boolean" | "double" | "string" | "raw" => (type_tok, rest),
        "array" => {
            let (elem_tok, rest) = rest.split_once(' ').unwrap_or((rest, ""));
            match elem_tok {
                "boolean" => ("array boolean", rest),
                "double" => ("array double", rest),
                "string" => ("array string", rest),
                _ => return Err("unrecognized type"),
            }
        }
        _ => return Err("unrecognized type"),
    };

    let (name, rest) = quoted(rest, "missing name", "unterminated name string")?;

    let rest = trim_ws_start(rest);
    let Some(rest) = rest.strip_prefix('=') else {
        return Err("expected = after name");
    };
    let rest = trim_ws_start(rest);

    let value = match kind {
        "boolean" => Value::Boolean(parse_bool(rest)?),
        "double" => Value::Double(parse_double(rest)?),
        "string" => Value::String(quoted(rest, "missing string value", "unterminated string value")?.0),
        "raw" => Value::Raw(BASE64.decode(rest).map_err(|_| "invalid base64 value")?),
        "array boolean" => Value::BooleanArray(
            split_elems(rest)
                .map(parse_bool)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        "array double" => Value::DoubleArray(
            split_elems(rest)
                .map(parse_double)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        _ => Value::StringArray(parse_string_array(rest)?),
    };

    if name.is_empty() {
        return Ok(None);
    }
    Ok(Some((name, Arc::new(value))))
}

fn split_elems(s: &str) -> impl Iterator<Item = &str> {
    let s = if s.is_empty() { None } else { Some(s) };
    s.into_iter().flat_map(|s| s.split(',')).map(trim_ws)
}

fn parse_string_array(mut rest: &str) -> Result<Vec<String>, &'static str> {
    let mut out = Vec::new();
    while !rest.is_empty() {
        let (elem, after) = quoted(rest, "missing string value", "unterminated string value")?;
        out.push(elem);
        rest = trim_ws_start(after);
        if rest.is_empty() {
            break;
        }
        let Some(after_comma) = rest.strip_prefix(',') else {
            return Err("expected comma between strings");
        };
        rest = trim_ws_start(after_comma);
    }
    Ok(out)
}

/// Quote `s`, escaping backslash, quote, tab, newline, `=` and every byte
/// outside printable ASCII.
pub(crate) fn escape_string(
    out: &mut String,
    s: &str,
) {
    out.push('"');
    for b in s.bytes() {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\t' => out.push_str("\\t"),
            b'\n' => out.push_str("\\n"),
            b'"' => out.push_str("\\\""),
            b'=' => out.push_str("\\x3D"),
            0x20..=0x7E => out.push(b as char),
            _ => {
                let _ = write!(out, "\\x{b:02X}");
            }
        }
    }
    out.push('"');
}

/// Split off a leading quoted token (quotes included).
///
/// `Ok(None)` when `s` does not start with a quote, `Err(())` when the
/// closing quote is missing.
pub(crate) fn read_string_token(s: &str) -> Result<Option<(&str, &str)>, ()> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'"') {
        return Ok(None);
    }
    let mut pos = 1;
    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => pos += 2,
            b'"' => return Ok(Some(s.split_at(pos + 1))),
            _ => pos += 1,
        }
    }
    Err(())
}

fn quoted<'a>(
    s: &'a str,
    missing: &'static str,
    unterminated: &'static str,
) -> Result<(String, &'a str), &'static str> {
    match read_string_token(s) {
        Ok(Some((tok, rest))) => Ok((unescape_string(tok), rest)),
        Ok(None) => Err(missing),
        Err(()) => Err(unterminated),
    }
}

/// Decode a quoted token produced by [`read_string_token`]. Unknown escapes
/// yield the escaped character; invalid UTF-8 is replaced.
pub(crate) fn unescape_string(tok: &str) -> String {
    let inner = &tok.as_bytes()[1..tok.len() - 1];
    let mut out = Vec::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        let b = inner[i];
        i += 1;
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let Some(&esc) = inner.get(i) else {
            break;
        };
        i += 1;
        match esc {
            b't' => out.push(b'\t'),
            b'n' => out.push(b'\n'),
            b'x' => {
                let mut ch: Option<u8> = None;
                for _ in 0..2 {
                    match inner.get(i).and_then(|c| (*c as char).to_digit(16)) {
                        Some(d) => {
                            ch = Some(ch.unwrap_or(0) << 4 | d as u8);
                            i += 1;
                        }
                        None => break,
                    }
                }
                out.push(ch.unwrap_or(b'x'));
            }
            other => out.push(other),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
