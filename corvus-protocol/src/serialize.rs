//! Record serializer: documents to the typed textual record format.
//!
//! Field content is `name:value` pairs joined by commas, with the class
//! name (when present) hoisted to a `ClassName@` prefix of the whole
//! result. Record metadata never appears as field content.

use crate::value::{Document, Value};
use bytes::Bytes;

/// Serializes a document and returns the wire bytes of its content.
pub fn encode_record(doc: &Document) -> Bytes {
    Bytes::from(serialize_document(doc))
}

/// Serializes a top-level document.
pub fn serialize_document(doc: &Document) -> String {
    let mut out = String::new();
    write_document(&mut out, doc);
    out
}

fn write_document(out: &mut String, doc: &Document) {
    if let Some(class) = doc.class() {
        if !class.is_empty() {
            out.push_str(class);
            out.push('@');
        }
    }

    let mut first = true;
    for (name, value) in doc.fields() {
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(name);
        out.push(':');
        write_value(out, value);
    }
}

fn write_map(out: &mut String, entries: &[(String, Value)]) {
    let mut first = true;
    for (name, value) in entries {
        if !first {
            out.push(',');
        }
        first = false;
        out.push('"');
        out.push_str(name);
        out.push('"');
        out.push(':');
        write_value(out, value);
    }
}

/// Serializes a single value according to its shape.
///
/// Unsupported content serializes to the empty string rather than
/// failing: `Null`, and resolved records without an assigned id, both
/// degrade this way. The wire format has no null literal.
///
/// Floats render in their shortest decimal form. Non-finite values and
/// magnitudes that render in exponent notation (`NaN`, `1e300`) fall
/// outside the grammar and do not re-read.
pub fn serialize_value(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Float(x) => {
            let rendered = x.to_string();
            let float_marker = rendered.contains('.');
            out.push_str(&rendered);
            // Whole-valued floats render without a decimal point and
            // re-read as integers; kept for wire compatibility.
            if float_marker {
                out.push('f');
            }
        }
        Value::String(s) if is_hash_like(s) => {
            out.push_str("\"\"");
            write_escaped(out, s, '"');
            out.push_str("\"\"");
        }
        Value::String(s) => {
            out.push('\'');
            write_escaped(out, s, '\'');
            out.push('\'');
        }
        Value::DateTime(dt) => {
            out.push_str(&dt.timestamp_millis().to_string());
            out.push('t');
        }
        Value::Link(rid) => out.push_str(&rid.to_string()),
        Value::Record(record) => {
            if let Some(rid) = record.read().rid() {
                out.push_str(&rid.to_string());
            }
        }
        Value::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Embedded(doc) => {
            out.push('(');
            write_document(out, doc);
            out.push(')');
        }
        Value::Map(entries) => {
            out.push('{');
            write_map(out, entries);
            out.push('}');
        }
    }
}

fn write_escaped(out: &mut String, s: &str, quote: char) {
    for c in s.chars() {
        if c == '\\' || c == quote {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Fixed-length hexadecimal hash shape (e.g. an MD5 digest), which the
/// wire format wraps in doubled quotes.
fn is_hash_like(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rid::RecordId;

    #[test]
    fn test_class_hoist() {
        let doc = Document::new()
            .with_class("Person")
            .with_field("name", "Ann")
            .with_field("age", 30i64);
        assert_eq!(serialize_document(&doc), "Person@name:'Ann',age:30");
    }

    #[test]
    fn test_no_class_no_trailing_separator() {
        let doc = Document::new()
            .with_field("a", 1i64)
            .with_field("b", 2i64);
        assert_eq!(serialize_document(&doc), "a:1,b:2");
    }

    #[test]
    fn test_string_list() {
        let doc = Document::new().with_field(
            "tags",
            Value::List(vec![Value::from("a"), Value::from("b")]),
        );
        assert_eq!(serialize_document(&doc), "tags:['a','b']");
    }

    #[test]
    fn test_string_escaping() {
        assert_eq!(
            serialize_value(&Value::from("it's a \\ test")),
            r"'it\'s a \\ test'"
        );
    }

    #[test]
    fn test_hash_string_doubled_quotes() {
        let hash = "d41d8cd98f00b204e9800998ecf8427e";
        assert_eq!(
            serialize_value(&Value::from(hash)),
            format!("\"\"{hash}\"\"")
        );
        // One character short of a hash: ordinary string.
        assert_eq!(
            serialize_value(&Value::from("d41d8cd98f00b204e9800998ecf8427")),
            "'d41d8cd98f00b204e9800998ecf8427'"
        );
    }

    #[test]
    fn test_float_marker() {
        assert_eq!(serialize_value(&Value::Float(1.5)), "1.5f");
        // Whole-valued floats render without the marker.
        assert_eq!(serialize_value(&Value::Float(3.0)), "3");
    }

    #[test]
    fn test_datetime_marker() {
        let dt = Document::datetime_from_millis(1_400_000_000_000).unwrap();
        assert_eq!(serialize_value(&Value::DateTime(dt)), "1400000000000t");
    }

    #[test]
    fn test_link_unquoted() {
        let doc = Document::new().with_field("friend", RecordId::new(5, 12));
        assert_eq!(serialize_document(&doc), "friend:#5:12");
    }

    #[test]
    fn test_embedded_document_parenthesized() {
        let inner = Document::new()
            .with_class("Address")
            .with_field("city", "Oslo");
        let doc = Document::new().with_field("home", Value::Embedded(inner));
        assert_eq!(serialize_document(&doc), "home:(Address@city:'Oslo')");
    }

    #[test]
    fn test_map_braced_with_quoted_keys() {
        let doc = Document::new().with_field(
            "meta",
            Value::Map(vec![
                ("k".to_string(), Value::Int(1)),
                ("s".to_string(), Value::from("x")),
            ]),
        );
        assert_eq!(serialize_document(&doc), "meta:{\"k\":1,\"s\":'x'}");
    }

    #[test]
    fn test_embedded_inside_list() {
        let inner = Document::new().with_field("n", 1i64);
        let doc = Document::new().with_field(
            "items",
            Value::List(vec![Value::Embedded(inner), Value::Int(2)]),
        );
        assert_eq!(serialize_document(&doc), "items:[(n:1),2]");
    }

    #[test]
    fn test_null_serializes_empty() {
        let doc = Document::new()
            .with_field("a", Value::Null)
            .with_field("b", 1i64);
        assert_eq!(serialize_document(&doc), "a:,b:1");
    }

    #[test]
    fn test_metadata_excluded() {
        let mut doc = Document::new().with_class("Person").with_field("n", 1i64);
        doc.set_rid(RecordId::new(1, 2));
        doc.set_version(7);
        assert_eq!(serialize_document(&doc), "Person@n:1");
    }

    #[test]
    fn test_bool_literals() {
        let doc = Document::new()
            .with_field("yes", true)
            .with_field("no", false);
        assert_eq!(serialize_document(&doc), "yes:true,no:false");
    }
}
