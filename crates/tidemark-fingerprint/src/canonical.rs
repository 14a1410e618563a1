//! Canonical byte encoding of JSON values.
//!
//! The encoding is independent of any serializer's formatting choices:
//!
//! | value   | bytes                                                      |
//! |---------|------------------------------------------------------------|
//! | null    | `N`                                                        |
//! | boolean | `T` or `F`                                                 |
//! | integer | `I`, u64 BE length, decimal digits (with leading `-`)      |
//! | float   | `D`, 8 bytes of IEEE-754 bits, BE                          |
//! | string  | `S`, u64 BE length, UTF-8 bytes                            |
//! | array   | `A`, u64 BE count, elements in order                       |
//! | object  | `M`, u64 BE count, then `key string, value` sorted by key  |
//!
//! Object keys are sorted by their UTF-8 bytes. `-0.0` encodes as `0.0` and
//! every NaN as the canonical quiet NaN.

use serde_json::{Map, Number, Value};

/// Prepended to every encoding so a future format change cannot collide.
pub const ENCODING_VERSION: &[u8] = b"tidemark-canonical-v1\0";

const TAG_NULL: u8 = b'N';
const TAG_TRUE: u8 = b'T';
const TAG_FALSE: u8 = b'F';
const TAG_INT: u8 = b'I';
const TAG_FLOAT: u8 = b'D';
const TAG_STR: u8 = b'S';
const TAG_ARRAY: u8 = b'A';
const TAG_MAP: u8 = b'M';

const CANONICAL_NAN: u64 = 0x7ff8_0000_0000_0000;

/// Encode `value`, omitting `exclude` keys from the top-level object.
pub fn encode(value: &Value, exclude: &[&str]) -> Vec<u8> {
  let mut out = Vec::with_capacity(256);
  out.extend_from_slice(ENCODING_VERSION);
  match value {
    Value::Object(map) => encode_map(map, exclude, &mut out),
    other => encode_value(other, &mut out),
  }
  out
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
  match value {
    Value::Null => out.push(TAG_NULL),
    Value::Bool(true) => out.push(TAG_TRUE),
    Value::Bool(false) => out.push(TAG_FALSE),
    Value::Number(n) => encode_number(n, out),
    Value::String(s) => {
      out.push(TAG_STR);
      encode_bytes(s.as_bytes(), out);
    }
    Value::Array(items) => {
      out.push(TAG_ARRAY);
      encode_len(items.len(), out);
      for item in items {
        encode_value(item, out);
      }
    }
    Value::Object(map) => encode_map(map, &[], out),
  }
}

fn encode_map(map: &Map<String, Value>, exclude: &[&str], out: &mut Vec<u8>) {
  let mut entries: Vec<(&String, &Value)> = map
    .iter()
    .filter(|(k, _)| !exclude.contains(&k.as_str()))
    .collect();
  entries.sort_unstable_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));

  out.push(TAG_MAP);
  encode_len(entries.len(), out);
  for (key, value) in entries {
    encode_bytes(key.as_bytes(), out);
    encode_value(value, out);
  }
}

fn encode_number(n: &Number, out: &mut Vec<u8>) {
  if let Some(i) = n.as_i64() {
    out.push(TAG_INT);
    encode_bytes(i.to_string().as_bytes(), out);
  } else if let Some(u) = n.as_u64() {
    out.push(TAG_INT);
    encode_bytes(u.to_string().as_bytes(), out);
  } else {
    let f = n.as_f64().unwrap_or(f64::NAN);
    out.push(TAG_FLOAT);
    out.extend_from_slice(&float_bits(f).to_be_bytes());
  }
}

fn float_bits(f: f64) -> u64 {
  if f.is_nan() {
    CANONICAL_NAN
  } else if f == 0.0 {
    0
  } else {
    f.to_bits()
  }
}

fn encode_len(len: usize, out: &mut Vec<u8>) {
  out.extend_from_slice(&(len as u64).to_be_bytes());
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
  encode_len(bytes.len(), out);
  out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn body(value: &Value) -> Vec<u8> { encode(value, &[])[ENCODING_VERSION.len()..].to_vec() }

  #[test]
  fn scalars_have_explicit_tags() {
    assert_eq!(body(&json!(null)), b"N");
    assert_eq!(body(&json!(true)), b"T");
    assert_eq!(body(&json!(false)), b"F");

    let mut expected = vec![b'S'];
    expected.extend_from_slice(&2u64.to_be_bytes());
    expected.extend_from_slice(b"hi");
    assert_eq!(body(&json!("hi")), expected);

    let mut expected = vec![b'I'];
    expected.extend_from_slice(&3u64.to_be_bytes());
    expected.extend_from_slice(b"-42");
    assert_eq!(body(&json!(-42)), expected);
  }

  #[test]
  fn floats_encode_as_bits() {
    let mut expected = vec![b'D'];
    expected.extend_from_slice(&1.5f64.to_bits().to_be_bytes());
    assert_eq!(body(&json!(1.5)), expected);

    assert_eq!(float_bits(-0.0), float_bits(0.0));
    assert_eq!(float_bits(f64::NAN), float_bits(-f64::NAN));
  }

  #[test]
  fn integer_and_float_do_not_collide() {
    assert_ne!(body(&json!(1)), body(&json!(1.0)));
  }

  #[test]
  fn string_and_number_do_not_collide() {
    assert_ne!(body(&json!("1")), body(&json!(1)));
  }

  #[test]
  fn key_order_is_irrelevant_but_array_order_is_not() {
    let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).unwrap();
    let b: Value = serde_json::from_str(r#"{"a": {"x": 3, "y": 2}, "b": 1}"#).unwrap();
    assert_eq!(encode(&a, &[]), encode(&b, &[]));

    assert_ne!(encode(&json!([1, 2]), &[]), encode(&json!([2, 1]), &[]));
  }

  #[test]
  fn exclusion_is_top_level_only() {
    let top = json!({ "value": 1, "run_id": "abc" });
    assert_eq!(encode(&top, &["run_id"]), encode(&json!({ "value": 1 }), &[]));

    let nested = json!({ "inner": { "run_id": "abc" } });
    let stripped = json!({ "inner": {} });
    assert_ne!(encode(&nested, &["run_id"]), encode(&stripped, &[]));
  }

  #[test]
  fn length_prefixes_prevent_concatenation_ambiguity() {
    assert_ne!(
      encode(&json!(["ab", "c"]), &[]),
      encode(&json!(["a", "bc"]), &[])
    );
  }
}
