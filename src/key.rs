//! Structural query keys and their canonical hashes.
//!
//! A [`QueryKey`] is an ordered list of [`KeyPart`] values. Two keys are the
//! same cache entry iff they are structurally equal, which is exactly when
//! their canonical hashes are equal.
//!
//! ```ignore
//! let key = query_key!["todos", { "page" => 1 }];
//! assert_eq!(key.hash(), r#"["todos",{"page":1}]"#);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One element of a query key.
///
/// Floats compare by their canonical form: `-0.0` equals `0.0` and every NaN
/// equals every other NaN, matching their hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Str(String),
  List(Vec<KeyPart>),
  Map(BTreeMap<String, KeyPart>),
}

impl KeyPart {
  /// Append the canonical encoding of this part to `out`.
  fn write_canonical(&self, out: &mut String) {
    match self {
      KeyPart::Null => out.push_str("null"),
      KeyPart::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
      KeyPart::Int(n) => out.push_str(&n.to_string()),
      // Debug keeps the fractional part so 1.0 never collides with 1
      KeyPart::Float(f) => out.push_str(&format!("{:?}", canonical_float(*f))),
      KeyPart::Str(s) => write_quoted(s, out),
      KeyPart::List(items) => {
        out.push('[');
        for (i, item) in items.iter().enumerate() {
          if i > 0 {
            out.push(',');
          }
          item.write_canonical(out);
        }
        out.push(']');
      }
      KeyPart::Map(map) => {
        out.push('{');
        for (i, (k, v)) in map.iter().enumerate() {
          if i > 0 {
            out.push(',');
          }
          write_quoted(k, out);
          out.push(':');
          v.write_canonical(out);
        }
        out.push('}');
      }
    }
  }

  /// Integer view of this part, used by page-param arithmetic.
  pub fn as_i64(&self) -> Option<i64> {
    match self {
      KeyPart::Int(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      KeyPart::Str(s) => Some(s),
      _ => None,
    }
  }
}

fn canonical_float(f: f64) -> f64 {
  if f == 0.0 {
    0.0
  } else if f.is_nan() {
    f64::NAN
  } else {
    f
  }
}

impl PartialEq for KeyPart {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (KeyPart::Null, KeyPart::Null) => true,
      (KeyPart::Bool(a), KeyPart::Bool(b)) => a == b,
      (KeyPart::Int(a), KeyPart::Int(b)) => a == b,
      (KeyPart::Float(a), KeyPart::Float(b)) => canonical_float(*a).to_bits() == canonical_float(*b).to_bits(),
      (KeyPart::Str(a), KeyPart::Str(b)) => a == b,
      (KeyPart::List(a), KeyPart::List(b)) => a == b,
      (KeyPart::Map(a), KeyPart::Map(b)) => a == b,
      _ => false,
    }
  }
}

impl Eq for KeyPart {}

fn write_quoted(s: &str, out: &mut String) {
  // serde_json escaping gives a stable, unambiguous quoted form
  match serde_json::to_string(s) {
    Ok(quoted) => out.push_str(&quoted),
    Err(_) => {
      out.push('"');
      out.push_str(s);
      out.push('"');
    }
  }
}

impl From<&str> for KeyPart {
  fn from(value: &str) -> Self {
    KeyPart::Str(value.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(value: String) -> Self {
    KeyPart::Str(value)
  }
}

impl From<bool> for KeyPart {
  fn from(value: bool) -> Self {
    KeyPart::Bool(value)
  }
}

impl From<f64> for KeyPart {
  fn from(value: f64) -> Self {
    KeyPart::Float(value)
  }
}

macro_rules! int_key_part {
  ($($t:ty),*) => {
    $(
      impl From<$t> for KeyPart {
        fn from(value: $t) -> Self {
          KeyPart::Int(value as i64)
        }
      }
    )*
  };
}

int_key_part!(i8, i16, i32, i64, u8, u16, u32, usize);

impl<P: Into<KeyPart>> From<Vec<P>> for KeyPart {
  fn from(value: Vec<P>) -> Self {
    KeyPart::List(value.into_iter().map(Into::into).collect())
  }
}

impl<P: Into<KeyPart>> From<Option<P>> for KeyPart {
  fn from(value: Option<P>) -> Self {
    value.map(Into::into).unwrap_or(KeyPart::Null)
  }
}

impl<K: Into<String>, P: Into<KeyPart>> From<BTreeMap<K, P>> for KeyPart {
  fn from(value: BTreeMap<K, P>) -> Self {
    KeyPart::Map(
      value
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

impl fmt::Display for KeyPart {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut out = String::new();
    self.write_canonical(&mut out);
    f.write_str(&out)
  }
}

/// An ordered, structural cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
  pub fn new(parts: Vec<KeyPart>) -> Self {
    Self(parts)
  }

  /// The empty key. As a filter it matches every query.
  pub fn empty() -> Self {
    Self(Vec::new())
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Append a part, returning the extended key.
  pub fn push(mut self, part: impl Into<KeyPart>) -> Self {
    self.0.push(part.into());
    self
  }

  /// Canonical string form used as the cache lookup key.
  ///
  /// Strings are JSON-quoted, numbers and booleans stringified, and map
  /// entries emitted in lexicographic key order.
  pub fn hash(&self) -> String {
    let mut out = String::new();
    out.push('[');
    for (i, part) in self.0.iter().enumerate() {
      if i > 0 {
        out.push(',');
      }
      part.write_canonical(&mut out);
    }
    out.push(']');
    out
  }

  /// SHA-256 hex digest of [`QueryKey::hash`] for stable, fixed-length ids.
  pub fn digest(&self) -> String {
    digest_hash(&self.hash())
  }

  /// Whether this key matches `filter`: the filter is empty or a structural
  /// prefix of this key.
  pub fn matches(&self, filter: &QueryKey) -> bool {
    filter.0.len() <= self.0.len() && filter.0.iter().zip(&self.0).all(|(a, b)| a == b)
  }

  /// Whether this key is a prefix of `other`.
  pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
    other.matches(self)
  }
}

/// SHA-256 hex digest of an already canonicalized hash.
pub fn digest_hash(hash: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(hash.as_bytes());
  hex::encode(hasher.finalize())
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.hash())
  }
}

impl From<Vec<KeyPart>> for QueryKey {
  fn from(parts: Vec<KeyPart>) -> Self {
    Self(parts)
  }
}

impl<P: Into<KeyPart>, const N: usize> From<[P; N]> for QueryKey {
  fn from(parts: [P; N]) -> Self {
    Self(parts.into_iter().map(Into::into).collect())
  }
}

impl From<&str> for QueryKey {
  fn from(value: &str) -> Self {
    Self(vec![KeyPart::from(value)])
  }
}

/// Build a [`QueryKey`] from heterogeneous parts.
///
/// Map parts are written `{ "field" => value, ... }`.
#[macro_export]
macro_rules! query_key {
  (@part { $($k:literal => $v:expr),* $(,)? }) => {{
    #[allow(unused_mut)]
    let mut map = ::std::collections::BTreeMap::<String, $crate::KeyPart>::new();
    $( map.insert($k.to_string(), $crate::KeyPart::from($v)); )*
    $crate::KeyPart::Map(map)
  }};
  (@part [ $($item:tt),* $(,)? ]) => {
    $crate::KeyPart::List(vec![ $( $crate::query_key!(@part $item) ),* ])
  };
  (@part $e:expr) => {
    $crate::KeyPart::from($e)
  };
  () => {
    $crate::QueryKey::empty()
  };
  ($($part:tt),+ $(,)?) => {
    $crate::QueryKey::new(vec![ $( $crate::query_key!(@part $part) ),+ ])
  };
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_hash_is_canonical() {
    let key = query_key!["todos", { "page" => 1, "done" => false }];
    assert_eq!(key.hash(), r#"["todos",{"done":false,"page":1}]"#);
  }

  #[test]
  fn test_equal_keys_hash_equal() {
    let a = query_key!["user", 7, ["a", true], { "z" => 1.5, "a" => "x" }];
    let b = query_key!["user", 7, ["a", true], { "a" => "x", "z" => 1.5 }];
    assert_eq!(a, b);
    assert_eq!(a.hash(), b.hash());
    assert_eq!(a.digest(), b.digest());
  }

  #[test]
  fn test_different_keys_hash_differently() {
    let keys = vec![
      query_key!["1"],
      query_key![1],
      query_key![1.0],
      query_key![true],
      query_key!["true"],
      query_key![["a", "b"]],
      query_key!["a", "b"],
      query_key![{ "a" => 1 }],
      query_key![{ "a" => "1" }],
      query_key!["a,b"],
      query_key![(KeyPart::Null)],
      query_key!["null"],
    ];

    let hashes: Vec<String> = keys.iter().map(QueryKey::hash).collect();
    for (i, a) in hashes.iter().enumerate() {
      for (j, b) in hashes.iter().enumerate() {
        if i != j {
          assert_ne!(a, b, "{} collides with {}", keys[i], keys[j]);
        }
      }
    }
  }

  #[test]
  fn test_float_equality_follows_hash() {
    let zero = query_key![0.0];
    let negative_zero = query_key![(KeyPart::Float(-0.0))];
    assert_eq!(zero, negative_zero);
    assert_eq!(zero.hash(), negative_zero.hash());

    let nan = query_key![(KeyPart::Float(f64::NAN))];
    let other_nan = query_key![(KeyPart::Float(-f64::NAN))];
    assert_eq!(nan, other_nan);
    assert_eq!(nan.hash(), other_nan.hash());

    assert_ne!(query_key![1.5], query_key![(KeyPart::Float(-1.5))]);
  }

  #[test]
  fn test_strings_are_escaped() {
    let key = query_key!["say \"hi\""];
    assert_eq!(key.hash(), r#"["say \"hi\""]"#);
  }

  #[test]
  fn test_prefix_matching() {
    let key = query_key!["todos", 1, { "filter" => "open" }];

    assert!(key.matches(&QueryKey::empty()));
    assert!(key.matches(&query_key!["todos"]));
    assert!(key.matches(&query_key!["todos", 1]));
    assert!(key.matches(&key.clone()));
    assert!(!key.matches(&query_key!["todo"]));
    assert!(!key.matches(&query_key!["todos", 2]));
    assert!(!query_key!["todos"].matches(&key));
    assert!(query_key!["todos"].is_prefix_of(&key));
  }

  #[test]
  fn test_serde_roundtrip_preserves_hash() {
    let key = query_key!["todos", 3, [1, 2], { "q" => "x" }];
    let json = serde_json::to_string(&key).unwrap();
    let back: QueryKey = serde_json::from_str(&json).unwrap();
    assert_eq!(back, key);
    assert_eq!(back.hash(), key.hash());
  }
}
