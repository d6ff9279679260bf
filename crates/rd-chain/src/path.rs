//! Path grammar for addressing values inside nested bundles.
//!
//! ```text
//! path     := segments (':' segments)?
//! segments := segment ('.' segment)*
//! segment  := one or more characters other than '.' and ':'
//! ```
//!
//! In a bundle both halves address nested objects, so `a.b:c` and `a.b.c`
//! reach the same value. The colon is kept for display and for telling apart
//! where a namespace ends and a structured value begins.

use rd_types::{Bundle, ConfigError, OptError, OptResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// A parsed `namespace.path:value.path` address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortPath {
    port: Vec<String>,
    value: Vec<String>,
}

impl PortPath {
    pub fn parse(path: &str) -> OptResult<Self> {
        let (port, value) = match path.split_once(':') {
            Some((port, value)) => (port, Some(value)),
            None => (path, None),
        };
        if value.is_some_and(|v| v.contains(':')) {
            return Err(invalid(path, "at most one ':' is allowed"));
        }

        let port = segments(path, port)?;
        let value = match value {
            Some(value) => segments(path, value)?,
            None => Vec::new(),
        };
        Ok(Self { port, value })
    }

    /// Namespace part, before the colon.
    pub fn port(&self) -> &[String] {
        &self.port
    }

    /// Part inside the stored value, after the colon. Empty without a colon.
    pub fn value_path(&self) -> &[String] {
        &self.value
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.port.iter().chain(&self.value).map(String::as_str)
    }

    /// Read the value at this path.
    pub fn get<'a>(&self, bundle: &'a Bundle) -> OptResult<&'a Value> {
        let missing = || OptError::Path(format!("no value at '{self}'"));

        let mut segments = self.segments();
        let first = segments.next().ok_or_else(missing)?;
        let mut current = bundle.get(first).ok_or_else(missing)?;
        for segment in segments {
            current = current
                .as_object()
                .and_then(|object| object.get(segment))
                .ok_or_else(missing)?;
        }
        Ok(current)
    }

    /// Write `value` at this path, creating intermediate objects as needed.
    /// An existing value at the path is replaced.
    pub fn set(&self, bundle: &mut Bundle, value: Value) -> OptResult<()> {
        let segments: Vec<&str> = self.segments().collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(OptError::Path(format!("cannot write to empty path '{self}'")));
        };

        let mut current = bundle;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            current = match entry {
                Value::Object(object) => object,
                _ => {
                    return Err(OptError::Path(format!(
                        "cannot write '{self}': '{segment}' does not hold an object"
                    )))
                }
            };
        }
        current.insert(last.to_string(), value);
        Ok(())
    }
}

fn segments(path: &str, part: &str) -> OptResult<Vec<String>> {
    let segments: Vec<String> = part.split('.').map(str::to_string).collect();
    if segments.iter().any(String::is_empty) {
        return Err(invalid(path, "empty segment"));
    }
    Ok(segments)
}

fn invalid(path: &str, reason: &str) -> OptError {
    ConfigError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

impl FromStr for PortPath {
    type Err = OptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PortPath {
    type Error = OptError;

    fn try_from(path: String) -> Result<Self, Self::Error> {
        Self::parse(&path)
    }
}

impl From<PortPath> for String {
    fn from(path: PortPath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for PortPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.port.join("."))?;
        if !self.value.is_empty() {
            write!(f, ":{}", self.value.join("."))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle(value: Value) -> Bundle {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn parses_and_displays() {
        for path in ["x", "x.y", "a.b.c.d:e.f", "a:b"] {
            assert_eq!(PortPath::parse(path).unwrap().to_string(), path);
        }
        let path = PortPath::parse("a.b:c").unwrap();
        assert_eq!(path.port(), ["a", "b"]);
        assert_eq!(path.value_path(), ["c"]);
    }

    #[test]
    fn rejects_malformed_paths() {
        for path in ["", ".", "a.", ".a", "a..b", "a:", ":a", "a:b:c", "a:b.", "a.b:.c"] {
            let err = PortPath::parse(path).unwrap_err();
            assert!(err.is_config(), "{path:?} should be rejected, got {err}");
        }
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut target = Bundle::new();
        PortPath::parse("a.b.c.d:e.f")
            .unwrap()
            .set(&mut target, json!(2))
            .unwrap();
        assert_eq!(
            Value::Object(target),
            json!({"a": {"b": {"c": {"d": {"e": {"f": 2}}}}}})
        );
    }

    #[test]
    fn set_merges_into_existing_namespaces() {
        let mut target = bundle(json!({"a": {"keep": true}}));
        PortPath::parse("a.b").unwrap().set(&mut target, json!(1)).unwrap();
        assert_eq!(Value::Object(target), json!({"a": {"keep": true, "b": 1}}));
    }

    #[test]
    fn set_refuses_to_descend_into_scalars() {
        let mut target = bundle(json!({"a": 5}));
        let err = PortPath::parse("a.b").unwrap().set(&mut target, json!(1)).unwrap_err();
        assert!(matches!(err, OptError::Path(_)));
    }

    #[test]
    fn get_reads_nested_values_and_reports_missing_ones() {
        let source = bundle(json!({"x": {"y": 2}, "s": "str"}));
        assert_eq!(PortPath::parse("x.y").unwrap().get(&source).unwrap(), &json!(2));
        assert_eq!(PortPath::parse("x:y").unwrap().get(&source).unwrap(), &json!(2));
        assert!(matches!(
            PortPath::parse("x.z").unwrap().get(&source).unwrap_err(),
            OptError::Path(_)
        ));
        assert!(PortPath::parse("s.t").unwrap().get(&source).is_err());
    }

    #[test]
    fn integers_survive_relocation() {
        let mut first = Bundle::new();
        PortPath::parse("a.b.c.d:e.f").unwrap().set(&mut first, json!(2)).unwrap();
        let leaf = PortPath::parse("a.b.c.d:e.f").unwrap().get(&first).unwrap().clone();

        let mut second = Bundle::new();
        PortPath::parse("x.y").unwrap().set(&mut second, leaf).unwrap();
        let value = PortPath::parse("x.y").unwrap().get(&second).unwrap();
        assert_eq!(value.as_i64(), Some(2));
        assert!(value.is_i64() || value.is_u64());
    }

    #[test]
    fn serde_uses_the_textual_form() {
        let path: PortPath = serde_json::from_value(json!("a.b:c")).unwrap();
        assert_eq!(serde_json::to_value(&path).unwrap(), json!("a.b:c"));
        assert!(serde_json::from_value::<PortPath>(json!("a..b")).is_err());
    }
}
