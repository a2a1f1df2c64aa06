//! # Middleware Specifications
//!
//! Route descriptors name their middleware in several interchangeable shapes:
//!
//! | shape | example |
//! |---|---|
//! | bare name | `"cache"` |
//! | name with positional args | `"rate_limit:100,60"` |
//! | array | `["rate_limit", 100, 60]` or `["cache", {"ttl": 30}]` |
//! | explicit object | `{"name": "retry", "args": [5], "options": {"delay_ms": 50}}` |
//! | single-key object | `{"cache": 30}` or `{"cors": {"origins": ["*"]}}` |
//!
//! Every shape is normalized here into one [`MiddlewareArgs`] before any construction
//! logic runs. A list of specs may also be given as a pipe-delimited string
//! (`"request_id|cache:30|retry"`).

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::error::{GatewayError, GatewayResult};

/// A middleware specification reduced to name, positional args and options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MiddlewareArgs {
    pub name: String,
    pub args: Vec<Value>,
    pub options: Map<String, Value>,
}

impl MiddlewareArgs {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Priority override from the `priority` option
    pub fn priority(&self) -> GatewayResult<Option<i32>> {
        match self.options.get("priority") {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_i64()
                .and_then(|p| i32::try_from(p).ok())
                .map(Some)
                .ok_or_else(|| {
                    GatewayError::config(format!(
                        "Invalid priority for middleware '{}': {}",
                        self.name, value
                    ))
                }),
        }
    }

    /// Deserialize options into a typed config.
    ///
    /// Positional args are mapped onto `positional` field names in order; a name ending
    /// in `*` collects every remaining arg into a list. Options given by name win over
    /// positional args for the same field.
    pub fn into_config<T: DeserializeOwned>(&self, positional: &[&str]) -> GatewayResult<T> {
        let mut options = self.options.clone();
        options.remove("priority");

        let mut args = self.args.iter();
        for field in positional {
            if let Some(field) = field.strip_suffix('*') {
                let rest: Vec<Value> = args.by_ref().cloned().collect();
                if !rest.is_empty() {
                    options.entry(field.to_string()).or_insert(Value::Array(rest));
                }
                break;
            }
            match args.next() {
                Some(arg) => {
                    options.entry(field.to_string()).or_insert_with(|| arg.clone());
                }
                None => break,
            }
        }

        if args.next().is_some() {
            return Err(GatewayError::config(format!(
                "Too many arguments for middleware '{}' (accepts: {})",
                self.name,
                positional.join(", ")
            )));
        }

        serde_json::from_value(Value::Object(options)).map_err(|e| {
            GatewayError::config(format!("Invalid options for middleware '{}': {}", self.name, e))
        })
    }
}

/// Normalize a single middleware spec
pub fn normalize(spec: &Value) -> GatewayResult<MiddlewareArgs> {
    match spec {
        Value::String(text) => parse_text(text),
        Value::Array(items) => parse_array(items),
        Value::Object(map) => parse_object(map),
        other => Err(GatewayError::config(format!("Unsupported middleware spec: {}", other))),
    }
}

/// Normalize a list of specs, preserving declaration order.
///
/// Accepts `null`, a pipe-delimited string, a single object, or an array whose elements
/// are any single-spec shape (string elements may themselves be pipe-delimited).
pub fn normalize_many(specs: &Value) -> GatewayResult<Vec<MiddlewareArgs>> {
    match specs {
        Value::Null => Ok(Vec::new()),
        Value::String(text) => split_pipes(text).map(parse_text).collect(),
        Value::Object(_) => Ok(vec![normalize(specs)?]),
        Value::Array(items) => {
            let mut normalized = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(text) => {
                        for part in split_pipes(text) {
                            normalized.push(parse_text(part)?);
                        }
                    }
                    other => normalized.push(normalize(other)?),
                }
            }
            Ok(normalized)
        }
        other => Err(GatewayError::config(format!("Unsupported middleware list: {}", other))),
    }
}

fn split_pipes(text: &str) -> impl Iterator<Item = &str> {
    text.split('|').map(str::trim).filter(|part| !part.is_empty())
}

fn parse_text(text: &str) -> GatewayResult<MiddlewareArgs> {
    let text = text.trim();
    let (name, args) = match args_separator(text) {
        Some(at) => (text[..at].trim(), Some(&text[at + 1..])),
        None => (text, None),
    };

    let name = checked_name(name)?;
    let args = args
        .map(|args| args.split(',').map(|arg| coerce_scalar(arg.trim())).collect())
        .unwrap_or_default();

    Ok(MiddlewareArgs {
        name,
        args,
        options: Map::new(),
    })
}

/// Byte offset of the first `:` that is not half of a `::` path separator
fn args_separator(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    (0..bytes.len()).find(|&i| {
        bytes[i] == b':'
            && (i == 0 || bytes[i - 1] != b':')
            && bytes.get(i + 1) != Some(&b':')
    })
}

fn parse_array(items: &[Value]) -> GatewayResult<MiddlewareArgs> {
    let (first, rest) = items
        .split_first()
        .ok_or_else(|| GatewayError::config("Empty middleware spec array"))?;

    let name = first
        .as_str()
        .ok_or_else(|| GatewayError::config(format!("Middleware name must be a string, got {}", first)))?;

    let mut normalized = MiddlewareArgs::new(checked_name(name)?);
    for item in rest {
        match item {
            Value::Object(options) => merge_options(&mut normalized.options, options),
            other => normalized.args.push(other.clone()),
        }
    }
    Ok(normalized)
}

fn parse_object(map: &Map<String, Value>) -> GatewayResult<MiddlewareArgs> {
    if let Some(name) = map.get("name") {
        let name = name
            .as_str()
            .ok_or_else(|| GatewayError::config(format!("Middleware name must be a string, got {}", name)))?;
        let mut normalized = MiddlewareArgs::new(checked_name(name)?);

        for (key, value) in map {
            match (key.as_str(), value) {
                ("name", _) => {}
                ("args", Value::Array(args)) => normalized.args.extend(args.iter().cloned()),
                ("args", Value::Null) => {}
                ("args", scalar) => normalized.args.push(scalar.clone()),
                ("options", Value::Object(options)) => merge_options(&mut normalized.options, options),
                ("options", Value::Null) => {}
                ("options", other) => {
                    return Err(GatewayError::config(format!(
                        "Middleware '{}' options must be an object, got {}",
                        normalized.name, other
                    )))
                }
                // Remaining keys are shorthand options
                (key, value) => {
                    normalized.options.insert(key.to_string(), value.clone());
                }
            }
        }
        return Ok(normalized);
    }

    let mut entries = map.iter();
    match (entries.next(), entries.next()) {
        (Some((name, value)), None) => {
            let mut normalized = MiddlewareArgs::new(checked_name(name)?);
            match value {
                Value::Object(options) => merge_options(&mut normalized.options, options),
                Value::Array(args) => normalized.args.extend(args.iter().cloned()),
                Value::Null => {}
                scalar => normalized.args.push(scalar.clone()),
            }
            Ok(normalized)
        }
        _ => Err(GatewayError::config(format!(
            "Middleware spec object needs a 'name' key or exactly one entry: {}",
            Value::Object(map.clone())
        ))),
    }
}

fn merge_options(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}

fn checked_name(name: &str) -> GatewayResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(GatewayError::config("Middleware name must not be empty"));
    }
    Ok(name.to_string())
}

/// Textual args become booleans or numbers when they look like one
fn coerce_scalar(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(integer) = raw.parse::<i64>() {
        return Value::from(integer);
    }
    if let Ok(float) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    Value::String(raw.to_string())
}

/// Deserializers that accept the scalar coercions of textual specs
pub(crate) mod lenient {
    use super::*;

    /// A string, or any scalar rendered as text
    pub fn string<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(de::Error::custom(format!("expected a string, got {}", other))),
        }
    }

    /// Like [`string`], for optional fields
    pub fn optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            Value::Number(n) => Ok(Some(n.to_string())),
            Value::Bool(b) => Ok(Some(b.to_string())),
            other => Err(de::Error::custom(format!("expected a string, got {}", other))),
        }
    }

    /// A list of strings, or a single scalar treated as a one-element list
    pub fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        fn text(value: Value) -> Option<String> {
            match value {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            }
        }

        match Value::deserialize(deserializer)? {
            Value::Array(items) => items
                .into_iter()
                .map(|item| text(item.clone()).ok_or_else(|| de::Error::custom(format!("expected a string, got {}", item))))
                .collect(),
            Value::String(s) => Ok(s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect()),
            other => text(other.clone())
                .map(|s| vec![s])
                .ok_or_else(|| de::Error::custom(format!("expected a list of strings, got {}", other))),
        }
    }

    /// A list of status codes, or a single one
    pub fn status_list<'de, D>(deserializer: D) -> Result<Vec<u16>, D::Error>
    where
        D: Deserializer<'de>,
    {
        fn code(value: &Value) -> Option<u16> {
            match value {
                Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }
        }

        match Value::deserialize(deserializer)? {
            Value::Array(items) => items
                .iter()
                .map(|item| code(item).ok_or_else(|| de::Error::custom(format!("invalid status code {}", item))))
                .collect(),
            Value::String(s) => s
                .split(',')
                .map(|part| part.trim().parse().map_err(|_| de::Error::custom(format!("invalid status code '{}'", part))))
                .collect(),
            other => code(&other)
                .map(|c| vec![c])
                .ok_or_else(|| de::Error::custom(format!("invalid status code {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_name() {
        let args = normalize(&json!("cache")).unwrap();
        assert_eq!(args, MiddlewareArgs::new("cache"));
    }

    #[test]
    fn test_name_with_textual_args() {
        let args = normalize(&json!("rate_limit:100, 60,true,x-api-key")).unwrap();
        assert_eq!(args.name, "rate_limit");
        assert_eq!(args.args, vec![json!(100), json!(60), json!(true), json!("x-api-key")]);
    }

    #[test]
    fn test_qualified_name_with_args() {
        let args = normalize(&json!("crate::RateLimit:10,60")).unwrap();
        assert_eq!(args.name, "crate::RateLimit");
        assert_eq!(args.args, vec![json!(10), json!(60)]);

        let bare = normalize(&json!("app::middleware::CircuitBreakerMiddleware")).unwrap();
        assert_eq!(bare.name, "app::middleware::CircuitBreakerMiddleware");
        assert!(bare.args.is_empty());

        let piped = normalize_many(&json!("request_id|crate::Retry:3")).unwrap();
        assert_eq!(piped[1].name, "crate::Retry");
        assert_eq!(piped[1].args, vec![json!(3)]);
    }

    #[test]
    fn test_array_shapes() {
        let positional = normalize(&json!(["retry", 5, "GET"])).unwrap();
        assert_eq!(positional.name, "retry");
        assert_eq!(positional.args, vec![json!(5), json!("GET")]);

        let options = normalize(&json!(["cache", {"ttl": 30}])).unwrap();
        assert!(options.args.is_empty());
        assert_eq!(options.options.get("ttl"), Some(&json!(30)));
    }

    #[test]
    fn test_explicit_object() {
        let args = normalize(&json!({
            "name": "retry",
            "args": [4],
            "options": {"delay_ms": 10},
            "priority": 7
        }))
        .unwrap();
        assert_eq!(args.name, "retry");
        assert_eq!(args.args, vec![json!(4)]);
        assert_eq!(args.options.get("delay_ms"), Some(&json!(10)));
        assert_eq!(args.priority().unwrap(), Some(7));
    }

    #[test]
    fn test_single_key_object() {
        let scalar = normalize(&json!({"cache": 30})).unwrap();
        assert_eq!(scalar.name, "cache");
        assert_eq!(scalar.args, vec![json!(30)]);

        let map = normalize(&json!({"cors": {"origins": ["*"]}})).unwrap();
        assert_eq!(map.options.get("origins"), Some(&json!(["*"])));

        assert!(normalize(&json!({"a": 1, "b": 2})).is_err());
    }

    #[test]
    fn test_invalid_specs() {
        assert!(normalize(&json!(42)).is_err());
        assert!(normalize(&json!([])).is_err());
        assert!(normalize(&json!([1, 2])).is_err());
        assert!(normalize(&json!("  ")).is_err());
    }

    #[test]
    fn test_many_preserves_order_across_shapes() {
        let list = normalize_many(&json!([
            "request_id|cors",
            ["rate_limit", 10, 60],
            {"cache": 30},
            {"name": "retry"}
        ]))
        .unwrap();
        let names: Vec<_> = list.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["request_id", "cors", "rate_limit", "cache", "retry"]);

        let piped = normalize_many(&json!("a | b:1 ||c")).unwrap();
        let names: Vec<_> = piped.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        assert!(normalize_many(&Value::Null).unwrap().is_empty());
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        limit: u32,
        #[serde(default)]
        window: u64,
        #[serde(default, deserialize_with = "lenient::string_list")]
        methods: Vec<String>,
    }

    #[test]
    fn test_into_config_maps_positional_args() {
        let args = normalize(&json!("sample:5,60,GET,HEAD")).unwrap();
        let sample: Sample = args.into_config(&["limit", "window", "methods*"]).unwrap();
        assert_eq!(
            sample,
            Sample {
                limit: 5,
                window: 60,
                methods: vec!["GET".to_string(), "HEAD".to_string()],
            }
        );
    }

    #[test]
    fn test_named_options_win_over_positional() {
        let args = MiddlewareArgs::new("sample")
            .with_arg(1)
            .with_option("limit", 9)
            .with_option("priority", 3);
        let sample: Sample = args.into_config(&["limit"]).unwrap();
        assert_eq!(sample.limit, 9);
    }

    #[test]
    fn test_too_many_args_is_a_config_error() {
        let args = normalize(&json!("sample:1,2,3")).unwrap();
        let result: GatewayResult<Sample> = args.into_config(&["limit", "window"]);
        assert!(matches!(result, Err(GatewayError::Configuration { .. })));
    }
}
