use anyhow::Result;
use serde_json::Value;
use std::fmt;

use super::{HasMetadata, InputParameter, LifecycleAware, Parameterized};
use crate::error::HarnessError;
use crate::flags::{FlagSet, ParsedFlags};
use crate::metadata::Metadata;

pub trait ScalarValue: Clone + fmt::Debug + PartialEq + 'static {
    const TYPE_NAME: &'static str;

    fn parse(raw: &str) -> std::result::Result<Self, String>;

    fn to_json(&self) -> Value;

    fn from_json(value: &Value) -> Option<Self>;

    fn render(&self) -> String;
}

impl ScalarValue for String {
    const TYPE_NAME: &'static str = "string";

    fn parse(raw: &str) -> std::result::Result<Self, String> {
        Ok(raw.to_string())
    }

    fn to_json(&self) -> Value {
        Value::String(self.clone())
    }

    fn from_json(value: &Value) -> Option<Self> {
        value.as_str().map(|s| s.to_string())
    }

    fn render(&self) -> String {
        self.clone()
    }
}

impl ScalarValue for i64 {
    const TYPE_NAME: &'static str = "integer";

    fn parse(raw: &str) -> std::result::Result<Self, String> {
        raw.trim()
            .parse::<i64>()
            .map_err(|_| format!("'{}' is not an integer", raw))
    }

    fn to_json(&self) -> Value {
        Value::from(*self)
    }

    fn from_json(value: &Value) -> Option<Self> {
        value.as_i64()
    }

    fn render(&self) -> String {
        self.to_string()
    }
}

const YES_VALUES: &[&str] = &["yes", "y", "true", "1"];
const NO_VALUES: &[&str] = &["no", "n", "false", "0"];

impl ScalarValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn parse(raw: &str) -> std::result::Result<Self, String> {
        let lowered = raw.trim().to_ascii_lowercase();
        if YES_VALUES.contains(&lowered.as_str()) {
            Ok(true)
        } else if NO_VALUES.contains(&lowered.as_str()) {
            Ok(false)
        } else {
            Err(format!(
                "'{}' is not a bool, possible values are {:?} and {:?}",
                raw, YES_VALUES, NO_VALUES
            ))
        }
    }

    fn to_json(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_json(value: &Value) -> Option<Self> {
        value.as_bool()
    }

    fn render(&self) -> String {
        if *self { "yes" } else { "no" }.to_string()
    }
}

/// A single-valued input taken from `--<name> VALUE`.
#[derive(Debug, Clone)]
pub struct Scalar<T: ScalarValue> {
    name: String,
    value: Option<T>,
    optional: bool,
    given: bool,
}

pub type Str = Scalar<String>;
pub type Integer = Scalar<i64>;
pub type Bool = Scalar<bool>;

impl<T: ScalarValue> Scalar<T> {
    pub fn new(default: impl Into<T>) -> Self {
        Self {
            name: String::new(),
            value: Some(default.into()),
            optional: false,
            given: false,
        }
    }

    /// No default; the value stays `None` unless the flag is given.
    pub fn optional() -> Self {
        Self {
            name: String::new(),
            value: None,
            optional: true,
            given: false,
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn get(&self) -> Result<&T> {
        self.value
            .as_ref()
            .ok_or_else(|| HarnessError::MissingValue(self.name.clone()).into())
    }

    /// Optional parameters report whether the flag was supplied; every
    /// other parameter always counts as given.
    pub fn was_given(&self) -> bool {
        !self.optional || self.given
    }
}

impl Str {
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

impl<T: ScalarValue> fmt::Display for Scalar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}", v.render()),
            None => Ok(()),
        }
    }
}

impl<T: ScalarValue> Parameterized for Scalar<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn register(&self, flags: &mut FlagSet) -> Result<()> {
        let default = if self.optional {
            None
        } else {
            self.value.as_ref().map(|v| v.render())
        };
        flags.add(&self.name, default.as_deref())
    }

    fn bind(&mut self, flags: &ParsedFlags) -> Result<()> {
        if let Some(raw) = flags.value(&self.name) {
            let parsed = T::parse(raw).map_err(|reason| HarnessError::invalid_value(&self.name, reason))?;
            self.value = Some(parsed);
            self.given = true;
        }
        Ok(())
    }
}

impl<T: ScalarValue> HasMetadata for Scalar<T> {
    fn contribute_metadata(&self) -> Result<Metadata> {
        let mut metadata = Metadata::new();
        let value = self.value.as_ref().map(|v| v.to_json()).unwrap_or(Value::Null);
        metadata.insert(self.name.clone(), value);
        Ok(metadata)
    }

    fn restore(&mut self, metadata: &Metadata) -> Result<()> {
        match metadata.get(&self.name) {
            Some(Value::Null) | None => {
                self.value = None;
                self.given = false;
            }
            Some(value) => {
                let restored = T::from_json(value).ok_or_else(|| {
                    HarnessError::invalid_value(
                        &self.name,
                        format!("persisted value {} is not a {}", value, T::TYPE_NAME),
                    )
                })?;
                self.value = Some(restored);
                self.given = true;
            }
        }
        Ok(())
    }
}

impl<T: ScalarValue> LifecycleAware for Scalar<T> {}

impl<T: ScalarValue> InputParameter for Scalar<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bound<T: ScalarValue>(mut param: Scalar<T>, name: &str, args: &[&str]) -> Result<Scalar<T>> {
        param.set_name(name);
        let mut flags = FlagSet::new("test");
        param.register(&mut flags)?;
        let parsed = flags.parse(args.iter().copied())?;
        param.bind(&parsed)?;
        Ok(param)
    }

    #[test]
    fn default_is_kept_without_flag() {
        let param = bound(Str::new("ABC"), "key", &[]).expect("bind");
        assert_eq!(param.as_str(), Some("ABC"));
        assert!(param.was_given());
        assert_eq!(param.to_string(), "ABC");
        assert_eq!(param.contribute_metadata().expect("meta")["key"], json!("ABC"));
    }

    #[test]
    fn bool_accepts_yes_and_no_words() {
        let param = bound(Bool::new(true), "flag", &["--flag", "no"]).expect("bind");
        assert_eq!(param.value(), Some(&false));
        let param = bound(Bool::new(false), "flag", &["--flag", "Y"]).expect("bind");
        assert_eq!(param.value(), Some(&true));
        let err = bound(Bool::new(false), "flag", &["--flag", "maybe"]).expect_err("invalid");
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::InvalidValue { .. })
        ));
    }

    #[test]
    fn integer_rejects_garbage() {
        let param = bound(Integer::new(3), "n", &["--n", "42"]).expect("bind");
        assert_eq!(param.value(), Some(&42));
        assert!(bound(Integer::new(3), "n", &["--n", "forty"]).is_err());
    }

    #[test]
    fn optional_tracks_whether_it_was_given() {
        let param = bound(Str::optional(), "opt", &[]).expect("bind");
        assert!(!param.was_given());
        assert_eq!(param.value(), None);
        assert!(param.get().is_err());
        assert_eq!(param.contribute_metadata().expect("meta")["opt"], Value::Null);

        let param = bound(Str::optional(), "opt", &["--opt", "x"]).expect("bind");
        assert!(param.was_given());
        assert_eq!(param.as_str(), Some("x"));
    }

    #[test]
    fn restore_reads_the_persisted_value() {
        let mut param = Integer::new(0);
        param.set_name("n");
        let mut metadata = Metadata::new();
        metadata.insert("n".to_string(), json!(9));
        param.restore(&metadata).expect("restore");
        assert_eq!(param.value(), Some(&9));

        metadata.insert("n".to_string(), json!("nine"));
        assert!(param.restore(&metadata).is_err());
    }
}
