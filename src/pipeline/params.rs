//! Configuration parameters declared by stages and resolved from operator input.
//!
//! Stages declare parameters (name, section, default, admissible range) in the
//! Declare phase. Operator-supplied values loaded before declaration take
//! precedence over declared defaults. A value of [`ParamValue::Auto`] asks the
//! owning stage to derive the value itself during auto-configuration.

use crate::pipeline::error::ParamError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    List(Vec<ParamValue>),
    String(String),
    /// "derive this automatically"; operators spell it as the string `auto`.
    #[serde(skip_deserializing, serialize_with = "serialize_auto")]
    Auto,
}

fn serialize_auto<S: serde::Serializer>(serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("auto")
}

impl ParamValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            ParamValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            ParamValue::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, ParamValue::Auto)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::List(_) => "list",
            ParamValue::String(_) => "string",
            ParamValue::Auto => "auto",
        }
    }

    /// Map the operator spelling `"auto"` to [`ParamValue::Auto`].
    fn normalized(self) -> Self {
        match self {
            ParamValue::String(s) if s.eq_ignore_ascii_case("auto") => ParamValue::Auto,
            other => other,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", *v as i32),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::String(v) => f.write_str(v),
            ParamValue::Auto => f.write_str("auto"),
            ParamValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::String(v.to_string()).normalized()
    }
}

/// Declaration of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub name: String,
    /// Section path, e.g. `Filtering:Spatial Filter`.
    pub section: String,
    pub default: ParamValue,
    /// Inclusive numeric range checked by [`ParameterSet::check_range`].
    pub range: Option<(f64, f64)>,
    /// Whether `auto` is an admissible value.
    pub allows_auto: bool,
    pub comment: String,
}

impl ParamDecl {
    pub fn new(section: impl Into<String>, name: impl Into<String>, default: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            section: section.into(),
            default: default.into(),
            range: None,
            allows_auto: false,
            comment: String::new(),
        }
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    pub fn auto(mut self) -> Self {
        self.allows_auto = true;
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

/// Read access to resolved configuration.
pub trait ParameterResolver {
    fn get_parameter(&self, name: &str) -> Option<&ParamValue>;

    fn parameter_exists(&self, name: &str) -> bool {
        self.get_parameter(name).is_some()
    }
}

#[derive(Debug, Clone)]
struct ParamEntry {
    decl: Option<ParamDecl>,
    value: ParamValue,
    /// Value derived for an `auto` entry during the current configuration pass.
    derived: Option<ParamValue>,
    /// Set when an operator value overrides the declared default.
    user_supplied: bool,
}

impl ParamEntry {
    fn effective(&self) -> &ParamValue {
        match (&self.value, &self.derived) {
            (ParamValue::Auto, Some(derived)) => derived,
            (value, _) => value,
        }
    }
}

/// Ordered set of declared parameters and their current values.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    entries: BTreeMap<String, ParamEntry>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a set with operator values (before any stage declares).
    pub fn from_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, ParamValue)>,
        K: Into<String>,
    {
        let mut set = Self::new();
        for (name, value) in values {
            set.set(name, value);
        }
        set
    }

    /// Declare a parameter. An existing operator value is kept; an existing
    /// declaration is replaced only if this one is new.
    pub fn declare(&mut self, decl: ParamDecl) {
        match self.entries.get_mut(&decl.name) {
            Some(entry) => {
                if entry.decl.is_none() {
                    if !entry.user_supplied {
                        entry.value = decl.default.clone();
                    }
                    entry.decl = Some(decl);
                }
            }
            None => {
                let name = decl.name.clone();
                self.entries.insert(
                    name,
                    ParamEntry {
                        value: decl.default.clone(),
                        decl: Some(decl),
                        derived: None,
                        user_supplied: false,
                    },
                );
            }
        }
    }

    /// Set an operator value, creating the entry if needed.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        let value = value.into().normalized();
        let name = name.into();
        match self.entries.get_mut(&name) {
            Some(entry) => {
                entry.value = value;
                entry.derived = None;
                entry.user_supplied = true;
            }
            None => {
                self.entries.insert(
                    name,
                    ParamEntry {
                        decl: None,
                        value,
                        derived: None,
                        user_supplied: true,
                    },
                );
            }
        }
    }

    /// Supply the derived value for an `auto` entry. The entry itself stays
    /// `auto`, so the next configuration pass derives it again.
    pub fn resolve_auto(&mut self, name: &str, value: impl Into<ParamValue>) -> Result<(), ParamError> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| ParamError::Unknown(name.to_string()))?;
        if !entry.value.is_auto() {
            return Err(ParamError::NotAuto(name.to_string()));
        }
        entry.derived = Some(value.into());
        Ok(())
    }

    /// Forget all derived values; called before every configuration pass.
    pub fn clear_derived(&mut self) {
        for entry in self.entries.values_mut() {
            entry.derived = None;
        }
    }

    /// Whether the operator asked for `name` to be derived automatically.
    pub fn is_auto(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|e| e.value.is_auto())
    }

    /// Current value; for `auto` entries the derived value once available.
    pub fn get(&self, name: &str) -> Result<&ParamValue, ParamError> {
        self.entries
            .get(name)
            .map(ParamEntry::effective)
            .ok_or_else(|| ParamError::Unknown(name.to_string()))
    }

    pub fn declaration(&self, name: &str) -> Option<&ParamDecl> {
        self.entries.get(name).and_then(|e| e.decl.as_ref())
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.declaration(name).is_some()
    }

    pub fn get_float(&self, name: &str) -> Result<f64, ParamError> {
        let value = self.get(name)?;
        value.as_float().ok_or_else(|| ParamError::WrongType {
            name: name.to_string(),
            expected: "number",
            found: value.type_name(),
        })
    }

    pub fn get_int(&self, name: &str) -> Result<i64, ParamError> {
        let value = self.get(name)?;
        value.as_int().ok_or_else(|| ParamError::WrongType {
            name: name.to_string(),
            expected: "int",
            found: value.type_name(),
        })
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, ParamError> {
        let value = self.get(name)?;
        value.as_bool().ok_or_else(|| ParamError::WrongType {
            name: name.to_string(),
            expected: "bool",
            found: value.type_name(),
        })
    }

    /// The value if present, otherwise `default`.
    pub fn optional(&self, name: &str, default: ParamValue) -> ParamValue {
        self.entries
            .get(name)
            .map(|e| e.effective().clone())
            .unwrap_or(default)
    }

    /// Check a numeric parameter against its declared range.
    pub fn check_range(&self, name: &str) -> Result<f64, ParamError> {
        let value = self.get_float(name)?;
        if let Some((min, max)) = self.declaration(name).and_then(|d| d.range) {
            if value < min || value > max {
                return Err(ParamError::OutOfRange {
                    name: name.to_string(),
                    value,
                    min,
                    max,
                });
            }
        }
        Ok(value)
    }

    /// Names of parameters that were set by the operator but never declared.
    pub fn undeclared(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, e)| e.decl.is_none())
            .map(|(k, _)| k.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ParameterResolver for ParameterSet {
    fn get_parameter(&self, name: &str) -> Option<&ParamValue> {
        self.entries.get(name).map(ParamEntry::effective)
    }
}
