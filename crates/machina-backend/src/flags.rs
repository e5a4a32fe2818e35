//! Driver flag model
//!
//! Drivers declare the flags they understand, each with a kind and an
//! optional default. Class-supplied overrides are string-valued; they are
//! coerced to the declared kind at merge time. Overrides for flags the
//! driver never declared are dropped, so one class can carry flags for
//! several providers.

use std::collections::BTreeMap;

use thiserror::Error;

/// A flag value after coercion to its declared kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagValue {
    /// Integer flag, e.g. disk size
    Int(i64),
    /// Free-form string flag
    String(String),
    /// List flag, comma-separated on the wire
    StringList(Vec<String>),
    /// Boolean flag
    Bool(bool),
}

impl FlagValue {
    /// Kind label used in error messages
    fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::String(_) => "string",
            Self::StringList(_) => "string list",
            Self::Bool(_) => "bool",
        }
    }
}

/// A flag a driver declares it understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagSpec {
    /// Flag name as it appears in NodeClass flag maps
    pub name: String,
    /// Default value; `None` means the flag is an unset boolean
    pub default: Option<FlagValue>,
}

impl FlagSpec {
    /// Declare a flag with a default value
    pub fn with_default(name: impl Into<String>, default: FlagValue) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
        }
    }

    /// Declare a flag with no default
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }
}

/// Resolved flag set handed to a driver's `configure`
pub type FlagSet = BTreeMap<String, FlagValue>;

/// Flag merge failure
#[derive(Debug, Error)]
pub enum FlagError {
    /// An override could not be coerced to the declared kind
    #[error("flag {flag}: cannot parse {value:?} as {expected}")]
    Unparsable {
        /// Flag name
        flag: String,
        /// Declared kind
        expected: &'static str,
        /// The raw override value
        value: String,
    },
}

/// Merge class-supplied overrides over a driver's declared flags
///
/// Declared defaults seed the set; a declared flag with no default becomes
/// a false boolean. Overrides apply only to declared flags and are coerced
/// to the kind of the declared default.
pub fn merge_flags(
    declared: &[FlagSpec],
    overrides: &BTreeMap<String, String>,
) -> Result<FlagSet, FlagError> {
    let mut set = FlagSet::new();

    for spec in declared {
        let default = spec
            .default
            .clone()
            .unwrap_or(FlagValue::Bool(false));

        let value = match overrides.get(&spec.name) {
            Some(raw) => coerce(&spec.name, raw, &default)?,
            None => default,
        };
        set.insert(spec.name.clone(), value);
    }

    Ok(set)
}

fn coerce(name: &str, raw: &str, declared: &FlagValue) -> Result<FlagValue, FlagError> {
    match declared {
        FlagValue::Int(_) => raw
            .parse::<i64>()
            .map(FlagValue::Int)
            .map_err(|_| unparsable(name, declared, raw)),
        FlagValue::String(_) => Ok(FlagValue::String(raw.to_string())),
        FlagValue::StringList(_) => Ok(FlagValue::StringList(
            raw.split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )),
        FlagValue::Bool(_) => raw
            .parse::<bool>()
            .map(FlagValue::Bool)
            .map_err(|_| unparsable(name, declared, raw)),
    }
}

fn unparsable(name: &str, declared: &FlagValue, raw: &str) -> FlagError {
    FlagError::Unparsable {
        flag: name.to_string(),
        expected: declared.kind(),
        value: raw.to_string(),
    }
}
