use std::{fmt, path::PathBuf};

use toml::{Table, Value};

#[derive(Debug, Clone, Copy)]
enum Rule {
    Int { min: i64, max: i64 },
    Str,
    RequiredStr,
    File,
    Bool,
    OneOf(&'static [&'static str]),
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const SCHEMA: &[(&str, Rule)] = &[
    ("identity_count", Rule::Int { min: 1, max: 100 }),
    ("interval_minutes", Rule::Int { min: 1, max: 1440 }),
    ("max_activations_per_code", Rule::Int { min: 1, max: u32::MAX as i64 }),
    ("license_code", Rule::RequiredStr),
    ("additional_code", Rule::Str),
    ("data_dir", Rule::Str),
    ("driver_path", Rule::File),
    ("spoofer_path", Rule::File),
    ("activator_path", Rule::File),
    ("pool_size", Rule::Int { min: 1, max: 16 }),
    ("acquire_timeout_secs", Rule::Int { min: 1, max: 300 }),
    ("retry_attempts", Rule::Int { min: 1, max: 10 }),
    ("retry_base_delay_ms", Rule::Int { min: 0, max: 60_000 }),
    ("reset_quota_on_start", Rule::Bool),
    ("log_level", Rule::OneOf(LOG_LEVELS)),
];

/// Keys the agent understands. Anything else in the file is kept but ignored.
pub(crate) fn is_known_key(key: &str) -> bool {
    SCHEMA.iter().any(|(k, _)| *k == key)
}

/// One problem found in a configuration mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Missing {
        key: &'static str,
    },
    WrongType {
        key: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    OutOfRange {
        key: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    FileNotFound {
        key: &'static str,
        path: PathBuf,
    },
    UnknownValue {
        key: &'static str,
        value: String,
        allowed: &'static [&'static str],
    },
}

impl Violation {
    pub fn key(&self) -> &'static str {
        match self {
            Violation::Missing { key }
            | Violation::WrongType { key, .. }
            | Violation::OutOfRange { key, .. }
            | Violation::FileNotFound { key, .. }
            | Violation::UnknownValue { key, .. } => key,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Missing { key } => write!(f, "missing required option `{key}`"),
            Violation::WrongType {
                key,
                expected,
                found,
            } => write!(f, "`{key}` should be {expected}, found {found}"),
            Violation::OutOfRange {
                key,
                value,
                min,
                max,
            } => write!(f, "`{key}` = {value} is outside {min}..={max}"),
            Violation::FileNotFound { key, path } => {
                write!(f, "`{key}` points at a missing file: {}", path.display())
            }
            Violation::UnknownValue {
                key,
                value,
                allowed,
            } => write!(f, "`{key}` = {value:?} is not one of {}", allowed.join(", ")),
        }
    }
}

/// Every violation found in one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn for_key<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Violation> + 'a {
        self.violations.iter().filter(move |v| v.key() == key)
    }

    /// Turn a non-empty report into [`crate::ConfigError::Invalid`].
    pub fn into_result(self) -> Result<(), crate::ConfigError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(crate::ConfigError::Invalid(self))
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.violations.iter().map(|v| v.to_string()).collect();
        f.write_str(&lines.join("; "))
    }
}

/// Check `table` against the agent's option schema, collecting every
/// violation instead of stopping at the first one.
pub fn validate(table: &Table) -> ValidationReport {
    let violations = SCHEMA
        .iter()
        .filter_map(|(key, rule)| check(key, *rule, table.get(*key)))
        .collect();

    ValidationReport { violations }
}

fn check(key: &'static str, rule: Rule, value: Option<&Value>) -> Option<Violation> {
    let Some(value) = value else {
        return match rule {
            Rule::RequiredStr => Some(Violation::Missing { key }),
            _ => None,
        };
    };

    match (rule, value) {
        (Rule::Int { min, max }, Value::Integer(n)) => (*n < min || *n > max).then_some(
            Violation::OutOfRange {
                key,
                value: *n,
                min,
                max,
            },
        ),
        (Rule::Int { .. }, other) => Some(wrong_type(key, "an integer", other)),

        (Rule::Str, Value::String(_)) => None,
        (Rule::RequiredStr, Value::String(s)) => {
            s.trim().is_empty().then_some(Violation::Missing { key })
        }
        (Rule::File, Value::String(s)) => {
            let path = PathBuf::from(s);
            (!path.is_file()).then_some(Violation::FileNotFound { key, path })
        }
        (Rule::OneOf(allowed), Value::String(s)) => {
            (!allowed.contains(&s.to_ascii_lowercase().as_str())).then(|| Violation::UnknownValue {
                key,
                value: s.clone(),
                allowed,
            })
        }
        (Rule::Str | Rule::RequiredStr | Rule::File | Rule::OneOf(_), other) => {
            Some(wrong_type(key, "a string", other))
        }

        (Rule::Bool, Value::Boolean(_)) => None,
        (Rule::Bool, other) => Some(wrong_type(key, "a boolean", other)),
    }
}

fn wrong_type(key: &'static str, expected: &'static str, found: &Value) -> Violation {
    Violation::WrongType {
        key,
        expected,
        found: found.type_str(),
    }
}
