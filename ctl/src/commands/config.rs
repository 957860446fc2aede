use anyhow::{Context, Result};
use clap::Parser;
use rotary_config::ConfigStore;
use toml::Value;

#[derive(Clone, Parser)]
pub struct SetParams {
    /// Option name, e.g. `interval_minutes`
    pub key: String,

    /// New value. Integers and `true`/`false` are typed; wrap in double
    /// quotes to force a string.
    pub value: String,
}

/// Interpret a command-line value the way it would be written in TOML.
pub fn parse_value(raw: &str) -> Value {
    if let Some(quoted) = raw
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        return Value::String(quoted.to_string());
    }

    if let Ok(int) = raw.parse::<i64>() {
        return Value::Integer(int);
    }

    match raw {
        "true" => Value::Boolean(true),
        "false" => Value::Boolean(false),
        _ => Value::String(raw.to_string()),
    }
}

pub fn check_config(store: &ConfigStore) -> Result<()> {
    let report = store.report();
    for violation in &report.violations {
        println!("{}: {violation}", store.path().display());
    }

    report
        .clone()
        .into_result()
        .with_context(|| format!("{} has {} problem(s)", store.path().display(), report.len()))?;

    println!("{}: OK", store.path().display());
    Ok(())
}

pub fn set_config(store: &mut ConfigStore, SetParams { key, value }: SetParams) -> Result<()> {
    store
        .set(&key, parse_value(&value))
        .with_context(|| format!("Failed to set {key}"))?;

    println!("Set {key} = {value} in {}", store.path().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("120"), Value::Integer(120));
        assert_eq!(parse_value("-3"), Value::Integer(-3));
        assert_eq!(parse_value("true"), Value::Boolean(true));
        assert_eq!(parse_value("ABC-123"), Value::String("ABC-123".into()));
        assert_eq!(parse_value("\"12345\""), Value::String("12345".into()));
    }

    #[test]
    fn test_set_rejects_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotary.toml");
        let mut store = ConfigStore::load(&path).unwrap();

        let params = SetParams {
            key: "interval_minutes".into(),
            value: "0".into(),
        };
        assert!(set_config(&mut store, params).is_err());
        assert!(!path.exists());

        let params = SetParams {
            key: "interval_minutes".into(),
            value: "30".into(),
        };
        set_config(&mut store, params).unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.config().interval_minutes, 30);
    }
}
