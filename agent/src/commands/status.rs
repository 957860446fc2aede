use anyhow::{Context, Result};
use rotary_config::ConfigStore;
use rotary_db::{models::Identity, storage::short_code};

use crate::context::SchedulerContext;

/// Where an identity stands against the activation quota.
fn standing(identity: &Identity, count: u32, cap: u32) -> &'static str {
    match &identity.machine_code {
        None => "new",
        Some(_) if count >= cap => "exhausted",
        Some(_) => "eligible",
    }
}

pub fn status(store: &ConfigStore) -> Result<()> {
    let config = store.snapshot();
    let cap = config.max_activations_per_code;
    let ctx = SchedulerContext::open(config).context("Failed to open data files")?;

    println!(
        "{:<4} {:<35} {:<12} {:>5}  STATUS",
        "ID", "VIRTUAL MACHINE CODE", "MACHINE CODE", "COUNT"
    );
    for identity in ctx.catalog.list() {
        let (code, count) = match &identity.machine_code {
            Some(code) => (short_code(code), ctx.ledger.count(code)),
            None => ("-".to_string(), 0),
        };
        println!(
            "{:<4} {:<35} {:<12} {:>5}  {}",
            identity.id,
            identity.virtual_code,
            code,
            format!("{count}/{cap}"),
            standing(&identity, count, cap)
        );
    }

    println!();
    println!("{}", ctx.ledger.summary());
    if !store.report().is_valid() {
        println!("config problems: {}", store.report());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standing() {
        let mut identity = Identity::generate();
        assert_eq!(standing(&identity, 0, 2), "new");

        identity.machine_code = Some("ABCDEF".into());
        assert_eq!(standing(&identity, 1, 2), "eligible");
        assert_eq!(standing(&identity, 2, 2), "exhausted");
    }
}
