use anyhow::{Result, bail};
use clap::Parser;
use rotary_db::storage::{IdentityCatalog, ProgressLedger, short_code};

#[derive(Clone, Parser)]
pub struct GenerateParams {
    /// How many identities to append
    #[clap(short, long, default_value_t = 5)]
    pub count: usize,
}

#[derive(Clone, Parser)]
pub struct RemoveParams {
    /// Id of the identity to remove
    #[clap(short, long)]
    pub id: u32,
}

pub fn generate(catalog: &IdentityCatalog, GenerateParams { count }: GenerateParams) -> Result<()> {
    let created = catalog.generate(count)?;

    match (created.first(), created.last()) {
        (Some(first), Some(last)) => println!(
            "Generated {} identities (ids {}-{})",
            created.len(),
            first.id,
            last.id
        ),
        _ => println!("Generated no identities"),
    }

    Ok(())
}

pub fn list(catalog: &IdentityCatalog, ledger: &ProgressLedger) -> Result<()> {
    let identities = catalog.list();
    if identities.is_empty() {
        println!("No identities in {}", catalog.path().display());
        return Ok(());
    }

    for identity in identities {
        let registration = match &identity.machine_code {
            Some(code) => format!("{} ({} activations)", short_code(code), ledger.count(code)),
            None => "unregistered".to_string(),
        };
        println!(
            "{:>4}  {}  {} {}  {}",
            identity.id,
            identity.virtual_code,
            identity.manufacturer,
            identity.product_name,
            registration
        );
    }

    Ok(())
}

pub fn remove(catalog: &IdentityCatalog, RemoveParams { id }: RemoveParams) -> Result<()> {
    if !catalog.remove(id)? {
        bail!("No identity with ID {id}");
    }

    println!("Removed identity {id}");
    Ok(())
}

pub fn clear(catalog: &IdentityCatalog) -> Result<()> {
    let removed = catalog.clear()?;
    println!("Removed {removed} identities");
    Ok(())
}

pub fn regenerate_codes(catalog: &IdentityCatalog) -> Result<()> {
    let changed = catalog.regenerate_virtual_codes()?;
    println!("Regenerated {changed} virtual machine codes");
    Ok(())
}

pub fn ledger(ledger: &ProgressLedger) -> Result<()> {
    let doc = ledger.snapshot();
    for (code, entry) in &doc.records {
        let identity = entry
            .identity_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  count={}  identity={}  updated={}",
            short_code(code),
            entry.count,
            identity,
            entry.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("{}", ledger.summary());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> (tempfile::TempDir, IdentityCatalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = IdentityCatalog::open(dir.path().join("identities.json")).unwrap();
        (dir, catalog)
    }

    #[test]
    fn test_generate_appends() {
        let (_dir, catalog) = catalog();

        generate(&catalog, GenerateParams { count: 2 }).unwrap();
        generate(&catalog, GenerateParams { count: 3 }).unwrap();

        let ids: Vec<_> = catalog.list().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_remove_unknown_id_fails() {
        let (_dir, catalog) = catalog();
        generate(&catalog, GenerateParams { count: 1 }).unwrap();

        assert!(remove(&catalog, RemoveParams { id: 9 }).is_err());
        remove(&catalog, RemoveParams { id: 1 }).unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_clear_then_regenerate_codes() {
        let (_dir, catalog) = catalog();
        generate(&catalog, GenerateParams { count: 2 }).unwrap();
        let before = catalog.get(1).unwrap().virtual_code;

        regenerate_codes(&catalog).unwrap();
        assert_ne!(catalog.get(1).unwrap().virtual_code, before);

        clear(&catalog).unwrap();
        assert!(catalog.is_empty());
    }
}
