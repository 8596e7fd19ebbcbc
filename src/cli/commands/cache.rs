//! Cache command - inspect extracted caches

use crate::agent::create_extractor;
use crate::cache::{format_bytes, CacheKey, StoredCache};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::cli::commands::short_digest;
use crate::config::Config;
use crate::error::KcacheResult;
use console::style;
use std::collections::BTreeMap;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> KcacheResult<()> {
    let extractor = create_extractor(config);

    match args.action {
        CacheAction::List { format } => {
            let caches = extractor.store().list().await?;
            let refs: BTreeMap<CacheKey, u32> = extractor
                .usage()
                .list()
                .await?
                .into_iter()
                .map(|(key, entry)| (key, entry.ref_count))
                .collect();
            list_caches(&caches, &refs, format)
        }
    }
}

fn list_caches(
    caches: &[StoredCache],
    refs: &BTreeMap<CacheKey, u32>,
    format: OutputFormat,
) -> KcacheResult<()> {
    if caches.is_empty() {
        println!("No extracted caches found.");
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_cache_table(caches, refs),
        OutputFormat::Json => print_cache_json(caches, refs)?,
        OutputFormat::Plain => print_cache_plain(caches),
    }
    Ok(())
}

fn print_cache_table(caches: &[StoredCache], refs: &BTreeMap<CacheKey, u32>) {
    println!(
        "{:<20} {:<24} {:<20} {:<10} {:<5}",
        "SCOPE", "NAME", "DIGEST", "SIZE", "REFS"
    );
    println!("{}", "-".repeat(82));

    let mut total = 0;
    for cache in caches {
        let size = match cache.size {
            Some(bytes) => {
                total += bytes;
                format_bytes(bytes)
            }
            None => style("unrecorded").dim().to_string(),
        };
        let count = refs.get(&cache.key).copied().unwrap_or(0);
        let count = if count > 0 {
            style(count).yellow().to_string()
        } else {
            count.to_string()
        };

        println!(
            "{:<20} {:<24} {:<20} {:<10} {:<5}",
            cache.key.scope.dir_name(),
            cache.key.name,
            short_digest(&cache.key.digest),
            size,
            count
        );
    }

    println!();
    println!("Total: {} cache(s), {}", caches.len(), format_bytes(total));
}

fn print_cache_json(caches: &[StoredCache], refs: &BTreeMap<CacheKey, u32>) -> KcacheResult<()> {
    #[derive(serde::Serialize)]
    struct CacheJson<'a> {
        scope: &'a str,
        name: &'a str,
        digest: &'a str,
        image: Option<&'a str>,
        size: Option<u64>,
        ref_count: u32,
    }

    let json_caches: Vec<CacheJson<'_>> = caches
        .iter()
        .map(|c| CacheJson {
            scope: c.key.scope.dir_name(),
            name: &c.key.name,
            digest: &c.key.digest,
            image: c.image.as_deref(),
            size: c.size,
            ref_count: refs.get(&c.key).copied().unwrap_or(0),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json_caches)?);
    Ok(())
}

fn print_cache_plain(caches: &[StoredCache]) {
    for cache in caches {
        println!("{}", cache.key);
    }
}
