//! Usage command - the mount server's side of the usage registry

use crate::agent::create_extractor;
use crate::cache::{format_bytes, CacheKey, ScopeKey};
use crate::cli::args::{OutputFormat, UsageAction, UsageArgs};
use crate::cli::commands::short_digest;
use crate::config::Config;
use crate::error::{KcacheError, KcacheResult};
use crate::ui::{self, UiContext};
use crate::usage::{UsageEntry, UsageRegistry};

/// Execute the usage command
pub async fn execute(args: UsageArgs, config: &Config) -> KcacheResult<()> {
    let extractor = create_extractor(config);
    let registry = extractor.usage();
    let ctx = UiContext::detect();

    match args.action {
        UsageAction::Add {
            name,
            digest,
            handle,
            namespace,
            size,
        } => {
            let key = CacheKey::new(ScopeKey::from_namespace(namespace.as_deref())?, name, digest)?;
            let entry = registry.add_usage(&key, &handle, size).await?;
            ui::step_ok_detail(
                &ctx,
                &format!("{} uses {}", handle, key),
                &format!("refs: {}", entry.ref_count),
            );
        }
        UsageAction::Delete { handle } => match registry.delete_usage(&handle).await? {
            Some(entry) => ui::step_ok_detail(
                &ctx,
                &format!("{} released {}", handle, entry.cr_name),
                &format!("refs: {}", entry.ref_count),
            ),
            None => ui::step_warn(&ctx, &format!("No usage record holds {}", handle)),
        },
        UsageAction::Show { handle, format } => show_usage(registry, handle, format).await?,
    }

    Ok(())
}

async fn show_usage(
    registry: &UsageRegistry,
    handle: Option<String>,
    format: OutputFormat,
) -> KcacheResult<()> {
    let records = match handle {
        Some(handle) => {
            let found = registry.get_usage_by_mount_handle(&handle).await?;
            vec![found.ok_or_else(|| {
                KcacheError::NotFound(format!("usage record holding {}", handle))
            })?]
        }
        None => registry.list().await?,
    };

    match format {
        OutputFormat::Table => print_usage_table(&records),
        OutputFormat::Json => {
            let entries: Vec<&UsageEntry> = records.iter().map(|(_, e)| e).collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Plain => {
            for (key, entry) in &records {
                for handle in &entry.mount_handles {
                    println!("{} {}", key, handle);
                }
            }
        }
    }
    Ok(())
}

fn print_usage_table(records: &[(CacheKey, UsageEntry)]) {
    if records.is_empty() {
        println!("No usage records found.");
        return;
    }

    println!(
        "{:<20} {:<24} {:<20} {:<10} {:<5} {}",
        "SCOPE", "NAME", "DIGEST", "SIZE", "REFS", "HANDLES"
    );
    println!("{}", "-".repeat(92));

    for (key, entry) in records {
        println!(
            "{:<20} {:<24} {:<20} {:<10} {:<5} {}",
            key.scope.dir_name(),
            key.name,
            short_digest(&key.digest),
            format_bytes(entry.volume_size),
            entry.ref_count,
            entry.mount_handles.join(",")
        );
    }
}
