//! Status command - show node status records

use crate::agent::create_cluster_state;
use crate::cache::format_bytes;
use crate::cli::args::{OutputFormat, StatusArgs};
use crate::cli::commands::short_digest;
use crate::cluster::{CacheCondition, NodeStatusRecord};
use crate::config::{Config, ConfigManager};
use crate::error::KcacheResult;
use console::style;

/// Execute the status command
pub async fn execute(args: StatusArgs, config: &Config) -> KcacheResult<()> {
    let node = if args.all {
        None
    } else {
        Some(ConfigManager::node_name(config).await?)
    };
    let records = create_cluster_state(config)
        .list_status_of(None, node.as_deref())
        .await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Plain => print_status_plain(&records),
        OutputFormat::Table => print_status_table(&records),
    }
    Ok(())
}

fn condition_display(condition: CacheCondition) -> String {
    let text = condition.to_string();
    match condition {
        CacheCondition::Extracted => style(text).green().to_string(),
        CacheCondition::Running => style(text).cyan().to_string(),
        CacheCondition::Outdated | CacheCondition::Pending => style(text).yellow().to_string(),
        CacheCondition::Error | CacheCondition::UnloadError => style(text).red().to_string(),
    }
}

fn print_status_table(records: &[NodeStatusRecord]) {
    if records.is_empty() {
        println!("No status records found.");
        return;
    }

    for record in records {
        let scope = record
            .metadata
            .namespace
            .as_deref()
            .unwrap_or("cluster");
        println!(
            "{} {} (rev {})",
            style(record.node()).bold(),
            style(scope).dim(),
            record.metadata.resource_version
        );

        let Some(status) = &record.status else {
            println!("  {}", style("inventory not yet reported").dim());
            println!();
            continue;
        };

        let counts = status.counts;
        println!(
            "  extracted {}, in use {}, outdated {}, errored {}",
            counts.extracted, counts.in_use, counts.outdated, counts.errored
        );
        for group in &status.gpu_inventory {
            println!(
                "  gpu {} (driver {}): {:?}",
                group.gpu_type, group.driver_version, group.device_ids
            );
        }

        if !status.cache_statuses.is_empty() {
            println!(
                "  {:<24} {:<20} {:<12} {:<10} {}",
                "NAME", "DIGEST", "CONDITION", "SIZE", "MOUNTS"
            );
            for (name, digests) in &status.cache_statuses {
                for (digest, entry) in digests {
                    println!(
                        "  {:<24} {:<20} {:<12} {:<10} {}",
                        name,
                        short_digest(digest),
                        condition_display(entry.condition),
                        format_bytes(entry.volume_size),
                        entry.active_mounts.len()
                    );
                    if let Some(message) = &entry.message {
                        println!("    {}", style(message).dim());
                    }
                }
            }
        }
        println!();
    }
}

fn print_status_plain(records: &[NodeStatusRecord]) {
    for record in records {
        let Some(status) = &record.status else {
            continue;
        };
        for (name, digests) in &status.cache_statuses {
            for (digest, entry) in digests {
                println!("{} {} {} {}", record.node(), name, digest, entry.condition);
            }
        }
    }
}
