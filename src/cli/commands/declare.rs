//! Declare command - edit declarations in the file-backed cluster state

use crate::agent::create_cluster_state;
use crate::cache::ScopeKey;
use crate::cli::args::{DeclareAction, DeclareArgs, OutputFormat};
use crate::cli::commands::short_digest;
use crate::cluster::{CacheDeclaration, FileClusterState};
use crate::config::Config;
use crate::error::KcacheResult;
use crate::ui::{self, UiContext};
use console::style;

/// Execute the declare command
pub async fn execute(args: DeclareArgs, config: &Config) -> KcacheResult<()> {
    let state = create_cluster_state(config);
    let ctx = UiContext::detect();

    match args.action {
        DeclareAction::Apply {
            name,
            image,
            namespace,
            digest,
        } => {
            let scope = ScopeKey::from_namespace(namespace.as_deref())?;
            let mut declaration = CacheDeclaration::new(&scope, name, image);
            if let Some(digest) = digest {
                declaration = declaration.with_digest(digest);
            }
            let applied = state.apply_declaration(declaration).await?;
            match &applied.resolved_digest {
                Some(digest) => ui::step_ok_detail(
                    &ctx,
                    &format!("Applied {}/{}", scope, applied.name),
                    digest,
                ),
                None => ui::step_warn_hint(
                    &ctx,
                    &format!("Applied {}/{}", scope, applied.name),
                    "no digest yet, nodes wait for admission",
                ),
            }
        }
        DeclareAction::Delete { name, namespace } => {
            let scope = ScopeKey::from_namespace(namespace.as_deref())?;
            state.request_deletion(&scope, &name).await?;
            ui::step_ok(&ctx, &format!("Deletion requested for {}/{}", scope, name));
        }
        DeclareAction::Prune => {
            let pruned = state.prune_deleted().await?;
            if pruned.is_empty() {
                ui::step_info(&ctx, "Nothing to prune");
            }
            for declaration in pruned {
                ui::step_ok(
                    &ctx,
                    &format!(
                        "Pruned {}/{}",
                        declaration.namespace.as_deref().unwrap_or("cluster"),
                        declaration.name
                    ),
                );
            }
        }
        DeclareAction::List { format } => list_declarations(&state, format).await?,
    }

    Ok(())
}

async fn list_declarations(state: &FileClusterState, format: OutputFormat) -> KcacheResult<()> {
    let declarations = state.list_declarations_of(None).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&declarations)?),
        OutputFormat::Plain => {
            for d in &declarations {
                println!("{}", d.name);
            }
        }
        OutputFormat::Table => {
            if declarations.is_empty() {
                println!("No declarations found.");
                return Ok(());
            }

            println!(
                "{:<24} {:<16} {:<32} {:<20} {:<10}",
                "NAME", "NAMESPACE", "IMAGE", "DIGEST", "STATE"
            );
            println!("{}", "-".repeat(106));

            for d in &declarations {
                let state_display = if d.deletion_requested {
                    style("deleting").red().to_string()
                } else if d.resolved_digest.is_some() {
                    style("admitted").green().to_string()
                } else {
                    style("pending").yellow().to_string()
                };

                println!(
                    "{:<24} {:<16} {:<32} {:<20} {:<10}",
                    d.name,
                    d.namespace.as_deref().unwrap_or("-"),
                    d.image,
                    d.resolved_digest.as_deref().map(short_digest).unwrap_or("-"),
                    state_display
                );
            }

            println!();
            println!("Total: {} declaration(s)", declarations.len());
        }
    }
    Ok(())
}
