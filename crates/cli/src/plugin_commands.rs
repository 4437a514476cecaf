use std::path::Path;

use {
    anyhow::Context as _,
    mcpdock_common::{ConnectionType, PluginId, PluginMetadata},
    mcpdock_hub::{PluginRepository, PluginView},
    tokio::task::JoinHandle,
};

pub fn parse_id(raw: &str) -> anyhow::Result<PluginId> {
    Ok(PluginId::new(raw)?)
}

pub async fn list(repo: &PluginRepository, refresh: bool, json: bool) -> anyhow::Result<()> {
    if refresh {
        repo.refresh(true).await;
    }
    let rows = repo.plugins().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No plugins. Try `mcpdock import` or `mcpdock install`.");
        return Ok(());
    }
    for row in &rows {
        println!("{}", format_row(row));
    }
    Ok(())
}

fn format_row(row: &PluginView) -> String {
    let state = if !row.enabled {
        "disabled"
    } else if row.running.active {
        "running"
    } else if row.deployed {
        "deployed"
    } else if row.installed {
        "installed"
    } else {
        "configured"
    };
    let tools = match &row.tools {
        Some(tools) => format!("{} tools", tools.len()),
        None => "-".to_string(),
    };
    format!(
        "{:<24} {:<28} {:<10} {:<10} {}",
        row.id.as_str(),
        row.display_name,
        row.plugin_type.to_string(),
        state,
        tools
    )
}

pub async fn import(repo: &PluginRepository, file: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let outcome = repo.merge_from_json(&text).await?;
    println!(
        "Merged {} servers ({} new, {} updated).",
        outcome.count,
        outcome.inserted.len(),
        outcome.updated.len()
    );
    for id in &outcome.server_config_overwritten {
        println!("  {id}: launch config replaced, redeploy to apply");
    }
    Ok(())
}

/// Print install progress for the duration of an install call.
fn print_progress(repo: &PluginRepository) -> JoinHandle<()> {
    let mut rx = repo.install_progress();
    tokio::spawn(async move {
        while let Ok((id, progress)) = rx.recv().await {
            match progress.percent {
                Some(percent) => eprintln!("{id}: {:?} {percent}%", progress.stage),
                None => eprintln!("{id}: {:?}", progress.stage),
            }
        }
    })
}

pub async fn install(
    repo: &PluginRepository,
    source: &str,
    id: Option<&str>,
) -> anyhow::Result<()> {
    let id = id.map(parse_id).transpose()?;
    let progress = print_progress(repo);
    let result = repo.install_from_repo(source, id).await;
    progress.abort();
    let id = result?;
    println!("Installed {id}. Run `mcpdock deploy {id}` to build and start it.");
    Ok(())
}

pub async fn install_zip(
    repo: &PluginRepository,
    archive: &Path,
    name: &str,
) -> anyhow::Result<()> {
    let progress = print_progress(repo);
    let result = repo
        .install_from_zip(PluginMetadata::local(name), archive)
        .await;
    progress.abort();
    let id = result?;
    println!("Installed {id} from {}.", archive.display());
    Ok(())
}

pub async fn connect(
    repo: &PluginRepository,
    name: &str,
    endpoint: &str,
    sse: bool,
    token: Option<String>,
) -> anyhow::Result<()> {
    let connection_type = if sse {
        ConnectionType::Sse
    } else {
        ConnectionType::HttpStream
    };
    let id = repo
        .connect_remote(PluginMetadata::remote(name, endpoint, connection_type, token))
        .await?;
    match repo.get_service_info(&id).await {
        Some(tools) => println!("Connected {id} ({} tools).", tools.len()),
        None => println!("Registered {id}; the endpoint did not answer yet."),
    }
    Ok(())
}

pub async fn remove(repo: &PluginRepository, id: &str) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    if repo.uninstall(&id).await? {
        println!("Removed {id}.");
    } else {
        println!("No plugin named {id}.");
    }
    Ok(())
}

pub async fn set_enabled(repo: &PluginRepository, id: &str, enabled: bool) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    repo.set_enabled(&id, enabled).await?;
    println!("{id} {}.", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

pub async fn config(repo: &PluginRepository, id: &str, set: Option<String>) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    match set {
        Some(text) => {
            repo.save_plugin_config(&id, &text).await?;
            println!("Saved configuration for {id}.");
        },
        None => match repo.plugin_config(&id) {
            Some(text) => println!("{text}"),
            None => anyhow::bail!("no configuration for {id}"),
        },
    }
    Ok(())
}

pub async fn tools(repo: &PluginRepository, json: bool) -> anyhow::Result<()> {
    repo.refresh(true).await;
    let map = repo.tool_map();
    if json {
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }
    for (id, tools) in &map {
        println!("{id}:");
        for tool in tools {
            println!("  {tool}");
        }
    }
    Ok(())
}
