use std::{collections::BTreeMap, time::Duration};

use {
    clap::Args,
    mcpdock_common::{DeploymentState, PluginId},
    mcpdock_deploy::{DeployRequest, OutputStream},
    mcpdock_hub::PluginRepository,
    tracing::warn,
};

use crate::plugin_commands::parse_id;

/// How long to wait for a freshly deployed service to list its tools.
const SERVICE_START_WAIT: Duration = Duration::from_secs(30);

#[derive(Args)]
pub struct DeployArgs {
    pub id: String,
    /// Environment value for the plugin (repeatable).
    #[arg(long = "env", short = 'e', value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,
    /// Run this command instead of the generated ones (repeatable, in order).
    #[arg(long = "cmd", value_name = "COMMAND")]
    pub commands: Vec<String>,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

pub async fn show_commands(repo: &PluginRepository, id: &str) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    for command in repo.get_deploy_commands(&id).await? {
        println!("{command}");
    }
    Ok(())
}

pub async fn deploy(repo: &PluginRepository, args: DeployArgs) -> anyhow::Result<()> {
    let id = parse_id(&args.id)?;
    let request = DeployRequest {
        commands: (!args.commands.is_empty()).then_some(args.commands),
        env: args.env.into_iter().collect::<BTreeMap<_, _>>(),
    };

    let mut capabilities = repo.capabilities();
    let output = stream_output(repo, id.clone());
    let state = tokio::select! {
        state = repo.deploy_and_wait(&id, request) => state,
        _ = tokio::signal::ctrl_c() => {
            repo.cancel_deploy(&id).await;
            Ok(repo.deployment_state(&id).await)
        },
    };
    output.abort();

    match state? {
        DeploymentState::Success => {
            println!("Deployed {id}; waiting for its service.");
            let loaded = tokio::time::timeout(
                SERVICE_START_WAIT,
                capabilities.wait_for(|snapshot| snapshot.contains_key(&id)),
            )
            .await;
            match loaded {
                Ok(Ok(snapshot)) => {
                    let tools = snapshot.get(&id).map(Vec::len).unwrap_or_default();
                    println!("{id} is serving {tools} tools.");
                },
                _ => warn!(plugin = %id, "service did not report its tools in time"),
            }
            Ok(())
        },
        DeploymentState::Failed { reason } => anyhow::bail!("deploy of {id} failed: {reason}"),
        other => anyhow::bail!("deploy of {id} ended in {other:?}"),
    }
}

fn stream_output(repo: &PluginRepository, id: PluginId) -> tokio::task::JoinHandle<()> {
    let mut rx = repo.deploy_output();
    tokio::spawn(async move {
        while let Ok(line) = rx.recv().await {
            if line.id != id {
                continue;
            }
            match line.stream {
                OutputStream::Stdout => println!("{}", line.line),
                OutputStream::Stderr => eprintln!("{}", line.line),
            }
        }
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("WEATHER_API_KEY=a=b").unwrap(),
            ("WEATHER_API_KEY".into(), "a=b".into())
        );
        assert_eq!(parse_key_val("EMPTY=").unwrap(), ("EMPTY".into(), String::new()));
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }
}
