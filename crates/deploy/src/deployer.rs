//! Per-plugin deployment state machine.
//!
//! `NotDeployed → GeneratingCommands → AwaitingConfirmation → Deploying →
//! {Success, Failed}`. A failed deployment can be retried with its last request.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    mcpdock_common::{DeploymentState, PluginId, ServerConfig},
    mcpdock_install::detect_manifest,
    mcpdock_store::ConfigStore,
    tokio::sync::{Mutex, broadcast, watch},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{
    commands::CommandGenerator,
    error::{DeployError, Result},
    runner::{CommandOutcome, CommandRunner, OutputLine},
};

const EVENT_CAPACITY: usize = 64;
const OUTPUT_CAPACITY: usize = 1024;

/// Parameters of one deployment attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployRequest {
    /// Commands to run instead of the generated ones.
    pub commands: Option<Vec<String>>,
    /// Env overrides, applied on top of declared defaults.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployEvent {
    StateChanged {
        id: PluginId,
        state: DeploymentState,
    },
    /// Emitted after the deployed flag and env values were persisted.
    Succeeded { id: PluginId },
}

#[derive(Default)]
struct Inner {
    states: HashMap<PluginId, watch::Sender<DeploymentState>>,
    commands: HashMap<PluginId, Vec<String>>,
    active: HashMap<PluginId, CancellationToken>,
    last_request: HashMap<PluginId, DeployRequest>,
}

struct Shared {
    store: Arc<ConfigStore>,
    plugins_dir: PathBuf,
    generator: Arc<dyn CommandGenerator>,
    runner: Arc<dyn CommandRunner>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<DeployEvent>,
    output: broadcast::Sender<OutputLine>,
}

impl Shared {
    fn state_tx<'a>(
        inner: &'a mut Inner,
        id: &PluginId,
    ) -> &'a watch::Sender<DeploymentState> {
        inner
            .states
            .entry(id.clone())
            .or_insert_with(|| watch::channel(DeploymentState::NotDeployed).0)
    }

    fn set_state(&self, inner: &mut Inner, id: &PluginId, state: DeploymentState) {
        Self::state_tx(inner, id).send_replace(state.clone());
        let _ = self.events.send(DeployEvent::StateChanged {
            id: id.clone(),
            state,
        });
    }

    async fn execute(
        &self,
        id: &PluginId,
        sandbox: &Path,
        commands: &[String],
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for command in commands {
            if cancel.is_cancelled() {
                return Err(DeployError::Cancelled);
            }
            let outcome = self
                .runner
                .run(id, command, sandbox, env, &self.output, cancel.clone())
                .await?;
            match outcome {
                CommandOutcome::Exited { exit_code: 0, .. } => {},
                CommandOutcome::Exited { exit_code, output } => {
                    return Err(DeployError::CommandFailed {
                        command: command.clone(),
                        exit_code,
                        output,
                    });
                },
                CommandOutcome::Cancelled => return Err(DeployError::Cancelled),
            }
        }
        Ok(())
    }
}

/// Deploys installed local plugins.
pub struct Deployer {
    shared: Arc<Shared>,
}

impl Deployer {
    pub fn new(
        store: Arc<ConfigStore>,
        plugins_dir: PathBuf,
        generator: Arc<dyn CommandGenerator>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (output, _) = broadcast::channel(OUTPUT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                store,
                plugins_dir,
                generator,
                runner,
                inner: Mutex::new(Inner::default()),
                events,
                output,
            }),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<DeployEvent> {
        self.shared.events.subscribe()
    }

    /// stdout/stderr lines of running deploy commands.
    pub fn output(&self) -> broadcast::Receiver<OutputLine> {
        self.shared.output.subscribe()
    }

    pub async fn state(&self, id: &PluginId) -> DeploymentState {
        let inner = self.shared.inner.lock().await;
        inner
            .states
            .get(id)
            .map(|tx| tx.borrow().clone())
            .unwrap_or_default()
    }

    pub async fn watch_state(&self, id: &PluginId) -> watch::Receiver<DeploymentState> {
        let mut inner = self.shared.inner.lock().await;
        Shared::state_tx(&mut inner, id).subscribe()
    }

    pub async fn is_deploying(&self, id: &PluginId) -> bool {
        self.shared.inner.lock().await.active.contains_key(id)
    }

    pub async fn cached_commands(&self, id: &PluginId) -> Option<Vec<String>> {
        self.shared.inner.lock().await.commands.get(id).cloned()
    }

    fn sandbox_path(&self, id: &PluginId) -> PathBuf {
        self.shared.plugins_dir.join(id.as_str())
    }

    fn check_deployable(&self, id: &PluginId) -> Result<PathBuf> {
        let doc = self.shared.store.snapshot();
        if doc.is_remote(id) {
            return Err(DeployError::NotDeployable { id: id.clone() });
        }
        let sandbox = self.sandbox_path(id);
        if !sandbox.is_dir() {
            return Err(DeployError::NotInstalled { id: id.clone() });
        }
        Ok(sandbox)
    }

    /// Commands that `deploy` would run, generated once per session.
    ///
    /// Also persists the proposed launch config when the plugin has none.
    pub async fn get_deploy_commands(&self, id: &PluginId) -> Result<Vec<String>> {
        let sandbox = self.check_deployable(id)?;

        {
            let mut inner = self.shared.inner.lock().await;
            let busy = inner.active.contains_key(id);
            if let Some(cached) = inner.commands.get(id).cloned() {
                if !busy {
                    self.shared
                        .set_state(&mut inner, id, DeploymentState::AwaitingConfirmation);
                }
                return Ok(cached);
            }
            if !busy {
                self.shared
                    .set_state(&mut inner, id, DeploymentState::GeneratingCommands);
            }
        }

        let dir = sandbox.clone();
        let manifest = tokio::task::spawn_blocking(move || detect_manifest(&dir))
            .await
            .map_err(|e| DeployError::external("manifest task failed", e))?;
        let manifest = match manifest {
            Ok(Some(m)) => m,
            Ok(None) => {
                let err = DeployError::MissingManifest { id: id.clone() };
                self.fail_unless_busy(id, &err).await;
                return Err(err);
            },
            Err(e) => {
                let err = DeployError::from(e);
                self.fail_unless_busy(id, &err).await;
                return Err(err);
            },
        };

        let plan = self.shared.generator.generate(&sandbox, &manifest).await;
        if let Some(launch) = plan.launch
            && self.shared.store.snapshot().server(id).is_none()
        {
            self.shared.store.set_server_config(id, launch).await?;
        }

        let mut inner = self.shared.inner.lock().await;
        inner.commands.insert(id.clone(), plan.commands.clone());
        if !inner.active.contains_key(id) {
            self.shared
                .set_state(&mut inner, id, DeploymentState::AwaitingConfirmation);
        }
        info!(plugin = %id, count = plan.commands.len(), manifest = %manifest.kind(), "generated deploy commands");
        Ok(plan.commands)
    }

    async fn fail_unless_busy(&self, id: &PluginId, err: &DeployError) {
        let mut inner = self.shared.inner.lock().await;
        if !inner.active.contains_key(id) {
            self.shared
                .set_state(&mut inner, id, DeploymentState::failed(err.failure_reason()));
        }
    }

    /// Drop the cached commands so the next deploy regenerates them.
    pub async fn invalidate_commands(&self, id: &PluginId) {
        if self.shared.inner.lock().await.commands.remove(id).is_some() {
            info!(plugin = %id, "invalidated cached deploy commands");
        }
    }

    /// Forget all session state of a plugin, e.g. after uninstall.
    pub async fn forget(&self, id: &PluginId) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(token) = inner.active.get(id) {
            token.cancel();
        }
        inner.commands.remove(id);
        inner.last_request.remove(id);
        if let Some(tx) = inner.states.get(id) {
            tx.send_replace(DeploymentState::NotDeployed);
        }
    }

    /// Start a deployment. Returns once the attempt is running; watch the
    /// state or call [`Deployer::wait`] for the outcome.
    ///
    /// Env is resolved before anything runs: a required entry with neither an
    /// override nor a default fails the attempt without spawning a command.
    pub async fn deploy(&self, id: &PluginId, request: DeployRequest) -> Result<()> {
        if self.is_deploying(id).await {
            return Err(DeployError::AlreadyDeploying { id: id.clone() });
        }
        let sandbox = self.check_deployable(id)?;

        let commands = match &request.commands {
            Some(commands) => commands.clone(),
            None => self.get_deploy_commands(id).await?,
        };

        let server = self.shared.store.snapshot().server(id).cloned();
        let env = match resolve_env(server.as_ref(), &request.env) {
            Ok(env) => env,
            Err(names) => {
                let mut inner = self.shared.inner.lock().await;
                // Another attempt started while commands were generated.
                if inner.active.contains_key(id) {
                    return Err(DeployError::AlreadyDeploying { id: id.clone() });
                }
                let err = DeployError::MissingRequiredEnv { names };
                inner.last_request.insert(id.clone(), request);
                self.shared
                    .set_state(&mut inner, id, DeploymentState::failed(err.failure_reason()));
                warn!(plugin = %id, error = %err, "deploy rejected");
                return Err(err);
            },
        };

        let cancel = CancellationToken::new();
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.active.contains_key(id) {
                return Err(DeployError::AlreadyDeploying { id: id.clone() });
            }
            inner.active.insert(id.clone(), cancel.clone());
            inner.last_request.insert(id.clone(), request);
            self.shared.set_state(&mut inner, id, DeploymentState::Deploying);
        }
        info!(plugin = %id, commands = commands.len(), "deploying plugin");

        let shared = Arc::clone(&self.shared);
        let id = id.clone();
        tokio::spawn(async move {
            let result = shared
                .execute(&id, &sandbox, &commands, &env, &cancel)
                .await;
            let result = match result {
                Ok(()) => shared.store.mark_deployed(&id, env).await.map_err(DeployError::from),
                Err(e) => Err(e),
            };

            let mut inner = shared.inner.lock().await;
            inner.active.remove(&id);
            match result {
                Ok(()) => {
                    shared.set_state(&mut inner, &id, DeploymentState::Success);
                    let _ = shared.events.send(DeployEvent::Succeeded { id: id.clone() });
                    info!(plugin = %id, "deployment succeeded");
                },
                Err(e) => {
                    warn!(plugin = %id, error = %e, "deployment failed");
                    shared.set_state(&mut inner, &id, DeploymentState::failed(e.failure_reason()));
                },
            }
        });
        Ok(())
    }

    /// Wait until no deployment of `id` is running and return the state.
    pub async fn wait(&self, id: &PluginId) -> DeploymentState {
        let mut rx = self.watch_state(id).await;
        match rx.wait_for(|s| !s.is_in_flight()).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(id).await,
        }
    }

    /// Deploy and wait for the outcome.
    pub async fn deploy_and_wait(
        &self,
        id: &PluginId,
        request: DeployRequest,
    ) -> Result<DeploymentState> {
        self.deploy(id, request).await?;
        Ok(self.wait(id).await)
    }

    /// Kill a running deployment. Returns after its processes are gone and the
    /// state reads `Failed(Cancelled)`; `false` if nothing was running.
    pub async fn cancel(&self, id: &PluginId) -> bool {
        let (token, mut rx) = {
            let mut inner = self.shared.inner.lock().await;
            let Some(token) = inner.active.get(id).cloned() else {
                return false;
            };
            (token, Shared::state_tx(&mut inner, id).subscribe())
        };
        info!(plugin = %id, "cancelling deployment");
        token.cancel();
        let _ = rx.wait_for(DeploymentState::is_terminal).await;
        true
    }

    /// Re-run the last request of a failed deployment.
    pub async fn retry(&self, id: &PluginId) -> Result<()> {
        let request = {
            let inner = self.shared.inner.lock().await;
            let failed = inner
                .states
                .get(id)
                .is_some_and(|tx| matches!(*tx.borrow(), DeploymentState::Failed { .. }));
            match inner.last_request.get(id) {
                Some(req) if failed => req.clone(),
                _ => {
                    return Err(DeployError::message(format!(
                        "plugin '{id}' has no failed deployment to retry"
                    )));
                },
            }
        };
        self.deploy(id, request).await
    }
}

/// Override, then default, for every declared entry. Undeclared overrides are
/// passed through. Returns the names of unresolved required entries.
fn resolve_env(
    server: Option<&ServerConfig>,
    overrides: &BTreeMap<String, String>,
) -> std::result::Result<BTreeMap<String, String>, Vec<String>> {
    let mut resolved = BTreeMap::new();
    let mut missing = Vec::new();
    for spec in server.map(|s| s.env.as_slice()).unwrap_or_default() {
        let value = overrides
            .get(&spec.name)
            .filter(|v| !v.is_empty())
            .or(spec.default.as_ref());
        match value {
            Some(v) => {
                resolved.insert(spec.name.clone(), v.clone());
            },
            None if spec.required => missing.push(spec.name.clone()),
            None => {},
        }
    }
    for (name, value) in overrides {
        resolved.entry(name.clone()).or_insert_with(|| value.clone());
    }
    if missing.is_empty() {
        Ok(resolved)
    } else {
        Err(missing)
    }
}
