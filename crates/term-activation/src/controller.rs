//! Per-terminal activation state.
//!
//! A terminal moves `idle -> activating -> activated -> deactivating -> idle`.
//! The transient states hold the in-flight operation as a shared future, so
//! a second caller awaits the same run instead of sending the commands again,
//! and activation never overlaps deactivation of the same terminal.
//!
//! Every check-then-insert on the state maps happens under one lock with no
//! await in between.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use env_discovery::ShutdownHandle;
use env_registry::{normalize_path, EnvironmentId, PythonEnvironment};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::commands::{activation_commands, deactivation_commands};
use crate::terminal::{
    EnvironmentSource, ShellIntegration, Terminal, TerminalEvent, TerminalHost, TerminalId,
    TerminalOptions,
};

/// How long a freshly opened terminal gets to announce shell integration.
pub const SHELL_INTEGRATION_TIMEOUT: Duration = Duration::from_millis(500);
pub const SHELL_INTEGRATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoActivation {
    /// Send the activation commands to new terminals.
    #[default]
    Command,
    Off,
}

#[derive(Debug, Clone)]
pub struct ActivationConfig {
    pub auto_activation: AutoActivation,
    pub shell_integration_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            auto_activation: AutoActivation::default(),
            shell_integration_timeout: SHELL_INTEGRATION_TIMEOUT,
            poll_interval: SHELL_INTEGRATION_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActivationStateChanged {
    pub terminal: TerminalId,
    pub environment: Arc<PythonEnvironment>,
    pub activated: bool,
}

type InFlight = Shared<BoxFuture<'static, ()>>;

enum Mechanism {
    ShellIntegration(Arc<dyn ShellIntegration>),
    /// Plain text injection; completion cannot be observed.
    Legacy,
}

impl Mechanism {
    fn of(terminal: &dyn Terminal) -> Self {
        match terminal.shell_integration() {
            Some(integration) => Mechanism::ShellIntegration(integration),
            None => Mechanism::Legacy,
        }
    }
}

struct Activation {
    environment: Arc<PythonEnvironment>,
    shell_integration: bool,
}

#[derive(Default)]
struct State {
    activated: HashMap<TerminalId, Activation>,
    activating: HashMap<TerminalId, (EnvironmentId, InFlight)>,
    deactivating: HashMap<TerminalId, InFlight>,
    /// Terminals opened by the controller itself; the open event skips them.
    managed: HashSet<TerminalId>,
    project_terminals: HashMap<PathBuf, Arc<dyn Terminal>>,
    dedicated_terminals: HashMap<(String, PathBuf), Arc<dyn Terminal>>,
}

impl State {
    fn evict(&mut self, id: TerminalId) {
        self.activated.remove(&id);
        self.activating.remove(&id);
        self.deactivating.remove(&id);
        self.managed.remove(&id);
        self.project_terminals.retain(|_, terminal| terminal.id() != id);
        self.dedicated_terminals.retain(|_, terminal| terminal.id() != id);
    }
}

struct Inner {
    host: Arc<dyn TerminalHost>,
    environments: Arc<dyn EnvironmentSource>,
    config: ActivationConfig,
    state: StdMutex<State>,
    events: broadcast::Sender<ActivationStateChanged>,
    event_loop: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(slot) = self.event_loop.get_mut() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

enum Step {
    Done,
    /// Let a conflicting operation finish, then look again.
    Wait(InFlight),
    /// Share the outcome of an identical operation.
    Join(InFlight),
}

#[derive(Clone)]
pub struct ActivationController {
    inner: Arc<Inner>,
}

impl ActivationController {
    pub fn new(
        host: Arc<dyn TerminalHost>,
        environments: Arc<dyn EnvironmentSource>,
        config: ActivationConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                host,
                environments,
                config,
                state: StdMutex::new(State::default()),
                events,
                event_loop: StdMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ActivationConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivationStateChanged> {
        self.inner.events.subscribe()
    }

    /// Auto-activate the terminals that are already open and start following
    /// the host's open/close events. Calling it again does nothing.
    pub async fn initialize(&self) {
        {
            let mut slot = self.inner.event_loop.lock().unwrap();
            if slot.is_some() {
                return;
            }
            let events = self.inner.host.subscribe();
            let inner = Arc::downgrade(&self.inner);
            *slot = Some(tokio::spawn(run_event_loop(inner, events)));
        }

        let existing = self.inner.host.terminals();
        debug!("[activation] Initializing with {} open terminals", existing.len());
        futures::future::join_all(existing.into_iter().map(|terminal| self.on_opened(terminal)))
            .await;
    }

    /// Stop following terminal events.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.event_loop.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        let controller = self.clone();
        ShutdownHandle::from_fn(move || controller.shutdown())
    }

    /// Open a terminal and, unless auto-activation is off, activate
    /// `environment` in it before returning.
    pub async fn create(
        &self,
        environment: &Arc<PythonEnvironment>,
        options: TerminalOptions,
    ) -> anyhow::Result<Arc<dyn Terminal>> {
        let terminal = self.open(options)?;
        self.auto_activate(&terminal, environment).await;
        Ok(terminal)
    }

    fn open(&self, options: TerminalOptions) -> anyhow::Result<Arc<dyn Terminal>> {
        let terminal = self.inner.host.create_terminal(options)?;
        self.inner
            .state
            .lock()
            .unwrap()
            .managed
            .insert(terminal.id());
        Ok(terminal)
    }

    /// The terminal kept for `project`, reused while it stays open unless
    /// `create_new` is set.
    pub async fn get_project_terminal(
        &self,
        project: &Path,
        environment: &Arc<PythonEnvironment>,
        create_new: bool,
    ) -> anyhow::Result<Arc<dyn Terminal>> {
        let root = normalize_path(project);
        let existing = if create_new {
            None
        } else {
            live(self.inner.state.lock().unwrap().project_terminals.get(&root))
        };
        if let Some(terminal) = existing {
            self.reuse(&terminal, environment).await;
            return Ok(terminal);
        }

        let terminal = self.open(TerminalOptions {
            name: Some(format!("Python: {}", folder_name(&root))),
            cwd: Some(root.clone()),
            ..Default::default()
        })?;
        self.inner
            .state
            .lock()
            .unwrap()
            .project_terminals
            .insert(root, terminal.clone());
        self.auto_activate(&terminal, environment).await;
        Ok(terminal)
    }

    /// Like [`Self::get_project_terminal`] but keyed by a caller-chosen name
    /// as well, e.g. one terminal per script.
    pub async fn get_dedicated_terminal(
        &self,
        key: &str,
        project: &Path,
        environment: &Arc<PythonEnvironment>,
        create_new: bool,
    ) -> anyhow::Result<Arc<dyn Terminal>> {
        let slot = (key.to_string(), normalize_path(project));
        let existing = if create_new {
            None
        } else {
            live(self.inner.state.lock().unwrap().dedicated_terminals.get(&slot))
        };
        if let Some(terminal) = existing {
            self.reuse(&terminal, environment).await;
            return Ok(terminal);
        }

        let terminal = self.open(TerminalOptions {
            name: Some(format!("Python: {key}")),
            cwd: Some(slot.1.clone()),
            ..Default::default()
        })?;
        self.inner
            .state
            .lock()
            .unwrap()
            .dedicated_terminals
            .insert(slot, terminal.clone());
        self.auto_activate(&terminal, environment).await;
        Ok(terminal)
    }

    async fn reuse(&self, terminal: &Arc<dyn Terminal>, environment: &Arc<PythonEnvironment>) {
        if self.inner.config.auto_activation == AutoActivation::Command {
            self.activate(terminal, environment).await;
        }
    }

    pub fn is_activated(&self, terminal: TerminalId, environment: Option<&PythonEnvironment>) -> bool {
        let state = self.inner.state.lock().unwrap();
        match (state.activated.get(&terminal), environment) {
            (Some(current), Some(environment)) => current.environment.id == environment.id,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn get_environment(&self, terminal: TerminalId) -> Option<Arc<PythonEnvironment>> {
        self.inner
            .state
            .lock()
            .unwrap()
            .activated
            .get(&terminal)
            .map(|current| current.environment.clone())
    }

    /// Activate `environment` in `terminal` through shell integration when
    /// the terminal has it, else by typing the commands. Failures are logged,
    /// never returned.
    pub async fn activate(&self, terminal: &Arc<dyn Terminal>, environment: &Arc<PythonEnvironment>) {
        self.activate_with(terminal, environment, None).await;
    }

    async fn activate_with(
        &self,
        terminal: &Arc<dyn Terminal>,
        environment: &Arc<PythonEnvironment>,
        mut mechanism: Option<Mechanism>,
    ) {
        let id = terminal.id();
        loop {
            let mut superseded = None;
            let step = {
                let mut state = self.inner.state.lock().unwrap();
                if terminal.is_closed() {
                    Step::Done
                } else if let Some(running) = state.deactivating.get(&id) {
                    Step::Wait(running.clone())
                } else if let Some((target, running)) = state.activating.get(&id) {
                    if *target == environment.id {
                        Step::Join(running.clone())
                    } else {
                        Step::Wait(running.clone())
                    }
                } else if state
                    .activated
                    .get(&id)
                    .is_some_and(|current| current.environment.id == environment.id)
                {
                    Step::Done
                } else {
                    let mechanism = mechanism
                        .take()
                        .unwrap_or_else(|| Mechanism::of(terminal.as_ref()));
                    let running = run_activation(
                        self.inner.clone(),
                        terminal.clone(),
                        environment.clone(),
                        mechanism,
                    )
                    .boxed()
                    .shared();
                    // The shell is leaving the old environment as soon as the
                    // new commands start.
                    superseded = state.activated.remove(&id);
                    state
                        .activating
                        .insert(id, (environment.id.clone(), running.clone()));
                    Step::Join(running)
                }
            };
            if let Some(previous) = superseded {
                debug!(
                    "[activation] Switching terminal {} from {} to {}",
                    id, previous.environment.display_name, environment.display_name
                );
                let _ = self.inner.events.send(ActivationStateChanged {
                    terminal: id,
                    environment: previous.environment,
                    activated: false,
                });
            }
            match step {
                Step::Done => return,
                Step::Wait(running) => running.await,
                Step::Join(running) => return running.await,
            }
        }
    }

    /// Undo the activation using the mechanism it was done with.
    pub async fn deactivate(&self, terminal: &Arc<dyn Terminal>) {
        let id = terminal.id();
        loop {
            let step = {
                let mut state = self.inner.state.lock().unwrap();
                if let Some((_, running)) = state.activating.get(&id) {
                    Step::Wait(running.clone())
                } else if let Some(running) = state.deactivating.get(&id) {
                    Step::Join(running.clone())
                } else if let Some(current) = state.activated.get(&id) {
                    let mechanism = if current.shell_integration {
                        Mechanism::of(terminal.as_ref())
                    } else {
                        Mechanism::Legacy
                    };
                    let running = run_deactivation(
                        self.inner.clone(),
                        terminal.clone(),
                        current.environment.clone(),
                        mechanism,
                    )
                    .boxed()
                    .shared();
                    state.deactivating.insert(id, running.clone());
                    Step::Join(running)
                } else {
                    Step::Done
                }
            };
            match step {
                Step::Done => return,
                Step::Wait(running) => running.await,
                Step::Join(running) => return running.await,
            }
        }
    }

    async fn auto_activate(&self, terminal: &Arc<dyn Terminal>, environment: &Arc<PythonEnvironment>) {
        if self.inner.config.auto_activation == AutoActivation::Off {
            return;
        }
        let mechanism = wait_for_shell_integration(&self.inner.config, terminal.as_ref()).await;
        self.activate_with(terminal, environment, Some(mechanism)).await;
    }

    async fn on_opened(&self, terminal: Arc<dyn Terminal>) {
        if self.inner.config.auto_activation == AutoActivation::Off
            || self.is_managed(terminal.id())
        {
            return;
        }
        let cwd = terminal.cwd();
        let Some(environment) = self.inner.environments.environment_for(cwd.as_deref()).await
        else {
            debug!("[activation] No environment for terminal {}", terminal.id());
            return;
        };
        let mechanism = wait_for_shell_integration(&self.inner.config, terminal.as_ref()).await;

        {
            let id = terminal.id();
            let state = self.inner.state.lock().unwrap();
            if state.managed.contains(&id)
                || state.activating.contains_key(&id)
                || state.activated.contains_key(&id)
            {
                return;
            }
        }
        self.activate_with(&terminal, &environment, Some(mechanism)).await;
    }

    fn is_managed(&self, id: TerminalId) -> bool {
        self.inner.state.lock().unwrap().managed.contains(&id)
    }

    fn on_closed(&self, id: TerminalId) {
        debug!("[activation] Terminal {} closed", id);
        self.inner.state.lock().unwrap().evict(id);
    }
}

fn live(terminal: Option<&Arc<dyn Terminal>>) -> Option<Arc<dyn Terminal>> {
    terminal.filter(|terminal| !terminal.is_closed()).cloned()
}

fn folder_name(root: &Path) -> String {
    root.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.to_string_lossy().into_owned())
}

/// Shell integration if it shows up within the configured window, else the
/// legacy path.
async fn wait_for_shell_integration(config: &ActivationConfig, terminal: &dyn Terminal) -> Mechanism {
    let arrived = async {
        loop {
            if let Some(integration) = terminal.shell_integration() {
                return integration;
            }
            tokio::time::sleep(config.poll_interval).await;
        }
    };
    match tokio::time::timeout(config.shell_integration_timeout, arrived).await {
        Ok(integration) => Mechanism::ShellIntegration(integration),
        Err(_) => {
            debug!(
                "[activation] No shell integration in terminal {} after {:?}",
                terminal.id(),
                config.shell_integration_timeout
            );
            Mechanism::Legacy
        }
    }
}

/// Commands run strictly one after another.
async fn run_commands(
    terminal: &dyn Terminal,
    mechanism: &Mechanism,
    commands: &[String],
) -> anyhow::Result<()> {
    match mechanism {
        Mechanism::ShellIntegration(integration) => {
            for command in commands {
                let completion = integration.execute_command(command.clone()).await?;
                if let Some(code) = completion.exit_code.filter(|code| *code != 0) {
                    debug!("[activation] `{}` exited with {}", command, code);
                }
            }
        }
        Mechanism::Legacy => {
            for command in commands {
                terminal.send_text(command)?;
            }
        }
    }
    Ok(())
}

async fn run_activation(
    inner: Arc<Inner>,
    terminal: Arc<dyn Terminal>,
    environment: Arc<PythonEnvironment>,
    mechanism: Mechanism,
) {
    let id = terminal.id();
    let commands = activation_commands(&environment, terminal.shell());
    let outcome = if commands.is_empty() {
        debug!(
            "[activation] {} has no activation for {}",
            environment.display_name,
            terminal.shell()
        );
        Ok(false)
    } else {
        run_commands(terminal.as_ref(), &mechanism, &commands)
            .await
            .map(|()| true)
    };

    let recorded = {
        let mut state = inner.state.lock().unwrap();
        state.activating.remove(&id);
        let record = matches!(outcome, Ok(true)) && !terminal.is_closed();
        if record {
            state.activated.insert(
                id,
                Activation {
                    environment: environment.clone(),
                    shell_integration: matches!(mechanism, Mechanism::ShellIntegration(_)),
                },
            );
        }
        record
    };

    if let Err(e) = outcome {
        warn!(
            "[activation] Failed to activate {} in terminal {}: {:#}",
            environment.display_name, id, e
        );
    } else if recorded {
        info!(
            "[activation] Activated {} in terminal {}",
            environment.display_name, id
        );
        let _ = inner.events.send(ActivationStateChanged {
            terminal: id,
            environment,
            activated: true,
        });
    }
}

async fn run_deactivation(
    inner: Arc<Inner>,
    terminal: Arc<dyn Terminal>,
    environment: Arc<PythonEnvironment>,
    mechanism: Mechanism,
) {
    let id = terminal.id();
    let commands = deactivation_commands(&environment, terminal.shell());
    let outcome = run_commands(terminal.as_ref(), &mechanism, &commands).await;

    {
        let mut state = inner.state.lock().unwrap();
        state.deactivating.remove(&id);
        if outcome.is_ok()
            && state
                .activated
                .get(&id)
                .is_some_and(|current| current.environment.id == environment.id)
        {
            state.activated.remove(&id);
        }
    }

    match outcome {
        Ok(()) => {
            info!(
                "[activation] Deactivated {} in terminal {}",
                environment.display_name, id
            );
            let _ = inner.events.send(ActivationStateChanged {
                terminal: id,
                environment,
                activated: false,
            });
        }
        Err(e) => warn!(
            "[activation] Failed to deactivate {} in terminal {}: {:#}",
            environment.display_name, id, e
        ),
    }
}

async fn run_event_loop(inner: Weak<Inner>, mut events: broadcast::Receiver<TerminalEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("[activation] Missed {} terminal events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let controller = ActivationController { inner };
        match event {
            TerminalEvent::Opened(terminal) => {
                tokio::spawn(async move { controller.on_opened(terminal).await });
            }
            TerminalEvent::Closed(id) => controller.on_closed(id),
        }
    }
    debug!("[activation] Terminal event loop stopped");
}
