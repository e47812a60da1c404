#![cfg(unix)]
//! Activation controller against scripted terminals.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use env_discovery::{NativeEnvInfo, NativeEnvKind};
use env_registry::{Backend, PythonEnvironment, ShellKind, SystemBackend, Tools, VenvBackend};
use futures::future::BoxFuture;
use futures::FutureExt;
use term_activation::{
    ActivationConfig, ActivationController, AutoActivation, CommandCompletion, EnvironmentSource,
    ShellIntegration, Terminal, TerminalEvent, TerminalHost, TerminalId, TerminalOptions,
};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
struct Dispatch {
    command: String,
    started: Instant,
    finished: Instant,
}

type DispatchLog = Arc<Mutex<Vec<Dispatch>>>;

struct ScriptedIntegration {
    log: DispatchLog,
    delay: Duration,
    fail: bool,
}

impl ScriptedIntegration {
    fn new(log: &DispatchLog, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            delay,
            fail: false,
        })
    }

    fn failing(log: &DispatchLog) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            delay: Duration::from_millis(5),
            fail: true,
        })
    }
}

impl ShellIntegration for ScriptedIntegration {
    fn execute_command(&self, command: String) -> BoxFuture<'_, anyhow::Result<CommandCompletion>> {
        async move {
            let started = Instant::now();
            tokio::time::sleep(self.delay).await;
            self.log.lock().unwrap().push(Dispatch {
                command,
                started,
                finished: Instant::now(),
            });
            if self.fail {
                anyhow::bail!("shell integration went away");
            }
            Ok(CommandCompletion { exit_code: Some(0) })
        }
        .boxed()
    }
}

struct ScriptedTerminal {
    id: TerminalId,
    shell: ShellKind,
    cwd: Option<PathBuf>,
    integration: Mutex<Option<Arc<dyn ShellIntegration>>>,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl ScriptedTerminal {
    fn new(shell: ShellKind, cwd: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            id: TerminalId::new(),
            shell,
            cwd,
            integration: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn attach(&self, integration: Arc<dyn ShellIntegration>) {
        *self.integration.lock().unwrap() = Some(integration);
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

impl Terminal for ScriptedTerminal {
    fn id(&self) -> TerminalId {
        self.id
    }

    fn name(&self) -> String {
        format!("scripted {}", self.id)
    }

    fn shell(&self) -> ShellKind {
        self.shell
    }

    fn cwd(&self) -> Option<PathBuf> {
        self.cwd.clone()
    }

    fn shell_integration(&self) -> Option<Arc<dyn ShellIntegration>> {
        self.integration.lock().unwrap().clone()
    }

    fn send_text(&self, text: &str) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedHost {
    terminals: Mutex<Vec<Arc<ScriptedTerminal>>>,
    events: broadcast::Sender<TerminalEvent>,
    /// Attached to every terminal created through the host.
    integration: Option<Arc<dyn ShellIntegration>>,
}

impl ScriptedHost {
    fn new(integration: Option<Arc<dyn ShellIntegration>>) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            terminals: Mutex::new(Vec::new()),
            events,
            integration,
        })
    }

    fn open(&self, terminal: Arc<ScriptedTerminal>) {
        self.terminals.lock().unwrap().push(terminal.clone());
        let _ = self.events.send(TerminalEvent::Opened(terminal));
    }

    fn close(&self, terminal: &ScriptedTerminal) {
        terminal.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(TerminalEvent::Closed(terminal.id));
    }

    fn created(&self) -> usize {
        self.terminals.lock().unwrap().len()
    }
}

impl TerminalHost for ScriptedHost {
    fn create_terminal(&self, options: TerminalOptions) -> anyhow::Result<Arc<dyn Terminal>> {
        let terminal = ScriptedTerminal::new(ShellKind::Bash, options.cwd);
        if let Some(integration) = &self.integration {
            terminal.attach(integration.clone());
        }
        self.open(terminal.clone());
        Ok(terminal)
    }

    fn terminals(&self) -> Vec<Arc<dyn Terminal>> {
        self.terminals
            .lock()
            .unwrap()
            .iter()
            .map(|terminal| terminal.clone() as Arc<dyn Terminal>)
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.events.subscribe()
    }
}

struct FixedEnvironment(Option<Arc<PythonEnvironment>>);

impl EnvironmentSource for FixedEnvironment {
    fn environment_for<'a>(
        &'a self,
        _scope: Option<&'a Path>,
    ) -> BoxFuture<'a, Option<Arc<PythonEnvironment>>> {
        async move { self.0.clone() }.boxed()
    }
}

/// Counts how often the controller asks which environment applies.
struct CountingEnvironment {
    environment: Arc<PythonEnvironment>,
    lookups: AtomicUsize,
}

impl EnvironmentSource for CountingEnvironment {
    fn environment_for<'a>(
        &'a self,
        _scope: Option<&'a Path>,
    ) -> BoxFuture<'a, Option<Arc<PythonEnvironment>>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        async move { Some(self.environment.clone()) }.boxed()
    }
}

fn venv(prefix: &str) -> Arc<PythonEnvironment> {
    let backend = VenvBackend::new(Arc::new(Tools::default()), None);
    Arc::new(
        backend
            .build(&NativeEnvInfo {
                prefix: Some(PathBuf::from(prefix)),
                kind: Some(NativeEnvKind::Venv),
                version: Some("3.12.1".into()),
                ..Default::default()
            })
            .unwrap(),
    )
}

fn fast_config() -> ActivationConfig {
    ActivationConfig {
        auto_activation: AutoActivation::Command,
        shell_integration_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
    }
}

fn controller(
    host: &Arc<ScriptedHost>,
    environment: Option<Arc<PythonEnvironment>>,
    config: ActivationConfig,
) -> ActivationController {
    ActivationController::new(host.clone(), Arc::new(FixedEnvironment(environment)), config)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_concurrent_activations_share_one_run() {
    let log = DispatchLog::default();
    let scripted = ScriptedTerminal::new(ShellKind::Bash, None);
    scripted.attach(ScriptedIntegration::new(&log, Duration::from_millis(50)));
    let terminal: Arc<dyn Terminal> = scripted.clone();
    let host = ScriptedHost::new(None);
    let controller = controller(&host, None, fast_config());
    let env = venv("/work/app/.venv");

    let (first, second) = tokio::join!(
        async {
            controller.activate(&terminal, &env).await;
            Instant::now()
        },
        async {
            controller.activate(&terminal, &env).await;
            Instant::now()
        }
    );

    let dispatched = log.lock().unwrap().clone();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].command, "source /work/app/.venv/bin/activate");
    assert!(first >= dispatched[0].finished);
    assert!(second >= dispatched[0].finished);
    assert!(controller.is_activated(terminal.id(), Some(&env)));
    assert_eq!(controller.get_environment(terminal.id()).unwrap().id, env.id);

    // Already active: nothing is sent again.
    controller.activate(&terminal, &env).await;
    assert_eq!(log.lock().unwrap().len(), 1);
    assert!(scripted.sent().is_empty());
}

#[tokio::test]
async fn test_activate_waits_for_deactivation() {
    let log = DispatchLog::default();
    let scripted = ScriptedTerminal::new(ShellKind::Bash, None);
    scripted.attach(ScriptedIntegration::new(&log, Duration::from_millis(40)));
    let terminal: Arc<dyn Terminal> = scripted.clone();
    let host = ScriptedHost::new(None);
    let controller = controller(&host, None, fast_config());
    let first = venv("/work/a/.venv");
    let second = venv("/work/b/.venv");

    controller.activate(&terminal, &first).await;
    tokio::join!(
        controller.deactivate(&terminal),
        controller.activate(&terminal, &second)
    );

    let dispatched = log.lock().unwrap().clone();
    let commands: Vec<_> = dispatched.iter().map(|d| d.command.as_str()).collect();
    assert_eq!(
        commands,
        vec![
            "source /work/a/.venv/bin/activate",
            "deactivate",
            "source /work/b/.venv/bin/activate",
        ]
    );
    assert!(dispatched[2].started >= dispatched[1].finished);
    assert!(controller.is_activated(terminal.id(), Some(&second)));
    assert!(!controller.is_activated(terminal.id(), Some(&first)));
}

#[tokio::test]
async fn test_switching_environments_clears_old_record_while_in_flight() {
    let log = DispatchLog::default();
    let scripted = ScriptedTerminal::new(ShellKind::Bash, None);
    scripted.attach(ScriptedIntegration::new(&log, Duration::from_millis(200)));
    let terminal: Arc<dyn Terminal> = scripted.clone();
    let host = ScriptedHost::new(None);
    let controller = controller(&host, None, fast_config());
    let first = venv("/work/a/.venv");
    let second = venv("/work/b/.venv");

    controller.activate(&terminal, &first).await;
    assert!(controller.is_activated(terminal.id(), Some(&first)));
    let mut changes = controller.subscribe();

    let switching = tokio::spawn({
        let controller = controller.clone();
        let terminal = terminal.clone();
        let second = second.clone();
        async move { controller.activate(&terminal, &second).await }
    });

    assert!(eventually(|| !controller.is_activated(terminal.id(), Some(&first))).await);
    // Only the first activation has completed so far.
    assert_eq!(log.lock().unwrap().len(), 1);
    assert!(controller.get_environment(terminal.id()).is_none());
    let left = changes.try_recv().unwrap();
    assert!(!left.activated);
    assert_eq!(left.environment.id, first.id);

    switching.await.unwrap();
    assert!(controller.is_activated(terminal.id(), Some(&second)));
    let entered = changes.try_recv().unwrap();
    assert!(entered.activated);
    assert_eq!(entered.environment.id, second.id);
}

#[tokio::test]
async fn test_failed_switch_leaves_terminal_unrecorded() {
    let log = DispatchLog::default();
    let scripted = ScriptedTerminal::new(ShellKind::Bash, None);
    scripted.attach(ScriptedIntegration::new(&log, Duration::from_millis(5)));
    let terminal: Arc<dyn Terminal> = scripted.clone();
    let host = ScriptedHost::new(None);
    let controller = controller(&host, None, fast_config());
    let first = venv("/work/a/.venv");
    let second = venv("/work/b/.venv");

    controller.activate(&terminal, &first).await;
    scripted.attach(ScriptedIntegration::failing(&log));
    controller.activate(&terminal, &second).await;

    assert!(!controller.is_activated(terminal.id(), Some(&first)));
    assert!(!controller.is_activated(terminal.id(), None));
    assert!(controller.get_environment(terminal.id()).is_none());
}

#[tokio::test]
async fn test_managed_terminal_skips_open_handler() {
    let env = venv("/work/app/.venv");
    let host = ScriptedHost::new(None);
    let source = Arc::new(CountingEnvironment {
        environment: env.clone(),
        lookups: AtomicUsize::new(0),
    });
    let controller = ActivationController::new(host.clone(), source.clone(), fast_config());
    controller.initialize().await;

    let created = controller.create(&env, TerminalOptions::default()).await.unwrap();
    assert!(controller.is_activated(created.id(), Some(&env)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(source.lookups.load(Ordering::SeqCst), 0);
    controller.shutdown();
}

#[tokio::test]
async fn test_missing_shell_integration_falls_back_once() {
    let env = venv("/work/app/.venv");
    let host = ScriptedHost::new(None);
    let controller = controller(&host, Some(env.clone()), fast_config());
    controller.initialize().await;
    let mut changes = controller.subscribe();

    let scripted = ScriptedTerminal::new(ShellKind::Bash, Some(PathBuf::from("/work/app")));
    let opened = Instant::now();
    host.open(scripted.clone());

    let change = tokio::time::timeout(Duration::from_secs(2), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(change.activated);
    assert_eq!(change.terminal, scripted.id);
    assert!(opened.elapsed() >= Duration::from_millis(200));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(scripted.sent(), vec!["source /work/app/.venv/bin/activate"]);
    controller.shutdown();
}

#[tokio::test]
async fn test_late_shell_integration_is_used() {
    let log = DispatchLog::default();
    let env = venv("/work/app/.venv");
    let host = ScriptedHost::new(None);
    let controller = controller(&host, Some(env.clone()), fast_config());
    controller.initialize().await;
    let mut changes = controller.subscribe();

    let scripted = ScriptedTerminal::new(ShellKind::Fish, None);
    host.open(scripted.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    scripted.attach(ScriptedIntegration::new(&log, Duration::from_millis(5)));

    let change = tokio::time::timeout(Duration::from_secs(2), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(change.activated);
    let dispatched = log.lock().unwrap().clone();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].command, "source /work/app/.venv/bin/activate.fish");
    assert!(scripted.sent().is_empty());
}

#[tokio::test]
async fn test_existing_terminals_activated_on_initialize() {
    let env = venv("/work/app/.venv");
    let host = ScriptedHost::new(None);
    let scripted = ScriptedTerminal::new(ShellKind::Zsh, None);
    host.open(scripted.clone());

    let controller = controller(&host, Some(env.clone()), fast_config());
    controller.initialize().await;
    assert!(controller.is_activated(scripted.id, Some(&env)));
    assert_eq!(scripted.sent().len(), 1);

    // A second initialize is a no-op.
    controller.initialize().await;
    assert_eq!(scripted.sent().len(), 1);
}

#[tokio::test]
async fn test_closed_terminal_is_evicted() {
    let log = DispatchLog::default();
    let env = venv("/work/app/.venv");
    let host = ScriptedHost::new(Some(ScriptedIntegration::new(&log, Duration::from_millis(5))));
    let controller = controller(&host, Some(env.clone()), fast_config());
    controller.initialize().await;

    let terminal = controller
        .get_project_terminal(Path::new("/work/app"), &env, false)
        .await
        .unwrap();
    assert!(controller.is_activated(terminal.id(), None));

    let scripted = host.terminals.lock().unwrap()[0].clone();
    host.close(&scripted);
    let id = terminal.id();
    assert!(eventually(|| controller.get_environment(id).is_none()).await);

    let replacement = controller
        .get_project_terminal(Path::new("/work/app"), &env, false)
        .await
        .unwrap();
    assert_ne!(replacement.id(), id);
    assert_eq!(host.created(), 2);
}

#[tokio::test]
async fn test_project_and_dedicated_terminals_are_reused() {
    let log = DispatchLog::default();
    let env = venv("/work/app/.venv");
    let host = ScriptedHost::new(Some(ScriptedIntegration::new(&log, Duration::from_millis(5))));
    let controller = controller(&host, None, fast_config());
    let project = Path::new("/work/app");

    let first = controller.get_project_terminal(project, &env, false).await.unwrap();
    let again = controller.get_project_terminal(project, &env, false).await.unwrap();
    assert_eq!(first.id(), again.id());
    assert_eq!(log.lock().unwrap().len(), 1);

    let fresh = controller.get_project_terminal(project, &env, true).await.unwrap();
    assert_ne!(fresh.id(), first.id());

    let script = controller
        .get_dedicated_terminal("main.py", project, &env, false)
        .await
        .unwrap();
    let same_script = controller
        .get_dedicated_terminal("main.py", project, &env, false)
        .await
        .unwrap();
    let other_script = controller
        .get_dedicated_terminal("tool.py", project, &env, false)
        .await
        .unwrap();
    assert_eq!(script.id(), same_script.id());
    assert_ne!(script.id(), other_script.id());
    assert_eq!(host.created(), 4);
}

#[tokio::test]
async fn test_failed_activation_is_swallowed() {
    let log = DispatchLog::default();
    let scripted = ScriptedTerminal::new(ShellKind::Bash, None);
    scripted.attach(ScriptedIntegration::failing(&log));
    let terminal: Arc<dyn Terminal> = scripted.clone();
    let host = ScriptedHost::new(None);
    let controller = controller(&host, None, fast_config());
    let env = venv("/work/app/.venv");

    controller.activate(&terminal, &env).await;
    assert!(!controller.is_activated(terminal.id(), None));

    // Nothing is left in flight: a retry runs the sequence again.
    controller.activate(&terminal, &env).await;
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_legacy_deactivation_types_commands() {
    let scripted = ScriptedTerminal::new(ShellKind::Bash, None);
    let terminal: Arc<dyn Terminal> = scripted.clone();
    let host = ScriptedHost::new(None);
    let controller = controller(&host, None, fast_config());
    let mut changes = controller.subscribe();
    let env = venv("/work/app/.venv");

    controller.activate(&terminal, &env).await;
    assert!(controller.is_activated(terminal.id(), Some(&env)));
    controller.deactivate(&terminal).await;
    assert!(!controller.is_activated(terminal.id(), None));
    assert_eq!(
        scripted.sent(),
        vec!["source /work/app/.venv/bin/activate", "deactivate"]
    );

    assert!(changes.try_recv().unwrap().activated);
    assert!(!changes.try_recv().unwrap().activated);

    // Deactivating an idle terminal does nothing.
    controller.deactivate(&terminal).await;
    assert_eq!(scripted.sent().len(), 2);
}

#[tokio::test]
async fn test_environment_without_activation_is_not_recorded() {
    let system = Arc::new(
        SystemBackend
            .build(&NativeEnvInfo {
                executable: Some(PathBuf::from("/usr/bin/python3")),
                prefix: Some(PathBuf::from("/usr")),
                kind: Some(NativeEnvKind::LinuxGlobal),
                version: Some("3.11.2".into()),
                ..Default::default()
            })
            .unwrap(),
    );
    let scripted = ScriptedTerminal::new(ShellKind::Bash, None);
    let terminal: Arc<dyn Terminal> = scripted.clone();
    let host = ScriptedHost::new(None);
    let controller = controller(&host, None, fast_config());

    controller.activate(&terminal, &system).await;
    assert!(scripted.sent().is_empty());
    assert!(!controller.is_activated(terminal.id(), None));
}

#[tokio::test]
async fn test_auto_activation_off() {
    let env = venv("/work/app/.venv");
    let host = ScriptedHost::new(None);
    let config = ActivationConfig {
        auto_activation: AutoActivation::Off,
        ..fast_config()
    };
    let controller = controller(&host, Some(env.clone()), config);
    controller.initialize().await;

    let scripted = ScriptedTerminal::new(ShellKind::Bash, None);
    host.open(scripted.clone());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(scripted.sent().is_empty());

    let created = controller.create(&env, TerminalOptions::default()).await.unwrap();
    assert!(!controller.is_activated(created.id(), None));
}
