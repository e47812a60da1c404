//! envctl entry point.
//!
//! Drives discovery and the environment registries against a real discovery
//! worker, for scripting and for checking what an editor session would see.

mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use env_discovery::{DiscoveryService, NativeEnvKind, NativeInfo, ProcessLocator, RefreshScope};
use env_registry::{
    default_state_path, normalize_path, BackendKind, PythonEnvironment, Registries, SetScope,
    ShellKind, StateStore, StaticProjects, Tools,
};
use log::debug;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "envctl")]
#[command(about = "Discover, select and activate Python environments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Discovery worker binary (default: `pet` on PATH)
    #[arg(long, global = true)]
    locator: Option<PathBuf>,

    /// Settings file (default: ~/.config/pyenvs/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run discovery and print every environment and manager found
    Refresh {
        /// Ignore cached results
        #[arg(long)]
        hard: bool,

        /// Only look for one kind of environment (e.g. Venv, Conda)
        #[arg(long, conflicts_with = "path")]
        kind: Option<NativeEnvKind>,

        /// Only search these directories
        #[arg(long)]
        path: Vec<PathBuf>,
    },

    /// Resolve an interpreter or environment directory
    Resolve { path: PathBuf },

    /// List known environments
    List {
        /// Only one backend (venv, system, conda)
        #[arg(long)]
        backend: Option<BackendKind>,
    },

    /// Show the environment selected for a project
    Get { project: PathBuf },

    /// Select an environment for a project, or clear the selection
    Set {
        project: PathBuf,
        /// Interpreter or environment directory; omit to clear
        environment: Option<PathBuf>,
    },

    /// Print the commands that activate an environment in a shell
    Activation {
        environment: PathBuf,

        /// bash, zsh, sh, fish, csh, tcsh, nu, pwsh, cmd, gitbash
        #[arg(long, default_value = "bash")]
        shell: ShellKind,
    },
}

struct Session {
    discovery: Arc<DiscoveryService>,
    registries: Registries,
}

impl Session {
    async fn start(settings: &settings::Settings, projects: Vec<PathBuf>) -> Self {
        let locator = ProcessLocator::new(
            settings.discovery.worker_path.clone(),
            settings.discovery.configure_options(),
        );
        let discovery = Arc::new(DiscoveryService::new(Arc::new(locator)));
        let projects = Arc::new(StaticProjects::new(projects));
        let store = Arc::new(StateStore::open(
            settings.state_file.clone().unwrap_or_else(default_state_path),
        ));
        let tools = Arc::new(Tools::new(settings.discovery.conda_executable.clone()));

        let registries =
            Registries::register_all(discovery.clone(), projects, store, tools).await;
        Self {
            discovery,
            registries,
        }
    }

    fn shutdown(&self) {
        self.registries.shutdown();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut settings = match &cli.settings {
        Some(path) => settings::load_settings_from(path),
        None => settings::load_settings(),
    };
    if let Some(locator) = cli.locator {
        settings.discovery.worker_path = locator;
    }
    debug!("Settings: {:?}", settings);

    let mut projects: Vec<PathBuf> = settings.projects.iter().map(|p| normalize_path(p)).collect();
    match &cli.command {
        Commands::Get { project } | Commands::Set { project, .. } => {
            projects.push(normalize_path(project));
        }
        _ => {}
    }

    let session = Session::start(&settings, projects).await;
    let result = run(cli.command, &session, cli.json).await;
    session.shutdown();
    result
}

async fn run(command: Commands, session: &Session, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Refresh { hard, kind, path } => {
            let scope = if path.is_empty() {
                RefreshScope::from(kind)
            } else {
                RefreshScope::Paths(path.iter().map(|p| normalize_path(p)).collect())
            };
            let cancel = cancel_on_ctrl_c();
            let items = session
                .discovery
                .refresh(hard, &scope, &cancel)
                .await
                .with_context(|| format!("Discovery failed for scope {}", scope.key()))?;
            print_native(&items, json)
        }
        Commands::Resolve { path } => {
            let env = resolve(session, &path).await?;
            print_environments(&[env], json)
        }
        Commands::List { backend } => {
            session.registries.initialize().await;
            let mut envs = Vec::new();
            for registry in session.registries.iter() {
                if backend.is_some_and(|kind| kind != registry.kind()) {
                    continue;
                }
                envs.extend(registry.environments());
            }
            print_environments(&envs, json)
        }
        Commands::Get { project } => {
            let project = normalize_path(&project);
            match session.registries.environment_for(Some(&project)).await {
                Some(env) => print_environments(&[env], json),
                None if json => print_json(&serde_json::Value::Null),
                None => {
                    println!("No environment selected for {}", project.display());
                    Ok(())
                }
            }
        }
        Commands::Set {
            project,
            environment,
        } => {
            let project = normalize_path(&project);
            match environment {
                Some(path) => {
                    let env = resolve(session, &path).await?;
                    let registry = session
                        .registries
                        .get(env.backend)
                        .with_context(|| format!("No {} registry", env.backend))?;
                    registry
                        .set(SetScope::Project(project.clone()), Some(env.clone()))
                        .await?;
                    if json {
                        return print_json(&*env);
                    }
                    println!("{} -> {}", project.display(), env.display_name);
                    Ok(())
                }
                None => {
                    for registry in session.registries.iter() {
                        registry.set(SetScope::Project(project.clone()), None).await?;
                    }
                    if !json {
                        println!("Cleared selection for {}", project.display());
                    }
                    Ok(())
                }
            }
        }
        Commands::Activation { environment, shell } => {
            let env = resolve(session, &environment).await?;
            let commands = term_activation::activation_commands(&env, shell);
            if json {
                return print_json(&commands);
            }
            if commands.is_empty() {
                println!("# {} needs no activation in {}", env.display_name, shell);
            }
            for command in commands {
                println!("{command}");
            }
            Ok(())
        }
    }
}

async fn resolve(session: &Session, path: &Path) -> anyhow::Result<Arc<PythonEnvironment>> {
    let path = normalize_path(path);
    match session.registries.resolve(&path).await {
        Some(env) => Ok(env),
        None => bail!("{} is not a known Python environment", path.display()),
    }
}

/// A token cancelled by Ctrl-C, so a long discovery stops the worker cleanly.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_native(items: &[NativeInfo], json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(items);
    }
    for item in items {
        match item {
            NativeInfo::Environment(env) => println!(
                "{:<18} {:<10} {}",
                env.kind.map(|k| k.to_string()).unwrap_or_else(|| "-".into()),
                env.version.as_deref().unwrap_or("-"),
                env.executable
                    .as_deref()
                    .or(env.prefix.as_deref())
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".into()),
            ),
            NativeInfo::Manager(manager) => println!(
                "{:<18} {:<10} {}",
                format!("manager:{}", manager.tool),
                manager.version.as_deref().unwrap_or("-"),
                manager.executable.display(),
            ),
        }
    }
    Ok(())
}

fn print_environments(envs: &[Arc<PythonEnvironment>], json: bool) -> anyhow::Result<()> {
    if json {
        let envs: Vec<&PythonEnvironment> = envs.iter().map(Arc::as_ref).collect();
        return print_json(&envs);
    }
    for env in envs {
        println!(
            "{:<7} {:<32} {}",
            env.backend,
            env.display_name,
            env.environment_path.display()
        );
    }
    Ok(())
}
