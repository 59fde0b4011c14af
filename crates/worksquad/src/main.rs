//! Worksquad
//!
//! Run coding agents side by side on isolated branches.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use records::DevServerConfig;
use tokio_util::sync::CancellationToken;

use worksquad::clipboard::Clipboard;
use worksquad::config::Config;
use worksquad::scheduler::{
    self, InstanceSummary, NewInstance, Scheduler, SchedulerEvent, SchedulerSettings,
};
use worksquad::settings::{load_settings, save_settings, settings_path};
use worksquad::storage::StateStore;
use worksquad::worktree::find_repo_root;
use worksquad::{Backends, DevServerTimings, GitWorktreeFactory, TmuxSessionFactory};

/// Worksquad - run coding agents side by side on isolated branches.
#[derive(Parser, Debug)]
#[command(name = "worksquad")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository to work on (defaults to the current directory)
    #[arg(short = 'C', long, global = true, value_name = "DIR")]
    pub repo: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Keep instances monitored until Ctrl-C
    Run,

    /// Create and start a new instance
    New {
        /// Unique title
        title: String,

        /// Prompt sent once the agent is running
        #[arg(long, short)]
        prompt: Option<String>,

        /// Agent command (defaults to the configured program)
        #[arg(long)]
        program: Option<String>,

        /// Confirm agent prompts automatically
        #[arg(long, short = 'y')]
        auto_yes: bool,
    },

    /// List instances
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Commit work and detach an instance
    Pause {
        /// Instance title
        title: String,
    },

    /// Resume a paused instance
    Resume {
        /// Instance title
        title: String,
    },

    /// Kill an instance, removing its worktree and branch
    Kill {
        /// Instance title
        title: String,
    },

    /// Send a prompt to an instance's agent
    Prompt {
        /// Instance title
        title: String,

        /// Prompt text
        text: String,
    },

    /// Attach the terminal to an instance's agent
    Attach {
        /// Instance title
        title: String,
    },

    /// Kill every instance and clear the state file
    Reset,

    /// Manage dev servers
    #[command(subcommand)]
    Dev(DevCommands),
}

/// Subcommands for dev server management.
#[derive(Subcommand, Debug, Clone)]
pub enum DevCommands {
    /// Build and start an instance's dev server
    Start {
        /// Instance title
        title: String,
    },

    /// Stop an instance's dev server
    Stop {
        /// Instance title
        title: String,
    },

    /// Show an instance's dev server status and output
    Status {
        /// Instance title
        title: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Attach the terminal to an instance's running dev server
    Attach {
        /// Instance title
        title: String,
    },

    /// Configure the repository's dev server and apply it to existing
    /// instances (stopping any running server)
    Config {
        /// Only reconfigure this instance
        title: Option<String>,

        /// Long-running dev command
        #[arg(long)]
        dev_command: String,

        /// One-shot build command run before the dev command
        #[arg(long)]
        build_command: Option<String>,

        /// Environment variable for the dev command (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_var)]
        env: Vec<(String, String)>,
    },
}

/// Parses `KEY=VALUE`.
fn parse_env_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() && !key.contains(char::is_whitespace) => {
            Ok((key.to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard =
        worksquad::logging::init(&config.log_dir(), &config.daemon.log_level, cli.verbose)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Worksquad starting");

    let start_dir = match &cli.repo {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let repo_root = find_repo_root(&start_dir).await?;

    let mut scheduler = build_scheduler(&config, &repo_root);
    scheduler.load().await?;
    let mut events = scheduler.subscribe();

    match cli.command {
        Commands::Run => {
            run_foreground(scheduler).await?;
            return Ok(());
        }
        Commands::New {
            title,
            prompt,
            program,
            auto_yes,
        } => {
            let summary = scheduler
                .create(NewInstance {
                    title,
                    prompt,
                    program,
                    auto_yes: auto_yes.then_some(true),
                })
                .await?;
            println!(
                "Created '{}' on branch {} in {}",
                summary.title,
                summary.branch,
                summary
                    .worktree_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
        }
        Commands::List { json } => {
            scheduler.metadata_tick().await;
            let summaries = scheduler.summaries();
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                print_instances_table(&summaries);
            }
        }
        Commands::Pause { title } => {
            scheduler.pause(&title).await?;
            println!("Paused '{title}'. Work is committed locally on its branch.");
        }
        Commands::Resume { title } => {
            scheduler.resume(&title).await?;
            println!("Resumed '{title}'.");
        }
        Commands::Kill { title } => {
            scheduler.kill(&title).await?;
            println!("Killed '{title}'.");
        }
        Commands::Prompt { title, text } => {
            scheduler.send_prompt(&title, &text).await?;
        }
        Commands::Attach { title } => {
            let detached = scheduler.attach(&title).await?;
            // Ends when the operator detaches or the session exits.
            let _ = detached.await;
        }
        Commands::Reset => {
            let titles: Vec<String> = scheduler.summaries().into_iter().map(|s| s.title).collect();
            let mut failed = 0;
            for title in titles {
                if let Err(e) = scheduler.kill(&title).await {
                    eprintln!("Failed to kill '{title}': {e}");
                    failed += 1;
                }
            }
            if failed > 0 {
                // Kill already saved the survivors; keep them so the kill can be retried.
                anyhow::bail!("{failed} instance(s) could not be removed");
            }
            StateStore::for_repo(&config.daemon.data_dir, &repo_root).delete_all_instances()?;
            println!("All instances removed.");
            return Ok(());
        }
        Commands::Dev(DevCommands::Start { title }) => {
            scheduler.start_dev_server(&title).await?;
            println!("Dev server for '{title}' is running.");
        }
        Commands::Dev(DevCommands::Stop { title }) => {
            scheduler.stop_dev_server(&title).await?;
            println!("Dev server for '{title}' stopped.");
        }
        Commands::Dev(DevCommands::Status { title, json }) => {
            match scheduler.dev_server_status(&title).await? {
                Some(status) if json => println!("{}", serde_json::to_string_pretty(&status)?),
                Some(status) => {
                    println!("Status:      {}", status.status);
                    println!("Dev command: {}", status.config.dev_command);
                    println!("Crashes:     {}", status.crash_count);
                    if !status.output.is_empty() {
                        println!();
                        println!("{}", status.output);
                    }
                }
                None => println!("No dev server has been started for '{title}'."),
            }
        }
        Commands::Dev(DevCommands::Attach { title }) => {
            let detached = scheduler.attach_dev_server(&title).await?;
            let _ = detached.await;
        }
        Commands::Dev(DevCommands::Config {
            title,
            dev_command,
            build_command,
            env,
        }) => {
            let dev_config =
                configure_dev_server(&repo_root, &dev_command, build_command.as_deref(), &env)?;
            match title {
                Some(title) => {
                    scheduler.reconfigure_dev_server(&title, dev_config).await?;
                    println!("Reconfigured dev server for '{title}'.");
                }
                None => {
                    let titles = scheduler.reconfigure_dev_servers(dev_config).await?;
                    if !titles.is_empty() {
                        println!("Reconfigured dev servers for: {}", titles.join(", "));
                    }
                }
            }
        }
    }

    while let Ok(event) = events.try_recv() {
        if let SchedulerEvent::Notice { message } = event {
            eprintln!("{message}");
        }
    }
    scheduler.save()?;
    Ok(())
}

fn build_scheduler(config: &Config, repo_root: &Path) -> Scheduler {
    let backends = Backends {
        sessions: Arc::new(TmuxSessionFactory),
        worktrees: Arc::new(GitWorktreeFactory::new(
            config.daemon.data_dir.clone(),
            config.session.branch_prefix.clone(),
        )),
        clipboard: Clipboard::detect(),
        dev_server_timings: DevServerTimings::from(&config.dev_server),
    };
    let store = StateStore::for_repo(&config.daemon.data_dir, repo_root);
    let settings = SchedulerSettings::from_config(config, repo_root.to_path_buf());
    Scheduler::new(settings, store, backends)
}

/// Runs the scheduler loop, printing events, until Ctrl-C.
async fn run_foreground(scheduler: Scheduler) -> anyhow::Result<()> {
    let mut events = scheduler.subscribe();
    let token = CancellationToken::new();
    let (_handle, commands) = scheduler::channel();
    let loop_task = tokio::spawn(scheduler.run(commands, token.clone()));

    println!("Monitoring instances. Press Ctrl-C to stop.");
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SchedulerEvent::StatusChanged { title, status } => {
                    println!("{title}: {status}");
                }
                SchedulerEvent::DevServerCrashed { title, crash_count } => {
                    println!("{title}: dev server crashed (crash count {crash_count})");
                }
                SchedulerEvent::InstanceRemoved { title } => {
                    println!("{title}: removed");
                }
                SchedulerEvent::Notice { message } => {
                    eprintln!("{message}");
                }
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Received shutdown signal");
    token.cancel();

    loop_task.await.context("Scheduler task panicked")??;
    Ok(())
}

fn configure_dev_server(
    repo_root: &Path,
    dev_command: &str,
    build_command: Option<&str>,
    env: &[(String, String)],
) -> anyhow::Result<DevServerConfig> {
    let mut settings = load_settings(repo_root)?;
    settings.dev_command = dev_command.to_string();
    if let Some(build) = build_command {
        settings.build_command = build.to_string();
    }
    if !env.is_empty() {
        settings.env = env.iter().cloned().collect::<BTreeMap<_, _>>();
    }
    save_settings(&mut settings, repo_root)?;
    println!("Saved {}", settings_path(repo_root).display());
    Ok(settings.to_config())
}

/// Print instances in a formatted ASCII table.
fn print_instances_table(instances: &[InstanceSummary]) {
    if instances.is_empty() {
        println!("No instances.");
        return;
    }

    let title_width = instances
        .iter()
        .map(|i| i.title.len())
        .max()
        .unwrap_or(5)
        .max(5);
    let branch_width = instances
        .iter()
        .map(|i| i.branch.len())
        .max()
        .unwrap_or(6)
        .max(6);

    println!(
        "{:<title_width$}  {:<branch_width$}  {:<8}  {:>12}  {:<8}",
        "TITLE", "BRANCH", "STATUS", "DIFF", "DEV"
    );
    println!("{}", "-".repeat(title_width + branch_width + 40));

    for instance in instances {
        let diff = format!("+{} -{}", instance.added, instance.removed);
        let dev = instance
            .dev_server
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<title_width$}  {:<branch_width$}  {:<8}  {:>12}  {:<8}",
            instance.title,
            instance.branch,
            instance.status.to_string(),
            diff,
            dev
        );
    }

    println!();
    println!("Total: {} instance(s)", instances.len());
}
