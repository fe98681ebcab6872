mod config;
mod reader;
mod session;
mod signals;
mod supervisor;

use clap::Parser;
use config::HarnessConfig;
use session::SessionRunner;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Run an AI coding agent CLI as a supervised child process: Ctrl-C
/// terminates it cleanly, Ctrl-Z suspends it together with the harness.
#[derive(Parser, Debug)]
#[command(name = "shepherd", version, about)]
pub struct Cli {
    /// Agent command and arguments (overrides config), e.g. `-- claude -p "{prompt}"`
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "shepherd.toml")]
    config: PathBuf,

    /// Prompt file path (overrides config)
    #[arg(short, long)]
    prompt: Option<PathBuf>,

    /// Write the agent's stdout to this file instead of the terminal
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Name used in interrupt messages (overrides config)
    #[arg(long)]
    label: Option<String>,

    /// Seconds to wait after SIGTERM before force-killing (overrides config)
    #[arg(long, value_name = "SECS")]
    terminate_timeout: Option<u64>,

    /// Give the agent the terminal instead of capturing its output
    #[arg(short, long)]
    interactive: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (signal forwarding, reader joins)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Merge CLI overrides into the loaded config.
    fn apply(&self, config: &mut HarnessConfig) {
        if let Some((command, args)) = self.command.split_first() {
            config.agent.command = command.clone();
            config.agent.args = args.to_vec();
            if self.label.is_none() {
                config.agent.label = program_name(command);
            }
        }
        if let Some(label) = &self.label {
            config.agent.label = label.clone();
        }
        if let Some(secs) = self.terminate_timeout {
            config.supervisor.terminate_timeout_secs = secs;
        }
        if let Some(prompt) = &self.prompt {
            config.session.prompt_file = prompt.clone();
        }
        if let Some(output) = &self.output {
            config.session.output_file = Some(output.clone());
        }
        if self.interactive {
            config.session.interactive = true;
        }
    }
}

fn program_name(command: &str) -> String {
    std::path::Path::new(command)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.to_string())
}

/// Prompt text for `{prompt}` placeholders; only read when the args use one.
fn load_prompt(config: &HarnessConfig) -> std::io::Result<String> {
    if !config.agent.args.iter().any(|arg| arg.contains("{prompt}")) {
        return Ok(String::new());
    }
    std::fs::read_to_string(&config.session.prompt_file)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match HarnessConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };
    cli.apply(&mut config);

    if cli.dry_run {
        println!("shepherd v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("{config:#?}");
        return ExitCode::SUCCESS;
    }

    let prompt = match load_prompt(&config) {
        Ok(prompt) => prompt,
        Err(e) => {
            eprintln!(
                "error: failed to read prompt file {}: {e}",
                config.session.prompt_file.display()
            );
            return ExitCode::from(2);
        }
    };

    let runner = SessionRunner::new(
        config.agent.clone(),
        config.session.interactive,
        config.supervisor.terminate_timeout(),
    );

    tracing::debug!(
        label = %config.agent.label,
        interactive = runner.is_interactive(),
        "starting session"
    );

    match runner.run(&prompt, config.session.output_file.as_deref()).await {
        Ok(result) => {
            if let Some(path) = &result.output_file {
                tracing::info!(
                    path = %path.display(),
                    bytes = result.output_bytes,
                    pid = result.pid,
                    duration_ms = result.duration.as_millis() as u64,
                    "agent output written"
                );
            }
            if !result.stderr.is_empty() {
                eprint!("{}", result.stderr);
            }
            ExitCode::from(result.exit_code.clamp(0, 255) as u8)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
