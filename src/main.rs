use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Parser};
use log::{error, info, warn};

use linkwatch::alert::Dispatcher;
use linkwatch::isp::IspVerifier;
use linkwatch::{Config, Error, Features, Monitor, Overrides, Toggle, config, diagnostics};

/// Check network interface connectivity and alert on state changes.
#[derive(Parser, Debug)]
#[command(name = "linkwatch", version, about, long_about = None)]
#[command(group(ArgGroup::new("mode").args(["show_config", "test_alerts", "test_whois"])))]
#[command(after_help = r#"FEATURES:
    Each feature is enabled when its settings are present; flags override
    that default for a single run.

    email      SMTP alerts. Requires SMTP_SENDER, SMTP_RECIPIENT, SMTP_SERVER,
               SMTP_LOGIN, SMTP_PASSWORD (config file or environment).
    telegram   Bot API alerts. Requires TELEGRAM_BOT_TOKEN, TELEGRAM_CHAT_ID.
    whois      ISP verification after connectivity passes. Requires
               [whois] enabled = true and expected_org on the interface.
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: <config dir>/linkwatch/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// .env file to load before reading the environment
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// Force-enable email alerts
    #[arg(long, conflicts_with = "no_email")]
    email: bool,
    /// Disable email alerts
    #[arg(long)]
    no_email: bool,

    /// Force-enable Telegram alerts
    #[arg(long, conflicts_with = "no_telegram")]
    telegram: bool,
    /// Disable Telegram alerts
    #[arg(long)]
    no_telegram: bool,

    /// Force-enable WHOIS ISP verification
    #[arg(long, conflicts_with = "no_whois")]
    whois: bool,
    /// Disable WHOIS ISP verification
    #[arg(long)]
    no_whois: bool,

    /// Check connectivity but do not save state or send alerts
    #[arg(long)]
    dry_run: bool,

    /// Print effective configuration and exit
    #[arg(long)]
    show_config: bool,

    /// Send a test message through enabled alert channels and exit
    #[arg(long)]
    test_alerts: bool,

    /// Fetch public IP and run WHOIS lookup, then exit
    #[arg(long)]
    test_whois: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            email: Toggle::from_flags(self.email, self.no_email),
            telegram: Toggle::from_flags(self.telegram, self.no_telegram),
            whois: Toggle::from_flags(self.whois, self.no_whois),
            dry_run: self.dry_run,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::init_from_env(env_logger::Env::default().default_filter_or(level));

    match run(&cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<bool, Error> {
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)?;
        }
        None => match config::optional_env_file(dotenvy::dotenv()) {
            Ok(Some(path)) => info!("Loaded environment from {}", path.display()),
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable .env file: {e}"),
        },
    }

    let config = Config::load(cli.config.as_deref())?;
    let features = Features::resolve(&config, &cli.overrides())?;

    if cli.show_config {
        print!("{}", config.describe(&features));
        return Ok(true);
    }
    if cli.test_alerts {
        let dispatcher = Dispatcher::from_config(&config, &features)?;
        return Ok(diagnostics::test_alerts(&dispatcher).await);
    }
    if cli.test_whois {
        let verifier = IspVerifier::from_config(&config.whois);
        return Ok(diagnostics::test_whois(&verifier, &config.interfaces).await);
    }

    let enabled = features.enabled();
    info!(
        "Features enabled: {}",
        if enabled.is_empty() { "none".to_string() } else { enabled.join(", ") }
    );
    if features.dry_run {
        info!("Dry run, state will not be saved and alerts will not be sent");
    }

    let monitor = Monitor::from_config(&config, &features)?;
    let report = monitor.run_cycle().await?;

    if features.dry_run {
        if let Some(alert) = &report.alert {
            println!("Dry run \u{2014} would send the following alert:\n\n{}", alert.body);
        }
    }
    Ok(true)
}
