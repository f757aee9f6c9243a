use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use airsync::config::Config;
use airsync::credentials::CredentialStore;
use airsync::notification::DesktopSink;
use airsync::pending::AccountId;
use airsync::protocol::{HttpTransport, JsonCodec};
use airsync::{AccountSession, Engine, EngineContext, EnginePolicy, Store};

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,airsync=debug"));

    let log_file = Config::config_dir()
        .ok()
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir))
        .map(|dir| dir.join("airsync.log"))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .ok()
        });

    if let Some(file) = log_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"airsync - ActiveSync protocol engine

Usage: airsync <command>

Commands:
    run         Run the engine for every configured account
    pending     List queued operations per account
    password    Store the password for an account: airsync password <account id>
    help        Show this help message

Configuration file: ~/.config/airsync/config.toml
Send SIGHUP to a running engine after changing a password.
"#
    );
}

async fn open_store() -> Result<Arc<Store>> {
    let path = Config::database_path()?;
    let store = Store::open(&path)
        .await
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn run_engine(config: Config) -> Result<()> {
    if config.accounts.is_empty() {
        anyhow::bail!("No accounts configured in {}", Config::config_path()?.display());
    }

    let store = open_store().await?;
    let cx = EngineContext::new(
        store,
        Arc::new(JsonCodec),
        Arc::new(DesktopSink::from_config(&config)),
        EnginePolicy::from_config(&config.engine),
    );
    let mut engine = Engine::new(cx);
    let mut events = engine
        .events()
        .context("Engine event stream already taken")?;

    let mut transports: HashMap<AccountId, Arc<HttpTransport>> = HashMap::new();
    for account in &config.accounts {
        let password = CredentialStore::new(&account.email).password()?;
        let transport = Arc::new(HttpTransport::new(account, password)?);
        engine.start(AccountSession {
            account_id: account.id,
            transport: transport.clone(),
            watch_folders: account.watch_folders.clone(),
        })?;
        transports.insert(account.id, transport);
    }
    println!("Running {} account(s). Press Ctrl-C to stop.", transports.len());

    #[cfg(unix)]
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .context("Failed to install SIGHUP handler")?;

    loop {
        #[cfg(unix)]
        let reload = hangup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(event) = events.recv() => {
                println!(
                    "[account {}] {} -> {}",
                    event.account_id, event.command, event.event
                );
            }
            Some(_) = reload => {
                for account in &config.accounts {
                    let Some(transport) = transports.get(&account.id) else {
                        continue;
                    };
                    match CredentialStore::new(&account.email).password() {
                        Ok(password) => {
                            transport.set_password(password).await;
                            if let Err(e) = engine.credentials_updated(account.id).await {
                                tracing::warn!("Could not resume account {}: {:#}", account.id, e);
                            }
                        }
                        Err(e) => tracing::warn!("{:#}", e),
                    }
                }
            }
        }
    }

    println!("Stopping...");
    engine.shutdown().await;
    Ok(())
}

async fn list_pending(config: Config) -> Result<()> {
    let store = open_store().await?;

    for account in &config.accounts {
        let pending = store.list_pending(account.id).await?;
        println!("{} (account {}): {} operation(s)", account.email, account.id, pending.len());
        for op in pending {
            let target = op.server_id.as_deref().unwrap_or("-");
            let mut line = format!(
                "  {:>5}  {:<20} {:<20} {}",
                op.id,
                op.operation.as_str(),
                op.state.as_str(),
                target
            );
            if let Some(why) = op.why {
                line.push_str(&format!("  ({})", why));
            }
            if let Some(reason) = op.block_reason {
                line.push_str(&format!("  [{}]", reason));
            }
            println!("{}  {}", line, op.token);
        }
    }
    Ok(())
}

fn store_password(config: &Config, account: Option<&String>) -> Result<()> {
    use std::io::{self, BufRead, Write};

    let id: AccountId = account
        .context("Usage: airsync password <account id>")?
        .parse()
        .context("Account id must be a number")?;
    let account = config
        .account(id)
        .with_context(|| format!("No account with id {}", id))?;

    print!("Password for {}: ", account.email);
    io::stdout().flush()?;
    let mut password = String::new();
    io::stdin().lock().read_line(&mut password)?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        anyhow::bail!("Empty password, nothing stored");
    }

    CredentialStore::new(&account.email).set_password(password)?;
    println!("Password stored.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") | None => {
            print_usage();
            Ok(())
        }
        Some("run") => {
            setup_logging();
            let config = Config::load()?;
            config.ensure_dirs()?;
            run_engine(config).await
        }
        Some("pending") => {
            let config = Config::load()?;
            config.ensure_dirs()?;
            list_pending(config).await
        }
        Some("password") => {
            let config = Config::load()?;
            store_password(&config, args.get(2))
        }
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }
}
