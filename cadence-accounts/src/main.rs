//! cadence-accounts - Account management tool for Cadence
//!
//! Registers platform accounts, stores their passwords in the credential
//! vault and manages saved login sessions.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use libcadence::logging::LoggingConfig;
use libcadence::platforms::{AuthMethod, CommandDriverFactory};
use libcadence::session::SessionStore;
use libcadence::vault::{MasterKey, MASTER_KEY_ENV};
use libcadence::{CadenceError, CadenceService, Config, NewAccount, Platform};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "cadence-accounts")]
#[command(version)]
#[command(about = "Manage Cadence platform accounts, passwords and sessions")]
#[command(long_about = "\
cadence-accounts - Manage Cadence platform accounts

DESCRIPTION:
    Accounts tie a platform login to the jobs queued for it. A password is
    optional: when a saved session is still valid, cadence-send reuses it
    without logging in. Passwords are encrypted with the master key from
    CADENCE_MASTER_KEY (or an interactive prompt) and never stored in the
    clear.

USAGE EXAMPLES:
    cadence-accounts add twitter main @cadence
    cadence-accounts set-credential 1
    echo \"$PASSWORD\" | cadence-accounts set-credential 1 --stdin
    cadence-accounts test 1
    cadence-accounts logout 1
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an account
    Add {
        /// Platform (facebook, twitter, linkedin, youtube)
        platform: Platform,

        /// Human-readable label
        label: String,

        /// Login identity (email, handle or phone)
        username: String,
    },

    /// List accounts with their session state
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Remove an account, its password and session; pending jobs are cancelled
    Remove {
        account_id: i64,

        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Store (or replace) the account password
    SetCredential {
        account_id: i64,

        /// Read the password from stdin (for automation)
        #[arg(long)]
        stdin: bool,
    },

    /// Check that the account can log in
    Test { account_id: i64 },

    /// Forget the saved session so the next run logs in again
    Logout { account_id: i64 },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    LoggingConfig::from_env(default_level, cli.verbose).init();

    if let Err(e) = run_command(cli.command).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<CadenceError>()
            .map(CadenceError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run_command(command: Commands) -> Result<()> {
    let config = Config::load()?;
    let service = CadenceService::new(config).await?;

    match command {
        Commands::Add {
            platform,
            label,
            username,
        } => add_account(&service, platform, label, username).await,
        Commands::List { format } => list_accounts(&service, &format).await,
        Commands::Remove { account_id, force } => remove_account(&service, account_id, force).await,
        Commands::SetCredential { account_id, stdin } => {
            set_credential(&service, account_id, stdin).await
        }
        Commands::Test { account_id } => test_account(&service, account_id).await,
        Commands::Logout { account_id } => {
            service.clear_session(account_id).await?;
            println!("✓ Cleared saved session for account {}", account_id);
            Ok(())
        }
    }
}

async fn add_account(
    service: &CadenceService,
    platform: Platform,
    label: String,
    username: String,
) -> Result<()> {
    let account = service
        .add_account(NewAccount {
            platform,
            label,
            username,
        })
        .await?;
    println!("{}", account.id);
    Ok(())
}

async fn list_accounts(service: &CadenceService, format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(CadenceError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        ))
        .into());
    }

    let sessions = SessionStore::new(service.db().clone());
    let accounts = service.list_accounts().await?;

    let mut rows = Vec::with_capacity(accounts.len());
    for account in &accounts {
        let session = sessions.load(&account.session_ref).await?;
        let session_state = match &session {
            Some(s) if !s.cookies.is_empty() => s.state.as_str(),
            _ => "none",
        };
        rows.push((account, session_state));
    }

    if format == "json" {
        let json: Vec<serde_json::Value> = rows
            .iter()
            .map(|(account, session_state)| {
                serde_json::json!({
                    "id": account.id,
                    "platform": account.platform,
                    "label": account.label,
                    "username": account.username,
                    "has_password": account.credential_ref.is_some(),
                    "session": session_state,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No accounts. Add one with: cadence-accounts add <platform> <label> <username>");
        return Ok(());
    }
    for (account, session_state) in rows {
        println!(
            "{} | {} | {} | {} | password: {} | session: {}",
            account.id,
            account.platform.display_name(),
            account.label,
            account.username,
            if account.credential_ref.is_some() { "yes" } else { "no" },
            session_state
        );
    }
    Ok(())
}

async fn remove_account(service: &CadenceService, account_id: i64, force: bool) -> Result<()> {
    if !force && atty::is(atty::Stream::Stdin) {
        use std::io::{self, Write};
        print!("Remove account {} and cancel its pending jobs? [y/N]: ", account_id);
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled");
            return Ok(());
        }
    }

    let cancelled = service.remove_account(account_id).await?;
    println!(
        "✓ Removed account {} ({} pending job{} cancelled)",
        account_id,
        cancelled,
        if cancelled == 1 { "" } else { "s" }
    );
    Ok(())
}

async fn set_credential(service: &CadenceService, account_id: i64, use_stdin: bool) -> Result<()> {
    let account = service
        .db()
        .get_account(account_id)
        .await?
        .ok_or_else(|| CadenceError::NotFound(format!("account {}", account_id)))?;

    let password = if use_stdin || !atty::is(atty::Stream::Stdin) {
        use std::io::{self, Read};
        let mut buffer = Zeroizing::new(String::new());
        io::stdin().read_to_string(&mut buffer)?;
        Zeroizing::new(buffer.trim_end_matches(['\r', '\n']).to_string())
    } else {
        Zeroizing::new(rpassword::prompt_password(format!(
            "Password for {} account '{}' ({}): ",
            account.platform.display_name(),
            account.label,
            account.username
        ))?)
    };

    let key = master_key(!use_stdin)?;
    service.set_credential(account_id, &password, &key).await?;

    println!("✓ Stored password for account {}", account_id);
    Ok(())
}

/// Master key from the environment, or an interactive prompt when allowed.
fn master_key(allow_prompt: bool) -> Result<MasterKey> {
    if let Some(key) = MasterKey::from_env()? {
        return Ok(key);
    }
    if !allow_prompt || !atty::is(atty::Stream::Stdin) {
        anyhow::bail!(
            "{} is not set. Export it or run interactively to be prompted.",
            MASTER_KEY_ENV
        );
    }
    let key = Zeroizing::new(rpassword::prompt_password("Master key: ")?);
    Ok(MasterKey::new(key.as_str())?)
}

async fn test_account(service: &CadenceService, account_id: i64) -> Result<()> {
    let drivers = CommandDriverFactory::new(service.config().automation.clone());
    let key = MasterKey::from_env()?.map(Arc::new);

    println!("Testing account {}...", account_id);
    match service.test_account(account_id, &drivers, key).await {
        Ok(AuthMethod::Session) => {
            println!("✓ Logged in with the saved session");
            Ok(())
        }
        Ok(AuthMethod::Credential) => {
            println!("✓ Logged in with the stored password; session saved");
            Ok(())
        }
        Err(e) => {
            println!("✗ Login failed");
            Err(e.into())
        }
    }
}
