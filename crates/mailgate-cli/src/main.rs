//! Mailgate - SPF check entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mailgate_common::config::{Config, LoggingConfig};
use mailgate_common::types::{ConnectionInfo, HookResult};
use mailgate_core::{SpfEvaluator, SpfHook, TrustDnsResolver};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mailgate", version, about = "SPF policy checks for incoming mail")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run check_host() and print the SPF result
    Check {
        /// Client IP address
        #[arg(long)]
        ip: String,

        /// Domain whose policy is checked
        #[arg(long)]
        domain: String,

        /// Envelope sender (defaults to postmaster@<domain>)
        #[arg(long)]
        sender: Option<String>,

        /// HELO/EHLO name
        #[arg(long)]
        helo: Option<String>,
    },

    /// Run the MAIL FROM hook and print its decision
    MailFrom {
        #[arg(long)]
        ip: IpAddr,

        /// Reverse-path; use "<>" for the null sender
        #[arg(long)]
        sender: String,

        #[arg(long)]
        helo: Option<String>,
    },

    /// Run the HELO hook and print its decision
    Helo {
        #[arg(long)]
        ip: IpAddr,

        #[arg(long)]
        helo: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config.logging);
    debug!("Loaded configuration: {:?}", config);

    let resolver = Arc::new(TrustDnsResolver::from_config(&config.dns)?);

    match cli.cmd {
        Command::Check { ip, domain, sender, helo } => {
            let mut evaluator = SpfEvaluator::new(resolver);
            if let Some(helo) = helo {
                evaluator = evaluator.with_helo(helo);
            }
            let outcome = evaluator
                .check_host(&ip, &domain, sender.as_deref())
                .await
                .context("SPF check failed")?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("result:  {}", outcome.result);
                println!("domain:  {}", outcome.domain);
                println!("sender:  {}", outcome.sender);
                println!("record:  {}", outcome.record.as_deref().unwrap_or("(none)"));
                println!("lookups: {}", outcome.lookups);
            }
        }
        Command::MailFrom { ip, sender, helo } => {
            let hook = SpfHook::new(config.spf.clone(), resolver, config.server.hostname.clone());
            let conn = ConnectionInfo::new(ip).with_helo(helo);
            let result = hook.check_mail_from(&conn, &sender).await;
            print_hook_result(&result, cli.json)?;
        }
        Command::Helo { ip, helo } => {
            let hook = SpfHook::new(config.spf.clone(), resolver, config.server.hostname.clone());
            let conn = ConnectionInfo::new(ip).with_helo(Some(helo));
            let result = hook.check_helo(&conn).await;
            print_hook_result(&result, cli.json)?;
        }
    }

    Ok(())
}

fn print_hook_result(result: &HookResult, json: bool) -> Result<()> {
    info!("{} hook: {:?}", result.hook_type, result.action);

    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("action: {:?}", result.action);
    if let (Some(code), Some(message)) = (result.smtp_code, result.smtp_message.as_deref()) {
        println!("reply:  {} {}", code, message);
    }
    if !result.tags.is_empty() {
        println!("tags:   {}", result.tags.join(", "));
    }
    for (name, value) in &result.headers {
        println!("{}: {}", name, value);
    }
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Results go to stdout, logs to stderr
    let (json, text) = if config.format.eq_ignore_ascii_case("json") {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (
            None,
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}
