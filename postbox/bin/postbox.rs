#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::{io, process::ExitCode};

use clap::{Parser, Subcommand};
use postbox::{
    commands::{self, AuditFormat},
    config::Config,
    controller::Postbox,
};
use postbox_common::logging;

/// A self-hosted mail server: SMTP ingestion, mailbox storage and relayed sending
#[derive(Parser, Debug)]
#[command(name = "postbox")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the SMTP listener (the default)
    Serve,
    /// Print the relay settings and try to authenticate against the relay
    CheckRelay,
    /// List messages whose attachments were never stored
    AuditAttachments {
        /// Output format
        #[arg(long, value_enum, default_value_t = AuditFormat::Text)]
        format: AuditFormat,
    },
    /// Hash a password read from stdin for an [[accounts]] entry
    HashPassword,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Commands::HashPassword)) {
        println!("{}", commands::hash_password(io::stdin().lock())?);
        return Ok(ExitCode::SUCCESS);
    }

    logging::init();
    let config = Config::load()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            Postbox::build(&config).await?.run().await?;
        }
        Commands::CheckRelay => {
            commands::check_relay(&config, &mut io::stdout()).await?;
        }
        Commands::AuditAttachments { format } => {
            let store = config.storage.messages.build()?;
            if commands::audit_attachments(store.as_ref(), format, &mut io::stdout()).await? > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::HashPassword => {}
    }

    Ok(ExitCode::SUCCESS)
}
