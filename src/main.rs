use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use poultrymetrics_admin::{
    link_session, reconcile, send_mail, transport_from_config, Config, Database, Identity,
    MailMessage, MemorySession, Outcome, Recipient, TargetTableSpec,
};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "POULTRYMETRICS_LOG";

#[derive(Parser, Debug)]
#[command(name = "poultrymetrics-admin")]
#[command(author, version, about = "PoultryMetrics admin helpers: schema reconciliation and worker linking")]
struct Cli {
    /// Database file (overrides POULTRYMETRICS_DB_PATH and config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring egg_production up to the canonical schema
    Reconcile,

    /// Find or create the employee record for a login
    Link {
        /// Role of the signed-in user
        #[arg(long)]
        role: String,

        #[arg(long)]
        user_id: Option<i64>,

        /// Used to look up the user id when --user-id is not given
        #[arg(long)]
        username: Option<String>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send a message through the configured mail transport
    Mail {
        #[arg(long)]
        to: String,

        /// Recipient display name
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        subject: String,

        #[arg(long)]
        body: String,

        /// Send the body as HTML
        #[arg(long)]
        html: bool,

        /// Plain-text alternative for HTML bodies
        #[arg(long)]
        alt_body: Option<String>,

        #[arg(long)]
        reply_to: Option<String>,
    },

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for (bash, zsh, fish, powershell, elvish)
        shell: Shell,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn open_database(flag: Option<&Path>, config: &Config) -> Result<Database, String> {
    let opened = match flag {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| format!("Could not create {}: {}", parent.display(), e))?;
                }
            }
            Database::open_at(path)
        }
        None => Database::open(config.database.path.as_deref()),
    };
    opened.map_err(|e| format!("Could not open database: {}", e))
}

fn run_reconcile(db: &Database) {
    let report = reconcile(db, &TargetTableSpec::egg_production());
    for entry in &report.entries {
        let line = entry.to_string();
        match entry.outcome {
            Outcome::Applied { .. } => println!("{}", line.green()),
            Outcome::Skipped { .. } => println!("{}", line.dimmed()),
            Outcome::Failed { .. } => println!("{}", line.red()),
        }
    }
    if !report.is_clean() {
        eprintln!(
            "{} {} step(s) failed, see above",
            "Warning:".yellow(),
            report.failures().count()
        );
    }
    println!("DONE");
}

fn run_link(
    db: &Database,
    config: &Config,
    role: &str,
    user_id: Option<i64>,
    username: Option<&str>,
    json: bool,
) -> ExitCode {
    let mut session = MemorySession::new(Identity::new(role, user_id, username));
    let result = link_session(db, &config.linker, &mut session);

    if json {
        let rendered = match &result {
            Ok(outcome) => serde_json::to_string_pretty(outcome),
            Err(e) => serde_json::to_string_pretty(e),
        };
        match rendered {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Error: {}", e),
        }
    } else {
        match &result {
            Ok(outcome) => println!("{}", outcome.to_string().green()),
            Err(e) => eprintln!("{} {}", "Not linked:".red(), e),
        }
    }

    if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_mail(config: &Config, message: MailMessage) -> ExitCode {
    let transport = transport_from_config(&config.mail);
    let result = send_mail(transport.as_ref(), &message);
    match result.error {
        None => {
            println!("{} via {}", "Sent".green(), transport.name());
            ExitCode::SUCCESS
        }
        Some(e) => {
            eprintln!("{} {}", "Mail failed:".red(), e);
            ExitCode::FAILURE
        }
    }
}

fn fail(message: &str) -> ExitCode {
    eprintln!("{} {}", "Error:".red(), message);
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();
    let config = Config::load();

    match cli.command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "poultrymetrics-admin", &mut io::stdout());
            ExitCode::SUCCESS
        }
        Command::Mail {
            to,
            name,
            subject,
            body,
            html,
            alt_body,
            reply_to,
        } => {
            let message = MailMessage {
                recipients: vec![Recipient::new(&to, name.as_deref())],
                subject,
                body,
                alt_body,
                is_html: html,
                reply_to,
            };
            run_mail(&config, message)
        }
        Command::Reconcile => match open_database(cli.db.as_deref(), &config) {
            Ok(db) => {
                run_reconcile(&db);
                ExitCode::SUCCESS
            }
            Err(e) => fail(&e),
        },
        Command::Link {
            role,
            user_id,
            username,
            json,
        } => match open_database(cli.db.as_deref(), &config) {
            Ok(db) => run_link(&db, &config, &role, user_id, username.as_deref(), json),
            Err(e) => fail(&e),
        },
    }
}
