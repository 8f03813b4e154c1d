use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use patrack_core::{CatalogEntry, Origin};
use patrack_storage::{CatalogStore, SearchField, SearchRequest};
use patrack_sync::{Decision, HandshakeTicket, Message, SyncConfig, SyncEvent, SyncOutcome, SyncWorker};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "patrack")]
#[command(about = "Perpetual access rights tracker")]
struct Cli {
    /// YAML settings file; `PATRACK_*` variables are used when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Approve every confirmation without prompting.
    #[arg(long, short = 'y', global = true)]
    yes: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the remote index with the catalog page.
    Sync,
    /// Upload local catalog files.
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Remove a local entry by name.
    Remove { name: String },
    /// List indexed entries.
    List {
        #[arg(long, conflicts_with = "remote")]
        local: bool,
        #[arg(long)]
        remote: bool,
    },
    /// Search titles across indexed tables.
    Search(SearchArgs),
}

#[derive(Debug, Args)]
struct SearchArgs {
    /// Institution whose access column is reported; defaults to the configured one.
    #[arg(long)]
    institution: Option<String>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    publisher: Option<String>,
    #[arg(long)]
    isbn: Option<String>,
    #[arg(long)]
    ocn: Option<String>,
    #[arg(long)]
    yop: Option<String>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::from_yaml_file(path),
        None => Ok(SyncConfig::from_env()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let worker = SyncWorker::new(config)?;
            let outcome = observe(worker.spawn_remote_sync(), cli.yes).await?;
            print_outcome(&outcome);
            if outcome.aborted {
                bail!("remote sync did not complete");
            }
        }
        Commands::Upload { files } => {
            let worker = SyncWorker::new(config)?;
            let outcome = observe(worker.spawn_local_batch(files), cli.yes).await?;
            print_outcome(&outcome);
            if outcome.aborted {
                bail!("local upload did not complete");
            }
        }
        Commands::Remove { name } => {
            let language = config.language;
            let worker = SyncWorker::new(config)?;
            let entry = worker
                .remove_local_entry(&name)
                .await
                .with_context(|| format!("removing local entry {name}"))?;
            println!("{}", Message::EntryRemoved { name: &entry.name }.render(language));
        }
        Commands::List { local, remote } => {
            let store = CatalogStore::open(&config.database_path).await?;
            let origins = match (local, remote) {
                (true, _) => vec![Origin::Local],
                (_, true) => vec![Origin::Remote],
                _ => vec![Origin::Remote, Origin::Local],
            };
            for origin in origins {
                for entry in store.list_entries(origin).await? {
                    print_entry(&entry);
                }
            }
            store.close().await;
        }
        Commands::Search(args) => search(&config, args).await?,
    }

    Ok(())
}

/// Prints events as they arrive and answers handshakes until the run ends.
async fn observe(
    (handle, mut events): (JoinHandle<SyncOutcome>, UnboundedReceiver<SyncEvent>),
    auto_approve: bool,
) -> Result<SyncOutcome> {
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::Progress(value) => eprint!("\r[{value:>3}%]"),
            SyncEvent::Notice(text) => println!("\n{text}"),
            SyncEvent::Error(text) => eprintln!("\n{text}"),
            SyncEvent::RegistryUpdated(registry) => {
                info!(remote = registry.remote.len(), local = registry.local.len(), "institution registry updated");
            }
            SyncEvent::Handshake(ticket) => answer(ticket, auto_approve).await?,
            SyncEvent::Finished(_) => eprintln!(),
        }
    }
    handle.await.context("worker task failed")
}

async fn answer(ticket: HandshakeTicket, auto_approve: bool) -> Result<()> {
    let prompt = ticket.request().prompt.clone();
    let decision = if auto_approve {
        println!("\n{prompt}\n[y/N] y");
        Decision::Approve
    } else {
        let approved = tokio::task::spawn_blocking(move || ask_stdin(&prompt))
            .await
            .context("prompt task failed")??;
        Decision::from_bool(approved)
    };
    ticket.respond(decision);
    Ok(())
}

fn ask_stdin(prompt: &str) -> Result<bool> {
    let mut stdout = std::io::stdout().lock();
    write!(stdout, "\n{prompt}\n[y/N] ")?;
    stdout.flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading confirmation from stdin")?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes" | "o" | "oui"))
}

async fn search(config: &SyncConfig, args: SearchArgs) -> Result<()> {
    let institution = args.institution.unwrap_or_else(|| config.institution.clone());
    let mut request = SearchRequest::new(institution);
    let terms = [
        (SearchField::Title, args.title),
        (SearchField::Publisher, args.publisher),
        (SearchField::PlatformEisbn, args.isbn),
        (SearchField::Ocn, args.ocn),
        (SearchField::PlatformYop, args.yop),
    ];
    for (field, value) in terms {
        if let Some(value) = value {
            request = request.term(field, value);
        }
    }
    if request.terms.is_empty() {
        bail!("give at least one of --title, --publisher, --isbn, --ocn or --yop");
    }

    let store = CatalogStore::open(&config.database_path)
        .await?
        .with_remote_data(config.allow_remote);
    let rows = store.search(&request).await;
    store.close().await;
    let rows = rows?;

    println!("{}", request.result_columns().join("\t"));
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(|cell| cell.as_deref().unwrap_or("")).collect();
        println!("{}", cells.join("\t"));
    }
    info!(matches = rows.len(), "search complete");
    Ok(())
}

fn print_entry(entry: &CatalogEntry) {
    println!("{}\t{}\t{}", entry.origin, entry.name, entry.version);
}

fn print_outcome(outcome: &SyncOutcome) {
    println!(
        "inserted={} updated={} deleted={} failed={} skipped={}{}",
        outcome.inserted.len(),
        outcome.updated.len(),
        outcome.deleted.len(),
        outcome.failed.len(),
        outcome.skipped.len(),
        if outcome.declined { " (declined)" } else { "" }
    );
}
