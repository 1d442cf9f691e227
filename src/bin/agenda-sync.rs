use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};

use agenda_sync::{CalDavProvider, Cache, Client, TimeWindow};
use agenda_sync::calendar::CalendarId;
use agenda_sync::config::Settings;
use agenda_sync::error::{Error, Result};
use agenda_sync::mirror::SnapshotMirror;
use agenda_sync::occurrence::RequestedOccurrence;
use agenda_sync::provider::OccurrenceRemoval;
use agenda_sync::utils::{print_collection_list, print_event};

#[derive(Parser)]
#[command(name = "agenda-sync")]
#[command(about = "Keep a local copy of your CalDAV calendars in sync")]
struct Cli {
    /// JSON settings file. `AGENDA_SYNC_*` environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// A JSON dump of the server tables, to serve reads from
    #[arg(long)]
    mirror: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync pass
    Sync {
        /// Also sync the calendars that are disabled
        #[arg(long)]
        all: bool,
    },
    /// List the calendars
    Calendars,
    /// List the events in a date window
    Events {
        /// First day (YYYY-MM-DD), in the reference zone
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day, excluded
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Remove a single occurrence of a recurring event
    RemoveOccurrence {
        /// Calendar URL or last URL segment
        calendar: String,
        uid: String,
        /// e.g. 2026-01-23, 2026-01-23T10:00 or 2026-01-23T10:00:00+01:00
        occurrence: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    }.with_env_overrides()?;
    if let Commands::Sync{ all: true } = cli.command {
        settings.sync.include_all = true;
    }

    let provider = build_provider(&settings, cli.mirror.as_ref())?;

    match cli.command {
        Commands::Sync{ .. } => {
            let report = provider.sync().await?;
            println!("{}", report);
            for error in &report.errors {
                println!("  ! {}", error);
            }
            for uid in &report.conflicts {
                println!("  ~ {} (server version kept)", uid);
            }
        },
        Commands::Calendars => {
            let collections = provider.list_collections().await?;
            print_collection_list(&collections);
        },
        Commands::Events{ from, to } => {
            let window = match (from, to) {
                (None, None) => settings.sync.default_window(Utc::now()),
                (from, to) => {
                    let today = Utc::now().date_naive();
                    let from = from.unwrap_or(today);
                    let to = to.unwrap_or_else(|| from + chrono::Duration::days(settings.sync.window_days_after));
                    TimeWindow::from_naive(midnight(from), midnight(to), &settings.sync.reference_zone())?
                },
            };
            let mut current: Option<CalendarId> = None;
            for (collection, event) in provider.events_in(&window).await? {
                if current.as_ref() != Some(&collection) {
                    println!("{}", collection);
                    current = Some(collection);
                }
                print_event(&event);
            }
        },
        Commands::RemoveOccurrence{ calendar, uid, occurrence } => {
            let requested = RequestedOccurrence::parse(&occurrence)?;
            let collection = resolve_calendar(&provider, &calendar).await?;
            match provider.remove_occurrence(&collection, &uid, &requested).await? {
                OccurrenceRemoval::Rewritten(resource) => println!("Removed {} from {}", requested, resource.href()),
                OccurrenceRemoval::ResourceDeleted => println!("Removed {}, which was the last occurrence of {}", requested, uid),
            }
        },
    }
    Ok(())
}

fn build_provider(settings: &Settings, mirror: Option<&PathBuf>) -> Result<CalDavProvider> {
    let (url, username, _) = settings.server.credentials()?;
    let client = Client::from_settings(&settings.server)?;
    let cache = Cache::open(&settings.cache_folder(), &username)?;
    let provider = CalDavProvider::new(client, cache, settings.sync.clone());

    Ok(match mirror {
        None => provider,
        Some(path) => provider.with_mirror(Arc::new(SnapshotMirror::from_file(url, path)?)),
    })
}

/// `calendar` is either a full URL, or the last segment of one
async fn resolve_calendar(provider: &CalDavProvider, calendar: &str) -> Result<CalendarId> {
    if let Ok(url) = calendar.parse::<CalendarId>() {
        return Ok(url);
    }
    provider.list_collections().await?
        .into_iter()
        .find(|view| view.collection.slug() == calendar.trim_matches('/'))
        .map(|view| view.id().clone())
        .ok_or_else(|| Error::NotFound(format!("no calendar named {}", calendar)))
}

fn midnight(date: NaiveDate) -> chrono::NaiveDateTime {
    date.and_time(chrono::NaiveTime::default())
}
