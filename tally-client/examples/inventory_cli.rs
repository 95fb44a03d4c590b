use clap::Parser;
use colored::*;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Select};
use tally_client::{CycleOutcome, Engine, EngineEvent, EventType};
use tally_core::config::{EngineConfig, ReplicaConfig};
use tally_core::models::{Record, RecordId, RecordPatch, RecordStatus};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Interactive offline-first inventory", long_about = None)]
struct Cli {
    /// Database file name (will auto-create in databases/ directory)
    #[arg(short, long, default_value = "shop")]
    database: String,

    /// Replica database URL (falls back to TALLY_REPLICA_URL)
    #[arg(short, long)]
    replica: Option<String>,

    /// Start with background sync enabled
    #[arg(long)]
    sync: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only warnings and errors unless RUST_LOG says otherwise
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    std::fs::create_dir_all("databases")?;
    let db_file = format!("databases/{}.sqlite3", cli.database);
    let db_url = format!("sqlite:{}?mode=rwc", db_file);

    let replica = match cli.replica {
        Some(url) => ReplicaConfig::new(url),
        None => ReplicaConfig::from_env()?,
    };
    let config = EngineConfig::from_env()?;

    println!("{}", "📦 Tally Inventory".bold().cyan());
    println!("{}", "==================".cyan());
    println!("📁 Database: {}", db_file.green());
    println!("🌐 Replica: {}", replica.url.blue());
    println!();

    let engine = Engine::open(&db_url, &replica, config).await?;

    engine.events().register_callback(|event| match event {
        EngineEvent::SyncFailed { message } => {
            println!("{} {}", "⚠️  Sync failed:".yellow(), message.dimmed());
        }
        EngineEvent::SyncCompleted { deletions_synced } if deletions_synced > 0 => {
            println!("✅ {} deletion(s) reached the replica", deletions_synced);
        }
        _ => {}
    })?;
    engine.events().register_callback_filtered(
        |event| {
            if let EngineEvent::PendingDeletionsChanged { pending: true } = event {
                println!("{}", "⏳ Deletions waiting for sync".yellow());
            }
        },
        EventType::PendingDeletionsChanged,
    )?;

    if cli.sync {
        engine.toggle_sync(true).await;
    }

    loop {
        engine.events().process_events()?;

        let choices = vec![
            "📋 List items",
            "➕ Add item",
            "✏️  Edit item",
            "🗑️  Delete item",
            "⬇️  Pull from replica",
            "⬆️  Push to replica",
            "🔁 Toggle background sync",
            "🔄 Sync status",
            "🧾 Export as JSON",
            "❌ Exit",
        ];

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("What would you like to do?")
            .items(&choices)
            .default(0)
            .interact()?;

        match selection {
            0 => list_items(&engine).await,
            1 => add_item(&engine).await?,
            2 => edit_item(&engine).await?,
            3 => delete_item(&engine).await?,
            4 => report("Pull", engine.pull_from_remote().await),
            5 => report("Push", engine.push_to_remote().await),
            6 => {
                let enable = !engine.is_syncing();
                engine.toggle_sync(enable).await;
                println!(
                    "🔁 Background sync {}",
                    if enable { "enabled".green() } else { "disabled".red() }
                );
            }
            7 => show_sync_status(&engine).await?,
            8 => println!("{}", serde_json::to_string_pretty(&engine.records().await)?),
            9 => {
                if Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt("Are you sure you want to exit?")
                    .default(false)
                    .interact()?
                {
                    engine.dispose();
                    println!("👋 Goodbye!");
                    break;
                }
            }
            _ => unreachable!(),
        }
        println!();
    }

    Ok(())
}

fn report(action: &str, outcome: CycleOutcome) {
    match outcome {
        CycleOutcome::Completed(report) => println!(
            "✅ {} done: {} pushed, {} deleted remotely",
            action, report.pushed, report.deleted
        ),
        CycleOutcome::Skipped(reason) => println!("⏭️  {} skipped: {:?}", action, reason),
        CycleOutcome::Failed(message) => {
            println!("{} {}", format!("⚠️  {} failed:", action).yellow(), message)
        }
    }
}

async fn list_items(engine: &Engine) {
    let records = engine.records().await;
    if records.is_empty() {
        println!("📭 No items yet.");
        return;
    }

    println!("{}", "📋 Inventory:".bold());
    println!("{}", "─".repeat(80).dimmed());
    for record in &records {
        print_row(record);
    }
    println!("{}", "─".repeat(80).dimmed());
    println!("{} item(s)", records.len());
}

fn print_row(record: &Record) {
    let id = match record.id {
        RecordId::Temp(_) => record.id.to_string().yellow(),
        RecordId::Permanent(_) => record.id.to_string().green(),
    };
    let status = match record.fields.status {
        RecordStatus::Active => "".normal(),
        RecordStatus::Archived => " (archived)".dimmed(),
    };
    println!(
        "{:>8}  {:<30} qty {:>5}  {}{}",
        id,
        record.display_name(),
        record.fields.qty,
        record.fields.location.dimmed(),
        status
    );
}

async fn pick_record(engine: &Engine, prompt: &str) -> Result<Option<Record>, Box<dyn std::error::Error>> {
    let records = engine.records().await;
    if records.is_empty() {
        println!("📭 No items yet.");
        return Ok(None);
    }

    let labels: Vec<String> = records
        .iter()
        .map(|r| format!("{} {}", r.id, r.display_name()))
        .collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&labels)
        .default(0)
        .interact()?;

    Ok(records.into_iter().nth(selection))
}

fn prompt_patch(current: Option<&Record>) -> Result<RecordPatch, Box<dyn std::error::Error>> {
    let theme = ColorfulTheme::default();
    let name: String = Input::with_theme(&theme)
        .with_prompt("Name")
        .with_initial_text(current.map(|r| r.fields.name.clone()).unwrap_or_default())
        .interact_text()?;
    let location: String = Input::with_theme(&theme)
        .with_prompt("Location")
        .with_initial_text(current.map(|r| r.fields.location.clone()).unwrap_or_default())
        .allow_empty(true)
        .interact_text()?;
    let qty: i64 = Input::with_theme(&theme)
        .with_prompt("Quantity")
        .default(current.map(|r| r.fields.qty).unwrap_or(0))
        .interact_text()?;
    let notes: String = Input::with_theme(&theme)
        .with_prompt("Notes")
        .with_initial_text(current.map(|r| r.fields.notes.clone()).unwrap_or_default())
        .allow_empty(true)
        .interact_text()?;

    Ok(RecordPatch::default()
        .name(name)
        .location(location)
        .qty(qty)
        .notes(notes))
}

async fn add_item(engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let draft = engine.create_record().await?;
    println!("📝 Drafting {}", draft.id.to_string().yellow());

    engine.start_edit_mode();
    let patch = prompt_patch(None);
    engine.end_edit_mode();
    let patch = patch?;

    if Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Save this item?")
        .default(true)
        .interact()?
    {
        let id = engine.save_record(draft.id, &patch).await?;
        println!("✅ Saved as {}", RecordId::Permanent(id).to_string().green());
    } else {
        engine.delete_record(draft.id).await?;
        println!("🗑️  Draft discarded");
    }
    Ok(())
}

async fn edit_item(engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let Some(record) = pick_record(engine, "Which item?").await? else {
        return Ok(());
    };

    engine.start_edit_mode();
    let patch = prompt_patch(Some(&record));
    engine.end_edit_mode();
    let patch = patch?;

    engine.update_record(record.id, &patch).await;
    let id = engine.save_record(record.id, &patch).await?;
    println!("✅ Saved {}", RecordId::Permanent(id).to_string().green());
    Ok(())
}

async fn delete_item(engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let Some(record) = pick_record(engine, "Delete which item?").await? else {
        return Ok(());
    };

    if Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Delete {}?", record.display_name()))
        .default(false)
        .interact()?
    {
        engine.delete_record(record.id).await?;
        println!("🗑️  Deleted {}", record.id);
    }
    Ok(())
}

async fn show_sync_status(engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "🔄 Sync Status".bold());
    println!(
        "   Background sync: {}",
        if engine.is_syncing() { "on".green() } else { "off".red() }
    );
    if let Some(interval) = engine.armed_interval() {
        println!("   Interval: {:?} ({:?})", interval, engine.scheduler_state());
    }
    println!(
        "   Pending deletions: {}",
        if engine.has_pending_deletions().await {
            "yes".yellow()
        } else {
            "none".green()
        }
    );
    println!(
        "   Queued changes: {}",
        engine.store().queued_operations().await?.len()
    );
    match engine.last_synced_at().await? {
        Some(at) => println!("   Last sync: {}", at.to_rfc3339().blue()),
        None => println!("   Last sync: {}", "never".dimmed()),
    }
    Ok(())
}
