//! Command-line subcommands

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use std::io::Write;

use crate::app::App;
use crate::cache::{NoopStorage, Request, ResourceCache, ResponseStorage, SqliteStorage};
use crate::clients::ClientHub;
use crate::config::Config;
use crate::push::{self, LogSink};
use crate::server::HttpApi;
use crate::store::{
  PackagePayload, PendingPayload, PendingRecord, RequestPayload, VisitorPayload,
};
use crate::sync::SyncOutcome;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Watch connectivity and sync automatically until Ctrl-C
  Run,
  /// Send pending records now
  Sync,
  /// Refresh the resident snapshot from the portal
  Refresh,
  /// Show connectivity, operator and queue sizes
  Status,
  /// List pending records
  Pending,
  /// List the cached resident directory
  Residents,
  /// Delete every pending record without sending it
  Purge {
    /// Confirm the deletion
    #[arg(long)]
    yes: bool,
  },
  /// Capture a visitor entry
  Visitor {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    cpf: String,
    /// Birth date (YYYY-MM-DD)
    #[arg(long)]
    birth_date: Option<String>,
    #[arg(long, default_value = "")]
    plate: String,
    /// Resident being visited
    #[arg(long)]
    resident: Option<i64>,
    #[arg(long, default_value = "")]
    authorized_by: String,
    #[arg(long, default_value = "")]
    notes: String,
  },
  /// Capture a package delivery
  Package {
    #[arg(long)]
    resident: i64,
    #[arg(long, default_value = "")]
    volume: String,
    #[arg(long, default_value = "")]
    recipient: String,
  },
  /// Capture a service request
  Request {
    #[arg(long)]
    description: String,
    /// Request type (defaults to OUTRO)
    #[arg(long = "type", default_value = "")]
    request_type: String,
    #[arg(long)]
    resident: Option<i64>,
  },
  /// Manage the app shell cache
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Show a notification from push data
  Push {
    /// Raw JSON push payload
    json: Option<String>,
    /// Also activate the notification
    #[arg(long)]
    click: bool,
  },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  /// Fetch the shell assets into the current generation
  Install,
  /// Delete stale generations
  Activate,
  /// Fetch a url through the cache
  Get { url: String },
}

pub async fn execute(command: Command, config: Config) -> Result<()> {
  match command {
    Command::Cache(command) => {
      let fetcher = HttpApi::new(&config.server)?;
      if config.cache.enabled {
        let storage = SqliteStorage::open(&config.cache_database_path()?)?;
        cache(command, shell_cache(storage, fetcher, &config), &config.cache.assets).await
      } else {
        cache(command, shell_cache(NoopStorage, fetcher, &config), &config.cache.assets).await
      }
    }
    Command::Push { json, click } => {
      let notification = push::on_push(json.as_deref().map(str::as_bytes), &LogSink)?;
      println!("{}: {}", notification.title, notification.body);
      if click {
        let clients = ClientHub::new();
        push::on_notification_click(&notification, &clients);
        println!("Open {}", notification.url);
      }
      Ok(())
    }
    Command::Purge { yes: false } => {
      Err(eyre!("Refusing to delete pending records without --yes"))
    }
    command => {
      let app = App::new(config)?;
      let result = with_app(&app, command).await;
      let closed = app.close();
      result.and(closed)
    }
  }
}

/// Commands that need the offline store.
async fn with_app(app: &App, command: Command) -> Result<()> {
  match command {
    Command::Run => app.run().await,
    Command::Sync => sync(app).await,
    Command::Refresh => {
      let count = app.store().refresh_reference_records(app.api()).await?;
      println!("Cached {} resident(s)", count);
      Ok(())
    }
    Command::Status => status(app).await,
    Command::Pending => pending(app),
    Command::Residents => {
      let residents = app.store().residents()?;
      for resident in &residents {
        println!("{:>5}  {}", resident.id, resident.label());
      }
      println!("{} resident(s)", residents.len());
      Ok(())
    }
    Command::Purge { .. } => {
      let removed = app.store().clear_all()?;
      println!("Deleted {} pending record(s)", removed);
      Ok(())
    }
    Command::Visitor {
      name,
      cpf,
      birth_date,
      plate,
      resident,
      authorized_by,
      notes,
    } => {
      let payload = PendingPayload::Visitor(VisitorPayload {
        full_name: name,
        cpf,
        birth_date,
        vehicle_plate: plate,
        resident_id: resident,
        authorized_by,
        notes,
      });
      capture(app, payload).await
    }
    Command::Package {
      resident,
      volume,
      recipient,
    } => {
      let payload = PendingPayload::Package(PackagePayload {
        resident_id: resident,
        volume,
        alternate_recipient: recipient,
      });
      capture(app, payload).await
    }
    Command::Request {
      description,
      request_type,
      resident,
    } => {
      let payload = PendingPayload::Request(RequestPayload {
        request_type,
        description,
        resident_id: resident,
      });
      capture(app, payload).await
    }
    Command::Cache(_) | Command::Push { .. } => Err(eyre!("Command does not use the offline store")),
  }
}

async fn sync(app: &App) -> Result<()> {
  app.probe().await;
  let (trigger, presenter) = app.trigger();
  let outcome = trigger.manual_sync().await;

  // Let the presenter drain before printing the verdict
  drop(trigger);
  let _ = presenter.await;

  match outcome {
    SyncOutcome::Deferred => {
      println!(
        "Portal unreachable; {} record(s) stay queued",
        app.store().count_pending()?
      );
      Ok(())
    }
    SyncOutcome::Synced(report) => {
      println!("Synced {} record(s)", report.sent);
      Ok(())
    }
    SyncOutcome::Failed(e) => Err(eyre!("Sync failed: {}", e)),
  }
}

async fn status(app: &App) -> Result<()> {
  let online = app.probe().await;
  let store = app.store();
  println!("Portal:    {}", if online { "online" } else { "offline" });
  println!("Operator:  {}", store.operator()?);
  println!("Residents: {}", store.residents()?.len());
  println!("Pending:   {}", store.count_pending()?);
  Ok(())
}

fn pending(app: &App) -> Result<()> {
  let snapshot = app.store().drain_all()?;
  if snapshot.is_empty() {
    println!("No pending records");
    return Ok(());
  }

  print_records("visitor", &snapshot.visitors)?;
  print_records("package", &snapshot.packages)?;
  print_records("request", &snapshot.requests)?;
  println!("{} pending record(s)", snapshot.total());
  Ok(())
}

fn print_records<T: serde::Serialize>(label: &str, records: &[PendingRecord<T>]) -> Result<()> {
  for record in records {
    println!(
      "{:<8} #{:<4} {} {:<12} {}",
      label,
      record.temp_id,
      record.captured_at.format("%Y-%m-%d %H:%M"),
      record.operator,
      serde_json::to_string(&record.payload)?
    );
  }
  Ok(())
}

async fn capture(app: &App, payload: PendingPayload) -> Result<()> {
  let label = payload.kind().label();
  let (trigger, presenter) = app.trigger();
  let result = trigger.capture(payload);
  drop(trigger);
  let _ = presenter.await;

  let temp_id = result?;
  println!("Queued {} #{}", label, temp_id);
  Ok(())
}

fn shell_cache<S: ResponseStorage>(
  storage: S,
  fetcher: HttpApi,
  config: &Config,
) -> ResourceCache<S, HttpApi> {
  ResourceCache::new(
    storage,
    fetcher,
    config.cache.generation.clone(),
    config.cache.bypass.clone(),
    ClientHub::new(),
  )
}

async fn cache<S: ResponseStorage>(
  command: CacheCommand,
  cache: ResourceCache<S, HttpApi>,
  assets: &[String],
) -> Result<()> {
  match command {
    CacheCommand::Install => {
      let count = cache.install(assets).await?;
      println!("Installed {} asset(s) into {}", count, cache.generation());
    }
    CacheCommand::Activate => {
      let deleted = cache.activate()?;
      println!(
        "Activated {}; removed {} stale generation(s)",
        cache.generation(),
        deleted.len()
      );
    }
    CacheCommand::Get { url } => {
      let result = cache.handle(&Request::get(url)).await?;
      eprintln!(
        "{} {:?} {} byte(s){}",
        result.data.status,
        result.source,
        result.data.body.len(),
        result
          .cached_at
          .map(|at| format!(", cached {}", at.to_rfc3339()))
          .unwrap_or_default()
      );
      std::io::stdout().write_all(&result.data.body)?;
    }
  }
  Ok(())
}
