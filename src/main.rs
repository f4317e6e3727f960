mod config;
mod connectivity;
mod db;
mod error;
mod event;
mod field;
mod geo;
mod intercept;
mod session;
mod store;
mod sync;
mod tiles;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::Config;
use connectivity::{Connectivity, ConnectivityMonitor};
use db::Database;
use event::{EventBus, SyncEvent};
use field::{FieldClient, ProjectStatus, Property, ServerAssignedIds};
use geo::{FixedGeolocation, GeolocationProvider, NullGeolocation};
use intercept::{CachePolicy, Classifier, InterceptorHandle, InterceptorWorker, ResponseCache};
use session::{Capabilities, Session};
use store::{Collection, LocalStore};
use sync::{DrainOutcome, HttpRequest, HttpTransport, Method, Reconciler, SyncQueue, Transport};
use tiles::{BoundingBox, TilePrefetcher};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first capture and sync for field site visits")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Connectivity, queue and storage summary
  Status,
  /// Deliver queued changes now
  Sync,
  #[command(subcommand)]
  Project(ProjectCommand),
  /// Record a GPS point for a project
  Capture {
    project: String,
    label: String,
    /// Point type, e.g. corner, well, septic
    #[arg(long, default_value = "other")]
    kind: String,
    #[arg(long, allow_hyphen_values = true)]
    lat: f64,
    #[arg(long, allow_hyphen_values = true)]
    lon: f64,
    /// Horizontal accuracy in meters
    #[arg(long, default_value_t = 5.0)]
    accuracy: f64,
    #[arg(long, allow_hyphen_values = true)]
    altitude: Option<f64>,
  },
  /// Attach a photo file to a project
  Photo {
    project: String,
    file: PathBuf,
    #[arg(long, default_value = "Photo")]
    label: String,
  },
  /// Cache or show a parcel boundary
  Boundary {
    parcel: String,
    /// GeoJSON geometry file to cache
    #[arg(long)]
    geometry: Option<PathBuf>,
  },
  /// Download map tiles for an area
  Prefetch {
    #[arg(long, allow_hyphen_values = true)]
    north: f64,
    #[arg(long, allow_hyphen_values = true)]
    south: f64,
    #[arg(long, allow_hyphen_values = true)]
    east: f64,
    #[arg(long, allow_hyphen_values = true)]
    west: f64,
    #[arg(long)]
    max_zoom: Option<u8>,
  },
  /// Send one GET through the caching layer
  Fetch {
    url: String,
    /// Treat as a page navigation (offline fallback page applies)
    #[arg(long)]
    navigation: bool,
  },
  /// Probe connectivity and sync on reconnection until interrupted
  Watch,
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
  Create {
    #[arg(long, default_value = "")]
    address: String,
    #[arg(long, default_value = "")]
    parcel: String,
    #[arg(long, default_value = "")]
    client: String,
    #[arg(long)]
    acres: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    lat: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    lon: Option<f64>,
  },
  Show {
    id: String,
    /// Read from the server (cached copy when offline)
    #[arg(long)]
    remote: bool,
  },
  List {
    #[arg(long)]
    remote: bool,
  },
  Export {
    id: String,
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  SetStatus {
    id: String,
    /// draft, in_progress or complete
    status: String,
  },
  Notes {
    id: String,
    text: String,
  },
  /// Replace one checklist section with a JSON value
  Section {
    id: String,
    section: String,
    json: String,
  },
}

/// Everything a command may need, wired from configuration.
struct Engine {
  config: Config,
  session: Session,
  interceptor: InterceptorHandle,
  transport: Arc<dyn Transport>,
  cache: ResponseCache,
  base_url: url::Url,
}

impl Engine {
  async fn build(config: Config, geolocation: Arc<dyn GeolocationProvider>) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let base_url = config.base_url()?;

    let db = Arc::new(Database::open(
      &Database::default_path(&data_dir),
      config.storage.max_pages,
    )?);
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.request_timeout())?);

    let store = LocalStore::new(db.clone());
    let queue = SyncQueue::new(db);
    let reconciler = Reconciler::new(
      queue.clone(),
      store.clone(),
      transport.clone(),
      base_url.clone(),
    )
    .with_ack_hook(Arc::new(ServerAssignedIds::new(store.clone(), queue)));

    let initial = ConnectivityMonitor::probe(transport.as_ref(), &probe_url(&config, &base_url)?).await;
    tracing::info!(?initial, server = %base_url, "starting");

    let events = EventBus::default();
    let monitor = Arc::new(ConnectivityMonitor::new(initial, reconciler.clone(), events.clone()));

    let cache = ResponseCache::open(&ResponseCache::default_path(&data_dir))?;
    let policy = CachePolicy::new(
      transport.clone(),
      cache.clone(),
      Classifier::new(config.tiles.hosts.clone(), config.server.api_prefix.clone()),
      config.cache.version.clone(),
      base_url.clone(),
      config.cache.offline_page.clone(),
    );
    let prefetcher = TilePrefetcher::new(
      transport.clone(),
      cache.clone(),
      config.tiles.url_template.clone(),
      config.tiles.min_zoom,
      config.tiles.max_zoom,
    )
    .with_concurrency(config.tiles.concurrency);
    let interceptor = InterceptorWorker::spawn(policy, prefetcher, config.cache.precache.clone());

    let session = Session::new(
      store,
      reconciler,
      monitor,
      events,
      Capabilities {
        geolocation,
        tiles: Arc::new(interceptor.clone()),
      },
    );

    Ok(Self {
      config,
      session,
      interceptor,
      transport,
      cache,
      base_url,
    })
  }

  fn client(&self) -> FieldClient {
    FieldClient::new(self.interceptor.clone(), self.base_url.clone())
  }
}

fn probe_url(config: &Config, base_url: &url::Url) -> Result<url::Url> {
  base_url
    .join(&config.connectivity.probe_path)
    .map_err(|e| eyre!("Invalid probe path '{}': {}", config.connectivity.probe_path, e))
}

fn init_logging(data_dir: &Path) -> Result<WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    &log_dir,
    "fieldsync.log",
  ));

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "fieldsync=info".into()))
    .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging(&config.data_dir()?)?;

  let geolocation: Arc<dyn GeolocationProvider> = match &args.command {
    Command::Capture {
      lat,
      lon,
      accuracy,
      altitude,
      ..
    } => Arc::new(FixedGeolocation::new(*lat, *lon, *accuracy).with_altitude(*altitude)),
    _ => Arc::new(NullGeolocation),
  };

  let engine = Engine::build(config, geolocation).await?;
  run(&engine, args.command).await?;

  let stashed = engine.session.stashed_writes();
  if stashed > 0 {
    eprintln!(
      "warning: storage is full, {} change(s) were not saved locally",
      stashed
    );
  }

  Ok(())
}

async fn run(engine: &Engine, command: Command) -> Result<()> {
  let session = &engine.session;

  match command {
    Command::Status => {
      let online = session.monitor().is_online();
      println!("server:     {}", engine.base_url);
      println!("connection: {}", if online { "online" } else { "offline" });
      println!("pending:    {}", session.pending_count()?);
      for collection in Collection::ALL {
        let (total, unsynced) = session.store().counts(collection)?;
        println!("{:<11} {} ({} unsynced)", format!("{}:", collection), total, unsynced);
      }
      println!("storage:    {} bytes", session.store().usage()?);
      for generation in engine.cache.generations()? {
        println!("cache:      {} ({} entries)", generation, engine.cache.count(&generation)?);
      }
    }

    Command::Sync => match session.sync_now().await? {
      DrainOutcome::Completed(report) => println!(
        "attempted {}, synced {}, failed {}, rejected {}; {} still pending",
        report.attempted,
        report.synced,
        report.failed,
        report.rejected,
        session.pending_count()?
      ),
      DrainOutcome::AlreadyRunning => println!("a sync is already running"),
    },

    Command::Project(cmd) => run_project(engine, cmd).await?,

    Command::Capture {
      project,
      label,
      kind,
      ..
    } => {
      let point = session.capture_point(&project, &label, &kind).await?;
      println!(
        "captured {} ({}) at {:.6}, {:.6} ±{:.1}m",
        point.label, point.kind, point.lat, point.lon, point.accuracy
      );
      println!("pending: {}", session.pending_count()?);
    }

    Command::Photo {
      project,
      file,
      label,
    } => {
      let bytes = std::fs::read(&file)
        .map_err(|e| eyre!("Failed to read photo {}: {}", file.display(), e))?;
      let photo = session.add_photo(&project, &STANDARD.encode(bytes), &label).await?;
      println!("added photo {} ({} bytes)", photo.id, photo.data.len());
    }

    Command::Boundary { parcel, geometry } => {
      if let Some(path) = geometry {
        let contents = std::fs::read_to_string(&path)
          .map_err(|e| eyre!("Failed to read geometry {}: {}", path.display(), e))?;
        let geometry: serde_json::Value = serde_json::from_str(&contents)
          .map_err(|e| eyre!("Invalid GeoJSON in {}: {}", path.display(), e))?;
        session.cache_boundary(&parcel, geometry)?;
        println!("cached boundary for parcel {}", parcel);
      } else {
        match session.boundary(&parcel)? {
          Some(entry) => {
            println!("cached at {}", entry.cached_at.to_rfc3339());
            println!("{}", serde_json::to_string_pretty(&entry.geometry)?);
          }
          None => return Err(eyre!("No cached boundary for parcel {}", parcel)),
        }
      }
    }

    Command::Prefetch {
      north,
      south,
      east,
      west,
      max_zoom,
    } => {
      let area = BoundingBox::new(north, south, east, west)?;
      let max_zoom = max_zoom.unwrap_or(engine.config.tiles.max_zoom);
      let mut progress = session.prefetch_tiles(area, max_zoom).await?;
      while let Some(update) = progress.recv().await {
        if update.done {
          println!("cached {} of {} tiles", update.cached, update.total);
          break;
        }
        eprint!("\r{}/{}", update.cached, update.total);
      }
    }

    Command::Fetch { url, navigation } => {
      let url = url::Url::parse(&url).map_err(|e| eyre!("Invalid url '{}': {}", url, e))?;
      let mut request = HttpRequest::new(Method::Get, url);
      if navigation {
        request = request.navigation();
      }
      let served = engine.interceptor.fetch(request).await?;
      eprintln!(
        "{} {:?}{}",
        served.response.status,
        served.source,
        served
          .cached_at
          .map(|at| format!(" (cached {})", at.to_rfc3339()))
          .unwrap_or_default()
      );
      println!("{}", String::from_utf8_lossy(&served.response.body));
    }

    Command::Watch => watch(engine).await?,
  }

  Ok(())
}

async fn run_project(engine: &Engine, command: ProjectCommand) -> Result<()> {
  let session = &engine.session;

  match command {
    ProjectCommand::Create {
      address,
      parcel,
      client,
      acres,
      lat,
      lon,
    } => {
      let property = Property {
        address,
        parcel_id: parcel,
        client,
        acres,
        center_lat: lat,
        center_lon: lon,
        ..Default::default()
      };
      let project = session.create_project(property).await?;
      println!("{}", project.id);
    }

    ProjectCommand::Show { id, remote } => {
      let project = if remote {
        let fetched = engine.client().get_project(&id).await?;
        if fetched.is_stale() {
          eprintln!("offline: showing cached copy");
        }
        fetched.data
      } else {
        session.project(&id)?
      };
      println!("{}", serde_json::to_string_pretty(&project)?);
      if !remote {
        let unsynced = session.points(&id)?.iter().filter(|p| !p.synced).count()
          + session.photos(&id)?.iter().filter(|p| !p.synced).count();
        eprintln!("{} capture(s) not yet synced", unsynced);
      }
    }

    ProjectCommand::List { remote } => {
      if remote {
        let fetched = engine.client().list_projects().await?;
        if fetched.is_stale() {
          eprintln!("offline: showing cached list");
        }
        for summary in fetched.data {
          println!("{}  {:?}  {}  {}", summary.id, summary.status, summary.address, summary.client);
        }
      } else {
        for project in session.projects()? {
          println!(
            "{}  {:?}  {}  {}{}",
            project.id,
            project.status,
            project.property.address,
            project.property.client,
            if project.synced { "" } else { "  (unsynced)" }
          );
        }
      }
    }

    ProjectCommand::Export { id, output } => {
      let fetched = engine.client().export(&id).await?;
      let document = serde_json::to_string_pretty(&fetched.data)?;
      match output {
        Some(path) => {
          std::fs::write(&path, document)
            .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
          println!("exported {} to {}", id, path.display());
        }
        None => println!("{}", document),
      }
    }

    ProjectCommand::SetStatus { id, status } => {
      let status: ProjectStatus = status.parse().map_err(|e: String| eyre!(e))?;
      session.set_status(&id, status).await?;
    }

    ProjectCommand::Notes { id, text } => {
      session.set_notes(&id, &text).await?;
    }

    ProjectCommand::Section { id, section, json } => {
      let value: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid JSON for section '{}': {}", section, e))?;
      session.update_visit_section(&id, &section, value).await?;
    }
  }

  Ok(())
}

/// Run until Ctrl-C: probe connectivity, drain on reconnection, print events.
async fn watch(engine: &Engine) -> Result<()> {
  let session = &engine.session;
  let version = engine.config.cache.version.clone();

  let precached = engine.interceptor.install(version.clone()).await?;
  let purged = engine.interceptor.activate().await?;
  tracing::info!(version = %version, precached, purged, "cache generation ready");

  let mut events = session.events().subscribe();
  if session.monitor().is_online() {
    session.sync_now().await?;
  }

  let probe = session.run_probe_loop(
    engine.transport.clone(),
    probe_url(&engine.config, &engine.base_url)?,
    std::time::Duration::from_secs(engine.config.connectivity.probe_interval_secs),
  );
  tokio::pin!(probe);

  loop {
    tokio::select! {
      _ = &mut probe => break,
      event = events.recv() => match event {
        Ok(event) => print_event(&event),
        Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event observer lagged"),
        Err(RecvError::Closed) => break,
      },
      _ = tokio::signal::ctrl_c() => {
        tracing::info!("interrupted");
        break;
      }
    }
  }

  Ok(())
}

fn print_event(event: &SyncEvent) {
  match event {
    SyncEvent::Connectivity(Connectivity::Online) => println!("online"),
    SyncEvent::Connectivity(Connectivity::Offline) => println!("offline"),
    SyncEvent::Drained {
      synced,
      failed,
      rejected,
    } => println!("synced {}, failed {}, rejected {}", synced, failed, rejected),
    SyncEvent::PendingChanged(pending) => println!("{} pending", pending),
    SyncEvent::Notice(message) => println!("note: {}", message),
    SyncEvent::StorageQuota(message) => eprintln!("warning: {}", message),
    SyncEvent::PermissionRequired(message) => eprintln!("permission required: {}", message),
  }
}
