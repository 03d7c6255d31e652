use std::io::Read;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use anyhow::{Context, Error, Result};
use log::*;
use structopt::StructOpt;

use car_catalog::cache::DEFAULT_DATA_DIR;
use car_catalog::display;
use car_catalog::{
    CatalogQuery, CatalogStore, DefaultDataset, Event, EventBus, FileStorage, RemoteMirror,
    RemoteMirrorConfig, ReqwestTransport, SortOrder, Storage,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "carcat", about = "Manage the car catalog and its GitHub mirror")]
struct Opt {
    /// Directory holding the catalog and sync settings [default: ~/.config/car-catalog]
    #[structopt(long, global = true)]
    data_dir: Option<String>,

    /// JSON file to use instead of the bundled default cars
    #[structopt(long, global = true, parse(from_os_str))]
    defaults: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// List cars, optionally filtered
    List(QueryArgs),
    /// Show one car by slug or id
    Show { identifier: String },
    /// Create or update a car from a JSON object (file or stdin)
    Save {
        #[structopt(parse(from_os_str))]
        file: Option<PathBuf>,
    },
    /// Delete a car by slug or id
    Remove { identifier: String },
    /// Replace all cars with the contents of a JSON file
    Import {
        #[structopt(parse(from_os_str))]
        file: PathBuf,
    },
    /// Write all cars as JSON to a file or stdout
    Export {
        #[structopt(parse(from_os_str))]
        file: Option<PathBuf>,
    },
    /// Restore the default cars
    Reset,
    /// Reload from the remote mirror, or from disk when sync is off
    Refresh,
    /// Remote sync settings and manual sync
    Remote {
        #[structopt(subcommand)]
        action: RemoteCommand,
    },
}

#[derive(Debug, StructOpt)]
struct QueryArgs {
    /// Search title, description and features
    #[structopt(long)]
    search: Option<String>,
    #[structopt(long)]
    fuel: Option<String>,
    #[structopt(long)]
    transmission: Option<String>,
    #[structopt(long)]
    body: Option<String>,
    #[structopt(long)]
    min_price: Option<f64>,
    #[structopt(long)]
    max_price: Option<f64>,
    #[structopt(long)]
    min_year: Option<f64>,
    #[structopt(long)]
    max_year: Option<f64>,
    #[structopt(long)]
    max_mileage: Option<f64>,
    /// listing, price, price-desc, newest or mileage
    #[structopt(long, default_value = "listing")]
    sort: SortOrder,
    #[structopt(long)]
    limit: Option<usize>,
}

impl From<QueryArgs> for CatalogQuery {
    fn from(args: QueryArgs) -> Self {
        CatalogQuery {
            text: args.search,
            fuel: args.fuel,
            transmission: args.transmission,
            body: args.body,
            min_price: args.min_price,
            max_price: args.max_price,
            min_year: args.min_year,
            max_year: args.max_year,
            max_mileage: args.max_mileage,
            sort: args.sort,
            limit: args.limit,
        }
    }
}

#[derive(Debug, StructOpt)]
enum RemoteCommand {
    /// Print the sync settings (token masked) and last sync state
    Show,
    /// Change sync settings; unspecified values are kept
    Set(RemoteSettings),
    /// Forget sync settings and state
    Clear,
    /// Check that the remote file can be read
    Test,
    /// Replace local cars with the remote copy
    Pull,
    /// Commit local cars to the remote copy
    Push,
}

#[derive(Debug, StructOpt)]
struct RemoteSettings {
    #[structopt(long, conflicts_with = "disable")]
    enable: bool,
    #[structopt(long)]
    disable: bool,
    #[structopt(long)]
    owner: Option<String>,
    #[structopt(long)]
    repo: Option<String>,
    #[structopt(long)]
    branch: Option<String>,
    /// Path of the JSON file inside the repository
    #[structopt(long)]
    path: Option<String>,
    /// Personal access token with contents write permission
    #[structopt(long, env = "CARCAT_GITHUB_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[structopt(long)]
    message: Option<String>,
    #[structopt(long)]
    author_name: Option<String>,
    #[structopt(long)]
    author_email: Option<String>,
    #[structopt(long)]
    api_base: Option<String>,
}

impl RemoteSettings {
    fn apply(self, mut config: RemoteMirrorConfig) -> RemoteMirrorConfig {
        if self.enable {
            config.enabled = true;
        }
        if self.disable {
            config.enabled = false;
        }
        let set = |field: &mut String, value: Option<String>| {
            if let Some(value) = value {
                *field = value;
            }
        };
        set(&mut config.owner, self.owner);
        set(&mut config.repo, self.repo);
        set(&mut config.branch, self.branch);
        set(&mut config.path, self.path);
        set(&mut config.token, self.token);
        set(&mut config.commit_message, self.message);
        set(&mut config.author_name, self.author_name);
        set(&mut config.author_email, self.author_email);
        set(&mut config.api_base, self.api_base);
        config
    }
}

fn open_store(opt: &Opt) -> Result<CatalogStore> {
    let data_dir = opt.data_dir.as_deref().unwrap_or(DEFAULT_DATA_DIR);
    let storage: Arc<dyn Storage> = Arc::new(
        FileStorage::from_path_spec(data_dir)
            .with_context(|| format!("Bad data directory {}", data_dir))?,
    );
    let defaults = match &opt.defaults {
        Some(path) => DefaultDataset::File(path.clone()),
        None => DefaultDataset::Bundled,
    };
    let events = EventBus::new();
    let transport = ReqwestTransport::new().with_context(|| "Failed to set up HTTP client")?;
    let remote = RemoteMirror::new(storage.clone(), Box::new(transport), events.clone());
    Ok(CatalogStore::new(storage, defaults, events).with_remote(remote))
}

fn remote(store: &CatalogStore) -> Result<&RemoteMirror> {
    store
        .remote()
        .ok_or_else(|| Error::msg("Remote sync is not available"))
}

fn read_input(file: &Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Error reading {:?}", path)),
        None => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .with_context(|| "Error reading stdin")?;
            Ok(input)
        }
    }
}

// Surface background sync problems that did not fail the command itself
fn report(events: &Receiver<Event>) {
    for event in events.try_iter() {
        match event {
            Event::CatalogRemoteSyncError(e) => eprintln!("warning: remote sync failed: {}", e),
            Event::RemotePushSucceeded => eprintln!("Pushed to remote."),
            other => debug!("Event {:?}", other),
        }
    }
}

fn run(opt: Opt) -> Result<()> {
    let mut store = open_store(&opt)?;
    let events = store.subscribe();

    match opt.command {
        Command::List(args) => {
            let query = CatalogQuery::from(args);
            let cars = query.apply(&store.get_all());
            if cars.is_empty() {
                println!("No cars found.");
            }
            for car in cars {
                println!("{:<28} {}", car.slug, display::summary_line(&car));
            }
        }
        Command::Show { identifier } => match store.get_by_slug_or_id(&identifier) {
            Some(car) => println!("{}", serde_json::to_string_pretty(&car)?),
            None => return Err(Error::msg(format!("No car matches {:?}", identifier))),
        },
        Command::Save { file } => {
            let input = read_input(&file)?;
            let patch: serde_json::Value =
                serde_json::from_str(&input).with_context(|| "Car must be a JSON object")?;
            let patch = match patch {
                serde_json::Value::Object(map) => map,
                _ => return Err(Error::msg("Car must be a JSON object")),
            };
            let car = store.upsert(patch)?;
            println!("Saved {} ({})", car.title, car.slug);
        }
        Command::Remove { identifier } => {
            if store.remove(&identifier)? {
                println!("Removed {}", identifier);
            } else {
                println!("No car matches {:?}", identifier);
            }
        }
        Command::Import { file } => {
            let input = read_input(&Some(file))?;
            let cars = store.import_json(&input)?;
            println!("Imported {} cars.", cars.len());
        }
        Command::Export { file } => {
            let json = store.export_json()?;
            match file {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("Error writing {:?}", path))?,
                None => print!("{}", json),
            }
        }
        Command::Reset => {
            let cars = store.reset_to_defaults()?;
            println!("Restored {} default cars.", cars.len());
        }
        Command::Refresh => {
            let cars = store.force_remote_refresh()?;
            println!("Loaded {} cars.", cars.len());
        }
        Command::Remote { action } => run_remote(&mut store, action)?,
    }

    report(&events);
    Ok(())
}

fn run_remote(store: &mut CatalogStore, command: RemoteCommand) -> Result<()> {
    match command {
        RemoteCommand::Show => {
            let remote = remote(store)?;
            let config = remote.config();
            println!("{}", serde_json::to_string_pretty(&config.masked())?);
            println!("active: {}", config.is_enabled());
            println!("{}", serde_json::to_string_pretty(&remote.state())?);
        }
        RemoteCommand::Set(settings) => {
            let remote = remote(store)?;
            let config = remote.save_config(settings.apply(remote.config()))?;
            println!("{}", serde_json::to_string_pretty(&config.masked())?);
        }
        RemoteCommand::Clear => {
            remote(store)?.clear_configuration()?;
            println!("Remote sync settings cleared.");
        }
        RemoteCommand::Test => {
            remote(store)?
                .test_connection()
                .with_context(|| "Connection test failed")?;
            println!("Connection OK.");
        }
        RemoteCommand::Pull => {
            let cars = store.force_remote_refresh()?;
            println!("Pulled {} cars.", cars.len());
        }
        RemoteCommand::Push => {
            let cars = store.get_all();
            let receipt = remote(store)?.push_collection(&cars)?;
            println!("Pushed {} cars, remote revision {:?}.", cars.len(), receipt.sha);
        }
    }
    Ok(())
}

fn main() {
    pretty_env_logger::init();
    let opt = Opt::from_args();
    debug!("Options {:?}", opt);
    if let Err(e) = run(opt) {
        error!("{:?}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
