use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use anyhow::{anyhow, Error, Result};
use env_logger::Builder;
use gumdrop::Options;
use log::{info, trace, warn, LevelFilter};
use proctrail::{Config, Event, Handle, Kinds};
use proctrail::backend;

#[derive(Options)]
pub struct Args {
    #[options()]
    help: bool,
    #[options(help = "auto, ebpf or connector")]
    backend: Option<backend::Kind>,
    #[options(no_short, help = "probe bytecode for the ebpf backend")]
    bytecode: Option<PathBuf>,
    #[options(help = "events buffered before the oldest are dropped")]
    capacity: Option<usize>,
    #[options(help = "comma separated: fork, exec, exit or all")]
    kinds: Option<Kinds>,
    #[options(no_short, help = "skip the initial process scan")]
    no_bootstrap: bool,
    #[options(help = "report thread creation and exit")]
    threads: bool,
    #[options(no_short, help = "seconds between process snapshots")]
    snapshot: Option<u64>,
    #[options(help = "text or json")]
    output: Option<Output>,
    #[options(help = "print what is known about a pid and exit")]
    lookup: Option<u32>,
    #[options(count)]
    verbose: u32,
}

enum Output {
    Text,
    Json,
}

impl FromStr for Output {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        match arg {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _      => Err(anyhow!("{}", arg)),
        }
    }
}

impl Output {
    fn print(&self, event: &Event) -> Result<()> {
        match self {
            Self::Text => println!("{:?}", event),
            Self::Json => println!("{}", serde_json::to_string(event)?),
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let args = Args::parse_args_default_or_exit();
    let output = args.output.unwrap_or(Output::Text);

    let mut builder = Builder::from_default_env();
    builder.filter(None, match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });
    builder.init();

    let default = Config::default();
    let config = Config {
        backend:           args.backend.unwrap_or(default.backend),
        bytecode:          args.bytecode,
        capacity:          args.capacity.unwrap_or(default.capacity),
        kinds:             args.kinds.unwrap_or(default.kinds),
        bootstrap:         !args.no_bootstrap,
        threads:           args.threads,
        snapshot_interval: args.snapshot.map(Duration::from_secs),
        ..default
    };

    let mut handle = Handle::open(config)?;

    if let Some(pid) = args.lookup {
        match handle.lookup(pid)? {
            Some(process) => println!("{}", serde_json::to_string_pretty(&process)?),
            None          => info!("pid {} not found", pid),
        }
        return Ok(());
    }

    loop {
        let events = match handle.get_events() {
            Ok(events)                 => events,
            Err(e) if e.is_transient() => {
                warn!("{}", e);
                Vec::new()
            }
            Err(e)                     => return Err(e.into()),
        };

        for event in &events {
            output.print(event)?;
        }

        if events.is_empty() {
            trace!("{:?}", handle.stats());
            handle.block(None)?;
        }
    }
}
