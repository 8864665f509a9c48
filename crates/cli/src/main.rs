use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use tokio::signal;
use tracing::{info, warn};

use kiln_core::{RequestContext, WatchEvent};
use kiln_persist::SqliteBackend;
use kiln_registry::new_event_store;
use kiln_store::{DeleteOptions, ListOptions, StoreOptions};

#[derive(Parser, Debug)]
#[command(name = "kilnctl", version, about = "Kiln events store CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace requests run in
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    /// SQLite database file
    #[arg(long = "db", global = true, env = "KILN_DB_PATH", default_value = "./kiln.db")]
    db: String,

    /// Seconds until a written event expires
    #[arg(long = "ttl", global = true, env = "KILN_EVENT_TTL_SECS", default_value_t = 3600)]
    ttl: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct Selectors {
    /// Label selector, e.g. "app=web,tier notin (db)"
    #[arg(short = 'l', long = "selector", default_value = "")]
    labels: String,
    /// Field selector, e.g. "involvedObject.name=web-0,type!=Normal"
    #[arg(long = "field-selector", default_value = "")]
    fields: String,
}

impl Selectors {
    fn options(&self) -> Result<ListOptions> {
        ListOptions::parse(&self.labels, &self.fields).context("parsing selectors")
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an event from a YAML or JSON file ("-" for stdin)
    Create {
        #[arg(short = 'f', long = "filename")]
        file: String,
    },
    /// Print one event
    Get { name: String },
    /// List events
    Ls {
        #[command(flatten)]
        sel: Selectors,
        #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
        all_namespaces: bool,
    },
    /// Delete one event
    Rm {
        name: String,
        /// Only delete if the uid matches
        #[arg(long = "uid")]
        uid: Option<String>,
        /// Only delete if the resourceVersion matches
        #[arg(long = "rv")]
        rv: Option<String>,
    },
    /// Delete every matching event in the namespace
    RmAll {
        #[command(flatten)]
        sel: Selectors,
    },
    /// Stream changes until Ctrl-C
    Watch {
        #[command(flatten)]
        sel: Selectors,
        /// Resume after this resourceVersion (0: start with current events)
        #[arg(long = "rv")]
        rv: Option<u64>,
        #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
        all_namespaces: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KILN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KILN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KILN_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_event(file: &str) -> Result<Event> {
    let text = if file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
        buf
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?
    };
    if text.trim_start().starts_with('{') {
        serde_json::from_str(&text).context("parsing event JSON")
    } else {
        serde_yaml::from_str(&text).context("parsing event YAML")
    }
}

fn or_dash(v: &Option<String>) -> &str { v.as_deref().filter(|s| !s.is_empty()).unwrap_or("-") }

fn involved(ev: &Event) -> String {
    let io = &ev.involved_object;
    format!("{}/{}", or_dash(&io.kind).to_lowercase(), or_dash(&io.name))
}

fn print_header() {
    println!("{:<16} {:<36} {:<8} {:<20} {:<28} MESSAGE", "NAMESPACE", "NAME", "TYPE", "REASON", "OBJECT");
}

fn print_row(ev: &Event) {
    println!(
        "{:<16} {:<36} {:<8} {:<20} {:<28} {}",
        or_dash(&ev.metadata.namespace),
        or_dash(&ev.metadata.name),
        or_dash(&ev.type_),
        or_dash(&ev.reason),
        involved(ev),
        or_dash(&ev.message),
    );
}

fn print_event(out: Output, ev: &Event) -> Result<()> {
    match out {
        Output::Human => {
            print_header();
            print_row(ev);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(ev)?),
    }
    Ok(())
}

fn print_list(out: Output, items: &[Event], rv: Option<&str>) -> Result<()> {
    match out {
        Output::Human => {
            if items.is_empty() {
                println!("No events found.");
                return Ok(());
            }
            print_header();
            for ev in items {
                print_row(ev);
            }
        }
        Output::Json => {
            let doc = serde_json::json!({ "items": items, "metadata": { "resourceVersion": rv.unwrap_or("") } });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}

fn print_change(out: Output, change: &WatchEvent<Event>) -> Result<()> {
    let ev = change.object();
    match out {
        Output::Human => {
            let mark = match change {
                WatchEvent::Added(_) => "+",
                WatchEvent::Modified(_) => "~",
                WatchEvent::Deleted(_) => "-",
            };
            let ns = or_dash(&ev.metadata.namespace);
            let name = or_dash(&ev.metadata.name);
            println!("{} {}/{} {} {} ({})", mark, ns, name, or_dash(&ev.reason), involved(ev), or_dash(&ev.metadata.resource_version));
        }
        Output::Json => {
            let kind = match change {
                WatchEvent::Added(_) => "ADDED",
                WatchEvent::Modified(_) => "MODIFIED",
                WatchEvent::Deleted(_) => "DELETED",
            };
            println!("{}", serde_json::to_string(&serde_json::json!({ "type": kind, "object": ev }))?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let backend = SqliteBackend::open(&cli.db)?;
    let store = new_event_store(StoreOptions::from_env(Arc::new(backend)), cli.ttl);
    let ctx = RequestContext::namespaced(cli.namespace.clone());

    match cli.command {
        Commands::Create { file } => {
            let ev = read_event(&file)?;
            let created = store.create(&ctx, ev).await.context("creating event")?;
            info!(name = ?created.metadata.name, rv = ?created.metadata.resource_version, "create done");
            print_event(cli.output, &created)?;
        }
        Commands::Get { name } => {
            let ev = store.get(&ctx, &name).await.with_context(|| format!("getting event {}", name))?;
            print_event(cli.output, &ev)?;
        }
        Commands::Ls { sel, all_namespaces } => {
            let scope = if all_namespaces { RequestContext::cluster() } else { ctx.clone() };
            let list = store.list(&scope, &sel.options()?).await.context("listing events")?;
            print_list(cli.output, &list.items, list.metadata.resource_version.as_deref())?;
        }
        Commands::Rm { name, uid, rv } => {
            let mut opts = DeleteOptions::default();
            opts.preconditions.uid = uid;
            opts.preconditions.resource_version = rv;
            let deleted = store.delete(&ctx, &name, &opts).await.with_context(|| format!("deleting event {}", name))?;
            match cli.output {
                Output::Human => println!("event {:?} deleted", or_dash(&deleted.metadata.name)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&deleted)?),
            }
        }
        Commands::RmAll { sel } => {
            let deleted = store.delete_collection(&ctx, &sel.options()?).await.context("deleting events")?;
            match cli.output {
                Output::Human => println!("{} event(s) deleted", deleted.items.len()),
                Output::Json => print_list(cli.output, &deleted.items, None)?,
            }
        }
        Commands::Watch { sel, rv, all_namespaces } => {
            let scope = if all_namespaces { RequestContext::cluster() } else { ctx.clone() };
            let mut opts = sel.options()?;
            opts.resource_version = rv;
            let mut watcher = store.watch(&scope, &opts).await.context("starting watch")?;
            info!(ns = ?scope.namespace(), rv = ?rv, "watch invoked");
            loop {
                tokio::select! {
                    next = watcher.next() => match next {
                        Some(Ok(change)) => print_change(cli.output, &change)?,
                        Some(Err(e)) => return Err(e).context("watch failed"),
                        None => {
                            warn!("watch stream ended");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; stopping watch");
                        watcher.cancel();
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}
