use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;
use unicontact_rs::config::{ConfigOverrides, ContactsConfig, ServerOverrides, StorageOverrides};
use unicontact_rs::persistence::{PersistentContactStore, PersistentOpenOptions};
use unicontact_rs::{ContactStore, Identifier, MemoryContactStore};

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"unicontact-server - contact identity consolidation over HTTP

USAGE:
    unicontact-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to config file (TOML)
    -l, --listen <ADDR>     Override listen address [default: 127.0.0.1:3000]
    -d, --data-dir <DIR>    Persist contacts in RocksDB under DIR [default: in-memory]
        --repair            Repair the RocksDB directory before opening
    -h, --help              Print help

ENVIRONMENT:
    UNICONTACT_CONFIG                       Path to config file
    UNICONTACT_SERVER__LISTEN               Listen address
    UNICONTACT_STORAGE__DATA_DIR            Data directory
    UNICONTACT_IDENTIFY__REQUEST_TIMEOUT_MS Per-request deadline
    RUST_LOG                                Log filter, overrides log.filter

ROUTES:
    POST /identify   {{"email": ..., "phoneNumber": ...}}
    GET  /health
"#
    );
}

fn init_logging(config: &ContactsConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.filter.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_store(config: &ContactsConfig) -> anyhow::Result<Arc<dyn ContactStore>> {
    match &config.storage.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let store = PersistentContactStore::open_with_options(
                dir,
                PersistentOpenOptions {
                    repair: config.storage.repair,
                    cache_capacity: config.storage.cache_capacity,
                },
            )?;
            info!(
                data_dir = %dir.display(),
                contacts = store.len(),
                "opened persistent contact store"
            );
            Ok(Arc::new(store))
        }
        None => {
            info!("using in-memory contact store");
            Ok(Arc::new(MemoryContactStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    let mut overrides = ConfigOverrides::default();
    if let Some(listen) = parse_arg("--listen").or_else(|| parse_arg("-l")) {
        overrides.server = Some(ServerOverrides {
            listen: Some(listen.parse()?),
        });
    }
    let data_dir = parse_arg("--data-dir").or_else(|| parse_arg("-d"));
    let repair = has_flag("--repair");
    if data_dir.is_some() || repair {
        overrides.storage = Some(StorageOverrides {
            data_dir: data_dir.map(Into::into),
            repair: repair.then_some(true),
        });
    }

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("UNICONTACT_CONFIG").ok());
    let config = ContactsConfig::load(config_path.as_deref(), overrides)?;
    init_logging(&config);

    let store = open_store(&config)?;
    let identifier = Arc::new(Identifier::with_tuning(store, config.identify.clone()));
    let listener = tokio::net::TcpListener::bind(config.server.listen).await?;
    unicontact_rs::server::serve(listener, identifier).await
}
