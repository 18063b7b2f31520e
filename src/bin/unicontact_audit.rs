use anyhow::{bail, Context};
use unicontact_rs::audit::check_invariants;
use unicontact_rs::persistence::{PersistentContactStore, PersistentOpenOptions};
use unicontact_rs::ContactStore;

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
        r#"unicontact-audit - check cluster invariants of a persistent contact store

USAGE:
    unicontact-audit --data-dir <DIR> [OPTIONS]

OPTIONS:
    -d, --data-dir <DIR>    RocksDB directory written by unicontact-server
        --repair            Repair the RocksDB directory before opening
        --json              Print violations as JSON lines
    -h, --help              Print help

Exits non-zero when any violation is found.
"#
    );
}

fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }
    tracing_subscriber::fmt::init();

    let data_dir = parse_arg("--data-dir")
        .or_else(|| parse_arg("-d"))
        .context("--data-dir is required")?;
    let store = PersistentContactStore::open_with_options(
        &data_dir,
        PersistentOpenOptions {
            repair: has_flag("--repair"),
            ..PersistentOpenOptions::default()
        },
    )
    .with_context(|| format!("opening contact store at {data_dir}"))?;

    let violations = check_invariants(&store)?;
    let json = has_flag("--json");
    for violation in &violations {
        if json {
            println!("{}", serde_json::to_string(violation)?);
        } else {
            println!("{violation}");
        }
    }
    eprintln!(
        "audited {} contacts: {} violation(s)",
        store.len(),
        violations.len()
    );
    if !violations.is_empty() {
        bail!("contact store violates cluster invariants");
    }
    Ok(())
}
