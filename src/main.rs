use std::io::Result;

use clap::{Arg, ArgAction, Command};
use env_logger::Builder;
use log::{info, LevelFilter};

use routed::{serve, ServerConfig};

fn main() -> Result<()> {
    let matches = Command::new("routed")
        .version("0.1")
        .about("BGP + OSPF routing agent")
        .arg(
            Arg::new("configpath")
                .help("Path to routed config file")
                .index(1)
                .required(true),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of logging verbosity"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("configpath")
        .expect("configpath is required")
        .to_owned();

    let (routed_level, other_level) = match matches.get_count("v") {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        3 => (LevelFilter::Trace, LevelFilter::Debug),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("routed"), routed_level)
        .filter(None, other_level)
        .init();

    let config = ServerConfig::from_file(&config_path)?;
    info!(
        "Loaded config: router-id={} asn={} [{} BGP peers, {} OSPF interfaces]",
        config.router_id,
        config.default_as,
        config.bgp.peers.len(),
        config.ospf.as_ref().map(|o| o.interfaces.len()).unwrap_or(0),
    );

    // Everything runs on one cooperative scheduler thread; the API server
    // reads snapshots only.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}
