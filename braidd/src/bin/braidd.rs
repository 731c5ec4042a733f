use anyhow::Context as _;
use braid_net::{Reactor, Side};
use braidd::{status, Config};
use std::{net::SocketAddr, path::PathBuf};
use structopt::StructOpt;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(StructOpt, Debug)]
struct Args {
    /// set log levels
    ///
    /// useful for trying to debug the handshake or the reconnect
    /// behavior of a flaky path
    #[structopt(long = "log-level", default_value = "info", global = true)]
    log_level: Level,

    /// path of the configuration file
    config: PathBuf,

    /// which half of the link this process runs: left or right
    side: Side,
}

fn main() {
    if let Err(error) = main_run() {
        eprintln!("{:?}", error);
        std::process::exit(1);
    }
}

fn main_run() -> anyhow::Result<()> {
    let args = Args::from_args();

    let level = if debug_requested() {
        Level::DEBUG
    } else {
        args.log_level
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = Config::from_file(&args.config).context("cannot load the configuration")?;
    let side_config = config.side(args.side);

    let listen = SocketAddr::from(([0, 0, 0, 0], side_config.listen_port));
    let mut reactor = Reactor::new(args.side, listen, side_config.endpoints.clone())
        .context("cannot start the mirroring reactor")?;

    // runs until the process is killed
    reactor.run(|snapshot| status::render(snapshot))
}

/// `DEBUG` with a first character of `Y`, `y` or `1` turns the verbose
/// diagnostics on regardless of `--log-level`
fn debug_requested() -> bool {
    std::env::var("DEBUG")
        .ok()
        .and_then(|value| value.chars().next())
        .map(|first| matches!(first, 'Y' | 'y' | '1'))
        .unwrap_or(false)
}
