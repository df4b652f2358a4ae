use anyhow::{Context, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Wires up logging only; there is no socket-server or CLI surface here
/// (that whole concern is out of scope), so the binary exists solely so
/// `cargo run` gives a caller something to link `xhci_memdump::memdump`'s
/// `RamDump` against.
fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global tracing subscriber")?;

    info!("xhci-memdump is up; wire a BarBus/HostMem implementation and call RamDump::new to begin");

    Ok(())
}
