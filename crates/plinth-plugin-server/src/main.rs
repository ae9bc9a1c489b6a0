//! Plugin bridge binary. Spawned by a plinth host to run one plugin in isolation.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use plinth_plugin_server::cli::PluginArgs;
use plinth_plugin_server::{HeadlessToolkit, HostOptions, LoadRequest, PluginAdapter, Result, Toolkit, ToolkitQueue};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = PluginArgs::parse();
    let options = match std::env::var_os("PLINTH_CONFIG") {
        Some(path) => HostOptions::from_file(path)?,
        None => HostOptions::default(),
    };
    let interval = Duration::from_millis(options.idle_interval_ms);

    let queue = Arc::new(ToolkitQueue::new());
    let request = LoadRequest::new(args.kind, args.filename, args.label);
    let mut adapter = PluginAdapter::new(&args.url, request, options, Arc::clone(&queue))?;
    adapter.start();

    HeadlessToolkit::new(interval).exec(&queue, &mut adapter)
}
