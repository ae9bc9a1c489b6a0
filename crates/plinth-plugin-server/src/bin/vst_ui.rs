//! VST editor bridge binary. Spawned by a plinth host to show a VST editor.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use plinth_plugin_server::cli::VstUiArgs;
use plinth_plugin_server::{HeadlessToolkit, Result, Toolkit, ToolkitQueue, UiAdapter, VstUi};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = VstUiArgs::parse();
    tracing::info!("showing '{}'", args.ui_title);
    let ui = VstUi::load(&args.binary)?;

    let queue = Arc::new(ToolkitQueue::new());
    let mut adapter = UiAdapter::new(&args.url, Box::new(ui), Arc::clone(&queue))?;
    adapter.start();

    HeadlessToolkit::new(Duration::from_millis(30)).exec(&queue, &mut adapter)
}
