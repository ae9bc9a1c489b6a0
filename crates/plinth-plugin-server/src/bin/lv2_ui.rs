//! LV2 UI bridge binary. Spawned by a plinth host to show an LV2 plugin UI.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use plinth_plugin_server::cli::Lv2UiArgs;
use plinth_plugin_server::{HeadlessToolkit, Lv2Ui, Result, Toolkit, ToolkitQueue, UiAdapter};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Lv2UiArgs::parse();
    tracing::info!("showing '{}'", args.ui_title);
    let ui = Lv2Ui::load(&args.ui_binary, &args.ui_bundle, &args.plugin_uri, &args.ui_uri)?;

    let queue = Arc::new(ToolkitQueue::new());
    let mut adapter = UiAdapter::new(&args.url, Box::new(ui), Arc::clone(&queue))?;
    adapter.start();

    HeadlessToolkit::new(Duration::from_millis(30)).exec(&queue, &mut adapter)
}
