//! The main loop of a bridge process.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::queue::{ToolkitHandler, ToolkitMessage, ToolkitQueue};

pub trait Toolkit {
    /// Runs until `Quit` arrives, the handler stops or [`quit`](Toolkit::quit)
    /// is called.
    fn exec(&mut self, queue: &ToolkitQueue, handler: &mut dyn ToolkitHandler) -> Result<()>;

    fn quit(&mut self);
    fn show(&mut self);
    fn hide(&mut self);
    fn resize(&mut self, width: i32, height: i32);
}

/// A windowless toolkit: a timer on a current-thread tokio runtime that drains
/// the queue and idles the handler every tick.
pub struct HeadlessToolkit {
    interval: Duration,
    visible: bool,
    size: (i32, i32),
    stop: Arc<AtomicBool>,
}

impl HeadlessToolkit {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            visible: false,
            size: (0, 0),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that ends [`exec`](Toolkit::exec) from another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn size(&self) -> (i32, i32) {
        self.size
    }
}

/// Applies window messages to the toolkit before the handler sees them.
struct Intercept<'a> {
    toolkit: &'a mut HeadlessToolkit,
    inner: &'a mut dyn ToolkitHandler,
}

impl ToolkitHandler for Intercept<'_> {
    fn handle(&mut self, msg: ToolkitMessage) -> Result<()> {
        match msg {
            ToolkitMessage::ShowGui(true) => self.toolkit.show(),
            ToolkitMessage::ShowGui(false) => self.toolkit.hide(),
            ToolkitMessage::ResizeGui { width, height } => self.toolkit.resize(width, height),
            _ => {}
        }
        self.inner.handle(msg)
    }
}

impl Toolkit for HeadlessToolkit {
    fn exec(&mut self, queue: &ToolkitQueue, handler: &mut dyn ToolkitHandler) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let interval = self.interval;
        let stop = Arc::clone(&self.stop);

        runtime.block_on(async {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let mut intercept = Intercept {
                    toolkit: &mut *self,
                    inner: &mut *handler,
                };
                if queue.drain(&mut intercept).is_break() {
                    tracing::debug!("quit requested");
                    break;
                }
                if let ControlFlow::Break(()) = handler.idle() {
                    break;
                }
            }
        });
        handler.quit();
        Ok(())
    }

    fn quit(&mut self) {
        self.stop.store(true, Ordering::Release);
    }

    fn show(&mut self) {
        self.visible = true;
    }

    fn hide(&mut self) {
        self.visible = false;
    }

    fn resize(&mut self, width: i32, height: i32) {
        self.size = (width.max(0), height.max(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        handled: Vec<ToolkitMessage>,
        ticks: usize,
        quit: bool,
        stop_after: Option<usize>,
    }

    impl ToolkitHandler for Counter {
        fn handle(&mut self, msg: ToolkitMessage) -> Result<()> {
            self.handled.push(msg);
            Ok(())
        }

        fn idle(&mut self) -> ControlFlow<()> {
            self.ticks += 1;
            match self.stop_after {
                Some(n) if self.ticks >= n => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            }
        }

        fn quit(&mut self) {
            self.quit = true;
        }
    }

    #[test]
    fn test_quit_message_ends_loop() {
        let queue = ToolkitQueue::new();
        queue.push(ToolkitMessage::ShowGui(true));
        queue.push(ToolkitMessage::ResizeGui { width: 300, height: 200 });
        queue.push(ToolkitMessage::Quit);

        let mut toolkit = HeadlessToolkit::new(Duration::from_millis(1));
        let mut handler = Counter::default();
        toolkit.exec(&queue, &mut handler).unwrap();

        assert!(handler.quit);
        assert_eq!(handler.handled.len(), 2);
        assert!(toolkit.is_visible());
        assert_eq!(toolkit.size(), (300, 200));
    }

    #[test]
    fn test_handler_can_stop() {
        let queue = ToolkitQueue::new();
        let mut toolkit = HeadlessToolkit::new(Duration::from_millis(1));
        let mut handler = Counter {
            stop_after: Some(3),
            ..Default::default()
        };
        toolkit.exec(&queue, &mut handler).unwrap();
        assert_eq!(handler.ticks, 3);
    }

    #[test]
    fn test_stop_handle() {
        let queue = ToolkitQueue::new();
        let mut toolkit = HeadlessToolkit::new(Duration::from_millis(1));
        toolkit.quit();
        let mut handler = Counter::default();
        toolkit.exec(&queue, &mut handler).unwrap();
        assert_eq!(handler.ticks, 0);
        assert!(handler.quit);
    }
}
