//! Integration tests for the plinth engine
//!
//! Test categories:
//! - Lifecycle: adding and removing plugins, errors, callbacks, saved state
//! - Programs: program lists and the parameter resync that follows a change
//! - Processing: the real-time block, host controllers and peaks
//!
//! Run with:
//! ```bash
//! cargo test -p plinth --test integration_tests
//! ```

mod helpers;
mod integration;
