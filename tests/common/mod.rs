//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{FakeTools, FakeToolsOptions};
//!
//! #[tokio::test]
//! async fn test_sync() {
//!     let tools = FakeTools::install(FakeToolsOptions::default());
//!     let config = tools.app_config(5, 10, false);
//!     // ...
//! }
//! ```

mod constants;
mod fake_tools;
mod server;

#[allow(unused_imports)]
pub use constants::*;
#[allow(unused_imports)]
pub use fake_tools::{FakeTools, FakeToolsOptions};
#[allow(unused_imports)]
pub use server::TestServer;
