#![warn(missing_docs)]

//! # chartbox-sandbox
//!
//! Sandboxed execution of chart option callbacks.
//!
//! Chart option documents may carry JavaScript function literals as strings
//! (`"function(p){ return p.data[1] > 100 ? 'red' : 'blue'; }"`). This crate
//! turns selected string leaves into [`RevivedCallback`]s that run inside a
//! shared V8 isolate, one hardened context per callback.
//!
//! ## Security model
//!
//! - **V8 isolate**: one isolate per pool with a fixed heap ceiling
//! - **Context per callback**: no globals shared between callbacks
//! - **No host bindings**: contexts see only the ECMAScript builtins, minus `eval` and `WebAssembly`
//! - **Pre-execution screening**: banned patterns caught before reaching V8
//! - **Timeout enforcement**: every compile and call is terminated at its deadline
//! - **Copy in, copy out**: arguments and results cross the boundary as JSON values
//!
//! ## Example
//!
//! ```no_run
//! # async fn demo() -> Result<(), chartbox_sandbox::SandboxError> {
//! use chartbox_sandbox::{revive, ConfigTree, ContextPool, OptionPath, SandboxConfig};
//! use serde_json::json;
//!
//! let pool = ContextPool::new(SandboxConfig::default())?;
//! let mut options = ConfigTree::from(json!({
//!     "series": [{ "itemStyle": { "color": "function(p){ return p.data[1] > 100 ? 'red' : 'blue'; }" } }]
//! }));
//! let path: OptionPath = "series.0.itemStyle.color".parse().expect("valid path");
//! let ids = revive(&pool, &mut options, &[path.clone()]).await;
//!
//! if let Some(color) = options.get_path(&path).and_then(ConfigTree::as_callback) {
//!     let value = color.call(&[json!({ "data": [0, 150] })]).await;
//!     assert_eq!(value, Some(json!("red")));
//! }
//! chartbox_sandbox::release(&pool, &ids).await;
//! pool.dispose_all().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
mod isolate;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod path;
pub mod pool;
pub mod revive;
pub mod screener;
pub mod tree;

pub use error::SandboxError;
pub use path::{OptionPath, PathError, Segment};
pub use pool::{ContextId, ContextInfo, ContextPool, PoolMetrics, SandboxConfig};
pub use revive::{
    release, revive, revive_detailed, series_callback_paths, RevivalReport, RevivedCallback,
    SkipReason, SkippedPath,
};
pub use tree::ConfigTree;
