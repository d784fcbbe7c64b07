//! Reviving callback sources inside option trees.
//!
//! A revival pass walks a list of paths, screens the string found at each,
//! compiles it into its own context and writes a [`RevivedCallback`] back at
//! the same path. Nothing here fails the pass: rejected or broken sources
//! stay in the tree as inert strings and are reported in [`RevivalReport`].

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::SandboxError;
use crate::path::OptionPath;
use crate::pool::{ContextId, ContextPool};
use crate::screener;
use crate::tree::ConfigTree;

/// A callable bound to one sandboxed context.
///
/// Cloning shares the context; equality compares the context id.
#[derive(Debug, Clone)]
pub struct RevivedCallback {
    context_id: ContextId,
    path: OptionPath,
    pool: Weak<ContextPool>,
}

impl RevivedCallback {
    /// The context this callback runs in.
    pub fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    /// The path the callback was revived at.
    pub fn path(&self) -> &OptionPath {
        &self.path
    }

    /// Invoke the callback with deep copies of `args`.
    ///
    /// Returns `None` when the function returns `undefined` and on every
    /// failure: released context, disposed or dropped pool, thrown
    /// exception, timeout, heap exhaustion, or a result that cannot be
    /// copied out. Failures are logged, never raised.
    pub async fn call(&self, args: &[Value]) -> Option<Value> {
        let Some(pool) = self.pool.upgrade() else {
            tracing::warn!(
                path = %self.path,
                context_id = %self.context_id,
                "callback invoked after its pool was dropped"
            );
            return None;
        };

        match pool.invoke(&self.context_id, args.to_vec()).await {
            Ok(value) => value,
            Err(SandboxError::ContextNotFound { .. } | SandboxError::Disposed) => {
                pool.metrics()
                    .stale_invocations
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    path = %self.path,
                    context_id = %self.context_id,
                    "callback context is no longer live"
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path,
                    context_id = %self.context_id,
                    kind = e.kind(),
                    error = %e,
                    "callback invocation failed"
                );
                None
            }
        }
    }
}

impl PartialEq for RevivedCallback {
    fn eq(&self, other: &Self) -> bool {
        self.context_id == other.context_id
    }
}

/// Why a path was left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Nothing exists at the path.
    Missing,
    /// The value at the path is not a string.
    NotAString,
    /// The screener refused the source.
    Rejected {
        /// Screener verdict.
        reason: String,
    },
    /// No context could be created for the source.
    ContextUnavailable {
        /// Pool error.
        reason: String,
    },
    /// The source did not compile to a function.
    CompileFailed {
        /// Compilation error.
        reason: String,
    },
    /// The callback could not be written back at the path.
    Unassignable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("no value at path"),
            Self::NotAString => f.write_str("value is not a string"),
            Self::Rejected { reason } => write!(f, "rejected: {reason}"),
            Self::ContextUnavailable { reason } => write!(f, "no context: {reason}"),
            Self::CompileFailed { reason } => write!(f, "compile failed: {reason}"),
            Self::Unassignable => f.write_str("path is not assignable"),
        }
    }
}

/// A path skipped during revival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPath {
    /// The path as given.
    pub path: OptionPath,
    /// Why it was skipped.
    pub reason: SkipReason,
}

/// Outcome of one revival pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RevivalReport {
    /// Contexts created and kept, in path order.
    pub context_ids: Vec<ContextId>,
    /// Paths left untouched.
    pub skipped: Vec<SkippedPath>,
}

/// Revive the callbacks at `paths`, returning the contexts created.
pub async fn revive(
    pool: &Arc<ContextPool>,
    tree: &mut ConfigTree,
    paths: &[OptionPath],
) -> Vec<ContextId> {
    revive_detailed(pool, tree, paths).await.context_ids
}

/// Like [`revive`], also reporting each skipped path and why.
#[tracing::instrument(skip_all, fields(paths = paths.len()))]
pub async fn revive_detailed(
    pool: &Arc<ContextPool>,
    tree: &mut ConfigTree,
    paths: &[OptionPath],
) -> RevivalReport {
    let mut report = RevivalReport::default();
    for path in paths {
        match revive_one(pool, tree, path).await {
            Ok(id) => report.context_ids.push(id),
            Err(reason) => report.skipped.push(SkippedPath {
                path: path.clone(),
                reason,
            }),
        }
    }
    tracing::debug!(
        revived = report.context_ids.len(),
        skipped = report.skipped.len(),
        "revival pass finished"
    );
    report
}

async fn revive_one(
    pool: &Arc<ContextPool>,
    tree: &mut ConfigTree,
    path: &OptionPath,
) -> Result<ContextId, SkipReason> {
    let source = match tree.get_path(path) {
        None => return Err(SkipReason::Missing),
        Some(ConfigTree::String(source)) => source.clone(),
        Some(_) => return Err(SkipReason::NotAString),
    };
    let digest = source_digest(&source);

    if let Err(e) = screener::screen(&source, Some(pool.config().max_source_size)) {
        pool.metrics().rejected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(path = %path, digest = %digest, error = %e, "callback source rejected");
        return Err(SkipReason::Rejected {
            reason: e.to_string(),
        });
    }

    let id = match pool.create_context().await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(path = %path, digest = %digest, error = %e, "no context for callback");
            return Err(SkipReason::ContextUnavailable {
                reason: e.to_string(),
            });
        }
    };

    if let Err(e) = pool.compile(&id, &source).await {
        tracing::warn!(
            path = %path,
            context_id = %id,
            digest = %digest,
            error = %e,
            "callback failed to compile"
        );
        pool.remove_context(&id).await;
        return Err(SkipReason::CompileFailed {
            reason: e.to_string(),
        });
    }

    let callback = RevivedCallback {
        context_id: id.clone(),
        path: path.clone(),
        pool: Arc::downgrade(pool),
    };
    if !tree.set_path(path, ConfigTree::Callback(callback)) {
        pool.remove_context(&id).await;
        return Err(SkipReason::Unassignable);
    }

    tracing::debug!(path = %path, context_id = %id, digest = %digest, "callback revived");
    Ok(id)
}

/// Release exactly `ids`, returning how many were still live.
pub async fn release(pool: &ContextPool, ids: &[ContextId]) -> usize {
    let mut released = 0;
    for id in ids {
        if pool.remove_context(id).await {
            released += 1;
        }
    }
    released
}

/// The conventional per-series callback slots that currently hold strings:
/// `series.N.symbolSize` and `series.N.itemStyle.color`.
pub fn series_callback_paths(tree: &ConfigTree) -> Vec<OptionPath> {
    let Some(series) = tree
        .get_path(&OptionPath::field("series"))
        .and_then(ConfigTree::as_array)
    else {
        return Vec::new();
    };

    let mut paths = Vec::new();
    for index in 0..series.len() {
        let base = OptionPath::field("series").push_index(index);
        for candidate in [
            base.clone().push_field("symbolSize"),
            base.push_field("itemStyle").push_field("color"),
        ] {
            if tree.get_path(&candidate).and_then(ConfigTree::as_str).is_some() {
                paths.push(candidate);
            }
        }
    }
    paths
}

/// Short SHA-256 prefix identifying a source in logs.
fn source_digest(source: &str) -> String {
    let mut hex = format!("{:x}", Sha256::digest(source.as_bytes()));
    hex.truncate(12);
    hex
}
