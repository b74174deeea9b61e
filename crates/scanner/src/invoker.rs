use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use wsscan_protocol::{ScanConfig, ScanOutcome};

/// A boxed future returned by [`ScanInvoker::invoke`].
pub type InvokeFuture<'a> = Pin<Box<dyn Future<Output = ScanOutcome> + Send + 'a>>;

/// Runs the scan engine once against a materialized archive.
///
/// Implementations never retry and never fail with an error: launch
/// failures and non-zero exits are reported as failure outcomes. Dropping
/// the returned future must stop any work it started.
pub trait ScanInvoker: Send + Sync + 'static {
    fn invoke<'a>(&'a self, config: &'a ScanConfig, archive: &'a Path) -> InvokeFuture<'a>;
}

impl<T: ScanInvoker> ScanInvoker for std::sync::Arc<T> {
    fn invoke<'a>(&'a self, config: &'a ScanConfig, archive: &'a Path) -> InvokeFuture<'a> {
        (**self).invoke(config, archive)
    }
}
