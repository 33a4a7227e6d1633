//! Content scanning hook run on a verified object before it is stored.

use std::future::Future;
use std::pin::Pin;

use crate::reassembler::ObjectManifest;
use crate::store::{ChunkStream, StoreError};

/// Outcome of a content scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Rejected(String),
}

/// A boxed future returned by [`ContentScanner::scan`].
pub type ScanFuture<'a> = Pin<Box<dyn Future<Output = Result<ScanVerdict, StoreError>> + Send + 'a>>;

/// External scanner (malware, content policy) consulted during finalization.
///
/// Receives the object as an ordered chunk stream; it never sees an object
/// that failed hash verification.
pub trait ContentScanner: Send + Sync + 'static {
    fn scan<'a>(&'a self, manifest: &'a ObjectManifest, chunks: ChunkStream<'a>) -> ScanFuture<'a>;
}

/// Scanner that accepts everything without reading the stream.
pub struct NoopScanner;

impl ContentScanner for NoopScanner {
    fn scan<'a>(&'a self, _manifest: &'a ObjectManifest, _chunks: ChunkStream<'a>) -> ScanFuture<'a> {
        Box::pin(async { Ok(ScanVerdict::Clean) })
    }
}
