use crate::{Asset, AssetError};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Outcome of a request for an asset.
pub type Outcome = Result<Asset, AssetError>;

/// Error of an attempt to resolve an AssetRequest which is not permitted.
/// These are programming errors rather than ordinary request failures.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("request for asset {0} was already resolved")]
    AlreadyResolved(Uuid),
    #[error("request for asset {expected} cannot be resolved with asset {actual}")]
    AssetIdMismatch { expected: Uuid, actual: Uuid },
}

/// AssetRequest is the producing half of an outstanding request for an asset.
///
/// It's resolved exactly once: the first call to `resolve` delivers its
/// Outcome to the paired Pending, and every later call fails with
/// `ResolveError::AlreadyResolved` without effect. An AssetRequest which is
/// dropped while unresolved resolves itself with `AssetError::QueueFilled`,
/// so a Pending never waits on a request that no longer exists.
#[derive(Debug)]
pub struct AssetRequest {
    asset_id: Uuid,
    tx: Option<oneshot::Sender<Outcome>>,
}

/// Pending is the consuming half of an AssetRequest,
/// and is a Future which resolves to the request's Outcome.
/// The Outcome is delivered once: a Pending which has already yielded it
/// resolves with `AssetError::QueueFilled` if polled or taken again.
#[derive(Debug)]
pub struct Pending {
    // None once the Outcome has been yielded.
    rx: Option<oneshot::Receiver<Outcome>>,
}

impl AssetRequest {
    pub fn new(asset_id: Uuid) -> (Self, Pending) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                asset_id,
                tx: Some(tx),
            },
            Pending { rx: Some(rx) },
        )
    }

    pub fn asset_id(&self) -> Uuid {
        self.asset_id
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }

    /// True if the request is resolved, or nobody awaits its outcome
    /// because its Pending was dropped.
    pub fn is_abandoned(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// Resolve the request with `outcome`. A successful Outcome must carry
    /// the asset which was requested.
    pub fn resolve(&mut self, outcome: Outcome) -> Result<(), ResolveError> {
        let Some(tx) = self.tx.take() else {
            return Err(ResolveError::AlreadyResolved(self.asset_id));
        };

        match &outcome {
            Ok(asset) if asset.id != self.asset_id => {
                self.tx = Some(tx);
                return Err(ResolveError::AssetIdMismatch {
                    expected: self.asset_id,
                    actual: asset.id,
                });
            }
            _ => (),
        }

        // The Pending may have been dropped, in which case nobody is
        // interested in the outcome. That's not an error.
        let _ = tx.send(outcome);
        Ok(())
    }

    pub fn fail(&mut self, err: AssetError) -> Result<(), ResolveError> {
        self.resolve(Err(err))
    }
}

impl Drop for AssetRequest {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(AssetError::QueueFilled));
        }
    }
}

impl Pending {
    /// Pending which is already resolved with `outcome`.
    pub fn ready(outcome: Outcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx: Some(rx) }
    }

    /// Take the Outcome if the request has been resolved, without waiting.
    pub fn try_take(&mut self) -> Option<Outcome> {
        let Some(rx) = &mut self.rx else {
            return Some(Err(AssetError::QueueFilled));
        };
        let outcome = match rx.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(AssetError::QueueFilled),
        };
        self.rx = None;
        Some(outcome)
    }
}

impl Future for Pending {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = &mut self.rx else {
            return Poll::Ready(Err(AssetError::QueueFilled));
        };
        let outcome = match Pin::new(rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result.unwrap_or_else(|_closed| Err(AssetError::QueueFilled)),
        };
        self.rx = None;
        Poll::Ready(outcome)
    }
}
