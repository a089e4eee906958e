use crate::request::{AssetRequest, Outcome, Pending, ResolveError};
use crate::{AssetError, AssetStore};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Maximum number of requests which a paused Capability will hold.
/// Beyond this, the oldest queued request is evicted.
pub const MAX_QUEUED_REQUESTS: usize = 50;

/// State of a Capability's admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Requests are dispatched to the asset store immediately.
    Active = 0,
    /// Requests are queued until the Capability is resumed.
    Paused = 1,
    /// Terminal. Requests are refused.
    Killed = 2,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Active,
            1 => State::Paused,
            _ => State::Killed,
        }
    }
}

// A request held by a paused Capability, with the asset types it may be served.
struct Queued {
    request: AssetRequest,
    allowed: Arc<[i8]>,
}

/// Capability is a grant for fetching assets, having its own admission state
/// and bounded queue of requests awaiting its resumption.
///
/// The state is an atomic flag which is checked before every enqueue.
/// Transitions which touch the queue (resume and kill) happen while holding
/// the queue lock, and enqueues re-check the state under that same lock,
/// so no request is ever stranded in the queue of a Killed or Active
/// Capability.
pub struct Capability {
    id: Uuid,
    state: AtomicU8,
    bandwidth_limit: AtomicU32,
    queue: Mutex<VecDeque<Queued>>,
    store: Option<Arc<dyn AssetStore>>,
}

impl Capability {
    pub fn new(id: Uuid, bandwidth_limit: u32, store: Option<Arc<dyn AssetStore>>) -> Self {
        Self {
            id,
            state: AtomicU8::new(State::Active as u8),
            bandwidth_limit: AtomicU32::new(bandwidth_limit),
            queue: Mutex::new(VecDeque::with_capacity(MAX_QUEUED_REQUESTS + 1)),
            store,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advisory bandwidth limit of the Capability, where zero is unlimited.
    pub fn bandwidth_limit(&self) -> u32 {
        self.bandwidth_limit.load(Ordering::Relaxed)
    }

    pub fn set_bandwidth_limit(&self, limit: u32) {
        self.bandwidth_limit.store(limit, Ordering::Relaxed);
    }

    /// Number of requests currently queued.
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Pause an Active Capability. Returns false if it wasn't Active.
    pub fn pause(&self) -> bool {
        self.transition(State::Active, State::Paused)
    }

    /// Resume a Paused Capability, dispatching its queued requests in the
    /// order they were made. Returns false if it wasn't Paused.
    pub fn resume(&self) -> bool {
        let drained: Vec<Queued> = {
            let mut queue = self.queue.lock().unwrap();
            if !self.transition(State::Paused, State::Active) {
                return false;
            }
            queue
                .drain(..)
                .filter(|queued| !queued.request.is_abandoned())
                .collect()
        };

        tracing::debug!(cap_id = %self.id, drained = drained.len(), "resumed capability");

        for Queued { request, allowed } in drained {
            self.dispatch(request, allowed);
        }
        true
    }

    /// Kill the Capability, refusing every queued request with
    /// `AssetError::QueueFilled`. Returns the number of refused requests.
    pub fn kill(&self) -> usize {
        let drained: Vec<Queued> = {
            let mut queue = self.queue.lock().unwrap();
            self.state.store(State::Killed as u8, Ordering::Release);
            queue.drain(..).collect()
        };

        tracing::debug!(cap_id = %self.id, purged = drained.len(), "killed capability");

        let purged = drained.len();
        for Queued { request, .. } in drained {
            settle(request, Err(AssetError::QueueFilled));
        }
        purged
    }

    /// Request asset `asset_id`, which may be served only if its declared
    /// type is one of `allowed`. The returned Pending resolves once the
    /// request is served or refused; this call never blocks on the store.
    pub fn request_asset(&self, asset_id: Uuid, allowed: Arc<[i8]>) -> Pending {
        if self.state() == State::Killed {
            return Pending::ready(Err(AssetError::QueueFilled));
        }
        let (request, pending) = AssetRequest::new(asset_id);

        let evicted = {
            let mut queue = self.queue.lock().unwrap();

            match self.state() {
                State::Killed => {
                    std::mem::drop(queue);
                    settle(request, Err(AssetError::QueueFilled));
                    return pending;
                }
                State::Active => {
                    std::mem::drop(queue);
                    self.dispatch(request, allowed);
                    return pending;
                }
                State::Paused => {
                    // Requests whose Pending was dropped don't hold a slot.
                    queue.retain(|queued| !queued.request.is_abandoned());
                    queue.push_back(Queued { request, allowed });

                    if queue.len() > MAX_QUEUED_REQUESTS {
                        queue.pop_front()
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(Queued { request, .. }) = evicted {
            tracing::debug!(
                cap_id = %self.id,
                evicted = %request.asset_id(),
                "capability queue is full; evicting the oldest request"
            );
            settle(request, Err(AssetError::QueueFilled));
        }
        pending
    }

    fn transition(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // Fetch the request's asset on a spawned task, and resolve it.
    fn dispatch(&self, request: AssetRequest, allowed: Arc<[i8]>) {
        let Some(store) = self.store.clone() else {
            settle(
                request,
                Err(AssetError::ConfigIncorrect("no asset store is configured")),
            );
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            settle(
                request,
                Err(AssetError::ConfigIncorrect("no runtime is available to fetch assets")),
            );
            return;
        };

        runtime.spawn(async move {
            let asset_id = request.asset_id();

            let outcome = match store.fetch(asset_id).await {
                Ok(None) => Err(AssetError::AssetIdUnknown(asset_id)),
                Ok(Some(asset)) if !allowed.contains(&asset.asset_type) => {
                    tracing::debug!(%asset_id, asset_type = asset.asset_type, "asset type is not allowed");
                    Err(AssetError::AssetTypeWrong(asset_id))
                }
                Ok(Some(asset)) => Ok(asset),
                Err(err) => Err(AssetError::Storage(err)),
            };
            settle(request, outcome);
        });
    }
}

// Resolve an owned `request` with `outcome`. A store which answers with the
// wrong asset is treated as a storage failure.
fn settle(mut request: AssetRequest, outcome: Outcome) {
    match request.resolve(outcome) {
        Ok(()) => (),
        Err(err @ ResolveError::AssetIdMismatch { .. }) => {
            tracing::error!(%err, "asset store returned a different asset than was requested");
            if let Err(err) = request.fail(AssetError::Storage(err.into())) {
                tracing::error!(%err, "failed to resolve asset request");
            }
        }
        Err(err) => tracing::error!(%err, "failed to resolve asset request"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Asset, MemoryStore};
    use bytes::Bytes;

    fn textures() -> Arc<[i8]> {
        Arc::from(vec![0])
    }

    fn store_with(assets: &[(Uuid, i8)]) -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        for (id, asset_type) in assets {
            store.insert(Asset {
                id: *id,
                asset_type: *asset_type,
                data: Bytes::from_static(&[0, 0, 0, 0x0C, 0x6A, 0x50, 0x20, 0x20, 0x0D, 0x0A, 0x87, 0x0A]),
            });
        }
        Arc::new(store)
    }

    #[test]
    fn test_state_transitions() {
        let cap_id = Uuid::new_v4();
        let cap = Capability::new(cap_id, 0, None);
        assert_eq!(cap.id(), cap_id);
        assert_eq!(cap.state(), State::Active);

        assert!(!cap.resume());
        assert!(cap.pause());
        assert!(!cap.pause());
        assert_eq!(cap.state(), State::Paused);

        assert!(cap.resume());
        assert_eq!(cap.state(), State::Active);

        assert_eq!(cap.kill(), 0);
        assert_eq!(cap.state(), State::Killed);
        assert!(!cap.pause());
        assert!(!cap.resume());
        assert_eq!(cap.state(), State::Killed);
    }

    #[test]
    fn test_bandwidth_limit() {
        let cap = Capability::new(Uuid::new_v4(), 1024, None);
        assert_eq!(cap.bandwidth_limit(), 1024);
        cap.set_bandwidth_limit(0);
        assert_eq!(cap.bandwidth_limit(), 0);
    }

    #[tokio::test]
    async fn test_active_request_is_served() {
        let (known, mesh) = (Uuid::new_v4(), Uuid::new_v4());
        let store = store_with(&[(known, 0), (mesh, 49)]);
        let cap = Capability::new(Uuid::new_v4(), 0, Some(store.clone()));

        let asset = cap.request_asset(known, textures()).await.unwrap();
        assert_eq!((asset.id, asset.asset_type), (known, 0));

        let err = cap.request_asset(mesh, textures()).await.unwrap_err();
        assert!(matches!(err, AssetError::AssetTypeWrong(id) if id == mesh));

        let missing = Uuid::new_v4();
        let err = cap.request_asset(missing, textures()).await.unwrap_err();
        assert!(matches!(err, AssetError::AssetIdUnknown(id) if id == missing));

        assert_eq!(store.fetches(), 3);
    }

    #[tokio::test]
    async fn test_active_request_without_store_is_misconfigured() {
        let cap = Capability::new(Uuid::new_v4(), 0, None);
        let err = cap.request_asset(Uuid::new_v4(), textures()).await.unwrap_err();
        assert!(matches!(err, AssetError::ConfigIncorrect(_)));
    }

    #[tokio::test]
    async fn test_paused_requests_wait() {
        let known = Uuid::new_v4();
        let store = store_with(&[(known, 0)]);
        let cap = Capability::new(Uuid::new_v4(), 0, Some(store.clone()));
        cap.pause();

        let mut pending = cap.request_asset(known, textures());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(pending.try_take().is_none());
        assert_eq!(cap.queued(), 1);
        assert_eq!(store.fetches(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_the_oldest_request() {
        let cap = Capability::new(Uuid::new_v4(), 0, Some(store_with(&[])));
        cap.pause();

        let mut pending = Vec::new();
        for _ in 0..=MAX_QUEUED_REQUESTS {
            pending.push(cap.request_asset(Uuid::new_v4(), textures()));
            assert!(cap.queued() <= MAX_QUEUED_REQUESTS);
        }
        assert_eq!(cap.queued(), MAX_QUEUED_REQUESTS);

        let mut pending = pending.into_iter();
        let first = pending.next().unwrap();
        assert!(matches!(first.await, Err(AssetError::QueueFilled)));

        for mut rest in pending {
            assert!(rest.try_take().is_none());
        }
    }

    #[tokio::test]
    async fn test_abandoned_requests_are_not_queued_or_fetched() {
        let known = Uuid::new_v4();
        let store = store_with(&[(known, 0)]);
        let cap = Capability::new(Uuid::new_v4(), 0, Some(store.clone()));
        cap.pause();

        // Fill the queue, then abandon all but the first request.
        let first = cap.request_asset(known, textures());
        let abandoned: Vec<_> = (1..MAX_QUEUED_REQUESTS)
            .map(|_| cap.request_asset(Uuid::new_v4(), textures()))
            .collect();
        assert_eq!(cap.queued(), MAX_QUEUED_REQUESTS);
        std::mem::drop(abandoned);

        // A new request displaces abandoned requests rather than the first.
        let second = cap.request_asset(known, textures());
        assert_eq!(cap.queued(), 2);

        // Abandoned after being queued; it's skipped on resume.
        std::mem::drop(cap.request_asset(known, textures()));
        assert_eq!(cap.queued(), 3);

        assert!(cap.resume());
        assert_eq!(first.await.unwrap().id, known);
        assert_eq!(second.await.unwrap().id, known);
        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test]
    async fn test_kill_refuses_queued_and_later_requests() {
        let known = Uuid::new_v4();
        let store = store_with(&[(known, 0)]);
        let cap = Capability::new(Uuid::new_v4(), 0, Some(store.clone()));
        cap.pause();

        let queued = vec![
            cap.request_asset(known, textures()),
            cap.request_asset(Uuid::new_v4(), textures()),
        ];
        assert_eq!(cap.kill(), 2);
        assert_eq!(cap.queued(), 0);

        for pending in queued {
            assert!(matches!(pending.await, Err(AssetError::QueueFilled)));
        }

        let mut later = cap.request_asset(known, textures());
        assert!(matches!(later.try_take(), Some(Err(AssetError::QueueFilled))));
        assert_eq!(store.fetches(), 0);
    }

    #[tokio::test]
    async fn test_resume_dispatches_queued_requests() {
        let (known, missing) = (Uuid::new_v4(), Uuid::new_v4());
        let store = store_with(&[(known, 0)]);
        let cap = Capability::new(Uuid::new_v4(), 0, Some(store.clone()));
        cap.pause();

        let first = cap.request_asset(known, textures());
        let second = cap.request_asset(missing, textures());
        assert!(cap.resume());
        assert_eq!(cap.queued(), 0);

        assert_eq!(first.await.unwrap().id, known);
        assert!(matches!(second.await, Err(AssetError::AssetIdUnknown(id)) if id == missing));
        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_and_kill_all_resolve() {
        let cap = Arc::new(Capability::new(Uuid::new_v4(), 0, Some(store_with(&[]))));
        cap.pause();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cap = cap.clone();
                tokio::spawn(async move {
                    let pending: Vec<_> = (0..20)
                        .map(|_| cap.request_asset(Uuid::new_v4(), Arc::from(vec![0])))
                        .collect();
                    for pending in pending {
                        assert!(matches!(pending.await, Err(AssetError::QueueFilled)));
                    }
                })
            })
            .collect();

        tokio::task::yield_now().await;
        cap.kill();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(cap.queued(), 0);
    }
}
