use async_trait::async_trait;
use bf_core::{ConversionEvent, Network};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::Notify;

pub mod http;
pub mod mock;
pub mod wire;

#[derive(Debug, Error)]
pub enum PixelError {
    #[error("{0} pixel is not loaded")]
    NotLoaded(Network),
    #[error("{network} pixel rejected event: {message}")]
    Rejected { network: Network, message: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{network} pixel crashed during dispatch: {message}")]
    Crashed { network: Network, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Capability over one third-party tracking library.
#[async_trait]
pub trait PixelNetwork: Send + Sync {
    fn network(&self) -> Network;

    /// Whether the library finished loading and can accept events.
    fn is_available(&self) -> bool;

    /// Fire-and-forget delivery of a single event. No retries.
    async fn dispatch(&self, event: &ConversionEvent) -> Result<(), PixelError>;
}

/// Holds a network's library once it has been installed. Libraries may
/// arrive late or never; an empty slot is "unavailable", not an error.
struct PixelSlot {
    network: Network,
    inner: RwLock<Option<Arc<dyn PixelNetwork>>>,
}

impl PixelSlot {
    fn new(network: Network) -> Self {
        Self {
            network,
            inner: RwLock::new(None),
        }
    }

    fn get(&self) -> Option<Arc<dyn PixelNetwork>> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(_) => {
                tracing::warn!(network=%self.network, "pixel slot lock poisoned");
                None
            }
        }
    }

    fn set(&self, pixel: Option<Arc<dyn PixelNetwork>>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = pixel,
            Err(poisoned) => *poisoned.into_inner() = pixel,
        }
    }
}

/// What happened synchronously when an event was handed to the networks.
/// Delivery itself runs detached; outcomes are only logged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub fired: Vec<Network>,
    pub unavailable: Vec<Network>,
}

impl DispatchReport {
    pub fn none_fired(&self) -> bool {
        self.fired.is_empty()
    }
}

/// Counts detached deliveries so a short-lived process can drain them.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn enter(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self(in_flight.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Runs one delivery on its own task so that a panicking library is
/// contained like any other failure.
async fn deliver(
    network: Network,
    pixel: Arc<dyn PixelNetwork>,
    event: ConversionEvent,
) -> Result<(), PixelError> {
    let handle = tokio::spawn(async move { pixel.dispatch(&event).await });
    match handle.await {
        Ok(result) => result,
        Err(join_err) => Err(PixelError::Crashed {
            network,
            message: join_err.to_string(),
        }),
    }
}

/// Fans events out to every installed network independently.
pub struct PixelRegistry {
    slots: [PixelSlot; 3],
    in_flight: Arc<InFlight>,
}

impl Default for PixelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelRegistry {
    pub fn new() -> Self {
        Self {
            slots: Network::ALL.map(PixelSlot::new),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    fn slot(&self, network: Network) -> &PixelSlot {
        match network {
            Network::Facebook => &self.slots[0],
            Network::TikTok => &self.slots[1],
            Network::Snapchat => &self.slots[2],
        }
    }

    pub fn install(&self, pixel: Arc<dyn PixelNetwork>) {
        let network = pixel.network();
        tracing::debug!(%network, "pixel installed");
        self.slot(network).set(Some(pixel));
    }

    fn loaded(&self, network: Network) -> Option<Arc<dyn PixelNetwork>> {
        self.slot(network).get().filter(|p| p.is_available())
    }

    pub fn is_available(&self, network: Network) -> bool {
        self.loaded(network).is_some()
    }

    pub fn available(&self) -> Vec<Network> {
        Network::ALL
            .into_iter()
            .filter(|n| self.is_available(*n))
            .collect()
    }

    /// Dispatches to one network and waits for the library to return.
    pub async fn dispatch(
        &self,
        network: Network,
        event: &ConversionEvent,
    ) -> Result<(), PixelError> {
        let pixel = self.loaded(network).ok_or(PixelError::NotLoaded(network))?;
        deliver(network, pixel, event.for_network(network)).await
    }

    /// Hands the event to each available network in `targets` and returns
    /// without waiting. Every delivery runs detached, so a slow, failing or
    /// hung library never holds up the others or the caller.
    pub fn dispatch_all(&self, event: &ConversionEvent, targets: &[Network]) -> DispatchReport {
        let mut report = DispatchReport::default();
        for &network in targets {
            let Some(pixel) = self.loaded(network) else {
                tracing::debug!(%network, "pixel unavailable, skipping");
                report.unavailable.push(network);
                continue;
            };
            let event = event.for_network(network);
            let name = event.kind.wire_name(network);
            let guard = InFlightGuard::enter(&self.in_flight);
            tokio::spawn(async move {
                let _guard = guard;
                match deliver(network, pixel, event).await {
                    Ok(()) => tracing::debug!(%network, event = name, "pixel event fired"),
                    Err(err) => tracing::warn!(%network, error=%err, "pixel dispatch failed"),
                }
            });
            report.fired.push(network);
        }
        report
    }

    /// Deliveries started by [`PixelRegistry::dispatch_all`] that have not
    /// returned yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Resolves once no delivery is in flight. Callers that must not hang on
    /// a stuck library wrap this in a timeout.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::RecordingPixel;
    use super::*;
    use bf_core::{CustomData, EventKind};
    use std::time::Duration;

    struct PanickingPixel;

    #[async_trait]
    impl PixelNetwork for PanickingPixel {
        fn network(&self) -> Network {
            Network::TikTok
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn dispatch(&self, _event: &ConversionEvent) -> Result<(), PixelError> {
            panic!("ttq.track is not a function");
        }
    }

    /// A library whose call never returns.
    struct StuckPixel;

    #[async_trait]
    impl PixelNetwork for StuckPixel {
        fn network(&self) -> Network {
            Network::Facebook
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn dispatch(&self, _event: &ConversionEvent) -> Result<(), PixelError> {
            std::future::pending().await
        }
    }

    fn lead_event() -> ConversionEvent {
        ConversionEvent::new(EventKind::Lead)
            .with_custom_data(CustomData::venue_fee())
            .with_event_id(Some("abc123".into()))
    }

    async fn settle(registry: &PixelRegistry) {
        tokio::time::timeout(Duration::from_secs(2), registry.wait_idle())
            .await
            .expect("deliveries settle");
    }

    #[tokio::test]
    async fn test_partial_availability() {
        let registry = PixelRegistry::new();
        let snap = RecordingPixel::new(Network::Snapchat);
        registry.install(snap.clone());

        let report = registry.dispatch_all(&lead_event(), &Network::ALL);
        assert_eq!(report.fired, vec![Network::Snapchat]);
        assert_eq!(report.unavailable, vec![Network::Facebook, Network::TikTok]);
        settle(&registry).await;

        let calls = snap.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, EventKind::SignUp);
        assert!(calls[0].event_id.is_none());
    }

    #[tokio::test]
    async fn test_failure_does_not_block_other_networks() {
        let registry = PixelRegistry::new();
        let fb = RecordingPixel::new(Network::Facebook);
        fb.set_failing(true);
        let snap = RecordingPixel::new(Network::Snapchat);
        registry.install(fb.clone());
        registry.install(Arc::new(PanickingPixel));
        registry.install(snap.clone());

        let report = registry.dispatch_all(&lead_event(), &Network::ALL);
        assert_eq!(report.fired.len(), 3);
        settle(&registry).await;
        assert_eq!(snap.calls().len(), 1);
        assert!(fb.calls().is_empty());
    }

    #[tokio::test]
    async fn test_crash_surfaces_as_error_on_direct_dispatch() {
        let registry = PixelRegistry::new();
        registry.install(Arc::new(PanickingPixel));

        let err = registry
            .dispatch(Network::TikTok, &lead_event())
            .await
            .expect_err("panic is contained");
        assert!(matches!(err, PixelError::Crashed { network: Network::TikTok, .. }));
        assert!(matches!(
            registry.dispatch(Network::Snapchat, &lead_event()).await,
            Err(PixelError::NotLoaded(Network::Snapchat))
        ));
    }

    #[tokio::test]
    async fn test_stuck_library_does_not_hold_up_others() {
        let registry = PixelRegistry::new();
        let tt = RecordingPixel::new(Network::TikTok);
        registry.install(Arc::new(StuckPixel));
        registry.install(tt.clone());

        let report = tokio::time::timeout(Duration::from_secs(2), async {
            registry.dispatch_all(&lead_event(), &Network::ALL)
        })
        .await
        .expect("dispatch returns without waiting");
        assert_eq!(report.fired, vec![Network::Facebook, Network::TikTok]);

        for _ in 0..200 {
            if registry.in_flight() <= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tt.calls().len(), 1);
        assert_eq!(registry.in_flight(), 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), registry.wait_idle())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_event_id_only_forwarded_to_facebook() {
        let registry = PixelRegistry::new();
        let fb = RecordingPixel::new(Network::Facebook);
        let tt = RecordingPixel::new(Network::TikTok);
        registry.install(fb.clone());
        registry.install(tt.clone());

        registry.dispatch_all(&lead_event(), &Network::ALL);
        settle(&registry).await;
        assert_eq!(fb.calls()[0].event_id.as_deref(), Some("abc123"));
        assert_eq!(tt.calls()[0].kind, EventKind::SubmitForm);
        assert!(tt.calls()[0].event_id.is_none());
    }

    #[tokio::test]
    async fn test_installed_but_not_loaded_is_unavailable() {
        let registry = PixelRegistry::new();
        let fb = RecordingPixel::new(Network::Facebook);
        fb.set_available(false);
        registry.install(fb.clone());

        assert!(!registry.is_available(Network::Facebook));
        let report = registry.dispatch_all(&lead_event(), &[Network::Facebook]);
        assert!(report.none_fired());
        assert_eq!(registry.in_flight(), 0);
        assert!(fb.calls().is_empty());

        fb.set_available(true);
        assert_eq!(registry.available(), vec![Network::Facebook]);
    }
}
