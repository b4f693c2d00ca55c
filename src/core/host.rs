use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinError;

use super::error::EngineError;
use super::simulation::{SimulationOutput, SimulationRequest, run_simulation_cancellable};

pub type HostOutcome = Result<Arc<SimulationOutput>, EngineError>;

#[derive(Clone, Debug)]
pub struct HostResult {
    pub generation: u64,
    pub outcome: HostOutcome,
}

/// Runs simulations off the caller's task with a queue of one: every submission
/// supersedes all earlier ones, and superseded results are never published.
#[derive(Clone)]
pub struct SimulationHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    throttle: Duration,
    generation: AtomicU64,
    results: watch::Sender<Option<HostResult>>,
}

impl HostInner {
    fn is_stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    fn publish(&self, generation: u64, outcome: &HostOutcome) -> bool {
        self.results.send_if_modified(|slot| {
            let older_than_published = slot
                .as_ref()
                .is_some_and(|published| published.generation > generation);
            if self.is_stale(generation) || older_than_published {
                return false;
            }
            *slot = Some(HostResult {
                generation,
                outcome: outcome.clone(),
            });
            true
        })
    }

    async fn run(
        self: Arc<Self>,
        generation: u64,
        request: SimulationRequest,
        current_year: i32,
        reply: oneshot::Sender<HostOutcome>,
    ) {
        if !self.throttle.is_zero() {
            tokio::time::sleep(self.throttle).await;
        }
        if self.is_stale(generation) {
            debug!("request {generation} superseded while throttled");
            let _ = reply.send(Err(EngineError::Superseded));
            return;
        }

        let worker = Arc::clone(&self);
        let joined = tokio::task::spawn_blocking(move || {
            run_simulation_cancellable(&request, current_year, &|| worker.is_stale(generation))
        })
        .await;
        let outcome = outcome_from_join(generation, joined);

        if !self.publish(generation, &outcome) {
            info!("request {generation} superseded, discarding its result");
            let _ = reply.send(Err(EngineError::Superseded));
            return;
        }
        match &outcome {
            Ok(output) => info!(
                "request {generation} completed with {} cycles",
                output.cycle_count
            ),
            Err(err) => info!("request {generation} rejected: {err}"),
        }
        let _ = reply.send(outcome);
    }
}

fn outcome_from_join(
    generation: u64,
    joined: Result<Result<SimulationOutput, EngineError>, JoinError>,
) -> HostOutcome {
    match joined {
        Ok(outcome) => outcome.map(Arc::new),
        Err(err) => {
            warn!("request {generation} worker failed: {err}");
            Err(EngineError::WorkerFailed(err.to_string()))
        }
    }
}

impl SimulationHost {
    pub fn new(throttle: Duration) -> Self {
        let (results, _) = watch::channel(None);
        Self {
            inner: Arc::new(HostInner {
                throttle,
                generation: AtomicU64::new(0),
                results,
            }),
        }
    }

    pub fn submit(&self, request: SimulationRequest, current_year: i32) -> u64 {
        self.dispatch(request, current_year).0
    }

    fn dispatch(
        &self,
        request: SimulationRequest,
        current_year: i32,
    ) -> (u64, oneshot::Receiver<HostOutcome>) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply, receiver) = oneshot::channel();
        debug!("request {generation} accepted");
        tokio::spawn(Arc::clone(&self.inner).run(generation, request, current_year, reply));
        (generation, receiver)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<HostResult>> {
        self.inner.results.subscribe()
    }

    pub fn cancel(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("cancelled in-flight requests up to generation {generation}");
    }

    pub fn latest_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Submits `request` and waits for it. Returns `Ok(None)` when a newer
    /// request overtook this one.
    pub async fn run_latest(
        &self,
        request: SimulationRequest,
        current_year: i32,
    ) -> Result<Option<Arc<SimulationOutput>>, EngineError> {
        let (generation, receiver) = self.dispatch(request, current_year);
        match receiver.await {
            Ok(Ok(output)) => Ok(Some(output)),
            Ok(Err(EngineError::Superseded)) => Ok(None),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!("request {generation} finished without a reply");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::simulation::{MarketHistory, SimulationSettings};
    use crate::core::types::{
        ConstantRate, MonthlyDelta, PartialPortfolio, Portfolio, RawStage,
        RedistributionFrequency, WithdrawalScheme,
    };
    use std::collections::BTreeMap;

    fn request(end_year: i32) -> SimulationRequest {
        SimulationRequest {
            people: Vec::new(),
            stages: vec![RawStage {
                id: "retired".to_string(),
                name: "Retired".to_string(),
                end_year: None,
                income_by_person: Some(BTreeMap::new()),
                withdrawal: Some(WithdrawalScheme::Constant(ConstantRate::Fixed(1_200.0))),
                allocation: Some(PartialPortfolio::from(Portfolio::new(1.0, 0.0, 0.0, 0.0))),
                redistribution_frequency: Some(RedistributionFrequency::Never),
            }],
            initial_portfolio: Portfolio::new(10_000.0, 0.0, 0.0, 0.0),
            history: MarketHistory::Deltas(vec![MonthlyDelta::FLAT; 60]),
            start_year: 2025,
            end_year: Some(end_year),
            settings: SimulationSettings::default(),
        }
    }

    #[tokio::test]
    async fn run_latest_returns_the_output() {
        let host = SimulationHost::new(Duration::ZERO);
        let output = host
            .run_latest(request(2027), 2025)
            .await
            .expect("valid request")
            .expect("not superseded");
        assert_eq!(output.months_per_cycle, 24);
        assert_eq!(output.cycle_count, 37);
    }

    #[tokio::test]
    async fn configuration_errors_are_returned_to_the_caller() {
        let host = SimulationHost::new(Duration::ZERO);
        let mut bad = request(2027);
        bad.settings.percentile_tail = 75.0;
        assert!(matches!(
            host.run_latest(bad, 2025).await,
            Err(EngineError::InvalidAggregation(_))
        ));
    }

    #[tokio::test]
    async fn panicking_worker_becomes_an_error_outcome() {
        let joined = tokio::task::spawn_blocking(|| -> Result<SimulationOutput, EngineError> {
            panic!("worker blew up")
        })
        .await;
        assert!(matches!(
            outcome_from_join(7, joined),
            Err(EngineError::WorkerFailed(_))
        ));
    }

    #[tokio::test]
    async fn newer_request_supersedes_older_one() {
        let host = SimulationHost::new(Duration::from_millis(20));
        let (older, newer) = tokio::join!(
            host.run_latest(request(2027), 2025),
            host.run_latest(request(2028), 2025)
        );

        assert_eq!(older, Ok(None));
        let newer = newer.expect("valid request").expect("latest request");
        assert_eq!(newer.months_per_cycle, 36);
    }

    #[tokio::test]
    async fn subscribers_only_see_the_latest_result() {
        let host = SimulationHost::new(Duration::from_millis(20));
        let mut results = host.subscribe();

        host.submit(request(2027), 2025);
        let latest = host.submit(request(2028), 2025);
        assert_eq!(latest, 2);

        results.changed().await.expect("host alive");
        let delivered = results.borrow_and_update().clone().expect("a result");
        assert_eq!(delivered.generation, latest);
        let output = delivered.outcome.expect("valid request");
        assert_eq!(output.months_per_cycle, 36);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!results.has_changed().expect("host alive"));
    }

    #[tokio::test]
    async fn cancel_discards_in_flight_requests() {
        let host = SimulationHost::new(Duration::from_millis(20));
        let results = host.subscribe();

        host.submit(request(2027), 2025);
        host.cancel();
        assert_eq!(host.latest_generation(), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(results.borrow().is_none());

        let output = host
            .run_latest(request(2027), 2025)
            .await
            .expect("valid request");
        assert!(output.is_some());
    }
}
