//! # Controller Runner
//!
//! One pipeline run for one controller, from a fresh cache to teardown:
//!
//! 1. Build the controller's cache (types, indexes, queries).
//! 2. Run the initializer and the start hook.
//! 3. Prime the cache: open a watch per managed and watched type and apply
//!    every snapshot event until `EndOfSnapshot`, for all types, before any
//!    reconcile runs.
//! 4. Fan out: one ingestion task per watch stream, one mapper worker per
//!    watched type and custom source, and the reconcile loop.
//! 5. Tear down on cancellation or on the first task error; the stop hook
//!    always runs.
//!
//! Nothing survives a run. The supervisor restarts from step 1.

use super::error_policy::{
    classify_watch_error, handle_reconcile_result, panic_message, RetryAction, RunnerError,
};
use super::supervisor::Task;
use crate::cache::{Cache, CacheError, ReadOnlyCache, ID_INDEX};
use crate::constants::FORCE_RECONCILE_JITTER_PERCENT;
use crate::controller::{
    Controller, Event, Hook, MapperRequest, Reconciler, Request, Runtime, Source,
};
use crate::observability::metrics;
use crate::queue::{run_work_queue, QueueItem, WorkQueue};
use crate::resource::{Resource, SharedResourceService, Tenancy, Type, WatchEvent, WatchStream};
use anyhow::anyhow;
use futures::future::try_join_all;
use futures::{FutureExt, StreamExt};
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Queue and retry settings resolved for one controller.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub heartbeat: Duration,
    /// `Duration::ZERO` disables forced reconciles.
    pub force_reconcile_every: Duration,
}

pub struct ControllerRunner {
    controller: Arc<Controller>,
    client: SharedResourceService,
    settings: RunnerSettings,
}

impl fmt::Debug for ControllerRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerRunner")
            .field("controller", &self.controller.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// A watch stream that has delivered its snapshot.
struct Primed {
    stream: WatchStream,
    snapshot: Vec<Resource>,
}

/// Runs the stop hook when the pipeline ends, however it ends.
struct StopHook {
    hook: Hook,
    rt: Runtime,
}

impl Drop for StopHook {
    fn drop(&mut self) {
        (self.hook)(&self.rt);
    }
}

impl ControllerRunner {
    pub fn new(
        controller: Arc<Controller>,
        client: SharedResourceService,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            controller,
            client,
            settings,
        }
    }

    /// Wrap this runner as a restartable supervisor task.
    pub fn into_task(self) -> Task {
        let runner = Arc::new(self);
        Arc::new(move |cancel: CancellationToken| {
            let runner = Arc::clone(&runner);
            async move { runner.run(cancel).await }.boxed()
        })
    }

    /// Run one pipeline until `cancel` fires (`Ok`) or a task fails.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RunnerError> {
        let span = info_span!(
            "controller.runner",
            controller = %self.controller.name(),
            managed_type = %self.controller.managed_type(),
        );
        let result = self.run_pipeline(cancel).instrument(span.clone()).await;
        if let Err(err) = &result {
            span.in_scope(|| error!(error = %err, "controller pipeline failed"));
        }
        result
    }

    fn build_cache(&self) -> Result<Cache, CacheError> {
        let ctrl = &self.controller;
        let cache = Cache::new();

        cache.add_type(ctrl.managed_type());
        for index in ctrl.managed_indexes() {
            cache.add_index(ctrl.managed_type(), index.clone())?;
        }
        for watch in ctrl.watches() {
            cache.add_type(&watch.r#type);
            for index in &watch.indexes {
                cache.add_index(&watch.r#type, index.clone())?;
            }
        }
        for (name, query) in ctrl.queries() {
            cache.add_query(name, Arc::clone(query))?;
        }
        Ok(cache)
    }

    #[allow(
        clippy::too_many_lines,
        reason = "pipeline wiring reads best as one sequence"
    )]
    async fn run_pipeline(&self, cancel: CancellationToken) -> Result<(), RunnerError> {
        let ctrl = &self.controller;
        let name = ctrl.name().to_string();
        metrics::increment_pipeline_starts(&name);
        info!("controller pipeline starting");

        let Some(reconciler) = ctrl.reconciler().cloned() else {
            return Err(RunnerError::Initialize {
                controller: name,
                source: anyhow!("controller has no reconciler"),
            });
        };

        let cache = Arc::new(self.build_cache()?);
        let rt = Runtime {
            client: Arc::clone(&self.client),
            logger: Span::current(),
            cache: Arc::clone(&cache) as Arc<dyn ReadOnlyCache>,
        };

        if let Some(initializer) = ctrl.initializer() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                initialized = initializer.initialize(&rt) => {
                    initialized.map_err(|source| RunnerError::Initialize {
                        controller: name.clone(),
                        source,
                    })?;
                }
            }
        }

        if let Some(hook) = ctrl.notify_start() {
            hook(&rt);
        }
        let _stop = ctrl.notify_stop().map(|hook| StopHook {
            hook: Arc::clone(hook),
            rt: rt.clone(),
        });

        let group = cancel.child_token();
        let _group_guard = group.clone().drop_guard();
        let settings = &self.settings;
        let recs: Arc<WorkQueue<Request>> = run_work_queue(
            &group,
            settings.base_backoff,
            settings.max_backoff,
            settings.heartbeat,
        );

        let (managed, watched) = tokio::select! {
            biased;
            () = group.cancelled() => return Ok(()),
            primed = self.prime(&cache) => primed?,
        };
        info!("controller caches primed");

        let span = Span::current();
        let mut tasks: JoinSet<Result<(), RunnerError>> = JoinSet::new();

        for res in managed.snapshot {
            recs.add(Request::new(res.id));
        }
        {
            let recs = Arc::clone(&recs);
            tasks.spawn(
                watch_loop(
                    managed.stream,
                    Arc::clone(&cache),
                    ctrl.managed_type().clone(),
                    move |res| recs.add(Request::new(res.id)),
                )
                .instrument(span.clone()),
            );
        }

        for (watch, primed) in ctrl.watches().iter().zip(watched) {
            let queue: Arc<WorkQueue<MapperRequest>> = run_work_queue(
                &group,
                settings.base_backoff,
                settings.max_backoff,
                settings.heartbeat,
            );
            for resource in primed.snapshot {
                queue.add(MapperRequest { resource });
            }

            let ingest = Arc::clone(&queue);
            tasks.spawn(
                watch_loop(
                    primed.stream,
                    Arc::clone(&cache),
                    watch.r#type.clone(),
                    move |resource| ingest.add(MapperRequest { resource }),
                )
                .instrument(span.clone()),
            );

            let mapper = Arc::clone(&watch.mapper);
            let mapper_rt = rt.clone();
            tasks.spawn(
                map_loop(
                    name.clone(),
                    ctrl.managed_type().clone(),
                    queue,
                    Arc::clone(&recs),
                    move |item: MapperRequest| {
                        let mapper = Arc::clone(&mapper);
                        let rt = mapper_rt.clone();
                        async move { mapper.map(&rt, item.resource).await }
                    },
                )
                .instrument(span.clone()),
            );
        }

        for custom in ctrl.custom_watches() {
            let queue: Arc<WorkQueue<Event>> = run_work_queue(
                &group,
                settings.base_backoff,
                settings.max_backoff,
                settings.heartbeat,
            );
            tasks.spawn(source_loop(custom.source.clone(), Arc::clone(&queue)).instrument(span.clone()));

            let mapper = Arc::clone(&custom.mapper);
            let mapper_rt = rt.clone();
            tasks.spawn(
                map_loop(
                    name.clone(),
                    ctrl.managed_type().clone(),
                    queue,
                    Arc::clone(&recs),
                    move |event: Event| {
                        let mapper = Arc::clone(&mapper);
                        let rt = mapper_rt.clone();
                        async move { mapper.map(&rt, event).await }
                    },
                )
                .instrument(span.clone()),
            );
        }

        tasks.spawn(
            reconcile_loop(
                name.clone(),
                reconciler,
                Arc::clone(&recs),
                rt.clone(),
                Arc::clone(&cache),
                settings.force_reconcile_every,
            )
            .instrument(span.clone()),
        );

        let result = loop {
            tokio::select! {
                biased;
                () = group.cancelled() => break Ok(()),
                joined = tasks.join_next() => match joined {
                    None => break Ok(()),
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => break Err(err),
                    Some(Err(join_err)) if join_err.is_cancelled() => {}
                    Some(Err(join_err)) => break Err(RunnerError::Join(join_err)),
                },
            }
        };

        group.cancel();
        tasks.shutdown().await;
        info!("controller pipeline stopped");
        result
    }

    /// Prime the managed type and every watched type concurrently.
    async fn prime(&self, cache: &Cache) -> Result<(Primed, Vec<Primed>), RunnerError> {
        let ctrl = &self.controller;
        futures::try_join!(
            prime_type(&self.client, cache, ctrl.managed_type()),
            try_join_all(
                ctrl.watches()
                    .iter()
                    .map(|watch| prime_type(&self.client, cache, &watch.r#type)),
            ),
        )
    }
}

async fn prime_type(
    client: &SharedResourceService,
    cache: &Cache,
    resource_type: &Type,
) -> Result<Primed, RunnerError> {
    let mut stream = client
        .watch_list(resource_type, &Tenancy::wildcard())
        .await
        .map_err(|err| classify_watch_error(resource_type, err))?;

    let mut snapshot = BTreeMap::new();
    loop {
        let Some(event) = stream.next().await else {
            return Err(RunnerError::StreamClosed(resource_type.to_string()));
        };
        match event.map_err(|err| classify_watch_error(resource_type, err))? {
            WatchEvent::Upsert(res) => {
                cache.insert(res.clone())?;
                snapshot.insert(res.id.reference_key(), res);
            }
            WatchEvent::Delete(res) => {
                cache.delete(&res)?;
                snapshot.remove(&res.id.reference_key());
            }
            WatchEvent::EndOfSnapshot => break,
        }
    }

    debug!(resource_type = %resource_type, resources = snapshot.len(), "cache primed");
    Ok(Primed {
        stream,
        snapshot: snapshot.into_values().collect(),
    })
}

/// Apply live watch events to the cache, then hand each changed resource on.
async fn watch_loop<F>(
    mut stream: WatchStream,
    cache: Arc<Cache>,
    resource_type: Type,
    on_change: F,
) -> Result<(), RunnerError>
where
    F: Fn(Resource) + Send + 'static,
{
    while let Some(event) = stream.next().await {
        match event.map_err(|err| classify_watch_error(&resource_type, err))? {
            WatchEvent::Upsert(res) => {
                cache.insert(res.clone())?;
                on_change(res);
            }
            WatchEvent::Delete(res) => {
                cache.delete(&res)?;
                on_change(res);
            }
            WatchEvent::EndOfSnapshot => {}
        }
    }
    Err(RunnerError::StreamClosed(resource_type.to_string()))
}

async fn source_loop(source: Source, queue: Arc<WorkQueue<Event>>) -> Result<(), RunnerError> {
    let mut rx = source.rx.lock().await;
    while let Some(event) = rx.recv().await {
        queue.add(event);
    }
    debug!("custom event source closed");
    Ok(())
}

/// Drain a mapper queue into the reconcile queue.
///
/// Requests for any type other than the managed type are dropped: they are
/// a mapper bug and must never reach the reconciler.
async fn map_loop<T, F, Fut>(
    controller: String,
    managed_type: Type,
    queue: Arc<WorkQueue<T>>,
    recs: Arc<WorkQueue<Request>>,
    map: F,
) -> Result<(), RunnerError>
where
    T: QueueItem,
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Vec<Request>>> + Send,
{
    while let Some(item) = queue.get().await {
        match AssertUnwindSafe(map(item.clone())).catch_unwind().await {
            Ok(Ok(requests)) => {
                queue.forget(&item);
                for request in requests {
                    if request.id.r#type != managed_type {
                        error!(
                            resource_id = %request.id,
                            expected_type = %managed_type,
                            "dependency mapper returned a request for the wrong type, dropping it"
                        );
                        metrics::increment_mapped_requests_dropped(&controller);
                        continue;
                    }
                    recs.add(request);
                }
            }
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                warn!(key = %item.key(), error = %message, "dependency mapper failed");
                queue.add_rate_limited(item.clone()).await;
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(key = %item.key(), panic = %message, "dependency mapper panicked");
                metrics::increment_reconcile_panics(&controller);
                queue.add_rate_limited(item.clone()).await;
            }
        }
        queue.done(&item);
    }
    Ok(())
}

async fn reconcile_loop(
    controller: String,
    reconciler: Arc<dyn Reconciler>,
    recs: Arc<WorkQueue<Request>>,
    rt: Runtime,
    cache: Arc<Cache>,
    force_reconcile_every: Duration,
) -> Result<(), RunnerError> {
    while let Some(request) = recs.get().await {
        let started = Instant::now();
        let result = match AssertUnwindSafe(reconciler.reconcile(&rt, request.clone()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(resource_id = %request.id, panic = %message, "reconciler panicked");
                metrics::increment_reconcile_panics(&controller);
                Err(anyhow!("panic [recovered]: {message}"))
            }
        };

        match handle_reconcile_result(&controller, &request, &result, started.elapsed()) {
            RetryAction::Forget => {
                recs.forget(&request);
                let cached = matches!(
                    cache.get(&request.id.r#type, ID_INDEX, &request.id.reference_key()),
                    Ok(Some(_))
                );
                if !force_reconcile_every.is_zero() && cached {
                    metrics::increment_requeues(&controller, "force-reconcile");
                    recs.add_after(request.clone(), force_reconcile_delay(force_reconcile_every))
                        .await;
                }
            }
            RetryAction::RequeueAfter(delay) => {
                recs.forget(&request);
                recs.add_after(request.clone(), delay).await;
            }
            RetryAction::RateLimited => recs.add_rate_limited(request.clone()).await,
        }
        recs.done(&request);
    }
    Ok(())
}

/// `every` minus a random share of up to [`FORCE_RECONCILE_JITTER_PERCENT`].
fn force_reconcile_delay(every: Duration) -> Duration {
    #[allow(
        clippy::cast_precision_loss,
        reason = "the jitter percentage is a small constant"
    )]
    let max_jitter = FORCE_RECONCILE_JITTER_PERCENT as f64 / 100.0;
    let jitter = rand::rng().random_range(0.0..=max_jitter);
    every.mul_f64(1.0 - jitter)
}
