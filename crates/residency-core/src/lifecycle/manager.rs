//! Orchestrates construction, activation and eviction of model handles.
//!
//! One handle is active at a time; a bounded LRU set of constructed handles
//! stays warm. Every construction runs as a spawned "flight" registered by
//! artifact name, so a foreground load for an artifact that is already being
//! built (typically by a preload) joins that flight instead of starting a
//! second one. Constructors and teardown never run under the state lock.
//!
//! Before whole handles are evicted, memory is shaved from the loaded object
//! by unloading its lowest-priority components, when a component manager is
//! attached.

use super::types::{
    LifecycleStats, LoadRequest, ModelConstructor, ModelHandle, ModelInfo, ModelSnapshot, ResidencyState,
};
use crate::cache::LruTier;
use crate::cancel::CancellationToken;
use crate::components::ComponentUnloadManager;
use crate::config::LifecycleSettings;
use crate::error::{ResidencyError, Result};
use crate::monitor::MemoryMonitor;
use crate::sync::lock;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why a flight produced no handle. Cloneable so every waiter gets a copy.
#[derive(Debug, Clone)]
enum Failure {
    Exhausted { required: u64, available: u64 },
    Construct(String),
    Timeout(Duration),
    /// A preload finished but the warm set had no slot that did not hold the
    /// active handle.
    NoRoom,
}

impl Failure {
    fn into_error(self, name: &str) -> ResidencyError {
        match self {
            Failure::Exhausted { required, available } => {
                ResidencyError::ResourceExhausted { required, available }
            }
            Failure::Construct(message) => ResidencyError::ConstructionFailure {
                name: name.to_string(),
                message,
            },
            Failure::Timeout(timeout) => ResidencyError::Timeout(timeout),
            Failure::NoRoom => ResidencyError::ResourceExhausted {
                required: 1,
                available: 0,
            },
        }
    }
}

type FlightResult = std::result::Result<Arc<dyn ModelHandle>, Failure>;
type Flight = Shared<BoxFuture<'static, FlightResult>>;

struct InFlight {
    id: u64,
    future: Flight,
    preload: bool,
    /// Foreground callers currently waiting. While non-zero the flight may
    /// evict and installs as a foreground construction. Only changed under
    /// the state lock, except when a waiting future is dropped.
    waiters: Arc<AtomicUsize>,
}

/// A foreground caller's stake in a flight, released when it stops waiting.
struct Waiter {
    id: u64,
    flight: Flight,
    preload: bool,
    waiters: Arc<AtomicUsize>,
    counted: bool,
}

impl Waiter {
    fn leave(&mut self) {
        if std::mem::take(&mut self.counted) {
            self.waiters.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.leave();
    }
}

struct PendingPreload {
    name: String,
    language: String,
}

struct LifecycleState {
    warm: LruTier<ModelInfo>,
    active: Option<String>,
    in_flight: HashMap<String, InFlight>,
    pending: VecDeque<PendingPreload>,
    pumping: bool,
    /// Last language each artifact was loaded with.
    languages: HashMap<String, String>,
    next_flight_id: u64,
}

impl LifecycleState {
    fn set_active(&mut self, name: &str) -> bool {
        if !self.warm.contains(name) {
            return false;
        }
        if let Some(previous) = self.active.take() {
            if let Some(entry) = self.warm.peek_mut(&previous) {
                entry.value.is_active = false;
            }
        }
        self.warm.touch(name);
        if let Some(entry) = self.warm.peek_mut(name) {
            entry.value.is_active = true;
            entry.value.last_used = Utc::now();
        }
        self.active = Some(name.to_string());
        true
    }

    fn take(&mut self, name: &str) -> Option<ModelInfo> {
        let entry = self.warm.remove(name)?;
        if self.active.as_deref() == Some(name) {
            self.active = None;
        }
        Some(entry.value)
    }
}

#[derive(Default)]
struct Counters {
    loads: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    evictions: AtomicU64,
    joined_preloads: AtomicU64,
    preloads_started: AtomicU64,
    preloads_dropped: AtomicU64,
}

struct Inner {
    settings: LifecycleSettings,
    monitor: Arc<MemoryMonitor>,
    constructor: Arc<dyn ModelConstructor>,
    components: Option<Arc<ComponentUnloadManager>>,
    state: Mutex<LifecycleState>,
    counters: Counters,
}

/// Loads, activates and evicts model handles under the memory budget.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ModelLifecycleManager {
    inner: Arc<Inner>,
}

impl ModelLifecycleManager {
    pub fn new(
        settings: LifecycleSettings,
        monitor: Arc<MemoryMonitor>,
        constructor: Arc<dyn ModelConstructor>,
    ) -> Self {
        Self::build(settings, monitor, constructor, None)
    }

    /// Like [`new`](Self::new), but unloads components of the resident
    /// object before evicting whole handles.
    pub fn with_components(
        settings: LifecycleSettings,
        monitor: Arc<MemoryMonitor>,
        constructor: Arc<dyn ModelConstructor>,
        components: Arc<ComponentUnloadManager>,
    ) -> Self {
        Self::build(settings, monitor, constructor, Some(components))
    }

    fn build(
        settings: LifecycleSettings,
        monitor: Arc<MemoryMonitor>,
        constructor: Arc<dyn ModelConstructor>,
        components: Option<Arc<ComponentUnloadManager>>,
    ) -> Self {
        let state = LifecycleState {
            warm: LruTier::new(u64::MAX, None),
            active: None,
            in_flight: HashMap::new(),
            pending: VecDeque::new(),
            pumping: false,
            languages: HashMap::new(),
            next_flight_id: 0,
        };
        Self {
            inner: Arc::new(Inner {
                settings,
                monitor,
                constructor,
                components,
                state: Mutex::new(state),
                counters: Counters::default(),
            }),
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.inner.settings
    }

    /// Make `request.name` resident and active.
    ///
    /// A warm handle is promoted to active without rebuilding (unless
    /// `force`). Otherwise memory is made available by unloading components,
    /// then evicting warm handles oldest first, then the active one, and the
    /// constructor is invoked. Joins an in-flight construction of the same
    /// artifact.
    pub async fn try_load(&self, request: LoadRequest) -> Result<()> {
        let inner = &self.inner;
        let timeout = request.timeout.unwrap_or_else(|| inner.settings.load_timeout());
        let deadline = tokio::time::Instant::now() + timeout;
        let required = request
            .memory_limit
            .unwrap_or(inner.settings.default_memory_limit_bytes);
        let name = request.name.as_str();

        let mut victims = Vec::new();
        let mut waiter = {
            let mut state = lock(&inner.state);
            if !request.force && state.set_active(name) {
                if let Some(entry) = state.warm.peek_mut(name) {
                    entry.value.language = request.language.clone();
                }
                state
                    .languages
                    .insert(name.to_string(), request.language.clone());
                inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(model = %name, "Activated warm model");
                return Ok(());
            }
            if request.force {
                victims.extend(state.take(name));
            }
            Inner::join_or_start(inner, &mut state, name, &request.language, required, timeout)
        };
        for victim in victims {
            inner.teardown(victim);
        }

        let mut rejoined = false;
        let handle = loop {
            let outcome = tokio::time::timeout_at(deadline, waiter.flight.clone()).await;
            match outcome {
                Ok(Ok(handle)) => break handle,
                Ok(Err(Failure::Exhausted { .. })) if waiter.preload && !rejoined => {
                    // The preload checked memory before this caller joined and
                    // would not evict; try again as a foreground load.
                    rejoined = true;
                    debug!(model = %name, "Joined preload found no room; loading in the foreground");
                    waiter = {
                        let mut state = lock(&inner.state);
                        Inner::join_or_start(inner, &mut state, name, &request.language, required, timeout)
                    };
                }
                Ok(Err(failure)) => return Err(failure.into_error(name)),
                Err(_) => {
                    let pending = {
                        let state = lock(&inner.state);
                        let pending = state.in_flight.get(name).map(|f| f.id) == Some(waiter.id);
                        if pending {
                            waiter.leave();
                        }
                        pending
                    };
                    if pending {
                        inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(model = %name, ?timeout, "Load timed out");
                        return Err(ResidencyError::Timeout(timeout));
                    }
                    // The flight settled as the deadline passed, and installed
                    // on this caller's behalf if it succeeded.
                    match waiter.flight.clone().await {
                        Ok(handle) => break handle,
                        Err(failure) => return Err(failure.into_error(name)),
                    }
                }
            }
        };

        let mut state = lock(&inner.state);
        let installed = state
            .warm
            .peek(name)
            .map(|entry| Arc::ptr_eq(&entry.value.handle, &handle))
            .unwrap_or(false);
        if installed && state.set_active(name) {
            Ok(())
        } else {
            Err(ResidencyError::InvalidState(format!(
                "{} was evicted before it could be activated",
                name
            )))
        }
    }

    /// Load, logging instead of failing.
    pub async fn load(&self, request: LoadRequest) -> bool {
        let name = request.name.clone();
        match self.try_load(request).await {
            Ok(()) => true,
            Err(e) => {
                warn!(model = %name, "Load failed: {}", e);
                false
            }
        }
    }

    /// Activate the configured default artifact for `language`.
    ///
    /// A no-op when that artifact is already active with the same language.
    pub async fn try_switch_to(&self, language: &str) -> Result<()> {
        let name = self
            .inner
            .settings
            .default_model_for(language)
            .ok_or_else(|| ResidencyError::Config {
                message: format!("no default model configured for language {:?}", language),
            })?
            .to_string();

        {
            let state = lock(&self.inner.state);
            let already_active = state.active.as_deref() == Some(name.as_str())
                && state
                    .warm
                    .peek(&name)
                    .map(|entry| entry.value.language == language)
                    .unwrap_or(false);
            if already_active {
                debug!(model = %name, language, "Already active");
                return Ok(());
            }
        }
        info!(model = %name, language, "Switching model");
        self.try_load(LoadRequest::new(name, language)).await
    }

    pub async fn switch_to(&self, language: &str) -> bool {
        match self.try_switch_to(language).await {
            Ok(()) => true,
            Err(e) => {
                warn!(language, "Switch failed: {}", e);
                false
            }
        }
    }

    /// The active artifact.
    pub fn current(&self) -> Option<ModelSnapshot> {
        let state = lock(&self.inner.state);
        let name = state.active.as_deref()?;
        state.warm.peek(name).map(|entry| entry.value.snapshot())
    }

    /// Handle of the active artifact.
    pub fn active_handle(&self) -> Option<Arc<dyn ModelHandle>> {
        let state = lock(&self.inner.state);
        let name = state.active.as_deref()?;
        state.warm.peek(name).map(|entry| Arc::clone(&entry.value.handle))
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        lock(&self.inner.state).warm.contains(name)
    }

    /// Warm artifacts, least recently used first.
    pub fn warm_names(&self) -> Vec<String> {
        lock(&self.inner.state).warm.keys_lru_order()
    }

    pub fn state(&self, name: &str) -> ResidencyState {
        let state = lock(&self.inner.state);
        if state.active.as_deref() == Some(name) {
            ResidencyState::Active
        } else if state.warm.contains(name) {
            ResidencyState::Warm
        } else if state.in_flight.contains_key(name) {
            ResidencyState::Loading
        } else {
            ResidencyState::Absent
        }
    }

    /// Language `name` was last loaded with, if any.
    pub fn language_of(&self, name: &str) -> Option<String> {
        lock(&self.inner.state).languages.get(name).cloned()
    }

    /// Tear down one artifact. Returns whether it was resident.
    pub fn unload(&self, name: &str) -> bool {
        let victim = lock(&self.inner.state).take(name);
        match victim {
            Some(info) => {
                self.inner.teardown(info);
                true
            }
            None => false,
        }
    }

    /// Tear down every resident handle and drop queued preloads.
    ///
    /// Constructions already in flight still finish and land in the warm set.
    pub fn cleanup(&self) {
        let (victims, dropped) = {
            let mut state = lock(&self.inner.state);
            state.active = None;
            let dropped = state.pending.len();
            state.pending.clear();
            let victims: Vec<ModelInfo> = state.warm.drain().into_iter().map(|e| e.value).collect();
            (victims, dropped)
        };
        self.inner
            .counters
            .preloads_dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
        info!(models = victims.len(), "Cleaning up resident models");
        for victim in victims {
            self.inner.teardown(victim);
        }
    }

    pub fn stats(&self) -> LifecycleStats {
        let counters = &self.inner.counters;
        let state = lock(&self.inner.state);
        LifecycleStats {
            loads: counters.loads.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            joined_preloads: counters.joined_preloads.load(Ordering::Relaxed),
            preloads_started: counters.preloads_started.load(Ordering::Relaxed),
            preloads_dropped: counters.preloads_dropped.load(Ordering::Relaxed),
            active: state.active.clone(),
            warm: state.warm.keys_lru_order(),
            warm_bytes: state.warm.current_bytes(),
        }
    }

    /// Queue a speculative load that never evicts and never activates.
    ///
    /// Returns `false` if the artifact is already resident, loading or
    /// queued, or if there is no async runtime to run it on. Uses the
    /// artifact's last language, else the configured default.
    pub fn enqueue_preload(&self, name: &str) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(model = %name, "No async runtime; skipping preload");
            return false;
        };
        let start_pump = {
            let mut state = lock(&self.inner.state);
            let queued = state.pending.iter().any(|p| p.name == name);
            if queued || state.warm.contains(name) || state.in_flight.contains_key(name) {
                return false;
            }
            let language = state
                .languages
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.inner.settings.default_language.clone());
            state.pending.push_back(PendingPreload {
                name: name.to_string(),
                language,
            });
            !std::mem::replace(&mut state.pumping, true)
        };
        if start_pump {
            let inner = Arc::clone(&self.inner);
            runtime.spawn(async move { inner.pump_preloads().await });
        }
        debug!(model = %name, "Queued preload");
        true
    }

    /// Preloads queued but not yet started.
    pub fn pending_preloads(&self) -> Vec<String> {
        lock(&self.inner.state)
            .pending
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }
}

impl Inner {
    /// Wait on the in-flight construction of `name`, or start a foreground
    /// one. Must be called with the state lock held.
    fn join_or_start(
        this: &Arc<Self>,
        state: &mut LifecycleState,
        name: &str,
        language: &str,
        required: u64,
        timeout: Duration,
    ) -> Waiter {
        if let Some(flight) = state.in_flight.get(name) {
            flight.waiters.fetch_add(1, Ordering::AcqRel);
            if flight.preload {
                this.counters.joined_preloads.fetch_add(1, Ordering::Relaxed);
                info!(model = %name, "Joining in-flight preload");
            }
            return Waiter {
                id: flight.id,
                flight: flight.future.clone(),
                preload: flight.preload,
                waiters: Arc::clone(&flight.waiters),
                counted: true,
            };
        }
        let waiters = Arc::new(AtomicUsize::new(1));
        let (id, flight) = Inner::start_flight(this, state, name, language, required, timeout, Arc::clone(&waiters));
        Waiter {
            id,
            flight,
            preload: false,
            waiters,
            counted: true,
        }
    }

    /// Register and spawn a construction flight. Must be called with the
    /// state lock held so that lookups and registration are atomic. A flight
    /// with no waiters is a preload.
    fn start_flight(
        this: &Arc<Self>,
        state: &mut LifecycleState,
        name: &str,
        language: &str,
        required: u64,
        timeout: Duration,
        waiters: Arc<AtomicUsize>,
    ) -> (u64, Flight) {
        let id = state.next_flight_id;
        state.next_flight_id += 1;
        let preload = waiters.load(Ordering::Acquire) == 0;

        let task = tokio::spawn(Arc::clone(this).fly(
            id,
            name.to_string(),
            language.to_string(),
            required,
            timeout,
            Arc::clone(&waiters),
        ));
        let future: Flight = async move {
            task.await
                .unwrap_or_else(|e| Err(Failure::Construct(format!("load task failed: {}", e))))
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            name.to_string(),
            InFlight {
                id,
                future: future.clone(),
                preload,
                waiters,
            },
        );
        (id, future)
    }

    async fn fly(
        self: Arc<Self>,
        id: u64,
        name: String,
        language: String,
        required: u64,
        timeout: Duration,
        waiters: Arc<AtomicUsize>,
    ) -> FlightResult {
        let foreground = || waiters.load(Ordering::Acquire) > 0;
        let outcome = match self.ensure_memory_available(required, &foreground) {
            Ok(()) => self.construct(&name, &language, timeout).await,
            Err(failure) => Err(failure),
        };

        let mut victims = Vec::new();
        let result = {
            let mut state = lock(&self.state);
            if state.in_flight.get(&name).map(|f| f.id) == Some(id) {
                state.in_flight.remove(&name);
            }
            match outcome {
                Ok((handle, load_time)) => {
                    self.install(&mut state, &name, &language, handle, load_time, foreground(), &mut victims)
                }
                Err(failure) => Err(failure),
            }
        };
        for victim in victims {
            self.teardown(victim);
        }
        if let Err(failure) = &result {
            debug!(model = %name, ?failure, "Load flight failed");
        }
        result
    }

    /// Make `required` bytes available: unload components of the resident
    /// object, then evict warm handles (oldest non-active first, then the
    /// active one). Only foreground loads may do either.
    fn ensure_memory_available(
        &self,
        required: u64,
        evict: &dyn Fn() -> bool,
    ) -> std::result::Result<(), Failure> {
        let mut dropped_pending = false;
        let mut shaved = false;
        loop {
            if self.monitor.has_room(required) {
                return Ok(());
            }
            let exhausted = Failure::Exhausted {
                required,
                available: self.monitor.available_under_budget(),
            };
            if !evict() {
                return Err(exhausted);
            }
            if !shaved {
                shaved = true;
                if self.unload_components(required) {
                    return Ok(());
                }
            }

            let victim = {
                let mut state = lock(&self.state);
                if !dropped_pending {
                    dropped_pending = true;
                    let dropped = state.pending.len();
                    if dropped > 0 {
                        state.pending.clear();
                        self.counters
                            .preloads_dropped
                            .fetch_add(dropped as u64, Ordering::Relaxed);
                        info!(dropped, "Dropped queued preloads under memory pressure");
                    }
                }
                match state.warm.pop_lru_where(|entry| !entry.value.is_active) {
                    Some(entry) => Some(entry.value),
                    None => match state.active.clone() {
                        Some(active) => state.take(&active),
                        None => None,
                    },
                }
            };

            match victim {
                Some(victim) => {
                    debug!(model = %victim.name, required, "Evicting to make room");
                    self.teardown(victim);
                }
                None => {
                    warn!(required, "Cannot free enough memory for load");
                    return Err(exhausted);
                }
            }
        }
    }

    /// Unload components, lowest priority first, until `required` bytes fit
    /// or no candidate can go. Returns whether there is now room.
    fn unload_components(&self, required: u64) -> bool {
        let Some(components) = &self.components else {
            return false;
        };
        let mut reclaimed = 0;
        loop {
            let mut progressed = false;
            for candidate in components.candidates(usize::MAX) {
                match components.try_unload(&candidate.name) {
                    Ok(0) => {}
                    Ok(bytes) => {
                        progressed = true;
                        reclaimed += bytes;
                        self.monitor.refresh();
                        if self.monitor.has_room(required) {
                            info!(required, reclaimed, "Unloaded components to make room");
                            return true;
                        }
                    }
                    Err(e) => debug!(component = %candidate.name, "Component unload refused: {}", e),
                }
            }
            if !progressed {
                if reclaimed > 0 {
                    debug!(required, reclaimed, "Component unloads were not enough");
                }
                return false;
            }
        }
    }

    /// Run the constructor with a timeout, retrying failures a bounded number
    /// of times. Timeouts are not retried: the constructor is signalled and
    /// may still finish, in which case its handle lands in the warm set.
    async fn construct(
        self: &Arc<Self>,
        name: &str,
        language: &str,
        timeout: Duration,
    ) -> std::result::Result<(Arc<dyn ModelHandle>, Duration), Failure> {
        let attempts = self.settings.construct_retries.saturating_add(1);
        let mut last = Failure::Construct("constructor was not invoked".to_string());

        for attempt in 1..=attempts {
            let started = Instant::now();
            let cancel = CancellationToken::new();
            let constructor = Arc::clone(&self.constructor);
            let (task_name, task_language, task_cancel) =
                (name.to_string(), language.to_string(), cancel.clone());
            let mut task = tokio::spawn(async move {
                constructor
                    .construct(&task_name, &task_language, task_cancel)
                    .await
            });

            let outcome = tokio::time::timeout(timeout, &mut task).await;
            match outcome {
                Ok(Ok(Ok(handle))) => {
                    let load_time = started.elapsed();
                    self.counters.loads.fetch_add(1, Ordering::Relaxed);
                    info!(
                        model = %name,
                        language,
                        bytes = handle.memory_footprint(),
                        elapsed_ms = load_time.as_millis() as u64,
                        "Constructed model"
                    );
                    return Ok((handle, load_time));
                }
                Ok(Ok(Err(e))) => {
                    warn!(model = %name, attempt, "Constructor failed: {:#}", e);
                    last = Failure::Construct(format!("{:#}", e));
                }
                Ok(Err(e)) => {
                    warn!(model = %name, attempt, "Constructor task failed: {}", e);
                    last = Failure::Construct(format!("constructor task failed: {}", e));
                }
                Err(_) => {
                    cancel.cancel();
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(model = %name, ?timeout, "Constructor timed out; cancellation requested");
                    self.adopt_late(name.to_string(), language.to_string(), started, task);
                    return Err(Failure::Timeout(timeout));
                }
            }
        }

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        Err(last)
    }

    /// Keep a timed-out constructor's result if it eventually arrives.
    fn adopt_late(
        self: &Arc<Self>,
        name: String,
        language: String,
        started: Instant,
        task: JoinHandle<anyhow::Result<Arc<dyn ModelHandle>>>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(Ok(handle)) = task.await else {
                return;
            };
            let mut victims = Vec::new();
            {
                let mut state = lock(&this.state);
                if state.warm.contains(&name) || state.in_flight.contains_key(&name) {
                    debug!(model = %name, "Late construction superseded");
                    victims.push(info_for(&name, &language, handle, started.elapsed()));
                } else if this
                    .install(&mut state, &name, &language, handle, started.elapsed(), false, &mut victims)
                    .is_ok()
                {
                    this.counters.loads.fetch_add(1, Ordering::Relaxed);
                    info!(model = %name, "Late construction kept warm");
                }
            }
            for victim in victims {
                this.teardown(victim);
            }
        });
    }

    /// Put a constructed handle into the warm set.
    ///
    /// Keeps the set within `max_warm` by evicting the least recently used
    /// non-active handles. A foreground install may also displace the active
    /// handle, since the new one becomes active; a background install that
    /// cannot find room is itself torn down.
    #[allow(clippy::too_many_arguments)]
    fn install(
        &self,
        state: &mut LifecycleState,
        name: &str,
        language: &str,
        handle: Arc<dyn ModelHandle>,
        load_time: Duration,
        foreground: bool,
        victims: &mut Vec<ModelInfo>,
    ) -> FlightResult {
        victims.extend(state.take(name));
        let info = info_for(name, language, Arc::clone(&handle), load_time);
        let bytes = info.memory_usage_bytes;
        state.warm.insert(name.to_string(), info, bytes);
        state.languages.insert(name.to_string(), language.to_string());

        let max_warm = self.settings.max_warm.max(1);
        while state.warm.len() > max_warm {
            let victim = match state
                .warm
                .pop_lru_where(|entry| entry.key != name && !entry.value.is_active)
            {
                Some(entry) => Some(entry.value),
                None if foreground => match state.active.clone().filter(|active| active != name) {
                    Some(active) => state.take(&active),
                    None => None,
                },
                None => None,
            };
            match victim {
                Some(victim) => victims.push(victim),
                None => {
                    victims.extend(state.take(name));
                    return Err(Failure::NoRoom);
                }
            }
        }
        Ok(handle)
    }

    fn teardown(&self, info: ModelInfo) {
        debug!(model = %info.name, bytes = info.memory_usage_bytes, "Tearing down model");
        info.handle.dispose();
        drop(info);
        self.constructor.reclaim();
        self.monitor.refresh();
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
    }

    async fn pump_preloads(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = lock(&self.state);
                match state.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        state.pumping = false;
                        return;
                    }
                }
            };
            self.run_preload(next).await;
        }
    }

    async fn run_preload(self: &Arc<Self>, preload: PendingPreload) {
        let flight = {
            let mut state = lock(&self.state);
            if state.warm.contains(&preload.name) || state.in_flight.contains_key(&preload.name) {
                return;
            }
            let (_, flight) = Inner::start_flight(
                self,
                &mut state,
                &preload.name,
                &preload.language,
                self.settings.default_memory_limit_bytes,
                self.settings.load_timeout(),
                Arc::new(AtomicUsize::new(0)),
            );
            flight
        };
        self.counters.preloads_started.fetch_add(1, Ordering::Relaxed);
        match flight.await {
            Ok(_) => debug!(model = %preload.name, "Preload finished"),
            Err(failure) => debug!(model = %preload.name, ?failure, "Preload skipped"),
        }
    }
}

fn info_for(name: &str, language: &str, handle: Arc<dyn ModelHandle>, load_time: Duration) -> ModelInfo {
    let now = Utc::now();
    ModelInfo {
        name: name.to_string(),
        language: language.to_string(),
        memory_usage_bytes: handle.memory_footprint(),
        load_time,
        loaded_at: now,
        last_used: now,
        is_active: false,
        handle,
    }
}

impl std::fmt::Debug for ModelLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("ModelLifecycleManager")
            .field("active", &state.active)
            .field("warm", &state.warm.keys_lru_order())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorSettings;
    use crate::lifecycle::Disposable;
    use crate::components::{ComponentHost, ComponentKind, ComponentSpec};
    use crate::config::ComponentSettings;
    use crate::monitor::{MemoryProbe, SharedProbe};
    use std::sync::atomic::{AtomicBool, AtomicU32};

    struct FakeHandle {
        name: String,
        bytes: u64,
        probe: SharedProbe,
        disposed: Arc<Mutex<Vec<String>>>,
        released: AtomicBool,
    }

    impl Disposable for FakeHandle {
        fn dispose(&self) {
            if !self.released.swap(true, Ordering::SeqCst) {
                self.probe.sub_process_bytes(self.bytes);
                self.disposed.lock().unwrap().push(self.name.clone());
            }
        }
    }

    impl ModelHandle for FakeHandle {
        fn memory_footprint(&self) -> u64 {
            self.bytes
        }
    }

    struct FakeConstructor {
        probe: SharedProbe,
        sizes: HashMap<String, u64>,
        delay: Option<Duration>,
        delays: HashMap<String, Duration>,
        failures_left: AtomicU32,
        calls: Mutex<Vec<String>>,
        disposed: Arc<Mutex<Vec<String>>>,
        tokens: Mutex<Vec<CancellationToken>>,
    }

    impl FakeConstructor {
        fn new(probe: SharedProbe) -> Self {
            Self {
                probe,
                sizes: HashMap::new(),
                delay: None,
                delays: HashMap::new(),
                failures_left: AtomicU32::new(0),
                calls: Mutex::new(Vec::new()),
                disposed: Arc::new(Mutex::new(Vec::new())),
                tokens: Mutex::new(Vec::new()),
            }
        }

        fn size(mut self, name: &str, bytes: u64) -> Self {
            self.sizes.insert(name.to_string(), bytes);
            self
        }

        fn delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn delay_for(mut self, name: &str, delay: Duration) -> Self {
            self.delays.insert(name.to_string(), delay);
            self
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn disposed(&self) -> Vec<String> {
            self.disposed.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ModelConstructor for FakeConstructor {
        async fn construct(
            &self,
            name: &str,
            _language: &str,
            cancel: CancellationToken,
        ) -> anyhow::Result<Arc<dyn ModelHandle>> {
            self.calls.lock().unwrap().push(name.to_string());
            self.tokens.lock().unwrap().push(cancel);
            if let Some(delay) = self.delays.get(name).copied().or(self.delay) {
                tokio::time::sleep(delay).await;
            }
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                anyhow::bail!("weights for {} are unreadable", name);
            }
            let bytes = self.sizes.get(name).copied().unwrap_or(100);
            self.probe.add_process_bytes(bytes);
            Ok(Arc::new(FakeHandle {
                name: name.to_string(),
                bytes,
                probe: self.probe.clone(),
                disposed: Arc::clone(&self.disposed),
                released: AtomicBool::new(false),
            }))
        }
    }

    fn lifecycle(settings: LifecycleSettings, constructor: Arc<FakeConstructor>, probe: SharedProbe) -> ModelLifecycleManager {
        let monitor = Arc::new(MemoryMonitor::new(
            probe,
            &MonitorSettings {
                memory_budget_bytes: 1000,
                sample_ttl_ms: 0,
            },
        ));
        ModelLifecycleManager::new(settings, monitor, constructor)
    }

    fn settings(max_warm: usize) -> LifecycleSettings {
        LifecycleSettings {
            max_warm,
            default_memory_limit_bytes: 100,
            load_timeout_secs: 30,
            ..LifecycleSettings::default()
        }
    }

    #[tokio::test]
    async fn test_single_active_handle() {
        let probe = SharedProbe::new(0, 0, 10_000);
        let constructor = Arc::new(FakeConstructor::new(probe.clone()));
        let manager = lifecycle(settings(3), Arc::clone(&constructor), probe);

        assert!(manager.load(LoadRequest::new("a", "en")).await);
        assert!(manager.load(LoadRequest::new("b", "en")).await);

        assert_eq!(manager.state("a"), ResidencyState::Warm);
        assert_eq!(manager.state("b"), ResidencyState::Active);
        assert_eq!(manager.current().unwrap().name, "b");
        assert_eq!(manager.current().unwrap().memory_usage_bytes, 100);

        // A warm hit activates without constructing again.
        assert!(manager.load(LoadRequest::new("a", "en")).await);
        assert_eq!(manager.state("a"), ResidencyState::Active);
        assert_eq!(manager.state("b"), ResidencyState::Warm);
        assert_eq!(constructor.calls(), 2);
        let stats = manager.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.active.as_deref(), Some("a"));
        assert_eq!(stats.warm, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_evicts_warm_before_active() {
        let probe = SharedProbe::new(0, 0, 10_000);
        let constructor = Arc::new(
            FakeConstructor::new(probe.clone())
                .size("a", 400)
                .size("b", 400)
                .size("c", 400)
                .size("d", 700),
        );
        let manager = lifecycle(settings(3), Arc::clone(&constructor), probe.clone());

        for name in ["a", "b", "c"] {
            manager
                .try_load(LoadRequest::new(name, "en").with_memory_limit(400))
                .await
                .unwrap();
        }
        assert_eq!(constructor.disposed(), vec!["a"]);
        assert_eq!(manager.warm_names(), vec!["b", "c"]);

        manager
            .try_load(LoadRequest::new("d", "en").with_memory_limit(700))
            .await
            .unwrap();
        assert_eq!(constructor.disposed(), vec!["a", "b", "c"]);
        assert_eq!(manager.warm_names(), vec!["d"]);
        assert_eq!(manager.stats().evictions, 3);
        assert!(probe.sample().unwrap().process_bytes <= 1000);
    }

    #[tokio::test]
    async fn test_exhausted_when_nothing_to_evict() {
        let probe = SharedProbe::new(900, 0, 10_000);
        let constructor = Arc::new(FakeConstructor::new(probe.clone()));
        let manager = lifecycle(settings(2), Arc::clone(&constructor), probe);

        let result = manager
            .try_load(LoadRequest::new("a", "en").with_memory_limit(500))
            .await;
        assert!(matches!(
            result,
            Err(ResidencyError::ResourceExhausted { required: 500, available: 100 })
        ));
        assert_eq!(constructor.calls(), 0);
    }

    #[tokio::test]
    async fn test_constructor_failure_retried_once_and_not_cached() {
        let probe = SharedProbe::new(0, 0, 10_000);
        let constructor = Arc::new(FakeConstructor::new(probe.clone()));
        let manager = lifecycle(settings(2), Arc::clone(&constructor), probe);

        constructor.failures_left.store(1, Ordering::SeqCst);
        assert!(manager.load(LoadRequest::new("a", "en")).await);
        assert_eq!(constructor.calls(), 2);

        constructor.failures_left.store(2, Ordering::SeqCst);
        let result = manager.try_load(LoadRequest::new("b", "en")).await;
        assert!(matches!(result, Err(ResidencyError::ConstructionFailure { ref name, .. }) if name == "b"));
        assert_eq!(manager.state("b"), ResidencyState::Absent);
        assert_eq!(manager.stats().failures, 1);

        // The failure is not remembered.
        assert!(manager.load(LoadRequest::new("b", "en")).await);
        assert_eq!(constructor.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_and_keeps_late_result() {
        let probe = SharedProbe::new(0, 0, 10_000);
        let constructor = Arc::new(FakeConstructor::new(probe.clone()).delay(Duration::from_secs(10)));
        let manager = lifecycle(settings(2), Arc::clone(&constructor), probe);

        let result = manager
            .try_load(LoadRequest::new("slow", "en").with_timeout(Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(ResidencyError::Timeout(_))));
        assert!(manager.current().is_none());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(constructor.tokens.lock().unwrap()[0].is_cancelled());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(manager.state("slow"), ResidencyState::Warm);
        assert!(manager.stats().timeouts >= 1);
    }

    #[tokio::test]
    async fn test_switch_to_is_noop_when_already_active() {
        let probe = SharedProbe::new(0, 0, 10_000);
        let constructor = Arc::new(FakeConstructor::new(probe.clone()));
        let manager = lifecycle(settings(2), Arc::clone(&constructor), probe);

        assert!(manager.switch_to("en").await);
        assert!(manager.switch_to("en").await);
        assert_eq!(constructor.calls(), 1);
        assert_eq!(manager.stats().cache_hits, 0);
        assert_eq!(manager.current().unwrap().name, "mistral-7b-instruct");

        assert!(manager.switch_to("zh").await);
        assert_eq!(manager.current().unwrap().language, "zh");
        assert!(!manager.switch_to("tlh").await);
        assert_eq!(manager.current().unwrap().name, "qwen2.5-7b-instruct");
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_load_joins_inflight_preload() {
        let probe = SharedProbe::new(0, 0, 10_000);
        let constructor = Arc::new(FakeConstructor::new(probe.clone()).delay(Duration::from_millis(100)));
        let manager = lifecycle(settings(2), Arc::clone(&constructor), probe);

        assert!(manager.enqueue_preload("a"));
        assert!(!manager.enqueue_preload("a"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.state("a"), ResidencyState::Loading);

        manager.try_load(LoadRequest::new("a", "en")).await.unwrap();
        assert_eq!(constructor.calls(), 1);
        assert_eq!(manager.state("a"), ResidencyState::Active);
        let stats = manager.stats();
        assert_eq!(stats.joined_preloads, 1);
        assert_eq!(stats.preloads_started, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preload_lands_warm_without_evicting() {
        let probe = SharedProbe::new(0, 0, 10_000);
        let constructor = Arc::new(FakeConstructor::new(probe.clone()).size("big", 950));
        let manager = lifecycle(settings(2), Arc::clone(&constructor), probe);

        manager
            .try_load(LoadRequest::new("big", "en").with_memory_limit(950))
            .await
            .unwrap();
        assert!(manager.enqueue_preload("next"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Not enough room and preloads never evict.
        assert_eq!(manager.state("next"), ResidencyState::Absent);
        assert_eq!(manager.state("big"), ResidencyState::Active);
        assert!(constructor.disposed().is_empty());

        manager.unload("big");
        assert!(manager.enqueue_preload("next"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state("next"), ResidencyState::Warm);
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn test_max_warm_tears_down_oldest() {
        let probe = SharedProbe::new(0, 0, 10_000);
        let constructor = Arc::new(FakeConstructor::new(probe.clone()));
        let manager = lifecycle(settings(2), Arc::clone(&constructor), probe.clone());

        for name in ["a", "b", "c"] {
            assert!(manager.load(LoadRequest::new(name, "en")).await);
        }
        assert_eq!(manager.warm_names(), vec!["b", "c"]);
        assert_eq!(constructor.disposed(), vec!["a"]);
        assert_eq!(probe.sample().unwrap().process_bytes, 200);

        manager.cleanup();
        assert!(manager.warm_names().is_empty());
        assert!(manager.current().is_none());
        assert_eq!(probe.sample().unwrap().process_bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_preloads_dropped_under_pressure() {
        let probe = SharedProbe::new(500, 0, 10_000);
        let constructor = Arc::new(
            FakeConstructor::new(probe.clone())
                .size("w", 300)
                .size("big", 400),
        );
        let manager = lifecycle(settings(3), Arc::clone(&constructor), probe);

        manager
            .try_load(LoadRequest::new("w", "en").with_memory_limit(300))
            .await
            .unwrap();
        assert!(manager.enqueue_preload("p1"));
        assert!(manager.enqueue_preload("p2"));
        assert!(manager.enqueue_preload("p3"));

        manager
            .try_load(LoadRequest::new("big", "en").with_memory_limit(400))
            .await
            .unwrap();
        assert!(manager.pending_preloads().is_empty());
        let stats = manager.stats();
        // At most the head of the queue was already running.
        assert!(stats.preloads_dropped >= 2);
        assert_eq!(stats.active.as_deref(), Some("big"));
        assert!(constructor.disposed().contains(&"w".to_string()));
    }

    /// Gives a component's bytes back to the probe when it is released.
    struct ReleasingHost {
        probe: SharedProbe,
        sizes: HashMap<String, u64>,
    }

    impl ComponentHost for ReleasingHost {
        fn snapshot(&self, _name: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn restore(&self, name: &str, _checkpoint: Option<&[u8]>) -> Result<()> {
            self.probe.add_process_bytes(self.sizes[name]);
            Ok(())
        }

        fn release(&self, name: &str) {
            self.probe.sub_process_bytes(self.sizes[name]);
        }
    }

    #[tokio::test]
    async fn test_components_unloaded_before_evicting_active() {
        let probe = SharedProbe::new(0, 0, 10_000);
        let constructor = Arc::new(FakeConstructor::new(probe.clone()).size("a", 600).size("b", 500));
        let monitor = Arc::new(MemoryMonitor::new(
            probe.clone(),
            &MonitorSettings {
                memory_budget_bytes: 1000,
                sample_ttl_ms: 0,
            },
        ));
        let host = Arc::new(ReleasingHost {
            probe: probe.clone(),
            sizes: HashMap::from([("a.attn".to_string(), 200), ("a.ffn".to_string(), 200)]),
        });
        let components = Arc::new(
            ComponentUnloadManager::new(ComponentSettings::default(), Arc::clone(&monitor)).with_host(host),
        );
        let manager = ModelLifecycleManager::with_components(
            settings(2),
            monitor,
            Arc::clone(&constructor) as Arc<dyn ModelConstructor>,
            Arc::clone(&components),
        );

        manager
            .try_load(LoadRequest::new("a", "en").with_memory_limit(600))
            .await
            .unwrap();
        components
            .register(ComponentSpec::new("a.attn", ComponentKind::Attention, 200))
            .unwrap();
        components
            .register(ComponentSpec::new("a.ffn", ComponentKind::FeedForward, 200).depends_on("a.attn"))
            .unwrap();

        manager
            .try_load(LoadRequest::new("b", "en").with_memory_limit(500))
            .await
            .unwrap();

        // Shedding one component was enough; no handle was torn down.
        assert!(constructor.disposed().is_empty());
        assert_eq!(manager.state("a"), ResidencyState::Warm);
        assert_eq!(manager.state("b"), ResidencyState::Active);
        assert!(!components.status("a.ffn").unwrap().is_loaded);
        assert!(components.status("a.attn").unwrap().is_loaded);
        assert_eq!(manager.stats().evictions, 0);
        assert_eq!(probe.sample().unwrap().process_bytes, 900);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_join_keeps_active_handle() {
        let probe = SharedProbe::new(0, 0, 10_000);
        let constructor =
            Arc::new(FakeConstructor::new(probe.clone()).delay_for("b", Duration::from_secs(5)));
        let manager = lifecycle(settings(1), Arc::clone(&constructor), probe);

        manager.try_load(LoadRequest::new("a", "en")).await.unwrap();
        assert!(manager.enqueue_preload("b"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.state("b"), ResidencyState::Loading);

        let result = manager
            .try_load(LoadRequest::new("b", "en").with_timeout(Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(ResidencyError::Timeout(_))));
        assert_eq!(manager.stats().joined_preloads, 1);

        // The preload lands with nobody waiting, so it may not displace "a".
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(manager.current().unwrap().name, "a");
        assert_eq!(manager.state("b"), ResidencyState::Absent);
        assert_eq!(constructor.disposed(), vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_load_evicts_where_preload_would_not() {
        let probe = SharedProbe::new(0, 0, 10_000);
        let constructor = Arc::new(FakeConstructor::new(probe.clone()).size("big", 950));
        let manager = lifecycle(settings(2), Arc::clone(&constructor), probe);
        manager
            .try_load(LoadRequest::new("big", "en").with_memory_limit(950))
            .await
            .unwrap();

        assert!(manager.enqueue_preload("next"));
        for _ in 0..10 {
            if manager.state("next") == ResidencyState::Loading {
                break;
            }
            tokio::task::yield_now().await;
        }

        // Whether it joins the preload or starts its own flight, the
        // foreground request is allowed to evict.
        manager.try_load(LoadRequest::new("next", "en")).await.unwrap();
        assert_eq!(manager.current().unwrap().name, "next");
        assert_eq!(constructor.disposed(), vec!["big"]);
    }

    #[test]
    fn test_enqueue_without_runtime_is_refused() {
        let probe = SharedProbe::new(0, 0, 10_000);
        let constructor = Arc::new(FakeConstructor::new(probe.clone()));
        let manager = lifecycle(settings(2), constructor, probe);
        assert!(!manager.enqueue_preload("a"));
    }
}
