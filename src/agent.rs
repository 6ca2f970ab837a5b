use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser::{Browser, BrowserConfig, Element};

// ========================= Core Types =========================

/// One UI instruction decoded from model output. Anything that does not
/// decode into exactly one of these shapes is a parse failure, never a
/// default action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Action {
    Click { selector: String },
    Type { selector: String, text: String },
    Navigate { url: String },
    Complete,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::Type { .. } => "type",
            Action::Navigate { .. } => "navigate",
            Action::Complete => "complete",
        }
    }
}

/// A point-in-time capture of the browser view, already transport-encoded.
/// Produced fresh every iteration and never cached across iterations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub image_base64: String,
}

impl Snapshot {
    pub fn from_png(png: &[u8]) -> Self {
        Self { id: nanoid!(), image_base64: B64.encode(png) }
    }
}

#[derive(Debug, Error, Clone)]
pub enum PilotError {
    #[error("screenshot capture failed: {0}")]
    Capture(String),
    #[error("inference endpoint transport failed: {0}")]
    Transport(String),
    #[error("model output is not a valid action: {0}")]
    Parse(String),
    #[error("timed out after {waited_ms}ms waiting for `{selector}`")]
    ActuationTimeout { selector: String, waited_ms: u64 },
    #[error("browser session failed: {0}")]
    Session(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// The model issued a `complete` action.
    Completed,
    /// The caller's cancellation token fired; not a failure.
    Cancelled,
    /// The safety bound on iterations was reached before completion.
    StepsExhausted,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub task: String,
    pub status: RunStatus,
    pub iterations: usize,
}

// ========================= Pluggable Subsystems =========================

/// The browser automation capability set the loop consumes. `start` must be
/// called once before any other operation; `stop` releases the underlying
/// browser. Element waits are bounded and report expiry as
/// [`PilotError::ActuationTimeout`].
#[async_trait]
pub trait Surface: Send + Sync {
    type Element: Send + Sync;

    async fn start(&mut self) -> Result<(), PilotError>;
    async fn stop(&mut self) -> Result<(), PilotError>;
    async fn capture(&self) -> Result<Vec<u8>, PilotError>;
    async fn wait_until_clickable(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Self::Element, PilotError>;
    async fn wait_until_present(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Self::Element, PilotError>;
    async fn click(&self, element: &Self::Element) -> Result<(), PilotError>;
    async fn send_text(&self, element: &Self::Element, text: &str) -> Result<(), PilotError>;
    async fn submit(&self, element: &Self::Element) -> Result<(), PilotError>;
    async fn navigate(&self, url: &str) -> Result<(), PilotError>;
}

/// Turns the task plus the current snapshot into the next [`Action`].
/// A [`PilotError::Parse`] is recoverable; everything else ends the run.
#[async_trait]
pub trait Decider: Send + Sync {
    async fn decide(&self, task: &str, snapshot: &Snapshot) -> Result<Action, PilotError>;
}

// ========================= Session Lifecycle =========================

/// Exclusive owner of one live surface for the duration of one run.
pub struct Session<S: Surface> {
    surface: S,
    iterations: usize,
}

impl<S: Surface> Session<S> {
    pub async fn open(mut surface: S) -> Result<Self, PilotError> {
        surface.start().await?;
        Ok(Self { surface, iterations: 0 })
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    fn begin_iteration(&mut self) -> usize {
        self.iterations += 1;
        self.iterations
    }

    /// Best-effort teardown; failures are logged, not re-raised.
    pub async fn close(mut self) {
        if let Err(e) = self.surface.stop().await {
            warn!(error = %e, "browser teardown failed");
        }
    }
}

// ========================= Pilot Core =========================

#[derive(Clone)]
pub struct PilotConfig {
    /// Hard cap on iterations per run.
    pub max_steps: usize,
    /// Fixed pause between iterations. A throttle, not a backoff.
    pub step_delay: Duration,
    /// Bound on element waits during actuation.
    pub action_timeout: Duration,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            max_steps: 40,
            step_delay: Duration::from_secs(1),
            action_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Pilot<D: Decider> {
    decider: D,
    cfg: PilotConfig,
}

impl<D: Decider> Pilot<D> {
    pub fn new(decider: D, cfg: PilotConfig) -> Self {
        Self { decider, cfg }
    }

    /// Run with a fresh token; the task can only end by completion, error,
    /// or the step budget.
    pub async fn run<S: Surface>(&self, task: &str, surface: S) -> Result<RunReport, PilotError> {
        self.run_with_cancel(task, surface, CancellationToken::new()).await
    }

    /// Drive `task` against `surface` until the model reports completion,
    /// a fatal error occurs, `cancel` fires, or the step budget runs out.
    /// Teardown runs exactly once on every exit path; fatal errors are
    /// re-raised only after it.
    pub async fn run_with_cancel<S: Surface>(
        &self,
        task: &str,
        surface: S,
        cancel: CancellationToken,
    ) -> Result<RunReport, PilotError> {
        let run_id = nanoid!();
        info!(%run_id, task, "starting run");

        let mut session = Session::open(surface).await?;
        let outcome = self.drive(task, &mut session, &cancel).await;
        let iterations = session.iterations();
        session.close().await;

        let status = outcome?;
        info!(%run_id, ?status, iterations, "run finished");
        Ok(RunReport { run_id, task: task.to_string(), status, iterations })
    }

    async fn drive<S: Surface>(
        &self,
        task: &str,
        session: &mut Session<S>,
        cancel: &CancellationToken,
    ) -> Result<RunStatus, PilotError> {
        loop {
            if cancel.is_cancelled() {
                info!(iterations = session.iterations(), "run cancelled");
                return Ok(RunStatus::Cancelled);
            }
            if session.iterations() >= self.cfg.max_steps {
                warn!(max_steps = self.cfg.max_steps, "step budget exhausted");
                return Ok(RunStatus::StepsExhausted);
            }
            let iteration = session.begin_iteration();

            let png = session.surface().capture().await?;
            let snapshot = Snapshot::from_png(&png);

            let action = match self.decider.decide(task, &snapshot).await {
                Ok(action) => action,
                Err(PilotError::Parse(reason)) => {
                    warn!(iteration, %reason, "skipping cycle on unparseable decision");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Action::Complete = action {
                info!(iteration, "model reported the task complete");
                return Ok(RunStatus::Completed);
            }

            actuate(&action, session, self.cfg.action_timeout).await?;
            info!(iteration, action = action.kind(), "action applied");

            sleep(self.cfg.step_delay).await;
        }
    }
}

/// Map one action to one surface operation. The decision was made against a
/// stale snapshot, so element targets get a bounded wait to appear.
async fn actuate<S: Surface>(
    action: &Action,
    session: &Session<S>,
    timeout: Duration,
) -> Result<(), PilotError> {
    let surface = session.surface();
    match action {
        Action::Click { selector } => {
            let element = surface.wait_until_clickable(selector, timeout).await?;
            surface.click(&element).await
        }
        Action::Type { selector, text } => {
            let element = surface.wait_until_present(selector, timeout).await?;
            surface.send_text(&element, text).await?;
            surface.submit(&element).await
        }
        Action::Navigate { url } => surface.navigate(url).await,
        Action::Complete => Ok(()),
    }
}

// ========================= Chromium Adapter =========================

pub struct Chromium {
    cfg: BrowserConfig,
    live: Option<Browser>,
}

impl Chromium {
    pub fn new(cfg: BrowserConfig) -> Self {
        Self { cfg, live: None }
    }

    fn browser(&self) -> Result<&Browser, PilotError> {
        self.live
            .as_ref()
            .ok_or_else(|| PilotError::Session("browser not started".into()))
    }
}

#[async_trait]
impl Surface for Chromium {
    type Element = Element;

    async fn start(&mut self) -> Result<(), PilotError> {
        let browser = Browser::launch(self.cfg.clone())
            .await
            .map_err(|e| PilotError::Session(e.to_string()))?;
        self.live = Some(browser);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PilotError> {
        match self.live.take() {
            Some(browser) => browser
                .close()
                .await
                .map_err(|e| PilotError::Session(e.to_string())),
            None => Ok(()),
        }
    }

    async fn capture(&self) -> Result<Vec<u8>, PilotError> {
        self.browser()?
            .screenshot_png()
            .await
            .map_err(|e| PilotError::Capture(e.to_string()))
    }

    async fn wait_until_clickable(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Element, PilotError> {
        match self.browser()?.wait_for_clickable(selector, timeout).await {
            Ok(Some(element)) => Ok(element),
            Ok(None) => Err(PilotError::ActuationTimeout {
                selector: selector.to_string(),
                waited_ms: timeout.as_millis() as u64,
            }),
            Err(e) => Err(PilotError::Session(e.to_string())),
        }
    }

    async fn wait_until_present(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Element, PilotError> {
        match self.browser()?.wait_for_present(selector, timeout).await {
            Ok(Some(element)) => Ok(element),
            Ok(None) => Err(PilotError::ActuationTimeout {
                selector: selector.to_string(),
                waited_ms: timeout.as_millis() as u64,
            }),
            Err(e) => Err(PilotError::Session(e.to_string())),
        }
    }

    async fn click(&self, element: &Element) -> Result<(), PilotError> {
        self.browser()?
            .click(element)
            .await
            .map_err(|e| PilotError::Session(e.to_string()))
    }

    async fn send_text(&self, element: &Element, text: &str) -> Result<(), PilotError> {
        self.browser()?
            .type_into(element, text)
            .await
            .map_err(|e| PilotError::Session(e.to_string()))
    }

    async fn submit(&self, element: &Element) -> Result<(), PilotError> {
        self.browser()?
            .press_enter(element)
            .await
            .map_err(|e| PilotError::Session(e.to_string()))
    }

    async fn navigate(&self, url: &str) -> Result<(), PilotError> {
        self.browser()?
            .goto(url)
            .await
            .map_err(|e| PilotError::Session(e.to_string()))
    }
}

// ========================= Tests =========================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct SurfaceCalls {
        starts: AtomicUsize,
        stops: AtomicUsize,
        captures: AtomicUsize,
        clicks: AtomicUsize,
        submits: AtomicUsize,
        typed: Mutex<Vec<(String, String)>>,
        navigations: Mutex<Vec<String>>,
    }

    struct FakeSurface {
        calls: Arc<SurfaceCalls>,
        fail_start: bool,
        fail_capture: bool,
        time_out_waits: bool,
    }

    impl FakeSurface {
        fn new(calls: &Arc<SurfaceCalls>) -> Self {
            Self {
                calls: Arc::clone(calls),
                fail_start: false,
                fail_capture: false,
                time_out_waits: false,
            }
        }
    }

    #[async_trait]
    impl Surface for FakeSurface {
        type Element = String;

        async fn start(&mut self) -> Result<(), PilotError> {
            self.calls.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(PilotError::Session("chrome refused to launch".into()));
            }
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), PilotError> {
            self.calls.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn capture(&self) -> Result<Vec<u8>, PilotError> {
            self.calls.captures.fetch_add(1, Ordering::SeqCst);
            if self.fail_capture {
                return Err(PilotError::Capture("no frame".into()));
            }
            Ok(vec![0u8; 8])
        }

        async fn wait_until_clickable(
            &self,
            selector: &str,
            timeout: Duration,
        ) -> Result<String, PilotError> {
            if self.time_out_waits {
                return Err(PilotError::ActuationTimeout {
                    selector: selector.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            Ok(selector.to_string())
        }

        async fn wait_until_present(
            &self,
            selector: &str,
            timeout: Duration,
        ) -> Result<String, PilotError> {
            self.wait_until_clickable(selector, timeout).await
        }

        async fn click(&self, _element: &String) -> Result<(), PilotError> {
            self.calls.clicks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_text(&self, element: &String, text: &str) -> Result<(), PilotError> {
            self.calls
                .typed
                .lock()
                .unwrap()
                .push((element.clone(), text.to_string()));
            Ok(())
        }

        async fn submit(&self, _element: &String) -> Result<(), PilotError> {
            self.calls.submits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn navigate(&self, url: &str) -> Result<(), PilotError> {
            self.calls.navigations.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    struct ScriptedDecider(Mutex<VecDeque<Result<Action, PilotError>>>);

    impl ScriptedDecider {
        fn new(script: Vec<Result<Action, PilotError>>) -> Self {
            Self(Mutex::new(script.into_iter().collect()))
        }
    }

    #[async_trait]
    impl Decider for ScriptedDecider {
        async fn decide(&self, _task: &str, _snapshot: &Snapshot) -> Result<Action, PilotError> {
            self.0.lock().unwrap().pop_front().expect("decider script exhausted")
        }
    }

    /// Emits unparseable output every cycle and fires the token after
    /// `after` decisions.
    struct CancellingDecider {
        cancel: CancellationToken,
        after: usize,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl Decider for CancellingDecider {
        async fn decide(&self, _task: &str, _snapshot: &Snapshot) -> Result<Action, PilotError> {
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
                self.cancel.cancel();
            }
            Err(PilotError::Parse("not json".into()))
        }
    }

    fn pilot<D: Decider>(decider: D) -> Pilot<D> {
        Pilot::new(
            decider,
            PilotConfig {
                max_steps: 8,
                step_delay: Duration::ZERO,
                action_timeout: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn navigate_then_complete_touches_browser_once() {
        let calls = Arc::new(SurfaceCalls::default());
        let decider = ScriptedDecider::new(vec![
            Ok(Action::Navigate { url: "http://example.com".into() }),
            Ok(Action::Complete),
        ]);

        let report = pilot(decider)
            .run("go to example.com", FakeSurface::new(&calls))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.iterations, 2);
        assert_eq!(calls.captures.load(Ordering::SeqCst), 2);
        assert_eq!(
            *calls.navigations.lock().unwrap(),
            vec!["http://example.com".to_string()]
        );
        assert_eq!(calls.clicks.load(Ordering::SeqCst), 0);
        assert_eq!(calls.submits.load(Ordering::SeqCst), 0);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn click_and_type_reach_the_surface() {
        let calls = Arc::new(SurfaceCalls::default());
        let decider = ScriptedDecider::new(vec![
            Ok(Action::Click { selector: "#go".into() }),
            Ok(Action::Type { selector: "input[name=q]".into(), text: "weather".into() }),
            Ok(Action::Complete),
        ]);

        let report = pilot(decider)
            .run("search the weather", FakeSurface::new(&calls))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(calls.clicks.load(Ordering::SeqCst), 1);
        assert_eq!(
            *calls.typed.lock().unwrap(),
            vec![("input[name=q]".to_string(), "weather".to_string())]
        );
        assert_eq!(calls.submits.load(Ordering::SeqCst), 1);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parse_failures_skip_actuation_and_continue() {
        let calls = Arc::new(SurfaceCalls::default());
        let decider = ScriptedDecider::new(vec![
            Err(PilotError::Parse("not json".into())),
            Err(PilotError::Parse("unknown tag".into())),
            Ok(Action::Complete),
        ]);

        let report = pilot(decider)
            .run("task", FakeSurface::new(&calls))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.iterations, 3);
        assert_eq!(calls.captures.load(Ordering::SeqCst), 3);
        assert_eq!(calls.clicks.load(Ordering::SeqCst), 0);
        assert!(calls.navigations.lock().unwrap().is_empty());
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_failure_propagates_after_teardown() {
        let calls = Arc::new(SurfaceCalls::default());
        let decider =
            ScriptedDecider::new(vec![Err(PilotError::Transport("connection refused".into()))]);

        let err = pilot(decider)
            .run("task", FakeSurface::new(&calls))
            .await
            .unwrap_err();

        assert!(matches!(err, PilotError::Transport(_)));
        assert_eq!(calls.captures.load(Ordering::SeqCst), 1);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn capture_failure_is_fatal() {
        let calls = Arc::new(SurfaceCalls::default());
        let mut surface = FakeSurface::new(&calls);
        surface.fail_capture = true;
        // An exhausted script would panic; the decider must never run.
        let decider = ScriptedDecider::new(vec![]);

        let err = pilot(decider).run("task", surface).await.unwrap_err();

        assert!(matches!(err, PilotError::Capture(_)));
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn actuation_timeout_is_fatal() {
        let calls = Arc::new(SurfaceCalls::default());
        let mut surface = FakeSurface::new(&calls);
        surface.time_out_waits = true;
        let decider =
            ScriptedDecider::new(vec![Ok(Action::Click { selector: "#missing".into() })]);

        let err = pilot(decider).run("task", surface).await.unwrap_err();

        match err {
            PilotError::ActuationTimeout { selector, .. } => assert_eq!(selector, "#missing"),
            other => panic!("expected actuation timeout, got {other:?}"),
        }
        assert_eq!(calls.clicks.load(Ordering::SeqCst), 0);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_ends_the_run_without_error() {
        let calls = Arc::new(SurfaceCalls::default());
        let cancel = CancellationToken::new();
        let decider = CancellingDecider {
            cancel: cancel.clone(),
            after: 2,
            seen: AtomicUsize::new(0),
        };

        let report = pilot(decider)
            .run_with_cancel("task", FakeSurface::new(&calls), cancel)
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.iterations, 2);
        assert_eq!(calls.clicks.load(Ordering::SeqCst), 0);
        assert!(calls.navigations.lock().unwrap().is_empty());
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn precancelled_token_stops_before_any_capture() {
        let calls = Arc::new(SurfaceCalls::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let decider = ScriptedDecider::new(vec![]);

        let report = pilot(decider)
            .run_with_cancel("task", FakeSurface::new(&calls), cancel)
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.iterations, 0);
        assert_eq!(calls.captures.load(Ordering::SeqCst), 0);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn step_budget_bounds_the_loop() {
        let calls = Arc::new(SurfaceCalls::default());
        let script = (0..8)
            .map(|_| Ok(Action::Navigate { url: "http://example.com".into() }))
            .collect();
        let decider = ScriptedDecider::new(script);

        let report = pilot(decider)
            .run("task", FakeSurface::new(&calls))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::StepsExhausted);
        assert_eq!(report.iterations, 8);
        assert_eq!(calls.navigations.lock().unwrap().len(), 8);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_open_runs_no_iterations_and_no_teardown() {
        let calls = Arc::new(SurfaceCalls::default());
        let mut surface = FakeSurface::new(&calls);
        surface.fail_start = true;
        let decider = ScriptedDecider::new(vec![]);

        let err = pilot(decider).run("task", surface).await.unwrap_err();

        assert!(matches!(err, PilotError::Session(_)));
        assert_eq!(calls.captures.load(Ordering::SeqCst), 0);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 0);
    }
}
