//! Lifecycle hooks.
//!
//! Each phase holds an ordered list of [`Hook`]s. Hooks run one at a time and
//! each is awaited before the next starts; the first failing hook stops the
//! phase.

use std::fmt;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};

use crate::context::FetchContext;
use crate::error::Cause;
use crate::BoxError;

pub type HookResult = Result<(), BoxError>;

type HookFn = dyn for<'a> Fn(&'a mut FetchContext) -> BoxFuture<'a, HookResult> + Send + Sync;

/// Position of a hook within its phase. Sorting is stable, so hooks with
/// equal order keep their registration order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookOrder {
    Pre,
    #[default]
    Normal,
    Post,
}

/// Lifecycle phase a hook is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Request,
    RequestError,
    Response,
    ResponseError,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Request => "on_request",
            Self::RequestError => "on_request_error",
            Self::Response => "on_response",
            Self::ResponseError => "on_response_error",
        })
    }
}

/// Async callback receiving the mutable per-attempt context.
#[derive(Clone)]
pub struct Hook {
    order: HookOrder,
    run: Arc<HookFn>,
}

impl Hook {
    /// ```ignore
    /// Hook::new(|ctx| Box::pin(async move {
    ///     ctx.options.headers.insert("x-trace", "1".parse()?);
    ///     Ok::<_, BoxError>(())
    /// }))
    /// ```
    pub fn new<F>(run: F) -> Self
    where
        F: for<'a> Fn(&'a mut FetchContext) -> BoxFuture<'a, HookResult> + Send + Sync + 'static,
    {
        Self {
            order: HookOrder::Normal,
            run: Arc::new(run),
        }
    }

    /// Wraps a synchronous callback.
    pub fn sync<F>(run: F) -> Self
    where
        F: Fn(&mut FetchContext) -> HookResult + Send + Sync + 'static,
    {
        Self::new(move |ctx| future::ready(run(ctx)).boxed())
    }

    pub fn with_order(mut self, order: HookOrder) -> Self {
        self.order = order;
        self
    }

    pub fn pre(self) -> Self {
        self.with_order(HookOrder::Pre)
    }

    pub fn post(self) -> Self {
        self.with_order(HookOrder::Post)
    }

    pub fn order(&self) -> HookOrder {
        self.order
    }

    pub(crate) fn call<'a>(&self, ctx: &'a mut FetchContext) -> BoxFuture<'a, HookResult> {
        (self.run)(ctx)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// Hook lists for every phase.
#[derive(Clone, Debug, Default)]
pub struct Hooks {
    pub on_request: Vec<Hook>,
    pub on_request_error: Vec<Hook>,
    pub on_response: Vec<Hook>,
    pub on_response_error: Vec<Hook>,
}

impl Hooks {
    pub fn phase(&self, phase: HookPhase) -> &[Hook] {
        match phase {
            HookPhase::Request => &self.on_request,
            HookPhase::RequestError => &self.on_request_error,
            HookPhase::Response => &self.on_response,
            HookPhase::ResponseError => &self.on_response_error,
        }
    }

    fn phase_mut(&mut self, phase: HookPhase) -> &mut Vec<Hook> {
        match phase {
            HookPhase::Request => &mut self.on_request,
            HookPhase::RequestError => &mut self.on_request_error,
            HookPhase::Response => &mut self.on_response,
            HookPhase::ResponseError => &mut self.on_response_error,
        }
    }

    pub fn push(&mut self, phase: HookPhase, hook: Hook) {
        self.phase_mut(phase).push(hook);
    }

    pub fn is_empty(&self) -> bool {
        PHASES.iter().all(|phase| self.phase(*phase).is_empty())
    }

    /// Per-call merge: a non-empty overlay list replaces the whole phase.
    pub(crate) fn override_with(&mut self, overlay: Hooks) {
        let Hooks {
            on_request,
            on_request_error,
            on_response,
            on_response_error,
        } = overlay;
        for (phase, hooks) in PHASES.into_iter().zip([
            on_request,
            on_request_error,
            on_response,
            on_response_error,
        ]) {
            if !hooks.is_empty() {
                *self.phase_mut(phase) = hooks;
            }
        }
    }

    /// Defaults merge: overlay hooks run after the existing ones.
    pub(crate) fn extend(&mut self, overlay: Hooks) {
        self.on_request.extend(overlay.on_request);
        self.on_request_error.extend(overlay.on_request_error);
        self.on_response.extend(overlay.on_response);
        self.on_response_error.extend(overlay.on_response_error);
    }

    pub(crate) fn normalize(&mut self) {
        for phase in PHASES {
            self.phase_mut(phase).sort_by_key(Hook::order);
        }
    }
}

const PHASES: [HookPhase; 4] = [
    HookPhase::Request,
    HookPhase::RequestError,
    HookPhase::Response,
    HookPhase::ResponseError,
];

/// Runs every hook of `phase` against `ctx`, in order.
pub(crate) async fn run_hooks(phase: HookPhase, ctx: &mut FetchContext) -> Result<(), Cause> {
    // Hooks may rewrite `ctx.options.hooks`; the list in effect at phase start runs.
    let hooks = ctx.options.hooks.phase(phase).to_vec();
    for hook in hooks {
        hook.call(ctx)
            .await
            .map_err(|source| Cause::Hook { phase, source })?;
    }
    Ok(())
}
