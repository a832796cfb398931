//! Pluggable work scheduling with cooperative cancellation

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{self, AtomicBool},
    },
    time::{Duration, Instant},
};

use rayon::prelude::*;

/// The distinguished control-flow signal for timeouts and user cancellation
///
/// Not a domain error: strategy wrappers consume it and report an iteration
/// that made no progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation canceled")]
pub struct Canceled;

/// A shared cancellation flag, optionally paired with a deadline
///
/// Workers poll the token at batch boundaries; nothing is interrupted
/// mid-item.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    #[must_use]
    #[inline]
    pub fn new() -> Self { Self::default() }

    /// A token that trips itself once `budget` has elapsed
    #[must_use]
    pub fn with_budget(budget: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Instant::now().checked_add(budget),
        }
    }

    pub fn cancel(&self) { self.flag.store(true, atomic::Ordering::Release); }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.flag.load(atomic::Ordering::Acquire)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    #[inline]
    pub fn check(&self) -> Result<(), Canceled> {
        if self.is_canceled() { Err(Canceled) } else { Ok(()) }
    }
}

#[derive(Clone, Default)]
enum Kind {
    Sequential,
    Fixed(Arc<rayon::ThreadPool>),
    #[default]
    WorkStealing,
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => f.write_str("Sequential"),
            Self::Fixed(p) => f
                .debug_tuple("Fixed")
                .field(&p.current_num_threads())
                .finish(),
            Self::WorkStealing => f.write_str("WorkStealing"),
        }
    }
}

/// An order-preserving map over inputs with a pluggable scheduling policy
///
/// The default is the work-stealing global pool; `sequential` runs inline and
/// `fixed` owns a dedicated pool.  Maps are cheap to clone and carry a label
/// path for timing attribution plus the cancellation tokens in scope.
#[derive(Debug, Clone, Default)]
pub struct ParallelMap {
    kind: Kind,
    label: Option<Arc<str>>,
    tokens: Vec<CancelToken>,
}

impl ParallelMap {
    /// The work-stealing default
    #[must_use]
    #[inline]
    pub fn new() -> Self { Self::default() }

    /// Run everything inline on the calling thread
    #[must_use]
    pub fn sequential() -> Self {
        Self {
            kind: Kind::Sequential,
            label: None,
            tokens: vec![],
        }
    }

    /// A dedicated pool of exactly `threads` workers
    ///
    /// # Errors
    /// Fails if the underlying pool cannot be built.
    pub fn fixed(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        Ok(Self {
            kind: Kind::Fixed(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()?,
            )),
            label: None,
            tokens: vec![],
        })
    }

    /// Derive a map labeled for timing attribution
    #[must_use]
    pub fn child(&self, label: &str) -> Self {
        let label = match &self.label {
            Some(parent) => format!("{parent}/{label}"),
            None => label.to_owned(),
        };

        Self {
            kind: self.kind.clone(),
            label: Some(label.into()),
            tokens: self.tokens.clone(),
        }
    }

    /// Derive a map that polls `token` at batch boundaries
    #[must_use]
    pub fn cancelable(&self, token: CancelToken) -> Self {
        let mut next = self.clone();
        next.tokens.push(token);
        next
    }

    fn check(&self) -> Result<(), Canceled> {
        self.tokens.iter().try_for_each(CancelToken::check)
    }

    /// Map `f` over `items`, preserving order
    ///
    /// # Errors
    /// Returns [`Canceled`] if a token in scope trips before completion.
    pub fn apply<I: Send, O: Send, F: Fn(I) -> O + Sync>(
        &self,
        items: Vec<I>,
        f: F,
    ) -> Result<Vec<O>, Canceled> {
        self.try_apply(items, |i| Ok(f(i)))
    }

    /// Map a fallible `f` over `items`, preserving order and stopping at the
    /// first error
    ///
    /// # Errors
    /// Returns the first error produced by `f`, or the converted [`Canceled`]
    /// signal if a token in scope trips.
    pub fn try_apply<I: Send, O: Send, E: Send + From<Canceled>, F: Fn(I) -> Result<O, E> + Sync>(
        &self,
        items: Vec<I>,
        f: F,
    ) -> Result<Vec<O>, E> {
        let span = tracing::trace_span!(
            "parallel_map",
            label = self.label.as_deref().unwrap_or(""),
            items = items.len()
        );
        let _enter = span.enter();

        let each = |i| {
            self.check()?;
            f(i)
        };

        match &self.kind {
            Kind::Sequential => items.into_iter().map(each).collect(),
            Kind::Fixed(pool) => pool.install(|| items.into_par_iter().map(each).collect()),
            Kind::WorkStealing => items.into_par_iter().map(each).collect(),
        }
    }
}
