//! Compensating-transaction coordinator.
//!
//! A sequential saga runner for mutations spanning records that share no
//! native transaction. Each forward action may register an undo; when a
//! later action fails, registered undos run in strict reverse order before
//! the failure is surfaced. This is not atomicity: every forward commit is
//! externally observable before its compensation could run, so each
//! compensable mutation must be safe to observe mid-flight and the engine's
//! self-healing read path closes any crash window eventually.
//!
//! The stack lives for a single workflow invocation and is never shared
//! across requests.

use futures::future::BoxFuture;
use std::fmt::Display;
use std::future::Future;
use tracing::{error, warn};

/// Deferred undo for a committed forward action.
pub type Compensation<'a, E> = Box<dyn FnOnce() -> BoxFuture<'a, Result<(), E>> + Send + 'a>;

/// A compensation that failed while unwinding.
#[derive(Debug)]
pub struct CompensationFailure<E> {
    pub step: &'static str,
    pub error: E,
}

/// Outcome of a saga whose forward action failed.
#[derive(Debug)]
pub enum SagaFailure<E> {
    /// Every registered compensation ran cleanly; the system is back in its
    /// pre-saga state and the original failure can be surfaced as-is.
    RolledBack { step: &'static str, source: E },
    /// One or more compensations failed: the system is in a
    /// known-inconsistent state. Fatal; must reach an operator.
    RollbackIncomplete {
        step: &'static str,
        source: E,
        compensation_failures: Vec<CompensationFailure<E>>,
    },
}

impl<E> SagaFailure<E> {
    pub fn source(&self) -> &E {
        match self {
            SagaFailure::RolledBack { source, .. } => source,
            SagaFailure::RollbackIncomplete { source, .. } => source,
        }
    }
}

/// Per-invocation coordinator holding the compensation stack.
pub struct Saga<'a, E> {
    compensations: Vec<(&'static str, Compensation<'a, E>)>,
}

impl<'a, E: Display> Saga<'a, E> {
    pub fn new() -> Self {
        Self {
            compensations: Vec::new(),
        }
    }

    /// Run a forward action that needs no undo of its own. A failure still
    /// unwinds every previously registered compensation.
    pub async fn run<T, F>(&mut self, step: &'static str, forward: F) -> Result<T, SagaFailure<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        match forward.await {
            Ok(value) => Ok(value),
            Err(source) => Err(self.fail(step, source).await),
        }
    }

    /// Run a forward action and, on success, register the undo built from
    /// its result.
    pub async fn run_compensable<T, F, C>(
        &mut self,
        step: &'static str,
        forward: F,
        compensate: C,
    ) -> Result<T, SagaFailure<E>>
    where
        F: Future<Output = Result<T, E>>,
        C: FnOnce(&T) -> Compensation<'a, E>,
    {
        match forward.await {
            Ok(value) => {
                self.compensations.push((step, compensate(&value)));
                Ok(value)
            }
            Err(source) => Err(self.fail(step, source).await),
        }
    }

    /// Discard the compensation stack after the final step commits.
    pub fn commit(mut self) {
        self.compensations.clear();
    }

    async fn fail(&mut self, step: &'static str, source: E) -> SagaFailure<E> {
        warn!(step, error = %source, "saga step failed, unwinding");
        let compensation_failures = self.unwind().await;
        if compensation_failures.is_empty() {
            SagaFailure::RolledBack { step, source }
        } else {
            SagaFailure::RollbackIncomplete {
                step,
                source,
                compensation_failures,
            }
        }
    }

    /// Run every registered compensation in reverse order. Never aborts
    /// early: failed compensations are collected while the rest still run.
    async fn unwind(&mut self) -> Vec<CompensationFailure<E>> {
        let mut failures = Vec::new();
        while let Some((step, compensate)) = self.compensations.pop() {
            match compensate().await {
                Ok(()) => warn!(step, "compensation applied"),
                Err(error) => {
                    error!(step, error = %error, "compensation failed during rollback");
                    failures.push(CompensationFailure { step, error });
                }
            }
        }
        failures
    }
}

impl<'a, E: Display> Default for Saga<'a, E> {
    fn default() -> Self {
        Self::new()
    }
}
