/*
 * vSleuth mail log forensics
 * Copyright (C) 2022 viridIT SAS
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

/// A cooperative cancellation signal, observed at suspension points.
///
/// Cheap to clone; every clone observes the same cancel request.
#[derive(Debug, Clone)]
pub struct Cancellation(Option<tokio::sync::watch::Receiver<bool>>);

impl Cancellation {
    /// A signal that never fires, for callers without a lifecycle
    /// (one-shot CLI paths, plain HTTP requests).
    #[must_use]
    pub const fn none() -> Self {
        Self(None)
    }

    /// Has cancellation been requested?
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Suspend until cancellation is requested.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.0 else {
            return std::future::pending::<()>().await;
        };

        let mut rx = rx.clone();

        loop {
            if *rx.borrow() {
                return;
            }

            if rx.changed().await.is_err() {
                // the handle is gone without firing: never cancelled
                return std::future::pending::<()>().await;
            }
        }
    }
}

/// The sending side of a [`Cancellation`].
#[derive(Debug)]
pub struct CancelHandle(tokio::sync::watch::Sender<bool>);

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Build a connected cancel handle/signal pair.
#[must_use]
pub fn cancellation_pair() -> (CancelHandle, Cancellation) {
    let (tx, rx) = tokio::sync::watch::channel(false);
    (CancelHandle(tx), Cancellation(Some(rx)))
}

/// A spawned long-running component: cancel it, then join its outcome.
#[derive(Debug)]
pub struct RunnerHandle {
    name: &'static str,
    cancel: CancelHandle,
    join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl RunnerHandle {
    /// Request the component to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the component and surface its result.
    ///
    /// # Errors
    ///
    /// The component's own error, or its panic turned into an error.
    pub async fn join(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("runner '{}' panicked: {e}", self.name)),
        }
    }
}

/// Spawn a cancellable component on the current runtime.
pub fn spawn<F, Fut>(name: &'static str, run: F) -> RunnerHandle
where
    F: FnOnce(Cancellation) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let (cancel, cancellation) = cancellation_pair();

    RunnerHandle {
        name,
        cancel,
        join: tokio::spawn(run(cancellation)),
    }
}

/// Children started in dependency order; cancelled in reverse, joined in
/// order, first error wins.
#[derive(Debug, Default)]
pub struct CombinedRunner {
    children: Vec<RunnerHandle>,
}

impl CombinedRunner {
    /// Compose already-spawned children. Order is the dependency order.
    #[must_use]
    pub fn new(children: Vec<RunnerHandle>) -> Self {
        Self { children }
    }

    /// Cancel every child, most dependent first.
    pub fn cancel(&self) {
        for child in self.children.iter().rev() {
            child.cancel();
        }
    }

    /// Join every child; an early failure does not mask a later one being
    /// joined, and the first error observed is the one reported.
    ///
    /// # Errors
    ///
    /// The first child error, if any.
    pub async fn join(self) -> anyhow::Result<()> {
        let mut first_error = None;

        for child in self.children {
            if let Err(e) = child.join().await {
                tracing::error!(error = %e, "runner finished with an error");

                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// [`CombinedRunner::cancel`] then [`CombinedRunner::join`].
    ///
    /// # Errors
    ///
    /// See [`CombinedRunner::join`].
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.cancel();
        self.join().await
    }
}

/// Tie an upstream producer to its downstream consumer: when the pair is
/// cancelled, the upstream stops first and drains into the downstream,
/// then the downstream stops.
pub fn dependant_pair(upstream: RunnerHandle, downstream: RunnerHandle) -> RunnerHandle {
    spawn("dependant-pair", |cancellation| async move {
        cancellation.cancelled().await;

        upstream.cancel();
        let upstream_result = upstream.join().await;

        downstream.cancel();
        let downstream_result = downstream.join().await;

        upstream_result.and(downstream_result)
    })
}
