// Trawl is an open source web crawling pipeline.
// Copyright (C) 2024 Trawl ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::CrawlJob;
use crate::Error;

/// Executes a single job. The production runner is the crawl worker;
/// tests plug in mocks.
#[async_trait::async_trait]
pub(crate) trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: CrawlJob);
}

/// Bounded worker pool. Exactly `worker_count` workers exist while the
/// dispatcher is running; each advertises its personal inbox on the
/// shared free list before waiting for work, and the dispatcher task is
/// the sole reader of the submission queue. This caps concurrent fetches
/// at the worker count.
pub(crate) struct Dispatcher {
    quit: mpsc::Sender<oneshot::Sender<()>>,
}

struct WorkerHandle {
    quit: mpsc::Sender<oneshot::Sender<()>>,
}

impl Dispatcher {
    pub fn start(
        worker_count: usize,
        submission: mpsc::Receiver<CrawlJob>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        let (pool_tx, pool_rx) = mpsc::channel(worker_count.max(1));

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (quit_tx, quit_rx) = mpsc::channel(1);

            tokio::spawn(worker_loop(Arc::clone(&runner), pool_tx.clone(), quit_rx));
            workers.push(WorkerHandle { quit: quit_tx });
        }
        drop(pool_tx);

        let (quit_tx, quit_rx) = mpsc::channel(1);
        tokio::spawn(dispatch_loop(submission, pool_rx, workers, quit_rx));

        Self { quit: quit_tx }
    }

    /// Signal each worker to drain its current job and exit, then let
    /// the dispatcher exit. Returns only after all workers have
    /// acknowledged, or fails with `ShutdownTimeout`.
    pub async fn stop(&self, deadline: Duration) -> Result<(), Error> {
        let (ack_tx, ack_rx) = oneshot::channel();

        if self.quit.send(ack_tx).await.is_err() {
            // dispatcher already gone
            return Ok(());
        }

        match tokio::time::timeout(deadline, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(Error::ShutdownTimeout),
        }
    }
}

async fn worker_loop(
    runner: Arc<dyn JobRunner>,
    pool: mpsc::Sender<mpsc::Sender<CrawlJob>>,
    mut quit: mpsc::Receiver<oneshot::Sender<()>>,
) {
    let (inbox_tx, mut inbox_rx) = mpsc::channel::<CrawlJob>(1);

    loop {
        // register as idle
        if pool.send(inbox_tx.clone()).await.is_err() {
            return;
        }

        tokio::select! {
            job = inbox_rx.recv() => {
                match job {
                    Some(job) => runner.run(job).await,
                    None => return,
                }
            }
            ack = quit.recv() => {
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return;
            }
        }
    }
}

async fn dispatch_loop(
    mut submission: mpsc::Receiver<CrawlJob>,
    mut pool: mpsc::Receiver<mpsc::Sender<CrawlJob>>,
    workers: Vec<WorkerHandle>,
    mut quit: mpsc::Receiver<oneshot::Sender<()>>,
) {
    loop {
        tokio::select! {
            ack = quit.recv() => {
                let Some(ack) = ack else { return };

                for worker in &workers {
                    let (worker_ack_tx, worker_ack_rx) = oneshot::channel();
                    if worker.quit.send(worker_ack_tx).await.is_ok() {
                        let _ = worker_ack_rx.await;
                    }
                }

                let _ = ack.send(());
                return;
            }
            job = submission.recv() => {
                let Some(job) = job else { return };

                match pool.recv().await {
                    Some(worker_tx) => {
                        if worker_tx.send(job).await.is_err() {
                            tracing::warn!("worker inbox closed, dropping job");
                        }
                    }
                    None => return,
                }
            }
        }
    }
}
