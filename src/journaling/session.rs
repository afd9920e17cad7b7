use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, SendError, Sender};

use super::draft::{DeleteTicket, Draft, DraftError, SaveAck, SaveRequest, SaveTicket};
use super::gateway::{AuthSession, EntryGateway, GatewayError, OwnerRef, Visibility};
use super::status::DraftEvent;
use super::version::SaveStamp;

#[derive(Debug)]
enum Completion {
    Save {
        stamp: SaveStamp,
        outcome: Result<SaveAck, GatewayError>,
    },
    Delete {
        ticket: DeleteTicket,
        outcome: Result<(), GatewayError>,
    },
}

/// One gateway call, queued for the session's worker.
#[derive(Debug)]
enum Job {
    Save {
        ticket: SaveTicket,
        owner: Option<OwnerRef>,
    },
    Delete(DeleteTicket),
}

impl Job {
    fn run<G: EntryGateway>(self, gateway: &G) -> Completion {
        match self {
            Job::Save { ticket, owner } => {
                let outcome = match (ticket.request, owner) {
                    (_, None) => Err(GatewayError::Unauthenticated),
                    (SaveRequest::Create(fields), Some(owner)) => {
                        gateway.create(&fields, &owner).map(SaveAck::Created)
                    }
                    (SaveRequest::Update { id, fields }, Some(_)) => {
                        gateway.update(id, &fields).map(|()| SaveAck::Updated)
                    }
                };
                Completion::Save {
                    stamp: ticket.stamp,
                    outcome,
                }
            }
            Job::Delete(ticket) => Completion::Delete {
                ticket,
                outcome: gateway.delete(ticket.id),
            },
        }
    }

    fn fail(self, error: GatewayError) -> Completion {
        match self {
            Job::Save { ticket, .. } => Completion::Save {
                stamp: ticket.stamp,
                outcome: Err(error),
            },
            Job::Delete(ticket) => Completion::Delete {
                ticket,
                outcome: Err(error),
            },
        }
    }
}

/// Starts the worker that performs every gateway call of one session, one at
/// a time and in submission order. It exits once the session drops its end of
/// the queue.
fn spawn_worker<G>(gateway: Arc<G>, completions: Sender<Completion>) -> io::Result<Sender<Job>>
where
    G: EntryGateway + 'static,
{
    let (jobs, queue) = unbounded::<Job>();
    thread::Builder::new()
        .name("diary-gateway".to_owned())
        .spawn(move || {
            for job in queue {
                let completion = job.run(&*gateway);
                if completions.send(completion).is_err() {
                    tracing::debug!("session ended, dropping gateway completion");
                }
            }
        })?;
    Ok(jobs)
}

/// Single-threaded event loop around one [`Draft`].
///
/// Gateway calls run on a dedicated worker thread, so writes reach the store
/// in the order they were dispatched. Their completions come back over a
/// channel and only the owning thread touches the draft.
pub struct DraftSession<A> {
    draft: Draft,
    auth: A,
    jobs: Sender<Job>,
    completions: Receiver<Completion>,
    in_flight: usize,
}

impl<A: AuthSession> DraftSession<A> {
    pub fn new<G>(draft: Draft, gateway: Arc<G>, auth: A) -> io::Result<Self>
    where
        G: EntryGateway + 'static,
    {
        let (tx, completions) = unbounded();
        let jobs = spawn_worker(gateway, tx)?;
        Ok(Self {
            draft,
            auth,
            jobs,
            completions,
            in_flight: 0,
        })
    }

    pub fn draft(&self) -> &Draft {
        &self.draft
    }

    pub fn subscribe(&mut self) -> Receiver<DraftEvent> {
        self.draft.subscribe()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn set_content(&mut self, text: impl Into<String>) -> Result<(), DraftError> {
        self.draft.set_content(text, Instant::now())
    }

    pub fn set_visibility(&mut self, visibility: Visibility) -> Result<(), DraftError> {
        self.draft.set_visibility(visibility, Instant::now())
    }

    pub fn save_now(&mut self) -> bool {
        match self.draft.save_now() {
            Some(ticket) => {
                self.dispatch_save(ticket);
                true
            }
            None => false,
        }
    }

    pub fn request_delete(&mut self) -> Result<(), DraftError> {
        let ticket = self.draft.request_delete()?;
        self.submit(Job::Delete(ticket));
        Ok(())
    }

    /// Applies every completion that has already arrived, then dispatches a
    /// save if the quiet interval has run out. Returns how many completions
    /// were applied.
    pub fn pump(&mut self, now: Instant) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completions.try_recv() {
            self.apply(completion, now);
            applied += 1;
        }
        if let Some(ticket) = self.draft.poll(now) {
            self.dispatch_save(ticket);
        }
        applied
    }

    /// Sleeps until a completion arrives, the debounce deadline passes, or
    /// `max_wait` elapses, then pumps.
    pub fn tick(&mut self, max_wait: Duration) -> usize {
        let now = Instant::now();
        let wait = match self.draft.next_deadline() {
            Some(deadline) => max_wait.min(deadline.saturating_duration_since(now)),
            None => max_wait,
        };
        match self.completions.recv_timeout(wait) {
            Ok(completion) => {
                self.apply(completion, Instant::now());
                1 + self.pump(Instant::now())
            }
            Err(RecvTimeoutError::Timeout) => self.pump(Instant::now()),
            Err(RecvTimeoutError::Disconnected) => {
                // Worker is gone; nothing more will arrive.
                thread::sleep(wait);
                self.pump(Instant::now())
            }
        }
    }

    /// Runs the loop until nothing is in flight and no save is scheduled.
    /// Returns `false` if `timeout` ran out first.
    pub fn settle(&mut self, timeout: Duration) -> bool {
        let give_up = Instant::now() + timeout;
        loop {
            if self.in_flight == 0 && self.draft.next_deadline().is_none() {
                return true;
            }
            let now = Instant::now();
            if now >= give_up {
                return false;
            }
            self.tick(give_up - now);
        }
    }

    /// Explicit flush: dispatches pending edits immediately and waits for the
    /// outcome.
    pub fn flush(&mut self, timeout: Duration) -> bool {
        self.save_now();
        self.settle(timeout)
    }

    /// Tears the session down. Pending debounce is cancelled. Calls already
    /// queued still run, but their completions are dropped.
    pub fn end(mut self) -> Draft {
        self.draft.close();
        if self.in_flight > 0 {
            tracing::debug!(in_flight = self.in_flight, "ending session with requests in flight");
        }
        self.draft
    }

    fn apply(&mut self, completion: Completion, now: Instant) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match completion {
            Completion::Save { stamp, outcome } => self.draft.complete_save(stamp, outcome, now),
            Completion::Delete { ticket, outcome } => self.draft.complete_delete(ticket, outcome),
        }
    }

    fn dispatch_save(&mut self, ticket: SaveTicket) {
        let owner = self.auth.current_owner();
        if owner.is_none() {
            tracing::warn!(sequence = ticket.stamp.sequence, "no signed-in owner, save will fail");
        }
        self.submit(Job::Save { ticket, owner });
    }

    fn submit(&mut self, job: Job) {
        self.in_flight += 1;
        if let Err(SendError(job)) = self.jobs.send(job) {
            tracing::error!("gateway worker has stopped");
            let completion = job.fail(GatewayError::backend("gateway worker stopped"));
            self.apply(completion, Instant::now());
        }
    }
}
