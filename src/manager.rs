// Conference registry and media-worker pool.
//
// Workers are provisioned once at startup by the embedding bootstrap and
// handed over here; conferences are created lazily on the first connection
// for a room id and removed when they close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::conference::Conference;
use crate::config::Config;
use crate::error::MediaError;
use crate::media::MediaWorker;

// ─── Worker pool ────────────────────────────────────────────────────────────

/// Round-robin distribution of routers over engine workers.
pub struct WorkerPool {
    workers: Vec<Arc<dyn MediaWorker>>,
    next: AtomicUsize,
}

impl WorkerPool {
    pub fn new(workers: Vec<Arc<dyn MediaWorker>>) -> Self {
        for worker in &workers {
            // A dead worker strands every conference routed on it. Nothing
            // sensible can be rebuilt from here; the operator has to act.
            worker.on_died(Box::new(|| {
                error!("media worker died, conferences on it are unrecoverable");
            }));
        }
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Next worker in rotation.
    pub fn next_worker(&self) -> Option<Arc<dyn MediaWorker>> {
        if self.workers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::SeqCst) % self.workers.len();
        Some(Arc::clone(&self.workers[index]))
    }
}

// ─── Conference manager ─────────────────────────────────────────────────────

pub struct ConferenceManager {
    config: Arc<Config>,
    pool: WorkerPool,
    conferences: Mutex<HashMap<String, Arc<Conference>>>,
}

impl ConferenceManager {
    pub fn new(config: Arc<Config>, pool: WorkerPool) -> Arc<Self> {
        Arc::new(Self {
            config,
            pool,
            conferences: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The conference for `room_id`, creating it if absent.
    pub async fn create_or_get_conference(
        self: &Arc<Self>,
        room_id: &str,
    ) -> Result<Arc<Conference>, MediaError> {
        if let Some(existing) = self.get_conference(room_id) {
            return Ok(existing);
        }

        let worker = self
            .pool
            .next_worker()
            .ok_or_else(|| MediaError::new("no media workers available"))?;
        let conference =
            Conference::create(room_id, worker, Arc::clone(&self.config)).await?;

        {
            let mut conferences = self.conferences.lock().unwrap();
            // Two connections can race here; the first insert wins and the
            // loser's conference is torn down again.
            if let Some(existing) = conferences.get(room_id) {
                if !existing.is_closed() {
                    warn!(room = %room_id, "conference created concurrently, discarding ours");
                    let existing = Arc::clone(existing);
                    drop(conferences);
                    conference.close();
                    return Ok(existing);
                }
            }
            conferences.insert(room_id.to_string(), Arc::clone(&conference));
        }

        // Remove on close, but only the same instance: a closed conference
        // may already have been replaced under this id.
        let weak_manager = Arc::downgrade(self);
        let weak_conference = Arc::downgrade(&conference);
        let room_id = room_id.to_string();
        conference.on_close(move || {
            let Some(manager) = weak_manager.upgrade() else { return };
            let mut conferences = manager.conferences.lock().unwrap();
            if let Some(current) = conferences.get(&room_id) {
                let same = weak_conference
                    .upgrade()
                    .is_some_and(|c| Arc::ptr_eq(current, &c));
                if same {
                    conferences.remove(&room_id);
                    info!(room = %room_id, "conference removed");
                }
            }
        });

        Ok(conference)
    }

    /// The open conference for `room_id`, if any.
    pub fn get_conference(&self, room_id: &str) -> Option<Arc<Conference>> {
        self.conferences
            .lock()
            .unwrap()
            .get(room_id)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    pub fn conference_count(&self) -> usize {
        self.conferences.lock().unwrap().len()
    }

    /// Peers across all open conferences.
    pub fn peer_count(&self) -> usize {
        self.conferences
            .lock()
            .unwrap()
            .values()
            .map(|c| c.peer_count())
            .sum()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
