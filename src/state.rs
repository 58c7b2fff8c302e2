//! Shared run state for an intake run.
//!
//! The watcher, the dispatcher and the control surface all observe the same
//! small set of facts: whether the run is live, what the pipeline is doing
//! right now, which files are queued or finished, and what the external API
//! has cost so far. That state lives here as one explicit context object
//! with synchronized accessors, passed by reference to each component.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

/// Running totals for outbound model calls. Purely observational; never
/// gates behavior. Reset only by process restart.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CostLedger {
    pub queries: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_cost_usd: f64,
}

/// How a dispatched file ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedOutcome {
    Renamed,
    Quarantined,
}

/// One finished file, as shown in the control panel's processed list.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedRecord {
    pub original: String,
    pub destination: Option<String>,
    pub outcome: ProcessedOutcome,
    /// True when the fields came from the sentinel fallback rather than a
    /// parsed model reply.
    pub degraded: bool,
    pub completed_at: String,
}

/// Snapshot handed to the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub status: String,
    pub queue: Vec<String>,
    pub processed: Vec<ProcessedRecord>,
    pub queries: u64,
    pub total_cost_usd: f64,
}

impl StatusSnapshot {
    /// Snapshot for the time before any processor has been started.
    pub fn idle() -> Self {
        Self {
            running: false,
            status: "idle".to_string(),
            queue: Vec::new(),
            processed: Vec::new(),
            queries: 0,
            total_cost_usd: 0.0,
        }
    }
}

/// Shared context for one processor instance.
#[derive(Debug)]
pub struct RunContext {
    running: AtomicBool,
    status: Mutex<String>,
    queue: Mutex<Vec<String>>,
    processed: Mutex<Vec<ProcessedRecord>>,
    ledger: Mutex<CostLedger>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            status: Mutex::new("idle".to_string()),
            queue: Mutex::new(Vec::new()),
            processed: Mutex::new(Vec::new()),
            ledger: Mutex::new(CostLedger::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.lock().expect("run state lock poisoned") = status.into();
    }

    pub fn status(&self) -> String {
        self.status.lock().expect("run state lock poisoned").clone()
    }

    /// Add a file to the visible processing queue.
    pub fn enqueue(&self, name: &str) {
        let mut queue = self.queue.lock().expect("run state lock poisoned");
        if !queue.iter().any(|queued| queued == name) {
            queue.push(name.to_string());
        }
    }

    /// Remove a file from the visible processing queue.
    pub fn dequeue(&self, name: &str) {
        self.queue
            .lock()
            .expect("run state lock poisoned")
            .retain(|queued| queued != name);
    }

    pub fn record_processed(&self, record: ProcessedRecord) {
        self.processed
            .lock()
            .expect("run state lock poisoned")
            .push(record);
    }

    /// Accrue one completed model call into the ledger.
    pub fn record_call(&self, prompt_tokens: u64, completion_tokens: u64, cost_usd: f64) {
        let mut ledger = self.ledger.lock().expect("run state lock poisoned");
        ledger.queries += 1;
        ledger.prompt_tokens += prompt_tokens;
        ledger.completion_tokens += completion_tokens;
        ledger.total_cost_usd += cost_usd;
    }

    pub fn ledger(&self) -> CostLedger {
        *self.ledger.lock().expect("run state lock poisoned")
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let ledger = self.ledger();
        StatusSnapshot {
            running: self.is_running(),
            status: self.status(),
            queue: self.queue.lock().expect("run state lock poisoned").clone(),
            processed: self
                .processed
                .lock()
                .expect("run state lock poisoned")
                .clone(),
            queries: ledger.queries,
            total_cost_usd: ledger.total_cost_usd,
        }
    }
}
