//! Request coalescing
//!
//! When multiple tasks want the same key at once, only the first performs
//! the fetch; everyone else subscribes to a broadcast channel and receives
//! the same result, success or error. Nothing is cached here; the gate
//! only collapses duplicate work.

use std::collections::HashMap;

use tokio::sync::{broadcast, Mutex};

use crate::error::{PlayerError, Result};

type FlightResult<T> = Result<T, PlayerError>;

/// Outcome of joining a flight for a key.
pub enum Flight<T: Clone> {
    /// This caller must perform the fetch and `complete` the key.
    Leader(broadcast::Sender<FlightResult<T>>),
    /// Another caller is already fetching; wait on the receiver.
    Waiter(broadcast::Receiver<FlightResult<T>>),
}

/// Per-key coalescing gate.
pub struct SingleFlight<T: Clone> {
    in_flight: Mutex<HashMap<String, broadcast::Sender<FlightResult<T>>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Join the flight for `key`, becoming the leader if nobody else is
    /// fetching it yet.
    pub async fn join(&self, key: &str) -> Flight<T> {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(tx) = in_flight.get(key) {
            return Flight::Waiter(tx.subscribe());
        }
        let (tx, _rx) = broadcast::channel(1);
        in_flight.insert(key.to_string(), tx.clone());
        Flight::Leader(tx)
    }

    /// Finish the flight for `key`, broadcasting the result to every waiter
    /// and removing the key so the next request starts fresh.
    pub async fn complete(&self, key: &str, result: FlightResult<T>) {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(tx) = in_flight.remove(key) {
            // send errors only mean every waiter already went away
            let _ = tx.send(result);
        }
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

/// Wait on a flight receiver, translating a dropped leader into an error.
pub async fn await_flight<T: Clone>(
    mut rx: broadcast::Receiver<FlightResult<T>>,
) -> FlightResult<T> {
    match rx.recv().await {
        Ok(result) => result,
        Err(_) => Err(PlayerError::Internal(
            "coalesced fetch ended without a result".into(),
        )),
    }
}
