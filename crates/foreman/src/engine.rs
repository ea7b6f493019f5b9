//! The request-correlation engine.
//!
//! Couples each asynchronous HTTP request to the worker message that will
//! answer it: a parameters snapshot, the first metadata delivery, an
//! action acknowledgement derived from the worker's lifecycle state, or a
//! child-process death. Concurrent pause, run, and delete callers
//! targeting the same worker are coalesced onto one in-flight RPC and
//! replayed the same outcome; snapshot callers each ping the worker,
//! which answers every ping with exactly one frame.
//!
//! Tables and their locks:
//!
//! - `actions` (one lock): the per-port FIFO of snapshot waiters plus the
//!   pause and run caller tables. The FIFO head is always the record the
//!   next parameters frame from that worker answers. The presence of a
//!   pause/run caller table entry is the admission gate for the opposing
//!   action.
//! - `deletes`: callers answered only when the child process dies.
//! - `metadata`: callers answered by the type's first metadata delivery.
//! - `columns`: table-column schemas extracted from metadata, read by the
//!   protocol decoder.
//!
//! Lock order when nesting (the child-death fan-out): the caller's
//! created-apps lock, then `actions`, then `deletes`, then `metadata`.
//! No lock is held across a send; sends go through [`Transport`] which
//! only enqueues.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use bytes::Bytes;
use foreproto::{Action, ColumnSchema, ParameterSet, WorkerState};
use forenet::ConnId;
use tracing::{debug, error, warn};

use crate::responses;

/// Sends bytes to a connection without blocking or taking engine locks.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, connection: ConnId, bytes: Bytes);
}

/// Where a pending HTTP request's answer must be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Carrier {
    pub connection: ConnId,
}

/// One slot in the per-port snapshot FIFO. A snapshot either is the
/// answer itself, or is the probe that resolves a coalesced action.
#[derive(Debug)]
enum SnapshotWaiter {
    Snapshot(Carrier),
    PauseProbe,
    RunProbe,
}

#[derive(Default)]
struct ActionTables {
    parameters: HashMap<u16, VecDeque<SnapshotWaiter>>,
    pause: HashMap<u16, Vec<Carrier>>,
    run: HashMap<u16, Vec<Carrier>>,
}

#[derive(Debug, thiserror::Error)]
#[error("Another action is a process")]
pub struct ActionConflict;

pub struct Engine {
    transport: Box<dyn Transport>,
    actions: Mutex<ActionTables>,
    deletes: Mutex<HashMap<u16, Vec<Carrier>>>,
    metadata: Mutex<HashMap<u64, Vec<Carrier>>>,
    columns: Mutex<HashMap<u64, ColumnSchema>>,
}

impl Engine {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            actions: Mutex::new(ActionTables::default()),
            deletes: Mutex::new(HashMap::new()),
            metadata: Mutex::new(HashMap::new()),
            columns: Mutex::new(HashMap::new()),
        }
    }

    pub fn send(&self, connection: ConnId, bytes: Bytes) {
        self.transport.send(connection, bytes);
    }

    fn respond(&self, carrier: Carrier, bytes: Bytes) {
        self.transport.send(carrier.connection, bytes);
    }

    // ---- column schemas ------------------------------------------------

    pub fn column_schema(&self, id: u64) -> Option<ColumnSchema> {
        self.columns.lock().unwrap().get(&id).cloned()
    }

    /// First registration wins, matching first-delivery-wins metadata.
    pub fn register_columns(&self, schemas: HashMap<u64, ColumnSchema>) {
        let mut columns = self.columns.lock().unwrap();
        for (id, schema) in schemas {
            columns.entry(id).or_insert(schema);
        }
    }

    // ---- pending-record admission --------------------------------------

    /// Enqueue a snapshot waiter and ping the worker. Every caller sends
    /// its own request: the worker answers each ping with exactly one
    /// frame, and the FIFO pairs frames to waiters in arrival order.
    pub fn request_parameters(&self, port: u16, worker: ConnId, carrier: Carrier) {
        let mut tables = self.actions.lock().unwrap();
        tables
            .parameters
            .entry(port)
            .or_default()
            .push_back(SnapshotWaiter::Snapshot(carrier));
        drop(tables);
        if worker != 0 {
            self.send(worker, Action::ParametersRequest.to_frame().encode());
        }
    }

    /// True when a run (pause) action is in flight, which blocks the
    /// opposing request before anything else is looked at.
    pub fn run_in_flight(&self, port: u16) -> bool {
        self.actions.lock().unwrap().run.contains_key(&port)
    }

    pub fn pause_in_flight(&self, port: u16) -> bool {
        self.actions.lock().unwrap().pause.contains_key(&port)
    }

    /// Coalesce a pause caller. The first caller per port sends the
    /// action and the probe; everyone else rides along.
    pub fn request_pause(
        &self,
        port: u16,
        worker: ConnId,
        carrier: Carrier,
    ) -> Result<(), ActionConflict> {
        self.request_action(port, worker, carrier, Action::Pause)
    }

    pub fn request_run(
        &self,
        port: u16,
        worker: ConnId,
        carrier: Carrier,
    ) -> Result<(), ActionConflict> {
        self.request_action(port, worker, carrier, Action::Run)
    }

    fn request_action(
        &self,
        port: u16,
        worker: ConnId,
        carrier: Carrier,
        action: Action,
    ) -> Result<(), ActionConflict> {
        let pausing = matches!(action, Action::Pause);
        let mut to_send: Vec<Bytes> = Vec::new();
        {
            let mut tables = self.actions.lock().unwrap();
            let opposing = if pausing { &tables.run } else { &tables.pause };
            if opposing.contains_key(&port) {
                return Err(ActionConflict);
            }
            let own = if pausing {
                &mut tables.pause
            } else {
                &mut tables.run
            };
            let callers = own.entry(port).or_default();
            let first = callers.is_empty();
            callers.push(carrier);
            if first {
                to_send.push(action.to_frame().encode());
                tables.parameters.entry(port).or_default().push_back(if pausing {
                    SnapshotWaiter::PauseProbe
                } else {
                    SnapshotWaiter::RunProbe
                });
                // The probe needs its own frame even when snapshots are
                // already queued ahead of it.
                to_send.push(Action::ParametersRequest.to_frame().encode());
            }
        }
        for bytes in to_send {
            self.send(worker, bytes);
        }
        Ok(())
    }

    /// Coalesce a delete caller; answered only on child death.
    pub fn request_delete(&self, port: u16, worker: ConnId, carrier: Carrier) {
        let first = {
            let mut deletes = self.deletes.lock().unwrap();
            let callers = deletes.entry(port).or_default();
            let first = callers.is_empty();
            callers.push(carrier);
            first
        };
        if first {
            self.send(worker, Action::Delete.to_frame().encode());
        }
    }

    /// Register a caller awaiting the type's first metadata delivery.
    pub fn request_metadata(&self, hash: u64, carrier: Carrier) {
        self.metadata.lock().unwrap().entry(hash).or_default().push(carrier);
    }

    // ---- completion paths ----------------------------------------------

    /// A parameters frame arrived from the worker listening on `port`.
    /// The FIFO head decides what it answers.
    pub fn on_parameters_frame(&self, port: u16, params: &ParameterSet) {
        let mut tables = self.actions.lock().unwrap();
        let Some(queue) = tables.parameters.get_mut(&port) else {
            return;
        };
        let Some(head) = queue.pop_front() else {
            return;
        };
        let emptied = queue.is_empty();
        if emptied {
            tables.parameters.remove(&port);
        }
        match head {
            SnapshotWaiter::Snapshot(carrier) => {
                drop(tables);
                self.respond(carrier, responses::parameters(params));
            }
            SnapshotWaiter::PauseProbe => {
                let callers = tables.pause.remove(&port).unwrap_or_default();
                // A completed pause cancels any run in flight and vice
                // versa; the opposing table is cleared exactly once.
                tables.run.remove(&port);
                drop(tables);
                self.answer_action(callers, params, WorkerState::Paused);
            }
            SnapshotWaiter::RunProbe => {
                let callers = tables.run.remove(&port).unwrap_or_default();
                tables.pause.remove(&port);
                drop(tables);
                self.answer_action(callers, params, WorkerState::Running);
            }
        }
    }

    fn answer_action(&self, callers: Vec<Carrier>, params: &ParameterSet, expected: WorkerState) {
        let bytes = match params.lifecycle_state() {
            Some(state) => responses::action_result(state == expected),
            None => {
                error!("state of application is unexpected");
                responses::negative("Application state is unexpected")
            }
        };
        for carrier in callers {
            self.respond(carrier, bytes.clone());
        }
    }

    /// Metadata for a type arrived: replay the same success response to
    /// every waiting caller.
    pub fn drain_metadata(&self, hash: u64, raw: &str) {
        let callers = self.metadata.lock().unwrap().remove(&hash);
        if let Some(callers) = callers {
            let bytes = responses::metadata(raw);
            debug!(hash, callers = callers.len(), "metadata fan-out");
            for carrier in callers {
                self.respond(carrier, bytes.clone());
            }
        }
    }

    /// Child-death fan-out for one port: snapshots fail, pause/run fail,
    /// deletes succeed.
    pub fn fail_for_port(&self, port: u16) {
        {
            let mut tables = self.actions.lock().unwrap();
            if let Some(queue) = tables.parameters.remove(&port) {
                for waiter in queue {
                    if let SnapshotWaiter::Snapshot(carrier) = waiter {
                        self.respond(carrier, responses::app_terminated());
                    }
                }
            }
            for carrier in tables.pause.remove(&port).unwrap_or_default() {
                self.respond(carrier, responses::action_result_failed());
            }
            for carrier in tables.run.remove(&port).unwrap_or_default() {
                self.respond(carrier, responses::action_result_failed());
            }
        }
        {
            let mut deletes = self.deletes.lock().unwrap();
            for carrier in deletes.remove(&port).unwrap_or_default() {
                self.respond(carrier, responses::ok());
            }
        }
    }

    /// The last instance of a type died before delivering metadata.
    pub fn fail_metadata_for_type(&self, hash: u64) {
        let callers = self.metadata.lock().unwrap().remove(&hash);
        if let Some(callers) = callers {
            warn!(hash, callers = callers.len(), "failing metadata waiters, type has no instances");
            for carrier in callers {
                self.respond(
                    carrier,
                    responses::negative("App is terminated, metadata is not available"),
                );
            }
        }
    }

    /// Shutdown drain: every pending record gets its terminal response
    /// and all tables end empty. Deletes succeed, everything else reports
    /// the pause.
    pub fn drain_all(&self) {
        {
            let mut tables = self.actions.lock().unwrap();
            for (_, queue) in tables.parameters.drain() {
                for waiter in queue {
                    if let SnapshotWaiter::Snapshot(carrier) = waiter {
                        self.respond(carrier, responses::manager_paused());
                    }
                }
            }
            for (_, callers) in tables.pause.drain() {
                for carrier in callers {
                    self.respond(carrier, responses::manager_paused());
                }
            }
            for (_, callers) in tables.run.drain() {
                for carrier in callers {
                    self.respond(carrier, responses::manager_paused());
                }
            }
        }
        {
            let mut deletes = self.deletes.lock().unwrap();
            for (_, callers) in deletes.drain() {
                for carrier in callers {
                    self.respond(carrier, responses::ok());
                }
            }
        }
        {
            let mut metadata = self.metadata.lock().unwrap();
            for (_, callers) in metadata.drain() {
                for carrier in callers {
                    self.respond(carrier, responses::manager_paused());
                }
            }
        }
    }

    /// True when no pending record of any kind remains.
    pub fn is_drained(&self) -> bool {
        let tables = self.actions.lock().unwrap();
        let empty_actions =
            tables.parameters.is_empty() && tables.pause.is_empty() && tables.run.is_empty();
        drop(tables);
        empty_actions
            && self.deletes.lock().unwrap().is_empty()
            && self.metadata.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreproto::{Value, CIPHER_ACTION, HEADER_LEN, PARAM_LIFECYCLE_STATE, PARAM_LISTEN_PORT};
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Default)]
    struct Recorder {
        sent: Arc<StdMutex<Vec<(ConnId, Bytes)>>>,
    }

    impl Transport for Recorder {
        fn send(&self, connection: ConnId, bytes: Bytes) {
            self.sent.lock().unwrap().push((connection, bytes));
        }
    }

    fn engine() -> (Engine, Arc<StdMutex<Vec<(ConnId, Bytes)>>>) {
        let recorder = Recorder::default();
        let sent = recorder.sent.clone();
        (Engine::new(Box::new(recorder)), sent)
    }

    fn decode_action(bytes: &Bytes) -> Action {
        assert!(bytes.len() >= HEADER_LEN);
        let cipher = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(cipher, CIPHER_ACTION);
        Action::decode_body(bytes.slice(HEADER_LEN..), |_| None).unwrap()
    }

    fn http_body(bytes: &Bytes) -> String {
        let text = std::str::from_utf8(bytes).unwrap();
        text.split("\r\n\r\n").nth(1).unwrap().to_string()
    }

    fn worker_reply(port: u16, state: WorkerState) -> ParameterSet {
        let mut params = ParameterSet::new();
        params
            .set(PARAM_LISTEN_PORT, Value::Uint16(port))
            .set(PARAM_LIFECYCLE_STATE, Value::Int16(state as i16));
        params
    }

    const WORKER: ConnId = 9;

    #[test]
    fn every_snapshot_caller_pings_the_worker_and_replies_route_fifo() {
        let (engine, sent) = engine();

        engine.request_parameters(3500, WORKER, Carrier { connection: 1 });
        engine.request_parameters(3500, WORKER, Carrier { connection: 2 });

        // One ping per caller: the worker answers each with one frame.
        {
            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            for (connection, bytes) in sent.iter() {
                assert_eq!(*connection, WORKER);
                assert_eq!(decode_action(bytes), Action::ParametersRequest);
            }
        }

        // The worker replies once per ping; replies pair with waiters in
        // arrival order.
        let mut reply = ParameterSet::new();
        reply.set(PARAM_LISTEN_PORT, Value::Uint16(3500)).set(42, Value::Int32(7));
        engine.on_parameters_frame(3500, &reply);
        engine.on_parameters_frame(3500, &reply);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[2].0, 1);
        assert_eq!(sent[3].0, 2);
        assert!(http_body(&sent[2].1).contains("\"42\":7"));
        assert!(http_body(&sent[2].1).contains("\"1000009\":3500"));
        assert!(http_body(&sent[3].1).contains("\"42\":7"));
        assert!(engine.is_drained());
    }

    #[test]
    fn action_probe_pings_even_with_a_snapshot_in_flight() {
        let (engine, sent) = engine();

        engine.request_parameters(3500, WORKER, Carrier { connection: 1 });
        engine
            .request_pause(3500, WORKER, Carrier { connection: 2 })
            .unwrap();

        // Snapshot ping, then the action, then the probe's own ping.
        {
            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), 3);
            assert_eq!(decode_action(&sent[0].1), Action::ParametersRequest);
            assert_eq!(decode_action(&sent[1].1), Action::Pause);
            assert_eq!(decode_action(&sent[2].1), Action::ParametersRequest);
        }

        // First frame answers the snapshot, second resolves the pause.
        engine.on_parameters_frame(3500, &worker_reply(3500, WorkerState::Paused));
        engine.on_parameters_frame(3500, &worker_reply(3500, WorkerState::Paused));

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[3].0, 1);
        assert!(http_body(&sent[3].1).contains("\"parameters\""));
        assert_eq!(sent[4].0, 2);
        assert_eq!(http_body(&sent[4].1), "{\"result\":true,\"status\":true}");
        assert!(engine.is_drained());
    }

    #[test]
    fn pause_coalescing_one_rpc_many_callers() {
        let (engine, sent) = engine();

        for caller in 1..=3 {
            engine
                .request_pause(3500, WORKER, Carrier { connection: caller })
                .unwrap();
        }

        // Exactly one ActionPause followed by one ParametersRequest.
        {
            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert_eq!(decode_action(&sent[0].1), Action::Pause);
            assert_eq!(decode_action(&sent[1].1), Action::ParametersRequest);
        }

        engine.on_parameters_frame(3500, &worker_reply(3500, WorkerState::Paused));

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 5);
        for (connection, bytes) in &sent[2..] {
            assert!((1..=3).contains(connection));
            assert_eq!(http_body(bytes), "{\"result\":true,\"status\":true}");
        }
        assert!(engine.is_drained());
    }

    #[test]
    fn opposing_action_is_rejected_while_in_flight() {
        let (engine, _sent) = engine();
        engine
            .request_pause(3500, WORKER, Carrier { connection: 1 })
            .unwrap();
        assert!(engine.pause_in_flight(3500));
        assert!(engine
            .request_run(3500, WORKER, Carrier { connection: 2 })
            .is_err());
        // Another port is unaffected.
        assert!(engine
            .request_run(3501, WORKER, Carrier { connection: 3 })
            .is_ok());
    }

    #[test]
    fn completed_pause_clears_the_opposing_table() {
        let (engine, _sent) = engine();
        engine
            .request_pause(3500, WORKER, Carrier { connection: 1 })
            .unwrap();
        engine.on_parameters_frame(3500, &worker_reply(3500, WorkerState::Paused));
        assert!(!engine.pause_in_flight(3500));
        assert!(!engine.run_in_flight(3500));
        assert!(engine.request_run(3500, WORKER, Carrier { connection: 2 }).is_ok());
    }

    #[test]
    fn action_result_reports_state_mismatch() {
        let (engine, sent) = engine();
        engine
            .request_run(3500, WORKER, Carrier { connection: 4 })
            .unwrap();
        engine.on_parameters_frame(3500, &worker_reply(3500, WorkerState::Paused));
        let sent = sent.lock().unwrap();
        let last = sent.last().unwrap();
        assert_eq!(last.0, 4);
        assert_eq!(http_body(&last.1), "{\"result\":false,\"status\":true}");
    }

    #[test]
    fn delete_waits_for_child_death() {
        let (engine, sent) = engine();
        engine.request_delete(3500, WORKER, Carrier { connection: 1 });
        engine.request_delete(3500, WORKER, Carrier { connection: 2 });

        {
            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), 1, "delete RPC coalesced");
            assert_eq!(decode_action(&sent[0].1), Action::Delete);
        }

        engine.fail_for_port(3500);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(http_body(&sent[1].1), "{\"status\":true}");
        assert_eq!(http_body(&sent[2].1), "{\"status\":true}");
        assert!(engine.is_drained());
    }

    #[test]
    fn child_death_fails_snapshots_and_actions() {
        let (engine, sent) = engine();
        engine.request_parameters(3500, WORKER, Carrier { connection: 1 });
        engine.request_pause(3500, WORKER, Carrier { connection: 2 }).unwrap();

        engine.fail_for_port(3500);

        let sent = sent.lock().unwrap();
        let bodies: Vec<String> = sent
            .iter()
            .filter(|(connection, _)| *connection != WORKER)
            .map(|(_, bytes)| http_body(bytes))
            .collect();
        assert!(bodies.contains(&"{\"message\":\"App is terminated\",\"status\":false}".to_string()));
        assert!(!bodies.contains(&"{\"result\":false,\"status\":true}".to_string()));
        assert!(bodies.contains(&"{\"status\":false}".to_string()));
        assert!(engine.is_drained());
    }

    #[test]
    fn metadata_fan_out_identical_responses() {
        let (engine, sent) = engine();
        let hash = 0xFEED;
        engine.request_metadata(hash, Carrier { connection: 1 });
        engine.request_metadata(hash, Carrier { connection: 2 });

        engine.drain_metadata(hash, "{\"mutable\":{}}");

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(http_body(&sent[0].1), http_body(&sent[1].1));
        assert_eq!(
            http_body(&sent[0].1),
            "{\"status\":true,\"metadata\":{\"mutable\":{}}}"
        );
        assert!(engine.is_drained());
    }

    #[test]
    fn metadata_fails_when_last_instance_dies() {
        let (engine, sent) = engine();
        let hash = 0xFEED;
        engine.request_metadata(hash, Carrier { connection: 1 });
        engine.fail_metadata_for_type(hash);
        let sent = sent.lock().unwrap();
        assert_eq!(
            http_body(&sent[0].1),
            "{\"message\":\"App is terminated, metadata is not available\",\"status\":false}"
        );
        assert!(engine.is_drained());
    }

    #[test]
    fn shutdown_drain_empties_every_table() {
        let (engine, sent) = engine();
        engine.request_parameters(3500, WORKER, Carrier { connection: 1 });
        engine.request_pause(3501, WORKER, Carrier { connection: 2 }).unwrap();
        engine.request_delete(3502, WORKER, Carrier { connection: 3 });
        engine.request_metadata(7, Carrier { connection: 4 });

        engine.drain_all();
        assert!(engine.is_drained());

        let sent = sent.lock().unwrap();
        let mut paused = 0;
        let mut deleted = 0;
        for (connection, bytes) in sent.iter() {
            if *connection == WORKER {
                continue;
            }
            match http_body(bytes).as_str() {
                "{\"message\":\"Manager is paused\",\"status\":false}" => paused += 1,
                "{\"status\":true}" => deleted += 1,
                other => panic!("unexpected terminal response {other}"),
            }
        }
        assert_eq!(paused, 3);
        assert_eq!(deleted, 1);
    }

    #[test]
    fn column_schema_first_registration_wins() {
        let (engine, _sent) = engine();
        engine.register_columns(HashMap::from([(70, vec![foreproto::ScalarType::Bool])]));
        engine.register_columns(HashMap::from([(70, vec![foreproto::ScalarType::Uint64])]));
        assert_eq!(engine.column_schema(70), Some(vec![foreproto::ScalarType::Bool]));
        assert_eq!(engine.column_schema(71), None);
    }
}
