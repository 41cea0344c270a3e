//! Pipeline construction and execution.
//!
//! The builder assembles the transmit and receive queue chains for one
//! request from its route descriptor; the execution half drives the queue
//! service schedule until the connection is quiescent or complete.

use std::sync::Arc;

use http::Method;

use crate::conn::Conn;
use crate::packet::Packet;
use crate::queue::{Dir, QueueId};
use crate::route::Route;
use crate::stage::{HeadStage, Stage};

/// Whether a packet enqueue should schedule the queue for service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Schedule {
    /// Schedule the queue immediately.
    Now,
    /// Leave the queue unscheduled; something later will schedule it.
    Delayed,
}

/// Assemble the transmit pipeline for the current request.
///
/// Order: handler, matched output filters, connector. The header packet is
/// placed on the write queue before the opens run, tagged for delayed
/// service, because an `open` may complete the whole request.
pub(crate) fn create_tx_pipeline(conn: &mut Conn, route: &Arc<Route>) {
    let engine = conn.engine().clone();

    let handler = conn
        .tx
        .as_ref()
        .and_then(|tx| tx.handler.clone())
        .unwrap_or_else(|| engine.pass_handler());

    let mut pipeline: Vec<Arc<dyn Stage>> = vec![handler.clone()];
    let mut has_output_filters = false;
    for name in &route.output_stages {
        match engine.lookup_stage(name) {
            Some(stage) => {
                if stage.matches(conn, route, Dir::Tx) {
                    tracing::debug!(filter = %name, "select output filter");
                    pipeline.push(stage);
                    has_output_filters = true;
                }
            }
            None => tracing::trace!(stage = %name, "unknown output stage"),
        }
    }

    let connector = match conn.tx.as_ref().and_then(|tx| tx.connector.clone()) {
        Some(connector) => connector,
        None => {
            let is_get = conn
                .rx
                .as_ref()
                .map_or(false, |rx| rx.method == Method::GET);
            let file_handler = handler.name() == "fileHandler";
            if file_handler && is_get && !has_output_filters && !conn.secure && !conn.trace_body {
                engine.send_connector()
            } else if let Some(named) = route
                .connector
                .as_deref()
                .and_then(|name| engine.lookup_stage(name))
            {
                named
            } else {
                engine.net_connector()
            }
        }
    };
    tracing::debug!(connector = %connector.name(), "select connector");
    pipeline.push(connector.clone());

    ensure_queue_heads(conn);
    let max = conn.limits.buffer_size;
    let tx_head = tx_head(conn);
    for stage in &pipeline {
        conn.queues.append(tx_head, stage.clone(), Dir::Tx, max);
    }
    let writeq = conn.queues.next(tx_head);
    let connectorq = conn.queues.prev(tx_head);
    if let Some(tx) = conn.tx.as_mut() {
        tx.handler = Some(handler);
        tx.connector = Some(connector);
        tx.output_pipeline = pipeline;
        tx.writeq = Some(writeq);
        tx.connectorq = Some(connectorq);
    }
    pair_queues(conn);

    // The header goes on the write queue ahead of the opens so an open that
    // services and completes the request still transmits a head first.
    put_for_service(conn, writeq, Packet::header(), Schedule::Delayed);
    open_queues(conn);

    if let Some(tx) = conn.tx.as_mut() {
        tx.pipeline_complete = true;
    }
    let refinalize = conn.tx.as_ref().map_or(false, |tx| tx.refinalize);
    if refinalize {
        if let Some(tx) = conn.tx.as_mut() {
            tx.finalized = false;
            tx.refinalize = false;
        }
        conn.finalize();
    }
}

/// Assemble the receive pipeline: matched input filters, then the handler.
///
/// `readq` is the last queue, closest to the handler. Clients pair and open
/// immediately; the server side waits for the transmit builder, which opens
/// both directions together.
pub(crate) fn create_rx_pipeline(conn: &mut Conn, route: &Arc<Route>) {
    let engine = conn.engine().clone();

    let mut pipeline: Vec<Arc<dyn Stage>> = Vec::new();
    for name in &route.input_stages {
        match engine.lookup_stage(name) {
            Some(stage) => {
                if stage.matches(conn, route, Dir::Rx) {
                    tracing::debug!(filter = %name, "select input filter");
                    pipeline.push(stage);
                }
            }
            None => tracing::trace!(stage = %name, "unknown input stage"),
        }
    }
    let handler = conn
        .tx
        .as_ref()
        .and_then(|tx| tx.handler.clone())
        .unwrap_or_else(|| engine.pass_handler());
    pipeline.push(handler);

    ensure_queue_heads(conn);
    let max = conn.limits.buffer_size;
    let rx_head = rx_head(conn);
    for stage in &pipeline {
        conn.queues.append(rx_head, stage.clone(), Dir::Rx, max);
    }
    let readq = conn.queues.prev(rx_head);
    if let Some(rx) = conn.rx.as_mut() {
        rx.input_pipeline = pipeline;
        rx.readq = Some(readq);
    }
    if !conn.endpoint {
        pair_queues(conn);
        open_queues(conn);
    }
}

fn ensure_queue_heads(conn: &mut Conn) {
    let needs = conn.tx.as_ref().map_or(false, |tx| tx.heads.is_none());
    if needs {
        let max = conn.limits.buffer_size;
        let head_stage: Arc<dyn Stage> = Arc::new(HeadStage);
        let tx_head = conn.queues.create_head(head_stage.clone(), Dir::Tx, max);
        let rx_head = conn.queues.create_head(head_stage, Dir::Rx, max);
        if let Some(tx) = conn.tx.as_mut() {
            tx.heads = Some([tx_head, rx_head]);
        }
    }
}

pub(crate) fn tx_head(conn: &Conn) -> QueueId {
    conn.tx
        .as_ref()
        .and_then(|tx| tx.heads)
        .map(|heads| heads[Dir::Tx.index()])
        .unwrap_or(QueueId(0))
}

pub(crate) fn rx_head(conn: &Conn) -> QueueId {
    conn.tx
        .as_ref()
        .and_then(|tx| tx.heads)
        .map(|heads| heads[Dir::Rx.index()])
        .unwrap_or(QueueId(0))
}

/// Cross-link each transmit queue with the receive queue of the same stage.
/// Pairing is idempotent and never implies ownership.
fn pair_queues(conn: &mut Conn) {
    let heads = match conn.tx.as_ref().and_then(|tx| tx.heads) {
        Some(heads) => heads,
        None => return,
    };
    let tx_chain = conn.queues.chain(heads[Dir::Tx.index()]);
    let rx_chain = conn.queues.chain(heads[Dir::Rx.index()]);
    for &q in &tx_chain {
        if conn.queues.get(q).pair.is_some() {
            continue;
        }
        for &rq in &rx_chain {
            let same = Arc::ptr_eq(&conn.queues.get(q).stage, &conn.queues.get(rq).stage);
            if same {
                conn.queues.get_mut(q).pair = Some(rq);
                conn.queues.get_mut(rq).pair = Some(q);
            }
        }
    }
}

/// Run `open` on every queue not yet open, once per stage across a pair.
fn open_queues(conn: &mut Conn) {
    let heads = match conn.tx.as_ref().and_then(|tx| tx.heads) {
        Some(heads) => heads,
        None => return,
    };
    for head in heads {
        for q in conn.queues.chain(head) {
            if conn.queues.get(q).open {
                continue;
            }
            let pair_open = conn
                .queues
                .get(q)
                .pair
                .map_or(false, |pair| conn.queues.get(pair).open);
            if !pair_open {
                conn.queues.get_mut(q).open = true;
                let stage = conn.queues.get(q).stage.clone();
                stage.open(conn, q);
            }
        }
    }
}

/// Start every stage of the request, connector first, handler last.
pub(crate) fn start_pipeline(conn: &mut Conn) {
    if let Some(tx) = conn.tx.as_mut() {
        tx.started = true;
    }
    let need_input = conn
        .rx
        .as_ref()
        .map_or(false, |rx| rx.need_input_pipeline);
    if need_input {
        // Walk the receive chain head-forward, skipping the final (handler)
        // queue: the handler starts once, from the transmit side below.
        let head = rx_head(conn);
        let chain = conn.queues.chain(head);
        for &q in chain.iter().take(chain.len().saturating_sub(1)) {
            if conn.error {
                break;
            }
            if conn.queues.get(q).started {
                continue;
            }
            let pair_started = conn
                .queues
                .get(q)
                .pair
                .map_or(false, |pair| conn.queues.get(pair).started);
            if !pair_started {
                conn.queues.get_mut(q).started = true;
                let stage = conn.queues.get(q).stage.clone();
                stage.start(conn, q);
            }
        }
    }

    // Transmit side tail-backward: connector first, handler last.
    let head = tx_head(conn);
    let chain = conn.queues.chain(head);
    for &q in chain.iter().skip(1).rev() {
        if conn.error {
            break;
        }
        if conn.queues.get(q).started {
            continue;
        }
        conn.queues.get_mut(q).started = true;
        let stage = conn.queues.get(q).stage.clone();
        stage.start(conn, q);
    }
    if let Some(&handlerq) = chain.first() {
        if !conn.error && !conn.queues.get(handlerq).started {
            conn.queues.get_mut(handlerq).started = true;
            let stage = conn.queues.get(handlerq).stage.clone();
            stage.start(conn, handlerq);
        }
    }

    // With no body expected the handler would never see a writable edge
    // from content arrival, so synthesize one now.
    let connector_complete = conn
        .tx
        .as_ref()
        .map_or(false, |tx| tx.connector_complete);
    let no_body = conn.rx.as_ref().map_or(true, |rx| {
        rx.remaining_content == 0 && !rx.chunked
    });
    if !conn.error && !connector_complete && no_body {
        conn.notify(crate::conn::Event::Io(crate::conn::IoEvent::Writable));
    }
}

/// Invoke the handler's `ready` callback.
pub(crate) fn ready_handler(conn: &mut Conn) {
    let writeq = match conn.tx.as_ref().and_then(|tx| tx.writeq) {
        Some(q) => q,
        None => return,
    };
    if !conn.error {
        let stage = conn.queues.get(writeq).stage.clone();
        stage.ready(conn, writeq);
    }
}

/// Drive the handler's `writable` callback and service anything it wrote.
///
/// Returns false when the handler has no writable capability.
pub(crate) fn pump_handler(conn: &mut Conn) -> bool {
    let writeq = match conn.tx.as_ref().and_then(|tx| tx.writeq) {
        Some(q) => q,
        None => return false,
    };
    if !conn.tx.as_ref().map_or(false, |tx| tx.started) {
        return false;
    }
    if conn.tx.as_ref().map_or(true, |tx| tx.finalized) {
        return true;
    }
    let stage = conn.queues.get(writeq).stage.clone();
    if !stage.writable(conn, writeq) {
        return false;
    }
    if conn.queues.get(writeq).count > 0 {
        conn.queues.schedule(writeq);
        service_queues(conn);
    }
    true
}

/// Run queue service routines until there is no more work to be done.
///
/// A queue already being serviced is flagged for re-service instead of
/// being entered reentrantly. All I/O behind this loop is non-blocking.
pub(crate) fn service_queues(conn: &mut Conn) -> bool {
    let mut work_done = false;
    while conn.state() < crate::conn::State::Complete {
        let q = match conn.queues.next_for_service() {
            Some(q) => q,
            None => break,
        };
        if conn.queues.get(q).servicing {
            conn.queues.get_mut(q).reservice = true;
        } else {
            service_queue(conn, q);
            work_done = true;
        }
    }
    work_done
}

fn service_queue(conn: &mut Conn, q: QueueId) {
    conn.queues.get_mut(q).servicing = true;
    let stage = conn.queues.get(q).stage.clone();
    match conn.queues.get(q).dir {
        Dir::Tx => stage.outgoing_service(conn, q),
        Dir::Rx => stage.incoming_service(conn, q),
    }
    let queue = conn.queues.get_mut(q);
    queue.servicing = false;
    if queue.reservice {
        queue.reservice = false;
        conn.queues.schedule(q);
    }
}

/// Enqueue a packet on a queue, optionally scheduling it for service.
pub(crate) fn put_for_service(conn: &mut Conn, q: QueueId, packet: Packet, when: Schedule) {
    conn.queues.put(q, packet);
    if when == Schedule::Now {
        conn.queues.schedule(q);
    }
}

/// Default service routine: forward buffered packets to the next queue in
/// the direction of travel. The final queue of a chain retains its packets
/// (that is where the handler reads from).
pub(crate) fn default_service(conn: &mut Conn, q: QueueId) {
    let dir = conn.queues.get(q).dir;
    loop {
        let next = conn.queues.next(q);
        if conn.queues.is_head(next) {
            break;
        }
        let packet = match conn.queues.take(q) {
            Some(packet) => packet,
            None => break,
        };
        let stage = conn.queues.get(next).stage.clone();
        match dir {
            Dir::Tx => stage.outgoing(conn, next, packet),
            Dir::Rx => stage.incoming(conn, next, packet),
        }
    }
}

/// Close every open queue in both directions, exactly once each.
pub(crate) fn destroy_pipeline(conn: &mut Conn) {
    let heads = match conn.tx.as_ref().and_then(|tx| tx.heads) {
        Some(heads) => heads,
        None => return,
    };
    for head in heads {
        for q in conn.queues.chain(head) {
            if conn.queues.get(q).open {
                conn.queues.get_mut(q).open = false;
                let stage = conn.queues.get(q).stage.clone();
                stage.close(conn, q);
            }
        }
    }
}

/// Drop buffered packets from every queue in one direction without
/// invoking any stage. Used by the abort protocol. Returns the number of
/// payload bytes dropped.
pub(crate) fn discard_data(conn: &mut Conn, dir: Dir) -> usize {
    let head = match dir {
        Dir::Tx => tx_head(conn),
        Dir::Rx => rx_head(conn),
    };
    if conn.tx.as_ref().and_then(|tx| tx.heads).is_none() {
        return 0;
    }
    let mut dropped = 0;
    for q in conn.queues.chain(head) {
        dropped += conn.queues.get(q).count;
        conn.queues.discard(q);
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::State;
    use crate::engine::Engine;
    use crate::mock::MockTransport;

    fn conn_with(input: &[u8]) -> crate::ConnRef {
        let engine = Engine::new();
        let (transport, _state) = MockTransport::pair();
        let conn = engine.accept(transport).expect("accept");
        conn.lock().unwrap().input(input).expect("input");
        conn
    }

    /// Head plus a partial body: the pipeline is built but still live.
    fn live_conn() -> crate::ConnRef {
        conn_with(b"POST /up HTTP/1.1\r\nContent-Length: 5\r\n\r\nhe")
    }

    #[test]
    fn pairs_are_symmetric_and_share_stages() {
        let conn = live_conn();
        let conn = conn.lock().unwrap();
        let heads = conn.tx.as_ref().unwrap().heads.unwrap();
        let mut paired = 0;
        for head in heads {
            for q in conn.queues.chain(head) {
                if let Some(pq) = conn.queues.get(q).pair {
                    paired += 1;
                    assert_eq!(conn.queues.get(pq).pair, Some(q));
                    assert!(std::sync::Arc::ptr_eq(
                        &conn.queues.get(q).stage,
                        &conn.queues.get(pq).stage
                    ));
                }
            }
        }
        // The pass handler and chunk filter appear in both directions.
        assert!(paired >= 4);
    }

    #[test]
    fn open_runs_once_per_pair() {
        let conn = live_conn();
        let conn = conn.lock().unwrap();
        assert_eq!(conn.state(), State::Content);
        let heads = conn.tx.as_ref().unwrap().heads.unwrap();
        for head in heads {
            for q in conn.queues.chain(head) {
                match conn.queues.get(q).pair {
                    // Exactly one side of a pair carries the open flag.
                    Some(pq) => {
                        assert!(conn.queues.get(q).open ^ conn.queues.get(pq).open)
                    }
                    None => assert!(conn.queues.get(q).open),
                }
            }
        }
    }

    #[test]
    fn queues_close_by_completion() {
        let conn = conn_with(b"POST /up HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        let conn = conn.lock().unwrap();
        assert_eq!(conn.state(), State::Complete);
        assert!(!conn.has_error(), "{:?}", conn.error_message());
        let heads = conn.tx.as_ref().unwrap().heads.unwrap();
        for head in heads {
            for q in conn.queues.chain(head) {
                assert!(!conn.queues.get(q).open);
            }
        }
    }
}
