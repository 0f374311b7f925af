//! Client-side folding of the event stream into a canonical result table.

use std::collections::HashMap;

use crate::projection::ViewState;
use crate::types::{ProbeStatus, ResultRecord, ScanEvent};

/// Id-indexed, insertion-ordered store of result rows.
///
/// Upserting an existing id replaces the row where it already sits, so a
/// pending row upgraded to its terminal status keeps its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalTable {
    rows: Vec<ResultRecord>,
    index: HashMap<u64, usize>,
}

/// What an upsert did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Appended,
    Replaced,
    /// Terminal rows are immutable; the incoming record was discarded.
    Ignored,
}

impl CanonicalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, record: ResultRecord) -> Upsert {
        match self.index.get(&record.id) {
            Some(&pos) => {
                if self.rows[pos].status.is_terminal() {
                    return Upsert::Ignored;
                }
                self.rows[pos] = record;
                Upsert::Replaced
            }
            None => {
                self.index.insert(record.id, self.rows.len());
                self.rows.push(record);
                Upsert::Appended
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<&ResultRecord> {
        self.index.get(&id).map(|&pos| &self.rows[pos])
    }

    pub fn rows(&self) -> &[ResultRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
    }

    pub fn count(&self, status: ProbeStatus) -> usize {
        self.rows.iter().filter(|r| r.status == status).count()
    }
}

/// Connection indicator shown next to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected,
    Disconnected { attempt: u32 },
}

/// Per-client state machine over the event stream.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    table: CanonicalTable,
    scanning: bool,
    /// Server session the table belongs to, once known.
    session: Option<u64>,
    connection: ConnectionState,
    view: ViewState,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the canonical state.
    ///
    /// A status for a different session id, or a `scanning: true` arriving
    /// while idle, marks a new session and resets the table before any of
    /// its results land. Result ids restart with every session.
    pub fn apply(&mut self, event: ScanEvent) {
        match event {
            ScanEvent::Status(status) => {
                let switched = match (status.session_id, self.session) {
                    (Some(id), Some(known)) => id != known,
                    _ => status.scanning && !self.scanning,
                };
                if switched {
                    self.begin_session();
                }
                if status.session_id.is_some() {
                    self.session = status.session_id;
                }
                self.scanning = status.scanning;
            }
            ScanEvent::Result(record) => {
                self.table.upsert(record);
            }
        }
    }

    /// Local "start scan" action: drop old results and derived view state.
    pub fn begin_session(&mut self) {
        self.table.clear();
        self.view.reset();
    }

    /// Adopt the server's `session` wholesale, e.g. after reconnecting into
    /// a session whose start was missed. Rows are expected to follow.
    pub fn join_session(&mut self, session: u64, scanning: bool) {
        self.begin_session();
        self.session = Some(session);
        self.scanning = scanning;
    }

    pub fn session(&self) -> Option<u64> {
        self.session
    }

    pub fn set_connection(&mut self, state: ConnectionState) {
        self.connection = state;
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn table(&self) -> &CanonicalTable {
        &self.table
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut ViewState {
        &mut self.view
    }

    /// Rows in current display order.
    pub fn displayed(&self) -> Vec<&ResultRecord> {
        self.view.project(&self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FailureReason, SortKey};

    fn result(r: ResultRecord) -> ScanEvent {
        ScanEvent::Result(r)
    }

    #[test]
    fn pending_upgraded_in_place() {
        let mut rec = Reconciler::new();
        rec.apply(ScanEvent::scanning(true));
        rec.apply(result(ResultRecord::pending(1, "10.0.0.1")));
        rec.apply(result(ResultRecord::pending(2, "10.0.0.2")));
        rec.apply(result(ResultRecord::success(1, "10.0.0.1", "root", "admin", "OpenWrt")));

        let rows = rec.table().rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[0].status, ProbeStatus::Success);
        assert_eq!(rows[0].username, "root");
        assert_eq!(rows[1].id, 2);
    }

    #[test]
    fn terminal_rows_are_immutable() {
        let mut table = CanonicalTable::new();
        table.upsert(ResultRecord::failed(4, "a", FailureReason::Timeout));
        assert_eq!(table.upsert(ResultRecord::pending(4, "a")), Upsert::Ignored);
        assert_eq!(
            table.upsert(ResultRecord::success(4, "a", "u", "p", "d")),
            Upsert::Ignored
        );
        assert_eq!(table.get(4).map(|r| r.status), Some(ProbeStatus::Failed));
    }

    #[test]
    fn out_of_order_completion_keeps_arrival_order() {
        let mut rec = Reconciler::new();
        rec.apply(ScanEvent::scanning(true));
        for id in 1..=3 {
            rec.apply(result(ResultRecord::pending(id, format!("h{id}"))));
        }
        rec.apply(result(ResultRecord::failed(3, "h3", FailureReason::ConnectionRefused)));
        rec.apply(result(ResultRecord::failed(1, "h1", FailureReason::Timeout)));
        let ids: Vec<u64> = rec.table().rows().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(rec.table().count(ProbeStatus::Pending), 1);
    }

    #[test]
    fn new_session_resets_table_and_view() {
        let mut rec = Reconciler::new();
        rec.apply(ScanEvent::scanning(true));
        rec.apply(result(ResultRecord::pending(1, "a")));
        rec.view_mut().toggle_sort(SortKey::Address);
        rec.view_mut().click(1, false);
        rec.apply(ScanEvent::scanning(false));
        // Finished session stays visible.
        assert_eq!(rec.table().len(), 1);

        rec.apply(ScanEvent::scanning(true));
        assert!(rec.table().is_empty());
        assert!(rec.view().sort().is_none());
        assert!(rec.view().selection().is_empty());
    }

    #[test]
    fn repeated_scanning_true_does_not_clear() {
        let mut rec = Reconciler::new();
        rec.apply(ScanEvent::scanning(true));
        rec.apply(result(ResultRecord::pending(1, "a")));
        rec.apply(ScanEvent::scanning(true));
        assert_eq!(rec.table().len(), 1);
    }

    #[test]
    fn missed_session_change_is_caught_by_session_id() {
        let mut rec = Reconciler::new();
        rec.apply(ScanEvent::session_status(1, true));
        rec.apply(result(ResultRecord::failed(1, "old.lan", FailureReason::Timeout)));
        // The old session's end and the new one's start were both missed;
        // the next status names another session.
        rec.apply(ScanEvent::session_status(2, true));
        rec.apply(result(ResultRecord::pending(1, "new.lan")));
        rec.apply(result(ResultRecord::success(1, "new.lan", "root", "admin", "OpenWrt")));

        assert_eq!(rec.session(), Some(2));
        assert_eq!(rec.table().len(), 1);
        let row = rec.table().get(1).unwrap();
        assert_eq!(row.address, "new.lan");
        assert_eq!(row.status, ProbeStatus::Success);
    }

    #[test]
    fn same_session_status_keeps_rows() {
        let mut rec = Reconciler::new();
        rec.apply(ScanEvent::session_status(4, true));
        rec.apply(result(ResultRecord::pending(1, "a.lan")));
        rec.apply(ScanEvent::session_status(4, false));
        assert_eq!(rec.table().len(), 1);
        assert!(!rec.is_scanning());
    }

    #[test]
    fn join_session_replaces_stale_table() {
        let mut rec = Reconciler::new();
        rec.apply(ScanEvent::session_status(1, true));
        rec.apply(result(ResultRecord::failed(1, "old.lan", FailureReason::Timeout)));
        rec.view_mut().click(1, false);

        rec.join_session(3, false);
        assert!(rec.table().is_empty());
        assert!(rec.view().selection().is_empty());
        assert_eq!(rec.session(), Some(3));
        rec.apply(result(ResultRecord::success(1, "new.lan", "root", "admin", "OpenWrt")));
        assert_eq!(rec.table().get(1).unwrap().address, "new.lan");
    }
}
