//! Derived, read-only views over the canonical table: sorting, selection and
//! the row set handed to copy/export.

use std::collections::BTreeSet;

use crate::reconciler::CanonicalTable;
use crate::types::{ProbeStatus, ResultRecord, SortKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Sort and selection state owned by one client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewState {
    sort: Option<(SortKey, Direction)>,
    selection: BTreeSet<u64>,
}

impl ViewState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort(&self) -> Option<(SortKey, Direction)> {
        self.sort
    }

    pub fn selection(&self) -> &BTreeSet<u64> {
        &self.selection
    }

    pub fn set_sort(&mut self, sort: Option<(SortKey, Direction)>) {
        self.sort = sort;
    }

    /// Column header click: a new key sorts ascending, the current ascending
    /// key flips to descending, anything else goes back to ascending.
    pub fn toggle_sort(&mut self, key: SortKey) {
        let direction = match self.sort {
            Some((k, Direction::Asc)) if k == key => Direction::Desc,
            _ => Direction::Asc,
        };
        self.sort = Some((key, direction));
    }

    /// Row click. Without the modifier the selection becomes `{id}`; with it
    /// `id` is toggled in or out.
    pub fn click(&mut self, id: u64, modifier: bool) {
        if modifier {
            if !self.selection.remove(&id) {
                self.selection.insert(id);
            }
        } else {
            self.selection.clear();
            self.selection.insert(id);
        }
    }

    /// Right click selects exactly the row unless it is already selected.
    pub fn context_click(&mut self, id: u64) {
        if !self.selection.contains(&id) {
            self.selection.clear();
            self.selection.insert(id);
        }
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    pub fn reset(&mut self) {
        self.sort = None;
        self.selection.clear();
    }

    /// Rows in display order. Sorting is stable: equal keys keep arrival order.
    pub fn project<'a>(&self, table: &'a CanonicalTable) -> Vec<&'a ResultRecord> {
        let mut rows: Vec<&ResultRecord> = table.rows().iter().collect();
        if let Some((key, direction)) = self.sort {
            rows.sort_by(|a, b| {
                let ord = a.cmp_by(b, key);
                match direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            });
        }
        rows
    }

    /// Rows an export or copy acts on: the selected rows if any are
    /// selected, otherwise every displayed row, always in display order.
    pub fn action_rows<'a>(&self, table: &'a CanonicalTable) -> Vec<&'a ResultRecord> {
        let rows = self.project(table);
        if self.selection.is_empty() {
            return rows;
        }
        rows.into_iter()
            .filter(|r| self.selection.contains(&r.id))
            .collect()
    }

    /// Clipboard text for the selected rows, `None` when nothing is selected.
    pub fn clipboard_text(&self, table: &CanonicalTable) -> Option<String> {
        if self.selection.is_empty() {
            return None;
        }
        Some(clipboard_lines(&self.action_rows(table)))
    }
}

/// `address\tusername\tpassword\tdetails`, one row per line.
pub fn clipboard_lines(rows: &[&ResultRecord]) -> String {
    rows.iter()
        .map(|r| format!("{}\t{}\t{}\t{}", r.address, r.username, r.password, r.details))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Status bar counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub success: usize,
    pub failed: usize,
    pub pending: usize,
}

impl Summary {
    pub fn of(table: &CanonicalTable) -> Self {
        Self {
            success: table.count(ProbeStatus::Success),
            failed: table.count(ProbeStatus::Failed),
            pending: table.count(ProbeStatus::Pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FailureReason;

    fn table() -> CanonicalTable {
        let mut t = CanonicalTable::new();
        t.upsert(ResultRecord::failed(1, "10.0.0.5", FailureReason::Timeout));
        t.upsert(ResultRecord::success(2, "10.0.0.2", "root", "admin", "OpenWrt"));
        t.upsert(ResultRecord::pending(3, "10.0.0.9"));
        t.upsert(ResultRecord::success(4, "10.0.0.1", "admin", "admin", "OpenWrt"));
        t.upsert(ResultRecord::failed(5, "10.0.0.3", FailureReason::AuthRejected));
        t
    }

    fn ids(rows: &[&ResultRecord]) -> Vec<u64> {
        rows.iter().map(|r| r.id).collect()
    }

    #[test]
    fn status_sort_uses_ordinal_and_is_stable() {
        let t = table();
        let mut view = ViewState::new();
        view.toggle_sort(SortKey::Status);
        assert_eq!(ids(&view.project(&t)), vec![2, 4, 1, 5, 3]);

        view.toggle_sort(SortKey::Status);
        assert_eq!(view.sort(), Some((SortKey::Status, Direction::Desc)));
        // Ties keep arrival order in both directions.
        assert_eq!(ids(&view.project(&t)), vec![3, 1, 5, 2, 4]);

        view.toggle_sort(SortKey::Status);
        assert_eq!(view.sort(), Some((SortKey::Status, Direction::Asc)));
    }

    #[test]
    fn address_sort() {
        let t = table();
        let mut view = ViewState::new();
        view.toggle_sort(SortKey::Address);
        assert_eq!(ids(&view.project(&t)), vec![4, 2, 5, 1, 3]);
    }

    #[test]
    fn click_semantics() {
        let mut view = ViewState::new();
        view.click(2, false);
        view.click(3, true);
        assert_eq!(view.selection().iter().copied().collect::<Vec<_>>(), vec![2, 3]);
        view.click(2, true);
        assert_eq!(view.selection().iter().copied().collect::<Vec<_>>(), vec![3]);
        view.click(5, false);
        assert_eq!(view.selection().iter().copied().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn context_click_keeps_existing_selection() {
        let mut view = ViewState::new();
        view.click(1, false);
        view.click(2, true);
        view.context_click(2);
        assert_eq!(view.selection().len(), 2);
        view.context_click(4);
        assert_eq!(view.selection().iter().copied().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn copy_follows_display_order() {
        let t = table();
        let mut view = ViewState::new();
        view.click(2, false);
        view.click(3, true);
        assert_eq!(
            view.clipboard_text(&t).unwrap(),
            "10.0.0.2\troot\tadmin\tOpenWrt\n10.0.0.9\t\t\t"
        );

        view.toggle_sort(SortKey::Status);
        view.toggle_sort(SortKey::Status);
        let text = view.clipboard_text(&t).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("10.0.0.9\t"));
        assert!(lines[1].starts_with("10.0.0.2\t"));
    }

    #[test]
    fn nothing_selected_means_no_copy_but_full_export() {
        let t = table();
        let view = ViewState::new();
        assert!(view.clipboard_text(&t).is_none());
        assert_eq!(view.action_rows(&t).len(), 5);
    }

    #[test]
    fn summary_counts() {
        let s = Summary::of(&table());
        assert_eq!(s, Summary { success: 2, failed: 2, pending: 1 });
    }
}
