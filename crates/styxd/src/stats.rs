//! Cumulative performance counters.
//!
//! Everything here only ever goes up; operator tools sample the ctl files
//! and compute rates themselves.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter registry shared by the backend and the control namespace.
#[derive(Debug, Default)]
pub struct Stats {
    attaches: AtomicU64,
    /// Requests per operation name.
    ops: Mutex<BTreeMap<&'static str, u64>>,
    /// Requests per (user, aname) accounting bucket.
    tpools: Mutex<BTreeMap<(String, String), u64>>,
}

impl Stats {
    pub fn new() -> Stats {
        Stats::default()
    }

    pub fn count_attach(&self) {
        self.attaches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_op(&self, op: &'static str) {
        *self.ops.lock().unwrap().entry(op).or_insert(0) += 1;
    }

    pub fn count_tpool(&self, user: &str, aname: &str) {
        *self
            .tpools
            .lock()
            .unwrap()
            .entry((user.to_owned(), aname.to_owned()))
            .or_insert(0) += 1;
    }

    pub fn render_tpools(&self) -> String {
        let mut out = String::from("user aname requests\n");
        for ((user, aname), count) in self.tpools.lock().unwrap().iter() {
            let _ = writeln!(out, "{} {} {}", user, aname, count);
        }
        out
    }

    pub fn render_connections(&self) -> String {
        format!("attaches {}\n", self.attaches.load(Ordering::Relaxed))
    }

    pub fn render_rpc(&self) -> String {
        let mut out = String::new();
        for (op, count) in self.ops.lock().unwrap().iter() {
            let _ = writeln!(out, "{} {}", op, count);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_render() {
        let stats = Stats::new();
        stats.count_attach();
        stats.count_attach();
        stats.count_op("walk");
        stats.count_op("walk");
        stats.count_op("read");
        stats.count_tpool("alice", "home");

        assert_eq!(stats.render_connections(), "attaches 2\n");
        assert_eq!(stats.render_rpc(), "read 1\nwalk 2\n");
        assert_eq!(
            stats.render_tpools(),
            "user aname requests\nalice home 1\n"
        );
    }
}
