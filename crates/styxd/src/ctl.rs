//! The reserved `ctl` attach name: a read-only synthetic directory of
//! plain-text counter files for operator tooling.

use std::sync::Arc;

use styx::error::{Error, errno::*};
use styx::{DirEntry, DirEntryData, GetattrMask, Qid, QidType, Stat, Time};
use styx::Result;

use crate::stats::Stats;

/// File names served under the control root.
pub const CTL_FILES: [&str; 4] = ["tpools", "connections", "meminfo", "net.rpc.nfs"];

/// Attach names that select the control namespace.
pub fn is_ctl_aname(aname: &str) -> bool {
    aname == "ctl" || aname == "/diodctl"
}

/// A node in the control tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CtlNode {
    Root,
    File(usize),
}

impl CtlNode {
    pub fn by_name(name: &str) -> Option<CtlNode> {
        CTL_FILES
            .iter()
            .position(|f| *f == name)
            .map(CtlNode::File)
    }

    pub fn qid(&self) -> Qid {
        match self {
            CtlNode::Root => Qid {
                typ: QidType::DIR,
                version: 0,
                path: 1,
            },
            CtlNode::File(i) => Qid {
                typ: QidType::FILE,
                version: 0,
                path: 2 + *i as u64,
            },
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, CtlNode::Root)
    }

    /// Synthetic attributes: read-only, owned by the server.
    pub fn stat(&self, size: u64) -> (GetattrMask, Qid, Stat) {
        let mode = if self.is_dir() { 0o040555 } else { 0o100444 };
        let stat = Stat {
            mode,
            uid: 0,
            gid: 0,
            nlink: 1,
            rdev: 0,
            size,
            blksize: 4096,
            blocks: size.div_ceil(512),
            atime: Time::default(),
            mtime: Time::default(),
            ctime: Time::default(),
        };
        (GetattrMask::BASIC, self.qid(), stat)
    }
}

/// Render the content snapshot a ctl file serves for one open.
pub fn render(node: CtlNode, stats: &Arc<Stats>) -> Result<Vec<u8>> {
    let CtlNode::File(i) = node else {
        return Err(Error::No(EISDIR));
    };
    let text = match CTL_FILES[i] {
        "tpools" => stats.render_tpools(),
        "connections" => stats.render_connections(),
        "meminfo" => std::fs::read_to_string("/proc/meminfo")
            .unwrap_or_else(|_| "meminfo unavailable\n".to_owned()),
        _ => stats.render_rpc(),
    };
    Ok(text.into_bytes())
}

/// Directory listing of the control root. Offsets are entry indexes, so a
/// resumed read skips what was already delivered.
pub fn readdir(offset: u64, count: u32) -> DirEntryData {
    let mut data = DirEntryData::new();

    let all: Vec<DirEntry> = std::iter::repeat_n(CtlNode::Root, 2)
        .zip([".", ".."])
        .map(|(node, name)| (node.qid(), name.to_owned()))
        .chain(
            CTL_FILES
                .iter()
                .enumerate()
                .map(|(i, name)| (CtlNode::File(i).qid(), (*name).to_owned())),
        )
        .enumerate()
        .map(|(i, (qid, name))| DirEntry {
            qid,
            offset: i as u64 + 1,
            typ: 0,
            name,
        })
        .collect();

    for entry in all.into_iter().skip(offset as usize) {
        if data.size() + entry.size() > count {
            break;
        }
        data.push(entry);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodes_resolve_by_name() {
        assert_eq!(CtlNode::by_name("tpools"), Some(CtlNode::File(0)));
        assert_eq!(CtlNode::by_name("net.rpc.nfs"), Some(CtlNode::File(3)));
        assert_eq!(CtlNode::by_name("bogus"), None);
    }

    #[test]
    fn qids_are_distinct_and_typed() {
        let mut paths: Vec<u64> = CTL_FILES
            .iter()
            .enumerate()
            .map(|(i, _)| CtlNode::File(i).qid().path)
            .collect();
        paths.push(CtlNode::Root.qid().path);
        paths.sort_unstable();
        paths.dedup();
        assert_eq!(paths.len(), CTL_FILES.len() + 1);

        assert!(CtlNode::Root.qid().typ.contains(QidType::DIR));
        assert!(!CtlNode::File(0).qid().typ.contains(QidType::DIR));
    }

    #[test]
    fn render_produces_counter_text() {
        let stats = Arc::new(Stats::new());
        stats.count_op("read");

        let tpools = render(CtlNode::File(0), &stats).unwrap();
        assert!(tpools.starts_with(b"user aname requests"));

        let rpc = render(CtlNode::File(3), &stats).unwrap();
        assert_eq!(rpc, b"read 1\n");

        assert!(render(CtlNode::Root, &stats).is_err());
    }

    #[test]
    fn readdir_resumes_at_entry_boundaries() {
        let full = readdir(0, u32::MAX);
        assert_eq!(full.entries.len(), 2 + CTL_FILES.len());
        assert_eq!(full.entries[0].name, ".");
        assert_eq!(full.entries.last().unwrap().name, "net.rpc.nfs");

        let resumed = readdir(full.entries[2].offset, u32::MAX);
        assert_eq!(resumed.entries.first().unwrap().name, CTL_FILES[1]);

        // a tight budget cuts at an entry boundary
        let tight = readdir(0, full.entries[0].size() + 1);
        assert_eq!(tight.entries.len(), 1);
    }
}
