//! Peer directory: identity -> record, insertion-ordered, with the snapshot text encoding.
//!
//! The registry owns the only writable directory. Peers rebuild a follower copy from every
//! snapshot they receive and never merge deltas into it (apart from their own optimistic offers).

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Per-identity state: address, ports, online flag, offered files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub identity: String,
    pub address: IpAddr,
    pub control_port: u16,
    pub transfer_port: u16,
    pub online: bool,
    files: Vec<String>,
}

impl PeerRecord {
    fn new(identity: &str, address: IpAddr, control_port: u16, transfer_port: u16) -> Self {
        Self {
            identity: identity.to_string(),
            address,
            control_port,
            transfer_port,
            online: true,
            files: Vec::new(),
        }
    }

    /// Offered file names, in the order they were first offered.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn offers(&self, file_name: &str) -> bool {
        self.files.iter().any(|f| f == file_name)
    }

    /// Where this peer receives control datagrams.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.control_port)
    }

    /// Where this peer's transfer service listens.
    pub fn transfer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.transfer_port)
    }

    /// Merge names into the file set. Returns the names that were not already present.
    fn merge_files<I, S>(&mut self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = Vec::new();
        for name in names {
            let name = name.as_ref();
            if !self.offers(name) {
                self.files.push(name.to_string());
                added.push(name.to_string());
            }
        }
        added
    }

    fn encode_line(&self, out: &mut String) {
        out.push_str(&self.identity);
        out.push(' ');
        out.push_str(&self.address.to_string());
        out.push(' ');
        out.push_str(&self.control_port.to_string());
        out.push(' ');
        out.push_str(&self.transfer_port.to_string());
        out.push(' ');
        out.push(if self.online { '1' } else { '0' });
        for file in &self.files {
            out.push(' ');
            out.push_str(file);
        }
    }

    fn decode_line(line_no: usize, line: &str) -> Result<Self, SnapshotError> {
        let mut tokens = line.split_whitespace();
        let mut field = |name: &'static str| {
            tokens
                .next()
                .ok_or(SnapshotError::MissingField { line: line_no, field: name })
        };
        let identity = field("identity")?.to_string();
        let address = field("address")?
            .parse()
            .map_err(|_| SnapshotError::BadAddress { line: line_no })?;
        let control_port = field("control port")?
            .parse()
            .map_err(|_| SnapshotError::BadPort { line: line_no })?;
        let transfer_port = field("transfer port")?
            .parse()
            .map_err(|_| SnapshotError::BadPort { line: line_no })?;
        let online = match field("online flag")? {
            "1" => true,
            "0" => false,
            _ => return Err(SnapshotError::BadOnlineFlag { line: line_no }),
        };
        let mut record = Self {
            identity,
            address,
            control_port,
            transfer_port,
            online,
            files: Vec::new(),
        };
        record.merge_files(tokens);
        Ok(record)
    }
}

/// Full text encoding of a directory at one point in time.
/// Compared by value on peers to detect real changes between broadcasts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Snapshot(String);

impl Snapshot {
    /// Wrap snapshot text received off the wire. Validity is checked by [`Directory::from_snapshot`].
    pub fn from_text(text: impl Into<String>) -> Self {
        Snapshot(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity -> record mapping. Records are never removed; order is first-registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    records: Vec<PeerRecord>,
    index: HashMap<String, usize>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `identity` online at the given address, creating the record if absent.
    /// A previously seen identity keeps its file set. Fails with `Conflict` if already online.
    pub fn upsert(
        &mut self,
        identity: &str,
        address: IpAddr,
        control_port: u16,
        transfer_port: u16,
    ) -> Result<&PeerRecord, DirectoryError> {
        match self.index.get(identity) {
            Some(&i) => {
                let record = &mut self.records[i];
                if record.online {
                    return Err(DirectoryError::Conflict(identity.to_string()));
                }
                record.address = address;
                record.control_port = control_port;
                record.transfer_port = transfer_port;
                record.online = true;
                Ok(&self.records[i])
            }
            None => {
                let i = self.records.len();
                self.records
                    .push(PeerRecord::new(identity, address, control_port, transfer_port));
                self.index.insert(identity.to_string(), i);
                Ok(&self.records[i])
            }
        }
    }

    /// Flip the online flag off. The record and its files stay.
    pub fn set_offline(&mut self, identity: &str) -> Result<(), DirectoryError> {
        let record = self.get_mut(identity)?;
        record.online = false;
        Ok(())
    }

    /// Merge file names into a record, ignoring ones already present. Returns the names added.
    pub fn add_files<I, S>(&mut self, identity: &str, names: I) -> Result<Vec<String>, DirectoryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(self.get_mut(identity)?.merge_files(names))
    }

    /// Encode every record, one line each, in insertion order.
    pub fn snapshot(&self) -> Snapshot {
        let mut out = String::new();
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            record.encode_line(&mut out);
        }
        Snapshot(out)
    }

    /// Rebuild a follower directory from a snapshot. Blank lines are skipped.
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, SnapshotError> {
        let mut dir = Directory::new();
        for (line_no, line) in snapshot.as_str().lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = PeerRecord::decode_line(line_no + 1, line)?;
            if dir.index.contains_key(&record.identity) {
                return Err(SnapshotError::DuplicateIdentity(record.identity));
            }
            dir.index.insert(record.identity.clone(), dir.records.len());
            dir.records.push(record);
        }
        Ok(dir)
    }

    /// Exact (case-sensitive) lookup.
    pub fn get(&self, identity: &str) -> Option<&PeerRecord> {
        self.index.get(identity).map(|&i| &self.records[i])
    }

    /// Lookup ignoring case (Unicode lowercase folding). An exact match wins, then the first
    /// case-insensitive match in insertion order.
    pub fn find_case_insensitive(&self, identity: &str) -> Option<&PeerRecord> {
        self.get(identity).or_else(|| {
            let wanted = identity.to_lowercase();
            self.records
                .iter()
                .find(|r| r.identity.to_lowercase() == wanted)
        })
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.index.contains_key(identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.iter()
    }

    pub fn online_peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.iter().filter(|r| r.online)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every (file, owner) pair, sorted by file then owner.
    pub fn offered_files(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .records
            .iter()
            .flat_map(|r| r.files.iter().map(move |f| (f.as_str(), r.identity.as_str())))
            .collect();
        out.sort_unstable();
        out
    }

    fn get_mut(&mut self, identity: &str) -> Result<&mut PeerRecord, DirectoryError> {
        match self.index.get(identity) {
            Some(&i) => Ok(&mut self.records[i]),
            None => Err(DirectoryError::UnknownPeer(identity.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("identity {0:?} is already online")]
    Conflict(String),
    #[error("unknown peer {0:?}")]
    UnknownPeer(String),
}

/// Error decoding snapshot text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("line {line}: missing {field}")]
    MissingField { line: usize, field: &'static str },
    #[error("line {line}: invalid address")]
    BadAddress { line: usize },
    #[error("line {line}: invalid port")]
    BadPort { line: usize },
    #[error("line {line}: online flag must be 0 or 1")]
    BadOnlineFlag { line: usize },
    #[error("identity {0:?} appears twice")]
    DuplicateIdentity(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn sorted_files(r: &PeerRecord) -> Vec<String> {
        let mut f = r.files().to_vec();
        f.sort();
        f
    }

    #[test]
    fn upsert_creates_online_record() {
        let mut dir = Directory::new();
        let rec = dir.upsert("alice", LOCAL, 5000, 6000).unwrap();
        assert!(rec.online);
        assert_eq!(rec.control_addr(), "127.0.0.1:5000".parse().unwrap());
        assert_eq!(rec.transfer_addr(), "127.0.0.1:6000".parse().unwrap());
        assert_eq!(dir.snapshot().as_str(), "alice 127.0.0.1 5000 6000 1");
    }

    #[test]
    fn upsert_online_identity_conflicts() {
        let mut dir = Directory::new();
        dir.upsert("alice", LOCAL, 5000, 6000).unwrap();
        let before = dir.snapshot();
        let err = dir.upsert("alice", LOCAL, 5001, 6001).unwrap_err();
        assert_eq!(err, DirectoryError::Conflict("alice".into()));
        assert_eq!(dir.snapshot(), before);
    }

    #[test]
    fn reregistration_keeps_files_and_takes_new_address() {
        let mut dir = Directory::new();
        dir.upsert("alice", LOCAL, 5000, 6000).unwrap();
        dir.add_files("alice", ["a.txt"]).unwrap();
        dir.set_offline("alice").unwrap();
        assert!(!dir.get("alice").unwrap().online);

        let addr: IpAddr = "10.0.0.7".parse().unwrap();
        let rec = dir.upsert("alice", addr, 5100, 6100).unwrap();
        assert!(rec.online);
        assert_eq!(rec.address, addr);
        assert_eq!(rec.files(), ["a.txt".to_string()]);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn add_files_is_idempotent() {
        let mut dir = Directory::new();
        dir.upsert("alice", LOCAL, 5000, 6000).unwrap();
        let added = dir.add_files("alice", ["a.txt", "b.txt", "a.txt"]).unwrap();
        assert_eq!(added, vec!["a.txt", "b.txt"]);
        let snap = dir.snapshot();
        let added = dir.add_files("alice", ["b.txt"]).unwrap();
        assert!(added.is_empty());
        assert_eq!(dir.snapshot(), snap);
    }

    #[test]
    fn unknown_identity_errors() {
        let mut dir = Directory::new();
        assert_eq!(
            dir.set_offline("ghost"),
            Err(DirectoryError::UnknownPeer("ghost".into()))
        );
        assert!(dir.add_files("ghost", ["x"]).is_err());
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let mut dir = Directory::new();
        dir.upsert("zed", LOCAL, 1, 2).unwrap();
        dir.upsert("amy", LOCAL, 3, 4).unwrap();
        dir.add_files("zed", ["z1", "z2"]).unwrap();
        dir.set_offline("amy").unwrap();
        assert_eq!(
            dir.snapshot().as_str(),
            "zed 127.0.0.1 1 2 1 z1 z2\namy 127.0.0.1 3 4 0"
        );
    }

    #[test]
    fn snapshot_roundtrip_reproduces_directory() {
        let mut dir = Directory::new();
        dir.upsert("alice", LOCAL, 5000, 6000).unwrap();
        dir.upsert("bob", "192.168.1.20".parse().unwrap(), 5001, 6001).unwrap();
        dir.add_files("alice", ["report.txt", "notes.md"]).unwrap();
        dir.set_offline("bob").unwrap();

        let copy = Directory::from_snapshot(&dir.snapshot()).unwrap();
        let ids: Vec<_> = copy.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(ids, ["alice", "bob"]);
        for original in dir.iter() {
            let decoded = copy.get(&original.identity).unwrap();
            assert_eq!(decoded.address, original.address);
            assert_eq!(decoded.control_port, original.control_port);
            assert_eq!(decoded.transfer_port, original.transfer_port);
            assert_eq!(decoded.online, original.online);
            assert_eq!(sorted_files(decoded), sorted_files(original));
        }
    }

    #[test]
    fn decode_tolerates_trailing_space_and_blank_lines() {
        let snap = Snapshot::from_text("alice 127.0.0.1 5000 6000 1 \n\nbob 127.0.0.1 5001 6001 0 x");
        let dir = Directory::from_snapshot(&snap).unwrap();
        assert_eq!(dir.len(), 2);
        assert!(dir.get("alice").unwrap().files().is_empty());
        assert!(dir.get("bob").unwrap().offers("x"));
    }

    #[test]
    fn empty_snapshot_is_empty_directory() {
        let dir = Directory::from_snapshot(&Snapshot::default()).unwrap();
        assert!(dir.is_empty());
        assert!(Directory::new().snapshot().is_empty());
    }

    #[test]
    fn decode_rejects_malformed_lines() {
        let bad = |s: &str| Directory::from_snapshot(&Snapshot::from_text(s)).unwrap_err();
        assert!(matches!(bad("alice 127.0.0.1 5000"), SnapshotError::MissingField { .. }));
        assert!(matches!(bad("alice nowhere 5000 6000 1"), SnapshotError::BadAddress { .. }));
        assert!(matches!(bad("alice 127.0.0.1 70000 6000 1"), SnapshotError::BadPort { .. }));
        assert!(matches!(bad("alice 127.0.0.1 5000 6000 yes"), SnapshotError::BadOnlineFlag { .. }));
        assert!(matches!(
            bad("a 127.0.0.1 1 2 1\na 127.0.0.1 1 2 0"),
            SnapshotError::DuplicateIdentity(_)
        ));
    }

    #[test]
    fn case_insensitive_lookup_prefers_exact_match() {
        let mut dir = Directory::new();
        dir.upsert("Alice", LOCAL, 1, 2).unwrap();
        dir.upsert("alice", LOCAL, 3, 4).unwrap();
        assert_eq!(dir.find_case_insensitive("alice").unwrap().control_port, 3);
        assert_eq!(dir.find_case_insensitive("ALICE").unwrap().control_port, 1);
        assert!(dir.get("ALICE").is_none());

        dir.upsert("Émile", LOCAL, 5, 6).unwrap();
        assert_eq!(dir.find_case_insensitive("émile").unwrap().identity, "Émile");
        assert_eq!(dir.find_case_insensitive("ÉMILE").unwrap().control_port, 5);
    }

    #[test]
    fn offered_files_sorted_by_file_then_owner() {
        let mut dir = Directory::new();
        dir.upsert("bob", LOCAL, 1, 2).unwrap();
        dir.upsert("alice", LOCAL, 3, 4).unwrap();
        dir.add_files("bob", ["b.txt", "a.txt"]).unwrap();
        dir.add_files("alice", ["a.txt"]).unwrap();
        assert_eq!(
            dir.offered_files(),
            vec![("a.txt", "alice"), ("a.txt", "bob"), ("b.txt", "bob")]
        );
    }
}
