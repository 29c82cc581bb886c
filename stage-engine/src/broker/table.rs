// Slot Table
// Host capacities, usage, the availability queue and fair-FIFO pending requests

use crate::broker::error::{BrokerError, BrokerResult};
use crate::broker::protocol::ClientId;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;

/// One host's capacity and current usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSlots {
    pub name: String,
    pub capacity: usize,
    pub usage: usize,
}

impl HostSlots {
    pub fn is_full(&self) -> bool {
        self.usage >= self.capacity
    }
}

/// What one broker message did to the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A new requester got a slot on `host` straight away
    Granted { client: ClientId, host: String },
    /// No host had spare capacity; the requester waits in line
    Queued { client: ClientId },
    /// A holder released and its slot went straight to the oldest waiter
    HandedOff {
        from: ClientId,
        to: ClientId,
        host: String,
    },
    /// A holder released and nobody was waiting
    Freed { client: ClientId, host: String },
    /// A waiter gave up before being granted
    Withdrawn { client: ClientId },
}

/// Point-in-time copy of the table, for observers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub hosts: Vec<HostSlots>,
    pub pending: Vec<ClientId>,
    pub assignments: BTreeMap<ClientId, String>,
}

impl SlotSnapshot {
    pub fn usage(&self, host: &str) -> Option<usize> {
        self.hosts.iter().find(|h| h.name == host).map(|h| h.usage)
    }

    pub fn host_of(&self, client: ClientId) -> Option<&str> {
        self.assignments.get(&client).map(String::as_str)
    }
}

/// The broker's state machine.
///
/// The first message from a client is a request, the next one a release.
/// Hosts with spare capacity sit in the availability queue, in host file
/// order, and rotate to its tail after each grant. Requests that find the
/// queue empty wait in a FIFO and are served strictly in arrival order as
/// slots are released; a released slot is handed to the next waiter without
/// ever becoming free.
#[derive(Debug, Clone)]
pub struct SlotTable {
    hosts: Vec<HostSlots>,
    available: VecDeque<usize>,
    pending: VecDeque<ClientId>,
    assignments: HashMap<ClientId, usize>,
}

impl SlotTable {
    /// Build a table from `(host, capacity)` pairs
    pub fn new(hosts: Vec<(String, usize)>) -> BrokerResult<Self> {
        let mut seen = HashSet::new();
        for (line, (name, _)) in hosts.iter().enumerate() {
            if !seen.insert(name.as_str()) {
                return Err(BrokerError::HostFile {
                    line: line + 1,
                    message: format!("duplicate host '{}'", name),
                });
            }
        }

        let hosts: Vec<HostSlots> = hosts
            .into_iter()
            .map(|(name, capacity)| HostSlots {
                name,
                capacity,
                usage: 0,
            })
            .collect();
        let available = hosts
            .iter()
            .enumerate()
            .filter(|(_, host)| !host.is_full())
            .map(|(idx, _)| idx)
            .collect();

        Ok(Self {
            hosts,
            available,
            pending: VecDeque::new(),
            assignments: HashMap::new(),
        })
    }

    pub fn from_host_file(path: impl AsRef<Path>) -> BrokerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::new(parse_hosts(&content)?)
    }

    /// Apply one message from `client`
    pub fn handle(&mut self, client: ClientId) -> BrokerResult<Transition> {
        if self.assignments.contains_key(&client) || self.pending.contains(&client) {
            self.release(client)
        } else {
            self.request(client)
        }
    }

    /// Ask for a slot on behalf of a client with no outstanding message
    pub fn request(&mut self, client: ClientId) -> BrokerResult<Transition> {
        if self.assignments.contains_key(&client) || self.pending.contains(&client) {
            return Err(BrokerError::Protocol(format!(
                "client {} already has an outstanding request",
                client
            )));
        }

        let Some(idx) = self.available.pop_front() else {
            self.pending.push_back(client);
            return Ok(Transition::Queued { client });
        };

        let host = &mut self.hosts[idx];
        host.usage += 1;
        if !host.is_full() {
            self.available.push_back(idx);
        }
        self.assignments.insert(client, idx);
        Ok(Transition::Granted {
            client,
            host: host.name.clone(),
        })
    }

    /// Give back the slot `client` holds, or withdraw its pending request
    pub fn release(&mut self, client: ClientId) -> BrokerResult<Transition> {
        let Some(idx) = self.assignments.remove(&client) else {
            let Some(pos) = self.pending.iter().position(|&c| c == client) else {
                return Err(BrokerError::UnknownClient(client));
            };
            self.pending.remove(pos);
            return Ok(Transition::Withdrawn { client });
        };

        let host = &mut self.hosts[idx];
        if let Some(next) = self.pending.pop_front() {
            self.assignments.insert(next, idx);
            return Ok(Transition::HandedOff {
                from: client,
                to: next,
                host: host.name.clone(),
            });
        }

        let was_full = host.is_full();
        host.usage -= 1;
        if was_full && !host.is_full() {
            self.available.push_back(idx);
        }
        Ok(Transition::Freed {
            client,
            host: host.name.clone(),
        })
    }

    pub fn hosts(&self) -> &[HostSlots] {
        &self.hosts
    }

    /// Every client with a slot or a pending request
    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.assignments.keys().chain(self.pending.iter()).copied()
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            hosts: self.hosts.clone(),
            pending: self.pending.iter().copied().collect(),
            assignments: self
                .assignments
                .iter()
                .map(|(client, idx)| (*client, self.hosts[*idx].name.clone()))
                .collect(),
        }
    }

    /// Check the table's structural invariants, describing the first violation
    pub fn verify(&self) -> Result<(), String> {
        let mut held = vec![0usize; self.hosts.len()];
        for idx in self.assignments.values() {
            held[*idx] += 1;
        }

        for (idx, host) in self.hosts.iter().enumerate() {
            if host.usage > host.capacity {
                return Err(format!(
                    "{} uses {} of {} slots",
                    host.name, host.usage, host.capacity
                ));
            }
            if held[idx] != host.usage {
                return Err(format!(
                    "{} has usage {} but {} holders",
                    host.name, host.usage, held[idx]
                ));
            }
            let queued = self.available.iter().filter(|&&a| a == idx).count();
            let expected = usize::from(!host.is_full());
            if queued != expected {
                return Err(format!(
                    "{} appears {} times in the availability queue, expected {}",
                    host.name, queued, expected
                ));
            }
        }

        if !self.pending.is_empty() && !self.available.is_empty() {
            return Err("clients are waiting while slots are available".to_string());
        }
        if let Some(client) = self.pending.iter().find(|c| self.assignments.contains_key(*c)) {
            return Err(format!("client {} is both pending and assigned", client));
        }
        Ok(())
    }
}

/// Parse a host file: one `<host> <capacity>` per line.
///
/// Blank lines and `#` comments are skipped.
pub fn parse_hosts(content: &str) -> BrokerResult<Vec<(String, usize)>> {
    let mut hosts: Vec<(String, usize)> = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        let text = raw.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }

        let mut fields = text.split_whitespace();
        let (Some(name), Some(capacity)) = (fields.next(), fields.next()) else {
            return Err(BrokerError::HostFile {
                line,
                message: format!("expected '<host> <capacity>', got '{}'", text),
            });
        };
        if fields.next().is_some() {
            return Err(BrokerError::HostFile {
                line,
                message: format!("trailing fields in '{}'", text),
            });
        }
        let capacity = capacity.parse::<usize>().map_err(|_| BrokerError::HostFile {
            line,
            message: format!("capacity '{}' is not a non-negative integer", capacity),
        })?;
        if hosts.iter().any(|(existing, _)| existing == name) {
            return Err(BrokerError::HostFile {
                line,
                message: format!("duplicate host '{}'", name),
            });
        }

        hosts.push((name.to_string(), capacity));
    }

    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table(hosts: &[(&str, usize)]) -> SlotTable {
        SlotTable::new(
            hosts
                .iter()
                .map(|(name, capacity)| (name.to_string(), *capacity))
                .collect(),
        )
        .unwrap()
    }

    fn granted(transition: Transition) -> String {
        match transition {
            Transition::Granted { host, .. } => host,
            other => panic!("expected a grant, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_hosts() {
        let hosts = parse_hosts("# cluster\nnode1 4\n\n  node2\t2  \nnode3 0\n").unwrap();
        assert_eq!(
            hosts,
            vec![
                ("node1".to_string(), 4),
                ("node2".to_string(), 2),
                ("node3".to_string(), 0)
            ]
        );
    }

    #[test]
    fn test_parse_hosts_errors_name_the_line() {
        let cases = [
            ("node1 4\nnode2\n", 2),
            ("node1 four\n", 1),
            ("node1 -1\n", 1),
            ("node1 1\n# c\nnode1 2\n", 3),
            ("node1 1 extra\n", 1),
        ];
        for (content, expected_line) in cases {
            match parse_hosts(content) {
                Err(BrokerError::HostFile { line, .. }) => assert_eq!(line, expected_line, "{}", content),
                other => panic!("{:?} parsed as {:?}", content, other),
            }
        }
    }

    #[test]
    fn test_round_robin_grants() {
        let mut table = table(&[("a", 2), ("b", 2)]);

        let hosts: Vec<_> = (1..=4).map(|c| granted(table.handle(c).unwrap())).collect();

        assert_eq!(hosts, vec!["a", "b", "a", "b"]);
        assert_eq!(table.handle(5).unwrap(), Transition::Queued { client: 5 });
        table.verify().unwrap();
    }

    #[test]
    fn test_zero_capacity_host_never_granted() {
        let mut table = table(&[("idle", 0), ("busy", 1)]);

        assert_eq!(granted(table.handle(1).unwrap()), "busy");
        assert_eq!(table.handle(2).unwrap(), Transition::Queued { client: 2 });
        table.verify().unwrap();
    }

    #[test]
    fn test_release_hands_off_without_freeing() {
        let mut table = table(&[("a", 1)]);
        table.handle(1).unwrap();
        table.handle(2).unwrap();

        let transition = table.handle(1).unwrap();

        assert_eq!(
            transition,
            Transition::HandedOff {
                from: 1,
                to: 2,
                host: "a".to_string()
            }
        );
        let snapshot = table.snapshot();
        assert_eq!(snapshot.usage("a"), Some(1));
        assert_eq!(snapshot.host_of(2), Some("a"));
        assert!(snapshot.pending.is_empty());
        table.verify().unwrap();
    }

    #[test]
    fn test_pending_served_in_arrival_order() {
        let mut table = table(&[("a", 1), ("b", 1)]);
        table.handle(10).unwrap();
        table.handle(20).unwrap();
        table.handle(30).unwrap();
        table.handle(40).unwrap();

        // b frees first, but the oldest waiter still goes first
        let first = table.handle(20).unwrap();
        let second = table.handle(10).unwrap();

        assert!(matches!(first, Transition::HandedOff { to: 30, .. }));
        assert!(matches!(second, Transition::HandedOff { to: 40, .. }));
    }

    #[test]
    fn test_freed_host_rejoins_availability() {
        let mut table = table(&[("a", 1), ("b", 1)]);
        table.handle(1).unwrap();
        table.handle(2).unwrap();

        assert_eq!(
            table.handle(1).unwrap(),
            Transition::Freed {
                client: 1,
                host: "a".to_string()
            }
        );
        assert_eq!(granted(table.handle(3).unwrap()), "a");
        table.verify().unwrap();
    }

    #[test]
    fn test_second_message_while_pending_withdraws() {
        let mut table = table(&[("a", 1)]);
        table.handle(1).unwrap();
        table.handle(2).unwrap();
        table.handle(3).unwrap();

        assert_eq!(table.handle(2).unwrap(), Transition::Withdrawn { client: 2 });
        assert!(matches!(table.handle(1).unwrap(), Transition::HandedOff { to: 3, .. }));
        table.verify().unwrap();
    }

    #[test]
    fn test_release_unknown_client() {
        let mut table = table(&[("a", 1)]);
        assert!(matches!(table.release(9), Err(BrokerError::UnknownClient(9))));
    }

    #[test]
    fn test_duplicate_hosts_rejected() {
        let err = SlotTable::new(vec![("a".to_string(), 1), ("a".to_string(), 2)]).unwrap_err();
        assert!(matches!(err, BrokerError::HostFile { line: 2, .. }));
    }

    #[test]
    fn test_from_host_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "hostA 1\nhostB 1\n").unwrap();

        let table = SlotTable::from_host_file(&path).unwrap();
        assert_eq!(table.hosts().len(), 2);
        assert_eq!(table.clients().count(), 0);
    }

    proptest! {
        /// Any message sequence keeps usage within capacity and the
        /// availability queue consistent with usage
        #[test]
        fn invariants_hold_for_any_message_sequence(
            capacities in proptest::collection::vec(0usize..4, 1..5),
            messages in proptest::collection::vec(0i32..12, 0..200),
        ) {
            let hosts = capacities
                .iter()
                .enumerate()
                .map(|(idx, capacity)| (format!("h{}", idx), *capacity))
                .collect();
            let mut table = SlotTable::new(hosts).unwrap();

            for client in messages {
                table.handle(client).unwrap();
                prop_assert_eq!(table.verify(), Ok(()));
            }
        }

        /// With total capacity C, C + 1 requesters get exactly C grants and the
        /// waiter is next in line for the first release
        #[test]
        fn one_over_capacity_queues_exactly_one(
            capacities in proptest::collection::vec(1usize..4, 1..5),
        ) {
            let total: usize = capacities.iter().sum();
            let hosts = capacities
                .iter()
                .enumerate()
                .map(|(idx, capacity)| (format!("h{}", idx), *capacity))
                .collect();
            let mut table = SlotTable::new(hosts).unwrap();

            let mut grants = 0;
            for client in 0..=total as i32 {
                if matches!(table.handle(client).unwrap(), Transition::Granted { .. }) {
                    grants += 1;
                }
            }
            prop_assert_eq!(grants, total);

            let waiter = total as i32;
            let transition = table.handle(0).unwrap();
            let handed_off_to_waiter = matches!(transition, Transition::HandedOff { to, .. } if to == waiter);
            prop_assert!(handed_off_to_waiter);
        }
    }
}
