//! Network directory
//!
//! Roster of remote nodes discovered over the radio. A background scan
//! repeats the link's discovery pass until at least one node answers, then
//! emits one roster event per affected device type. Node identifiers follow
//! the `<type><separators><digits>` convention (`wDRT_3`, `wVOG 1`); ids
//! that do not fit are logged and skipped.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::DevicesChanged;
use crate::protocol::{NodeAddress, ProtocolError, POLL_INTERVAL_MS};
use crate::radio::link::{NdRecord, RadioLink};

/// One discovered remote node
#[derive(Debug, Clone)]
pub struct RemoteNode {
    /// Full node identifier as configured on the radio, e.g. `wDRT_3`
    pub node_id: String,
    /// Device-type label parsed from the identifier, e.g. `wDRT`
    pub device_type: String,
    /// Instance id parsed from the identifier, e.g. `3`
    pub instance_id: String,
    /// Radio address
    pub address: NodeAddress,
}

#[derive(Default)]
struct ScanState {
    generation: u64,
    token: Option<CancellationToken>,
}

/// Discovered-node roster for one radio link
pub struct NetworkDirectory {
    link: Arc<RadioLink>,
    events: mpsc::Sender<DevicesChanged>,
    nodes: StdMutex<HashMap<String, RemoteNode>>,
    scan: StdMutex<ScanState>,
    node_pattern: Regex,
}

impl NetworkDirectory {
    /// New empty directory over `link`, reporting roster changes on
    /// `events`
    pub fn new(link: Arc<RadioLink>, events: mpsc::Sender<DevicesChanged>) -> Arc<Self> {
        Arc::new(Self {
            link,
            events,
            nodes: StdMutex::new(HashMap::new()),
            scan: StdMutex::new(ScanState::default()),
            node_pattern: Regex::new(r"^([A-Za-z]+)[\s_]*([0-9]+)")
                .expect("static pattern compiles"),
        })
    }

    /// Kick off a background scan. No-op while one is already running.
    pub fn start_discovery(self: &Arc<Self>) {
        let (generation, token) = {
            let mut scan = self.scan.lock().expect("directory poisoned");
            if scan.token.is_some() {
                return;
            }
            scan.generation += 1;
            let token = CancellationToken::new();
            scan.token = Some(token.clone());
            (scan.generation, token)
        };
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            directory.scan_loop(generation, token).await;
        });
    }

    /// Cancel any running scan
    pub fn stop_scan(&self) {
        let mut scan = self.scan.lock().expect("directory poisoned");
        if let Some(token) = scan.token.take() {
            token.cancel();
        }
    }

    /// Forget every node and rescan from scratch. Emits an empty roster
    /// for each previously known device type so consumers drop stale ids.
    pub async fn clear(self: &Arc<Self>) {
        self.stop_scan();
        let known_types: BTreeSet<String> = {
            let mut nodes = self.nodes.lock().expect("directory poisoned");
            let types = nodes.values().map(|n| n.device_type.clone()).collect();
            nodes.clear();
            types
        };
        for device_type in known_types {
            let _ = self
                .events
                .send(DevicesChanged {
                    device_type,
                    ids: Vec::new(),
                })
                .await;
        }
        self.start_discovery();
    }

    /// Node for a (type, instance) pair
    pub fn lookup(&self, device_type: &str, instance_id: &str) -> Option<RemoteNode> {
        self.nodes
            .lock()
            .expect("directory poisoned")
            .values()
            .find(|n| n.device_type == device_type && n.instance_id == instance_id)
            .cloned()
    }

    /// Node with the given 64-bit radio address
    pub fn lookup_by_addr64(&self, addr64: u64) -> Option<RemoteNode> {
        self.nodes
            .lock()
            .expect("directory poisoned")
            .values()
            .find(|n| n.address.addr64 == addr64)
            .cloned()
    }

    /// Sorted instance ids currently known for a device type
    pub fn instances_of(&self, device_type: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .lock()
            .expect("directory poisoned")
            .values()
            .filter(|n| n.device_type == device_type)
            .map(|n| n.instance_id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn scan_loop(self: Arc<Self>, generation: u64, token: CancellationToken) {
        loop {
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = self.link.discover() => result,
            };
            match result {
                Ok(records) if records.is_empty() => {
                    // Empty network; keep scanning until somebody answers.
                    debug!("discovery found nothing, rescanning");
                    tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
                }
                Ok(records) => {
                    let changed = self.absorb(records);
                    for roster in changed {
                        let _ = self.events.send(roster).await;
                    }
                    break;
                }
                Err(ProtocolError::LinkClosed) => break,
                Err(e) => {
                    warn!(error = %e, "discovery pass failed, retrying");
                    tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
                }
            }
        }
        let mut scan = self.scan.lock().expect("directory poisoned");
        if scan.generation == generation {
            scan.token = None;
        }
    }

    /// Merge discovery records into the roster; returns one roster event
    /// per device type that gained a node.
    pub(crate) fn absorb(&self, records: Vec<NdRecord>) -> Vec<DevicesChanged> {
        let mut affected = BTreeSet::new();
        {
            let mut nodes = self.nodes.lock().expect("directory poisoned");
            for record in records {
                let Some((device_type, instance_id)) = self.parse_node_id(&record.node_id)
                else {
                    warn!(
                        error = %ProtocolError::UnparseableNodeId(record.node_id.clone()),
                        "ignoring discovered node"
                    );
                    continue;
                };
                if nodes.contains_key(&record.node_id) {
                    continue;
                }
                info!(node_id = %record.node_id, "node discovered");
                affected.insert(device_type.clone());
                nodes.insert(
                    record.node_id.clone(),
                    RemoteNode {
                        node_id: record.node_id,
                        device_type,
                        instance_id,
                        address: record.address,
                    },
                );
            }
        }
        affected
            .into_iter()
            .map(|device_type| DevicesChanged {
                ids: self.instances_of(&device_type),
                device_type,
            })
            .collect()
    }

    fn parse_node_id(&self, node_id: &str) -> Option<(String, String)> {
        let captures = self.node_pattern.captures(node_id.trim())?;
        Some((captures[1].to_string(), captures[2].to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn directory() -> (Arc<NetworkDirectory>, mpsc::Receiver<DevicesChanged>) {
        let (host, _device) = tokio::io::duplex(64);
        let handles = RadioLink::open(host);
        let (tx, rx) = mpsc::channel(16);
        (NetworkDirectory::new(handles.link, tx), rx)
    }

    fn record(node_id: &str, addr64: u64) -> NdRecord {
        NdRecord {
            node_id: node_id.to_string(),
            address: NodeAddress::from_addr64(addr64),
        }
    }

    #[tokio::test]
    async fn test_absorb_groups_roster_by_type() {
        let (directory, _rx) = directory();
        let changed = directory.absorb(vec![
            record("wDRT_2", 0x02),
            record("wDRT_1", 0x01),
            record("wVOG 1", 0x03),
        ]);

        assert_eq!(changed.len(), 2);
        assert_eq!(changed[0].device_type, "wDRT");
        assert_eq!(changed[0].ids, vec!["1", "2"]);
        assert_eq!(changed[1].device_type, "wVOG");
        assert_eq!(changed[1].ids, vec!["1"]);
    }

    #[tokio::test]
    async fn test_absorb_skips_unparseable_ids_and_duplicates() {
        let (directory, _rx) = directory();
        directory.absorb(vec![record("wDRT_1", 0x01), record("???", 0x02)]);
        let changed = directory.absorb(vec![record("wDRT_1", 0x01)]);

        assert!(changed.is_empty());
        assert_eq!(directory.instances_of("wDRT"), vec!["1"]);
        assert!(directory.lookup_by_addr64(0x02).is_none());
    }

    #[tokio::test]
    async fn test_lookup_paths() {
        let (directory, _rx) = directory();
        directory.absorb(vec![record("wVOG_4", 0x0013A200DEADBEEF)]);

        let node = directory.lookup("wVOG", "4").expect("known node");
        assert_eq!(node.address.addr64, 0x0013A200DEADBEEF);
        assert_eq!(
            directory
                .lookup_by_addr64(0x0013A200DEADBEEF)
                .unwrap()
                .node_id,
            "wVOG_4"
        );
        assert!(directory.lookup("wDRT", "4").is_none());
    }

    #[tokio::test]
    async fn test_clear_emits_empty_rosters() {
        let (directory, mut rx) = directory();
        directory.absorb(vec![record("wDRT_1", 0x01), record("wVOG_1", 0x02)]);
        directory.clear().await;

        let mut emptied = Vec::new();
        for _ in 0..2 {
            let event = rx.recv().await.unwrap();
            assert!(event.ids.is_empty());
            emptied.push(event.device_type);
        }
        emptied.sort();
        assert_eq!(emptied, vec!["wDRT", "wVOG"]);
        assert!(directory.instances_of("wDRT").is_empty());
    }
}
