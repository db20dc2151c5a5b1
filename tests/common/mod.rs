//! In-memory stand-in for xenstored, driven over `tokio::io::duplex`.
//!
//! Implements enough of the daemon for end-to-end tests: a node tree with
//! permissions, snapshot transactions that fail with `EAGAIN` on conflict,
//! and watches that fire on writes.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use xenstore_client::connection::PacketConnection;
use xenstore_client::{Client, Event, Operation, Packet};

type Nodes = BTreeMap<Vec<u8>, NodeData>;

#[derive(Debug, Clone)]
struct NodeData {
    value: Vec<u8>,
    perms: Vec<Vec<u8>>,
}

impl NodeData {
    fn empty() -> Self {
        Self {
            value: Vec::new(),
            perms: vec![b"n0".to_vec()],
        }
    }
}

struct Overlay {
    nodes: Nodes,
    generation: u64,
    changed: Vec<Vec<u8>>,
}

struct State {
    nodes: Nodes,
    generation: u64,
    next_tx: u32,
    transactions: HashMap<u32, Overlay>,
    watches: HashSet<(Vec<u8>, Vec<u8>)>,
    fire_on_watch: bool,
    requests: Vec<Packet>,
}

enum Control {
    Event(Event),
    Disconnect,
}

/// Handle to a running fake daemon.
pub struct FakeXenstored {
    state: Arc<Mutex<State>>,
    control: mpsc::UnboundedSender<Control>,
    silent: Arc<AtomicBool>,
}

/// Start a fake daemon and a client connected to it.
pub fn start() -> (Client, FakeXenstored) {
    let (client_end, server_end) = tokio::io::duplex(256 * 1024);
    let server = FakeXenstored::serve(Box::new(server_end));
    let client = Client::from_stream(Box::new(client_end)).unwrap();
    (client, server)
}

fn seed() -> Nodes {
    let mut nodes = Nodes::new();
    for path in ["/", "/local", "/local/domain", "/local/domain/0"] {
        nodes.insert(path.as_bytes().to_vec(), NodeData::empty());
    }
    let mut name = NodeData::empty();
    name.value = b"Domain-0".to_vec();
    nodes.insert(b"/local/domain/0/name".to_vec(), name);
    nodes
}

impl FakeXenstored {
    fn serve(stream: Box<dyn xenstore_client::transport::XsStream>) -> Self {
        let state = Arc::new(Mutex::new(State {
            nodes: seed(),
            generation: 0,
            next_tx: 1,
            transactions: HashMap::new(),
            watches: HashSet::new(),
            fire_on_watch: false,
            requests: Vec::new(),
        }));
        let silent = Arc::new(AtomicBool::new(false));
        let (control, mut commands) = mpsc::unbounded_channel();

        let (mut writer, mut reader) = PacketConnection::new(stream).into_split().unwrap();
        let task_state = Arc::clone(&state);
        let task_silent = Arc::clone(&silent);
        tokio::spawn(async move {
            loop {
                let outgoing = tokio::select! {
                    command = commands.recv() => match command {
                        Some(Control::Event(event)) => vec![event_packet(&event)],
                        Some(Control::Disconnect) | None => break,
                    },
                    request = reader.receive() => match request {
                        Ok(request) => {
                            let mut state = task_state.lock().unwrap();
                            state.requests.push(request.clone());
                            if task_silent.load(Ordering::SeqCst) {
                                continue;
                            }
                            state.handle(&request)
                        }
                        Err(_) => break,
                    },
                };
                for packet in outgoing {
                    if writer.send(packet).await.is_err() {
                        return;
                    }
                }
            }
            let _ = writer.close().await;
        });

        Self {
            state,
            control,
            silent,
        }
    }

    /// Push an unsolicited watch event.
    pub fn fire(&self, path: &str, token: &str) {
        let _ = self.control.send(Control::Event(Event::new(path, token)));
    }

    /// Drop the connection, as if the daemon died.
    pub fn disconnect(&self) {
        let _ = self.control.send(Control::Disconnect);
    }

    /// Swallow requests without replying.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Fire one event when a watch is registered, like the real daemon.
    pub fn set_fire_on_watch(&self, fire: bool) {
        self.state.lock().unwrap().fire_on_watch = fire;
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<Packet> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Committed value at `path`.
    pub fn value(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(path.as_bytes())
            .map(|node| node.value.clone())
    }

    /// Number of live watches.
    pub fn watch_count(&self) -> usize {
        self.state.lock().unwrap().watches.len()
    }
}

fn event_packet(event: &Event) -> Packet {
    let mut payload = event.path.clone();
    payload.push(0);
    payload.extend_from_slice(&event.token);
    payload.push(0);
    Packet::new(Operation::WatchEvent, 0, 0, payload).unwrap()
}

fn reply(request: &Packet, payload: &[u8]) -> Packet {
    Packet::new(request.op, request.rq_id, request.tx_id, payload.to_vec()).unwrap()
}

fn error(request: &Packet, code: &str) -> Packet {
    let mut payload = code.as_bytes().to_vec();
    payload.push(0);
    Packet::new(Operation::Error, request.rq_id, request.tx_id, payload).unwrap()
}

fn args(payload: &[u8]) -> Vec<&[u8]> {
    let trimmed = payload.strip_suffix(&[0]).unwrap_or(payload);
    trimmed.split(|b| *b == 0).collect()
}

fn parent(path: &[u8]) -> Option<&[u8]> {
    if path == b"/" {
        return None;
    }
    let idx = path.iter().rposition(|b| *b == b'/')?;
    Some(if idx == 0 { &b"/"[..] } else { &path[..idx] })
}

fn under(path: &[u8], top: &[u8]) -> bool {
    path == top
        || top == b"/"
        || path.strip_prefix(top).is_some_and(|rest| rest.first() == Some(&b'/'))
}

fn ensure(nodes: &mut Nodes, path: &[u8]) {
    if let Some(up) = parent(path) {
        ensure(nodes, up);
    }
    nodes.entry(path.to_vec()).or_insert_with(NodeData::empty);
}

fn children(nodes: &Nodes, path: &[u8]) -> Vec<Vec<u8>> {
    let mut prefix = path.to_vec();
    if prefix != b"/" {
        prefix.push(b'/');
    }
    nodes
        .keys()
        .filter_map(|key| key.strip_prefix(prefix.as_slice()))
        .filter(|rest| !rest.is_empty() && !rest.contains(&b'/'))
        .map(<[u8]>::to_vec)
        .collect()
}

fn joined(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        out.extend_from_slice(item);
        out.push(0);
    }
    out
}

impl State {
    fn handle(&mut self, request: &Packet) -> Vec<Packet> {
        let tx_id = request.tx_id;
        if tx_id != 0 && !self.transactions.contains_key(&tx_id) {
            return vec![error(request, "ENOENT")];
        }

        let argv = args(&request.payload);
        let mut changed = Vec::new();
        let mut out = Vec::new();

        let result: Result<Vec<u8>, &str> = match request.op {
            Operation::Read => self
                .nodes_for(tx_id)
                .get(argv[0])
                .map(|node| node.value.clone())
                .ok_or("ENOENT"),
            Operation::Write => {
                let (path, value) = split_first_nul(&request.payload);
                ensure(self.nodes_for(tx_id), path);
                if let Some(node) = self.nodes_for(tx_id).get_mut(path) {
                    node.value = value.to_vec();
                }
                changed.push(path.to_vec());
                Ok(b"OK\0".to_vec())
            }
            Operation::Mkdir => {
                ensure(self.nodes_for(tx_id), argv[0]);
                changed.push(argv[0].to_vec());
                Ok(b"OK\0".to_vec())
            }
            Operation::Rm => {
                let path = argv[0];
                let nodes = self.nodes_for(tx_id);
                if nodes.contains_key(path) {
                    nodes.retain(|key, _| !under(key, path));
                    changed.push(path.to_vec());
                    Ok(b"OK\0".to_vec())
                } else if parent(path).is_some_and(|up| nodes.contains_key(up)) {
                    Ok(b"OK\0".to_vec())
                } else {
                    Err("ENOENT")
                }
            }
            Operation::Directory => {
                let nodes = self.nodes_for(tx_id);
                if nodes.contains_key(argv[0]) {
                    Ok(joined(&children(nodes, argv[0])))
                } else {
                    Err("ENOENT")
                }
            }
            Operation::GetPerms => self
                .nodes_for(tx_id)
                .get(argv[0])
                .map(|node| joined(&node.perms))
                .ok_or("ENOENT"),
            Operation::SetPerms => match self.nodes_for(tx_id).get_mut(argv[0]) {
                Some(node) => {
                    node.perms = argv[1..].iter().map(|p| p.to_vec()).collect();
                    changed.push(argv[0].to_vec());
                    Ok(b"OK\0".to_vec())
                }
                None => Err("ENOENT"),
            },
            Operation::Watch => {
                let key = (argv[0].to_vec(), argv.get(1).unwrap_or(&&b""[..]).to_vec());
                if self.watches.insert(key.clone()) {
                    if self.fire_on_watch {
                        out.push(event_packet(&Event::new(key.0, key.1)));
                    }
                    Ok(b"OK\0".to_vec())
                } else {
                    Err("EEXIST")
                }
            }
            Operation::Unwatch => {
                let key = (argv[0].to_vec(), argv.get(1).unwrap_or(&&b""[..]).to_vec());
                if self.watches.remove(&key) {
                    Ok(b"OK\0".to_vec())
                } else {
                    Err("ENOENT")
                }
            }
            Operation::TransactionStart => {
                let id = self.next_tx;
                self.next_tx += 1;
                self.transactions.insert(
                    id,
                    Overlay {
                        nodes: self.nodes.clone(),
                        generation: self.generation,
                        changed: Vec::new(),
                    },
                );
                Ok(format!("{}\0", id).into_bytes())
            }
            Operation::TransactionEnd => {
                let commit = argv[0] == b"T";
                match self.transactions.remove(&tx_id) {
                    None => Err("ENOENT"),
                    Some(_) if !commit => Ok(b"OK\0".to_vec()),
                    Some(overlay) if overlay.generation != self.generation => Err("EAGAIN"),
                    Some(overlay) => {
                        self.nodes = overlay.nodes;
                        self.generation += 1;
                        out.extend(self.events_for(&overlay.changed));
                        Ok(b"OK\0".to_vec())
                    }
                }
            }
            Operation::GetDomainPath => Ok(format!(
                "/local/domain/{}\0",
                String::from_utf8_lossy(argv[0])
            )
            .into_bytes()),
            Operation::IsDomainIntroduced => {
                Ok(if argv[0] == b"0" { b"T\0".to_vec() } else { b"F\0".to_vec() })
            }
            Operation::Introduce => {
                out.extend(self.events_for(&[b"@introduceDomain".to_vec()]));
                Ok(b"OK\0".to_vec())
            }
            Operation::Release => {
                out.extend(self.events_for(&[b"@releaseDomain".to_vec()]));
                Ok(b"OK\0".to_vec())
            }
            Operation::Resume | Operation::SetTarget | Operation::Restrict => Ok(b"OK\0".to_vec()),
            _ => Err("EINVAL"),
        };

        if !changed.is_empty() {
            if tx_id == 0 {
                self.generation += 1;
                out.extend(self.events_for(&changed));
            } else if let Some(overlay) = self.transactions.get_mut(&tx_id) {
                overlay.changed.extend(changed);
            }
        }

        let answer = match result {
            Ok(payload) => reply(request, &payload),
            Err(code) => error(request, code),
        };
        // reply first, then any events it caused
        out.insert(0, answer);
        out
    }

    fn nodes_for(&mut self, tx_id: u32) -> &mut Nodes {
        match self.transactions.get_mut(&tx_id) {
            Some(overlay) => &mut overlay.nodes,
            None => &mut self.nodes,
        }
    }

    fn events_for(&self, changed: &[Vec<u8>]) -> Vec<Packet> {
        let mut packets = Vec::new();
        for path in changed {
            for (watched, token) in &self.watches {
                let hit = if watched.first() == Some(&b'@') {
                    watched == path
                } else {
                    under(path, watched)
                };
                if hit {
                    packets.push(event_packet(&Event::new(path.clone(), token.clone())));
                }
            }
        }
        packets
    }
}

fn split_first_nul(payload: &[u8]) -> (&[u8], &[u8]) {
    match payload.iter().position(|b| *b == 0) {
        Some(idx) => (&payload[..idx], &payload[idx + 1..]),
        None => (payload, b"" as &[u8]),
    }
}
