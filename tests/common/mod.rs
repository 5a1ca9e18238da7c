//! Shared test utilities for keyshift integration tests.
//!
//! [`FakeCluster`] runs in-process RESP servers on random ports. Servers
//! in the same cluster can reach each other, so `MIGRATE` issued against
//! one really lands on another.
//!
//! Import via `mod common;` in integration test files:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use keyshift::config::Config;
use keyshift::migration::{BatchProgress, ReportSink, RunSummary, TransferOutcome};
use keyshift::protocol::{encode_frame, parse_frame, Frame};

// ============================================================================
// Fake cluster
// ============================================================================

/// A set of fake servers that can MIGRATE to each other.
#[derive(Default)]
pub struct FakeCluster {
    servers: Mutex<HashMap<u16, Arc<FakeServer>>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a server without authentication.
    pub async fn spawn(self: &Arc<Self>) -> Arc<FakeServer> {
        self.spawn_with_auth(None, None).await
    }

    /// Start a server that requires `AUTH [username] password`.
    pub async fn spawn_with_auth(
        self: &Arc<Self>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Arc<FakeServer> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind to random port");
        let port = listener.local_addr().expect("should have local addr").port();

        let server = Arc::new(FakeServer {
            port,
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            dbs: Mutex::new(HashMap::new()),
            faults: Mutex::new(FakeFaults::default()),
            migrate_log: Mutex::new(Vec::new()),
            scans: Mutex::new(0),
            cluster: Arc::downgrade(self),
        });
        self.servers.lock().insert(port, server.clone());

        let accept = server.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let server = accept.clone();
                tokio::spawn(async move { server.serve(stream).await });
            }
        });
        server
    }

    fn lookup(&self, port: u16) -> Option<Arc<FakeServer>> {
        self.servers.lock().get(&port).cloned()
    }
}

/// Injected misbehaviour of a fake server.
#[derive(Debug, Clone, Default)]
pub struct FakeFaults {
    /// MIGRATE of these keys answers `-IOERR`
    pub ioerr_keys: HashSet<Bytes>,
    /// MIGRATE of these keys never answers
    pub hang_keys: HashSet<Bytes>,
    /// Another writer puts these keys on the destination right before the
    /// MIGRATE lands
    pub race_keys: HashSet<Bytes>,
    /// SCAN answers with an error once this many pages were served
    pub fail_scan_after: Option<usize>,
}

/// One fake RESP server.
pub struct FakeServer {
    pub port: u16,
    username: Option<String>,
    password: Option<String>,
    dbs: Mutex<HashMap<u32, BTreeMap<Bytes, Bytes>>>,
    faults: Mutex<FakeFaults>,
    migrate_log: Mutex<Vec<Vec<Bytes>>>,
    scans: Mutex<usize>,
    cluster: Weak<FakeCluster>,
}

struct Session {
    authenticated: bool,
    db: u32,
}

impl FakeServer {
    pub fn set(&self, db: u32, key: &str, value: &str) {
        self.dbs
            .lock()
            .entry(db)
            .or_default()
            .insert(Bytes::copy_from_slice(key.as_bytes()), Bytes::copy_from_slice(value.as_bytes()));
    }

    pub fn get(&self, db: u32, key: &str) -> Option<String> {
        self.dbs
            .lock()
            .get(&db)
            .and_then(|data| data.get(key.as_bytes()))
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn len(&self, db: u32) -> usize {
        self.dbs.lock().get(&db).map_or(0, BTreeMap::len)
    }

    pub fn snapshot(&self, db: u32) -> BTreeMap<Bytes, Bytes> {
        self.dbs.lock().get(&db).cloned().unwrap_or_default()
    }

    pub fn set_faults(&self, faults: FakeFaults) {
        *self.faults.lock() = faults;
    }

    /// Every MIGRATE command received, arguments included.
    pub fn migrate_log(&self) -> Vec<Vec<Bytes>> {
        self.migrate_log.lock().clone()
    }

    async fn serve(self: Arc<Self>, mut stream: TcpStream) {
        let mut buf = BytesMut::with_capacity(4096);
        let mut session = Session {
            authenticated: self.password.is_none(),
            db: 0,
        };

        loop {
            let frame = loop {
                match parse_frame(&mut buf) {
                    Ok(Some(frame)) => break frame,
                    Ok(None) => {}
                    Err(_) => return,
                }
                match stream.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            };

            let Some(args) = command_args(frame) else {
                return;
            };
            let reply = self.dispatch(&mut session, args).await;

            let mut out = BytesMut::new();
            encode_frame(&reply, &mut out);
            if stream.write_all(&out).await.is_err() {
                return;
            }
        }
    }

    async fn dispatch(&self, session: &mut Session, args: Vec<Bytes>) -> Frame {
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();

        if name == "AUTH" {
            return self.auth(session, &args[1..]);
        }
        if !session.authenticated {
            return Frame::error("NOAUTH Authentication required.");
        }

        match name.as_str() {
            "PING" => Frame::simple("PONG"),
            "SELECT" => match arg_u64(&args, 1) {
                Some(db) => {
                    session.db = db as u32;
                    Frame::simple("OK")
                }
                None => Frame::error("ERR value is not an integer or out of range"),
            },
            "SCAN" => self.scan(session.db, &args),
            "EXISTS" if args.len() == 2 => {
                let exists = self
                    .dbs
                    .lock()
                    .get(&session.db)
                    .is_some_and(|data| data.contains_key(&args[1]));
                Frame::Integer(exists as i64)
            }
            "GET" if args.len() == 2 => {
                match self
                    .dbs
                    .lock()
                    .get(&session.db)
                    .and_then(|data| data.get(&args[1]).cloned())
                {
                    Some(value) => Frame::bulk(value),
                    None => Frame::null(),
                }
            }
            "SET" if args.len() == 3 => {
                self.dbs
                    .lock()
                    .entry(session.db)
                    .or_default()
                    .insert(args[1].clone(), args[2].clone());
                Frame::simple("OK")
            }
            "MIGRATE" => self.migrate(session.db, args).await,
            _ => Frame::error(format!("ERR unknown command '{}'", name)),
        }
    }

    fn auth(&self, session: &mut Session, args: &[Bytes]) -> Frame {
        let (user, pass) = match args {
            [pass] => (None, pass),
            [user, pass] => (Some(user), pass),
            _ => return Frame::error("ERR wrong number of arguments for 'auth' command"),
        };
        let Some(expected) = &self.password else {
            return Frame::error("ERR AUTH called without any password configured");
        };
        let user_ok = match (user, &self.username) {
            (Some(u), Some(expected_user)) => u.as_ref() == expected_user.as_bytes(),
            (Some(u), None) => u.as_ref() == b"default",
            (None, _) => true,
        };
        if user_ok && pass.as_ref() == expected.as_bytes() {
            session.authenticated = true;
            Frame::simple("OK")
        } else {
            Frame::error("WRONGPASS invalid username-password pair or user is disabled.")
        }
    }

    fn scan(&self, db: u32, args: &[Bytes]) -> Frame {
        {
            let mut scans = self.scans.lock();
            let served = *scans;
            *scans += 1;
            if let Some(limit) = self.faults.lock().fail_scan_after {
                if served >= limit {
                    return Frame::error("ERR injected scan failure");
                }
            }
        }

        let Some(cursor) = arg_u64(args, 1) else {
            return Frame::error("ERR invalid cursor");
        };
        let mut count = 10usize;
        let mut pattern: Option<Bytes> = None;
        let mut i = 2;
        while i + 1 < args.len() {
            match args[i].to_ascii_uppercase().as_slice() {
                b"COUNT" => count = arg_u64(args, i + 1).unwrap_or(10) as usize,
                b"MATCH" => pattern = Some(args[i + 1].clone()),
                _ => return Frame::error("ERR syntax error"),
            }
            i += 2;
        }

        let dbs = self.dbs.lock();
        let empty = BTreeMap::new();
        let data = dbs.get(&db).unwrap_or(&empty);
        let start = cursor as usize;
        let keys: Vec<Frame> = data
            .keys()
            .skip(start)
            .take(count.max(1))
            .filter(|k| pattern.as_ref().map_or(true, |p| glob(p, k)))
            .cloned()
            .map(Frame::bulk)
            .collect();
        let next = start + count.max(1);
        let next = if next >= data.len() { 0 } else { next };

        Frame::array(vec![
            Frame::bulk(Bytes::from(next.to_string())),
            Frame::array(keys),
        ])
    }

    async fn migrate(&self, db: u32, args: Vec<Bytes>) -> Frame {
        self.migrate_log.lock().push(args.clone());
        if args.len() < 6 {
            return Frame::error("ERR wrong number of arguments for 'migrate' command");
        }
        let key = args[3].clone();

        let faults = self.faults.lock().clone();
        if faults.hang_keys.contains(&key) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if faults.ioerr_keys.contains(&key) {
            return Frame::error("IOERR error or timeout reading to target instance");
        }

        let (Some(port), Some(dest_db)) = (arg_u64(&args, 2), arg_u64(&args, 4)) else {
            return Frame::error("ERR value is not an integer or out of range");
        };
        let Some(target) = self
            .cluster
            .upgrade()
            .and_then(|cluster| cluster.lookup(port as u16))
        else {
            return Frame::error("IOERR error or timeout connecting to the client");
        };

        let mut copy = false;
        let mut replace = false;
        let mut auth: Option<(Option<Bytes>, Bytes)> = None;
        let mut i = 6;
        while i < args.len() {
            match args[i].to_ascii_uppercase().as_slice() {
                b"COPY" => copy = true,
                b"REPLACE" => replace = true,
                b"AUTH" if i + 1 < args.len() => {
                    auth = Some((None, args[i + 1].clone()));
                    i += 1;
                }
                b"AUTH2" if i + 2 < args.len() => {
                    auth = Some((Some(args[i + 1].clone()), args[i + 2].clone()));
                    i += 2;
                }
                _ => return Frame::error("ERR syntax error"),
            }
            i += 1;
        }

        let Some(value) = self.dbs.lock().get(&db).and_then(|d| d.get(&key).cloned()) else {
            return Frame::simple("NOKEY");
        };

        if target.password.is_some() {
            let mut session = Session {
                authenticated: false,
                db: 0,
            };
            let reply = match &auth {
                Some((Some(user), pass)) => target.auth(&mut session, &[user.clone(), pass.clone()]),
                Some((None, pass)) => target.auth(&mut session, &[pass.clone()]),
                None => Frame::error("NOAUTH Authentication required."),
            };
            if let Frame::Error(message) = reply {
                return Frame::error(format!(
                    "ERR Target instance replied with error: {}",
                    String::from_utf8_lossy(&message)
                ));
            }
        }

        if faults.race_keys.contains(&key) {
            target.set(dest_db as u32, &String::from_utf8_lossy(&key), "racer");
        }

        {
            let mut dbs = target.dbs.lock();
            let dest = dbs.entry(dest_db as u32).or_default();
            if dest.contains_key(&key) && !replace {
                return Frame::error("BUSYKEY Target key name already exists.");
            }
            dest.insert(key.clone(), value);
        }
        if !copy {
            if let Some(data) = self.dbs.lock().get_mut(&db) {
                data.remove(&key);
            }
        }
        Frame::simple("OK")
    }
}

fn command_args(frame: Frame) -> Option<Vec<Bytes>> {
    let items = frame.into_array()?;
    if items.is_empty() {
        return None;
    }
    items.into_iter().map(Frame::into_bytes).collect()
}

fn arg_u64(args: &[Bytes], index: usize) -> Option<u64> {
    std::str::from_utf8(args.get(index)?).ok()?.parse().ok()
}

/// `*` and `?` only; enough for the patterns the tests use.
fn glob(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob(&pattern[1..], text) || (!text.is_empty() && glob(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob(&pattern[1..], &text[1..]),
        (Some(p), Some(c)) => p == c && glob(&pattern[1..], &text[1..]),
        _ => false,
    }
}

// ============================================================================
// Run helpers
// ============================================================================

/// Config pointing at two fake servers on 127.0.0.1.
pub fn config_for(source: &FakeServer, target: &FakeServer) -> Config {
    let mut config = Config::default();
    config.source.host = "127.0.0.1".to_string();
    config.source.port = source.port;
    config.target.host = "127.0.0.1".to_string();
    config.target.port = target.port;
    config.migration.connect_timeout_ms = 2_000;
    config
}

/// Port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("should bind to random port");
    let port = listener.local_addr().expect("should have local addr").port();
    drop(listener);
    port
}

/// Report sink that keeps everything it is told.
#[derive(Default)]
pub struct Recorder {
    pub batches: Mutex<Vec<BatchProgress>>,
    pub outcomes: Mutex<Vec<(Bytes, TransferOutcome)>>,
    pub summaries: Mutex<Vec<RunSummary>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Outcome of the first visit of `key`
    pub fn outcome_of(&self, key: &str) -> Option<TransferOutcome> {
        self.outcomes
            .lock()
            .iter()
            .find(|(k, _)| k.as_ref() == key.as_bytes())
            .map(|(_, outcome)| outcome.clone())
    }

    pub fn processed(&self) -> usize {
        self.outcomes.lock().len()
    }
}

impl ReportSink for Recorder {
    fn batch_started(&self, progress: &BatchProgress) {
        self.batches.lock().push(*progress);
    }

    fn key_processed(&self, key: &[u8], outcome: &TransferOutcome) {
        self.outcomes
            .lock()
            .push((Bytes::copy_from_slice(key), outcome.clone()));
    }

    fn finished(&self, summary: &RunSummary) {
        self.summaries.lock().push(summary.clone());
    }
}

/// Build a key set for fault injection.
pub fn keyset(keys: &[&str]) -> HashSet<Bytes> {
    keys.iter()
        .map(|k| Bytes::copy_from_slice(k.as_bytes()))
        .collect()
}
