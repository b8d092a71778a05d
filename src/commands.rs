use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::store::{Store, StoreError};
use crate::wire::{FrameLimits, Reply};

/// Server-wide state handed to every connection handler. The store is the
/// only mutable piece; the counters and start time feed INFO.
pub(crate) struct Shared {
    pub(crate) store: Store,
    pub(crate) limits: FrameLimits,
    pub(crate) started_at: Instant,
    pub(crate) connections_total: AtomicU64,
    pub(crate) commands_total: AtomicU64,
}

impl Shared {
    pub(crate) fn new(store: Store, limits: FrameLimits) -> Self {
        Self {
            store,
            limits,
            started_at: Instant::now(),
            connections_total: AtomicU64::new(0),
            commands_total: AtomicU64::new(0),
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
enum Cmd {
    Ping,
    Echo,
    Set,
    Get,
    Append,
    Strlen,
    Incr,
    Decr,
    IncrBy,
    DecrBy,
    Del,
    Exists,
    Expire,
    Ttl,
    Keys,
    Rename,
    Type,
    Info,
    DbSize,
    FlushDb,
    Quit,
}

/// One registry row: uppercase name, arity bounds (argument count, command
/// name excluded; `None` = unbounded), and the handler tag.
struct CommandSpec {
    name: &'static str,
    min_args: usize,
    max_args: Option<usize>,
    kind: Cmd,
}

static COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "PING",    min_args: 0, max_args: Some(1), kind: Cmd::Ping },
    CommandSpec { name: "ECHO",    min_args: 1, max_args: Some(1), kind: Cmd::Echo },
    CommandSpec { name: "SET",     min_args: 2, max_args: Some(5), kind: Cmd::Set },
    CommandSpec { name: "GET",     min_args: 1, max_args: Some(1), kind: Cmd::Get },
    CommandSpec { name: "APPEND",  min_args: 2, max_args: Some(2), kind: Cmd::Append },
    CommandSpec { name: "STRLEN",  min_args: 1, max_args: Some(1), kind: Cmd::Strlen },
    CommandSpec { name: "INCR",    min_args: 1, max_args: Some(1), kind: Cmd::Incr },
    CommandSpec { name: "DECR",    min_args: 1, max_args: Some(1), kind: Cmd::Decr },
    CommandSpec { name: "INCRBY",  min_args: 2, max_args: Some(2), kind: Cmd::IncrBy },
    CommandSpec { name: "DECRBY",  min_args: 2, max_args: Some(2), kind: Cmd::DecrBy },
    CommandSpec { name: "DEL",     min_args: 1, max_args: None,    kind: Cmd::Del },
    CommandSpec { name: "EXISTS",  min_args: 1, max_args: None,    kind: Cmd::Exists },
    CommandSpec { name: "EXPIRE",  min_args: 2, max_args: Some(2), kind: Cmd::Expire },
    CommandSpec { name: "TTL",     min_args: 1, max_args: Some(1), kind: Cmd::Ttl },
    CommandSpec { name: "KEYS",    min_args: 0, max_args: Some(1), kind: Cmd::Keys },
    CommandSpec { name: "RENAME",  min_args: 2, max_args: Some(2), kind: Cmd::Rename },
    CommandSpec { name: "TYPE",    min_args: 1, max_args: Some(1), kind: Cmd::Type },
    CommandSpec { name: "INFO",    min_args: 0, max_args: Some(0), kind: Cmd::Info },
    CommandSpec { name: "DBSIZE",  min_args: 0, max_args: Some(0), kind: Cmd::DbSize },
    CommandSpec { name: "FLUSHDB", min_args: 0, max_args: Some(0), kind: Cmd::FlushDb },
    CommandSpec { name: "QUIT",    min_args: 0, max_args: Some(0), kind: Cmd::Quit },
];

fn lookup(name: &str) -> Option<&'static CommandSpec> {
    static INDEX: OnceLock<HashMap<&'static str, &'static CommandSpec>> = OnceLock::new();
    INDEX
        .get_or_init(|| COMMANDS.iter().map(|spec| (spec.name, spec)).collect())
        .get(name)
        .copied()
}

/// Resolve and run one tokenized command. Returns the reply plus a flag
/// telling the connection loop to hang up (QUIT).
///
/// Name resolution and arity validation happen here, before any handler
/// touches the keyspace, so an ill-formed command can never partially
/// mutate state.
pub(crate) async fn dispatch(tokens: &[String], shared: &Shared) -> (Reply, bool) {
    let name = tokens[0].to_ascii_uppercase();
    let Some(spec) = lookup(&name) else {
        return (Reply::Err(format!("unknown command '{}'", tokens[0])), false);
    };
    let args = &tokens[1..];
    if args.len() < spec.min_args || spec.max_args.is_some_and(|max| args.len() > max) {
        return (Reply::wrong_args(spec.name), false);
    }

    shared.commands_total.fetch_add(1, Ordering::Relaxed);
    let start = Instant::now();
    let reply = match spec.kind {
        Cmd::Ping => match args.first() {
            Some(msg) => Reply::Simple(msg.clone()),
            None => Reply::Pong,
        },
        Cmd::Echo => Reply::Simple(args[0].clone()),
        Cmd::Quit => Reply::Ok,
        Cmd::Set => cmd_set(args, shared).await,
        Cmd::Get => cmd_get(args, shared).await,
        Cmd::Append => cmd_append(args, shared).await,
        Cmd::Strlen => cmd_strlen(args, shared).await,
        Cmd::Incr => apply_delta(&args[0], 1, shared).await,
        Cmd::Decr => apply_delta(&args[0], -1, shared).await,
        Cmd::IncrBy => cmd_incr_by(args, shared, false).await,
        Cmd::DecrBy => cmd_incr_by(args, shared, true).await,
        Cmd::Del => cmd_del(args, shared).await,
        Cmd::Exists => cmd_exists(args, shared).await,
        Cmd::Expire => cmd_expire(args, shared).await,
        Cmd::Ttl => cmd_ttl(args, shared).await,
        Cmd::Keys => cmd_keys(args, shared).await,
        Cmd::Rename => cmd_rename(args, shared).await,
        Cmd::Type => cmd_type(args, shared).await,
        Cmd::Info => cmd_info(shared).await,
        Cmd::DbSize => cmd_dbsize(shared).await,
        Cmd::FlushDb => cmd_flushdb(shared).await,
    };
    metrics::counter!("kvlite_commands_total", "command" => spec.name).increment(1);
    metrics::histogram!("kvlite_command_duration_seconds", "command" => spec.name)
        .record(start.elapsed().as_secs_f64());

    (reply, matches!(spec.kind, Cmd::Quit))
}

fn store_err(e: StoreError) -> Reply {
    Reply::Err(
        match e {
            StoreError::NotAnInteger => "value is not an integer",
            StoreError::Overflow => "increment or decrement would overflow",
            StoreError::NoSuchKey => "no such key",
            StoreError::ExpiryOutOfRange => "invalid expire time",
        }
        .to_string(),
    )
}

// ── String commands ───────────────────────────────────────────────────────────

async fn cmd_set(args: &[String], shared: &Shared) -> Reply {
    let key = &args[0];
    let value = &args[1];
    let mut ttl = None;
    let mut nx = false;
    let mut xx = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].to_ascii_uppercase().as_str() {
            "EX" => {
                let Some(raw) = args.get(i + 1) else {
                    return Reply::Err("syntax error".into());
                };
                match raw.parse::<i64>() {
                    Ok(secs) if secs > 0 => ttl = Some(Duration::from_secs(secs as u64)),
                    _ => return Reply::Err("invalid expire time in 'SET' command".into()),
                }
                i += 2;
            }
            "NX" => {
                nx = true;
                i += 1;
            }
            "XX" => {
                xx = true;
                i += 1;
            }
            _ => return Reply::Err("syntax error".into()),
        }
    }

    let now = Instant::now();
    let mut db = shared.store.write().await;
    let exists = db.exists(key, now);
    if (nx && exists) || (xx && !exists) {
        return Reply::Nil;
    }
    debug!(key = %key, ttl = ?ttl, "SET");
    match db.set(key.clone(), value.clone(), ttl, now) {
        Ok(()) => Reply::Ok,
        // EX parsed as a valid integer but its deadline is unrepresentable.
        Err(_) => Reply::Err("invalid expire time in 'SET' command".into()),
    }
}

async fn cmd_get(args: &[String], shared: &Shared) -> Reply {
    let mut db = shared.store.write().await;
    match db.get(&args[0], Instant::now()) {
        Some(value) => Reply::Simple(value.to_string()),
        None => Reply::Nil,
    }
}

async fn cmd_append(args: &[String], shared: &Shared) -> Reply {
    let len = shared
        .store
        .write()
        .await
        .append(&args[0], &args[1], Instant::now());
    Reply::Int(len as i64)
}

async fn cmd_strlen(args: &[String], shared: &Shared) -> Reply {
    let len = shared.store.write().await.strlen(&args[0], Instant::now());
    Reply::Int(len as i64)
}

// ── Numeric commands ──────────────────────────────────────────────────────────

async fn apply_delta(key: &str, delta: i64, shared: &Shared) -> Reply {
    let mut db = shared.store.write().await;
    match db.incr_by(key, delta, Instant::now()) {
        Ok(n) => {
            debug!(key = %key, value = n, "numeric update");
            Reply::Int(n)
        }
        Err(e) => store_err(e),
    }
}

async fn cmd_incr_by(args: &[String], shared: &Shared, negate: bool) -> Reply {
    let Ok(amount) = args[1].parse::<i64>() else {
        return store_err(StoreError::NotAnInteger);
    };
    let delta = if negate {
        match amount.checked_neg() {
            Some(d) => d,
            None => return store_err(StoreError::Overflow),
        }
    } else {
        amount
    };
    apply_delta(&args[0], delta, shared).await
}

// ── Key commands ──────────────────────────────────────────────────────────────

async fn cmd_del(args: &[String], shared: &Shared) -> Reply {
    let now = Instant::now();
    let mut db = shared.store.write().await;
    let removed = args.iter().filter(|key| db.delete(key, now)).count();
    debug!(removed, "DEL");
    Reply::Int(removed as i64)
}

async fn cmd_exists(args: &[String], shared: &Shared) -> Reply {
    let now = Instant::now();
    let mut db = shared.store.write().await;
    let live = args.iter().filter(|key| db.exists(key, now)).count();
    Reply::Int(live as i64)
}

async fn cmd_expire(args: &[String], shared: &Shared) -> Reply {
    let Ok(seconds) = args[1].parse::<i64>() else {
        return Reply::Err("value is not an integer or out of range".into());
    };
    match shared
        .store
        .write()
        .await
        .expire(&args[0], seconds, Instant::now())
    {
        Ok(applied) => Reply::Int(if applied { 1 } else { 0 }),
        Err(_) => Reply::Err("value is not an integer or out of range".into()),
    }
}

async fn cmd_ttl(args: &[String], shared: &Shared) -> Reply {
    Reply::Int(shared.store.write().await.ttl(&args[0], Instant::now()))
}

async fn cmd_keys(args: &[String], shared: &Shared) -> Reply {
    let pattern = args.first().map(String::as_str).unwrap_or("*");
    Reply::Lines(shared.store.write().await.keys(pattern, Instant::now()))
}

async fn cmd_rename(args: &[String], shared: &Shared) -> Reply {
    let mut db = shared.store.write().await;
    match db.rename(&args[0], &args[1], Instant::now()) {
        Ok(()) => Reply::Ok,
        Err(e) => store_err(e),
    }
}

async fn cmd_type(args: &[String], shared: &Shared) -> Reply {
    let kind = shared.store.write().await.type_of(&args[0], Instant::now());
    Reply::Simple(kind.to_string())
}

// ── Server commands ───────────────────────────────────────────────────────────

async fn cmd_info(shared: &Shared) -> Reply {
    let keys = shared.store.write().await.size(Instant::now());
    Reply::Lines(vec![
        "# Server".to_string(),
        format!("name:{}", env!("CARGO_PKG_NAME")),
        format!("version:{}", env!("CARGO_PKG_VERSION")),
        format!("uptime_seconds:{}", shared.started_at.elapsed().as_secs()),
        "# Clients".to_string(),
        format!(
            "connections_received:{}",
            shared.connections_total.load(Ordering::Relaxed)
        ),
        format!(
            "commands_processed:{}",
            shared.commands_total.load(Ordering::Relaxed)
        ),
        "# Keyspace".to_string(),
        format!("keys:{keys}"),
    ])
}

async fn cmd_dbsize(shared: &Shared) -> Reply {
    let keys = shared.store.write().await.size(Instant::now());
    Reply::Int(keys as i64)
}

async fn cmd_flushdb(shared: &Shared) -> Reply {
    shared.store.write().await.flush();
    debug!("FLUSHDB");
    Reply::Ok
}
