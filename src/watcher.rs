//! Debounced, content-verified filesystem watching.
//!
//! Raw OS notifications are funneled through a per-file debounce; when the
//! debounce fires the file is re-read and an event is emitted only if its
//! content actually changed. This suppresses the restart storms caused by
//! editors that rewrite a file several times per save.

use std::{
    collections::{BTreeSet, HashMap},
    env, fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, Sender, channel},
    },
    thread,
    time::SystemTime,
};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    constants::{DEFAULT_IGNORE_PATTERNS, WATCH_DEBOUNCE},
    error::WatcherError,
};

/// Kind of change reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    /// A file appeared under a watched path.
    Add,
    /// A file's content changed.
    Change,
    /// A previously observed file disappeared.
    Unlink,
}

/// A verified change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened.
    pub kind: WatchKind,
    /// The file concerned.
    pub path: PathBuf,
}

/// Last observed signature of a watched file.
struct FileSig {
    digest: [u8; 32],
    size: u64,
    mtime: Option<SystemTime>,
}

struct WatcherShared {
    files: Mutex<HashMap<PathBuf, FileSig>>,
    roots: Mutex<BTreeSet<PathBuf>>,
    ignore: Vec<Regex>,
    base: PathBuf,
    subscribers: Mutex<Vec<Sender<WatchEvent>>>,
    pending: Mutex<HashMap<PathBuf, u64>>,
    os_watcher: Mutex<Option<RecommendedWatcher>>,
    paused: AtomicBool,
}

/// Debounced filesystem watcher.
///
/// `watch` is additive and never unwatches existing paths; `pause` closes
/// the OS handles but retains the path set; `resume` reopens them;
/// `unwatch` closes everything and clears state.
#[derive(Clone)]
pub struct FileWatcher {
    inner: Arc<WatcherShared>,
}

impl FileWatcher {
    /// Creates a watcher with the default ignore patterns.
    pub fn new() -> Result<Self, WatcherError> {
        Self::with_ignore(DEFAULT_IGNORE_PATTERNS.iter().copied())
    }

    /// Creates a watcher with explicit ignore globs.
    pub fn with_ignore<'a>(
        patterns: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, WatcherError> {
        let ignore = patterns
            .into_iter()
            .map(glob_to_regex)
            .collect::<Result<Vec<_>, _>>()?;
        let base = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Ok(Self {
            inner: Arc::new(WatcherShared {
                files: Mutex::new(HashMap::new()),
                roots: Mutex::new(BTreeSet::new()),
                ignore,
                base,
                subscribers: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                os_watcher: Mutex::new(None),
                paused: AtomicBool::new(false),
            }),
        })
    }

    /// Registers a new subscriber for verified change events.
    pub fn subscribe(&self) -> Receiver<WatchEvent> {
        let (tx, rx) = channel();
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Starts observing `paths` (files or directories, recursively) in
    /// addition to everything already watched.
    pub fn watch(&self, paths: &[PathBuf]) -> Result<(), WatcherError> {
        self.ensure_os_watcher()?;
        let Ok(mut os_watcher) = self.inner.os_watcher.lock() else {
            return Ok(());
        };
        let Some(watcher) = os_watcher.as_mut() else {
            return Ok(());
        };
        for path in paths {
            {
                let Ok(mut roots) = self.inner.roots.lock() else {
                    continue;
                };
                if !roots.insert(path.clone()) {
                    continue;
                }
            }
            watcher.watch(path, RecursiveMode::Recursive)?;
            prime(&self.inner, path);
            debug!("watching {:?}", path);
        }
        Ok(())
    }

    /// Closes the OS handles but keeps the path set and file signatures.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        if let Ok(mut os_watcher) = self.inner.os_watcher.lock() {
            *os_watcher = None;
        }
    }

    /// Reopens the OS handles for the retained path set.
    pub fn resume(&self) -> Result<(), WatcherError> {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.ensure_os_watcher()?;
        let roots: Vec<PathBuf> = self
            .inner
            .roots
            .lock()
            .map(|roots| roots.iter().cloned().collect())
            .unwrap_or_default();
        if let Ok(mut os_watcher) = self.inner.os_watcher.lock()
            && let Some(watcher) = os_watcher.as_mut()
        {
            for root in roots {
                watcher.watch(&root, RecursiveMode::Recursive)?;
            }
        }
        Ok(())
    }

    /// Closes all handles and clears every path and signature.
    pub fn unwatch(&self) {
        if let Ok(mut os_watcher) = self.inner.os_watcher.lock() {
            *os_watcher = None;
        }
        if let Ok(mut roots) = self.inner.roots.lock() {
            roots.clear();
        }
        if let Ok(mut files) = self.inner.files.lock() {
            files.clear();
        }
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.clear();
        }
    }

    /// Paths currently registered for watching.
    pub fn watched_roots(&self) -> Vec<PathBuf> {
        self.inner
            .roots
            .lock()
            .map(|roots| roots.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn ensure_os_watcher(&self) -> Result<(), WatcherError> {
        let Ok(mut os_watcher) = self.inner.os_watcher.lock() else {
            return Ok(());
        };
        if os_watcher.is_some() {
            return Ok(());
        }
        let weak = Arc::downgrade(&self.inner);
        let watcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(event) => {
                        for path in event.paths {
                            schedule_debounce(&shared, path);
                        }
                    }
                    Err(err) => warn!("filesystem notification error: {err}"),
                }
            },
        )?;
        *os_watcher = Some(watcher);
        Ok(())
    }
}

/// Records the current signature of every file under `path` without
/// emitting events, so the first observation after `watch` is a baseline.
fn prime(shared: &Arc<WatcherShared>, path: &Path) {
    if is_ignored(shared, path) {
        return;
    }
    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    if meta.is_file() {
        if let Ok(sig) = read_sig(path) {
            if let Ok(mut files) = shared.files.lock() {
                files.insert(path.to_path_buf(), sig);
            }
        }
        return;
    }
    if meta.is_dir()
        && let Ok(entries) = fs::read_dir(path)
    {
        for entry in entries.flatten() {
            prime(shared, &entry.path());
        }
    }
}

fn schedule_debounce(shared: &Arc<WatcherShared>, path: PathBuf) {
    if shared.paused.load(Ordering::SeqCst) || is_ignored(shared, &path) {
        return;
    }
    let generation = {
        let Ok(mut pending) = shared.pending.lock() else {
            return;
        };
        let counter = pending.entry(path.clone()).or_insert(0);
        *counter += 1;
        *counter
    };

    let shared = Arc::clone(shared);
    thread::spawn(move || {
        thread::sleep(WATCH_DEBOUNCE);
        {
            let Ok(mut pending) = shared.pending.lock() else {
                return;
            };
            if pending.get(&path) != Some(&generation) {
                // A newer notification superseded this one.
                return;
            }
            pending.remove(&path);
        }
        process_path(&shared, &path);
    });
}

/// Re-reads `path` and emits an event only when the observed signature
/// actually changed.
fn process_path(shared: &Arc<WatcherShared>, path: &Path) {
    match fs::metadata(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let removed = shared
                .files
                .lock()
                .map(|mut files| files.remove(path).is_some())
                .unwrap_or(false);
            if removed {
                emit(shared, WatchKind::Unlink, path);
            }
        }
        Err(err) => warn!("failed to stat watched path {:?}: {err}", path),
        Ok(meta) => {
            if !meta.is_file() {
                return;
            }
            // Cheap pre-check: an unchanged size and mtime means the file
            // was not touched at all; skip the re-read entirely.
            let mtime = meta.modified().ok();
            {
                let Ok(files) = shared.files.lock() else {
                    return;
                };
                if let Some(old) = files.get(path)
                    && mtime.is_some()
                    && old.mtime == mtime
                    && old.size == meta.len()
                {
                    return;
                }
            }
            let sig = match read_sig(path) {
                Ok(sig) => sig,
                Err(err) => {
                    warn!("failed to read watched file {:?}: {err}", path);
                    return;
                }
            };
            let kind = {
                let Ok(mut files) = shared.files.lock() else {
                    return;
                };
                match files.get(path) {
                    None => {
                        files.insert(path.to_path_buf(), sig);
                        Some(WatchKind::Add)
                    }
                    Some(old) if old.digest != sig.digest || old.size != sig.size => {
                        files.insert(path.to_path_buf(), sig);
                        Some(WatchKind::Change)
                    }
                    Some(_) => {
                        // Same content; refresh the timestamp silently.
                        files.insert(path.to_path_buf(), sig);
                        None
                    }
                }
            };
            if let Some(kind) = kind {
                emit(shared, kind, path);
            }
        }
    }
}

fn emit(shared: &Arc<WatcherShared>, kind: WatchKind, path: &Path) {
    debug!("watch event {kind:?} for {:?}", path);
    let event = WatchEvent {
        kind,
        path: path.to_path_buf(),
    };
    if let Ok(mut subscribers) = shared.subscribers.lock() {
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn read_sig(path: &Path) -> io::Result<FileSig> {
    let meta = fs::metadata(path)?;
    let contents = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(FileSig {
        digest: hasher.finalize().into(),
        size: meta.len(),
        mtime: meta.modified().ok(),
    })
}

fn is_ignored(shared: &WatcherShared, path: &Path) -> bool {
    let relative = path.strip_prefix(&shared.base).unwrap_or(path);
    let candidate = relative.to_string_lossy();
    shared.ignore.iter().any(|re| re.is_match(&candidate))
}

/// Translates an ignore glob into an anchored regular expression. `**`
/// crosses directory separators, `*` and `?` do not.
fn glob_to_regex(glob: &str) -> Result<Regex, WatcherError> {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Collapse "**/" so the pattern also matches the root.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        pattern.push_str("(?:.*/)?");
                    } else {
                        pattern.push_str(".*");
                    }
                } else {
                    pattern.push_str("[^/]*");
                }
            }
            '?' => pattern.push_str("[^/]"),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|_| WatcherError::Pattern(glob.to_string()))
}
