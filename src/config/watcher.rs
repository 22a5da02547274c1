//! Configuration file watcher for hot reload.
//!
//! # Data Flow
//! ```text
//! parent directory events (notify)
//!     → filter to the config file's name
//!     → skip if the content is byte-identical to the last load
//!     → parse_config (parse + validate)
//!     → mpsc::UnboundedSender<GatewayConfig>
//! ```
//!
//! # Design Decisions
//! - Watches the parent directory so editors that save by rename are seen
//! - Invalid files are logged and dropped; the running table stays in place

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::parse_config;
use crate::config::schema::GatewayConfig;

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<GatewayConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for validated configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<GatewayConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            update_tx,
        };
        (watcher, update_rx)
    }

    /// Start watching in a background thread.
    ///
    /// Updates stop when the returned handle is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let last = Mutex::new(fs::read_to_string(&self.path).ok());
        let ConfigWatcher { path, update_tx } = self;
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = %e, "Config watch error");
                        return;
                    }
                };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                if !event.paths.iter().any(|p| p.file_name() == file_name.as_deref()) {
                    return;
                }
                reload(&path, &last, &update_tx);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&directory, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %watched.display(), "Config watcher started");
        Ok(watcher)
    }
}

fn reload(
    path: &Path,
    last: &Mutex<Option<String>>,
    tx: &mpsc::UnboundedSender<GatewayConfig>,
) {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Config file unreadable, keeping current configuration");
            return;
        }
    };

    let mut last = match last.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if last.as_deref() == Some(content.as_str()) {
        return;
    }

    match parse_config(&content) {
        Ok(config) => {
            tracing::info!(path = %path.display(), policies = config.policies.len(), "Config file changed");
            *last = Some(content);
            let _ = tx.send(config);
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Rejected config change, keeping current configuration");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[session]
cookie_secret = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8="

[services]
authenticate_url = "https://auth.example.com"
authorize_url = "https://authz.internal"
shared_secret = "s3cret"
"#;

    #[test]
    fn reload_skips_unchanged_and_invalid_content() {
        let dir = std::env::temp_dir().join(format!("gatehouse-watch-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gatehouse.toml");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let last = Mutex::new(None);

        fs::write(&path, CONFIG).unwrap();
        reload(&path, &last, &tx);
        assert!(rx.try_recv().is_ok());

        reload(&path, &last, &tx);
        assert!(rx.try_recv().is_err());

        fs::write(&path, "[session").unwrap();
        reload(&path, &last, &tx);
        assert!(rx.try_recv().is_err());

        let policy = "\n[[policies]]\nfrom = \"https://app.example.com\"\nto = \"http://app.internal\"\n";
        fs::write(&path, format!("{}{}", CONFIG, policy)).unwrap();
        reload(&path, &last, &tx);
        assert_eq!(rx.try_recv().unwrap().policies.len(), 1);

        fs::remove_dir_all(&dir).unwrap();
    }
}
