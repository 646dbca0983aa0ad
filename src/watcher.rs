use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config;
use crate::handler::Handler;

pub fn spawn(path: PathBuf, handler: Arc<Handler>) {
    // a blocking thread owns the watcher; the async refresh runs on the
    // captured runtime handle
    let runtime = tokio::runtime::Handle::current();
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, handler, runtime) {
            error!(target: "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(
    path: PathBuf,
    handler: Arc<Handler>,
    runtime: tokio::runtime::Handle,
) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target: "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                // retry to ride out truncate+write races
                let mut retries = 3;
                while retries > 0 {
                    match config::load_config(&path).and_then(|cfg| config::build_snapshot(&cfg)) {
                        Ok(snapshot) => {
                            match runtime.block_on(handler.refresh(snapshot)) {
                                Ok(()) => {
                                    info!(target: "watcher", path = %path.display(), "config reloaded")
                                }
                                Err(err) => {
                                    warn!(target: "watcher", path = %path.display(), error = %err, "config reload rejected, keeping old snapshot")
                                }
                            }
                            break;
                        }
                        Err(err) => {
                            retries -= 1;
                            if retries == 0 {
                                warn!(target: "watcher", path = %path.display(), error = %err, "config reload failed, keeping old snapshot");
                            } else {
                                std::thread::sleep(std::time::Duration::from_millis(50));
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(target: "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}
