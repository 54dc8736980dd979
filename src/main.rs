use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use dirwatch::{init_logging, DirListener, DirWatcher, LogConfig, WatchEvent};

/// Prints every callback to stdout, as text or one JSON object per line.
struct ConsoleListener {
    root: PathBuf,
    json: bool,
}

impl ConsoleListener {
    fn print(&self, label: &str, event: &WatchEvent, is_directory: Option<bool>) {
        let path = event.context.as_ref().map(|p| self.root.join(p));

        if self.json {
            let line = serde_json::json!({
                "event": event,
                "path": path,
                "is_directory": is_directory,
            });
            println!("{line}");
            return;
        }

        match (path, is_directory) {
            (Some(path), Some(true)) => println!("{label} directory: {}", path.display()),
            (Some(path), Some(false)) => println!("{label} file: {}", path.display()),
            (Some(path), None) => println!("{label}: {}", path.display()),
            (None, _) => println!("{label}"),
        }
    }
}

impl DirListener for ConsoleListener {
    fn on_create(&self, event: &WatchEvent) {
        let path = event.context.as_ref().map(|p| self.root.join(p));
        self.print("CREATE", event, path.map(|p| p.is_dir()));
    }

    fn on_modify(&self, event: &WatchEvent) {
        self.print("MODIFY", event, None);
    }

    fn on_delete(&self, event: &WatchEvent, is_directory: bool) {
        self.print("DELETE", event, Some(is_directory));
    }

    fn on_overflow(&self, event: &WatchEvent) {
        self.print("OVERFLOW", event, None);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = init_logging(&LogConfig::from_env())?;

    let mut dir = PathBuf::from(".");
    let mut json = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--json" => json = true,
            "-h" | "--help" => {
                println!("usage: dirwatch [DIR] [--json]");
                return Ok(());
            }
            _ => dir = PathBuf::from(arg),
        }
    }

    let watcher = DirWatcher::new(&dir)?;
    let listener: Arc<dyn DirListener> = Arc::new(ConsoleListener {
        root: watcher.root().to_path_buf(),
        json,
    });
    watcher.add_listener(Arc::downgrade(&listener))?;
    watcher.start_watch()?;

    tracing::info!(root = %watcher.root().display(), "Watching, press Enter to stop");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    watcher.stop_watch()?;
    watcher.close()?;
    Ok(())
}
