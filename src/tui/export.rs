use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;
use std::time::Duration;

// Global clipboard manager channel - initialized once on first use
static CLIPBOARD_SENDER: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

/// `<output_root>/<map>-<utc timestamp>.log`
pub fn log_path(output_root: &Path, map: &str, at: time::OffsetDateTime) -> PathBuf {
    let stamp = at
        .format(time::macros::format_description!(
            "[year][month][day]-[hour][minute][second]"
        ))
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    output_root.join(format!("{map}-{stamp}.log"))
}

/// Write a run's full output next to the rendered maps. Returns the file written.
pub fn save_output_log(map: &str, text: &str, output_root: &str) -> Result<PathBuf> {
    let root = output_root.trim();
    if root.is_empty() {
        anyhow::bail!("no output folder configured");
    }
    let root = Path::new(root);
    std::fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
    let path = log_path(root, map, time::OffsetDateTime::now_utc());
    std::fs::write(&path, text.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Initialize the clipboard manager thread if not already initialized.
/// Each copy keeps its clipboard instance alive for a while so clipboard managers
/// on Linux get a chance to read it.
fn init_clipboard_manager() -> Result<&'static std_mpsc::Sender<String>> {
    CLIPBOARD_SENDER.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();

        std::thread::spawn(move || {
            use arboard::Clipboard;

            for text in rx {
                match Clipboard::new() {
                    Ok(mut clipboard) => {
                        if clipboard.set_text(&text).is_ok() {
                            std::thread::sleep(Duration::from_secs(2));
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "clipboard unavailable"),
                }
            }
        });

        tx
    });

    CLIPBOARD_SENDER
        .get()
        .ok_or_else(|| anyhow::anyhow!("Failed to initialize clipboard manager"))
}

/// Queue `text` for the clipboard; returns without waiting.
pub fn copy_to_clipboard(text: &str) -> Result<()> {
    let sender = init_clipboard_manager()?;
    sender
        .send(text.to_string())
        .map_err(|_| anyhow::anyhow!("Clipboard manager channel closed"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_name_carries_map_and_timestamp() {
        let at = time::macros::datetime!(2024-03-05 07:08:09 UTC);
        let path = log_path(Path::new("/maps"), "world1", at);
        assert_eq!(path, Path::new("/maps/world1-20240305-070809.log"));
    }

    #[test]
    fn saves_output_under_output_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("maps");
        let path = save_output_log("world1", "rendering...\n", root.to_str().unwrap()).unwrap();
        assert!(path.starts_with(&root));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "rendering...\n");
    }

    #[test]
    fn empty_output_root_is_rejected() {
        assert!(save_output_log("world1", "", "  ").is_err());
    }
}
