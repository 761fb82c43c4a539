//! Scripted in-process QMP server for tests: binds a Unix socket, sends
//! the greeting, answers `qmp_capabilities`, and delegates every other
//! command to a handler that returns the raw messages (events and/or the
//! response) to emit. Commands are recorded for assertions.

use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

pub type Handler = Box<dyn FnMut(&str, &Value) -> Vec<Value> + Send>;

pub struct MockQmp {
    path: PathBuf,
    commands: Arc<Mutex<Vec<(String, Value)>>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockQmp {
    /// Serve on `path`. Accepts connections sequentially, so a client may
    /// reconnect (as the driver does across a snapshot load).
    pub fn start(
        path: &Path,
        handler: impl FnMut(&str, &Value) -> Vec<Value> + Send + 'static,
    ) -> std::io::Result<Self> {
        let listener = UnixListener::bind(path)?;
        let commands: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve(listener, commands.clone(), Box::new(handler)));
        Ok(MockQmp {
            path: path.to_path_buf(),
            commands,
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every command received so far, in order, as (name, arguments).
    pub fn commands(&self) -> Vec<(String, Value)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn saw_command(&self, name: &str) -> bool {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .any(|(cmd, _)| cmd == name)
    }
}

impl Drop for MockQmp {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve(
    listener: UnixListener,
    commands: Arc<Mutex<Vec<(String, Value)>>>,
    mut handler: Handler,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let (read_half, mut write_half) = stream.into_split();
        let greeting = json!({
            "QMP": {
                "version": {"qemu": {"major": 8, "minor": 2, "micro": 0}, "package": ""},
                "capabilities": []
            }
        });
        if send_line(&mut write_half, &greeting).await.is_err() {
            continue;
        }

        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(_) => continue,
            };
            let cmd = request
                .get("execute")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = request.get("arguments").cloned().unwrap_or(Value::Null);
            commands.lock().unwrap().push((cmd.clone(), arguments.clone()));

            if cmd == "qmp_capabilities" {
                if send_line(&mut write_half, &json!({"return": {}})).await.is_err() {
                    break;
                }
                continue;
            }

            let mut failed = false;
            for message in handler(&cmd, &arguments) {
                // {"__delay_ms": N} pauses the stream instead of sending
                if let Some(ms) = message.get("__delay_ms").and_then(Value::as_u64) {
                    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                    continue;
                }
                if send_line(&mut write_half, &message).await.is_err() {
                    failed = true;
                    break;
                }
            }
            if failed {
                break;
            }
        }
    }
}

async fn send_line(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    message: &Value,
) -> std::io::Result<()> {
    let mut line = message.to_string();
    line.push('\n');
    write_half.write_all(line.as_bytes()).await
}
