use async_trait::async_trait;
use pipecore::{Interaction, NodeError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

/// Line-oriented interaction over the process's stdin/stdout.
pub struct StdioInteraction {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl StdioInteraction {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl Interaction for StdioInteraction {
    async fn send(&self, message: &str) -> Result<(), NodeError> {
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("{}\n", message).as_bytes())
            .await
            .map_err(|e| NodeError::Interaction(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| NodeError::Interaction(e.to_string()))
    }

    async fn recv(&self) -> Result<String, NodeError> {
        let mut lines = self.lines.lock().await;
        match lines.next_line().await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(NodeError::Interaction("stdin closed".to_string())),
            Err(e) => Err(NodeError::Interaction(e.to_string())),
        }
    }
}
