//! Async command-channel facade over the controller.
//!
//! The runtime owns a dedicated thread that drains typed commands from a
//! channel and applies them to the shared controller, so async callers
//! (gateways, agents) never touch fabric state concurrently: every mutation
//! goes through one loop.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::node::FileTransfer;

use super::controller::{EventRecord, FabricController, NodeInfo, NodeSpec, NodeStatus};
use super::error::{ControllerError, ControllerResult};

enum Command {
    AddNode {
        node_id: String,
        spec: NodeSpec,
        reply: oneshot::Sender<ControllerResult<()>>,
    },
    RemoveNode {
        node_id: String,
        reply: oneshot::Sender<bool>,
    },
    ConnectNodes {
        node_a: String,
        node_b: String,
        bandwidth_mbps: Option<u64>,
        latency_ms: Option<f64>,
        reply: oneshot::Sender<bool>,
    },
    InitiateTransfer {
        source: String,
        target: String,
        file_name: String,
        size_bytes: u64,
        reply: oneshot::Sender<ControllerResult<FileTransfer>>,
    },
    PushFile {
        source: String,
        file_name: String,
        size_bytes: u64,
        prefer_local: bool,
        reply: oneshot::Sender<ControllerResult<(String, FileTransfer)>>,
    },
    RunUntilIdle {
        reply: oneshot::Sender<f64>,
    },
    RunFor {
        duration: f64,
        reply: oneshot::Sender<f64>,
    },
    FailNode {
        node_id: String,
        reply: oneshot::Sender<bool>,
    },
    RestoreNode {
        node_id: String,
        reply: oneshot::Sender<()>,
    },
    FailLink {
        node_a: String,
        node_b: String,
        reply: oneshot::Sender<bool>,
    },
    RestoreLink {
        node_a: String,
        node_b: String,
        reply: oneshot::Sender<()>,
    },
    NodeInfo {
        node_id: String,
        reply: oneshot::Sender<Option<NodeInfo>>,
    },
    ListNodes {
        reply: oneshot::Sender<Vec<NodeStatus>>,
    },
    RecentEvents {
        limit: usize,
        reply: oneshot::Sender<Vec<EventRecord>>,
    },
    Shutdown,
}

pub struct ControllerRuntime {
    thread: Option<JoinHandle<()>>,
    tx: mpsc::Sender<Command>,
}

#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerRuntime {
    /// Start the command loop on its own thread. The controller stays
    /// shareable: direct callers and the runtime serialize on its mutex.
    pub fn spawn(controller: Arc<Mutex<FabricController>>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(64);
        let thread = std::thread::spawn(move || {
            while let Some(command) = rx.blocking_recv() {
                match command {
                    Command::AddNode {
                        node_id,
                        spec,
                        reply,
                    } => {
                        let _ = reply.send(controller.lock().add_node(&node_id, spec));
                    }
                    Command::RemoveNode { node_id, reply } => {
                        let _ = reply.send(controller.lock().remove_node(&node_id));
                    }
                    Command::ConnectNodes {
                        node_a,
                        node_b,
                        bandwidth_mbps,
                        latency_ms,
                        reply,
                    } => {
                        let _ = reply.send(controller.lock().connect_nodes(
                            &node_a,
                            &node_b,
                            bandwidth_mbps,
                            latency_ms,
                        ));
                    }
                    Command::InitiateTransfer {
                        source,
                        target,
                        file_name,
                        size_bytes,
                        reply,
                    } => {
                        let _ = reply.send(controller.lock().initiate_transfer(
                            &source,
                            &target,
                            &file_name,
                            size_bytes,
                        ));
                    }
                    Command::PushFile {
                        source,
                        file_name,
                        size_bytes,
                        prefer_local,
                        reply,
                    } => {
                        let _ = reply.send(controller.lock().push_file(
                            &source,
                            &file_name,
                            size_bytes,
                            prefer_local,
                        ));
                    }
                    Command::RunUntilIdle { reply } => {
                        let mut controller = controller.lock();
                        controller.run_until_idle();
                        let _ = reply.send(controller.now());
                    }
                    Command::RunFor { duration, reply } => {
                        let mut controller = controller.lock();
                        controller.run_for(duration);
                        let _ = reply.send(controller.now());
                    }
                    Command::FailNode { node_id, reply } => {
                        let _ = reply.send(controller.lock().fail_node(&node_id));
                    }
                    Command::RestoreNode { node_id, reply } => {
                        controller.lock().restore_node(&node_id);
                        let _ = reply.send(());
                    }
                    Command::FailLink {
                        node_a,
                        node_b,
                        reply,
                    } => {
                        let _ = reply.send(controller.lock().fail_link(&node_a, &node_b));
                    }
                    Command::RestoreLink {
                        node_a,
                        node_b,
                        reply,
                    } => {
                        controller.lock().restore_link(&node_a, &node_b);
                        let _ = reply.send(());
                    }
                    Command::NodeInfo { node_id, reply } => {
                        let _ = reply.send(controller.lock().get_node_info(&node_id));
                    }
                    Command::ListNodes { reply } => {
                        let _ = reply.send(controller.lock().list_node_status());
                    }
                    Command::RecentEvents { limit, reply } => {
                        let _ = reply.send(controller.lock().recent_events(limit));
                    }
                    Command::Shutdown => break,
                }
            }
        });
        Self {
            thread: Some(thread),
            tx,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Stop the command loop and join the thread.
    pub async fn shutdown(mut self) {
        let _ = self.tx.send(Command::Shutdown).await;
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
    }
}

impl Drop for ControllerRuntime {
    fn drop(&mut self) {
        let _ = self.tx.try_send(Command::Shutdown);
    }
}

impl ControllerHandle {
    async fn send<R>(
        &self,
        command: Command,
        rx: oneshot::Receiver<R>,
    ) -> ControllerResult<R> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ControllerError::RuntimeStopped)?;
        rx.await.map_err(|_| ControllerError::RuntimeStopped)
    }

    pub async fn add_node(&self, node_id: &str, spec: NodeSpec) -> ControllerResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::AddNode {
                node_id: node_id.to_string(),
                spec,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn remove_node(&self, node_id: &str) -> ControllerResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::RemoveNode {
                node_id: node_id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn connect_nodes(
        &self,
        node_a: &str,
        node_b: &str,
        bandwidth_mbps: Option<u64>,
        latency_ms: Option<f64>,
    ) -> ControllerResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::ConnectNodes {
                node_a: node_a.to_string(),
                node_b: node_b.to_string(),
                bandwidth_mbps,
                latency_ms,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn initiate_transfer(
        &self,
        source: &str,
        target: &str,
        file_name: &str,
        size_bytes: u64,
    ) -> ControllerResult<FileTransfer> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::InitiateTransfer {
                source: source.to_string(),
                target: target.to_string(),
                file_name: file_name.to_string(),
                size_bytes,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn push_file(
        &self,
        source: &str,
        file_name: &str,
        size_bytes: u64,
        prefer_local: bool,
    ) -> ControllerResult<(String, FileTransfer)> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::PushFile {
                source: source.to_string(),
                file_name: file_name.to_string(),
                size_bytes,
                prefer_local,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn run_until_idle(&self) -> ControllerResult<f64> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RunUntilIdle { reply }, rx).await
    }

    pub async fn run_for(&self, duration: f64) -> ControllerResult<f64> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RunFor { duration, reply }, rx).await
    }

    pub async fn fail_node(&self, node_id: &str) -> ControllerResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::FailNode {
                node_id: node_id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn restore_node(&self, node_id: &str) -> ControllerResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::RestoreNode {
                node_id: node_id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn fail_link(&self, node_a: &str, node_b: &str) -> ControllerResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::FailLink {
                node_a: node_a.to_string(),
                node_b: node_b.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn restore_link(&self, node_a: &str, node_b: &str) -> ControllerResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::RestoreLink {
                node_a: node_a.to_string(),
                node_b: node_b.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn node_info(&self, node_id: &str) -> ControllerResult<Option<NodeInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(
            Command::NodeInfo {
                node_id: node_id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn list_nodes(&self) -> ControllerResult<Vec<NodeStatus>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ListNodes { reply }, rx).await
    }

    pub async fn recent_events(&self, limit: usize) -> ControllerResult<Vec<EventRecord>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RecentEvents { limit, reply }, rx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TransferStatus;

    #[tokio::test]
    async fn commands_flow_through_the_runtime() {
        let controller = Arc::new(Mutex::new(FabricController::new()));
        let runtime = ControllerRuntime::spawn(Arc::clone(&controller));
        let handle = runtime.handle();

        handle.add_node("A", NodeSpec::default()).await.unwrap();
        handle.add_node("B", NodeSpec::default()).await.unwrap();
        assert!(handle
            .connect_nodes("A", "B", Some(1000), Some(1.0))
            .await
            .unwrap());

        let transfer = handle
            .initiate_transfer("A", "B", "remote.bin", 2 * 1024 * 1024)
            .await
            .unwrap();
        handle.run_until_idle().await.unwrap();

        let stored = controller
            .lock()
            .network()
            .node("B")
            .unwrap()
            .stored_file(&transfer.file_id)
            .cloned();
        assert_eq!(stored.unwrap().status, TransferStatus::Completed);

        let nodes = handle.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        let events = handle.recent_events(50).await.unwrap();
        assert!(events.iter().any(|r| r.event.kind() == "transfer_completed"));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_node_error_crosses_the_channel() {
        let controller = Arc::new(Mutex::new(FabricController::new()));
        let runtime = ControllerRuntime::spawn(controller);
        let handle = runtime.handle();

        handle.add_node("A", NodeSpec::default()).await.unwrap();
        assert!(matches!(
            handle.add_node("A", NodeSpec::default()).await,
            Err(ControllerError::DuplicateNode(_))
        ));
        runtime.shutdown().await;
    }
}
