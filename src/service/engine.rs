use super::manager::{OutgoingControl, TransferManager};
use crate::config::Settings;
use crate::transfer::{IoEvent, TransferEvent, TransferId, TransferSnapshot};
use crate::{DccError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

const TIMEOUT_TICK: Duration = Duration::from_secs(1);

enum EngineCommand {
    OfferFile {
        partner: String,
        path: PathBuf,
        passive: Option<bool>,
        reply: oneshot::Sender<Result<TransferId>>,
    },
    OfferChat {
        partner: String,
        passive: bool,
        reply: oneshot::Sender<Result<TransferId>>,
    },
    HandleControl {
        partner: String,
        args: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    Accept {
        id: TransferId,
        reply: oneshot::Sender<Result<()>>,
    },
    Abort {
        id: TransferId,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<TransferSnapshot>>,
    },
    Shutdown,
}

/// Cheap, cloneable front door to a running [`DccEngine`].
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| DccError::EngineStopped)?;
        response.await.map_err(|_| DccError::EngineStopped)
    }

    /// Offers a local file to `partner`. `passive` overrides the configured default.
    pub async fn offer_file(
        &self,
        partner: &str,
        path: impl Into<PathBuf>,
        passive: Option<bool>,
    ) -> Result<TransferId> {
        let partner = partner.to_string();
        let path = path.into();
        self.request(|reply| EngineCommand::OfferFile {
            partner,
            path,
            passive,
            reply,
        })
        .await?
    }

    pub async fn offer_chat(&self, partner: &str, passive: bool) -> Result<TransferId> {
        let partner = partner.to_string();
        self.request(|reply| EngineCommand::OfferChat {
            partner,
            passive,
            reply,
        })
        .await?
    }

    /// Feeds a DCC request received from `partner` (verb first, prefix stripped).
    pub async fn handle_control<S: AsRef<str>>(&self, partner: &str, args: &[S]) -> Result<()> {
        let partner = partner.to_string();
        let args = args.iter().map(|a| a.as_ref().to_string()).collect();
        self.request(|reply| EngineCommand::HandleControl {
            partner,
            args,
            reply,
        })
        .await
    }

    pub async fn accept(&self, id: TransferId) -> Result<()> {
        self.request(|reply| EngineCommand::Accept { id, reply })
            .await?
    }

    pub async fn abort(&self, id: TransferId) -> Result<()> {
        self.request(|reply| EngineCommand::Abort { id, reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<Vec<TransferSnapshot>> {
        self.request(|reply| EngineCommand::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(EngineCommand::Shutdown)
            .await
            .map_err(|_| DccError::EngineStopped)
    }
}

/// Actor that owns the [`TransferManager`].
pub struct DccEngine {
    manager: TransferManager,
    commands: mpsc::Receiver<EngineCommand>,
    io_events: mpsc::UnboundedReceiver<IoEvent>,
}

impl DccEngine {
    pub fn new(
        settings: Settings,
    ) -> (
        Self,
        EngineHandle,
        mpsc::UnboundedReceiver<OutgoingControl>,
        mpsc::UnboundedReceiver<TransferEvent>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (manager, io_events) =
            TransferManager::new(Arc::new(settings), control_tx, event_tx);

        let engine = Self {
            manager,
            commands: command_rx,
            io_events,
        };
        let handle = EngineHandle {
            commands: command_tx,
        };
        (engine, handle, control_rx, event_rx)
    }

    /// Runs until `shutdown` is requested or every handle is dropped.
    pub async fn run(mut self) {
        info!("DCC engine started");
        let mut ticker = interval(TIMEOUT_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(EngineCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                Some(event) = self.io_events.recv() => {
                    self.manager.handle_io_event(event);
                }
                _ = ticker.tick() => {
                    self.manager.check_timeouts(Instant::now().into_std());
                }
            }
        }

        self.manager.shutdown();
        info!("DCC engine stopped");
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::OfferFile {
                partner,
                path,
                passive,
                reply,
            } => {
                let passive = passive.unwrap_or(self.manager.passive_default());
                let result = self.manager.offer_file(&partner, &path, passive).await;
                let _ = reply.send(result);
            }
            EngineCommand::OfferChat {
                partner,
                passive,
                reply,
            } => {
                let _ = reply.send(self.manager.offer_chat(&partner, passive));
            }
            EngineCommand::HandleControl {
                partner,
                args,
                reply,
            } => {
                self.manager.handle_control(&partner, &args).await;
                let _ = reply.send(());
            }
            EngineCommand::Accept { id, reply } => {
                let _ = reply.send(self.manager.start(id).await);
            }
            EngineCommand::Abort { id, reply } => {
                let _ = reply.send(self.manager.abort(id));
            }
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(self.manager.snapshot());
            }
            EngineCommand::Shutdown => {
                debug!("Shutdown handled by the run loop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferStatus;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn settings(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.network.bind_address = Ipv4Addr::LOCALHOST;
        settings.network.public_address = Some(Ipv4Addr::LOCALHOST);
        settings.transfer.download_dir = Some(dir.to_path_buf());
        settings
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let dir = tempdir().unwrap();
        let (engine, handle, mut control, _events) = DccEngine::new(settings(dir.path()));
        let runner = tokio::spawn(engine.run());

        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let id = handle.offer_file("bob", &path, Some(true)).await.unwrap();
        let offer = control.recv().await.unwrap();
        assert_eq!(offer.partner, "bob");
        assert_eq!(offer.text, "SEND hello.txt 2130706433 0 5 1");

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, TransferStatus::WaitingRemote);

        handle.abort(id).await.unwrap();
        handle.abort(id).await.unwrap();
        assert!(matches!(
            handle.accept(TransferId(99)).await,
            Err(DccError::UnknownTransfer(_))
        ));

        handle.shutdown().await.unwrap();
        runner.await.unwrap();
        assert!(matches!(
            handle.snapshot().await,
            Err(DccError::EngineStopped)
        ));
    }

    #[tokio::test]
    async fn test_invalid_control_reports_notice() {
        let dir = tempdir().unwrap();
        let (engine, handle, _control, mut events) = DccEngine::new(settings(dir.path()));
        tokio::spawn(engine.run());

        handle
            .handle_control("mallory", &["SEND", "x", "1", "2"])
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            TransferEvent::Notice { id: None, text } => {
                assert_eq!(text, "Received invalid DCC SEND request from mallory.")
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(handle.snapshot().await.unwrap().is_empty());
    }
}
