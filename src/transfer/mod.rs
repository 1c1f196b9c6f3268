pub mod receive;
pub mod send;
pub mod throughput;
pub mod write_cache;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub use throughput::{Speed, ThroughputEstimator, TimeLeft};
pub use write_cache::WriteCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim_start_matches('#').parse().map(TransferId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Queued,
    Preparing,
    WaitingRemote,
    Connecting,
    Sending,
    Receiving,
    Done,
    Failed,
    Aborted,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Done | TransferStatus::Failed | TransferStatus::Aborted
        )
    }

    pub fn is_transferring(&self) -> bool {
        matches!(self, TransferStatus::Sending | TransferStatus::Receiving)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStatus::Queued => "Queued",
            TransferStatus::Preparing => "Preparing",
            TransferStatus::WaitingRemote => "Waiting for remote",
            TransferStatus::Connecting => "Connecting",
            TransferStatus::Sending => "Sending",
            TransferStatus::Receiving => "Receiving",
            TransferStatus::Done => "Done",
            TransferStatus::Failed => "Failed",
            TransferStatus::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// Pushed to the UI sink. Progress is not rate limited here.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    OfferReceived {
        id: TransferId,
    },
    ChatOffered {
        id: TransferId,
        partner: String,
        address: Ipv4Addr,
        port: u16,
    },
    StatusChanged {
        id: TransferId,
        old: TransferStatus,
        new: TransferStatus,
    },
    Progress {
        id: TransferId,
        position: u64,
    },
    Done {
        id: TransferId,
    },
    /// One human-readable line for the user.
    Notice {
        id: Option<TransferId>,
        text: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<TransferEvent>;

/// Reported by a transfer's socket task back to the manager.
#[derive(Debug)]
pub enum IoEvent {
    /// The data connection is open. Send tasks wait on `begin` for the
    /// offset to start from, which may have moved through a resume.
    Connected {
        id: TransferId,
        local: SocketAddr,
        remote: SocketAddr,
        begin: Option<oneshot::Sender<u64>>,
    },
    Progress {
        id: TransferId,
        position: u64,
    },
    Completed {
        id: TransferId,
        position: u64,
    },
    Failed {
        id: TransferId,
        detail: String,
    },
}

impl IoEvent {
    pub fn id(&self) -> TransferId {
        match self {
            IoEvent::Connected { id, .. }
            | IoEvent::Progress { id, .. }
            | IoEvent::Completed { id, .. }
            | IoEvent::Failed { id, .. } => *id,
        }
    }
}

pub type IoSender = mpsc::UnboundedSender<IoEvent>;

/// One file transfer attempt, owned by the transfer manager.
#[derive(Debug)]
pub struct Transfer {
    id: TransferId,
    direction: TransferDirection,
    status: TransferStatus,
    status_detail: Option<String>,

    pub partner_nick: String,
    pub partner_address: Option<Ipv4Addr>,
    pub partner_port: u16,
    pub own_address: Option<Ipv4Addr>,
    pub own_port: u16,

    /// Name as advertised on the wire.
    pub file_name: String,
    /// 0 when unknown.
    pub file_size: u64,
    /// Source file (send) or final destination (receive).
    pub local_path: Option<PathBuf>,

    position: u64,
    pub start_position: u64,
    pub resumed: bool,

    pub passive: bool,
    pub token: Option<String>,

    pub offered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    waiting_since: Option<Instant>,
    transfer_clock: Option<Instant>,
    throughput: ThroughputEstimator,
    events: EventSender,
}

impl Transfer {
    pub fn new(
        id: TransferId,
        direction: TransferDirection,
        partner_nick: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        events: EventSender,
    ) -> Self {
        Self {
            id,
            direction,
            status: TransferStatus::Queued,
            status_detail: None,
            partner_nick: partner_nick.into(),
            partner_address: None,
            partner_port: 0,
            own_address: None,
            own_port: 0,
            file_name: file_name.into(),
            file_size,
            local_path: None,
            position: 0,
            start_position: 0,
            resumed: false,
            passive: false,
            token: None,
            offered_at: Utc::now(),
            started_at: None,
            finished_at: None,
            waiting_since: None,
            transfer_clock: None,
            throughput: ThroughputEstimator::new(),
            events,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn status_detail(&self) -> Option<&str> {
        self.status_detail.as_deref()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn waiting_since(&self) -> Option<Instant> {
        self.waiting_since
    }

    pub fn partner_is(&self, nick: &str) -> bool {
        self.partner_nick.eq_ignore_ascii_case(nick)
    }

    /// Sets the offset the next data connection starts from.
    pub fn set_start_position(&mut self, position: u64) {
        self.start_position = position;
        self.position = position;
        self.resumed = position > 0;
    }

    /// Moves to `new`, emitting one status-changed event. Terminal states are final.
    pub fn set_status(&mut self, new: TransferStatus, detail: Option<String>) -> bool {
        if self.status.is_terminal() || self.status == new {
            return false;
        }

        let old = self.status;
        self.status = new;
        self.status_detail = detail;

        match new {
            TransferStatus::WaitingRemote => self.waiting_since = Some(Instant::now()),
            TransferStatus::Sending | TransferStatus::Receiving => {
                self.waiting_since = None;
                self.started_at = Some(Utc::now());
                self.transfer_clock = Some(Instant::now());
                self.throughput.reset();
                self.throughput.sample(0, self.position);
            }
            TransferStatus::Done | TransferStatus::Failed | TransferStatus::Aborted => {
                self.waiting_since = None;
                self.finished_at = Some(Utc::now());
            }
            _ => self.waiting_since = None,
        }

        match &self.status_detail {
            Some(detail) => info!(
                "Transfer {} ({}): {} -> {} ({})",
                self.id, self.file_name, old, new, detail
            ),
            None => info!("Transfer {} ({}): {} -> {}", self.id, self.file_name, old, new),
        }

        self.emit(TransferEvent::StatusChanged {
            id: self.id,
            old,
            new,
        });
        if new.is_terminal() {
            let text = self.terminal_notice();
            self.emit(TransferEvent::Notice {
                id: Some(self.id),
                text,
            });
        }
        if new == TransferStatus::Done {
            self.emit(TransferEvent::Done { id: self.id });
        }
        true
    }

    pub fn fail(&mut self, detail: impl Into<String>) -> bool {
        self.set_status(TransferStatus::Failed, Some(detail.into()))
    }

    /// Records durable progress. Ignored outside the transferring states.
    pub fn record_progress(&mut self, position: u64) {
        if !self.status.is_transferring() {
            debug!("Ignoring progress for {} in state {}", self.id, self.status);
            return;
        }
        if position < self.position {
            warn!(
                "Transfer {} reported position {} behind {}",
                self.id, position, self.position
            );
            return;
        }
        if self.file_size > 0 && position > self.file_size {
            warn!(
                "Transfer {} reported position {} past size {}",
                self.id, position, self.file_size
            );
            return;
        }

        self.position = position;
        let elapsed = self
            .transfer_clock
            .map(|clock| clock.elapsed().as_millis() as i64)
            .unwrap_or(0);
        self.throughput.sample(elapsed, position);
        self.emit(TransferEvent::Progress {
            id: self.id,
            position,
        });
    }

    pub fn current_speed(&self) -> Speed {
        self.throughput.current_speed()
    }

    pub fn time_left(&self) -> TimeLeft {
        self.throughput
            .time_left(self.status.is_transferring(), self.file_size, self.position)
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id,
            direction: self.direction,
            status: self.status,
            status_detail: self.status_detail.clone(),
            partner_nick: self.partner_nick.clone(),
            partner_address: self.partner_address,
            partner_port: self.partner_port,
            own_address: self.own_address,
            own_port: self.own_port,
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            local_path: self.local_path.clone(),
            position: self.position,
            start_position: self.start_position,
            resumed: self.resumed,
            passive: self.passive,
            token: self.token.clone(),
            offered_at: self.offered_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            speed: self.current_speed(),
            time_left: self.time_left(),
        }
    }

    fn emit(&self, event: TransferEvent) {
        // The sink going away is not the transfer's problem.
        let _ = self.events.send(event);
    }

    fn terminal_notice(&self) -> String {
        let (verb, preposition) = match self.direction {
            TransferDirection::Send => ("Sending", "to"),
            TransferDirection::Receive => ("Receiving", "from"),
        };
        match self.status {
            TransferStatus::Done => match self.direction {
                TransferDirection::Send => {
                    format!("Sent file \"{}\" to {}.", self.file_name, self.partner_nick)
                }
                TransferDirection::Receive => format!(
                    "Received file \"{}\" from {}.",
                    self.file_name, self.partner_nick
                ),
            },
            TransferStatus::Aborted => format!(
                "{} \"{}\" {} {} was aborted.",
                verb, self.file_name, preposition, self.partner_nick
            ),
            _ => format!(
                "{} \"{}\" {} {} failed: {}.",
                verb,
                self.file_name,
                preposition,
                self.partner_nick,
                self.status_detail.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

/// Read-only view handed to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub id: TransferId,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub status_detail: Option<String>,
    pub partner_nick: String,
    pub partner_address: Option<Ipv4Addr>,
    pub partner_port: u16,
    pub own_address: Option<Ipv4Addr>,
    pub own_port: u16,
    pub file_name: String,
    pub file_size: u64,
    pub local_path: Option<PathBuf>,
    pub position: u64,
    pub start_position: u64,
    pub resumed: bool,
    pub passive: bool,
    pub token: Option<String>,
    pub offered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub speed: Speed,
    pub time_left: TimeLeft,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer() -> (Transfer, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transfer = Transfer::new(
            TransferId(1),
            TransferDirection::Receive,
            "bob",
            "a b.txt",
            100,
            tx,
        );
        (transfer, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_status_changes_emit_in_order() {
        let (mut transfer, mut rx) = transfer();
        assert!(transfer.set_status(TransferStatus::Preparing, None));
        assert!(transfer.set_status(TransferStatus::Connecting, None));
        assert!(!transfer.set_status(TransferStatus::Connecting, None));

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                TransferEvent::StatusChanged {
                    id: TransferId(1),
                    old: TransferStatus::Queued,
                    new: TransferStatus::Preparing,
                },
                TransferEvent::StatusChanged {
                    id: TransferId(1),
                    old: TransferStatus::Preparing,
                    new: TransferStatus::Connecting,
                },
            ]
        );
    }

    #[test]
    fn test_terminal_state_is_one_shot() {
        let (mut transfer, mut rx) = transfer();
        assert!(transfer.set_status(TransferStatus::Aborted, None));
        assert!(!transfer.set_status(TransferStatus::Aborted, None));
        assert!(!transfer.fail("late error"));
        assert_eq!(transfer.status(), TransferStatus::Aborted);

        let events = drain(&mut rx);
        let changes = events
            .iter()
            .filter(|e| matches!(e, TransferEvent::StatusChanged { .. }))
            .count();
        let notices: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Notice { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(changes, 1);
        assert_eq!(notices, vec!["Receiving \"a b.txt\" from bob was aborted.".to_string()]);
    }

    #[test]
    fn test_failure_keeps_detail() {
        let (mut transfer, _rx) = transfer();
        transfer.fail("connection reset");
        assert_eq!(transfer.status(), TransferStatus::Failed);
        assert_eq!(transfer.status_detail(), Some("connection reset"));
        assert!(transfer.finished_at.is_some());
    }

    #[test]
    fn test_progress_only_moves_forward_while_transferring() {
        let (mut transfer, mut rx) = transfer();
        transfer.record_progress(10);
        assert_eq!(transfer.position(), 0);

        transfer.set_status(TransferStatus::Receiving, None);
        transfer.record_progress(40);
        transfer.record_progress(30);
        transfer.record_progress(200);
        assert_eq!(transfer.position(), 40);

        let progress: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, TransferEvent::Progress { .. }))
            .collect();
        assert_eq!(
            progress,
            vec![TransferEvent::Progress {
                id: TransferId(1),
                position: 40
            }]
        );
    }

    #[test]
    fn test_time_left_not_applicable_when_idle() {
        let (transfer, _rx) = transfer();
        assert_eq!(transfer.time_left(), TimeLeft::NotApplicable);
        assert_eq!(transfer.current_speed(), Speed::Calculating);
    }

    #[test]
    fn test_id_parsing() {
        assert_eq!("#7".parse::<TransferId>().unwrap(), TransferId(7));
        assert_eq!("12".parse::<TransferId>().unwrap(), TransferId(12));
        assert_eq!(TransferId(3).to_string(), "#3");
    }
}
