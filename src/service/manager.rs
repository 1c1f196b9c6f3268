use crate::config::Settings;
use crate::network::protocol::{self, DccMessage, Reject, ResumeMessage, SendOffer};
use crate::network::{ChatOffer, PortAllocator};
use crate::transfer::receive::{self, ReceiveEndpoint, ReceiveJob};
use crate::transfer::send::{self, SendEndpoint, SendJob};
use crate::transfer::{
    EventSender, IoEvent, IoSender, Transfer, TransferDirection, TransferEvent, TransferId,
    TransferSnapshot, TransferStatus,
};
use crate::{DccError, Result};
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A control string to deliver to `partner` over the chat channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingControl {
    pub partner: String,
    pub text: String,
}

pub type ControlSender = mpsc::UnboundedSender<OutgoingControl>;

/// A chat negotiation. The session itself belongs to the chat layer.
#[derive(Debug)]
struct ChatRecord {
    id: TransferId,
    partner: String,
    direction: TransferDirection,
    offered_at: Instant,
    /// Held open for the peer of an active outgoing offer.
    _listener: Option<TcpListener>,
}

/// Sole owner of every transfer. All lookups and mutations go through here.
pub struct TransferManager {
    settings: Arc<Settings>,
    advertised: Ipv4Addr,
    transfers: BTreeMap<TransferId, Transfer>,
    chats: Vec<ChatRecord>,
    tasks: HashMap<TransferId, JoinHandle<()>>,
    ports: PortAllocator,
    next_id: u64,
    next_token: u64,
    control: ControlSender,
    events: EventSender,
    io: IoSender,
}

impl TransferManager {
    pub fn new(
        settings: Arc<Settings>,
        control: ControlSender,
        events: EventSender,
    ) -> (Self, mpsc::UnboundedReceiver<IoEvent>) {
        let (io, io_rx) = mpsc::unbounded_channel();
        let advertised = settings.advertised_address();
        let ports = PortAllocator::new(settings.network.bind_address, settings.network.port_range);
        info!("Advertising {} in DCC offers", advertised);

        let manager = Self {
            settings,
            advertised,
            transfers: BTreeMap::new(),
            chats: Vec::new(),
            tasks: HashMap::new(),
            ports,
            next_id: 1,
            next_token: 1,
            control,
            events,
            io,
        };
        (manager, io_rx)
    }

    /// Whether file offers go out passively unless the caller says otherwise.
    pub fn passive_default(&self) -> bool {
        self.settings.network.passive_send
    }

    pub fn get(&self, id: TransferId) -> Option<&Transfer> {
        self.transfers.get(&id)
    }

    /// Every tracked transfer in creation order.
    pub fn transfers(&self) -> impl Iterator<Item = &Transfer> {
        self.transfers.values()
    }

    pub fn snapshot(&self) -> Vec<TransferSnapshot> {
        self.transfers.values().map(Transfer::snapshot).collect()
    }

    fn allocate_id(&mut self) -> TransferId {
        let id = TransferId(self.next_id);
        self.next_id += 1;
        id
    }

    fn allocate_token(&mut self) -> String {
        let token = self.next_token.to_string();
        self.next_token += 1;
        token
    }

    fn send_control(&self, partner: &str, text: String) {
        debug!("DCC to {}: {}", partner, text);
        let _ = self.control.send(OutgoingControl {
            partner: partner.to_string(),
            text,
        });
    }

    fn notice(&self, id: Option<TransferId>, text: String) {
        info!("{}", text);
        let _ = self.events.send(TransferEvent::Notice { id, text });
    }

    pub fn find_by_port_and_direction(
        &self,
        port: u16,
        direction: TransferDirection,
    ) -> Option<TransferId> {
        if port == 0 {
            return None;
        }
        self.transfers
            .values()
            .find(|t| t.is_live() && t.direction() == direction && offered_port(t) == port)
            .map(Transfer::id)
    }

    pub fn find_by_name_and_direction(
        &self,
        file_name: &str,
        direction: TransferDirection,
    ) -> Option<TransferId> {
        self.transfers
            .values()
            .find(|t| t.is_live() && t.direction() == direction && t.file_name == file_name)
            .map(Transfer::id)
    }

    /// Tokens are only unique per peer, so the partner is part of the key.
    pub fn find_by_token(
        &self,
        partner: &str,
        token: &str,
        direction: TransferDirection,
    ) -> Option<TransferId> {
        self.transfers
            .values()
            .find(|t| {
                t.is_live()
                    && t.direction() == direction
                    && t.partner_is(partner)
                    && t.token.as_deref() == Some(token)
            })
            .map(Transfer::id)
    }

    /// Resolves a RESUME/ACCEPT to a live transfer with `partner`: by token
    /// when passive, otherwise by port and then by name.
    fn resolve(
        &self,
        partner: &str,
        message: &ResumeMessage,
        direction: TransferDirection,
    ) -> Option<TransferId> {
        let belongs = |id: &TransferId| {
            self.transfers
                .get(id)
                .map(|t| t.partner_is(partner))
                .unwrap_or(false)
        };

        if let Some(token) = &message.token {
            return self.find_by_token(partner, token, direction);
        }
        self.find_by_port_and_direction(message.port, direction)
            .filter(belongs)
            .or_else(|| {
                self.transfers
                    .values()
                    .find(|t| {
                        t.is_live()
                            && t.direction() == direction
                            && t.partner_is(partner)
                            && t.file_name == message.file_name
                    })
                    .map(Transfer::id)
            })
    }

    fn find_live(
        &self,
        partner: &str,
        file_name: &str,
        direction: TransferDirection,
    ) -> Option<TransferId> {
        self.transfers
            .values()
            .find(|t| {
                t.is_live()
                    && t.direction() == direction
                    && t.partner_is(partner)
                    && t.file_name == file_name
            })
            .map(Transfer::id)
    }

    /// Whether `message` names a transfer with `partner` that already ended.
    fn refers_to_finished(
        &self,
        partner: &str,
        message: &ResumeMessage,
        direction: TransferDirection,
    ) -> bool {
        self.transfers.values().any(|t| {
            !t.is_live()
                && t.direction() == direction
                && t.partner_is(partner)
                && match &message.token {
                    Some(token) => t.token.as_deref() == Some(token.as_str()),
                    None => {
                        (message.port != 0 && offered_port(t) == message.port)
                            || t.file_name == message.file_name
                    }
                }
        })
    }

    /// Registers an outgoing file offer. Does not contact the peer yet.
    pub async fn create_send(
        &mut self,
        partner: &str,
        path: &Path,
        passive: bool,
    ) -> Result<TransferId> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            DccError::FileOperation(format!("could not read {}: {}", path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(DccError::FileOperation(format!(
                "{} is not a file",
                path.display()
            )));
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                DccError::FileOperation(format!("{} has no usable file name", path.display()))
            })?
            .to_string();

        if let Some(existing) = self.find_live(partner, &file_name, TransferDirection::Send) {
            return Err(DccError::Transfer(format!(
                "\"{}\" is already being offered to {} as {}",
                file_name, partner, existing
            )));
        }

        let id = self.allocate_id();
        let mut transfer = Transfer::new(
            id,
            TransferDirection::Send,
            partner,
            file_name,
            metadata.len(),
            self.events.clone(),
        );
        transfer.local_path = Some(path.to_path_buf());
        transfer.passive = passive;
        info!(
            "Created send {} of {} ({} bytes) to {}",
            id,
            path.display(),
            metadata.len(),
            partner
        );
        self.transfers.insert(id, transfer);
        Ok(id)
    }

    /// Registers an incoming offer, or returns the live one it duplicates.
    pub fn create_receive(&mut self, partner: &str, offer: &SendOffer) -> TransferId {
        if let Some(existing) = self.find_live(partner, &offer.file_name, TransferDirection::Receive)
        {
            if let Some(transfer) = self.transfers.get_mut(&existing) {
                if transfer.status() == TransferStatus::Queued {
                    debug!("Refreshing queued offer {} from {}", existing, partner);
                    apply_offer(transfer, offer);
                } else {
                    warn!(
                        "Ignoring repeated offer of \"{}\" from {} while {} is {}",
                        offer.file_name,
                        partner,
                        existing,
                        transfer.status()
                    );
                }
            }
            return existing;
        }

        let id = self.allocate_id();
        let mut transfer = Transfer::new(
            id,
            TransferDirection::Receive,
            partner,
            offer.file_name.clone(),
            offer.size,
            self.events.clone(),
        );
        apply_offer(&mut transfer, offer);
        info!(
            "{} offers \"{}\" ({} bytes) as {}",
            partner, offer.file_name, offer.size, id
        );
        self.transfers.insert(id, transfer);
        let _ = self.events.send(TransferEvent::OfferReceived { id });
        id
    }

    /// Creates and starts an outgoing offer.
    pub async fn offer_file(
        &mut self,
        partner: &str,
        path: &Path,
        passive: bool,
    ) -> Result<TransferId> {
        let id = self.create_send(partner, path, passive).await?;
        self.start(id).await?;
        Ok(id)
    }

    /// Offers a chat session. Only the negotiation is tracked.
    pub fn offer_chat(&mut self, partner: &str, passive: bool) -> Result<TransferId> {
        let (text, listener) = if passive {
            let token = self.allocate_token();
            (protocol::encode_chat_offer_passive(self.advertised, &token), None)
        } else {
            let listener = self.ports.listen()?;
            let port = listener.local_addr()?.port();
            (
                protocol::encode_chat_offer(self.advertised, port),
                Some(listener),
            )
        };

        let id = self.allocate_id();
        self.chats.push(ChatRecord {
            id,
            partner: partner.to_string(),
            direction: TransferDirection::Send,
            offered_at: Instant::now(),
            _listener: listener,
        });
        self.send_control(partner, text);
        Ok(id)
    }

    /// Starts a queued transfer: offers a send, or accepts a receive.
    pub async fn start(&mut self, id: TransferId) -> Result<()> {
        let transfer = self
            .transfers
            .get(&id)
            .ok_or(DccError::UnknownTransfer(id))?;
        if transfer.status() != TransferStatus::Queued {
            return Err(DccError::Transfer(format!(
                "{} is {}, not queued",
                id,
                transfer.status()
            )));
        }

        match transfer.direction() {
            TransferDirection::Send => self.start_send(id),
            TransferDirection::Receive => self.start_receive(id).await,
        }
        Ok(())
    }

    fn start_send(&mut self, id: TransferId) {
        let advertised = self.advertised;
        let passive = self.transfers.get(&id).map(|t| t.passive).unwrap_or(false);

        if passive {
            let token = self.allocate_token();
            let Some(transfer) = self.transfers.get_mut(&id) else {
                return;
            };
            transfer.token = Some(token.clone());
            transfer.own_address = Some(advertised);
            let text = protocol::encode_send_offer_passive(
                &transfer.file_name,
                advertised,
                transfer.file_size,
                &token,
            );
            let partner = transfer.partner_nick.clone();
            transfer.set_status(TransferStatus::WaitingRemote, None);
            self.send_control(&partner, text);
            return;
        }

        let listener = match self.ports.listen() {
            Ok(listener) => listener,
            Err(e) => {
                self.fail(id, format!("could not listen: {}", e));
                return;
            }
        };
        let port = match listener.local_addr() {
            Ok(address) => address.port(),
            Err(e) => {
                self.fail(id, format!("could not listen: {}", e));
                return;
            }
        };

        let Some(transfer) = self.transfers.get_mut(&id) else {
            return;
        };
        transfer.own_address = Some(advertised);
        transfer.own_port = port;
        let text = protocol::encode_send_offer(
            &transfer.file_name,
            advertised,
            port,
            transfer.file_size,
        );
        let partner = transfer.partner_nick.clone();
        transfer.set_status(TransferStatus::WaitingRemote, None);
        self.send_control(&partner, text);

        let Some(job) = self.send_job(id) else {
            return;
        };
        let task = send::spawn(job, SendEndpoint::Listen(listener));
        self.tasks.insert(id, task);
    }

    fn send_job(&self, id: TransferId) -> Option<SendJob> {
        let transfer = self.transfers.get(&id)?;
        Some(SendJob {
            id,
            path: transfer.local_path.clone()?,
            file_size: transfer.file_size,
            chunk_size: self.settings.transfer.chunk_size,
            connect_timeout: self.settings.timeout(),
            io: self.io.clone(),
        })
    }

    async fn start_receive(&mut self, id: TransferId) {
        let folder = self.settings.download_dir();
        let create_folder = self.settings.transfer.create_folder;
        let auto_resume = self.settings.transfer.auto_resume;

        let Some(transfer) = self.transfers.get_mut(&id) else {
            return;
        };
        transfer.set_status(TransferStatus::Preparing, None);
        let candidate = receive::calculate_destination(&folder, &transfer.file_name);

        let prepared = match receive::validate_destination(&candidate, create_folder).await {
            Ok(destination) => receive::check_part_file(&destination.part_path)
                .await
                .map(|_| destination),
            Err(e) => Err(e),
        };
        let Some(transfer) = self.transfers.get_mut(&id) else {
            return;
        };
        let destination = match prepared {
            Ok(destination) => destination,
            Err(e) => {
                transfer.fail(format!("could not open destination: {}", e));
                return;
            }
        };
        transfer.local_path = Some(destination.final_path.clone());

        let existing = destination.existing_part;
        let resumable = auto_resume
            && existing > 0
            && transfer.file_size > 0
            && existing < transfer.file_size;

        if !resumable {
            if existing > 0 {
                info!(
                    "Discarding {} bytes in {}",
                    existing,
                    destination.part_path.display()
                );
            }
            transfer.set_start_position(0);
            self.open_receive(id);
            return;
        }

        info!(
            "Resuming \"{}\" from {} at {}",
            transfer.file_name, transfer.partner_nick, existing
        );
        transfer.set_start_position(existing);
        let text = match &transfer.token {
            Some(token) => {
                protocol::encode_resume_request_passive(&transfer.file_name, existing, token)
            }
            None => protocol::encode_resume_request(
                &transfer.file_name,
                transfer.partner_port,
                existing,
            ),
        };
        let partner = transfer.partner_nick.clone();
        transfer.set_status(TransferStatus::WaitingRemote, None);
        self.send_control(&partner, text);
    }

    /// Opens the data connection of an accepted receive.
    fn open_receive(&mut self, id: TransferId) {
        let Some(transfer) = self.transfers.get(&id) else {
            return;
        };

        if transfer.passive {
            let listener = match self.ports.listen().and_then(|l| {
                let port = l.local_addr()?.port();
                Ok((l, port))
            }) {
                Ok(bound) => bound,
                Err(e) => {
                    self.fail(id, format!("could not listen: {}", e));
                    return;
                }
            };
            let (listener, port) = listener;
            let advertised = self.advertised;

            let Some(transfer) = self.transfers.get_mut(&id) else {
                return;
            };
            let Some(token) = transfer.token.clone() else {
                transfer.fail("passive offer without token");
                return;
            };
            transfer.own_address = Some(advertised);
            transfer.own_port = port;
            let text = protocol::encode_passive_send_ack(
                &transfer.file_name,
                advertised,
                port,
                transfer.file_size,
                &token,
            );
            let partner = transfer.partner_nick.clone();
            transfer.set_status(TransferStatus::WaitingRemote, None);
            self.send_control(&partner, text);

            if let Some(job) = self.receive_job(id) {
                let task = receive::spawn(job, ReceiveEndpoint::Listen(listener));
                self.tasks.insert(id, task);
            }
            return;
        }

        let Some(address) = transfer.partner_address else {
            self.fail(id, "offer carried no address".to_string());
            return;
        };
        let remote = SocketAddr::from((address, transfer.partner_port));
        if let Some(transfer) = self.transfers.get_mut(&id) {
            transfer.set_status(TransferStatus::Connecting, None);
        }
        if let Some(job) = self.receive_job(id) {
            let task = receive::spawn(job, ReceiveEndpoint::Connect(remote));
            self.tasks.insert(id, task);
        }
    }

    fn receive_job(&self, id: TransferId) -> Option<ReceiveJob> {
        let transfer = self.transfers.get(&id)?;
        let final_path: PathBuf = transfer.local_path.clone()?;
        Some(ReceiveJob {
            id,
            part_path: receive::part_path(&final_path),
            final_path,
            start_position: transfer.start_position,
            file_size: transfer.file_size,
            chunk_size: self.settings.transfer.chunk_size,
            cache_ceiling: self.settings.transfer.write_cache_ceiling,
            connect_timeout: self.settings.timeout(),
            io: self.io.clone(),
        })
    }

    /// Cancels a transfer. No-op once it is terminal.
    pub fn abort(&mut self, id: TransferId) -> Result<()> {
        if let Some(index) = self.chats.iter().position(|c| c.id == id) {
            let chat = self.chats.remove(index);
            if chat.direction == TransferDirection::Receive {
                self.send_control(&chat.partner, protocol::encode_reject_chat());
            }
            return Ok(());
        }

        let transfer = self
            .transfers
            .get_mut(&id)
            .ok_or(DccError::UnknownTransfer(id))?;
        if !transfer.is_live() {
            debug!("Abort of {} ignored, already {}", id, transfer.status());
            return Ok(());
        }

        let declined = transfer.direction() == TransferDirection::Receive
            && transfer.status() == TransferStatus::Queued;
        let partner = transfer.partner_nick.clone();
        let text = protocol::encode_reject_send(&transfer.file_name);

        transfer.set_status(TransferStatus::Aborted, None);
        self.stop_task(id);
        if declined {
            self.send_control(&partner, text);
        }
        Ok(())
    }

    /// The peer declined `file_name`. Fails the matching live transfer.
    pub fn reject(&mut self, partner: &str, file_name: &str) -> Option<TransferId> {
        let id = self
            .find_live(partner, file_name, TransferDirection::Send)
            .or_else(|| self.find_live(partner, file_name, TransferDirection::Receive))?;
        self.fail(id, format!("{} declined the transfer", partner));
        Some(id)
    }

    /// The peer declined a chat offer; forgets the oldest one with them.
    pub fn reject_chat(&mut self, partner: &str) -> Option<TransferId> {
        let index = self
            .chats
            .iter()
            .position(|c| c.partner.eq_ignore_ascii_case(partner))?;
        let chat = self.chats.remove(index);
        let text = match chat.direction {
            TransferDirection::Send => format!("{} declined the chat offer.", chat.partner),
            TransferDirection::Receive => {
                format!("Chat offer from {} was withdrawn.", chat.partner)
            }
        };
        self.notice(Some(chat.id), text);
        Some(chat.id)
    }

    fn fail(&mut self, id: TransferId, detail: String) {
        if let Some(transfer) = self.transfers.get_mut(&id) {
            transfer.fail(detail);
        }
        self.stop_task(id);
    }

    fn stop_task(&mut self, id: TransferId) {
        if let Some(task) = self.tasks.remove(&id) {
            task.abort();
        }
    }

    /// Entry point for a DCC request from `partner`, already split into words.
    pub async fn handle_control<S: AsRef<str>>(&mut self, partner: &str, args: &[S]) {
        let message = match protocol::decode(args) {
            Ok(message) => message,
            Err(e) => {
                let verb = args
                    .first()
                    .map(|v| v.as_ref().to_ascii_uppercase())
                    .unwrap_or_default();
                warn!("Bad DCC {} from {}: {}", verb, partner, e);
                self.notice(
                    None,
                    format!("Received invalid DCC {} request from {}.", verb, partner),
                );
                return;
            }
        };
        debug!("DCC {} from {}", message.verb(), partner);

        match message {
            DccMessage::SendOffer(offer) if offer.is_passive_ack() => {
                self.handle_passive_ack(partner, &offer)
            }
            DccMessage::SendOffer(offer) => {
                let id = self.create_receive(partner, &offer);
                let queued = self
                    .transfers
                    .get(&id)
                    .map(|t| t.status() == TransferStatus::Queued)
                    .unwrap_or(false);
                if self.settings.transfer.auto_accept && queued {
                    if let Err(e) = self.start(id).await {
                        warn!("Could not auto-accept {}: {}", id, e);
                    }
                }
            }
            DccMessage::ChatOffer(offer) => self.handle_chat_offer(partner, &offer),
            DccMessage::ResumeRequest(resume) => self.handle_resume(partner, &resume),
            DccMessage::AcceptResume(accept) => self.handle_accept(partner, &accept),
            DccMessage::Reject(Reject::Send { file_name }) => {
                if self.reject(partner, &file_name).is_none() {
                    self.notice(
                        None,
                        format!(
                            "Received invalid DCC REJECT request from {}: no transfer of \"{}\".",
                            partner, file_name
                        ),
                    );
                }
            }
            DccMessage::Reject(Reject::Chat) => {
                if self.reject_chat(partner).is_none() {
                    debug!("REJECT CHAT from {} matched no chat offer", partner);
                }
            }
        }
    }

    fn handle_chat_offer(&mut self, partner: &str, offer: &ChatOffer) {
        let id = self.allocate_id();
        self.chats.push(ChatRecord {
            id,
            partner: partner.to_string(),
            direction: TransferDirection::Receive,
            offered_at: Instant::now(),
            _listener: None,
        });
        info!(
            "{} offers a chat ({}) at {}:{}",
            partner, offer.extension, offer.address, offer.port
        );
        let _ = self.events.send(TransferEvent::ChatOffered {
            id,
            partner: partner.to_string(),
            address: offer.address,
            port: offer.port,
        });
    }

    fn handle_resume(&mut self, partner: &str, request: &ResumeMessage) {
        let Some(id) = self.resolve(partner, request, TransferDirection::Send) else {
            if self.refers_to_finished(partner, request, TransferDirection::Send) {
                debug!(
                    "RESUME of \"{}\" from {} arrived after the transfer ended",
                    request.file_name, partner
                );
                return;
            }
            self.notice(
                None,
                format!(
                    "Received invalid DCC RESUME request from {}: no offer of \"{}\".",
                    partner, request.file_name
                ),
            );
            return;
        };
        let Some(transfer) = self.transfers.get_mut(&id) else {
            return;
        };
        if transfer.status() != TransferStatus::WaitingRemote
            || request.position >= transfer.file_size
        {
            let text = format!(
                "Received invalid DCC RESUME request from {}: cannot resume \"{}\" at {}.",
                partner, transfer.file_name, request.position
            );
            self.notice(Some(id), text);
            return;
        }

        info!(
            "{} resumes {} ({}) at {}",
            partner, id, transfer.file_name, request.position
        );
        transfer.set_start_position(request.position);
        let text = match &request.token {
            Some(token) => {
                protocol::encode_accept_passive(&transfer.file_name, request.position, token)
            }
            None => protocol::encode_accept(&transfer.file_name, request.port, request.position),
        };
        self.send_control(partner, text);
    }

    fn handle_accept(&mut self, partner: &str, accept: &ResumeMessage) {
        let Some(id) = self.resolve(partner, accept, TransferDirection::Receive) else {
            if self.refers_to_finished(partner, accept, TransferDirection::Receive) {
                debug!(
                    "ACCEPT of \"{}\" from {} arrived after the transfer ended",
                    accept.file_name, partner
                );
                return;
            }
            self.notice(
                None,
                format!(
                    "Received invalid DCC ACCEPT request from {}: no resume of \"{}\".",
                    partner, accept.file_name
                ),
            );
            return;
        };
        let Some(transfer) = self.transfers.get_mut(&id) else {
            return;
        };
        if transfer.status() != TransferStatus::WaitingRemote || transfer.start_position == 0 {
            debug!("ACCEPT for {} in state {} ignored", id, transfer.status());
            return;
        }
        if accept.position > transfer.start_position {
            transfer.fail(format!(
                "peer accepted resume at {} beyond local {}",
                accept.position, transfer.start_position
            ));
            return;
        }
        if accept.position < transfer.start_position {
            info!(
                "{} resumes {} at {} instead of {}",
                partner, id, accept.position, transfer.start_position
            );
            transfer.set_start_position(accept.position);
        }
        self.open_receive(id);
    }

    /// The receiver of a passive offer is listening; connect to it.
    fn handle_passive_ack(&mut self, partner: &str, ack: &SendOffer) {
        let id = ack
            .token
            .as_deref()
            .and_then(|token| self.find_by_token(partner, token, TransferDirection::Send))
            .filter(|id| self.transfers.get(id).map(|t| t.passive).unwrap_or(false));
        let Some(id) = id else {
            self.notice(
                None,
                format!(
                    "Received invalid DCC SEND request from {}: unknown token for \"{}\".",
                    partner, ack.file_name
                ),
            );
            return;
        };
        let Some(transfer) = self.transfers.get_mut(&id) else {
            return;
        };
        if transfer.status() != TransferStatus::WaitingRemote {
            debug!("Passive reply for {} in state {} ignored", id, transfer.status());
            return;
        }

        transfer.partner_address = Some(ack.address);
        transfer.partner_port = ack.port;
        transfer.set_status(TransferStatus::Connecting, None);
        let remote = SocketAddr::from((ack.address, ack.port));

        if let Some(job) = self.send_job(id) {
            let task = send::spawn(job, SendEndpoint::Connect(remote));
            self.tasks.insert(id, task);
        }
    }

    pub fn handle_io_event(&mut self, event: IoEvent) {
        let id = event.id();
        let Some(transfer) = self.transfers.get_mut(&id) else {
            debug!("I/O event for unknown transfer {}", id);
            return;
        };
        if !transfer.is_live() {
            debug!("Dropping I/O event for finished transfer {}", id);
            return;
        }

        match event {
            IoEvent::Connected {
                local,
                remote,
                begin,
                ..
            } => {
                if let SocketAddr::V4(local) = local {
                    transfer.own_port = local.port();
                }
                if let SocketAddr::V4(remote) = remote {
                    transfer.partner_address = Some(*remote.ip());
                    transfer.partner_port = remote.port();
                }
                let status = match transfer.direction() {
                    TransferDirection::Send => TransferStatus::Sending,
                    TransferDirection::Receive => TransferStatus::Receiving,
                };
                transfer.set_status(status, None);
                if let Some(begin) = begin {
                    let _ = begin.send(transfer.start_position);
                }
            }
            IoEvent::Progress { position, .. } => transfer.record_progress(position),
            IoEvent::Completed { position, .. } => {
                transfer.record_progress(position);
                transfer.set_status(TransferStatus::Done, None);
                self.tasks.remove(&id);
            }
            IoEvent::Failed { detail, .. } => {
                transfer.fail(detail);
                self.tasks.remove(&id);
            }
        }
    }

    /// Fails transfers that waited on the peer longer than the configured
    /// timeout, and forgets chat offers of the same age.
    pub fn check_timeouts(&mut self, now: Instant) {
        let timeout = self.settings.timeout();
        let expired: Vec<TransferId> = self
            .transfers
            .values()
            .filter(|t| t.status() == TransferStatus::WaitingRemote)
            .filter(|t| {
                t.waiting_since()
                    .map(|since| now.saturating_duration_since(since) >= timeout)
                    .unwrap_or(false)
            })
            .map(Transfer::id)
            .collect();

        for id in expired {
            warn!("Transfer {} timed out waiting for peer", id);
            self.fail(id, "timed out waiting for peer".to_string());
        }

        let (stale, kept): (Vec<ChatRecord>, Vec<ChatRecord>) = std::mem::take(&mut self.chats)
            .into_iter()
            .partition(|c| now.saturating_duration_since(c.offered_at) >= timeout);
        self.chats = kept;
        for chat in stale {
            match chat.direction {
                TransferDirection::Send => self.notice(
                    Some(chat.id),
                    format!("Chat offer to {} timed out.", chat.partner),
                ),
                TransferDirection::Receive => {
                    debug!("Forgetting chat offer {} from {}", chat.id, chat.partner)
                }
            }
        }
    }

    /// Aborts everything still running.
    pub fn shutdown(&mut self) {
        let live: Vec<TransferId> = self
            .transfers
            .values()
            .filter(|t| t.is_live() && t.status() != TransferStatus::Queued)
            .map(Transfer::id)
            .collect();
        for id in live {
            if let Some(transfer) = self.transfers.get_mut(&id) {
                transfer.set_status(TransferStatus::Aborted, Some("engine stopped".to_string()));
            }
        }
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

fn offered_port(transfer: &Transfer) -> u16 {
    match transfer.direction() {
        TransferDirection::Send => transfer.own_port,
        TransferDirection::Receive => transfer.partner_port,
    }
}

fn apply_offer(transfer: &mut Transfer, offer: &SendOffer) {
    transfer.partner_address = Some(offer.address);
    transfer.partner_port = offer.port;
    transfer.file_size = offer.size;
    transfer.passive = offer.is_passive();
    transfer.token = offer.token.clone();
}
