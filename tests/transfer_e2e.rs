use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;

use dcc_transfer::config::Settings;
use dcc_transfer::network::protocol;
use dcc_transfer::{
    DccEngine, EngineHandle, OutgoingControl, TransferEvent, TransferId, TransferSnapshot,
    TransferStatus,
};

const WAIT: Duration = Duration::from_secs(15);

type Transcript = Arc<Mutex<Vec<String>>>;

struct Peer {
    handle: EngineHandle,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    downloads: PathBuf,
}

struct Session {
    alice: Peer,
    bob: Peer,
    /// Control strings in the order they crossed the chat channel.
    transcript: Transcript,
    dir: TempDir,
}

fn settings(downloads: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.network.bind_address = Ipv4Addr::LOCALHOST;
    settings.network.public_address = Some(Ipv4Addr::LOCALHOST);
    settings.network.timeout_seconds = 10;
    settings.transfer.download_dir = Some(downloads.to_path_buf());
    settings.transfer.chunk_size = 256;
    settings.transfer.write_cache_ceiling = 1024;
    settings
}

/// Delivers everything `from` says to `to`, tokenized as a chat layer would.
fn bridge(
    mut from: mpsc::UnboundedReceiver<OutgoingControl>,
    to: EngineHandle,
    nick: &'static str,
    transcript: Transcript,
) {
    tokio::spawn(async move {
        while let Some(message) = from.recv().await {
            transcript.lock().unwrap().push(message.text.clone());
            let words = protocol::tokenize(&message.text);
            if to.handle_control(nick, &words).await.is_err() {
                break;
            }
        }
    });
}

fn session() -> Session {
    let dir = tempdir().unwrap();
    let alice_downloads = dir.path().join("alice");
    let bob_downloads = dir.path().join("bob");

    let (alice_engine, alice_handle, alice_control, alice_events) =
        DccEngine::new(settings(&alice_downloads));
    let (bob_engine, bob_handle, bob_control, bob_events) =
        DccEngine::new(settings(&bob_downloads));
    tokio::spawn(alice_engine.run());
    tokio::spawn(bob_engine.run());

    let transcript = Transcript::default();
    bridge(alice_control, bob_handle.clone(), "alice", transcript.clone());
    bridge(bob_control, alice_handle.clone(), "bob", transcript.clone());

    Session {
        alice: Peer {
            handle: alice_handle,
            events: alice_events,
            downloads: alice_downloads,
        },
        bob: Peer {
            handle: bob_handle,
            events: bob_events,
            downloads: bob_downloads,
        },
        transcript,
        dir,
    }
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn wait_for<T>(
    events: &mut mpsc::UnboundedReceiver<TransferEvent>,
    mut pick: impl FnMut(&TransferEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("engine stopped");
            if let TransferEvent::StatusChanged {
                new: TransferStatus::Failed,
                ..
            } = event
            {
                panic!("transfer failed: {:?}", event);
            }
            if let Some(value) = pick(&event) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_offer(peer: &mut Peer) -> TransferId {
    wait_for(&mut peer.events, |e| match e {
        TransferEvent::OfferReceived { id } => Some(*id),
        _ => None,
    })
    .await
}

async fn wait_done(peer: &mut Peer, id: TransferId) {
    wait_for(&mut peer.events, |e| match e {
        TransferEvent::Done { id: done } if *done == id => Some(()),
        _ => None,
    })
    .await
}

async fn snapshot(peer: &Peer, id: TransferId) -> TransferSnapshot {
    peer.handle
        .snapshot()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.id == id)
        .unwrap()
}

#[tokio::test]
async fn test_happy_path_with_spaced_name() {
    let mut s = session();
    let source = s.dir.path().join("a b.txt");
    let data = content(1024);
    tokio::fs::write(&source, &data).await.unwrap();

    let sent = s
        .alice
        .handle
        .offer_file("bob", &source, Some(false))
        .await
        .unwrap();
    let received = wait_offer(&mut s.bob).await;

    let offer = snapshot(&s.bob, received).await;
    assert_eq!(offer.file_name, "a b.txt");
    assert_eq!(offer.file_size, 1024);
    assert_eq!(offer.partner_address, Some(Ipv4Addr::LOCALHOST));
    assert_eq!(offer.status, TransferStatus::Queued);

    s.bob.handle.accept(received).await.unwrap();
    wait_done(&mut s.bob, received).await;
    wait_done(&mut s.alice, sent).await;

    let saved = s.bob.downloads.join("a b.txt");
    assert_eq!(tokio::fs::read(&saved).await.unwrap(), data);
    assert!(!s.bob.downloads.join("a b.txt.part").exists());

    let done = snapshot(&s.bob, received).await;
    assert_eq!(done.position, 1024);
    assert!(!done.resumed);
    assert_eq!(snapshot(&s.alice, sent).await.status, TransferStatus::Done);

    let transcript = s.transcript.lock().unwrap().clone();
    assert!(transcript[0].starts_with("SEND \"a b.txt\" 2130706433 "));
    assert!(transcript[0].ends_with(" 1024"));
}

#[tokio::test]
async fn test_resume_from_existing_part() {
    let mut s = session();
    let source = s.dir.path().join("movie.mkv");
    let data = content(8192);
    tokio::fs::write(&source, &data).await.unwrap();

    tokio::fs::create_dir_all(&s.bob.downloads).await.unwrap();
    tokio::fs::write(s.bob.downloads.join("movie.mkv.part"), &data[..4096])
        .await
        .unwrap();

    let sent = s
        .alice
        .handle
        .offer_file("bob", &source, Some(false))
        .await
        .unwrap();
    let received = wait_offer(&mut s.bob).await;
    s.bob.handle.accept(received).await.unwrap();
    wait_done(&mut s.bob, received).await;
    wait_done(&mut s.alice, sent).await;

    let port = snapshot(&s.alice, sent).await.own_port;
    let transcript = s.transcript.lock().unwrap().clone();
    assert_eq!(
        transcript[1..3],
        [
            format!("RESUME movie.mkv {} 4096", port),
            format!("ACCEPT movie.mkv {} 4096", port),
        ]
    );

    let done = snapshot(&s.bob, received).await;
    assert_eq!(done.start_position, 4096);
    assert!(done.resumed);
    assert_eq!(done.position, 8192);
    assert_eq!(snapshot(&s.alice, sent).await.start_position, 4096);
    assert_eq!(
        tokio::fs::read(s.bob.downloads.join("movie.mkv")).await.unwrap(),
        data
    );
}

#[tokio::test]
async fn test_passive_offer_connects_back() {
    let mut s = session();
    let source = s.dir.path().join("file.bin");
    let data = content(2048);
    tokio::fs::write(&source, &data).await.unwrap();

    let sent = s
        .alice
        .handle
        .offer_file("bob", &source, Some(true))
        .await
        .unwrap();
    let received = wait_offer(&mut s.bob).await;

    let offer = snapshot(&s.bob, received).await;
    assert!(offer.passive);
    let token = offer.token.clone().unwrap();

    s.bob.handle.accept(received).await.unwrap();
    wait_done(&mut s.bob, received).await;
    wait_done(&mut s.alice, sent).await;

    let transcript = s.transcript.lock().unwrap().clone();
    assert_eq!(
        transcript[0],
        format!("SEND file.bin 2130706433 0 2048 {}", token)
    );
    let ack = protocol::tokenize(&transcript[1]);
    assert_eq!(ack[0], "SEND");
    assert_ne!(ack[3], "0");
    assert_eq!(ack[5], token);

    let sender = snapshot(&s.alice, sent).await;
    assert_eq!(sender.status, TransferStatus::Done);
    assert_eq!(sender.partner_port.to_string(), ack[3]);
    assert_eq!(
        tokio::fs::read(s.bob.downloads.join("file.bin")).await.unwrap(),
        data
    );
}

#[tokio::test]
async fn test_declined_offer_fails_sender() {
    let mut s = session();
    let source = s.dir.path().join("unwanted.zip");
    tokio::fs::write(&source, b"nope").await.unwrap();

    let sent = s
        .alice
        .handle
        .offer_file("bob", &source, None)
        .await
        .unwrap();
    let received = wait_offer(&mut s.bob).await;
    s.bob.handle.abort(received).await.unwrap();

    let failed = tokio::time::timeout(WAIT, async {
        loop {
            match s.alice.events.recv().await.expect("engine stopped") {
                TransferEvent::StatusChanged {
                    id,
                    new: TransferStatus::Failed,
                    ..
                } if id == sent => break,
                _ => continue,
            }
        }
    })
    .await;
    assert!(failed.is_ok());
    let sender = snapshot(&s.alice, sent).await;
    assert_eq!(sender.status_detail.as_deref(), Some("bob declined the transfer"));
}
