//! Coordinator - the single ordered event flow of the bridge.
//!
//! The coordinator is implemented as an actor that owns the state store.
//! Other components communicate with it via message passing.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   Event   ┌─────────────────────┐
//! │ SerialTransport│──────────▶│     Coordinator     │──▶ outbound bus queue
//! │ TcpServer      │──────────▶│  (owns StateStore)  │──▶ Broadcaster
//! │ CoordinatorHdl │──────────▶│                     │──▶ watch<Arc<Snapshot>>
//! └────────────────┘           └─────────────────────┘
//! ```
//!
//! # Components
//!
//! - `Coordinator`: The actor that owns the store
//! - `CoordinatorHandle`: Cheap-to-clone API for reads and commands
//! - `Event`: Everything the actor reacts to
//! - `CommandError`: Errors returned to command issuers

mod actor;
mod commands;
mod handle;

pub use actor::{apply_to_zones, Coordinator};
pub use commands::{AllZonesCommand, AllZonesReport, Command, CommandError, Event};
pub use handle::{CoordinatorHandle, DEFAULT_MUTE_FADE_MS};

use std::sync::Arc;

use rnet_protocol::Packet;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::serial::LinkState;
use crate::server::Broadcaster;
use crate::store::StateStore;

/// Capacity of the coordinator inbox.
pub const EVENT_BUFFER: usize = 256;

/// Spawns the coordinator actor and returns its handle.
///
/// # Arguments
///
/// * `store` - Initial state, owned by the actor from now on
/// * `link` - Bus link state, gates commands
/// * `outbound` - Queue drained by the serial transport
/// * `broadcaster` - Subscribed TCP sessions
/// * `cancel` - Stops the actor
pub fn spawn_coordinator(
    store: StateStore,
    link: watch::Receiver<LinkState>,
    outbound: mpsc::Sender<Packet>,
    broadcaster: Broadcaster,
    cancel: CancellationToken,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(store.snapshot().clone()));

    let handle = CoordinatorHandle::new(sender, snapshot_rx, link.clone());
    let actor = Coordinator::new(
        receiver,
        store,
        snapshot_tx,
        link,
        outbound,
        broadcaster,
        cancel,
    );
    let task = tokio::spawn(actor.run());
    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use rnet_core::{Controller, DomainError, Source, SourceType, ZoneId, ZoneParameter};
    use rnet_protocol::{Address, Message, RNetCodec};
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_util::codec::Decoder;

    struct Harness {
        handle: CoordinatorHandle,
        link: watch::Sender<LinkState>,
        outbound: mpsc::Receiver<Packet>,
        broadcaster: Broadcaster,
        cancel: CancellationToken,
    }

    fn harness() -> Harness {
        harness_with_bus_queue(64)
    }

    fn harness_with_bus_queue(capacity: usize) -> Harness {
        let store = StateStore::new(
            vec![
                Controller::new(0, ["Kitchen", "Den", "Office"]),
                Controller::new(1, ["Patio", "Garage", "Pool"]),
            ],
            vec![Source::new(1, "Sonos", SourceType::Airplay)],
        );
        let (link, link_rx) = watch::channel(LinkState::Up);
        let (outbound_tx, outbound) = mpsc::channel(capacity);
        let broadcaster = Broadcaster::new();
        let cancel = CancellationToken::new();
        let (handle, _task) = spawn_coordinator(
            store,
            link_rx,
            outbound_tx,
            broadcaster.clone(),
            cancel.clone(),
        );
        Harness {
            handle,
            link,
            outbound,
            broadcaster,
            cancel,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Packet>) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    fn decode_all(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Packet> {
        let mut codec = RNetCodec::new();
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            let mut buf = BytesMut::from(&chunk[..]);
            while let Some(item) = codec.decode(&mut buf).unwrap() {
                out.push(item.unwrap());
            }
        }
        out
    }

    const KITCHEN: ZoneId = ZoneId::new(0, 0);

    #[tokio::test]
    async fn test_reads_reflect_configuration() {
        let h = harness();
        assert!(h.handle.is_connected());
        assert_eq!(h.handle.controllers_len(), 2);
        assert_eq!(h.handle.zones_len(1), 3);
        assert_eq!(h.handle.sources_len(), 1);
        assert_eq!(h.handle.source(1).map(|s| s.name), Some("Sonos".to_string()));
        assert_eq!(h.handle.find_zone_by_name("Pool").map(|z| z.id), Some(ZoneId::new(1, 2)));
        assert!(h.handle.find_source_by_name("Tuner").is_none());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_volume_command_is_normalized_forwarded_and_broadcast() {
        let mut h = harness();
        let (tx, mut client) = mpsc::channel(16);
        h.broadcaster.subscribe(1, tx);

        h.handle.set_volume(KITCHEN, 55).await.unwrap();

        assert_eq!(h.handle.zone(KITCHEN).unwrap().volume, 54);
        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message, Message::VolumeSet { volume: 54 });
        assert_eq!(sent[0].target, Address::new(0, 0));

        let reports = decode_all(&mut client);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].message, Message::VolumeGet { volume: 54 });
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_commands_fail_while_link_down() {
        let mut h = harness();
        h.link.send_replace(LinkState::Down);

        assert_eq!(
            h.handle.set_power(KITCHEN, true).await,
            Err(CommandError::ServiceUnavailable)
        );
        assert_eq!(
            h.handle.set_all_power(true).await,
            Err(CommandError::ServiceUnavailable)
        );
        assert!(drain(&mut h.outbound).is_empty());
        assert!(!h.handle.zone(KITCHEN).unwrap().power);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_invalid_parameter_emits_nothing() {
        let mut h = harness();
        let before = h.handle.snapshot();

        assert_eq!(
            h.handle.set_parameter(KITCHEN, 3, 1).await,
            Err(CommandError::Domain(DomainError::InvalidParameter { id: 3 }))
        );
        assert!(drain(&mut h.outbound).is_empty());
        assert_eq!(*h.handle.snapshot(), *before);

        h.handle
            .set_parameter(KITCHEN, ZoneParameter::Loudness.id(), 1)
            .await
            .unwrap();
        assert_eq!(
            h.handle
                .zone(KITCHEN)
                .unwrap()
                .parameter(ZoneParameter::Loudness),
            1
        );
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_set_all_power_sends_one_command_per_zone() {
        let mut h = harness();
        let report = h.handle.set_all_power(true).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.succeeded.len(), 6);

        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 6);
        assert!(sent
            .iter()
            .all(|p| p.message == Message::PowerSet { power: true }));
        let targets: HashSet<Address> = sent.iter().map(|p| p.target).collect();
        assert_eq!(targets.len(), 6);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_set_all_mute_carries_fade() {
        let mut h = harness();
        h.handle
            .set_all_mute(true, DEFAULT_MUTE_FADE_MS)
            .await
            .unwrap();
        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 6);
        assert!(sent.iter().all(|p| p.message
            == Message::MuteSet {
                muted: true,
                fade_ms: 1000
            }));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_bus_report_updates_snapshot_and_broadcasts() {
        let h = harness();
        let (tx, mut client) = mpsc::channel(16);
        h.broadcaster.subscribe(9, tx);
        let mut changes = h.handle.watch_snapshot();
        changes.borrow_and_update();

        h.handle
            .event_sender()
            .send(Event::Bus(Packet::from_bridge(
                ZoneId::new(1, 1),
                Message::PowerGet { power: true },
            )))
            .await
            .unwrap();

        timeout(Duration::from_secs(2), changes.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(h.handle.zone(ZoneId::new(1, 1)).unwrap().power);

        let frame = timeout(Duration::from_secs(2), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            Packet::decode(&frame).unwrap().message,
            Message::PowerGet { power: true }
        );
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_link_up_requests_every_zone() {
        let mut h = harness();
        h.handle
            .event_sender()
            .send(Event::Link(LinkState::Up))
            .await
            .unwrap();
        // Round trip through the actor so the link event has been handled
        h.handle.set_power(KITCHEN, false).await.unwrap();

        let requests: Vec<Packet> = drain(&mut h.outbound)
            .into_iter()
            .filter(|p| p.message == Message::RequestData)
            .collect();
        assert_eq!(requests.len(), 6);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_link_up_defers_requests_when_bus_queue_is_full() {
        let mut h = harness_with_bus_queue(2);
        h.handle
            .event_sender()
            .send(Event::Link(LinkState::Up))
            .await
            .unwrap();

        // Only two fit at once; the rest follow as the transport drains
        let mut targets = HashSet::new();
        while targets.len() < 6 {
            let packet = timeout(Duration::from_secs(2), h.outbound.recv())
                .await
                .expect("zone request never sent")
                .unwrap();
            assert_eq!(packet.message, Message::RequestData);
            assert!(targets.insert(packet.target));
        }
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_closed_bus_queue_leaves_state_untouched() {
        let h = harness();
        let Harness {
            handle,
            outbound,
            cancel,
            ..
        } = h;
        drop(outbound);

        assert_eq!(
            handle.set_power(KITCHEN, true).await,
            Err(CommandError::ServiceUnavailable)
        );
        assert!(!handle.zone(KITCHEN).unwrap().power);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_full_bus_queue_is_busy_and_leaves_state_untouched() {
        let mut h = harness_with_bus_queue(2);
        h.handle.set_volume(KITCHEN, 20).await.unwrap();
        assert_eq!(
            h.handle.set_volume(KITCHEN, 40).await,
            Err(CommandError::BusBusy)
        );
        assert_eq!(h.handle.zone(KITCHEN).unwrap().volume, 20);

        assert_eq!(drain(&mut h.outbound).len(), 1);
        h.handle.set_volume(KITCHEN, 40).await.unwrap();
        assert_eq!(h.handle.zone(KITCHEN).unwrap().volume, 40);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_subscribed_session_gets_snapshot_only_for_itself() {
        let h = harness();
        let (new_tx, mut new_client) = mpsc::channel(128);
        let (old_tx, mut old_client) = mpsc::channel(128);
        h.broadcaster.subscribe(1, old_tx);
        h.broadcaster.subscribe(2, new_tx);

        h.handle
            .event_sender()
            .send(Event::ClientSubscribed { session: 2 })
            .await
            .unwrap();
        h.handle.set_power(KITCHEN, true).await.unwrap();

        let snapshot = decode_all(&mut new_client);
        assert!(snapshot.len() > 6);
        assert!(matches!(snapshot[0].message, Message::SourceName { .. }));

        // The other session only saw the power report
        let others = decode_all(&mut old_client);
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].message, Message::PowerGet { power: true });
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_client_set_frame_becomes_command() {
        let mut h = harness();
        h.handle
            .event_sender()
            .send(Event::ClientPacket {
                session: 3,
                packet: Packet::new(
                    Address::new(1, 0),
                    Address::new(0, 0x7F),
                    Message::SourceSet { source_id: Some(1) },
                ),
            })
            .await
            .unwrap();
        h.handle.set_power(KITCHEN, true).await.unwrap();

        let sent = drain(&mut h.outbound);
        assert_eq!(
            sent[0].message,
            Message::SourceSet { source_id: Some(1) }
        );
        assert_eq!(h.handle.zone(ZoneId::new(1, 0)).unwrap().source_id, Some(1));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_commands_fail_after_shutdown() {
        let h = harness();
        h.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            h.handle.set_power(KITCHEN, true).await,
            Err(CommandError::ChannelClosed)
        );
    }
}
