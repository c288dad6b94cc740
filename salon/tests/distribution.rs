//! Subscription contract: snapshot on subscribe, fan-out to every device,
//! unsubscribe, topic authorization and the WebSocket message handling.

#![allow(clippy::unwrap_used, clippy::panic)] // Test code

use chrono::{NaiveTime, TimeDelta};
use salon_queue::aggregates::{JoinRequest, NewBooking};
use salon_queue::api::websocket::{ServerMessage, handle_client_message};
use salon_queue::app::{Collaborators, LaneSettings, QueueService};
use salon_queue::distribution::{Delivery, Hub, OutboundEvent, OverallStatus, Snapshot, Topic, TopicError};
use salon_queue::error::QueueError;
use salon_queue::providers::{FixedTravelBuffers, InMemorySlotAvailability, InMemoryStaffDirectory};
use salon_queue::types::{
    BookingId, Principal, SalonId, ServiceId, StaffId, StaffProfile, TimeWindow, UserId,
};
use salon_queue_core::environment::Clock;
use salon_queue_testing::helpers::at;
use salon_queue_testing::test_clock;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;

fn setup() -> (QueueService, SalonId, StaffId) {
    let salon_id = SalonId::new();
    let staff_id = StaffId::new();
    let directory = InMemoryStaffDirectory::with_staff([StaffProfile {
        staff_id,
        salon_id,
        name: "Ana".to_string(),
    }]);
    let service = QueueService::new(
        Collaborators {
            clock: Arc::new(test_clock()),
            directory: Arc::new(directory),
            slots: Arc::new(InMemorySlotAvailability::new()),
            travel: Arc::new(FixedTravelBuffers::new(TimeDelta::minutes(20))),
        },
        Arc::new(Hub::new()),
        LaneSettings::default(),
    );
    (service, salon_id, staff_id)
}

fn booking(user_id: UserId, offset_minutes: i64) -> NewBooking {
    NewBooking {
        booking_id: BookingId::new(),
        user_id,
        scheduled_start: at(test_clock().now(), offset_minutes),
        duration_minutes: 30,
    }
}

fn drain(rx: &mut Receiver<Delivery>) -> Vec<Delivery> {
    let mut deliveries = Vec::new();
    while let Ok(delivery) = rx.try_recv() {
        deliveries.push(delivery);
    }
    deliveries
}

fn departure_updates(deliveries: &[Delivery]) -> usize {
    deliveries
        .iter()
        .filter(|delivery| {
            matches!(
                delivery,
                Delivery::Event {
                    event: OutboundEvent::DepartureStatusUpdate { .. },
                    ..
                }
            )
        })
        .count()
}

#[tokio::test]
async fn every_device_of_a_user_receives_each_event() {
    let (service, _, staff_id) = setup();
    let user_id = UserId::new();
    let topic = Topic::User(user_id);

    let (phone, mut phone_rx) = service.connect(Principal::Customer { user_id });
    let (laptop, mut laptop_rx) = service.connect(Principal::Customer { user_id });
    service.subscribe(phone, topic).await.unwrap();
    service.subscribe(laptop, topic).await.unwrap();
    assert_eq!(service.hub().subscriber_count(&topic), 2);

    service
        .appointment_inserted(staff_id, booking(user_id, 60), None)
        .await
        .unwrap();

    let phone = drain(&mut phone_rx);
    let laptop = drain(&mut laptop_rx);
    assert!(matches!(phone[0], Delivery::Snapshot { .. }));
    assert!(matches!(laptop[0], Delivery::Snapshot { .. }));
    assert_eq!(departure_updates(&phone), 1);
    assert_eq!(departure_updates(&laptop), 1);
}

#[tokio::test]
async fn resubscribing_delivers_current_state() {
    let (service, _, staff_id) = setup();
    let user_id = UserId::new();
    let topic = Topic::User(user_id);
    let (id, mut rx) = service.connect(Principal::Customer { user_id });

    service.subscribe(id, topic).await.unwrap();
    assert!(service.unsubscribe(id, topic));

    service
        .appointment_inserted(staff_id, booking(user_id, 60), None)
        .await
        .unwrap();

    // Only the first snapshot; nothing after unsubscribing
    let before = drain(&mut rx);
    assert_eq!(before.len(), 1);

    service.subscribe(id, topic).await.unwrap();
    match drain(&mut rx).as_slice() {
        [Delivery::Snapshot {
            snapshot: Snapshot::User { departures, .. },
            ..
        }] => assert_eq!(departures.len(), 1),
        other => panic!("unexpected deliveries: {other:?}"),
    }
}

#[tokio::test]
async fn customers_cannot_read_salon_topics() {
    let (service, salon_id, _) = setup();
    let (id, _rx) = service.connect(Principal::Customer {
        user_id: UserId::new(),
    });

    let result = service.subscribe(id, Topic::Salon(salon_id)).await;
    assert!(matches!(
        result,
        Err(QueueError::Topic(TopicError::Forbidden(_)))
    ));

    let other_user = service.subscribe(id, Topic::User(UserId::new())).await;
    assert!(matches!(
        other_user,
        Err(QueueError::Topic(TopicError::Forbidden(_)))
    ));
}

#[tokio::test]
async fn salon_snapshot_summarizes_queues_and_waitlist() {
    let (service, salon_id, staff_id) = setup();
    service
        .appointment_inserted(staff_id, booking(UserId::new(), 30), None)
        .await
        .unwrap();
    let window = TimeWindow::new(
        NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
    )
    .unwrap();
    service
        .join_waitlist(
            salon_id,
            JoinRequest {
                user_id: UserId::new(),
                service_id: ServiceId::new(),
                staff_id: None,
                requested_date: test_clock().now().date_naive() + TimeDelta::days(2),
                window,
                flexibility_days: 0,
            },
        )
        .await
        .unwrap();

    match service.snapshot(Topic::Salon(salon_id)).await {
        Snapshot::Salon {
            queues,
            overall_status,
            waitlist_open_entries,
            ..
        } => {
            assert_eq!(queues.len(), 1);
            assert_eq!(overall_status, OverallStatus::OnTime);
            assert_eq!(waitlist_open_entries, 1);
        },
        Snapshot::User { .. } => panic!("salon topic produced a user snapshot"),
    }
}

#[tokio::test]
async fn disconnect_drops_every_subscription() {
    let (service, salon_id, _) = setup();
    let topic = Topic::Salon(salon_id);
    let (id, _rx) = service.connect(Principal::Staff { salon_id });
    service.subscribe(id, topic).await.unwrap();
    assert_eq!(service.hub().connection_count(), 1);

    service.disconnect(id);

    assert_eq!(service.hub().connection_count(), 0);
    assert_eq!(service.hub().subscriber_count(&topic), 0);
}

#[tokio::test]
async fn websocket_messages_drive_subscriptions() {
    let (service, salon_id, _) = setup();
    let (id, mut rx) = service.connect(Principal::Staff { salon_id });
    let topic = Topic::Salon(salon_id);

    let reply = handle_client_message(
        &service,
        id,
        &format!(r#"{{"type":"subscribe","topic":"{topic}"}}"#),
    )
    .await;
    assert!(matches!(reply, ServerMessage::Subscribed { topic: t } if t == topic));
    assert!(matches!(rx.try_recv(), Ok(Delivery::Snapshot { .. })));

    let reply = handle_client_message(&service, id, r#"{"type":"ping"}"#).await;
    assert!(matches!(reply, ServerMessage::Pong));

    let reply = handle_client_message(
        &service,
        id,
        r#"{"type":"subscribe","topic":"salon:not-a-uuid"}"#,
    )
    .await;
    assert!(matches!(reply, ServerMessage::Error { ref code, .. } if code == "MALFORMED_TOPIC"));

    let reply = handle_client_message(
        &service,
        id,
        &format!(r#"{{"type":"subscribe","topic":"user:{}"}}"#, UserId::new()),
    )
    .await;
    assert!(matches!(reply, ServerMessage::Error { ref code, .. } if code == "FORBIDDEN"));

    let reply = handle_client_message(&service, id, "not json").await;
    assert!(matches!(reply, ServerMessage::Error { ref code, .. } if code == "BAD_MESSAGE"));

    let reply = handle_client_message(
        &service,
        id,
        &format!(r#"{{"type":"unsubscribe","topic":"{topic}"}}"#),
    )
    .await;
    assert!(matches!(reply, ServerMessage::Unsubscribed { .. }));
    assert_eq!(service.hub().subscriber_count(&topic), 0);
}
