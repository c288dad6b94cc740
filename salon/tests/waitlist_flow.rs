//! Waitlist flows through the queue service: join, offer, decline, lapse and
//! the cascade to the next customer.

#![allow(clippy::unwrap_used)] // Test code

use chrono::{NaiveDate, NaiveTime, TimeDelta};
use salon_queue::aggregates::{EntryStatus, JoinRequest, OfferOutcome, WaitlistRejection};
use salon_queue::app::{Collaborators, LaneSettings, QueueService, ReleasedSlot};
use salon_queue::distribution::{Delivery, Hub, OutboundEvent, Topic};
use salon_queue::error::QueueError;
use salon_queue::providers::{FixedTravelBuffers, InMemorySlotAvailability, InMemoryStaffDirectory};
use salon_queue::types::{Principal, SalonId, ServiceId, StaffId, StaffProfile, TimeWindow, UserId};
use salon_queue_core::environment::Clock;
use salon_queue_testing::{ManualClock, test_clock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;

struct Salon {
    clock: ManualClock,
    slots: Arc<InMemorySlotAvailability>,
    service: QueueService,
    salon_id: SalonId,
    staff_id: StaffId,
    service_id: ServiceId,
}

impl Salon {
    fn open() -> Self {
        let clock = ManualClock::new(test_clock().now());
        let salon_id = SalonId::new();
        let staff_id = StaffId::new();
        let directory = InMemoryStaffDirectory::with_staff([StaffProfile {
            staff_id,
            salon_id,
            name: "Ana".to_string(),
        }]);
        let slots = Arc::new(InMemorySlotAvailability::new());

        let service = QueueService::new(
            Collaborators {
                clock: Arc::new(clock.clone()),
                directory: Arc::new(directory),
                slots: slots.clone(),
                travel: Arc::new(FixedTravelBuffers::new(TimeDelta::minutes(20))),
            },
            Arc::new(Hub::new()),
            LaneSettings::default(),
        );

        Self {
            clock,
            slots,
            service,
            salon_id,
            staff_id,
            service_id: ServiceId::new(),
        }
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    fn request(&self, user_id: UserId, days_ahead: i64, flexibility_days: i64) -> JoinRequest {
        JoinRequest {
            user_id,
            service_id: self.service_id,
            staff_id: None,
            requested_date: self.today() + TimeDelta::days(days_ahead),
            window: window(9, 18),
            flexibility_days,
        }
    }

    fn slot(&self, date: NaiveDate) -> ReleasedSlot {
        ReleasedSlot {
            service_id: self.service_id,
            staff_id: Some(self.staff_id),
            date,
            window: window(14, 15),
        }
    }

    async fn watch(&self, topic: Topic) -> Receiver<Delivery> {
        let principal = match topic {
            Topic::Salon(salon_id) => Principal::Staff { salon_id },
            Topic::User(user_id) => Principal::Customer { user_id },
        };
        let (id, mut rx) = self.service.connect(principal);
        self.service.subscribe(id, topic).await.unwrap();
        // Snapshot
        rx.try_recv().unwrap();
        rx
    }
}

fn window(start: u32, end: u32) -> TimeWindow {
    TimeWindow::new(
        NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
    )
    .unwrap()
}

fn customer(user_id: UserId) -> Principal {
    Principal::Customer { user_id }
}

fn events(rx: &mut Receiver<Delivery>) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    while let Ok(delivery) = rx.try_recv() {
        if let Delivery::Event { event, .. } = delivery {
            events.push(event);
        }
    }
    events
}

#[tokio::test]
async fn declined_offer_returns_the_entry_to_the_queue() {
    let salon = Salon::open();
    let user_id = UserId::new();
    let mut user_rx = salon.watch(Topic::User(user_id)).await;
    let mut salon_rx = salon.watch(Topic::Salon(salon.salon_id)).await;

    let entry = salon
        .service
        .join_waitlist(salon.salon_id, salon.request(user_id, 7, 2))
        .await
        .unwrap();
    assert_eq!(entry.status, EntryStatus::Active);
    assert_eq!(entry.position, Some(1));

    // A day before the preferred date, inside the flexibility
    salon
        .service
        .slot_released(salon.salon_id, salon.slot(entry.requested_date - TimeDelta::days(1)))
        .await
        .unwrap();

    let offered = salon
        .service
        .waitlist_entry(entry.entry_id, &customer(user_id))
        .await
        .unwrap();
    assert_eq!(offered.status, EntryStatus::Notified);
    assert_eq!(
        offered.accept_deadline,
        Some(salon.clock.now() + TimeDelta::minutes(15))
    );
    assert!(events(&mut user_rx).iter().any(|event| matches!(
        event,
        OutboundEvent::WaitlistOffer { entry_id, .. } if *entry_id == entry.entry_id
    )));

    let declined = salon
        .service
        .respond_to_offer(entry.entry_id, &customer(user_id), false)
        .await
        .unwrap();
    assert_eq!(declined.status, EntryStatus::Active);
    assert_eq!(declined.position, Some(1));
    assert_eq!(declined.passed_offers, 1);
    assert_eq!(declined.last_offer_outcome, Some(OfferOutcome::Declined));

    assert!(events(&mut user_rx).iter().any(|event| matches!(
        event,
        OutboundEvent::WaitlistOfferExpired {
            outcome: OfferOutcome::Declined,
            returned_to_queue: true,
            ..
        }
    )));
    // Nobody else wanted it
    assert!(events(&mut salon_rx)
        .iter()
        .any(|event| matches!(event, OutboundEvent::SlotUnclaimed { .. })));
}

#[tokio::test]
async fn only_the_first_in_line_is_offered() {
    let salon = Salon::open();
    let (first, second) = (UserId::new(), UserId::new());

    let first_entry = salon
        .service
        .join_waitlist(salon.salon_id, salon.request(first, 3, 0))
        .await
        .unwrap();
    let second_entry = salon
        .service
        .join_waitlist(salon.salon_id, salon.request(second, 3, 0))
        .await
        .unwrap();
    assert_eq!(second_entry.position, Some(2));

    salon
        .service
        .slot_released(salon.salon_id, salon.slot(first_entry.requested_date))
        .await
        .unwrap();

    let first_now = salon
        .service
        .waitlist_entry(first_entry.entry_id, &customer(first))
        .await
        .unwrap();
    let second_now = salon
        .service
        .waitlist_entry(second_entry.entry_id, &customer(second))
        .await
        .unwrap();
    assert_eq!(first_now.status, EntryStatus::Notified);
    assert_eq!(second_now.status, EntryStatus::Active);
    assert_eq!(second_now.position, Some(2));

    // Declining hands the slot to the next customer
    salon
        .service
        .respond_to_offer(first_entry.entry_id, &customer(first), false)
        .await
        .unwrap();
    let second_now = salon
        .service
        .waitlist_entry(second_entry.entry_id, &customer(second))
        .await
        .unwrap();
    assert_eq!(second_now.status, EntryStatus::Notified);
}

#[tokio::test(start_paused = true)]
async fn unanswered_offer_lapses_and_cascades() {
    let salon = Salon::open();
    let (first, second) = (UserId::new(), UserId::new());
    let first_entry = salon
        .service
        .join_waitlist(salon.salon_id, salon.request(first, 3, 0))
        .await
        .unwrap();
    let second_entry = salon
        .service
        .join_waitlist(salon.salon_id, salon.request(second, 3, 0))
        .await
        .unwrap();
    let mut second_rx = salon.watch(Topic::User(second)).await;

    salon
        .service
        .slot_released(salon.salon_id, salon.slot(first_entry.requested_date))
        .await
        .unwrap();

    // Time auto-advances to the offer deadline while we wait
    let offer = tokio::time::timeout(Duration::from_secs(16 * 60), async {
        loop {
            match second_rx.recv().await {
                Some(Delivery::Event {
                    event: OutboundEvent::WaitlistOffer { entry_id, .. },
                    ..
                }) => return entry_id,
                Some(_) => {},
                None => return first_entry.entry_id,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(offer, second_entry.entry_id);

    let lapsed = salon
        .service
        .waitlist_entry(first_entry.entry_id, &customer(first))
        .await
        .unwrap();
    assert_eq!(lapsed.status, EntryStatus::Active);
    assert_eq!(lapsed.last_offer_outcome, Some(OfferOutcome::Lapsed));
    assert_eq!(lapsed.passed_offers, 1);

    // The deadline already moved the slot on
    let late = salon
        .service
        .respond_to_offer(first_entry.entry_id, &customer(first), true)
        .await;
    assert!(matches!(
        late,
        Err(QueueError::Rejected(WaitlistRejection::OfferExpired))
    ));
    let holder = salon
        .service
        .waitlist_entry(second_entry.entry_id, &customer(second))
        .await
        .unwrap();
    assert_eq!(holder.status, EntryStatus::Notified);
}

#[tokio::test]
async fn slot_released_twice_waits_for_the_outstanding_offer() {
    let salon = Salon::open();
    let (near, far) = (UserId::new(), UserId::new());
    let near_entry = salon
        .service
        .join_waitlist(salon.salon_id, salon.request(near, 3, 0))
        .await
        .unwrap();
    // Different queue key, same slot within its flexibility
    let far_entry = salon
        .service
        .join_waitlist(salon.salon_id, salon.request(far, 4, 1))
        .await
        .unwrap();

    let slot = salon.slot(near_entry.requested_date);
    salon
        .service
        .slot_released(salon.salon_id, slot)
        .await
        .unwrap();
    salon
        .service
        .slot_released(salon.salon_id, slot)
        .await
        .unwrap();

    let status = |entry_id, user_id| {
        let service = &salon.service;
        async move {
            service
                .waitlist_entry(entry_id, &customer(user_id))
                .await
                .unwrap()
                .status
        }
    };
    assert_eq!(status(near_entry.entry_id, near).await, EntryStatus::Notified);
    assert_eq!(status(far_entry.entry_id, far).await, EntryStatus::Active);

    salon
        .service
        .respond_to_offer(near_entry.entry_id, &customer(near), true)
        .await
        .unwrap();

    assert_eq!(status(near_entry.entry_id, near).await, EntryStatus::Accepted);
    assert_eq!(status(far_entry.entry_id, far).await, EntryStatus::Notified);
}

#[tokio::test]
async fn answering_after_the_deadline_is_offer_expired() {
    let salon = Salon::open();
    let user_id = UserId::new();
    let entry = salon
        .service
        .join_waitlist(salon.salon_id, salon.request(user_id, 3, 0))
        .await
        .unwrap();
    salon
        .service
        .slot_released(salon.salon_id, salon.slot(entry.requested_date))
        .await
        .unwrap();

    salon.clock.advance(TimeDelta::minutes(16));

    let result = salon
        .service
        .respond_to_offer(entry.entry_id, &customer(user_id), true)
        .await;
    assert!(matches!(
        result,
        Err(QueueError::Rejected(WaitlistRejection::OfferExpired))
    ));
}

#[tokio::test]
async fn accepted_offer_is_announced_to_the_salon() {
    let salon = Salon::open();
    let user_id = UserId::new();
    let mut salon_rx = salon.watch(Topic::Salon(salon.salon_id)).await;
    let entry = salon
        .service
        .join_waitlist(salon.salon_id, salon.request(user_id, 3, 0))
        .await
        .unwrap();
    salon
        .service
        .slot_released(salon.salon_id, salon.slot(entry.requested_date))
        .await
        .unwrap();

    let accepted = salon
        .service
        .respond_to_offer(entry.entry_id, &customer(user_id), true)
        .await
        .unwrap();
    assert_eq!(accepted.status, EntryStatus::Accepted);
    assert!(events(&mut salon_rx).iter().any(|event| matches!(
        event,
        OutboundEvent::WaitlistOfferAccepted { user_id: who, .. } if *who == user_id
    )));

    let again = salon
        .service
        .respond_to_offer(entry.entry_id, &customer(user_id), true)
        .await;
    assert!(matches!(
        again,
        Err(QueueError::Rejected(WaitlistRejection::NoPendingOffer))
    ));
}

#[tokio::test]
async fn join_is_refused_while_slots_are_bookable() {
    let salon = Salon::open();
    let request = salon.request(UserId::new(), 3, 0);
    salon.slots.open(
        salon.salon_id,
        salon.service_id,
        salon.staff_id,
        request.requested_date,
        window(10, 11),
    );

    let result = salon.service.join_waitlist(salon.salon_id, request).await;
    assert!(matches!(
        result,
        Err(QueueError::Rejected(WaitlistRejection::SlotsAvailable))
    ));
}

#[tokio::test]
async fn duplicate_and_unknown_salon_joins_are_refused() {
    let salon = Salon::open();
    let request = salon.request(UserId::new(), 3, 0);

    salon
        .service
        .join_waitlist(salon.salon_id, request)
        .await
        .unwrap();
    let duplicate = salon.service.join_waitlist(salon.salon_id, request).await;
    assert!(matches!(
        duplicate,
        Err(QueueError::Rejected(WaitlistRejection::DuplicateEntry))
    ));

    let elsewhere = salon.service.join_waitlist(SalonId::new(), request).await;
    assert!(matches!(elsewhere, Err(QueueError::UnknownSalon(_))));
}

#[tokio::test]
async fn only_the_owner_or_salon_staff_can_withdraw() {
    let salon = Salon::open();
    let owner = UserId::new();
    let entry = salon
        .service
        .join_waitlist(salon.salon_id, salon.request(owner, 3, 0))
        .await
        .unwrap();

    let stranger = salon
        .service
        .withdraw(entry.entry_id, &customer(UserId::new()))
        .await;
    assert!(matches!(
        stranger,
        Err(QueueError::Rejected(WaitlistRejection::EntryNotFound))
    ));

    let other_salon = salon
        .service
        .withdraw(
            entry.entry_id,
            &Principal::Staff {
                salon_id: SalonId::new(),
            },
        )
        .await;
    assert!(matches!(
        other_salon,
        Err(QueueError::Rejected(WaitlistRejection::EntryNotFound))
    ));

    let withdrawn = salon
        .service
        .withdraw(
            entry.entry_id,
            &Principal::Staff {
                salon_id: salon.salon_id,
            },
        )
        .await
        .unwrap();
    assert_eq!(withdrawn.status, EntryStatus::Cancelled);
}
